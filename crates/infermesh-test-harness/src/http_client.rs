//! Raw-socket HTTP test client.
//!
//! Scenarios need precise control over connection reuse, wire order,
//! and timing, so this client works directly on a `TcpStream` and
//! parses responses with the proxy's own response machinery.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use proxy_core::http::decode_chunked;
use proxy_core::http::response::{BodyFramer, Framing, ResponseHead};

pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

#[derive(Debug)]
pub struct TestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// A GET request with optional extra headers.
pub fn get_request(path: &str, headers: &[(&str, &str)]) -> String {
    let mut out = format!("GET {} HTTP/1.1\r\nHost: proxy\r\n", path);
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("\r\n");
    out
}

/// A POST with a body and Content-Length framing.
pub fn post_request(path: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut out = format!("POST {} HTTP/1.1\r\nHost: proxy\r\n", path);
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    out
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to proxy");
        stream.set_nodelay(true).ok();
        Self {
            stream,
            buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    pub async fn send(&mut self, raw: &str) {
        self.stream
            .write_all(raw.as_bytes())
            .await
            .expect("send request");
    }

    /// One-shot convenience: send, read one response.
    pub async fn request(&mut self, raw: &str) -> TestResponse {
        self.send(raw).await;
        self.read_response().await
    }

    /// Read one complete response, decoding chunked bodies.
    pub async fn read_response(&mut self) -> TestResponse {
        // Head.
        let (head, head_len) = loop {
            if let Some(parsed) = ResponseHead::parse(&self.buf).expect("parse response head") {
                break parsed;
            }
            let n = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .expect("read response");
            assert!(n > 0, "connection closed before response head");
        };
        let _ = self.buf.split_to(head_len);

        // Body.
        let mut framer = BodyFramer::for_message(&head, "GET");
        let mut body_raw: Vec<u8> = Vec::new();
        loop {
            if !self.buf.is_empty() {
                let progress = framer.feed(&self.buf).expect("frame body");
                body_raw.extend_from_slice(&self.buf[..progress.consumed]);
                let _ = self.buf.split_to(progress.consumed);
                if progress.done {
                    break;
                }
            }
            let n = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .expect("read body");
            if n == 0 {
                assert!(framer.on_eof(), "connection closed mid-body");
                break;
            }
        }

        let body = match head.framing() {
            Framing::Chunked => decode_chunked(&body_raw).expect("decode chunked body"),
            _ => body_raw,
        };
        TestResponse {
            status: head.status,
            headers: head.headers,
            body,
        }
    }

    /// Read whatever arrives within `window`, without framing.
    pub async fn read_available(&mut self, window: Duration) -> Vec<u8> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let mut chunk = [0u8; 4096];
            match tokio::time::timeout_at(deadline, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => out.extend_from_slice(&chunk[..n]),
                Ok(Err(_)) => break,
                Err(_) => break,
            }
        }
        out
    }

    /// Read everything until the server closes.
    pub async fn read_until_close(&mut self) -> Vec<u8> {
        let mut out = self.buf.split().to_vec();
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
            }
        }
        out
    }
}
