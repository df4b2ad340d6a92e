//! Incremental HTTP/1.x response head parsing and body framing.
//!
//! Framing precedence: a `Transfer-Encoding` containing `chunked`
//! wins, then `Content-Length`, then read-until-close (which also
//! makes the backend connection non-reusable).

use crate::error::ProxyError;

use super::{header_get, header_has_token, ChunkScanner};

const MAX_HEADERS: usize = 100;

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub version_minor: u8,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Chunked,
    Length(usize),
    UntilClose,
}

impl ResponseHead {
    /// Parse a response head from the start of `buf`. Returns the head
    /// and its byte length once the blank line has arrived.
    pub fn parse(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, ProxyError> {
        let mut header_slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut header_slots);
        let head_len = match resp.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => {
                return Err(ProxyError::BadGateway(format!(
                    "malformed response head: {}",
                    e
                )))
            }
        };
        let head = ResponseHead {
            status: resp.code.unwrap_or(0),
            reason: resp.reason.unwrap_or("").to_string(),
            version_minor: resp.version.unwrap_or(1) as u8,
            headers: resp
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).to_string(),
                    )
                })
                .collect(),
        };
        if head.status == 0 {
            return Err(ProxyError::BadGateway("missing status code".into()));
        }
        Ok(Some((head, head_len)))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    pub fn framing(&self) -> Framing {
        if let Some(te) = self.header("transfer-encoding") {
            if header_has_token(te, "chunked") {
                return Framing::Chunked;
            }
        }
        match self.header("content-length") {
            // An unparsable length is treated as zero, matching the
            // lenient handling on the request side of the fleet.
            Some(v) => Framing::Length(v.trim().parse::<usize>().unwrap_or(0)),
            None => Framing::UntilClose,
        }
    }

    /// Keep-alive for the backend connection; read-until-close framing
    /// always forces `false`.
    pub fn keep_alive(&self) -> bool {
        if self.framing() == Framing::UntilClose {
            return false;
        }
        let conn = self.header("connection").unwrap_or("");
        if self.version_minor == 0 {
            header_has_token(conn, "keep-alive")
        } else {
            !header_has_token(conn, "close")
        }
    }
}

/// Serialize a response head.
pub fn write_head(status: u16, reason: &str, headers: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + headers.len() * 32);
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status, reason).as_bytes());
    for (name, value) in headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

#[derive(Debug, Clone, Copy)]
pub struct FrameProgress {
    pub consumed: usize,
    pub done: bool,
}

/// Tracks where a response body ends without retaining it.
#[derive(Debug)]
pub enum BodyFramer {
    Chunked(ChunkScanner),
    Fixed { remaining: usize },
    UntilClose { done: bool },
}

impl BodyFramer {
    /// Framer for a response to `request_method`. HEAD responses and
    /// status codes that forbid a body frame as zero-length regardless
    /// of headers.
    pub fn for_message(head: &ResponseHead, request_method: &str) -> Self {
        let bodyless = request_method.eq_ignore_ascii_case("HEAD")
            || head.status == 204
            || head.status == 304
            || (100..200).contains(&head.status);
        if bodyless {
            return BodyFramer::Fixed { remaining: 0 };
        }
        match head.framing() {
            Framing::Chunked => BodyFramer::Chunked(ChunkScanner::new()),
            Framing::Length(n) => BodyFramer::Fixed { remaining: n },
            Framing::UntilClose => BodyFramer::UntilClose { done: false },
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<FrameProgress, ProxyError> {
        match self {
            BodyFramer::Chunked(scanner) => {
                let (consumed, done) = scanner
                    .feed(data, &mut |_| {})
                    .map_err(ProxyError::BadGateway)?;
                Ok(FrameProgress { consumed, done })
            }
            BodyFramer::Fixed { remaining } => {
                let take = (*remaining).min(data.len());
                *remaining -= take;
                Ok(FrameProgress {
                    consumed: take,
                    done: *remaining == 0,
                })
            }
            BodyFramer::UntilClose { .. } => Ok(FrameProgress {
                consumed: data.len(),
                done: false,
            }),
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            BodyFramer::Chunked(scanner) => scanner.is_done(),
            BodyFramer::Fixed { remaining } => *remaining == 0,
            BodyFramer::UntilClose { done } => *done,
        }
    }

    /// Signal read-side EOF. Returns whether the body is now complete.
    pub fn on_eof(&mut self) -> bool {
        match self {
            BodyFramer::UntilClose { done } => {
                *done = true;
                true
            }
            other => other.is_done(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_of(raw: &[u8]) -> ResponseHead {
        ResponseHead::parse(raw).unwrap().unwrap().0
    }

    #[test]
    fn parses_status_and_headers() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-A: b\r\n\r\nhello";
        let (head, len) = ResponseHead::parse(raw).unwrap().unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.header("x-a"), Some("b"));
        assert_eq!(&raw[len..], b"hello");
    }

    #[test]
    fn partial_head_returns_none() {
        assert!(ResponseHead::parse(b"HTTP/1.1 200 OK\r\nConte")
            .unwrap()
            .is_none());
    }

    #[test]
    fn garbage_head_is_bad_gateway() {
        assert!(matches!(
            ResponseHead::parse(b"\x01\x02garbage\r\n\r\n"),
            Err(ProxyError::BadGateway(_))
        ));
    }

    #[test]
    fn chunked_beats_content_length() {
        let head = head_of(
            b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert_eq!(head.framing(), Framing::Chunked);
    }

    #[test]
    fn length_framing() {
        let head = head_of(b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n");
        assert_eq!(head.framing(), Framing::Length(42));
    }

    #[test]
    fn no_framing_headers_means_until_close() {
        let head = head_of(b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(head.framing(), Framing::UntilClose);
        assert!(!head.keep_alive());
    }

    #[test]
    fn keep_alive_rules() {
        let head = head_of(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        assert!(head.keep_alive());

        let head = head_of(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        assert!(!head.keep_alive());

        let head = head_of(b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n");
        assert!(!head.keep_alive());

        let head = head_of(
            b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\nConnection: keep-alive\r\n\r\n",
        );
        assert!(head.keep_alive());
    }

    #[test]
    fn fixed_framer_completes() {
        let head = head_of(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n");
        let mut framer = BodyFramer::for_message(&head, "GET");
        let p = framer.feed(b"hel").unwrap();
        assert!(!p.done);
        let p = framer.feed(b"lo--extra").unwrap();
        assert!(p.done);
        assert_eq!(p.consumed, 2);
    }

    #[test]
    fn chunked_framer_completes() {
        let head = head_of(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut framer = BodyFramer::for_message(&head, "GET");
        let p = framer.feed(b"5\r\nhello\r\n0\r\n\r\n").unwrap();
        assert!(p.done);
    }

    #[test]
    fn until_close_finishes_on_eof() {
        let head = head_of(b"HTTP/1.1 200 OK\r\n\r\n");
        let mut framer = BodyFramer::for_message(&head, "GET");
        let p = framer.feed(b"anything goes").unwrap();
        assert!(!p.done);
        assert!(framer.on_eof());
    }

    #[test]
    fn head_request_has_no_body() {
        let head = head_of(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n");
        let framer = BodyFramer::for_message(&head, "HEAD");
        assert!(framer.is_done());
    }

    #[test]
    fn write_head_round_trips() {
        let headers = vec![("Content-Length".to_string(), "2".to_string())];
        let bytes = write_head(200, "OK", &headers);
        let (head, len) = ResponseHead::parse(&bytes).unwrap().unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(len, bytes.len());
        assert_eq!(head.header("content-length"), Some("2"));
    }
}
