//! Incremental HTTP/1.x request parser.
//!
//! Attached to a client connection's input buffer and driven by
//! repeated `parse` calls as bytes arrive. Yields one request at a
//! time; bytes beyond the current request stay in the buffer so
//! pipelined requests are picked up on the next call.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ProxyError;

use super::{header_get, header_has_token, query_get, ChunkScanner};

const MAX_HEADERS: usize = 100;

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    /// Raw query string without the leading `?`; empty when absent.
    pub query: String,
    pub version_minor: u8,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    /// Header first, query parameter second.
    pub fn header_or_query(&self, header: &str, query_key: &str) -> Option<String> {
        self.header(header)
            .map(str::to_string)
            .or_else(|| query_get(&self.query, query_key))
    }

    /// HTTP/1.1 defaults to keep-alive unless `Connection: close`;
    /// HTTP/1.0 requires an explicit `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        let conn = self.header("connection").unwrap_or("");
        if self.version_minor == 0 {
            header_has_token(conn, "keep-alive")
        } else {
            !header_has_token(conn, "close")
        }
    }

    /// Path plus query, as sent on the wire.
    pub fn target(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}

#[derive(Debug)]
struct Head {
    method: String,
    path: String,
    query: String,
    version_minor: u8,
    headers: Vec<(String, String)>,
}

#[derive(Debug)]
enum ReqState {
    Head,
    FixedBody {
        head: Head,
        remaining: usize,
        body: BytesMut,
    },
    ChunkedBody {
        head: Head,
        scanner: ChunkScanner,
        body: BytesMut,
    },
}

pub struct RequestParser {
    max_header_bytes: usize,
    max_body_bytes: usize,
    state: ReqState,
}

fn finish(head: Head, body: Bytes) -> ParsedRequest {
    ParsedRequest {
        method: head.method,
        path: head.path,
        query: head.query,
        version_minor: head.version_minor,
        headers: head.headers,
        body,
    }
}

impl RequestParser {
    pub fn new(max_header_bytes: usize, max_body_bytes: usize) -> Self {
        Self {
            max_header_bytes,
            max_body_bytes,
            state: ReqState::Head,
        }
    }

    /// Feed the connection's input buffer. `Ok(Some(_))` yields a
    /// complete request and consumes its bytes; `Ok(None)` means more
    /// input is needed.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<ParsedRequest>, ProxyError> {
        loop {
            let state = std::mem::replace(&mut self.state, ReqState::Head);
            match state {
                ReqState::Head => {
                    let mut header_slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
                    let mut req = httparse::Request::new(&mut header_slots);
                    let head_len = match req.parse(buf) {
                        Ok(httparse::Status::Complete(n)) => n,
                        Ok(httparse::Status::Partial) => {
                            if buf.len() > self.max_header_bytes {
                                return Err(ProxyError::Protocol(
                                    "request head too large".into(),
                                ));
                            }
                            return Ok(None);
                        }
                        Err(e) => {
                            return Err(ProxyError::Protocol(format!(
                                "malformed request: {}",
                                e
                            )));
                        }
                    };

                    let method = req.method.unwrap_or("").to_string();
                    let target = req.path.unwrap_or("/");
                    let (path, query) = match target.split_once('?') {
                        Some((p, q)) => (p.to_string(), q.to_string()),
                        None => (target.to_string(), String::new()),
                    };
                    let version_minor = req.version.unwrap_or(1) as u8;
                    let headers: Vec<(String, String)> = req
                        .headers
                        .iter()
                        .map(|h| {
                            (
                                h.name.to_string(),
                                String::from_utf8_lossy(h.value).to_string(),
                            )
                        })
                        .collect();
                    if method.is_empty() {
                        return Err(ProxyError::Protocol("missing method".into()));
                    }

                    buf.advance(head_len);

                    let head = Head {
                        method,
                        path,
                        query,
                        version_minor,
                        headers,
                    };

                    // Framing precedence: chunked beats Content-Length.
                    let chunked = header_get(&head.headers, "transfer-encoding")
                        .map(|v| header_has_token(v, "chunked"))
                        .unwrap_or(false);
                    if chunked {
                        self.state = ReqState::ChunkedBody {
                            head,
                            scanner: ChunkScanner::new(),
                            body: BytesMut::new(),
                        };
                        continue;
                    }

                    let content_length = match header_get(&head.headers, "content-length") {
                        Some(v) => v.trim().parse::<usize>().map_err(|_| {
                            ProxyError::Protocol("invalid content-length".into())
                        })?,
                        None => 0,
                    };
                    if content_length > self.max_body_bytes {
                        return Err(ProxyError::BodyTooLarge {
                            limit: self.max_body_bytes,
                        });
                    }
                    if content_length == 0 {
                        return Ok(Some(finish(head, Bytes::new())));
                    }
                    self.state = ReqState::FixedBody {
                        head,
                        remaining: content_length,
                        body: BytesMut::with_capacity(content_length.min(64 * 1024)),
                    };
                }
                ReqState::FixedBody {
                    head,
                    mut remaining,
                    mut body,
                } => {
                    let take = remaining.min(buf.len());
                    body.extend_from_slice(&buf[..take]);
                    buf.advance(take);
                    remaining -= take;
                    if remaining == 0 {
                        return Ok(Some(finish(head, body.freeze())));
                    }
                    self.state = ReqState::FixedBody {
                        head,
                        remaining,
                        body,
                    };
                    return Ok(None);
                }
                ReqState::ChunkedBody {
                    head,
                    mut scanner,
                    mut body,
                } => {
                    let input = buf.split_to(buf.len());
                    let mut overflow = false;
                    let max = self.max_body_bytes;
                    let result = {
                        let body = &mut body;
                        scanner.feed(&input, &mut |part: &[u8]| {
                            if body.len() + part.len() > max {
                                overflow = true;
                            } else {
                                body.extend_from_slice(part);
                            }
                        })
                    };
                    let (consumed, done) = result
                        .map_err(|e| ProxyError::Protocol(format!("bad chunked body: {}", e)))?;
                    if overflow {
                        return Err(ProxyError::BodyTooLarge { limit: max });
                    }
                    // Put any unconsumed bytes (next pipelined request)
                    // back at the front of the buffer.
                    if consumed < input.len() {
                        let mut rest = BytesMut::with_capacity(input.len() - consumed + buf.len());
                        rest.extend_from_slice(&input[consumed..]);
                        rest.extend_from_slice(buf);
                        *buf = rest;
                    }
                    if done {
                        return Ok(Some(finish(head, body.freeze())));
                    }
                    self.state = ReqState::ChunkedBody {
                        head,
                        scanner,
                        body,
                    };
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> RequestParser {
        RequestParser::new(16 * 1024, 1024 * 1024)
    }

    fn buf(data: &[u8]) -> BytesMut {
        BytesMut::from(data)
    }

    #[test]
    fn parses_simple_get() {
        let mut p = parser();
        let mut b = buf(b"GET /infer?x=1 HTTP/1.1\r\nHost: h\r\n\r\n");
        let req = p.parse(&mut b).unwrap().unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/infer");
        assert_eq!(req.query, "x=1");
        assert_eq!(req.target(), "/infer?x=1");
        assert_eq!(req.header("host"), Some("h"));
        assert!(req.keep_alive());
        assert!(b.is_empty());
    }

    #[test]
    fn partial_head_needs_more() {
        let mut p = parser();
        let mut b = buf(b"GET / HTTP/1.1\r\nHos");
        assert!(p.parse(&mut b).unwrap().is_none());
        b.extend_from_slice(b"t: h\r\n\r\n");
        assert!(p.parse(&mut b).unwrap().is_some());
    }

    #[test]
    fn content_length_body_across_feeds() {
        let mut p = parser();
        let mut b = buf(b"POST /x HTTP/1.1\r\nContent-Length: 10\r\n\r\n12345");
        assert!(p.parse(&mut b).unwrap().is_none());
        b.extend_from_slice(b"67890");
        let req = p.parse(&mut b).unwrap().unwrap();
        assert_eq!(&req.body[..], b"1234567890");
    }

    #[test]
    fn chunked_body_decodes() {
        let mut p = parser();
        let mut b = buf(
            b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        );
        let req = p.parse(&mut b).unwrap().unwrap();
        assert_eq!(&req.body[..], b"hello");
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let mut p = parser();
        let mut b = buf(
            b"POST /x HTTP/1.1\r\nContent-Length: 999\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\n\r\n",
        );
        let req = p.parse(&mut b).unwrap().unwrap();
        assert_eq!(&req.body[..], b"ok");
    }

    #[test]
    fn pipelined_requests_yield_in_order() {
        let mut p = parser();
        let mut b = buf(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        let first = p.parse(&mut b).unwrap().unwrap();
        assert_eq!(first.path, "/a");
        let second = p.parse(&mut b).unwrap().unwrap();
        assert_eq!(second.path, "/b");
        assert!(p.parse(&mut b).unwrap().is_none());
    }

    #[test]
    fn pipelined_after_chunked_body() {
        let mut p = parser();
        let mut b = buf(
            b"POST /a HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\nGET /b HTTP/1.1\r\n\r\n",
        );
        let first = p.parse(&mut b).unwrap().unwrap();
        assert_eq!(&first.body[..], b"hi");
        let second = p.parse(&mut b).unwrap().unwrap();
        assert_eq!(second.path, "/b");
    }

    #[test]
    fn http10_keep_alive_is_opt_in() {
        let mut p = parser();
        let mut b = buf(b"GET / HTTP/1.0\r\n\r\n");
        let req = p.parse(&mut b).unwrap().unwrap();
        assert!(!req.keep_alive());

        let mut b = buf(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        let req = p.parse(&mut b).unwrap().unwrap();
        assert!(req.keep_alive());
    }

    #[test]
    fn http11_close_is_opt_out() {
        let mut p = parser();
        let mut b = buf(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        let req = p.parse(&mut b).unwrap().unwrap();
        assert!(!req.keep_alive());
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut p = RequestParser::new(64, 1024);
        let long_header = format!("GET / HTTP/1.1\r\nX-Pad: {}\r\n\r\n", "a".repeat(256));
        let mut b = buf(long_header.as_bytes());
        assert!(matches!(
            p.parse(&mut b),
            Err(ProxyError::Protocol(_))
        ));
    }

    #[test]
    fn oversized_body_is_rejected() {
        let mut p = RequestParser::new(16 * 1024, 8);
        let mut b = buf(b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\n");
        assert!(matches!(
            p.parse(&mut b),
            Err(ProxyError::BodyTooLarge { .. })
        ));
    }

    #[test]
    fn malformed_request_line_is_rejected() {
        let mut p = parser();
        let mut b = buf(b"\x00\x01\x02 bad\r\n\r\n");
        assert!(p.parse(&mut b).is_err());
    }

    #[test]
    fn header_or_query_prefers_header() {
        let mut p = parser();
        let mut b = buf(b"GET /x?priority=2 HTTP/1.1\r\nX-Priority: 9\r\n\r\n");
        let req = p.parse(&mut b).unwrap().unwrap();
        assert_eq!(
            req.header_or_query("X-Priority", "priority").as_deref(),
            Some("9")
        );
        let mut b = buf(b"GET /x?priority=2 HTTP/1.1\r\n\r\n");
        let req = p.parse(&mut b).unwrap().unwrap();
        assert_eq!(
            req.header_or_query("X-Priority", "priority").as_deref(),
            Some("2")
        );
    }
}
