//! HTTP/1.x wire helpers shared by the request and response sides:
//! case-insensitive header access, query lookup, and the chunked
//! transfer codec.

pub mod request;
pub mod response;

pub use request::{ParsedRequest, RequestParser};
pub use response::{BodyFramer, FrameProgress, ResponseHead};

/// Case-insensitive header lookup over parsed header pairs.
pub fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Whether a header value contains the given token, matched
/// case-insensitively as a substring (`Transfer-Encoding: gzip,
/// chunked` contains `chunked`).
pub fn header_has_token(value: &str, token: &str) -> bool {
    value.to_ascii_lowercase().contains(&token.to_ascii_lowercase())
}

/// Look up a raw query parameter (`a=1&b=2`).
pub fn query_get(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

/// A body that plausibly holds JSON: first non-space byte is `{` or `[`.
pub fn looks_like_json(body: &[u8]) -> bool {
    body.iter()
        .find(|b| !b.is_ascii_whitespace())
        .map(|b| *b == b'{' || *b == b'[')
        .unwrap_or(false)
}

const MAX_CHUNK_SIZE_LINE: usize = 256;
const MAX_TRAILER_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data,
    DataCr,
    DataLf,
    Trailer,
    Done,
}

/// Incremental chunked-body scanner.
///
/// Tracks framing across arbitrarily split input and hands every data
/// byte to the caller's sink; a no-op sink turns it into a pure framer.
#[derive(Debug)]
pub struct ChunkScanner {
    state: ChunkState,
    line: Vec<u8>,
    remaining: usize,
    trailer_seen: usize,
}

impl ChunkScanner {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            line: Vec::new(),
            remaining: 0,
            trailer_seen: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Consume bytes, feeding chunk payload to `sink`. Returns the
    /// number of bytes consumed and whether the body is complete.
    pub fn feed(
        &mut self,
        data: &[u8],
        sink: &mut dyn FnMut(&[u8]),
    ) -> Result<(usize, bool), String> {
        let mut i = 0;
        while i < data.len() {
            match self.state {
                ChunkState::Size => {
                    let b = data[i];
                    i += 1;
                    if b == b'\n' {
                        let mut line = std::mem::take(&mut self.line);
                        if line.last() == Some(&b'\r') {
                            line.pop();
                        }
                        // Chunk extensions after ';' are ignored.
                        let size_part = line
                            .split(|&c| c == b';')
                            .next()
                            .unwrap_or(&[]);
                        let text = std::str::from_utf8(size_part)
                            .map_err(|_| "chunk size not ascii".to_string())?
                            .trim();
                        if text.is_empty() {
                            return Err("empty chunk size line".into());
                        }
                        let size = usize::from_str_radix(text, 16)
                            .map_err(|_| format!("bad chunk size {:?}", text))?;
                        if size == 0 {
                            self.state = ChunkState::Trailer;
                            self.line.clear();
                        } else {
                            self.remaining = size;
                            self.state = ChunkState::Data;
                        }
                    } else {
                        self.line.push(b);
                        if self.line.len() > MAX_CHUNK_SIZE_LINE {
                            return Err("chunk size line too long".into());
                        }
                    }
                }
                ChunkState::Data => {
                    let take = self.remaining.min(data.len() - i);
                    sink(&data[i..i + take]);
                    self.remaining -= take;
                    i += take;
                    if self.remaining == 0 {
                        self.state = ChunkState::DataCr;
                    }
                }
                ChunkState::DataCr => {
                    if data[i] != b'\r' {
                        return Err("missing CR after chunk data".into());
                    }
                    i += 1;
                    self.state = ChunkState::DataLf;
                }
                ChunkState::DataLf => {
                    if data[i] != b'\n' {
                        return Err("missing LF after chunk data".into());
                    }
                    i += 1;
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let b = data[i];
                    i += 1;
                    self.trailer_seen += 1;
                    if self.trailer_seen > MAX_TRAILER_BYTES {
                        return Err("trailer section too large".into());
                    }
                    if b == b'\n' {
                        let mut line = std::mem::take(&mut self.line);
                        if line.last() == Some(&b'\r') {
                            line.pop();
                        }
                        if line.is_empty() {
                            // Blank line ends the trailer section.
                            self.state = ChunkState::Done;
                            return Ok((i, true));
                        }
                    } else {
                        self.line.push(b);
                    }
                }
                ChunkState::Done => return Ok((i, true)),
            }
        }
        Ok((i, self.state == ChunkState::Done))
    }
}

impl Default for ChunkScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a complete chunked body held in memory.
pub fn decode_chunked(raw: &[u8]) -> Result<Vec<u8>, String> {
    let mut scanner = ChunkScanner::new();
    let mut out = Vec::new();
    let (_consumed, done) = scanner.feed(raw, &mut |part| out.extend_from_slice(part))?;
    if !done {
        return Err("chunked body incomplete".into());
    }
    Ok(out)
}

/// Encode a body as chunked transfer coding.
pub fn encode_chunked(body: &[u8], chunk_size: usize) -> Vec<u8> {
    let chunk_size = chunk_size.max(1);
    let mut out = Vec::with_capacity(body.len() + 32);
    for chunk in body.chunks(chunk_size) {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}
