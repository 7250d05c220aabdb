//! Incremental HTTP/1.x request parser.
//!
//! Bytes arrive in arbitrary pieces. `parse` consumes what it can from the
//! read buffer and keeps its position between calls, so a request split
//! across reads is completed by a later call once the rest arrives.

use std::mem;

use bytes::{Buf, BytesMut};

use super::request::{HttpMethod, HttpRequest, HttpRequestData, TransferEncoding};
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

pub const DEFAULT_MAX_HEADER_SIZE: usize = 8 * 1024;
pub const DEFAULT_MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

const MAX_CHUNK_LINE: usize = 1024;
// upfront reservation for a declared body, the rest grows with arrivals
const INIT_BODY_CAPACITY: usize = 4 * 1024;

#[derive(Debug, Default)]
enum ParseState {
    #[default]
    Head,
    Body {
        request: HttpRequestData,
        body: BytesMut,
        remaining: usize,
    },
    Chunked {
        request: HttpRequestData,
        body: BytesMut,
        chunk: ChunkState,
    },
}

#[derive(Debug, Clone, Copy)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
}

#[derive(Debug)]
pub struct RequestParser {
    max_header_size: usize,
    max_body_size: usize,
    state: ParseState,
}

impl Default for RequestParser {
    fn default() -> Self {
        RequestParser::new(DEFAULT_MAX_HEADER_SIZE, DEFAULT_MAX_BODY_SIZE)
    }
}

impl RequestParser {
    pub fn new(max_header_size: usize, max_body_size: usize) -> Self {
        RequestParser {
            max_header_size,
            max_body_size,
            state: ParseState::Head,
        }
    }

    /// True while a request has been started but not completed.
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, ParseState::Head)
    }

    /// Returns the next complete request, or `None` if more bytes are
    /// needed. Errors mean the stream can not be resynchronized.
    pub fn parse(&mut self, buffer: &mut BytesMut) -> AppResult<Option<HttpRequestData>> {
        loop {
            match mem::take(&mut self.state) {
                ParseState::Head => match self.parse_head(buffer) {
                    Ok(request) => {
                        if let Some(request) = self.start_body(request)? {
                            return Ok(Some(request));
                        }
                    }
                    Err(Incomplete) => return Ok(None),
                    Err(e) => return Err(e),
                },
                ParseState::Body {
                    mut request,
                    mut body,
                    remaining,
                } => {
                    let take = remaining.min(buffer.len());
                    body.extend_from_slice(&buffer.split_to(take));
                    if take == remaining {
                        request.body = body.freeze();
                        return Ok(Some(request));
                    }
                    self.state = ParseState::Body {
                        request,
                        body,
                        remaining: remaining - take,
                    };
                    return Ok(None);
                }
                ParseState::Chunked {
                    request,
                    body,
                    chunk,
                } => match self.parse_chunked(buffer, request, body, chunk)? {
                    Some(request) => return Ok(Some(request)),
                    None => return Ok(None),
                },
            }
        }
    }

    /// Consumes the header block once it is complete.
    fn parse_head(&self, buffer: &mut BytesMut) -> AppResult<HttpRequestData> {
        // blank lines ahead of a request line are tolerated
        while buffer.starts_with(b"\r\n") {
            buffer.advance(2);
        }
        let Some(end) = find(buffer, b"\r\n\r\n") else {
            if buffer.len() > self.max_header_size {
                return Err(AppError::HeaderTooLarge(format!(
                    "header block exceeds {} bytes",
                    self.max_header_size
                )));
            }
            return Err(Incomplete);
        };
        let head_len = end + 4;
        if head_len > self.max_header_size {
            return Err(AppError::HeaderTooLarge(format!(
                "header block of {head_len} bytes exceeds {}",
                self.max_header_size
            )));
        }
        let head = buffer.split_to(head_len);
        let text = std::str::from_utf8(&head[..end])
            .map_err(|_| AppError::MalformedProtocol("header block is not utf-8".to_string()))?;

        let mut lines = text.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let (Some(method), Some(uri), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AppError::MalformedProtocol(format!(
                "bad request line {request_line:?}"
            )));
        };
        if uri.is_empty() {
            return Err(AppError::MalformedProtocol("empty request uri".to_string()));
        }
        let method: HttpMethod = method.parse()?;
        let (version_major, version_minor) = parse_version(version)?;

        let mut headers = Vec::new();
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                return Err(AppError::MalformedProtocol(format!("bad header line {line:?}")));
            };
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(AppError::MalformedProtocol(format!("bad header name {name:?}")));
            }
            headers.push((name.to_string(), value.trim().to_string()));
        }

        let (rest, fragment) = uri.split_once('#').unwrap_or((uri, ""));
        let (raw_path, query_string) = rest.split_once('?').unwrap_or((rest, ""));
        let request = HttpRequestData {
            method,
            uri: uri.to_string(),
            path: HttpRequest::url_decode(raw_path),
            query_string: query_string.to_string(),
            fragment: fragment.to_string(),
            version_major,
            version_minor,
            keep_alive: keep_alive(version_minor, &headers),
            transfer_encoding: transfer_encoding(&headers)?,
            content_length: content_length(&headers)?,
            headers,
            body: Default::default(),
        };
        Ok(request)
    }

    /// Returns the request right away when it has no body.
    fn start_body(&mut self, mut request: HttpRequestData) -> AppResult<Option<HttpRequestData>> {
        if request.transfer_encoding == TransferEncoding::Chunked {
            request.content_length = 0;
            self.state = ParseState::Chunked {
                request,
                body: BytesMut::new(),
                chunk: ChunkState::Size,
            };
            return Ok(None);
        }
        if request.content_length > self.max_body_size as u64 {
            return Err(AppError::MessageTooLarge(format!(
                "body of {} bytes exceeds {}",
                request.content_length, self.max_body_size
            )));
        }
        if request.content_length == 0 {
            return Ok(Some(request));
        }
        let remaining = request.content_length as usize;
        self.state = ParseState::Body {
            request,
            body: BytesMut::with_capacity(remaining.min(INIT_BODY_CAPACITY)),
            remaining,
        };
        Ok(None)
    }

    fn parse_chunked(
        &mut self,
        buffer: &mut BytesMut,
        mut request: HttpRequestData,
        mut body: BytesMut,
        mut chunk: ChunkState,
    ) -> AppResult<Option<HttpRequestData>> {
        loop {
            match chunk {
                ChunkState::Size => {
                    let Some(end) = find(buffer, b"\r\n") else {
                        if buffer.len() > MAX_CHUNK_LINE {
                            return Err(AppError::MalformedProtocol(
                                "chunk size line too long".to_string(),
                            ));
                        }
                        break;
                    };
                    let line = buffer.split_to(end + 2);
                    let size = parse_chunk_size(&line[..end])?;
                    let total = body.len().checked_add(size);
                    if total.map_or(true, |total| total > self.max_body_size) {
                        return Err(AppError::MessageTooLarge(format!(
                            "chunked body exceeds {} bytes",
                            self.max_body_size
                        )));
                    }
                    chunk = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    let take = remaining.min(buffer.len());
                    body.extend_from_slice(&buffer.split_to(take));
                    if take < remaining {
                        chunk = ChunkState::Data(remaining - take);
                        break;
                    }
                    chunk = ChunkState::DataEnd;
                }
                ChunkState::DataEnd => {
                    if buffer.len() < 2 {
                        break;
                    }
                    if &buffer[..2] != b"\r\n" {
                        return Err(AppError::MalformedProtocol(
                            "chunk data not followed by CRLF".to_string(),
                        ));
                    }
                    buffer.advance(2);
                    chunk = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let Some(end) = find(buffer, b"\r\n") else {
                        if buffer.len() > self.max_header_size {
                            return Err(AppError::HeaderTooLarge(
                                "trailer section too large".to_string(),
                            ));
                        }
                        break;
                    };
                    // trailer fields are dropped
                    buffer.advance(end + 2);
                    if end == 0 {
                        request.content_length = body.len() as u64;
                        request.body = body.freeze();
                        return Ok(Some(request));
                    }
                }
            }
        }
        self.state = ParseState::Chunked {
            request,
            body,
            chunk,
        };
        Ok(None)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_version(version: &str) -> AppResult<(u8, u8)> {
    let Some(numbers) = version.strip_prefix("HTTP/") else {
        return Err(AppError::MalformedProtocol(format!("bad version {version:?}")));
    };
    let Some((major, minor)) = numbers.split_once('.') else {
        return Err(AppError::MalformedProtocol(format!("bad version {version:?}")));
    };
    let (Ok(major), Ok(minor)) = (major.parse::<u8>(), minor.parse::<u8>()) else {
        return Err(AppError::MalformedProtocol(format!("bad version {version:?}")));
    };
    if major != 1 {
        return Err(AppError::UnsupportedVersion(version.to_string()));
    }
    Ok((major, minor))
}

fn header_values<'a>(headers: &'a [(String, String)], key: &'a str) -> impl Iterator<Item = &'a str> {
    headers
        .iter()
        .filter(move |(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| value.as_str())
}

/// HTTP/1.1 keeps the connection unless told to close, HTTP/1.0 only when
/// asked for keep-alive.
fn keep_alive(version_minor: u8, headers: &[(String, String)]) -> bool {
    let mut tokens = header_values(headers, "connection")
        .flat_map(|value| value.split(','))
        .map(str::trim);
    if version_minor >= 1 {
        !tokens.any(|token| token.eq_ignore_ascii_case("close"))
    } else {
        tokens.any(|token| token.eq_ignore_ascii_case("keep-alive"))
    }
}

fn transfer_encoding(headers: &[(String, String)]) -> AppResult<TransferEncoding> {
    let codings: Vec<&str> = header_values(headers, "transfer-encoding")
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|coding| !coding.is_empty())
        .collect();
    match codings.as_slice() {
        [] => Ok(TransferEncoding::Identity),
        [coding] if coding.eq_ignore_ascii_case("identity") => Ok(TransferEncoding::Identity),
        [coding] if coding.eq_ignore_ascii_case("chunked") => Ok(TransferEncoding::Chunked),
        _ => Err(AppError::NotImplemented(format!(
            "transfer coding {}",
            codings.join(", ")
        ))),
    }
}

fn content_length(headers: &[(String, String)]) -> AppResult<u64> {
    let mut length = None;
    for value in header_values(headers, "content-length") {
        let parsed = value
            .parse::<u64>()
            .map_err(|_| AppError::MalformedProtocol(format!("bad content-length {value:?}")))?;
        match length {
            Some(previous) if previous != parsed => {
                return Err(AppError::MalformedProtocol(
                    "conflicting content-length headers".to_string(),
                ));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length.unwrap_or(0))
}

fn parse_chunk_size(line: &[u8]) -> AppResult<usize> {
    let text = std::str::from_utf8(line)
        .map_err(|_| AppError::MalformedProtocol("chunk size is not utf-8".to_string()))?;
    // chunk extensions are ignored
    let digits = text.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(digits, 16)
        .map_err(|_| AppError::MalformedProtocol(format!("bad chunk size {digits:?}")))
}
