use bytes::BytesMut;
use chrono::Utc;

use super::status::HttpResponseStatus;
use crate::network::{Connection, IoStatus, Response};
use crate::{AppError, AppResult};

pub const HTTP_VERSION: &str = "HTTP/1.1";
pub const HTTP_NEW_LINE: &str = "\r\n";
pub const SERVER_NAME: &str = concat!("pipeserv/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    ContentLength,
    Chunked,
    /// body ends when the connection closes
    UntilClose,
    NoBody,
}

/// Response writer for one request.
///
/// With the prepare buffer (the default) body bytes are held back until
/// [`respond`](Self::respond) or [`finish`](Self::finish), and the response
/// goes out with a computed `Content-Length`. After
/// [`disable_prepare_buffer`](Self::disable_prepare_buffer) the body is
/// streamed: framed by `Content-Length` if one was set before the first
/// write, chunked otherwise. Chunked framing is therefore only ever chosen
/// for a streamed body with no declared length.
pub struct HttpResponse<'a> {
    out: Response<'a>,
    headers: Vec<(String, String)>,
    content_length: Option<u64>,
    has_content_length: bool,
    use_prepare_buffer: bool,
    prepare_buffer: BytesMut,
    framing: Option<Framing>,
    keep_alive: bool,
    chunked_allowed: bool,
    finished: bool,
}

impl<'a> HttpResponse<'a> {
    pub fn new(conn: &'a mut Connection, buffer_size: usize) -> Self {
        HttpResponse {
            out: Response::new(conn, buffer_size),
            headers: Vec::new(),
            content_length: None,
            has_content_length: true,
            use_prepare_buffer: true,
            prepare_buffer: BytesMut::new(),
            framing: None,
            keep_alive: true,
            chunked_allowed: true,
            finished: false,
        }
    }

    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push((key.into(), value.into()));
    }

    pub fn set_content_length(&mut self, content_length: u64) {
        self.content_length = Some(content_length);
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Disabled, a buffered body is sent chunked instead of with a
    /// computed length.
    pub fn set_has_content_length(&mut self, enabled: bool) {
        self.has_content_length = enabled;
    }

    pub fn has_content_length(&self) -> bool {
        self.has_content_length
    }

    pub fn disable_prepare_buffer(&mut self) {
        self.use_prepare_buffer = false;
    }

    pub fn is_responded(&self) -> bool {
        self.framing.is_some()
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub(crate) fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// HTTP/1.0 peers can not decode chunked bodies.
    pub(crate) fn set_chunked_allowed(&mut self, allowed: bool) {
        self.chunked_allowed = allowed;
    }

    /// Writes the status line and headers, followed by anything held in the
    /// prepare buffer.
    pub fn respond(&mut self, status: HttpResponseStatus) -> AppResult<()> {
        if self.is_responded() {
            return Err(AppError::InvalidOperation(
                "response status already sent".to_string(),
            ));
        }
        let framing = if !status.allows_body() {
            Framing::NoBody
        } else if self.content_length.is_some() {
            Framing::ContentLength
        } else if self.use_prepare_buffer && self.has_content_length {
            self.content_length = Some(self.prepare_buffer.len() as u64);
            Framing::ContentLength
        } else if self.chunked_allowed {
            Framing::Chunked
        } else {
            self.keep_alive = false;
            Framing::UntilClose
        };

        let mut head = String::with_capacity(256);
        head.push_str(&format!("{HTTP_VERSION} {status}{HTTP_NEW_LINE}"));
        head.push_str(&format!("Server: {SERVER_NAME}{HTTP_NEW_LINE}"));
        head.push_str(&format!(
            "Date: {}{HTTP_NEW_LINE}",
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT")
        ));
        for (key, value) in &self.headers {
            head.push_str(&format!("{key}: {value}{HTTP_NEW_LINE}"));
        }
        match framing {
            Framing::ContentLength => {
                let length = self.content_length.unwrap_or_default();
                head.push_str(&format!("Content-Length: {length}{HTTP_NEW_LINE}"));
            }
            Framing::Chunked => {
                head.push_str(&format!("Transfer-Encoding: chunked{HTTP_NEW_LINE}"));
            }
            Framing::UntilClose | Framing::NoBody => {}
        }
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        head.push_str(&format!("Connection: {connection}{HTTP_NEW_LINE}{HTTP_NEW_LINE}"));

        self.out.write_data(head.as_bytes())?;
        self.framing = Some(framing);

        let prepared = self.prepare_buffer.split();
        self.write_body(&prepared)?;
        Ok(())
    }

    /// Queues body bytes. Before the status is sent they go to the prepare
    /// buffer; without one the status line is sent as 200 first.
    pub fn write_data(&mut self, data: &[u8]) -> AppResult<usize> {
        if self.finished {
            return Err(AppError::ResponseClosed);
        }
        if !self.is_responded() {
            if self.use_prepare_buffer {
                self.prepare_buffer.extend_from_slice(data);
                return Ok(data.len());
            }
            self.respond(HttpResponseStatus::OK)?;
        }
        self.write_body(data)?;
        Ok(data.len())
    }

    fn write_body(&mut self, data: &[u8]) -> AppResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        match self.framing {
            Some(Framing::Chunked) => {
                self.out
                    .write_data(format!("{:x}{HTTP_NEW_LINE}", data.len()).as_bytes())?;
                self.out.write_data(data)?;
                self.out.write_data(HTTP_NEW_LINE.as_bytes())?;
            }
            Some(Framing::NoBody) => {}
            _ => {
                self.out.write_data(data)?;
            }
        }
        Ok(())
    }

    /// Completes the response and flushes it. `WouldBlock` leaves the rest
    /// staged on the connection.
    pub fn finish(&mut self) -> AppResult<IoStatus> {
        if !self.finished {
            if !self.is_responded() {
                self.respond(HttpResponseStatus::OK)?;
            }
            if self.framing == Some(Framing::Chunked) {
                self.out.write_data(b"0\r\n\r\n")?;
            }
            self.finished = true;
        }
        self.out.flush_data()
    }

    /// Drops everything not sent yet. Fails once the status line is out.
    pub fn reset(&mut self) -> AppResult<()> {
        if self.is_responded() {
            return Err(AppError::InvalidOperation(
                "response already started".to_string(),
            ));
        }
        self.headers.clear();
        self.content_length = None;
        self.has_content_length = true;
        self.use_prepare_buffer = true;
        self.prepare_buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::mock::MockTransport;

    fn connection() -> (Connection, MockTransport) {
        let transport = MockTransport::default();
        (Connection::new(1, Box::new(transport.clone())), transport)
    }

    fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
        let end = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        (
            String::from_utf8(raw[..end].to_vec()).unwrap(),
            raw[end + 4..].to_vec(),
        )
    }

    #[test]
    fn test_prepared_body_gets_content_length() -> AppResult<()> {
        let (mut conn, transport) = connection();
        let mut response = HttpResponse::new(&mut conn, 4096);
        response.add_header("Content-Type", "text/plain");
        response.write_data(b"hello ")?;
        response.write_data(b"world")?;
        assert!(!response.is_responded());
        assert_eq!(response.finish()?, IoStatus::Complete(transport.written().len()));

        let (head, body) = split_response(&transport.written());
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("\r\nContent-Type: text/plain"));
        assert!(head.contains("\r\nContent-Length: 11"));
        assert!(head.contains("\r\nConnection: keep-alive"));
        assert!(head.contains("\r\nDate: "));
        assert!(head.contains("\r\nServer: pipeserv/"));
        assert_eq!(body, b"hello world");
        Ok(())
    }

    #[test]
    fn test_streamed_body_is_chunked() -> AppResult<()> {
        let (mut conn, transport) = connection();
        let mut response = HttpResponse::new(&mut conn, 4096);
        response.disable_prepare_buffer();
        response.write_data(b"Wiki")?;
        assert!(response.is_responded());
        response.write_data(b"pedia")?;
        response.finish()?;

        let (head, body) = split_response(&transport.written());
        assert!(head.contains("\r\nTransfer-Encoding: chunked"));
        assert!(!head.contains("Content-Length"));
        assert_eq!(body, b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n");
        Ok(())
    }

    #[test]
    fn test_declared_length_wins_over_chunking() -> AppResult<()> {
        let (mut conn, transport) = connection();
        let mut response = HttpResponse::new(&mut conn, 4096);
        response.disable_prepare_buffer();
        response.set_content_length(3);
        response.write_data(b"abc")?;
        response.finish()?;

        let (head, body) = split_response(&transport.written());
        assert!(head.contains("\r\nContent-Length: 3"));
        assert_eq!(body, b"abc");
        Ok(())
    }

    #[test]
    fn test_http10_stream_closes_instead_of_chunking() -> AppResult<()> {
        let (mut conn, transport) = connection();
        let mut response = HttpResponse::new(&mut conn, 4096);
        response.set_chunked_allowed(false);
        response.disable_prepare_buffer();
        response.write_data(b"abc")?;
        response.finish()?;
        assert!(!response.keep_alive());

        let (head, body) = split_response(&transport.written());
        assert!(head.contains("\r\nConnection: close"));
        assert_eq!(body, b"abc");
        Ok(())
    }

    #[test]
    fn test_reset_and_respond_once() -> AppResult<()> {
        let (mut conn, transport) = connection();
        let mut response = HttpResponse::new(&mut conn, 4096);
        response.add_header("X-Partial", "1");
        response.write_data(b"half done")?;
        response.reset()?;
        response.respond(HttpResponseStatus::NOT_FOUND)?;
        assert!(matches!(
            response.respond(HttpResponseStatus::OK),
            Err(AppError::InvalidOperation(_))
        ));
        assert!(response.reset().is_err());
        response.finish()?;
        assert!(matches!(response.write_data(b"late"), Err(AppError::ResponseClosed)));

        let (head, body) = split_response(&transport.written());
        assert!(head.starts_with("HTTP/1.1 404 Not Found"));
        assert!(!head.contains("X-Partial"));
        assert!(head.contains("\r\nContent-Length: 0"));
        assert!(body.is_empty());
        Ok(())
    }

    #[test]
    fn test_no_content_has_no_framing() -> AppResult<()> {
        let (mut conn, transport) = connection();
        let mut response = HttpResponse::new(&mut conn, 4096);
        response.respond(HttpResponseStatus::NO_CONTENT)?;
        response.write_data(b"ignored")?;
        response.finish()?;
        let (head, body) = split_response(&transport.written());
        assert!(!head.contains("Content-Length"));
        assert!(!head.contains("Transfer-Encoding"));
        assert!(body.is_empty());
        Ok(())
    }

    #[test]
    fn test_blocked_flush_keeps_remainder() -> AppResult<()> {
        let (mut conn, transport) = connection();
        transport.choke([10, 0]);
        let status = {
            let mut response = HttpResponse::new(&mut conn, 4096);
            response.write_data(&[b'x'; 100])?;
            response.finish()?
        };
        assert_eq!(status, IoStatus::WouldBlock);
        assert!(conn.pending_output() > 0);
        let total = transport.written().len() + conn.pending_output();

        let mut out = Response::new(&mut conn, 4096);
        assert!(matches!(out.flush_data()?, IoStatus::Complete(_)));
        assert_eq!(transport.written().len(), total);
        Ok(())
    }
}
