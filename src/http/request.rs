use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
    Connect,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Patch => "PATCH",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let method = match s {
            "GET" => HttpMethod::Get,
            "HEAD" => HttpMethod::Head,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "DELETE" => HttpMethod::Delete,
            "OPTIONS" => HttpMethod::Options,
            "TRACE" => HttpMethod::Trace,
            "CONNECT" => HttpMethod::Connect,
            "PATCH" => HttpMethod::Patch,
            other => return Err(AppError::NotImplemented(format!("method {other}"))),
        };
        Ok(method)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    #[default]
    Identity,
    Chunked,
}

/// A fully received request as produced by the parser.
#[derive(Debug, Clone)]
pub struct HttpRequestData {
    pub method: HttpMethod,
    pub uri: String,
    pub path: String,
    pub query_string: String,
    pub fragment: String,
    pub version_major: u8,
    pub version_minor: u8,
    pub headers: Vec<(String, String)>,
    pub content_length: u64,
    pub transfer_encoding: TransferEncoding,
    pub keep_alive: bool,
    pub body: Bytes,
}

/// Read-only view handed to application handlers.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    data: HttpRequestData,
}

impl HttpRequest {
    pub fn new(data: HttpRequestData) -> Self {
        HttpRequest { data }
    }

    /// Decodes `%XX` escapes and `+` as space. Malformed escapes are kept
    /// as they are.
    pub fn url_decode(url: &str) -> String {
        let bytes = url.as_bytes();
        let mut decoded = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'+' => {
                    decoded.push(b' ');
                    i += 1;
                }
                b'%' if i + 2 < bytes.len() => {
                    match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                        (Some(high), Some(low)) => {
                            decoded.push(high << 4 | low);
                            i += 3;
                        }
                        _ => {
                            decoded.push(b'%');
                            i += 1;
                        }
                    }
                }
                byte => {
                    decoded.push(byte);
                    i += 1;
                }
            }
        }
        String::from_utf8_lossy(&decoded).into_owned()
    }

    pub fn path(&self) -> &str {
        &self.data.path
    }

    pub fn uri(&self) -> &str {
        &self.data.uri
    }

    pub fn query_string(&self) -> &str {
        &self.data.query_string
    }

    pub fn fragment(&self) -> &str {
        &self.data.fragment
    }

    pub fn method(&self) -> HttpMethod {
        self.data.method
    }

    pub fn method_string(&self) -> &'static str {
        self.data.method.as_str()
    }

    pub fn content_length(&self) -> u64 {
        self.data.content_length
    }

    pub fn transfer_encoding(&self) -> TransferEncoding {
        self.data.transfer_encoding
    }

    pub fn version_major(&self) -> u8 {
        self.data.version_major
    }

    pub fn version_minor(&self) -> u8 {
        self.data.version_minor
    }

    pub fn keep_alive(&self) -> bool {
        self.data.keep_alive
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.data.headers
    }

    /// Header names compare case-insensitively.
    pub fn has_header(&self, key: &str) -> bool {
        self.data
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case(key))
    }

    pub fn find_header_values(&self, key: &str) -> Vec<&str> {
        self.data
            .headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
            .collect()
    }

    /// First value of `key`, if any.
    pub fn find_header_value(&self, key: &str) -> Option<&str> {
        self.data
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    pub fn body(&self) -> &Bytes {
        &self.data.body
    }

    pub fn into_data(self) -> HttpRequestData {
        self.data
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
