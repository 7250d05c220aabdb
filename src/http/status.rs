use std::fmt;

/// Status code and reason phrase of a response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpResponseStatus {
    pub code: u16,
    pub reason: &'static str,
}

macro_rules! statuses {
    ($($name:ident = ($code:expr, $reason:expr);)*) => {
        impl HttpResponseStatus {
            $(pub const $name: HttpResponseStatus = HttpResponseStatus { code: $code, reason: $reason };)*

            pub const ALL: &'static [HttpResponseStatus] = &[$(HttpResponseStatus::$name),*];
        }
    };
}

statuses! {
    CONTINUE = (100, "Continue");
    SWITCHING_PROTOCOLS = (101, "Switching Protocols");
    OK = (200, "OK");
    CREATED = (201, "Created");
    ACCEPTED = (202, "Accepted");
    NON_AUTHORITATIVE_INFORMATION = (203, "Non-Authoritative Information");
    NO_CONTENT = (204, "No Content");
    RESET_CONTENT = (205, "Reset Content");
    PARTIAL_CONTENT = (206, "Partial Content");
    MULTIPLE_CHOICES = (300, "Multiple Choices");
    MOVED_PERMANENTLY = (301, "Moved Permanently");
    FOUND = (302, "Found");
    SEE_OTHER = (303, "See Other");
    NOT_MODIFIED = (304, "Not Modified");
    USE_PROXY = (305, "Use Proxy");
    TEMPORARY_REDIRECT = (307, "Temporary Redirect");
    BAD_REQUEST = (400, "Bad Request");
    UNAUTHORIZED = (401, "Unauthorized");
    PAYMENT_REQUIRED = (402, "Payment Required");
    FORBIDDEN = (403, "Forbidden");
    NOT_FOUND = (404, "Not Found");
    METHOD_NOT_ALLOWED = (405, "Method Not Allowed");
    NOT_ACCEPTABLE = (406, "Not Acceptable");
    PROXY_AUTHENTICATION_REQUIRED = (407, "Proxy Authentication Required");
    REQUEST_TIMEOUT = (408, "Request Timeout");
    CONFLICT = (409, "Conflict");
    GONE = (410, "Gone");
    LENGTH_REQUIRED = (411, "Length Required");
    PRECONDITION_FAILED = (412, "Precondition Failed");
    REQUEST_ENTITY_TOO_LARGE = (413, "Request Entity Too Large");
    REQUEST_URI_TOO_LARGE = (414, "Request-URI Too Large");
    UNSUPPORTED_MEDIA_TYPE = (415, "Unsupported Media Type");
    REQUESTED_RANGE_NOT_SATISFIABLE = (416, "Requested Range Not Satisfiable");
    EXPECTATION_FAILED = (417, "Expectation Failed");
    REQUEST_HEADER_FIELDS_TOO_LARGE = (431, "Request Header Fields Too Large");
    INTERNAL_SERVER_ERROR = (500, "Internal Server Error");
    NOT_IMPLEMENTED = (501, "Not Implemented");
    BAD_GATEWAY = (502, "Bad Gateway");
    SERVICE_UNAVAILABLE = (503, "Service Unavailable");
    GATEWAY_TIMEOUT = (504, "Gateway Timeout");
    HTTP_VERSION_NOT_SUPPORTED = (505, "HTTP Version Not Supported");
}

impl HttpResponseStatus {
    pub const fn new(code: u16, reason: &'static str) -> Self {
        HttpResponseStatus { code, reason }
    }

    pub fn from_code(code: u16) -> Option<HttpResponseStatus> {
        Self::ALL.iter().copied().find(|status| status.code == code)
    }

    /// 1xx, 204 and 304 responses never carry a body.
    pub fn allows_body(&self) -> bool {
        self.code >= 200 && self.code != 204 && self.code != 304
    }
}

impl fmt::Display for HttpResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}
