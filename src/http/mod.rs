//! HTTP/1.x front stages.
//!
//! [`HttpParserStage`] turns socket bytes into requests and
//! [`HttpHandlerStage`] runs an [`HttpHandler`] for each of them. Both keep
//! their per-connection progress in [`HttpConnectionState`], installed as the
//! connection payload by [`HttpConnectionFactory`].

pub use parser::{RequestParser, DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_HEADER_SIZE};
pub use request::{HttpMethod, HttpRequest, HttpRequestData, TransferEncoding};
pub use response::HttpResponse;
pub use stages::{
    HttpConnectionFactory, HttpConnectionState, HttpHandler, HttpHandlerStage, HttpParserStage,
    HTTP_HANDLER_STAGE, HTTP_PARSER_STAGE,
};
pub use status::HttpResponseStatus;

mod parser;
mod request;
mod response;
mod stages;
mod status;
