// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::VecDeque;
use std::os::fd::AsRawFd;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::parser::RequestParser;
use super::request::{HttpRequest, HttpRequestData};
use super::response::HttpResponse;
use super::status::HttpResponseStatus;
use crate::network::{
    Connection, ConnectionFactory, ConnectionId, IoStatus, Request, Response, Transport,
    DEFAULT_RESPONSE_BUFFER_SIZE,
};
use crate::pipeline::{Stage, StageSetup, StageStatus};
use crate::service::HttpConfig;
use crate::utils::set_socket_blocking;
use crate::{AppError, AppResult};

pub const HTTP_PARSER_STAGE: &str = "http-parser";
pub const HTTP_HANDLER_STAGE: &str = "http-handler";

const READ_SIZE: usize = 4096;
// bounds the time one connection keeps a parser worker busy
const MAX_READS_PER_TASK: usize = 16;

/// Application callback run by [`HttpHandlerStage`] once per request.
///
/// An `Err` before anything was sent becomes a 500 response, after that the
/// connection is closed.
pub trait HttpHandler: Send + Sync + 'static {
    fn handle(&self, request: &HttpRequest, response: &mut HttpResponse<'_>) -> AppResult<()>;
}

impl<F> HttpHandler for F
where
    F: Fn(&HttpRequest, &mut HttpResponse<'_>) -> AppResult<()> + Send + Sync + 'static,
{
    fn handle(&self, request: &HttpRequest, response: &mut HttpResponse<'_>) -> AppResult<()> {
        self(request, response)
    }
}

/// Protocol state carried as the connection payload.
#[derive(Debug)]
pub struct HttpConnectionState {
    parser: RequestParser,
    pending: VecDeque<HttpRequestData>,
    served: usize,
    close_after_flush: bool,
    peer_closed: bool,
}

impl HttpConnectionState {
    pub fn new(parser: RequestParser) -> Self {
        HttpConnectionState {
            parser,
            pending: VecDeque::new(),
            served: 0,
            close_after_flush: false,
            peer_closed: false,
        }
    }

    /// Parsed requests waiting for the handler stage.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn served(&self) -> usize {
        self.served
    }
}

#[derive(Debug, Clone)]
pub struct HttpConnectionFactory {
    idle_timeout: Option<Duration>,
    max_header_size: usize,
    max_body_size: usize,
}

impl Default for HttpConnectionFactory {
    fn default() -> Self {
        HttpConnectionFactory::from(&HttpConfig::default())
    }
}

impl From<&HttpConfig> for HttpConnectionFactory {
    fn from(config: &HttpConfig) -> Self {
        HttpConnectionFactory {
            idle_timeout: (config.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(config.idle_timeout_secs)),
            max_header_size: config.max_header_size,
            max_body_size: config.max_body_size,
        }
    }
}

impl HttpConnectionFactory {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn connection_state(&self) -> HttpConnectionState {
        HttpConnectionState::new(RequestParser::new(
            self.max_header_size,
            self.max_body_size,
        ))
    }
}

impl ConnectionFactory for HttpConnectionFactory {
    fn create_connection(
        &self,
        id: ConnectionId,
        transport: Box<dyn Transport>,
    ) -> AppResult<Connection> {
        set_socket_blocking(transport.as_raw_fd(), false)?;
        let mut conn = Connection::new(id, transport);
        conn.set_timeout(self.idle_timeout);
        conn.set_payload(self.connection_state());
        trace!("http connection {id} created on fd {}", conn.fd());
        Ok(conn)
    }

    fn destroy_connection(&self, conn: Connection) {
        let served = conn
            .payload_ref::<HttpConnectionState>()
            .map_or(0, HttpConnectionState::served);
        debug!(
            "http connection {} on fd {} closed after {served} requests",
            conn.id(),
            conn.fd()
        );
    }
}

/// Reads and parses requests, and drains output a previous stage run could
/// not flush.
#[derive(Debug, Default)]
pub struct HttpParserStage {
    next_stage: Option<String>,
}

impl HttpParserStage {
    pub fn new() -> Self {
        HttpParserStage::default()
    }

    fn advance(&self, conn: &mut Connection, state: &mut HttpConnectionState) -> StageStatus {
        if conn.pending_output() > 0 {
            let flushed = Response::new(conn, DEFAULT_RESPONSE_BUFFER_SIZE).flush_data();
            match flushed {
                Ok(IoStatus::WouldBlock) => {
                    conn.want_write();
                    return StageStatus::Rearm;
                }
                Ok(IoStatus::Complete(_)) => {}
                Err(err) => {
                    debug!("connection {} flush failed: {err}", conn.id());
                    return StageStatus::Close;
                }
            }
        }
        if state.close_after_flush {
            return StageStatus::Close;
        }
        if !state.pending.is_empty() {
            return StageStatus::Forward;
        }

        let mut request = Request::new(conn);
        for _ in 0..MAX_READS_PER_TASK {
            match request.read_to_buffer(READ_SIZE) {
                Ok(IoStatus::Complete(0)) => {
                    state.peer_closed = true;
                    break;
                }
                Ok(IoStatus::Complete(_)) => {}
                Ok(IoStatus::WouldBlock) => break,
                Err(err) => {
                    debug!("connection {} read failed: {err}", conn.id());
                    return StageStatus::Close;
                }
            }
        }

        loop {
            match state.parser.parse(&mut conn.read_buf) {
                Ok(Some(data)) => state.pending.push_back(data),
                Ok(None) => break,
                Err(err) => {
                    reject(conn, &err);
                    return StageStatus::Close;
                }
            }
        }

        if !state.pending.is_empty() {
            StageStatus::Forward
        } else if state.peer_closed {
            StageStatus::Close
        } else {
            conn.want_read();
            StageStatus::Rearm
        }
    }
}

impl Stage for HttpParserStage {
    fn name(&self) -> &str {
        HTTP_PARSER_STAGE
    }

    fn initialize(&mut self, setup: &StageSetup) -> AppResult<()> {
        let next = setup.next_stage().ok_or_else(|| {
            AppError::IllegalStateError(format!(
                "{HTTP_PARSER_STAGE} needs a downstream stage, chain is {:?}",
                setup.stage_names()
            ))
        })?;
        self.next_stage = Some(next.to_string());
        Ok(())
    }

    fn process_task(&self, conn: &mut Connection) -> StageStatus {
        let Some(mut state) = conn.take_payload::<HttpConnectionState>() else {
            warn!("connection {} carries no http state", conn.id());
            return StageStatus::Close;
        };
        let status = self.advance(conn, &mut state);
        trace!(
            "connection {} parsed {} requests, forwarding to {:?}: {status:?}",
            conn.id(),
            state.pending.len(),
            self.next_stage
        );
        conn.put_payload(state);
        status
    }
}

/// Best effort error answer for a request that can not be parsed.
fn reject(conn: &mut Connection, err: &AppError) {
    let status = match err {
        AppError::MessageTooLarge(_) => HttpResponseStatus::REQUEST_ENTITY_TOO_LARGE,
        AppError::HeaderTooLarge(_) => HttpResponseStatus::REQUEST_HEADER_FIELDS_TOO_LARGE,
        AppError::NotImplemented(_) => HttpResponseStatus::NOT_IMPLEMENTED,
        AppError::UnsupportedVersion(_) => HttpResponseStatus::HTTP_VERSION_NOT_SUPPORTED,
        _ => HttpResponseStatus::BAD_REQUEST,
    };
    debug!("connection {} rejected with {status}: {err}", conn.id());
    let mut response = HttpResponse::new(conn, DEFAULT_RESPONSE_BUFFER_SIZE);
    response.set_keep_alive(false);
    response.add_header("Content-Type", "text/plain");
    let sent = response
        .write_data(status.reason.as_bytes())
        .and_then(|_| response.respond(status))
        .and_then(|_| response.finish());
    if let Err(err) = sent {
        trace!("error response not delivered: {err}");
    }
}

/// Runs the application handler for every parsed request, in arrival order.
pub struct HttpHandlerStage {
    handler: Box<dyn HttpHandler>,
    max_keep_alive_requests: usize,
    response_buffer_size: usize,
}

impl HttpHandlerStage {
    /// `max_keep_alive_requests` of 0 never closes on count.
    pub fn new(
        handler: impl HttpHandler,
        max_keep_alive_requests: usize,
        response_buffer_size: usize,
    ) -> Self {
        HttpHandlerStage {
            handler: Box::new(handler),
            max_keep_alive_requests,
            response_buffer_size,
        }
    }

    pub fn from_fn<F>(handler: F, config: &HttpConfig) -> Self
    where
        F: Fn(&HttpRequest, &mut HttpResponse<'_>) -> AppResult<()> + Send + Sync + 'static,
    {
        HttpHandlerStage::new(
            handler,
            config.max_keep_alive_requests,
            config.response_buffer_size,
        )
    }

    fn serve(&self, conn: &mut Connection, state: &mut HttpConnectionState) -> StageStatus {
        while let Some(data) = state.pending.pop_front() {
            state.served += 1;
            let limit_reached =
                self.max_keep_alive_requests > 0 && state.served >= self.max_keep_alive_requests;
            let last_before_close = state.peer_closed && state.pending.is_empty();
            let keep_alive = data.keep_alive && !limit_reached && !last_before_close;
            let chunked_allowed = data.version_major == 1 && data.version_minor >= 1;
            let request = HttpRequest::new(data);
            let id = conn.id();

            let mut response = HttpResponse::new(conn, self.response_buffer_size);
            response.set_keep_alive(keep_alive);
            response.set_chunked_allowed(chunked_allowed);
            if let Err(err) = self.handler.handle(&request, &mut response) {
                if response.is_responded() {
                    warn!("handler failed on connection {id} after responding: {err}");
                    return StageStatus::Close;
                }
                warn!(
                    "handler failed on connection {id} for {} {}: {err}",
                    request.method(),
                    request.uri()
                );
                let answered = response
                    .reset()
                    .and_then(|_| response.respond(HttpResponseStatus::INTERNAL_SERVER_ERROR));
                if answered.is_err() {
                    return StageStatus::Close;
                }
            }
            let flushed = match response.finish() {
                Ok(flushed) => flushed,
                Err(err) => {
                    debug!("connection {id} write failed: {err}");
                    return StageStatus::Close;
                }
            };
            if !response.keep_alive() {
                state.pending.clear();
                state.close_after_flush = true;
            }

            if flushed == IoStatus::WouldBlock {
                conn.want_write();
                return StageStatus::Rearm;
            }
            if state.close_after_flush {
                return StageStatus::Close;
            }
        }
        conn.want_read();
        StageStatus::Rearm
    }
}

impl Stage for HttpHandlerStage {
    fn name(&self) -> &str {
        HTTP_HANDLER_STAGE
    }

    fn process_task(&self, conn: &mut Connection) -> StageStatus {
        let Some(mut state) = conn.take_payload::<HttpConnectionState>() else {
            warn!("connection {} carries no http state", conn.id());
            return StageStatus::Close;
        };
        let status = self.serve(conn, &mut state);
        conn.put_payload(state);
        status
    }
}
