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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Accept error = {0}")]
    Accept(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// poller errors
    #[error("failed to create poller backend {0}: {1}")]
    PollerCreate(&'static str, std::io::Error),

    #[error("unknown poller backend: {0}")]
    UnknownPoller(String),

    #[error("poller backend already registered: {0}")]
    DuplicatePoller(String),

    /// connection i/o errors
    #[error("response already closed")]
    ResponseClosed,

    /// marker error, the buffer does not hold a complete frame yet
    #[error("incomplete frame")]
    Incomplete,

    /// http protocol errors
    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("message too large: {0}")]
    MessageTooLarge(String),

    #[error("header section too large: {0}")]
    HeaderTooLarge(String),

    #[error("method not implemented: {0}")]
    NotImplemented(String),

    #[error("unsupported http version: {0}")]
    UnsupportedVersion(String),
}
