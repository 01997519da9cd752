use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = ::std::result::Result<T, Error>;

/// Error returned by a message handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("nsqd error: {0}")]
    Nsq(#[from] NsqError),

    #[error("lookup http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid lookup address: {0}")]
    Url(#[from] url::ParseError),

    #[error("connecting to {addr} timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("no response from {addr} within {timeout:?}")]
    ReadTimeout { addr: String, timeout: Duration },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid {kind} name {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("no nsqd nodes found for topic {0:?}")]
    NoNodes(String),

    #[error("nsqd requires authentication, which is not supported")]
    AuthRequired,

    #[error("connection closed")]
    Closed,

    #[error("handler failed: {0}")]
    Handler(HandlerError),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn protocol<S: Into<String>>(msg: S) -> Error {
        Error::Protocol(msg.into())
    }

    pub(crate) fn unexpected_eof() -> Error {
        io::Error::from(io::ErrorKind::UnexpectedEof).into()
    }
}

/// An error frame sent by nsqd, e.g. `E_INVALID cannot SUB in current state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsqError {
    code: String,
    description: String,
}

impl NsqError {
    pub fn new<S1, S2>(code: S1, description: S2) -> NsqError
        where S1: Into<String>,
              S2: Into<String>,
    {
        NsqError {
            code: code.into(),
            description: description.into(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Non-fatal errors leave the connection usable.
    pub fn is_fatal(&self) -> bool {
        match self.code.as_str() {
            "E_FIN_FAILED" | "E_REQ_FAILED" | "E_TOUCH_FAILED" => false,
            _ => true,
        }
    }
}

impl fmt::Display for NsqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            f.write_str(&self.code)
        } else {
            write!(f, "{} {}", self.code, self.description)
        }
    }
}

impl std::error::Error for NsqError {}
