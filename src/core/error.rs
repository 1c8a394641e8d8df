//! Error taxonomy for call execution.
//!
//! Every failure a call can surface is an [`HttpError`]. The variants split into
//! the categories the engine cares about when deciding whether to retry:
//! usage errors and protocol violations are fatal, connect failures are handled
//! by route fallback, exchange I/O failures and timeouts are recoverable, and
//! cancellation is always terminal.
use std::{fmt, io, time::Duration};

use thiserror::Error;

use crate::core::{route::Route, url::UrlError};

/// Which blocking operation a timeout fired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutPhase {
    Connect,
    Read,
    Write,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::Connect => f.write_str("connect"),
            TimeoutPhase::Read => f.write_str("read"),
            TimeoutPhase::Write => f.write_str("write"),
        }
    }
}

/// One failed attempt to establish a transport to a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFailure {
    pub route: Route,
    pub kind: io::ErrorKind,
    pub message: String,
}

impl ConnectFailure {
    pub fn new(route: Route, error: &io::Error) -> Self {
        Self {
            route,
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn timed_out(route: Route, after: Duration) -> Self {
        Self {
            route,
            kind: io::ErrorKind::TimedOut,
            message: format!("connect timed out after {after:?}"),
        }
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.route, self.message)
    }
}

fn describe_attempts(attempts: &[ConnectFailure]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors produced while executing a call.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// The caller broke an API contract (re-executing a call, missing URL ...).
    #[error("usage error: {0}")]
    Usage(String),

    /// A chain stage broke a pipeline invariant.
    #[error("protocol violation by {stage}: {message}")]
    ProtocolViolation { stage: String, message: String },

    /// Every route candidate failed to connect. The first attempt is the primary cause.
    #[error("failed to connect after {} attempt(s): {}", .attempts.len(), describe_attempts(.attempts))]
    RoutesExhausted { attempts: Vec<ConnectFailure> },

    /// The host name could not be resolved to any address.
    #[error("unknown host {host}: {message}")]
    UnknownHost { host: String, message: String },

    /// Read or write failure on a bound connection.
    #[error("I/O error during exchange: {0}")]
    Io(#[from] io::Error),

    #[error("{phase} timed out after {after:?}")]
    Timeout { phase: TimeoutPhase, after: Duration },

    #[error("call canceled")]
    Canceled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    InvalidUrl(#[from] UrlError),

    /// The peer sent bytes that do not form a valid response.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("too many follow-up requests: {0}")]
    TooManyFollowUps(u32),

    /// An error that escaped a chain stage, annotated with that stage.
    #[error("{stage} failed: {source}")]
    InStage {
        stage: String,
        #[source]
        source: Box<HttpError>,
    },
}

/// Result type alias for call execution.
pub type HttpResult<T> = Result<T, HttpError>;

impl HttpError {
    pub(crate) fn violation(stage: impl Into<String>, message: impl Into<String>) -> Self {
        HttpError::ProtocolViolation {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// The innermost error, looking through stage annotations.
    pub fn root(&self) -> &HttpError {
        let mut current = self;
        while let HttpError::InStage { source, .. } = current {
            current = source;
        }
        current
    }

    /// Consume stage annotations and return the innermost error.
    pub fn into_root(self) -> HttpError {
        let mut current = self;
        while let HttpError::InStage { source, .. } = current {
            current = *source;
        }
        current
    }

    /// The stage this error is attributed to, when known.
    pub fn stage(&self) -> Option<&str> {
        match self {
            HttpError::InStage { stage, .. } | HttpError::ProtocolViolation { stage, .. } => {
                Some(stage)
            }
            _ => None,
        }
    }

    /// Annotate with the stage the error escaped from. Protocol violations already
    /// name their stage and an error is only ever annotated once.
    pub(crate) fn in_stage(self, stage: &str) -> Self {
        match self {
            HttpError::ProtocolViolation { .. } | HttpError::InStage { .. } => self,
            other => HttpError::InStage {
                stage: stage.to_string(),
                source: Box::new(other),
            },
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.root(), HttpError::Canceled)
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self.root(), HttpError::ProtocolViolation { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), HttpError::Timeout { .. })
    }

    /// Whether the call engine may retry the request on another connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.root(), HttpError::Io(_) | HttpError::Timeout { .. })
    }
}
