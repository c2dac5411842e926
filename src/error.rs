//! Error kinds and the connection-tagged [`Error`] type.
//!
//! Mirrors the error taxonomy a pipelined client needs to report: every
//! callback receives exactly one [`Error`] or a value, never a panic.

use std::fmt;
use std::sync::Arc;

/// The kind of failure that occurred.
///
/// Each variant corresponds to a propagation path documented in the
/// connection's error handling design: encoding/admission errors are
/// reported only to the caller, I/O errors latch the session and drain
/// in-flight futures, dial errors during reconnect retry or terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("connection context is nil")]
    ContextIsNil,
    #[error("connection context is closed")]
    ContextClosed,
    #[error("not connected")]
    Disconnected,
    #[error("unsupported argument type")]
    ArgumentType,
    #[error("batch failed, offending index {0}")]
    BatchFailed(usize),
    #[error("dial failed")]
    Dial,
    #[error("authentication failed")]
    Auth,
    #[error("ping mismatch")]
    Ping,
    #[error("protocol response error")]
    Response,
    #[error("io error")]
    Io,
}

/// A boxed, cloneable source error.
///
/// `Error` must be `Clone` so the session error latch can hand the same
/// failure to every drained future without consuming it; a plain
/// `Box<dyn Error>` can't do that, so the cause is kept behind an `Arc`.
type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// An error produced by the connection core, tagged with the kind, an
/// optional underlying cause, and the address of the connection it
/// originated from.
#[derive(Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<Arc<str>>,
    cause: Option<Cause>,
    addr: Option<Arc<str>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            message: None,
            cause: None,
            addr: None,
        }
    }

    pub fn with_message(kind: ErrorKind, message: impl Into<Arc<str>>) -> Self {
        Error {
            kind,
            message: Some(message.into()),
            cause: None,
            addr: None,
        }
    }

    pub fn with_cause(
        kind: ErrorKind,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error {
            kind,
            message: None,
            cause: Some(Arc::new(cause)),
            addr: None,
        }
    }

    /// Tags this error with the address of the connection it came from.
    /// Connections attach this when they fail a future so observers can
    /// tell which session produced the failure.
    pub fn tagged(mut self, addr: impl Into<Arc<str>>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    /// The batch-failed variant names the offending index, per the
    /// `SendBatch` all-or-nothing contract.
    pub fn batch_failed(offending_index: usize) -> Self {
        Error::with_message(
            ErrorKind::BatchFailed(offending_index),
            format!("request batch failed because index {offending_index} could not be encoded"),
        )
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn addr(&self) -> Option<&str> {
        self.addr.as_deref()
    }

    /// True when the failure indicates the underlying connection was
    /// dropped, as opposed to a local admission or encoding failure.
    pub fn is_connection_dropped(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Io | ErrorKind::Disconnected | ErrorKind::Dial
        )
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("addr", &self.addr)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.message, &self.addr) {
            (Some(msg), Some(addr)) => write!(f, "{} ({msg}) [{addr}]", self.kind),
            (Some(msg), None) => write!(f, "{} ({msg})", self.kind),
            (None, Some(addr)) => write!(f, "{} [{addr}]", self.kind),
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::with_cause(ErrorKind::Io, e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
