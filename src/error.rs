//! Errors this crate can emit.
use std::fmt::{self, Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};

/// A specialized `Result` type for this crate.
pub type Result<T, E = Error> = ::std::result::Result<T, E>;

/// The value returned in this crate when an error occurs.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct Error(pub(crate) ErrorRepr);

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match &self.0 {
            ErrorRepr::Config(_) => ErrorKind::Config,
            ErrorRepr::Encoding(_) | ErrorRepr::CorruptTask(_) => ErrorKind::Encoding,
            ErrorRepr::Queue { .. } => ErrorKind::Queue,
            ErrorRepr::Store { kind, .. } => *kind,
            ErrorRepr::Closed => ErrorKind::Closed,
            ErrorRepr::QueueTooSmall { .. } => ErrorKind::Recovery,
            ErrorRepr::Consumer(_) => ErrorKind::Unknown,
        }
    }

    /// Whether this error corresponds to an HTTP 404 from the object store.
    pub fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }

    /// Whether this error corresponds to an HTTP 403 from the object store.
    pub fn is_access_denied(&self) -> bool {
        matches!(self.kind(), ErrorKind::AccessDenied)
    }

    pub(crate) fn config<T: Display>(msg: T) -> Self {
        Self(ErrorRepr::Config(msg.to_string()))
    }

    pub(crate) fn encoding<T: Display>(msg: T) -> Self {
        Self(ErrorRepr::Encoding(msg.to_string()))
    }

    pub(crate) fn corrupt_task<T: Display>(msg: T) -> Self {
        Self(ErrorRepr::CorruptTask(msg.to_string()))
    }

    pub(crate) fn queue(path: &Path, source: io::Error) -> Self {
        Self(ErrorRepr::Queue {
            path: path.to_path_buf(),
            source,
        })
    }

    pub(crate) fn store<E>(op: &'static str, target: String, kind: ErrorKind, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(ErrorRepr::Store {
            op,
            target,
            kind,
            source: Box::new(source),
        })
    }

    pub(crate) fn store_msg(op: &'static str, target: String, kind: ErrorKind, msg: &str) -> Self {
        Self(ErrorRepr::Store {
            op,
            target,
            kind,
            source: msg.to_string().into(),
        })
    }

    pub(crate) fn closed() -> Self {
        Self(ErrorRepr::Closed)
    }

    pub(crate) fn queue_too_small(pending: u64, capacity: usize) -> Self {
        Self(ErrorRepr::QueueTooSmall { pending, capacity })
    }

    pub(crate) fn consumer<T: Display>(msg: T) -> Self {
        Self(ErrorRepr::Consumer(msg.to_string()))
    }
}

impl From<ErrorRepr> for Error {
    fn from(value: ErrorRepr) -> Self {
        Self(value)
    }
}

/// The category of the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Invalid journal configuration.
    Config,
    /// A record or task payload could not be encoded or decoded.
    Encoding,
    /// The local durable queue failed.
    Queue,
    /// An object-store operation failed.
    Store,
    /// The object store reported that the target does not exist.
    NotFound,
    /// The object store denied the operation.
    AccessDenied,
    /// The journal has been closed.
    Closed,
    /// Startup recovery could not be completed.
    Recovery,
    Unknown,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config => write!(f, "config"),
            Self::Encoding => write!(f, "encoding"),
            Self::Queue => write!(f, "queue"),
            Self::Store => write!(f, "store"),
            Self::NotFound => write!(f, "not found"),
            Self::AccessDenied => write!(f, "access denied"),
            Self::Closed => write!(f, "closed"),
            Self::Recovery => write!(f, "recovery"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Internal error type that we are free to change at will.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ErrorRepr {
    #[error("invalid journal configuration: {0}")]
    Config(String),
    #[error("encoding failed: {0}")]
    Encoding(String),
    #[error("corrupt task payload: {0}")]
    CorruptTask(String),
    #[error("durable queue io at {path}: {source}")]
    Queue {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{op} failed for {target}: {source}")]
    Store {
        op: &'static str,
        target: String,
        kind: ErrorKind,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error("journal is closed")]
    Closed,
    #[error("durable queue holds {pending} records but max_queue_size is {capacity}")]
    QueueTooSmall { pending: u64, capacity: usize },
    #[error("consumer loop failed: {0}")]
    Consumer(String),
}
