use std::{fmt, io};

/// Errors surfaced by segment and queue construction.
///
/// Queue operations themselves (`push`, `pop`, `empty`) report outcomes by
/// boolean return and never construct one of these.
#[derive(Debug)]
pub enum ShmqError {
    /// A syscall on the shared-memory object failed. `op` names the call.
    Os {
        op: &'static str,
        source: io::Error,
    },
    /// The segment name is not acceptable to the shm namespace.
    Name(String),
    /// A caller-supplied parameter violates a queue precondition.
    Logic(String),
}

impl ShmqError {
    #[inline]
    pub(crate) fn last_os(op: &'static str) -> ShmqError {
        ShmqError::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }
}

impl fmt::Display for ShmqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmqError::Os { op, source } => write!(f, "{} failed: {}", op, source),
            ShmqError::Name(s) => write!(f, "Invalid segment name: {}", s),
            ShmqError::Logic(s) => write!(f, "Logic error: {}", s),
        }
    }
}

impl std::error::Error for ShmqError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShmqError::Os { source, .. } => Some(source),
            ShmqError::Name(_) => None,
            ShmqError::Logic(_) => None,
        }
    }
}

impl From<io::Error> for ShmqError {
    fn from(err: io::Error) -> Self {
        ShmqError::Os {
            op: "io",
            source: err,
        }
    }
}
