use std::io;

/// Central error type for the ember engine.
#[derive(Debug)]
pub enum EmberError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Database driver failure.
    Db(String),
    /// Unrecoverable start-up failure (bind, asset root, log directory).
    Init(String),
    /// Generic or miscellaneous error.
    Other(String),
}

impl std::fmt::Display for EmberError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmberError::Io(e) => write!(f, "I/O error: {}", e),
            EmberError::Db(msg) => write!(f, "Database error: {}", msg),
            EmberError::Init(msg) => write!(f, "Init error: {}", msg),
            EmberError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for EmberError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EmberError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EmberError {
    fn from(e: io::Error) -> Self {
        EmberError::Io(e)
    }
}

impl From<ember_pg::PgError> for EmberError {
    fn from(e: ember_pg::PgError) -> Self {
        EmberError::Db(e.to_string())
    }
}

pub type EmberResult<T> = Result<T, EmberError>;
