/// Errors returned by ember-pg operations.
#[derive(Debug)]
pub enum PgError {
    /// I/O error from the underlying socket.
    Io(std::io::Error),
    /// Protocol violation or unexpected message from the server.
    Protocol(String),
    /// Authentication failure, or an auth method this client does not speak.
    Auth(String),
    /// Server-sent error response (severity, code, message).
    Server {
        severity: String,
        code: String,
        message: String,
    },
    /// Connection is closed or in an invalid state.
    ConnectionClosed,
}

impl From<std::io::Error> for PgError {
    fn from(e: std::io::Error) -> Self {
        PgError::Io(e)
    }
}

impl std::fmt::Display for PgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PgError::Io(e) => write!(f, "I/O error: {}", e),
            PgError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            PgError::Auth(msg) => write!(f, "Auth error: {}", msg),
            PgError::Server {
                severity,
                code,
                message,
            } => write!(f, "PG {}: {} ({})", severity, message, code),
            PgError::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for PgError {}

pub type PgResult<T> = Result<T, PgError>;
