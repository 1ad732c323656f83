use std::error;
use std::fmt;
use std::io;

pub type GateResult<T> = Result<T, GateError>;

#[derive(Debug)]
pub enum GateError {
    // Catch-all for internal errors whose messages we log but do not
    // leak to the client.
    Internal(String),

    Io(io::Error),

    /// Malformed or unroutable client request; maps to HTTP 400.
    BadRequest(String),

    /// Admin credentials missing or wrong; maps to HTTP 401.
    Unauthorized(String),

    /// Path escapes the file-serving root; maps to HTTP 403.
    Forbidden(String),

    /// Missing file or resource; maps to HTTP 404.
    NotFound(String),

    /// Protocol violation on an established websocket.
    WebSocket(String),
}

impl GateError {
    /// The HTTP status this error degrades to when it surfaces before
    /// a websocket upgrade.
    pub fn http_status(&self) -> u16 {
        match self {
            GateError::BadRequest(_) => 400,
            GateError::Unauthorized(_) => 401,
            GateError::Forbidden(_) => 403,
            GateError::NotFound(_) => 404,
            _ => 500,
        }
    }
}

impl error::Error for GateError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            GateError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Internal(ref m) => write!(f, "{m}"),
            Self::Io(ref e) => write!(f, "I/O error: {e}"),
            Self::BadRequest(ref m) => write!(f, "BadRequest: {m}"),
            Self::Unauthorized(ref m) => write!(f, "Unauthorized: {m}"),
            Self::Forbidden(ref m) => write!(f, "Forbidden: {m}"),
            Self::NotFound(ref m) => write!(f, "NotFound: {m}"),
            Self::WebSocket(ref m) => write!(f, "WebSocket: {m}"),
        }
    }
}

impl From<String> for GateError {
    fn from(msg: String) -> Self {
        GateError::Internal(msg)
    }
}

impl From<&str> for GateError {
    fn from(msg: &str) -> Self {
        GateError::from(msg.to_string())
    }
}

impl From<io::Error> for GateError {
    fn from(err: io::Error) -> Self {
        GateError::Io(err)
    }
}
