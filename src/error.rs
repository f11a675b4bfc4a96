//! Error types for searchfabric

use std::fmt;

/// Result type alias for searchfabric operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for searchfabric
#[derive(Debug)]
pub enum Error {
    /// IO errors
    Io(std::io::Error),
    /// Embedded SQL store errors
    Sqlite(rusqlite::Error),
    /// Outbound HTTP errors
    Http(reqwest::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Parse failure, missing parameter, unsupported MIME
    BadRequest(String),
    /// Authentication missing or invalid
    Unauthorized(String),
    /// Role insufficient
    Forbidden(String),
    /// Entity does not exist
    NotFound(String),
    /// Delimiter change, part overlap, duplicate name
    Conflict(String),
    /// Backend could not start or failed during a search
    Engine(String),
    /// Per-record failure reported inline in a stream
    Stream(String),
    /// Operation timed out
    Timeout,
    /// Internal error
    Internal(String),
}

impl Error {
    /// HTTP status code for this error class.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::BadRequest(_) | Error::Serialization(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Timeout => 504,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => 404,
                std::io::ErrorKind::PermissionDenied => 403,
                _ => 500,
            },
            _ => 500,
        }
    }

    /// Check if the error is a "not found" condition.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Sqlite(e) => Some(e),
            Error::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Sqlite(e) => write!(f, "Database error: {}", e),
            Error::Http(e) => write!(f, "HTTP error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::BadRequest(msg) => write!(f, "{}", msg),
            Error::Unauthorized(msg) => write!(f, "{}", msg),
            Error::Forbidden(msg) => write!(f, "{}", msg),
            Error::NotFound(msg) => write!(f, "{}", msg),
            Error::Conflict(msg) => write!(f, "{}", msg),
            Error::Engine(msg) => write!(f, "{}", msg),
            Error::Stream(msg) => write!(f, "{}", msg),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Sqlite(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else {
            Error::Http(e)
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Self {
        Error::BadRequest(format!("bad regular expression: {}", e))
    }
}

impl From<glob::PatternError> for Error {
    fn from(e: glob::PatternError) -> Self {
        Error::BadRequest(format!("bad glob pattern: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(Error::BadRequest("x".into()).status_code(), 400);
        assert_eq!(Error::Conflict("x".into()).status_code(), 409);
        assert_eq!(Error::Engine("x".into()).status_code(), 500);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(Error::from(io).status_code(), 404);
    }
}
