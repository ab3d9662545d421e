//! Error types shared by every component of the client.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The credential was rejected (`401`/`403`).
    #[error("unauthorized")]
    Unauthorized,

    /// Transport, DNS or timeout failure.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a non-ok status and a human-readable message.
    #[error("{0}")]
    Rejected(String),

    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// A live channel send was attempted while not joined.
    #[error("live channel unavailable")]
    ChannelUnavailable,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("no peer selected")]
    NoActivePeer,
    #[error("not signed in")]
    NotAuthenticated,
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.status().is_some_and(|s| s.as_u16() == 401 || s.as_u16() == 403) {
            Error::Unauthorized
        } else {
            Error::Network(e.to_string())
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Config(e.to_string())
    }
}

impl Error {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Unauthorized)
    }
}
