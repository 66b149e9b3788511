use crate::buffer::BufferError;
use crate::parser::ParseError;
use std::io;
use thiserror::Error;

/// Central error type for the etude engine.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error during HTTP request parsing.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Cursor misuse on a connection buffer.
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// The connection table reached its configured ceiling.
    #[error("connection table is full")]
    TableFull,

    /// Invalid or unreadable process configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Credential store failure.
    #[error("credential store error: {0}")]
    Auth(String),
}

pub type EtudeResult<T> = Result<T, EtudeError>;

/// `WouldBlock` and `Interrupted` mean "no progress now", not failure.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
