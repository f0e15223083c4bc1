use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::sftp::protocol::StatusCode;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Authentication failed")]
    AuthenticationFailure,

    #[error("Path escapes the served root: {0}")]
    PathEscape(String),

    #[error("Unknown handle")]
    UnknownHandle,

    #[error("Handle does not refer to a regular file")]
    NotAFile,

    #[error("Handle does not refer to a directory")]
    NotADirectory,

    #[error("Write access is not permitted")]
    WriteDenied,

    #[error("Handle identifiers exhausted for this session")]
    HandleExhausted,

    #[error("Malformed packet: {0}")]
    Protocol(String),

    #[error("Remote returned {code:?}: {message}")]
    Status { code: StatusCode, message: String },

    #[error("Host key error: {0}")]
    Key(#[from] russh_keys::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Server failed to start: {0}")]
    Startup(Arc<Error>),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Errors that end the session instead of producing a status reply.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::HandleExhausted | Error::Protocol(_) | Error::Ssh(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
