//! Error types for blitz-client.
//!
//! Everything a caller can observe is a [`ClientError`]. Transport and remote
//! failures keep their own enums so teardown code can match on the exact kind
//! it is allowed to swallow.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Failures of the connection itself, raised below the object layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection dropped while a call was outstanding, or was already gone.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("connection refused by {endpoint}: {source}")]
    ConnectionRefused {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("communicator has been destroyed")]
    CommunicatorDestroyed,

    /// Malformed frame or a reply that does not fit the request.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<io::Error> for TransportError {
    // Any I/O failure on an established connection means the peer is gone.
    fn from(err: io::Error) -> Self {
        TransportError::ConnectionLost(err.to_string())
    }
}

/// Fault codes carried back from the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FaultCode {
    PermissionDenied = 1,
    ObjectNotExist = 2,
    OperationNotExist = 3,
    ChecksumMismatch = 4,
    Server = 5,
}

impl FaultCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::PermissionDenied),
            2 => Some(Self::ObjectNotExist),
            3 => Some(Self::OperationNotExist),
            4 => Some(Self::ChecksumMismatch),
            5 => Some(Self::Server),
            _ => None,
        }
    }
}

/// An exception raised by the remote object that handled a call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("object does not exist: {0}")]
    ObjectNotExist(String),

    #[error("operation does not exist: {0}")]
    OperationNotExist(String),

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("server error: {0}")]
    Server(String),
}

impl RemoteError {
    pub fn code(&self) -> FaultCode {
        match self {
            RemoteError::PermissionDenied(_) => FaultCode::PermissionDenied,
            RemoteError::ObjectNotExist(_) => FaultCode::ObjectNotExist,
            RemoteError::OperationNotExist(_) => FaultCode::OperationNotExist,
            RemoteError::ChecksumMismatch(_) => FaultCode::ChecksumMismatch,
            RemoteError::Server(_) => FaultCode::Server,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RemoteError::PermissionDenied(m)
            | RemoteError::ObjectNotExist(m)
            | RemoteError::OperationNotExist(m)
            | RemoteError::ChecksumMismatch(m)
            | RemoteError::Server(m) => m,
        }
    }

    pub fn from_code(code: FaultCode, message: String) -> Self {
        match code {
            FaultCode::PermissionDenied => RemoteError::PermissionDenied(message),
            FaultCode::ObjectNotExist => RemoteError::ObjectNotExist(message),
            FaultCode::OperationNotExist => RemoteError::OperationNotExist(message),
            FaultCode::ChecksumMismatch => RemoteError::ChecksumMismatch(message),
            FaultCode::Server => RemoteError::Server(message),
        }
    }
}

/// Top of the client error hierarchy.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The communicator could not be created.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// A required value (username, password, format) is missing.
    #[error("{0}")]
    Configuration(String),

    /// No default router, or the router proxy is not a router.
    #[error("{0}")]
    Routing(String),

    /// Session creation failed, returned the wrong type, or no session exists.
    #[error("{message}")]
    Session {
        message: String,
        #[source]
        source: Option<RemoteError>,
    },

    #[error("File does not exist: {}", .0.display())]
    NotFound(PathBuf),

    /// Deserialization met a type id nobody registered a factory for.
    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A reply had the wrong shape or an object failed to unmarshal.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("upload wrote {written} bytes but the file had {expected}")]
    SizeMismatch { expected: u64, written: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    pub fn session(message: impl Into<String>) -> Self {
        ClientError::Session {
            message: message.into(),
            source: None,
        }
    }

    /// True for the "connection lost" condition that session teardown expects.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(TransportError::ConnectionLost(_))
        )
    }
}
