//! Transport seam between proxies and the network.
//!
//! A [`Connection`] carries one [`Invocation`] at a time and returns the
//! matching [`Reply`]. [`Connector`] opens connections to an endpoint; the
//! default one speaks the framed protocol in [`protocol`] over TCP.

pub mod framed;
pub mod protocol;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;

use crate::error::{RemoteError, TransportError};
use crate::model::WireObject;

pub use framed::FramedConnection;

/// An operation addressed to the remote object named by `identity`.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub identity: String,
    pub operation: Operation,
}

impl Invocation {
    pub fn new(identity: impl Into<String>, operation: Operation) -> Self {
        Self {
            identity: identity.into(),
            operation,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Does the target implement `type_id`?
    IsA { type_id: String },
    CreateSession { username: String, password: String },
    /// Router-side teardown. Servers drop the connection instead of replying.
    DestroySession,
    /// Close a session or a raw file store.
    Close,
    GetUpdateService,
    CreateRawFileStore,
    SaveAndReturnObject { object: WireObject },
    SetFileId { id: i64 },
    Write { offset: u64, data: Bytes },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::IsA { .. } => "is_a",
            Operation::CreateSession { .. } => "create_session",
            Operation::DestroySession => "destroy_session",
            Operation::Close => "close",
            Operation::GetUpdateService => "get_update_service",
            Operation::CreateRawFileStore => "create_raw_file_store",
            Operation::SaveAndReturnObject { .. } => "save_and_return_object",
            Operation::SetFileId { .. } => "set_file_id",
            Operation::Write { .. } => "write",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Unit,
    Bool(bool),
    /// Identity of a remote object reachable through the same router.
    Proxy(String),
    Object(WireObject),
    Fault(RemoteError),
}

/// One established link to a router endpoint.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<Reply, TransportError>;

    /// Tear the link down. Must not block.
    fn shutdown(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Connection>, TransportError>;
}

/// Framed protocol over plain TCP; `endpoint` is `host:port`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|source| TransportError::ConnectionRefused {
                endpoint: endpoint.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        tracing::debug!("connected to {}", endpoint);

        let conn = FramedConnection::connect(stream).await?;
        Ok(Arc::new(conn))
    }
}
