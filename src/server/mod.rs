//! Loopback backend: a minimal in-process implementation of the router,
//! session, update and raw file services.
//!
//! Used by the test-suite and by `blitz-client serve`. It keeps every
//! uploaded byte in memory and records an ordered event log so callers can
//! check exactly what reached the remote side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::checksum;
use crate::error::{RemoteError, TransportError};
use crate::model::{OriginalFile, WireObject};
use crate::proxy::{RawFileStorePrx, RouterPrx, ServiceFactoryPrx, TypedProxy, UpdateServicePrx};
use crate::transport::protocol::{
    self as wire, negotiate_version, Hello, MessageType, VersionNegotiationResult, MAX_FRAME_SIZE,
};
use crate::transport::{Connection, Connector, Invocation, Operation, Reply};

pub const ROUTER_IDENTITY: &str = "blitz/router";
/// A reachable object that is not a router.
pub const LOCATOR_IDENTITY: &str = "blitz/locator";
const OBJECT_TYPE_ID: &str = "::blitz::Object";
/// Write limit for file records that carry no size.
const MAX_UNSIZED_FILE: u64 = MAX_FRAME_SIZE as u64;

/// One client connection. `destroy_session` only tears down the sessions
/// created over the connection that sends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// Observable side effects, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    SessionCreated { session: String, username: String },
    SessionClosed { session: String },
    SessionDestroyed,
    ObjectSaved { type_id: String, id: i64 },
    FileIdSet { store: String, id: i64 },
    Write { store: String, offset: u64, len: usize },
    StoreClosed { store: String, id: Option<i64> },
}

/// What the transport should do after handling an invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Reply(Reply),
    /// Drop the connection without replying.
    Disconnect,
}

#[derive(Debug)]
enum Servant {
    Session {
        connection: ConnectionId,
    },
    Update {
        session: String,
    },
    RawFileStore {
        session: String,
        file_id: Option<i64>,
    },
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Session,
    Update,
    RawFileStore,
}

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<String, String>,
    servants: HashMap<String, Servant>,
    objects: HashMap<i64, WireObject>,
    contents: HashMap<i64, Vec<u8>>,
    events: Vec<ServerEvent>,
    next_id: i64,
    next_servant: u64,
    next_connection: u64,
}

/// Shared backend state; clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct LoopbackServer {
    state: Arc<Mutex<State>>,
}

fn fault(err: RemoteError) -> Dispatch {
    Dispatch::Reply(Reply::Fault(err))
}

fn ok(reply: Reply) -> Dispatch {
    Dispatch::Reply(reply)
}

impl LoopbackServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.lock().accounts.insert(username.into(), password.into());
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-dispatch.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn events(&self) -> Vec<ServerEvent> {
        self.lock().events.clone()
    }

    pub fn object(&self, id: i64) -> Option<WireObject> {
        self.lock().objects.get(&id).cloned()
    }

    pub fn file_content(&self, id: i64) -> Option<Vec<u8>> {
        self.lock().contents.get(&id).cloned()
    }

    /// Sessions created and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.lock()
            .servants
            .values()
            .filter(|s| matches!(s, Servant::Session { .. }))
            .count()
    }

    /// Live servants of every kind: sessions, update services and stores.
    pub fn servant_count(&self) -> usize {
        self.lock().servants.len()
    }

    /// Register a new client connection.
    pub fn connect(&self) -> ConnectionId {
        let mut state = self.lock();
        state.next_connection += 1;
        ConnectionId(state.next_connection)
    }

    pub fn dispatch(&self, connection: ConnectionId, invocation: Invocation) -> Dispatch {
        let mut state = self.lock();
        let Invocation {
            identity,
            operation,
        } = invocation;

        if identity == ROUTER_IDENTITY {
            return state.router(connection, operation);
        }
        if identity == LOCATOR_IDENTITY {
            return match operation {
                Operation::IsA { type_id } => ok(Reply::Bool(type_id == OBJECT_TYPE_ID)),
                other => fault(RemoteError::OperationNotExist(other.name().into())),
            };
        }
        state.servant(&identity, operation)
    }

    /// Serve one framed connection until the peer disconnects or a session
    /// is destroyed.
    pub async fn serve<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (msg_type, payload) = wire::read_frame(&mut stream).await?;
        if msg_type != MessageType::Hello {
            anyhow::bail!("Expected HELLO, got {:?}", msg_type);
        }
        let hello = Hello::decode(payload)?;
        wire::write_frame(&mut stream, &Hello::new().encode()).await?;
        if let VersionNegotiationResult::TooOld { .. } | VersionNegotiationResult::TooNew { .. } =
            negotiate_version(hello.version)
        {
            anyhow::bail!("client protocol version {} not supported", hello.version);
        }
        let connection = self.connect();

        loop {
            let (msg_type, payload) = match wire::read_frame(&mut stream).await {
                Ok(frame) => frame,
                Err(TransportError::ConnectionLost(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            if msg_type != MessageType::Request {
                anyhow::bail!("Unexpected message: {:?}", msg_type);
            }

            let invocation = wire::decode_request(payload)?;
            match self.dispatch(connection, invocation) {
                Dispatch::Reply(reply) => {
                    wire::write_frame(&mut stream, &wire::encode_reply(&reply)?).await?;
                }
                Dispatch::Disconnect => return Ok(()),
            }
        }
    }

    /// Accept TCP connections on `listener` and serve each on its own task.
    pub async fn listen(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("loopback server listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                tracing::debug!("accepted {}", peer);
                if let Err(e) = server.serve(stream).await {
                    tracing::warn!("connection from {} failed: {:#}", peer, e);
                }
            });
        }
    }
}

impl State {
    fn servant_id(&mut self, prefix: &str) -> String {
        self.next_servant += 1;
        format!("{}-{}", prefix, self.next_servant)
    }

    fn router(&mut self, connection: ConnectionId, operation: Operation) -> Dispatch {
        match operation {
            Operation::IsA { type_id } => ok(Reply::Bool(
                type_id == RouterPrx::TYPE_ID || type_id == OBJECT_TYPE_ID,
            )),
            Operation::CreateSession { username, password } => {
                match self.accounts.get(&username) {
                    Some(expected) if *expected == password => {}
                    _ => {
                        return fault(RemoteError::PermissionDenied(format!(
                            "authentication failed for {}",
                            username
                        )))
                    }
                }
                let session = self.servant_id("session");
                self.servants
                    .insert(session.clone(), Servant::Session { connection });
                self.events.push(ServerEvent::SessionCreated {
                    session: session.clone(),
                    username,
                });
                ok(Reply::Proxy(session))
            }
            Operation::DestroySession => {
                let owned: Vec<String> = self
                    .servants
                    .iter()
                    .filter(|(_, s)| matches!(s, Servant::Session { connection: c } if *c == connection))
                    .map(|(id, _)| id.clone())
                    .collect();
                for session in &owned {
                    self.remove_session(session);
                }
                self.events.push(ServerEvent::SessionDestroyed);
                Dispatch::Disconnect
            }
            other => fault(RemoteError::OperationNotExist(other.name().into())),
        }
    }

    fn session_open(&self, session: &str) -> bool {
        matches!(self.servants.get(session), Some(Servant::Session { .. }))
    }

    /// Drop a session together with every service it handed out.
    fn remove_session(&mut self, session: &str) {
        self.servants.retain(|id, servant| match servant {
            Servant::Session { .. } => id != session,
            Servant::Update { session: owner } | Servant::RawFileStore { session: owner, .. } => owner != session,
        });
    }

    fn servant(&mut self, identity: &str, operation: Operation) -> Dispatch {
        let Some(servant) = self.servants.get(identity) else {
            return fault(RemoteError::ObjectNotExist(identity.into()));
        };

        let (owner, kind) = match servant {
            Servant::Session { .. } => (identity.to_string(), Kind::Session),
            Servant::Update { session } => (session.clone(), Kind::Update),
            Servant::RawFileStore { session, .. } => (session.clone(), Kind::RawFileStore),
        };
        if !self.session_open(&owner) {
            return fault(RemoteError::ObjectNotExist(identity.into()));
        }

        match kind {
            Kind::Session => self.session(identity, operation),
            Kind::Update => self.update(operation),
            Kind::RawFileStore => self.raw_file_store(identity, operation),
        }
    }

    fn session(&mut self, identity: &str, operation: Operation) -> Dispatch {
        match operation {
            Operation::IsA { type_id } => ok(Reply::Bool(
                type_id == ServiceFactoryPrx::TYPE_ID || type_id == OBJECT_TYPE_ID,
            )),
            Operation::Close => {
                self.remove_session(identity);
                self.events.push(ServerEvent::SessionClosed {
                    session: identity.to_string(),
                });
                ok(Reply::Unit)
            }
            Operation::GetUpdateService => {
                let id = format!("{}/update", identity);
                self.servants
                    .entry(id.clone())
                    .or_insert_with(|| Servant::Update {
                        session: identity.to_string(),
                    });
                ok(Reply::Proxy(id))
            }
            Operation::CreateRawFileStore => {
                let id = format!("{}/{}", identity, self.servant_id("rawfile"));
                self.servants.insert(
                    id.clone(),
                    Servant::RawFileStore {
                        session: identity.to_string(),
                        file_id: None,
                    },
                );
                ok(Reply::Proxy(id))
            }
            other => fault(RemoteError::OperationNotExist(other.name().into())),
        }
    }

    fn update(&mut self, operation: Operation) -> Dispatch {
        match operation {
            Operation::IsA { type_id } => ok(Reply::Bool(type_id == UpdateServicePrx::TYPE_ID)),
            Operation::SaveAndReturnObject { mut object } => {
                let id = match object.id() {
                    Some(id) => id,
                    None => {
                        self.next_id += 1;
                        self.next_id
                    }
                };
                object.fields.insert("id".into(), Value::from(id));
                if object.type_id == OriginalFile::TYPE_ID {
                    self.contents.entry(id).or_default();
                }
                self.events.push(ServerEvent::ObjectSaved {
                    type_id: object.type_id.clone(),
                    id,
                });
                self.objects.insert(id, object.clone());
                ok(Reply::Object(object))
            }
            other => fault(RemoteError::OperationNotExist(other.name().into())),
        }
    }

    fn raw_file_store(&mut self, identity: &str, operation: Operation) -> Dispatch {
        let Some(Servant::RawFileStore { file_id, .. }) = self.servants.get(identity) else {
            return fault(RemoteError::ObjectNotExist(identity.into()));
        };
        let file_id = *file_id;

        match operation {
            Operation::IsA { type_id } => ok(Reply::Bool(type_id == RawFileStorePrx::TYPE_ID)),
            Operation::SetFileId { id } => {
                let is_file = self
                    .objects
                    .get(&id)
                    .is_some_and(|o| o.type_id == OriginalFile::TYPE_ID);
                if !is_file {
                    return fault(RemoteError::ObjectNotExist(format!("original file {}", id)));
                }
                if let Some(Servant::RawFileStore { file_id, .. }) = self.servants.get_mut(identity) {
                    *file_id = Some(id);
                }
                // A store rewrites the file from scratch.
                self.contents.insert(id, Vec::new());
                self.events.push(ServerEvent::FileIdSet {
                    store: identity.to_string(),
                    id,
                });
                ok(Reply::Unit)
            }
            Operation::Write { offset, data } => {
                let Some(id) = file_id else {
                    return fault(RemoteError::Server("no file id set".into()));
                };
                let limit = self
                    .objects
                    .get(&id)
                    .and_then(|o| o.fields.get("size"))
                    .and_then(Value::as_u64)
                    .unwrap_or(MAX_UNSIZED_FILE);
                let range = offset
                    .checked_add(data.len() as u64)
                    .filter(|end| *end <= limit)
                    .and_then(|end| Some((usize::try_from(offset).ok()?, usize::try_from(end).ok()?)));
                let Some((start, end)) = range else {
                    return fault(RemoteError::Server(format!(
                        "write of {} bytes at offset {} exceeds file {} limit of {} bytes",
                        data.len(),
                        offset,
                        id,
                        limit
                    )));
                };

                let content = self.contents.entry(id).or_default();
                if content.len() < end {
                    content.resize(end, 0);
                }
                content[start..end].copy_from_slice(&data);
                self.events.push(ServerEvent::Write {
                    store: identity.to_string(),
                    offset,
                    len: data.len(),
                });
                ok(Reply::Unit)
            }
            Operation::Close => {
                self.servants.remove(identity);
                self.events.push(ServerEvent::StoreClosed {
                    store: identity.to_string(),
                    id: file_id,
                });
                match file_id {
                    Some(id) => self.verify(id),
                    None => ok(Reply::Unit),
                }
            }
            other => fault(RemoteError::OperationNotExist(other.name().into())),
        }
    }

    /// Compare stored content with the size and checksum on the record.
    fn verify(&self, id: i64) -> Dispatch {
        let content = self.contents.get(&id).map(Vec::as_slice).unwrap_or_default();
        let Some(record) = self.objects.get(&id) else {
            return ok(Reply::Unit);
        };

        if let Some(size) = record.fields.get("size").and_then(Value::as_u64) {
            if size != content.len() as u64 {
                return fault(RemoteError::ChecksumMismatch(format!(
                    "file {}: expected {} bytes, received {}",
                    id,
                    size,
                    content.len()
                )));
            }
        }
        if let Some(expected) = record.string_field("checksum") {
            let actual = checksum::digest(content);
            if expected != actual {
                return fault(RemoteError::ChecksumMismatch(format!(
                    "file {}: expected {}, received {}",
                    id, expected, actual
                )));
            }
        }
        ok(Reply::Unit)
    }
}

/// In-process connection straight into a [`LoopbackServer`].
pub struct LoopbackConnection {
    server: LoopbackServer,
    id: ConnectionId,
    closed: AtomicBool,
}

impl LoopbackConnection {
    pub fn new(server: LoopbackServer) -> Self {
        let id = server.connect();
        Self {
            server,
            id,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn invoke(&self, invocation: Invocation) -> std::result::Result<Reply, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost("connection closed".into()));
        }
        match self.server.dispatch(self.id, invocation) {
            Dispatch::Reply(reply) => Ok(reply),
            Dispatch::Disconnect => {
                self.closed.store(true, Ordering::SeqCst);
                Err(TransportError::ConnectionLost("server closed the connection".into()))
            }
        }
    }

    fn shutdown(&self) -> std::result::Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`LoopbackConnection`]s regardless of endpoint.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    server: LoopbackServer,
}

impl LoopbackConnector {
    pub fn new(server: LoopbackServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, _endpoint: &str) -> std::result::Result<Arc<dyn Connection>, TransportError> {
        Ok(Arc::new(LoopbackConnection::new(self.server.clone())))
    }
}
