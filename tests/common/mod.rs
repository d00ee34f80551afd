//! Shared fixtures: a connector that records every invocation, answers from
//! a [`LoopbackServer`] and lets a test replace individual replies.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use blitz_client::config;
use blitz_client::logging::init_test_logging;
use blitz_client::server::{ConnectionId, Dispatch, LoopbackServer, ROUTER_IDENTITY};
use blitz_client::transport::{Connection, Connector, Invocation, Operation, Reply};
use blitz_client::{Client, InitData, Properties, TransportError};

pub const USER: &str = "root";
pub const PASS: &str = "secret";

type Outcome = Arc<dyn Fn() -> Result<Reply, TransportError> + Send + Sync>;

struct Override {
    op: &'static str,
    /// Matching calls to let through before this override fires.
    skip: usize,
    outcome: Outcome,
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<Invocation>>,
    overrides: Mutex<Vec<Override>>,
    connects: AtomicUsize,
    shutdowns: AtomicUsize,
}

#[derive(Clone)]
pub struct ScriptedConnector {
    server: LoopbackServer,
    shared: Arc<Shared>,
}

impl ScriptedConnector {
    pub fn new(server: LoopbackServer) -> Self {
        Self {
            server,
            shared: Arc::default(),
        }
    }

    /// Replace the reply to every call of `op` from the `skip + 1`th on.
    pub fn fail_on<F>(&self, op: &'static str, skip: usize, outcome: F)
    where
        F: Fn() -> Result<Reply, TransportError> + Send + Sync + 'static,
    {
        self.shared.overrides.lock().unwrap().push(Override {
            op,
            skip,
            outcome: Arc::new(outcome),
        });
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn op_names(&self) -> Vec<&'static str> {
        self.calls().iter().map(|c| c.operation.name()).collect()
    }

    pub fn writes(&self) -> Vec<(u64, usize)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c.operation {
                Operation::Write { offset, data } => Some((offset, data.len())),
                _ => None,
            })
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shared.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _endpoint: &str) -> Result<Arc<dyn Connection>, TransportError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedConnection {
            id: self.server.connect(),
            server: self.server.clone(),
            shared: self.shared.clone(),
        }))
    }
}

struct ScriptedConnection {
    id: ConnectionId,
    server: LoopbackServer,
    shared: Arc<Shared>,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn invoke(&self, invocation: Invocation) -> Result<Reply, TransportError> {
        self.shared.calls.lock().unwrap().push(invocation.clone());

        let scripted = {
            let mut overrides = self.shared.overrides.lock().unwrap();
            overrides
                .iter_mut()
                .find(|o| o.op == invocation.operation.name())
                .and_then(|o| {
                    if o.skip > 0 {
                        o.skip -= 1;
                        None
                    } else {
                        Some(o.outcome.clone())
                    }
                })
        };
        if let Some(outcome) = scripted {
            return outcome();
        }

        match self.server.dispatch(self.id, invocation) {
            Dispatch::Reply(reply) => Ok(reply),
            Dispatch::Disconnect => Err(TransportError::ConnectionLost("server closed the connection".into())),
        }
    }

    fn shutdown(&self) -> Result<(), TransportError> {
        self.shared.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn server() -> LoopbackServer {
    init_test_logging();
    LoopbackServer::new().with_account(USER, PASS)
}

/// Properties pointing the default router at `identity`.
pub fn router_properties(identity: &str) -> Properties {
    [(config::DEFAULT_ROUTER, format!("{}@loopback:4064", identity))]
        .into_iter()
        .collect()
}

pub fn client_for(connector: &ScriptedConnector, properties: Properties) -> Client {
    let init = InitData::with_properties(properties).connector(Arc::new(connector.clone()));
    Client::new(&[], init).unwrap()
}

/// A fresh client wired to `server` with the standard router.
pub fn client(server: &LoopbackServer) -> (Client, ScriptedConnector) {
    let connector = ScriptedConnector::new(server.clone());
    let client = client_for(&connector, router_properties(ROUTER_IDENTITY));
    (client, connector)
}

pub async fn logged_in(server: &LoopbackServer) -> (Client, ScriptedConnector) {
    let (mut client, connector) = client(server);
    client.create_session(Some(USER), Some(PASS)).await.unwrap();
    (client, connector)
}
