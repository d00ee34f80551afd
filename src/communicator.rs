//! The communicator: properties, the router connection and the object
//! factory table.
//!
//! Initialization never touches the network. The connection to the router
//! endpoint is opened on the first invocation and shared by every proxy,
//! since all traffic is routed through the same gateway.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::{self, Properties};
use crate::error::{ClientError, Result, TransportError};
use crate::factory::TypeFactory;
use crate::model::{RemoteObject, WireObject};
use crate::proxy::ObjectPrx;
use crate::transport::{Connection, Connector, Invocation, Reply, TcpConnector};

/// Everything a communicator is built from besides the argument vector.
#[derive(Clone, Default)]
pub struct InitData {
    pub properties: Properties,
    /// Replaces the default TCP connector.
    pub connector: Option<Arc<dyn Connector>>,
}

impl InitData {
    pub fn with_properties(properties: Properties) -> Self {
        Self {
            properties,
            connector: None,
        }
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }
}

impl fmt::Debug for InitData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitData")
            .field("properties", &self.properties)
            .field("connector", &self.connector.as_ref().map(|_| "custom"))
            .finish()
    }
}

/// Parsed `<identity>@<endpoint>` proxy string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterAddress {
    pub identity: String,
    pub endpoint: String,
}

impl RouterAddress {
    pub fn parse(s: &str) -> Result<Self> {
        let (identity, endpoint) = s
            .trim()
            .split_once('@')
            .ok_or_else(|| ClientError::Initialization(format!("invalid router proxy '{}'", s)))?;
        let identity = identity.trim();
        let endpoint = endpoint.trim();
        if identity.is_empty() || endpoint.is_empty() {
            return Err(ClientError::Initialization(format!(
                "invalid router proxy '{}'",
                s
            )));
        }
        Ok(Self {
            identity: identity.to_string(),
            endpoint: endpoint.to_string(),
        })
    }
}

/// Cheap handle; clones share the same runtime state.
#[derive(Clone)]
pub struct Communicator {
    inner: Arc<Inner>,
}

struct Inner {
    properties: Properties,
    router: Option<RouterAddress>,
    connector: Arc<dyn Connector>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    factories: RwLock<HashMap<String, Arc<dyn TypeFactory>>>,
    destroyed: AtomicBool,
}

impl Communicator {
    /// Resolve properties from `args` and `init`, and validate the router proxy.
    pub fn initialize(args: &[String], init: InitData) -> Result<Self> {
        let properties = Properties::resolve(args, init.properties)?;

        let router = match properties.get(config::DEFAULT_ROUTER) {
            Some(s) if !s.trim().is_empty() => Some(RouterAddress::parse(s)?),
            _ => None,
        };

        let connector = init
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector) as Arc<dyn Connector>);

        tracing::debug!(
            router = ?router.as_ref().map(|r| r.endpoint.as_str()),
            "communicator initialized with {} properties",
            properties.len()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                properties,
                router,
                connector,
                connection: Mutex::new(None),
                factories: RwLock::new(HashMap::new()),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn properties(&self) -> &Properties {
        &self.inner.properties
    }

    /// Untyped proxy for the configured router, if any.
    pub fn default_router(&self) -> Option<ObjectPrx> {
        self.inner
            .router
            .as_ref()
            .map(|r| ObjectPrx::new(self.clone(), r.identity.clone()))
    }

    pub fn find_object_factory(&self, type_id: &str) -> Option<Arc<dyn TypeFactory>> {
        self.inner
            .factories
            .read()
            .ok()
            .and_then(|f| f.get(type_id).cloned())
    }

    /// Register `factory` for `type_id` unless one is already present.
    /// Returns whether it was added.
    pub fn add_object_factory(&self, factory: Arc<dyn TypeFactory>, type_id: &str) -> bool {
        let Ok(mut factories) = self.inner.factories.write() else {
            return false;
        };
        if factories.contains_key(type_id) {
            return false;
        }
        factories.insert(type_id.to_string(), factory);
        true
    }

    /// Build a typed local object from its wire form.
    pub fn unmarshal(&self, wire: WireObject) -> Result<Box<dyn RemoteObject>> {
        let factory = self
            .find_object_factory(&wire.type_id)
            .ok_or_else(|| ClientError::UnknownType(wire.type_id.clone()))?;
        let mut object = factory.create(&wire.type_id)?;
        object.read_fields(&wire.fields)?;
        Ok(object)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Shut the connection down and release the factories. Only the first
    /// call does anything.
    pub fn destroy(&self) -> std::result::Result<(), TransportError> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!("destroying communicator");

        let factories: Vec<Arc<dyn TypeFactory>> = match self.inner.factories.write() {
            Ok(mut map) => map.drain().map(|(_, f)| f).collect(),
            Err(_) => Vec::new(),
        };
        // One factory is usually registered under many ids.
        let mut seen: Vec<Arc<dyn TypeFactory>> = Vec::new();
        for factory in factories {
            if !seen.iter().any(|s| Arc::ptr_eq(s, &factory)) {
                factory.destroy();
                seen.push(factory);
            }
        }

        let connection = self
            .inner
            .connection
            .lock()
            .map_err(|_| TransportError::Protocol("connection state poisoned".into()))?
            .take();
        match connection {
            Some(conn) => conn.shutdown(),
            None => Ok(()),
        }
    }

    async fn connection(&self) -> std::result::Result<Arc<dyn Connection>, TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::CommunicatorDestroyed);
        }
        if let Some(conn) = self.current_connection()? {
            return Ok(conn);
        }

        let router = self.inner.router.as_ref().ok_or_else(|| {
            TransportError::Protocol("no router endpoint configured".into())
        })?;
        let conn = self.inner.connector.connect(&router.endpoint).await?;

        let mut slot = self
            .inner
            .connection
            .lock()
            .map_err(|_| TransportError::Protocol("connection state poisoned".into()))?;
        if self.is_destroyed() {
            let _ = conn.shutdown();
            return Err(TransportError::CommunicatorDestroyed);
        }
        Ok(slot.get_or_insert(conn).clone())
    }

    fn current_connection(&self) -> std::result::Result<Option<Arc<dyn Connection>>, TransportError> {
        let slot = self
            .inner
            .connection
            .lock()
            .map_err(|_| TransportError::Protocol("connection state poisoned".into()))?;
        Ok(slot.clone())
    }

    /// Send one invocation; remote faults come back as `ClientError::Remote`.
    pub async fn invoke(&self, invocation: Invocation) -> Result<Reply> {
        let op = invocation.operation.name();
        let target = invocation.identity.clone();
        let conn = self.connection().await?;

        tracing::trace!("invoking {} on {}", op, target);
        match conn.invoke(invocation).await? {
            Reply::Fault(err) => {
                tracing::debug!("{} on {} raised {}", op, target, err);
                Err(ClientError::Remote(err))
            }
            reply => Ok(reply),
        }
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("router", &self.inner.router)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
