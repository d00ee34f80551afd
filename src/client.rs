//! Central entry point: communicator bootstrap, login through the router,
//! and session teardown.
//!
//! ```no_run
//! # async fn demo() -> blitz_client::Result<()> {
//! use blitz_client::{Client, InitData, UploadOptions};
//!
//! let args: Vec<String> = std::env::args().collect();
//! let mut client = Client::new(&args, InitData::default())?;
//! client.create_session(Some("root"), Some("secret")).await?;
//! client.upload("notes.txt", UploadOptions::format("text")).await?;
//! client.close_session().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::communicator::{Communicator, InitData};
use crate::config::{self, Properties};
use crate::error::{ClientError, Result};
use crate::factory::ObjectFactory;
use crate::proxy::{RouterPrx, ServiceFactoryPrx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Communicator up, no session yet.
    Connected,
    SessionActive,
    /// Session torn down. Terminal.
    Closed,
}

/// One communicator and at most one session.
///
/// Not meant for concurrent use; give each task its own client.
#[derive(Debug)]
pub struct Client {
    communicator: Communicator,
    factory: Arc<ObjectFactory>,
    router: Option<RouterPrx>,
    session: Option<ServiceFactoryPrx>,
    state: ClientState,
}

impl Client {
    /// Initialize the communicator from `args` and `init`, then install the
    /// default object factory on it.
    pub fn new(args: &[String], init: InitData) -> Result<Self> {
        Self::with_factory(args, init, ObjectFactory::default())
    }

    pub fn with_factory(args: &[String], init: InitData, factory: ObjectFactory) -> Result<Self> {
        let communicator = Communicator::initialize(args, init).map_err(|e| match e {
            ClientError::Initialization(_) => e,
            other => ClientError::Initialization(other.to_string()),
        })?;

        let factory = Arc::new(factory);
        factory.register_all(&communicator);

        Ok(Self {
            communicator,
            factory,
            router: None,
            session: None,
            state: ClientState::Connected,
        })
    }

    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    pub fn object_factory(&self) -> &Arc<ObjectFactory> {
        &self.factory
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// The active session, if any.
    pub fn session(&self) -> Option<&ServiceFactoryPrx> {
        self.session.as_ref()
    }

    pub fn properties(&self) -> &Properties {
        self.communicator.properties()
    }

    pub fn property(&self, key: &str) -> String {
        self.properties().get_property(key)
    }

    /// Log in through the default router.
    ///
    /// Missing arguments fall back to the `blitz.user` / `blitz.pass`
    /// properties. Credential checks happen before any network traffic.
    pub async fn create_session(
        &mut self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<ServiceFactoryPrx> {
        match self.state {
            ClientState::Connected => {}
            ClientState::SessionActive => return Err(ClientError::session("Session already active")),
            ClientState::Closed => return Err(ClientError::session("Client is closed")),
        }

        let username = resolve(username, || self.property(config::USERNAME));
        if username.is_empty() {
            return Err(ClientError::Configuration("No username specified".into()));
        }
        let password = resolve(password, || self.property(config::PASSWORD));
        if password.is_empty() {
            return Err(ClientError::Configuration("No password specified".into()));
        }

        let prx = self
            .communicator
            .default_router()
            .ok_or_else(|| ClientError::Routing("No default router found".into()))?;
        let router: RouterPrx = prx
            .checked_cast()
            .await?
            .ok_or_else(|| ClientError::Routing("Error obtaining router".into()))?;

        tracing::debug!("creating session for {}", username);
        let session = router
            .create_session(&username, &password)
            .await
            .map_err(|e| match e {
                ClientError::Remote(remote) => ClientError::Session {
                    message: format!("Session creation failed: {}", remote),
                    source: Some(remote),
                },
                other => other,
            })?;

        let sf: ServiceFactoryPrx = session
            .checked_cast()
            .await?
            .ok_or_else(|| ClientError::session("No session obtained"))?;

        tracing::info!("session {} established for {}", session.identity(), username);
        self.router = Some(router);
        self.session = Some(sf.clone());
        self.state = ClientState::SessionActive;
        Ok(sf)
    }

    /// Best-effort session teardown. A no-op without a session.
    ///
    /// Closing the session handle may fail on a broken transport and is
    /// ignored. The router's `destroy_session` always runs afterwards; its
    /// "connection lost" outcome is expected, any other error is returned.
    pub async fn close_session(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        self.state = ClientState::Closed;

        if let Err(e) = session.close().await {
            tracing::debug!("ignoring error while closing session: {}", e);
        }

        let router = match self.router.take() {
            Some(router) => router,
            None => return Ok(()),
        };
        match router.destroy_session().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_connection_lost() => {
                tracing::debug!("session destroyed, router dropped the connection");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.session.is_some() {
            tracing::debug!("dropping client with an open session; the router will expire it");
        }
        if let Err(e) = self.communicator.destroy() {
            tracing::warn!("error while destroying communicator: {}", e);
        }
    }
}

fn resolve(explicit: Option<&str>, fallback: impl FnOnce() -> String) -> String {
    match explicit {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => fallback(),
    }
}
