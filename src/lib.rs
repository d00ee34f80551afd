//! Client library for blitz services.
//!
//! A [`Client`] owns one [`Communicator`], logs in through the configured
//! router and exposes chunked file upload on top of the resulting session.

pub mod checksum;
pub mod client;
pub mod communicator;
pub mod config;
pub mod error;
pub mod factory;
pub mod logging;
pub mod model;
pub mod proxy;
pub mod server;
pub mod transport;
pub mod upload;

pub use client::{Client, ClientState};
pub use communicator::{Communicator, InitData, RouterAddress};
pub use config::Properties;
pub use error::{ClientError, RemoteError, Result, TransportError};
pub use factory::{ObjectConstructor, ObjectFactory, TypeFactory};
pub use model::{Format, OriginalFile, RemoteObject, WireObject};
pub use upload::UploadOptions;
