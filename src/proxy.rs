//! Typed handles to remote objects.
//!
//! An [`ObjectPrx`] is just an identity plus the communicator that can reach
//! it. Typed proxies wrap one and expose the operations of their interface;
//! [`ObjectPrx::checked_cast`] asks the remote side before handing one out.

use std::fmt;

use bytes::Bytes;

use crate::communicator::Communicator;
use crate::error::{ClientError, Result};
use crate::model::{RemoteObject, WireObject};
use crate::transport::{Invocation, Operation, Reply};

/// A proxy type with a remote interface id.
pub trait TypedProxy: Sized {
    const TYPE_ID: &'static str;

    fn from_object(prx: ObjectPrx) -> Self;

    fn object(&self) -> &ObjectPrx;
}

#[derive(Clone)]
pub struct ObjectPrx {
    communicator: Communicator,
    identity: String,
}

impl ObjectPrx {
    pub fn new(communicator: Communicator, identity: impl Into<String>) -> Self {
        Self {
            communicator,
            identity: identity.into(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    async fn invoke(&self, operation: Operation) -> Result<Reply> {
        self.communicator
            .invoke(Invocation::new(self.identity.clone(), operation))
            .await
    }

    /// Proxy for another object reachable through the same communicator.
    fn sibling(&self, identity: String) -> ObjectPrx {
        ObjectPrx::new(self.communicator.clone(), identity)
    }

    pub async fn is_a(&self, type_id: &str) -> Result<bool> {
        let reply = self
            .invoke(Operation::IsA {
                type_id: type_id.to_string(),
            })
            .await?;
        expect_bool("is_a", reply)
    }

    /// `Some` when the remote object implements `P`, `None` otherwise.
    pub async fn checked_cast<P: TypedProxy>(&self) -> Result<Option<P>> {
        if self.is_a(P::TYPE_ID).await? {
            Ok(Some(P::from_object(self.clone())))
        } else {
            Ok(None)
        }
    }

    /// Assume the remote type without asking.
    pub fn unchecked_cast<P: TypedProxy>(&self) -> P {
        P::from_object(self.clone())
    }
}

impl fmt::Debug for ObjectPrx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectPrx").field(&self.identity).finish()
    }
}

fn unexpected(op: &str, reply: Reply) -> ClientError {
    ClientError::Protocol(format!("unexpected reply to {}: {:?}", op, reply))
}

fn expect_unit(op: &str, reply: Reply) -> Result<()> {
    match reply {
        Reply::Unit => Ok(()),
        other => Err(unexpected(op, other)),
    }
}

fn expect_bool(op: &str, reply: Reply) -> Result<bool> {
    match reply {
        Reply::Bool(b) => Ok(b),
        other => Err(unexpected(op, other)),
    }
}

fn expect_proxy(op: &str, reply: Reply) -> Result<String> {
    match reply {
        Reply::Proxy(identity) => Ok(identity),
        other => Err(unexpected(op, other)),
    }
}

fn expect_object(op: &str, reply: Reply) -> Result<WireObject> {
    match reply {
        Reply::Object(object) => Ok(object),
        other => Err(unexpected(op, other)),
    }
}

macro_rules! typed_proxy {
    ($name:ident, $type_id:expr) => {
        #[derive(Clone, Debug)]
        pub struct $name {
            prx: ObjectPrx,
        }

        impl TypedProxy for $name {
            const TYPE_ID: &'static str = $type_id;

            fn from_object(prx: ObjectPrx) -> Self {
                Self { prx }
            }

            fn object(&self) -> &ObjectPrx {
                &self.prx
            }
        }
    };
}

typed_proxy!(RouterPrx, "::blitz::Router");
typed_proxy!(ServiceFactoryPrx, "::blitz::api::ServiceFactory");
typed_proxy!(UpdateServicePrx, "::blitz::api::IUpdate");
typed_proxy!(RawFileStorePrx, "::blitz::api::RawFileStore");

impl RouterPrx {
    /// Authenticate and get back the (untyped) session proxy.
    pub async fn create_session(&self, username: &str, password: &str) -> Result<ObjectPrx> {
        let reply = self
            .prx
            .invoke(Operation::CreateSession {
                username: username.to_string(),
                password: password.to_string(),
            })
            .await?;
        let identity = expect_proxy("create_session", reply)?;
        Ok(self.prx.sibling(identity))
    }

    /// Servers tear the connection down in response, so success normally
    /// surfaces as a connection-lost transport error.
    pub async fn destroy_session(&self) -> Result<()> {
        let reply = self.prx.invoke(Operation::DestroySession).await?;
        expect_unit("destroy_session", reply)
    }
}

impl ServiceFactoryPrx {
    pub async fn close(&self) -> Result<()> {
        let reply = self.prx.invoke(Operation::Close).await?;
        expect_unit("close", reply)
    }

    pub async fn get_update_service(&self) -> Result<UpdateServicePrx> {
        let reply = self.prx.invoke(Operation::GetUpdateService).await?;
        let identity = expect_proxy("get_update_service", reply)?;
        Ok(UpdateServicePrx::from_object(self.prx.sibling(identity)))
    }

    pub async fn create_raw_file_store(&self) -> Result<RawFileStorePrx> {
        let reply = self.prx.invoke(Operation::CreateRawFileStore).await?;
        let identity = expect_proxy("create_raw_file_store", reply)?;
        Ok(RawFileStorePrx::from_object(self.prx.sibling(identity)))
    }
}

impl UpdateServicePrx {
    /// Persist `object` and return the stored copy, rebuilt through the
    /// communicator's object factories.
    pub async fn save_and_return_object(&self, object: &dyn RemoteObject) -> Result<Box<dyn RemoteObject>> {
        let reply = self
            .prx
            .invoke(Operation::SaveAndReturnObject {
                object: object.to_wire(),
            })
            .await?;
        let wire = expect_object("save_and_return_object", reply)?;
        self.prx.communicator().unmarshal(wire)
    }
}

impl RawFileStorePrx {
    pub async fn set_file_id(&self, id: i64) -> Result<()> {
        let reply = self.prx.invoke(Operation::SetFileId { id }).await?;
        expect_unit("set_file_id", reply)
    }

    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let reply = self
            .prx
            .invoke(Operation::Write {
                offset,
                data: Bytes::copy_from_slice(data),
            })
            .await?;
        expect_unit("write", reply)
    }

    /// Signals the end of the upload to the remote side.
    pub async fn close(&self) -> Result<()> {
        let reply = self.prx.invoke(Operation::Close).await?;
        expect_unit("close", reply)
    }
}
