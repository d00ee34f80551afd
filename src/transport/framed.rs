//! Connection over any byte stream using the framed protocol.
//!
//! The stream is owned by a background task; callers hand it invocations
//! through a channel and wait on a oneshot for the reply. Once the stream
//! fails every later call reports `ConnectionLost`.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::protocol::{self, negotiate_version, Hello, MessageType, VersionNegotiationResult};
use super::{Connection, Invocation, Reply};
use crate::error::TransportError;

type Pending = (Invocation, oneshot::Sender<Result<Reply, TransportError>>);

pub struct FramedConnection {
    requests: mpsc::UnboundedSender<Pending>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FramedConnection {
    /// Perform the Hello exchange on `stream`, then start the I/O task.
    pub async fn connect<S>(mut stream: S) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        protocol::write_frame(&mut stream, &Hello::new().encode()).await?;

        let (msg_type, payload) = protocol::read_frame(&mut stream).await?;
        if msg_type != MessageType::Hello {
            return Err(TransportError::Protocol(format!(
                "Expected Hello response, got {:?}",
                msg_type
            )));
        }
        let hello = Hello::decode(payload)?;
        match negotiate_version(hello.version) {
            VersionNegotiationResult::Supported(v) => {
                tracing::debug!("protocol version {} negotiated", v);
            }
            other => {
                return Err(TransportError::Protocol(format!(
                    "unsupported server protocol: {:?}",
                    other
                )));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_io(stream, rx));

        Ok(Self {
            requests: tx,
            task: Mutex::new(Some(task)),
        })
    }
}

async fn run_io<S>(stream: S, mut rx: mpsc::UnboundedReceiver<Pending>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    while let Some((invocation, reply_tx)) = rx.recv().await {
        let op = invocation.operation.name();
        let (result, fatal) = match round_trip(&mut reader, &mut writer, &invocation).await {
            Ok(reply) => (Ok(reply), false),
            Err(Failure::Call(e)) => (Err(e), false),
            Err(Failure::Stream(e)) => (Err(e), true),
        };
        if fatal {
            tracing::debug!("stream unusable after {} on {}: {:?}", op, invocation.identity, result);
        }
        // Caller may have given up waiting; nothing to do then.
        let _ = reply_tx.send(result);
        if fatal {
            break;
        }
    }
}

/// Whether an error leaves the stream in a known state.
enum Failure {
    /// Nothing or a whole frame was consumed; the next call can proceed.
    Call(TransportError),
    /// The stream position is unknown.
    Stream(TransportError),
}

async fn round_trip<S>(
    reader: &mut ReadHalf<S>,
    writer: &mut WriteHalf<S>,
    invocation: &Invocation,
) -> Result<Reply, Failure>
where
    S: AsyncRead + AsyncWrite,
{
    let frame = protocol::encode_request(invocation).map_err(Failure::Call)?;
    protocol::write_frame(writer, &frame).await.map_err(Failure::Stream)?;

    let (msg_type, payload) = protocol::read_frame(reader).await.map_err(Failure::Stream)?;
    if msg_type != MessageType::Reply {
        return Err(Failure::Call(TransportError::Protocol(format!(
            "Expected Reply, got {:?}",
            msg_type
        ))));
    }
    protocol::decode_reply(payload).map_err(Failure::Call)
}

#[async_trait]
impl Connection for FramedConnection {
    async fn invoke(&self, invocation: Invocation) -> Result<Reply, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send((invocation, tx))
            .map_err(|_| TransportError::ConnectionLost("connection closed".into()))?;
        rx.await
            .map_err(|_| TransportError::ConnectionLost("connection closed".into()))?
    }

    fn shutdown(&self) -> Result<(), TransportError> {
        let task = self
            .task
            .lock()
            .map_err(|_| TransportError::Protocol("connection state poisoned".into()))?
            .take();
        if let Some(task) = task {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for FramedConnection {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}
