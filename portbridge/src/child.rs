//! Child side of the bridge protocol.
//!
//! The parent side (spawning, request loop) is in instance.rs. A child reads
//! `invoke`/`timer` frames from stdin, runs them through a [`ChildHandler`], and
//! answers each with exactly one `ok` or `error` frame. While handling a frame it
//! may call back into the host, emit info, or manage timers via [`ChildContext`].
//!
//! Fatal protocol failures carry the exit status the host classifies them by.

use std::io;
use std::pin::Pin;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ChildMessage, HostMessage, TimerToken};

/// Terminal answer to one invoke or timer frame: `ok(results)` or `error(reason)`.
pub type Invocation = Result<Value, Value>;

#[derive(Debug, thiserror::Error)]
pub enum ChildError {
    #[error("failed to read frame: {0}")]
    Read(#[source] io::Error),
    #[error("failed to write frame: {0}")]
    Write(#[source] io::Error),
    #[error("failed to read callback reply: {0}")]
    CallRead(#[source] io::Error),
    #[error("expected callback reply, got {0}")]
    CallResult(&'static str),
}

impl ChildError {
    /// Exit status reported to the host for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Read(_) => 200,
            Self::Write(_) => 201,
            Self::CallRead(_) => 210,
            Self::CallResult(_) => 212,
        }
    }
}

/// Handler for frames the host sends to the child.
#[async_trait::async_trait]
pub trait ChildHandler: Send + Sync + 'static {
    async fn invoke(
        &self,
        ctx: &mut ChildContext,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Invocation, ChildError>;

    /// A timer registered with `after`/`interval` fired.
    async fn timer(&self, _ctx: &mut ChildContext, token: TimerToken) -> Result<Invocation, ChildError> {
        tracing::debug!(%token, "Timer fired with no handler");
        Ok(Ok(Value::Null))
    }
}

type Reader = FramedRead<Pin<Box<dyn AsyncRead + Send>>, JsonCodec<HostMessage>>;
type Writer = FramedWrite<Pin<Box<dyn AsyncWrite + Send>>, JsonCodec<ChildMessage>>;

/// Child's view of the channel while a frame is being handled.
pub struct ChildContext {
    reader: Reader,
    writer: Writer,
}

impl ChildContext {
    fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let reader: Pin<Box<dyn AsyncRead + Send>> = Box::pin(reader);
        let writer: Pin<Box<dyn AsyncWrite + Send>> = Box::pin(writer);
        Self {
            reader: FramedRead::new(reader, JsonCodec::new()),
            writer: FramedWrite::new(writer, JsonCodec::new()),
        }
    }

    async fn send(&mut self, msg: ChildMessage) -> Result<(), ChildError> {
        self.writer.send(msg).await.map_err(ChildError::Write)
    }

    /// Call a host callback and wait for its reply.
    pub async fn call(&mut self, function: impl Into<String>, args: Vec<Value>) -> Result<Value, ChildError> {
        self.send(ChildMessage::Call {
            function: function.into(),
            args,
        })
        .await?;

        match self.reader.next().await {
            Some(Ok(HostMessage::Reply { result })) => Ok(result),
            Some(Ok(other)) => Err(ChildError::CallResult(other.kind())),
            Some(Err(e)) => Err(ChildError::CallRead(e)),
            None => Err(ChildError::CallRead(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "host closed channel during call",
            ))),
        }
    }

    /// Run a host callback without waiting for a reply.
    pub async fn cast(&mut self, function: impl Into<String>, args: Vec<Value>) -> Result<(), ChildError> {
        self.send(ChildMessage::Cast {
            function: function.into(),
            args,
        })
        .await
    }

    /// Emit a payload to the host log.
    pub async fn info(&mut self, payload: Value) -> Result<(), ChildError> {
        self.send(ChildMessage::Info { payload }).await
    }

    pub async fn after(&mut self, delay_ms: u64, token: impl Into<TimerToken>) -> Result<(), ChildError> {
        self.send(ChildMessage::After {
            delay_ms,
            token: token.into(),
        })
        .await
    }

    pub async fn interval(&mut self, delay_ms: u64, token: impl Into<TimerToken>) -> Result<(), ChildError> {
        self.send(ChildMessage::Interval {
            delay_ms,
            token: token.into(),
        })
        .await
    }

    pub async fn cancel(&mut self, token: impl Into<TimerToken>) -> Result<(), ChildError> {
        self.send(ChildMessage::Cancel { token: token.into() }).await
    }

    /// Write bytes to the channel bypassing framing.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ChildError> {
        let inner = self.writer.get_mut();
        inner.write_all(bytes).await.map_err(ChildError::Write)?;
        inner.flush().await.map_err(ChildError::Write)
    }
}

/// Serve the host over stdin/stdout until it closes the channel.
pub async fn run_child<H: ChildHandler>(handler: H) -> Result<(), ChildError> {
    serve(handler, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve the host over arbitrary I/O. Returns `Ok` on clean EOF.
pub async fn serve<H, R, W>(handler: H, reader: R, writer: W) -> Result<(), ChildError>
where
    H: ChildHandler,
    R: AsyncRead + Send + 'static,
    W: AsyncWrite + Send + 'static,
{
    let mut ctx = ChildContext::new(reader, writer);
    tracing::debug!("Child ready");

    loop {
        let msg = match ctx.reader.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return Err(ChildError::Read(e)),
            None => {
                tracing::debug!("Host closed channel");
                return Ok(());
            }
        };

        let outcome = match msg {
            HostMessage::Invoke { function, args } => {
                tracing::trace!(%function, "Invoke");
                handler.invoke(&mut ctx, &function, args).await?
            }
            HostMessage::Timer { token } => handler.timer(&mut ctx, token).await?,
            HostMessage::Reply { .. } => {
                tracing::warn!("Reply with no call in flight, ignoring");
                continue;
            }
        };

        let frame = match outcome {
            Ok(results) => ChildMessage::Ok { results },
            Err(reason) => ChildMessage::Error { reason },
        };
        ctx.send(frame).await?;
    }
}
