//! Frame channel: the child process and its framed stdin/stdout pipe.
//!
//! A pump task reads frames from the child's stdout and forwards them as
//! [`ChannelEvent`]s, in order, followed by exactly one `Exited` once the child
//! is reaped. The pump owns the child; aborting it (on close or drop) kills the
//! child, so no child outlives its channel.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::protocol::{ChildMessage, HostMessage};
use crate::exit::status_code;

const EVENT_BUFFER: usize = 64;

/// What the channel observed, in arrival order.
#[derive(Debug)]
pub enum ChannelEvent {
    Data(ChildMessage),
    /// Framing or decoding failed; nothing more is read after this.
    Malformed(io::Error),
    /// Child was reaped with this status (signals as 128 + N).
    Exited(i32),
}

/// Extension point for how the child is launched.
pub trait ChildSpawner: Send + Sync {
    /// Spawn the child with piped stdin/stdout, running in `working_dir`.
    fn spawn(&self, working_dir: &Path) -> io::Result<Child>;
}

/// Spawns a fixed executable with fixed arguments.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl ChildSpawner for CommandSpawner {
    fn spawn(&self, working_dir: &Path) -> io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }
}

type FrameWriter = FramedWrite<Pin<Box<dyn AsyncWrite + Send + Sync>>, JsonCodec<HostMessage>>;

pub struct FrameChannel {
    writer: Option<FrameWriter>,
    events: mpsc::Receiver<ChannelEvent>,
    pump: JoinHandle<()>,
    pid: Option<u32>,
}

impl FrameChannel {
    /// Spawn the child and start pumping its output.
    pub fn open(spawner: &dyn ChildSpawner, working_dir: &Path) -> io::Result<Self> {
        let mut child = spawner.spawn(working_dir)?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout not captured"))?;

        tracing::debug!(?pid, working_dir = %working_dir.display(), "Child spawned");

        // The child moves into the exit future; dropping the future kills it.
        let exit = async move { child.wait().await.map(status_code) }.boxed();
        let mut channel = Self::from_io(stdout, stdin, exit);
        channel.pid = pid;
        Ok(channel)
    }

    /// Build a channel over arbitrary I/O.
    ///
    /// `exit` resolves with the child's status once it has terminated.
    pub fn from_io<R, W>(reader: R, writer: W, exit: BoxFuture<'static, io::Result<i32>>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Sync + 'static,
    {
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let reader = FramedRead::new(reader, JsonCodec::<ChildMessage>::new());
        let pump = tokio::spawn(pump(reader, exit, tx));
        let writer: Pin<Box<dyn AsyncWrite + Send + Sync>> = Box::pin(writer);

        Self {
            writer: Some(FramedWrite::new(writer, JsonCodec::new())),
            events,
            pump,
            pid: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send one frame to the child.
    pub async fn write(&mut self, msg: HostMessage) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))?;
        writer.send(msg).await
    }

    /// Next event, or `None` once the pump has finished and all events are consumed.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Close stdin and kill the child.
    pub fn close(&mut self) {
        if self.writer.take().is_some() {
            tracing::debug!(pid = ?self.pid, "Closing frame channel");
        }
        self.pump.abort();
    }
}

impl Drop for FrameChannel {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump<R>(
    mut reader: FramedRead<R, JsonCodec<ChildMessage>>,
    exit: BoxFuture<'static, io::Result<i32>>,
    tx: mpsc::Sender<ChannelEvent>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(msg)) => {
                tracing::trace!(kind = msg.kind(), "Frame received");
                if tx.send(ChannelEvent::Data(msg)).await.is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Malformed frame from child");
                let _ = tx.send(ChannelEvent::Malformed(e)).await;
                return;
            }
            None => break,
        }
    }

    tracing::trace!("Child output closed, waiting for exit");
    let status = match exit.await {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to reap child");
            -1
        }
    };
    let _ = tx.send(ChannelEvent::Exited(status)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, DuplexStream, duplex};
    use tokio::sync::oneshot;

    struct FakeChild {
        reader: FramedRead<DuplexStream, JsonCodec<HostMessage>>,
        writer: FramedWrite<DuplexStream, JsonCodec<ChildMessage>>,
        exit: Option<oneshot::Sender<i32>>,
    }

    fn fake_channel() -> (FrameChannel, FakeChild) {
        let (host_out, child_in) = duplex(4096);
        let (child_out, host_in) = duplex(4096);
        let (exit_tx, exit_rx) = oneshot::channel();
        let exit = async move { exit_rx.await.map_err(io::Error::other) }.boxed();

        let channel = FrameChannel::from_io(host_in, host_out, exit);
        let child = FakeChild {
            reader: FramedRead::new(child_in, JsonCodec::new()),
            writer: FramedWrite::new(child_out, JsonCodec::new()),
            exit: Some(exit_tx),
        };
        (channel, child)
    }

    #[test]
    fn channel_can_be_shared_across_awaits() {
        // The control loop holds `&Instance` across callback awaits.
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FrameChannel>();
    }

    #[tokio::test]
    async fn write_reaches_child() {
        let (mut channel, mut child) = fake_channel();
        channel
            .write(HostMessage::Invoke {
                function: "ping".into(),
                args: vec![],
            })
            .await
            .unwrap();

        let got = child.reader.next().await.unwrap().unwrap();
        assert_eq!(
            got,
            HostMessage::Invoke {
                function: "ping".into(),
                args: vec![]
            }
        );
    }

    #[tokio::test]
    async fn data_precedes_exit() {
        let (mut channel, mut child) = fake_channel();
        child
            .writer
            .send(ChildMessage::Ok { results: json!(1) })
            .await
            .unwrap();
        drop(child.writer);
        child.exit.take().unwrap().send(3).unwrap();

        assert!(matches!(
            channel.next_event().await,
            Some(ChannelEvent::Data(ChildMessage::Ok { .. }))
        ));
        assert!(matches!(channel.next_event().await, Some(ChannelEvent::Exited(3))));
        assert!(channel.next_event().await.is_none());
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let (mut channel, child) = fake_channel();
        let mut raw = child.writer.into_inner();
        raw.write_all(&[0, 0, 0, 4, b'n', b'o', b'p', b'e']).await.unwrap();

        match channel.next_event().await {
            Some(ChannelEvent::Malformed(e)) => assert_eq!(e.kind(), io::ErrorKind::InvalidData),
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn write_after_close_is_broken_pipe() {
        let (mut channel, _child) = fake_channel();
        channel.close();
        let err = channel
            .write(HostMessage::Reply { result: json!(null) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_child_exit_status_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = CommandSpawner::new("sh").arg("-c").arg("exit 7");
        let mut channel = FrameChannel::open(&spawner, dir.path()).unwrap();
        assert!(channel.pid().is_some());

        loop {
            match channel.next_event().await {
                Some(ChannelEvent::Exited(status)) => {
                    assert_eq!(status, 7);
                    break;
                }
                Some(ChannelEvent::Data(msg)) => panic!("unexpected frame {:?}", msg),
                Some(ChannelEvent::Malformed(e)) => panic!("unexpected error {}", e),
                None => panic!("channel ended without exit"),
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_runs_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = CommandSpawner::new("sh")
            .arg("-c")
            .arg("test -f marker.lua && exit 0 || exit 9");
        std::fs::write(dir.path().join("marker.lua"), "-- marker").unwrap();

        let mut channel = FrameChannel::open(&spawner, dir.path()).unwrap();
        let status = loop {
            if let Some(ChannelEvent::Exited(status)) = channel.next_event().await {
                break status;
            }
        };
        assert_eq!(status, 0);
    }
}
