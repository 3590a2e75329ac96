//! Bridge instance - one child process behind a single-writer request loop.
//!
//! Flow:
//! 1. Spawn the child and open the frame channel
//! 2. Wait for a request (call, cast or fired timer) while watching the channel
//! 3. Write the command frame, drive the protocol loop to a terminal result
//! 4. Reply to the caller (call only), go back to 2
//! 5. On child exit, malformed data, or stop: close the channel and return the outcome
//!
//! Requests are served strictly one at a time. The task is the only owner of the
//! channel and the timer table; callers talk to it through [`BridgeHandle`].

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::channel::{ChannelEvent, ChildSpawner, CommandSpawner, FrameChannel};
use crate::bridge::protocol::{HostMessage, TimerToken};
use crate::callback::CallbackHandler;
use crate::exit::{ExitOutcome, RespawnReason, classify, signal_name};
use crate::registrar::{BridgeRef, InstanceId, RegistrarError};
use crate::timer::TimerRegistry;

/// Function name the child runs for [`BridgeHandle::load`].
pub const LOAD_FUNCTION: &str = "load";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_INBOX_CAPACITY: usize = 64;
/// How long to wait for an exit status after a failed write.
const EXIT_GRACE: Duration = Duration::from_secs(1);
/// Stop reason when none was recorded (e.g. the token was cancelled directly).
const DEFAULT_STOP_REASON: &str = "shutdown";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// The child ended the exchange with `error(reason)`.
    #[error("child returned error: {0}")]
    Remote(Value),
    #[error("timed out waiting for child")]
    Timeout,
    /// The instance terminated before replying.
    #[error("bridge instance terminated")]
    Terminated,
    #[error("no instance registered under {0}")]
    NotFound(BridgeRef),
}

pub type CallResult = Result<Value, CallError>;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn child: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Registrar(#[from] RegistrarError),
    #[error("instance already running under {0}")]
    AlreadyRunning(BridgeRef),
    #[error("no instance registered under {0}")]
    NotFound(BridgeRef),
}

/// Work item for the request loop.
#[derive(Debug)]
pub(crate) enum Request {
    Call {
        function: String,
        args: Vec<Value>,
        timeout: Duration,
        reply: oneshot::Sender<CallResult>,
    },
    Cast {
        function: String,
        args: Vec<Value>,
        timeout: Duration,
    },
    /// Injected by the timer registry.
    Timer { token: TimerToken },
}

#[derive(Clone)]
pub struct BridgeConfig {
    /// Directory the child runs in (holds its scripts).
    pub working_dir: PathBuf,
    pub spawner: Arc<dyn ChildSpawner>,
    pub handler: Option<Arc<dyn CallbackHandler>>,
    /// Values passed to every callback after the instance ref.
    pub pipe: Vec<Value>,
    /// Default exchange timeout, also used for fired timers.
    pub timeout: Duration,
    pub inbox_capacity: usize,
}

impl BridgeConfig {
    pub fn new(executable: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            spawner: Arc::new(CommandSpawner::new(executable)),
            handler: None,
            pipe: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ChildSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn CallbackHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_pipe(mut self, pipe: Vec<Value>) -> Self {
        self.pipe = pipe;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity.max(1);
        self
    }
}

/// Cloneable handle for sending requests to an instance.
#[derive(Clone)]
pub struct BridgeHandle {
    id: InstanceId,
    reference: BridgeRef,
    tx: mpsc::Sender<Request>,
    shutdown: CancellationToken,
    stop_reason: Arc<OnceLock<String>>,
    default_timeout: Duration,
}

impl BridgeHandle {
    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn reference(&self) -> &BridgeRef {
        &self.reference
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run `function` in the child and wait for its terminal result.
    ///
    /// `timeout` bounds the whole exchange inside the instance (default when `None`);
    /// the caller itself waits until the instance replies or terminates.
    pub async fn call(
        &self,
        function: impl Into<String>,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> CallResult {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Call {
                function: function.into(),
                args,
                timeout: timeout.unwrap_or(self.default_timeout),
                reply,
            })
            .await
            .map_err(|_| CallError::Terminated)?;
        rx.await.map_err(|_| CallError::Terminated)?
    }

    /// Queue `function` for the child; returns once queued.
    pub async fn cast(
        &self,
        function: impl Into<String>,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<(), CallError> {
        self.tx
            .send(Request::Cast {
                function: function.into(),
                args,
                timeout: timeout.unwrap_or(self.default_timeout),
            })
            .await
            .map_err(|_| CallError::Terminated)
    }

    /// Hand script source to the child through the call path.
    pub async fn load(&self, source: impl Into<String>, timeout: Option<Duration>) -> CallResult {
        self.call(LOAD_FUNCTION, vec![Value::String(source.into())], timeout)
            .await
    }

    /// Ask the instance to close its channel and terminate with `Stopped(reason)`.
    ///
    /// The first reason wins if several handles stop the same instance.
    pub fn stop(&self, reason: impl Into<String>) {
        let _ = self.stop_reason.set(reason.into());
        self.shutdown.cancel();
    }

    /// Whether two handles point at the same running instance.
    pub fn same_instance(&self, other: &BridgeHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("id", &self.id)
            .field("reference", &self.reference)
            .finish()
    }
}

/// A running instance: its handle plus the task that yields its exit outcome.
pub struct BridgeInstance {
    handle: BridgeHandle,
    task: JoinHandle<ExitOutcome>,
}

impl BridgeInstance {
    /// Spawn the child and start the request loop.
    pub fn spawn(
        id: InstanceId,
        reference: BridgeRef,
        config: &BridgeConfig,
    ) -> Result<Self, SpawnError> {
        let channel = FrameChannel::open(config.spawner.as_ref(), &config.working_dir)?;
        Ok(Self::start(id, reference, config, channel))
    }

    /// Start the request loop over an already-open channel.
    pub fn start(
        id: InstanceId,
        reference: BridgeRef,
        config: &BridgeConfig,
        channel: FrameChannel,
    ) -> Self {
        let (tx, inbox) = mpsc::channel(config.inbox_capacity);
        let shutdown = CancellationToken::new();
        let stop_reason = Arc::new(OnceLock::new());

        let instance = Instance {
            id,
            reference_value: reference.to_value(),
            pid: channel.pid(),
            channel,
            timers: TimerRegistry::new(tx.downgrade()),
            handler: config.handler.clone(),
            pipe: config.pipe.clone(),
            default_timeout: config.timeout,
            shutdown: shutdown.clone(),
            stop_reason: Arc::clone(&stop_reason),
        };

        tracing::info!(%id, %reference, pid = ?instance.pid, "Bridge instance started");
        let task = tokio::spawn(instance.run(inbox));

        Self {
            handle: BridgeHandle {
                id,
                reference,
                tx,
                shutdown,
                stop_reason,
                default_timeout: config.timeout,
            },
            task,
        }
    }

    pub fn handle(&self) -> &BridgeHandle {
        &self.handle
    }

    /// Wait for the instance to terminate.
    pub async fn wait(self) -> ExitOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => ExitOutcome::Stopped("aborted".to_string()),
            Err(e) => {
                tracing::error!(id = %self.handle.id, error = %e, "Bridge control loop panicked");
                ExitOutcome::Respawn(RespawnReason::Panicked)
            }
        }
    }

    /// Kill the control loop. Dropping its channel kills the child.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Outcome of one protocol-loop run.
pub(crate) enum Step {
    Done(CallResult),
    Exit(ExitOutcome),
}

/// State owned by the control loop.
pub(crate) struct Instance {
    pub(crate) id: InstanceId,
    pub(crate) reference_value: Value,
    pub(crate) pid: Option<u32>,
    pub(crate) channel: FrameChannel,
    pub(crate) timers: TimerRegistry,
    pub(crate) handler: Option<Arc<dyn CallbackHandler>>,
    pub(crate) pipe: Vec<Value>,
    pub(crate) default_timeout: Duration,
    pub(crate) shutdown: CancellationToken,
    pub(crate) stop_reason: Arc<OnceLock<String>>,
}

impl Instance {
    async fn run(mut self, mut inbox: mpsc::Receiver<Request>) -> ExitOutcome {
        let outcome = self.mainloop(&mut inbox).await;

        self.timers.clear();
        self.channel.close();
        // Queued callers see their reply sender dropped.
        inbox.close();

        match &outcome {
            ExitOutcome::CleanShutdown => {
                tracing::info!(id = %self.id, "Child exited cleanly");
            }
            ExitOutcome::Stopped(reason) => {
                tracing::info!(id = %self.id, %reason, "Bridge instance stopped");
            }
            ExitOutcome::Respawn(reason) => {
                tracing::warn!(id = %self.id, %reason, "Bridge instance crashed");
            }
        }
        outcome
    }

    async fn mainloop(&mut self, inbox: &mut mpsc::Receiver<Request>) -> ExitOutcome {
        loop {
            let request = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    return self.stopped();
                }

                event = self.channel.next_event() => {
                    if let Err(outcome) = self.handle_idle_event(event).await {
                        return outcome;
                    }
                    continue;
                }

                request = inbox.recv() => match request {
                    Some(request) => request,
                    None => return ExitOutcome::Stopped("all handles dropped".to_string()),
                },
            };

            if let Err(outcome) = self.serve(request).await {
                return outcome;
            }
        }
    }

    async fn serve(&mut self, request: Request) -> Result<(), ExitOutcome> {
        match request {
            Request::Call {
                function,
                args,
                timeout,
                reply,
            } => {
                tracing::debug!(id = %self.id, %function, "Call");
                let result = self.exchange(HostMessage::Invoke { function, args }, timeout).await?;
                if reply.send(result).is_err() {
                    tracing::debug!(id = %self.id, "Caller went away before reply");
                }
            }
            Request::Cast {
                function,
                args,
                timeout,
            } => {
                tracing::debug!(id = %self.id, %function, "Cast");
                let result = self.exchange(HostMessage::Invoke { function, args }, timeout).await?;
                tracing::trace!(id = %self.id, ?result, "Cast result discarded");
            }
            Request::Timer { token } => {
                if !self.timers.is_registered(&token) {
                    tracing::trace!(id = %self.id, %token, "Dropping tick for cancelled timer");
                    return Ok(());
                }
                tracing::debug!(id = %self.id, %token, "Timer cast");
                let timeout = self.default_timeout;
                let result = self.exchange(HostMessage::Timer { token }, timeout).await?;
                tracing::trace!(id = %self.id, ?result, "Timer result discarded");
            }
        }
        Ok(())
    }

    /// Write a command frame and run the protocol loop to a terminal result.
    async fn exchange(&mut self, msg: HostMessage, timeout: Duration) -> Result<CallResult, ExitOutcome> {
        if let Err(e) = self.channel.write(msg).await {
            tracing::error!(id = %self.id, error = %e, "Failed to write to child");
            return Err(self.await_exit().await);
        }
        match self.portloop(timeout).await {
            Step::Done(result) => Ok(result),
            Step::Exit(outcome) => Err(outcome),
        }
    }

    /// Frames that arrive between exchanges belong to an abandoned (timed out)
    /// exchange. Terminal ones are dropped; callbacks are still served so the
    /// child is never left waiting on a reply.
    async fn handle_idle_event(&mut self, event: Option<ChannelEvent>) -> Result<(), ExitOutcome> {
        match event {
            Some(ChannelEvent::Data(msg)) if msg.is_terminal() => {
                tracing::debug!(id = %self.id, kind = msg.kind(), "Discarding stale terminal frame");
                Ok(())
            }
            Some(ChannelEvent::Data(msg)) => self.handle_message(msg).await,
            Some(ChannelEvent::Malformed(e)) => Err(self.unsafe_data(&e)),
            Some(ChannelEvent::Exited(status)) => Err(self.exited(status)),
            None => Err(ExitOutcome::Respawn(RespawnReason::ChannelClosed)),
        }
    }

    /// After a failed write the child is usually dying; prefer its real exit status.
    async fn await_exit(&mut self) -> ExitOutcome {
        let wait = async {
            loop {
                match self.channel.next_event().await {
                    Some(ChannelEvent::Exited(status)) => return Some(status),
                    Some(ChannelEvent::Malformed(_)) | None => return None,
                    Some(ChannelEvent::Data(_)) => continue,
                }
            }
        };
        match tokio::time::timeout(EXIT_GRACE, wait).await {
            Ok(Some(status)) => self.exited(status),
            _ => ExitOutcome::Respawn(RespawnReason::ChannelClosed),
        }
    }

    pub(crate) fn exited(&self, status: i32) -> ExitOutcome {
        let outcome = classify(status);
        if outcome.is_respawn() {
            tracing::warn!(
                id = %self.id,
                pid = ?self.pid,
                status,
                signal = signal_name(status).unwrap_or(""),
                "Child exited abnormally"
            );
        } else {
            tracing::debug!(id = %self.id, pid = ?self.pid, "Child exited with status 0");
        }
        outcome
    }

    pub(crate) fn stopped(&self) -> ExitOutcome {
        let reason = self
            .stop_reason
            .get()
            .cloned()
            .unwrap_or_else(|| DEFAULT_STOP_REASON.to_string());
        ExitOutcome::Stopped(reason)
    }

    pub(crate) fn unsafe_data(&self, error: &std::io::Error) -> ExitOutcome {
        tracing::error!(id = %self.id, error = %error, "Unsafe data from child");
        ExitOutcome::Respawn(RespawnReason::UnsafeData)
    }
}
