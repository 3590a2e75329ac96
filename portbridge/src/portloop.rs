//! Protocol loop: drives one exchange with the child to a terminal result.
//!
//! The deadline is fixed when the loop starts and covers every intermediate
//! frame (callbacks, timer registrations, info) until `ok`/`error` arrives. A
//! long chain of callbacks can therefore run out of time even if each step is
//! fast. A timeout too large to represent as a deadline never fires.

use std::time::Duration;

use tokio::time::Instant;

use crate::bridge::channel::ChannelEvent;
use crate::bridge::protocol::{ChildMessage, HostMessage};
use crate::callback::{self, CallbackError, full_args};
use crate::exit::{ExitOutcome, RespawnReason};
use crate::instance::{CallError, Instance, Step};
use crate::timer::TimerKind;

impl Instance {
    pub(crate) async fn portloop(&mut self, timeout: Duration) -> Step {
        let deadline = Instant::now().checked_add(timeout);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    return Step::Exit(self.stopped());
                }

                event = self.channel.next_event() => match event {
                    Some(ChannelEvent::Data(ChildMessage::Ok { results })) => {
                        tracing::trace!(id = %self.id, "Exchange succeeded");
                        return Step::Done(Ok(results));
                    }
                    Some(ChannelEvent::Data(ChildMessage::Error { reason })) => {
                        tracing::warn!(id = %self.id, %reason, "Child returned error");
                        return Step::Done(Err(CallError::Remote(reason)));
                    }
                    Some(ChannelEvent::Data(msg)) => {
                        if let Err(outcome) = self.handle_message(msg).await {
                            return Step::Exit(outcome);
                        }
                    }
                    Some(ChannelEvent::Malformed(e)) => {
                        return Step::Exit(self.unsafe_data(&e));
                    }
                    Some(ChannelEvent::Exited(status)) => {
                        return Step::Exit(self.exited(status));
                    }
                    None => {
                        return Step::Exit(ExitOutcome::Respawn(RespawnReason::ChannelClosed));
                    }
                },

                _ = expire(deadline) => {
                    tracing::warn!(
                        id = %self.id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Timed out waiting for child"
                    );
                    return Step::Done(Err(CallError::Timeout));
                }
            }
        }
    }

    /// Handle a non-terminal child message. `Err` means the instance must exit.
    pub(crate) async fn handle_message(&mut self, msg: ChildMessage) -> Result<(), ExitOutcome> {
        match msg {
            ChildMessage::Call { function, args } => {
                let result = self.run_callback(&function, args).await?;
                let reply = HostMessage::Reply { result };
                if let Err(e) = self.channel.write(reply).await {
                    tracing::error!(id = %self.id, %function, error = %e, "Failed to send callback reply");
                    return Err(ExitOutcome::Respawn(RespawnReason::ChannelClosed));
                }
            }
            ChildMessage::Cast { function, args } => {
                self.run_callback(&function, args).await?;
            }
            ChildMessage::Info { payload } => {
                tracing::info!(target: "portbridge::child", id = %self.id, "{}", payload);
            }
            ChildMessage::After { delay_ms, token } => {
                self.timers
                    .schedule(token, Duration::from_millis(delay_ms), TimerKind::OneShot);
            }
            ChildMessage::Interval { delay_ms, token } => {
                self.timers
                    .schedule(token, Duration::from_millis(delay_ms), TimerKind::Repeating);
            }
            ChildMessage::Cancel { token } => {
                if let Err(e) = self.timers.cancel(&token) {
                    tracing::warn!(id = %self.id, error = %e, "Cancel requested by child failed");
                }
            }
            ChildMessage::Ok { .. } | ChildMessage::Error { .. } => {
                tracing::debug!(id = %self.id, kind = msg.kind(), "Unexpected terminal frame ignored");
            }
        }
        Ok(())
    }

    async fn run_callback(
        &self,
        function: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, ExitOutcome> {
        let args = full_args(&self.reference_value, &self.pipe, args);
        tracing::debug!(id = %self.id, function, arity = args.len(), "Callback");

        callback::invoke(self.handler.as_ref(), function, args)
            .await
            .map_err(|e| {
                tracing::error!(id = %self.id, error = %e, "Callback failed");
                let message = match e {
                    CallbackError::Failed { message, .. } => message,
                    other => other.to_string(),
                };
                ExitOutcome::Respawn(RespawnReason::CallbackFailed(message))
            })
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::{FutureExt, SinkExt, StreamExt};
    use serde_json::{Value, json};
    use tokio::io::{AsyncWriteExt, DuplexStream, duplex};
    use tokio::sync::oneshot;
    use tokio_util::codec::{FramedRead, FramedWrite};

    use crate::bridge::channel::FrameChannel;
    use crate::bridge::codec::JsonCodec;
    use crate::bridge::protocol::{ChildMessage, HostMessage, TimerToken};
    use crate::callback::{CallbackHandler, CallbackTable};
    use crate::exit::{ExitOutcome, RespawnReason};
    use crate::instance::{BridgeConfig, BridgeHandle, BridgeInstance, CallError};
    use crate::registrar::{BridgeRef, InstanceId};

    use std::time::Duration;

    /// Test double for the child side of the channel.
    struct FakeChild {
        reader: FramedRead<DuplexStream, JsonCodec<HostMessage>>,
        writer: FramedWrite<DuplexStream, JsonCodec<ChildMessage>>,
        exit: Option<oneshot::Sender<i32>>,
    }

    impl FakeChild {
        async fn recv(&mut self) -> HostMessage {
            self.reader.next().await.unwrap().unwrap()
        }

        async fn send(&mut self, msg: ChildMessage) {
            self.writer.send(msg).await.unwrap();
        }

        fn exit(&mut self, status: i32) {
            let _ = self.exit.take().unwrap().send(status);
        }
    }

    fn start(config: BridgeConfig) -> (BridgeInstance, FakeChild) {
        let (host_out, child_in) = duplex(64 * 1024);
        let (child_out, host_in) = duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();
        let exit = async move { exit_rx.await.map_err(std::io::Error::other) }.boxed();

        let channel = FrameChannel::from_io(host_in, host_out, exit);
        let instance = BridgeInstance::start(
            InstanceId::new(),
            BridgeRef::local("test"),
            &config,
            channel,
        );
        let child = FakeChild {
            reader: FramedRead::new(child_in, JsonCodec::new()),
            writer: FramedWrite::new(child_out, JsonCodec::new()),
            exit: Some(exit_tx),
        };
        (instance, child)
    }

    fn config() -> BridgeConfig {
        BridgeConfig::new("unused", ".").with_timeout(Duration::from_millis(200))
    }

    fn invoke(function: &str, args: Vec<Value>) -> HostMessage {
        HostMessage::Invoke {
            function: function.to_string(),
            args,
        }
    }

    fn spawn_call(
        handle: &BridgeHandle,
        function: &'static str,
        timeout: Duration,
    ) -> tokio::task::JoinHandle<Result<Value, CallError>> {
        let handle = handle.clone();
        tokio::spawn(async move { handle.call(function, vec![], Some(timeout)).await })
    }

    #[tokio::test]
    async fn call_returns_ok_results() {
        let (instance, mut child) = start(config());
        let call = spawn_call(instance.handle(), "add", Duration::from_secs(1));

        assert_eq!(child.recv().await, invoke("add", vec![]));
        child.send(ChildMessage::Ok { results: json!([3]) }).await;

        assert_eq!(call.await.unwrap(), Ok(json!([3])));
    }

    #[tokio::test]
    async fn call_returns_remote_error() {
        let (instance, mut child) = start(config());
        let call = spawn_call(instance.handle(), "bad", Duration::from_secs(1));

        child.recv().await;
        child.send(ChildMessage::Error { reason: json!("badarg") }).await;

        assert_eq!(call.await.unwrap(), Err(CallError::Remote(json!("badarg"))));
        assert!(instance.handle().is_alive());
    }

    #[tokio::test]
    async fn timeout_keeps_instance_alive_and_drops_stale_reply() {
        let (instance, mut child) = start(config());
        let call = spawn_call(instance.handle(), "slow", Duration::from_millis(50));

        child.recv().await;
        assert_eq!(call.await.unwrap(), Err(CallError::Timeout));

        // Late answer for the abandoned exchange arrives while idle.
        child.send(ChildMessage::Ok { results: json!("late") }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let call = spawn_call(instance.handle(), "fast", Duration::from_secs(1));
        assert_eq!(child.recv().await, invoke("fast", vec![]));
        child.send(ChildMessage::Ok { results: json!("fresh") }).await;
        assert_eq!(call.await.unwrap(), Ok(json!("fresh")));
    }

    #[tokio::test]
    async fn deadline_spans_whole_exchange() {
        let (instance, mut child) = start(config());
        let call = spawn_call(instance.handle(), "chatty", Duration::from_millis(120));

        child.recv().await;
        // Each frame is well within the timeout, the sum is not.
        for n in 0..6 {
            child.send(ChildMessage::Info { payload: json!(n) }).await;
            tokio::time::sleep(Duration::from_millis(40)).await;
        }

        assert_eq!(call.await.unwrap(), Err(CallError::Timeout));
    }

    #[tokio::test]
    async fn unbounded_timeout_waits_for_reply() {
        let (instance, mut child) = start(config());
        let call = spawn_call(instance.handle(), "forever", Duration::MAX);

        assert_eq!(child.recv().await, invoke("forever", vec![]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        child.send(ChildMessage::Ok { results: json!("eventually") }).await;

        assert_eq!(call.await.unwrap(), Ok(json!("eventually")));
        assert!(instance.handle().is_alive());
    }

    #[tokio::test]
    async fn child_callback_gets_ref_pipe_and_args() {
        let handler: Arc<dyn CallbackHandler> = CallbackTable::new()
            .register("lookup", 3, |args| Ok(json!({ "seen": args })))
            .into_handler();
        let (instance, mut child) = start(
            config()
                .with_handler(handler)
                .with_pipe(vec![json!("pipe")]),
        );
        let call = spawn_call(instance.handle(), "outer", Duration::from_secs(1));

        child.recv().await;
        child
            .send(ChildMessage::Call {
                function: "lookup".into(),
                args: vec![json!(42)],
            })
            .await;
        assert_eq!(
            child.recv().await,
            HostMessage::Reply {
                result: json!({ "seen": [{"local": "test"}, "pipe", 42] })
            }
        );
        child.send(ChildMessage::Ok { results: json!("done") }).await;
        assert_eq!(call.await.unwrap(), Ok(json!("done")));
    }

    #[tokio::test]
    async fn missing_callback_replies_empty() {
        let (instance, mut child) = start(config());
        let call = spawn_call(instance.handle(), "outer", Duration::from_secs(1));

        child.recv().await;
        child
            .send(ChildMessage::Call {
                function: "absent".into(),
                args: vec![],
            })
            .await;
        assert_eq!(child.recv().await, HostMessage::Reply { result: json!([]) });
        child.send(ChildMessage::Ok { results: json!(null) }).await;
        assert_eq!(call.await.unwrap(), Ok(json!(null)));
    }

    #[tokio::test]
    async fn failing_callback_crashes_instance() {
        let handler = CallbackTable::new()
            .register("explode", 1, |_| Err("bad state".to_string()))
            .into_handler();
        let (instance, mut child) = start(config().with_handler(handler));
        let call = spawn_call(instance.handle(), "outer", Duration::from_secs(1));

        child.recv().await;
        child
            .send(ChildMessage::Cast {
                function: "explode".into(),
                args: vec![],
            })
            .await;

        assert_eq!(call.await.unwrap(), Err(CallError::Terminated));
        assert_eq!(
            instance.wait().await,
            ExitOutcome::Respawn(RespawnReason::CallbackFailed("bad state".to_string()))
        );
    }

    #[tokio::test]
    async fn malformed_frame_is_unsafe_data() {
        let (instance, child) = start(config());
        let handle = instance.handle().clone();
        let call = spawn_call(&handle, "outer", Duration::from_secs(1));

        let FakeChild { mut reader, writer, .. } = child;
        reader.next().await.unwrap().unwrap();
        let mut raw = writer.into_inner();
        raw.write_all(&[0, 0, 0, 2, b'}', b'{']).await.unwrap();

        assert_eq!(call.await.unwrap(), Err(CallError::Terminated));
        assert_eq!(
            instance.wait().await,
            ExitOutcome::Respawn(RespawnReason::UnsafeData)
        );
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn child_exit_is_classified() {
        let (instance, mut child) = start(config());
        let call = spawn_call(instance.handle(), "crash", Duration::from_secs(1));

        child.recv().await;
        child.exit(139);
        drop(child);

        assert_eq!(call.await.unwrap(), Err(CallError::Terminated));
        assert_eq!(
            instance.wait().await,
            ExitOutcome::Respawn(RespawnReason::Segfault)
        );
    }

    #[tokio::test]
    async fn clean_exit_while_idle() {
        let (instance, mut child) = start(config());
        child.exit(0);
        drop(child);
        assert_eq!(instance.wait().await, ExitOutcome::CleanShutdown);
    }

    #[tokio::test]
    async fn calls_are_serialized() {
        let (instance, mut child) = start(config());
        let first = spawn_call(instance.handle(), "first", Duration::from_secs(1));
        assert_eq!(child.recv().await, invoke("first", vec![]));

        let second = spawn_call(instance.handle(), "second", Duration::from_secs(1));
        // Second must not be dispatched while the first is in flight.
        let early = tokio::time::timeout(Duration::from_millis(50), child.reader.next()).await;
        assert!(early.is_err());

        child.send(ChildMessage::Ok { results: json!(1) }).await;
        assert_eq!(first.await.unwrap(), Ok(json!(1)));

        assert_eq!(child.recv().await, invoke("second", vec![]));
        child.send(ChildMessage::Ok { results: json!(2) }).await;
        assert_eq!(second.await.unwrap(), Ok(json!(2)));
    }

    #[tokio::test]
    async fn timer_registered_by_child_is_relayed() {
        let (instance, mut child) = start(config());
        let call = spawn_call(instance.handle(), "arm", Duration::from_secs(1));

        child.recv().await;
        child
            .send(ChildMessage::After {
                delay_ms: 30,
                token: TimerToken::from("wake"),
            })
            .await;
        child.send(ChildMessage::Ok { results: json!("armed") }).await;
        assert_eq!(call.await.unwrap(), Ok(json!("armed")));

        assert_eq!(
            child.recv().await,
            HostMessage::Timer {
                token: TimerToken::from("wake")
            }
        );
        child.send(ChildMessage::Ok { results: json!(null) }).await;

        // One-shot: nothing further.
        let again = tokio::time::timeout(Duration::from_millis(100), child.reader.next()).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn cancelled_interval_stops_relaying() {
        let (instance, mut child) = start(config());
        let call = spawn_call(instance.handle(), "arm", Duration::from_secs(1));

        child.recv().await;
        child
            .send(ChildMessage::Interval {
                delay_ms: 20,
                token: TimerToken::Int(1),
            })
            .await;
        child.send(ChildMessage::Ok { results: json!(null) }).await;
        call.await.unwrap().unwrap();

        for _ in 0..2 {
            assert_eq!(child.recv().await, HostMessage::Timer { token: TimerToken::Int(1) });
            child.send(ChildMessage::Ok { results: json!(null) }).await;
        }

        // Cancel inside the next tick's exchange.
        assert_eq!(child.recv().await, HostMessage::Timer { token: TimerToken::Int(1) });
        child.send(ChildMessage::Cancel { token: TimerToken::Int(1) }).await;
        child.send(ChildMessage::Ok { results: json!(null) }).await;

        let more = tokio::time::timeout(Duration::from_millis(150), child.reader.next()).await;
        assert!(more.is_err());
    }

    #[tokio::test]
    async fn cancel_of_unknown_token_is_not_fatal() {
        let (instance, mut child) = start(config());
        let call = spawn_call(instance.handle(), "outer", Duration::from_secs(1));

        child.recv().await;
        child.send(ChildMessage::Cancel { token: TimerToken::from("ghost") }).await;
        child.send(ChildMessage::Ok { results: json!(1) }).await;
        assert_eq!(call.await.unwrap(), Ok(json!(1)));
    }

    #[tokio::test]
    async fn cast_result_is_discarded() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handler = CallbackTable::new()
            .register("note", 1, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            })
            .into_handler();
        let (instance, mut child) = start(config().with_handler(handler));

        instance.handle().cast("fire", vec![json!(1)], None).await.unwrap();
        assert_eq!(child.recv().await, invoke("fire", vec![json!(1)]));
        child
            .send(ChildMessage::Cast {
                function: "note".into(),
                args: vec![],
            })
            .await;
        child.send(ChildMessage::Error { reason: json!("ignored") }).await;

        // Next call proves the cast exchange finished.
        let call = spawn_call(instance.handle(), "after", Duration::from_secs(1));
        assert_eq!(child.recv().await, invoke("after", vec![]));
        child.send(ChildMessage::Ok { results: json!(true) }).await;
        assert_eq!(call.await.unwrap(), Ok(json!(true)));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_terminates_and_fails_pending_caller() {
        let (instance, mut child) = start(config());
        let handle = instance.handle().clone();
        let call = spawn_call(&handle, "hang", Duration::from_secs(5));

        child.recv().await;
        handle.stop("maintenance");

        assert_eq!(call.await.unwrap(), Err(CallError::Terminated));
        assert_eq!(
            instance.wait().await,
            ExitOutcome::Stopped("maintenance".to_string())
        );
        assert_eq!(
            handle.call("late", vec![], None).await,
            Err(CallError::Terminated)
        );
    }

    #[tokio::test]
    async fn idle_stop_keeps_first_reason() {
        let (instance, _child) = start(config());
        let handle = instance.handle().clone();

        handle.stop("draining");
        handle.stop("ignored");

        assert_eq!(
            instance.wait().await,
            ExitOutcome::Stopped("draining".to_string())
        );
    }

    #[tokio::test]
    async fn load_goes_through_call_path() {
        let (instance, mut child) = start(config());
        let handle = instance.handle().clone();
        let load = tokio::spawn(async move { handle.load("return 1", None).await });

        assert_eq!(
            child.recv().await,
            invoke("load", vec![json!("return 1")])
        );
        child.send(ChildMessage::Ok { results: json!("loaded") }).await;
        assert_eq!(load.await.unwrap(), Ok(json!("loaded")));
    }
}
