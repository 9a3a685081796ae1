//! Test slot state machine
//!
//! Drives one manifest entry through
//! `NotStarted -> AwaitingLoad -> AwaitingPeerReady -> Running -> Finished`,
//! with any error along the way ending in `Failed`. The test body is only
//! invoked once both parties have reported loading the same test.

use std::sync::Arc;
use tracing::{debug, info, warn};

use steeplechase_common::{Error, ManifestEntry, Message, Result, TestRunState, TEST_LOADED};

use crate::context::{ContextEvent, ContextLauncher, ExecutionContext, TestBridge};
use crate::mailbox::Mailbox;
use crate::report::ResultSink;
use crate::signaling::Channel;

/// Owns the single live execution context
pub struct TestSlot {
    path: String,
    is_initiator: bool,
    state: TestRunState,
    mailbox: Arc<Mailbox>,
    channel: Arc<dyn Channel>,
    sink: Arc<ResultSink>,
}

impl TestSlot {
    pub fn new(
        entry: &ManifestEntry,
        is_initiator: bool,
        mailbox: Arc<Mailbox>,
        channel: Arc<dyn Channel>,
        sink: Arc<ResultSink>,
    ) -> Self {
        Self {
            path: entry.path.clone(),
            is_initiator,
            state: TestRunState::NotStarted,
            mailbox,
            channel,
            sink,
        }
    }

    pub fn state(&self) -> TestRunState {
        self.state
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run the test to a terminal state.
    ///
    /// The context is always torn down before this returns.
    pub async fn run(&mut self, launcher: &dyn ContextLauncher) -> Result<()> {
        let bridge = TestBridge::new(
            self.path.clone(),
            self.mailbox.clone(),
            self.channel.clone(),
            self.sink.clone(),
        );

        let mut context = match launcher.launch(&self.path, bridge) {
            Ok(context) => context,
            Err(e) => {
                self.transition(TestRunState::Failed);
                return Err(e);
            }
        };
        self.transition(TestRunState::AwaitingLoad);

        let result = self.drive(context.as_mut()).await;
        context.close().await;

        match result {
            Ok(()) => {
                self.transition(TestRunState::Finished);
                info!("Finished {}", self.path);
                Ok(())
            }
            Err(e) => {
                self.transition(TestRunState::Failed);
                Err(e)
            }
        }
    }

    async fn drive(&mut self, context: &mut dyn ExecutionContext) -> Result<()> {
        let mailbox = self.mailbox.clone();

        // A broken channel fails the test in every phase, ahead of context events.
        loop {
            tokio::select! {
                biased;
                err = mailbox.failed() => return Err(err),
                event = context.next_event() => match event {
                    ContextEvent::Loaded => break,
                    other => return Err(self.unexpected(other, "before load")),
                },
            }
        }
        self.sink.diagnostic("loaded");

        self.transition(TestRunState::AwaitingPeerReady);
        self.channel.send(&Message::test_loaded(&self.path))?;

        // Claimed before anything else can wait on the mailbox.
        let mut reply = mailbox.receive();
        let reply = loop {
            tokio::select! {
                biased;
                event = context.next_event() => match event {
                    ContextEvent::Loaded => debug!("{} reported load twice", self.path),
                    other => return Err(self.unexpected(other, "while waiting for the other side")),
                },
                reply = &mut reply => break reply?,
            }
        };
        self.check_peer_ready(&reply)?;

        self.transition(TestRunState::Running);
        context.run_test(self.is_initiator)?;

        loop {
            tokio::select! {
                biased;
                err = mailbox.failed() => return Err(err),
                event = context.next_event() => match event {
                    ContextEvent::Finished => return Ok(()),
                    ContextEvent::Loaded => debug!("{} reported load while running", self.path),
                    ContextEvent::Error(message) => {
                        return Err(Error::UncaughtTest {
                            path: self.path.clone(),
                            message,
                        })
                    }
                },
            }
        }
    }

    /// The counterpart must have loaded this very test. A mismatch fails the
    /// test; later messages are not searched for a match.
    fn check_peer_ready(&self, reply: &Message) -> Result<()> {
        if reply.action != TEST_LOADED {
            return Err(Error::ProtocolMismatch(format!(
                "Looking for test_loaded, got: {}",
                reply
            )));
        }
        match reply.test() {
            Some(test) if test == self.path => Ok(()),
            other => Err(Error::ProtocolMismatch(format!(
                "Wrong test loaded on other side: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    fn unexpected(&self, event: ContextEvent, phase: &str) -> Error {
        let message = match event {
            ContextEvent::Error(message) => message,
            ContextEvent::Finished => format!("test finished {}", phase),
            ContextEvent::Loaded => format!("unexpected load {}", phase),
        };
        warn!("{}: {}", self.path, message);
        Error::UncaughtTest {
            path: self.path.clone(),
            message,
        }
    }

    fn transition(&mut self, next: TestRunState) {
        debug!("{}: {} -> {}", self.path, self.state, next);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    /// Channel that records what was sent
    #[derive(Default)]
    struct RecordingChannel(Mutex<Vec<Message>>);

    impl Channel for RecordingChannel {
        fn send(&self, msg: &Message) -> Result<()> {
            self.0.lock().push(msg.clone());
            Ok(())
        }
    }

    /// What happens once the test body is started
    enum AfterRun {
        Emit(ContextEvent),
        Disconnect,
    }

    /// Context fed by the test through a channel
    struct ScriptedContext {
        events: mpsc::UnboundedReceiver<ContextEvent>,
        feed: mpsc::UnboundedSender<ContextEvent>,
        mailbox: Arc<Mailbox>,
        after_run: Arc<Mutex<Vec<AfterRun>>>,
        runs: Arc<Mutex<Vec<bool>>>,
        closed: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl ExecutionContext for ScriptedContext {
        async fn next_event(&mut self) -> ContextEvent {
            self.events
                .recv()
                .await
                .unwrap_or_else(|| ContextEvent::Error("gone".into()))
        }

        fn run_test(&mut self, is_initiator: bool) -> Result<()> {
            self.runs.lock().push(is_initiator);
            for step in self.after_run.lock().drain(..) {
                match step {
                    AfterRun::Emit(event) => {
                        let _ = self.feed.send(event);
                    }
                    AfterRun::Disconnect => self
                        .mailbox
                        .deliver_error(Error::ChannelClosed("signaling relay disconnected".into())),
                }
            }
            Ok(())
        }

        async fn close(&mut self) {
            *self.closed.lock() = true;
        }
    }

    struct ScriptedLauncher {
        context: Mutex<Option<ScriptedContext>>,
    }

    impl ContextLauncher for ScriptedLauncher {
        fn launch(&self, path: &str, _bridge: TestBridge) -> Result<Box<dyn ExecutionContext>> {
            match self.context.lock().take() {
                Some(context) => Ok(Box::new(context)),
                None => Err(Error::ContextLaunch {
                    path: path.to_string(),
                    reason: "no window".into(),
                }),
            }
        }
    }

    struct Fixture {
        slot: TestSlot,
        launcher: ScriptedLauncher,
        events: mpsc::UnboundedSender<ContextEvent>,
        after_run: Arc<Mutex<Vec<AfterRun>>>,
        mailbox: Arc<Mailbox>,
        channel: Arc<RecordingChannel>,
        runs: Arc<Mutex<Vec<bool>>>,
        closed: Arc<Mutex<bool>>,
    }

    fn fixture(path: &str) -> Fixture {
        let (events, rx) = mpsc::unbounded_channel();
        let after_run = Arc::new(Mutex::new(Vec::new()));
        let runs = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let mailbox = Arc::new(Mailbox::new());
        let channel = Arc::new(RecordingChannel::default());
        let slot = TestSlot::new(
            &ManifestEntry::new(path),
            true,
            mailbox.clone(),
            channel.clone(),
            Arc::new(ResultSink::in_memory()),
        );
        Fixture {
            slot,
            launcher: ScriptedLauncher {
                context: Mutex::new(Some(ScriptedContext {
                    events: rx,
                    feed: events.clone(),
                    mailbox: mailbox.clone(),
                    after_run: after_run.clone(),
                    runs: runs.clone(),
                    closed: closed.clone(),
                })),
            },
            events,
            after_run,
            mailbox,
            channel,
            runs,
            closed,
        }
    }

    #[tokio::test]
    async fn test_happy_path_runs_after_peer_loaded() {
        let mut f = fixture("b.html");
        f.events.send(ContextEvent::Loaded).unwrap();
        f.mailbox.deliver(Message::test_loaded("b.html"));
        f.after_run.lock().push(AfterRun::Emit(ContextEvent::Finished));

        f.slot.run(&f.launcher).await.unwrap();

        assert_eq!(f.slot.state(), TestRunState::Finished);
        assert_eq!(*f.runs.lock(), vec![true]);
        assert!(*f.closed.lock());
        assert_eq!(*f.channel.0.lock(), vec![Message::test_loaded("b.html")]);
    }

    #[tokio::test]
    async fn test_handshake_for_other_test_is_a_mismatch() {
        let mut f = fixture("b.html");
        f.events.send(ContextEvent::Loaded).unwrap();
        f.mailbox.deliver(Message::test_loaded("a.html"));
        f.mailbox.deliver(Message::test_loaded("b.html"));

        let err = f.slot.run(&f.launcher).await.unwrap_err();

        assert!(matches!(err, Error::ProtocolMismatch(ref m) if m.contains("a.html")));
        assert_eq!(f.slot.state(), TestRunState::Failed);
        assert!(f.runs.lock().is_empty());
        assert!(*f.closed.lock());
        // The later, matching message is left alone.
        assert_eq!(f.mailbox.queued_messages(), 1);
    }

    #[tokio::test]
    async fn test_wrong_action_is_a_mismatch() {
        let mut f = fixture("b.html");
        f.events.send(ContextEvent::Loaded).unwrap();
        f.mailbox.deliver(Message::new("offer").with_field("test", "b.html"));

        let err = f.slot.run(&f.launcher).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolMismatch(ref m) if m.starts_with("Looking for test_loaded")));
    }

    #[tokio::test]
    async fn test_uncaught_error_while_waiting_for_peer() {
        let mut f = fixture("b.html");
        f.events.send(ContextEvent::Loaded).unwrap();
        f.events
            .send(ContextEvent::Error("ReferenceError: pc is not defined".into()))
            .unwrap();

        let err = f.slot.run(&f.launcher).await.unwrap_err();
        assert!(matches!(err, Error::UncaughtTest { ref message, .. } if message.contains("ReferenceError")));
        // The abandoned receive must not eat the next message.
        f.mailbox.deliver(Message::test_loaded("b.html"));
        assert_eq!(f.mailbox.queued_messages(), 1);
    }

    #[tokio::test]
    async fn test_uncaught_error_while_running() {
        let mut f = fixture("b.html");
        f.events.send(ContextEvent::Loaded).unwrap();
        f.mailbox.deliver(Message::test_loaded("b.html"));
        f.after_run
            .lock()
            .push(AfterRun::Emit(ContextEvent::Error("boom".into())));

        assert!(matches!(
            f.slot.run(&f.launcher).await,
            Err(Error::UncaughtTest { .. })
        ));
        assert_eq!(*f.runs.lock(), vec![true]);
    }

    #[tokio::test]
    async fn test_launch_failure_goes_straight_to_failed() {
        let mut f = fixture("b.html");
        f.launcher.context.lock().take();

        let err = f.slot.run(&f.launcher).await.unwrap_err();
        assert!(matches!(err, Error::ContextLaunch { .. }));
        assert_eq!(f.slot.state(), TestRunState::Failed);
        assert!(f.channel.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_while_awaiting_load() {
        let mut f = fixture("b.html");
        f.mailbox
            .deliver_error(Error::ChannelClosed("signaling relay disconnected".into()));
        f.events.send(ContextEvent::Loaded).unwrap();

        assert!(matches!(
            f.slot.run(&f.launcher).await,
            Err(Error::ChannelClosed(_))
        ));
        assert_eq!(f.slot.state(), TestRunState::Failed);
        assert!(f.channel.0.lock().is_empty());
        assert!(*f.closed.lock());
    }

    #[tokio::test]
    async fn test_disconnect_while_running_fails_the_test() {
        let mut f = fixture("b.html");
        f.events.send(ContextEvent::Loaded).unwrap();
        f.mailbox.deliver(Message::test_loaded("b.html"));
        f.after_run.lock().extend([
            AfterRun::Disconnect,
            AfterRun::Emit(ContextEvent::Finished),
        ]);

        let err = f.slot.run(&f.launcher).await.unwrap_err();

        assert!(matches!(err, Error::ChannelClosed(ref m) if m.contains("disconnected")));
        assert_eq!(f.slot.state(), TestRunState::Failed);
        assert_eq!(*f.runs.lock(), vec![true]);
        assert_eq!(f.mailbox.queued_messages(), 0);
    }

    #[tokio::test]
    async fn test_early_finish_always_beats_peer_ready() {
        for _ in 0..50 {
            let mut f = fixture("b.html");
            f.events.send(ContextEvent::Loaded).unwrap();
            f.mailbox.deliver(Message::test_loaded("b.html"));
            f.events.send(ContextEvent::Finished).unwrap();

            let err = f.slot.run(&f.launcher).await.unwrap_err();
            assert!(matches!(err, Error::UncaughtTest { ref message, .. } if message.contains("finished while waiting")));
            assert!(f.runs.lock().is_empty());
        }
    }
}
