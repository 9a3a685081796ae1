//! Test execution contexts
//!
//! A context hosts one externally supplied test body. It reports a "load"
//! event, exposes a `run_test(is_initiator)` entry point, and notifies
//! "finished" exactly once. Errors escaping the test body surface as
//! [`ContextEvent::Error`].

mod process;

pub use process::{ProcessContext, ProcessLauncher};

use async_trait::async_trait;
use std::sync::Arc;

use steeplechase_common::{Message, Result};

use crate::mailbox::{Mailbox, Receive};
use crate::report::ResultSink;
use crate::signaling::Channel;

/// Something the loaded test reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    Loaded,
    Finished,
    /// Uncaught error from the context's global error channel
    Error(String),
}

/// One live test execution context
#[async_trait]
pub trait ExecutionContext: Send {
    /// Next event from the context. Must be cancel safe.
    async fn next_event(&mut self) -> ContextEvent;

    /// Invoke the test's entry point
    fn run_test(&mut self, is_initiator: bool) -> Result<()>;

    /// Tear the context down; calling it twice is harmless
    async fn close(&mut self);
}

/// Creates execution contexts for manifest paths
pub trait ContextLauncher: Send + Sync {
    fn launch(&self, path: &str, bridge: TestBridge) -> Result<Box<dyn ExecutionContext>>;
}

/// The harness API a running test is allowed to use
#[derive(Clone)]
pub struct TestBridge {
    source: String,
    mailbox: Arc<Mailbox>,
    channel: Arc<dyn Channel>,
    sink: Arc<ResultSink>,
}

impl TestBridge {
    pub fn new(
        source: impl Into<String>,
        mailbox: Arc<Mailbox>,
        channel: Arc<dyn Channel>,
        sink: Arc<ResultSink>,
    ) -> Self {
        Self {
            source: source.into(),
            mailbox,
            channel,
            sink,
        }
    }

    /// Source identifier stamped on this test's records
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Record the outcome of one assertion
    pub fn log_result(&self, pass: bool, message: &str) {
        self.sink.log_result(pass, message, self.source.as_str());
    }

    pub fn log(&self, message: &str) {
        self.sink.diagnostic(message);
    }

    /// Relay `data` to the counterpart
    pub fn send_message(&self, data: &Message) -> Result<()> {
        self.channel.send(data)
    }

    /// Next message from the counterpart, claimed in call order
    pub fn wait_for_message(&self) -> Receive {
        self.mailbox.receive()
    }
}
