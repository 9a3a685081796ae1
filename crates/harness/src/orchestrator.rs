//! Harness orchestrator
//!
//! Fetches the manifest and brings up the signaling room concurrently, then
//! walks the manifest one test at a time. Every unrecoverable error ends in
//! [`Orchestrator::harness_error`], which records a harness-level failure and
//! quits the host.

use std::sync::Arc;
use tracing::{debug, error, info};

use steeplechase_common::{Error, ManifestEntry, Outcome, Result, ResultRecord, HARNESS_SOURCE};

use crate::context::ContextLauncher;
use crate::host::{Host, Terminator};
use crate::mailbox::Mailbox;
use crate::manifest::ManifestSource;
use crate::report::ResultSink;
use crate::signaling::{Channel, SignalingConnector};
use crate::slot::TestSlot;

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every manifest entry reached `Finished`
    Completed,
    /// A harness error stopped the run; carries the reported message
    Aborted(String),
}

/// Summary returned once the host has been asked to quit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub tests_started: usize,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}

/// Top-level driver for one party
pub struct Orchestrator {
    is_initiator: bool,
    manifest: Arc<dyn ManifestSource>,
    connector: Arc<dyn SignalingConnector>,
    launcher: Arc<dyn ContextLauncher>,
    mailbox: Arc<Mailbox>,
    sink: Arc<ResultSink>,
    terminator: Terminator,
    tests: Vec<ManifestEntry>,
    current_test: Option<usize>,
}

impl Orchestrator {
    pub fn new(
        is_initiator: bool,
        manifest: Arc<dyn ManifestSource>,
        connector: Arc<dyn SignalingConnector>,
        launcher: Arc<dyn ContextLauncher>,
        sink: Arc<ResultSink>,
        host: Arc<dyn Host>,
    ) -> Self {
        Self {
            is_initiator,
            manifest,
            connector,
            launcher,
            mailbox: Arc::new(Mailbox::new()),
            sink,
            terminator: Terminator::new(host),
            tests: Vec::new(),
            current_test: None,
        }
    }

    /// Mailbox fed by the signaling session
    pub fn mailbox(&self) -> Arc<Mailbox> {
        self.mailbox.clone()
    }

    /// Index of the test currently (or last) driven, if any
    pub fn current_index(&self) -> Option<usize> {
        self.current_test
    }

    pub fn tests(&self) -> &[ManifestEntry] {
        &self.tests
    }

    /// Run to completion. The host's quit has been called exactly once by
    /// the time this returns.
    pub async fn run(&mut self) -> RunReport {
        let manifest = self.manifest.clone();
        let connector = self.connector.clone();
        let mailbox = self.mailbox.clone();

        let started = tokio::try_join!(manifest.load(), connector.connect(mailbox));
        let (tests, channel) = match started {
            Ok(started) => started,
            Err(e) => return self.harness_error(e),
        };

        info!(
            "Running {} test(s) as {}",
            tests.len(),
            if self.is_initiator { "initiator" } else { "responder" }
        );
        self.tests = tests;

        loop {
            match self.advance_to_next(&channel).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => return self.harness_error(e),
            }
        }

        info!("All tests finished");
        self.terminator.terminate();
        RunReport {
            tests_started: self.tests_started(),
            outcome: RunOutcome::Completed,
        }
    }

    /// Drive the next manifest entry. `Ok(false)` once the manifest is exhausted.
    async fn advance_to_next(&mut self, channel: &Arc<dyn Channel>) -> Result<bool> {
        let next = self.current_test.map_or(0, |i| i + 1);
        let Some(entry) = self.tests.get(next) else {
            return Ok(false);
        };
        self.current_test = Some(next);
        debug!("Starting test {} of {}: {}", next + 1, self.tests.len(), entry.path);

        let mut slot = TestSlot::new(
            entry,
            self.is_initiator,
            self.mailbox.clone(),
            channel.clone(),
            self.sink.clone(),
        );
        slot.run(self.launcher.as_ref()).await?;
        Ok(true)
    }

    /// Record a harness-level failure and quit
    fn harness_error(&self, err: Error) -> RunReport {
        let message = match (self.current_path(), &err) {
            (Some(_), Error::UncaughtTest { .. } | Error::ContextLaunch { .. }) | (None, _) => {
                err.to_string()
            }
            (Some(path), _) => format!("{}: {}", path, err),
        };
        error!("Harness error ({}): {}", err.kind(), message);

        self.sink
            .emit(ResultRecord::now(Outcome::Fail, message.clone(), HARNESS_SOURCE));
        self.sink.diagnostic(&format!("{:?}", err));
        self.terminator.terminate();

        RunReport {
            tests_started: self.tests_started(),
            outcome: RunOutcome::Aborted(message),
        }
    }

    fn current_path(&self) -> Option<&str> {
        self.current_test
            .and_then(|i| self.tests.get(i))
            .map(|entry| entry.path.as_str())
    }

    fn tests_started(&self) -> usize {
        self.current_test.map_or(0, |i| i + 1)
    }
}
