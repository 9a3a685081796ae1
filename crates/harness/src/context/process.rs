//! Execution contexts backed by child processes
//!
//! Each test resource runs as its own process and talks to the harness with
//! newline-delimited JSON on stdio. Lines the harness cannot parse are passed
//! through to the result stream as diagnostics.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use steeplechase_common::{Error, Message, Result};

use super::{ContextEvent, ContextLauncher, ExecutionContext, TestBridge};
use crate::mailbox::Receive;

/// Requests a test process writes on stdout
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum TestRequest {
    Loaded,
    LogResult {
        pass: bool,
        #[serde(default)]
        message: String,
    },
    Log {
        message: String,
    },
    SendMessage {
        data: Message,
    },
    WaitForMessage,
    Finished,
    Error {
        message: String,
    },
}

/// Commands the harness writes on the test's stdin
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum HarnessCommand<'a> {
    RunTest { is_initiator: bool },
    Message { data: &'a Message },
}

impl HarnessCommand<'_> {
    fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Launches `<test_command>? <tests_root>/<path>`
pub struct ProcessLauncher {
    tests_root: PathBuf,
    test_command: Option<String>,
}

impl ProcessLauncher {
    pub fn new(tests_root: impl Into<PathBuf>, test_command: Option<String>) -> Self {
        Self {
            tests_root: tests_root.into(),
            test_command,
        }
    }

    /// Resolve a manifest path inside the tests root
    fn resolve(&self, path: &str) -> std::result::Result<PathBuf, String> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err("path must stay inside the tests root".to_string());
        }
        let resolved = self.tests_root.join(relative);
        if !resolved.is_file() {
            return Err(format!("{} does not exist", resolved.display()));
        }
        Ok(resolved)
    }

    fn command(&self, script: &Path) -> Command {
        let mut words = self
            .test_command
            .as_deref()
            .map(str::split_whitespace)
            .into_iter()
            .flatten();
        let mut cmd = match words.next() {
            Some(program) => {
                let mut cmd = Command::new(program);
                cmd.args(words).arg(script);
                cmd
            }
            None => Command::new(script),
        };
        cmd.current_dir(&self.tests_root);
        cmd
    }
}

impl ContextLauncher for ProcessLauncher {
    fn launch(&self, path: &str, bridge: TestBridge) -> Result<Box<dyn ExecutionContext>> {
        let launch_error = |reason: String| Error::ContextLaunch {
            path: path.to_string(),
            reason,
        };

        let script = self.resolve(path).map_err(launch_error)?;
        let mut cmd = self.command(&script);
        cmd.env("STEEPLECHASE_TEST_PATH", path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        debug!("Launching test process {}", script.display());
        let mut child = cmd.spawn().map_err(|e| launch_error(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_error("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error("stdout not captured".to_string()))?;

        Ok(Box::new(ProcessContext::start(path, child, stdin, stdout, bridge)))
    }
}

/// A running test process
pub struct ProcessContext {
    path: String,
    child: Child,
    events: mpsc::UnboundedReceiver<ContextEvent>,
    commands: mpsc::UnboundedSender<String>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl ProcessContext {
    fn start(
        path: &str,
        child: Child,
        stdin: ChildStdin,
        stdout: ChildStdout,
        bridge: TestBridge,
    ) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        let tasks = vec![
            tokio::spawn(write_commands(stdin, command_rx)),
            tokio::spawn(answer_waits(reply_rx, commands.clone(), event_tx.clone())),
            tokio::spawn(read_requests(stdout, bridge, event_tx, reply_tx)),
        ];

        Self {
            path: path.to_string(),
            child,
            events,
            commands,
            tasks,
            closed: false,
        }
    }
}

#[async_trait]
impl ExecutionContext for ProcessContext {
    async fn next_event(&mut self) -> ContextEvent {
        self.events
            .recv()
            .await
            .unwrap_or_else(|| ContextEvent::Error("execution context exited".to_string()))
    }

    fn run_test(&mut self, is_initiator: bool) -> Result<()> {
        let line = HarnessCommand::RunTest { is_initiator }.to_line()?;
        self.commands.send(line).map_err(|_| Error::UncaughtTest {
            path: self.path.clone(),
            message: "test process stopped reading commands".to_string(),
        })
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for task in &self.tasks {
            task.abort();
        }
        if let Err(e) = self.child.kill().await {
            debug!("Test process {} already gone: {}", self.path, e);
        }
    }
}

async fn write_commands(mut stdin: ChildStdin, mut commands: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = commands.recv().await {
        trace!("-> test: {}", line);
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            warn!("Failed writing to test process: {}", e);
            break;
        }
    }
}

/// Answer `wait_for_message` requests strictly in request order
async fn answer_waits(
    mut pending: mpsc::UnboundedReceiver<Receive>,
    commands: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedSender<ContextEvent>,
) {
    while let Some(receive) = pending.recv().await {
        let reply = match receive.await {
            Ok(msg) => HarnessCommand::Message { data: &msg }.to_line(),
            Err(e) => Err(e),
        };
        match reply {
            Ok(line) => {
                if commands.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = events.send(ContextEvent::Error(e.to_string()));
                break;
            }
        }
    }
}

async fn read_requests(
    stdout: ChildStdout,
    bridge: TestBridge,
    events: mpsc::UnboundedSender<ContextEvent>,
    replies: mpsc::UnboundedSender<Receive>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                let _ = events.send(ContextEvent::Error(format!("reading test output: {}", e)));
                return;
            }
        };
        trace!("<- test: {}", line);

        let request = match serde_json::from_str::<TestRequest>(&line) {
            Ok(request) => request,
            Err(_) => {
                bridge.log(&line);
                continue;
            }
        };

        let event = match request {
            TestRequest::Loaded => Some(ContextEvent::Loaded),
            TestRequest::Finished => Some(ContextEvent::Finished),
            TestRequest::Error { message } => Some(ContextEvent::Error(message)),
            TestRequest::LogResult { pass, message } => {
                bridge.log_result(pass, &message);
                None
            }
            TestRequest::Log { message } => {
                bridge.log(&message);
                None
            }
            TestRequest::SendMessage { data } => match bridge.send_message(&data) {
                Ok(()) => None,
                Err(e) => Some(ContextEvent::Error(e.to_string())),
            },
            TestRequest::WaitForMessage => {
                // Claim the mailbox slot now so replies keep request order.
                let _ = replies.send(bridge.wait_for_message());
                None
            }
        };

        if let Some(event) = event {
            if events.send(event).is_err() {
                return;
            }
        }
    }
    let _ = events.send(ContextEvent::Error(format!(
        "test process {} exited",
        bridge.source()
    )));
}
