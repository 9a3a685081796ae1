//! Harness clients
//!
//! Two harness processes, one per party, each with its own prefs file.
//! Their stdout is the result stream the run is judged on.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use steeplechase_common::{keys, Prefs, ResultCounts};

use crate::error::RunnerResult;

/// Placeholder in a user prefs file replaced by the manifest server's `host:port`
pub const SERVER_PLACEHOLDER: &str = "%(server)s";

/// One party to launch
#[derive(Debug, Clone)]
pub struct ClientSpec {
    pub name: String,
    pub harness: PathBuf,
    pub is_initiator: bool,
}

impl ClientSpec {
    /// Client1 (initiator) and Client2 (responder)
    pub fn pair(harness: &Path, harness2: Option<&Path>) -> [ClientSpec; 2] {
        [
            ClientSpec {
                name: "Client1".to_string(),
                harness: harness.to_path_buf(),
                is_initiator: true,
            },
            ClientSpec {
                name: "Client2".to_string(),
                harness: harness2.unwrap_or(harness).to_path_buf(),
                is_initiator: false,
            },
        ]
    }
}

/// Settings shared by both clients' prefs
#[derive(Debug, Clone)]
pub struct SharedPrefs {
    pub signalling_server: String,
    pub signalling_room: String,
    pub harness_url: String,
    pub tests_root: PathBuf,
    pub test_command: Option<String>,
}

impl SharedPrefs {
    /// Prefs for one client, layered over the user's own prefs
    pub fn for_client(&self, user: &Prefs, client: &ClientSpec) -> Prefs {
        let mut prefs = user.clone();
        let server = self
            .harness_url
            .trim_start_matches("http://")
            .trim_end_matches('/');
        prefs.interpolate(SERVER_PLACEHOLDER, server);

        prefs
            .set(keys::SIGNALLING_SERVER, self.signalling_server.as_str())
            .set(keys::SIGNALLING_ROOM, self.signalling_room.as_str())
            .set(keys::HARNESS_URL, self.harness_url.as_str())
            .set(keys::TESTS_ROOT, self.tests_root.display().to_string())
            .set(keys::IS_INITIATOR, client.is_initiator);
        if let Some(command) = &self.test_command {
            prefs.set(keys::TEST_COMMAND, command.as_str());
        }
        prefs
    }
}

/// A spawned (or failed-to-spawn) client
pub struct RunningClient {
    name: String,
    child: Result<Child, String>,
}

impl RunningClient {
    pub fn spawn(spec: &ClientSpec, prefs_path: &Path, debug: bool) -> Self {
        let mut cmd = Command::new(&spec.harness);
        cmd.arg("--prefs").arg(prefs_path);
        if debug {
            cmd.arg("--debug");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        info!("Starting {} ({})", spec.name, spec.harness.display());
        let child = cmd.spawn().map_err(|e| {
            error!("Failed to start {}: {}", spec.name, e);
            format!("Error running harness {}: {}", spec.harness.display(), e)
        });
        Self {
            name: spec.name.clone(),
            child,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().ok().and_then(Child::id)
    }

    /// Wait for exit and tally the output. A client that never started
    /// counts as one failure.
    pub async fn wait(self) -> ClientOutcome {
        let output = match self.child {
            Ok(child) => match child.wait_with_output().await {
                Ok(out) => {
                    debug!("{} exited with {}", self.name, out.status);
                    String::from_utf8_lossy(&out.stdout).into_owned()
                }
                Err(e) => {
                    return ClientOutcome::failed(self.name, format!("Error running harness: {}", e))
                }
            },
            Err(message) => return ClientOutcome::failed(self.name, message),
        };
        ClientOutcome {
            counts: ResultCounts::from_output(&output),
            name: self.name,
            output,
        }
    }
}

/// Ask a client to exit
#[cfg(unix)]
pub fn terminate(name: &str, pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    info!("Stopping {} (pid: {})", name, pid);
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!("Failed to signal {}: {}", name, e);
    }
}

#[cfg(not(unix))]
pub fn terminate(name: &str, _pid: u32) {
    // Dropping the child kills it.
    info!("Stopping {}", name);
}

/// Grace period between SIGTERM and kill
pub const STOP_GRACE: Duration = Duration::from_millis(500);

/// What one client produced
#[derive(Debug, Clone)]
pub struct ClientOutcome {
    pub name: String,
    pub counts: ResultCounts,
    pub output: String,
}

impl ClientOutcome {
    fn failed(name: String, output: String) -> Self {
        Self {
            name,
            counts: ResultCounts::new(0, 1),
            output,
        }
    }
}

/// Sum both clients, report failures, and keep logs if asked.
///
/// Tests are counted once per client.
pub fn summarize(outcomes: &[ClientOutcome], save_logs_to: Option<&Path>) -> RunnerResult<ResultCounts> {
    let mut total = ResultCounts::default();
    for outcome in outcomes {
        total += outcome.counts;
        if outcome.counts.failures > 0 {
            error!("Error in {}", outcome.name);
        }
    }
    info!("All clients finished");

    for outcome in outcomes {
        if let Some(dir) = save_logs_to {
            std::fs::write(dir.join(format!("{}.log", outcome.name)), &outcome.output)?;
        }
        if total.failures > 0 {
            info!("Log output for {}:", outcome.name);
            info!(">>>>>>>");
            for line in outcome.output.lines() {
                info!("{}", line);
            }
            info!("<<<<<<<");
        }
    }
    Ok(total)
}
