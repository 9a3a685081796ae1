//! Run both harness clients against a served manifest

use futures::future::join_all;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use steeplechase_common::{Prefs, ResultCounts};

use crate::clients::{self, ClientSpec, RunningClient, SharedPrefs};
use crate::error::{RunnerError, RunnerResult};
use crate::manifest::TestManifest;
use crate::server::{self, ManifestServer};

/// Everything a run needs
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Harness binary for Client1
    pub harness: PathBuf,
    /// Harness binary for Client2 (defaults to `harness`)
    pub harness2: Option<PathBuf>,
    pub manifest: PathBuf,
    pub signalling_server: String,
    /// Extra prefs merged into both clients' prefs
    pub prefs_file: Option<PathBuf>,
    pub listen: SocketAddr,
    /// `host[:port]` the clients should use to reach the manifest server
    pub remote_webserver: Option<String>,
    pub test_command: Option<String>,
    pub save_logs_to: Option<PathBuf>,
    pub debug: bool,
}

impl LaunchConfig {
    /// Check that every referenced file and directory exists
    pub fn validate(&self) -> RunnerResult<()> {
        require_file("Harness", &self.harness)?;
        if let Some(harness2) = &self.harness2 {
            require_file("Harness", harness2)?;
        }
        require_file("Manifest", &self.manifest)?;
        if let Some(prefs) = &self.prefs_file {
            require_file("Prefs file", prefs)?;
        }
        if let Some(dir) = &self.save_logs_to {
            if !dir.is_dir() {
                return Err(RunnerError::InvalidArgument(format!(
                    "Log directory {} does not exist",
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}

fn require_file(what: &str, path: &Path) -> RunnerResult<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(RunnerError::InvalidArgument(format!(
            "{} {} does not exist",
            what,
            path.display()
        )))
    }
}

/// Serve the manifest, run both clients to completion, and tally the results
pub async fn launch(config: &LaunchConfig) -> RunnerResult<ResultCounts> {
    config.validate()?;

    let manifest = TestManifest::load(&config.manifest)?;
    let tests = manifest.active();
    info!("{} test(s) to run", tests.len());

    let user_prefs = match &config.prefs_file {
        Some(path) => Prefs::load(path)?,
        None => Prefs::new(),
    };

    let listen = server::listen_addr(config.listen, config.remote_webserver.as_deref());
    let server = ManifestServer::start(listen, tests).await?;
    let harness_url = server::advertised_url(server.local_addr(), config.remote_webserver.as_deref());

    let shared = SharedPrefs {
        signalling_server: config.signalling_server.clone(),
        signalling_room: uuid::Uuid::new_v4().to_string(),
        harness_url,
        tests_root: std::fs::canonicalize(manifest.root())?,
        test_command: config.test_command.clone(),
    };
    info!("Signalling room {}", shared.signalling_room);

    let profiles = tempfile::tempdir()?;
    let mut running = Vec::new();
    for spec in ClientSpec::pair(&config.harness, config.harness2.as_deref()) {
        info!("Writing prefs for {}...", spec.name);
        let prefs_path = profiles.path().join(&spec.name).join("prefs.toml");
        shared.for_client(&user_prefs, &spec).save(&prefs_path)?;
        running.push(RunningClient::spawn(&spec, &prefs_path, config.debug));
    }

    let pids: Vec<(String, u32)> = running
        .iter()
        .filter_map(|c| c.pid().map(|pid| (c.name().to_string(), pid)))
        .collect();

    info!("Waiting for results...");
    let waiting = join_all(running.into_iter().map(RunningClient::wait));
    tokio::pin!(waiting);

    let outcomes = tokio::select! {
        outcomes = &mut waiting => outcomes,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping clients");
            for (name, pid) in &pids {
                clients::terminate(name, *pid);
            }
            // Anything still running after the grace period is killed on drop.
            let _ = tokio::time::timeout(clients::STOP_GRACE, &mut waiting).await;
            server.stop().await;
            return Err(RunnerError::Interrupted);
        }
    };
    server.stop().await;

    clients::summarize(&outcomes, config.save_logs_to.as_deref())
}
