//! Steeplechase harness
//!
//! One party of a lockstep two-party test run. Results go to stdout as JSON
//! lines; logs go to stderr.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use steeplechase_common::{Error, Outcome, Prefs, ResultRecord, HARNESS_SOURCE};
use steeplechase_harness::{
    HarnessConfig, Host, ManifestLoader, Orchestrator, ProcessHost, ProcessLauncher, ResultSink,
    SocketIoConnector, Terminator,
};

#[derive(Parser)]
#[command(name = "steeplechase-harness")]
#[command(about = "Steeplechase harness - runs one side of a two-party test session")]
#[command(version)]
struct Cli {
    /// Preferences file written by the launcher
    #[arg(short, long, env = "STEEPLECHASE_PREFS")]
    prefs: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("Steeplechase harness v{}", env!("CARGO_PKG_VERSION"));

    let sink = Arc::new(ResultSink::stdout());
    let host: Arc<dyn Host> = Arc::new(ProcessHost);

    let config = match Prefs::load(&cli.prefs).and_then(|prefs| HarnessConfig::from_prefs(&prefs)) {
        Ok(config) => config,
        Err(e) => {
            startup_failure(&sink, host, e);
            return Ok(());
        }
    };
    info!(
        "Running as {} in room {}",
        config.role(),
        config.signalling_room
    );

    let components = ManifestLoader::new(&config.harness_url).and_then(|manifest| {
        SocketIoConnector::new(&config.signalling_server, &config.signalling_room)
            .map(|connector| (manifest, connector))
    });
    let (manifest, connector) = match components {
        Ok(components) => components,
        Err(e) => {
            startup_failure(&sink, host, e);
            return Ok(());
        }
    };
    let launcher = ProcessLauncher::new(config.tests_root.clone(), config.test_command.clone());

    let mut orchestrator = Orchestrator::new(
        config.is_initiator,
        Arc::new(manifest),
        Arc::new(connector),
        Arc::new(launcher),
        sink,
        host,
    );
    let report = orchestrator.run().await;
    info!("Run ended after {} test(s): {:?}", report.tests_started, report.outcome);
    Ok(())
}

/// Failures before the orchestrator exists still produce a harness record
fn startup_failure(sink: &ResultSink, host: Arc<dyn Host>, err: Error) {
    error!("Harness startup failed: {}", err);
    sink.emit(ResultRecord::now(Outcome::Fail, err.to_string(), HARNESS_SOURCE));
    Terminator::new(host).terminate();
}
