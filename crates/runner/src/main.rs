//! steeplechase - run a two-party test session

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use steeplechase::{launch, LaunchConfig};

#[derive(Parser)]
#[command(name = "steeplechase")]
#[command(about = "Run lockstep two-party tests through a signaling relay")]
#[command(version)]
struct Cli {
    /// Harness binary for client 1
    #[arg(long)]
    harness: PathBuf,

    /// Harness binary for client 2 (defaults to --harness)
    #[arg(long)]
    harness2: Option<PathBuf>,

    /// Test manifest (TOML)
    #[arg(long)]
    manifest: PathBuf,

    /// Signalling server URL to use for tests
    #[arg(long)]
    signalling_server: String,

    /// Extra preferences for both clients
    #[arg(long)]
    prefs_file: Option<PathBuf>,

    /// Address the manifest server listens on
    #[arg(long, default_value = "127.0.0.1:0")]
    listen: SocketAddr,

    /// host[:port] the clients use to reach the manifest server
    #[arg(long)]
    remote_webserver: Option<String>,

    /// Interpreter used to run each test file
    #[arg(long)]
    test_command: Option<String>,

    /// Save client logs to this directory
    #[arg(long)]
    save_logs_to: Option<PathBuf>,

    /// Enable debug logging (also passed to the clients)
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
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

    let config = LaunchConfig {
        harness: cli.harness,
        harness2: cli.harness2,
        manifest: cli.manifest,
        signalling_server: cli.signalling_server,
        prefs_file: cli.prefs_file,
        listen: cli.listen,
        remote_webserver: cli.remote_webserver,
        test_command: cli.test_command,
        save_logs_to: cli.save_logs_to,
        debug: cli.debug,
    };

    match launch(&config).await {
        Ok(counts) => {
            info!("Result summary:");
            info!("Passed: {}", counts.passes);
            info!("Failed: {}", counts.failures);
            if counts.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
