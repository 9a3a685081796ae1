//! Steeplechase launcher
//!
//! Serves the test manifest, writes a prefs file for each of the two harness
//! clients, runs them side by side, and judges the run on their combined
//! result streams.

pub mod clients;
pub mod error;
pub mod manifest;
pub mod runner;
pub mod server;

pub use error::{RunnerError, RunnerResult};
pub use runner::{launch, LaunchConfig};
