//! Steeplechase harness
//!
//! Runs one party of a two-party test session: loads the manifest, joins the
//! signaling room, and executes each test in lockstep with the counterpart.

pub mod config;
pub mod context;
pub mod host;
pub mod mailbox;
pub mod manifest;
pub mod orchestrator;
pub mod report;
pub mod signaling;
pub mod slot;

pub use config::HarnessConfig;
pub use context::{ContextEvent, ContextLauncher, ExecutionContext, ProcessLauncher, TestBridge};
pub use host::{Host, ProcessHost, Terminator};
pub use mailbox::{Mailbox, Receive};
pub use manifest::{ManifestLoader, ManifestSource, StaticManifest};
pub use orchestrator::{Orchestrator, RunOutcome, RunReport};
pub use report::ResultSink;
pub use signaling::{Channel, SignalingConnector, SignalingSession, SocketIoConnector};
pub use slot::TestSlot;
