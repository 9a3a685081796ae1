//! Core types for Steeplechase

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// One test descriptor from the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Resource path relative to the tests root
    pub path: String,
}

impl ManifestEntry {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Ordered list of tests; order is execution order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub tests: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tests: paths.into_iter().map(ManifestEntry::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

/// Action tag of the readiness handshake message
pub const TEST_LOADED: &str = "test_loaded";

/// Application message relayed between the two parties.
///
/// `action` identifies the purpose; every other field is carried as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub action: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Message {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// `{"action": "test_loaded", "test": path}`
    pub fn test_loaded(path: &str) -> Self {
        Self::new(TEST_LOADED).with_field("test", path)
    }

    /// The `test` field, when it is a string
    pub fn test(&self) -> Option<&str> {
        self.fields.get("test").and_then(Value::as_str)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{{\"action\":{:?}}}", self.action),
        }
    }
}

/// Outcome of a single assertion or harness-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "test_pass")]
    Pass,
    #[serde(rename = "test_unexpected_fail")]
    Fail,
}

impl Outcome {
    pub fn from_pass(pass: bool) -> Self {
        if pass {
            Outcome::Pass
        } else {
            Outcome::Fail
        }
    }

    pub fn as_action(&self) -> &'static str {
        match self {
            Outcome::Pass => "test_pass",
            Outcome::Fail => "test_unexpected_fail",
        }
    }
}

/// One line of the result stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(rename = "action")]
    pub outcome: Outcome,
    pub message: String,
    #[serde(rename = "time")]
    pub timestamp_ms: i64,
    #[serde(rename = "source_file")]
    pub source: String,
}

impl ResultRecord {
    /// Create a record stamped with the current wall-clock time
    pub fn now(outcome: Outcome, message: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            source: source.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome == Outcome::Fail
    }
}

/// Lifecycle of the single live test slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestRunState {
    NotStarted,
    AwaitingLoad,
    AwaitingPeerReady,
    Running,
    Finished,
    Failed,
}

impl TestRunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TestRunState::Finished | TestRunState::Failed)
    }
}

impl Default for TestRunState {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl fmt::Display for TestRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestRunState::NotStarted => "not_started",
            TestRunState::AwaitingLoad => "awaiting_load",
            TestRunState::AwaitingPeerReady => "awaiting_peer_ready",
            TestRunState::Running => "running",
            TestRunState::Finished => "finished",
            TestRunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Two-party rendezvous state on the signaling relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingRoomState {
    Connecting,
    Connected,
    AwaitingPeer,
    Ready,
    Failed,
}

impl Default for SignalingRoomState {
    fn default() -> Self {
        Self::Connecting
    }
}

impl fmt::Display for SignalingRoomState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalingRoomState::Connecting => "connecting",
            SignalingRoomState::Connected => "connected",
            SignalingRoomState::AwaitingPeer => "awaiting_peer",
            SignalingRoomState::Ready => "ready",
            SignalingRoomState::Failed => "failed",
        };
        f.write_str(s)
    }
}
