//! Steeplechase Common Library
//!
//! Shared types, preferences, and the error taxonomy used by both the
//! per-party harness and the two-party launcher.

pub mod error;
pub mod prefs;
pub mod results;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use prefs::{PrefValue, Prefs};
pub use results::ResultCounts;
pub use types::*;

/// Steeplechase version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Well-known path the manifest is served from
pub const MANIFEST_PATH: &str = "/manifest.json";

/// Source identifier used for failures raised by the harness itself
pub const HARNESS_SOURCE: &str = "harness";

/// Preference keys shared by the harness and the launcher
pub mod keys {
    pub const IS_INITIATOR: &str = "steeplechase.is_initiator";
    pub const SIGNALLING_SERVER: &str = "steeplechase.signalling_server";
    pub const SIGNALLING_ROOM: &str = "steeplechase.signalling_room";
    pub const HARNESS_URL: &str = "steeplechase.harness_url";
    pub const TESTS_ROOT: &str = "steeplechase.tests_root";
    pub const TEST_COMMAND: &str = "steeplechase.test_command";
}
