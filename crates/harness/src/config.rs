//! Harness configuration

use std::path::PathBuf;

use steeplechase_common::{keys, Prefs, Result};

/// Typed view of the preferences one party runs with
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Whether this party is the initiator
    pub is_initiator: bool,

    /// Signaling relay address
    pub signalling_server: String,

    /// Room both parties join on the relay
    pub signalling_room: String,

    /// Base URL serving `/manifest.json`
    pub harness_url: String,

    /// Directory test paths resolve against
    pub tests_root: PathBuf,

    /// Interpreter used to launch a test resource (None = execute directly)
    pub test_command: Option<String>,
}

impl HarnessConfig {
    /// Read every harness key from the preference store
    pub fn from_prefs(prefs: &Prefs) -> Result<Self> {
        Ok(Self {
            is_initiator: prefs.bool_pref(keys::IS_INITIATOR)?,
            signalling_server: prefs.char_pref(keys::SIGNALLING_SERVER)?,
            signalling_room: prefs.char_pref(keys::SIGNALLING_ROOM)?,
            harness_url: prefs.char_pref(keys::HARNESS_URL)?,
            tests_root: PathBuf::from(prefs.char_pref(keys::TESTS_ROOT)?),
            test_command: prefs
                .opt_char_pref(keys::TEST_COMMAND)?
                .filter(|c| !c.trim().is_empty()),
        })
    }

    /// Human-readable role name
    pub fn role(&self) -> &'static str {
        if self.is_initiator {
            "initiator"
        } else {
            "responder"
        }
    }
}
