//! Per-session settings, as stored in a profile.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::monitor::DEFAULT_SILENCE_SECONDS;

/// Terminal type used when a profile does not name one.
pub const DEFAULT_TERMINAL_TYPE: &str = "xterm";

/// Everything a session can be configured with before it runs.
///
/// Every field has a default, so a profile file only needs the keys it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Program to run; the user's shell when unset.
    pub program: Option<String>,
    pub arguments: Vec<String>,
    pub terminal_type: String,
    pub working_directory: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    pub profile_key: Option<String>,
    pub key_bindings: String,
    pub local_tab_title_format: String,
    pub remote_tab_title_format: String,
    pub monitor_activity: bool,
    pub monitor_silence: bool,
    pub silence_seconds: u64,
    pub flow_control: bool,
    pub utf8: bool,
    pub erase_char: Option<u8>,
    pub auto_close: bool,
    pub add_to_utmp: bool,
    pub window_id: u64,
    /// IPC service name exported to the child; sessions without one do not
    /// export session correlation variables.
    pub ipc_service: Option<String>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            program: None,
            arguments: Vec::new(),
            terminal_type: DEFAULT_TERMINAL_TYPE.to_string(),
            working_directory: None,
            environment: BTreeMap::new(),
            profile_key: None,
            key_bindings: "default".to_string(),
            local_tab_title_format: "%n".to_string(),
            remote_tab_title_format: "%u".to_string(),
            monitor_activity: false,
            monitor_silence: false,
            silence_seconds: DEFAULT_SILENCE_SECONDS,
            flow_control: true,
            utf8: true,
            erase_char: None,
            auto_close: true,
            add_to_utmp: false,
            window_id: 0,
            ipc_service: None,
            rows: 24,
            cols: 80,
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, SessionError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn save(&self, path: &Path) -> Result<(), SessionError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
