use crate::agent::arch::Arch;
use crate::agent::error::Error;
use serde::Deserialize;
use std::fs::read_to_string;
use std::io;
use std::path::Path;
use std::time::Duration;

/// Debug agent settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Architecture of debugged processes.
    pub arch: Arch,
    /// Deadline for thread suspension confirmation, in milliseconds.
    pub suspend_timeout_ms: u64,
    /// Number of hardware debug slots per thread, if `None` - architecture default.
    pub hardware_slots: Option<u8>,
    /// `env_logger` filter string.
    pub log_filter: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            arch: Arch::default(),
            suspend_timeout_ms: 1000,
            hardware_slots: None,
            log_filter: None,
        }
    }
}

impl AgentConfig {
    const DEFAULT_PATH: &'static str = ".config/stopgate/config.toml";

    /// Load config from file. If `path` is `None` - a file from the user home directory is used.
    /// Absence of the file is not an error, defaults returned.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let data = match path {
            Some(path) => read_to_string(path)?,
            None => {
                let Some(home) = home::home_dir() else {
                    return Ok(Self::default());
                };
                match read_to_string(home.join(Self::DEFAULT_PATH)) {
                    Ok(data) => data,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
                    Err(e) => return Err(e.into()),
                }
            }
        };
        Self::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> Result<Self, Error> {
        Ok(toml::de::from_str(data)?)
    }

    pub fn suspend_timeout(&self) -> Duration {
        Duration::from_millis(self.suspend_timeout_ms)
    }

    pub fn hardware_slots(&self) -> u8 {
        self.hardware_slots
            .unwrap_or_else(|| self.arch.default_hardware_slots())
    }
}
