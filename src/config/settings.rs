use super::ConfigError;
use crate::execution::template::is_valid_var_name;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_INTERACTION_TIMEOUT_SECONDS: u64 = 180;
pub const DEFAULT_COMMAND_TIMEOUT_SECONDS: u64 = 600;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    File,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    Yes,
    AcceptNew,
    No,
}

impl HostKeyPolicy {
    pub fn as_ssh_option(&self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::AcceptNew => "accept-new",
            Self::No => "no",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SshSettings {
    #[serde(default = "default_ssh_binary")]
    pub binary: String,
    #[serde(default = "default_sshpass_binary")]
    pub sshpass_binary: String,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_host_key_policy")]
    pub strict_host_key_checking: HostKeyPolicy,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            binary: default_ssh_binary(),
            sshpass_binary: default_sshpass_binary(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
            strict_host_key_checking: default_host_key_policy(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub state_root: Option<PathBuf>,
    #[serde(default = "default_interaction_timeout_seconds")]
    pub interaction_timeout_seconds: u64,
    #[serde(default = "default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub store: StoreKind,
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub global_vars: BTreeMap<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_root: None,
            interaction_timeout_seconds: default_interaction_timeout_seconds(),
            command_timeout_seconds: default_command_timeout_seconds(),
            max_output_bytes: default_max_output_bytes(),
            store: StoreKind::default(),
            ssh: SshSettings::default(),
            global_vars: BTreeMap::new(),
        }
    }
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(root) = &self.state_root {
            if !root.is_absolute() {
                return Err(ConfigError::Settings(
                    "`state_root` must be an absolute path".to_string(),
                ));
            }
        }
        if self.interaction_timeout_seconds == 0 {
            return Err(ConfigError::Settings(
                "`interaction_timeout_seconds` must be greater than 0".to_string(),
            ));
        }
        if self.command_timeout_seconds == 0 {
            return Err(ConfigError::Settings(
                "`command_timeout_seconds` must be greater than 0".to_string(),
            ));
        }
        if self.max_output_bytes == 0 {
            return Err(ConfigError::Settings(
                "`max_output_bytes` must be greater than 0".to_string(),
            ));
        }
        if self.ssh.binary.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`ssh.binary` must be non-empty".to_string(),
            ));
        }
        for name in self.global_vars.keys() {
            if !is_valid_var_name(name) {
                return Err(ConfigError::Settings(format!(
                    "global variable name `{name}` must match [A-Za-z_][A-Za-z0-9_]*"
                )));
            }
        }
        Ok(())
    }

    pub fn resolve_state_root(&self) -> Result<PathBuf, ConfigError> {
        match &self.state_root {
            Some(root) => Ok(root.clone()),
            None => super::default_state_root_path(),
        }
    }

    pub fn interaction_timeout(&self) -> Duration {
        Duration::from_secs(self.interaction_timeout_seconds)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

fn default_interaction_timeout_seconds() -> u64 {
    DEFAULT_INTERACTION_TIMEOUT_SECONDS
}

fn default_command_timeout_seconds() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECONDS
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_sshpass_binary() -> String {
    "sshpass".to_string()
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

fn default_host_key_policy() -> HostKeyPolicy {
    HostKeyPolicy::AcceptNew
}
