use crate::shared::cancel::CancellationToken;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("transport failure for {target}: {reason}")]
    Transport { target: String, reason: String },
    #[error("remote shell binary missing: {binary}")]
    MissingBinary { binary: String },
    #[error("command timed out on {target} after {timeout_ms}ms")]
    Timeout { target: String, timeout_ms: u64 },
    #[error("command cancelled on {target}")]
    Cancelled { target: String },
    #[error("io error running command on {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

impl RunnerError {
    /// Transport-class failures end the session regardless of step policy.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::MissingBinary { .. } | Self::Io { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Ssh,
    Local,
}

/// Credentials are referenced, never embedded: a password is read from the
/// named environment variable at connect time.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SshAuth {
    #[default]
    Agent,
    Key {
        identity_file: String,
    },
    Password {
        password_env: String,
    },
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "Agent"),
            Self::Key { identity_file } => write!(f, "Key({identity_file})"),
            Self::Password { password_env } => write!(f, "Password(env:{password_env})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    #[serde(default)]
    pub transport: TransportKind,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub auth: SshAuth,
}

impl ConnectionDescriptor {
    pub fn local() -> Self {
        Self {
            transport: TransportKind::Local,
            host: "localhost".to_string(),
            port: default_ssh_port(),
            user: None,
            auth: SshAuth::Agent,
        }
    }

    pub fn target(&self) -> String {
        match (&self.transport, &self.user) {
            (TransportKind::Local, _) => "local".to_string(),
            (TransportKind::Ssh, Some(user)) => format!("{user}@{}:{}", self.host, self.port),
            (TransportKind::Ssh, None) => format!("{}:{}", self.host, self.port),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.transport == TransportKind::Local {
            return Ok(());
        }
        if self.host.trim().is_empty() {
            return Err("connection host must be non-empty".to_string());
        }
        if self.host.starts_with('-') {
            return Err(format!("connection host `{}` is not a hostname", self.host));
        }
        if let Some(user) = &self.user {
            if user.is_empty() || user.starts_with('-') || user.contains('@') {
                return Err(format!("connection user `{user}` is invalid"));
            }
        }
        Ok(())
    }
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

/// Runs single command strings against one remote host. Implementations own
/// their connection exclusively; the engine never shares one across sessions.
pub trait RemoteCommandRunner: Send {
    fn run(&mut self, request: &CommandRequest) -> Result<CommandOutput, RunnerError>;

    fn target(&self) -> String;
}
