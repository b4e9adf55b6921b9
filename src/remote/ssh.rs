use super::process::run_child;
use super::{
    CommandOutput, CommandRequest, ConnectionDescriptor, RemoteCommandRunner, RunnerError, SshAuth,
};
use crate::config::SshSettings;
use std::process::Command;

/// OpenSSH's client exits with 255 for its own failures (refused, auth,
/// dropped connection); remote commands never produce it through ssh.
pub const SSH_TRANSPORT_EXIT_CODE: i32 = 255;

/// sshpass's own failures: 3 runtime error, 4 unparseable ssh prompt,
/// 5 wrong password, 6 unknown host key. Codes 1 and 2 report bad sshpass
/// arguments, which the fixed argument vector never produces, so they are
/// left to the remote command.
pub const SSHPASS_TRANSPORT_EXIT_CODES: std::ops::RangeInclusive<i32> = 3..=6;

pub struct SshCommandRunner {
    descriptor: ConnectionDescriptor,
    settings: SshSettings,
}

impl SshCommandRunner {
    pub fn new(descriptor: ConnectionDescriptor, settings: SshSettings) -> Result<Self, RunnerError> {
        descriptor
            .validate()
            .map_err(|reason| RunnerError::Transport {
                target: descriptor.target(),
                reason,
            })?;
        Ok(Self {
            descriptor,
            settings,
        })
    }

    /// Builds the argument vector handed to the ssh client, without any
    /// password wrapper.
    pub fn ssh_args(&self, remote_command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            format!(
                "ConnectTimeout={}",
                self.settings.connect_timeout_seconds
            ),
            "-o".to_string(),
            format!(
                "StrictHostKeyChecking={}",
                self.settings.strict_host_key_checking.as_ssh_option()
            ),
            "-p".to_string(),
            self.descriptor.port.to_string(),
        ];
        match &self.descriptor.auth {
            SshAuth::Agent => {
                args.push("-o".to_string());
                args.push("BatchMode=yes".to_string());
            }
            SshAuth::Key { identity_file } => {
                args.push("-o".to_string());
                args.push("BatchMode=yes".to_string());
                args.push("-i".to_string());
                args.push(identity_file.clone());
            }
            SshAuth::Password { .. } => {
                args.push("-o".to_string());
                args.push("PubkeyAuthentication=no".to_string());
            }
        }
        let destination = match &self.descriptor.user {
            Some(user) => format!("{user}@{}", self.descriptor.host),
            None => self.descriptor.host.clone(),
        };
        args.push(destination);
        args.push("--".to_string());
        args.push(remote_command.to_string());
        args
    }

    fn build_command(&self, remote_command: &str) -> Result<(Command, String), RunnerError> {
        let args = self.ssh_args(remote_command);
        match &self.descriptor.auth {
            SshAuth::Password { password_env } => {
                let password =
                    std::env::var(password_env).map_err(|_| RunnerError::Transport {
                        target: self.descriptor.target(),
                        reason: format!("password environment variable `{password_env}` is not set"),
                    })?;
                let mut command = Command::new(&self.settings.sshpass_binary);
                command
                    .arg("-e")
                    .arg(&self.settings.binary)
                    .args(&args)
                    .env("SSHPASS", password);
                Ok((command, self.settings.sshpass_binary.clone()))
            }
            SshAuth::Agent | SshAuth::Key { .. } => {
                let mut command = Command::new(&self.settings.binary);
                command.args(&args);
                Ok((command, self.settings.binary.clone()))
            }
        }
    }

    /// Names the client that failed when `exit_code` reports a connection or
    /// authentication failure rather than the remote command's own status.
    pub fn transport_failure(&self, exit_code: i32) -> Option<&'static str> {
        if exit_code == SSH_TRANSPORT_EXIT_CODE {
            return Some("ssh");
        }
        match &self.descriptor.auth {
            SshAuth::Password { .. } if SSHPASS_TRANSPORT_EXIT_CODES.contains(&exit_code) => {
                Some("sshpass")
            }
            _ => None,
        }
    }
}

impl RemoteCommandRunner for SshCommandRunner {
    fn run(&mut self, request: &CommandRequest) -> Result<CommandOutput, RunnerError> {
        let target = self.descriptor.target();
        let (command, binary) = self.build_command(&request.command)?;
        let (output, _status) = run_child(command, request, &target, &binary)?;
        if let Some(client) = self.transport_failure(output.exit_code) {
            let reason = output.stderr.trim();
            return Err(RunnerError::Transport {
                target,
                reason: if reason.is_empty() {
                    format!("{client} exited with status {}", output.exit_code)
                } else {
                    reason.to_string()
                },
            });
        }
        Ok(output)
    }

    fn target(&self) -> String {
        self.descriptor.target()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::TransportKind;

    fn descriptor(auth: SshAuth) -> ConnectionDescriptor {
        ConnectionDescriptor {
            transport: TransportKind::Ssh,
            host: "10.0.0.5".to_string(),
            port: 2222,
            user: Some("deploy".to_string()),
            auth,
        }
    }

    #[test]
    fn key_auth_builds_batch_mode_args() {
        let runner = SshCommandRunner::new(
            descriptor(SshAuth::Key {
                identity_file: "/keys/id_ed25519".to_string(),
            }),
            SshSettings::default(),
        )
        .expect("runner");
        let args = runner.ssh_args("uname -a");
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"/keys/id_ed25519".to_string()));
        assert!(args.contains(&"2222".to_string()));
        assert_eq!(&args[args.len() - 3..], ["deploy@10.0.0.5", "--", "uname -a"]);
    }

    #[test]
    fn rejects_option_like_hosts() {
        let mut bad = descriptor(SshAuth::Agent);
        bad.host = "-oProxyCommand=evil".to_string();
        assert!(SshCommandRunner::new(bad, SshSettings::default()).is_err());
    }

    #[test]
    fn sshpass_failures_count_as_transport_errors() {
        let runner = SshCommandRunner::new(
            descriptor(SshAuth::Password {
                password_env: "DEPLOY_PASSWORD".to_string(),
            }),
            SshSettings::default(),
        )
        .expect("runner");
        assert_eq!(runner.transport_failure(5), Some("sshpass"));
        assert_eq!(runner.transport_failure(6), Some("sshpass"));
        assert_eq!(runner.transport_failure(3), Some("sshpass"));
        assert_eq!(runner.transport_failure(255), Some("ssh"));
        assert_eq!(runner.transport_failure(0), None);
        assert_eq!(runner.transport_failure(1), None);
        assert_eq!(runner.transport_failure(127), None);
    }

    #[test]
    fn key_auth_leaves_small_exit_codes_to_the_command() {
        let runner = SshCommandRunner::new(descriptor(SshAuth::Agent), SshSettings::default())
            .expect("runner");
        assert_eq!(runner.transport_failure(5), None);
        assert_eq!(runner.transport_failure(255), Some("ssh"));
    }

    #[test]
    fn password_auth_requires_env_var() {
        let mut runner = SshCommandRunner::new(
            descriptor(SshAuth::Password {
                password_env: "SHELLPILOT_TEST_UNSET_PASSWORD_VAR".to_string(),
            }),
            SshSettings::default(),
        )
        .expect("runner");
        let err = runner
            .run(&CommandRequest {
                command: "true".to_string(),
                timeout: std::time::Duration::from_secs(1),
                max_output_bytes: 1024,
                cancel: Default::default(),
            })
            .expect_err("missing password env");
        assert!(err.is_transport());
    }
}
