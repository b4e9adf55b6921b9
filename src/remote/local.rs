use super::process::run_child;
use super::{CommandOutput, CommandRequest, RemoteCommandRunner, RunnerError};
use std::process::Command;

/// Runs commands through `sh -c` on this machine. Used for `transport: local`
/// plans and for exercising the engine without a remote host.
#[derive(Debug, Clone)]
pub struct LocalShellRunner {
    shell: String,
}

impl Default for LocalShellRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl LocalShellRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RemoteCommandRunner for LocalShellRunner {
    fn run(&mut self, request: &CommandRequest) -> Result<CommandOutput, RunnerError> {
        let mut command = Command::new(&self.shell);
        command.arg("-c").arg(&request.command);
        let (output, _status) = run_child(command, request, "local", &self.shell)?;
        Ok(output)
    }

    fn target(&self) -> String {
        "local".to_string()
    }
}
