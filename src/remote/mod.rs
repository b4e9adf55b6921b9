mod local;
mod process;
mod ssh;
mod types;

pub use local::LocalShellRunner;
pub use ssh::{SshCommandRunner, SSHPASS_TRANSPORT_EXIT_CODES, SSH_TRANSPORT_EXIT_CODE};
pub use types::{
    CommandOutput, CommandRequest, ConnectionDescriptor, RemoteCommandRunner, RunnerError,
    SshAuth, TransportKind,
};

use crate::config::SshSettings;

/// Opens the runner matching the descriptor's transport.
pub fn connect(
    descriptor: &ConnectionDescriptor,
    settings: &SshSettings,
) -> Result<Box<dyn RemoteCommandRunner>, RunnerError> {
    match descriptor.transport {
        TransportKind::Local => Ok(Box::new(LocalShellRunner::new())),
        TransportKind::Ssh => Ok(Box::new(SshCommandRunner::new(
            descriptor.clone(),
            settings.clone(),
        )?)),
    }
}
