use super::{CommandOutput, CommandRequest, RunnerError};
use std::io::Read;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Spawns `command`, captures capped stdout/stderr on reader threads and
/// enforces the request timeout and cancellation by killing the child's
/// whole process group.
pub(crate) fn run_child(
    mut command: Command,
    request: &CommandRequest,
    target: &str,
    binary: &str,
) -> Result<(CommandOutput, ExitStatus), RunnerError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    command.process_group(0);

    let start = Instant::now();
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(RunnerError::MissingBinary {
                binary: binary.to_string(),
            })
        }
        Err(source) => {
            return Err(RunnerError::Io {
                target: target.to_string(),
                source,
            })
        }
    };

    let stdout = child.stdout.take().ok_or_else(|| RunnerError::Io {
        target: target.to_string(),
        source: std::io::Error::other("missing stdout pipe"),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| RunnerError::Io {
        target: target.to_string(),
        source: std::io::Error::other("missing stderr pipe"),
    })?;

    let cap = request.max_output_bytes;
    let stdout_reader = thread::spawn(move || read_capped(stdout, cap));
    let stderr_reader = thread::spawn(move || read_capped(stderr, cap));

    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                let timed_out = start.elapsed() > request.timeout;
                let cancelled = request.cancel.is_cancelled();
                if timed_out || cancelled {
                    kill_process_group(&mut child);
                    // Readers are left detached: a descendant that escaped the
                    // group may still hold the pipes open.
                    drop(stdout_reader);
                    drop(stderr_reader);
                    if cancelled {
                        return Err(RunnerError::Cancelled {
                            target: target.to_string(),
                        });
                    }
                    return Err(RunnerError::Timeout {
                        target: target.to_string(),
                        timeout_ms: request.timeout.as_millis() as u64,
                    });
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(source) => {
                return Err(RunnerError::Io {
                    target: target.to_string(),
                    source,
                })
            }
        }
    };

    let (stdout, stdout_truncated) = stdout_reader.join().unwrap_or_default();
    let (stderr, stderr_truncated) = stderr_reader.join().unwrap_or_default();

    Ok((
        CommandOutput {
            exit_code: exit_status.code().unwrap_or(-1),
            stdout,
            stderr,
            duration_ms: start.elapsed().as_millis() as u64,
            stdout_truncated,
            stderr_truncated,
        },
        exit_status,
    ))
}

/// The child leads its own group, so killing `-pid` also takes down
/// everything a compound `sh -c` command started.
fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .arg("-KILL")
            .arg("--")
            .arg(format!("-{}", child.id()))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Keeps at most `cap` bytes but drains the pipe to EOF so the child never
/// blocks on a full pipe.
fn read_capped<R: Read>(mut reader: R, cap: usize) -> (String, bool) {
    let mut kept = Vec::new();
    let mut chunk = [0_u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
                if n > room {
                    truncated = true;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    (String::from_utf8_lossy(&kept).into_owned(), truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_capped_truncates_and_flags() {
        let data = vec![b'a'; 20_000];
        let (kept, truncated) = read_capped(data.as_slice(), 100);
        assert_eq!(kept.len(), 100);
        assert!(truncated);

        let (kept, truncated) = read_capped(&b"short"[..], 100);
        assert_eq!(kept, "short");
        assert!(!truncated);
    }
}
