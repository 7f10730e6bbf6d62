//! Running toolchain commands as child processes.

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Duration;

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Success,
    Failed(Option<i32>),
    /// Killed after the wall-clock timeout
    TimedOut,
    /// Killed because an output line matched a failure pattern
    FailureSeen,
    /// The command could not be started or waited on
    LaunchFailed,
}

/// Result of running a shell command.
#[derive(Debug)]
pub struct CommandResult {
    pub exit: Exit,
    /// Combined stdout and stderr, in arrival order
    pub output: String,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit == Exit::Success
    }
}

/// Run a shell command with a timeout.
///
/// The command is executed via `sh -c` to support shell features like pipes.
/// Output is read line by line; when `failure_patterns` is non-empty the
/// process is killed as soon as a line starts with one of them.
pub async fn run_command(
    working_dir: &Path,
    command: &str,
    timeout: Duration,
    failure_patterns: &[String],
) -> CommandResult {
    let start = Instant::now();

    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match child {
        Ok(c) => c,
        Err(e) => {
            return CommandResult {
                exit: Exit::LaunchFailed,
                output: format!("Failed to spawn command: {}", e),
                duration_ms: start.elapsed().as_millis() as u64,
            };
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(forward_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(forward_lines(stderr, tx.clone()));
    }
    drop(tx);

    let deadline = tokio::time::Instant::now() + timeout;
    let mut output = String::new();

    let exit = loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    output.push_str(&line);
                    output.push('\n');
                    if failure_patterns.iter().any(|p| !p.is_empty() && line.starts_with(p.as_str())) {
                        tracing::debug!("Failure reported, stopping test run: {}", line);
                        let _ = child.kill().await;
                        break Exit::FailureSeen;
                    }
                }
                None => {
                    // Both streams closed; the process is exiting.
                    match tokio::time::timeout_at(deadline, child.wait()).await {
                        Ok(Ok(status)) if status.success() => break Exit::Success,
                        Ok(Ok(status)) => break Exit::Failed(status.code()),
                        Ok(Err(e)) => {
                            output.push_str(&format!("Command execution error: {}\n", e));
                            break Exit::LaunchFailed;
                        }
                        Err(_) => {
                            let _ = child.kill().await;
                            break Exit::TimedOut;
                        }
                    }
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                let _ = child.kill().await;
                break Exit::TimedOut;
            }
        }
    };

    // A killed shell can leave grandchildren holding the pipes open.
    for reader in readers {
        reader.abort();
    }

    if exit == Exit::TimedOut {
        output.push_str(&format!(
            "Command timed out after {} seconds\n",
            timeout.as_secs_f64()
        ));
    }

    CommandResult {
        exit,
        output,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

fn forward_lines<R>(stream: R, tx: mpsc::UnboundedSender<String>) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    })
}

/// Best-effort kill of every process whose name starts with one of `prefixes`.
///
/// Returns how many processes were signalled.
pub fn kill_processes_by_prefix(prefixes: &[String]) -> usize {
    if prefixes.is_empty() {
        return 0;
    }
    let system = sysinfo::System::new_all();
    let own_pid = sysinfo::get_current_pid().ok();

    let mut killed = 0;
    for (pid, process) in system.processes() {
        if Some(*pid) == own_pid {
            continue;
        }
        let name = process.name().to_string_lossy();
        if prefixes.iter().any(|p| !p.is_empty() && name.starts_with(p.as_str())) {
            if process.kill() {
                tracing::info!("Killed {} (pid {})", name, pid);
                killed += 1;
            } else {
                tracing::warn!("Could not kill {} (pid {})", name, pid);
            }
        }
    }
    killed
}
