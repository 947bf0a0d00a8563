//! Remote suspend execution over SSH
//!
//! The suspend command is configured per host and executed through the
//! system `ssh` client. The execution timeout is separate from connection
//! establishment: `ssh` gets its own `ConnectTimeout`, while the overall
//! child is killed once the execution deadline passes.

use crate::error::ControlError;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Where and how to run the suspend command
#[derive(Debug, Clone)]
pub struct SuspendTarget {
    pub addr: IpAddr,
    pub ssh_port: u16,
    pub username: String,
    pub password: Option<String>,
    pub key_file: Option<PathBuf>,
    /// Remote command line, tokenized with shell rules
    pub command: String,
}

/// Build the argv for the suspend invocation.
///
/// Password authentication goes through `sshpass` since `ssh` itself only
/// reads passwords from a terminal.
fn build_command(target: &SuspendTarget, connect_timeout: Duration) -> Result<Vec<String>, ControlError> {
    let remote_args = shell_words::split(&target.command)
        .map_err(|e| ControlError::Suspend(format!("bad suspend command: {}", e)))?;
    if remote_args.is_empty() {
        return Err(ControlError::Suspend("empty suspend command".to_string()));
    }

    let mut argv = Vec::new();
    if let Some(password) = &target.password {
        argv.extend(["sshpass".to_string(), "-p".to_string(), password.clone()]);
    }
    argv.push("ssh".to_string());
    argv.extend([
        "-o".to_string(),
        "BatchMode=no".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        "-p".to_string(),
        target.ssh_port.to_string(),
    ]);
    if let Some(key) = &target.key_file {
        argv.extend(["-i".to_string(), key.display().to_string()]);
    }
    argv.push(format!("{}@{}", target.username, target.addr));
    argv.extend(remote_args);
    Ok(argv)
}

/// Run the suspend command, enforcing `exec_timeout` on the whole execution.
///
/// On timeout the child is killed and the call fails with `CommandTimeout`;
/// the host may or may not have received the command.
pub async fn run_suspend(
    target: &SuspendTarget,
    exec_timeout: Duration,
    connect_timeout: Duration,
) -> Result<String, ControlError> {
    let argv = build_command(target, connect_timeout)?;
    debug!(addr = %target.addr, user = %target.username, "Running suspend command");

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| ControlError::Suspend(format!("cannot launch {}: {}", argv[0], e)))?;

    match tokio::time::timeout(exec_timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(ControlError::Suspend(format!(
                    "{}: {}",
                    output.status,
                    stderr.trim()
                )))
            }
        }
        Ok(Err(e)) => Err(ControlError::Suspend(e.to_string())),
        Err(_) => {
            // kill_on_drop reaps the abandoned child
            warn!(addr = %target.addr, timeout_ms = exec_timeout.as_millis() as u64, "Suspend command timed out");
            Err(ControlError::CommandTimeout(exec_timeout))
        }
    }
}
