//! Before/after deploy command hooks (§4.7, supplemented from
//! `original_source/deployment/process.py`): shells out to each configured
//! command in order, killing it if it runs longer than `TIMEOUT`.

use std::process::{Child, Command};
use std::thread;
use std::time::Duration;

use tracing::{error, info};

use crate::error::{DeployError, Result};

const TIMEOUT: Duration = Duration::from_secs(60);

/// Runs `commands` in order inside `cwd`, stopping at the first failure.
pub fn run_commands(commands: &[String], cwd: &std::path::Path, label: &str) -> Result<()> {
    for command in commands {
        info!("{label}: {command}");
        run_one(command, cwd)?;
    }
    Ok(())
}

fn run_one(command: &str, cwd: &std::path::Path) -> Result<()> {
    let mut child = spawn(command, cwd)?;
    wait_with_timeout(&mut child, command)
}

fn spawn(command: &str, cwd: &std::path::Path) -> Result<Child> {
    let child = if cfg!(windows) {
        Command::new("cmd").arg("/C").arg(command).current_dir(cwd).spawn()
    } else {
        Command::new("sh").arg("-c").arg(command).current_dir(cwd).spawn()
    };
    child.map_err(|e| DeployError::message(format!("failed to start `{command}`: {e}")))
}

/// Polls `child` for completion, killing it if `TIMEOUT` elapses first.
fn wait_with_timeout(child: &mut Child, command: &str) -> Result<()> {
    let start = std::time::Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if status.success() {
                    return Ok(());
                }
                return Err(DeployError::message(format!("`{command}` exited with {status}")));
            }
            Ok(None) => {
                if start.elapsed() >= TIMEOUT {
                    error!("`{command}` exceeded {}s, killing", TIMEOUT.as_secs());
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(DeployError::message(format!(
                        "`{command}` timed out after {}s",
                        TIMEOUT.as_secs()
                    )));
                }
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(DeployError::message(format!("failed to wait on `{command}`: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_command_returns_ok() {
        let dir = tempfile::tempdir().unwrap();
        let commands = vec![if cfg!(windows) { "cmd /C exit 0".to_string() } else { "true".to_string() }];
        run_commands(&commands, dir.path(), "before").unwrap();
    }

    #[test]
    fn failing_command_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let commands = vec![if cfg!(windows) { "cmd /C exit 1".to_string() } else { "false".to_string() }];
        let err = run_commands(&commands, dir.path(), "before").unwrap_err();
        assert!(matches!(err, DeployError::Message(_)));
    }

    #[test]
    fn stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let commands = vec![
            "false".to_string(),
            format!("touch {}", marker.display()),
        ];
        if cfg!(windows) {
            return; // shell syntax differs; covered indirectly on unix CI
        }
        let _ = run_commands(&commands, dir.path(), "before");
        assert!(!marker.exists());
    }
}
