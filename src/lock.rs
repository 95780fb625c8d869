//! Screen-lock collaborator: invokes a configured shell command
//! when a continuous session drops out of `Continuing`, or an already
//! authenticated session transitions to Fin/Error. Exit status is logged,
//! never acted upon — the policy of what the command does is external.

use tokio::process::Command;
use tracing::{info, warn};

/// Runs `<lock_command> <username>`, logging the outcome.
pub async fn invoke_lock(lock_command: &str, username: &str) {
    let output = Command::new(lock_command).arg(username).output().await;
    match output {
        Ok(output) => {
            let code = output.status.code().unwrap_or(-1);
            info!(%lock_command, %username, code, "lock command finished");
        }
        Err(err) => {
            warn!(%lock_command, %username, %err, "failed to spawn lock command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nonexistent_lock_command_is_logged_not_panicked() {
        invoke_lock("/no/such/lock-command-binary", "alice").await;
    }

    #[tokio::test]
    async fn successful_lock_command_runs_to_completion() {
        invoke_lock("/bin/true", "alice").await;
    }
}
