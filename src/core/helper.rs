// src/core/helper.rs

//! Launches the external recovery helper process and waits for its exit
//! status. When every active node advertises `PARALLEL_RECOVERY`, the
//! coordinator delegates the pull/merge/push phases for an entire recovery
//! run to this helper instead of running them in-process, so a hang or crash
//! during the expensive part of recovery cannot take the coordinator down
//! with it.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::core::errors::{RecoverdError, Result};

/// Launches `helper_path` for `generation` against `socket_name`, waits up
/// to `run_timeout` for it to exit, and returns `Ok(())` only on a clean
/// exit with status code 0. `state_dir` is passed through the environment
/// rather than as an argument, matching the on-disk contract the
/// coordinator and helper agree on independently of this crate.
pub async fn spawn_and_wait(
    helper_path: &Path,
    socket_name: &str,
    generation: u32,
    state_dir: &Path,
    run_timeout: Duration,
) -> Result<()> {
    info!(generation, helper = %helper_path.display(), "launching recovery helper");

    let mut child = Command::new(helper_path)
        .arg(socket_name)
        .arg(generation.to_string())
        .env("RECOVERD_STATE_DIR", state_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| RecoverdError::Fatal(format!("failed to spawn recovery helper: {e}")))?;

    let wait = async {
        child
            .wait()
            .await
            .map_err(|e| RecoverdError::Fatal(format!("recovery helper wait failed: {e}")))
    };

    match timeout(run_timeout, wait).await {
        Ok(Ok(status)) if status.success() => {
            info!(generation, "recovery helper completed");
            Ok(())
        }
        Ok(Ok(status)) => {
            error!(generation, code = ?status.code(), "recovery helper exited non-zero");
            Err(RecoverdError::Fatal(format!("recovery helper for generation {generation} exited with {status}")))
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            warn!(generation, "recovery helper timed out, killing");
            let _ = child.kill().await;
            Err(RecoverdError::Fatal(format!("recovery helper for generation {generation} timed out")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn successful_helper_exits_ok() {
        let helper = which_true();
        let result = spawn_and_wait(&helper, "ctdb.socket", 1, Path::new("."), Duration::from_secs(5)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn failing_helper_is_an_error() {
        let helper = which_false();
        let result = spawn_and_wait(&helper, "ctdb.socket", 1, Path::new("."), Duration::from_secs(5)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn missing_helper_binary_is_an_error() {
        let helper = PathBuf::from("/nonexistent/recovery-helper-binary");
        let result = spawn_and_wait(&helper, "ctdb.socket", 1, Path::new("."), Duration::from_secs(5)).await;
        assert!(result.is_err());
    }

    fn which_true() -> PathBuf {
        PathBuf::from("/bin/true")
    }

    fn which_false() -> PathBuf {
        PathBuf::from("/bin/false")
    }
}
