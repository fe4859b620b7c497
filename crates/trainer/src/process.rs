//! [`TrainingProcess`] backed by an OS process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::hooks::TrainingProcess;
use crate::HookError;

/// A training executable whose stdout and stderr go to a log file.
pub struct ExecutableProcess {
    child: Child,
    log_path: PathBuf,
}

impl ExecutableProcess {
    /// Spawn `program` with `args` in `workdir`, appending output to `log_path`.
    pub fn spawn(
        program: &str,
        args: &[String],
        workdir: &Path,
        log_path: &Path,
    ) -> Result<Self, HookError> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let stderr = log.try_clone()?;

        let child = Command::new(program)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HookError::Process(format!("failed to start {program}: {e}")))?;

        tracing::info!(program, pid = child.id(), log = %log_path.display(), "Training process started");
        Ok(Self {
            child,
            log_path: log_path.to_path_buf(),
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    #[cfg(unix)]
    fn request_stop(&self) {
        if let Some(pid) = self.child.id() {
            // SAFETY: plain signal delivery to a pid we spawned.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn request_stop(&self) {}
}

#[async_trait]
impl TrainingProcess for ExecutableProcess {
    async fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self, grace: Duration) {
        if !self.is_running().await {
            return;
        }
        self.request_stop();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => tracing::info!("Training process exited"),
            Err(_) => {
                tracing::warn!(grace_ms = grace.as_millis() as u64, "Training process ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    tracing::error!(error = %e, "Failed to kill training process");
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn short_process_finishes_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("training.log");
        let mut process = ExecutableProcess::spawn(
            "sh",
            &["-c".into(), "echo epoch 1".into()],
            dir.path(),
            &log,
        )
        .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while process.is_running().await {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("epoch 1"));
    }

    #[tokio::test]
    async fn terminate_stops_long_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut process = ExecutableProcess::spawn(
            "sleep",
            &["30".into()],
            dir.path(),
            &dir.path().join("training.log"),
        )
        .unwrap();
        assert!(process.is_running().await);

        process.terminate(Duration::from_secs(2)).await;
        assert!(!process.is_running().await);
    }

    #[tokio::test]
    async fn missing_program_is_a_process_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ExecutableProcess::spawn(
            "definitely-not-a-real-binary",
            &[],
            dir.path(),
            &dir.path().join("training.log"),
        );
        assert!(matches!(result, Err(HookError::Process(_))));
    }
}
