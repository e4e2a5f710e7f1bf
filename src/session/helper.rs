//! External collector subprocesses
//!
//! A helper gets the target PID and the sampling interval on its command
//! line and writes its samples to stdout, which is redirected into a sink
//! file named after the helper.

use crate::trace::SinkMode;
use crate::{Result, TracerError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperSpec {
    /// Sink name for the helper's stdout.
    pub name: String,
    pub program: PathBuf,
    /// Argument templates; `{pid}` and `{interval_ms}` are substituted.
    #[serde(default = "HelperSpec::default_args")]
    pub args: Vec<String>,
}

impl HelperSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Self::default_args(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn default_args() -> Vec<String> {
        ["-p", "{pid}", "-s", "{interval_ms}"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    pub fn render_args(&self, pid: u32, interval: Duration) -> Vec<String> {
        let pid = pid.to_string();
        let interval_ms = interval.as_millis().to_string();
        self.args
            .iter()
            .map(|arg| arg.replace("{pid}", &pid).replace("{interval_ms}", &interval_ms))
            .collect()
    }
}

/// A running helper.
pub struct HelperProcess {
    name: String,
    child: Child,
}

impl HelperProcess {
    pub fn spawn(
        spec: &HelperSpec,
        pid: u32,
        interval: Duration,
        output_dir: &Path,
        mode: SinkMode,
    ) -> Result<Self> {
        let spawn_failed = |source| TracerError::HelperSpawnFailed {
            name: spec.name.clone(),
            source,
        };

        let stdout = mode.open(&output_dir.join(&spec.name)).map_err(spawn_failed)?;
        let child = Command::new(&spec.program)
            .args(spec.render_args(pid, interval))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_failed)?;

        info!(
            helper = %spec.name,
            program = %spec.program.display(),
            child_pid = child.id(),
            "helper started"
        );
        Ok(Self {
            name: spec.name.clone(),
            child,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for `cancel`, then terminate. Returns early if the helper exits
    /// on its own.
    pub async fn supervise(mut self, cancel: CancellationToken, grace: Duration) -> Option<ExitStatus> {
        tokio::select! {
            status = self.child.wait() => {
                match &status {
                    Ok(status) => warn!(helper = %self.name, %status, "helper exited before session stop"),
                    Err(e) => warn!(helper = %self.name, error = %e, "failed to wait for helper"),
                }
                return status.ok();
            }
            _ = cancel.cancelled() => {}
        }
        self.terminate(grace).await
    }

    /// SIGTERM, then SIGKILL if the helper outlives `grace`. Always reaps.
    pub async fn terminate(mut self, grace: Duration) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Some(status);
        }

        if let Some(pid) = self.child.id() {
            debug!(helper = %self.name, child_pid = pid, "sending SIGTERM");
            // SAFETY: kill takes no pointers; `pid` is our unreaped child,
            // so it cannot have been recycled
            if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
                warn!(
                    helper = %self.name,
                    error = %std::io::Error::last_os_error(),
                    "failed to signal helper"
                );
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(helper = %self.name, %status, "helper stopped");
                Some(status)
            }
            Ok(Err(e)) => {
                warn!(helper = %self.name, error = %e, "failed to wait for helper");
                None
            }
            Err(_) => {
                warn!(helper = %self.name, grace = ?grace, "helper ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(helper = %self.name, error = %e, "failed to kill helper");
                }
                self.child.wait().await.ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn test_render_args() {
        let spec = HelperSpec::new("stats", "/usr/bin/stats");
        assert_eq!(
            spec.render_args(4242, Duration::from_millis(10)),
            vec!["-p", "4242", "-s", "10"]
        );

        let spec = spec.with_args(["--target={pid}", "--every", "{interval_ms}ms"]);
        assert_eq!(
            spec.render_args(7, Duration::from_millis(250)),
            vec!["--target=7", "--every", "250ms"]
        );
    }

    #[tokio::test]
    async fn test_stdout_goes_to_sink_and_sigterm_stops_helper() {
        let dir = tempfile::tempdir().unwrap();
        let spec = HelperSpec::new("echo_helper", "sh").with_args(["-c", "echo {pid}; exec sleep 30"]);

        let helper = HelperProcess::spawn(
            &spec,
            4242,
            Duration::from_millis(10),
            dir.path(),
            SinkMode::Fresh,
        )
        .unwrap();
        assert_eq!(helper.name(), "echo_helper");

        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = helper.terminate(Duration::from_secs(5)).await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));

        let contents = fs::read_to_string(dir.path().join("echo_helper")).unwrap();
        assert_eq!(contents, "4242\n");
    }

    #[tokio::test]
    async fn test_helper_ignoring_sigterm_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let spec = HelperSpec::new("stubborn", "sh").with_args(["-c", "trap '' TERM; exec sleep 30"]);

        let helper =
            HelperProcess::spawn(&spec, 1, Duration::from_millis(10), dir.path(), SinkMode::Fresh)
                .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = helper.terminate(Duration::from_millis(200)).await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_append_mode_keeps_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        let spec = HelperSpec::new("counter", "sh").with_args(["-c", "echo {pid}"]);

        for (pid, mode) in [(4242, SinkMode::Fresh), (5310, SinkMode::Append)] {
            let helper =
                HelperProcess::spawn(&spec, pid, Duration::from_millis(10), dir.path(), mode)
                    .unwrap();
            let status = helper
                .supervise(CancellationToken::new(), Duration::from_secs(1))
                .await
                .unwrap();
            assert!(status.success());
        }

        let contents = fs::read_to_string(dir.path().join("counter")).unwrap();
        assert_eq!(contents, "4242\n5310\n");
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let spec = HelperSpec::new("ghost", "/nonexistent/helper-binary");
        let err = HelperProcess::spawn(&spec, 1, Duration::from_millis(10), dir.path(), SinkMode::Fresh)
            .err()
            .unwrap();
        assert!(matches!(err, TracerError::HelperSpawnFailed { .. }));
    }
}
