//! Auxiliary processes started inside an existing container's job object.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::win32::process::{ChildProcess, ProcessCommand, Stdio};

use super::{Container, ContainerError};

/// Parameters for [`Container::exec`].
#[derive(Debug, Default)]
pub struct ExecConfig {
    /// Program and arguments; must not be empty.
    pub command: Vec<String>,
    /// Working directory.
    pub dir: Option<PathBuf>,
    /// Environment as `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// Standard output destination.
    pub stdout: Stdio,
    /// Standard error destination.
    pub stderr: Stdio,
}

/// An auxiliary process running inside a container's job object.
///
/// Unlike the main child, a dropped or cancelled waiter kills the auxiliary:
/// nothing else owns it, and it must not outlive its caller inside the job.
#[derive(Debug)]
pub struct ExecTask {
    process: Arc<ChildProcess>,
}

impl Container {
    /// Start an auxiliary process in this container's job object, under the
    /// container's access token. The process is created suspended, assigned
    /// to the job, then resumed.
    ///
    /// # Errors
    ///
    /// Fails on an empty command or on any kernel failure; a spawned
    /// auxiliary is killed when a later step fails.
    pub fn exec(&self, cfg: ExecConfig) -> Result<ExecTask, ContainerError> {
        let Some((program, args)) = cfg.command.split_first() else {
            return Err(ContainerError::Config(
                "exec requires at least one argument".to_string(),
            ));
        };
        let cmd = ProcessCommand {
            program: program.clone(),
            args: args.to_vec(),
            env: cfg.env,
            dir: cfg.dir,
            stdout: cfg.stdout,
            stderr: cfg.stderr,
        };
        let process = ChildProcess::spawn(&cmd, Some(self.token()), true)?;
        if let Err(err) = self.job().assign(process.handle()) {
            kill_logged(&process);
            return Err(err.into());
        }
        if let Err(err) = process.resume() {
            kill_logged(&process);
            return Err(err.into());
        }
        Ok(ExecTask {
            process: Arc::new(process),
        })
    }
}

impl ExecTask {
    /// The auxiliary's PID.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    /// Wait for the auxiliary to exit and return its exit code.
    ///
    /// Cancellation kills the auxiliary; it would otherwise be orphaned
    /// inside the job object.
    ///
    /// # Errors
    ///
    /// [`ContainerError::Cancelled`] when `cancel` fires first, or the
    /// failing wait operation.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<i32, ContainerError> {
        let process = Arc::clone(&self.process);
        let wait = tokio::task::spawn_blocking(move || process.wait());
        tokio::select! {
            () = cancel.cancelled() => {
                kill_logged(&self.process);
                Err(ContainerError::Cancelled)
            }
            joined = wait => match joined {
                Ok(Ok(exit_code)) => Ok(exit_code),
                Ok(Err(err)) => {
                    kill_logged(&self.process);
                    Err(err.into())
                }
                Err(_) => Err(ContainerError::Internal(
                    "exec wait worker disappeared".to_string(),
                )),
            },
        }
    }
}

fn kill_logged(process: &ChildProcess) {
    if let Err(err) = process.kill() {
        tracing::error!(
            pid = process.pid(),
            error = %err,
            "unable to kill exec process"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Config;
    use crate::win32::process::capture_pipe;
    use std::io::Read;
    use std::time::Duration;

    fn running_container() -> Arc<Container> {
        let mut cmd = ProcessCommand::new("cmd.exe");
        cmd.args = vec!["/C".to_string(), "ping -n 30 127.0.0.1 > NUL".to_string()];
        let cfg = Config {
            name: "damon-test:exec".to_string(),
            ..Config::default()
        };
        Container::run(cmd, &cfg).expect("run container")
    }

    #[tokio::test]
    async fn test_exec_empty_command_rejected() {
        let container = running_container();
        let err = container.exec(ExecConfig::default()).unwrap_err();
        assert!(matches!(err, ContainerError::Config(_)));
        container.shutdown(Duration::from_millis(100)).await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_exec_captures_output() {
        let container = running_container();
        let (write, mut read) = capture_pipe().expect("pipe");
        let task = container
            .exec(ExecConfig {
                command: vec!["cmd.exe".to_string(), "/C".to_string(), "echo inside".to_string()],
                stdout: Stdio::Handle(write),
                ..ExecConfig::default()
            })
            .expect("exec");
        let cancel = CancellationToken::new();
        let code = task.wait(&cancel).await.expect("wait");
        assert_eq!(code, 0);
        let mut out = String::new();
        read.read_to_string(&mut out).expect("drain");
        assert!(out.contains("inside"));
        container.shutdown(Duration::from_millis(100)).await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_exec_cancellation_kills_auxiliary() {
        let container = running_container();
        let task = container
            .exec(ExecConfig {
                command: vec![
                    "cmd.exe".to_string(),
                    "/C".to_string(),
                    "ping -n 30 127.0.0.1 > NUL".to_string(),
                ],
                ..ExecConfig::default()
            })
            .expect("exec");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = task.wait(&cancel).await.unwrap_err();
        assert!(matches!(err, ContainerError::Cancelled));
        container.shutdown(Duration::from_millis(100)).await.expect("shutdown");
    }
}
