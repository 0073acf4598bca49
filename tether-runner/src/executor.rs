use crate::cancel::CancelToken;
use crate::drain::StreamDrainer;
use crate::launcher::{OutputMode, ProcessLauncher};
use crate::listeners::Listeners;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::{Command, Result, StreamSource, TetherError};
use tokio::process::{ChildStderr, ChildStdout};
use tracing::{info, warn};

/// How long a cancelled run waits for its stream handler before aborting it.
const STREAM_GRACE: Duration = Duration::from_secs(2);

/// Receives the raw output streams of a child and owns draining them.
///
/// `cancel` fires when the run is cancelled. The pipes may stay open after
/// the child is killed (a grandchild can hold them), so handlers should stop
/// reading when it fires.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle_streams(
        &self,
        stdout: ChildStdout,
        stderr: ChildStderr,
        cancel: CancelToken,
    );
}

/// Drains both streams concurrently into a [`Listeners`] set.
#[derive(Debug, Clone, Default)]
pub struct LineStreamHandler {
    listeners: Listeners,
}

impl LineStreamHandler {
    pub fn new(listeners: Listeners) -> Self {
        Self { listeners }
    }
}

#[async_trait]
impl StreamHandler for LineStreamHandler {
    async fn handle_streams(
        &self,
        stdout: ChildStdout,
        stderr: ChildStderr,
        cancel: CancelToken,
    ) {
        let out = StreamDrainer::new(StreamSource::Stdout, cancel.clone())
            .with_listeners(self.listeners.stdout())
            .spawn(stdout);
        let err = StreamDrainer::new(StreamSource::Stderr, cancel)
            .with_listeners(self.listeners.stderr())
            .spawn(stderr);

        let (out, err) = tokio::join!(out, err);
        for joined in [out, err] {
            if let Err(e) = joined {
                warn!(error = %e, "Drain task failed");
            }
        }
    }
}

/// Runs commands whose only result is their exit status.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    launcher: ProcessLauncher,
}

impl CommandExecutor {
    pub fn new(launcher: ProcessLauncher) -> Self {
        Self { launcher }
    }

    pub fn launcher(&self) -> &ProcessLauncher {
        &self.launcher
    }

    /// Run `command` to completion.
    ///
    /// With a handler the child's output is piped to it; without one the
    /// child inherits this process's stdout and stderr. Cancelling kills the
    /// child and yields `Cancelled`; a non-zero exit yields `NonZeroExit`.
    pub async fn run(
        &self,
        command: &Command,
        handler: Option<Arc<dyn StreamHandler>>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let start_instant = Instant::now();
        let mode = if handler.is_some() {
            OutputMode::Piped
        } else {
            OutputMode::Inherit
        };
        let mut handle = self.launcher.launch_with(command, mode)?;

        let streams = match handler {
            Some(handler) => {
                let stdout = handle.take_stdout().ok_or_else(|| {
                    TetherError::ExecutionError("stdout was not piped".to_string())
                })?;
                let stderr = handle.take_stderr().ok_or_else(|| {
                    TetherError::ExecutionError("stderr was not piped".to_string())
                })?;
                let cancel = cancel.clone();
                Some(tokio::spawn(async move {
                    handler.handle_streams(stdout, stderr, cancel).await
                }))
            }
            None => None,
        };

        let exit_code = tokio::select! {
            exit = handle.wait() => exit?,
            _ = cancel.cancelled() => {
                warn!(command = %command, "Execution cancelled, killing process");
                if let Err(e) = handle.terminate().await {
                    warn!(command = %command, error = %e, "Failed to kill cancelled process");
                }
                if let Some(mut streams) = streams {
                    if tokio::time::timeout(STREAM_GRACE, &mut streams).await.is_err() {
                        warn!(command = %command, "Stream handler still running, aborting it");
                        streams.abort();
                    }
                }
                return Err(TetherError::Cancelled);
            }
        };

        if let Some(streams) = streams {
            if let Err(e) = streams.await {
                warn!(error = %e, "Stream handler failed");
            }
        }

        let duration_ms = start_instant.elapsed().as_millis() as u64;
        info!(
            command = %command,
            exit_code,
            duration_ms,
            "Command execution completed"
        );

        if exit_code != 0 {
            return Err(TetherError::NonZeroExit { code: exit_code });
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tether_core::OutputLine;

    fn recording_handler() -> (Arc<dyn StreamHandler>, Arc<Mutex<Vec<OutputLine>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listeners = Listeners::new().on_output(move |line: &OutputLine| {
            sink.lock().unwrap().push(line.clone());
        });
        (Arc::new(LineStreamHandler::new(listeners)), seen)
    }

    #[tokio::test]
    async fn test_executor_streams_both_outputs() {
        let executor = CommandExecutor::default();
        let (handler, seen) = recording_handler();

        executor
            .run(
                &Command::shell("echo installing; echo warning 1>&2"),
                Some(handler),
                &CancelToken::new(),
            )
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&OutputLine::new("installing", StreamSource::Stdout)));
        assert!(seen.contains(&OutputLine::new("warning", StreamSource::Stderr)));
    }

    #[tokio::test]
    async fn test_executor_non_zero_exit() {
        let executor = CommandExecutor::default();
        let (handler, _) = recording_handler();
        let err = executor
            .run(&Command::shell("exit 4"), Some(handler), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(4));
    }

    #[tokio::test]
    async fn test_executor_inherits_without_handler() {
        let executor = CommandExecutor::default();
        executor
            .run(&Command::shell("true"), None, &CancelToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_executor_cancel_kills_process() {
        let executor = CommandExecutor::default();
        let cancel = CancelToken::new();
        let (handler, _) = recording_handler();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(30),
            executor.run(&Command::new("sleep").arg("30"), Some(handler), &cancel),
        )
        .await
        .expect("cancel should unblock run");
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_executor_cancel_with_orphaned_pipes() {
        let executor = CommandExecutor::default();
        let cancel = CancelToken::new();
        let (handler, _) = recording_handler();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        // The background sleep inherits the pipes and outlives the killed shell.
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            executor.run(&Command::shell("sleep 20 & sleep 30"), Some(handler), &cancel),
        )
        .await
        .expect("cancel should not wait for the orphaned child");
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_executor_launch_failure() {
        let executor = CommandExecutor::default();
        let err = executor
            .run(&Command::new("no-such-tether-binary"), None, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::LaunchFailure { .. }));
    }
}
