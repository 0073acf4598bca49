//! A future-like handle over one external process.
//!
//! [`ProcessManager::start`] launches the child and spawns three tasks: one
//! drain per output stream and a supervisor that waits for exit, joins both
//! drains, applies the exit-code policy and converts stdout. The supervisor
//! publishes a single terminal [`ExecutionState`]; every accessor on the
//! handle reads that state.

use crate::cancel::CancelToken;
use crate::drain::{DrainOutcome, StreamDrainer};
use crate::launcher::{ProcessHandle, ProcessLauncher};
use crate::listeners::Listeners;
use chrono::Utc;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::{
    CapturedResult, Command, ExecutionState, FailureKind, Result, StreamSource, TetherError,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Turns the complete stdout text of a successful run into a typed value.
pub trait OutputConverter<T>: Send + Sync + 'static {
    fn convert(&self, stdout: &str) -> anyhow::Result<T>;
}

impl<T, F> OutputConverter<T> for F
where
    F: Fn(&str) -> anyhow::Result<T> + Send + Sync + 'static,
{
    fn convert(&self, stdout: &str) -> anyhow::Result<T> {
        self(stdout)
    }
}

/// Returns stdout unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl OutputConverter<String> for Identity {
    fn convert(&self, stdout: &str) -> anyhow::Result<String> {
        Ok(stdout.to_string())
    }
}

/// Handle to a running (or finished) execution.
///
/// Dropping the handle does not stop the child; call [`cancel`](Self::cancel).
pub struct ProcessManager<T> {
    id: Uuid,
    state: Arc<watch::Sender<ExecutionState<T>>>,
    cancel: CancelToken,
}

impl ProcessManager<String> {
    /// Run `command` and capture its stdout verbatim.
    pub fn capture(launcher: &ProcessLauncher, command: &Command) -> Result<Self> {
        Self::start(launcher, command, Identity, Listeners::default())
    }
}

impl<T> ProcessManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Launch `command` and begin supervising it.
    ///
    /// Launch failures are returned here; everything after that is reported
    /// through [`get`](Self::get). Must be called from within a Tokio runtime.
    pub fn start<C>(
        launcher: &ProcessLauncher,
        command: &Command,
        converter: C,
        listeners: Listeners,
    ) -> Result<Self>
    where
        C: OutputConverter<T>,
    {
        let id = Uuid::new_v4();
        let mut handle = launcher.launch(command)?;
        let stdout = handle
            .take_stdout()
            .ok_or_else(|| TetherError::ExecutionError("stdout was not piped".to_string()))?;
        let stderr = handle
            .take_stderr()
            .ok_or_else(|| TetherError::ExecutionError("stderr was not piped".to_string()))?;

        info!(
            execution_id = %id,
            command = %command,
            pid = ?handle.id(),
            "Starting managed execution"
        );

        let cancel = CancelToken::new();
        listeners.fire_start(handle.id());

        let out_task = StreamDrainer::new(StreamSource::Stdout, cancel.clone())
            .with_listeners(listeners.stdout())
            .capturing()
            .spawn(stdout);
        let err_task = StreamDrainer::new(StreamSource::Stderr, cancel.clone())
            .with_listeners(listeners.stderr())
            .spawn(stderr);

        let (tx, _) = watch::channel(ExecutionState::Running);
        let state = Arc::new(tx);

        tokio::spawn(supervise(Supervisor {
            id,
            handle,
            out_task,
            err_task,
            converter,
            listeners,
            state: state.clone(),
            cancel: cancel.clone(),
        }));

        Ok(Self { id, state, cancel })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> ExecutionState<T> {
        self.state.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        !self.state.borrow().is_running()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().is_cancelled()
    }

    /// Kill the child. Returns `false` if the execution had already finished.
    pub fn cancel(&self) -> bool {
        let cancelled = self.state.send_if_modified(|state| {
            if state.is_running() {
                *state = ExecutionState::Cancelled;
                true
            } else {
                false
            }
        });
        if cancelled {
            info!(execution_id = %self.id, "Cancelling execution");
            self.cancel.cancel();
        }
        cancelled
    }

    /// Wait for completion and return the converted stdout.
    pub async fn get(&self) -> Result<T> {
        self.captured().await?.value.ok_or_else(|| {
            TetherError::ExecutionError("execution completed without a value".to_string())
        })
    }

    /// Like [`get`](Self::get), but gives up after `timeout`. The process keeps running.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<T> {
        tokio::time::timeout(timeout, self.get())
            .await
            .map_err(|_| TetherError::Timeout(timeout))?
    }

    /// Wait for completion and return the full captured result.
    pub async fn captured(&self) -> Result<CapturedResult<T>> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| !state.is_running())
            .await
            .map(|state| state.clone())
            .map_err(|_| TetherError::ExecutionError("supervisor went away".to_string()))?;

        match state {
            ExecutionState::Completed(result) => Ok(result),
            ExecutionState::Cancelled => Err(TetherError::Cancelled),
            ExecutionState::Failed(FailureKind::NonZeroExit(code)) => {
                Err(TetherError::NonZeroExit { code })
            }
            ExecutionState::Failed(FailureKind::ConversionFailure(msg)) => {
                Err(TetherError::ConversionFailure(msg))
            }
            ExecutionState::Failed(FailureKind::WaitFailure(msg))
            | ExecutionState::Failed(FailureKind::Aborted(msg)) => {
                Err(TetherError::ExecutionError(msg))
            }
            ExecutionState::Running => unreachable!("wait_for returned a running state"),
        }
    }
}

struct Supervisor<T, C> {
    id: Uuid,
    handle: ProcessHandle,
    out_task: JoinHandle<DrainOutcome>,
    err_task: JoinHandle<DrainOutcome>,
    converter: C,
    listeners: Listeners,
    state: Arc<watch::Sender<ExecutionState<T>>>,
    cancel: CancelToken,
}

async fn supervise<T, C>(sup: Supervisor<T, C>)
where
    T: Clone + Send + Sync + 'static,
    C: OutputConverter<T>,
{
    let Supervisor {
        id,
        mut handle,
        out_task,
        err_task,
        converter,
        listeners,
        state,
        cancel,
    } = sup;
    let guard = TerminalGuard { id, state };

    let started_at = Utc::now();
    let start = Instant::now();

    let exit = tokio::select! {
        exit = handle.wait() => exit,
        _ = cancel.cancelled() => {
            if let Err(e) = handle.terminate().await {
                warn!(execution_id = %id, error = %e, "Failed to kill cancelled process");
            }
            // Killing closes both pipes, which ends the drains.
            join_drain(id, out_task).await;
            join_drain(id, err_task).await;
            debug!(execution_id = %id, "Execution cancelled");
            return;
        }
    };

    if let Ok(code) = exit {
        listeners.fire_exit(code);
    }

    let stdout = join_drain(id, out_task).await;
    join_drain(id, err_task).await;

    let final_state = match exit {
        Err(e) => {
            warn!(execution_id = %id, error = %e, "Failed waiting for process");
            ExecutionState::Failed(FailureKind::WaitFailure(e.to_string()))
        }
        Ok(code) if code != 0 => {
            warn!(execution_id = %id, exit_code = code, "Process exited with non-zero code");
            ExecutionState::Failed(FailureKind::NonZeroExit(code))
        }
        Ok(code) => match stdout.and_then(|outcome| outcome.captured) {
            None => {
                warn!(execution_id = %id, "Captured stdout was lost");
                ExecutionState::Failed(FailureKind::Aborted("stdout drain failed".to_string()))
            }
            Some(text) => match convert(&converter, &text) {
                Ok(value) => {
                    let duration_ms = start.elapsed().as_millis() as u64;
                    info!(
                        execution_id = %id,
                        exit_code = code,
                        duration_ms,
                        "Execution completed"
                    );
                    ExecutionState::Completed(CapturedResult {
                        exit_code: code,
                        value: Some(value),
                        duration_ms,
                        started_at,
                        completed_at: Utc::now(),
                    })
                }
                Err(e) => {
                    warn!(execution_id = %id, error = %e, "Output conversion failed");
                    ExecutionState::Failed(FailureKind::ConversionFailure(format!("{:#}", e)))
                }
            },
        },
    };

    guard.publish(final_state);
}

/// Publishes the terminal state. If the supervisor unwinds before getting
/// there, dropping the guard publishes `Aborted` so waiters never hang.
struct TerminalGuard<T> {
    id: Uuid,
    state: Arc<watch::Sender<ExecutionState<T>>>,
}

impl<T> TerminalGuard<T> {
    /// A concurrent cancel() wins; its state is left untouched.
    fn publish(&self, final_state: ExecutionState<T>) {
        self.state.send_if_modified(move |current| {
            if current.is_running() {
                *current = final_state;
                true
            } else {
                false
            }
        });
    }
}

impl<T> Drop for TerminalGuard<T> {
    fn drop(&mut self) {
        if self.state.borrow().is_running() {
            warn!(execution_id = %self.id, "Supervisor stopped before publishing a result");
            self.publish(ExecutionState::Failed(FailureKind::Aborted(
                "supervisor stopped unexpectedly".to_string(),
            )));
        }
    }
}

/// Runs the converter, turning a panic into an ordinary conversion error.
fn convert<T, C: OutputConverter<T>>(converter: &C, text: &str) -> anyhow::Result<T> {
    panic::catch_unwind(AssertUnwindSafe(|| converter.convert(text))).unwrap_or_else(|payload| {
        Err(anyhow::anyhow!(
            "converter panicked: {}",
            panic_message(&*payload)
        ))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}

/// `None` when the drain task itself died, e.g. a listener panicked.
async fn join_drain(id: Uuid, task: JoinHandle<DrainOutcome>) -> Option<DrainOutcome> {
    match task.await {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!(execution_id = %id, error = %e, "Drain task failed");
            None
        }
    }
}
