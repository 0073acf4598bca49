use std::fmt;
use std::sync::Arc;
use tether_core::OutputLine;

pub type StartListener = Arc<dyn Fn(Option<u32>) + Send + Sync>;
pub type LineListener = Arc<dyn Fn(&OutputLine) + Send + Sync>;
pub type ExitListener = Arc<dyn Fn(i32) + Send + Sync>;

/// Callbacks attached to one execution.
///
/// Assembled before the process starts and only read afterwards. Lines on a
/// single stream arrive in order; there is no ordering between stdout and
/// stderr, and the exit listener may fire while output is still in flight.
#[derive(Clone, Default)]
pub struct Listeners {
    start: Option<StartListener>,
    stdout: Vec<LineListener>,
    stderr: Vec<LineListener>,
    exit: Option<ExitListener>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once with the child's pid, before any output is read.
    pub fn on_start<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<u32>) + Send + Sync + 'static,
    {
        self.start = Some(Arc::new(f));
        self
    }

    pub fn on_stdout<F>(mut self, f: F) -> Self
    where
        F: Fn(&OutputLine) + Send + Sync + 'static,
    {
        self.stdout.push(Arc::new(f));
        self
    }

    pub fn on_stderr<F>(mut self, f: F) -> Self
    where
        F: Fn(&OutputLine) + Send + Sync + 'static,
    {
        self.stderr.push(Arc::new(f));
        self
    }

    /// Register one listener for both streams.
    pub fn on_output<F>(mut self, f: F) -> Self
    where
        F: Fn(&OutputLine) + Send + Sync + 'static,
    {
        let listener: LineListener = Arc::new(f);
        self.stdout.push(listener.clone());
        self.stderr.push(listener);
        self
    }

    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        self.exit = Some(Arc::new(f));
        self
    }

    pub fn stdout(&self) -> &[LineListener] {
        &self.stdout
    }

    pub fn stderr(&self) -> &[LineListener] {
        &self.stderr
    }

    pub(crate) fn fire_start(&self, pid: Option<u32>) {
        if let Some(start) = &self.start {
            start(pid);
        }
    }

    pub(crate) fn fire_exit(&self, code: i32) {
        if let Some(exit) = &self.exit {
            exit(code);
        }
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("start", &self.start.is_some())
            .field("stdout", &self.stdout.len())
            .field("stderr", &self.stderr.len())
            .field("exit", &self.exit.is_some())
            .finish()
    }
}
