// Process spawning: executable resolution, environment overlay, and the
// Windows `cmd /c` rewrite.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tether_core::{Command, Result, TetherError, ToolchainConfig};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tracing::{debug, info};

/// How the child's stdout/stderr are connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Independent pipes the caller must drain.
    Piped,
    /// Share the parent's terminal.
    Inherit,
}

/// Launcher-wide settings applied to every command
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Prefix every invocation with `cmd /c`.
    pub wrap_in_shell: bool,
    /// Overlaid on the inherited environment; a command's own entries win.
    pub env: BTreeMap<String, String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            wrap_in_shell: cfg!(target_os = "windows"),
            env: BTreeMap::new(),
        }
    }
}

impl LauncherConfig {
    pub fn from_toolchain(config: &ToolchainConfig) -> Self {
        Self {
            env: config.env.clone(),
            ..Self::default()
        }
    }
}

/// Spawns OS processes from [`Command`] values.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    config: LauncherConfig,
}

impl ProcessLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Spawn with piped stdout/stderr.
    pub fn launch(&self, command: &Command) -> Result<ProcessHandle> {
        self.launch_with(command, OutputMode::Piped)
    }

    /// Must be called from within a Tokio runtime.
    pub fn launch_with(&self, command: &Command, mode: OutputMode) -> Result<ProcessHandle> {
        let display_name = command.program().display().to_string();

        if let Some(dir) = command.working_dir() {
            if !dir.is_dir() {
                return Err(TetherError::launch(
                    display_name,
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("working directory {} does not exist", dir.display()),
                    ),
                ));
            }
        }

        let program = self.resolve(command)?;
        let (exe, args) = self.argv(&program, command.get_args());

        let mut cmd = tokio::process::Command::new(exe);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);

        match mode {
            OutputMode::Piped => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            OutputMode::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
        }

        if let Some(dir) = command.working_dir() {
            cmd.current_dir(dir);
        }
        for (k, v) in self.config.env.iter().chain(command.get_env()) {
            cmd.env(k, v);
        }

        let child = cmd
            .spawn()
            .map_err(|e| TetherError::launch(display_name, e))?;

        info!(
            command = %command,
            pid = ?child.id(),
            mode = ?mode,
            "Launched process"
        );

        Ok(ProcessHandle::new(child))
    }

    /// Final argument vector: `[exe, args...]`, shell-wrapped if configured.
    pub fn argv(&self, program: &Path, args: &[String]) -> (OsString, Vec<OsString>) {
        let args = args.iter().map(OsString::from);
        if self.config.wrap_in_shell {
            let mut wrapped = vec![OsString::from("/c"), program.as_os_str().to_os_string()];
            wrapped.extend(args);
            (OsString::from("cmd"), wrapped)
        } else {
            (program.as_os_str().to_os_string(), args.collect())
        }
    }

    /// Locate the executable, honoring a `PATH` override in the environment.
    fn resolve(&self, command: &Command) -> Result<PathBuf> {
        let program = command.program();
        let cwd = match command.working_dir() {
            Some(dir) => dir.to_path_buf(),
            None => std::env::current_dir()?,
        };

        let search_path = command
            .get_env()
            .get("PATH")
            .or_else(|| self.config.env.get("PATH"))
            .map(OsString::from)
            .or_else(|| std::env::var_os("PATH"));

        let resolved = which::which_in(program, search_path, &cwd).map_err(|e| {
            TetherError::launch(
                program.display().to_string(),
                io::Error::new(io::ErrorKind::NotFound, e.to_string()),
            )
        })?;

        debug!(program = %program.display(), resolved = %resolved.display(), "Resolved executable");
        Ok(resolved)
    }
}

/// Exclusive owner of one live child process
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
}

impl ProcessHandle {
    fn new(child: Child) -> Self {
        let pid = child.id();
        Self { child, pid }
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for exit and return the numeric exit code.
    pub async fn wait(&mut self) -> io::Result<i32> {
        let status = self.child.wait().await?;
        Ok(exit_code_of(status))
    }

    /// Kill the child and reap it. A child that already exited is not an error.
    pub async fn terminate(&mut self) -> io::Result<()> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// The process's exit code; on Unix a signal death maps to `128 + signal`.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
