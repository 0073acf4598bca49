//! Toolchain maintenance: first-time install and in-place update.
//!
//! Both run a long-lived external process whose only result is success or
//! failure, so they go through [`CommandExecutor`] rather than
//! [`ProcessManager`](crate::ProcessManager).

use crate::archive::{extract_archive, sdk_root_in};
use crate::cancel::CancelToken;
use crate::download::Downloader;
use crate::executor::{CommandExecutor, StreamHandler};
use crate::launcher::{LauncherConfig, ProcessLauncher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether_core::{Command, DownloadTarget, Result, TetherError, ToolchainConfig};
use tracing::{debug, info, warn};

const DEFAULT_ARCHIVE_NAME: &str = "sdk.tar.gz";

pub struct Installer {
    config: ToolchainConfig,
    executor: CommandExecutor,
    downloader: Downloader,
}

impl Installer {
    pub fn new(config: ToolchainConfig) -> Result<Self> {
        config.validate()?;
        let launcher = ProcessLauncher::new(LauncherConfig::from_toolchain(&config));
        let downloader = Downloader::new(&config.user_agent)?;
        Ok(Self {
            config,
            executor: CommandExecutor::new(launcher),
            downloader,
        })
    }

    /// Download the SDK archive into `dest_dir`, unpack it, run its install
    /// script, and return the SDK root.
    ///
    /// `dest_dir` must be missing or empty so the unpacked tree is the only
    /// thing in it.
    pub async fn install(
        &self,
        dest_dir: &Path,
        handler: Option<Arc<dyn StreamHandler>>,
        cancel: &CancelToken,
    ) -> Result<PathBuf> {
        let url = self.config.install.archive_url.as_deref().ok_or_else(|| {
            TetherError::InvalidConfiguration("install.archive_url is not configured".to_string())
        })?;

        ensure_empty_dir(dest_dir).await?;

        let archive = dest_dir.join(archive_file_name(url));
        let unpacked = self.download_and_unpack(url, &archive, dest_dir, cancel).await;
        // The archive goes whether or not unpacking worked.
        if let Err(e) = tokio::fs::remove_file(&archive).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(archive = %archive.display(), error = %e, "Failed to remove SDK archive");
            }
        }
        unpacked?;

        let sdk_root = sdk_root_in(dest_dir).await?;
        self.run_install_script(&sdk_root, handler, cancel).await
    }

    async fn download_and_unpack(
        &self,
        url: &str,
        archive: &Path,
        dest_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<()> {
        let target = DownloadTarget::new(url, archive);
        self.downloader
            .download(
                &target,
                |_, so_far, total| debug!(bytes = so_far, total = ?total, "Downloading SDK"),
                cancel,
            )
            .await?;
        extract_archive(archive, dest_dir).await
    }

    /// Run the install script of an already unpacked SDK.
    pub async fn run_install_script(
        &self,
        sdk_root: &Path,
        handler: Option<Arc<dyn StreamHandler>>,
        cancel: &CancelToken,
    ) -> Result<PathBuf> {
        let script = sdk_root.join(self.config.install_script());
        if !script.is_file() {
            return Err(TetherError::ExecutionError(format!(
                "Install script not found: {}",
                script.display()
            )));
        }

        let command = script_command(&script)
            .args(self.config.install.args.iter().cloned())
            .current_dir(sdk_root);

        info!(sdk_root = %sdk_root.display(), "Running install script");
        self.executor.run(&command, handler, cancel).await?;
        info!(sdk_root = %sdk_root.display(), "Installation completed");

        Ok(sdk_root.to_path_buf())
    }
}

pub struct Updater {
    config: ToolchainConfig,
    executor: CommandExecutor,
}

impl Updater {
    pub fn new(config: ToolchainConfig) -> Result<Self> {
        config.validate()?;
        let launcher = ProcessLauncher::new(LauncherConfig::from_toolchain(&config));
        Ok(Self {
            config,
            executor: CommandExecutor::new(launcher),
        })
    }

    /// Run the SDK's own update command.
    pub async fn update(
        &self,
        handler: Option<Arc<dyn StreamHandler>>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let cli = self.config.cli_path()?;
        let command = Command::new(&cli).args(self.config.update.args.iter().cloned());

        info!(cli = %cli.display(), "Updating toolchain");
        self.executor.run(&command, handler, cancel).await?;
        info!("Toolchain update completed");
        Ok(())
    }
}

async fn ensure_empty_dir(dir: &Path) -> Result<()> {
    match tokio::fs::metadata(dir).await {
        Ok(meta) if !meta.is_dir() => return Err(TetherError::NotADirectory(dir.to_path_buf())),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    let mut entries = tokio::fs::read_dir(dir).await?;
    if entries.next_entry().await?.is_some() {
        return Err(TetherError::PathConflict(dir.to_path_buf()));
    }
    Ok(())
}

/// `.sh` scripts go through `sh` so a missing executable bit does not matter.
fn script_command(script: &Path) -> Command {
    if script.extension().map_or(false, |ext| ext == "sh") {
        Command::new("sh").arg(script.to_string_lossy())
    } else {
        Command::new(script)
    }
}

fn archive_file_name(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_ARCHIVE_NAME)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::tar_gz;
    use crate::executor::LineStreamHandler;
    use crate::listeners::Listeners;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use tether_core::OutputLine;

    fn recording_handler() -> (Arc<dyn StreamHandler>, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listeners = Listeners::new().on_output(move |line: &OutputLine| {
            sink.lock().unwrap().push(line.text.clone());
        });
        (Arc::new(LineStreamHandler::new(listeners)), seen)
    }

    #[test]
    fn test_archive_file_name() {
        assert_eq!(
            archive_file_name("https://example.com/dl/cloud-sdk-linux.tar.gz?alt=media"),
            "cloud-sdk-linux.tar.gz"
        );
        assert_eq!(archive_file_name("https://example.com/"), DEFAULT_ARCHIVE_NAME);
    }

    #[test]
    fn test_script_command_uses_sh_for_shell_scripts() {
        let command = script_command(Path::new("/sdk/install.sh"));
        assert_eq!(command.program(), Path::new("sh"));
        assert_eq!(command.get_args(), &["/sdk/install.sh"]);

        let command = script_command(Path::new("/sdk/install.bat"));
        assert_eq!(command.program(), Path::new("/sdk/install.bat"));
    }

    #[tokio::test]
    async fn test_install_requires_archive_url() {
        let installer = Installer::new(ToolchainConfig::default()).unwrap();
        let dir = tempdir().unwrap();
        let err = installer
            .install(dir.path(), None, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::InvalidConfiguration(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_downloads_extracts_and_runs_script() {
        let archive = tar_gz(&[(
            "sdk/install.sh",
            b"echo installing \"$@\"\necho step-two 1>&2\n",
            0o644,
        )]);
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/sdk.tar.gz")
            .with_body(archive)
            .create_async()
            .await;

        let config = ToolchainConfig {
            install: tether_core::InstallConfig {
                archive_url: Some(format!("{}/sdk.tar.gz", server.url())),
                script: None,
                args: vec!["--quiet".to_string()],
            },
            ..Default::default()
        };
        let installer = Installer::new(config).unwrap();
        let dir = tempdir().unwrap();
        let (handler, seen) = recording_handler();

        let sdk_root = installer
            .install(dir.path(), Some(handler), &CancelToken::new())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(sdk_root, dir.path().join("sdk"));
        assert!(!dir.path().join("sdk.tar.gz").exists());

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&"installing --quiet".to_string()));
        assert!(seen.contains(&"step-two".to_string()));
    }

    #[tokio::test]
    async fn test_install_rejects_non_empty_directory() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/sdk.tar.gz")
            .expect(0)
            .create_async()
            .await;

        let config = ToolchainConfig {
            install: tether_core::InstallConfig {
                archive_url: Some(format!("{}/sdk.tar.gz", server.url())),
                ..Default::default()
            },
            ..Default::default()
        };
        let installer = Installer::new(config).unwrap();
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("leftover.txt"), "old").unwrap();

        let err = installer
            .install(dir.path(), None, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::PathConflict(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_extraction_removes_archive() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/sdk.tar.gz")
            .with_body("definitely not gzip")
            .create_async()
            .await;

        let config = ToolchainConfig {
            install: tether_core::InstallConfig {
                archive_url: Some(format!("{}/sdk.tar.gz", server.url())),
                ..Default::default()
            },
            ..Default::default()
        };
        let installer = Installer::new(config).unwrap();
        let dir = tempdir().unwrap();

        assert!(installer
            .install(dir.path(), None, &CancelToken::new())
            .await
            .is_err());
        assert!(!dir.path().join("sdk.tar.gz").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_script_failure_carries_exit_code() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("install.sh"), "exit 9\n").unwrap();

        let installer = Installer::new(ToolchainConfig::default()).unwrap();
        let err = installer
            .run_install_script(dir.path(), None, &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(9));
    }

    #[tokio::test]
    async fn test_missing_install_script() {
        let dir = tempdir().unwrap();
        let installer = Installer::new(ToolchainConfig::default()).unwrap();
        let err = installer
            .run_install_script(dir.path(), None, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Install script not found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_updater_runs_cli_with_update_args() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let cli = bin.join("fakecli");
        std::fs::write(&cli, "#!/bin/sh\necho \"updated $@\"\n").unwrap();
        std::fs::set_permissions(&cli, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = ToolchainConfig {
            sdk_root: Some(dir.path().to_path_buf()),
            cli_name: "fakecli".to_string(),
            update: tether_core::UpdateConfig {
                args: vec!["components".to_string(), "update".to_string()],
            },
            ..Default::default()
        };
        let updater = Updater::new(config).unwrap();
        let (handler, seen) = recording_handler();

        updater
            .update(Some(handler), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["updated components update".to_string()]
        );
    }

    #[tokio::test]
    async fn test_updater_without_sdk_root() {
        let updater = Updater::new(ToolchainConfig::default()).unwrap();
        let err = updater.update(None, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, TetherError::InvalidConfiguration(_)));
    }
}
