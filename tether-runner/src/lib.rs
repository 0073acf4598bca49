pub mod archive;
pub mod cancel;
pub mod download;
pub mod drain;
pub mod executor;
pub mod installer;
pub mod launcher;
pub mod listeners;
pub mod manager;

pub use archive::{extract_archive, sdk_root_in};
pub use cancel::CancelToken;
pub use download::Downloader;
pub use drain::{DrainOutcome, StreamDrainer};
pub use executor::{CommandExecutor, LineStreamHandler, StreamHandler};
pub use installer::{Installer, Updater};
pub use launcher::{exit_code_of, LauncherConfig, OutputMode, ProcessHandle, ProcessLauncher};
pub use listeners::{ExitListener, LineListener, Listeners, StartListener};
pub use manager::{Identity, OutputConverter, ProcessManager};
