use flate2::read::GzDecoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tether_core::{Result, TetherError};
use tracing::info;

/// Unpack a gzipped tarball into `destination`, creating it if needed.
///
/// Runs on a blocking thread; only `.tar.gz` and `.tgz` are supported.
pub async fn extract_archive(archive: &Path, destination: &Path) -> Result<()> {
    let file_name = archive
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TetherError::ExecutionError(format!("Invalid archive file name: {}", archive.display()))
        })?;

    if !(file_name.ends_with(".tar.gz") || file_name.ends_with(".tgz")) {
        return Err(TetherError::ExecutionError(format!(
            "Unsupported archive format: {}",
            file_name
        )));
    }

    info!(archive = %archive.display(), destination = %destination.display(), "Extracting archive");

    let archive = archive.to_path_buf();
    let destination = destination.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_tar_gz(&archive, &destination))
        .await
        .map_err(|e| TetherError::ExecutionError(format!("Extraction task failed: {}", e)))?
}

fn unpack_tar_gz(archive: &Path, destination: &Path) -> Result<()> {
    std::fs::create_dir_all(destination)?;
    let file = File::open(archive)?;
    let mut tarball = tar::Archive::new(GzDecoder::new(file));
    tarball.set_preserve_permissions(true);
    tarball.unpack(destination)?;
    Ok(())
}

/// The SDK root inside an extraction directory: its only subdirectory if
/// there is exactly one entry, otherwise the directory itself.
pub async fn sdk_root_in(dir: &Path) -> Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        found.push(entry.path());
        if found.len() > 1 {
            return Ok(dir.to_path_buf());
        }
    }
    match found.pop() {
        Some(only) if only.is_dir() => Ok(only),
        _ => Ok(dir.to_path_buf()),
    }
}
