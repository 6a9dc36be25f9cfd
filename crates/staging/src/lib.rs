//! Filesystem staging for world backups: copy a world into a scratch
//! directory, reconcile file lengths, archive, clean up.
//!
//! Everything here is plain I/O. Orchestration state and the save-hold
//! protocol live in the daemon; callers decide which failures abort a cycle.

use std::fs as stdfs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tokio::task;
use tracing::{info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// World name used when `server.properties` is missing or carries no
/// `level-name` entry.
pub const FALLBACK_WORLD_NAME: &str = "Unknown";

const PROPERTIES_FILE: &str = "server.properties";
const WORLD_NAME_KEY: &str = "level-name";

/// Filesystem recovery artifacts (lost+found and friends) are never part of a
/// consistent world snapshot.
const LOST_ENTRY_MARKER: &str = "lost";

/// Resolve the world name from the server's `server.properties`.
///
/// Key match is case-insensitive and the first non-empty value wins. A
/// missing or unreadable file degrades to [`FALLBACK_WORLD_NAME`]; resolution
/// itself never fails.
pub async fn resolve_world_name(server_root: &Path) -> String {
    let path = server_root.join(PROPERTIES_FILE);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(value) => value,
        Err(err) => {
            warn!("failed to read {}: {err}", path.display());
            return FALLBACK_WORLD_NAME.to_string();
        }
    };

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case(WORLD_NAME_KEY) {
            let value = value.trim();
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }

    warn!("no {WORLD_NAME_KEY} entry in {}", path.display());
    FALLBACK_WORLD_NAME.to_string()
}

/// Create a staging directory under `temp_root` and the world subdirectory
/// inside it. The directory token is either the caller-supplied fixed name or
/// a `YYYY-MM-DD-HHMMSS` timestamp.
pub async fn create_staging_dir(
    temp_root: &Path,
    world_name: &str,
    fixed_name: Option<&str>,
) -> Result<PathBuf> {
    let token = match fixed_name {
        Some(name) => name.to_string(),
        None => Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
    };
    let staging = temp_root.join(token);
    tokio::fs::create_dir_all(staging.join(world_name))
        .await
        .with_context(|| format!("Failed to create staging directory {}", staging.display()))?;
    Ok(staging)
}

/// Copy the world tree at `source` into `dest`, skipping filesystem recovery
/// entries. Runs on the blocking pool.
pub async fn copy_world(source: &Path, dest: &Path) -> Result<()> {
    if !path_exists(source).await {
        anyhow::bail!("world directory {} does not exist", source.display());
    }

    let source = source.to_path_buf();
    let dest = dest.to_path_buf();
    task::spawn_blocking(move || copy_tree_blocking(&source, &dest))
        .await
        .context("Failed to copy world directory")??;
    Ok(())
}

fn copy_tree_blocking(src: &Path, dst: &Path) -> Result<()> {
    stdfs::create_dir_all(dst).with_context(|| format!("Failed to create {}", dst.display()))?;
    for entry in stdfs::read_dir(src).with_context(|| format!("Failed to read {}", src.display()))? {
        let entry = entry.with_context(|| format!("Failed to read entry in {}", src.display()))?;
        let name = entry.file_name();
        if name.to_string_lossy().contains(LOST_ENTRY_MARKER) {
            continue;
        }
        let path = entry.path();
        let dest = dst.join(&name);
        if path.is_dir() {
            copy_tree_blocking(&path, &dest)?;
        } else if path.is_file() {
            stdfs::copy(&path, &dest)
                .with_context(|| format!("Failed to copy {}", path.display()))?;
        }
    }
    Ok(())
}

/// Truncate a staged file to exactly `length` bytes, discarding anything the
/// host wrote after the snapshot instant.
pub async fn truncate_file(path: &Path, length: u64) -> Result<()> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open {} for truncation", path.display()))?;
    file.set_len(length)
        .await
        .with_context(|| format!("Failed to truncate {} to {length} bytes", path.display()))?;
    Ok(())
}

/// Archive the staged `<world_name>` subtree into
/// `<backups_dir>/<staging token>_<world_name>.zip` and return the artifact
/// path. Entry names are relative to the world root.
pub async fn archive_world(
    staging_dir: &Path,
    world_name: &str,
    backups_dir: &Path,
) -> Result<PathBuf> {
    tokio::fs::create_dir_all(backups_dir)
        .await
        .with_context(|| format!("Failed to create {}", backups_dir.display()))?;

    let token = staging_dir
        .file_name()
        .context("staging directory has no name")?
        .to_string_lossy()
        .into_owned();
    let destination = backups_dir.join(format!("{token}_{world_name}.zip"));

    let world_dir = staging_dir.join(world_name);
    let artifact = destination.clone();
    task::spawn_blocking(move || -> Result<()> {
        let file = stdfs::File::create(&artifact)
            .with_context(|| format!("Failed to create {}", artifact.display()))?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for entry in WalkDir::new(&world_dir)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
        {
            let path = entry.path();
            let rel = path
                .strip_prefix(&world_dir)
                .context("archive entry outside the world root")?;
            let name = rel.to_string_lossy().replace('\\', "/");
            zip.start_file(&name, options)
                .with_context(|| format!("Failed to write archive entry {name}"))?;
            let bytes = stdfs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            zip.write_all(&bytes)
                .with_context(|| format!("Failed to write archive entry {name}"))?;
        }

        zip.finish().context("Failed to finalize backup archive")?;
        Ok(())
    })
    .await
    .context("Failed to archive world")??;

    info!("backup archive written to {}", destination.display());
    Ok(destination)
}

/// Recursively remove a directory tree. Removing a path that does not exist
/// is a no-op, not an error.
pub async fn remove_tree(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("Failed to remove {}", path.display()))
        }
    }
}

pub async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
