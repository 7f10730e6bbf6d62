//! File system helpers for lane workspaces.
//!
//! Build tools and virus scanners hold files open for short periods, so writes
//! are retried and deletes never fail the run.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::time::{sleep, Duration};
use walkdir::WalkDir;

/// Attempts for a single write before giving up.
const WRITE_ATTEMPTS: u32 = 50;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Entries never copied into a sandbox.
const SANDBOX_SKIP: &[&str] = &[".git", "target", "node_modules", ".mutest"];

/// Marker embedded in the name of every file the engine creates next to the user's files.
pub const ARTIFACT_MARKER: &str = "_mutest_";
/// Infix of in-place backup files: `<name>.backup.<timestamp>`.
pub const BACKUP_INFIX: &str = ".backup.";

/// Write a file, retrying transient failures.
pub async fn write_with_retry(path: &Path, content: &str) -> anyhow::Result<()> {
    let mut attempt = 0;
    loop {
        match tokio::fs::write(path, content).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt + 1 < WRITE_ATTEMPTS => {
                attempt += 1;
                tracing::debug!(
                    "Write to {} failed (attempt {}): {}",
                    path.display(),
                    attempt,
                    e
                );
                sleep(WRITE_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to write {} after {} attempts: {}",
                    path.display(),
                    WRITE_ATTEMPTS,
                    e
                ))
            }
        }
    }
}

/// Delete a file or directory. Permission problems are logged and retried once;
/// nothing here fails the caller.
pub async fn remove_lenient(path: &Path) {
    for attempt in 0..2 {
        let result = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
            Ok(_) => tokio::fs::remove_file(path).await,
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => return,
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) if e.kind() == ErrorKind::PermissionDenied && attempt == 0 => {
                tracing::warn!("Permission denied deleting {}, retrying", path.display());
                sleep(WRITE_RETRY_DELAY).await;
            }
            Err(e) => {
                tracing::warn!("Could not delete {}: {}", path.display(), e);
                return;
            }
        }
    }
}

/// Copy a project tree to a temporary directory so mutations never touch the original.
///
/// The returned TempDir removes the copy on drop.
pub async fn copy_project_to_temp(project_root: &Path) -> anyhow::Result<tempfile::TempDir> {
    let project_root = project_root.to_path_buf();

    // fs_extra is synchronous
    tokio::task::spawn_blocking(move || -> anyhow::Result<tempfile::TempDir> {
        let temp_dir = tempfile::TempDir::with_prefix("mutest-")?;

        let entries: Vec<PathBuf> = std::fs::read_dir(&project_root)?
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                !SANDBOX_SKIP.contains(&name.as_str())
            })
            .map(|e| e.path())
            .collect();

        let options = fs_extra::dir::CopyOptions {
            overwrite: false,
            skip_exist: false,
            buffer_size: 64 * 1024,
            copy_inside: false,
            content_only: false,
            depth: 0,
        };

        fs_extra::copy_items(&entries, temp_dir.path(), &options)
            .map_err(|e| anyhow::anyhow!("Failed to copy project: {}", e))?;

        Ok(temp_dir)
    })
    .await?
}

/// Move `path` from under `from` to the same place under `to`.
///
/// Paths outside `from` are returned unchanged. Used both ways between a
/// project and its sandbox copy.
pub fn rebase_path(from: &Path, to: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix(from) {
        Ok(relative) => to.join(relative),
        Err(_) => path.to_path_buf(),
    }
}

/// What a stale-artifact sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    pub restored: usize,
    pub deleted: usize,
}

/// Remove everything an interrupted run left behind under `root`.
///
/// Backups are restored over their originals before anything is deleted.
pub async fn purge_stale(root: &Path, work_dir_name: &str) -> anyhow::Result<PurgeReport> {
    let root_buf = root.to_path_buf();
    let work_dir_name = work_dir_name.to_string();

    let (backups, artifacts) = tokio::task::spawn_blocking(move || {
        let mut backups: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut artifacts: Vec<PathBuf> = Vec::new();

        let mut walker = WalkDir::new(&root_buf).min_depth(1).into_iter();
        while let Some(entry) = walker.next() {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name().to_string_lossy().to_string();

            if entry.file_type().is_dir() {
                if name == ".git" {
                    walker.skip_current_dir();
                } else if name == work_dir_name || name.starts_with("mutest_out_dir")
                    || name.starts_with("mutest_int_dir")
                {
                    artifacts.push(entry.path().to_path_buf());
                    walker.skip_current_dir();
                }
                continue;
            }

            if let Some(original) = backup_original(entry.path()) {
                backups.push((entry.path().to_path_buf(), original));
            } else if name.contains(ARTIFACT_MARKER) {
                artifacts.push(entry.path().to_path_buf());
            }
        }
        (backups, artifacts)
    })
    .await?;

    let mut report = PurgeReport::default();
    for (backup, original) in backups {
        tracing::warn!(
            "Restoring {} from stale backup {}",
            original.display(),
            backup.display()
        );
        tokio::fs::copy(&backup, &original).await?;
        remove_lenient(&backup).await;
        report.restored += 1;
    }
    for artifact in artifacts {
        tracing::debug!("Removing stale artifact {}", artifact.display());
        remove_lenient(&artifact).await;
        report.deleted += 1;
    }
    Ok(report)
}

/// Original path for `<name>.backup.<digits>`, or None if `path` is not a backup.
pub fn backup_original(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_string_lossy().to_string();
    let index = name.rfind(BACKUP_INFIX)?;
    let stamp = &name[index + BACKUP_INFIX.len()..];
    if index == 0 || stamp.is_empty() || !stamp.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(path.with_file_name(&name[..index]))
}

/// Backup path for `path` using the given timestamp.
pub fn backup_path(path: &Path, stamp: i64) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{}{}{}", name, BACKUP_INFIX, stamp))
}
