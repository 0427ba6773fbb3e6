//! Per-slot download directories
//!
//! Every worker slot writes into `<output>/.slot-<n>`. The directory is emptied
//! before an item starts, and once the detector reports completion the final
//! files are moved up into the shared output directory.

use std::path::{Path, PathBuf};

use crate::config::FileCollisionAction;

/// Maximum number of rename attempts when resolving file collisions
const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// Path of the private directory of `slot` inside `output_dir`
pub fn slot_dir(output_dir: &Path, slot: usize) -> PathBuf {
    output_dir.join(format!(".slot-{slot}"))
}

/// Create an empty directory at `dir`, removing leftovers from a previous item
pub async fn prepare(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}

/// Remove a slot directory, logging instead of failing
pub async fn discard(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to remove slot directory");
        }
    }
}

/// Pick the destination for `path` according to the collision policy
///
/// Returns `None` when the policy is [`FileCollisionAction::Skip`] and the file
/// already exists.
pub fn unique_path(path: &Path, action: FileCollisionAction) -> std::io::Result<Option<PathBuf>> {
    match action {
        FileCollisionAction::Overwrite => Ok(Some(path.to_path_buf())),
        FileCollisionAction::Skip => Ok((!path.exists()).then(|| path.to_path_buf())),
        FileCollisionAction::Rename => {
            if !path.exists() {
                return Ok(Some(path.to_path_buf()));
            }

            let invalid = |reason: &str| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{}: {}", path.display(), reason),
                )
            };
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| invalid("cannot extract file stem"))?;
            let extension = path.extension().and_then(|e| e.to_str());
            let parent = path
                .parent()
                .ok_or_else(|| invalid("cannot extract parent directory"))?;

            // Try adding (1), (2), (3), ... until we find a unique name
            for i in 1..=MAX_RENAME_ATTEMPTS {
                let new_name = match extension {
                    Some(ext) => format!("{stem} ({i}).{ext}"),
                    None => format!("{stem} ({i})"),
                };
                let new_path = parent.join(new_name);
                if !new_path.exists() {
                    return Ok(Some(new_path));
                }
            }

            Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!(
                    "{}: no unique file name after {MAX_RENAME_ATTEMPTS} attempts",
                    path.display()
                ),
            ))
        }
    }
}

/// Move finished artifacts into `output_dir`
///
/// Returns the final paths of the files that were moved. Files skipped by the
/// collision policy are left in place (and removed with the slot directory).
pub async fn merge_artifacts(
    artifacts: &[PathBuf],
    output_dir: &Path,
    action: FileCollisionAction,
) -> std::io::Result<Vec<PathBuf>> {
    let mut merged = Vec::with_capacity(artifacts.len());

    for artifact in artifacts {
        let Some(file_name) = artifact.file_name() else {
            continue;
        };

        match unique_path(&output_dir.join(file_name), action)? {
            Some(dest) => {
                tokio::fs::rename(artifact, &dest).await?;
                tracing::debug!(from = %artifact.display(), to = %dest.display(), "artifact moved");
                merged.push(dest);
            }
            None => {
                tracing::info!(
                    file = %file_name.to_string_lossy(),
                    "artifact already exists in output directory, skipping"
                );
            }
        }
    }

    Ok(merged)
}
