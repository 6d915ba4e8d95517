//! All-or-nothing file changes for the file backend.
//!
//! A [`Batch`] collects the files one store operation writes and removes,
//! then applies them together. New contents are staged and synced before
//! anything visible changes. Old files are moved aside rather than
//! overwritten, so a failure part way through can put them back.

use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::storage::types::StoreError;

#[derive(Debug, Default)]
pub(super) struct Batch {
    writes: Vec<(PathBuf, Vec<u8>)>,
    removals: Vec<PathBuf>,
}

/// One change already visible on disk, with what is needed to undo it.
enum Applied {
    /// `target` holds new contents. The old file, if any, is at `backup`.
    Written {
        target: PathBuf,
        backup: Option<PathBuf>,
    },
    /// `target` was moved to `backup`.
    Removed { target: PathBuf, backup: PathBuf },
}

impl Applied {
    fn backup(&self) -> Option<&Path> {
        match self {
            Applied::Written { backup, .. } => backup.as_deref(),
            Applied::Removed { backup, .. } => Some(backup),
        }
    }
}

impl Batch {
    pub fn write(&mut self, path: PathBuf, bytes: impl Into<Vec<u8>>) {
        self.writes.push((path, bytes.into()));
    }

    pub fn remove(&mut self, path: PathBuf) {
        self.removals.push(path);
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.removals.is_empty()
    }

    /// Applies every queued change, or none of them.
    ///
    /// Writes land in queue order, then removals. A removal whose file is
    /// already gone is skipped.
    pub fn commit(self) -> Result<(), StoreError> {
        let mut staged: Vec<(PathBuf, &Path)> = Vec::with_capacity(self.writes.len());
        for (target, bytes) in &self.writes {
            match stage(target, bytes) {
                Ok(tmp) => staged.push((tmp, target.as_path())),
                Err(e) => {
                    discard(staged.iter().map(|(tmp, _)| tmp.as_path()));
                    return Err(e);
                }
            }
        }

        let mut applied = Vec::with_capacity(staged.len() + self.removals.len());
        if let Err(e) = swap_in(&staged, &self.removals, &mut applied) {
            tracing::warn!(error = %e, applied = applied.len(), "rolling back partial file batch");
            roll_back(applied);
            discard(staged.iter().map(|(tmp, _)| tmp.as_path()));
            return Err(e);
        }

        for backup in applied.iter().filter_map(Applied::backup) {
            if let Err(e) = std::fs::remove_file(backup) {
                tracing::warn!(path = %backup.display(), error = %e, "could not remove backup file");
            }
        }
        Ok(())
    }
}

/// Replaces `path` with `bytes` via temp file, fsync and rename.
pub(super) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = stage(path, bytes)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        discard([tmp.as_path()]);
        return Err(e.into());
    }
    Ok(())
}

/// Hidden sibling of `path`: `.<name>.<suffix>`. Entry listings skip
/// dotfiles, so these never show up as entries.
fn sibling(path: &Path, suffix: &str) -> Result<PathBuf, StoreError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::Corrupt(format!("bad file path {}", path.display())))?;
    Ok(path.with_file_name(format!(".{file_name}.{suffix}")))
}

/// Writes `bytes` next to `path` and syncs them. Returns the temp path.
fn stage(path: &Path, bytes: &[u8]) -> Result<PathBuf, StoreError> {
    let tmp = sibling(path, "tmp")?;
    let written = File::create(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    match written {
        Ok(()) => Ok(tmp),
        Err(e) => {
            discard([tmp.as_path()]);
            Err(e.into())
        }
    }
}

fn swap_in(
    staged: &[(PathBuf, &Path)],
    removals: &[PathBuf],
    applied: &mut Vec<Applied>,
) -> Result<(), StoreError> {
    for (tmp, target) in staged {
        let backup = if target.is_file() {
            let backup = sibling(target, "bak")?;
            std::fs::rename(target, &backup)?;
            Some(backup)
        } else {
            None
        };

        if let Err(e) = std::fs::rename(tmp, target) {
            if let Some(backup) = &backup {
                if let Err(restore) = std::fs::rename(backup, target) {
                    tracing::error!(path = %target.display(), error = %restore, "could not restore file");
                }
            }
            return Err(e.into());
        }
        applied.push(Applied::Written {
            target: target.to_path_buf(),
            backup,
        });
    }

    for target in removals {
        let backup = sibling(target, "bak")?;
        match std::fs::rename(target, &backup) {
            Ok(()) => applied.push(Applied::Removed {
                target: target.clone(),
                backup,
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Undoes applied changes, newest first.
fn roll_back(applied: Vec<Applied>) {
    for step in applied.into_iter().rev() {
        let (target, result) = match &step {
            Applied::Written {
                target,
                backup: Some(backup),
            }
            | Applied::Removed { target, backup } => (target, std::fs::rename(backup, target)),
            Applied::Written {
                target,
                backup: None,
            } => (target, std::fs::remove_file(target)),
        };
        if let Err(e) = result {
            tracing::error!(path = %target.display(), error = %e, "could not roll back file");
        }
    }
}

fn discard<'a>(paths: impl IntoIterator<Item = &'a Path>) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::debug!(path = %path.display(), error = %e, "could not remove temp file"),
        }
    }
}
