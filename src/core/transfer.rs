//! Batch copy/move of files into a target directory.
//!
//! Layouts:
//! - [`transfer_flat`] puts every file directly under the output directory,
//!   so sources with the same file name collide.
//! - [`transfer_preserving`] keeps each file's path relative to a source root.
//! - [`transfer_to`] takes explicit `(source, destination)` pairs.
//!
//! Collision policy: with `overwrite = false` an existing destination is
//! never touched and the source is skipped (a move leaves it in place).
//! With `overwrite = true` the destination is replaced, so within one flat
//! batch the last source with a given name wins. Skipped sources are
//! listed in the returned [`TransferOutcome`].

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::TransferAction;

/// Transfer failures.
///
/// Variants raised part-way through a batch carry the destinations that
/// were already written, so a half-finished move is never silent.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Failed to create directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Source has no file name: {}", .0.display())]
    NoFileName(PathBuf),

    #[error("{} is not under source root {}", .path.display(), .root.display())]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("Failed to {action} {} -> {} ({} file(s) already transferred): {source}", .from.display(), .to.display(), .completed.len())]
    Transfer {
        action: TransferAction,
        from: PathBuf,
        to: PathBuf,
        completed: Vec<PathBuf>,
        #[source]
        source: io::Error,
    },

    #[error("Copied {} but could not remove the source ({} file(s) already moved): {source}", .path.display(), .completed.len())]
    RemoveSource {
        path: PathBuf,
        completed: Vec<PathBuf>,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    /// Destinations written before the failure
    pub fn completed(&self) -> &[PathBuf] {
        match self {
            TransferError::Transfer { completed, .. }
            | TransferError::RemoveSource { completed, .. } => completed,
            _ => &[],
        }
    }
}

/// Why a source was left where it was
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The destination existed before the batch started
    DestinationExists,
    /// An earlier file in the same batch already took the destination
    NameCollision,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DestinationExists => f.write_str("destination exists"),
            SkipReason::NameCollision => f.write_str("name collision within batch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub reason: SkipReason,
}

/// Result of a batch transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    /// One destination per source, in order, whether or not it was written
    pub destinations: Vec<PathBuf>,

    /// Sources that were not transferred because of the overwrite policy
    pub skipped: Vec<SkippedFile>,
}

impl TransferOutcome {
    /// Number of sources that now have their content at the destination
    pub fn transferred(&self) -> usize {
        self.destinations.len() - self.skipped.len()
    }

    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

fn ensure_dir(path: &Path) -> Result<(), TransferError> {
    fs::create_dir_all(path).map_err(|source| TransferError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

/// Copy or move every file directly into `output_dir`
pub fn transfer_flat(
    files: &[PathBuf],
    output_dir: &Path,
    action: TransferAction,
    overwrite: bool,
) -> Result<TransferOutcome, TransferError> {
    ensure_dir(output_dir)?;

    let mut batch = Batch::new(action, overwrite);
    for source in files {
        let name = source
            .file_name()
            .ok_or_else(|| TransferError::NoFileName(source.clone()))?;
        batch.place(source, output_dir.join(name))?;
    }

    Ok(batch.outcome)
}

/// Copy or move files keeping their layout relative to `source_root`
pub fn transfer_preserving(
    files: &[PathBuf],
    source_root: &Path,
    output_dir: &Path,
    action: TransferAction,
    overwrite: bool,
) -> Result<TransferOutcome, TransferError> {
    let placements = files
        .iter()
        .map(|source| {
            let relative = source
                .strip_prefix(source_root)
                .map_err(|_| TransferError::OutsideRoot {
                    path: source.clone(),
                    root: source_root.to_path_buf(),
                })?;
            Ok((source.clone(), output_dir.join(relative)))
        })
        .collect::<Result<Vec<_>, TransferError>>()?;

    ensure_dir(output_dir)?;
    transfer_to(&placements, action, overwrite)
}

/// Copy or move each `(source, destination)` pair as one batch.
///
/// Parent directories are created as needed; the overwrite and collision
/// rules are the same as for the other layouts.
pub fn transfer_to(
    placements: &[(PathBuf, PathBuf)],
    action: TransferAction,
    overwrite: bool,
) -> Result<TransferOutcome, TransferError> {
    let mut batch = Batch::new(action, overwrite);
    for (source, destination) in placements {
        if destination.file_name().is_none() {
            return Err(TransferError::NoFileName(source.clone()));
        }
        if let Some(parent) = destination.parent() {
            ensure_dir(parent)?;
        }
        batch.place(source, destination.clone())?;
    }

    Ok(batch.outcome)
}

/// Per-batch bookkeeping shared by both layouts
struct Batch {
    action: TransferAction,
    overwrite: bool,
    outcome: TransferOutcome,
    written: HashSet<PathBuf>,
    completed: Vec<PathBuf>,
}

impl Batch {
    fn new(action: TransferAction, overwrite: bool) -> Self {
        Self {
            action,
            overwrite,
            outcome: TransferOutcome::default(),
            written: HashSet::new(),
            completed: Vec::new(),
        }
    }

    fn place(&mut self, source: &Path, destination: PathBuf) -> Result<(), TransferError> {
        if source == destination {
            debug!(path = %source.display(), "Source and destination are the same, skipping");
            self.outcome.destinations.push(destination);
            return Ok(());
        }

        if destination.exists() {
            let collided = self.written.contains(&destination);
            if !self.overwrite {
                let reason = if collided {
                    warn!(
                        source = %source.display(),
                        destination = %destination.display(),
                        "Name collision within batch, keeping the earlier file"
                    );
                    SkipReason::NameCollision
                } else {
                    debug!(destination = %destination.display(), "Destination exists, skipping");
                    SkipReason::DestinationExists
                };
                self.outcome.skipped.push(SkippedFile {
                    source: source.to_path_buf(),
                    destination: destination.clone(),
                    reason,
                });
                self.outcome.destinations.push(destination);
                return Ok(());
            }
            if collided {
                warn!(
                    source = %source.display(),
                    destination = %destination.display(),
                    "Name collision within batch, replacing the earlier file"
                );
            }
        }

        match self.action {
            TransferAction::Copy => self.copy(source, &destination)?,
            TransferAction::Move => self.rename(source, &destination)?,
        }

        self.written.insert(destination.clone());
        self.completed.push(destination.clone());
        self.outcome.destinations.push(destination);
        Ok(())
    }

    fn copy(&self, source: &Path, destination: &Path) -> Result<(), TransferError> {
        fs::copy(source, destination)
            .map(|_| ())
            .map_err(|e| self.failed(source, destination, e))
    }

    fn rename(&self, source: &Path, destination: &Path) -> Result<(), TransferError> {
        if destination.exists() {
            fs::remove_file(destination).map_err(|e| self.failed(source, destination, e))?;
        }

        if fs::rename(source, destination).is_ok() {
            return Ok(());
        }

        // Cross-device moves fall back to copy + remove
        self.copy(source, destination)?;
        fs::remove_file(source).map_err(|e| TransferError::RemoveSource {
            path: source.to_path_buf(),
            completed: self.completed.clone(),
            source: e,
        })
    }

    fn failed(&self, from: &Path, to: &Path, source: io::Error) -> TransferError {
        TransferError::Transfer {
            action: self.action,
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            completed: self.completed.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) -> PathBuf {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
        path.to_path_buf()
    }

    #[test]
    fn test_flat_copy_creates_output_dir() {
        let temp = TempDir::new().unwrap();
        let a = write(&temp.path().join("src/a.jpg"), "a");
        let b = write(&temp.path().join("src/sub/b.jpg"), "b");
        let out = temp.path().join("out/nested");

        let outcome = transfer_flat(&[a.clone(), b], &out, TransferAction::Copy, false).unwrap();

        assert_eq!(outcome.destinations, vec![out.join("a.jpg"), out.join("b.jpg")]);
        assert!(outcome.is_complete());
        assert_eq!(fs::read_to_string(out.join("b.jpg")).unwrap(), "b");
        assert!(a.exists());
    }

    #[test]
    fn test_flat_collision_without_overwrite_keeps_first() {
        let temp = TempDir::new().unwrap();
        let first = write(&temp.path().join("one/x.png"), "first");
        let second = write(&temp.path().join("two/x.png"), "second");
        let out = temp.path().join("out");

        let outcome =
            transfer_flat(&[first, second.clone()], &out, TransferAction::Copy, false).unwrap();

        assert_eq!(outcome.destinations.len(), 2);
        assert_eq!(outcome.transferred(), 1);
        assert_eq!(
            outcome.skipped,
            vec![SkippedFile {
                source: second,
                destination: out.join("x.png"),
                reason: SkipReason::NameCollision,
            }]
        );
        assert_eq!(fs::read_to_string(out.join("x.png")).unwrap(), "first");
    }

    #[test]
    fn test_flat_collision_with_overwrite_keeps_last() {
        let temp = TempDir::new().unwrap();
        let first = write(&temp.path().join("one/x.png"), "first");
        let second = write(&temp.path().join("two/x.png"), "second");
        let out = temp.path().join("out");

        let outcome = transfer_flat(&[first, second], &out, TransferAction::Copy, true).unwrap();

        assert_eq!(outcome.transferred(), 2);
        assert_eq!(fs::read_to_string(out.join("x.png")).unwrap(), "second");
    }

    #[test]
    fn test_move_without_overwrite_leaves_source_on_conflict() {
        let temp = TempDir::new().unwrap();
        let source = write(&temp.path().join("src/x.mp4"), "new");
        write(&temp.path().join("out/x.mp4"), "old");

        let outcome =
            transfer_flat(&[source.clone()], &temp.path().join("out"), TransferAction::Move, false)
                .unwrap();

        assert_eq!(outcome.transferred(), 0);
        assert_eq!(outcome.skipped[0].reason, SkipReason::DestinationExists);
        assert!(source.exists());
        assert_eq!(fs::read_to_string(temp.path().join("out/x.mp4")).unwrap(), "old");
    }

    #[test]
    fn test_preserving_move() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("src");
        let a = write(&root.join("trip/day1/a.jpg"), "a");
        let b = write(&root.join("trip/day2/a.jpg"), "b");
        let out = temp.path().join("out");

        let outcome =
            transfer_preserving(&[a.clone(), b.clone()], &root, &out, TransferAction::Move, false)
                .unwrap();

        assert_eq!(outcome.destinations[0], out.join("trip/day1/a.jpg"));
        assert_eq!(fs::read_to_string(&outcome.destinations[1]).unwrap(), "b");
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[test]
    fn test_preserving_rejects_file_outside_root() {
        let temp = TempDir::new().unwrap();
        let stray = write(&temp.path().join("elsewhere/a.jpg"), "a");

        let result = transfer_preserving(
            &[stray],
            &temp.path().join("src"),
            &temp.path().join("out"),
            TransferAction::Copy,
            false,
        );

        assert!(matches!(result, Err(TransferError::OutsideRoot { .. })));
    }

    #[test]
    fn test_missing_source_reports_completed_files() {
        let temp = TempDir::new().unwrap();
        let good = write(&temp.path().join("src/good.jpg"), "ok");
        let missing = temp.path().join("src/missing.jpg");

        let err = transfer_flat(
            &[good, missing],
            &temp.path().join("out"),
            TransferAction::Move,
            false,
        )
        .unwrap_err();

        assert!(matches!(err, TransferError::Transfer { .. }));
        assert_eq!(err.completed(), &[temp.path().join("out/good.jpg")]);
    }

    #[test]
    fn test_transfer_to_creates_parents() {
        let temp = TempDir::new().unwrap();
        let a = write(&temp.path().join("in/a.jpg"), "a");
        let destination = temp.path().join("out/image/trip/a.jpg");

        let outcome =
            transfer_to(&[(a.clone(), destination.clone())], TransferAction::Copy, false).unwrap();

        assert_eq!(outcome.destinations, vec![destination.clone()]);
        assert_eq!(fs::read_to_string(destination).unwrap(), "a");
    }

    #[cfg(unix)]
    #[test]
    fn test_unremovable_source_reports_moved_files() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let good = write(&temp.path().join("src/good.jpg"), "ok");
        let locked = temp.path().join("locked");
        let stuck = write(&locked.join("stuck.jpg"), "stuck");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();

        // Root ignores directory permissions
        if fs::write(locked.join("check"), "").is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let out = temp.path().join("out");
        let result = transfer_flat(&[good.clone(), stuck.clone()], &out, TransferAction::Move, false);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        match result {
            Err(TransferError::RemoveSource { path, completed, .. }) => {
                assert_eq!(path, stuck);
                assert_eq!(completed, vec![out.join("good.jpg")]);
            }
            other => panic!("expected RemoveSource, got {other:?}"),
        }
        assert!(!good.exists());
        assert!(stuck.exists());
        assert_eq!(fs::read_to_string(out.join("stuck.jpg")).unwrap(), "stuck");
    }
}
