//! Durable checkpoint storage.
//!
//! Epistemic foundation:
//! - K_i: One snapshot file per key, written atomically (write-then-rename)
//! - K_i: Only the dispatcher calls save/clear → single writer, no file locking
//! - B_i: Checkpoint file may not exist or may be corrupt → load returns Option
//! - I^B: Crash during write → backup file provides recovery
//! - I^B: No writable directory at all → store runs disabled, run continues

use super::{CheckpointSnapshot, RunIdentity};
use crate::models::CheckpointError;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

const APP_DIR: &str = "resumable-infer";

/// Outcome of probing candidate checkpoint directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLocation {
    /// Chosen directory
    pub dir: PathBuf,
    /// Whether the directory passed the write probe
    pub writable: bool,
    /// Number of candidates probed
    pub tried: usize,
}

/// Built-in candidate list: working directory, user home, system temp.
pub fn default_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::with_capacity(3);
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    candidates.push(cwd.join("checkpoints"));
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(format!(".{APP_DIR}")).join("checkpoints"));
    }
    candidates.push(temp_candidate());
    candidates
}

fn temp_candidate() -> PathBuf {
    std::env::temp_dir().join(APP_DIR).join("checkpoints")
}

/// Probe candidates in order and return the first writable one.
///
/// If every candidate fails, the temp-directory candidate is returned with
/// `writable == false`; callers should run without persistence.
pub fn resolve_writable_location(candidates: &[PathBuf]) -> ResolvedLocation {
    for dir in candidates {
        match probe_dir(dir) {
            Ok(()) => {
                debug!(dir = %dir.display(), "Checkpoint directory is writable");
                return ResolvedLocation {
                    dir: dir.clone(),
                    writable: true,
                    tried: candidates.len(),
                };
            }
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Checkpoint directory rejected");
            }
        }
    }

    warn!(
        tried = candidates.len(),
        "No writable checkpoint directory; progress will not be persisted"
    );
    ResolvedLocation {
        dir: temp_candidate(),
        writable: false,
        tried: candidates.len(),
    }
}

/// Create the directory and a marker file, then remove the marker.
fn probe_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let marker = dir.join(format!(".write-probe-{}", uuid::Uuid::new_v4()));
    File::create(&marker)?.write_all(b"ok")?;
    fs::remove_file(&marker)
}

/// File-system backed checkpoint store.
pub struct CheckpointStore {
    /// Directory for checkpoint files
    dir: PathBuf,
    /// False when no writable location was found
    enabled: bool,
    /// Candidate directories probed to find `dir`
    tried: usize,
    /// Set once the disabled-mode warning has been logged
    warned_disabled: AtomicBool,
}

impl CheckpointStore {
    /// Open a store in the first writable candidate directory.
    ///
    /// Never fails: with no writable candidate the store is disabled.
    pub fn open(candidates: &[PathBuf]) -> Self {
        let location = resolve_writable_location(candidates);
        Self::from_location(location)
    }

    /// Build a store from an already resolved location.
    pub fn from_location(location: ResolvedLocation) -> Self {
        if location.writable {
            info!(dir = %location.dir.display(), "Using checkpoint directory");
        }
        Self {
            dir: location.dir,
            enabled: location.writable,
            tried: location.tried,
            warned_disabled: AtomicBool::new(false),
        }
    }

    /// Open a store in exactly this directory.
    pub fn at(dir: &Path) -> Result<Self, CheckpointError> {
        probe_dir(dir).map_err(|e| CheckpointError::io("probing checkpoint dir", dir, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            enabled: true,
            tried: 1,
            warned_disabled: AtomicBool::new(false),
        })
    }

    /// A store that persists nothing.
    pub fn disabled() -> Self {
        Self {
            dir: temp_candidate(),
            enabled: false,
            tried: 0,
            warned_disabled: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Error unless a writable location was found.
    pub fn ensure_enabled(&self) -> Result<(), CheckpointError> {
        if self.enabled {
            Ok(())
        } else {
            Err(CheckpointError::NoWritableLocation { tried: self.tried })
        }
    }

    /// Get checkpoint directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the snapshot file for a key.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.checkpoint.json", sanitize_key(key)))
    }

    fn backup_path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.checkpoint.backup.json", sanitize_key(key)))
    }

    fn temp_path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.checkpoint.tmp.json", sanitize_key(key)))
    }

    /// Load a snapshot usable for this run.
    ///
    /// Fails softly: missing, corrupt, or mismatched checkpoints all yield `None`.
    pub fn load(&self, identity: &RunIdentity) -> Option<CheckpointSnapshot> {
        let snapshot = match self.read(&identity.key) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(key = %identity.key, "No checkpoint found");
                return None;
            }
            Err(e) => {
                warn!(key = %identity.key, error = %e, "Ignoring unreadable checkpoint");
                return None;
            }
        };

        match snapshot.validate(identity) {
            Ok(()) => Some(snapshot),
            Err(e) => {
                warn!(key = %identity.key, error = %e, "Ignoring checkpoint, starting fresh");
                None
            }
        }
    }

    /// Read the raw snapshot for a key, falling back to the backup copy when
    /// the primary file is corrupt.
    pub fn read(&self, key: &str) -> Result<Option<CheckpointSnapshot>, CheckpointError> {
        if !self.enabled {
            return Ok(None);
        }

        match read_snapshot(&self.path_for(key)) {
            Ok(found) => Ok(found),
            Err(primary) => {
                let backup = self.backup_path_for(key);
                match read_snapshot(&backup) {
                    Ok(Some(snapshot)) => {
                        warn!(error = %primary, "Primary checkpoint unreadable, using backup");
                        Ok(Some(snapshot))
                    }
                    _ => Err(primary),
                }
            }
        }
    }

    /// Save a snapshot (atomic write), replacing any previous one for its key.
    pub fn save(&self, snapshot: &CheckpointSnapshot) -> Result<(), CheckpointError> {
        if !self.enabled {
            if !self.warned_disabled.swap(true, Ordering::Relaxed) {
                warn!("Checkpointing disabled (no writable location); progress is not persisted");
            }
            return Ok(());
        }

        let path = self.path_for(&snapshot.key);
        let backup = self.backup_path_for(&snapshot.key);

        // Backup existing checkpoint
        if path.exists() {
            fs::copy(&path, &backup)
                .map_err(|e| CheckpointError::io("backing up checkpoint", &backup, e))?;
        }

        // Write to temp file
        let temp = self.temp_path_for(&snapshot.key);
        {
            let file = File::create(&temp)
                .map_err(|e| CheckpointError::io("creating temp checkpoint", &temp, e))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, snapshot).map_err(|e| {
                CheckpointError::Corrupt {
                    path: temp.clone(),
                    reason: format!("serializing checkpoint: {e}"),
                }
            })?;
            writer
                .flush()
                .map_err(|e| CheckpointError::io("flushing checkpoint", &temp, e))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| CheckpointError::io("syncing checkpoint", &temp, e))?;
        }

        // Atomic rename
        fs::rename(&temp, &path).map_err(|e| CheckpointError::io("renaming checkpoint", &path, e))?;

        debug!(
            key = %snapshot.key,
            completed = snapshot.completed.len(),
            total = snapshot.total_records,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Delete the snapshot (and its backup) for a key. Missing files are fine.
    pub fn clear(&self, key: &str) -> Result<(), CheckpointError> {
        if !self.enabled {
            return Ok(());
        }
        for path in [self.path_for(key), self.backup_path_for(key)] {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed checkpoint file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(CheckpointError::io("removing checkpoint", &path, e)),
            }
        }
        Ok(())
    }
}

fn read_snapshot(path: &Path) -> Result<Option<CheckpointSnapshot>, CheckpointError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CheckpointError::io("opening checkpoint", path, e)),
    };
    serde_json::from_reader(BufReader::new(file))
        .map(Some)
        .map_err(|e| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Make a key safe to use as a file name.
fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "default".to_string()
    } else {
        cleaned
    }
}
