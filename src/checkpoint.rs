//! Checkpoint save/restore for adversarial training.
//!
//! A checkpoint is a bincode-encoded [`CheckpointFile`] wrapping a
//! [`TrainingState`]. Parameter and optimizer blobs are safetensors
//! buffers produced by the networks and optimizers; the store never looks
//! inside them.
//!
//! Writes go to a hidden sibling file that is then renamed over the
//! target, so a reader sees either the previous checkpoint or the new one.
//!
//! ```rust,ignore
//! let store = CheckpointStore::new("./experiments/dcgan/checkpoints");
//! store.save(&trainer.snapshot()?, "checkpoint.bin", false)?;
//!
//! if let Some(state) = store.load("checkpoint.bin") {
//!     trainer.restore(&state)?;
//! }
//! ```

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GanError, Result};

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Alias the best checkpoint is copied to.
pub const BEST_CHECKPOINT_NAME: &str = "model_best.bin";

/// Everything needed to resume training.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    /// 1-based ordinal of the epoch to resume at.
    pub epoch: u64,
    /// Total optimisation steps completed.
    pub iteration: u64,
    /// Generator parameters (safetensors).
    pub generator_parameters: Vec<u8>,
    /// Discriminator parameters (safetensors).
    pub discriminator_parameters: Vec<u8>,
    /// Generator optimizer moments and step count (safetensors).
    pub generator_optimizer_state: Vec<u8>,
    /// Discriminator optimizer moments and step count (safetensors).
    pub discriminator_optimizer_state: Vec<u8>,
}

/// On-disk container.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Format version for compatibility checking.
    pub version: u32,
    /// Saved state.
    pub state: TrainingState,
}

/// Named checkpoints inside one directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Store rooted at `dir`. The directory is created on first save.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Checkpoint directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of checkpoint `name`.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Path of the best-checkpoint alias.
    pub fn best_path(&self) -> PathBuf {
        self.path(BEST_CHECKPOINT_NAME)
    }

    /// True when checkpoint `name` exists.
    pub fn exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    /// Persist `state` as `name`, and also as [`BEST_CHECKPOINT_NAME`] when
    /// `is_best` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written. The previous checkpoint is left intact.
    pub fn save(&self, state: &TrainingState, name: &str, is_best: bool) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let target = self.path(name);
        let tmp = self.tmp_path(name);

        let file = CheckpointFile {
            version: CHECKPOINT_VERSION,
            state: state.clone(),
        };
        let result = write_file(&tmp, &file).and_then(|()| Ok(fs::rename(&tmp, &target)?));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        tracing::debug!(
            "Saved checkpoint {} (epoch {}, iteration {})",
            target.display(),
            state.epoch,
            state.iteration
        );

        if is_best {
            let best_tmp = self.tmp_path(BEST_CHECKPOINT_NAME);
            fs::copy(&target, &best_tmp)?;
            fs::rename(&best_tmp, self.best_path())?;
            tracing::info!("New best checkpoint at epoch {}", state.epoch);
        }
        Ok(target)
    }

    /// Load checkpoint `name`.
    ///
    /// Returns `None` when the file does not exist. Any other failure is
    /// logged and also yields `None`, so the caller starts from scratch.
    pub fn load(&self, name: &str) -> Option<TrainingState> {
        match self.try_load(name) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable checkpoint {}: {e}",
                    self.path(name).display()
                );
                None
            }
        }
    }

    /// Load checkpoint `name`, distinguishing "absent" from "broken".
    pub fn try_load(&self, name: &str) -> Result<Option<TrainingState>> {
        let path = self.path(name);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let decoded: CheckpointFile = bincode::deserialize_from(BufReader::new(file))?;
        if decoded.version != CHECKPOINT_VERSION {
            return Err(GanError::checkpoint(format!(
                "version mismatch: expected {CHECKPOINT_VERSION}, found {}",
                decoded.version
            )));
        }
        Ok(Some(decoded.state))
    }

    fn tmp_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!(".{name}.tmp"))
    }
}

fn write_file(path: &Path, checkpoint: &CheckpointFile) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(&mut writer, checkpoint)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(epoch: u64) -> TrainingState {
        TrainingState {
            epoch,
            iteration: epoch * 10,
            generator_parameters: vec![1, 2, 3],
            discriminator_parameters: vec![4, 5],
            generator_optimizer_state: vec![6],
            discriminator_optimizer_state: vec![7, 8, 9, 10],
        }
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load("checkpoint.bin").is_none());
        assert!(store.try_load("checkpoint.bin").unwrap().is_none());
    }

    #[test]
    fn test_save_load_roundtrip_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("nested/ckpt"));

        let path = store.save(&state(2), "checkpoint.bin", false).unwrap();
        assert!(path.is_file());
        assert!(store.exists("checkpoint.bin"));
        assert!(!store.best_path().exists());
        assert_eq!(store.load("checkpoint.bin"), Some(state(2)));
    }

    #[test]
    fn test_save_overwrites_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        store.save(&state(1), "checkpoint.bin", false).unwrap();
        store.save(&state(2), "checkpoint.bin", false).unwrap();
        assert_eq!(store.load("checkpoint.bin").unwrap().epoch, 2);

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["checkpoint.bin".to_string()]);
    }

    #[test]
    fn test_is_best_copies_to_alias() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        store.save(&state(3), "checkpoint.bin", true).unwrap();
        assert_eq!(
            fs::read(store.path("checkpoint.bin")).unwrap(),
            fs::read(store.best_path()).unwrap()
        );
        assert_eq!(store.load(BEST_CHECKPOINT_NAME), Some(state(3)));
    }

    #[test]
    fn test_corrupt_checkpoint_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        fs::write(store.path("checkpoint.bin"), b"not a checkpoint").unwrap();

        assert!(store.try_load("checkpoint.bin").is_err());
        assert!(store.load("checkpoint.bin").is_none());
    }

    #[test]
    fn test_version_mismatch_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let stale = CheckpointFile {
            version: CHECKPOINT_VERSION + 1,
            state: state(1),
        };
        write_file(&store.path("checkpoint.bin"), &stale).unwrap();

        let err = store.try_load("checkpoint.bin").unwrap_err();
        assert!(err.to_string().contains("version mismatch"));
        assert!(store.load("checkpoint.bin").is_none());
    }
}
