//! stage_store
//!
//! Directory-backed checkpoints for a staged, resumable computation.
//!
//! Every stage lives under the store root. While a stage is being computed its output is
//! written into `<root>/<stage>.partial/`; committing persists the artifact, syncs it to disk,
//! records a `stage.json` and renames the directory to `<root>/<stage>/`. The rename is the
//! single point at which a stage becomes complete, so a crash at any earlier point leaves the
//! stage in progress and it is recomputed from scratch by the next invocation.
#![deny(missing_docs)]

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const PARTIAL_SUFFIX: &str = "partial";
const STAGE_RECORD_FILE: &str = "stage.json";

/// Lifecycle of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Nothing has been written for the stage.
    Absent,
    /// The stage was begun but never committed.
    InProgress,
    /// The stage output is durably written.
    Complete,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageStatus::Absent => "absent",
            StageStatus::InProgress => "in_progress",
            StageStatus::Complete => "complete",
        })
    }
}

/// The record written next to a committed stage output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Name of the stage.
    pub stage_name: String,
    /// Status at the time the record was written.
    pub status: StageStatus,
}

/// Stage state transitions that are not allowed.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// `begin` was called on a stage that is not absent.
    #[error("stage '{stage}' cannot begin because it is {status}")]
    AlreadyStarted {
        /// Stage name.
        stage: String,
        /// Status found.
        status: StageStatus,
    },

    /// `commit` was called on a stage that was never begun, or is already complete.
    #[error("stage '{stage}' cannot be committed because it is {status}")]
    NotInProgress {
        /// Stage name.
        stage: String,
        /// Status found.
        status: StageStatus,
    },

    /// The checkpoint of a stage was never committed.
    #[error("stage '{stage}' was never committed ({status}) and must be re-executed")]
    StageIncomplete {
        /// Stage name.
        stage: String,
        /// Status found.
        status: StageStatus,
    },

    /// Stage names become directory names.
    #[error("invalid stage name {0:?}: use ASCII letters, digits, '_' or '-'")]
    InvalidName(String),
}

/// The output of a stage, as written into and read back from its directory.
pub trait StageArtifact: Sized {
    /// Write the parts of the artifact that are not yet on disk into `dir`.
    fn persist(&self, dir: &Path) -> Result<()>;

    /// Open a committed artifact from its stage directory.
    fn load(dir: &Path) -> Result<Self>;
}

/// A collection of stages rooted at one directory.
#[derive(Debug, Clone)]
pub struct StageStore {
    root: PathBuf,
}

impl StageStore {
    /// Open the store at `root`, creating the directory if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating stage store at {}", root.display()))?;
        Ok(StageStore { root })
    }

    /// The directory holding every stage.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn complete_dir(&self, stage: &str) -> PathBuf {
        self.root.join(stage)
    }

    fn partial_dir(&self, stage: &str) -> PathBuf {
        self.root.join(format!("{stage}.{PARTIAL_SUFFIX}"))
    }

    /// Current status of `stage`.
    pub fn status(&self, stage: &str) -> Result<StageStatus> {
        check_name(stage)?;
        let complete = self.complete_dir(stage);
        if complete.join(STAGE_RECORD_FILE).is_file() {
            Ok(StageStatus::Complete)
        } else if self.partial_dir(stage).exists() || complete.exists() {
            Ok(StageStatus::InProgress)
        } else {
            Ok(StageStatus::Absent)
        }
    }

    /// Move an absent stage to in progress and return the directory its output is written to.
    ///
    /// The directory is created exclusively, so two writers can never share a stage.
    pub fn begin(&self, stage: &str) -> Result<PathBuf> {
        let status = self.status(stage)?;
        if status != StageStatus::Absent {
            return Err(StageError::AlreadyStarted {
                stage: stage.to_string(),
                status,
            }
            .into());
        }
        let dir = self.partial_dir(stage);
        fs::create_dir(&dir).with_context(|| format!("beginning stage at {}", dir.display()))?;
        info!("stage '{stage}' started in {}", dir.display());
        Ok(dir)
    }

    /// Persist `artifact` into an in-progress stage and mark it complete.
    pub fn commit<A: StageArtifact>(&self, stage: &str, artifact: &A) -> Result<()> {
        let status = self.status(stage)?;
        let partial = self.partial_dir(stage);
        if status != StageStatus::InProgress || !partial.is_dir() {
            return Err(StageError::NotInProgress {
                stage: stage.to_string(),
                status,
            }
            .into());
        }

        artifact
            .persist(&partial)
            .with_context(|| format!("persisting output of stage '{stage}'"))?;
        write_record(
            &partial.join(STAGE_RECORD_FILE),
            &StageRecord {
                stage_name: stage.to_string(),
                status: StageStatus::Complete,
            },
        )?;
        sync_tree(&partial)?;

        let complete = self.complete_dir(stage);
        fs::rename(&partial, &complete).with_context(|| {
            format!(
                "renaming {} to {}",
                partial.display(),
                complete.display()
            )
        })?;
        sync_dir(&self.root)?;
        info!("stage '{stage}' complete");
        Ok(())
    }

    /// Load the artifact of a complete stage.
    pub fn read<A: StageArtifact>(&self, stage: &str) -> Result<A> {
        let status = self.status(stage)?;
        if status != StageStatus::Complete {
            return Err(StageError::StageIncomplete {
                stage: stage.to_string(),
                status,
            }
            .into());
        }
        A::load(&self.complete_dir(stage))
            .with_context(|| format!("loading output of stage '{stage}'"))
    }

    /// Directory holding the output of a complete stage.
    pub fn output_dir(&self, stage: &str) -> Result<PathBuf> {
        let status = self.status(stage)?;
        if status != StageStatus::Complete {
            return Err(StageError::StageIncomplete {
                stage: stage.to_string(),
                status,
            }
            .into());
        }
        Ok(self.complete_dir(stage))
    }

    /// The stage record of a complete stage.
    pub fn record(&self, stage: &str) -> Result<StageRecord> {
        match self.status(stage)? {
            StageStatus::Complete => {
                let path = self.complete_dir(stage).join(STAGE_RECORD_FILE);
                let file = File::open(&path).with_context(|| path.display().to_string())?;
                Ok(serde_json::from_reader(file).with_context(|| path.display().to_string())?)
            }
            status => Ok(StageRecord {
                stage_name: stage.to_string(),
                status,
            }),
        }
    }

    /// Discard everything written for `stage`, returning it to absent.
    pub fn reset(&self, stage: &str) -> Result<()> {
        let status = self.status(stage)?;
        if status == StageStatus::Absent {
            return Ok(());
        }
        warn!("discarding {status} stage '{stage}'");
        for dir in [self.partial_dir(stage), self.complete_dir(stage)] {
            if dir.exists() {
                fs::remove_dir_all(&dir).with_context(|| dir.display().to_string())?;
            }
        }
        Ok(())
    }
}

fn check_name(stage: &str) -> Result<()> {
    let valid = !stage.is_empty()
        && stage
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(StageError::InvalidName(stage.to_string()).into())
    }
}

fn write_record(path: &Path, record: &StageRecord) -> Result<()> {
    let mut writer =
        BufWriter::new(File::create(path).with_context(|| path.display().to_string())?);
    serde_json::to_writer_pretty(&mut writer, record)?;
    writer.flush()?;
    Ok(())
}

/// fsync every file below `dir`, then the directories themselves.
fn sync_tree(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| dir.display().to_string())? {
        let path = entry?.path();
        if path.is_dir() {
            sync_tree(&path)?;
        } else {
            File::open(&path)
                .and_then(|f| f.sync_all())
                .with_context(|| format!("syncing {}", path.display()))?;
        }
    }
    sync_dir(dir)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|f| f.sync_all())
        .with_context(|| format!("syncing {}", dir.display()))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
