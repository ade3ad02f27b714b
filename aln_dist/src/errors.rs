use std::path::PathBuf;

pub use stage_store::StageError;

/// Which side of a comparison a table belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Old,
    New,
}

impl Side {
    /// Stage label used for this side's count table.
    pub fn label(self) -> &'static str {
        match self {
            Side::Old => "old",
            Side::New => "new",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AlnDistError {
    /// A raw line that neither input dialect accepts. Skipping it would silently change counts.
    #[error(
        "Malformed record at line {line} of {path:?}: {text:?}. Expected either \
         \"<count> <read_id>\" or \"seq.<digits>[a|b]...\"."
    )]
    MalformedRecord {
        path: PathBuf,
        line: u64,
        text: String,
    },

    #[error(
        "Read ids in the {side} count table are not strictly ascending: {current} follows \
         {previous}. The table must be backed by an ordered index."
    )]
    KeyOrderingViolation {
        side: Side,
        previous: u64,
        current: u64,
    },

    #[error(
        "Could not find {file:?} in the run directory {dir:?}. A run directory needs both \
         RUM_Unique and RUM_NU."
    )]
    MissingRunFile { dir: PathBuf, file: &'static str },

    #[error("The run input {0:?} does not exist.")]
    MissingRun(PathBuf),
}
