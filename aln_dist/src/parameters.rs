//! Tunables for a comparison, optionally overridden from a TOML file.

use anyhow::{ensure, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComparisonParams {
    /// Distinct read ids held in memory before partial counts are spilled to disk.
    pub spill_threshold: usize,
    /// Items buffered by a shard sender before being handed to the writer thread.
    pub shard_send_buffer: usize,
    /// Items per compressed block on disk.
    pub shard_disk_chunk: usize,
    /// Items sorted in memory by the shard writer before blocks are written.
    pub shard_item_buffer: usize,
    /// Log progress every this many input lines. Zero disables progress logging.
    pub progress_interval: u64,
}

const DEFAULT_PARAMS: ComparisonParams = ComparisonParams {
    spill_threshold: 5_000_000,
    shard_send_buffer: 256,
    shard_disk_chunk: 8_192,
    shard_item_buffer: 1_048_576,
    progress_interval: 10_000_000,
};

impl Default for ComparisonParams {
    fn default() -> Self {
        DEFAULT_PARAMS
    }
}

macro_rules! warn_non_default {
    ($params:expr, $($field:ident),+) => {
        $(
            if $params.$field != DEFAULT_PARAMS.$field {
                warn!("using non-default {} = {:?}", stringify!($field), $params.$field);
            }
        )+
    };
}

impl ComparisonParams {
    /// Read parameters from a TOML file. Keys that are not present keep their defaults.
    pub fn from_toml_path(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| path.display().to_string())?;
        let params: ComparisonParams =
            toml::from_str(&s).with_context(|| path.display().to_string())?;
        params.validate()?;
        warn_non_default!(
            params,
            spill_threshold,
            shard_send_buffer,
            shard_disk_chunk,
            shard_item_buffer,
            progress_interval
        );
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.spill_threshold > 0, "spill_threshold must be positive");
        ensure!(self.shard_send_buffer > 0, "shard_send_buffer must be positive");
        ensure!(self.shard_disk_chunk > 0, "shard_disk_chunk must be positive");
        ensure!(
            self.shard_item_buffer >= self.shard_disk_chunk,
            "shard_item_buffer ({}) must be at least shard_disk_chunk ({})",
            self.shard_item_buffer,
            self.shard_disk_chunk
        );
        Ok(())
    }
}
