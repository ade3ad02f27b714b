//! Per-read alignment count tables, stored as shardio files sorted by read id.

use crate::parameters::ComparisonParams;
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use shardio::{ShardReader, ShardSender, ShardWriter, SortKey};
use stage_store::StageArtifact;
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const COUNTS_FILE: &str = "read_counts.shard";
const SUMMARY_FILE: &str = "summary.json";

/// Number of alignments of one read in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReadCount {
    pub read_id: u64,
    pub alignment_count: u64,
}

pub struct ReadIdOrder;

impl SortKey<ReadCount> for ReadIdOrder {
    type Key = u64;
    fn sort_key(v: &ReadCount) -> Cow<'_, u64> {
        Cow::Owned(v.read_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountSummary {
    pub distinct_reads: u64,
    pub total_alignments: u64,
    /// Batches of partial counts flushed to disk while counting. Zero if counting fit in memory.
    pub spilled_runs: u64,
}

/// A complete count table for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountTable {
    dir: PathBuf,
    summary: CountSummary,
}

impl CountTable {
    pub(crate) fn new(dir: &Path, summary: CountSummary) -> Self {
        CountTable {
            dir: dir.to_path_buf(),
            summary,
        }
    }

    pub fn summary(&self) -> CountSummary {
        self.summary
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(COUNTS_FILE)
    }

    /// Reader over the table. Its iterator yields read ids in strictly ascending order.
    pub fn reader(&self) -> Result<ShardReader<ReadCount, ReadIdOrder>> {
        let path = self.path();
        let reader = ShardReader::open(&path).with_context(|| path.display().to_string())?;
        Ok(reader)
    }
}

impl StageArtifact for CountTable {
    fn persist(&self, dir: &Path) -> Result<()> {
        ensure!(
            dir.join(COUNTS_FILE).is_file(),
            "count table missing from {}",
            dir.display()
        );
        let path = dir.join(SUMMARY_FILE);
        let mut writer =
            BufWriter::new(File::create(&path).with_context(|| path.display().to_string())?);
        serde_json::to_writer_pretty(&mut writer, &self.summary)?;
        writer.flush()?;
        Ok(())
    }

    fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(SUMMARY_FILE);
        let summary: CountSummary = serde_json::from_reader(
            File::open(&path).with_context(|| path.display().to_string())?,
        )
        .with_context(|| path.display().to_string())?;
        ensure!(
            dir.join(COUNTS_FILE).is_file(),
            "count table missing from {}",
            dir.display()
        );
        Ok(CountTable::new(dir, summary))
    }
}

/// Buffer sizes handed to `ShardWriter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardBuffers {
    pub send: usize,
    pub disk_chunk: usize,
    pub item: usize,
}

impl From<&ComparisonParams> for ShardBuffers {
    fn from(params: &ComparisonParams) -> Self {
        ShardBuffers {
            send: params.shard_send_buffer,
            disk_chunk: params.shard_disk_chunk,
            item: params.shard_item_buffer,
        }
    }
}

pub(crate) struct CountShardWriter {
    // note: sender must appear before writer, because senders
    // must be dropped before writers.
    sender: ShardSender<ReadCount, ReadIdOrder>,
    writer: ShardWriter<ReadCount, ReadIdOrder>,
}

impl CountShardWriter {
    pub(crate) fn create(path: &Path, buffers: ShardBuffers) -> Result<Self> {
        let writer: ShardWriter<ReadCount, ReadIdOrder> =
            ShardWriter::new(path, buffers.send, buffers.disk_chunk, buffers.item)
                .with_context(|| path.display().to_string())?;
        let sender = writer.get_sender();
        Ok(CountShardWriter { sender, writer })
    }

    pub(crate) fn send(&mut self, count: ReadCount) -> Result<()> {
        self.sender.send(count)?;
        Ok(())
    }

    pub(crate) fn finish(mut self) -> Result<()> {
        self.sender.finished()?;
        self.writer.finish()?;
        Ok(())
    }
}
