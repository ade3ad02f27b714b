//! Grouping a stream of read ids into a per-read alignment count table.
//!
//! Counts accumulate in a hash map. Once the map holds `spill_threshold` distinct reads its
//! contents are sorted and flushed to a scratch shard file as a partial run, and the map starts
//! over. At the end the partial runs are merged by read id and equal ids are summed, so the
//! final table is the same whether or not anything was spilled.

use crate::count_table::{
    CountShardWriter, CountSummary, CountTable, ReadCount, ReadIdOrder, ShardBuffers, COUNTS_FILE,
};
use crate::errors::Side;
use crate::parameters::ComparisonParams;
use anyhow::{ensure, Context, Result};
use fxhash::FxHashMap;
use itertools::{process_results, Itertools};
use log::{debug, info};
use shardio::ShardReader;
use stage_store::StageStore;
use std::path::{Path, PathBuf};

const SPILL_FILE: &str = "partial_counts.shard";

struct CountAccumulator {
    counts: FxHashMap<u64, u64>,
    spill_threshold: usize,
    buffers: ShardBuffers,
    spill_path: PathBuf,
    spill: Option<CountShardWriter>,
    spilled_runs: u64,
    total: u64,
}

impl CountAccumulator {
    fn new(spill_threshold: usize, buffers: ShardBuffers, spill_path: PathBuf) -> Self {
        CountAccumulator {
            counts: FxHashMap::default(),
            spill_threshold,
            buffers,
            spill_path,
            spill: None,
            spilled_runs: 0,
            total: 0,
        }
    }

    fn add(&mut self, read_id: u64, occurrences: u64) -> Result<()> {
        let count = self.counts.entry(read_id).or_insert(0);
        *count = count
            .checked_add(occurrences)
            .with_context(|| format!("alignment count of read {read_id} overflows"))?;
        self.total = self
            .total
            .checked_add(occurrences)
            .context("total alignment count overflows")?;
        if self.counts.len() >= self.spill_threshold {
            self.spill_counts()?;
        }
        Ok(())
    }

    fn drain_sorted(&mut self) -> Vec<(u64, u64)> {
        let mut batch: Vec<_> = self.counts.drain().collect();
        batch.sort_unstable();
        batch
    }

    fn spill_counts(&mut self) -> Result<()> {
        let mut writer = match self.spill.take() {
            Some(writer) => writer,
            None => {
                info!(
                    "more than {} distinct reads, spilling counts to {}",
                    self.spill_threshold,
                    self.spill_path.display()
                );
                CountShardWriter::create(&self.spill_path, self.buffers)?
            }
        };
        let batch = self.drain_sorted();
        debug!("spilling {} partial counts", batch.len());
        for (read_id, alignment_count) in batch {
            writer.send(ReadCount {
                read_id,
                alignment_count,
            })?;
        }
        self.spill = Some(writer);
        self.spilled_runs += 1;
        Ok(())
    }

    /// Write the final table to `dest`.
    fn finish(mut self, dest: &Path) -> Result<CountSummary> {
        if self.spill.is_some() && !self.counts.is_empty() {
            self.spill_counts()?;
        }

        let mut out = CountShardWriter::create(dest, self.buffers)?;
        let (distinct_reads, total_alignments) = match self.spill.take() {
            None => {
                let batch = self.drain_sorted();
                let distinct = batch.len() as u64;
                for (read_id, alignment_count) in batch {
                    out.send(ReadCount {
                        read_id,
                        alignment_count,
                    })?;
                }
                (distinct, self.total)
            }
            Some(spill) => {
                spill.finish()?;
                let reader: ShardReader<ReadCount, ReadIdOrder> =
                    ShardReader::open(&self.spill_path)
                        .with_context(|| self.spill_path.display().to_string())?;
                let coalesced = process_results(reader.iter()?, |iter| -> Result<(u64, u64)> {
                    let mut distinct = 0;
                    let mut total = 0;
                    for (read_id, partials) in &iter.group_by(|c| c.read_id) {
                        let alignment_count: u64 = partials.map(|c| c.alignment_count).sum();
                        out.send(ReadCount {
                            read_id,
                            alignment_count,
                        })?;
                        distinct += 1;
                        total += alignment_count;
                    }
                    Ok((distinct, total))
                })??;
                drop(reader);
                std::fs::remove_file(&self.spill_path)
                    .with_context(|| self.spill_path.display().to_string())?;
                coalesced
            }
        };
        out.finish()?;

        ensure!(
            total_alignments == self.total,
            "count table holds {total_alignments} alignments but {} were read",
            self.total
        );
        Ok(CountSummary {
            distinct_reads,
            total_alignments,
            spilled_runs: self.spilled_runs,
        })
    }
}

/// Builds one run's count table. A fresh accumulator is used for every table.
#[derive(Debug, Clone)]
pub struct AlignmentCounter {
    spill_threshold: usize,
    buffers: ShardBuffers,
}

impl AlignmentCounter {
    pub fn new(params: &ComparisonParams) -> Result<Self> {
        params.validate()?;
        Ok(AlignmentCounter {
            spill_threshold: params.spill_threshold,
            buffers: ShardBuffers::from(params),
        })
    }

    /// Count `read_ids` into a table written in `dir`. The first error aborts counting.
    pub fn count<I>(&self, read_ids: I, dir: &Path) -> Result<CountTable>
    where
        I: IntoIterator<Item = Result<u64>>,
    {
        self.count_occurrences(read_ids.into_iter().map(|id| id.map(|id| (id, 1))), dir)
    }

    /// Like [`AlignmentCounter::count`], but each item is a `(read_id, occurrences)` pair.
    pub fn count_occurrences<I>(&self, occurrences: I, dir: &Path) -> Result<CountTable>
    where
        I: IntoIterator<Item = Result<(u64, u64)>>,
    {
        let mut acc =
            CountAccumulator::new(self.spill_threshold, self.buffers, dir.join(SPILL_FILE));
        for item in occurrences {
            let (read_id, n) = item?;
            acc.add(read_id, n)?;
        }
        let summary = acc.finish(&dir.join(COUNTS_FILE))?;
        Ok(CountTable::new(dir, summary))
    }

    /// Count `(read_id, occurrences)` pairs as the stage named after `side`, committing it once
    /// the table is written.
    ///
    /// The stage must be absent. If counting fails the stage is left in progress.
    pub fn run_stage<I>(&self, store: &StageStore, side: Side, occurrences: I) -> Result<CountTable>
    where
        I: IntoIterator<Item = Result<(u64, u64)>>,
    {
        let stage = side.label();
        let dir = store.begin(stage)?;
        let table = self
            .count_occurrences(occurrences, &dir)
            .with_context(|| format!("counting alignments of the {side} run"))?;
        let summary = table.summary();
        info!(
            "{side}: {} alignments of {} distinct reads ({} spilled runs)",
            summary.total_alignments, summary.distinct_reads, summary.spilled_runs
        );
        store.commit(stage, &table)?;
        store.read(stage)
    }
}
