//! Cross-tabulation of old against new alignment counts.

use crate::merge::MergedRecord;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

pub const DISTRIBUTION_HEADER: [&str; 3] = ["reads", "old_alns", "new_alns"];

/// Consumes merged records one at a time.
pub trait MergedVisitor {
    fn visit(&mut self, record: &MergedRecord) -> Result<()>;
}

/// Feed every record to every visitor, in order. Returns the number of records.
///
/// Stops at the first error, in which case the visitors hold partial results that must not be
/// published.
pub fn tabulate<I>(records: I, visitors: &mut [&mut dyn MergedVisitor]) -> Result<u64>
where
    I: IntoIterator<Item = Result<MergedRecord>>,
{
    let mut n = 0;
    for record in records {
        let record = record?;
        for visitor in visitors.iter_mut() {
            visitor.visit(&record)?;
        }
        n += 1;
    }
    Ok(n)
}

/// Number of reads with a given pair of alignment counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionCell {
    #[serde(rename = "reads")]
    pub read_count: u64,
    #[serde(rename = "old_alns")]
    pub old_alignment_count: u64,
    #[serde(rename = "new_alns")]
    pub new_alignment_count: u64,
}

/// Sparse counter keyed by `(old_count, new_count)`.
#[derive(Debug, Default)]
pub struct DistributionAggregator {
    cells: BTreeMap<(u64, u64), u64>,
}

impl DistributionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: &MergedRecord) {
        *self
            .cells
            .entry((record.old_count, record.new_count))
            .or_insert(0) += 1;
    }

    pub fn finish(self) -> DistributionTable {
        DistributionTable {
            cells: self
                .cells
                .into_iter()
                .map(|((old, new), read_count)| DistributionCell {
                    read_count,
                    old_alignment_count: old,
                    new_alignment_count: new,
                })
                .collect(),
        }
    }
}

impl MergedVisitor for DistributionAggregator {
    fn visit(&mut self, record: &MergedRecord) -> Result<()> {
        self.add(record);
        Ok(())
    }
}

/// The finished distribution, sorted by `(old_count, new_count)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionTable {
    cells: Vec<DistributionCell>,
}

impl DistributionTable {
    pub fn cells(&self) -> &[DistributionCell] {
        &self.cells
    }

    /// Number of distinct reads across both runs.
    pub fn total_reads(&self) -> u64 {
        self.cells.iter().map(|c| c.read_count).sum()
    }

    pub fn get(&self, old_count: u64, new_count: u64) -> u64 {
        self.cells
            .binary_search_by_key(&(old_count, new_count), |c| {
                (c.old_alignment_count, c.new_alignment_count)
            })
            .map_or(0, |i| self.cells[i].read_count)
    }

    pub fn write_tsv<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(writer);
        writer.write_record(DISTRIBUTION_HEADER)?;
        for cell in &self.cells {
            writer.serialize(cell)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_tsv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_path(path)
            .with_context(|| path.display().to_string())?;
        let cells = reader
            .deserialize()
            .collect::<Result<Vec<DistributionCell>, _>>()
            .with_context(|| path.display().to_string())?;
        Ok(DistributionTable { cells })
    }
}
