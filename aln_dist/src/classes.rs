//! Coarser views of the merged stream: mapping class transitions and the reads whose
//! alignment count changed.

use crate::distribution::MergedVisitor;
use crate::merge::MergedRecord;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

pub const CLASS_HEADER: [&str; 3] = ["reads", "old_class", "new_class"];
pub const CHANGED_READS_HEADER: [&str; 3] = ["seqnum", "old_alns", "new_alns"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MappingClass {
    #[serde(rename = "none")]
    Unmapped,
    #[serde(rename = "unique")]
    Unique,
    #[serde(rename = "non-unique")]
    NonUnique,
}

impl MappingClass {
    pub const ALL: [MappingClass; 3] = [
        MappingClass::Unmapped,
        MappingClass::Unique,
        MappingClass::NonUnique,
    ];

    pub fn from_count(alignment_count: u64) -> Self {
        match alignment_count {
            0 => MappingClass::Unmapped,
            1 => MappingClass::Unique,
            _ => MappingClass::NonUnique,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct ClassRow {
    reads: u64,
    old_class: MappingClass,
    new_class: MappingClass,
}

/// 3x3 table of reads by (old class, new class).
///
/// Only reads present in at least one run are tabulated, so the none/none cell is always 0.
/// Reads that neither run aligned are not known to the comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingClassTable {
    counts: [[u64; 3]; 3],
}

impl MappingClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, old: MappingClass, new: MappingClass) -> u64 {
        self.counts[old.index()][new.index()]
    }

    pub fn total_reads(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    pub fn write_tsv<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(writer);
        writer.write_record(CLASS_HEADER)?;
        for old_class in MappingClass::ALL {
            for new_class in MappingClass::ALL {
                writer.serialize(ClassRow {
                    reads: self.get(old_class, new_class),
                    old_class,
                    new_class,
                })?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_tsv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_path(path)
            .with_context(|| path.display().to_string())?;
        let mut table = MappingClassTable::new();
        for row in reader.deserialize() {
            let row: ClassRow = row.with_context(|| path.display().to_string())?;
            table.counts[row.old_class.index()][row.new_class.index()] += row.reads;
        }
        Ok(table)
    }
}

impl MergedVisitor for MappingClassTable {
    fn visit(&mut self, record: &MergedRecord) -> Result<()> {
        let old = MappingClass::from_count(record.old_count);
        let new = MappingClass::from_count(record.new_count);
        self.counts[old.index()][new.index()] += 1;
        Ok(())
    }
}

/// Streams `seqnum old_alns new_alns` rows for reads whose alignment count differs.
pub struct ChangedReadsWriter<W: Write> {
    writer: csv::Writer<W>,
    changed: u64,
}

impl<W: Write> ChangedReadsWriter<W> {
    pub fn new(writer: W) -> Result<Self> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(writer);
        writer.write_record(CHANGED_READS_HEADER)?;
        Ok(ChangedReadsWriter { writer, changed: 0 })
    }

    /// Flush and return the number of rows written.
    pub fn finish(mut self) -> Result<u64> {
        self.writer.flush()?;
        Ok(self.changed)
    }
}

impl<W: Write> MergedVisitor for ChangedReadsWriter<W> {
    fn visit(&mut self, record: &MergedRecord) -> Result<()> {
        if record.old_count != record.new_count {
            self.writer
                .serialize((record.read_id, record.old_count, record.new_count))?;
            self.changed += 1;
        }
        Ok(())
    }
}
