//! Orchestration of the comparison stages.
//!
//! ```text
//! old run ──> count "old" ─┐
//!                          ├─> merge ──> tabulate "distribution"
//! new run ──> count "new" ─┘
//! ```
//!
//! Every stage is checkpointed in a [`StageStore`]. Complete stages are skipped, interrupted
//! ones are discarded and rerun from the start.

use crate::classes::{ChangedReadsWriter, MappingClassTable};
use crate::count_table::CountTable;
use crate::counter::AlignmentCounter;
use crate::distribution::{tabulate, DistributionAggregator, DistributionTable, MergedVisitor};
use crate::errors::{Side, StageError};
use crate::merge::StreamMerger;
use crate::parameters::ComparisonParams;
use crate::seq_id::RunInput;
use anyhow::{ensure, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use stage_store::{StageArtifact, StageStatus, StageStore};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const DISTRIBUTION_STAGE: &str = "distribution";
pub const DISTRIBUTION_FILE: &str = "distribution.tsv";
pub const CLASSES_FILE: &str = "classes.tsv";
pub const CHANGED_READS_FILE: &str = "changed_reads.tsv";
const REPORT_SUMMARY_FILE: &str = "report.json";

/// Every stage, in the order it runs.
pub const STAGES: [&str; 3] = ["old", "new", DISTRIBUTION_STAGE];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Distinct reads in either run.
    pub total_reads: u64,
    /// Reads whose alignment count differs between runs.
    pub changed_reads: u64,
    pub old_alignments: u64,
    pub new_alignments: u64,
}

/// Output of the distribution stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonReport {
    pub distribution: DistributionTable,
    pub classes: MappingClassTable,
    pub summary: ReportSummary,
    dir: PathBuf,
}

impl ComparisonReport {
    pub fn changed_reads_path(&self) -> PathBuf {
        self.dir.join(CHANGED_READS_FILE)
    }

    /// Copy the tables into `out_dir`.
    pub fn publish(&self, out_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(out_dir).with_context(|| out_dir.display().to_string())?;
        for file in [DISTRIBUTION_FILE, CLASSES_FILE, CHANGED_READS_FILE] {
            let (src, dest) = (self.dir.join(file), out_dir.join(file));
            std::fs::copy(&src, &dest)
                .with_context(|| format!("copying {} to {}", src.display(), dest.display()))?;
        }
        Ok(())
    }
}

fn create_buffered(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(
        File::create(path).with_context(|| path.display().to_string())?,
    ))
}

impl StageArtifact for ComparisonReport {
    fn persist(&self, dir: &Path) -> Result<()> {
        ensure!(
            dir.join(CHANGED_READS_FILE).is_file(),
            "changed reads missing from {}",
            dir.display()
        );
        let mut w = create_buffered(&dir.join(DISTRIBUTION_FILE))?;
        self.distribution.write_tsv(&mut w)?;
        w.flush()?;

        let mut w = create_buffered(&dir.join(CLASSES_FILE))?;
        self.classes.write_tsv(&mut w)?;
        w.flush()?;

        let mut w = create_buffered(&dir.join(REPORT_SUMMARY_FILE))?;
        serde_json::to_writer_pretty(&mut w, &self.summary)?;
        w.flush()?;
        Ok(())
    }

    fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(REPORT_SUMMARY_FILE);
        let summary = serde_json::from_reader(
            File::open(&path).with_context(|| path.display().to_string())?,
        )
        .with_context(|| path.display().to_string())?;
        Ok(ComparisonReport {
            distribution: DistributionTable::read_tsv(&dir.join(DISTRIBUTION_FILE))?,
            classes: MappingClassTable::read_tsv(&dir.join(CLASSES_FILE))?,
            summary,
            dir: dir.to_path_buf(),
        })
    }
}

/// Return the status the stage should be treated as having. An interrupted stage is
/// discarded and reported as absent.
fn prepare_stage(store: &StageStore, stage: &str) -> Result<StageStatus> {
    match store.status(stage)? {
        StageStatus::InProgress => {
            warn!(
                "{}",
                StageError::StageIncomplete {
                    stage: stage.to_string(),
                    status: StageStatus::InProgress,
                }
            );
            store.reset(stage)?;
            Ok(StageStatus::Absent)
        }
        status => Ok(status),
    }
}

/// Count one run unless its stage is already complete. The flag is true if the table was
/// computed by this call.
pub fn ensure_counts(
    store: &StageStore,
    counter: &AlignmentCounter,
    side: Side,
    input: &RunInput,
    progress_interval: u64,
) -> Result<(CountTable, bool)> {
    let stage = side.label();
    if prepare_stage(store, stage)? == StageStatus::Complete {
        info!("stage '{stage}' already complete, skipping");
        return Ok((store.read(stage)?, false));
    }
    let table = counter.run_stage(store, side, input.occurrences(progress_interval))?;
    Ok((table, true))
}

/// Merge the two tables and tabulate the result into `dir`.
fn tabulate_tables(old: &CountTable, new: &CountTable, dir: &Path) -> Result<ComparisonReport> {
    let old_reader = old.reader()?;
    let new_reader = new.reader()?;
    let merged = StreamMerger::new(old_reader.iter()?, new_reader.iter()?)?;

    let mut distribution = DistributionAggregator::new();
    let mut classes = MappingClassTable::new();
    let mut changed = ChangedReadsWriter::new(create_buffered(&dir.join(CHANGED_READS_FILE))?)?;
    let mut visitors: [&mut dyn MergedVisitor; 3] = [&mut distribution, &mut classes, &mut changed];
    let total_reads = tabulate(merged, &mut visitors)?;
    let changed_reads = changed.finish()?;
    let distribution = distribution.finish();

    // The merge only aligns the tables, so every alignment must still be accounted for.
    let (old_alignments, new_alignments) = distribution.cells().iter().fold(
        (0u128, 0u128),
        |(old, new), c| {
            (
                old + u128::from(c.read_count) * u128::from(c.old_alignment_count),
                new + u128::from(c.read_count) * u128::from(c.new_alignment_count),
            )
        },
    );
    ensure!(
        old_alignments == u128::from(old.summary().total_alignments)
            && new_alignments == u128::from(new.summary().total_alignments),
        "distribution accounts for {old_alignments} old and {new_alignments} new alignments, \
         but the count tables hold {} and {}",
        old.summary().total_alignments,
        new.summary().total_alignments
    );
    ensure!(
        distribution.total_reads() == total_reads,
        "distribution holds {} reads but {total_reads} were merged",
        distribution.total_reads()
    );

    Ok(ComparisonReport {
        distribution,
        classes,
        summary: ReportSummary {
            total_reads,
            changed_reads,
            old_alignments: old.summary().total_alignments,
            new_alignments: new.summary().total_alignments,
        },
        dir: dir.to_path_buf(),
    })
}

/// Tabulate the two tables unless the distribution stage is already complete and was built from
/// tables with the same alignment totals.
pub fn ensure_distribution(
    store: &StageStore,
    old: &CountTable,
    new: &CountTable,
) -> Result<ComparisonReport> {
    if prepare_stage(store, DISTRIBUTION_STAGE)? == StageStatus::Complete {
        let report: ComparisonReport = store.read(DISTRIBUTION_STAGE)?;
        let (old_total, new_total) = (
            old.summary().total_alignments,
            new.summary().total_alignments,
        );
        if report.summary.old_alignments == old_total
            && report.summary.new_alignments == new_total
        {
            info!("stage '{DISTRIBUTION_STAGE}' already complete, skipping");
            return Ok(report);
        }
        warn!(
            "stage '{DISTRIBUTION_STAGE}' was built from {} old and {} new alignments, but the \
             count tables hold {old_total} and {new_total}; recomputing",
            report.summary.old_alignments, report.summary.new_alignments
        );
        store.reset(DISTRIBUTION_STAGE)?;
    }
    let dir = store.begin(DISTRIBUTION_STAGE)?;
    let report = tabulate_tables(old, new, &dir).context("tabulating alignment counts")?;
    store.commit(DISTRIBUTION_STAGE, &report)?;
    store.read(DISTRIBUTION_STAGE)
}

/// Run every stage of a comparison that is not already complete.
///
/// The two count stages run in parallel. If either is going to be recomputed, an existing
/// distribution is discarded first because it was built from different tables.
pub fn run_comparison(
    old: &RunInput,
    new: &RunInput,
    store: &StageStore,
    params: &ComparisonParams,
) -> Result<ComparisonReport> {
    let counter = AlignmentCounter::new(params)?;
    for side in [Side::Old, Side::New] {
        if store.status(side.label())? != StageStatus::Complete {
            store.reset(DISTRIBUTION_STAGE)?;
            break;
        }
    }
    let (old_counts, new_counts) = rayon::join(
        || ensure_counts(store, &counter, Side::Old, old, params.progress_interval),
        || ensure_counts(store, &counter, Side::New, new, params.progress_interval),
    );
    let (old_table, old_fresh) = old_counts?;
    let (new_table, new_fresh) = new_counts?;

    if old_fresh || new_fresh {
        store.reset(DISTRIBUTION_STAGE)?;
    }
    let report = ensure_distribution(store, &old_table, &new_table)?;
    info!(
        "{} reads compared, {} with a changed number of alignments",
        report.summary.total_reads, report.summary.changed_reads
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::MappingClass;

    fn params() -> ComparisonParams {
        ComparisonParams {
            spill_threshold: 3,
            shard_send_buffer: 4,
            shard_disk_chunk: 8,
            shard_item_buffer: 32,
            progress_interval: 0,
        }
    }

    #[test]
    fn test_example_comparison() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let old = tmp.path().join("old.txt");
        let new = tmp.path().join("new.txt");
        std::fs::write(&old, "2 1\n1 2\n")?;
        std::fs::write(
            &new,
            "seq.1a\tx\nseq.1b\tx\nseq.1\ty\nseq.2\tx\nseq.2\ty\nseq.2\tz\nseq.4b\tx\n",
        )?;

        let store = StageStore::open(tmp.path().join("stages"))?;
        let report = run_comparison(
            &RunInput::resolve(&old)?,
            &RunInput::resolve(&new)?,
            &store,
            &params(),
        )?;

        let cells: Vec<_> = report
            .distribution
            .cells()
            .iter()
            .map(|c| (c.old_alignment_count, c.new_alignment_count, c.read_count))
            .collect();
        assert_eq!(cells, vec![(0, 1, 1), (1, 3, 1), (2, 2, 1)]);
        assert_eq!(
            report.summary,
            ReportSummary {
                total_reads: 3,
                changed_reads: 2,
                old_alignments: 3,
                new_alignments: 6,
            }
        );
        assert_eq!(report.classes.get(MappingClass::Unmapped, MappingClass::Unique), 1);
        assert_eq!(
            std::fs::read_to_string(report.changed_reads_path())?,
            "seqnum\told_alns\tnew_alns\n2\t1\t3\n4\t0\t1\n"
        );
        for stage in STAGES {
            assert_eq!(store.status(stage)?, StageStatus::Complete);
        }

        let out = tmp.path().join("outs");
        report.publish(&out)?;
        assert_eq!(
            std::fs::read_to_string(out.join(DISTRIBUTION_FILE))?,
            "reads\told_alns\tnew_alns\n1\t0\t1\n1\t1\t3\n1\t2\t2\n"
        );
        Ok(())
    }

    #[test]
    fn test_distribution_checked_against_tables() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let old = tmp.path().join("old.txt");
        let new = tmp.path().join("new.txt");
        std::fs::write(&old, "1 1\n")?;
        std::fs::write(&new, "1 1\n")?;
        let store = StageStore::open(tmp.path().join("stages"))?;
        let (old_run, new_run) = (RunInput::resolve(&old)?, RunInput::resolve(&new)?);
        run_comparison(&old_run, &new_run, &store, &params())?;

        // Recount "new" behind the distribution's back.
        std::fs::write(&new, "4 1\n")?;
        store.reset("new")?;
        let counter = AlignmentCounter::new(&params())?;
        let (old_table, _) = ensure_counts(&store, &counter, Side::Old, &old_run, 0)?;
        let (new_table, fresh) = ensure_counts(&store, &counter, Side::New, &new_run, 0)?;
        assert!(fresh);
        assert_eq!(store.status(DISTRIBUTION_STAGE)?, StageStatus::Complete);

        let report = ensure_distribution(&store, &old_table, &new_table)?;
        assert_eq!(report.summary.new_alignments, 4);
        assert_eq!(report.distribution.get(1, 4), 1);
        assert_eq!(report.distribution.get(1, 1), 0);
        Ok(())
    }

    #[test]
    fn test_stale_distribution_is_recomputed() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let old = tmp.path().join("old.txt");
        let new = tmp.path().join("new.txt");
        std::fs::write(&old, "1 1\n")?;
        std::fs::write(&new, "1 1\n")?;
        let store = StageStore::open(tmp.path().join("stages"))?;
        let (old_run, new_run) = (RunInput::resolve(&old)?, RunInput::resolve(&new)?);

        let first = run_comparison(&old_run, &new_run, &store, &params())?;
        assert_eq!(first.summary.changed_reads, 0);

        std::fs::write(&new, "4 1\n")?;
        store.reset("new")?;
        let second = run_comparison(&old_run, &new_run, &store, &params())?;
        assert_eq!(second.summary.changed_reads, 1);
        assert_eq!(second.distribution.get(1, 4), 1);
        Ok(())
    }
}
