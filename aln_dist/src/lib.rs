//! aln_dist
//!
//! Compare two runs of an aligner by the number of alignments each run reports per read, and
//! tabulate how reads moved between alignment counts.

pub mod classes;
pub mod count_table;
pub mod counter;
pub mod distribution;
pub mod errors;
pub mod merge;
pub mod parameters;
pub mod pipeline;
pub mod seq_id;

pub use count_table::{CountTable, ReadCount};
pub use counter::AlignmentCounter;
pub use distribution::{DistributionAggregator, DistributionCell, DistributionTable};
pub use errors::{AlnDistError, Side};
pub use merge::{MergedRecord, StreamMerger};
pub use parameters::ComparisonParams;
pub use pipeline::{run_comparison, ComparisonReport};
pub use seq_id::{RunInput, SequenceIdExtractor};
