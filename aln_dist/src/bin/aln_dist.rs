//! aln_dist
#![deny(missing_docs)]

use aln_dist::pipeline::STAGES;
use aln_dist::{run_comparison, ComparisonParams, RunInput};
use anyhow::Result;
use chrono::Local;
use docopt::Docopt;
use env_logger::Builder;
use log::{info, LevelFilter};
use serde::Deserialize;
use stage_store::StageStore;
use std::io::Write;
use std::path::{Path, PathBuf};

const USAGE: &str = "
Compare the number of alignments per read between an old and a new aligner run.

Usage:
  aln_dist compare <old> <new> <outdir> [--params=<toml>] [--force]
  aln_dist (-h | --help)

Arguments:
  <old>, <new>       A RUM output directory (containing RUM_Unique and RUM_NU), or a single
                     alignment file. Files ending in .gz are decompressed.
  <outdir>           Receives distribution.tsv, classes.tsv and changed_reads.tsv. Stage
                     checkpoints are kept in <outdir>/stages so an interrupted comparison
                     resumes where it stopped.

Options:
  -h --help          Show this screen.
  --params=<toml>    TOML file overriding the default comparison parameters.
  --force            Discard checkpoints from earlier invocations and recompute every stage.
";

#[derive(Debug, Deserialize)]
struct Args {
    cmd_compare: bool,
    arg_old: String,
    arg_new: String,
    arg_outdir: String,
    flag_params: Option<String>,
    flag_force: bool,
}

fn init_logging() {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, LevelFilter::Info)
        .parse_default_env()
        .init();
}

fn compare(args: &Args) -> Result<()> {
    let params = match &args.flag_params {
        Some(path) => ComparisonParams::from_toml_path(Path::new(path))?,
        None => ComparisonParams::default(),
    };
    let old = RunInput::resolve(Path::new(&args.arg_old))?;
    let new = RunInput::resolve(Path::new(&args.arg_new))?;

    let out_dir = PathBuf::from(&args.arg_outdir);
    let store = StageStore::open(out_dir.join("stages"))?;
    if args.flag_force {
        for stage in STAGES {
            store.reset(stage)?;
        }
    }

    let report = run_comparison(&old, &new, &store, &params)?;
    report.publish(&out_dir)?;
    info!("wrote results to {}", out_dir.display());
    Ok(())
}

fn main() -> Result<()> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    init_logging();

    if args.cmd_compare {
        compare(&args)?;
    }
    Ok(())
}
