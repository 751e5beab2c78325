//! export_run - write one recorded run and its per-image results as a JSON
//! bundle or as `<stem>_run.csv` plus `<stem>_results.csv`

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::fs::File;
use std::io::{BufWriter, IsTerminal};
use std::path::{Path, PathBuf};

use detection_bench::export::{csv_paths, write_results_csv, write_run_csv};
use detection_bench::{RunExport, RunRecorder, SqliteRunRecorder};

#[path = "../ui.rs"]
mod ui;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Json,
    Csv,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the run database.
    #[arg(long, env = "DETECT_DB_PATH", default_value = "detection_runs.db")]
    db_path: String,
    /// Run identifier to export.
    #[arg(long)]
    run_id: String,
    /// Output file path. For csv, its stem names the two CSV files.
    #[arg(long, default_value = "run_export.json")]
    output: PathBuf,
    /// Export format.
    #[arg(long, value_enum, default_value = "json")]
    format: Format,
    /// Only include results flagged uncertain (manual review queue).
    #[arg(long)]
    uncertain_only: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| anyhow!("failed to create {}: {}", path.display(), e))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let mut recorder = {
        let _stage = ui.stage("Open run database");
        SqliteRunRecorder::open(&args.db_path)?
    };
    let (run, mut results) = {
        let _stage = ui.stage("Load run");
        let run = recorder
            .load_run(&args.run_id)?
            .ok_or_else(|| anyhow!("run {} not found in {}", args.run_id, args.db_path))?;
        let results = recorder.load_results(&args.run_id)?;
        (run, results)
    };
    if args.uncertain_only {
        results.retain(|r| r.uncertain);
    }
    if !run.status.is_terminal() {
        log::warn!("run {} is still {}; exporting partial results", run.run_id, run.status);
    }

    let count = results.len();
    let written = match args.format {
        Format::Json => {
            let _stage = ui.stage("Write export bundle");
            RunExport::new(run, results)?.write_json(create(&args.output)?)?;
            args.output.display().to_string()
        }
        Format::Csv => {
            let _stage = ui.stage("Write CSV files");
            let (run_path, results_path) = csv_paths(&args.output);
            write_run_csv(create(&run_path)?, &run)?;
            write_results_csv(create(&results_path)?, &results)?;
            format!("{} and {}", run_path.display(), results_path.display())
        }
    };
    println!("exported {} results for run {} to {}", count, args.run_id, written);
    Ok(())
}
