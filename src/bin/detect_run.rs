//! detect_run - run one detection backend over a classified image corpus
//!
//! 1. Loads configuration (DETECT_CONFIG file, DETECT_* env, then flags)
//! 2. Enumerates and samples `<data_dir>/<label>/<image>`
//! 3. Builds the selected backend once
//! 4. Processes every image, recording results to SQLite
//! 5. Prints the run summary as JSON on stdout
//!
//! Exit code: 0 completed, 130 cancelled, 1 failed.

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use detection_bench::{
    class_counts, timeout_from_secs, DataLoader, DetectionProcessor, DetectorRegistry,
    InMemoryRunRecorder, ProcessorOptions, RunConfig, RunContext, RunRecorder, RunStatus,
    SqliteRunRecorder,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about = "Batch person detection over a classified image corpus")]
struct Args {
    /// Corpus root; each immediate subdirectory is a classification label.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// SQLite database receiving runs and results.
    #[arg(long)]
    db_path: Option<String>,

    /// Backend identifier or alias (region, landmark, llm, stub, ...).
    #[arg(long)]
    backend: Option<String>,

    /// Average confidence below this flags a result as uncertain (0.0-1.0).
    #[arg(long)]
    threshold: Option<f32>,

    /// Process at most this many images.
    #[arg(long)]
    max_images: Option<usize>,

    /// Comma-separated classification labels to include.
    #[arg(long, value_delimiter = ',')]
    classifications: Option<Vec<String>>,

    /// Process images in lexical order instead of shuffling.
    #[arg(long)]
    sequential: bool,

    /// Seed for reproducible shuffles.
    #[arg(long)]
    seed: Option<u64>,

    /// Human-readable run name.
    #[arg(long)]
    run_name: Option<String>,

    /// External job identifier stored with the run.
    #[arg(long)]
    job_id: Option<String>,

    /// Per-image time limit in seconds; slower images are recorded as failures.
    #[arg(long)]
    image_timeout_secs: Option<f64>,

    /// Pause between images in milliseconds.
    #[arg(long)]
    pause_ms: Option<u64>,

    /// Resource sampling interval in milliseconds.
    #[arg(long)]
    monitor_interval_ms: Option<u64>,

    /// Skip GPU sampling.
    #[arg(long)]
    no_gpu: bool,

    /// Keep results in memory instead of writing the database.
    #[arg(long)]
    dry_run: bool,

    /// Print registered backends and exit.
    #[arg(long)]
    list_backends: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, env = "DETECT_UI", default_value = "auto", value_name = "MODE")]
    ui: String,
}

impl Args {
    fn apply(&self, cfg: &mut RunConfig) -> Result<()> {
        if let Some(dir) = &self.data_dir {
            cfg.data_dir = dir.clone();
        }
        if let Some(path) = &self.db_path {
            cfg.db_path = path.clone();
        }
        if let Some(backend) = &self.backend {
            cfg.backend.name = backend.clone();
        }
        if let Some(threshold) = self.threshold {
            cfg.threshold = threshold;
        }
        if self.max_images.is_some() {
            cfg.max_images = self.max_images;
        }
        if let Some(labels) = &self.classifications {
            cfg.classifications = Some(labels.clone());
        }
        if self.sequential {
            cfg.randomize = false;
        }
        if self.seed.is_some() {
            cfg.seed = self.seed;
        }
        if self.run_name.is_some() {
            cfg.run_name = self.run_name.clone();
        }
        if self.job_id.is_some() {
            cfg.job_id = self.job_id.clone();
        }
        if let Some(secs) = self.image_timeout_secs {
            cfg.image_timeout = Some(timeout_from_secs(secs)?);
        }
        if let Some(ms) = self.pause_ms {
            cfg.pause_between_images = Duration::from_millis(ms);
        }
        if let Some(ms) = self.monitor_interval_ms {
            cfg.monitor.interval = Duration::from_millis(ms);
        }
        if self.no_gpu {
            cfg.monitor.gpu = false;
        }
        Ok(())
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let code = match run() {
        Ok(RunStatus::Completed) => 0,
        Ok(RunStatus::Cancelled) => 130,
        Ok(_) => 1,
        Err(e) => {
            log::error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<RunStatus> {
    let args = Args::parse();
    let registry = DetectorRegistry::with_builtin();
    if args.list_backends {
        for name in registry.list() {
            println!("{}", name);
        }
        return Ok(RunStatus::Completed);
    }

    let is_tty = std::io::stderr().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, false);

    let mut cfg = RunConfig::load()?;
    args.apply(&mut cfg)?;
    cfg.validate()?;

    let images = {
        let _stage = ui.stage("Enumerate images");
        DataLoader::new(&cfg.data_dir).enumerate(&cfg.sampling())?
    };
    for (label, count) in class_counts(&images) {
        log::info!("classification {}: {} images", label, count);
    }

    let mut detector = {
        let _stage = ui.stage("Initialize backend");
        registry.create(&cfg.backend)?
    };

    let mut recorder: Box<dyn RunRecorder> = if args.dry_run {
        log::info!("dry run: results kept in memory");
        Box::new(InMemoryRunRecorder::new())
    } else {
        Box::new(SqliteRunRecorder::open(&cfg.db_path)?)
    };

    let ctx = RunContext::new(cfg.run_name.clone(), cfg.job_id.clone());
    let token = ctx.cancellation.clone();
    ctrlc::set_handler(move || {
        log::warn!("cancellation requested, finishing current image");
        token.cancel();
    })
    .expect("error setting Ctrl-C handler");

    let options = ProcessorOptions::from_config(&cfg)?;
    let mut progress = ui.run_progress();
    let summary = DetectionProcessor::new(detector.as_mut(), recorder.as_mut(), options)
        .with_observer(&mut progress)
        .run(&images, &ctx)?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if !args.dry_run {
        log::info!("run {} recorded in {}", summary.run_id, cfg.db_path);
    }
    Ok(summary.status)
}
