use detection_bench::{DetectionResult, RunObserver, RunRecord, RunSummary};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
    disable_pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool, disable_pretty: bool) -> Self {
        Self {
            mode,
            is_tty,
            disable_pretty,
        }
    }

    pub fn from_args(ui_flag: Option<&str>, is_tty: bool, disable_pretty: bool) -> Self {
        let mode = match ui_flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        };
        Self::new(mode, is_tty, disable_pretty)
    }

    fn pretty(&self) -> bool {
        self.is_tty
            && match self.mode {
                UiMode::Pretty => true,
                UiMode::Auto => !self.disable_pretty,
                UiMode::Plain => false,
            }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    // export_run has no per-image loop
    #[allow(dead_code)]
    pub fn run_progress(&self) -> RunProgress {
        RunProgress {
            pretty: self.pretty(),
            bar: None,
            uncertain: 0,
            failed: 0,
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let message = format!("✔ {} ({})", self.name, format_duration(elapsed));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

/// Per-image progress on stderr: a bar on a TTY, one line per image otherwise.
#[allow(dead_code)]
pub struct RunProgress {
    pretty: bool,
    bar: Option<ProgressBar>,
    uncertain: u64,
    failed: u64,
}

impl RunObserver for RunProgress {
    fn run_started(&mut self, run: &RunRecord) {
        if self.pretty {
            let bar = ProgressBar::new(run.planned_images);
            bar.set_draw_target(ProgressDrawTarget::stderr());
            let style = ProgressStyle::with_template(
                "{bar:32.cyan/blue} {pos}/{len} [{elapsed_precise}<{eta_precise}] {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            bar.set_message(run.backend.clone());
            self.bar = Some(bar);
        } else {
            eprintln!(
                "==> run {} ({}, {} images)",
                run.run_id, run.backend, run.planned_images
            );
        }
    }

    fn image_finished(&mut self, index: usize, planned: usize, result: &DetectionResult) {
        if !result.success {
            self.failed += 1;
        }
        if result.uncertain {
            self.uncertain += 1;
        }
        match &self.bar {
            Some(bar) => {
                bar.set_position(index as u64 + 1);
                bar.set_message(format!(
                    "{} uncertain, {} failed",
                    self.uncertain, self.failed
                ));
            }
            None => {
                let status = if result.success { "ok" } else { "FAILED" };
                eprintln!(
                    "[{}/{}] {}/{} {} persons={}",
                    index + 1,
                    planned,
                    result.classification,
                    result.image_filename,
                    status,
                    result.persons_detected
                );
            }
        }
    }

    fn run_finished(&mut self, summary: &RunSummary) {
        let message = format!(
            "✔ {} {}/{} images ({} failed, {} uncertain)",
            summary.status,
            summary.total_images,
            summary.planned_images,
            summary.failed_images,
            summary.uncertain_images
        );
        match self.bar.take() {
            Some(bar) => bar.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use detection_bench::{ImageFormat, ImageRecord};
    use std::path::PathBuf;

    #[test]
    fn pretty_only_on_a_tty() {
        assert!(Ui::from_args(Some("pretty"), true, true).pretty());
        assert!(!Ui::from_args(Some("pretty"), false, false).pretty());
        assert!(!Ui::from_args(Some("plain"), true, false).pretty());
        assert!(Ui::from_args(None, true, false).pretty());
        assert!(!Ui::from_args(Some("auto"), true, true).pretty());
    }

    #[test]
    fn plain_progress_counts_failures() {
        let image = ImageRecord {
            path: PathBuf::from("/corpus/people/a.jpg"),
            classification: "people".into(),
            format: ImageFormat::Jpeg,
        };
        let failed = DetectionResult::failure(
            "run-1",
            &image,
            &anyhow::anyhow!("decode failed"),
            Duration::from_millis(5),
            0,
        );
        let mut progress = Ui::from_args(Some("plain"), false, false).run_progress();
        progress.image_finished(0, 2, &failed);
        progress.image_finished(1, 2, &failed);
        assert_eq!(progress.failed, 2);
        assert_eq!(progress.uncertain, 0);
        assert!(progress.bar.is_none());
    }

    #[test]
    fn durations_switch_to_seconds_at_one_second() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }
}
