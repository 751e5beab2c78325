use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use crate::config::RunConfig;
use crate::detect::Detector;
use crate::monitor::{GpuProbe, NoGpu, NvidiaSmiProbe, ProcfsProbe, ResourceProbe, SystemMonitor};
use crate::run::{
    DetectionResult, RunFinalization, RunRecord, RunStatus, RunSummary, TimingAccumulator,
    TimingStats,
};
use crate::storage::RunRecorder;
use crate::{new_run_id, now_ms, ImageRecord, RunContext, RunError};

#[derive(Clone, Debug, PartialEq)]
pub struct ProcessorOptions {
    /// Average confidence strictly below this marks a result uncertain.
    pub threshold: f32,
    /// A detect call that takes longer than this is recorded as a backend failure.
    pub image_timeout: Option<Duration>,
    pub pause_between_images: Duration,
    pub monitor_interval: Duration,
    pub gpu: bool,
    /// Stored verbatim with the run.
    pub config_snapshot: serde_json::Value,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            image_timeout: None,
            pause_between_images: Duration::ZERO,
            monitor_interval: Duration::from_millis(500),
            gpu: false,
            config_snapshot: serde_json::Value::Null,
        }
    }
}

impl ProcessorOptions {
    pub fn from_config(cfg: &RunConfig) -> Result<Self> {
        Ok(Self {
            threshold: cfg.threshold,
            image_timeout: cfg.image_timeout,
            pause_between_images: cfg.pause_between_images,
            monitor_interval: cfg.monitor.interval,
            gpu: cfg.monitor.gpu,
            config_snapshot: cfg.snapshot()?,
        })
    }
}

/// Progress hooks for a running batch. All methods default to no-ops.
pub trait RunObserver {
    fn run_started(&mut self, _run: &RunRecord) {}

    /// `index` is zero-based; `planned` is the size of the sample.
    fn image_finished(&mut self, _index: usize, _planned: usize, _result: &DetectionResult) {}

    fn run_finished(&mut self, _summary: &RunSummary) {}
}

/// Drives one detector over a sample of images and records every outcome.
///
/// Per-image backend failures are recorded and the loop moves on. Any other
/// per-image error (a failed append, an unreadable clock) ends the run as
/// FAILED and the error is returned after finalization.
pub struct DetectionProcessor<'a> {
    detector: &'a mut dyn Detector,
    recorder: &'a mut dyn RunRecorder,
    options: ProcessorOptions,
    probe: Option<Box<dyn ResourceProbe>>,
    observer: Option<&'a mut dyn RunObserver>,
    clock: fn() -> Result<u64>,
}

impl<'a> DetectionProcessor<'a> {
    pub fn new(
        detector: &'a mut dyn Detector,
        recorder: &'a mut dyn RunRecorder,
        options: ProcessorOptions,
    ) -> Self {
        Self {
            detector,
            recorder,
            options,
            probe: None,
            observer: None,
            clock: now_ms,
        }
    }

    /// Probe used by the next run. Defaults to procfs (plus nvidia-smi when enabled).
    pub fn with_probe(mut self, probe: Box<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_observer(mut self, observer: &'a mut dyn RunObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Millisecond wall clock stamped on the run and its results.
    pub fn with_clock(mut self, clock: fn() -> Result<u64>) -> Self {
        self.clock = clock;
        self
    }

    pub fn run(&mut self, images: &[ImageRecord], ctx: &RunContext) -> Result<RunSummary> {
        if images.is_empty() {
            return Err(anyhow!(RunError::Input(
                "no images to process".to_string()
            )));
        }

        if let Err(e) = self.detector.warm_up() {
            log::warn!("{} warm-up failed: {:#}", self.detector.name(), e);
        }

        let status = RunStatus::Created.transition(RunStatus::Running)?;
        let mut record = RunRecord {
            run_id: new_run_id(),
            run_name: ctx.run_name.clone(),
            job_id: ctx.job_id.clone(),
            backend: self.detector.name().to_string(),
            backend_version: self.detector.version().to_string(),
            status,
            start_time_ms: (self.clock)()?,
            end_time_ms: None,
            planned_images: images.len() as u64,
            total_images: 0,
            successful_images: 0,
            failed_images: 0,
            timing: TimingStats::default(),
            resources: None,
            config: self.options.config_snapshot.clone(),
            model_info: self.detector.model_info(),
            error_message: None,
        };
        self.recorder.create_run(&record)?;
        log::info!(
            "run {} started: backend={} version={} images={}",
            record.run_id,
            record.backend,
            record.backend_version,
            images.len()
        );
        if let Some(observer) = self.observer.as_deref_mut() {
            observer.run_started(&record);
        }

        let mut monitor = self.start_monitor();
        let wall = Instant::now();
        let mut timing = TimingAccumulator::default();
        let mut uncertain_images = 0u64;
        let mut persons_detected = 0u64;
        let mut cancelled = false;
        let mut fatal: Option<anyhow::Error> = None;

        for (index, image) in images.iter().enumerate() {
            if ctx.cancellation.is_cancelled() {
                cancelled = true;
                break;
            }

            let result = match self.process_image(&record.run_id, image) {
                Ok(result) => result,
                Err(e) => {
                    log::error!(
                        "run {}: processing {} failed: {:#}",
                        record.run_id,
                        image.path.display(),
                        e
                    );
                    fatal = Some(e);
                    break;
                }
            };
            if let Err(e) = self.recorder.append_result(&result) {
                log::error!("run {}: recording result failed: {:#}", record.run_id, e);
                fatal = Some(e);
                break;
            }

            record.total_images += 1;
            if result.success {
                record.successful_images += 1;
                persons_detected += u64::from(result.persons_detected);
                if result.uncertain {
                    uncertain_images += 1;
                }
            } else {
                record.failed_images += 1;
            }
            timing.record(result.processing_time_s);

            if let Some(observer) = self.observer.as_deref_mut() {
                observer.image_finished(index, images.len(), &result);
            }

            let last = index + 1 == images.len();
            if !last && !self.options.pause_between_images.is_zero() {
                if ctx.cancellation.is_cancelled() {
                    cancelled = true;
                    break;
                }
                std::thread::sleep(self.options.pause_between_images);
            }
        }

        let final_status = if fatal.is_some() {
            RunStatus::Failed
        } else if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        record.status = record.status.transition(final_status)?;
        if cancelled {
            log::warn!(
                "run {} cancelled after {} of {} images",
                record.run_id,
                record.total_images,
                images.len()
            );
        }

        let resources = match monitor.as_mut() {
            Some(monitor) => {
                monitor.stop();
                monitor.snapshot()
            }
            None => Default::default(),
        };

        let fin = RunFinalization {
            run_id: record.run_id.clone(),
            status: record.status,
            end_time_ms: (self.clock)()?,
            total_images: record.total_images,
            successful_images: record.successful_images,
            failed_images: record.failed_images,
            timing: timing.finish(wall.elapsed().as_secs_f64()),
            resources,
            error_message: fatal.as_ref().map(|e| format!("{:#}", e)),
        };
        if let Err(e) = self.recorder.finalize_run(&fin) {
            log::error!("run {}: finalization failed: {:#}", record.run_id, e);
            return Err(fatal.unwrap_or(e));
        }
        record.apply(&fin);

        let summary = RunSummary {
            run_id: fin.run_id,
            run_name: record.run_name,
            backend: record.backend,
            status: fin.status,
            planned_images: record.planned_images,
            total_images: fin.total_images,
            successful_images: fin.successful_images,
            failed_images: fin.failed_images,
            uncertain_images,
            persons_detected,
            timing: fin.timing,
            resources: fin.resources,
            error_message: fin.error_message,
        };
        log::info!(
            "run {} {}: {} ok, {} failed, {} uncertain",
            summary.run_id,
            summary.status,
            summary.successful_images,
            summary.failed_images,
            summary.uncertain_images
        );
        if let Some(observer) = self.observer.as_deref_mut() {
            observer.run_finished(&summary);
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn process_image(&mut self, run_id: &str, image: &ImageRecord) -> Result<DetectionResult> {
        let start = Instant::now();
        let outcome = self.detector.detect(&image.path);
        let elapsed = start.elapsed();
        let outcome = match (outcome, self.options.image_timeout) {
            (Ok(_), Some(limit)) if elapsed > limit => Err(anyhow!(RunError::Backend(format!(
                "detection took {:.3}s, limit is {:.3}s",
                elapsed.as_secs_f64(),
                limit.as_secs_f64()
            )))),
            (outcome, _) => outcome,
        };
        let timestamp = (self.clock)()?;

        let result = match outcome {
            Ok(outcome) => DetectionResult::success(
                run_id,
                image,
                outcome,
                self.options.threshold,
                elapsed,
                timestamp,
            ),
            Err(e) => {
                log::warn!("{}: detection failed: {:#}", image.path.display(), e);
                DetectionResult::failure(run_id, image, &e, elapsed, timestamp)
            }
        };

        if result.success {
            log::info!(
                "{}/{}: persons={} avg={} uncertain={} ({:.3}s)",
                result.classification,
                result.image_filename,
                result.persons_detected,
                result
                    .confidence
                    .map(|c| format!("{:.3}", c.avg))
                    .unwrap_or_else(|| "-".to_string()),
                result.uncertain,
                result.processing_time_s
            );
        }
        Ok(result)
    }

    fn start_monitor(&mut self) -> Option<SystemMonitor> {
        let probe = match self.probe.take() {
            Some(probe) => probe,
            None => {
                let gpu: Box<dyn GpuProbe> = if self.options.gpu {
                    Box::new(NvidiaSmiProbe::new())
                } else {
                    Box::new(NoGpu)
                };
                Box::new(ProcfsProbe::new(gpu))
            }
        };
        match SystemMonitor::start(probe, self.options.monitor_interval) {
            Ok(monitor) => Some(monitor),
            Err(e) => {
                log::warn!("resource monitor unavailable: {:#}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ImageFormat;
    use crate::detect::{BackendKind, DetectionOutcome, RawOutput};
    use crate::monitor::ResourceSample;
    use crate::storage::InMemoryRunRecorder;
    use crate::CancellationToken;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    struct FixedProbe;

    impl ResourceProbe for FixedProbe {
        fn sample(&mut self) -> Result<ResourceSample> {
            Ok(ResourceSample {
                timestamp_ms: 0,
                cpu_percent: 25.0,
                memory_percent: 50.0,
                gpu_percent: None,
            })
        }
    }

    /// Answers by file name; unknown names are backend failures.
    struct ScriptedDetector {
        answers: HashMap<String, Vec<f32>>,
        cancel_after: Option<(usize, CancellationToken)>,
        calls: usize,
        delay: Duration,
    }

    impl ScriptedDetector {
        fn new(answers: &[(&str, Vec<f32>)]) -> Self {
            Self {
                answers: answers
                    .iter()
                    .map(|(name, conf)| (name.to_string(), conf.clone()))
                    .collect(),
                cancel_after: None,
                calls: 0,
                delay: Duration::ZERO,
            }
        }
    }

    impl Detector for ScriptedDetector {
        fn name(&self) -> &str {
            "scripted"
        }

        fn version(&self) -> &str {
            "1"
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Stub
        }

        fn detect(&mut self, image_path: &Path) -> Result<DetectionOutcome> {
            self.calls += 1;
            if let Some((n, token)) = &self.cancel_after {
                if self.calls == *n {
                    token.cancel();
                }
            }
            std::thread::sleep(self.delay);
            let name = image_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match self.answers.get(&name) {
                Some(confidences) => DetectionOutcome::new(
                    confidences.clone(),
                    RawOutput::Stub {
                        digest: name.clone(),
                    },
                    Duration::ZERO,
                ),
                None => Err(anyhow!(RunError::Backend(format!("no answer for {}", name)))),
            }
        }
    }

    fn images(names: &[&str]) -> Vec<ImageRecord> {
        names
            .iter()
            .map(|name| ImageRecord {
                path: PathBuf::from(format!("/corpus/people/{}", name)),
                classification: "people".into(),
                format: ImageFormat::Jpeg,
            })
            .collect()
    }

    fn options() -> ProcessorOptions {
        ProcessorOptions {
            monitor_interval: Duration::from_millis(5),
            ..ProcessorOptions::default()
        }
    }

    #[test]
    fn mixed_outcomes_finalize_completed() {
        let mut detector =
            ScriptedDetector::new(&[("a.jpg", vec![0.9, 0.4]), ("b.jpg", vec![])]);
        let mut recorder = InMemoryRunRecorder::new();
        let summary = DetectionProcessor::new(&mut detector, &mut recorder, options())
            .with_probe(Box::new(FixedProbe))
            .run(&images(&["a.jpg", "b.jpg", "c.jpg"]), &RunContext::default())
            .unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.successful_images, 2);
        assert_eq!(summary.failed_images, 1);
        assert_eq!(summary.total_images, 3);
        assert_eq!(summary.persons_detected, 2);
        assert_eq!(summary.uncertain_images, 0);
        assert!(summary.resources.samples >= 1);

        let results = recorder.results();
        assert_eq!(results.len(), 3);
        let a = results[0].confidence.unwrap();
        assert!((a.avg - 0.65).abs() < 1e-6);
        assert_eq!((a.max, a.min), (0.9, 0.4));
        assert!(!results[0].uncertain);
        assert_eq!(results[1].persons_detected, 0);
        assert!(results[1].confidence.is_none());
        assert!(!results[1].uncertain);
        assert!(!results[2].success);
        assert!(results[2].error_message.is_some());

        let run = recorder.run(&summary.run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.successful_images + run.failed_images, run.total_images);
        assert!(run.end_time_ms.is_some());
    }

    #[test]
    fn average_equal_to_threshold_is_confident() {
        let mut detector =
            ScriptedDetector::new(&[("eq.jpg", vec![0.5]), ("low.jpg", vec![0.3, 0.6])]);
        let mut recorder = InMemoryRunRecorder::new();
        let summary = DetectionProcessor::new(&mut detector, &mut recorder, options())
            .with_probe(Box::new(FixedProbe))
            .run(&images(&["eq.jpg", "low.jpg"]), &RunContext::default())
            .unwrap();
        assert!(!recorder.results()[0].uncertain);
        assert!(recorder.results()[1].uncertain);
        assert_eq!(summary.uncertain_images, 1);
    }

    #[test]
    fn cancellation_stops_between_images() {
        let ctx = RunContext::default();
        let mut detector = ScriptedDetector::new(&[
            ("1.jpg", vec![0.8]),
            ("2.jpg", vec![0.8]),
            ("3.jpg", vec![0.8]),
            ("4.jpg", vec![0.8]),
        ]);
        detector.cancel_after = Some((2, ctx.cancellation.clone()));
        let mut recorder = InMemoryRunRecorder::new();
        let summary = DetectionProcessor::new(&mut detector, &mut recorder, options())
            .with_probe(Box::new(FixedProbe))
            .run(&images(&["1.jpg", "2.jpg", "3.jpg", "4.jpg"]), &ctx)
            .unwrap();

        assert_eq!(summary.status, RunStatus::Cancelled);
        assert_eq!(summary.total_images, 2);
        assert_eq!(summary.planned_images, 4);
        assert_eq!(recorder.results().len(), 2);
        assert_eq!(detector.calls, 2);
    }

    #[test]
    fn append_failure_fails_the_run() {
        let mut detector = ScriptedDetector::new(&[("a.jpg", vec![0.9]), ("b.jpg", vec![0.9])]);
        let mut recorder = InMemoryRunRecorder::new().fail_append_after(1);
        let err = DetectionProcessor::new(&mut detector, &mut recorder, options())
            .with_probe(Box::new(FixedProbe))
            .run(&images(&["a.jpg", "b.jpg"]), &RunContext::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RunError>(),
            Some(RunError::Persistence(_))
        ));

        let run_id = recorder.results()[0].run_id.clone();
        let run = recorder.run(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.total_images, 1);
        assert!(run.error_message.is_some());
    }

    thread_local! {
        static CLOCK_CALLS: std::cell::Cell<usize> = std::cell::Cell::new(0);
    }

    /// Fails on the third reading: start time and first result succeed.
    fn clock_failing_on_second_image() -> Result<u64> {
        let call = CLOCK_CALLS.with(|c| {
            c.set(c.get() + 1);
            c.get()
        });
        if call == 3 {
            return Err(anyhow!("clock went backwards"));
        }
        Ok(1_700_000_000_000 + call as u64)
    }

    #[test]
    fn per_image_error_fails_the_run_instead_of_leaving_it_running() {
        CLOCK_CALLS.with(|c| c.set(0));
        let mut detector = ScriptedDetector::new(&[("a.jpg", vec![0.9]), ("b.jpg", vec![0.9])]);
        let mut recorder = InMemoryRunRecorder::new();
        let err = DetectionProcessor::new(&mut detector, &mut recorder, options())
            .with_probe(Box::new(FixedProbe))
            .with_clock(clock_failing_on_second_image)
            .run(&images(&["a.jpg", "b.jpg"]), &RunContext::default())
            .unwrap_err();
        assert!(format!("{:#}", err).contains("clock went backwards"));

        let run_id = recorder.results()[0].run_id.clone();
        let run = recorder.run(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.total_images, 1);
        assert!(run.end_time_ms.is_some());
        assert!(run
            .error_message
            .as_deref()
            .unwrap()
            .contains("clock went backwards"));
    }

    #[test]
    fn slow_detection_beyond_timeout_is_a_failure() {
        let mut detector = ScriptedDetector::new(&[("slow.jpg", vec![0.9])]);
        detector.delay = Duration::from_millis(30);
        let mut recorder = InMemoryRunRecorder::new();
        let opts = ProcessorOptions {
            image_timeout: Some(Duration::from_millis(1)),
            ..options()
        };
        let summary = DetectionProcessor::new(&mut detector, &mut recorder, opts)
            .with_probe(Box::new(FixedProbe))
            .run(&images(&["slow.jpg"]), &RunContext::default())
            .unwrap();
        assert_eq!(summary.failed_images, 1);
        assert!(recorder.results()[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("limit"));
    }

    #[test]
    fn empty_sample_is_an_input_error() {
        let mut detector = ScriptedDetector::new(&[]);
        let mut recorder = InMemoryRunRecorder::new();
        let err = DetectionProcessor::new(&mut detector, &mut recorder, options())
            .run(&[], &RunContext::default())
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<RunError>(), Some(RunError::Input(_))));
    }

    #[derive(Default)]
    struct Counting {
        started: usize,
        images: Vec<(usize, usize)>,
        finished: Option<RunStatus>,
    }

    impl RunObserver for Counting {
        fn run_started(&mut self, _run: &RunRecord) {
            self.started += 1;
        }

        fn image_finished(&mut self, index: usize, planned: usize, _result: &DetectionResult) {
            self.images.push((index, planned));
        }

        fn run_finished(&mut self, summary: &RunSummary) {
            self.finished = Some(summary.status);
        }
    }

    #[test]
    fn observer_sees_every_image() {
        let mut detector = ScriptedDetector::new(&[("a.jpg", vec![0.9]), ("b.jpg", vec![0.1])]);
        let mut recorder = InMemoryRunRecorder::new();
        let mut observer = Counting::default();
        DetectionProcessor::new(&mut detector, &mut recorder, options())
            .with_probe(Box::new(FixedProbe))
            .with_observer(&mut observer)
            .run(&images(&["a.jpg", "b.jpg"]), &RunContext::default())
            .unwrap();
        assert_eq!(observer.started, 1);
        assert_eq!(observer.images, vec![(0, 2), (1, 2)]);
        assert_eq!(observer.finished, Some(RunStatus::Completed));
    }
}
