//! Run export: a JSON bundle, or a pair of flat CSV files (run info and
//! per-image results) for spreadsheet tooling.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::run::{DetectionResult, RunRecord};
use crate::RunError;

pub const RUN_CSV_HEADERS: [&str; 19] = [
    "run_id",
    "model_name",
    "model_version",
    "start_time",
    "end_time",
    "total_images",
    "successful_detections",
    "failed_detections",
    "avg_processing_time",
    "total_processing_time",
    "avg_cpu_usage",
    "max_cpu_usage",
    "avg_memory_usage",
    "max_memory_usage",
    "avg_gpu_usage",
    "max_gpu_usage",
    "status",
    "error_message",
    "config_json",
];

pub const RESULT_CSV_HEADERS: [&str; 15] = [
    "run_id",
    "image_path",
    "image_filename",
    "classification",
    "processing_time",
    "success",
    "persons_detected",
    "avg_confidence",
    "max_confidence",
    "min_confidence",
    "is_uncertain",
    "error_message",
    "confidence_scores",
    "model_output_json",
    "timestamp",
];

/// Self-describing JSON export of one run.
#[derive(Serialize)]
pub struct RunExport {
    pub format_version: u32,
    pub exported_at_ms: u64,
    pub run: RunRecord,
    pub results: Vec<DetectionResult>,
}

impl RunExport {
    pub fn new(run: RunRecord, results: Vec<DetectionResult>) -> Result<Self> {
        Ok(Self {
            format_version: 1,
            exported_at_ms: crate::now_ms()?,
            run,
            results,
        })
    }

    pub fn write_json<W: Write>(&self, mut out: W) -> Result<()> {
        serde_json::to_writer_pretty(&mut out, self)?;
        out.flush().map_err(persistence)?;
        Ok(())
    }
}

/// `<stem>_run.csv` and `<stem>_results.csv` next to `output`.
pub fn csv_paths(output: &Path) -> (PathBuf, PathBuf) {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "run_export".to_string());
    let dir = output.parent().unwrap_or_else(|| Path::new(""));
    (
        dir.join(format!("{}_run.csv", stem)),
        dir.join(format!("{}_results.csv", stem)),
    )
}

/// Header plus a single row describing the run.
pub fn write_run_csv<W: Write>(out: W, run: &RunRecord) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(RUN_CSV_HEADERS)?;
    let resources = run.resources.clone().unwrap_or_default();
    writer.write_record([
        run.run_id.clone(),
        run.backend.clone(),
        run.backend_version.clone(),
        run.start_time_ms.to_string(),
        opt(run.end_time_ms),
        run.total_images.to_string(),
        run.successful_images.to_string(),
        run.failed_images.to_string(),
        opt(run.timing.avg_s),
        run.timing.total_s.to_string(),
        opt(resources.avg_cpu),
        opt(resources.max_cpu),
        opt(resources.avg_memory),
        opt(resources.max_memory),
        opt(resources.avg_gpu),
        opt(resources.max_gpu),
        run.status.to_string(),
        run.error_message.clone().unwrap_or_default(),
        serde_json::to_string(&run.config)?,
    ])?;
    writer.flush().map_err(persistence)?;
    Ok(())
}

/// Header plus one row per result, in the order given.
pub fn write_results_csv<W: Write>(out: W, results: &[DetectionResult]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(RESULT_CSV_HEADERS)?;
    for result in results {
        let confidence = result.confidence;
        let model_output = match &result.raw_output {
            Some(raw) => serde_json::to_string(raw)?,
            None => String::new(),
        };
        writer.write_record([
            result.run_id.clone(),
            result.image_path.clone(),
            result.image_filename.clone(),
            result.classification.clone(),
            result.processing_time_s.to_string(),
            result.success.to_string(),
            result.persons_detected.to_string(),
            opt(confidence.map(|c| c.avg)),
            opt(confidence.map(|c| c.max)),
            opt(confidence.map(|c| c.min)),
            result.uncertain.to_string(),
            result.error_message.clone().unwrap_or_default(),
            serde_json::to_string(&result.confidences)?,
            model_output,
            result.timestamp_ms.to_string(),
        ])?;
    }
    writer.flush().map_err(persistence)?;
    Ok(())
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn persistence(e: std::io::Error) -> anyhow::Error {
    anyhow!(RunError::Persistence(format!("export write failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectionOutcome, RawOutput};
    use crate::run::{RunStatus, TimingStats};
    use crate::{ImageFormat, ImageRecord, ResourceSnapshot};
    use std::time::Duration;

    fn image(name: &str) -> ImageRecord {
        ImageRecord {
            path: PathBuf::from(format!("/corpus/people/{}", name)),
            classification: "people".into(),
            format: ImageFormat::Jpeg,
        }
    }

    fn run() -> RunRecord {
        RunRecord {
            run_id: "run-1".into(),
            run_name: Some("nightly".into()),
            job_id: None,
            backend: "stub".into(),
            backend_version: "1.0".into(),
            status: RunStatus::Completed,
            start_time_ms: 1000,
            end_time_ms: Some(4000),
            planned_images: 2,
            total_images: 2,
            successful_images: 1,
            failed_images: 1,
            timing: TimingStats {
                avg_s: Some(0.25),
                total_s: 3.0,
                min_s: Some(0.1),
                max_s: Some(0.4),
            },
            resources: Some(ResourceSnapshot {
                avg_cpu: Some(40.0),
                max_cpu: Some(80.0),
                avg_memory: Some(50.0),
                max_memory: Some(55.0),
                avg_gpu: None,
                max_gpu: None,
                samples: 6,
                skipped_samples: 0,
            }),
            config: serde_json::json!({"threshold": 0.5}),
            model_info: serde_json::Value::Null,
            error_message: None,
        }
    }

    fn read_rows(bytes: &[u8]) -> (Vec<String>, Vec<Vec<String>>) {
        let mut reader = csv::Reader::from_reader(bytes);
        let headers = reader
            .headers()
            .unwrap()
            .iter()
            .map(str::to_string)
            .collect();
        let rows = reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect();
        (headers, rows)
    }

    #[test]
    fn run_csv_has_fixed_headers_and_one_row() {
        let mut buf = Vec::new();
        write_run_csv(&mut buf, &run()).unwrap();
        let (headers, rows) = read_rows(&buf);
        assert_eq!(headers, RUN_CSV_HEADERS);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row[0], "run-1");
        assert_eq!(row[1], "stub");
        assert_eq!(row[7], "1");
        assert_eq!(row[10], "40");
        assert_eq!(row[14], "");
        assert_eq!(row[16], RunStatus::Completed.to_string());
        assert_eq!(row[18], r#"{"threshold":0.5}"#);
    }

    #[test]
    fn result_csv_quotes_messages_and_blanks_missing_confidence() {
        let outcome = DetectionOutcome::new(
            vec![0.9, 0.5],
            RawOutput::Stub {
                digest: "abc".into(),
            },
            Duration::ZERO,
        )
        .unwrap();
        let ok = DetectionResult::success(
            "run-1",
            &image("a.jpg"),
            outcome,
            0.5,
            Duration::from_millis(250),
            2000,
        );
        let failed = DetectionResult::failure(
            "run-1",
            &image("b.jpg"),
            &anyhow!("decode failed, \"truncated\" file"),
            Duration::from_millis(10),
            2100,
        );

        let mut buf = Vec::new();
        write_results_csv(&mut buf, &[ok, failed]).unwrap();
        let (headers, rows) = read_rows(&buf);
        assert_eq!(headers, RESULT_CSV_HEADERS);
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0][2], "a.jpg");
        assert_eq!(rows[0][5], "true");
        assert_eq!(rows[0][6], "2");
        assert_eq!(rows[0][8], "0.9");
        assert_eq!(rows[0][12], "[0.9,0.5]");
        assert!(rows[0][13].contains("abc"));

        assert_eq!(rows[1][5], "false");
        assert_eq!(rows[1][7], "");
        assert!(rows[1][11].contains("\"truncated\""));
        assert_eq!(rows[1][12], "[]");
        assert_eq!(rows[1][14], "2100");
    }

    #[test]
    fn csv_paths_sit_next_to_the_output() {
        let (run, results) = csv_paths(Path::new("/tmp/out/nightly.csv"));
        assert_eq!(run, PathBuf::from("/tmp/out/nightly_run.csv"));
        assert_eq!(results, PathBuf::from("/tmp/out/nightly_results.csv"));
    }

    #[test]
    fn json_bundle_carries_run_and_results() {
        let bundle = RunExport::new(run(), Vec::new()).unwrap();
        let mut buf = Vec::new();
        bundle.write_json(&mut buf).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["format_version"], 1);
        assert_eq!(value["run"]["run_id"], "run-1");
        assert_eq!(value["results"].as_array().unwrap().len(), 0);
    }
}
