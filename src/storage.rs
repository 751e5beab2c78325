use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

use crate::detect::ConfidenceStats;
use crate::monitor::ResourceSnapshot;
use crate::run::{DetectionResult, RunFinalization, RunRecord, RunStatus, TimingStats};
use crate::RunError;

/// Persistence port for runs and their per-image results.
///
/// Write-side failures are surfaced as `RunError::Persistence`.
pub trait RunRecorder {
    fn create_run(&mut self, run: &RunRecord) -> Result<()>;

    fn append_result(&mut self, result: &DetectionResult) -> Result<()>;

    /// Writes the terminal state in one step. Partial finalization is never visible.
    fn finalize_run(&mut self, fin: &RunFinalization) -> Result<()>;

    fn load_run(&mut self, run_id: &str) -> Result<Option<RunRecord>>;

    fn load_results(&mut self, run_id: &str) -> Result<Vec<DetectionResult>>;
}

fn persistence(err: anyhow::Error) -> anyhow::Error {
    if err.downcast_ref::<RunError>().is_some() {
        return err;
    }
    anyhow!(RunError::Persistence(format!("{:#}", err)))
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("{} exceeds i64 range", what))
}

fn to_u64(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("corrupt row: negative {}", what))
}

pub struct SqliteRunRecorder {
    conn: Connection,
}

impl SqliteRunRecorder {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open run database {}", db_path))
            .map_err(persistence)?;
        let mut recorder = Self { conn };
        recorder.ensure_schema().map_err(persistence)?;
        Ok(recorder)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS runs (
              run_id TEXT PRIMARY KEY,
              run_name TEXT,
              job_id TEXT,
              backend TEXT NOT NULL,
              backend_version TEXT NOT NULL,
              status TEXT NOT NULL,
              start_time_ms INTEGER NOT NULL,
              end_time_ms INTEGER,
              planned_images INTEGER NOT NULL,
              total_images INTEGER NOT NULL DEFAULT 0,
              successful_images INTEGER NOT NULL DEFAULT 0,
              failed_images INTEGER NOT NULL DEFAULT 0,
              avg_processing_s REAL,
              total_processing_s REAL NOT NULL DEFAULT 0,
              min_processing_s REAL,
              max_processing_s REAL,
              resources_json TEXT,
              config_json TEXT NOT NULL,
              model_info_json TEXT NOT NULL,
              error_message TEXT
            );

            CREATE TABLE IF NOT EXISTS detection_results (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              run_id TEXT NOT NULL REFERENCES runs(run_id),
              image_path TEXT NOT NULL,
              image_filename TEXT NOT NULL,
              classification TEXT NOT NULL,
              raw_output_json TEXT,
              confidences_json TEXT NOT NULL,
              persons_detected INTEGER NOT NULL,
              confidence_avg REAL,
              confidence_max REAL,
              confidence_min REAL,
              uncertain INTEGER NOT NULL,
              processing_time_s REAL NOT NULL,
              success INTEGER NOT NULL,
              error_message TEXT,
              timestamp_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_results_run ON detection_results(run_id);
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            "#,
        )?;
        Ok(())
    }

    fn insert_run(&mut self, run: &RunRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO runs(run_id, run_name, job_id, backend, backend_version, status,
                             start_time_ms, planned_images, config_json, model_info_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                run.run_id,
                run.run_name,
                run.job_id,
                run.backend,
                run.backend_version,
                run.status.as_str(),
                to_i64(run.start_time_ms, "start_time_ms")?,
                to_i64(run.planned_images, "planned_images")?,
                serde_json::to_string(&run.config)?,
                serde_json::to_string(&run.model_info)?,
            ],
        )?;
        Ok(())
    }

    fn insert_result(&mut self, result: &DetectionResult) -> Result<()> {
        let raw_output = result
            .raw_output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn.execute(
            r#"
            INSERT INTO detection_results(run_id, image_path, image_filename, classification,
                                          raw_output_json, confidences_json, persons_detected,
                                          confidence_avg, confidence_max, confidence_min,
                                          uncertain, processing_time_s, success, error_message,
                                          timestamp_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                result.run_id,
                result.image_path,
                result.image_filename,
                result.classification,
                raw_output,
                serde_json::to_string(&result.confidences)?,
                result.persons_detected,
                result.confidence.map(|c| c.avg),
                result.confidence.map(|c| c.max),
                result.confidence.map(|c| c.min),
                result.uncertain,
                result.processing_time_s,
                result.success,
                result.error_message,
                to_i64(result.timestamp_ms, "timestamp_ms")?,
            ],
        )?;
        Ok(())
    }

    fn write_finalization(&mut self, fin: &RunFinalization) -> Result<()> {
        let tx = self.conn.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM runs WHERE run_id = ?1",
                params![fin.run_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or_else(|| anyhow!("unknown run {}", fin.run_id))?;
        RunStatus::parse(&current)?.transition(fin.status)?;

        tx.execute(
            r#"
            UPDATE runs SET status = ?2, end_time_ms = ?3, total_images = ?4,
                            successful_images = ?5, failed_images = ?6,
                            avg_processing_s = ?7, total_processing_s = ?8,
                            min_processing_s = ?9, max_processing_s = ?10,
                            resources_json = ?11, error_message = ?12
            WHERE run_id = ?1
            "#,
            params![
                fin.run_id,
                fin.status.as_str(),
                to_i64(fin.end_time_ms, "end_time_ms")?,
                to_i64(fin.total_images, "total_images")?,
                to_i64(fin.successful_images, "successful_images")?,
                to_i64(fin.failed_images, "failed_images")?,
                fin.timing.avg_s,
                fin.timing.total_s,
                fin.timing.min_s,
                fin.timing.max_s,
                serde_json::to_string(&fin.resources)?,
                fin.error_message,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn run_from_row(row: &Row<'_>) -> Result<RunRecord> {
    let status: String = row.get("status")?;
    let resources: Option<String> = row.get("resources_json")?;
    let config: String = row.get("config_json")?;
    let model_info: String = row.get("model_info_json")?;
    let end_time_ms: Option<i64> = row.get("end_time_ms")?;
    Ok(RunRecord {
        run_id: row.get("run_id")?,
        run_name: row.get("run_name")?,
        job_id: row.get("job_id")?,
        backend: row.get("backend")?,
        backend_version: row.get("backend_version")?,
        status: RunStatus::parse(&status)?,
        start_time_ms: to_u64(row.get("start_time_ms")?, "start_time_ms")?,
        end_time_ms: end_time_ms.map(|v| to_u64(v, "end_time_ms")).transpose()?,
        planned_images: to_u64(row.get("planned_images")?, "planned_images")?,
        total_images: to_u64(row.get("total_images")?, "total_images")?,
        successful_images: to_u64(row.get("successful_images")?, "successful_images")?,
        failed_images: to_u64(row.get("failed_images")?, "failed_images")?,
        timing: TimingStats {
            avg_s: row.get("avg_processing_s")?,
            total_s: row.get("total_processing_s")?,
            min_s: row.get("min_processing_s")?,
            max_s: row.get("max_processing_s")?,
        },
        resources: resources
            .map(|raw| serde_json::from_str::<ResourceSnapshot>(&raw))
            .transpose()?,
        config: serde_json::from_str(&config)?,
        model_info: serde_json::from_str(&model_info)?,
        error_message: row.get("error_message")?,
    })
}

fn result_from_row(row: &Row<'_>) -> Result<DetectionResult> {
    let raw_output: Option<String> = row.get("raw_output_json")?;
    let confidences: String = row.get("confidences_json")?;
    let avg: Option<f32> = row.get("confidence_avg")?;
    let max: Option<f32> = row.get("confidence_max")?;
    let min: Option<f32> = row.get("confidence_min")?;
    let confidence = match (avg, max, min) {
        (Some(avg), Some(max), Some(min)) => Some(ConfidenceStats { avg, max, min }),
        _ => None,
    };
    Ok(DetectionResult {
        run_id: row.get("run_id")?,
        image_path: row.get("image_path")?,
        image_filename: row.get("image_filename")?,
        classification: row.get("classification")?,
        raw_output: raw_output
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        confidences: serde_json::from_str(&confidences)?,
        persons_detected: row.get("persons_detected")?,
        confidence,
        uncertain: row.get("uncertain")?,
        processing_time_s: row.get("processing_time_s")?,
        success: row.get("success")?,
        error_message: row.get("error_message")?,
        timestamp_ms: to_u64(row.get("timestamp_ms")?, "timestamp_ms")?,
    })
}

impl RunRecorder for SqliteRunRecorder {
    fn create_run(&mut self, run: &RunRecord) -> Result<()> {
        self.insert_run(run).map_err(persistence)
    }

    fn append_result(&mut self, result: &DetectionResult) -> Result<()> {
        self.insert_result(result).map_err(persistence)
    }

    fn finalize_run(&mut self, fin: &RunFinalization) -> Result<()> {
        self.write_finalization(fin).map_err(persistence)
    }

    fn load_run(&mut self, run_id: &str) -> Result<Option<RunRecord>> {
        let mut stmt = self.conn.prepare("SELECT * FROM runs WHERE run_id = ?1")?;
        let mut rows = stmt.query(params![run_id])?;
        let run = match rows.next()? {
            Some(row) => Some(run_from_row(row)?),
            None => None,
        };
        Ok(run)
    }

    fn load_results(&mut self, run_id: &str) -> Result<Vec<DetectionResult>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM detection_results WHERE run_id = ?1 ORDER BY id ASC")?;
        let mut rows = stmt.query(params![run_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(result_from_row(row)?);
        }
        Ok(out)
    }
}

/// Recorder for dry runs and tests. Failures can be injected on the write side.
#[derive(Clone, Debug, Default)]
pub struct InMemoryRunRecorder {
    runs: HashMap<String, RunRecord>,
    results: Vec<DetectionResult>,
    fail_append_after: Option<usize>,
    fail_finalize: bool,
}

impl InMemoryRunRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `n` appends, then fail every later one.
    pub fn fail_append_after(mut self, n: usize) -> Self {
        self.fail_append_after = Some(n);
        self
    }

    pub fn fail_finalize(mut self) -> Self {
        self.fail_finalize = true;
        self
    }

    pub fn results(&self) -> &[DetectionResult] {
        &self.results
    }

    pub fn run(&self, run_id: &str) -> Option<&RunRecord> {
        self.runs.get(run_id)
    }
}

impl RunRecorder for InMemoryRunRecorder {
    fn create_run(&mut self, run: &RunRecord) -> Result<()> {
        if self.runs.contains_key(&run.run_id) {
            return Err(anyhow!(RunError::Persistence(format!(
                "run {} already exists",
                run.run_id
            ))));
        }
        self.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    fn append_result(&mut self, result: &DetectionResult) -> Result<()> {
        if let Some(limit) = self.fail_append_after {
            if self.results.len() >= limit {
                return Err(anyhow!(RunError::Persistence(
                    "injected append failure".to_string()
                )));
            }
        }
        if !self.runs.contains_key(&result.run_id) {
            return Err(anyhow!(RunError::Persistence(format!(
                "unknown run {}",
                result.run_id
            ))));
        }
        self.results.push(result.clone());
        Ok(())
    }

    fn finalize_run(&mut self, fin: &RunFinalization) -> Result<()> {
        if self.fail_finalize {
            return Err(anyhow!(RunError::Persistence(
                "injected finalize failure".to_string()
            )));
        }
        let run = self.runs.get_mut(&fin.run_id).ok_or_else(|| {
            anyhow!(RunError::Persistence(format!("unknown run {}", fin.run_id)))
        })?;
        run.status.transition(fin.status).map_err(persistence)?;
        run.apply(fin);
        Ok(())
    }

    fn load_run(&mut self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.runs.get(run_id).cloned())
    }

    fn load_results(&mut self, run_id: &str) -> Result<Vec<DetectionResult>> {
        Ok(self
            .results
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }
}
