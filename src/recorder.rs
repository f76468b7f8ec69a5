use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::warn;

use crate::types::{StepRecord, StepStatus, StepSummary};

/// Writes lightweight per-step logs and a final summary for a task run.
///
/// Outputs under `<data_dir>/<task_name>/`:
///   - `steps.jsonl`: one compact JSON line per recorded event, append-only.
///     An executed step appears twice (pending, then success/failure);
///     consumers dedup by step index keeping the last entry.
///   - `summary.json`: concise run summary.
pub struct RunRecorder {
    task_name: String,
    steps_path: PathBuf,
    summary_path: PathBuf,
    started_at: String,
    num_steps: usize,
    last_entry: Option<Value>,
}

impl RunRecorder {
    pub fn new(task_name: &str, base_dir: &Path) -> Result<Self> {
        let run_dir = base_dir.join(task_name);
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("creating run directory {}", run_dir.display()))?;
        Ok(Self {
            task_name: task_name.to_string(),
            steps_path: run_dir.join("steps.jsonl"),
            summary_path: run_dir.join("summary.json"),
            started_at: Utc::now().to_rfc3339(),
            num_steps: 0,
            last_entry: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_step(
        &mut self,
        step: usize,
        url: &str,
        image_path: &str,
        action: &str,
        target: Option<&str>,
        buttons: &[String],
        status: StepStatus,
        reasoning: Option<&str>,
    ) -> Result<()> {
        let mut entry = json!({
            "step": step,
            "timestamp": Utc::now().to_rfc3339(),
            "url": url,
            "image": image_path,
            "action": action,
            "target": target,
            "buttons": buttons,
            "status": status.as_str(),
        });
        if let Some(reasoning) = reasoning {
            entry["reasoning"] = json!(reasoning);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.steps_path)
            .with_context(|| format!("opening {}", self.steps_path.display()))?;
        writeln!(file, "{entry}").context("appending step entry")?;

        self.num_steps = self.num_steps.max(step + 1);
        self.last_entry = Some(entry);
        Ok(())
    }

    pub fn write_summary(&self, completed: bool, error: Option<&str>) -> Result<()> {
        let summary = json!({
            "task_name": self.task_name,
            "started_at": self.started_at,
            "finished_at": Utc::now().to_rfc3339(),
            "completed": completed,
            "total_steps": self.num_steps,
            "error": error,
            "last_entry": self.last_entry,
        });
        let file = File::create(&self.summary_path)
            .with_context(|| format!("creating {}", self.summary_path.display()))?;
        serde_json::to_writer_pretty(file, &summary).context("writing summary")?;
        Ok(())
    }
}

/// Full step-metadata store, keyed by step index and overwritable per index:
/// re-saving a step replaces its record in place, so a decision recorded as
/// pending can be corrected to success/failure, and a synthetic post-click
/// record can be superseded by the next real classification of that index.
pub struct StateStore {
    task_name: String,
    metadata_path: PathBuf,
    steps: Vec<StepRecord>,
}

impl StateStore {
    pub fn open(task_name: &str, base_dir: &Path) -> Result<Self> {
        let dir = base_dir.join(task_name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating task directory {}", dir.display()))?;
        let metadata_path = dir.join("metadata.json");

        let steps = if metadata_path.exists() {
            match load_steps(&metadata_path) {
                Ok(steps) => steps,
                Err(e) => {
                    warn!(error = %e, "could not load existing metadata, starting fresh");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Ok(Self {
            task_name: task_name.to_string(),
            metadata_path,
            steps,
        })
    }

    /// Insert or replace the record at its step index, then persist.
    pub fn save_step(&mut self, record: StepRecord) -> Result<()> {
        let index = record.step;
        if index < self.steps.len() {
            self.steps[index] = record;
        } else {
            self.steps.push(record);
        }
        self.persist()
    }

    /// Rewrite the stored status of an existing step.
    pub fn mark_status(&mut self, step: usize, status: StepStatus) -> Result<()> {
        if let Some(record) = self.steps.get_mut(step) {
            record.status = status;
            return self.persist();
        }
        Ok(())
    }

    pub fn last_step(&self) -> Option<&StepRecord> {
        self.steps.last()
    }

    pub fn step(&self, index: usize) -> Option<&StepRecord> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The most recent `n` step summaries, oldest first.
    pub fn recent_summaries(&self, n: usize) -> Vec<StepSummary> {
        let skip = self.steps.len().saturating_sub(n);
        self.steps[skip..]
            .iter()
            .map(|r| StepSummary {
                step: r.step,
                action_taken: r.action_taken.clone(),
            })
            .collect()
    }

    fn persist(&self) -> Result<()> {
        let created_at = self
            .steps
            .first()
            .map(|r| r.timestamp.clone())
            .unwrap_or_else(|| Utc::now().to_rfc3339());
        let metadata = json!({
            "task_name": self.task_name,
            "created_at": created_at,
            "updated_at": Utc::now().to_rfc3339(),
            "total_steps": self.steps.len(),
            "steps": self.steps,
        });
        let file = File::create(&self.metadata_path)
            .with_context(|| format!("creating {}", self.metadata_path.display()))?;
        serde_json::to_writer_pretty(file, &metadata).context("writing metadata")?;
        Ok(())
    }
}

fn load_steps(path: &Path) -> Result<Vec<StepRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let data: Value = serde_json::from_reader(reader)?;
    Ok(serde_json::from_value(data["steps"].clone()).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(step: usize, action: &str, status: StepStatus) -> StepRecord {
        StepRecord {
            step,
            timestamp: Utc::now().to_rfc3339(),
            url: "https://example.com".to_string(),
            screenshot: format!("step_{step:02}.png"),
            description: "a page".to_string(),
            action_taken: action.to_string(),
            status,
            vision: None,
            decision: None,
            dom: None,
        }
    }

    #[test]
    fn recorder_appends_one_line_per_event() {
        let dir = TempDir::new().unwrap();
        let mut rec = RunRecorder::new("demo", dir.path()).unwrap();
        rec.record_step(
            0,
            "https://example.com",
            "step_00.png",
            "click",
            Some("Next"),
            &["Next".to_string()],
            StepStatus::Pending,
            Some("advance"),
        )
        .unwrap();
        rec.record_step(
            0,
            "https://example.com",
            "step_00.png",
            "click",
            Some("Next"),
            &[],
            StepStatus::Success,
            None,
        )
        .unwrap();

        let content = std::fs::read_to_string(dir.path().join("demo/steps.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["status"], "pending");
        assert_eq!(first["reasoning"], "advance");
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["status"], "success");
    }

    #[test]
    fn summary_reflects_last_entry() {
        let dir = TempDir::new().unwrap();
        let mut rec = RunRecorder::new("demo", dir.path()).unwrap();
        rec.record_step(
            0,
            "u",
            "i.png",
            "done",
            None,
            &[],
            StepStatus::Pending,
            None,
        )
        .unwrap();
        rec.write_summary(true, None).unwrap();

        let summary: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("demo/summary.json")).unwrap())
                .unwrap();
        assert_eq!(summary["completed"], true);
        assert_eq!(summary["total_steps"], 1);
        assert_eq!(summary["last_entry"]["action"], "done");
        assert!(summary["error"].is_null());
    }

    #[test]
    fn store_is_idempotent_by_index() {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::open("demo", dir.path()).unwrap();
        store.save_step(record(0, "click: Next", StepStatus::Pending)).unwrap();
        store.save_step(record(1, "ui_updated", StepStatus::Success)).unwrap();
        // The next classification of index 1 replaces the synthetic record.
        store.save_step(record(1, "fill: Email", StepStatus::Pending)).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.step(1).unwrap().action_taken, "fill: Email");
    }

    #[test]
    fn store_reloads_persisted_steps() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = StateStore::open("demo", dir.path()).unwrap();
            store.save_step(record(0, "click: Go", StepStatus::Success)).unwrap();
        }
        let store = StateStore::open("demo", dir.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.step(0).unwrap().action_taken, "click: Go");
    }

    #[test]
    fn recent_summaries_keep_order_and_window() {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::open("demo", dir.path()).unwrap();
        for i in 0..5 {
            store
                .save_step(record(i, &format!("click: b{i}"), StepStatus::Success))
                .unwrap();
        }
        let recent = store.recent_summaries(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].step, 2);
        assert_eq!(recent[2].action_taken, "click: b4");
    }

    #[test]
    fn mark_status_rewrites_in_place() {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::open("demo", dir.path()).unwrap();
        store.save_step(record(0, "click: Next", StepStatus::Pending)).unwrap();
        store.mark_status(0, StepStatus::Failure).unwrap();
        assert_eq!(store.step(0).unwrap().status, StepStatus::Failure);
    }
}
