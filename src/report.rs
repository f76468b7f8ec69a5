use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use serde_json::Value;
use tracing::debug;

/// Render a self-contained HTML report for a recorded run, with each step's
/// screenshot embedded as a data URI.
///
/// Reads `steps.jsonl` and `summary.json` from `run_dir` and writes
/// `report.html` next to them. Steps appearing more than once (pending, then
/// success/failure) keep their last recorded entry.
pub fn generate(run_dir: &Path) -> Result<PathBuf> {
    let steps = read_steps(&run_dir.join("steps.jsonl"));
    let summary = read_summary(&run_dir.join("summary.json"));
    let report_path = run_dir.join("report.html");

    let task_name = summary["task_name"].as_str().unwrap_or("unknown task");
    let completed = summary["completed"].as_bool().unwrap_or(false);
    let total_steps = summary["total_steps"].as_u64().unwrap_or(steps.len() as u64);
    let error = summary["error"].as_str();

    let mut body = String::new();
    body.push_str(&format!(
        "<header><h1>Run report: {}</h1>\
         <p class=\"meta\">{} &middot; {} steps{}</p></header>\n",
        escape(task_name),
        if completed {
            "<span class=\"ok\">completed</span>"
        } else {
            "<span class=\"fail\">not completed</span>"
        },
        total_steps,
        error
            .map(|e| format!(" &middot; error: {}", escape(e)))
            .unwrap_or_default(),
    ));

    for entry in steps.values() {
        body.push_str(&render_step(run_dir, entry));
    }

    let html = format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n\
         <title>Run report: {}</title>\n<style>{STYLE}</style>\n</head>\n\
         <body>\n{}\n</body>\n</html>\n",
        escape(task_name),
        body
    );

    std::fs::write(&report_path, html)
        .with_context(|| format!("writing {}", report_path.display()))?;
    Ok(report_path)
}

fn render_step(run_dir: &Path, entry: &Value) -> String {
    let step = entry["step"].as_u64().unwrap_or(0);
    let action = entry["action"].as_str().unwrap_or("?");
    let target = entry["target"].as_str();
    let status = entry["status"].as_str().unwrap_or("unknown");
    let url = entry["url"].as_str().unwrap_or("");
    let reasoning = entry["reasoning"].as_str();

    let mut card = format!(
        "<section class=\"step\">\n<h2>Step {step} \
         <span class=\"status {status}\">{status}</span></h2>\n\
         <p><code>{}</code>{}</p>\n<p class=\"url\">{}</p>\n",
        escape(action),
        target
            .map(|t| format!(" &rarr; {}", escape(t)))
            .unwrap_or_default(),
        escape(url),
    );
    if let Some(reasoning) = reasoning {
        card.push_str(&format!("<p class=\"why\">{}</p>\n", escape(reasoning)));
    }
    if let Some(image) = entry["image"].as_str() {
        if let Some(data) = inline_image(run_dir, image) {
            card.push_str(&format!(
                "<img alt=\"step {step} screenshot\" src=\"data:image/png;base64,{data}\">\n"
            ));
        }
    }
    card.push_str("</section>\n");
    card
}

/// Base64 payload for a screenshot, tried both as recorded and relative to
/// the run directory. Missing images just leave a card without one.
fn inline_image(run_dir: &Path, recorded: &str) -> Option<String> {
    let candidates = [PathBuf::from(recorded), run_dir.join(recorded)];
    for path in &candidates {
        if let Ok(bytes) = std::fs::read(path) {
            return Some(base64::engine::general_purpose::STANDARD.encode(bytes));
        }
    }
    debug!(image = recorded, "screenshot missing, skipping embed");
    None
}

/// Last recorded entry per step index, ordered by index.
fn read_steps(steps_path: &Path) -> BTreeMap<u64, Value> {
    let mut last_by_step = BTreeMap::new();
    let Ok(content) = std::fs::read_to_string(steps_path) else {
        return last_by_step;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<Value>(line) {
            let step = entry["step"].as_u64().unwrap_or(0);
            last_by_step.insert(step, entry);
        }
    }
    last_by_step
}

fn read_summary(summary_path: &Path) -> Value {
    std::fs::read_to_string(summary_path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null)
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

const STYLE: &str = "\
body { background: #0a0a0f; color: #e0e0e0; font-family: system-ui, sans-serif; \
margin: 0 auto; max-width: 800px; padding: 24px 32px; }\n\
header h1 { font-size: 20px; color: #fff; }\n\
.meta { color: #888; }\n\
.ok { color: #22c55e; }\n\
.fail { color: #ef4444; }\n\
.step { background: #111118; border-left: 3px solid #3b82f6; border-radius: 8px; \
margin: 16px 0; padding: 10px 14px; }\n\
.step h2 { font-size: 15px; }\n\
.status { border-radius: 6px; font-size: 12px; padding: 2px 8px; }\n\
.status.success { background: #0a1a0a; color: #86efac; }\n\
.status.failure { background: #1a0a0a; color: #fca5a5; }\n\
.status.pending, .status.skipped { background: #1a1a2e; color: #fcd34d; }\n\
.url { color: #6366f1; font-size: 12px; word-break: break-all; }\n\
.why { color: #aaa; font-size: 13px; }\n\
img { border: 1px solid #222; border-radius: 8px; margin-top: 8px; max-width: 100%; }\n";

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn deduplicates_by_step_keeping_last_status() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("steps.jsonl"),
            concat!(
                "{\"step\":0,\"action\":\"click\",\"target\":\"Next\",\"status\":\"pending\",\"url\":\"u\",\"image\":\"step_00.png\"}\n",
                "{\"step\":0,\"action\":\"click\",\"target\":\"Next\",\"status\":\"success\",\"url\":\"u\",\"image\":\"step_00.png\"}\n",
            ),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("summary.json"),
            r#"{"task_name":"demo","completed":true,"total_steps":1,"error":null}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("step_00.png"), b"fakepng").unwrap();

        let path = generate(dir.path()).unwrap();
        let html = std::fs::read_to_string(path).unwrap();
        assert_eq!(html.matches("<section class=\"step\">").count(), 1);
        assert!(html.contains("status success"));
        assert!(!html.contains("status pending"));
        assert!(html.contains("data:image/png;base64,"));
        assert!(html.contains("Run report: demo"));
    }

    #[test]
    fn renders_without_artifacts() {
        let dir = TempDir::new().unwrap();
        let path = generate(dir.path()).unwrap();
        let html = std::fs::read_to_string(path).unwrap();
        assert!(html.contains("unknown task"));
        assert!(html.contains("not completed"));
    }

    #[test]
    fn escapes_markup_in_fields() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("steps.jsonl"),
            "{\"step\":0,\"action\":\"click\",\"target\":\"<script>\",\"status\":\"success\",\"url\":\"u\"}\n",
        )
        .unwrap();
        let path = generate(dir.path()).unwrap();
        let html = std::fs::read_to_string(path).unwrap();
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }
}
