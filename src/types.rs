use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What the planner asked the agent to do with the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Click,
    Fill,
    Navigate,
    Wait,
    Done,
    Error,
    Unknown,
}

impl ActionKind {
    /// Lenient conversion from model output. Anything unrecognized is
    /// `Unknown`, which the dispatcher treats as a hard failure.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "click" => Self::Click,
            "fill" => Self::Fill,
            "navigate" => Self::Navigate,
            "wait" => Self::Wait,
            "done" => Self::Done,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Fill => "fill",
            Self::Navigate => "navigate",
            Self::Wait => "wait",
            Self::Done => "done",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// Execution status of a recorded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Success,
    Failure,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }
}

/// The planner's structured output for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDecision {
    pub action: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub confidence: f64,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionDecision {
    /// Synthetic decision the planner degrades to on transport or parse
    /// failure. The loop treats it as a hard stop.
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            action: ActionKind::Error,
            target: None,
            value: None,
            confidence: 0.0,
            done: false,
            reasoning: Some(message.clone()),
            error: Some(message),
        }
    }

    /// Seconds to sleep for a `wait` action. The planner may emit a bare
    /// number, a numeric string, or nothing at all.
    pub fn wait_secs(&self) -> f64 {
        self.value
            .as_deref()
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(1.0)
    }

    /// Compact "action: target" string used for planner context and the
    /// metadata store.
    pub fn summary(&self) -> String {
        format!(
            "{}: {}",
            self.action.as_str(),
            self.target.as_deref().unwrap_or("N/A")
        )
    }
}

impl Default for ActionDecision {
    fn default() -> Self {
        Self {
            action: ActionKind::Unknown,
            target: None,
            value: None,
            confidence: 0.5,
            done: false,
            reasoning: None,
            error: None,
        }
    }
}

/// Structured description of a screenshot, as returned by the vision model.
///
/// Always well-formed: transport and parse failures surface through `error`
/// with empty element lists, never as a thrown error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UiDescription {
    pub title: String,
    pub buttons: Vec<String>,
    pub fields: Vec<String>,
    pub links: Vec<String>,
    pub text_content: String,
    pub layout: String,
    pub interactive_elements: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Raw model payload, kept for the metadata store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl UiDescription {
    pub fn degraded(title: &str, detail: String, error: String) -> Self {
        Self {
            title: title.to_string(),
            text_content: detail,
            layout: "unknown".to_string(),
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Best-effort DOM metadata captured alongside each step. Diagnostic only:
/// the loop stores it but never branches on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomSnapshot {
    pub url: String,
    pub title: String,
    pub outline: String,
}

/// One step as held in the full metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    pub timestamp: String,
    pub url: String,
    pub screenshot: String,
    pub description: String,
    pub action_taken: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vision: Option<UiDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<ActionDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dom: Option<DomSnapshot>,
}

/// Short per-step context line handed back to the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub step: usize,
    pub action_taken: String,
}

/// Final output of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub task: String,
    pub completed: bool,
    pub steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_step: Option<StepRecord>,
}

/// Loop-carried screenshot state. A non-navigating click captures the next
/// step's screenshot early; the following iteration consumes it instead of
/// taking a redundant one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureState {
    NeedsCapture,
    CaptureReady(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_kind_parse_is_lenient() {
        assert_eq!(ActionKind::parse("Click"), ActionKind::Click);
        assert_eq!(ActionKind::parse(" FILL "), ActionKind::Fill);
        assert_eq!(ActionKind::parse("scroll"), ActionKind::Unknown);
        assert_eq!(ActionKind::parse(""), ActionKind::Unknown);
    }

    #[test]
    fn wait_secs_defaults_to_one() {
        let mut d = ActionDecision::default();
        assert_eq!(d.wait_secs(), 1.0);
        d.value = Some("2.5".to_string());
        assert_eq!(d.wait_secs(), 2.5);
        d.value = Some("not a number".to_string());
        assert_eq!(d.wait_secs(), 1.0);
        d.value = Some("-3".to_string());
        assert_eq!(d.wait_secs(), 1.0);
    }

    #[test]
    fn error_decision_is_terminal_shaped() {
        let d = ActionDecision::error("model unreachable");
        assert_eq!(d.action, ActionKind::Error);
        assert!(!d.done);
        assert_eq!(d.error.as_deref(), Some("model unreachable"));
    }

    #[test]
    fn statuses_serialize_lowercase() {
        let s = serde_json::to_string(&StepStatus::Pending).unwrap();
        assert_eq!(s, "\"pending\"");
        let a = serde_json::to_string(&ActionKind::Click).unwrap();
        assert_eq!(a, "\"click\"");
    }
}
