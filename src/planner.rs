use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::ReasoningSettings;
use crate::types::{ActionDecision, ActionKind, StepSummary, UiDescription};

/// Chooses the next action from the task, the current UI description, and
/// recent step context.
///
/// Implementations never fail: transport and parse failures degrade to a
/// single synthetic `error` action, which the loop treats as a hard stop.
#[async_trait]
pub trait ActionPlanner: Send + Sync {
    async fn plan(
        &self,
        task: &str,
        ui: &UiDescription,
        recent: &[StepSummary],
    ) -> ActionDecision;
}

/// Planner client for an Ollama-hosted reasoning model.
pub struct OllamaPlanner {
    client: reqwest::Client,
    model: String,
    endpoint: String,
}

impl OllamaPlanner {
    pub fn new(settings: &ReasoningSettings) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(settings.timeout_secs))
                .build()?,
            model: settings.model.clone(),
            endpoint: settings.endpoint.clone(),
        })
    }
}

#[async_trait]
impl ActionPlanner for OllamaPlanner {
    async fn plan(
        &self,
        task: &str,
        ui: &UiDescription,
        recent: &[StepSummary],
    ) -> ActionDecision {
        info!("planning next action");
        let prompt = build_prompt(task, ui, recent);
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });

        let response = match self.client.post(&self.endpoint).json(&payload).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "reasoning model unreachable");
                return ActionDecision::error(format!("Error: {e}"));
            }
        };
        let body: Value = match response.error_for_status() {
            Ok(r) => match r.json().await {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "reasoning model returned invalid body");
                    return ActionDecision::error(format!("Error: {e}"));
                }
            },
            Err(e) => {
                warn!(error = %e, "reasoning model request failed");
                return ActionDecision::error(format!("Error: {e}"));
            }
        };

        let text = body["response"].as_str().unwrap_or_default();
        let decision = parse_decision(text);
        info!(
            action = decision.action.as_str(),
            target = decision.target.as_deref().unwrap_or("N/A"),
            done = decision.done,
            "action planned"
        );
        decision
    }
}

fn build_prompt(task: &str, ui: &UiDescription, recent: &[StepSummary]) -> String {
    let mut context = String::new();
    if !recent.is_empty() {
        context.push_str("\nPrevious steps:\n");
        for s in recent {
            context.push_str(&format!("- Step {}: {}\n", s.step, s.action_taken));
        }
    }

    let buttons = if ui.buttons.is_empty() {
        "None".to_string()
    } else {
        ui.buttons.join(", ")
    };
    let fields = if ui.fields.is_empty() {
        "None".to_string()
    } else {
        ui.fields.join(", ")
    };
    let content: String = ui.text_content.chars().take(200).collect();

    format!(
        r#"You are a web automation agent. Your task is: {task}

IMPORTANT RULES:
1. You can ONLY interact with elements that are currently visible on the page
2. You MUST click buttons/links FIRST to navigate before filling forms
3. You can ONLY fill fields that are currently visible in the "Fields" list below
4. If no fields are visible, you must click a button to navigate to the form first
5. Follow logical flow: navigate -> fill forms -> submit
6. AVOID clicking OAuth buttons like "Continue with Google", "Sign in with GitHub", etc. - these cause redirects and break automation. Prefer email/password signup instead.
7. The order of filling is important. You must fill the username field first, then the password field, then click the sign in button.

Current UI State:
- Title: {title}
- Available Buttons: {buttons}
- Available Fields: {fields}
- Main Content: {content}
{context}
Determine the next action to take. CRITICAL: Only use buttons/fields that are listed above as "Available".

Return your response as JSON with this structure:
{{
  "action": "click" | "fill" | "navigate" | "wait" | "done",
  "target": "element text that MUST be in Available Buttons/Fields list above",
  "value": "value to fill (if action is fill, and field must be in Available Fields)",
  "confidence": 0.0-1.0,
  "done": true/false,
  "reasoning": "brief explanation"
}}

If the task is complete, set "done" to true and "action" to "done".
Return ONLY valid JSON, no additional text."#,
        title = if ui.title.is_empty() { "Unknown" } else { &ui.title },
    )
}

/// Parse the model's reply into a decision. Accepts a JSON object embedded
/// in prose; falls back to keyword sniffing over the raw text, with
/// `unknown` as the final answer.
fn parse_decision(text: &str) -> ActionDecision {
    if let Some(value) = extract_json_object(text) {
        if value.get("action").is_some() || value.get("done").is_some() {
            return decision_from_value(value);
        }
    }

    // Keyword fallback over free text.
    let lower = text.to_lowercase();
    let mut decision = ActionDecision {
        reasoning: Some(text.trim().to_string()),
        ..ActionDecision::default()
    };
    if lower.contains("click") {
        decision.action = ActionKind::Click;
    } else if lower.contains("fill") || lower.contains("enter") || lower.contains("type") {
        decision.action = ActionKind::Fill;
    } else if lower.contains("navigate") || lower.contains("go to") {
        decision.action = ActionKind::Navigate;
    } else if lower.contains("done") || lower.contains("complete") || lower.contains("finished") {
        decision.done = true;
        decision.action = ActionKind::Done;
    }
    decision
}

fn decision_from_value(value: Value) -> ActionDecision {
    ActionDecision {
        action: value["action"]
            .as_str()
            .map(ActionKind::parse)
            .unwrap_or(ActionKind::Unknown),
        target: lenient_string(&value["target"]),
        value: lenient_string(&value["value"]),
        confidence: value["confidence"].as_f64().unwrap_or(0.5),
        done: value["done"].as_bool().unwrap_or(false),
        reasoning: lenient_string(&value["reasoning"]),
        error: lenient_string(&value["error"]),
    }
}

/// Strings stay strings; numbers are stringified (the model sometimes emits
/// `"value": 2` for waits); everything else is absent.
fn lenient_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_embedded_json() {
        let d = parse_decision(
            r#"Sure, here's the plan:
{"action": "click", "target": "Sign up", "confidence": 0.9, "done": false, "reasoning": "start signup"}"#,
        );
        assert_eq!(d.action, ActionKind::Click);
        assert_eq!(d.target.as_deref(), Some("Sign up"));
        assert_eq!(d.confidence, 0.9);
        assert!(!d.done);
    }

    #[test]
    fn numeric_value_is_stringified() {
        let d = parse_decision(r#"{"action": "wait", "value": 3, "done": false}"#);
        assert_eq!(d.action, ActionKind::Wait);
        assert_eq!(d.value.as_deref(), Some("3"));
        assert_eq!(d.wait_secs(), 3.0);
    }

    #[test]
    fn keyword_fallback_on_prose() {
        let d = parse_decision("I would click the blue button next.");
        assert_eq!(d.action, ActionKind::Click);
        assert!(d.reasoning.is_some());

        let d = parse_decision("The task is complete.");
        assert!(d.done);

        let d = parse_decision("hmm.");
        assert_eq!(d.action, ActionKind::Unknown);
        assert!(!d.done);
    }

    #[test]
    fn unrecognized_action_string_is_unknown() {
        let d = parse_decision(r#"{"action": "scroll", "target": "footer"}"#);
        assert_eq!(d.action, ActionKind::Unknown);
    }

    #[test]
    fn prompt_lists_available_elements_and_context() {
        let ui = UiDescription {
            title: "Login".to_string(),
            buttons: vec!["Sign in".to_string(), "Help".to_string()],
            fields: vec!["Email".to_string()],
            ..UiDescription::default()
        };
        let recent = vec![StepSummary {
            step: 2,
            action_taken: "click: Get started".to_string(),
        }];
        let prompt = build_prompt("Create a project", &ui, &recent);
        assert!(prompt.contains("Available Buttons: Sign in, Help"));
        assert!(prompt.contains("Available Fields: Email"));
        assert!(prompt.contains("- Step 2: click: Get started"));
        assert!(prompt.contains("Create a project"));
    }
}
