use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::VisionSettings;
use crate::types::UiDescription;

const DESCRIBE_PROMPT: &str = "\
Analyze this web UI screenshot and describe it precisely in JSON format. Include:
- title: Page title or main heading
- buttons: List of all visible buttons with their text
- fields: List of all form fields (inputs, textareas) with labels/placeholders
- links: List of clickable links
- text_content: Main text content visible on the page
- layout: Description of the page layout
- interactive_elements: List of all interactive elements

Return ONLY valid JSON, no additional text.";

/// Turns a screenshot into a structured UI description.
///
/// Implementations never fail: transport and model errors degrade to a
/// well-formed description carrying an `error` marker, so the loop's control
/// flow stays uniform.
#[async_trait]
pub trait UiDescriber: Send + Sync {
    async fn describe(&self, screenshot: &Path) -> UiDescription;
}

/// Vision client for an Ollama-hosted multimodal model.
pub struct OllamaVision {
    client: reqwest::Client,
    model: String,
    endpoint: String,
    timeout: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl OllamaVision {
    pub fn new(settings: &VisionSettings) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(settings.timeout_secs);
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            model: settings.model.clone(),
            // Vision requests go through the chat API; accept a generate
            // endpoint in config and rewrite it.
            endpoint: settings.endpoint.replace("/api/generate", "/api/chat"),
            timeout,
            retry_attempts: settings.retry_attempts,
            retry_delay: Duration::from_secs(settings.retry_delay_secs),
        })
    }

    async fn request(&self, payload: &Value) -> Result<String, reqwest::Error> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        // Chat API puts the text under message.content; the generate API
        // uses a flat response field.
        let text = body["message"]["content"]
            .as_str()
            .or_else(|| body["response"].as_str())
            .unwrap_or_default()
            .to_string();
        Ok(text)
    }
}

#[async_trait]
impl UiDescriber for OllamaVision {
    async fn describe(&self, screenshot: &Path) -> UiDescription {
        let image = match std::fs::read(screenshot) {
            Ok(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes),
            Err(e) => {
                warn!(path = %screenshot.display(), error = %e, "screenshot unreadable");
                return UiDescription::degraded(
                    "Error",
                    format!("Could not read screenshot {}: {e}", screenshot.display()),
                    e.to_string(),
                );
            }
        };

        let payload = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": DESCRIBE_PROMPT,
                "images": [image],
            }],
            "stream": false,
        });

        let total = self.retry_attempts + 1;
        for attempt in 1..=total {
            info!(attempt, total, "vision model request");
            match self.request(&payload).await {
                Ok(text) => {
                    let description = parse_description(&text);
                    info!(title = %description.title, "ui description completed");
                    return description;
                }
                Err(e) if e.is_timeout() => {
                    warn!(attempt, total, error = %e, "vision model timeout");
                    if attempt < total {
                        tokio::time::sleep(self.retry_delay).await;
                        continue;
                    }
                    return UiDescription::degraded(
                        "Timeout Error",
                        format!(
                            "Vision model timeout after {}s (tried {total} times). \
                             Model may be too slow or image too large.",
                            self.timeout.as_secs()
                        ),
                        format!("Timeout: {e}"),
                    );
                }
                Err(e) => {
                    warn!(error = %e, "vision model request failed");
                    return UiDescription::degraded(
                        "Error",
                        format!("Error describing UI: {e}"),
                        e.to_string(),
                    );
                }
            }
        }
        unreachable!("retry loop always returns")
    }
}

/// Parse the model's response text into a description, tolerating prose
/// around the JSON object and element lists of either strings or objects.
fn parse_description(text: &str) -> UiDescription {
    let Some(value) = extract_json_object(text) else {
        // No JSON at all: keep the prose so the planner still sees
        // something, and the raw text for the metadata store.
        return UiDescription {
            text_content: text.trim().chars().take(500).collect(),
            raw: Some(json!({ "raw_response": text })),
            ..UiDescription::default()
        };
    };

    UiDescription {
        title: str_field(&value, "title"),
        buttons: string_list(&value["buttons"], &["text", "label", "name"]),
        fields: string_list(&value["fields"], &["label", "placeholder", "name"]),
        links: string_list(&value["links"], &["text", "label", "href"]),
        text_content: str_field(&value, "text_content"),
        layout: str_field(&value, "layout"),
        interactive_elements: string_list(&value["interactive_elements"], &["text", "label", "type"]),
        error: None,
        raw: Some(value),
    }
}

/// First `{...}` object embedded in `text`, if it parses.
fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

fn str_field(value: &Value, key: &str) -> String {
    value[key].as_str().unwrap_or_default().to_string()
}

/// Coerce a JSON array of strings or objects into a list of labels. For
/// objects, the first present key from `keys` wins.
fn string_list(value: &Value, keys: &[&str]) -> Vec<String> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => keys
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str).map(str::to_string)),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json_with_mixed_lists() {
        let text = r#"Here is the description:
```json
{"title": "Sign up", "buttons": ["Continue", {"text": "Sign in with Google"}],
 "fields": [{"label": "Email address"}, {"placeholder": "Password"}],
 "links": [], "text_content": "Welcome", "layout": "centered card"}
```"#;
        let d = parse_description(text);
        assert_eq!(d.title, "Sign up");
        assert_eq!(d.buttons, vec!["Continue", "Sign in with Google"]);
        assert_eq!(d.fields, vec!["Email address", "Password"]);
        assert_eq!(d.text_content, "Welcome");
        assert!(d.error.is_none());
        assert!(d.raw.is_some());
    }

    #[test]
    fn prose_without_json_degrades_to_text() {
        let d = parse_description("The page shows a login form.");
        assert_eq!(d.title, "");
        assert!(d.buttons.is_empty());
        assert_eq!(d.text_content, "The page shows a login form.");
    }

    #[test]
    fn degraded_description_is_well_formed() {
        let d = UiDescription::degraded("Timeout Error", "too slow".into(), "Timeout".into());
        assert_eq!(d.title, "Timeout Error");
        assert!(d.buttons.is_empty());
        assert!(d.fields.is_empty());
        assert_eq!(d.layout, "unknown");
        assert!(d.error.is_some());
    }

    #[tokio::test]
    async fn unreadable_screenshot_degrades() {
        let vision = OllamaVision::new(&crate::config::VisionSettings::default()).unwrap();
        let d = vision.describe(Path::new("/nonexistent/shot.png")).await;
        assert!(d.error.is_some());
        assert!(d.buttons.is_empty());
    }
}
