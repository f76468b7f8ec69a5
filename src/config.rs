use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

/// Top-level settings, loaded from a YAML file. Every section and field has
/// a default, so a missing file or an empty document still yields a working
/// configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub vision: VisionSettings,
    pub reasoning: ReasoningSettings,
    pub web: WebSettings,
    pub task: TaskSettings,
    pub credentials: CredentialSettings,
    pub logging: LoggingSettings,
    pub policies: PolicySettings,
}

impl Settings {
    /// Load settings from `path`, falling back to defaults when the file
    /// does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "settings file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).context("parsing settings YAML")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VisionSettings {
    pub model: String,
    pub endpoint: String,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            model: "qwen3-vl:4b".to_string(),
            endpoint: "http://localhost:11434/api/chat".to_string(),
            timeout_secs: 180,
            retry_attempts: 2,
            retry_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReasoningSettings {
    pub model: String,
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for ReasoningSettings {
    fn default() -> Self {
        Self {
            model: "deepseek-v3.1:671b-cloud".to_string(),
            endpoint: "http://localhost:11434/api/generate".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebSettings {
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Base directory for per-task artifacts (screenshots, logs, report).
    pub data_dir: String,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            headless: false,
            viewport_width: 1920,
            viewport_height: 1080,
            data_dir: "data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskSettings {
    pub max_steps: usize,
    /// Pause after a navigation or a non-navigating click, letting the page
    /// settle before the next capture.
    pub settle_delay_ms: u64,
    /// Pause after fill/wait actions.
    pub action_pause_ms: u64,
    /// Per-selector timeout for the post-click overlay probe.
    pub overlay_timeout_ms: u64,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            max_steps: 50,
            settle_delay_ms: 2000,
            action_pause_ms: 1000,
            overlay_timeout_ms: 5000,
        }
    }
}

/// Credential pair for auto-filling sign-in forms. YAML values win; the
/// `AGENT_EMAIL` / `AGENT_PASSWORD` environment variables (usually via
/// `.env`) fill the gaps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialSettings {
    pub email: Option<String>,
    pub password: Option<String>,
}

impl CredentialSettings {
    pub fn resolved(&self) -> Credentials {
        Credentials {
            email: self
                .email
                .clone()
                .or_else(|| std::env::var("AGENT_EMAIL").ok())
                .filter(|s| !s.is_empty()),
            password: self
                .password
                .clone()
                .or_else(|| std::env::var("AGENT_PASSWORD").ok())
                .filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub email: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.password.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Data-driven heuristic lists consumed by the step loop. Extend these in
/// the settings file rather than touching the state machine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicySettings {
    /// Third-party identity-provider hosts, matched by case-insensitive
    /// substring containment.
    pub oauth_hosts: Vec<String>,
    pub oauth_poll_attempts: u32,
    pub oauth_poll_interval_ms: u64,
    /// Field-label keywords that trigger email auto-fill.
    pub email_keywords: Vec<String>,
    /// Field-label keywords that trigger password auto-fill.
    pub password_keywords: Vec<String>,
    /// Selectors probed after a non-navigating click to spot a same-page
    /// overlay (modal, dropdown, expanded form).
    pub overlay_selectors: Vec<String>,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            oauth_hosts: vec![
                "accounts.google.com".to_string(),
                "github.com".to_string(),
                "oauth".to_string(),
                "login.microsoftonline.com".to_string(),
                "appleid.apple.com".to_string(),
            ],
            oauth_poll_attempts: 10,
            oauth_poll_interval_ms: 1000,
            email_keywords: vec![
                "email".to_string(),
                "e-mail".to_string(),
                "username".to_string(),
                "user name".to_string(),
            ],
            password_keywords: vec!["password".to_string()],
            overlay_selectors: vec![
                "[role=\"dialog\"]".to_string(),
                ".modal".to_string(),
                "[class*=\"modal\"]".to_string(),
                "[class*=\"dialog\"]".to_string(),
                "form".to_string(),
            ],
        }
    }
}

impl PolicySettings {
    pub fn oauth_poll_interval(&self) -> Duration {
        Duration::from_millis(self.oauth_poll_interval_ms)
    }
}

/// Derive a filesystem-safe storage slug from a task description.
pub fn task_slug(task: &str) -> String {
    task.to_lowercase()
        .replace(' ', "_")
        .replace(['\'', ','], "")
        .chars()
        .take(30)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_yields_defaults() {
        let s = Settings::from_yaml("").unwrap();
        assert_eq!(s.task.max_steps, 50);
        assert_eq!(s.vision.model, "qwen3-vl:4b");
        assert_eq!(s.policies.oauth_poll_attempts, 10);
        assert!(s.policies.oauth_hosts.contains(&"oauth".to_string()));
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let s = Settings::from_yaml(
            r#"
task:
  max_steps: 5
policies:
  oauth_poll_interval_ms: 10
"#,
        )
        .unwrap();
        assert_eq!(s.task.max_steps, 5);
        assert_eq!(s.task.settle_delay_ms, 2000);
        assert_eq!(s.policies.oauth_poll_interval_ms, 10);
        assert_eq!(s.policies.oauth_poll_attempts, 10);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(Settings::from_yaml("task:\n  max_step: 5\n").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let s = Settings::load_or_default(Path::new("/nonexistent/settings.yaml")).unwrap();
        assert_eq!(s.reasoning.timeout_secs, 60);
    }

    #[test]
    fn slug_strips_and_truncates() {
        assert_eq!(
            task_slug("Create a project in Linear"),
            "create_a_project_in_linear"
        );
        assert_eq!(task_slug("Don't panic, ok"), "dont_panic_ok");
        assert_eq!(task_slug("x".repeat(40).as_str()).len(), 30);
    }
}
