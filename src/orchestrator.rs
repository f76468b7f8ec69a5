use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::browser::BrowserControl;
use crate::config::{Credentials, Settings};
use crate::oauth;
use crate::planner::ActionPlanner;
use crate::recorder::{RunRecorder, StateStore};
use crate::types::{
    ActionDecision, ActionKind, CaptureState, RunResult, StepRecord, StepStatus, UiDescription,
};
use crate::vision::UiDescriber;

/// Everything the step loop needs to make policy decisions, detached from
/// the settings file so tests can tune delays and lists directly.
#[derive(Debug, Clone)]
pub struct LoopPolicy {
    pub max_steps: usize,
    /// Pause after a navigation or a non-navigating click.
    pub settle_delay: Duration,
    /// Pause after fill/wait actions.
    pub action_pause: Duration,
    pub overlay_timeout: Duration,
    pub overlay_selectors: Vec<String>,
    pub oauth_hosts: Vec<String>,
    pub oauth_poll_attempts: u32,
    pub oauth_poll_interval: Duration,
    pub email_keywords: Vec<String>,
    pub password_keywords: Vec<String>,
    pub credentials: Credentials,
}

impl LoopPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_steps: settings.task.max_steps,
            settle_delay: Duration::from_millis(settings.task.settle_delay_ms),
            action_pause: Duration::from_millis(settings.task.action_pause_ms),
            overlay_timeout: Duration::from_millis(settings.task.overlay_timeout_ms),
            overlay_selectors: settings.policies.overlay_selectors.clone(),
            oauth_hosts: settings.policies.oauth_hosts.clone(),
            oauth_poll_attempts: settings.policies.oauth_poll_attempts,
            oauth_poll_interval: settings.policies.oauth_poll_interval(),
            email_keywords: settings.policies.email_keywords.clone(),
            password_keywords: settings.policies.password_keywords.clone(),
            credentials: settings.credentials.resolved(),
        }
    }
}

/// Which credential bucket a fill target fell into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialField {
    Email,
    Password,
}

/// Loop-carried state for one run.
struct LoopState {
    step: usize,
    done: bool,
    error: Option<String>,
    capture: CaptureState,
    origin_host: Option<String>,
}

impl LoopState {
    fn new() -> Self {
        Self {
            step: 0,
            done: false,
            error: None,
            capture: CaptureState::NeedsCapture,
            origin_host: None,
        }
    }
}

/// The step-loop controller: sequences capture, the OAuth guard, the
/// describer and planner calls, action dispatch, and per-step recording.
/// Strictly sequential; one run per browser session at a time.
pub struct Orchestrator {
    run_dir: PathBuf,
    browser: Arc<dyn BrowserControl>,
    describer: Arc<dyn UiDescriber>,
    planner: Arc<dyn ActionPlanner>,
    recorder: RunRecorder,
    store: StateStore,
    policy: LoopPolicy,
}

impl Orchestrator {
    pub fn new(
        task_name: &str,
        browser: Arc<dyn BrowserControl>,
        describer: Arc<dyn UiDescriber>,
        planner: Arc<dyn ActionPlanner>,
        policy: LoopPolicy,
        data_dir: &Path,
    ) -> Result<Self> {
        Ok(Self {
            run_dir: data_dir.join(task_name),
            browser,
            describer,
            planner,
            recorder: RunRecorder::new(task_name, data_dir)?,
            store: StateStore::open(task_name, data_dir)?,
            policy,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Run the task to completion, error, or step-budget exhaustion. Always
    /// returns a result with a definite `completed` flag; every halt other
    /// than success carries an error description.
    pub async fn run_task(&mut self, task: &str, initial_url: Option<&str>) -> RunResult {
        info!(task, "starting task");
        let mut st = LoopState::new();
        let outcome = self.drive(task, initial_url, &mut st).await;

        let steps = match &outcome {
            Ok(()) => st.step,
            // The in-flight step counts, like every other terminal path.
            Err(_) => st.step + 1,
        };
        if let Err(e) = outcome {
            let message = format!("{e:#}");
            error!(error = %message, "fatal error in step loop");
            st.error = Some(message);
            st.done = false;
        }

        let completed = st.done;
        if let Err(e) = self.recorder.write_summary(completed, st.error.as_deref()) {
            warn!(error = %e, "failed to write run summary");
        }
        info!(completed, steps, "task finished");

        RunResult {
            task: task.to_string(),
            completed,
            steps,
            error: st.error,
            final_step: self.store.last_step().cloned(),
        }
    }

    async fn drive(
        &mut self,
        task: &str,
        initial_url: Option<&str>,
        st: &mut LoopState,
    ) -> Result<()> {
        if let Some(url) = initial_url {
            info!(url, "navigating to starting page");
            self.browser
                .navigate(url)
                .await
                .context("initial navigation failed")?;
            tokio::time::sleep(self.policy.settle_delay).await;
            st.origin_host = oauth::host_of(url);
        }

        while st.step < self.policy.max_steps && !st.done && st.error.is_none() {
            info!(step = st.step + 1, max = self.policy.max_steps, "step");

            // Observe: reuse the screenshot a post-click branch already took
            // for this index, or capture a fresh one.
            let shot = match std::mem::replace(&mut st.capture, CaptureState::NeedsCapture) {
                CaptureState::CaptureReady(path) => {
                    debug!(path = %path.display(), "reusing post-click screenshot");
                    path
                }
                CaptureState::NeedsCapture => {
                    let path = self.screenshot_path(st.step);
                    self.browser
                        .screenshot(&path)
                        .await
                        .context("screenshot capture failed")?;
                    path
                }
            };
            let shot_str = shot.display().to_string();
            let mut current_url = self
                .browser
                .current_url()
                .await
                .context("reading current url")?;

            // OAuth guard: while the browser sits on a third-party identity
            // provider, hold off on actions and wait for the redirect back.
            if let Some(host) = oauth::host_of(&current_url) {
                if oauth::is_identity_host(&host, &self.policy.oauth_hosts)
                    && st.origin_host.is_some()
                {
                    let origin = st.origin_host.clone().unwrap_or_default();
                    warn!(%host, %origin, "identity-provider redirect detected, waiting for return");

                    let mut resolved = false;
                    for _ in 0..self.policy.oauth_poll_attempts {
                        tokio::time::sleep(self.policy.oauth_poll_interval).await;
                        current_url = self
                            .browser
                            .current_url()
                            .await
                            .context("reading url during redirect wait")?;
                        let now_host = oauth::host_of(&current_url).unwrap_or_default();
                        if oauth::returned_to(&now_host, &origin)
                            || !oauth::is_identity_host(&now_host, &self.policy.oauth_hosts)
                        {
                            info!(host = %now_host, "redirected back");
                            resolved = true;
                            break;
                        }
                    }

                    if !resolved {
                        let stuck = oauth::host_of(&current_url).unwrap_or(host);
                        let message = format!(
                            "Stuck on identity-provider page: {stuck}. \
                             Complete authentication manually."
                        );
                        error!(host = %stuck, "still on identity provider after polling");
                        self.log_step(
                            st.step,
                            &current_url,
                            &shot_str,
                            "oauth_wait",
                            None,
                            &[],
                            StepStatus::Failure,
                            Some(&message),
                        );
                        self.save_record(self.make_record(
                            st.step,
                            &current_url,
                            &shot_str,
                            "OAuth redirect wait",
                            "oauth_wait",
                            StepStatus::Failure,
                            None,
                            None,
                            None,
                        ));
                        st.error = Some(message);
                        st.step += 1;
                        break;
                    }

                    // Resolved: this step is an unclassified wait; no model
                    // calls, fresh capture next iteration.
                    self.log_step(
                        st.step,
                        &current_url,
                        &shot_str,
                        "oauth_wait",
                        None,
                        &[],
                        StepStatus::Skipped,
                        Some("waiting for identity-provider redirect"),
                    );
                    self.save_record(self.make_record(
                        st.step,
                        &current_url,
                        &shot_str,
                        "OAuth redirect wait",
                        "oauth_wait",
                        StepStatus::Skipped,
                        None,
                        None,
                        None,
                    ));
                    st.step += 1;
                    continue;
                }
            }

            // Perceive. DOM metadata is diagnostic only; the describer never
            // fails, it degrades.
            let dom = match self.browser.dom_snapshot().await {
                Ok(d) => Some(d),
                Err(e) => {
                    debug!(error = %e, "dom snapshot unavailable");
                    None
                }
            };
            let ui = self.describer.describe(&shot).await;
            if let Some(err) = &ui.error {
                warn!(error = %err, "describer degraded, planning on empty description");
            }

            // Decide.
            let recent = self.store.recent_summaries(3);
            let mut decision = self.planner.plan(task, &ui, &recent).await;

            // Credential auto-fill happens before the intent is recorded, so
            // the log reflects what will actually be filled.
            if let Some(field) = apply_credentials(&mut decision, &self.policy) {
                info!(field = ?field, "auto-filled credential value");
            }

            // Record intent.
            let logged = redact_decision(&decision, &self.policy);
            self.log_step(
                st.step,
                &current_url,
                &shot_str,
                decision.action.as_str(),
                decision.target.as_deref(),
                &ui.buttons,
                StepStatus::Pending,
                decision.reasoning.as_deref(),
            );
            self.save_record(self.make_record(
                st.step,
                &current_url,
                &shot_str,
                if ui.title.is_empty() { "Unknown UI" } else { ui.title.as_str() },
                &logged.summary(),
                StepStatus::Pending,
                Some(ui.clone()),
                Some(logged),
                dom,
            ));

            if decision.done {
                info!("planner reported task complete");
                st.done = true;
                st.step += 1;
                break;
            }
            if decision.action == ActionKind::Error {
                let message = decision
                    .error
                    .clone()
                    .or_else(|| decision.reasoning.clone())
                    .unwrap_or_else(|| "planner returned an error action".to_string());
                error!(error = %message, "planner-signaled error");
                self.log_step(
                    st.step,
                    &current_url,
                    &shot_str,
                    "error",
                    None,
                    &ui.buttons,
                    StepStatus::Failure,
                    Some(&message),
                );
                self.mark(st.step, StepStatus::Failure);
                st.error = Some(message);
                st.step += 1;
                break;
            }

            // Act.
            match self.execute(&decision).await {
                Err(e) => {
                    let message = format!("{e:#}");
                    error!(error = %message, "action dispatch failed");
                    self.log_step(
                        st.step,
                        &current_url,
                        &shot_str,
                        decision.action.as_str(),
                        decision.target.as_deref(),
                        &ui.buttons,
                        StepStatus::Failure,
                        Some(&message),
                    );
                    self.mark(st.step, StepStatus::Failure);
                    st.error = Some(message);
                    st.step += 1;
                    break;
                }
                Ok(true) => {
                    // Navigation: let the new page settle, then move on.
                    tokio::time::sleep(self.policy.settle_delay).await;
                    let landed = self
                        .browser
                        .current_url()
                        .await
                        .context("reading url after navigation")?;
                    debug!(url = %landed, "navigation settled");
                    self.log_step(
                        st.step,
                        &landed,
                        &shot_str,
                        decision.action.as_str(),
                        decision.target.as_deref(),
                        &ui.buttons,
                        StepStatus::Success,
                        None,
                    );
                    self.mark(st.step, StepStatus::Success);
                    st.step += 1;
                }
                Ok(false) if decision.action == ActionKind::Click => {
                    // A click that didn't navigate likely changed the page in
                    // place (modal, dropdown, expanded form). Probe for an
                    // overlay (advisory), advance the index, and capture the
                    // next iteration's screenshot now so the planner never
                    // sees pre-click state.
                    tokio::time::sleep(self.policy.settle_delay).await;
                    if let Some(selector) = self
                        .browser
                        .probe_overlay(&self.policy.overlay_selectors, self.policy.overlay_timeout)
                        .await
                    {
                        debug!(%selector, "overlay appeared after click");
                    }
                    self.log_step(
                        st.step,
                        &current_url,
                        &shot_str,
                        "click",
                        decision.target.as_deref(),
                        &ui.buttons,
                        StepStatus::Success,
                        None,
                    );
                    self.mark(st.step, StepStatus::Success);

                    st.step += 1;
                    let next_shot = self.screenshot_path(st.step);
                    self.browser
                        .screenshot(&next_shot)
                        .await
                        .context("post-click capture failed")?;
                    let after = self.describer.describe(&next_shot).await;
                    let url_now = self
                        .browser
                        .current_url()
                        .await
                        .context("reading url after click")?;
                    let next_shot_str = next_shot.display().to_string();
                    self.log_step(
                        st.step,
                        &url_now,
                        &next_shot_str,
                        "ui_updated",
                        None,
                        &after.buttons,
                        StepStatus::Success,
                        None,
                    );
                    let description = if after.title.is_empty() {
                        "Post-click UI".to_string()
                    } else {
                        after.title.clone()
                    };
                    self.save_record(self.make_record(
                        st.step,
                        &url_now,
                        &next_shot_str,
                        &description,
                        "ui_updated",
                        StepStatus::Success,
                        Some(after),
                        None,
                        None,
                    ));
                    st.capture = CaptureState::CaptureReady(next_shot);
                    continue;
                }
                Ok(false) => {
                    // fill/wait: no page transition expected.
                    tokio::time::sleep(self.policy.action_pause).await;
                    self.log_step(
                        st.step,
                        &current_url,
                        &shot_str,
                        decision.action.as_str(),
                        decision.target.as_deref(),
                        &ui.buttons,
                        StepStatus::Success,
                        None,
                    );
                    self.mark(st.step, StepStatus::Success);
                    st.step += 1;
                }
            }
        }

        if st.step >= self.policy.max_steps && !st.done && st.error.is_none() {
            warn!(
                max_steps = self.policy.max_steps,
                "reached step budget before completion"
            );
        }
        Ok(())
    }

    /// Dispatch one decision to the browser. Returns whether the action
    /// navigated. Element-not-found and unrecognized kinds are hard
    /// failures; the loop does not retry.
    async fn execute(&self, decision: &ActionDecision) -> Result<bool> {
        match decision.action {
            ActionKind::Click => {
                let target = decision
                    .target
                    .as_deref()
                    .ok_or_else(|| anyhow!("click action without a target"))?;
                Ok(self.browser.click(target).await?)
            }
            ActionKind::Fill => {
                let target = decision
                    .target
                    .as_deref()
                    .ok_or_else(|| anyhow!("fill action without a target"))?;
                self.browser
                    .fill(target, decision.value.as_deref().unwrap_or_default())
                    .await?;
                Ok(false)
            }
            ActionKind::Navigate => {
                let target = decision
                    .target
                    .as_deref()
                    .ok_or_else(|| anyhow!("navigate action without a url"))?;
                self.browser.navigate(target).await?;
                Ok(true)
            }
            ActionKind::Wait => {
                tokio::time::sleep(Duration::from_secs_f64(decision.wait_secs().min(60.0))).await;
                Ok(false)
            }
            ActionKind::Done | ActionKind::Error | ActionKind::Unknown => {
                bail!("unknown action kind: {}", decision.action.as_str())
            }
        }
    }

    fn screenshot_path(&self, step: usize) -> PathBuf {
        self.run_dir.join(format!("step_{step:02}.png"))
    }

    #[allow(clippy::too_many_arguments)]
    fn make_record(
        &self,
        step: usize,
        url: &str,
        screenshot: &str,
        description: &str,
        action_taken: &str,
        status: StepStatus,
        vision: Option<UiDescription>,
        decision: Option<ActionDecision>,
        dom: Option<crate::types::DomSnapshot>,
    ) -> StepRecord {
        StepRecord {
            step,
            timestamp: Utc::now().to_rfc3339(),
            url: url.to_string(),
            screenshot: screenshot.to_string(),
            description: description.to_string(),
            action_taken: action_taken.to_string(),
            status,
            vision,
            decision,
            dom,
        }
    }

    // Recording is observability, not outcome: failures are logged and
    // swallowed.
    #[allow(clippy::too_many_arguments)]
    fn log_step(
        &mut self,
        step: usize,
        url: &str,
        image: &str,
        action: &str,
        target: Option<&str>,
        buttons: &[String],
        status: StepStatus,
        reasoning: Option<&str>,
    ) {
        if let Err(e) = self
            .recorder
            .record_step(step, url, image, action, target, buttons, status, reasoning)
        {
            warn!(error = %e, "step recorder write failed");
        }
    }

    fn save_record(&mut self, record: StepRecord) {
        if let Err(e) = self.store.save_step(record) {
            warn!(error = %e, "metadata store write failed");
        }
    }

    fn mark(&mut self, step: usize, status: StepStatus) {
        if let Err(e) = self.store.mark_status(step, status) {
            warn!(error = %e, "metadata status update failed");
        }
    }
}

/// Overwrite a fill decision's value with a configured credential when the
/// target looks like an email/username or password field. Keyword matching
/// over the lower-cased target; two mutually exclusive buckets, email
/// checked first. Best-effort by design: it can misfire on labels like
/// "username or email" when only a password is configured, and it knows
/// nothing about non-English labels.
pub fn apply_credentials(
    decision: &mut ActionDecision,
    policy: &LoopPolicy,
) -> Option<CredentialField> {
    if decision.action != ActionKind::Fill || policy.credentials.is_empty() {
        return None;
    }
    let target = decision
        .target
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();

    if policy
        .email_keywords
        .iter()
        .any(|k| target.contains(&k.to_lowercase()))
    {
        if let Some(email) = &policy.credentials.email {
            decision.value = Some(email.clone());
            return Some(CredentialField::Email);
        }
    } else if policy
        .password_keywords
        .iter()
        .any(|k| target.contains(&k.to_lowercase()))
    {
        if let Some(password) = &policy.credentials.password {
            decision.value = Some(password.clone());
            return Some(CredentialField::Password);
        }
    }
    None
}

/// Copy of a decision safe to persist: password-field values never reach
/// disk in the clear.
fn redact_decision(decision: &ActionDecision, policy: &LoopPolicy) -> ActionDecision {
    let mut logged = decision.clone();
    if decision.action == ActionKind::Fill && logged.value.is_some() {
        let target = decision
            .target
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();
        if policy
            .password_keywords
            .iter()
            .any(|k| target.contains(&k.to_lowercase()))
        {
            logged.value = Some("[redacted]".to_string());
        }
    }
    logged
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod orchestrator_tests;
