use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, Element, LaunchOptions, Tab};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::WebSettings;
use crate::dom;
use crate::types::DomSnapshot;

/// Window raced against a click to decide whether it triggered a page
/// navigation.
const NAV_DETECT_WINDOW: Duration = Duration::from_millis(1500);
const NAV_POLL_INTERVAL: Duration = Duration::from_millis(150);

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("no clickable element matching '{0}'")]
    ElementNotFound(String),
    #[error("no form field matching '{0}'")]
    FieldNotFound(String),
    #[error("browser session error: {0}")]
    Session(String),
    #[error("browser task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn session_err(e: anyhow::Error) -> BrowserError {
    BrowserError::Session(format!("{e:#}"))
}

/// Browser primitives the step loop consumes. The production implementation
/// drives Chrome over CDP; tests substitute scripted fakes.
#[async_trait]
pub trait BrowserControl: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    /// Viewport PNG capture, written to `path` (parent directories created).
    async fn screenshot(&self, path: &Path) -> Result<PathBuf, BrowserError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    /// Best-effort descriptive DOM metadata.
    async fn dom_snapshot(&self) -> Result<DomSnapshot, BrowserError>;

    /// Click the element whose visible text matches `target`, racing a short
    /// navigation-detection window. Returns whether a navigation occurred.
    async fn click(&self, target: &str) -> Result<bool, BrowserError>;

    /// Fill the form field identified by `target` (label, name, placeholder
    /// or aria-label) with `value`.
    async fn fill(&self, target: &str, value: &str) -> Result<(), BrowserError>;

    /// Probe each selector in turn for a same-page overlay, returning the
    /// first that appears within `timeout`. Advisory only; never fails.
    async fn probe_overlay(&self, selectors: &[String], timeout: Duration) -> Option<String>;
}

/// A live Chrome session. Constructed only by a successful [`launch`], so
/// every method operates on a started browser; the process is torn down when
/// the session drops.
///
/// [`launch`]: BrowserSession::launch
pub struct BrowserSession {
    _browser: Browser,
    tab: Arc<Tab>,
}

impl BrowserSession {
    /// Attach to a Chrome already listening on port 9222, or launch a fresh
    /// instance.
    pub fn launch(settings: &WebSettings) -> Result<Self, BrowserError> {
        if let Ok(browser) = Browser::connect("http://127.0.0.1:9222".to_string()) {
            info!("attached to running Chrome on port 9222");
            let tab = {
                let tabs_lock = browser.get_tabs();
                let tabs = tabs_lock.lock().unwrap();
                match tabs.first() {
                    Some(t) => t.clone(),
                    None => browser.new_tab().map_err(session_err)?,
                }
            };
            return Ok(Self {
                _browser: browser,
                tab,
            });
        }

        let options = LaunchOptions {
            headless: settings.headless,
            window_size: Some((settings.viewport_width, settings.viewport_height)),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
            ],
            // Model calls can take minutes; don't let the idle reaper kill
            // Chrome between steps.
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        info!(headless = settings.headless, "launching Chrome");
        let browser = Browser::new(options).map_err(session_err)?;
        let tab = browser.new_tab().map_err(session_err)?;
        tab.navigate_to("about:blank").map_err(session_err)?;

        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    /// Run blocking CDP work off the async loop.
    async fn with_tab<T, F>(&self, f: F) -> Result<T, BrowserError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Tab>) -> Result<T, BrowserError> + Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || f(tab))
            .await
            .map_err(|e| BrowserError::Task(e.to_string()))?
    }
}

#[async_trait]
impl BrowserControl for BrowserSession {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let url = url.to_string();
        self.with_tab(move |tab| {
            tab.navigate_to(&url).map_err(session_err)?;
            tab.wait_until_navigated().map_err(session_err)?;
            Ok(())
        })
        .await
    }

    async fn screenshot(&self, path: &Path) -> Result<PathBuf, BrowserError> {
        let path = path.to_path_buf();
        self.with_tab(move |tab| {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // Scroll to the top so the capture shows the primary content.
            tab.evaluate("window.scrollTo(0, 0)", false)
                .map_err(session_err)?;
            std::thread::sleep(Duration::from_millis(500));
            let png = tab
                .capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, false)
                .map_err(session_err)?;
            std::fs::write(&path, &png)?;
            Ok(path)
        })
        .await
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        self.with_tab(|tab| Ok(tab.get_url())).await
    }

    async fn dom_snapshot(&self) -> Result<DomSnapshot, BrowserError> {
        self.with_tab(|tab| dom::capture_outline(&tab).map_err(session_err))
            .await
    }

    async fn click(&self, target: &str) -> Result<bool, BrowserError> {
        let target = target.to_string();
        self.with_tab(move |tab| {
            let before = tab.get_url();
            let element = find_clickable(&tab, &target)
                .ok_or_else(|| BrowserError::ElementNotFound(target.clone()))?;
            element.click().map_err(session_err)?;

            // Race a short window for a page navigation.
            let deadline = Instant::now() + NAV_DETECT_WINDOW;
            while Instant::now() < deadline {
                std::thread::sleep(NAV_POLL_INTERVAL);
                if tab.get_url() != before {
                    debug!(target = %target, "click navigated");
                    return Ok(true);
                }
            }
            Ok(false)
        })
        .await
    }

    async fn fill(&self, target: &str, value: &str) -> Result<(), BrowserError> {
        let target = target.to_string();
        let value = value.to_string();
        self.with_tab(move |tab| {
            let element = find_field(&tab, &target)
                .ok_or_else(|| BrowserError::FieldNotFound(target.clone()))?;
            element.click().map_err(session_err)?;
            let _ = element.call_js_fn(
                "function () { if ('value' in this) { this.value = ''; } }",
                vec![],
                false,
            );
            element.type_into(&value).map_err(session_err)?;
            Ok(())
        })
        .await
    }

    async fn probe_overlay(&self, selectors: &[String], timeout: Duration) -> Option<String> {
        let selectors = selectors.to_vec();
        self.with_tab(move |tab| {
            for selector in &selectors {
                if tab
                    .wait_for_element_with_custom_timeout(selector, timeout)
                    .is_ok()
                {
                    return Ok(Some(selector.clone()));
                }
            }
            Ok(None)
        })
        .await
        .unwrap_or(None)
    }
}

/// Locate a clickable element by visible text through a chain of
/// progressively looser strategies.
fn find_clickable<'a>(tab: &'a Arc<Tab>, target: &str) -> Option<Element<'a>> {
    let exact = xpath_literal(target);
    let lower = xpath_literal(&target.to_lowercase());
    const ALPHA_UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    const ALPHA_LOWER: &str = "abcdefghijklmnopqrstuvwxyz";

    let strategies = [
        format!("//button[normalize-space()={exact}]"),
        format!("//a[normalize-space()={exact}]"),
        format!("//*[@role='button'][normalize-space()={exact}]"),
        format!("//button[contains(normalize-space(), {exact})]"),
        format!("//a[contains(normalize-space(), {exact})]"),
        format!(
            "//*[self::button or self::a or @role='button' or @type='submit']\
             [contains(translate(normalize-space(), '{ALPHA_UPPER}', '{ALPHA_LOWER}'), {lower})]"
        ),
    ];

    for xpath in &strategies {
        if let Ok(element) = tab.find_element_by_xpath(xpath) {
            debug!(target = %target, %xpath, "click strategy matched");
            return Some(element);
        }
    }
    None
}

/// Locate a form field by label, name, placeholder or aria-label.
fn find_field<'a>(tab: &'a Arc<Tab>, target: &str) -> Option<Element<'a>> {
    let css_target = target.replace('\'', "\\'");
    let selectors = [
        format!("input[name='{css_target}']"),
        format!("input[placeholder*='{css_target}']"),
        format!("input[aria-label*='{css_target}']"),
        format!("textarea[name='{css_target}']"),
        format!("textarea[placeholder*='{css_target}']"),
    ];
    for selector in &selectors {
        if let Ok(element) = tab.find_element(selector) {
            return Some(element);
        }
    }

    // Fall back to the field following a matching label.
    let literal = xpath_literal(target);
    let by_label = format!(
        "//label[contains(normalize-space(), {literal})]\
         /following::*[self::input or self::textarea][1]"
    );
    tab.find_element_by_xpath(&by_label).ok()
}

/// Quote a string as an XPath literal, splitting on single quotes with
/// `concat()` when needed.
fn xpath_literal(s: &str) -> String {
    if !s.contains('\'') {
        return format!("'{s}'");
    }
    let parts: Vec<String> = s
        .split('\'')
        .map(|part| format!("'{part}'"))
        .collect();
    format!("concat({})", parts.join(", \"'\", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xpath_literal_plain() {
        assert_eq!(xpath_literal("Sign up"), "'Sign up'");
    }

    #[test]
    fn xpath_literal_with_quote() {
        assert_eq!(
            xpath_literal("Don't save"),
            "concat('Don', \"'\", 't save')"
        );
    }
}
