//! Host classification for the OAuth redirect guard.
//!
//! The step loop pauses action-taking while the browser sits on a recognized
//! third-party identity-provider host, then polls for the redirect back to
//! the task's origin. The classification itself is pure string matching so
//! it can be tested without a browser.

use url::Url;

/// Lower-cased host of a URL string, if it has one.
pub fn host_of(url_str: &str) -> Option<String> {
    Url::parse(url_str)
        .ok()?
        .host_str()
        .map(|h| h.to_ascii_lowercase())
}

/// Whether `host` matches any denylist entry by case-insensitive substring
/// containment ("github.com" matches "www.github.com"; a bare "oauth" entry
/// matches "oauth.provider.io").
pub fn is_identity_host(host: &str, denylist: &[String]) -> bool {
    let host = host.to_ascii_lowercase();
    denylist
        .iter()
        .any(|entry| host.contains(&entry.to_ascii_lowercase()))
}

/// Whether the browser has returned to (or onto a sub-host of) the original
/// host the run started on.
pub fn returned_to(current_host: &str, original_host: &str) -> bool {
    current_host
        .to_ascii_lowercase()
        .contains(&original_host.to_ascii_lowercase())
}
