use std::sync::Arc;

use anyhow::Result;
use headless_chrome::Tab;

use crate::types::DomSnapshot;

const OUTLINE_MAX_CHARS: usize = 4000;

/// JavaScript injected into the page to produce a compact, read-only outline
/// of what is currently visible: headings, landmarks, and interactive
/// elements with their accessible labels. Purely descriptive; the agent acts
/// on the vision model's description, not on this.
const OUTLINE_JS: &str = r#"
(() => {
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','SVG','LINK','META','TEMPLATE']);
  const lines = [];
  const seen = new Set();

  function visible(el) {
    if (el.offsetParent === null && el.tagName !== 'BODY' && el.tagName !== 'HTML') return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  function label(el) {
    return (
      el.getAttribute('aria-label') ||
      el.placeholder ||
      (el.labels && el.labels[0] && el.labels[0].textContent) ||
      el.name ||
      (el.textContent || '')
    ).trim().slice(0, 80);
  }

  function push(line) {
    if (line && !seen.has(line)) { seen.add(line); lines.push(line); }
  }

  function walk(node, depth) {
    if (depth > 15) return;
    for (const child of node.children) {
      if (SKIP.has(child.tagName)) continue;
      if (!visible(child)) continue;
      const tag = child.tagName.toLowerCase();
      const role = child.getAttribute('role');

      if (/^h[1-6]$/.test(tag)) {
        push(tag + ' "' + (child.textContent || '').trim().slice(0, 80) + '"');
      } else if (tag === 'a') {
        push('link "' + label(child) + '"');
      } else if (tag === 'button' || role === 'button') {
        push('button "' + label(child) + '"');
      } else if (tag === 'input' || tag === 'textarea') {
        push(tag + ' type=' + (child.type || 'text') + ' "' + label(child) + '"');
      } else if (tag === 'select') {
        push('select "' + label(child) + '"');
      } else if (role === 'dialog' || tag === 'dialog') {
        push('dialog "' + label(child) + '"');
      }
      walk(child, depth + 1);
    }
  }

  walk(document.body, 0);
  return lines.join('\n');
})()
"#;

/// Capture a descriptive DOM outline from the current page.
pub fn capture_outline(tab: &Arc<Tab>) -> Result<DomSnapshot> {
    let result = tab.evaluate(OUTLINE_JS, false)?;
    let raw = result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default();

    let outline = if raw.len() > OUTLINE_MAX_CHARS {
        let cut = raw
            .char_indices()
            .take_while(|(i, _)| *i < OUTLINE_MAX_CHARS)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}\n... [truncated, {} total chars]", &raw[..cut], raw.len())
    } else {
        raw
    };

    Ok(DomSnapshot {
        url: tab.get_url(),
        title: page_title(tab)?,
        outline,
    })
}

/// Current document title, "untitled" when the page has none.
pub fn page_title(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate("document.title", false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "untitled".to_string()))
}
