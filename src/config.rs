//! Renderer Configuration

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererConfig {
    /// Delay before an `jstl-async` element is rendered in place of its placeholder.
    #[serde(default = "default_async_delay_ms")]
    pub async_delay_ms: u64,
    /// Evaluations slower than this are logged. They are never cancelled.
    #[serde(default = "default_eval_warn_ms")]
    pub eval_warn_ms: u64,
    #[serde(default = "default_true")]
    pub cache_templates: bool,
    /// Tags stripped from `html` text output unless marked unsecure.
    #[serde(default = "default_html_denylist")]
    pub html_denylist: Vec<String>,
    #[serde(default = "default_ellipsis")]
    pub ellipsis: String,
    /// Most recent context completions kept for diagnostics; 0 keeps none.
    #[serde(default = "default_journal_limit")]
    pub journal_limit: usize,
}

fn default_true() -> bool { true }

fn default_async_delay_ms() -> u64 { 250 }

fn default_eval_warn_ms() -> u64 { 1000 }

fn default_html_denylist() -> Vec<String> {
    ["script", "style", "head", "html", "body", "object", "link"]
        .iter()
        .map(|tag| tag.to_string())
        .collect()
}

fn default_ellipsis() -> String { "\u{2026}".to_string() }

fn default_journal_limit() -> usize { 256 }

impl RendererConfig {
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(std::io::Error::other)
    }

    pub fn async_delay(&self) -> Duration {
        Duration::from_millis(self.async_delay_ms)
    }

    pub fn eval_warn(&self) -> Duration {
        Duration::from_millis(self.eval_warn_ms)
    }

    pub fn is_denied(&self, tag: &str) -> bool {
        self.html_denylist.iter().any(|denied| denied.eq_ignore_ascii_case(tag))
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            async_delay_ms: default_async_delay_ms(),
            eval_warn_ms: default_eval_warn_ms(),
            cache_templates: true,
            html_denylist: default_html_denylist(),
            ellipsis: default_ellipsis(),
            journal_limit: default_journal_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: RendererConfig = serde_json::from_str(r#"{"asyncDelayMs": 10}"#).unwrap();
        assert_eq!(config.async_delay(), Duration::from_millis(10));
        assert_eq!(config.eval_warn_ms, 1000);
        assert!(config.cache_templates);
        assert!(config.is_denied("SCRIPT"));
        assert!(!config.is_denied("span"));
        assert_eq!(config.journal_limit, 256);
    }
}
