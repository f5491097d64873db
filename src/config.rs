use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::reader::view_items::LayoutPolicy;

const APP_DIR: &str = "komga-tui";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PageLayout {
    #[default]
    Single,
    Dual,
    /// Spreads when the viewport is wide enough.
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub server_url: String,
    pub api_key: String,
    pub page_layout: PageLayout,
    pub isolate_cover: bool,
    pub split_wide_pages: bool,
    pub incognito: bool,
    pub offline: bool,
    pub webtoon: bool,
    pub progress_interval_secs: u64,
    pub keep_before: usize,
    pub keep_after: usize,
    pub preload_before: usize,
    pub preload_after: usize,
    pub initial_scroll_delay_ms: u64,
    pub initial_scroll_max_retries: u32,
    pub max_disk_cache_mb: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:25600".to_string(),
            api_key: String::new(),
            page_layout: PageLayout::Single,
            isolate_cover: true,
            split_wide_pages: false,
            incognito: false,
            offline: false,
            webtoon: false,
            progress_interval_secs: 3,
            keep_before: 3,
            keep_after: 5,
            preload_before: 1,
            preload_after: 3,
            initial_scroll_delay_ms: 100,
            initial_scroll_max_retries: 5,
            max_disk_cache_mb: 500,
        }
    }
}

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

impl ReaderConfig {
    /// Reads `config.json` from the config directory, then applies the
    /// `KOMGA_URL`, `KOMGA_API_KEY` and `KOMGA_OFFLINE` environment overrides.
    pub fn load() -> Self {
        let path = config_dir().join("config.json");
        let mut config = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("ignoring malformed {}: {}", path.display(), e);
                ReaderConfig::default()
            }),
            Err(_) => ReaderConfig::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("KOMGA_URL") {
            self.server_url = url;
        }
        if let Some(key) = var("KOMGA_API_KEY") {
            self.api_key = key;
        }
        if let Some(offline) = var("KOMGA_OFFLINE") {
            self.offline = matches!(offline.as_str(), "1" | "true" | "yes");
        }
    }

    pub fn save(&self) {
        let dir = config_dir();
        fs::create_dir_all(&dir).ok();
        if let Ok(content) = serde_json::to_string_pretty(self) {
            fs::write(dir.join("config.json"), content).ok();
        }
    }

    pub fn layout_policy(&self) -> LayoutPolicy {
        LayoutPolicy {
            isolate_cover: self.isolate_cover,
            force_dual_pairs: self.page_layout == PageLayout::Dual,
            split_wide_pages: self.split_wide_pages,
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }

    pub fn initial_scroll_delay(&self) -> Duration {
        Duration::from_millis(self.initial_scroll_delay_ms)
    }
}

/// Shared "no network" switch read by the image cache and progress gate.
#[derive(Debug, Clone, Default)]
pub struct OfflineFlag(Arc<AtomicBool>);

impl OfflineFlag {
    pub fn new(offline: bool) -> Self {
        Self(Arc::new(AtomicBool::new(offline)))
    }

    pub fn is_offline(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, offline: bool) {
        self.0.store(offline, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ReaderConfig =
            serde_json::from_str(r#"{"page_layout":"dual","keep_after":8}"#).unwrap();
        assert_eq!(config.page_layout, PageLayout::Dual);
        assert_eq!(config.keep_after, 8);
        assert_eq!(config.keep_before, 3);
        assert!(config.layout_policy().force_dual_pairs);
        assert_eq!(config.progress_interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [("KOMGA_URL", "https://komga.example"), ("KOMGA_OFFLINE", "1")]
            .into_iter()
            .collect();
        let mut config = ReaderConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.server_url, "https://komga.example");
        assert!(config.offline);
        assert!(config.api_key.is_empty());
    }

    #[test]
    fn test_offline_flag_is_shared() {
        let flag = OfflineFlag::new(false);
        let other = flag.clone();
        other.set(true);
        assert!(flag.is_offline());
    }
}
