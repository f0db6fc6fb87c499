use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::address::DEFAULT_MULTIPLEX_MARKERS;
use crate::geolocate::DEFAULT_API_BASE_URL;
use crate::optin::DEFAULT_MARKER_FILES;

const CONFIG_SCHEMA_VERSION: u32 = 2;
const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 10;
const MAX_REQUEST_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_CACHE_FILE: &str = "ips.json";
pub const DEFAULT_HOME_ROOT: &str = "/home";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhereConfig {
    pub schema_version: u32,
    /// ipstack access key. `K` is the key older credential files used.
    #[serde(alias = "K", alias = "k")]
    pub api_key: Option<String>,
    pub api_base_url: String,
    pub request_timeout_seconds: u64,
    pub cache_path: PathBuf,
    pub home_root: PathBuf,
    pub marker_files: Vec<String>,
    pub multiplex_markers: Vec<String>,
}

impl Default for WhereConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            api_key: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECONDS,
            cache_path: PathBuf::from(DEFAULT_CACHE_FILE),
            home_root: PathBuf::from(DEFAULT_HOME_ROOT),
            marker_files: DEFAULT_MARKER_FILES.iter().map(|m| m.to_string()).collect(),
            multiplex_markers: DEFAULT_MULTIPLEX_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

impl WhereConfig {
    /// Loads the config at the default location, creating it on first use.
    pub fn load_or_init() -> Result<Self> {
        let cfg_path = config_path();
        if cfg_path.exists() {
            let mut parsed = Self::read(&cfg_path)?;
            if parsed.normalize_and_migrate() {
                parsed.save_to(&cfg_path)?;
            }
            Ok(parsed)
        } else {
            let cfg = WhereConfig::default();
            cfg.save_to(&cfg_path)?;
            Ok(cfg)
        }
    }

    /// Loads an explicitly named config file, which must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("config file {} does not exist", path.display());
        }
        let mut parsed = Self::read(path)?;
        parsed.normalize_and_migrate();
        Ok(parsed)
    }

    fn read(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn effective_api_key(&self) -> Option<String> {
        let from_env = env::var("TILDE_WHERE_API_KEY")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        if from_env.is_some() {
            return from_env;
        }

        self.api_key
            .as_ref()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        let seconds = env_u64("TILDE_WHERE_TIMEOUT_SECONDS", self.request_timeout_seconds)
            .clamp(1, MAX_REQUEST_TIMEOUT_SECONDS);
        Duration::from_secs(seconds)
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;
        let defaults = WhereConfig::default();

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }

        if normalize_optional_string(&mut self.api_key) {
            changed = true;
        }

        let base_url = self.api_base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            self.api_base_url = defaults.api_base_url;
            changed = true;
        } else if base_url != self.api_base_url {
            self.api_base_url = base_url;
            changed = true;
        }

        let timeout = self
            .request_timeout_seconds
            .clamp(1, MAX_REQUEST_TIMEOUT_SECONDS);
        if timeout != self.request_timeout_seconds {
            self.request_timeout_seconds = timeout;
            changed = true;
        }

        if self.cache_path.as_os_str().is_empty() {
            self.cache_path = defaults.cache_path;
            changed = true;
        }
        if self.home_root.as_os_str().is_empty() {
            self.home_root = defaults.home_root;
            changed = true;
        }

        if normalize_list(&mut self.marker_files) {
            changed = true;
        }
        if self.marker_files.is_empty() {
            self.marker_files = defaults.marker_files;
            changed = true;
        }
        if normalize_list(&mut self.multiplex_markers) {
            changed = true;
        }

        changed
    }
}

pub fn config_home() -> PathBuf {
    if let Ok(custom) = env::var("TILDE_WHERE_HOME") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tilde-where")
}

pub fn config_path() -> PathBuf {
    config_home().join("config.json")
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn normalize_optional_string(value: &mut Option<String>) -> bool {
    if let Some(item) = value.as_mut() {
        let trimmed = item.trim().to_string();
        if trimmed.is_empty() {
            *value = None;
            return true;
        }
        if *item != trimmed {
            *item = trimmed;
            return true;
        }
    }
    false
}

fn normalize_list(items: &mut Vec<String>) -> bool {
    let mut normalized: Vec<String> = Vec::with_capacity(items.len());
    for item in items.iter() {
        let trimmed = item.trim();
        if trimmed.is_empty() || normalized.iter().any(|seen| seen == trimmed) {
            continue;
        }
        normalized.push(trimmed.to_string());
    }
    if *items != normalized {
        *items = normalized;
        return true;
    }
    false
}
