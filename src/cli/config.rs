use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

/// Configuration loaded from `dynsched.yaml`.
/// All fields are optional. Missing fields fall back to CLI/env/defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DynschedConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_body: Option<usize>,
    /// `memory`, `redis://...` or a JSON file path.
    pub store: Option<String>,
    /// SQLite url or file path of the run ledger.
    pub ledger: Option<String>,
    /// `memory` or the Docker Engine API url.
    pub runtime: Option<String>,
    pub worker_slots: Option<usize>,
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct LifecycleConfig {
    pub proxy_image: Option<String>,
    pub presence_retries: Option<u32>,
    pub presence_wait_s: Option<f64>,
    pub monitor_interval_s: Option<f64>,
    pub group_timeout_s: Option<f64>,
}

impl DynschedConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `dynsched.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("dynsched.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(contents)?)
    }
}
