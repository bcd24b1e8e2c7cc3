//! Configuration: CLI entry point, on-disk documents, and env-var
//! tunables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Read an env var, falling back to `default` if unset or unparsable.
pub fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn env_str_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Execution mode: PAPER runs the full pipeline against virtual positions;
/// LIVE places real orders. The exchange REST client implementation is
/// out of scope here — only the seam (`ExecutionAdapter`) is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Paper,
    Live,
}

impl std::str::FromStr for RunMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "paper" => Ok(RunMode::Paper),
            "live" => Ok(RunMode::Live),
            other => Err(format!("unknown run mode: {other}")),
        }
    }
}

/// Minimal CLI surface: just enough to point the orchestrator at its
/// documents.
#[derive(Debug, Parser)]
#[command(name = "windowtrader", about = "15-minute binary-market trading engine")]
pub struct Cli {
    /// PAPER or LIVE.
    #[arg(long, env = "WINDOWTRADER_MODE", default_value = "paper")]
    pub mode: RunMode,

    /// Directory containing the launch manifest and strategy documents.
    #[arg(long, env = "WINDOWTRADER_CONFIG_DIR", default_value = "./config")]
    pub config_dir: PathBuf,

    /// Path to the sqlite database file.
    #[arg(long, env = "DATABASE_PATH", default_value = "./windowtrader.db")]
    pub database_path: String,

    /// Path the orchestrator writes its PID to.
    #[arg(long, env = "WINDOWTRADER_PID_FILE", default_value = "./windowtrader.pid")]
    pub pid_file: PathBuf,

    /// Path the orchestrator writes state snapshots to.
    #[arg(long, env = "WINDOWTRADER_STATE_FILE", default_value = "./state.json")]
    pub state_file: PathBuf,
}

impl Cli {
    pub fn parse_with_dotenv() -> Self {
        dotenv::dotenv().ok();
        Cli::parse()
    }
}

/// Launch manifest: allowed strategies, global exposure caps, kill
/// switch. Loaded by the orchestrator, exposed via `getState()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchManifest {
    pub allowed_strategies: Vec<String>,
    pub position_size_dollars: f64,
    pub max_exposure_dollars: f64,
    pub kill_switch_enabled: bool,
}

impl Default for LaunchManifest {
    fn default() -> Self {
        Self {
            allowed_strategies: vec!["default".to_string()],
            position_size_dollars: 50.0,
            max_exposure_dollars: 500.0,
            kill_switch_enabled: false,
        }
    }
}

impl LaunchManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading launch manifest at {}", path.display()))?;
        let manifest: LaunchManifest =
            toml::from_str(&text).context("parsing launch manifest toml")?;
        Ok(manifest)
    }
}

/// One strategy configuration document. `components` maps a pipeline
/// slot name to one or more component `versionId`s; `config` is passed
/// through to every component's `validateConfig`/`evaluate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDocument {
    pub name: String,
    pub components: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub config: HashMap<String, toml::Value>,
    #[serde(default)]
    pub pipeline_order: Option<Vec<String>>,
}

impl StrategyDocument {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading strategy document at {}", path.display()))?;
        let doc: StrategyDocument =
            toml::from_str(&text).context("parsing strategy document toml")?;
        Ok(doc)
    }

    /// Load every `*.toml` file in a directory, reporting per-file
    /// failures without aborting the scan.
    pub fn load_dir(dir: &Path) -> Vec<StrategyDocument> {
        let mut docs = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "strategy config directory unreadable");
                return docs;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            match StrategyDocument::load(&path) {
                Ok(doc) => docs.push(doc),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to load strategy document");
                }
            }
        }
        docs
    }
}
