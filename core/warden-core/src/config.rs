//! Engine configuration: paths, known agents, and polling knobs.
//!
//! The known-agent list is configuration, not discovery output — the engine
//! never invents an agent identity on its own.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};
use crate::transcript::TAIL_WINDOW_BYTES;
use crate::types::{normalize_agent_id, DEFAULT_QUIESCENCE_SECS};

/// How the engine reacts when processing one agent fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Isolate and report the error, continue with the next agent.
    /// One agent's bad data must not block visibility into the others.
    #[default]
    Robust,
    /// Abort the whole poll cycle on the first per-agent error.
    FailFast,
}

/// Default config location: `<platform config dir>/warden/config.json`
/// (e.g. `~/.config/warden/config.json` on Linux).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("warden").join("config.json"))
}

fn default_poll_interval() -> u64 {
    5
}

fn default_tail_window() -> usize {
    TAIL_WINDOW_BYTES
}

fn default_quiescence() -> i64 {
    DEFAULT_QUIESCENCE_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Root of the shared repository (commit log and per-agent state dirs).
    pub repo_root: PathBuf,
    /// Directory holding transcript files and the per-agent aliases.
    pub sessions_dir: PathBuf,
    /// Directory under which `<agent>/_state.md` records live.
    pub state_dir: PathBuf,
    /// Known agent identities (normalized on load).
    pub agents: Vec<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_quiescence")]
    pub quiescence_secs: i64,
    /// Bytes read from the end of a transcript per parse.
    #[serde(default = "default_tail_window")]
    pub tail_window_bytes: usize,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

impl WardenConfig {
    /// Convention-over-configuration defaults for a repo checkout:
    /// `_sessions/` for transcripts, agent state dirs at the repo root.
    pub fn for_repo(repo_root: impl Into<PathBuf>, agents: Vec<String>) -> Self {
        let repo_root = repo_root.into();
        WardenConfig {
            sessions_dir: repo_root.join("_sessions"),
            state_dir: repo_root.clone(),
            repo_root,
            agents: agents.iter().map(|a| normalize_agent_id(a)).collect(),
            poll_interval_secs: default_poll_interval(),
            quiescence_secs: default_quiescence(),
            tail_window_bytes: default_tail_window(),
            error_policy: ErrorPolicy::default(),
        }
    }

    /// Loads configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs_err::read_to_string(path)
            .map_err(|e| WardenError::io(format!("read config {}", path.display()), e))?;
        let mut config: WardenConfig =
            serde_json::from_str(&content).map_err(|e| WardenError::ConfigMalformed {
                path: path.to_path_buf(),
                details: e.to_string(),
            })?;
        config.agents = config
            .agents
            .iter()
            .map(|a| normalize_agent_id(a))
            .collect();
        Ok(config)
    }
}
