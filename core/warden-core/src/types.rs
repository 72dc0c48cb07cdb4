//! Core data model: agent lifecycle states, ground-truth records, and the
//! parsed artifacts (decisions, announcements) the engine reconciles.
//!
//! **Breaking changes are allowed** (single-deployment project). Current
//! on-disk record format is v2 (see `store`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A session with no transcript writes within this window is quiescent and
/// eligible for transcript-driven state transitions.
pub const DEFAULT_QUIESCENCE_SECS: i64 = 60;

/// Context window assumed when the transcript never reports a maximum.
pub const DEFAULT_MAX_CONTEXT_TOKENS: u64 = 200_000;

/// Agent lifecycle states per protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Offline,
    Bootstrap,
    Inbox,
    Distill,
    DeepWork,
    Idle,
    Logout,
    /// Administrative override: automated transitions are suppressed while
    /// a human drives the session directly.
    DirectIo,
}

impl AgentState {
    /// Parses a state name, tolerating case and hyphen/underscore variants
    /// ("DEEP-WORK", "Deep_Work" and "deep_work" all map to `DeepWork`).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "offline" => Some(AgentState::Offline),
            "bootstrap" => Some(AgentState::Bootstrap),
            "inbox" => Some(AgentState::Inbox),
            "distill" => Some(AgentState::Distill),
            "deep_work" => Some(AgentState::DeepWork),
            "idle" => Some(AgentState::Idle),
            "logout" => Some(AgentState::Logout),
            "direct_io" => Some(AgentState::DirectIo),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Offline => "offline",
            AgentState::Bootstrap => "bootstrap",
            AgentState::Inbox => "inbox",
            AgentState::Distill => "distill",
            AgentState::DeepWork => "deep_work",
            AgentState::Idle => "idle",
            AgentState::Logout => "logout",
            AgentState::DirectIo => "direct_io",
        }
    }

    /// Validated transition edges. `DirectIo` is reachable from any state
    /// and returns only to `Inbox`.
    pub fn can_transition_to(&self, target: AgentState) -> bool {
        if target == AgentState::DirectIo {
            return true;
        }
        matches!(
            (self, target),
            (AgentState::Offline, AgentState::Bootstrap)
                | (AgentState::Bootstrap, AgentState::Inbox)
                | (AgentState::Inbox, AgentState::Distill)
                | (AgentState::Distill, AgentState::DeepWork)
                | (AgentState::Distill, AgentState::Idle)
                | (AgentState::Distill, AgentState::Logout)
                | (AgentState::DeepWork, AgentState::Inbox)
                | (AgentState::Idle, AgentState::Inbox)
                | (AgentState::Logout, AgentState::Offline)
                | (AgentState::DirectIo, AgentState::Inbox)
        )
    }

    /// The default follow-on state written into the record as a hint for
    /// consumers; never enforced.
    pub fn expected_next(&self) -> AgentState {
        match self {
            AgentState::Offline => AgentState::Bootstrap,
            AgentState::Bootstrap => AgentState::Inbox,
            AgentState::Inbox => AgentState::Distill,
            AgentState::Distill => AgentState::DeepWork,
            AgentState::DeepWork => AgentState::Inbox,
            AgentState::Idle => AgentState::Inbox,
            AgentState::Logout => AgentState::Offline,
            AgentState::DirectIo => AgentState::Inbox,
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalizes an agent identifier: lowercase, underscores to hyphens
/// ("ERA_1" → "era-1").
pub fn normalize_agent_id(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace('_', "-")
}

/// Per-agent ground-truth lifecycle record, the unit the engine owns.
///
/// Exactly one record exists per known agent; an absent file synthesizes a
/// default `Offline` record before first use. Only the reconciliation
/// engine mutates it (single-writer discipline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AgentRecord {
    pub agent_id: String,
    #[serde(default)]
    pub state: AgentState,
    #[serde(default)]
    pub thread: Option<String>,
    #[serde(default)]
    pub entered_at: Option<DateTime<Utc>>,

    // Context window gauges, refreshed every cycle.
    #[serde(default)]
    pub context_tokens: Option<u64>,
    #[serde(default)]
    pub max_context_tokens: Option<u64>,
    #[serde(default)]
    pub context_percent: Option<f64>,
    #[serde(default)]
    pub context_tokens_at_entry: u64,

    // Commit activity.
    #[serde(default)]
    pub last_read_commit: Option<String>,
    #[serde(default)]
    pub last_read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_write_commit: Option<String>,
    #[serde(default)]
    pub last_write_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,

    #[serde(default)]
    pub expected_next_state: Option<AgentState>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl AgentRecord {
    /// Default record for an agent that has never been observed.
    pub fn offline(agent_id: &str) -> Self {
        AgentRecord {
            agent_id: normalize_agent_id(agent_id),
            expected_next_state: Some(AgentState::Bootstrap),
            ..AgentRecord::default()
        }
    }

    /// Applies fresh context-usage figures, clamping percent to [0, 100].
    pub fn apply_usage(&mut self, usage: &ContextUsage) {
        self.context_tokens = Some(usage.used);
        self.max_context_tokens = Some(usage.max);
        self.context_percent = Some(usage.percent());
    }
}

/// Cumulative context-window consumption read from a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextUsage {
    pub used: u64,
    pub max: u64,
}

impl ContextUsage {
    pub fn percent(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        let pct = self.used as f64 / self.max as f64 * 100.0;
        pct.clamp(0.0, 100.0)
    }
}

/// A transcript file currently mapped to an agent. Ephemeral: rebuilt on
/// every discovery pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub path: PathBuf,
    pub modified_at: DateTime<Utc>,
    pub is_quiescent: bool,
}

/// A parsed, not-yet-applied instruction extracted from a transcript's most
/// recent agent-authored turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleDecision {
    pub next_state: AgentState,
    pub thread: Option<String>,
    pub max_tokens: Option<u64>,
    pub last_read_commit: Option<String>,
}

/// A lifecycle tag embedded in a commit subject: `@AGENT [state[/thread]]: …`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAnnouncement {
    pub state: AgentState,
    pub thread: Option<String>,
    pub commit: String,
    pub subject: String,
}

/// One commit authored by an agent on the shared log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRef {
    pub hash: String,
    pub timestamp: DateTime<Utc>,
}
