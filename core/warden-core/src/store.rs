//! File-backed ground-truth persistence: one `_state.md` per agent.
//!
//! # File Format
//!
//! A versioned, human-readable `key: value` layout in three sections
//! (Commit Activity, Context Window, Last Observed State). Absent values
//! serialize as the literal `unknown`.
//!
//! # Defensive Design
//!
//! Readers tolerate unknown keys, `unknown` placeholders, and malformed
//! individual values (the field stays at its default). A missing file is
//! first-run bootstrap, not an error: it yields a default offline record.
//!
//! # Atomic Writes
//!
//! Temp file + rename, so no reader ever observes a half-written record.
//! On a failed rename the previous file is preserved (best-effort `.bak`).

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use fs_err as fs;
use tempfile::NamedTempFile;

use crate::error::{Result, WardenError};
use crate::types::{AgentRecord, AgentState};

/// Current on-disk format version.
pub const STATE_FORMAT_VERSION: u32 = 2;

/// Serialized in place of an absent value.
const PLACEHOLDER: &str = "unknown";

pub struct StateStore {
    state_dir: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        StateStore {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_path(&self, agent: &str) -> PathBuf {
        self.state_dir.join(agent).join("_state.md")
    }

    /// Reads an agent's record, synthesizing a default offline record when
    /// no file exists yet.
    pub fn read(&self, agent: &str) -> Result<AgentRecord> {
        let path = self.state_path(agent);
        if !path.exists() {
            return Ok(AgentRecord::offline(agent));
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| WardenError::io(format!("read state file {}", path.display()), e))?;
        Ok(parse_record(agent, &content))
    }

    /// Atomically persists an agent's record.
    pub fn write(&self, record: &AgentRecord) -> Result<()> {
        let path = self.state_path(&record.agent_id);
        let parent = path.parent().ok_or_else(|| WardenError::Persist {
            agent: record.agent_id.clone(),
            details: "state path has no parent directory".to_string(),
        })?;
        fs::create_dir_all(parent)
            .map_err(|e| WardenError::io(format!("create state dir {}", parent.display()), e))?;

        let content = render_record(record);

        let mut temp = NamedTempFile::new_in(parent).map_err(|e| WardenError::Persist {
            agent: record.agent_id.clone(),
            details: format!("temp file: {}", e),
        })?;
        temp.write_all(content.as_bytes())
            .and_then(|_| temp.flush())
            .map_err(|e| WardenError::Persist {
                agent: record.agent_id.clone(),
                details: format!("write temp file: {}", e),
            })?;

        if let Err(e) = temp.persist(&path) {
            // Keep the last good record recoverable.
            let backup = path.with_extension("md.bak");
            if path.exists() {
                let _ = fs::copy(&path, &backup);
            }
            return Err(WardenError::Persist {
                agent: record.agent_id.clone(),
                details: format!("rename into place: {}", e.error),
            });
        }
        Ok(())
    }
}

fn fmt_time(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| PLACEHOLDER.to_string())
}

fn fmt_opt<T: std::fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| PLACEHOLDER.to_string())
}

/// Renders the v2 `_state.md` layout.
pub fn render_record(record: &AgentRecord) -> String {
    format!(
        "# {agent} ground state [read-only]\n\
         # format_version: {version}\n\
         # Maintained by the warden engine. Read for ground truth; do not edit by hand.\n\
         \n\
         ## Commit Activity\n\
         last_read_commit: {last_read}\n\
         last_read_at: {last_read_at}\n\
         last_write_commit: {last_write}\n\
         last_write_at: {last_write_at}\n\
         unread_count: {unread}\n\
         \n\
         ## Context Window\n\
         session_id: {session}\n\
         context_tokens: {tokens}\n\
         max_context_tokens: {max_tokens}\n\
         context_percent: {percent}\n\
         updated_at: {updated}\n\
         \n\
         ## Last Observed State\n\
         state: {state}\n\
         thread: {thread}\n\
         entered_at: {entered}\n\
         context_tokens_at_entry: {at_entry}\n\
         expected_next_state: {expected}\n",
        agent = record.agent_id.to_uppercase(),
        version = STATE_FORMAT_VERSION,
        last_read = fmt_opt(&record.last_read_commit),
        last_read_at = fmt_time(record.last_read_at),
        last_write = fmt_opt(&record.last_write_commit),
        last_write_at = fmt_time(record.last_write_at),
        unread = record.unread_count,
        session = fmt_opt(&record.session_id),
        tokens = fmt_opt(&record.context_tokens),
        max_tokens = fmt_opt(&record.max_context_tokens),
        percent = fmt_opt(&record.context_percent),
        updated = fmt_time(record.updated_at),
        state = record.state,
        thread = fmt_opt(&record.thread),
        entered = fmt_time(record.entered_at),
        at_entry = record.context_tokens_at_entry,
        expected = fmt_opt(&record.expected_next_state.map(|s| s.to_string())),
    )
}

/// Parses `_state.md` content back into a record. Unknown keys and
/// placeholder/malformed values leave fields at their defaults.
pub fn parse_record(agent: &str, content: &str) -> AgentRecord {
    let mut record = AgentRecord::offline(agent);
    record.expected_next_state = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if value.is_empty() || value == PLACEHOLDER || value == "?" {
            continue;
        }

        match key {
            "last_read_commit" => record.last_read_commit = Some(value.to_string()),
            "last_read_at" => record.last_read_at = parse_time(value),
            "last_write_commit" => record.last_write_commit = Some(value.to_string()),
            "last_write_at" => record.last_write_at = parse_time(value),
            "unread_count" => record.unread_count = value.parse().unwrap_or(0),
            "session_id" => record.session_id = Some(value.to_string()),
            "context_tokens" => record.context_tokens = value.parse().ok(),
            "max_context_tokens" => record.max_context_tokens = value.parse().ok(),
            "context_percent" => {
                record.context_percent = value.trim_end_matches('%').parse().ok()
            }
            "updated_at" => record.updated_at = parse_time(value),
            "state" => {
                if let Some(state) = AgentState::parse(value) {
                    record.state = state;
                }
            }
            "thread" => {
                if value != "*" {
                    record.thread = Some(value.to_string());
                }
            }
            "entered_at" => record.entered_at = parse_time(value),
            "context_tokens_at_entry" => {
                record.context_tokens_at_entry = value.parse().unwrap_or(0)
            }
            "expected_next_state" => record.expected_next_state = AgentState::parse(value),
            _ => {} // Forward compatibility: ignore unknown keys.
        }
    }

    record
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
