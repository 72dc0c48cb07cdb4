//! Error types for warden-core operations.
//!
//! The taxonomy follows how the engine reacts: configuration and ambiguity
//! errors are fatal for the affected cycle, persistence errors propagate,
//! and transient parse gaps are `Ok(None)` at the parser level rather than
//! errors here.

use std::path::PathBuf;

/// All errors that can occur in warden-core operations.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors (fatal; remediation required)
    // ─────────────────────────────────────────────────────────────────────
    #[error(
        "Missing session alias for agent '{agent}': expected symlink at {path}. \
         Create it with: ln -s <session>.jsonl {path}"
    )]
    MissingAlias { agent: String, path: PathBuf },

    #[error("Session alias for agent '{agent}' points to missing transcript: {target}")]
    BrokenAlias { agent: String, target: PathBuf },

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Ambiguity Errors (fatal by design; never resolved by guessing)
    // ─────────────────────────────────────────────────────────────────────
    #[error("Unattributed transcript file(s) newer than all known aliases: {files:?}")]
    UnattributedSessions { files: Vec<PathBuf> },

    // ─────────────────────────────────────────────────────────────────────
    // State machine
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid transition for '{agent}': {from} -> {to}")]
    InvalidTransition {
        agent: String,
        from: crate::types::AgentState,
        to: crate::types::AgentState,
    },

    // ─────────────────────────────────────────────────────────────────────
    // I/O and external collaborators
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transcript parse error: {path}: {details}")]
    Transcript { path: PathBuf, details: String },

    #[error("Commit log query failed: {context}: {details}")]
    CommitLog { context: String, details: String },

    #[error("State persistence failed for '{agent}': {details}")]
    Persist { agent: String, details: String },
}

impl WardenError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        WardenError::Io {
            context: context.into(),
            source,
        }
    }

    /// True for errors that must abort the whole poll cycle regardless of
    /// error policy (missing/broken aliases, unattributed transcripts).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WardenError::MissingAlias { .. }
                | WardenError::BrokenAlias { .. }
                | WardenError::UnattributedSessions { .. }
        )
    }
}

/// Convenience type alias for Results using WardenError.
pub type Result<T> = std::result::Result<T, WardenError>;
