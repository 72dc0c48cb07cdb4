//! # warden-core
//!
//! Core library for Warden: reconciles per-agent session transcripts and a
//! shared git commit log into per-agent ground-truth lifecycle records.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. The [`runtime`] module
//!   provides an opt-in background worker on plain std threads.
//! - **Single writer**: Only the reconciliation engine mutates a record;
//!   everything else reads snapshots or the persisted files.
//! - **Evidence over inference**: Lifecycle changes come from what agents
//!   actually wrote (transcript decisions, commit announcements), never from
//!   guessed activity.
//! - **Fail loud on identity**: Session attribution errors are fatal; a
//!   wrong guess would corrupt an agent's history.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use warden_core::{GitCommitLog, NoRestart, ReconcileEngine, WardenConfig};
//!
//! let config = WardenConfig::for_repo("/path/to/repo", vec!["gov".into()]);
//! let log = GitCommitLog::new(&config.repo_root);
//! let mut engine = ReconcileEngine::new(&config, Box::new(log), Box::new(NoRestart));
//! engine.poll_cycle()?;
//! let snapshot = engine.snapshot();
//! ```

// Public modules
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod gitlog;
pub mod runtime;
pub mod store;
pub mod transcript;
pub mod types;

// Re-export commonly used items at crate root
pub use config::{ErrorPolicy, WardenConfig};
pub use discovery::SessionDiscovery;
pub use engine::{EngineSnapshot, NoRestart, ReconcileEngine, RestartWorkflow};
pub use error::{Result, WardenError};
pub use gitlog::{CommitLog, GitCommitLog};
pub use runtime::EngineRuntime;
pub use store::StateStore;
pub use transcript::TranscriptParser;
pub use types::{
    AgentRecord, AgentState, CommitAnnouncement, CommitRef, ContextUsage, LifecycleDecision,
    SessionDescriptor,
};
