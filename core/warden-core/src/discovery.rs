//! Session discovery: maps each known agent to exactly one current
//! transcript via a stable symlink alias (`<agent>-current.jsonl`).
//!
//! The alias set is configuration: a missing alias is a fatal setup error
//! (the system never invents agent identities), and a transcript newer than
//! every alias that cannot be attributed to a known agent by content raises
//! rather than being guessed at. A wrong auto-association would silently
//! corrupt an agent's lifecycle history; we trade automation for
//! correctness.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Duration, Utc};
use fs_err as fs;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{Result, WardenError};
use crate::transcript::identify_agent;
use crate::types::{SessionDescriptor, DEFAULT_QUIESCENCE_SECS};

pub struct SessionDiscovery {
    sessions_dir: PathBuf,
    quiescence: Duration,
}

impl SessionDiscovery {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        SessionDiscovery {
            sessions_dir: sessions_dir.into(),
            quiescence: Duration::seconds(DEFAULT_QUIESCENCE_SECS),
        }
    }

    pub fn with_quiescence(mut self, quiescence: Duration) -> Self {
        self.quiescence = quiescence;
        self
    }

    pub fn alias_path(&self, agent: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}-current.jsonl", agent))
    }

    /// Resolves every known agent's alias, then reconciles transcripts newer
    /// than all of them (auto-repointing on successful attribution).
    ///
    /// Fatal outcomes: missing alias, alias with a missing target, or one or
    /// more newer transcripts that no identity marker claims.
    pub fn resolve_all(&self, agents: &[String]) -> Result<BTreeMap<String, SessionDescriptor>> {
        let mut sessions = BTreeMap::new();
        for agent in agents {
            sessions.insert(agent.clone(), self.resolve_alias(agent)?);
        }
        self.reconcile_newer_files(agents, &mut sessions)?;
        Ok(sessions)
    }

    /// Resolves one agent's alias into a session descriptor.
    pub fn resolve_alias(&self, agent: &str) -> Result<SessionDescriptor> {
        let alias = self.alias_path(agent);
        let target = match fs::read_link(&alias) {
            Ok(target) => target,
            Err(_) => {
                return Err(WardenError::MissingAlias {
                    agent: agent.to_string(),
                    path: alias,
                })
            }
        };
        let resolved = if target.is_absolute() {
            target
        } else {
            self.sessions_dir.join(target)
        };

        let metadata = fs::metadata(&resolved).map_err(|_| WardenError::BrokenAlias {
            agent: agent.to_string(),
            target: resolved.clone(),
        })?;

        let modified_at = system_time_to_utc(metadata.modified().map_err(|e| {
            WardenError::io(format!("mtime of {}", resolved.display()), e)
        })?);

        Ok(SessionDescriptor {
            session_id: session_id_of(&resolved),
            path: resolved,
            modified_at,
            is_quiescent: Utc::now() - modified_at > self.quiescence,
        })
    }

    /// Scans for transcripts newer than every resolved alias and attributes
    /// them by content inspection. Attributed files repoint that agent's
    /// alias; anything unattributed is a hard error.
    fn reconcile_newer_files(
        &self,
        agents: &[String],
        sessions: &mut BTreeMap<String, SessionDescriptor>,
    ) -> Result<()> {
        let newest_known = sessions.values().map(|s| s.modified_at).max();
        let Some(newest_known) = newest_known else {
            return Ok(());
        };

        let mut unattributed = Vec::new();
        for entry in WalkDir::new(&self.sessions_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if entry.path_is_symlink()
                || !entry.file_type().is_file()
                || path.extension().map(|e| e != "jsonl").unwrap_or(true)
            {
                continue;
            }
            let Ok(metadata) = fs::metadata(path) else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let modified_at = system_time_to_utc(modified);
            if modified_at <= newest_known {
                continue;
            }
            // Already mapped to someone? Then it is not a stray.
            if sessions.values().any(|s| s.path == path) {
                continue;
            }

            match identify_agent(path)? {
                Some(agent) if agents.contains(&agent) => {
                    self.repoint_alias(&agent, path)?;
                    sessions.insert(
                        agent.clone(),
                        SessionDescriptor {
                            session_id: session_id_of(path),
                            path: path.to_path_buf(),
                            modified_at,
                            is_quiescent: Utc::now() - modified_at > self.quiescence,
                        },
                    );
                }
                Some(agent) => {
                    warn!(agent, path = %path.display(), "Transcript claims unknown agent");
                    unattributed.push(path.to_path_buf());
                }
                None => unattributed.push(path.to_path_buf()),
            }
        }

        if !unattributed.is_empty() {
            return Err(WardenError::UnattributedSessions {
                files: unattributed,
            });
        }
        Ok(())
    }

    fn repoint_alias(&self, agent: &str, target: &Path) -> Result<()> {
        let alias = self.alias_path(agent);
        let link_target = target
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| target.to_path_buf());

        if fs::symlink_metadata(&alias).is_ok() {
            fs::remove_file(&alias)
                .map_err(|e| WardenError::io(format!("remove alias {}", alias.display()), e))?;
        }
        std::os::unix::fs::symlink(&link_target, &alias)
            .map_err(|e| WardenError::io(format!("create alias {}", alias.display()), e))?;
        info!(
            agent,
            target = %link_target.display(),
            "Repointed session alias to newer transcript"
        );
        Ok(())
    }
}

fn session_id_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}
