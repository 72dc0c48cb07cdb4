//! Commit Activity Reader: the shared git log as a secondary communication
//! channel between agents.
//!
//! Subjects follow the convention `@AGENT [state[/thread]]: message` for
//! lifecycle announcements and `@AGENT: message` for plain traffic; any
//! `@AGENT` or `@ALL` token inside a subject counts as a mention. Unread
//! counting is a set-difference over subjects — a heuristic proxy for
//! "messages the agent has not yet seen", not delivery tracking.
//!
//! [`CommitLog`] is the seam; the engine only ever talks to the trait so
//! tests can substitute an in-memory log.

use std::path::PathBuf;
use std::process::Command;

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, WardenError};
use crate::types::{normalize_agent_id, AgentState, CommitAnnouncement, CommitRef};

static ANNOUNCEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^@([A-Za-z][\w-]*)\s*\[([A-Za-z_-]+)(?:/([^\]]+))?\]\s*:").unwrap()
});
static LEADING_AUTHOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^@([A-Za-z][\w-]*)\s*[\[:]").unwrap());
static MENTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"@([A-Za-z][\w-]*)").unwrap());

/// Commits scanned when a record has no acknowledgment boundary yet.
/// An announcement older than this goes unnoticed until the agent
/// announces again.
pub const BOOTSTRAP_SCAN_LIMIT: usize = 50;

/// Read-only view of the shared commit log.
pub trait CommitLog: Send + Sync {
    /// Current tip of the log, if any commits exist.
    fn head(&self) -> Result<Option<String>>;

    /// The agent's own most recent commit.
    fn last_authored_commit(&self, agent: &str) -> Result<Option<CommitRef>>;

    /// Newest lifecycle announcement by the agent after `since`. With no
    /// boundary, implementations may bound the scan to recent history
    /// ([`BOOTSTRAP_SCAN_LIMIT`] commits for the git-backed log).
    fn latest_announcement(
        &self,
        agent: &str,
        since: Option<&str>,
    ) -> Result<Option<CommitAnnouncement>>;

    /// Commits after `since` that mention the agent (or `@ALL`), excluding
    /// the agent's own commits. No boundary means nothing is counted yet.
    fn unread_count(&self, agent: &str, since: Option<&str>) -> Result<u32>;

    fn commit_time(&self, id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Whether `old` is an ancestor of `new`; guards the forward-only
    /// acknowledgment invariant.
    fn is_ancestor(&self, old: &str, new: &str) -> Result<bool>;
}

/// Parses a lifecycle announcement out of a commit subject, if the subject
/// belongs to `agent` and carries a recognizable state tag.
pub fn parse_announcement(agent: &str, hash: &str, subject: &str) -> Option<CommitAnnouncement> {
    let caps = ANNOUNCEMENT.captures(subject)?;
    let author = normalize_agent_id(caps.get(1)?.as_str());
    if author != normalize_agent_id(agent) {
        return None;
    }
    let state = AgentState::parse(caps.get(2)?.as_str())?;
    let thread = caps
        .get(3)
        .map(|m| m.as_str().trim().to_string())
        .filter(|t| !t.is_empty());
    Some(CommitAnnouncement {
        state,
        thread,
        commit: hash.to_string(),
        subject: subject.to_string(),
    })
}

/// Whether a subject is authored by the agent (`@AGENT:` / `@AGENT [...]`).
pub fn is_authored_by(agent: &str, subject: &str) -> bool {
    LEADING_AUTHOR
        .captures(subject)
        .and_then(|c| c.get(1))
        .map(|m| normalize_agent_id(m.as_str()) == normalize_agent_id(agent))
        .unwrap_or(false)
}

/// Whether a subject mentions the agent by name or via the broadcast tag.
pub fn mentions_agent(agent: &str, subject: &str) -> bool {
    let agent = normalize_agent_id(agent);
    MENTION.captures_iter(subject).any(|caps| {
        caps.get(1)
            .map(|m| {
                let name = normalize_agent_id(m.as_str());
                name == agent || name == "all"
            })
            .unwrap_or(false)
    })
}

/// One `%H|%ct|%s` line from `git log`.
fn parse_log_line(line: &str) -> Option<(String, DateTime<Utc>, String)> {
    let mut parts = line.splitn(3, '|');
    let hash = parts.next()?.trim();
    let epoch: i64 = parts.next()?.trim().parse().ok()?;
    let subject = parts.next().unwrap_or("").trim();
    if hash.is_empty() {
        return None;
    }
    let timestamp = Utc.timestamp_opt(epoch, 0).single()?;
    Some((hash.to_string(), timestamp, subject.to_string()))
}

/// Commit log backed by a real git repository, queried via the `git` CLI.
#[derive(Debug, Clone)]
pub struct GitCommitLog {
    repo_root: PathBuf,
}

impl GitCommitLog {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        GitCommitLog {
            repo_root: repo_root.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .current_dir(&self.repo_root)
            .args(args)
            .output()
            .map_err(|e| WardenError::io(format!("spawn git {:?}", args), e))?;
        if !output.status.success() {
            return Err(WardenError::CommitLog {
                context: format!("git {}", args.join(" ")),
                details: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// `since..HEAD` when a boundary exists, otherwise the most recent
    /// [`BOOTSTRAP_SCAN_LIMIT`] commits.
    fn log_lines(&self, since: Option<&str>) -> Result<Vec<(String, DateTime<Utc>, String)>> {
        let range;
        let mut args = vec!["log", "--pretty=format:%H|%ct|%s"];
        match since {
            Some(boundary) => {
                range = format!("{}..HEAD", boundary);
                args.push(&range);
            }
            None => {
                range = format!("-{}", BOOTSTRAP_SCAN_LIMIT);
                args.push(&range);
            }
        }
        let stdout = self.run(&args)?;
        Ok(stdout.lines().filter_map(parse_log_line).collect())
    }
}

impl CommitLog for GitCommitLog {
    fn head(&self) -> Result<Option<String>> {
        let output = Command::new("git")
            .current_dir(&self.repo_root)
            .args(["rev-parse", "--verify", "-q", "HEAD"])
            .output()
            .map_err(|e| WardenError::io("spawn git rev-parse", e))?;
        if !output.status.success() {
            // Empty repository: no tip yet.
            return Ok(None);
        }
        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!hash.is_empty()).then_some(hash))
    }

    fn last_authored_commit(&self, agent: &str) -> Result<Option<CommitRef>> {
        // --grep prefilters, but it matches anywhere in the message body
        // (a commit quoting "@AGENT: …" matches too), so list every hit
        // and take the newest whose subject carries the author tag.
        let pattern = format!("^@{}[ :\\[]", normalize_agent_id(agent));
        let stdout = self.run(&[
            "log",
            "-E",
            "--regexp-ignore-case",
            "--pretty=format:%H|%ct|%s",
            "--grep",
            &pattern,
        ])?;
        for (hash, timestamp, subject) in stdout.lines().filter_map(parse_log_line) {
            if is_authored_by(agent, &subject) {
                return Ok(Some(CommitRef { hash, timestamp }));
            }
        }
        Ok(None)
    }

    fn latest_announcement(
        &self,
        agent: &str,
        since: Option<&str>,
    ) -> Result<Option<CommitAnnouncement>> {
        for (hash, _, subject) in self.log_lines(since)? {
            if let Some(announcement) = parse_announcement(agent, &hash, &subject) {
                return Ok(Some(announcement));
            }
        }
        Ok(None)
    }

    fn unread_count(&self, agent: &str, since: Option<&str>) -> Result<u32> {
        if since.is_none() {
            return Ok(0);
        }
        let mut count = 0u32;
        for (_, _, subject) in self.log_lines(since)? {
            if is_authored_by(agent, &subject) {
                continue;
            }
            if mentions_agent(agent, &subject) {
                count = count.saturating_add(1);
            }
        }
        Ok(count)
    }

    fn commit_time(&self, id: &str) -> Result<Option<DateTime<Utc>>> {
        let stdout = self.run(&["show", "-s", "--format=%ct", id])?;
        let epoch: i64 = match stdout.trim().parse() {
            Ok(value) => value,
            Err(_) => return Ok(None),
        };
        Ok(Utc.timestamp_opt(epoch, 0).single())
    }

    fn is_ancestor(&self, old: &str, new: &str) -> Result<bool> {
        let output = Command::new("git")
            .current_dir(&self.repo_root)
            .args(["merge-base", "--is-ancestor", old, new])
            .output()
            .map_err(|e| WardenError::io("spawn git merge-base", e))?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(WardenError::CommitLog {
                context: format!("git merge-base --is-ancestor {} {}", old, new),
                details: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_announcement_with_thread() {
        let ann = parse_announcement("era-1", "abc123", "@ERA-1 [deep_work/refactor]: starting")
            .unwrap();
        assert_eq!(ann.state, AgentState::DeepWork);
        assert_eq!(ann.thread.as_deref(), Some("refactor"));
        assert_eq!(ann.commit, "abc123");
    }

    #[test]
    fn test_parse_announcement_without_thread() {
        let ann = parse_announcement("gov", "def456", "@GOV [inbox]: catching up").unwrap();
        assert_eq!(ann.state, AgentState::Inbox);
        assert!(ann.thread.is_none());
    }

    #[test]
    fn test_parse_announcement_normalizes_state_names() {
        let ann = parse_announcement("gov", "a1", "@GOV [DEEP-WORK/x]: go").unwrap();
        assert_eq!(ann.state, AgentState::DeepWork);
    }

    #[test]
    fn test_announcement_for_other_agent_is_none() {
        assert!(parse_announcement("gov", "a1", "@ERA-1 [inbox]: hi").is_none());
    }

    #[test]
    fn test_plain_subject_is_not_announcement() {
        assert!(parse_announcement("gov", "a1", "@GOV: routine status update").is_none());
        assert!(parse_announcement("gov", "a1", "fix parser crash").is_none());
    }

    #[test]
    fn test_unknown_state_tag_is_not_announcement() {
        assert!(parse_announcement("gov", "a1", "@GOV [ascended]: hmm").is_none());
    }

    #[test]
    fn test_is_authored_by() {
        assert!(is_authored_by("era-1", "@ERA-1: my own commit"));
        assert!(is_authored_by("era-1", "@ERA-1 [inbox]: announce"));
        assert!(!is_authored_by("era-1", "@GOV: message for @ERA-1"));
        assert!(!is_authored_by("era-1", "plain subject"));
    }

    #[test]
    fn test_mentions_agent_by_name_and_broadcast() {
        assert!(mentions_agent("era-1", "@GOV: please review @ERA-1 output"));
        assert!(mentions_agent("era-1", "@GOV: heads up @ALL"));
        assert!(!mentions_agent("era-1", "@GOV: unrelated"));
    }

    #[test]
    fn test_mention_requires_full_token() {
        // "@allison" must not count as the @ALL broadcast.
        assert!(!mentions_agent("era-1", "@GOV: ping @allison about it"));
    }

    #[test]
    fn test_parse_log_line() {
        let (hash, ts, subject) =
            parse_log_line("deadbeef|1700000000|@GOV [idle]: winding down").unwrap();
        assert_eq!(hash, "deadbeef");
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(subject, "@GOV [idle]: winding down");
        assert!(parse_log_line("garbage").is_none());
    }

    // Tests below run against a throwaway git repository.

    use std::path::Path;
    use tempfile::tempdir;

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .current_dir(dir)
            .args(args)
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    fn commit(dir: &Path, subject: &str, body: Option<&str>) {
        let mut args = vec![
            "-c",
            "user.name=warden-test",
            "-c",
            "user.email=warden@test",
            "commit",
            "--allow-empty",
            "--no-gpg-sign",
            "-m",
            subject,
        ];
        if let Some(body) = body {
            args.push("-m");
            args.push(body);
        }
        git(dir, &args);
    }

    fn rev_parse(dir: &Path, rev: &str) -> String {
        let output = Command::new("git")
            .current_dir(dir)
            .args(["rev-parse", rev])
            .output()
            .unwrap();
        assert!(output.status.success());
        String::from_utf8(output.stdout).unwrap().trim().to_string()
    }

    #[test]
    fn test_last_authored_commit_ignores_body_quotes() {
        let temp = tempdir().unwrap();
        git(temp.path(), &["init", "-q"]);
        commit(temp.path(), "@ALPHA: landing the parser", None);
        // A later commit by another agent quoting alpha in its body must
        // not mask alpha's own newest commit.
        commit(
            temp.path(),
            "@GOV: forwarding notes",
            Some("@ALPHA: quoted line from alpha's report"),
        );

        let log = GitCommitLog::new(temp.path());
        let own = log.last_authored_commit("alpha").unwrap().unwrap();
        assert_eq!(own.hash, rev_parse(temp.path(), "HEAD~1"));
    }

    #[test]
    fn test_last_authored_commit_none_when_agent_never_committed() {
        let temp = tempdir().unwrap();
        git(temp.path(), &["init", "-q"]);
        commit(temp.path(), "@GOV: solo traffic", None);

        let log = GitCommitLog::new(temp.path());
        assert!(log.last_authored_commit("alpha").unwrap().is_none());
    }

    #[test]
    fn test_head_is_none_for_empty_repository() {
        let temp = tempdir().unwrap();
        git(temp.path(), &["init", "-q"]);
        let log = GitCommitLog::new(temp.path());
        assert!(log.head().unwrap().is_none());
    }
}
