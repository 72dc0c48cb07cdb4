//! Transcript parsing: lifecycle decisions, context usage, and agent
//! identity from append-only session JSONL files.
//!
//! Reads are tail-anchored (seek near EOF, bounded window) so parsing stays
//! O(1) in transcript length — transcripts grow without bound. Decision
//! extraction runs an ordered list of pluggable extractors, each returning
//! `None` rather than erroring, so new transcript dialects can be added
//! without touching the engine.
//!
//! Two entry shapes are tolerated:
//! - `{"type":"assistant","message":{"content":[{"type":"text","text":…}],"usage":{…}}}`
//! - `{"type":"message","role":"assistant","content":"…","usage":{…}}`

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use fs_err as fs;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{Result, WardenError};
use crate::types::{normalize_agent_id, AgentState, ContextUsage, LifecycleDecision};
use crate::types::DEFAULT_MAX_CONTEXT_TOKENS;

/// Bytes read from the end of a transcript when looking for recent turns.
pub const TAIL_WINDOW_BYTES: usize = 64 * 1024;

/// Bytes read from the start of a transcript for identity attribution.
pub const HEAD_WINDOW_BYTES: usize = 64 * 1024;

static STATE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)next_state:\s*([A-Za-z_-]+)").unwrap());
static THREAD_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)thread:\s*([^\n,]+)").unwrap());
static TOKENS_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)max_tokens:\s*(\d+)").unwrap());
static COMMIT_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:last_read_commit|last_read):\s*([a-f0-9]{7,40})").unwrap());
static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[a-zA-Z]*\s*\n?(.*?)\n?```").unwrap());
static DECISION_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^#{1,4}\s*.*\b(?:state decision|next state)\b.*$").unwrap());

// Identity markers, tried in order. The first capture is the agent name.
static IDENTITY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)@([A-Za-z][\w-]*)\.md agent").unwrap(),
        Regex::new(r"(?i)for agent @([A-Za-z][\w-]*)\.md").unwrap(),
        Regex::new(r"(?m)^@([A-Za-z][\w-]*)[:\s\[]").unwrap(),
    ]
});

/// One strategy for pulling a lifecycle decision out of message text.
/// Extractors never fail; "no match" is `None`.
pub trait DecisionExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, text: &str) -> Option<LifecycleDecision>;
}

/// Parses `key: value` lines out of a text block. Unknown or malformed keys
/// are ignored; a missing/unmappable `next_state` means no decision.
fn parse_decision_block(text: &str) -> Option<LifecycleDecision> {
    let state_name = STATE_KEY.captures(text)?.get(1)?.as_str();
    let next_state = AgentState::parse(state_name)?;

    let thread = THREAD_KEY
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|t| !t.is_empty() && t != "*");
    let max_tokens = TOKENS_KEY
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    let last_read_commit = COMMIT_KEY
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    Some(LifecycleDecision {
        next_state,
        thread,
        max_tokens,
        last_read_commit,
    })
}

/// Decision inside a fenced code block.
struct FencedBlockExtractor;

impl DecisionExtractor for FencedBlockExtractor {
    fn name(&self) -> &'static str {
        "fenced_block"
    }

    fn extract(&self, text: &str) -> Option<LifecycleDecision> {
        for caps in FENCED_BLOCK.captures_iter(text) {
            if let Some(decision) = caps.get(1).and_then(|m| parse_decision_block(m.as_str())) {
                return Some(decision);
            }
        }
        None
    }
}

/// `next_state:` key embedded anywhere in prose.
struct InlineKeyExtractor;

impl DecisionExtractor for InlineKeyExtractor {
    fn name(&self) -> &'static str {
        "inline_key"
    }

    fn extract(&self, text: &str) -> Option<LifecycleDecision> {
        parse_decision_block(text)
    }
}

/// Block introduced by a free-text heading ("## State Decision", "# Next
/// State"). The lines after the heading may be `key: value` pairs or lead
/// with a bare state name.
struct HeadingBlockExtractor;

impl DecisionExtractor for HeadingBlockExtractor {
    fn name(&self) -> &'static str {
        "heading_block"
    }

    fn extract(&self, text: &str) -> Option<LifecycleDecision> {
        let heading = DECISION_HEADING.find(text)?;
        let body = &text[heading.end()..];
        // Body ends at the next heading, if any.
        let body = match body.find("\n#") {
            Some(idx) => &body[..idx],
            None => body,
        };

        if let Some(decision) = parse_decision_block(body) {
            return Some(decision);
        }

        // Bare state name on the first non-empty line.
        let first = body.lines().find(|l| !l.trim().is_empty())?;
        let next_state = AgentState::parse(first.trim())?;
        Some(LifecycleDecision {
            next_state,
            thread: THREAD_KEY
                .captures(body)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|t| !t.is_empty() && t != "*"),
            max_tokens: None,
            last_read_commit: None,
        })
    }
}

/// The default extractor chain, in priority order. First match wins.
pub fn default_extractors() -> Vec<Box<dyn DecisionExtractor>> {
    vec![
        Box::new(FencedBlockExtractor),
        Box::new(InlineKeyExtractor),
        Box::new(HeadingBlockExtractor),
    ]
}

/// Parses one transcript's recent turns and usage figures.
pub struct TranscriptParser {
    extractors: Vec<Box<dyn DecisionExtractor>>,
    tail_window: usize,
}

impl Default for TranscriptParser {
    fn default() -> Self {
        TranscriptParser {
            extractors: default_extractors(),
            tail_window: TAIL_WINDOW_BYTES,
        }
    }
}

impl TranscriptParser {
    pub fn with_tail_window(tail_window: usize) -> Self {
        TranscriptParser {
            extractors: default_extractors(),
            tail_window,
        }
    }

    /// Most recent lifecycle decision authored by the agent itself, scanning
    /// backward from EOF. `Ok(None)` when the latest turns carry no decision.
    pub fn latest_decision(&self, path: &Path) -> Result<Option<LifecycleDecision>> {
        let tail = read_tail(path, self.tail_window)?;
        for line in tail.lines().rev() {
            let Some(entry) = parse_entry(line) else {
                continue;
            };
            let Some(text) = assistant_text(&entry) else {
                continue;
            };
            for extractor in &self.extractors {
                if let Some(decision) = extractor.extract(&text) {
                    tracing::debug!(
                        extractor = extractor.name(),
                        state = %decision.next_state,
                        "Extracted lifecycle decision"
                    );
                    return Ok(Some(decision));
                }
            }
        }
        Ok(None)
    }

    /// Most recent context-usage figures: every token-accounting field in
    /// the latest `usage` record summed as cumulative consumption.
    ///
    /// `max` falls back to [`DEFAULT_MAX_CONTEXT_TOKENS`]; callers that
    /// learned a budget hint from a decision substitute their own.
    pub fn latest_usage(&self, path: &Path) -> Result<Option<ContextUsage>> {
        let tail = read_tail(path, self.tail_window)?;
        for line in tail.lines().rev() {
            let Some(entry) = parse_entry(line) else {
                continue;
            };
            if let Some(used) = usage_total(&entry) {
                return Ok(Some(ContextUsage {
                    used,
                    max: DEFAULT_MAX_CONTEXT_TOKENS,
                }));
            }
        }
        Ok(None)
    }
}

/// Attributes a transcript to a known agent by scanning a bounded prefix for
/// identity markers. Returns the normalized agent id, or `None` when no
/// marker matches — attribution is conservative, never guessed.
pub fn identify_agent(path: &Path) -> Result<Option<String>> {
    let head = read_head(path, HEAD_WINDOW_BYTES)?;
    for line in head.lines() {
        let Some(entry) = parse_entry(line) else {
            continue;
        };
        let Some(text) = entry_text(&entry) else {
            continue;
        };
        for pattern in IDENTITY_PATTERNS.iter() {
            if let Some(caps) = pattern.captures(&text) {
                if let Some(name) = caps.get(1) {
                    return Ok(Some(normalize_agent_id(name.as_str())));
                }
            }
        }
    }
    Ok(None)
}

fn parse_entry(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Text content of an entry regardless of authorship.
fn entry_text(entry: &Value) -> Option<String> {
    let content = entry
        .get("content")
        .or_else(|| entry.pointer("/message/content"))?;
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let text: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(text.join("\n"))
            }
        }
        _ => None,
    }
}

/// Text of a turn authored by the agent itself; user/system turns yield `None`.
fn assistant_text(entry: &Value) -> Option<String> {
    let role = entry
        .get("role")
        .or_else(|| entry.pointer("/message/role"))
        .and_then(Value::as_str);
    let entry_type = entry.get("type").and_then(Value::as_str);
    let is_assistant =
        role == Some("assistant") || (role.is_none() && entry_type == Some("assistant"));
    if !is_assistant {
        return None;
    }
    entry_text(entry)
}

/// Sums the token-accounting fields of an entry's `usage` record.
/// The figure is cumulative context consumption, not a per-turn delta.
fn usage_total(entry: &Value) -> Option<u64> {
    let usage = entry
        .get("usage")
        .or_else(|| entry.pointer("/message/usage"))?
        .as_object()?;

    const FIELDS: [&str; 4] = [
        "input_tokens",
        "cache_creation_input_tokens",
        "cache_read_input_tokens",
        "output_tokens",
    ];
    let mut total = 0u64;
    let mut seen = false;
    for field in FIELDS {
        if let Some(value) = usage.get(field).and_then(Value::as_u64) {
            total = total.saturating_add(value);
            seen = true;
        }
    }
    if seen {
        return Some(total);
    }
    // Older logs carried only a pre-summed figure.
    usage.get("total_tokens").and_then(Value::as_u64)
}

fn read_tail(path: &Path, window: usize) -> Result<String> {
    let mut file = fs::File::open(path)
        .map_err(|e| WardenError::io(format!("open transcript {}", path.display()), e))?;
    let len = file
        .metadata()
        .map_err(|e| WardenError::io(format!("stat transcript {}", path.display()), e))?
        .len();
    let offset = len.saturating_sub(window as u64);
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| WardenError::io(format!("seek transcript {}", path.display()), e))?;
    let mut buf = Vec::with_capacity(window.min(len as usize));
    file.read_to_end(&mut buf)
        .map_err(|e| WardenError::io(format!("read transcript {}", path.display()), e))?;
    let text = String::from_utf8_lossy(&buf).into_owned();

    // A mid-file window almost certainly starts mid-line; drop the fragment.
    if offset > 0 {
        match text.find('\n') {
            Some(idx) => Ok(text[idx + 1..].to_string()),
            None => Ok(String::new()),
        }
    } else {
        Ok(text)
    }
}

fn read_head(path: &Path, window: usize) -> Result<String> {
    let file = fs::File::open(path)
        .map_err(|e| WardenError::io(format!("open transcript {}", path.display()), e))?;
    let mut buf = vec![0u8; window];
    let mut taken = file.take(window as u64);
    let mut read = 0;
    loop {
        match taken
            .read(&mut buf[read..])
            .map_err(|e| WardenError::io(format!("read transcript {}", path.display()), e))?
        {
            0 => break,
            n => read += n,
        }
    }
    buf.truncate(read);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
