//! Conventional commit parsing.
//!
//! A single git commit can describe several logical changes. Besides the
//! usual `type(scope)!: description` header, body and footers, two block
//! syntaxes are understood:
//!
//! - `BEGIN_NESTED_COMMIT` / `END_NESTED_COMMIT` wrap an additional commit
//!   message. Each block becomes its own record.
//! - `BEGIN_COMMIT_OVERRIDE` / `END_COMMIT_OVERRIDE` wrap a message that
//!   replaces the surrounding one entirely. The override may itself contain
//!   nested commits.
//!
//! Markers only count when they occupy a whole line. Unbalanced markers are
//! kept as ordinary text.
//!
//! Parsing is tolerant: a part whose header is not conventional yields no
//! record and a warning, never an error.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const BEGIN_NESTED: &str = "BEGIN_NESTED_COMMIT";
const END_NESTED: &str = "END_NESTED_COMMIT";
const BEGIN_OVERRIDE: &str = "BEGIN_COMMIT_OVERRIDE";
const END_OVERRIDE: &str = "END_COMMIT_OVERRIDE";

/// The only footer key that marks a breaking change.
pub const BREAKING_CHANGE_KEY: &str = "BREAKING CHANGE";

static HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<type>[A-Za-z][A-Za-z0-9_-]*)(?:\((?P<scope>[^()\r\n]*)\))?(?P<breaking>!)?:\s+(?P<description>\S.*)$")
        .expect("header pattern compiles")
});

static FOOTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<key>BREAKING CHANGE|[A-Za-z][A-Za-z-]*):\s(?P<value>.*)$")
        .expect("footer pattern compiles")
});

/// Errors from commit parsing.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommitError {
    /// The message had no content.
    #[error("empty commit message")]
    Empty,
}

/// Result alias for commit parsing.
pub type CommitResult<T> = Result<T, CommitError>;

/// One logical change extracted from a commit message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConventionalCommit {
    /// Change type (`feat`, `fix`, ...).
    #[serde(rename = "type")]
    pub commit_type: String,
    /// Optional scope from `type(scope):`.
    pub scope: Option<String>,
    /// Text after the colon on the header line.
    pub description: String,
    /// Free-form body, trimmed.
    pub body: String,
    /// Footer entries keyed by footer name.
    pub footers: BTreeMap<String, String>,
    /// Set by `!` in the header or a `BREAKING CHANGE` footer.
    pub is_breaking: bool,
    /// Hash of the git commit this record came from.
    pub sha: String,
}

impl ConventionalCommit {
    /// First seven characters of the commit hash.
    pub fn short_sha(&self) -> &str {
        self.sha.get(..7).unwrap_or(&self.sha)
    }

    /// Whether this record should trigger a release on its own.
    ///
    /// Maintenance types never do unless they are breaking.
    pub fn is_releasable(&self) -> bool {
        self.is_breaking
            || !matches!(
                self.commit_type.to_ascii_lowercase().as_str(),
                "chore" | "ci" | "build" | "test" | "style"
            )
    }
}

/// Parse a raw commit message into conventional commit records.
///
/// Returns an error only for an empty message. A message with no
/// conventional header yields an empty list.
pub fn parse_commits(message: &str, sha: &str) -> CommitResult<Vec<ConventionalCommit>> {
    if message.trim().is_empty() {
        return Err(CommitError::Empty);
    }

    let mut records = Vec::new();
    for part in split_nested(message) {
        let parts = match extract_override(&part) {
            Some(replacement) => split_nested(&replacement),
            None => vec![part],
        };
        for part in parts {
            match parse_part(&part, sha) {
                Some(record) => records.push(record),
                None => warn!(
                    sha,
                    header = part.lines().next().unwrap_or_default(),
                    "skipping commit without a conventional header"
                ),
            }
        }
    }
    Ok(records)
}

/// Split a message into the outer message followed by each nested block.
fn split_nested(message: &str) -> Vec<String> {
    let lines: Vec<&str> = message.lines().collect();
    let mut outer: Vec<&str> = Vec::new();
    let mut nested: Vec<String> = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        if lines[i].trim() == BEGIN_NESTED
            && let Some(len) = block_len(&lines[i + 1..], BEGIN_NESTED, END_NESTED)
        {
            nested.push(lines[i + 1..i + 1 + len].join("\n"));
            i += len + 2;
            continue;
        }
        outer.push(lines[i]);
        i += 1;
    }

    let outer = outer.join("\n");
    let mut parts = Vec::with_capacity(nested.len() + 1);
    if !outer.trim().is_empty() {
        parts.push(outer);
    }
    parts.extend(nested.into_iter().filter(|p| !p.trim().is_empty()));
    parts
}

/// Number of lines before the closing marker, if the block is well formed.
///
/// A second opening marker before the close makes the block malformed.
fn block_len(lines: &[&str], begin: &str, end: &str) -> Option<usize> {
    for (idx, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line == end {
            return Some(idx);
        }
        if line == begin {
            return None;
        }
    }
    None
}

fn extract_override(part: &str) -> Option<String> {
    let lines: Vec<&str> = part.lines().collect();
    let start = lines.iter().position(|l| l.trim() == BEGIN_OVERRIDE)?;
    let len = block_len(&lines[start + 1..], BEGIN_OVERRIDE, END_OVERRIDE)?;
    Some(lines[start + 1..start + 1 + len].join("\n"))
}

fn parse_part(part: &str, sha: &str) -> Option<ConventionalCommit> {
    let trimmed = part.trim();
    let mut lines = trimmed.lines();
    let header = lines.next()?.trim();
    let caps = HEADER.captures(header)?;

    let rest: Vec<&str> = lines.collect();
    let (body, footers) = split_body_and_footers(&rest);

    let is_breaking =
        caps.name("breaking").is_some() || footers.contains_key(BREAKING_CHANGE_KEY);

    Some(ConventionalCommit {
        commit_type: caps["type"].to_string(),
        scope: caps
            .name("scope")
            .map(|s| s.as_str().trim().to_string())
            .filter(|s| !s.is_empty()),
        description: caps["description"].trim().to_string(),
        body,
        footers,
        is_breaking,
        sha: sha.to_string(),
    })
}

fn split_body_and_footers(lines: &[&str]) -> (String, BTreeMap<String, String>) {
    let mut body: Vec<&str> = Vec::new();
    let mut footers: Vec<(String, String)> = Vec::new();
    let mut in_footers = false;

    for (idx, line) in lines.iter().enumerate() {
        if in_footers {
            if let Some(caps) = FOOTER.captures(line) {
                footers.push((caps["key"].to_string(), caps["value"].to_string()));
            } else if !line.trim().is_empty()
                && let Some((_, value)) = footers.last_mut()
            {
                value.push('\n');
                value.push_str(line);
            }
            continue;
        }

        if line.trim().is_empty() && next_non_blank_is_footer(&lines[idx + 1..]) {
            in_footers = true;
            continue;
        }
        body.push(line);
    }

    let footers = footers
        .into_iter()
        .map(|(key, value)| (key, value.trim().to_string()))
        .collect();
    (body.join("\n").trim().to_string(), footers)
}

fn next_non_blank_is_footer(lines: &[&str]) -> bool {
    lines
        .iter()
        .find(|line| !line.trim().is_empty())
        .is_some_and(|line| FOOTER.is_match(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

    fn parse(message: &str) -> Vec<ConventionalCommit> {
        parse_commits(message, SHA).unwrap()
    }

    #[test]
    fn simple_header() {
        let commits = parse("feat(parser): add a thing");
        assert_eq!(commits.len(), 1);
        let c = &commits[0];
        assert_eq!(c.commit_type, "feat");
        assert_eq!(c.scope.as_deref(), Some("parser"));
        assert_eq!(c.description, "add a thing");
        assert!(c.body.is_empty());
        assert!(!c.is_breaking);
        assert_eq!(c.sha, SHA);
    }

    #[test]
    fn header_without_scope() {
        let commits = parse("fix: handle empty input");
        assert_eq!(commits[0].scope, None);
        assert_eq!(commits[0].description, "handle empty input");
    }

    #[test]
    fn empty_message_is_error() {
        assert_eq!(parse_commits("   \n\t", SHA), Err(CommitError::Empty));
    }

    #[test]
    fn non_conventional_header_yields_nothing() {
        assert!(parse("Update README.md").is_empty());
        assert!(parse("feat add thing").is_empty());
    }

    #[test]
    fn bang_marks_breaking() {
        let commits = parse("feat(api)!: drop v1 endpoints");
        assert!(commits[0].is_breaking);
    }

    #[test]
    fn breaking_change_footer_must_be_exact() {
        let exact = parse("fix: thing\n\nBREAKING CHANGE: foo");
        assert!(exact[0].is_breaking);
        assert_eq!(exact[0].footers[BREAKING_CHANGE_KEY], "foo");

        let wrong_case = parse("fix: thing\n\nBreaking change: foo");
        assert!(!wrong_case[0].is_breaking);
        assert_eq!(wrong_case[0].body, "Breaking change: foo");
        assert!(wrong_case[0].footers.is_empty());
    }

    #[test]
    fn nested_commits_produce_separate_records() {
        let message = "feat(parser): main feature
main commit body

BEGIN_NESTED_COMMIT
fix(sub): fix a bug

some details for the fix
END_NESTED_COMMIT
";
        let commits = parse(message);
        assert_eq!(commits.len(), 2);

        assert_eq!(commits[0].commit_type, "feat");
        assert_eq!(commits[0].scope.as_deref(), Some("parser"));
        assert_eq!(commits[0].description, "main feature");
        assert_eq!(commits[0].body, "main commit body");

        assert_eq!(commits[1].commit_type, "fix");
        assert_eq!(commits[1].scope.as_deref(), Some("sub"));
        assert_eq!(commits[1].description, "fix a bug");
        assert_eq!(commits[1].body, "some details for the fix");

        assert!(commits.iter().all(|c| c.sha == SHA));
    }

    #[test]
    fn unterminated_nested_block_is_plain_text() {
        let message = "feat: outer\n\nBEGIN_NESTED_COMMIT\nfix: inner";
        let commits = parse(message);
        assert_eq!(commits.len(), 1);
        assert!(commits[0].body.contains("BEGIN_NESTED_COMMIT"));
        assert!(commits[0].body.contains("fix: inner"));
    }

    #[test]
    fn reversed_nested_markers_are_plain_text() {
        let message = "feat: outer\n\nEND_NESTED_COMMIT\nfix: inner\nBEGIN_NESTED_COMMIT";
        let commits = parse(message);
        assert_eq!(commits.len(), 1);
        assert!(commits[0].body.starts_with("END_NESTED_COMMIT"));
    }

    #[test]
    fn markers_must_be_whole_lines() {
        let message = "feat: outer\n\nsee BEGIN_NESTED_COMMIT docs\nfix: x\nEND_NESTED_COMMIT";
        let commits = parse(message);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].commit_type, "feat");
    }

    #[test]
    fn override_replaces_outer_commit() {
        let message = "chore: sync from upstream

BEGIN_COMMIT_OVERRIDE
feat(storage): add object retention

Retention policies are now configurable.
END_COMMIT_OVERRIDE
";
        let commits = parse(message);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].commit_type, "feat");
        assert_eq!(commits[0].scope.as_deref(), Some("storage"));
        assert_eq!(commits[0].body, "Retention policies are now configurable.");
    }

    #[test]
    fn override_may_contain_nested_commits() {
        let message = "chore: ignored outer

BEGIN_COMMIT_OVERRIDE
feat: replacement
BEGIN_NESTED_COMMIT
fix: nested inside override
END_NESTED_COMMIT
END_COMMIT_OVERRIDE
";
        let commits = parse(message);
        let types: Vec<_> = commits.iter().map(|c| c.commit_type.as_str()).collect();
        assert_eq!(types, ["feat", "fix"]);
        assert_eq!(commits[1].description, "nested inside override");
    }

    #[test]
    fn blank_line_without_footer_stays_in_body() {
        let commits = parse("fix: x\n\nfirst paragraph\n\nsecond paragraph");
        assert_eq!(commits[0].body, "first paragraph\n\nsecond paragraph");
        assert!(commits[0].footers.is_empty());
    }

    #[test]
    fn footers_follow_body_paragraphs() {
        let message = "feat: x

first paragraph

second paragraph

Reviewed-by: Someone
PiperOrigin-RevId: 12345";
        let commits = parse(message);
        assert_eq!(commits[0].body, "first paragraph\n\nsecond paragraph");
        assert_eq!(commits[0].footers["Reviewed-by"], "Someone");
        assert_eq!(commits[0].footers["PiperOrigin-RevId"], "12345");
    }

    #[test]
    fn multi_line_footer_values() {
        let message = "feat!: new client surface

BREAKING CHANGE: the old constructor is gone
use Client::builder instead
Source-Link: https://example.com/abc";
        let commits = parse(message);
        let c = &commits[0];
        assert!(c.is_breaking);
        assert_eq!(
            c.footers[BREAKING_CHANGE_KEY],
            "the old constructor is gone\nuse Client::builder instead"
        );
        assert_eq!(c.footers["Source-Link"], "https://example.com/abc");
    }

    #[test]
    fn parsing_is_deterministic() {
        let message = "feat(a): one\n\nbody\n\nBEGIN_NESTED_COMMIT\nfix(b): two\nEND_NESTED_COMMIT";
        assert_eq!(parse(message), parse(message));
    }

    #[test]
    fn malformed_nested_part_is_dropped_without_error() {
        let message = "feat: good\n\nBEGIN_NESTED_COMMIT\nnot conventional\nEND_NESTED_COMMIT";
        let commits = parse(message);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].description, "good");
    }

    #[test]
    fn releasable_types() {
        let chore = &parse("chore: bump deps")[0];
        assert!(!chore.is_releasable());
        let breaking_chore = &parse("chore!: drop python 3.8")[0];
        assert!(breaking_chore.is_releasable());
        let docs = &parse("docs: fix typo")[0];
        assert!(docs.is_releasable());
    }

    #[test]
    fn short_sha() {
        assert_eq!(parse("fix: x")[0].short_sha(), "0123456");
    }
}
