//! Changelog and release pull request text.

use std::sync::LazyLock;

use camino::Utf8Path;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;

use super::{ReleaseError, ReleaseResult};
use crate::commit::{BREAKING_CHANGE_KEY, ConventionalCommit};
use crate::state::write_atomic;

/// Heading every changelog starts with.
const CHANGELOG_TITLE: &str = "# Changelog";

/// Section title and the commit types listed under it, in display order.
const SECTIONS: &[(&str, &[&str])] = &[
    ("Features", &["feat"]),
    ("Bug Fixes", &["fix"]),
    ("Performance Improvements", &["perf"]),
    ("Reverts", &["revert"]),
    ("Documentation", &["docs"]),
];

const BREAKING_TITLE: &str = "⚠ BREAKING CHANGES";
const MISC_TITLE: &str = "Miscellaneous";

static RELEASE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<details><summary>(?P<id>[^:<]+):\s*(?P<version>[^<]+?)</summary>(?P<notes>.*?)</details>")
        .expect("release block pattern compiles")
});

/// Markdown notes for a set of commits, grouped into sections.
///
/// `repo_url` (e.g. `https://github.com/o/r`) turns short SHAs into links.
pub fn render_notes(commits: &[ConventionalCommit], repo_url: Option<&str>) -> String {
    let mut out = String::new();

    let breaking: Vec<String> = commits
        .iter()
        .filter(|c| c.is_breaking)
        .map(|c| {
            let text = c
                .footers
                .get(BREAKING_CHANGE_KEY)
                .map_or(c.description.as_str(), String::as_str);
            entry(c, text, repo_url)
        })
        .collect();
    push_section(&mut out, BREAKING_TITLE, &breaking);

    for (title, types) in SECTIONS {
        let entries: Vec<String> = commits
            .iter()
            .filter(|c| types.iter().any(|t| c.commit_type.eq_ignore_ascii_case(t)))
            .map(|c| entry(c, &c.description, repo_url))
            .collect();
        push_section(&mut out, title, &entries);
    }

    let misc: Vec<String> = commits
        .iter()
        .filter(|c| c.is_releasable() && !is_listed_type(&c.commit_type))
        .map(|c| entry(c, &c.description, repo_url))
        .collect();
    push_section(&mut out, MISC_TITLE, &misc);

    out.trim_end().to_string()
}

fn is_listed_type(commit_type: &str) -> bool {
    SECTIONS
        .iter()
        .flat_map(|(_, types)| types.iter())
        .any(|t| commit_type.eq_ignore_ascii_case(t))
}

fn push_section(out: &mut String, title: &str, entries: &[String]) {
    if entries.is_empty() {
        return;
    }
    out.push_str(&format!("### {title}\n\n"));
    for e in entries {
        out.push_str(e);
        out.push('\n');
    }
    out.push('\n');
}

fn entry(commit: &ConventionalCommit, text: &str, repo_url: Option<&str>) -> String {
    let scope = commit
        .scope
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| format!("**{s}:** "))
        .unwrap_or_default();
    let short = commit.short_sha();
    let link = match repo_url {
        Some(url) => format!("[{short}]({}/commit/{})", url.trim_end_matches('/'), commit.sha),
        None => short.to_string(),
    };
    format!("* {scope}{text} ({link})")
}

/// A dated changelog section for one version.
pub fn changelog_section(version: &str, date: NaiveDate, notes: &str) -> String {
    let date = date.format("%Y-%m-%d");
    if notes.is_empty() {
        format!("## {version} ({date})\n")
    } else {
        format!("## {version} ({date})\n\n{notes}\n")
    }
}

/// Insert `section` at the top of the changelog at `path`, below its title.
///
/// A missing file is created with a title.
pub fn prepend_changelog(path: &Utf8Path, section: &str) -> ReleaseResult<()> {
    let existing = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(source) => {
            return Err(ReleaseError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let rest = existing
        .strip_prefix(CHANGELOG_TITLE)
        .map_or(existing.as_str(), str::trim_start);
    let mut updated = format!("{CHANGELOG_TITLE}\n\n{section}");
    if !rest.trim().is_empty() {
        updated.push('\n');
        updated.push_str(rest);
    }
    if !updated.ends_with('\n') {
        updated.push('\n');
    }
    write_atomic(path, updated.as_bytes())?;
    Ok(())
}

/// One library's entry in a release pull request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseEntry {
    /// Library ID.
    pub id: String,
    /// Version being released.
    pub version: String,
    /// Release notes.
    pub notes: String,
}

/// Title of a release pull request created at `now`.
pub fn pull_request_title(now: DateTime<Utc>) -> String {
    format!(
        "chore: librarian release pull request: {}",
        now.format("%Y%m%dT%H%M%SZ")
    )
}

/// Body of a release pull request: one collapsible block per library.
pub fn render_pull_request_body(image: &str, entries: &[ReleaseEntry]) -> String {
    let mut body = format!(
        "Librarian Version: {}\nLanguage Image: {image}\n",
        env!("CARGO_PKG_VERSION")
    );
    for e in entries {
        body.push_str(&format!(
            "\n<details><summary>{}: {}</summary>\n\n{}\n\n</details>\n",
            e.id,
            e.version,
            e.notes.trim()
        ));
    }
    body
}

/// Extract the library entries from a release pull request body.
pub fn parse_pull_request_body(body: &str) -> Vec<ReleaseEntry> {
    RELEASE_BLOCK
        .captures_iter(body)
        .map(|caps| ReleaseEntry {
            id: caps["id"].trim().to_string(),
            version: caps["version"].trim().to_string(),
            notes: caps["notes"].trim().to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::parse_commits;
    use tempfile::TempDir;

    fn commits(messages: &[(&str, &str)]) -> Vec<ConventionalCommit> {
        messages
            .iter()
            .flat_map(|(m, sha)| parse_commits(m, sha).unwrap())
            .collect()
    }

    #[test]
    fn groups_by_section() {
        let commits = commits(&[
            ("feat(storage): add buckets", "1111111aaaa"),
            ("fix: handle nil", "2222222bbbb"),
            ("chore: bump deps", "3333333cccc"),
            ("refactor: tidy", "4444444dddd"),
            (
                "feat!: drop v1\n\nBREAKING CHANGE: v1 surface removed",
                "5555555eeee",
            ),
        ]);
        let notes = render_notes(&commits, None);

        let breaking = notes.find("### ⚠ BREAKING CHANGES").unwrap();
        let features = notes.find("### Features").unwrap();
        let fixes = notes.find("### Bug Fixes").unwrap();
        assert!(breaking < features && features < fixes);
        assert!(notes.contains("* v1 surface removed (5555555)"));
        assert!(notes.contains("* **storage:** add buckets (1111111)"));
        assert!(notes.contains("### Miscellaneous\n\n* tidy (4444444)"));
        assert!(!notes.contains("bump deps"));
    }

    #[test]
    fn links_commits_when_repo_known() {
        let commits = commits(&[("fix: x", "abcdef0123")]);
        let notes = render_notes(&commits, Some("https://github.com/o/r/"));
        assert!(notes.contains("([abcdef0](https://github.com/o/r/commit/abcdef0123))"));
    }

    #[test]
    fn prepends_below_title() {
        let tmp = TempDir::new().unwrap();
        let path = camino::Utf8PathBuf::try_from(tmp.path().join("CHANGELOG.md")).unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();

        let first = changelog_section("1.0.0", date, "### Features\n\n* a (1)");
        prepend_changelog(&path, &first).unwrap();
        let second = changelog_section("1.1.0", date, "### Bug Fixes\n\n* b (2)");
        prepend_changelog(&path, &second).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# Changelog\n\n## 1.1.0 (2026-10-18)"));
        let newer = text.find("## 1.1.0").unwrap();
        let older = text.find("## 1.0.0").unwrap();
        assert!(newer < older);
        assert_eq!(text.matches("# Changelog").count(), 1);
    }

    #[test]
    fn pull_request_body_round_trips_entries() {
        let entries = vec![
            ReleaseEntry {
                id: "google-cloud-bar".into(),
                version: "0.2.0".into(),
                notes: "### Features\n\n* bar (1234567)".into(),
            },
            ReleaseEntry {
                id: "google-cloud-foo".into(),
                version: "1.3.0".into(),
                notes: "### Bug Fixes\n\n* foo (89abcde)".into(),
            },
        ];
        let body = render_pull_request_body("gcr.io/p/gen:1.0", &entries);
        assert!(body.contains("<details><summary>google-cloud-bar: 0.2.0</summary>"));
        assert_eq!(parse_pull_request_body(&body), entries);
    }

    #[test]
    fn body_without_blocks_has_no_entries() {
        assert!(parse_pull_request_body("just text").is_empty());
    }

    #[test]
    fn title_uses_utc_timestamp() {
        let now = DateTime::parse_from_rfc3339("2026-10-18T09:08:07Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            pull_request_title(now),
            "chore: librarian release pull request: 20261018T090807Z"
        );
    }
}
