//! Commit and pull request text for generate runs.

use std::ops::ControlFlow;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::git::{GitError, Repo};
use crate::state::LibraryState;

/// Messages of the API source commits since the library was last generated,
/// newest first.
///
/// Only commits touching the library's API paths count. An unknown base
/// commit (for example in a shallow checkout) yields no messages.
pub fn upstream_messages(api_repo: &Repo, library: &LibraryState, head: &str) -> Vec<String> {
    let Some(ref last) = library.last_generated_commit else {
        return Vec::new();
    };
    if last == head {
        return Vec::new();
    }
    let paths: Vec<String> = library.apis.iter().map(|a| a.path.clone()).collect();
    let mut messages = Vec::new();
    let walked = api_repo.walk_log::<_, GitError>(&format!("{last}..{head}"), &paths, |sha| {
        messages.push(api_repo.commit_message(sha)?.trim().to_string());
        Ok(ControlFlow::Continue(()))
    });
    match walked {
        Ok(()) => {
            debug!(library = %library.id, count = messages.len(), "upstream commits collected");
            messages
        }
        Err(err) => {
            warn!(library = %library.id, error = %err, "cannot read API source history");
            Vec::new()
        }
    }
}

/// Commit message for regenerating `library_id`.
///
/// Upstream messages are carried as nested commits so that release notes
/// see the API changes rather than the regeneration itself.
pub fn commit_message(
    library_id: &str,
    api_label: &str,
    api_commit: Option<&str>,
    upstream: &[String],
) -> String {
    let mut message = format!("chore: regenerate {library_id}\n\n");
    match api_commit {
        Some(commit) => message.push_str(&format!("Generated from {api_label} at {commit}.\n")),
        None => message.push_str(&format!("Generated from {api_label}.\n")),
    }
    for upstream in upstream {
        message.push_str(&format!(
            "\nBEGIN_NESTED_COMMIT\n{upstream}\nEND_NESTED_COMMIT\n"
        ));
    }
    message
}

/// Title of a generate pull request created at `now`.
pub fn pull_request_title(now: DateTime<Utc>) -> String {
    format!(
        "chore: librarian generate pull request: {}",
        now.format("%Y%m%dT%H%M%SZ")
    )
}

/// Body of a generate pull request listing the regenerated libraries.
pub fn pull_request_body(
    image: &str,
    api_label: &str,
    api_commit: Option<&str>,
    libraries: &[String],
) -> String {
    let mut body = format!(
        "Librarian Version: {}\nLanguage Image: {image}\nAPI Source: {api_label}",
        env!("CARGO_PKG_VERSION")
    );
    if let Some(commit) = api_commit {
        body.push_str(&format!(" at {commit}"));
    }
    body.push_str("\n\nRegenerated libraries:\n\n");
    for id in libraries {
        body.push_str(&format!("* {id}\n"));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::parse_commits;
    use crate::git::testing::TestRepo;
    use crate::state::Api;

    #[test]
    fn nested_upstream_commits_parse_back() {
        let upstream = vec![
            "feat: add Foo.Bar method\n\nPiperOrigin-RevId: 1".to_string(),
            "fix: correct docs".to_string(),
        ];
        let message =
            commit_message("foo", "github.com/googleapis/googleapis", Some("abc"), &upstream);
        let commits = parse_commits(&message, "1234567").unwrap();
        let types: Vec<&str> = commits.iter().map(|c| c.commit_type.as_str()).collect();
        assert_eq!(types, ["chore", "feat", "fix"]);
        assert!(message.contains("Generated from github.com/googleapis/googleapis at abc."));
    }

    #[test]
    fn collects_commits_touching_library_apis() {
        let Some(apis) = TestRepo::new() else { return };
        let base = apis.commit("chore: init", &[("google/foo/v1/a.proto", "1")]);
        apis.commit("feat: bar change", &[("google/bar/v1/a.proto", "1")]);
        let head = apis.commit("feat: foo change", &[("google/foo/v1/a.proto", "2")]);

        let library = LibraryState {
            id: "foo".into(),
            last_generated_commit: Some(base),
            apis: vec![Api {
                path: "google/foo/v1".into(),
                service_config: String::new(),
            }],
            ..Default::default()
        };
        assert_eq!(upstream_messages(&apis.repo, &library, &head), ["feat: foo change"]);
    }

    #[test]
    fn unknown_base_yields_nothing() {
        let Some(apis) = TestRepo::new() else { return };
        let head = apis.commit("feat: one", &[("google/foo/v1/a.proto", "1")]);
        let library = LibraryState {
            id: "foo".into(),
            last_generated_commit: Some("0000000000000000000000000000000000000000".into()),
            ..Default::default()
        };
        assert!(upstream_messages(&apis.repo, &library, &head).is_empty());
    }

    #[test]
    fn body_lists_libraries() {
        let body = pull_request_body(
            "gcr.io/p/gen:1.0",
            "googleapis",
            Some("abc"),
            &["bar".into(), "foo".into()],
        );
        assert!(body.contains("API Source: googleapis at abc"));
        assert!(body.ends_with("* bar\n* foo\n"));
    }
}
