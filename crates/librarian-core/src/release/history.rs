//! Commit history since a library's last release.

use std::ops::ControlFlow;

use tracing::{debug, instrument, warn};

use super::{ReleaseError, ReleaseResult};
use crate::commit::{ConventionalCommit, parse_commits};
use crate::git::Repo;
use crate::state::{LibraryState, path_is_under};

/// Conventional commits that touched `library` since its last release,
/// newest first.
///
/// A library without a version has never been released and the whole
/// history is considered. Commits whose changed files all fall under
/// `release_exclude_paths` are skipped, as are commits without a
/// conventional header.
#[instrument(skip_all, fields(library = %library.id))]
pub fn get_conventional_commits_since_last_release(
    repo: &Repo,
    library: &LibraryState,
) -> ReleaseResult<Vec<ConventionalCommit>> {
    let range = match library.version.as_deref() {
        Some(version) => {
            let tag = library.tag_for(version);
            let sha = repo
                .tag_commit(&tag)?
                .ok_or_else(|| ReleaseError::TagNotFound {
                    library: library.id.clone(),
                    tag: tag.clone(),
                })?;
            debug!(%tag, %sha, "last release");
            format!("{sha}..HEAD")
        }
        None => {
            debug!("never released, walking full history");
            "HEAD".to_string()
        }
    };

    let mut commits = Vec::new();
    repo.walk_log(
        &range,
        &library.source_roots,
        |sha: &str| -> ReleaseResult<ControlFlow<()>> {
            let files = repo.changed_files(sha)?;
            if only_excluded_paths(&files, &library.release_exclude_paths) {
                debug!(sha, "commit only touches excluded paths");
                return Ok(ControlFlow::Continue(()));
            }
            let message = repo.commit_message(sha)?;
            match parse_commits(&message, sha) {
                Ok(records) => commits.extend(records),
                Err(err) => warn!(sha, error = %err, "skipping commit"),
            }
            Ok(ControlFlow::Continue(()))
        },
    )?;

    debug!(count = commits.len(), "collected commits");
    Ok(commits)
}

/// Whether every file falls under one of the excluded paths.
///
/// A commit touching a single non-excluded file is kept whole.
pub fn only_excluded_paths(files: &[String], excluded: &[String]) -> bool {
    !excluded.is_empty()
        && !files.is_empty()
        && files
            .iter()
            .all(|file| excluded.iter().any(|ex| path_is_under(file, ex)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::TestRepo;

    fn library(version: Option<&str>, excluded: &[&str]) -> LibraryState {
        LibraryState {
            id: "foo".into(),
            version: version.map(str::to_string),
            source_roots: vec!["foo".into()],
            release_exclude_paths: excluded.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn exclusion_is_all_or_nothing() {
        let excluded = vec!["foo/README.md".to_string()];
        assert!(only_excluded_paths(&["foo/README.md".into()], &excluded));
        assert!(!only_excluded_paths(
            &["foo/README.md".into(), "foo/b.txt".into()],
            &excluded
        ));
        assert!(!only_excluded_paths(&[], &excluded));
        assert!(!only_excluded_paths(&["foo/README.md".into()], &[]));
    }

    #[test]
    fn skips_commits_touching_only_excluded_paths() {
        let Some(t) = TestRepo::new() else { return };
        t.commit(
            "docs(foo): update README",
            &[("foo/README.md", "readme")],
        );
        t.commit("fix(foo): a fix", &[("foo/b.txt", "b")]);

        let commits =
            get_conventional_commits_since_last_release(&t.repo, &library(None, &["foo/README.md"]))
                .unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].commit_type, "fix");
        assert_eq!(commits[0].description, "a fix");
    }

    #[test]
    fn exclusions_match_after_path_cleaning() {
        let Some(t) = TestRepo::new() else { return };
        t.commit("docs(foo): update README", &[("foo/README.md", "readme")]);
        t.commit("fix(foo): a fix", &[("foo/b.txt", "b")]);

        let library = LibraryState {
            source_roots: vec!["./foo".into()],
            ..library(None, &["./foo/README.md"])
        };
        let commits = get_conventional_commits_since_last_release(&t.repo, &library).unwrap();
        let types: Vec<&str> = commits.iter().map(|c| c.commit_type.as_str()).collect();
        assert_eq!(types, ["fix"]);
    }

    #[test]
    fn stops_at_release_tag_and_keeps_newest_first() {
        let Some(t) = TestRepo::new() else { return };
        t.commit("feat(foo): first", &[("foo/a.txt", "1")]);
        t.tag("foo-1.0.0");
        t.commit("fix(foo): second", &[("foo/a.txt", "2")]);
        t.commit("chore: unrelated", &[("bar/x.txt", "x")]);
        t.commit("not conventional", &[("foo/a.txt", "3")]);
        let head = t.commit("feat(foo): third", &[("foo/a.txt", "4")]);

        let commits =
            get_conventional_commits_since_last_release(&t.repo, &library(Some("1.0.0"), &[]))
                .unwrap();
        let descriptions: Vec<&str> = commits.iter().map(|c| c.description.as_str()).collect();
        assert_eq!(descriptions, ["third", "second"]);
        assert_eq!(commits[0].sha, head);
    }

    #[test]
    fn missing_tag_is_an_error() {
        let Some(t) = TestRepo::new() else { return };
        t.commit("feat(foo): first", &[("foo/a.txt", "1")]);

        let err = get_conventional_commits_since_last_release(&t.repo, &library(Some("2.0.0"), &[]))
            .unwrap_err();
        assert!(matches!(err, ReleaseError::TagNotFound { ref tag, .. } if tag == "foo-2.0.0"));
    }

    #[test]
    fn nested_commits_share_the_sha() {
        let Some(t) = TestRepo::new() else { return };
        let sha = t.commit(
            "feat(foo): main\n\nBEGIN_NESTED_COMMIT\nfix(foo): nested\nEND_NESTED_COMMIT\n",
            &[("foo/a.txt", "1")],
        );
        let commits =
            get_conventional_commits_since_last_release(&t.repo, &library(None, &[])).unwrap();
        assert_eq!(commits.len(), 2);
        assert!(commits.iter().all(|c| c.sha == sha));
    }
}
