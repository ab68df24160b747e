//! Git operations on a local repository.
//!
//! Shells out to `git` for all operations. This ensures we inherit the user's
//! SSH keys, credential helpers, hooks, and other configuration. Every
//! command runs with `-C <root>` so the process working directory never
//! matters.

use std::io::{BufRead, BufReader};
use std::ops::ControlFlow;
use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors from git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// Failed to execute the `git` command.
    #[error("failed to run git: {0}")]
    Exec(#[from] std::io::Error),

    /// `git` returned a non-zero exit code.
    #[error("git {command} failed: {stderr}")]
    Command {
        /// The git subcommand that failed (e.g., "status").
        command: String,
        /// Captured stderr.
        stderr: String,
    },

    /// Not inside a git repository.
    #[error("{0} is not a git repository")]
    NotARepo(Utf8PathBuf),
}

/// Result alias for git operations.
pub type GitResult<T> = Result<T, GitError>;

/// Author identity for commits made by librarian.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Author and committer name.
    pub name: String,
    /// Author and committer email.
    pub email: String,
}

/// A local git working tree.
#[derive(Debug, Clone)]
pub struct Repo {
    root: Utf8PathBuf,
}

impl Repo {
    /// Open the repository whose top level is (or contains) `path`.
    #[instrument(fields(%path))]
    pub fn open(path: &Utf8Path) -> GitResult<Self> {
        let probe = Self {
            root: path.to_path_buf(),
        };
        let top = match probe.git(&["rev-parse", "--show-toplevel"]) {
            Ok(top) => top,
            Err(GitError::Command { .. }) => return Err(GitError::NotARepo(path.to_path_buf())),
            Err(e) => return Err(e),
        };
        let root = Utf8PathBuf::from(top.trim());
        debug!(%root, "opened repository");
        Ok(Self { root })
    }

    /// Clone `url` into `dest`. Progress output is suppressed when `quiet`.
    #[instrument(fields(%dest))]
    pub fn clone(url: &str, dest: &Utf8Path, quiet: bool) -> GitResult<Self> {
        let mut cmd = Command::new("git");
        cmd.arg("clone");
        if quiet {
            cmd.arg("--quiet");
        } else {
            cmd.arg("--progress");
        }
        cmd.arg(url).arg(dest.as_str());
        let output = cmd.output()?;
        if !output.status.success() {
            return Err(GitError::Command {
                command: "clone".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(Self {
            root: dest.to_path_buf(),
        })
    }

    /// Top-level directory of the working tree.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Whether the working tree has no staged, unstaged or untracked changes.
    #[instrument(skip(self))]
    pub fn is_clean(&self) -> GitResult<bool> {
        let output = self.git(&["status", "--porcelain"])?;
        let clean = output.trim().is_empty();
        debug!(clean, "working tree status");
        Ok(clean)
    }

    /// Current branch name, `None` when HEAD is detached.
    #[instrument(skip(self))]
    pub fn current_branch(&self) -> GitResult<Option<String>> {
        let branch = self.git(&["rev-parse", "--abbrev-ref", "HEAD"])?.trim().to_string();
        if branch == "HEAD" {
            debug!("detached HEAD");
            Ok(None)
        } else {
            Ok(Some(branch))
        }
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> GitResult<String> {
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Commit SHA a tag points at, or `None` if the tag does not exist.
    #[instrument(skip(self))]
    pub fn tag_commit(&self, tag: &str) -> GitResult<Option<String>> {
        let rev = format!("refs/tags/{tag}^{{commit}}");
        match self.git(&["rev-parse", "--verify", "--quiet", &rev]) {
            Ok(sha) => {
                let sha = sha.trim().to_string();
                debug!(%tag, %sha, "resolved tag");
                Ok(Some(sha))
            }
            Err(GitError::Command { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Stream commit SHAs of `range`, newest first, restricted to `paths`.
    ///
    /// `visit` is called once per commit while `git log` is still running;
    /// returning [`ControlFlow::Break`] stops the walk early and is not an
    /// error.
    #[instrument(skip(self, visit))]
    pub fn walk_log<F, E>(&self, range: &str, paths: &[String], mut visit: F) -> Result<(), E>
    where
        F: FnMut(&str) -> Result<ControlFlow<()>, E>,
        E: From<GitError>,
    {
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(self.root.as_str())
            .args(["log", "--format=%H", range]);
        if !paths.is_empty() {
            cmd.arg("--").args(paths);
        }
        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(GitError::from)?;

        let Some(stdout) = child.stdout.take() else {
            return Err(GitError::Command {
                command: "log".to_string(),
                stderr: "stdout not captured".to_string(),
            }
            .into());
        };

        let mut visited = 0usize;
        for line in BufReader::new(stdout).lines() {
            let line = line.map_err(GitError::from)?;
            let sha = line.trim();
            if sha.is_empty() {
                continue;
            }
            visited += 1;
            match visit(sha) {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    debug!(visited, "log walk stopped early");
                    return Ok(());
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(err);
                }
            }
        }

        let output = child.wait_with_output().map_err(GitError::from)?;
        if !output.status.success() {
            return Err(GitError::Command {
                command: "log".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        debug!(visited, "log walk complete");
        Ok(())
    }

    /// Full message of a commit.
    pub fn commit_message(&self, sha: &str) -> GitResult<String> {
        self.git(&["show", "-s", "--format=%B", sha])
    }

    /// Repository-relative paths changed by a commit.
    pub fn changed_files(&self, sha: &str) -> GitResult<Vec<String>> {
        let output = self.git(&[
            "diff-tree",
            "--root",
            "--no-commit-id",
            "--name-only",
            "-r",
            sha,
        ])?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Create and switch to a new branch at HEAD.
    #[instrument(skip(self))]
    pub fn checkout_new_branch(&self, branch: &str) -> GitResult<()> {
        self.git(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Stage changes under `paths` and commit them as `identity`.
    ///
    /// Changes elsewhere in the working tree stay unstaged. Returns `false`
    /// without committing when nothing under `paths` changed.
    #[instrument(skip(self, message, identity))]
    pub fn commit_paths(
        &self,
        message: &str,
        paths: &[String],
        identity: &Identity,
    ) -> GitResult<bool> {
        let mut specs = Vec::new();
        for path in paths {
            // `git add` rejects pathspecs that match nothing.
            let known = self.root.join(path).exists()
                || !self.git(&["ls-files", "--", path])?.trim().is_empty();
            if known {
                specs.push(path.as_str());
            }
        }
        if specs.is_empty() {
            debug!("no paths to stage");
            return Ok(false);
        }
        let mut args = vec!["add", "--all", "--"];
        args.extend(specs);
        self.git(&args)?;
        if self.git(&["diff", "--cached", "--name-only"])?.trim().is_empty() {
            debug!("nothing to commit");
            return Ok(false);
        }
        self.commit_index(message, identity)?;
        Ok(true)
    }

    fn commit_index(&self, message: &str, identity: &Identity) -> GitResult<()> {
        let name = format!("user.name={}", identity.name);
        let email = format!("user.email={}", identity.email);
        let author = format!("{} <{}>", identity.name, identity.email);
        self.git(&[
            "-c", &name, "-c", &email, "commit", "--quiet", "--author", &author, "-m", message,
        ])?;
        debug!("committed");
        Ok(())
    }

    /// Push `branch` to `remote`, setting upstream.
    #[instrument(skip(self))]
    pub fn push(&self, remote: &str, branch: &str) -> GitResult<()> {
        self.git(&["push", "--set-upstream", remote, branch])?;
        Ok(())
    }

    /// URL of a remote, `None` if it is not configured.
    #[instrument(skip(self))]
    pub fn remote_url(&self, remote: &str) -> GitResult<Option<String>> {
        match self.git(&["remote", "get-url", remote]) {
            Ok(url) => Ok(Some(url.trim().to_string())),
            Err(GitError::Command { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn git(&self, args: &[&str]) -> GitResult<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(self.root.as_str())
            .args(args)
            .output()?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("not a git repository") {
                return Err(GitError::NotARepo(self.root.clone()));
            }
            let command = args
                .iter()
                .find(|a| !a.starts_with('-') && !a.contains('='))
                .unwrap_or(&"")
                .to_string();
            Err(GitError::Command { command, stderr })
        }
    }
}

/// Parse owner and repo from a git remote URL.
///
/// Handles both HTTPS and SSH formats:
/// - `https://github.com/owner/repo.git`
/// - `git@github.com:owner/repo.git`
pub fn parse_owner_repo(url: &str) -> Option<(String, String)> {
    let path = url.strip_prefix("git@").map_or_else(
        || {
            url.split("//")
                .nth(1)
                .and_then(|after_scheme| after_scheme.split_once('/').map(|(_, path)| path))
        },
        |rest| rest.split_once(':').map(|(_, path)| path),
    )?;

    let path = path.strip_suffix(".git").unwrap_or(path);
    let (owner, repo) = path.split_once('/')?;

    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }

    Some((owner.to_string(), repo.to_string()))
}

/// Whether a usable `git` binary is on `PATH`.
pub fn git_available() -> bool {
    which::which("git").is_ok()
}


#[cfg(test)]
mod tests {
    use super::testing::TestRepo;
    use super::*;

    #[test]
    fn open_rejects_plain_directory() {
        if !git_available() {
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        assert!(matches!(Repo::open(&path), Err(GitError::NotARepo(_))));
    }

    #[test]
    fn clean_and_commit() {
        let Some(t) = TestRepo::new() else { return };
        t.commit("chore: init", &[("README.md", "hi")]);
        assert!(t.repo.is_clean().unwrap());

        t.write("a.txt", "a");
        assert!(!t.repo.is_clean().unwrap());

        let identity = Identity {
            name: "Librarian".into(),
            email: "librarian@example.com".into(),
        };
        let paths = ["a.txt".to_string()];
        assert!(t.repo.commit_paths("feat: add a", &paths, &identity).unwrap());
        assert!(t.repo.is_clean().unwrap());
        assert!(!t.repo.commit_paths("feat: nothing", &paths, &identity).unwrap());

        let message = t.repo.commit_message(&t.repo.head_sha().unwrap()).unwrap();
        assert_eq!(message.trim(), "feat: add a");
    }

    #[test]
    fn commit_paths_leaves_other_changes() {
        let Some(t) = TestRepo::new() else { return };
        t.commit("chore: init", &[("foo/a.txt", "1"), ("bar/a.txt", "1")]);
        t.write("foo/a.txt", "2");
        t.write("bar/a.txt", "2");

        let identity = Identity {
            name: "Librarian".into(),
            email: "librarian@example.com".into(),
        };
        let paths = ["foo".to_string(), "missing".to_string()];
        assert!(t.repo.commit_paths("feat: foo", &paths, &identity).unwrap());
        let head = t.repo.head_sha().unwrap();
        assert_eq!(t.repo.changed_files(&head).unwrap(), ["foo/a.txt"]);
        assert!(!t.repo.is_clean().unwrap());
        assert!(!t.repo.commit_paths("feat: again", &paths, &identity).unwrap());
    }

    #[test]
    fn tag_lookup() {
        let Some(t) = TestRepo::new() else { return };
        let sha = t.commit("chore: init", &[("README.md", "hi")]);
        t.tag("foo-1.0.0");
        assert_eq!(t.repo.tag_commit("foo-1.0.0").unwrap(), Some(sha));
        assert_eq!(t.repo.tag_commit("foo-9.9.9").unwrap(), None);
    }

    #[test]
    fn walk_log_restricts_paths_and_stops() {
        let Some(t) = TestRepo::new() else { return };
        let first = t.commit("feat: one", &[("foo/a.txt", "1")]);
        t.commit("feat: other", &[("bar/a.txt", "1")]);
        let third = t.commit("fix: two", &[("foo/b.txt", "2")]);

        let mut seen = Vec::new();
        t.repo
            .walk_log::<_, GitError>("HEAD", &["foo".to_string()], |sha| {
                seen.push(sha.to_string());
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        assert_eq!(seen, [third.clone(), first]);

        let mut seen = Vec::new();
        t.repo
            .walk_log::<_, GitError>("HEAD", &[], |sha| {
                seen.push(sha.to_string());
                Ok(ControlFlow::Break(()))
            })
            .unwrap();
        assert_eq!(seen, [third]);
    }

    #[test]
    fn changed_files_of_root_commit() {
        let Some(t) = TestRepo::new() else { return };
        let sha = t.commit("chore: init", &[("a.txt", "a"), ("dir/b.txt", "b")]);
        let mut files = t.repo.changed_files(&sha).unwrap();
        files.sort();
        assert_eq!(files, ["a.txt", "dir/b.txt"]);
    }

    #[test]
    fn branch_helpers() {
        let Some(t) = TestRepo::new() else { return };
        t.commit("chore: init", &[("README.md", "hi")]);
        assert_eq!(t.repo.current_branch().unwrap().as_deref(), Some("main"));
        t.repo.checkout_new_branch("librarian-test").unwrap();
        assert_eq!(
            t.repo.current_branch().unwrap().as_deref(),
            Some("librarian-test")
        );
        assert_eq!(t.repo.remote_url("origin").unwrap(), None);
    }

    #[test]
    fn parse_owner_repo_https() {
        let result = parse_owner_repo("https://github.com/googleapis/google-cloud-python.git");
        assert_eq!(
            result,
            Some(("googleapis".into(), "google-cloud-python".into()))
        );
    }

    #[test]
    fn parse_owner_repo_ssh() {
        let result = parse_owner_repo("git@github.com:googleapis/google-cloud-go");
        assert_eq!(result, Some(("googleapis".into(), "google-cloud-go".into())));
    }

    #[test]
    fn parse_owner_repo_invalid() {
        assert!(parse_owner_repo("not-a-url").is_none());
        assert!(parse_owner_repo("https://github.com/only-owner").is_none());
        assert!(parse_owner_repo("").is_none());
    }
}
