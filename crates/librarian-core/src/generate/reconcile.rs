//! Moving generator output from the staging directory into the repository.

use camino::Utf8Path;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::GenerateResult;
use super::clean::{io_err, relative, sorted_entries};
use crate::state::{LibraryState, RepoConfig};

/// Where each staged file went, as repository-relative paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Files copied under the library's source roots.
    pub copied: Vec<String>,
    /// Allow-listed files outside the source roots that were copied.
    pub global_files: Vec<String>,
    /// Files the generator is not allowed to write, left in staging.
    pub skipped: Vec<String>,
}

/// Copy the files staged in `output` into `repo_root`.
///
/// A staged file lands only if it is under one of `library`'s source roots
/// or is a writable entry of the repository's global allowlist.
#[instrument(skip(library, repo_config), fields(library = %library.id))]
pub fn reconcile_output(
    output: &Utf8Path,
    repo_root: &Utf8Path,
    library: &LibraryState,
    repo_config: &RepoConfig,
) -> GenerateResult<ReconcileReport> {
    let mut report = ReconcileReport::default();
    if output.is_dir() {
        walk(output, output, &mut |rel, path| {
            let bucket = if library.owns_path(rel) {
                &mut report.copied
            } else if repo_config.allows_write(rel) {
                &mut report.global_files
            } else {
                warn!(path = %rel, "generator wrote outside its source roots, skipped");
                report.skipped.push(rel.to_string());
                return Ok(());
            };
            let dest = repo_root.join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            std::fs::copy(path, &dest).map_err(io_err(&dest))?;
            bucket.push(rel.to_string());
            Ok(())
        })?;
    }
    debug!(
        copied = report.copied.len(),
        global = report.global_files.len(),
        skipped = report.skipped.len(),
        "output reconciled"
    );
    Ok(report)
}

fn walk(
    base: &Utf8Path,
    dir: &Utf8Path,
    visit: &mut impl FnMut(&str, &Utf8Path) -> GenerateResult<()>,
) -> GenerateResult<()> {
    for path in sorted_entries(dir)? {
        let file_type = std::fs::symlink_metadata(&path)
            .map_err(io_err(&path))?
            .file_type();
        if file_type.is_dir() {
            walk(base, &path, visit)?;
        } else if file_type.is_file() {
            visit(&relative(base, &path), &path)?;
        } else {
            warn!(%path, "ignoring non-regular file in generator output");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FilePermission, GlobalFile};
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    #[test]
    fn copies_owned_and_allowlisted_files() {
        let tmp = TempDir::new().unwrap();
        let base = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let output = base.join("output");
        let repo = base.join("repo");
        for (rel, contents) in [
            ("foo/gen/a.py", "a"),
            ("release-please-config.json", "{}"),
            ("README.md", "nope"),
        ] {
            let path = output.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }
        std::fs::create_dir_all(&repo).unwrap();

        let library = LibraryState {
            id: "foo".into(),
            source_roots: vec!["foo".into()],
            ..Default::default()
        };
        let config = RepoConfig {
            global_files_allowlist: vec![
                GlobalFile {
                    path: "release-please-config.json".into(),
                    permissions: FilePermission::ReadWrite,
                },
                GlobalFile {
                    path: "README.md".into(),
                    permissions: FilePermission::ReadOnly,
                },
            ],
            ..Default::default()
        };

        let report = reconcile_output(&output, &repo, &library, &config).unwrap();
        assert_eq!(report.copied, ["foo/gen/a.py"]);
        assert_eq!(report.global_files, ["release-please-config.json"]);
        assert_eq!(report.skipped, ["README.md"]);
        assert_eq!(std::fs::read_to_string(repo.join("foo/gen/a.py")).unwrap(), "a");
        assert!(!repo.join("README.md").exists());
    }

    #[test]
    fn source_root_with_dot_segment_owns_output() {
        let tmp = TempDir::new().unwrap();
        let base = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let output = base.join("output");
        let repo = base.join("repo");
        std::fs::create_dir_all(output.join("foo/gen")).unwrap();
        std::fs::write(output.join("foo/gen/a.py"), "a").unwrap();
        std::fs::create_dir_all(&repo).unwrap();

        let library = LibraryState {
            id: "foo".into(),
            source_roots: vec!["./foo/".into()],
            ..Default::default()
        };
        let report = reconcile_output(&output, &repo, &library, &RepoConfig::default()).unwrap();
        assert_eq!(report.copied, ["foo/gen/a.py"]);
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn missing_output_is_empty() {
        let tmp = TempDir::new().unwrap();
        let base = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let report = reconcile_output(
            &base.join("none"),
            &base,
            &LibraryState::default(),
            &RepoConfig::default(),
        )
        .unwrap();
        assert_eq!(report, ReconcileReport::default());
    }
}
