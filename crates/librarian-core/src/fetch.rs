//! Content-addressed cache of upstream source trees.
//!
//! Upstream repositories are fetched as GitHub archive tarballs and kept
//! under the cache root:
//!
//! ```text
//! <root>/download/github.com/googleapis/googleapis/<commit>.tar.gz
//! <root>/download/github.com/googleapis/googleapis/<commit>.tar.gz.json   {sha256, url}
//! <root>/dir/github.com/googleapis/googleapis/<commit>/                   extracted tree
//! ```
//!
//! Every file and directory is written to a temporary sibling and renamed
//! into place, so concurrent readers never see partial content. A cached
//! tarball is only extracted after its SHA-256 matches the sidecar; any
//! mismatch means a fresh download.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Component, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tar::Archive;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::state::is_valid_dir_path;

/// Environment variable overriding the cache root.
pub const CACHE_ENV: &str = "LIBRARIAN_CACHE";

/// Cache directory under the home directory when nothing else is set.
const DEFAULT_CACHE_DIR: &str = ".librarian";

/// Errors from fetching sources.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The repository string is not a safe relative path.
    #[error("invalid source repository {0:?}")]
    InvalidRepo(String),

    /// The commit is not a plain ref name.
    #[error("invalid source commit {0:?}")]
    InvalidCommit(String),

    /// No cache root could be determined.
    #[error("cannot determine cache directory; set {CACHE_ENV}")]
    NoCacheRoot,

    /// The HTTP request failed.
    #[error("failed to download {url}: {message}")]
    Download {
        /// Tarball URL.
        url: String,
        /// Transport error.
        message: String,
    },

    /// The server answered with an error status.
    #[error("failed to download {url}: HTTP {status}")]
    Status {
        /// Tarball URL.
        url: String,
        /// HTTP status.
        status: u16,
    },

    /// The downloaded tarball does not have the pinned hash.
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Tarball URL.
        url: String,
        /// Pinned SHA-256.
        expected: String,
        /// SHA-256 of the downloaded bytes.
        actual: String,
    },

    /// Filesystem access failed.
    #[error("{path}: {source}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The tarball could not be unpacked.
    #[error("failed to extract {path}: {message}")]
    Extract {
        /// Tarball path.
        path: Utf8PathBuf,
        /// What went wrong.
        message: String,
    },

    /// A blocking task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(String),

    /// The run was cancelled.
    #[error("cancelled")]
    Cancelled,
}

/// Result alias for fetch operations.
pub type FetchResult<T> = Result<T, FetchError>;

fn io_err(path: &Utf8Path) -> impl FnOnce(std::io::Error) -> FetchError + '_ {
    move |source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ──────────────────────────────────────────────
// Download backends
// ──────────────────────────────────────────────

/// Something that can produce tarball bytes for a URL.
#[async_trait]
pub trait TarballSource: Send + Sync {
    /// Download the whole body at `url`.
    async fn download(&self, url: &str) -> FetchResult<Vec<u8>>;
}

/// Downloads over HTTPS with `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpTarballSource {
    client: reqwest::Client,
}

impl HttpTarballSource {
    /// Source using a default client.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TarballSource for HttpTarballSource {
    async fn download(&self, url: &str) -> FetchResult<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Download {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let bytes = response.bytes().await.map_err(|e| FetchError::Download {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}

// ──────────────────────────────────────────────
// Cache
// ──────────────────────────────────────────────

/// A named upstream source to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    /// Name used for the mount point and in messages.
    pub name: String,
    /// Repository as `host/owner/name`.
    pub repo: String,
    /// Commit to fetch.
    pub commit: String,
    /// Pinned SHA-256 of the tarball.
    pub sha256: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TarballMetadata {
    sha256: String,
    url: String,
}

/// Pick the cache root: `LIBRARIAN_CACHE`, then the configured directory,
/// then `~/.librarian`.
pub fn cache_root(configured: Option<&Utf8Path>) -> FetchResult<Utf8PathBuf> {
    resolve_cache_root(std::env::var(CACHE_ENV).ok(), configured)
}

fn resolve_cache_root(
    env: Option<String>,
    configured: Option<&Utf8Path>,
) -> FetchResult<Utf8PathBuf> {
    if let Some(dir) = env.filter(|v| !v.is_empty()) {
        return Ok(Utf8PathBuf::from(dir));
    }
    if let Some(dir) = configured {
        return Ok(dir.to_path_buf());
    }
    directories::BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().join(DEFAULT_CACHE_DIR)).ok())
        .ok_or(FetchError::NoCacheRoot)
}

/// URL of the archive tarball of `repo` at `commit`.
pub fn tarball_url(repo: &str, commit: &str) -> String {
    format!("https://{repo}/archive/{commit}.tar.gz")
}

/// On-disk source cache.
#[derive(Clone)]
pub struct SourceCache {
    root: Utf8PathBuf,
    source: Arc<dyn TarballSource>,
}

impl std::fmt::Debug for SourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceCache").field("root", &self.root).finish()
    }
}

impl SourceCache {
    /// Cache at `root` downloading through `source`.
    pub fn new(root: impl Into<Utf8PathBuf>, source: Arc<dyn TarballSource>) -> Self {
        Self {
            root: root.into(),
            source,
        }
    }

    /// Cache at `root` downloading over HTTPS.
    pub fn http(root: impl Into<Utf8PathBuf>) -> Self {
        Self::new(root, Arc::new(HttpTarballSource::new()))
    }

    /// Cache root.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Local directory with `repo` at `commit`, fetching it if needed.
    ///
    /// Checks, in order: an existing non-empty extracted tree; a cached
    /// tarball whose hash matches its sidecar; a fresh download. A pinned
    /// `sha256` must match both cached and downloaded tarballs.
    #[instrument(skip(self), fields(root = %self.root))]
    pub async fn repo_dir(
        &self,
        repo: &str,
        commit: &str,
        sha256: Option<&str>,
    ) -> FetchResult<Utf8PathBuf> {
        if !is_valid_dir_path(repo) {
            return Err(FetchError::InvalidRepo(repo.to_string()));
        }
        if !is_valid_commit(commit) {
            return Err(FetchError::InvalidCommit(commit.to_string()));
        }

        let dir = self.root.join("dir").join(repo).join(commit);
        if is_non_empty_dir(&dir) {
            debug!(%dir, "cache hit");
            return Ok(dir);
        }

        let download_dir = self.root.join("download").join(repo);
        let tarball = download_dir.join(format!("{commit}.tar.gz"));
        let metadata = download_dir.join(format!("{commit}.tar.gz.json"));
        let url = tarball_url(repo, commit);

        if self.cached_tarball_is_valid(&tarball, &metadata, sha256).await? {
            debug!(%tarball, "extracting cached tarball");
        } else {
            self.download(&url, &download_dir, &tarball, &metadata, sha256)
                .await?;
        }

        extract(tarball, dir.clone()).await?;
        info!(%repo, %commit, %dir, "source ready");
        Ok(dir)
    }

    async fn cached_tarball_is_valid(
        &self,
        tarball: &Utf8Path,
        metadata: &Utf8Path,
        expected: Option<&str>,
    ) -> FetchResult<bool> {
        if !tarball.is_file() || !metadata.is_file() {
            return Ok(false);
        }
        let recorded = match std::fs::read_to_string(metadata)
            .ok()
            .and_then(|text| serde_json::from_str::<TarballMetadata>(&text).ok())
        {
            Some(meta) => meta.sha256,
            None => {
                warn!(%metadata, "unreadable tarball metadata, downloading again");
                return Ok(false);
            }
        };
        let actual = hash_file(tarball.to_path_buf()).await?;
        if !actual.eq_ignore_ascii_case(&recorded) {
            warn!(%tarball, %recorded, %actual, "cached tarball does not match its checksum, downloading again");
            return Ok(false);
        }
        if let Some(expected) = expected
            && !actual.eq_ignore_ascii_case(expected)
        {
            warn!(%tarball, %expected, %actual, "cached tarball does not match pinned checksum, downloading again");
            return Ok(false);
        }
        Ok(true)
    }

    async fn download(
        &self,
        url: &str,
        download_dir: &Utf8Path,
        tarball: &Utf8Path,
        metadata: &Utf8Path,
        expected: Option<&str>,
    ) -> FetchResult<()> {
        debug!(%url, "downloading");
        let bytes = self.source.download(url).await?;
        let actual = hex::encode(Sha256::digest(&bytes));
        if let Some(expected) = expected
            && !actual.eq_ignore_ascii_case(expected)
        {
            return Err(FetchError::ChecksumMismatch {
                url: url.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }

        std::fs::create_dir_all(download_dir).map_err(io_err(download_dir))?;
        persist(download_dir, tarball, &bytes)?;
        let meta = serde_json::to_vec_pretty(&TarballMetadata {
            sha256: actual.clone(),
            url: url.to_string(),
        })
        .map_err(|e| FetchError::Io {
            path: metadata.to_path_buf(),
            source: std::io::Error::other(e),
        })?;
        persist(download_dir, metadata, &meta)?;
        debug!(%tarball, sha256 = %actual, size = bytes.len(), "tarball cached");
        Ok(())
    }

    /// Fetch every source concurrently.
    ///
    /// All fetches must succeed. The first error drops the remaining
    /// in-flight fetches and is returned; so does cancellation.
    #[instrument(skip_all, fields(count = sources.len()))]
    pub async fn fetch_all(
        &self,
        sources: &[SourceRef],
        cancel: &CancellationToken,
    ) -> FetchResult<BTreeMap<String, Utf8PathBuf>> {
        let fetches = sources.iter().map(|source| async move {
            let dir = self
                .repo_dir(&source.repo, &source.commit, source.sha256.as_deref())
                .await?;
            Ok::<_, FetchError>((source.name.clone(), dir))
        });

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(FetchError::Cancelled),
            result = try_join_all(fetches) => Ok(result?.into_iter().collect()),
        }
    }
}

fn is_valid_commit(commit: &str) -> bool {
    !commit.is_empty()
        && !commit.starts_with('.')
        && commit
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn is_non_empty_dir(path: &Utf8Path) -> bool {
    std::fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_some())
}

/// Write `contents` next to `path` and rename it into place.
fn persist(dir: &Utf8Path, path: &Utf8Path, contents: &[u8]) -> FetchResult<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err(path))?;
    tmp.write_all(contents).map_err(io_err(path))?;
    tmp.persist(path).map_err(|e| FetchError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

async fn hash_file(path: Utf8PathBuf) -> FetchResult<String> {
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path).map_err(io_err(&path))?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher).map_err(io_err(&path))?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| FetchError::Task(e.to_string()))?
}

/// Unpack `tarball` into `dest`, dropping the archive's top-level directory.
async fn extract(tarball: Utf8PathBuf, dest: Utf8PathBuf) -> FetchResult<()> {
    tokio::task::spawn_blocking(move || extract_blocking(&tarball, &dest))
        .await
        .map_err(|e| FetchError::Task(e.to_string()))?
}

fn extract_blocking(tarball: &Utf8Path, dest: &Utf8Path) -> FetchResult<()> {
    let parent = dest.parent().unwrap_or(dest);
    std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    let staging = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(parent)
        .map_err(io_err(parent))?;

    let archive_err = |message: String| FetchError::Extract {
        path: tarball.to_path_buf(),
        message,
    };
    let file = std::fs::File::open(tarball).map_err(io_err(tarball))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let entries = archive.entries().map_err(|e| archive_err(e.to_string()))?;

    let mut count = 0usize;
    for entry in entries {
        let mut entry = entry.map_err(|e| archive_err(e.to_string()))?;
        let path = entry.path().map_err(|e| archive_err(e.to_string()))?;
        let mut components = path.components();
        components.next();
        let relative: PathBuf = components.as_path().to_path_buf();
        if relative.as_os_str().is_empty() {
            continue;
        }
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            warn!(path = %relative.display(), "skipping unsafe archive entry");
            continue;
        }
        let target = staging.path().join(&relative);
        if let Some(dir) = target.parent() {
            std::fs::create_dir_all(dir).map_err(|e| archive_err(e.to_string()))?;
        }
        entry
            .unpack(&target)
            .map_err(|e| archive_err(format!("{}: {e}", relative.display())))?;
        count += 1;
    }

    // An empty leftover directory from an interrupted run would block the rename.
    if dest.is_dir() && !is_non_empty_dir(dest) {
        std::fs::remove_dir(dest).map_err(io_err(dest))?;
    }
    let staged = staging.keep();
    if let Err(source) = std::fs::rename(&staged, dest) {
        let _ = std::fs::remove_dir_all(&staged);
        // Another process finished first.
        if is_non_empty_dir(dest) {
            return Ok(());
        }
        return Err(FetchError::Io {
            path: dest.to_path_buf(),
            source,
        });
    }
    debug!(%dest, entries = count, "extracted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_path(format!("googleapis-abc/{path}")).unwrap();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    struct FakeSource {
        bytes: Vec<u8>,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn new(bytes: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                bytes,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TarballSource for FakeSource {
        async fn download(&self, url: &str) -> FetchResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if url.contains("/missing/") {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: 404,
                });
            }
            Ok(self.bytes.clone())
        }
    }

    fn cache(source: Arc<FakeSource>) -> (TempDir, SourceCache) {
        let tmp = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        (tmp, SourceCache::new(root, source))
    }

    const REPO: &str = "github.com/googleapis/googleapis";
    const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

    #[tokio::test]
    async fn downloads_once_then_hits_cache() {
        let source = FakeSource::new(tarball(&[("google/foo/v1/foo.proto", "syntax")]));
        let (_tmp, cache) = cache(source.clone());

        let dir = cache.repo_dir(REPO, COMMIT, None).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.join("google/foo/v1/foo.proto")).unwrap(),
            "syntax"
        );
        assert!(dir.ends_with(format!("dir/{REPO}/{COMMIT}")));

        cache.repo_dir(REPO, COMMIT, None).await.unwrap();
        assert_eq!(source.calls(), 1);

        let meta = cache
            .root()
            .join(format!("download/{REPO}/{COMMIT}.tar.gz.json"));
        let meta: TarballMetadata =
            serde_json::from_str(&std::fs::read_to_string(meta).unwrap()).unwrap();
        assert_eq!(meta.url, tarball_url(REPO, COMMIT));
    }

    #[tokio::test]
    async fn reextracts_valid_cached_tarball_without_download() {
        let source = FakeSource::new(tarball(&[("a.txt", "a")]));
        let (_tmp, cache) = cache(source.clone());

        let dir = cache.repo_dir(REPO, COMMIT, None).await.unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        let dir = cache.repo_dir(REPO, COMMIT, None).await.unwrap();
        assert!(dir.join("a.txt").is_file());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn hash_mismatch_triggers_download() {
        let source = FakeSource::new(tarball(&[("a.txt", "good")]));
        let (_tmp, cache) = cache(source.clone());

        let dir = cache.repo_dir(REPO, COMMIT, None).await.unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
        let cached = cache.root().join(format!("download/{REPO}/{COMMIT}.tar.gz"));
        std::fs::write(&cached, tarball(&[("a.txt", "tampered")])).unwrap();

        let dir = cache.repo_dir(REPO, COMMIT, None).await.unwrap();
        assert_eq!(source.calls(), 2);
        assert_eq!(std::fs::read_to_string(dir.join("a.txt")).unwrap(), "good");
    }

    #[tokio::test]
    async fn pinned_checksum_is_enforced() {
        let source = FakeSource::new(tarball(&[("a.txt", "a")]));
        let (_tmp, cache) = cache(source);

        let err = cache
            .repo_dir(REPO, COMMIT, Some(&"0".repeat(64)))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ChecksumMismatch { .. }));
        assert!(!cache.root().join(format!("dir/{REPO}/{COMMIT}")).exists());
    }

    #[tokio::test]
    async fn rejects_escaping_repo() {
        let (_tmp, cache) = cache(FakeSource::new(Vec::new()));
        for repo in ["../etc", "/abs/repo", ""] {
            let err = cache.repo_dir(repo, COMMIT, None).await.unwrap_err();
            assert!(matches!(err, FetchError::InvalidRepo(_)), "{repo}");
        }
        let err = cache.repo_dir(REPO, "../x", None).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidCommit(_)));
    }

    #[tokio::test]
    async fn fetch_all_requires_every_source() {
        let source = FakeSource::new(tarball(&[("a.txt", "a")]));
        let (_tmp, cache) = cache(source);
        let good = SourceRef {
            name: "googleapis".into(),
            repo: REPO.into(),
            commit: COMMIT.into(),
            sha256: None,
        };
        let bad = SourceRef {
            name: "showcase".into(),
            repo: "github.com/missing/repo".into(),
            commit: COMMIT.into(),
            sha256: None,
        };
        let cancel = CancellationToken::new();

        let dirs = cache.fetch_all(std::slice::from_ref(&good), &cancel).await.unwrap();
        assert!(dirs["googleapis"].join("a.txt").is_file());

        let err = cache.fetch_all(&[good, bad], &cancel).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn fetch_all_honours_cancellation() {
        let (_tmp, cache) = cache(FakeSource::new(tarball(&[("a.txt", "a")])));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let source = SourceRef {
            name: "googleapis".into(),
            repo: REPO.into(),
            commit: COMMIT.into(),
            sha256: None,
        };
        let err = cache.fetch_all(&[source], &cancel).await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
    }

    #[test]
    fn cache_root_precedence() {
        let configured = Utf8Path::new("/configured");
        assert_eq!(
            resolve_cache_root(Some("/from-env".into()), Some(configured)).unwrap(),
            "/from-env"
        );
        assert_eq!(
            resolve_cache_root(None, Some(configured)).unwrap(),
            "/configured"
        );
        assert_eq!(
            resolve_cache_root(Some(String::new()), Some(configured)).unwrap(),
            "/configured"
        );
    }

    #[tokio::test]
    async fn http_source_maps_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"bytes".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone.tar.gz"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let source = HttpTarballSource::new();
        let body = source
            .download(&format!("{}/ok.tar.gz", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, b"bytes");
        let err = source
            .download(&format!("{}/gone.tar.gz", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }
}
