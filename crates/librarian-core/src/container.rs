//! Language generator containers.
//!
//! The orchestrator never generates code itself. It writes a request file,
//! runs the language image with a fixed set of mounts and flags, and looks
//! only at the exit status and captured output.
//!
//! | Mount              | Contents                               |
//! |--------------------|----------------------------------------|
//! | `/librarian`       | request and response JSON              |
//! | `/apis`            | API definition source tree (read-only) |
//! | `/output`          | staging directory for generated files  |
//! | `/repo`            | language repository (read-only)        |
//! | `/sources/<name>`  | extra upstream sources (read-only)     |

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::ContainerConfig;
use crate::state::{LibraryState, RepoLibraryConfig};

/// Request/response directory inside the container.
pub const LIBRARIAN_MOUNT: &str = "/librarian";
/// API source mount.
pub const APIS_MOUNT: &str = "/apis";
/// Staging output mount.
pub const OUTPUT_MOUNT: &str = "/output";
/// Repository mount.
pub const REPO_MOUNT: &str = "/repo";
/// Parent of extra source mounts.
pub const SOURCES_MOUNT: &str = "/sources";

/// Response file a `configure` run may leave behind.
pub const CONFIGURE_RESPONSE: &str = "configure-response.json";

/// Errors from running generator containers.
#[derive(Error, Debug)]
pub enum ContainerError {
    /// The runtime binary could not be started.
    #[error("failed to run {runtime}: {source}")]
    Spawn {
        /// Runtime binary.
        runtime: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The container exited unsuccessfully.
    #[error("container command {command} failed ({}): {stderr}", exit_text(.status))]
    Failed {
        /// Container command.
        command: ContainerCommand,
        /// Exit code; `None` when killed by a signal.
        status: Option<i32>,
        /// Captured stderr.
        stderr: String,
    },

    /// Reading or writing a request or response failed.
    #[error("{path}: {source}")]
    Io {
        /// File being accessed.
        path: Utf8PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A request or response was not valid JSON.
    #[error("{path}: {message}")]
    Json {
        /// File being accessed.
        path: Utf8PathBuf,
        /// Serializer message.
        message: String,
    },

    /// The run was cancelled; the container was killed.
    #[error("cancelled")]
    Cancelled,
}

fn exit_text(status: &Option<i32>) -> String {
    status.map_or_else(|| "killed by signal".to_string(), |code| format!("exit {code}"))
}

/// Result alias for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Commands every generator image understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerCommand {
    /// Generate library code into `/output`.
    Generate,
    /// Build and test the library in `/repo`.
    Build,
    /// Fill in configuration for a new library.
    Configure,
}

impl ContainerCommand {
    /// Command name passed to the image.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Build => "build",
            Self::Configure => "configure",
        }
    }

    /// Name of the request file for this command.
    pub fn request_file(self) -> String {
        format!("{}-request.json", self.as_str())
    }
}

impl std::fmt::Display for ContainerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Host path.
    pub host: Utf8PathBuf,
    /// Path inside the container.
    pub container: String,
    /// Mount read-only.
    pub read_only: bool,
}

/// One container invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRequest {
    /// Command to run.
    pub command: ContainerCommand,
    /// Image reference.
    pub image: String,
    /// Library the command is for.
    pub library_id: String,
    /// Host directory mounted at `/librarian`.
    pub librarian_dir: Utf8PathBuf,
    /// Host API source tree mounted at `/apis`.
    pub api_source: Option<Utf8PathBuf>,
    /// Host staging directory mounted at `/output`.
    pub output: Option<Utf8PathBuf>,
    /// Host repository mounted at `/repo`.
    pub repo: Option<Utf8PathBuf>,
    /// Extra sources mounted at `/sources/<name>`.
    pub sources: BTreeMap<String, Utf8PathBuf>,
    /// Language-specific flags appended after the standard ones.
    pub flags: Vec<String>,
}

impl ContainerRequest {
    /// Bind mounts for this request.
    pub fn mounts(&self) -> Vec<Mount> {
        let mut mounts = vec![Mount {
            host: self.librarian_dir.clone(),
            container: LIBRARIAN_MOUNT.to_string(),
            read_only: false,
        }];
        if let Some(ref dir) = self.api_source {
            mounts.push(Mount {
                host: dir.clone(),
                container: APIS_MOUNT.to_string(),
                read_only: true,
            });
        }
        if let Some(ref dir) = self.output {
            mounts.push(Mount {
                host: dir.clone(),
                container: OUTPUT_MOUNT.to_string(),
                read_only: false,
            });
        }
        if let Some(ref dir) = self.repo {
            mounts.push(Mount {
                host: dir.clone(),
                container: REPO_MOUNT.to_string(),
                // `build` runs inside the repository.
                read_only: self.command != ContainerCommand::Build,
            });
        }
        for (name, dir) in &self.sources {
            mounts.push(Mount {
                host: dir.clone(),
                container: format!("{SOURCES_MOUNT}/{name}"),
                read_only: true,
            });
        }
        mounts
    }

    /// Arguments after the command name.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![format!("--librarian={LIBRARIAN_MOUNT}")];
        if self.api_source.is_some() {
            args.push(format!("--source={APIS_MOUNT}"));
        }
        if self.output.is_some() {
            args.push(format!("--output={OUTPUT_MOUNT}"));
        }
        if self.repo.is_some() {
            args.push(format!("--repo={REPO_MOUNT}"));
        }
        args.push(format!("--library-id={}", self.library_id));
        args.extend(self.flags.iter().cloned());
        args
    }
}

/// Captured output of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerOutput {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

/// Runs generator commands.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Run one request to completion, or until `cancel` fires.
    async fn run(
        &self,
        request: &ContainerRequest,
        cancel: &CancellationToken,
    ) -> ContainerResult<ContainerOutput>;
}

// ──────────────────────────────────────────────
// Request files
// ──────────────────────────────────────────────

#[derive(Serialize)]
struct RequestPayload<'a> {
    #[serde(flatten)]
    library: &'a LibraryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation: Option<&'a RepoLibraryConfig>,
}

/// Write `<command>-request.json` for `library` into `dir`.
pub fn write_request(
    dir: &Utf8Path,
    command: ContainerCommand,
    library: &LibraryState,
    generation: Option<&RepoLibraryConfig>,
) -> ContainerResult<Utf8PathBuf> {
    let path = dir.join(command.request_file());
    let json = serde_json::to_vec_pretty(&RequestPayload {
        library,
        generation,
    })
    .map_err(|e| ContainerError::Json {
        path: path.clone(),
        message: e.to_string(),
    })?;
    std::fs::create_dir_all(dir).map_err(|source| ContainerError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    std::fs::write(&path, json).map_err(|source| ContainerError::Io {
        path: path.clone(),
        source,
    })?;
    debug!(%path, "request written");
    Ok(path)
}

/// Read the library a `configure` run left in `dir`, if any.
pub fn read_configure_response(dir: &Utf8Path) -> ContainerResult<Option<LibraryState>> {
    let path = dir.join(CONFIGURE_RESPONSE);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(ContainerError::Io { path, source }),
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| ContainerError::Json {
            path,
            message: e.to_string(),
        })
}

// ──────────────────────────────────────────────
// Docker
// ──────────────────────────────────────────────

/// Runs generator images with a Docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct DockerGenerator {
    runtime: String,
    user: Option<String>,
    extra_args: Vec<String>,
}

impl DockerGenerator {
    /// Generator using the configured runtime.
    pub fn from_config(config: &ContainerConfig) -> Self {
        Self {
            runtime: config.runtime.clone(),
            user: config.user.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    /// Full argument list passed to the runtime.
    pub fn command_line(&self, request: &ContainerRequest) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        if let Some(ref user) = self.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        for mount in request.mounts() {
            args.push("-v".to_string());
            let suffix = if mount.read_only { ":ro" } else { "" };
            args.push(format!("{}:{}{suffix}", mount.host, mount.container));
        }
        args.push(request.image.clone());
        args.push(request.command.as_str().to_string());
        args.extend(request.args());
        args
    }
}

#[async_trait]
impl Generator for DockerGenerator {
    #[instrument(skip_all, fields(command = %request.command, library = %request.library_id))]
    async fn run(
        &self,
        request: &ContainerRequest,
        cancel: &CancellationToken,
    ) -> ContainerResult<ContainerOutput> {
        let args = self.command_line(request);
        debug!(runtime = %self.runtime, ?args, "starting container");

        let child = tokio::process::Command::new(&self.runtime)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ContainerError::Spawn {
                runtime: self.runtime.clone(),
                source,
            })?;

        // Dropping the child on cancellation kills it.
        let output = tokio::select! {
            () = cancel.cancelled() => return Err(ContainerError::Cancelled),
            output = child.wait_with_output() => output.map_err(|source| ContainerError::Spawn {
                runtime: self.runtime.clone(),
                source,
            })?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(ContainerError::Failed {
                command: request.command,
                status: output.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }
        info!("container finished");
        Ok(ContainerOutput { stdout, stderr })
    }
}

// ──────────────────────────────────────────────
// Recording double
// ──────────────────────────────────────────────

/// In-memory [`Generator`] for tests.
///
/// Records every request. For `generate` it writes the configured files
/// into the output directory; `configure` may leave a response; any
/// library can be made to fail.
#[derive(Debug, Default)]
pub struct RecordingGenerator {
    inner: Mutex<RecordingInner>,
}

#[derive(Debug, Default)]
struct RecordingInner {
    requests: Vec<ContainerRequest>,
    outputs: BTreeMap<String, Vec<(String, String)>>,
    configure_responses: BTreeMap<String, LibraryState>,
    failures: BTreeMap<(String, ContainerCommand), String>,
}

impl RecordingGenerator {
    /// Generator that succeeds without output.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordingInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Files `generate` writes for `library` (paths relative to `/output`).
    pub fn with_output(self, library: &str, files: &[(&str, &str)]) -> Self {
        self.lock().outputs.insert(
            library.to_string(),
            files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
        );
        self
    }

    /// Response `configure` leaves for `library`.
    pub fn with_configure_response(self, library: LibraryState) -> Self {
        self.lock()
            .configure_responses
            .insert(library.id.clone(), library);
        self
    }

    /// Make `command` fail for `library` with `stderr`.
    pub fn failing(self, library: &str, command: ContainerCommand, stderr: &str) -> Self {
        self.lock()
            .failures
            .insert((library.to_string(), command), stderr.to_string());
        self
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<ContainerRequest> {
        self.lock().requests.clone()
    }
}

#[async_trait]
impl Generator for RecordingGenerator {
    async fn run(
        &self,
        request: &ContainerRequest,
        cancel: &CancellationToken,
    ) -> ContainerResult<ContainerOutput> {
        if cancel.is_cancelled() {
            return Err(ContainerError::Cancelled);
        }
        let mut inner = self.lock();
        inner.requests.push(request.clone());
        if let Some(stderr) = inner
            .failures
            .get(&(request.library_id.clone(), request.command))
        {
            return Err(ContainerError::Failed {
                command: request.command,
                status: Some(1),
                stderr: stderr.clone(),
            });
        }

        let io = |path: &Utf8Path| {
            let path = path.to_path_buf();
            move |source| ContainerError::Io { path, source }
        };
        match request.command {
            ContainerCommand::Generate => {
                if let (Some(out), Some(files)) =
                    (&request.output, inner.outputs.get(&request.library_id))
                {
                    for (rel, contents) in files {
                        let path = out.join(rel);
                        if let Some(parent) = path.parent() {
                            std::fs::create_dir_all(parent).map_err(io(parent))?;
                        }
                        std::fs::write(&path, contents).map_err(io(&path))?;
                    }
                }
            }
            ContainerCommand::Configure => {
                if let Some(library) = inner.configure_responses.get(&request.library_id) {
                    let path = request.librarian_dir.join(CONFIGURE_RESPONSE);
                    let json = serde_json::to_vec(library).map_err(|e| ContainerError::Json {
                        path: path.clone(),
                        message: e.to_string(),
                    })?;
                    std::fs::write(&path, json).map_err(io(&path))?;
                }
            }
            ContainerCommand::Build => {}
        }
        Ok(ContainerOutput::default())
    }
}
