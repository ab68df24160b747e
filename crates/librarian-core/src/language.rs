//! Per-language behavior.
//!
//! The generator containers do the language-specific heavy lifting; what is
//! left for the orchestrator is small: which changelog file a release
//! writes, which extra flags the generator understands, and whether the
//! container implements `build`. The strategy is chosen once per run.

use serde::{Deserialize, Serialize};

use crate::state::RepoLibraryConfig;

/// Supported language ecosystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Go client libraries.
    Go,
    /// Java client libraries.
    Java,
    /// Python client libraries.
    Python,
    /// Node.js client libraries.
    Node,
    /// .NET client libraries.
    Dotnet,
    /// Rust client libraries.
    Rust,
    /// Anything else; no language-specific behavior.
    Generic,
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Language {
    /// Lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Go => "go",
            Self::Java => "java",
            Self::Python => "python",
            Self::Node => "node",
            Self::Dotnet => "dotnet",
            Self::Rust => "rust",
            Self::Generic => "generic",
        }
    }

    /// Infer the language from a generator image reference.
    ///
    /// Looks at the last path segment of the image name, so
    /// `us-docker.pkg.dev/p/r/python-librarian-generator:latest` is Python.
    pub fn from_image(image: &str) -> Self {
        let (name, _) = crate::state::image_ref_and_tag(image);
        let last = name.rsplit('/').next().unwrap_or(name).to_ascii_lowercase();
        let tokens: Vec<&str> = last.split(['-', '_', '.']).collect();
        let has = |needle: &str| tokens.iter().any(|t| *t == needle);

        if has("python") {
            Self::Python
        } else if has("go") || has("golang") {
            Self::Go
        } else if has("java") {
            Self::Java
        } else if has("node") || has("nodejs") {
            Self::Node
        } else if has("dotnet") || has("csharp") {
            Self::Dotnet
        } else if has("rust") {
            Self::Rust
        } else {
            Self::Generic
        }
    }

    /// Changelog file written into a library's first source root.
    pub const fn changelog_file(self) -> &'static str {
        match self {
            Self::Go | Self::Dotnet => "CHANGES.md",
            Self::Java | Self::Python | Self::Node | Self::Rust | Self::Generic => "CHANGELOG.md",
        }
    }

    /// Whether the generator container implements the `build` command.
    pub const fn supports_build(self) -> bool {
        !matches!(self, Self::Generic)
    }

    /// Extra generator flags derived from a library's generation config.
    pub fn generator_flags(self, config: Option<&RepoLibraryConfig>) -> Vec<String> {
        let Some(config) = config else {
            return Vec::new();
        };
        let mut flags = Vec::new();
        if let Some(ref transport) = config.transport {
            flags.push(format!("--transport={transport}"));
        }
        if let Some(ref level) = config.release_level {
            match self {
                // The Java generator spells it differently.
                Self::Java => flags.push(format!("--release-stage={level}")),
                _ => flags.push(format!("--release-level={level}")),
            }
        }
        for (key, value) in &config.options {
            flags.push(format!("--{}={value}", key.replace('_', "-")));
        }
        flags
    }
}
