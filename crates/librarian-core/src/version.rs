//! Version computation.
//!
//! Turns the conventional commits accumulated since a library's last
//! release into a bump level and applies it to the current version.

use semver::{Prerelease, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::commit::ConventionalCommit;

/// Errors from version operations.
#[derive(Error, Debug)]
pub enum VersionError {
    /// Failed to parse a semver string.
    #[error("invalid semver {input:?}: {source}")]
    InvalidSemver {
        /// The rejected input.
        input: String,
        /// Parser error.
        source: semver::Error,
    },

    /// An explicit version does not move forward.
    #[error("requested version {requested} is not greater than current version {current}")]
    NotGreater {
        /// The version asked for.
        requested: Version,
        /// The version already released.
        current: Version,
    },
}

/// Result alias for version operations.
pub type VersionResult<T> = Result<T, VersionError>;

/// Semver bump level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BumpLevel {
    /// Patch release (x.y.Z).
    Patch,
    /// Minor release (x.Y.0).
    Minor,
    /// Major release (X.0.0).
    Major,
}

impl std::fmt::Display for BumpLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Patch => write!(f, "patch"),
            Self::Minor => write!(f, "minor"),
            Self::Major => write!(f, "major"),
        }
    }
}

/// The bump required by a set of commits, or `None` if nothing is releasable.
pub fn bump_level(commits: &[ConventionalCommit]) -> Option<BumpLevel> {
    commits
        .iter()
        .filter(|c| c.is_releasable())
        .map(|c| {
            if c.is_breaking {
                BumpLevel::Major
            } else if c.commit_type.eq_ignore_ascii_case("feat") {
                BumpLevel::Minor
            } else {
                BumpLevel::Patch
            }
        })
        .max()
}

/// Apply a bump level.
///
/// Before 1.0.0 a breaking change only bumps the minor version. A
/// pre-release advances its trailing number instead of the core version.
pub fn next_version(current: &Version, level: BumpLevel) -> Version {
    if !current.pre.is_empty() {
        let mut next = Version::new(current.major, current.minor, current.patch);
        next.pre = bump_prerelease(&current.pre);
        return next;
    }

    let level = if current.major == 0 && level == BumpLevel::Major {
        BumpLevel::Minor
    } else {
        level
    };

    match level {
        BumpLevel::Patch => Version::new(current.major, current.minor, current.patch + 1),
        BumpLevel::Minor => Version::new(current.major, current.minor + 1, 0),
        BumpLevel::Major => Version::new(current.major + 1, 0, 0),
    }
}

fn bump_prerelease(pre: &Prerelease) -> Prerelease {
    let text = pre.as_str();
    let bumped = match text.rsplit_once('.') {
        Some((head, tail)) => match tail.parse::<u64>() {
            Ok(n) => format!("{head}.{}", n + 1),
            Err(_) => format!("{text}.1"),
        },
        None => match text.parse::<u64>() {
            Ok(n) => (n + 1).to_string(),
            Err(_) => format!("{text}.1"),
        },
    };
    Prerelease::new(&bumped).unwrap_or_else(|_| pre.clone())
}

/// Parse a version string, stripping an optional `v` prefix.
pub fn parse_version(s: &str) -> VersionResult<Version> {
    let trimmed = s.strip_prefix('v').unwrap_or(s);
    Version::parse(trimmed).map_err(|source| VersionError::InvalidSemver {
        input: s.to_string(),
        source,
    })
}

/// Render `version` the way `like` was written (keeping a `v` prefix).
pub fn format_like(like: Option<&str>, version: &Version) -> String {
    match like {
        Some(s) if s.starts_with('v') => format!("v{version}"),
        _ => version.to_string(),
    }
}

/// A version asked for instead of the computed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOverride<'a> {
    /// Given on the command line; must be greater than the current version.
    Explicit(&'a str),
    /// `next_version` from the repository config; ignored once it is no
    /// longer greater than the current version.
    Configured(&'a str),
}

/// Decide the next version of a library.
///
/// `current` is the released version (`None` for never released).
/// `requested` wins when it is larger than the computed version. Returns
/// `None` when there is nothing to release.
pub fn resolve_next_version(
    current: Option<&str>,
    commits: &[ConventionalCommit],
    requested: Option<VersionOverride<'_>>,
) -> VersionResult<Option<String>> {
    let current_version = current
        .map(parse_version)
        .transpose()?
        .unwrap_or_else(|| Version::new(0, 0, 0));

    let computed = bump_level(commits).map(|level| next_version(&current_version, level));

    let requested = match requested {
        Some(VersionOverride::Explicit(text)) => {
            let version = parse_version(text)?;
            if version <= current_version {
                return Err(VersionError::NotGreater {
                    requested: version,
                    current: current_version,
                });
            }
            Some(version)
        }
        Some(VersionOverride::Configured(text)) => {
            let version = parse_version(text)?;
            if version <= current_version {
                debug!(%version, current = %current_version, "ignoring stale next_version");
                None
            } else {
                Some(version)
            }
        }
        None => None,
    };

    let next = match (computed, requested) {
        (Some(computed), Some(requested)) => Some(computed.max(requested)),
        (computed, requested) => computed.or(requested),
    };
    Ok(next.map(|v| format_like(current, &v)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::parse_commits;

    fn commits(messages: &[&str]) -> Vec<ConventionalCommit> {
        messages
            .iter()
            .flat_map(|m| parse_commits(m, "abc").unwrap())
            .collect()
    }

    #[test]
    fn bump_patch() {
        let v = next_version(&Version::new(1, 2, 3), BumpLevel::Patch);
        assert_eq!(v, Version::new(1, 2, 4));
    }

    #[test]
    fn bump_minor() {
        let v = next_version(&Version::new(1, 2, 3), BumpLevel::Minor);
        assert_eq!(v, Version::new(1, 3, 0));
    }

    #[test]
    fn bump_major() {
        let v = next_version(&Version::new(1, 2, 3), BumpLevel::Major);
        assert_eq!(v, Version::new(2, 0, 0));
    }

    #[test]
    fn breaking_before_one_is_minor() {
        let v = next_version(&Version::new(0, 4, 2), BumpLevel::Major);
        assert_eq!(v, Version::new(0, 5, 0));
    }

    #[test]
    fn prerelease_counter_advances() {
        let current = Version::parse("2.0.0-beta.3").unwrap();
        assert_eq!(
            next_version(&current, BumpLevel::Major).to_string(),
            "2.0.0-beta.4"
        );
        let current = Version::parse("2.0.0-rc").unwrap();
        assert_eq!(next_version(&current, BumpLevel::Patch).to_string(), "2.0.0-rc.1");
    }

    #[test]
    fn level_from_commits() {
        assert_eq!(bump_level(&commits(&["fix: a", "docs: b"])), Some(BumpLevel::Patch));
        assert_eq!(bump_level(&commits(&["fix: a", "feat: b"])), Some(BumpLevel::Minor));
        assert_eq!(
            bump_level(&commits(&["feat: a", "fix!: b"])),
            Some(BumpLevel::Major)
        );
        assert_eq!(
            bump_level(&commits(&["fix: a\n\nBREAKING CHANGE: gone"])),
            Some(BumpLevel::Major)
        );
        assert_eq!(bump_level(&commits(&["chore: deps", "ci: speed"])), None);
        assert_eq!(bump_level(&[]), None);
    }

    #[test]
    fn parse_version_strips_v() {
        assert_eq!(parse_version("v1.2.3").unwrap(), Version::new(1, 2, 3));
        assert!(parse_version("1.2").is_err());
    }

    #[test]
    fn resolve_keeps_prefix() {
        let next = resolve_next_version(Some("v1.2.3"), &commits(&["feat: x"]), None).unwrap();
        assert_eq!(next.as_deref(), Some("v1.3.0"));
    }

    #[test]
    fn resolve_nothing_to_release() {
        let next = resolve_next_version(Some("1.2.3"), &commits(&["chore: x"]), None).unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn resolve_first_release() {
        let next = resolve_next_version(None, &commits(&["feat: x"]), None).unwrap();
        assert_eq!(next.as_deref(), Some("0.1.0"));
    }

    #[test]
    fn requested_version_wins_when_larger() {
        let next = resolve_next_version(
            Some("1.2.3"),
            &commits(&["fix: x"]),
            Some(VersionOverride::Explicit("2.0.0")),
        )
        .unwrap();
        assert_eq!(next.as_deref(), Some("2.0.0"));

        let next = resolve_next_version(
            Some("1.2.3"),
            &commits(&["feat!: x"]),
            Some(VersionOverride::Explicit("1.5.0")),
        )
        .unwrap();
        assert_eq!(next.as_deref(), Some("2.0.0"));
    }

    #[test]
    fn requested_version_releases_without_commits() {
        let configured = Some(VersionOverride::Configured("1.2.4"));
        let next = resolve_next_version(Some("1.2.3"), &[], configured).unwrap();
        assert_eq!(next.as_deref(), Some("1.2.4"));
    }

    #[test]
    fn requested_version_must_move_forward() {
        let explicit = Some(VersionOverride::Explicit("1.2.3"));
        let err = resolve_next_version(Some("1.2.3"), &[], explicit).unwrap_err();
        assert!(matches!(err, VersionError::NotGreater { .. }));
    }

    #[test]
    fn stale_configured_version_is_ignored() {
        let stale = Some(VersionOverride::Configured("2.0.0"));
        let next = resolve_next_version(Some("2.0.0"), &commits(&["fix: x"]), stale).unwrap();
        assert_eq!(next.as_deref(), Some("2.0.1"));

        let next = resolve_next_version(Some("2.0.0"), &[], stale).unwrap();
        assert_eq!(next, None);
    }
}
