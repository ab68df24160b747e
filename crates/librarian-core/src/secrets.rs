//! Secret lookup.
//!
//! Workflows ask a [`SecretStore`] for credentials instead of reading the
//! environment directly, so tests can inject values without touching
//! process state.

use std::collections::BTreeMap;

/// Environment variable holding the GitHub token.
pub const GITHUB_TOKEN_ENV: &str = "LIBRARIAN_GITHUB_TOKEN";

/// Source of named secrets.
pub trait SecretStore: Send + Sync + std::fmt::Debug {
    /// Value of `name`, or `None` if unset or empty.
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads secrets from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecrets;

impl SecretStore for EnvSecrets {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

/// Fixed in-memory secrets.
#[derive(Clone, Default)]
pub struct StaticSecrets {
    values: BTreeMap<String, String>,
}

impl StaticSecrets {
    /// No secrets at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl std::fmt::Debug for StaticSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSecrets")
            .field("names", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SecretStore for StaticSecrets {
    fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).filter(|v| !v.is_empty()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_secrets_hide_values_in_debug() {
        let secrets = StaticSecrets::new().with(GITHUB_TOKEN_ENV, "ghp_abc");
        assert_eq!(secrets.get(GITHUB_TOKEN_ENV).as_deref(), Some("ghp_abc"));
        assert!(!format!("{secrets:?}").contains("ghp_abc"));
    }

    #[test]
    fn empty_values_are_unset() {
        let secrets = StaticSecrets::new().with("EMPTY", "");
        assert_eq!(secrets.get("EMPTY"), None);
        assert_eq!(secrets.get("MISSING"), None);
    }
}
