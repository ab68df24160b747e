//! Per-invocation context.
//!
//! A [`RunContext`] is built once in `main` and passed by reference into
//! every workflow. It is the only place configuration, credentials and the
//! cancellation signal come from.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::forge::ForgeError;
use crate::forge::github::GitHubForge;
use crate::git::{self, Identity, Repo};
use crate::language::Language;
use crate::secrets::{EnvSecrets, GITHUB_TOKEN_ENV, SecretStore};
use crate::state::image_ref_and_tag;

/// Environment variable that marks a non-interactive CI run.
pub const CI_ENV: &str = "CI";

/// Environment variable naming a registry path that replaces the one in the
/// state's image reference.
pub const REPOSITORY_ENV: &str = "LIBRARIAN_REPOSITORY";

/// Everything a workflow needs besides its own arguments.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Loaded tool configuration.
    pub config: Config,
    /// Fired on Ctrl-C; long operations stop at the next await point.
    pub cancel: CancellationToken,
    /// Credential source.
    pub secrets: Arc<dyn SecretStore>,
    /// Running under CI (quiet clones, no progress output).
    pub ci: bool,
    /// Registry path overriding the one in the state's image.
    pub image_repository: Option<String>,
}

impl RunContext {
    /// Context reading secrets from the environment and `CI` from the process.
    pub fn from_env(config: Config) -> Self {
        let ci = std::env::var(CI_ENV).is_ok_and(|v| !v.is_empty() && v != "false");
        let image_repository = std::env::var(REPOSITORY_ENV).ok().filter(|v| !v.is_empty());
        Self {
            config,
            cancel: CancellationToken::new(),
            secrets: Arc::new(EnvSecrets),
            ci,
            image_repository,
        }
    }

    /// Replace the secret store.
    pub fn with_secrets(mut self, secrets: impl SecretStore + 'static) -> Self {
        self.secrets = Arc::new(secrets);
        self
    }

    /// The GitHub token, if one is configured.
    pub fn github_token(&self) -> Option<String> {
        self.secrets.get(GITHUB_TOKEN_ENV)
    }

    /// Author identity for commits.
    pub fn identity(&self) -> Identity {
        Identity {
            name: self.config.git.author_name.clone(),
            email: self.config.git.author_email.clone(),
        }
    }

    /// The image to run for a state that names `image`.
    ///
    /// With an image repository set, `gcr.io/p/python-gen:1.0` becomes
    /// `<repository>/python-gen:1.0`.
    pub fn image(&self, image: &str) -> String {
        let Some(ref repository) = self.image_repository else {
            return image.to_string();
        };
        let (reference, tag) = image_ref_and_tag(image);
        let name = reference.rsplit('/').next().unwrap_or(reference);
        let repository = repository.trim_end_matches('/');
        if tag.is_empty() {
            format!("{repository}/{name}")
        } else {
            format!("{repository}/{name}:{tag}")
        }
    }

    /// Language strategy: the configured override, else inferred from `image`.
    pub fn language(&self, image: &str) -> Language {
        self.config
            .language
            .unwrap_or_else(|| Language::from_image(image))
    }

    /// A GitHub client for the repository behind `repo`'s configured remote.
    pub fn github_forge(&self, repo: &Repo) -> Result<GitHubForge, ForgeError> {
        let token = self.github_token().ok_or(ForgeError::AuthRequired)?;
        let remote = &self.config.git.remote;
        let url = repo
            .remote_url(remote)
            .map_err(|e| ForgeError::UnknownRepository(e.to_string()))?
            .ok_or_else(|| ForgeError::UnknownRepository(format!("remote {remote:?} is not set")))?;
        let (owner, name) = git::parse_owner_repo(&url)
            .ok_or_else(|| ForgeError::UnknownRepository(url.clone()))?;
        Ok(GitHubForge::new(token, owner, name).with_api_base(&self.config.github.api_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::StaticSecrets;

    #[test]
    fn token_comes_from_secret_store() {
        let ctx = RunContext::from_env(Config::default())
            .with_secrets(StaticSecrets::new().with(GITHUB_TOKEN_ENV, "tok"));
        assert_eq!(ctx.github_token().as_deref(), Some("tok"));

        let ctx = ctx.with_secrets(StaticSecrets::new());
        assert_eq!(ctx.github_token(), None);
    }

    #[test]
    fn language_override_wins() {
        let mut config = Config::default();
        let ctx = RunContext::from_env(config.clone());
        assert_eq!(
            ctx.language("gcr.io/p/python-librarian-generator:1.0"),
            Language::Python
        );
        config.language = Some(Language::Go);
        let ctx = RunContext::from_env(config);
        assert_eq!(
            ctx.language("gcr.io/p/python-librarian-generator:1.0"),
            Language::Go
        );
    }

    #[test]
    fn image_repository_replaces_registry_path() {
        let mut ctx = RunContext::from_env(Config::default());
        ctx.image_repository = None;
        assert_eq!(ctx.image("gcr.io/p/python-gen:1.0"), "gcr.io/p/python-gen:1.0");

        ctx.image_repository = Some("localhost:5000/mirror/".into());
        assert_eq!(
            ctx.image("gcr.io/p/python-gen:1.0"),
            "localhost:5000/mirror/python-gen:1.0"
        );
        assert_eq!(ctx.image("python-gen"), "localhost:5000/mirror/python-gen");
    }

    #[test]
    fn identity_from_config() {
        let ctx = RunContext::from_env(Config::default());
        assert_eq!(ctx.identity().name, "Cloud SDK Librarian");
    }
}
