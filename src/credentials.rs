//! # Credential resolution.
//!
//! Definitions name credentials by reference; the controller resolves them right before
//! a launch and injects the result into the container environment. Resolution failures
//! are permanent for the attempt: retrying will not make a missing secret appear.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

use crate::error::CredentialError;

/// Environment variables contributed by one credential.
pub type CredentialEnv = BTreeMap<String, String>;

/// Turns credential references into environment variables.
#[async_trait]
pub trait CredentialResolver: Send + Sync + 'static {
    async fn resolve(&self, reference: &str) -> Result<CredentialEnv, CredentialError>;

    /// Resolves every reference and merges the results; later references win on clashes.
    async fn resolve_all(&self, references: &[String]) -> Result<CredentialEnv, CredentialError> {
        let mut env = CredentialEnv::new();
        for reference in references {
            env.extend(self.resolve(reference).await?);
        }
        Ok(env)
    }
}

/// Fixed table of credentials, configured up front.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentials {
    entries: HashMap<String, CredentialEnv>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<I, K, V>(mut self, reference: impl Into<String>, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.entries.insert(
            reference.into(),
            vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        );
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn resolve(&self, reference: &str) -> Result<CredentialEnv, CredentialError> {
        self.entries
            .get(reference)
            .cloned()
            .ok_or_else(|| CredentialError::Missing {
                reference: reference.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_all_merges_in_order() {
        let creds = StaticCredentials::new()
            .with("registry", [("REGISTRY_USER", "bot"), ("TOKEN", "a")])
            .with("vault", [("TOKEN", "b")]);
        let env = creds
            .resolve_all(&["registry".to_string(), "vault".to_string()])
            .await
            .unwrap();
        assert_eq!(env.get("REGISTRY_USER").map(String::as_str), Some("bot"));
        assert_eq!(env.get("TOKEN").map(String::as_str), Some("b"));
    }

    #[tokio::test]
    async fn unknown_reference_is_missing() {
        let err = StaticCredentials::new().resolve("nope").await.unwrap_err();
        assert_eq!(err.as_label(), "credential_missing");
    }
}
