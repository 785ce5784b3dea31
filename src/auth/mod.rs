use std::collections::HashSet;
use std::time::Duration;

use axum::async_trait;
use serde::Serialize;

use crate::error::{AppError, AppResult};

/// Authentication is delegated entirely to an external verifier: the core
/// trusts a single round trip and never decodes a token itself. This trait
/// is the seam between that external collaborator and the gateway, a trait
/// rather than a pure function because the real implementation makes an
/// HTTP call.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    /// Verify that `token` authenticates `user_id` via a
    /// `POST /api/events/verify` call with `Authorization: Bearer <token>`
    /// and body `{userId}`. The verifier's response is a bare ok/fail by
    /// status code, so any failure (network error, non-2xx, timeout)
    /// collapses to the same `AppError::Auth`; callers never need to
    /// distinguish "wrong token" from "verifier unreachable".
    async fn verify(&self, user_id: &str, token: &str) -> AppResult<()>;
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    #[serde(rename = "userId")]
    user_id: &'a str,
}

/// Production verifier: a thin POST to the configured external auth service.
pub struct HttpAuthVerifier {
    client: reqwest::Client,
    verifier_url: String,
}

impl HttpAuthVerifier {
    pub fn new(verifier_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to build auth verifier HTTP client");

        HttpAuthVerifier {
            client,
            verifier_url,
        }
    }
}

#[async_trait]
impl AuthVerifier for HttpAuthVerifier {
    async fn verify(&self, user_id: &str, token: &str) -> AppResult<()> {
        let response = self
            .client
            .post(&self.verifier_url)
            .bearer_auth(token)
            .json(&VerifyRequest { user_id })
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(user_id, error = ?e, "Auth verifier request failed");
                AppError::Auth("Auth verifier unreachable".into())
            })?;

        if !response.status().is_success() {
            tracing::warn!(user_id, status = %response.status(), "Auth verifier rejected token");
            return Err(AppError::Auth("Invalid or expired token".into()));
        }

        Ok(())
    }
}

/// Deterministic test double: a fixed set of valid `(user_id, token)` pairs,
/// no network I/O. Used by the integration test harness in place of
/// `HttpAuthVerifier`.
pub struct StaticAuthVerifier {
    valid_pairs: HashSet<(String, String)>,
}

impl StaticAuthVerifier {
    pub fn new(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        StaticAuthVerifier {
            valid_pairs: pairs.into_iter().collect(),
        }
    }

    pub fn single(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        StaticAuthVerifier::new([(user_id.into(), token.into())])
    }
}

#[async_trait]
impl AuthVerifier for StaticAuthVerifier {
    async fn verify(&self, user_id: &str, token: &str) -> AppResult<()> {
        if self
            .valid_pairs
            .contains(&(user_id.to_string(), token.to_string()))
        {
            Ok(())
        } else {
            Err(AppError::Auth("Invalid or expired token".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_verifier_accepts_known_pair() {
        let verifier = StaticAuthVerifier::single("alice", "tok-alice");
        assert!(verifier.verify("alice", "tok-alice").await.is_ok());
    }

    #[tokio::test]
    async fn static_verifier_rejects_unknown_token() {
        let verifier = StaticAuthVerifier::single("alice", "tok-alice");
        assert!(verifier.verify("alice", "tok-mallory").await.is_err());
    }

    #[tokio::test]
    async fn static_verifier_rejects_token_for_wrong_user() {
        let verifier = StaticAuthVerifier::single("alice", "tok-alice");
        assert!(verifier.verify("mallory", "tok-alice").await.is_err());
    }
}
