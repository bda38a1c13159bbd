//! Authentication seam for the connection layer.
//!
//! Credential acquisition, caching and refresh live behind this trait; the
//! connection only needs to stamp headers onto outgoing requests and ask for
//! one re-authentication when the backend answers 401/403.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};

use crate::error::{Error, Result};

/// Supplies credentials for outgoing requests.
///
/// The transport invokes [`Authenticator::re_authenticate`] exactly once on
/// a 401/403 before retrying the original request; a second failure is
/// surfaced to the caller.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Current bearer token, acquiring one if necessary.
    async fn token(&self) -> Result<String>;

    /// Discard any cached credentials and acquire fresh ones.
    async fn re_authenticate(&self) -> Result<()>;

    /// Stamp authentication headers onto an outgoing request.
    async fn add_auth_headers(&self, headers: &mut HeaderMap) -> Result<()> {
        let token = self.token().await?;
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| Error::Authentication("token contains invalid header characters".to_string()))?;
        headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    /// True for username/password credentials.
    fn is_username_password(&self) -> bool {
        false
    }

    /// True for service-account credentials.
    fn is_service_account(&self) -> bool {
        false
    }

    /// True for the zero-auth local deployment.
    fn is_core(&self) -> bool {
        false
    }
}

/// A fixed, never-refreshed token.
#[derive(Clone, Debug)]
pub struct StaticToken {
    token: String,
    service_account: bool,
}

impl StaticToken {
    /// Wrap an already-acquired token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            service_account: true,
        }
    }
}

#[async_trait]
impl Authenticator for StaticToken {
    async fn token(&self) -> Result<String> {
        Ok(self.token.clone())
    }

    async fn re_authenticate(&self) -> Result<()> {
        // A static token cannot be refreshed; the retry would resend the
        // same rejected credentials.
        Err(Error::Authentication(
            "static token was rejected and cannot be refreshed".to_string(),
        ))
    }

    fn is_service_account(&self) -> bool {
        self.service_account
    }
}

/// No authentication at all, for the zero-auth local deployment.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAuth;

#[async_trait]
impl Authenticator for NoAuth {
    async fn token(&self) -> Result<String> {
        Err(Error::Unsupported {
            operation: "token",
        })
    }

    async fn re_authenticate(&self) -> Result<()> {
        Err(Error::Authentication(
            "the local deployment rejected a request; no credentials are configured".to_string(),
        ))
    }

    async fn add_auth_headers(&self, _headers: &mut HeaderMap) -> Result<()> {
        Ok(())
    }

    fn is_core(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_header() {
        let auth = StaticToken::new("secret");
        let mut headers = HeaderMap::new();
        auth.add_auth_headers(&mut headers).await.unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer secret");
        assert!(auth.is_service_account());
        assert!(!auth.is_core());
    }

    #[tokio::test]
    async fn test_static_token_cannot_refresh() {
        let auth = StaticToken::new("secret");
        assert!(matches!(
            auth.re_authenticate().await,
            Err(Error::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_no_auth_adds_nothing() {
        let auth = NoAuth;
        let mut headers = HeaderMap::new();
        auth.add_auth_headers(&mut headers).await.unwrap();
        assert!(headers.is_empty());
        assert!(auth.is_core());
    }
}
