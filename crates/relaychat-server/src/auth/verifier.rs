//! Identity verifiers: map a bearer token to a verified identity.
//!
//! The caller only ever sees two outcomes: `Some(identity)` or `None`.
//! Transport errors, non-200 answers and malformed bodies all collapse to
//! `None`. Tokens are never logged.

use relaychat_core::{ChatError, ChatResult};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

/// Future returned by [`IdentityVerifier::verify`].
pub type VerifyFuture<'a> = Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>>;

/// Capability that turns a bearer token into an identity.
pub trait IdentityVerifier: Send + Sync {
    /// Verify `token`. Returns the identity on success, `None` on any failure.
    fn verify<'a>(&'a self, token: &'a str) -> VerifyFuture<'a>;
}

/// Verifier backed by an OAuth token-introspection endpoint.
///
/// Issues `GET <endpoint>?access_token=<token>`; a 200 response whose JSON
/// body carries a non-empty string under `identity_field` is a success.
pub struct TokenInfoVerifier {
    endpoint: String,
    identity_field: String,
    /// When set, the response's `aud` must equal this client id.
    expected_audience: Option<String>,
    http_client: reqwest::Client,
}

impl TokenInfoVerifier {
    /// Create a verifier with a per-request timeout.
    pub fn new(
        endpoint: String,
        identity_field: String,
        expected_audience: Option<String>,
        timeout: Duration,
    ) -> ChatResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            endpoint,
            identity_field,
            expected_audience,
            http_client,
        })
    }

    async fn introspect(&self, token: &str) -> Option<String> {
        let response = match self
            .http_client
            .get(&self.endpoint)
            .query(&[("access_token", token)])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "token introspection unreachable");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            debug!(status = %status, "token introspection rejected token");
            return None;
        }

        let body: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "token introspection returned invalid JSON");
                return None;
            }
        };

        self.identity_from(&body)
    }

    fn identity_from(&self, body: &Value) -> Option<String> {
        if let Some(ref expected) = self.expected_audience {
            let aud = body.get("aud").and_then(Value::as_str);
            if aud != Some(expected.as_str()) {
                debug!(aud = ?aud, "token issued for a different audience");
                return None;
            }
        }

        let identity = body
            .get(&self.identity_field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        if identity.is_none() {
            debug!(field = %self.identity_field, "introspection response lacks identity field");
        }
        identity.map(str::to_string)
    }
}

impl IdentityVerifier for TokenInfoVerifier {
    fn verify<'a>(&'a self, token: &'a str) -> VerifyFuture<'a> {
        Box::pin(self.introspect(token))
    }
}

/// Verifier with a fixed token → identity table.
#[derive(Debug, Clone, Default)]
pub struct StaticVerifier {
    tokens: HashMap<String, String>,
}

impl StaticVerifier {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    /// Add or replace one token.
    pub fn with_token(mut self, token: impl Into<String>, identity: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), identity.into());
        self
    }
}

impl IdentityVerifier for StaticVerifier {
    fn verify<'a>(&'a self, token: &'a str) -> VerifyFuture<'a> {
        let identity = self.tokens.get(token).cloned();
        Box::pin(async move { identity })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn verifier_for(server: &MockServer, audience: Option<&str>) -> TokenInfoVerifier {
        TokenInfoVerifier::new(
            format!("{}/tokeninfo", server.uri()),
            "email".into(),
            audience.map(str::to_string),
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn tokeninfo_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tokeninfo"))
            .and(query_param("access_token", "tok1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"email": "y@example.com", "aud": "app"})),
            )
            .mount(&server)
            .await;

        let v = verifier_for(&server, None);
        assert_eq!(v.verify("tok1").await.as_deref(), Some("y@example.com"));
    }

    #[tokio::test]
    async fn tokeninfo_non_200_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tokeninfo"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_token"})),
            )
            .mount(&server)
            .await;

        let v = verifier_for(&server, None);
        assert_eq!(v.verify("bad").await, None);
    }

    #[tokio::test]
    async fn tokeninfo_missing_identity_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tokeninfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"scope": "openid"})))
            .mount(&server)
            .await;

        let v = verifier_for(&server, None);
        assert_eq!(v.verify("tok1").await, None);
    }

    #[tokio::test]
    async fn tokeninfo_non_json_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tokeninfo"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let v = verifier_for(&server, None);
        assert_eq!(v.verify("tok1").await, None);
    }

    #[tokio::test]
    async fn tokeninfo_audience_mismatch_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tokeninfo"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"email": "y@example.com", "aud": "other-app"})),
            )
            .mount(&server)
            .await;

        assert_eq!(verifier_for(&server, Some("app")).verify("tok1").await, None);
        assert_eq!(
            verifier_for(&server, Some("other-app"))
                .verify("tok1")
                .await
                .as_deref(),
            Some("y@example.com")
        );
    }

    #[tokio::test]
    async fn tokeninfo_unreachable_is_failure() {
        let v = TokenInfoVerifier::new(
            "http://127.0.0.1:1/tokeninfo".into(),
            "email".into(),
            None,
            Duration::from_millis(500),
        )
        .unwrap();
        assert_eq!(v.verify("tok1").await, None);
    }

    #[tokio::test]
    async fn static_verifier_lookup() {
        let v = StaticVerifier::default().with_token("tok1", "y@example.com");
        assert_eq!(v.verify("tok1").await.as_deref(), Some("y@example.com"));
        assert_eq!(v.verify("bad").await, None);
    }
}
