use async_trait::async_trait;
use chrono::{Duration, Utc};
use colony_save_core::{AuthProvider, AuthSession, SaveError, StorageError};
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::RestConfig;

#[derive(Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    user: TokenUser,
}

#[derive(Deserialize)]
struct TokenUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

/// Password sign-in against a GoTrue-style auth API.
///
/// The session lives in memory only; a restarted process signs in again.
pub struct RestAuthProvider {
    http_client: HttpClient,
    config: RestConfig,
    session: RwLock<Option<AuthSession>>,
}

impl std::fmt::Debug for RestAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestAuthProvider")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl RestAuthProvider {
    pub fn new(config: RestConfig) -> Result<Self, SaveError> {
        config.validate()?;
        Ok(Self {
            http_client: config.http_client()?,
            config,
            session: RwLock::new(None),
        })
    }

    fn auth_url(&self, endpoint: &str) -> String {
        format!("{}/auth/v1/{}", self.config.base(), endpoint)
    }
}

#[async_trait]
impl AuthProvider for RestAuthProvider {
    async fn current_session(&self) -> Option<AuthSession> {
        let session = self.session.read().await;
        session
            .as_ref()
            .filter(|s| !s.is_expired(Utc::now()))
            .cloned()
    }

    #[instrument(skip(self, password), level = "debug")]
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, SaveError> {
        let response = self
            .http_client
            .post(self.auth_url("token"))
            .query(&[("grant_type", "password")])
            .header("apikey", &self.config.api_key)
            .json(&PasswordGrant { email, password })
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(format!("Sign-in request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST
            || status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
        {
            let text = response.text().await.unwrap_or_default();
            return Err(SaveError::Auth(format!("sign-in rejected: {}", text)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StorageError::Io(format!(
                "Sign-in failed with status {}: {}",
                status, text
            ))
            .into());
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            StorageError::Serialization(format!("Failed to parse sign-in response: {}", e))
        })?;

        let session = AuthSession {
            user_id: token.user.id,
            email: token.user.email.or_else(|| Some(email.to_string())),
            access_token: token.access_token,
            expires_at: token.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
        };
        *self.session.write().await = Some(session.clone());

        info!("Signed in as {}", session.user_id);
        Ok(session)
    }

    #[instrument(skip(self), level = "debug")]
    async fn sign_out(&self) -> Result<(), SaveError> {
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };

        let result = self
            .http_client
            .post(self.auth_url("logout"))
            .header("apikey", &self.config.api_key)
            .header("Authorization", format!("Bearer {}", session.access_token))
            .send()
            .await;

        // The local session is gone either way; a failed revoke only leaves
        // the token to expire on its own.
        match result {
            Ok(r) if r.status().is_success() => debug!("Revoked session for {}", session.user_id),
            Ok(r) => warn!("Sign-out returned status {}", r.status()),
            Err(e) => warn!("Sign-out request failed: {}", e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> RestAuthProvider {
        RestAuthProvider::new(RestConfig::new(server.uri(), "anon-key")).unwrap()
    }

    #[tokio::test]
    async fn test_sign_in_and_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .and(header("apikey", "anon-key"))
            .and(body_json(json!({ "email": "queen@example.com", "password": "hunter2" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "jwt-1",
                "expires_in": 3600,
                "user": { "id": "user-7", "email": "queen@example.com" }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .and(header("Authorization", "Bearer jwt-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let auth = provider(&server);
        assert!(auth.current_session().await.is_none());

        let session = auth.sign_in("queen@example.com", "hunter2").await.unwrap();
        assert_eq!(session.user_id, "user-7");
        assert!(session.expires_at.is_some());
        assert_eq!(auth.current_session().await, Some(session));

        auth.sign_out().await.unwrap();
        assert!(auth.current_session().await.is_none());
        // signing out twice is harmless and does not call the server again
        auth.sign_out().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Invalid login credentials"))
            .mount(&server)
            .await;

        let auth = provider(&server);
        assert!(matches!(
            auth.sign_in("queen@example.com", "wrong").await,
            Err(SaveError::Auth(_))
        ));
        assert!(auth.current_session().await.is_none());
    }

    #[tokio::test]
    async fn test_expired_session_is_hidden() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "jwt-2",
                "expires_in": -10,
                "user": { "id": "user-8" }
            })))
            .mount(&server)
            .await;

        let auth = provider(&server);
        let session = auth.sign_in("drone@example.com", "pw").await.unwrap();
        assert_eq!(session.email.as_deref(), Some("drone@example.com"));
        assert!(auth.current_session().await.is_none());
    }
}
