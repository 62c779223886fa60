use crate::auth::credentials::UserProfile;
use crate::auth::error::AuthError;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const LOGIN_PATH: &str = "/auth/login";
pub const REGISTER_PATH: &str = "/auth/register";
pub const REFRESH_PATH: &str = "/auth/refresh-token";
pub const ME_PATH: &str = "/auth/me";

/// Paths that must never trigger a session refresh on 401/403.
pub fn is_auth_endpoint(path: &str) -> bool {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let path = path.trim_end_matches('/');
    [LOGIN_PATH, REGISTER_PATH, REFRESH_PATH, ME_PATH]
        .iter()
        .any(|endpoint| path.ends_with(endpoint))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

/// Raw client for the `/auth/*` endpoints. Never routed through the
/// refreshing transport.
#[derive(Debug, Clone)]
pub struct AuthGateway {
    client: Client,
    base: String,
}

impl AuthGateway {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AuthError::Other(err.to_string()))?;
        Ok(Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<TokenResponse, AuthError> {
        #[derive(Serialize)]
        struct LoginRequest<'a> {
            email: &'a str,
            password: &'a str,
        }

        let response = self
            .client
            .post(self.url(LOGIN_PATH))
            .json(&LoginRequest { email, password })
            .send()
            .await?;
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(AuthError::InvalidCredentials);
        }
        Self::decode(response, "login").await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<TokenResponse, AuthError> {
        let response = self
            .client
            .post(self.url(REGISTER_PATH))
            .json(request)
            .send()
            .await?;
        Self::decode(response, "register").await
    }

    /// Exchanges the refresh token (sent as the bearer credential) for a new pair.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let response = self
            .client
            .post(self.url(REFRESH_PATH))
            .bearer_auth(refresh_token)
            .send()
            .await?;
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(AuthError::NotLoggedIn);
        }
        Self::decode(response, "token refresh").await
    }

    pub async fn me(&self, access_token: &str) -> Result<UserProfile, AuthError> {
        let response = self
            .client
            .get(self.url(ME_PATH))
            .bearer_auth(access_token)
            .send()
            .await?;
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(AuthError::NotLoggedIn);
        }
        Self::decode(response, "current user").await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        operation: &str,
    ) -> Result<T, AuthError> {
        if response.status().is_success() {
            return Ok(response.json().await?);
        }

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let body: ErrorBody = serde_json::from_str(&text).unwrap_or(ErrorBody {
            message: None,
            error: Some(text.clone()),
        });
        Err(AuthError::Gateway {
            status: status.as_u16(),
            message: format!(
                "{operation} failed: {}",
                body.message
                    .or(body.error)
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| "unknown error".into())
            ),
        })
    }
}
