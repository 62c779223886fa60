use crate::auth::{is_auth_endpoint, SessionCoordinator};
use crate::transport::error::{ApiError, HttpErrorKind};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// JSON transport for the production API.
///
/// A 401/403 on a non-auth path is resolved through the session coordinator
/// and the request is replayed once with the renewed token.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base: String,
    session: SessionCoordinator,
}

impl ApiClient {
    pub fn new(
        base: impl Into<String>,
        session: SessionCoordinator,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ApiError::Network(err.to_string()))?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            session,
        })
    }

    pub fn session(&self) -> &SessionCoordinator {
        &self.session
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let token = self.session.access_token();
        let response = self.send(&method, path, body, token.as_deref()).await?;
        if !is_auth_failure(response.status()) || is_auth_endpoint(path) {
            return read_body(response, path).await;
        }

        debug!(
            target: "prodsync::transport",
            %method,
            path,
            status = response.status().as_u16(),
            "request rejected; renewing session"
        );
        // A rejection of a token that has since been replaced only needs the
        // newer token, not another renewal.
        let renewed = match self.session.access_token() {
            Some(current) if token.as_deref() != Some(current.as_str()) => current,
            _ => match self.session.refresh().await {
                Some(renewed) => renewed,
                None => return Err(ApiError::SessionExpired),
            },
        };

        let retry = self.send(&method, path, body, Some(&renewed)).await?;
        if is_auth_failure(retry.status()) {
            warn!(
                target: "prodsync::transport",
                %method,
                path,
                "request still rejected after session renewal"
            );
            return Err(ApiError::SessionExpired);
        }
        read_body(retry, path).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let value = self.request(Method::GET, path, None).await?;
        decode(value, path)
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = encode(body, path)?;
        let value = self.request(Method::PUT, path, Some(&body)).await?;
        decode(value, path)
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = encode(body, path)?;
        let value = self.request(Method::POST, path, Some(&body)).await?;
        decode(value, path)
    }

    async fn send(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<Response, ApiError> {
        let url = format!("{}{path}", self.base);
        let mut request = self.http.request(method.clone(), &url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let started = Instant::now();
        let result = request.send().await;
        match &result {
            Ok(response) => debug!(
                target: "prodsync::transport",
                %method,
                path,
                status = response.status().as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "request completed"
            ),
            Err(err) => warn!(
                target: "prodsync::transport",
                %method,
                path,
                error = %err,
                "request failed without response"
            ),
        }
        Ok(result?)
    }
}

fn is_auth_failure(status: StatusCode) -> bool {
    matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
}

async fn read_body(response: Response, path: &str) -> Result<Value, ApiError> {
    let status = response.status();
    let text = response.text().await?;

    if status.is_success() {
        return parse_success(&text, path);
    }

    Err(ApiError::Http {
        status: status.as_u16(),
        kind: HttpErrorKind::classify(status),
        message: error_message(&text, status),
    })
}

fn parse_success(text: &str, path: &str) -> Result<Value, ApiError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Value::Null);
    }
    if looks_like_html(trimmed) {
        return Err(ApiError::Parse {
            path: path.to_string(),
            reason: "received an HTML page instead of JSON; check the API base URL".into(),
        });
    }
    serde_json::from_str(trimmed).map_err(|err| ApiError::Parse {
        path: path.to_string(),
        reason: err.to_string(),
    })
}

/// JSON never starts with `<`; a markup body means the base URL points at a
/// web host instead of the API.
fn looks_like_html(body: &str) -> bool {
    body.trim_start().starts_with('<')
}

fn error_message(text: &str, status: StatusCode) -> String {
    let from_json = serde_json::from_str::<Value>(text).ok().and_then(|value| {
        ["message", "error", "detail"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str).map(str::to_string))
    });
    from_json
        .filter(|message| !message.trim().is_empty())
        .or_else(|| {
            let trimmed = text.trim();
            (!trimmed.is_empty() && !looks_like_html(trimmed)).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        })
}

fn encode<B: Serialize + ?Sized>(body: &B, path: &str) -> Result<Value, ApiError> {
    serde_json::to_value(body).map_err(|err| ApiError::Parse {
        path: path.to_string(),
        reason: err.to_string(),
    })
}

fn decode<T: DeserializeOwned>(value: Value, path: &str) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|err| ApiError::Parse {
        path: path.to_string(),
        reason: err.to_string(),
    })
}
