//! Authenticated HTTP client.
//!
//! [`ApiRequest`] describes a call so it can be sent again. [`ApiClient::send`]
//! attaches the access token and, on a 401 from anything but the auth
//! endpoints, renews it through the [`RefreshCoordinator`] and replays the
//! request once.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::error::truncate_body;
use super::{ApiError, HttpTokenRefresher, RefreshCoordinator, TokenPair, TokenStore};

/// Default timeout for ordinary API calls. Streaming requests opt out.
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Paths that never trigger a refresh on 401.
pub const AUTH_ENDPOINTS: [&str; 3] = ["/api/auth/login", "/api/auth/register", "/api/auth/refresh"];

/// Where the access token goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenPlacement {
    /// `Authorization: Bearer <token>`.
    #[default]
    Header,
    /// `?token=<token>`, for transports that cannot set headers.
    Query,
}

/// A replayable API request description.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<serde_json::Value>,
    placement: TokenPlacement,
    accept: Option<&'static str>,
    headers: Vec<(&'static str, String)>,
    streaming: bool,
}

impl ApiRequest {
    /// Build a request for `method` on `path` (relative to the server URL).
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            placement: TokenPlacement::Header,
            accept: None,
            headers: Vec::new(),
            streaming: false,
        }
    }

    /// `GET path`.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// `POST path` with a JSON body.
    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, path).json(body)
    }

    /// Attach a JSON body.
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Append a query parameter.
    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    /// Send the access token as a query parameter instead of a header.
    pub fn token_in_query(mut self) -> Self {
        self.placement = TokenPlacement::Query;
        self
    }

    /// Set the `Accept` header.
    pub fn accept(mut self, mime: &'static str) -> Self {
        self.accept = Some(mime);
        self
    }

    /// Add an extra request header.
    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    /// Long-lived response body; no request timeout.
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Login, registration and refresh calls are never refreshed/retried.
    pub fn is_auth_endpoint(&self) -> bool {
        AUTH_ENDPOINTS.iter().any(|p| self.path.starts_with(p))
    }
}

/// HTTP client that attaches the current credential and repairs 401s.
///
/// A 401 on a non-auth endpoint goes through the [`RefreshCoordinator`] and
/// the request is replayed exactly once with the renewed token. A second 401
/// is returned to the caller like any other response.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: TokenStore,
    refresh: RefreshCoordinator,
}

impl ApiClient {
    /// Client using the HTTP refresh endpoint on the same server.
    pub fn new(base_url: &str, tokens: TokenStore) -> Self {
        let http = reqwest::Client::new();
        let refresher = Arc::new(HttpTokenRefresher::new(http.clone(), base_url));
        let refresh = RefreshCoordinator::new(tokens.clone(), refresher);
        Self::with_coordinator(http, base_url, tokens, refresh)
    }

    /// Client with an explicit coordinator (shared or test refresher).
    pub fn with_coordinator(
        http: reqwest::Client,
        base_url: &str,
        tokens: TokenStore,
        refresh: RefreshCoordinator,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            refresh,
        }
    }

    /// Server base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Shared token store.
    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Shared refresh coordinator.
    pub fn refresh_coordinator(&self) -> &RefreshCoordinator {
        &self.refresh
    }

    /// Send a request, refreshing the credential once on 401.
    ///
    /// Returns the raw response for any status; only transport and refresh
    /// failures are errors.
    pub async fn send(&self, request: &ApiRequest) -> Result<Response, ApiError> {
        let token = self.tokens.access_token();
        let response = self.dispatch(request, token.as_deref()).await?;

        if response.status() != StatusCode::UNAUTHORIZED || request.is_auth_endpoint() {
            return Ok(response);
        }

        log::debug!(
            "[Refresh] {} {} returned 401, renewing credential",
            request.method,
            request.path
        );
        let renewed = self.refresh.renew(token.as_deref()).await?;
        self.dispatch(request, Some(&renewed)).await
    }

    /// Send a request and decode a successful JSON body.
    pub async fn json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ApiError> {
        let response = ensure_success(self.send(request).await?).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Log in and install the returned credentials.
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair, ApiError> {
        let request = ApiRequest::post(
            "/api/auth/login",
            serde_json::json!({ "email": email, "password": password }),
        );
        let pair: TokenPair = self.json(&request).await?;
        self.tokens.login(pair.clone());
        log::info!("Logged in as {email}");
        Ok(pair)
    }

    /// Register an account and install the returned credentials.
    pub async fn register(&self, email: &str, password: &str, name: &str) -> Result<TokenPair, ApiError> {
        let request = ApiRequest::post(
            "/api/auth/register",
            serde_json::json!({ "email": email, "password": password, "name": name }),
        );
        let pair: TokenPair = self.json(&request).await?;
        self.tokens.login(pair.clone());
        Ok(pair)
    }

    /// Forget the stored credentials.
    pub fn logout(&self) {
        self.tokens.clear();
    }

    async fn dispatch(&self, request: &ApiRequest, token: Option<&str>) -> Result<Response, ApiError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.http.request(request.method.clone(), &url);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = token {
            builder = match request.placement {
                TokenPlacement::Header => builder.bearer_auth(token),
                TokenPlacement::Query => builder.query(&[("token", token)]),
            };
        }
        if let Some(accept) = request.accept {
            builder = builder.header(reqwest::header::ACCEPT, accept);
        }
        for (name, value) in &request.headers {
            builder = builder.header(*name, value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if !request.streaming {
            builder = builder.timeout(HTTP_REQUEST_TIMEOUT);
        }

        Ok(builder.send().await?)
    }
}

/// Turn a non-success response into [`ApiError::Status`].
pub(crate) async fn ensure_success(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status,
        body: truncate_body(&body),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_endpoints_are_detected() {
        assert!(ApiRequest::post("/api/auth/login", serde_json::json!({})).is_auth_endpoint());
        assert!(ApiRequest::post("/api/auth/refresh", serde_json::json!({})).is_auth_endpoint());
        assert!(ApiRequest::post("/api/auth/register", serde_json::json!({})).is_auth_endpoint());
        assert!(!ApiRequest::get("/api/deployments/1").is_auth_endpoint());
    }

    #[test]
    fn test_builder_defaults() {
        let request = ApiRequest::get("/api/deployments/7/stream")
            .token_in_query()
            .accept("text/event-stream")
            .streaming();
        assert_eq!(request.path(), "/api/deployments/7/stream");
        assert_eq!(request.placement, TokenPlacement::Query);
        assert!(request.streaming);
        assert_eq!(ApiRequest::get("/x").placement, TokenPlacement::Header);
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = ApiClient::new("http://localhost:4000/", TokenStore::in_memory());
        assert_eq!(client.base_url(), "http://localhost:4000");
    }
}
