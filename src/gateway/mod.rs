//! Session-aware gateway for every authenticated backend call.
//!
//! `ApiGateway::request` attaches the bearer token and tenant headers,
//! refreshes an expired token before sending, and recovers from a `401`
//! with one silent refresh and one retry. Per call there is at most one
//! refresh attempt and at most one retried network request.
//!
//! When the credential cannot be recovered the gateway emits
//! `AuthSignal::Expired` on the auth bus and hands the caller a `401`
//! response (synthesized locally when nothing was sent).

mod error;
mod request;


use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::auth::events::{AuthEvents, SignOutReason};
use crate::auth::refresh::SilentRefresh;
use crate::auth::token::{self, DEFAULT_EXPIRY_MARGIN_MS};
use crate::session::SessionContext;
use crate::types::TenantId;

pub use error::{ApiError, GatewayError};
pub use request::ApiRequest;

use error::ErrorBody;

/// Header carrying the tenant scope.
pub const TENANT_HEADER: HeaderName = HeaderName::from_static("x-tenant-id");

/// Body of the `401` synthesized when an expired token cannot be refreshed.
pub const TOKEN_EXPIRED_BODY: &str = r#"{"error":"Token expired"}"#;

/// Build the HTTP client shared by the gateway and the guards.
///
/// Cookies are kept across calls so credentialed backends see them.
pub fn build_http_client(timeout: Duration) -> Result<Client, GatewayError> {
    Client::builder()
        .timeout(timeout)
        .cookie_store(true)
        .build()
        .map_err(|e| GatewayError::Client(e.to_string()))
}

pub struct ApiGateway {
    client: Client,
    base_url: String,
    session: SessionContext,
    refresh: Arc<SilentRefresh>,
    events: AuthEvents,
    margin_ms: i64,
}

impl ApiGateway {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        session: SessionContext,
        refresh: Arc<SilentRefresh>,
        events: AuthEvents,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
            refresh,
            events,
            margin_ms: DEFAULT_EXPIRY_MARGIN_MS,
        }
    }

    /// Override the expiry safety margin.
    pub fn with_margin_ms(mut self, margin_ms: i64) -> Self {
        self.margin_ms = margin_ms;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Resolve `path` against the base URL. Absolute URLs pass through.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Issue an authenticated call.
    ///
    /// Only transport failures are errors; every auth outcome, including a
    /// locally synthesized `401`, is returned as a response.
    pub async fn request(&self, path: &str, request: ApiRequest) -> Result<Response, GatewayError> {
        let span = info_span!(
            "api_request",
            request_id = %Uuid::new_v4(),
            method = %request.method,
            path
        );
        self.execute(path, request).instrument(span).await
    }

    async fn execute(&self, path: &str, request: ApiRequest) -> Result<Response, GatewayError> {
        let url = self.url(path);
        let epoch = self.refresh.epoch();
        let mut token = self.session.token();
        let tenant = self.session.tenant_id();
        let mut refreshed = false;

        if let Some(current) = token.as_deref()
            && token::is_expired(Some(current), self.margin_ms)
        {
            debug!("Stored token is expired, refreshing before send");
            refreshed = true;
            match self.refresh.refresh_since(epoch).await {
                Some(fresh) => token = Some(fresh),
                None => {
                    warn!("Token expired and could not be refreshed; request not sent");
                    self.events.emit_expired(SignOutReason::Expired);
                    return Ok(token_expired_response());
                }
            }
        }

        let response = self
            .send(&url, &request, token.as_deref(), tenant.as_ref())
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let (response, body) = buffer_response(response).await;
        let reason = unauthorized_reason(&body);

        if !refreshed && let Some(fresh) = self.refresh.refresh_since(epoch).await {
            info!("Retrying request once after refresh");
            return self
                .send(&url, &request, Some(&fresh), tenant.as_ref())
                .await;
        }

        warn!("Backend rejected credential ({}); session expired", reason);
        self.events.emit_expired(reason);
        Ok(response)
    }

    async fn send(
        &self,
        url: &str,
        request: &ApiRequest,
        token: Option<&str>,
        tenant: Option<&TenantId>,
    ) -> Result<Response, GatewayError> {
        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(build_headers(request, token, tenant));
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(GatewayError::Transport)?;
        debug!("{} {} -> {}", request.method, url, response.status());
        Ok(response)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.fetch_json(path, ApiRequest::get()).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.fetch_json(path, ApiRequest::post().with_json(body)?).await
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.fetch_json(path, ApiRequest::put().with_json(body)?).await
    }

    /// Delete a resource, discarding any response body.
    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        let response = self.request(path, ApiRequest::delete()).await?;
        ApiError::check(response).await?;
        Ok(())
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        path: &str,
        request: ApiRequest,
    ) -> Result<T, ApiError> {
        let response = self.request(path, request).await?;
        let response = ApiError::check(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

fn build_headers(request: &ApiRequest, token: Option<&str>, tenant: Option<&TenantId>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.extend(request.headers.clone());

    if let Some(token) = token {
        match HeaderValue::from_str(&format!("Bearer {}", token)) {
            Ok(value) => {
                headers.insert(AUTHORIZATION, value);
            }
            Err(_) => warn!("Stored token is not a valid header value; sending without it"),
        }
    }
    if let Some(tenant) = tenant {
        match HeaderValue::from_str(tenant.as_str()) {
            Ok(value) => {
                headers.insert(TENANT_HEADER, value);
            }
            Err(_) => warn!("Tenant id {:?} is not a valid header value", tenant.as_str()),
        }
    }

    headers
}

/// Read a response body while keeping an equivalent response to return.
async fn buffer_response(response: Response) -> (Response, Vec<u8>) {
    let status = response.status();
    let version = response.version();
    let headers = response.headers().clone();
    let body = response
        .bytes()
        .await
        .map(|b| b.to_vec())
        .unwrap_or_default();

    let mut rebuilt = http::Response::new(body.clone());
    *rebuilt.status_mut() = status;
    *rebuilt.version_mut() = version;
    *rebuilt.headers_mut() = headers;
    (Response::from(rebuilt), body)
}

fn unauthorized_reason(body: &[u8]) -> SignOutReason {
    let parsed = ErrorBody::parse(body);
    parsed
        .reason
        .or(parsed.error)
        .filter(|r| !r.trim().is_empty())
        .map(SignOutReason::from)
        .unwrap_or(SignOutReason::Unauthorized)
}

fn token_expired_response() -> Response {
    let mut response = http::Response::new(TOKEN_EXPIRED_BODY.to_string());
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Response::from(response)
}
