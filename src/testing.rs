//! In-process backend and identity service used by tests.
//!
//! One axum server plays both roles: the tenant REST API under `/api` and
//! the identity toolkit endpoints under `/v1`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
};
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::auth::token::{mint_token_with, now_ms};

/// Refresh token the identity endpoints accept.
pub const REFRESH_TOKEN: &str = "refresh-1";

/// Password the identity endpoints accept.
pub const PASSWORD: &str = "secret";

#[derive(Clone, Default)]
struct Shared {
    api_hits: Arc<AtomicUsize>,
    identity_refreshes: Arc<AtomicUsize>,
    minted: Arc<AtomicUsize>,
    valid_token: Arc<Mutex<Option<String>>>,
    admin_token: Arc<Mutex<Option<String>>>,
    unauthorized_body: Arc<Mutex<Value>>,
    profile: Arc<Mutex<Value>>,
    seen_tenants: Arc<Mutex<Vec<Option<String>>>>,
}

pub struct MockBackend {
    origin: String,
    shared: Shared,
}

impl MockBackend {
    /// Start the server on an ephemeral port.
    pub async fn spawn() -> Self {
        let shared = Shared {
            unauthorized_body: Arc::new(Mutex::new(json!({ "error": "unauthorized" }))),
            profile: Arc::new(Mutex::new(json!({ "uid": "uid-1" }))),
            ..Default::default()
        };

        let app = Router::new()
            .route("/api/employees", get(employees).delete(employees))
            .route("/api/missing", get(missing))
            .route("/api/me", get(profile))
            .route("/api/superadmin/verify", get(verify_superadmin))
            .fallback(identity)
            .with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            origin: format!("http://{}", addr),
            shared,
        }
    }

    pub fn origin(&self) -> String {
        self.origin.clone()
    }

    pub fn api_url(&self) -> String {
        format!("{}/api", self.origin)
    }

    /// Only this token is accepted by `/api/employees`.
    pub fn accept_token(&self, token: &str) {
        *self.shared.valid_token.lock() = Some(token.to_string());
    }

    /// Only this token passes `/api/superadmin/verify`.
    pub fn accept_admin_token(&self, token: &str) {
        *self.shared.admin_token.lock() = Some(token.to_string());
    }

    pub fn set_unauthorized_body(&self, body: Value) {
        *self.shared.unauthorized_body.lock() = body;
    }

    pub fn set_profile(&self, profile: Value) {
        *self.shared.profile.lock() = profile;
    }

    /// Requests that reached any `/api` route.
    pub fn api_hits(&self) -> usize {
        self.shared.api_hits.load(Ordering::SeqCst)
    }

    pub fn identity_refreshes(&self) -> usize {
        self.shared.identity_refreshes.load(Ordering::SeqCst)
    }

    /// `X-Tenant-Id` values seen by `/api/employees`, in order.
    pub fn seen_tenants(&self) -> Vec<Option<String>> {
        self.shared.seen_tenants.lock().clone()
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

async fn employees(State(shared): State<Shared>, headers: HeaderMap) -> Response {
    shared.api_hits.fetch_add(1, Ordering::SeqCst);
    shared.seen_tenants.lock().push(
        headers
            .get("x-tenant-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );

    let valid = shared.valid_token.lock().clone();
    if valid.is_some() && bearer(&headers) == valid {
        (StatusCode::OK, Json(json!([{ "id": 1, "name": "Ada" }]))).into_response()
    } else {
        let body = shared.unauthorized_body.lock().clone();
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

async fn missing(State(shared): State<Shared>) -> Response {
    shared.api_hits.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "message": "Employee not found" })),
    )
        .into_response()
}

async fn profile(State(shared): State<Shared>) -> Response {
    shared.api_hits.fetch_add(1, Ordering::SeqCst);
    let profile = shared.profile.lock().clone();
    Json(profile).into_response()
}

async fn verify_superadmin(State(shared): State<Shared>, headers: HeaderMap) -> Response {
    shared.api_hits.fetch_add(1, Ordering::SeqCst);
    let admin = shared.admin_token.lock().clone();
    if admin.is_some() && bearer(&headers) == admin {
        Json(json!({ "role": "superadmin" })).into_response()
    } else {
        (StatusCode::FORBIDDEN, Json(json!({ "error": "forbidden" }))).into_response()
    }
}

fn mint(shared: &Shared) -> String {
    let n = shared.minted.fetch_add(1, Ordering::SeqCst);
    mint_token_with(json!({ "exp": now_ms() / 1000 + 3600, "sub": "uid-1", "n": n }))
}

/// Identity toolkit endpoints. Their paths contain `:`, so they are matched
/// by hand instead of through the router.
async fn identity(State(shared): State<Shared>, method: Method, uri: Uri, body: Bytes) -> Response {
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let rejected = |message: &str| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "code": 400, "message": message } })),
        )
            .into_response()
    };

    match (method, uri.path()) {
        (Method::POST, "/v1/accounts:signInWithPassword") => {
            if payload["password"] != PASSWORD {
                return rejected("INVALID_PASSWORD");
            }
            Json(json!({
                "localId": "uid-1",
                "email": payload["email"],
                "idToken": mint(&shared),
                "refreshToken": REFRESH_TOKEN,
                "expiresIn": "3600",
            }))
            .into_response()
        }
        (Method::POST, "/v1/token") => {
            if payload["refresh_token"] != REFRESH_TOKEN {
                return rejected("TOKEN_EXPIRED");
            }
            shared.identity_refreshes.fetch_add(1, Ordering::SeqCst);
            Json(json!({
                "id_token": mint(&shared),
                "refresh_token": REFRESH_TOKEN,
                "expires_in": "3600",
                "user_id": "uid-1",
            }))
            .into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}
