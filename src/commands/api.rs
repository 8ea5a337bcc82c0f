//! The read API for the UI: a plain-HTTP surface, fronted by the
//! cluster's own ingress/TLS termination rather than terminating TLS
//! itself the way the admission/ingestion plane in `commands/webhook.rs`
//! does. Every handler authenticates the caller's bearer token, then asks
//! `src/auth.rs::authorize` (through a short-TTL cache) whether the caller
//! may perform the requested verb in the target tenant.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::info;

use session_operator::auth::{self, AuthzCache, Identity};
use session_operator::crd::{NamespacePolicy, Session};
use session_operator::error::CoreError;
use session_operator::tenants::{self, Permission};
use session_operator::workload::SESSION_LABEL;

const FIELD_MANAGER: &str = "session-operator-api";
const AUTHZ_CACHE_TTL: Duration = Duration::from_secs(30);
const AUTHZ_CACHE_MAX_ENTRIES: usize = 10_000;

#[derive(Clone)]
struct ApiState {
    client: Client,
    decoding_key: Arc<jsonwebtoken::DecodingKey>,
    authz_cache: Arc<AuthzCache>,
}

pub async fn serve(addr_str: &str, oidc_public_key_path: &str) -> Result<()> {
    println!("Starting read API server...\n");
    info!("api_starting");

    let client = Client::try_default().await.context("Failed to connect to Kubernetes cluster")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let key_pem = std::fs::read(oidc_public_key_path).context("Failed to read OIDC public key file")?;
    let decoding_key = jsonwebtoken::DecodingKey::from_rsa_pem(&key_pem).context("Failed to parse OIDC public key as RSA PEM")?;

    let addr: SocketAddr = addr_str.parse().context("Invalid address format")?;
    println!("  HTTP server .................. http://{addr}");
    println!();
    println!("Read API running. Press Ctrl+C to stop.\n");

    let state = ApiState {
        client,
        decoding_key: Arc::new(decoding_key),
        authz_cache: Arc::new(AuthzCache::new(AUTHZ_CACHE_TTL, AUTHZ_CACHE_MAX_ENTRIES)),
    };

    let app = build_api_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await.context("Failed to bind address")?;
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
    });

    tokio::select! {
        result = server => { result?; }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown_signal_received");
            let _ = shutdown_tx.send(());
        }
    }

    info!("api_stopped");
    println!("Read API server stopped.");
    Ok(())
}

pub(crate) fn build_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/tenants", get(list_tenants_handler))
        .route("/tenants/:tenant/sessions", get(list_sessions_handler).post(create_session_handler))
        .route("/tenants/:tenant/sessions/:session", get(get_session_handler).delete(delete_session_handler))
        .route("/tenants/:tenant/sessions/:session/stop", post(stop_session_handler))
        .route("/tenants/:tenant/sessions/:session/logs", get(logs_handler))
        .route("/tenants/:tenant/sessions/:session/artifacts", get(artifacts_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .with_state(state)
}

/* ============================= AUTHN/AUTHZ HELPERS ============================= */

fn bearer_from_headers(headers: &HeaderMap) -> Result<&str, CoreError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| CoreError::auth_n("missing bearer token"))
}

fn authenticate(state: &ApiState, headers: &HeaderMap) -> Result<Identity, CoreError> {
    let token = bearer_from_headers(headers)?;
    auth::validate_bearer_token(token, &state.decoding_key)
}

async fn authorize_cached(state: &ApiState, identity: &Identity, verb: &str, resource: &str, tenant: &str) -> Result<(), CoreError> {
    if let Some(decision) = state.authz_cache.get(&identity.username, verb, resource, tenant) {
        return if decision { Ok(()) } else { Err(CoreError::auth_z(format!("not authorized to {verb} {resource} in {tenant}"))) };
    }
    let decision = auth::authorize(&state.client, identity, verb, resource, tenant).await?;
    state.authz_cache.insert(&identity.username, verb, resource, tenant, decision);
    if decision {
        Ok(())
    } else {
        Err(CoreError::auth_z(format!("not authorized to {verb} {resource} in {tenant}")))
    }
}

/* ============================= TENANTS ============================= */

async fn list_tenants_handler(State(state): State<ApiState>, headers: HeaderMap) -> axum::response::Response {
    let identity = match authenticate(&state, &headers) {
        Ok(i) => i,
        Err(e) => return e.into_response(),
    };

    let client = state.client.clone();
    let admin = identity.is_system_admin();
    let result = tenants::list_tenants_for_caller(&client, |tenant: String| {
        let client = client.clone();
        let identity = identity.clone();
        async move {
            if admin {
                return Some(Permission::Editor);
            }
            match auth::authorize(&client, &identity, "list", "namespacepolicies", &tenant).await {
                Ok(true) => Some(Permission::Viewer),
                Ok(false) => None,
                Err(_) => None,
            }
        }
    })
    .await;

    match result {
        Ok(summaries) => axum::Json(summaries).into_response(),
        Err(e) => e.into_response(),
    }
}

/* ============================= SESSIONS ============================= */

#[derive(Debug, Deserialize)]
struct ListSessionsQuery {
    #[serde(default)]
    phase: Option<String>,
}

async fn list_sessions_handler(
    State(state): State<ApiState>,
    Path(tenant): Path<String>,
    Query(query): Query<ListSessionsQuery>,
    headers: HeaderMap,
) -> axum::response::Response {
    let identity = match authenticate(&state, &headers) {
        Ok(i) => i,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = authorize_cached(&state, &identity, "list", "sessions", &tenant).await {
        return e.into_response();
    }

    let api: Api<Session> = Api::namespaced(state.client.clone(), &tenant);
    match api.list(&ListParams::default()).await {
        Ok(list) => {
            let items: Vec<&Session> = list
                .items
                .iter()
                .filter(|s| match &query.phase {
                    Some(wanted) => s.status.as_ref().map(|st| format!("{:?}", st.phase)) == Some(wanted.clone()),
                    None => true,
                })
                .collect();
            axum::Json(items).into_response()
        }
        Err(e) => CoreError::from(e).into_response(),
    }
}

async fn get_session_handler(
    State(state): State<ApiState>,
    Path((tenant, session)): Path<(String, String)>,
    headers: HeaderMap,
) -> axum::response::Response {
    let identity = match authenticate(&state, &headers) {
        Ok(i) => i,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = authorize_cached(&state, &identity, "get", "sessions", &tenant).await {
        return e.into_response();
    }

    let api: Api<Session> = Api::namespaced(state.client.clone(), &tenant);
    match api.get_opt(&session).await {
        Ok(Some(s)) => axum::Json(s).into_response(),
        Ok(None) => CoreError::not_found(format!("session '{session}' not found")).into_response(),
        Err(e) => CoreError::from(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    framework_type: String,
    framework_version: String,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default)]
    artifact_location: Option<String>,
}

async fn create_session_handler(
    State(state): State<ApiState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    axum::Json(req): axum::Json<CreateSessionRequest>,
) -> axum::response::Response {
    use session_operator::crd::{ArtifactBackend, ArtifactStorage, SessionFramework, SessionPolicySnapshot, SessionSpec, SessionTrigger};

    let identity = match authenticate(&state, &headers) {
        Ok(i) => i,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = authorize_cached(&state, &identity, "create", "sessions", &tenant).await {
        return e.into_response();
    }

    let policy = SessionPolicySnapshot::from_framework_config(&req.config);
    let spec = SessionSpec {
        trigger: SessionTrigger { source: "manual".into(), event: "manual.create".into(), payload: serde_json::Value::Null },
        framework: SessionFramework { kind: req.framework_type, version: req.framework_version, config: req.config },
        policy,
        artifact_storage: ArtifactStorage {
            backend: ArtifactBackend::ObjectStore,
            location: req.artifact_location.unwrap_or_else(|| format!("s3://session-artifacts/{tenant}")),
        },
        stop_requested: false,
    };

    let name = format!("sess-{}", &uuid::Uuid::new_v4().simple().to_string()[..16]);
    let session = Session::new(&name, spec);

    let api: Api<Session> = Api::namespaced(state.client.clone(), &tenant);
    match api.create(&Default::default(), &session).await {
        Ok(created) => (StatusCode::CREATED, axum::Json(created)).into_response(),
        Err(e) => CoreError::from(e).into_response(),
    }
}

async fn stop_session_handler(
    State(state): State<ApiState>,
    Path((tenant, session)): Path<(String, String)>,
    headers: HeaderMap,
) -> axum::response::Response {
    let identity = match authenticate(&state, &headers) {
        Ok(i) => i,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = authorize_cached(&state, &identity, "update", "sessions", &tenant).await {
        return e.into_response();
    }

    let api: Api<Session> = Api::namespaced(state.client.clone(), &tenant);
    let patch = serde_json::json!({ "spec": { "stopRequested": true } });
    match api.patch(&session, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch)).await {
        Ok(updated) => axum::Json(updated).into_response(),
        Err(e) => CoreError::from(e).into_response(),
    }
}

async fn delete_session_handler(
    State(state): State<ApiState>,
    Path((tenant, session)): Path<(String, String)>,
    headers: HeaderMap,
) -> axum::response::Response {
    let identity = match authenticate(&state, &headers) {
        Ok(i) => i,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = authorize_cached(&state, &identity, "delete", "sessions", &tenant).await {
        return e.into_response();
    }

    let api: Api<Session> = Api::namespaced(state.client.clone(), &tenant);
    match api.delete(&session, &DeleteParams::default()).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => CoreError::from(e).into_response(),
    }
}

/* ============================= LOGS / ARTIFACTS ============================= */

async fn logs_handler(
    State(state): State<ApiState>,
    Path((tenant, session)): Path<(String, String)>,
    headers: HeaderMap,
) -> axum::response::Response {
    let identity = match authenticate(&state, &headers) {
        Ok(i) => i,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = authorize_cached(&state, &identity, "get", "sessions", &tenant).await {
        return e.into_response();
    }

    let pods: Api<k8s_openapi::api::core::v1::Pod> = Api::namespaced(state.client.clone(), &tenant);
    let selector = format!("{SESSION_LABEL}={session}");
    let found = match pods.list(&ListParams::default().labels(&selector)).await {
        Ok(list) => list,
        Err(e) => return CoreError::from(e).into_response(),
    };

    let Some(pod) = found.items.first() else {
        return CoreError::not_found(format!("no runner pod found for session '{session}'")).into_response();
    };
    let pod_name = pod.name_any();

    match pods.logs(&pod_name, &kube::api::LogParams { tail_lines: Some(1000), ..Default::default() }).await {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => CoreError::from(e).into_response(),
    }
}

async fn artifacts_handler(
    State(state): State<ApiState>,
    Path((tenant, session)): Path<(String, String)>,
    headers: HeaderMap,
) -> axum::response::Response {
    let identity = match authenticate(&state, &headers) {
        Ok(i) => i,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = authorize_cached(&state, &identity, "get", "sessions", &tenant).await {
        return e.into_response();
    }

    let api: Api<Session> = Api::namespaced(state.client.clone(), &tenant);
    match api.get_opt(&session).await {
        Ok(Some(s)) => axum::Json(s.status.map(|st| st.artifacts).unwrap_or_default()).into_response(),
        Ok(None) => CoreError::not_found(format!("session '{session}' not found")).into_response(),
        Err(e) => CoreError::from(e).into_response(),
    }
}

#[allow(dead_code)]
async fn list_policies_for_debug(client: &Client) -> Result<Vec<NamespacePolicy>, CoreError> {
    let api: Api<NamespacePolicy> = Api::all(client.clone());
    Ok(api.list(&ListParams::default()).await?.items)
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_from_headers_extracts_token() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_from_headers(&headers).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn test_bearer_from_headers_missing() {
        assert!(bearer_from_headers(&HeaderMap::new()).is_err());
    }

    #[tokio::test]
    async fn test_healthz_route() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let client = Client::try_from(kube::Config::new("https://localhost:0".parse().unwrap())).expect("fake client");
        let key_pem = br#"-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEAwT6...fake...IDAQAB
-----END PUBLIC KEY-----"#;
        // This is not a parseable key; the healthz route doesn't touch decoding_key.
        let decoding_key = jsonwebtoken::DecodingKey::from_secret(key_pem);
        let state = ApiState { client, decoding_key: Arc::new(decoding_key), authz_cache: Arc::new(AuthzCache::new(AUTHZ_CACHE_TTL, AUTHZ_CACHE_MAX_ENTRIES)) };
        let app = build_api_router(state);
        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
