//! The Ingress Plane's TLS-fronted HTTP surface: the two admission
//! validators the API server calls synchronously on every Session/
//! NamespacePolicy write, the external webhook ingestion pipeline that
//! turns a source event into a Session, and the runner callback route.
//! All three share one `axum_server::bind_rustls` process, because they
//! share the same TLS material and lifecycle.

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Bytes, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use chrono::Utc;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use prometheus::{Encoder, Histogram, IntCounterVec, Registry, TextEncoder};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use session_operator::admission::{self, AdmissionVerdict};
use session_operator::auth;
use session_operator::crd::{ArtifactBackend, ArtifactRef, ArtifactStorage, HistoryEntry, NamespacePolicy, NotificationEvent, ResourceUsage, Session, SessionFramework, SessionPhase, SessionPolicySnapshot, SessionSpec, SessionTrigger, NAMESPACE_POLICY_NAME};
use session_operator::error::CoreError;
use session_operator::frameworks;
use session_operator::notify::{NotificationPayload, Outbox};
use session_operator::ratelimit::RateLimiters;

/* ============================= PROMETHEUS ============================= */

static WEBHOOK_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static WEBHOOK_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(prometheus::Opts::new("webhook_requests_total", "Total requests to the ingress plane"), &["route", "allowed"])
        .expect("metric definition is valid");
    WEBHOOK_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static WEBHOOK_DENIALS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("webhook_denials_total", "Total admission/ingestion denials by tenant and reason"),
        &["tenant", "reason"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static WEBHOOK_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "webhook_request_duration_seconds",
        "Duration of ingress plane request processing in seconds",
    ))
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

static WEBHOOK_RATE_LIMITED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("webhook_rate_limited_total", "Total webhook deliveries rejected for exceeding a tenant's rate limit"),
        &["tenant", "source"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

/* ============================= STATE ============================= */

#[derive(Clone)]
pub(crate) struct WebhookState {
    client: Client,
    ready: bool,
    rate_limiters: Arc<RateLimiters>,
    callback_secret: Arc<Vec<u8>>,
    outbox: Outbox,
}

/* ============================= ENTRY: SERVE ============================= */

pub async fn serve(addr_str: &str, tls_cert: &str, tls_key: &str) -> Result<()> {
    println!("Starting ingress plane server...\n");
    info!("webhook_starting");

    let client = Client::try_default().await.context("Failed to connect to Kubernetes cluster")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    print!("  TLS ......................... ");
    validate_tls_files(tls_cert, tls_key)?;
    println!("loaded ({tls_cert}, {tls_key})");

    let callback_secret = std::env::var("CALLBACK_SIGNING_SECRET")
        .context("CALLBACK_SIGNING_SECRET must be set so runner callback tokens can be verified")?
        .into_bytes();

    let addr: SocketAddr = addr_str.parse().context("Invalid address format")?;

    println!("  HTTPS server ................ https://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    POST /validate/session .... SessionValidator admission review");
    println!("    POST /validate/policy ..... PolicyValidator admission review");
    println!("    POST /webhooks/:source .... external event ingestion");
    println!("    POST /callback/:sessionId . runner status callback");
    println!("    GET  /healthz ............. Liveness probe");
    println!("    GET  /readyz .............. Readiness probe");
    println!("    GET  /metrics ............. Prometheus metrics");
    println!();
    println!("Ingress plane running. Press Ctrl+C to stop.\n");

    let state = WebhookState {
        client,
        ready: true,
        rate_limiters: Arc::new(RateLimiters::new()),
        callback_secret: Arc::new(callback_secret),
        outbox: Outbox::spawn(reqwest::Client::new()),
    };

    let tls_cert = tls_cert.to_string();
    let tls_key = tls_key.to_string();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let http_shutdown = shutdown_tx.subscribe();

    let http_handle = tokio::spawn(async move { start_https_server(state, http_shutdown, addr, &tls_cert, &tls_key).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("webhook_stopped");
    println!("Ingress plane server stopped.");
    Ok(())
}

/* ============================= TLS ============================= */

fn validate_tls_files(cert_path: &str, key_path: &str) -> Result<()> {
    if !std::path::Path::new(cert_path).exists() {
        anyhow::bail!("TLS certificate file not found: {}", cert_path);
    }
    if !std::path::Path::new(key_path).exists() {
        anyhow::bail!("TLS key file not found: {}", key_path);
    }
    Ok(())
}

/* ============================= HTTPS SERVER ============================= */

pub(crate) fn build_webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/validate/session", post(validate_session_handler))
        .route("/validate/policy", post(validate_policy_handler))
        .route("/webhooks/:source", post(ingest_handler))
        .route("/callback/:session_id", post(callback_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
        .route("/metrics", get(webhook_metrics_handler))
        .with_state(state)
}

async fn start_https_server(
    state: WebhookState,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
    tls_cert: &str,
    tls_key: &str,
) -> Result<()> {
    let app = build_webhook_router(state);

    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(tls_cert, tls_key)
        .await
        .context("Failed to load TLS configuration")?;

    info!(addr = %addr, "https_server_started");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    axum_server::bind_rustls(addr, rustls_config).handle(handle).serve(app.into_make_service()).await?;

    Ok(())
}

async fn ready_handler(state: WebhookState) -> impl IntoResponse {
    if state.ready { (StatusCode::OK, "READY") } else { (StatusCode::SERVICE_UNAVAILABLE, "NOT READY") }
}

async fn webhook_metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = WEBHOOK_REGISTRY.gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

/* ============================= ADMISSION: SESSION ============================= */

async fn validate_session_handler(State(state): State<WebhookState>, body: String) -> impl IntoResponse {
    let _timer = WEBHOOK_DURATION.start_timer();
    let Ok(review) = serde_json::from_str::<serde_json::Value>(&body) else {
        WEBHOOK_REQUESTS.with_label_values(&["validate_session", "false"]).inc();
        return (StatusCode::BAD_REQUEST, build_admission_response("", false, Some("malformed AdmissionReview")));
    };

    let uid = review["request"]["uid"].as_str().unwrap_or("").to_string();
    let operation = review["request"]["operation"].as_str().unwrap_or("UNKNOWN").to_string();
    let tenant = review["request"]["namespace"].as_str().unwrap_or("").to_string();

    let verdict = match operation.as_str() {
        "CREATE" => validate_session_create_request(&state.client, &review, &tenant).await,
        "UPDATE" => validate_session_update_request(&review),
        _ => AdmissionVerdict::allow(),
    };

    record_verdict("validate_session", &tenant, &verdict);
    (StatusCode::OK, build_admission_response(&uid, verdict.allowed, verdict.message.as_deref()))
}

async fn validate_session_create_request(client: &Client, review: &serde_json::Value, tenant: &str) -> AdmissionVerdict {
    let Ok(session) = serde_json::from_value::<Session>(review["request"]["object"].clone()) else {
        return AdmissionVerdict::deny("MalformedObject", "request.object is not a well-formed Session");
    };

    let policies: Api<NamespacePolicy> = Api::namespaced(client.clone(), tenant);
    let policy = match policies.get_opt(NAMESPACE_POLICY_NAME).await {
        Ok(p) => p,
        Err(e) => return AdmissionVerdict::deny("LookupFailed", format!("could not look up tenant policy: {e}")),
    };

    let sessions: Api<Session> = Api::namespaced(client.clone(), tenant);
    let active_sessions = match sessions.list(&ListParams::default()).await {
        Ok(list) => list.items.iter().filter(|s| !s.status.as_ref().map(|st| st.phase.clone()).unwrap_or_default().is_terminal()).count() as u32,
        Err(e) => return AdmissionVerdict::deny("LookupFailed", format!("could not count active sessions: {e}")),
    };

    let budget_used = policy.as_ref().and_then(|p| p.status.as_ref()).map(|s| s.usage.budget.current_period).unwrap_or_default();

    admission::validate_session_create(&session.spec, policy.as_ref().map(|p| &p.spec), budget_used, active_sessions)
}

fn validate_session_update_request(review: &serde_json::Value) -> AdmissionVerdict {
    let (Ok(old), Ok(new)) = (
        serde_json::from_value::<Session>(review["request"]["oldObject"].clone()),
        serde_json::from_value::<Session>(review["request"]["object"].clone()),
    ) else {
        return AdmissionVerdict::deny("MalformedObject", "request.object/oldObject is not a well-formed Session");
    };
    admission::validate_session_update(&old.spec, &new.spec)
}

/* ============================= ADMISSION: POLICY ============================= */

async fn validate_policy_handler(body: String) -> impl IntoResponse {
    let _timer = WEBHOOK_DURATION.start_timer();
    let Ok(review) = serde_json::from_str::<serde_json::Value>(&body) else {
        WEBHOOK_REQUESTS.with_label_values(&["validate_policy", "false"]).inc();
        return (StatusCode::BAD_REQUEST, build_admission_response("", false, Some("malformed AdmissionReview")));
    };

    let uid = review["request"]["uid"].as_str().unwrap_or("").to_string();
    let tenant = review["request"]["namespace"].as_str().unwrap_or("").to_string();

    let verdict = match serde_json::from_value::<NamespacePolicy>(review["request"]["object"].clone()) {
        Ok(policy) => admission::validate_policy_write(&policy.spec),
        Err(_) => AdmissionVerdict::deny("MalformedObject", "request.object is not a well-formed NamespacePolicy"),
    };

    record_verdict("validate_policy", &tenant, &verdict);
    (StatusCode::OK, build_admission_response(&uid, verdict.allowed, verdict.message.as_deref()))
}

fn record_verdict(route: &str, tenant: &str, verdict: &AdmissionVerdict) {
    WEBHOOK_REQUESTS.with_label_values(&[route, if verdict.allowed { "true" } else { "false" }]).inc();
    if !verdict.allowed {
        let reason = verdict.reason.as_deref().unwrap_or("Unknown");
        WEBHOOK_DENIALS.with_label_values(&[tenant, reason]).inc();
        info!(tenant, route, reason, "admission_denied");
    }
}

fn build_admission_response(uid: &str, allowed: bool, message: Option<&str>) -> String {
    let mut response = serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": { "uid": uid, "allowed": allowed }
    });
    if let Some(msg) = message {
        response["response"]["status"] = serde_json::json!({ "message": msg });
    }
    response.to_string()
}

/* ============================= WEBHOOK INGESTION ============================= */

async fn ingest_handler(State(state): State<WebhookState>, Path(source): Path<String>, headers: HeaderMap, body: Bytes) -> axum::response::Response {
    let _timer = WEBHOOK_DURATION.start_timer();

    let Some(presented_key) = presented_credential(&headers) else {
        return CoreError::auth_n("no webhook credential presented").into_response();
    };

    let all_policies: Api<NamespacePolicy> = Api::all(state.client.clone());
    let policies = match all_policies.list(&ListParams::default()).await {
        Ok(list) => list,
        Err(e) => return CoreError::from(e).into_response(),
    };

    let candidates: Vec<(&str, &std::collections::BTreeMap<String, String>)> = policies
        .items
        .iter()
        .filter_map(|p| p.metadata.namespace.as_deref().map(|ns| (ns, &p.spec.webhook_auth.api_keys)))
        .collect();

    let Some(tenant) = auth::resolve_tenant_by_api_key(&source, &presented_key, candidates) else {
        WEBHOOK_REQUESTS.with_label_values(&["ingest", "false"]).inc();
        return CoreError::auth_n(format!("no tenant registered for source '{source}' with the presented credential")).into_response();
    };
    let tenant = tenant.to_string();

    let policy = policies.items.iter().find(|p| p.metadata.namespace.as_deref() == Some(tenant.as_str())).cloned().unwrap_or_default();

    if !state.rate_limiters.check(&tenant, &source, &policy.spec.webhook_auth.rate_limit) {
        WEBHOOK_RATE_LIMITED.with_label_values(&[&tenant, &source]).inc();
        return CoreError::rate_limited(format!("rate limit exceeded for tenant '{tenant}' source '{source}'")).into_response();
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return CoreError::shape_invalid("MalformedPayload", format!("invalid JSON body: {e}")).into_response(),
    };

    let session_spec = build_session_spec_from_webhook(&source, &tenant, &payload);
    let session_name = format!("sess-{}", &Uuid::new_v4().simple().to_string()[..16]);
    let session = Session::new(&session_name, session_spec);

    let sessions: Api<Session> = Api::namespaced(state.client.clone(), &tenant);
    let created = match sessions.create(&Default::default(), &session).await {
        Ok(s) => s,
        Err(e) => {
            let err = CoreError::from(e);
            WEBHOOK_REQUESTS.with_label_values(&["ingest", "false"]).inc();
            return err.into_response();
        }
    };

    WEBHOOK_REQUESTS.with_label_values(&["ingest", "true"]).inc();
    info!(tenant = %tenant, source = %source, session = %created.name_any(), "session_accepted");

    state.outbox.enqueue(
        &policy.spec.notifications.webhooks,
        NotificationPayload {
            event: NotificationEvent::SessionCreated,
            tenant: tenant.clone(),
            session: created.name_any(),
            phase: "Pending".to_string(),
            message: format!("session {} accepted from source '{source}'", created.name_any()),
        },
    );

    let estimated_start_time = Utc::now() + chrono::Duration::seconds(30);
    (
        StatusCode::ACCEPTED,
        axum::Json(serde_json::json!({
            "sessionId": created.name_any(),
            "tenant": tenant,
            "status": "accepted",
            "estimatedStartTime": estimated_start_time.to_rfc3339(),
        })),
    )
        .into_response()
}

fn presented_credential(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("X-Api-Key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

fn build_session_spec_from_webhook(source: &str, tenant: &str, payload: &serde_json::Value) -> SessionSpec {
    let event = payload["event"].as_str().unwrap_or("webhook.received").to_string();
    let framework_kind = payload["framework"]["type"].as_str().map(String::from);
    let framework_version = payload["framework"]["version"].as_str().map(String::from);

    let framework = match (framework_kind, framework_version) {
        (Some(kind), Some(version)) => SessionFramework { kind, version, config: payload["framework"]["config"].clone() },
        _ => {
            let default = frameworks::all_frameworks().into_iter().next().expect("at least one framework is registered");
            SessionFramework { kind: default.kind, version: default.version, config: serde_json::Value::Null }
        }
    };

    let policy = SessionPolicySnapshot::from_framework_config(&framework.config);

    SessionSpec {
        trigger: SessionTrigger { source: source.to_string(), event, payload: payload.clone() },
        framework,
        policy,
        artifact_storage: ArtifactStorage {
            backend: ArtifactBackend::ObjectStore,
            location: format!("s3://session-artifacts/{tenant}"),
        },
        stop_requested: false,
    }
}

/* ============================= RUNNER CALLBACK ============================= */

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallbackPayload {
    tenant: String,
    event: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    artifacts: Vec<ArtifactRef>,
    #[serde(default)]
    resource_usage: Option<ResourceUsage>,
}

async fn callback_handler(State(state): State<WebhookState>, Path(session_id): Path<String>, headers: HeaderMap, body: Bytes) -> axum::response::Response {
    let _timer = WEBHOOK_DURATION.start_timer();

    let payload: CallbackPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => return CoreError::shape_invalid("MalformedCallback", format!("invalid callback body: {e}")).into_response(),
    };

    let Some(token) = headers.get("X-Callback-Token").and_then(|v| v.to_str().ok()) else {
        return CoreError::auth_n("missing X-Callback-Token header").into_response();
    };
    if !auth::verify_callback_token(&state.callback_secret, &session_id, &payload.tenant, token) {
        WEBHOOK_REQUESTS.with_label_values(&["callback", "false"]).inc();
        return CoreError::auth_n("callback token does not match session/tenant binding").into_response();
    }

    let sessions: Api<Session> = Api::namespaced(state.client.clone(), &payload.tenant);
    let session = match sessions.get_opt(&session_id).await {
        Ok(Some(s)) => s,
        Ok(None) => return CoreError::not_found(format!("session '{session_id}' not found")).into_response(),
        Err(e) => return CoreError::from(e).into_response(),
    };

    let mut status = session.status.clone().unwrap_or_default();
    status.push_history(HistoryEntry::new(Utc::now(), payload.event.clone(), payload.data.clone()));
    status.artifacts.extend(payload.artifacts.clone());
    if let Some(usage) = payload.resource_usage.clone() {
        status.resource_usage = Some(usage);
    }

    let patch = serde_json::json!({ "status": status });
    if let Err(e) = sessions.patch_status(&session_id, &PatchParams::apply("session-operator"), &Patch::Merge(&patch)).await {
        return CoreError::from(e).into_response();
    }

    WEBHOOK_REQUESTS.with_label_values(&["callback", "true"]).inc();
    info!(tenant = %payload.tenant, session = %session_id, event = %payload.event, "callback_accepted");
    StatusCode::OK.into_response()
}

/* ============================= CERT GENERATION ============================= */

pub fn generate_certs(service_name: &str, namespace: &str, output_dir: &str, ip_sans: &[String]) -> Result<()> {
    println!("Generating self-signed TLS certificates...\n");

    let (ca_pem, cert_pem, key_pem) = generate_self_signed_certs(service_name, namespace, ip_sans)?;

    let output_path = std::path::Path::new(output_dir);
    if !output_path.exists() {
        std::fs::create_dir_all(output_path).context("Failed to create output directory")?;
    }

    let ca_path = output_path.join("ca.crt");
    let cert_path = output_path.join("tls.crt");
    let key_path = output_path.join("tls.key");

    std::fs::write(&ca_path, &ca_pem).context("Failed to write ca.crt")?;
    std::fs::write(&cert_path, &cert_pem).context("Failed to write tls.crt")?;
    std::fs::write(&key_path, &key_pem).context("Failed to write tls.key")?;

    println!("  CA certificate .............. {}", ca_path.display());
    println!("  Server certificate .......... {}", cert_path.display());
    println!("  Server key .................. {}", key_path.display());
    println!();
    println!("  Service name ................ {service_name}");
    println!("  Namespace ................... {namespace}");
    println!("  SANs:");
    println!("    - {service_name}.{namespace}.svc");
    println!("    - {service_name}.{namespace}.svc.cluster.local");
    for ip in ip_sans {
        println!("    - {ip} (IP)");
    }
    println!();
    println!("TLS certificates generated successfully.");

    Ok(())
}

pub fn generate_self_signed_certs(service_name: &str, namespace: &str, ip_sans: &[String]) -> Result<(String, String, String)> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
    use std::net::IpAddr;

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let mut ca_dn = DistinguishedName::new();
    ca_dn.push(DnType::CommonName, "session-operator-webhook-ca");
    ca_dn.push(DnType::OrganizationName, "session-operator");
    ca_params.distinguished_name = ca_dn;

    let ca_key = KeyPair::generate().context("Failed to generate CA key pair")?;
    let ca_cert = ca_params.self_signed(&ca_key).context("Failed to self-sign CA certificate")?;

    let mut server_params = CertificateParams::default();
    let mut server_dn = DistinguishedName::new();
    server_dn.push(DnType::CommonName, format!("{service_name}.{namespace}.svc"));
    server_params.distinguished_name = server_dn;

    let mut sans = vec![
        SanType::DnsName(format!("{service_name}.{namespace}.svc").try_into().context("Invalid DNS name for SAN")?),
        SanType::DnsName(format!("{service_name}.{namespace}.svc.cluster.local").try_into().context("Invalid DNS name for SAN")?),
    ];

    for ip_str in ip_sans {
        let ip: IpAddr = ip_str.parse().context(format!("Invalid IP address for SAN: {ip_str}"))?;
        sans.push(SanType::IpAddress(ip));
    }

    server_params.subject_alt_names = sans;

    let server_key = KeyPair::generate().context("Failed to generate server key pair")?;
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).context("Failed to sign server certificate")?;

    Ok((ca_cert.pem(), server_cert.pem(), server_key.serialize_pem()))
}

/* ============================= INSTALL CONFIG ============================= */

pub fn install_config(service_name: &str, namespace: &str, ca_bundle_path: &str) -> Result<()> {
    use base64::Engine;

    let ca_bytes = std::fs::read(ca_bundle_path).context("Failed to read CA bundle file")?;
    let ca_b64 = base64::engine::general_purpose::STANDARD.encode(&ca_bytes);

    let yaml = format!(
        r#"apiVersion: admissionregistration.k8s.io/v1
kind: ValidatingWebhookConfiguration
metadata:
  name: {service_name}
webhooks:
  - name: validate-session.sessions.io
    rules:
      - apiGroups: ["sessions.io"]
        resources: ["sessions"]
        apiVersions: ["v1"]
        operations: ["CREATE", "UPDATE"]
    clientConfig:
      service:
        name: {service_name}
        namespace: {namespace}
        path: /validate/session
      caBundle: {ca_b64}
    failurePolicy: Fail
    sideEffects: None
    admissionReviewVersions: ["v1"]
  - name: validate-policy.sessions.io
    rules:
      - apiGroups: ["sessions.io"]
        resources: ["namespacepolicies"]
        apiVersions: ["v1"]
        operations: ["CREATE", "UPDATE"]
    clientConfig:
      service:
        name: {service_name}
        namespace: {namespace}
        path: /validate/policy
      caBundle: {ca_b64}
    failurePolicy: Fail
    sideEffects: None
    admissionReviewVersions: ["v1"]
"#
    );

    println!("{yaml}");
    Ok(())
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_admission_response_allowed() {
        let resp = build_admission_response("test-uid-123", true, None);
        let v: serde_json::Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["response"]["uid"], "test-uid-123");
        assert_eq!(v["response"]["allowed"], true);
        assert!(v["response"]["status"].is_null());
    }

    #[test]
    fn test_build_admission_response_denied() {
        let resp = build_admission_response("test-uid-456", false, Some("NoPolicy"));
        let v: serde_json::Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["response"]["uid"], "test-uid-456");
        assert_eq!(v["response"]["allowed"], false);
        assert_eq!(v["response"]["status"]["message"], "NoPolicy");
    }

    #[test]
    fn test_presented_credential_prefers_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Api-Key", "abc123".parse().unwrap());
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer xyz".parse().unwrap());
        assert_eq!(presented_credential(&headers), Some("abc123".to_string()));
    }

    #[test]
    fn test_presented_credential_falls_back_to_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer xyz".parse().unwrap());
        assert_eq!(presented_credential(&headers), Some("xyz".to_string()));
    }

    #[test]
    fn test_presented_credential_absent() {
        assert_eq!(presented_credential(&HeaderMap::new()), None);
    }

    #[test]
    fn test_build_session_spec_from_webhook_uses_payload_framework() {
        let payload = serde_json::json!({
            "event": "issue.opened",
            "framework": {"type": "aider", "version": "0.9", "config": {"model": "gpt"}}
        });
        let spec = build_session_spec_from_webhook("github", "team-alpha", &payload);
        assert_eq!(spec.trigger.event, "issue.opened");
        assert_eq!(spec.framework.kind, "aider");
        assert_eq!(spec.framework.version, "0.9");
    }

    #[test]
    fn test_build_session_spec_from_webhook_defaults_framework() {
        let payload = serde_json::json!({});
        let spec = build_session_spec_from_webhook("github", "team-alpha", &payload);
        assert_eq!(spec.trigger.event, "webhook.received");
        assert!(!spec.framework.kind.is_empty());
    }

    #[test]
    fn test_generate_self_signed_certs() {
        let (ca_pem, cert_pem, key_pem) = generate_self_signed_certs("my-webhook", "production", &[]).unwrap();
        assert!(ca_pem.contains("BEGIN CERTIFICATE"));
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));
        assert_ne!(ca_pem, cert_pem);
    }

    #[test]
    fn test_generate_certs_writes_files() {
        let temp_dir = std::env::temp_dir().join("session-operator-test-certgen");
        let _ = std::fs::remove_dir_all(&temp_dir);
        let _ = std::fs::create_dir_all(&temp_dir);

        let result = generate_certs("test-svc", "test-ns", temp_dir.to_str().unwrap(), &[]);
        assert!(result.is_ok());

        assert!(temp_dir.join("ca.crt").exists());
        assert!(temp_dir.join("tls.crt").exists());
        assert!(temp_dir.join("tls.key").exists());

        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_install_config_output() {
        let temp_dir = std::env::temp_dir().join("session-operator-test-webhook");
        let _ = std::fs::create_dir_all(&temp_dir);
        let ca_path = temp_dir.join("test-ca.crt");
        std::fs::write(&ca_path, "FAKE-CA-CERT").unwrap();

        let result = install_config("test-webhook", "test-ns", ca_path.to_str().unwrap());
        assert!(result.is_ok());

        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_validate_tls_files_missing_cert() {
        let result = validate_tls_files("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("certificate file not found"));
    }

    #[test]
    fn test_validate_tls_files_missing_key() {
        let temp_dir = std::env::temp_dir().join("session-operator-test-tls-validate");
        let _ = std::fs::create_dir_all(&temp_dir);
        let cert_path = temp_dir.join("cert.pem");
        std::fs::write(&cert_path, "CERT").unwrap();

        let result = validate_tls_files(cert_path.to_str().unwrap(), "/nonexistent/key.pem");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("key file not found"));

        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_webhook_duration_metric_registered() {
        LazyLock::force(&WEBHOOK_DURATION);
        let families = WEBHOOK_REGISTRY.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"webhook_request_duration_seconds"));
    }

    #[tokio::test]
    async fn test_healthz_and_metrics_routes() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let state = WebhookState {
            client: Client::try_from(kube::Config::new("https://localhost:0".parse().unwrap())).expect("fake client"),
            ready: true,
            rate_limiters: Arc::new(RateLimiters::new()),
            callback_secret: Arc::new(b"test-secret".to_vec()),
            outbox: Outbox::spawn(reqwest::Client::new()),
        };
        let app = build_webhook_router(state);
        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
