use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::{Client, ResourceExt};
use prometheus::{Encoder, IntCounter, IntGaugeVec, Registry, TextEncoder};
use rust_decimal::Decimal;
use tokio::signal;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use session_operator::crd::{AuditEntry, HistoryEntry, NamespacePolicy, NamespacePolicyStatus, RetentionDuration, Session, SessionPhase};
use session_operator::governance;

const REQUEUE_INTERVAL: Duration = Duration::from_secs(60);
const AUDIT_RETENTION: usize = 200;

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static POLICY_RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("policy_reconcile_total", "Total NamespacePolicy reconciliation cycles")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static POLICY_RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("policy_reconcile_errors_total", "Total NamespacePolicy reconciliation errors")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static BUDGET_PERCENT_USED: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("tenant_budget_percent_used", "Percent of monthly model budget used per tenant"),
        &["tenant"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

static POLICY_VIOLATION_COUNT: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("tenant_policy_violation_count", "Cumulative policy shape violations observed per tenant"),
        &["tenant"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

/* ============================= STATE / CONTEXT ============================= */

pub(crate) struct PolicyReconcileState {
    pub(crate) ready: bool,
}

struct PolicyReconcileContext {
    client: Client,
}

/* ============================= ENTRY ============================= */

pub async fn run() -> Result<()> {
    println!("Starting Policy reconciler...\n");

    let client = Client::try_default().await.context("Failed to load kubeconfig")?;
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let policies: Api<NamespacePolicy> = Api::all(client.clone());
    let ctx = Arc::new(PolicyReconcileContext { client: client.clone() });

    LazyLock::force(&POLICY_RECONCILE_TOTAL);
    LazyLock::force(&POLICY_RECONCILE_ERRORS);
    LazyLock::force(&BUDGET_PERCENT_USED);
    LazyLock::force(&POLICY_VIOLATION_COUNT);

    let addr = SocketAddr::from(([0, 0, 0, 0], 9091));
    println!("  CRD watch ................... NamespacePolicy.sessions.io/v1");
    println!("  Requeue interval ............ {}s", REQUEUE_INTERVAL.as_secs());
    println!("  Metrics server .............. http://{addr}");
    println!();
    println!("Policy reconciler running. Press Ctrl+C to stop.\n");

    info!("policy_reconciler_started");

    let state = Arc::new(Mutex::new(PolicyReconcileState { ready: false }));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_state = state.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move { start_metrics_server(http_state, http_shutdown, addr).await });

    let controller_state = state.clone();
    let controller = Controller::new(policies, Default::default())
        .run(reconcile, error_policy, ctx)
        .for_each(move |result| {
            let state = controller_state.clone();
            async move {
                {
                    let mut s = state.lock().await;
                    if !s.ready {
                        s.ready = true;
                    }
                }
                if let Err(e) = result {
                    warn!(error = %e, "policy_reconcile_dispatch_error");
                }
            }
        });

    tokio::select! {
        _ = controller => { info!("policy_controller_stream_ended"); }
        _ = signal::ctrl_c() => { info!("shutdown_signal_received"); }
    }

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;
    info!("policy_reconciler_stopped");
    Ok(())
}

/* ============================= RECONCILE ============================= */

async fn reconcile(policy: Arc<NamespacePolicy>, ctx: Arc<PolicyReconcileContext>) -> std::result::Result<Action, kube::Error> {
    POLICY_RECONCILE_TOTAL.inc();

    let name = policy.name_any();
    let tenant = policy.namespace().unwrap_or_default();

    let sessions_api: Api<Session> = Api::namespaced(ctx.client.clone(), &tenant);
    let sessions = sessions_api.list(&Default::default()).await?;

    let period_start = budget_period_start(Utc::now(), policy.spec.models.budget.reset_day);
    let mut budget_used = Decimal::ZERO;
    let mut active = 0i64;
    let mut total = 0i64;

    for session in &sessions.items {
        total += 1;
        if !session.status.as_ref().map(|s| s.phase.is_terminal()).unwrap_or(false) {
            active += 1;
        }
        if let Some(status) = &session.status
            && let Some(usage) = &status.resource_usage
            && status.start_time.is_some_and(|t| t >= period_start)
        {
            budget_used += usage.cost_usd;
        }
    }

    let percent_used = governance::percent_used(budget_used, policy.spec.models.budget.monthly);
    let shape_errors = governance::validate_policy_shape(&policy.spec);

    let mut status = NamespacePolicyStatus {
        observed_generation: policy.metadata.generation,
        ..policy.status.clone().unwrap_or_default()
    };
    status.usage.budget.current_period = budget_used;
    status.usage.budget.percent_used = percent_used;
    status.usage.sessions.active = active;
    status.usage.sessions.total = total;
    if !shape_errors.is_empty() {
        status.policy_violation_count += 1;
    }

    let api: Api<NamespacePolicy> = Api::namespaced(ctx.client.clone(), &tenant);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(&name, &PatchParams::apply("session-operator"), &Patch::Merge(&patch)).await?;

    BUDGET_PERCENT_USED.with_label_values(&[&tenant]).set(percent_used as i64);
    POLICY_VIOLATION_COUNT.with_label_values(&[&tenant]).set(status.policy_violation_count);

    if let Err(e) = sweep_audit_retention(&ctx.client, &tenant, &policy.spec.retention.audit_logs).await {
        warn!(tenant = %tenant, error = %e, "audit_retention_sweep_failed");
    }

    reevaluate_sessions_against_policy(&sessions_api, &sessions.items, &policy.spec, budget_used, active as u32).await;

    if let Err(e) = sweep_session_retention(&sessions_api, &sessions.items, &policy.spec.retention.sessions).await {
        warn!(tenant = %tenant, error = %e, "session_retention_sweep_failed");
    }
    if let Err(e) = sweep_artifact_retention(&sessions_api, &sessions.items, &policy.spec.retention.artifacts).await {
        warn!(tenant = %tenant, error = %e, "artifact_retention_sweep_failed");
    }

    info!(tenant = %tenant, policy = %name, percent_used, active, total, "policy_reconciled");
    Ok(Action::requeue(REQUEUE_INTERVAL))
}

/// Re-evaluates every non-terminal Session's admission-time policy snapshot
/// against the tenant's current `NamespacePolicy`. A policy that has
/// tightened since a Session was admitted can make an already-running
/// Session non-compliant; such Sessions are failed here rather than left
/// to run to completion.
async fn reevaluate_sessions_against_policy(
    sessions_api: &Api<Session>,
    sessions: &[Session],
    policy: &session_operator::crd::NamespacePolicySpec,
    budget_used: Decimal,
    active_sessions: u32,
) {
    for session in sessions {
        let Some(status) = &session.status else { continue };
        if status.phase.is_terminal() {
            continue;
        }
        let Some(name) = session.metadata.name.as_deref() else { continue };

        let violations = governance::detect_policy_violations(&session.spec.policy, policy, budget_used, active_sessions);
        let Some(first) = violations.first() else { continue };

        let now = Utc::now();
        let mut new_status = status.clone();
        new_status.phase = SessionPhase::Failed;
        new_status.reason = Some("PolicyViolation".to_string());
        new_status.message = Some(first.message());
        new_status.completion_time = Some(now);
        new_status.push_history(HistoryEntry::new(now, "PolicyViolation", serde_json::json!({ "reason": first.reason() })));

        let patch = serde_json::json!({ "status": new_status });
        if let Err(e) = sessions_api.patch_status(name, &PatchParams::apply("session-operator"), &Patch::Merge(&patch)).await {
            warn!(session = %name, error = %e, "session_policy_violation_patch_failed");
        }
    }
}

/// Deletes terminal Sessions whose `completionTime` is at or beyond the
/// policy's `retention.sessions` window.
async fn sweep_session_retention(sessions_api: &Api<Session>, sessions: &[Session], retention: &RetentionDuration) -> anyhow::Result<()> {
    let Some(duration) = retention.to_duration() else { return Ok(()) };
    let cutoff = Utc::now() - duration;

    for session in sessions {
        let Some(status) = &session.status else { continue };
        if !status.phase.is_terminal() {
            continue;
        }
        let Some(completion) = status.completion_time else { continue };
        if completion > cutoff {
            continue;
        }
        if let Some(name) = session.metadata.name.as_deref()
            && let Err(e) = sessions_api.delete(name, &Default::default()).await
        {
            warn!(session = %name, error = %e, "session_retention_delete_failed");
        }
    }

    Ok(())
}

/// Unlinks artifact references whose `createdAt + retention.artifacts` has
/// elapsed, by patching them out of `status.artifacts`. Artifacts are
/// embedded in `SessionStatus` rather than their own CRD, so retention here
/// is a status patch rather than a delete of a separate object.
async fn sweep_artifact_retention(sessions_api: &Api<Session>, sessions: &[Session], retention: &RetentionDuration) -> anyhow::Result<()> {
    let Some(duration) = retention.to_duration() else { return Ok(()) };
    let cutoff = Utc::now() - duration;

    for session in sessions {
        let Some(status) = &session.status else { continue };
        if !status.artifacts.iter().any(|a| a.created_at <= cutoff) {
            continue;
        }
        let Some(name) = session.metadata.name.as_deref() else { continue };

        let mut artifacts = status.artifacts.clone();
        artifacts.retain(|a| a.created_at > cutoff);
        let patch = serde_json::json!({ "status": { "artifacts": artifacts } });
        if let Err(e) = sessions_api.patch_status(name, &PatchParams::apply("session-operator"), &Patch::Merge(&patch)).await {
            warn!(session = %name, error = %e, "artifact_retention_patch_failed");
        }
    }

    Ok(())
}

fn budget_period_start(now: DateTime<Utc>, reset_day: u32) -> DateTime<Utc> {
    let reset_day = reset_day.clamp(1, 28);
    let (year, month) = if now.day() >= reset_day { (now.year(), now.month()) } else { prev_month(now.year(), now.month()) };
    chrono::Utc
        .with_ymd_and_hms(year, month, reset_day, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

fn prev_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 { (year - 1, 12) } else { (year, month - 1) }
}

/// Deletes the oldest `AuditEntry` records in `tenant` beyond the
/// configured retention window, a policy-defined duration rather than
/// a fixed count.
async fn sweep_audit_retention(client: &Client, tenant: &str, retention: &session_operator::crd::RetentionDuration) -> anyhow::Result<()> {
    let api: Api<AuditEntry> = Api::namespaced(client.clone(), tenant);
    let existing = api.list(&Default::default()).await?;
    let cutoff = retention.to_duration().map(|d| Utc::now() - d);

    let mut entries: Vec<_> = existing.items.iter().collect();
    entries.sort_by_key(|e| e.spec.timestamp);

    if let Some(cutoff) = cutoff {
        for entry in &entries {
            if entry.spec.timestamp < cutoff
                && let Some(name) = entry.metadata.name.as_deref()
                && let Err(e) = api.delete(name, &Default::default()).await
            {
                warn!(error = %e, name = %name, "audit_entry_delete_failed");
            }
        }
    }

    if entries.len() > AUDIT_RETENTION {
        let overflow = entries.len() - AUDIT_RETENTION;
        for entry in entries.iter().take(overflow) {
            if let Some(name) = entry.metadata.name.as_deref()
                && let Err(e) = api.delete(name, &Default::default()).await
            {
                warn!(error = %e, name = %name, "audit_entry_delete_failed");
            }
        }
    }

    Ok(())
}

fn error_policy(_policy: Arc<NamespacePolicy>, error: &kube::Error, _ctx: Arc<PolicyReconcileContext>) -> Action {
    POLICY_RECONCILE_ERRORS.inc();
    warn!(error = %error, "policy_reconcile_error");
    Action::requeue(Duration::from_secs(60))
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_policy_router(state: Arc<Mutex<PolicyReconcileState>>) -> Router {
    Router::new()
        .route("/metrics", get(policy_metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || policy_ready_handler(state.clone())
            }),
        )
}

async fn start_metrics_server(state: Arc<Mutex<PolicyReconcileState>>, mut shutdown: broadcast::Receiver<()>, addr: SocketAddr) -> Result<()> {
    let app = build_policy_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await.context("Failed to bind metrics server")?;
    info!(addr = %addr, "policy_metrics_server_started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

async fn policy_ready_handler(state: Arc<Mutex<PolicyReconcileState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready { (StatusCode::OK, "READY") } else { (StatusCode::SERVICE_UNAVAILABLE, "NOT READY") }
}

async fn policy_metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_period_start_after_reset_day() {
        let now = Utc.with_ymd_and_hms(2026, 7, 20, 12, 0, 0).unwrap();
        let start = budget_period_start(now, 15);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 7, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_budget_period_start_before_reset_day_rolls_back_a_month() {
        let now = Utc.with_ymd_and_hms(2026, 7, 10, 12, 0, 0).unwrap();
        let start = budget_period_start(now, 15);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 6, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_budget_period_start_rolls_back_across_year_boundary() {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap();
        let start = budget_period_start(now, 15);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 12, 15, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_policy_healthz() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let app = build_policy_router(Arc::new(Mutex::new(PolicyReconcileState { ready: false })));
        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
