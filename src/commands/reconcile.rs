use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::{Client, ResourceExt};
use prometheus::{Encoder, Histogram, IntCounter, IntGaugeVec, Registry, TextEncoder};
use reqwest::Client as HttpClient;
use tokio::signal;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use session_operator::crd::{HistoryEntry, NamespacePolicy, Session, SessionPhase, NAMESPACE_POLICY_NAME};
use session_operator::notify::{NotificationPayload, Outbox};
use session_operator::{admission, frameworks, workload};

/* ============================= CONFIG ============================= */

const FINALIZER: &str = "sessions.io/cleanup";
const REQUEUE_INTERVAL: Duration = Duration::from_secs(15);

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("session_reconcile_total", "Total Session reconciliation cycles")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("session_reconcile_errors_total", "Total Session reconciliation errors")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "session_reconcile_duration_seconds",
        "Duration of each Session reconciliation cycle in seconds",
    ))
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

static SESSIONS_BY_PHASE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("sessions_by_phase", "Sessions currently in each phase"),
        &["tenant", "phase"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

static PHASE_TRANSITIONS_TOTAL: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("session_phase_transitions_total", "Session phase transitions observed"),
        &["tenant", "phase"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

/* ============================= STATE / CONTEXT ============================= */

pub(crate) struct ReconcileState {
    pub(crate) ready: bool,
}

struct ReconcileContext {
    client: Client,
    outbox: Outbox,
    callback_secret: Vec<u8>,
}

/* ============================= ENTRY ============================= */

pub async fn run() -> Result<()> {
    println!("Starting Session reconciler...\n");

    let client = Client::try_default().await.context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let sessions: Api<Session> = Api::all(client.clone());
    let jobs: Api<Job> = Api::all(client.clone());

    let outbox = Outbox::spawn(HttpClient::new());
    let callback_secret = std::env::var("CALLBACK_SIGNING_SECRET")
        .context("CALLBACK_SIGNING_SECRET must be set so runner callback tokens can be minted")?
        .into_bytes();
    let ctx = Arc::new(ReconcileContext { client: client.clone(), outbox, callback_secret });

    LazyLock::force(&RECONCILE_TOTAL);
    LazyLock::force(&RECONCILE_ERRORS);
    LazyLock::force(&RECONCILE_DURATION);
    LazyLock::force(&SESSIONS_BY_PHASE);
    LazyLock::force(&PHASE_TRANSITIONS_TOTAL);

    let addr = SocketAddr::from(([0, 0, 0, 0], 9090));

    println!("  CRD watch ................... Session.sessions.io/v1");
    println!("  Requeue interval ............ {}s", REQUEUE_INTERVAL.as_secs());
    println!("  Metrics server .............. http://{addr}");
    println!();
    println!("Reconciler running. Press Ctrl+C to stop.\n");

    info!("session_reconciler_started");

    let reconcile_state = Arc::new(Mutex::new(ReconcileState { ready: false }));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_state = reconcile_state.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move { start_metrics_server(http_state, http_shutdown, addr).await });

    let controller_state = reconcile_state.clone();
    let controller = Controller::new(sessions, Default::default())
        .owns(jobs, Default::default())
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
                    warn!(error = %e, "reconcile_dispatch_error");
                }
            }
        });

    tokio::select! {
        _ = controller => {
            info!("controller_stream_ended");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("session_reconciler_stopped");
    Ok(())
}

/* ============================= RECONCILE ============================= */

async fn reconcile(session: Arc<Session>, ctx: Arc<ReconcileContext>) -> std::result::Result<Action, kube::Error> {
    RECONCILE_TOTAL.inc();
    let _timer = RECONCILE_DURATION.start_timer();

    let name = session.name_any();
    let tenant = session.namespace().unwrap_or_default();

    if session.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&session, &ctx.client).await;
    }

    if !has_finalizer(&session) {
        add_finalizer(&session, &ctx.client).await?;
    }

    let phase = session.status.as_ref().map(|s| s.phase.clone()).unwrap_or_default();

    if phase.is_terminal() {
        return Ok(Action::await_change());
    }

    let stop_requested = session.spec.stop_requested;

    let (next_phase, reason, message) = match phase.clone() {
        SessionPhase::Pending => reconcile_pending(&session, &ctx.client, &ctx.callback_secret, &tenant, &name).await?,
        SessionPhase::Running if stop_requested => (reconcile_stop(&session, &ctx.client).await?, None, None),
        SessionPhase::Running => (reconcile_running(&session, &ctx.client).await?, None, None),
        terminal => (terminal, None, None),
    };

    if next_phase != phase {
        apply_phase_transition(&ctx, &session, &tenant, &name, next_phase.clone(), reason, message).await?;
        PHASE_TRANSITIONS_TOTAL.with_label_values(&[&tenant, &format!("{next_phase:?}")]).inc();
    }

    for candidate in [SessionPhase::Pending, SessionPhase::Running, SessionPhase::Completed, SessionPhase::Failed] {
        let label = format!("{candidate:?}");
        let count = if candidate == next_phase { 1 } else { 0 };
        SESSIONS_BY_PHASE.with_label_values(&[&tenant, &label]).set(count);
    }

    if next_phase.is_terminal() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(REQUEUE_INTERVAL))
    }
}

type PendingOutcome = (SessionPhase, Option<String>, Option<String>);

/// Re-validates the Session against the tenant's current `NamespacePolicy`
/// before building its workload. A validator may have admitted a spec that a
/// since-tightened policy no longer allows; that is caught here rather than
/// starting a workload that should never run.
async fn reconcile_pending(
    session: &Session,
    client: &Client,
    callback_secret: &[u8],
    tenant: &str,
    name: &str,
) -> std::result::Result<PendingOutcome, kube::Error> {
    let policies: Api<NamespacePolicy> = Api::namespaced(client.clone(), tenant);
    let policy = policies.get_opt(NAMESPACE_POLICY_NAME).await?;

    let sessions: Api<Session> = Api::namespaced(client.clone(), tenant);
    let active_sessions = sessions
        .list(&Default::default())
        .await?
        .items
        .iter()
        .filter(|s| !s.status.as_ref().map(|st| st.phase.clone()).unwrap_or_default().is_terminal())
        .count() as u32;
    let budget_used = policy
        .as_ref()
        .and_then(|p| p.status.as_ref())
        .map(|s| s.usage.budget.current_period)
        .unwrap_or_default();

    let verdict =
        admission::validate_session_create(&session.spec, policy.as_ref().map(|p| &p.spec), budget_used, active_sessions);
    if !verdict.allowed {
        warn!(tenant, session = name, reason = ?verdict.reason, "policy_violation_at_pending_recheck");
        return Ok((SessionPhase::Failed, Some("PolicyViolation".to_string()), verdict.message));
    }

    let Some(framework) = frameworks::get_framework(&session.spec.framework.kind, &session.spec.framework.version)
    else {
        warn!(tenant, session = name, "unregistered_framework_at_reconcile");
        return Ok((SessionPhase::Failed, Some("FrameworkNotRegistered".to_string()), None));
    };

    let callback_url = format!(
        "https://session-operator-webhook.{tenant}.svc.cluster.local/callback/{name}",
        tenant = tenant,
        name = name
    );
    let credentials_secret = format!("sess-{name}-creds");

    let desired =
        workload::build_job(session, &framework, &callback_url, callback_secret, &credentials_secret).map_err(to_kube_error)?;
    let job = workload::ensure_job(client.clone(), session, &desired).await.map_err(to_kube_error)?;
    workload::patch_workload_ref(client.clone(), session, &job).await.map_err(to_kube_error)?;

    info!(tenant, session = name, job = %job.name_any(), "workload_created");
    Ok((SessionPhase::Running, None, None))
}

async fn reconcile_running(session: &Session, client: &Client) -> std::result::Result<SessionPhase, kube::Error> {
    let Some(namespace) = session.namespace() else {
        return Ok(SessionPhase::Running);
    };
    let name = workload::job_name(session);
    let jobs: Api<Job> = Api::namespaced(client.clone(), &namespace);

    match jobs.get_opt(&name).await? {
        Some(job) => Ok(workload::phase_from_job_status(&job).unwrap_or(SessionPhase::Running)),
        None => {
            warn!(session = %session.name_any(), "workload_missing_while_running");
            Ok(SessionPhase::Failed)
        }
    }
}

async fn reconcile_stop(session: &Session, client: &Client) -> std::result::Result<SessionPhase, kube::Error> {
    let Some(namespace) = session.namespace() else {
        return Ok(SessionPhase::Stopped);
    };
    let name = workload::job_name(session);
    let jobs: Api<Job> = Api::namespaced(client.clone(), &namespace);

    let propagation = kube::api::DeleteParams::default();
    match jobs.delete(&name, &propagation).await {
        Ok(_) => {}
        Err(kube::Error::Api(resp)) if resp.code == 404 => {}
        Err(e) => return Err(e),
    }
    Ok(SessionPhase::Stopped)
}

async fn apply_phase_transition(
    ctx: &ReconcileContext,
    session: &Session,
    tenant: &str,
    name: &str,
    next_phase: SessionPhase,
    reason: Option<String>,
    message: Option<String>,
) -> std::result::Result<(), kube::Error> {
    let now = Utc::now();
    let mut status = session.status.clone().unwrap_or_default();
    status.phase = next_phase.clone();
    status.push_history(HistoryEntry::phase_changed(now, &next_phase));
    status.observed_generation = session.metadata.generation;
    if next_phase == SessionPhase::Running && status.start_time.is_none() {
        status.start_time = Some(now);
    }
    if next_phase.is_terminal() {
        status.completion_time = Some(now);
    }
    if reason.is_some() {
        status.reason = reason;
        status.message = message;
    }

    let api: Api<Session> = Api::namespaced(ctx.client.clone(), tenant);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply("session-operator"), &Patch::Merge(&patch)).await?;

    if let Ok(Some(policy)) = Api::<NamespacePolicy>::namespaced(ctx.client.clone(), tenant).get_opt(NAMESPACE_POLICY_NAME).await
        && let Some(event) = event_for_phase(&next_phase)
    {
        ctx.outbox.enqueue(
            &policy.spec.notifications.webhooks,
            NotificationPayload {
                event,
                tenant: tenant.to_string(),
                session: name.to_string(),
                phase: format!("{next_phase:?}"),
                message: format!("session {name} transitioned to {next_phase:?}"),
            },
        );
    }

    info!(tenant, session = name, phase = ?next_phase, "phase_transitioned");
    Ok(())
}

fn event_for_phase(phase: &SessionPhase) -> Option<session_operator::crd::NotificationEvent> {
    use session_operator::crd::NotificationEvent::*;
    match phase {
        SessionPhase::Running => Some(SessionStarted),
        SessionPhase::Completed => Some(SessionCompleted),
        SessionPhase::Failed | SessionPhase::TimedOut => Some(SessionFailed),
        _ => None,
    }
}

fn to_kube_error(err: session_operator::error::CoreError) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: err.message,
        reason: err.reason,
        code: err.kind.status().as_u16(),
    })
}

/* ============================= ERROR POLICY ============================= */

fn error_policy(_session: Arc<Session>, error: &kube::Error, _ctx: Arc<ReconcileContext>) -> Action {
    RECONCILE_ERRORS.inc();
    warn!(error = %error, "reconcile_error");
    Action::requeue(Duration::from_secs(30))
}

/* ============================= FINALIZER ============================= */

fn has_finalizer(session: &Session) -> bool {
    session.metadata.finalizers.as_ref().is_some_and(|f| f.iter().any(|s| s == FINALIZER))
}

async fn add_finalizer(session: &Session, client: &Client) -> std::result::Result<(), kube::Error> {
    let name = session.name_any();
    let namespace = session.namespace().unwrap_or_default();
    let api: Api<Session> = Api::namespaced(client.clone(), &namespace);
    let patch = serde_json::json!({ "metadata": { "finalizers": [FINALIZER] } });
    api.patch(&name, &PatchParams::apply("session-operator"), &Patch::Merge(&patch)).await?;
    info!(session = %name, "finalizer_added");
    Ok(())
}

async fn remove_finalizer(session: &Session, client: &Client) -> std::result::Result<(), kube::Error> {
    let name = session.name_any();
    let namespace = session.namespace().unwrap_or_default();
    let api: Api<Session> = Api::namespaced(client.clone(), &namespace);
    let patch = serde_json::json!({ "metadata": { "finalizers": [] } });
    api.patch(&name, &PatchParams::apply("session-operator"), &Patch::Merge(&patch)).await?;
    info!(session = %name, "finalizer_removed");
    Ok(())
}

async fn handle_deletion(session: &Session, client: &Client) -> std::result::Result<Action, kube::Error> {
    let name = session.name_any();
    let namespace = session.namespace().unwrap_or_default();
    info!(session = %name, namespace = %namespace, "handling_deletion");

    if let Some(ns) = session.namespace() {
        let jobs: Api<Job> = Api::namespaced(client.clone(), &ns);
        let job_name = workload::job_name(session);
        match jobs.delete(&job_name, &kube::api::DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(e) => return Err(e),
        }
    }

    let _ = SESSIONS_BY_PHASE.remove_label_values(&[&namespace, "Pending"]);
    let _ = SESSIONS_BY_PHASE.remove_label_values(&[&namespace, "Running"]);

    if has_finalizer(session) {
        remove_finalizer(session, client).await?;
    }

    Ok(Action::await_change())
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_reconcile_router(state: Arc<Mutex<ReconcileState>>) -> Router {
    Router::new()
        .route("/metrics", get(reconcile_metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || reconcile_ready_handler(state.clone())
            }),
        )
}

async fn start_metrics_server(
    state: Arc<Mutex<ReconcileState>>,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) -> Result<()> {
    let app = build_reconcile_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await.context("Failed to bind metrics server")?;
    info!(addr = %addr, "reconcile_metrics_server_started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

async fn reconcile_ready_handler(state: Arc<Mutex<ReconcileState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready { (StatusCode::OK, "READY") } else { (StatusCode::SERVICE_UNAVAILABLE, "NOT READY") }
}

async fn reconcile_metrics_handler() -> impl IntoResponse {
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

/* ============================= TESTS ============================= */
