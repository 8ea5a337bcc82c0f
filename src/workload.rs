//! Builds and reconciles the Kubernetes workload a Session runs as.
//!
//! A `batch/v1` `Job` rather than a bare `Pod`: the reconciler needs
//! `backoffLimit`, `activeDeadlineSeconds`, and `ttlSecondsAfterFinished`
//! to express "run exactly once, time out on its own, clean itself up"
//! without the reconciler polling for deletion.

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, PodSecurityContext, PodSpec, PodTemplateSpec, ResourceRequirements,
    SecurityContext,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, LabelSelector};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;

use crate::auth;
use crate::crd::{Session, SessionPhase};
use crate::error::CoreError;
use crate::frameworks::FrameworkDescriptor;

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY_VALUE: &str = "session-operator";
pub const SESSION_LABEL: &str = "sessions.io/session";
const FIELD_MANAGER: &str = "session-operator";

/// Name of the Job backing a Session. Deterministic so reconciliation can
/// always find (or safely adopt) an existing workload without needing to
/// persist the name separately until `status.workloadRef` is written.
pub fn job_name(session: &Session) -> String {
    format!("sess-{}", session.name_any())
}

/// Builds the desired `Job` for a Session, to be applied via server-side
/// apply so the reconciler can create the workload idempotently.
/// `callback_url` is where the runner reports terminal status back to the
/// ingress plane. `callback_secret` signs the per-session token the
/// runner must present on that callback; the Ingress Plane verifies it the
/// same way it verifies webhook HMAC signatures.
pub fn build_job(
    session: &Session,
    framework: &FrameworkDescriptor,
    callback_url: &str,
    callback_secret: &[u8],
    credentials_secret_name: &str,
) -> Result<Job, CoreError> {
    let namespace = session.namespace().ok_or_else(|| CoreError::fatal("Session has no namespace"))?;
    let owner = owner_reference(session)?;

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(SESSION_LABEL.to_string(), session.name_any());

    let callback_token = auth::mint_callback_token(callback_secret, &session.name_any(), &namespace);

    let env = vec![
        EnvVar { name: "SESSION_ID".into(), value: Some(session.name_any()), ..Default::default() },
        EnvVar { name: "SESSION_TENANT".into(), value: Some(namespace.clone()), ..Default::default() },
        EnvVar { name: "SESSION_CALLBACK_URL".into(), value: Some(callback_url.to_string()), ..Default::default() },
        EnvVar { name: "SESSION_CALLBACK_TOKEN".into(), value: Some(callback_token), ..Default::default() },
        EnvVar {
            name: "SESSION_FRAMEWORK_CONFIG".into(),
            value: Some(session.spec.framework.config.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "SESSION_MODEL_BUDGET_USD".into(),
            value: Some(session.spec.policy.model_constraints.budget.to_string()),
            ..Default::default()
        },
    ];

    let mut resource_limits = BTreeMap::new();
    resource_limits.insert("cpu".to_string(), Quantity(framework.cpu_limit.clone()));
    resource_limits.insert("memory".to_string(), Quantity(framework.memory_limit.clone()));
    let mut resource_requests = BTreeMap::new();
    resource_requests.insert("cpu".to_string(), Quantity(framework.cpu_request.clone()));
    resource_requests.insert("memory".to_string(), Quantity(framework.memory_request.clone()));

    let container = Container {
        name: "runner".to_string(),
        image: Some(framework.image.clone()),
        env: Some(env),
        resources: Some(ResourceRequirements {
            limits: Some(resource_limits),
            requests: Some(resource_requests),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            run_as_non_root: Some(true),
            read_only_root_filesystem: Some(true),
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities { drop: Some(vec!["ALL".to_string()]), ..Default::default() }),
            ..Default::default()
        }),
        env_from: Some(vec![k8s_openapi::api::core::v1::EnvFromSource {
            secret_ref: Some(k8s_openapi::api::core::v1::SecretEnvSource {
                name: credentials_secret_name.to_string(),
                optional: Some(true),
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        containers: vec![container],
        restart_policy: Some("Never".to_string()),
        security_context: Some(PodSecurityContext { run_as_non_root: Some(true), ..Default::default() }),
        ..Default::default()
    };

    let job = Job {
        metadata: ObjectMeta {
            name: Some(job_name(session)),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: Some(session_timeout_seconds(session, framework)),
            ttl_seconds_after_finished: Some(3600),
            selector: Some(LabelSelector { match_labels: Some(labels.clone()), ..Default::default() }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    };

    Ok(job)
}

/// The Job's overall deadline: the session's own `framework.config.timeout`
/// override when present, else the framework's default.
fn session_timeout_seconds(session: &Session, framework: &FrameworkDescriptor) -> i64 {
    session.spec.framework.config["timeout"].as_i64().unwrap_or(framework.default_timeout_seconds)
}

fn owner_reference(session: &Session) -> Result<OwnerReference, CoreError> {
    let uid = session.meta().uid.clone().ok_or_else(|| CoreError::fatal("Session has no uid yet"))?;
    Ok(OwnerReference {
        api_version: "sessions.io/v1".to_string(),
        kind: "Session".to_string(),
        name: session.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Idempotently ensures the workload exists: creates it if absent, adopts
/// (returns) it unchanged if a Job with the expected name and owner
/// already exists, and fails closed on a name collision with something the
/// reconciler does not own.
pub async fn ensure_job(client: Client, session: &Session, desired: &Job) -> Result<Job, CoreError> {
    let namespace = session.namespace().ok_or_else(|| CoreError::fatal("Session has no namespace"))?;
    let api: Api<Job> = Api::namespaced(client, &namespace);
    let name = job_name(session);

    match api.get_opt(&name).await? {
        Some(existing) => {
            let owned_by_this_session = existing
                .metadata
                .owner_references
                .as_ref()
                .is_some_and(|refs| refs.iter().any(|r| r.kind == "Session" && r.name == session.name_any()));
            if owned_by_this_session {
                Ok(existing)
            } else {
                Err(CoreError::conflict(format!(
                    "job '{name}' already exists and is not owned by session '{}'",
                    session.name_any()
                )))
            }
        }
        None => {
            let created = api.create(&PostParams::default(), desired).await?;
            Ok(created)
        }
    }
}

/// Patches `status.workloadRef` via server-side apply once the Job exists,
/// recording the binding the Session Reconciler relies on to poll completion.
pub async fn patch_workload_ref(client: Client, session: &Session, job: &Job) -> Result<(), CoreError> {
    let namespace = session.namespace().ok_or_else(|| CoreError::fatal("Session has no namespace"))?;
    let api: Api<Session> = Api::namespaced(client, &namespace);
    let uid = job.metadata.uid.clone().unwrap_or_default();
    let name = job.metadata.name.clone().unwrap_or_default();

    let patch = serde_json::json!({
        "status": {
            "workloadRef": { "name": name, "uid": uid },
        }
    });
    api.patch_status(&session.name_any(), &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
        .await?;
    Ok(())
}

/// Maps a completed Job's status back to the Session phase the reconciler
/// should transition to: Running goes to Completed, Failed, or TimedOut.
pub fn phase_from_job_status(job: &Job) -> Option<SessionPhase> {
    let status = job.status.as_ref()?;
    if status.succeeded.unwrap_or(0) > 0 {
        return Some(SessionPhase::Completed);
    }
    if let Some(conditions) = &status.conditions {
        for condition in conditions {
            if condition.type_ == "Failed" && condition.status == "True" {
                if condition.reason.as_deref() == Some("DeadlineExceeded") {
                    return Some(SessionPhase::TimedOut);
                }
                return Some(SessionPhase::Failed);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ArtifactBackend, ArtifactStorage, SessionFramework, SessionSpec, SessionTrigger};
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

    fn test_session() -> Session {
        let mut session = Session::new(
            "sess-1",
            SessionSpec {
                trigger: SessionTrigger { source: "github".into(), event: "issue.opened".into(), payload: serde_json::Value::Null },
                framework: SessionFramework { kind: "claude-code".into(), version: "1.0".into(), config: serde_json::Value::Null },
                policy: Default::default(),
                artifact_storage: ArtifactStorage { backend: ArtifactBackend::ObjectStore, location: "s3://bucket/sess-1".into() },
                stop_requested: false,
            },
        );
        session.metadata.namespace = Some("team-alpha".into());
        session.metadata.uid = Some("11111111-1111-1111-1111-111111111111".into());
        session
    }

    fn test_framework() -> FrameworkDescriptor {
        FrameworkDescriptor {
            kind: "claude-code".into(),
            version: "1.0".into(),
            image: "registry.internal/runners/claude-code:1.0".into(),
            cpu_request: "250m".into(),
            cpu_limit: "1".into(),
            memory_request: "256Mi".into(),
            memory_limit: "1Gi".into(),
            default_timeout_seconds: 1800,
        }
    }

    #[test]
    fn test_job_name_is_deterministic() {
        let session = test_session();
        assert_eq!(job_name(&session), "sess-sess-1");
        assert_eq!(job_name(&session), job_name(&session));
    }

    #[test]
    fn test_build_job_sets_run_once_semantics() {
        let session = test_session();
        let job = build_job(&session, &test_framework(), "https://api.internal/callback", b"callback-secret", "sess-1-creds").unwrap();
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.active_deadline_seconds, Some(1800));
        assert_eq!(spec.ttl_seconds_after_finished, Some(3600));
    }

    #[test]
    fn test_build_job_sets_owner_reference() {
        let session = test_session();
        let job = build_job(&session, &test_framework(), "https://api.internal/callback", b"callback-secret", "sess-1-creds").unwrap();
        let owners = job.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "Session");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn test_build_job_hardens_security_context() {
        let session = test_session();
        let job = build_job(&session, &test_framework(), "https://api.internal/callback", b"callback-secret", "sess-1-creds").unwrap();
        let container = &job.spec.unwrap().template.spec.unwrap().containers[0];
        let sc = container.security_context.as_ref().unwrap();
        assert_eq!(sc.run_as_non_root, Some(true));
        assert_eq!(sc.read_only_root_filesystem, Some(true));
        assert_eq!(sc.capabilities.as_ref().unwrap().drop, Some(vec!["ALL".to_string()]));
    }

    #[test]
    fn test_build_job_mints_verifiable_callback_token() {
        let session = test_session();
        let job = build_job(&session, &test_framework(), "https://api.internal/callback", b"callback-secret", "sess-1-creds").unwrap();
        let container = &job.spec.unwrap().template.spec.unwrap().containers[0];
        let env = container.env.as_ref().unwrap();
        let token = env.iter().find(|e| e.name == "SESSION_CALLBACK_TOKEN").unwrap().value.clone().unwrap();
        assert!(auth::verify_callback_token(b"callback-secret", "sess-1", "team-alpha", &token));
        assert!(!auth::verify_callback_token(b"wrong-secret", "sess-1", "team-alpha", &token));
    }

    #[test]
    fn test_build_job_without_namespace_fails() {
        let mut session = test_session();
        session.metadata.namespace = None;
        let err = build_job(&session, &test_framework(), "https://api.internal/callback", b"callback-secret", "sess-1-creds").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Fatal);
    }

    #[test]
    fn test_phase_from_job_status_succeeded() {
        let mut job = Job { metadata: Default::default(), spec: None, status: None };
        job.status = Some(JobStatus { succeeded: Some(1), ..Default::default() });
        assert_eq!(phase_from_job_status(&job), Some(SessionPhase::Completed));
    }

    #[test]
    fn test_phase_from_job_status_deadline_exceeded() {
        let mut job = Job { metadata: Default::default(), spec: None, status: None };
        job.status = Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Failed".into(),
                status: "True".into(),
                reason: Some("DeadlineExceeded".into()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(phase_from_job_status(&job), Some(SessionPhase::TimedOut));
    }

    #[test]
    fn test_phase_from_job_status_still_running_returns_none() {
        let job = Job { metadata: Default::default(), spec: None, status: Some(JobStatus::default()) };
        assert_eq!(phase_from_job_status(&job), None);
    }
}
