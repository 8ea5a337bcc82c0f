use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= SHARED TYPES ============================= */

/// A phase in the Session state machine. Terminal phases are
/// `Completed`, `Failed`, `Stopped`, `TimedOut`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum SessionPhase {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
    TimedOut,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionPhase::Completed | SessionPhase::Failed | SessionPhase::Stopped | SessionPhase::TimedOut
        )
    }
}

/// One entry in the append-only `status.history` ledger. Once committed,
/// an entry's position and contents never change; only new entries are
/// appended.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl HistoryEntry {
    pub fn new(timestamp: DateTime<Utc>, event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            timestamp,
            event: event.into(),
            data,
        }
    }

    pub fn phase_changed(timestamp: DateTime<Utc>, phase: &SessionPhase) -> Self {
        let label = serde_json::to_value(phase)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{phase:?}"));
        Self::new(timestamp, format!("PhaseChanged:{label}"), serde_json::Value::Null)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum ArtifactBackend {
    ObjectStore,
    BlockVolume,
    ExternalUrl,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct ArtifactStorage {
    pub backend: ArtifactBackend,
    pub location: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct ArtifactRef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub location: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct WorkloadRef {
    pub name: String,
    pub uid: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct ResourceUsage {
    /// Cost self-reported by the runner; the only party with real
    /// per-token/per-call pricing visibility.
    #[schemars(with = "String")]
    pub cost_usd: Decimal,
    #[serde(default)]
    pub tokens_used: i64,
    #[serde(default)]
    pub tool_calls: i64,
}

/* ============================= TRIGGER / FRAMEWORK ============================= */

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct SessionTrigger {
    /// Registered webhook source id, or the literal `"manual"`.
    pub source: String,
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct SessionFramework {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct ModelConstraints {
    #[serde(default)]
    pub allowed: Vec<String>,
    #[schemars(with = "String")]
    pub budget: Decimal,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct ToolConstraints {
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub blocked: Vec<String>,
}

/// Snapshot of the effective constraints taken at admission time, stored in
/// `spec.policy`; never re-read live from `NamespacePolicy` once set.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct SessionPolicySnapshot {
    #[serde(default)]
    pub model_constraints: ModelConstraints,
    #[serde(default)]
    pub tool_constraints: ToolConstraints,
    #[serde(default)]
    pub approval_required: bool,
}

impl SessionPolicySnapshot {
    /// Builds the at-admission-time snapshot from a create request's opaque
    /// `framework.config`, copying the requested model and tool list into the
    /// constraint fields the validators actually enforce against. Without
    /// this, `model_constraints.allowed`/`tool_constraints.allowed` stay
    /// empty and every downstream policy check becomes a silent no-op.
    pub fn from_framework_config(config: &serde_json::Value) -> Self {
        let allowed_models = config["model"].as_str().map(|m| vec![m.to_string()]).unwrap_or_default();
        let budget = config["budget"].as_str().and_then(|s| s.parse().ok()).unwrap_or_default();
        let allowed_tools = config["tools"]
            .as_array()
            .map(|items| items.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();

        SessionPolicySnapshot {
            model_constraints: ModelConstraints { allowed: allowed_models, budget },
            tool_constraints: ToolConstraints { allowed: allowed_tools, blocked: Vec::new() },
            approval_required: false,
        }
    }
}

/* ============================= SESSION ============================= */

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "sessions.io",
    version = "v1",
    kind = "Session",
    namespaced,
    status = "SessionStatus",
    shortname = "sess"
)]
#[serde(rename_all = "camelCase")]
pub struct SessionSpec {
    pub trigger: SessionTrigger,
    pub framework: SessionFramework,
    #[serde(default)]
    pub policy: SessionPolicySnapshot,
    pub artifact_storage: ArtifactStorage,
    /// Cooperative stop intent; set by the read API's `Stop session`
    /// operation, observed by the session reconciler.
    #[serde(default)]
    pub stop_requested: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    #[serde(default)]
    pub phase: SessionPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload_ref: Option<WorkloadRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl SessionStatus {
    /// The only place `history` is ever extended. Centralizing this is what
    /// lets every reconciler/callback code path guarantee invariant 2
    /// (monotonic growth, fixed prefix) without re-deriving it at each call site.
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    pub fn upsert_condition(&mut self, condition: Condition) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }
}

/* ============================= NAMESPACE POLICY ============================= */

#[derive(Deserialize, Serialize, Clone, Debug, Eq, PartialEq, JsonSchema)]
pub enum Currency {
    #[serde(rename = "USD")]
    Usd,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct BudgetConfig {
    #[schemars(with = "String")]
    pub monthly: Decimal,
    pub currency: Currency,
    pub reset_day: u8,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly: Decimal::ZERO,
            currency: Currency::Usd,
            reset_day: 1,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct ModelPolicy {
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub blocked: Vec<String>,
    #[serde(default)]
    pub budget: BudgetConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct ToolPolicy {
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub blocked: Vec<String>,
}

/// A duration string of the form `N[dwmy]`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(transparent)]
pub struct RetentionDuration(pub String);

impl RetentionDuration {
    /// Parses into a `chrono::Duration`. Returns `None` if malformed.
    pub fn to_duration(&self) -> Option<chrono::Duration> {
        let s = self.0.trim();
        if s.len() < 2 {
            return None;
        }
        let (digits, unit) = s.split_at(s.len() - 1);
        let n: i64 = digits.parse().ok()?;
        match unit {
            "d" => Some(chrono::Duration::days(n)),
            "w" => Some(chrono::Duration::weeks(n)),
            "m" => Some(chrono::Duration::days(n * 30)),
            "y" => Some(chrono::Duration::days(n * 365)),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.to_duration().is_some()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub sessions: RetentionDuration,
    #[serde(default)]
    pub artifacts: RetentionDuration,
    #[serde(default)]
    pub audit_logs: RetentionDuration,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_size: 10,
        }
    }
}

impl RateLimitConfig {
    pub fn is_valid(&self) -> bool {
        (1..=1000).contains(&self.requests_per_minute) && (1..=100).contains(&self.burst_size)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct WebhookAuthConfig {
    /// Maps webhook source id to a stored verifier; never the raw secret.
    #[serde(default)]
    pub api_keys: BTreeMap<String, String>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum NotificationEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.started")]
    SessionStarted,
    #[serde(rename = "session.completed")]
    SessionCompleted,
    #[serde(rename = "session.failed")]
    SessionFailed,
    #[serde(rename = "session.approved")]
    SessionApproved,
    #[serde(rename = "session.rejected")]
    SessionRejected,
    #[serde(rename = "budget.warning")]
    BudgetWarning,
    #[serde(rename = "budget.exceeded")]
    BudgetExceeded,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct NotificationWebhook {
    pub url: String,
    pub events: Vec<NotificationEvent>,
}

impl NotificationWebhook {
    pub fn has_valid_scheme(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub webhooks: Vec<NotificationWebhook>,
}

/// Fixed object name for the single `NamespacePolicy` per tenant namespace.
pub const NAMESPACE_POLICY_NAME: &str = "policy";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "sessions.io",
    version = "v1",
    kind = "NamespacePolicy",
    namespaced,
    status = "NamespacePolicyStatus",
    shortname = "nspol"
)]
#[serde(rename_all = "camelCase")]
pub struct NamespacePolicySpec {
    #[serde(default)]
    pub models: ModelPolicy,
    #[serde(default)]
    pub tools: ToolPolicy,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub webhook_auth: WebhookAuthConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    /// Optional cap on concurrently non-terminal Sessions for the tenant.
    #[serde(default)]
    pub max_active_sessions: Option<u32>,
}

impl NamespacePolicySpec {
    pub fn models_disjoint(&self) -> bool {
        disjoint(&self.models.allowed, &self.models.blocked)
    }

    pub fn tools_disjoint(&self) -> bool {
        disjoint(&self.tools.allowed, &self.tools.blocked)
    }
}

fn disjoint(a: &[String], b: &[String]) -> bool {
    !a.iter().any(|x| b.contains(x))
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct BudgetUsage {
    #[schemars(with = "String")]
    pub current_period: Decimal,
    pub percent_used: f64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct SessionUsage {
    pub active: i64,
    pub total: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct PolicyUsage {
    #[serde(default)]
    pub budget: BudgetUsage,
    #[serde(default)]
    pub sessions: SessionUsage,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamespacePolicyStatus {
    #[serde(default)]
    pub usage: PolicyUsage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub policy_violation_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/* ============================= AUDIT ENTRY ============================= */

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum AuditOutcome {
    Allow,
    Deny,
    Error,
}

/// Append-only audit record, stored as a `CustomResource` one per
/// tenant+event.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "sessions.io",
    version = "v1",
    kind = "AuditEntry",
    namespaced,
    shortname = "audit"
)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntrySpec {
    pub timestamp: DateTime<Utc>,
    pub tenant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub details: serde_json::Value,
    pub trace_id: String,
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_phase_terminal_classification() {
        assert!(!SessionPhase::Pending.is_terminal());
        assert!(!SessionPhase::Running.is_terminal());
        assert!(SessionPhase::Completed.is_terminal());
        assert!(SessionPhase::Failed.is_terminal());
        assert!(SessionPhase::Stopped.is_terminal());
        assert!(SessionPhase::TimedOut.is_terminal());
    }

    #[test]
    fn test_history_entry_phase_changed_label() {
        let now = Utc::now();
        let entry = HistoryEntry::phase_changed(now, &SessionPhase::Running);
        assert_eq!(entry.event, "PhaseChanged:Running");
    }

    #[test]
    fn test_status_push_history_is_append_only_by_construction() {
        let mut status = SessionStatus::default();
        status.push_history(HistoryEntry::new(Utc::now(), "Created", serde_json::Value::Null));
        status.push_history(HistoryEntry::new(Utc::now(), "WorkloadCreated", serde_json::Value::Null));
        assert_eq!(status.history.len(), 2);
        assert_eq!(status.history[0].event, "Created");
    }

    #[test]
    fn test_upsert_condition_replaces_by_type() {
        let mut status = SessionStatus::default();
        status.upsert_condition(Condition {
            type_: "WorkloadCreated".into(),
            status: "False".into(),
            reason: "Pending".into(),
            message: "not yet".into(),
            last_transition_time: k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()),
            observed_generation: None,
        });
        status.upsert_condition(Condition {
            type_: "WorkloadCreated".into(),
            status: "True".into(),
            reason: "Created".into(),
            message: "ok".into(),
            last_transition_time: k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()),
            observed_generation: None,
        });
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, "True");
    }

    #[test]
    fn test_retention_duration_parsing() {
        assert_eq!(
            RetentionDuration("7d".into()).to_duration(),
            Some(chrono::Duration::days(7))
        );
        assert_eq!(
            RetentionDuration("2w".into()).to_duration(),
            Some(chrono::Duration::weeks(2))
        );
        assert!(RetentionDuration("bogus".into()).to_duration().is_none());
        assert!(RetentionDuration("".into()).to_duration().is_none());
    }

    #[test]
    fn test_rate_limit_config_bounds() {
        assert!(RateLimitConfig { requests_per_minute: 1, burst_size: 1 }.is_valid());
        assert!(RateLimitConfig { requests_per_minute: 1000, burst_size: 100 }.is_valid());
        assert!(!RateLimitConfig { requests_per_minute: 0, burst_size: 1 }.is_valid());
        assert!(!RateLimitConfig { requests_per_minute: 1001, burst_size: 1 }.is_valid());
        assert!(!RateLimitConfig { requests_per_minute: 1, burst_size: 101 }.is_valid());
    }

    #[test]
    fn test_models_and_tools_disjointness() {
        let mut spec = NamespacePolicySpec {
            models: ModelPolicy {
                allowed: vec!["claude-3-sonnet".into()],
                blocked: vec!["claude-3-opus".into()],
                budget: BudgetConfig::default(),
            },
            ..Default::default()
        };
        assert!(spec.models_disjoint());
        spec.models.blocked.push("claude-3-sonnet".into());
        assert!(!spec.models_disjoint());
    }

    #[test]
    fn test_notification_webhook_scheme_validation() {
        assert!(NotificationWebhook { url: "https://example.com/hook".into(), events: vec![] }.has_valid_scheme());
        assert!(NotificationWebhook { url: "http://example.com/hook".into(), events: vec![] }.has_valid_scheme());
        assert!(!NotificationWebhook { url: "ftp://example.com/hook".into(), events: vec![] }.has_valid_scheme());
    }

    #[test]
    fn test_session_spec_serde_round_trip() {
        let spec = SessionSpec {
            trigger: SessionTrigger {
                source: "github".into(),
                event: "pull_request_opened".into(),
                payload: serde_json::json!({"id": 123}),
            },
            framework: SessionFramework {
                kind: "claude-code".into(),
                version: "1.0".into(),
                config: serde_json::json!({}),
            },
            policy: SessionPolicySnapshot::default(),
            artifact_storage: ArtifactStorage {
                backend: ArtifactBackend::ObjectStore,
                location: "s3://bucket/key".into(),
            },
            stop_requested: false,
        };
        let json = serde_json::to_string(&spec).expect("should serialize");
        let back: SessionSpec = serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(back.trigger.source, "github");
        assert_eq!(back.framework.kind, "claude-code");
    }

    #[test]
    fn test_namespace_policy_spec_defaults_are_permissive() {
        let spec = NamespacePolicySpec::default();
        assert!(spec.models.allowed.is_empty());
        assert!(spec.models.blocked.is_empty());
        assert!(spec.models_disjoint());
        assert!(spec.tools_disjoint());
    }

    #[test]
    fn test_audit_entry_spec_serializes_camel_case() {
        let entry = AuditEntrySpec {
            timestamp: Utc::now(),
            tenant: "team-alpha".into(),
            session_id: Some("sess-1".into()),
            actor: "github".into(),
            action: "webhook.create_session".into(),
            resource: "session/sess-1".into(),
            outcome: AuditOutcome::Allow,
            details: serde_json::json!({}),
            trace_id: "trace-1".into(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["sessionId"], "sess-1");
        assert_eq!(json["traceId"], "trace-1");
    }
}
