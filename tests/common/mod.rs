use rust_decimal::Decimal;
use std::str::FromStr;

use session_operator::crd::{
    ArtifactBackend, ArtifactStorage, BudgetConfig, ModelPolicy, NamespacePolicySpec,
    SessionFramework, SessionPolicySnapshot, SessionSpec, SessionTrigger, ToolPolicy,
};

pub fn decimal(s: &str) -> Decimal {
    Decimal::from_str(s).expect("valid decimal literal")
}

pub fn test_session_spec(framework_kind: &str, framework_version: &str) -> SessionSpec {
    SessionSpec {
        trigger: SessionTrigger { source: "github".into(), event: "issue.opened".into(), payload: serde_json::Value::Null },
        framework: SessionFramework { kind: framework_kind.into(), version: framework_version.into(), config: serde_json::Value::Null },
        policy: SessionPolicySnapshot::default(),
        artifact_storage: ArtifactStorage { backend: ArtifactBackend::ObjectStore, location: "s3://bucket/x".into() },
        stop_requested: false,
    }
}

pub fn test_namespace_policy(models_allowed: &[&str], monthly_budget: &str) -> NamespacePolicySpec {
    NamespacePolicySpec {
        models: ModelPolicy {
            allowed: models_allowed.iter().map(|s| s.to_string()).collect(),
            budget: BudgetConfig { monthly: decimal(monthly_budget), ..Default::default() },
            ..Default::default()
        },
        tools: ToolPolicy::default(),
        ..Default::default()
    }
}
