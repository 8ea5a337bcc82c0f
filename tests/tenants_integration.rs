use rust_decimal::Decimal;
use std::str::FromStr;

use session_operator::crd::{BudgetConfig, BudgetUsage, ModelPolicy, NamespacePolicy, NamespacePolicySpec, NamespacePolicyStatus, PolicyUsage, SessionUsage};
use session_operator::tenants::PolicySummary;

fn decimal(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn policy_in(namespace: &str, models_allowed: Vec<&str>, monthly: &str, used: &str, active: i64) -> NamespacePolicy {
    let mut policy = NamespacePolicy::new(
        "default",
        NamespacePolicySpec {
            models: ModelPolicy {
                allowed: models_allowed.into_iter().map(String::from).collect(),
                budget: BudgetConfig { monthly: decimal(monthly), ..Default::default() },
                ..Default::default()
            },
            ..Default::default()
        },
    );
    policy.metadata.namespace = Some(namespace.to_string());
    policy.status = Some(NamespacePolicyStatus {
        usage: PolicyUsage {
            budget: BudgetUsage { current_period: decimal(used), percent_used: 0.0 },
            sessions: SessionUsage { active, total: active * 2 },
        },
        ..Default::default()
    });
    policy
}

// The tenant-summary rollup pipeline: a raw NamespacePolicy becomes
// the caller-facing PolicySummary.

#[test]
fn test_policy_summary_pipeline_reflects_usage() {
    let policy = policy_in("team-alpha", vec!["claude-3-sonnet"], "100.00", "40.00", 3);
    let summary = PolicySummary::from(&policy);

    assert_eq!(summary.models_allowed, vec!["claude-3-sonnet".to_string()]);
    assert_eq!(summary.budget_monthly, "100.00");
    assert_eq!(summary.sessions_active, 3);
}

#[test]
fn test_policy_summary_pipeline_handles_no_models_configured() {
    let policy = policy_in("team-beta", vec![], "0.00", "0.00", 0);
    let summary = PolicySummary::from(&policy);

    assert!(summary.models_allowed.is_empty());
    assert_eq!(summary.sessions_active, 0);
}
