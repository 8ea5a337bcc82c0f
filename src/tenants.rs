//! Tenant listing for the read API's "list tenants for caller" operation.
//! Aggregates a per-namespace `NamespacePolicy` into a caller-facing summary,
//! the same way a cross-cluster report aggregates per-cluster evaluations,
//! narrowed here from cross-cluster to cross-namespace within one cluster.

use kube::{Api, Client};
use serde::Serialize;

use crate::crd::NamespacePolicy;
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Viewer,
    Editor,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicySummary {
    pub models_allowed: Vec<String>,
    pub budget_monthly: String,
    pub budget_percent_used: f64,
    pub sessions_active: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantSummary {
    pub tenant: String,
    pub permission: Permission,
    pub policy_summary: PolicySummary,
}

impl From<&NamespacePolicy> for PolicySummary {
    fn from(policy: &NamespacePolicy) -> Self {
        let status = policy.status.clone().unwrap_or_default();
        PolicySummary {
            models_allowed: policy.spec.models.allowed.clone(),
            budget_monthly: policy.spec.models.budget.monthly.to_string(),
            budget_percent_used: status.usage.budget.percent_used,
            sessions_active: status.usage.sessions.active,
        }
    }
}

/// Lists every tenant (namespace carrying a `NamespacePolicy`) the caller
/// has at least viewer access to. `resolve_permission` is the caller's
/// authorization lookup against the authorization subsystem; it is injected
/// rather than called directly here so this module stays ignorant of the
/// OIDC/SubjectAccessReview wiring in `src/auth.rs`, keeping pure aggregation
/// separate from the `Client` plumbing that feeds it. It is async and
/// per-tenant: listing `NamespacePolicy` objects across all namespaces is
/// not itself an authorization check, so every candidate tenant must be
/// resolved individually rather than granted by default.
pub async fn list_tenants_for_caller<F, Fut>(client: &Client, resolve_permission: F) -> Result<Vec<TenantSummary>, CoreError>
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = Option<Permission>>,
{
    let api: Api<NamespacePolicy> = Api::all(client.clone());
    let policies = api.list(&Default::default()).await?;

    let mut summaries = Vec::new();
    for policy in &policies.items {
        let Some(tenant) = policy.metadata.namespace.clone() else {
            continue;
        };
        let Some(permission) = resolve_permission(tenant.clone()).await else {
            continue;
        };
        summaries.push(TenantSummary {
            tenant,
            permission,
            policy_summary: PolicySummary::from(policy),
        });
    }
    summaries.sort_by(|a, b| a.tenant.cmp(&b.tenant));
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{BudgetConfig, BudgetUsage, ModelPolicy, NamespacePolicySpec, NamespacePolicyStatus, PolicyUsage, SessionUsage};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn test_policy(models_allowed: Vec<&str>) -> NamespacePolicy {
        let mut policy = NamespacePolicy::new(
            "policy",
            NamespacePolicySpec {
                models: ModelPolicy {
                    allowed: models_allowed.into_iter().map(String::from).collect(),
                    budget: BudgetConfig { monthly: Decimal::from_str("100.00").unwrap(), ..BudgetConfig::default() },
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        policy.metadata.namespace = Some("team-alpha".into());
        policy.status = Some(NamespacePolicyStatus {
            usage: PolicyUsage {
                budget: BudgetUsage { current_period: Decimal::from_str("10.00").unwrap(), percent_used: 10.0 },
                sessions: SessionUsage { active: 2, total: 5 },
            },
            ..Default::default()
        });
        policy
    }

    #[test]
    fn test_policy_summary_from_namespace_policy() {
        let policy = test_policy(vec!["claude-3-sonnet"]);
        let summary = PolicySummary::from(&policy);
        assert_eq!(summary.models_allowed, vec!["claude-3-sonnet".to_string()]);
        assert_eq!(summary.budget_monthly, "100.00");
        assert_eq!(summary.sessions_active, 2);
    }

    #[test]
    fn test_policy_summary_handles_missing_status() {
        let mut policy = test_policy(vec![]);
        policy.status = None;
        let summary = PolicySummary::from(&policy);
        assert_eq!(summary.sessions_active, 0);
        assert_eq!(summary.budget_percent_used, 0.0);
    }
}
