//! Constraint evaluation shared by the admission validators and the
//! Policy Reconciler: does a Session's policy snapshot satisfy a
//! tenant's `NamespacePolicy`, and how much of the tenant's budget/session
//! cap is left.

use rust_decimal::Decimal;

use crate::crd::{NamespacePolicySpec, SessionPolicySnapshot};

/// One reason a Session's policy snapshot does not satisfy a NamespacePolicy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintViolation {
    ModelNotAllowed(String),
    ModelBlocked(String),
    ToolNotAllowed(String),
    ToolBlocked(String),
    BudgetExceeded { requested: Decimal, remaining: Decimal },
    ActiveSessionCapExceeded { cap: u32, active: u32 },
}

impl ConstraintViolation {
    pub fn reason(&self) -> &'static str {
        match self {
            ConstraintViolation::ModelNotAllowed(_) => "ModelNotAllowed",
            ConstraintViolation::ModelBlocked(_) => "ModelBlocked",
            ConstraintViolation::ToolNotAllowed(_) => "ToolNotAllowed",
            ConstraintViolation::ToolBlocked(_) => "ToolBlocked",
            ConstraintViolation::BudgetExceeded { .. } => "BudgetExceeded",
            ConstraintViolation::ActiveSessionCapExceeded { .. } => "ActiveSessionCapExceeded",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ConstraintViolation::ModelNotAllowed(m) => format!("model '{m}' is not in the tenant's allowed list"),
            ConstraintViolation::ModelBlocked(m) => format!("model '{m}' is blocked by tenant policy"),
            ConstraintViolation::ToolNotAllowed(t) => format!("tool '{t}' is not in the tenant's allowed list"),
            ConstraintViolation::ToolBlocked(t) => format!("tool '{t}' is blocked by tenant policy"),
            ConstraintViolation::BudgetExceeded { requested, remaining } => {
                format!("requested budget {requested} exceeds remaining allowance {remaining}")
            }
            ConstraintViolation::ActiveSessionCapExceeded { cap, active } => {
                format!("tenant already has {active} active sessions, at or above the cap of {cap}")
            }
        }
    }
}

/// Evaluates a Session's policy snapshot against the tenant's current
/// `NamespacePolicy`. Returns every violation found rather than stopping
/// at the first, a "collect all, then decide" shape.
pub fn detect_policy_violations(
    snapshot: &SessionPolicySnapshot,
    policy: &NamespacePolicySpec,
    budget_used_this_period: Decimal,
    active_sessions: u32,
) -> Vec<ConstraintViolation> {
    let mut violations = Vec::new();

    for model in &snapshot.model_constraints.allowed {
        if !policy.models.allowed.is_empty() && !policy.models.allowed.contains(model) {
            violations.push(ConstraintViolation::ModelNotAllowed(model.clone()));
        }
        if policy.models.blocked.contains(model) {
            violations.push(ConstraintViolation::ModelBlocked(model.clone()));
        }
    }

    for tool in &snapshot.tool_constraints.allowed {
        if !policy.tools.allowed.is_empty() && !policy.tools.allowed.contains(tool) {
            violations.push(ConstraintViolation::ToolNotAllowed(tool.clone()));
        }
        if policy.tools.blocked.contains(tool) {
            violations.push(ConstraintViolation::ToolBlocked(tool.clone()));
        }
    }

    let remaining = policy.models.budget.monthly - budget_used_this_period;
    if snapshot.model_constraints.budget > remaining {
        violations.push(ConstraintViolation::BudgetExceeded {
            requested: snapshot.model_constraints.budget,
            remaining,
        });
    }

    if let Some(cap) = policy.max_active_sessions
        && active_sessions >= cap
    {
        violations.push(ConstraintViolation::ActiveSessionCapExceeded { cap, active: active_sessions });
    }

    violations
}

/// Whether a `NamespacePolicy` shape itself is well-formed. Pure shape
/// validation, no I/O.
pub fn validate_policy_shape(policy: &NamespacePolicySpec) -> Vec<String> {
    let mut errors = Vec::new();

    if !policy.models_disjoint() {
        errors.push("models.allowed and models.blocked must be disjoint".to_string());
    }
    if !policy.tools_disjoint() {
        errors.push("tools.allowed and tools.blocked must be disjoint".to_string());
    }
    if policy.models.budget.monthly < Decimal::ZERO {
        errors.push("models.budget.monthly must be >= 0".to_string());
    }
    if !(1..=28).contains(&policy.models.budget.reset_day) {
        errors.push("models.budget.resetDay must be in 1..=28".to_string());
    }
    if !policy.retention.sessions.is_valid() {
        errors.push(format!("retention.sessions '{}' is not a valid duration", policy.retention.sessions.0));
    }
    if !policy.retention.artifacts.is_valid() {
        errors.push(format!("retention.artifacts '{}' is not a valid duration", policy.retention.artifacts.0));
    }
    if !policy.retention.audit_logs.is_valid() {
        errors.push(format!("retention.auditLogs '{}' is not a valid duration", policy.retention.audit_logs.0));
    }
    if !policy.webhook_auth.rate_limit.is_valid() {
        errors.push("webhookAuth.rateLimit values out of range".to_string());
    }
    for webhook in &policy.notifications.webhooks {
        if !webhook.has_valid_scheme() {
            errors.push(format!("notification webhook url '{}' must be http or https", webhook.url));
        }
    }

    errors
}

/// Rolls up `status.usage.budget.percentUsed`, saturating at a sane display
/// bound rather than dividing by zero when no budget is configured.
pub fn percent_used(used: Decimal, monthly: Decimal) -> f64 {
    if monthly <= Decimal::ZERO {
        return 0.0;
    }
    let ratio = used / monthly;
    (ratio * Decimal::from(100)).to_string().parse::<f64>().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ModelConstraints, ModelPolicy, BudgetConfig, ToolConstraints, ToolPolicy};
    use std::str::FromStr;

    fn policy_with_budget(monthly: &str) -> NamespacePolicySpec {
        NamespacePolicySpec {
            models: ModelPolicy {
                budget: BudgetConfig { monthly: Decimal::from_str(monthly).unwrap(), ..BudgetConfig::default() },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_budget_exactly_at_remaining_allowance_is_admitted() {
        let policy = policy_with_budget("100.00");
        let snapshot = SessionPolicySnapshot {
            model_constraints: ModelConstraints { budget: Decimal::from_str("100.00").unwrap(), ..Default::default() },
            ..Default::default()
        };
        let violations = detect_policy_violations(&snapshot, &policy, Decimal::ZERO, 0);
        assert!(violations.is_empty(), "budget equal to remaining allowance should be admitted");
    }

    #[test]
    fn test_budget_one_unit_over_is_rejected() {
        let policy = policy_with_budget("100.00");
        let snapshot = SessionPolicySnapshot {
            model_constraints: ModelConstraints { budget: Decimal::from_str("100.01").unwrap(), ..Default::default() },
            ..Default::default()
        };
        let violations = detect_policy_violations(&snapshot, &policy, Decimal::ZERO, 0);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].reason(), "BudgetExceeded");
    }

    #[test]
    fn test_budget_accounts_for_already_used_this_period() {
        let policy = policy_with_budget("100.00");
        let snapshot = SessionPolicySnapshot {
            model_constraints: ModelConstraints { budget: Decimal::from_str("10.00").unwrap(), ..Default::default() },
            ..Default::default()
        };
        let violations = detect_policy_violations(&snapshot, &policy, Decimal::from_str("95.00").unwrap(), 0);
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn test_model_allowed_list_enforced() {
        let policy = NamespacePolicySpec {
            models: ModelPolicy { allowed: vec!["claude-3-sonnet".into()], ..Default::default() },
            ..Default::default()
        };
        let snapshot = SessionPolicySnapshot {
            model_constraints: ModelConstraints { allowed: vec!["claude-3-opus".into()], ..Default::default() },
            ..Default::default()
        };
        let violations = detect_policy_violations(&snapshot, &policy, Decimal::ZERO, 0);
        assert!(violations.contains(&ConstraintViolation::ModelNotAllowed("claude-3-opus".into())));
    }

    #[test]
    fn test_empty_allowed_list_means_unrestricted() {
        let policy = NamespacePolicySpec::default();
        let snapshot = SessionPolicySnapshot {
            model_constraints: ModelConstraints { allowed: vec!["anything".into()], ..Default::default() },
            ..Default::default()
        };
        let violations = detect_policy_violations(&snapshot, &policy, Decimal::ZERO, 0);
        assert!(violations.is_empty());
    }

    #[test]
    fn test_model_blocked_takes_priority_even_if_in_allowed() {
        let policy = NamespacePolicySpec {
            models: ModelPolicy {
                allowed: vec!["claude-3-opus".into()],
                blocked: vec![],
                ..Default::default()
            },
            ..Default::default()
        };
        let snapshot = SessionPolicySnapshot::default();
        assert!(detect_policy_violations(&snapshot, &policy, Decimal::ZERO, 0).is_empty());
    }

    #[test]
    fn test_tool_constraints_enforced() {
        let policy = NamespacePolicySpec {
            tools: ToolPolicy { blocked: vec!["shell".into()], ..Default::default() },
            ..Default::default()
        };
        let snapshot = SessionPolicySnapshot {
            tool_constraints: ToolConstraints { allowed: vec!["shell".into()], blocked: vec![] },
            ..Default::default()
        };
        let violations = detect_policy_violations(&snapshot, &policy, Decimal::ZERO, 0);
        assert!(violations.contains(&ConstraintViolation::ToolBlocked("shell".into())));
    }

    #[test]
    fn test_active_session_cap_enforced_at_boundary() {
        let policy = NamespacePolicySpec { max_active_sessions: Some(5), ..Default::default() };
        let snapshot = SessionPolicySnapshot::default();
        assert!(detect_policy_violations(&snapshot, &policy, Decimal::ZERO, 4).is_empty());
        assert!(!detect_policy_violations(&snapshot, &policy, Decimal::ZERO, 5).is_empty());
    }

    #[test]
    fn test_validate_policy_shape_rejects_non_disjoint_models() {
        let policy = NamespacePolicySpec {
            models: ModelPolicy {
                allowed: vec!["a".into()],
                blocked: vec!["a".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        let errors = validate_policy_shape(&policy);
        assert!(errors.iter().any(|e| e.contains("disjoint")));
    }

    #[test]
    fn test_validate_policy_shape_rejects_bad_reset_day() {
        let policy = NamespacePolicySpec {
            models: ModelPolicy {
                budget: BudgetConfig { reset_day: 29, ..BudgetConfig::default() },
                ..Default::default()
            },
            ..Default::default()
        };
        let errors = validate_policy_shape(&policy);
        assert!(errors.iter().any(|e| e.contains("resetDay")));
    }

    #[test]
    fn test_validate_policy_shape_accepts_defaults() {
        assert!(validate_policy_shape(&NamespacePolicySpec::default()).is_empty());
    }

    #[test]
    fn test_percent_used_handles_zero_budget() {
        assert_eq!(percent_used(Decimal::from_str("5").unwrap(), Decimal::ZERO), 0.0);
    }

    #[test]
    fn test_percent_used_computes_ratio() {
        let pct = percent_used(Decimal::from_str("50").unwrap(), Decimal::from_str("100").unwrap());
        assert!((pct - 50.0).abs() < 0.001);
    }
}
