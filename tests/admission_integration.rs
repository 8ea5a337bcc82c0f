mod common;

use common::{decimal, test_namespace_policy, test_session_spec};

use session_operator::admission::{validate_policy_write, validate_session_create, validate_session_update};

/* ============================= SESSION CREATE PIPELINE ============================= */

#[test]
fn test_full_create_pipeline_allow() {
    let spec = test_session_spec("claude-code", "1.0");
    let policy = test_namespace_policy(&[], "100.00");

    let verdict = validate_session_create(&spec, Some(&policy), decimal("0.00"), 0);

    assert!(verdict.allowed);
    assert!(verdict.reason.is_none());
}

#[test]
fn test_full_create_pipeline_denies_unregistered_framework() {
    let spec = test_session_spec("some-unknown-framework", "1.0");
    let policy = test_namespace_policy(&[], "100.00");

    let verdict = validate_session_create(&spec, Some(&policy), decimal("0.00"), 0);

    assert!(!verdict.allowed);
    assert_eq!(verdict.reason.as_deref(), Some("FrameworkNotRegistered"));
}

#[test]
fn test_full_create_pipeline_denies_model_not_allowed() {
    let mut spec = test_session_spec("claude-code", "1.0");
    spec.policy.model_constraints.allowed = vec!["claude-3-opus".into()];
    let policy = test_namespace_policy(&["claude-3-sonnet"], "100.00");

    let verdict = validate_session_create(&spec, Some(&policy), decimal("0.00"), 0);

    assert!(!verdict.allowed);
    assert_eq!(verdict.reason.as_deref(), Some("ModelNotAllowed"));
}

#[test]
fn test_full_create_pipeline_denies_budget_exceeded() {
    let mut spec = test_session_spec("claude-code", "1.0");
    spec.policy.model_constraints.budget = decimal("50.00");
    let policy = test_namespace_policy(&[], "100.00");

    // 80 already spent this period, 50 requested, only 20 remaining
    let verdict = validate_session_create(&spec, Some(&policy), decimal("80.00"), 0);

    assert!(!verdict.allowed);
    assert_eq!(verdict.reason.as_deref(), Some("BudgetExceeded"));
}

#[test]
fn test_full_create_pipeline_treats_no_policy_as_unrestricted() {
    let spec = test_session_spec("claude-code", "1.0");
    let verdict = validate_session_create(&spec, None, decimal("0.00"), 0);

    assert!(verdict.allowed);
}

#[test]
fn test_full_create_pipeline_denies_active_session_cap() {
    let spec = test_session_spec("claude-code", "1.0");
    let mut policy = test_namespace_policy(&[], "100.00");
    policy.max_active_sessions = Some(2);

    let verdict = validate_session_create(&spec, Some(&policy), decimal("0.00"), 2);

    assert!(!verdict.allowed);
    assert_eq!(verdict.reason.as_deref(), Some("ActiveSessionCapExceeded"));
}

/* ============================= SESSION UPDATE PIPELINE ============================= */

#[test]
fn test_full_update_pipeline_allows_stop_request() {
    let old = test_session_spec("claude-code", "1.0");
    let mut new = old.clone();
    new.stop_requested = true;

    let verdict = validate_session_update(&old, &new);
    assert!(verdict.allowed);
}

#[test]
fn test_full_update_pipeline_denies_spec_mutation() {
    let old = test_session_spec("claude-code", "1.0");
    let mut new = old.clone();
    new.framework.version = "1.1".into();

    let verdict = validate_session_update(&old, &new);
    assert!(!verdict.allowed);
    assert_eq!(verdict.reason.as_deref(), Some("SpecIsImmutable"));
}

#[test]
fn test_full_update_pipeline_denies_unsetting_stop() {
    let mut old = test_session_spec("claude-code", "1.0");
    old.stop_requested = true;
    let mut new = old.clone();
    new.stop_requested = false;

    let verdict = validate_session_update(&old, &new);
    assert!(!verdict.allowed);
    assert_eq!(verdict.reason.as_deref(), Some("StopRequestedIsOneWay"));
}

/* ============================= POLICY WRITE PIPELINE ============================= */

#[test]
fn test_full_policy_write_pipeline_allows_well_formed() {
    let policy = test_namespace_policy(&["claude-3-sonnet"], "100.00");
    assert!(validate_policy_write(&policy).allowed);
}

#[test]
fn test_full_policy_write_pipeline_denies_overlapping_models() {
    let mut policy = test_namespace_policy(&["claude-3-sonnet"], "100.00");
    policy.models.blocked = vec!["claude-3-sonnet".into()];

    let verdict = validate_policy_write(&policy);
    assert!(!verdict.allowed);
    assert_eq!(verdict.reason.as_deref(), Some("InvalidPolicyShape"));
}

#[test]
fn test_full_policy_write_pipeline_denies_negative_budget() {
    let mut policy = test_namespace_policy(&[], "100.00");
    policy.models.budget.monthly = decimal("-5.00");

    let verdict = validate_policy_write(&policy);
    assert!(!verdict.allowed);
}
