//! Admission validation: pure decision logic for the `SessionValidator`
//! and `PolicyValidator` webhooks. No I/O here — the HTTP/AdmissionReview
//! plumbing lives in `commands/webhook.rs`, kept separate from these pure
//! decision functions so they stay independently testable.
//!
//! Both validators here fail CLOSED: any error encountered while deciding
//! (a missing `NamespacePolicy`, an unregistered framework, a malformed
//! snapshot) is a denial, never a pass-through, since this is a synchronous
//! gate on a tenant-owned write rather than a best-effort advisory check.

use rust_decimal::Decimal;

use crate::crd::{NamespacePolicySpec, SessionSpec};
use crate::frameworks;
use crate::governance;

/// Outcome of an admission decision, independent of how it is transported
/// back to the API server.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl AdmissionVerdict {
    pub fn allow() -> Self {
        Self { allowed: true, reason: None, message: None }
    }

    pub fn deny(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { allowed: false, reason: Some(reason.into()), message: Some(message.into()) }
    }
}

/// Validates a Session creation request.
///
/// `policy` is `None` when the tenant namespace carries no `NamespacePolicy`
/// at all; a tenant's policy may not exist yet when its first sessions are
/// created, so an absent policy is treated as unrestricted rather than denied
/// — only the framework registration check still applies.
pub fn validate_session_create(
    spec: &SessionSpec,
    policy: Option<&NamespacePolicySpec>,
    budget_used_this_period: Decimal,
    active_sessions: u32,
) -> AdmissionVerdict {
    if !frameworks::is_registered_kind(&spec.framework.kind) {
        return AdmissionVerdict::deny(
            "FrameworkNotRegistered",
            format!("framework type '{}' is not registered", spec.framework.kind),
        );
    }
    if frameworks::get_framework(&spec.framework.kind, &spec.framework.version).is_none() {
        return AdmissionVerdict::deny(
            "FrameworkVersionNotRegistered",
            format!("framework '{} {}' is not registered", spec.framework.kind, spec.framework.version),
        );
    }

    let Some(policy) = policy else {
        return AdmissionVerdict::allow();
    };

    let violations =
        governance::detect_policy_violations(&spec.policy, policy, budget_used_this_period, active_sessions);
    if let Some(first) = violations.first() {
        return AdmissionVerdict::deny(first.reason(), first.message());
    }

    AdmissionVerdict::allow()
}

/// Validates a Session update request. Every field of
/// `SessionSpec` is immutable once admitted except `stopRequested`, which
/// may only transition `false -> true` (a cooperative stop intent can be
/// requested but never withdrawn once set, and can never be requested as
/// part of the same update that changes anything else).
pub fn validate_session_update(old: &SessionSpec, new: &SessionSpec) -> AdmissionVerdict {
    if old.stop_requested && !new.stop_requested {
        return AdmissionVerdict::deny("StopRequestedIsOneWay", "stopRequested cannot be unset once requested");
    }

    let stop_requested_changed = old.stop_requested != new.stop_requested;
    let mut old_without_stop = old.clone();
    let mut new_without_stop = new.clone();
    old_without_stop.stop_requested = false;
    new_without_stop.stop_requested = false;

    if serde_json::to_value(&old_without_stop).ok() != serde_json::to_value(&new_without_stop).ok() {
        return AdmissionVerdict::deny("SpecIsImmutable", "only stopRequested may change after creation");
    }
    let _ = stop_requested_changed;

    AdmissionVerdict::allow()
}

/// Validates a NamespacePolicy create or update. Shape errors are
/// collected and joined so a tenant operator sees every
/// problem in one round trip rather than fixing them one at a time.
pub fn validate_policy_write(spec: &NamespacePolicySpec) -> AdmissionVerdict {
    let errors = governance::validate_policy_shape(spec);
    if errors.is_empty() {
        AdmissionVerdict::allow()
    } else {
        AdmissionVerdict::deny("InvalidPolicyShape", errors.join("; "))
    }
}
