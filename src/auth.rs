//! Authentication and authorization for the ingress plane and read API.
//!
//! Three distinct concerns live here, deliberately kept in one module
//! because they share the same constant-time-comparison discipline:
//! - webhook credential verification (HMAC signature, API key) and the
//!   tenant resolution that falls out of "which credential matched";
//! - OIDC bearer token decoding for the read API;
//! - the orchestrator authorization subsystem query (`SubjectAccessReview`)
//!   with a short TTL decision cache.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use k8s_openapi::api::authorization::v1::{SubjectAccessReview, SubjectAccessReviewSpec, ResourceAttributes};
use kube::{Api, Client};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::CoreError;

/// Groups in this set are granted every verb on every resource in every
/// tenant without consulting the authorization subsystem.
pub const SYSTEM_ADMIN_GROUP: &str = "system:admin";

/* ============================= WEBHOOK CREDENTIAL VERIFICATION ============================= */

type HmacSha256 = Hmac<Sha256>;

/// Verifies an HMAC-SHA256 signature over the raw request body. `signature_hex`
/// is the lowercase-hex digest as presented in the source's signature header
/// (e.g. the value after `sha256=` in a GitHub-style `X-Hub-Signature-256`).
pub fn verify_hmac_signature(secret: &[u8], body: &[u8], signature_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    let Ok(presented) = hex_decode(signature_hex) else {
        return false;
    };
    if presented.len() != expected.len() {
        return false;
    }
    bool::from(expected.as_slice().ct_eq(&presented))
}

/// Resolves the tenant bound to an HMAC-signed webhook by trying every
/// known `(tenant, secret)` candidate until one verifies. Never trusts a
/// tenant hint from the request.
pub fn resolve_tenant_by_hmac<'a>(
    body: &[u8],
    signature_hex: &str,
    candidates: impl IntoIterator<Item = (&'a str, &'a [u8])>,
) -> Option<&'a str> {
    candidates
        .into_iter()
        .find(|(_, secret)| verify_hmac_signature(secret, body, signature_hex))
        .map(|(tenant, _)| tenant)
}

/// One-way derivation of a presented API key, the form stored as a
/// `NamespacePolicy` verifier.
pub fn hash_api_key(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    hex_encode(&digest)
}

/// Compares a presented API key's hash against a stored verifier in constant
/// time. Never compares the raw secret by `==`.
pub fn verify_api_key(presented: &str, stored_verifier_hex: &str) -> bool {
    let presented_hash = hash_api_key(presented);
    let (Ok(a), Ok(b)) = (hex_decode(&presented_hash), hex_decode(stored_verifier_hex)) else {
        return false;
    };
    a.len() == b.len() && bool::from(a.as_slice().ct_eq(&b))
}

/// Resolves the tenant bound to an API-key-authenticated webhook by checking
/// the presented key against every tenant's stored verifier for `source`.
/// The credential maps to exactly one tenant, never a client-supplied hint.
pub fn resolve_tenant_by_api_key<'a>(
    source: &str,
    presented_key: &str,
    policies: impl IntoIterator<Item = (&'a str, &'a BTreeMap<String, String>)>,
) -> Option<&'a str> {
    policies
        .into_iter()
        .find(|(_, api_keys)| {
            api_keys
                .get(source)
                .is_some_and(|verifier| verify_api_key(presented_key, verifier))
        })
        .map(|(tenant, _)| tenant)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 {
        return Err(());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

/// Mints the per-session runner callback token: an HMAC-SHA256
/// signature over the canonical `"{sessionId}:{tenant}"` claim, minted by
/// the reconciler when it builds the workload environment and verified by
/// the ingress plane's callback route the same way webhook signatures are
/// verified.
pub fn mint_callback_token(secret: &[u8], session_id: &str, tenant: &str) -> String {
    let claim = callback_claim(session_id, tenant);
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return String::new();
    };
    mac.update(claim.as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

/// Verifies a runner callback token against the claimed `(session_id, tenant)`.
pub fn verify_callback_token(secret: &[u8], session_id: &str, tenant: &str, token_hex: &str) -> bool {
    verify_hmac_signature(secret, callback_claim(session_id, tenant).as_bytes(), token_hex)
}

fn callback_claim(session_id: &str, tenant: &str) -> String {
    format!("{session_id}:{tenant}")
}

/* ============================= OIDC BEARER TOKENS ============================= */

/// The identity the external identity provider asserts for a bearer token,
/// validated by an OIDC-compatible provider and yielding `{username, groups, uid}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Identity {
    #[serde(rename = "sub")]
    pub uid: String,
    #[serde(default, alias = "preferred_username")]
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Identity {
    pub fn is_system_admin(&self) -> bool {
        self.groups.iter().any(|g| g == SYSTEM_ADMIN_GROUP)
    }
}

/// Validates a bearer token against a pre-fetched JWKS decoding key.
/// JWKS retrieval/rotation from the OIDC issuer is external-provider
/// plumbing handled elsewhere; this takes the resolved key directly so the
/// validation logic itself is independently testable.
pub fn validate_bearer_token(token: &str, decoding_key: &DecodingKey) -> Result<Identity, CoreError> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_exp = true;
    let data = jsonwebtoken::decode::<Identity>(token, decoding_key, &validation)
        .map_err(|e| CoreError::auth_n(format!("invalid bearer token: {e}")))?;
    Ok(data.claims)
}

/* ============================= AUTHORIZATION SUBSYSTEM ============================= */

/// Asks the orchestrator's authorization subsystem (Kubernetes
/// `SubjectAccessReview`) whether `identity` may perform `verb` on
/// `resource` within `tenant`. System admins short-circuit to allow.
pub async fn authorize(
    client: &Client,
    identity: &Identity,
    verb: &str,
    resource: &str,
    tenant: &str,
) -> Result<bool, CoreError> {
    if identity.is_system_admin() {
        return Ok(true);
    }

    let api: Api<SubjectAccessReview> = Api::all(client.clone());
    let review = SubjectAccessReview {
        spec: SubjectAccessReviewSpec {
            user: Some(identity.username.clone()),
            groups: Some(identity.groups.clone()),
            resource_attributes: Some(ResourceAttributes {
                namespace: Some(tenant.to_string()),
                verb: Some(verb.to_string()),
                resource: Some(resource.to_string()),
                group: Some("sessions.io".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    };

    let result = api.create(&Default::default(), &review).await?;
    Ok(result.status.map(|s| s.allowed).unwrap_or(false))
}

/// Bounded, TTL-invalidated cache for `(subject, verb, resource, tenant)`
/// authorization decisions, avoiding a `SubjectAccessReview` round trip on
/// every read-API request.
pub struct AuthzCache {
    entries: Mutex<HashMap<(String, String, String, String), (bool, Instant)>>,
    ttl: Duration,
    max_entries: usize,
}

impl AuthzCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self { entries: Mutex::new(HashMap::new()), ttl, max_entries }
    }

    pub fn get(&self, subject: &str, verb: &str, resource: &str, tenant: &str) -> Option<bool> {
        let key = (subject.to_string(), verb.to_string(), resource.to_string(), tenant.to_string());
        let mut entries = self.entries.lock().expect("authz cache lock poisoned");
        match entries.get(&key) {
            Some((decision, inserted_at)) if inserted_at.elapsed() < self.ttl => Some(*decision),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, subject: &str, verb: &str, resource: &str, tenant: &str, decision: bool) {
        let mut entries = self.entries.lock().expect("authz cache lock poisoned");
        if entries.len() >= self.max_entries {
            entries.clear();
        }
        entries.insert(
            (subject.to_string(), verb.to_string(), resource.to_string(), tenant.to_string()),
            (decision, Instant::now()),
        );
    }

    /// Invalidates every cached decision for a tenant, e.g. on a tenant
    /// membership change event.
    pub fn invalidate_tenant(&self, tenant: &str) {
        let mut entries = self.entries.lock().expect("authz cache lock poisoned");
        entries.retain(|(_, _, _, t), _| t != tenant);
    }
}
