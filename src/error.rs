use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// The error taxonomy the control plane classifies every failure into.
///
/// Validators and the ingress plane branch on this to decide an HTTP
/// status; the reconcilers branch on it to decide retry vs. terminal
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthN,
    AuthZ,
    ShapeInvalid,
    PolicyViolation,
    Conflict,
    NotFound,
    RateLimited,
    Transient,
    Fatal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::AuthN => StatusCode::UNAUTHORIZED,
            ErrorKind::AuthZ => StatusCode::FORBIDDEN,
            ErrorKind::ShapeInvalid => StatusCode::BAD_REQUEST,
            ErrorKind::PolicyViolation => StatusCode::FORBIDDEN,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a reconciler should requeue rather than fail the Session terminally.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// The structured error every boundary (admission, webhook, read API) returns.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub reason: String,
    pub message: String,
    pub trace_id: Option<String>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            message: message.into(),
            trace_id: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn auth_n(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthN, "AuthN", message)
    }

    pub fn auth_z(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthZ, "AuthZ", message)
    }

    pub fn shape_invalid(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ShapeInvalid, reason, message)
    }

    pub fn policy_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PolicyViolation, "PolicyViolation", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, "Conflict", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, "NotFound", message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, "RateLimited", message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, "Transient", message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, "Fatal", message)
    }
}

/// Classifies an orchestrator (`kube`) error by its HTTP status into a
/// reusable `From` impl callers can propagate with `?`, rather than
/// matching `Err(kube::Error::Api(err)) if err.code == 409` ad hoc at
/// every call site.
impl From<kube::Error> for CoreError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) => match resp.code {
                404 => CoreError::not_found(resp.message.clone()),
                409 => CoreError::conflict(resp.message.clone()),
                401 => CoreError::auth_n(resp.message.clone()),
                403 => CoreError::auth_z(resp.message.clone()),
                429 => CoreError::rate_limited(resp.message.clone()),
                code if (500..600).contains(&code) => CoreError::transient(resp.message.clone()),
                _ => CoreError::fatal(resp.message.clone()),
            },
            _ => CoreError::transient(err.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: u16,
    reason: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace_id: &'a Option<String>,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let body = ErrorBody {
            code: status.as_u16(),
            reason: &self.reason,
            message: &self.message,
            trace_id: &self.trace_id,
        };
        (status, axum::Json(serde_json::to_value(body).unwrap_or_default())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorKind::AuthN.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::AuthZ.status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorKind::PolicyViolation.status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorKind::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorKind::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorKind::Conflict.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Fatal.is_retryable());
        assert!(!ErrorKind::PolicyViolation.is_retryable());
        assert!(!ErrorKind::Conflict.is_retryable());
    }

    #[test]
    fn test_from_kube_api_error_classifies_by_code() {
        let mk = |code: u16| {
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: "boom".into(),
                reason: "Boom".into(),
                code,
            })
        };
        assert_eq!(CoreError::from(mk(404)).kind, ErrorKind::NotFound);
        assert_eq!(CoreError::from(mk(409)).kind, ErrorKind::Conflict);
        assert_eq!(CoreError::from(mk(500)).kind, ErrorKind::Transient);
        assert_eq!(CoreError::from(mk(400)).kind, ErrorKind::Fatal);
    }

    #[test]
    fn test_with_trace_id_round_trips() {
        let err = CoreError::not_found("missing").with_trace_id("abc-123");
        assert_eq!(err.trace_id.as_deref(), Some("abc-123"));
    }
}
