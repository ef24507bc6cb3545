//! Typed failure taxonomy for the control plane.
//!
//! Reconcilers either return an `Action` or one of these errors; the error
//! policy translates the class into retry behavior (validation is terminal,
//! conflicts retry locally then requeue, everything else backs off).

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error("warm pool not found: {0}")]
    PoolNotFound(String),

    #[error("no assignable warm pod for runtime '{0}'")]
    PoolExhausted(String),

    #[error("invalid spec: {0}")]
    Validation(String),

    #[error("conflict writing {0} after {1} attempts")]
    Conflict(String, u32),

    #[error("scrub did not finish within {0:?}")]
    ScrubTimeout(Duration),

    #[error("reconcile exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),

    #[error("reconcile panicked for {0}")]
    ReconcilePanic(String),

    #[error("object is missing required field: {0}")]
    MissingField(&'static str),

    #[error("kubernetes api: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("serialization: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Terminal errors are not retried; the resource is parked in Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}

/// True when the apiserver rejected a write because the resourceVersion we
/// carried was stale.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason != "AlreadyExists")
}

/// True when a create hit an object that already exists. Distinct from a
/// stale-write conflict even though both surface as HTTP 409.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: String::new(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_conflict_classification() {
        assert!(is_conflict(&api_error(409, "Conflict")));
        assert!(!is_conflict(&api_error(409, "AlreadyExists")));
        assert!(!is_conflict(&api_error(404, "NotFound")));

        assert!(is_already_exists(&api_error(409, "AlreadyExists")));
        assert!(!is_already_exists(&api_error(409, "Conflict")));

        assert!(is_not_found(&api_error(404, "NotFound")));
        assert!(!is_not_found(&api_error(409, "Conflict")));
    }

    #[test]
    fn test_only_validation_is_terminal() {
        assert!(Error::Validation("bad".to_string()).is_terminal());
        assert!(!Error::Conflict("x".to_string(), 3).is_terminal());
        assert!(!Error::PoolExhausted("python:3.10".to_string()).is_terminal());
        assert!(!Error::from(api_error(500, "InternalError")).is_terminal());
    }
}
