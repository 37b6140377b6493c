use thiserror::Error;

use crate::model::ServiceKind;

/// Failure reported by a single fetch of a now-playing source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network hiccup, 5xx, timeout, malformed payload... counts toward
    /// the service's consecutive error budget.
    #[error("transient fetch error: {0}")]
    Transient(String),
    /// Credentials were refused. Never retried by the controller.
    #[error("authentication refused: {0}")]
    Auth(String),
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        FetchError::Transient(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        FetchError::Auth(message.into())
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, FetchError::Auth(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("{0}: transient fetch error: {1}")]
    TransientFetch(ServiceKind, String),
    #[error("{0}: re-authentication required: {1}")]
    Auth(ServiceKind, String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Live connection lost: {0}")]
    ConnectionLost(String),
    #[error("Live connection silent for {0}s")]
    ConnectionSilent(u64),
    #[error("Live connection retry budget exhausted after {0}s")]
    RetryBudgetExhausted(u64),
    #[error("Controller is shut down")]
    ControllerClosed,
}

impl ControlError {
    pub fn from_fetch(kind: ServiceKind, err: FetchError) -> Self {
        match err {
            FetchError::Transient(msg) => ControlError::TransientFetch(kind, msg),
            FetchError::Auth(msg) => ControlError::Auth(kind, msg),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        ControlError::Config(message.into())
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        ControlError::ConnectionLost(message.into())
    }

    /// Errors that escape local recovery and must reach the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ControlError::Auth(..) | ControlError::RetryBudgetExhausted(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_auth_and_budget_are_fatal() {
        assert!(ControlError::from_fetch(ServiceKind::CloudPoll, FetchError::auth("401")).is_fatal());
        assert!(ControlError::RetryBudgetExhausted(1800).is_fatal());
        assert!(!ControlError::from_fetch(ServiceKind::CloudPoll, FetchError::transient("503")).is_fatal());
        assert!(!ControlError::ConnectionSilent(30).is_fatal());
        assert!(!ControlError::config("bad priority").is_fatal());
    }

    #[test]
    fn test_display_names_the_service() {
        let err = ControlError::from_fetch(ServiceKind::DirectPoll, FetchError::transient("timeout"));
        assert_eq!(err.to_string(), "direct_poll: transient fetch error: timeout");
    }
}
