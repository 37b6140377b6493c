//! Connectivity/health status feed for diagnostics.
//!
//! Events are informational: the snapshot stream remains the source of truth
//! for what is displayed.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::ControlError;
use crate::fallback::{ProbeReason, TransitionReason};
use crate::health::Lifecycle;
use crate::model::ServiceKind;
use crate::reconnect::ReconnectPhase;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    LifecycleChanged {
        service: ServiceKind,
        from: Lifecycle,
        to: Lifecycle,
        reason: TransitionReason,
        timestamp: DateTime<Utc>,
    },
    ServiceSwitched {
        previous: Option<ServiceKind>,
        current: Option<ServiceKind>,
        timestamp: DateTime<Utc>,
    },
    ProbeIssued {
        service: ServiceKind,
        reason: ProbeReason,
        timestamp: DateTime<Utc>,
    },
    CyclingTriggered {
        from: ServiceKind,
        probe: ServiceKind,
        timestamp: DateTime<Utc>,
    },
    FetchFailed {
        service: ServiceKind,
        consecutive_errors: u32,
        message: String,
        timestamp: DateTime<Utc>,
    },
    AuthRequired {
        service: ServiceKind,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Connectivity {
        phase: ReconnectPhase,
        attempts_in_phase: u32,
        total_elapsed_sec: u64,
        timestamp: DateTime<Utc>,
    },
    ConnectionSilent {
        idle_sec: u64,
        timestamp: DateTime<Utc>,
    },
    RetryBudgetExhausted {
        elapsed_sec: u64,
        timestamp: DateTime<Utc>,
    },
}

impl StatusEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            StatusEvent::LifecycleChanged { timestamp, .. }
            | StatusEvent::ServiceSwitched { timestamp, .. }
            | StatusEvent::ProbeIssued { timestamp, .. }
            | StatusEvent::CyclingTriggered { timestamp, .. }
            | StatusEvent::FetchFailed { timestamp, .. }
            | StatusEvent::AuthRequired { timestamp, .. }
            | StatusEvent::Connectivity { timestamp, .. }
            | StatusEvent::ConnectionSilent { timestamp, .. }
            | StatusEvent::RetryBudgetExhausted { timestamp, .. } => *timestamp,
        }
    }

    /// Errors the embedding application has to act upon.
    pub fn as_fatal_error(&self) -> Option<ControlError> {
        match self {
            StatusEvent::AuthRequired {
                service, message, ..
            } => Some(ControlError::Auth(*service, message.clone())),
            StatusEvent::RetryBudgetExhausted { elapsed_sec, .. } => {
                Some(ControlError::RetryBudgetExhausted(*elapsed_sec))
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| format!("{{\"error\":\"{err}\"}}"))
    }
}
