//! Per-service success/failure history.
//!
//! The tracker records outcomes and answers staleness queries; it never
//! decides a lifecycle transition itself. Lifecycle fields live here so that
//! a single table describes a service, but only the fallback controller
//! writes them.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::model::ServiceKind;

/// Eligibility of a service for selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Active,
    Degraded,
    Cooldown,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Active => "active",
            Lifecycle::Degraded => "degraded",
            Lifecycle::Cooldown => "cooldown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceHealthState {
    pub consecutive_errors: u32,
    pub last_success_at: Option<Instant>,
    pub last_error_at: Option<Instant>,
    pub lifecycle: Lifecycle,
    /// Set only while `lifecycle == Cooldown`.
    pub cooldown_until: Option<Instant>,
}

impl Default for ServiceHealthState {
    fn default() -> Self {
        Self {
            consecutive_errors: 0,
            last_success_at: None,
            last_error_at: None,
            lifecycle: Lifecycle::Active,
            cooldown_until: None,
        }
    }
}

#[derive(Debug)]
pub struct HealthTracker {
    states: HashMap<ServiceKind, ServiceHealthState>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    /// Every service starts Active with a clean history.
    pub fn new() -> Self {
        Self {
            states: ServiceKind::ALL
                .iter()
                .map(|kind| (*kind, ServiceHealthState::default()))
                .collect(),
        }
    }

    pub fn state(&self, kind: ServiceKind) -> &ServiceHealthState {
        &self.states[&kind]
    }

    pub(crate) fn state_mut(&mut self, kind: ServiceKind) -> &mut ServiceHealthState {
        self.states.entry(kind).or_default()
    }

    pub fn lifecycle(&self, kind: ServiceKind) -> Lifecycle {
        self.state(kind).lifecycle
    }

    pub fn record_success(&mut self, kind: ServiceKind, at: Instant) {
        let state = self.state_mut(kind);
        state.consecutive_errors = 0;
        state.last_success_at = Some(at);
    }

    /// Returns the updated consecutive error count.
    pub fn record_error(&mut self, kind: ServiceKind, at: Instant) -> u32 {
        let state = self.state_mut(kind);
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        state.last_error_at = Some(at);
        state.consecutive_errors
    }

    /// Time since the last success; `None` stands for "never succeeded"
    /// (infinitely stale).
    pub fn staleness(&self, kind: ServiceKind, now: Instant) -> Option<Duration> {
        self.state(kind)
            .last_success_at
            .map(|at| now.saturating_duration_since(at))
    }

    pub fn has_ever_succeeded(&self, kind: ServiceKind) -> bool {
        self.state(kind).last_success_at.is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ServiceKind, &ServiceHealthState)> {
        ServiceKind::ALL.iter().map(|kind| (*kind, &self.states[kind]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let tracker = HealthTracker::new();
        for (_, state) in tracker.iter() {
            assert_eq!(state, &ServiceHealthState::default());
            assert_eq!(state.lifecycle, Lifecycle::Active);
        }
    }

    #[test]
    fn test_success_resets_error_count() {
        let mut tracker = HealthTracker::new();
        let t0 = Instant::now();
        assert_eq!(tracker.record_error(ServiceKind::CloudPoll, t0), 1);
        assert_eq!(tracker.record_error(ServiceKind::CloudPoll, t0), 2);
        tracker.record_success(ServiceKind::CloudPoll, t0 + Duration::from_secs(1));

        let state = tracker.state(ServiceKind::CloudPoll);
        assert_eq!(state.consecutive_errors, 0);
        assert_eq!(state.last_error_at, Some(t0));
        assert_eq!(state.last_success_at, Some(t0 + Duration::from_secs(1)));
        // other services untouched
        assert_eq!(tracker.state(ServiceKind::DirectPoll).consecutive_errors, 0);
    }

    #[test]
    fn test_staleness() {
        let mut tracker = HealthTracker::new();
        let t0 = Instant::now();
        assert_eq!(tracker.staleness(ServiceKind::DirectPoll, t0), None);
        assert!(!tracker.has_ever_succeeded(ServiceKind::DirectPoll));

        tracker.record_success(ServiceKind::DirectPoll, t0);
        assert_eq!(
            tracker.staleness(ServiceKind::DirectPoll, t0 + Duration::from_secs(4)),
            Some(Duration::from_secs(4))
        );
        // an earlier `now` never underflows
        assert_eq!(tracker.staleness(ServiceKind::DirectPoll, t0), Some(Duration::ZERO));
    }
}
