//! Active / Degraded / Cooldown state machine, one instance per service.
//!
//! ```text
//!            errors >= threshold, or stale
//!   Active ─────────────────────────────────▶ Degraded ──┐ retry every
//!     ▲  ▲                                      │   ▲     │ retry_interval
//!     │  └──────────── retry succeeded ─────────┘   └─────┘
//!     │                                         │
//!     │ cooldown expired (+ probe)              │ retry_window elapsed
//!     │                                         ▼
//!     └──────────────────────────────────── Cooldown
//! ```
//!
//! A service re-activated by an expired cooldown is on probation: the probe
//! result either confirms it or sends it straight back to Degraded.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{ControllerSettings, FallbackPolicy};
use crate::health::{HealthTracker, Lifecycle, ServiceHealthState};
use crate::model::ServiceKind;

/// Nudge so that a strict "exceeds" bound fires on the first tick after it.
const STRICT_BOUND_EPSILON: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    ErrorThreshold,
    Stale,
    ProbeFailed,
    RetryWindowExhausted,
    CooldownExpired,
    Recovered,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeReason {
    DegradedRetry,
    CooldownExpired,
    Forced,
}

/// Side effects requested by the state machine; the owner executes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackAction {
    Transition {
        kind: ServiceKind,
        from: Lifecycle,
        to: Lifecycle,
        reason: TransitionReason,
    },
    Probe {
        kind: ServiceKind,
        reason: ProbeReason,
    },
}

#[derive(Clone, Copy, Debug)]
struct RetrySchedule {
    degraded_since: Instant,
    next_retry_at: Instant,
}

#[derive(Clone, Copy, Debug, Default)]
struct ServiceRuntime {
    retry: Option<RetrySchedule>,
    probation: bool,
    /// Set while the service's adapter is started.
    running_since: Option<Instant>,
}

#[derive(Debug)]
pub struct FallbackController {
    policies: HashMap<ServiceKind, FallbackPolicy>,
    tracker: HealthTracker,
    runtime: HashMap<ServiceKind, ServiceRuntime>,
}

impl FallbackController {
    /// Kinds without an explicit policy use the built-in defaults.
    pub fn new(mut policies: HashMap<ServiceKind, FallbackPolicy>) -> Self {
        for kind in ServiceKind::ALL {
            policies
                .entry(kind)
                .or_insert_with(|| FallbackPolicy::default_for(kind));
        }
        Self {
            policies,
            tracker: HealthTracker::new(),
            runtime: ServiceKind::ALL
                .iter()
                .map(|kind| (*kind, ServiceRuntime::default()))
                .collect(),
        }
    }

    pub fn from_settings(settings: &ControllerSettings) -> Self {
        Self::new(settings.policies.clone())
    }

    pub fn tracker(&self) -> &HealthTracker {
        &self.tracker
    }

    pub fn state(&self, kind: ServiceKind) -> &ServiceHealthState {
        self.tracker.state(kind)
    }

    pub fn lifecycle(&self, kind: ServiceKind) -> Lifecycle {
        self.tracker.lifecycle(kind)
    }

    pub fn policy(&self, kind: ServiceKind) -> &FallbackPolicy {
        &self.policies[&kind]
    }

    pub fn is_on_probation(&self, kind: ServiceKind) -> bool {
        self.runtime[&kind].probation
    }

    fn runtime_mut(&mut self, kind: ServiceKind) -> &mut ServiceRuntime {
        self.runtime.entry(kind).or_default()
    }

    /// The service's adapter has been started: staleness is now meaningful.
    pub fn mark_running(&mut self, kind: ServiceKind, now: Instant) {
        self.runtime_mut(kind).running_since = Some(now);
    }

    pub fn mark_stopped(&mut self, kind: ServiceKind) {
        self.runtime_mut(kind).running_since = None;
    }

    pub fn on_success(&mut self, kind: ServiceKind, now: Instant) -> Vec<FallbackAction> {
        self.tracker.record_success(kind, now);

        let mut actions = Vec::new();
        if !self.can_probe(kind, now) {
            // a result issued before the cooldown started does not end it
            debug!(service = %kind, "Late success ignored while cooling down");
            return actions;
        }

        let from = self.lifecycle(kind);
        if from != Lifecycle::Active {
            self.set_lifecycle(kind, Lifecycle::Active, None);
            actions.push(self.transition(kind, from, Lifecycle::Active, TransitionReason::Recovered));
        }

        let runtime = self.runtime_mut(kind);
        runtime.retry = None;
        if runtime.probation {
            runtime.probation = false;
            debug!(service = %kind, "Probe succeeded, service confirmed active");
        }
        actions
    }

    pub fn on_error(&mut self, kind: ServiceKind, now: Instant) -> Vec<FallbackAction> {
        let errors = self.tracker.record_error(kind, now);

        let mut actions = Vec::new();
        if self.lifecycle(kind) != Lifecycle::Active {
            // Degraded keeps retrying on its schedule, Cooldown waits.
            return actions;
        }

        if self.runtime[&kind].probation {
            self.enter_degraded(kind, now, TransitionReason::ProbeFailed, &mut actions);
            return actions;
        }

        let policy = self.policy(kind);
        if policy.on_error_fallback && errors >= policy.effective_error_threshold() {
            self.enter_degraded(kind, now, TransitionReason::ErrorThreshold, &mut actions);
        } else {
            debug!(service = %kind, errors, "Fetch error below threshold");
        }
        actions
    }

    /// Evaluates every time-driven rule whose deadline has passed.
    pub fn on_tick(&mut self, now: Instant) -> Vec<FallbackAction> {
        let mut actions = Vec::new();
        for kind in ServiceKind::ALL {
            match self.lifecycle(kind) {
                Lifecycle::Active => {
                    if self.is_stale(kind, now) {
                        self.enter_degraded(kind, now, TransitionReason::Stale, &mut actions);
                    }
                }
                Lifecycle::Degraded => self.tick_degraded(kind, now, &mut actions),
                Lifecycle::Cooldown => {
                    let expired = self
                        .state(kind)
                        .cooldown_until
                        .is_none_or(|until| now >= until);
                    if expired {
                        self.leave_cooldown(kind, Lifecycle::Cooldown, &mut actions);
                    }
                }
            }
        }
        actions
    }

    /// False while `kind` sits in a cooldown that has not expired yet.
    pub fn can_probe(&self, kind: ServiceKind, now: Instant) -> bool {
        let state = self.state(kind);
        state.lifecycle != Lifecycle::Cooldown || state.cooldown_until.is_none_or(|until| now >= until)
    }

    /// Out-of-schedule probe (cycling, manual refresh). Refused during an
    /// unexpired cooldown; otherwise a success confirms the service.
    pub fn force_probe(&mut self, kind: ServiceKind, now: Instant) -> Option<FallbackAction> {
        if !self.can_probe(kind, now) {
            debug!(service = %kind, "Forced probe refused, cooldown running");
            return None;
        }
        debug!(service = %kind, lifecycle = self.lifecycle(kind).as_str(), "Forced probe");
        Some(FallbackAction::Probe {
            kind,
            reason: ProbeReason::Forced,
        })
    }

    /// Earliest instant at which [`FallbackController::on_tick`] has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        ServiceKind::ALL
            .iter()
            .filter_map(|kind| self.deadline_for(*kind))
            .min()
    }

    fn deadline_for(&self, kind: ServiceKind) -> Option<Instant> {
        match self.lifecycle(kind) {
            Lifecycle::Active => self.stale_deadline(kind),
            Lifecycle::Degraded => self.runtime[&kind].retry.map(|retry| {
                let window_end = retry.degraded_since + self.policy(kind).retry_window();
                retry.next_retry_at.min(window_end)
            }),
            Lifecycle::Cooldown => self.state(kind).cooldown_until,
        }
    }

    /// Reference point for staleness of a running service: its last success,
    /// or the moment its adapter started if that is more recent.
    fn staleness_origin(&self, kind: ServiceKind) -> Option<Instant> {
        let running_since = self.runtime[&kind].running_since?;
        Some(match self.state(kind).last_success_at {
            Some(at) => at.max(running_since),
            None => running_since,
        })
    }

    fn staleness_applies(&self, kind: ServiceKind) -> bool {
        let policy = self.policy(kind);
        !(kind.capabilities().is_event_driven && policy.timeout_sec == 0)
    }

    fn stale_deadline(&self, kind: ServiceKind) -> Option<Instant> {
        if !self.staleness_applies(kind) {
            return None;
        }
        let origin = self.staleness_origin(kind)?;
        let policy = self.policy(kind);
        let by_timeout = policy.timeout().map(|timeout| origin + timeout);
        let by_threshold = policy
            .fallback_time_threshold()
            .filter(|_| policy.on_error_fallback)
            .map(|threshold| origin + threshold + STRICT_BOUND_EPSILON);
        match (by_timeout, by_threshold) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn is_stale(&self, kind: ServiceKind, now: Instant) -> bool {
        if !self.staleness_applies(kind) {
            return false;
        }
        let Some(origin) = self.staleness_origin(kind) else {
            return false;
        };
        let staleness = now.saturating_duration_since(origin);
        let policy = self.policy(kind);

        if policy.timeout().is_some_and(|timeout| staleness >= timeout) {
            return true;
        }
        policy.on_error_fallback
            && policy
                .fallback_time_threshold()
                .is_some_and(|threshold| staleness > threshold)
    }

    fn tick_degraded(&mut self, kind: ServiceKind, now: Instant, actions: &mut Vec<FallbackAction>) {
        let window = self.policy(kind).retry_window();
        let interval = self.policy(kind).retry_interval();
        let Some(retry) = self.runtime[&kind].retry else {
            // Degraded without a schedule only happens with a zero window.
            self.enter_cooldown(kind, now, actions);
            return;
        };

        if now >= retry.degraded_since + window {
            self.enter_cooldown(kind, now, actions);
        } else if now >= retry.next_retry_at {
            self.runtime_mut(kind).retry = Some(RetrySchedule {
                next_retry_at: now + interval,
                ..retry
            });
            actions.push(FallbackAction::Probe {
                kind,
                reason: ProbeReason::DegradedRetry,
            });
        }
    }

    fn enter_degraded(
        &mut self,
        kind: ServiceKind,
        now: Instant,
        reason: TransitionReason,
        actions: &mut Vec<FallbackAction>,
    ) {
        let from = self.lifecycle(kind);
        self.set_lifecycle(kind, Lifecycle::Degraded, None);
        actions.push(self.transition(kind, from, Lifecycle::Degraded, reason));

        let policy = self.policy(kind);
        let window = policy.retry_window();
        let interval = policy.retry_interval();
        let runtime = self.runtime_mut(kind);
        runtime.probation = false;

        if window.is_zero() {
            runtime.retry = None;
            self.enter_cooldown(kind, now, actions);
            return;
        }

        runtime.retry = Some(RetrySchedule {
            degraded_since: now,
            next_retry_at: now + interval,
        });
        actions.push(FallbackAction::Probe {
            kind,
            reason: ProbeReason::DegradedRetry,
        });
    }

    fn enter_cooldown(&mut self, kind: ServiceKind, now: Instant, actions: &mut Vec<FallbackAction>) {
        self.runtime_mut(kind).retry = None;
        let cooldown = self.policy(kind).retry_cooldown();
        let from = self.lifecycle(kind);

        if cooldown.is_zero() {
            self.leave_cooldown(kind, from, actions);
            return;
        }

        self.set_lifecycle(kind, Lifecycle::Cooldown, Some(now + cooldown));
        actions.push(self.transition(
            kind,
            from,
            Lifecycle::Cooldown,
            TransitionReason::RetryWindowExhausted,
        ));
    }

    /// Back to Active on probation, with the single re-probe.
    fn leave_cooldown(&mut self, kind: ServiceKind, from: Lifecycle, actions: &mut Vec<FallbackAction>) {
        self.set_lifecycle(kind, Lifecycle::Active, None);
        let runtime = self.runtime_mut(kind);
        runtime.retry = None;
        runtime.probation = true;
        actions.push(self.transition(kind, from, Lifecycle::Active, TransitionReason::CooldownExpired));
        actions.push(FallbackAction::Probe {
            kind,
            reason: ProbeReason::CooldownExpired,
        });
    }

    fn set_lifecycle(&mut self, kind: ServiceKind, lifecycle: Lifecycle, cooldown_until: Option<Instant>) {
        let state = self.tracker.state_mut(kind);
        state.lifecycle = lifecycle;
        state.cooldown_until = cooldown_until;
    }

    fn transition(
        &self,
        kind: ServiceKind,
        from: Lifecycle,
        to: Lifecycle,
        reason: TransitionReason,
    ) -> FallbackAction {
        info!(
            service = %kind,
            from = from.as_str(),
            to = to.as_str(),
            ?reason,
            "Service lifecycle transition"
        );
        FallbackAction::Transition {
            kind,
            from,
            to,
            reason,
        }
    }
}
