//! Backoff schedule of the live event connection.
//!
//! ```text
//!   lost ──▶ ActiveRetry (every retry_interval, for retry_active_seconds)
//!              │
//!              ▼
//!            Cooldown (every retry_cooldown_seconds)
//!              │ retry_max_total_seconds since the loss
//!              ▼
//!            Exhausted (until reset)
//! ```
//!
//! Any successful connect goes back to `Connected`; the next loss starts a
//! fresh budget.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ReconnectSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPhase {
    Connected,
    ActiveRetry,
    Cooldown,
    Exhausted,
}

impl ReconnectPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconnectPhase::Connected => "connected",
            ReconnectPhase::ActiveRetry => "active_retry",
            ReconnectPhase::Cooldown => "cooldown",
            ReconnectPhase::Exhausted => "exhausted",
        }
    }

    pub fn is_retrying(&self) -> bool {
        matches!(self, ReconnectPhase::ActiveRetry | ReconnectPhase::Cooldown)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectState {
    pub phase: ReconnectPhase,
    /// Start of the current retry budget.
    pub lost_at: Option<Instant>,
    pub phase_started_at: Instant,
    pub attempts_in_phase: u32,
    /// Attempts since `lost_at`, across phases.
    pub total_attempts: u32,
    pub next_attempt_at: Option<Instant>,
    pub last_event_at: Option<Instant>,
}

impl ReconnectState {
    /// Time spent without a connection; zero while connected.
    pub fn total_elapsed(&self, now: Instant) -> Duration {
        match self.phase {
            ReconnectPhase::Connected => Duration::ZERO,
            _ => self
                .lost_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default(),
        }
    }
}

/// What the owner of the connection must do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Open a new connection.
    Attempt,
    /// The open connection is silent: drop it, retries are scheduled.
    DropSilent { idle: Duration },
    /// The retry budget is spent.
    Exhausted { elapsed: Duration },
}

#[derive(Debug)]
pub struct ReconnectManager {
    settings: ReconnectSettings,
    state: ReconnectState,
}

impl ReconnectManager {
    /// Starts as a fresh loss at `now`, so the first connect is an attempt
    /// within the normal budget.
    pub fn new(settings: ReconnectSettings, now: Instant) -> Self {
        let mut manager = Self {
            settings,
            state: ReconnectState {
                phase: ReconnectPhase::ActiveRetry,
                lost_at: None,
                phase_started_at: now,
                attempts_in_phase: 0,
                total_attempts: 0,
                next_attempt_at: None,
                last_event_at: None,
            },
        };
        manager.begin_retry(now);
        manager.state.next_attempt_at = Some(now);
        manager
    }

    pub fn state(&self) -> &ReconnectState {
        &self.state
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.state.phase
    }

    pub fn on_connected(&mut self, now: Instant) {
        info!(
            attempts = self.state.total_attempts,
            "Live connection established"
        );
        self.state = ReconnectState {
            phase: ReconnectPhase::Connected,
            lost_at: None,
            phase_started_at: now,
            attempts_in_phase: 0,
            total_attempts: 0,
            next_attempt_at: None,
            last_event_at: Some(now),
        };
    }

    /// Any traffic on the open connection.
    pub fn on_event(&mut self, now: Instant) {
        if self.state.phase == ReconnectPhase::Connected {
            self.state.last_event_at = Some(now);
        }
    }

    /// The connection dropped, or an attempt failed. Failed attempts do not
    /// move the schedule.
    pub fn on_lost(&mut self, now: Instant) {
        match self.state.phase {
            ReconnectPhase::Connected => {
                warn!("Live connection lost");
                self.begin_retry(now);
            }
            ReconnectPhase::ActiveRetry | ReconnectPhase::Cooldown => {
                debug!(
                    attempts = self.state.attempts_in_phase,
                    phase = self.state.phase.as_str(),
                    "Reconnect attempt failed"
                );
            }
            ReconnectPhase::Exhausted => {}
        }
    }

    /// External trigger: clears exhaustion and attempts right away.
    pub fn reset(&mut self, now: Instant) -> ReconnectAction {
        info!(phase = self.state.phase.as_str(), "Reconnect state reset");
        self.begin_retry(now);
        self.record_attempt(now);
        ReconnectAction::Attempt
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state.phase {
            ReconnectPhase::Connected => {
                let idle = self.settings.idle_timeout()?;
                self.state.last_event_at.map(|at| at + idle)
            }
            ReconnectPhase::ActiveRetry | ReconnectPhase::Cooldown => self.state.next_attempt_at,
            ReconnectPhase::Exhausted => None,
        }
    }

    pub fn on_tick(&mut self, now: Instant) -> Option<ReconnectAction> {
        let deadline = self.next_deadline()?;
        if now < deadline {
            return None;
        }

        if self.state.phase == ReconnectPhase::Connected {
            let idle = self
                .state
                .last_event_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default();
            warn!(idle_sec = idle.as_secs(), "Live connection silent, forcing reconnect");
            self.begin_retry(now);
            return Some(ReconnectAction::DropSilent { idle });
        }

        let elapsed = self.state.total_elapsed(now);
        if elapsed >= self.settings.max_total() {
            warn!(
                elapsed_sec = elapsed.as_secs(),
                attempts = self.state.total_attempts,
                "Reconnect retry budget exhausted"
            );
            self.enter_phase(ReconnectPhase::Exhausted, now);
            self.state.next_attempt_at = None;
            return Some(ReconnectAction::Exhausted { elapsed });
        }

        // first attempt already past a short active phase
        if self.state.phase == ReconnectPhase::ActiveRetry && elapsed > self.settings.active_phase()
        {
            self.enter_phase(ReconnectPhase::Cooldown, now);
        }

        self.record_attempt(now);
        Some(ReconnectAction::Attempt)
    }

    fn begin_retry(&mut self, now: Instant) {
        let first = self.settings.retry_interval().min(self.settings.max_total());
        self.state = ReconnectState {
            phase: ReconnectPhase::ActiveRetry,
            lost_at: Some(now),
            phase_started_at: now,
            attempts_in_phase: 0,
            total_attempts: 0,
            next_attempt_at: Some(now + first),
            last_event_at: None,
        };
    }

    fn enter_phase(&mut self, phase: ReconnectPhase, now: Instant) {
        info!(
            from = self.state.phase.as_str(),
            to = phase.as_str(),
            attempts = self.state.attempts_in_phase,
            "Reconnect phase change"
        );
        self.state.phase = phase;
        self.state.phase_started_at = now;
        self.state.attempts_in_phase = 0;
    }

    /// Counts an attempt made at `now` and schedules the next one, never past
    /// the end of the budget. The active phase ends with its last attempt.
    fn record_attempt(&mut self, now: Instant) {
        self.state.attempts_in_phase = self.state.attempts_in_phase.saturating_add(1);
        self.state.total_attempts = self.state.total_attempts.saturating_add(1);

        let lost_at = self.state.lost_at.unwrap_or(now);
        if self.state.phase == ReconnectPhase::ActiveRetry
            && now + self.settings.retry_interval() > lost_at + self.settings.active_phase()
        {
            self.enter_phase(ReconnectPhase::Cooldown, now);
        }

        let cadence = match self.state.phase {
            ReconnectPhase::Cooldown => self.settings.cooldown_interval(),
            _ => self.settings.retry_interval(),
        };
        let next = (now + cadence).min(lost_at + self.settings.max_total());
        self.state.next_attempt_at = Some(next);
        debug!(
            attempt = self.state.total_attempts,
            phase = self.state.phase.as_str(),
            "Reconnect attempt scheduled"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    /// Loses the connection at `t0` and returns the attempt offsets (in
    /// seconds) and the exhaustion offset, stepping one second at a time.
    fn drive(manager: &mut ReconnectManager, t0: Instant, horizon: u64) -> (Vec<u64>, Option<u64>) {
        let mut attempts = Vec::new();
        for s in 0..=horizon {
            match manager.on_tick(t0 + secs(s)) {
                Some(ReconnectAction::Attempt) => {
                    attempts.push(s);
                    manager.on_lost(t0 + secs(s));
                }
                Some(ReconnectAction::Exhausted { .. }) => return (attempts, Some(s)),
                _ => {}
            }
        }
        (attempts, None)
    }

    fn connected_then_lost(t0: Instant) -> ReconnectManager {
        let mut manager = ReconnectManager::new(ReconnectSettings::default(), t0);
        manager.on_connected(t0);
        manager.on_lost(t0);
        manager
    }

    #[test]
    fn test_initial_attempt_is_immediate() {
        let t0 = Instant::now();
        let mut manager = ReconnectManager::new(ReconnectSettings::default(), t0);
        assert_eq!(manager.next_deadline(), Some(t0));
        assert_eq!(manager.on_tick(t0), Some(ReconnectAction::Attempt));
        assert_eq!(manager.next_deadline(), Some(t0 + secs(3)));
    }

    #[test]
    fn test_active_phase_cadence() {
        let t0 = Instant::now();
        let mut manager = connected_then_lost(t0);
        let (attempts, _) = drive(&mut manager, t0, 60);
        let expected: Vec<u64> = (1..=20).map(|n| n * 3).collect();
        assert_eq!(attempts, expected);
        assert_eq!(manager.phase(), ReconnectPhase::Cooldown);
    }

    #[test]
    fn test_attempts_are_counted_per_phase() {
        let t0 = Instant::now();
        let mut manager = connected_then_lost(t0);
        drive(&mut manager, t0, 57);
        assert_eq!(manager.phase(), ReconnectPhase::ActiveRetry);
        assert_eq!(manager.state().attempts_in_phase, 19);
        assert_eq!(manager.state().phase_started_at, t0);

        // the 20th attempt closes the active phase
        assert_eq!(manager.on_tick(t0 + secs(60)), Some(ReconnectAction::Attempt));
        let state = manager.state();
        assert_eq!(state.phase, ReconnectPhase::Cooldown);
        assert_eq!(state.total_attempts, 20);
        assert_eq!(state.attempts_in_phase, 0);
        assert_eq!(state.phase_started_at, t0 + secs(60));
        manager.on_lost(t0 + secs(60));

        assert_eq!(manager.on_tick(t0 + secs(119)), None);
        assert_eq!(manager.on_tick(t0 + secs(120)), Some(ReconnectAction::Attempt));
        let state = manager.state();
        assert_eq!(state.attempts_in_phase, 1);
        assert_eq!(state.total_attempts, 21);
        assert_eq!(state.total_elapsed(t0 + secs(120)), secs(120));
    }

    #[test]
    fn test_cooldown_cadence_and_exhaustion_at_budget() {
        let t0 = Instant::now();
        let mut manager = connected_then_lost(t0);
        let (attempts, exhausted) = drive(&mut manager, t0, 2000);

        let cooldown: Vec<u64> = attempts.iter().copied().filter(|s| *s > 60).collect();
        assert_eq!(cooldown.first(), Some(&120));
        assert_eq!(cooldown.last(), Some(&1740));
        assert!(cooldown.windows(2).all(|w| w[1] - w[0] == 60));
        assert_eq!(exhausted, Some(1800));
        assert_eq!(manager.phase(), ReconnectPhase::Exhausted);
        assert_eq!(manager.next_deadline(), None);
    }

    #[test]
    fn test_exhaustion_is_terminal_until_reset() {
        let t0 = Instant::now();
        let mut manager = connected_then_lost(t0);
        drive(&mut manager, t0, 1800);
        assert_eq!(manager.on_tick(t0 + secs(5000)), None);
        manager.on_lost(t0 + secs(5000));
        assert_eq!(manager.phase(), ReconnectPhase::Exhausted);

        let now = t0 + secs(6000);
        assert_eq!(manager.reset(now), ReconnectAction::Attempt);
        assert_eq!(manager.phase(), ReconnectPhase::ActiveRetry);
        assert_eq!(manager.state().lost_at, Some(now));
        assert_eq!(manager.state().attempts_in_phase, 1);
        assert_eq!(manager.state().total_elapsed(now), Duration::ZERO);
        assert_eq!(manager.next_deadline(), Some(now + secs(3)));
    }

    #[test]
    fn test_success_resets_elapsed() {
        let t0 = Instant::now();
        let mut manager = connected_then_lost(t0);
        drive(&mut manager, t0, 300);
        assert_eq!(manager.phase(), ReconnectPhase::Cooldown);

        let t1 = t0 + secs(301);
        manager.on_connected(t1);
        assert_eq!(manager.state().attempts_in_phase, 0);
        assert_eq!(manager.state().total_elapsed(t1 + secs(4)), Duration::ZERO);
        manager.on_lost(t1 + secs(5));
        assert_eq!(manager.phase(), ReconnectPhase::ActiveRetry);
        assert_eq!(manager.state().lost_at, Some(t1 + secs(5)));
        assert_eq!(manager.next_deadline(), Some(t1 + secs(8)));
    }

    #[test]
    fn test_silent_connection_is_dropped() {
        let t0 = Instant::now();
        let mut manager = ReconnectManager::new(ReconnectSettings::default(), t0);
        manager.on_connected(t0);
        manager.on_event(t0 + secs(10));
        assert_eq!(manager.next_deadline(), Some(t0 + secs(40)));
        assert_eq!(manager.on_tick(t0 + secs(39)), None);

        let action = manager.on_tick(t0 + secs(40));
        assert_eq!(action, Some(ReconnectAction::DropSilent { idle: secs(30) }));
        assert_eq!(manager.phase(), ReconnectPhase::ActiveRetry);
        assert_eq!(manager.next_deadline(), Some(t0 + secs(43)));
    }

    #[test]
    fn test_idle_detection_disabled() {
        let t0 = Instant::now();
        let settings = ReconnectSettings {
            force_reconn_idle_sec: 0,
            ..ReconnectSettings::default()
        };
        let mut manager = ReconnectManager::new(settings, t0);
        manager.on_connected(t0);
        assert_eq!(manager.next_deadline(), None);
        assert_eq!(manager.on_tick(t0 + secs(86_400)), None);
    }

    #[test]
    fn test_zero_budget_exhausts_on_first_deadline() {
        let t0 = Instant::now();
        let settings = ReconnectSettings {
            retry_max_total_seconds: 0,
            ..ReconnectSettings::default()
        };
        let mut manager = ReconnectManager::new(settings, t0);
        manager.on_connected(t0);
        manager.on_lost(t0);
        let (attempts, exhausted) = drive(&mut manager, t0, 10);
        assert!(attempts.is_empty());
        assert_eq!(exhausted, Some(0));
    }
}
