//! Idle/service cycling.
//!
//! While the active service sits paused, stopped or idle, a higher-priority
//! service may have come back. After a state-specific wait the cycler asks
//! for one probe of the nearest service ahead of the active one.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::CyclingSettings;
use crate::model::{PlaybackState, ServiceKind};
use crate::priority::PriorityOrder;

/// A probe requested by the cycler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleProbe {
    /// Active service whose playback state armed the timer.
    pub from: ServiceKind,
    pub target: ServiceKind,
}

#[derive(Debug)]
pub struct ServiceCycler {
    settings: CyclingSettings,
    current: Option<ServiceKind>,
    state: Option<PlaybackState>,
    deadline: Option<Instant>,
    last_cycle_at: HashMap<ServiceKind, Instant>,
}

impl ServiceCycler {
    pub fn new(settings: CyclingSettings) -> Self {
        Self {
            settings,
            current: None,
            state: None,
            deadline: None,
            last_cycle_at: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Wait before cycling away from `state`; `None` never cycles.
    pub fn wait_for(&self, state: PlaybackState) -> Option<Duration> {
        let secs = match state {
            PlaybackState::Playing => 0,
            PlaybackState::Paused => self.settings.paused_wait_sec,
            PlaybackState::Stopped => self.settings.stopped_wait_sec,
            PlaybackState::Idle => self.settings.idle_wait_sec,
        };
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// A new active service starts with a disarmed timer.
    pub fn on_switch(&mut self, current: Option<ServiceKind>) {
        self.current = current;
        self.state = None;
        self.deadline = None;
    }

    /// Playback state reported by the active service. Only a change of state
    /// re-arms the timer.
    pub fn on_playback_state(&mut self, state: PlaybackState, now: Instant) {
        if self.state == Some(state) {
            return;
        }
        self.state = Some(state);
        self.deadline = self.wait_for(state).map(|wait| now + wait);
        if let Some(deadline) = self.deadline {
            debug!(
                service = ?self.current,
                state = state.as_str(),
                wait_sec = (deadline - now).as_secs(),
                "Cycling timer armed"
            );
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if self.settings.enabled && self.current.is_some() {
            self.deadline
        } else {
            None
        }
    }

    /// Fires the timer if due. The probe target is the nearest service ahead
    /// of the active one that `probeable` accepts; with none, the timer is
    /// spent without counting as a cycle.
    pub fn on_tick(
        &mut self,
        now: Instant,
        order: &PriorityOrder,
        probeable: impl Fn(ServiceKind) -> bool,
    ) -> Option<CycleProbe> {
        let deadline = self.next_deadline()?;
        if now < deadline {
            return None;
        }
        self.deadline = None;
        let current = self.current?;

        let reset = Duration::from_secs(self.settings.reset_sec);
        if let Some(last) = self.last_cycle_at.get(&current) {
            let allowed_at = *last + reset;
            if now < allowed_at {
                debug!(service = %current, "Cycling deferred by reset window");
                self.deadline = Some(allowed_at);
                return None;
            }
        }

        let Some(target) = order.ahead_of(current).find(|kind| probeable(*kind)) else {
            debug!(service = %current, "Nothing ahead can be probed, cycling skipped");
            return None;
        };
        self.last_cycle_at.insert(current, now);
        debug!(from = %current, to = %target, "Cycling to higher-priority service");
        Some(CycleProbe {
            from: current,
            target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::model::ServiceLinks;

    use ServiceKind::{CloudPoll, DirectPoll, LocalDevicePoll};

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn run(cycler: &mut ServiceCycler, from: Instant, to_sec: u64) -> Vec<(u64, CycleProbe)> {
        let order = PriorityOrder::default();
        let links = ServiceLinks::default();
        (0..=to_sec * 10)
            .filter_map(|tenth| {
                let now = from + Duration::from_millis(tenth * 100);
                cycler
                    .on_tick(now, &order, |kind| links.satisfies(kind))
                    .map(|probe| (tenth, probe))
            })
            .collect()
    }

    #[test]
    fn test_idle_probes_exactly_once_after_wait() {
        let mut cycler = ServiceCycler::new(CyclingSettings::default());
        let t0 = Instant::now();
        cycler.on_switch(Some(CloudPoll));
        cycler.on_playback_state(PlaybackState::Idle, t0);
        assert_eq!(cycler.next_deadline(), Some(t0 + secs(3)));

        let fired = run(&mut cycler, t0, 20);
        assert_eq!(
            fired,
            vec![(
                30,
                CycleProbe {
                    from: CloudPoll,
                    target: DirectPoll
                }
            )]
        );
    }

    #[test]
    fn test_paused_with_zero_wait_never_probes() {
        let mut cycler = ServiceCycler::new(CyclingSettings::default());
        let t0 = Instant::now();
        cycler.on_switch(Some(CloudPoll));
        cycler.on_playback_state(PlaybackState::Paused, t0);
        assert_eq!(cycler.next_deadline(), None);
        assert!(run(&mut cycler, t0, 600).is_empty());
    }

    #[test]
    fn test_playing_disarms_the_timer() {
        let mut cycler = ServiceCycler::new(CyclingSettings::default());
        let t0 = Instant::now();
        cycler.on_switch(Some(DirectPoll));
        cycler.on_playback_state(PlaybackState::Stopped, t0);
        cycler.on_playback_state(PlaybackState::Playing, t0 + secs(10));
        assert!(run(&mut cycler, t0, 60).is_empty());
    }

    #[test]
    fn test_repeated_state_does_not_rearm() {
        let mut cycler = ServiceCycler::new(CyclingSettings::default());
        let t0 = Instant::now();
        cycler.on_switch(Some(DirectPoll));
        cycler.on_playback_state(PlaybackState::Idle, t0);
        cycler.on_playback_state(PlaybackState::Idle, t0 + secs(2));
        assert_eq!(cycler.next_deadline(), Some(t0 + secs(3)));
    }

    #[test]
    fn test_disabled_cycling() {
        let mut cycler = ServiceCycler::new(CyclingSettings {
            enabled: false,
            ..CyclingSettings::default()
        });
        let t0 = Instant::now();
        cycler.on_switch(Some(CloudPoll));
        cycler.on_playback_state(PlaybackState::Idle, t0);
        assert_eq!(cycler.next_deadline(), None);
        assert!(run(&mut cycler, t0, 60).is_empty());
    }

    #[test]
    fn test_top_priority_service_has_nothing_to_cycle_to() {
        let mut cycler = ServiceCycler::new(CyclingSettings::default());
        let t0 = Instant::now();
        cycler.on_switch(Some(LocalDevicePoll));
        cycler.on_playback_state(PlaybackState::Idle, t0);
        assert!(run(&mut cycler, t0, 10).is_empty());
    }

    #[test]
    fn test_unlinked_services_are_skipped() {
        let mut cycler = ServiceCycler::new(CyclingSettings::default());
        let t0 = Instant::now();
        cycler.on_switch(Some(CloudPoll));
        cycler.on_playback_state(PlaybackState::Idle, t0);
        let links = ServiceLinks {
            provider_linked: false,
            device_linked: true,
        };
        let probe = cycler.on_tick(t0 + secs(3), &PriorityOrder::default(), |kind| {
            links.satisfies(kind)
        });
        assert_eq!(probe.map(|p| p.target), Some(LocalDevicePoll));
    }

    #[test]
    fn test_reset_window_defers_the_next_cycle() {
        let mut cycler = ServiceCycler::new(CyclingSettings::default());
        let order = PriorityOrder::default();
        let any = |_: ServiceKind| true;
        let t0 = Instant::now();
        cycler.on_switch(Some(CloudPoll));
        cycler.on_playback_state(PlaybackState::Idle, t0);
        assert!(cycler.on_tick(t0 + secs(3), &order, any).is_some());

        // playback resumes, then goes idle again shortly after
        cycler.on_playback_state(PlaybackState::Playing, t0 + secs(4));
        cycler.on_playback_state(PlaybackState::Idle, t0 + secs(5));
        assert!(cycler.on_tick(t0 + secs(8), &order, any).is_none());
        assert_eq!(cycler.next_deadline(), Some(t0 + secs(33)));
        assert!(cycler.on_tick(t0 + secs(32), &order, any).is_none());
        assert!(cycler.on_tick(t0 + secs(33), &order, any).is_some());
    }

    #[test]
    fn test_switch_resets_the_timer() {
        let mut cycler = ServiceCycler::new(CyclingSettings::default());
        let t0 = Instant::now();
        cycler.on_switch(Some(CloudPoll));
        cycler.on_playback_state(PlaybackState::Idle, t0);
        cycler.on_switch(Some(DirectPoll));
        assert_eq!(cycler.next_deadline(), None);
    }

    #[test]
    fn test_services_that_cannot_be_probed_are_passed_over() {
        let mut cycler = ServiceCycler::new(CyclingSettings::default());
        let order = PriorityOrder::default();
        let t0 = Instant::now();
        cycler.on_switch(Some(CloudPoll));
        cycler.on_playback_state(PlaybackState::Idle, t0);

        // direct_poll is cooling down: the next one ahead is tried instead
        let probe = cycler.on_tick(t0 + secs(3), &order, |kind| kind != DirectPoll);
        assert_eq!(probe.map(|p| p.target), Some(LocalDevicePoll));
    }

    #[test]
    fn test_no_target_does_not_start_the_reset_window() {
        let mut cycler = ServiceCycler::new(CyclingSettings::default());
        let order = PriorityOrder::default();
        let t0 = Instant::now();
        cycler.on_switch(Some(CloudPoll));
        cycler.on_playback_state(PlaybackState::Idle, t0);
        assert_eq!(cycler.on_tick(t0 + secs(3), &order, |_| false), None);
        assert_eq!(cycler.next_deadline(), None);

        // the next idle period cycles right away, no reset window pending
        cycler.on_playback_state(PlaybackState::Playing, t0 + secs(4));
        cycler.on_playback_state(PlaybackState::Idle, t0 + secs(5));
        let probe = cycler.on_tick(t0 + secs(8), &order, |_| true);
        assert_eq!(probe.map(|p| p.target), Some(DirectPoll));
    }
}
