//! Picks the single authoritative service.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::health::{HealthTracker, Lifecycle};
use crate::model::{ServiceKind, ServiceLinks};
use crate::priority::PriorityOrder;

/// First Active service in priority order whose links are satisfied.
pub fn select(
    order: &PriorityOrder,
    tracker: &HealthTracker,
    links: &ServiceLinks,
) -> Option<ServiceKind> {
    order
        .iter()
        .find(|kind| tracker.lifecycle(*kind) == Lifecycle::Active && links.satisfies(*kind))
}

/// A committed change of the active service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwitchEvent {
    pub previous: Option<ServiceKind>,
    pub current: Option<ServiceKind>,
}

#[derive(Clone, Copy, Debug)]
struct PendingSwitch {
    candidate: Option<ServiceKind>,
    since: Instant,
}

/// Owns the current active service and debounces changes of it.
#[derive(Debug)]
pub struct SourceSelector {
    order: PriorityOrder,
    links: ServiceLinks,
    available: HashSet<ServiceKind>,
    /// Cleared once the live connection has given up reconnecting.
    live_available: bool,
    grace: Duration,
    current: Option<ServiceKind>,
    pending: Option<PendingSwitch>,
}

impl SourceSelector {
    pub fn new(order: PriorityOrder, links: ServiceLinks, grace: Duration) -> Self {
        Self {
            order,
            links,
            available: ServiceKind::ALL.into_iter().collect(),
            live_available: true,
            grace,
            current: None,
            pending: None,
        }
    }

    /// Restricts selection to the kinds that have an adapter.
    pub fn with_available<I: IntoIterator<Item = ServiceKind>>(mut self, kinds: I) -> Self {
        self.available = kinds.into_iter().collect();
        self
    }

    pub fn current(&self) -> Option<ServiceKind> {
        self.current
    }

    pub fn order(&self) -> &PriorityOrder {
        &self.order
    }

    pub fn links(&self) -> &ServiceLinks {
        &self.links
    }

    pub fn set_live_available(&mut self, available: bool) {
        if self.live_available != available {
            info!(available, "Live connection availability changed");
            self.live_available = available;
        }
    }

    pub fn is_live_available(&self) -> bool {
        self.live_available
    }

    /// Has an adapter, its links are satisfied, and the live connection is
    /// usable if the kind depends on it.
    pub fn is_eligible(&self, kind: ServiceKind) -> bool {
        self.available.contains(&kind)
            && self.links.satisfies(kind)
            && (self.live_available || !kind.capabilities().uses_live_connection)
    }

    pub fn candidate(&self, tracker: &HealthTracker) -> Option<ServiceKind> {
        self.order
            .iter()
            .find(|kind| tracker.lifecycle(*kind) == Lifecycle::Active && self.is_eligible(*kind))
    }

    /// Re-evaluates the selection.
    ///
    /// `current_has_data` tells whether the current service ever produced
    /// data since it became active; without data the switch is immediate.
    pub fn evaluate(
        &mut self,
        tracker: &HealthTracker,
        current_has_data: bool,
        now: Instant,
    ) -> Option<SwitchEvent> {
        let candidate = self.candidate(tracker);
        if candidate == self.current {
            if self.pending.take().is_some() {
                debug!(current = ?self.current, "Pending switch abandoned");
            }
            return None;
        }

        if self.current.is_none() || !current_has_data || self.grace.is_zero() {
            return Some(self.commit(candidate));
        }

        match self.pending {
            Some(pending) if pending.candidate == candidate => {
                if now >= pending.since + self.grace {
                    Some(self.commit(candidate))
                } else {
                    None
                }
            }
            _ => {
                debug!(
                    current = ?self.current,
                    ?candidate,
                    grace_sec = self.grace.as_secs(),
                    "Switch pending"
                );
                self.pending = Some(PendingSwitch {
                    candidate,
                    since: now,
                });
                None
            }
        }
    }

    /// When a pending switch would commit if the candidate stays put.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.map(|pending| pending.since + self.grace)
    }

    fn commit(&mut self, candidate: Option<ServiceKind>) -> SwitchEvent {
        let event = SwitchEvent {
            previous: self.current,
            current: candidate,
        };
        info!(previous = ?event.previous, current = ?event.current, "Active service switched");
        self.current = candidate;
        self.pending = None;
        event
    }
}
