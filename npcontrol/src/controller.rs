//! The source controller actor.
//!
//! Single owner of the fallback controller, the selector and the cycler.
//! Adapters post outcomes through their [`OutcomeSink`]; the actor applies
//! them, re-evaluates the selection and publishes the snapshot. All timers
//! are derived from the state machines' next deadlines.
//!
//! The live connection worker reports connectivity here: losses count as
//! errors of the running service when it depends on the connection, an
//! exhausted retry budget rules those services out, and a reconnect restarts
//! the running one.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterOutcome, OutcomeSink, ServiceAdapter};
use crate::config::ControllerSettings;
use crate::cycler::ServiceCycler;
use crate::errors::FetchError;
use crate::events::StatusEvent;
use crate::fallback::{FallbackAction, FallbackController, ProbeReason};
use crate::live::LiveStatus;
use crate::model::{NowPlayingData, NowPlayingSnapshot, ServiceKind};
use crate::selector::{SourceSelector, SwitchEvent};

#[derive(Debug)]
pub(crate) enum ControllerMessage {
    Outcome {
        kind: ServiceKind,
        outcome: AdapterOutcome,
        at: Instant,
    },
    Live(LiveStatus),
    Refresh,
}

#[derive(Debug, Clone)]
struct LatestData {
    data: NowPlayingData,
    fetched_at: DateTime<Utc>,
}

pub(crate) struct SourceController {
    settings: ControllerSettings,
    fallback: FallbackController,
    selector: SourceSelector,
    cycler: ServiceCycler,
    adapters: HashMap<ServiceKind, Arc<dyn ServiceAdapter>>,
    latest: HashMap<ServiceKind, LatestData>,
    /// Token of the running adapter, child of `token`.
    running: Option<(ServiceKind, CancellationToken)>,
    /// The live connection dropped and has not come back yet.
    live_down: bool,
    tx: mpsc::UnboundedSender<ControllerMessage>,
    rx: mpsc::UnboundedReceiver<ControllerMessage>,
    snapshots: watch::Sender<NowPlayingSnapshot>,
    status: broadcast::Sender<StatusEvent>,
    token: CancellationToken,
}

impl SourceController {
    pub(crate) fn new(
        settings: ControllerSettings,
        adapters: HashMap<ServiceKind, Arc<dyn ServiceAdapter>>,
        channel: (
            mpsc::UnboundedSender<ControllerMessage>,
            mpsc::UnboundedReceiver<ControllerMessage>,
        ),
        snapshots: watch::Sender<NowPlayingSnapshot>,
        status: broadcast::Sender<StatusEvent>,
        token: CancellationToken,
    ) -> Self {
        let selector = SourceSelector::new(
            *settings.priority(),
            settings.links,
            settings.transition_grace(),
        )
        .with_available(adapters.keys().copied());
        let (tx, rx) = channel;

        Self {
            fallback: FallbackController::from_settings(&settings),
            cycler: ServiceCycler::new(settings.cycling.clone()),
            selector,
            settings,
            adapters,
            latest: HashMap::new(),
            running: None,
            live_down: false,
            tx,
            rx,
            snapshots,
            status,
            token,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            priority = %self.settings.priority(),
            services = self.adapters.len(),
            "Now-playing controller started"
        );

        let mut ticker = tokio::time::interval(self.settings.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.evaluate(Instant::now()).await;

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                _ = self.token.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => break,
                },
                _ = sleep_until_deadline(deadline) => self.on_tick(Instant::now()).await,
                _ = ticker.tick() => self.on_tick(Instant::now()).await,
            }
        }

        if let Some((kind, token)) = self.running.take() {
            token.cancel();
            if let Some(adapter) = self.adapters.get(&kind) {
                adapter.stop().await;
            }
        }
        info!("Now-playing controller stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.fallback.next_deadline(),
            self.selector.next_deadline(),
            self.cycler.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::Outcome { kind, outcome, at } => {
                self.on_outcome(kind, outcome, at).await;
            }
            ControllerMessage::Live(status) => self.on_live(status, Instant::now()).await,
            ControllerMessage::Refresh => self.on_refresh(Instant::now()),
        }
    }

    async fn on_outcome(&mut self, kind: ServiceKind, outcome: AdapterOutcome, at: Instant) {
        let actions = match outcome {
            AdapterOutcome::Success(data) => {
                self.store(kind, data, at);
                self.fallback.on_success(kind, at)
            }
            AdapterOutcome::PlaybackState(state) => {
                let data = match self.latest.get(&kind) {
                    Some(latest) => NowPlayingData::new(state, latest.data.track.clone()),
                    None => NowPlayingData::new(state, None),
                };
                self.store(kind, data, at);
                self.fallback.on_success(kind, at)
            }
            AdapterOutcome::Error(FetchError::Auth(message)) => {
                warn!(service = %kind, "Authentication refused: {message}");
                self.publish(StatusEvent::AuthRequired {
                    service: kind,
                    message,
                    timestamp: Utc::now(),
                });
                Vec::new()
            }
            AdapterOutcome::Error(FetchError::Transient(message)) => {
                self.record_error(kind, message, at)
            }
        };

        self.apply(actions);
        self.evaluate(at).await;
        self.publish_snapshot();
    }

    fn record_error(
        &mut self,
        kind: ServiceKind,
        message: String,
        at: Instant,
    ) -> Vec<FallbackAction> {
        let actions = self.fallback.on_error(kind, at);
        let consecutive_errors = self.fallback.state(kind).consecutive_errors;
        debug!(service = %kind, consecutive_errors, "Fetch failed: {message}");
        self.publish(StatusEvent::FetchFailed {
            service: kind,
            consecutive_errors,
            message,
            timestamp: Utc::now(),
        });
        actions
    }

    fn running_live_service(&self) -> Option<ServiceKind> {
        self.running
            .as_ref()
            .map(|(kind, _)| *kind)
            .filter(|kind| kind.capabilities().uses_live_connection)
    }

    async fn on_live(&mut self, status: LiveStatus, now: Instant) {
        match status {
            LiveStatus::Connected => {
                self.selector.set_live_available(true);
                if std::mem::replace(&mut self.live_down, false) {
                    self.restart_running(now).await;
                }
            }
            LiveStatus::Lost(message) => {
                self.live_down = true;
                if let Some(kind) = self.running_live_service() {
                    let message = format!("live connection: {message}");
                    let actions = self.record_error(kind, message, now);
                    self.apply(actions);
                }
            }
            LiveStatus::Exhausted => {
                self.live_down = true;
                self.selector.set_live_available(false);
            }
        }

        self.evaluate(now).await;
        self.publish_snapshot();
    }

    /// Restarts the running adapter if it depends on the live connection, so
    /// that its subscription binds to the new connection.
    async fn restart_running(&mut self, now: Instant) {
        let Some(kind) = self.running_live_service() else {
            return;
        };
        let Some(adapter) = self.adapters.get(&kind).cloned() else {
            return;
        };
        info!(service = %kind, "Live connection back, restarting adapter");
        if let Some((_, token)) = self.running.take() {
            token.cancel();
        }
        adapter.stop().await;

        let token = self.token.child_token();
        self.fallback.mark_running(kind, now);
        adapter
            .start(OutcomeSink::new(kind, self.tx.clone()), token.clone())
            .await;
        self.running = Some((kind, token));
    }

    fn store(&mut self, kind: ServiceKind, data: NowPlayingData, at: Instant) {
        if self.selector.current() == Some(kind) {
            self.cycler.on_playback_state(data.state, at);
        }
        self.latest.insert(
            kind,
            LatestData {
                data,
                fetched_at: Utc::now(),
            },
        );
    }

    async fn on_tick(&mut self, now: Instant) {
        let actions = self.fallback.on_tick(now);
        self.apply(actions);

        let selector = &self.selector;
        let fallback = &self.fallback;
        let cycle = self.cycler.on_tick(now, selector.order(), |kind| {
            selector.is_eligible(kind) && fallback.can_probe(kind, now)
        });
        if let Some(cycle) = cycle {
            info!(from = %cycle.from, probe = %cycle.target, "Cycling probe");
            self.publish(StatusEvent::CyclingTriggered {
                from: cycle.from,
                probe: cycle.target,
                timestamp: Utc::now(),
            });
            let actions = self.fallback.force_probe(cycle.target, now);
            self.apply(actions.into_iter().collect());
        }

        self.evaluate(now).await;
    }

    /// Manual refresh: force-probes every eligible service ranked above the
    /// current one (all of them when nothing is active). Services still
    /// cooling down are left alone.
    fn on_refresh(&mut self, now: Instant) {
        let targets: Vec<ServiceKind> = match self.selector.current() {
            Some(current) => self.selector.order().ahead_of(current).collect(),
            None => self.selector.order().iter().collect(),
        };
        info!(?targets, "Manual refresh");
        let mut actions = Vec::with_capacity(targets.len());
        for kind in targets {
            if self.selector.is_eligible(kind) {
                actions.extend(self.fallback.force_probe(kind, now));
            }
        }
        self.apply(actions);
    }

    fn apply(&mut self, actions: Vec<FallbackAction>) {
        for action in actions {
            match action {
                FallbackAction::Transition {
                    kind,
                    from,
                    to,
                    reason,
                } => self.publish(StatusEvent::LifecycleChanged {
                    service: kind,
                    from,
                    to,
                    reason,
                    timestamp: Utc::now(),
                }),
                FallbackAction::Probe { kind, reason } => self.spawn_probe(kind, reason),
            }
        }
    }

    fn spawn_probe(&self, kind: ServiceKind, reason: ProbeReason) {
        let Some(adapter) = self.adapters.get(&kind).cloned() else {
            return;
        };
        if !self.selector.is_eligible(kind) {
            debug!(service = %kind, "Probe skipped, service not linked");
            return;
        }

        debug!(service = %kind, ?reason, "Probing service");
        self.publish(StatusEvent::ProbeIssued {
            service: kind,
            reason,
            timestamp: Utc::now(),
        });
        let sink = OutcomeSink::new(kind, self.tx.clone());
        let token = self.token.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = adapter.probe(sink) => {}
            }
        });
    }

    async fn evaluate(&mut self, now: Instant) {
        let current_has_data = self
            .selector
            .current()
            .is_some_and(|kind| self.latest.contains_key(&kind));
        if let Some(switch) = self
            .selector
            .evaluate(self.fallback.tracker(), current_has_data, now)
        {
            self.switch(switch, now).await;
        }
    }

    async fn switch(&mut self, switch: SwitchEvent, now: Instant) {
        if let Some((kind, token)) = self.running.take() {
            token.cancel();
            self.fallback.mark_stopped(kind);
            if let Some(adapter) = self.adapters.get(&kind) {
                adapter.stop().await;
            }
            self.latest.remove(&kind);
        }

        self.cycler.on_switch(switch.current);
        if let Some(kind) = switch.current {
            if let Some(adapter) = self.adapters.get(&kind) {
                let token = self.token.child_token();
                self.fallback.mark_running(kind, now);
                adapter
                    .start(OutcomeSink::new(kind, self.tx.clone()), token.clone())
                    .await;
                self.running = Some((kind, token));
            }
            if let Some(latest) = self.latest.get(&kind) {
                self.cycler.on_playback_state(latest.data.state, now);
            }
        } else {
            warn!("No now-playing service available");
        }

        self.publish(StatusEvent::ServiceSwitched {
            previous: switch.previous,
            current: switch.current,
            timestamp: Utc::now(),
        });
        self.publish_snapshot();
    }

    fn snapshot(&self) -> NowPlayingSnapshot {
        let Some(kind) = self.selector.current() else {
            return NowPlayingSnapshot::empty();
        };
        match self.latest.get(&kind) {
            Some(latest) => NowPlayingSnapshot {
                active_service: Some(kind),
                state: Some(latest.data.state),
                track: latest.data.track.clone(),
                fetched_at: Some(latest.fetched_at),
            },
            None => NowPlayingSnapshot {
                active_service: Some(kind),
                ..NowPlayingSnapshot::empty()
            },
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = self.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn publish(&self, event: StatusEvent) {
        // no subscriber is fine
        let _ = self.status.send(event);
    }
}

/// Sleeps until `deadline`, forever without one.
pub(crate) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
