//! Live event connection and its reconnect worker.
//!
//! The worker owns the [`ReconnectManager`]. Each connection attempt gets a
//! generation number so that late messages from a dropped connection are
//! ignored. Connectivity changes are forwarded to the source controller,
//! which owns the services carried by this connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReconnectSettings;
use crate::controller::{ControllerMessage, sleep_until_deadline};
use crate::errors::ControlError;
use crate::events::StatusEvent;
use crate::reconnect::{ReconnectAction, ReconnectManager, ReconnectPhase};

/// The backend's push channel (a websocket in production).
#[async_trait]
pub trait LiveConnection: Send + Sync + 'static {
    /// Opens the connection. On success the implementation keeps reporting
    /// traffic and the eventual loss through `sink` until `token` is
    /// cancelled.
    ///
    /// Implementations that spawn readers should call
    /// [`LiveSink::connected`] before doing so. Returning `Ok` marks the
    /// connection open otherwise, unless `sink` already reported a loss.
    async fn connect(&self, sink: LiveSink, token: CancellationToken) -> Result<(), ControlError>;
}

/// Connectivity as seen by the source controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LiveStatus {
    Connected,
    /// Connection dropped, went silent, or an attempt failed.
    Lost(String),
    /// The retry budget is spent; no attempt until a reset.
    Exhausted,
}

#[derive(Debug)]
pub(crate) enum LiveMessage {
    Connected { generation: u64 },
    Event { generation: u64 },
    Lost { generation: u64, error: ControlError },
    Reset,
}

const SINK_PENDING: u8 = 0;
const SINK_OPEN: u8 = 1;
const SINK_CLOSED: u8 = 2;

/// Reports traffic of one connection attempt to the worker.
#[derive(Clone, Debug)]
pub struct LiveSink {
    generation: u64,
    /// Shared by the clones of one attempt.
    state: Arc<AtomicU8>,
    tx: mpsc::UnboundedSender<LiveMessage>,
}

impl LiveSink {
    fn new(generation: u64, tx: mpsc::UnboundedSender<LiveMessage>) -> Self {
        Self {
            generation,
            state: Arc::new(AtomicU8::new(SINK_PENDING)),
            tx,
        }
    }

    /// Any frame received, heartbeats included.
    pub fn event(&self) -> bool {
        self.tx
            .send(LiveMessage::Event {
                generation: self.generation,
            })
            .is_ok()
    }

    pub fn lost(&self, error: ControlError) -> bool {
        self.state.store(SINK_CLOSED, Ordering::SeqCst);
        self.tx
            .send(LiveMessage::Lost {
                generation: self.generation,
                error,
            })
            .is_ok()
    }

    /// The handshake completed. Only the first call counts, and none after
    /// a loss.
    pub fn connected(&self) -> bool {
        if self
            .state
            .compare_exchange(SINK_PENDING, SINK_OPEN, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.tx
            .send(LiveMessage::Connected {
                generation: self.generation,
            })
            .is_ok()
    }
}

pub(crate) struct ReconnectWorker {
    manager: ReconnectManager,
    connection: Arc<dyn LiveConnection>,
    generation: u64,
    /// Token of the current attempt or open connection.
    current: Option<CancellationToken>,
    tx: mpsc::UnboundedSender<LiveMessage>,
    rx: mpsc::UnboundedReceiver<LiveMessage>,
    controller: mpsc::UnboundedSender<ControllerMessage>,
    status: broadcast::Sender<StatusEvent>,
    token: CancellationToken,
}

impl ReconnectWorker {
    pub(crate) fn new(
        settings: ReconnectSettings,
        connection: Arc<dyn LiveConnection>,
        channel: (
            mpsc::UnboundedSender<LiveMessage>,
            mpsc::UnboundedReceiver<LiveMessage>,
        ),
        controller: mpsc::UnboundedSender<ControllerMessage>,
        status: broadcast::Sender<StatusEvent>,
        token: CancellationToken,
    ) -> Self {
        let (tx, rx) = channel;
        Self {
            manager: ReconnectManager::new(settings, Instant::now()),
            connection,
            generation: 0,
            current: None,
            tx,
            rx,
            controller,
            status,
            token,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("Live connection worker started");
        loop {
            let deadline = self.manager.next_deadline();
            tokio::select! {
                _ = self.token.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => break,
                },
                _ = sleep_until_deadline(deadline) => {
                    if let Some(action) = self.manager.on_tick(Instant::now()) {
                        self.apply(action);
                    }
                }
            }
        }
        self.drop_current();
        info!("Live connection worker stopped");
    }

    fn handle_message(&mut self, message: LiveMessage) {
        let now = Instant::now();
        match message {
            LiveMessage::Reset => {
                let action = self.manager.reset(now);
                self.apply(action);
            }
            LiveMessage::Connected { generation } if generation == self.generation => {
                self.manager.on_connected(now);
                self.publish_phase();
                self.notify(LiveStatus::Connected);
            }
            LiveMessage::Event { generation } if generation == self.generation => {
                self.manager.on_event(now);
            }
            LiveMessage::Lost { generation, error } if generation == self.generation => {
                debug!("Live connection: {error}");
                let was_connected = self.manager.phase() == ReconnectPhase::Connected;
                self.manager.on_lost(now);
                if was_connected {
                    self.current = None;
                    self.publish_phase();
                }
                if self.manager.phase() != ReconnectPhase::Exhausted {
                    self.notify(LiveStatus::Lost(error.to_string()));
                }
            }
            stale => debug!(?stale, "Ignoring message from a previous connection"),
        }
    }

    fn apply(&mut self, action: ReconnectAction) {
        match action {
            ReconnectAction::Attempt => {
                self.attempt();
                self.publish_phase();
            }
            ReconnectAction::DropSilent { idle } => {
                self.drop_current();
                let _ = self.status.send(StatusEvent::ConnectionSilent {
                    idle_sec: idle.as_secs(),
                    timestamp: Utc::now(),
                });
                self.publish_phase();
                self.notify(LiveStatus::Lost(format!(
                    "silent for {}s",
                    idle.as_secs()
                )));
            }
            ReconnectAction::Exhausted { elapsed } => {
                self.drop_current();
                let err = ControlError::RetryBudgetExhausted(elapsed.as_secs());
                warn!("{err}");
                let _ = self.status.send(StatusEvent::RetryBudgetExhausted {
                    elapsed_sec: elapsed.as_secs(),
                    timestamp: Utc::now(),
                });
                self.publish_phase();
                self.notify(LiveStatus::Exhausted);
            }
        }
    }

    fn attempt(&mut self) {
        self.drop_current();
        let token = self.token.child_token();
        self.current = Some(token.clone());

        let sink = LiveSink::new(self.generation, self.tx.clone());
        let connection = Arc::clone(&self.connection);
        debug!(generation = self.generation, "Connecting live channel");
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = connection.connect(sink.clone(), token.clone()) => result,
            };
            match result {
                Ok(()) => sink.connected(),
                Err(err) => sink.lost(err),
            };
        });
    }

    fn drop_current(&mut self) {
        if let Some(token) = self.current.take() {
            token.cancel();
        }
        // anything still in flight is now stale
        self.generation += 1;
    }

    fn notify(&self, status: LiveStatus) {
        // the controller may already be gone during teardown
        let _ = self.controller.send(ControllerMessage::Live(status));
    }

    fn publish_phase(&self) {
        let state = self.manager.state();
        let _ = self.status.send(StatusEvent::Connectivity {
            phase: state.phase,
            attempts_in_phase: state.attempts_in_phase,
            total_elapsed_sec: state.total_elapsed(Instant::now()).as_secs(),
            timestamp: Utc::now(),
        });
    }
}
