//! Public entry point: wires adapters, the controller actor and the live
//! connection worker together under one teardown token.
//!
//! ```rust,ignore
//! let handle = NowPlayingService::new(settings)
//!     .with_adapter(PollingAdapter::new(ServiceKind::DirectPoll, fetcher, interval))
//!     .with_live_connection(socket)
//!     .spawn();
//!
//! let mut snapshots = handle.snapshots();
//! while snapshots.changed().await.is_ok() {
//!     render(&snapshots.borrow());
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapter::ServiceAdapter;
use crate::config::ControllerSettings;
use crate::controller::{ControllerMessage, SourceController};
use crate::errors::ControlError;
use crate::events::StatusEvent;
use crate::live::{LiveConnection, LiveMessage, ReconnectWorker};
use crate::model::{NowPlayingSnapshot, ServiceKind};

const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Builder of a running now-playing controller.
pub struct NowPlayingService {
    settings: ControllerSettings,
    adapters: HashMap<ServiceKind, Arc<dyn ServiceAdapter>>,
    live: Option<Arc<dyn LiveConnection>>,
    token: CancellationToken,
}

impl NowPlayingService {
    pub fn new(settings: ControllerSettings) -> Self {
        Self {
            settings,
            adapters: HashMap::new(),
            live: None,
            token: CancellationToken::new(),
        }
    }

    /// Registers the adapter of one service kind; a second adapter for the
    /// same kind replaces the first.
    pub fn with_adapter<A: ServiceAdapter>(self, adapter: A) -> Self {
        self.with_shared_adapter(Arc::new(adapter))
    }

    pub fn with_shared_adapter(mut self, adapter: Arc<dyn ServiceAdapter>) -> Self {
        let kind = adapter.kind();
        if self.adapters.insert(kind, adapter).is_some() {
            warn!(service = %kind, "Adapter replaced");
        }
        self
    }

    pub fn with_live_connection<C: LiveConnection>(mut self, connection: C) -> Self {
        self.live = Some(Arc::new(connection));
        self
    }

    /// Ties the service to an outer teardown token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Spawns the actors on the current tokio runtime.
    pub fn spawn(self) -> NowPlayingHandle {
        let (snapshot_tx, snapshot_rx) = watch::channel(NowPlayingSnapshot::empty());
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (controller_tx, controller_rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::with_capacity(2);
        let controller = SourceController::new(
            self.settings.clone(),
            self.adapters,
            (controller_tx.clone(), controller_rx),
            snapshot_tx,
            status_tx.clone(),
            self.token.clone(),
        );
        tasks.push(tokio::spawn(controller.run()));

        let live_tx = self.live.map(|connection| {
            let (live_tx, live_rx) = mpsc::unbounded_channel();
            let worker = ReconnectWorker::new(
                self.settings.reconnect.clone(),
                connection,
                (live_tx.clone(), live_rx),
                controller_tx.clone(),
                status_tx.clone(),
                self.token.clone(),
            );
            tasks.push(tokio::spawn(worker.run()));
            live_tx
        });

        NowPlayingHandle {
            controller_tx,
            live_tx,
            snapshots: snapshot_rx,
            status: status_tx,
            token: self.token,
            tasks,
        }
    }
}

/// Handle to a running controller. Dropping it does not stop the actors;
/// call [`NowPlayingHandle::shutdown`] or cancel the teardown token.
pub struct NowPlayingHandle {
    controller_tx: mpsc::UnboundedSender<ControllerMessage>,
    live_tx: Option<mpsc::UnboundedSender<LiveMessage>>,
    snapshots: watch::Receiver<NowPlayingSnapshot>,
    status: broadcast::Sender<StatusEvent>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl NowPlayingHandle {
    pub fn snapshots(&self) -> watch::Receiver<NowPlayingSnapshot> {
        self.snapshots.clone()
    }

    pub fn current(&self) -> NowPlayingSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Subscribes to the status feed; events sent before the call are not
    /// replayed.
    pub fn status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Resets the live connection backoff and probes every service ranked
    /// above the current one.
    pub fn refresh(&self) -> Result<(), ControlError> {
        if self.token.is_cancelled() {
            return Err(ControlError::ControllerClosed);
        }
        self.controller_tx
            .send(ControllerMessage::Refresh)
            .map_err(|_| ControlError::ControllerClosed)?;
        if let Some(live_tx) = &self.live_tx {
            live_tx
                .send(LiveMessage::Reset)
                .map_err(|_| ControlError::ControllerClosed)?;
        }
        Ok(())
    }

    /// Cancels every task and in-flight adapter operation, then waits for
    /// the actors to finish.
    pub async fn shutdown(self) {
        info!("Shutting down now-playing controller");
        self.token.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!("Now-playing task failed: {err}");
                }
            }
        }
    }
}
