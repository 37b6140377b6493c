//! Adapter contract between a now-playing source and the controller.
//!
//! Two ways of watching a source, like a renderer watcher:
//! - [`PollingAdapter`]: a [`NowPlayingFetcher`] called every poll interval.
//! - [`PushAdapter`]: a [`NowPlayingSubscriber`] pushing updates as they come.
//!
//! Both report through an [`OutcomeSink`] and never block the controller.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::controller::ControllerMessage;
use crate::errors::FetchError;
use crate::model::{NowPlayingData, PlaybackState, ServiceKind};

/// One observation reported by an adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterOutcome {
    Success(NowPlayingData),
    /// State-only update; the last known track is kept.
    PlaybackState(PlaybackState),
    Error(FetchError),
}

/// Cloneable handle posting outcomes of one service into the controller.
#[derive(Clone, Debug)]
pub struct OutcomeSink {
    kind: ServiceKind,
    tx: mpsc::UnboundedSender<ControllerMessage>,
}

impl OutcomeSink {
    pub(crate) fn new(kind: ServiceKind, tx: mpsc::UnboundedSender<ControllerMessage>) -> Self {
        Self { kind, tx }
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    /// Returns `false` once the controller is gone.
    pub fn report(&self, outcome: AdapterOutcome) -> bool {
        self.tx
            .send(ControllerMessage::Outcome {
                kind: self.kind,
                outcome,
                at: Instant::now(),
            })
            .is_ok()
    }

    pub fn success(&self, data: NowPlayingData) -> bool {
        self.report(AdapterOutcome::Success(data))
    }

    pub fn playback_state(&self, state: PlaybackState) -> bool {
        self.report(AdapterOutcome::PlaybackState(state))
    }

    pub fn error(&self, err: FetchError) -> bool {
        self.report(AdapterOutcome::Error(err))
    }

    pub fn report_result(&self, result: Result<NowPlayingData, FetchError>) -> bool {
        match result {
            Ok(data) => self.success(data),
            Err(err) => self.error(err),
        }
    }
}

/// A now-playing source as seen by the controller.
///
/// `start` and `probe` must return promptly: long-running work is spawned
/// and reported through the sink.
#[async_trait]
pub trait ServiceAdapter: Send + Sync + 'static {
    fn kind(&self) -> ServiceKind;

    /// Begins continuous watching until `stop` or until `token` is cancelled.
    async fn start(&self, sink: OutcomeSink, token: CancellationToken);

    async fn stop(&self);

    /// Single out-of-band check, reporting exactly one outcome.
    async fn probe(&self, sink: OutcomeSink);
}

/// Single fetch of the current playback.
#[async_trait]
pub trait NowPlayingFetcher: Send + Sync + 'static {
    async fn fetch(&self) -> Result<NowPlayingData, FetchError>;
}

/// Event subscription of a push-driven source.
#[async_trait]
pub trait NowPlayingSubscriber: Send + Sync + 'static {
    /// Streams updates into `sink` until `token` is cancelled. Returning
    /// early means the subscription ended.
    async fn subscribe(&self, sink: OutcomeSink, token: CancellationToken) -> Result<(), FetchError>;

    /// Current state, used for probes.
    async fn fetch(&self) -> Result<NowPlayingData, FetchError>;
}

/// Holds the token of the running watch task, if any.
#[derive(Debug, Default)]
struct RunningTask(Mutex<Option<CancellationToken>>);

impl RunningTask {
    fn lock(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cancels the previous task and records the new one.
    fn replace(&self, token: CancellationToken) {
        if let Some(previous) = self.lock().replace(token) {
            previous.cancel();
        }
    }

    fn cancel(&self) -> bool {
        match self.lock().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn is_running(&self) -> bool {
        self.lock().as_ref().is_some_and(|token| !token.is_cancelled())
    }
}

/// Polls a [`NowPlayingFetcher`] at a fixed interval.
pub struct PollingAdapter<F: NowPlayingFetcher> {
    kind: ServiceKind,
    fetcher: Arc<F>,
    interval: Duration,
    running: RunningTask,
}

impl<F: NowPlayingFetcher> PollingAdapter<F> {
    pub fn new(kind: ServiceKind, fetcher: F, interval: Duration) -> Self {
        Self::from_arc(kind, Arc::new(fetcher), interval)
    }

    pub fn from_arc(kind: ServiceKind, fetcher: Arc<F>, interval: Duration) -> Self {
        Self {
            kind,
            fetcher,
            interval: interval.max(Duration::from_millis(100)),
            running: RunningTask::default(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running.is_running()
    }
}

#[async_trait]
impl<F: NowPlayingFetcher> ServiceAdapter for PollingAdapter<F> {
    fn kind(&self) -> ServiceKind {
        self.kind
    }

    async fn start(&self, sink: OutcomeSink, token: CancellationToken) {
        self.running.replace(token.clone());
        let fetcher = Arc::clone(&self.fetcher);
        let interval = self.interval;
        let kind = self.kind;
        debug!(service = %kind, interval_ms = interval.as_millis() as u64, "Polling started");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let result = tokio::select! {
                            _ = token.cancelled() => break,
                            result = fetcher.fetch() => result,
                        };
                        trace!(service = %kind, ok = result.is_ok(), "Poll result");
                        if !sink.report_result(result) {
                            break;
                        }
                    }
                }
            }
            debug!(service = %kind, "Polling stopped");
        });
    }

    async fn stop(&self) {
        if self.running.cancel() {
            debug!(service = %self.kind, "Stopping poller");
        }
    }

    async fn probe(&self, sink: OutcomeSink) {
        sink.report_result(self.fetcher.fetch().await);
    }
}

/// Watches a push-driven source through its subscription.
pub struct PushAdapter<S: NowPlayingSubscriber> {
    kind: ServiceKind,
    subscriber: Arc<S>,
    running: RunningTask,
}

impl<S: NowPlayingSubscriber> PushAdapter<S> {
    pub fn new(kind: ServiceKind, subscriber: S) -> Self {
        Self::from_arc(kind, Arc::new(subscriber))
    }

    pub fn from_arc(kind: ServiceKind, subscriber: Arc<S>) -> Self {
        Self {
            kind,
            subscriber,
            running: RunningTask::default(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_running()
    }
}

#[async_trait]
impl<S: NowPlayingSubscriber> ServiceAdapter for PushAdapter<S> {
    fn kind(&self) -> ServiceKind {
        self.kind
    }

    async fn start(&self, sink: OutcomeSink, token: CancellationToken) {
        self.running.replace(token.clone());
        let subscriber = Arc::clone(&self.subscriber);
        let kind = self.kind;
        debug!(service = %kind, "Subscription started");

        tokio::spawn(async move {
            // initial state, events only carry changes
            sink.report_result(subscriber.fetch().await);
            let result = subscriber.subscribe(sink.clone(), token.clone()).await;
            if token.is_cancelled() {
                debug!(service = %kind, "Subscription stopped");
                return;
            }
            let err = match result {
                Ok(()) => FetchError::transient("event subscription ended"),
                Err(err) => err,
            };
            warn!(service = %kind, "Subscription failed: {err}");
            sink.error(err);
        });
    }

    async fn stop(&self) {
        if self.running.cancel() {
            debug!(service = %self.kind, "Stopping subscription");
        }
    }

    async fn probe(&self, sink: OutcomeSink) {
        sink.report_result(self.subscriber.fetch().await);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::model::TrackMetadata;

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NowPlayingFetcher for CountingFetcher {
        async fn fetch(&self) -> Result<NowPlayingData, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                Ok(NowPlayingData::new(
                    PlaybackState::Playing,
                    Some(TrackMetadata {
                        title: Some(format!("track {n}")),
                        ..TrackMetadata::default()
                    }),
                ))
            } else {
                Err(FetchError::transient("flaky"))
            }
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ControllerMessage>) -> Vec<AdapterOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(ControllerMessage::Outcome { outcome, .. }) = rx.try_recv() {
            outcomes.push(outcome);
        }
        outcomes
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_adapter_reports_every_interval() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = OutcomeSink::new(ServiceKind::DirectPoll, tx);
        let adapter = PollingAdapter::new(
            ServiceKind::DirectPoll,
            CountingFetcher {
                calls: AtomicUsize::new(0),
            },
            Duration::from_secs(1),
        );

        let token = CancellationToken::new();
        adapter.start(sink, token.child_token()).await;
        assert!(adapter.is_running());

        // first tick is immediate, then one per second
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let outcomes = drain(&mut rx);
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0], AdapterOutcome::Success(_)));
        assert!(matches!(outcomes[1], AdapterOutcome::Error(FetchError::Transient(_))));

        adapter.stop().await;
        assert!(!adapter.is_running());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_token_stops_polling() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let adapter = PollingAdapter::new(
            ServiceKind::CloudPoll,
            CountingFetcher {
                calls: AtomicUsize::new(0),
            },
            Duration::from_secs(2),
        );
        let teardown = CancellationToken::new();
        adapter
            .start(OutcomeSink::new(ServiceKind::CloudPoll, tx), teardown.child_token())
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(drain(&mut rx).len(), 1);

        teardown.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_probe_reports_one_outcome() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let adapter = PollingAdapter::new(
            ServiceKind::DirectPoll,
            CountingFetcher {
                calls: AtomicUsize::new(0),
            },
            Duration::from_secs(1),
        );
        adapter.probe(OutcomeSink::new(ServiceKind::DirectPoll, tx)).await;
        let outcomes = drain(&mut rx);
        assert_eq!(outcomes.len(), 1);
        assert!(!adapter.is_running());
    }

    struct ScriptedSubscriber;

    #[async_trait]
    impl NowPlayingSubscriber for ScriptedSubscriber {
        async fn subscribe(&self, sink: OutcomeSink, token: CancellationToken) -> Result<(), FetchError> {
            sink.playback_state(PlaybackState::Paused);
            tokio::select! {
                _ = token.cancelled() => Ok(()),
                _ = tokio::time::sleep(Duration::from_secs(60)) => {
                    Err(FetchError::transient("socket closed"))
                }
            }
        }

        async fn fetch(&self) -> Result<NowPlayingData, FetchError> {
            Ok(NowPlayingData::new(PlaybackState::Playing, None))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_adapter_reports_initial_state_events_and_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let adapter = PushAdapter::new(ServiceKind::LocalDevicePoll, ScriptedSubscriber);
        adapter
            .start(
                OutcomeSink::new(ServiceKind::LocalDevicePoll, tx),
                CancellationToken::new(),
            )
            .await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            drain(&mut rx),
            vec![
                AdapterOutcome::Success(NowPlayingData::new(PlaybackState::Playing, None)),
                AdapterOutcome::PlaybackState(PlaybackState::Paused),
            ]
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            drain(&mut rx),
            vec![AdapterOutcome::Error(FetchError::transient("socket closed"))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_adapter_stop_is_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let adapter = PushAdapter::new(ServiceKind::LocalDevicePoll, ScriptedSubscriber);
        adapter
            .start(
                OutcomeSink::new(ServiceKind::LocalDevicePoll, tx),
                CancellationToken::new(),
            )
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        drain(&mut rx);

        adapter.stop().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(drain(&mut rx).is_empty());
    }
}
