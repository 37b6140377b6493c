//! Simulated now-playing sources.
//!
//! Each source walks through a small playlist and fails at random, which is
//! enough to watch the controller fall back, cycle and recover.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use npcontrol::{
    ControlError, FetchError, LiveConnection, LiveSink, NowPlayingData, NowPlayingFetcher,
    NowPlayingSubscriber, OutcomeSink, PlaybackState, ServiceKind, TrackMetadata,
};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const PLAYLIST: &[(&str, &str, &str, u64)] = &[
    ("So What", "Miles Davis", "Kind of Blue", 540_000),
    ("Giant Steps", "John Coltrane", "Giant Steps", 286_000),
    ("Take Five", "The Dave Brubeck Quartet", "Time Out", 324_000),
    ("Moanin'", "Art Blakey", "Moanin'", 575_000),
];

/// Failure probability of one fetch.
fn failure_rate(kind: ServiceKind) -> f64 {
    match kind {
        ServiceKind::DirectPoll => 0.25,
        ServiceKind::CloudPoll => 0.05,
        ServiceKind::LocalDevicePoll => 0.02,
    }
}

struct PlayerState {
    position: usize,
    progress_ms: u64,
    state: PlaybackState,
}

/// A fake player shared by the fetch and the event paths.
pub struct SimulatedSource {
    kind: ServiceKind,
    player: Mutex<PlayerState>,
}

impl SimulatedSource {
    pub fn new(kind: ServiceKind) -> Self {
        let position = rand::rng().random_range(0..PLAYLIST.len());
        Self {
            kind,
            player: Mutex::new(PlayerState {
                position,
                progress_ms: 0,
                state: PlaybackState::Playing,
            }),
        }
    }

    /// Moves the player forward by `elapsed` and occasionally changes state.
    fn advance(&self, elapsed: Duration) -> NowPlayingData {
        let mut rng = rand::rng();
        let mut player = self.player.lock().unwrap_or_else(|p| p.into_inner());

        if rng.random_bool(0.05) {
            player.state = match player.state {
                PlaybackState::Playing => PlaybackState::Paused,
                PlaybackState::Paused => PlaybackState::Stopped,
                PlaybackState::Stopped => PlaybackState::Idle,
                PlaybackState::Idle => PlaybackState::Playing,
            };
        }

        if player.state == PlaybackState::Playing {
            player.progress_ms += elapsed.as_millis() as u64;
            if player.progress_ms >= PLAYLIST[player.position].3 {
                player.position = (player.position + 1) % PLAYLIST.len();
                player.progress_ms = 0;
            }
        }

        if player.state == PlaybackState::Idle {
            return NowPlayingData::idle();
        }
        let (title, artist, album, duration_ms) = PLAYLIST[player.position];
        NowPlayingData::new(
            player.state,
            Some(TrackMetadata {
                title: Some(title.to_string()),
                artist: Some(artist.to_string()),
                album: Some(album.to_string()),
                album_art_uri: None,
                duration_ms: Some(duration_ms),
                progress_ms: Some(player.progress_ms),
            }),
        )
    }

    fn fails(&self) -> bool {
        rand::rng().random_bool(failure_rate(self.kind))
    }

    fn fetch_once(&self, elapsed: Duration) -> Result<NowPlayingData, FetchError> {
        if self.fails() {
            debug!(service = %self.kind, "Simulated fetch failure");
            return Err(FetchError::transient("simulated upstream failure"));
        }
        Ok(self.advance(elapsed))
    }
}

/// Polled flavour.
pub struct SimulatedFetcher {
    source: SimulatedSource,
    interval: Duration,
}

impl SimulatedFetcher {
    pub fn new(kind: ServiceKind, interval: Duration) -> Self {
        Self {
            source: SimulatedSource::new(kind),
            interval,
        }
    }
}

#[async_trait]
impl NowPlayingFetcher for SimulatedFetcher {
    async fn fetch(&self) -> Result<NowPlayingData, FetchError> {
        let latency = Duration::from_millis(rand::rng().random_range(20..200));
        tokio::time::sleep(latency).await;
        self.source.fetch_once(self.interval)
    }
}

/// Push flavour: emits a state event every few seconds.
pub struct SimulatedSubscriber {
    source: SimulatedSource,
}

impl SimulatedSubscriber {
    pub fn new(kind: ServiceKind) -> Self {
        Self {
            source: SimulatedSource::new(kind),
        }
    }
}

#[async_trait]
impl NowPlayingSubscriber for SimulatedSubscriber {
    async fn subscribe(&self, sink: OutcomeSink, token: CancellationToken) -> Result<(), FetchError> {
        let period = Duration::from_secs(3);
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(period) => {}
            }
            if !sink.report_result(self.source.fetch_once(period)) {
                return Ok(());
            }
        }
    }

    async fn fetch(&self) -> Result<NowPlayingData, FetchError> {
        self.source.fetch_once(Duration::ZERO)
    }
}

/// Backend event channel: heartbeats every second, drops now and then.
pub struct SimulatedLiveConnection;

#[async_trait]
impl LiveConnection for SimulatedLiveConnection {
    async fn connect(&self, sink: LiveSink, token: CancellationToken) -> Result<(), ControlError> {
        if rand::rng().random_bool(0.3) {
            return Err(ControlError::connection_lost("simulated handshake failure"));
        }

        sink.connected();
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = heartbeat.tick() => {
                        let roll: f64 = rand::rng().random();
                        if roll < 0.01 {
                            sink.lost(ControlError::connection_lost("simulated socket reset"));
                            break;
                        }
                        // a stalled socket stays open but goes quiet
                        if roll < 0.02 {
                            token.cancelled().await;
                            break;
                        }
                        if !sink.event() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }
}
