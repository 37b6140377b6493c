//! Now-playing source selection, fallback and reconnection.
//!
//! Several unreliable sources can report what the user is listening to; only
//! one is authoritative at a time. This crate decides which, demotes and
//! re-promotes sources on failure, cycles back to higher-priority sources and
//! keeps the live event connection alive.
//!
//! ```
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use npcontrol::{
//!     ControllerSettings, FetchError, NowPlayingData, NowPlayingFetcher, NowPlayingService,
//!     PlaybackState, PollingAdapter, ServiceKind, TrackMetadata,
//! };
//!
//! struct Fixed;
//!
//! #[async_trait]
//! impl NowPlayingFetcher for Fixed {
//!     async fn fetch(&self) -> Result<NowPlayingData, FetchError> {
//!         let track = TrackMetadata {
//!             title: Some("So What".into()),
//!             ..Default::default()
//!         };
//!         Ok(NowPlayingData::new(PlaybackState::Playing, Some(track)))
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let handle = NowPlayingService::new(ControllerSettings::default())
//!     .with_adapter(PollingAdapter::new(
//!         ServiceKind::DirectPoll,
//!         Fixed,
//!         Duration::from_secs(1),
//!     ))
//!     .spawn();
//!
//! let mut snapshots = handle.snapshots();
//! let snapshot = snapshots
//!     .wait_for(|s| s.track.is_some())
//!     .await
//!     .unwrap()
//!     .clone();
//! assert_eq!(snapshot.active_service, Some(ServiceKind::DirectPoll));
//!
//! handle.shutdown().await;
//! # });
//! ```

mod controller;
mod live;

pub mod adapter;
pub mod config;
pub mod config_ext;
pub mod cycler;
pub mod errors;
pub mod events;
pub mod fallback;
pub mod health;
pub mod model;
pub mod priority;
pub mod reconnect;
pub mod selector;
pub mod service;

pub use adapter::{
    AdapterOutcome, NowPlayingFetcher, NowPlayingSubscriber, OutcomeSink, PollingAdapter,
    PushAdapter, ServiceAdapter,
};
pub use config::{
    ControllerSettings, CyclingSettings, FallbackPolicy, NowPlayingConfig, ReconnectSettings,
};
pub use config_ext::NowPlayingConfigExt;
pub use cycler::{CycleProbe, ServiceCycler};
pub use errors::{ControlError, FetchError};
pub use events::StatusEvent;
pub use fallback::{FallbackAction, FallbackController, ProbeReason, TransitionReason};
pub use health::{HealthTracker, Lifecycle, ServiceHealthState};
pub use live::{LiveConnection, LiveSink};
pub use model::{
    NowPlayingData, NowPlayingSnapshot, PlaybackState, ServiceCapabilities, ServiceKind,
    ServiceLinks, TrackMetadata,
};
pub use priority::{DEFAULT_PRIORITY, PriorityOrder};
pub use reconnect::{ReconnectAction, ReconnectManager, ReconnectPhase, ReconnectState};
pub use selector::{SourceSelector, SwitchEvent, select};
pub use service::{NowPlayingHandle, NowPlayingService};
