use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The mutually exclusive now-playing sources.
///
/// Declaration order matters: kinds missing from a configured priority order
/// are appended in this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Third-party music provider polled directly from this client.
    DirectPoll,
    /// Same provider, proxied by the backend.
    CloudPoll,
    /// Local speaker system, proxied by the backend and pushed as events.
    #[serde(rename = "local_device")]
    LocalDevicePoll,
}

/// Fixed capability flags of a [`ServiceKind`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceCapabilities {
    pub requires_provider_link: bool,
    pub requires_device_link: bool,
    pub polls_from_client: bool,
    pub is_event_driven: bool,
    /// Updates for this kind travel over the backend's live event connection.
    pub uses_live_connection: bool,
}

const DIRECT_POLL_CAPABILITIES: ServiceCapabilities = ServiceCapabilities {
    requires_provider_link: true,
    requires_device_link: false,
    polls_from_client: true,
    is_event_driven: false,
    uses_live_connection: false,
};

const CLOUD_POLL_CAPABILITIES: ServiceCapabilities = ServiceCapabilities {
    requires_provider_link: true,
    requires_device_link: false,
    polls_from_client: false,
    is_event_driven: false,
    uses_live_connection: true,
};

const LOCAL_DEVICE_CAPABILITIES: ServiceCapabilities = ServiceCapabilities {
    requires_provider_link: false,
    requires_device_link: true,
    polls_from_client: false,
    is_event_driven: true,
    uses_live_connection: true,
};

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [
        ServiceKind::DirectPoll,
        ServiceKind::CloudPoll,
        ServiceKind::LocalDevicePoll,
    ];

    pub const fn capabilities(self) -> &'static ServiceCapabilities {
        match self {
            ServiceKind::DirectPoll => &DIRECT_POLL_CAPABILITIES,
            ServiceKind::CloudPoll => &CLOUD_POLL_CAPABILITIES,
            ServiceKind::LocalDevicePoll => &LOCAL_DEVICE_CAPABILITIES,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ServiceKind::DirectPoll => "direct_poll",
            ServiceKind::CloudPoll => "cloud_poll",
            ServiceKind::LocalDevicePoll => "local_device",
        }
    }

    /// Position in declaration order.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Accepts the canonical names plus the short and legacy spellings found
    /// in older configuration files.
    pub fn from_token(token: &str) -> Option<Self> {
        let normalized = token.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "direct_poll" | "direct" | "provider" => Some(ServiceKind::DirectPoll),
            "cloud_poll" | "cloud" | "backend" => Some(ServiceKind::CloudPoll),
            "local_device" | "local_device_poll" | "local" | "device" => {
                Some(ServiceKind::LocalDevicePoll)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which accounts/devices the user has linked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLinks {
    #[serde(default = "ServiceLinks::default_linked")]
    pub provider_linked: bool,
    #[serde(default = "ServiceLinks::default_linked")]
    pub device_linked: bool,
}

impl ServiceLinks {
    const fn default_linked() -> bool {
        true
    }

    pub fn satisfies(&self, kind: ServiceKind) -> bool {
        let caps = kind.capabilities();
        (!caps.requires_provider_link || self.provider_linked)
            && (!caps.requires_device_link || self.device_linked)
    }
}

impl Default for ServiceLinks {
    fn default() -> Self {
        Self {
            provider_linked: true,
            device_linked: true,
        }
    }
}

/// High-level playback state reported by an adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
    /// Nothing loaded.
    Idle,
}

impl PlaybackState {
    /// Map a raw provider/transport state string to a logical state.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PLAYING" | "TRANSITIONING" | "BUFFERING" => PlaybackState::Playing,
            "PAUSED" | "PAUSED_PLAYBACK" => PlaybackState::Paused,
            "STOPPED" => PlaybackState::Stopped,
            _ => PlaybackState::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Stopped => "stopped",
            PlaybackState::Idle => "idle",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_art_uri: Option<String>,
    pub duration_ms: Option<u64>,
    pub progress_ms: Option<u64>,
}

/// Result of one successful fetch (or one pushed event) from a source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NowPlayingData {
    pub state: PlaybackState,
    pub track: Option<TrackMetadata>,
}

impl NowPlayingData {
    pub fn new(state: PlaybackState, track: Option<TrackMetadata>) -> Self {
        Self { state, track }
    }

    pub fn idle() -> Self {
        Self::new(PlaybackState::Idle, None)
    }
}

/// What the display layer renders.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NowPlayingSnapshot {
    /// `None` when every service is Degraded or in Cooldown.
    pub active_service: Option<ServiceKind>,
    pub state: Option<PlaybackState>,
    pub track: Option<TrackMetadata>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl NowPlayingSnapshot {
    pub fn empty() -> Self {
        Self {
            active_service: None,
            state: None,
            track: None,
            fetched_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_are_exclusive() {
        let polls: Vec<_> = ServiceKind::ALL
            .iter()
            .filter(|k| k.capabilities().polls_from_client)
            .collect();
        assert_eq!(polls, vec![&ServiceKind::DirectPoll]);

        let pushed: Vec<_> = ServiceKind::ALL
            .iter()
            .filter(|k| k.capabilities().is_event_driven)
            .collect();
        assert_eq!(pushed, vec![&ServiceKind::LocalDevicePoll]);
    }

    #[test]
    fn test_from_token() {
        assert_eq!(ServiceKind::from_token(" Local-Device "), Some(ServiceKind::LocalDevicePoll));
        assert_eq!(ServiceKind::from_token("cloud"), Some(ServiceKind::CloudPoll));
        assert_eq!(ServiceKind::from_token("DIRECT_POLL"), Some(ServiceKind::DirectPoll));
        assert_eq!(ServiceKind::from_token("spotify"), None);
        assert_eq!(ServiceKind::from_token(""), None);
    }

    #[test]
    fn test_links() {
        let links = ServiceLinks {
            provider_linked: false,
            device_linked: true,
        };
        assert!(!links.satisfies(ServiceKind::DirectPoll));
        assert!(!links.satisfies(ServiceKind::CloudPoll));
        assert!(links.satisfies(ServiceKind::LocalDevicePoll));
    }

    #[test]
    fn test_playback_state_from_raw() {
        assert_eq!(PlaybackState::from_raw("PAUSED_PLAYBACK"), PlaybackState::Paused);
        assert_eq!(PlaybackState::from_raw("playing"), PlaybackState::Playing);
        assert_eq!(PlaybackState::from_raw("NO_MEDIA_PRESENT"), PlaybackState::Idle);
        assert_eq!(PlaybackState::from_raw("STOPPED"), PlaybackState::Stopped);
    }

    #[test]
    fn test_serde_names_match_display() {
        for kind in ServiceKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }
}
