//! Configuration structures for the now-playing controller.
//!
//! The YAML section (`nowplaying:` in the NowPlaying configuration) is
//! deserialized into [`NowPlayingConfig`], which mirrors the file layout and
//! tolerates legacy key names and negative numbers. [`NowPlayingConfig::resolve`]
//! turns it into the immutable [`ControllerSettings`] snapshot consumed by the
//! state machines.
//!
//! Precedence, for every setting: current key, then legacy key, then the
//! built-in default.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};

use crate::model::{ServiceKind, ServiceLinks};
use crate::priority::PriorityOrder;

/// Legacy top-level keys and the key that replaced them.
const LEGACY_TOP_LEVEL_KEYS: &[(&str, &str)] = &[
    ("service_priority", "priority_order"),
    ("ws_reconnect_interval_ms", "ws_retry_interval_ms"),
    ("ws_idle_timeout_sec", "ws_force_reconn_idle_sec"),
];

/// Legacy per-service keys and the key that replaced them.
const LEGACY_SERVICE_KEYS: &[(&str, &str)] = &[("retry_duration_sec", "retry_window_sec")];

/// Per-service degrade/retry/cooldown policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FallbackPolicy {
    /// Staleness bound; 0 disables staleness-triggered fallback.
    pub timeout_sec: u64,
    /// Consecutive failures needed to degrade.
    pub error_threshold: u32,
    pub on_error_fallback: bool,
    pub retry_interval_sec: u64,
    pub retry_cooldown_sec: u64,
    pub retry_window_sec: u64,
    pub fallback_time_threshold_sec: u64,
    /// Adapter poll cadence; 0 for event-driven sources.
    pub poll_interval_sec: u64,
}

impl FallbackPolicy {
    /// Built-in defaults, one row per kind.
    pub fn default_for(kind: ServiceKind) -> Self {
        match kind {
            ServiceKind::DirectPoll => FallbackPolicy {
                timeout_sec: 5,
                error_threshold: 3,
                on_error_fallback: true,
                retry_interval_sec: 3,
                retry_cooldown_sec: 30,
                retry_window_sec: 10,
                fallback_time_threshold_sec: 0,
                poll_interval_sec: 1,
            },
            ServiceKind::CloudPoll => FallbackPolicy {
                timeout_sec: 5,
                error_threshold: 3,
                on_error_fallback: true,
                retry_interval_sec: 5,
                retry_cooldown_sec: 30,
                retry_window_sec: 10,
                fallback_time_threshold_sec: 0,
                poll_interval_sec: 2,
            },
            ServiceKind::LocalDevicePoll => FallbackPolicy {
                timeout_sec: 0,
                error_threshold: 3,
                on_error_fallback: true,
                retry_interval_sec: 10,
                retry_cooldown_sec: 30,
                retry_window_sec: 0,
                fallback_time_threshold_sec: 0,
                poll_interval_sec: 0,
            },
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_sec > 0).then(|| Duration::from_secs(self.timeout_sec))
    }

    pub fn fallback_time_threshold(&self) -> Option<Duration> {
        (self.fallback_time_threshold_sec > 0)
            .then(|| Duration::from_secs(self.fallback_time_threshold_sec))
    }

    /// A threshold of 0 degrades on the first error.
    pub fn effective_error_threshold(&self) -> u32 {
        self.error_threshold.max(1)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_sec.max(1))
    }

    pub fn retry_window(&self) -> Duration {
        Duration::from_secs(self.retry_window_sec)
    }

    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_secs(self.retry_cooldown_sec)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_sec > 0).then(|| Duration::from_secs(self.poll_interval_sec))
    }
}

/// Live event connection backoff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReconnectSettings {
    pub retry_interval_ms: u64,
    pub retry_active_seconds: u64,
    pub retry_cooldown_seconds: u64,
    pub retry_max_total_seconds: u64,
    /// 0 disables silent-connection detection.
    pub force_reconn_idle_sec: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            retry_interval_ms: 3000,
            retry_active_seconds: 60,
            retry_cooldown_seconds: 60,
            retry_max_total_seconds: 1800,
            force_reconn_idle_sec: 30,
        }
    }
}

impl ReconnectSettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }

    pub fn active_phase(&self) -> Duration {
        Duration::from_secs(self.retry_active_seconds)
    }

    pub fn cooldown_interval(&self) -> Duration {
        Duration::from_secs(self.retry_cooldown_seconds.max(1))
    }

    pub fn max_total(&self) -> Duration {
        Duration::from_secs(self.retry_max_total_seconds)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.force_reconn_idle_sec > 0).then(|| Duration::from_secs(self.force_reconn_idle_sec))
    }
}

/// Idle/service cycling waits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CyclingSettings {
    pub enabled: bool,
    pub paused_wait_sec: u64,
    pub stopped_wait_sec: u64,
    pub idle_wait_sec: u64,
    pub reset_sec: u64,
}

impl Default for CyclingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            paused_wait_sec: 0,
            stopped_wait_sec: 30,
            idle_wait_sec: 3,
            reset_sec: 30,
        }
    }
}

/// Immutable, fully resolved parameters of the controller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ControllerSettings {
    pub priority: PriorityOrderSetting,
    pub policies: HashMap<ServiceKind, FallbackPolicy>,
    pub links: ServiceLinks,
    pub reconnect: ReconnectSettings,
    pub cycling: CyclingSettings,
    pub transition_grace_sec: u64,
    pub tick_interval_ms: u64,
}

/// Serializable wrapper so the resolved snapshot can be dumped for
/// diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PriorityOrderSetting(pub PriorityOrder);

impl Serialize for PriorityOrderSetting {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        NowPlayingConfig::default().resolve()
    }
}

impl ControllerSettings {
    pub fn priority(&self) -> &PriorityOrder {
        &self.priority.0
    }

    pub fn policy(&self, kind: ServiceKind) -> &FallbackPolicy {
        &self.policies[&kind]
    }

    pub fn transition_grace(&self) -> Duration {
        Duration::from_secs(self.transition_grace_sec)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(10))
    }
}

// ============================================================================
// Raw (file-shaped) configuration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PriorityValue {
    Text(String),
    List(Vec<String>),
}

/// Per-service overrides; absent fields take the kind's default.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePolicyConfig {
    pub timeout_sec: Option<i64>,
    pub error_threshold: Option<i64>,
    pub on_error_fallback: Option<bool>,
    pub retry_interval_sec: Option<i64>,
    pub retry_cooldown_sec: Option<i64>,
    pub retry_window_sec: Option<i64>,
    pub fallback_time_threshold_sec: Option<i64>,
    pub poll_interval_sec: Option<i64>,
}

impl ServicePolicyConfig {
    fn resolve(&self, kind: ServiceKind) -> FallbackPolicy {
        let d = FallbackPolicy::default_for(kind);
        FallbackPolicy {
            timeout_sec: non_negative(self.timeout_sec, d.timeout_sec),
            error_threshold: non_negative(self.error_threshold, d.error_threshold as u64)
                .min(u32::MAX as u64) as u32,
            on_error_fallback: self.on_error_fallback.unwrap_or(d.on_error_fallback),
            retry_interval_sec: non_negative(self.retry_interval_sec, d.retry_interval_sec),
            retry_cooldown_sec: non_negative(self.retry_cooldown_sec, d.retry_cooldown_sec),
            retry_window_sec: non_negative(self.retry_window_sec, d.retry_window_sec),
            fallback_time_threshold_sec: non_negative(
                self.fallback_time_threshold_sec,
                d.fallback_time_threshold_sec,
            ),
            poll_interval_sec: non_negative(self.poll_interval_sec, d.poll_interval_sec),
        }
    }
}

/// Per-service sections, keyed by the configuration token of each kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub direct_poll: ServicePolicyConfig,
    #[serde(default)]
    pub cloud_poll: ServicePolicyConfig,
    #[serde(default)]
    pub local_device: ServicePolicyConfig,
}

impl ServicesConfig {
    pub fn for_kind(&self, kind: ServiceKind) -> &ServicePolicyConfig {
        match kind {
            ServiceKind::DirectPoll => &self.direct_poll,
            ServiceKind::CloudPoll => &self.cloud_poll,
            ServiceKind::LocalDevicePoll => &self.local_device,
        }
    }
}

/// The `nowplaying:` section as written in the configuration file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NowPlayingConfig {
    #[serde(
        default = "NowPlayingConfig::default_priority_order",
        deserialize_with = "lenient_priority"
    )]
    pub priority_order: PriorityValue,
    #[serde(default)]
    pub links: ServiceLinks,
    #[serde(default)]
    pub services: ServicesConfig,

    #[serde(default = "NowPlayingConfig::default_enable_service_cycling")]
    pub enable_service_cycling: bool,
    #[serde(default = "NowPlayingConfig::default_paused_wait_sec")]
    pub paused_wait_sec: i64,
    #[serde(default = "NowPlayingConfig::default_stopped_wait_sec")]
    pub stopped_wait_sec: i64,
    #[serde(default = "NowPlayingConfig::default_idle_wait_sec")]
    pub idle_wait_sec: i64,
    #[serde(default = "NowPlayingConfig::default_service_cycle_reset_sec")]
    pub service_cycle_reset_sec: i64,
    #[serde(default = "NowPlayingConfig::default_service_transition_grace_sec")]
    pub service_transition_grace_sec: i64,
    #[serde(default = "NowPlayingConfig::default_tick_interval_ms")]
    pub tick_interval_ms: i64,

    #[serde(default = "NowPlayingConfig::default_ws_retry_interval_ms")]
    pub ws_retry_interval_ms: i64,
    #[serde(default = "NowPlayingConfig::default_ws_retry_active_seconds")]
    pub ws_retry_active_seconds: i64,
    #[serde(default = "NowPlayingConfig::default_ws_retry_cooldown_seconds")]
    pub ws_retry_cooldown_seconds: i64,
    #[serde(default = "NowPlayingConfig::default_ws_retry_max_total_seconds")]
    pub ws_retry_max_total_seconds: i64,
    #[serde(default = "NowPlayingConfig::default_ws_force_reconn_idle_sec")]
    pub ws_force_reconn_idle_sec: i64,
}

impl NowPlayingConfig {
    fn default_priority_order() -> PriorityValue {
        PriorityValue::Text(PriorityOrder::default().to_string())
    }

    const fn default_enable_service_cycling() -> bool {
        true
    }

    const fn default_paused_wait_sec() -> i64 {
        0
    }

    const fn default_stopped_wait_sec() -> i64 {
        30
    }

    const fn default_idle_wait_sec() -> i64 {
        3
    }

    const fn default_service_cycle_reset_sec() -> i64 {
        30
    }

    const fn default_service_transition_grace_sec() -> i64 {
        2
    }

    const fn default_tick_interval_ms() -> i64 {
        1000
    }

    const fn default_ws_retry_interval_ms() -> i64 {
        3000
    }

    const fn default_ws_retry_active_seconds() -> i64 {
        60
    }

    const fn default_ws_retry_cooldown_seconds() -> i64 {
        60
    }

    const fn default_ws_retry_max_total_seconds() -> i64 {
        1800
    }

    const fn default_ws_force_reconn_idle_sec() -> i64 {
        30
    }

    /// Deserializes a `nowplaying:` YAML section, honouring legacy keys.
    pub fn from_value(mut section: Value) -> Result<Self, serde_yaml::Error> {
        apply_legacy_aliases(&mut section);
        if section.is_null() {
            section = Value::Mapping(Mapping::new());
        }
        serde_yaml::from_value(section)
    }

    /// Clamps, fills per-kind defaults and parses the priority order.
    pub fn resolve(&self) -> ControllerSettings {
        let priority = match &self.priority_order {
            PriorityValue::Text(raw) => PriorityOrder::parse(raw),
            PriorityValue::List(items) => PriorityOrder::parse(&items.join(",")),
        };

        let policies = ServiceKind::ALL
            .iter()
            .map(|kind| (*kind, self.services.for_kind(*kind).resolve(*kind)))
            .collect();

        ControllerSettings {
            priority: PriorityOrderSetting(priority),
            policies,
            links: self.links,
            reconnect: ReconnectSettings {
                retry_interval_ms: clamp(self.ws_retry_interval_ms),
                retry_active_seconds: clamp(self.ws_retry_active_seconds),
                retry_cooldown_seconds: clamp(self.ws_retry_cooldown_seconds),
                retry_max_total_seconds: clamp(self.ws_retry_max_total_seconds),
                force_reconn_idle_sec: clamp(self.ws_force_reconn_idle_sec),
            },
            cycling: CyclingSettings {
                enabled: self.enable_service_cycling,
                paused_wait_sec: clamp(self.paused_wait_sec),
                stopped_wait_sec: clamp(self.stopped_wait_sec),
                idle_wait_sec: clamp(self.idle_wait_sec),
                reset_sec: clamp(self.service_cycle_reset_sec),
            },
            transition_grace_sec: clamp(self.service_transition_grace_sec),
            tick_interval_ms: clamp(self.tick_interval_ms),
        }
    }
}

impl Default for NowPlayingConfig {
    fn default() -> Self {
        Self {
            priority_order: Self::default_priority_order(),
            links: ServiceLinks::default(),
            services: ServicesConfig::default(),
            enable_service_cycling: Self::default_enable_service_cycling(),
            paused_wait_sec: Self::default_paused_wait_sec(),
            stopped_wait_sec: Self::default_stopped_wait_sec(),
            idle_wait_sec: Self::default_idle_wait_sec(),
            service_cycle_reset_sec: Self::default_service_cycle_reset_sec(),
            service_transition_grace_sec: Self::default_service_transition_grace_sec(),
            tick_interval_ms: Self::default_tick_interval_ms(),
            ws_retry_interval_ms: Self::default_ws_retry_interval_ms(),
            ws_retry_active_seconds: Self::default_ws_retry_active_seconds(),
            ws_retry_cooldown_seconds: Self::default_ws_retry_cooldown_seconds(),
            ws_retry_max_total_seconds: Self::default_ws_retry_max_total_seconds(),
            ws_force_reconn_idle_sec: Self::default_ws_force_reconn_idle_sec(),
        }
    }
}

/// A priority of the wrong type falls back to the default order instead of
/// rejecting the whole section.
fn lenient_priority<'de, D>(deserializer: D) -> Result<PriorityValue, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match serde_yaml::from_value(value.clone()) {
        Ok(priority) => Ok(priority),
        Err(err) => {
            warn!(?value, "Ignoring priority_order: {err}");
            Ok(NowPlayingConfig::default_priority_order())
        }
    }
}

fn clamp(value: i64) -> u64 {
    value.max(0) as u64
}

fn non_negative(value: Option<i64>, default: u64) -> u64 {
    value.map(clamp).unwrap_or(default)
}

/// Moves legacy keys onto their current name when the current key is absent,
/// and drops them otherwise.
pub fn apply_legacy_aliases(section: &mut Value) {
    let Value::Mapping(map) = section else {
        return;
    };
    rename_legacy_keys(map, LEGACY_TOP_LEVEL_KEYS);

    if let Some(Value::Mapping(services)) = map.get_mut(&Value::from("services")) {
        for (_, service) in services.iter_mut() {
            if let Value::Mapping(service) = service {
                rename_legacy_keys(service, LEGACY_SERVICE_KEYS);
            }
        }
    }
}

fn rename_legacy_keys(map: &mut Mapping, aliases: &[(&str, &str)]) {
    for (legacy, current) in aliases {
        let Some(value) = map.remove(&Value::from(*legacy)) else {
            continue;
        };
        let current_key = Value::from(*current);
        if map.contains_key(&current_key) {
            debug!(legacy, current, "Legacy key shadowed by current key");
        } else {
            debug!(legacy, current, "Using legacy configuration key");
            map.insert(current_key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> ControllerSettings {
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        NowPlayingConfig::from_value(value).unwrap().resolve()
    }

    #[test]
    fn test_defaults() {
        let settings = ControllerSettings::default();
        assert_eq!(settings.priority(), &PriorityOrder::default());
        assert_eq!(settings.reconnect, ReconnectSettings::default());
        assert_eq!(settings.cycling, CyclingSettings::default());
        assert_eq!(settings.transition_grace_sec, 2);
        assert_eq!(settings.policies.len(), ServiceKind::ALL.len());
        for kind in ServiceKind::ALL {
            assert_eq!(settings.policy(kind), &FallbackPolicy::default_for(kind));
            assert_eq!(settings.policy(kind).error_threshold, 3);
            assert_eq!(settings.policy(kind).retry_cooldown_sec, 30);
        }
        assert_eq!(settings.policy(ServiceKind::LocalDevicePoll).timeout_sec, 0);
    }

    #[test]
    fn test_empty_and_null_sections() {
        assert_eq!(parse("{}"), ControllerSettings::default());
        assert_eq!(
            NowPlayingConfig::from_value(Value::Null).unwrap().resolve(),
            ControllerSettings::default()
        );
    }

    #[test]
    fn test_service_overrides_keep_other_defaults() {
        let settings = parse(
            "services:\n  cloud_poll:\n    timeout_sec: 4\n    on_error_fallback: false\n",
        );
        let cloud = settings.policy(ServiceKind::CloudPoll);
        assert_eq!(cloud.timeout_sec, 4);
        assert!(!cloud.on_error_fallback);
        assert_eq!(cloud.retry_window_sec, 10);
        assert_eq!(
            settings.policy(ServiceKind::DirectPoll),
            &FallbackPolicy::default_for(ServiceKind::DirectPoll)
        );
    }

    #[test]
    fn test_negative_values_are_clamped() {
        let settings = parse(
            "ws_retry_max_total_seconds: -5\nidle_wait_sec: -1\nservices:\n  direct_poll:\n    retry_window_sec: -10\n    error_threshold: -3\n",
        );
        assert_eq!(settings.reconnect.retry_max_total_seconds, 0);
        assert_eq!(settings.cycling.idle_wait_sec, 0);
        let direct = settings.policy(ServiceKind::DirectPoll);
        assert_eq!(direct.retry_window_sec, 0);
        assert_eq!(direct.error_threshold, 0);
        assert_eq!(direct.effective_error_threshold(), 1);
    }

    #[test]
    fn test_legacy_key_used_when_current_absent() {
        let settings = parse(
            "service_priority: cloud_poll\nws_reconnect_interval_ms: 500\nservices:\n  direct_poll:\n    retry_duration_sec: 7\n",
        );
        assert_eq!(settings.priority().as_slice()[0], ServiceKind::CloudPoll);
        assert_eq!(settings.reconnect.retry_interval_ms, 500);
        assert_eq!(settings.policy(ServiceKind::DirectPoll).retry_window_sec, 7);
    }

    #[test]
    fn test_current_key_wins_over_legacy() {
        let settings = parse(
            "service_priority: cloud_poll\npriority_order: direct_poll\nws_idle_timeout_sec: 5\nws_force_reconn_idle_sec: 45\nservices:\n  cloud_poll:\n    retry_duration_sec: 7\n    retry_window_sec: 2\n",
        );
        assert_eq!(settings.priority().as_slice()[0], ServiceKind::DirectPoll);
        assert_eq!(settings.reconnect.force_reconn_idle_sec, 45);
        assert_eq!(settings.policy(ServiceKind::CloudPoll).retry_window_sec, 2);
    }

    #[test]
    fn test_priority_as_list_and_bad_string() {
        let settings = parse("priority_order: [cloud_poll, local_device]\n");
        assert_eq!(
            settings.priority().as_slice(),
            &[ServiceKind::CloudPoll, ServiceKind::LocalDevicePoll, ServiceKind::DirectPoll]
        );

        let settings = parse("priority_order: 'not a service'\n");
        assert_eq!(settings.priority(), &PriorityOrder::default());
    }

    #[test]
    fn test_wrongly_typed_priority_keeps_the_section() {
        for raw in ["42", "{ first: cloud_poll }", "[1, 2]"] {
            let settings = parse(&format!(
                "priority_order: {raw}\nservice_transition_grace_sec: 7\nidle_wait_sec: 9\n"
            ));
            assert_eq!(settings.priority(), &PriorityOrder::default(), "{raw}");
            assert_eq!(settings.transition_grace_sec, 7);
            assert_eq!(settings.cycling.idle_wait_sec, 9);
        }
    }

    #[test]
    fn test_policy_durations() {
        let local = FallbackPolicy::default_for(ServiceKind::LocalDevicePoll);
        assert_eq!(local.timeout(), None);
        assert_eq!(local.poll_interval(), None);
        assert_eq!(local.retry_window(), Duration::ZERO);

        let direct = FallbackPolicy::default_for(ServiceKind::DirectPoll);
        assert_eq!(direct.timeout(), Some(Duration::from_secs(5)));
        assert_eq!(direct.retry_interval(), Duration::from_secs(3));
    }
}
