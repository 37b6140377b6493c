//! Total ordering of the now-playing services.

use std::fmt;

use tracing::warn;

use crate::errors::ControlError;
use crate::model::ServiceKind;

const SERVICE_COUNT: usize = ServiceKind::ALL.len();

/// Ordering used when the configured one is missing or unusable.
pub const DEFAULT_PRIORITY: [ServiceKind; SERVICE_COUNT] = [
    ServiceKind::LocalDevicePoll,
    ServiceKind::DirectPoll,
    ServiceKind::CloudPoll,
];

/// Every [`ServiceKind`] exactly once, highest priority first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PriorityOrder([ServiceKind; SERVICE_COUNT]);

impl Default for PriorityOrder {
    fn default() -> Self {
        PriorityOrder(DEFAULT_PRIORITY)
    }
}

impl PriorityOrder {
    /// Builds a total order from a partial list: duplicates are dropped and
    /// missing kinds are appended in declaration order.
    pub fn from_kinds<I: IntoIterator<Item = ServiceKind>>(kinds: I) -> Self {
        let mut ordered = Vec::with_capacity(SERVICE_COUNT);
        for kind in kinds {
            if !ordered.contains(&kind) {
                ordered.push(kind);
            }
        }
        for kind in ServiceKind::ALL {
            if !ordered.contains(&kind) {
                ordered.push(kind);
            }
        }
        let mut order = DEFAULT_PRIORITY;
        order.copy_from_slice(&ordered);
        PriorityOrder(order)
    }

    /// Parses a list such as `"local_device, direct_poll"`.
    ///
    /// Unknown tokens are skipped. A string without a single recognised
    /// token is a configuration error.
    pub fn parse_strict(raw: &str) -> Result<Self, ControlError> {
        let mut kinds = Vec::new();
        let mut unknown = Vec::new();
        for token in raw
            .split(|c: char| c == ',' || c == ';' || c == '|' || c == '>' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            match ServiceKind::from_token(token) {
                Some(kind) => kinds.push(kind),
                None => unknown.push(token),
            }
        }

        if kinds.is_empty() {
            return Err(ControlError::config(format!(
                "priority order {raw:?} names no known service"
            )));
        }
        if !unknown.is_empty() {
            warn!(?unknown, "Ignoring unknown services in priority order");
        }
        Ok(Self::from_kinds(kinds))
    }

    /// Like [`PriorityOrder::parse_strict`] but never fails: an unusable
    /// string yields the default ordering.
    pub fn parse(raw: &str) -> Self {
        match Self::parse_strict(raw) {
            Ok(order) => order,
            Err(err) => {
                warn!("{err}, using default priority order");
                Self::default()
            }
        }
    }

    pub fn as_slice(&self) -> &[ServiceKind] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = ServiceKind> + '_ {
        self.0.iter().copied()
    }

    /// Rank of `kind`, 0 being the highest priority.
    pub fn rank(&self, kind: ServiceKind) -> usize {
        self.0
            .iter()
            .position(|k| *k == kind)
            .unwrap_or(SERVICE_COUNT)
    }

    /// Kinds ranked strictly above `kind`, nearest first.
    pub fn ahead_of(&self, kind: ServiceKind) -> impl Iterator<Item = ServiceKind> + '_ {
        self.0[..self.rank(kind)].iter().rev().copied()
    }
}

impl fmt::Display for PriorityOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.0.iter().map(|k| k.as_str()).collect();
        f.write_str(&names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ServiceKind::{CloudPoll, DirectPoll, LocalDevicePoll};

    fn assert_total(order: &PriorityOrder) {
        assert_eq!(order.as_slice().len(), ServiceKind::ALL.len());
        for kind in ServiceKind::ALL {
            assert_eq!(order.iter().filter(|k| *k == kind).count(), 1);
        }
    }

    #[test]
    fn test_full_order_is_kept() {
        let order = PriorityOrder::parse("cloud_poll,local_device,direct_poll");
        assert_eq!(order.as_slice(), &[CloudPoll, LocalDevicePoll, DirectPoll]);
    }

    #[test]
    fn test_partial_order_appends_in_declaration_order() {
        let order = PriorityOrder::parse("local_device");
        assert_eq!(order.as_slice(), &[LocalDevicePoll, DirectPoll, CloudPoll]);

        let order = PriorityOrder::parse("cloud");
        assert_eq!(order.as_slice(), &[CloudPoll, DirectPoll, LocalDevicePoll]);
    }

    #[test]
    fn test_duplicates_and_unknown_tokens() {
        let order = PriorityOrder::parse("cloud, bogus, cloud_poll ; direct");
        assert_eq!(order.as_slice(), &[CloudPoll, DirectPoll, LocalDevicePoll]);
    }

    #[test]
    fn test_unusable_input_falls_back_to_default() {
        for raw in ["", "   ", "spotify,tidal", ",,,"] {
            assert!(PriorityOrder::parse_strict(raw).is_err());
            assert_eq!(PriorityOrder::parse(raw), PriorityOrder::default());
        }
    }

    #[test]
    fn test_any_input_yields_a_total_order() {
        let inputs = [
            "",
            "x",
            "direct",
            "local,local,local",
            "cloud_poll>direct_poll",
            "device | provider | backend | nope",
            "DIRECT-POLL local-device",
        ];
        for raw in inputs {
            assert_total(&PriorityOrder::parse(raw));
        }
    }

    #[test]
    fn test_explicit_kinds_precede_appended_ones() {
        let order = PriorityOrder::parse("cloud_poll");
        assert_eq!(order.rank(CloudPoll), 0);
        assert!(order.rank(DirectPoll) < order.rank(LocalDevicePoll));
    }

    #[test]
    fn test_ahead_of_is_nearest_first() {
        let order = PriorityOrder::default();
        assert_eq!(order.ahead_of(CloudPoll).collect::<Vec<_>>(), vec![DirectPoll, LocalDevicePoll]);
        assert_eq!(order.ahead_of(LocalDevicePoll).count(), 0);
        assert_eq!(order.to_string(), "local_device,direct_poll,cloud_poll");
    }
}
