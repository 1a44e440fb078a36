//! Map flow intents to traffic classes and mark outbound datagrams.

use meshsim_runtime::Datagram;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What an application intends a flow to carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowIntent {
    Telemetry,
    Video,
    Bulk,
}

/// Service class applied to a datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficClass {
    /// Expedited forwarding (DSCP 46).
    HighPriority,
    /// Assured forwarding class 3, low drop (DSCP 26).
    AssuredForwarding,
    /// Default forwarding (DSCP 0).
    BestEffort,
}

impl TrafficClass {
    /// DSCP code point of the class.
    pub const fn dscp(&self) -> u8 {
        match self {
            Self::HighPriority => 46,
            Self::AssuredForwarding => 26,
            Self::BestEffort => 0,
        }
    }

    /// Value of the IP ToS byte carrying this class.
    pub const fn tos(&self) -> u8 {
        self.dscp() << 2
    }
}

/// Per-flow traffic class marking policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classifier {
    mapping: BTreeMap<FlowIntent, TrafficClass>,
    fallback: TrafficClass,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(
            BTreeMap::from([
                (FlowIntent::Video, TrafficClass::HighPriority),
                (FlowIntent::Telemetry, TrafficClass::AssuredForwarding),
                (FlowIntent::Bulk, TrafficClass::BestEffort),
            ]),
            TrafficClass::BestEffort,
        )
    }
}

impl Classifier {
    /// Create a classifier from an explicit mapping. Intents missing from `mapping`
    /// are assigned `fallback`.
    pub fn new(mapping: BTreeMap<FlowIntent, TrafficClass>, fallback: TrafficClass) -> Self {
        Self { mapping, fallback }
    }

    /// Class assigned to `intent`.
    pub fn classify(&self, intent: FlowIntent) -> TrafficClass {
        self.mapping.get(&intent).copied().unwrap_or(self.fallback)
    }

    /// Overwrite the ToS byte of `datagram` with the class of `intent`.
    pub fn mark(&self, datagram: &mut Datagram, intent: FlowIntent) -> TrafficClass {
        let class = self.classify(intent);
        datagram.tos = class.tos();
        class
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsim_runtime::Priority;
    use test_case::test_case;

    #[test_case(FlowIntent::Video, TrafficClass::HighPriority, 46; "video")]
    #[test_case(FlowIntent::Telemetry, TrafficClass::AssuredForwarding, 26; "telemetry")]
    #[test_case(FlowIntent::Bulk, TrafficClass::BestEffort, 0; "bulk")]
    fn test_default_mapping(intent: FlowIntent, class: TrafficClass, dscp: u8) {
        let classifier = Classifier::default();
        assert_eq!(classifier.classify(intent), class);
        assert_eq!(class.dscp(), dscp);
        assert_eq!(class.tos(), dscp << 2);
    }

    #[test]
    fn test_mark_is_idempotent() {
        let classifier = Classifier::default();
        let mut datagram = Datagram::new("frame");
        classifier.mark(&mut datagram, FlowIntent::Video);
        let once = datagram.clone();
        classifier.mark(&mut datagram, FlowIntent::Video);
        assert_eq!(datagram, once);
        assert_eq!(datagram.tos, 184);
        assert_eq!(datagram.priority(), Priority::Expedited);
    }

    #[test]
    fn test_mark_overwrites() {
        let classifier = Classifier::default();
        let mut datagram = Datagram::new("frame");
        classifier.mark(&mut datagram, FlowIntent::Video);
        classifier.mark(&mut datagram, FlowIntent::Bulk);
        assert_eq!(datagram.tos, 0);
        assert_eq!(datagram.priority(), Priority::Normal);
    }

    #[test]
    fn test_fallback() {
        let classifier = Classifier::new(
            BTreeMap::from([(FlowIntent::Video, TrafficClass::AssuredForwarding)]),
            TrafficClass::HighPriority,
        );
        assert_eq!(
            classifier.classify(FlowIntent::Video),
            TrafficClass::AssuredForwarding
        );
        assert_eq!(
            classifier.classify(FlowIntent::Bulk),
            TrafficClass::HighPriority
        );
    }

    #[test]
    fn test_deserialize_names() {
        let mapping: BTreeMap<FlowIntent, TrafficClass> =
            serde_yaml::from_str("video: best_effort\nbulk: high_priority\n").unwrap();
        assert_eq!(mapping[&FlowIntent::Video], TrafficClass::BestEffort);
        assert_eq!(mapping[&FlowIntent::Bulk], TrafficClass::HighPriority);
    }
}
