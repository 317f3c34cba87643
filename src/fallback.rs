//! Information-recency monitoring for one agent.
//!
//! Tracks when each peer was last heard, how old and how confident the
//! agent's own perception is, and whether the roadside feed has gone quiet.
//! Any finding past its threshold is reported as a [`Degradation`]; the agent
//! answers every degradation by yielding.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::config::CoordinatorConfig;
use crate::infrastructure::AlertAggregator;
use crate::types::{Millis, SourceId, VehicleState, VehicleId};

/// Reason the agent's picture of the intersection cannot be trusted.
#[derive(Clone, Debug, PartialEq)]
pub enum Degradation {
    PerceptionMissing,
    PerceptionStale { age_ms: Millis },
    LowConfidence { confidence: f64 },
    PeerSilent { peers: Vec<VehicleId> },
    InfrastructureSilent { sources: Vec<SourceId> },
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Degradation::PerceptionMissing => write!(f, "no perception sample yet"),
            Degradation::PerceptionStale { age_ms } => {
                write!(f, "perception {age_ms}ms old")
            }
            Degradation::LowConfidence { confidence } => {
                write!(f, "perception confidence {confidence:.2}")
            }
            Degradation::PeerSilent { peers } => {
                let names: Vec<&str> = peers.iter().map(VehicleId::as_str).collect();
                write!(f, "silent peers [{}]", names.join(","))
            }
            Degradation::InfrastructureSilent { sources } => {
                write!(f, "silent roadside sources [{}]", sources.join(","))
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct PerceptionRecord {
    observed_at: Millis,
    confidence: f64,
}

#[derive(Debug, Default)]
pub struct FallbackController {
    last_seen: BTreeMap<VehicleId, Millis>,
    silent: BTreeSet<VehicleId>,
    perception: Option<PerceptionRecord>,
}

impl FallbackController {
    fn overdue_peers(&self, now: Millis, timeout: Millis) -> Vec<VehicleId> {
        self.last_seen
            .iter()
            .filter_map(|(peer, &last)| {
                if now.saturating_sub(last) > timeout {
                    Some(peer.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn new() -> Self {
        Self::default()
    }

    /// Record traffic from a peer; clears any silence mark.
    pub fn observe_peer(&mut self, peer: &VehicleId, at: Millis) {
        let last = self.last_seen.entry(peer.clone()).or_insert(at);
        *last = (*last).max(at);
        self.silent.remove(peer);
    }

    pub fn record_perception(&mut self, state: &VehicleState) {
        self.perception = Some(PerceptionRecord {
            observed_at: state.observed_at,
            confidence: state.confidence,
        });
    }

    /// Mark peers whose last traffic is older than `timeout` as silent.
    pub fn detect_stale_peers(&mut self, now: Millis, timeout: Millis) -> &BTreeSet<VehicleId> {
        let overdue = self.overdue_peers(now, timeout);
        self.silent.extend(overdue);
        &self.silent
    }

    /// Stop tracking peers not heard from for longer than `max_age`.
    pub fn forget_expired(&mut self, now: Millis, max_age: Millis) -> Vec<VehicleId> {
        let expired = self.overdue_peers(now, max_age);
        for peer in &expired {
            self.last_seen.remove(peer);
            self.silent.remove(peer);
        }
        expired
    }

    /// First degradation found, checking own perception before peers and
    /// peers before the roadside feed. Only silence among `relevant` peers
    /// counts.
    pub fn assess(
        &mut self,
        now: Millis,
        config: &CoordinatorConfig,
        relevant: &BTreeSet<VehicleId>,
        alerts: &AlertAggregator,
    ) -> Option<Degradation> {
        let Some(perception) = self.perception else {
            return Some(Degradation::PerceptionMissing);
        };
        let age_ms = now.saturating_sub(perception.observed_at);
        if age_ms > config.staleness_age_ms {
            return Some(Degradation::PerceptionStale { age_ms });
        }
        if perception.confidence < config.min_confidence {
            return Some(Degradation::LowConfidence {
                confidence: perception.confidence,
            });
        }

        let peers: Vec<VehicleId> = self
            .detect_stale_peers(now, config.staleness_age_ms)
            .intersection(relevant)
            .cloned()
            .collect();
        if !peers.is_empty() {
            return Some(Degradation::PeerSilent { peers });
        }

        if config.v2i_silence_timeout_ms > 0 && alerts.has_heard_any() {
            let sources = alerts.silent_sources(now, config.v2i_silence_timeout_ms);
            if !sources.is_empty() {
                return Some(Degradation::InfrastructureSilent { sources });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CorroborationPolicy;
    use crate::types::{
        AlertKind, AlertStatus, InfrastructureAlert, PriorityClass, TimeWindow, Vec2,
    };

    fn perception(observed_at: Millis, confidence: f64) -> VehicleState {
        VehicleState {
            id: VehicleId::new("self"),
            position: Vec2::default(),
            velocity: Vec2::new(0.0, 10.0),
            heading: 0.0,
            distance_to_zone: 20.0,
            nominal_speed: 10.0,
            entry_estimate: observed_at + 2_000,
            exit_estimate: observed_at + 3_400,
            uncertainty_radius: 0.5,
            confidence,
            class: PriorityClass::Normal,
            observed_at,
        }
    }

    fn quiet_feed() -> AlertAggregator {
        AlertAggregator::new(CorroborationPolicy::SourceRetraction)
    }

    #[test]
    fn detects_stale_peer_after_timeout() {
        let mut fallback = FallbackController::new();
        let peer = VehicleId::new("B");
        fallback.observe_peer(&peer, 0);
        assert!(fallback.detect_stale_peers(50, 100).is_empty());
        assert!(fallback.detect_stale_peers(150, 100).contains(&peer));
    }

    #[test]
    fn fresh_traffic_clears_silence() {
        let mut fallback = FallbackController::new();
        let peer = VehicleId::new("B");
        fallback.observe_peer(&peer, 0);
        fallback.detect_stale_peers(500, 100);
        fallback.observe_peer(&peer, 520);
        assert!(!fallback.detect_stale_peers(530, 100).contains(&peer));
    }

    #[test]
    fn out_of_order_observation_does_not_rewind() {
        let mut fallback = FallbackController::new();
        let peer = VehicleId::new("B");
        fallback.observe_peer(&peer, 400);
        fallback.observe_peer(&peer, 100);
        assert!(fallback.detect_stale_peers(450, 100).is_empty());
    }

    #[test]
    fn own_perception_is_checked_first() {
        let config = CoordinatorConfig::default();
        let mut fallback = FallbackController::new();
        let none = BTreeSet::new();
        assert_eq!(
            fallback.assess(0, &config, &none, &quiet_feed()),
            Some(Degradation::PerceptionMissing)
        );

        fallback.record_perception(&perception(1_000, 0.9));
        assert_eq!(fallback.assess(1_100, &config, &none, &quiet_feed()), None);
        assert_eq!(
            fallback.assess(1_000 + config.staleness_age_ms + 1, &config, &none, &quiet_feed()),
            Some(Degradation::PerceptionStale {
                age_ms: config.staleness_age_ms + 1
            })
        );

        fallback.record_perception(&perception(2_000, 0.2));
        assert!(matches!(
            fallback.assess(2_000, &config, &none, &quiet_feed()),
            Some(Degradation::LowConfidence { .. })
        ));
    }

    #[test]
    fn only_relevant_silent_peers_degrade() {
        let config = CoordinatorConfig::default();
        let mut fallback = FallbackController::new();
        let a = VehicleId::new("A");
        let b = VehicleId::new("B");
        fallback.observe_peer(&a, 0);
        fallback.observe_peer(&b, 0);
        let now = config.staleness_age_ms + 50;
        fallback.record_perception(&perception(now, 0.9));
        fallback.observe_peer(&b, now);

        let unrelated = BTreeSet::from([b.clone()]);
        assert_eq!(fallback.assess(now, &config, &unrelated, &quiet_feed()), None);

        let relevant = BTreeSet::from([a.clone(), b]);
        assert_eq!(
            fallback.assess(now, &config, &relevant, &quiet_feed()),
            Some(Degradation::PeerSilent { peers: vec![a] })
        );
    }

    #[test]
    fn roadside_silence_counts_only_after_first_contact() {
        let config = CoordinatorConfig::default();
        let mut fallback = FallbackController::new();
        let none = BTreeSet::new();
        let mut feed = quiet_feed();
        let late = config.v2i_silence_timeout_ms + 10;
        fallback.record_perception(&perception(late, 0.9));
        assert_eq!(fallback.assess(late, &config, &none, &feed), None);

        feed.ingest(
            InfrastructureAlert {
                kind: AlertKind::Hazard,
                zone: 0,
                validity: TimeWindow::new(0, 10_000),
                override_priority: false,
                status: AlertStatus::Clear,
                source: "rsu".to_string(),
                issued_at: 0,
            },
            0,
        );
        assert_eq!(
            fallback.assess(late, &config, &none, &feed),
            Some(Degradation::InfrastructureSilent {
                sources: vec!["rsu".to_string()]
            })
        );
    }

    #[test]
    fn forgotten_peers_stop_counting() {
        let mut fallback = FallbackController::new();
        let peer = VehicleId::new("gone");
        fallback.observe_peer(&peer, 0);
        fallback.detect_stale_peers(900, 100);
        assert_eq!(fallback.forget_expired(2_500, 2_000), vec![peer]);
        assert!(fallback.detect_stale_peers(2_600, 100).is_empty());
    }
}
