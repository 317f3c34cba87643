//! V2I alert aggregation.
//!
//! Claims are tracked per `(zone, kind)` and per roadside source; a source's
//! newer claim replaces its older one. Merging is safety-first: a zone stays
//! blocked while the corroboration policy still considers any active claim
//! standing.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::config::CorroborationPolicy;
use crate::types::{
    AlertKind, AlertStatus, InfrastructureAlert, Millis, SourceId, TimeWindow, ZoneId,
};

/// Merged view of every standing claim for one zone and kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveAlert {
    pub kind: AlertKind,
    pub zone: ZoneId,
    /// Union of the standing claims' validity windows.
    pub validity: TimeWindow,
    pub override_priority: bool,
    pub sources: Vec<SourceId>,
}

impl ActiveAlert {
    pub fn in_effect(&self, now: Millis) -> bool {
        self.validity.contains(now)
    }
}

/// Point-in-time alert view consumed by the scheduler and the agent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AlertSnapshot {
    /// Ordered by zone, then kind.
    pub alerts: Vec<ActiveAlert>,
}

impl AlertSnapshot {
    /// First pedestrian or hazard alert in effect on any of `zones`.
    pub fn blocking_in(&self, zones: &[ZoneId], now: Millis) -> Option<&ActiveAlert> {
        self.alerts.iter().find(|alert| {
            alert.kind.blocks_zone() && alert.in_effect(now) && zones.contains(&alert.zone)
        })
    }

    /// Whether an emergency-vehicle override currently holds `zone`.
    pub fn override_active(&self, zone: ZoneId, now: Millis) -> bool {
        self.alerts.iter().any(|alert| {
            alert.zone == zone
                && alert.kind == AlertKind::EmergencyVehicle
                && alert.override_priority
                && alert.in_effect(now)
        })
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

pub struct AlertAggregator {
    policy: CorroborationPolicy,
    claims: BTreeMap<(ZoneId, AlertKind), BTreeMap<SourceId, InfrastructureAlert>>,
    last_heard: BTreeMap<SourceId, Millis>,
}

impl AlertAggregator {
    pub fn new(policy: CorroborationPolicy) -> Self {
        Self {
            policy,
            claims: BTreeMap::new(),
            last_heard: BTreeMap::new(),
        }
    }

    /// Record a claim. Returns `false` if it was already expired or older than
    /// what its source said before. Either way the source counts as heard.
    pub fn ingest(&mut self, alert: InfrastructureAlert, now: Millis) -> bool {
        self.last_heard.insert(alert.source.clone(), now);
        if alert.is_expired(now) {
            debug!(source = %alert.source, zone = alert.zone, "dropping expired alert");
            return false;
        }
        let per_source = self.claims.entry((alert.zone, alert.kind)).or_default();
        if let Some(existing) = per_source.get(&alert.source) {
            if existing.issued_at >= alert.issued_at {
                return false;
            }
        }
        per_source.insert(alert.source.clone(), alert);
        true
    }

    /// Drop every claim whose validity has ended. Returns how many went.
    pub fn purge_expired(&mut self, now: Millis) -> usize {
        let mut purged = 0;
        for per_source in self.claims.values_mut() {
            let before = per_source.len();
            per_source.retain(|_, alert| !alert.is_expired(now));
            purged += before - per_source.len();
        }
        self.claims.retain(|_, per_source| !per_source.is_empty());
        purged
    }

    pub fn snapshot(&self, now: Millis) -> AlertSnapshot {
        let mut alerts = Vec::new();
        for (&(zone, kind), per_source) in &self.claims {
            let live: Vec<&InfrastructureAlert> = per_source
                .values()
                .filter(|alert| !alert.is_expired(now))
                .collect();
            let active: Vec<&InfrastructureAlert> = live
                .iter()
                .copied()
                .filter(|alert| alert.status == AlertStatus::Active)
                .collect();
            if active.is_empty() {
                continue;
            }
            let standing = match self.policy {
                CorroborationPolicy::SourceRetraction => true,
                CorroborationPolicy::Majority => {
                    let clear = live.len() - active.len();
                    clear * 2 <= live.len()
                }
            };
            if !standing {
                continue;
            }
            let start = active.iter().map(|a| a.validity.start).min().unwrap_or(now);
            let end = active.iter().map(|a| a.validity.end).max().unwrap_or(now);
            alerts.push(ActiveAlert {
                kind,
                zone,
                validity: TimeWindow::new(start, end),
                override_priority: active.iter().any(|a| a.override_priority),
                sources: active.iter().map(|a| a.source.clone()).collect(),
            });
        }
        AlertSnapshot { alerts }
    }

    /// Sources heard before but not within `timeout`.
    pub fn silent_sources(&self, now: Millis, timeout: Millis) -> Vec<SourceId> {
        self.last_heard
            .iter()
            .filter(|(_, heard)| now.saturating_sub(**heard) > timeout)
            .map(|(source, _)| source.clone())
            .collect()
    }

    /// Forget sources silent for longer than `max_age` that have no claim
    /// still in force. A source backing a live alert is kept so its silence
    /// stays visible.
    pub fn forget_silent(&mut self, now: Millis, max_age: Millis) -> Vec<SourceId> {
        let backing: BTreeSet<&SourceId> = self
            .claims
            .values()
            .flat_map(|per_source| per_source.keys())
            .collect();
        let forgotten: Vec<SourceId> = self
            .last_heard
            .iter()
            .filter(|(source, heard)| {
                now.saturating_sub(**heard) > max_age && !backing.contains(source)
            })
            .map(|(source, _)| source.clone())
            .collect();
        for source in &forgotten {
            self.last_heard.remove(source);
        }
        forgotten
    }

    pub fn has_heard_any(&self) -> bool {
        !self.last_heard.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(
        source: &str,
        kind: AlertKind,
        status: AlertStatus,
        issued_at: Millis,
        validity: (Millis, Millis),
    ) -> InfrastructureAlert {
        InfrastructureAlert {
            kind,
            zone: 2,
            validity: TimeWindow::new(validity.0, validity.1),
            override_priority: kind == AlertKind::EmergencyVehicle,
            status,
            source: source.to_string(),
            issued_at,
        }
    }

    #[test]
    fn claims_from_several_sources_merge_into_one_alert() {
        let mut agg = AlertAggregator::new(CorroborationPolicy::SourceRetraction);
        assert!(agg.ingest(claim("rsu-1", AlertKind::Pedestrian, AlertStatus::Active, 0, (100, 900)), 0));
        assert!(agg.ingest(claim("rsu-2", AlertKind::Pedestrian, AlertStatus::Active, 5, (300, 1_500)), 5));
        let snapshot = agg.snapshot(400);
        assert_eq!(snapshot.alerts.len(), 1);
        let merged = &snapshot.alerts[0];
        assert_eq!(merged.validity, TimeWindow::new(100, 1_500));
        assert_eq!(merged.sources, vec!["rsu-1".to_string(), "rsu-2".to_string()]);
        assert!(snapshot.blocking_in(&[1, 2], 400).is_some());
        assert!(snapshot.blocking_in(&[0, 3], 400).is_none());
        assert!(snapshot.blocking_in(&[2], 50).is_none());
    }

    #[test]
    fn only_the_raising_source_can_retract() {
        let mut agg = AlertAggregator::new(CorroborationPolicy::SourceRetraction);
        agg.ingest(claim("rsu-1", AlertKind::Hazard, AlertStatus::Active, 0, (0, 5_000)), 0);
        agg.ingest(claim("rsu-2", AlertKind::Hazard, AlertStatus::Clear, 10, (0, 5_000)), 10);
        assert_eq!(agg.snapshot(20).alerts.len(), 1);

        agg.ingest(claim("rsu-1", AlertKind::Hazard, AlertStatus::Clear, 30, (0, 5_000)), 30);
        assert!(agg.snapshot(40).is_empty());
    }

    #[test]
    fn majority_policy_needs_strictly_more_clears() {
        let mut agg = AlertAggregator::new(CorroborationPolicy::Majority);
        agg.ingest(claim("rsu-1", AlertKind::Hazard, AlertStatus::Active, 0, (0, 5_000)), 0);
        agg.ingest(claim("rsu-2", AlertKind::Hazard, AlertStatus::Clear, 0, (0, 5_000)), 0);
        // One against one is a tie; the hazard stands.
        assert_eq!(agg.snapshot(10).alerts.len(), 1);
        agg.ingest(claim("rsu-3", AlertKind::Hazard, AlertStatus::Clear, 0, (0, 5_000)), 0);
        assert!(agg.snapshot(10).is_empty());
    }

    #[test]
    fn stale_and_expired_claims_are_ignored() {
        let mut agg = AlertAggregator::new(CorroborationPolicy::SourceRetraction);
        assert!(!agg.ingest(claim("rsu-1", AlertKind::Pedestrian, AlertStatus::Active, 0, (0, 100)), 100));
        assert!(agg.ingest(claim("rsu-1", AlertKind::Pedestrian, AlertStatus::Clear, 50, (0, 1_000)), 100));
        assert!(!agg.ingest(claim("rsu-1", AlertKind::Pedestrian, AlertStatus::Active, 40, (0, 1_000)), 110));
        assert!(agg.snapshot(120).is_empty());
    }

    #[test]
    fn expiry_is_purged_eagerly() {
        let mut agg = AlertAggregator::new(CorroborationPolicy::SourceRetraction);
        agg.ingest(claim("rsu-1", AlertKind::EmergencyVehicle, AlertStatus::Active, 0, (0, 500)), 0);
        assert!(agg.snapshot(100).override_active(2, 100));
        assert!(!agg.snapshot(500).override_active(2, 500));
        assert_eq!(agg.purge_expired(500), 1);
        assert_eq!(agg.purge_expired(600), 0);
    }

    #[test]
    fn silent_sources_without_live_claims_are_forgotten() {
        let mut agg = AlertAggregator::new(CorroborationPolicy::SourceRetraction);
        agg.ingest(claim("rsu-1", AlertKind::Hazard, AlertStatus::Active, 0, (0, 500)), 0);
        agg.ingest(claim("rsu-2", AlertKind::Hazard, AlertStatus::Active, 0, (0, 60_000)), 0);
        agg.purge_expired(3_000);
        assert_eq!(agg.forget_silent(3_000, 2_000), vec!["rsu-1".to_string()]);
        assert_eq!(agg.silent_sources(3_000, 1_500), vec!["rsu-2".to_string()]);
        assert!(agg.forget_silent(3_100, 2_000).is_empty());
        assert!(agg.has_heard_any());
    }

    #[test]
    fn silent_sources_are_reported() {
        let mut agg = AlertAggregator::new(CorroborationPolicy::SourceRetraction);
        assert!(!agg.has_heard_any());
        agg.ingest(claim("rsu-1", AlertKind::Hazard, AlertStatus::Clear, 0, (0, 100)), 0);
        agg.ingest(claim("rsu-2", AlertKind::Hazard, AlertStatus::Clear, 0, (0, 2_000)), 1_000);
        assert_eq!(agg.silent_sources(1_600, 1_500), vec!["rsu-1".to_string()]);
    }
}
