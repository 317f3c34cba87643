//! Deterministic crossing-order computation.
//!
//! Every agent runs [`schedule`] over its own view of the intersection. The
//! result depends only on the intents, the alert snapshot, the configuration,
//! and `now` (through staleness and alert activity), never on arrival order or
//! hash iteration, so agents holding the same view compute the same order.
//!
//! The algorithm:
//!
//! 1. Keep each sender's latest intent and drop stale or non-claiming ones.
//! 2. Give every vehicle a [`PriorityKey`] and sort globally.
//! 3. Place fixed occupants first: crossing vehicles at their declared window
//!    and blocking alerts at their validity. Overlaps between fixed occupants
//!    are reported as [`ReservationViolation`]s.
//! 4. Walk the global order and place each vehicle in every cell it sweeps at
//!    the earliest start that is no earlier than its requested entry, after
//!    the previous vehicle placed in that cell, and clear of fixed occupants.
//!    A vehicle whose cells disagree on that start is moved to the latest
//!    candidate and re-fitted until all cells agree.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, warn};

use crate::config::CoordinatorConfig;
use crate::error::CoordinationError;
use crate::infrastructure::AlertSnapshot;
use crate::types::{
    AlertKind, IntentMessage, IntentStatus, Millis, PriorityClass, SourceId, TimeWindow,
    VehicleId, ZoneId,
};
use crate::zones::ConflictMap;

/// Coarse priority band; lower sorts first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PriorityTier {
    /// Already inside the box; its slot cannot move.
    Locked,
    /// Emergency vehicle covered by an active roadside override.
    Override,
    /// Holds a commitment that nothing above has invalidated.
    Committed,
    /// Waited past the starvation deadline.
    Escalated,
    Emergency,
    Normal,
    PedestrianYield,
}

/// Total scheduling order: tier, then adjusted entry time, then vehicle id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PriorityKey {
    pub tier: PriorityTier,
    pub entry: Millis,
    pub vehicle: VehicleId,
}

impl PriorityKey {
    pub fn for_intent(
        intent: &IntentMessage,
        alerts: &AlertSnapshot,
        now: Millis,
        config: &CoordinatorConfig,
    ) -> Self {
        let requested = intent.window.start;
        let waited = intent.waited();
        let override_held = intent.class == PriorityClass::Emergency
            && intent
                .zones
                .iter()
                .any(|zone| alerts.override_active(*zone, now));

        let (tier, entry) = if intent.status == IntentStatus::Crossing {
            (PriorityTier::Locked, requested)
        } else if override_held {
            (PriorityTier::Override, requested)
        } else if intent.status == IntentStatus::Committed {
            (PriorityTier::Committed, requested)
        } else if waited > config.starvation_deadline_ms {
            let overdue = waited - config.starvation_deadline_ms;
            let bonus = overdue.saturating_mul(config.starvation_bonus_permille) / 1_000;
            (PriorityTier::Escalated, requested.saturating_sub(bonus))
        } else {
            let tier = match intent.class {
                PriorityClass::Emergency => PriorityTier::Emergency,
                PriorityClass::Normal => PriorityTier::Normal,
                PriorityClass::PedestrianYieldRequired => PriorityTier::PedestrianYield,
            };
            (tier, requested)
        };

        Self {
            tier,
            entry,
            vehicle: intent.sender.clone(),
        }
    }
}

/// What holds a slot in a cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Occupant {
    Vehicle(VehicleId),
    Blocker {
        kind: AlertKind,
        sources: Vec<SourceId>,
    },
}

impl Occupant {
    pub fn vehicle(&self) -> Option<&VehicleId> {
        match self {
            Occupant::Vehicle(id) => Some(id),
            Occupant::Blocker { .. } => None,
        }
    }
}

impl fmt::Display for Occupant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Occupant::Vehicle(id) => write!(f, "vehicle {id}"),
            Occupant::Blocker { kind, sources } => {
                write!(f, "{kind:?} alert from [{}]", sources.join(","))
            }
        }
    }
}

/// One occupancy interval in a cell. `window` includes the safety margin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneSlot {
    pub occupant: Occupant,
    pub window: TimeWindow,
    pub fixed: bool,
}

/// Scheduled slot of one vehicle, identical in every cell it sweeps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub vehicle: VehicleId,
    /// 1-based position in the global order.
    pub rank: u32,
    pub tier: PriorityTier,
    pub status: IntentStatus,
    pub zones: Vec<ZoneId>,
    /// Occupancy followed by the safety margin.
    pub window: TimeWindow,
    /// Occupancy alone.
    pub occupancy: TimeWindow,
}

/// Two fixed occupants of one cell overlapping in time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservationViolation {
    pub zone: ZoneId,
    pub first: Occupant,
    pub second: Occupant,
    pub overlap: TimeWindow,
}

impl ReservationViolation {
    pub fn involves(&self, vehicle: &VehicleId) -> bool {
        self.first.vehicle() == Some(vehicle) || self.second.vehicle() == Some(vehicle)
    }
}

impl fmt::Display for ReservationViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "zone {}: {} overlaps {} during {}",
            self.zone, self.first, self.second, self.overlap
        )
    }
}

/// A vehicle whose cells proposed different starts and had to be moved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerAnomaly {
    pub vehicle: VehicleId,
    pub earliest: Millis,
    pub latest: Millis,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Schedule {
    pub order: Vec<VehicleId>,
    pub assignments: BTreeMap<VehicleId, Assignment>,
    /// Slots per cell, by window start.
    pub zones: BTreeMap<ZoneId, Vec<ZoneSlot>>,
    pub anomalies: Vec<SchedulerAnomaly>,
    pub violations: Vec<ReservationViolation>,
    /// Claiming vehicles left out because their intent was too old.
    pub stale: Vec<VehicleId>,
}

impl Schedule {
    pub fn assignment(&self, vehicle: &VehicleId) -> Option<&Assignment> {
        self.assignments.get(vehicle)
    }

    /// Slots placed before `vehicle`'s own slot in each of its cells.
    pub fn slots_ahead(&self, vehicle: &VehicleId) -> Vec<(ZoneId, &ZoneSlot)> {
        let Some(assignment) = self.assignments.get(vehicle) else {
            return Vec::new();
        };
        let mut ahead = Vec::new();
        for zone in &assignment.zones {
            let Some(slots) = self.zones.get(zone) else {
                continue;
            };
            for slot in slots {
                if slot.occupant.vehicle() == Some(vehicle) {
                    break;
                }
                ahead.push((*zone, slot));
            }
        }
        ahead
    }

    pub fn violations_in<'a>(
        &'a self,
        zones: &'a [ZoneId],
    ) -> impl Iterator<Item = &'a ReservationViolation> {
        self.violations
            .iter()
            .filter(move |violation| zones.contains(&violation.zone))
    }
}

struct Candidate<'a> {
    intent: &'a IntentMessage,
    key: PriorityKey,
    zones: Vec<ZoneId>,
}

#[derive(Default)]
struct Lane {
    fixed: Vec<TimeWindow>,
    /// End of the last non-fixed slot placed.
    placed_end: Millis,
    slots: Vec<ZoneSlot>,
}

impl Lane {
    /// Earliest start at or after `floor` for an interval of `len` that is
    /// clear of fixed occupants and follows the last placed slot.
    fn fit(&self, floor: Millis, len: Millis) -> Millis {
        let mut start = floor.max(self.placed_end);
        for fixed in &self.fixed {
            if fixed.end <= start {
                continue;
            }
            if fixed.start >= start.saturating_add(len) {
                break;
            }
            start = fixed.end;
        }
        start
    }
}

/// Compute the crossing order for the known intents and alerts.
pub fn schedule(
    intents: &[IntentMessage],
    alerts: &AlertSnapshot,
    now: Millis,
    config: &CoordinatorConfig,
) -> Result<Schedule, CoordinationError> {
    let margin = config.safety_margin_ms;

    let mut latest: BTreeMap<&VehicleId, &IntentMessage> = BTreeMap::new();
    for intent in intents {
        let newer = latest
            .get(&intent.sender)
            .is_none_or(|known| precedence(intent) > precedence(known));
        if newer {
            latest.insert(&intent.sender, intent);
        }
    }

    // Cells an emergency vehicle has announced itself in, whatever its status.
    let emergency_cells: BTreeSet<ZoneId> = latest
        .values()
        .filter(|intent| intent.class == PriorityClass::Emergency)
        .flat_map(|intent| intent.zones.iter().copied())
        .collect();

    let mut stale = Vec::new();
    let mut eligible = Vec::new();
    for intent in latest.values().copied() {
        if !intent.status.is_schedulable() {
            continue;
        }
        if now.saturating_sub(intent.timestamp) > config.staleness_age_ms {
            stale.push(intent.sender.clone());
            continue;
        }
        eligible.push(intent);
    }

    let mut candidates: Vec<Candidate<'_>> = eligible
        .iter()
        .map(|intent| {
            let zones: BTreeSet<ZoneId> = intent.zones.iter().copied().collect();
            Candidate {
                intent,
                key: PriorityKey::for_intent(intent, alerts, now, config),
                zones: zones.into_iter().collect(),
            }
        })
        .collect();
    candidates.sort_by(|a, b| a.key.cmp(&b.key));

    let conflicts = ConflictMap::build(eligible.iter().copied());
    let mut lanes: BTreeMap<ZoneId, Lane> = conflicts
        .zones()
        .map(|zone| (zone.zone, Lane::default()))
        .collect();

    // Fixed occupants: blocking alerts, then vehicles already inside.
    let mut fixed: BTreeMap<ZoneId, Vec<(Occupant, TimeWindow, TimeWindow)>> = BTreeMap::new();
    for alert in &alerts.alerts {
        if alert.validity.end <= now {
            continue;
        }
        let blocks = alert.kind.blocks_zone()
            || (alert.kind == AlertKind::EmergencyVehicle
                && alert.override_priority
                && !emergency_cells.contains(&alert.zone));
        if !blocks {
            continue;
        }
        fixed.entry(alert.zone).or_default().push((
            Occupant::Blocker {
                kind: alert.kind,
                sources: alert.sources.clone(),
            },
            alert.validity,
            alert.validity.padded(margin),
        ));
    }
    for candidate in &candidates {
        if candidate.key.tier != PriorityTier::Locked {
            continue;
        }
        let occupancy = candidate.intent.window;
        for zone in &candidate.zones {
            fixed.entry(*zone).or_default().push((
                Occupant::Vehicle(candidate.intent.sender.clone()),
                occupancy,
                occupancy.padded(margin),
            ));
        }
    }

    let mut violations = Vec::new();
    for (zone, occupants) in &mut fixed {
        occupants.sort_by(|a, b| (a.2.start, a.2.end).cmp(&(b.2.start, b.2.end)));
        for (i, (first, first_raw, _)) in occupants.iter().enumerate() {
            for (second, second_raw, _) in &occupants[i + 1..] {
                if let Some(overlap) = first_raw.intersection(second_raw) {
                    let violation = ReservationViolation {
                        zone: *zone,
                        first: first.clone(),
                        second: second.clone(),
                        overlap,
                    };
                    warn!(%violation, "reservation violation");
                    violations.push(violation);
                }
            }
        }
        let lane = lanes.entry(*zone).or_default();
        for (occupant, _, padded) in occupants.iter() {
            lane.fixed.push(*padded);
            lane.slots.push(ZoneSlot {
                occupant: occupant.clone(),
                window: *padded,
                fixed: true,
            });
        }
    }

    let mut order = Vec::with_capacity(candidates.len());
    let mut assignments = BTreeMap::new();
    let mut anomalies = Vec::new();

    for (index, candidate) in candidates.iter().enumerate() {
        let intent = candidate.intent;
        let rank = index as u32 + 1;
        order.push(intent.sender.clone());

        let (occupancy, window) = if candidate.key.tier == PriorityTier::Locked {
            (intent.window, intent.window.padded(margin))
        } else {
            let len = intent.window.duration().saturating_add(margin);
            let start = reconcile(candidate, &lanes, len, &mut anomalies)?;
            let window = TimeWindow::spanning(start, len);
            for zone in &candidate.zones {
                let lane = lanes.entry(*zone).or_default();
                lane.placed_end = window.end;
                lane.slots.push(ZoneSlot {
                    occupant: Occupant::Vehicle(intent.sender.clone()),
                    window,
                    fixed: false,
                });
            }
            (TimeWindow::spanning(start, intent.window.duration()), window)
        };

        assignments.insert(
            intent.sender.clone(),
            Assignment {
                vehicle: intent.sender.clone(),
                rank,
                tier: candidate.key.tier,
                status: intent.status,
                zones: candidate.zones.clone(),
                window,
                occupancy,
            },
        );
    }

    let zones = lanes
        .into_iter()
        .map(|(zone, mut lane)| {
            // Stable: fixed occupants precede vehicles placed at the same start.
            lane.slots.sort_by_key(|slot| (slot.window.start, !slot.fixed));
            (zone, lane.slots)
        })
        .collect();

    Ok(Schedule {
        order,
        assignments,
        zones,
        anomalies,
        violations,
        stale,
    })
}

/// Supersession order over every field the scheduler reads, so that two
/// copies of one revision with different content still resolve the same way
/// on every agent.
fn precedence(
    intent: &IntentMessage,
) -> (
    (u32, u64),
    Millis,
    Millis,
    TimeWindow,
    IntentStatus,
    PriorityClass,
    &[ZoneId],
) {
    (
        intent.revision(),
        intent.timestamp,
        intent.waiting_since,
        intent.window,
        intent.status,
        intent.class,
        &intent.zones,
    )
}

/// Start time every cell of `candidate` agrees on.
fn reconcile(
    candidate: &Candidate<'_>,
    lanes: &BTreeMap<ZoneId, Lane>,
    len: Millis,
    anomalies: &mut Vec<SchedulerAnomaly>,
) -> Result<Millis, CoordinationError> {
    let fit_all = |floor: Millis| -> Vec<Millis> {
        candidate
            .zones
            .iter()
            .map(|zone| lanes.get(zone).map_or(floor, |lane| lane.fit(floor, len)))
            .collect()
    };

    // Each retry moves past at least one fixed occupant.
    let max_rounds = candidate
        .zones
        .iter()
        .filter_map(|zone| lanes.get(zone))
        .map(|lane| lane.fixed.len())
        .sum::<usize>()
        + 2;

    let mut floor = candidate.intent.window.start;
    for round in 0..max_rounds {
        let starts = fit_all(floor);
        let earliest = starts.iter().copied().min().unwrap_or(floor);
        let latest = starts.iter().copied().max().unwrap_or(floor);
        if earliest == latest {
            return Ok(latest);
        }
        if round == 0 {
            debug!(
                vehicle = %candidate.intent.sender,
                earliest,
                latest,
                "cells disagree on start, forcing later window"
            );
            anomalies.push(SchedulerAnomaly {
                vehicle: candidate.intent.sender.clone(),
                earliest,
                latest,
            });
        }
        floor = latest;
    }
    Err(CoordinationError::SchedulerInconsistency {
        vehicle: candidate.intent.sender.clone(),
        rounds: max_rounds,
    })
}
