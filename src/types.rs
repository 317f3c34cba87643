//! Shared identifiers, time model, and protocol records used across the system.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical time in milliseconds. Every agent and message uses this unit.
pub type Millis = u64;
/// Latest time any record may mention. Windows past it are refused on the
/// wire, which keeps window arithmetic far from overflow.
pub const TIME_HORIZON: Millis = Millis::MAX / 4;
/// Identifier of a conflict cell inside the intersection.
pub type ZoneId = u8;
/// Identifier of a roadside (V2I) source.
pub type SourceId = String;

/// Identifier of a vehicle, unique per session. Ordered lexicographically.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(String);

impl VehicleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Closed set of vehicle priority classes.
///
/// Declaration order is the scheduling order: emergency vehicles first,
/// vehicles that must yield to pedestrians last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Emergency,
    Normal,
    PedestrianYieldRequired,
}

impl PriorityClass {
    pub fn to_byte(self) -> u8 {
        match self {
            PriorityClass::Emergency => 0,
            PriorityClass::Normal => 1,
            PriorityClass::PedestrianYieldRequired => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PriorityClass::Emergency),
            1 => Some(PriorityClass::Normal),
            2 => Some(PriorityClass::PedestrianYieldRequired),
            _ => None,
        }
    }
}

/// Planar vector in metres (position) or metres per second (velocity).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Closed-open time interval `[start, end)` in logical milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Millis,
    pub end: Millis,
}

impl TimeWindow {
    /// Build a window; an `end` before `start` collapses to an empty window.
    pub fn new(start: Millis, end: Millis) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn duration(&self) -> Millis {
        self.end.saturating_sub(self.start)
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, at: Millis) -> bool {
        self.start <= at && at < self.end
    }

    /// Window of `len` beginning at `start`, clamped at `Millis::MAX`.
    pub fn spanning(start: Millis, len: Millis) -> TimeWindow {
        TimeWindow::new(start, start.saturating_add(len))
    }

    /// Same window with `tail` appended to its end.
    pub fn padded(&self, tail: Millis) -> TimeWindow {
        TimeWindow::new(self.start, self.end.saturating_add(tail))
    }

    /// Overlapping part of two windows, if any.
    pub fn intersection(&self, other: &TimeWindow) -> Option<TimeWindow> {
        if !self.overlaps(other) {
            return None;
        }
        Some(TimeWindow::new(
            self.start.max(other.start),
            self.end.min(other.end),
        ))
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Kinematic snapshot of one vehicle as supplied by its perception adapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub id: VehicleId,
    pub position: Vec2,
    pub velocity: Vec2,
    /// Heading in radians, counter-clockwise from +x.
    pub heading: f64,
    /// Remaining distance to the conflict-zone entry line; negative once inside.
    pub distance_to_zone: f64,
    /// Speed the arrival estimates assume the vehicle will travel at.
    pub nominal_speed: f64,
    pub entry_estimate: Millis,
    pub exit_estimate: Millis,
    pub uncertainty_radius: f64,
    /// Perception confidence in `[0, 1]`.
    pub confidence: f64,
    pub class: PriorityClass,
    pub observed_at: Millis,
}

impl VehicleState {
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.entry_estimate, self.exit_estimate)
    }

    pub fn age(&self, now: Millis) -> Millis {
        now.saturating_sub(self.observed_at)
    }

    pub fn is_stale(&self, now: Millis, max_age: Millis) -> bool {
        self.age(now) > max_age
    }
}

/// Lifecycle status a sender attaches to each intent it broadcasts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Proposed,
    Committed,
    Retracted,
    Crossing,
    Cleared,
    Yielding,
}

impl IntentStatus {
    pub fn to_byte(self) -> u8 {
        match self {
            IntentStatus::Proposed => 0,
            IntentStatus::Committed => 1,
            IntentStatus::Retracted => 2,
            IntentStatus::Crossing => 3,
            IntentStatus::Cleared => 4,
            IntentStatus::Yielding => 5,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(IntentStatus::Proposed),
            1 => Some(IntentStatus::Committed),
            2 => Some(IntentStatus::Retracted),
            3 => Some(IntentStatus::Crossing),
            4 => Some(IntentStatus::Cleared),
            5 => Some(IntentStatus::Yielding),
            _ => None,
        }
    }

    /// Whether a vehicle in this status holds a claim on the intersection.
    pub fn is_schedulable(self) -> bool {
        matches!(
            self,
            IntentStatus::Proposed
                | IntentStatus::Retracted
                | IntentStatus::Committed
                | IntentStatus::Crossing
        )
    }

    /// Committed or crossing: the crossing slot is agreed.
    pub fn is_finalized(self) -> bool {
        matches!(self, IntentStatus::Committed | IntentStatus::Crossing)
    }
}

/// A vehicle's broadcast declaration of its planned crossing.
///
/// Immutable once sent. A newer `(epoch, sequence)` from the same sender
/// supersedes every older one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntentMessage {
    pub sender: VehicleId,
    pub epoch: u32,
    pub sequence: u64,
    pub status: IntentStatus,
    pub class: PriorityClass,
    pub position: Vec2,
    pub velocity: Vec2,
    pub heading: f64,
    pub uncertainty_radius: f64,
    /// Declared occupancy window (zone entry to zone exit).
    pub window: TimeWindow,
    /// Conflict cells the sender's trajectory passes through.
    pub zones: Vec<ZoneId>,
    /// Rank the sender computed for itself; 0 when unranked.
    pub proposed_rank: u32,
    pub timestamp: Millis,
    /// When the sender started negotiating for this crossing.
    pub waiting_since: Millis,
}

impl IntentMessage {
    pub fn revision(&self) -> (u32, u64) {
        (self.epoch, self.sequence)
    }

    pub fn supersedes(&self, other: &IntentMessage) -> bool {
        self.revision() > other.revision()
    }

    pub fn waited(&self) -> Millis {
        self.timestamp.saturating_sub(self.waiting_since)
    }
}

/// Kind of roadside alert.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Pedestrian,
    EmergencyVehicle,
    Hazard,
}

impl AlertKind {
    pub fn to_byte(self) -> u8 {
        match self {
            AlertKind::Pedestrian => 0,
            AlertKind::EmergencyVehicle => 1,
            AlertKind::Hazard => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(AlertKind::Pedestrian),
            1 => Some(AlertKind::EmergencyVehicle),
            2 => Some(AlertKind::Hazard),
            _ => None,
        }
    }

    /// Pedestrians and hazards physically occupy the zone.
    pub fn blocks_zone(self) -> bool {
        matches!(self, AlertKind::Pedestrian | AlertKind::Hazard)
    }
}

/// Whether a source claims the condition is present or has cleared.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Clear,
}

/// V2I alert about one conflict zone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureAlert {
    pub kind: AlertKind,
    pub zone: ZoneId,
    pub validity: TimeWindow,
    pub override_priority: bool,
    pub status: AlertStatus,
    pub source: SourceId,
    pub issued_at: Millis,
}

impl InfrastructureAlert {
    pub fn is_expired(&self, now: Millis) -> bool {
        now >= self.validity.end
    }

    pub fn in_effect(&self, now: Millis) -> bool {
        self.status == AlertStatus::Active && self.validity.contains(now)
    }
}

/// Control advisory handed to the actuation layer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Advisory {
    /// Cleared to enter the zone at the given speed (m/s).
    ProceedAtSpeed(f64),
    /// Approach, but stop before the zone entry line.
    Hold,
    /// Reduce speed and hold position where it is.
    Yield,
}

/// Agreed, exclusive crossing slot of one vehicle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub vehicle: VehicleId,
    pub zones: Vec<ZoneId>,
    /// Occupancy window, without the trailing safety margin.
    pub window: TimeWindow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_touching_at_boundary_do_not_overlap() {
        let a = TimeWindow::new(0, 100);
        let b = TimeWindow::new(100, 200);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&TimeWindow::new(99, 150)));
        assert_eq!(
            a.intersection(&TimeWindow::new(50, 150)),
            Some(TimeWindow::new(50, 100))
        );
    }

    #[test]
    fn padding_saturates_instead_of_wrapping() {
        let window = TimeWindow::new(100, Millis::MAX - 10);
        assert_eq!(window.padded(500).end, Millis::MAX);
        assert_eq!(TimeWindow::spanning(Millis::MAX - 1, 50).end, Millis::MAX);
        assert_eq!(TimeWindow::spanning(10, 5), TimeWindow::new(10, 15));
    }

    #[test]
    fn inverted_window_collapses() {
        let window = TimeWindow::new(50, 10);
        assert_eq!(window.duration(), 0);
        assert!(!window.contains(50));
    }

    #[test]
    fn priority_classes_order_emergency_first() {
        let mut classes = vec![
            PriorityClass::PedestrianYieldRequired,
            PriorityClass::Normal,
            PriorityClass::Emergency,
        ];
        classes.sort();
        assert_eq!(
            classes,
            vec![
                PriorityClass::Emergency,
                PriorityClass::Normal,
                PriorityClass::PedestrianYieldRequired
            ]
        );
    }

    #[test]
    fn newer_epoch_supersedes_higher_sequence() {
        let base = IntentMessage {
            sender: VehicleId::new("A"),
            epoch: 0,
            sequence: 40,
            status: IntentStatus::Proposed,
            class: PriorityClass::Normal,
            position: Vec2::default(),
            velocity: Vec2::default(),
            heading: 0.0,
            uncertainty_radius: 0.5,
            window: TimeWindow::new(0, 10),
            zones: vec![0],
            proposed_rank: 0,
            timestamp: 0,
            waiting_since: 0,
        };
        let reset = IntentMessage {
            epoch: 1,
            sequence: 1,
            ..base.clone()
        };
        assert!(reset.supersedes(&base));
        assert!(!base.supersedes(&reset));
    }
}
