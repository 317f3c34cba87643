//! Conflict-zone model of a four-way intersection.
//!
//! The box is split into a 2x2 grid of conflict cells, numbered clockwise
//! from the north-west corner:
//!
//! ```text
//!        N
//!    +---+---+
//!    | 0 | 1 |
//! W  +---+---+  E
//!    | 3 | 2 |
//!    +---+---+
//!        S
//! ```
//!
//! Traffic keeps right, so a vehicle enters the cell on its right-hand side of
//! the approach and sweeps counter-clockwise: one cell for a right turn, two
//! for straight through, three for a left turn.

use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::{FRAC_PI_2, PI};

use serde::{Deserialize, Serialize};

use crate::types::{IntentMessage, Millis, TIME_HORIZON, TimeWindow, Vec2, VehicleId, ZoneId};

pub const CELL_COUNT: ZoneId = 4;
/// Side length of the intersection box, metres.
pub const BOX_SIZE_M: f64 = 14.0;
const LANE_OFFSET_M: f64 = 1.75;

/// Side of the intersection a vehicle arrives from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approach {
    North,
    East,
    South,
    West,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Turn {
    Right,
    Straight,
    Left,
}

/// A planned path through the box.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Movement {
    pub approach: Approach,
    pub turn: Turn,
}

impl Movement {
    pub fn new(approach: Approach, turn: Turn) -> Self {
        Self { approach, turn }
    }

    pub fn entry_cell(self) -> ZoneId {
        match self.approach {
            Approach::North => 0,
            Approach::East => 1,
            Approach::South => 2,
            Approach::West => 3,
        }
    }

    /// Cells swept, in driving order.
    pub fn cells(self) -> Vec<ZoneId> {
        let swept = match self.turn {
            Turn::Right => 1,
            Turn::Straight => 2,
            Turn::Left => 3,
        };
        let entry = self.entry_cell();
        (0..swept)
            .map(|step| (entry + CELL_COUNT - step) % CELL_COUNT)
            .collect()
    }

    /// Length of the path inside the box, metres.
    pub fn path_length_m(self) -> f64 {
        match self.turn {
            Turn::Right => 8.0,
            Turn::Straight => BOX_SIZE_M,
            Turn::Left => 18.0,
        }
    }

    #[cfg(test)]
    pub fn conflicts_with(self, other: Movement) -> bool {
        let mine = self.cells();
        other.cells().iter().any(|cell| mine.contains(cell))
    }

    /// Time needed to clear the box at `speed` m/s, rounded up.
    pub fn occupancy_ms(self, speed: f64) -> Millis {
        if !(speed.is_finite() && speed > 0.0) {
            return TIME_HORIZON;
        }
        (self.path_length_m() * 1000.0 / speed).ceil() as Millis
    }

    /// Heading while approaching, radians counter-clockwise from +x.
    pub fn heading(self) -> f64 {
        match self.approach {
            Approach::South => FRAC_PI_2,
            Approach::North => -FRAC_PI_2,
            Approach::West => 0.0,
            Approach::East => PI,
        }
    }

    /// Position on the approach lane `distance` metres before the entry line.
    /// The box is centred on the origin. Positions past the line are pinned to
    /// the entry point.
    pub fn position_at(self, distance: f64) -> Vec2 {
        let back = BOX_SIZE_M / 2.0 + distance.max(0.0);
        match self.approach {
            Approach::South => Vec2::new(LANE_OFFSET_M, -back),
            Approach::North => Vec2::new(-LANE_OFFSET_M, back),
            Approach::West => Vec2::new(-back, -LANE_OFFSET_M),
            Approach::East => Vec2::new(back, LANE_OFFSET_M),
        }
    }
}

/// One vehicle's declared occupancy of a cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneClaim {
    pub vehicle: VehicleId,
    pub window: TimeWindow,
}

/// A conflict cell together with every known claim on it, ordered by
/// declared entry and then by vehicle id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictZone {
    pub zone: ZoneId,
    pub claims: Vec<ZoneClaim>,
}

impl ConflictZone {
    pub fn is_contested(&self) -> bool {
        self.claims.len() > 1
    }

    /// Pairs of claims closer than `margin` to each other.
    pub fn overlapping_pairs(&self, margin: Millis) -> Vec<(VehicleId, VehicleId)> {
        let mut pairs = Vec::new();
        for (i, first) in self.claims.iter().enumerate() {
            let padded = first.window.padded(margin);
            for second in &self.claims[i + 1..] {
                if padded.overlaps(&second.window) {
                    pairs.push((first.vehicle.clone(), second.vehicle.clone()));
                }
            }
        }
        pairs
    }
}

/// Partition of known intents by the cells they sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConflictMap {
    zones: BTreeMap<ZoneId, ConflictZone>,
}

impl ConflictMap {
    pub fn build<'a>(intents: impl IntoIterator<Item = &'a IntentMessage>) -> Self {
        let mut zones: BTreeMap<ZoneId, ConflictZone> = BTreeMap::new();
        for intent in intents {
            let cells: BTreeSet<ZoneId> = intent.zones.iter().copied().collect();
            for zone in cells {
                zones
                    .entry(zone)
                    .or_insert_with(|| ConflictZone {
                        zone,
                        claims: Vec::new(),
                    })
                    .claims
                    .push(ZoneClaim {
                        vehicle: intent.sender.clone(),
                        window: intent.window,
                    });
            }
        }
        for zone in zones.values_mut() {
            zone.claims
                .sort_by(|a, b| (a.window.start, &a.vehicle).cmp(&(b.window.start, &b.vehicle)));
        }
        Self { zones }
    }

    #[cfg(test)]
    pub fn zone(&self, zone: ZoneId) -> Option<&ConflictZone> {
        self.zones.get(&zone)
    }

    pub fn zones(&self) -> impl Iterator<Item = &ConflictZone> {
        self.zones.values()
    }

    /// Vehicles sharing at least one cell with `vehicle`, excluding itself.
    pub fn contenders_of(&self, vehicle: &VehicleId) -> BTreeSet<VehicleId> {
        self.zones
            .values()
            .filter(|zone| zone.claims.iter().any(|claim| &claim.vehicle == vehicle))
            .flat_map(|zone| zone.claims.iter().map(|claim| claim.vehicle.clone()))
            .filter(|other| other != vehicle)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IntentStatus, PriorityClass};

    fn intent(id: &str, zones: Vec<ZoneId>, start: Millis, end: Millis) -> IntentMessage {
        IntentMessage {
            sender: VehicleId::new(id),
            epoch: 0,
            sequence: 1,
            status: IntentStatus::Proposed,
            class: PriorityClass::Normal,
            position: Vec2::default(),
            velocity: Vec2::default(),
            heading: 0.0,
            uncertainty_radius: 0.5,
            window: TimeWindow::new(start, end),
            zones,
            proposed_rank: 0,
            timestamp: 0,
            waiting_since: 0,
        }
    }

    #[test]
    fn movements_sweep_expected_cells() {
        let from_south = |turn| Movement::new(Approach::South, turn).cells();
        assert_eq!(from_south(Turn::Right), vec![2]);
        assert_eq!(from_south(Turn::Straight), vec![2, 1]);
        assert_eq!(from_south(Turn::Left), vec![2, 1, 0]);
        assert_eq!(
            Movement::new(Approach::North, Turn::Straight).cells(),
            vec![0, 3]
        );
        assert_eq!(Movement::new(Approach::West, Turn::Left).cells(), vec![3, 2, 1]);
    }

    #[test]
    fn simultaneous_right_turns_never_conflict() {
        let approaches = [Approach::North, Approach::East, Approach::South, Approach::West];
        for a in approaches {
            for b in approaches {
                if a != b {
                    assert!(
                        !Movement::new(a, Turn::Right).conflicts_with(Movement::new(b, Turn::Right))
                    );
                }
            }
        }
    }

    #[test]
    fn left_turn_conflicts_with_opposing_through_traffic() {
        let left = Movement::new(Approach::South, Turn::Left);
        let opposing = Movement::new(Approach::North, Turn::Straight);
        assert!(left.conflicts_with(opposing));
        // Opposing straight movements use disjoint halves of the box.
        let northbound = Movement::new(Approach::South, Turn::Straight);
        assert!(!northbound.conflicts_with(opposing));
    }

    #[test]
    fn occupancy_rounds_up() {
        let straight = Movement::new(Approach::East, Turn::Straight);
        assert_eq!(straight.occupancy_ms(10.0), 1_400);
        assert_eq!(straight.occupancy_ms(3.0), 4_667);
    }

    #[test]
    fn positions_lie_on_the_approach_lane() {
        let movement = Movement::new(Approach::West, Turn::Straight);
        let far = movement.position_at(20.0);
        let near = movement.position_at(0.0);
        assert!(far.x < near.x);
        assert_eq!(near, Vec2::new(-BOX_SIZE_M / 2.0, -LANE_OFFSET_M));
        assert_eq!(movement.position_at(-3.0), near);
    }

    #[test]
    fn conflict_map_partitions_and_orders_claims() {
        let intents = [
            intent("B", vec![2, 1], 500, 1_500),
            intent("A", vec![1, 0], 500, 1_200),
            intent("C", vec![3], 0, 900),
        ];
        let map = ConflictMap::build(&intents);
        let cell_one = map.zone(1).expect("cell 1 claimed");
        let order: Vec<_> = cell_one.claims.iter().map(|c| c.vehicle.as_str()).collect();
        assert_eq!(order, vec!["A", "B"]);
        assert!(cell_one.is_contested());
        assert!(!map.zone(3).expect("cell 3 claimed").is_contested());
        assert_eq!(
            cell_one.overlapping_pairs(0),
            vec![(VehicleId::new("A"), VehicleId::new("B"))]
        );
        assert_eq!(
            map.contenders_of(&VehicleId::new("B")),
            BTreeSet::from([VehicleId::new("A")])
        );
        assert!(map.contenders_of(&VehicleId::new("C")).is_empty());
    }

    #[test]
    fn margin_widens_overlap_detection() {
        let intents = [intent("A", vec![0], 0, 1_000), intent("B", vec![0], 1_200, 2_000)];
        let map = ConflictMap::build(&intents);
        let zone = map.zone(0).expect("cell 0 claimed");
        assert!(zone.overlapping_pairs(0).is_empty());
        assert_eq!(zone.overlapping_pairs(500).len(), 1);
    }
}
