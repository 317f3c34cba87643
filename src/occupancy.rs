use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use tracing::error;

use crate::types::{Millis, VehicleId, ZoneId};

/// Two vehicles physically inside one cell at the same time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellConflict {
    pub zone: ZoneId,
    pub occupants: Vec<VehicleId>,
    pub at: Millis,
}

#[derive(Default)]
struct AuditState {
    cells: BTreeMap<ZoneId, BTreeSet<VehicleId>>,
    max_occupancy: usize,
    conflicts: Vec<CellConflict>,
    crossings: usize,
}

/// Ground-truth record of which vehicles are physically inside which cell.
///
/// Fed by the simulated plants, never by the agents, so it catches any
/// disagreement between negotiated reservations and where vehicles really are.
pub struct OccupancyAudit {
    state: Mutex<AuditState>,
}

impl OccupancyAudit {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AuditState::default()),
        }
    }

    /// A vehicle crossed the entry line; it occupies every cell of its path
    /// until it exits. Returns the largest per-cell head count it produced.
    pub fn enter(&self, vehicle: &VehicleId, cells: &[ZoneId], at: Millis) -> usize {
        let mut guard = self.state.lock().expect("occupancy mutex poisoned");
        let mut peak = 0;
        for &zone in cells {
            let occupants = guard.cells.entry(zone).or_default();
            occupants.insert(vehicle.clone());
            let count = occupants.len();
            let snapshot: Vec<VehicleId> = occupants.iter().cloned().collect();
            peak = peak.max(count);
            if count > 1 {
                error!(zone, occupants = ?snapshot, at, "cell physically shared");
                guard.conflicts.push(CellConflict {
                    zone,
                    occupants: snapshot,
                    at,
                });
            }
        }
        guard.max_occupancy = guard.max_occupancy.max(peak);
        guard.crossings += 1;
        peak
    }

    /// A vehicle left the box. Returns `false` if it was not recorded in
    /// every listed cell.
    pub fn exit(&self, vehicle: &VehicleId, cells: &[ZoneId]) -> bool {
        let mut guard = self.state.lock().expect("occupancy mutex poisoned");
        let mut consistent = true;
        for zone in cells {
            let removed = guard
                .cells
                .get_mut(zone)
                .is_some_and(|occupants| occupants.remove(vehicle));
            if !removed {
                if !cfg!(debug_assertions) {
                    error!(zone, %vehicle, "exit from a cell the vehicle never entered");
                }
                debug_assert!(
                    false,
                    "exit by non-occupant: zone={zone} vehicle={vehicle}"
                );
                consistent = false;
            }
        }
        guard.cells.retain(|_, occupants| !occupants.is_empty());
        consistent
    }

    #[cfg(test)]
    pub fn occupied_cells(&self) -> BTreeSet<ZoneId> {
        let guard = self.state.lock().expect("occupancy mutex poisoned");
        guard.cells.keys().copied().collect()
    }

    pub fn max_occupancy(&self) -> usize {
        self.state.lock().expect("occupancy mutex poisoned").max_occupancy
    }

    pub fn has_violation(&self) -> bool {
        !self
            .state
            .lock()
            .expect("occupancy mutex poisoned")
            .conflicts
            .is_empty()
    }

    pub fn conflicts(&self) -> Vec<CellConflict> {
        self.state
            .lock()
            .expect("occupancy mutex poisoned")
            .conflicts
            .clone()
    }

    /// Completed and in-progress crossings recorded so far.
    pub fn crossings(&self) -> usize {
        self.state.lock().expect("occupancy mutex poisoned").crossings
    }
}

impl Default for OccupancyAudit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn disjoint_paths_never_conflict_under_contention() {
        let audit = Arc::new(OccupancyAudit::new());
        let contenders = 4;
        let barrier = Arc::new(Barrier::new(contenders));

        let mut handles = Vec::new();
        for cell in 0..contenders {
            let audit = Arc::clone(&audit);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                let vehicle = VehicleId::new(format!("v{cell}"));
                let cells = [cell as ZoneId];
                barrier.wait();
                for round in 0..5 {
                    assert_eq!(audit.enter(&vehicle, &cells, round), 1);
                    thread::sleep(Duration::from_millis(2));
                    assert!(audit.exit(&vehicle, &cells));
                }
            }));
        }
        for handle in handles {
            handle.join().expect("audit thread panicked");
        }

        assert!(!audit.has_violation());
        assert_eq!(audit.max_occupancy(), 1);
        assert_eq!(audit.crossings(), 20);
        assert!(audit.occupied_cells().is_empty());
    }

    #[test]
    fn shared_cell_is_flagged() {
        let audit = OccupancyAudit::new();
        let a = VehicleId::new("A");
        let b = VehicleId::new("B");
        audit.enter(&a, &[2, 1], 100);
        assert_eq!(audit.enter(&b, &[1, 0], 150), 2);
        let conflicts = audit.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].zone, 1);
        assert_eq!(conflicts[0].occupants, vec![a.clone(), b.clone()]);
        assert!(audit.exit(&a, &[2, 1]));
        assert_eq!(audit.occupied_cells(), BTreeSet::from([0, 1]));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "exit by non-occupant")]
    fn exit_by_non_occupant_panics_in_debug() {
        let audit = OccupancyAudit::new();
        audit.enter(&VehicleId::new("A"), &[3], 0);
        audit.exit(&VehicleId::new("B"), &[3]);
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn exit_by_non_occupant_fails_and_keeps_cell() {
        let audit = OccupancyAudit::new();
        audit.enter(&VehicleId::new("A"), &[3], 0);
        assert!(!audit.exit(&VehicleId::new("B"), &[3]));
        assert!(audit.occupied_cells().contains(&3));
    }
}
