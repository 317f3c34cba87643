//! Latest known intent per peer.

use std::collections::BTreeMap;

use crate::types::{IntentMessage, Millis, VehicleId};

/// Outcome of offering an intent to the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ingest {
    Accepted,
    /// Same revision as the stored one.
    Duplicate,
    /// Older revision than the stored one.
    Outdated,
}

#[derive(Clone, Debug)]
struct PeerEntry {
    intent: IntentMessage,
    received_at: Millis,
}

/// Supersession table keyed by sender. Only the highest `(epoch, sequence)`
/// seen from each sender is kept, so redelivery and reordering are harmless.
#[derive(Clone, Debug, Default)]
pub struct PeerTable {
    peers: BTreeMap<VehicleId, PeerEntry>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, intent: IntentMessage, received_at: Millis) -> Ingest {
        if let Some(existing) = self.peers.get(&intent.sender) {
            if intent.revision() == existing.intent.revision() {
                return Ingest::Duplicate;
            }
            if !intent.supersedes(&existing.intent) {
                return Ingest::Outdated;
            }
        }
        self.peers.insert(
            intent.sender.clone(),
            PeerEntry {
                intent,
                received_at,
            },
        );
        Ingest::Accepted
    }

    #[cfg(test)]
    pub fn get(&self, vehicle: &VehicleId) -> Option<&IntentMessage> {
        self.peers.get(vehicle).map(|entry| &entry.intent)
    }

    #[cfg(test)]
    pub fn received_at(&self, vehicle: &VehicleId) -> Option<Millis> {
        self.peers.get(vehicle).map(|entry| entry.received_at)
    }

    /// Latest intents in sender order.
    pub fn intents(&self) -> impl Iterator<Item = &IntentMessage> {
        self.peers.values().map(|entry| &entry.intent)
    }

    /// Drop peers not heard from for longer than `max_age`; returns them.
    pub fn forget_older_than(&mut self, now: Millis, max_age: Millis) -> Vec<VehicleId> {
        let expired: Vec<VehicleId> = self
            .peers
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.received_at) > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.peers.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IntentStatus, PriorityClass, TimeWindow, Vec2};

    fn intent(sender: &str, epoch: u32, sequence: u64) -> IntentMessage {
        IntentMessage {
            sender: VehicleId::new(sender),
            epoch,
            sequence,
            status: IntentStatus::Proposed,
            class: PriorityClass::Normal,
            position: Vec2::default(),
            velocity: Vec2::default(),
            heading: 0.0,
            uncertainty_radius: 0.5,
            window: TimeWindow::new(1_000, 2_000),
            zones: vec![1],
            proposed_rank: 0,
            timestamp: sequence * 100,
            waiting_since: 0,
        }
    }

    #[test]
    fn latest_revision_wins_regardless_of_arrival_order() {
        let mut table = PeerTable::new();
        assert_eq!(table.ingest(intent("B", 0, 5), 10), Ingest::Accepted);
        assert_eq!(table.ingest(intent("B", 0, 3), 11), Ingest::Outdated);
        assert_eq!(table.ingest(intent("B", 0, 5), 12), Ingest::Duplicate);
        assert_eq!(table.get(&VehicleId::new("B")).map(|i| i.sequence), Some(5));
        assert_eq!(table.received_at(&VehicleId::new("B")), Some(10));

        assert_eq!(table.ingest(intent("B", 1, 1), 13), Ingest::Accepted);
        assert_eq!(table.get(&VehicleId::new("B")).map(|i| i.epoch), Some(1));
    }

    #[test]
    fn silent_peers_are_forgotten() {
        let mut table = PeerTable::new();
        table.ingest(intent("A", 0, 1), 0);
        table.ingest(intent("C", 0, 1), 900);
        let forgotten = table.forget_older_than(1_500, 1_000);
        assert_eq!(forgotten, vec![VehicleId::new("A")]);
        assert_eq!(table.len(), 1);
        let remaining: Vec<_> = table.intents().map(|i| i.sender.as_str()).collect();
        assert_eq!(remaining, vec!["C"]);
    }
}
