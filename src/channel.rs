//! Modelled radio: an unreliable broadcast medium and per-endpoint mailboxes.
//!
//! Every send fans out to all other attached endpoints. Each copy is
//! independently dropped, duplicated, corrupted, and delayed according to the
//! [`LinkProfile`], driven by one seeded RNG so a run can be replayed. Sending
//! never blocks and nothing is acknowledged.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::codec::WireFormat;
use crate::config::LinkProfile;
use crate::types::Millis;

/// A payload as seen by the receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub bytes: Vec<u8>,
    pub sent_at: Millis,
    pub received_at: Millis,
}

/// Size of what was put on the air in one wire form, counted once per send.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameSizes {
    pub frames: u64,
    pub bytes: u64,
    pub max_frame: usize,
}

impl FrameSizes {
    fn record(&mut self, len: usize) {
        self.frames += 1;
        self.bytes += len as u64;
        self.max_frame = self.max_frame.max(len);
    }
}

/// Counters over the lifetime of a medium.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub corrupted: u64,
    pub binary: FrameSizes,
    pub json: FrameSizes,
}

impl LinkStats {
    pub fn sizes(&self, format: WireFormat) -> &FrameSizes {
        match format {
            WireFormat::Binary => &self.binary,
            WireFormat::Json => &self.json,
        }
    }
}

struct Pending {
    deliver_at: Millis,
    order: u64,
    bytes: Vec<u8>,
    sent_at: Millis,
}

struct MediumState {
    rng: StdRng,
    profile: LinkProfile,
    inboxes: BTreeMap<String, Vec<Pending>>,
    next_order: u64,
    stats: LinkStats,
}

pub struct BroadcastMedium {
    state: Mutex<MediumState>,
}

impl BroadcastMedium {
    pub fn new(profile: LinkProfile, seed: u64) -> Self {
        Self {
            state: Mutex::new(MediumState {
                rng: StdRng::seed_from_u64(seed),
                profile,
                inboxes: BTreeMap::new(),
                next_order: 0,
                stats: LinkStats::default(),
            }),
        }
    }

    /// Register an endpoint and hand back its mailbox. Re-attaching an
    /// existing endpoint keeps its pending deliveries.
    pub fn attach(self: &Arc<Self>, endpoint: impl Into<String>) -> NegotiationChannel {
        let endpoint = endpoint.into();
        let mut guard = self.state.lock().expect("medium mutex poisoned");
        guard.inboxes.entry(endpoint.clone()).or_default();
        NegotiationChannel {
            endpoint,
            medium: Arc::clone(self),
        }
    }

    /// Stop delivering to `endpoint` and discard what it has not read.
    pub fn detach(&self, endpoint: &str) {
        let mut guard = self.state.lock().expect("medium mutex poisoned");
        if let Some(unread) = guard.inboxes.remove(endpoint) {
            trace!(endpoint, unread = unread.len(), "endpoint detached");
        }
    }

    pub fn stats(&self) -> LinkStats {
        self.state.lock().expect("medium mutex poisoned").stats
    }

    fn broadcast(&self, from: &str, bytes: &[u8], now: Millis) {
        let mut guard = self.state.lock().expect("medium mutex poisoned");
        let state = &mut *guard;
        state.stats.sent += 1;
        match WireFormat::of(bytes) {
            WireFormat::Binary => state.stats.binary.record(bytes.len()),
            WireFormat::Json => state.stats.json.record(bytes.len()),
        }
        let profile = state.profile.clone();
        for (endpoint, inbox) in state.inboxes.iter_mut() {
            if endpoint == from {
                continue;
            }
            if state.rng.gen_bool(profile.loss) {
                state.stats.dropped += 1;
                trace!(from, to = %endpoint, "frame lost");
                continue;
            }
            let copies = if state.rng.gen_bool(profile.duplicate) {
                state.stats.duplicated += 1;
                2
            } else {
                1
            };
            for _ in 0..copies {
                let mut copy = bytes.to_vec();
                if !copy.is_empty() && state.rng.gen_bool(profile.corrupt) {
                    let index = state.rng.gen_range(0..copy.len());
                    copy[index] ^= 1 << state.rng.gen_range(0..8u32);
                    state.stats.corrupted += 1;
                }
                let delay = state
                    .rng
                    .gen_range(profile.min_delay_ms..=profile.max_delay_ms);
                inbox.push(Pending {
                    deliver_at: now + delay,
                    order: state.next_order,
                    bytes: copy,
                    sent_at: now,
                });
                state.next_order += 1;
            }
        }
    }

    fn take_due(&self, endpoint: &str, now: Millis) -> Vec<Delivery> {
        let mut guard = self.state.lock().expect("medium mutex poisoned");
        let state = &mut *guard;
        let Some(inbox) = state.inboxes.get_mut(endpoint) else {
            return Vec::new();
        };
        let (mut due, waiting): (Vec<Pending>, Vec<Pending>) = std::mem::take(inbox)
            .into_iter()
            .partition(|pending| pending.deliver_at <= now);
        *inbox = waiting;
        due.sort_by_key(|pending| (pending.deliver_at, pending.order));
        state.stats.delivered += due.len() as u64;
        due.into_iter()
            .map(|pending| Delivery {
                bytes: pending.bytes,
                sent_at: pending.sent_at,
                received_at: now,
            })
            .collect()
    }
}

/// One endpoint's view of the medium.
pub struct NegotiationChannel {
    endpoint: String,
    medium: Arc<BroadcastMedium>,
}

impl NegotiationChannel {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Fire-and-forget broadcast to every other endpoint.
    pub fn send(&self, bytes: &[u8], now: Millis) {
        self.medium.broadcast(&self.endpoint, bytes, now);
    }

    /// Deliveries that have arrived by `now`, oldest first. Never blocks.
    pub fn poll(&self, now: Millis) -> Vec<Delivery> {
        self.medium.take_due(&self.endpoint, now)
    }
}
