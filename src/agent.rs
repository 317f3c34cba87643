//! Vehicle negotiator: the per-vehicle coordination state machine.
//!
//! An agent owns all of its mutable state and is driven by one serialized
//! event stream (perception samples, radio payloads, roadside alerts, timer
//! ticks, and physical zone entry/exit). Each event yields a [`Reaction`]
//! listing the intents to broadcast and, when it changed, the advisory for
//! the actuation layer.
//!
//! ```text
//! Approaching -> Negotiating -> Committed -> Crossing -> Cleared
//!                    ^  |            |
//!                    +--+-- retract -+
//! any pre-crossing state -> Yielding | Aborting -> Approaching
//! ```

use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, info, warn};

use crate::codec::{self, Payload};
use crate::config::CoordinatorConfig;
use crate::error::CoordinationError;
use crate::fallback::{Degradation, FallbackController};
use crate::infrastructure::AlertAggregator;
use crate::peers::{Ingest, PeerTable};
use crate::scheduler::{self, Occupant, ReservationViolation, Schedule};
use crate::types::{
    Advisory, AlertKind, InfrastructureAlert, IntentMessage, IntentStatus, Millis,
    PriorityClass, Reservation, TimeWindow, VehicleId, VehicleState, ZoneId,
};
use crate::zones::ConflictMap;

/// Source of the vehicle's own kinematic state.
pub trait PerceptionAdapter {
    /// Current state, or `None` while perception has nothing to report.
    fn sample(&mut self, now: Millis) -> Option<VehicleState>;
}

/// Consumer of control advisories.
pub trait Actuator {
    fn apply(&mut self, advisory: Advisory);
}

#[derive(Clone, Debug, PartialEq)]
pub enum YieldReason {
    Degraded(Degradation),
    ZoneBlocked { zone: ZoneId, kind: AlertKind },
    SchedulerInconsistent,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AgentState {
    Approaching,
    Negotiating { since: Millis, cycles: u32 },
    Committed { reservation: Reservation },
    Crossing { reservation: Reservation },
    Cleared { rebroadcasts_left: u32 },
    Yielding { since: Millis, reason: YieldReason },
    Aborting { since: Millis },
}

/// State discriminant, for logging and reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AgentPhase {
    Approaching,
    Negotiating,
    Committed,
    Crossing,
    Cleared,
    Yielding,
    Aborting,
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentPhase::Approaching => "APPROACHING",
            AgentPhase::Negotiating => "NEGOTIATING",
            AgentPhase::Committed => "COMMITTED",
            AgentPhase::Crossing => "CROSSING",
            AgentPhase::Cleared => "CLEARED",
            AgentPhase::Yielding => "YIELDING",
            AgentPhase::Aborting => "ABORTING",
        };
        f.write_str(name)
    }
}

impl AgentState {
    pub fn phase(&self) -> AgentPhase {
        match self {
            AgentState::Approaching => AgentPhase::Approaching,
            AgentState::Negotiating { .. } => AgentPhase::Negotiating,
            AgentState::Committed { .. } => AgentPhase::Committed,
            AgentState::Crossing { .. } => AgentPhase::Crossing,
            AgentState::Cleared { .. } => AgentPhase::Cleared,
            AgentState::Yielding { .. } => AgentPhase::Yielding,
            AgentState::Aborting { .. } => AgentPhase::Aborting,
        }
    }
}

/// Inputs to the state machine.
#[derive(Clone, Debug)]
pub enum AgentEvent {
    Perception(VehicleState),
    /// Raw payload off the radio.
    Received(Vec<u8>),
    Intent(IntentMessage),
    Alert(InfrastructureAlert),
    Tick,
    ZoneEntered,
    ZoneExited,
}

/// An event stamped with the logical time it is processed at.
#[derive(Clone, Debug)]
pub struct InboundEvent {
    pub at: Millis,
    pub event: AgentEvent,
}

/// Everything an event caused.
#[derive(Debug, Default)]
pub struct Reaction {
    pub broadcasts: Vec<IntentMessage>,
    /// Set when the advisory differs from the last one emitted, or the phase
    /// changed.
    pub advisory: Option<Advisory>,
    pub transition: Option<(AgentPhase, AgentPhase)>,
    /// Reservation violations in this vehicle's cells not reported before.
    pub alarms: Vec<ReservationViolation>,
    /// Recoverable problem met while handling the event.
    pub error: Option<CoordinationError>,
}

impl Reaction {
    pub fn is_empty(&self) -> bool {
        self.broadcasts.is_empty()
            && self.advisory.is_none()
            && self.transition.is_none()
            && self.alarms.is_empty()
            && self.error.is_none()
    }
}

enum Decision {
    Stay,
    Commit(Reservation),
    Retract { missed: bool },
    Yield(YieldReason),
    Abort,
}

pub struct VehicleAgent {
    id: VehicleId,
    class: PriorityClass,
    zones: Vec<ZoneId>,
    config: CoordinatorConfig,
    state: AgentState,
    epoch: u32,
    sequence: u64,
    waiting_since: Option<Millis>,
    inside: bool,
    perception: Option<VehicleState>,
    peers: PeerTable,
    alerts: AlertAggregator,
    fallback: FallbackController,
    schedule: Option<Schedule>,
    reported_alarms: Vec<(ZoneId, String, String)>,
    last_advisory: Option<Advisory>,
}

impl VehicleAgent {
    pub fn new(
        id: VehicleId,
        class: PriorityClass,
        zones: Vec<ZoneId>,
        config: CoordinatorConfig,
    ) -> Self {
        let alerts = AlertAggregator::new(config.alert_corroboration);
        Self {
            id,
            class,
            zones,
            config,
            state: AgentState::Approaching,
            epoch: 0,
            sequence: 0,
            waiting_since: None,
            inside: false,
            perception: None,
            peers: PeerTable::new(),
            alerts,
            fallback: FallbackController::new(),
            schedule: None,
            reported_alarms: Vec::new(),
            last_advisory: None,
        }
    }

    pub fn id(&self) -> &VehicleId {
        &self.id
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn phase(&self) -> AgentPhase {
        self.state.phase()
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Most recent schedule computed by this agent.
    #[cfg(test)]
    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    pub fn reservation(&self) -> Option<&Reservation> {
        match &self.state {
            AgentState::Committed { reservation } | AgentState::Crossing { reservation } => {
                Some(reservation)
            }
            _ => None,
        }
    }

    pub fn handle(&mut self, event: AgentEvent, now: Millis) -> Reaction {
        let mut reaction = Reaction::default();
        let before = self.phase();

        let proceed = match event {
            AgentEvent::Perception(state) => self.on_perception(state, now, &mut reaction),
            AgentEvent::Received(bytes) => match codec::decode(&bytes) {
                Ok(Payload::Intent(intent)) => self.on_intent(intent, now, &mut reaction),
                Ok(Payload::Alert(alert)) => self.on_alert(alert, now, &mut reaction),
                Err(err) => {
                    debug!(vehicle = %self.id, error = %err, "discarding malformed payload");
                    reaction.error = Some(CoordinationError::MalformedMessage(err));
                    false
                }
            },
            AgentEvent::Intent(intent) => self.on_intent(intent, now, &mut reaction),
            AgentEvent::Alert(alert) => self.on_alert(alert, now, &mut reaction),
            AgentEvent::Tick => {
                self.on_tick(now, &mut reaction);
                true
            }
            AgentEvent::ZoneEntered => {
                self.on_zone_entered(now, &mut reaction);
                true
            }
            AgentEvent::ZoneExited => {
                self.on_zone_exited(now, &mut reaction);
                true
            }
        };
        if !proceed {
            return reaction;
        }

        let after = self.phase();
        if before != after {
            reaction.transition = Some((before, after));
        }
        let advisory = self.advisory(now);
        if reaction.transition.is_some() || self.last_advisory != Some(advisory) {
            self.last_advisory = Some(advisory);
            reaction.advisory = Some(advisory);
        }
        reaction
    }

    /// Control advisory for the current state.
    pub fn advisory(&self, now: Millis) -> Advisory {
        let cruise = self
            .perception
            .as_ref()
            .map_or(0.0, |state| state.nominal_speed);
        match &self.state {
            AgentState::Approaching => {
                let near = self
                    .perception
                    .as_ref()
                    .is_none_or(|state| state.distance_to_zone <= self.config.detection_horizon_m);
                if near {
                    Advisory::Hold
                } else {
                    Advisory::ProceedAtSpeed(cruise)
                }
            }
            AgentState::Negotiating { .. } => Advisory::Hold,
            AgentState::Committed { reservation } => {
                if now >= reservation.window.start {
                    Advisory::ProceedAtSpeed(cruise)
                } else {
                    Advisory::Hold
                }
            }
            AgentState::Crossing { .. } => {
                let alarmed = self.schedule.as_ref().is_some_and(|schedule| {
                    schedule.violations.iter().any(|v| v.involves(&self.id))
                });
                if alarmed {
                    Advisory::Hold
                } else {
                    Advisory::ProceedAtSpeed(cruise)
                }
            }
            AgentState::Cleared { .. } => Advisory::ProceedAtSpeed(cruise),
            AgentState::Yielding { .. } | AgentState::Aborting { .. } => Advisory::Yield,
        }
    }

    fn on_perception(&mut self, state: VehicleState, now: Millis, reaction: &mut Reaction) -> bool {
        if self
            .perception
            .as_ref()
            .is_some_and(|known| known.observed_at > state.observed_at)
        {
            return false;
        }
        self.fallback.record_perception(&state);
        self.perception = Some(state);
        if self.phase() == AgentPhase::Approaching {
            self.progress(now, reaction);
        }
        true
    }

    fn on_intent(&mut self, intent: IntentMessage, now: Millis, reaction: &mut Reaction) -> bool {
        if intent.sender == self.id {
            return false;
        }
        let age_ms = now.saturating_sub(intent.timestamp);
        if age_ms > self.config.staleness_age_ms {
            debug!(vehicle = %self.id, peer = %intent.sender, age_ms, "ignoring stale intent");
            reaction.error = Some(CoordinationError::StaleState {
                vehicle: intent.sender,
                age_ms,
                max_age_ms: self.config.staleness_age_ms,
            });
            return false;
        }
        let sender = intent.sender.clone();
        match self.peers.ingest(intent, now) {
            Ingest::Accepted => {}
            Ingest::Duplicate | Ingest::Outdated => return false,
        }
        self.fallback.observe_peer(&sender, now);
        self.progress(now, reaction);
        true
    }

    fn on_alert(&mut self, alert: InfrastructureAlert, now: Millis, reaction: &mut Reaction) -> bool {
        if !self.alerts.ingest(alert, now) {
            return false;
        }
        self.progress(now, reaction);
        true
    }

    fn on_tick(&mut self, now: Millis, reaction: &mut Reaction) {
        for peer in self.peers.forget_older_than(now, self.config.peer_forget_age_ms) {
            debug!(vehicle = %self.id, %peer, "forgetting silent peer");
        }
        self.fallback.forget_expired(now, self.config.peer_forget_age_ms);
        self.alerts.purge_expired(now);
        for source in self.alerts.forget_silent(now, self.config.peer_forget_age_ms) {
            debug!(vehicle = %self.id, %source, "forgetting silent roadside source");
        }

        match self.state.clone() {
            AgentState::Approaching => self.progress(now, reaction),
            AgentState::Negotiating { since, cycles } => {
                self.state = AgentState::Negotiating {
                    since,
                    cycles: cycles + 1,
                };
                if !self.check_degradation(now, reaction) {
                    self.progress(now, reaction);
                }
            }
            AgentState::Committed { .. } => {
                if !self.check_degradation(now, reaction) {
                    self.progress(now, reaction);
                }
            }
            AgentState::Crossing { .. } => self.progress(now, reaction),
            AgentState::Cleared { rebroadcasts_left } => {
                if rebroadcasts_left > 0 {
                    self.state = AgentState::Cleared {
                        rebroadcasts_left: rebroadcasts_left - 1,
                    };
                    self.broadcast(IntentStatus::Cleared, now, reaction);
                }
            }
            AgentState::Yielding { since, .. } | AgentState::Aborting { since } => {
                let timed_out = now.saturating_sub(since) >= self.config.yield_timeout_ms;
                if timed_out || self.hazard_cleared(now) {
                    info!(vehicle = %self.id, timed_out, "resuming approach");
                    self.epoch += 1;
                    self.sequence = 0;
                    self.set_state(AgentState::Approaching);
                    self.progress(now, reaction);
                }
            }
        }

        let announced = !reaction.broadcasts.is_empty();
        if !announced {
            let periodic = match self.state {
                AgentState::Negotiating { .. } => Some(IntentStatus::Proposed),
                AgentState::Committed { .. } => Some(IntentStatus::Committed),
                AgentState::Crossing { .. } => Some(IntentStatus::Crossing),
                AgentState::Yielding { .. } | AgentState::Aborting { .. } => {
                    Some(IntentStatus::Yielding)
                }
                AgentState::Approaching | AgentState::Cleared { .. } => None,
            };
            if let Some(status) = periodic {
                self.broadcast(status, now, reaction);
            }
        }
    }

    fn on_zone_entered(&mut self, now: Millis, reaction: &mut Reaction) {
        self.inside = true;
        let reserved = match &self.state {
            AgentState::Crossing { .. } | AgentState::Cleared { .. } => return,
            AgentState::Committed { reservation } => Some(reservation.window.duration()),
            _ => None,
        };
        let duration = match reserved {
            Some(duration) => duration,
            None => {
                warn!(vehicle = %self.id, phase = %self.phase(), "entered conflict zone without a reservation");
                self.perception
                    .as_ref()
                    .map_or(0, |state| state.window().duration())
            }
        };
        let reservation = Reservation {
            vehicle: self.id.clone(),
            zones: self.zones.clone(),
            window: TimeWindow::spanning(now, duration),
        };
        self.set_state(AgentState::Crossing { reservation });
        self.broadcast(IntentStatus::Crossing, now, reaction);
    }

    fn on_zone_exited(&mut self, now: Millis, reaction: &mut Reaction) {
        self.inside = false;
        if self.phase() != AgentPhase::Crossing {
            warn!(vehicle = %self.id, phase = %self.phase(), "zone exit outside a crossing");
            return;
        }
        self.waiting_since = None;
        self.set_state(AgentState::Cleared {
            rebroadcasts_left: self.config.cleared_rebroadcasts,
        });
        self.broadcast(IntentStatus::Cleared, now, reaction);
    }

    /// Yield if the fallback controller finds the picture untrustworthy.
    fn check_degradation(&mut self, now: Millis, reaction: &mut Reaction) -> bool {
        let relevant = self.relevant_peers(now);
        let Some(degradation) = self
            .fallback
            .assess(now, &self.config, &relevant, &self.alerts)
        else {
            return false;
        };
        warn!(vehicle = %self.id, %degradation, "degraded information, yielding");
        reaction.error = Some(CoordinationError::DegradedInformation(degradation.clone()));
        self.enter_yield(YieldReason::Degraded(degradation), now, reaction);
        true
    }

    /// Peers whose silence matters: claiming, sharing a cell, and not known
    /// to be past their crossing.
    fn relevant_peers(&self, now: Millis) -> BTreeSet<VehicleId> {
        let margin = self.config.safety_margin_ms;
        let own = self.intent_with(IntentStatus::Proposed, now);
        let claiming = self
            .peers
            .intents()
            .filter(|intent| intent.status.is_schedulable())
            .filter(|intent| {
                !(intent.status == IntentStatus::Crossing && now > intent.window.end.saturating_add(margin))
            });
        ConflictMap::build(claiming.chain(own.as_ref())).contenders_of(&self.id)
    }

    fn hazard_cleared(&mut self, now: Millis) -> bool {
        let relevant = self.relevant_peers(now);
        if self
            .fallback
            .assess(now, &self.config, &relevant, &self.alerts)
            .is_some()
        {
            return false;
        }
        if self
            .alerts
            .snapshot(now)
            .blocking_in(&self.zones, now)
            .is_some()
        {
            return false;
        }
        if self.phase() == AgentPhase::Aborting {
            match self.recompute(now) {
                Ok(()) => {}
                Err(_) => return false,
            }
            return self
                .schedule
                .as_ref()
                .is_some_and(|schedule| schedule.violations_in(&self.zones).next().is_none());
        }
        true
    }

    fn progress(&mut self, now: Millis, reaction: &mut Reaction) {
        if self.phase() == AgentPhase::Approaching {
            let in_range = self.perception.as_ref().is_some_and(|state| {
                !state.is_stale(now, self.config.staleness_age_ms)
                    && state.distance_to_zone <= self.config.detection_horizon_m
            });
            if !in_range {
                return;
            }
            self.waiting_since.get_or_insert(now);
            self.set_state(AgentState::Negotiating {
                since: now,
                cycles: 0,
            });
            self.broadcast(IntentStatus::Proposed, now, reaction);
        }

        if !matches!(
            self.phase(),
            AgentPhase::Negotiating | AgentPhase::Committed | AgentPhase::Crossing
        ) {
            return;
        }

        if let Err(err) = self.recompute(now) {
            warn!(vehicle = %self.id, error = %err, "scheduler could not settle");
            reaction.error = Some(err);
            if self.phase() != AgentPhase::Crossing {
                self.enter_yield(YieldReason::SchedulerInconsistent, now, reaction);
            }
            return;
        }
        self.collect_alarms(reaction);

        match self.decide(now) {
            Decision::Stay => {}
            Decision::Commit(reservation) => {
                info!(
                    vehicle = %self.id,
                    window = %reservation.window,
                    "committing to crossing slot"
                );
                self.set_state(AgentState::Committed { reservation });
                self.broadcast(IntentStatus::Committed, now, reaction);
            }
            Decision::Retract { missed } => {
                info!(vehicle = %self.id, missed, "retracting reservation");
                self.set_state(AgentState::Negotiating {
                    since: now,
                    cycles: 0,
                });
                self.broadcast(IntentStatus::Retracted, now, reaction);
            }
            Decision::Yield(reason) => self.enter_yield(reason, now, reaction),
            Decision::Abort => {
                self.set_state(AgentState::Aborting { since: now });
                self.broadcast(IntentStatus::Yielding, now, reaction);
            }
        }
    }

    fn decide(&self, now: Millis) -> Decision {
        let Some(schedule) = self.schedule.as_ref() else {
            return Decision::Stay;
        };
        let pre_crossing = matches!(
            self.state,
            AgentState::Negotiating { .. } | AgentState::Committed { .. }
        );
        if !pre_crossing {
            return Decision::Stay;
        }
        if schedule.violations_in(&self.zones).next().is_some() {
            return Decision::Abort;
        }
        if let Some(alert) = self.alerts.snapshot(now).blocking_in(&self.zones, now) {
            return Decision::Yield(YieldReason::ZoneBlocked {
                zone: alert.zone,
                kind: alert.kind,
            });
        }

        match &self.state {
            AgentState::Negotiating { cycles, .. } => {
                if *cycles < self.config.min_negotiation_cycles {
                    return Decision::Stay;
                }
                let Some(assignment) = schedule.assignment(&self.id) else {
                    return Decision::Stay;
                };
                let clear_ahead = schedule.slots_ahead(&self.id).iter().all(|(_, slot)| {
                    match &slot.occupant {
                        Occupant::Blocker { .. } => true,
                        Occupant::Vehicle(other) => schedule
                            .assignment(other)
                            .is_some_and(|ahead| ahead.status.is_finalized()),
                    }
                });
                if !clear_ahead {
                    return Decision::Stay;
                }
                let start = assignment
                    .occupancy
                    .start
                    .max(now.saturating_add(self.config.commit_lead_ms));
                Decision::Commit(Reservation {
                    vehicle: self.id.clone(),
                    zones: self.zones.clone(),
                    window: TimeWindow::spanning(start, assignment.occupancy.duration()),
                })
            }
            AgentState::Committed { reservation } => {
                if self.inside {
                    return Decision::Stay;
                }
                let moved = schedule
                    .assignment(&self.id)
                    .is_none_or(|assignment| assignment.occupancy.start > reservation.window.start);
                if moved {
                    return Decision::Retract { missed: false };
                }
                let deadline = reservation
                    .window
                    .start
                    .saturating_add(self.config.safety_margin_ms / 2);
                if now > deadline {
                    return Decision::Retract { missed: true };
                }
                Decision::Stay
            }
            _ => Decision::Stay,
        }
    }

    fn recompute(&mut self, now: Millis) -> Result<(), CoordinationError> {
        let mut intents: Vec<IntentMessage> = self.peers.intents().cloned().collect();
        let own_status = match self.state {
            AgentState::Negotiating { .. } => Some(IntentStatus::Proposed),
            AgentState::Committed { .. } => Some(IntentStatus::Committed),
            AgentState::Crossing { .. } => Some(IntentStatus::Crossing),
            _ => None,
        };
        if let Some(own) = own_status.and_then(|status| self.intent_with(status, now)) {
            intents.push(own);
        }
        let alerts = self.alerts.snapshot(now);
        let schedule = scheduler::schedule(&intents, &alerts, now, &self.config)?;
        if !schedule.stale.is_empty() {
            debug!(vehicle = %self.id, stale = ?schedule.stale, "stale intents left unscheduled");
        }
        for anomaly in &schedule.anomalies {
            debug!(
                vehicle = %self.id,
                peer = %anomaly.vehicle,
                earliest = anomaly.earliest,
                latest = anomaly.latest,
                "cell starts disagreed"
            );
        }
        self.schedule = Some(schedule);
        Ok(())
    }

    fn collect_alarms(&mut self, reaction: &mut Reaction) {
        let Some(schedule) = self.schedule.as_ref() else {
            return;
        };
        for violation in schedule.violations_in(&self.zones) {
            let key = (
                violation.zone,
                violation.first.to_string(),
                violation.second.to_string(),
            );
            if self.reported_alarms.contains(&key) {
                continue;
            }
            warn!(vehicle = %self.id, %violation, "reservation alarm");
            self.reported_alarms.push(key);
            reaction
                .error
                .get_or_insert_with(|| CoordinationError::ReservationViolation(violation.clone()));
            reaction.alarms.push(violation.clone());
        }
    }

    fn enter_yield(&mut self, reason: YieldReason, now: Millis, reaction: &mut Reaction) {
        debug!(vehicle = %self.id, ?reason, "yielding");
        self.set_state(AgentState::Yielding { since: now, reason });
        self.broadcast(IntentStatus::Yielding, now, reaction);
    }

    fn set_state(&mut self, next: AgentState) {
        let from = self.phase();
        let to = next.phase();
        if from != to {
            info!(vehicle = %self.id, %from, %to, "state transition");
        }
        self.state = next;
    }

    fn intent_with(&self, status: IntentStatus, now: Millis) -> Option<IntentMessage> {
        let perception = self.perception.as_ref()?;
        let window = self
            .reservation()
            .map_or_else(|| perception.window(), |reservation| reservation.window);
        let proposed_rank = self
            .schedule
            .as_ref()
            .and_then(|schedule| schedule.assignment(&self.id))
            .map_or(0, |assignment| assignment.rank);
        Some(IntentMessage {
            sender: self.id.clone(),
            epoch: self.epoch,
            sequence: self.sequence,
            status,
            class: self.class,
            position: perception.position,
            velocity: perception.velocity,
            heading: perception.heading,
            uncertainty_radius: perception.uncertainty_radius,
            window,
            zones: self.zones.clone(),
            proposed_rank,
            timestamp: now,
            waiting_since: self.waiting_since.unwrap_or(now).min(now),
        })
    }

    fn broadcast(&mut self, status: IntentStatus, now: Millis, reaction: &mut Reaction) {
        self.sequence += 1;
        if let Some(intent) = self.intent_with(status, now) {
            reaction.broadcasts.push(intent);
        }
    }
}
