//! Simulation, benchmark, and stress-test runners for crossway.
//!
//! Every vehicle gets three threads: a physics thread that moves the plant and
//! samples perception, a radio thread that polls the broadcast medium and
//! drives the negotiation timer, and the agent thread that owns the
//! negotiator. The first two only push events into the agent's inbox. One
//! more thread plays the roadside unit. Logical time runs `speedup` times
//! faster than the wall clock.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::agent::{
    Actuator, AgentEvent, AgentPhase, InboundEvent, PerceptionAdapter, Reaction, VehicleAgent,
};
use crate::channel::{BroadcastMedium, LinkStats, NegotiationChannel};
use crate::codec::{self, Payload, WireFormat};
use crate::config::{LinkProfile, Settings};
use crate::error::CoordinationError;
use crate::occupancy::{CellConflict, OccupancyAudit};
use crate::queue::Inbox;
use crate::types::{
    Advisory, AlertKind, AlertStatus, InfrastructureAlert, IntentMessage, IntentStatus, Millis,
    PriorityClass, TimeWindow, Vec2, VehicleId, VehicleState, ZoneId,
};
use crate::zones::{Approach, ConflictMap, Movement, Turn};

// Radio polling granularity, logical ms.
const RADIO_POLL_MS: Millis = 5;
const RSU_POLL_MS: Millis = 50;
const RSU_HEARTBEAT_MS: Millis = 500;
const RSU_ID: &str = "rsu-0";
// Logical time the run keeps going after the last vehicle exits, so Cleared
// rebroadcasts go out.
const SETTLE_MS: Millis = 600;
// Benchmarks trade timing slack for wall-clock time.
const BENCH_SPEEDUP: u64 = 10;
const PERCEPTION_UNCERTAINTY_M: f64 = 0.5;
const PERCEPTION_CONFIDENCE: f64 = 0.95;

/// Best-effort CPU user/system time snapshot (seconds) on Unix platforms.
#[cfg(unix)]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    // SAFETY: rusage is plain data; getrusage fills it in.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let user = usage.ru_utime.tv_sec as f64 + (usage.ru_utime.tv_usec as f64 / 1_000_000.0);
    let sys = usage.ru_stime.tv_sec as f64 + (usage.ru_stime.tv_usec as f64 / 1_000_000.0);
    Some((user, sys))
}

#[cfg(not(unix))]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    None
}

/// Logical clock shared by every thread of one run.
#[derive(Clone, Copy)]
struct SimClock {
    origin: Instant,
    speedup: u64,
}

impl SimClock {
    fn start(speedup: u64) -> Self {
        Self {
            origin: Instant::now(),
            speedup: speedup.max(1),
        }
    }

    fn now(&self) -> Millis {
        self.origin.elapsed().as_micros() as Millis * self.speedup / 1_000
    }

    fn sleep_until(&self, at: Millis) {
        let target = self.origin + Duration::from_micros(at * 1_000 / self.speedup);
        let now = Instant::now();
        if target > now {
            thread::sleep(target - now);
        }
    }
}

#[derive(Clone, Debug)]
struct VehicleSpec {
    id: VehicleId,
    class: PriorityClass,
    movement: Movement,
    /// Distance to the entry line at spawn, metres.
    approach_m: f64,
    cruise: f64,
    spawn_at: Millis,
    /// Interval in which perception returns nothing.
    dropout: Option<TimeWindow>,
}

#[derive(Clone, Debug)]
struct ScriptedAlert {
    issue_at: Millis,
    alert: InfrastructureAlert,
}

#[derive(Clone, Debug, Default)]
struct Scenario {
    vehicles: Vec<VehicleSpec>,
    alerts: Vec<ScriptedAlert>,
}

enum PlantEvent {
    Entered,
    Exited,
}

/// Kinematic stand-in for a vehicle. No acceleration limits, and vehicles on
/// the same approach do not interact outside the box.
struct Plant {
    spec: VehicleSpec,
    travelled: f64,
    speed: f64,
    advisory: Advisory,
    entered_at: Option<Millis>,
    exited_at: Option<Millis>,
    held_ms: Millis,
}

impl Plant {
    fn new(spec: VehicleSpec) -> Self {
        let advisory = Advisory::ProceedAtSpeed(spec.cruise);
        Self {
            spec,
            travelled: 0.0,
            speed: 0.0,
            advisory,
            entered_at: None,
            exited_at: None,
            held_ms: 0,
        }
    }

    fn distance_to_line(&self) -> f64 {
        self.spec.approach_m - self.travelled
    }

    fn step(&mut self, dt_ms: Millis, now: Millis) -> Option<PlantEvent> {
        if now < self.spec.spawn_at || self.exited_at.is_some() || dt_ms == 0 {
            return None;
        }
        let dt = dt_ms as f64 / 1_000.0;
        let line = self.spec.approach_m;
        let next = if self.entered_at.is_some() {
            // Nothing stops a vehicle inside the box.
            self.travelled + self.spec.cruise * dt
        } else {
            match self.advisory {
                Advisory::ProceedAtSpeed(speed) => self.travelled + speed.max(0.0) * dt,
                Advisory::Hold => (self.travelled + self.spec.cruise * dt).min(line),
                Advisory::Yield => self.travelled,
            }
        };
        self.speed = (next - self.travelled) / dt;
        if self.speed <= f64::EPSILON {
            self.held_ms += dt_ms;
        }
        self.travelled = next;

        if self.entered_at.is_none() && self.travelled > line {
            self.entered_at = Some(now);
            return Some(PlantEvent::Entered);
        }
        if self.entered_at.is_some() && self.travelled >= line + self.spec.movement.path_length_m()
        {
            self.exited_at = Some(now);
            return Some(PlantEvent::Exited);
        }
        None
    }

    fn sense(&self, now: Millis) -> Option<VehicleState> {
        if now < self.spec.spawn_at || self.exited_at.is_some() {
            return None;
        }
        if self.spec.dropout.is_some_and(|dropout| dropout.contains(now)) {
            return None;
        }
        let distance = self.distance_to_line();
        let occupancy = self.spec.movement.occupancy_ms(self.spec.cruise);
        let entry = match self.entered_at {
            Some(at) => at,
            None if distance > 0.0 => {
                now + (distance * 1_000.0 / self.spec.cruise).ceil() as Millis
            }
            None => now,
        };
        let heading = self.spec.movement.heading();
        Some(VehicleState {
            id: self.spec.id.clone(),
            position: self.spec.movement.position_at(distance),
            velocity: Vec2::new(heading.cos() * self.speed, heading.sin() * self.speed),
            heading,
            distance_to_zone: distance,
            nominal_speed: self.spec.cruise,
            entry_estimate: entry,
            exit_estimate: entry + occupancy,
            uncertainty_radius: PERCEPTION_UNCERTAINTY_M,
            confidence: PERCEPTION_CONFIDENCE,
            class: self.spec.class,
            observed_at: now,
        })
    }
}

struct PlantSensor {
    plant: Arc<Mutex<Plant>>,
}

impl PerceptionAdapter for PlantSensor {
    fn sample(&mut self, now: Millis) -> Option<VehicleState> {
        self.plant.lock().expect("plant mutex poisoned").sense(now)
    }
}

struct PlantActuator {
    plant: Arc<Mutex<Plant>>,
}

impl Actuator for PlantActuator {
    fn apply(&mut self, advisory: Advisory) {
        self.plant.lock().expect("plant mutex poisoned").advisory = advisory;
    }
}

#[derive(Default)]
struct RunMetrics {
    retractions: AtomicUsize,
    yields: AtomicUsize,
    aborts: AtomicUsize,
    alarms: AtomicUsize,
    malformed: AtomicUsize,
    stale_dropped: AtomicUsize,
    crossing_order: Mutex<Vec<VehicleId>>,
    crossing_claims: Mutex<Vec<IntentMessage>>,
    degraded: Mutex<BTreeSet<VehicleId>>,
}

impl RunMetrics {
    fn record(&self, vehicle: &VehicleId, reaction: &Reaction) {
        if let Some((from, to)) = reaction.transition {
            debug!(%vehicle, %from, %to, "agent transition");
            match to {
                AgentPhase::Yielding => {
                    self.yields.fetch_add(1, Ordering::SeqCst);
                }
                AgentPhase::Aborting => {
                    self.aborts.fetch_add(1, Ordering::SeqCst);
                }
                AgentPhase::Crossing => {
                    self.crossing_order
                        .lock()
                        .expect("metrics mutex poisoned")
                        .push(vehicle.clone());
                    if let Some(claim) = reaction
                        .broadcasts
                        .iter()
                        .find(|intent| intent.status == IntentStatus::Crossing)
                    {
                        self.crossing_claims
                            .lock()
                            .expect("metrics mutex poisoned")
                            .push(claim.clone());
                    }
                }
                _ => {}
            }
        }
        let retracted = reaction
            .broadcasts
            .iter()
            .filter(|intent| intent.status == IntentStatus::Retracted)
            .count();
        self.retractions.fetch_add(retracted, Ordering::SeqCst);
        self.alarms.fetch_add(reaction.alarms.len(), Ordering::SeqCst);
        match &reaction.error {
            Some(CoordinationError::MalformedMessage(_)) => {
                self.malformed.fetch_add(1, Ordering::SeqCst);
            }
            Some(CoordinationError::StaleState { .. }) => {
                self.stale_dropped.fetch_add(1, Ordering::SeqCst);
            }
            Some(CoordinationError::DegradedInformation(_)) => {
                self.degraded
                    .lock()
                    .expect("metrics mutex poisoned")
                    .insert(vehicle.clone());
            }
            _ => {}
        }
    }
}

/// Aggregated results of one simulated run.
struct RunOutcome {
    vehicles: usize,
    cleared: usize,
    elapsed_ms: f64,
    logical_ms: Millis,
    crossing_order: Vec<VehicleId>,
    degraded: Vec<VehicleId>,
    max_occupancy: usize,
    zone_violation: bool,
    cell_conflicts: Vec<CellConflict>,
    cell_entries: usize,
    reservation_alarms: usize,
    crossing_overlaps: usize,
    contested_cells: usize,
    retractions: usize,
    yields: usize,
    aborts: usize,
    malformed: usize,
    stale_dropped: usize,
    avg_hold_ms: f64,
    max_inbox_depth: usize,
    link: LinkStats,
    cpu_user_s: Option<f64>,
    cpu_sys_s: Option<f64>,
}

fn spawn_physics(
    plant: Arc<Mutex<Plant>>,
    inbox: Arc<Inbox<InboundEvent>>,
    audit: Arc<OccupancyAudit>,
    clock: SimClock,
    step_ms: Millis,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    let (id, cells) = {
        let guard = plant.lock().expect("plant mutex poisoned");
        (guard.spec.id.clone(), guard.spec.movement.cells())
    };
    let mut sensor = PlantSensor {
        plant: Arc::clone(&plant),
    };
    thread::Builder::new()
        .name(format!("plant-{id}"))
        .spawn(move || {
            let mut at = 0;
            let mut last = 0;
            while !stop.load(Ordering::SeqCst) {
                at += step_ms;
                clock.sleep_until(at);
                let now = clock.now();
                let event = plant
                    .lock()
                    .expect("plant mutex poisoned")
                    .step(now.saturating_sub(last), now);
                last = now;
                let zone_event = match event {
                    Some(PlantEvent::Entered) => {
                        audit.enter(&id, &cells, now);
                        Some(AgentEvent::ZoneEntered)
                    }
                    Some(PlantEvent::Exited) => {
                        audit.exit(&id, &cells);
                        Some(AgentEvent::ZoneExited)
                    }
                    None => None,
                };
                let sample = sensor.sample(now).map(AgentEvent::Perception);
                for event in zone_event.into_iter().chain(sample) {
                    if inbox.push(InboundEvent { at: now, event }).is_err() {
                        return;
                    }
                }
            }
        })
        .expect("failed to spawn physics thread")
}

fn spawn_radio(
    channel: Arc<NegotiationChannel>,
    inbox: Arc<Inbox<InboundEvent>>,
    clock: SimClock,
    tick_period: Millis,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(format!("radio-{}", channel.endpoint()))
        .spawn(move || {
            let mut at = 0;
            let mut next_tick = tick_period;
            while !stop.load(Ordering::SeqCst) {
                at += RADIO_POLL_MS;
                clock.sleep_until(at);
                let now = clock.now();
                for delivery in channel.poll(now) {
                    let event = InboundEvent {
                        at: delivery.received_at,
                        event: AgentEvent::Received(delivery.bytes),
                    };
                    if inbox.push(event).is_err() {
                        return;
                    }
                }
                if now >= next_tick {
                    next_tick = now + tick_period;
                    let tick = InboundEvent {
                        at: now,
                        event: AgentEvent::Tick,
                    };
                    if inbox.push(tick).is_err() {
                        return;
                    }
                }
            }
        })
        .expect("failed to spawn radio thread")
}

fn spawn_agent(
    mut agent: VehicleAgent,
    mut actuator: PlantActuator,
    channel: Arc<NegotiationChannel>,
    inbox: Arc<Inbox<InboundEvent>>,
    clock: SimClock,
    format: WireFormat,
    metrics: Arc<RunMetrics>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(format!("agent-{}", agent.id()))
        .spawn(move || {
            while let Some(inbound) = inbox.recv() {
                let now = clock.now().max(inbound.at);
                let reaction = agent.handle(inbound.event, now);
                metrics.record(agent.id(), &reaction);
                for intent in &reaction.broadcasts {
                    match codec::encode(&Payload::Intent(intent.clone()), format) {
                        Ok(bytes) => channel.send(&bytes, now),
                        Err(err) => warn!(vehicle = %agent.id(), error = %err, "intent not encodable"),
                    }
                }
                if let Some(advisory) = reaction.advisory {
                    actuator.apply(advisory);
                }
            }
            debug!(
                vehicle = %agent.id(),
                phase = %agent.phase(),
                epoch = agent.epoch(),
                peers = agent.peers().len(),
                "agent stopped"
            );
        })
        .expect("failed to spawn agent thread")
}

/// Alert schedule of the roadside unit: scripted issues plus a periodic
/// re-broadcast of everything still in force.
struct RoadsideFeed {
    pending: std::iter::Peekable<std::vec::IntoIter<ScriptedAlert>>,
    live: Vec<InfrastructureAlert>,
    next_heartbeat: Millis,
    on_air: bool,
}

impl RoadsideFeed {
    fn new(mut script: Vec<ScriptedAlert>) -> Self {
        script.sort_by_key(|scripted| scripted.issue_at);
        Self {
            pending: script.into_iter().peekable(),
            live: Vec::new(),
            next_heartbeat: 0,
            on_air: false,
        }
    }

    /// Alerts to send at `now`.
    fn due(&mut self, now: Millis) -> Vec<InfrastructureAlert> {
        let mut outgoing = Vec::new();
        while let Some(scripted) = self.pending.next_if(|s| s.issue_at <= now) {
            info!(
                kind = ?scripted.alert.kind,
                zone = scripted.alert.zone,
                validity = %scripted.alert.validity,
                "roadside alert issued"
            );
            outgoing.push(scripted.alert.clone());
            self.live.push(scripted.alert);
            self.on_air = true;
        }
        self.live.retain(|alert| !alert.is_expired(now));
        if now >= self.next_heartbeat {
            self.next_heartbeat = now + RSU_HEARTBEAT_MS;
            outgoing.clone_from(&self.live);
            // Once on the air, keep the feed alive with an all-clear.
            if outgoing.is_empty() && self.on_air {
                outgoing.push(all_clear(now));
            }
        }
        outgoing
    }
}

fn spawn_roadside_unit(
    channel: NegotiationChannel,
    script: Vec<ScriptedAlert>,
    clock: SimClock,
    format: WireFormat,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    let mut feed = RoadsideFeed::new(script);
    thread::Builder::new()
        .name(RSU_ID.to_string())
        .spawn(move || {
            let mut at = 0;
            while !stop.load(Ordering::SeqCst) {
                clock.sleep_until(at);
                let now = clock.now();
                // Vehicle traffic is of no interest to the roadside unit.
                channel.poll(now);
                for alert in feed.due(now) {
                    match codec::encode(&Payload::Alert(alert), format) {
                        Ok(bytes) => channel.send(&bytes, now),
                        Err(err) => warn!(error = %err, "alert not encodable"),
                    }
                }
                at += RSU_POLL_MS;
            }
        })
        .expect("failed to spawn roadside thread")
}

fn run_scenario(settings: &Settings, link: LinkProfile, scenario: Scenario, speedup: u64) -> RunOutcome {
    let sim = &settings.simulation;
    let medium = Arc::new(BroadcastMedium::new(link, sim.seed));
    let audit = Arc::new(OccupancyAudit::new());
    let metrics = Arc::new(RunMetrics::default());
    let stop = Arc::new(AtomicBool::new(false));
    let total = scenario.vehicles.len();

    let rsu_channel = medium.attach(RSU_ID);
    let mut plants = Vec::with_capacity(total);
    let mut inboxes = Vec::with_capacity(total);
    let mut producers = Vec::new();
    let mut agents = Vec::with_capacity(total);

    let cpu_start = cpu_times_seconds();
    let started = Instant::now();
    let clock = SimClock::start(speedup);

    let rsu = spawn_roadside_unit(
        rsu_channel,
        scenario.alerts,
        clock,
        sim.wire_format,
        Arc::clone(&stop),
    );

    for spec in scenario.vehicles {
        let id = spec.id.clone();
        let agent = VehicleAgent::new(
            id.clone(),
            spec.class,
            spec.movement.cells(),
            settings.coordinator.clone(),
        );
        let plant = Arc::new(Mutex::new(Plant::new(spec)));
        let inbox = Arc::new(Inbox::new());
        let channel = Arc::new(medium.attach(id.as_str()));

        producers.push(spawn_physics(
            Arc::clone(&plant),
            Arc::clone(&inbox),
            Arc::clone(&audit),
            clock,
            sim.physics_step_ms,
            Arc::clone(&stop),
        ));
        producers.push(spawn_radio(
            Arc::clone(&channel),
            Arc::clone(&inbox),
            clock,
            settings.coordinator.negotiation_period_ms,
            Arc::clone(&stop),
        ));
        agents.push(spawn_agent(
            agent,
            PlantActuator {
                plant: Arc::clone(&plant),
            },
            channel,
            Arc::clone(&inbox),
            clock,
            sim.wire_format,
            Arc::clone(&metrics),
        ));
        plants.push((id, plant));
        inboxes.push(inbox);
    }

    let mut all_exited_at: Option<Millis> = None;
    let mut departed = BTreeSet::new();
    loop {
        thread::sleep(Duration::from_millis(10));
        let now = clock.now();
        for (id, plant) in &plants {
            let gone = plant.lock().expect("plant mutex poisoned").exited_at;
            // A vehicle past the settle time is out of radio range.
            if gone.is_some_and(|at| now >= at + SETTLE_MS) && departed.insert(id.clone()) {
                medium.detach(id.as_str());
            }
        }
        let exited = plants
            .iter()
            .filter(|(_, plant)| plant.lock().expect("plant mutex poisoned").exited_at.is_some())
            .count();
        if exited == total {
            let since = *all_exited_at.get_or_insert(now);
            if now >= since + SETTLE_MS {
                break;
            }
        }
        if now >= sim.deadline_ms {
            warn!(exited, total, deadline_ms = sim.deadline_ms, "run stopped at deadline");
            break;
        }
    }
    let logical_ms = clock.now();

    stop.store(true, Ordering::SeqCst);
    for handle in producers {
        handle.join().expect("producer thread panicked");
    }
    for inbox in &inboxes {
        inbox.close();
    }
    for handle in agents {
        handle.join().expect("agent thread panicked");
    }
    rsu.join().expect("roadside thread panicked");

    let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
    let (cpu_user_s, cpu_sys_s) = match (cpu_start, cpu_times_seconds()) {
        (Some((user_start, sys_start)), Some((user_end, sys_end))) => {
            (Some(user_end - user_start), Some(sys_end - sys_start))
        }
        _ => (None, None),
    };

    let mut cleared = 0;
    let mut held_total = 0;
    for (_, plant) in &plants {
        let guard = plant.lock().expect("plant mutex poisoned");
        if guard.exited_at.is_some() {
            cleared += 1;
        }
        held_total += guard.held_ms;
    }
    let avg_hold_ms = if total > 0 {
        held_total as f64 / total as f64
    } else {
        0.0
    };

    let claims = metrics
        .crossing_claims
        .lock()
        .expect("metrics mutex poisoned")
        .clone();
    let map = ConflictMap::build(&claims);
    let crossing_overlaps = map.zones().map(|zone| zone.overlapping_pairs(0).len()).sum();
    let contested_cells = map.zones().filter(|zone| zone.is_contested()).count();

    let crossing_order = metrics
        .crossing_order
        .lock()
        .expect("metrics mutex poisoned")
        .clone();
    let degraded = metrics
        .degraded
        .lock()
        .expect("metrics mutex poisoned")
        .iter()
        .cloned()
        .collect();

    RunOutcome {
        vehicles: total,
        cleared,
        elapsed_ms,
        logical_ms,
        crossing_order,
        degraded,
        max_occupancy: audit.max_occupancy(),
        zone_violation: audit.has_violation(),
        cell_conflicts: audit.conflicts(),
        cell_entries: audit.crossings(),
        reservation_alarms: metrics.alarms.load(Ordering::SeqCst),
        crossing_overlaps,
        contested_cells,
        retractions: metrics.retractions.load(Ordering::SeqCst),
        yields: metrics.yields.load(Ordering::SeqCst),
        aborts: metrics.aborts.load(Ordering::SeqCst),
        malformed: metrics.malformed.load(Ordering::SeqCst),
        stale_dropped: metrics.stale_dropped.load(Ordering::SeqCst),
        avg_hold_ms,
        max_inbox_depth: inboxes.iter().map(|inbox| inbox.peak_depth()).max().unwrap_or(0),
        link: medium.stats(),
        cpu_user_s,
        cpu_sys_s,
    }
}

/// Roadside beacon claiming nothing is in force.
fn all_clear(now: Millis) -> InfrastructureAlert {
    InfrastructureAlert {
        kind: AlertKind::Hazard,
        zone: 0,
        validity: TimeWindow::new(now, now + 2 * RSU_HEARTBEAT_MS),
        override_priority: false,
        status: AlertStatus::Clear,
        source: RSU_ID.to_string(),
        issued_at: now,
    }
}

fn roadside_alert(
    kind: AlertKind,
    zone: ZoneId,
    validity: (Millis, Millis),
    issued_at: Millis,
) -> ScriptedAlert {
    ScriptedAlert {
        issue_at: issued_at,
        alert: InfrastructureAlert {
            kind,
            zone,
            validity: TimeWindow::new(validity.0, validity.1),
            override_priority: kind == AlertKind::EmergencyVehicle,
            status: AlertStatus::Active,
            source: RSU_ID.to_string(),
            issued_at,
        },
    }
}

fn vehicle(
    id: &str,
    class: PriorityClass,
    movement: Movement,
    approach_m: f64,
    cruise: f64,
    spawn_at: Millis,
) -> VehicleSpec {
    VehicleSpec {
        id: VehicleId::new(id),
        class,
        movement,
        approach_m,
        cruise,
        spawn_at,
        dropout: None,
    }
}

/// Five vehicles on all four approaches: a pedestrian on the north-west
/// cell, a perception dropout on D, and an emergency vehicle E announced by
/// the roadside unit.
fn demo_scenario() -> Scenario {
    let normal = PriorityClass::Normal;
    let mut d = vehicle(
        "D",
        normal,
        Movement::new(Approach::West, Turn::Straight),
        55.0,
        10.0,
        0,
    );
    d.dropout = Some(TimeWindow::new(2_600, 3_800));

    let emergency_path = Movement::new(Approach::West, Turn::Left);
    let mut alerts = vec![roadside_alert(AlertKind::Pedestrian, 0, (1_000, 2_500), 100)];
    for zone in emergency_path.cells() {
        alerts.push(roadside_alert(
            AlertKind::EmergencyVehicle,
            zone,
            (3_800, 9_000),
            3_800,
        ));
    }

    Scenario {
        vehicles: vec![
            vehicle("A", normal, Movement::new(Approach::South, Turn::Straight), 40.0, 10.0, 0),
            vehicle("B", normal, Movement::new(Approach::East, Turn::Left), 45.0, 10.0, 0),
            vehicle("C", normal, Movement::new(Approach::North, Turn::Right), 55.0, 10.0, 0),
            d,
            vehicle("E", PriorityClass::Emergency, emergency_path, 45.0, 14.0, 3_000),
        ],
        alerts,
    }
}

/// Seeded random traffic: staggered spawns over every approach and turn.
fn random_scenario(vehicles: usize, seed: u64) -> Scenario {
    let mut rng = StdRng::seed_from_u64(seed);
    let approaches = [Approach::North, Approach::East, Approach::South, Approach::West];
    let turns = [Turn::Right, Turn::Straight, Turn::Left];
    let specs = (0..vehicles)
        .map(|index| {
            let approach = approaches[rng.gen_range(0..approaches.len())];
            let turn = turns[rng.gen_range(0..turns.len())];
            let class = match index % 7 {
                3 => PriorityClass::PedestrianYieldRequired,
                6 => PriorityClass::Emergency,
                _ => PriorityClass::Normal,
            };
            VehicleSpec {
                id: VehicleId::new(format!("v{index:02}")),
                class,
                movement: Movement::new(approach, turn),
                approach_m: rng.gen_range(40.0..70.0),
                cruise: rng.gen_range(8.0..14.0),
                spawn_at: index as Millis * 600,
                dropout: None,
            }
        })
        .collect();
    Scenario {
        vehicles: specs,
        alerts: Vec::new(),
    }
}

fn join_ids(ids: &[VehicleId]) -> String {
    ids.iter().map(VehicleId::as_str).collect::<Vec<_>>().join(",")
}

/// Run the scripted demo and print its summary.
pub fn run_demo(settings: &Settings) {
    info!(seed = settings.simulation.seed, "demo start");
    let outcome = run_scenario(
        settings,
        settings.link.clone(),
        demo_scenario(),
        settings.simulation.speedup,
    );
    info!(elapsed_ms = outcome.elapsed_ms, "demo finished");

    let link = outcome.link;
    println!("DEMO SUMMARY");
    println!("vehicles={} cleared={}", outcome.vehicles, outcome.cleared);
    println!("crossing_order=[{}]", join_ids(&outcome.crossing_order));
    println!("max_cell_occupancy_observed={}", outcome.max_occupancy);
    println!("zone_violation={}", outcome.zone_violation);
    println!("cell_entries={}", outcome.cell_entries);
    println!("reservation_alarms={}", outcome.reservation_alarms);
    println!("crossing_overlaps={}", outcome.crossing_overlaps);
    println!("contested_cells={}", outcome.contested_cells);
    println!(
        "retractions={} yields={} aborts={}",
        outcome.retractions, outcome.yields, outcome.aborts
    );
    println!("degraded_vehicles=[{}]", join_ids(&outcome.degraded));
    println!(
        "malformed_rejected={} stale_dropped={}",
        outcome.malformed, outcome.stale_dropped
    );
    println!(
        "link sent={} delivered={} dropped={} duplicated={} corrupted={}",
        link.sent, link.delivered, link.dropped, link.duplicated, link.corrupted
    );
    for (label, format) in [("binary", WireFormat::Binary), ("json", WireFormat::Json)] {
        let sizes = link.sizes(format);
        println!(
            "frames {label} count={} bytes={} max_bytes={}",
            sizes.frames, sizes.bytes, sizes.max_frame
        );
    }
    println!("max_inbox_depth={}", outcome.max_inbox_depth);
    println!("simulated_ms={}", outcome.logical_ms);
}

const CSV_HEADER: &str = "vehicles,loss,speedup,elapsed_ms,simulated_ms,cleared,throughput_vehicles_per_min,avg_hold_ms,cpu_user_s,cpu_sys_s,max_occupancy,zone_violation,reservation_alarms,retractions,messages_sent,messages_dropped,binary_bytes,binary_max_frame,json_bytes,json_max_frame,max_inbox_depth";

fn print_csv_row(outcome: &RunOutcome, loss: f64, speedup: u64, validate: bool) {
    let throughput = if outcome.logical_ms > 0 {
        outcome.cleared as f64 / (outcome.logical_ms as f64 / 60_000.0)
    } else {
        0.0
    };
    let cpu_user = outcome
        .cpu_user_s
        .map(|v| format!("{v:.4}"))
        .unwrap_or_else(|| "NA".to_string());
    let cpu_sys = outcome
        .cpu_sys_s
        .map(|v| format!("{v:.4}"))
        .unwrap_or_else(|| "NA".to_string());
    println!(
        "{},{:.3},{},{:.2},{},{},{:.2},{:.2},{},{},{},{},{},{},{},{},{},{},{},{},{}",
        outcome.vehicles,
        loss,
        speedup,
        outcome.elapsed_ms,
        outcome.logical_ms,
        outcome.cleared,
        throughput,
        outcome.avg_hold_ms,
        cpu_user,
        cpu_sys,
        outcome.max_occupancy,
        outcome.zone_violation,
        outcome.reservation_alarms,
        outcome.retractions,
        outcome.link.sent,
        outcome.link.dropped,
        outcome.link.binary.bytes,
        outcome.link.binary.max_frame,
        outcome.link.json.bytes,
        outcome.link.json.max_frame,
        outcome.max_inbox_depth,
    );
    if outcome.cleared < outcome.vehicles {
        eprintln!(
            "# warning,uncleared_vehicles,{}",
            outcome.vehicles - outcome.cleared
        );
    }
    if validate {
        for conflict in &outcome.cell_conflicts {
            eprintln!(
                "# violation,cell_exclusivity,{},{},{}",
                conflict.zone,
                conflict.at,
                join_ids(&conflict.occupants)
            );
        }
        if outcome.crossing_overlaps > 0 {
            eprintln!("# violation,crossing_overlap,{}", outcome.crossing_overlaps);
        }
    }
}

fn link_with_loss(settings: &Settings, loss: f64) -> Option<LinkProfile> {
    let mut link = settings.link.clone();
    link.loss = loss;
    match link.validate() {
        Ok(()) => Some(link),
        Err(err) => {
            eprintln!("benchmark error: {err}");
            None
        }
    }
}

/// Run a single benchmark with optional parameter overrides.
pub fn run_benchmark(settings: &Settings, vehicles: Option<usize>, loss: Option<f64>, validate: bool) {
    let vehicles = vehicles.unwrap_or(8);
    let loss = loss.unwrap_or(settings.link.loss);
    if vehicles == 0 {
        eprintln!("benchmark error: vehicles must be > 0");
        return;
    }
    let Some(link) = link_with_loss(settings, loss) else {
        return;
    };
    let outcome = run_scenario(
        settings,
        link,
        random_scenario(vehicles, settings.simulation.seed),
        BENCH_SPEEDUP,
    );
    println!("{CSV_HEADER}");
    print_csv_row(&outcome, loss, BENCH_SPEEDUP, validate);
}

/// Sweep vehicle counts and link loss rates and print CSV output.
pub fn run_stress(
    settings: &Settings,
    vehicle_sets: Option<Vec<usize>>,
    loss_sets: Option<Vec<f64>>,
    validate: bool,
) {
    let default_vehicle_sets = [2usize, 4, 8, 12];
    let default_loss_sets = [0.0, 0.05, 0.2];

    let vehicle_sets = vehicle_sets.unwrap_or_else(|| default_vehicle_sets.to_vec());
    let mut loss_sets = loss_sets.unwrap_or_else(|| default_loss_sets.to_vec());
    if vehicle_sets.iter().any(|&vehicles| vehicles == 0) {
        eprintln!("stress error: vehicle_sets must be > 0");
        return;
    }
    let before = loss_sets.len();
    loss_sets.retain(|loss| (0.0..1.0).contains(loss));
    let dropped = before - loss_sets.len();
    if dropped > 0 {
        eprintln!("stress warning: ignored {dropped} loss rate(s) outside [0, 1)");
    }
    if loss_sets.is_empty() {
        eprintln!("stress error: no usable loss rates");
        return;
    }

    println!("{CSV_HEADER}");
    for vehicles in vehicle_sets {
        for loss in loss_sets.iter().copied() {
            let Some(link) = link_with_loss(settings, loss) else {
                continue;
            };
            let outcome = run_scenario(
                settings,
                link,
                random_scenario(vehicles, settings.simulation.seed),
                BENCH_SPEEDUP,
            );
            print_csv_row(&outcome, loss, BENCH_SPEEDUP, validate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(movement: Movement) -> VehicleSpec {
        vehicle("T", PriorityClass::Normal, movement, 10.0, 10.0, 0)
    }

    #[test]
    fn roadside_feed_stops_repeating_expired_alerts() {
        let mut feed = RoadsideFeed::new(vec![roadside_alert(AlertKind::Pedestrian, 0, (0, 600), 0)]);
        assert_eq!(feed.due(0).len(), 1);
        assert!(feed.due(50).is_empty());
        let repeated = feed.due(500);
        assert_eq!(repeated.len(), 1);
        assert_eq!(repeated[0].status, AlertStatus::Active);

        let beacon = feed.due(1_000);
        assert_eq!(beacon.len(), 1);
        assert_eq!(beacon[0].status, AlertStatus::Clear);
        assert!(feed.live.is_empty());

        let mut silent = RoadsideFeed::new(Vec::new());
        assert!(silent.due(0).is_empty());
        assert!(silent.due(RSU_HEARTBEAT_MS).is_empty());
    }

    #[test]
    fn hold_stops_at_the_line_and_proceed_crosses() {
        let movement = Movement::new(Approach::South, Turn::Right);
        let mut plant = Plant::new(spec(movement));
        plant.advisory = Advisory::Hold;
        let mut now = 0;
        for _ in 0..200 {
            now += 20;
            assert!(plant.step(20, now).is_none());
        }
        assert_eq!(plant.distance_to_line(), 0.0);
        assert!(plant.held_ms > 0);

        plant.advisory = Advisory::ProceedAtSpeed(10.0);
        let mut events = Vec::new();
        for _ in 0..100 {
            now += 20;
            if let Some(event) = plant.step(20, now) {
                events.push((event, now));
            }
        }
        assert!(matches!(events[0].0, PlantEvent::Entered));
        assert!(matches!(events[1].0, PlantEvent::Exited));
        let inside = events[1].1 - events[0].1;
        assert!(inside.abs_diff(movement.occupancy_ms(10.0)) <= 40);
    }

    #[test]
    fn yield_stops_short_but_not_inside_the_box() {
        let mut plant = Plant::new(spec(Movement::new(Approach::East, Turn::Straight)));
        plant.step(500, 500);
        plant.advisory = Advisory::Yield;
        plant.step(500, 1_000);
        assert_eq!(plant.distance_to_line(), 5.0);

        plant.advisory = Advisory::ProceedAtSpeed(10.0);
        plant.step(600, 1_600);
        assert!(plant.entered_at.is_some());
        plant.advisory = Advisory::Yield;
        plant.step(100, 1_700);
        assert!(plant.distance_to_line() < -1.0);
    }

    #[test]
    fn perception_reports_arrival_and_honours_dropout() {
        let mut spec = spec(Movement::new(Approach::North, Turn::Left));
        spec.dropout = Some(TimeWindow::new(100, 200));
        let plant = Plant::new(spec);
        let state = plant.sense(0).expect("sample");
        assert_eq!(state.entry_estimate, 1_000);
        assert_eq!(state.exit_estimate, 1_000 + 1_800);
        assert_eq!(state.distance_to_zone, 10.0);
        assert!(plant.sense(150).is_none());
        assert!(plant.sense(200).is_some());
    }

    #[test]
    fn random_traffic_is_reproducible() {
        let a = random_scenario(6, 99);
        let b = random_scenario(6, 99);
        let describe = |s: &Scenario| -> Vec<(Movement, Millis)> {
            s.vehicles.iter().map(|v| (v.movement, v.spawn_at)).collect()
        };
        assert_eq!(describe(&a), describe(&b));
        assert_eq!(a.vehicles[6 - 1].spawn_at, 3_000);
    }

    #[test]
    fn ideal_two_vehicle_run_is_collision_free() {
        let mut settings = Settings::default();
        settings.simulation.deadline_ms = 30_000;
        let scenario = Scenario {
            vehicles: vec![
                vehicle("A", PriorityClass::Normal, Movement::new(Approach::South, Turn::Straight), 36.0, 12.0, 0),
                vehicle("B", PriorityClass::Normal, Movement::new(Approach::East, Turn::Straight), 36.0, 12.0, 0),
            ],
            alerts: Vec::new(),
        };
        let speedup = settings.simulation.speedup;
        let outcome = run_scenario(&settings, LinkProfile::ideal(), scenario, speedup);
        assert_eq!(outcome.cleared, 2);
        assert!(!outcome.zone_violation);
        assert!(outcome.cell_conflicts.is_empty());
        assert!(outcome.cell_entries >= 2);
        assert_eq!(outcome.max_occupancy, 1);
        assert_eq!(outcome.crossing_order.len(), 2);
        assert_eq!(outcome.crossing_overlaps, 0);
        assert!(outcome.link.binary.frames > 0);
        assert!(outcome.link.binary.max_frame <= outcome.link.binary.bytes as usize);
        assert_eq!(outcome.link.json, Default::default());
        assert!(outcome.max_inbox_depth >= 1);
    }
}
