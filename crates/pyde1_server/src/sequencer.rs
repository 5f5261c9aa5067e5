//! Shot-lifecycle state machine: gates the shot lifecycle, enforces
//! stop-at-time/volume/weight, auto-tare, and last-drops policy.
//! A single `tokio::select!` actor loop, generalized from multiplexing
//! device-manager events into multiplexing bus events against the
//! watchdog/last-drops timers this state machine owns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pyde1_core::error::DeviceError;
use pyde1_core::message::{
    AutoTareAction, AutoTarePayload, ConnectivityPayload, DeviceRole, Event, EventPayload, Gate,
    GateState, MachineState, SequenceCloseReason, SequencerGatePayload, ShotSamplePayload,
    Substate, StopAtAction, StopAtPayload, StopCondition, StopConditionKind, WeightAndFlowPayload,
};
use pyde1_core::EventBus;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// What the FlowSequencer needs from the rest of the system: the ability to
/// command the DE1 back to Idle, tare the scale, and learn whether a scale
/// is currently Ready. Implemented by `pyde1_server::device::De1DeviceManager`
/// in production; fakeable in tests.
#[async_trait]
pub trait De1Control: Send + Sync {
    async fn request_state(&self, state: MachineState) -> Result<(), DeviceError>;
    async fn tare_scale(&self) -> Result<(), DeviceError>;
    async fn scale_ready(&self) -> bool;
}

/// Per-`active_state` configuration.
/// Espresso uses all fields; Steam only `stop_at_time`; HotWater and
/// HotWaterRinse are a proper subset.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ActiveStateConfig {
    pub disable_auto_tare: bool,
    pub stop_at_time: Option<f64>,
    pub stop_at_volume: Option<f64>,
    pub stop_at_weight: Option<f64>,
    pub first_drops_threshold: f64,
    pub last_drops_minimum_time: f64,
    pub profile_can_override_stop_limits: bool,
    pub profile_can_override_tank_temperature: bool,
}

impl Default for ActiveStateConfig {
    fn default() -> Self {
        ActiveStateConfig {
            disable_auto_tare: false,
            stop_at_time: None,
            stop_at_volume: None,
            stop_at_weight: None,
            first_drops_threshold: 0.0,
            last_drops_minimum_time: 3.0,
            profile_can_override_stop_limits: true,
            profile_can_override_tank_temperature: false,
        }
    }
}

/// Top-level FlowSequencer configuration: one [`ActiveStateConfig`] per
/// admitted state plus the watchdog and stop-at-weight fall-time knobs from
/// `de1.*` configuration.
#[derive(Debug, Clone)]
pub struct FlowSequencerConfig {
    pub per_state: HashMap<MachineState, ActiveStateConfig>,
    pub watchdog_timeout: Duration,
    /// `STOP_AT_WEIGHT_ADJUST`, in seconds; combined with the in-flight
    /// flow rate at the triggering sample to estimate basket-to-cup transit
    /// mass.
    pub stop_at_weight_adjust: f64,
    /// Whether the DE1 has a Group-Head-Controller. When false, API-
    /// initiated flow starts are the trigger instead of a physical lever;
    /// carried here purely for the REST layer to consult before accepting
    /// such a request. The sequencer itself is always a pure observer of
    /// `StateUpdate`.
    pub ghc_active: bool,
}

impl Default for FlowSequencerConfig {
    fn default() -> Self {
        let mut per_state = HashMap::new();
        per_state.insert(
            MachineState::Espresso,
            ActiveStateConfig {
                first_drops_threshold: 0.2,
                last_drops_minimum_time: 3.0,
                ..Default::default()
            },
        );
        per_state.insert(
            MachineState::Steam,
            ActiveStateConfig {
                stop_at_time: Some(60.0),
                stop_at_volume: None,
                stop_at_weight: None,
                ..Default::default()
            },
        );
        per_state.insert(
            MachineState::HotWater,
            ActiveStateConfig {
                stop_at_time: Some(30.0),
                stop_at_volume: Some(200.0),
                stop_at_weight: None,
                ..Default::default()
            },
        );
        per_state.insert(
            MachineState::HotWaterRinse,
            ActiveStateConfig {
                stop_at_time: Some(10.0),
                ..Default::default()
            },
        );
        FlowSequencerConfig {
            per_state,
            watchdog_timeout: Duration::from_secs(270),
            stop_at_weight_adjust: -0.07,
            ghc_active: false,
        }
    }
}

/// Non-null `target_weight`/`target_volume` from a just-loaded profile,
/// applied to the ensuing sequence only when the active state's
/// `profile_can_override_stop_limits` is true.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileOverride {
    pub target_volume: Option<f64>,
    pub target_weight: Option<f64>,
}

struct RunningSequence {
    id: Uuid,
    active_state: MachineState,
    config: ActiveStateConfig,
    gates: HashMap<Gate, GateState>,
    flow_begin_sample_time: Option<f64>,
    volume_pour_at_flow_begin: f64,
    stop_conditions: Vec<StopCondition>,
    last_substate: Substate,
}

impl RunningSequence {
    fn new(id: Uuid, active_state: MachineState, config: ActiveStateConfig, profile: Option<ProfileOverride>) -> Self {
        let mut stop_conditions = Vec::new();
        let target_time = config.stop_at_time;
        let mut target_volume = config.stop_at_volume;
        let mut target_weight = config.stop_at_weight;
        if config.profile_can_override_stop_limits {
            if let Some(profile) = profile {
                if let Some(v) = profile.target_volume {
                    target_volume = Some(v);
                }
                if let Some(w) = profile.target_weight {
                    target_weight = Some(w);
                }
            }
        }
        if let Some(t) = target_time {
            stop_conditions.push(StopCondition::new(StopConditionKind::Time, t));
        }
        if let Some(v) = target_volume {
            stop_conditions.push(StopCondition::new(StopConditionKind::Volume, v));
        }
        if let Some(w) = target_weight {
            stop_conditions.push(StopCondition::new(StopConditionKind::Weight, w));
        }
        let mut gates = HashMap::new();
        for gate in Gate::ALL {
            gates.insert(gate, GateState::Unset);
        }
        RunningSequence {
            id,
            active_state,
            config,
            gates,
            flow_begin_sample_time: None,
            volume_pour_at_flow_begin: 0.0,
            stop_conditions,
            last_substate: Substate::Idle,
        }
    }

    fn set_gate(&mut self, gate: Gate) -> GateState {
        self.gates.insert(gate, GateState::Set);
        GateState::Set
    }

    fn is_set(&self, gate: Gate) -> bool {
        self.gates.get(&gate) == Some(&GateState::Set)
    }
}

struct SequencerState {
    active_state: Option<MachineState>,
    running: Option<RunningSequence>,
    watchdog_deadline: Option<Instant>,
    last_drops_deadline: Option<Instant>,
    pending_profile_override: Option<ProfileOverride>,
}

/// Shot-lifecycle state machine. Cheap to clone (wraps an `Arc`); the
/// background actor loop is spawned once from [`FlowSequencer::spawn`].
#[derive(Clone)]
pub struct FlowSequencer {
    bus: EventBus,
    config: Arc<tokio::sync::RwLock<FlowSequencerConfig>>,
    control: Arc<dyn De1Control>,
    state: Arc<Mutex<SequencerState>>,
}

impl FlowSequencer {
    pub fn new(bus: EventBus, config: FlowSequencerConfig, control: Arc<dyn De1Control>) -> Self {
        FlowSequencer {
            bus,
            config: Arc::new(tokio::sync::RwLock::new(config)),
            control,
            state: Arc::new(Mutex::new(SequencerState {
                active_state: None,
                running: None,
                watchdog_deadline: None,
                last_drops_deadline: None,
                pending_profile_override: None,
            })),
        }
    }

    /// Registers an override to apply to the next sequence only.
    /// Consumed (taken) at that sequence's start.
    pub async fn set_profile_override(&self, profile: ProfileOverride) {
        self.state.lock().await.pending_profile_override = Some(profile);
    }

    pub async fn current_sequence_id(&self) -> Option<Uuid> {
        self.state.lock().await.running.as_ref().map(|r| r.id)
    }

    /// `GET /de1/control/{mode}` — the currently configured stop-at
    /// limits and override flags for `mode`, or `None` if `mode` does not
    /// admit a flow sequence.
    pub async fn control_config(&self, mode: MachineState) -> Option<ActiveStateConfig> {
        self.config.read().await.per_state.get(&mode).copied()
    }

    /// `PATCH /de1/control/{mode}` — replaces the stored configuration
    /// for `mode`. Takes effect starting with the next sequence entering
    /// that state; a sequence already running keeps its snapshot.
    pub async fn set_control_config(&self, mode: MachineState, config: ActiveStateConfig) {
        self.config.write().await.per_state.insert(mode, config);
    }

    /// Whether the DE1 has a Group-Head-Controller, per `/de1/feature_flags`.
    pub async fn ghc_active(&self) -> bool {
        self.config.read().await.ghc_active
    }

    /// Spawns the actor loop consuming `StateUpdate`, `ShotSample`,
    /// `WeightAndFlow`, and `Connectivity` events and driving gates, stop
    /// conditions, and the watchdog. Returns immediately; the loop runs
    /// until the bus is dropped.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        let mut sub = self.bus.subscribe(Some(vec![
            "StateUpdate",
            "ShotSample",
            "WeightAndFlow",
            "Connectivity",
        ]));
        loop {
            let (watchdog_deadline, last_drops_deadline) = {
                let state = self.state.lock().await;
                (state.watchdog_deadline, state.last_drops_deadline)
            };
            tokio::select! {
                event = sub.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
                _ = sleep_until_or_pending(watchdog_deadline), if watchdog_deadline.is_some() => {
                    self.on_watchdog_expired().await;
                }
                _ = sleep_until_or_pending(last_drops_deadline), if last_drops_deadline.is_some() => {
                    self.on_last_drops_elapsed().await;
                }
            }
        }
    }

    async fn handle_event(&self, event: Event) {
        match event.payload {
            EventPayload::StateUpdate(payload) => {
                self.handle_state_update(payload.state, payload.substate).await;
            }
            EventPayload::ShotSample(payload) => {
                self.handle_shot_sample(payload).await;
            }
            EventPayload::WeightAndFlow(payload) => {
                self.handle_weight_and_flow(payload).await;
            }
            EventPayload::Connectivity(ConnectivityPayload { role, connected }) => {
                if role == DeviceRole::De1 && !connected {
                    self.close_sequence(SequenceCloseReason::DeviceLost).await;
                }
            }
            _ => {}
        }
    }

    async fn handle_state_update(&self, new_state: MachineState, new_substate: Substate) {
        let entering_fresh_active = {
            let mut state = self.state.lock().await;
            let prev_active = state.active_state;
            state.active_state = Some(new_state);
            new_state.admits_flow_sequence() && prev_active != Some(new_state) && state.running.is_none()
        };
        if entering_fresh_active {
            self.start_sequence(new_state).await;
        }

        // Gate transitions to emit once the lock is released, collected
        // while it is held so no await happens mid-borrow.
        let mut to_emit: Vec<(Gate, Uuid)> = Vec::new();
        let mut new_last_drops_deadline: Option<Instant> = None;
        let mut exited_active = false;

        {
            let mut state = self.state.lock().await;
            let Some(running) = state.running.as_mut() else {
                return;
            };
            if running.active_state == new_state {
                if running.last_substate == Substate::PreInfuse && new_substate != Substate::PreInfuse {
                    running.set_gate(Gate::ExitPreinfuse);
                    to_emit.push((Gate::ExitPreinfuse, running.id));
                }
                if new_substate == Substate::Ending && running.last_substate != Substate::Ending {
                    running.set_gate(Gate::FlowEnd);
                    to_emit.push((Gate::FlowEnd, running.id));
                    new_last_drops_deadline = Some(
                        Instant::now() + Duration::from_secs_f64(running.config.last_drops_minimum_time.max(0.0)),
                    );
                }
                running.last_substate = new_substate;
            } else if !new_state.admits_flow_sequence() {
                running.set_gate(Gate::FlowStateExit);
                to_emit.push((Gate::FlowStateExit, running.id));
                exited_active = true;
            }
            if new_last_drops_deadline.is_some() {
                state.last_drops_deadline = new_last_drops_deadline;
            }
        }

        for (gate, id) in to_emit {
            self.emit_gate(id, gate, GateState::Set, None);
        }
        if exited_active {
            self.maybe_complete().await;
        }
    }

    async fn start_sequence(&self, active_state: MachineState) {
        let id = Uuid::new_v4();
        let config = self
            .config
            .read()
            .await
            .per_state
            .get(&active_state)
            .copied()
            .unwrap_or_default();

        let profile_override = {
            let mut state = self.state.lock().await;
            state.pending_profile_override.take()
        };

        let scale_ready = self.control.scale_ready().await;
        let mut running = RunningSequence::new(id, active_state, config, profile_override);
        if !scale_ready {
            if let Some(pos) = running
                .stop_conditions
                .iter()
                .position(|c| c.kind == StopConditionKind::Weight)
            {
                running.stop_conditions.remove(pos);
                warn!(sequence_id = %id, "scale not ready, stop-at-weight disabled for this sequence");
            }
        }
        running.set_gate(Gate::SequenceStart);

        let watchdog_timeout = self.config.read().await.watchdog_timeout;
        {
            let mut state = self.state.lock().await;
            state.watchdog_deadline = Some(Instant::now() + watchdog_timeout);
            state.running = Some(running);
        }

        self.emit_gate(id, Gate::SequenceStart, GateState::Set, None);
        for gate in Gate::ALL {
            if gate != Gate::SequenceStart {
                self.emit_gate(id, gate, GateState::Cleared, None);
            }
        }

        if !config.disable_auto_tare && scale_ready {
            if let Err(e) = self.control.tare_scale().await {
                warn!(sequence_id = %id, error = %e, "auto-tare command failed");
            }
            self.bus.publish(
                "flow_sequencer",
                EventPayload::AutoTare(AutoTarePayload {
                    action: AutoTareAction::Enabled,
                }),
            );
        } else {
            self.bus.publish(
                "flow_sequencer",
                EventPayload::AutoTare(AutoTarePayload {
                    action: AutoTareAction::Disabled,
                }),
            );
        }
    }

    async fn handle_shot_sample(&self, sample: ShotSamplePayload) {
        let mut state = self.state.lock().await;
        let Some(running) = state.running.as_mut() else {
            return;
        };
        let id = running.id;

        if !running.is_set(Gate::FlowBegin) && sample.group_flow >= running.config.first_drops_threshold {
            running.set_gate(Gate::FlowBegin);
            running.set_gate(Gate::ExpectDrops);
            running.flow_begin_sample_time = Some(sample.sample_time);
            running.volume_pour_at_flow_begin = sample.volume_pour;
            drop(state);
            self.emit_gate(id, Gate::FlowBegin, GateState::Set, None);
            self.emit_gate(id, Gate::ExpectDrops, GateState::Set, None);
            state = self.state.lock().await;
        }

        let Some(running) = state.running.as_mut() else {
            return;
        };
        let Some(flow_start) = running.flow_begin_sample_time else {
            return;
        };

        for condition in running.stop_conditions.iter_mut() {
            if condition.triggered || !condition.enabled {
                continue;
            }
            let (crossed, current) = match condition.kind {
                StopConditionKind::Time => (sample.sample_time - flow_start >= condition.target, sample.sample_time - flow_start),
                StopConditionKind::Volume => (
                    sample.volume_pour - running.volume_pour_at_flow_begin >= condition.target,
                    sample.volume_pour - running.volume_pour_at_flow_begin,
                ),
                StopConditionKind::Weight => continue, // handled on WeightAndFlow samples
            };
            if crossed {
                condition.triggered = true;
                drop(state);
                self.trigger_stop(id, condition.kind, condition.target, current).await;
                return;
            }
        }
    }

    async fn handle_weight_and_flow(&self, payload: WeightAndFlowPayload) {
        let mut state = self.state.lock().await;
        let Some(running) = state.running.as_mut() else {
            return;
        };
        let id = running.id;
        if running.flow_begin_sample_time.is_none() {
            return;
        }
        for condition in running.stop_conditions.iter_mut() {
            if condition.kind != StopConditionKind::Weight || condition.triggered || !condition.enabled {
                continue;
            }
            let stop_at_weight_adjust = self.config.read().await.stop_at_weight_adjust;
            let offset = payload.average_flow * stop_at_weight_adjust.abs();
            let effective_target = condition.target - offset;
            if payload.current_weight >= effective_target {
                condition.triggered = true;
                drop(state);
                self.trigger_stop(id, StopConditionKind::Weight, condition.target, payload.current_weight)
                    .await;
                return;
            }
        }
    }

    async fn trigger_stop(&self, sequence_id: Uuid, kind: StopConditionKind, target: f64, current: f64) {
        if let Err(e) = self.control.request_state(MachineState::Idle).await {
            warn!(sequence_id = %sequence_id, error = %e, "failed to issue StateRequest(Idle) on stop-at trigger");
        }
        let header = pyde1_core::message::EventHeader::new_now("flow_sequencer").with_sequence_id(sequence_id);
        self.bus.publish_event(Event {
            header,
            payload: EventPayload::StopAt(StopAtPayload {
                kind,
                action: StopAtAction::Triggered,
                target,
                current,
            }),
        });
    }

    async fn on_watchdog_expired(&self) {
        let id = {
            let mut state = self.state.lock().await;
            state.watchdog_deadline = None;
            state.running.as_ref().map(|r| r.id)
        };
        if let Some(id) = id {
            warn!(sequence_id = %id, "sequence watchdog expired, force-closing");
            let _ = self.control.request_state(MachineState::Idle).await;
            self.close_sequence(SequenceCloseReason::Watchdog).await;
        }
    }

    async fn on_last_drops_elapsed(&self) {
        let id = {
            let mut state = self.state.lock().await;
            state.last_drops_deadline = None;
            let Some(running) = state.running.as_mut() else {
                return;
            };
            running.set_gate(Gate::LastDrops);
            running.id
        };
        self.emit_gate(id, Gate::LastDrops, GateState::Set, None);
        self.maybe_complete().await;
    }

    /// Closes the current sequence once both `FlowStateExit` and
    /// `LastDrops` are Set.
    async fn maybe_complete(&self) {
        let ready = {
            let state = self.state.lock().await;
            state
                .running
                .as_ref()
                .map(|r| r.is_set(Gate::FlowStateExit) && r.is_set(Gate::LastDrops))
                .unwrap_or(false)
        };
        if ready {
            self.close_sequence(SequenceCloseReason::Normal).await;
        }
    }

    async fn close_sequence(&self, reason: SequenceCloseReason) {
        let id = {
            let mut state = self.state.lock().await;
            state.watchdog_deadline = None;
            state.last_drops_deadline = None;
            let id = state.running.as_ref().map(|r| r.id);
            state.running = None;
            id
        };
        if let Some(id) = id {
            self.emit_gate(id, Gate::SequenceComplete, GateState::Set, Some(reason));
        }
    }

    fn emit_gate(&self, sequence_id: Uuid, gate: Gate, state: GateState, reason: Option<SequenceCloseReason>) {
        let header = pyde1_core::message::EventHeader::new_now("flow_sequencer").with_sequence_id(sequence_id);
        self.bus.publish_event(Event {
            header,
            payload: EventPayload::SequencerGate(SequencerGatePayload {
                gate,
                state,
                reason,
            }),
        });
    }
}

/// Resolves to the current deadline if set, otherwise never resolves. Lets
/// the watchdog/last-drops arms of the `select!` be conditionally armed
/// without an `Option<Sleep>` pin-project.
async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pyde1_core::message::{DeviceRole, StateUpdatePayload};
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::sync::atomic::Ordering;

    struct FakeControl {
        scale_ready: AtomicBool,
        tare_calls: AtomicU32,
        state_requests: Mutex<Vec<MachineState>>,
    }

    #[async_trait]
    impl De1Control for FakeControl {
        async fn request_state(&self, state: MachineState) -> Result<(), DeviceError> {
            self.state_requests.lock().await.push(state);
            Ok(())
        }
        async fn tare_scale(&self) -> Result<(), DeviceError> {
            self.tare_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn scale_ready(&self) -> bool {
            self.scale_ready.load(Ordering::SeqCst)
        }
    }

    fn fake_control(scale_ready: bool) -> Arc<FakeControl> {
        Arc::new(FakeControl {
            scale_ready: AtomicBool::new(scale_ready),
            tare_calls: AtomicU32::new(0),
            state_requests: Mutex::new(Vec::new()),
        })
    }

    fn publish_state(bus: &EventBus, state: MachineState, substate: Substate) {
        bus.publish(
            "de1",
            EventPayload::StateUpdate(StateUpdatePayload { state, substate }),
        );
    }

    fn publish_sample(bus: &EventBus, sample_time: f64, flow: f64, volume_pour: f64) {
        bus.publish(
            "de1",
            EventPayload::ShotSample(ShotSamplePayload {
                sample_time,
                group_pressure: 6.0,
                group_flow: flow,
                mix_temp: 92.0,
                head_temp: 92.0,
                volume_pour,
            }),
        );
    }

    #[tokio::test]
    async fn full_gate_lifecycle_reaches_sequence_complete() {
        let bus = EventBus::new();
        let control = fake_control(true);
        let mut gates = bus.subscribe(Some(vec!["SequencerGate"]));
        let sequencer = FlowSequencer::new(bus.clone(), FlowSequencerConfig::default(), control.clone());
        let _handle = sequencer.clone().spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;

        publish_state(&bus, MachineState::Espresso, Substate::PreInfuse);
        publish_sample(&bus, 0.0, 0.0, 0.0);
        publish_sample(&bus, 1.0, 0.5, 0.5);
        publish_state(&bus, MachineState::Espresso, Substate::Pour);
        publish_state(&bus, MachineState::Espresso, Substate::Ending);
        publish_state(&bus, MachineState::Idle, Substate::Idle);

        let mut seen = Vec::new();
        for _ in 0..9 {
            let event = tokio::time::timeout(Duration::from_millis(200), gates.recv())
                .await
                .expect("gate event")
                .expect("bus open");
            if let EventPayload::SequencerGate(payload) = event.payload {
                seen.push(payload.gate);
            }
        }
        assert!(seen.contains(&Gate::SequenceStart));
        assert!(seen.contains(&Gate::FlowBegin));
        assert!(seen.contains(&Gate::ExitPreinfuse));
        assert!(seen.contains(&Gate::FlowEnd));
        assert!(seen.contains(&Gate::FlowStateExit));

        tokio::time::sleep(Duration::from_secs(4)).await;
        let complete = tokio::time::timeout(Duration::from_millis(200), gates.recv())
            .await
            .expect("last drops / complete")
            .expect("bus open");
        assert!(matches!(
            complete.payload,
            EventPayload::SequencerGate(SequencerGatePayload { gate: Gate::LastDrops, .. })
        ));
        let complete2 = tokio::time::timeout(Duration::from_millis(200), gates.recv())
            .await
            .expect("complete")
            .expect("bus open");
        assert!(matches!(
            complete2.payload,
            EventPayload::SequencerGate(SequencerGatePayload { gate: Gate::SequenceComplete, .. })
        ));
        assert_eq!(control.tare_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn saw_triggers_exactly_once_per_sequence() {
        let bus = EventBus::new();
        let control = fake_control(true);
        let mut config = FlowSequencerConfig::default();
        config.per_state.insert(
            MachineState::Espresso,
            ActiveStateConfig {
                stop_at_weight: Some(46.0),
                first_drops_threshold: 0.0,
                ..Default::default()
            },
        );
        let mut stops = bus.subscribe(Some(vec!["StopAt"]));
        let sequencer = FlowSequencer::new(bus.clone(), config, control.clone());
        let _handle = sequencer.clone().spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;

        publish_state(&bus, MachineState::Espresso, Substate::Pour);
        publish_sample(&bus, 0.0, 2.0, 0.0);
        bus.publish(
            "scale",
            EventPayload::WeightAndFlow(WeightAndFlowPayload {
                current_weight: 45.86,
                current_weight_time: 20.0,
                average_flow: 2.0,
            }),
        );
        // A second crossing sample in the same tick must not re-trigger.
        bus.publish(
            "scale",
            EventPayload::WeightAndFlow(WeightAndFlowPayload {
                current_weight: 46.5,
                current_weight_time: 20.1,
                average_flow: 2.0,
            }),
        );

        let triggered = tokio::time::timeout(Duration::from_millis(200), stops.recv())
            .await
            .expect("stop-at event")
            .expect("bus open");
        if let EventPayload::StopAt(payload) = triggered.payload {
            assert_eq!(payload.kind, StopConditionKind::Weight);
            assert_eq!(payload.target, 46.0);
            assert!((payload.current - 45.86).abs() < 1e-9);
        } else {
            panic!("expected StopAt payload");
        }
        assert!(tokio::time::timeout(Duration::from_millis(100), stops.recv())
            .await
            .is_err());
        assert_eq!(control.state_requests.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_scale_disables_saw_without_blocking_sequence() {
        let bus = EventBus::new();
        let control = fake_control(false);
        let mut config = FlowSequencerConfig::default();
        config.per_state.insert(
            MachineState::Espresso,
            ActiveStateConfig {
                stop_at_weight: Some(40.0),
                disable_auto_tare: true,
                ..Default::default()
            },
        );
        let mut gates = bus.subscribe(Some(vec!["SequencerGate"]));
        let sequencer = FlowSequencer::new(bus.clone(), config, control);
        let _handle = sequencer.clone().spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;

        publish_state(&bus, MachineState::Espresso, Substate::Pour);
        let start = tokio::time::timeout(Duration::from_millis(200), gates.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            start.payload,
            EventPayload::SequencerGate(SequencerGatePayload { gate: Gate::SequenceStart, .. })
        ));
        // weight sample should not panic or trigger anything since SAW was dropped
        bus.publish(
            "scale",
            EventPayload::WeightAndFlow(WeightAndFlowPayload {
                current_weight: 100.0,
                current_weight_time: 1.0,
                average_flow: 1.0,
            }),
        );
        assert!(tokio::time::timeout(Duration::from_millis(100), gates.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn de1_disconnect_closes_sequence_as_device_lost() {
        let bus = EventBus::new();
        let control = fake_control(true);
        let mut gates = bus.subscribe(Some(vec!["SequencerGate"]));
        let sequencer = FlowSequencer::new(bus.clone(), FlowSequencerConfig::default(), control);
        let _handle = sequencer.clone().spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;

        publish_state(&bus, MachineState::Espresso, Substate::Pour);
        let _ = tokio::time::timeout(Duration::from_millis(200), gates.recv()).await;

        bus.publish(
            "de1",
            EventPayload::Connectivity(ConnectivityPayload {
                role: DeviceRole::De1,
                connected: false,
            }),
        );
        let complete = tokio::time::timeout(Duration::from_millis(200), gates.recv())
            .await
            .unwrap()
            .unwrap();
        if let EventPayload::SequencerGate(payload) = complete.payload {
            assert_eq!(payload.gate, Gate::SequenceComplete);
            assert_eq!(payload.reason, Some(SequenceCloseReason::DeviceLost));
        } else {
            panic!("expected SequencerGate");
        }
    }
}
