//! Typed event payloads carried on the [`crate::bus::EventBus`], plus the
//! small vocabulary (`DeviceRole`, `Gate`, `MachineState`, `Substate`,
//! `StopCondition`) shared by every subsystem that produces or consumes
//! them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel `sequence_id` used for events that arrive outside any open
/// sequence (ring-buffer / pre-sequence events).
pub const NO_SEQUENCE: Uuid = Uuid::nil();

/// Event schema tag carried in every published payload, bumped only on a
/// wire-incompatible change.
pub const EVENT_SCHEMA_VERSION: &str = "1.0";

/// One logical role a Bluetooth peripheral can occupy. Exactly one
/// [`crate::device`]-level handle exists per role at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceRole {
    De1,
    Scale,
    Thermometer,
    Other,
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceRole::De1 => "de1",
            DeviceRole::Scale => "scale",
            DeviceRole::Thermometer => "thermometer",
            DeviceRole::Other => "other",
        };
        f.write_str(s)
    }
}

/// Coarse DE1 machine state, observed via `StateUpdate` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineState {
    Sleep,
    Idle,
    Espresso,
    Steam,
    HotWater,
    HotWaterRinse,
    Clean,
    Descale,
    Transport,
    AirPurge,
    Refill,
}

impl MachineState {
    /// States that admit a flow sequence, per the per-state configuration
    /// table.
    pub fn admits_flow_sequence(self) -> bool {
        matches!(
            self,
            MachineState::Espresso
                | MachineState::Steam
                | MachineState::HotWater
                | MachineState::HotWaterRinse
        )
    }
}

/// Finer-grained DE1 substate within a [`MachineState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Substate {
    PreInfuse,
    Pour,
    Pouring,
    Flush,
    Ending,
    Idle,
}

/// A latch bound to a sequence, whose set/clear transitions are themselves
/// events demarcating shot phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gate {
    SequenceStart,
    FlowBegin,
    ExpectDrops,
    ExitPreinfuse,
    FlowEnd,
    FlowStateExit,
    LastDrops,
    SequenceComplete,
}

impl Gate {
    pub const ALL: [Gate; 8] = [
        Gate::SequenceStart,
        Gate::FlowBegin,
        Gate::ExpectDrops,
        Gate::ExitPreinfuse,
        Gate::FlowEnd,
        Gate::FlowStateExit,
        Gate::LastDrops,
        Gate::SequenceComplete,
    ];
}

/// Tri-state value a [`Gate`] can be latched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GateState {
    Unset,
    Set,
    Cleared,
}

/// Which physical quantity a stop condition compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopConditionKind {
    Time,
    Volume,
    Weight,
}

/// A configured stop-at limit: target value, whether it is active for the
/// current state, and its armed/triggered progress for the current
/// sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopCondition {
    pub kind: StopConditionKind,
    pub enabled: bool,
    pub target: f64,
    pub armed: bool,
    pub triggered: bool,
}

impl StopCondition {
    pub fn new(kind: StopConditionKind, target: f64) -> Self {
        StopCondition {
            kind,
            enabled: true,
            target,
            armed: true,
            triggered: false,
        }
    }
}

/// Reason a sequence was force-closed other than through the ordinary gate
/// progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceCloseReason {
    Normal,
    Watchdog,
    DeviceLost,
}

/// Why a stop condition fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopAtAction {
    Triggered,
}

/// Header fields common to every published event, mirroring the data
/// model's `Event` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHeader {
    pub version: String,
    pub sender: String,
    pub sequence_id: Uuid,
    pub arrival_time: chrono::DateTime<chrono::Utc>,
    pub create_time: chrono::DateTime<chrono::Utc>,
    /// Monotonic nanoseconds since bus start, stamped by
    /// [`crate::bus::EventBus::publish`].
    pub event_time: u64,
}

impl EventHeader {
    /// A header with `arrival_time == create_time == now`, `sequence_id`
    /// defaulted to the pre-sequence sentinel, and `event_time` left at
    /// zero for the bus to stamp on publish.
    pub fn new_now(sender: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        EventHeader {
            version: EVENT_SCHEMA_VERSION.to_string(),
            sender: sender.into(),
            sequence_id: NO_SEQUENCE,
            arrival_time: now,
            create_time: now,
            event_time: 0,
        }
    }

    pub fn with_sequence_id(mut self, id: Uuid) -> Self {
        self.sequence_id = id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdatePayload {
    pub state: MachineState,
    pub substate: Substate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotSamplePayload {
    pub sample_time: f64,
    pub group_pressure: f64,
    pub group_flow: f64,
    pub mix_temp: f64,
    pub head_temp: f64,
    pub volume_pour: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightAndFlowPayload {
    pub current_weight: f64,
    pub current_weight_time: f64,
    pub average_flow: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterLevelPayload {
    pub level_mm: f64,
    pub low_water_threshold_mm: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencerGatePayload {
    pub gate: Gate,
    pub state: GateState,
    pub reason: Option<SequenceCloseReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopAtPayload {
    pub kind: StopConditionKind,
    pub action: StopAtAction,
    pub target: f64,
    pub current: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleTarePayload {
    pub weight_at_tare: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoTareAction {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoTarePayload {
    pub action: AutoTareAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleButton {
    Tare,
    Units,
    TimerStartStop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleButtonPayload {
    pub button: ScaleButton,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityPayload {
    pub role: DeviceRole,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
    NotPresent,
    Capturing,
    Captured,
    Ready,
    Releasing,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAvailabilityPayload {
    pub role: DeviceRole,
    pub availability: Availability,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceChangedPayload {
    pub role: DeviceRole,
    pub specific_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueDotUpdatePayload {
    pub label: String,
    pub value: f64,
}

/// The kind-specific body of an [`Event`]. Tagged `class` on the wire so the
/// MQTT notification surface matches `{TOPIC_ROOT}/{Kind}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum EventPayload {
    StateUpdate(StateUpdatePayload),
    ShotSample(ShotSamplePayload),
    WeightAndFlow(WeightAndFlowPayload),
    WaterLevel(WaterLevelPayload),
    SequencerGate(SequencerGatePayload),
    StopAt(StopAtPayload),
    ScaleTare(ScaleTarePayload),
    AutoTare(AutoTarePayload),
    ScaleButton(ScaleButtonPayload),
    Connectivity(ConnectivityPayload),
    DeviceAvailability(DeviceAvailabilityPayload),
    DeviceChanged(DeviceChangedPayload),
    BlueDotUpdate(BlueDotUpdatePayload),
}

impl EventPayload {
    /// The `Kind` segment used both as the notification topic suffix and as
    /// the per-event-table name root in the store.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::StateUpdate(_) => "StateUpdate",
            EventPayload::ShotSample(_) => "ShotSample",
            EventPayload::WeightAndFlow(_) => "WeightAndFlow",
            EventPayload::WaterLevel(_) => "WaterLevel",
            EventPayload::SequencerGate(_) => "SequencerGate",
            EventPayload::StopAt(_) => "StopAt",
            EventPayload::ScaleTare(_) => "ScaleTare",
            EventPayload::AutoTare(_) => "AutoTare",
            EventPayload::ScaleButton(_) => "ScaleButton",
            EventPayload::Connectivity(_) => "Connectivity",
            EventPayload::DeviceAvailability(_) => "DeviceAvailability",
            EventPayload::DeviceChanged(_) => "DeviceChanged",
            EventPayload::BlueDotUpdate(_) => "BlueDotUpdate",
        }
    }
}

/// A fully-stamped event as it travels on the bus and into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub header: EventHeader,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(sender: impl Into<String>, payload: EventPayload) -> Self {
        Event {
            header: EventHeader::new_now(sender),
            payload,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn event_round_trips_through_json() {
        let ev = Event::new(
            "de1",
            EventPayload::WaterLevel(WaterLevelPayload {
                level_mm: 40.0,
                low_water_threshold_mm: 5.0,
            }),
        );
        let json = serde_json::to_string(&ev).expect("serialize");
        let back: Event = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(ev, back);
        assert_eq!(back.kind(), "WaterLevel");
    }

    #[test]
    fn fresh_header_defaults_to_no_sequence() {
        let header = EventHeader::new_now("scale");
        assert_eq!(header.sequence_id, NO_SEQUENCE);
        assert_eq!(header.arrival_time, header.create_time);
    }
}
