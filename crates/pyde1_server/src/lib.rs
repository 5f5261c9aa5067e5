//! FlowSequencer shot-lifecycle state machine and the DE1 Device Manager
//! that wires the three Managed Bluetooth Device roles, the sequencer, and
//! the bus together.

pub mod device;
pub mod sequencer;

pub use device::De1DeviceManager;
pub use sequencer::{ActiveStateConfig, De1Control, FlowSequencer, FlowSequencerConfig, ProfileOverride};
