//! Managed Bluetooth Device layer: a per-role lifecycle supervisor keeping
//! a logical device (DE1, scale, thermometer) reachable, initialised, and
//! substitutable by physical model.

pub mod managed_device;
pub mod scratch;
pub mod specialization;
pub mod transport;

pub use managed_device::{LifecycleState, ManagedDevice, ReconnectPolicy};
pub use scratch::ScratchArea;
pub use specialization::SpecializationRegistry;
pub use transport::{BtleplugTransport, DeviceCommand, Transport, CONNECT_TIMEOUT};
