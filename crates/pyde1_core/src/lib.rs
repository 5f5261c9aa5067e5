//! Shared vocabulary for the pyde1 workspace: the event bus, the typed
//! event payloads that travel on it, the error taxonomy every other crate
//! converts into, and the configuration record loaded at process start.

pub mod bus;
pub mod config;
pub mod error;
pub mod message;

pub use bus::{EventBus, Subscription};
pub use config::PyDe1Config;
pub use error::{DeviceError, PyDe1Error, PyDe1Result, SequencerError, StoreError, ValidationError};
pub use message::{Event, EventPayload};
