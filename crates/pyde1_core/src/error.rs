//! pyde1-core Error Structs/Enums, representing the taxonomy from the error
//! handling design: device-not-connected, unsupported transitions, schema
//! validation, timeouts, transport failures, and the fatal/supervisor path.

use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type PyDe1Result<T = ()> = Result<T, PyDe1Error>;

/// Errors raised by the Managed Bluetooth Device layer.
#[derive(Debug, Error, Display, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceError {
    /// device for role {0} is not connected
    DeviceNotConnected(String),
    /// device for role {0} does not support this command
    UnsupportedFeature(String),
    /// capture of {0} timed out after {1}ms
    CaptureTimeout(String, u64),
    /// transport error while talking to {0}: {1}
    TransportError(String, String),
    /// address for role {0} is already assigned to {1}
    AddressAlreadyAssigned(String, String),
}

/// Errors raised by the FlowSequencer while gating a sequence.
#[derive(Debug, Error, Display, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequencerError {
    /// {0} is not a valid active state for a flow sequence
    NotAnActiveState(String),
    /// requested transition from {0} to {1} is not supported in the current state
    UnsupportedStateTransition(String, String),
    /// sequence watchdog ({0}s) expired before SequenceComplete
    WatchdogExpired(u64),
    /// no sequence is currently open
    NoOpenSequence,
}

/// Errors raised while validating or decoding a request payload.
#[derive(Debug, Error, Display, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationError {
    /// field {0}: expected {1}
    TypeError(String, String),
    /// field {0}: {1}
    ValueError(String, String),
    /// unknown configuration key {0} (ignored)
    UnknownKey(String),
}

/// Errors raised by the Sequence Recorder / History Store.
#[derive(Debug, Error, Display, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreError {
    /// store schema is at version {0}, process only understands up to {1}
    SchemaTooNew(i64, i64),
    /// sequence {0} is not closed, cannot export
    IncompleteSequenceRecord(String),
    /// underlying store error: {0}
    Backend(String),
}

/// Aggregation enum for all pyde1-core error types, one variant per
/// per-area error enum.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PyDe1Error {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// operation exceeded its configured deadline
    #[error("operation timed out after {0}ms")]
    Timeout(u64),
    /// fatal error, supervisor should log, drain, and exit non-zero
    #[error("fatal: {0}")]
    Fatal(String),
}

impl PyDe1Error {
    /// HTTP status code this error maps to, per the error handling design:
    /// 400 bad input, 409 unsupported transition / not connected, 418 missing
    /// capability, 501 unsupported method, 500 otherwise.
    pub fn http_status(&self) -> u16 {
        match self {
            PyDe1Error::Validation(_) => 400,
            PyDe1Error::Device(DeviceError::DeviceNotConnected(_)) => 409,
            PyDe1Error::Device(DeviceError::UnsupportedFeature(_)) => 418,
            PyDe1Error::Sequencer(SequencerError::UnsupportedStateTransition(_, _)) => 409,
            PyDe1Error::Timeout(_) => 409,
            PyDe1Error::Fatal(_) => 500,
            _ => 500,
        }
    }
}
