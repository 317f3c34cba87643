//! Error taxonomy for codec, configuration, and coordination failures.

use std::path::PathBuf;

use thiserror::Error;

use crate::fallback::Degradation;
use crate::scheduler::ReservationViolation;
use crate::types::{Millis, VehicleId};

/// Structural problems found while decoding a wire payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("bad frame magic")]
    BadMagic,

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown payload kind {0}")]
    UnknownKind(u8),

    #[error("frame checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("{field} too large to encode ({len})")]
    Oversized { field: &'static str, len: usize },

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("json payload rejected: {0}")]
    Json(String),
}

/// Failures of the coordination core.
///
/// Only `ReservationViolation` is a safety alarm; every other variant is
/// recoverable and biases the agent toward yielding.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoordinationError {
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] CodecError),

    #[error("stale state for {vehicle}: age {age_ms}ms exceeds {max_age_ms}ms")]
    StaleState {
        vehicle: VehicleId,
        age_ms: Millis,
        max_age_ms: Millis,
    },

    #[error("scheduler inconsistency for {vehicle} after {rounds} reconciliation rounds")]
    SchedulerInconsistency { vehicle: VehicleId, rounds: usize },

    #[error("degraded information: {0}")]
    DegradedInformation(Degradation),

    #[error("reservation violation: {0}")]
    ReservationViolation(ReservationViolation),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
