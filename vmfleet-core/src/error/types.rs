//! Core error types for vmfleet

use crate::types::{VmId, VmKind, VmState};
use thiserror::Error;

/// Error type for every orchestration operation
#[derive(Error, Debug)]
pub enum FleetError {
    // Not found
    #[error("vm not found: {id_or_name}")]
    VmNotFound { id_or_name: String },

    #[error("no network {position}, VM only has {count} networks")]
    TapNotFound { position: usize, count: usize },

    #[error("hotplug disk not found: {disk}")]
    DiskNotFound { disk: String },

    // Wrong variant
    #[error("vm is not a {expected}: {id_or_name}")]
    WrongVariant { id_or_name: String, expected: VmKind },

    // Invalid state
    #[error("invalid VM state to {operation}: vm {id} is {state}")]
    InvalidState {
        operation: String,
        id: VmId,
        state: VmState,
    },

    // Malformed input
    #[error("malformed netspec '{spec}': {reason}")]
    MalformedNetSpec { spec: String, reason: String },

    #[error("invalid {field}: {message}")]
    InvalidInput { field: String, message: String },

    #[error("invalid VMType: {0}")]
    UnknownVmKind(String),

    // Network plumbing
    #[error("bridge not found: {0}")]
    BridgeNotFound(String),

    #[error("bridge operation '{operation}' failed: {details}")]
    Bridge { operation: String, details: String },

    // Lifecycle
    #[error("VM operation '{operation}' failed: {details}")]
    VmOperationFailed { operation: String, details: String },

    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    // Environment
    #[error("environment error: {details}")]
    Environment { details: String },

    // Mesh
    #[error("mesh error from {host}: {details}")]
    Mesh { host: String, details: String },

    // Configuration
    #[error("Configuration error in {component}: {message}")]
    Configuration { component: String, message: String },

    // System
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] Box<bincode::ErrorKind>),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Joins several errors into one line for response text
pub fn format_errors(errors: &[FleetError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

pub type FleetResult<T> = std::result::Result<T, FleetError>;
