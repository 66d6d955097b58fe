//! Constructor methods and classification helpers for FleetError

use super::types::FleetError;

impl FleetError {
    pub fn vm_not_found(id_or_name: impl Into<String>) -> Self {
        FleetError::VmNotFound {
            id_or_name: id_or_name.into(),
        }
    }

    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        FleetError::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn malformed_netspec(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        FleetError::MalformedNetSpec {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        FleetError::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn operation_failed(operation: impl Into<String>, details: impl Into<String>) -> Self {
        FleetError::VmOperationFailed {
            operation: operation.into(),
            details: details.into(),
        }
    }

    pub fn bridge(operation: impl Into<String>, details: impl Into<String>) -> Self {
        FleetError::Bridge {
            operation: operation.into(),
            details: details.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        FleetError::Internal {
            message: message.into(),
        }
    }

    /// True for every not-found flavour (vm, tap position, disk slot).
    ///
    /// Callers use this for flow control, e.g. falling back to a remote host
    /// when a VM is not local.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FleetError::VmNotFound { .. }
                | FleetError::TapNotFound { .. }
                | FleetError::DiskNotFound { .. }
        )
    }

    /// True when the caller supplied bad input and nothing was mutated.
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            FleetError::MalformedNetSpec { .. }
                | FleetError::InvalidInput { .. }
                | FleetError::UnknownVmKind(_)
        )
    }
}

/// Checks a rendered error string for the vm-not-found marker.
///
/// Responses cross the mesh with their error flattened to text, so remote
/// callers cannot match on the enum.
pub fn is_vm_not_found_message(error: &str) -> bool {
    error.starts_with("vm not found: ")
}
