//! Tests for error classification and conversions

use super::constructors::is_vm_not_found_message;
use super::*;
use crate::types::{VmId, VmState};

#[test]
fn test_not_found_marker_covers_every_flavour() {
    assert!(FleetError::vm_not_found("foo").is_not_found());
    assert!(FleetError::TapNotFound { position: 3, count: 1 }.is_not_found());
    assert!(FleetError::DiskNotFound { disk: "hotplug0".into() }.is_not_found());
    assert!(!FleetError::internal("boom").is_not_found());
}

#[test]
fn test_not_found_message_keeps_identifier() {
    let err = FleetError::vm_not_found("web[0-2]");
    assert_eq!(err.to_string(), "vm not found: web[0-2]");
    assert!(is_vm_not_found_message(&err.to_string()));
    assert!(!is_vm_not_found_message("bridge not found: br0"));
}

#[test]
fn test_tap_position_message() {
    let err = FleetError::TapNotFound { position: 2, count: 1 };
    assert_eq!(err.to_string(), "no network 2, VM only has 1 networks");
}

#[test]
fn test_invalid_state_names_state() {
    let err = FleetError::InvalidState {
        operation: "kill".into(),
        id: VmId(4),
        state: VmState::QUIT,
    };
    assert_eq!(err.to_string(), "invalid VM state to kill: vm 4 is quit");
}

#[test]
fn test_format_errors_one_per_line() {
    let errors = vec![FleetError::vm_not_found("a"), FleetError::vm_not_found("b")];
    assert_eq!(format_errors(&errors), "vm not found: a\nvm not found: b");
}

#[tokio::test]
async fn test_join_error_conversion() {
    async fn run() -> FleetResult<()> {
        let handle = tokio::spawn(async { panic!("test panic") });
        handle.await?;
        Ok(())
    }

    match run().await {
        Err(FleetError::Internal { message }) => assert!(message.contains("Task panicked")),
        other => panic!("expected internal error, got {:?}", other),
    }
}

#[test]
fn test_bincode_error_conversion() {
    fn decode(bytes: &[u8]) -> FleetResult<String> {
        Ok(bincode::deserialize::<String>(bytes)?)
    }

    assert!(matches!(decode(&[0xff]), Err(FleetError::Serialization(_))));
}
