//! Error conversion implementations for FleetError

use super::types::FleetError;

impl From<tokio::task::JoinError> for FleetError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            FleetError::internal(format!("Task panicked: {}", err))
        } else {
            FleetError::internal(format!("Task cancelled: {}", err))
        }
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(err: toml::de::Error) -> Self {
        FleetError::configuration("toml", err.to_string())
    }
}
