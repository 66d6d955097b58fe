pub mod aggregate;
pub mod command;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod network;
pub mod node_shared;
pub mod registry;
pub mod target;
pub mod types;
pub mod vm;
pub mod vm_config;

pub use aggregate::{FleetVms, MeshTransport};
pub use command::{Command, Response, ResponseData};
pub use config::{Config, ConfigBuilder};
pub use error::{FleetError, FleetResult};
pub use node_shared::{CommandHandler, SharedNodeState};
pub use registry::{LaunchOutcome, LaunchResults, VmRegistry};
pub use target::{apply, TargetOutcome, WILDCARD};
pub use types::{NetConfig, VmId, VmInfo, VmKind, VmState};
pub use vm::{BaseVm, Vm, VmFactory, VmFactoryRegistry, VmVariant};
