// Common test utilities and helpers for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use vmfleet_core::network::InMemoryBridges;
use vmfleet_core::{
    Command, ConfigBuilder, FleetError, FleetResult, MeshTransport, Response, SharedNodeState,
    VmFactoryRegistry,
};

/// Test configuration constants
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A node with mock VM factories and in-memory bridges, rooted in `dir`
pub fn test_node(hostname: &str, dir: &TempDir) -> SharedNodeState {
    let config = ConfigBuilder::new()
        .hostname(hostname)
        .base_dir(dir.path())
        .build()
        .unwrap();
    SharedNodeState::new(
        config,
        VmFactoryRegistry::default(),
        Arc::new(InMemoryBridges::with_bridges(["mega_bridge"])),
    )
    .unwrap()
}

pub async fn launch(node: &SharedNodeState, names: &str) -> Response {
    node.process(&Command::new("vm launch").arg("kind", "kvm").arg("name", names))
        .await
}

enum Peer {
    Node(Arc<SharedNodeState>),
    Unreachable,
}

/// In-process mesh. Commands and responses go through bincode like they
/// would on the wire.
pub struct MockMesh {
    hostname: String,
    peers: BTreeMap<String, Peer>,
}

impl MockMesh {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            peers: BTreeMap::new(),
        }
    }

    pub fn with_peer(mut self, node: Arc<SharedNodeState>) -> Self {
        self.peers
            .insert(node.hostname().to_string(), Peer::Node(node));
        self
    }

    pub fn with_unreachable(mut self, hostname: &str) -> Self {
        self.peers.insert(hostname.to_string(), Peer::Unreachable);
        self
    }
}

#[async_trait]
impl MeshTransport for MockMesh {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn broadcast_recipients(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    async fn send(&self, host: &str, cmd: &Command) -> FleetResult<Vec<Response>> {
        let unreachable = || FleetError::Mesh {
            host: host.to_string(),
            details: "connection refused".to_string(),
        };

        match self.peers.get(host) {
            Some(Peer::Node(node)) => {
                let wire = bincode::serialize(cmd)?;
                let cmd: Command = bincode::deserialize(&wire)?;
                let response = node.process(&cmd).await;
                let wire = bincode::serialize(&vec![response])?;
                Ok(bincode::deserialize(&wire)?)
            }
            Some(Peer::Unreachable) | None => Err(unreachable()),
        }
    }
}
