//! Fields and behaviour shared by every VM variant

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, instrument, warn};

use crate::error::{FleetError, FleetResult};
use crate::network::{BandwidthStats, BridgeManager};
use crate::types::{NetConfig, VmId, VmInfo, VmKind, VmState, DISCONNECTED_VLAN};
use crate::vm_config::VmConfig;

/// Name of the marker file holding the current state
pub const STATE_FILE: &str = "state";

/// One-shot cancellation token observed by every task monitoring a VM.
///
/// Firing is idempotent: only the first [`KillSignal::fire`] wakes waiters.
#[derive(Debug, Default)]
pub struct KillSignal {
    fired: AtomicBool,
    notify: Notify,
}

impl KillSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Fires the signal. Returns false if it had already fired.
    pub(crate) fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    /// Resolves once the signal has fired
    pub async fn fired(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
struct BaseState {
    state: VmState,
    networks: Vec<NetConfig>,
    tags: BTreeMap<String, String>,
}

/// Common VM fields, embedded by every concrete variant
#[derive(Debug)]
pub struct BaseVm {
    id: VmId,
    name: String,
    namespace: String,
    kind: VmKind,
    uuid: String,
    instance_path: PathBuf,
    config: VmConfig,
    created_at: DateTime<Utc>,

    inner: Mutex<BaseState>,
    kill: KillSignal,
    /// Serializes network reconfiguration; held across bridge calls
    net_order: tokio::sync::Mutex<()>,
    kill_acks: broadcast::Sender<VmId>,
}

impl BaseVm {
    /// Builds the shared part of a VM from a deep copy of the staged config.
    ///
    /// An empty name becomes `vm-<id>` and a missing UUID is generated.
    pub fn new(
        id: VmId,
        name: &str,
        kind: VmKind,
        config: VmConfig,
        instance_path: PathBuf,
        kill_acks: broadcast::Sender<VmId>,
    ) -> Self {
        let name = if name.is_empty() {
            format!("vm-{}", id)
        } else {
            name.to_string()
        };
        let uuid = config
            .base
            .uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let base = Self {
            id,
            name,
            namespace: config.base.namespace.clone(),
            kind,
            uuid,
            instance_path,
            created_at: Utc::now(),
            inner: Mutex::new(BaseState {
                state: VmState::BUILDING,
                networks: config.base.networks.clone(),
                tags: BTreeMap::new(),
            }),
            config,
            kill: KillSignal::new(),
            net_order: tokio::sync::Mutex::new(()),
            kill_acks,
        };
        base.write_state_file(VmState::BUILDING);
        base
    }

    pub fn id(&self) -> VmId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> VmKind {
        self.kind
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn instance_path(&self) -> &Path {
        &self.instance_path
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn kill_signal(&self) -> &KillSignal {
        &self.kill
    }

    pub fn state(&self) -> VmState {
        self.inner.lock().state
    }

    fn write_state_file(&self, state: VmState) {
        let path = self.instance_path.join(STATE_FILE);
        if let Err(e) = std::fs::write(&path, state.to_string()) {
            warn!("write instance state file {}: {}", path.display(), e);
        }
    }

    /// Unconditionally sets and persists the state
    pub fn set_state(&self, state: VmState) {
        let mut inner = self.inner.lock();
        inner.state = state;
        self.write_state_file(state);
    }

    /// Sets the state only if the current one is in `expected`.
    ///
    /// Returns whether the transition happened. Launch and control paths use
    /// this so they never overwrite a concurrent kill.
    pub fn set_state_if(&self, expected: VmState, state: VmState) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.intersects(expected) {
            return false;
        }
        inner.state = state;
        self.write_state_file(state);
        true
    }

    /// Errors with [`FleetError::InvalidState`] unless the state is in `mask`
    pub fn check_state(&self, operation: &str, mask: VmState) -> FleetResult<()> {
        let state = self.state();
        if state.intersects(mask) {
            Ok(())
        } else {
            Err(FleetError::InvalidState {
                operation: operation.to_string(),
                id: self.id,
                state,
            })
        }
    }

    /// Requests termination.
    ///
    /// Legality is checked and the signal fired under the VM lock, so the
    /// signal fires at most once. Does not wait for the process to exit.
    #[instrument(skip(self), fields(vm_id = %self.id))]
    pub fn kill(&self) -> FleetResult<()> {
        let mut inner = self.inner.lock();

        if !inner.state.intersects(VmState::KILLABLE) {
            return Err(FleetError::InvalidState {
                operation: "kill".to_string(),
                id: self.id,
                state: inner.state,
            });
        }

        if self.kill.is_fired() {
            debug!("vm {} already signalled", self.id);
            return Ok(());
        }

        inner.state = VmState::QUITTING;
        self.write_state_file(VmState::QUITTING);
        self.kill.fire();

        info!("killing vm {}", self.id);
        Ok(())
    }

    /// Records a failed launch: ERROR, or QUIT if a kill already arrived
    pub fn launch_failed(&self) {
        if self.set_state_if(VmState::BUILDING, VmState::ERROR) {
            return;
        }
        if self.set_state_if(VmState::QUITTING, VmState::QUIT) {
            self.ack_kill();
        }
    }

    /// Publishes that a killed VM has actually terminated
    pub fn ack_kill(&self) {
        // no subscribers is fine
        let _ = self.kill_acks.send(self.id);
    }

    /// Removes the instance directory. Repeating it is not an error.
    pub async fn flush_disk(&self) -> FleetResult<()> {
        match tokio::fs::remove_dir_all(&self.instance_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn networks(&self) -> Vec<NetConfig> {
        self.inner.lock().networks.clone()
    }

    /// Records the tap backing network `position`
    pub fn set_tap(&self, position: usize, tap: &str) -> FleetResult<()> {
        let mut inner = self.inner.lock();
        let count = inner.networks.len();
        let net = inner
            .networks
            .get_mut(position)
            .ok_or(FleetError::TapNotFound { position, count })?;
        net.tap = tap.to_string();
        Ok(())
    }

    /// Records a generated MAC for network `position`
    pub fn set_mac(&self, position: usize, mac: &str) -> FleetResult<()> {
        let mut inner = self.inner.lock();
        let count = inner.networks.len();
        let net = inner
            .networks
            .get_mut(position)
            .ok_or(FleetError::TapNotFound { position, count })?;
        net.mac = mac.to_string();
        Ok(())
    }

    pub fn tag(&self, key: &str) -> Option<String> {
        self.inner.lock().tags.get(key).cloned()
    }

    pub fn tags(&self) -> BTreeMap<String, String> {
        self.inner.lock().tags.clone()
    }

    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.lock().tags.insert(key.into(), value.into());
    }

    pub fn clear_tag(&self, key: &str) -> bool {
        self.inner.lock().tags.remove(key).is_some()
    }

    pub fn clear_tags(&self) {
        self.inner.lock().tags.clear();
    }

    /// Copies the current stats of each tap into the network entries
    pub fn update_bandwidth(&self, stats: &BandwidthStats) {
        let mut inner = self.inner.lock();
        for net in inner.networks.iter_mut() {
            net.stats = if net.tap.is_empty() {
                None
            } else {
                stats.get(&net.tap)
            };
        }
    }

    /// Serializes network reconfiguration on this VM
    pub(crate) async fn order_networks(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.net_order.lock().await
    }

    /// Moves network `position` to `bridge` on `vlan`.
    ///
    /// The bridge is resolved before the current connection is touched. If
    /// the tap is detached but the new attach fails, the entry is recorded as
    /// disconnected and the error returned.
    #[instrument(skip(self, bridges), fields(vm_id = %self.id))]
    pub async fn network_connect(
        &self,
        position: usize,
        bridge: &str,
        vlan: i32,
        bridges: &dyn BridgeManager,
    ) -> FleetResult<()> {
        let _ordered = self.order_networks().await;

        let current = {
            let inner = self.inner.lock();
            inner
                .networks
                .get(position)
                .cloned()
                .ok_or(FleetError::TapNotFound {
                    position,
                    count: inner.networks.len(),
                })?
        };

        debug!(
            "moving network connection: {} {} {} -> {} {}",
            self.id, position, current.vlan, bridge, vlan
        );

        bridges.get_bridge(bridge).await?;

        if current.is_connected() {
            bridges.tap_remove(&current.bridge, &current.tap).await?;
        }

        if let Err(e) = bridges.tap_add(bridge, &current.tap, vlan).await {
            if current.is_connected() {
                warn!(
                    "vm {} network {} left disconnected after failed attach: {}",
                    self.id, position, e
                );
                self.mark_disconnected(position);
            }
            return Err(e);
        }

        let mut inner = self.inner.lock();
        if let Some(net) = inner.networks.get_mut(position) {
            net.bridge = bridge.to_string();
            net.vlan = vlan;
        }
        Ok(())
    }

    /// Detaches network `position`. Already disconnected is a no-op.
    #[instrument(skip(self, bridges), fields(vm_id = %self.id))]
    pub async fn network_disconnect(
        &self,
        position: usize,
        bridges: &dyn BridgeManager,
    ) -> FleetResult<()> {
        let _ordered = self.order_networks().await;

        let current = {
            let inner = self.inner.lock();
            inner
                .networks
                .get(position)
                .cloned()
                .ok_or(FleetError::TapNotFound {
                    position,
                    count: inner.networks.len(),
                })?
        };

        if !current.is_connected() {
            return Ok(());
        }

        bridges.tap_remove(&current.bridge, &current.tap).await?;
        self.mark_disconnected(position);
        Ok(())
    }

    fn mark_disconnected(&self, position: usize) {
        let mut inner = self.inner.lock();
        if let Some(net) = inner.networks.get_mut(position) {
            net.bridge.clear();
            net.vlan = DISCONNECTED_VLAN;
        }
    }

    /// Point-in-time snapshot for `vm info` and the mesh
    pub fn info(&self) -> VmInfo {
        let inner = self.inner.lock();
        VmInfo {
            id: self.id,
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            kind: self.kind,
            state: inner.state,
            uuid: self.uuid.clone(),
            vcpus: self.config.base.vcpus,
            memory_mb: self.config.base.memory_mb,
            snapshot: self.config.base.snapshot,
            networks: inner.networks.clone(),
            tags: inner.tags.clone(),
            created_at: self.created_at,
            variant: self.config.variant_info(self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::InMemoryBridges;
    use crate::types::TapStat;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn base_with_networks(dir: &TempDir, networks: Vec<NetConfig>) -> BaseVm {
        let mut config = VmConfig::default();
        config.base.networks = networks;
        let (tx, _) = broadcast::channel(8);
        BaseVm::new(
            VmId(7),
            "",
            VmKind::Kvm,
            config,
            dir.path().to_path_buf(),
            tx,
        )
    }

    fn connected(bridge: &str, tap: &str, vlan: i32) -> NetConfig {
        NetConfig {
            bridge: bridge.into(),
            tap: tap.into(),
            vlan,
            ..Default::default()
        }
    }

    fn marker(dir: &TempDir) -> String {
        std::fs::read_to_string(dir.path().join(STATE_FILE)).unwrap()
    }

    #[tokio::test]
    async fn test_release_waits_for_reconfiguration() {
        let dir = TempDir::new().unwrap();
        let bridges = InMemoryBridges::with_bridges(["br0"]);
        let tap = bridges.tap_create("br0", 10).await.unwrap();
        let base = base_with_networks(&dir, vec![connected("br0", &tap, 10)]);

        let ordered = base.order_networks().await;
        let release = crate::vm::release_networks(&base, &bridges);
        tokio::pin!(release);
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut release)
            .await
            .is_err());
        assert_eq!(bridges.bridge_of(&tap).as_deref(), Some("br0"));

        drop(ordered);
        release.await;
        assert_eq!(bridges.bridge_of(&tap), None);
    }

    #[test]
    fn test_new_defaults() {
        let dir = TempDir::new().unwrap();
        let base = base_with_networks(&dir, vec![]);
        assert_eq!(base.name(), "vm-7");
        assert_eq!(base.state(), VmState::BUILDING);
        assert!(uuid::Uuid::parse_str(base.uuid()).is_ok());
        assert!(base.tags().is_empty());
        assert_eq!(marker(&dir), "building");
    }

    #[test]
    fn test_every_state_write_is_persisted() {
        let dir = TempDir::new().unwrap();
        let base = base_with_networks(&dir, vec![]);

        base.set_state(VmState::RUNNING);
        assert_eq!(marker(&dir), "running");
        assert!(!base.set_state_if(VmState::PAUSED, VmState::RUNNING));
        assert!(base.set_state_if(VmState::RUNNING, VmState::PAUSED));
        assert_eq!(marker(&dir), "paused");
    }

    #[test]
    fn test_kill_legality() {
        for state in [
            VmState::BUILDING,
            VmState::RUNNING,
            VmState::PAUSED,
            VmState::QUITTING,
            VmState::QUIT,
            VmState::ERROR,
        ] {
            let dir = TempDir::new().unwrap();
            let base = base_with_networks(&dir, vec![]);
            base.set_state(state);

            let result = base.kill();
            if state.intersects(VmState::KILLABLE) {
                assert!(result.is_ok(), "kill from {}", state);
                assert_eq!(base.state(), VmState::QUITTING);
                assert!(base.kill_signal().is_fired());
            } else {
                assert!(matches!(result, Err(FleetError::InvalidState { .. })));
                assert_eq!(base.state(), state);
                assert!(!base.kill_signal().is_fired());
            }
        }
    }

    #[test]
    fn test_launch_failed_after_kill_still_terminates() {
        let dir = TempDir::new().unwrap();
        let base = base_with_networks(&dir, vec![]);
        let mut acks = base.kill_acks.subscribe();

        base.kill().unwrap();
        base.launch_failed();

        assert_eq!(base.state(), VmState::QUIT);
        assert_eq!(acks.try_recv().unwrap(), VmId(7));
    }

    #[test]
    fn test_launch_failed() {
        let dir = TempDir::new().unwrap();
        let base = base_with_networks(&dir, vec![]);
        base.launch_failed();
        assert_eq!(base.state(), VmState::ERROR);
        assert_eq!(marker(&dir), "error");
    }

    #[test]
    fn test_signal_fires_once() {
        let signal = KillSignal::new();
        assert!(signal.fire());
        assert!(!signal.fire());
    }

    #[tokio::test]
    async fn test_second_kill_is_harmless() {
        let dir = TempDir::new().unwrap();
        let base = Arc::new(base_with_networks(&dir, vec![]));
        base.set_state(VmState::RUNNING);

        let waiter = {
            let base = base.clone();
            tokio::spawn(async move { base.kill_signal().fired().await })
        };

        base.kill().unwrap();
        base.kill().unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_flush_disk_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("3");
        std::fs::create_dir_all(&path).unwrap();
        let (tx, _) = broadcast::channel(1);
        let base = BaseVm::new(VmId(3), "x", VmKind::Container, VmConfig::default(), path.clone(), tx);

        base.flush_disk().await.unwrap();
        assert!(!path.exists());
        base.flush_disk().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_moves_tap() {
        let dir = TempDir::new().unwrap();
        let bridges = InMemoryBridges::with_bridges(["br0", "br1"]);
        bridges.tap_add("br0", "mega_tap0", 10).await.unwrap();
        let base = base_with_networks(&dir, vec![connected("br0", "mega_tap0", 10)]);

        base.network_connect(0, "br1", 20, &bridges).await.unwrap();

        let net = &base.networks()[0];
        assert_eq!((net.bridge.as_str(), net.vlan), ("br1", 20));
        assert_eq!(bridges.bridge_of("mega_tap0").as_deref(), Some("br1"));
    }

    #[tokio::test]
    async fn test_connect_to_missing_bridge_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let bridges = InMemoryBridges::with_bridges(["br0"]);
        bridges.tap_add("br0", "mega_tap0", 10).await.unwrap();
        let base = base_with_networks(&dir, vec![connected("br0", "mega_tap0", 10)]);
        let before = base.networks();

        let err = base
            .network_connect(0, "nope", 20, &bridges)
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::BridgeNotFound(_)));
        assert_eq!(base.networks(), before);
        assert_eq!(bridges.bridge_of("mega_tap0").as_deref(), Some("br0"));
    }

    #[tokio::test]
    async fn test_failed_attach_leaves_disconnected() {
        let dir = TempDir::new().unwrap();
        let bridges = InMemoryBridges::with_bridges(["br0", "br1"]);
        bridges.tap_add("br0", "mega_tap0", 10).await.unwrap();
        let base = base_with_networks(&dir, vec![connected("br0", "mega_tap0", 10)]);

        bridges.fail_tap_add(true);
        assert!(base.network_connect(0, "br1", 20, &bridges).await.is_err());

        assert!(!base.networks()[0].is_connected());
        assert_eq!(bridges.bridge_of("mega_tap0"), None);
    }

    #[tokio::test]
    async fn test_connect_bad_position() {
        let dir = TempDir::new().unwrap();
        let bridges = InMemoryBridges::with_bridges(["br0"]);
        let base = base_with_networks(&dir, vec![connected("br0", "mega_tap0", 10)]);

        let err = base.network_connect(4, "br0", 1, &bridges).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "no network 4, VM only has 1 networks");
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let bridges = InMemoryBridges::with_bridges(["br0"]);
        bridges.tap_add("br0", "mega_tap0", 10).await.unwrap();
        let base = base_with_networks(&dir, vec![connected("br0", "mega_tap0", 10)]);

        base.network_disconnect(0, &bridges).await.unwrap();
        let after_first = base.networks();
        assert_eq!(after_first[0].vlan, DISCONNECTED_VLAN);
        assert!(after_first[0].bridge.is_empty());

        base.network_disconnect(0, &bridges).await.unwrap();
        assert_eq!(base.networks(), after_first);
        assert!(bridges.taps("br0").is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let dir = TempDir::new().unwrap();
        let bridges = InMemoryBridges::with_bridges(["br0"]);
        bridges.tap_add("br0", "mega_tap0", 10).await.unwrap();
        let base = base_with_networks(&dir, vec![connected("br0", "mega_tap0", 10)]);

        base.network_disconnect(0, &bridges).await.unwrap();
        base.network_connect(0, "br0", 30, &bridges).await.unwrap();
        assert_eq!(bridges.taps("br0").get("mega_tap0"), Some(&30));
    }

    #[test]
    fn test_bandwidth_snapshot() {
        let dir = TempDir::new().unwrap();
        let base = base_with_networks(
            &dir,
            vec![connected("br0", "mega_tap0", 10), NetConfig::default()],
        );
        let stats = BandwidthStats::new();
        stats.update("mega_tap0", TapStat { rx_mbps: 1.5, tx_mbps: 0.5 });

        base.update_bandwidth(&stats);
        let nets = base.networks();
        assert_eq!(nets[0].stats.map(|s| s.rx_mbps), Some(1.5));
        assert_eq!(nets[1].stats, None);
    }

    #[test]
    fn test_tags() {
        let dir = TempDir::new().unwrap();
        let base = base_with_networks(&dir, vec![]);
        base.set_tag("role", "db");
        base.set_tag("tier", "1");
        assert_eq!(base.tag("role").as_deref(), Some("db"));
        assert!(base.clear_tag("role"));
        assert!(!base.clear_tag("role"));
        base.clear_tags();
        assert!(base.tags().is_empty());
    }
}
