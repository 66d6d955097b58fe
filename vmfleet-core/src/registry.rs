//! The VM registry
//!
//! Owns every VM on this node. IDs come from one monotonically increasing
//! sequence; names are looked up by scanning. Lock order is always the
//! registry lock first, then a VM's own lock.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::error::{FleetError, FleetResult};
use crate::metrics::{names, MetricsRegistry};
use crate::network::BandwidthStats;
use crate::target::WILDCARD;
use crate::types::{VmId, VmInfo, VmKind, VmState};
use crate::vm::{BaseVm, Vm, VmFactoryRegistry, VmVariant};
use crate::vm_config::VmConfig;

/// Words that can never be VM names
pub const RESERVED_WORDS: &[&str] = &[WILDCARD];

const KILL_ACK_CAPACITY: usize = 1024;

type VmMap = BTreeMap<VmId, Arc<dyn Vm>>;

/// Result of launching one name in a batch
#[derive(Debug)]
pub struct LaunchOutcome {
    pub name: String,
    pub result: FleetResult<VmId>,
}

/// Per-name launch results, in completion order
pub struct LaunchResults {
    rx: mpsc::Receiver<LaunchOutcome>,
    remaining: usize,
}

impl LaunchResults {
    /// Number of results not yet received
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub async fn next(&mut self) -> Option<LaunchOutcome> {
        if self.remaining == 0 {
            return None;
        }
        let outcome = self.rx.recv().await;
        if outcome.is_some() {
            self.remaining -= 1;
        }
        outcome
    }

    /// Waits for exactly one result per requested name
    pub async fn collect(mut self) -> Vec<LaunchOutcome> {
        let mut outcomes = Vec::with_capacity(self.remaining);
        while let Some(outcome) = self.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Drains the results in the background, logging failures
    pub fn detach(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(outcome) = self.next().await {
                if let Err(e) = outcome.result {
                    error!("launch {}: {}", outcome.name, e);
                }
            }
        })
    }
}

pub struct VmRegistry {
    vms: RwLock<VmMap>,
    next_id: AtomicU64,
    staged: RwLock<VmConfig>,
    defaults: VmConfig,
    saved: RwLock<BTreeMap<String, VmConfig>>,
    namespace: RwLock<Option<String>>,
    factories: VmFactoryRegistry,
    base_dir: PathBuf,
    kill_acks: broadcast::Sender<VmId>,
    metrics: MetricsRegistry,
}

impl VmRegistry {
    pub fn new(base_dir: impl Into<PathBuf>, factories: VmFactoryRegistry) -> Self {
        Self::with_defaults(base_dir, factories, VmConfig::default(), MetricsRegistry::new())
    }

    /// Registry whose staged config starts from the node configuration
    pub fn from_config(
        config: &Config,
        factories: VmFactoryRegistry,
        metrics: MetricsRegistry,
    ) -> Self {
        let mut defaults = VmConfig::default();
        defaults.base.memory_mb = config.vm.memory_mb;
        defaults.base.vcpus = config.vm.vcpus;
        Self::with_defaults(config.node.base_dir.clone(), factories, defaults, metrics)
    }

    fn with_defaults(
        base_dir: impl Into<PathBuf>,
        factories: VmFactoryRegistry,
        defaults: VmConfig,
        metrics: MetricsRegistry,
    ) -> Self {
        let (kill_acks, _) = broadcast::channel(KILL_ACK_CAPACITY);
        Self {
            vms: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            staged: RwLock::new(defaults.clone()),
            defaults,
            saved: RwLock::new(BTreeMap::new()),
            namespace: RwLock::new(None),
            factories,
            base_dir: base_dir.into(),
            kill_acks,
            metrics,
        }
    }

    pub fn factories(&self) -> &VmFactoryRegistry {
        &self.factories
    }

    /// Observe VMs actually terminating after a kill. No timeout is applied.
    pub fn subscribe_kill_acks(&self) -> broadcast::Receiver<VmId> {
        self.kill_acks.subscribe()
    }

    pub fn namespace(&self) -> Option<String> {
        self.namespace.read().clone()
    }

    /// Scopes creation, lookup and wildcards to a namespace
    pub fn set_namespace(&self, namespace: Option<String>) {
        info!("active namespace: {:?}", namespace);
        *self.namespace.write() = namespace;
    }

    fn visible_in(namespace: &Option<String>, vm: &Arc<dyn Vm>) -> bool {
        match namespace {
            Some(ns) => vm.base().namespace() == ns,
            None => true,
        }
    }

    /// Whether a live VM in `namespace` already has `name`
    fn name_taken(vms: &VmMap, namespace: &str, name: &str) -> bool {
        vms.values()
            .any(|vm| vm.base().namespace() == namespace && vm.name() == name)
    }

    /// Next id, plus the name to create under it. An empty name becomes
    /// `vm-<id>`; ids whose generated name is already taken are skipped.
    fn next_identity(&self, vms: &VmMap, namespace: &str, name: &str) -> (VmId, String) {
        loop {
            let id = VmId(self.next_id.fetch_add(1, Ordering::SeqCst));
            if !name.is_empty() {
                return (id, name.to_string());
            }
            let generated = format!("vm-{}", id);
            if !Self::name_taken(vms, namespace, &generated) {
                return (id, generated);
            }
            debug!("skipping vm id {}: name {} is taken", id, generated);
        }
    }

    fn create_locked(
        &self,
        vms: &mut VmMap,
        name: &str,
        kind: VmKind,
    ) -> FleetResult<Arc<dyn Vm>> {
        let factory = self.factories.get(kind)?;

        let namespace = self.namespace().unwrap_or_default();
        let (id, name) = self.next_identity(vms, &namespace, name);
        let mut config = self.staged.read().clone();
        config.base.namespace = namespace;

        let instance_path = self.base_dir.join(id.to_string());
        std::fs::create_dir_all(&instance_path)?;

        let base = BaseVm::new(
            id,
            &name,
            kind,
            config,
            instance_path,
            self.kill_acks.clone(),
        );
        let vm = factory.create(base)?;
        vms.insert(id, vm.clone());

        self.metrics.set_gauge(names::VM_COUNT, vms.len() as f64);
        debug!("created vm {} ({})", id, vm.name());
        Ok(vm)
    }

    /// Creates one VM in BUILDING from the staged configuration
    pub fn create(&self, name: &str, kind: VmKind) -> FleetResult<Arc<dyn Vm>> {
        let mut vms = self.vms.write();
        self.create_locked(&mut vms, name, kind)
    }

    /// Finds a visible VM by id, then by name
    pub fn find(&self, id_or_name: &str) -> FleetResult<Arc<dyn Vm>> {
        let namespace = self.namespace();
        let vms = self.vms.read();

        if let Ok(id) = id_or_name.parse::<VmId>() {
            if let Some(vm) = vms.get(&id).filter(|vm| Self::visible_in(&namespace, vm)) {
                return Ok(vm.clone());
            }
        }

        vms.values()
            .find(|vm| Self::visible_in(&namespace, vm) && vm.name() == id_or_name)
            .cloned()
            .ok_or_else(|| FleetError::vm_not_found(id_or_name))
    }

    /// Finds a VM and downcasts it to a concrete variant
    pub fn find_variant<T: VmVariant>(&self, id_or_name: &str) -> FleetResult<Arc<T>> {
        let vm = self.find(id_or_name)?;
        let wrong_variant = || FleetError::WrongVariant {
            id_or_name: id_or_name.to_string(),
            expected: T::KIND,
        };

        if vm.kind() != T::KIND {
            return Err(wrong_variant());
        }
        vm.into_any().downcast::<T>().map_err(|_| wrong_variant())
    }

    /// Every visible VM, in id order
    pub fn snapshot(&self) -> Vec<Arc<dyn Vm>> {
        let namespace = self.namespace();
        self.vms
            .read()
            .values()
            .filter(|vm| Self::visible_in(&namespace, vm))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.vms.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn info(&self) -> Vec<VmInfo> {
        self.snapshot().iter().map(|vm| vm.info()).collect()
    }

    pub fn refresh_bandwidth(&self, stats: &BandwidthStats) {
        for vm in self.snapshot() {
            vm.base().update_bandwidth(stats);
        }
    }

    fn check_names(&self, vms: &VmMap, names: &[String]) -> FleetResult<()> {
        if names.len() > 1 && self.staged.read().base.uuid.is_some() {
            return Err(FleetError::invalid_input(
                "uuid",
                "cannot launch multiple VMs with a pre-configured UUID",
            ));
        }

        let namespace = self.namespace().unwrap_or_default();
        let mut seen = HashSet::new();

        for name in names.iter().filter(|n| !n.is_empty()) {
            if RESERVED_WORDS.contains(&name.as_str()) {
                return Err(FleetError::invalid_input(
                    "name",
                    format!("`{}` is a reserved word", name),
                ));
            }
            if name.parse::<u64>().is_ok() {
                return Err(FleetError::invalid_input(
                    "name",
                    format!("`{}` is an integer; VM names cannot be integers", name),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(FleetError::invalid_input(
                    "name",
                    format!("`{}` is specified multiple times", name),
                ));
            }
            if Self::name_taken(vms, &namespace, name) {
                return Err(FleetError::invalid_input(
                    "name",
                    format!("vm already exists with name `{}`", name),
                ));
            }
        }

        Ok(())
    }

    /// Creates one VM per name and launches them concurrently.
    ///
    /// The whole batch is validated and created, in order, under the registry
    /// lock before any launch task starts, so IDs follow the order of
    /// `names`. An empty name is auto-named.
    #[instrument(skip(self, names), fields(count = names.len()))]
    pub fn launch(self: &Arc<Self>, names: Vec<String>, kind: VmKind) -> FleetResult<LaunchResults> {
        self.factories.get(kind)?;

        let created: Vec<(String, FleetResult<Arc<dyn Vm>>)> = {
            let mut vms = self.vms.write();
            self.check_names(&vms, &names)?;
            names
                .iter()
                .map(|name| (name.clone(), self.create_locked(&mut vms, name, kind)))
                .collect()
        };

        let (tx, rx) = mpsc::channel(created.len().max(1));
        let remaining = created.len();

        for (name, vm) in created {
            let tx = tx.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                let outcome = match vm {
                    Ok(vm) => {
                        let name = vm.name().to_string();
                        let id = vm.id();
                        let timer = metrics.timer(names::VM_LAUNCH_DURATION);
                        let result = vm.launch().await.map(|()| id);
                        timer.stop();

                        match &result {
                            Ok(_) => metrics.increment_counter(names::VM_LAUNCHED),
                            Err(e) => {
                                metrics.increment_counter(names::VM_LAUNCH_FAILED);
                                warn!("vm {} failed to launch: {}", id, e);
                            }
                        }
                        LaunchOutcome { name, result }
                    }
                    Err(e) => LaunchOutcome {
                        name,
                        result: Err(e),
                    },
                };
                // receiver gone means the caller stopped listening
                let _ = tx.send(outcome).await;
            });
        }

        Ok(LaunchResults { rx, remaining })
    }

    /// Removes every visible VM in QUIT or ERROR after cleaning its disk
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Vec<VmId> {
        let candidates: Vec<Arc<dyn Vm>> = self
            .snapshot()
            .into_iter()
            .filter(|vm| vm.state().is_terminal())
            .collect();

        for vm in &candidates {
            if let Err(e) = vm.flush().await {
                warn!("flush vm {} disk: {}", vm.id(), e);
            }
        }

        let mut vms = self.vms.write();
        let flushed: Vec<VmId> = candidates
            .iter()
            .filter_map(|vm| vms.remove(&vm.id()).map(|_| vm.id()))
            .collect();

        self.metrics
            .increment_counter_by(names::VM_FLUSHED, flushed.len() as u64);
        self.metrics.set_gauge(names::VM_COUNT, vms.len() as f64);
        info!("flushed {} vms", flushed.len());
        flushed
    }

    /// Copy of the staged configuration
    pub fn staged(&self) -> VmConfig {
        self.staged.read().clone()
    }

    /// Edits the staged configuration; nothing changes if `edit` fails
    pub fn update_staged<F>(&self, edit: F) -> FleetResult<()>
    where
        F: FnOnce(&mut VmConfig) -> FleetResult<()>,
    {
        let mut staged = self.staged.write();
        let mut draft = staged.clone();
        edit(&mut draft)?;
        *staged = draft;
        Ok(())
    }

    pub fn clear_staged(&self) {
        *self.staged.write() = self.defaults.clone();
    }

    pub fn save_config(&self, name: &str) {
        let staged = self.staged();
        self.saved.write().insert(name.to_string(), staged);
    }

    pub fn restore_config(&self, name: &str) -> FleetResult<()> {
        let config = self
            .saved
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::invalid_input("config", format!("no saved config: {}", name)))?;
        *self.staged.write() = config;
        Ok(())
    }

    pub fn saved_configs(&self) -> Vec<String> {
        self.saved.read().keys().cloned().collect()
    }
}
