//! In-process registry.
//!
//! `MemoryRegistry` holds services, instances and config files in memory and
//! exposes them through a [`Reader`] and a [`Writer`]. Every mutation, whether
//! made directly or through the writer, is pushed to open watches. It backs
//! the `memory` component and doubles as the engine's test registry:
//! recorded writes, injected failures and a watch switch.

use crate::config::{parse_millis, HeartbeatConfig};
use crate::error::{EngineError, EngineResult};
use crate::heartbeat::HeartbeatKeeper;
use crate::plugin::{PluginContext, PluginRegistry, ReadResult, Reader, WatchEvent, WatchStream, Writer};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use regsync_model::{
    Action, ConfigChangeEvent, ConfigFile, ConfigFileKey, Instance, Options, ReadRequest,
    Service, ServiceChangeEvent, ServiceKey, WatchRequest, WriteRequest,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Reader option: path of a JSON [`MemorySeed`] loaded on `init`.
pub const SEED_OPTION: &str = "seed";
/// Reader option: capacity of each watch channel.
pub const WATCH_BUFFER_OPTION: &str = "watch_buffer";
/// Writer option: `"true"` keeps written instances alive with heartbeats.
pub const HEARTBEAT_OPTION: &str = "heartbeat";
/// Writer option: delay before the first heartbeat, in milliseconds.
pub const HEARTBEAT_INITIAL_OPTION: &str = "heartbeat_initial_ms";
/// Writer option: heartbeat period, in milliseconds.
pub const HEARTBEAT_PERIOD_OPTION: &str = "heartbeat_period_ms";

const DEFAULT_WATCH_BUFFER: usize = 64;

/// A service with its instances, as stored in a seed file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeedService {
    /// The service.
    #[serde(flatten)]
    pub service: Service,
    /// Its instances.
    #[serde(default)]
    pub instances: Vec<Instance>,
}

/// Initial content of a registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySeed {
    /// Services with their instances.
    #[serde(default)]
    pub services: Vec<SeedService>,
    /// Config files.
    #[serde(default)]
    pub config_files: Vec<ConfigFile>,
}

struct ServiceEntry {
    service: Service,
    instances: Vec<Instance>,
}

#[derive(Default)]
struct Store {
    services: BTreeMap<ServiceKey, ServiceEntry>,
    config_files: BTreeMap<ConfigFileKey, ConfigFile>,
}

impl Store {
    fn entry(&mut self, key: &ServiceKey) -> &mut ServiceEntry {
        self.services
            .entry(key.clone())
            .or_insert_with(|| ServiceEntry {
                service: Service::new(key.namespace.clone(), key.name.clone()),
                instances: Vec::new(),
            })
    }

    /// Upserts by endpoint. Returns the instances that did not exist before.
    fn upsert_instances(&mut self, key: &ServiceKey, instances: &[Instance]) -> Vec<Instance> {
        let entry = self.entry(key);
        let mut added = Vec::new();
        for instance in instances {
            let endpoint = instance.endpoint();
            match entry
                .instances
                .iter_mut()
                .find(|existing| existing.endpoint() == endpoint)
            {
                Some(existing) => {
                    let id = existing.id.take();
                    *existing = Instance {
                        id,
                        ..instance.clone()
                    };
                }
                None => {
                    let stored = Instance {
                        id: Some(Uuid::new_v4().to_string()),
                        ..instance.clone()
                    };
                    entry.instances.push(stored.clone());
                    added.push(stored);
                }
            }
        }
        added
    }

    fn remove_instances(&mut self, key: &ServiceKey, instances: &[Instance]) -> Vec<Instance> {
        let Some(entry) = self.services.get_mut(key) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        for instance in instances {
            let endpoint = instance.endpoint();
            if let Some(pos) = entry
                .instances
                .iter()
                .position(|existing| existing.endpoint() == endpoint)
            {
                removed.push(entry.instances.remove(pos));
            }
        }
        removed
    }
}

#[derive(Default)]
struct Watchers {
    services: HashMap<ServiceKey, Vec<mpsc::Sender<WatchEvent>>>,
    config_files: HashMap<ConfigFileKey, Vec<mpsc::Sender<WatchEvent>>>,
}

struct RegistryInner {
    name: String,
    store: RwLock<Store>,
    watchers: Mutex<Watchers>,
    writes: Mutex<Vec<WriteRequest>>,
    failures: Mutex<HashMap<Action, String>>,
    watch_enabled: AtomicBool,
    beats: Mutex<HashMap<String, u64>>,
}

/// A registry living in process memory. Clones share state.
#[derive(Clone)]
pub struct MemoryRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new(regsync_model::ComponentType::MEMORY)
    }
}

impl MemoryRegistry {
    /// Creates an empty registry reporting `name` as its component name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                name: name.into(),
                store: RwLock::new(Store::default()),
                watchers: Mutex::new(Watchers::default()),
                writes: Mutex::new(Vec::new()),
                failures: Mutex::new(HashMap::new()),
                watch_enabled: AtomicBool::new(true),
                beats: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Component name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Registers a reader supplier over this registry under its name.
    pub fn register_reader(&self, plugins: &PluginRegistry) -> bool {
        let registry = self.clone();
        plugins.register_reader(self.name().to_string(), move || Box::new(registry.reader()))
    }

    /// Registers a writer supplier over this registry under its name.
    pub fn register_writer(&self, plugins: &PluginRegistry) -> bool {
        let registry = self.clone();
        plugins.register_writer(self.name().to_string(), move || Box::new(registry.writer()))
    }

    /// A reader over this registry.
    pub fn reader(&self) -> MemoryReader {
        MemoryReader {
            registry: self.clone(),
            buffer: DEFAULT_WATCH_BUFFER,
        }
    }

    /// A writer over this registry.
    pub fn writer(&self) -> MemoryWriter {
        MemoryWriter {
            registry: self.clone(),
            heartbeat: None,
        }
    }

    // Source side.

    /// Inserts or replaces a service, keeping its instances.
    pub fn put_service(&self, service: Service) {
        let key = service.key();
        self.inner.store.write().entry(&key).service = service;
    }

    /// Removes a service and its instances.
    pub fn remove_service(&self, key: &ServiceKey) -> bool {
        self.inner.store.write().services.remove(key).is_some()
    }

    /// Upserts instances and announces the new ones to watchers.
    ///
    /// Returns the instances that were new, with their assigned ids.
    pub fn put_instances(&self, key: &ServiceKey, instances: &[Instance]) -> Vec<Instance> {
        let (service, added) = {
            let mut store = self.inner.store.write();
            let added = store.upsert_instances(key, instances);
            (store.entry(key).service.clone(), added)
        };
        if !added.is_empty() {
            self.notify_service(key, ServiceChangeEvent::added(service, added.clone()));
        }
        added
    }

    /// Removes instances by endpoint and announces them to watchers.
    pub fn remove_instances(&self, key: &ServiceKey, instances: &[Instance]) -> Vec<Instance> {
        let (service, removed) = {
            let mut store = self.inner.store.write();
            let removed = store.remove_instances(key, instances);
            let service = store.services.get(key).map(|entry| entry.service.clone());
            (service, removed)
        };
        if let Some(service) = service {
            if !removed.is_empty() {
                self.notify_service(key, ServiceChangeEvent::deleted(service, removed.clone()));
            }
        }
        removed
    }

    /// Inserts or replaces a config file, announcing real changes.
    pub fn put_config_file(&self, file: ConfigFile) {
        let key = file.key();
        let previous = self
            .inner
            .store
            .write()
            .config_files
            .insert(key.clone(), file.clone());
        if previous.is_some_and(|previous| previous != file) {
            self.notify_config(&key, ConfigChangeEvent::modified(file));
        }
    }

    /// Removes a config file and announces the deletion.
    pub fn remove_config_file(&self, key: &ConfigFileKey) -> bool {
        let removed = self.inner.store.write().config_files.remove(key);
        match removed {
            Some(file) => {
                self.notify_config(key, ConfigChangeEvent::deleted(file));
                true
            }
            None => false,
        }
    }

    /// Loads a seed without notifying watchers.
    pub fn load_seed(&self, seed: MemorySeed) {
        let mut store = self.inner.store.write();
        for entry in seed.services {
            let key = entry.service.key();
            store.entry(&key).service = entry.service;
            store.upsert_instances(&key, &entry.instances);
        }
        for file in seed.config_files {
            store.config_files.insert(file.key(), file);
        }
    }

    /// Loads a JSON seed file.
    pub fn load_seed_file(&self, path: &Path) -> EngineResult<()> {
        let raw = std::fs::read_to_string(path)?;
        let seed: MemorySeed = serde_json::from_str(&raw)?;
        debug!(
            registry = %self.name(),
            path = %path.display(),
            services = seed.services.len(),
            config_files = seed.config_files.len(),
            "seed loaded"
        );
        self.load_seed(seed);
        Ok(())
    }

    // Inspection.

    /// Every service, sorted by key.
    pub fn services(&self) -> Vec<Service> {
        self.inner
            .store
            .read()
            .services
            .values()
            .map(|entry| entry.service.clone())
            .collect()
    }

    /// Instances of a service in insertion order.
    pub fn instances(&self, key: &ServiceKey) -> Vec<Instance> {
        self.inner
            .store
            .read()
            .services
            .get(key)
            .map(|entry| entry.instances.clone())
            .unwrap_or_default()
    }

    /// Every config file, sorted by key.
    pub fn config_files(&self) -> Vec<ConfigFile> {
        self.inner.store.read().config_files.values().cloned().collect()
    }

    /// One config file.
    pub fn config_file(&self, key: &ConfigFileKey) -> Option<ConfigFile> {
        self.inner.store.read().config_files.get(key).cloned()
    }

    /// Every write applied through a writer, in order.
    pub fn writes(&self) -> Vec<WriteRequest> {
        self.inner.writes.lock().clone()
    }

    /// Applied writes with the given action.
    pub fn writes_of(&self, action: Action) -> Vec<WriteRequest> {
        self.inner
            .writes
            .lock()
            .iter()
            .filter(|request| request.action == action)
            .cloned()
            .collect()
    }

    /// Number of open watches on a service.
    pub fn service_watchers(&self, key: &ServiceKey) -> usize {
        let mut watchers = self.inner.watchers.lock();
        match watchers.services.get_mut(key) {
            Some(senders) => {
                senders.retain(|sender| !sender.is_closed());
                senders.len()
            }
            None => 0,
        }
    }

    /// Number of beats recorded for a heartbeat key.
    pub fn beats(&self, key: &str) -> u64 {
        self.inner.beats.lock().get(key).copied().unwrap_or(0)
    }

    // Failure injection.

    /// Makes every request with `action` fail with `message`.
    pub fn fail_on(&self, action: Action, message: impl Into<String>) {
        self.inner.failures.lock().insert(action, message.into());
    }

    /// Removes every injected failure.
    pub fn clear_failures(&self) {
        self.inner.failures.lock().clear();
    }

    /// Enables or disables watch support.
    pub fn set_watch_enabled(&self, enabled: bool) {
        self.inner.watch_enabled.store(enabled, Ordering::SeqCst);
    }

    fn injected_failure(&self, action: Action) -> Option<String> {
        self.inner.failures.lock().get(&action).cloned()
    }

    fn record_beat(&self, key: &str) {
        *self.inner.beats.lock().entry(key.to_string()).or_insert(0) += 1;
    }

    fn notify_service(&self, key: &ServiceKey, event: ServiceChangeEvent) {
        let mut watchers = self.inner.watchers.lock();
        if let Some(senders) = watchers.services.get_mut(key) {
            broadcast(senders, WatchEvent::Service(event));
        }
    }

    fn notify_config(&self, key: &ConfigFileKey, event: ConfigChangeEvent) {
        let mut watchers = self.inner.watchers.lock();
        if let Some(senders) = watchers.config_files.get_mut(key) {
            broadcast(senders, WatchEvent::Config(event));
        }
    }

    fn open_watch(&self, request: &WatchRequest, buffer: usize) -> EngineResult<WatchStream> {
        let (sender, receiver) = mpsc::channel(buffer);
        let mut watchers = self.inner.watchers.lock();
        match request.action {
            Action::WatchService => watchers
                .services
                .entry(request.service_key()?)
                .or_default()
                .push(sender),
            Action::WatchConfigFile => watchers
                .config_files
                .entry(request.config_file_key()?)
                .or_default()
                .push(sender),
            action => {
                return Err(EngineError::Unsupported {
                    name: self.name().to_string(),
                    action,
                })
            }
        }
        Ok(receiver)
    }
}

/// Sends to every open watcher, dropping closed ones. A full channel loses
/// the event.
fn broadcast(senders: &mut Vec<mpsc::Sender<WatchEvent>>, event: WatchEvent) {
    senders.retain(|sender| match sender.try_send(event.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("watch channel full, event dropped");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

/// [`Reader`] over a [`MemoryRegistry`].
pub struct MemoryReader {
    registry: MemoryRegistry,
    buffer: usize,
}

#[async_trait]
impl Reader for MemoryReader {
    async fn init(&mut self, options: &Options, _ctx: &PluginContext) -> EngineResult<()> {
        if let Some(raw) = options.get(WATCH_BUFFER_OPTION) {
            self.buffer = match raw.trim().parse::<usize>() {
                Ok(buffer) if buffer > 0 => buffer,
                _ => {
                    return Err(EngineError::InvalidOption {
                        key: WATCH_BUFFER_OPTION.into(),
                        value: raw.clone(),
                    })
                }
            };
        }
        if let Some(path) = options.get(SEED_OPTION) {
            self.registry.load_seed_file(Path::new(path))?;
        }
        Ok(())
    }

    async fn read(&self, request: &ReadRequest) -> EngineResult<ReadResult> {
        if let Some(message) = self.registry.injected_failure(request.action) {
            return Err(EngineError::reader(self.name(), message));
        }
        match request.action {
            Action::ListServices => Ok(ReadResult::Services(self.registry.services())),
            Action::ListInstances => Ok(ReadResult::Instances(
                self.registry.instances(&request.service_key()?),
            )),
            Action::ListConfigFiles => Ok(ReadResult::ConfigFiles(self.registry.config_files())),
            action => Err(EngineError::Unsupported {
                name: self.name().to_string(),
                action,
            }),
        }
    }

    async fn watch(&self, request: &WatchRequest) -> EngineResult<Option<WatchStream>> {
        if let Some(message) = self.registry.injected_failure(request.action) {
            return Err(EngineError::reader(self.name(), message));
        }
        if !self.registry.inner.watch_enabled.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.registry.open_watch(request, self.buffer).map(Some)
    }

    fn name(&self) -> &str {
        self.registry.name()
    }
}

/// [`Writer`] over a [`MemoryRegistry`].
pub struct MemoryWriter {
    registry: MemoryRegistry,
    heartbeat: Option<(HeartbeatKeeper, CancellationToken)>,
}

impl MemoryWriter {
    fn start_beats(&self, key: &ServiceKey, instances: &[Instance]) -> EngineResult<()> {
        let Some((keeper, token)) = &self.heartbeat else {
            return Ok(());
        };
        for instance in instances {
            let Some(id) = instance.id.as_deref() else {
                continue;
            };
            let beat_key = HeartbeatKeeper::key(&key.namespace, &key.name, id);
            let registry = self.registry.clone();
            let recorded = beat_key.clone();
            keeper.start(beat_key, token.clone(), move || registry.record_beat(&recorded))?;
        }
        Ok(())
    }

    fn stop_beats(&self, key: &ServiceKey, instances: &[Instance]) {
        let Some((keeper, _)) = &self.heartbeat else {
            return;
        };
        for id in instances.iter().filter_map(|instance| instance.id.as_deref()) {
            keeper.stop(&HeartbeatKeeper::key(&key.namespace, &key.name, id));
        }
    }

    fn apply(&self, request: &WriteRequest) -> EngineResult<()> {
        let registry = &self.registry;
        match request.action {
            Action::CreateServices | Action::UpdateServices => {
                for service in request.services()? {
                    registry.put_service(service);
                }
            }
            Action::DeleteServices => {
                for service in request.services()? {
                    registry.remove_service(&service.key());
                }
            }
            Action::CreateInstances | Action::UpdateInstances => {
                let key = request.service_key()?;
                registry.put_instances(&key, &request.instances()?);
                // Beat for every endpoint of the request, new or already known.
                let stored = registry.instances(&key);
                self.start_beats(&key, &stored)?;
            }
            Action::DeleteInstances => {
                let key = request.service_key()?;
                let removed = registry.remove_instances(&key, &request.instances()?);
                self.stop_beats(&key, &removed);
            }
            Action::CreateConfigFiles | Action::UpdateConfigFiles => {
                for file in request.config_files()? {
                    registry.put_config_file(file);
                }
            }
            Action::DeleteConfigFiles => {
                for file in request.config_files()? {
                    registry.remove_config_file(&file.key());
                }
            }
            action => {
                return Err(EngineError::Unsupported {
                    name: self.name().to_string(),
                    action,
                })
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Writer for MemoryWriter {
    async fn init(&mut self, options: &Options, ctx: &PluginContext) -> EngineResult<()> {
        if options.get(HEARTBEAT_OPTION).map(String::as_str) != Some("true") {
            return Ok(());
        }
        let mut config = HeartbeatConfig::default();
        if let Some(raw) = options.get(HEARTBEAT_INITIAL_OPTION) {
            config = config.with_initial_delay(parse_millis(HEARTBEAT_INITIAL_OPTION, raw)?);
        }
        if let Some(raw) = options.get(HEARTBEAT_PERIOD_OPTION) {
            config = config.with_period(parse_millis(HEARTBEAT_PERIOD_OPTION, raw)?);
        }
        let keeper = HeartbeatKeeper::new(Arc::clone(&ctx.wheel), Arc::clone(&ctx.pool), config);
        self.heartbeat = Some((keeper, ctx.token.clone()));
        Ok(())
    }

    async fn write(&self, request: &WriteRequest) -> EngineResult<bool> {
        if let Some(message) = self.registry.injected_failure(request.action) {
            return Err(EngineError::writer(self.name(), message));
        }
        self.apply(request)?;
        self.registry.inner.writes.lock().push(request.clone());
        Ok(true)
    }

    fn name(&self) -> &str {
        self.registry.name()
    }

    async fn close(&self) -> EngineResult<()> {
        if let Some((keeper, _)) = &self.heartbeat {
            keeper.stop_all();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regsync_model::Request;
    use std::io::Write;

    fn key() -> ServiceKey {
        ServiceKey::new("default", "orders")
    }

    #[test]
    fn instance_identity_is_endpoint() {
        let registry = MemoryRegistry::default();
        let first = registry.put_instances(&key(), &[Instance::new("10.0.0.1", 80)]);
        assert_eq!(first.len(), 1);
        let id = first[0].id.clone();
        assert!(id.is_some());

        let again = registry.put_instances(
            &key(),
            &[Instance::new("10.0.0.1", 80).with_metadata("zone", "a")],
        );
        assert!(again.is_empty());
        let stored = registry.instances(&key());
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, id);
        assert_eq!(stored[0].metadata["zone"], "a");
    }

    #[tokio::test]
    async fn watch_receives_instance_changes() {
        let registry = MemoryRegistry::default();
        registry.put_service(Service::new("default", "orders"));
        let reader = registry.reader();

        let mut stream = reader
            .watch(&Request::for_service(Action::WatchService, &key()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.service_watchers(&key()), 1);

        registry.put_instances(&key(), &[Instance::new("h", 1)]);
        registry.remove_instances(&key(), &[Instance::new("h", 1)]);

        match stream.recv().await {
            Some(WatchEvent::Service(event)) => assert_eq!(event.add_instances.len(), 1),
            other => panic!("unexpected: {other:?}"),
        }
        match stream.recv().await {
            Some(WatchEvent::Service(event)) => assert_eq!(event.delete_instances.len(), 1),
            other => panic!("unexpected: {other:?}"),
        }

        drop(stream);
        assert_eq!(registry.service_watchers(&key()), 0);
    }

    #[tokio::test]
    async fn watch_disabled_returns_none() {
        let registry = MemoryRegistry::default();
        registry.set_watch_enabled(false);
        let watch = registry
            .reader()
            .watch(&Request::for_service(Action::WatchService, &key()))
            .await
            .unwrap();
        assert!(watch.is_none());
    }

    #[tokio::test]
    async fn injected_failure_and_recorded_writes() {
        let registry = MemoryRegistry::default();
        let writer = registry.writer();
        let request =
            Request::with_instances(Action::CreateInstances, &key(), &[Instance::new("h", 1)])
                .unwrap();

        registry.fail_on(Action::CreateInstances, "unavailable");
        assert!(matches!(
            writer.write(&request).await,
            Err(EngineError::Writer { .. })
        ));
        assert!(registry.writes().is_empty());

        registry.clear_failures();
        assert!(writer.write(&request).await.unwrap());
        assert_eq!(registry.writes_of(Action::CreateInstances).len(), 1);
        assert_eq!(registry.instances(&key()).len(), 1);
    }

    #[test]
    fn config_file_changes_notify_only_on_difference() {
        let registry = MemoryRegistry::default();
        let file = ConfigFile::new("ns", "g", "app.yaml", "a: 1");
        let file_key = file.key();
        let (sender, mut receiver) = mpsc::channel(4);
        registry
            .inner
            .watchers
            .lock()
            .config_files
            .insert(file_key.clone(), vec![sender]);

        registry.put_config_file(file.clone());
        registry.put_config_file(file.clone());
        assert!(receiver.try_recv().is_err());

        registry.put_config_file(ConfigFile::new("ns", "g", "app.yaml", "a: 2"));
        assert!(matches!(receiver.try_recv(), Ok(WatchEvent::Config(_))));

        assert!(registry.remove_config_file(&file_key));
        match receiver.try_recv() {
            Ok(WatchEvent::Config(event)) => {
                assert_eq!(event.kind, regsync_model::ConfigChangeKind::Deleted)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn seed_file_loads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "services": [
                    {{"namespace": "default", "name": "orders",
                      "instances": [{{"host": "10.0.0.1", "port": 80}}]}}
                ],
                "config_files": [
                    {{"namespace": "ns", "group": "g", "file_name": "f", "content": "x"}}
                ]
            }}"#
        )
        .unwrap();

        let registry = MemoryRegistry::default();
        registry.load_seed_file(file.path()).unwrap();
        assert_eq!(registry.services().len(), 1);
        assert_eq!(registry.instances(&key()).len(), 1);
        assert_eq!(registry.config_files().len(), 1);
    }
}
