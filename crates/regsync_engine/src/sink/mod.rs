//! Reconciliation and watch engine.
//!
//! A sink keeps a destination registry consistent with a source for the
//! lifetime of a job:
//! 1. Every tick, list the source and diff it against the last snapshot
//! 2. Write what was added, open one watch per added entity
//! 3. Cancel the watch of every entity that disappeared
//!
//! Watch consumers feed the same write path as the tick. Collaborator errors
//! are reported and the affected entity is retried on the next tick.
//!
//! ## Key Invariants
//!
//! - Ticks of one sink never overlap
//! - At most one live subscription per entity key
//! - Removing an entity cancels its subscription, it never deletes data

mod config;
mod discovery;

use crate::config::SinkConfig;
use crate::error::{EngineError, EngineResult};
use crate::plugin::{
    PluginRegistry, Reader, TransformParam, Transformer, WatchEvent, WatchStream, Writer,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use regsync_model::{
    Action, ConfigFile, ConfigFileKey, JobType, Request, Service, ServiceChangeEvent, ServiceKey,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Name reported by [`LocalSink`].
pub const LOCAL_SINK_NAME: &str = "LocalSink";

/// Moves data from a reader to a writer for one job.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Binds the collaborators and resolves the transformer for `mode`.
    fn init(
        &mut self,
        mode: JobType,
        writer: Arc<dyn Writer>,
        reader: Arc<dyn Reader>,
    ) -> EngineResult<()>;

    /// Runs until `token` is cancelled.
    async fn run(&self, token: CancellationToken) -> EngineResult<()>;

    /// Reports a recovered collaborator error.
    fn on_error(&self, err: &EngineError);

    /// Sink name.
    fn name(&self) -> &str;
}

/// Statistics about a sink.
#[derive(Debug, Clone, Default)]
pub struct SinkStats {
    /// Reconciliation ticks completed.
    pub ticks: u64,
    /// Entities committed to the snapshot.
    pub added: u64,
    /// Entities dropped from the snapshot.
    pub removed: u64,
    /// Config files whose content change was written.
    pub updated: u64,
    /// Accepted writes.
    pub writes: u64,
    /// Watch events consumed.
    pub watch_events: u64,
    /// Errors reported through `on_error`.
    pub errors: u64,
    /// Last tick time.
    pub last_tick: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Identity of a watched entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchKey {
    /// A service.
    Service(ServiceKey),
    /// A config file.
    ConfigFile(ConfigFileKey),
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchKey::Service(key) => write!(f, "service:{key}"),
            WatchKey::ConfigFile(key) => write!(f, "config:{key}"),
        }
    }
}

/// Snapshot and subscriptions, guarded by one lock.
#[derive(Default)]
struct SinkState {
    services: HashMap<ServiceKey, Service>,
    config_files: HashMap<ConfigFileKey, ConfigFile>,
    subscriptions: HashMap<WatchKey, CancellationToken>,
}

/// Everything a running sink and its watch consumers share.
struct SinkCore {
    mode: JobType,
    reader: Arc<dyn Reader>,
    writer: Arc<dyn Writer>,
    transformer: Arc<dyn Transformer>,
    config: SinkConfig,
    state: RwLock<SinkState>,
    stats: RwLock<SinkStats>,
}

impl SinkCore {
    async fn reconcile(self: &Arc<Self>, token: &CancellationToken) -> bool {
        let ok = match self.mode {
            JobType::Discovery => self.reconcile_services(token).await,
            JobType::Config => self.reconcile_config_files(token).await,
        };
        let mut stats = self.stats.write();
        stats.ticks += 1;
        stats.last_tick = Some(Instant::now());
        ok
    }

    fn report(&self, err: &EngineError) {
        if matches!(err, EngineError::Cancelled) {
            debug!(sink = LOCAL_SINK_NAME, "operation cancelled");
            return;
        }
        error!(sink = LOCAL_SINK_NAME, error = %err, "sink error");
        let mut stats = self.stats.write();
        stats.errors += 1;
        stats.last_error = Some(err.to_string());
    }

    /// Converts a batch into the writer's format.
    fn transform<T: Serialize + ?Sized>(&self, items: &T) -> EngineResult<Value> {
        self.transformer.convert(TransformParam {
            source: self.reader.name().to_string(),
            target: self.writer.name().to_string(),
            object: serde_json::to_value(items)?,
        })
    }

    async fn write(&self, request: Request, token: &CancellationToken) -> EngineResult<()> {
        let action = request.action;
        let accepted = cancellable(token, self.writer.write(&request)).await?;
        if !accepted {
            return Err(EngineError::Rejected {
                name: self.writer.name().to_string(),
                action,
            });
        }
        debug!(sink = LOCAL_SINK_NAME, %action, "write accepted");
        self.stats.write().writes += 1;
        Ok(())
    }

    /// Registers a subscription and spawns its consumer.
    ///
    /// A key that is already subscribed has its old consumer cancelled first.
    fn subscribe(self: &Arc<Self>, key: WatchKey, stream: WatchStream, parent: &CancellationToken) {
        let token = parent.child_token();
        if let Some(previous) = self
            .state
            .write()
            .subscriptions
            .insert(key.clone(), token.clone())
        {
            previous.cancel();
        }
        debug!(sink = LOCAL_SINK_NAME, key = %key, "watch opened");
        tokio::spawn(Arc::clone(self).consume(key, stream, token));
    }

    fn unsubscribe(&self, key: &WatchKey) {
        if let Some(token) = self.state.write().subscriptions.remove(key) {
            token.cancel();
            debug!(sink = LOCAL_SINK_NAME, key = %key, "watch cancelled");
        }
    }

    async fn consume(self: Arc<Self>, key: WatchKey, mut stream: WatchStream, token: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = stream.recv() => event,
            };
            let Some(event) = event else {
                debug!(sink = LOCAL_SINK_NAME, key = %key, "watch stream closed");
                break;
            };
            self.stats.write().watch_events += 1;
            self.apply(&key, event, &token).await;
        }
    }

    async fn apply(&self, key: &WatchKey, event: WatchEvent, token: &CancellationToken) -> bool {
        match (key, event) {
            (WatchKey::Service(service), WatchEvent::Service(event)) => {
                self.apply_service_event(service, event, token).await
            }
            (WatchKey::ConfigFile(file), WatchEvent::Config(event)) => {
                self.apply_config_event(file, event, token).await
            }
            (key, _) => {
                debug!(sink = LOCAL_SINK_NAME, key = %key, "ignoring mismatched watch event");
                true
            }
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.write();
        for (_, token) in state.subscriptions.drain() {
            token.cancel();
        }
    }
}

/// Races `fut` against cancellation of `token`.
async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> EngineResult<T>
where
    F: Future<Output = EngineResult<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(EngineError::Cancelled),
        result = fut => result,
    }
}

/// The in-process sink.
pub struct LocalSink {
    registry: Arc<PluginRegistry>,
    config: SinkConfig,
    core: Option<Arc<SinkCore>>,
}

impl LocalSink {
    /// Creates a sink resolving transformers from `registry`.
    pub fn new(registry: Arc<PluginRegistry>, config: SinkConfig) -> Self {
        Self {
            registry,
            config,
            core: None,
        }
    }

    fn core(&self) -> EngineResult<&Arc<SinkCore>> {
        self.core.as_ref().ok_or(EngineError::NotInitialized)
    }

    /// Runs one reconciliation tick. Returns false if any entity failed.
    pub async fn reconcile(&self, token: &CancellationToken) -> EngineResult<bool> {
        Ok(self.core()?.reconcile(token).await)
    }

    /// Applies one service change as if it came from a watch.
    ///
    /// Returns false if a write failed; the error is reported.
    pub async fn apply_service_event(
        &self,
        service: &ServiceKey,
        event: ServiceChangeEvent,
        token: &CancellationToken,
    ) -> EngineResult<bool> {
        Ok(self.core()?.apply_service_event(service, event, token).await)
    }

    /// Current statistics.
    pub fn stats(&self) -> SinkStats {
        self.core
            .as_ref()
            .map(|core| core.stats.read().clone())
            .unwrap_or_default()
    }

    /// Keys with a registered subscription, sorted by display form.
    pub fn subscriptions(&self) -> Vec<WatchKey> {
        let Some(core) = self.core.as_ref() else {
            return Vec::new();
        };
        let mut keys: Vec<WatchKey> = core.state.read().subscriptions.keys().cloned().collect();
        keys.sort_by_key(|key| key.to_string());
        keys
    }

    /// Number of subscriptions whose consumer has not been cancelled.
    pub fn live_subscriptions(&self) -> usize {
        self.core
            .as_ref()
            .map(|core| {
                core.state
                    .read()
                    .subscriptions
                    .values()
                    .filter(|token| !token.is_cancelled())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Services in the last committed snapshot, sorted.
    pub fn known_services(&self) -> Vec<ServiceKey> {
        let Some(core) = self.core.as_ref() else {
            return Vec::new();
        };
        let mut keys: Vec<ServiceKey> = core.state.read().services.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Config files in the last committed snapshot, sorted.
    pub fn known_config_files(&self) -> Vec<ConfigFileKey> {
        let Some(core) = self.core.as_ref() else {
            return Vec::new();
        };
        let mut keys: Vec<ConfigFileKey> =
            core.state.read().config_files.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Sink for LocalSink {
    fn init(
        &mut self,
        mode: JobType,
        writer: Arc<dyn Writer>,
        reader: Arc<dyn Reader>,
    ) -> EngineResult<()> {
        let transformer = self.registry.transformer_for(mode)?;
        self.core = Some(Arc::new(SinkCore {
            mode,
            reader,
            writer,
            transformer,
            config: self.config.clone(),
            state: RwLock::new(SinkState::default()),
            stats: RwLock::new(SinkStats::default()),
        }));
        Ok(())
    }

    async fn run(&self, token: CancellationToken) -> EngineResult<()> {
        let core = Arc::clone(self.core()?);
        info!(
            sink = LOCAL_SINK_NAME,
            mode = %core.mode,
            interval = ?core.config.reconcile_interval,
            "sink started"
        );

        let mut ticker = tokio::time::interval(core.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    core.reconcile(&token).await;
                }
            }
        }

        core.shutdown();
        info!(sink = LOCAL_SINK_NAME, "sink stopped");
        Ok(())
    }

    fn on_error(&self, err: &EngineError) {
        match self.core.as_ref() {
            Some(core) => core.report(err),
            None => error!(sink = LOCAL_SINK_NAME, error = %err, "sink error"),
        }
    }

    fn name(&self) -> &str {
        LOCAL_SINK_NAME
    }
}

/// Request for a batch already converted to the writer's format.
fn converted(action: Action, key: &str, object: Value) -> Request {
    Request::new(action).with_param(key, object)
}

/// Outcome of comparing a listing against the snapshot, sorted by key.
struct Diff<K, V> {
    added: Vec<V>,
    changed: Vec<V>,
    removed: Vec<K>,
}

fn diff<K, V>(snapshot: &HashMap<K, V>, current: HashMap<K, V>) -> Diff<K, V>
where
    K: Eq + Hash + Ord + Clone,
    V: PartialEq,
{
    let mut removed: Vec<K> = snapshot
        .keys()
        .filter(|key| !current.contains_key(*key))
        .cloned()
        .collect();
    removed.sort();

    let mut current: Vec<(K, V)> = current.into_iter().collect();
    current.sort_by(|a, b| a.0.cmp(&b.0));

    let mut added = Vec::new();
    let mut changed = Vec::new();
    for (key, value) in current {
        match snapshot.get(&key) {
            None => added.push(value),
            Some(previous) if *previous != value => changed.push(value),
            Some(_) => {}
        }
    }
    Diff {
        added,
        changed,
        removed,
    }
}
