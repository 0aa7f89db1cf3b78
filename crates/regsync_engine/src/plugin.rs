//! Collaborator traits and the plugin registry.
//!
//! Readers and writers are registered as suppliers so every job gets its own
//! instance. Transformers are stateless and shared; they are registered under
//! the run mode they serve (`"discovery"`, `"config"`).

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use regsync_model::{
    ConfigChangeEvent, ConfigFile, Instance, JobType, Options, ReadRequest, Service,
    ServiceChangeEvent, WatchRequest, WriteRequest,
};
use regsync_sched::{TimeWheel, WorkerPool};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What a reader returned.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult {
    /// Result of `ListServices`.
    Services(Vec<Service>),
    /// Result of `ListInstances`.
    Instances(Vec<Instance>),
    /// Result of `ListConfigFiles`.
    ConfigFiles(Vec<ConfigFile>),
}

impl ReadResult {
    fn kind(&self) -> &'static str {
        match self {
            ReadResult::Services(_) => "services",
            ReadResult::Instances(_) => "instances",
            ReadResult::ConfigFiles(_) => "config files",
        }
    }

    /// Unwraps a service list.
    pub fn into_services(self) -> EngineResult<Vec<Service>> {
        match self {
            ReadResult::Services(services) => Ok(services),
            other => Err(EngineError::UnexpectedResult {
                expected: "services",
                actual: other.kind(),
            }),
        }
    }

    /// Unwraps an instance list.
    pub fn into_instances(self) -> EngineResult<Vec<Instance>> {
        match self {
            ReadResult::Instances(instances) => Ok(instances),
            other => Err(EngineError::UnexpectedResult {
                expected: "instances",
                actual: other.kind(),
            }),
        }
    }

    /// Unwraps a config file list.
    pub fn into_config_files(self) -> EngineResult<Vec<ConfigFile>> {
        match self {
            ReadResult::ConfigFiles(files) => Ok(files),
            other => Err(EngineError::UnexpectedResult {
                expected: "config files",
                actual: other.kind(),
            }),
        }
    }
}

/// One incremental change delivered by a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Instances of a service changed.
    Service(ServiceChangeEvent),
    /// A config file changed.
    Config(ConfigChangeEvent),
}

/// Receiving end of a watch subscription.
pub type WatchStream = mpsc::Receiver<WatchEvent>;

/// Job-scoped resources handed to plugins on `init`.
#[derive(Clone)]
pub struct PluginContext {
    /// Id of the owning job.
    pub job_id: String,
    /// The job's root cancellation token.
    pub token: CancellationToken,
    /// Process-wide time wheel.
    pub wheel: Arc<TimeWheel>,
    /// Process-wide worker pool.
    pub pool: Arc<WorkerPool>,
}

/// Reads state from a source registry.
#[async_trait]
pub trait Reader: Send + Sync {
    /// Configures the reader for one job.
    async fn init(&mut self, options: &Options, ctx: &PluginContext) -> EngineResult<()>;

    /// Executes a read request.
    async fn read(&self, request: &ReadRequest) -> EngineResult<ReadResult>;

    /// Opens an incremental update stream.
    ///
    /// `None` means the source has no incremental updates for this entity;
    /// reconciliation alone keeps it current.
    async fn watch(&self, request: &WatchRequest) -> EngineResult<Option<WatchStream>>;

    /// Component name, used as the transform source tag.
    fn name(&self) -> &str;

    /// Releases resources held for the job.
    async fn close(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Writes state to the destination registry.
#[async_trait]
pub trait Writer: Send + Sync {
    /// Configures the writer for one job.
    async fn init(&mut self, options: &Options, ctx: &PluginContext) -> EngineResult<()>;

    /// Executes a write request. `Ok(false)` means the request was not accepted.
    async fn write(&self, request: &WriteRequest) -> EngineResult<bool>;

    /// Component name, used as the transform target tag.
    fn name(&self) -> &str;

    /// Releases resources held for the job.
    async fn close(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Input of a [`Transformer`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransformParam {
    /// Source component tag.
    pub source: String,
    /// Target component tag.
    pub target: String,
    /// Object to convert.
    pub object: Value,
}

/// Converts objects between component formats.
pub trait Transformer: Send + Sync {
    /// Converts `param.object` from `param.source` format to `param.target` format.
    fn convert(&self, param: TransformParam) -> EngineResult<Value>;

    /// Transformer name.
    fn name(&self) -> &str;
}

/// Builds a fresh reader.
pub type ReaderSupplier = Arc<dyn Fn() -> Box<dyn Reader> + Send + Sync>;
/// Builds a fresh writer.
pub type WriterSupplier = Arc<dyn Fn() -> Box<dyn Writer> + Send + Sync>;

/// Name-keyed lookup of readers, writers and transformers.
///
/// Built at startup and passed down explicitly.
#[derive(Default)]
pub struct PluginRegistry {
    readers: RwLock<HashMap<String, ReaderSupplier>>,
    writers: RwLock<HashMap<String, WriterSupplier>>,
    transformers: RwLock<HashMap<String, Arc<dyn Transformer>>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reader supplier. Returns false if the name was taken.
    pub fn register_reader<F>(&self, name: impl Into<String>, supplier: F) -> bool
    where
        F: Fn() -> Box<dyn Reader> + Send + Sync + 'static,
    {
        insert_new(&self.readers, name.into(), Arc::new(supplier))
    }

    /// Registers a writer supplier. Returns false if the name was taken.
    pub fn register_writer<F>(&self, name: impl Into<String>, supplier: F) -> bool
    where
        F: Fn() -> Box<dyn Writer> + Send + Sync + 'static,
    {
        insert_new(&self.writers, name.into(), Arc::new(supplier))
    }

    /// Registers a shared transformer. Returns false if the name was taken.
    pub fn register_transformer(
        &self,
        name: impl Into<String>,
        transformer: Arc<dyn Transformer>,
    ) -> bool {
        insert_new(&self.transformers, name.into(), transformer)
    }

    /// Builds a reader for `name`.
    pub fn reader(&self, name: &str) -> Option<Box<dyn Reader>> {
        let supplier = self.readers.read().get(name).cloned()?;
        Some(supplier())
    }

    /// Builds a writer for `name`.
    pub fn writer(&self, name: &str) -> Option<Box<dyn Writer>> {
        let supplier = self.writers.read().get(name).cloned()?;
        Some(supplier())
    }

    /// Looks up a transformer by name.
    pub fn transformer(&self, name: &str) -> Option<Arc<dyn Transformer>> {
        self.transformers.read().get(name).cloned()
    }

    /// Looks up the transformer serving a run mode.
    pub fn transformer_for(&self, mode: JobType) -> EngineResult<Arc<dyn Transformer>> {
        self.transformer(mode.as_str()).ok_or_else(|| {
            EngineError::MissingCollaborator(format!("transformer {}", mode.as_str()))
        })
    }

    /// Returns true if a reader is registered under `name`.
    pub fn has_reader(&self, name: &str) -> bool {
        self.readers.read().contains_key(name)
    }

    /// Returns true if a writer is registered under `name`.
    pub fn has_writer(&self, name: &str) -> bool {
        self.writers.read().contains_key(name)
    }

    /// Sorted names of every registered reader.
    pub fn reader_names(&self) -> Vec<String> {
        sorted_keys(&self.readers)
    }

    /// Sorted names of every registered writer.
    pub fn writer_names(&self) -> Vec<String> {
        sorted_keys(&self.writers)
    }
}

fn insert_new<V>(map: &RwLock<HashMap<String, V>>, name: String, value: V) -> bool {
    let mut map = map.write();
    if map.contains_key(&name) {
        return false;
    }
    map.insert(name, value);
    true
}

fn sorted_keys<V>(map: &RwLock<HashMap<String, V>>) -> Vec<String> {
    let mut names: Vec<String> = map.read().keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::KeyedTransformer;

    struct NullReader;

    #[async_trait]
    impl Reader for NullReader {
        async fn init(&mut self, _: &Options, _: &PluginContext) -> EngineResult<()> {
            Ok(())
        }
        async fn read(&self, _: &ReadRequest) -> EngineResult<ReadResult> {
            Ok(ReadResult::Services(Vec::new()))
        }
        async fn watch(&self, _: &WatchRequest) -> EngineResult<Option<WatchStream>> {
            Ok(None)
        }
        fn name(&self) -> &str {
            "null"
        }
    }

    #[test]
    fn supplier_builds_fresh_instances() {
        let registry = PluginRegistry::new();
        assert!(registry.register_reader("null", || Box::new(NullReader)));
        assert!(!registry.register_reader("null", || Box::new(NullReader)));

        assert!(registry.has_reader("null"));
        assert_eq!(registry.reader("null").map(|r| r.name().to_string()), Some("null".into()));
        assert!(registry.reader("nacos").is_none());
        assert!(registry.writer("null").is_none());
        assert_eq!(registry.reader_names(), vec!["null".to_string()]);
    }

    #[test]
    fn transformer_by_mode() {
        let registry = PluginRegistry::new();
        assert!(matches!(
            registry.transformer_for(JobType::Discovery),
            Err(EngineError::MissingCollaborator(_))
        ));

        registry.register_transformer("discovery", Arc::new(KeyedTransformer::new("discovery")));
        assert!(registry.transformer_for(JobType::Discovery).is_ok());
        assert!(registry.transformer_for(JobType::Config).is_err());
    }

    #[test]
    fn read_result_shape_check() {
        let result = ReadResult::Instances(Vec::new());
        assert!(matches!(
            result.into_services(),
            Err(EngineError::UnexpectedResult {
                expected: "services",
                actual: "instances"
            })
        ));
    }
}
