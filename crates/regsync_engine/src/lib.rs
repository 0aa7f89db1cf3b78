//! # regsync Engine
//!
//! Plugin contracts and the reconciliation engine that moves registry state
//! from a source to a destination.
//!
//! This crate provides:
//! - `Reader`, `Writer` and `Transformer` contracts with a name-keyed registry
//! - `LocalSink`, a periodic diff plus watch-driven sync loop
//! - Heartbeat keep-alive on the shared time wheel and worker pool
//! - `MemoryRegistry`, an in-process registry usable as source or destination
//!
//! ## Key Invariants
//!
//! - Snapshot entries are committed only after their writes succeeded
//! - Collaborator errors never stop a sink; they are retried next tick
//! - Cancelling a job token stops every watch and heartbeat it owns

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod heartbeat;
mod memory;
mod plugin;
mod sink;
mod transform;

pub use config::{HeartbeatConfig, SinkConfig, RECONCILE_INTERVAL_OPTION};
pub use error::{EngineError, EngineResult};
pub use heartbeat::HeartbeatKeeper;
pub use memory::{
    MemoryReader, MemoryRegistry, MemorySeed, MemoryWriter, SeedService, HEARTBEAT_INITIAL_OPTION,
    HEARTBEAT_OPTION, HEARTBEAT_PERIOD_OPTION, SEED_OPTION, WATCH_BUFFER_OPTION,
};
pub use plugin::{
    PluginContext, PluginRegistry, ReadResult, Reader, ReaderSupplier, TransformParam,
    Transformer, WatchEvent, WatchStream, Writer, WriterSupplier,
};
pub use sink::{LocalSink, Sink, SinkStats, WatchKey, LOCAL_SINK_NAME};
pub use transform::{ApplyFn, KeyedTransformer};
