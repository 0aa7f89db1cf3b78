//! Server configuration.

use regsync_engine::SinkConfig;
use regsync_sched::{PoolConfig, WheelConfig};

/// Configuration for the core server.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Process-wide worker pool.
    pub pool: PoolConfig,
    /// Process-wide time wheel.
    pub wheel: WheelConfig,
    /// Defaults for every job's sink; job options may override them.
    pub sink: SinkConfig,
}

impl ServerConfig {
    /// Creates a server configuration with default pool, wheel and sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker pool configuration.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the time wheel configuration.
    pub fn with_wheel(mut self, wheel: WheelConfig) -> Self {
        self.wheel = wheel;
        self
    }

    /// Sets the default sink configuration.
    pub fn with_sink(mut self, sink: SinkConfig) -> Self {
        self.sink = sink;
        self
    }
}
