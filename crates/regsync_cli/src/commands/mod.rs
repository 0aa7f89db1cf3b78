//! CLI command implementations.

pub mod run;
pub mod validate;

use regsync_engine::{KeyedTransformer, MemoryRegistry, PluginRegistry};
use regsync_model::{ComponentType, JobConf, JobType};
use std::path::Path;
use std::sync::Arc;

/// Plugin registry with the built-in components.
///
/// `memory` is one in-process registry shared by its reader and writer;
/// seed it through the `seed` source option.
pub fn builtin_plugins() -> Arc<PluginRegistry> {
    let plugins = PluginRegistry::new();
    let memory = MemoryRegistry::new(ComponentType::MEMORY);
    memory.register_reader(&plugins);
    memory.register_writer(&plugins);

    for mode in [JobType::Discovery, JobType::Config] {
        plugins.register_transformer(
            mode.as_str(),
            Arc::new(
                KeyedTransformer::new(mode.as_str())
                    .passthrough(ComponentType::MEMORY, ComponentType::MEMORY),
            ),
        );
    }
    Arc::new(plugins)
}

/// Reads and validates a job file.
pub fn load_jobs(path: &Path) -> Result<Vec<JobConf>, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("cannot read {}: {err}", path.display()))?;
    Ok(JobConf::parse_list(&raw)?)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Writes `contents` to a temporary job file.
    pub fn job_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }
}
