//! Run command implementation.

use super::{builtin_plugins, load_jobs};
use regsync_engine::{PluginRegistry, RECONCILE_INTERVAL_OPTION};
use regsync_model::{JobConf, Options};
use regsync_sched::PoolConfig;
use regsync_server::{CoreServer, ServerConfig};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// Runs the run command.
pub fn run(
    path: &Path,
    reconcile_interval_ms: Option<u64>,
    workers: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = server_config(reconcile_interval_ms, workers)?;
    let jobs = load_jobs(path)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("regsync")
        .build()?;
    runtime.block_on(async {
        let shutdown = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "cannot listen for ctrl-c");
            }
        };
        serve(builtin_plugins(), config, jobs, shutdown).await
    })
}

/// Server configuration with the command-line overrides applied.
///
/// The reconcile interval follows the same rules as the
/// `reconcile_interval_ms` job option, so zero is rejected.
fn server_config(
    reconcile_interval_ms: Option<u64>,
    workers: Option<usize>,
) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = ServerConfig::default();
    if let Some(millis) = reconcile_interval_ms {
        let overrides =
            Options::from([(RECONCILE_INTERVAL_OPTION.to_string(), millis.to_string())]);
        let sink = config.sink.clone().with_options(&overrides)?;
        config = config.with_sink(sink);
    }
    if let Some(workers) = workers {
        let capacity = config.pool.queue_capacity;
        config = config.with_pool(PoolConfig::new(workers, capacity));
    }
    Ok(config)
}

/// Submits `jobs`, waits for `shutdown`, then destroys the server.
///
/// Jobs that fail to submit are reported and skipped.
pub async fn serve<F>(
    plugins: Arc<PluginRegistry>,
    config: ServerConfig,
    jobs: Vec<JobConf>,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: Future<Output = ()>,
{
    let server = CoreServer::new(config, plugins)?;

    let mut submitted = 0;
    for conf in jobs {
        let id = conf.id.clone();
        match server.exec(conf) {
            Ok(_) => {
                submitted += 1;
                println!("Started job {id}");
            }
            Err(err) => {
                error!(job_id = %id, error = %err, "job not started");
                println!("Skipped job {id}: {err}");
            }
        }
    }
    info!(jobs = submitted, "waiting for ctrl-c");

    shutdown.await;

    println!();
    for id in server.job_ids() {
        println!("{id}: {}", server.job_status(&id));
    }
    server.destroy().await?;
    println!("✓ Shut down cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use regsync_engine::{EngineError, SinkConfig};
    use regsync_model::JobType;
    use regsync_sched::WheelConfig;
    use std::time::Duration;

    fn fast_config() -> ServerConfig {
        ServerConfig::new()
            .with_pool(PoolConfig::new(2, 8))
            .with_wheel(WheelConfig::new(Duration::from_millis(10), 16))
            .with_sink(SinkConfig::new(Duration::from_millis(20)))
    }

    #[tokio::test]
    async fn serve_runs_until_shutdown() {
        let jobs = vec![
            JobConf::new("j1", JobType::Discovery, "memory", "memory"),
            JobConf::new("j2", JobType::Discovery, "eureka", "memory"),
        ];
        let shutdown = tokio::time::sleep(Duration::from_millis(100));
        serve(builtin_plugins(), fast_config(), jobs, shutdown)
            .await
            .unwrap();
    }

    #[test]
    fn interval_override_is_validated() {
        let config = server_config(Some(250), Some(3)).unwrap();
        assert_eq!(config.sink.reconcile_interval, Duration::from_millis(250));
        assert_eq!(config.pool.workers, 3);

        let err = server_config(Some(0), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::InvalidOption { .. })
        ));
    }

    #[test]
    fn run_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(&dir.path().join("jobs.json"), None, None).is_err());
    }
}
