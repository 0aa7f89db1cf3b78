//! Core server: the registry of running jobs.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::executor::{self, ConfigExecutor, DiscoveryExecutor, Executor, JobParts};
use crate::job::Job;
use parking_lot::RwLock;
use regsync_engine::{LocalSink, PluginContext, PluginRegistry};
use regsync_model::{JobConf, JobStatus, JobType};
use regsync_sched::{TimeWheel, WorkerPool};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Submits jobs, tracks them by id and tears everything down on exit.
///
/// Owns the process-wide worker pool and time wheel handed to every plugin.
/// [`exec`](Self::exec) must be called from inside a tokio runtime; outside
/// one it fails with [`ServerError::NoRuntime`] and tracks nothing.
///
/// # Example
///
/// ```rust,ignore
/// use regsync_server::{CoreServer, ServerConfig};
///
/// let server = CoreServer::new(ServerConfig::default(), plugins)?;
/// server.exec(conf)?;
/// // ...
/// server.destroy().await?;
/// ```
pub struct CoreServer {
    config: ServerConfig,
    plugins: Arc<PluginRegistry>,
    pool: Arc<WorkerPool>,
    wheel: Arc<TimeWheel>,
    executors: RwLock<HashMap<JobType, Arc<dyn Executor>>>,
    jobs: RwLock<HashMap<String, Arc<Job>>>,
    root: CancellationToken,
}

impl CoreServer {
    /// Creates a server, starting its worker pool and time wheel.
    pub fn new(config: ServerConfig, plugins: Arc<PluginRegistry>) -> ServerResult<Self> {
        let pool = WorkerPool::new(config.pool.clone())?;
        pool.set_panic_handler(|message| {
            error!(panic = %message, "pooled task panicked");
        });
        let wheel = TimeWheel::new(config.wheel.clone())?;
        wheel.start()?;

        let mut executors: HashMap<JobType, Arc<dyn Executor>> = HashMap::new();
        executors.insert(JobType::Discovery, Arc::new(DiscoveryExecutor));
        executors.insert(JobType::Config, Arc::new(ConfigExecutor));

        info!(
            workers = config.pool.workers,
            slots = config.wheel.slots,
            interval = ?config.wheel.interval,
            "core server started"
        );
        Ok(Self {
            config,
            plugins,
            pool: Arc::new(pool),
            wheel: Arc::new(wheel),
            executors: RwLock::new(executors),
            jobs: RwLock::new(HashMap::new()),
            root: CancellationToken::new(),
        })
    }

    /// Replaces the executor for its job family.
    pub fn register_executor(&self, executor: Arc<dyn Executor>) {
        self.executors.write().insert(executor.job_type(), executor);
    }

    /// Plugin registry used to resolve components.
    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    /// Process-wide time wheel.
    pub fn wheel(&self) -> &Arc<TimeWheel> {
        &self.wheel
    }

    /// Process-wide worker pool.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Resolves the job's collaborators, registers it and starts it.
    ///
    /// Returns as soon as the job is handed to its executor; build and run
    /// happen in the background and are reported through the job status.
    pub fn exec(&self, conf: JobConf) -> ServerResult<Arc<Job>> {
        conf.validate()?;
        let runtime =
            Handle::try_current().map_err(|_| ServerError::NoRuntime(conf.id.clone()))?;
        if self.jobs.read().contains_key(&conf.id) {
            return Err(ServerError::DuplicateJob(conf.id));
        }

        let executor = self
            .executors
            .read()
            .get(&conf.job_type)
            .cloned()
            .ok_or(ServerError::NoExecutor(conf.job_type))?;
        let reader = self
            .plugins
            .reader(conf.source.as_str())
            .ok_or_else(|| ServerError::MissingPlugin {
                kind: "reader",
                name: conf.source.to_string(),
            })?;
        let writer = self
            .plugins
            .writer(conf.dest.as_str())
            .ok_or_else(|| ServerError::MissingPlugin {
                kind: "writer",
                name: conf.dest.to_string(),
            })?;
        let sink_config = self.config.sink.clone().with_options(&conf.job_options)?;
        let sink = LocalSink::new(Arc::clone(&self.plugins), sink_config);

        let token = self.root.child_token();
        let ctx = PluginContext {
            job_id: conf.id.clone(),
            token: token.clone(),
            wheel: Arc::clone(&self.wheel),
            pool: Arc::clone(&self.pool),
        };
        let job = Arc::new(Job::new(conf, token));

        {
            let mut jobs = self.jobs.write();
            if jobs.contains_key(job.id()) {
                return Err(ServerError::DuplicateJob(job.id().to_string()));
            }
            jobs.insert(job.id().to_string(), Arc::clone(&job));
        }

        let parts = JobParts {
            reader,
            writer,
            sink: Box::new(sink),
            ctx,
        };
        job.attach(executor::exec(&runtime, executor, Arc::clone(&job), parts));
        info!(job_id = %job.id(), job_type = %job.conf().job_type, "job submitted");
        Ok(job)
    }

    /// Status of a job, `Unknown` if it is not tracked.
    pub fn job_status(&self, id: &str) -> JobStatus {
        self.jobs
            .read()
            .get(id)
            .map(|job| job.status())
            .unwrap_or(JobStatus::Unknown)
    }

    /// A tracked job.
    pub fn job(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.read().get(id).cloned()
    }

    /// Ids of every tracked job, sorted.
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Requests a job to stop. The job stays tracked with status `Stopped`.
    ///
    /// Returns false if the job had already ended.
    pub fn stop_job(&self, id: &str) -> ServerResult<bool> {
        let job = self
            .job(id)
            .ok_or_else(|| ServerError::UnknownJob(id.to_string()))?;
        Ok(job.stop())
    }

    /// Closes every job, then stops the wheel and the pool.
    ///
    /// Every job is closed even if another fails; failures are returned
    /// together as [`ServerError::CloseFailed`].
    pub async fn destroy(&self) -> ServerResult<()> {
        let jobs: Vec<Arc<Job>> = self.jobs.write().drain().map(|(_, job)| job).collect();
        info!(jobs = jobs.len(), "destroying core server");

        let mut failures = Vec::new();
        for job in jobs {
            if let Err(mut errs) = job.close().await {
                failures.append(&mut errs);
            }
        }
        self.root.cancel();

        let wheel = Arc::clone(&self.wheel);
        let pool = Arc::clone(&self.pool);
        let stopped = tokio::task::spawn_blocking(move || {
            wheel.stop();
            pool.close();
            pool.join();
        })
        .await;
        if let Err(err) = stopped {
            failures.push(format!("scheduler shutdown: {err}"));
        }

        if failures.is_empty() {
            info!("core server destroyed");
            Ok(())
        } else {
            warn!(failures = failures.len(), "core server destroyed with errors");
            Err(ServerError::CloseFailed(failures))
        }
    }
}
