//! Job executors.
//!
//! An executor builds a job for its family and drives it through the status
//! machine: `Building` while collaborators initialize, `Running` while the
//! sink loop runs, `Crash` if either fails. A status watcher cancels the job
//! token as soon as the job is stopped or crashed, which tears down the sink
//! loop, its watch consumers and any heartbeat started under the job.

use crate::error::ServerResult;
use crate::job::Job;
use async_trait::async_trait;
use regsync_engine::{PluginContext, Reader, Sink, Writer};
use regsync_model::{JobStatus, JobType};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Uninitialized collaborators resolved for one job.
pub struct JobParts {
    /// Source reader.
    pub reader: Box<dyn Reader>,
    /// Destination writer.
    pub writer: Box<dyn Writer>,
    /// Sink moving data between them.
    pub sink: Box<dyn Sink>,
    /// Job-scoped plugin resources.
    pub ctx: PluginContext,
}

/// Builds and runs jobs of one family.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Job family handled by this executor.
    fn job_type(&self) -> JobType;

    /// Initializes the collaborators of `job` and returns its bound sink.
    async fn pre_hook(&self, job: &Job, parts: JobParts) -> ServerResult<Arc<dyn Sink>>;
}

/// Executor for service discovery jobs.
#[derive(Debug, Default)]
pub struct DiscoveryExecutor;

#[async_trait]
impl Executor for DiscoveryExecutor {
    fn job_type(&self) -> JobType {
        JobType::Discovery
    }

    async fn pre_hook(&self, job: &Job, parts: JobParts) -> ServerResult<Arc<dyn Sink>> {
        info!(
            job_id = %job.id(),
            source = %job.conf().source,
            dest = %job.conf().dest,
            "building discovery job"
        );
        build(job, parts, JobType::Discovery).await
    }
}

/// Executor for config file jobs.
#[derive(Debug, Default)]
pub struct ConfigExecutor;

#[async_trait]
impl Executor for ConfigExecutor {
    fn job_type(&self) -> JobType {
        JobType::Config
    }

    async fn pre_hook(&self, job: &Job, parts: JobParts) -> ServerResult<Arc<dyn Sink>> {
        info!(
            job_id = %job.id(),
            source = %job.conf().source,
            dest = %job.conf().dest,
            "building config job"
        );
        build(job, parts, JobType::Config).await
    }
}

/// Initializes reader, writer and sink, and binds them to `job`.
async fn build(job: &Job, parts: JobParts, mode: JobType) -> ServerResult<Arc<dyn Sink>> {
    let JobParts {
        mut reader,
        mut writer,
        mut sink,
        ctx,
    } = parts;
    let conf = job.conf();

    reader.init(&conf.source_options, &ctx).await?;
    if let Err(err) = writer.init(&conf.dest_options, &ctx).await {
        if let Err(close_err) = reader.close().await {
            warn!(job_id = %job.id(), error = %close_err, "reader close failed");
        }
        return Err(err.into());
    }

    let reader: Arc<dyn Reader> = Arc::from(reader);
    let writer: Arc<dyn Writer> = Arc::from(writer);
    // Bound before the sink init so a failed build still closes them.
    let result = sink.init(mode, Arc::clone(&writer), Arc::clone(&reader));
    let sink: Arc<dyn Sink> = Arc::from(sink);
    job.bind(reader, writer, Arc::clone(&sink));
    result?;
    Ok(sink)
}

/// Runs `job` on `runtime` and returns immediately.
pub fn exec(
    runtime: &Handle,
    executor: Arc<dyn Executor>,
    job: Arc<Job>,
    parts: JobParts,
) -> JoinHandle<()> {
    runtime.spawn(drive(executor, job, parts))
}

async fn drive(executor: Arc<dyn Executor>, job: Arc<Job>, parts: JobParts) {
    if let Err(err) = job.set_status(JobStatus::Building) {
        debug!(job_id = %job.id(), error = %err, "job ended before build");
        return;
    }

    let sink = match executor.pre_hook(&job, parts).await {
        Ok(sink) => sink,
        Err(err) => {
            error!(job_id = %job.id(), error = %err, "job build failed");
            crash(&job);
            return;
        }
    };

    tokio::spawn(watch_status(
        job.id().to_string(),
        job.subscribe(),
        job.token().clone(),
    ));

    if let Err(err) = job.set_status(JobStatus::Running) {
        debug!(job_id = %job.id(), error = %err, "job stopped while building");
        return;
    }
    info!(job_id = %job.id(), sink = sink.name(), "job running");

    if let Err(err) = sink.run(job.token().clone()).await {
        error!(job_id = %job.id(), error = %err, "sink failed");
        crash(&job);
    }
}

fn crash(job: &Job) {
    if job.set_status(JobStatus::Crash).is_ok() {
        job.token().cancel();
    }
}

/// Cancels `token` once the status becomes terminal or the job is dropped.
async fn watch_status(
    job_id: String,
    mut status: watch::Receiver<JobStatus>,
    token: CancellationToken,
) {
    loop {
        let current = *status.borrow_and_update();
        if current.is_terminal() {
            debug!(job_id = %job_id, status = %current, "cancelling job");
            token.cancel();
            return;
        }
        tokio::select! {
            _ = token.cancelled() => return,
            changed = status.changed() => {
                if changed.is_err() {
                    token.cancel();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regsync_model::JobConf;
    use std::time::Duration;

    #[tokio::test]
    async fn watcher_cancels_on_stop() {
        let job = Job::new(
            JobConf::new("job-1", JobType::Discovery, "memory", "memory"),
            CancellationToken::new(),
        );
        let watcher = tokio::spawn(watch_status(
            job.id().to_string(),
            job.subscribe(),
            job.token().clone(),
        ));

        job.set_status(JobStatus::Building).unwrap();
        job.set_status(JobStatus::Running).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!job.token().is_cancelled());

        job.stop();
        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
        assert!(job.token().is_cancelled());
    }

    #[tokio::test]
    async fn watcher_sees_status_set_before_it_started() {
        let job = Job::new(
            JobConf::new("job-1", JobType::Config, "memory", "memory"),
            CancellationToken::new(),
        );
        job.set_status(JobStatus::Crash).unwrap();

        watch_status(job.id().to_string(), job.subscribe(), job.token().clone()).await;
        assert!(job.token().is_cancelled());
    }

    #[test]
    fn executors_declare_their_family() {
        assert_eq!(DiscoveryExecutor.job_type(), JobType::Discovery);
        assert_eq!(ConfigExecutor.job_type(), JobType::Config);
    }
}
