//! Runtime job: configuration, status channel and bound collaborators.

use crate::error::ServerResult;
use parking_lot::Mutex;
use regsync_engine::{Reader, Sink, Writer};
use regsync_model::{JobConf, JobStatus};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Collaborators bound to a job by its executor.
struct Bound {
    reader: Arc<dyn Reader>,
    writer: Arc<dyn Writer>,
    sink: Arc<dyn Sink>,
}

/// A running sync job.
///
/// Status changes go through one watch channel and follow the job state
/// machine; an invalid transition is rejected and leaves the status as is.
pub struct Job {
    conf: JobConf,
    token: CancellationToken,
    status: watch::Sender<JobStatus>,
    bound: Mutex<Option<Bound>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.conf.id)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Job {
    /// Creates a pending job cancelled through `token`.
    pub fn new(conf: JobConf, token: CancellationToken) -> Self {
        let (status, _) = watch::channel(JobStatus::Pending);
        Self {
            conf,
            token,
            status,
            bound: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Job id.
    pub fn id(&self) -> &str {
        &self.conf.id
    }

    /// Job configuration.
    pub fn conf(&self) -> &JobConf {
        &self.conf
    }

    /// Root cancellation token of the job.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Current status.
    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    /// Receiver observing every status change.
    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status.subscribe()
    }

    /// Moves the job to `next`.
    pub fn set_status(&self, next: JobStatus) -> ServerResult<()> {
        let mut result = Ok(());
        self.status.send_if_modified(|current| match current.transition(next) {
            Ok(next) => {
                debug!(job_id = %self.conf.id, from = %current, to = %next, "job status changed");
                *current = next;
                true
            }
            Err(err) => {
                result = Err(err.into());
                false
            }
        });
        result
    }

    /// Requests the job to stop. Returns false if it already ended.
    pub fn stop(&self) -> bool {
        let stopped = self.set_status(JobStatus::Stopped).is_ok();
        if stopped {
            info!(job_id = %self.conf.id, "job stop requested");
        }
        stopped
    }

    /// Name of the bound sink, once the job is built.
    pub fn sink_name(&self) -> Option<String> {
        self.bound
            .lock()
            .as_ref()
            .map(|bound| bound.sink.name().to_string())
    }

    pub(crate) fn bind(&self, reader: Arc<dyn Reader>, writer: Arc<dyn Writer>, sink: Arc<dyn Sink>) {
        *self.bound.lock() = Some(Bound {
            reader,
            writer,
            sink,
        });
    }

    pub(crate) fn attach(&self, task: JoinHandle<()>) {
        *self.task.lock() = Some(task);
    }

    /// Stops the job, waits for its loop to end and closes its collaborators.
    ///
    /// Every step runs even if an earlier one failed; failures are returned
    /// as messages.
    pub async fn close(&self) -> Result<(), Vec<String>> {
        self.stop();
        self.token.cancel();

        let mut failures = Vec::new();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                failures.push(format!("job {}: task: {err}", self.conf.id));
            }
        }

        let bound = self.bound.lock().take();
        if let Some(bound) = bound {
            if let Err(err) = bound.reader.close().await {
                failures.push(format!("job {}: reader {}: {err}", self.conf.id, bound.reader.name()));
            }
            if let Err(err) = bound.writer.close().await {
                failures.push(format!("job {}: writer {}: {err}", self.conf.id, bound.writer.name()));
            }
        }

        if failures.is_empty() {
            info!(job_id = %self.conf.id, "job closed");
            Ok(())
        } else {
            warn!(job_id = %self.conf.id, failures = failures.len(), "job closed with errors");
            Err(failures)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regsync_model::JobType;

    fn job() -> Job {
        Job::new(
            JobConf::new("job-1", JobType::Discovery, "memory", "memory"),
            CancellationToken::new(),
        )
    }

    #[test]
    fn follows_state_machine() {
        let job = job();
        assert_eq!(job.status(), JobStatus::Pending);

        job.set_status(JobStatus::Building).unwrap();
        job.set_status(JobStatus::Running).unwrap();
        assert!(job.set_status(JobStatus::Building).is_err());
        assert_eq!(job.status(), JobStatus::Running);

        assert!(job.stop());
        assert_eq!(job.status(), JobStatus::Stopped);
        assert!(!job.stop());
        assert!(job.set_status(JobStatus::Running).is_err());
    }

    #[test]
    fn subscribers_see_changes() {
        let job = job();
        let mut rx = job.subscribe();
        assert!(!rx.has_changed().unwrap());

        job.set_status(JobStatus::Building).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), JobStatus::Building);

        // Rejected transitions do not wake subscribers.
        assert!(job.set_status(JobStatus::Pending).is_err());
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn close_unbuilt_job() {
        let job = job();
        job.close().await.unwrap();
        assert_eq!(job.status(), JobStatus::Stopped);
        assert!(job.token().is_cancelled());
        assert!(job.sink_name().is_none());
    }
}
