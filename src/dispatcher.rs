//! Sandbox-side poll loop.
//!
//! Runs inside a sandbox process. Each tick fetches the job actions addressed
//! to this sandbox, starts a [`Job`] task for every new job, forwards pending
//! actions to jobs it already tracks and reaps the jobs that have completed.
//! The dispatcher owns its jobs by id; jobs only ever see the
//! [`JobReporter`] capability. When polling ends, every job still tracked is
//! stopped and awaited before the dispatcher returns.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::Configuration;
use crate::error::ServiceError;
use crate::job::{Job, JobHandle, PendingAction};
use crate::service::{JobAction, JobActionSource, JobData, JobReporter, MessageMetadata};
use crate::trace::Tracer;

const STATUS_ACTIVATING: i32 = 1;
const STATUS_RUNNING: i32 = 2;

/// Why a dispatcher stopped polling.
#[derive(Debug, Clone)]
pub enum Shutdown {
    /// The service closed this sandbox.
    Closed,
    /// Polling failed; the process should exit so the worker can reconcile.
    Faulted(ServiceError),
}

struct TrackedJob {
    handle: JobHandle,
    task: JoinHandle<()>,
}

pub struct Dispatcher<C> {
    sandbox_id: String,
    service: Arc<C>,
    tracer: Tracer,
    poll_interval: Duration,
    working_directory: PathBuf,
    jobs: HashMap<String, TrackedJob>,
    alive: Arc<AtomicBool>,
}

impl<C> Dispatcher<C>
where
    C: JobActionSource + JobReporter + 'static,
{
    pub fn new(sandbox_id: &str, config: &Configuration, service: Arc<C>, tracer: Tracer) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            service,
            tracer,
            poll_interval: config.polling_interval(),
            working_directory: config.working_directory.clone(),
            jobs: HashMap::new(),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Poll until the service closes the sandbox or polling fails, then stop
    /// the jobs still running.
    pub async fn start(mut self) -> Shutdown {
        self.alive.store(true, Ordering::SeqCst);
        self.tracer.sandbox_starting(&self.sandbox_id);

        let shutdown = loop {
            if let Some(shutdown) = self.routine().await {
                break shutdown;
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        tracing::info!(
            sandbox_id = %self.sandbox_id,
            shutdown = ?shutdown,
            running_jobs = self.jobs.len(),
            "dispatcher stopping"
        );
        self.stop_jobs().await;
        self.alive.store(false, Ordering::SeqCst);
        shutdown
    }

    /// One poll tick. Returns `Some` when the loop must stop.
    pub async fn routine(&mut self) -> Option<Shutdown> {
        let actions = match self.service.get_job_actions(&self.sandbox_id).await {
            Ok(actions) => actions,
            Err(err) if err.is_authorization() => {
                self.tracer.sandbox_closure_request(&self.sandbox_id);
                return Some(Shutdown::Closed);
            }
            Err(err) => {
                self.tracer.trace_error(format!(
                    "Error getting job actions. [sandboxId={}][error={}]",
                    self.sandbox_id, err
                ));
                return Some(Shutdown::Faulted(err));
            }
        };

        if !actions.is_empty() {
            self.tracer.job_actions_found(actions.len());
            self.acknowledge(&actions).await;
        }

        for action in actions {
            match self.service.get_job_data(&action.job_id).await {
                Ok(data) => self.classify(&action.job_id, data),
                Err(err) => {
                    self.tracer.error(format_args!(
                        "unable to fetch job data. [jobId={}][error={}]",
                        action.job_id, err
                    ));
                }
            }
        }

        self.sweep();
        None
    }

    async fn acknowledge(&self, actions: &[JobAction]) {
        let metadata: Vec<MessageMetadata> = actions
            .iter()
            .filter_map(|action| action.message_metadata.clone())
            .collect();
        if metadata.is_empty() {
            return;
        }
        if let Err(err) = self
            .service
            .acknowledge_job_actions(&self.sandbox_id, metadata)
            .await
        {
            tracing::warn!(sandbox_id = %self.sandbox_id, error = %err, "failed to acknowledge job actions");
        }
    }

    fn classify(&mut self, job_id: &str, data: JobData) {
        let pending = data
            .pending_action
            .map(PendingAction::from_code)
            .filter(|action| *action != PendingAction::None);

        match pending {
            None if matches!(data.job_status, Some(STATUS_ACTIVATING | STATUS_RUNNING)) => {
                if self.jobs.contains_key(job_id) {
                    tracing::debug!(job_id, "job already running in this sandbox");
                    return;
                }
                let reporter: Arc<dyn JobReporter> = self.service.clone();
                let job = Job::new(
                    &self.sandbox_id,
                    job_id,
                    data,
                    self.working_directory.clone(),
                    reporter,
                    self.tracer.clone(),
                );
                let handle = job.handle();
                let task = tokio::spawn(job.run());
                self.jobs
                    .insert(job_id.to_string(), TrackedJob { handle, task });
            }
            Some(action) => match self.jobs.get(job_id) {
                Some(tracked) => {
                    tracing::info!(job_id, action = action.name(), "delivering pending action");
                    tracked.handle.deliver(action);
                }
                None => {
                    tracing::debug!(job_id, action = action.name(), "pending action for untracked job");
                }
            },
            None => {
                tracing::debug!(job_id, status = ?data.job_status, "no action required for job");
            }
        }
    }

    fn sweep(&mut self) {
        self.jobs.retain(|job_id, tracked| {
            let keep = !tracked.handle.is_completed();
            if !keep {
                tracing::debug!(job_id = %job_id, "job reaped");
            }
            keep
        });
    }

    /// Deliver Stop to every tracked job and wait until each has reported its
    /// terminal status and unloaded.
    pub async fn stop_jobs(&mut self) {
        for (job_id, tracked) in &self.jobs {
            tracing::info!(sandbox_id = %self.sandbox_id, job_id = %job_id, "stopping job");
            tracked.handle.deliver(PendingAction::Stop);
        }
        for (job_id, tracked) in self.jobs.drain() {
            if let Err(e) = tracked.task.await {
                tracing::warn!(job_id = %job_id, error = %e, "job task ended abnormally");
            }
        }
    }

    pub fn tracked_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_tracked(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    /// Live flag of the poll loop started by [`Dispatcher::start`].
    pub fn alive(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.alive)
    }
}
