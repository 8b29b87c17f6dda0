//! Job lifecycle.
//!
//! A [`Job`] is created by the dispatcher for every new job action and runs as
//! its own task:
//!
//! ```text
//! Activating ─► load ─► runtime init ─► probe ─► Running ─► supervise ─► Completed | Stopped
//!     └──────────────────── any error ───────────────────────────────────► Failed
//! ```
//!
//! Whatever the outcome, the job is unloaded and its `completed` flag is set
//! last so the dispatcher can reap it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::{Result, WorkerError};
use crate::runtime::{DefinitionKind, Language, LineHandler, Runbook, Runtime};
use crate::service::{JobData, JobReporter};
use crate::trace::Tracer;

pub mod actions;
pub mod status;
pub mod stream;

pub use actions::{ActionMailbox, PendingAction};
pub use status::JobStatus;
pub use stream::{StreamClassifier, StreamType};

const SUPERVISION_INTERVAL: Duration = Duration::from_millis(10);

/// Dispatcher-side view of a running job.
#[derive(Clone)]
pub struct JobHandle {
    id: String,
    mailbox: Arc<ActionMailbox>,
    completed: Arc<AtomicBool>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn deliver(&self, action: PendingAction) {
        if let Some(previous) = self.mailbox.deliver(action) {
            tracing::debug!(
                job_id = %self.id,
                replaced = previous.name(),
                action = action.name(),
                "pending action replaced before it was observed"
            );
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

pub struct Job {
    id: String,
    sandbox_id: String,
    data: JobData,
    working_directory: PathBuf,
    reporter: Arc<dyn JobReporter>,
    tracer: Tracer,
    mailbox: Arc<ActionMailbox>,
    completed: Arc<AtomicBool>,
    status: Option<JobStatus>,
    is_test: bool,
    start_time: DateTime<Utc>,
}

impl Job {
    /// `sandbox_directory` is the sandbox's working directory; the job works in
    /// a subdirectory named after its id.
    pub fn new(
        sandbox_id: &str,
        job_id: &str,
        data: JobData,
        sandbox_directory: impl Into<PathBuf>,
        reporter: Arc<dyn JobReporter>,
        tracer: Tracer,
    ) -> Self {
        Self {
            id: job_id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            data,
            working_directory: sandbox_directory.into().join(job_id),
            reporter,
            tracer,
            mailbox: Arc::new(ActionMailbox::new()),
            completed: Arc::new(AtomicBool::new(false)),
            status: None,
            is_test: false,
            start_time: Utc::now(),
        }
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id.clone(),
            mailbox: Arc::clone(&self.mailbox),
            completed: Arc::clone(&self.completed),
        }
    }

    pub fn status(&self) -> Option<&JobStatus> {
        self.status.as_ref()
    }

    /// Drive the job to a terminal state, unload it, then mark it completed.
    pub async fn run(mut self) {
        if let Err(err) = self.execute().await {
            self.fail(&err).await;
        }
        self.unload().await;

        self.completed.store(true, Ordering::SeqCst);
    }

    async fn execute(&mut self) -> Result<()> {
        self.transition(JobStatus::Activating).await?;

        let updatable = self.reporter.get_updatable_job_data(&self.id).await?;
        self.is_test = updatable.is_draft.unwrap_or(false);
        let runbook_data = self
            .reporter
            .get_runbook_data(&self.data.runbook_version_id)
            .await?;
        self.tracer.job_loaded(&self.sandbox_id, &self.id);

        let kind = DefinitionKind::try_from(runbook_data.runbook_definition_kind)?;
        let runbook = Runbook::new(
            runbook_data.name,
            self.data.runbook_version_id.clone(),
            kind,
            runbook_data.definition,
        );
        let language = Language::for_kind(kind);
        let interpreter = language.interpreter.command.clone();
        let mut runtime = Runtime::new(language, runbook, self.working_directory.clone());
        runtime.initialize().await?;

        if !runtime.is_supported().await {
            return Err(WorkerError::InterpreterUnavailable {
                command: interpreter,
            });
        }

        self.transition(JobStatus::Running).await?;

        let (lines, mut pending) = mpsc::unbounded_channel::<String>();
        let mut classifier = StreamClassifier::new(
            Arc::clone(&self.reporter),
            &self.id,
            &self.data.runbook_version_id,
        );
        let pump = tokio::spawn(async move {
            while let Some(line) = pending.recv().await {
                classifier.emit(&line).await?;
            }
            Ok::<u64, WorkerError>(classifier.emitted())
        });

        let on_output: LineHandler = Arc::new(move |line: String| {
            let _ = lines.send(line);
        });
        runtime.start_runbook(on_output)?;

        let stopped = self.supervise(&mut runtime, &pump).await;

        let emitted = pump
            .await
            .map_err(|e| anyhow::anyhow!("stream task for job {} failed: {}", self.id, e))??;

        if !stopped && !runtime.is_runbook_execution_successful() {
            tracing::warn!(
                sandbox_id = %self.sandbox_id,
                job_id = %self.id,
                exit_code = ?runtime.exit_code(),
                stderr = %runtime.error_output().trim_end(),
                "runbook exited unsuccessfully"
            );
        }
        tracing::debug!(job_id = %self.id, records = emitted, "runbook output streamed");

        let terminal = if stopped {
            JobStatus::Stopped
        } else {
            JobStatus::Completed
        };
        self.transition(terminal).await
    }

    /// Watch the runbook until it has exited. Returns true when a Stop
    /// request ended it. After a kill this keeps waiting, so the interpreter
    /// is gone before any terminal status is reported.
    async fn supervise(
        &self,
        runtime: &mut Runtime,
        pump: &tokio::task::JoinHandle<Result<u64>>,
    ) -> bool {
        let mut stopped = false;
        let mut killed = false;
        while runtime.is_runbook_running() {
            if !killed {
                match self.mailbox.try_take() {
                    Some(PendingAction::Stop) => {
                        tracing::info!(sandbox_id = %self.sandbox_id, job_id = %self.id, "stop requested");
                        runtime.stop_runbook();
                        stopped = true;
                        killed = true;
                    }
                    Some(action) => {
                        tracing::debug!(job_id = %self.id, action = action.name(), "ignoring pending action");
                    }
                    None => {}
                }
            }

            // the stream pump only ends early when appending failed
            if !killed && pump.is_finished() {
                runtime.stop_runbook();
                killed = true;
            }
            tokio::time::sleep(SUPERVISION_INTERVAL).await;
        }
        stopped
    }

    /// Report `next` and only then record it locally.
    async fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !JobStatus::can_follow(self.status.as_ref(), &next) {
            return Err(WorkerError::InvalidTransition {
                from: self
                    .status
                    .as_ref()
                    .map_or_else(|| "None".to_string(), ToString::to_string),
                to: next.to_string(),
            });
        }

        self.reporter
            .set_job_status(
                &self.sandbox_id,
                &self.id,
                next.code(),
                next.is_terminal(),
                next.exception(),
            )
            .await?;

        tracing::info!(sandbox_id = %self.sandbox_id, job_id = %self.id, status = %next, "job status changed");
        self.status = Some(next);
        Ok(())
    }

    async fn fail(&mut self, err: &WorkerError) {
        let exception = err.to_string();
        match err {
            WorkerError::UnsupportedLanguage { .. } | WorkerError::InterpreterUnavailable { .. } => {
                self.tracer
                    .unsupported_runbook_type(&self.sandbox_id, &self.id, &exception);
            }
            _ => self.tracer.trace_error(format!(
                "Job failed. [sandboxId={}][jobId={}][error={}]",
                self.sandbox_id, self.id, exception
            )),
        }

        let failed = JobStatus::failed(exception);
        if !JobStatus::can_follow(self.status.as_ref(), &failed) {
            tracing::warn!(job_id = %self.id, status = ?self.status, "job already terminal; failure not reported");
            return;
        }
        if let Err(e) = self.transition(failed).await {
            tracing::warn!(job_id = %self.id, error = %e, "failed to report job failure");
        }
    }

    async fn unload(&self) {
        let execution_seconds = (Utc::now() - self.start_time).num_seconds();
        match self
            .reporter
            .unload_job(
                &self.data.subscription_id,
                &self.sandbox_id,
                &self.id,
                self.is_test,
                self.start_time,
                execution_seconds,
            )
            .await
        {
            Ok(()) => self.tracer.job_unloaded(&self.sandbox_id, &self.id),
            Err(e) => tracing::warn!(job_id = %self.id, error = %e, "failed to unload job"),
        }
    }
}
