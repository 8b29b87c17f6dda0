//! Dispatch-service collaborator.
//!
//! Each tier of the agent sees only the operations it needs:
//!
//! ```text
//! Worker      -> SandboxActionSource
//! Dispatcher  -> JobActionSource (+ hands JobReporter to its jobs)
//! Job         -> JobReporter
//! Tracer      -> LogSink
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ServiceError;

pub mod http;
pub mod memory;
pub mod types;

pub use http::HttpServiceClient;
pub use memory::MemoryService;
pub use types::{
    JobAction, JobData, JobUpdatableData, MessageMetadata, RunbookData, SandboxAction,
};

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[async_trait]
pub trait SandboxActionSource: Send + Sync {
    async fn get_sandbox_actions(&self) -> ServiceResult<Vec<SandboxAction>>;
}

#[async_trait]
pub trait JobActionSource: Send + Sync {
    async fn get_job_actions(&self, sandbox_id: &str) -> ServiceResult<Vec<JobAction>>;
    async fn acknowledge_job_actions(
        &self,
        sandbox_id: &str,
        metadata: Vec<MessageMetadata>,
    ) -> ServiceResult<()>;
    async fn get_job_data(&self, job_id: &str) -> ServiceResult<JobData>;
}

#[async_trait]
pub trait JobReporter: Send + Sync {
    async fn get_updatable_job_data(&self, job_id: &str) -> ServiceResult<JobUpdatableData>;
    async fn get_runbook_data(&self, runbook_version_id: &str) -> ServiceResult<RunbookData>;
    async fn set_job_status(
        &self,
        sandbox_id: &str,
        job_id: &str,
        status: i32,
        is_terminal: bool,
        exception: Option<&str>,
    ) -> ServiceResult<()>;
    async fn set_job_stream(
        &self,
        job_id: &str,
        runbook_version_id: &str,
        text: &str,
        stream_type: &str,
        sequence: u64,
    ) -> ServiceResult<()>;
    #[allow(clippy::too_many_arguments)]
    async fn unload_job(
        &self,
        subscription_id: &str,
        sandbox_id: &str,
        job_id: &str,
        is_test: bool,
        start_time: DateTime<Utc>,
        execution_seconds: i64,
    ) -> ServiceResult<()>;
}

#[async_trait]
pub trait LogSink: Send + Sync {
    /// `args` is positional; its order is part of the service contract.
    async fn set_log(
        &self,
        event_id: i32,
        activity_id: &str,
        log_type: i32,
        args: &[String],
    ) -> ServiceResult<()>;
}
