//! In-process dispatch service.
//!
//! Responses are scripted up front and every call is appended to an ordered
//! log, which makes it the collaborator of choice for tests and dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::{
    JobAction, JobActionSource, JobData, JobReporter, JobUpdatableData, LogSink,
    MessageMetadata, RunbookData, SandboxAction, SandboxActionSource, ServiceResult,
};
use crate::error::ServiceError;

/// One recorded call against the service.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceCall {
    GetSandboxActions,
    GetJobActions {
        sandbox_id: String,
    },
    AcknowledgeJobActions {
        sandbox_id: String,
        count: usize,
    },
    GetJobData {
        job_id: String,
    },
    GetUpdatableJobData {
        job_id: String,
    },
    GetRunbookData {
        runbook_version_id: String,
    },
    SetJobStatus {
        sandbox_id: String,
        job_id: String,
        status: i32,
        is_terminal: bool,
        exception: Option<String>,
    },
    SetJobStream {
        job_id: String,
        runbook_version_id: String,
        text: String,
        stream_type: String,
        sequence: u64,
    },
    UnloadJob {
        subscription_id: String,
        sandbox_id: String,
        job_id: String,
        is_test: bool,
        start_time: DateTime<Utc>,
        execution_seconds: i64,
    },
    SetLog {
        event_id: i32,
        args: Vec<String>,
    },
}

#[derive(Default)]
struct State {
    sandbox_actions: VecDeque<ServiceResult<Vec<SandboxAction>>>,
    job_actions: HashMap<String, VecDeque<ServiceResult<Vec<JobAction>>>>,
    job_data: HashMap<String, JobData>,
    updatable: HashMap<String, JobUpdatableData>,
    runbooks: HashMap<String, RunbookData>,
    status_failures: HashMap<i32, ServiceError>,
    stream_failure: Option<ServiceError>,
    status_observer: Option<StatusObserver>,
    calls: Vec<ServiceCall>,
}

type StatusObserver = Arc<dyn Fn(&str, i32) + Send + Sync>;

#[derive(Default)]
pub struct MemoryService {
    state: Mutex<State>,
}

fn not_found(what: &str) -> ServiceError {
    ServiceError::InvalidStatus {
        url: format!("memory://{}", what),
        status: 404,
    }
}

impl MemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the response of the next `get_sandbox_actions` call.
    pub fn push_sandbox_actions(&self, actions: Vec<SandboxAction>) {
        self.state.lock().sandbox_actions.push_back(Ok(actions));
    }

    pub fn push_sandbox_actions_error(&self, err: ServiceError) {
        self.state.lock().sandbox_actions.push_back(Err(err));
    }

    /// Queue the response of the next `get_job_actions` call for `sandbox_id`.
    pub fn push_job_actions(&self, sandbox_id: &str, actions: Vec<JobAction>) {
        self.state
            .lock()
            .job_actions
            .entry(sandbox_id.to_string())
            .or_default()
            .push_back(Ok(actions));
    }

    pub fn push_job_actions_error(&self, sandbox_id: &str, err: ServiceError) {
        self.state
            .lock()
            .job_actions
            .entry(sandbox_id.to_string())
            .or_default()
            .push_back(Err(err));
    }

    pub fn insert_job(&self, data: JobData) {
        self.state.lock().job_data.insert(data.job_id.clone(), data);
    }

    pub fn insert_updatable_data(&self, job_id: &str, data: JobUpdatableData) {
        self.state.lock().updatable.insert(job_id.to_string(), data);
    }

    pub fn insert_runbook(&self, runbook_version_id: &str, data: RunbookData) {
        self.state
            .lock()
            .runbooks
            .insert(runbook_version_id.to_string(), data);
    }

    /// Make every `set_job_status` call reporting `status` fail with `err`.
    pub fn fail_status(&self, status: i32, err: ServiceError) {
        self.state.lock().status_failures.insert(status, err);
    }

    pub fn fail_streams(&self, err: ServiceError) {
        self.state.lock().stream_failure = Some(err);
    }

    /// Call `observer` with `(job_id, status)` on every status report, before
    /// the report is recorded or answered.
    pub fn observe_statuses(&self, observer: impl Fn(&str, i32) + Send + Sync + 'static) {
        self.state.lock().status_observer = Some(Arc::new(observer));
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.state.lock().calls.clone()
    }

    /// Status codes successfully reported for `job_id`, in order.
    pub fn statuses(&self, job_id: &str) -> Vec<i32> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ServiceCall::SetJobStatus {
                    job_id: id, status, ..
                } if id == job_id => Some(status),
                _ => None,
            })
            .collect()
    }

    /// `(stream type, sequence, text)` for every stream record of `job_id`.
    pub fn streams(&self, job_id: &str) -> Vec<(String, u64, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ServiceCall::SetJobStream {
                    job_id: id,
                    text,
                    stream_type,
                    sequence,
                    ..
                } if id == job_id => Some((stream_type, sequence, text)),
                _ => None,
            })
            .collect()
    }

    pub fn unload_count(&self, job_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, ServiceCall::UnloadJob { job_id: id, .. } if id == job_id))
            .count()
    }

    fn record(&self, call: ServiceCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl SandboxActionSource for MemoryService {
    async fn get_sandbox_actions(&self) -> ServiceResult<Vec<SandboxAction>> {
        let mut state = self.state.lock();
        state.calls.push(ServiceCall::GetSandboxActions);
        state.sandbox_actions.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[async_trait]
impl JobActionSource for MemoryService {
    async fn get_job_actions(&self, sandbox_id: &str) -> ServiceResult<Vec<JobAction>> {
        let mut state = self.state.lock();
        state.calls.push(ServiceCall::GetJobActions {
            sandbox_id: sandbox_id.to_string(),
        });
        state
            .job_actions
            .get_mut(sandbox_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn acknowledge_job_actions(
        &self,
        sandbox_id: &str,
        metadata: Vec<MessageMetadata>,
    ) -> ServiceResult<()> {
        self.record(ServiceCall::AcknowledgeJobActions {
            sandbox_id: sandbox_id.to_string(),
            count: metadata.len(),
        });
        Ok(())
    }

    async fn get_job_data(&self, job_id: &str) -> ServiceResult<JobData> {
        let mut state = self.state.lock();
        state.calls.push(ServiceCall::GetJobData {
            job_id: job_id.to_string(),
        });
        state
            .job_data
            .get(job_id)
            .cloned()
            .ok_or_else(|| not_found(&format!("jobs/{}", job_id)))
    }
}

#[async_trait]
impl JobReporter for MemoryService {
    async fn get_updatable_job_data(&self, job_id: &str) -> ServiceResult<JobUpdatableData> {
        let mut state = self.state.lock();
        state.calls.push(ServiceCall::GetUpdatableJobData {
            job_id: job_id.to_string(),
        });
        Ok(state.updatable.get(job_id).cloned().unwrap_or_default())
    }

    async fn get_runbook_data(&self, runbook_version_id: &str) -> ServiceResult<RunbookData> {
        let mut state = self.state.lock();
        state.calls.push(ServiceCall::GetRunbookData {
            runbook_version_id: runbook_version_id.to_string(),
        });
        state
            .runbooks
            .get(runbook_version_id)
            .cloned()
            .ok_or_else(|| not_found(&format!("runbooks/{}", runbook_version_id)))
    }

    async fn set_job_status(
        &self,
        sandbox_id: &str,
        job_id: &str,
        status: i32,
        is_terminal: bool,
        exception: Option<&str>,
    ) -> ServiceResult<()> {
        let observer = self.state.lock().status_observer.clone();
        if let Some(observer) = observer {
            observer(job_id, status);
        }

        let mut state = self.state.lock();
        if let Some(err) = state.status_failures.get(&status) {
            return Err(err.clone());
        }
        state.calls.push(ServiceCall::SetJobStatus {
            sandbox_id: sandbox_id.to_string(),
            job_id: job_id.to_string(),
            status,
            is_terminal,
            exception: exception.map(str::to_string),
        });
        Ok(())
    }

    async fn set_job_stream(
        &self,
        job_id: &str,
        runbook_version_id: &str,
        text: &str,
        stream_type: &str,
        sequence: u64,
    ) -> ServiceResult<()> {
        let mut state = self.state.lock();
        if let Some(err) = &state.stream_failure {
            return Err(err.clone());
        }
        state.calls.push(ServiceCall::SetJobStream {
            job_id: job_id.to_string(),
            runbook_version_id: runbook_version_id.to_string(),
            text: text.to_string(),
            stream_type: stream_type.to_string(),
            sequence,
        });
        Ok(())
    }

    async fn unload_job(
        &self,
        subscription_id: &str,
        sandbox_id: &str,
        job_id: &str,
        is_test: bool,
        start_time: DateTime<Utc>,
        execution_seconds: i64,
    ) -> ServiceResult<()> {
        self.record(ServiceCall::UnloadJob {
            subscription_id: subscription_id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            job_id: job_id.to_string(),
            is_test,
            start_time,
            execution_seconds,
        });
        Ok(())
    }
}

#[async_trait]
impl LogSink for MemoryService {
    async fn set_log(
        &self,
        event_id: i32,
        _activity_id: &str,
        _log_type: i32,
        args: &[String],
    ) -> ServiceResult<()> {
        self.record(ServiceCall::SetLog {
            event_id,
            args: args.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_sandbox_actions_then_empty() {
        let service = MemoryService::new();
        service.push_sandbox_actions(vec![SandboxAction::new("s1")]);

        assert_eq!(service.get_sandbox_actions().await.unwrap().len(), 1);
        assert!(service.get_sandbox_actions().await.unwrap().is_empty());
        assert_eq!(service.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_status_is_not_recorded() {
        let service = MemoryService::new();
        service.fail_status(
            2,
            ServiceError::InvalidStatus {
                url: "u".to_string(),
                status: 500,
            },
        );

        service.set_job_status("s", "j", 1, false, None).await.unwrap();
        assert!(service.set_job_status("s", "j", 2, false, None).await.is_err());
        assert_eq!(service.statuses("j"), vec![1]);
    }

    #[tokio::test]
    async fn test_unknown_job_data_is_not_found() {
        let service = MemoryService::new();
        let err = service.get_job_data("missing").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidStatus { status: 404, .. }));
    }
}
