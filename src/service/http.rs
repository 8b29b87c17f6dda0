//! HTTP implementation of the dispatch-service traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONNECTION, USER_AGENT};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use super::types::{
    JobActions, JobStatusUpdate, LogRecord, MessageMetadatas, SandboxActions, StreamRecord,
    UnloadRequest, DATETIME_FORMAT,
};
use super::{
    JobAction, JobActionSource, JobData, JobReporter, JobUpdatableData, LogSink,
    MessageMetadata, RunbookData, SandboxAction, SandboxActionSource, ServiceResult,
};
use crate::config::Configuration;
use crate::error::{calculate_backoff, is_retryable, Result, RetryConfig, ServiceError, WorkerError};

const PROTOCOL_VERSION: &str = "1.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpServiceClient {
    client: Client,
    base_uri: String,
    account_id: String,
    worker_group: String,
    retry: RetryConfig,
}

impl HttpServiceClient {
    /// Build a client from configuration, attaching the client certificate when one is set.
    pub fn new(config: &Configuration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        let agent = format!("HybridWorker/{}", config.worker_version);
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&agent).map_err(|e| WorkerError::Config {
                reason: format!("invalid worker version: {}", e),
            })?,
        );

        let mut builder = Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT);

        if !config.certificate_path.is_empty() && !config.key_path.is_empty() {
            let mut pem = std::fs::read(&config.certificate_path)
                .map_err(|e| WorkerError::io("read certificate", &config.certificate_path, e))?;
            let key = std::fs::read(&config.key_path)
                .map_err(|e| WorkerError::io("read certificate key", &config.key_path, e))?;
            pem.push(b'\n');
            pem.extend_from_slice(&key);
            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| WorkerError::Config {
                reason: format!("invalid client certificate: {}", e),
            })?;
            builder = builder.identity(identity);
        }

        let client = builder.build().map_err(|e| WorkerError::Config {
            reason: format!("unable to build http client: {}", e),
        })?;

        Ok(Self {
            client,
            base_uri: config.base_uri.trim_end_matches('/').to_string(),
            account_id: config.account_id.clone(),
            worker_group: config.hybrid_worker_group_name.clone(),
            retry: RetryConfig::default(),
        })
    }

    fn account_url(&self, path: &str) -> String {
        self.account_url_with_query(path, &[])
    }

    /// Query values are form-encoded; `api-version` always comes last.
    fn account_url_with_query(&self, path: &str, query: &[(&str, &str)]) -> String {
        let base = format!("{}/automationAccounts/{}/{}", self.base_uri, self.account_id, path);
        match Url::parse(&base) {
            Ok(mut url) => {
                url.query_pairs_mut()
                    .extend_pairs(query)
                    .append_pair("api-version", PROTOCOL_VERSION);
                url.into()
            }
            // an unusable base uri fails at request time with the url in the error
            Err(_) => format!("{}?api-version={}", base, PROTOCOL_VERSION),
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> ServiceResult<T> {
        let body = self.send_with_retry(url, None::<&()>).await?;
        serde_json::from_slice(&body).map_err(|e| ServiceError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    async fn post<P: Serialize + Sync>(&self, url: &str, payload: &P) -> ServiceResult<()> {
        self.send_with_retry(url, Some(payload)).await.map(|_| ())
    }

    async fn send_with_retry<P: Serialize + Sync>(
        &self,
        url: &str,
        payload: Option<&P>,
    ) -> ServiceResult<Vec<u8>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(url, payload, attempt).await {
                Ok(body) => return Ok(body),
                Err(err) if attempt < self.retry.max_attempts && is_retryable(&err) => {
                    let backoff = calculate_backoff(attempt - 1, &self.retry);
                    tracing::debug!(url, attempt, backoff_ms = backoff, error = %err, "retrying request");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once<P: Serialize + Sync>(
        &self,
        url: &str,
        payload: Option<&P>,
        attempt: u32,
    ) -> ServiceResult<Vec<u8>> {
        let request = match payload {
            Some(payload) => self.client.post(url).json(payload),
            None => self.client.get(url),
        };

        let response = request.send().await.map_err(|e| ServiceError::Request {
            url: url.to_string(),
            reason: e.to_string(),
            attempt,
        })?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => {
                return Err(ServiceError::Authorization {
                    url: url.to_string(),
                    status: StatusCode::UNAUTHORIZED.as_u16(),
                })
            }
            status => {
                return Err(ServiceError::InvalidStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                })
            }
        }

        let body = response.bytes().await.map_err(|e| ServiceError::Request {
            url: url.to_string(),
            reason: e.to_string(),
            attempt,
        })?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl SandboxActionSource for HttpServiceClient {
    async fn get_sandbox_actions(&self) -> ServiceResult<Vec<SandboxAction>> {
        let url = self.account_url_with_query(
            "Sandboxes/GetSandboxActions",
            &[("HybridWorkerGroupName", self.worker_group.as_str())],
        );
        let actions: SandboxActions = self.get(&url).await?;
        Ok(actions.value)
    }
}

#[async_trait]
impl JobActionSource for HttpServiceClient {
    async fn get_job_actions(&self, sandbox_id: &str) -> ServiceResult<Vec<JobAction>> {
        let url = self.account_url(&format!("Sandboxes/{}/jobs/getJobActions", sandbox_id));
        let actions: JobActions = self.get(&url).await?;
        Ok(actions.value)
    }

    async fn acknowledge_job_actions(
        &self,
        sandbox_id: &str,
        metadata: Vec<MessageMetadata>,
    ) -> ServiceResult<()> {
        let url = self.account_url(&format!(
            "Sandboxes/{}/jobs/AcknowledgeJobActions",
            sandbox_id
        ));
        let payload = MessageMetadatas {
            message_metadatas: metadata,
        };
        self.post(&url, &payload).await
    }

    async fn get_job_data(&self, job_id: &str) -> ServiceResult<JobData> {
        let url = self.account_url(&format!("jobs/{}", job_id));
        self.get(&url).await
    }
}

#[async_trait]
impl JobReporter for HttpServiceClient {
    async fn get_updatable_job_data(&self, job_id: &str) -> ServiceResult<JobUpdatableData> {
        let url = self.account_url(&format!("jobs/{}", job_id));
        self.get(&url).await
    }

    async fn get_runbook_data(&self, runbook_version_id: &str) -> ServiceResult<RunbookData> {
        let url = self.account_url(&format!("runbooks/{}", runbook_version_id));
        self.get(&url).await
    }

    async fn set_job_status(
        &self,
        sandbox_id: &str,
        job_id: &str,
        status: i32,
        is_terminal: bool,
        exception: Option<&str>,
    ) -> ServiceResult<()> {
        let url = self.account_url(&format!(
            "Sandboxes/{}/jobs/{}/ChangeStatus",
            sandbox_id, job_id
        ));
        let payload = JobStatusUpdate {
            exception,
            is_final_status: is_terminal,
            job_status: status,
        };
        self.post(&url, &payload).await
    }

    async fn set_job_stream(
        &self,
        job_id: &str,
        runbook_version_id: &str,
        text: &str,
        stream_type: &str,
        sequence: u64,
    ) -> ServiceResult<()> {
        let url = self.account_url(&format!("jobs/{}/postJobStream", job_id));
        let payload = StreamRecord {
            account_id: &self.account_id,
            job_id,
            record_time: Utc::now().format(DATETIME_FORMAT).to_string(),
            runbook_version_id,
            sequence_number: sequence,
            stream_record: None,
            stream_record_text: text,
            stream_type,
        };
        self.post(&url, &payload).await
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
        let url = self.account_url(&format!("Sandboxes/{}/jobs/{}/unload", sandbox_id, job_id));
        let payload = UnloadRequest {
            is_test,
            job_id,
            start_time: start_time.format(DATETIME_FORMAT).to_string(),
            subscription_id,
            execution_time_in_seconds: execution_seconds,
        };
        self.post(&url, &payload).await
    }
}

#[async_trait]
impl LogSink for HttpServiceClient {
    async fn set_log(
        &self,
        event_id: i32,
        activity_id: &str,
        log_type: i32,
        args: &[String],
    ) -> ServiceResult<()> {
        let url = self.account_url("logs");
        let payload = LogRecord {
            activity_id,
            args,
            event_id,
            log_type,
        };
        self.post(&url, &payload).await
    }
}
