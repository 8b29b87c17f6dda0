//! Request and response bodies exchanged with the dispatch service.

use serde::{Deserialize, Serialize};

/// Date-time layout expected by the service.
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxActions {
    #[serde(default)]
    pub value: Vec<SandboxAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxAction {
    #[serde(rename = "sandboxId")]
    pub sandbox_id: String,
}

impl SandboxAction {
    pub fn new(sandbox_id: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobActions {
    #[serde(default)]
    pub value: Vec<JobAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobAction {
    pub job_id: String,
    #[serde(default)]
    pub message_metadata: Option<MessageMetadata>,
    #[serde(default)]
    pub message_source: Option<String>,
    #[serde(default)]
    pub lock_token: Option<String>,
}

impl JobAction {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            message_metadata: None,
            message_source: None,
            lock_token: None,
        }
    }
}

/// Acknowledgement token attached to a job action.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageMetadata {
    #[serde(default)]
    pub pop_receipt: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct MessageMetadatas {
    pub message_metadatas: Vec<MessageMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobData {
    pub job_id: String,
    pub runbook_version_id: String,
    pub subscription_id: String,
    pub pending_action: Option<i32>,
    pub job_status: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobUpdatableData {
    pub job_id: Option<String>,
    pub job_status: Option<i32>,
    pub job_status_details: Option<i32>,
    pub pending_action: Option<i32>,
    pub pending_action_data: Option<String>,
    pub subscription_id: Option<String>,
    pub account_name: Option<String>,
    pub resource_group_name: Option<String>,
    pub tier_name: Option<String>,
    pub job_started_by: Option<String>,
    #[serde(rename = "jobRunDestination")]
    pub job_destination: Option<String>,
    pub trigger_source: Option<i32>,
    pub is_draft: Option<bool>,
    pub log_debug: Option<bool>,
    pub log_verbose: Option<bool>,
    pub log_progress: Option<bool>,
    pub log_activity_trace: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunbookData {
    pub name: String,
    pub account_id: Option<String>,
    pub runbook_id: Option<String>,
    pub definition: String,
    pub runbook_definition_kind: i32,
    pub parameters: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JobStatusUpdate<'a> {
    pub exception: Option<&'a str>,
    pub is_final_status: bool,
    pub job_status: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct StreamRecord<'a> {
    pub account_id: &'a str,
    pub job_id: &'a str,
    pub record_time: String,
    pub runbook_version_id: &'a str,
    pub sequence_number: u64,
    pub stream_record: Option<String>,
    pub stream_record_text: &'a str,
    #[serde(rename = "Type")]
    pub stream_type: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct LogRecord<'a> {
    #[serde(rename = "activityId")]
    pub activity_id: &'a str,
    pub args: &'a [String],
    #[serde(rename = "eventId")]
    pub event_id: i32,
    #[serde(rename = "logtype")]
    pub log_type: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UnloadRequest<'a> {
    pub is_test: bool,
    pub job_id: &'a str,
    pub start_time: String,
    pub subscription_id: &'a str,
    pub execution_time_in_seconds: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_actions_decode_pascal_case() {
        let body = r#"{"value":[{"JobId":"j1","MessageMetadata":{"PopReceipt":"p","MessageId":"m"}}]}"#;
        let actions: JobActions = serde_json::from_str(body).unwrap();
        assert_eq!(actions.value.len(), 1);
        assert_eq!(actions.value[0].job_id, "j1");
        let metadata = actions.value[0].message_metadata.as_ref().unwrap();
        assert_eq!(metadata.message_id.as_deref(), Some("m"));
    }

    #[test]
    fn test_job_data_with_missing_pending_action() {
        let body = r#"{"jobId":"j1","runbookVersionId":"rv","subscriptionId":"sub","jobStatus":1}"#;
        let data: JobData = serde_json::from_str(body).unwrap();
        assert_eq!(data.pending_action, None);
        assert_eq!(data.job_status, Some(1));
    }

    #[test]
    fn test_stream_record_uses_type_key() {
        let record = StreamRecord {
            account_id: "a",
            job_id: "j",
            record_time: "t".to_string(),
            runbook_version_id: "rv",
            sequence_number: 4,
            stream_record: None,
            stream_record_text: "hello",
            stream_type: "Output",
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["Type"], "Output");
        assert_eq!(json["SequenceNumber"], 4);
        assert_eq!(json["StreamRecordText"], "hello");
    }
}
