//! Local structured logging and cloud trace forwarding.
//!
//! Every named event is written to the local `tracing` subscriber and, when a
//! [`LogSink`] is attached, forwarded to the dispatch service in the background.
//! A failed forward only produces a local warning.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::{Component, Configuration};
use crate::service::LogSink;

const CLOUD_TRACE_EVENT_ID: i32 = 16000;
const CLOUD_DEBUG_LOG_TYPE: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Error,
    Debug,
    Startup,
    Routine,
    Informational,
    Job,
}

impl Keyword {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::Debug => "Debug",
            Self::Startup => "Startup",
            Self::Routine => "Routine",
            Self::Informational => "Informational",
            Self::Job => "Job",
        }
    }
}

/// Install the process-wide subscriber. `RUST_LOG` overrides the default level.
pub fn init_subscriber(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {}", e);
    }
}

/// Random identifier shaped like a UUID (8-4-4-4-12 hex groups).
///
/// Not cryptographically strong; it only correlates traces of one process.
pub fn generate_activity_id() -> String {
    let b: [u8; 16] = rand::random();
    let hex = |bytes: &[u8]| bytes.iter().map(|b| format!("{:02x}", b)).collect::<String>();
    format!(
        "{}-{}-{}-{}-{}",
        hex(&b[0..4]),
        hex(&b[4..6]),
        hex(&b[6..8]),
        hex(&b[8..10]),
        hex(&b[10..16])
    )
}

struct TraceContext {
    component: Component,
    account_id: String,
    machine_id: String,
    worker_group: String,
    worker_version: String,
    debug_traces: bool,
    activity_id: String,
}

/// Cheaply clonable handle injected into every tier.
#[derive(Clone)]
pub struct Tracer {
    context: Arc<TraceContext>,
    sink: Option<Arc<dyn LogSink>>,
}

impl Tracer {
    pub fn new(config: &Configuration, sink: Option<Arc<dyn LogSink>>) -> Self {
        Self {
            context: Arc::new(TraceContext {
                component: config.component,
                account_id: config.account_id.clone(),
                machine_id: config.machine_id.clone(),
                worker_group: config.hybrid_worker_group_name.clone(),
                worker_version: config.worker_version.clone(),
                debug_traces: config.debug_traces,
                activity_id: generate_activity_id(),
            }),
            sink,
        }
    }

    /// Tracer that never leaves the process.
    pub fn local(config: &Configuration) -> Self {
        Self::new(config, None)
    }

    pub fn activity_id(&self) -> &str {
        &self.context.activity_id
    }

    /// Positional cloud trace arguments. The order matches the service schema.
    pub fn cloud_fields(
        &self,
        event_id: u32,
        task_name: &str,
        keyword: Keyword,
        message: &str,
    ) -> Vec<String> {
        self.fields_for(self.context.component, event_id, task_name, keyword, message)
    }

    fn fields_for(
        &self,
        component: Component,
        event_id: u32,
        task_name: &str,
        keyword: Keyword,
        message: &str,
    ) -> Vec<String> {
        let ctx = &self.context;
        vec![
            ctx.account_id.clone(),
            String::new(),
            ctx.worker_group.clone(),
            ctx.machine_id.clone(),
            component.to_string(),
            event_id.to_string(),
            task_name.to_string(),
            keyword.as_str().to_string(),
            // std exposes no numeric thread id; the schema still requires the column
            "1".to_string(),
            std::process::id().to_string(),
            ctx.activity_id.clone(),
            ctx.worker_version.clone(),
            message.to_string(),
        ]
    }

    fn emit(&self, event_id: u32, task_name: &'static str, keyword: Keyword, message: String, debug: bool) {
        self.emit_as(self.context.component, event_id, task_name, keyword, message, debug);
    }

    fn emit_as(
        &self,
        component: Component,
        event_id: u32,
        task_name: &'static str,
        keyword: Keyword,
        message: String,
        debug: bool,
    ) {
        match keyword {
            Keyword::Error => tracing::warn!(event_id, task = task_name, "{}", message),
            _ if debug => tracing::debug!(event_id, task = task_name, "{}", message),
            _ => tracing::info!(event_id, task = task_name, "{}", message),
        }

        if debug && !self.context.debug_traces {
            return;
        }
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let args = self.fields_for(component, event_id, task_name, keyword, &message);
        let activity_id = self.context.activity_id.clone();
        handle.spawn(async move {
            if let Err(e) = sink
                .set_log(CLOUD_TRACE_EVENT_ID, &activity_id, CLOUD_DEBUG_LOG_TYPE, &args)
                .await
            {
                tracing::warn!(error = %e, "error emitting trace to dispatch service");
            }
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.emit(20001, "DebugTrace", Keyword::Debug, message.into(), true);
    }

    pub fn error(&self, message: impl std::fmt::Display) {
        self.emit(20001, "ErrorTrace", Keyword::Debug, format!("Error : {}", message), true);
    }

    pub fn trace_error(&self, message: impl std::fmt::Display) {
        self.emit(20000, "TraceError", Keyword::Error, message.to_string(), false);
    }

    pub fn worker_starting(&self) {
        self.emit(20020, "WorkerStarting", Keyword::Startup, "Worker starting.".to_string(), false);
    }

    pub fn sandbox_actions_found(&self, count: usize) {
        let message = format!("Get sandbox actions found {} new action(s).", count);
        self.emit(20100, "WorkerSandboxActionsFound", Keyword::Routine, message, false);
    }

    pub fn error_getting_sandbox_actions(&self, err: impl std::fmt::Display) {
        let message = format!("Error getting sandbox actions. [error={}]", err);
        self.emit(20101, "WorkerErrorGettingSandboxActions", Keyword::Routine, message, false);
    }

    pub fn failed_to_create_sandbox(&self, err: impl std::fmt::Display) {
        let message = format!("Error creating sandbox. [error={}]", err);
        self.emit(20102, "WorkerFailedToCreateSandbox", Keyword::Routine, message, false);
    }

    pub fn sandbox_process_exited(&self, sandbox_id: &str, pid: Option<u32>, exit_code: Option<i32>) {
        let message = format!(
            "Sandbox process exited. [sandboxId={}][pId={}][exitCode={}]",
            sandbox_id,
            pid.unwrap_or_default(),
            exit_code.unwrap_or(-1)
        );
        self.emit(20102, "WorkerSandboxProcessExited", Keyword::Routine, message, false);
    }

    /// Relay one stdout line of a sandbox child, attributed to the sandbox.
    pub fn sandbox_stdout(&self, line: impl Into<String>) {
        self.relay_sandbox_line("SandboxStdout", line.into());
    }

    pub fn sandbox_stderr(&self, line: impl Into<String>) {
        self.relay_sandbox_line("SandboxStderr", line.into());
    }

    fn relay_sandbox_line(&self, task_name: &'static str, line: String) {
        // the child's own debug records stay local unless debug traces are on
        let debug = line.contains("DEBUG") || line.contains("TRACE");
        self.emit_as(Component::Sandbox, 0, task_name, Keyword::Informational, line, debug);
    }

    pub fn sandbox_starting(&self, sandbox_id: &str) {
        let message = format!("Sandbox starting [sandboxId={}]", sandbox_id);
        self.emit(25000, "SandboxStarting", Keyword::Startup, message, false);
    }

    pub fn job_actions_found(&self, count: usize) {
        let message = format!("Get job actions. Found {} new action(s).", count);
        self.emit(25001, "SandboxGetJobActions", Keyword::Routine, message, false);
    }

    pub fn sandbox_closure_request(&self, sandbox_id: &str) {
        let message = format!("Closure request received. [sandboxId={}]", sandbox_id);
        self.emit(25002, "SandboxClosureRequest", Keyword::Routine, message, false);
    }

    pub fn job_loaded(&self, sandbox_id: &str, job_id: &str) {
        let message = format!("Job loaded. [sandboxId={}][jobId={}]", sandbox_id, job_id);
        self.emit(25010, "SandboxJobLoaded", Keyword::Job, message, false);
    }

    pub fn job_unloaded(&self, sandbox_id: &str, job_id: &str) {
        let message = format!("Job unloaded. [sandboxId={}][jobId={}]", sandbox_id, job_id);
        self.emit(25013, "SandboxJobUnloaded", Keyword::Job, message, false);
    }

    pub fn unsupported_runbook_type(&self, sandbox_id: &str, job_id: &str, exception: &str) {
        let message = format!(
            "Unsupported runbook type. [sandboxId={}][jobId={}][exception={}]",
            sandbox_id, job_id, exception
        );
        self.emit(25014, "SandboxJobUnsupportedRunbookType", Keyword::Job, message, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::memory::{MemoryService, ServiceCall};
    use std::time::Duration;

    fn config() -> Configuration {
        Configuration {
            account_id: "acc".to_string(),
            machine_id: "machine".to_string(),
            hybrid_worker_group_name: "group".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_activity_id_shape() {
        let id = generate_activity_id();
        let groups: Vec<usize> = id.split('-').map(str::len).collect();
        assert_eq!(groups, vec![8, 4, 4, 4, 12]);
        assert!(id.chars().all(|c| c == '-' || c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_cloud_fields_order() {
        let tracer = Tracer::local(&config());
        let fields = tracer.cloud_fields(25010, "SandboxJobLoaded", Keyword::Job, "Job loaded.");

        assert_eq!(fields.len(), 13);
        assert_eq!(fields[0], "acc");
        assert_eq!(fields[1], "");
        assert_eq!(fields[2], "group");
        assert_eq!(fields[3], "machine");
        assert_eq!(fields[4], "worker");
        assert_eq!(fields[5], "25010");
        assert_eq!(fields[6], "SandboxJobLoaded");
        assert_eq!(fields[7], "Job");
        assert_eq!(fields[9], std::process::id().to_string());
        assert_eq!(fields[10], tracer.activity_id());
        assert_eq!(fields[11], "2.0.0");
        assert_eq!(fields[12], "Job loaded.");
    }

    #[tokio::test]
    async fn test_events_forwarded_but_debug_filtered() {
        let service = Arc::new(MemoryService::new());
        let tracer = Tracer::new(&config(), Some(service.clone() as Arc<dyn LogSink>));

        tracer.worker_starting();
        tracer.debug("not forwarded without debug_traces");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let logs: Vec<_> = service
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                ServiceCall::SetLog { event_id, args } => Some((event_id, args)),
                _ => None,
            })
            .collect();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].0, 16000);
        assert_eq!(logs[0].1[12], "Worker starting.");
    }

    #[tokio::test]
    async fn test_sandbox_output_relayed_as_sandbox_component() {
        let service = Arc::new(MemoryService::new());
        let tracer = Tracer::new(&config(), Some(service.clone() as Arc<dyn LogSink>));

        tracer.sandbox_stdout("INFO sandbox starting");
        tracer.sandbox_stderr("DEBUG polling");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let logs: Vec<Vec<String>> = service
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                ServiceCall::SetLog { args, .. } => Some(args),
                _ => None,
            })
            .collect();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0][4], "sandbox");
        assert_eq!(logs[0][5], "0");
        assert_eq!(logs[0][6], "SandboxStdout");
        assert_eq!(logs[0][7], "Informational");
        assert_eq!(logs[0][12], "INFO sandbox starting");
    }
}
