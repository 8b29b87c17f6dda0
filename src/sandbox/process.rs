//! Sandbox backed by a child OS process running the sandbox executable.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::{Sandbox, SandboxFactory};
use crate::config::{Configuration, CONFIGURATION_ENV_KEY};
use crate::error::{Result, WorkerError};
use crate::runtime::{AsyncCommand, LineHandler, ProcessState, RunningCommand};
use crate::trace::Tracer;

pub struct ProcessSandbox {
    id: String,
    working_directory: PathBuf,
    executable: PathBuf,
    configuration: Configuration,
    tracer: Tracer,
    command: Option<RunningCommand>,
}

impl ProcessSandbox {
    /// The sandbox works in `<configured working directory>/<sandbox_id>`,
    /// anchored to the current directory when relative.
    pub fn new(sandbox_id: &str, configuration: &Configuration, tracer: Tracer) -> Self {
        Self {
            id: sandbox_id.to_string(),
            working_directory: anchored(&configuration.working_directory.join(sandbox_id)),
            executable: configuration.sandbox_executable.clone(),
            configuration: configuration.clone(),
            tracer,
            command: None,
        }
    }

    pub fn working_directory(&self) -> &PathBuf {
        &self.working_directory
    }

    /// Configuration blob handed to the child: sandbox role, rooted at its own directory.
    pub fn sandbox_environment(&self) -> Result<(String, String)> {
        let value = self
            .configuration
            .for_sandbox(&self.working_directory)
            .to_env_value()?;
        Ok((CONFIGURATION_ENV_KEY.to_string(), value))
    }

    fn state(&self) -> Option<Arc<ProcessState>> {
        self.command.as_ref().map(RunningCommand::state)
    }

    fn relay(&self, stderr: bool) -> LineHandler {
        let tracer = self.tracer.clone();
        Arc::new(move |line: String| {
            if stderr {
                tracer.sandbox_stderr(line);
            } else {
                tracer.sandbox_stdout(line);
            }
        })
    }
}

/// The child starts inside its own directory, so a relative path would be
/// resolved a second time from there.
fn anchored(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|dir| dir.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_base_directory(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.working_directory)
            .await
            .map_err(|e| WorkerError::io("create sandbox directory", &self.working_directory, e))
    }

    async fn start(&mut self) -> Result<()> {
        let (key, value) = self.sandbox_environment()?;
        let command = AsyncCommand::new(self.executable.to_string_lossy().into_owned())
            .arg(self.id.clone())
            .current_dir(&self.working_directory)
            .env(key, value)
            .on_stdout(self.relay(false))
            .on_stderr(self.relay(true))
            .spawn()?;

        tracing::info!(
            sandbox_id = %self.id,
            pid = ?command.state().pid(),
            executable = %self.executable.display(),
            "sandbox process started"
        );
        self.command = Some(command);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.state().is_some_and(|state| state.is_running())
    }

    fn is_faulted(&self) -> bool {
        self.state()
            .is_some_and(|state| state.has_exited() && !state.is_successful())
    }

    async fn cleanup(&self) -> Result<()> {
        if self.is_alive() {
            return Err(WorkerError::SandboxRunning {
                id: self.id.clone(),
            });
        }

        if let Some(state) = self.state() {
            self.tracer
                .sandbox_process_exited(&self.id, state.pid(), state.exit_code());
        }

        if self.is_faulted() {
            tracing::warn!(
                sandbox_id = %self.id,
                path = %self.working_directory.display(),
                "sandbox faulted; keeping working directory"
            );
            return Ok(());
        }

        match tokio::fs::remove_dir_all(&self.working_directory).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkerError::io("remove sandbox directory", &self.working_directory, e)),
        }
    }
}

/// Builds [`ProcessSandbox`]es sharing one configuration and tracer.
pub struct ProcessSandboxFactory {
    configuration: Configuration,
    tracer: Tracer,
}

impl ProcessSandboxFactory {
    pub fn new(configuration: Configuration, tracer: Tracer) -> Self {
        Self {
            configuration,
            tracer,
        }
    }
}

impl SandboxFactory for ProcessSandboxFactory {
    fn new_sandbox(&self, sandbox_id: &str) -> Box<dyn Sandbox> {
        Box::new(ProcessSandbox::new(
            sandbox_id,
            &self.configuration,
            self.tracer.clone(),
        ))
    }
}
