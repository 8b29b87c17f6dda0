//! Runbook execution runtime.
//!
//! A [`Runtime`] persists a runbook under the job's working directory and runs
//! it through the interpreter registered for its [`DefinitionKind`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, WorkerError};

pub mod language;
pub mod process;
pub mod runbook;

pub use language::{DefinitionKind, Interpreter, Language};
pub use process::{AsyncCommand, LineHandler, ProcessState, RunningCommand};
pub use runbook::Runbook;

pub struct Runtime {
    language: Language,
    runbook: Runbook,
    working_directory: PathBuf,
    command: Option<RunningCommand>,
    error_output: Arc<Mutex<String>>,
}

impl Runtime {
    pub fn new(language: Language, runbook: Runbook, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            language,
            runbook,
            working_directory: working_directory.into(),
            command: None,
            error_output: Arc::new(Mutex::new(String::new())),
        }
    }

    pub fn runbook_path(&self) -> PathBuf {
        self.working_directory.join(&self.runbook.file_name)
    }

    /// Write the runbook definition to its path, creating the directory first.
    pub async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.working_directory)
            .await
            .map_err(|e| WorkerError::io("create job directory", &self.working_directory, e))?;

        let path = self.runbook_path();
        write_runbook(&path, &self.runbook.definition)
            .await
            .map_err(|e| WorkerError::io("write runbook", &path, e))
    }

    /// Whether the interpreter binary can be launched on this host.
    pub async fn is_supported(&self) -> bool {
        process::probe(&self.language.interpreter.command).await
    }

    /// Launch `<interpreter> <args...> <runbookPath>` without waiting.
    ///
    /// Each stdout line goes to `on_output` in arrival order; stderr lines are
    /// kept and available through [`Runtime::error_output`]. The interpreter
    /// leads its own process group so a stop also ends what the runbook spawned.
    pub fn start_runbook(&mut self, on_output: LineHandler) -> Result<()> {
        let interpreter = &self.language.interpreter;
        let errors = Arc::clone(&self.error_output);
        let on_error: LineHandler = Arc::new(move |line: String| {
            let mut errors = errors.lock();
            errors.push_str(&line);
            errors.push('\n');
        });

        let command = AsyncCommand::new(interpreter.command.clone())
            .args(interpreter.arguments.iter().cloned())
            .arg(self.runbook_path().to_string_lossy().into_owned())
            .current_dir(&self.working_directory)
            .isolated()
            .on_stdout(on_output)
            .on_stderr(on_error)
            .spawn()?;

        tracing::debug!(
            runbook = %self.runbook.name,
            interpreter = %interpreter.command,
            pid = ?command.state().pid(),
            "runbook started"
        );
        self.command = Some(command);
        Ok(())
    }

    pub fn is_runbook_running(&self) -> bool {
        self.command.as_ref().is_some_and(RunningCommand::is_running)
    }

    /// Force-terminate the interpreter and its process group. No-op if it was
    /// never started.
    pub fn stop_runbook(&mut self) {
        if let Some(command) = self.command.as_mut() {
            command.kill();
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.command.as_ref().and_then(|c| c.state().exit_code())
    }

    pub fn is_runbook_execution_successful(&self) -> bool {
        self.command
            .as_ref()
            .is_some_and(|c| c.state().is_successful())
    }

    pub fn error_output(&self) -> String {
        self.error_output.lock().clone()
    }
}

async fn write_runbook(path: &Path, definition: &str) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o640);

    let mut file = options.open(path).await?;
    file.write_all(definition.as_bytes()).await?;
    file.flush().await
}
