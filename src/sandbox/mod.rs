use async_trait::async_trait;

use crate::error::Result;

/// Worker-side handle on one sandbox process.
///
/// The worker drives each sandbox through
/// `create_base_directory → start → (is_alive)* → cleanup` from a dedicated
/// watch task.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    /// Create the sandbox working directory, parents included. Idempotent.
    async fn create_base_directory(&self) -> Result<()>;

    /// Launch the sandbox process without waiting for it.
    async fn start(&mut self) -> Result<()>;

    fn is_alive(&self) -> bool;

    /// The last run exited abnormally; its artifacts are kept for diagnosis.
    fn is_faulted(&self) -> bool;

    /// Remove the working directory. Fails while the process is alive.
    async fn cleanup(&self) -> Result<()>;
}

pub trait SandboxFactory: Send + Sync {
    fn new_sandbox(&self, sandbox_id: &str) -> Box<dyn Sandbox>;
}

pub mod process;

pub use process::{ProcessSandbox, ProcessSandboxFactory};
