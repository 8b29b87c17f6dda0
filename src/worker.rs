//! Top-level poll loop of the worker process.
//!
//! Each tick asks the dispatch service which sandboxes need a process and
//! starts at most one sandbox per id. A watch task per sandbox waits for the
//! process to exit and cleans it up; the id is released on the next tick so a
//! later request can start it again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::sandbox::{Sandbox, SandboxFactory};
use crate::service::SandboxActionSource;
use crate::trace::Tracer;

const LIVENESS_INTERVAL: Duration = Duration::from_millis(100);

struct TrackedSandbox {
    exited: Arc<AtomicBool>,
    watch: JoinHandle<()>,
}

pub struct Worker {
    actions: Arc<dyn SandboxActionSource>,
    factory: Box<dyn SandboxFactory>,
    tracer: Tracer,
    poll_interval: Duration,
    sandboxes: HashMap<String, TrackedSandbox>,
}

impl Worker {
    pub fn new(
        actions: Arc<dyn SandboxActionSource>,
        factory: Box<dyn SandboxFactory>,
        tracer: Tracer,
        poll_interval: Duration,
    ) -> Self {
        Self {
            actions,
            factory,
            tracer,
            poll_interval,
            sandboxes: HashMap::new(),
        }
    }

    /// Poll forever.
    pub async fn start(&mut self) {
        self.tracer.worker_starting();
        loop {
            self.routine().await;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One tick. Returns the number of sandboxes started.
    pub async fn routine(&mut self) -> usize {
        self.sweep();

        let actions = match self.actions.get_sandbox_actions().await {
            Ok(actions) => actions,
            Err(err) => {
                self.tracer.error_getting_sandbox_actions(&err);
                return 0;
            }
        };
        if !actions.is_empty() {
            self.tracer.sandbox_actions_found(actions.len());
        }

        let mut started = 0;
        for action in actions {
            if self.sandboxes.contains_key(&action.sandbox_id) {
                tracing::debug!(sandbox_id = %action.sandbox_id, "sandbox already tracked");
                continue;
            }

            let sandbox = self.factory.new_sandbox(&action.sandbox_id);
            let exited = Arc::new(AtomicBool::new(false));
            let watch = tokio::spawn(supervise(
                sandbox,
                self.tracer.clone(),
                Arc::clone(&exited),
            ));
            self.sandboxes
                .insert(action.sandbox_id, TrackedSandbox { exited, watch });
            started += 1;
        }
        started
    }

    fn sweep(&mut self) {
        self.sandboxes.retain(|sandbox_id, tracked| {
            let done = tracked.exited.load(Ordering::SeqCst) || tracked.watch.is_finished();
            if done {
                tracing::debug!(sandbox_id = %sandbox_id, "sandbox released");
            }
            !done
        });
    }

    pub fn is_tracked(&self, sandbox_id: &str) -> bool {
        self.sandboxes.contains_key(sandbox_id)
    }

    pub fn tracked_count(&self) -> usize {
        self.sandboxes.len()
    }
}

async fn supervise(mut sandbox: Box<dyn Sandbox>, tracer: Tracer, exited: Arc<AtomicBool>) {
    let sandbox_id = sandbox.id().to_string();

    let started = match sandbox.create_base_directory().await {
        Ok(()) => sandbox.start().await,
        Err(err) => Err(err),
    };
    if let Err(err) = started {
        tracer.failed_to_create_sandbox(format_args!("[sandboxId={}] {}", sandbox_id, err));
        exited.store(true, Ordering::SeqCst);
        return;
    }

    while sandbox.is_alive() {
        tokio::time::sleep(LIVENESS_INTERVAL).await;
    }

    if let Err(err) = sandbox.cleanup().await {
        tracer.error(format_args!("sandbox cleanup failed. [sandboxId={}][error={}]", sandbox_id, err));
    }
    exited.store(true, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::error::{Result, ServiceError, WorkerError};
    use crate::service::{MemoryService, SandboxAction};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Sandbox whose process "runs" until the test releases it.
    struct FakeSandbox {
        id: String,
        running: Arc<AtomicBool>,
        fail_start: bool,
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        fn id(&self) -> &str {
            &self.id
        }

        async fn create_base_directory(&self) -> Result<()> {
            Ok(())
        }

        async fn start(&mut self) -> Result<()> {
            if self.fail_start {
                return Err(WorkerError::Config {
                    reason: "no executable".to_string(),
                });
            }
            Ok(())
        }

        fn is_alive(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn is_faulted(&self) -> bool {
            false
        }

        async fn cleanup(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        spawned: Mutex<Vec<String>>,
        running: Arc<AtomicBool>,
        fail_start: bool,
    }

    impl SandboxFactory for Arc<FakeFactory> {
        fn new_sandbox(&self, sandbox_id: &str) -> Box<dyn Sandbox> {
            self.spawned.lock().push(sandbox_id.to_string());
            Box::new(FakeSandbox {
                id: sandbox_id.to_string(),
                running: Arc::clone(&self.running),
                fail_start: self.fail_start,
            })
        }
    }

    fn worker(service: &Arc<MemoryService>, factory: &Arc<FakeFactory>) -> Worker {
        Worker::new(
            service.clone(),
            Box::new(Arc::clone(factory)),
            Tracer::local(&Configuration::default()),
            Duration::from_millis(10),
        )
    }

    fn actions(ids: &[&str]) -> Vec<SandboxAction> {
        ids.iter().map(|id| SandboxAction::new(*id)).collect()
    }

    async fn wait_until_released(worker: &mut Worker, sandbox_id: &str) {
        for _ in 0..100 {
            worker.sweep();
            if !worker.is_tracked(sandbox_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("sandbox {} was never released", sandbox_id);
    }

    #[tokio::test]
    async fn test_duplicate_ids_in_one_batch_spawn_once() {
        let service = Arc::new(MemoryService::new());
        let factory = Arc::new(FakeFactory::default());
        factory.running.store(true, Ordering::SeqCst);
        service.push_sandbox_actions(actions(&["S1", "S1", "S1"]));

        let mut worker = worker(&service, &factory);
        assert_eq!(worker.routine().await, 1);
        assert_eq!(*factory.spawned.lock(), vec!["S1".to_string()]);
        assert!(worker.is_tracked("S1"));
    }

    #[tokio::test]
    async fn test_empty_batch_spawns_nothing() {
        let service = Arc::new(MemoryService::new());
        let factory = Arc::new(FakeFactory::default());

        let mut worker = worker(&service, &factory);
        assert_eq!(worker.routine().await, 0);
        assert!(factory.spawned.lock().is_empty());
        assert_eq!(worker.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_distinct_ids_spawn_one_each() {
        let service = Arc::new(MemoryService::new());
        let factory = Arc::new(FakeFactory::default());
        factory.running.store(true, Ordering::SeqCst);
        service.push_sandbox_actions(actions(&["S1", "S2"]));

        let mut worker = worker(&service, &factory);
        assert_eq!(worker.routine().await, 2);
        assert!(worker.is_tracked("S1"));
        assert!(worker.is_tracked("S2"));
        assert_eq!(factory.spawned.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_tracked_id_is_not_respawned_across_ticks() {
        let service = Arc::new(MemoryService::new());
        let factory = Arc::new(FakeFactory::default());
        factory.running.store(true, Ordering::SeqCst);
        service.push_sandbox_actions(actions(&["S1"]));
        service.push_sandbox_actions(actions(&["S1"]));

        let mut worker = worker(&service, &factory);
        assert_eq!(worker.routine().await, 1);
        assert_eq!(worker.routine().await, 0);
        assert_eq!(factory.spawned.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_exited_sandbox_can_start_again() {
        let service = Arc::new(MemoryService::new());
        let factory = Arc::new(FakeFactory::default());
        factory.running.store(true, Ordering::SeqCst);
        service.push_sandbox_actions(actions(&["S1"]));

        let mut worker = worker(&service, &factory);
        assert_eq!(worker.routine().await, 1);

        factory.running.store(false, Ordering::SeqCst);
        wait_until_released(&mut worker, "S1").await;

        service.push_sandbox_actions(actions(&["S1"]));
        assert_eq!(worker.routine().await, 1);
        assert_eq!(factory.spawned.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_start_releases_id() {
        let service = Arc::new(MemoryService::new());
        let factory = Arc::new(FakeFactory {
            fail_start: true,
            ..Default::default()
        });
        service.push_sandbox_actions(actions(&["S1"]));

        let mut worker = worker(&service, &factory);
        assert_eq!(worker.routine().await, 1);
        wait_until_released(&mut worker, "S1").await;
    }

    #[tokio::test]
    async fn test_fetch_error_skips_tick() {
        let service = Arc::new(MemoryService::new());
        let factory = Arc::new(FakeFactory::default());
        service.push_sandbox_actions_error(ServiceError::Request {
            url: "u".to_string(),
            reason: "connection refused".to_string(),
            attempt: 3,
        });
        service.push_sandbox_actions(actions(&["S1"]));

        let mut worker = worker(&service, &factory);
        assert_eq!(worker.routine().await, 0);
        factory.running.store(true, Ordering::SeqCst);
        assert_eq!(worker.routine().await, 1);
    }
}
