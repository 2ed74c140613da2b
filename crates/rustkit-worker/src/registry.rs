//! Worker id allocation and per-process routing.

use hashbrown::HashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

use crate::instance::{EmbeddedWorker, WorkerCore};
use crate::{
    ConsoleMessage, DevToolsRegistrar, ExceptionDetails, ProcessAllocator, ProcessId,
    ProcessSender, WorkerCommand, WorkerError, WorkerId, WorkerMessage, WorkerThreadId,
};

#[derive(Default)]
struct RegistryState {
    workers: HashMap<WorkerId, Weak<WorkerCore>>,
    process_senders: HashMap<ProcessId, Arc<dyn ProcessSender>>,
    worker_process_map: HashMap<ProcessId, BTreeSet<WorkerId>>,
}

/// Creates embedded workers and routes process traffic to them.
pub struct WorkerRegistry {
    allocator: Arc<dyn ProcessAllocator>,
    devtools: Arc<dyn DevToolsRegistrar>,
    next_worker_id: AtomicU64,
    state: Mutex<RegistryState>,
}

impl WorkerRegistry {
    pub fn new(
        allocator: Arc<dyn ProcessAllocator>,
        devtools: Arc<dyn DevToolsRegistrar>,
    ) -> Arc<Self> {
        Arc::new(Self {
            allocator,
            devtools,
            next_worker_id: AtomicU64::new(1),
            state: Mutex::new(RegistryState::default()),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn allocator(&self) -> &Arc<dyn ProcessAllocator> {
        &self.allocator
    }

    pub(crate) fn devtools(&self) -> &Arc<dyn DevToolsRegistrar> {
        &self.devtools
    }

    /// Create a stopped worker with a fresh id.
    pub fn create_worker(self: &Arc<Self>) -> EmbeddedWorker {
        let id = WorkerId(self.next_worker_id.fetch_add(1, Ordering::Relaxed));
        let core = Arc::new(WorkerCore::new(id, self.clone()));
        self.lock_state().workers.insert(id, Arc::downgrade(&core));
        debug!(worker_id = %id, "Created embedded worker");
        EmbeddedWorker::from_core(core)
    }

    pub(crate) fn remove_worker(&self, worker_id: WorkerId) {
        let mut state = self.lock_state();
        state.workers.remove(&worker_id);
        for workers in state.worker_process_map.values_mut() {
            workers.remove(&worker_id);
        }
    }

    pub(crate) fn bind_worker(&self, process_id: ProcessId, worker_id: WorkerId) {
        self.lock_state()
            .worker_process_map
            .entry(process_id)
            .or_default()
            .insert(worker_id);
    }

    pub(crate) fn unbind_worker(&self, process_id: ProcessId, worker_id: WorkerId) {
        let mut state = self.lock_state();
        if let Some(workers) = state.worker_process_map.get_mut(&process_id) {
            workers.remove(&worker_id);
            if workers.is_empty() {
                state.worker_process_map.remove(&process_id);
            }
        }
    }

    /// Register the transport for a newly launched process.
    pub fn add_process_sender(&self, process_id: ProcessId, sender: Arc<dyn ProcessSender>) {
        self.lock_state().process_senders.insert(process_id, sender);
        debug!(%process_id, "Process sender added");
    }

    /// Forget a process that went away.
    ///
    /// Every worker still attributed to it is treated as stopped before the
    /// sender is dropped.
    pub fn remove_process_sender(&self, process_id: ProcessId) {
        let orphans: Vec<Arc<WorkerCore>> = {
            let state = self.lock_state();
            state
                .worker_process_map
                .get(&process_id)
                .into_iter()
                .flatten()
                .filter_map(|worker_id| state.workers.get(worker_id))
                .filter_map(Weak::upgrade)
                .collect()
        };

        if !orphans.is_empty() {
            info!(%process_id, count = orphans.len(), "Process lost, stopping its workers");
        }
        for core in orphans {
            core.on_stopped();
        }

        let mut state = self.lock_state();
        state.worker_process_map.remove(&process_id);
        state.process_senders.remove(&process_id);
    }

    pub fn has_process(&self, process_id: ProcessId) -> bool {
        self.lock_state().process_senders.contains_key(&process_id)
    }

    pub fn worker_count(&self) -> usize {
        self.lock_state().workers.len()
    }

    /// Workers currently bound to `process_id`, in id order.
    pub fn workers_in_process(&self, process_id: ProcessId) -> Vec<WorkerId> {
        self.lock_state()
            .worker_process_map
            .get(&process_id)
            .map(|workers| workers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Forward a stop command for `worker_id` to its process.
    pub fn stop_worker(&self, process_id: ProcessId, worker_id: WorkerId) -> Result<(), WorkerError> {
        self.send(process_id, WorkerCommand::StopWorker { worker_id })
    }

    /// Hand a command to the process's sender.
    pub fn send(&self, process_id: ProcessId, command: WorkerCommand) -> Result<(), WorkerError> {
        let sender = self.lock_state().process_senders.get(&process_id).cloned();
        let Some(sender) = sender else {
            warn!(%process_id, worker_id = %command.worker_id(), "No sender for process");
            return Err(WorkerError::ProcessNotFound(process_id));
        };

        if sender.send(command) {
            Ok(())
        } else {
            Err(WorkerError::IpcFailed(format!(
                "send to process {} failed",
                process_id
            )))
        }
    }

    /// Resolve a notification's target, checking it came from the bound process.
    fn lookup(&self, process_id: ProcessId, worker_id: WorkerId, what: &str) -> Option<Arc<WorkerCore>> {
        let core = self
            .lock_state()
            .workers
            .get(&worker_id)
            .and_then(Weak::upgrade);

        let Some(core) = core else {
            warn!(%process_id, %worker_id, what, "Notification for unknown worker dropped");
            return None;
        };
        if core.process_id() != Some(process_id) {
            warn!(%process_id, %worker_id, what, "Notification from wrong process dropped");
            return None;
        }
        Some(core)
    }

    // Inbound notifications from worker processes.

    pub fn on_worker_started(&self, process_id: ProcessId, worker_id: WorkerId, thread_id: WorkerThreadId) {
        if let Some(core) = self.lookup(process_id, worker_id, "started") {
            core.on_started(thread_id);
        }
    }

    pub fn on_worker_stopped(&self, process_id: ProcessId, worker_id: WorkerId) {
        if let Some(core) = self.lookup(process_id, worker_id, "stopped") {
            core.on_stopped();
        }
    }

    pub fn on_script_loaded(&self, process_id: ProcessId, worker_id: WorkerId) {
        if let Some(core) = self.lookup(process_id, worker_id, "script_loaded") {
            core.on_script_loaded();
        }
    }

    pub fn on_script_load_failed(&self, process_id: ProcessId, worker_id: WorkerId) {
        if let Some(core) = self.lookup(process_id, worker_id, "script_load_failed") {
            core.on_script_load_failed();
        }
    }

    pub fn on_report_exception(
        &self,
        process_id: ProcessId,
        worker_id: WorkerId,
        details: &ExceptionDetails,
    ) {
        if let Some(core) = self.lookup(process_id, worker_id, "exception") {
            core.on_report_exception(details);
        }
    }

    pub fn on_report_console_message(
        &self,
        process_id: ProcessId,
        worker_id: WorkerId,
        message: &ConsoleMessage,
    ) {
        if let Some(core) = self.lookup(process_id, worker_id, "console_message") {
            core.on_report_console_message(message);
        }
    }

    /// Route a message from a worker. Returns true if a listener handled it.
    pub fn on_message_received(
        &self,
        process_id: ProcessId,
        worker_id: WorkerId,
        message: &WorkerMessage,
    ) -> bool {
        self.lookup(process_id, worker_id, "message")
            .map(|core| core.on_message_received(message))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("WorkerRegistry")
            .field("workers", &state.workers.len())
            .field("processes", &state.process_senders.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeAllocator, FakeSender, RecordingListener};
    use crate::{DevToolsManager, StartParams, WorkerStatus};
    use std::sync::atomic::Ordering;
    use url::Url;

    fn params() -> StartParams {
        StartParams {
            version_id: 7,
            scope: Url::parse("https://example.com/app/").unwrap(),
            script_url: Url::parse("https://example.com/app/sw.js").unwrap(),
        }
    }

    #[test]
    fn test_worker_ids_are_unique() {
        let registry = WorkerRegistry::new(
            Arc::new(FakeAllocator::new(ProcessId(1))),
            Arc::new(DevToolsManager::new()),
        );
        let a = registry.create_worker();
        let b = registry.create_worker();

        assert_ne!(a.id(), b.id());
        assert_eq!(registry.worker_count(), 2);
        drop(a);
        assert_eq!(registry.worker_count(), 1);
    }

    #[test]
    fn test_stop_worker_unknown_process() {
        let registry = WorkerRegistry::new(
            Arc::new(FakeAllocator::new(ProcessId(1))),
            Arc::new(DevToolsManager::new()),
        );
        let worker = registry.create_worker();

        assert_eq!(
            registry.stop_worker(ProcessId(99), worker.id()),
            Err(WorkerError::ProcessNotFound(ProcessId(99)))
        );
    }

    #[tokio::test]
    async fn test_message_routing() {
        let registry = WorkerRegistry::new(
            Arc::new(FakeAllocator::new(ProcessId(1))),
            Arc::new(DevToolsManager::new()),
        );
        registry.add_process_sender(ProcessId(1), Arc::new(FakeSender::new()));
        let worker = registry.create_worker();
        let listener = Arc::new(RecordingListener::handling());
        worker.add_listener(listener.clone());
        worker.start(params(), vec![]).await.unwrap();

        let message = WorkerMessage::new(serde_json::json!("ping"));
        assert!(registry.on_message_received(ProcessId(1), worker.id(), &message));
        assert_eq!(listener.messages.load(Ordering::SeqCst), 1);

        // Unknown worker and wrong process are both dropped.
        let stranger = registry.create_worker();
        assert!(!registry.on_message_received(ProcessId(1), stranger.id(), &message));
        assert!(!registry.on_message_received(ProcessId(2), worker.id(), &message));
        assert_eq!(listener.messages.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_process_loss_stops_workers() {
        let allocator = Arc::new(FakeAllocator::new(ProcessId(4)));
        let registry = WorkerRegistry::new(allocator.clone(), Arc::new(DevToolsManager::new()));
        registry.add_process_sender(ProcessId(4), Arc::new(FakeSender::new()));

        let a = registry.create_worker();
        let b = registry.create_worker();
        let listener = Arc::new(RecordingListener::default());
        a.add_listener(listener.clone());
        a.start(params(), vec![]).await.unwrap();
        b.start(params(), vec![]).await.unwrap();
        registry.on_worker_started(ProcessId(4), a.id(), WorkerThreadId(1));
        assert_eq!(registry.workers_in_process(ProcessId(4)), vec![a.id(), b.id()]);

        registry.remove_process_sender(ProcessId(4));

        assert_eq!(a.status(), WorkerStatus::Stopped);
        assert_eq!(b.status(), WorkerStatus::Stopped);
        assert!(!registry.has_process(ProcessId(4)));
        assert!(registry.workers_in_process(ProcessId(4)).is_empty());
        assert_eq!(allocator.releases.load(Ordering::SeqCst), 2);
        assert_eq!(
            *listener.stopped.lock().unwrap(),
            vec![WorkerStatus::Running]
        );
    }

    #[tokio::test]
    async fn test_start_without_sender_fails() {
        let registry = WorkerRegistry::new(
            Arc::new(FakeAllocator::new(ProcessId(8))),
            Arc::new(DevToolsManager::new()),
        );
        let worker = registry.create_worker();

        let result = worker.start(params(), vec![]).await;

        assert_eq!(result, Err(WorkerError::ProcessNotFound(ProcessId(8))));
        assert_eq!(worker.status(), WorkerStatus::Stopped);
        assert!(registry.workers_in_process(ProcessId(8)).is_empty());
    }
}
