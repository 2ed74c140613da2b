//! Lifecycle of a single embedded worker.

use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::registry::WorkerRegistry;
use crate::{
    ConsoleMessage, ExceptionDetails, ProcessId, RouteId, StartWorkerParams, WorkerCommand,
    WorkerError, WorkerId, WorkerListener, WorkerMessage, WorkerStatus, WorkerThreadId,
};

/// What a worker needs to know to start.
#[derive(Debug, Clone, PartialEq)]
pub struct StartParams {
    pub version_id: u64,
    pub scope: Url,
    pub script_url: Url,
}

#[derive(Debug, Default)]
struct WorkerState {
    status: WorkerStatus,
    process_id: Option<ProcessId>,
    thread_id: Option<WorkerThreadId>,
    route_id: Option<RouteId>,
    /// Bumped whenever a pending start must not complete.
    start_generation: u64,
    process_refs: BTreeMap<ProcessId, usize>,
}

/// Shared part of an embedded worker, reachable from the registry.
pub(crate) struct WorkerCore {
    id: WorkerId,
    registry: Arc<WorkerRegistry>,
    state: Mutex<WorkerState>,
    listeners: Mutex<Vec<Arc<dyn WorkerListener>>>,
}

enum StopAction {
    Abandoned,
    Send {
        process_id: ProcessId,
        previous: WorkerStatus,
    },
}

impl WorkerCore {
    pub(crate) fn new(id: WorkerId, registry: Arc<WorkerRegistry>) -> Self {
        Self {
            id,
            registry,
            state: Mutex::new(WorkerState::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn WorkerListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn process_id(&self) -> Option<ProcessId> {
        self.lock_state().process_id
    }

    async fn run_start(
        self: Arc<Self>,
        generation: u64,
        params: StartParams,
        candidates: Vec<ProcessId>,
    ) -> Result<(), WorkerError> {
        let allocation = self
            .registry
            .allocator()
            .allocate(self.id, candidates, params.script_url.clone())
            .await;

        let process_id = match allocation {
            Ok(process_id) => process_id,
            Err(err) => {
                let mut state = self.lock_state();
                if state.start_generation != generation {
                    return Err(WorkerError::Abort);
                }
                state.status = WorkerStatus::Stopped;
                warn!(worker_id = %self.id, error = %err, "Process allocation failed");
                return Err(err);
            }
        };

        {
            let mut state = self.lock_state();
            if state.start_generation != generation || state.status != WorkerStatus::Starting {
                drop(state);
                debug!(worker_id = %self.id, "Start abandoned during allocation");
                self.registry.allocator().release(self.id);
                return Err(WorkerError::Abort);
            }
            state.process_id = Some(process_id);
        }
        self.registry.bind_worker(process_id, self.id);

        let route = self.registry.devtools().worker_created(
            process_id,
            self.id,
            &params.scope,
            &params.script_url,
        );
        self.lock_state().route_id = Some(route.route_id);

        let command = WorkerCommand::StartWorker(StartWorkerParams {
            worker_id: self.id,
            version_id: params.version_id,
            scope: params.scope,
            script_url: params.script_url,
            route_id: route.route_id,
            pause_on_start: route.pause_on_start,
        });
        if let Err(err) = self.registry.send(process_id, command) {
            warn!(worker_id = %self.id, error = %err, "Failed to send start command");
            self.lock_state().status = WorkerStatus::Stopped;
            self.release_process();
            return Err(err);
        }

        debug!(worker_id = %self.id, %process_id, "Start command sent");
        Ok(())
    }

    fn stop(&self) -> Result<(), WorkerError> {
        let action = {
            let mut state = self.lock_state();
            match (state.status, state.process_id) {
                (WorkerStatus::Stopped | WorkerStatus::Stopping, _) => return Ok(()),
                (_, None) => {
                    state.start_generation += 1;
                    state.status = WorkerStatus::Stopped;
                    StopAction::Abandoned
                }
                (previous, Some(process_id)) => {
                    state.status = WorkerStatus::Stopping;
                    StopAction::Send {
                        process_id,
                        previous,
                    }
                }
            }
        };

        match action {
            StopAction::Abandoned => {
                debug!(worker_id = %self.id, "Stopped while allocating a process");
                self.notify_stopped(WorkerStatus::Starting);
                Ok(())
            }
            StopAction::Send {
                process_id,
                previous,
            } => {
                if let Err(err) = self.registry.stop_worker(process_id, self.id) {
                    let mut state = self.lock_state();
                    if state.status == WorkerStatus::Stopping {
                        state.status = previous;
                    }
                    return Err(err);
                }
                Ok(())
            }
        }
    }

    /// Drop the process binding, the debug route and the allocator's claim.
    fn release_process(&self) {
        let (process_id, route_id) = {
            let mut state = self.lock_state();
            state.thread_id = None;
            (state.process_id.take(), state.route_id.take())
        };

        if let Some(process_id) = process_id {
            if let Some(route_id) = route_id {
                self.registry.devtools().worker_destroyed(process_id, route_id);
            }
            self.registry.unbind_worker(process_id, self.id);
            self.registry.allocator().release(self.id);
        }
    }

    pub(crate) fn on_started(&self, thread_id: WorkerThreadId) {
        {
            let mut state = self.lock_state();
            match state.status {
                WorkerStatus::Starting => {
                    state.status = WorkerStatus::Running;
                    state.thread_id = Some(thread_id);
                }
                WorkerStatus::Stopping => {
                    debug!(worker_id = %self.id, "Started while stopping, ignored");
                    return;
                }
                status => {
                    warn!(worker_id = %self.id, ?status, "Unexpected started notification");
                    return;
                }
            }
        }

        info!(worker_id = %self.id, "Worker running");
        for listener in self.snapshot_listeners() {
            listener.on_started();
        }
    }

    pub(crate) fn on_stopped(&self) {
        let previous = {
            let mut state = self.lock_state();
            if state.status == WorkerStatus::Stopped {
                return;
            }
            state.start_generation += 1;
            std::mem::replace(&mut state.status, WorkerStatus::Stopped)
        };

        self.release_process();
        info!(worker_id = %self.id, ?previous, "Worker stopped");
        self.notify_stopped(previous);
    }

    fn notify_stopped(&self, previous: WorkerStatus) {
        for listener in self.snapshot_listeners() {
            listener.on_stopped(previous);
        }
    }

    pub(crate) fn on_script_loaded(&self) {
        for listener in self.snapshot_listeners() {
            listener.on_script_loaded();
        }
    }

    pub(crate) fn on_script_load_failed(&self) {
        for listener in self.snapshot_listeners() {
            listener.on_script_load_failed();
        }
    }

    pub(crate) fn on_report_exception(&self, details: &ExceptionDetails) {
        for listener in self.snapshot_listeners() {
            listener.on_report_exception(details);
        }
    }

    pub(crate) fn on_report_console_message(&self, message: &ConsoleMessage) {
        for listener in self.snapshot_listeners() {
            listener.on_report_console_message(message);
        }
    }

    /// Offer the message to each listener until one handles it.
    pub(crate) fn on_message_received(&self, message: &WorkerMessage) -> bool {
        let handled = self
            .snapshot_listeners()
            .iter()
            .any(|listener| listener.on_message_received(message));
        if !handled {
            trace!(worker_id = %self.id, "Unhandled worker message");
        }
        handled
    }
}

/// Browser-side handle to one worker execution context.
///
/// Created by [`WorkerRegistry::create_worker`]. Dropping a starting or
/// running worker stops it first.
pub struct EmbeddedWorker {
    core: Arc<WorkerCore>,
}

impl EmbeddedWorker {
    pub(crate) fn from_core(core: Arc<WorkerCore>) -> Self {
        Self { core }
    }

    /// Get the worker ID.
    pub fn id(&self) -> WorkerId {
        self.core.id
    }

    /// Get the current status.
    pub fn status(&self) -> WorkerStatus {
        self.core.lock_state().status
    }

    /// Process hosting the worker, once one is bound.
    pub fn process_id(&self) -> Option<ProcessId> {
        self.core.process_id()
    }

    /// Thread running the worker, once it reported started.
    pub fn thread_id(&self) -> Option<WorkerThreadId> {
        self.core.lock_state().thread_id
    }

    pub fn route_id(&self) -> Option<RouteId> {
        self.core.lock_state().route_id
    }

    /// Start the worker.
    ///
    /// The transition to `Starting` happens immediately; the returned future
    /// drives process allocation and resolves once the start command has been
    /// handed to the process. Fails with `InvalidState` unless stopped, and
    /// with `Abort` if [`stop`](Self::stop) ran while a process was being
    /// allocated.
    pub fn start(
        &self,
        params: StartParams,
        candidates: Vec<ProcessId>,
    ) -> BoxFuture<'static, Result<(), WorkerError>> {
        let generation = {
            let mut state = self.core.lock_state();
            if state.status != WorkerStatus::Stopped {
                let status = state.status;
                return Box::pin(async move {
                    Err(WorkerError::InvalidState(format!(
                        "cannot start a worker that is {:?}",
                        status
                    )))
                });
            }
            state.status = WorkerStatus::Starting;
            state.start_generation += 1;
            state.start_generation
        };

        let candidates = self.sort_processes(&candidates);
        debug!(worker_id = %self.id(), ?candidates, "Starting worker");
        Box::pin(self.core.clone().run_start(generation, params, candidates))
    }

    /// Ask the hosting process to stop the worker.
    ///
    /// A no-op on a stopped or stopping worker. If the stop command cannot be
    /// sent the status is left as it was.
    pub fn stop(&self) -> Result<(), WorkerError> {
        self.core.stop()
    }

    /// Post a message to the running worker.
    pub fn send_message(&self, message: WorkerMessage) -> Result<(), WorkerError> {
        let target = {
            let state = self.core.lock_state();
            match (state.status, state.process_id, state.thread_id) {
                (WorkerStatus::Running, Some(process_id), Some(thread_id)) => {
                    Some((process_id, thread_id))
                }
                _ => None,
            }
        };

        let Some((process_id, thread_id)) = target else {
            return Err(WorkerError::IpcFailed("worker is not running".to_string()));
        };

        self.core.registry.send(
            process_id,
            WorkerCommand::MessageToWorker {
                thread_id,
                worker_id: self.id(),
                message,
            },
        )
    }

    /// Record that something in `process_id` depends on this worker.
    pub fn add_process_reference(&self, process_id: ProcessId) {
        *self
            .core
            .lock_state()
            .process_refs
            .entry(process_id)
            .or_insert(0) += 1;
    }

    pub fn release_process_reference(&self, process_id: ProcessId) {
        let mut state = self.core.lock_state();
        match state.process_refs.get_mut(&process_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                state.process_refs.remove(&process_id);
            }
            None => warn!(worker_id = %self.id(), %process_id, "Releasing unknown process reference"),
        }
    }

    /// Order processes by how many references they hold, most first.
    ///
    /// Each candidate counts as one extra reference. Ties keep ascending
    /// process-id order.
    pub fn sort_processes(&self, candidates: &[ProcessId]) -> Vec<ProcessId> {
        let mut counts = self.core.lock_state().process_refs.clone();
        for process_id in candidates {
            *counts.entry(*process_id).or_insert(0) += 1;
        }

        let mut ordered: Vec<(ProcessId, usize)> = counts.into_iter().collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1));
        ordered.into_iter().map(|(process_id, _)| process_id).collect()
    }

    pub fn add_listener(&self, listener: Arc<dyn WorkerListener>) {
        self.core
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn WorkerListener>) {
        self.core
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }
}

impl std::fmt::Debug for EmbeddedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.lock_state();
        f.debug_struct("EmbeddedWorker")
            .field("id", &self.core.id)
            .field("status", &state.status)
            .field("process_id", &state.process_id)
            .finish()
    }
}

impl Drop for EmbeddedWorker {
    fn drop(&mut self) {
        if matches!(
            self.status(),
            WorkerStatus::Starting | WorkerStatus::Running
        ) {
            if let Err(err) = self.core.stop() {
                warn!(worker_id = %self.id(), error = %err, "Stop on drop failed");
            }
        }
        self.core.release_process();
        self.core.registry.remove_worker(self.core.id);
        trace!(worker_id = %self.id(), "Worker destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeAllocator, FakeSender, RecordingListener};
    use crate::DevToolsManager;
    use std::sync::atomic::Ordering;

    fn params() -> StartParams {
        StartParams {
            version_id: 1,
            scope: Url::parse("https://example.com/").unwrap(),
            script_url: Url::parse("https://example.com/sw.js").unwrap(),
        }
    }

    fn setup() -> (Arc<WorkerRegistry>, Arc<FakeAllocator>, Arc<FakeSender>) {
        let allocator = Arc::new(FakeAllocator::new(ProcessId(10)));
        let registry = WorkerRegistry::new(allocator.clone(), Arc::new(DevToolsManager::new()));
        let sender = Arc::new(FakeSender::new());
        registry.add_process_sender(ProcessId(10), sender.clone());
        (registry, allocator, sender)
    }

    #[tokio::test]
    async fn test_start_sends_command() {
        let (registry, _allocator, sender) = setup();
        let worker = registry.create_worker();

        worker.start(params(), vec![]).await.unwrap();

        assert_eq!(worker.status(), WorkerStatus::Starting);
        assert_eq!(worker.process_id(), Some(ProcessId(10)));
        assert!(worker.route_id().is_some());
        let commands = sender.commands();
        assert!(matches!(
            commands.as_slice(),
            [WorkerCommand::StartWorker(p)] if p.worker_id == worker.id() && p.version_id == 1
        ));
    }

    #[tokio::test]
    async fn test_started_notification_runs_worker() {
        let (registry, _allocator, _sender) = setup();
        let worker = registry.create_worker();
        let listener = Arc::new(RecordingListener::default());
        worker.add_listener(listener.clone());

        worker.start(params(), vec![]).await.unwrap();
        registry.on_worker_started(ProcessId(10), worker.id(), WorkerThreadId(3));

        assert_eq!(worker.status(), WorkerStatus::Running);
        assert_eq!(worker.thread_id(), Some(WorkerThreadId(3)));
        assert_eq!(listener.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let (registry, _allocator, _sender) = setup();
        let worker = registry.create_worker();

        worker.start(params(), vec![]).await.unwrap();
        let second = worker.start(params(), vec![]).await;

        assert!(matches!(second, Err(WorkerError::InvalidState(_))));
        assert_eq!(worker.status(), WorkerStatus::Starting);
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let (registry, allocator, sender) = setup();
        let worker = registry.create_worker();

        worker.stop().unwrap();

        assert_eq!(worker.status(), WorkerStatus::Stopped);
        assert_eq!(allocator.allocations.load(Ordering::SeqCst), 0);
        assert!(sender.commands().is_empty());
    }

    #[tokio::test]
    async fn test_stop_then_stopped() {
        let (registry, allocator, sender) = setup();
        let worker = registry.create_worker();
        let listener = Arc::new(RecordingListener::default());
        worker.add_listener(listener.clone());

        worker.start(params(), vec![]).await.unwrap();
        registry.on_worker_started(ProcessId(10), worker.id(), WorkerThreadId(1));
        worker.stop().unwrap();
        assert_eq!(worker.status(), WorkerStatus::Stopping);
        assert!(matches!(
            sender.commands().last(),
            Some(WorkerCommand::StopWorker { .. })
        ));

        registry.on_worker_stopped(ProcessId(10), worker.id());

        assert_eq!(worker.status(), WorkerStatus::Stopped);
        assert_eq!(worker.process_id(), None);
        assert_eq!(allocator.releases.load(Ordering::SeqCst), 1);
        assert_eq!(
            *listener.stopped.lock().unwrap(),
            vec![WorkerStatus::Stopping]
        );
    }

    #[tokio::test]
    async fn test_stop_send_failure_keeps_status() {
        let (registry, _allocator, sender) = setup();
        let worker = registry.create_worker();

        worker.start(params(), vec![]).await.unwrap();
        registry.on_worker_started(ProcessId(10), worker.id(), WorkerThreadId(1));
        sender.fail.store(true, Ordering::SeqCst);

        assert!(matches!(worker.stop(), Err(WorkerError::IpcFailed(_))));
        assert_eq!(worker.status(), WorkerStatus::Running);
    }

    #[tokio::test]
    async fn test_started_ignored_while_stopping() {
        let (registry, _allocator, _sender) = setup();
        let worker = registry.create_worker();

        worker.start(params(), vec![]).await.unwrap();
        worker.stop().unwrap();
        registry.on_worker_started(ProcessId(10), worker.id(), WorkerThreadId(1));

        assert_eq!(worker.status(), WorkerStatus::Stopping);
    }

    #[tokio::test]
    async fn test_allocation_failure_returns_to_stopped() {
        let (registry, allocator, _sender) = setup();
        allocator.fail.store(true, Ordering::SeqCst);
        let worker = registry.create_worker();

        let result = worker.start(params(), vec![]).await;

        assert!(matches!(result, Err(WorkerError::AllocationFailed(_))));
        assert_eq!(worker.status(), WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_during_allocation_aborts() {
        let (registry, allocator, _sender) = setup();
        let gate = allocator.hold();
        let worker = registry.create_worker();
        let listener = Arc::new(RecordingListener::default());
        worker.add_listener(listener.clone());

        let start = worker.start(params(), vec![]);
        assert_eq!(worker.status(), WorkerStatus::Starting);
        worker.stop().unwrap();
        assert_eq!(worker.status(), WorkerStatus::Stopped);

        gate.send(()).unwrap();
        assert!(matches!(start.await, Err(WorkerError::Abort)));
        assert_eq!(worker.status(), WorkerStatus::Stopped);
        assert_eq!(allocator.releases.load(Ordering::SeqCst), 1);
        assert_eq!(
            *listener.stopped.lock().unwrap(),
            vec![WorkerStatus::Starting]
        );
    }

    #[tokio::test]
    async fn test_send_message_requires_running() {
        let (registry, _allocator, sender) = setup();
        let worker = registry.create_worker();
        let message = WorkerMessage::new(serde_json::json!({"hello": 1}));

        assert!(matches!(
            worker.send_message(message.clone()),
            Err(WorkerError::IpcFailed(_))
        ));

        worker.start(params(), vec![]).await.unwrap();
        registry.on_worker_started(ProcessId(10), worker.id(), WorkerThreadId(4));
        worker.send_message(message).unwrap();

        assert!(matches!(
            sender.commands().last(),
            Some(WorkerCommand::MessageToWorker { thread_id, .. }) if *thread_id == WorkerThreadId(4)
        ));
    }

    #[tokio::test]
    async fn test_sort_processes_by_reference_count() {
        let (registry, _allocator, _sender) = setup();
        let worker = registry.create_worker();
        worker.add_process_reference(ProcessId(2));
        worker.add_process_reference(ProcessId(2));
        worker.add_process_reference(ProcessId(5));

        let ordered = worker.sort_processes(&[ProcessId(5), ProcessId(7), ProcessId(1)]);
        assert_eq!(
            ordered,
            vec![ProcessId(2), ProcessId(5), ProcessId(1), ProcessId(7)]
        );

        worker.release_process_reference(ProcessId(2));
        worker.release_process_reference(ProcessId(2));
        assert_eq!(worker.sort_processes(&[]), vec![ProcessId(5)]);
    }

    #[tokio::test]
    async fn test_candidates_passed_to_allocator_in_order() {
        let (registry, allocator, _sender) = setup();
        let worker = registry.create_worker();
        worker.add_process_reference(ProcessId(10));

        worker
            .start(params(), vec![ProcessId(3), ProcessId(10)])
            .await
            .unwrap();

        assert_eq!(
            *allocator.last_candidates.lock().unwrap(),
            vec![ProcessId(10), ProcessId(3)]
        );
    }

    #[tokio::test]
    async fn test_listener_removed() {
        let (registry, _allocator, _sender) = setup();
        let worker = registry.create_worker();
        let listener = Arc::new(RecordingListener::default());
        let handle: Arc<dyn WorkerListener> = listener.clone();
        worker.add_listener(handle.clone());
        worker.remove_listener(&handle);

        worker.start(params(), vec![]).await.unwrap();
        registry.on_worker_started(ProcessId(10), worker.id(), WorkerThreadId(1));

        assert_eq!(listener.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drop_stops_running_worker() {
        let (registry, allocator, sender) = setup();
        let worker = registry.create_worker();
        let id = worker.id();

        worker.start(params(), vec![]).await.unwrap();
        registry.on_worker_started(ProcessId(10), id, WorkerThreadId(1));
        drop(worker);

        assert!(matches!(
            sender.commands().last(),
            Some(WorkerCommand::StopWorker { worker_id }) if *worker_id == id
        ));
        assert_eq!(allocator.releases.load(Ordering::SeqCst), 1);
        assert_eq!(registry.worker_count(), 0);
        assert!(registry.workers_in_process(ProcessId(10)).is_empty());
    }
}
