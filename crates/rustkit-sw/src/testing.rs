//! In-process worker host for tests.
//!
//! [`TestWorkerHost`] plays the part of a renderer process: it allocates
//! itself as the hosting process, answers start and stop commands, and
//! replies to events with scriptable outcomes. Replies are sent from a
//! background task, so they arrive asynchronously like real IPC.

use futures::future::BoxFuture;
use rustkit_worker::{
    DevToolsManager, ProcessAllocator, ProcessId, ProcessSender, WorkerCommand, WorkerError,
    WorkerId, WorkerRegistry, WorkerThreadId,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

use crate::context::ServiceWorkerContext;
use crate::messages::{EventResult, FetchEventResult, ServiceWorkerMessage, ServiceWorkerReply};
use crate::storage::UserDataStorage;
use crate::{ServiceWorkerConfig, ServiceWorkerEvent};

/// How the host answers an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Complete,
    Reject,
    /// Keep the event unanswered until [`TestWorkerHost::release_held`].
    Hold,
}

#[derive(Debug)]
struct Behaviour {
    fail_allocation: bool,
    fail_start: bool,
    install: EventOutcome,
    activate: EventOutcome,
    push: EventOutcome,
    sync: EventOutcome,
    sync_queue: VecDeque<EventOutcome>,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            fail_allocation: false,
            fail_start: false,
            install: EventOutcome::Complete,
            activate: EventOutcome::Complete,
            push: EventOutcome::Complete,
            sync: EventOutcome::Complete,
            sync_queue: VecDeque::new(),
        }
    }
}

#[derive(Debug, Default)]
struct HostLog {
    starts: usize,
    stops: usize,
    sync_events: Vec<(String, bool)>,
    held: Vec<(WorkerId, ServiceWorkerMessage)>,
}

/// Fake worker process plus allocator.
pub struct TestWorkerHost {
    behaviour: Mutex<Behaviour>,
    log: Mutex<HostLog>,
    fail_sends: AtomicBool,
    allocations: AtomicUsize,
    releases: AtomicUsize,
    next_thread_id: AtomicU64,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<WorkerCommand>>>,
    registry: Mutex<Weak<WorkerRegistry>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TestWorkerHost {
    /// The one process this host simulates.
    pub const PROCESS_ID: ProcessId = ProcessId(1);

    pub fn new() -> Arc<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            behaviour: Mutex::new(Behaviour::default()),
            log: Mutex::new(HostLog::default()),
            fail_sends: AtomicBool::new(false),
            allocations: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            next_thread_id: AtomicU64::new(1),
            commands,
            receiver: Mutex::new(Some(receiver)),
            registry: Mutex::new(Weak::new()),
        })
    }

    /// Build a worker registry served by this host.
    ///
    /// Spawns the responder task, so it must run inside a tokio runtime.
    pub fn create_registry(self: &Arc<Self>) -> Arc<WorkerRegistry> {
        let registry = WorkerRegistry::new(self.clone(), Arc::new(DevToolsManager::new()));
        registry.add_process_sender(Self::PROCESS_ID, self.clone());
        *lock(&self.registry) = Arc::downgrade(&registry);

        if let Some(receiver) = lock(&self.receiver).take() {
            tokio::spawn(Self::respond(Arc::downgrade(self), receiver));
        }
        registry
    }

    /// Build a context over a registry served by this host.
    pub fn create_context(
        self: &Arc<Self>,
        storage: Arc<dyn UserDataStorage>,
    ) -> (
        Arc<ServiceWorkerContext>,
        mpsc::UnboundedReceiver<ServiceWorkerEvent>,
    ) {
        ServiceWorkerContext::new(
            self.create_registry(),
            storage,
            ServiceWorkerConfig::default(),
        )
    }

    fn registry(&self) -> Option<Arc<WorkerRegistry>> {
        lock(&self.registry).upgrade()
    }

    async fn respond(host: Weak<Self>, mut receiver: mpsc::UnboundedReceiver<WorkerCommand>) {
        while let Some(command) = receiver.recv().await {
            let Some(host) = host.upgrade() else {
                break;
            };
            host.handle(command);
        }
    }

    fn handle(&self, command: WorkerCommand) {
        let Some(registry) = self.registry() else {
            return;
        };
        let process_id = Self::PROCESS_ID;

        match command {
            WorkerCommand::StartWorker(params) => {
                lock(&self.log).starts += 1;
                registry.on_script_loaded(process_id, params.worker_id);
                if lock(&self.behaviour).fail_start {
                    registry.on_worker_stopped(process_id, params.worker_id);
                } else {
                    let thread_id =
                        WorkerThreadId(self.next_thread_id.fetch_add(1, Ordering::Relaxed));
                    registry.on_worker_started(process_id, params.worker_id, thread_id);
                }
            }
            WorkerCommand::StopWorker { worker_id } => {
                lock(&self.log).stops += 1;
                registry.on_worker_stopped(process_id, worker_id);
            }
            WorkerCommand::MessageToWorker {
                worker_id, message, ..
            } => {
                if let Ok(event) = message.decode::<ServiceWorkerMessage>() {
                    self.handle_event(&registry, worker_id, event);
                }
            }
        }
    }

    fn handle_event(&self, registry: &WorkerRegistry, worker_id: WorkerId, event: ServiceWorkerMessage) {
        let outcome = {
            let mut behaviour = lock(&self.behaviour);
            match &event {
                ServiceWorkerMessage::InstallEvent { .. } => behaviour.install,
                ServiceWorkerMessage::ActivateEvent { .. } => behaviour.activate,
                ServiceWorkerMessage::FetchEvent { .. } => EventOutcome::Complete,
                ServiceWorkerMessage::PushEvent { .. } => behaviour.push,
                ServiceWorkerMessage::SyncEvent {
                    tag, last_chance, ..
                } => {
                    lock(&self.log)
                        .sync_events
                        .push((tag.clone(), *last_chance));
                    let fallback = behaviour.sync;
                    behaviour.sync_queue.pop_front().unwrap_or(fallback)
                }
            }
        };

        match outcome {
            EventOutcome::Hold => lock(&self.log).held.push((worker_id, event)),
            EventOutcome::Complete => Self::reply(registry, worker_id, &event, EventResult::Completed),
            EventOutcome::Reject => Self::reply(registry, worker_id, &event, EventResult::Rejected),
        }
    }

    fn reply(
        registry: &WorkerRegistry,
        worker_id: WorkerId,
        event: &ServiceWorkerMessage,
        result: EventResult,
    ) {
        let reply = match event {
            ServiceWorkerMessage::InstallEvent { request_id } => {
                ServiceWorkerReply::InstallEventFinished {
                    request_id: *request_id,
                    result,
                }
            }
            ServiceWorkerMessage::ActivateEvent { request_id } => {
                ServiceWorkerReply::ActivateEventFinished {
                    request_id: *request_id,
                    result,
                }
            }
            ServiceWorkerMessage::FetchEvent { request_id, .. } => {
                ServiceWorkerReply::FetchEventFinished {
                    request_id: *request_id,
                    result: FetchEventResult::FallbackToNetwork,
                }
            }
            ServiceWorkerMessage::SyncEvent { request_id, .. } => {
                ServiceWorkerReply::SyncEventFinished {
                    request_id: *request_id,
                    result,
                }
            }
            ServiceWorkerMessage::PushEvent { request_id, .. } => {
                ServiceWorkerReply::PushEventFinished {
                    request_id: *request_id,
                    result,
                }
            }
        };

        if let Ok(message) = reply.to_worker_message() {
            registry.on_message_received(Self::PROCESS_ID, worker_id, &message);
        }
    }

    /// Answer every held event with `result`. Returns how many were held.
    pub fn release_held(&self, result: EventResult) -> usize {
        let held = std::mem::take(&mut lock(&self.log).held);
        let count = held.len();
        if let Some(registry) = self.registry() {
            for (worker_id, event) in held {
                Self::reply(&registry, worker_id, &event, result);
            }
        }
        count
    }

    /// Wait until at least `count` events are held.
    pub async fn wait_for_held(&self, count: usize) {
        while self.held_count() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Simulate the process dying.
    pub fn crash_process(&self) {
        if let Some(registry) = self.registry() {
            registry.remove_process_sender(Self::PROCESS_ID);
        }
    }

    // Scripting.

    pub fn set_fail_allocation(&self, fail: bool) {
        lock(&self.behaviour).fail_allocation = fail;
    }

    /// Make started workers fail to evaluate their script and stop.
    pub fn set_fail_start(&self, fail: bool) {
        lock(&self.behaviour).fail_start = fail;
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_install_outcome(&self, outcome: EventOutcome) {
        lock(&self.behaviour).install = outcome;
    }

    pub fn set_activate_outcome(&self, outcome: EventOutcome) {
        lock(&self.behaviour).activate = outcome;
    }

    pub fn set_push_outcome(&self, outcome: EventOutcome) {
        lock(&self.behaviour).push = outcome;
    }

    /// Outcome for sync events once the queued outcomes run out.
    pub fn set_sync_outcome(&self, outcome: EventOutcome) {
        lock(&self.behaviour).sync = outcome;
    }

    /// Outcomes for the next sync events, in order.
    pub fn queue_sync_outcomes(&self, outcomes: impl IntoIterator<Item = EventOutcome>) {
        lock(&self.behaviour).sync_queue.extend(outcomes);
    }

    // Observations.

    pub fn start_count(&self) -> usize {
        lock(&self.log).starts
    }

    pub fn stop_count(&self) -> usize {
        lock(&self.log).stops
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// `(tag, last_chance)` of every sync event received.
    pub fn sync_events(&self) -> Vec<(String, bool)> {
        lock(&self.log).sync_events.clone()
    }

    pub fn held_count(&self) -> usize {
        lock(&self.log).held.len()
    }
}

impl ProcessAllocator for TestWorkerHost {
    fn allocate(
        &self,
        _worker_id: WorkerId,
        _candidates: Vec<ProcessId>,
        _script_url: Url,
    ) -> BoxFuture<'static, Result<ProcessId, WorkerError>> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        let fail = lock(&self.behaviour).fail_allocation;
        Box::pin(async move {
            if fail {
                Err(WorkerError::AllocationFailed("test host refused".into()))
            } else {
                Ok(Self::PROCESS_ID)
            }
        })
    }

    fn release(&self, _worker_id: WorkerId) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

impl ProcessSender for TestWorkerHost {
    fn send(&self, command: WorkerCommand) -> bool {
        if self.fail_sends.load(Ordering::SeqCst) {
            return false;
        }
        self.commands.send(command).is_ok()
    }
}
