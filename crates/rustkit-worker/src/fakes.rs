//! In-crate fakes for unit tests.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;
use url::Url;

use crate::{
    ProcessAllocator, ProcessId, ProcessSender, WorkerCommand, WorkerError, WorkerId,
    WorkerListener, WorkerMessage, WorkerStatus,
};

pub(crate) struct FakeAllocator {
    process_id: ProcessId,
    pub allocations: AtomicUsize,
    pub releases: AtomicUsize,
    pub fail: AtomicBool,
    pub last_candidates: Mutex<Vec<ProcessId>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FakeAllocator {
    pub fn new(process_id: ProcessId) -> Self {
        Self {
            process_id,
            allocations: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            last_candidates: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        }
    }

    /// Hold the next allocation until the returned sender fires.
    pub fn hold(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }
}

impl ProcessAllocator for FakeAllocator {
    fn allocate(
        &self,
        _worker_id: WorkerId,
        candidates: Vec<ProcessId>,
        _script_url: Url,
    ) -> BoxFuture<'static, Result<ProcessId, WorkerError>> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        *self.last_candidates.lock().unwrap() = candidates;
        let gate = self.gate.lock().unwrap().take();
        let fail = self.fail.load(Ordering::SeqCst);
        let process_id = self.process_id;
        Box::pin(async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            if fail {
                Err(WorkerError::AllocationFailed("no process".into()))
            } else {
                Ok(process_id)
            }
        })
    }

    fn release(&self, _worker_id: WorkerId) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct FakeSender {
    pub fail: AtomicBool,
    commands: Mutex<Vec<WorkerCommand>>,
}

impl FakeSender {
    pub fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<WorkerCommand> {
        self.commands.lock().unwrap().clone()
    }
}

impl ProcessSender for FakeSender {
    fn send(&self, command: WorkerCommand) -> bool {
        if self.fail.load(Ordering::SeqCst) {
            return false;
        }
        self.commands.lock().unwrap().push(command);
        true
    }
}

#[derive(Default)]
pub(crate) struct RecordingListener {
    handles_messages: bool,
    pub started: AtomicUsize,
    pub stopped: Mutex<Vec<WorkerStatus>>,
    pub messages: AtomicUsize,
}

impl RecordingListener {
    pub fn handling() -> Self {
        Self {
            handles_messages: true,
            ..Default::default()
        }
    }
}

impl WorkerListener for RecordingListener {
    fn on_started(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stopped(&self, previous: WorkerStatus) {
        self.stopped.lock().unwrap().push(previous);
    }

    fn on_message_received(&self, _message: &WorkerMessage) -> bool {
        self.messages.fetch_add(1, Ordering::SeqCst);
        self.handles_messages
    }
}
