//! A service worker version and its embedded worker.
//!
//! The version owns one [`EmbeddedWorker`]. Events are dispatched by first
//! making sure the worker runs, then recording a completion sender in the
//! event kind's [`PendingRequests`] table and posting the event. The worker
//! answers with a [`ServiceWorkerReply`] carrying the same request id.
//!
//! When the worker stops, every table is flushed with a failure before any
//! queued start/stop waiter is resolved.

use hashbrown::HashMap;
use rustkit_worker::{
    ConsoleMessage, EmbeddedWorker, ExceptionDetails, ProcessId, StartParams, WorkerError,
    WorkerListener, WorkerMessage, WorkerStatus,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::messages::{EventResult, FetchEventResult, FetchRequest, ServiceWorkerMessage, ServiceWorkerReply};
use crate::pending::{PendingRequests, RequestId};
use crate::{
    ClientId, RegistrationId, ServiceWorkerConfig, ServiceWorkerError, ServiceWorkerEvent,
    VersionId, VersionStatus,
};

type StatusResult = Result<(), ServiceWorkerError>;
type FetchResult = Result<FetchEventResult, ServiceWorkerError>;

struct VersionState {
    status: VersionStatus,
    start_callbacks: Vec<oneshot::Sender<StatusResult>>,
    stop_callbacks: Vec<oneshot::Sender<StatusResult>>,
    install_requests: PendingRequests<StatusResult>,
    activate_requests: PendingRequests<StatusResult>,
    fetch_requests: PendingRequests<FetchResult>,
    sync_requests: PendingRequests<StatusResult>,
    push_requests: PendingRequests<StatusResult>,
    controllees: HashMap<ClientId, ProcessId>,
    idle_timer: Option<JoinHandle<()>>,
    idle_generation: u64,
}

impl VersionState {
    fn new() -> Self {
        Self {
            status: VersionStatus::New,
            start_callbacks: Vec::new(),
            stop_callbacks: Vec::new(),
            install_requests: PendingRequests::new(),
            activate_requests: PendingRequests::new(),
            fetch_requests: PendingRequests::new(),
            sync_requests: PendingRequests::new(),
            push_requests: PendingRequests::new(),
            controllees: HashMap::new(),
            idle_timer: None,
            idle_generation: 0,
        }
    }

    fn has_inflight_requests(&self) -> bool {
        !(self.install_requests.is_empty()
            && self.activate_requests.is_empty()
            && self.fetch_requests.is_empty()
            && self.sync_requests.is_empty()
            && self.push_requests.is_empty())
    }

    fn disarm_idle_timer(&mut self) {
        self.idle_generation += 1;
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }

    fn flush_requests(&mut self) -> usize {
        self.install_requests
            .flush(|| Err(ServiceWorkerError::InstallWorkerFailed))
            + self
                .activate_requests
                .flush(|| Err(ServiceWorkerError::ActivateWorkerFailed))
            + self
                .fetch_requests
                .flush(|| Err(ServiceWorkerError::Failed("worker stopped".into())))
            + self
                .sync_requests
                .flush(|| Err(ServiceWorkerError::Failed("worker stopped".into())))
            + self
                .push_requests
                .flush(|| Err(ServiceWorkerError::Failed("worker stopped".into())))
    }
}

/// A dispatched event awaiting its reply.
///
/// Dropped before the reply arrives (the caller timed out or went away), it
/// takes its entry out of the table so the version can idle out.
struct InflightRequest<'a, T> {
    inner: &'a VersionInner,
    table: fn(&mut VersionState) -> &mut PendingRequests<T>,
    request_id: RequestId,
    rx: oneshot::Receiver<T>,
}

impl<T> InflightRequest<'_, T> {
    /// `None` when the table was dropped without resolving the request.
    async fn reply(mut self) -> Option<T> {
        (&mut self.rx).await.ok()
    }
}

impl<T> Drop for InflightRequest<'_, T> {
    fn drop(&mut self) {
        if (self.table)(&mut self.inner.lock_state()).remove(self.request_id) {
            debug!(
                version_id = %self.inner.version_id,
                request_id = %self.request_id,
                "Event abandoned before its reply"
            );
        }
    }
}

struct VersionInner {
    version_id: VersionId,
    registration_id: RegistrationId,
    scope: Url,
    script_url: Url,
    worker: EmbeddedWorker,
    config: ServiceWorkerConfig,
    events: mpsc::UnboundedSender<ServiceWorkerEvent>,
    state: Mutex<VersionState>,
}

impl VersionInner {
    fn lock_state(&self) -> MutexGuard<'_, VersionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn arm_idle_timer(self: &Arc<Self>, state: &mut VersionState) {
        state.disarm_idle_timer();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(version_id = %self.version_id, "No runtime, idle timer not armed");
            return;
        };

        let generation = state.idle_generation;
        let delay = self.config.idle_delay;
        let weak = Arc::downgrade(self);
        state.idle_timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_idle_timeout(generation);
            }
        }));
    }

    fn on_idle_timeout(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.lock_state();
            if state.idle_generation != generation || !state.controllees.is_empty() {
                return;
            }
            state.idle_timer = None;
            if state.has_inflight_requests() {
                self.arm_idle_timer(&mut state);
                return;
            }
        }

        debug!(version_id = %self.version_id, "Idle, stopping worker");
        if let Err(err) = self.worker.stop() {
            warn!(version_id = %self.version_id, error = %err, "Idle stop failed");
        }
    }

    fn on_worker_started(self: &Arc<Self>) {
        let callbacks = {
            let mut state = self.lock_state();
            if state.controllees.is_empty() {
                self.arm_idle_timer(&mut state);
            }
            std::mem::take(&mut state.start_callbacks)
        };

        for tx in callbacks {
            let _ = tx.send(Ok(()));
        }
        self.emit(ServiceWorkerEvent::WorkerStarted {
            version_id: self.version_id,
        });
    }

    fn on_start_failed(&self, err: ServiceWorkerError) {
        warn!(version_id = %self.version_id, error = %err, "Failed to start worker");
        let callbacks = std::mem::take(&mut self.lock_state().start_callbacks);
        for tx in callbacks {
            let _ = tx.send(Err(err.clone()));
        }
    }

    fn on_worker_stopped(&self) {
        let (starts, stops) = {
            let mut state = self.lock_state();
            state.disarm_idle_timer();
            let flushed = state.flush_requests();
            if flushed > 0 {
                debug!(version_id = %self.version_id, flushed, "Flushed in-flight requests");
            }
            (
                std::mem::take(&mut state.start_callbacks),
                std::mem::take(&mut state.stop_callbacks),
            )
        };

        for tx in starts {
            let _ = tx.send(Err(ServiceWorkerError::StartWorkerFailed(
                "worker stopped while starting".into(),
            )));
        }
        for tx in stops {
            let _ = tx.send(Ok(()));
        }
        self.emit(ServiceWorkerEvent::WorkerStopped {
            version_id: self.version_id,
        });
    }

    fn on_message(&self, message: &WorkerMessage) -> bool {
        let Ok(reply) = message.decode::<ServiceWorkerReply>() else {
            return false;
        };

        let mut state = self.lock_state();
        let (kind, request_id, known) = match reply {
            ServiceWorkerReply::InstallEventFinished { request_id, result } => (
                "install",
                request_id,
                state.install_requests.complete(
                    request_id,
                    extendable_result(result, ServiceWorkerError::InstallWorkerFailed),
                ),
            ),
            ServiceWorkerReply::ActivateEventFinished { request_id, result } => (
                "activate",
                request_id,
                state.activate_requests.complete(
                    request_id,
                    extendable_result(result, ServiceWorkerError::ActivateWorkerFailed),
                ),
            ),
            ServiceWorkerReply::FetchEventFinished { request_id, result } => (
                "fetch",
                request_id,
                state.fetch_requests.complete(request_id, Ok(result)),
            ),
            ServiceWorkerReply::SyncEventFinished { request_id, result } => (
                "sync",
                request_id,
                state.sync_requests.complete(
                    request_id,
                    extendable_result(result, ServiceWorkerError::EventWaitUntilRejected),
                ),
            ),
            ServiceWorkerReply::PushEventFinished { request_id, result } => (
                "push",
                request_id,
                state.push_requests.complete(
                    request_id,
                    extendable_result(result, ServiceWorkerError::EventWaitUntilRejected),
                ),
            ),
        };

        if !known {
            warn!(version_id = %self.version_id, kind, %request_id, "Reply for unknown request ignored");
        }
        true
    }
}

fn extendable_result(result: EventResult, rejected: ServiceWorkerError) -> StatusResult {
    match result {
        EventResult::Completed => Ok(()),
        EventResult::Rejected => Err(rejected),
    }
}

impl Drop for VersionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
    }
}

struct VersionListener {
    inner: Weak<VersionInner>,
}

impl WorkerListener for VersionListener {
    fn on_started(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_worker_started();
        }
    }

    fn on_stopped(&self, _previous: WorkerStatus) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_worker_stopped();
        }
    }

    fn on_script_load_failed(&self) {
        if let Some(inner) = self.inner.upgrade() {
            warn!(version_id = %inner.version_id, script_url = %inner.script_url, "Script load failed");
        }
    }

    fn on_report_exception(&self, details: &ExceptionDetails) {
        if let Some(inner) = self.inner.upgrade() {
            warn!(
                version_id = %inner.version_id,
                source = %details.source_url,
                line = details.line_number,
                "Uncaught exception: {}",
                details.message
            );
        }
    }

    fn on_report_console_message(&self, message: &ConsoleMessage) {
        if let Some(inner) = self.inner.upgrade() {
            debug!(version_id = %inner.version_id, level = ?message.level, "console: {}", message.message);
        }
    }

    fn on_message_received(&self, message: &WorkerMessage) -> bool {
        self.inner
            .upgrade()
            .map(|inner| inner.on_message(message))
            .unwrap_or(false)
    }
}

/// Handle to one service worker version.
///
/// Clones share the same version. The owning registration keeps the handle
/// of record; dispatches in flight hold clones until they resolve.
#[derive(Clone)]
pub struct ServiceWorkerVersion {
    inner: Arc<VersionInner>,
}

impl ServiceWorkerVersion {
    pub fn new(
        version_id: VersionId,
        registration_id: RegistrationId,
        scope: Url,
        script_url: Url,
        worker: EmbeddedWorker,
        config: ServiceWorkerConfig,
        events: mpsc::UnboundedSender<ServiceWorkerEvent>,
    ) -> Self {
        let inner = Arc::new(VersionInner {
            version_id,
            registration_id,
            scope,
            script_url,
            worker,
            config,
            events,
            state: Mutex::new(VersionState::new()),
        });
        inner.worker.add_listener(Arc::new(VersionListener {
            inner: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    pub fn version_id(&self) -> VersionId {
        self.inner.version_id
    }

    pub fn registration_id(&self) -> RegistrationId {
        self.inner.registration_id
    }

    pub fn scope(&self) -> &Url {
        &self.inner.scope
    }

    pub fn script_url(&self) -> &Url {
        &self.inner.script_url
    }

    pub fn status(&self) -> VersionStatus {
        self.inner.lock_state().status
    }

    /// Running status of the embedded worker.
    pub fn running_status(&self) -> WorkerStatus {
        self.inner.worker.status()
    }

    pub fn embedded_worker(&self) -> &EmbeddedWorker {
        &self.inner.worker
    }

    pub fn set_status(&self, status: VersionStatus) {
        {
            let mut state = self.inner.lock_state();
            if state.status == status {
                return;
            }
            state.status = status;
        }

        info!(version_id = %self.inner.version_id, ?status, "Version status changed");
        self.inner.emit(ServiceWorkerEvent::StatusChanged {
            registration_id: self.inner.registration_id,
            version_id: self.inner.version_id,
            status,
        });
    }

    /// Mark the version deactivated and ask its worker to stop.
    pub(crate) fn deactivate(&self) {
        self.set_status(VersionStatus::Deactivated);
        if let Err(err) = self.inner.worker.stop() {
            warn!(version_id = %self.inner.version_id, error = %err, "Stop of deactivated version failed");
        }
    }

    fn start_params(&self) -> StartParams {
        StartParams {
            version_id: self.inner.version_id.0,
            scope: self.inner.scope.clone(),
            script_url: self.inner.script_url.clone(),
        }
    }

    pub async fn start_worker(&self) -> Result<(), ServiceWorkerError> {
        self.start_worker_with_candidate_processes(Vec::new()).await
    }

    /// Make sure the worker runs, preferring `candidates` for its process.
    ///
    /// Resolves at once when already running and fails at once while the
    /// worker is stopping. Otherwise waits for the worker to report started.
    pub async fn start_worker_with_candidate_processes(
        &self,
        candidates: Vec<ProcessId>,
    ) -> Result<(), ServiceWorkerError> {
        let rx = {
            let mut state = self.inner.lock_state();
            if state.status == VersionStatus::Deactivated {
                return Err(ServiceWorkerError::InvalidState(
                    "version is deactivated".into(),
                ));
            }

            let running_status = self.inner.worker.status();
            match running_status {
                WorkerStatus::Running => return Ok(()),
                WorkerStatus::Stopping => {
                    return Err(ServiceWorkerError::StartWorkerFailed(
                        "worker is stopping".into(),
                    ))
                }
                WorkerStatus::Stopped | WorkerStatus::Starting => {}
            }

            let (tx, rx) = oneshot::channel();
            state.start_callbacks.push(tx);

            if running_status == WorkerStatus::Stopped {
                let start = self.inner.worker.start(self.start_params(), candidates);
                let weak = Arc::downgrade(&self.inner);
                tokio::spawn(async move {
                    match start.await {
                        // A stop during allocation already notified the listener.
                        Ok(()) | Err(WorkerError::Abort) => {}
                        Err(err) => {
                            if let Some(inner) = weak.upgrade() {
                                inner.on_start_failed(err.into());
                            }
                        }
                    }
                });
            }
            rx
        };

        rx.await.unwrap_or(Err(ServiceWorkerError::Abort))
    }

    /// Stop the worker and wait until it reports stopped.
    pub async fn stop_worker(&self) -> Result<(), ServiceWorkerError> {
        let rx = {
            let mut state = self.inner.lock_state();
            if self.inner.worker.status() == WorkerStatus::Stopped {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.stop_callbacks.push(tx);
            rx
        };

        if let Err(err) = self.inner.worker.stop() {
            let err = ServiceWorkerError::from(err);
            let callbacks = std::mem::take(&mut self.inner.lock_state().stop_callbacks);
            for tx in callbacks {
                let _ = tx.send(Err(err.clone()));
            }
        }

        rx.await.unwrap_or(Err(ServiceWorkerError::Abort))
    }

    fn require_status(&self, required: VersionStatus, event: &str) -> Result<(), ServiceWorkerError> {
        let status = self.status();
        if status == required {
            Ok(())
        } else {
            Err(ServiceWorkerError::InvalidState(format!(
                "{} event needs a {:?} version, this one is {:?}",
                event, required, status
            )))
        }
    }

    /// Record a pending request and post its event to the worker.
    ///
    /// If the post fails the entry is removed again and the error returned.
    fn send_request<T>(
        &self,
        table: fn(&mut VersionState) -> &mut PendingRequests<T>,
        build: impl FnOnce(RequestId) -> ServiceWorkerMessage,
    ) -> Result<InflightRequest<'_, T>, ServiceWorkerError> {
        let (request_id, rx) = table(&mut self.inner.lock_state()).add();

        let sent = build(request_id).to_worker_message().and_then(|message| {
            self.inner
                .worker
                .send_message(message)
                .map_err(ServiceWorkerError::from)
        });
        if let Err(err) = sent {
            table(&mut self.inner.lock_state()).remove(request_id);
            warn!(version_id = %self.inner.version_id, %request_id, error = %err, "Failed to send event");
            return Err(err);
        }
        Ok(InflightRequest {
            inner: &self.inner,
            table,
            request_id,
            rx,
        })
    }

    async fn dispatch_extendable<F>(
        &self,
        required: VersionStatus,
        event: &'static str,
        table: fn(&mut VersionState) -> &mut PendingRequests<StatusResult>,
        build: F,
    ) -> StatusResult
    where
        F: FnOnce(RequestId) -> ServiceWorkerMessage + Send,
    {
        self.require_status(required, event)?;
        self.start_worker().await?;
        let request = self.send_request(table, build)?;
        debug!(version_id = %self.inner.version_id, event, "Event dispatched");
        request.reply().await.unwrap_or(Err(ServiceWorkerError::Abort))
    }

    /// Dispatch the install event. The version must be `Installing`.
    pub async fn dispatch_install_event(&self) -> Result<(), ServiceWorkerError> {
        self.dispatch_extendable(
            VersionStatus::Installing,
            "install",
            |state| &mut state.install_requests,
            |request_id| ServiceWorkerMessage::InstallEvent { request_id },
        )
        .await
    }

    /// Dispatch the activate event. The version must be `Activating`.
    pub async fn dispatch_activate_event(&self) -> Result<(), ServiceWorkerError> {
        self.dispatch_extendable(
            VersionStatus::Activating,
            "activate",
            |state| &mut state.activate_requests,
            |request_id| ServiceWorkerMessage::ActivateEvent { request_id },
        )
        .await
    }

    /// Dispatch a sync event for `tag`. The version must be `Active`.
    pub async fn dispatch_sync_event(
        &self,
        tag: String,
        last_chance: bool,
    ) -> Result<(), ServiceWorkerError> {
        self.dispatch_extendable(
            VersionStatus::Active,
            "sync",
            |state| &mut state.sync_requests,
            move |request_id| ServiceWorkerMessage::SyncEvent {
                request_id,
                tag,
                last_chance,
            },
        )
        .await
    }

    /// Dispatch a push event. The version must be `Active`.
    pub async fn dispatch_push_event(&self, data: String) -> Result<(), ServiceWorkerError> {
        self.dispatch_extendable(
            VersionStatus::Active,
            "push",
            |state| &mut state.push_requests,
            move |request_id| ServiceWorkerMessage::PushEvent { request_id, data },
        )
        .await
    }

    /// Dispatch a fetch event. The version must be `Active`.
    pub async fn dispatch_fetch_event(
        &self,
        request: FetchRequest,
    ) -> Result<FetchEventResult, ServiceWorkerError> {
        self.require_status(VersionStatus::Active, "fetch")?;
        self.start_worker().await?;
        let request = self.send_request(
            |state| &mut state.fetch_requests,
            move |request_id| ServiceWorkerMessage::FetchEvent {
                request_id,
                request,
            },
        )?;
        request.reply().await.unwrap_or(Err(ServiceWorkerError::Abort))
    }

    /// Start controlling a client living in `process_id`.
    pub fn add_controllee(&self, client_id: ClientId, process_id: ProcessId) {
        {
            let mut state = self.inner.lock_state();
            if state.controllees.contains_key(&client_id) {
                warn!(version_id = %self.inner.version_id, %client_id, "Controllee already added");
                return;
            }
            state.controllees.insert(client_id, process_id);
            state.disarm_idle_timer();
        }
        self.inner.worker.add_process_reference(process_id);
    }

    pub fn remove_controllee(&self, client_id: &ClientId) {
        let process_id = {
            let mut state = self.inner.lock_state();
            let Some(process_id) = state.controllees.remove(client_id) else {
                warn!(version_id = %self.inner.version_id, %client_id, "Unknown controllee");
                return;
            };
            if state.controllees.is_empty() {
                self.inner.arm_idle_timer(&mut state);
            }
            process_id
        };
        self.inner.worker.release_process_reference(process_id);
    }

    pub fn has_controllee(&self) -> bool {
        !self.inner.lock_state().controllees.is_empty()
    }

    pub fn controllee_count(&self) -> usize {
        self.inner.lock_state().controllees.len()
    }

    pub fn is_idle_timer_armed(&self) -> bool {
        self.inner.lock_state().idle_timer.is_some()
    }

    pub fn has_inflight_requests(&self) -> bool {
        self.inner.lock_state().has_inflight_requests()
    }
}

impl std::fmt::Debug for ServiceWorkerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorkerVersion")
            .field("version_id", &self.inner.version_id)
            .field("registration_id", &self.inner.registration_id)
            .field("script_url", &self.inner.script_url.as_str())
            .field("status", &self.status())
            .finish()
    }
}
