//! The background sync manager.
//!
//! Every mutation runs as one operation on an [`OperationQueue`], so the
//! in-memory registrations and their stored copy are never changed by two
//! operations at once. Sync events run outside the queue; each completion is
//! queued as an operation of its own.

use futures::future::join_all;
use hashbrown::HashMap;
use rustkit_common::{with_timeout, BackoffPolicy, OperationQueue};
use rustkit_sw::{
    RegistrationId, ServiceWorkerContext, ServiceWorkerContextObserver, ServiceWorkerError,
    ServiceWorkerVersion,
};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::collaborators::{BackgroundRunScheduler, PermissionChecker, PermissionStatus};
use crate::network::{ConnectionType, NetworkObserver};
use crate::params::BackgroundSyncParameters;
use crate::persist::{OwnerRegistrations, StoredRegistrations};
use crate::registration::{BackgroundSyncRegistration, BackgroundSyncRegistrationOptions, SyncState};
use crate::{
    BackgroundSyncError, BackgroundSyncEvent, CompletionOutcome, BACKGROUND_SYNC_USER_DATA_KEY,
    MAX_TAG_LENGTH,
};

#[derive(Debug, Default)]
struct ManagerState {
    disabled: bool,
    owners: HashMap<RegistrationId, OwnerRegistrations>,
    /// Events dispatched and not yet completed.
    num_firing: usize,
}

#[derive(Debug, Default)]
struct WakeTimer {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

/// A registration picked for firing.
#[derive(Debug)]
struct FireJob {
    owner: RegistrationId,
    id: u64,
    tag: String,
    last_chance: bool,
}

struct ManagerInner {
    context: Arc<ServiceWorkerContext>,
    permissions: Arc<dyn PermissionChecker>,
    scheduler: Arc<dyn BackgroundRunScheduler>,
    network: NetworkObserver,
    clock: Arc<dyn Clock>,
    params: BackgroundSyncParameters,
    backoff: BackoffPolicy,
    queue: OperationQueue,
    state: Mutex<ManagerState>,
    wake: Mutex<WakeTimer>,
    events: mpsc::UnboundedSender<BackgroundSyncEvent>,
}

/// Registers, persists and fires one-shot background sync events.
pub struct BackgroundSyncManager {
    inner: Arc<ManagerInner>,
    observer: Arc<dyn ServiceWorkerContextObserver>,
    network_task: JoinHandle<()>,
}

impl BackgroundSyncManager {
    /// Create a manager and queue the load of persisted registrations.
    ///
    /// Spawns tasks, so it must be called inside a tokio runtime.
    pub fn new(
        context: Arc<ServiceWorkerContext>,
        permissions: Arc<dyn PermissionChecker>,
        scheduler: Arc<dyn BackgroundRunScheduler>,
        network: NetworkObserver,
        clock: Arc<dyn Clock>,
        params: BackgroundSyncParameters,
    ) -> (Self, mpsc::UnboundedReceiver<BackgroundSyncEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ManagerInner {
            context,
            permissions,
            scheduler,
            network,
            clock,
            backoff: params.backoff(),
            params,
            queue: OperationQueue::new(),
            state: Mutex::new(ManagerState::default()),
            wake: Mutex::new(WakeTimer::default()),
            events,
        });

        let observer: Arc<dyn ServiceWorkerContextObserver> = Arc::new(ContextObserver {
            inner: Arc::downgrade(&inner),
        });
        inner.context.add_observer(observer.clone());

        let network_task = tokio::spawn(watch_network(
            Arc::downgrade(&inner),
            inner.network.subscribe(),
        ));

        let init = inner.clone();
        inner.queue.schedule(async move { init.init().await });

        (
            Self {
                inner,
                observer,
                network_task,
            },
            events_rx,
        )
    }

    async fn run<T, F>(&self, operation: F) -> Result<T, BackgroundSyncError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.inner
            .queue
            .run(operation)
            .await
            .map_err(|_| BackgroundSyncError::Abort)
    }

    /// Register a one-shot sync for `registration_id`.
    ///
    /// Resolves once the registration is stored. Registering a tag that
    /// already exists returns the existing registration; if it is firing, it
    /// fires again once the current event finishes.
    pub async fn register(
        &self,
        registration_id: RegistrationId,
        options: BackgroundSyncRegistrationOptions,
    ) -> Result<BackgroundSyncRegistration, BackgroundSyncError> {
        let inner = self.inner.clone();
        self.run(async move { inner.register(registration_id, options).await })
            .await?
    }

    /// Registrations of `registration_id`, ordered by id.
    pub async fn get_registrations(
        &self,
        registration_id: RegistrationId,
    ) -> Result<Vec<BackgroundSyncRegistration>, BackgroundSyncError> {
        let inner = self.inner.clone();
        self.run(async move { inner.get_registrations(registration_id) })
            .await?
    }

    /// Fire everything that is ready and wait for the pass to finish.
    pub async fn fire_ready_events(&self) -> Result<(), BackgroundSyncError> {
        let inner = self.inner.clone();
        self.run(async move { inner.fire_ready_events().await }).await
    }

    /// Queue a firing pass after a connectivity change.
    pub fn on_network_changed(&self) {
        self.inner.schedule_fire();
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.is_disabled()
    }

    pub fn parameters(&self) -> &BackgroundSyncParameters {
        &self.inner.params
    }

    pub fn network(&self) -> &NetworkObserver {
        &self.inner.network
    }

    /// Time until something could fire, `None` when nothing is waiting.
    pub fn soonest_wakeup_delta(&self) -> Option<Duration> {
        self.inner.soonest_wakeup_delta()
    }

    /// Stop processing. Waiting callers resolve with `Abort`.
    pub fn shutdown(&self) {
        self.inner.queue.shutdown();
        self.inner.disarm_wake();
        self.network_task.abort();
    }
}

impl Drop for BackgroundSyncManager {
    fn drop(&mut self) {
        self.inner.context.remove_observer(&self.observer);
        self.shutdown();
    }
}

impl std::fmt::Debug for BackgroundSyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("BackgroundSyncManager")
            .field("disabled", &state.disabled)
            .field("owners", &state.owners.len())
            .field("num_firing", &state.num_firing)
            .field("queued", &self.inner.queue.len())
            .finish()
    }
}

// ==================== Operations ====================

impl ManagerInner {
    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) -> MutexGuard<'_, WakeTimer> {
        self.wake.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_disabled(&self) -> bool {
        self.state().disabled
    }

    fn emit(&self, event: BackgroundSyncEvent) {
        let _ = self.events.send(event);
    }

    fn schedule_fire(self: &Arc<Self>) {
        let inner = self.clone();
        self.queue.schedule(async move { inner.fire_ready_events().await });
    }

    fn schedule_event_complete(self: &Arc<Self>, job: FireJob, result: Result<(), ServiceWorkerError>) {
        let inner = self.clone();
        self.queue
            .schedule(async move { inner.event_complete(job, result).await });
    }

    /// Load stored registrations, then fire whatever is ready.
    async fn init(self: &Arc<Self>) {
        if let Err(err) = self.params.validate() {
            error!(error = %err, "Invalid background sync parameters");
            self.state().disabled = true;
            return;
        }
        if self.params.disable {
            info!("Background sync disabled by parameters");
            self.state().disabled = true;
            return;
        }

        let documents = match self
            .context
            .get_user_data_for_all_registrations(BACKGROUND_SYNC_USER_DATA_KEY)
            .await
        {
            Ok(documents) => documents,
            Err(err) => {
                error!(error = %err, "Failed to load background sync registrations");
                self.disable_and_clear().await;
                return;
            }
        };

        let mut owners = HashMap::new();
        for (owner, bytes) in documents {
            let document: StoredRegistrations = match serde_json::from_slice(&bytes) {
                Ok(document) => document,
                Err(err) => {
                    warn!(registration_id = %owner, error = %err, "Skipping undecodable sync registrations");
                    continue;
                }
            };
            let Some(registrations) = OwnerRegistrations::from_document(document) else {
                error!(registration_id = %owner, "Stored sync registration id is not below the next id");
                self.disable_and_clear().await;
                return;
            };
            owners.insert(owner, registrations);
        }

        let loaded: usize = owners.values().map(|o| o.registrations.len()).sum();
        info!(owners = owners.len(), registrations = loaded, "Background sync registrations loaded");
        self.state().owners = owners;

        self.fire_ready_events().await;
    }

    /// Disable the manager and delete every owner's stored registrations.
    async fn disable_and_clear(&self) {
        {
            let mut state = self.state();
            state.disabled = true;
            state.owners.clear();
        }
        self.disarm_wake();
        error!("Background sync disabled");
        self.emit(BackgroundSyncEvent::Disabled);

        let documents = match self
            .context
            .get_user_data_for_all_registrations(BACKGROUND_SYNC_USER_DATA_KEY)
            .await
        {
            Ok(documents) => documents,
            Err(err) => {
                warn!(error = %err, "Could not list sync registrations to clear");
                return;
            }
        };
        for (owner, _) in documents {
            if let Err(err) = self
                .context
                .clear_user_data(owner, vec![BACKGROUND_SYNC_USER_DATA_KEY.to_string()])
                .await
            {
                warn!(registration_id = %owner, error = %err, "Could not clear sync registrations");
            }
        }
    }

    async fn register(
        self: &Arc<Self>,
        owner: RegistrationId,
        options: BackgroundSyncRegistrationOptions,
    ) -> Result<BackgroundSyncRegistration, BackgroundSyncError> {
        if self.is_disabled() {
            return Err(BackgroundSyncError::StorageError);
        }
        if options.tag.len() > MAX_TAG_LENGTH {
            return Err(BackgroundSyncError::NotAllowed(format!(
                "tag is longer than {} bytes",
                MAX_TAG_LENGTH
            )));
        }

        let registration = self
            .context
            .live_registration(owner)
            .await
            .ok_or(BackgroundSyncError::NoServiceWorker)?;
        if registration.active_version().is_none() {
            return Err(BackgroundSyncError::NoServiceWorker);
        }

        let origin = registration.scope().origin();
        if !self.context.has_active_top_level_client(&origin).await {
            return Err(BackgroundSyncError::NotAllowed(
                "no top-level window for the origin".into(),
            ));
        }
        if self.permissions.permission_status(&origin).await == PermissionStatus::Denied {
            return Err(BackgroundSyncError::PermissionDenied);
        }

        let now = self.clock.now();
        let created = {
            let mut state = self.state();
            let entry = state
                .owners
                .entry(owner)
                .or_insert_with(|| OwnerRegistrations::new(origin.ascii_serialization()));

            if let Some(existing) = entry.registrations.get_mut(&options.tag) {
                if existing.state == SyncState::Firing {
                    existing.state = SyncState::ReregisteredWhileFiring;
                }
                debug!(registration_id = %owner, tag = %options.tag, state = ?existing.state, "Tag already registered");
                return Ok(existing.clone());
            }

            let id = entry.allocate_id();
            let created = BackgroundSyncRegistration::new(id, options, now);
            entry
                .registrations
                .insert(created.options.tag.clone(), created.clone());
            created
        };

        if let Err(err) = self.store(owner).await {
            return Err(self.handle_store_failure(owner, err).await);
        }

        info!(registration_id = %owner, tag = %created.tag(), id = created.id(), "Sync registered");
        self.emit(BackgroundSyncEvent::Registered {
            registration_id: owner,
            tag: created.tag().to_string(),
            id: created.id(),
        });
        self.schedule_fire();
        Ok(created)
    }

    fn get_registrations(
        &self,
        owner: RegistrationId,
    ) -> Result<Vec<BackgroundSyncRegistration>, BackgroundSyncError> {
        let state = self.state();
        if state.disabled {
            return Err(BackgroundSyncError::StorageError);
        }

        let mut registrations: Vec<_> = state
            .owners
            .get(&owner)
            .map(|o| o.registrations.values().cloned().collect())
            .unwrap_or_default();
        registrations.sort_by_key(|r| r.id);
        Ok(registrations)
    }

    /// Write `owner`'s registrations to user data.
    async fn store(&self, owner: RegistrationId) -> Result<(), ServiceWorkerError> {
        let document = self
            .state()
            .owners
            .get(&owner)
            .map(OwnerRegistrations::to_document);

        match document {
            Some(document) => {
                let bytes = serde_json::to_vec(&document)
                    .map_err(|e| ServiceWorkerError::Storage(e.to_string()))?;
                self.context
                    .store_user_data(owner, BACKGROUND_SYNC_USER_DATA_KEY, bytes)
                    .await
            }
            None => {
                self.context
                    .clear_user_data(owner, vec![BACKGROUND_SYNC_USER_DATA_KEY.to_string()])
                    .await
            }
        }
    }

    /// A missing owner drops its state; any other failure disables the
    /// manager.
    async fn handle_store_failure(&self, owner: RegistrationId, err: ServiceWorkerError) -> BackgroundSyncError {
        match err {
            ServiceWorkerError::NotFound(_) => {
                warn!(registration_id = %owner, "Service worker registration went away while storing");
                self.state().owners.remove(&owner);
            }
            other => {
                error!(registration_id = %owner, error = %other, "Failed to store sync registrations");
                self.disable_and_clear().await;
            }
        }
        BackgroundSyncError::StorageError
    }

    // ==================== Firing ====================

    fn take_ready(&self) -> Vec<FireJob> {
        let now = self.clock.now();
        let max_attempts = self.params.max_sync_attempts;

        let mut state = self.state();
        let mut jobs = Vec::new();
        for (owner, registrations) in state.owners.iter_mut() {
            for registration in registrations.registrations.values_mut() {
                if !registration.is_due(now)
                    || !self
                        .network
                        .network_sufficient(registration.options.network_state)
                {
                    continue;
                }
                registration.state = SyncState::Firing;
                jobs.push(FireJob {
                    owner: *owner,
                    id: registration.id,
                    tag: registration.options.tag.clone(),
                    last_chance: registration.num_attempts + 1 >= max_attempts,
                });
            }
        }
        state.num_firing += jobs.len();

        jobs.sort_by(|a, b| (a.owner, a.id).cmp(&(b.owner, b.id)));
        jobs
    }

    /// Dispatch every ready registration.
    ///
    /// The pass ends once every worker involved is running; event results
    /// arrive later as queued operations.
    async fn fire_ready_events(self: &Arc<Self>) {
        if self.is_disabled() {
            return;
        }

        let jobs = self.take_ready();
        if !jobs.is_empty() {
            debug!(count = jobs.len(), "Firing sync events");

            let started = join_all(jobs.iter().map(|job| self.start_worker_for(job.owner))).await;
            for (job, started) in jobs.into_iter().zip(started) {
                match started {
                    Ok(version) => self.dispatch(job, version),
                    Err(err) => {
                        warn!(registration_id = %job.owner, tag = %job.tag, error = %err, "No worker for sync event");
                        self.schedule_event_complete(job, Err(err));
                    }
                }
            }
        }

        self.run_in_background_if_necessary();
    }

    async fn start_worker_for(&self, owner: RegistrationId) -> Result<ServiceWorkerVersion, ServiceWorkerError> {
        let version = self
            .context
            .live_registration(owner)
            .await
            .and_then(|r| r.active_version())
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("active version of {}", owner)))?;
        version.start_worker().await?;
        Ok(version)
    }

    fn dispatch(self: &Arc<Self>, job: FireJob, version: ServiceWorkerVersion) {
        debug!(registration_id = %job.owner, tag = %job.tag, last_chance = job.last_chance, "Dispatching sync event");
        self.emit(BackgroundSyncEvent::Fired {
            registration_id: job.owner,
            tag: job.tag.clone(),
            last_chance: job.last_chance,
        });

        let inner = self.clone();
        let timeout = self.params.max_sync_event_duration;
        tokio::spawn(async move {
            let event = version.dispatch_sync_event(job.tag.clone(), job.last_chance);
            let result = match with_timeout(timeout, event).await {
                Ok(result) => result,
                Err(err) => Err(ServiceWorkerError::Failed(err.to_string())),
            };
            inner.schedule_event_complete(job, result);
        });
    }

    async fn event_complete(self: &Arc<Self>, job: FireJob, result: Result<(), ServiceWorkerError>) {
        {
            let mut state = self.state();
            state.num_firing = state.num_firing.saturating_sub(1);
        }
        if self.is_disabled() {
            return;
        }
        if let Err(ref err) = result {
            debug!(registration_id = %job.owner, tag = %job.tag, error = %err, "Sync event failed");
        }

        let Some(outcome) = self.apply_completion(&job, result.is_ok()) else {
            debug!(registration_id = %job.owner, tag = %job.tag, "Completed registration no longer exists");
            self.schedule_fire();
            return;
        };

        if let Err(err) = self.store(job.owner).await {
            self.handle_store_failure(job.owner, err).await;
            if !self.is_disabled() {
                self.schedule_fire();
            }
            return;
        }

        info!(registration_id = %job.owner, tag = %job.tag, ?outcome, "Sync event completed");
        self.emit(BackgroundSyncEvent::Completed {
            registration_id: job.owner,
            tag: job.tag,
            outcome,
        });
        self.schedule_fire();
    }

    /// Count the attempt and decide the registration's fate.
    fn apply_completion(&self, job: &FireJob, succeeded: bool) -> Option<CompletionOutcome> {
        let now = self.clock.now();
        let mut state = self.state();
        let owner = state.owners.get_mut(&job.owner)?;
        let registration = owner
            .registrations
            .get_mut(&job.tag)
            .filter(|r| r.id == job.id)?;

        registration.num_attempts += 1;

        if registration.state == SyncState::ReregisteredWhileFiring {
            registration.state = SyncState::Pending;
            registration.num_attempts = 0;
            return Some(CompletionOutcome::Reregistered);
        }

        if !succeeded && registration.num_attempts < self.params.max_sync_attempts {
            let delay = self.backoff.delay_for_failures(registration.num_attempts);
            registration.state = SyncState::Pending;
            registration.delay_until = now.checked_add(delay).unwrap_or_else(|| {
                warn!(registration_id = %job.owner, tag = %job.tag, ?delay, "Retry time out of range, retrying now");
                now
            });
            return Some(CompletionOutcome::RetryScheduled { delay });
        }

        owner.registrations.remove(&job.tag);
        Some(if succeeded {
            CompletionOutcome::Succeeded
        } else {
            CompletionOutcome::AttemptsExhausted
        })
    }

    // ==================== Wake-up ====================

    fn soonest_wakeup_delta(&self) -> Option<Duration> {
        let now = self.clock.now();
        let state = self.state();

        let mut soonest: Option<Duration> = None;
        for registration in state.owners.values().flat_map(|o| o.registrations.values()) {
            if registration.state != SyncState::Pending {
                continue;
            }
            let delta = registration
                .delay_until
                .duration_since(now)
                .unwrap_or(Duration::ZERO);
            soonest = Some(soonest.map_or(delta, |s| s.min(delta)));
        }

        // Check back on in-flight events even if nothing else is waiting.
        if state.num_firing > 0 {
            let recovery = self.params.min_sync_recovery_time;
            soonest = Some(soonest.map_or(recovery, |s| s.min(recovery)));
        }
        soonest
    }

    fn run_in_background_if_necessary(self: &Arc<Self>) {
        match self.soonest_wakeup_delta() {
            Some(delay) => {
                if delay.is_zero() {
                    self.disarm_wake();
                } else {
                    self.arm_wake(delay);
                }
                trace!(?delay, "Running in background");
                self.scheduler.run_in_background(true, delay);
            }
            None => {
                self.disarm_wake();
                self.scheduler.run_in_background(false, Duration::ZERO);
            }
        }
    }

    fn arm_wake(self: &Arc<Self>, delay: Duration) {
        let mut wake = self.wake();
        if let Some(handle) = wake.handle.take() {
            handle.abort();
        }
        wake.generation += 1;

        let generation = wake.generation;
        let weak = Arc::downgrade(self);
        wake.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.wake().generation != generation {
                return;
            }
            debug!("Wake-up timer fired");
            inner.schedule_fire();
        }));
    }

    fn disarm_wake(&self) {
        let mut wake = self.wake();
        if let Some(handle) = wake.handle.take() {
            handle.abort();
        }
        wake.generation += 1;
    }

    // ==================== Context notifications ====================

    fn registration_deleted(&self, owner: RegistrationId) {
        if self.state().owners.remove(&owner).is_some() {
            debug!(registration_id = %owner, "Dropped sync registrations of deleted registration");
        }
    }

    async fn storage_wiped(self: &Arc<Self>) {
        {
            let mut state = self.state();
            state.owners.clear();
            state.disabled = false;
        }
        self.disarm_wake();
        info!("Storage wiped; reloading background sync registrations");
        self.init().await;
    }
}

struct ContextObserver {
    inner: Weak<ManagerInner>,
}

impl ServiceWorkerContextObserver for ContextObserver {
    fn on_registration_deleted(&self, registration_id: RegistrationId) {
        if let Some(inner) = self.inner.upgrade() {
            let op = inner.clone();
            inner
                .queue
                .schedule(async move { op.registration_deleted(registration_id) });
        }
    }

    fn on_storage_wiped(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let op = inner.clone();
            inner.queue.schedule(async move { op.storage_wiped().await });
        }
    }
}

async fn watch_network(inner: Weak<ManagerInner>, mut changes: watch::Receiver<ConnectionType>) {
    while changes.changed().await.is_ok() {
        let connection = *changes.borrow_and_update();
        let Some(inner) = inner.upgrade() else {
            break;
        };
        debug!(?connection, "Network changed");
        inner.schedule_fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collaborators::{FixedPermission, NoopBackgroundRunScheduler};
    use rustkit_sw::testing::TestWorkerHost;
    use rustkit_sw::MemoryUserDataStorage;
    use std::time::SystemTime;

    struct Fixture {
        _host: Arc<TestWorkerHost>,
        clock: Arc<ManualClock>,
        manager: BackgroundSyncManager,
    }

    fn fixture(params: BackgroundSyncParameters) -> Fixture {
        let host = TestWorkerHost::new();
        let (context, _events) = host.create_context(Arc::new(MemoryUserDataStorage::new()));
        let clock = Arc::new(ManualClock::default());
        let (manager, _events) = BackgroundSyncManager::new(
            context,
            Arc::new(FixedPermission::granted()),
            Arc::new(NoopBackgroundRunScheduler),
            NetworkObserver::new(ConnectionType::None),
            clock.clone(),
            params,
        );
        Fixture {
            _host: host,
            clock,
            manager,
        }
    }

    fn pending(id: u64, tag: &str, delay_until: SystemTime) -> BackgroundSyncRegistration {
        BackgroundSyncRegistration::new(id, BackgroundSyncRegistrationOptions::new(tag), delay_until)
    }

    fn seed(manager: &BackgroundSyncManager, registrations: Vec<BackgroundSyncRegistration>) {
        let mut owner = OwnerRegistrations::new("https://example.com".into());
        for registration in registrations {
            owner.next_id = owner.next_id.max(registration.id + 1);
            owner
                .registrations
                .insert(registration.tag().to_string(), registration);
        }
        manager.inner.state().owners.insert(RegistrationId(1), owner);
    }

    #[tokio::test]
    async fn test_soonest_wakeup_delta() {
        let f = fixture(BackgroundSyncParameters::default());
        f.manager.get_registrations(RegistrationId(1)).await.unwrap();
        assert_eq!(f.manager.soonest_wakeup_delta(), None);

        let now = f.clock.now();
        seed(
            &f.manager,
            vec![
                pending(0, "later", now + Duration::from_secs(60)),
                pending(1, "sooner", now + Duration::from_secs(10)),
            ],
        );
        assert_eq!(f.manager.soonest_wakeup_delta(), Some(Duration::from_secs(10)));

        f.clock.advance(Duration::from_secs(30));
        assert_eq!(f.manager.soonest_wakeup_delta(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_wakeup_capped_while_firing() {
        let f = fixture(BackgroundSyncParameters::default());
        f.manager.get_registrations(RegistrationId(1)).await.unwrap();

        let now = f.clock.now();
        seed(&f.manager, vec![pending(0, "far", now + Duration::from_secs(3600))]);
        f.manager.inner.state().num_firing = 1;

        assert_eq!(
            f.manager.soonest_wakeup_delta(),
            Some(f.manager.parameters().min_sync_recovery_time)
        );
    }

    #[tokio::test]
    async fn test_apply_completion_retries_then_exhausts() {
        let f = fixture(BackgroundSyncParameters::default());
        f.manager.get_registrations(RegistrationId(1)).await.unwrap();
        seed(&f.manager, vec![pending(0, "t", f.clock.now())]);

        let job = FireJob {
            owner: RegistrationId(1),
            id: 0,
            tag: "t".into(),
            last_chance: false,
        };

        assert_eq!(
            f.manager.inner.apply_completion(&job, false),
            Some(CompletionOutcome::RetryScheduled {
                delay: Duration::from_secs(300)
            })
        );
        assert_eq!(
            f.manager.inner.apply_completion(&job, false),
            Some(CompletionOutcome::RetryScheduled {
                delay: Duration::from_secs(900)
            })
        );
        assert_eq!(
            f.manager.inner.apply_completion(&job, false),
            Some(CompletionOutcome::AttemptsExhausted)
        );
        assert_eq!(f.manager.inner.apply_completion(&job, false), None);
    }

    #[tokio::test]
    async fn test_apply_completion_caps_retry_delay() {
        let params = BackgroundSyncParameters::from_json(
            r#"{"max_sync_attempts": 100, "retry_delay_factor": 10.0}"#,
        )
        .unwrap();
        let max_retry_delay = params.max_retry_delay;
        let f = fixture(params);
        f.manager.get_registrations(RegistrationId(1)).await.unwrap();

        let mut worn = pending(0, "t", f.clock.now());
        worn.num_attempts = 40;
        seed(&f.manager, vec![worn]);
        let job = FireJob {
            owner: RegistrationId(1),
            id: 0,
            tag: "t".into(),
            last_chance: false,
        };

        assert_eq!(
            f.manager.inner.apply_completion(&job, false),
            Some(CompletionOutcome::RetryScheduled {
                delay: max_retry_delay
            })
        );
        let registrations = f.manager.get_registrations(RegistrationId(1)).await.unwrap();
        assert_eq!(registrations[0].num_attempts(), 41);
        assert_eq!(registrations[0].delay_until(), f.clock.now() + max_retry_delay);
    }

    #[tokio::test]
    async fn test_apply_completion_ignores_replaced_registration() {
        let f = fixture(BackgroundSyncParameters::default());
        f.manager.get_registrations(RegistrationId(1)).await.unwrap();
        seed(&f.manager, vec![pending(4, "t", f.clock.now())]);

        let stale = FireJob {
            owner: RegistrationId(1),
            id: 3,
            tag: "t".into(),
            last_chance: false,
        };

        assert_eq!(f.manager.inner.apply_completion(&stale, true), None);
        assert_eq!(f.manager.get_registrations(RegistrationId(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_by_parameters() {
        let f = fixture(BackgroundSyncParameters {
            disable: true,
            ..Default::default()
        });

        assert_eq!(
            f.manager.get_registrations(RegistrationId(1)).await,
            Err(BackgroundSyncError::StorageError)
        );
        assert!(f.manager.is_disabled());
    }

    #[tokio::test]
    async fn test_invalid_parameters_disable() {
        for params in [
            BackgroundSyncParameters {
                max_sync_attempts: 0,
                ..Default::default()
            },
            BackgroundSyncParameters {
                retry_delay_factor: 0.5,
                ..Default::default()
            },
        ] {
            let f = fixture(params);
            assert_eq!(
                f.manager.get_registrations(RegistrationId(1)).await,
                Err(BackgroundSyncError::StorageError)
            );
            assert!(f.manager.is_disabled());
        }
    }

    #[tokio::test]
    async fn test_shutdown_aborts_callers() {
        let f = fixture(BackgroundSyncParameters::default());
        f.manager.shutdown();

        assert_eq!(
            f.manager.fire_ready_events().await,
            Err(BackgroundSyncError::Abort)
        );
    }
}
