//! The service worker context: registrations, clients and user data.

use hashbrown::HashMap;
use rustkit_worker::WorkerRegistry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::{Origin, Url};

use crate::client::{Client, Clients};
use crate::registration::ServiceWorkerRegistration;
use crate::storage::UserDataStorage;
use crate::version::ServiceWorkerVersion;
use crate::{
    ClientId, RegistrationId, ServiceWorkerConfig, ServiceWorkerError, ServiceWorkerEvent,
    VersionId,
};

/// Lifecycle notifications for components keeping per-registration state.
pub trait ServiceWorkerContextObserver: Send + Sync {
    /// A registration was unregistered and its user data deleted.
    fn on_registration_deleted(&self, _registration_id: RegistrationId) {}

    /// Every registration and all user data were wiped.
    fn on_storage_wiped(&self) {}
}

/// Owner of every registration in a browser profile.
pub struct ServiceWorkerContext {
    registry: Arc<WorkerRegistry>,
    storage: Arc<dyn UserDataStorage>,
    config: ServiceWorkerConfig,
    next_registration_id: AtomicU64,
    next_version_id: AtomicU64,

    /// Live registrations by id.
    registrations: RwLock<HashMap<RegistrationId, ServiceWorkerRegistration>>,

    /// Pages and workers that could be controlled.
    clients: RwLock<Clients>,

    observers: Mutex<Vec<Arc<dyn ServiceWorkerContextObserver>>>,

    /// Event sender for lifecycle changes.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContext {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        storage: Arc<dyn UserDataStorage>,
        config: ServiceWorkerConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Arc::new(Self {
                registry,
                storage,
                config,
                next_registration_id: AtomicU64::new(1),
                next_version_id: AtomicU64::new(1),
                registrations: RwLock::new(HashMap::new()),
                clients: RwLock::new(Clients::new()),
                observers: Mutex::new(Vec::new()),
                event_tx,
            }),
            event_rx,
        )
    }

    pub fn worker_registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServiceWorkerConfig {
        &self.config
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn observers(&self) -> MutexGuard<'_, Vec<Arc<dyn ServiceWorkerContextObserver>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ==================== Registrations ====================

    /// Register `script_url` for `scope`, then install and activate it.
    ///
    /// Registering an existing scope installs a new version into the same
    /// registration; the old active version is deactivated when the new one
    /// is promoted.
    pub async fn register(
        &self,
        scope: Url,
        script_url: Url,
    ) -> Result<ServiceWorkerRegistration, ServiceWorkerError> {
        if scope.origin() != script_url.origin() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "script {} is not same-origin with scope {}",
                script_url, scope
            )));
        }

        let (registration, created) = {
            let mut registrations = self.registrations.write().await;
            match registrations.values().find(|r| *r.scope() == scope) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let id = RegistrationId(self.next_registration_id.fetch_add(1, Ordering::Relaxed));
                    let registration =
                        ServiceWorkerRegistration::new(id, scope.clone(), script_url.clone());
                    registrations.insert(id, registration.clone());
                    (registration, true)
                }
            }
        };
        debug!(registration_id = %registration.id(), %scope, created, "Registering");

        let version = self.create_version(&registration, script_url);
        if let Err(err) = registration.install(version).await {
            if created && registration.active_version().is_none() {
                self.forget(&registration).await;
            }
            return Err(err);
        }

        self.emit(ServiceWorkerEvent::RegistrationStored {
            registration_id: registration.id(),
            scope: scope.clone(),
        });

        if let Err(err) = registration.activate().await {
            warn!(registration_id = %registration.id(), error = %err, "Activation finished with error");
        }

        info!(registration_id = %registration.id(), %scope, "Registered");
        Ok(registration)
    }

    fn create_version(&self, registration: &ServiceWorkerRegistration, script_url: Url) -> ServiceWorkerVersion {
        let version_id = VersionId(self.next_version_id.fetch_add(1, Ordering::Relaxed));
        ServiceWorkerVersion::new(
            version_id,
            registration.id(),
            registration.scope().clone(),
            script_url,
            self.registry.create_worker(),
            self.config.clone(),
            self.event_tx.clone(),
        )
    }

    async fn forget(&self, registration: &ServiceWorkerRegistration) {
        let mut registrations = self.registrations.write().await;
        let same = registrations
            .get(&registration.id())
            .is_some_and(|r| r.same_as(registration));
        if same {
            registrations.remove(&registration.id());
            debug!(registration_id = %registration.id(), "Dropped registration that never installed");
        }
    }

    /// The registration with `id`, unless it was unregistered.
    pub async fn live_registration(&self, id: RegistrationId) -> Option<ServiceWorkerRegistration> {
        self.registrations
            .read()
            .await
            .get(&id)
            .filter(|r| !r.is_uninstalled())
            .cloned()
    }

    /// Every live registration, ordered by id.
    pub async fn registrations(&self) -> Vec<ServiceWorkerRegistration> {
        let mut all: Vec<_> = self.registrations.read().await.values().cloned().collect();
        all.sort_by_key(|r| r.id());
        all
    }

    /// The registration whose scope is the longest prefix of `url`.
    pub async fn find_registration_for_document(&self, url: &Url) -> Option<ServiceWorkerRegistration> {
        self.registrations
            .read()
            .await
            .values()
            .filter(|r| !r.is_uninstalled() && url.as_str().starts_with(r.scope().as_str()))
            .max_by_key(|r| r.scope().as_str().len())
            .cloned()
    }

    /// Unregister `id` and delete its user data.
    ///
    /// Returns `Ok(false)` when no such registration exists. Observers are
    /// told even if the user data could not be deleted.
    pub async fn unregister(&self, id: RegistrationId) -> Result<bool, ServiceWorkerError> {
        let Some(registration) = self.registrations.write().await.remove(&id) else {
            return Ok(false);
        };
        registration.unregister();

        let deleted = self.storage.delete_owner(id).await;
        if let Err(ref err) = deleted {
            warn!(registration_id = %id, error = %err, "Failed to delete user data");
        }

        let observers = self.observers().clone();
        for observer in observers {
            observer.on_registration_deleted(id);
        }
        self.emit(ServiceWorkerEvent::RegistrationDeleted { registration_id: id });

        deleted?;
        Ok(true)
    }

    /// Unregister everything and wipe user data storage.
    pub async fn wipe_storage(&self) -> Result<(), ServiceWorkerError> {
        let removed: Vec<_> = self.registrations.write().await.drain().map(|(_, r)| r).collect();
        for registration in &removed {
            registration.unregister();
        }

        self.storage.wipe().await?;
        info!(registrations = removed.len(), "Storage wiped");

        let observers = self.observers().clone();
        for observer in observers {
            observer.on_storage_wiped();
        }
        self.emit(ServiceWorkerEvent::StorageWiped);
        Ok(())
    }

    // ==================== Clients ====================

    pub async fn add_client(&self, client: Client) {
        debug!(client_id = %client.id, url = %client.url, "Client added");
        self.clients.write().await.add(client);
    }

    pub async fn remove_client(&self, id: &ClientId) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    /// Whether `origin` has an open top-level window.
    pub async fn has_active_top_level_client(&self, origin: &Origin) -> bool {
        self.clients.read().await.has_top_level_window(origin)
    }

    // ==================== User data ====================

    /// Store `data` under `key` for a live registration.
    pub async fn store_user_data(
        &self,
        id: RegistrationId,
        key: &str,
        data: Vec<u8>,
    ) -> Result<(), ServiceWorkerError> {
        if self.live_registration(id).await.is_none() {
            return Err(ServiceWorkerError::NotFound(format!("registration {}", id)));
        }
        self.storage.put(id, key.to_string(), data).await?;
        Ok(())
    }

    /// Every registration's value for `key`, ordered by registration id.
    pub async fn get_user_data_for_all_registrations(
        &self,
        key: &str,
    ) -> Result<Vec<(RegistrationId, Vec<u8>)>, ServiceWorkerError> {
        Ok(self.storage.get_all(key.to_string()).await?)
    }

    pub async fn clear_user_data(&self, id: RegistrationId, keys: Vec<String>) -> Result<(), ServiceWorkerError> {
        self.storage.delete(id, keys).await?;
        Ok(())
    }

    // ==================== Observers ====================

    pub fn add_observer(&self, observer: Arc<dyn ServiceWorkerContextObserver>) {
        self.observers().push(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn ServiceWorkerContextObserver>) {
        self.observers().retain(|o| !Arc::ptr_eq(o, observer));
    }
}

impl std::fmt::Debug for ServiceWorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorkerContext")
            .field("config", &self.config)
            .field("observers", &self.observers().len())
            .finish_non_exhaustive()
    }
}
