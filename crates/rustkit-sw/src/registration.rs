//! A registration and its version slots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};
use url::Url;

use crate::version::ServiceWorkerVersion;
use crate::{RegistrationId, ServiceWorkerError, VersionStatus};

#[derive(Debug)]
struct Slots {
    script_url: Url,
    installing: Option<ServiceWorkerVersion>,
    waiting: Option<ServiceWorkerVersion>,
    active: Option<ServiceWorkerVersion>,
}

#[derive(Debug)]
struct RegistrationInner {
    id: RegistrationId,
    scope: Url,
    slots: Mutex<Slots>,
    uninstalled: AtomicBool,
}

/// Binding of a scope to a script, with installing/waiting/active versions.
///
/// Clones share the same registration. At most one version is `Active` at
/// any time: promotion deactivates the previous active version first.
#[derive(Debug, Clone)]
pub struct ServiceWorkerRegistration {
    inner: Arc<RegistrationInner>,
}

impl ServiceWorkerRegistration {
    pub fn new(id: RegistrationId, scope: Url, script_url: Url) -> Self {
        Self {
            inner: Arc::new(RegistrationInner {
                id,
                scope,
                slots: Mutex::new(Slots {
                    script_url,
                    installing: None,
                    waiting: None,
                    active: None,
                }),
                uninstalled: AtomicBool::new(false),
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> RegistrationId {
        self.inner.id
    }

    pub fn scope(&self) -> &Url {
        &self.inner.scope
    }

    /// Script of the most recently installed version.
    pub fn script_url(&self) -> Url {
        self.slots().script_url.clone()
    }

    pub fn installing_version(&self) -> Option<ServiceWorkerVersion> {
        self.slots().installing.clone()
    }

    pub fn waiting_version(&self) -> Option<ServiceWorkerVersion> {
        self.slots().waiting.clone()
    }

    pub fn active_version(&self) -> Option<ServiceWorkerVersion> {
        self.slots().active.clone()
    }

    /// Whether both handles refer to the same registration.
    pub fn same_as(&self, other: &ServiceWorkerRegistration) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_uninstalled(&self) -> bool {
        self.inner.uninstalled.load(Ordering::SeqCst)
    }

    /// Install `version` and move it to the waiting slot.
    ///
    /// The version goes `Installing`, dispatches the install event and lands
    /// in `Installed`. A failed install deactivates it. A version that was
    /// displaced while installing is deactivated and reported as `Abort`.
    pub async fn install(&self, version: ServiceWorkerVersion) -> Result<(), ServiceWorkerError> {
        if version.status() != VersionStatus::New {
            return Err(ServiceWorkerError::InvalidState(format!(
                "cannot install a {:?} version",
                version.status()
            )));
        }
        if self.is_uninstalled() {
            return Err(ServiceWorkerError::InvalidState(
                "registration is uninstalled".into(),
            ));
        }

        let displaced = self.slots().installing.replace(version.clone());
        if let Some(old) = displaced {
            old.deactivate();
        }
        version.set_status(VersionStatus::Installing);

        let result = version.dispatch_install_event().await;

        let superseded = {
            let mut slots = self.slots();
            let still_installing = slots
                .installing
                .as_ref()
                .is_some_and(|v| v.version_id() == version.version_id());
            if !still_installing {
                None
            } else {
                slots.installing = None;
                match result {
                    Ok(()) => {
                        slots.script_url = version.script_url().clone();
                        Some(slots.waiting.replace(version.clone()))
                    }
                    Err(_) => None,
                }
            }
        };

        match (result, superseded) {
            (Ok(()), Some(previous_waiting)) => {
                if let Some(old) = previous_waiting {
                    old.deactivate();
                }
                version.set_status(VersionStatus::Installed);
                info!(registration_id = %self.id(), version_id = %version.version_id(), "Version installed");
                Ok(())
            }
            (Ok(()), None) => {
                version.deactivate();
                Err(ServiceWorkerError::Abort)
            }
            (Err(err), _) => {
                warn!(registration_id = %self.id(), version_id = %version.version_id(), error = %err, "Install failed");
                version.deactivate();
                Err(err)
            }
        }
    }

    /// Promote the waiting version and dispatch its activate event.
    ///
    /// The version ends `Active` whatever the event's outcome; the outcome is
    /// still returned.
    pub async fn activate(&self) -> Result<(), ServiceWorkerError> {
        let version = self.promote_waiting(VersionStatus::Activating)?;

        let result = version.dispatch_activate_event().await;
        if let Err(ref err) = result {
            warn!(registration_id = %self.id(), version_id = %version.version_id(), error = %err, "Activate event failed");
        }
        if version.status() == VersionStatus::Activating {
            version.set_status(VersionStatus::Active);
        }
        result
    }

    /// Swap the waiting version in as the active one, without an activate
    /// event.
    pub fn activate_waiting_version(&self) -> Result<ServiceWorkerVersion, ServiceWorkerError> {
        self.promote_waiting(VersionStatus::Active)
    }

    fn promote_waiting(&self, status: VersionStatus) -> Result<ServiceWorkerVersion, ServiceWorkerError> {
        let (incoming, outgoing) = {
            let mut slots = self.slots();
            let Some(waiting) = slots.waiting.take() else {
                return Err(ServiceWorkerError::InvalidState(
                    "no waiting version".into(),
                ));
            };
            let outgoing = slots.active.replace(waiting.clone());
            (waiting, outgoing)
        };

        if let Some(old) = outgoing {
            old.deactivate();
        }
        incoming.set_status(status);
        info!(registration_id = %self.id(), version_id = %incoming.version_id(), ?status, "Waiting version promoted");
        Ok(incoming)
    }

    /// Deactivate every version and mark the registration uninstalled.
    pub fn unregister(&self) {
        self.inner.uninstalled.store(true, Ordering::SeqCst);
        let versions = {
            let mut slots = self.slots();
            [
                slots.installing.take(),
                slots.waiting.take(),
                slots.active.take(),
            ]
        };
        for version in versions.into_iter().flatten() {
            version.deactivate();
        }
        info!(registration_id = %self.id(), "Registration unregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EventOutcome, TestWorkerHost};
    use crate::{ServiceWorkerConfig, VersionId};
    use rustkit_worker::{WorkerRegistry, WorkerStatus};
    use tokio::sync::mpsc;

    struct Fixture {
        host: Arc<TestWorkerHost>,
        registry: Arc<WorkerRegistry>,
        registration: ServiceWorkerRegistration,
        next_version: u64,
    }

    impl Fixture {
        fn new() -> Self {
            let host = TestWorkerHost::new();
            let registry = host.create_registry();
            let registration = ServiceWorkerRegistration::new(
                RegistrationId(1),
                Url::parse("https://example.com/").unwrap(),
                Url::parse("https://example.com/sw.js").unwrap(),
            );
            Self {
                host,
                registry,
                registration,
                next_version: 1,
            }
        }

        fn version(&mut self) -> ServiceWorkerVersion {
            let id = VersionId(self.next_version);
            self.next_version += 1;
            let (tx, _rx) = mpsc::unbounded_channel();
            ServiceWorkerVersion::new(
                id,
                self.registration.id(),
                self.registration.scope().clone(),
                Url::parse(&format!("https://example.com/sw.js?v={}", id)).unwrap(),
                self.registry.create_worker(),
                ServiceWorkerConfig::default(),
                tx,
            )
        }
    }

    fn active_count(versions: &[&ServiceWorkerVersion]) -> usize {
        versions
            .iter()
            .filter(|v| v.status() == VersionStatus::Active)
            .count()
    }

    #[tokio::test]
    async fn test_install_then_activate() {
        let mut fixture = Fixture::new();
        let version = fixture.version();

        fixture.registration.install(version.clone()).await.unwrap();
        assert_eq!(version.status(), VersionStatus::Installed);
        assert!(fixture.registration.installing_version().is_none());
        assert!(fixture.registration.waiting_version().is_some());
        assert_eq!(fixture.registration.script_url(), *version.script_url());

        fixture.registration.activate().await.unwrap();
        assert_eq!(version.status(), VersionStatus::Active);
        assert!(fixture.registration.waiting_version().is_none());
        assert_eq!(
            fixture
                .registration
                .active_version()
                .map(|v| v.version_id()),
            Some(version.version_id())
        );
    }

    #[tokio::test]
    async fn test_install_failure_deactivates() {
        let mut fixture = Fixture::new();
        fixture.host.set_install_outcome(EventOutcome::Reject);
        let version = fixture.version();

        let result = fixture.registration.install(version.clone()).await;

        assert_eq!(result, Err(ServiceWorkerError::InstallWorkerFailed));
        assert_eq!(version.status(), VersionStatus::Deactivated);
        assert!(fixture.registration.waiting_version().is_none());
    }

    #[tokio::test]
    async fn test_activate_lands_active_even_if_event_rejected() {
        let mut fixture = Fixture::new();
        fixture.host.set_activate_outcome(EventOutcome::Reject);
        let version = fixture.version();
        fixture.registration.install(version.clone()).await.unwrap();

        let result = fixture.registration.activate().await;

        assert_eq!(result, Err(ServiceWorkerError::ActivateWorkerFailed));
        assert_eq!(version.status(), VersionStatus::Active);
    }

    #[tokio::test]
    async fn test_activate_waiting_version_swaps() {
        let mut fixture = Fixture::new();
        let first = fixture.version();
        fixture.registration.install(first.clone()).await.unwrap();
        fixture.registration.activate_waiting_version().unwrap();

        let second = fixture.version();
        fixture.registration.install(second.clone()).await.unwrap();
        assert_eq!(active_count(&[&first, &second]), 1);

        let promoted = fixture.registration.activate_waiting_version().unwrap();

        assert_eq!(promoted.version_id(), second.version_id());
        assert_eq!(first.status(), VersionStatus::Deactivated);
        assert_eq!(second.status(), VersionStatus::Active);
        assert_eq!(active_count(&[&first, &second]), 1);
    }

    #[tokio::test]
    async fn test_activate_without_waiting_fails() {
        let fixture = Fixture::new();

        assert!(matches!(
            fixture.registration.activate_waiting_version(),
            Err(ServiceWorkerError::InvalidState(_))
        ));
        assert!(fixture.registration.activate().await.is_err());
    }

    #[tokio::test]
    async fn test_unregister_deactivates_all() {
        let mut fixture = Fixture::new();
        let active = fixture.version();
        fixture.registration.install(active.clone()).await.unwrap();
        fixture.registration.activate().await.unwrap();
        let waiting = fixture.version();
        fixture.registration.install(waiting.clone()).await.unwrap();

        fixture.registration.unregister();

        assert!(fixture.registration.is_uninstalled());
        assert_eq!(active.status(), VersionStatus::Deactivated);
        assert_eq!(waiting.status(), VersionStatus::Deactivated);
        assert!(fixture.registration.active_version().is_none());
        assert_ne!(active.running_status(), WorkerStatus::Running);

        let late = fixture.version();
        assert!(fixture.registration.install(late).await.is_err());
    }
}
