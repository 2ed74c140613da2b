//! # RustKit Background Sync
//!
//! Durable, retried sync events for service worker registrations.
//!
//! ## Features
//!
//! - **Registration**: tagged one-shot sync registrations per service worker
//!   registration, persisted as user data
//! - **Firing**: registrations fire once their delay has passed and the
//!   network satisfies their requirement
//! - **Retry**: failed events are retried with exponential backoff until the
//!   attempt budget runs out
//! - **Recovery**: persisted registrations are reloaded at startup; corrupt
//!   data disables the manager and clears storage
//!
//! ## Architecture
//!
//! ```text
//! BackgroundSyncManager
//!     │
//!     ├── OperationQueue (one mutation at a time)
//!     ├── ServiceWorkerContext (rustkit-sw)
//!     │       ├── live registrations / active versions
//!     │       └── user data storage
//!     ├── NetworkObserver
//!     ├── PermissionChecker
//!     ├── BackgroundRunScheduler
//!     └── Clock
//! ```

use rustkit_sw::{RegistrationId, ServiceWorkerError};
use std::time::Duration;
use thiserror::Error;

pub mod clock;
pub mod collaborators;
pub mod manager;
pub mod network;
pub mod params;
pub mod registration;

mod persist;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    BackgroundRunScheduler, FixedPermission, NoopBackgroundRunScheduler, PermissionChecker,
    PermissionStatus,
};
pub use manager::BackgroundSyncManager;
pub use network::{ConnectionType, NetworkObserver};
pub use params::BackgroundSyncParameters;
pub use registration::{
    BackgroundSyncRegistration, BackgroundSyncRegistrationOptions, SyncNetworkState, SyncState,
};

/// User data key the registrations of one owner are stored under.
pub const BACKGROUND_SYNC_USER_DATA_KEY: &str = "BackgroundSyncUserData";

/// Longest accepted tag, in bytes.
pub const MAX_TAG_LENGTH: usize = 10240;

// ==================== Errors ====================

/// Failure statuses of background sync operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackgroundSyncError {
    #[error("Background sync storage error")]
    StorageError,

    #[error("Not found")]
    NotFound,

    #[error("Not allowed: {0}")]
    NotAllowed(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("No service worker")]
    NoServiceWorker,

    #[error("Operation aborted")]
    Abort,
}

impl From<ServiceWorkerError> for BackgroundSyncError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::Abort => BackgroundSyncError::Abort,
            ServiceWorkerError::NotFound(_) => BackgroundSyncError::NotFound,
            _ => BackgroundSyncError::StorageError,
        }
    }
}

// ==================== Events ====================

/// What became of a registration after one of its events finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The event succeeded and the registration was removed.
    Succeeded,
    /// The event failed and will be retried after `delay`.
    RetryScheduled { delay: Duration },
    /// The event failed on its last attempt and the registration was removed.
    AttemptsExhausted,
    /// The tag was registered again while firing; attempts start over.
    Reregistered,
}

/// Notifications from the background sync manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundSyncEvent {
    /// A new registration was stored.
    Registered {
        registration_id: RegistrationId,
        tag: String,
        id: u64,
    },
    /// A sync event was dispatched.
    Fired {
        registration_id: RegistrationId,
        tag: String,
        last_chance: bool,
    },
    /// A dispatched event finished and its result was stored.
    Completed {
        registration_id: RegistrationId,
        tag: String,
        outcome: CompletionOutcome,
    },
    /// The manager disabled itself after a storage failure.
    Disabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            BackgroundSyncError::from(ServiceWorkerError::NotFound("3".into())),
            BackgroundSyncError::NotFound
        );
        assert_eq!(
            BackgroundSyncError::from(ServiceWorkerError::Storage("disk".into())),
            BackgroundSyncError::StorageError
        );
        assert_eq!(
            BackgroundSyncError::from(ServiceWorkerError::Abort),
            BackgroundSyncError::Abort
        );
    }
}
