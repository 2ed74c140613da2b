//! # RustKit Service Workers
//!
//! Browser-side control plane for service workers.
//!
//! ## Features
//!
//! - **Versions**: start/stop of the embedded worker, event dispatch with
//!   per-event request tracking, controllees and idle stop
//! - **Registrations**: installing/waiting/active slots and the activate swap
//! - **Context**: registration lookup, clients, user data storage and
//!   lifecycle observers
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContext
//!     │
//!     ├── WorkerRegistry (rustkit-worker)
//!     ├── UserDataStorage
//!     └── ServiceWorkerRegistration
//!             ├── installing (ServiceWorkerVersion)
//!             ├── waiting (ServiceWorkerVersion)
//!             └── active (ServiceWorkerVersion)
//!                     └── EmbeddedWorker
//! ```

use rustkit_common::{serde_helpers::duration_ms, RustKitError};
use rustkit_worker::WorkerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod client;
pub mod context;
pub mod messages;
pub mod pending;
pub mod registration;
pub mod storage;
pub mod version;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use client::{Client, ClientType, Clients, FrameType, VisibilityState};
pub use context::{ServiceWorkerContext, ServiceWorkerContextObserver};
pub use messages::{
    EventResult, FetchEventResult, FetchRequest, FetchResponse, ServiceWorkerMessage,
    ServiceWorkerReply,
};
pub use pending::{PendingRequests, RequestId};
pub use registration::ServiceWorkerRegistration;
pub use storage::{MemoryUserDataStorage, UserDataStorage};
pub use version::ServiceWorkerVersion;

// ==================== Errors ====================

/// Failure statuses reported by service worker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    #[error("Operation aborted")]
    Abort,

    #[error("Start worker failed: {0}")]
    StartWorkerFailed(String),

    #[error("IPC failed: {0}")]
    IpcFailed(String),

    #[error("Process not found")]
    ProcessNotFound,

    #[error("Install worker failed")]
    InstallWorkerFailed,

    #[error("Activate worker failed")]
    ActivateWorkerFailed,

    #[error("Event waitUntil promise rejected")]
    EventWaitUntilRejected,

    #[error("Event failed: {0}")]
    Failed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<WorkerError> for ServiceWorkerError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Abort => ServiceWorkerError::Abort,
            WorkerError::ProcessNotFound(_) => ServiceWorkerError::ProcessNotFound,
            WorkerError::IpcFailed(msg) => ServiceWorkerError::IpcFailed(msg),
            WorkerError::AllocationFailed(msg) => ServiceWorkerError::StartWorkerFailed(msg),
            WorkerError::InvalidState(msg) => ServiceWorkerError::InvalidState(msg),
            WorkerError::DataCloneError(msg) => ServiceWorkerError::Failed(msg),
        }
    }
}

impl From<RustKitError> for ServiceWorkerError {
    fn from(err: RustKitError) -> Self {
        match err {
            RustKitError::NotFound(what) => ServiceWorkerError::NotFound(what),
            RustKitError::Cancelled => ServiceWorkerError::Abort,
            other => ServiceWorkerError::Storage(other.to_string()),
        }
    }
}

// ==================== Types ====================

/// Identifier of a service worker registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistrationId(pub u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a service worker version, unique across registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionId(pub u64);

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a client (page or worker).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VersionStatus {
    /// Created, nothing dispatched yet.
    #[default]
    New,
    /// Install event in flight.
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Activate event in flight.
    Activating,
    /// Active and able to handle functional events.
    Active,
    /// Superseded, failed to install, or unregistered.
    Deactivated,
}

// ==================== Configuration ====================

/// Service worker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceWorkerConfig {
    /// How long a worker without controllees keeps running.
    #[serde(with = "duration_ms")]
    pub idle_delay: Duration,
}

impl Default for ServiceWorkerConfig {
    fn default() -> Self {
        Self {
            idle_delay: Duration::from_secs(30),
        }
    }
}

impl ServiceWorkerConfig {
    /// Parse a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> rustkit_common::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| RustKitError::config_with_source("invalid service worker config", e))
    }
}

// ==================== Events ====================

/// Notifications broadcast by the service worker context.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceWorkerEvent {
    /// A version changed lifecycle status.
    StatusChanged {
        registration_id: RegistrationId,
        version_id: VersionId,
        status: VersionStatus,
    },
    /// A version's embedded worker is running.
    WorkerStarted { version_id: VersionId },
    /// A version's embedded worker stopped.
    WorkerStopped { version_id: VersionId },
    /// A registration was stored.
    RegistrationStored {
        registration_id: RegistrationId,
        scope: url::Url,
    },
    /// A registration was removed.
    RegistrationDeleted { registration_id: RegistrationId },
    /// All registrations and user data were cleared.
    StorageWiped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_error_mapping() {
        assert_eq!(
            ServiceWorkerError::from(WorkerError::AllocationFailed("busy".into())),
            ServiceWorkerError::StartWorkerFailed("busy".into())
        );
        assert_eq!(
            ServiceWorkerError::from(WorkerError::Abort),
            ServiceWorkerError::Abort
        );
    }

    #[test]
    fn test_storage_error_mapping() {
        assert_eq!(
            ServiceWorkerError::from(RustKitError::NotFound("owner 3".into())),
            ServiceWorkerError::NotFound("owner 3".into())
        );
        assert!(matches!(
            ServiceWorkerError::from(RustKitError::storage("disk")),
            ServiceWorkerError::Storage(_)
        ));
    }

    #[test]
    fn test_config_defaults() {
        let config = ServiceWorkerConfig::from_json("{}").unwrap();
        assert_eq!(config.idle_delay, Duration::from_secs(30));

        let config = ServiceWorkerConfig::from_json(r#"{"idle_delay": 500}"#).unwrap();
        assert_eq!(config.idle_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_config_invalid() {
        let err = ServiceWorkerConfig::from_json("not json").unwrap_err();
        assert_eq!(err.category(), "config");
    }
}
