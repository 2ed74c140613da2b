//! Permission and background-run collaborators.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use url::Origin;

/// Answer of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Decides whether an origin may use background sync.
pub trait PermissionChecker: Send + Sync {
    fn permission_status(&self, origin: &Origin) -> BoxFuture<'static, PermissionStatus>;
}

/// Keeps the browser alive until the next wake-up.
pub trait BackgroundRunScheduler: Send + Sync {
    /// `enabled` is false when nothing is waiting; `min_delay` is the time
    /// until the next registration could fire.
    fn run_in_background(&self, enabled: bool, min_delay: Duration);
}

/// The same answer for every origin, switchable at runtime.
#[derive(Debug)]
pub struct FixedPermission {
    granted: AtomicBool,
}

impl FixedPermission {
    pub fn granted() -> Self {
        Self {
            granted: AtomicBool::new(true),
        }
    }

    pub fn denied() -> Self {
        Self {
            granted: AtomicBool::new(false),
        }
    }

    pub fn set(&self, status: PermissionStatus) {
        self.granted
            .store(status == PermissionStatus::Granted, Ordering::SeqCst);
    }
}

impl PermissionChecker for FixedPermission {
    fn permission_status(&self, _origin: &Origin) -> BoxFuture<'static, PermissionStatus> {
        let status = if self.granted.load(Ordering::SeqCst) {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        };
        Box::pin(async move { status })
    }
}

/// Ignores every hint.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackgroundRunScheduler;

impl BackgroundRunScheduler for NoopBackgroundRunScheduler {
    fn run_in_background(&self, _enabled: bool, _min_delay: Duration) {}
}
