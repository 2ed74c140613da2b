//! Debug route bookkeeping for embedded workers.

use hashbrown::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;
use url::Url;

use crate::{DevToolsRegistrar, DevToolsRoute, ProcessId, RouteId, WorkerId};

#[derive(Debug, Default)]
struct DevToolsState {
    pause_on_start: HashSet<Url>,
    routes: HashMap<RouteId, (ProcessId, WorkerId)>,
}

/// Hands out debug routes and remembers which scopes should pause on start.
#[derive(Debug)]
pub struct DevToolsManager {
    next_route_id: AtomicU64,
    state: Mutex<DevToolsState>,
}

impl Default for DevToolsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DevToolsManager {
    pub fn new() -> Self {
        Self {
            next_route_id: AtomicU64::new(1),
            state: Mutex::new(DevToolsState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, DevToolsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make workers for `scope` wait for a debugger before running script.
    pub fn set_pause_on_start(&self, scope: Url, pause: bool) {
        let mut state = self.lock_state();
        if pause {
            state.pause_on_start.insert(scope);
        } else {
            state.pause_on_start.remove(&scope);
        }
    }

    pub fn is_paused_on_start(&self, scope: &Url) -> bool {
        self.lock_state().pause_on_start.contains(scope)
    }

    /// Routes of workers currently bound to a process.
    pub fn live_routes(&self) -> Vec<(RouteId, ProcessId, WorkerId)> {
        let mut routes: Vec<_> = self
            .lock_state()
            .routes
            .iter()
            .map(|(route, (process, worker))| (*route, *process, *worker))
            .collect();
        routes.sort_by_key(|(route, _, _)| route.0);
        routes
    }
}

impl DevToolsRegistrar for DevToolsManager {
    fn worker_created(
        &self,
        process_id: ProcessId,
        worker_id: WorkerId,
        scope: &Url,
        _script_url: &Url,
    ) -> DevToolsRoute {
        let route_id = RouteId(self.next_route_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.lock_state();
        state.routes.insert(route_id, (process_id, worker_id));
        let pause_on_start = state.pause_on_start.contains(scope);
        debug!(%worker_id, route_id = route_id.0, pause_on_start, "Debug route created");
        DevToolsRoute {
            route_id,
            pause_on_start,
        }
    }

    fn worker_destroyed(&self, process_id: ProcessId, route_id: RouteId) {
        if self.lock_state().routes.remove(&route_id).is_none() {
            debug!(%process_id, route_id = route_id.0, "Unknown debug route destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_are_tracked() {
        let devtools = DevToolsManager::new();
        let scope = Url::parse("https://example.com/").unwrap();
        let script = scope.join("sw.js").unwrap();

        let first = devtools.worker_created(ProcessId(1), WorkerId(1), &scope, &script);
        let second = devtools.worker_created(ProcessId(1), WorkerId(2), &scope, &script);
        assert_ne!(first.route_id, second.route_id);
        assert_eq!(devtools.live_routes().len(), 2);

        devtools.worker_destroyed(ProcessId(1), first.route_id);
        assert_eq!(
            devtools.live_routes(),
            vec![(second.route_id, ProcessId(1), WorkerId(2))]
        );
    }

    #[test]
    fn test_pause_on_start_per_scope() {
        let devtools = DevToolsManager::new();
        let paused = Url::parse("https://example.com/debug/").unwrap();
        let other = Url::parse("https://example.com/").unwrap();
        let script = other.join("sw.js").unwrap();

        devtools.set_pause_on_start(paused.clone(), true);
        assert!(devtools.worker_created(ProcessId(1), WorkerId(1), &paused, &script).pause_on_start);
        assert!(!devtools.worker_created(ProcessId(1), WorkerId(2), &other, &script).pause_on_start);

        devtools.set_pause_on_start(paused.clone(), false);
        assert!(!devtools.is_paused_on_start(&paused));
    }
}
