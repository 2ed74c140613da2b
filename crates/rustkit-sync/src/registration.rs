//! One-shot sync registrations.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Network a registration needs before it may fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncNetworkState {
    Any,
    AvoidCellular,
    #[default]
    Online,
}

/// Firing state of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Waiting to fire.
    #[default]
    Pending,
    /// An event is in flight.
    Firing,
    /// Registered again while an event was in flight.
    ReregisteredWhileFiring,
}

/// What the page asked for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackgroundSyncRegistrationOptions {
    pub tag: String,
    pub network_state: SyncNetworkState,
}

impl BackgroundSyncRegistrationOptions {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            network_state: SyncNetworkState::default(),
        }
    }

    pub fn with_network_state(mut self, network_state: SyncNetworkState) -> Self {
        self.network_state = network_state;
        self
    }
}

/// A stored sync registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundSyncRegistration {
    pub(crate) id: u64,
    pub(crate) options: BackgroundSyncRegistrationOptions,
    pub(crate) state: SyncState,
    pub(crate) num_attempts: u32,
    pub(crate) delay_until: SystemTime,
}

impl BackgroundSyncRegistration {
    pub(crate) fn new(id: u64, options: BackgroundSyncRegistrationOptions, now: SystemTime) -> Self {
        Self {
            id,
            options,
            state: SyncState::Pending,
            num_attempts: 0,
            delay_until: now,
        }
    }

    /// Per-registration id; never reused within one owner.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.options.tag
    }

    pub fn options(&self) -> &BackgroundSyncRegistrationOptions {
        &self.options
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Attempts made since the registration was (re-)created.
    pub fn num_attempts(&self) -> u32 {
        self.num_attempts
    }

    /// Earliest time the registration may fire.
    pub fn delay_until(&self) -> SystemTime {
        self.delay_until
    }

    pub fn is_firing(&self) -> bool {
        matches!(
            self.state,
            SyncState::Firing | SyncState::ReregisteredWhileFiring
        )
    }

    /// Pending and past its delay. The network check is separate.
    pub(crate) fn is_due(&self, now: SystemTime) -> bool {
        self.state == SyncState::Pending && now >= self.delay_until
    }
}
