//! Stored form of one owner's registrations.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::registration::{
    BackgroundSyncRegistration, BackgroundSyncRegistrationOptions, SyncNetworkState, SyncState,
};

/// In-memory registrations of one service worker registration.
#[derive(Debug, Clone)]
pub(crate) struct OwnerRegistrations {
    pub origin: String,
    pub next_id: u64,
    pub registrations: HashMap<String, BackgroundSyncRegistration>,
}

impl OwnerRegistrations {
    pub fn new(origin: String) -> Self {
        Self {
            origin,
            next_id: 0,
            registrations: HashMap::new(),
        }
    }

    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn to_document(&self) -> StoredRegistrations {
        let mut registrations: Vec<_> = self
            .registrations
            .values()
            .map(|r| StoredRegistration {
                id: r.id,
                tag: r.options.tag.clone(),
                network_state: r.options.network_state,
                num_attempts: r.num_attempts,
                delay_until_ms: to_millis(r.delay_until),
            })
            .collect();
        registrations.sort_by_key(|r| r.id);

        StoredRegistrations {
            next_registration_id: self.next_id,
            origin: self.origin.clone(),
            registrations,
        }
    }

    /// Rebuild from a stored document. `None` if an id is not below the
    /// stored next id.
    pub fn from_document(document: StoredRegistrations) -> Option<Self> {
        let mut owner = Self::new(document.origin);
        owner.next_id = document.next_registration_id;

        for stored in document.registrations {
            if stored.id >= owner.next_id {
                return None;
            }
            let registration = BackgroundSyncRegistration {
                id: stored.id,
                options: BackgroundSyncRegistrationOptions {
                    tag: stored.tag.clone(),
                    network_state: stored.network_state,
                },
                // Anything firing when the document was written fires again.
                state: SyncState::Pending,
                num_attempts: stored.num_attempts,
                delay_until: from_millis(stored.delay_until_ms),
            };
            owner.registrations.insert(stored.tag, registration);
        }
        Some(owner)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoredRegistrations {
    pub next_registration_id: u64,
    pub origin: String,
    pub registrations: Vec<StoredRegistration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoredRegistration {
    pub id: u64,
    pub tag: String,
    #[serde(default)]
    pub network_state: SyncNetworkState,
    #[serde(default)]
    pub num_attempts: u32,
    #[serde(default)]
    pub delay_until_ms: u64,
}

fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn from_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(next: u64, ids: &[u64]) -> StoredRegistrations {
        StoredRegistrations {
            next_registration_id: next,
            origin: "https://example.com".into(),
            registrations: ids
                .iter()
                .map(|id| StoredRegistration {
                    id: *id,
                    tag: format!("tag-{}", id),
                    network_state: SyncNetworkState::Online,
                    num_attempts: 1,
                    delay_until_ms: 5_000,
                })
                .collect(),
        }
    }

    #[test]
    fn test_restores_registrations_as_pending() {
        let owner = OwnerRegistrations::from_document(document(3, &[0, 2])).unwrap();

        assert_eq!(owner.next_id, 3);
        let restored = &owner.registrations["tag-2"];
        assert_eq!(restored.id, 2);
        assert_eq!(restored.state, SyncState::Pending);
        assert_eq!(restored.num_attempts, 1);
        assert_eq!(restored.delay_until, UNIX_EPOCH + Duration::from_secs(5));
        assert_eq!(owner.to_document(), document(3, &[0, 2]));
    }

    #[test]
    fn test_rejects_id_not_below_next_id() {
        assert!(OwnerRegistrations::from_document(document(5, &[7])).is_none());
        assert!(OwnerRegistrations::from_document(document(5, &[5])).is_none());
    }

    #[test]
    fn test_missing_optional_fields() {
        let json = r#"{"next_registration_id":1,"origin":"https://a.test","registrations":[{"id":0,"tag":"t"}]}"#;
        let doc: StoredRegistrations = serde_json::from_str(json).unwrap();

        let owner = OwnerRegistrations::from_document(doc).unwrap();
        let restored = &owner.registrations["t"];
        assert_eq!(restored.options.network_state, SyncNetworkState::Online);
        assert_eq!(restored.num_attempts, 0);
    }
}
