//! Connectivity tracking.

use std::sync::Arc;
use tokio::sync::watch;

use crate::registration::SyncNetworkState;

/// Kind of the current network connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
    /// Connected, kind unknown.
    #[default]
    Unknown,
    Ethernet,
    Wifi,
    Cellular2g,
    Cellular3g,
    Cellular4g,
    Bluetooth,
    /// Offline.
    None,
}

impl ConnectionType {
    pub fn is_cellular(self) -> bool {
        matches!(
            self,
            ConnectionType::Cellular2g | ConnectionType::Cellular3g | ConnectionType::Cellular4g
        )
    }

    pub fn is_online(self) -> bool {
        self != ConnectionType::None
    }
}

/// Current connection type plus change notification.
///
/// Clones observe and drive the same connection.
#[derive(Debug, Clone)]
pub struct NetworkObserver {
    sender: Arc<watch::Sender<ConnectionType>>,
}

impl NetworkObserver {
    pub fn new(initial: ConnectionType) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn connection_type(&self) -> ConnectionType {
        *self.sender.borrow()
    }

    /// Report a connectivity transition. Subscribers only wake on change.
    pub fn set_connection_type(&self, connection: ConnectionType) {
        self.sender.send_if_modified(|current| {
            if *current == connection {
                false
            } else {
                *current = connection;
                true
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionType> {
        self.sender.subscribe()
    }

    /// Whether the current connection satisfies `required`.
    pub fn network_sufficient(&self, required: SyncNetworkState) -> bool {
        let connection = self.connection_type();
        match required {
            SyncNetworkState::Any => true,
            SyncNetworkState::Online => connection.is_online(),
            SyncNetworkState::AvoidCellular => connection.is_online() && !connection.is_cellular(),
        }
    }
}

impl Default for NetworkObserver {
    fn default() -> Self {
        Self::new(ConnectionType::default())
    }
}
