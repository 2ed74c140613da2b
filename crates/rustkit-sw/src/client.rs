//! Clients (pages and workers) known to the context.

use hashbrown::HashMap;
use url::{Origin, Url};

use crate::ClientId;

/// A client (controlled or uncontrolled page or worker).
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    /// Client ID.
    pub id: ClientId,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Frame type.
    pub frame_type: FrameType,

    /// Visibility state.
    pub visibility_state: VisibilityState,

    /// Whether focused.
    pub focused: bool,
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// Frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Auxiliary,
    TopLevel,
    Nested,
    None,
}

/// Visibility state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityState {
    Hidden,
    Visible,
}

impl Client {
    /// A visible top-level window.
    pub fn window(id: impl Into<String>, url: Url) -> Self {
        Self {
            id: ClientId(id.into()),
            url,
            client_type: ClientType::Window,
            frame_type: FrameType::TopLevel,
            visibility_state: VisibilityState::Visible,
            focused: false,
        }
    }

    /// Whether this is a top-level window.
    pub fn is_top_level_window(&self) -> bool {
        self.client_type == ClientType::Window && self.frame_type == FrameType::TopLevel
    }
}

/// Clients by id.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &ClientId) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Clients of the given type, `ClientType::All` for every client.
    pub fn match_all(&self, client_type: ClientType) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| match client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect()
    }

    /// Whether `origin` has at least one top-level window.
    pub fn has_top_level_window(&self, origin: &Origin) -> bool {
        self.clients
            .values()
            .any(|c| c.is_top_level_window() && &c.url.origin() == origin)
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &ClientId) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clients() {
        let mut clients = Clients::new();
        let url = Url::parse("https://example.com/").unwrap();
        clients.add(Client::window("c1", url));

        assert!(clients.get(&ClientId("c1".into())).is_some());
        assert_eq!(clients.match_all(ClientType::Window).len(), 1);
        assert!(clients.match_all(ClientType::Worker).is_empty());
        assert_eq!(clients.match_all(ClientType::All).len(), 1);
    }

    #[test]
    fn test_top_level_window_per_origin() {
        let mut clients = Clients::new();
        let page = Url::parse("https://example.com/index.html").unwrap();
        let mut frame = Client::window("frame", Url::parse("https://other.com/").unwrap());
        frame.frame_type = FrameType::Nested;
        clients.add(Client::window("page", page.clone()));
        clients.add(frame);

        assert!(clients.has_top_level_window(&page.origin()));
        assert!(!clients.has_top_level_window(
            &Url::parse("https://other.com/").unwrap().origin()
        ));

        clients.remove(&ClientId("page".into()));
        assert!(!clients.has_top_level_window(&page.origin()));
    }
}
