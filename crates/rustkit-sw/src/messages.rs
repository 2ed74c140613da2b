//! Event protocol between a version and its running worker.
//!
//! Both directions travel as JSON inside [`WorkerMessage`] payloads.

use hashbrown::HashMap;
use rustkit_worker::WorkerMessage;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::pending::RequestId;
use crate::ServiceWorkerError;

/// A request intercepted for the worker's fetch handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Request URL.
    pub url: Url,

    /// Request method.
    pub method: String,

    /// Request headers.
    pub headers: HashMap<String, String>,

    /// Client ID.
    pub client_id: Option<String>,

    /// Is navigation request.
    pub is_navigation: bool,

    /// Is reload.
    pub is_reload: bool,
}

impl FetchRequest {
    /// A plain GET.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            headers: HashMap::new(),
            client_id: None,
            is_navigation: false,
            is_reload: false,
        }
    }
}

/// Response produced by a fetch handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// Status code.
    pub status: u16,

    /// Status text.
    pub status_text: String,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,
}

impl FetchResponse {
    /// Create a network error response.
    pub fn network_error() -> Self {
        Self {
            status: 0,
            status_text: "Network Error".to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }
}

/// Outcome of a fetch event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "response", rename_all = "snake_case")]
pub enum FetchEventResult {
    /// The handler did not respond; go to the network.
    FallbackToNetwork,
    Response(FetchResponse),
}

/// Outcome of an extendable event (install, activate, sync, push).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventResult {
    /// All waitUntil promises resolved.
    Completed,
    /// A waitUntil promise rejected.
    Rejected,
}

/// Events sent to a running worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceWorkerMessage {
    InstallEvent {
        request_id: RequestId,
    },
    ActivateEvent {
        request_id: RequestId,
    },
    FetchEvent {
        request_id: RequestId,
        request: FetchRequest,
    },
    SyncEvent {
        request_id: RequestId,
        tag: String,
        last_chance: bool,
    },
    PushEvent {
        request_id: RequestId,
        data: String,
    },
}

impl ServiceWorkerMessage {
    pub fn request_id(&self) -> RequestId {
        match self {
            ServiceWorkerMessage::InstallEvent { request_id }
            | ServiceWorkerMessage::ActivateEvent { request_id }
            | ServiceWorkerMessage::FetchEvent { request_id, .. }
            | ServiceWorkerMessage::SyncEvent { request_id, .. }
            | ServiceWorkerMessage::PushEvent { request_id, .. } => *request_id,
        }
    }

    pub fn to_worker_message(&self) -> Result<WorkerMessage, ServiceWorkerError> {
        WorkerMessage::encode(self).map_err(ServiceWorkerError::from)
    }
}

/// Completions reported back by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceWorkerReply {
    InstallEventFinished {
        request_id: RequestId,
        result: EventResult,
    },
    ActivateEventFinished {
        request_id: RequestId,
        result: EventResult,
    },
    FetchEventFinished {
        request_id: RequestId,
        result: FetchEventResult,
    },
    SyncEventFinished {
        request_id: RequestId,
        result: EventResult,
    },
    PushEventFinished {
        request_id: RequestId,
        result: EventResult,
    },
}

impl ServiceWorkerReply {
    pub fn to_worker_message(&self) -> Result<WorkerMessage, ServiceWorkerError> {
        WorkerMessage::encode(self).map_err(ServiceWorkerError::from)
    }
}
