//! # RustKit Embedded Workers
//!
//! Browser-side handles for the isolated execution contexts that host
//! service worker scripts.
//!
//! ## Features
//!
//! - **EmbeddedWorker**: start/stop lifecycle of one worker context
//! - **WorkerRegistry**: id allocation, per-process routing, process loss
//! - **DevToolsManager**: debug route ids and pause-on-start
//! - **Listeners**: fan-out of worker notifications to interested parties
//!
//! ## Architecture
//!
//! ```text
//! WorkerRegistry
//!     │
//!     ├── process → ProcessSender ──── WorkerCommand ───→ worker process
//!     │
//!     └── worker id → EmbeddedWorker
//!             ├── status (Stopped/Starting/Running/Stopping)
//!             └── listeners ◄──── started/stopped/message ─── worker process
//! ```

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use thiserror::Error;
use url::Url;

pub mod devtools;
pub mod instance;
pub mod registry;

#[cfg(test)]
mod fakes;

pub use devtools::DevToolsManager;
pub use instance::{EmbeddedWorker, StartParams};
pub use registry::WorkerRegistry;

// ==================== Errors ====================

/// Embedded worker errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("Aborted")]
    Abort,

    #[error("Process not found: {0}")]
    ProcessNotFound(ProcessId),

    #[error("IPC failed: {0}")]
    IpcFailed(String),

    #[error("Process allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Data clone error: {0}")]
    DataCloneError(String),
}

// ==================== Types ====================

/// Unique identifier for an embedded worker, allocated by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a process that can host workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread inside the hosting process that runs the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerThreadId(pub u64);

/// Debug-session route for an embedded worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteId(pub u64);

/// Running status of an embedded worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

// ==================== Messages ====================

/// An opaque payload exchanged with a running worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    /// Message data (JSON serializable).
    pub data: JsonValue,
}

impl WorkerMessage {
    /// Create a new message.
    pub fn new(data: JsonValue) -> Self {
        Self { data }
    }

    /// Serialize a typed payload into a message.
    pub fn encode<T: Serialize>(payload: &T) -> Result<Self, WorkerError> {
        serde_json::to_value(payload)
            .map(Self::new)
            .map_err(|e| WorkerError::DataCloneError(e.to_string()))
    }

    /// Deserialize the payload as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, WorkerError> {
        T::deserialize(&self.data).map_err(|e| WorkerError::DataCloneError(e.to_string()))
    }
}

/// Parameters carried by a start command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartWorkerParams {
    pub worker_id: WorkerId,
    pub version_id: u64,
    pub scope: Url,
    pub script_url: Url,
    pub route_id: RouteId,
    pub pause_on_start: bool,
}

/// Commands sent from the coordinator to a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    StartWorker(StartWorkerParams),
    StopWorker {
        worker_id: WorkerId,
    },
    MessageToWorker {
        thread_id: WorkerThreadId,
        worker_id: WorkerId,
        message: WorkerMessage,
    },
}

impl WorkerCommand {
    /// The worker this command targets.
    pub fn worker_id(&self) -> WorkerId {
        match self {
            WorkerCommand::StartWorker(params) => params.worker_id,
            WorkerCommand::StopWorker { worker_id } => *worker_id,
            WorkerCommand::MessageToWorker { worker_id, .. } => *worker_id,
        }
    }
}

/// An uncaught exception reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionDetails {
    pub message: String,
    pub line_number: u32,
    pub column_number: u32,
    pub source_url: String,
}

/// Console message severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsoleLevel {
    Debug,
    Log,
    Warning,
    Error,
}

/// A console message reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleMessage {
    pub level: ConsoleLevel,
    pub message: String,
    pub line_number: u32,
    pub source_url: String,
}

// ==================== Collaborators ====================

/// Transport to one worker-hosting process.
pub trait ProcessSender: Send + Sync {
    /// Hand a command to the process. Returns false if the transport failed.
    fn send(&self, command: WorkerCommand) -> bool;
}

/// Picks the process that will host a starting worker.
pub trait ProcessAllocator: Send + Sync {
    /// Allocate a process, preferring `candidates` in order.
    fn allocate(
        &self,
        worker_id: WorkerId,
        candidates: Vec<ProcessId>,
        script_url: Url,
    ) -> BoxFuture<'static, Result<ProcessId, WorkerError>>;

    /// Drop the worker's claim on its process.
    fn release(&self, worker_id: WorkerId);
}

/// Debug route assigned to a worker when it is bound to a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevToolsRoute {
    pub route_id: RouteId,
    pub pause_on_start: bool,
}

/// Registers workers with the debugging front end.
pub trait DevToolsRegistrar: Send + Sync {
    fn worker_created(
        &self,
        process_id: ProcessId,
        worker_id: WorkerId,
        scope: &Url,
        script_url: &Url,
    ) -> DevToolsRoute;

    fn worker_destroyed(&self, process_id: ProcessId, route_id: RouteId);
}

/// Observer of one embedded worker.
///
/// Callbacks run without any worker lock held, so a listener may call back
/// into the worker or detach itself.
pub trait WorkerListener: Send + Sync {
    fn on_started(&self) {}

    fn on_stopped(&self, _previous: WorkerStatus) {}

    fn on_script_loaded(&self) {}

    fn on_script_load_failed(&self) {}

    fn on_report_exception(&self, _details: &ExceptionDetails) {}

    fn on_report_console_message(&self, _message: &ConsoleMessage) {}

    /// Return true if the message was handled.
    fn on_message_received(&self, _message: &WorkerMessage) -> bool {
        false
    }
}
