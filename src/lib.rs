//! Notary Sync - real-time form synchronization for notarization sessions
//!
//! Keeps the workflow state of a client and a notary in step while they
//! fill in one document together:
//! - A sync engine with pluggable WebSocket and HTTP polling transports
//! - Per-field last-writer-wins merging into a single workflow store
//! - Debounced outbound edits, self-echo suppression and bounded retry
//! - Sled-backed workflow snapshots that survive a restart
//! - A small axum relay that both transports can talk to

pub mod collab;
pub mod server;
pub mod storage;
pub mod sync;
pub mod workflow;

pub use collab::{CollaborationConfig, CollaborationSession, CollaborationStatus};
pub use storage::{MemorySnapshotStore, SledSnapshotStore, SnapshotStore, StorageConfig};
pub use sync::{SyncConfig, SyncEngine, SyncError, SyncEvent, SyncResult};
pub use workflow::{WorkflowAction, WorkflowState, WorkflowStore};
