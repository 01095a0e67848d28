//! Delta synchronization for offline-first clients
//!
//! This module provides:
//! - A durable queue of local changes that survives restarts
//! - Per-table checkpoints used to ask the backend for deltas only
//! - Order-independent checksums to detect client/server divergence
//! - A push-then-pull sync round over a pluggable [`SyncBackend`]
//!
//! Delivery is at-least-once: a change leaves the queue only after the
//! backend acknowledged it.

mod backend;
mod manager;
mod types;

pub use backend::{DeltaResponse, HttpSyncBackend, LocalReplica, SyncBackend, SyncReport};
pub use manager::{DeltaSyncManager, SyncConfig};
pub use types::{ChangeOperation, DeltaChange, DeltaQueryParams, PendingStats, SyncState};
