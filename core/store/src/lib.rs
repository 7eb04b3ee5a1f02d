//! Local event store abstractions for calsync.
//!
//! This module provides the locally-owned domain model (calendar events, sync
//! state, conflict records), the repository traits the sync engine consumes,
//! and in-memory implementations of those traits.
//!
//! # Design Principles
//! - Persistence isolation: the engine only ever sees the repository traits
//! - Single-row atomicity: no repository method spans more than one record
//! - Conflict records are append-only once resolved

pub mod conflict;
pub mod event;
pub mod memory;
pub mod repository;
pub mod state;

pub use conflict::{ConflictDetail, ConflictType, FieldConflict, Resolution, SyncConflict};
pub use event::CalendarEvent;
pub use memory::{MemoryConflictStore, MemoryEventRepository, MemorySyncStateStore};
pub use repository::{ConflictRecordStore, LocalEventRepository, SyncStateStore};
pub use state::{SyncRunStatus, SyncState};
