//! calsync Sync Engine
//!
//! This module reconciles events between a locally-owned event store and a
//! remote calendar service with an incremental ("delta") query protocol:
//! - Delta fetching as a lazy, finite page sequence with typed token expiry
//! - Field-level conflict detection with suggested and automatic resolution
//! - Per-user job lifecycle with a race-safe single-active-job guarantee
//! - Retry strategy with exponential backoff for transient failures
//! - A transport-agnostic service surface over the orchestrator

pub mod conflict;
pub mod delta;
pub mod job;
pub mod orchestrator;
pub mod retry;
pub mod service;

// Re-export main types
pub use conflict::{ConflictInfo, ConflictResolver, EquivalenceOptions, ResolutionStrategy};
pub use delta::{DeltaBatch, DeltaFetcher, DeltaOptions, DeltaPages, TaggedEvent};
pub use job::{JobRegistry, JobStatus, PhaseReport, SyncDirection, SyncJob, SyncReport};
pub use orchestrator::{SyncConfig, SyncOptions, SyncOrchestrator, SyncStatusView};
pub use retry::{RetryConfig, RetryExecutor};
pub use service::{ConflictStats, SyncService};
