//! Remote calendar gateway abstraction for calsync.
//!
//! This module provides a trait-based interface to remote calendar providers
//! that expose an incremental ("delta") query protocol, plus the credential
//! provider seam the engine authenticates through.
//!
//! # Design Principles
//! - Provider isolation: no provider-specific logic leaks into the engine
//! - Async operations: all remote calls are async and carry caller timeouts
//! - Typed failure kinds: token expiry is `Error::TokenInvalid`, never a
//!   message substring to match on
//! - Tombstones always flow: deletion markers are events like any other

pub mod credentials;
pub mod gateway;
pub mod graph;
pub mod memory;

pub use credentials::{CredentialProvider, StaticCredentials};
pub use gateway::{
    CalendarGateway, CalendarInfo, ChangeKind, DeltaPage, EventDraft, RemoteEvent,
};
pub use graph::{AuthConfig, AuthManager, GraphClient, GraphGateway, TokenManager, Tokens};
pub use memory::MemoryGateway;
