//! Microsoft-Graph-style calendar provider.
//!
//! Split into authentication (`auth`), the raw wire client (`client`), and
//! the `CalendarGateway` implementation (`provider`).

pub mod auth;
pub mod client;
pub mod provider;

pub use auth::{AuthConfig, AuthManager, TokenManager, Tokens};
pub use client::GraphClient;
pub use provider::GraphGateway;
