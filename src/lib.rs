//! pubstore-rs: a publication store brokering Readium LCP licenses.
//!
//! Users acquire licenses for publications already protected on a remote
//! LCP License Server. The store keeps one transaction per acquired license
//! and lets users download a fresh copy later, check its status and browse
//! their bookshelf from a reading app.
//!
//! # Features
//!
//! - License acquisition against v1 and v2 License Servers
//! - Fresh license download and license status lookup
//! - OPDS 2 catalog, publication and bookshelf feeds
//! - User accounts and authentication
//! - JSON API and a minimal web flow

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Authentication and user management.
pub mod auth;
/// Configuration and CLI.
pub mod config;
/// Database operations.
pub mod db;
/// Entitlement facade.
pub mod entitlement;
/// Error types.
pub mod error;
/// License Server and status document clients.
pub mod lcp;
/// OPDS feed generation.
pub mod opds;
/// HTTP server.
pub mod server;

#[cfg(test)]
mod tests;

pub use config::{Cli, Command, Config};
pub use db::Database;
pub use entitlement::Entitlements;
pub use error::{AppError, Result};
pub use server::AppState;
