//! # Credential Hub
//!
//! Stores third-party connection credentials encrypted at rest, refreshes them under a
//! distributed lock, and routes inbound provider webhooks to the connections and syncs
//! they concern.

pub mod config;
pub mod connection_service;
pub mod credentials;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod locking;
pub mod models;
pub mod providers;
pub mod repositories;
pub mod scheduler;
pub mod server;
pub mod telemetry;
pub mod token_exchange;
pub mod token_minter;
pub mod token_refresh;
pub mod webhook_verification;
pub mod webhooks;
pub use migration;
