//! # skill-sync
//!
//! Connects owners to external work platforms, keeps their activity in sync
//! through paginated backfill and webhooks, and turns that activity into
//! scored skill records.

pub mod auth;
pub mod config;
pub mod connection_registry;
pub mod crypto;
pub mod db;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod inference;
pub mod locks;
pub mod models;
pub mod providers;
pub mod repositories;
pub mod server;
pub mod store;
pub mod sync_orchestrator;
pub mod telemetry;
pub mod token_refresh;
pub mod webhook_gateway;
pub mod webhook_verification;
pub use migration;
