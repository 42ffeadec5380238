//! eddie-sync - mail synchronization core
//!
//! Drives per-account protocol conversations, reconciles queued local edits
//! with server deltas and tracks server health.
//!
//! ## Module Organization
//!
//! - `fsm/`: Table-driven state machine
//! - `health/`: Per-server comm quality and rate limiting
//! - `codec/`: Token-based binary wire codec
//! - `pending/`: Pending operation queue and server command reconciler
//! - `engine/`: Per-account protocol control engine
//! - `state/`: Engine manager shared by all accounts
//! - `store/`: Transactional store contract
//! - `adapters/`: SQLite implementation of the store
//! - `transport/`: Network transport contract and HTTP implementation
//! - `config/`: Configuration loading
//! - `services/`: Logging helpers
//! - `types/`: Shared data structures

pub mod adapters;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod health;
pub mod pending;
pub mod services;
pub mod state;
pub mod store;
pub mod transport;
pub mod types;

pub use error::{Result, SyncError};
