//! Process-wide state
//!
//! Holds the shared pieces every account engine runs against.

mod sync_manager;

pub use sync_manager::SyncManager;
