pub mod pool;
pub mod schema;
pub mod store;

pub use pool::{create_memory_pool, create_pool, DbConnection, DbPool};
pub use store::SqliteStore;
