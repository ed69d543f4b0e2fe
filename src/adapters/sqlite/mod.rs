pub mod accounts;
pub mod messages;
pub mod poll_status;
pub mod pool;
pub mod push_filters;
pub mod rules;
pub mod schema;
pub mod settings;
pub mod stats;

// Re-export the pool type so callers can do `use crate::adapters::sqlite::DbPool`
// instead of `use crate::adapters::sqlite::pool::DbPool`
pub use pool::DbPool;
