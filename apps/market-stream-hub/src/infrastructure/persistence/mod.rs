//! Minute Bar Persistence
//!
//! [`MinuteBarStore`](crate::application::ports::MinuteBarStore) adapters.

mod in_memory;
mod sqlite;

pub use in_memory::InMemoryMinuteBarStore;
pub use sqlite::SqliteMinuteBarStore;
