mod mappers;
pub mod sqlite;
mod statements;

pub use sqlite::{SqliteBackend, SqliteOptions};
pub use statements::validate_queue_name;
