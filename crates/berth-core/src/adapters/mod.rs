pub mod database;
pub mod memory;
#[cfg(feature = "sqlx-postgres")]
pub mod postgres;

pub use database::DatabaseAdapter;
pub use memory::MemoryDatabaseAdapter;
#[cfg(feature = "sqlx-postgres")]
pub use postgres::PostgresAdapter;
