pub mod connection;
pub mod models;
pub mod schema;

pub use connection::{build_pool, establish_connection, run_migrations, DbPool, DbPooledConnection};

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database pool exhausted: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("database query failed: {0}")]
    Query(#[from] diesel::result::Error),
}
