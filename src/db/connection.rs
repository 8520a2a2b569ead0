use std::path::Path;

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbPooledConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Build the connection pool the `Engine` holds for the life of the process.
///
/// `max_size` bounds the pool so `db_pool_checked_out`/`db_pool_size` (§6
/// metrics) describe a genuinely finite resource, matching the teacher's
/// `DbConnection::new` sizing.
pub fn build_pool(database_url: &str, max_size: u32) -> Result<DbPool, r2d2::Error> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    Pool::builder().max_size(max_size).build(manager)
}

/// Establish a single connection with the busy timeout set, used for the
/// startup migration run before the pool exists.
pub fn establish_connection(database_url: &str) -> Result<SqliteConnection, diesel::ConnectionError> {
    let mut conn = SqliteConnection::establish(database_url)?;
    diesel::sql_query("PRAGMA busy_timeout = 5000")
        .execute(&mut conn)
        .map_err(|e| diesel::ConnectionError::BadConnection(format!("Failed to set busy_timeout: {}", e)))?;
    Ok(conn)
}

/// Ensure the database directory exists and run all pending migrations.
pub fn run_migrations(database_path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Some(parent) = database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut conn = establish_connection(&database_path.to_string_lossy())?;
    conn.run_pending_migrations(MIGRATIONS)?;
    Ok(())
}
