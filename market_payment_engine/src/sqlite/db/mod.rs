//! # SQLite event store methods
//!
//! Plain functions that accept a `&mut SqliteConnection`. Callers can obtain a connection from a pool, or open a
//! transaction and pass `&mut *tx`, without any other changes.
use sqlx::{sqlite::SqlitePoolOptions, Error as SqlxError, SqlitePool};

pub mod events;

pub async fn new_pool(url: &str, max_connections: u32) -> Result<SqlitePool, SqlxError> {
    let pool = SqlitePoolOptions::new().max_connections(max_connections).connect(url).await?;
    Ok(pool)
}
