//! SQLite persistence for the learning engine, implementing every port of
//! `medex-core` with `sqlx` and embedded migrations.

pub mod content;
pub mod convert;
pub mod error;
pub mod runtime;
pub mod session;
pub mod state;

pub use content::SqliteContentRepository;
pub use error::{Result, StorageError};
pub use runtime::SqliteRuntimeRepository;
pub use session::SqliteSessionRepository;
pub use state::SqliteStateRepository;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;

/// Initialize the engine database with migrations.
pub async fn init_db(db_path: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(db_path)?
        .create_if_missing(true)
        .foreign_keys(true);

    // An in-memory database exists per connection; pin the pool to one so
    // every caller sees the same schema.
    let in_memory = db_path.contains(":memory:");
    let pool = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 5 })
        .connect_with(options)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    tracing::info!(db_path, "engine DB initialized");
    Ok(pool)
}

/// In-memory database for tests.
pub async fn init_test_db() -> Result<SqlitePool> {
    init_db("sqlite::memory:").await
}
