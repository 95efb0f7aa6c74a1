use thiserror::Error;

/// Errors setting up the database.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// None of the migration directories could be loaded.
    #[error("no migrations found ({0}); set LOOKOUT_MIGRATIONS_DIR")]
    NoMigrations(String),
}
