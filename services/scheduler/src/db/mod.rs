//! Postgres pool and schema migrations for [`crate::store::PgCheckStore`].

mod error;

pub use error::DbError;

use std::path::PathBuf;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,

    /// Where to load migrations from. Falls back to the crate's own
    /// `migrations` directory, then `./migrations`.
    pub migrations_dir: Option<PathBuf>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/lookout".to_string(),
            // The scanning lock pins one connection for a whole pass.
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            migrations_dir: None,
        }
    }
}

impl DbConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Unset or unparsable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |var: &str, default: u32| {
            lookup(var)
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(default)
        };

        Self {
            max_connections: number("DB_MAX_CONNECTIONS", defaults.max_connections),
            min_connections: number("DB_MIN_CONNECTIONS", defaults.min_connections),
            migrations_dir: lookup("LOOKOUT_MIGRATIONS_DIR").map(PathBuf::from),
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            acquire_timeout: defaults.acquire_timeout,
        }
    }

    /// The database URL with its password masked, for logs.
    pub fn redacted_url(&self) -> String {
        match reqwest::Url::parse(&self.database_url) {
            Ok(mut url) => {
                if url.password().is_some() {
                    let _ = url.set_password(Some("***"));
                }
                url.to_string()
            }
            Err(_) => "<unparsable database url>".to_string(),
        }
    }

    fn migration_dirs(&self) -> Vec<PathBuf> {
        match &self.migrations_dir {
            Some(dir) => vec![dir.clone()],
            None => vec![
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
                PathBuf::from("migrations"),
            ],
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    migration_dirs: Vec<PathBuf>,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            url = %config.redacted_url(),
            max_connections = config.max_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self {
            pool,
            migration_dirs: config.migration_dirs(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations from the first configured directory that
    /// loads.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let mut failures = Vec::new();

        for dir in &self.migration_dirs {
            let migrator = match Migrator::new(dir.clone()).await {
                Ok(migrator) => migrator,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "Migrations not loadable");
                    failures.push(format!("{}: {e}", dir.display()));
                    continue;
                }
            };

            info!(dir = %dir.display(), "Running database migrations");
            migrator.run(&self.pool).await?;
            info!("Database migrations complete");
            return Ok(());
        }

        Err(DbError::NoMigrations(failures.join("; ")))
    }
}
