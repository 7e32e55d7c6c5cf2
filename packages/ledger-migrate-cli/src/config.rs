use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ledger_migrate::sqlite::Runner;
use rusqlite::Connection;
use tracing::{debug, warn};

pub const DATABASE_PATH_VAR: &str = "DATABASE_PATH";
pub const MIGRATIONS_DIR_VAR: &str = "MIGRATIONS_DIR";
pub const DEFAULT_MIGRATIONS_DIR: &str = "migrations";

/// Resolved settings for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database: PathBuf,
    pub migrations_dir: PathBuf,
}

impl Config {
    /// Resolves settings from flags first, then the environment, then defaults.
    pub fn resolve(database: Option<PathBuf>, migrations_dir: Option<PathBuf>) -> Result<Self> {
        Self::resolve_with(database, migrations_dir, |key| env::var(key).ok())
    }

    fn resolve_with(
        database: Option<PathBuf>,
        migrations_dir: Option<PathBuf>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let database = database
            .or_else(|| lookup(DATABASE_PATH_VAR).map(PathBuf::from))
            .ok_or_else(|| {
                anyhow!("no database configured: pass --database or set {DATABASE_PATH_VAR}")
            })?;

        let migrations_dir = migrations_dir
            .or_else(|| lookup(MIGRATIONS_DIR_VAR).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MIGRATIONS_DIR));

        Ok(Self {
            database,
            migrations_dir,
        })
    }

    /// Opens the database and builds a runner over the migrations directory.
    pub fn open_runner(&self) -> Result<Runner> {
        debug!("opening database at {}", self.database.display());
        let conn = Connection::open(&self.database)
            .with_context(|| format!("failed to open database {}", self.database.display()))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .context("failed to set pragmas")?;

        Ok(Runner::new(conn, &self.migrations_dir))
    }
}

/// Loads variables from an env file. A missing file only produces a warning.
pub fn load_env_file(path: &Path) {
    match dotenvy::from_path(path) {
        Ok(()) => debug!("loaded environment from {}", path.display()),
        Err(err) => warn!("could not load {}: {err}", path.display()),
    }
}
