//! A linear SQL migration runner backed by a version ledger.
//!
//! Migrations live in a single directory as pairs of
//! `<version>_<description>.up.sql` and `<version>_<description>.down.sql`
//! files. They are discovered from disk on every operation, applied in
//! ascending version order, and recorded in a `migration_history` table that
//! is the only source of truth for what has been applied.

mod db;

#[cfg(feature = "turso")]
pub use crate::db::turso;

#[cfg(feature = "sqlite")]
pub use crate::db::sqlite;

#[cfg(feature = "turso")]
use ::turso as turso_crate;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Custom error type for migration operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Reading the migrations directory or one of its files failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An up-script or its ledger insert failed; the migration was rolled back
    #[error("failed to apply migration {version}: {message}")]
    MigrationFailed { version: i64, message: String },

    /// A down-script or its ledger delete failed; the rollback was undone
    #[error("failed to roll back migration {version}: {message}")]
    RollbackFailed { version: i64, message: String },

    /// The ledger holds no applied migration
    #[error("nothing to roll back")]
    NothingToRollBack,

    /// The latest applied migration has no down-script on disk
    #[error("down migration not found for version {0}")]
    DownMigrationNotFound(i64),

    /// A ledger row holds a missing or mistyped column
    #[error("malformed ledger row: {0}")]
    MalformedLedger(String),

    /// Database error
    #[cfg(all(feature = "sqlite", not(feature = "turso")))]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Database error
    #[cfg(all(feature = "turso", not(feature = "sqlite")))]
    #[error("Database error: {0}")]
    Database(#[from] turso_crate::Error),
}

// Compile-time check to ensure at least one database feature is enabled
#[cfg(not(any(feature = "sqlite", feature = "turso")))]
compile_error!("At least one database feature must be enabled: either 'sqlite' or 'turso'");

// Compile-time check to prevent both features from being enabled
#[cfg(all(feature = "sqlite", feature = "turso"))]
compile_error!(
    "Cannot enable both 'sqlite' and 'turso' features at the same time. Please choose one."
);

pub type MigrateResult<T> = std::result::Result<T, Error>;

/// A planned schema change assembled from its up and down files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Numeric prefix shared by the up and down files
    pub version: i64,
    /// File name of the up-script, stored in the ledger
    pub filename: String,
    /// SQL applied to advance the schema
    pub up_sql: String,
    /// SQL applied to revert the schema, if a down file exists
    pub down_sql: Option<String>,
}

impl Migration {
    /// Creates a migration without a down-script.
    pub fn new(version: i64, filename: impl Into<String>, up_sql: impl Into<String>) -> Self {
        Self {
            version,
            filename: filename.into(),
            up_sql: up_sql.into(),
            down_sql: None,
        }
    }

    /// Attaches the SQL that reverts this migration.
    pub fn with_down(mut self, down_sql: impl Into<String>) -> Self {
        self.down_sql = Some(down_sql.into());
        self
    }
}

/// A row of the ledger table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: i64,
    pub filename: String,
    /// `YYYY-MM-DD HH:MM:SS`, as written by `CURRENT_TIMESTAMP`
    pub applied_at: String,
}

/// Read-only snapshot of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    pub ledger_exists: bool,
    /// Applied migrations ordered by version, empty when the ledger is missing
    pub applied: Vec<AppliedMigration>,
}

/// Which half of a migration a file provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

/// Extracts `(version, direction)` from a migration file name.
///
/// Returns `None` for anything that is not a migration script: names not
/// ending in `.sql`, without an `_` separator, with a non-numeric prefix, or
/// ending in neither `.up.sql` nor `.down.sql`.
fn parse_file_name(name: &str) -> Option<(i64, Direction)> {
    if !name.ends_with(".sql") {
        return None;
    }

    let (prefix, _) = name.split_once('_')?;
    let version = prefix.parse::<i64>().ok().filter(|v| *v >= 0)?;

    if name.ends_with(".up.sql") {
        Some((version, Direction::Up))
    } else if name.ends_with(".down.sql") {
        Some((version, Direction::Down))
    } else {
        None
    }
}

#[derive(Default)]
struct Pair {
    up: Option<(String, String)>,
    down: Option<String>,
}

/// Discovers every migration in `migrations_dir`.
///
/// The scan is not recursive. Up and down files sharing a version are merged
/// into one [`Migration`]; versions without a non-empty up-script are dropped
/// and the rest are returned in ascending version order, which is the order
/// they must be applied in.
///
/// # Errors
/// Returns [`Error::Io`] if the directory or any migration file cannot be
/// read. No partial result is returned in that case.
pub fn load(migrations_dir: impl AsRef<Path>) -> MigrateResult<Vec<Migration>> {
    let migrations_dir = migrations_dir.as_ref();

    let mut entries = Vec::new();
    for entry in fs::read_dir(migrations_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        entries.push(entry.path());
    }
    entries.sort();

    let mut pairs: BTreeMap<i64, Pair> = BTreeMap::new();

    for path in entries {
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some((version, direction)) = parse_file_name(name) else {
            debug!("skipping {name}: not a migration file name");
            continue;
        };

        let sql = fs::read_to_string(&path)?;
        let pair = pairs.entry(version).or_default();

        match direction {
            Direction::Up => {
                if let Some((previous, _)) = &pair.up {
                    warn!("version {version}: {name} replaces up-script {previous}");
                }
                pair.up = Some((name.to_string(), sql));
            }
            Direction::Down => {
                if pair.down.is_some() {
                    warn!("version {version}: {name} replaces an earlier down-script");
                }
                pair.down = Some(sql);
            }
        }
    }

    // BTreeMap iteration is already in ascending version order
    let migrations: Vec<Migration> = pairs
        .into_iter()
        .filter_map(|(version, pair)| {
            let (filename, up_sql) = pair.up?;
            if up_sql.is_empty() {
                return None;
            }
            Some(Migration {
                version,
                filename,
                up_sql,
                down_sql: pair.down,
            })
        })
        .collect();

    debug!(
        "discovered {} migrations in {}",
        migrations.len(),
        migrations_dir.display()
    );

    Ok(migrations)
}
