//! Turso database migration support.
//!
//! This module provides the same ledger-backed runner as the SQLite backend
//! for databases opened through the async `turso` crate. Applied versions are
//! tracked in the `migration_history` table.
//!
//! # Features
//! - Automatic migration tracking via `migration_history` table
//! - One transaction per migration (script and ledger row commit together)
//! - Idempotent migrations (safe to run multiple times)
//! - Single-step rollback of the latest applied migration
//!
//! # Usage
//! ```ignore
//! use ledger_migrate::turso::Runner;
//!
//! async fn run_migrations() -> ledger_migrate::MigrateResult<()> {
//!     let db = turso::Builder::new_local("app.db").build().await?;
//!     let mut runner = Runner::new(db.connect()?, "migrations");
//!     runner.up().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;
use turso::Connection;

use crate::{AppliedMigration, Error, MigrateResult, Migration, Status};

/// Ensures the ledger table exists in the database.
async fn ensure_ledger_table(conn: &Connection) -> MigrateResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migration_history (
            version INTEGER PRIMARY KEY,
            filename TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        (),
    )
    .await?;
    Ok(())
}

async fn ledger_exists(conn: &Connection) -> MigrateResult<bool> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'table' AND name = 'migration_history'",
            (),
        )
        .await?;

    let mut count = 0;
    if let Some(row) = rows.next().await? {
        if let Some(value) = row.get_value(0)?.as_integer() {
            count = *value;
        }
    }
    Ok(count > 0)
}

/// Builds a ledger record from the `version, filename, applied_at` columns.
fn ledger_row(
    version: Option<i64>,
    filename: Option<String>,
    applied_at: Option<String>,
) -> MigrateResult<AppliedMigration> {
    let version =
        version.ok_or_else(|| Error::MalformedLedger("version is not an integer".into()))?;
    let filename = filename.ok_or_else(|| {
        Error::MalformedLedger(format!("filename of version {version} is not text"))
    })?;
    let applied_at = applied_at.ok_or_else(|| {
        Error::MalformedLedger(format!("applied_at of version {version} is not text"))
    })?;

    Ok(AppliedMigration {
        version,
        filename,
        applied_at,
    })
}

/// Retrieves the set of already applied migration versions from the ledger.
async fn get_applied_versions(conn: &Connection) -> MigrateResult<HashSet<i64>> {
    let mut rows = conn.query("SELECT version FROM migration_history", ()).await?;

    let mut applied_set = HashSet::new();
    while let Some(row) = rows.next().await? {
        let version = row
            .get_value(0)?
            .as_integer()
            .copied()
            .ok_or_else(|| Error::MalformedLedger("version is not an integer".into()))?;
        applied_set.insert(version);
    }

    Ok(applied_set)
}

async fn get_applied_migrations(conn: &Connection) -> MigrateResult<Vec<AppliedMigration>> {
    let mut rows = conn
        .query(
            "SELECT version, filename, applied_at FROM migration_history ORDER BY version",
            (),
        )
        .await?;

    let mut applied = Vec::new();
    while let Some(row) = rows.next().await? {
        applied.push(ledger_row(
            row.get_value(0)?.as_integer().copied(),
            row.get_value(1)?.as_text().map(|s| s.to_string()),
            row.get_value(2)?.as_text().map(|s| s.to_string()),
        )?);
    }
    Ok(applied)
}

async fn get_latest_applied(conn: &Connection) -> MigrateResult<Option<AppliedMigration>> {
    let mut rows = conn
        .query(
            "SELECT version, filename, applied_at FROM migration_history
             ORDER BY version DESC LIMIT 1",
            (),
        )
        .await?;

    let Some(row) = rows.next().await? else {
        return Ok(None);
    };

    let latest = ledger_row(
        row.get_value(0)?.as_integer().copied(),
        row.get_value(1)?.as_text().map(|s| s.to_string()),
        row.get_value(2)?.as_text().map(|s| s.to_string()),
    )?;
    Ok(Some(latest))
}

/// Applies one migration and records it, inside a single transaction.
async fn apply(conn: &mut Connection, migration: &Migration) -> MigrateResult<()> {
    let tx = conn.transaction().await?;

    if let Err(e) = tx.execute_batch(&migration.up_sql).await {
        tx.rollback().await?;
        return Err(Error::MigrationFailed {
            version: migration.version,
            message: e.to_string(),
        });
    }

    if let Err(e) = tx
        .execute(
            "INSERT INTO migration_history (version, filename) VALUES (?, ?)",
            (migration.version, migration.filename.as_str()),
        )
        .await
    {
        tx.rollback().await?;
        return Err(Error::MigrationFailed {
            version: migration.version,
            message: e.to_string(),
        });
    }

    tx.commit().await?;
    Ok(())
}

/// Executes all pending migrations in ascending version order.
///
/// Each migration runs in its own transaction together with its ledger row.
/// If one fails, that transaction is rolled back, later migrations are not
/// attempted, and earlier ones stay applied.
///
/// # Returns
/// The versions applied by this call.
///
/// # Errors
/// Returns [`Error::MigrationFailed`] with the offending version if an
/// up-script or its ledger insert fails.
///
/// # Example
/// ```no_run
/// use ledger_migrate::Migration;
/// use turso::Connection;
///
/// async fn apply_migrations(conn: &mut Connection) {
///     let migrations = vec![
///         Migration::new(1, "001_initial.up.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);"),
///         Migration::new(2, "002_add_email.up.sql", "ALTER TABLE users ADD COLUMN email TEXT;"),
///     ];
///     ledger_migrate::turso::migrate(conn, &migrations).await.unwrap();
/// }
/// ```
pub async fn migrate(conn: &mut Connection, migrations: &[Migration]) -> MigrateResult<Vec<i64>> {
    ensure_ledger_table(conn).await?;
    apply_pending(conn, migrations).await
}

/// Applies what the ledger does not list yet. The ledger must exist.
async fn apply_pending(conn: &mut Connection, migrations: &[Migration]) -> MigrateResult<Vec<i64>> {
    let applied_versions = get_applied_versions(conn).await?;

    let mut applied = Vec::new();
    for migration in migrations
        .iter()
        .filter(|m| !applied_versions.contains(&m.version))
    {
        apply(conn, migration).await?;
        info!(
            "Applied migration {}: {}",
            migration.version, migration.filename
        );
        applied.push(migration.version);
    }

    Ok(applied)
}

/// Reverts the most recently applied migration in one transaction.
///
/// # Errors
/// - [`Error::NothingToRollBack`] if the ledger is empty
/// - [`Error::DownMigrationNotFound`] if the latest version has no down-script
/// - [`Error::RollbackFailed`] if the down-script or the ledger delete fails
pub async fn rollback(
    conn: &mut Connection,
    migrations: &[Migration],
) -> MigrateResult<AppliedMigration> {
    ensure_ledger_table(conn).await?;
    let latest = get_latest_applied(conn)
        .await?
        .ok_or(Error::NothingToRollBack)?;
    revert(conn, latest, migrations).await
}

/// Runs the down-script of `latest` and removes its ledger row.
async fn revert(
    conn: &mut Connection,
    latest: AppliedMigration,
    migrations: &[Migration],
) -> MigrateResult<AppliedMigration> {
    let down_sql = migrations
        .iter()
        .find(|m| m.version == latest.version)
        .and_then(|m| m.down_sql.as_deref())
        .ok_or(Error::DownMigrationNotFound(latest.version))?;

    let tx = conn.transaction().await?;

    if let Err(e) = tx.execute_batch(down_sql).await {
        tx.rollback().await?;
        return Err(Error::RollbackFailed {
            version: latest.version,
            message: e.to_string(),
        });
    }

    if let Err(e) = tx
        .execute(
            "DELETE FROM migration_history WHERE version = ?",
            [latest.version],
        )
        .await
    {
        tx.rollback().await?;
        return Err(Error::RollbackFailed {
            version: latest.version,
            message: e.to_string(),
        });
    }

    tx.commit().await?;

    info!(
        "Rolled back migration {}: {}",
        latest.version, latest.filename
    );
    Ok(latest)
}

/// Reports whether the ledger exists and which migrations it records.
pub async fn status(conn: &Connection) -> MigrateResult<Status> {
    if !ledger_exists(conn).await? {
        return Ok(Status::default());
    }

    Ok(Status {
        ledger_exists: true,
        applied: get_applied_migrations(conn).await?,
    })
}

/// Returns the migrations whose version is not in the ledger.
pub async fn pending(conn: &Connection, migrations: &[Migration]) -> MigrateResult<Vec<Migration>> {
    let applied_versions = if ledger_exists(conn).await? {
        get_applied_versions(conn).await?
    } else {
        HashSet::new()
    };

    Ok(migrations
        .iter()
        .filter(|m| !applied_versions.contains(&m.version))
        .cloned()
        .collect())
}

/// Runs migrations from a directory against an owned Turso connection.
pub struct Runner {
    conn: Connection,
    migrations_dir: PathBuf,
}

impl Runner {
    pub fn new(conn: Connection, migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            conn,
            migrations_dir: migrations_dir.into(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    pub fn into_inner(self) -> Connection {
        self.conn
    }

    pub async fn up(&mut self) -> MigrateResult<Vec<i64>> {
        ensure_ledger_table(&self.conn).await?;
        let migrations = crate::load(&self.migrations_dir)?;
        apply_pending(&mut self.conn, &migrations).await
    }

    pub async fn rollback(&mut self) -> MigrateResult<AppliedMigration> {
        ensure_ledger_table(&self.conn).await?;
        let latest = get_latest_applied(&self.conn)
            .await?
            .ok_or(Error::NothingToRollBack)?;
        let migrations = crate::load(&self.migrations_dir)?;
        revert(&mut self.conn, latest, &migrations).await
    }

    pub async fn status(&self) -> MigrateResult<Status> {
        status(&self.conn).await
    }

    pub async fn pending(&self) -> MigrateResult<Vec<Migration>> {
        let migrations = crate::load(&self.migrations_dir)?;
        pending(&self.conn, &migrations).await
    }
}
