use rusqlite::{Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::{AppliedMigration, Error, MigrateResult, Migration, Status};

/// Ensures the ledger table exists in the database.
///
/// Creates a `migration_history` table if it doesn't exist, which tracks:
/// - `version`: The numeric version of each applied migration
/// - `filename`: The up-script the version was applied from
/// - `applied_at`: Timestamp when the migration was applied
fn ensure_ledger_table(conn: &Connection) -> MigrateResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migration_history (
            version INTEGER PRIMARY KEY,
            filename TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

fn ledger_exists(conn: &Connection) -> MigrateResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master
         WHERE type = 'table' AND name = 'migration_history'",
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Retrieves the set of already applied migration versions from the ledger.
fn get_applied_versions(conn: &Connection) -> MigrateResult<HashSet<i64>> {
    let mut statement = conn.prepare("SELECT version FROM migration_history")?;
    let versions = statement
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(versions)
}

fn get_applied_migrations(conn: &Connection) -> MigrateResult<Vec<AppliedMigration>> {
    let mut statement = conn.prepare(
        "SELECT version, filename, applied_at FROM migration_history ORDER BY version",
    )?;
    let rows = statement
        .query_map([], |row| {
            Ok(AppliedMigration {
                version: row.get(0)?,
                filename: row.get(1)?,
                applied_at: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn get_latest_applied(conn: &Connection) -> MigrateResult<Option<AppliedMigration>> {
    let latest = conn
        .query_row(
            "SELECT version, filename, applied_at FROM migration_history
             ORDER BY version DESC LIMIT 1",
            [],
            |row| {
                Ok(AppliedMigration {
                    version: row.get(0)?,
                    filename: row.get(1)?,
                    applied_at: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(latest)
}

/// Applies one migration and records it, inside a single transaction.
fn apply(conn: &mut Connection, migration: &Migration) -> MigrateResult<()> {
    let failed = |e: rusqlite::Error| Error::MigrationFailed {
        version: migration.version,
        message: e.to_string(),
    };

    let tx = conn.transaction()?;

    tx.execute_batch(&migration.up_sql).map_err(failed)?;
    tx.execute(
        "INSERT INTO migration_history (version, filename) VALUES (?1, ?2)",
        (migration.version, &migration.filename),
    )
    .map_err(failed)?;

    tx.commit().map_err(failed)?;
    Ok(())
}

/// Executes all pending migrations in order.
///
/// This function:
/// 1. Ensures the ledger table exists
/// 2. Identifies which versions have already been applied
/// 3. Executes pending migrations in ascending version order
/// 4. Records each migration as applied
///
/// Every migration runs in its own transaction together with its ledger
/// insert. When one fails, its transaction is rolled back and processing
/// stops; migrations committed before it stay applied.
///
/// # Arguments
/// * `conn` - Mutable reference to the SQLite connection
/// * `migrations` - Migrations to apply, sorted by version as [`crate::load`] returns them
///
/// # Returns
/// The versions applied by this call, in the order they were applied.
///
/// # Errors
/// Returns [`Error::MigrationFailed`] carrying the offending version if an
/// up-script or its ledger insert fails, or [`Error::Database`] if the ledger
/// cannot be read.
pub fn migrate(conn: &mut Connection, migrations: &[Migration]) -> MigrateResult<Vec<i64>> {
    ensure_ledger_table(conn)?;
    apply_pending(conn, migrations)
}

/// Applies what the ledger does not list yet. The ledger must exist.
fn apply_pending(conn: &mut Connection, migrations: &[Migration]) -> MigrateResult<Vec<i64>> {
    let applied_versions = get_applied_versions(conn)?;

    let mut applied = Vec::new();
    for migration in migrations
        .iter()
        .filter(|m| !applied_versions.contains(&m.version))
    {
        apply(conn, migration)?;
        info!(
            "Applied migration {}: {}",
            migration.version, migration.filename
        );
        applied.push(migration.version);
    }

    Ok(applied)
}

/// Reverts the most recently applied migration.
///
/// The down-script and the removal of the ledger row run in one
/// transaction, so either both take effect or neither does. Only one
/// migration is reverted per call.
///
/// # Errors
/// - [`Error::NothingToRollBack`] if the ledger is empty
/// - [`Error::DownMigrationNotFound`] if the latest version is not in
///   `migrations` or has no down-script
/// - [`Error::RollbackFailed`] if the down-script or the ledger delete fails
pub fn rollback(conn: &mut Connection, migrations: &[Migration]) -> MigrateResult<AppliedMigration> {
    ensure_ledger_table(conn)?;
    let latest = get_latest_applied(conn)?.ok_or(Error::NothingToRollBack)?;
    revert(conn, latest, migrations)
}

/// Runs the down-script of `latest` and removes its ledger row.
fn revert(
    conn: &mut Connection,
    latest: AppliedMigration,
    migrations: &[Migration],
) -> MigrateResult<AppliedMigration> {
    let down_sql = migrations
        .iter()
        .find(|m| m.version == latest.version)
        .and_then(|m| m.down_sql.as_deref())
        .ok_or(Error::DownMigrationNotFound(latest.version))?;

    let failed = |e: rusqlite::Error| Error::RollbackFailed {
        version: latest.version,
        message: e.to_string(),
    };

    let tx = conn.transaction()?;

    tx.execute_batch(down_sql).map_err(failed)?;
    tx.execute(
        "DELETE FROM migration_history WHERE version = ?1",
        [latest.version],
    )
    .map_err(failed)?;

    tx.commit().map_err(failed)?;

    info!(
        "Rolled back migration {}: {}",
        latest.version, latest.filename
    );
    Ok(latest)
}

/// Reports whether the ledger exists and which migrations it records.
///
/// Never creates the ledger table.
pub fn status(conn: &Connection) -> MigrateResult<Status> {
    if !ledger_exists(conn)? {
        return Ok(Status::default());
    }

    Ok(Status {
        ledger_exists: true,
        applied: get_applied_migrations(conn)?,
    })
}

/// Returns the migrations from `migrations` whose version is not in the
/// ledger. A missing ledger means nothing has been applied.
pub fn pending(conn: &Connection, migrations: &[Migration]) -> MigrateResult<Vec<Migration>> {
    let applied_versions = if ledger_exists(conn)? {
        get_applied_versions(conn)?
    } else {
        HashSet::new()
    };

    Ok(migrations
        .iter()
        .filter(|m| !applied_versions.contains(&m.version))
        .cloned()
        .collect())
}

/// Runs migrations from a directory against an owned SQLite connection.
///
/// Every operation discovers migrations from disk again, so a runner always
/// reflects the current contents of its directory.
///
/// # Example
/// ```no_run
/// use ledger_migrate::sqlite::Runner;
/// use rusqlite::Connection;
///
/// let conn = Connection::open("app.db").unwrap();
/// let mut runner = Runner::new(conn, "migrations");
/// let applied = runner.up().unwrap();
/// println!("applied {} migrations", applied.len());
/// ```
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

    /// Gives back the underlying connection.
    pub fn into_inner(self) -> Connection {
        self.conn
    }

    /// Applies every pending migration. See [`migrate`].
    pub fn up(&mut self) -> MigrateResult<Vec<i64>> {
        ensure_ledger_table(&self.conn)?;
        let migrations = crate::load(&self.migrations_dir)?;
        apply_pending(&mut self.conn, &migrations)
    }

    /// Reverts the latest applied migration. See [`rollback`].
    pub fn rollback(&mut self) -> MigrateResult<AppliedMigration> {
        ensure_ledger_table(&self.conn)?;
        let latest = get_latest_applied(&self.conn)?.ok_or(Error::NothingToRollBack)?;
        let migrations = crate::load(&self.migrations_dir)?;
        revert(&mut self.conn, latest, &migrations)
    }

    pub fn status(&self) -> MigrateResult<Status> {
        status(&self.conn)
    }

    /// Lists discovered migrations that `up` would apply.
    pub fn pending(&self) -> MigrateResult<Vec<Migration>> {
        let migrations = crate::load(&self.migrations_dir)?;
        pending(&self.conn, &migrations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use std::fs;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                [name],
                |row| row.get(0),
            )
            .unwrap();
        count == 1
    }

    fn ledger_versions(conn: &Connection) -> Vec<i64> {
        get_applied_migrations(conn)
            .unwrap()
            .into_iter()
            .map(|m| m.version)
            .collect()
    }

    fn users_migrations() -> Vec<Migration> {
        vec![
            Migration::new(
                1,
                "001_create_users.up.sql",
                "CREATE TABLE users (id INTEGER PRIMARY KEY);",
            )
            .with_down("DROP TABLE users;"),
            Migration::new(
                2,
                "002_add_email.up.sql",
                "ALTER TABLE users ADD COLUMN email TEXT;",
            )
            .with_down("ALTER TABLE users DROP COLUMN email;"),
        ]
    }

    #[test]
    fn test_ensure_ledger_table() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_ledger_table(&conn).unwrap();
        ensure_ledger_table(&conn).unwrap();

        assert!(table_exists(&conn, "migration_history"));
    }

    #[test]
    fn test_migrate() {
        let mut conn = Connection::open_in_memory().unwrap();

        let applied = migrate(&mut conn, &users_migrations()).unwrap();
        assert_eq!(applied, vec![1, 2]);
        assert_eq!(ledger_versions(&conn), vec![1, 2]);

        let rows = get_applied_migrations(&conn).unwrap();
        assert_eq!(rows[0].filename, "001_create_users.up.sql");
        assert!(rows.windows(2).all(|w| w[0].applied_at <= w[1].applied_at));

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('users') WHERE name='email'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_migrate_idempotency() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrations = users_migrations();

        migrate(&mut conn, &migrations).unwrap();
        let second = migrate(&mut conn, &migrations).unwrap();

        assert!(second.is_empty());
        assert_eq!(ledger_versions(&conn), vec![1, 2]);
    }

    #[test]
    fn test_migrate_failure_keeps_earlier_commits() {
        let mut conn = Connection::open_in_memory().unwrap();

        let migrations = &[
            Migration::new(1, "001_valid.up.sql", "CREATE TABLE test (id INTEGER);"),
            Migration::new(2, "002_invalid.up.sql", "INVALID SQL STATEMENT;"),
            Migration::new(3, "003_never.up.sql", "CREATE TABLE never (id INTEGER);"),
        ];

        let result = migrate(&mut conn, migrations);
        assert!(matches!(
            result,
            Err(Error::MigrationFailed { version: 2, .. })
        ));

        // One transaction per migration: the first one stays committed
        assert_eq!(ledger_versions(&conn), vec![1]);
        assert!(table_exists(&conn, "test"));
        assert!(!table_exists(&conn, "never"));
    }

    #[test]
    fn test_partial_script_is_atomic() {
        let mut conn = Connection::open_in_memory().unwrap();

        let migrations = &[Migration::new(
            1,
            "001_partial.up.sql",
            "CREATE TABLE partial (id INTEGER);
             INSERT INTO partial (id) VALUES (1);
             INSERT INTO missing_table (id) VALUES (1);",
        )];

        let result = migrate(&mut conn, migrations);
        assert!(matches!(
            result,
            Err(Error::MigrationFailed { version: 1, .. })
        ));

        assert!(!table_exists(&conn, "partial"));
        assert!(ledger_versions(&conn).is_empty());
    }

    #[test]
    fn test_ledger_insert_failure_rolls_back_script() {
        let mut conn = Connection::open_in_memory().unwrap();

        // The script claims its own version, so the ledger insert hits the primary key
        let migrations = &[Migration::new(
            7,
            "007_conflict.up.sql",
            "CREATE TABLE conflict (id INTEGER);
             INSERT INTO migration_history (version, filename) VALUES (7, 'rogue');",
        )];

        let result = migrate(&mut conn, migrations);
        assert!(matches!(
            result,
            Err(Error::MigrationFailed { version: 7, .. })
        ));

        assert!(!table_exists(&conn, "conflict"));
        assert!(ledger_versions(&conn).is_empty());
    }

    #[test]
    fn test_rollback_reverts_latest_only() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrations = users_migrations();
        migrate(&mut conn, &migrations).unwrap();

        let reverted = rollback(&mut conn, &migrations).unwrap();
        assert_eq!(reverted.version, 2);
        assert_eq!(reverted.filename, "002_add_email.up.sql");
        assert_eq!(ledger_versions(&conn), vec![1]);
        assert!(table_exists(&conn, "users"));

        let reverted = rollback(&mut conn, &migrations).unwrap();
        assert_eq!(reverted.version, 1);
        assert!(ledger_versions(&conn).is_empty());
        assert!(!table_exists(&conn, "users"));
    }

    #[test]
    fn test_apply_then_rollback_restores_ledger() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrations = users_migrations();
        migrate(&mut conn, &migrations[..1]).unwrap();
        let before = get_applied_migrations(&conn).unwrap();

        migrate(&mut conn, &migrations).unwrap();
        rollback(&mut conn, &migrations).unwrap();

        assert_eq!(get_applied_migrations(&conn).unwrap(), before);
    }

    #[test]
    fn test_rollback_empty_ledger() {
        let mut conn = Connection::open_in_memory().unwrap();

        let result = rollback(&mut conn, &users_migrations());
        assert!(matches!(result, Err(Error::NothingToRollBack)));
        assert!(ledger_versions(&conn).is_empty());
    }

    #[test]
    fn test_rollback_without_down_script() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrations = &[Migration::new(
            1,
            "001_init.up.sql",
            "CREATE TABLE t (id INTEGER);",
        )];
        migrate(&mut conn, migrations).unwrap();

        let result = rollback(&mut conn, migrations);
        assert!(matches!(result, Err(Error::DownMigrationNotFound(1))));
        assert_eq!(ledger_versions(&conn), vec![1]);
        assert!(table_exists(&conn, "t"));

        // Same outcome when the migration vanished from disk
        let result = rollback(&mut conn, &[]);
        assert!(matches!(result, Err(Error::DownMigrationNotFound(1))));
    }

    #[test]
    fn test_failed_down_script_keeps_ledger_row() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrations = &[Migration::new(
            1,
            "001_init.up.sql",
            "CREATE TABLE t (id INTEGER);",
        )
        .with_down("DROP TABLE t; DROP TABLE not_there;")];
        migrate(&mut conn, migrations).unwrap();

        let result = rollback(&mut conn, migrations);
        assert!(matches!(
            result,
            Err(Error::RollbackFailed { version: 1, .. })
        ));
        assert_eq!(ledger_versions(&conn), vec![1]);
        assert!(table_exists(&conn, "t"));
    }

    #[test]
    fn test_status_without_ledger() {
        let conn = Connection::open_in_memory().unwrap();

        let status = status(&conn).unwrap();
        assert!(!status.ledger_exists);
        assert!(status.applied.is_empty());
        assert!(!table_exists(&conn, "migration_history"));
    }

    #[test]
    fn test_status_and_pending() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrations = users_migrations();

        assert_eq!(pending(&conn, &migrations).unwrap().len(), 2);

        migrate(&mut conn, &migrations[..1]).unwrap();

        let status = status(&conn).unwrap();
        assert!(status.ledger_exists);
        assert_eq!(status.applied.len(), 1);
        assert_eq!(status.applied[0].version, 1);
        assert!(!status.applied[0].applied_at.is_empty());

        let remaining = pending(&conn, &migrations).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].version, 2);
    }

    #[test]
    fn test_runner_reloads_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("001_init.up.sql"),
            "CREATE TABLE t (id INTEGER);",
        )
        .unwrap();
        fs::write(dir.path().join("001_init.down.sql"), "DROP TABLE t;").unwrap();

        let mut runner = Runner::new(Connection::open_in_memory().unwrap(), dir.path());
        assert_eq!(runner.up().unwrap(), vec![1]);
        assert!(runner.pending().unwrap().is_empty());

        fs::write(
            dir.path().join("002_add_col.up.sql"),
            "ALTER TABLE t ADD COLUMN c TEXT;",
        )
        .unwrap();
        assert_eq!(runner.pending().unwrap().len(), 1);
        assert_eq!(runner.up().unwrap(), vec![2]);

        let result = runner.rollback();
        assert!(matches!(result, Err(Error::DownMigrationNotFound(2))));
        assert_eq!(ledger_versions(runner.connection()), vec![1, 2]);
    }

    #[test]
    fn test_runner_applies_timestamp_versions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("20240101120000_init.up.sql"),
            "CREATE TABLE t (id INTEGER);",
        )
        .unwrap();
        fs::write(
            dir.path().join("20240101120000_init.down.sql"),
            "DROP TABLE t;",
        )
        .unwrap();

        let mut runner = Runner::new(Connection::open_in_memory().unwrap(), dir.path());
        assert_eq!(runner.up().unwrap(), vec![20240101120000]);
        assert_eq!(ledger_versions(runner.connection()), vec![20240101120000]);
        assert!(table_exists(runner.connection(), "t"));

        let reverted = runner.rollback().unwrap();
        assert_eq!(reverted.version, 20240101120000);
        assert!(!table_exists(runner.connection(), "t"));
    }

    #[test]
    fn test_runner_rollback_checks_ledger_before_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = Runner::new(
            Connection::open_in_memory().unwrap(),
            dir.path().join("missing"),
        );

        assert!(matches!(runner.rollback(), Err(Error::NothingToRollBack)));
        assert!(matches!(runner.up(), Err(Error::Io(_))));
    }
}
