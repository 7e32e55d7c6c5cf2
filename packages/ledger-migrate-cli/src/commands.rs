use std::io::Write;

use anyhow::{Context, Result};
use ledger_migrate::sqlite::Runner;

pub fn execute_up(runner: &mut Runner, out: &mut impl Write) -> Result<()> {
    let applied = runner.up().context("migration up failed")?;

    if applied.is_empty() {
        writeln!(out, "Database is up to date")?;
    } else {
        writeln!(out, "Applied {} migration(s)", applied.len())?;
    }
    Ok(())
}

pub fn execute_down(runner: &mut Runner, out: &mut impl Write) -> Result<()> {
    let reverted = runner.rollback().context("migration rollback failed")?;

    writeln!(
        out,
        "Rolled back migration {}: {}",
        reverted.version, reverted.filename
    )?;
    Ok(())
}

pub fn execute_status(runner: &Runner, out: &mut impl Write) -> Result<()> {
    let status = runner
        .status()
        .context("failed to read migration status")?;

    if !status.ledger_exists {
        writeln!(
            out,
            "Migration history table does not exist. No migrations have been run."
        )?;
        return Ok(());
    }

    writeln!(out, "Applied migrations:")?;
    writeln!(out, "Version | Filename | Applied At")?;
    writeln!(out, "--------|----------|------------")?;
    for migration in &status.applied {
        writeln!(
            out,
            "{:7} | {} | {}",
            migration.version, migration.filename, migration.applied_at
        )?;
    }
    Ok(())
}

pub fn execute_pending(runner: &Runner, out: &mut impl Write) -> Result<()> {
    let pending = runner
        .pending()
        .context("failed to list pending migrations")?;

    if pending.is_empty() {
        writeln!(out, "No pending migrations")?;
        return Ok(());
    }

    writeln!(out, "Pending migrations:")?;
    for migration in &pending {
        let reversible = if migration.down_sql.is_some() {
            ""
        } else {
            " (no down migration)"
        };
        writeln!(
            out,
            "{:7} | {}{reversible}",
            migration.version, migration.filename
        )?;
    }
    Ok(())
}
