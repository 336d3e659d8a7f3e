//! Post-apply data store migrations.
//!
//! Migrations run in registration order, each inside its own transaction. A
//! failing migration is rolled back and reported as a warning; it never fails
//! the pipeline run.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use punchcard_core::{OpsLog, UpdateError};
use rusqlite::{params, Connection};
use semver::Version;
use serde::Serialize;

pub struct MigrationContext<'a> {
    pub run_id: &'a str,
    pub from_version: &'a Version,
    pub to_version: &'a Version,
    pub applied_at: DateTime<Utc>,
}

pub trait Migration: Send + Sync {
    fn id(&self) -> &str;
    fn run(&self, conn: &Connection, ctx: &MigrationContext<'_>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationWarning {
    pub migration: String,
    pub message: String,
}

#[derive(Default)]
pub struct MigrationSet {
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        Self::new().with(RecordUpdateHistory)
    }

    pub fn with(mut self, migration: impl Migration + 'static) -> Self {
        self.migrations.push(Box::new(migration));
        self
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn run_all(
        &self,
        data_store: &Path,
        ctx: &MigrationContext<'_>,
        log: &OpsLog,
    ) -> Vec<MigrationWarning> {
        if self.migrations.is_empty() {
            return Vec::new();
        }

        let conn = match Connection::open(data_store)
            .with_context(|| format!("failed to open data store {}", data_store.display()))
        {
            Ok(conn) => conn,
            Err(err) => {
                let err = UpdateError::migration(err);
                log.warn("pipeline.migrate", err.to_string());
                return vec![MigrationWarning {
                    migration: "*".to_string(),
                    message: err.message().to_string(),
                }];
            }
        };

        let mut warnings = Vec::new();
        for migration in &self.migrations {
            match run_in_transaction(&conn, migration.as_ref(), ctx) {
                Ok(()) => log.info(
                    "pipeline.migrate",
                    format!("migration {} applied (run {})", migration.id(), ctx.run_id),
                ),
                Err(err) => {
                    let err = UpdateError::migration(
                        err.context(format!("migration {} failed", migration.id())),
                    );
                    log.warn("pipeline.migrate", err.to_string());
                    warnings.push(MigrationWarning {
                        migration: migration.id().to_string(),
                        message: err.message().to_string(),
                    });
                }
            }
        }
        warnings
    }
}

fn run_in_transaction(
    conn: &Connection,
    migration: &dyn Migration,
    ctx: &MigrationContext<'_>,
) -> Result<()> {
    let tx = conn
        .unchecked_transaction()
        .context("failed to begin migration transaction")?;
    migration.run(&tx, ctx)?;
    tx.commit().context("failed to commit migration")
}

/// Appends the applied version to `punchcard_update_history`.
pub struct RecordUpdateHistory;

impl Migration for RecordUpdateHistory {
    fn id(&self) -> &str {
        "record_update_history"
    }

    fn run(&self, conn: &Connection, ctx: &MigrationContext<'_>) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS punchcard_update_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version TEXT NOT NULL,
                previous_version TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to create punchcard_update_history")?;
        conn.execute(
            "INSERT INTO punchcard_update_history (version, previous_version, applied_at)
             VALUES (?1, ?2, ?3)",
            params![
                ctx.to_version.to_string(),
                ctx.from_version.to_string(),
                ctx.applied_at.to_rfc3339_opts(SecondsFormat::Secs, true)
            ],
        )
        .context("failed to record update history")?;
        Ok(())
    }
}
