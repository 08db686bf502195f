use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// Embedded SQL migration with version, direction, and content.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up_sql: include_str!("sql/001_init.up.sql"),
        down_sql: include_str!("sql/001_init.down.sql"),
    },
    Migration {
        version: 2,
        up_sql: include_str!("sql/002_aggregation_indexes.up.sql"),
        down_sql: include_str!("sql/002_aggregation_indexes.down.sql"),
    },
];

/// Applied and available schema versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationStatus {
    pub current: u32,
    pub latest: u32,
}

impl MigrationStatus {
    pub fn is_current(&self) -> bool {
        self.current >= self.latest
    }
}

/// Manages SQLite schema migrations.
pub trait Migrator {
    /// Applies all pending forward migrations.
    fn up(&self) -> Result<()>;

    /// Rolls back the last applied migration.
    fn down(&self) -> Result<()>;

    /// Returns the current and latest migration versions.
    fn status(&self) -> Result<MigrationStatus>;
}

/// SQLite migration runner.
///
/// Each migration runs in its own transaction together with the version
/// bump, so a failed migration leaves the previous version in place.
pub struct SqliteMigrator<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteMigrator<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Ensures the schema_migrations tracking table exists.
    fn ensure_migrations_table(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    version INTEGER NOT NULL
                )",
            )
            .context("creating schema_migrations table")
    }

    fn current_version(&self) -> Result<u32> {
        let version: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM schema_migrations WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("querying migration version")?;

        Ok(version.map_or(0, |v| v as u32))
    }

    /// Runs `sql` and records `version` in one transaction.
    fn apply(&self, sql: &str, version: u32) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("starting migration transaction")?;

        tx.execute_batch(sql)
            .context("executing migration statements")?;

        if version == 0 {
            tx.execute("DELETE FROM schema_migrations", [])
                .context("clearing migration version")?;
        } else {
            tx.execute(
                "INSERT INTO schema_migrations (id, version) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET version = excluded.version",
                params![version],
            )
            .context("recording migration version")?;
        }

        tx.commit().context("committing migration")
    }
}

impl Migrator for SqliteMigrator<'_> {
    fn up(&self) -> Result<()> {
        self.ensure_migrations_table()?;

        let current_version = self.current_version()?;
        tracing::info!(current_version, "running migrations");

        let mut applied = 0u32;

        for migration in MIGRATIONS {
            if migration.version <= current_version {
                continue;
            }

            tracing::info!(version = migration.version, "applying migration");

            self.apply(migration.up_sql, migration.version)
                .with_context(|| format!("applying migration version {}", migration.version))?;

            applied += 1;
        }

        if applied == 0 {
            tracing::info!("no pending migrations");
        } else {
            tracing::info!(version = self.current_version()?, applied, "migrations completed");
        }

        Ok(())
    }

    fn down(&self) -> Result<()> {
        self.ensure_migrations_table()?;

        let current_version = self.current_version()?;

        if current_version == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current_version)
            .with_context(|| format!("migration version {current_version} not found"))?;

        let prev_version = MIGRATIONS
            .iter()
            .filter(|m| m.version < current_version)
            .map(|m| m.version)
            .max()
            .unwrap_or(0);

        tracing::info!(version = current_version, "rolling back migration");

        self.apply(migration.down_sql, prev_version)
            .with_context(|| format!("rolling back migration version {current_version}"))?;

        tracing::info!(version = prev_version, "rollback completed");

        Ok(())
    }

    fn status(&self) -> Result<MigrationStatus> {
        self.ensure_migrations_table()?;
        Ok(MigrationStatus {
            current: self.current_version()?,
            latest: latest_version(),
        })
    }
}

/// Highest embedded migration version.
pub fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}
