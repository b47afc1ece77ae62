//! Versioned SQL migration runner, one instance per backend.
//!
//! Grounded on the host's migration runner shape (`_migrations` bookkeeping
//! table, versioned SQL files applied via `include_str!`, batch execution
//! of the whole file rather than statement-splitting).

use sqlx::{PgPool, Row, SqlitePool};
use tracing::info;

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub name: String,
}

const POSTGRES_MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "initial_schema",
    include_str!("../../migrations/postgres/001_initial_schema.sql"),
)];

const SQLITE_MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "initial_schema",
    include_str!("../../migrations/sqlite/001_initial_schema.sql"),
)];

/// Migration runner for the PostgreSQL backend.
pub struct PgMigrator {
    pool: PgPool,
}

impl PgMigrator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn init_migration_table(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS _migrations (
                version BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn applied_versions(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT version FROM _migrations ORDER BY version")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(rows.into_iter().map(|r| r.get("version")).collect())
    }

    pub async fn migrate(&self) -> Result<()> {
        info!("initializing migration tracking table");
        self.init_migration_table().await?;
        let applied = self.applied_versions().await?;

        for (version, name, sql) in POSTGRES_MIGRATIONS {
            if applied.contains(version) {
                continue;
            }
            info!(version, name, "applying migration");
            sqlx::raw_sql(sql)
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;
            sqlx::query("INSERT INTO _migrations (version, name) VALUES ($1, $2) ON CONFLICT DO NOTHING")
                .bind(version)
                .bind(*name)
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;
        }

        info!("all PostgreSQL migrations applied");
        Ok(())
    }
}

/// Migration runner for the SQLite backend.
pub struct SqliteMigrator {
    pool: SqlitePool,
}

impl SqliteMigrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn init_migration_table(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )"#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn applied_versions(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT version FROM _migrations ORDER BY version")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(rows.into_iter().map(|r| r.get("version")).collect())
    }

    pub async fn migrate(&self) -> Result<()> {
        info!("initializing migration tracking table");
        self.init_migration_table().await?;
        let applied = self.applied_versions().await?;

        for (version, name, sql) in SQLITE_MIGRATIONS {
            if applied.contains(version) {
                continue;
            }
            info!(version, name, "applying migration");
            sqlx::raw_sql(sql)
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;
            sqlx::query("INSERT OR IGNORE INTO _migrations (version, name) VALUES (?, ?)")
                .bind(version)
                .bind(*name)
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;
        }

        info!("all SQLite migrations applied");
        Ok(())
    }
}
