use anyhow::{Context, Result};
use sqlx::postgres::PgPool;
use sqlx::Row;

/// Embedded SQL migration with version, direction, and content.
struct Migration {
    version: i64,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("sql/001_init.up.sql"),
    down_sql: include_str!("sql/001_init.down.sql"),
}];

/// Manages traffic schema migrations.
///
/// Compatible with golang-migrate's `schema_migrations` table format.
/// Embeds SQL files from `src/migrate/sql/` and applies them in order.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the current migration version and dirty flag.
    fn status(&self) -> impl std::future::Future<Output = Result<(i64, bool)>> + Send;
}

/// PostgreSQL migration runner.
pub struct PgMigrator {
    pool: PgPool,
}

impl PgMigrator {
    /// Creates a new migrator using the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ensures the schema_migrations tracking table exists.
    async fn ensure_migrations_table(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version BIGINT NOT NULL,
                dirty BOOLEAN NOT NULL,
                sequence BIGSERIAL PRIMARY KEY
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating schema_migrations table")?;

        Ok(())
    }

    /// Returns the current migration version and dirty state.
    async fn current_version(&self) -> Result<(i64, bool)> {
        let row = sqlx::query(
            "SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("querying migration version")?;

        match row {
            Some(row) => {
                let version: i64 = row.try_get("version").context("reading version")?;
                let dirty: bool = row.try_get("dirty").context("reading dirty flag")?;
                Ok((version, dirty))
            }
            None => Ok((0, false)),
        }
    }

    /// Sets the migration version in the tracking table.
    async fn set_version(&self, version: i64, dirty: bool) -> Result<()> {
        // Truncate and re-insert (matches golang-migrate behavior).
        sqlx::query("TRUNCATE TABLE schema_migrations")
            .execute(&self.pool)
            .await
            .context("truncating schema_migrations")?;

        sqlx::query("INSERT INTO schema_migrations (version, dirty) VALUES ($1, $2)")
            .bind(version)
            .bind(dirty)
            .execute(&self.pool)
            .await
            .context("inserting migration version")?;

        Ok(())
    }

    /// Splits a SQL string into individual statements and executes each.
    async fn execute_sql(&self, sql: &str) -> Result<()> {
        for statement in split_statements(sql) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| {
                    let preview: String = statement.chars().take(80).collect();
                    format!("executing migration statement: {preview}...")
                })?;
        }

        Ok(())
    }
}

impl Migrator for PgMigrator {
    async fn up(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, dirty) = self.current_version().await?;

        if dirty {
            anyhow::bail!(
                "migration version {current_version} is dirty, manual intervention required"
            );
        }

        tracing::info!(current_version, "running migrations");

        let mut applied = 0u32;

        for migration in MIGRATIONS {
            if migration.version <= current_version {
                continue;
            }

            tracing::info!(version = migration.version, "applying migration");

            // Mark as dirty before applying.
            self.set_version(migration.version, true).await?;

            self.execute_sql(migration.up_sql)
                .await
                .with_context(|| format!("applying migration version {}", migration.version))?;

            // Mark as clean.
            self.set_version(migration.version, false).await?;

            applied += 1;
        }

        if applied == 0 {
            tracing::info!("no pending migrations");
        } else {
            let (final_version, _) = self.current_version().await?;
            tracing::info!(version = final_version, applied, "migrations completed");
        }

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, _) = self.current_version().await?;

        if current_version == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current_version)
            .with_context(|| format!("migration version {current_version} not found"))?;

        tracing::info!(version = current_version, "rolling back migration");

        // Mark as dirty.
        self.set_version(current_version, true).await?;

        self.execute_sql(migration.down_sql)
            .await
            .with_context(|| format!("rolling back migration version {current_version}"))?;

        // Set version to previous migration.
        let prev_version = MIGRATIONS
            .iter()
            .filter(|m| m.version < current_version)
            .map(|m| m.version)
            .max()
            .unwrap_or(0);

        if prev_version == 0 {
            // No previous version, truncate tracking table.
            sqlx::query("TRUNCATE TABLE schema_migrations")
                .execute(&self.pool)
                .await
                .context("truncating schema_migrations after rollback")?;
        } else {
            self.set_version(prev_version, false).await?;
        }

        tracing::info!(version = prev_version, "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<(i64, bool)> {
        self.ensure_migrations_table().await?;
        self.current_version().await
    }
}

/// Splits SQL text into individual statements by semicolons.
///
/// Handles empty lines, comments, and whitespace-only segments.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements_basic() {
        let sql = "CREATE TABLE foo (id INTEGER); CREATE TABLE bar (id INTEGER);";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE foo"));
        assert!(stmts[1].starts_with("CREATE TABLE bar"));
    }

    #[test]
    fn test_split_statements_with_whitespace() {
        let sql = "
            SELECT 1;

            SELECT 2;

        ";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn test_split_statements_empty() {
        let stmts = split_statements("");
        assert!(stmts.is_empty());
    }

    #[test]
    fn test_split_statements_trailing_semicolons() {
        let sql = "SELECT 1;;;";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn test_migrations_embedded() {
        // Verify that embedded SQL files are non-empty.
        for m in MIGRATIONS {
            assert!(m.version > 0);
            assert!(
                !m.up_sql.is_empty(),
                "migration {} up SQL is empty",
                m.version
            );
            assert!(
                !m.down_sql.is_empty(),
                "migration {} down SQL is empty",
                m.version
            );
        }
    }

    #[test]
    fn test_migrations_ordered() {
        for window in MIGRATIONS.windows(2) {
            assert!(
                window[0].version < window[1].version,
                "migrations not in order: {} >= {}",
                window[0].version,
                window[1].version,
            );
        }
    }

    #[test]
    fn test_initial_migration_creates_traffic_table() {
        assert!(MIGRATIONS[0].up_sql.contains("CREATE TABLE IF NOT EXISTS traffic"));
        assert!(MIGRATIONS[0].down_sql.contains("DROP TABLE IF EXISTS traffic"));
    }
}
