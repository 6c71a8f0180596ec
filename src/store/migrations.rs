//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "onboarding_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS onboarding_steps (
                id TEXT PRIMARY KEY,
                key TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                description TEXT,
                button_text TEXT,
                done_text TEXT,
                panel_step_open_action_name TEXT NOT NULL DEFAULT '',
                is_per_company INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS onboardings (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                route_name TEXT NOT NULL UNIQUE,
                sequence INTEGER NOT NULL DEFAULT 10,
                text_completed TEXT NOT NULL DEFAULT '',
                panel_close_action_name TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_onboardings_sequence ON onboardings(sequence);

            CREATE TABLE IF NOT EXISTS onboarding_step_rel (
                onboarding_id TEXT NOT NULL REFERENCES onboardings(id) ON DELETE CASCADE,
                step_id TEXT NOT NULL REFERENCES onboarding_steps(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                PRIMARY KEY (onboarding_id, step_id)
            );
            CREATE INDEX IF NOT EXISTS idx_onboarding_step_rel_step ON onboarding_step_rel(step_id);

            CREATE TABLE IF NOT EXISTS onboarding_progress (
                id TEXT PRIMARY KEY,
                onboarding_id TEXT NOT NULL REFERENCES onboardings(id) ON DELETE CASCADE,
                tenant_id TEXT,
                is_onboarding_closed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS uniq_onboarding_progress_scope
                ON onboarding_progress(onboarding_id, COALESCE(tenant_id, ''));
            CREATE INDEX IF NOT EXISTS idx_onboarding_progress_tenant ON onboarding_progress(tenant_id);

            CREATE TABLE IF NOT EXISTS onboarding_progress_steps (
                id TEXT PRIMARY KEY,
                step_id TEXT NOT NULL REFERENCES onboarding_steps(id) ON DELETE CASCADE,
                tenant_id TEXT,
                step_state TEXT NOT NULL DEFAULT 'not_done',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS uniq_onboarding_progress_steps_scope
                ON onboarding_progress_steps(step_id, COALESCE(tenant_id, ''));
            CREATE INDEX IF NOT EXISTS idx_onboarding_progress_steps_tenant
                ON onboarding_progress_steps(tenant_id);

            CREATE TABLE IF NOT EXISTS onboarding_progress_step_rel (
                progress_id TEXT NOT NULL REFERENCES onboarding_progress(id) ON DELETE CASCADE,
                progress_step_id TEXT NOT NULL REFERENCES onboarding_progress_steps(id) ON DELETE CASCADE,
                PRIMARY KEY (progress_id, progress_step_id)
            );
            CREATE INDEX IF NOT EXISTS idx_onboarding_progress_step_rel_step
                ON onboarding_progress_step_rel(progress_step_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    // Cascades rely on foreign keys, which SQLite enables per connection.
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to enable foreign keys: {e}")))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn count(conn: &Connection, sql: &str) -> i64 {
        let mut rows = conn.query(sql, ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get(0).unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "onboarding_steps",
            "onboardings",
            "onboarding_step_rel",
            "onboarding_progress",
            "onboarding_progress_steps",
            "onboarding_progress_step_rel",
            "_migrations",
        ] {
            let sql = format!(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='{table}'"
            );
            assert_eq!(count(&conn, &sql).await, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let version: i64 = row.get(0).unwrap();
        let name: String = row.get(1).unwrap();
        assert_eq!(version, 1);
        assert_eq!(name, "onboarding_schema");
    }

    #[tokio::test]
    async fn null_tenant_is_unique_per_onboarding() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO onboardings (id, name, route_name, created_at, updated_at)
             VALUES ('o1', 'Onboarding', 'route', '2026-01-01', '2026-01-01')",
            (),
        )
        .await
        .unwrap();
        conn.execute(
            "INSERT INTO onboarding_progress (id, onboarding_id, tenant_id, created_at, updated_at)
             VALUES ('p1', 'o1', NULL, '2026-01-01', '2026-01-01')",
            (),
        )
        .await
        .unwrap();

        // A second shared record collides even though NULLs normally don't
        let dup = conn
            .execute(
                "INSERT INTO onboarding_progress (id, onboarding_id, tenant_id, created_at, updated_at)
                 VALUES ('p2', 'o1', NULL, '2026-01-01', '2026-01-01')",
                (),
            )
            .await;
        assert!(dup.is_err());

        // A tenant record for the same onboarding is fine
        conn.execute(
            "INSERT INTO onboarding_progress (id, onboarding_id, tenant_id, created_at, updated_at)
             VALUES ('p3', 'o1', 't1', '2026-01-01', '2026-01-01')",
            (),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn deleting_onboarding_cascades_to_progress() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO onboardings (id, name, route_name, created_at, updated_at)
             VALUES ('o1', 'Onboarding', 'route', '2026-01-01', '2026-01-01')",
            (),
        )
        .await
        .unwrap();
        conn.execute(
            "INSERT INTO onboarding_progress (id, onboarding_id, tenant_id, created_at, updated_at)
             VALUES ('p1', 'o1', NULL, '2026-01-01', '2026-01-01')",
            (),
        )
        .await
        .unwrap();
        conn.execute("DELETE FROM onboardings WHERE id = 'o1'", ())
            .await
            .unwrap();

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM onboarding_progress").await, 0);
    }
}
