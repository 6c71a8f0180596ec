//! libSQL backend — async `OnboardingStore` implementation.
//!
//! Supports local file and in-memory databases. Every trait method holds the
//! backend's write lock, and multi-row operations run inside one SQL
//! transaction on the shared connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::onboarding::model::{Onboarding, OnboardingProgress, Scope, Step, StepProgress, TenantId};
use crate::onboarding::state::{OnboardingState, PanelState, StateMap, StepState};
use crate::store::migrations;
use crate::store::traits::OnboardingStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations. The lock
/// keeps transactions from interleaving on that connection.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            lock: Mutex::new(()),
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn begin(&self, op: &str) -> Result<Transaction, DatabaseError> {
        self.conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} begin: {e}")))
    }
}

/// Commit on success, roll back on failure.
async fn finish<T>(
    tx: Transaction,
    op: &str,
    result: Result<T, DatabaseError>,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("{op} commit: {e}")))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = tx.rollback().await {
                warn!(op, "Rollback failed: {e}");
            }
            Err(err)
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Tenant column value for a scope: NULL for the shared scope.
fn scope_value(scope: Scope) -> libsql::Value {
    opt_text(scope.tenant().map(|t| t.to_string()).as_deref())
}

/// Value matched against `COALESCE(tenant_id, '')`.
fn scope_key(scope: Scope) -> String {
    scope.tenant().map(|t| t.to_string()).unwrap_or_default()
}

fn parse_scope(tenant: Option<String>) -> Result<Scope, DatabaseError> {
    match tenant {
        Some(t) => Ok(Scope::Tenant(TenantId(parse_uuid(&t)?))),
        None => Ok(Scope::Global),
    }
}

fn parse_step_state(s: &str) -> Result<StepState, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

fn row_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op} row parse: {e}"))
}

const STEP_COLUMNS: &str = "s.id, s.key, s.title, s.description, s.button_text, s.done_text, s.panel_step_open_action_name, s.is_per_company, s.created_at, s.updated_at";

const ONBOARDING_COLUMNS: &str =
    "id, name, route_name, sequence, text_completed, panel_close_action_name, created_at, updated_at";

const PROGRESS_COLUMNS: &str = "id, onboarding_id, tenant_id, is_onboarding_closed";

const STEP_PROGRESS_COLUMNS: &str = "id, step_id, tenant_id, step_state";

/// Map a libsql Row to a Step.
///
/// Column order matches STEP_COLUMNS.
fn row_to_step(row: &libsql::Row) -> Result<Step, DatabaseError> {
    let err = row_err("step");
    let id: String = row.get(0).map_err(&err)?;
    let per_company: i64 = row.get(7).map_err(&err)?;
    let created: String = row.get(8).map_err(&err)?;
    let updated: String = row.get(9).map_err(&err)?;

    Ok(Step {
        id: parse_uuid(&id)?,
        key: row.get(1).map_err(&err)?,
        title: row.get(2).map_err(&err)?,
        description: row.get::<String>(3).ok(),
        button_text: row.get::<String>(4).ok(),
        done_text: row.get::<String>(5).ok(),
        panel_step_open_action_name: row.get(6).map_err(&err)?,
        is_per_company: per_company != 0,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_onboarding(row: &libsql::Row) -> Result<Onboarding, DatabaseError> {
    let err = row_err("onboarding");
    let id: String = row.get(0).map_err(&err)?;
    let created: String = row.get(6).map_err(&err)?;
    let updated: String = row.get(7).map_err(&err)?;

    Ok(Onboarding {
        id: parse_uuid(&id)?,
        name: row.get(1).map_err(&err)?,
        route_name: row.get(2).map_err(&err)?,
        sequence: row.get(3).map_err(&err)?,
        text_completed: row.get(4).map_err(&err)?,
        panel_close_action_name: row.get(5).map_err(&err)?,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_step_progress(row: &libsql::Row) -> Result<StepProgress, DatabaseError> {
    let err = row_err("step progress");
    let id: String = row.get(0).map_err(&err)?;
    let step_id: String = row.get(1).map_err(&err)?;
    let state: String = row.get(3).map_err(&err)?;

    Ok(StepProgress {
        id: parse_uuid(&id)?,
        step_id: parse_uuid(&step_id)?,
        scope: parse_scope(row.get::<String>(2).ok())?,
        step_state: parse_step_state(&state)?,
    })
}

/// Progress row before its links and aggregate are loaded.
struct ProgressRow {
    id: Uuid,
    onboarding_id: Uuid,
    scope: Scope,
    closed: bool,
}

fn row_to_progress(row: &libsql::Row) -> Result<ProgressRow, DatabaseError> {
    let err = row_err("progress");
    let id: String = row.get(0).map_err(&err)?;
    let onboarding_id: String = row.get(1).map_err(&err)?;
    let closed: i64 = row.get(3).map_err(&err)?;

    Ok(ProgressRow {
        id: parse_uuid(&id)?,
        onboarding_id: parse_uuid(&onboarding_id)?,
        scope: parse_scope(row.get::<String>(2).ok())?,
        closed: closed != 0,
    })
}

async fn query_count(
    conn: &Connection,
    op: &str,
    sql: &str,
    params: impl libsql::params::IntoParams,
) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query(sql, params)
        .await
        .map_err(|e| DatabaseError::from_libsql(op, e))?;
    match rows.next().await.map_err(|e| DatabaseError::Query(format!("{op}: {e}")))? {
        Some(row) => row.get::<i64>(0).map_err(row_err(op)),
        None => Ok(0),
    }
}

async fn query_ids(
    conn: &Connection,
    op: &str,
    sql: &str,
    params: impl libsql::params::IntoParams,
) -> Result<Vec<Uuid>, DatabaseError> {
    let mut rows = conn
        .query(sql, params)
        .await
        .map_err(|e| DatabaseError::from_libsql(op, e))?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next().await.map_err(|e| DatabaseError::Query(format!("{op}: {e}")))? {
        let id: String = row.get(0).map_err(row_err(op))?;
        ids.push(parse_uuid(&id)?);
    }
    Ok(ids)
}

// ── Steps ───────────────────────────────────────────────────────────

async fn fetch_step(conn: &Connection, id: Uuid) -> Result<Option<Step>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {STEP_COLUMNS} FROM onboarding_steps s WHERE s.id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("get_step", e))?;

    match rows.next().await.map_err(|e| DatabaseError::Query(format!("get_step: {e}")))? {
        Some(row) => Ok(Some(row_to_step(&row)?)),
        None => Ok(None),
    }
}

async fn require_step(conn: &Connection, id: Uuid) -> Result<Step, DatabaseError> {
    fetch_step(conn, id).await?.ok_or_else(|| DatabaseError::NotFound {
        entity: "onboarding_step".into(),
        id: id.to_string(),
    })
}

async fn fetch_onboarding_steps(
    conn: &Connection,
    onboarding_id: Uuid,
) -> Result<Vec<Step>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {STEP_COLUMNS} FROM onboarding_steps s
                 JOIN onboarding_step_rel m ON m.step_id = s.id
                 WHERE m.onboarding_id = ?1
                 ORDER BY m.position, s.created_at"
            ),
            params![onboarding_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("list_onboarding_steps", e))?;

    let mut steps = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("list_onboarding_steps: {e}")))?
    {
        steps.push(row_to_step(&row)?);
    }
    Ok(steps)
}

async fn fetch_step_onboarding_ids(conn: &Connection, step_id: Uuid) -> Result<Vec<Uuid>, DatabaseError> {
    query_ids(
        conn,
        "fetch_step_onboarding_ids",
        "SELECT onboarding_id FROM onboarding_step_rel WHERE step_id = ?1",
        params![step_id.to_string()],
    )
    .await
}

async fn set_step_per_company_in(
    conn: &Connection,
    step_id: Uuid,
    value: bool,
) -> Result<bool, DatabaseError> {
    let step = require_step(conn, step_id).await?;
    if step.is_per_company == value {
        return Ok(false);
    }

    conn.execute(
        "UPDATE onboarding_steps SET is_per_company = ?1, updated_at = ?2 WHERE id = ?3",
        params![value as i64, Utc::now().to_rfc3339(), step_id.to_string()],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("set_step_per_company", e))?;

    let wiped = delete_step_progress_of(conn, step_id).await?;
    info!(step = %step.key, is_per_company = value, wiped, "Step scope changed, progress reset");

    for onboarding_id in fetch_step_onboarding_ids(conn, step_id).await? {
        refresh_progress_ids_in(conn, onboarding_id).await?;
    }
    Ok(true)
}

async fn delete_step_progress_of(conn: &Connection, step_id: Uuid) -> Result<u64, DatabaseError> {
    conn.execute(
        "DELETE FROM onboarding_progress_step_rel WHERE progress_step_id IN
            (SELECT id FROM onboarding_progress_steps WHERE step_id = ?1)",
        params![step_id.to_string()],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("delete_step_progress", e))?;
    conn.execute(
        "DELETE FROM onboarding_progress_steps WHERE step_id = ?1",
        params![step_id.to_string()],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("delete_step_progress", e))
}

async fn delete_step_in(conn: &Connection, id: Uuid) -> Result<bool, DatabaseError> {
    delete_step_progress_of(conn, id).await?;
    conn.execute(
        "DELETE FROM onboarding_step_rel WHERE step_id = ?1",
        params![id.to_string()],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("delete_step", e))?;
    let count = conn
        .execute(
            "DELETE FROM onboarding_steps WHERE id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("delete_step", e))?;
    Ok(count > 0)
}

// ── Onboardings ─────────────────────────────────────────────────────

async fn fetch_onboarding_where(
    conn: &Connection,
    op: &str,
    clause: &str,
    value: String,
) -> Result<Option<Onboarding>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {ONBOARDING_COLUMNS} FROM onboardings WHERE {clause}"),
            params![value],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql(op, e))?;

    match rows.next().await.map_err(|e| DatabaseError::Query(format!("{op}: {e}")))? {
        Some(row) => Ok(Some(row_to_onboarding(&row)?)),
        None => Ok(None),
    }
}

async fn is_per_company_in(conn: &Connection, onboarding_id: Uuid) -> Result<bool, DatabaseError> {
    let flag = query_count(
        conn,
        "onboarding_is_per_company",
        "SELECT EXISTS(
                SELECT 1 FROM onboarding_step_rel m
                JOIN onboarding_steps s ON s.id = m.step_id
                WHERE m.onboarding_id = ?1 AND s.is_per_company = 1)
            OR EXISTS(
                SELECT 1 FROM onboarding_progress
                WHERE onboarding_id = ?1 AND tenant_id IS NOT NULL)",
        params![onboarding_id.to_string()],
    )
    .await?;
    Ok(flag != 0)
}

async fn refresh_progress_ids_in(conn: &Connection, onboarding_id: Uuid) -> Result<usize, DatabaseError> {
    if !is_per_company_in(conn, onboarding_id).await? {
        return Ok(0);
    }

    conn.execute(
        "DELETE FROM onboarding_progress_step_rel WHERE progress_id IN
            (SELECT id FROM onboarding_progress WHERE onboarding_id = ?1 AND tenant_id IS NULL)",
        params![onboarding_id.to_string()],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("refresh_progress_ids", e))?;
    let deleted = conn
        .execute(
            "DELETE FROM onboarding_progress WHERE onboarding_id = ?1 AND tenant_id IS NULL",
            params![onboarding_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("refresh_progress_ids", e))?;

    if deleted > 0 {
        info!(onboarding_id = %onboarding_id, deleted, "Dropped shared progress of per-tenant onboarding");
    }
    Ok(deleted as usize)
}

async fn insert_onboarding_in(conn: &Connection, onboarding: &Onboarding) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO onboardings (id, name, route_name, sequence, text_completed, panel_close_action_name, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            onboarding.id.to_string(),
            onboarding.name.clone(),
            onboarding.route_name.clone(),
            onboarding.sequence,
            onboarding.text_completed.clone(),
            onboarding.panel_close_action_name.clone(),
            onboarding.created_at.to_rfc3339(),
            onboarding.updated_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("insert_onboarding", e))?;

    debug!(onboarding_id = %onboarding.id, route = %onboarding.route_name, "Onboarding inserted into DB");
    Ok(())
}

async fn set_onboarding_steps_in(
    conn: &Connection,
    onboarding_id: Uuid,
    step_ids: &[Uuid],
) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM onboarding_step_rel WHERE onboarding_id = ?1",
        params![onboarding_id.to_string()],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("set_onboarding_steps", e))?;

    for (position, step_id) in step_ids.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO onboarding_step_rel (onboarding_id, step_id, position) VALUES (?1, ?2, ?3)",
            params![onboarding_id.to_string(), step_id.to_string(), position as i64],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("set_onboarding_steps", e))?;
    }

    refresh_progress_ids_in(conn, onboarding_id).await?;
    for progress in fetch_progress_rows(conn, onboarding_id).await? {
        relink_progress(conn, &progress).await?;
    }

    debug!(onboarding_id = %onboarding_id, steps = step_ids.len(), "Onboarding steps updated");
    Ok(())
}

async fn delete_onboarding_in(conn: &Connection, id: Uuid) -> Result<bool, DatabaseError> {
    conn.execute(
        "DELETE FROM onboarding_progress_step_rel WHERE progress_id IN
            (SELECT id FROM onboarding_progress WHERE onboarding_id = ?1)",
        params![id.to_string()],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("delete_onboarding", e))?;
    conn.execute(
        "DELETE FROM onboarding_progress WHERE onboarding_id = ?1",
        params![id.to_string()],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("delete_onboarding", e))?;
    conn.execute(
        "DELETE FROM onboarding_step_rel WHERE onboarding_id = ?1",
        params![id.to_string()],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("delete_onboarding", e))?;
    let count = conn
        .execute("DELETE FROM onboardings WHERE id = ?1", params![id.to_string()])
        .await
        .map_err(|e| DatabaseError::from_libsql("delete_onboarding", e))?;
    Ok(count > 0)
}

// ── Onboarding progress ─────────────────────────────────────────────

async fn fetch_progress_rows(conn: &Connection, onboarding_id: Uuid) -> Result<Vec<ProgressRow>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {PROGRESS_COLUMNS} FROM onboarding_progress WHERE onboarding_id = ?1 ORDER BY created_at"
            ),
            params![onboarding_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("list_progress", e))?;

    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("list_progress: {e}")))?
    {
        out.push(row_to_progress(&row)?);
    }
    Ok(out)
}

async fn fetch_progress_row(
    conn: &Connection,
    op: &str,
    clause: &str,
    params: impl libsql::params::IntoParams,
) -> Result<Option<ProgressRow>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {PROGRESS_COLUMNS} FROM onboarding_progress WHERE {clause}"),
            params,
        )
        .await
        .map_err(|e| DatabaseError::from_libsql(op, e))?;

    match rows.next().await.map_err(|e| DatabaseError::Query(format!("{op}: {e}")))? {
        Some(row) => Ok(Some(row_to_progress(&row)?)),
        None => Ok(None),
    }
}

async fn require_progress_row(conn: &Connection, id: Uuid) -> Result<ProgressRow, DatabaseError> {
    fetch_progress_row(conn, "get_progress", "id = ?1", params![id.to_string()])
        .await?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "onboarding_progress".into(),
            id: id.to_string(),
        })
}

/// Aggregate from the linked step progress of member steps.
async fn aggregate_in(conn: &Connection, progress: &ProgressRow) -> Result<OnboardingState, DatabaseError> {
    let completed = query_count(
        conn,
        "onboarding_state",
        "SELECT COUNT(*) FROM onboarding_progress_step_rel r
         JOIN onboarding_progress_steps ps ON ps.id = r.progress_step_id
         JOIN onboarding_step_rel m ON m.step_id = ps.step_id AND m.onboarding_id = ?2
         WHERE r.progress_id = ?1 AND ps.step_state IN ('just_done', 'done')",
        params![progress.id.to_string(), progress.onboarding_id.to_string()],
    )
    .await?;
    let members = query_count(
        conn,
        "onboarding_state",
        "SELECT COUNT(*) FROM onboarding_step_rel WHERE onboarding_id = ?1",
        params![progress.onboarding_id.to_string()],
    )
    .await?;
    Ok(OnboardingState::from_counts(completed as usize, members as usize))
}

async fn hydrate_progress(conn: &Connection, row: ProgressRow) -> Result<OnboardingProgress, DatabaseError> {
    let progress_step_ids = query_ids(
        conn,
        "progress_step_ids",
        "SELECT progress_step_id FROM onboarding_progress_step_rel WHERE progress_id = ?1",
        params![row.id.to_string()],
    )
    .await?;
    let onboarding_state = aggregate_in(conn, &row).await?;

    Ok(OnboardingProgress {
        id: row.id,
        onboarding_id: row.onboarding_id,
        scope: row.scope,
        is_onboarding_closed: row.closed,
        progress_step_ids,
        onboarding_state,
    })
}

/// Link the step progress of member steps visible from the progress scope.
async fn link_progress(conn: &Connection, progress: &ProgressRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO onboarding_progress_step_rel (progress_id, progress_step_id)
         SELECT ?1, ps.id FROM onboarding_progress_steps ps
         JOIN onboarding_step_rel m ON m.step_id = ps.step_id
         JOIN onboarding_steps s ON s.id = ps.step_id
         WHERE m.onboarding_id = ?2
           AND ((s.is_per_company = 0 AND ps.tenant_id IS NULL)
             OR (s.is_per_company = 1 AND ps.tenant_id = ?3))",
        params![
            progress.id.to_string(),
            progress.onboarding_id.to_string(),
            scope_value(progress.scope),
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("link_progress", e))?;
    Ok(())
}

async fn relink_progress(conn: &Connection, progress: &ProgressRow) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM onboarding_progress_step_rel WHERE progress_id = ?1",
        params![progress.id.to_string()],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("recompute_progress_step_ids", e))?;
    link_progress(conn, progress).await
}

async fn create_progress_in(
    conn: &Connection,
    onboarding_id: Uuid,
    scope: Scope,
) -> Result<OnboardingProgress, DatabaseError> {
    let now = Utc::now().to_rfc3339();
    let row = ProgressRow {
        id: Uuid::new_v4(),
        onboarding_id,
        scope,
        closed: false,
    };

    conn.execute(
        "INSERT INTO onboarding_progress (id, onboarding_id, tenant_id, is_onboarding_closed, created_at, updated_at)
         VALUES (?1, ?2, ?3, 0, ?4, ?4)",
        params![row.id.to_string(), onboarding_id.to_string(), scope_value(scope), now],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("create_progress", e))?;

    link_progress(conn, &row).await?;
    debug!(progress_id = %row.id, onboarding_id = %onboarding_id, scope = %scope, "Onboarding progress created");
    hydrate_progress(conn, row).await
}

async fn get_and_update_in(
    conn: &Connection,
    progress_id: Uuid,
    tenant: TenantId,
) -> Result<StateMap, DatabaseError> {
    let progress = require_progress_row(conn, progress_id).await?;
    let steps = fetch_onboarding_steps(conn, progress.onboarding_id).await?;
    let acting = progress.scope.tenant().unwrap_or(tenant);

    let mut map = StateMap::default();
    let mut pending = Vec::new();
    for step in &steps {
        let record = fetch_step_progress(conn, step.id, step.scope_for(acting)).await?;
        let state = record.as_ref().map(|r| r.step_state).unwrap_or_default();
        if let Some(record) = record.filter(|r| r.step_state == StepState::JustDone) {
            pending.push((step.id, record.id));
        }
        map.steps.insert(step.id, state);
    }

    let mut consolidated = 0;
    for (step_id, record_id) in pending {
        match transition_step_progress(conn, record_id, StepState::JustDone, StepState::Done).await? {
            Some(_) => consolidated += 1,
            // Another reader consolidated it first
            None => {
                map.steps.insert(step_id, StepState::Done);
            }
        }
    }

    let aggregate = aggregate_in(conn, &progress).await?;
    map.onboarding_state = PanelState::report(progress.closed, aggregate, consolidated);

    debug!(
        progress_id = %progress_id,
        consolidated,
        onboarding_state = ?map.onboarding_state,
        "Onboarding state read"
    );
    Ok(map)
}

async fn purge_tenant_in(conn: &Connection, tenant: TenantId) -> Result<usize, DatabaseError> {
    let tenant = tenant.to_string();
    conn.execute(
        "DELETE FROM onboarding_progress_step_rel
         WHERE progress_id IN (SELECT id FROM onboarding_progress WHERE tenant_id = ?1)
            OR progress_step_id IN (SELECT id FROM onboarding_progress_steps WHERE tenant_id = ?1)",
        params![tenant.clone()],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("purge_tenant", e))?;
    let progress = conn
        .execute(
            "DELETE FROM onboarding_progress WHERE tenant_id = ?1",
            params![tenant.clone()],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("purge_tenant", e))?;
    let steps = conn
        .execute(
            "DELETE FROM onboarding_progress_steps WHERE tenant_id = ?1",
            params![tenant],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("purge_tenant", e))?;
    Ok((progress + steps) as usize)
}

// ── Step progress ───────────────────────────────────────────────────

async fn fetch_step_progress(
    conn: &Connection,
    step_id: Uuid,
    scope: Scope,
) -> Result<Option<StepProgress>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {STEP_PROGRESS_COLUMNS} FROM onboarding_progress_steps
                 WHERE step_id = ?1 AND COALESCE(tenant_id, '') = ?2"
            ),
            params![step_id.to_string(), scope_key(scope)],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("find_step_progress", e))?;

    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("find_step_progress: {e}")))?
    {
        Some(row) => Ok(Some(row_to_step_progress(&row)?)),
        None => Ok(None),
    }
}

async fn fetch_step_progress_by_id(conn: &Connection, id: Uuid) -> Result<Option<StepProgress>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {STEP_PROGRESS_COLUMNS} FROM onboarding_progress_steps WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("get_step_progress", e))?;

    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("get_step_progress: {e}")))?
    {
        Some(row) => Ok(Some(row_to_step_progress(&row)?)),
        None => Ok(None),
    }
}

/// Compare-and-set the state of one record.
async fn transition_step_progress(
    conn: &Connection,
    id: Uuid,
    from: StepState,
    to: StepState,
) -> Result<Option<StepProgress>, DatabaseError> {
    debug_assert!(from.can_transition_to(to));
    let count = conn
        .execute(
            "UPDATE onboarding_progress_steps SET step_state = ?1, updated_at = ?2
             WHERE id = ?3 AND step_state = ?4",
            params![to.as_str(), Utc::now().to_rfc3339(), id.to_string(), from.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("transition_step_progress", e))?;

    if count == 0 {
        return Ok(None);
    }
    debug!(step_progress_id = %id, %from, %to, "Step progress transitioned");
    fetch_step_progress_by_id(conn, id).await
}

/// Link a step progress record to every onboarding progress that sees it.
async fn link_step_progress(conn: &Connection, record: &StepProgress) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO onboarding_progress_step_rel (progress_id, progress_step_id)
         SELECT p.id, ?1 FROM onboarding_progress p
         JOIN onboarding_step_rel m ON m.onboarding_id = p.onboarding_id
         WHERE m.step_id = ?2 AND (?3 IS NULL OR p.tenant_id = ?3)",
        params![
            record.id.to_string(),
            record.step_id.to_string(),
            scope_value(record.scope),
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("link_step_progress", e))?;
    Ok(())
}

async fn set_step_just_done_in(
    conn: &Connection,
    step_id: Uuid,
    tenant: TenantId,
) -> Result<Vec<StepProgress>, DatabaseError> {
    let step = require_step(conn, step_id).await?;
    let scope = step.scope_for(tenant);

    if let Some(existing) = fetch_step_progress(conn, step_id, scope).await? {
        let transitioned =
            transition_step_progress(conn, existing.id, StepState::NotDone, StepState::JustDone).await?;
        return Ok(transitioned.into_iter().collect());
    }

    let record = StepProgress {
        id: Uuid::new_v4(),
        step_id,
        scope,
        step_state: StepState::JustDone,
    };
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO onboarding_progress_steps (id, step_id, tenant_id, step_state, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![
            record.id.to_string(),
            step_id.to_string(),
            scope_value(scope),
            record.step_state.as_str(),
            now,
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("set_step_just_done", e))?;
    link_step_progress(conn, &record).await?;

    debug!(step = %step.key, scope = %scope, "Step progress created as just done");
    Ok(vec![record])
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl OnboardingStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Steps ───────────────────────────────────────────────────────

    async fn insert_step(&self, step: &Step) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO onboarding_steps (id, key, title, description, button_text, done_text, panel_step_open_action_name, is_per_company, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    step.id.to_string(),
                    step.key.clone(),
                    step.title.clone(),
                    opt_text(step.description.as_deref()),
                    opt_text(step.button_text.as_deref()),
                    opt_text(step.done_text.as_deref()),
                    step.panel_step_open_action_name.clone(),
                    step.is_per_company as i64,
                    step.created_at.to_rfc3339(),
                    step.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_step", e))?;

        debug!(step_id = %step.id, key = %step.key, "Step inserted into DB");
        Ok(())
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<Step>, DatabaseError> {
        let _guard = self.lock.lock().await;
        fetch_step(self.conn(), id).await
    }

    async fn get_step_by_key(&self, key: &str) -> Result<Option<Step>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {STEP_COLUMNS} FROM onboarding_steps s WHERE s.key = ?1"),
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_step_by_key", e))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_step_by_key: {e}")))?
        {
            Some(row) => Ok(Some(row_to_step(&row)?)),
            None => Ok(None),
        }
    }

    async fn set_step_per_company(&self, step_id: Uuid, value: bool) -> Result<bool, DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("set_step_per_company").await?;
        let result = set_step_per_company_in(&tx, step_id, value).await;
        finish(tx, "set_step_per_company", result).await
    }

    async fn delete_step(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("delete_step").await?;
        let result = delete_step_in(&tx, id).await;
        finish(tx, "delete_step", result).await
    }

    // ── Onboardings ─────────────────────────────────────────────────

    async fn insert_onboarding_with_steps(
        &self,
        onboarding: &Onboarding,
        step_ids: &[Uuid],
    ) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("insert_onboarding").await?;
        let result: Result<(), DatabaseError> = async {
            insert_onboarding_in(&tx, onboarding).await?;
            set_onboarding_steps_in(&tx, onboarding.id, step_ids).await
        }
        .await;
        finish(tx, "insert_onboarding", result).await
    }

    async fn get_onboarding(&self, id: Uuid) -> Result<Option<Onboarding>, DatabaseError> {
        let _guard = self.lock.lock().await;
        fetch_onboarding_where(self.conn(), "get_onboarding", "id = ?1", id.to_string()).await
    }

    async fn get_onboarding_by_route(&self, route_name: &str) -> Result<Option<Onboarding>, DatabaseError> {
        let _guard = self.lock.lock().await;
        fetch_onboarding_where(
            self.conn(),
            "get_onboarding_by_route",
            "route_name = ?1",
            route_name.to_string(),
        )
        .await
    }

    async fn list_onboardings(&self) -> Result<Vec<Onboarding>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ONBOARDING_COLUMNS} FROM onboardings ORDER BY sequence, created_at"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("list_onboardings", e))?;

        let mut onboardings = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_onboardings: {e}")))?
        {
            onboardings.push(row_to_onboarding(&row)?);
        }
        Ok(onboardings)
    }

    async fn list_onboarding_steps(&self, onboarding_id: Uuid) -> Result<Vec<Step>, DatabaseError> {
        let _guard = self.lock.lock().await;
        fetch_onboarding_steps(self.conn(), onboarding_id).await
    }

    async fn set_onboarding_steps(&self, onboarding_id: Uuid, step_ids: &[Uuid]) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("set_onboarding_steps").await?;
        let result = set_onboarding_steps_in(&tx, onboarding_id, step_ids).await;
        finish(tx, "set_onboarding_steps", result).await
    }

    async fn onboarding_is_per_company(&self, onboarding_id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.lock.lock().await;
        is_per_company_in(self.conn(), onboarding_id).await
    }

    async fn refresh_progress_ids(&self, onboarding_id: Uuid) -> Result<usize, DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("refresh_progress_ids").await?;
        let result = refresh_progress_ids_in(&tx, onboarding_id).await;
        finish(tx, "refresh_progress_ids", result).await
    }

    async fn delete_onboarding(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("delete_onboarding").await?;
        let result = delete_onboarding_in(&tx, id).await;
        finish(tx, "delete_onboarding", result).await
    }

    // ── Onboarding progress ─────────────────────────────────────────

    async fn get_progress(&self, id: Uuid) -> Result<Option<OnboardingProgress>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let conn = self.conn();
        match fetch_progress_row(conn, "get_progress", "id = ?1", params![id.to_string()]).await? {
            Some(row) => Ok(Some(hydrate_progress(conn, row).await?)),
            None => Ok(None),
        }
    }

    async fn find_progress(
        &self,
        onboarding_id: Uuid,
        scope: Scope,
    ) -> Result<Option<OnboardingProgress>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let conn = self.conn();
        let row = fetch_progress_row(
            conn,
            "find_progress",
            "onboarding_id = ?1 AND COALESCE(tenant_id, '') = ?2",
            params![onboarding_id.to_string(), scope_key(scope)],
        )
        .await?;
        match row {
            Some(row) => Ok(Some(hydrate_progress(conn, row).await?)),
            None => Ok(None),
        }
    }

    async fn list_progress(&self, onboarding_id: Uuid) -> Result<Vec<OnboardingProgress>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let conn = self.conn();
        let mut out = Vec::new();
        for row in fetch_progress_rows(conn, onboarding_id).await? {
            out.push(hydrate_progress(conn, row).await?);
        }
        Ok(out)
    }

    async fn create_progress(
        &self,
        onboarding_id: Uuid,
        scope: Scope,
    ) -> Result<OnboardingProgress, DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("create_progress").await?;
        let result = create_progress_in(&tx, onboarding_id, scope).await;
        finish(tx, "create_progress", result).await
    }

    async fn set_progress_closed(&self, progress_id: Uuid, closed: bool) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        let count = self
            .conn()
            .execute(
                "UPDATE onboarding_progress SET is_onboarding_closed = ?1, updated_at = ?2 WHERE id = ?3",
                params![closed as i64, Utc::now().to_rfc3339(), progress_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("set_progress_closed", e))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "onboarding_progress".into(),
                id: progress_id.to_string(),
            });
        }
        debug!(progress_id = %progress_id, closed, "Onboarding progress closed flag set");
        Ok(())
    }

    async fn toggle_progress_closed(&self, progress_id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("toggle_progress_closed").await?;
        let result: Result<bool, DatabaseError> = async {
            tx.execute(
                "UPDATE onboarding_progress SET is_onboarding_closed = 1 - is_onboarding_closed, updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), progress_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("toggle_progress_closed", e))?;
            Ok(require_progress_row(&tx, progress_id).await?.closed)
        }
        .await;
        finish(tx, "toggle_progress_closed", result).await
    }

    async fn recompute_progress_step_ids(&self, progress_id: Uuid) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("recompute_progress_step_ids").await?;
        let result: Result<(), DatabaseError> = async {
            let row = require_progress_row(&tx, progress_id).await?;
            relink_progress(&tx, &row).await
        }
        .await;
        finish(tx, "recompute_progress_step_ids", result).await
    }

    async fn get_and_update_onboarding_state(
        &self,
        progress_id: Uuid,
        tenant: TenantId,
    ) -> Result<StateMap, DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("get_and_update_onboarding_state").await?;
        let result = get_and_update_in(&tx, progress_id, tenant).await;
        finish(tx, "get_and_update_onboarding_state", result).await
    }

    async fn purge_tenant(&self, tenant: TenantId) -> Result<usize, DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("purge_tenant").await?;
        let result = purge_tenant_in(&tx, tenant).await;
        finish(tx, "purge_tenant", result).await
    }

    // ── Step progress ───────────────────────────────────────────────

    async fn find_step_progress(
        &self,
        step_id: Uuid,
        scope: Scope,
    ) -> Result<Option<StepProgress>, DatabaseError> {
        let _guard = self.lock.lock().await;
        fetch_step_progress(self.conn(), step_id, scope).await
    }

    async fn list_step_progress(&self, step_id: Uuid) -> Result<Vec<StepProgress>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STEP_PROGRESS_COLUMNS} FROM onboarding_progress_steps WHERE step_id = ?1 ORDER BY created_at"
                ),
                params![step_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("list_step_progress", e))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_step_progress: {e}")))?
        {
            out.push(row_to_step_progress(&row)?);
        }
        Ok(out)
    }

    async fn set_step_just_done(
        &self,
        step_id: Uuid,
        tenant: TenantId,
    ) -> Result<Vec<StepProgress>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("set_step_just_done").await?;
        let result = set_step_just_done_in(&tx, step_id, tenant).await;
        finish(tx, "set_step_just_done", result).await
    }

    async fn step_progress_set_just_done(&self, id: Uuid) -> Result<Option<StepProgress>, DatabaseError> {
        let _guard = self.lock.lock().await;
        transition_step_progress(self.conn(), id, StepState::NotDone, StepState::JustDone).await
    }

    async fn consolidate_step_progress(&self, id: Uuid) -> Result<Option<StepProgress>, DatabaseError> {
        let _guard = self.lock.lock().await;
        transition_step_progress(self.conn(), id, StepState::JustDone, StepState::Done).await
    }
}
