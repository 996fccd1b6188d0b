//! Versioned schema and stepwise migrations.
//!
//! Each step is keyed by the version it produces and runs in its own
//! transaction together with the version bump. Every statement is written
//! to be safe on re-run.

use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use taskroot_core::{Error, Result};

/// Schema version this build reads and writes.
pub const CURRENT_SCHEMA_VERSION: i64 = 2;

const META_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
"#;

/// Step 1: events, materialized views, relations, schedules.
const V1_BASE: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS task_events (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL,
        name TEXT,
        state TEXT NOT NULL,
        ts REAL NOT NULL,
        worker TEXT,
        args TEXT,
        kwargs TEXT,
        result TEXT,
        runtime REAL,
        retries INTEGER,
        exception TEXT,
        traceback TEXT,
        root_id TEXT,
        parent_id TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_events_task ON task_events(task_id, ts, seq)",
    "CREATE INDEX IF NOT EXISTS idx_task_events_ts ON task_events(ts)",
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        task_id TEXT PRIMARY KEY,
        name TEXT,
        state TEXT NOT NULL,
        worker TEXT,
        received_at REAL,
        started_at REAL,
        finished_at REAL,
        last_updated REAL NOT NULL,
        runtime REAL,
        args TEXT,
        kwargs TEXT,
        result TEXT,
        exception TEXT,
        traceback TEXT,
        retries INTEGER,
        root_id TEXT,
        parent_id TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_last_updated ON tasks(last_updated)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_name ON tasks(name)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state)",
    r#"
    CREATE TABLE IF NOT EXISTS task_relations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        root_id TEXT NOT NULL,
        parent_id TEXT NOT NULL DEFAULT '',
        child_id TEXT NOT NULL,
        relation TEXT NOT NULL,
        UNIQUE (root_id, parent_id, child_id, relation)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_relations_root ON task_relations(root_id)",
    "CREATE INDEX IF NOT EXISTS idx_task_relations_parent ON task_relations(parent_id)",
    r#"
    CREATE TABLE IF NOT EXISTS worker_events (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        hostname TEXT NOT NULL,
        event TEXT NOT NULL,
        ts REAL NOT NULL,
        info TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_worker_events_host ON worker_events(hostname, ts, seq)",
    "CREATE INDEX IF NOT EXISTS idx_worker_events_ts ON worker_events(ts)",
    r#"
    CREATE TABLE IF NOT EXISTS workers (
        hostname TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        last_heartbeat REAL,
        last_updated REAL NOT NULL,
        info TEXT,
        pid INTEGER,
        active INTEGER,
        processed INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS schedules (
        app TEXT NOT NULL DEFAULT '',
        schedule_id TEXT NOT NULL,
        name TEXT NOT NULL,
        task TEXT NOT NULL,
        schedule TEXT NOT NULL,
        args TEXT NOT NULL DEFAULT '[]',
        kwargs TEXT NOT NULL DEFAULT '{}',
        enabled INTEGER NOT NULL DEFAULT 1,
        last_run_at REAL,
        total_run_count INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (app, schedule_id)
    )
    "#,
];

/// Step 2: broker queue snapshots and analytic indexes.
const V2_BROKERS_AND_ANALYTICS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS broker_queue_events (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        broker_url TEXT NOT NULL,
        queue_name TEXT NOT NULL,
        depth INTEGER NOT NULL,
        consumers INTEGER,
        ts REAL NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_broker_events_ts ON broker_queue_events(ts)",
    r#"
    CREATE TABLE IF NOT EXISTS broker_queue_current (
        broker_url TEXT NOT NULL,
        queue_name TEXT NOT NULL,
        depth INTEGER NOT NULL,
        consumers INTEGER,
        ts REAL NOT NULL,
        seq INTEGER NOT NULL,
        PRIMARY KEY (broker_url, queue_name)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_finished ON tasks(state, finished_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_worker ON tasks(worker)",
];

/// Statements of the step producing `version`.
fn migration_step(version: i64) -> Option<&'static [&'static str]> {
    match version {
        1 => Some(V1_BASE),
        2 => Some(V2_BROKERS_AND_ANALYTICS),
        _ => None,
    }
}

/// Version recorded in the dataset; `0` for a fresh dataset.
pub async fn get_schema_version(pool: &SqlitePool) -> Result<i64> {
    sqlx::query(META_TABLE)
        .execute(pool)
        .await
        .map_err(Error::Storage)?;

    let row = sqlx::query("SELECT value FROM schema_meta WHERE key = 'version'")
        .fetch_optional(pool)
        .await
        .map_err(Error::Storage)?;

    match row {
        None => Ok(0),
        Some(row) => {
            let value: String = row.get("value");
            value.parse::<i64>().map_err(|_| {
                Error::Internal(format!("schema_meta version is not a number: {:?}", value))
            })
        }
    }
}

/// Apply every step in `(from_version, to_version]`.
pub async fn migrate(pool: &SqlitePool, from_version: i64, to_version: i64) -> Result<()> {
    if to_version < from_version {
        return Err(Error::SchemaVersion {
            found: from_version,
            expected: to_version,
        });
    }

    // Check the whole chain before applying any step.
    let mut steps = Vec::new();
    for version in (from_version + 1)..=to_version {
        let statements = migration_step(version).ok_or(Error::SchemaVersion {
            found: version - 1,
            expected: to_version,
        })?;
        steps.push((version, statements));
    }

    for (version, statements) in steps {
        let mut tx = pool.begin().await.map_err(Error::Storage)?;
        sqlx::query(META_TABLE)
            .execute(&mut *tx)
            .await
            .map_err(Error::Storage)?;
        for statement in statements {
            sqlx::query(*statement)
                .execute(&mut *tx)
                .await
                .map_err(Error::Storage)?;
        }
        sqlx::query(
            "INSERT INTO schema_meta (key, value) VALUES ('version', ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(version.to_string())
        .execute(&mut *tx)
        .await
        .map_err(Error::Storage)?;
        tx.commit().await.map_err(Error::Storage)?;

        info!(
            subsystem = "db",
            component = "schema",
            op = "migrate",
            version,
            "Applied schema migration"
        );
    }
    Ok(())
}

/// Bring the dataset to [`CURRENT_SCHEMA_VERSION`], creating whatever is
/// missing. A dataset written by a newer build is refused.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    let found = get_schema_version(pool).await?;
    if found > CURRENT_SCHEMA_VERSION {
        return Err(Error::SchemaVersion {
            found,
            expected: CURRENT_SCHEMA_VERSION,
        });
    }
    if found < CURRENT_SCHEMA_VERSION {
        migrate(pool, found, CURRENT_SCHEMA_VERSION).await?;
    } else {
        debug!(
            subsystem = "db",
            component = "schema",
            op = "ensure",
            version = found,
            "Schema is current"
        );
    }
    Ok(())
}

/// Stamp the open time. As the first write on the connection this also takes
/// the exclusive file lock.
pub async fn touch_opened_at(pool: &SqlitePool, epoch_seconds: f64) -> Result<()> {
    sqlx::query(
        "INSERT INTO schema_meta (key, value) VALUES ('opened_at', ?)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
    )
    .bind(epoch_seconds.to_string())
    .execute(pool)
    .await
    .map_err(Error::Storage)?;
    Ok(())
}
