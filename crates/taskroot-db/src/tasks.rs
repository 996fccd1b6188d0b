//! Task event repository and the last-writer-wins fold.

use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use taskroot_core::defaults::MAX_PAGE_LIMIT;
use taskroot_core::{
    Error, Result, SortDir, Task, TaskEvent, TaskFilter, TaskPage, TaskPageRequest,
    TaskRelation, TaskSortKey, TaskState,
};

use crate::relations::insert_relation;
use crate::{escape_like, from_epoch, quantize, to_epoch};

/// Fold one event into the current view of its task.
///
/// The event wins when its timestamp is not older than the view's: a newly
/// ingested event always carries the largest sequence number, so on equal
/// timestamps it is the later one. A winner overwrites every field it
/// carries. A late event only fills fields the view still lacks. Transition
/// timestamps are taken from any event of the matching state.
pub fn fold_event(existing: Option<Task>, event: &TaskEvent) -> Task {
    let ts = quantize(event.timestamp);
    let (mut task, wins) = match existing {
        Some(task) => {
            let wins = ts >= task.last_updated;
            (task, wins)
        }
        None => (
            Task {
                task_id: event.task_id.clone(),
                name: None,
                state: event.state,
                worker: None,
                received_at: None,
                started_at: None,
                finished_at: None,
                last_updated: ts,
                runtime: None,
                args: None,
                kwargs: None,
                result: None,
                exception: None,
                traceback: None,
                retries: None,
                root_id: None,
                parent_id: None,
            },
            true,
        ),
    };

    fn take<T: Clone>(slot: &mut Option<T>, value: &Option<T>, wins: bool) {
        if value.is_some() && (wins || slot.is_none()) {
            *slot = value.clone();
        }
    }

    if wins {
        task.state = event.state;
        task.last_updated = ts;
    }
    take(&mut task.name, &event.name, wins);
    take(&mut task.worker, &event.worker, wins);
    take(&mut task.args, &event.args, wins);
    take(&mut task.kwargs, &event.kwargs, wins);
    take(&mut task.result, &event.result, wins);
    take(&mut task.runtime, &event.runtime, wins);
    take(&mut task.retries, &event.retries, wins);
    take(&mut task.exception, &event.exception, wins);
    take(&mut task.traceback, &event.traceback, wins);
    take(&mut task.root_id, &event.root_id, wins);
    take(&mut task.parent_id, &event.parent_id, wins);

    match event.state {
        TaskState::Received => {
            task.received_at = Some(task.received_at.map_or(ts, |t| t.min(ts)));
        }
        TaskState::Started => {
            task.started_at = Some(task.started_at.map_or(ts, |t| t.max(ts)));
        }
        state if state.is_terminal() => {
            task.finished_at = Some(task.finished_at.map_or(ts, |t| t.max(ts)));
        }
        _ => {}
    }

    task
}

/// Relation implied by an event's lineage, if any.
fn lineage_relation(event: &TaskEvent) -> Option<TaskRelation> {
    let root_id = event.root_id.as_ref()?;
    if root_id == &event.task_id && event.parent_id.is_none() {
        return None;
    }
    Some(TaskRelation::new(
        root_id.clone(),
        event.parent_id.clone(),
        event.task_id.clone(),
    ))
}

fn sort_column(key: TaskSortKey) -> &'static str {
    match key {
        TaskSortKey::LastUpdated => "last_updated",
        TaskSortKey::Name => "name",
        TaskSortKey::State => "state",
        TaskSortKey::Worker => "worker",
        TaskSortKey::Runtime => "runtime",
        TaskSortKey::ReceivedAt => "received_at",
        TaskSortKey::TaskId => "task_id",
    }
}

fn sort_direction(dir: SortDir) -> &'static str {
    match dir {
        SortDir::Asc => "ASC",
        SortDir::Desc => "DESC",
    }
}

fn and_where(qb: &mut QueryBuilder<'_, Sqlite>, first: &mut bool) {
    qb.push(if *first { " WHERE " } else { " AND " });
    *first = false;
}

/// Append the WHERE clause for `filter`.
fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &TaskFilter) {
    let mut first = true;

    if let Some(name) = &filter.name {
        and_where(qb, &mut first);
        qb.push("name = ").push_bind(name.clone());
    }
    if let Some(state) = filter.state {
        and_where(qb, &mut first);
        qb.push("state = ").push_bind(state.as_str());
    }
    if let Some(worker) = &filter.worker {
        and_where(qb, &mut first);
        qb.push("worker = ").push_bind(worker.clone());
    }
    if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", escape_like(search));
        and_where(qb, &mut first);
        qb.push("(");
        for (i, column) in ["task_id", "name", "args", "kwargs"].iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            qb.push(*column)
                .push(" LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\'");
        }
        qb.push(")");
    }
    if let Some(range) = &filter.time_range {
        if let Some(start) = range.start {
            and_where(qb, &mut first);
            qb.push("last_updated >= ").push_bind(to_epoch(start));
        }
        if let Some(end) = range.end {
            and_where(qb, &mut first);
            qb.push("last_updated < ").push_bind(to_epoch(end));
        }
    }
}

/// SQLite implementation of task storage.
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    /// Create a new SqliteTaskRepository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Parse a task row into a Task struct.
    fn parse_task_row(row: &SqliteRow) -> Task {
        let state: String = row.get("state");
        Task {
            task_id: row.get("task_id"),
            name: row.get("name"),
            state: state.parse().unwrap_or(TaskState::Pending),
            worker: row.get("worker"),
            received_at: row.get::<Option<f64>, _>("received_at").map(from_epoch),
            started_at: row.get::<Option<f64>, _>("started_at").map(from_epoch),
            finished_at: row.get::<Option<f64>, _>("finished_at").map(from_epoch),
            last_updated: from_epoch(row.get("last_updated")),
            runtime: row.get("runtime"),
            args: row.get("args"),
            kwargs: row.get("kwargs"),
            result: row.get("result"),
            exception: row.get("exception"),
            traceback: row.get("traceback"),
            retries: row.get("retries"),
            root_id: row.get("root_id"),
            parent_id: row.get("parent_id"),
        }
    }

    /// Append the raw event, record its lineage and fold it into the view,
    /// all in one transaction. Returns the assigned ingestion sequence.
    pub async fn store_event(&self, event: &TaskEvent) -> Result<i64> {
        if event.task_id.is_empty() {
            return Err(Error::InvalidInput("task_id must not be empty".into()));
        }

        let mut tx = self.pool.begin().await.map_err(Error::Storage)?;

        let seq = sqlx::query(
            r#"
            INSERT INTO task_events
                (task_id, name, state, ts, worker, args, kwargs, result, runtime,
                 retries, exception, traceback, root_id, parent_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.task_id)
        .bind(&event.name)
        .bind(event.state.as_str())
        .bind(to_epoch(event.timestamp))
        .bind(&event.worker)
        .bind(&event.args)
        .bind(&event.kwargs)
        .bind(&event.result)
        .bind(event.runtime)
        .bind(event.retries)
        .bind(&event.exception)
        .bind(&event.traceback)
        .bind(&event.root_id)
        .bind(&event.parent_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Storage)?
        .last_insert_rowid();

        if let Some(relation) = lineage_relation(event) {
            insert_relation(&mut tx, &relation).await?;
        }

        let existing = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
            .bind(&event.task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Storage)?
            .map(|row| Self::parse_task_row(&row));

        let task = fold_event(existing, event);

        sqlx::query(
            r#"
            INSERT INTO tasks
                (task_id, name, state, worker, received_at, started_at, finished_at,
                 last_updated, runtime, args, kwargs, result, exception, traceback,
                 retries, root_id, parent_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (task_id) DO UPDATE SET
                name = excluded.name,
                state = excluded.state,
                worker = excluded.worker,
                received_at = excluded.received_at,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                last_updated = excluded.last_updated,
                runtime = excluded.runtime,
                args = excluded.args,
                kwargs = excluded.kwargs,
                result = excluded.result,
                exception = excluded.exception,
                traceback = excluded.traceback,
                retries = excluded.retries,
                root_id = excluded.root_id,
                parent_id = excluded.parent_id
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.name)
        .bind(task.state.as_str())
        .bind(&task.worker)
        .bind(task.received_at.map(to_epoch))
        .bind(task.started_at.map(to_epoch))
        .bind(task.finished_at.map(to_epoch))
        .bind(to_epoch(task.last_updated))
        .bind(task.runtime)
        .bind(&task.args)
        .bind(&task.kwargs)
        .bind(&task.result)
        .bind(&task.exception)
        .bind(&task.traceback)
        .bind(task.retries)
        .bind(&task.root_id)
        .bind(&task.parent_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Storage)?;

        tx.commit().await.map_err(Error::Storage)?;
        Ok(seq)
    }

    /// Fetch one task view.
    pub async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Storage)?;
        Ok(row.map(|r| Self::parse_task_row(&r)))
    }

    /// Every matching task, most recently updated first.
    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM tasks");
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY last_updated DESC, task_id ASC");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Storage)?;
        Ok(rows.iter().map(Self::parse_task_row).collect())
    }

    /// One page of matching tasks plus the full match count, read from one
    /// snapshot. A limit of zero or less yields an empty page that still
    /// carries the count.
    pub async fn page(&self, request: &TaskPageRequest) -> Result<TaskPage> {
        let limit = request.limit.clamp(0, MAX_PAGE_LIMIT);
        let offset = request.offset.max(0);

        let mut tx = self.pool.begin().await.map_err(Error::Storage)?;

        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM tasks");
        push_filter(&mut count_qb, &request.filter);
        let total: i64 = count_qb
            .build()
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::Storage)?
            .get("total");

        if limit == 0 {
            tx.commit().await.map_err(Error::Storage)?;
            return Ok(TaskPage {
                tasks: Vec::new(),
                total,
            });
        }

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM tasks");
        push_filter(&mut qb, &request.filter);
        qb.push(" ORDER BY ")
            .push(sort_column(request.sort_key))
            .push(" ")
            .push(sort_direction(request.sort_dir))
            .push(", task_id ASC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = qb
            .build()
            .fetch_all(&mut *tx)
            .await
            .map_err(Error::Storage)?;
        tx.commit().await.map_err(Error::Storage)?;

        Ok(TaskPage {
            tasks: rows.iter().map(Self::parse_task_row).collect(),
            total,
        })
    }

    /// Distinct non-null task names, sorted.
    pub async fn list_names(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT name FROM tasks WHERE name IS NOT NULL ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Storage)?;
        Ok(names)
    }
}
