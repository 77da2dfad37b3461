//! Persistent task queue with per-key reservations.
//!
//! # Responsibility
//! - Enqueue tasks keyed by `(resource type, resource id)`.
//! - Hand out the next runnable task to a worker (claim protocol).
//! - Record outcomes and release reservations.
//!
//! # Invariants
//! - The `reservations` primary key holds one row per key: the current holder.
//!   Waiters are the `waiting` tasks with that key, ordered by `seq`.
//! - A task is claimable only if its key has no holder and no earlier waiter.
//! - Claim and finish each run in one IMMEDIATE transaction, which serializes
//!   them across every connection to the database.
//! - Every claimer has a `workers` row refreshed by heartbeats. A running task
//!   is only taken away from a worker whose heartbeat has gone stale.

use crate::model::task::{
    ReservationKey, ResourceType, TaskHandle, TaskId, TaskRecord, TaskState,
};
use crate::queue::registry::TaskOutput;
use crate::repo::{parse_uuid, RepoError, RepoResult};
use log::{info, warn};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Row, Transaction, TransactionBehavior};
use serde_json::Value;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const TASK_SELECT_SQL: &str = "SELECT
    seq,
    id,
    name,
    args,
    resource_type,
    resource_id,
    state,
    result,
    error,
    worker,
    enqueued_at,
    started_at,
    finished_at
FROM tasks";

// `?1` is the heartbeat cutoff in epoch ms.
const ORPHANED_TASK_SQL: &str = "t.state = 'running'
    AND NOT EXISTS (
      SELECT 1 FROM workers w
      WHERE w.name = t.worker AND w.heartbeat_at >= ?1
    )";

const TASKS_DEFAULT_LIMIT: u32 = 50;
const TASKS_LIMIT_MAX: u32 = 500;

/// Filters for task listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskListQuery {
    pub state: Option<TaskState>,
    pub key: Option<ReservationKey>,
    /// Defaults to 50 and clamps to 500.
    pub limit: Option<u32>,
    pub offset: u32,
}

/// Queue and status-store contract.
pub trait TaskQueue {
    /// Persists a waiting task and returns without running it.
    fn reserve_and_run(
        &self,
        key: ReservationKey,
        task_name: &str,
        args: &Value,
    ) -> RepoResult<TaskHandle>;
    /// Claims the oldest runnable task for `worker`, if any.
    fn claim_next(&self, worker: &str) -> RepoResult<Option<TaskRecord>>;
    /// Records the outcome of a running task and releases its reservation.
    fn finish(&self, task_id: TaskId, outcome: &TaskOutput) -> RepoResult<TaskState>;
    /// Drops a task that has not started yet.
    fn cancel(&self, task_id: TaskId) -> RepoResult<()>;
    /// Fails every task running under `worker` and releases its reservations.
    ///
    /// For operators who know the worker is gone. Pools use
    /// [`TaskQueue::recover_stale_workers`] instead.
    fn recover_worker(&self, worker: &str) -> RepoResult<usize>;
    /// Refreshes the heartbeat of live workers.
    fn heartbeat(&self, workers: &[String]) -> RepoResult<()>;
    /// Removes worker rows after a clean shutdown.
    fn deregister(&self, workers: &[String]) -> RepoResult<()>;
    /// Fails tasks whose worker has not sent a heartbeat within `stale_after`,
    /// or has no heartbeat row at all, and releases their reservations.
    fn recover_stale_workers(&self, stale_after: Duration) -> RepoResult<usize>;
    fn task_status(&self, task_id: TaskId) -> RepoResult<Option<TaskRecord>>;
    /// Lists tasks in submission order.
    fn list_tasks(&self, query: &TaskListQuery) -> RepoResult<Vec<TaskRecord>>;
    /// Task currently holding `key`.
    fn holder(&self, key: ReservationKey) -> RepoResult<Option<TaskId>>;
    /// Tasks queued behind `key`, in the order they will run.
    fn waiters(&self, key: ReservationKey) -> RepoResult<Vec<TaskId>>;
    /// Number of tasks still waiting, across all keys.
    fn pending_count(&self) -> RepoResult<usize>;
}

/// SQLite-backed task queue.
pub struct SqliteTaskQueue<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteTaskQueue<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl TaskQueue for SqliteTaskQueue<'_> {
    fn reserve_and_run(
        &self,
        key: ReservationKey,
        task_name: &str,
        args: &Value,
    ) -> RepoResult<TaskHandle> {
        let task_id = Uuid::new_v4();
        let args_text = serde_json::to_string(args)
            .map_err(|err| RepoError::Validation(format!("task arguments: {err}")))?;
        self.conn.execute(
            "INSERT INTO tasks (id, name, args, resource_type, resource_id, state)
             VALUES (?1, ?2, ?3, ?4, ?5, 'waiting');",
            params![
                task_id.to_string(),
                task_name,
                args_text,
                key.resource_type.as_tag(),
                key.resource_id.to_string(),
            ],
        )?;

        info!(
            "event=task_enqueue module=queue status=ok task_id={} task_name={} resource={}",
            task_id, task_name, key
        );
        Ok(TaskHandle { task_id, key })
    }

    fn claim_next(&self, worker: &str) -> RepoResult<Option<TaskRecord>> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let candidate = {
            let mut stmt = tx.prepare(&format!(
                "{TASK_SELECT_SQL} t
                 WHERE t.state = 'waiting'
                   AND NOT EXISTS (
                     SELECT 1 FROM reservations r
                     WHERE r.resource_type = t.resource_type
                       AND r.resource_id = t.resource_id
                   )
                   AND NOT EXISTS (
                     SELECT 1 FROM tasks e
                     WHERE e.state = 'waiting'
                       AND e.resource_type = t.resource_type
                       AND e.resource_id = t.resource_id
                       AND e.seq < t.seq
                   )
                 ORDER BY t.seq ASC
                 LIMIT 1;"
            ))?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => Some(parse_task_row(row)?),
                None => None,
            }
        };

        let Some(task) = candidate else {
            return Ok(None);
        };

        touch_worker(&tx, worker)?;
        tx.execute(
            "INSERT INTO reservations (resource_type, resource_id, task_id)
             VALUES (?1, ?2, ?3);",
            params![
                task.key.resource_type.as_tag(),
                task.key.resource_id.to_string(),
                task.id.to_string(),
            ],
        )?;
        tx.execute(
            "UPDATE tasks
             SET state = 'running',
                 worker = ?2,
                 started_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?1 AND state = 'waiting';",
            params![task.id.to_string(), worker],
        )?;
        tx.commit()?;

        info!(
            "event=task_claim module=queue status=ok task_id={} task_name={} resource={} worker={}",
            task.id, task.name, task.key, worker
        );
        self.task_status(task.id)
    }

    fn finish(&self, task_id: TaskId, outcome: &TaskOutput) -> RepoResult<TaskState> {
        let (state, result_text, error_text) = match outcome {
            Ok(result) => (
                TaskState::Completed,
                Some(serde_json::to_string(result).map_err(|err| {
                    RepoError::InvalidData(format!("task result is not serializable: {err}"))
                })?),
                None,
            ),
            Err(err) => (TaskState::Failed, None, Some(err.message().to_string())),
        };

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE tasks
             SET state = ?2,
                 result = ?3,
                 error = ?4,
                 finished_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?1 AND state = 'running';",
            params![task_id.to_string(), state.as_db(), result_text, error_text],
        )?;
        tx.execute(
            "DELETE FROM reservations WHERE task_id = ?1;",
            [task_id.to_string()],
        )?;
        if changed == 0 {
            return Err(RepoError::Conflict(format!("task {task_id} is not running")));
        }
        tx.commit()?;

        info!(
            "event=task_finish module=queue status={} task_id={}",
            state.as_db(),
            task_id
        );
        Ok(state)
    }

    fn cancel(&self, task_id: TaskId) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE tasks
             SET state = 'canceled',
                 finished_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?1 AND state = 'waiting';",
            [task_id.to_string()],
        )?;
        if changed == 0 {
            return match self.task_status(task_id)? {
                Some(task) => Err(RepoError::Conflict(format!(
                    "task {task_id} cannot be canceled in state {}",
                    task.state.as_db()
                ))),
                None => Err(RepoError::not_found("task", task_id)),
            };
        }

        info!(
            "event=task_cancel module=queue status=ok task_id={}",
            task_id
        );
        Ok(())
    }

    fn recover_worker(&self, worker: &str) -> RepoResult<usize> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM reservations
             WHERE task_id IN (
               SELECT id FROM tasks WHERE state = 'running' AND worker = ?1
             );",
            [worker],
        )?;
        let recovered = tx.execute(
            "UPDATE tasks
             SET state = 'failed',
                 error = ?2,
                 finished_at = (strftime('%s', 'now') * 1000)
             WHERE state = 'running' AND worker = ?1;",
            params![
                worker,
                format!("worker `{worker}` restarted before the task finished")
            ],
        )?;
        tx.execute("DELETE FROM workers WHERE name = ?1;", [worker])?;
        tx.commit()?;

        if recovered > 0 {
            warn!(
                "event=worker_recover module=queue status=ok worker={} failed_tasks={}",
                worker, recovered
            );
        }
        Ok(recovered)
    }

    fn heartbeat(&self, workers: &[String]) -> RepoResult<()> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        for worker in workers {
            touch_worker(&tx, worker)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn deregister(&self, workers: &[String]) -> RepoResult<()> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        for worker in workers {
            tx.execute("DELETE FROM workers WHERE name = ?1;", [worker])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn recover_stale_workers(&self, stale_after: Duration) -> RepoResult<usize> {
        let stale_ms = i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let cutoff: i64 = tx.query_row(
            "SELECT (strftime('%s', 'now') * 1000) - ?1;",
            [stale_ms],
            |row| row.get(0),
        )?;
        tx.execute(
            &format!(
                "DELETE FROM reservations
                 WHERE task_id IN (SELECT t.id FROM tasks t WHERE {ORPHANED_TASK_SQL});"
            ),
            [cutoff],
        )?;
        let recovered = tx.execute(
            &format!(
                "UPDATE tasks AS t
                 SET state = 'failed',
                     error = 'worker `' || COALESCE(t.worker, '') ||
                             '` stopped heartbeating before the task finished',
                     finished_at = (strftime('%s', 'now') * 1000)
                 WHERE {ORPHANED_TASK_SQL};"
            ),
            [cutoff],
        )?;
        let dead_workers = tx.execute("DELETE FROM workers WHERE heartbeat_at < ?1;", [cutoff])?;
        tx.commit()?;

        if recovered > 0 || dead_workers > 0 {
            warn!(
                "event=worker_recover module=queue status=ok dead_workers={} failed_tasks={}",
                dead_workers, recovered
            );
        }
        Ok(recovered)
    }

    fn task_status(&self, task_id: TaskId) -> RepoResult<Option<TaskRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{TASK_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([task_id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_task_row(row)?));
        }
        Ok(None)
    }

    fn list_tasks(&self, query: &TaskListQuery) -> RepoResult<Vec<TaskRecord>> {
        let mut sql = format!("{TASK_SELECT_SQL} WHERE 1 = 1");
        let mut bind_values: Vec<SqlValue> = Vec::new();

        if let Some(state) = query.state {
            sql.push_str(" AND state = ?");
            bind_values.push(SqlValue::Text(state.as_db().to_string()));
        }
        if let Some(key) = query.key {
            sql.push_str(" AND resource_type = ? AND resource_id = ?");
            bind_values.push(SqlValue::Text(key.resource_type.as_tag().to_string()));
            bind_values.push(SqlValue::Text(key.resource_id.to_string()));
        }

        sql.push_str(" ORDER BY seq ASC LIMIT ?");
        bind_values.push(SqlValue::Integer(i64::from(normalize_task_limit(
            query.limit,
        ))));
        if query.offset > 0 {
            sql.push_str(" OFFSET ?");
            bind_values.push(SqlValue::Integer(i64::from(query.offset)));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(parse_task_row(row)?);
        }
        Ok(tasks)
    }

    fn holder(&self, key: ReservationKey) -> RepoResult<Option<TaskId>> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id FROM reservations WHERE resource_type = ?1 AND resource_id = ?2;",
        )?;
        let mut rows = stmt.query(params![
            key.resource_type.as_tag(),
            key.resource_id.to_string()
        ])?;
        if let Some(row) = rows.next()? {
            let text: String = row.get(0)?;
            return Ok(Some(parse_uuid(&text, "reservations.task_id")?));
        }
        Ok(None)
    }

    fn waiters(&self, key: ReservationKey) -> RepoResult<Vec<TaskId>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM tasks
             WHERE state = 'waiting' AND resource_type = ?1 AND resource_id = ?2
             ORDER BY seq ASC;",
        )?;
        let mut rows = stmt.query(params![
            key.resource_type.as_tag(),
            key.resource_id.to_string()
        ])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            let text: String = row.get(0)?;
            ids.push(parse_uuid(&text, "tasks.id")?);
        }
        Ok(ids)
    }

    fn pending_count(&self) -> RepoResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE state = 'waiting';",
            [],
            |row| row.get(0),
        )?;
        usize::try_from(count)
            .map_err(|_| RepoError::InvalidData(format!("negative row count {count}")))
    }
}

/// Polls the status store until the task reaches a terminal state.
///
/// Returns the last observed record when `timeout` elapses first.
pub fn wait_for_task(
    conn: &Connection,
    task_id: TaskId,
    timeout: Duration,
    poll_interval: Duration,
) -> RepoResult<TaskRecord> {
    let queue = SqliteTaskQueue::new(conn);
    let deadline = Instant::now() + timeout;
    loop {
        let record = queue
            .task_status(task_id)?
            .ok_or_else(|| RepoError::not_found("task", task_id))?;
        if record.state.is_terminal() || Instant::now() >= deadline {
            return Ok(record);
        }
        thread::sleep(poll_interval);
    }
}

fn touch_worker(conn: &Connection, worker: &str) -> RepoResult<()> {
    conn.execute(
        "INSERT INTO workers (name) VALUES (?1)
         ON CONFLICT (name)
         DO UPDATE SET heartbeat_at = (strftime('%s', 'now') * 1000);",
        [worker],
    )?;
    Ok(())
}

/// Normalizes task list limit.
pub fn normalize_task_limit(limit: Option<u32>) -> u32 {
    match limit {
        Some(0) | None => TASKS_DEFAULT_LIMIT,
        Some(value) if value > TASKS_LIMIT_MAX => TASKS_LIMIT_MAX,
        Some(value) => value,
    }
}

fn parse_task_row(row: &Row<'_>) -> RepoResult<TaskRecord> {
    let id_text: String = row.get("id")?;
    let resource_type_text: String = row.get("resource_type")?;
    let resource_type = ResourceType::from_tag(&resource_type_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid resource type `{resource_type_text}` in tasks.resource_type"
        ))
    })?;
    let resource_id_text: String = row.get("resource_id")?;
    let state_text: String = row.get("state")?;
    let state = TaskState::from_db(&state_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid task state `{state_text}` in tasks.state"))
    })?;

    let args_text: String = row.get("args")?;
    let args = parse_json(&args_text, "tasks.args")?;
    let result = match row.get::<_, Option<String>>("result")? {
        Some(text) => Some(parse_json(&text, "tasks.result")?),
        None => None,
    };

    Ok(TaskRecord {
        id: parse_uuid(&id_text, "tasks.id")?,
        seq: row.get("seq")?,
        name: row.get("name")?,
        args,
        key: ReservationKey::new(
            resource_type,
            parse_uuid(&resource_id_text, "tasks.resource_id")?,
        ),
        state,
        result,
        error: row.get("error")?,
        worker: row.get("worker")?,
        enqueued_at: row.get("enqueued_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
    })
}

fn parse_json(text: &str, column: &str) -> RepoResult<Value> {
    serde_json::from_str(text)
        .map_err(|err| RepoError::InvalidData(format!("invalid json in {column}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::{SqliteTaskQueue, TaskQueue};
    use crate::db::open_db_in_memory;
    use crate::model::task::{ReservationKey, TaskState};
    use crate::queue::registry::TaskError;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn same_key_waits_for_holder_and_keeps_fifo() {
        let conn = open_db_in_memory().unwrap();
        let queue = SqliteTaskQueue::new(&conn);
        let key = ReservationKey::repository(Uuid::new_v4());
        let first = queue.reserve_and_run(key, "t.first", &json!({})).unwrap();
        let second = queue.reserve_and_run(key, "t.second", &json!({})).unwrap();

        let claimed = queue.claim_next("w-0").unwrap().unwrap();
        assert_eq!(claimed.id, first.task_id);
        assert_eq!(claimed.state, TaskState::Running);
        assert_eq!(queue.holder(key).unwrap(), Some(first.task_id));
        assert_eq!(queue.waiters(key).unwrap(), vec![second.task_id]);
        assert!(queue.claim_next("w-1").unwrap().is_none());

        queue.finish(first.task_id, &Ok(json!("done"))).unwrap();
        let next = queue.claim_next("w-1").unwrap().unwrap();
        assert_eq!(next.id, second.task_id);
    }

    #[test]
    fn other_keys_are_not_blocked() {
        let conn = open_db_in_memory().unwrap();
        let queue = SqliteTaskQueue::new(&conn);
        let busy = ReservationKey::repository(Uuid::new_v4());
        let free = ReservationKey::repository(Uuid::new_v4());
        queue.reserve_and_run(busy, "t.a", &json!({})).unwrap();
        queue.reserve_and_run(busy, "t.b", &json!({})).unwrap();
        let other = queue.reserve_and_run(free, "t.c", &json!({})).unwrap();

        queue.claim_next("w-0").unwrap().unwrap();
        let claimed = queue.claim_next("w-1").unwrap().unwrap();
        assert_eq!(claimed.id, other.task_id);
    }

    #[test]
    fn failure_is_recorded_and_releases_reservation() {
        let conn = open_db_in_memory().unwrap();
        let queue = SqliteTaskQueue::new(&conn);
        let key = ReservationKey::repository(Uuid::new_v4());
        let handle = queue.reserve_and_run(key, "t.fail", &json!({})).unwrap();
        queue.claim_next("w-0").unwrap().unwrap();

        let state = queue
            .finish(handle.task_id, &Err(TaskError::new("boom")))
            .unwrap();
        assert_eq!(state, TaskState::Failed);
        let record = queue.task_status(handle.task_id).unwrap().unwrap();
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert!(record.finished_at.is_some());
        assert_eq!(queue.holder(key).unwrap(), None);
    }

    #[test]
    fn cancel_only_applies_to_waiting_tasks() {
        let conn = open_db_in_memory().unwrap();
        let queue = SqliteTaskQueue::new(&conn);
        let key = ReservationKey::repository(Uuid::new_v4());
        let running = queue.reserve_and_run(key, "t.run", &json!({})).unwrap();
        let waiting = queue.reserve_and_run(key, "t.wait", &json!({})).unwrap();
        queue.claim_next("w-0").unwrap().unwrap();

        queue.cancel(waiting.task_id).unwrap();
        assert!(queue.cancel(running.task_id).is_err());
        assert!(queue.cancel(Uuid::new_v4()).unwrap_err().is_not_found());

        queue.finish(running.task_id, &Ok(json!(null))).unwrap();
        assert!(queue.claim_next("w-0").unwrap().is_none());
        assert_eq!(queue.pending_count().unwrap(), 0);
    }

    #[test]
    fn recover_worker_fails_orphaned_tasks() {
        let conn = open_db_in_memory().unwrap();
        let queue = SqliteTaskQueue::new(&conn);
        let key = ReservationKey::repository(Uuid::new_v4());
        let orphan = queue.reserve_and_run(key, "t.orphan", &json!({})).unwrap();
        let next = queue.reserve_and_run(key, "t.next", &json!({})).unwrap();
        queue.claim_next("w-0").unwrap().unwrap();

        assert_eq!(queue.recover_worker("w-1").unwrap(), 0);
        assert_eq!(queue.recover_worker("w-0").unwrap(), 1);

        let record = queue.task_status(orphan.task_id).unwrap().unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert!(record.error.unwrap().contains("restarted"));
        assert_eq!(queue.claim_next("w-0").unwrap().unwrap().id, next.task_id);
    }

    #[test]
    fn live_workers_keep_their_tasks() {
        let conn = open_db_in_memory().unwrap();
        let queue = SqliteTaskQueue::new(&conn);
        let key = ReservationKey::repository(Uuid::new_v4());
        let handle = queue.reserve_and_run(key, "t.busy", &json!({})).unwrap();
        queue.claim_next("live-0").unwrap().unwrap();
        queue.heartbeat(&["live-0".to_string()]).unwrap();

        assert_eq!(
            queue.recover_stale_workers(Duration::from_secs(60)).unwrap(),
            0
        );
        assert_eq!(queue.holder(key).unwrap(), Some(handle.task_id));
        assert_eq!(
            queue.task_status(handle.task_id).unwrap().unwrap().state,
            TaskState::Running
        );
    }

    #[test]
    fn stale_heartbeat_releases_reservation() {
        let conn = open_db_in_memory().unwrap();
        let queue = SqliteTaskQueue::new(&conn);
        let key = ReservationKey::repository(Uuid::new_v4());
        let stuck = queue.reserve_and_run(key, "t.stuck", &json!({})).unwrap();
        let next = queue.reserve_and_run(key, "t.next", &json!({})).unwrap();
        queue.claim_next("gone-0").unwrap().unwrap();
        conn.execute(
            "UPDATE workers SET heartbeat_at = 0 WHERE name = 'gone-0';",
            [],
        )
        .unwrap();

        assert_eq!(
            queue.recover_stale_workers(Duration::from_secs(60)).unwrap(),
            1
        );
        let record = queue.task_status(stuck.task_id).unwrap().unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert!(record.error.unwrap().contains("gone-0"));
        assert_eq!(queue.claim_next("live-0").unwrap().unwrap().id, next.task_id);
    }

    #[test]
    fn deregistered_worker_tasks_are_orphans() {
        let conn = open_db_in_memory().unwrap();
        let queue = SqliteTaskQueue::new(&conn);
        let key = ReservationKey::repository(Uuid::new_v4());
        queue.reserve_and_run(key, "t.lost", &json!({})).unwrap();
        queue.claim_next("lost-0").unwrap().unwrap();
        queue.deregister(&["lost-0".to_string()]).unwrap();

        assert_eq!(
            queue.recover_stale_workers(Duration::from_secs(60)).unwrap(),
            1
        );
        assert_eq!(queue.holder(key).unwrap(), None);
    }
}
