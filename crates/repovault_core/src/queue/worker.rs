//! Worker threads that execute queued tasks.
//!
//! # Responsibility
//! - Claim runnable tasks, dispatch them through the [`TaskRegistry`] and
//!   record the outcome.
//! - Contain handler failures: errors and panics become failed tasks.
//! - Keep the pool's heartbeat fresh and recover tasks of dead workers.
//!
//! # Invariants
//! - Each worker owns its own SQLite connection.
//! - Worker names carry a per-pool instance id, so two pools never share a
//!   name even with identical config.
//! - A running task is only recovered once its worker's heartbeat is older
//!   than `stale_after`; live pools never lose reservations to each other.
//! - A worker does not claim new work until the outcome of its current task
//!   is recorded.

use crate::db::{open_db, DbError};
use crate::model::task::TaskRecord;
use crate::queue::registry::{TaskError, TaskOutput, TaskRegistry};
use crate::queue::reservation::{SqliteTaskQueue, TaskQueue};
use crate::repo::{RepoError, RepoResult};
use log::{error, info, warn};
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

const MAX_PANIC_MESSAGE_CHARS: usize = 200;
const FINISH_RETRY_INITIAL: Duration = Duration::from_millis(50);
const FINISH_RETRY_MAX: Duration = Duration::from_secs(2);
/// Attempts made even after shutdown was requested.
const FINISH_ATTEMPTS_ON_STOP: u32 = 3;

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub count: usize,
    /// Sleep between claim attempts when nothing is runnable.
    pub poll_interval: Duration,
    /// Worker `i` is named `{name_prefix}-{i}-{instance id}`.
    pub name_prefix: String,
    /// Exit once no waiting task remains instead of polling forever.
    pub burst: bool,
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which another pool may fail a worker's tasks.
    pub stale_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 2,
            poll_interval: Duration::from_millis(50),
            name_prefix: "worker".to_string(),
            burst: false,
            heartbeat_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    fn validate(&self) -> Result<(), WorkerError> {
        if self.count == 0 {
            return Err(WorkerError::InvalidConfig(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.name_prefix.trim().is_empty() {
            return Err(WorkerError::InvalidConfig(
                "worker name prefix cannot be empty".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(WorkerError::InvalidConfig(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if self.stale_after < self.heartbeat_interval * 2 {
            return Err(WorkerError::InvalidConfig(
                "stale_after must be at least twice the heartbeat interval".to_string(),
            ));
        }
        Ok(())
    }
}

/// Worker pool startup errors.
#[derive(Debug)]
pub enum WorkerError {
    InvalidConfig(String),
    Db(DbError),
    Repo(RepoError),
    Spawn(std::io::Error),
}

impl Display for WorkerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfig(message) => write!(f, "invalid worker config: {message}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
            Self::Spawn(err) => write!(f, "failed to spawn worker thread: {err}"),
        }
    }
}

impl Error for WorkerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Repo(err) => Some(err),
            Self::Spawn(err) => Some(err),
            Self::InvalidConfig(_) => None,
        }
    }
}

impl From<DbError> for WorkerError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<RepoError> for WorkerError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// Running set of worker threads sharing one database file.
pub struct WorkerPool {
    names: Vec<String>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    heartbeat_stop: Arc<AtomicBool>,
    heartbeat: Option<JoinHandle<()>>,
}

impl WorkerPool {
    /// Registers the pool's workers, recovers tasks of dead workers, then
    /// spawns the worker and heartbeat threads.
    pub fn start(
        db_path: impl AsRef<Path>,
        registry: Arc<TaskRegistry>,
        config: &WorkerConfig,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        let db_path = db_path.as_ref();
        let prefix = config.name_prefix.trim();
        let instance = Uuid::new_v4().simple().to_string();
        let names: Vec<String> = (0..config.count)
            .map(|index| format!("{prefix}-{index}-{instance}"))
            .collect();

        let heartbeat_conn = open_db(db_path)?;
        {
            let queue = SqliteTaskQueue::new(&heartbeat_conn);
            queue.heartbeat(&names)?;
            queue.recover_stale_workers(config.stale_after)?;
        }
        let worker_conns = names
            .iter()
            .map(|_| open_db(db_path))
            .collect::<Result<Vec<_>, _>>()?;

        let mut pool = Self {
            names: names.clone(),
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::with_capacity(names.len()),
            heartbeat_stop: Arc::new(AtomicBool::new(false)),
            heartbeat: None,
        };

        let heartbeat = Heartbeat {
            names: names.clone(),
            stop: Arc::clone(&pool.heartbeat_stop),
            interval: config.heartbeat_interval,
            tick: config.poll_interval.min(config.heartbeat_interval),
            stale_after: config.stale_after,
        };
        pool.heartbeat = Some(
            thread::Builder::new()
                .name(format!("{prefix}-heartbeat-{instance}"))
                .spawn(move || heartbeat.run(heartbeat_conn))
                .map_err(WorkerError::Spawn)?,
        );

        for (name, conn) in names.into_iter().zip(worker_conns) {
            let worker = WorkerLoop {
                name: name.clone(),
                registry: Arc::clone(&registry),
                stop: Arc::clone(&pool.stop),
                poll_interval: config.poll_interval,
                burst: config.burst,
            };
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || worker.run(conn))
                .map_err(WorkerError::Spawn)?;
            pool.handles.push(handle);
        }

        Ok(pool)
    }

    pub fn worker_names(&self) -> &[String] {
        &self.names
    }

    /// Blocks until every worker exits on its own (burst mode).
    pub fn wait(mut self) {
        self.join_workers();
        self.stop_heartbeat();
    }

    /// Signals every worker to stop after its current task and joins them.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.join_workers();
        self.stop_heartbeat();
    }

    fn join_workers(&mut self) {
        for handle in self.handles.drain(..) {
            join_logged(handle);
        }
    }

    // Runs after the workers are gone so their rows stay fresh until then.
    fn stop_heartbeat(&mut self) {
        self.heartbeat_stop.store(true, Ordering::Release);
        if let Some(handle) = self.heartbeat.take() {
            join_logged(handle);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn join_logged(handle: JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("unnamed").to_string();
    if handle.join().is_err() {
        error!(
            "event=worker_join module=queue status=error worker={}",
            name
        );
    }
}

struct Heartbeat {
    names: Vec<String>,
    stop: Arc<AtomicBool>,
    interval: Duration,
    tick: Duration,
    stale_after: Duration,
}

impl Heartbeat {
    fn run(self, conn: Connection) {
        let queue = SqliteTaskQueue::new(&conn);
        let mut next_beat = Instant::now();
        while !self.stop.load(Ordering::Acquire) {
            if Instant::now() >= next_beat {
                if let Err(err) = queue.heartbeat(&self.names) {
                    warn!(
                        "event=worker_heartbeat module=queue status=error error={}",
                        err
                    );
                }
                if let Err(err) = queue.recover_stale_workers(self.stale_after) {
                    warn!(
                        "event=worker_recover module=queue status=error error={}",
                        err
                    );
                }
                next_beat = Instant::now() + self.interval;
            }
            thread::sleep(self.tick);
        }

        if let Err(err) = queue.deregister(&self.names) {
            warn!(
                "event=worker_deregister module=queue status=error error={}",
                err
            );
        }
    }
}

struct WorkerLoop {
    name: String,
    registry: Arc<TaskRegistry>,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
    burst: bool,
}

impl WorkerLoop {
    fn run(self, conn: Connection) {
        info!(
            "event=worker_start module=queue status=ok worker={} burst={}",
            self.name, self.burst
        );

        let mut processed = 0_usize;
        while !self.stop.load(Ordering::Acquire) {
            match execute_next(&conn, &self.registry, &self.name, &self.stop) {
                Ok(true) => {
                    processed += 1;
                    continue;
                }
                Ok(false) => {
                    if self.burst && self.queue_is_drained(&conn) {
                        break;
                    }
                }
                Err(err) => {
                    warn!(
                        "event=worker_poll module=queue status=error worker={} error={}",
                        self.name, err
                    );
                }
            }
            thread::sleep(self.poll_interval);
        }

        info!(
            "event=worker_stop module=queue status=ok worker={} processed={}",
            self.name, processed
        );
    }

    fn queue_is_drained(&self, conn: &Connection) -> bool {
        match SqliteTaskQueue::new(conn).pending_count() {
            Ok(count) => count == 0,
            Err(err) => {
                warn!(
                    "event=worker_poll module=queue status=error worker={} error={}",
                    self.name, err
                );
                false
            }
        }
    }
}

/// Claims and executes at most one task.
///
/// Returns `Ok(false)` when nothing is runnable right now. Recording the
/// outcome is retried on storage errors until it succeeds.
pub fn run_next(conn: &Connection, registry: &TaskRegistry, worker: &str) -> RepoResult<bool> {
    execute_next(conn, registry, worker, &AtomicBool::new(false))
}

/// Runs tasks on the calling thread until nothing is runnable.
///
/// Returns the number of tasks executed.
pub fn drain(conn: &Connection, registry: &TaskRegistry, worker: &str) -> RepoResult<usize> {
    let mut executed = 0;
    while run_next(conn, registry, worker)? {
        executed += 1;
    }
    Ok(executed)
}

fn execute_next(
    conn: &Connection,
    registry: &TaskRegistry,
    worker: &str,
    stop: &AtomicBool,
) -> RepoResult<bool> {
    let queue = SqliteTaskQueue::new(conn);
    let Some(task) = queue.claim_next(worker)? else {
        return Ok(false);
    };

    let started_at = Instant::now();
    let outcome = run_task(conn, registry, &task);
    if let Err(err) = &outcome {
        warn!(
            "event=task_run module=queue status=error task_id={} task_name={} worker={} duration_ms={} error={}",
            task.id,
            task.name,
            worker,
            started_at.elapsed().as_millis(),
            err
        );
    } else {
        info!(
            "event=task_run module=queue status=ok task_id={} task_name={} worker={} duration_ms={}",
            task.id,
            task.name,
            worker,
            started_at.elapsed().as_millis()
        );
    }

    finish_with_retry(&queue, &task, &outcome, stop)?;
    Ok(true)
}

/// Records a task outcome, backing off on storage errors.
///
/// Semantic errors (the task is no longer running) are returned at once.
/// After `stop` is set only a few more attempts are made.
fn finish_with_retry(
    queue: &SqliteTaskQueue<'_>,
    task: &TaskRecord,
    outcome: &TaskOutput,
    stop: &AtomicBool,
) -> RepoResult<()> {
    let mut delay = FINISH_RETRY_INITIAL;
    let mut attempt = 1_u32;
    loop {
        match queue.finish(task.id, outcome) {
            Ok(_) => return Ok(()),
            Err(err @ RepoError::Db(_)) => {
                if stop.load(Ordering::Acquire) && attempt >= FINISH_ATTEMPTS_ON_STOP {
                    error!(
                        "event=task_finish module=queue status=error task_id={} attempts={} error={}",
                        task.id, attempt, err
                    );
                    return Err(err);
                }
                warn!(
                    "event=task_finish module=queue status=retry task_id={} attempt={} delay_ms={} error={}",
                    task.id,
                    attempt,
                    delay.as_millis(),
                    err
                );
                thread::sleep(delay);
                delay = (delay * 2).min(FINISH_RETRY_MAX);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn run_task(conn: &Connection, registry: &TaskRegistry, task: &TaskRecord) -> TaskOutput {
    let handler = registry
        .get(&task.name)
        .ok_or_else(|| TaskError::new(format!("unknown task name `{}`", task.name)))?;

    match catch_unwind(AssertUnwindSafe(|| handler(conn, &task.args))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = if let Some(message) = payload.downcast_ref::<&str>() {
                (*message).to_string()
            } else if let Some(message) = payload.downcast_ref::<String>() {
                message.clone()
            } else {
                "non-string panic payload".to_string()
            };
            let message: String = message.chars().take(MAX_PANIC_MESSAGE_CHARS).collect();
            Err(TaskError::new(format!("task panicked: {message}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{drain, run_next, WorkerConfig};
    use crate::db::open_db_in_memory;
    use crate::model::task::{ReservationKey, TaskState};
    use crate::queue::registry::{TaskError, TaskRegistry};
    use crate::queue::reservation::{SqliteTaskQueue, TaskQueue};
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry
            .register("test.echo", |_, args| Ok(args.clone()))
            .unwrap();
        registry
            .register("test.fail", |_, _| Err(TaskError::new("refused")))
            .unwrap();
        registry
            .register("test.panic", |_, _| panic!("handler exploded"))
            .unwrap();
        registry
    }

    #[test]
    fn run_next_reports_idle_queue() {
        let conn = open_db_in_memory().unwrap();
        assert!(!run_next(&conn, &registry(), "w-0").unwrap());
    }

    #[test]
    fn drain_records_results_errors_and_panics() {
        let conn = open_db_in_memory().unwrap();
        let queue = SqliteTaskQueue::new(&conn);
        let key = ReservationKey::repository(Uuid::new_v4());
        let echo = queue
            .reserve_and_run(key, "test.echo", &json!({"n": 1}))
            .unwrap();
        let fail = queue.reserve_and_run(key, "test.fail", &json!({})).unwrap();
        let panic = queue.reserve_and_run(key, "test.panic", &json!({})).unwrap();
        let unknown = queue.reserve_and_run(key, "test.nope", &json!({})).unwrap();

        assert_eq!(drain(&conn, &registry(), "w-0").unwrap(), 4);

        let echo = queue.task_status(echo.task_id).unwrap().unwrap();
        assert_eq!(echo.state, TaskState::Completed);
        assert_eq!(echo.result, Some(json!({"n": 1})));

        let fail = queue.task_status(fail.task_id).unwrap().unwrap();
        assert_eq!(fail.state, TaskState::Failed);
        assert_eq!(fail.error.as_deref(), Some("refused"));

        let panic = queue.task_status(panic.task_id).unwrap().unwrap();
        assert_eq!(panic.state, TaskState::Failed);
        assert!(panic.error.unwrap().contains("handler exploded"));

        let unknown = queue.task_status(unknown.task_id).unwrap().unwrap();
        assert!(unknown.error.unwrap().contains("unknown task name"));
        assert_eq!(queue.holder(key).unwrap(), None);
    }

    #[test]
    fn config_requires_stale_window_wider_than_heartbeat() {
        let config = WorkerConfig {
            heartbeat_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(15),
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(WorkerConfig::default().validate().is_ok());
    }
}
