use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedMutexGuard, Semaphore};

use crate::db::Database;
use crate::error::PipelineResult;
use crate::models::{TaskKind, TaskRecord, TaskState};

/// One async mutex per project id, created on first use. Mutations of a
/// project's analysis or generated content take this lock so concurrent
/// requests cannot interleave their writes.
#[derive(Clone, Default)]
pub struct ProjectLocks {
    inner: Arc<Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, project_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().expect("project lock map poisoned");
            map.entry(project_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Dispatches background jobs onto a bounded worker pool and records their
/// lifecycle in the task table: Pending on submit, Running once a worker
/// picks the job up, then Completed or Failed. State is persisted, so a
/// crashed process leaves its in-flight tasks visibly stuck in Running
/// rather than silently forgotten.
#[derive(Clone)]
pub struct TaskRunner {
    db: Database,
    workers: Arc<Semaphore>,
}

impl TaskRunner {
    pub fn new(db: Database, worker_count: usize) -> Self {
        Self {
            db,
            workers: Arc::new(Semaphore::new(worker_count.max(1))),
        }
    }

    /// Fire-and-forget submission. Returns the Pending record immediately;
    /// the job itself runs once a worker permit is free.
    pub async fn submit<F, Fut>(
        &self,
        project_id: i64,
        kind: TaskKind,
        job: F,
    ) -> PipelineResult<TaskRecord>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = PipelineResult<serde_json::Value>> + Send,
    {
        let task = self.db.create_task(project_id, kind).await?;

        let db = self.db.clone();
        let workers = self.workers.clone();
        let task_id = task.id;
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };

            record_state(&db, task_id, TaskState::Running, 0.1, None, None).await;

            match job().await {
                Ok(result) => {
                    record_state(
                        &db,
                        task_id,
                        TaskState::Completed,
                        1.0,
                        Some(result.to_string()),
                        None,
                    )
                    .await;
                }
                Err(err) => {
                    tracing::error!("background task failed | task_id={task_id} | {err}");
                    record_state(
                        &db,
                        task_id,
                        TaskState::Failed,
                        1.0,
                        None,
                        Some(err.to_string()),
                    )
                    .await;
                }
            }
        });

        Ok(task)
    }
}

async fn record_state(
    db: &Database,
    task_id: i64,
    state: TaskState,
    progress: f64,
    result_json: Option<String>,
    error_message: Option<String>,
) {
    if let Err(err) = db
        .update_task(
            task_id,
            state,
            progress,
            result_json.as_deref(),
            error_message.as_deref(),
        )
        .await
    {
        tracing::error!("failed to record task state | task_id={task_id} | {err:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use serde_json::json;
    use std::time::Duration;

    async fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let dsn = format!("sqlite://{}", dir.path().join("tasks.db").display());
        let db = Database::connect(&dsn).await.unwrap();
        (dir, db)
    }

    async fn wait_terminal(db: &Database, task_id: i64) -> TaskRecord {
        for _ in 0..200 {
            let task = db.get_task(task_id).await.unwrap().unwrap();
            if task.state.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn successful_job_completes_with_result() {
        let (_dir, db) = test_db().await;
        let runner = TaskRunner::new(db.clone(), 2);
        let project = db.create_project("p", None).await.unwrap();

        let task = runner
            .submit(project.id, TaskKind::Ingest, || async {
                Ok(json!({"chunks": 3}))
            })
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Pending);

        let done = wait_terminal(&db, task.id).await;
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.result_json.as_deref(), Some(r#"{"chunks":3}"#));
        assert!(done.error_message.is_none());
    }

    #[tokio::test]
    async fn failed_job_lands_in_failed_state() {
        let (_dir, db) = test_db().await;
        let runner = TaskRunner::new(db.clone(), 1);
        let project = db.create_project("p", None).await.unwrap();

        let task = runner
            .submit(project.id, TaskKind::Generation, || async {
                Err(PipelineError::Validation("缺少前置分析".to_string()))
            })
            .await
            .unwrap();

        let done = wait_terminal(&db, task.id).await;
        assert_eq!(done.state, TaskState::Failed);
        assert!(done.error_message.as_deref().unwrap().contains("缺少前置分析"));
        assert!(done.result_json.is_none());
    }

    #[tokio::test]
    async fn project_lock_serializes_holders() {
        let locks = ProjectLocks::new();
        let guard = locks.acquire(7).await;

        // A second acquire on the same project must block while the first
        // guard is held; a different project is independent.
        let locks2 = locks.clone();
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), locks2.acquire(7)).await;
        assert!(blocked.is_err());

        let _other = locks.acquire(8).await;
        drop(guard);
        let reacquired =
            tokio::time::timeout(Duration::from_millis(500), locks.acquire(7)).await;
        assert!(reacquired.is_ok());
    }
}
