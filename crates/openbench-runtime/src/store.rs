//! Storage collaborator for test cases, batches and task records.
//!
//! The orchestrator only needs create/read/update; a database-backed store
//! implements [`EvaluationStore`] outside this crate. [`InMemoryStore`]
//! serves the CLI and tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

use openbench_core::{Batch, BatchId, EvaluationTask, TaskId, TestCase};

/// Errors from a store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Persistence for evaluation records.
#[async_trait]
pub trait EvaluationStore: Send + Sync {
    /// Insert or replace a test case.
    async fn put_test_case(&self, test_case: TestCase) -> Result<(), StoreError>;

    async fn get_test_case(&self, id: &str) -> Result<TestCase, StoreError>;

    async fn create_batch(&self, batch: &Batch) -> Result<(), StoreError>;

    async fn update_batch(&self, batch: &Batch) -> Result<(), StoreError>;

    async fn get_batch(&self, id: BatchId) -> Result<Batch, StoreError>;

    async fn create_task(&self, task: &EvaluationTask) -> Result<(), StoreError>;

    async fn update_task(&self, task: &EvaluationTask) -> Result<(), StoreError>;

    /// Tasks of a batch in creation order.
    async fn list_tasks(&self, batch_id: BatchId) -> Result<Vec<EvaluationTask>, StoreError>;
}

#[derive(Default)]
struct Tables {
    test_cases: HashMap<String, TestCase>,
    batches: HashMap<BatchId, Batch>,
    tasks: HashMap<TaskId, EvaluationTask>,
    /// Task ids per batch in creation order
    batch_tasks: HashMap<BatchId, Vec<TaskId>>,
}

/// Process-local store.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("InMemoryStore")
            .field("test_cases", &tables.test_cases.len())
            .field("batches", &tables.batches.len())
            .field("tasks", &tables.tasks.len())
            .finish()
    }
}

#[async_trait]
impl EvaluationStore for InMemoryStore {
    async fn put_test_case(&self, test_case: TestCase) -> Result<(), StoreError> {
        self.tables
            .write()
            .test_cases
            .insert(test_case.id.clone(), test_case);
        Ok(())
    }

    async fn get_test_case(&self, id: &str) -> Result<TestCase, StoreError> {
        self.tables
            .read()
            .test_cases
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("test case", id))
    }

    async fn create_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.batches.contains_key(&batch.id) {
            return Err(StoreError::AlreadyExists {
                kind: "batch",
                id: batch.id.to_string(),
            });
        }
        tables.batches.insert(batch.id, batch.clone());
        tables.batch_tasks.entry(batch.id).or_default();
        Ok(())
    }

    async fn update_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let slot = tables
            .batches
            .get_mut(&batch.id)
            .ok_or_else(|| StoreError::not_found("batch", batch.id))?;
        *slot = batch.clone();
        Ok(())
    }

    async fn get_batch(&self, id: BatchId) -> Result<Batch, StoreError> {
        self.tables
            .read()
            .batches
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("batch", id))
    }

    async fn create_task(&self, task: &EvaluationTask) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.batches.contains_key(&task.batch_id) {
            return Err(StoreError::not_found("batch", task.batch_id));
        }
        if tables.tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists {
                kind: "task",
                id: task.id.to_string(),
            });
        }
        tables.tasks.insert(task.id, task.clone());
        tables
            .batch_tasks
            .entry(task.batch_id)
            .or_default()
            .push(task.id);
        Ok(())
    }

    async fn update_task(&self, task: &EvaluationTask) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let slot = tables
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| StoreError::not_found("task", task.id))?;
        *slot = task.clone();
        Ok(())
    }

    async fn list_tasks(&self, batch_id: BatchId) -> Result<Vec<EvaluationTask>, StoreError> {
        let tables = self.tables.read();
        let ids = tables
            .batch_tasks
            .get(&batch_id)
            .ok_or_else(|| StoreError::not_found("batch", batch_id))?;
        Ok(ids
            .iter()
            .filter_map(|id| tables.tasks.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openbench_core::TaskStatus;
    use serde_json::json;

    #[tokio::test]
    async fn test_test_case_roundtrip() {
        let store = InMemoryStore::new();
        store
            .put_test_case(TestCase::new("t1", "Title", "Prompt", json!({"a": 1})))
            .await
            .unwrap();
        assert_eq!(store.get_test_case("t1").await.unwrap().title, "Title");

        let err = store.get_test_case("t2").await.unwrap_err();
        assert_eq!(err.to_string(), "test case 't2' not found");
    }

    #[tokio::test]
    async fn test_tasks_listed_in_creation_order() {
        let store = InMemoryStore::new();
        let batch = Batch::new("t1", vec!["m1".to_string(), "m2".to_string()]);
        store.create_batch(&batch).await.unwrap();

        let first = EvaluationTask::new(batch.id, "m1");
        let mut second = EvaluationTask::new(batch.id, "m2");
        store.create_task(&first).await.unwrap();
        store.create_task(&second).await.unwrap();

        second.start();
        store.update_task(&second).await.unwrap();

        let tasks = store.list_tasks(batch.id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].model_id, "m1");
        assert_eq!(tasks[1].status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_task_requires_batch() {
        let store = InMemoryStore::new();
        let task = EvaluationTask::new(uuid::Uuid::new_v4(), "m1");
        assert!(matches!(
            store.create_task(&task).await,
            Err(StoreError::NotFound { kind: "batch", .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_batch_rejected() {
        let store = InMemoryStore::new();
        let batch = Batch::new("t1", vec!["m1".to_string()]);
        store.create_batch(&batch).await.unwrap();
        assert!(matches!(
            store.create_batch(&batch).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }
}
