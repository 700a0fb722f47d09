//! Task CRUD operations.

use super::{Database, from_ms, is_unique_violation, now_ms};
use crate::store::{StoreError, StoreResult, TaskStore};
use crate::types::{NewTask, Task, TaskFilter, TaskPatch, TaskStatus};
use anyhow::Result;
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Row, TransactionBehavior, params, params_from_iter};
use uuid::Uuid;

const DUPLICATE_TASK: &str = "Task already exists";

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    let completed_at: Option<i64> = row.get("completed_at")?;

    Ok(Task {
        id: row.get("id")?,
        owner_id: row.get("user_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status: status.parse().unwrap_or_default(),
        created_at: from_ms(row.get("created_at")?),
        updated_at: from_ms(row.get("updated_at")?),
        completed_at: completed_at.map(from_ms),
    })
}

/// Build a WHERE clause from the filter's populated fields.
fn where_clause(filter: &TaskFilter) -> (String, Vec<SqlValue>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    if let Some(ref id) = filter.id {
        clauses.push("id = ?");
        values.push(SqlValue::Text(id.clone()));
    }
    if let Some(ref owner) = filter.owner_id {
        clauses.push("user_id = ?");
        values.push(SqlValue::Text(owner.clone()));
    }
    if let Some(ref title) = filter.title {
        clauses.push("title = ?");
        values.push(SqlValue::Text(title.clone()));
    }
    if let Some(status) = filter.status {
        clauses.push("status = ?");
        values.push(SqlValue::Text(status.as_str().to_string()));
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), values)
    }
}

fn select_tasks(conn: &Connection, filter: &TaskFilter, limit: Option<u32>) -> Result<Vec<Task>> {
    let (clause, values) = where_clause(filter);
    let mut sql = format!("SELECT * FROM tasks{} ORDER BY created_at ASC, id ASC", clause);
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    let mut stmt = conn.prepare(&sql)?;
    let tasks = stmt
        .query_map(params_from_iter(values), parse_task_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tasks)
}

fn get_task_internal(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    let mut tasks = select_tasks(conn, &TaskFilter::by_id(task_id), Some(1))?;
    Ok(tasks.pop())
}

impl Database {
    /// Insert a task. Returns `StoreError::Conflict` when the owner already has
    /// a task with the same title.
    pub fn insert_task(&self, task: &NewTask) -> StoreResult<String> {
        let id = Uuid::now_v7().to_string();
        let now = now_ms();

        let result: rusqlite::Result<usize> = self.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT INTO tasks (id, user_id, title, description, status, created_at, updated_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)",
                params![
                    &id,
                    &task.owner_id,
                    &task.title,
                    &task.description,
                    task.status.as_str(),
                    now,
                    (task.status == TaskStatus::Completed).then_some(now),
                ],
            ))
        })?;

        match result {
            Ok(_) => Ok(id),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(DUPLICATE_TASK.into())),
            Err(e) => Err(StoreError::Backend(e.into())),
        }
    }

    /// List tasks matching a filter, oldest first.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.with_conn(|conn| select_tasks(conn, filter, None))
    }

    /// Get the first task matching a filter.
    pub fn get_task(&self, filter: &TaskFilter) -> Result<Option<Task>> {
        self.with_conn(|conn| Ok(select_tasks(conn, filter, Some(1))?.pop()))
    }

    /// Apply a partial update to the first matching task.
    ///
    /// Lookup and write happen inside one transaction. Setting `completed`
    /// keeps an existing `completed_at`, so repeating it is harmless.
    pub fn patch_task(&self, filter: &TaskFilter, patch: &TaskPatch) -> StoreResult<Option<Task>> {
        let now = now_ms();

        let result: rusqlite::Result<Option<Task>> = self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(target) = select_tasks(&tx, filter, Some(1))?.pop() else {
                return Ok(Ok(None));
            };
            if patch.is_empty() {
                return Ok(Ok(Some(target)));
            }

            let mut sets = vec!["updated_at = ?".to_string()];
            let mut values = vec![SqlValue::Integer(now)];

            if let Some(ref title) = patch.title {
                sets.push("title = ?".into());
                values.push(SqlValue::Text(title.clone()));
            }
            if let Some(ref description) = patch.description {
                sets.push("description = ?".into());
                values.push(SqlValue::Text(description.clone()));
            }
            if let Some(status) = patch.status {
                sets.push("status = ?".into());
                values.push(SqlValue::Text(status.as_str().to_string()));
                if status == TaskStatus::Completed {
                    sets.push("completed_at = COALESCE(completed_at, ?)".into());
                    values.push(SqlValue::Integer(now));
                } else {
                    sets.push("completed_at = NULL".into());
                }
            }
            values.push(SqlValue::Text(target.id.clone()));

            let sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
            if let Err(e) = tx.execute(&sql, params_from_iter(values)) {
                return Ok(Err(e));
            }

            let updated = get_task_internal(&tx, &target.id)?;
            tx.commit()?;
            Ok(Ok(updated))
        })?;

        match result {
            Ok(task) => Ok(task),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(DUPLICATE_TASK.into())),
            Err(e) => Err(StoreError::Backend(e.into())),
        }
    }

    /// Delete the first task matching a filter.
    pub fn remove_task(&self, filter: &TaskFilter) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(target) = select_tasks(&tx, filter, Some(1))?.pop() else {
                return Ok(false);
            };
            let deleted = tx.execute("DELETE FROM tasks WHERE id = ?1", params![target.id])?;
            tx.commit()?;
            Ok(deleted > 0)
        })
    }
}

#[async_trait]
impl TaskStore for Database {
    async fn insert(&self, task: NewTask) -> StoreResult<String> {
        self.insert_task(&task)
    }

    async fn find_one(&self, filter: &TaskFilter) -> StoreResult<Option<Task>> {
        Ok(self.get_task(filter)?)
    }

    async fn find_many(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>> {
        Ok(self.list_tasks(filter)?)
    }

    async fn update_one(&self, filter: &TaskFilter, patch: &TaskPatch) -> StoreResult<Option<Task>> {
        self.patch_task(filter, patch)
    }

    async fn delete_one(&self, filter: &TaskFilter) -> StoreResult<bool> {
        Ok(self.remove_task(filter)?)
    }
}
