//! User record operations.

use super::{Database, from_ms, is_unique_violation, now_ms};
use crate::store::{StoreError, StoreResult};
use crate::types::{NewUser, User};
use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

fn parse_user_row(row: &Row) -> rusqlite::Result<User> {
    let role: String = row.get("role")?;
    Ok(User {
        id: row.get("id")?,
        email: row.get("email")?,
        password_hash: row.get("password_hash")?,
        name: row.get("name")?,
        role: role.parse().unwrap_or_default(),
        created_at: from_ms(row.get("created_at")?),
    })
}

impl Database {
    /// Insert a user. Returns `StoreError::Conflict` when the email is taken.
    pub fn insert_user(&self, user: &NewUser) -> StoreResult<User> {
        let id = Uuid::now_v7().to_string();
        let now = now_ms();

        let result: rusqlite::Result<usize> = self.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT INTO users (id, email, password_hash, name, role, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    &id,
                    &user.email,
                    &user.password_hash,
                    &user.name,
                    user.role.as_str(),
                    now
                ],
            ))
        })?;

        match result {
            Ok(_) => Ok(User {
                id,
                email: user.email.clone(),
                password_hash: user.password_hash.clone(),
                name: user.name.clone(),
                role: user.role,
                created_at: from_ms(now),
            }),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::Conflict("Email already exists".into()))
            }
            Err(e) => Err(StoreError::Backend(e.into())),
        }
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM users WHERE email = ?1",
                    params![email],
                    parse_user_row,
                )
                .optional()?)
        })
    }

    pub fn find_user_by_id(&self, user_id: &str) -> Result<Option<User>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM users WHERE id = ?1",
                    params![user_id],
                    parse_user_row,
                )
                .optional()?)
        })
    }

    pub fn count_users(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
        })
    }
}
