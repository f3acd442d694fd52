//! User aggregate: account, roles, library grants and sharing-label preferences

use super::{cascade, load_strings, replace_strings, Repository};
use crate::core::error::Result;
use crate::db::manager::DatabaseManager;
use crate::db::models::{AgeRestriction, User};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let age: Option<i32> = row.get(4)?;
    let restriction: Option<String> = row.get(5)?;
    Ok(User {
        id: row.get(0)?,
        server_id: row.get(1)?,
        email: row.get(2)?,
        roles: Vec::new(),
        shared_all_libraries: row.get(3)?,
        shared_libraries_ids: Vec::new(),
        labels_allow: Vec::new(),
        labels_exclude: Vec::new(),
        age_restriction: age.zip(restriction).map(|(age, restriction)| AgeRestriction { age, restriction }),
    })
}

fn load_labels(conn: &Connection, user_id: &str, allow: bool) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT label FROM user_sharing_labels WHERE user_id = ? AND allow = ? ORDER BY rowid",
    )?;
    let labels = stmt
        .query_map(params![user_id, allow], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(labels)
}

pub(crate) fn read_user(conn: &Connection, id: &str) -> Result<Option<User>> {
    let user = conn
        .query_row(
            "SELECT id, server_id, email, shared_all_libraries, age_restriction, age_restriction_type \
             FROM users WHERE id = ?",
            [id],
            map_user,
        )
        .optional()?;

    let Some(mut user) = user else {
        return Ok(None);
    };
    user.roles = load_strings(conn, "user_roles", "user_id", id, "role")?;
    user.shared_libraries_ids = load_strings(conn, "user_shared_libraries", "user_id", id, "library_id")?;
    user.labels_allow = load_labels(conn, id, true)?;
    user.labels_exclude = load_labels(conn, id, false)?;
    Ok(Some(user))
}

pub(crate) fn write_user(conn: &Connection, user: &User) -> Result<()> {
    conn.execute(
        "INSERT INTO users (id, server_id, email, shared_all_libraries, age_restriction, age_restriction_type) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(id) DO UPDATE SET server_id = excluded.server_id, email = excluded.email, \
         shared_all_libraries = excluded.shared_all_libraries, \
         age_restriction = excluded.age_restriction, \
         age_restriction_type = excluded.age_restriction_type",
        params![
            user.id,
            user.server_id,
            user.email,
            user.shared_all_libraries,
            user.age_restriction.as_ref().map(|r| r.age),
            user.age_restriction.as_ref().map(|r| r.restriction.clone()),
        ],
    )?;

    replace_strings(conn, "user_roles", "user_id", &user.id, "role", &user.roles)?;
    replace_strings(
        conn,
        "user_shared_libraries",
        "user_id",
        &user.id,
        "library_id",
        &user.shared_libraries_ids,
    )?;

    conn.execute("DELETE FROM user_sharing_labels WHERE user_id = ?", [&user.id])?;
    for (labels, allow) in [(&user.labels_allow, true), (&user.labels_exclude, false)] {
        for label in labels {
            conn.execute(
                "INSERT OR IGNORE INTO user_sharing_labels (user_id, label, allow) VALUES (?, ?, ?)",
                params![user.id, label, allow],
            )?;
        }
    }
    Ok(())
}

/// Repository for User aggregates
pub struct UserRepository {
    db: Arc<DatabaseManager>,
}

impl UserRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Users known for one server
    pub async fn find_by_server(&self, server_id: &str) -> Result<Vec<User>> {
        let server_id = server_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare("SELECT id FROM users WHERE server_id = ? ORDER BY email")?;
                let ids = stmt
                    .query_map([&server_id], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let mut users = Vec::with_capacity(ids.len());
                for id in ids {
                    users.extend(read_user(conn, &id)?);
                }
                Ok(users)
            })
            .await
    }
}

#[async_trait]
impl Repository<User> for UserRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<User>> {
        let id = id.to_string();
        self.db.execute(move |conn| read_user(conn, &id)).await
    }

    async fn find_all(&self) -> Result<Vec<User>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare("SELECT id FROM users ORDER BY email")?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let mut users = Vec::with_capacity(ids.len());
                for id in ids {
                    users.extend(read_user(conn, &id)?);
                }
                Ok(users)
            })
            .await
    }

    async fn upsert(&self, user: &User) -> Result<()> {
        let user = user.clone();
        self.db.transaction(move |tx| write_user(tx, &user)).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.db.transaction(move |tx| cascade::delete_user(tx, &id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::fixtures;
    use crate::db::repository::ServerRepository;

    #[tokio::test]
    async fn test_user_roundtrip_with_children() {
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        ServerRepository::new(db.clone()).upsert(&fixtures::server()).await.unwrap();
        let repo = UserRepository::new(db);

        let mut user = fixtures::user("u1");
        user.shared_all_libraries = false;
        user.shared_libraries_ids = vec!["l1".to_string()];
        user.labels_allow = vec!["kids".to_string()];
        user.age_restriction = Some(AgeRestriction {
            age: 12,
            restriction: "ALLOW_ONLY".to_string(),
        });
        repo.upsert(&user).await.unwrap();
        assert_eq!(repo.find_by_id("u1").await.unwrap(), Some(user.clone()));

        user.roles = vec!["PAGE_STREAMING".to_string()];
        user.age_restriction = None;
        repo.upsert(&user).await.unwrap();
        assert_eq!(repo.find_by_server("srv").await.unwrap(), vec![user]);

        repo.delete("u1").await.unwrap();
        assert!(repo.find_all().await.unwrap().is_empty());
    }
}
