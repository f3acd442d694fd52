//! Thumbnails of books, series, read lists and collections

use crate::core::error::{ReplicaError, Result};
use crate::db::manager::DatabaseManager;
use crate::db::models::{Thumbnail, ThumbnailOwner};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

fn select_sql(owner: ThumbnailOwner, filter: &str) -> String {
    format!(
        "SELECT id, {}, type, selected, media_type, file_size, width, height, url, thumbnail \
         FROM {} WHERE {filter}",
        owner.owner_column(),
        owner.table()
    )
}

fn map_thumbnail(row: &rusqlite::Row<'_>) -> rusqlite::Result<Thumbnail> {
    Ok(Thumbnail {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        thumbnail_type: row.get(2)?,
        selected: row.get(3)?,
        media_type: row.get(4)?,
        file_size: row.get(5)?,
        width: row.get(6)?,
        height: row.get(7)?,
        url: row.get(8)?,
        data: row.get(9)?,
    })
}

/// Replace the thumbnail set of one owner. At most the first selected entry
/// keeps its flag.
pub(crate) fn replace_for_owner(
    conn: &Connection,
    owner: ThumbnailOwner,
    owner_id: &str,
    thumbnails: &[Thumbnail],
) -> Result<()> {
    conn.execute(
        &format!("DELETE FROM {} WHERE {} = ?", owner.table(), owner.owner_column()),
        [owner_id],
    )?;

    let mut selected_seen = false;
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO {} (id, {}, type, selected, media_type, file_size, width, height, url, thumbnail) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        owner.table(),
        owner.owner_column()
    ))?;
    for thumb in thumbnails {
        let selected = thumb.selected && !selected_seen;
        selected_seen |= selected;
        stmt.execute(params![
            thumb.id,
            owner_id,
            thumb.thumbnail_type,
            selected,
            thumb.media_type,
            thumb.file_size,
            thumb.width,
            thumb.height,
            thumb.url,
            thumb.data,
        ])?;
    }
    Ok(())
}

/// Repository for Thumbnail rows
pub struct ThumbnailRepository {
    db: Arc<DatabaseManager>,
}

impl ThumbnailRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    pub async fn replace(&self, owner: ThumbnailOwner, owner_id: &str, thumbnails: Vec<Thumbnail>) -> Result<()> {
        let owner_id = owner_id.to_string();
        self.db
            .transaction(move |tx| replace_for_owner(tx, owner, &owner_id, &thumbnails))
            .await
    }

    pub async fn list(&self, owner: ThumbnailOwner, owner_id: &str) -> Result<Vec<Thumbnail>> {
        let owner_id = owner_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&select_sql(
                    owner,
                    &format!("{} = ? ORDER BY selected DESC, id", owner.owner_column()),
                ))?;
                let thumbs = stmt
                    .query_map([&owner_id], map_thumbnail)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(thumbs)
            })
            .await
    }

    pub async fn get(&self, owner: ThumbnailOwner, id: &str) -> Result<Option<Thumbnail>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn
                    .query_row(&select_sql(owner, "id = ?"), [&id], map_thumbnail)
                    .optional()?)
            })
            .await
    }

    /// The selected thumbnail of an owner, if any
    pub async fn selected(&self, owner: ThumbnailOwner, owner_id: &str) -> Result<Option<Thumbnail>> {
        let owner_id = owner_id.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        &select_sql(owner, &format!("{} = ? AND selected = 1", owner.owner_column())),
                        [&owner_id],
                        map_thumbnail,
                    )
                    .optional()?)
            })
            .await
    }

    /// Make `id` the selected thumbnail of its owner, clearing the previous one
    pub async fn select(&self, owner: ThumbnailOwner, id: &str) -> Result<Thumbnail> {
        let id = id.to_string();
        self.db
            .transaction(move |tx| {
                let owner_id: Option<String> = tx
                    .query_row(
                        &format!("SELECT {} FROM {} WHERE id = ?", owner.owner_column(), owner.table()),
                        [&id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let owner_id = owner_id.ok_or_else(|| ReplicaError::NotFound(format!("thumbnail {id}")))?;

                tx.execute(
                    &format!(
                        "UPDATE {} SET selected = 0 WHERE {} = ? AND selected = 1",
                        owner.table(),
                        owner.owner_column()
                    ),
                    [&owner_id],
                )?;
                tx.execute(
                    &format!("UPDATE {} SET selected = 1 WHERE id = ?", owner.table()),
                    [&id],
                )?;

                Ok(tx.query_row(&select_sql(owner, "id = ?"), [&id], map_thumbnail)?)
            })
            .await
    }
}
