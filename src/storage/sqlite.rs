//! SqliteStore — on-device `RecordStore` backed by bundled SQLite.
//!
//! Timestamps are stored as RFC 3339 text with nanosecond precision so a
//! record read back compares equal to the one written. Calls are synchronous
//! under the connection lock; they are fast enough for single-user data.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use crate::error::{StoreError, StoreResult};
use crate::types::{ItemRecord, ListRecord, RecordKind};

use super::traits::RecordStore;

const SCHEMA_VERSION: i32 = 1;

const META_LAST_MODIFIED: &str = "__last_modified";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS lists (
    id          TEXT PRIMARY KEY NOT NULL,
    owner_id    TEXT NOT NULL,
    title       TEXT NOT NULL,
    description TEXT,
    list_type   TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    deleted     INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS items (
    id           TEXT PRIMARY KEY NOT NULL,
    list_id      TEXT NOT NULL,
    title        TEXT NOT NULL,
    description  TEXT,
    category     TEXT,
    rank         REAL NOT NULL DEFAULT 0,
    completed    INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    completed_at TEXT,
    deleted_at   TEXT
);
CREATE INDEX IF NOT EXISTS idx_items_list_id ON items(list_id);
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

const LIST_COLUMNS: &str =
    "id, owner_id, title, description, list_type, created_at, updated_at, deleted";

const ITEM_COLUMNS: &str =
    "id, list_id, title, description, category, rank, completed, created_at, completed_at, deleted_at";

// ============================================================================
// Row mapping
// ============================================================================

fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn ts_from_sql(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn opt_ts_from_sql(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| ts_from_sql(idx, &s)).transpose()
}

fn list_from_row(row: &Row<'_>) -> rusqlite::Result<ListRecord> {
    Ok(ListRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        list_type: row.get(4)?,
        created_at: ts_from_sql(5, &row.get::<_, String>(5)?)?,
        updated_at: ts_from_sql(6, &row.get::<_, String>(6)?)?,
        deleted: row.get(7)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<ItemRecord> {
    Ok(ItemRecord {
        id: row.get(0)?,
        list_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        category: row.get(4)?,
        rank: row.get(5)?,
        completed: row.get(6)?,
        created_at: ts_from_sql(7, &row.get::<_, String>(7)?)?,
        completed_at: opt_ts_from_sql(8, row.get(8)?)?,
        deleted_at: opt_ts_from_sql(9, row.get(9)?)?,
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

fn touch(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![META_LAST_MODIFIED, ts_to_sql(&Utc::now())],
    )?;
    Ok(())
}

// ============================================================================
// SqliteStore
// ============================================================================

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(StoreError::Invalid(format!(
                "database schema version {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tracing::debug!(schema_version = SCHEMA_VERSION, "sqlite store ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn write_list(conn: &Connection, list: &ListRecord, upsert: bool) -> rusqlite::Result<usize> {
        let sql = if upsert {
            "INSERT INTO lists (id, owner_id, title, description, list_type, created_at, updated_at, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id, title = excluded.title,
                description = excluded.description, list_type = excluded.list_type,
                created_at = excluded.created_at, updated_at = excluded.updated_at,
                deleted = excluded.deleted"
        } else {
            "INSERT INTO lists (id, owner_id, title, description, list_type, created_at, updated_at, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        };
        conn.execute(
            sql,
            params![
                list.id,
                list.owner_id,
                list.title,
                list.description,
                list.list_type,
                ts_to_sql(&list.created_at),
                ts_to_sql(&list.updated_at),
                list.deleted,
            ],
        )
    }

    fn write_item(conn: &Connection, item: &ItemRecord, upsert: bool) -> rusqlite::Result<usize> {
        let sql = if upsert {
            "INSERT INTO items (id, list_id, title, description, category, rank, completed, created_at, completed_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title, description = excluded.description,
                category = excluded.category, rank = excluded.rank,
                completed = excluded.completed, created_at = excluded.created_at,
                completed_at = excluded.completed_at, deleted_at = excluded.deleted_at"
        } else {
            "INSERT INTO items (id, list_id, title, description, category, rank, completed, created_at, completed_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
        };
        conn.execute(
            sql,
            params![
                item.id,
                item.list_id,
                item.title,
                item.description,
                item.category,
                item.rank,
                item.completed,
                ts_to_sql(&item.created_at),
                item.completed_at.as_ref().map(ts_to_sql),
                item.deleted_at.as_ref().map(ts_to_sql),
            ],
        )
    }

    fn item_parent(conn: &Connection, id: &str) -> rusqlite::Result<Option<String>> {
        conn.query_row("SELECT list_id FROM items WHERE id = ?1", [id], |r| r.get(0))
            .optional()
    }
}

fn reparent_error(id: &str, from: &str, to: &str) -> StoreError {
    StoreError::Invalid(format!("item {id} cannot move from list {from} to {to}"))
}

#[async_trait]
impl RecordStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_all_lists(&self) -> StoreResult<Vec<ListRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {LIST_COLUMNS} FROM lists ORDER BY id"))?;
        let rows = stmt.query_map([], list_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn get_list(&self, id: &str) -> StoreResult<Option<ListRecord>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {LIST_COLUMNS} FROM lists WHERE id = ?1"),
                [id],
                list_from_row,
            )
            .optional()?)
    }

    async fn save_list(&self, list: &ListRecord) -> StoreResult<()> {
        let conn = self.conn.lock();
        match Self::write_list(&conn, list, false) {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(StoreError::AlreadyExists {
                    kind: RecordKind::List,
                    id: list.id.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        }
        touch(&conn)?;
        Ok(())
    }

    async fn update_list(&self, list: &ListRecord) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE lists SET owner_id = ?2, title = ?3, description = ?4, list_type = ?5,
                created_at = ?6, updated_at = ?7, deleted = ?8
             WHERE id = ?1",
            params![
                list.id,
                list.owner_id,
                list.title,
                list.description,
                list.list_type,
                ts_to_sql(&list.created_at),
                ts_to_sql(&list.updated_at),
                list.deleted,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: RecordKind::List,
                id: list.id.clone(),
            });
        }
        touch(&conn)?;
        Ok(())
    }

    async fn delete_list(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        if conn.execute("DELETE FROM lists WHERE id = ?1", [id])? > 0 {
            touch(&conn)?;
        }
        Ok(())
    }

    async fn get_all_items(&self) -> StoreResult<Vec<ItemRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {ITEM_COLUMNS} FROM items ORDER BY id"))?;
        let rows = stmt.query_map([], item_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn get_items_by_list(&self, list_id: &str) -> StoreResult<Vec<ItemRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE list_id = ?1 ORDER BY rank DESC, id"
        ))?;
        let rows = stmt.query_map([list_id], item_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn get_item(&self, id: &str) -> StoreResult<Option<ItemRecord>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"),
                [id],
                item_from_row,
            )
            .optional()?)
    }

    async fn save_item(&self, item: &ItemRecord) -> StoreResult<()> {
        let conn = self.conn.lock();
        match Self::write_item(&conn, item, false) {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(StoreError::AlreadyExists {
                    kind: RecordKind::Item,
                    id: item.id.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        }
        touch(&conn)?;
        Ok(())
    }

    async fn update_item(&self, item: &ItemRecord) -> StoreResult<()> {
        let conn = self.conn.lock();
        match Self::item_parent(&conn, &item.id)? {
            None => {
                return Err(StoreError::NotFound {
                    kind: RecordKind::Item,
                    id: item.id.clone(),
                })
            }
            Some(parent) if parent != item.list_id => {
                return Err(reparent_error(&item.id, &parent, &item.list_id))
            }
            Some(_) => {}
        }
        Self::write_item(&conn, item, true)?;
        touch(&conn)?;
        Ok(())
    }

    async fn delete_item(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        if conn.execute("DELETE FROM items WHERE id = ?1", [id])? > 0 {
            touch(&conn)?;
        }
        Ok(())
    }

    async fn is_available(&self) -> bool {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0)).is_ok()
    }

    async fn last_modified(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let raw = self.get_meta(META_LAST_MODIFIED).await?;
        raw.map(|s| ts_from_sql(0, &s).map_err(StoreError::from))
            .transpose()
    }

    async fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row("SELECT value FROM meta WHERE key = ?1", [key], |r| r.get(0))
            .optional()?)
    }

    async fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    async fn remove_meta(&self, key: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM meta WHERE key = ?1", [key])?;
        Ok(())
    }

    async fn upsert_list(&self, list: &ListRecord) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let existed = conn
            .query_row("SELECT 1 FROM lists WHERE id = ?1", [&list.id], |_| Ok(()))
            .optional()?
            .is_some();
        Self::write_list(&conn, list, true)?;
        touch(&conn)?;
        Ok(existed)
    }

    async fn upsert_item(&self, item: &ItemRecord) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let parent = Self::item_parent(&conn, &item.id)?;
        if let Some(ref parent) = parent {
            if parent != &item.list_id {
                return Err(reparent_error(&item.id, parent, &item.list_id));
            }
        }
        Self::write_item(&conn, item, true)?;
        touch(&conn)?;
        Ok(parent.is_some())
    }
}
