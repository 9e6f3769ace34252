//! SQLite-backed catalog store.
//!
//! One `courses` table; each category's rank lives in its own nullable
//! INTEGER column, added on open if missing. Column names come only from
//! validated [`RankColumn`]s.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Semaphore;

use super::{CatalogStore, Item, RankedItem, StoreError};
use crate::category::{Category, CategoryRegistry, RankColumn};

const ITEM_COLUMNS: &str = "id, title, description, key_skills, provider, primary_tag";

#[derive(Clone)]
pub struct SqliteCatalogStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    /// One blocking task at a time waits on the connection mutex.
    sem: Arc<Semaphore>,
}

impl SqliteCatalogStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA busy_timeout=5000;\
             CREATE TABLE IF NOT EXISTS courses (\
               id TEXT PRIMARY KEY,\
               title TEXT NOT NULL,\
               description TEXT,\
               key_skills TEXT NOT NULL DEFAULT '[]',\
               provider TEXT,\
               primary_tag TEXT,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL\
             );",
        )?;
        for column in CategoryRegistry::global().columns() {
            ensure_rank_column(&conn, column)?;
        }

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("RANKER_DB_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".catalog_ranker.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Advisory cross-process lock for writes to one category's rank column.
    pub fn lock_category(&self, category: Category) -> Result<CategoryLock, StoreError> {
        CategoryLock::new(&self.path, category.rank_column())
    }

    /// Recover from mutex poisoning; the connection itself is still usable.
    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    async fn run_blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        let _permit = self
            .sem
            .acquire()
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?;
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Insert or update items by id. Existing ranks are left untouched.
    pub async fn upsert_items(&self, items: Vec<Item>) -> Result<usize, StoreError> {
        self.run_blocking(move |conn| {
            let now = now_epoch();
            let mut written = 0usize;
            for item in &items {
                let key_skills = serde_json::to_string(&item.key_skills)?;
                written += conn.execute(
                    "INSERT INTO courses (id, title, description, key_skills, provider, primary_tag, \
                     created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7) \
                     ON CONFLICT(id) DO UPDATE SET \
                        title = excluded.title, \
                        description = excluded.description, \
                        key_skills = excluded.key_skills, \
                        provider = excluded.provider, \
                        primary_tag = excluded.primary_tag, \
                        updated_at = excluded.updated_at",
                    params![
                        item.id,
                        item.title,
                        item.description,
                        key_skills,
                        item.provider,
                        item.primary_tag,
                        now,
                    ],
                )?;
            }
            Ok(written)
        })
        .await
    }

    /// Load a JSON array of items from disk and upsert it.
    pub async fn import_json(&self, path: impl AsRef<Path>) -> Result<usize, StoreError> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let items: Vec<Item> = serde_json::from_str(&raw)?;
        self.upsert_items(items).await
    }
}

fn ensure_rank_column(conn: &Connection, column: &RankColumn) -> Result<(), StoreError> {
    let exists = {
        let mut stmt = conn.prepare("PRAGMA table_info(courses)")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        names.iter().any(|name| name == column.as_str())
    };
    if exists {
        return Ok(());
    }
    conn.execute(
        &format!("ALTER TABLE courses ADD COLUMN {column} INTEGER"),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS idx_courses_{column} ON courses({column})"),
        [],
    )?;
    Ok(())
}

/// Raw row, before `key_skills` is decoded.
struct ItemRow {
    id: String,
    title: String,
    description: Option<String>,
    key_skills: String,
    provider: Option<String>,
    primary_tag: Option<String>,
}

impl ItemRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            key_skills: row.get(3)?,
            provider: row.get(4)?,
            primary_tag: row.get(5)?,
        })
    }

    fn into_item(self) -> Result<Item, StoreError> {
        Ok(Item {
            id: self.id,
            title: self.title,
            description: self.description,
            key_skills: serde_json::from_str(&self.key_skills)?,
            provider: self.provider,
            primary_tag: self.primary_tag,
        })
    }
}

#[async_trait]
impl CatalogStore for SqliteCatalogStore {
    async fn select_all(&self) -> Result<Vec<Item>, StoreError> {
        self.run_blocking(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {ITEM_COLUMNS} FROM courses ORDER BY rowid ASC"))?;
            let rows = stmt
                .query_map([], ItemRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(ItemRow::into_item).collect()
        })
        .await
    }

    async fn select_ranked(
        &self,
        column: &RankColumn,
        exclude_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<RankedItem>, StoreError> {
        let column = column.clone();
        let exclude_id = exclude_id.map(str::to_string);
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.run_blocking(move |conn| {
            let sql = format!(
                "SELECT {ITEM_COLUMNS}, {column} FROM courses \
                 WHERE {column} IS NOT NULL AND (?1 IS NULL OR id <> ?1) \
                 ORDER BY {column} ASC, rowid ASC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![exclude_id, limit], |row| {
                    Ok((ItemRow::read(row)?, row.get::<_, u32>(6)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(raw, rank)| {
                    Ok(RankedItem {
                        item: raw.into_item()?,
                        rank,
                    })
                })
                .collect()
        })
        .await
    }

    async fn select_unranked(&self, column: &RankColumn) -> Result<Vec<Item>, StoreError> {
        let column = column.clone();
        self.run_blocking(move |conn| {
            let sql = format!(
                "SELECT {ITEM_COLUMNS} FROM courses WHERE {column} IS NULL ORDER BY rowid ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], ItemRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(ItemRow::into_item).collect()
        })
        .await
    }

    async fn get_item(&self, id: &str) -> Result<Option<Item>, StoreError> {
        let id = id.to_string();
        self.run_blocking(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {ITEM_COLUMNS} FROM courses WHERE id = ?1"),
                    params![id],
                    ItemRow::read,
                )
                .optional()?;
            raw.map(ItemRow::into_item).transpose()
        })
        .await
    }

    async fn update_rank(
        &self,
        item_id: &str,
        column: &RankColumn,
        rank: u32,
    ) -> Result<(), StoreError> {
        let item_id = item_id.to_string();
        let column = column.clone();
        self.run_blocking(move |conn| {
            let rows = conn.execute(
                &format!("UPDATE courses SET {column} = ?1, updated_at = ?2 WHERE id = ?3"),
                params![rank, now_epoch(), item_id],
            )?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("course {item_id}")));
            }
            Ok(())
        })
        .await
    }
}

/// Exclusive file lock next to the database, one per rank column.
#[derive(Debug)]
pub struct CategoryLock {
    _file: std::fs::File,
}

impl CategoryLock {
    fn new(db_path: &Path, column: &RankColumn) -> Result<Self, StoreError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension(format!("{column}.lock"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
