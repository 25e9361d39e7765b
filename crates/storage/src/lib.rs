use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite, Transaction,
};
use thiserror::Error;
use tokio::sync::broadcast;

use shared::{
    domain::Collection,
    models::{Document, Record},
    query::ListQuery,
};

mod sql;

pub use sql::validate_query;

const CHANGE_CHANNEL_CAPACITY: usize = 256;
const RESERVED_KEYS: [&str; 3] = ["id", "createdAt", "updatedAt"];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{collection} record '{id}' not found")]
    NotFound { collection: Collection, id: String },
    #[error("{0}")]
    Validation(String),
    #[error("transaction failed: {0}")]
    Transaction(#[source] sqlx::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("document encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Published after a transaction that wrote to `collection` commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub collection: Collection,
    /// Ids of the records written. `None` when the whole collection was
    /// cleared or the receiver fell behind.
    pub ids: Option<Arc<[String]>>,
}

impl ChangeNotice {
    pub fn touches(&self, id: &str) -> bool {
        self.ids
            .as_ref()
            .map_or(true, |ids| ids.iter().any(|touched| touched == id))
    }
}

type Touched = BTreeMap<Collection, Option<BTreeSet<String>>>;

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<ChangeNotice>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // A single long-lived connection keeps `sqlite::memory:` databases alive
        // and serializes writers.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self { pool, changes })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    /// Opens a transaction. Never call other `Storage` methods while holding
    /// one: the pool has a single connection.
    pub async fn begin(&self) -> Result<StorageTx> {
        let tx = self.pool.begin().await.map_err(StorageError::Transaction)?;
        Ok(StorageTx {
            tx,
            touched: Touched::new(),
            changes: self.changes.clone(),
        })
    }

    /// Subscribes to committed changes of the given collections.
    pub fn watch(&self, collections: &[Collection]) -> ChangeFeed {
        ChangeFeed {
            receiver: self.changes.subscribe(),
            collections: collections.to_vec(),
        }
    }

    /// Deletes every document of every collection.
    pub async fn reset(&self) -> Result<()> {
        let mut tx = self.begin().await?;
        for collection in Collection::ALL {
            tx.clear(collection).await?;
        }
        tx.commit().await
    }
}

/// A multi-collection unit of work. Dropping it without [`StorageTx::commit`]
/// rolls every write back.
pub struct StorageTx {
    tx: Transaction<'static, Sqlite>,
    touched: Touched,
    changes: broadcast::Sender<ChangeNotice>,
}

impl StorageTx {
    pub async fn insert<D: Document>(&mut self, data: D) -> Result<Record<D>> {
        let now = now_millis();
        let record = Record {
            id: D::Id::from(uuid::Uuid::new_v4()),
            created_at: now,
            updated_at: now,
            data,
        };
        let body = serde_json::to_string(&record)?;

        sqlx::query(&format!(
            "INSERT INTO {} (id, body) VALUES (?1, ?2)",
            D::COLLECTION.as_str()
        ))
        .bind(record.id.to_string())
        .bind(body)
        .execute(&mut *self.tx)
        .await?;

        self.touch(D::COLLECTION, Some(record.id.to_string()));
        Ok(record)
    }

    pub async fn fetch<D: Document>(&mut self, id: D::Id) -> Result<Option<Record<D>>> {
        let row = sqlx::query(&format!(
            "SELECT body FROM {} WHERE id = ?1",
            D::COLLECTION.as_str()
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(|row| decode_row::<Record<D>>(&row)).transpose()
    }

    pub async fn require<D: Document>(&mut self, id: D::Id) -> Result<Record<D>> {
        self.fetch::<D>(id)
            .await?
            .ok_or_else(|| not_found::<D>(&id))
    }

    /// Loads the given ids in input order. Missing ids are skipped, repeated
    /// ids are returned once.
    pub async fn fetch_many<D: Document>(&mut self, ids: &[D::Id]) -> Result<Vec<Record<D>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT body FROM {} WHERE id IN ({})",
            D::COLLECTION.as_str(),
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.to_string());
        }
        let rows = query.fetch_all(&mut *self.tx).await?;

        let mut by_id = HashMap::with_capacity(rows.len());
        for row in &rows {
            let record = decode_row::<Record<D>>(row)?;
            by_id.insert(record.id, record);
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    pub async fn query<D: Document>(&mut self, query: &ListQuery) -> Result<Vec<Record<D>>> {
        let plan = sql::select_plan(D::COLLECTION, query)?;
        let mut statement = sqlx::query(&plan.sql);
        for value in plan.binds {
            statement = value.bind_to(statement);
        }
        let rows = statement.fetch_all(&mut *self.tx).await?;
        rows.iter().map(decode_row::<Record<D>>).collect()
    }

    /// Shallow-merges `patch` into the stored document. Identity and
    /// timestamp keys in the patch are ignored; `updatedAt` is restamped.
    pub async fn update<D: Document>(
        &mut self,
        id: D::Id,
        patch: Map<String, Value>,
    ) -> Result<Record<D>> {
        let row = sqlx::query(&format!(
            "SELECT body FROM {} WHERE id = ?1",
            D::COLLECTION.as_str()
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| not_found::<D>(&id))?;

        let mut body = match decode_row::<Value>(&row)? {
            Value::Object(body) => body,
            _ => {
                return Err(StorageError::Validation(format!(
                    "{} document '{id}' is not an object",
                    D::COLLECTION
                )))
            }
        };
        for (key, value) in patch {
            if !RESERVED_KEYS.contains(&key.as_str()) {
                body.insert(key, value);
            }
        }

        let mut record: Record<D> = serde_json::from_value(Value::Object(body))
            .map_err(|error| StorageError::Validation(format!("invalid update: {error}")))?;
        self.save(&mut record).await?;
        Ok(record)
    }

    /// Writes a whole record back, restamping `updatedAt`.
    pub async fn save<D: Document>(&mut self, record: &mut Record<D>) -> Result<()> {
        record.updated_at = now_millis();
        let body = serde_json::to_string(&*record)?;

        let result = sqlx::query(&format!(
            "UPDATE {} SET body = ?1 WHERE id = ?2",
            D::COLLECTION.as_str()
        ))
        .bind(body)
        .bind(record.id.to_string())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found::<D>(&record.id));
        }
        self.touch(D::COLLECTION, Some(record.id.to_string()));
        Ok(())
    }

    pub async fn delete<D: Document>(&mut self, id: D::Id) -> Result<bool> {
        Ok(self.delete_many::<D>(&[id]).await? > 0)
    }

    pub async fn delete_many<D: Document>(&mut self, ids: &[D::Id]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "DELETE FROM {} WHERE id IN ({})",
            D::COLLECTION.as_str(),
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.to_string());
        }
        let deleted = query.execute(&mut *self.tx).await?.rows_affected();

        if deleted > 0 {
            for id in ids {
                self.touch(D::COLLECTION, Some(id.to_string()));
            }
        }
        Ok(deleted)
    }

    pub async fn clear(&mut self, collection: Collection) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {}", collection.as_str()))
            .execute(&mut *self.tx)
            .await?;
        self.touch(collection, None);
        Ok(())
    }

    fn touch(&mut self, collection: Collection, id: Option<String>) {
        let entry = self
            .touched
            .entry(collection)
            .or_insert_with(|| Some(BTreeSet::new()));
        match (entry, id) {
            (Some(ids), Some(id)) => {
                ids.insert(id);
            }
            (entry, None) => *entry = None,
            (None, Some(_)) => {}
        }
    }

    /// Commits and then notifies watchers of every collection written to.
    pub async fn commit(self) -> Result<()> {
        let Self {
            tx,
            touched,
            changes,
        } = self;
        tx.commit().await.map_err(StorageError::Transaction)?;

        for (collection, ids) in touched {
            let ids = ids.map(|ids| ids.into_iter().collect());
            // No receivers is not an error.
            let _ = changes.send(ChangeNotice { collection, ids });
        }
        Ok(())
    }
}

/// Receives committed change notices for a fixed set of collections.
pub struct ChangeFeed {
    receiver: broadcast::Receiver<ChangeNotice>,
    collections: Vec<Collection>,
}

impl ChangeFeed {
    /// Waits for the next relevant notice. Returns `None` once the store is
    /// gone. A lagged receiver yields a notice touching every record.
    pub async fn recv(&mut self) -> Option<ChangeNotice> {
        loop {
            match self.receiver.recv().await {
                Ok(notice) if self.collections.contains(&notice.collection) => return Some(notice),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(notice) = self.lagged() {
                        return Some(notice);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Takes the next queued relevant notice without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeNotice> {
        loop {
            match self.receiver.try_recv() {
                Ok(notice) if self.collections.contains(&notice.collection) => return Some(notice),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    if let Some(notice) = self.lagged() {
                        return Some(notice);
                    }
                }
                Err(_) => return None,
            }
        }
    }

    /// Waits for the next relevant change. Returns `false` once the store is
    /// gone.
    pub async fn changed(&mut self) -> bool {
        self.recv().await.is_some()
    }

    /// Consumes every queued notice without waiting. Returns whether any of
    /// them was relevant.
    pub fn drain(&mut self) -> bool {
        let mut relevant = false;
        while self.try_recv().is_some() {
            relevant = true;
        }
        relevant
    }

    fn lagged(&self) -> Option<ChangeNotice> {
        self.collections.first().map(|&collection| ChangeNotice {
            collection,
            ids: None,
        })
    }
}

fn decode_row<T: serde::de::DeserializeOwned>(row: &sqlx::sqlite::SqliteRow) -> Result<T> {
    let body: String = row.try_get("body")?;
    Ok(serde_json::from_str(&body)?)
}

fn not_found<D: Document>(id: &D::Id) -> StorageError {
    StorageError::NotFound {
        collection: D::COLLECTION,
        id: id.to_string(),
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent)?;
    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() || path == ":memory:" {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
