//! Entity controllers over the document store.
//!
//! [`BaseController`] holds the generic create/read/update/delete paths.
//! Each entity controller adds its own invariants on top and implements
//! [`EntityController`] to describe its serialized view, which also drives
//! the live queries behind the `*.pub` broadcasts.

use std::marker::PhantomData;

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};

use shared::{
    domain::Collection,
    models::{Document, Record},
    query::ListQuery,
};
use storage::{Storage, StorageTx};

use crate::error::{entity_name, Result, ServiceError};

mod file;
mod project;
mod transformer;

pub use file::{FileController, ResultFile};
pub use project::ProjectController;
pub use transformer::TransformerController;

/// Generic persistence for one document collection.
pub struct BaseController<D: Document> {
    storage: Storage,
    _document: PhantomData<fn() -> D>,
}

impl<D: Document> Clone for BaseController<D> {
    fn clone(&self) -> Self {
        Self::new(self.storage.clone())
    }
}

impl<D: Document> BaseController<D> {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            _document: PhantomData,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub async fn create(&self, data: D) -> Result<Record<D>> {
        let mut tx = self.storage.begin().await?;
        let inserted = tx.insert(data).await?;
        let record = tx.require::<D>(inserted.id).await?;
        tx.commit().await?;
        Ok(record)
    }

    pub async fn get(&self, id: D::Id) -> Result<Option<Record<D>>> {
        let mut tx = self.storage.begin().await?;
        let record = tx.fetch::<D>(id).await?;
        tx.commit().await?;
        Ok(record)
    }

    pub async fn require(&self, id: D::Id) -> Result<Record<D>> {
        self.get(id)
            .await?
            .ok_or_else(|| ServiceError::not_found(entity_name(D::COLLECTION), id))
    }

    pub async fn get_many(&self, query: &ListQuery) -> Result<Vec<Record<D>>> {
        let mut tx = self.storage.begin().await?;
        let records = tx.query::<D>(query).await?;
        tx.commit().await?;
        Ok(records)
    }

    /// Shallow-merges `partial` into the stored document.
    pub async fn update<P: Serialize + ?Sized>(&self, id: D::Id, partial: &P) -> Result<Record<D>> {
        let patch = patch(partial)?;
        let mut tx = self.storage.begin().await?;
        let record = tx.update::<D>(id, patch).await?;
        tx.commit().await?;
        Ok(record)
    }

    pub async fn delete(&self, id: D::Id) -> Result<bool> {
        Ok(self.delete_many(&[id]).await? > 0)
    }

    pub async fn delete_many(&self, ids: &[D::Id]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.storage.begin().await?;
        let deleted = tx.delete_many::<D>(ids).await?;
        tx.commit().await?;
        Ok(deleted)
    }
}

/// An entity with a serialized view composed from one or more collections.
#[async_trait]
pub trait EntityController: Clone + Send + Sync + 'static {
    type Doc: Document;
    type Model: Serialize + Send + Sync + 'static;

    fn base(&self) -> &BaseController<Self::Doc>;

    /// Collections whose changes can alter the serialized view.
    fn dependencies(&self) -> &'static [Collection];

    async fn serialize(&self, tx: &mut StorageTx, record: Record<Self::Doc>)
        -> Result<Self::Model>;

    async fn get_by_id(&self, id: <Self::Doc as Document>::Id) -> Result<Option<Self::Model>> {
        let mut tx = self.base().storage().begin().await?;
        let model = match tx.fetch::<Self::Doc>(id).await? {
            Some(record) => Some(self.serialize(&mut tx, record).await?),
            None => None,
        };
        tx.commit().await?;
        Ok(model)
    }

    async fn get_many(&self, query: &ListQuery) -> Result<Vec<Self::Model>> {
        let mut tx = self.base().storage().begin().await?;
        let records = tx.query::<Self::Doc>(query).await?;
        let mut models = Vec::with_capacity(records.len());
        for record in records {
            models.push(self.serialize(&mut tx, record).await?);
        }
        tx.commit().await?;
        Ok(models)
    }

    /// Yields the full serialized listing now and again after every committed
    /// change to a dependency. Bursts of changes are coalesced into a single
    /// evaluation.
    fn live_query_all(&self) -> BoxStream<'static, Result<Vec<Self::Model>>> {
        let feed = self.base().storage().watch(self.dependencies());
        futures::stream::unfold(
            (self.clone(), feed, true),
            |(controller, mut feed, first)| async move {
                if !first {
                    if !feed.changed().await {
                        return None;
                    }
                    feed.drain();
                }
                let models = controller.get_many(&ListQuery::new()).await;
                Some((models, (controller, feed, false)))
            },
        )
        .boxed()
    }
}

/// Converts a partial update into the object patch the store merges.
pub(crate) fn patch<P: Serialize + ?Sized>(partial: &P) -> Result<Map<String, Value>> {
    match serde_json::to_value(partial) {
        Ok(Value::Object(patch)) => Ok(patch),
        Ok(other) => Err(ServiceError::validation(format!(
            "update must be an object, got {other}"
        ))),
        Err(error) => Err(ServiceError::validation(format!("invalid update: {error}"))),
    }
}

/// Returns `ids` with repeats removed, keeping first occurrences in order.
pub(crate) fn dedup<T: Copy + Eq + std::hash::Hash>(ids: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
#[path = "../tests/controller_tests.rs"]
mod tests;
