use std::collections::HashMap;

use async_trait::async_trait;
use shared::{
    domain::{ContentRef, IdRef},
    error::{CoreError, CoreResult},
};
use tokio::sync::RwLock;

use crate::{ObjectStore, StoredObject};

#[derive(Default)]
pub struct MemoryObjectStore {
    inner: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    objects: HashMap<ContentRef, StoredObject>,
    identities: HashMap<IdRef, ContentRef>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn object_count(&self) -> usize {
        self.inner.read().await.objects.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, object: StoredObject) -> CoreResult<ContentRef> {
        let reference = object.content_ref();
        let id_ref = object.id_ref();
        let mut guard = self.inner.write().await;
        guard.objects.entry(reference.clone()).or_insert(object);
        if let Some(id_ref) = id_ref {
            guard.identities.insert(id_ref, reference.clone());
        }
        Ok(reference)
    }

    async fn get(&self, reference: &ContentRef) -> CoreResult<StoredObject> {
        self.inner
            .read()
            .await
            .objects
            .get(reference)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("object {reference}")))
    }

    async fn put_if_latest(
        &self,
        object: StoredObject,
        expected: Option<&ContentRef>,
    ) -> CoreResult<Option<ContentRef>> {
        let reference = object.content_ref();
        let id_ref = object.id_ref().ok_or_else(|| {
            CoreError::invalid_state(format!("conditional put of {} without identity", object.type_name))
        })?;
        let mut guard = self.inner.write().await;
        if guard.identities.get(&id_ref) != expected {
            return Ok(None);
        }
        guard.objects.entry(reference.clone()).or_insert(object);
        guard.identities.insert(id_ref, reference.clone());
        Ok(Some(reference))
    }

    async fn get_by_identity(&self, id: &IdRef) -> CoreResult<(StoredObject, ContentRef)> {
        let guard = self.inner.read().await;
        let reference = guard
            .identities
            .get(id)
            .ok_or_else(|| CoreError::not_found(format!("identity {id}")))?;
        let object = guard
            .objects
            .get(reference)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("object {reference}")))?;
        Ok((object, reference.clone()))
    }
}
