use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::{
    domain::{ContentRef, IdRef},
    error::{CoreError, CoreResult},
};
use tracing::debug;

mod memory;
mod sqlite;

pub use memory::MemoryObjectStore;
pub use sqlite::SqliteObjectStore;

/// An object as the store sees it: a type tag, an optional identity that
/// groups successive versions, and a JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub body: serde_json::Value,
}

impl StoredObject {
    pub fn from_typed<T: Serialize>(
        type_name: &str,
        identity: Option<&str>,
        value: &T,
    ) -> CoreResult<Self> {
        Ok(Self {
            type_name: type_name.to_string(),
            identity: identity.map(str::to_string),
            body: serde_json::to_value(value)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> CoreResult<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    pub fn content_ref(&self) -> ContentRef {
        let mut hasher = Sha256::new();
        hasher.update(self.type_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.identity.as_deref().unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.body.to_string().as_bytes());
        ContentRef(hex::encode(hasher.finalize()))
    }

    pub fn id_ref(&self) -> Option<IdRef> {
        self.identity
            .as_deref()
            .map(|identity| identity_ref(&self.type_name, identity))
    }
}

pub fn identity_ref(type_name: &str, identity: &str) -> IdRef {
    let mut hasher = Sha256::new();
    hasher.update(format!("{type_name}:{identity}").as_bytes());
    IdRef(hex::encode(hasher.finalize()))
}

/// Reference an object would receive from [`ObjectStore::put`], computed
/// without touching a store.
pub fn content_ref_of<T: Serialize>(
    type_name: &str,
    identity: Option<&str>,
    value: &T,
) -> CoreResult<ContentRef> {
    Ok(StoredObject::from_typed(type_name, identity, value)?.content_ref())
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `object` and returns its content reference. Identical content
    /// always yields the identical reference; storing it again is a no-op
    /// apart from moving the identity's latest pointer.
    async fn put(&self, object: StoredObject) -> CoreResult<ContentRef>;
    async fn get(&self, reference: &ContentRef) -> CoreResult<StoredObject>;
    /// Latest object stored under `id`, together with its reference.
    async fn get_by_identity(&self, id: &IdRef) -> CoreResult<(StoredObject, ContentRef)>;
    /// Stores `object` and moves its identity pointer only if the pointer
    /// still equals `expected` (`None`: the identity must not exist yet).
    /// The compare and the move are one atomic step. Returns `Ok(None)` and
    /// leaves the pointer alone when another writer got there first.
    async fn put_if_latest(
        &self,
        object: StoredObject,
        expected: Option<&ContentRef>,
    ) -> CoreResult<Option<ContentRef>>;
}

/// Attempts [`update_typed`] makes before reporting contention.
pub const MAX_UPDATE_ATTEMPTS: usize = 64;

pub async fn put_typed<T: Serialize + Sync>(
    store: &dyn ObjectStore,
    type_name: &str,
    identity: Option<&str>,
    value: &T,
) -> CoreResult<ContentRef> {
    store
        .put(StoredObject::from_typed(type_name, identity, value)?)
        .await
}

/// Conditional variant of [`put_typed`]; see [`ObjectStore::put_if_latest`].
pub async fn put_typed_if_latest<T: Serialize + Sync>(
    store: &dyn ObjectStore,
    type_name: &str,
    identity: &str,
    value: &T,
    expected: Option<&ContentRef>,
) -> CoreResult<Option<ContentRef>> {
    store
        .put_if_latest(
            StoredObject::from_typed(type_name, Some(identity), value)?,
            expected,
        )
        .await
}

/// Read-modify-write of the object stored under `identity`, safe against
/// writers in other processes sharing the store. `apply` sees the current
/// value (`None` when absent) and returns the value to store, `Ok(None)` to
/// leave it untouched, or an error to abort. It is re-run on the fresh value
/// whenever another writer moved the identity in between. Returns the value
/// written, if any.
pub async fn update_typed<T, F>(
    store: &dyn ObjectStore,
    type_name: &str,
    identity: &str,
    mut apply: F,
) -> CoreResult<Option<T>>
where
    T: Serialize + DeserializeOwned + Send + Sync,
    F: FnMut(Option<T>) -> CoreResult<Option<T>> + Send,
{
    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let (current, expected) =
            match get_typed_by_identity::<T>(store, type_name, identity).await {
                Ok((value, reference)) => (Some(value), Some(reference)),
                Err(CoreError::NotFound(_)) => (None, None),
                Err(err) => return Err(err),
            };
        let Some(next) = apply(current)? else {
            return Ok(None);
        };
        if put_typed_if_latest(store, type_name, identity, &next, expected.as_ref())
            .await?
            .is_some()
        {
            return Ok(Some(next));
        }
        debug!(type_name, identity, attempt, "store: concurrent update, retrying");
        tokio::task::yield_now().await;
    }
    Err(CoreError::transient(format!(
        "{type_name} {identity}: still contended after {MAX_UPDATE_ATTEMPTS} attempts"
    )))
}

pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    type_name: &str,
    reference: &ContentRef,
) -> CoreResult<T> {
    let object = store.get(reference).await?;
    if object.type_name != type_name {
        return Err(CoreError::invalid_state(format!(
            "object {reference} is a {} but a {type_name} was expected",
            object.type_name
        )));
    }
    object.decode()
}

pub async fn get_typed_by_identity<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    type_name: &str,
    identity: &str,
) -> CoreResult<(T, ContentRef)> {
    let (object, reference) = store
        .get_by_identity(&identity_ref(type_name, identity))
        .await?;
    Ok((object.decode()?, reference))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
