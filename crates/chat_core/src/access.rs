use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ChannelId, GrantMode, GroupId, IdRef, PersonId},
    error::{CoreError, CoreResult},
    protocol::ChannelRecord,
};
use storage::{get_typed_by_identity, identity_ref, update_typed, ObjectStore};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::channel_manager::channel_info_ref;

pub const ACCESS_GRANT_TYPE: &str = "AccessGrant";
const PERSON_TYPE: &str = "Person";

#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn grant(
        &self,
        resource: &IdRef,
        persons: &[PersonId],
        groups: &[GroupId],
        mode: GrantMode,
    ) -> CoreResult<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub resource: Option<IdRef>,
    pub persons: BTreeSet<PersonId>,
    pub groups: BTreeSet<GroupId>,
}

/// Access grants kept as one versioned object per resource.
pub struct StoreAccessControl {
    store: Arc<dyn ObjectStore>,
    write_lock: Mutex<()>,
}

impl StoreAccessControl {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn grant_for(&self, resource: &IdRef) -> CoreResult<Option<AccessGrant>> {
        match get_typed_by_identity::<AccessGrant>(
            &*self.store,
            ACCESS_GRANT_TYPE,
            resource.as_str(),
        )
        .await
        {
            Ok((grant, _)) => Ok(Some(grant)),
            Err(CoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl AccessControl for StoreAccessControl {
    async fn grant(
        &self,
        resource: &IdRef,
        persons: &[PersonId],
        groups: &[GroupId],
        mode: GrantMode,
    ) -> CoreResult<()> {
        let _guard = self.write_lock.lock().await;
        update_typed::<AccessGrant, _>(
            &*self.store,
            ACCESS_GRANT_TYPE,
            resource.as_str(),
            |current| {
                let mut grant = match mode {
                    GrantMode::Add => current.clone().unwrap_or_default(),
                    GrantMode::Replace => AccessGrant::default(),
                };
                grant.resource = Some(resource.clone());
                grant.persons.extend(persons.iter().cloned());
                grant.groups.extend(groups.iter().cloned());
                Ok((current.as_ref() != Some(&grant)).then_some(grant))
            },
        )
        .await?;
        Ok(())
    }
}

/// Grants federation groups sync access to channels and identities. Grant
/// failures are logged and reported as `false`; they never abort the flow
/// that requested them.
pub struct FederationAccess {
    access: Arc<dyn AccessControl>,
    groups: Vec<GroupId>,
}

impl FederationAccess {
    pub fn new(access: Arc<dyn AccessControl>, groups: Vec<GroupId>) -> Self {
        Self { access, groups }
    }

    pub fn groups(&self) -> &[GroupId] {
        &self.groups
    }

    pub async fn grant_access(&self, resource: &IdRef, grantee_groups: &[GroupId]) -> bool {
        if grantee_groups.is_empty() {
            return true;
        }
        match self
            .access
            .grant(resource, &[], grantee_groups, GrantMode::Add)
            .await
        {
            Ok(()) => {
                debug!(resource = %resource, groups = grantee_groups.len(), "access: granted");
                true
            }
            Err(err) => {
                warn!(resource = %resource, "access: grant failed: {err}");
                false
            }
        }
    }

    pub async fn grant_access_to_channel(
        &self,
        channel_id: &ChannelId,
        owner: Option<&PersonId>,
        groups: &[GroupId],
    ) -> bool {
        let resource = channel_info_ref(channel_id);
        let granted = self.grant_access(&resource, groups).await;
        if granted {
            info!(channel_id = %channel_id, owner = ?owner, "access: channel shared with federation");
        }
        granted
    }

    pub async fn grant_federation_access_to_channel(
        &self,
        channel_id: &ChannelId,
        owner: Option<&PersonId>,
    ) -> bool {
        self.grant_access_to_channel(channel_id, owner, &self.groups)
            .await
    }

    pub async fn grant_federation_access_to_person(&self, person: &PersonId) -> bool {
        self.grant_access(&identity_ref(PERSON_TYPE, person.as_str()), &self.groups)
            .await
    }

    /// Shares every channel announced on `created` with the federation.
    pub fn watch_new_channels(
        self: &Arc<Self>,
        mut created: broadcast::Receiver<ChannelRecord>,
    ) -> JoinHandle<()> {
        let access = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match created.recv().await {
                    Ok(record) => {
                        access
                            .grant_federation_access_to_channel(&record.id, record.owner.as_ref())
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "access: channel-created events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Shares every person identity announced on `contacts` with the federation.
    pub fn watch_new_contacts(
        self: &Arc<Self>,
        mut contacts: broadcast::Receiver<PersonId>,
    ) -> JoinHandle<()> {
        let access = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match contacts.recv().await {
                    Ok(person) => {
                        access.grant_federation_access_to_person(&person).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "access: contact events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/access_tests.rs"]
mod tests;
