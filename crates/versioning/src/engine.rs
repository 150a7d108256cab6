use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use shared::{
    domain::{ChannelId, ContentRef, LogicalMessageId},
    error::{CoreError, CoreResult},
    protocol::{ChannelMessage, MessageContent, VersionRecord},
};
use storage::{get_typed, put_typed, ObjectStore};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    chain::VersionChain,
    record::{
        create_edited_version, create_retraction, DisplayRecord, LatestVersion,
        RetractionOutcome, VERSIONED_MESSAGE_TYPE,
    },
};

/// Source of raw channel contents used to rebuild chains after a restart.
#[async_trait]
pub trait ChannelHistory: Send + Sync {
    async fn channel_messages(&self, channel_id: &ChannelId) -> CoreResult<Vec<ChannelMessage>>;
}

pub struct MessageVersioning {
    store: Arc<dyn ObjectStore>,
    history: Arc<dyn ChannelHistory>,
    chains: RwLock<HashMap<LogicalMessageId, VersionChain>>,
}

impl MessageVersioning {
    pub fn new(store: Arc<dyn ObjectStore>, history: Arc<dyn ChannelHistory>) -> Self {
        Self {
            store,
            history,
            chains: RwLock::new(HashMap::new()),
        }
    }

    /// Persists `record` and indexes it under its logical id.
    pub async fn store_message(&self, record: &VersionRecord) -> CoreResult<ContentRef> {
        let reference = put_typed(
            &*self.store,
            VERSIONED_MESSAGE_TYPE,
            Some(record.logical_id.as_str()),
            record,
        )
        .await?;
        let inserted = self
            .chains
            .write()
            .await
            .entry(record.logical_id.clone())
            .or_default()
            .insert(record.version_number, reference.clone());
        if inserted {
            debug!(
                logical_id = %record.logical_id,
                version = record.version_number,
                reference = %reference,
                "versioning: record indexed"
            );
        }
        Ok(reference)
    }

    pub async fn chain(&self, logical_id: &LogicalMessageId) -> Option<VersionChain> {
        self.chains.read().await.get(logical_id).cloned()
    }

    /// Head of the chain as known to this process. `None` when the id was
    /// never seen here; call [`Self::rebuild_chain`] after a restart.
    pub async fn get_latest_version(
        &self,
        logical_id: &LogicalMessageId,
    ) -> CoreResult<Option<LatestVersion>> {
        let reference = {
            let guard = self.chains.read().await;
            match guard.get(logical_id).and_then(VersionChain::latest) {
                Some(reference) => reference.clone(),
                None => return Ok(None),
            }
        };
        let record = get_typed(&*self.store, VERSIONED_MESSAGE_TYPE, &reference).await?;
        Ok(Some(LatestVersion { reference, record }))
    }

    /// All resolvable versions, oldest first. References that fail to load
    /// are skipped so a partial history is still returned.
    pub async fn get_version_history(
        &self,
        logical_id: &LogicalMessageId,
    ) -> CoreResult<Vec<VersionRecord>> {
        let references: Vec<ContentRef> = match self.chains.read().await.get(logical_id) {
            Some(chain) => chain.references().cloned().collect(),
            None => return Ok(Vec::new()),
        };

        let mut records = Vec::with_capacity(references.len());
        for reference in references {
            match get_typed::<VersionRecord>(&*self.store, VERSIONED_MESSAGE_TYPE, &reference)
                .await
            {
                Ok(record) => records.push(record),
                Err(err) => warn!(
                    logical_id = %logical_id,
                    reference = %reference,
                    "versioning: skipping unresolvable version: {err}"
                ),
            }
        }
        Ok(records)
    }

    /// Re-indexes every versioned message found in `channel_id`. Returns the
    /// number of logical messages whose chains were rebuilt.
    pub async fn rebuild_chain(&self, channel_id: &ChannelId) -> CoreResult<usize> {
        let messages = self.history.channel_messages(channel_id).await?;

        let mut grouped: HashMap<LogicalMessageId, Vec<VersionRecord>> = HashMap::new();
        for message in messages {
            grouped
                .entry(message.record.logical_id.clone())
                .or_default()
                .push(message.record);
        }

        let mut rebuilt = HashMap::with_capacity(grouped.len());
        for (logical_id, mut records) in grouped {
            records.sort_by_key(|record| record.version_number);
            let mut chain = VersionChain::default();
            for record in &records {
                // Puts are idempotent; this makes records that only arrived
                // through the channel resolvable from the store.
                let reference = put_typed(
                    &*self.store,
                    VERSIONED_MESSAGE_TYPE,
                    Some(logical_id.as_str()),
                    record,
                )
                .await?;
                chain.insert(record.version_number, reference);
            }
            rebuilt.insert(logical_id, chain);
        }

        let count = rebuilt.len();
        self.chains.write().await.extend(rebuilt);
        info!(channel_id = %channel_id, chains = count, "versioning: chains rebuilt");
        Ok(count)
    }

    pub async fn get_display_version(
        &self,
        logical_id: &LogicalMessageId,
    ) -> CoreResult<Option<DisplayRecord>> {
        Ok(self
            .get_latest_version(logical_id)
            .await?
            .map(|latest| DisplayRecord::from(&latest.record)))
    }

    /// Builds, stores and indexes an edit of the current head.
    pub async fn edit_message(
        &self,
        logical_id: &LogicalMessageId,
        new_content: MessageContent,
        reason: Option<String>,
    ) -> CoreResult<(VersionRecord, ContentRef)> {
        let latest = self.require_latest(logical_id).await?;
        let record = create_edited_version(&latest, new_content, reason)?;
        let reference = self.store_message(&record).await?;
        Ok((record, reference))
    }

    /// Builds, stores and indexes a retraction. `Ok(None)` when the message
    /// was already retracted.
    pub async fn retract_message(
        &self,
        logical_id: &LogicalMessageId,
        reason: Option<String>,
    ) -> CoreResult<Option<(VersionRecord, ContentRef)>> {
        let latest = self.require_latest(logical_id).await?;
        match create_retraction(&latest, reason) {
            RetractionOutcome::Retracted(record) => {
                let reference = self.store_message(&record).await?;
                Ok(Some((record, reference)))
            }
            RetractionOutcome::AlreadyRetracted => {
                warn!(logical_id = %logical_id, "versioning: message already retracted");
                Ok(None)
            }
        }
    }

    async fn require_latest(&self, logical_id: &LogicalMessageId) -> CoreResult<LatestVersion> {
        self.get_latest_version(logical_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("message {logical_id}")))
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
