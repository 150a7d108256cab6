//! Append-only version chains for chat messages.
//!
//! Every edit or retraction produces a new immutable [`VersionRecord`]
//! pointing at its predecessor by content reference. Nothing is mutated in
//! place; the "current" state of a message is simply the head of its chain.

mod chain;
mod engine;
mod record;

pub use chain::VersionChain;
pub use engine::{ChannelHistory, MessageVersioning};
pub use record::{
    create_edited_version, create_retraction, create_version, create_version_with_id,
    DisplayRecord, LatestVersion, MessageEvent, RetractionOutcome, RETRACTED_PLACEHOLDER,
    VERSIONED_MESSAGE_TYPE,
};
pub use shared::protocol::VersionRecord;
