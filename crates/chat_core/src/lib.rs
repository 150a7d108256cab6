//! Peer-to-peer conversation plumbing on top of the object store: channel
//! bootstrap with creation-race recovery, federation access grants, and
//! debounced reaction to channel updates.

pub mod access;
pub mod channel_manager;
pub mod conversation;
pub mod identity;
pub mod listener;
pub mod reconcile;

pub use access::{AccessControl, AccessGrant, FederationAccess, StoreAccessControl};
pub use channel_manager::{
    channel_info_ref, ChannelManager, ChannelManagerHistory, StoreChannelManager,
};
pub use conversation::Conversation;
pub use identity::{IdentityOracle, StaticIdentities};
pub use listener::{ChannelChange, ChannelChangeHandler, ListenerConfig, UpdateListener};
pub use reconcile::{
    compute_channel_id, FallbackPolicy, ReconcilerConfig, TopicReconciler, TopicResolution,
};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
