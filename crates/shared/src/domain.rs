use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator joining the two participant ids of a peer-pair channel.
pub const P2P_SEPARATOR: &str = "<->";

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(PersonId);
id_newtype!(GroupId);
id_newtype!(ChannelId);
id_newtype!(LogicalMessageId);
// Hex SHA-256 of an object's canonical encoding.
id_newtype!(ContentRef);
// Hex SHA-256 of an object's type name and identity string.
id_newtype!(IdRef);

impl LogicalMessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl ChannelId {
    /// Splits a peer-pair id into its two participants. Returns `None` for
    /// any id that is not exactly two non-empty ids joined by [`P2P_SEPARATOR`].
    pub fn p2p_participants(&self) -> Option<(PersonId, PersonId)> {
        let (first, second) = self.0.split_once(P2P_SEPARATOR)?;
        if first.is_empty() || second.is_empty() || second.contains(P2P_SEPARATOR) {
            return None;
        }
        Some((PersonId::new(first), PersonId::new(second)))
    }

    pub fn is_p2p(&self) -> bool {
        self.p2p_participants().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantMode {
    Add,
    Replace,
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
