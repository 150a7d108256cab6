use std::collections::HashSet;

use shared::domain::PersonId;

/// Answers the only identity questions the listeners need.
pub trait IdentityOracle: Send + Sync {
    fn is_self(&self, sender: &PersonId) -> bool;
    fn is_known_automated_agent(&self, sender: &PersonId) -> bool;
}

#[derive(Debug, Clone)]
pub struct StaticIdentities {
    local: PersonId,
    agents: HashSet<PersonId>,
}

impl StaticIdentities {
    pub fn new(local: PersonId, agents: impl IntoIterator<Item = PersonId>) -> Self {
        Self {
            local,
            agents: agents.into_iter().collect(),
        }
    }

    pub fn local(&self) -> &PersonId {
        &self.local
    }
}

impl IdentityOracle for StaticIdentities {
    fn is_self(&self, sender: &PersonId) -> bool {
        *sender == self.local
    }

    fn is_known_automated_agent(&self, sender: &PersonId) -> bool {
        self.agents.contains(sender)
    }
}
