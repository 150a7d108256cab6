use shared::domain::ContentRef;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChainEntry {
    version_number: u32,
    reference: ContentRef,
}

/// Index of one logical message's versions, ordered by version number.
/// The store stays authoritative; this is rebuildable at any time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionChain {
    entries: Vec<ChainEntry>,
}

impl VersionChain {
    /// Records `reference` at `version_number`. Returns `false` when the
    /// reference is already indexed. A different reference at an already
    /// indexed version number replaces it: the last observed write wins.
    pub fn insert(&mut self, version_number: u32, reference: ContentRef) -> bool {
        if self.entries.iter().any(|entry| entry.reference == reference) {
            return false;
        }
        match self
            .entries
            .binary_search_by_key(&version_number, |entry| entry.version_number)
        {
            Ok(pos) => self.entries[pos].reference = reference,
            Err(pos) => self.entries.insert(
                pos,
                ChainEntry {
                    version_number,
                    reference,
                },
            ),
        }
        true
    }

    pub fn latest(&self) -> Option<&ContentRef> {
        self.entries.last().map(|entry| &entry.reference)
    }

    pub fn latest_version_number(&self) -> Option<u32> {
        self.entries.last().map(|entry| entry.version_number)
    }

    pub fn references(&self) -> impl Iterator<Item = &ContentRef> {
        self.entries.iter().map(|entry| &entry.reference)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/chain_tests.rs"]
mod tests;
