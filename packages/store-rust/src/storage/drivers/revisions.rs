//! Last-observed revision tokens for document stores.

use dashmap::DashMap;
use restkit_core::ResourceId;

/// Revision token each document had when this store last read or wrote it.
///
/// Update and delete send the cached token so the medium can reject the
/// write when another writer got there first. Documents this store never
/// observed have no entry; writes to them use the current revision.
#[derive(Debug)]
pub struct RevisionCache<R> {
    seen: DashMap<ResourceId, R>,
}

impl<R: Clone> RevisionCache<R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            seen: DashMap::new(),
        }
    }

    /// Records the revision observed for `id`.
    pub fn observe(&self, id: &ResourceId, revision: R) {
        self.seen.insert(id.clone(), revision);
    }

    /// The revision last observed for `id`.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<R> {
        self.seen.get(id).map(|entry| entry.value().clone())
    }

    /// Drops the entry for a deleted document.
    pub fn forget(&self, id: &ResourceId) {
        self.seen.remove(id);
    }

    /// Drops every entry, after a bulk delete.
    pub fn clear(&self) {
        self.seen.clear();
    }

    /// Number of documents with an observed revision.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether no revision has been observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl<R: Clone> Default for RevisionCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_overwrites_and_forget_removes() {
        let cache = RevisionCache::new();
        let id = ResourceId::from("rex");
        assert_eq!(cache.get(&id), None);

        cache.observe(&id, 1u64);
        cache.observe(&id, 2);
        assert_eq!(cache.get(&id), Some(2));
        assert_eq!(cache.len(), 1);

        cache.forget(&id);
        assert!(cache.is_empty());

        cache.observe(&ResourceId::from("a"), 1);
        cache.observe(&ResourceId::from("b"), 1);
        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}
