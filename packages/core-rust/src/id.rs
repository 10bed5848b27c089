//! Identifier sequencing for stores that generate their own ids.
//!
//! Numeric stores hand out one more than the highest numeric id ever seen.
//! Stores holding only textual ids derive the next id from the last one by
//! appending a `-N` suffix. A high-water mark keeps ids from being reused
//! after deletion for as long as the sequence lives.

use crate::types::ResourceId;

/// Id generator seeded from the ids present in a store.
#[derive(Debug, Clone, Default)]
pub struct IdSequence {
    high_water: u64,
    last: Option<ResourceId>,
}

impl IdSequence {
    /// Creates an empty sequence. The first generated id is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a sequence from existing ids, in store order.
    pub fn seeded<'a>(ids: impl IntoIterator<Item = &'a ResourceId>) -> Self {
        let mut seq = Self::new();
        for id in ids {
            seq.observe(id);
        }
        seq
    }

    /// Records an id that now exists in the store.
    pub fn observe(&mut self, id: &ResourceId) {
        if let ResourceId::Int(n) = id {
            self.high_water = self.high_water.max(*n);
        }
        self.last = Some(id.clone());
    }

    /// Keeps the high-water mark at least `floor`, e.g. across a reload that
    /// no longer sees ids deleted earlier in the process.
    pub fn raise_high_water(&mut self, floor: u64) {
        self.high_water = self.high_water.max(floor);
    }

    /// Highest numeric id seen so far (0 when none).
    #[must_use]
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    /// Produces the next id and observes it.
    ///
    /// `in_use` reports whether a candidate already exists; it is only
    /// consulted for textual suffixes since numeric ids always advance past
    /// the high-water mark.
    pub fn next_id(&mut self, in_use: impl Fn(&ResourceId) -> bool) -> ResourceId {
        let id = match &self.last {
            Some(ResourceId::Str(last)) if self.high_water == 0 => {
                let (stem, start) = split_suffix(last);
                (start..)
                    .map(|n| ResourceId::Str(format!("{stem}-{n}")))
                    .find(|candidate| !in_use(candidate))
                    .unwrap_or_else(|| ResourceId::Str(format!("{last}-1")))
            }
            _ => ResourceId::Int(self.high_water.saturating_add(1)),
        };
        self.observe(&id);
        id
    }
}

/// Splits `rex-3` into `("rex", 4)`; ids without a numeric suffix start at 1.
fn split_suffix(last: &str) -> (&str, u64) {
    if let Some((stem, suffix)) = last.rsplit_once('-') {
        if !stem.is_empty() && !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = suffix.parse::<u64>() {
                return (stem, n.saturating_add(1));
            }
        }
    }
    (last, 1)
}
