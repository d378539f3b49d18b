//! Volatile synthesized-audio cache shared by the session and prefetch workers.
//!
//! Two bounded maps are kept, one for the chapter being read and one for the
//! chapter after it. Every write is checked against the session scope it was
//! scheduled under, so results from an abandoned session never land.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Session identity a piece of background work was scheduled under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChapterScope {
    pub book_id: Arc<str>,
    pub epoch: u64,
    pub chapter_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub book_id: Arc<str>,
    pub chapter_index: usize,
    pub unit_index: usize,
    pub char_offset: usize,
}

impl CacheKey {
    pub fn new(scope: &ChapterScope, unit_index: usize, char_offset: usize) -> Self {
        Self {
            book_id: scope.book_id.clone(),
            chapter_index: scope.chapter_index,
            unit_index,
            char_offset,
        }
    }
}

#[derive(Debug, Default)]
struct ChapterCache {
    chapter_index: Option<usize>,
    entries: BTreeMap<(usize, usize), Arc<[u8]>>,
}

impl ChapterCache {
    fn reset(&mut self, chapter_index: Option<usize>) {
        self.chapter_index = chapter_index;
        self.entries.clear();
    }
}

#[derive(Debug)]
struct StoreState {
    book_id: Arc<str>,
    epoch: u64,
    current_chapter: usize,
    capacity: usize,
    current: ChapterCache,
    next: ChapterCache,
    /// `(chapter_index, unit_index)` pairs that exhausted their remote retries.
    fallback: HashSet<(usize, usize)>,
}

impl StoreState {
    fn is_live(&self, scope: &ChapterScope) -> bool {
        scope.epoch == self.epoch
            && scope.book_id == self.book_id
            && (scope.chapter_index == self.current_chapter
                || scope.chapter_index == self.current_chapter + 1)
    }

    fn map_for(&self, chapter_index: usize) -> Option<&ChapterCache> {
        if self.current.chapter_index == Some(chapter_index) {
            Some(&self.current)
        } else if self.next.chapter_index == Some(chapter_index) {
            Some(&self.next)
        } else {
            None
        }
    }

    fn map_for_mut(&mut self, chapter_index: usize) -> Option<&mut ChapterCache> {
        if self.current.chapter_index == Some(chapter_index) {
            Some(&mut self.current)
        } else if self.next.chapter_index == Some(chapter_index) {
            Some(&mut self.next)
        } else {
            None
        }
    }
}

/// Handle to the shared cache. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct AudioStore {
    state: Arc<Mutex<StoreState>>,
}

impl AudioStore {
    pub fn new(book_id: impl Into<Arc<str>>, capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                book_id: book_id.into(),
                epoch: 0,
                current_chapter: 0,
                capacity: capacity.max(1),
                current: ChapterCache::default(),
                next: ChapterCache::default(),
                fallback: HashSet::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Scope for `chapter_index` under the current epoch.
    pub fn scope(&self, chapter_index: usize) -> ChapterScope {
        let state = self.lock();
        ChapterScope {
            book_id: state.book_id.clone(),
            epoch: state.epoch,
            chapter_index,
        }
    }

    /// Drop everything and open a new session reading `chapter_index`.
    pub fn begin_session(&self, chapter_index: usize) -> ChapterScope {
        let mut state = self.lock();
        state.epoch += 1;
        state.current_chapter = chapter_index;
        state.current.reset(Some(chapter_index));
        state.next.reset(Some(chapter_index + 1));
        state.fallback.clear();
        debug!(epoch = state.epoch, chapter_index, "Audio cache session started");
        ChapterScope {
            book_id: state.book_id.clone(),
            epoch: state.epoch,
            chapter_index,
        }
    }

    /// Invalidate all outstanding work and drop every cached payload.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        state.current.reset(None);
        state.next.reset(None);
        state.fallback.clear();
        debug!(epoch = state.epoch, "Audio cache reset");
    }

    /// Move the next-chapter map into the current slot when reading reaches `chapter_index`.
    pub fn promote(&self, chapter_index: usize) -> ChapterScope {
        let mut state = self.lock();
        if state.next.chapter_index == Some(chapter_index) {
            let next = std::mem::take(&mut state.next);
            state.current = next;
        } else {
            state.current.reset(Some(chapter_index));
        }
        state.next.reset(Some(chapter_index + 1));
        state.current_chapter = chapter_index;
        state.fallback.retain(|(chapter, _)| *chapter >= chapter_index);
        debug!(
            chapter_index,
            carried = state.current.entries.len(),
            "Promoted next-chapter audio"
        );
        ChapterScope {
            book_id: state.book_id.clone(),
            epoch: state.epoch,
            chapter_index,
        }
    }

    pub fn is_live(&self, scope: &ChapterScope) -> bool {
        self.lock().is_live(scope)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<[u8]>> {
        let state = self.lock();
        if key.book_id != state.book_id {
            return None;
        }
        state
            .map_for(key.chapter_index)?
            .entries
            .get(&(key.unit_index, key.char_offset))
            .cloned()
    }

    pub fn contains(&self, scope: &ChapterScope, unit_index: usize, char_offset: usize) -> bool {
        let state = self.lock();
        state.is_live(scope)
            && state
                .map_for(scope.chapter_index)
                .map(|map| map.entries.contains_key(&(unit_index, char_offset)))
                .unwrap_or(false)
    }

    /// Store a payload. Returns false when `scope` is stale and nothing was written.
    pub fn insert(
        &self,
        scope: &ChapterScope,
        unit_index: usize,
        char_offset: usize,
        audio: Arc<[u8]>,
    ) -> bool {
        let mut state = self.lock();
        if !state.is_live(scope) {
            return false;
        }
        let capacity = state.capacity;
        let Some(map) = state.map_for_mut(scope.chapter_index) else {
            return false;
        };
        map.entries.insert((unit_index, char_offset), audio);
        while map.entries.len() > capacity {
            // Lowest unit first: it is the one reading has most likely passed.
            map.entries.pop_first();
        }
        true
    }

    pub fn is_fallback(&self, scope: &ChapterScope, unit_index: usize) -> bool {
        let state = self.lock();
        state.is_live(scope) && state.fallback.contains(&(scope.chapter_index, unit_index))
    }

    pub fn mark_fallback(&self, scope: &ChapterScope, unit_index: usize) -> bool {
        let mut state = self.lock();
        if !state.is_live(scope) {
            return false;
        }
        state.fallback.insert((scope.chapter_index, unit_index));
        true
    }

    /// Units of `chapter_index` with audio ready at their start.
    pub fn cached_units(&self, chapter_index: usize) -> Vec<usize> {
        let state = self.lock();
        state
            .map_for(chapter_index)
            .map(|map| {
                map.entries
                    .keys()
                    .filter(|(_, offset)| *offset == 0)
                    .map(|(unit, _)| *unit)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(tag: &str) -> Arc<[u8]> {
        Arc::from(tag.as_bytes())
    }

    #[test]
    fn insert_and_lookup_by_key() {
        let store = AudioStore::new("book", 8);
        let scope = store.begin_session(2);
        assert!(store.insert(&scope, 3, 0, bytes("a")));
        assert!(store.insert(&scope, 3, 10, bytes("b")));
        assert_eq!(store.get(&CacheKey::new(&scope, 3, 0)), Some(bytes("a")));
        assert_eq!(store.get(&CacheKey::new(&scope, 3, 10)), Some(bytes("b")));
        assert!(store.get(&CacheKey::new(&scope, 4, 0)).is_none());
        assert_eq!(store.cached_units(2), vec![3]);
    }

    #[test]
    fn stale_scope_never_writes() {
        let store = AudioStore::new("book", 8);
        let old = store.begin_session(0);
        let fresh = store.begin_session(0);
        assert!(!store.insert(&old, 1, 0, bytes("late")));
        assert!(!store.mark_fallback(&old, 1));
        assert!(!store.contains(&fresh, 1, 0));
        assert!(!store.is_fallback(&fresh, 1));

        store.reset();
        assert!(!store.insert(&fresh, 1, 0, bytes("late")));
    }

    #[test]
    fn only_current_and_next_chapter_are_live() {
        let store = AudioStore::new("book", 8);
        let current = store.begin_session(4);
        let next = store.scope(5);
        let far = store.scope(6);
        assert!(store.insert(&current, 0, 0, bytes("c")));
        assert!(store.insert(&next, 0, 0, bytes("n")));
        assert!(!store.insert(&far, 0, 0, bytes("f")));
    }

    #[test]
    fn promote_carries_next_chapter_audio() {
        let store = AudioStore::new("book", 8);
        let current = store.begin_session(1);
        let next = store.scope(2);
        store.insert(&current, 7, 0, bytes("old"));
        store.insert(&next, 0, 0, bytes("first"));
        store.mark_fallback(&current, 7);

        let promoted = store.promote(2);
        assert_eq!(promoted, next);
        assert_eq!(store.get(&CacheKey::new(&next, 0, 0)), Some(bytes("first")));
        assert!(store.get(&CacheKey::new(&current, 7, 0)).is_none());
        assert!(store.cached_units(1).is_empty());
        assert!(!store.is_fallback(&current, 7));
        assert!(store.insert(&store.scope(3), 0, 0, bytes("after")));
    }

    #[test]
    fn capacity_evicts_lowest_units() {
        let store = AudioStore::new("book", 2);
        let scope = store.begin_session(0);
        for unit in 0..4 {
            store.insert(&scope, unit, 0, bytes("x"));
        }
        assert_eq!(store.cached_units(0), vec![2, 3]);
    }

    #[test]
    fn fallback_is_scoped_to_chapter() {
        let store = AudioStore::new("book", 8);
        let current = store.begin_session(0);
        let next = store.scope(1);
        assert!(store.mark_fallback(&current, 3));
        assert!(store.is_fallback(&current, 3));
        assert!(!store.is_fallback(&next, 3));
    }
}
