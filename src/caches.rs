//! Bounded LRU caches keyed by stable remote-address fingerprints.
//!
//! Grounded on the original's `lru_cache__maybe_hit`/`lru_cache__store`
//! pattern referenced from `original_source/src/frame.h` and `code.h`; the
//! teacher has no equivalent (py-spy re-reads each frame from the target on
//! every sample). Backed by the teacher's own `lru` dependency.

use lru::LruCache;
use std::num::NonZeroUsize;

/// A fixed-capacity cache with explicit whole-cache invalidation and a
/// per-entry eviction signal.
///
/// `invalidate_all` is the one piece `SPEC_FULL.md` §4.5 needs that the raw
/// crate doesn't provide directly (code-object-generation bumps must drop
/// every cached frame and code record at once, not just the LRU tail).
/// `put` surfaces whatever the LRU evicts to make room: "eviction runs a
/// caller-provided destructor" (`SPEC_FULL.md` §4.5) is implemented by
/// handing the evicted pair back to the caller rather than owning a boxed
/// callback, since every caller in this crate already knows what cleanup an
/// eviction needs (forgetting a `sent_frames`/`sent_strings` key) and can run
/// it inline.
pub struct Cache<K: std::hash::Hash + Eq, V> {
    inner: LruCache<K, V>,
}

impl<K: std::hash::Hash + Eq, V> Cache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Cache {
            inner: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Inserts `key`/`value`. Returns the entry the LRU had to evict to make
    /// room, if any, so the caller can run its own per-entry destructor.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        self.inner.push(key, value)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drop every entry immediately. Used when the code-object generation of
    /// an interpreter changes (3.14+) since previously cached frames/codes
    /// may reference bytecode that no longer exists.
    pub fn invalidate_all(&mut self) {
        self.inner.clear();
    }
}

/// The four caches a [`crate::unwind::Target`]-equivalent owns: frames, code
/// objects, strings, and per-interpreter metadata (keyed by
/// `(interpreter_id, code_object_generation)`).
pub struct TargetCaches {
    pub frames: Cache<u64, crate::codeloc::FrameRecord>,
    pub codes: Cache<u64, crate::codeloc::CodeRecord>,
    pub strings: Cache<u64, String>,
    pub interpreter_meta: Cache<i64, u64>,
}

impl TargetCaches {
    /// `max_stack` mirrors the configured stack-buffer capacity; frame
    /// capacity is `2 * max_stack` per `SPEC_FULL.md` §4.5, string and code
    /// caches are sized at least as large as the stack.
    pub fn new(max_stack: usize) -> Self {
        TargetCaches {
            frames: Cache::new(2 * max_stack),
            codes: Cache::new(max_stack.max(64)),
            strings: Cache::new(max_stack.max(64)),
            interpreter_meta: Cache::new(8),
        }
    }

    pub fn invalidate_all(&mut self) {
        self.frames.invalidate_all();
        self.codes.invalidate_all();
        // Strings are immutable for the lifetime of their PyASCIIObject and
        // remain valid across a code-object-generation bump; only frame and
        // code caches need to drop.
    }
}

/// `interpreter_id + 1` avoids colliding the cache key with the null
/// sentinel `0`. Per `SPEC_FULL.md` §9 this port rejects negative ids rather
/// than leaving the collision with id `0` unspecified.
pub fn interpreter_cache_key(interpreter_id: i64) -> Option<i64> {
    if interpreter_id < 0 {
        None
    } else {
        Some(interpreter_id + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidate_all_clears_everything() {
        let mut cache: Cache<u64, u32> = Cache::new(4);
        cache.put(1, 10);
        cache.put(2, 20);
        assert_eq!(cache.len(), 2);
        cache.invalidate_all();
        assert!(cache.is_empty());
        assert!(cache.get(&1).is_none());
    }

    #[test]
    fn eviction_respects_capacity() {
        let mut cache: Cache<u64, u32> = Cache::new(2);
        cache.put(1, 10);
        cache.put(2, 20);
        cache.put(3, 30);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&1).is_none(), "oldest entry should be evicted");
    }

    #[test]
    fn negative_interpreter_id_rejected() {
        assert_eq!(interpreter_cache_key(-1), None);
        assert_eq!(interpreter_cache_key(0), Some(1));
        assert_eq!(interpreter_cache_key(5), Some(6));
    }
}
