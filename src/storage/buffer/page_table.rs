use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

use parking_lot::Mutex;

struct Bucket<K, V> {
    local_depth: u32,
    items: Vec<(K, V)>,
}

struct TableInner<K, V> {
    global_depth: u32,
    /// Directory of 2^global_depth slots indexing into `buckets`.
    /// Several slots may share one bucket until it splits.
    dir: Vec<usize>,
    buckets: Vec<Bucket<K, V>>,
}

/// Extendible hash table keyed by the low `global_depth` bits of the hash.
/// The buffer pool uses it as its page table; traffic is light compared to
/// the pool latch, so the whole structure sits behind one mutex.
///
/// A bucket that fills to capacity splits immediately: its local depth
/// grows, the directory doubles if needed, and the items redistribute over
/// the newly significant hash bit.
pub struct ExtendibleHashTable<K, V, S = RandomState> {
    bucket_size: usize,
    hasher: S,
    inner: Mutex<TableInner<K, V>>,
}

impl<K, V> ExtendibleHashTable<K, V, RandomState>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(bucket_size: usize) -> Self {
        Self::with_hasher(bucket_size, RandomState::new())
    }
}

impl<K, V, S> ExtendibleHashTable<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    pub fn with_hasher(bucket_size: usize, hasher: S) -> Self {
        assert!(bucket_size >= 1, "bucket size must be at least 1");
        Self {
            bucket_size,
            hasher,
            inner: Mutex::new(TableInner {
                global_depth: 0,
                dir: vec![0],
                buckets: vec![Bucket {
                    local_depth: 0,
                    items: Vec::new(),
                }],
            }),
        }
    }

    /// Look up the value most recently inserted for `key`
    pub fn get(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        let slot = Self::slot_of(self.hash_of(key), inner.global_depth);
        let bucket = &inner.buckets[inner.dir[slot]];
        bucket
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Insert a key/value pair, replacing any previous value for the key.
    /// Splits the target bucket (doubling the directory as needed) while it
    /// sits at capacity.
    pub fn insert(&self, key: K, value: V) {
        let inner = &mut *self.inner.lock();
        let hash = self.hash_of(&key);

        let slot = Self::slot_of(hash, inner.global_depth);
        let bucket = &mut inner.buckets[inner.dir[slot]];
        if let Some(item) = bucket.items.iter_mut().find(|(k, _)| *k == key) {
            item.1 = value;
            return;
        }
        bucket.items.push((key, value));

        loop {
            let slot = Self::slot_of(hash, inner.global_depth);
            if inner.buckets[inner.dir[slot]].items.len() < self.bucket_size {
                break;
            }
            self.split(inner, slot);
        }
    }

    /// Remove a key; returns whether it was present
    pub fn remove(&self, key: &K) -> bool {
        let inner = &mut *self.inner.lock();
        let slot = Self::slot_of(self.hash_of(key), inner.global_depth);
        let bucket = &mut inner.buckets[inner.dir[slot]];
        match bucket.items.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                bucket.items.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn global_depth(&self) -> u32 {
        self.inner.lock().global_depth
    }

    pub fn local_depth(&self, slot: usize) -> u32 {
        let inner = self.inner.lock();
        inner.buckets[inner.dir[slot]].local_depth
    }

    pub fn num_buckets(&self) -> usize {
        self.inner.lock().buckets.len()
    }

    /// Split the bucket referenced by directory `slot` once
    fn split(&self, inner: &mut TableInner<K, V>, slot: usize) {
        let old = inner.dir[slot];
        inner.buckets[old].local_depth += 1;
        let local_depth = inner.buckets[old].local_depth;

        if local_depth > inner.global_depth {
            inner.global_depth += 1;
            // Double the directory: each slot replicated to its high twin
            let half = inner.dir.len();
            for i in 0..half {
                let target = inner.dir[i];
                inner.dir.push(target);
            }
        }

        // Sibling slot: the original low bits with the new bit set
        let high_bit = 1usize << (local_depth - 1);
        let sibling = (slot & (high_bit - 1)) | high_bit;
        let mask = (1usize << local_depth) - 1;

        let fresh = inner.buckets.len();
        inner.buckets.push(Bucket {
            local_depth,
            items: Vec::new(),
        });
        for i in 0..inner.dir.len() {
            if inner.dir[i] == old && (i & mask) == sibling {
                inner.dir[i] = fresh;
            }
        }

        // Redistribute the old bucket's items over the new bit
        let items = std::mem::take(&mut inner.buckets[old].items);
        for (k, v) in items {
            let h = self.hash_of(&k);
            if Self::slot_of(h, inner.global_depth) & mask == sibling {
                inner.buckets[fresh].items.push((k, v));
            } else {
                inner.buckets[old].items.push((k, v));
            }
        }
    }

    fn hash_of(&self, key: &K) -> u64 {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn slot_of(hash: u64, global_depth: u32) -> usize {
        (hash as usize) & ((1usize << global_depth) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hash that passes small integer keys through unchanged, so directory
    /// growth is predictable in tests
    #[derive(Default, Clone)]
    struct IdentityState;

    struct IdentityHasher(u64);

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }

        fn write(&mut self, bytes: &[u8]) {
            let mut buf = [0u8; 8];
            let n = bytes.len().min(8);
            buf[..n].copy_from_slice(&bytes[..n]);
            self.0 = u64::from_le_bytes(buf);
        }
    }

    impl BuildHasher for IdentityState {
        type Hasher = IdentityHasher;

        fn build_hasher(&self) -> IdentityHasher {
            IdentityHasher(0)
        }
    }

    fn identity_table(bucket_size: usize) -> ExtendibleHashTable<u32, char, IdentityState> {
        ExtendibleHashTable::with_hasher(bucket_size, IdentityState)
    }

    #[test]
    fn test_directory_growth() {
        let table = identity_table(2);

        table.insert(0, 'a');
        assert_eq!(table.global_depth(), 0);

        // Second key fills the lone bucket and forces the first split
        table.insert(1, 'b');
        assert_eq!(table.global_depth(), 1);
        assert_eq!(table.get(&0), Some('a'));
        assert_eq!(table.get(&1), Some('b'));

        table.insert(2, 'c');
        table.insert(3, 'd');
        assert_eq!(table.global_depth(), 2);
        assert_eq!(table.get(&0), Some('a'));
        assert_eq!(table.get(&1), Some('b'));
        assert_eq!(table.get(&2), Some('c'));
        assert_eq!(table.get(&3), Some('d'));
        assert_eq!(table.num_buckets(), 4);
    }

    #[test]
    fn test_insert_replaces_duplicate_key() {
        let table = identity_table(4);
        table.insert(7, 'a');
        table.insert(7, 'z');
        assert_eq!(table.get(&7), Some('z'));
        assert_eq!(table.num_buckets(), 1);
    }

    #[test]
    fn test_remove() {
        let table = identity_table(2);
        table.insert(1, 'a');
        table.insert(2, 'b');

        assert!(table.remove(&1));
        assert_eq!(table.get(&1), None);
        assert_eq!(table.get(&2), Some('b'));
        assert!(!table.remove(&1));
    }

    #[test]
    fn test_skewed_keys_split_repeatedly() {
        // Keys sharing low bits force several rounds of splitting before
        // the distinguishing bit becomes significant
        let table = identity_table(2);
        table.insert(0b000, 'a');
        table.insert(0b100, 'b');
        table.insert(0b1000, 'c');

        assert!(table.global_depth() >= 3);
        assert_eq!(table.get(&0b000), Some('a'));
        assert_eq!(table.get(&0b100), Some('b'));
        assert_eq!(table.get(&0b1000), Some('c'));
    }

    #[test]
    fn test_local_depth_bounded_by_global_depth() {
        let table = identity_table(2);
        for k in 0..32u32 {
            table.insert(k, '*');
        }
        let global = table.global_depth();
        for slot in 0..(1usize << global) {
            assert!(table.local_depth(slot) <= global);
        }
        for k in 0..32u32 {
            assert_eq!(table.get(&k), Some('*'));
        }
    }

    #[test]
    fn test_default_hasher_end_to_end() {
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(4);
        for k in 0..256u32 {
            table.insert(k, k * 10);
        }
        for k in (0..256u32).step_by(2) {
            assert!(table.remove(&k));
        }
        for k in 0..256u32 {
            let expected = if k % 2 == 0 { None } else { Some(k * 10) };
            assert_eq!(table.get(&k), expected);
        }
    }
}
