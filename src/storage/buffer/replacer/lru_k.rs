use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::common::types::FrameId;

struct FrameRecord {
    /// Most recent K access timestamps, oldest first
    history: VecDeque<u64>,
    evictable: bool,
}

struct LruKInner {
    current_timestamp: u64,
    evictable_count: usize,
    records: HashMap<FrameId, FrameRecord>,
}

/// LRU-K replacement policy: the victim is the evictable frame with the
/// greatest backward K-distance, i.e. the one whose Kth most recent access
/// lies furthest in the past. Frames with fewer than K recorded accesses
/// have infinite distance and are always preferred; ties among them break
/// by the oldest recorded timestamp.
pub struct LruKReplacer {
    num_frames: usize,
    k: usize,
    inner: Mutex<LruKInner>,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k >= 1, "replacer K must be at least 1");
        Self {
            num_frames,
            k,
            inner: Mutex::new(LruKInner {
                current_timestamp: 0,
                evictable_count: 0,
                records: HashMap::new(),
            }),
        }
    }

    /// Record an access to the given frame at the next timestamp.
    /// New frames start out non-evictable.
    pub fn record_access(&self, frame_id: FrameId) {
        assert!(
            (frame_id as usize) < self.num_frames,
            "frame id {} out of range",
            frame_id
        );
        let inner = &mut *self.inner.lock();
        inner.current_timestamp += 1;
        let ts = inner.current_timestamp;

        let record = inner.records.entry(frame_id).or_insert_with(|| FrameRecord {
            history: VecDeque::new(),
            evictable: false,
        });
        record.history.push_back(ts);
        if record.history.len() > self.k {
            record.history.pop_front();
        }
    }

    /// Flip a frame's evictable flag. Unknown frames are ignored.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        assert!(
            (frame_id as usize) < self.num_frames,
            "frame id {} out of range",
            frame_id
        );
        let inner = &mut *self.inner.lock();
        if let Some(record) = inner.records.get_mut(&frame_id) {
            if record.evictable != evictable {
                record.evictable = evictable;
                if evictable {
                    inner.evictable_count += 1;
                } else {
                    inner.evictable_count -= 1;
                }
            }
        }
    }

    /// Drop a frame's history entirely. Panics if the frame is tracked and
    /// currently non-evictable; absent frames are a no-op.
    pub fn remove(&self, frame_id: FrameId) {
        let inner = &mut *self.inner.lock();
        let evictable = match inner.records.get(&frame_id) {
            None => return,
            Some(record) => record.evictable,
        };
        assert!(
            evictable,
            "cannot remove non-evictable frame {}",
            frame_id
        );
        inner.records.remove(&frame_id);
        inner.evictable_count -= 1;
    }

    /// Select and remove the victim frame, or None if nothing is evictable
    pub fn evict(&self) -> Option<FrameId> {
        let inner = &mut *self.inner.lock();
        let mut victim: Option<(FrameId, bool, u64)> = None;

        for (&frame_id, record) in inner.records.iter() {
            if !record.evictable {
                continue;
            }
            // Infinite distance when the history is shorter than K;
            // otherwise the capped deque's front is the Kth most recent
            // access, so the greatest distance is the smallest front.
            let infinite = record.history.len() < self.k;
            let oldest = *record.history.front().expect("tracked frame has history");
            let better = match victim {
                None => true,
                Some((_, best_inf, best_oldest)) => match (infinite, best_inf) {
                    (true, false) => true,
                    (false, true) => false,
                    _ => oldest < best_oldest,
                },
            };
            if better {
                victim = Some((frame_id, infinite, oldest));
            }
        }

        let (frame_id, _, _) = victim?;
        inner.records.remove(&frame_id);
        inner.evictable_count -= 1;
        Some(frame_id)
    }

    /// Number of evictable frames
    pub fn size(&self) -> usize {
        self.inner.lock().evictable_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evict_prefers_short_history() {
        let replacer = LruKReplacer::new(7, 2);
        // Frame 1 accessed twice, frames 2 and 3 once
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.record_access(3);
        replacer.record_access(1);
        for f in [1, 2, 3] {
            replacer.set_evictable(f, true);
        }
        assert_eq!(replacer.size(), 3);

        // Both 2 and 3 have infinite distance; 2 was seen first
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_evict_order_by_backward_k_distance() {
        // Frames 1..6 accessed twice each in two rounds; the Kth most
        // recent access of frame f is its first-round timestamp, so frame
        // 1 has the greatest backward distance and goes first.
        let replacer = LruKReplacer::new(7, 2);
        for f in 1..=6 {
            replacer.record_access(f);
        }
        for f in 1..=6 {
            replacer.record_access(f);
        }
        for f in 1..=6 {
            replacer.set_evictable(f, true);
        }
        assert_eq!(replacer.size(), 6);

        for expected in 1..=6 {
            assert_eq!(replacer.evict(), Some(expected));
        }
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_non_evictable_is_skipped() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.set_evictable(1, true);

        // Frame 0 is non-evictable, so frame 1 wins despite its newer access
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(0, true);
        assert_eq!(replacer.evict(), Some(0));
    }

    #[test]
    fn test_size_tracks_evictable_flag() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0);
        replacer.record_access(1);
        assert_eq!(replacer.size(), 0);

        replacer.set_evictable(0, true);
        replacer.set_evictable(1, true);
        assert_eq!(replacer.size(), 2);

        replacer.set_evictable(0, false);
        assert_eq!(replacer.size(), 1);
        // Repeated flips do not double count
        replacer.set_evictable(1, true);
        assert_eq!(replacer.size(), 1);
    }

    #[test]
    fn test_remove_clears_history() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.set_evictable(0, true);
        replacer.set_evictable(1, true);

        replacer.remove(0);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);

        // Removing an untracked frame is a no-op
        replacer.remove(3);
    }

    #[test]
    #[should_panic(expected = "non-evictable")]
    fn test_remove_pinned_frame_panics() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0);
        replacer.remove(0);
    }

    #[test]
    fn test_reaccess_after_evict_starts_fresh() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0);
        replacer.record_access(0);
        replacer.set_evictable(0, true);
        assert_eq!(replacer.evict(), Some(0));

        // The frame returns with an empty history: infinite distance again
        replacer.record_access(1);
        replacer.record_access(1);
        replacer.record_access(0);
        replacer.set_evictable(0, true);
        replacer.set_evictable(1, true);
        assert_eq!(replacer.evict(), Some(0));
    }
}
