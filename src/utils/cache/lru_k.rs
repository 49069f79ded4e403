use std::collections::{HashMap, HashSet, VecDeque};

use log::warn;

use crate::buffer::FrameId;
use crate::error::{GistError, GistResult};
use crate::utils::cache::Replacer;

const DEFAULT_K: usize = 2;

/// LRU-K over a logical access clock. Frames with fewer than K recorded
/// accesses have infinite backward K-distance and go first, oldest first.
#[derive(Debug)]
pub struct LruKReplacer {
    k: usize,
    capacity: usize,
    clock: u64,
    access_history: HashMap<FrameId, VecDeque<u64>>,
    evictable_frames: HashSet<FrameId>,
}

impl LruKReplacer {
    pub fn with_k(capacity: usize, k: usize) -> Self {
        LruKReplacer {
            k: k.max(1),
            capacity,
            clock: 0,
            access_history: HashMap::new(),
            evictable_frames: HashSet::new(),
        }
    }
}

impl Replacer for LruKReplacer {
    fn new(capacity: usize) -> Self {
        Self::with_k(capacity, DEFAULT_K)
    }

    fn record_access(&mut self, frame_id: FrameId) -> GistResult<()> {
        if frame_id >= self.capacity {
            return Err(GistError::Internal(format!(
                "frame {} out of replacer range {}",
                frame_id, self.capacity
            )));
        }
        self.clock += 1;
        let history = self.access_history.entry(frame_id).or_default();
        history.push_back(self.clock);
        if history.len() > self.k {
            history.pop_front();
        }
        Ok(())
    }

    fn evict(&mut self) -> Option<FrameId> {
        // (has infinite distance, oldest timestamp) ordering
        let mut victim: Option<(bool, u64, FrameId)> = None;
        for frame_id in self.evictable_frames.iter() {
            let Some(history) = self.access_history.get(frame_id) else {
                warn!("evictable frame {} has no access history", frame_id);
                continue;
            };
            let Some(oldest) = history.front() else {
                continue;
            };
            let infinite = history.len() < self.k;
            let better = match victim {
                None => true,
                Some((v_inf, v_ts, _)) => (infinite && !v_inf) || (infinite == v_inf && *oldest < v_ts),
            };
            if better {
                victim = Some((infinite, *oldest, *frame_id));
            }
        }
        let (_, _, frame_id) = victim?;
        self.remove(frame_id);
        Some(frame_id)
    }

    fn set_evictable(&mut self, frame_id: FrameId, set_evictable: bool) -> GistResult<()> {
        if set_evictable {
            // a frame handed out by `evict` and then found pinned comes back
            // without history
            if !self.access_history.contains_key(&frame_id) {
                self.record_access(frame_id)?;
            }
            self.evictable_frames.insert(frame_id);
        } else {
            self.evictable_frames.remove(&frame_id);
        }
        Ok(())
    }

    fn remove(&mut self, frame_id: FrameId) {
        self.evictable_frames.remove(&frame_id);
        self.access_history.remove(&frame_id);
    }

    fn size(&self) -> usize {
        self.evictable_frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infinite_distance_frames_go_first() {
        let mut replacer = LruKReplacer::new(8);
        replacer.record_access(1).unwrap();
        replacer.record_access(2).unwrap();
        replacer.record_access(3).unwrap();
        replacer.record_access(2).unwrap();
        replacer.record_access(3).unwrap();
        for f in 1..=3 {
            replacer.set_evictable(f, true).unwrap();
        }
        assert_eq!(replacer.size(), 3);
        // 1 has a single access, then 2 has the older second-to-last access
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn pinned_frames_are_skipped() {
        let mut replacer = LruKReplacer::new(4);
        replacer.record_access(1).unwrap();
        replacer.record_access(2).unwrap();
        replacer.set_evictable(1, true).unwrap();
        replacer.set_evictable(2, true).unwrap();
        replacer.set_evictable(1, false).unwrap();
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), None);
        replacer.set_evictable(1, true).unwrap();
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn remove_forgets_history() {
        let mut replacer = LruKReplacer::with_k(2, 1);
        replacer.record_access(1).unwrap();
        replacer.set_evictable(1, true).unwrap();
        replacer.remove(1);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
        replacer.set_evictable(1, true).unwrap();
        assert_eq!(replacer.evict(), Some(1));
        assert!(replacer.record_access(5).is_err());
    }
}
