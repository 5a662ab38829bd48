//! Row cache for embedding shards.
//!
//! Models the fast-memory cache tier the planner can place in front of a
//! shard (`CacheParams`). Capacity is `load_factor × shard rows`; rows
//! entering an fp16 cache tier are rounded to fp16 mantissa precision.

use std::num::NonZeroUsize;

use ahash::AHashMap;
use lru::LruCache;

use crate::config::{CacheAlgorithm, CacheParams, DataType};
use crate::kernel::round_to_fp16;

enum Entries {
    Lru(LruCache<usize, Vec<f32>>),
    Lfu {
        rows: AHashMap<usize, (u64, Vec<f32>)>,
        capacity: usize,
    },
}

/// LRU or LFU row cache, keyed by shard-local row id.
pub struct RowCache {
    entries: Entries,
    precision: DataType,
}

impl RowCache {
    /// Build a cache sized for a shard with `shard_rows` rows.
    pub fn from_params(params: &CacheParams, shard_rows: usize) -> Self {
        let capacity = ((shard_rows as f32 * params.load_factor).ceil() as usize).max(1);
        let entries = match params.algorithm {
            CacheAlgorithm::Lru => {
                let cap = NonZeroUsize::new(capacity).expect("capacity is >= 1");
                Entries::Lru(LruCache::new(cap))
            }
            CacheAlgorithm::Lfu => Entries::Lfu {
                rows: AHashMap::with_capacity(capacity),
                capacity,
            },
        };
        Self {
            entries,
            precision: params.precision,
        }
    }

    /// Apply this tier's storage precision to a row about to enter it.
    /// The caller hands out the same rounded row, so a hit and the miss
    /// that filled it agree.
    pub fn apply_precision(&self, row: &mut [f32]) {
        if self.precision == DataType::Fp16 {
            for x in row {
                *x = round_to_fp16(*x);
            }
        }
    }

    pub fn get(&mut self, row_id: usize) -> Option<&[f32]> {
        match &mut self.entries {
            Entries::Lru(cache) => cache.get(&row_id).map(|v| v.as_slice()),
            Entries::Lfu { rows, .. } => rows.get_mut(&row_id).map(|entry| {
                entry.0 += 1;
                entry.1.as_slice()
            }),
        }
    }

    pub fn put(&mut self, row_id: usize, row: Vec<f32>) {
        match &mut self.entries {
            Entries::Lru(cache) => {
                cache.put(row_id, row);
            }
            Entries::Lfu { rows, capacity } => {
                if rows.len() >= *capacity && !rows.contains_key(&row_id) {
                    // Evict the least-frequently-used entry.
                    if let Some(victim) = rows
                        .iter()
                        .min_by_key(|(_, (count, _))| *count)
                        .map(|(id, _)| *id)
                    {
                        rows.remove(&victim);
                    }
                }
                rows.entry(row_id).or_insert((0, row)).0 += 1;
            }
        }
    }

    pub fn capacity(&self) -> usize {
        match &self.entries {
            Entries::Lru(cache) => cache.cap().get(),
            Entries::Lfu { capacity, .. } => *capacity,
        }
    }

    pub fn len(&self) -> usize {
        match &self.entries {
            Entries::Lru(cache) => cache.len(),
            Entries::Lfu { rows, .. } => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(algorithm: CacheAlgorithm, load_factor: f32) -> CacheParams {
        CacheParams {
            algorithm,
            load_factor,
            reserved_memory: 0.0,
            precision: DataType::Fp32,
        }
    }

    #[test]
    fn lru_evicts_oldest() {
        let mut cache = RowCache::from_params(&params(CacheAlgorithm::Lru, 0.5), 4);
        cache.put(0, vec![0.0]);
        cache.put(1, vec![1.0]);
        cache.put(2, vec![2.0]); // capacity 2: evicts row 0
        assert!(cache.get(0).is_none());
        assert_eq!(cache.get(2), Some(&[2.0][..]));
    }

    #[test]
    fn lfu_keeps_hot_rows() {
        let mut cache = RowCache::from_params(&params(CacheAlgorithm::Lfu, 0.5), 4);
        cache.put(0, vec![0.0]);
        cache.get(0);
        cache.get(0);
        cache.put(1, vec![1.0]);
        cache.put(2, vec![2.0]); // capacity 2: row 1 is the cold victim
        assert!(cache.get(0).is_some());
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn capacity_never_drops_to_zero() {
        let cache = RowCache::from_params(&params(CacheAlgorithm::Lru, 0.01), 4);
        assert!(cache.is_empty());
        // load_factor 0.01 over 4 rows still yields a one-row cache
        assert_eq!(cache.capacity(), 1);
    }

    #[test]
    fn fp16_tier_rounds_rows() {
        let mut fp16 = params(CacheAlgorithm::Lru, 1.0);
        fp16.precision = DataType::Fp16;
        let cache = RowCache::from_params(&fp16, 4);
        let mut row = vec![0.123_456_78f32, 1.0];
        cache.apply_precision(&mut row);
        assert_ne!(row[0], 0.123_456_78f32);
        assert_eq!(row[1], 1.0);

        // fp32 tier leaves rows untouched
        let plain = RowCache::from_params(&params(CacheAlgorithm::Lru, 1.0), 4);
        let mut untouched = vec![0.123_456_78f32];
        plain.apply_precision(&mut untouched);
        assert_eq!(untouched[0], 0.123_456_78f32);
    }
}
