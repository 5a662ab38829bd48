//! Grouped lookups: one sharding group's shards, organized per rank.
//!
//! A lookup is stateless with respect to routing. It receives the
//! already-distributed features for one destination and returns one raw
//! tensor; which rank holds which rows was decided by the input
//! distributor, and putting the results back together is the output
//! distributor's job.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EmxError, EmxResult};
use crate::kernel::{DenseShard, QuantShard};
use crate::sparse::KeyedJaggedTensor;

/// Raw per-destination result, `rows × cols` row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupOutput {
    pub values: Vec<f32>,
    pub cols: usize,
}

impl LookupOutput {
    pub fn empty(cols: usize) -> Self {
        Self {
            values: Vec::new(),
            cols,
        }
    }

    pub fn rows(&self) -> usize {
        if self.cols == 0 {
            0
        } else {
            self.values.len() / self.cols
        }
    }
}

pub(crate) trait ShardGather: Send + Sync {
    fn gather(&self, ids: &[i64]) -> EmxResult<Vec<f32>>;
}

impl ShardGather for DenseShard {
    fn gather(&self, ids: &[i64]) -> EmxResult<Vec<f32>> {
        DenseShard::gather(self, ids)
    }
}

impl ShardGather for QuantShard {
    fn gather(&self, ids: &[i64]) -> EmxResult<Vec<f32>> {
        QuantShard::gather(self, ids)
    }
}

/// One rank's shards within a sharding group.
pub struct RankShards<S> {
    by_feature: HashMap<String, Arc<S>>,
    shards: Vec<Arc<S>>,
}

impl<S> RankShards<S> {
    pub fn new(by_feature: HashMap<String, Arc<S>>, shards: Vec<Arc<S>>) -> Self {
        Self { by_feature, shards }
    }

    pub fn empty() -> Self {
        Self {
            by_feature: HashMap::new(),
            shards: Vec::new(),
        }
    }
}

/// All shards of one sharding group, indexed by destination rank.
pub struct GroupedLookup<S> {
    cols: usize,
    per_rank: Vec<RankShards<S>>,
}

pub type GroupedEmbeddingLookup = GroupedLookup<DenseShard>;
pub type QuantEmbeddingLookup = GroupedLookup<QuantShard>;

impl<S> GroupedLookup<S> {
    pub fn new(cols: usize, per_rank: Vec<RankShards<S>>) -> Self {
        Self { cols, per_rank }
    }

    /// Output width per destination.
    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn world_size(&self) -> usize {
        self.per_rank.len()
    }

    /// Distinct shards on one rank, in placement order.
    pub fn shards_on_rank(&self, rank: usize) -> &[Arc<S>] {
        &self.per_rank[rank].shards
    }

    /// Every distinct shard in the group. Replicated placements (data
    /// parallel) appear once.
    pub fn unique_shards(&self) -> Vec<Arc<S>> {
        let mut out: Vec<Arc<S>> = Vec::new();
        for rank in &self.per_rank {
            for shard in &rank.shards {
                if !out.iter().any(|s| Arc::ptr_eq(s, shard)) {
                    out.push(shard.clone());
                }
            }
        }
        out
    }

    fn rank(&self, rank: usize) -> EmxResult<&RankShards<S>> {
        self.per_rank.get(rank).ok_or_else(|| {
            EmxError::Transport(format!(
                "rank {} outside lookup group of {} destinations",
                rank,
                self.per_rank.len()
            ))
        })
    }
}

impl<S: ShardGather> GroupedLookup<S> {
    /// Gather rows for one destination's distributed features.
    ///
    /// A feature with no values on this rank contributes nothing; a
    /// feature with values but no local shard is a routing failure.
    pub fn lookup(&self, rank: usize, features: &KeyedJaggedTensor) -> EmxResult<LookupOutput> {
        let shards = self.rank(rank)?;
        let offsets = features.offset_per_key();
        let mut values = Vec::with_capacity(features.values().len() * self.cols);
        for (k, key) in features.keys().iter().enumerate() {
            let ids = &features.values()[offsets[k]..offsets[k + 1]];
            match shards.by_feature.get(key) {
                Some(shard) => values.extend(shard.gather(ids)?),
                None if ids.is_empty() => {}
                None => {
                    return Err(EmxError::Lookup {
                        table: key.clone(),
                        message: format!("no shard on rank {} serves this feature", rank),
                    });
                }
            }
        }
        Ok(LookupOutput {
            values,
            cols: self.cols,
        })
    }
}

impl GroupedEmbeddingLookup {
    /// Backward of [`GroupedLookup::lookup`]: scatter-add the raw output
    /// gradient back into this rank's shard gradient buffers.
    pub fn backward(
        &self,
        rank: usize,
        features: &KeyedJaggedTensor,
        grad: &[f32],
    ) -> EmxResult<()> {
        if grad.len() != features.values().len() * self.cols {
            return Err(EmxError::InvariantViolation(format!(
                "raw gradient holds {} floats for {} values of {} cols",
                grad.len(),
                features.values().len(),
                self.cols
            )));
        }
        let shards = self.rank(rank)?;
        let offsets = features.offset_per_key();
        for (k, key) in features.keys().iter().enumerate() {
            let ids = &features.values()[offsets[k]..offsets[k + 1]];
            if ids.is_empty() {
                continue;
            }
            let shard = shards.by_feature.get(key).ok_or_else(|| EmxError::Lookup {
                table: key.clone(),
                message: format!("no shard on rank {} serves this feature", rank),
            })?;
            shard.scatter_add(ids, &grad[offsets[k] * self.cols..offsets[k + 1] * self.cols])?;
        }
        Ok(())
    }
}
