//! Data-parallel sharding: nothing is partitioned.
//!
//! Every rank holds a full replica; the local rank serves the whole
//! batch, so input distribution is a passthrough and output distribution
//! a shape-only split. In-process, replication is by reference: all
//! ranks share one shard, so one gradient application updates every
//! replica in lock-step.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::SequenceShardingContext;
use crate::error::{EmxError, EmxResult};
use crate::kernel::{DenseShard, ShardMeta};
use crate::lookup::{GroupedEmbeddingLookup, GroupedLookup, LookupOutput, RankShards};
use crate::sparse::{JaggedTensor, KeyedJaggedTensor};

use super::{DistResult, EmbeddingShardingInfo, InputDist, OutputDist, ShardingEnv};

pub struct DpSharding {
    infos: Vec<EmbeddingShardingInfo>,
    world: usize,
    local_rank: usize,
    dim: usize,
}

impl DpSharding {
    pub fn new(infos: Vec<EmbeddingShardingInfo>, env: &ShardingEnv) -> EmxResult<Self> {
        let dim = infos[0].table.embedding_dim;
        for info in &infos {
            for &rank in &info.sharding.ranks {
                if rank >= env.world_size() {
                    return Err(EmxError::Config(format!(
                        "table '{}' replicated to rank {} outside world of size {}",
                        info.table.name,
                        rank,
                        env.world_size()
                    )));
                }
            }
        }
        Ok(Self {
            infos,
            world: env.world_size(),
            local_rank: env.local_rank(),
            dim,
        })
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.infos
            .iter()
            .flat_map(|info| info.table.feature_names.iter().cloned())
            .collect()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.infos.iter().map(|i| i.table.name.clone()).collect()
    }

    pub fn embedding_names_per_rank(&self) -> Vec<Vec<String>> {
        let mut per_rank = vec![Vec::new(); self.world];
        per_rank[self.local_rank] = self.feature_names();
        per_rank
    }

    pub fn create_input_dist(&self) -> EmxResult<InputDist> {
        Ok(InputDist::DataParallel(DpInputDist {
            world: self.world,
            local_rank: self.local_rank,
        }))
    }

    pub fn create_lookup(&self) -> EmxResult<GroupedEmbeddingLookup> {
        // One shared replica: every rank's lookup table points at the
        // same shard, which is what keeps replicas in lock-step when the
        // averaged gradient is applied once.
        let mut by_feature: HashMap<String, Arc<DenseShard>> = HashMap::new();
        let mut shards = Vec::new();
        for info in &self.infos {
            let shard = Arc::new(
                DenseShard::new(
                    ShardMeta {
                        table: info.table.name.clone(),
                        row_offset: 0,
                        rows: info.table.num_embeddings,
                        col_offset: 0,
                        cols: self.dim,
                    },
                    info.weights.clone(),
                    info.sharding.cache_params.as_ref(),
                    info.sharding.bounds_check_mode,
                )?
                .with_hints(
                    info.sharding.stochastic_rounding,
                    info.sharding.enforce_in_fast_memory,
                ),
            );
            for feature in &info.table.feature_names {
                by_feature.insert(feature.clone(), shard.clone());
            }
            shards.push(shard);
        }
        let per_rank = (0..self.world)
            .map(|_| RankShards::new(by_feature.clone(), shards.clone()))
            .collect();
        Ok(GroupedLookup::new(self.dim, per_rank))
    }

    pub fn create_output_dist(&self) -> EmxResult<OutputDist> {
        Ok(OutputDist::DataParallel(DpOutputDist {
            local_rank: self.local_rank,
        }))
    }
}

pub struct DpInputDist {
    world: usize,
    local_rank: usize,
}

impl DpInputDist {
    /// Passthrough: the local replica serves the whole batch.
    pub fn distribute(&self, features: &KeyedJaggedTensor) -> EmxResult<DistResult> {
        let stride = features.stride();
        let mut out = Vec::with_capacity(self.world);
        for rank in 0..self.world {
            if rank == self.local_rank {
                out.push(Arc::new(features.clone()));
            } else {
                out.push(Arc::new(KeyedJaggedTensor::empty(stride)));
            }
        }
        Ok(DistResult {
            features: out,
            unbucketize_permute: None,
        })
    }
}

pub struct DpOutputDist {
    local_rank: usize,
}

impl DpOutputDist {
    pub fn assemble(
        &self,
        outputs: &[LookupOutput],
        ctx: &SequenceShardingContext,
        need_indices: bool,
    ) -> EmxResult<HashMap<String, JaggedTensor>> {
        let output = outputs.get(self.local_rank).ok_or_else(|| {
            EmxError::InvariantViolation(format!(
                "no raw output for local rank {}",
                self.local_rank
            ))
        })?;
        let kjt = ctx.features.get(self.local_rank).ok_or_else(|| {
            EmxError::MissingContext(format!(
                "no distributed features for local rank {}",
                self.local_rank
            ))
        })?;
        let offsets = kjt.offset_per_key();
        if output.rows() != *offsets.last().unwrap_or(&0) {
            return Err(EmxError::InvariantViolation(format!(
                "local rank produced {} rows for {} requested values",
                output.rows(),
                offsets.last().unwrap_or(&0)
            )));
        }
        let mut result = HashMap::new();
        for (k, key) in kjt.keys().iter().enumerate() {
            let ids = &kjt.values()[offsets[k]..offsets[k + 1]];
            let rows =
                output.values[offsets[k] * output.cols..offsets[k + 1] * output.cols].to_vec();
            let weights = need_indices.then(|| ids.iter().map(|&id| id as f32).collect());
            result.insert(
                key.clone(),
                JaggedTensor::new(kjt.lengths_for_key(k).to_vec(), rows, output.cols, weights)?,
            );
        }
        Ok(result)
    }

    /// Inverse of [`DpOutputDist::assemble`]: the local replica takes
    /// the whole gradient; other ranks saw no values and get none.
    pub fn backward(
        &self,
        grads: &HashMap<String, JaggedTensor>,
        ctx: &SequenceShardingContext,
    ) -> EmxResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(ctx.features.len());
        for (rank, kjt) in ctx.features.iter().enumerate() {
            if rank != self.local_rank {
                out.push(Vec::new());
                continue;
            }
            let offsets = kjt.offset_per_key();
            let mut raw = Vec::new();
            for (k, key) in kjt.keys().iter().enumerate() {
                let grad = grads.get(key).ok_or_else(|| {
                    EmxError::InvariantViolation(format!(
                        "gradient missing for feature '{}'",
                        key
                    ))
                })?;
                if grad.rows() != offsets[k + 1] - offsets[k] {
                    return Err(EmxError::InvariantViolation(format!(
                        "gradient for feature '{}' holds {} rows, expected {}",
                        key,
                        grad.rows(),
                        offsets[k + 1] - offsets[k]
                    )));
                }
                raw.extend_from_slice(grad.values());
            }
            out.push(raw);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingTableConfig;
    use crate::plan::{ParameterSharding, ShardingType};

    #[test]
    fn replicas_share_one_store() {
        let env = ShardingEnv::new_local(2).unwrap();
        let infos = vec![EmbeddingShardingInfo {
            table: Arc::new(
                EmbeddingTableConfig::new("table_0", vec!["feature_0".to_string()], 2, 4).unwrap(),
            ),
            sharding: ParameterSharding::new(ShardingType::DataParallel, vec![0, 1]),
            weights: (0..8).map(|i| i as f32).collect(),
        }];
        let sharding = DpSharding::new(infos, &env).unwrap();
        let lookup = sharding.create_lookup().unwrap();
        assert_eq!(lookup.unique_shards().len(), 1);
        assert!(Arc::ptr_eq(
            &lookup.shards_on_rank(0)[0],
            &lookup.shards_on_rank(1)[0]
        ));
    }

    #[test]
    fn passthrough_round_trip() {
        let env = ShardingEnv::new_local(2).unwrap();
        let infos = vec![EmbeddingShardingInfo {
            table: Arc::new(
                EmbeddingTableConfig::new("table_0", vec!["feature_0".to_string()], 2, 4).unwrap(),
            ),
            sharding: ParameterSharding::new(ShardingType::DataParallel, vec![0, 1]),
            weights: (0..8).map(|i| i as f32).collect(),
        }];
        let sharding = DpSharding::new(infos, &env).unwrap();
        let input_dist = sharding.create_input_dist().unwrap();
        let lookup = sharding.create_lookup().unwrap();
        let output_dist = sharding.create_output_dist().unwrap();

        let kjt = KeyedJaggedTensor::from_lengths(
            vec!["feature_0".to_string()],
            vec![1, 3],
            vec![1, 1],
            None,
        )
        .unwrap();
        let dist = input_dist.distribute(&kjt).unwrap();
        assert!(dist.features[1].values().is_empty());
        let outputs: Vec<LookupOutput> = (0..2)
            .map(|r| lookup.lookup(r, &dist.features[r]).unwrap())
            .collect();
        let ctx = SequenceShardingContext {
            features: dist.features,
            features_before_input_dist: Arc::new(kjt),
            unbucketize_permute: None,
        };
        let result = output_dist.assemble(&outputs, &ctx, false).unwrap();
        let jt = &result["feature_0"];
        assert_eq!(jt.row(0), &[2.0, 3.0]);
        assert_eq!(jt.row(1), &[6.0, 7.0]);
    }
}
