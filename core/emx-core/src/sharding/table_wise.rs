//! Table-wise sharding: each table lives whole on a single destination.
//!
//! Input distribution routes every feature's full jagged slice to the
//! rank owning its table. Output distribution is shape-only: the owning
//! rank already holds the complete per-key answer, so reassembly is a
//! `length_per_key` split with no cross-destination traffic.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::SequenceShardingContext;
use crate::error::{EmxError, EmxResult};
use crate::kernel::{DenseShard, ShardMeta};
use crate::lookup::{GroupedEmbeddingLookup, GroupedLookup, LookupOutput, RankShards};
use crate::sparse::{JaggedTensor, KeyedJaggedTensor};

use super::{DistResult, EmbeddingShardingInfo, InputDist, OutputDist, ShardingEnv};

pub struct TwSharding {
    infos: Vec<EmbeddingShardingInfo>,
    world: usize,
    dim: usize,
}

impl TwSharding {
    pub fn new(infos: Vec<EmbeddingShardingInfo>, env: &ShardingEnv) -> EmxResult<Self> {
        let dim = infos[0].table.embedding_dim;
        for info in &infos {
            if info.sharding.ranks.len() != 1 {
                return Err(EmxError::Config(format!(
                    "table-wise table '{}' must name exactly one rank",
                    info.table.name
                )));
            }
            let rank = info.sharding.ranks[0];
            if rank >= env.world_size() {
                return Err(EmxError::Config(format!(
                    "table '{}' placed on rank {} outside world of size {}",
                    info.table.name,
                    rank,
                    env.world_size()
                )));
            }
        }
        Ok(Self {
            infos,
            world: env.world_size(),
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
        for info in &self.infos {
            per_rank[info.sharding.ranks[0]]
                .extend(info.table.feature_names.iter().cloned());
        }
        per_rank
    }

    pub fn create_input_dist(&self) -> EmxResult<InputDist> {
        let mut feature_to_rank = HashMap::new();
        for info in &self.infos {
            for feature in &info.table.feature_names {
                feature_to_rank.insert(feature.clone(), info.sharding.ranks[0]);
            }
        }
        Ok(InputDist::TableWise(TwInputDist::new(self.world, feature_to_rank)))
    }

    pub fn create_lookup(&self) -> EmxResult<GroupedEmbeddingLookup> {
        let mut per_rank: Vec<(HashMap<String, Arc<DenseShard>>, Vec<Arc<DenseShard>>)> =
            (0..self.world).map(|_| (HashMap::new(), Vec::new())).collect();
        for info in &self.infos {
            let rank = info.sharding.ranks[0];
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
                per_rank[rank].0.insert(feature.clone(), shard.clone());
            }
            per_rank[rank].1.push(shard);
        }
        Ok(GroupedLookup::new(
            self.dim,
            per_rank
                .into_iter()
                .map(|(by_feature, shards)| RankShards::new(by_feature, shards))
                .collect(),
        ))
    }

    pub fn create_output_dist(&self) -> EmxResult<OutputDist> {
        Ok(OutputDist::TableWise(TwOutputDist {}))
    }
}

pub struct TwInputDist {
    world: usize,
    feature_to_rank: HashMap<String, usize>,
}

impl TwInputDist {
    pub(crate) fn new(world: usize, feature_to_rank: HashMap<String, usize>) -> Self {
        Self {
            world,
            feature_to_rank,
        }
    }

    pub fn distribute(&self, features: &KeyedJaggedTensor) -> EmxResult<DistResult> {
        let stride = features.stride();
        let offsets = features.offset_per_key();
        let has_weights = features.weights().is_some();

        struct RankBuffer {
            keys: Vec<String>,
            values: Vec<i64>,
            lengths: Vec<usize>,
            weights: Vec<f32>,
        }
        let mut buffers: Vec<RankBuffer> = (0..self.world)
            .map(|_| RankBuffer {
                keys: Vec::new(),
                values: Vec::new(),
                lengths: Vec::new(),
                weights: Vec::new(),
            })
            .collect();

        for (k, key) in features.keys().iter().enumerate() {
            let rank = *self.feature_to_rank.get(key).ok_or_else(|| {
                EmxError::InvariantViolation(format!(
                    "feature '{}' is not assigned to this table-wise group",
                    key
                ))
            })?;
            let buffer = &mut buffers[rank];
            buffer.keys.push(key.clone());
            buffer
                .values
                .extend_from_slice(&features.values()[offsets[k]..offsets[k + 1]]);
            buffer.lengths.extend_from_slice(features.lengths_for_key(k));
            if let Some(w) = features.weights() {
                buffer.weights.extend_from_slice(&w[offsets[k]..offsets[k + 1]]);
            }
        }

        let mut out = Vec::with_capacity(self.world);
        for buffer in buffers {
            let kjt = if buffer.keys.is_empty() {
                KeyedJaggedTensor::empty(stride)
            } else {
                KeyedJaggedTensor::from_lengths(
                    buffer.keys,
                    buffer.values,
                    buffer.lengths,
                    has_weights.then_some(buffer.weights),
                )?
            };
            out.push(Arc::new(kjt));
        }
        Ok(DistResult {
            features: out,
            unbucketize_permute: None,
        })
    }
}

pub struct TwOutputDist {}

impl TwOutputDist {
    pub fn assemble(
        &self,
        outputs: &[LookupOutput],
        ctx: &SequenceShardingContext,
        need_indices: bool,
    ) -> EmxResult<HashMap<String, JaggedTensor>> {
        if outputs.len() != ctx.features.len() {
            return Err(EmxError::InvariantViolation(format!(
                "{} raw outputs for {} destinations",
                outputs.len(),
                ctx.features.len()
            )));
        }
        let mut result = HashMap::new();
        for (rank, output) in outputs.iter().enumerate() {
            let kjt = &ctx.features[rank];
            let offsets = kjt.offset_per_key();
            if output.rows() != *offsets.last().unwrap_or(&0) {
                return Err(EmxError::InvariantViolation(format!(
                    "rank {} produced {} rows for {} requested values",
                    rank,
                    output.rows(),
                    offsets.last().unwrap_or(&0)
                )));
            }
            for (k, key) in kjt.keys().iter().enumerate() {
                let ids = &kjt.values()[offsets[k]..offsets[k + 1]];
                let rows =
                    output.values[offsets[k] * output.cols..offsets[k + 1] * output.cols].to_vec();
                let weights =
                    need_indices.then(|| ids.iter().map(|&id| id as f32).collect());
                result.insert(
                    key.clone(),
                    JaggedTensor::new(
                        kjt.lengths_for_key(k).to_vec(),
                        rows,
                        output.cols,
                        weights,
                    )?,
                );
            }
        }
        Ok(result)
    }

    /// Inverse of [`TwOutputDist::assemble`]: turn per-feature output
    /// gradients into one raw gradient per destination, in the order the
    /// rank's lookup produced its rows.
    pub fn backward(
        &self,
        grads: &HashMap<String, JaggedTensor>,
        ctx: &SequenceShardingContext,
    ) -> EmxResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(ctx.features.len());
        for kjt in &ctx.features {
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

    fn sharding() -> (TwSharding, ShardingEnv) {
        let env = ShardingEnv::new_local(2).unwrap();
        let infos = vec![
            EmbeddingShardingInfo {
                table: Arc::new(
                    EmbeddingTableConfig::new("table_0", vec!["feature_0".to_string()], 2, 4)
                        .unwrap(),
                ),
                sharding: ParameterSharding::new(ShardingType::TableWise, vec![0]),
                weights: (0..8).map(|i| i as f32).collect(),
            },
            EmbeddingShardingInfo {
                table: Arc::new(
                    EmbeddingTableConfig::new("table_1", vec!["feature_1".to_string()], 2, 4)
                        .unwrap(),
                ),
                sharding: ParameterSharding::new(ShardingType::TableWise, vec![1]),
                weights: (100..108).map(|i| i as f32).collect(),
            },
        ];
        (TwSharding::new(infos, &env).unwrap(), env)
    }

    #[test]
    fn features_route_to_their_owning_rank() {
        let (sharding, _env) = sharding();
        let dist = match sharding.create_input_dist().unwrap() {
            InputDist::TableWise(d) => d,
            _ => unreachable!(),
        };
        let kjt = KeyedJaggedTensor::from_lengths(
            vec!["feature_0".to_string(), "feature_1".to_string()],
            vec![0, 1, 2, 3],
            vec![2, 0, 1, 1],
            None,
        )
        .unwrap();
        let result = dist.distribute(&kjt).unwrap();
        assert_eq!(result.features.len(), 2);
        assert_eq!(result.features[0].keys(), &["feature_0".to_string()]);
        assert_eq!(result.features[0].values(), &[0, 1]);
        assert_eq!(result.features[1].values(), &[2, 3]);
        assert!(result.unbucketize_permute.is_none());
    }

    #[test]
    fn embedding_names_per_rank_follow_placement() {
        let (sharding, _env) = sharding();
        assert_eq!(
            sharding.embedding_names_per_rank(),
            vec![vec!["feature_0".to_string()], vec!["feature_1".to_string()]]
        );
    }

    #[test]
    fn round_trip_through_lookup_and_output_dist() {
        let (sharding, _env) = sharding();
        let input_dist = sharding.create_input_dist().unwrap();
        let lookup = sharding.create_lookup().unwrap();
        let output_dist = sharding.create_output_dist().unwrap();

        let kjt = KeyedJaggedTensor::from_lengths(
            vec!["feature_0".to_string(), "feature_1".to_string()],
            vec![3, 0, 1],
            vec![1, 1, 1, 0],
            None,
        )
        .unwrap();
        let dist = input_dist.distribute(&kjt).unwrap();
        let outputs: Vec<LookupOutput> = (0..2)
            .map(|r| lookup.lookup(r, &dist.features[r]).unwrap())
            .collect();
        let ctx = SequenceShardingContext {
            features: dist.features,
            features_before_input_dist: Arc::new(kjt),
            unbucketize_permute: None,
        };
        let result = output_dist.assemble(&outputs, &ctx, false).unwrap();
        assert_eq!(result["feature_0"].row(0), &[6.0, 7.0]); // table_0 row 3
        assert_eq!(result["feature_0"].row(1), &[0.0, 1.0]); // table_0 row 0
        assert_eq!(result["feature_1"].row(0), &[102.0, 103.0]); // table_1 row 1
    }
}
