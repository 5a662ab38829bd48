//! Column-wise sharding: each table's embedding dim split across
//! destinations.
//!
//! Every destination holding a column shard receives the feature's full
//! id list (replication), gathers its column slice, and the output
//! distributor stitches the slices back together per value. Shards fill
//! column blocks in placement order; `features_to_permute_indices` is the
//! hook for reordering blocks when a placement lands out of dim order.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::SequenceShardingContext;
use crate::error::{EmxError, EmxResult};
use crate::kernel::{DenseShard, ShardMeta};
use crate::lookup::{GroupedEmbeddingLookup, GroupedLookup, LookupOutput, RankShards};
use crate::sparse::{JaggedTensor, KeyedJaggedTensor};

use super::{DistResult, EmbeddingShardingInfo, InputDist, OutputDist, ShardingEnv};

pub struct CwSharding {
    infos: Vec<EmbeddingShardingInfo>,
    world: usize,
    dim: usize,
    shard_cols: usize,
    /// Per-feature column-block order override; identity when absent.
    features_to_permute_indices: HashMap<String, Vec<usize>>,
}

impl CwSharding {
    pub fn new(infos: Vec<EmbeddingShardingInfo>, env: &ShardingEnv) -> EmxResult<Self> {
        let dim = infos[0].table.embedding_dim;
        let shards_per_table = infos[0].sharding.ranks.len();
        if shards_per_table == 0 || dim % shards_per_table != 0 {
            return Err(EmxError::Config(format!(
                "dim {} cannot split into {} column shards",
                dim, shards_per_table
            )));
        }
        for info in &infos {
            if info.sharding.ranks.len() != shards_per_table {
                return Err(EmxError::Config(format!(
                    "column-wise group expects {} shards per table but table '{}' names {}",
                    shards_per_table,
                    info.table.name,
                    info.sharding.ranks.len()
                )));
            }
            let mut seen = vec![false; env.world_size()];
            for &rank in &info.sharding.ranks {
                if rank >= env.world_size() {
                    return Err(EmxError::Config(format!(
                        "table '{}' placed on rank {} outside world of size {}",
                        info.table.name,
                        rank,
                        env.world_size()
                    )));
                }
                if seen[rank] {
                    return Err(EmxError::Config(format!(
                        "table '{}' places two column shards on rank {}",
                        info.table.name, rank
                    )));
                }
                seen[rank] = true;
            }
        }
        Ok(Self {
            infos,
            world: env.world_size(),
            dim,
            shard_cols: dim / shards_per_table,
            features_to_permute_indices: HashMap::new(),
        })
    }

    /// Install a per-feature column-block reordering (placement arrived
    /// out of dim order).
    pub fn set_feature_permute(&mut self, feature: impl Into<String>, order: Vec<usize>) {
        self.features_to_permute_indices.insert(feature.into(), order);
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
            for &rank in &info.sharding.ranks {
                per_rank[rank].extend(info.table.feature_names.iter().cloned());
            }
        }
        per_rank
    }

    pub fn create_input_dist(&self) -> EmxResult<InputDist> {
        let mut feature_to_ranks = HashMap::new();
        for info in &self.infos {
            for feature in &info.table.feature_names {
                feature_to_ranks.insert(feature.clone(), info.sharding.ranks.clone());
            }
        }
        Ok(InputDist::ColumnWise(CwInputDist {
            world: self.world,
            feature_to_ranks,
        }))
    }

    pub fn create_lookup(&self) -> EmxResult<GroupedEmbeddingLookup> {
        let mut per_rank: Vec<(HashMap<String, Arc<DenseShard>>, Vec<Arc<DenseShard>>)> =
            (0..self.world).map(|_| (HashMap::new(), Vec::new())).collect();
        for info in &self.infos {
            let rows = info.table.num_embeddings;
            for (s, &rank) in info.sharding.ranks.iter().enumerate() {
                let col_offset = s * self.shard_cols;
                let mut data = Vec::with_capacity(rows * self.shard_cols);
                for r in 0..rows {
                    let row = &info.weights[r * self.dim..(r + 1) * self.dim];
                    data.extend_from_slice(&row[col_offset..col_offset + self.shard_cols]);
                }
                let shard = Arc::new(
                    DenseShard::new(
                        ShardMeta {
                            table: info.table.name.clone(),
                            row_offset: 0,
                            rows,
                            col_offset,
                            cols: self.shard_cols,
                        },
                        data,
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
        }
        Ok(GroupedLookup::new(
            self.shard_cols,
            per_rank
                .into_iter()
                .map(|(by_feature, shards)| RankShards::new(by_feature, shards))
                .collect(),
        ))
    }

    pub fn create_output_dist(&self) -> EmxResult<OutputDist> {
        let mut feature_shard_ranks = Vec::new();
        for info in &self.infos {
            for feature in &info.table.feature_names {
                feature_shard_ranks.push((feature.clone(), info.sharding.ranks.clone()));
            }
        }
        Ok(OutputDist::ColumnWise(CwOutputDist {
            feature_shard_ranks,
            shard_cols: self.shard_cols,
            dim: self.dim,
            features_to_permute_indices: self.features_to_permute_indices.clone(),
        }))
    }
}

pub struct CwInputDist {
    world: usize,
    feature_to_ranks: HashMap<String, Vec<usize>>,
}

impl CwInputDist {
    /// Replicate each feature's ids to every rank holding one of its
    /// column shards.
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
            let ranks = self.feature_to_ranks.get(key).ok_or_else(|| {
                EmxError::InvariantViolation(format!(
                    "feature '{}' is not assigned to this column-wise group",
                    key
                ))
            })?;
            for &rank in ranks {
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

pub struct CwOutputDist {
    /// Feature → ranks holding its column shards, placement order.
    feature_shard_ranks: Vec<(String, Vec<usize>)>,
    shard_cols: usize,
    dim: usize,
    features_to_permute_indices: HashMap<String, Vec<usize>>,
}

impl CwOutputDist {
    pub fn assemble(
        &self,
        outputs: &[LookupOutput],
        ctx: &SequenceShardingContext,
        need_indices: bool,
    ) -> EmxResult<HashMap<String, JaggedTensor>> {
        let before = &ctx.features_before_input_dist;
        let before_offsets = before.offset_per_key();
        let mut result = HashMap::new();

        for (feature, ranks) in &self.feature_shard_ranks {
            let k = before
                .keys()
                .iter()
                .position(|key| key == feature)
                .ok_or_else(|| {
                    EmxError::InvariantViolation(format!(
                        "feature '{}' missing from pre-distribution batch",
                        feature
                    ))
                })?;
            let rows = before_offsets[k + 1] - before_offsets[k];
            let mut values = vec![0.0f32; rows * self.dim];

            let block_order = self.features_to_permute_indices.get(feature);
            for (s, &rank) in ranks.iter().enumerate() {
                let output = outputs.get(rank).ok_or_else(|| {
                    EmxError::InvariantViolation(format!(
                        "no raw output for rank {} of feature '{}'",
                        rank, feature
                    ))
                })?;
                let kjt = &ctx.features[rank];
                let rank_offsets = kjt.offset_per_key();
                let rk = kjt
                    .keys()
                    .iter()
                    .position(|key| key == feature)
                    .ok_or_else(|| {
                        EmxError::InvariantViolation(format!(
                            "rank {} batch is missing feature '{}'",
                            rank, feature
                        ))
                    })?;
                if rank_offsets[rk + 1] - rank_offsets[rk] != rows {
                    return Err(EmxError::InvariantViolation(format!(
                        "rank {} holds {} rows of feature '{}', expected {}",
                        rank,
                        rank_offsets[rk + 1] - rank_offsets[rk],
                        feature,
                        rows
                    )));
                }
                let block = block_order.map_or(s, |order| order[s]);
                let col_offset = block * self.shard_cols;
                for r in 0..rows {
                    let src_row = (rank_offsets[rk] + r) * self.shard_cols;
                    values[r * self.dim + col_offset..r * self.dim + col_offset + self.shard_cols]
                        .copy_from_slice(&output.values[src_row..src_row + self.shard_cols]);
                }
            }

            let ids = &before.values()[before_offsets[k]..before_offsets[k + 1]];
            let weights = need_indices.then(|| ids.iter().map(|&id| id as f32).collect());
            result.insert(
                feature.clone(),
                JaggedTensor::new(
                    before.lengths_for_key(k).to_vec(),
                    values,
                    self.dim,
                    weights,
                )?,
            );
        }
        Ok(result)
    }

    /// Inverse of [`CwOutputDist::assemble`]: slice each feature's
    /// full-width gradient into per-destination column blocks.
    pub fn backward(
        &self,
        grads: &HashMap<String, JaggedTensor>,
        ctx: &SequenceShardingContext,
    ) -> EmxResult<Vec<Vec<f32>>> {
        let mut out: Vec<Vec<f32>> = ctx
            .features
            .iter()
            .map(|kjt| vec![0.0f32; kjt.values().len() * self.shard_cols])
            .collect();

        for (feature, ranks) in &self.feature_shard_ranks {
            let grad = grads.get(feature).ok_or_else(|| {
                EmxError::InvariantViolation(format!("gradient missing for feature '{}'", feature))
            })?;
            if grad.dim() != self.dim {
                return Err(EmxError::InvariantViolation(format!(
                    "gradient for feature '{}' has dim {}, expected {}",
                    feature,
                    grad.dim(),
                    self.dim
                )));
            }
            let block_order = self.features_to_permute_indices.get(feature);
            for (s, &rank) in ranks.iter().enumerate() {
                let kjt = &ctx.features[rank];
                let rank_offsets = kjt.offset_per_key();
                let rk = kjt
                    .keys()
                    .iter()
                    .position(|key| key == feature)
                    .ok_or_else(|| {
                        EmxError::InvariantViolation(format!(
                            "rank {} batch is missing feature '{}'",
                            rank, feature
                        ))
                    })?;
                let rows = rank_offsets[rk + 1] - rank_offsets[rk];
                if rows != grad.rows() {
                    return Err(EmxError::InvariantViolation(format!(
                        "gradient for feature '{}' holds {} rows, rank {} expects {}",
                        feature,
                        grad.rows(),
                        rank,
                        rows
                    )));
                }
                let block = block_order.map_or(s, |order| order[s]);
                let col_offset = block * self.shard_cols;
                for r in 0..rows {
                    let dst_row = (rank_offsets[rk] + r) * self.shard_cols;
                    out[rank][dst_row..dst_row + self.shard_cols].copy_from_slice(
                        &grad.values()
                            [r * self.dim + col_offset..r * self.dim + col_offset + self.shard_cols],
                    );
                }
            }
        }
        Ok(out)
    }
}
