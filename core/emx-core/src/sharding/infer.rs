//! Inference-specialized shardings for quantized collections.
//!
//! Routing is identical to the trainable table-wise / row-wise variants;
//! only the lookup differs (u8 shards, dequantizing gather). Any other
//! sharding type is rejected at construction.

use std::collections::HashMap;
use std::sync::Arc;

use ahash::AHashMap;

use crate::config::EmbeddingTableConfig;
use crate::error::{EmxError, EmxResult};
use crate::kernel::{QuantShard, ShardMeta};
use crate::lookup::{GroupedLookup, QuantEmbeddingLookup, RankShards};
use crate::plan::{BucketizeMode, ParameterSharding, ShardingType};

use super::row_wise::{block_shard_extent, hash_shard_ids, routes_from};
use super::table_wise::TwInputDist;
use super::{InputDist, OutputDist, ShardingEnv};

/// One quantized table assigned to an inference sharding.
pub struct QuantShardingInfo {
    pub table: Arc<EmbeddingTableConfig>,
    pub sharding: ParameterSharding,
    pub bytes: Vec<u8>,
    pub scales: Vec<f32>,
    pub shifts: Vec<f32>,
}

/// Inference sharding: table-wise or row-wise only.
pub enum InferEmbeddingSharding {
    TableWise(InferTwSharding),
    RowWise(InferRwSharding),
}

/// Build the inference strategy for `sharding_type`; anything outside
/// the supported pair is a configuration error.
pub fn create_infer_embedding_sharding(
    sharding_type: ShardingType,
    infos: Vec<QuantShardingInfo>,
    env: &ShardingEnv,
) -> EmxResult<InferEmbeddingSharding> {
    if infos.is_empty() {
        return Err(EmxError::Config(format!(
            "sharding type {} has no assigned tables",
            sharding_type.as_str()
        )));
    }
    match sharding_type {
        ShardingType::TableWise => Ok(InferEmbeddingSharding::TableWise(InferTwSharding::new(
            infos, env,
        )?)),
        ShardingType::RowWise => Ok(InferEmbeddingSharding::RowWise(InferRwSharding::new(
            infos, env,
        )?)),
        other => Err(EmxError::Config(format!(
            "sharding type not supported for inference: {}",
            other.as_str()
        ))),
    }
}

impl InferEmbeddingSharding {
    pub fn feature_names(&self) -> Vec<String> {
        match self {
            InferEmbeddingSharding::TableWise(s) => s.feature_names(),
            InferEmbeddingSharding::RowWise(s) => s.feature_names(),
        }
    }

    pub fn table_names(&self) -> Vec<String> {
        match self {
            InferEmbeddingSharding::TableWise(s) => s.table_names(),
            InferEmbeddingSharding::RowWise(s) => s.table_names(),
        }
    }

    /// Output feature names, aligned with `feature_names`.
    pub fn embedding_names(&self) -> Vec<String> {
        self.feature_names()
    }

    pub fn embedding_names_per_rank(&self) -> Vec<Vec<String>> {
        match self {
            InferEmbeddingSharding::TableWise(s) => s.embedding_names_per_rank(),
            InferEmbeddingSharding::RowWise(s) => s.embedding_names_per_rank(),
        }
    }

    pub fn create_input_dist(&self) -> EmxResult<InputDist> {
        match self {
            InferEmbeddingSharding::TableWise(s) => s.create_input_dist(),
            InferEmbeddingSharding::RowWise(s) => s.create_input_dist(),
        }
    }

    pub fn create_lookup(&self, split_scale_shift: bool) -> EmxResult<QuantEmbeddingLookup> {
        match self {
            InferEmbeddingSharding::TableWise(s) => s.create_lookup(split_scale_shift),
            InferEmbeddingSharding::RowWise(s) => s.create_lookup(split_scale_shift),
        }
    }

    pub fn create_output_dist(&self) -> EmxResult<OutputDist> {
        match self {
            InferEmbeddingSharding::TableWise(_) => {
                Ok(OutputDist::TableWise(super::table_wise::TwOutputDist {}))
            }
            InferEmbeddingSharding::RowWise(_) => {
                Ok(OutputDist::RowWise(super::row_wise::RwOutputDist {}))
            }
        }
    }
}

pub struct InferTwSharding {
    infos: Vec<QuantShardingInfo>,
    world: usize,
    dim: usize,
}

impl InferTwSharding {
    pub fn new(infos: Vec<QuantShardingInfo>, env: &ShardingEnv) -> EmxResult<Self> {
        let dim = infos[0].table.embedding_dim;
        for info in &infos {
            if info.sharding.ranks.len() != 1 || info.sharding.ranks[0] >= env.world_size() {
                return Err(EmxError::Config(format!(
                    "table-wise table '{}' needs exactly one in-world rank",
                    info.table.name
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
        Ok(InputDist::TableWise(TwInputDist::new(
            self.world,
            feature_to_rank,
        )))
    }

    pub fn create_lookup(&self, split_scale_shift: bool) -> EmxResult<QuantEmbeddingLookup> {
        let mut per_rank: Vec<(HashMap<String, Arc<QuantShard>>, Vec<Arc<QuantShard>>)> =
            (0..self.world).map(|_| (HashMap::new(), Vec::new())).collect();
        for info in &self.infos {
            let rank = info.sharding.ranks[0];
            let shard = Arc::new(QuantShard::from_parts(
                ShardMeta {
                    table: info.table.name.clone(),
                    row_offset: 0,
                    rows: info.table.num_embeddings,
                    col_offset: 0,
                    cols: self.dim,
                },
                info.bytes.clone(),
                info.scales.clone(),
                info.shifts.clone(),
                split_scale_shift,
                info.sharding.bounds_check_mode,
            )?);
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
}

pub struct InferRwSharding {
    infos: Vec<QuantShardingInfo>,
    world: usize,
    dim: usize,
}

impl InferRwSharding {
    pub fn new(infos: Vec<QuantShardingInfo>, env: &ShardingEnv) -> EmxResult<Self> {
        let dim = infos[0].table.embedding_dim;
        for info in &infos {
            for &rank in &info.sharding.ranks {
                if rank >= env.world_size() {
                    return Err(EmxError::Config(format!(
                        "table '{}' placed on rank {} outside world of size {}",
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
            for &rank in &info.sharding.ranks {
                per_rank[rank].extend(info.table.feature_names.iter().cloned());
            }
        }
        per_rank
    }

    pub fn create_input_dist(&self) -> EmxResult<InputDist> {
        Ok(InputDist::RowWise(super::row_wise::RwInputDist::new(
            self.world,
            routes_from(self.infos.iter().map(|i| (i.table.as_ref(), &i.sharding))),
        )))
    }

    pub fn create_lookup(&self, split_scale_shift: bool) -> EmxResult<QuantEmbeddingLookup> {
        let mut per_rank: Vec<(HashMap<String, Arc<QuantShard>>, Vec<Arc<QuantShard>>)> =
            (0..self.world).map(|_| (HashMap::new(), Vec::new())).collect();
        for info in &self.infos {
            let rows = info.table.num_embeddings;
            let cols = self.dim;
            let n = info.sharding.ranks.len();
            for (b, &rank) in info.sharding.ranks.iter().enumerate() {
                let shard = match info.sharding.bucketize_mode {
                    BucketizeMode::Block => {
                        let (row_offset, local_rows) = block_shard_extent(rows, n, b);
                        QuantShard::from_parts(
                            ShardMeta {
                                table: info.table.name.clone(),
                                row_offset,
                                rows: local_rows,
                                col_offset: 0,
                                cols,
                            },
                            info.bytes[row_offset * cols..(row_offset + local_rows) * cols]
                                .to_vec(),
                            info.scales[row_offset..row_offset + local_rows].to_vec(),
                            info.shifts[row_offset..row_offset + local_rows].to_vec(),
                            split_scale_shift,
                            info.sharding.bounds_check_mode,
                        )?
                    }
                    BucketizeMode::Hash => {
                        let ids = hash_shard_ids(rows, n, b);
                        let mut bytes = Vec::with_capacity(ids.len() * cols);
                        let mut scales = Vec::with_capacity(ids.len());
                        let mut shifts = Vec::with_capacity(ids.len());
                        let mut row_map = AHashMap::with_capacity(ids.len());
                        for (local, &id) in ids.iter().enumerate() {
                            let r = id as usize;
                            bytes.extend_from_slice(&info.bytes[r * cols..(r + 1) * cols]);
                            scales.push(info.scales[r]);
                            shifts.push(info.shifts[r]);
                            row_map.insert(id, local);
                        }
                        QuantShard::from_parts(
                            ShardMeta {
                                table: info.table.name.clone(),
                                row_offset: 0,
                                rows: ids.len(),
                                col_offset: 0,
                                cols,
                            },
                            bytes,
                            scales,
                            shifts,
                            split_scale_shift,
                            info.sharding.bounds_check_mode,
                        )?
                        .with_row_map(row_map)
                    }
                };
                let shard = Arc::new(shard);
                for feature in &info.table.feature_names {
                    per_rank[rank].0.insert(feature.clone(), shard.clone());
                }
                per_rank[rank].1.push(shard);
            }
        }
        Ok(GroupedLookup::new(
            self.dim,
            per_rank
                .into_iter()
                .map(|(by_feature, shards)| RankShards::new(by_feature, shards))
                .collect(),
        ))
    }
}
