//! Row-wise sharding: each table's rows bucketized across destinations.
//!
//! Block mode places contiguous row ranges (`block = id / ceil(rows/n)`),
//! hash mode places rows by a deterministic id hash. Bucketization
//! destroys the original per-example value order, so the input
//! distributor records an unbucketize permutation: for every original
//! flat position `p`, `perm[p]` is the row's position in the rank-order
//! concatenation of raw outputs. The output distributor concatenates,
//! index-selects by the permutation and splits by the pre-distribution
//! `length_per_key`.

use std::collections::HashMap;
use std::sync::Arc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::context::SequenceShardingContext;
use crate::error::{EmxError, EmxResult};
use crate::kernel::{DenseShard, ShardMeta};
use crate::lookup::{GroupedEmbeddingLookup, GroupedLookup, LookupOutput, RankShards};
use crate::plan::BucketizeMode;
use crate::sparse::{JaggedTensor, KeyedJaggedTensor};

use super::{DistResult, EmbeddingShardingInfo, InputDist, OutputDist, ShardingEnv, bucket_hasher};

/// Rows of bucket `b` out of `n` over a `rows`-row table, block layout:
/// `(row_offset, local_rows)`.
pub(crate) fn block_shard_extent(rows: usize, n: usize, b: usize) -> (usize, usize) {
    let block = rows.div_ceil(n);
    let start = (b * block).min(rows);
    let end = ((b + 1) * block).min(rows);
    (start, end - start)
}

/// Global row ids landing in bucket `b` out of `n` under hash layout.
pub(crate) fn hash_shard_ids(rows: usize, n: usize, b: usize) -> Vec<i64> {
    let hasher = bucket_hasher();
    (0..rows as i64)
        .filter(|id| (hasher.hash_one(*id) as usize) % n == b)
        .collect()
}

/// Routing facts for one feature under the row-wise family.
#[derive(Clone)]
pub(crate) struct RwRoute {
    pub feature: String,
    pub rows: usize,
    pub ranks: Vec<usize>,
    pub mode: BucketizeMode,
}

pub(crate) fn routes_from<'a>(
    tables: impl Iterator<Item = (&'a crate::config::EmbeddingTableConfig, &'a crate::plan::ParameterSharding)>,
) -> Vec<RwRoute> {
    tables
        .flat_map(|(table, sharding)| {
            table.feature_names.iter().map(|feature| RwRoute {
                feature: feature.clone(),
                rows: table.num_embeddings,
                ranks: sharding.ranks.clone(),
                mode: sharding.bucketize_mode,
            })
        })
        .collect()
}

pub struct RwSharding {
    infos: Vec<EmbeddingShardingInfo>,
    world: usize,
    dim: usize,
}

impl RwSharding {
    pub fn new(infos: Vec<EmbeddingShardingInfo>, env: &ShardingEnv) -> EmxResult<Self> {
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

    /// Every bucket rank produces rows for every feature it hosts.
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
        Ok(InputDist::RowWise(RwInputDist::new(
            self.world,
            routes_from(self.infos.iter().map(|i| (i.table.as_ref(), &i.sharding))),
        )))
    }

    pub fn create_lookup(&self) -> EmxResult<GroupedEmbeddingLookup> {
        let mut per_rank: Vec<(HashMap<String, Arc<DenseShard>>, Vec<Arc<DenseShard>>)> =
            (0..self.world).map(|_| (HashMap::new(), Vec::new())).collect();

        for info in &self.infos {
            let rows = info.table.num_embeddings;
            let n = info.sharding.ranks.len();
            for (b, &rank) in info.sharding.ranks.iter().enumerate() {
                let shard = match info.sharding.bucketize_mode {
                    BucketizeMode::Block => {
                        let (row_offset, local_rows) = block_shard_extent(rows, n, b);
                        let data = info.weights
                            [row_offset * self.dim..(row_offset + local_rows) * self.dim]
                            .to_vec();
                        DenseShard::new(
                            ShardMeta {
                                table: info.table.name.clone(),
                                row_offset,
                                rows: local_rows,
                                col_offset: 0,
                                cols: self.dim,
                            },
                            data,
                            info.sharding.cache_params.as_ref(),
                            info.sharding.bounds_check_mode,
                        )?
                    }
                    BucketizeMode::Hash => {
                        let ids = hash_shard_ids(rows, n, b);
                        let mut data = Vec::with_capacity(ids.len() * self.dim);
                        let mut row_map = AHashMap::with_capacity(ids.len());
                        for (local, &id) in ids.iter().enumerate() {
                            let r = id as usize;
                            data.extend_from_slice(
                                &info.weights[r * self.dim..(r + 1) * self.dim],
                            );
                            row_map.insert(id, local);
                        }
                        DenseShard::new(
                            ShardMeta {
                                table: info.table.name.clone(),
                                row_offset: 0,
                                rows: ids.len(),
                                col_offset: 0,
                                cols: self.dim,
                            },
                            data,
                            info.sharding.cache_params.as_ref(),
                            info.sharding.bounds_check_mode,
                        )?
                        .with_row_map(row_map)
                    }
                };
                let shard = Arc::new(shard.with_hints(
                    info.sharding.stochastic_rounding,
                    info.sharding.enforce_in_fast_memory,
                ));
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

    pub fn create_output_dist(&self) -> EmxResult<OutputDist> {
        Ok(OutputDist::RowWise(RwOutputDist {}))
    }
}

pub struct RwInputDist {
    world: usize,
    routes: HashMap<String, RwRoute>,
}

impl RwInputDist {
    pub(crate) fn new(world: usize, routes: Vec<RwRoute>) -> Self {
        Self {
            world,
            routes: routes
                .into_iter()
                .map(|route| (route.feature.clone(), route))
                .collect(),
        }
    }

    /// Map one value to `(destination rank, emitted id)`.
    ///
    /// Block mode emits shard-local ids; hash mode emits global ids and
    /// relies on the shard's row map. Out-of-range ids fall into the
    /// nearest bucket so the shard's bounds-check mode decides their
    /// fate.
    fn bucketize(&self, route: &RwRoute, id: i64) -> (usize, i64) {
        let n = route.ranks.len() as i64;
        match route.mode {
            BucketizeMode::Block => {
                let block = route.rows.div_ceil(n as usize) as i64;
                let bucket = (id / block).clamp(0, n - 1);
                (route.ranks[bucket as usize], id - bucket * block)
            }
            BucketizeMode::Hash => {
                let bucket = (bucket_hasher().hash_one(id) as usize) % route.ranks.len();
                (route.ranks[bucket], id)
            }
        }
    }

    pub fn distribute(&self, features: &KeyedJaggedTensor) -> EmxResult<DistResult> {
        let stride = features.stride();
        let keys = features.keys();
        let has_weights = features.weights().is_some();

        struct RankBuffer {
            values: Vec<i64>,
            lengths: Vec<usize>,
            weights: Vec<f32>,
            origins: Vec<usize>,
        }
        let mut buffers: Vec<RankBuffer> = (0..self.world)
            .map(|_| RankBuffer {
                values: Vec::new(),
                lengths: vec![0; keys.len() * stride],
                weights: Vec::new(),
                origins: Vec::new(),
            })
            .collect();

        let routes: SmallVec<[&RwRoute; 8]> = keys
            .iter()
            .map(|key| {
                self.routes.get(key).ok_or_else(|| {
                    EmxError::InvariantViolation(format!(
                        "feature '{}' is not assigned to this row-wise group",
                        key
                    ))
                })
            })
            .collect::<EmxResult<_>>()?;

        let offsets = features.offset_per_key();
        let mut flat_pos = 0usize;
        for (k, route) in routes.iter().enumerate() {
            let lengths = features.lengths_for_key(k);
            let mut cursor = offsets[k];
            for (e, &len) in lengths.iter().enumerate() {
                for _ in 0..len {
                    let id = features.values()[cursor];
                    let (rank, local_id) = self.bucketize(route, id);
                    let buffer = &mut buffers[rank];
                    buffer.values.push(local_id);
                    buffer.lengths[k * stride + e] += 1;
                    buffer.origins.push(flat_pos);
                    if let Some(w) = features.weights() {
                        buffer.weights.push(w[cursor]);
                    }
                    cursor += 1;
                    flat_pos += 1;
                }
            }
        }

        // perm[p] = position of original value p in the rank-order
        // concatenation of per-rank outputs.
        let mut permute = vec![0usize; flat_pos];
        let mut base = 0usize;
        for buffer in &buffers {
            for (local, &origin) in buffer.origins.iter().enumerate() {
                permute[origin] = base + local;
            }
            base += buffer.origins.len();
        }

        let mut out = Vec::with_capacity(self.world);
        for buffer in buffers {
            let kjt = KeyedJaggedTensor::from_lengths(
                keys.to_vec(),
                buffer.values,
                buffer.lengths,
                has_weights.then_some(buffer.weights),
            )?;
            out.push(Arc::new(kjt));
        }
        Ok(DistResult {
            features: out,
            unbucketize_permute: Some(Arc::new(permute)),
        })
    }
}

pub struct RwOutputDist {}

impl RwOutputDist {
    pub fn assemble(
        &self,
        outputs: &[LookupOutput],
        ctx: &SequenceShardingContext,
        need_indices: bool,
    ) -> EmxResult<HashMap<String, JaggedTensor>> {
        let permute = ctx.unbucketize_permute.as_ref().ok_or_else(|| {
            EmxError::MissingContext(
                "row-wise output distribution requires an unbucketize permutation".to_string(),
            )
        })?;
        let before = &ctx.features_before_input_dist;

        let cols = outputs
            .iter()
            .map(|o| o.cols)
            .max()
            .unwrap_or(0);
        let total_rows: usize = outputs.iter().map(|o| o.rows()).sum();
        if total_rows != permute.len() {
            return Err(EmxError::InvariantViolation(format!(
                "{} bucketized rows for a permutation of {} entries",
                total_rows,
                permute.len()
            )));
        }

        // index_select by the permutation over the rank-order concat.
        let mut concat = Vec::with_capacity(total_rows * cols);
        for output in outputs {
            concat.extend_from_slice(&output.values);
        }
        let mut restored = vec![0.0f32; total_rows * cols];
        for (orig, &bucketized) in permute.iter().enumerate() {
            restored[orig * cols..(orig + 1) * cols]
                .copy_from_slice(&concat[bucketized * cols..(bucketized + 1) * cols]);
        }

        let offsets = before.offset_per_key();
        let mut result = HashMap::new();
        for (k, key) in before.keys().iter().enumerate() {
            let ids = &before.values()[offsets[k]..offsets[k + 1]];
            let rows = restored[offsets[k] * cols..offsets[k + 1] * cols].to_vec();
            let weights = need_indices.then(|| ids.iter().map(|&id| id as f32).collect());
            result.insert(
                key.clone(),
                JaggedTensor::new(before.lengths_for_key(k).to_vec(), rows, cols, weights)?,
            );
        }
        Ok(result)
    }

    /// Inverse of [`RwOutputDist::assemble`]: re-bucketize per-feature
    /// output gradients into one raw gradient per destination, applying
    /// the forward permutation in the opposite direction.
    pub fn backward(
        &self,
        grads: &HashMap<String, JaggedTensor>,
        ctx: &SequenceShardingContext,
    ) -> EmxResult<Vec<Vec<f32>>> {
        let permute = ctx.unbucketize_permute.as_ref().ok_or_else(|| {
            EmxError::MissingContext(
                "row-wise backward requires an unbucketize permutation".to_string(),
            )
        })?;
        let before = &ctx.features_before_input_dist;
        let offsets = before.offset_per_key();

        let mut cols = 0usize;
        let mut original = Vec::new();
        for (k, key) in before.keys().iter().enumerate() {
            let grad = grads.get(key).ok_or_else(|| {
                EmxError::InvariantViolation(format!("gradient missing for feature '{}'", key))
            })?;
            if grad.rows() != offsets[k + 1] - offsets[k] {
                return Err(EmxError::InvariantViolation(format!(
                    "gradient for feature '{}' holds {} rows, expected {}",
                    key,
                    grad.rows(),
                    offsets[k + 1] - offsets[k]
                )));
            }
            cols = grad.dim();
            original.extend_from_slice(grad.values());
        }
        if permute.len() * cols != original.len() {
            return Err(EmxError::InvariantViolation(format!(
                "{} gradient rows for a permutation of {} entries",
                original.len() / cols.max(1),
                permute.len()
            )));
        }

        // bucketized[perm[p]] = original[p], the forward index_select
        // run in reverse.
        let mut bucketized = vec![0.0f32; original.len()];
        for (orig, &pos) in permute.iter().enumerate() {
            bucketized[pos * cols..(pos + 1) * cols]
                .copy_from_slice(&original[orig * cols..(orig + 1) * cols]);
        }

        let mut out = Vec::with_capacity(ctx.features.len());
        let mut base = 0usize;
        for kjt in &ctx.features {
            let rows = kjt.values().len();
            out.push(bucketized[base * cols..(base + rows) * cols].to_vec());
            base += rows;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingTableConfig;
    use crate::plan::{ParameterSharding, ShardingType};

    fn info(mode: BucketizeMode) -> EmbeddingShardingInfo {
        let mut sharding = ParameterSharding::new(ShardingType::RowWise, vec![0, 1]);
        sharding.bucketize_mode = mode;
        EmbeddingShardingInfo {
            table: Arc::new(
                EmbeddingTableConfig::new("table_0", vec!["feature_0".to_string()], 2, 4).unwrap(),
            ),
            sharding,
            weights: (0..8).map(|i| i as f32).collect(),
        }
    }

    #[test]
    fn block_extents_cover_the_table() {
        assert_eq!(block_shard_extent(4, 2, 0), (0, 2));
        assert_eq!(block_shard_extent(4, 2, 1), (2, 2));
        assert_eq!(block_shard_extent(5, 2, 0), (0, 3));
        assert_eq!(block_shard_extent(5, 2, 1), (3, 2));
        assert_eq!(block_shard_extent(1, 2, 1), (1, 0));
    }

    #[test]
    fn hash_buckets_partition_the_table() {
        let mut all: Vec<i64> = hash_shard_ids(16, 3, 0);
        all.extend(hash_shard_ids(16, 3, 1));
        all.extend(hash_shard_ids(16, 3, 2));
        all.sort_unstable();
        assert_eq!(all, (0..16).collect::<Vec<i64>>());
    }

    #[test]
    fn block_distribute_emits_local_ids_and_permutation() {
        let env = ShardingEnv::new_local(2).unwrap();
        let sharding = RwSharding::new(vec![info(BucketizeMode::Block)], &env).unwrap();
        let dist = match sharding.create_input_dist().unwrap() {
            InputDist::RowWise(d) => d,
            _ => unreachable!(),
        };
        // ids 0..3 over 4 rows, 2 buckets of block 2: [0,1]→rank0, [2,3]→rank1
        let kjt = KeyedJaggedTensor::from_lengths(
            vec!["feature_0".to_string()],
            vec![3, 0, 2, 1],
            vec![2, 1, 1],
            None,
        )
        .unwrap();
        let result = dist.distribute(&kjt).unwrap();
        assert_eq!(result.features[0].values(), &[0, 1]); // ids 0, 1 localized
        assert_eq!(result.features[1].values(), &[1, 0]); // ids 3, 2 localized
        assert_eq!(result.features[0].lengths(), &[1, 0, 1]);
        assert_eq!(result.features[1].lengths(), &[1, 1, 0]);
        // original order [3,0,2,1] → concat order [0:(id0) at slot0? ...]
        let permute = result.unbucketize_permute.unwrap();
        // rank0 holds originals p1 (id 0), p3 (id 1); rank1 holds p0 (id 3), p2 (id 2)
        assert_eq!(permute.as_slice(), &[2, 0, 3, 1]);
    }

    #[test]
    fn round_trip_restores_original_order() {
        for mode in [BucketizeMode::Block, BucketizeMode::Hash] {
            let env = ShardingEnv::new_local(2).unwrap();
            let sharding = RwSharding::new(vec![info(mode)], &env).unwrap();
            let input_dist = sharding.create_input_dist().unwrap();
            let lookup = sharding.create_lookup().unwrap();
            let output_dist = sharding.create_output_dist().unwrap();

            let kjt = KeyedJaggedTensor::from_lengths(
                vec!["feature_0".to_string()],
                vec![3, 0, 2, 1, 1],
                vec![2, 2, 1],
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
                unbucketize_permute: dist.unbucketize_permute,
            };
            let result = output_dist.assemble(&outputs, &ctx, true).unwrap();
            let jt = &result["feature_0"];
            // rows must match table rows at the original ids, in order
            for (slot, &id) in [3i64, 0, 2, 1, 1].iter().enumerate() {
                assert_eq!(jt.row(slot), &[(id * 2) as f32, (id * 2 + 1) as f32]);
            }
            assert_eq!(jt.weights().unwrap(), &[3.0, 0.0, 2.0, 1.0, 1.0]);
            assert_eq!(jt.lengths(), &[2, 2, 1]);
        }
    }

    #[test]
    fn missing_permutation_is_a_hard_failure() {
        let output_dist = RwOutputDist {};
        let ctx = SequenceShardingContext {
            features: vec![],
            features_before_input_dist: Arc::new(KeyedJaggedTensor::empty(1)),
            unbucketize_permute: None,
        };
        assert!(matches!(
            output_dist.assemble(&[], &ctx, false),
            Err(EmxError::MissingContext(_))
        ));
    }
}
