//! Sharded embedding collection orchestrator.
//!
//! [`ShardedEmbeddingCollection`]은 플랜에 등장하는 샤딩 타입별로 전략을
//! 하나씩 만들고, 배치를 feature 단위로 쪼개 각 전략의
//! input-dist → lookup → output-dist 파이프라인에 태운 뒤 결과 맵을 하나로
//! 합친다. 라우팅(입출력 dist)은 첫 배치의 feature 순서를 보고 단 한 번
//! 초기화된다 (`Uninit → Ready`).
//!
//! Waits are pinned where the data dependencies are: `compute` blocks on
//! every destination's lookup before `output_dist` reads a single row,
//! and the per-pass context is recorded on every consuming stream.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::checkpoint::{StateDict, StateTensor, WeightTensor, qualified_key};
use crate::collection::EmbeddingCollection;
use crate::config::EmbeddingTableConfig;
use crate::context::{EmbeddingCollectionContext, SequenceShardingContext};
use crate::error::{EmxError, EmxResult};
use crate::kernel::DenseShard;
use crate::lookup::{GroupedEmbeddingLookup, LookupOutput};
use crate::plan::{ShardingPlan, ShardingType};
use crate::registry::{LookupHandle, LookupRegistry};
use crate::sharding::{
    EmbeddingSharding, EmbeddingShardingInfo, InputDist, OutputDist, ShardingEnv,
    create_embedding_sharding,
};
use crate::sparse::{JaggedTensor, KeyedJaggedTensor};
use crate::stream::StreamAttached;

/// One sharding type's strategy and its grouped lookup.
struct Strategy {
    sharding_type: ShardingType,
    sharding: EmbeddingSharding,
    lookup: Arc<GroupedEmbeddingLookup>,
}

/// Routing modules, fixed at first-batch time. Shared with the
/// quantized orchestrator, which runs the same three-stage pipeline.
pub(crate) struct ReadyDists {
    /// Permutation taking the incoming key order to the canonical
    /// per-strategy order.
    pub(crate) features_order: Vec<usize>,
    /// Feature count owned by each strategy, in strategy order.
    pub(crate) group_sizes: Vec<usize>,
    pub(crate) input_dists: Vec<InputDist>,
    pub(crate) output_dists: Vec<OutputDist>,
}

/// Input/output dist lifecycle. The feature set is unknown until the
/// first real batch, so the transition happens under the forward-pass
/// entry point, exactly once.
pub(crate) enum DistLifecycle {
    Uninit,
    Ready(Arc<ReadyDists>),
}

/// Permutation taking `features`' key order to `canonical`. The batch
/// must carry exactly the owned feature set.
pub(crate) fn features_order(
    canonical: &[String],
    features: &KeyedJaggedTensor,
) -> EmxResult<Vec<usize>> {
    if canonical.len() != features.keys().len() {
        return Err(EmxError::InvariantViolation(format!(
            "batch carries {} features but this module owns {}",
            features.keys().len(),
            canonical.len()
        )));
    }
    canonical
        .iter()
        .map(|name| {
            features.keys().iter().position(|key| key == name).ok_or_else(|| {
                EmxError::InvariantViolation(format!("batch is missing owned feature '{}'", name))
            })
        })
        .collect()
}

/// Trainable embedding collection, sharded across destinations per an
/// externally-produced plan.
pub struct ShardedEmbeddingCollection {
    env: ShardingEnv,
    registry: Arc<LookupRegistry>,
    tables: Vec<Arc<EmbeddingTableConfig>>,
    strategies: Vec<Strategy>,
    dim: usize,
    need_indices: bool,
    lifecycle: Mutex<DistLifecycle>,
}

impl ShardedEmbeddingCollection {
    /// Shard `module` according to `plan`. Every table must have a plan
    /// entry and every plan entry must name a table of the module;
    /// anything else is a configuration mismatch between planner and
    /// model definition.
    pub fn shard(
        module: &EmbeddingCollection,
        plan: &ShardingPlan,
        env: ShardingEnv,
        registry: Arc<LookupRegistry>,
    ) -> EmxResult<Self> {
        plan.validate()?;
        for table_name in plan.plan.keys() {
            if !module.tables().iter().any(|t| &t.name == table_name) {
                return Err(EmxError::Config(format!(
                    "plan entry for table '{}' matches no table in the collection",
                    table_name
                )));
            }
        }

        // Group tables by sharding type, preserving the collection's
        // table order within each group.
        let mut grouped: Vec<(ShardingType, Vec<EmbeddingShardingInfo>)> = Vec::new();
        for table in module.tables() {
            let sharding = plan.get(&table.name).ok_or_else(|| {
                EmxError::Config(format!("plan has no entry for table '{}'", table.name))
            })?;
            let info = EmbeddingShardingInfo {
                table: table.clone(),
                sharding: sharding.clone(),
                weights: module.weights(&table.name)?,
            };
            match grouped
                .iter_mut()
                .find(|(st, _)| *st == sharding.sharding_type)
            {
                Some((_, infos)) => infos.push(info),
                None => grouped.push((sharding.sharding_type, vec![info])),
            }
        }
        grouped.sort_by_key(|(st, _)| *st);

        let mut strategies = Vec::with_capacity(grouped.len());
        for (sharding_type, infos) in grouped {
            let sharding = create_embedding_sharding(sharding_type, infos, &env)?;
            let lookup = Arc::new(sharding.create_lookup()?);
            registry.register(LookupHandle {
                name: format!("embedding_lookup/{}", sharding_type.as_str()),
                sharding_type,
                tables: sharding.table_names(),
                quantized: false,
            })?;
            strategies.push(Strategy {
                sharding_type,
                sharding,
                lookup,
            });
        }
        info!(
            strategies = strategies.len(),
            world = env.world_size(),
            "sharded embedding collection constructed"
        );

        Ok(Self {
            env,
            registry,
            tables: module.tables().to_vec(),
            strategies,
            dim: module.embedding_dim(),
            need_indices: module.need_indices(),
            lifecycle: Mutex::new(DistLifecycle::Uninit),
        })
    }

    pub fn env(&self) -> &ShardingEnv {
        &self.env
    }

    pub fn registry(&self) -> &Arc<LookupRegistry> {
        &self.registry
    }

    pub fn embedding_dim(&self) -> usize {
        self.dim
    }

    /// Features this module owns, in canonical per-strategy order.
    pub fn feature_names(&self) -> Vec<String> {
        self.strategies
            .iter()
            .flat_map(|s| s.sharding.feature_names())
            .collect()
    }

    /// Which output features each destination rank produces, per
    /// strategy in strategy order.
    pub fn embedding_names_per_rank(&self) -> Vec<Vec<Vec<String>>> {
        self.strategies
            .iter()
            .map(|s| s.sharding.embedding_names_per_rank())
            .collect()
    }

    /// Sharding types with a live strategy, in strategy order.
    pub fn sharding_types(&self) -> Vec<ShardingType> {
        self.strategies.iter().map(|s| s.sharding_type).collect()
    }

    /// `Uninit → Ready`, driven by the first batch's key order. No-op
    /// once ready; a later batch with a different feature set is an
    /// invariant violation, not a re-initialization.
    fn ensure_ready(&self, features: &KeyedJaggedTensor) -> EmxResult<Arc<ReadyDists>> {
        let mut lifecycle = self.lifecycle.lock();
        if let DistLifecycle::Ready(ready) = &*lifecycle {
            return Ok(ready.clone());
        }

        let canonical = self.feature_names();
        let features_order = features_order(&canonical, features)?;

        let group_sizes: Vec<usize> = self
            .strategies
            .iter()
            .map(|s| s.sharding.feature_names().len())
            .collect();
        let mut input_dists = Vec::with_capacity(self.strategies.len());
        let mut output_dists = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            input_dists.push(strategy.sharding.create_input_dist()?);
            output_dists.push(strategy.sharding.create_output_dist()?);
        }
        debug!(
            features = canonical.len(),
            groups = group_sizes.len(),
            "input/output dist initialized from first batch"
        );

        let ready = Arc::new(ReadyDists {
            features_order,
            group_sizes,
            input_dists,
            output_dists,
        });
        *lifecycle = DistLifecycle::Ready(ready.clone());
        Ok(ready)
    }

    fn ready(&self) -> EmxResult<Arc<ReadyDists>> {
        match &*self.lifecycle.lock() {
            DistLifecycle::Ready(ready) => Ok(ready.clone()),
            DistLifecycle::Uninit => Err(EmxError::MissingContext(
                "output stage invoked before any input_dist call".to_string(),
            )),
        }
    }

    /// Stage 1: permute the batch into canonical order, split it per
    /// strategy and let each strategy repartition its subset. Returns the
    /// per-pass routing context; the batch itself is consumed here.
    pub fn input_dist(
        &self,
        features: &KeyedJaggedTensor,
    ) -> EmxResult<EmbeddingCollectionContext> {
        let ready = self.ensure_ready(features)?;
        let permuted = features.permute(&ready.features_order)?;
        let parts = permuted.split(&ready.group_sizes)?;

        let mut ctx = EmbeddingCollectionContext::new();
        for (dist, part) in ready.input_dists.iter().zip(parts) {
            let result = dist.distribute(&part)?;
            ctx.sharding_contexts.push(SequenceShardingContext {
                features: result.features,
                features_before_input_dist: Arc::new(part),
                unbucketize_permute: result.unbucketize_permute,
            });
        }

        // The context's buffers cross onto every destination stream;
        // each consuming stream keeps them alive until it synchronizes.
        for rank in 0..self.env.world_size() {
            ctx.record_stream(&self.env.pool().stream(rank)?);
        }
        Ok(ctx)
    }

    /// Stage 2: per-destination lookups, issued concurrently on each
    /// destination's stream and awaited before returning. Output is
    /// indexed `[strategy][rank]`.
    pub fn compute(
        &self,
        ctx: &EmbeddingCollectionContext,
    ) -> EmxResult<Vec<Vec<LookupOutput>>> {
        if ctx.sharding_contexts.len() != self.strategies.len() {
            return Err(EmxError::InvariantViolation(format!(
                "context holds {} sharding contexts for {} strategies",
                ctx.sharding_contexts.len(),
                self.strategies.len()
            )));
        }

        let mut handles = Vec::with_capacity(self.strategies.len());
        for (strategy, sc) in self.strategies.iter().zip(&ctx.sharding_contexts) {
            if sc.features.len() != self.env.world_size() {
                return Err(EmxError::InvariantViolation(format!(
                    "context routes {} destinations in a world of {}",
                    sc.features.len(),
                    self.env.world_size()
                )));
            }
            let mut per_rank = Vec::with_capacity(sc.features.len());
            for (rank, kjt) in sc.features.iter().enumerate() {
                let lookup = strategy.lookup.clone();
                let kjt = kjt.clone();
                per_rank.push(
                    self.env
                        .pool()
                        .stream(rank)?
                        .submit(move || lookup.lookup(rank, &kjt)),
                );
            }
            handles.push(per_rank);
        }

        // The cross-stage wait: nothing downstream reads a raw output
        // until its destination delivered it.
        handles
            .into_iter()
            .map(|per_rank| per_rank.into_iter().map(|h| h.wait()).collect())
            .collect()
    }

    /// Stage 3: reassemble per-feature jagged results and merge the
    /// per-strategy maps.
    pub fn output_dist(
        &self,
        ctx: &EmbeddingCollectionContext,
        outputs: &[Vec<LookupOutput>],
    ) -> EmxResult<HashMap<String, JaggedTensor>> {
        let ready = self.ready()?;
        if ctx.sharding_contexts.len() != ready.output_dists.len()
            || outputs.len() != ready.output_dists.len()
        {
            return Err(EmxError::InvariantViolation(format!(
                "{} contexts and {} outputs for {} output distributors",
                ctx.sharding_contexts.len(),
                outputs.len(),
                ready.output_dists.len()
            )));
        }
        let mut merged = HashMap::new();
        for ((dist, sc), raw) in ready
            .output_dists
            .iter()
            .zip(&ctx.sharding_contexts)
            .zip(outputs)
        {
            merged.extend(dist.assemble(raw, sc, self.need_indices)?);
        }
        // The pass's context is consumed here; every stream releases the
        // buffers it retained for it.
        self.env.pool().synchronize_all()?;
        Ok(merged)
    }

    /// Stages 2 and 3 back to back, sharing the cardinality checks.
    pub fn compute_and_output_dist(
        &self,
        ctx: &EmbeddingCollectionContext,
    ) -> EmxResult<HashMap<String, JaggedTensor>> {
        let outputs = self.compute(ctx)?;
        self.output_dist(ctx, &outputs)
    }

    /// Full forward pass: input dist, lookups, output dist.
    pub fn forward(
        &self,
        features: &KeyedJaggedTensor,
    ) -> EmxResult<HashMap<String, JaggedTensor>> {
        let ctx = self.input_dist(features)?;
        self.compute_and_output_dist(&ctx)
    }

    /// Route per-feature output gradients back through the pass's
    /// routing metadata and scatter-add them into the shard gradient
    /// buffers. `ctx` must be the context of the forward pass the
    /// gradients came from.
    pub fn backward(
        &self,
        ctx: &EmbeddingCollectionContext,
        grads: &HashMap<String, JaggedTensor>,
    ) -> EmxResult<()> {
        let ready = self.ready()?;
        if ctx.sharding_contexts.len() != self.strategies.len() {
            return Err(EmxError::InvariantViolation(format!(
                "context holds {} sharding contexts for {} strategies",
                ctx.sharding_contexts.len(),
                self.strategies.len()
            )));
        }
        for ((strategy, dist), sc) in self
            .strategies
            .iter()
            .zip(&ready.output_dists)
            .zip(&ctx.sharding_contexts)
        {
            let raw_grads = dist.backward(grads, sc)?;
            for (rank, raw) in raw_grads.iter().enumerate() {
                strategy.lookup.backward(rank, &sc.features[rank], raw)?;
            }
        }
        Ok(())
    }

    /// External optimizer hook: one SGD step over every distinct shard.
    pub fn apply_sgd(&self, lr: f32) {
        for strategy in &self.strategies {
            for shard in strategy.lookup.unique_shards() {
                shard.store().apply_sgd(lr);
            }
        }
    }

    /// Shards of one table across every strategy, in lookup order.
    fn table_shards(&self, name: &str) -> Vec<Arc<DenseShard>> {
        self.strategies
            .iter()
            .flat_map(|s| s.lookup.unique_shards())
            .filter(|shard| shard.meta().table == name)
            .collect()
    }

    /// Map shard-local rows back into the full table address space and
    /// expose each table under `"<prefix>.<table>.weight"` — the same
    /// keys the unsharded collection uses, so checkpoints interoperate.
    pub fn state_dict(&self, prefix: &str) -> EmxResult<StateDict> {
        let mut state = StateDict::new();
        for table in &self.tables {
            let rows = table.num_embeddings;
            let mut data = vec![0.0f32; rows * self.dim];
            for shard in self.table_shards(&table.name) {
                let meta = shard.meta();
                let snapshot = shard.store().snapshot();
                if let Some(map) = shard.row_map() {
                    for (&global, &local) in map {
                        data[global as usize * self.dim..(global as usize + 1) * self.dim]
                            .copy_from_slice(&snapshot[local * self.dim..(local + 1) * self.dim]);
                    }
                } else {
                    for r in 0..meta.rows {
                        let dst = (meta.row_offset + r) * self.dim + meta.col_offset;
                        data[dst..dst + meta.cols]
                            .copy_from_slice(&snapshot[r * meta.cols..(r + 1) * meta.cols]);
                    }
                }
            }
            state.insert(
                qualified_key(prefix, &table.name, "weight"),
                StateTensor::Dense(WeightTensor::new(rows, self.dim, data)?),
            );
        }
        Ok(state)
    }

    /// Inverse of [`ShardedEmbeddingCollection::state_dict`]: slice each
    /// full table back into its shards' local address spaces.
    pub fn load_state_dict(&self, prefix: &str, state: &StateDict) -> EmxResult<()> {
        for table in &self.tables {
            let key = qualified_key(prefix, &table.name, "weight");
            let tensor = state.get(&key).ok_or_else(|| {
                EmxError::CheckpointFailed(format!("state dict has no entry '{}'", key))
            })?;
            let full = match tensor {
                StateTensor::Dense(w) => w,
                StateTensor::Quantized(_) => {
                    return Err(EmxError::CheckpointFailed(format!(
                        "entry '{}' is quantized but the collection is dense",
                        key
                    )));
                }
            };
            if full.rows != table.num_embeddings || full.cols != self.dim {
                return Err(EmxError::CheckpointFailed(format!(
                    "entry '{}' has shape {}x{}, table expects {}x{}",
                    key, full.rows, full.cols, table.num_embeddings, self.dim
                )));
            }
            for shard in self.table_shards(&table.name) {
                let meta = shard.meta();
                let mut local = vec![0.0f32; meta.rows * meta.cols];
                if let Some(map) = shard.row_map() {
                    for (&global, &local_row) in map {
                        local[local_row * self.dim..(local_row + 1) * self.dim].copy_from_slice(
                            &full.data
                                [global as usize * self.dim..(global as usize + 1) * self.dim],
                        );
                    }
                } else {
                    for r in 0..meta.rows {
                        let src = (meta.row_offset + r) * self.dim + meta.col_offset;
                        local[r * meta.cols..(r + 1) * meta.cols]
                            .copy_from_slice(&full.data[src..src + meta.cols]);
                    }
                }
                shard.store().load(&local)?;
            }
        }
        Ok(())
    }
}
