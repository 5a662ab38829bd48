//! Quantized inference collections.
//!
//! [`QuantizedEmbeddingCollection`]은 학습된 컬렉션을 row 단위 u8로
//! 양자화한 추론 전용 모듈이고, [`ShardedQuantEmbeddingCollection`]은 그
//! 모듈을 추론 특화 샤딩(`InferTw`/`InferRw`) 위에 얹는다. 파이프라인
//! 구조는 학습용 orchestrator와 같다: input-dist → lookup → output-dist,
//! 라우팅은 첫 배치에서 한 번 고정.
//!
//! The fused-parameter rule mirrors the checkpoint layout: a fused
//! scale/shift state dict only addresses whole tables, so any sharding
//! beyond table-wise requires the split layout.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::checkpoint::{QuantWeightTensor, StateDict, StateTensor, WeightTensor, qualified_key};
use crate::collection::EmbeddingCollection;
use crate::config::{BoundsCheckMode, DataType, EmbeddingTableConfig};
use crate::context::{EmbeddingCollectionContext, SequenceShardingContext};
use crate::error::{EmxError, EmxResult};
use crate::kernel::{QuantShard, ShardMeta};
use crate::lookup::{LookupOutput, QuantEmbeddingLookup};
use crate::plan::{ShardingPlan, ShardingType};
use crate::registry::{LookupHandle, LookupRegistry};
use crate::sharded::{DistLifecycle, ReadyDists, features_order};
use crate::sharding::{
    InferEmbeddingSharding, ShardingEnv, create_infer_embedding_sharding,
    infer::QuantShardingInfo,
};
use crate::sparse::{JaggedTensor, KeyedJaggedTensor};
use crate::stream::StreamAttached;

/// Fused lookup parameters, fixed at quantization time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FusedParams {
    /// Serialize per-row scale/shift as separate state-dict entries
    /// instead of fusing them into the row bytes.
    pub split_scale_shift: bool,
    /// Publish lookup handles into the orchestrator's registry.
    pub register_lookups: bool,
}

/// Per-row u8 quantized collection, inference only.
pub struct QuantizedEmbeddingCollection {
    tables: Vec<Arc<EmbeddingTableConfig>>,
    shards: BTreeMap<String, Arc<QuantShard>>,
    feature_to_table: HashMap<String, String>,
    dim: usize,
    need_indices: bool,
    fused: FusedParams,
}

impl QuantizedEmbeddingCollection {
    /// Quantize a trainable collection row by row (scale + shift per
    /// row). The source module is left untouched.
    pub fn quantize(module: &EmbeddingCollection, fused: FusedParams) -> EmxResult<Self> {
        let dim = module.embedding_dim();
        let mut tables = Vec::with_capacity(module.tables().len());
        let mut shards = BTreeMap::new();
        let mut feature_to_table = HashMap::new();
        for table in module.tables() {
            let mut config = (**table).clone();
            config.data_type = DataType::Int8;
            let shard = QuantShard::from_dense(
                ShardMeta {
                    table: config.name.clone(),
                    row_offset: 0,
                    rows: config.num_embeddings,
                    col_offset: 0,
                    cols: dim,
                },
                &module.weights(&config.name)?,
                fused.split_scale_shift,
                BoundsCheckMode::Fatal,
            )?;
            for feature in &config.feature_names {
                feature_to_table.insert(feature.clone(), config.name.clone());
            }
            shards.insert(config.name.clone(), Arc::new(shard));
            tables.push(Arc::new(config));
        }
        info!(tables = tables.len(), "collection quantized to u8 rows");
        Ok(Self {
            tables,
            shards,
            feature_to_table,
            dim,
            need_indices: module.need_indices(),
            fused,
        })
    }

    pub fn tables(&self) -> &[Arc<EmbeddingTableConfig>] {
        &self.tables
    }

    pub fn embedding_dim(&self) -> usize {
        self.dim
    }

    pub fn need_indices(&self) -> bool {
        self.need_indices
    }

    pub fn fused_params(&self) -> FusedParams {
        self.fused
    }

    fn table_shard(&self, table: &str) -> EmxResult<&Arc<QuantShard>> {
        self.shards
            .get(table)
            .ok_or_else(|| EmxError::TableNotFound(table.to_string()))
    }

    /// Reference forward pass: dequantizing gather straight from the
    /// full tables.
    pub fn forward(
        &self,
        features: &KeyedJaggedTensor,
    ) -> EmxResult<HashMap<String, JaggedTensor>> {
        let offsets = features.offset_per_key();
        let mut out = HashMap::with_capacity(features.keys().len());
        for (k, key) in features.keys().iter().enumerate() {
            let table = self.feature_to_table.get(key).ok_or_else(|| {
                EmxError::Config(format!("no table serves feature '{}'", key))
            })?;
            let shard = self.table_shard(table)?;
            let ids = &features.values()[offsets[k]..offsets[k + 1]];
            let rows = shard.gather(ids)?;
            let weights = self
                .need_indices
                .then(|| ids.iter().map(|&id| id as f32).collect());
            out.insert(
                key.clone(),
                JaggedTensor::new(features.lengths_for_key(k).to_vec(), rows, self.dim, weights)?,
            );
        }
        Ok(out)
    }

    /// Quantized state dict: `.weight` carries the row bytes, and in
    /// split mode `.weight_qscale` / `.weight_qshift` carry the per-row
    /// quantization parameters as `rows × 1` tensors.
    pub fn state_dict(&self, prefix: &str) -> EmxResult<StateDict> {
        let mut state = StateDict::new();
        for (name, shard) in &self.shards {
            let rows = shard.meta().rows;
            let cols = shard.meta().cols;
            if self.fused.split_scale_shift {
                state.insert(
                    qualified_key(prefix, name, "weight"),
                    StateTensor::Quantized(QuantWeightTensor::split(
                        rows,
                        cols,
                        shard.quant_bytes().to_vec(),
                    )),
                );
                state.insert(
                    qualified_key(prefix, name, "weight_qscale"),
                    StateTensor::Dense(WeightTensor::new(rows, 1, shard.scales().to_vec())?),
                );
                state.insert(
                    qualified_key(prefix, name, "weight_qshift"),
                    StateTensor::Dense(WeightTensor::new(rows, 1, shard.shifts().to_vec())?),
                );
            } else {
                state.insert(
                    qualified_key(prefix, name, "weight"),
                    StateTensor::Quantized(QuantWeightTensor::fused(
                        rows,
                        cols,
                        shard.quant_bytes(),
                        shard.scales(),
                        shard.shifts(),
                    )),
                );
            }
        }
        Ok(state)
    }

    /// Restore quantized rows byte-identical from a state dict written
    /// by [`QuantizedEmbeddingCollection::state_dict`] (or by the
    /// sharded variant, which uses the same keys).
    pub fn load_state_dict(&mut self, prefix: &str, state: &StateDict) -> EmxResult<()> {
        for table in &self.tables {
            let key = qualified_key(prefix, &table.name, "weight");
            let tensor = state.get(&key).ok_or_else(|| {
                EmxError::CheckpointFailed(format!("state dict has no entry '{}'", key))
            })?;
            let quant = match tensor {
                StateTensor::Quantized(q) => q,
                StateTensor::Dense(_) => {
                    return Err(EmxError::CheckpointFailed(format!(
                        "entry '{}' is dense but the collection is quantized",
                        key
                    )));
                }
            };
            let (bytes, scales, shifts) = if self.fused.split_scale_shift {
                if quant.fused {
                    return Err(EmxError::CheckpointFailed(format!(
                        "entry '{}' is fused but the collection expects split scale/shift",
                        key
                    )));
                }
                let scales = dense_column(state, prefix, &table.name, "weight_qscale")?;
                let shifts = dense_column(state, prefix, &table.name, "weight_qshift")?;
                (quant.bytes.clone(), scales, shifts)
            } else {
                quant.unfuse()?
            };
            let shard = QuantShard::from_parts(
                ShardMeta {
                    table: table.name.clone(),
                    row_offset: 0,
                    rows: table.num_embeddings,
                    col_offset: 0,
                    cols: self.dim,
                },
                bytes,
                scales,
                shifts,
                self.fused.split_scale_shift,
                BoundsCheckMode::Fatal,
            )?;
            self.shards.insert(table.name.clone(), Arc::new(shard));
        }
        Ok(())
    }
}

fn dense_column(
    state: &StateDict,
    prefix: &str,
    table: &str,
    suffix: &str,
) -> EmxResult<Vec<f32>> {
    let key = qualified_key(prefix, table, suffix);
    match state.get(&key) {
        Some(StateTensor::Dense(w)) => Ok(w.data.clone()),
        Some(StateTensor::Quantized(_)) => Err(EmxError::CheckpointFailed(format!(
            "entry '{}' must be a dense column",
            key
        ))),
        None => Err(EmxError::CheckpointFailed(format!(
            "state dict has no entry '{}'",
            key
        ))),
    }
}

/// One inference sharding type's strategy and grouped quantized lookup.
struct QuantStrategy {
    sharding_type: ShardingType,
    sharding: InferEmbeddingSharding,
    lookup: Arc<QuantEmbeddingLookup>,
}

/// Quantized collection sharded across destinations, inference only.
pub struct ShardedQuantEmbeddingCollection {
    env: ShardingEnv,
    registry: Arc<LookupRegistry>,
    tables: Vec<Arc<EmbeddingTableConfig>>,
    strategies: Vec<QuantStrategy>,
    dim: usize,
    need_indices: bool,
    fused: FusedParams,
    lifecycle: Mutex<DistLifecycle>,
}

impl ShardedQuantEmbeddingCollection {
    /// Shard a quantized module. Only table-wise and row-wise plans are
    /// supported, and any non-table-wise entry requires the split
    /// scale/shift layout — a fused layout cannot address shard-local
    /// row ranges.
    pub fn shard(
        module: &QuantizedEmbeddingCollection,
        plan: &ShardingPlan,
        env: ShardingEnv,
        registry: Arc<LookupRegistry>,
    ) -> EmxResult<Self> {
        plan.validate()?;
        let fused = module.fused_params();
        for table_name in plan.plan.keys() {
            if !module.tables().iter().any(|t| &t.name == table_name) {
                return Err(EmxError::Config(format!(
                    "plan entry for table '{}' matches no table in the collection",
                    table_name
                )));
            }
        }
        if !fused.split_scale_shift
            && plan
                .plan
                .values()
                .any(|p| p.sharding_type != ShardingType::TableWise)
        {
            return Err(EmxError::Config(
                "quantized sharding beyond table-wise requires split scale/shift".to_string(),
            ));
        }

        let mut grouped: Vec<(ShardingType, Vec<QuantShardingInfo>)> = Vec::new();
        for table in module.tables() {
            let sharding = plan.get(&table.name).ok_or_else(|| {
                EmxError::Config(format!("plan has no entry for table '{}'", table.name))
            })?;
            let shard = module.table_shard(&table.name)?;
            let info = QuantShardingInfo {
                table: table.clone(),
                sharding: sharding.clone(),
                bytes: shard.quant_bytes().to_vec(),
                scales: shard.scales().to_vec(),
                shifts: shard.shifts().to_vec(),
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
            let sharding = create_infer_embedding_sharding(sharding_type, infos, &env)?;
            let lookup = Arc::new(sharding.create_lookup(fused.split_scale_shift)?);
            if fused.register_lookups {
                registry.register(LookupHandle {
                    name: format!("quant_embedding_lookup/{}", sharding_type.as_str()),
                    sharding_type,
                    tables: sharding.table_names(),
                    quantized: true,
                })?;
            }
            strategies.push(QuantStrategy {
                sharding_type,
                sharding,
                lookup,
            });
        }
        info!(
            strategies = strategies.len(),
            world = env.world_size(),
            "sharded quantized collection constructed"
        );

        Ok(Self {
            env,
            registry,
            tables: module.tables().to_vec(),
            strategies,
            dim: module.embedding_dim(),
            need_indices: module.need_indices(),
            fused,
            lifecycle: Mutex::new(DistLifecycle::Uninit),
        })
    }

    pub fn registry(&self) -> &Arc<LookupRegistry> {
        &self.registry
    }

    pub fn sharding_types(&self) -> Vec<ShardingType> {
        self.strategies.iter().map(|s| s.sharding_type).collect()
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.strategies
            .iter()
            .flat_map(|s| s.sharding.feature_names())
            .collect()
    }

    pub fn embedding_names_per_rank(&self) -> Vec<Vec<Vec<String>>> {
        self.strategies
            .iter()
            .map(|s| s.sharding.embedding_names_per_rank())
            .collect()
    }

    fn ensure_ready(&self, features: &KeyedJaggedTensor) -> EmxResult<Arc<ReadyDists>> {
        let mut lifecycle = self.lifecycle.lock();
        if let DistLifecycle::Ready(ready) = &*lifecycle {
            return Ok(ready.clone());
        }

        let canonical = self.feature_names();
        let order = features_order(&canonical, features)?;
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
            "quantized input/output dist initialized from first batch"
        );

        let ready = Arc::new(ReadyDists {
            features_order: order,
            group_sizes,
            input_dists,
            output_dists,
        });
        *lifecycle = DistLifecycle::Ready(ready.clone());
        Ok(ready)
    }

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
        for rank in 0..self.env.world_size() {
            ctx.record_stream(&self.env.pool().stream(rank)?);
        }
        Ok(ctx)
    }

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
        handles
            .into_iter()
            .map(|per_rank| per_rank.into_iter().map(|h| h.wait()).collect())
            .collect()
    }

    pub fn output_dist(
        &self,
        ctx: &EmbeddingCollectionContext,
        outputs: &[Vec<LookupOutput>],
    ) -> EmxResult<HashMap<String, JaggedTensor>> {
        let ready = match &*self.lifecycle.lock() {
            DistLifecycle::Ready(ready) => ready.clone(),
            DistLifecycle::Uninit => {
                return Err(EmxError::MissingContext(
                    "output stage invoked before any input_dist call".to_string(),
                ));
            }
        };
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

    pub fn compute_and_output_dist(
        &self,
        ctx: &EmbeddingCollectionContext,
    ) -> EmxResult<HashMap<String, JaggedTensor>> {
        let outputs = self.compute(ctx)?;
        self.output_dist(ctx, &outputs)
    }

    pub fn forward(
        &self,
        features: &KeyedJaggedTensor,
    ) -> EmxResult<HashMap<String, JaggedTensor>> {
        let ctx = self.input_dist(features)?;
        self.compute_and_output_dist(&ctx)
    }

    /// Map shard-local quantized rows back into the full table address
    /// space. Keys match [`QuantizedEmbeddingCollection::state_dict`],
    /// so a restore goes through the unsharded module and a re-shard.
    pub fn state_dict(&self, prefix: &str) -> EmxResult<StateDict> {
        let mut state = StateDict::new();
        for table in &self.tables {
            let rows = table.num_embeddings;
            let mut bytes = vec![0u8; rows * self.dim];
            let mut scales = vec![0.0f32; rows];
            let mut shifts = vec![0.0f32; rows];
            for strategy in &self.strategies {
                for shard in strategy.lookup.unique_shards() {
                    if shard.meta().table != table.name {
                        continue;
                    }
                    let meta = shard.meta();
                    if let Some(map) = shard.row_map() {
                        for (&global, &local) in map {
                            let g = global as usize;
                            bytes[g * self.dim..(g + 1) * self.dim].copy_from_slice(
                                &shard.quant_bytes()[local * self.dim..(local + 1) * self.dim],
                            );
                            scales[g] = shard.scales()[local];
                            shifts[g] = shard.shifts()[local];
                        }
                    } else {
                        for r in 0..meta.rows {
                            let g = meta.row_offset + r;
                            bytes[g * self.dim..(g + 1) * self.dim].copy_from_slice(
                                &shard.quant_bytes()[r * self.dim..(r + 1) * self.dim],
                            );
                            scales[g] = shard.scales()[r];
                            shifts[g] = shard.shifts()[r];
                        }
                    }
                }
            }
            if self.fused.split_scale_shift {
                state.insert(
                    qualified_key(prefix, &table.name, "weight"),
                    StateTensor::Quantized(QuantWeightTensor::split(rows, self.dim, bytes)),
                );
                state.insert(
                    qualified_key(prefix, &table.name, "weight_qscale"),
                    StateTensor::Dense(WeightTensor::new(rows, 1, scales)?),
                );
                state.insert(
                    qualified_key(prefix, &table.name, "weight_qshift"),
                    StateTensor::Dense(WeightTensor::new(rows, 1, shifts)?),
                );
            } else {
                state.insert(
                    qualified_key(prefix, &table.name, "weight"),
                    StateTensor::Quantized(QuantWeightTensor::fused(
                        rows, self.dim, &bytes, &scales, &shifts,
                    )),
                );
            }
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ParameterSharding;

    fn tables() -> Vec<EmbeddingTableConfig> {
        vec![
            EmbeddingTableConfig::new("table_0", vec!["feature_0".to_string()], 4, 4).unwrap(),
            EmbeddingTableConfig::new("table_1", vec!["feature_1".to_string()], 4, 4).unwrap(),
        ]
    }

    fn quantized(fused: FusedParams) -> QuantizedEmbeddingCollection {
        let module = EmbeddingCollection::new(tables(), false).unwrap();
        QuantizedEmbeddingCollection::quantize(&module, fused).unwrap()
    }

    fn batch() -> KeyedJaggedTensor {
        KeyedJaggedTensor::from_lengths(
            vec!["feature_0".to_string(), "feature_1".to_string()],
            vec![0, 1, 2, 0, 1, 2],
            vec![2, 0, 1, 2, 0, 1],
            None,
        )
        .unwrap()
    }

    #[test]
    fn quantized_forward_tracks_the_dense_module() {
        let module = EmbeddingCollection::new(tables(), false).unwrap();
        let dense = module.forward(&batch()).unwrap();
        let quant = QuantizedEmbeddingCollection::quantize(&module, FusedParams::default())
            .unwrap()
            .forward(&batch())
            .unwrap();
        for (key, jt) in &dense {
            let qt = &quant[key];
            assert_eq!(jt.lengths(), qt.lengths());
            for (a, b) in jt.values().iter().zip(qt.values()) {
                assert!((a - b).abs() < 0.01);
            }
        }
    }

    #[test]
    fn tables_are_marked_int8() {
        let qec = quantized(FusedParams::default());
        assert!(qec.tables().iter().all(|t| t.data_type == DataType::Int8));
    }

    #[test]
    fn fused_layout_restricts_plans_to_table_wise() {
        let qec = quantized(FusedParams::default());
        let env = ShardingEnv::new_local(2).unwrap();
        let mut plan = ShardingPlan::new();
        plan.insert(
            "table_0",
            ParameterSharding::new(ShardingType::RowWise, vec![0, 1]),
        );
        plan.insert(
            "table_1",
            ParameterSharding::new(ShardingType::TableWise, vec![1]),
        );
        let err = match ShardedQuantEmbeddingCollection::shard(
            &qec,
            &plan,
            env,
            Arc::new(LookupRegistry::new()),
        ) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(err.to_string().contains("split scale/shift"));
    }

    #[test]
    fn register_lookups_publishes_quantized_handles() {
        let qec = quantized(FusedParams {
            split_scale_shift: true,
            register_lookups: true,
        });
        let env = ShardingEnv::new_local(2).unwrap();
        let registry = Arc::new(LookupRegistry::new());
        let mut plan = ShardingPlan::new();
        plan.insert(
            "table_0",
            ParameterSharding::new(ShardingType::TableWise, vec![0]),
        );
        plan.insert(
            "table_1",
            ParameterSharding::new(ShardingType::RowWise, vec![0, 1]),
        );
        let _sharded =
            ShardedQuantEmbeddingCollection::shard(&qec, &plan, env, registry.clone()).unwrap();
        let handle = registry.get("quant_embedding_lookup/row_wise").unwrap();
        assert!(handle.quantized);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn sharded_quant_forward_matches_the_unsharded_module() {
        let qec = quantized(FusedParams {
            split_scale_shift: true,
            register_lookups: false,
        });
        let reference = qec.forward(&batch()).unwrap();

        let env = ShardingEnv::new_local(2).unwrap();
        let mut plan = ShardingPlan::new();
        plan.insert(
            "table_0",
            ParameterSharding::new(ShardingType::TableWise, vec![1]),
        );
        plan.insert(
            "table_1",
            ParameterSharding::new(ShardingType::RowWise, vec![0, 1]),
        );
        let sharded = ShardedQuantEmbeddingCollection::shard(
            &qec,
            &plan,
            env,
            Arc::new(LookupRegistry::new()),
        )
        .unwrap();
        let out = sharded.forward(&batch()).unwrap();
        assert_eq!(out.len(), reference.len());
        for (key, jt) in &reference {
            assert_eq!(&out[key], jt);
        }
    }

    #[test]
    fn state_dict_round_trips_byte_identical() {
        let mut qec = quantized(FusedParams {
            split_scale_shift: true,
            register_lookups: false,
        });
        let before = qec.forward(&batch()).unwrap();
        let state = qec.state_dict("qec").unwrap();
        assert!(state.contains_key("qec.table_0.weight"));
        assert!(state.contains_key("qec.table_0.weight_qscale"));
        assert!(state.contains_key("qec.table_0.weight_qshift"));

        qec.load_state_dict("qec", &state).unwrap();
        assert_eq!(qec.forward(&batch()).unwrap(), before);
    }

    #[test]
    fn fused_state_dict_round_trips() {
        let mut qec = quantized(FusedParams::default());
        let before = qec.forward(&batch()).unwrap();
        let state = qec.state_dict("qec").unwrap();
        assert!(!state.contains_key("qec.table_0.weight_qscale"));
        qec.load_state_dict("qec", &state).unwrap();
        assert_eq!(qec.forward(&batch()).unwrap(), before);
    }

    #[test]
    fn sharded_state_dict_reassembles_full_tables() {
        let qec = quantized(FusedParams {
            split_scale_shift: true,
            register_lookups: false,
        });
        let unsharded_state = qec.state_dict("qec").unwrap();

        let env = ShardingEnv::new_local(2).unwrap();
        let mut plan = ShardingPlan::new();
        plan.insert(
            "table_0",
            ParameterSharding::new(ShardingType::RowWise, vec![0, 1]),
        );
        plan.insert(
            "table_1",
            ParameterSharding::new(ShardingType::TableWise, vec![0]),
        );
        let sharded = ShardedQuantEmbeddingCollection::shard(
            &qec,
            &plan,
            env,
            Arc::new(LookupRegistry::new()),
        )
        .unwrap();
        assert_eq!(sharded.state_dict("qec").unwrap(), unsharded_state);
    }
}
