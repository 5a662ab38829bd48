//! Sharding strategies.
//!
//! One variant per sharding type, behind one closed enum — the
//! orchestrator treats them uniformly through the three factory
//! capabilities (`create_input_dist`, `create_lookup`,
//! `create_output_dist`) plus the name listings used for output
//! alignment. Construction is keyed on the plan's sharding-type tag;
//! an unsupported tag is a configuration error, not a fallback.

pub mod column_wise;
pub mod data_parallel;
pub mod infer;
pub mod row_wise;
pub mod table_row_wise;
pub mod table_wise;

use std::sync::Arc;

use ahash::RandomState;

use crate::config::EmbeddingTableConfig;
use crate::error::{EmxError, EmxResult};
use crate::lookup::{GroupedEmbeddingLookup, LookupOutput};
use crate::plan::{ParameterSharding, ShardingType};
use crate::sparse::KeyedJaggedTensor;
use crate::stream::StreamPool;

pub use infer::{InferEmbeddingSharding, create_infer_embedding_sharding};

/// Opaque transport handle: world size plus the per-destination
/// execution streams. Distributors grab streams at construction time;
/// nothing in the core interprets the handle beyond that.
#[derive(Clone)]
pub struct ShardingEnv {
    world_size: usize,
    local_rank: usize,
    pool: Arc<StreamPool>,
}

impl ShardingEnv {
    /// Process-local environment: one in-process stream per rank.
    pub fn new_local(world_size: usize) -> EmxResult<Self> {
        if world_size == 0 {
            return Err(EmxError::Config("world size must be non-zero".to_string()));
        }
        Ok(Self {
            world_size,
            local_rank: 0,
            pool: Arc::new(StreamPool::new(world_size)),
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    pub fn pool(&self) -> &Arc<StreamPool> {
        &self.pool
    }
}

/// Deterministic hasher for hash bucketization. Input distributor and
/// shard construction must agree on placements, so the seeds are fixed.
pub(crate) fn bucket_hasher() -> RandomState {
    RandomState::with_seeds(0x243F_6A88, 0x85A3_08D3, 0x1319_8A2E, 0x0370_7344)
}

/// One table assigned to a sharding strategy: config, plan entry, and a
/// weight snapshot taken when the module was sharded.
pub struct EmbeddingShardingInfo {
    pub table: Arc<EmbeddingTableConfig>,
    pub sharding: ParameterSharding,
    pub weights: Vec<f32>,
}

/// Result of one strategy's input distribution. The caller retains the
/// pre-distribution feature subset itself; only routing products live
/// here.
pub struct DistResult {
    /// Redistributed features, one entry per destination rank.
    pub features: Vec<Arc<KeyedJaggedTensor>>,
    /// Inverse of bucketization, present for the row-wise family.
    pub unbucketize_permute: Option<Arc<Vec<usize>>>,
}

/// Input distributor: partitions a strategy's feature subset across
/// destinations.
pub enum InputDist {
    TableWise(table_wise::TwInputDist),
    RowWise(row_wise::RwInputDist),
    ColumnWise(column_wise::CwInputDist),
    DataParallel(data_parallel::DpInputDist),
}

impl InputDist {
    pub fn distribute(&self, features: &KeyedJaggedTensor) -> EmxResult<DistResult> {
        match self {
            InputDist::TableWise(dist) => dist.distribute(features),
            InputDist::RowWise(dist) => dist.distribute(features),
            InputDist::ColumnWise(dist) => dist.distribute(features),
            InputDist::DataParallel(dist) => dist.distribute(features),
        }
    }
}

/// Output distributor: inverts the matching input distribution.
pub enum OutputDist {
    TableWise(table_wise::TwOutputDist),
    RowWise(row_wise::RwOutputDist),
    ColumnWise(column_wise::CwOutputDist),
    DataParallel(data_parallel::DpOutputDist),
}

impl OutputDist {
    /// Reassemble per-feature jagged results from raw per-rank outputs.
    /// `outputs` is indexed by destination rank.
    pub fn assemble(
        &self,
        outputs: &[LookupOutput],
        ctx: &crate::context::SequenceShardingContext,
        need_indices: bool,
    ) -> EmxResult<std::collections::HashMap<String, crate::sparse::JaggedTensor>> {
        match self {
            OutputDist::TableWise(dist) => dist.assemble(outputs, ctx, need_indices),
            OutputDist::RowWise(dist) => dist.assemble(outputs, ctx, need_indices),
            OutputDist::ColumnWise(dist) => dist.assemble(outputs, ctx, need_indices),
            OutputDist::DataParallel(dist) => dist.assemble(outputs, ctx, need_indices),
        }
    }

    /// Inverse of [`OutputDist::assemble`]: route per-feature output
    /// gradients back into one raw gradient per destination rank.
    pub fn backward(
        &self,
        grads: &std::collections::HashMap<String, crate::sparse::JaggedTensor>,
        ctx: &crate::context::SequenceShardingContext,
    ) -> EmxResult<Vec<Vec<f32>>> {
        match self {
            OutputDist::TableWise(dist) => dist.backward(grads, ctx),
            OutputDist::RowWise(dist) => dist.backward(grads, ctx),
            OutputDist::ColumnWise(dist) => dist.backward(grads, ctx),
            OutputDist::DataParallel(dist) => dist.backward(grads, ctx),
        }
    }
}

/// Trainable sharding strategy, one variant per sharding type.
pub enum EmbeddingSharding {
    TableWise(table_wise::TwSharding),
    RowWise(row_wise::RwSharding),
    ColumnWise(column_wise::CwSharding),
    TableRowWise(table_row_wise::TwRwSharding),
    DataParallel(data_parallel::DpSharding),
}

/// Build the strategy for `sharding_type` over its assigned tables.
pub fn create_embedding_sharding(
    sharding_type: ShardingType,
    infos: Vec<EmbeddingShardingInfo>,
    env: &ShardingEnv,
) -> EmxResult<EmbeddingSharding> {
    if infos.is_empty() {
        return Err(EmxError::Config(format!(
            "sharding type {} has no assigned tables",
            sharding_type.as_str()
        )));
    }
    match sharding_type {
        ShardingType::TableWise => Ok(EmbeddingSharding::TableWise(table_wise::TwSharding::new(
            infos, env,
        )?)),
        ShardingType::RowWise => Ok(EmbeddingSharding::RowWise(row_wise::RwSharding::new(
            infos, env,
        )?)),
        ShardingType::ColumnWise => Ok(EmbeddingSharding::ColumnWise(
            column_wise::CwSharding::new(infos, env)?,
        )),
        ShardingType::TableRowWise => Ok(EmbeddingSharding::TableRowWise(
            table_row_wise::TwRwSharding::new(infos, env)?,
        )),
        ShardingType::DataParallel => Ok(EmbeddingSharding::DataParallel(
            data_parallel::DpSharding::new(infos, env)?,
        )),
    }
}

impl EmbeddingSharding {
    /// Features this strategy owns, in its canonical order.
    pub fn feature_names(&self) -> Vec<String> {
        match self {
            EmbeddingSharding::TableWise(s) => s.feature_names(),
            EmbeddingSharding::RowWise(s) => s.feature_names(),
            EmbeddingSharding::ColumnWise(s) => s.feature_names(),
            EmbeddingSharding::TableRowWise(s) => s.feature_names(),
            EmbeddingSharding::DataParallel(s) => s.feature_names(),
        }
    }

    /// Output feature names, aligned with `feature_names`.
    pub fn embedding_names(&self) -> Vec<String> {
        self.feature_names()
    }

    /// Which output features each destination rank produces.
    pub fn embedding_names_per_rank(&self) -> Vec<Vec<String>> {
        match self {
            EmbeddingSharding::TableWise(s) => s.embedding_names_per_rank(),
            EmbeddingSharding::RowWise(s) => s.embedding_names_per_rank(),
            EmbeddingSharding::ColumnWise(s) => s.embedding_names_per_rank(),
            EmbeddingSharding::TableRowWise(s) => s.embedding_names_per_rank(),
            EmbeddingSharding::DataParallel(s) => s.embedding_names_per_rank(),
        }
    }

    pub fn create_input_dist(&self) -> EmxResult<InputDist> {
        match self {
            EmbeddingSharding::TableWise(s) => s.create_input_dist(),
            EmbeddingSharding::RowWise(s) => s.create_input_dist(),
            EmbeddingSharding::ColumnWise(s) => s.create_input_dist(),
            EmbeddingSharding::TableRowWise(s) => s.create_input_dist(),
            EmbeddingSharding::DataParallel(s) => s.create_input_dist(),
        }
    }

    pub fn create_lookup(&self) -> EmxResult<GroupedEmbeddingLookup> {
        match self {
            EmbeddingSharding::TableWise(s) => s.create_lookup(),
            EmbeddingSharding::RowWise(s) => s.create_lookup(),
            EmbeddingSharding::ColumnWise(s) => s.create_lookup(),
            EmbeddingSharding::TableRowWise(s) => s.create_lookup(),
            EmbeddingSharding::DataParallel(s) => s.create_lookup(),
        }
    }

    pub fn create_output_dist(&self) -> EmxResult<OutputDist> {
        match self {
            EmbeddingSharding::TableWise(s) => s.create_output_dist(),
            EmbeddingSharding::RowWise(s) => s.create_output_dist(),
            EmbeddingSharding::ColumnWise(s) => s.create_output_dist(),
            EmbeddingSharding::TableRowWise(s) => s.create_output_dist(),
            EmbeddingSharding::DataParallel(s) => s.create_output_dist(),
        }
    }

    /// Table names in this group, for registry handles and state dicts.
    pub fn table_names(&self) -> Vec<String> {
        match self {
            EmbeddingSharding::TableWise(s) => s.table_names(),
            EmbeddingSharding::RowWise(s) => s.table_names(),
            EmbeddingSharding::ColumnWise(s) => s.table_names(),
            EmbeddingSharding::TableRowWise(s) => s.table_names(),
            EmbeddingSharding::DataParallel(s) => s.table_names(),
        }
    }
}
