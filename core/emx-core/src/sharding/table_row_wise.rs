//! Table-row-wise sharding: row buckets confined to a table's host ranks.
//!
//! Same bucketization machinery as row-wise, but each table's rows only
//! spread over the rank subset the planner kept on one host. A rank
//! outside every table's subset sees empty batches and produces empty
//! outputs.

use crate::error::{EmxError, EmxResult};
use crate::lookup::GroupedEmbeddingLookup;

use super::row_wise::RwSharding;
use super::{EmbeddingShardingInfo, InputDist, OutputDist, ShardingEnv};

pub struct TwRwSharding {
    inner: RwSharding,
}

impl TwRwSharding {
    pub fn new(infos: Vec<EmbeddingShardingInfo>, env: &ShardingEnv) -> EmxResult<Self> {
        for info in &infos {
            if info.sharding.ranks.len() > env.world_size() {
                return Err(EmxError::Config(format!(
                    "table '{}' names {} host ranks in a world of {}",
                    info.table.name,
                    info.sharding.ranks.len(),
                    env.world_size()
                )));
            }
        }
        Ok(Self {
            inner: RwSharding::new(infos, env)?,
        })
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.inner.feature_names()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.inner.table_names()
    }

    pub fn embedding_names_per_rank(&self) -> Vec<Vec<String>> {
        self.inner.embedding_names_per_rank()
    }

    pub fn create_input_dist(&self) -> EmxResult<InputDist> {
        self.inner.create_input_dist()
    }

    pub fn create_lookup(&self) -> EmxResult<GroupedEmbeddingLookup> {
        self.inner.create_lookup()
    }

    pub fn create_output_dist(&self) -> EmxResult<OutputDist> {
        self.inner.create_output_dist()
    }
}
