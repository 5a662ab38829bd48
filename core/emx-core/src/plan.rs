//! Sharding plan — the planner's output, consumed read-only.
//!
//! The plan maps every table to a sharding type and a destination
//! placement. EMX never second-guesses it: an unsupported combination is
//! a construction-time [`EmxError::Config`], not something to repair.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{BoundsCheckMode, CacheParams};
use crate::error::{EmxError, EmxResult};

/// How a table's parameter space is partitioned across destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardingType {
    TableWise,
    RowWise,
    ColumnWise,
    TableRowWise,
    DataParallel,
}

impl ShardingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardingType::TableWise => "table_wise",
            ShardingType::RowWise => "row_wise",
            ShardingType::ColumnWise => "column_wise",
            ShardingType::TableRowWise => "table_row_wise",
            ShardingType::DataParallel => "data_parallel",
        }
    }
}

/// How row ids are mapped to destinations under row-wise sharding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BucketizeMode {
    /// Contiguous row ranges: destination `id / ceil(rows / world)`.
    #[default]
    Block,
    /// Hashed ids: destination `hash(id) % world`.
    Hash,
}

/// Per-table sharding decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSharding {
    pub sharding_type: ShardingType,
    /// Destination ranks, in placement order. Meaning depends on the
    /// sharding type: the single owner for table-wise, the bucket ranks
    /// for row-wise / table-row-wise, one rank per column shard for
    /// column-wise, every replica rank for data-parallel.
    pub ranks: Vec<usize>,
    #[serde(default)]
    pub bucketize_mode: BucketizeMode,
    #[serde(default)]
    pub cache_params: Option<CacheParams>,
    #[serde(default)]
    pub bounds_check_mode: BoundsCheckMode,
    #[serde(default)]
    pub stochastic_rounding: bool,
    #[serde(default)]
    pub enforce_in_fast_memory: bool,
}

impl ParameterSharding {
    pub fn new(sharding_type: ShardingType, ranks: Vec<usize>) -> Self {
        Self {
            sharding_type,
            ranks,
            bucketize_mode: BucketizeMode::Block,
            cache_params: None,
            bounds_check_mode: BoundsCheckMode::default(),
            stochastic_rounding: false,
            enforce_in_fast_memory: false,
        }
    }
}

/// Fully-qualified table name → sharding decision.
///
/// BTreeMap so that iteration order (and therefore strategy grouping
/// order) is deterministic across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardingPlan {
    pub plan: BTreeMap<String, ParameterSharding>,
}

impl ShardingPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: impl Into<String>, sharding: ParameterSharding) -> &mut Self {
        self.plan.insert(table.into(), sharding);
        self
    }

    pub fn get(&self, table: &str) -> Option<&ParameterSharding> {
        self.plan.get(table)
    }

    /// Parse a plan handed over by an external planner as JSON.
    pub fn from_json(json: &str) -> EmxResult<Self> {
        let plan: ShardingPlan = serde_json::from_str(json)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn to_json(&self) -> EmxResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Structural validation: every entry names at least one rank, and
    /// table-wise entries exactly one.
    pub fn validate(&self) -> EmxResult<()> {
        for (table, sharding) in &self.plan {
            if sharding.ranks.is_empty() {
                return Err(EmxError::Config(format!(
                    "plan entry for table '{}' names no destination ranks",
                    table
                )));
            }
            if sharding.sharding_type == ShardingType::TableWise && sharding.ranks.len() != 1 {
                return Err(EmxError::Config(format!(
                    "table-wise plan entry for table '{}' must name exactly one rank, got {}",
                    table,
                    sharding.ranks.len()
                )));
            }
        }
        Ok(())
    }

    /// Distinct sharding types present, in deterministic order.
    pub fn sharding_types(&self) -> Vec<ShardingType> {
        let mut types: Vec<ShardingType> =
            self.plan.values().map(|p| p.sharding_type).collect();
        types.sort();
        types.dedup();
        types
    }
}
