//! Embedding table configuration types.
//!
//! Table configs are immutable, created at model-definition time and
//! shared by reference across sharding decisions.

use serde::{Deserialize, Serialize};

use crate::error::{EmxError, EmxResult};

/// Storage precision of a table or of a cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DataType {
    #[default]
    Fp32,
    Fp16,
    Int8,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Fp32 => "fp32",
            DataType::Fp16 => "fp16",
            DataType::Int8 => "int8",
        }
    }
}

/// Eviction algorithm for the row cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheAlgorithm {
    Lru,
    Lfu,
}

/// Row-cache sizing and placement, produced by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheParams {
    pub algorithm: CacheAlgorithm,
    /// Fraction of table rows the cache may hold (0, 1].
    pub load_factor: f32,
    /// Bytes reserved for the cache tier on the destination.
    pub reserved_memory: f64,
    /// Storage precision hint for cached rows.
    pub precision: DataType,
}

/// What the lookup does when a row id falls outside the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BoundsCheckMode {
    /// Clamp silently.
    Ignore,
    /// Clamp and log a warning.
    Warning,
    /// Fail the forward pass.
    #[default]
    Fatal,
    /// No pre-check pass is run; an out-of-range id still fails the
    /// gather itself.
    None,
}

/// One embedding table: name, the features it serves, and its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingTableConfig {
    pub name: String,
    pub feature_names: Vec<String>,
    pub embedding_dim: usize,
    pub num_embeddings: usize,
    #[serde(default)]
    pub data_type: DataType,
}

impl EmbeddingTableConfig {
    pub fn new(
        name: impl Into<String>,
        feature_names: Vec<String>,
        embedding_dim: usize,
        num_embeddings: usize,
    ) -> EmxResult<Self> {
        let name = name.into();
        if embedding_dim == 0 || num_embeddings == 0 {
            return Err(EmxError::Config(format!(
                "table '{}' must have non-zero rows and dim",
                name
            )));
        }
        if feature_names.is_empty() {
            return Err(EmxError::Config(format!(
                "table '{}' serves no features",
                name
            )));
        }
        Ok(Self {
            name,
            feature_names,
            embedding_dim,
            num_embeddings,
            data_type: DataType::Fp32,
        })
    }
}
