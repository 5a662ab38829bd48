//! Unsharded embedding collection.
//!
//! The module that gets sharded: every table fully resident, one dense
//! lookup per feature. Doubles as the numerical reference in round-trip
//! tests — a sharded collection must reproduce its outputs exactly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ahash::RandomState;
use tracing::debug;

use crate::checkpoint::{StateDict, StateTensor, WeightTensor, qualified_key};
use crate::config::{BoundsCheckMode, EmbeddingTableConfig};
use crate::error::{EmxError, EmxResult};
use crate::kernel::{DenseShard, ShardMeta, uniform_init};
use crate::sparse::{JaggedTensor, KeyedJaggedTensor};

/// Trainable embedding collection, one full-width store per table.
pub struct EmbeddingCollection {
    tables: Vec<Arc<EmbeddingTableConfig>>,
    shards: BTreeMap<String, Arc<DenseShard>>,
    feature_to_table: HashMap<String, String>,
    dim: usize,
    need_indices: bool,
}

impl EmbeddingCollection {
    /// Build a collection with seeded uniform weights. Every table must
    /// share one embedding dim and no two tables may claim one feature.
    pub fn new(tables: Vec<EmbeddingTableConfig>, need_indices: bool) -> EmxResult<Self> {
        if tables.is_empty() {
            return Err(EmxError::Config("collection holds no tables".to_string()));
        }
        let dim = tables[0].embedding_dim;
        let mut shards = BTreeMap::new();
        let mut feature_to_table = HashMap::new();
        let mut table_arcs = Vec::with_capacity(tables.len());

        let hasher = RandomState::with_seeds(7, 11, 13, 17);
        for table in tables {
            if table.embedding_dim != dim {
                return Err(EmxError::Config(format!(
                    "table '{}' has dim {} but the collection uses {}",
                    table.name, table.embedding_dim, dim
                )));
            }
            for feature in &table.feature_names {
                if let Some(other) =
                    feature_to_table.insert(feature.clone(), table.name.clone())
                {
                    return Err(EmxError::Config(format!(
                        "feature '{}' is claimed by both '{}' and '{}'",
                        feature, other, table.name
                    )));
                }
            }
            let seed = hasher.hash_one(&table.name);
            let shard = DenseShard::new(
                ShardMeta {
                    table: table.name.clone(),
                    row_offset: 0,
                    rows: table.num_embeddings,
                    col_offset: 0,
                    cols: dim,
                },
                uniform_init(table.num_embeddings, dim, seed),
                None,
                BoundsCheckMode::Fatal,
            )?;
            shards.insert(table.name.clone(), Arc::new(shard));
            table_arcs.push(Arc::new(table));
        }

        Ok(Self {
            tables: table_arcs,
            shards,
            feature_to_table,
            dim,
            need_indices,
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

    /// Current weights of one table, row-major.
    pub fn weights(&self, table: &str) -> EmxResult<Vec<f32>> {
        Ok(self.table_shard(table)?.store().snapshot())
    }

    fn table_shard(&self, table: &str) -> EmxResult<&Arc<DenseShard>> {
        self.shards
            .get(table)
            .ok_or_else(|| EmxError::TableNotFound(table.to_string()))
    }

    fn shard_for_feature(&self, feature: &str) -> EmxResult<&Arc<DenseShard>> {
        let table = self.feature_to_table.get(feature).ok_or_else(|| {
            EmxError::Config(format!("no table serves feature '{}'", feature))
        })?;
        self.table_shard(table)
    }

    /// Reference forward pass: per-feature gather straight from the full
    /// tables.
    pub fn forward(
        &self,
        features: &KeyedJaggedTensor,
    ) -> EmxResult<HashMap<String, JaggedTensor>> {
        let offsets = features.offset_per_key();
        let mut out = HashMap::with_capacity(features.keys().len());
        for (k, key) in features.keys().iter().enumerate() {
            let shard = self.shard_for_feature(key)?;
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
        debug!(features = features.keys().len(), "unsharded forward pass");
        Ok(out)
    }

    /// Accumulate per-feature output gradients into the table gradient
    /// buffers. `grads` must cover every key of `features`.
    pub fn backward(
        &self,
        features: &KeyedJaggedTensor,
        grads: &HashMap<String, JaggedTensor>,
    ) -> EmxResult<()> {
        let offsets = features.offset_per_key();
        for (k, key) in features.keys().iter().enumerate() {
            let grad = grads.get(key).ok_or_else(|| {
                EmxError::InvariantViolation(format!("gradient missing for feature '{}'", key))
            })?;
            let ids = &features.values()[offsets[k]..offsets[k + 1]];
            if grad.rows() != ids.len() || grad.dim() != self.dim {
                return Err(EmxError::InvariantViolation(format!(
                    "gradient for feature '{}' has shape {}x{}, expected {}x{}",
                    key,
                    grad.rows(),
                    grad.dim(),
                    ids.len(),
                    self.dim
                )));
            }
            self.shard_for_feature(key)?.scatter_add(ids, grad.values())?;
        }
        Ok(())
    }

    /// External optimizer hook: one SGD step over accumulated gradients.
    pub fn apply_sgd(&self, lr: f32) {
        for shard in self.shards.values() {
            shard.store().apply_sgd(lr);
        }
    }

    pub fn state_dict(&self, prefix: &str) -> EmxResult<StateDict> {
        let mut state = StateDict::new();
        for (name, shard) in &self.shards {
            state.insert(
                qualified_key(prefix, name, "weight"),
                StateTensor::Dense(WeightTensor::new(
                    shard.meta().rows,
                    shard.meta().cols,
                    shard.store().snapshot(),
                )?),
            );
        }
        Ok(state)
    }

    pub fn load_state_dict(&self, prefix: &str, state: &StateDict) -> EmxResult<()> {
        for (name, shard) in &self.shards {
            let key = qualified_key(prefix, name, "weight");
            let tensor = state.get(&key).ok_or_else(|| {
                EmxError::CheckpointFailed(format!("state dict has no entry '{}'", key))
            })?;
            match tensor {
                StateTensor::Dense(w) => shard.store().load(&w.data)?,
                StateTensor::Quantized(_) => {
                    return Err(EmxError::CheckpointFailed(format!(
                        "entry '{}' is quantized but the collection is dense",
                        key
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> Vec<EmbeddingTableConfig> {
        vec![
            EmbeddingTableConfig::new("table_0", vec!["feature_0".to_string()], 4, 4).unwrap(),
            EmbeddingTableConfig::new("table_1", vec!["feature_1".to_string()], 4, 4).unwrap(),
        ]
    }

    fn ramp_state(prefix: &str) -> StateDict {
        let mut state = StateDict::new();
        let row = |base: f32| -> Vec<f32> {
            let mut data = Vec::new();
            for r in 0..4 {
                data.extend_from_slice(&[base + r as f32; 4]);
            }
            data
        };
        state.insert(
            qualified_key(prefix, "table_0", "weight"),
            StateTensor::Dense(WeightTensor::new(4, 4, row(1.0)).unwrap()),
        );
        state.insert(
            qualified_key(prefix, "table_1", "weight"),
            StateTensor::Dense(WeightTensor::new(4, 4, row(101.0)).unwrap()),
        );
        state
    }

    #[test]
    fn forward_gathers_rows_per_feature() {
        let ec = EmbeddingCollection::new(tables(), false).unwrap();
        ec.load_state_dict("", &ramp_state("")).unwrap();

        let kjt = KeyedJaggedTensor::from_lengths(
            vec!["feature_0".to_string(), "feature_1".to_string()],
            vec![0, 1, 2, 0, 1, 2],
            vec![2, 0, 1, 2, 0, 1],
            None,
        )
        .unwrap();
        let out = ec.forward(&kjt).unwrap();
        let f0 = &out["feature_0"];
        assert_eq!(f0.lengths(), &[2, 0, 1]);
        assert_eq!(f0.row(0), &[1.0; 4]);
        assert_eq!(f0.row(1), &[2.0; 4]);
        assert_eq!(f0.row(2), &[3.0; 4]);
        let f1 = &out["feature_1"];
        assert_eq!(f1.row(2), &[103.0; 4]);
        assert!(f1.weights().is_none());
    }

    #[test]
    fn need_indices_carries_ids_through_weights() {
        let ec = EmbeddingCollection::new(tables(), true).unwrap();
        let kjt = KeyedJaggedTensor::from_lengths(
            vec!["feature_0".to_string(), "feature_1".to_string()],
            vec![3, 1, 2],
            vec![1, 1, 0, 0, 1, 0],
            None,
        )
        .unwrap();
        let out = ec.forward(&kjt).unwrap();
        assert_eq!(out["feature_0"].weights().unwrap(), &[3.0, 1.0]);
        assert_eq!(out["feature_1"].weights().unwrap(), &[2.0]);
    }

    #[test]
    fn state_dict_round_trips_weights() {
        let ec = EmbeddingCollection::new(tables(), false).unwrap();
        ec.load_state_dict("", &ramp_state("")).unwrap();
        let state = ec.state_dict("embeddings").unwrap();

        let other = EmbeddingCollection::new(tables(), false).unwrap();
        other.load_state_dict("embeddings", &state).unwrap();
        assert_eq!(ec.weights("table_0").unwrap(), other.weights("table_0").unwrap());
        assert_eq!(ec.weights("table_1").unwrap(), other.weights("table_1").unwrap());
    }

    #[test]
    fn mixed_dims_are_rejected() {
        let tables = vec![
            EmbeddingTableConfig::new("table_0", vec!["feature_0".to_string()], 4, 4).unwrap(),
            EmbeddingTableConfig::new("table_1", vec!["feature_1".to_string()], 8, 4).unwrap(),
        ];
        assert!(matches!(
            EmbeddingCollection::new(tables, false),
            Err(EmxError::Config(_))
        ));
    }

    #[test]
    fn duplicate_feature_ownership_is_rejected() {
        let tables = vec![
            EmbeddingTableConfig::new("table_0", vec!["feature_0".to_string()], 4, 4).unwrap(),
            EmbeddingTableConfig::new("table_1", vec!["feature_0".to_string()], 4, 4).unwrap(),
        ];
        assert!(matches!(
            EmbeddingCollection::new(tables, false),
            Err(EmxError::Config(_))
        ));
    }
}
