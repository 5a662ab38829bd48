//! Jagged batch containers — `KeyedJaggedTensor` and `JaggedTensor`.
//!
//! `KeyedJaggedTensor`는 하나의 입력 배치를 표현한다: 키(피처 이름) 순서,
//! 플랫 값 버퍼, 키×예제 단위 길이 버퍼. 레이아웃은 key-major:
//!
//! ```text
//! keys    = ["feature_0", "feature_1"]            stride = 3
//! values  = [0, 1, 2, | 0, 1, 2]
//! lengths = [2, 0, 1, | 2, 0, 1]
//!            └ feature_0 ┘└ feature_1 ┘
//! ```
//!
//! Invariant: `sum(lengths) == values.len()` and
//! `lengths.len() == keys.len() * stride`. Constructors validate both;
//! violations are [`EmxError::InvariantViolation`].

use crate::error::{EmxError, EmxResult};
use smallvec::SmallVec;

/// One batch of sparse features, keyed by feature name.
///
/// Immutable after construction. `split` and `permute` derive new
/// instances; per-key and per-example value order is always preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedJaggedTensor {
    keys: Vec<String>,
    values: Vec<i64>,
    lengths: Vec<usize>,
    weights: Option<Vec<f32>>,
    stride: usize,
    length_per_key: Vec<usize>,
}

impl KeyedJaggedTensor {
    /// Build a batch from keys, a flat value buffer and key-major lengths.
    ///
    /// `stride` (examples per batch) is derived as
    /// `lengths.len() / keys.len()` and must divide evenly.
    pub fn from_lengths(
        keys: Vec<String>,
        values: Vec<i64>,
        lengths: Vec<usize>,
        weights: Option<Vec<f32>>,
    ) -> EmxResult<Self> {
        if keys.is_empty() {
            if !values.is_empty() || !lengths.is_empty() {
                return Err(EmxError::InvariantViolation(
                    "empty key set with non-empty values or lengths".to_string(),
                ));
            }
            return Ok(Self {
                keys,
                values,
                lengths,
                weights,
                stride: 0,
                length_per_key: Vec::new(),
            });
        }

        for (i, key) in keys.iter().enumerate() {
            if keys[..i].contains(key) {
                return Err(EmxError::InvariantViolation(format!(
                    "duplicate key '{}' in batch",
                    key
                )));
            }
        }

        if lengths.len() % keys.len() != 0 {
            return Err(EmxError::InvariantViolation(format!(
                "lengths buffer of {} entries is not divisible by {} keys",
                lengths.len(),
                keys.len()
            )));
        }
        let stride = lengths.len() / keys.len();

        let total: usize = lengths.iter().sum();
        if total != values.len() {
            return Err(EmxError::InvariantViolation(format!(
                "lengths sum to {} but value buffer holds {} entries",
                total,
                values.len()
            )));
        }
        if let Some(w) = &weights {
            if w.len() != values.len() {
                return Err(EmxError::InvariantViolation(format!(
                    "weight buffer holds {} entries for {} values",
                    w.len(),
                    values.len()
                )));
            }
        }

        let length_per_key = lengths
            .chunks(stride)
            .map(|chunk| chunk.iter().sum())
            .collect();

        Ok(Self {
            keys,
            values,
            lengths,
            weights,
            stride,
            length_per_key,
        })
    }

    /// An empty batch with a known stride (every key absent).
    pub fn empty(stride: usize) -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            lengths: Vec::new(),
            weights: None,
            stride,
            length_per_key: Vec::new(),
        }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn values(&self) -> &[i64] {
        &self.values
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn weights(&self) -> Option<&[f32]> {
        self.weights.as_deref()
    }

    /// Examples per batch; consistent across all keys.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Total number of values attributed to each key across the batch.
    ///
    /// Used to slice flat output tensors into per-key segments.
    pub fn length_per_key(&self) -> &[usize] {
        &self.length_per_key
    }

    /// Exclusive prefix sums of [`Self::length_per_key`], one extra entry
    /// at the end holding the total.
    pub fn offset_per_key(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.keys.len() + 1);
        let mut acc = 0usize;
        offsets.push(0);
        for len in &self.length_per_key {
            acc += len;
            offsets.push(acc);
        }
        offsets
    }

    /// Lengths slice for key index `k` (one entry per example).
    pub fn lengths_for_key(&self, k: usize) -> &[usize] {
        &self.lengths[k * self.stride..(k + 1) * self.stride]
    }

    /// Partition the ordered key sequence into contiguous groups.
    ///
    /// `group_sizes` must sum to the key count; each sub-batch carries
    /// only the values, lengths and weights belonging to its keys.
    pub fn split(&self, group_sizes: &[usize]) -> EmxResult<Vec<KeyedJaggedTensor>> {
        let total_keys: usize = group_sizes.iter().sum();
        if total_keys != self.keys.len() {
            return Err(EmxError::InvariantViolation(format!(
                "split sizes sum to {} but batch has {} keys",
                total_keys,
                self.keys.len()
            )));
        }

        let offsets = self.offset_per_key();
        let mut out = Vec::with_capacity(group_sizes.len());
        let mut key_start = 0usize;
        for &size in group_sizes {
            let key_end = key_start + size;
            let value_start = offsets[key_start];
            let value_end = offsets[key_end];

            let sub = KeyedJaggedTensor {
                keys: self.keys[key_start..key_end].to_vec(),
                values: self.values[value_start..value_end].to_vec(),
                lengths: self.lengths[key_start * self.stride..key_end * self.stride].to_vec(),
                weights: self
                    .weights
                    .as_ref()
                    .map(|w| w[value_start..value_end].to_vec()),
                stride: self.stride,
                length_per_key: self.length_per_key[key_start..key_end].to_vec(),
            };
            out.push(sub);
            key_start = key_end;
        }
        Ok(out)
    }

    /// Reorder keys (with their values, lengths and weights) by `order`.
    ///
    /// `order` must be a permutation of `0..keys.len()`. Which example
    /// owns which value never changes.
    pub fn permute(&self, order: &[usize]) -> EmxResult<KeyedJaggedTensor> {
        if order.len() != self.keys.len() {
            return Err(EmxError::InvariantViolation(format!(
                "permutation of {} entries applied to {} keys",
                order.len(),
                self.keys.len()
            )));
        }
        let mut seen: SmallVec<[bool; 16]> = SmallVec::from_elem(false, self.keys.len());
        for &idx in order {
            if idx >= self.keys.len() {
                return Err(EmxError::InvariantViolation(format!(
                    "permutation index {} outside {} keys",
                    idx,
                    self.keys.len()
                )));
            }
            if seen[idx] {
                return Err(EmxError::InvariantViolation(format!(
                    "permutation repeats key index {}",
                    idx
                )));
            }
            seen[idx] = true;
        }

        let offsets = self.offset_per_key();
        let mut keys = Vec::with_capacity(self.keys.len());
        let mut values = Vec::with_capacity(self.values.len());
        let mut lengths = Vec::with_capacity(self.lengths.len());
        let mut weights = self.weights.as_ref().map(|w| Vec::with_capacity(w.len()));
        let mut length_per_key = Vec::with_capacity(self.keys.len());

        for &idx in order {
            keys.push(self.keys[idx].clone());
            values.extend_from_slice(&self.values[offsets[idx]..offsets[idx + 1]]);
            lengths.extend_from_slice(self.lengths_for_key(idx));
            if let (Some(out), Some(src)) = (weights.as_mut(), self.weights.as_ref()) {
                out.extend_from_slice(&src[offsets[idx]..offsets[idx + 1]]);
            }
            length_per_key.push(self.length_per_key[idx]);
        }

        Ok(KeyedJaggedTensor {
            keys,
            values,
            lengths,
            weights,
            stride: self.stride,
            length_per_key,
        })
    }
}

/// Ragged per-feature result: embedding rows instead of raw ids.
///
/// `values` holds `lengths` 합계 × `dim` floats, row-major. `weights`
/// carries per-value auxiliary metadata through the pipeline (the
/// original row ids, when indices were requested).
#[derive(Debug, Clone, PartialEq)]
pub struct JaggedTensor {
    lengths: Vec<usize>,
    values: Vec<f32>,
    dim: usize,
    weights: Option<Vec<f32>>,
}

impl JaggedTensor {
    pub fn new(
        lengths: Vec<usize>,
        values: Vec<f32>,
        dim: usize,
        weights: Option<Vec<f32>>,
    ) -> EmxResult<Self> {
        let rows: usize = lengths.iter().sum();
        if rows * dim != values.len() {
            return Err(EmxError::InvariantViolation(format!(
                "jagged result expects {} rows of dim {} but holds {} floats",
                rows,
                dim,
                values.len()
            )));
        }
        if let Some(w) = &weights {
            if w.len() != rows {
                return Err(EmxError::InvariantViolation(format!(
                    "jagged result weight buffer holds {} entries for {} rows",
                    w.len(),
                    rows
                )));
            }
        }
        Ok(Self {
            lengths,
            values,
            dim,
            weights,
        })
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn weights(&self) -> Option<&[f32]> {
        self.weights.as_deref()
    }

    /// Number of embedding rows held.
    pub fn rows(&self) -> usize {
        if self.dim == 0 { 0 } else { self.values.len() / self.dim }
    }

    /// Embedding row at flat position `i`.
    pub fn row(&self, i: usize) -> &[f32] {
        &self.values[i * self.dim..(i + 1) * self.dim]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> KeyedJaggedTensor {
        // instance 0   instance 1  instance 2
        // "feature_0"   [0, 1]       None        [2]
        // "feature_1"   [0, 1]       None        [2]
        KeyedJaggedTensor::from_lengths(
            vec!["feature_0".to_string(), "feature_1".to_string()],
            vec![0, 1, 2, 0, 1, 2],
            vec![2, 0, 1, 2, 0, 1],
            None,
        )
        .unwrap()
    }

    #[test]
    fn from_lengths_derives_stride_and_length_per_key() {
        let kjt = batch();
        assert_eq!(kjt.stride(), 3);
        assert_eq!(kjt.length_per_key(), &[3, 3]);
        assert_eq!(kjt.offset_per_key(), vec![0, 3, 6]);
    }

    #[test]
    fn from_lengths_rejects_length_sum_mismatch() {
        let err = KeyedJaggedTensor::from_lengths(
            vec!["feature_0".to_string()],
            vec![0, 1, 2],
            vec![1, 1],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, EmxError::InvariantViolation(_)));
    }

    #[test]
    fn from_lengths_rejects_duplicate_keys() {
        let err = KeyedJaggedTensor::from_lengths(
            vec!["feature_0".to_string(), "feature_0".to_string()],
            vec![0, 1],
            vec![1, 1],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, EmxError::InvariantViolation(_)));
    }

    #[test]
    fn from_lengths_rejects_ragged_weight_buffer() {
        let err = KeyedJaggedTensor::from_lengths(
            vec!["feature_0".to_string()],
            vec![4, 5],
            vec![1, 1],
            Some(vec![1.0]),
        )
        .unwrap_err();
        assert!(matches!(err, EmxError::InvariantViolation(_)));
    }

    #[test]
    fn split_partitions_values_and_lengths() {
        let kjt = batch();
        let parts = kjt.split(&[1, 1]).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].keys(), &["feature_0".to_string()]);
        assert_eq!(parts[0].values(), &[0, 1, 2]);
        assert_eq!(parts[0].lengths(), &[2, 0, 1]);
        assert_eq!(parts[1].keys(), &["feature_1".to_string()]);
        assert_eq!(parts[1].values(), &[0, 1, 2]);
        assert_eq!(parts[1].stride(), 3);
    }

    #[test]
    fn split_rejects_bad_group_sizes() {
        let kjt = batch();
        assert!(matches!(
            kjt.split(&[3]).unwrap_err(),
            EmxError::InvariantViolation(_)
        ));
    }

    #[test]
    fn permute_reorders_keys_and_segments() {
        let kjt = KeyedJaggedTensor::from_lengths(
            vec!["a".to_string(), "b".to_string()],
            vec![10, 11, 20],
            vec![1, 1, 1, 0],
            Some(vec![0.1, 0.2, 0.3]),
        )
        .unwrap();
        let permuted = kjt.permute(&[1, 0]).unwrap();
        assert_eq!(permuted.keys(), &["b".to_string(), "a".to_string()]);
        assert_eq!(permuted.values(), &[20, 10, 11]);
        assert_eq!(permuted.lengths(), &[1, 0, 1, 1]);
        assert_eq!(permuted.weights().unwrap(), &[0.3, 0.1, 0.2]);
    }

    #[test]
    fn permute_rejects_non_permutation() {
        let kjt = batch();
        assert!(kjt.permute(&[0, 0]).is_err());
        assert!(kjt.permute(&[0, 5]).is_err());
        assert!(kjt.permute(&[0]).is_err());
    }

    #[test]
    fn jagged_tensor_checks_row_count() {
        let jt = JaggedTensor::new(vec![2, 0, 1], vec![0.0; 12], 4, None).unwrap();
        assert_eq!(jt.rows(), 3);
        assert_eq!(jt.row(2).len(), 4);
        assert!(JaggedTensor::new(vec![2], vec![0.0; 4], 4, None).is_err());
    }
}
