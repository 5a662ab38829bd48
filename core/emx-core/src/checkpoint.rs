//! State-dict checkpoint plumbing.
//!
//! Every collection exposes its per-table weights under
//! `"<prefix>.<table_name>.weight"`. A quantized table in split mode
//! additionally exposes `".weight_qscale"` / `".weight_qshift"` rows.
//! On-disk round trips go through bincode; fp32 weights restore
//! bit-identical, quantized weights byte-identical.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EmxError, EmxResult};

/// Dense fp32 tensor snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightTensor {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl WeightTensor {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> EmxResult<Self> {
        if data.len() != rows * cols {
            return Err(EmxError::InvariantViolation(format!(
                "weight tensor holds {} floats for shape {}x{}",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, data })
    }
}

/// Quantized u8 tensor snapshot. In fused form `bytes` carries
/// `rows * (cols + 8)` entries (row bytes + LE scale + LE shift); in
/// split form `bytes` is `rows * cols` and scale/shift live in their own
/// state-dict entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantWeightTensor {
    pub rows: usize,
    pub cols: usize,
    pub fused: bool,
    pub bytes: Vec<u8>,
}

impl QuantWeightTensor {
    /// Fuse per-row scale/shift into the row bytes.
    pub fn fused(rows: usize, cols: usize, bytes: &[u8], scales: &[f32], shifts: &[f32]) -> Self {
        let mut out = Vec::with_capacity(rows * (cols + 8));
        for r in 0..rows {
            out.extend_from_slice(&bytes[r * cols..(r + 1) * cols]);
            out.extend_from_slice(&scales[r].to_le_bytes());
            out.extend_from_slice(&shifts[r].to_le_bytes());
        }
        Self {
            rows,
            cols,
            fused: true,
            bytes: out,
        }
    }

    pub fn split(rows: usize, cols: usize, bytes: Vec<u8>) -> Self {
        Self {
            rows,
            cols,
            fused: false,
            bytes,
        }
    }

    /// Recover `(row bytes, scales, shifts)` from a fused tensor.
    pub fn unfuse(&self) -> EmxResult<(Vec<u8>, Vec<f32>, Vec<f32>)> {
        if !self.fused {
            return Err(EmxError::CheckpointFailed(
                "unfuse called on a split quant tensor".to_string(),
            ));
        }
        let stride = self.cols + 8;
        if self.bytes.len() != self.rows * stride {
            return Err(EmxError::CheckpointFailed(format!(
                "fused quant tensor holds {} bytes for {} rows of stride {}",
                self.bytes.len(),
                self.rows,
                stride
            )));
        }
        let mut bytes = Vec::with_capacity(self.rows * self.cols);
        let mut scales = Vec::with_capacity(self.rows);
        let mut shifts = Vec::with_capacity(self.rows);
        for r in 0..self.rows {
            let row = &self.bytes[r * stride..(r + 1) * stride];
            bytes.extend_from_slice(&row[..self.cols]);
            scales.push(f32::from_le_bytes(
                row[self.cols..self.cols + 4].try_into().expect("4 bytes"),
            ));
            shifts.push(f32::from_le_bytes(
                row[self.cols + 4..].try_into().expect("4 bytes"),
            ));
        }
        Ok((bytes, scales, shifts))
    }
}

/// One state-dict entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateTensor {
    Dense(WeightTensor),
    Quantized(QuantWeightTensor),
}

/// Addressable snapshot of a collection's parameters.
pub type StateDict = BTreeMap<String, StateTensor>;

/// `"<prefix>.<table>.<suffix>"`, omitting the dot for an empty prefix.
pub fn qualified_key(prefix: &str, table: &str, suffix: &str) -> String {
    if prefix.is_empty() {
        format!("{}.{}", table, suffix)
    } else {
        format!("{}.{}.{}", prefix, table, suffix)
    }
}

/// Serialize a state dict to disk.
pub fn save_state_dict(path: &Path, state: &StateDict) -> EmxResult<()> {
    let file = File::create(path)?;
    bincode::serialize_into(BufWriter::new(file), state)?;
    Ok(())
}

/// Read a state dict back from disk.
pub fn read_state_dict(path: &Path) -> EmxResult<StateDict> {
    let file = File::open(path)?;
    let state = bincode::deserialize_from(BufReader::new(file))?;
    Ok(state)
}
