//! Device-local dense lookup kernel.
//!
//! A [`DenseShard`] is one destination's slice of one table: a contiguous
//! row range (and, under column-wise sharding, a column range) backed by a
//! [`WeightStore`]. The kernel contract is narrow on purpose: given flat
//! row ids, return gathered rows — no routing knowledge whatsoever.
//!
//! Weight stores are read-locked during a forward pass and written only
//! between passes (external optimizer step); the kernel performs no other
//! synchronization on weights.

pub mod cache;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tracing::warn;

use crate::config::{BoundsCheckMode, CacheParams};
use crate::error::{EmxError, EmxResult};
use cache::RowCache;

/// Below this many ids a parallel gather costs more than it saves.
const PARALLEL_GATHER_THRESHOLD: usize = 4096;

/// Round an f32 to fp16 mantissa precision (10 bits, round-to-nearest).
///
/// Exponent range and subnormals are left as-is; this models cache/output
/// precision loss, not a full half-float conversion.
pub(crate) fn round_to_fp16(x: f32) -> f32 {
    if !x.is_finite() {
        return x;
    }
    let bits = x.to_bits();
    f32::from_bits((bits.wrapping_add(0x0000_1000)) & 0xFFFF_E000)
}

/// Uniform init in `[-1/sqrt(rows), 1/sqrt(rows)]`, seeded so that a
/// sharded module and its unsharded reference can agree on weights.
pub fn uniform_init(rows: usize, cols: usize, seed: u64) -> Vec<f32> {
    use rand::{Rng, SeedableRng, rngs::StdRng};
    let mut rng = StdRng::seed_from_u64(seed);
    let bound = 1.0 / (rows as f32).sqrt();
    (0..rows * cols).map(|_| rng.gen_range(-bound..=bound)).collect()
}

/// Dense, trainable parameter block: `rows × cols` f32 plus a gradient
/// accumulation buffer of the same shape.
pub struct WeightStore {
    rows: usize,
    cols: usize,
    data: RwLock<Vec<f32>>,
    grad: RwLock<Vec<f32>>,
}

impl WeightStore {
    pub fn zeroed(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: RwLock::new(vec![0.0; rows * cols]),
            grad: RwLock::new(vec![0.0; rows * cols]),
        }
    }

    pub fn from_data(rows: usize, cols: usize, data: Vec<f32>) -> EmxResult<Self> {
        if data.len() != rows * cols {
            return Err(EmxError::InvariantViolation(format!(
                "weight buffer holds {} floats for a {}x{} store",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self {
            rows,
            cols,
            data: RwLock::new(data),
            grad: RwLock::new(vec![0.0; rows * cols]),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Copy of the current weights.
    pub fn snapshot(&self) -> Vec<f32> {
        self.data.read().clone()
    }

    /// Overwrite all weights (checkpoint restore path).
    pub fn load(&self, data: &[f32]) -> EmxResult<()> {
        if data.len() != self.rows * self.cols {
            return Err(EmxError::InvariantViolation(format!(
                "restore buffer holds {} floats for a {}x{} store",
                data.len(),
                self.rows,
                self.cols
            )));
        }
        self.data.write().copy_from_slice(data);
        Ok(())
    }

    fn copy_row_into(&self, local_id: usize, out: &mut [f32]) {
        let data = self.data.read();
        let start = local_id * self.cols;
        out.copy_from_slice(&data[start..start + self.cols]);
    }

    /// Accumulate `grad` rows into the gradient buffer at `local_ids`.
    pub fn scatter_add(&self, local_ids: &[usize], grad_rows: &[f32]) -> EmxResult<()> {
        if grad_rows.len() != local_ids.len() * self.cols {
            return Err(EmxError::InvariantViolation(format!(
                "gradient buffer holds {} floats for {} rows of {} cols",
                grad_rows.len(),
                local_ids.len(),
                self.cols
            )));
        }
        let mut grad = self.grad.write();
        for (i, &id) in local_ids.iter().enumerate() {
            let dst = &mut grad[id * self.cols..(id + 1) * self.cols];
            let src = &grad_rows[i * self.cols..(i + 1) * self.cols];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += s;
            }
        }
        Ok(())
    }

    /// One plain SGD step over the accumulated gradients, then reset.
    ///
    /// The optimizer itself lives outside this crate; this is the
    /// minimal hook an external step uses between forward passes.
    pub fn apply_sgd(&self, lr: f32) {
        let mut data = self.data.write();
        let mut grad = self.grad.write();
        for (w, g) in data.iter_mut().zip(grad.iter_mut()) {
            *w -= lr * *g;
            *g = 0.0;
        }
    }
}

/// Shard placement metadata within its table's address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMeta {
    pub table: String,
    pub row_offset: usize,
    pub rows: usize,
    pub col_offset: usize,
    pub cols: usize,
}

/// One destination's slice of one table.
pub struct DenseShard {
    meta: ShardMeta,
    store: WeightStore,
    /// Present under hash bucketization: global row id → local row.
    row_map: Option<AHashMap<i64, usize>>,
    cache: Option<Mutex<RowCache>>,
    bounds_check: BoundsCheckMode,
    /// Planner hints, recorded for introspection.
    stochastic_rounding: bool,
    enforce_in_fast_memory: bool,
}

impl DenseShard {
    pub fn new(
        meta: ShardMeta,
        data: Vec<f32>,
        cache_params: Option<&CacheParams>,
        bounds_check: BoundsCheckMode,
    ) -> EmxResult<Self> {
        let store = WeightStore::from_data(meta.rows, meta.cols, data)?;
        let cache = cache_params.map(|p| Mutex::new(RowCache::from_params(p, meta.rows)));
        Ok(Self {
            meta,
            store,
            row_map: None,
            cache,
            bounds_check,
            stochastic_rounding: false,
            enforce_in_fast_memory: false,
        })
    }

    pub fn with_row_map(mut self, row_map: AHashMap<i64, usize>) -> Self {
        self.row_map = Some(row_map);
        self
    }

    pub fn with_hints(mut self, stochastic_rounding: bool, enforce_in_fast_memory: bool) -> Self {
        self.stochastic_rounding = stochastic_rounding;
        self.enforce_in_fast_memory = enforce_in_fast_memory;
        self
    }

    pub fn meta(&self) -> &ShardMeta {
        &self.meta
    }

    pub fn store(&self) -> &WeightStore {
        &self.store
    }

    /// Hash-bucketized placement: global row id → local row. `None` for
    /// contiguous (offset-addressed) shards.
    pub fn row_map(&self) -> Option<&AHashMap<i64, usize>> {
        self.row_map.as_ref()
    }

    pub fn stochastic_rounding(&self) -> bool {
        self.stochastic_rounding
    }

    pub fn enforce_in_fast_memory(&self) -> bool {
        self.enforce_in_fast_memory
    }

    /// Map an incoming id to a local row, honoring the bounds-check mode.
    fn resolve(&self, id: i64) -> EmxResult<usize> {
        if let Some(map) = &self.row_map {
            return map.get(&id).copied().ok_or_else(|| {
                EmxError::InvariantViolation(format!(
                    "row id {} was routed to a shard of '{}' that does not hold it",
                    id, self.meta.table
                ))
            });
        }
        let rows = self.meta.rows;
        if id >= 0 && (id as usize) < rows {
            return Ok(id as usize);
        }
        match self.bounds_check {
            BoundsCheckMode::Ignore => Ok(clamp_row(id, rows)),
            BoundsCheckMode::Warning => {
                warn!(
                    table = %self.meta.table,
                    id,
                    rows,
                    "row id out of bounds, clamping"
                );
                Ok(clamp_row(id, rows))
            }
            BoundsCheckMode::Fatal | BoundsCheckMode::None => Err(EmxError::IndexOutOfBounds {
                table: self.meta.table.clone(),
                index: id,
                rows,
            }),
        }
    }

    /// Gather rows for `ids`. An empty `ids` yields an empty, well-formed
    /// output.
    pub fn gather(&self, ids: &[i64]) -> EmxResult<Vec<f32>> {
        let cols = self.meta.cols;
        let mut out = vec![0.0f32; ids.len() * cols];
        if ids.is_empty() {
            return Ok(out);
        }

        let local: Vec<usize> = ids
            .iter()
            .map(|&id| self.resolve(id))
            .collect::<EmxResult<_>>()?;

        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            for (slot, &row_id) in local.iter().enumerate() {
                let dst = &mut out[slot * cols..(slot + 1) * cols];
                if let Some(row) = cache.get(row_id) {
                    dst.copy_from_slice(row);
                } else {
                    self.store.copy_row_into(row_id, dst);
                    cache.apply_precision(dst);
                    cache.put(row_id, dst.to_vec());
                }
            }
            return Ok(out);
        }

        if local.len() >= PARALLEL_GATHER_THRESHOLD && num_cpus::get() > 1 {
            let data = self.store.data.read();
            out.par_chunks_mut(cols)
                .zip(local.par_iter())
                .for_each(|(dst, &row_id)| {
                    dst.copy_from_slice(&data[row_id * cols..(row_id + 1) * cols]);
                });
        } else {
            for (slot, &row_id) in local.iter().enumerate() {
                self.store
                    .copy_row_into(row_id, &mut out[slot * cols..(slot + 1) * cols]);
            }
        }
        Ok(out)
    }

    /// Backward of [`DenseShard::gather`]: scatter-add `grad_rows` into
    /// the gradient buffer at the same resolved rows.
    pub fn scatter_add(&self, ids: &[i64], grad_rows: &[f32]) -> EmxResult<()> {
        let local: Vec<usize> = ids
            .iter()
            .map(|&id| self.resolve(id))
            .collect::<EmxResult<_>>()?;
        self.store.scatter_add(&local, grad_rows)
    }
}

fn clamp_row(id: i64, rows: usize) -> usize {
    if id < 0 { 0 } else { (id as usize).min(rows - 1) }
}

/// Per-row u8 quantization: `q = round((x - shift) / scale)` with
/// `scale = (max - min) / 255`, `shift = min`.
pub fn quantize_rows(data: &[f32], rows: usize, cols: usize) -> (Vec<u8>, Vec<f32>, Vec<f32>) {
    let mut bytes = Vec::with_capacity(rows * cols);
    let mut scales = Vec::with_capacity(rows);
    let mut shifts = Vec::with_capacity(rows);
    for r in 0..rows {
        let row = &data[r * cols..(r + 1) * cols];
        let min = row.iter().copied().fold(f32::INFINITY, f32::min);
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let scale = if max > min { (max - min) / 255.0 } else { 1.0 };
        scales.push(scale);
        shifts.push(min);
        for &x in row {
            bytes.push(((x - min) / scale).round().clamp(0.0, 255.0) as u8);
        }
    }
    (bytes, scales, shifts)
}

/// Inverse of [`quantize_rows`] for one row.
pub fn dequantize_row(bytes: &[u8], scale: f32, shift: f32, out: &mut [f32]) {
    for (o, &b) in out.iter_mut().zip(bytes) {
        *o = b as f32 * scale + shift;
    }
}

/// Quantized, inference-only shard. Same placement semantics as
/// [`DenseShard`], u8 rows with per-row scale/shift.
pub struct QuantShard {
    meta: ShardMeta,
    bytes: Vec<u8>,
    scales: Vec<f32>,
    shifts: Vec<f32>,
    /// Scale/shift serialized fused into row bytes, or split out.
    split_scale_shift: bool,
    row_map: Option<AHashMap<i64, usize>>,
    bounds_check: BoundsCheckMode,
}

impl QuantShard {
    pub fn from_dense(
        meta: ShardMeta,
        data: &[f32],
        split_scale_shift: bool,
        bounds_check: BoundsCheckMode,
    ) -> EmxResult<Self> {
        if data.len() != meta.rows * meta.cols {
            return Err(EmxError::InvariantViolation(format!(
                "weight buffer holds {} floats for a {}x{} quant shard",
                data.len(),
                meta.rows,
                meta.cols
            )));
        }
        let (bytes, scales, shifts) = quantize_rows(data, meta.rows, meta.cols);
        Ok(Self {
            meta,
            bytes,
            scales,
            shifts,
            split_scale_shift,
            row_map: None,
            bounds_check,
        })
    }

    /// Build a shard from already-quantized rows (sharding a quantized
    /// module must not requantize, or checkpoints stop matching).
    pub fn from_parts(
        meta: ShardMeta,
        bytes: Vec<u8>,
        scales: Vec<f32>,
        shifts: Vec<f32>,
        split_scale_shift: bool,
        bounds_check: BoundsCheckMode,
    ) -> EmxResult<Self> {
        if bytes.len() != meta.rows * meta.cols
            || scales.len() != meta.rows
            || shifts.len() != meta.rows
        {
            return Err(EmxError::InvariantViolation(format!(
                "quantized buffers ({} bytes, {} scales, {} shifts) do not fit a {}x{} shard",
                bytes.len(),
                scales.len(),
                shifts.len(),
                meta.rows,
                meta.cols
            )));
        }
        Ok(Self {
            meta,
            bytes,
            scales,
            shifts,
            split_scale_shift,
            row_map: None,
            bounds_check,
        })
    }

    pub fn with_row_map(mut self, row_map: AHashMap<i64, usize>) -> Self {
        self.row_map = Some(row_map);
        self
    }

    pub fn meta(&self) -> &ShardMeta {
        &self.meta
    }

    /// See [`DenseShard::row_map`].
    pub fn row_map(&self) -> Option<&AHashMap<i64, usize>> {
        self.row_map.as_ref()
    }

    pub fn split_scale_shift(&self) -> bool {
        self.split_scale_shift
    }

    pub fn quant_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    pub fn shifts(&self) -> &[f32] {
        &self.shifts
    }

    fn resolve(&self, id: i64) -> EmxResult<usize> {
        if let Some(map) = &self.row_map {
            return map.get(&id).copied().ok_or_else(|| {
                EmxError::InvariantViolation(format!(
                    "row id {} was routed to a shard of '{}' that does not hold it",
                    id, self.meta.table
                ))
            });
        }
        let rows = self.meta.rows;
        if id >= 0 && (id as usize) < rows {
            return Ok(id as usize);
        }
        match self.bounds_check {
            BoundsCheckMode::Ignore => Ok(clamp_row(id, rows)),
            BoundsCheckMode::Warning => {
                warn!(
                    table = %self.meta.table,
                    id,
                    rows,
                    "row id out of bounds, clamping"
                );
                Ok(clamp_row(id, rows))
            }
            BoundsCheckMode::Fatal | BoundsCheckMode::None => Err(EmxError::IndexOutOfBounds {
                table: self.meta.table.clone(),
                index: id,
                rows,
            }),
        }
    }

    /// Gather and dequantize rows for `ids`.
    pub fn gather(&self, ids: &[i64]) -> EmxResult<Vec<f32>> {
        let cols = self.meta.cols;
        let mut out = vec![0.0f32; ids.len() * cols];
        for (slot, &id) in ids.iter().enumerate() {
            let row_id = self.resolve(id)?;
            dequantize_row(
                &self.bytes[row_id * cols..(row_id + 1) * cols],
                self.scales[row_id],
                self.shifts[row_id],
                &mut out[slot * cols..(slot + 1) * cols],
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(bounds_check: BoundsCheckMode) -> DenseShard {
        DenseShard::new(
            ShardMeta {
                table: "table_0".to_string(),
                row_offset: 0,
                rows: 4,
                col_offset: 0,
                cols: 2,
            },
            vec![0.0, 0.1, 1.0, 1.1, 2.0, 2.1, 3.0, 3.1],
            None,
            bounds_check,
        )
        .unwrap()
    }

    #[test]
    fn gather_returns_rows_in_id_order() {
        let shard = shard(BoundsCheckMode::Fatal);
        let out = shard.gather(&[3, 0, 3]).unwrap();
        assert_eq!(out, vec![3.0, 3.1, 0.0, 0.1, 3.0, 3.1]);
    }

    #[test]
    fn gather_on_empty_ids_is_well_formed() {
        let shard = shard(BoundsCheckMode::Fatal);
        assert!(shard.gather(&[]).unwrap().is_empty());
    }

    #[test]
    fn fatal_bounds_check_fails_the_gather() {
        let shard = shard(BoundsCheckMode::Fatal);
        assert!(matches!(
            shard.gather(&[4]),
            Err(EmxError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn ignore_bounds_check_clamps() {
        let shard = shard(BoundsCheckMode::Ignore);
        let out = shard.gather(&[17, -3]).unwrap();
        assert_eq!(out, vec![3.0, 3.1, 0.0, 0.1]);
    }

    #[test]
    fn scatter_add_then_sgd_updates_rows() {
        let shard = shard(BoundsCheckMode::Fatal);
        shard.scatter_add(&[1, 1], &[1.0, 1.0, 1.0, 1.0]).unwrap();
        shard.store().apply_sgd(0.5);
        let snapshot = shard.store().snapshot();
        // row 1 accumulated grad [2, 2]; 1.0 - 0.5*2 = 0.0
        assert_eq!(&snapshot[2..4], &[0.0, 1.1f32 - 1.0]);
        // second step is a no-op: gradients were reset
        shard.store().apply_sgd(0.5);
        assert_eq!(shard.store().snapshot(), snapshot);
    }

    #[test]
    fn cached_gather_agrees_between_miss_and_hit() {
        use crate::config::{CacheAlgorithm, CacheParams, DataType};
        let params = CacheParams {
            algorithm: CacheAlgorithm::Lru,
            load_factor: 1.0,
            reserved_memory: 0.0,
            precision: DataType::Fp16,
        };
        let data = vec![0.123_456_78f32, 0.5, 1.0, 2.0];
        let shard = DenseShard::new(
            ShardMeta {
                table: "table_0".to_string(),
                row_offset: 0,
                rows: 2,
                col_offset: 0,
                cols: 2,
            },
            data,
            Some(&params),
            BoundsCheckMode::Fatal,
        )
        .unwrap();
        let miss = shard.gather(&[0, 1]).unwrap();
        let hit = shard.gather(&[0, 1]).unwrap();
        assert_eq!(miss, hit);
        // the fp16 tier rounded the odd value on its way in
        assert_eq!(miss[0], round_to_fp16(0.123_456_78));
        assert_eq!(miss[2], 1.0);
    }

    #[test]
    fn quantize_round_trips_within_tolerance() {
        let data: Vec<f32> = (0..8).map(|i| i as f32 * 0.37 - 1.0).collect();
        let (bytes, scales, shifts) = quantize_rows(&data, 2, 4);
        let mut out = vec![0.0; 4];
        for r in 0..2 {
            dequantize_row(&bytes[r * 4..(r + 1) * 4], scales[r], shifts[r], &mut out);
            for c in 0..4 {
                assert!((out[c] - data[r * 4 + c]).abs() < 0.01);
            }
        }
    }

    #[test]
    fn fp16_rounding_is_idempotent() {
        let x = round_to_fp16(0.123_456_78);
        assert_eq!(round_to_fp16(x), x);
        assert!((x - 0.123_456_78f32).abs() < 1e-3);
    }
}
