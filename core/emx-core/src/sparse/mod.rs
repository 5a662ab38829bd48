//! Sparse batch containers.
//!
//! A batch of sparse feature lookups is "jagged": every example carries a
//! variable-length list of row ids per feature. The containers here store
//! that structure as flat buffers plus per-(key, example) lengths instead
//! of padded matrices. All derivation (`split`, `permute`) produces new
//! instances; nothing is mutated in place.

pub mod jagged;

pub use jagged::{JaggedTensor, KeyedJaggedTensor};
