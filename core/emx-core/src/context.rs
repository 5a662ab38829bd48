//! Per-forward-pass routing contexts.
//!
//! A context is created fresh by `input_dist`, consumed by `output_dist`
//! and discarded with the pass. It is the only mutable record in the
//! pipeline; everything it holds is shared via `Arc` so it can be handed
//! across destination streams without copies.

use std::any::Any;
use std::sync::Arc;

use crate::sparse::KeyedJaggedTensor;
use crate::stream::{DeviceStream, StreamAttached};

/// Routing metadata for one sharding strategy within one forward pass.
pub struct SequenceShardingContext {
    /// Post-distribution features, one entry per destination rank.
    pub features: Vec<Arc<KeyedJaggedTensor>>,
    /// The strategy's feature subset before redistribution, retained for
    /// restoring original output order.
    pub features_before_input_dist: Arc<KeyedJaggedTensor>,
    /// For bucketized (row-wise family) sharding: maps each original flat
    /// value position to its position in the concatenated per-rank
    /// output.
    pub unbucketize_permute: Option<Arc<Vec<usize>>>,
}

impl StreamAttached for SequenceShardingContext {
    fn record_stream(&self, stream: &DeviceStream) {
        for kjt in &self.features {
            stream.record_buffer(kjt.clone() as Arc<dyn Any + Send + Sync>);
        }
        stream.record_buffer(self.features_before_input_dist.clone() as Arc<dyn Any + Send + Sync>);
        if let Some(permute) = &self.unbucketize_permute {
            stream.record_buffer(permute.clone() as Arc<dyn Any + Send + Sync>);
        }
    }
}

/// One forward pass's contexts, one entry per sharding strategy, in
/// strategy order.
#[derive(Default)]
pub struct EmbeddingCollectionContext {
    pub sharding_contexts: Vec<SequenceShardingContext>,
}

impl EmbeddingCollectionContext {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamAttached for EmbeddingCollectionContext {
    fn record_stream(&self, stream: &DeviceStream) {
        for ctx in &self.sharding_contexts {
            ctx.record_stream(stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamPool;

    #[test]
    fn record_stream_retains_every_buffer() {
        let pool = StreamPool::new(1);
        let stream = pool.stream(0).unwrap();

        let before = Arc::new(KeyedJaggedTensor::empty(2));
        let ctx = EmbeddingCollectionContext {
            sharding_contexts: vec![SequenceShardingContext {
                features: vec![before.clone()],
                features_before_input_dist: before.clone(),
                unbucketize_permute: Some(Arc::new(vec![0, 1])),
            }],
        };
        // local + two context fields
        assert_eq!(Arc::strong_count(&before), 3);
        ctx.record_stream(&stream);
        // the stream retains one clone per context field
        assert_eq!(Arc::strong_count(&before), 5);
        stream.synchronize().unwrap();
        assert_eq!(Arc::strong_count(&before), 3);
    }
}
