// 속성 테스트: jagged 배치의 길이 불변식과 행 단위 재분배의 순서 복원을
// 무작위 배치에 대해 검증한다.

use std::sync::Arc;

use proptest::prelude::*;

use emx_core::config::EmbeddingTableConfig;
use emx_core::plan::BucketizeMode;
use emx_core::{
    EmbeddingCollection, KeyedJaggedTensor, LookupRegistry, ParameterSharding,
    ShardedEmbeddingCollection, ShardingEnv, ShardingPlan, ShardingType,
};

const ROWS: usize = 16;
const DIM: usize = 4;

// 키 2개 × 예제 stride개의 가변 길이 id 리스트
fn arb_batch(stride: usize) -> impl Strategy<Value = KeyedJaggedTensor> {
    let per_key = prop::collection::vec(
        prop::collection::vec(0..ROWS as i64, 0..4),
        stride,
    );
    (per_key.clone(), per_key).prop_map(|(a, b)| {
        let mut values = Vec::new();
        let mut lengths = Vec::new();
        for examples in [&a, &b] {
            for ids in examples {
                lengths.push(ids.len());
                values.extend_from_slice(ids);
            }
        }
        KeyedJaggedTensor::from_lengths(
            vec!["feature_0".to_string(), "feature_1".to_string()],
            values,
            lengths,
            None,
        )
        .unwrap()
    })
}

fn length_invariant_holds(kjt: &KeyedJaggedTensor) -> bool {
    let total: usize = kjt.length_per_key().iter().sum();
    total == kjt.values().len()
        && kjt
            .length_per_key()
            .iter()
            .enumerate()
            .all(|(k, &len)| kjt.lengths_for_key(k).iter().sum::<usize>() == len)
}

proptest! {
    #[test]
    fn prop_length_invariant_survives_derivation(kjt in arb_batch(3)) {
        prop_assert!(length_invariant_holds(&kjt));
        for part in kjt.split(&[1, 1]).unwrap() {
            prop_assert!(length_invariant_holds(&part));
        }
        let permuted = kjt.permute(&[1, 0]).unwrap();
        prop_assert!(length_invariant_holds(&permuted));
        prop_assert_eq!(permuted.values().len(), kjt.values().len());
    }

    #[test]
    fn prop_row_wise_restores_per_example_order(
        kjt in arb_batch(4),
        hash in any::<bool>(),
        world in 2usize..4,
    ) {
        let tables = vec![
            EmbeddingTableConfig::new("table_0", vec!["feature_0".to_string()], DIM, ROWS).unwrap(),
            EmbeddingTableConfig::new("table_1", vec!["feature_1".to_string()], DIM, ROWS).unwrap(),
        ];
        // need_indices로 원래 id가 weights에 실려 나오게 해서 순서를 본다
        let module = EmbeddingCollection::new(tables, true).unwrap();
        let reference = module.forward(&kjt).unwrap();

        let mut plan = ShardingPlan::new();
        for table in ["table_0", "table_1"] {
            let mut sharding =
                ParameterSharding::new(ShardingType::RowWise, (0..world).collect());
            sharding.bucketize_mode = if hash { BucketizeMode::Hash } else { BucketizeMode::Block };
            plan.insert(table, sharding);
        }
        let env = ShardingEnv::new_local(world).unwrap();
        let sharded = ShardedEmbeddingCollection::shard(
            &module,
            &plan,
            env,
            Arc::new(LookupRegistry::new()),
        )
        .unwrap();
        let out = sharded.forward(&kjt).unwrap();

        let offsets = kjt.offset_per_key();
        for (k, key) in kjt.keys().iter().enumerate() {
            let jt = &out[key];
            // unbucketize 후의 id 순서 = 원래 플랫 순서
            let expected_ids: Vec<f32> = kjt.values()[offsets[k]..offsets[k + 1]]
                .iter()
                .map(|&id| id as f32)
                .collect();
            prop_assert_eq!(jt.weights().unwrap(), expected_ids.as_slice());
            prop_assert_eq!(jt, &reference[key]);
        }
    }
}
