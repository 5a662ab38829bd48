// 샤딩 전략별 forward 라운드트립 테스트: 샤딩된 컬렉션은 어떤 전략을
// 쓰든 단일 목적지 레퍼런스와 수치가 일치해야 한다.

use std::sync::Arc;

use emx_core::checkpoint::{StateDict, StateTensor, WeightTensor, qualified_key};
use emx_core::config::EmbeddingTableConfig;
use emx_core::error::EmxResult;
use emx_core::plan::BucketizeMode;
use emx_core::{
    EmbeddingCollection, KeyedJaggedTensor, LookupRegistry, ParameterSharding,
    ShardedEmbeddingCollection, ShardingEnv, ShardingPlan, ShardingType,
};

const DIM: usize = 4;
const ROWS: usize = 4;

fn tables() -> Vec<EmbeddingTableConfig> {
    vec![
        EmbeddingTableConfig::new("table_0", vec!["feature_0".to_string()], DIM, ROWS).unwrap(),
        EmbeddingTableConfig::new("table_1", vec!["feature_1".to_string()], DIM, ROWS).unwrap(),
    ]
}

// table_0 row r = (1 << r)·1⃗, table_1 row r = (100 + (1 << r))·1⃗
fn ramp_state() -> StateDict {
    let ramp = |base: f32| -> Vec<f32> {
        (0..ROWS)
            .flat_map(|r| std::iter::repeat(base + (1 << r) as f32).take(DIM))
            .collect()
    };
    let mut state = StateDict::new();
    state.insert(
        qualified_key("", "table_0", "weight"),
        StateTensor::Dense(WeightTensor::new(ROWS, DIM, ramp(0.0)).unwrap()),
    );
    state.insert(
        qualified_key("", "table_1", "weight"),
        StateTensor::Dense(WeightTensor::new(ROWS, DIM, ramp(100.0)).unwrap()),
    );
    state
}

fn module(need_indices: bool) -> EmbeddingCollection {
    let module = EmbeddingCollection::new(tables(), need_indices).unwrap();
    module.load_state_dict("", &ramp_state()).unwrap();
    module
}

// 스펙 시나리오 배치: 3개 예제, 키 2개, 값 [0,1,2] 각각
fn batch() -> KeyedJaggedTensor {
    KeyedJaggedTensor::from_lengths(
        vec!["feature_0".to_string(), "feature_1".to_string()],
        vec![0, 1, 2, 0, 1, 2],
        vec![2, 0, 1, 2, 0, 1],
        None,
    )
    .unwrap()
}

fn plan_for(sharding_type: ShardingType) -> ShardingPlan {
    let ranks = match sharding_type {
        ShardingType::TableWise => vec![0],
        _ => vec![0, 1],
    };
    let mut plan = ShardingPlan::new();
    plan.insert(
        "table_0",
        ParameterSharding::new(sharding_type, ranks.clone()),
    );
    // table-wise: 테이블마다 다른 랭크에 배치해 실제 분산을 만든다
    let second_ranks = match sharding_type {
        ShardingType::TableWise => vec![1],
        _ => ranks,
    };
    plan.insert("table_1", ParameterSharding::new(sharding_type, second_ranks));
    plan
}

fn shard(
    module: &EmbeddingCollection,
    plan: &ShardingPlan,
    world: usize,
) -> ShardedEmbeddingCollection {
    let env = ShardingEnv::new_local(world).unwrap();
    ShardedEmbeddingCollection::shard(module, plan, env, Arc::new(LookupRegistry::new())).unwrap()
}

#[test]
fn test_round_trip_every_sharding_type() -> EmxResult<()> {
    let module = module(false);
    let reference = module.forward(&batch())?;

    for sharding_type in [
        ShardingType::TableWise,
        ShardingType::RowWise,
        ShardingType::ColumnWise,
        ShardingType::TableRowWise,
        ShardingType::DataParallel,
    ] {
        let sharded = shard(&module, &plan_for(sharding_type), 2);
        let out = sharded.forward(&batch())?;
        assert_eq!(out.len(), reference.len(), "{:?}", sharding_type);
        for (key, jt) in &reference {
            assert_eq!(&out[key], jt, "{:?} / {}", sharding_type, key);
        }
    }
    Ok(())
}

#[test]
fn test_row_wise_restores_exact_rows() -> EmxResult<()> {
    // 스펙 시나리오: 4행 테이블을 두 목적지에 행 단위 분산, 3개 예제 ×
    // 2키 결과가 초기 가중치 행과 정확히 일치해야 한다
    let module = module(false);
    let sharded = shard(&module, &plan_for(ShardingType::RowWise), 2);
    let out = sharded.forward(&batch())?;

    let f0 = &out["feature_0"];
    assert_eq!(f0.lengths(), &[2, 0, 1]);
    assert_eq!(f0.row(0), &[1.0; DIM]); // id 0 → 1<<0
    assert_eq!(f0.row(1), &[2.0; DIM]); // id 1 → 1<<1
    assert_eq!(f0.row(2), &[4.0; DIM]); // id 2 → 1<<2
    let f1 = &out["feature_1"];
    assert_eq!(f1.lengths(), &[2, 0, 1]);
    assert_eq!(f1.row(0), &[101.0; DIM]);
    assert_eq!(f1.row(2), &[104.0; DIM]);
    Ok(())
}

#[test]
fn test_hash_bucketization_round_trips() -> EmxResult<()> {
    let module = module(false);
    let reference = module.forward(&batch())?;

    let mut plan = ShardingPlan::new();
    for table in ["table_0", "table_1"] {
        let mut sharding = ParameterSharding::new(ShardingType::RowWise, vec![0, 1]);
        sharding.bucketize_mode = BucketizeMode::Hash;
        plan.insert(table, sharding);
    }
    let sharded = shard(&module, &plan, 2);
    let out = sharded.forward(&batch())?;
    for (key, jt) in &reference {
        assert_eq!(&out[key], jt, "{}", key);
    }
    Ok(())
}

#[test]
fn test_mixed_strategy_plan_merges_per_feature_maps() -> EmxResult<()> {
    let module = module(false);
    let reference = module.forward(&batch())?;

    let mut plan = ShardingPlan::new();
    plan.insert(
        "table_0",
        ParameterSharding::new(ShardingType::ColumnWise, vec![1, 0]),
    );
    plan.insert(
        "table_1",
        ParameterSharding::new(ShardingType::RowWise, vec![0, 1]),
    );
    let sharded = shard(&module, &plan, 2);
    assert_eq!(
        sharded.sharding_types(),
        vec![ShardingType::RowWise, ShardingType::ColumnWise]
    );
    let out = sharded.forward(&batch())?;
    for (key, jt) in &reference {
        assert_eq!(&out[key], jt, "{}", key);
    }
    Ok(())
}

#[test]
fn test_empty_destination_contributes_empty_segments() -> EmxResult<()> {
    // feature_1의 모든 id가 0/1 → 행 버킷 기준 rank 0에만 떨어지고
    // rank 1은 빈 입력을 받는다; 실패 없이 빈 세그먼트를 내야 한다
    let module = module(false);
    let sharded = shard(&module, &plan_for(ShardingType::RowWise), 2);

    let kjt = KeyedJaggedTensor::from_lengths(
        vec!["feature_0".to_string(), "feature_1".to_string()],
        vec![0, 1, 2, 0, 1, 1],
        vec![2, 0, 1, 2, 0, 1],
        None,
    )
    .unwrap();
    let out = sharded.forward(&kjt)?;
    assert_eq!(out["feature_1"].row(2), &[102.0; DIM]);

    // 아예 값이 없는 배치도 마찬가지
    let empty = KeyedJaggedTensor::from_lengths(
        vec!["feature_0".to_string(), "feature_1".to_string()],
        vec![],
        vec![0, 0, 0, 0, 0, 0],
        None,
    )
    .unwrap();
    let out = sharded.forward(&empty)?;
    assert_eq!(out["feature_0"].lengths(), &[0, 0, 0]);
    assert_eq!(out["feature_0"].rows(), 0);
    Ok(())
}

#[test]
fn test_lazy_init_is_idempotent() -> EmxResult<()> {
    let module = module(false);
    let sharded = shard(&module, &plan_for(ShardingType::RowWise), 2);

    // 같은 feature 집합으로 두 번: 라우팅 메타데이터가 동일해야 한다
    let ctx_a = sharded.input_dist(&batch())?;
    let ctx_b = sharded.input_dist(&batch())?;
    assert_eq!(ctx_a.sharding_contexts.len(), ctx_b.sharding_contexts.len());
    for (a, b) in ctx_a
        .sharding_contexts
        .iter()
        .zip(&ctx_b.sharding_contexts)
    {
        assert_eq!(a.features.len(), b.features.len());
        for (fa, fb) in a.features.iter().zip(&b.features) {
            assert_eq!(fa.as_ref(), fb.as_ref());
        }
        assert_eq!(
            a.unbucketize_permute.as_deref(),
            b.unbucketize_permute.as_deref()
        );
    }

    // 이미 만들어둔 컨텍스트와 새 forward가 같은 결과를 낸다
    let out_a = sharded.compute_and_output_dist(&ctx_a)?;
    let out_b = sharded.forward(&batch())?;
    assert_eq!(out_a, out_b);
    Ok(())
}

#[test]
fn test_first_batch_key_order_fixes_routing() -> EmxResult<()> {
    // 모듈의 canonical 순서와 다른 키 순서로 첫 배치를 보내도, 그 순서가
    // 라우팅에 반영되어 결과는 레퍼런스와 같아야 한다
    let module = module(false);
    let sharded = shard(&module, &plan_for(ShardingType::RowWise), 2);
    let swapped = KeyedJaggedTensor::from_lengths(
        vec!["feature_1".to_string(), "feature_0".to_string()],
        vec![0, 1, 2, 0, 1, 2],
        vec![2, 0, 1, 2, 0, 1],
        None,
    )
    .unwrap();
    let reference = module.forward(&swapped)?;
    let out = sharded.forward(&swapped)?;
    for (key, jt) in &reference {
        assert_eq!(&out[key], jt, "{}", key);
    }
    Ok(())
}

#[test]
fn test_need_indices_carries_ids_through_weights() -> EmxResult<()> {
    let module = module(true);
    for sharding_type in [
        ShardingType::TableWise,
        ShardingType::RowWise,
        ShardingType::ColumnWise,
        ShardingType::DataParallel,
    ] {
        let sharded = shard(&module, &plan_for(sharding_type), 2);
        let out = sharded.forward(&batch())?;
        assert_eq!(
            out["feature_0"].weights().unwrap(),
            &[0.0, 1.0, 2.0],
            "{:?}",
            sharding_type
        );
        assert_eq!(out["feature_1"].weights().unwrap(), &[0.0, 1.0, 2.0]);
    }

    // need_indices 꺼짐: weights 없음
    let plain = module_without_indices_forward()?;
    assert!(plain["feature_0"].weights().is_none());
    Ok(())
}

fn module_without_indices_forward()
-> EmxResult<std::collections::HashMap<String, emx_core::JaggedTensor>> {
    let module = module(false);
    let sharded = shard(&module, &plan_for(ShardingType::RowWise), 2);
    sharded.forward(&batch())
}

#[test]
fn test_weighted_batch_survives_redistribution() -> EmxResult<()> {
    // 입력 weights는 재분배를 거쳐도 값과 같은 자리를 지켜야 한다
    let module = module(false);
    let reference = module.forward(&batch())?;
    let sharded = shard(&module, &plan_for(ShardingType::RowWise), 2);

    let weighted = KeyedJaggedTensor::from_lengths(
        vec!["feature_0".to_string(), "feature_1".to_string()],
        vec![0, 1, 2, 0, 1, 2],
        vec![2, 0, 1, 2, 0, 1],
        Some(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]),
    )
    .unwrap();
    let out = sharded.forward(&weighted)?;
    // 출력 행 자체는 weights와 무관하다
    for (key, jt) in &reference {
        assert_eq!(out[key].values(), jt.values(), "{}", key);
    }
    Ok(())
}

#[test]
fn test_larger_world_than_rows() -> EmxResult<()> {
    // 목적지가 행보다 많아도 (빈 shard 포함) 동작해야 한다
    let module = module(false);
    let mut plan = ShardingPlan::new();
    plan.insert(
        "table_0",
        ParameterSharding::new(ShardingType::RowWise, vec![0, 1, 2, 3, 4]),
    );
    plan.insert(
        "table_1",
        ParameterSharding::new(ShardingType::TableWise, vec![3]),
    );
    let sharded = shard(&module, &plan, 5);
    let reference = module.forward(&batch())?;
    let out = sharded.forward(&batch())?;
    for (key, jt) in &reference {
        assert_eq!(&out[key], jt, "{}", key);
    }
    Ok(())
}
