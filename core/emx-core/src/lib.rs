//! # EMX — Sharded Embedding Collection Engine
//!
//! EMX는 추천 모델급 임베딩 테이블을 여러 목적지(디바이스/랭크)에 나눠
//! 올리고, 희소 feature 배치 하나를 input-dist → lookup → output-dist
//! 파이프라인으로 실행하는 샤딩 엔진입니다. 순수 Rust로 구현되었으며,
//! 테이블 단위 / 행 단위 / 열 단위 / 데이터 병렬 전략을 하나의 인터페이스
//! 뒤에서 교체해 쓸 수 있습니다.
//!
//! ## 주요 특징
//!
//! - **5가지 샤딩 전략**: table-wise, row-wise, column-wise,
//!   table-row-wise, data-parallel — 닫힌 enum 하나로 디스패치
//! - **Jagged 배치 표현**: 플랫 values + per-(key, example) lengths,
//!   패딩 없는 가변 길이 lookup
//! - **행 버킷화 + unbucketize 순열**: 재분배가 흐트러뜨린 원래 순서를
//!   출력 단계에서 복원
//! - **스트림 기반 실행**: 목적지마다 전용 실행 스트림, 명시적 wait와
//!   record-stream 버퍼 수명 이관
//! - **양자화 추론 변형**: row 단위 u8 양자화 컬렉션과 추론 특화 샤딩
//!
//! ## 빠른 시작
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use emx_core::config::EmbeddingTableConfig;
//! use emx_core::{
//!     EmbeddingCollection, KeyedJaggedTensor, LookupRegistry, ParameterSharding,
//!     ShardedEmbeddingCollection, ShardingEnv, ShardingPlan, ShardingType,
//! };
//!
//! # fn main() -> emx_core::EmxResult<()> {
//! // 모델 정의: 8행 × 4차원 테이블 하나
//! let tables = vec![EmbeddingTableConfig::new(
//!     "table_0",
//!     vec!["feature_0".to_string()],
//!     4,
//!     8,
//! )?];
//! let module = EmbeddingCollection::new(tables, false)?;
//!
//! // 플래너가 내려준 플랜: 행 단위로 두 랭크에 분산
//! let mut plan = ShardingPlan::new();
//! plan.insert(
//!     "table_0",
//!     ParameterSharding::new(ShardingType::RowWise, vec![0, 1]),
//! );
//!
//! let env = ShardingEnv::new_local(2)?;
//! let sharded = ShardedEmbeddingCollection::shard(
//!     &module,
//!     &plan,
//!     env,
//!     Arc::new(LookupRegistry::new()),
//! )?;
//!
//! // 배치 하나 실행
//! let batch = KeyedJaggedTensor::from_lengths(
//!     vec!["feature_0".to_string()],
//!     vec![0, 5, 3],
//!     vec![2, 1],
//!     None,
//! )?;
//! let out = sharded.forward(&batch)?;
//! assert_eq!(out["feature_0"].lengths(), &[2, 1]);
//! # Ok(())
//! # }
//! ```
//!
//! ## 파이프라인
//!
//! ```text
//! KeyedJaggedTensor → Orchestrator(전략별 split/permute)
//!                  → InputDist(목적지별 재분배, 라우팅 메타데이터 기록)
//!                  → Lookup(목적지 로컬 gather, 스트림 병렬)
//!                  → OutputDist(재조립, unbucketize, per-feature 병합)
//!                  → HashMap<String, JaggedTensor>
//! ```
//!
//! ## 모듈 구조
//!
//! - [`sparse`] — jagged 배치 컨테이너 ([`KeyedJaggedTensor`], [`JaggedTensor`])
//! - [`config`] / [`plan`] — 테이블 설정과 외부 플래너의 샤딩 플랜
//! - [`sharding`] — 전략별 input/output dist와 shard 배치
//! - [`kernel`] — 목적지 로컬 dense/quant lookup 커널
//! - [`lookup`] — 랭크별로 묶인 grouped lookup
//! - [`sharded`] — 학습용 orchestrator ([`ShardedEmbeddingCollection`])
//! - [`quant`] — 양자화 추론 변형
//! - [`stream`] — 목적지 실행 스트림과 [`stream::Awaitable`] 핸들
//! - [`checkpoint`] — state-dict 저장/복원
//! - [`registry`] — 조회 도구용 명시적 lookup 레지스트리

pub mod checkpoint;
pub mod collection;
pub mod config;
pub mod context;
pub mod error;
pub mod kernel;
pub mod lookup;
pub mod plan;
pub mod quant;
pub mod registry;
pub mod sharded;
pub mod sharding;
pub mod sparse;
pub mod stream;

// Logging utilities
pub mod logging;

// Re-export commonly used types
pub use collection::EmbeddingCollection;
pub use context::EmbeddingCollectionContext;
pub use error::{EmxError, EmxResult};
pub use plan::{ParameterSharding, ShardingPlan, ShardingType};
pub use quant::{FusedParams, QuantizedEmbeddingCollection, ShardedQuantEmbeddingCollection};
pub use registry::LookupRegistry;
pub use sharded::ShardedEmbeddingCollection;
pub use sharding::ShardingEnv;
pub use sparse::{JaggedTensor, KeyedJaggedTensor};
