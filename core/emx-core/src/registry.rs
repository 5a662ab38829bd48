//! Explicit lookup registry for introspection tooling.
//!
//! Post-processing utilities want to enumerate the fused lookups a
//! sharded module created. The registry is passed into the orchestrator
//! constructor — never discovered through ambient global state — so two
//! modules can keep disjoint registries in one process.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{EmxError, EmxResult};
use crate::plan::ShardingType;

/// Introspection record for one grouped lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupHandle {
    pub name: String,
    pub sharding_type: ShardingType,
    pub tables: Vec<String>,
    pub quantized: bool,
}

/// Concurrent name → handle map.
#[derive(Default)]
pub struct LookupRegistry {
    inner: DashMap<String, Arc<LookupHandle>>,
}

impl LookupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle; a second registration under one name is a
    /// configuration bug, not something to overwrite.
    pub fn register(&self, handle: LookupHandle) -> EmxResult<()> {
        let name = handle.name.clone();
        match self.inner.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(EmxError::DuplicateLookup(name))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(handle));
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> EmxResult<Arc<LookupHandle>> {
        self.inner
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EmxError::LookupNotFound(name.to_string()))
    }

    /// Registered names, sorted for stable iteration.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
