//! Pool index key.
//!
//! A key is the full identity of a worker configuration: launch command,
//! backend variant and the preload module sets. Module sets compare
//! order-insensitively, but insertion order is preserved so preloading is
//! deterministic.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use crate::worker::{BackendKind, LaunchSpec};

/// A module the worker must (or should) have imported before checkout.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleSpec {
    pub name: String,
}

impl ModuleSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Immutable pool index. Equality and hash are structural; the hash is
/// precomputed because keys are hashed on every pool operation.
#[derive(Debug, Clone)]
pub struct PoolKey {
    launch: LaunchSpec,
    backend: BackendKind,
    required_modules: Vec<ModuleSpec>,
    optional_modules: Vec<ModuleSpec>,
    hash: u64,
}

impl PoolKey {
    pub fn new(
        launch: LaunchSpec,
        backend: BackendKind,
        required_modules: Vec<ModuleSpec>,
        optional_modules: Vec<ModuleSpec>,
    ) -> Self {
        let required_modules = dedup_preserving_order(required_modules);
        let optional_modules = dedup_preserving_order(optional_modules);
        let hash = compute_hash(&launch, backend, &required_modules, &optional_modules);
        Self {
            launch,
            backend,
            required_modules,
            optional_modules,
            hash,
        }
    }

    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Required preload modules in insertion order.
    pub fn required_modules(&self) -> &[ModuleSpec] {
        &self.required_modules
    }

    /// Optional preload modules in insertion order.
    pub fn optional_modules(&self) -> &[ModuleSpec] {
        &self.optional_modules
    }
}

impl PartialEq for PoolKey {
    fn eq(&self, other: &Self) -> bool {
        self.launch == other.launch
            && self.backend == other.backend
            && as_set(&self.required_modules) == as_set(&other.required_modules)
            && as_set(&self.optional_modules) == as_set(&other.optional_modules)
    }
}

impl Eq for PoolKey {}

impl Hash for PoolKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

fn dedup_preserving_order(modules: Vec<ModuleSpec>) -> Vec<ModuleSpec> {
    let mut seen = BTreeSet::new();
    modules
        .into_iter()
        .filter(|m| seen.insert(m.name.clone()))
        .collect()
}

fn as_set(modules: &[ModuleSpec]) -> BTreeSet<&str> {
    modules.iter().map(|m| m.name.as_str()).collect()
}

fn compute_hash(
    launch: &LaunchSpec,
    backend: BackendKind,
    required: &[ModuleSpec],
    optional: &[ModuleSpec],
) -> u64 {
    let mut hasher = DefaultHasher::new();
    launch.hash(&mut hasher);
    backend.hash(&mut hasher);
    // Hash in sorted order so equal-as-set keys hash alike.
    for set in [required, optional] {
        let sorted: BTreeSet<&str> = set.iter().map(|m| m.name.as_str()).collect();
        for name in sorted {
            name.hash(&mut hasher);
        }
    }
    hasher.finish()
}
