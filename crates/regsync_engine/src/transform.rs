//! Transformer keyed by `source=>target` pair.

use crate::error::{EngineError, EngineResult};
use crate::plugin::{TransformParam, Transformer};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A conversion function for one component pair.
pub type ApplyFn = Arc<dyn Fn(Value) -> EngineResult<Value> + Send + Sync>;

/// Dispatches conversions by `"source=>target"` key.
pub struct KeyedTransformer {
    name: String,
    apply: HashMap<String, ApplyFn>,
}

impl KeyedTransformer {
    /// Creates a transformer with no conversions.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            apply: HashMap::new(),
        }
    }

    /// The lookup key of a component pair.
    pub fn key(source: &str, target: &str) -> String {
        format!("{source}=>{target}")
    }

    /// Adds a conversion for `source=>target`.
    pub fn with<F>(mut self, source: &str, target: &str, apply: F) -> Self
    where
        F: Fn(Value) -> EngineResult<Value> + Send + Sync + 'static,
    {
        self.apply.insert(Self::key(source, target), Arc::new(apply));
        self
    }

    /// Adds an identity conversion for `source=>target`.
    pub fn passthrough(self, source: &str, target: &str) -> Self {
        self.with(source, target, Ok)
    }

    /// Returns true if a conversion exists for the pair.
    pub fn supports(&self, source: &str, target: &str) -> bool {
        self.apply.contains_key(&Self::key(source, target))
    }
}

impl Transformer for KeyedTransformer {
    fn convert(&self, param: TransformParam) -> EngineResult<Value> {
        let key = Self::key(&param.source, &param.target);
        let apply = self
            .apply
            .get(&key)
            .ok_or(EngineError::NoTransformer { key })?;
        apply(param.object)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
