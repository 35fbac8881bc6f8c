//! Registry of datatypes accepted from streams.

use serde_json::Value;
use std::collections::HashMap;

use super::{DataObject, Payload};
use crate::errors::{EngineError, EngineResult};

/// Known datatype names and whether each is frozen.
///
/// A registry that accepts any datatype still applies the frozen flag of
/// registered types; unregistered ones decode as non-frozen payloads.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<String, bool>,
    any: bool,
}

impl TypeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a [`DataObject`] type.
    #[must_use]
    pub fn with_type<T: DataObject>(mut self) -> Self {
        self.register::<T>();
        self
    }

    /// Registers a [`DataObject`] type.
    pub fn register<T: DataObject>(&mut self) {
        self.types.insert(T::DATATYPE.to_string(), T::FROZEN);
    }

    /// Registers a datatype by name.
    pub fn register_name(&mut self, datatype: impl Into<String>, frozen: bool) {
        self.types.insert(datatype.into(), frozen);
    }

    /// Accepts every datatype, including unregistered ones.
    pub fn accept_any(&mut self) {
        self.any = true;
    }

    /// Whether unregistered datatypes are accepted.
    #[must_use]
    pub const fn accepts_any(&self) -> bool {
        self.any
    }

    /// Adds every type of `other`.
    pub fn merge(&mut self, other: &Self) {
        for (name, frozen) in &other.types {
            self.types.insert(name.clone(), *frozen);
        }
        self.any |= other.any;
    }

    /// Whether `datatype` is accepted.
    #[must_use]
    pub fn contains(&self, datatype: &str) -> bool {
        self.any || self.types.contains_key(datatype)
    }

    /// Number of registered datatypes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Builds a payload for a decoded value, failing for unknown datatypes.
    pub fn payload(&self, datatype: &str, value: Value) -> EngineResult<Payload> {
        match self.types.get(datatype) {
            Some(true) => Ok(Payload::frozen(datatype, value)),
            Some(false) => Ok(Payload::new(datatype, value)),
            None if self.any => Ok(Payload::new(datatype, value)),
            None => Err(EngineError::decode(format!(
                "datatype '{datatype}' is not accepted by this event"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_respects_frozen_flag() {
        let mut registry = TypeRegistry::new();
        registry.register_name("Config", true);
        registry.register_name("Item", false);

        assert!(registry.payload("Config", json!({})).unwrap().is_frozen());
        assert!(!registry.payload("Item", json!({})).unwrap().is_frozen());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_accept_any_keeps_registered_flags() {
        let mut registry = TypeRegistry::new();
        registry.register_name("Config", true);
        registry.accept_any();

        assert!(registry.contains("Mystery"));
        assert!(!registry.payload("Mystery", json!(1)).unwrap().is_frozen());
        assert!(registry.payload("Config", json!({})).unwrap().is_frozen());

        let mut merged = TypeRegistry::new();
        merged.merge(&registry);
        assert!(merged.accepts_any());
    }

    #[test]
    fn test_unknown_type_is_decode_error() {
        let registry = TypeRegistry::new();
        let err = registry.payload("Mystery", json!(1)).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }
}
