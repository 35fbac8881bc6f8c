//! Typed payloads exchanged between steps.
//!
//! A [`Payload`] is a JSON value tagged with a datatype name. The tag is the
//! runtime type used to dispatch steps; [`DataObject`] binds a Rust type to
//! its tag so steps can be written against concrete structs.

mod registry;
mod serdes;

pub use registry::TypeRegistry;
pub use serdes::{decode_payload, encode_payload, Serialization};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::errors::{EngineError, EngineResult};

/// A Rust type that can travel as a payload.
pub trait DataObject: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Datatype tag used for dispatch and on the wire.
    const DATATYPE: &'static str;

    /// Frozen payloads are shared instead of copied on hand-off and cannot be mutated.
    const FROZEN: bool = false;
}

/// A datatype-tagged value.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    datatype: String,
    value: Arc<Value>,
    frozen: bool,
}

impl Payload {
    /// Creates a mutable payload.
    #[must_use]
    pub fn new(datatype: impl Into<String>, value: Value) -> Self {
        Self {
            datatype: datatype.into(),
            value: Arc::new(value),
            frozen: false,
        }
    }

    /// Creates a frozen payload.
    #[must_use]
    pub fn frozen(datatype: impl Into<String>, value: Value) -> Self {
        Self {
            frozen: true,
            ..Self::new(datatype, value)
        }
    }

    /// Converts a [`DataObject`] into a payload.
    pub fn from_data<T: DataObject>(data: &T) -> EngineResult<Self> {
        let value = serde_json::to_value(data)?;
        Ok(Self {
            datatype: T::DATATYPE.to_string(),
            value: Arc::new(value),
            frozen: T::FROZEN,
        })
    }

    /// Reads the payload back as `T`, checking the datatype tag.
    pub fn to_data<T: DataObject>(&self) -> EngineResult<T> {
        if self.datatype != T::DATATYPE {
            return Err(EngineError::Serialization(format!(
                "payload has datatype '{}', expected '{}'",
                self.datatype,
                T::DATATYPE
            )));
        }
        Ok(T::deserialize(self.value.as_ref())?)
    }

    /// The datatype tag.
    #[must_use]
    pub fn datatype(&self) -> &str {
        &self.datatype
    }

    /// Whether the payload is frozen.
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Read access to the value.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Whether `self` and `other` share the same underlying value.
    #[must_use]
    pub fn shares_value_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }

    /// The payload to hand to a concurrent branch: shared if frozen, copied otherwise.
    #[must_use]
    pub fn copy_for_handoff(&self) -> Self {
        if self.frozen {
            return self.clone();
        }
        Self {
            datatype: self.datatype.clone(),
            value: Arc::new(self.value.as_ref().clone()),
            frozen: false,
        }
    }

    /// Mutable access to the value, copying it first if it is shared.
    pub fn value_mut(&mut self) -> EngineResult<&mut Value> {
        if self.frozen {
            return Err(EngineError::configuration(format!(
                "payload of datatype '{}' is frozen and cannot be mutated",
                self.datatype
            )));
        }
        Ok(Arc::make_mut(&mut self.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        id: String,
        qty: u32,
    }

    impl DataObject for Order {
        const DATATYPE: &'static str = "Order";
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Settings {
        level: u8,
    }

    impl DataObject for Settings {
        const DATATYPE: &'static str = "Settings";
        const FROZEN: bool = true;
    }

    #[test]
    fn test_typed_access() {
        let order = Order {
            id: "a".to_string(),
            qty: 2,
        };
        let payload = Payload::from_data(&order).unwrap();

        assert_eq!(payload.datatype(), "Order");
        assert!(!payload.is_frozen());
        assert_eq!(payload.to_data::<Order>().unwrap(), order);
        assert!(payload.to_data::<Settings>().is_err());
    }

    #[test]
    fn test_handoff_copies_unless_frozen() {
        let mutable = Payload::new("Order", json!({"id": "a"}));
        assert!(!mutable.copy_for_handoff().shares_value_with(&mutable));

        let frozen = Payload::from_data(&Settings { level: 1 }).unwrap();
        assert!(frozen.is_frozen());
        assert!(frozen.copy_for_handoff().shares_value_with(&frozen));
    }

    #[test]
    fn test_value_mut_is_copy_on_write() {
        let original = Payload::new("Order", json!({"id": "a"}));
        let mut edited = original.clone();
        edited.value_mut().unwrap()["id"] = json!("b");

        assert_eq!(original.value()["id"], "a");
        assert_eq!(edited.value()["id"], "b");
    }

    #[test]
    fn test_value_mut_refuses_frozen() {
        let mut frozen = Payload::frozen("Settings", json!({"level": 1}));
        let err = frozen.value_mut().unwrap_err();
        assert!(err.is_configuration());
    }
}
