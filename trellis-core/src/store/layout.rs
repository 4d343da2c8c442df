//! Component Tree
//!
//! The declared layout: every component id with its initial property values.
//! It is supplied once at setup and used to validate bindings and to seed
//! the property store.

use indexmap::IndexMap;
use serde_json::Value as Json;

use crate::error::SerializationError;
use crate::graph::PropRef;
use crate::wire::{Value, WireCodec};

/// Mapping of component id to its initial properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentTree {
    components: IndexMap<String, IndexMap<String, Value>>,
}

impl ComponentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a component with its initial properties.
    pub fn component<I, K, V>(mut self, id: impl Into<String>, props: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.insert(id, props);
        self
    }

    pub fn insert<I, K, V>(&mut self, id: impl Into<String>, props: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let entry = self.components.entry(id.into()).or_default();
        for (name, value) in props {
            entry.insert(name.into(), value.into());
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.components.contains_key(id)
    }

    pub fn get(&self, target: &PropRef) -> Option<&Value> {
        self.components.get(target.id())?.get(target.property())
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// All declared properties with their initial values.
    pub fn initial_values(&self) -> impl Iterator<Item = (PropRef, &Value)> {
        self.components.iter().flat_map(|(id, props)| {
            props
                .iter()
                .map(move |(name, value)| (PropRef::new(id.clone(), name.clone()), value))
        })
    }

    /// Load from the wire form `{"<id>": {"<property>": <value>, ...}, ...}`.
    pub fn from_wire(wire: &Json, codec: &WireCodec) -> Result<Self, SerializationError> {
        let components = wire
            .as_object()
            .ok_or_else(|| SerializationError::Malformed("layout must be an object".to_string()))?;

        let mut tree = Self::new();
        for (id, props) in components {
            let props = props.as_object().ok_or_else(|| {
                SerializationError::Malformed(format!("component `{id}` must map properties"))
            })?;
            let mut decoded = Vec::with_capacity(props.len());
            for (name, value) in props {
                decoded.push((name.clone(), codec.deserialize(value)?));
            }
            tree.insert(id.clone(), decoded);
        }
        Ok(tree)
    }
}
