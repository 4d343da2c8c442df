//! Property and Callback References
//!
//! A [`PropRef`] names one property of one component. It is the unit that
//! bindings, the property store and patches are keyed by.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ParsePropRefError;

/// Reference to a single component property, written `component.property`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropRef {
    id: String,
    property: String,
}

impl PropRef {
    pub fn new(id: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            property: property.into(),
        }
    }

    /// The component id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The property name on the component.
    pub fn property(&self) -> &str {
        &self.property
    }
}

impl fmt::Display for PropRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.id, self.property)
    }
}

impl FromStr for PropRef {
    type Err = ParsePropRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('.') {
            Some((id, property)) if !id.is_empty() && !property.is_empty() => {
                Ok(Self::new(id, property))
            }
            _ => Err(ParsePropRefError(s.to_string())),
        }
    }
}

impl<A, B> From<(A, B)> for PropRef
where
    A: Into<String>,
    B: Into<String>,
{
    fn from((id, property): (A, B)) -> Self {
        Self::new(id, property)
    }
}

/// Stable identifier of a registered callback.
///
/// Cheap to clone; ids are copied into plans, claims and reports freely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(Arc<str>);

impl CallbackId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallbackId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for CallbackId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl Serialize for CallbackId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CallbackId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(CallbackId::from)
    }
}
