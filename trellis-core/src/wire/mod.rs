//! Serialization Adapter
//!
//! Converts between in-memory [`Value`]s and the JSON-like wire
//! representation handed to the transport layer.
//!
//! # Dispatch
//!
//! Conversion is an explicit, ordered list of [`WireHandler`]s registered at
//! startup, not capability probing at runtime:
//!
//! 1. custom serializers, one per record type
//! 2. [`TableHandler`] for structured tables
//! 3. [`PlainHandler`] for scalars, sequences and mappings
//!
//! The first handler that claims a value wins. If none does, the caller gets
//! [`SerializationError::NotSerializable`]; values are never coerced.
//!
//! # Message formats
//!
//! Whole messages ([`WireResponse`], [`ChangeRequest`](crate::request::ChangeRequest))
//! are encoded with [`WireFormat`]: JSON via `serde_json` or MessagePack via
//! `rmp-serde`.

mod handler;
mod value;

pub use handler::{
    CustomSerializer, FieldsSerializer, PlainHandler, TableHandler, WireHandler, MAP_TAG,
    RECORD_TAG, TABLE_TAG,
};
pub use value::{Record, Table, Value};

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::engine::FailureReport;
use crate::error::SerializationError;
use crate::graph::{CallbackId, PropRef};
use handler::CustomHandler;

/// Ordered handler list used for every value crossing the wire.
pub struct WireCodec {
    handlers: Vec<Arc<dyn WireHandler>>,
    custom: usize,
}

impl WireCodec {
    /// A codec with the built-in table and plain handlers.
    pub fn new() -> Self {
        Self {
            handlers: vec![Arc::new(TableHandler), Arc::new(PlainHandler)],
            custom: 0,
        }
    }

    /// Register a custom serializer ahead of the built-in handlers.
    ///
    /// Custom serializers keep their registration order among themselves.
    pub fn register(&mut self, serializer: Arc<dyn CustomSerializer>) {
        self.handlers
            .insert(self.custom, Arc::new(CustomHandler::new(serializer)));
        self.custom += 1;
    }

    pub fn with_serializer(mut self, serializer: impl CustomSerializer + 'static) -> Self {
        self.register(Arc::new(serializer));
        self
    }

    pub fn serialize(&self, value: &Value) -> Result<Json, SerializationError> {
        for handler in &self.handlers {
            if let Some(result) = handler.serialize(value, self) {
                return result;
            }
        }
        Err(SerializationError::not_serializable(
            value.type_name(),
            "no serializer registered for this type",
        ))
    }

    pub fn deserialize(&self, wire: &Json) -> Result<Value, SerializationError> {
        for handler in &self.handlers {
            if let Some(result) = handler.deserialize(wire, self) {
                return result;
            }
        }
        Err(SerializationError::Malformed(format!(
            "no handler accepts wire value {wire}"
        )))
    }

    /// Handler names in dispatch order.
    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WireCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireCodec")
            .field("handlers", &self.handler_names())
            .finish()
    }
}

/// Encoding used for whole messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    #[default]
    Json,
    #[serde(rename = "msgpack")]
    MessagePack,
}

impl WireFormat {
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, SerializationError> {
        match self {
            WireFormat::Json => {
                serde_json::to_vec(message).map_err(|e| SerializationError::Encoding {
                    format: "json",
                    reason: e.to_string(),
                })
            }
            WireFormat::MessagePack => {
                rmp_serde::to_vec_named(message).map_err(|e| SerializationError::Encoding {
                    format: "msgpack",
                    reason: e.to_string(),
                })
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        match self {
            WireFormat::Json => {
                serde_json::from_slice(bytes).map_err(|e| SerializationError::Encoding {
                    format: "json",
                    reason: e.to_string(),
                })
            }
            WireFormat::MessagePack => {
                rmp_serde::from_slice(bytes).map_err(|e| SerializationError::Encoding {
                    format: "msgpack",
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// A property value in wire form, used for inbound values and outbound patches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireProp {
    pub id: String,
    pub property: String,
    pub value: Json,
}

impl WireProp {
    pub fn new(target: &PropRef, value: Json) -> Self {
        Self {
            id: target.id().to_string(),
            property: target.property().to_string(),
            value,
        }
    }

    pub fn target(&self) -> PropRef {
        PropRef::new(self.id.clone(), self.property.clone())
    }
}

/// Outbound message for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    pub request_id: u64,
    pub patches: Vec<WireProp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailureReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancelled: Vec<CallbackId>,
}
