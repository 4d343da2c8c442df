//! Wire Handlers
//!
//! Each handler knows how to move one category of [`Value`] across the wire.
//! The codec asks them in priority order: custom serializers first, then
//! tables, then plain scalars, sequences and mappings. A handler returns
//! `None` when the value is not its concern.

use std::sync::Arc;

use serde_json::{Map, Number, Value as Json};

use super::value::{Record, Table, Value};
use super::WireCodec;
use crate::error::SerializationError;

/// Wire key marking a table payload.
pub const TABLE_TAG: &str = "__table__";

/// Wire key naming the type of a custom record.
pub const RECORD_TAG: &str = "__record__";

/// Wire key wrapping a plain mapping whose own keys collide with a tag.
pub const MAP_TAG: &str = "__map__";

fn is_reserved(key: &str) -> bool {
    key == TABLE_TAG || key == RECORD_TAG || key == MAP_TAG
}

/// One entry in the codec's handler list.
pub trait WireHandler: Send + Sync {
    fn name(&self) -> &str;

    fn serialize(
        &self,
        value: &Value,
        codec: &WireCodec,
    ) -> Option<Result<Json, SerializationError>>;

    fn deserialize(
        &self,
        wire: &Json,
        codec: &WireCodec,
    ) -> Option<Result<Value, SerializationError>>;
}

/// User-supplied conversion for one record type.
pub trait CustomSerializer: Send + Sync {
    /// The record type this serializer handles.
    fn type_name(&self) -> &str;

    fn to_wire(&self, record: &Record, codec: &WireCodec) -> Result<Json, SerializationError>;

    fn from_wire(&self, payload: &Json, codec: &WireCodec) -> Result<Record, SerializationError>;
}

/// Serializes a record as a plain object of its fields.
#[derive(Debug, Clone)]
pub struct FieldsSerializer {
    type_name: String,
}

impl FieldsSerializer {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
        }
    }
}

impl CustomSerializer for FieldsSerializer {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn to_wire(&self, record: &Record, codec: &WireCodec) -> Result<Json, SerializationError> {
        let mut object = Map::new();
        for (name, value) in record.fields() {
            object.insert(name.clone(), codec.serialize(value)?);
        }
        Ok(Json::Object(object))
    }

    fn from_wire(&self, payload: &Json, codec: &WireCodec) -> Result<Record, SerializationError> {
        let object = payload.as_object().ok_or_else(|| {
            SerializationError::Malformed(format!(
                "`{}` payload must be an object",
                self.type_name
            ))
        })?;
        let mut record = Record::new(self.type_name.clone());
        for (name, value) in object {
            record.insert(name.clone(), codec.deserialize(value)?);
        }
        Ok(record)
    }
}

/// Adapts a [`CustomSerializer`] into the handler list.
pub(crate) struct CustomHandler {
    serializer: Arc<dyn CustomSerializer>,
}

impl CustomHandler {
    pub(crate) fn new(serializer: Arc<dyn CustomSerializer>) -> Self {
        Self { serializer }
    }
}

impl WireHandler for CustomHandler {
    fn name(&self) -> &str {
        self.serializer.type_name()
    }

    fn serialize(
        &self,
        value: &Value,
        codec: &WireCodec,
    ) -> Option<Result<Json, SerializationError>> {
        let Value::Record(record) = value else {
            return None;
        };
        if record.type_name() != self.serializer.type_name() {
            return None;
        }
        Some(self.serializer.to_wire(record, codec).map(|payload| {
            let mut object = Map::new();
            object.insert(
                RECORD_TAG.to_string(),
                Json::String(record.type_name().to_string()),
            );
            object.insert("value".to_string(), payload);
            Json::Object(object)
        }))
    }

    fn deserialize(
        &self,
        wire: &Json,
        codec: &WireCodec,
    ) -> Option<Result<Value, SerializationError>> {
        let object = wire.as_object()?;
        let tag = object.get(RECORD_TAG)?.as_str()?;
        if tag != self.serializer.type_name() {
            return None;
        }
        let payload = object.get("value").unwrap_or(&Json::Null);
        Some(self.serializer.from_wire(payload, codec).map(Value::Record))
    }
}

/// Structured tables: `{"__table__": {"columns": [..], "rows": [[..]]}}`.
#[derive(Debug, Default)]
pub struct TableHandler;

impl TableHandler {
    fn encode(table: &Table, codec: &WireCodec) -> Result<Json, SerializationError> {
        if let Some(row) = table.ragged_row() {
            return Err(SerializationError::not_serializable(
                "table",
                format!(
                    "row {row} does not match the {} declared columns",
                    table.columns().len()
                ),
            ));
        }
        let columns = table
            .columns()
            .iter()
            .map(|c| Json::String(c.clone()))
            .collect();
        let rows = table
            .rows()
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| codec.serialize(cell))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Json::Array)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut body = Map::new();
        body.insert("columns".to_string(), Json::Array(columns));
        body.insert("rows".to_string(), Json::Array(rows));
        let mut object = Map::new();
        object.insert(TABLE_TAG.to_string(), Json::Object(body));
        Ok(Json::Object(object))
    }

    fn decode(body: &Json, codec: &WireCodec) -> Result<Value, SerializationError> {
        let malformed = |what: &str| SerializationError::Malformed(format!("table {what}"));

        let columns = body
            .get("columns")
            .and_then(Json::as_array)
            .ok_or_else(|| malformed("is missing `columns`"))?
            .iter()
            .map(|c| {
                c.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| malformed("column names must be strings"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut table = Table::new(columns);
        let rows = body
            .get("rows")
            .and_then(Json::as_array)
            .ok_or_else(|| malformed("is missing `rows`"))?;
        for row in rows {
            let cells = row
                .as_array()
                .ok_or_else(|| malformed("rows must be arrays"))?
                .iter()
                .map(|cell| codec.deserialize(cell))
                .collect::<Result<Vec<_>, _>>()?;
            table
                .push_row(cells)
                .map_err(|e| SerializationError::Malformed(e.to_string()))?;
        }
        Ok(Value::Table(table))
    }
}

impl WireHandler for TableHandler {
    fn name(&self) -> &str {
        "table"
    }

    fn serialize(
        &self,
        value: &Value,
        codec: &WireCodec,
    ) -> Option<Result<Json, SerializationError>> {
        match value {
            Value::Table(table) => Some(Self::encode(table, codec)),
            _ => None,
        }
    }

    fn deserialize(
        &self,
        wire: &Json,
        codec: &WireCodec,
    ) -> Option<Result<Value, SerializationError>> {
        let object = wire.as_object()?;
        if object.len() != 1 {
            return None;
        }
        let body = object.get(TABLE_TAG)?;
        Some(Self::decode(body, codec))
    }
}

/// Scalars, sequences and string-keyed mappings.
///
/// A mapping with a key that collides with one of the wire tags is sent as
/// `{"__map__": {..}}` so it cannot be mistaken for a table or a record.
#[derive(Debug, Default)]
pub struct PlainHandler;

impl PlainHandler {
    fn decode_map(
        object: &Map<String, Json>,
        codec: &WireCodec,
    ) -> Result<Value, SerializationError> {
        object
            .iter()
            .map(|(k, v)| codec.deserialize(v).map(|value| (k.clone(), value)))
            .collect::<Result<_, _>>()
            .map(Value::Map)
    }
}

impl WireHandler for PlainHandler {
    fn name(&self) -> &str {
        "plain"
    }

    fn serialize(
        &self,
        value: &Value,
        codec: &WireCodec,
    ) -> Option<Result<Json, SerializationError>> {
        let wire = match value {
            Value::Null => Ok(Json::Null),
            Value::Bool(b) => Ok(Json::Bool(*b)),
            Value::Int(i) => Ok(Json::Number(Number::from(*i))),
            Value::Float(f) => Number::from_f64(*f).map(Json::Number).ok_or_else(|| {
                SerializationError::not_serializable(
                    "float",
                    format!("{f} has no wire representation"),
                )
            }),
            Value::Str(s) => Ok(Json::String(s.clone())),
            Value::List(items) => items
                .iter()
                .map(|item| codec.serialize(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Json::Array),
            Value::Map(map) => map
                .iter()
                .map(|(k, v)| codec.serialize(v).map(|wire| (k.clone(), wire)))
                .collect::<Result<Map<_, _>, _>>()
                .map(|object| {
                    if object.keys().any(|k| is_reserved(k)) {
                        let mut wrapper = Map::new();
                        wrapper.insert(MAP_TAG.to_string(), Json::Object(object));
                        Json::Object(wrapper)
                    } else {
                        Json::Object(object)
                    }
                }),
            Value::Table(_) | Value::Record(_) => return None,
        };
        Some(wire)
    }

    fn deserialize(
        &self,
        wire: &Json,
        codec: &WireCodec,
    ) -> Option<Result<Value, SerializationError>> {
        let value = match wire {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Ok(Value::Int(i)),
                None if n.is_u64() => Err(SerializationError::Malformed(format!(
                    "integer {n} exceeds the signed 64-bit range"
                ))),
                None => n.as_f64().map(Value::Float).ok_or_else(|| {
                    SerializationError::Malformed(format!("number {n} out of range"))
                }),
            },
            Json::String(s) => Ok(Value::Str(s.clone())),
            Json::Array(items) => items
                .iter()
                .map(|item| codec.deserialize(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Json::Object(object) => {
                if let (1, Some(Json::Object(inner))) = (object.len(), object.get(MAP_TAG)) {
                    return Some(Self::decode_map(inner, codec));
                }
                if let Some(tag) = object.get(RECORD_TAG) {
                    return Some(Err(SerializationError::Malformed(format!(
                        "no serializer registered for record type {tag}"
                    ))));
                }
                Self::decode_map(object, codec)
            }
        };
        Some(value)
    }
}
