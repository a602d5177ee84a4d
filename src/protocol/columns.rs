//! Column-type descriptor and tuple decoding
//!
//! The replication stream delivers every column as text; the descriptor
//! declares how each outbox column is typed so tuples can be decoded into
//! rows without consulting the catalog.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::messages::{ColumnData, RelationInfo, TupleData};
use crate::errors::{OutboxError, OutboxResult};

/// How a column's text payload is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    /// 64-bit integer; wider integer text is promoted to [`ColumnValue::Numeric`]
    Int8,
    Text,
    /// JSON passed through as UTF-8 text and parsed into a value
    Json,
}

/// A decoded column value
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Int(i64),
    /// Integer text wider than 64 bits, kept as its decimal digits
    Numeric(String),
    Text(String),
    Json(serde_json::Value),
}

/// Declares which outbox column is which type, by column name.
///
/// Columns present in the relation but absent from the descriptor are
/// ignored, so schema additions do not break a running consumer.
#[derive(Debug, Clone)]
pub struct TableSpec {
    columns: HashMap<String, ColumnKind>,
}

impl TableSpec {
    pub fn new(columns: impl IntoIterator<Item = (String, ColumnKind)>) -> Self {
        Self {
            columns: columns.into_iter().collect(),
        }
    }

    /// Descriptor for the primary outbox table.
    pub fn outbox() -> Self {
        Self::new([
            ("position".to_string(), ColumnKind::Int8),
            ("messageId".to_string(), ColumnKind::Text),
            ("messageType".to_string(), ColumnKind::Text),
            ("partitionKey".to_string(), ColumnKind::Text),
            ("data".to_string(), ColumnKind::Json),
        ])
    }

    pub fn kind_of(&self, column_name: &str) -> Option<ColumnKind> {
        self.columns.get(column_name).copied()
    }

    /// Decode a tuple against its relation schema into named values.
    pub fn decode(
        &self,
        relation: &RelationInfo,
        tuple: &TupleData,
    ) -> OutboxResult<HashMap<String, ColumnValue>> {
        if relation.columns.len() != tuple.columns.len() {
            return Err(OutboxError::protocol(format!(
                "tuple has {} columns but relation '{}' declares {}",
                tuple.columns.len(),
                relation.name,
                relation.columns.len()
            )));
        }

        let mut values = HashMap::new();
        for (info, data) in relation.columns.iter().zip(&tuple.columns) {
            let Some(kind) = self.kind_of(&info.name) else {
                continue;
            };
            let value = match data {
                ColumnData::Null | ColumnData::UnchangedToast => ColumnValue::Null,
                ColumnData::Text(text) => decode_text(kind, text)?,
                ColumnData::Binary(_) => {
                    return Err(OutboxError::protocol(format!(
                        "column '{}' arrived in binary format",
                        info.name
                    )));
                }
            };
            values.insert(info.name.clone(), value);
        }
        Ok(values)
    }
}

fn decode_text(kind: ColumnKind, text: &str) -> OutboxResult<ColumnValue> {
    match kind {
        ColumnKind::Int8 => match text.parse::<i64>() {
            Ok(value) => Ok(ColumnValue::Int(value)),
            // Integer text wider than 64 bits is promoted rather than lost
            Err(_) if is_integer_text(text) => Ok(ColumnValue::Numeric(text.to_string())),
            Err(_) => Err(OutboxError::protocol(format!(
                "expected integer column text, found '{text}'"
            ))),
        },
        ColumnKind::Text => Ok(ColumnValue::Text(text.to_string())),
        ColumnKind::Json => serde_json::from_str(text)
            .map(ColumnValue::Json)
            .map_err(|e| OutboxError::protocol(format!("invalid JSON column: {e}"))),
    }
}

fn is_integer_text(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// A fully decoded primary outbox row
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub position: i64,
    pub message_id: String,
    pub message_type: String,
    pub partition_key: String,
    pub data: serde_json::Value,
}

impl OutboxRow {
    /// Assemble an outbox row from decoded column values.
    pub fn from_values(mut values: HashMap<String, ColumnValue>) -> OutboxResult<Self> {
        let position = match values.remove("position") {
            Some(ColumnValue::Int(v)) => v,
            other => {
                return Err(OutboxError::protocol(format!(
                    "outbox row has no usable position column: {other:?}"
                )));
            }
        };
        let message_id = take_text(&mut values, "messageId")?;
        let message_type = take_text(&mut values, "messageType")?;
        let partition_key = take_text(&mut values, "partitionKey")?;
        let data = match values.remove("data") {
            Some(ColumnValue::Json(v)) => v,
            Some(ColumnValue::Null) | None => serde_json::Value::Null,
            other => {
                return Err(OutboxError::protocol(format!(
                    "outbox row has malformed data column: {other:?}"
                )));
            }
        };

        Ok(Self {
            position,
            message_id,
            message_type,
            partition_key,
            data,
        })
    }
}

fn take_text(
    values: &mut HashMap<String, ColumnValue>,
    name: &str,
) -> OutboxResult<String> {
    match values.remove(name) {
        Some(ColumnValue::Text(v)) => Ok(v),
        other => Err(OutboxError::protocol(format!(
            "outbox row column '{name}' is missing or mistyped: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::ColumnInfo;
    use serde_json::json;

    fn outbox_relation() -> RelationInfo {
        let column = |name: &str, oid: u32| ColumnInfo {
            key_flag: 0,
            name: name.to_string(),
            type_oid: oid,
            type_modifier: -1,
        };
        RelationInfo {
            oid: 1,
            namespace: "hermes".into(),
            name: "outbox".into(),
            replica_identity: 'd',
            columns: vec![
                column("position", 20),
                column("messageId", 25),
                column("messageType", 25),
                column("partitionKey", 25),
                column("data", 3802),
                column("sentAt", 1184),
            ],
        }
    }

    fn text(s: &str) -> ColumnData {
        ColumnData::Text(s.to_string())
    }

    #[test]
    fn decodes_a_full_outbox_row() {
        let tuple = TupleData {
            columns: vec![
                text("42"),
                text("m1"),
                text("OrderPlaced"),
                text("default"),
                text(r#"{"total": 12}"#),
                ColumnData::Null,
            ],
        };

        let values = TableSpec::outbox()
            .decode(&outbox_relation(), &tuple)
            .unwrap();
        let row = OutboxRow::from_values(values).unwrap();
        assert_eq!(row.position, 42);
        assert_eq!(row.message_id, "m1");
        assert_eq!(row.message_type, "OrderPlaced");
        assert_eq!(row.partition_key, "default");
        assert_eq!(row.data, json!({"total": 12}));
    }

    #[test]
    fn undeclared_columns_are_ignored() {
        let tuple = TupleData {
            columns: vec![
                text("1"),
                text("m"),
                text("T"),
                text("default"),
                text("null"),
                text("2026-01-01 00:00:00+00"),
            ],
        };
        let values = TableSpec::outbox()
            .decode(&outbox_relation(), &tuple)
            .unwrap();
        assert!(!values.contains_key("sentAt"));
    }

    #[test]
    fn oversized_integer_text_is_promoted() {
        let value = decode_text(ColumnKind::Int8, "170141183460469231731687303715884105727")
            .unwrap();
        assert_eq!(
            value,
            ColumnValue::Numeric("170141183460469231731687303715884105727".into())
        );
    }

    #[test]
    fn garbage_integer_text_is_an_error() {
        assert!(decode_text(ColumnKind::Int8, "12abc").is_err());
    }

    #[test]
    fn column_count_mismatch_is_fatal() {
        let tuple = TupleData {
            columns: vec![text("1")],
        };
        assert!(
            TableSpec::outbox()
                .decode(&outbox_relation(), &tuple)
                .is_err()
        );
    }

    #[test]
    fn binary_format_is_rejected_for_declared_columns() {
        let tuple = TupleData {
            columns: vec![
                ColumnData::Binary(vec![0, 1]),
                text("m"),
                text("T"),
                text("default"),
                text("{}"),
                ColumnData::Null,
            ],
        };
        assert!(
            TableSpec::outbox()
                .decode(&outbox_relation(), &tuple)
                .is_err()
        );
    }
}
