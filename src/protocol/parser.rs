//! `pgoutput` v1 logical message parser
//!
//! Decodes the payload of `XLogData` frames. Transactions arrive as
//! `Begin` / `Relation` / `Insert` ... / `Commit`; the outbox only ever
//! inserts, so updates, deletes, truncates and the streaming-transaction
//! messages are parsed just far enough to skip them.

use tracing::{debug, trace};

use super::buffer::BufferReader;
use super::messages::{ColumnData, ColumnInfo, LogicalMessage, RelationInfo, TupleData};
use crate::errors::{OutboxError, OutboxResult};
use crate::lsn::Lsn;

/// Parse logical replication messages from an `XLogData` payload
pub struct MessageParser;

impl MessageParser {
    pub fn parse(buffer: &[u8]) -> OutboxResult<LogicalMessage> {
        if buffer.is_empty() {
            return Err(OutboxError::protocol("empty logical message"));
        }

        let mut reader = BufferReader::new(buffer);
        let tag = reader.read_char()?;
        trace!(?tag, "parsing logical message");

        match tag {
            'B' => Self::parse_begin(&mut reader),
            'C' => Self::parse_commit(&mut reader),
            'R' => Self::parse_relation(&mut reader),
            'I' => Self::parse_insert(&mut reader),
            'U' => Self::skip_update(&mut reader),
            'D' => Self::skip_delete(&mut reader),
            'T' => Self::skip_truncate(&mut reader),
            'O' => Self::skip_origin(&mut reader),
            'Y' => Self::skip_type(&mut reader),
            'M' => Self::skip_logical_decoding_message(&mut reader),
            // Streaming-transaction messages; never requested (streaming is
            // off for proto_version 1) but tolerated if a server sends them.
            'S' | 'E' | 'c' | 'A' => Ok(LogicalMessage::Skipped { tag }),
            other => Err(OutboxError::protocol_with_context(
                format!("unknown tag '{other}'"),
                "logical message",
            )),
        }
    }

    fn parse_begin(reader: &mut BufferReader<'_>) -> OutboxResult<LogicalMessage> {
        let final_lsn = Lsn(reader.read_u64()?);
        let timestamp = reader.read_i64()?;
        let xid = reader.read_u32()?;
        Ok(LogicalMessage::Begin {
            final_lsn,
            timestamp,
            xid,
        })
    }

    fn parse_commit(reader: &mut BufferReader<'_>) -> OutboxResult<LogicalMessage> {
        let flags = reader.read_u8()?;
        let commit_lsn = Lsn(reader.read_u64()?);
        let end_lsn = Lsn(reader.read_u64()?);
        let timestamp = reader.read_i64()?;
        Ok(LogicalMessage::Commit {
            flags,
            commit_lsn,
            end_lsn,
            timestamp,
        })
    }

    fn parse_relation(reader: &mut BufferReader<'_>) -> OutboxResult<LogicalMessage> {
        let oid = reader.read_u32()?;
        let namespace = reader.read_cstr()?;
        let name = reader.read_cstr()?;
        let replica_identity = reader.read_char()?;
        let column_count = reader.read_i16()?;

        let mut columns = Vec::with_capacity(column_count.max(0) as usize);
        for _ in 0..column_count {
            let key_flag = reader.read_i8()?;
            let column_name = reader.read_cstr()?;
            let type_oid = reader.read_u32()?;
            let type_modifier = reader.read_i32()?;
            columns.push(ColumnInfo {
                key_flag,
                name: column_name,
                type_oid,
                type_modifier,
            });
        }

        debug!(oid, %namespace, %name, columns = columns.len(), "cached relation schema");
        Ok(LogicalMessage::Relation(RelationInfo {
            oid,
            namespace,
            name,
            replica_identity,
            columns,
        }))
    }

    fn parse_insert(reader: &mut BufferReader<'_>) -> OutboxResult<LogicalMessage> {
        let relation_id = reader.read_u32()?;
        let marker = reader.read_char()?;
        if marker != 'N' {
            return Err(OutboxError::protocol_with_context(
                format!("expected 'N' tuple marker, found '{marker}'"),
                "insert",
            ));
        }
        let tuple = Self::parse_tuple(reader)?;
        Ok(LogicalMessage::Insert { relation_id, tuple })
    }

    fn skip_update(reader: &mut BufferReader<'_>) -> OutboxResult<LogicalMessage> {
        reader.read_u32()?; // relation id
        let marker = reader.read_char()?;
        match marker {
            'K' | 'O' => {
                Self::parse_tuple(reader)?;
                let next = reader.read_char()?;
                if next != 'N' {
                    return Err(OutboxError::protocol_with_context(
                        format!("expected 'N' after old tuple, found '{next}'"),
                        "update",
                    ));
                }
                Self::parse_tuple(reader)?;
            }
            'N' => {
                Self::parse_tuple(reader)?;
            }
            other => {
                return Err(OutboxError::protocol_with_context(
                    format!("invalid tuple marker '{other}'"),
                    "update",
                ));
            }
        }
        Ok(LogicalMessage::Skipped { tag: 'U' })
    }

    fn skip_delete(reader: &mut BufferReader<'_>) -> OutboxResult<LogicalMessage> {
        reader.read_u32()?; // relation id
        let marker = reader.read_char()?;
        if marker != 'K' && marker != 'O' {
            return Err(OutboxError::protocol_with_context(
                format!("invalid tuple marker '{marker}'"),
                "delete",
            ));
        }
        Self::parse_tuple(reader)?;
        Ok(LogicalMessage::Skipped { tag: 'D' })
    }

    fn skip_truncate(reader: &mut BufferReader<'_>) -> OutboxResult<LogicalMessage> {
        let relation_count = reader.read_u32()?;
        reader.read_u8()?; // option flags
        for _ in 0..relation_count {
            reader.read_u32()?;
        }
        Ok(LogicalMessage::Skipped { tag: 'T' })
    }

    fn skip_origin(reader: &mut BufferReader<'_>) -> OutboxResult<LogicalMessage> {
        reader.read_u64()?; // origin commit position
        reader.read_cstr()?; // origin name
        Ok(LogicalMessage::Skipped { tag: 'O' })
    }

    fn skip_type(reader: &mut BufferReader<'_>) -> OutboxResult<LogicalMessage> {
        reader.read_u32()?; // type oid
        reader.read_cstr()?; // namespace
        reader.read_cstr()?; // type name
        Ok(LogicalMessage::Skipped { tag: 'Y' })
    }

    fn skip_logical_decoding_message(reader: &mut BufferReader<'_>) -> OutboxResult<LogicalMessage> {
        reader.read_u8()?; // transactional flag
        reader.read_u64()?; // message position
        reader.read_cstr()?; // prefix
        let length = reader.read_i32()?;
        if length < 0 {
            return Err(OutboxError::protocol_with_context(
                "negative content length",
                "decoding message",
            ));
        }
        reader.skip(length as usize)?;
        Ok(LogicalMessage::Skipped { tag: 'M' })
    }

    fn parse_tuple(reader: &mut BufferReader<'_>) -> OutboxResult<TupleData> {
        let column_count = reader.read_i16()?;
        let mut columns = Vec::with_capacity(column_count.max(0) as usize);

        for _ in 0..column_count {
            let format = reader.read_char()?;
            let column = match format {
                'n' => ColumnData::Null,
                'u' => {
                    debug!("unchanged TOAST value in tuple");
                    ColumnData::UnchangedToast
                }
                't' => {
                    let length = reader.read_i32()?;
                    if length < 0 {
                        return Err(OutboxError::protocol_with_context(
                            "negative column length",
                            "tuple",
                        ));
                    }
                    let bytes = reader.read_bytes(length as usize)?;
                    ColumnData::Text(String::from_utf8_lossy(&bytes).into_owned())
                }
                'b' => {
                    let length = reader.read_i32()?;
                    if length < 0 {
                        return Err(OutboxError::protocol_with_context(
                            "negative column length",
                            "tuple",
                        ));
                    }
                    ColumnData::Binary(reader.read_bytes(length as usize)?)
                }
                other => {
                    return Err(OutboxError::protocol_with_context(
                        format!("unknown column format '{other}'"),
                        "tuple",
                    ));
                }
            };
            columns.push(column);
        }

        Ok(TupleData { columns })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_cstr(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(s.as_bytes());
        buf.push(0);
    }

    fn push_text_column(buf: &mut Vec<u8>, value: &str) {
        buf.push(b't');
        buf.extend_from_slice(&(value.len() as i32).to_be_bytes());
        buf.extend_from_slice(value.as_bytes());
    }

    fn begin_message() -> Vec<u8> {
        let mut buf = vec![b'B'];
        buf.extend_from_slice(&0x16_0000_1000u64.to_be_bytes());
        buf.extend_from_slice(&555i64.to_be_bytes());
        buf.extend_from_slice(&771u32.to_be_bytes());
        buf
    }

    fn relation_message() -> Vec<u8> {
        let mut buf = vec![b'R'];
        buf.extend_from_slice(&4242u32.to_be_bytes());
        push_cstr(&mut buf, "hermes");
        push_cstr(&mut buf, "outbox");
        buf.push(b'd');
        buf.extend_from_slice(&2i16.to_be_bytes());
        // position BIGINT key column
        buf.push(1);
        push_cstr(&mut buf, "position");
        buf.extend_from_slice(&20u32.to_be_bytes());
        buf.extend_from_slice(&(-1i32).to_be_bytes());
        // data JSONB column
        buf.push(0);
        push_cstr(&mut buf, "data");
        buf.extend_from_slice(&3802u32.to_be_bytes());
        buf.extend_from_slice(&(-1i32).to_be_bytes());
        buf
    }

    #[test]
    fn parses_begin() {
        match MessageParser::parse(&begin_message()).unwrap() {
            LogicalMessage::Begin {
                final_lsn,
                timestamp,
                xid,
            } => {
                assert_eq!(final_lsn, Lsn(0x16_0000_1000));
                assert_eq!(timestamp, 555);
                assert_eq!(xid, 771);
            }
            other => panic!("expected begin, got {other:?}"),
        }
    }

    #[test]
    fn parses_commit() {
        let mut buf = vec![b'C', 0];
        buf.extend_from_slice(&100u64.to_be_bytes());
        buf.extend_from_slice(&132u64.to_be_bytes());
        buf.extend_from_slice(&9i64.to_be_bytes());

        match MessageParser::parse(&buf).unwrap() {
            LogicalMessage::Commit {
                commit_lsn,
                end_lsn,
                ..
            } => {
                assert_eq!(commit_lsn, Lsn(100));
                assert_eq!(end_lsn, Lsn(132));
            }
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[test]
    fn parses_relation_schema() {
        match MessageParser::parse(&relation_message()).unwrap() {
            LogicalMessage::Relation(relation) => {
                assert_eq!(relation.oid, 4242);
                assert_eq!(relation.namespace, "hermes");
                assert_eq!(relation.name, "outbox");
                assert_eq!(relation.columns.len(), 2);
                assert_eq!(relation.columns[0].name, "position");
                assert_eq!(relation.columns[0].key_flag, 1);
                assert_eq!(relation.columns[1].name, "data");
            }
            other => panic!("expected relation, got {other:?}"),
        }
    }

    #[test]
    fn parses_insert_with_null_and_text_columns() {
        let mut buf = vec![b'I'];
        buf.extend_from_slice(&4242u32.to_be_bytes());
        buf.push(b'N');
        buf.extend_from_slice(&3i16.to_be_bytes());
        push_text_column(&mut buf, "17");
        buf.push(b'n');
        push_text_column(&mut buf, r#"{"v":1}"#);

        match MessageParser::parse(&buf).unwrap() {
            LogicalMessage::Insert { relation_id, tuple } => {
                assert_eq!(relation_id, 4242);
                assert_eq!(tuple.columns.len(), 3);
                assert_eq!(tuple.columns[0], ColumnData::Text("17".into()));
                assert_eq!(tuple.columns[1], ColumnData::Null);
                assert_eq!(tuple.columns[2], ColumnData::Text(r#"{"v":1}"#.into()));
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn update_and_delete_are_skipped_not_emitted() {
        // update with replica-identity key then new tuple
        let mut update = vec![b'U'];
        update.extend_from_slice(&4242u32.to_be_bytes());
        update.push(b'K');
        update.extend_from_slice(&1i16.to_be_bytes());
        push_text_column(&mut update, "17");
        update.push(b'N');
        update.extend_from_slice(&1i16.to_be_bytes());
        push_text_column(&mut update, "18");
        assert!(matches!(
            MessageParser::parse(&update).unwrap(),
            LogicalMessage::Skipped { tag: 'U' }
        ));

        let mut delete = vec![b'D'];
        delete.extend_from_slice(&4242u32.to_be_bytes());
        delete.push(b'O');
        delete.extend_from_slice(&1i16.to_be_bytes());
        push_text_column(&mut delete, "17");
        assert!(matches!(
            MessageParser::parse(&delete).unwrap(),
            LogicalMessage::Skipped { tag: 'D' }
        ));
    }

    #[test]
    fn truncate_is_skipped() {
        let mut buf = vec![b'T'];
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.push(0);
        buf.extend_from_slice(&4242u32.to_be_bytes());
        buf.extend_from_slice(&4243u32.to_be_bytes());
        assert!(matches!(
            MessageParser::parse(&buf).unwrap(),
            LogicalMessage::Skipped { tag: 'T' }
        ));
    }

    #[test]
    fn unknown_tag_is_fatal() {
        assert!(MessageParser::parse(b"Zjunk").is_err());
    }

    #[test]
    fn unknown_column_format_is_fatal() {
        let mut buf = vec![b'I'];
        buf.extend_from_slice(&4242u32.to_be_bytes());
        buf.push(b'N');
        buf.extend_from_slice(&1i16.to_be_bytes());
        buf.push(b'x');
        assert!(MessageParser::parse(&buf).is_err());
    }

    #[test]
    fn truncated_message_is_an_error() {
        let mut buf = begin_message();
        buf.truncate(10);
        assert!(MessageParser::parse(&buf).is_err());
    }
}
