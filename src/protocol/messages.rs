//! Replication protocol message model
//!
//! Two layers arrive on the wire. Top-level frames (`XLogData`, primary
//! keepalive) wrap the COPY BOTH stream; inside `XLogData` travel the
//! `pgoutput` logical messages describing transactions. The only
//! client-to-server message the consumer emits is the standby status update.

use serde::Serialize;

use super::buffer::{BufferReader, BufferWriter};
use super::{Oid, TimestampTz, Xid};
use crate::errors::{OutboxError, OutboxResult};
use crate::lsn::Lsn;

/// Top-level frame wrapping a logical message
#[derive(Debug, Clone)]
pub struct XLogData {
    /// WAL position where this payload starts
    pub wal_start: Lsn,
    /// Server's current end-of-WAL position
    pub wal_end: Lsn,
    pub send_time: TimestampTz,
    pub data: Vec<u8>,
}

/// Keepalive frame from the server
#[derive(Debug, Clone, Copy)]
pub struct PrimaryKeepalive {
    /// Server's current end-of-WAL position
    pub wal_end: Lsn,
    pub timestamp: TimestampTz,
    /// Server wants a status update as soon as possible
    pub reply_requested: bool,
}

/// The two frame types a replication session receives
#[derive(Debug, Clone)]
pub enum ReplicationFrame {
    XLogData(XLogData),
    Keepalive(PrimaryKeepalive),
}

impl ReplicationFrame {
    /// Parse one COPY BOTH payload into a frame.
    ///
    /// An unknown top-level tag byte is fatal to the stream session.
    pub fn parse(data: &[u8]) -> OutboxResult<Self> {
        let mut reader = BufferReader::new(data);
        let tag = reader.read_char()?;
        match tag {
            'w' => {
                let wal_start = Lsn(reader.read_u64()?);
                let wal_end = Lsn(reader.read_u64()?);
                let send_time = reader.read_i64()?;
                let data = reader.read_bytes(reader.remaining())?;
                if data.is_empty() {
                    return Err(OutboxError::protocol("XLogData frame has no payload"));
                }
                Ok(Self::XLogData(XLogData {
                    wal_start,
                    wal_end,
                    send_time,
                    data,
                }))
            }
            'k' => {
                let wal_end = Lsn(reader.read_u64()?);
                let timestamp = reader.read_i64()?;
                let reply_requested = reader.read_u8()? != 0;
                Ok(Self::Keepalive(PrimaryKeepalive {
                    wal_end,
                    timestamp,
                    reply_requested,
                }))
            }
            other => Err(OutboxError::protocol(format!(
                "unknown replication frame tag '{other}'"
            ))),
        }
    }
}

/// Standby status update sent back to the server.
///
/// The consumer reports the same acknowledged position for written, flushed
/// and applied; the upstream may reclaim log up to that point.
#[derive(Debug, Clone, Copy)]
pub struct StandbyStatusUpdate {
    pub written: Lsn,
    pub flushed: Lsn,
    pub applied: Lsn,
    /// Microseconds since 2000-01-01
    pub clock: TimestampTz,
    pub reply_requested: bool,
}

/// Wire size of a serialized status update
pub const STANDBY_STATUS_UPDATE_LEN: usize = 34;

impl StandbyStatusUpdate {
    pub fn at(acked: Lsn, clock: TimestampTz) -> Self {
        Self {
            written: acked,
            flushed: acked,
            applied: acked,
            clock,
            reply_requested: false,
        }
    }

    pub fn to_bytes(&self) -> OutboxResult<[u8; STANDBY_STATUS_UPDATE_LEN]> {
        let mut buf = [0u8; STANDBY_STATUS_UPDATE_LEN];
        let written = {
            let mut writer = BufferWriter::new(&mut buf);
            writer.write_u8(b'r')?;
            writer.write_u64(self.written.0)?;
            writer.write_u64(self.flushed.0)?;
            writer.write_u64(self.applied.0)?;
            writer.write_i64(self.clock)?;
            writer.write_u8(if self.reply_requested { 1 } else { 0 })?;
            writer.bytes_written()
        };
        if written != STANDBY_STATUS_UPDATE_LEN {
            return Err(OutboxError::protocol("status update serialized short"));
        }
        Ok(buf)
    }
}

/// Information about a column of a replicated table
#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    /// 1 when the column is part of the replica identity key
    pub key_flag: i8,
    pub name: String,
    pub type_oid: Oid,
    pub type_modifier: i32,
}

/// Schema of a replicated table, sent once per relation per session
#[derive(Debug, Clone, Serialize)]
pub struct RelationInfo {
    pub oid: Oid,
    pub namespace: String,
    pub name: String,
    pub replica_identity: char,
    pub columns: Vec<ColumnInfo>,
}

/// Per-column payload formats inside a tuple
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ColumnData {
    Null,
    /// Unchanged TOAST value; contents were not sent
    UnchangedToast,
    Text(String),
    Binary(Vec<u8>),
}

/// All column data for a single row
#[derive(Debug, Clone, Serialize)]
pub struct TupleData {
    pub columns: Vec<ColumnData>,
}

/// Logical messages of the `pgoutput` v1 stream.
///
/// Only the messages the outbox cares about are fully decoded; the rest are
/// parsed far enough to be skipped safely.
#[derive(Debug, Clone)]
pub enum LogicalMessage {
    /// Transaction start; all messages up to `Commit` belong to it
    Begin {
        final_lsn: Lsn,
        timestamp: TimestampTz,
        xid: Xid,
    },

    /// Transaction end; the assembled batch becomes visible downstream
    Commit {
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        timestamp: TimestampTz,
    },

    /// Table schema, cached by the stream for subsequent inserts
    Relation(RelationInfo),

    /// A new outbox row
    Insert { relation_id: Oid, tuple: TupleData },

    /// Any other logical message; recognized and discarded
    Skipped { tag: char },
}
