//! PostgreSQL logical replication protocol handling
//!
//! Implements the `pgoutput` v1 wire format: frame parsing, logical message
//! decoding, tuple handling and the standby status update sent back to the
//! server. Everything here is pure byte manipulation; transport lives in
//! [`crate::pg::connection`].

pub mod buffer;
pub mod columns;
pub mod messages;
pub mod parser;

// Type aliases matching PostgreSQL internal types
pub type Oid = u32; // Object ID
pub type Xid = u32; // Transaction ID
pub type TimestampTz = i64; // Microseconds since the PostgreSQL epoch

// Seconds from the Unix epoch (1970-01-01) to the PostgreSQL epoch (2000-01-01)
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// Convert a protocol timestamp back to a UTC instant.
pub fn pg_timestamp_to_datetime(ts: TimestampTz) -> Option<chrono::DateTime<chrono::Utc>> {
    let secs = ts.div_euclid(1_000_000) + PG_EPOCH_OFFSET_SECS;
    let micros = ts.rem_euclid(1_000_000) as u32;
    chrono::DateTime::from_timestamp(secs, micros * 1_000)
}

/// Convert a UTC instant to the protocol's microsecond-since-2000 form.
pub fn datetime_to_pg_timestamp(at: chrono::DateTime<chrono::Utc>) -> TimestampTz {
    at.timestamp_micros() - PG_EPOCH_OFFSET_SECS * 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pg_epoch_is_y2k() {
        let y2k = chrono::DateTime::from_timestamp(PG_EPOCH_OFFSET_SECS, 0).unwrap();
        assert_eq!(datetime_to_pg_timestamp(y2k), 0);
    }

    #[test]
    fn timestamp_round_trips_through_chrono() {
        let ts = 789_012_345_678_i64;
        let dt = pg_timestamp_to_datetime(ts).unwrap();
        assert_eq!(dt.timestamp_micros(), ts + PG_EPOCH_OFFSET_SECS * 1_000_000);
        assert_eq!(datetime_to_pg_timestamp(dt), ts);
    }
}
