//! Schema migrations for the log-streaming backend
//!
//! Idempotently creates the outbox tables, the publication and the logical
//! replication slot on first `start`. Safe under concurrent starts by
//! different processes: "already exists" is a non-error everywhere; only an
//! *acquired* slot is surfaced, and that happens later at stream start.

use tokio_postgres::Client;
use tokio_postgres::error::SqlState;
use tracing::{debug, info};

use crate::errors::{OutboxError, OutboxResult};

const CREATE_CORE: &str = r#"
CREATE SCHEMA IF NOT EXISTS hermes;

CREATE TABLE IF NOT EXISTS hermes.outbox (
    "position"     BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    "messageId"    TEXT NOT NULL,
    "messageType"  TEXT NOT NULL,
    "partitionKey" TEXT NOT NULL DEFAULT 'default',
    "data"         JSONB NOT NULL,
    "sentAt"       TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS outbox_partition_position_idx
    ON hermes.outbox ("partitionKey", "position");

CREATE TABLE IF NOT EXISTS hermes.consumer_state (
    "consumerName"      TEXT NOT NULL,
    "partitionKey"      TEXT NOT NULL,
    "lastAckedPosition" TEXT NOT NULL DEFAULT '0/0',
    "redeliveryCount"   INT NOT NULL DEFAULT 0,
    "createdAt"         TIMESTAMPTZ NOT NULL DEFAULT now(),
    "updatedAt"         TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY ("consumerName", "partitionKey")
);
"#;

const CREATE_AUXILIARY: &str = r#"
CREATE TABLE IF NOT EXISTS hermes.outbox_aux (
    "position"     BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    "consumerName" TEXT NOT NULL,
    "messageId"    TEXT NOT NULL,
    "messageType"  TEXT NOT NULL,
    "data"         JSONB NOT NULL,
    "delivered"    BOOLEAN NOT NULL DEFAULT FALSE,
    "failsCount"   INT NOT NULL DEFAULT 0,
    "addedAt"      TIMESTAMPTZ NOT NULL DEFAULT now(),
    "sentAt"       TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS outbox_aux_pending_idx
    ON hermes.outbox_aux ("consumerName", "delivered", "addedAt");
"#;

/// Verify the server is configured for logical replication at all.
pub(crate) async fn check_wal_level(client: &Client) -> OutboxResult<()> {
    let row = client.query_one("SHOW wal_level", &[]).await?;
    let wal_level: String = row.get(0);
    debug!(%wal_level, "checked wal_level");
    if wal_level != "logical" {
        return Err(OutboxError::config(format!(
            "wal_level is '{wal_level}', but logical replication requires 'logical'; \
             set wal_level = logical in postgresql.conf and restart the server"
        )));
    }
    Ok(())
}

/// Run all idempotent setup for one consumer partition.
pub(crate) async fn run(
    client: &Client,
    publication: &str,
    slot: &str,
    with_auxiliary: bool,
) -> OutboxResult<()> {
    check_wal_level(client).await?;

    client.batch_execute(CREATE_CORE).await?;
    if with_auxiliary {
        client.batch_execute(CREATE_AUXILIARY).await?;
    }

    create_publication(client, publication).await?;
    create_slot(client, slot).await?;

    info!(%publication, %slot, "migrations complete");
    Ok(())
}

async fn create_publication(client: &Client, publication: &str) -> OutboxResult<()> {
    let ddl = format!(r#"CREATE PUBLICATION "{publication}" FOR TABLE hermes.outbox"#);
    match client.batch_execute(&ddl).await {
        Ok(()) => {
            debug!(%publication, "publication created");
            Ok(())
        }
        Err(err) if err.code() == Some(&SqlState::DUPLICATE_OBJECT) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn create_slot(client: &Client, slot: &str) -> OutboxResult<()> {
    let exists = client
        .query_opt(
            "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot],
        )
        .await?;
    if exists.is_some() {
        return Ok(());
    }

    match client
        .execute(
            "SELECT pg_create_logical_replication_slot($1, 'pgoutput')",
            &[&slot],
        )
        .await
    {
        Ok(_) => {
            debug!(%slot, "replication slot created");
            Ok(())
        }
        // Lost the creation race to another process; that is fine
        Err(err) if err.code() == Some(&SqlState::DUPLICATE_OBJECT) => Ok(()),
        Err(err) => Err(err.into()),
    }
}
