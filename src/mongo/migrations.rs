//! Schema setup and version gate for the change-feed backend
//!
//! Ensures the collections and indexes exist and that the server's change
//! stream semantics are recent enough to honor `startAfter` resumption.

use mongodb::Database;
use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::IndexModel;
use tracing::{debug, info};

use super::{AUX_COLLECTION, OUTBOX_COLLECTION, STATE_COLLECTION};
use crate::errors::{OutboxError, OutboxResult};

/// Minimum wire version; MongoDB 4.2 introduced `startAfter` resumption
const MIN_WIRE_VERSION: i32 = 8;

// Server error code for "namespace already exists"
const NAMESPACE_EXISTS: i32 = 48;

/// Refuse to run on servers whose change-stream semantics are unsupported.
pub(crate) async fn check_server_version(db: &Database) -> OutboxResult<()> {
    let hello = db.run_command(doc! { "hello": 1 }).await?;
    let wire_version = hello
        .get_i32("maxWireVersion")
        .or_else(|_| hello.get_i64("maxWireVersion").map(|v| v as i32))
        .unwrap_or(0);
    debug!(wire_version, "checked server wire version");

    if wire_version < MIN_WIRE_VERSION {
        let build_info = db.run_command(doc! { "buildInfo": 1 }).await.ok();
        let found = build_info
            .as_ref()
            .and_then(|info| info.get_str("version").ok())
            .unwrap_or("unknown")
            .to_string();
        return Err(OutboxError::NotSupportedVersion {
            found,
            required: "4.2".to_string(),
        });
    }
    Ok(())
}

/// Idempotently create collections and indexes for one consumer.
pub(crate) async fn run(db: &Database, with_auxiliary: bool) -> OutboxResult<()> {
    check_server_version(db).await?;

    ensure_collection(db, OUTBOX_COLLECTION).await?;
    ensure_collection(db, STATE_COLLECTION).await?;
    if with_auxiliary {
        ensure_collection(db, AUX_COLLECTION).await?;
    }

    db.collection::<mongodb::bson::Document>(OUTBOX_COLLECTION)
        .create_index(
            IndexModel::builder()
                .keys(doc! { "partitionKey": 1, "position": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build(),
        )
        .await?;

    db.collection::<mongodb::bson::Document>(STATE_COLLECTION)
        .create_index(
            IndexModel::builder()
                .keys(doc! { "consumerName": 1, "partitionKey": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build(),
        )
        .await?;

    if with_auxiliary {
        db.collection::<mongodb::bson::Document>(AUX_COLLECTION)
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "consumerName": 1, "delivered": 1, "addedAt": 1 })
                    .build(),
            )
            .await?;
    }

    info!(database = db.name(), "migrations complete");
    Ok(())
}

async fn ensure_collection(db: &Database, name: &str) -> OutboxResult<()> {
    match db.create_collection(name).await {
        Ok(()) => Ok(()),
        Err(err) if is_namespace_exists(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn is_namespace_exists(err: &mongodb::error::Error) -> bool {
    matches!(
        *err.kind,
        mongodb::error::ErrorKind::Command(ref command) if command.code == NAMESPACE_EXISTS
    )
}
