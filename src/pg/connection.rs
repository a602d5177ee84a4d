//! Streaming replication connection
//!
//! `tokio-postgres` drives the query connection, but it cannot open a session
//! with `replication=database`, so this module speaks the startup, auth and
//! COPY BOTH parts of the wire protocol directly over TCP using
//! `postgres-protocol` for framing. The `pgoutput` payload inside the COPY
//! stream is decoded by [`crate::protocol`].

use bytes::BytesMut;
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::{self, sasl};
use postgres_protocol::message::backend::{self, Message};
use postgres_protocol::message::frontend;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};

use crate::config::ConnectionOptions;
use crate::errors::{OutboxError, OutboxResult};
use crate::lsn::Lsn;
use crate::protocol::messages::{ReplicationFrame, StandbyStatusUpdate};

const READ_CHUNK: usize = 8 * 1024;

// SQLSTATE reported when a replication slot is already active elsewhere
const OBJECT_IN_USE: &str = "55006";

/// Result of the `IDENTIFY_SYSTEM` handshake
#[derive(Debug, Clone)]
pub struct SystemIdentity {
    pub system_id: String,
    pub timeline: String,
    pub xlog_pos: Option<Lsn>,
}

/// A replication session in the pre-streaming phase.
pub struct ReplicationClient {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl ReplicationClient {
    /// Open a `replication=database` session and authenticate.
    pub async fn connect(options: &ConnectionOptions) -> OutboxResult<Self> {
        let stream = TcpStream::connect((options.host.as_str(), options.port)).await?;
        stream.set_nodelay(true)?;
        let mut client = Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
        };
        client.handshake(options).await?;
        info!(host = %options.host, dbname = %options.dbname, "replication session established");
        Ok(client)
    }

    async fn handshake(&mut self, options: &ConnectionOptions) -> OutboxResult<()> {
        let params = [
            ("user", options.user.as_str()),
            ("database", options.dbname.as_str()),
            ("replication", "database"),
            ("application_name", "hermes"),
        ];
        frontend::startup_message(params, &mut self.write_buf)
            .map_err(|e| OutboxError::protocol(format!("startup message: {e}")))?;
        self.flush().await?;

        loop {
            match self.next_message().await? {
                Message::AuthenticationOk => {}
                Message::AuthenticationCleartextPassword => {
                    let password = required_password(options)?;
                    frontend::password_message(password.as_bytes(), &mut self.write_buf)
                        .map_err(|e| OutboxError::protocol(format!("password message: {e}")))?;
                    self.flush().await?;
                }
                Message::AuthenticationMd5Password(body) => {
                    let password = required_password(options)?;
                    let hashed = authentication::md5_hash(
                        options.user.as_bytes(),
                        password.as_bytes(),
                        body.salt(),
                    );
                    frontend::password_message(hashed.as_bytes(), &mut self.write_buf)
                        .map_err(|e| OutboxError::protocol(format!("password message: {e}")))?;
                    self.flush().await?;
                }
                Message::AuthenticationSasl(body) => {
                    self.authenticate_sasl(body, options).await?;
                }
                Message::BackendKeyData(_) | Message::ParameterStatus(_) => {}
                Message::NoticeResponse(_) => {}
                Message::ReadyForQuery(_) => return Ok(()),
                Message::ErrorResponse(body) => return Err(server_error(body)),
                other => {
                    return Err(OutboxError::protocol(format!(
                        "unexpected message during startup: {}",
                        message_name(&other)
                    )));
                }
            }
        }
    }

    async fn authenticate_sasl(
        &mut self,
        body: backend::AuthenticationSaslBody,
        options: &ConnectionOptions,
    ) -> OutboxResult<()> {
        let mut supports_scram = false;
        let mut mechanisms = body.mechanisms();
        while let Some(mechanism) = mechanisms
            .next()
            .map_err(|e| OutboxError::protocol(format!("SASL mechanism list: {e}")))?
        {
            if mechanism == sasl::SCRAM_SHA_256 {
                supports_scram = true;
            }
        }
        if !supports_scram {
            return Err(OutboxError::protocol(
                "server offers no supported SASL mechanism",
            ));
        }

        let password = required_password(options)?;
        let mut scram =
            sasl::ScramSha256::new(password.as_bytes(), sasl::ChannelBinding::unsupported());

        frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut self.write_buf)
            .map_err(|e| OutboxError::protocol(format!("SASL initial response: {e}")))?;
        self.flush().await?;

        loop {
            match self.next_message().await? {
                Message::AuthenticationSaslContinue(body) => {
                    scram
                        .update(body.data())
                        .map_err(|e| OutboxError::protocol(format!("SCRAM exchange: {e}")))?;
                    frontend::sasl_response(scram.message(), &mut self.write_buf)
                        .map_err(|e| OutboxError::protocol(format!("SASL response: {e}")))?;
                    self.flush().await?;
                }
                Message::AuthenticationSaslFinal(body) => {
                    scram
                        .finish(body.data())
                        .map_err(|e| OutboxError::protocol(format!("SCRAM verification: {e}")))?;
                    return Ok(());
                }
                Message::ErrorResponse(body) => return Err(server_error(body)),
                other => {
                    return Err(OutboxError::protocol(format!(
                        "unexpected message during SASL exchange: {}",
                        message_name(&other)
                    )));
                }
            }
        }
    }

    /// Run `IDENTIFY_SYSTEM` and report what the server says.
    pub async fn identify_system(&mut self) -> OutboxResult<SystemIdentity> {
        frontend::query("IDENTIFY_SYSTEM", &mut self.write_buf)
            .map_err(|e| OutboxError::protocol(format!("IDENTIFY_SYSTEM: {e}")))?;
        self.flush().await?;

        let mut first_row: Option<Vec<Option<String>>> = None;
        loop {
            match self.next_message().await? {
                Message::RowDescription(_) => {}
                Message::DataRow(body) => {
                    if first_row.is_none() {
                        first_row = Some(decode_data_row(&body)?);
                    }
                }
                Message::CommandComplete(_) => {}
                Message::ReadyForQuery(_) => break,
                Message::NoticeResponse(_) => {}
                Message::ErrorResponse(body) => return Err(server_error(body)),
                other => {
                    return Err(OutboxError::protocol(format!(
                        "unexpected message in IDENTIFY_SYSTEM: {}",
                        message_name(&other)
                    )));
                }
            }
        }

        let row = first_row
            .ok_or_else(|| OutboxError::protocol("IDENTIFY_SYSTEM returned no rows"))?;
        let identity = SystemIdentity {
            system_id: row.first().cloned().flatten().unwrap_or_default(),
            timeline: row.get(1).cloned().flatten().unwrap_or_default(),
            xlog_pos: row
                .get(2)
                .cloned()
                .flatten()
                .and_then(|v| v.parse::<Lsn>().ok()),
        };
        debug!(
            system_id = %identity.system_id,
            timeline = %identity.timeline,
            xlog_pos = ?identity.xlog_pos,
            "system identified"
        );
        Ok(identity)
    }

    /// Start streaming from `start` and switch the session into COPY BOTH.
    ///
    /// A slot held by another live session surfaces as `ConsumerAlreadyTaken`.
    pub async fn start_replication(
        mut self,
        slot: &str,
        publication: &str,
        start: Lsn,
        consumer_name: &str,
        partition_key: &str,
    ) -> OutboxResult<(FrameReader, FrameWriter)> {
        let command = format!(
            "START_REPLICATION SLOT \"{slot}\" LOGICAL {start} \
             (proto_version '1', publication_names '{publication}')"
        );
        info!(%slot, %publication, %start, "starting replication");

        frontend::query(&command, &mut self.write_buf)
            .map_err(|e| OutboxError::protocol(format!("START_REPLICATION: {e}")))?;
        self.flush().await?;

        loop {
            match self.next_message().await? {
                Message::CopyBothResponse(_) => break,
                Message::NoticeResponse(_) | Message::ParameterStatus(_) => {}
                Message::ErrorResponse(body) => {
                    let (code, message) = error_fields(body)?;
                    if code == OBJECT_IN_USE {
                        return Err(OutboxError::ConsumerAlreadyTaken {
                            consumer_name: consumer_name.to_string(),
                            partition_key: partition_key.to_string(),
                        });
                    }
                    return Err(OutboxError::storage(format!(
                        "START_REPLICATION failed ({code}): {message}"
                    )));
                }
                other => {
                    return Err(OutboxError::protocol(format!(
                        "unexpected message starting replication: {}",
                        message_name(&other)
                    )));
                }
            }
        }

        let (read_half, write_half) = self.stream.into_split();
        Ok((
            FrameReader {
                half: read_half,
                buf: self.read_buf,
            },
            FrameWriter {
                half: write_half,
                buf: self.write_buf,
            },
        ))
    }

    async fn next_message(&mut self) -> OutboxResult<Message> {
        loop {
            if let Some(message) = backend::Message::parse(&mut self.read_buf)
                .map_err(|e| OutboxError::protocol(format!("malformed backend message: {e}")))?
            {
                return Ok(message);
            }
            let read = self.stream.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return Err(OutboxError::protocol("server closed the connection"));
            }
        }
    }

    async fn flush(&mut self) -> OutboxResult<()> {
        self.stream.write_all_buf(&mut self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Reading side of an active COPY BOTH stream.
pub struct FrameReader {
    half: OwnedReadHalf,
    buf: BytesMut,
}

impl FrameReader {
    /// Next replication frame.
    ///
    /// Cancel safe: a partially buffered frame survives a dropped call.
    /// Returns `None` when the server ends the copy stream.
    pub async fn next_frame(&mut self) -> OutboxResult<Option<ReplicationFrame>> {
        loop {
            if let Some(message) = backend::Message::parse(&mut self.buf)
                .map_err(|e| OutboxError::protocol(format!("malformed backend message: {e}")))?
            {
                match message {
                    Message::CopyData(body) => {
                        let data = body.into_bytes();
                        return Ok(Some(ReplicationFrame::parse(&data)?));
                    }
                    Message::CopyDone => return Ok(None),
                    Message::NoticeResponse(_) | Message::ParameterStatus(_) => {}
                    Message::ErrorResponse(body) => return Err(server_error(body)),
                    other => {
                        return Err(OutboxError::protocol(format!(
                            "unexpected message in copy stream: {}",
                            message_name(&other)
                        )));
                    }
                }
                continue;
            }
            let read = self.half.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(OutboxError::protocol("replication stream closed"));
            }
        }
    }
}

/// Writing side of an active COPY BOTH stream.
pub struct FrameWriter {
    half: OwnedWriteHalf,
    buf: BytesMut,
}

impl FrameWriter {
    /// Send a standby status update to the server.
    pub async fn send_status_update(&mut self, update: StandbyStatusUpdate) -> OutboxResult<()> {
        let payload = update.to_bytes()?;
        frontend::CopyData::new(&payload[..])
            .map_err(|e| OutboxError::protocol(format!("status update: {e}")))?
            .write(&mut self.buf);
        self.flush().await?;
        debug!(acked = %update.applied, reply_requested = update.reply_requested, "status update sent");
        Ok(())
    }

    /// Best-effort polite goodbye before the socket drops.
    pub async fn send_shutdown(&mut self) {
        frontend::copy_done(&mut self.buf);
        frontend::terminate(&mut self.buf);
        if let Err(err) = self.flush().await {
            warn!("failed to send replication goodbye: {err}");
        }
    }

    async fn flush(&mut self) -> OutboxResult<()> {
        self.half.write_all_buf(&mut self.buf).await?;
        self.half.flush().await?;
        Ok(())
    }
}

fn required_password(options: &ConnectionOptions) -> OutboxResult<&str> {
    options.password.as_deref().ok_or_else(|| {
        OutboxError::config("server requested a password but none was configured")
    })
}

fn decode_data_row(body: &backend::DataRowBody) -> OutboxResult<Vec<Option<String>>> {
    let buffer = body.buffer();
    let mut values = Vec::new();
    let mut ranges = body.ranges();
    while let Some(range) = ranges
        .next()
        .map_err(|e| OutboxError::protocol(format!("malformed data row: {e}")))?
    {
        values.push(range.map(|r| String::from_utf8_lossy(&buffer[r]).into_owned()));
    }
    Ok(values)
}

fn error_fields(body: backend::ErrorResponseBody) -> OutboxResult<(String, String)> {
    let mut code = String::new();
    let mut message = String::new();
    let mut fields = body.fields();
    while let Some(field) = fields
        .next()
        .map_err(|e| OutboxError::protocol(format!("malformed error response: {e}")))?
    {
        match field.type_() {
            b'C' => code = field.value().to_string(),
            b'M' => message = field.value().to_string(),
            _ => {}
        }
    }
    Ok((code, message))
}

fn server_error(body: backend::ErrorResponseBody) -> OutboxError {
    match error_fields(body) {
        Ok((code, message)) => {
            OutboxError::storage(format!("server error ({code}): {message}"))
        }
        Err(err) => err,
    }
}

fn message_name(message: &Message) -> &'static str {
    match message {
        Message::AuthenticationOk => "AuthenticationOk",
        Message::AuthenticationCleartextPassword => "AuthenticationCleartextPassword",
        Message::AuthenticationMd5Password(_) => "AuthenticationMd5Password",
        Message::AuthenticationSasl(_) => "AuthenticationSasl",
        Message::AuthenticationSaslContinue(_) => "AuthenticationSaslContinue",
        Message::AuthenticationSaslFinal(_) => "AuthenticationSaslFinal",
        Message::BackendKeyData(_) => "BackendKeyData",
        Message::CommandComplete(_) => "CommandComplete",
        Message::CopyBothResponse(_) => "CopyBothResponse",
        Message::CopyData(_) => "CopyData",
        Message::CopyDone => "CopyDone",
        Message::DataRow(_) => "DataRow",
        Message::ErrorResponse(_) => "ErrorResponse",
        Message::NoticeResponse(_) => "NoticeResponse",
        Message::ParameterStatus(_) => "ParameterStatus",
        Message::ReadyForQuery(_) => "ReadyForQuery",
        Message::RowDescription(_) => "RowDescription",
        _ => "unknown",
    }
}
