//! Sync protocol message schemas and CBOR encoding.
//!
//! Every frame is an envelope map `{v, type, body}` where `type` is the
//! upper-case message name. Client-bound and server-bound message sets are
//! distinct; IDENT and MARK exist in both directions with different bodies.

use std::convert::Infallible;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::core::{
    CompensatingWriteInfo, DownloadBatchState, DownloadCursor, ErrorBody, QueryVersion,
    RemoteChangeset, RequestIdent, SaltedFileIdent, SaltedVersion, ServerRequestedAction,
    SessionIdent, SyncProgress, TimestampMs, UploadChangeset, UploadCursor, Version,
};

/// Current protocol version spoken by this client.
pub const PROTOCOL_VERSION_CURRENT: u32 = 8;
/// Oldest protocol version this client still understands.
pub const PROTOCOL_VERSION_OLDEST_SUPPORTED: u32 = 6;

/// Sub-protocol prefix offered for partition-based sessions.
pub const PARTITION_PROTOCOL_PREFIX: &str = "lagoon-part-";
/// Sub-protocol prefix offered for flexible-sync sessions.
pub const FLEXIBLE_PROTOCOL_PREFIX: &str = "lagoon-flex-";

/// Decode-side resource limits.
#[derive(Clone, Debug)]
pub struct ProtoLimits {
    pub max_frame_bytes: usize,
    pub max_changesets_per_message: usize,
    pub max_changeset_bytes: usize,
    pub max_string_bytes: usize,
    pub max_map_entries: usize,
}

impl Default for ProtoLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            max_changesets_per_message: 4096,
            max_changeset_bytes: 8 * 1024 * 1024,
            max_string_bytes: 1024 * 1024,
            max_map_entries: 64,
        }
    }
}

/// Messages sent by the client.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    Bind(Bind),
    Ident(Ident),
    Upload(Upload),
    Mark(Mark),
    Unbind(Unbind),
    Query(Query),
    JsonError(JsonError),
    Ping(Ping),
    TestCommand(TestCommand),
}

/// Messages received from the server.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    Ident(IdentAssignment),
    Download(Download),
    Mark(MarkResponse),
    Unbound(Unbound),
    Error(ErrorMessage),
    QueryError(QueryErrorMessage),
    Pong(Pong),
    TestResponse(TestResponse),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bind {
    pub session_ident: SessionIdent,
    /// Partition-mode server path (the partition value); empty in flexible
    /// mode.
    pub server_path: String,
    /// Flexible-mode bind arguments as a JSON object, or empty.
    pub json_data: String,
    /// Ignored by current servers; identity travels on the HTTP layer.
    pub access_token: String,
    pub need_file_ident: bool,
    pub is_subserver: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ident {
    pub session_ident: SessionIdent,
    pub file_ident: SaltedFileIdent,
    pub scan_server_version: Version,
    pub scan_client_version: Version,
    pub latest_server_version: SaltedVersion,
    /// Active query version; 0 in partition mode.
    pub query_version: QueryVersion,
    pub query_body: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Upload {
    pub session_ident: SessionIdent,
    pub progress: UploadCursor,
    pub locked_server_version: Version,
    pub changesets: Vec<UploadChangeset>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mark {
    pub session_ident: SessionIdent,
    pub request_ident: RequestIdent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unbind {
    pub session_ident: SessionIdent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub session_ident: SessionIdent,
    pub query_version: QueryVersion,
    pub query_body: String,
}

/// Client-detected error reported upward (integration failures).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JsonError {
    pub session_ident: SessionIdent,
    pub error_code: u32,
    pub json: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ping {
    pub timestamp: TimestampMs,
    /// Round-trip time of the previous PING/PONG exchange, ms.
    pub rtt: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestCommand {
    pub session_ident: SessionIdent,
    pub request_ident: RequestIdent,
    pub body: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentAssignment {
    pub session_ident: SessionIdent,
    pub file_ident: SaltedFileIdent,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Download {
    pub session_ident: SessionIdent,
    pub progress: SyncProgress,
    pub downloadable_bytes: u64,
    pub query_version: QueryVersion,
    pub batch_state: DownloadBatchState,
    pub changesets: Vec<RemoteChangeset>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MarkResponse {
    pub session_ident: SessionIdent,
    pub request_ident: RequestIdent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unbound {
    pub session_ident: SessionIdent,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ErrorMessage {
    /// 0 addresses the connection itself.
    pub session_ident: SessionIdent,
    pub body: ErrorBody,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryErrorMessage {
    pub session_ident: SessionIdent,
    pub error_code: u32,
    pub message: String,
    pub query_version: QueryVersion,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pong {
    pub timestamp: TimestampMs,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestResponse {
    pub session_ident: SessionIdent,
    pub request_ident: RequestIdent,
    pub body: String,
}

impl ClientMessage {
    pub fn type_str(&self) -> &'static str {
        match self {
            ClientMessage::Bind(_) => "BIND",
            ClientMessage::Ident(_) => "IDENT",
            ClientMessage::Upload(_) => "UPLOAD",
            ClientMessage::Mark(_) => "MARK",
            ClientMessage::Unbind(_) => "UNBIND",
            ClientMessage::Query(_) => "QUERY",
            ClientMessage::JsonError(_) => "ERROR",
            ClientMessage::Ping(_) => "PING",
            ClientMessage::TestCommand(_) => "TEST_COMMAND",
        }
    }

    /// Session the message belongs to; None for connection-scoped PING.
    pub fn session_ident(&self) -> Option<SessionIdent> {
        match self {
            ClientMessage::Bind(m) => Some(m.session_ident),
            ClientMessage::Ident(m) => Some(m.session_ident),
            ClientMessage::Upload(m) => Some(m.session_ident),
            ClientMessage::Mark(m) => Some(m.session_ident),
            ClientMessage::Unbind(m) => Some(m.session_ident),
            ClientMessage::Query(m) => Some(m.session_ident),
            ClientMessage::JsonError(m) => Some(m.session_ident),
            ClientMessage::Ping(_) => None,
            ClientMessage::TestCommand(m) => Some(m.session_ident),
        }
    }
}

impl ServerMessage {
    pub fn type_str(&self) -> &'static str {
        match self {
            ServerMessage::Ident(_) => "IDENT",
            ServerMessage::Download(_) => "DOWNLOAD",
            ServerMessage::Mark(_) => "MARK",
            ServerMessage::Unbound(_) => "UNBOUND",
            ServerMessage::Error(_) => "ERROR",
            ServerMessage::QueryError(_) => "QUERY_ERROR",
            ServerMessage::Pong(_) => "PONG",
            ServerMessage::TestResponse(_) => "TEST_RESPONSE",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

type EncodeResult = Result<(), ProtoEncodeError>;
type Enc<'a> = Encoder<&'a mut Vec<u8>>;

pub fn encode_client_message(
    version: u32,
    message: &ClientMessage,
) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3)?;
    enc.str("v")?;
    enc.u32(version)?;
    enc.str("type")?;
    enc.str(message.type_str())?;
    enc.str("body")?;
    match message {
        ClientMessage::Bind(m) => encode_bind(&mut enc, m)?,
        ClientMessage::Ident(m) => encode_ident(&mut enc, m)?,
        ClientMessage::Upload(m) => encode_upload(&mut enc, m)?,
        ClientMessage::Mark(m) => encode_mark(&mut enc, m.session_ident, m.request_ident)?,
        ClientMessage::Unbind(m) => encode_session_only(&mut enc, m.session_ident)?,
        ClientMessage::Query(m) => encode_query(&mut enc, m)?,
        ClientMessage::JsonError(m) => encode_json_error(&mut enc, m)?,
        ClientMessage::Ping(m) => encode_ping(&mut enc, m)?,
        ClientMessage::TestCommand(m) => encode_test_command(&mut enc, m)?,
    }
    Ok(buf)
}

pub fn encode_server_message(
    version: u32,
    message: &ServerMessage,
) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3)?;
    enc.str("v")?;
    enc.u32(version)?;
    enc.str("type")?;
    enc.str(message.type_str())?;
    enc.str("body")?;
    match message {
        ServerMessage::Ident(m) => encode_ident_assignment(&mut enc, m)?,
        ServerMessage::Download(m) => encode_download(&mut enc, m)?,
        ServerMessage::Mark(m) => encode_mark(&mut enc, m.session_ident, m.request_ident)?,
        ServerMessage::Unbound(m) => encode_session_only(&mut enc, m.session_ident)?,
        ServerMessage::Error(m) => encode_error_message(&mut enc, m)?,
        ServerMessage::QueryError(m) => encode_query_error(&mut enc, m)?,
        ServerMessage::Pong(m) => {
            enc.map(1)?;
            enc.str("timestamp")?;
            enc.u64(m.timestamp)?;
        }
        ServerMessage::TestResponse(m) => {
            enc.map(3)?;
            enc.str("session_ident")?;
            enc.u64(m.session_ident)?;
            enc.str("request_ident")?;
            enc.u64(m.request_ident)?;
            enc.str("body")?;
            enc.str(&m.body)?;
        }
    }
    Ok(buf)
}

/// Decode a frame received from the server.
pub fn decode_server_message(
    bytes: &[u8],
    limits: &ProtoLimits,
) -> Result<ServerMessage, ProtoDecodeError> {
    let (type_str, body) = decode_envelope(bytes, limits)?;
    let mut dec = Decoder::new(body);
    let message = match type_str {
        "IDENT" => ServerMessage::Ident(decode_ident_assignment(&mut dec, limits)?),
        "DOWNLOAD" => ServerMessage::Download(decode_download(&mut dec, limits)?),
        "MARK" => {
            let (session_ident, request_ident) = decode_mark(&mut dec, limits)?;
            ServerMessage::Mark(MarkResponse {
                session_ident,
                request_ident,
            })
        }
        "UNBOUND" => ServerMessage::Unbound(Unbound {
            session_ident: decode_session_only(&mut dec, limits)?,
        }),
        "ERROR" => ServerMessage::Error(decode_error_message(&mut dec, limits)?),
        "QUERY_ERROR" => ServerMessage::QueryError(decode_query_error(&mut dec, limits)?),
        "PONG" => ServerMessage::Pong(decode_pong(&mut dec, limits)?),
        "TEST_RESPONSE" => ServerMessage::TestResponse(decode_test_response(&mut dec, limits)?),
        other => return Err(ProtoDecodeError::UnknownMessageType(other.to_string())),
    };
    if dec.position() < body.len() {
        return Err(ProtoDecodeError::TrailingBytes);
    }
    Ok(message)
}

/// Decode a frame received by a server (test harnesses act as servers).
pub fn decode_client_message(
    bytes: &[u8],
    limits: &ProtoLimits,
) -> Result<ClientMessage, ProtoDecodeError> {
    let (type_str, body) = decode_envelope(bytes, limits)?;
    let mut dec = Decoder::new(body);
    let message = match type_str {
        "BIND" => ClientMessage::Bind(decode_bind(&mut dec, limits)?),
        "IDENT" => ClientMessage::Ident(decode_ident(&mut dec, limits)?),
        "UPLOAD" => ClientMessage::Upload(decode_upload(&mut dec, limits)?),
        "MARK" => {
            let (session_ident, request_ident) = decode_mark(&mut dec, limits)?;
            ClientMessage::Mark(Mark {
                session_ident,
                request_ident,
            })
        }
        "UNBIND" => ClientMessage::Unbind(Unbind {
            session_ident: decode_session_only(&mut dec, limits)?,
        }),
        "QUERY" => ClientMessage::Query(decode_query(&mut dec, limits)?),
        "ERROR" => ClientMessage::JsonError(decode_json_error(&mut dec, limits)?),
        "PING" => ClientMessage::Ping(decode_ping(&mut dec, limits)?),
        "TEST_COMMAND" => ClientMessage::TestCommand(decode_test_command(&mut dec, limits)?),
        other => return Err(ProtoDecodeError::UnknownMessageType(other.to_string())),
    };
    if dec.position() < body.len() {
        return Err(ProtoDecodeError::TrailingBytes);
    }
    Ok(message)
}

fn decode_envelope<'a>(
    bytes: &'a [u8],
    limits: &ProtoLimits,
) -> Result<(&'a str, &'a [u8]), ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut version = None;
    let mut type_str = None;
    let mut body_span = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "v" => version = Some(dec.u32()?),
            "type" => type_str = Some(decode_text(&mut dec, limits)?),
            "body" => {
                let start = dec.position();
                dec.skip()?;
                body_span = Some((start, dec.position()));
            }
            _ => skip_value(&mut dec)?,
        }
    }

    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }

    let version = version.ok_or(ProtoDecodeError::MissingField("v"))?;
    if version < PROTOCOL_VERSION_OLDEST_SUPPORTED || version > PROTOCOL_VERSION_CURRENT {
        return Err(ProtoDecodeError::InvalidField {
            field: "v",
            reason: format!("unsupported protocol version {version}"),
        });
    }
    let type_str = type_str.ok_or(ProtoDecodeError::MissingField("type"))?;
    let (start, end) = body_span.ok_or(ProtoDecodeError::MissingField("body"))?;
    Ok((type_str, &bytes[start..end]))
}

fn encode_bind(enc: &mut Enc<'_>, m: &Bind) -> EncodeResult {
    enc.map(6)?;
    enc.str("session_ident")?;
    enc.u64(m.session_ident)?;
    enc.str("server_path")?;
    enc.str(&m.server_path)?;
    enc.str("json_data")?;
    enc.str(&m.json_data)?;
    enc.str("access_token")?;
    enc.str(&m.access_token)?;
    enc.str("need_file_ident")?;
    enc.bool(m.need_file_ident)?;
    enc.str("is_subserver")?;
    enc.bool(m.is_subserver)?;
    Ok(())
}

fn decode_bind(dec: &mut Decoder<'_>, limits: &ProtoLimits) -> Result<Bind, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut session_ident = None;
    let mut server_path = None;
    let mut json_data = None;
    let mut access_token = None;
    let mut need_file_ident = None;
    let mut is_subserver = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "session_ident" => session_ident = Some(dec.u64()?),
            "server_path" => server_path = Some(decode_text(dec, limits)?.to_string()),
            "json_data" => json_data = Some(decode_text(dec, limits)?.to_string()),
            "access_token" => access_token = Some(decode_text(dec, limits)?.to_string()),
            "need_file_ident" => need_file_ident = Some(dec.bool()?),
            "is_subserver" => is_subserver = Some(dec.bool()?),
            _ => skip_value(dec)?,
        }
    }
    Ok(Bind {
        session_ident: session_ident.ok_or(ProtoDecodeError::MissingField("session_ident"))?,
        server_path: server_path.ok_or(ProtoDecodeError::MissingField("server_path"))?,
        json_data: json_data.unwrap_or_default(),
        access_token: access_token.unwrap_or_default(),
        need_file_ident: need_file_ident.ok_or(ProtoDecodeError::MissingField("need_file_ident"))?,
        is_subserver: is_subserver.unwrap_or(false),
    })
}

fn encode_ident(enc: &mut Enc<'_>, m: &Ident) -> EncodeResult {
    enc.map(8)?;
    enc.str("session_ident")?;
    enc.u64(m.session_ident)?;
    enc.str("file_ident")?;
    enc.i64(m.file_ident.ident)?;
    enc.str("file_ident_salt")?;
    enc.i64(m.file_ident.salt)?;
    enc.str("scan_server_version")?;
    enc.u64(m.scan_server_version)?;
    enc.str("scan_client_version")?;
    enc.u64(m.scan_client_version)?;
    enc.str("latest_server_version")?;
    enc.u64(m.latest_server_version.version)?;
    enc.str("latest_server_version_salt")?;
    enc.i64(m.latest_server_version.salt)?;
    enc.str("query")?;
    enc.map(2)?;
    enc.str("version")?;
    enc.i64(m.query_version)?;
    enc.str("body")?;
    enc.str(&m.query_body)?;
    Ok(())
}

fn decode_ident(dec: &mut Decoder<'_>, limits: &ProtoLimits) -> Result<Ident, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut m = Ident {
        session_ident: 0,
        file_ident: SaltedFileIdent::default(),
        scan_server_version: 0,
        scan_client_version: 0,
        latest_server_version: SaltedVersion::default(),
        query_version: 0,
        query_body: String::new(),
    };
    let mut have_session = false;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "session_ident" => {
                m.session_ident = dec.u64()?;
                have_session = true;
            }
            "file_ident" => m.file_ident.ident = dec.i64()?,
            "file_ident_salt" => m.file_ident.salt = dec.i64()?,
            "scan_server_version" => m.scan_server_version = dec.u64()?,
            "scan_client_version" => m.scan_client_version = dec.u64()?,
            "latest_server_version" => m.latest_server_version.version = dec.u64()?,
            "latest_server_version_salt" => m.latest_server_version.salt = dec.i64()?,
            "query" => {
                let inner = decode_map_len(dec, limits)?;
                for _ in 0..inner {
                    match decode_text(dec, limits)? {
                        "version" => m.query_version = dec.i64()?,
                        "body" => m.query_body = decode_text(dec, limits)?.to_string(),
                        _ => skip_value(dec)?,
                    }
                }
            }
            _ => skip_value(dec)?,
        }
    }
    if !have_session {
        return Err(ProtoDecodeError::MissingField("session_ident"));
    }
    Ok(m)
}

fn encode_upload(enc: &mut Enc<'_>, m: &Upload) -> EncodeResult {
    enc.map(5)?;
    enc.str("session_ident")?;
    enc.u64(m.session_ident)?;
    enc.str("progress_client_version")?;
    enc.u64(m.progress.client_version)?;
    enc.str("progress_server_version")?;
    enc.u64(m.progress.last_integrated_server_version)?;
    enc.str("locked_server_version")?;
    enc.u64(m.locked_server_version)?;
    enc.str("changesets")?;
    enc.array(m.changesets.len() as u64)?;
    for changeset in &m.changesets {
        enc.map(5)?;
        enc.str("client_version")?;
        enc.u64(changeset.client_version)?;
        enc.str("server_version")?;
        enc.u64(changeset.server_version)?;
        enc.str("origin_timestamp")?;
        enc.u64(changeset.origin_timestamp)?;
        enc.str("origin_file_ident")?;
        enc.i64(changeset.origin_file_ident)?;
        enc.str("data")?;
        enc.bytes(&changeset.data)?;
    }
    Ok(())
}

fn decode_upload(dec: &mut Decoder<'_>, limits: &ProtoLimits) -> Result<Upload, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut m = Upload {
        session_ident: 0,
        progress: UploadCursor::default(),
        locked_server_version: 0,
        changesets: Vec::new(),
    };
    let mut have_session = false;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "session_ident" => {
                m.session_ident = dec.u64()?;
                have_session = true;
            }
            "progress_client_version" => m.progress.client_version = dec.u64()?,
            "progress_server_version" => m.progress.last_integrated_server_version = dec.u64()?,
            "locked_server_version" => m.locked_server_version = dec.u64()?,
            "changesets" => {
                let count = decode_array_len(dec, limits)?;
                if count > limits.max_changesets_per_message {
                    return Err(ProtoDecodeError::DecodeLimit("max_changesets_per_message"));
                }
                for _ in 0..count {
                    let inner = decode_map_len(dec, limits)?;
                    let mut changeset = UploadChangeset {
                        client_version: 0,
                        server_version: 0,
                        origin_timestamp: 0,
                        origin_file_ident: 0,
                        data: Bytes::new(),
                    };
                    for _ in 0..inner {
                        match decode_text(dec, limits)? {
                            "client_version" => changeset.client_version = dec.u64()?,
                            "server_version" => changeset.server_version = dec.u64()?,
                            "origin_timestamp" => changeset.origin_timestamp = dec.u64()?,
                            "origin_file_ident" => changeset.origin_file_ident = dec.i64()?,
                            "data" => {
                                changeset.data =
                                    Bytes::copy_from_slice(decode_bytes(dec, limits)?)
                            }
                            _ => skip_value(dec)?,
                        }
                    }
                    m.changesets.push(changeset);
                }
            }
            _ => skip_value(dec)?,
        }
    }
    if !have_session {
        return Err(ProtoDecodeError::MissingField("session_ident"));
    }
    Ok(m)
}

fn encode_mark(
    enc: &mut Enc<'_>,
    session_ident: SessionIdent,
    request_ident: RequestIdent,
) -> EncodeResult {
    enc.map(2)?;
    enc.str("session_ident")?;
    enc.u64(session_ident)?;
    enc.str("request_ident")?;
    enc.u64(request_ident)?;
    Ok(())
}

fn decode_mark(
    dec: &mut Decoder<'_>,
    limits: &ProtoLimits,
) -> Result<(SessionIdent, RequestIdent), ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut session_ident = None;
    let mut request_ident = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "session_ident" => session_ident = Some(dec.u64()?),
            "request_ident" => request_ident = Some(dec.u64()?),
            _ => skip_value(dec)?,
        }
    }
    Ok((
        session_ident.ok_or(ProtoDecodeError::MissingField("session_ident"))?,
        request_ident.ok_or(ProtoDecodeError::MissingField("request_ident"))?,
    ))
}

fn encode_session_only(enc: &mut Enc<'_>, session_ident: SessionIdent) -> EncodeResult {
    enc.map(1)?;
    enc.str("session_ident")?;
    enc.u64(session_ident)?;
    Ok(())
}

fn decode_session_only(
    dec: &mut Decoder<'_>,
    limits: &ProtoLimits,
) -> Result<SessionIdent, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut session_ident = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "session_ident" => session_ident = Some(dec.u64()?),
            _ => skip_value(dec)?,
        }
    }
    session_ident.ok_or(ProtoDecodeError::MissingField("session_ident"))
}

fn encode_query(enc: &mut Enc<'_>, m: &Query) -> EncodeResult {
    enc.map(3)?;
    enc.str("session_ident")?;
    enc.u64(m.session_ident)?;
    enc.str("query_version")?;
    enc.i64(m.query_version)?;
    enc.str("query_body")?;
    enc.str(&m.query_body)?;
    Ok(())
}

fn decode_query(dec: &mut Decoder<'_>, limits: &ProtoLimits) -> Result<Query, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut session_ident = None;
    let mut query_version = None;
    let mut query_body = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "session_ident" => session_ident = Some(dec.u64()?),
            "query_version" => query_version = Some(dec.i64()?),
            "query_body" => query_body = Some(decode_text(dec, limits)?.to_string()),
            _ => skip_value(dec)?,
        }
    }
    Ok(Query {
        session_ident: session_ident.ok_or(ProtoDecodeError::MissingField("session_ident"))?,
        query_version: query_version.ok_or(ProtoDecodeError::MissingField("query_version"))?,
        query_body: query_body.ok_or(ProtoDecodeError::MissingField("query_body"))?,
    })
}

fn encode_json_error(enc: &mut Enc<'_>, m: &JsonError) -> EncodeResult {
    enc.map(3)?;
    enc.str("session_ident")?;
    enc.u64(m.session_ident)?;
    enc.str("error_code")?;
    enc.u32(m.error_code)?;
    enc.str("json")?;
    enc.str(&m.json)?;
    Ok(())
}

fn decode_json_error(
    dec: &mut Decoder<'_>,
    limits: &ProtoLimits,
) -> Result<JsonError, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut session_ident = None;
    let mut error_code = None;
    let mut json = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "session_ident" => session_ident = Some(dec.u64()?),
            "error_code" => error_code = Some(dec.u32()?),
            "json" => json = Some(decode_text(dec, limits)?.to_string()),
            _ => skip_value(dec)?,
        }
    }
    Ok(JsonError {
        session_ident: session_ident.ok_or(ProtoDecodeError::MissingField("session_ident"))?,
        error_code: error_code.ok_or(ProtoDecodeError::MissingField("error_code"))?,
        json: json.unwrap_or_default(),
    })
}

fn encode_ping(enc: &mut Enc<'_>, m: &Ping) -> EncodeResult {
    enc.map(2)?;
    enc.str("timestamp")?;
    enc.u64(m.timestamp)?;
    enc.str("rtt")?;
    enc.u64(m.rtt)?;
    Ok(())
}

fn decode_ping(dec: &mut Decoder<'_>, limits: &ProtoLimits) -> Result<Ping, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut timestamp = None;
    let mut rtt = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "timestamp" => timestamp = Some(dec.u64()?),
            "rtt" => rtt = Some(dec.u64()?),
            _ => skip_value(dec)?,
        }
    }
    Ok(Ping {
        timestamp: timestamp.ok_or(ProtoDecodeError::MissingField("timestamp"))?,
        rtt: rtt.unwrap_or(0),
    })
}

fn encode_test_command(enc: &mut Enc<'_>, m: &TestCommand) -> EncodeResult {
    enc.map(3)?;
    enc.str("session_ident")?;
    enc.u64(m.session_ident)?;
    enc.str("request_ident")?;
    enc.u64(m.request_ident)?;
    enc.str("body")?;
    enc.str(&m.body)?;
    Ok(())
}

fn decode_test_command(
    dec: &mut Decoder<'_>,
    limits: &ProtoLimits,
) -> Result<TestCommand, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut session_ident = None;
    let mut request_ident = None;
    let mut body = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "session_ident" => session_ident = Some(dec.u64()?),
            "request_ident" => request_ident = Some(dec.u64()?),
            "body" => body = Some(decode_text(dec, limits)?.to_string()),
            _ => skip_value(dec)?,
        }
    }
    Ok(TestCommand {
        session_ident: session_ident.ok_or(ProtoDecodeError::MissingField("session_ident"))?,
        request_ident: request_ident.ok_or(ProtoDecodeError::MissingField("request_ident"))?,
        body: body.unwrap_or_default(),
    })
}

fn encode_ident_assignment(enc: &mut Enc<'_>, m: &IdentAssignment) -> EncodeResult {
    enc.map(3)?;
    enc.str("session_ident")?;
    enc.u64(m.session_ident)?;
    enc.str("file_ident")?;
    enc.i64(m.file_ident.ident)?;
    enc.str("file_ident_salt")?;
    enc.i64(m.file_ident.salt)?;
    Ok(())
}

fn decode_ident_assignment(
    dec: &mut Decoder<'_>,
    limits: &ProtoLimits,
) -> Result<IdentAssignment, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut session_ident = None;
    let mut ident = None;
    let mut salt = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "session_ident" => session_ident = Some(dec.u64()?),
            "file_ident" => ident = Some(dec.i64()?),
            "file_ident_salt" => salt = Some(dec.i64()?),
            _ => skip_value(dec)?,
        }
    }
    Ok(IdentAssignment {
        session_ident: session_ident.ok_or(ProtoDecodeError::MissingField("session_ident"))?,
        file_ident: SaltedFileIdent::new(
            ident.ok_or(ProtoDecodeError::MissingField("file_ident"))?,
            salt.ok_or(ProtoDecodeError::MissingField("file_ident_salt"))?,
        ),
    })
}

fn encode_download(enc: &mut Enc<'_>, m: &Download) -> EncodeResult {
    enc.map(10)?;
    enc.str("session_ident")?;
    enc.u64(m.session_ident)?;
    enc.str("download_server_version")?;
    enc.u64(m.progress.download.server_version)?;
    enc.str("download_client_version")?;
    enc.u64(m.progress.download.last_integrated_client_version)?;
    enc.str("upload_client_version")?;
    enc.u64(m.progress.upload.client_version)?;
    enc.str("upload_server_version")?;
    enc.u64(m.progress.upload.last_integrated_server_version)?;
    enc.str("latest_server_version")?;
    enc.u64(m.progress.latest_server_version.version)?;
    enc.str("latest_server_version_salt")?;
    enc.i64(m.progress.latest_server_version.salt)?;
    enc.str("downloadable_bytes")?;
    enc.u64(m.downloadable_bytes)?;
    enc.str("batch")?;
    enc.map(2)?;
    enc.str("state")?;
    enc.u8(match m.batch_state {
        DownloadBatchState::MoreToCome => 0,
        DownloadBatchState::LastInBatch => 1,
        DownloadBatchState::SteadyState => 2,
    })?;
    enc.str("query_version")?;
    enc.i64(m.query_version)?;
    enc.str("changesets")?;
    enc.array(m.changesets.len() as u64)?;
    for changeset in &m.changesets {
        enc.map(6)?;
        enc.str("server_version")?;
        enc.u64(changeset.remote_version)?;
        enc.str("client_version")?;
        enc.u64(changeset.last_integrated_local_version)?;
        enc.str("origin_file_ident")?;
        enc.i64(changeset.origin_file_ident)?;
        enc.str("origin_timestamp")?;
        enc.u64(changeset.origin_timestamp)?;
        enc.str("original_size")?;
        enc.u64(changeset.original_size)?;
        enc.str("data")?;
        enc.bytes(&changeset.data)?;
    }
    Ok(())
}

fn decode_download(
    dec: &mut Decoder<'_>,
    limits: &ProtoLimits,
) -> Result<Download, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut m = Download {
        session_ident: 0,
        progress: SyncProgress::default(),
        downloadable_bytes: 0,
        query_version: 0,
        batch_state: DownloadBatchState::SteadyState,
        changesets: Vec::new(),
    };
    let mut have_session = false;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "session_ident" => {
                m.session_ident = dec.u64()?;
                have_session = true;
            }
            "download_server_version" => m.progress.download.server_version = dec.u64()?,
            "download_client_version" => {
                m.progress.download.last_integrated_client_version = dec.u64()?
            }
            "upload_client_version" => m.progress.upload.client_version = dec.u64()?,
            "upload_server_version" => {
                m.progress.upload.last_integrated_server_version = dec.u64()?
            }
            "latest_server_version" => m.progress.latest_server_version.version = dec.u64()?,
            "latest_server_version_salt" => m.progress.latest_server_version.salt = dec.i64()?,
            "downloadable_bytes" => m.downloadable_bytes = dec.u64()?,
            "batch" => {
                let inner = decode_map_len(dec, limits)?;
                for _ in 0..inner {
                    match decode_text(dec, limits)? {
                        "state" => {
                            m.batch_state = match dec.u8()? {
                                0 => DownloadBatchState::MoreToCome,
                                1 => DownloadBatchState::LastInBatch,
                                2 => DownloadBatchState::SteadyState,
                                other => {
                                    return Err(ProtoDecodeError::InvalidField {
                                        field: "state",
                                        reason: format!("unknown batch state {other}"),
                                    });
                                }
                            }
                        }
                        "query_version" => m.query_version = dec.i64()?,
                        _ => skip_value(dec)?,
                    }
                }
            }
            "changesets" => {
                let count = decode_array_len(dec, limits)?;
                if count > limits.max_changesets_per_message {
                    return Err(ProtoDecodeError::DecodeLimit("max_changesets_per_message"));
                }
                for _ in 0..count {
                    let inner = decode_map_len(dec, limits)?;
                    let mut changeset = RemoteChangeset {
                        remote_version: 0,
                        last_integrated_local_version: 0,
                        origin_file_ident: 0,
                        origin_timestamp: 0,
                        original_size: 0,
                        data: Bytes::new(),
                    };
                    for _ in 0..inner {
                        match decode_text(dec, limits)? {
                            "server_version" => changeset.remote_version = dec.u64()?,
                            "client_version" => {
                                changeset.last_integrated_local_version = dec.u64()?
                            }
                            "origin_file_ident" => changeset.origin_file_ident = dec.i64()?,
                            "origin_timestamp" => changeset.origin_timestamp = dec.u64()?,
                            "original_size" => changeset.original_size = dec.u64()?,
                            "data" => {
                                let bytes = decode_bytes(dec, limits)?;
                                if bytes.len() > limits.max_changeset_bytes {
                                    return Err(ProtoDecodeError::DecodeLimit(
                                        "max_changeset_bytes",
                                    ));
                                }
                                changeset.data = Bytes::copy_from_slice(bytes);
                            }
                            _ => skip_value(dec)?,
                        }
                    }
                    m.changesets.push(changeset);
                }
            }
            _ => skip_value(dec)?,
        }
    }
    if !have_session {
        return Err(ProtoDecodeError::MissingField("session_ident"));
    }
    Ok(m)
}

fn encode_error_message(enc: &mut Enc<'_>, m: &ErrorMessage) -> EncodeResult {
    let body = &m.body;
    let mut len = 5;
    if body.log_url.is_some() {
        len += 1;
    }
    if body.resumption_delay_interval.is_some() {
        len += 1;
    }
    if body.compensating_write_server_version.is_some() {
        len += 2;
    }
    if !body.compensating_writes.is_empty() {
        len += 1;
    }
    if body.migration_query_string.is_some() {
        len += 1;
    }
    enc.map(len)?;
    enc.str("session_ident")?;
    enc.u64(m.session_ident)?;
    enc.str("error_code")?;
    enc.u32(body.raw_code)?;
    enc.str("message")?;
    enc.str(&body.message)?;
    enc.str("try_again")?;
    enc.bool(body.try_again)?;
    enc.str("action")?;
    enc.str(body.server_requests_action.as_wire())?;
    if let Some(url) = &body.log_url {
        enc.str("log_url")?;
        enc.str(url)?;
    }
    if let Some(delay) = body.resumption_delay_interval {
        enc.str("resumption_delay_interval")?;
        enc.u64(delay)?;
    }
    if let Some(version) = body.compensating_write_server_version {
        enc.str("compensating_write_server_version")?;
        enc.u64(version)?;
        enc.str("compensating_write_rejected_client_version")?;
        enc.u64(body.compensating_write_rejected_client_version)?;
    }
    if !body.compensating_writes.is_empty() {
        enc.str("compensating_writes")?;
        enc.array(body.compensating_writes.len() as u64)?;
        for write in &body.compensating_writes {
            enc.map(3)?;
            enc.str("table")?;
            enc.str(&write.table)?;
            enc.str("reason")?;
            enc.str(&write.reason)?;
            enc.str("primary_key")?;
            enc.str(&write.primary_key)?;
        }
    }
    if let Some(query) = &body.migration_query_string {
        enc.str("migration_query_string")?;
        enc.str(query)?;
    }
    Ok(())
}

fn decode_error_message(
    dec: &mut Decoder<'_>,
    limits: &ProtoLimits,
) -> Result<ErrorMessage, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut session_ident = 0;
    let mut body = ErrorBody::new(0, "", false);
    let mut have_code = false;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "session_ident" => session_ident = dec.u64()?,
            "error_code" => {
                body.raw_code = dec.u32()?;
                have_code = true;
            }
            "message" => body.message = decode_text(dec, limits)?.to_string(),
            "try_again" => body.try_again = dec.bool()?,
            "action" => {
                let raw = decode_text(dec, limits)?;
                body.server_requests_action = ServerRequestedAction::from_wire(raw)
                    .ok_or_else(|| ProtoDecodeError::InvalidField {
                        field: "action",
                        reason: format!("unknown action {raw}"),
                    })?;
            }
            "log_url" => body.log_url = Some(decode_text(dec, limits)?.to_string()),
            "resumption_delay_interval" => body.resumption_delay_interval = Some(dec.u64()?),
            "compensating_write_server_version" => {
                body.compensating_write_server_version = Some(dec.u64()?)
            }
            "compensating_write_rejected_client_version" => {
                body.compensating_write_rejected_client_version = dec.u64()?
            }
            "compensating_writes" => {
                let count = decode_array_len(dec, limits)?;
                for _ in 0..count {
                    let inner = decode_map_len(dec, limits)?;
                    let mut write = CompensatingWriteInfo::default();
                    for _ in 0..inner {
                        match decode_text(dec, limits)? {
                            "table" => write.table = decode_text(dec, limits)?.to_string(),
                            "reason" => write.reason = decode_text(dec, limits)?.to_string(),
                            "primary_key" => {
                                write.primary_key = decode_text(dec, limits)?.to_string()
                            }
                            _ => skip_value(dec)?,
                        }
                    }
                    body.compensating_writes.push(write);
                }
            }
            "migration_query_string" => {
                body.migration_query_string = Some(decode_text(dec, limits)?.to_string())
            }
            _ => skip_value(dec)?,
        }
    }
    if !have_code {
        return Err(ProtoDecodeError::MissingField("error_code"));
    }
    Ok(ErrorMessage {
        session_ident,
        body,
    })
}

fn encode_query_error(enc: &mut Enc<'_>, m: &QueryErrorMessage) -> EncodeResult {
    enc.map(4)?;
    enc.str("session_ident")?;
    enc.u64(m.session_ident)?;
    enc.str("error_code")?;
    enc.u32(m.error_code)?;
    enc.str("message")?;
    enc.str(&m.message)?;
    enc.str("query_version")?;
    enc.i64(m.query_version)?;
    Ok(())
}

fn decode_query_error(
    dec: &mut Decoder<'_>,
    limits: &ProtoLimits,
) -> Result<QueryErrorMessage, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut session_ident = None;
    let mut error_code = None;
    let mut message = None;
    let mut query_version = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "session_ident" => session_ident = Some(dec.u64()?),
            "error_code" => error_code = Some(dec.u32()?),
            "message" => message = Some(decode_text(dec, limits)?.to_string()),
            "query_version" => query_version = Some(dec.i64()?),
            _ => skip_value(dec)?,
        }
    }
    Ok(QueryErrorMessage {
        session_ident: session_ident.ok_or(ProtoDecodeError::MissingField("session_ident"))?,
        error_code: error_code.ok_or(ProtoDecodeError::MissingField("error_code"))?,
        message: message.unwrap_or_default(),
        query_version: query_version.ok_or(ProtoDecodeError::MissingField("query_version"))?,
    })
}

fn decode_pong(dec: &mut Decoder<'_>, limits: &ProtoLimits) -> Result<Pong, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut timestamp = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "timestamp" => timestamp = Some(dec.u64()?),
            _ => skip_value(dec)?,
        }
    }
    Ok(Pong {
        timestamp: timestamp.ok_or(ProtoDecodeError::MissingField("timestamp"))?,
    })
}

fn decode_test_response(
    dec: &mut Decoder<'_>,
    limits: &ProtoLimits,
) -> Result<TestResponse, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut session_ident = None;
    let mut request_ident = None;
    let mut body = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "session_ident" => session_ident = Some(dec.u64()?),
            "request_ident" => request_ident = Some(dec.u64()?),
            "body" => body = Some(decode_text(dec, limits)?.to_string()),
            _ => skip_value(dec)?,
        }
    }
    Ok(TestResponse {
        session_ident: session_ident.ok_or(ProtoDecodeError::MissingField("session_ident"))?,
        request_ident: request_ident.ok_or(ProtoDecodeError::MissingField("request_ident"))?,
        body: body.unwrap_or_default(),
    })
}

fn decode_map_len(dec: &mut Decoder<'_>, limits: &ProtoLimits) -> Result<usize, ProtoDecodeError> {
    let Some(len) = dec.map()? else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > limits.max_map_entries as u64 {
        return Err(ProtoDecodeError::DecodeLimit("max_map_entries"));
    }
    Ok(len as usize)
}

fn decode_array_len(
    dec: &mut Decoder<'_>,
    limits: &ProtoLimits,
) -> Result<usize, ProtoDecodeError> {
    let Some(len) = dec.array()? else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > limits.max_changesets_per_message as u64 {
        return Err(ProtoDecodeError::DecodeLimit("max_changesets_per_message"));
    }
    Ok(len as usize)
}

fn decode_text<'a>(
    dec: &mut Decoder<'a>,
    limits: &ProtoLimits,
) -> Result<&'a str, ProtoDecodeError> {
    if matches!(dec.datatype()?, Type::StringIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let s = dec.str()?;
    if s.len() > limits.max_string_bytes {
        return Err(ProtoDecodeError::DecodeLimit("max_string_bytes"));
    }
    Ok(s)
}

fn decode_bytes<'a>(
    dec: &mut Decoder<'a>,
    limits: &ProtoLimits,
) -> Result<&'a [u8], ProtoDecodeError> {
    if matches!(dec.datatype()?, Type::BytesIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let bytes = dec.bytes()?;
    if bytes.len() > limits.max_changeset_bytes {
        return Err(ProtoDecodeError::DecodeLimit("max_changeset_bytes"));
    }
    Ok(bytes)
}

fn skip_value(dec: &mut Decoder<'_>) -> Result<(), ProtoDecodeError> {
    if matches!(
        dec.datatype()?,
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef
    ) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    dec.skip()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ProtoLimits {
        ProtoLimits::default()
    }

    fn roundtrip_client(message: ClientMessage) -> ClientMessage {
        let bytes = encode_client_message(PROTOCOL_VERSION_CURRENT, &message).unwrap();
        decode_client_message(&bytes, &limits()).unwrap()
    }

    fn roundtrip_server(message: ServerMessage) -> ServerMessage {
        let bytes = encode_server_message(PROTOCOL_VERSION_CURRENT, &message).unwrap();
        decode_server_message(&bytes, &limits()).unwrap()
    }

    #[test]
    fn bind_roundtrip() {
        let message = ClientMessage::Bind(Bind {
            session_ident: 3,
            server_path: "/partition-a".into(),
            json_data: String::new(),
            access_token: String::new(),
            need_file_ident: true,
            is_subserver: false,
        });
        assert_eq!(roundtrip_client(message.clone()), message);
    }

    #[test]
    fn upload_roundtrip_preserves_changesets() {
        let message = ClientMessage::Upload(Upload {
            session_ident: 9,
            progress: UploadCursor {
                client_version: 12,
                last_integrated_server_version: 40,
            },
            locked_server_version: 41,
            changesets: vec![UploadChangeset {
                client_version: 13,
                server_version: 40,
                origin_timestamp: 1234,
                origin_file_ident: 0,
                data: Bytes::from_static(b"\x01\x02\x03"),
            }],
        });
        assert_eq!(roundtrip_client(message.clone()), message);
    }

    #[test]
    fn download_roundtrip_with_batch_state() {
        for state in [
            DownloadBatchState::MoreToCome,
            DownloadBatchState::LastInBatch,
            DownloadBatchState::SteadyState,
        ] {
            let message = ServerMessage::Download(Download {
                session_ident: 2,
                progress: SyncProgress {
                    download: DownloadCursor {
                        server_version: 100,
                        last_integrated_client_version: 7,
                    },
                    upload: UploadCursor {
                        client_version: 7,
                        last_integrated_server_version: 99,
                    },
                    latest_server_version: SaltedVersion {
                        version: 100,
                        salt: 0x5eed,
                    },
                },
                downloadable_bytes: 4096,
                query_version: 1,
                batch_state: state,
                changesets: vec![RemoteChangeset {
                    remote_version: 100,
                    last_integrated_local_version: 6,
                    origin_file_ident: 44,
                    origin_timestamp: 777,
                    original_size: 3,
                    data: Bytes::from_static(b"abc"),
                }],
            });
            assert_eq!(roundtrip_server(message.clone()), message);
        }
    }

    #[test]
    fn error_message_roundtrip_with_compensating_writes() {
        let mut body = ErrorBody::new(231, "write rejected", true)
            .with_action(ServerRequestedAction::NoAction);
        body.compensating_write_server_version = Some(55);
        body.compensating_write_rejected_client_version = 9;
        body.compensating_writes.push(CompensatingWriteInfo {
            table: "items".into(),
            reason: "permission denied".into(),
            primary_key: "pk-1".into(),
        });
        let message = ServerMessage::Error(ErrorMessage {
            session_ident: 4,
            body,
        });
        assert_eq!(roundtrip_server(message.clone()), message);
    }

    #[test]
    fn ping_pong_roundtrip() {
        let ping = ClientMessage::Ping(Ping {
            timestamp: 5000,
            rtt: 32,
        });
        assert_eq!(roundtrip_client(ping.clone()), ping);
        let pong = ServerMessage::Pong(Pong { timestamp: 5000 });
        assert_eq!(roundtrip_server(pong.clone()), pong);
    }

    #[test]
    fn unknown_message_type_rejected() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(3).unwrap();
        enc.str("v").unwrap();
        enc.u32(PROTOCOL_VERSION_CURRENT).unwrap();
        enc.str("type").unwrap();
        enc.str("FROB").unwrap();
        enc.str("body").unwrap();
        enc.map(0).unwrap();
        assert!(matches!(
            decode_server_message(&buf, &limits()),
            Err(ProtoDecodeError::UnknownMessageType(t)) if t == "FROB"
        ));
    }

    #[test]
    fn unsupported_envelope_version_rejected() {
        let bytes = encode_server_message(
            PROTOCOL_VERSION_CURRENT,
            &ServerMessage::Pong(Pong { timestamp: 1 }),
        )
        .unwrap();
        // Re-encode with a version below the supported floor.
        let bad = encode_server_message(
            PROTOCOL_VERSION_OLDEST_SUPPORTED - 1,
            &ServerMessage::Pong(Pong { timestamp: 1 }),
        )
        .unwrap();
        assert!(decode_server_message(&bytes, &limits()).is_ok());
        assert!(matches!(
            decode_server_message(&bad, &limits()),
            Err(ProtoDecodeError::InvalidField { field: "v", .. })
        ));
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(3).unwrap();
        enc.str("v").unwrap();
        enc.u32(PROTOCOL_VERSION_CURRENT).unwrap();
        enc.str("type").unwrap();
        enc.str("UNBOUND").unwrap();
        enc.str("body").unwrap();
        enc.map(2).unwrap();
        enc.str("session_ident").unwrap();
        enc.u64(12).unwrap();
        enc.str("future_field").unwrap();
        enc.str("ignored").unwrap();
        let message = decode_server_message(&buf, &limits()).unwrap();
        assert_eq!(
            message,
            ServerMessage::Unbound(Unbound { session_ident: 12 })
        );
    }

    #[test]
    fn changeset_count_limit_enforced() {
        let message = ServerMessage::Download(Download {
            session_ident: 1,
            progress: SyncProgress::default(),
            downloadable_bytes: 0,
            query_version: 0,
            batch_state: DownloadBatchState::SteadyState,
            changesets: (0..4u64)
                .map(|i| RemoteChangeset {
                    remote_version: i + 1,
                    last_integrated_local_version: 0,
                    origin_file_ident: 2,
                    origin_timestamp: 0,
                    original_size: 1,
                    data: Bytes::from_static(b"x"),
                })
                .collect(),
        });
        let bytes = encode_server_message(PROTOCOL_VERSION_CURRENT, &message).unwrap();
        let tight = ProtoLimits {
            max_changesets_per_message: 2,
            ..ProtoLimits::default()
        };
        assert!(matches!(
            decode_server_message(&bytes, &tight),
            Err(ProtoDecodeError::DecodeLimit("max_changesets_per_message"))
        ));
    }
}
