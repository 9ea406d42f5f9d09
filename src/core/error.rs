//! Error taxonomy: server protocol codes, client-detected codes, the wire
//! ERROR payload, and the `Status` values delivered to completion callbacks.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::{QueryVersion, Version};

/// Error codes assigned by the server and carried in ERROR messages.
///
/// Codes in `[100, 199]` are connection-level: they are fatal to every
/// session multiplexed on the connection. Codes in `[200, 299]` are
/// session-level and affect only the addressed session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ProtocolErrorCode {
    // Connection level.
    ConnectionClosed = 100,
    OtherError = 101,
    UnknownMessage = 102,
    BadSyntax = 103,
    LimitsExceeded = 104,
    WrongProtocolVersion = 105,
    BadSessionIdent = 106,
    ReuseOfSessionIdent = 107,
    BoundInOtherSession = 108,
    BadMessageOrder = 109,
    BadDecompression = 110,
    BadChangesetHeaderSyntax = 111,
    BadChangesetSize = 112,
    SwitchToFlexibleSync = 113,
    SwitchToPartitionSync = 114,

    // Session level.
    SessionClosed = 200,
    OtherSessionError = 201,
    TokenExpired = 202,
    BadAuthentication = 203,
    IllegalStorePath = 204,
    NoSuchStore = 205,
    PermissionDenied = 206,
    BadServerFileIdent = 207,
    BadClientFileIdent = 208,
    BadServerVersion = 209,
    BadClientVersion = 210,
    DivergingHistories = 211,
    BadChangeset = 212,
    PartialSyncDisabled = 214,
    UnsupportedSessionFeature = 215,
    BadOriginFileIdent = 216,
    BadClientFile = 217,
    ServerFileDeleted = 218,
    ClientFileBlacklisted = 219,
    UserBlacklisted = 220,
    TransactBeforeUpload = 221,
    ClientFileExpired = 222,
    UserMismatch = 223,
    TooManySessions = 224,
    InvalidSchemaChange = 225,
    BadQuery = 226,
    ObjectAlreadyExists = 227,
    ServerPermissionsChanged = 228,
    InitialSyncNotCompleted = 229,
    WriteNotAllowed = 230,
    CompensatingWrite = 231,
    MigrateToFlexibleSync = 232,
    BadProgress = 233,
    RevertToPartitionSync = 234,
    BadSchemaVersion = 235,
    SchemaVersionChanged = 236,
}

impl ProtocolErrorCode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use ProtocolErrorCode::*;
        let code = match raw {
            100 => ConnectionClosed,
            101 => OtherError,
            102 => UnknownMessage,
            103 => BadSyntax,
            104 => LimitsExceeded,
            105 => WrongProtocolVersion,
            106 => BadSessionIdent,
            107 => ReuseOfSessionIdent,
            108 => BoundInOtherSession,
            109 => BadMessageOrder,
            110 => BadDecompression,
            111 => BadChangesetHeaderSyntax,
            112 => BadChangesetSize,
            113 => SwitchToFlexibleSync,
            114 => SwitchToPartitionSync,
            200 => SessionClosed,
            201 => OtherSessionError,
            202 => TokenExpired,
            203 => BadAuthentication,
            204 => IllegalStorePath,
            205 => NoSuchStore,
            206 => PermissionDenied,
            207 => BadServerFileIdent,
            208 => BadClientFileIdent,
            209 => BadServerVersion,
            210 => BadClientVersion,
            211 => DivergingHistories,
            212 => BadChangeset,
            214 => PartialSyncDisabled,
            215 => UnsupportedSessionFeature,
            216 => BadOriginFileIdent,
            217 => BadClientFile,
            218 => ServerFileDeleted,
            219 => ClientFileBlacklisted,
            220 => UserBlacklisted,
            221 => TransactBeforeUpload,
            222 => ClientFileExpired,
            223 => UserMismatch,
            224 => TooManySessions,
            225 => InvalidSchemaChange,
            226 => BadQuery,
            227 => ObjectAlreadyExists,
            228 => ServerPermissionsChanged,
            229 => InitialSyncNotCompleted,
            230 => WriteNotAllowed,
            231 => CompensatingWrite,
            232 => MigrateToFlexibleSync,
            233 => BadProgress,
            234 => RevertToPartitionSync,
            235 => BadSchemaVersion,
            236 => SchemaVersionChanged,
            _ => return None,
        };
        Some(code)
    }

    pub fn raw(self) -> u32 {
        self as u32
    }

    pub fn is_session_level(self) -> bool {
        self.raw() >= 200
    }
}

impl fmt::Display for ProtocolErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.raw())
    }
}

/// Error conditions detected by the client itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientErrorCode {
    ConnectionClosed,
    UnknownMessage,
    BadSyntax,
    LimitsExceeded,
    BadSessionIdent,
    BadMessageOrder,
    BadClientFileIdent,
    BadClientFileIdentSalt,
    ConnectTimeout,
    BadTimestamp,
    BadProtocolFromServer,
    ClientTooOldForServer,
    ClientTooNewForServer,
    ProtocolMismatch,
    BadOriginFileIdent,
    BadServerVersion,
    BadClientVersion,
    BadProgress,
    BadChangesetHeaderSyntax,
    BadChangesetSize,
    BadChangeset,
    BadRequestIdent,
    BadErrorCode,
    BadCompression,
    SslServerCertRejected,
    PongTimeout,
    AutoClientResetFailure,
    MissingProtocolFeature,
}

impl ClientErrorCode {
    pub fn message(self) -> &'static str {
        use ClientErrorCode::*;
        match self {
            ConnectionClosed => "connection closed (no error)",
            UnknownMessage => "unknown type of input message",
            BadSyntax => "bad syntax in input message head",
            LimitsExceeded => "limits exceeded in input message",
            BadSessionIdent => "bad session identifier in input message",
            BadMessageOrder => "bad input message order",
            BadClientFileIdent => "bad client file identifier (IDENT)",
            BadClientFileIdentSalt => "bad client file identifier salt (IDENT)",
            ConnectTimeout => "sync connection was not fully established in time",
            BadTimestamp => "bad timestamp (PONG)",
            BadProtocolFromServer => "bad or missing protocol version information from server",
            ClientTooOldForServer => "protocol version negotiation failed: client is too old",
            ClientTooNewForServer => "protocol version negotiation failed: client is too new",
            ProtocolMismatch => "protocol version negotiation failed: no version overlap",
            BadOriginFileIdent => "bad origin file identifier (DOWNLOAD)",
            BadServerVersion => "bad server version (DOWNLOAD)",
            BadClientVersion => "bad client version (DOWNLOAD)",
            BadProgress => "bad progress information (DOWNLOAD)",
            BadChangesetHeaderSyntax => "bad changeset header syntax (DOWNLOAD)",
            BadChangesetSize => "bad changeset size (DOWNLOAD)",
            BadChangeset => "bad changeset (DOWNLOAD)",
            BadRequestIdent => "bad request identifier (MARK)",
            BadErrorCode => "bad error code (ERROR)",
            BadCompression => "bad compression (DOWNLOAD)",
            SslServerCertRejected => "ssl server certificate rejected",
            PongTimeout => "timeout on reception of PONG response message",
            AutoClientResetFailure => "automatic client reset failed",
            MissingProtocolFeature => "missing protocol feature",
        }
    }
}

impl fmt::Display for ClientErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Recovery action the server asks the client to take, carried in ERROR
/// messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServerRequestedAction {
    #[default]
    NoAction,
    ProtocolViolation,
    ApplicationBug,
    Warning,
    Transient,
    DeleteStore,
    ClientReset,
    ClientResetNoRecovery,
    MigrateToFlexibleSync,
    RevertToPartitionSync,
}

impl ServerRequestedAction {
    pub fn from_wire(raw: &str) -> Option<Self> {
        use ServerRequestedAction::*;
        let action = match raw {
            "NoAction" => NoAction,
            "ProtocolViolation" => ProtocolViolation,
            "ApplicationBug" => ApplicationBug,
            "Warning" => Warning,
            "Transient" => Transient,
            "DeleteStore" => DeleteStore,
            "ClientReset" => ClientReset,
            "ClientResetNoRecovery" => ClientResetNoRecovery,
            "MigrateToFlexibleSync" => MigrateToFlexibleSync,
            "RevertToPartitionSync" => RevertToPartitionSync,
            _ => return None,
        };
        Some(action)
    }

    pub fn as_wire(self) -> &'static str {
        use ServerRequestedAction::*;
        match self {
            NoAction => "NoAction",
            ProtocolViolation => "ProtocolViolation",
            ApplicationBug => "ApplicationBug",
            Warning => "Warning",
            Transient => "Transient",
            DeleteStore => "DeleteStore",
            ClientReset => "ClientReset",
            ClientResetNoRecovery => "ClientResetNoRecovery",
            MigrateToFlexibleSync => "MigrateToFlexibleSync",
            RevertToPartitionSync => "RevertToPartitionSync",
        }
    }

    pub fn is_client_reset(self) -> bool {
        matches!(
            self,
            ServerRequestedAction::ClientReset
                | ServerRequestedAction::ClientResetNoRecovery
                | ServerRequestedAction::MigrateToFlexibleSync
                | ServerRequestedAction::RevertToPartitionSync
        )
    }
}

/// One rejected write described by a compensating-write ERROR.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensatingWriteInfo {
    pub table: String,
    pub reason: String,
    pub primary_key: String,
}

/// Body of a server-sent ERROR message.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorBody {
    pub raw_code: u32,
    pub message: String,
    pub try_again: bool,
    pub log_url: Option<String>,
    pub server_requests_action: ServerRequestedAction,
    /// Server-suggested delay override for the backoff schedule, ms.
    pub resumption_delay_interval: Option<u64>,
    pub compensating_write_server_version: Option<Version>,
    pub compensating_write_rejected_client_version: Version,
    pub compensating_writes: Vec<CompensatingWriteInfo>,
    /// Query string delivered with a MigrateToFlexibleSync action.
    pub migration_query_string: Option<String>,
}

impl ErrorBody {
    pub fn new(raw_code: u32, message: impl Into<String>, try_again: bool) -> Self {
        Self {
            raw_code,
            message: message.into(),
            try_again,
            log_url: None,
            server_requests_action: ServerRequestedAction::NoAction,
            resumption_delay_interval: None,
            compensating_write_server_version: None,
            compensating_write_rejected_client_version: 0,
            compensating_writes: Vec::new(),
            migration_query_string: None,
        }
    }

    pub fn with_action(mut self, action: ServerRequestedAction) -> Self {
        self.server_requests_action = action;
        self
    }

    pub fn code(&self) -> Option<ProtocolErrorCode> {
        ProtocolErrorCode::from_raw(self.raw_code)
    }
}

/// Broad status classification for facade-level results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    /// The awaited operation was cancelled (session deactivated, client
    /// shut down, timer destroyed).
    OperationAborted,
    RuntimeError,
    AuthError,
    SyncProtocolViolation,
    SyncClientResetFailed,
    SyncPermanentError,
    SyncCompensatingWrite,
    ConnectionClosed,
}

/// Result value delivered to completion callbacks and error handlers.
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    pub const OK: Status = Status {
        code: StatusCode::Ok,
        message: String::new(),
    };

    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(StatusCode::OperationAborted, message)
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            f.write_str("OK")
        } else {
            write!(f, "{:?}: {}", self.code, self.message)
        }
    }
}

/// Everything a session (or the connection on its behalf) knows about an
/// error when reporting it to the facade.
#[derive(Clone, Debug)]
pub struct SessionErrorInfo {
    pub status: Status,
    pub raw_error_code: u32,
    pub is_fatal: bool,
    pub server_requests_action: ServerRequestedAction,
    pub log_url: Option<String>,
    pub compensating_writes: Vec<CompensatingWriteInfo>,
    pub resumption_delay_interval: Option<u64>,
    pub migration_query_string: Option<String>,
    /// Set when the server sent a code this client does not recognize.
    pub unrecognized_by_client: bool,
}

impl SessionErrorInfo {
    pub fn new(status: Status, is_fatal: bool) -> Self {
        Self {
            status,
            raw_error_code: 0,
            is_fatal,
            server_requests_action: ServerRequestedAction::NoAction,
            log_url: None,
            compensating_writes: Vec::new(),
            resumption_delay_interval: None,
            migration_query_string: None,
            unrecognized_by_client: false,
        }
    }

    pub fn from_client_error(code: ClientErrorCode, message: String, is_fatal: bool) -> Self {
        let status_code = match code {
            ClientErrorCode::AutoClientResetFailure => StatusCode::SyncClientResetFailed,
            _ if is_fatal => StatusCode::SyncProtocolViolation,
            _ => StatusCode::ConnectionClosed,
        };
        Self::new(Status::new(status_code, message), is_fatal)
    }

    pub fn from_error_body(body: &ErrorBody) -> Self {
        let known = ProtocolErrorCode::from_raw(body.raw_code);
        let status_code = match known {
            Some(ProtocolErrorCode::BadAuthentication | ProtocolErrorCode::TokenExpired) => {
                StatusCode::AuthError
            }
            Some(ProtocolErrorCode::CompensatingWrite) => StatusCode::SyncCompensatingWrite,
            Some(_) if !body.try_again => StatusCode::SyncPermanentError,
            _ => StatusCode::RuntimeError,
        };
        Self {
            status: Status::new(status_code, body.message.clone()),
            raw_error_code: body.raw_code,
            is_fatal: !body.try_again,
            server_requests_action: body.server_requests_action,
            log_url: body.log_url.clone(),
            compensating_writes: body.compensating_writes.clone(),
            resumption_delay_interval: body.resumption_delay_interval,
            migration_query_string: body.migration_query_string.clone(),
            unrecognized_by_client: known.is_none(),
        }
    }
}

/// User-facing sync error surfaced through the facade's error handler.
#[derive(Clone, Debug)]
pub struct SyncError {
    pub status: Status,
    pub is_fatal: bool,
    pub server_requests_action: ServerRequestedAction,
    /// Auxiliary string properties; client-reset errors carry
    /// `ORIGINAL_FILE_PATH` and `RECOVERY_FILE_PATH` here.
    pub user_info: BTreeMap<String, String>,
    pub is_unrecognized_by_client: bool,
}

impl SyncError {
    pub const ORIGINAL_FILE_PATH_KEY: &'static str = "ORIGINAL_FILE_PATH";
    pub const RECOVERY_FILE_PATH_KEY: &'static str = "RECOVERY_FILE_PATH";

    pub fn new(info: &SessionErrorInfo) -> Self {
        Self {
            status: info.status.clone(),
            is_fatal: info.is_fatal,
            server_requests_action: info.server_requests_action,
            user_info: BTreeMap::new(),
            is_unrecognized_by_client: info.unrecognized_by_client,
        }
    }

    pub fn is_client_reset_requested(&self) -> bool {
        self.server_requests_action.is_client_reset()
    }
}

/// Failure while integrating server changesets into the local history.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct IntegrationError {
    pub code: ClientErrorCode,
    pub message: String,
}

impl IntegrationError {
    pub fn new(code: ClientErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error surfaced alongside a QUERY_ERROR message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryError {
    pub raw_code: u32,
    pub message: String,
    pub query_version: QueryVersion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_level_split_at_200() {
        assert!(!ProtocolErrorCode::BadSyntax.is_session_level());
        assert!(ProtocolErrorCode::BadAuthentication.is_session_level());
        assert!(ProtocolErrorCode::CompensatingWrite.is_session_level());
    }

    #[test]
    fn raw_roundtrip() {
        for raw in 90..250u32 {
            if let Some(code) = ProtocolErrorCode::from_raw(raw) {
                assert_eq!(code.raw(), raw);
            }
        }
        assert_eq!(ProtocolErrorCode::from_raw(213), None);
        assert_eq!(ProtocolErrorCode::from_raw(999), None);
    }

    #[test]
    fn unknown_code_marks_unrecognized() {
        let body = ErrorBody::new(999, "mystery", true);
        let info = SessionErrorInfo::from_error_body(&body);
        assert!(info.unrecognized_by_client);
        assert!(!info.is_fatal);
    }

    #[test]
    fn action_wire_roundtrip() {
        for action in [
            ServerRequestedAction::NoAction,
            ServerRequestedAction::ClientReset,
            ServerRequestedAction::ClientResetNoRecovery,
            ServerRequestedAction::MigrateToFlexibleSync,
            ServerRequestedAction::RevertToPartitionSync,
            ServerRequestedAction::Transient,
            ServerRequestedAction::Warning,
        ] {
            assert_eq!(
                ServerRequestedAction::from_wire(action.as_wire()),
                Some(action)
            );
        }
        assert_eq!(ServerRequestedAction::from_wire("bogus"), None);
    }
}
