//! Shared value types and the error taxonomy of the sync protocol.

pub mod error;
pub mod types;

pub use error::{
    ClientErrorCode, CompensatingWriteInfo, ErrorBody, IntegrationError, ProtocolErrorCode,
    QueryError, ServerRequestedAction, SessionErrorInfo, Status, StatusCode, SyncError,
};
pub use types::{
    DownloadBatchState, DownloadCursor, FileIdent, PendingQuery, QueryVersion, RemoteChangeset,
    RequestIdent, Salt, SaltedFileIdent, SaltedVersion, SessionIdent, SyncMode, SyncProgress,
    TimestampMs, TransferProgress, UploadChangeset, UploadCursor, Version, VersionInfo,
};
