//! Shared protocol value types: versions, cursors, identifiers, changesets.

use bytes::Bytes;

/// A store (history) version. Version 0 is the empty history.
pub type Version = u64;

/// Client file identifier assigned by the server. Valid identifiers are >= 1;
/// 0 means "not yet assigned".
pub type FileIdent = i64;

/// Salt paired with a file identifier or server version.
pub type Salt = i64;

/// Per-connection session identifier. 0 is reserved for connection-scoped
/// messages (PING/PONG, connection-level ERROR).
pub type SessionIdent = u64;

/// Identifier of a MARK or TEST_COMMAND request, allocated per session.
pub type RequestIdent = u64;

/// Flexible-sync query (subscription set) version.
pub type QueryVersion = i64;

/// Milliseconds on the client's monotonic clock.
pub type TimestampMs = u64;

/// File identifier plus the salt the server bound it with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SaltedFileIdent {
    pub ident: FileIdent,
    pub salt: Salt,
}

impl SaltedFileIdent {
    pub fn new(ident: FileIdent, salt: Salt) -> Self {
        Self { ident, salt }
    }

    /// True once the server has assigned an identifier.
    pub fn is_assigned(&self) -> bool {
        self.ident != 0
    }
}

/// Server version plus its salt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SaltedVersion {
    pub version: Version,
    pub salt: Salt,
}

/// Upload progress cursor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadCursor {
    /// Last client version whose changeset was uploaded (and acknowledged
    /// through DOWNLOAD progress).
    pub client_version: Version,
    /// Server version integrated locally at the time of that upload.
    pub last_integrated_server_version: Version,
}

/// Download progress cursor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownloadCursor {
    /// Last server version integrated locally.
    pub server_version: Version,
    /// Client version the server had integrated when producing that version.
    pub last_integrated_client_version: Version,
}

/// Full progress snapshot exchanged in IDENT/UPLOAD/DOWNLOAD messages and
/// persisted by the replication history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncProgress {
    pub download: DownloadCursor,
    pub upload: UploadCursor,
    pub latest_server_version: SaltedVersion,
}

/// A changeset received from the server in a DOWNLOAD message.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteChangeset {
    /// Server version produced by this changeset.
    pub remote_version: Version,
    /// Last client version the server had integrated when producing it.
    pub last_integrated_local_version: Version,
    /// File identifier of the file the changeset originated from.
    pub origin_file_ident: FileIdent,
    /// Origin wall-clock timestamp (server clock, milliseconds).
    pub origin_timestamp: TimestampMs,
    /// Uncompressed changeset size as declared by the server.
    pub original_size: u64,
    pub data: Bytes,
}

/// A local changeset selected for upload by the replication history.
#[derive(Clone, Debug, PartialEq)]
pub struct UploadChangeset {
    /// Client version produced by this changeset.
    pub client_version: Version,
    /// Server version integrated locally when the changeset was committed.
    pub server_version: Version,
    pub origin_timestamp: TimestampMs,
    /// 0 for changesets of local origin.
    pub origin_file_ident: FileIdent,
    pub data: Bytes,
}

/// Batch position of a DOWNLOAD message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadBatchState {
    MoreToCome,
    LastInBatch,
    SteadyState,
}

/// Sync protocol flavor of a session (and of the connection carrying it).
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SyncMode {
    /// Partition-based: one static partition value per session.
    Partition,
    /// Flexible: query-based subscription sets with versions.
    Flexible,
}

impl SyncMode {
    pub fn is_flexible(&self) -> bool {
        matches!(self, SyncMode::Flexible)
    }
}

/// Outcome of integrating server changesets into the local history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VersionInfo {
    /// Client version produced by the integration transaction.
    pub client_version: Version,
}

/// Byte counters the replication history maintains for progress reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub downloaded_bytes: u64,
    pub downloadable_bytes: u64,
    pub uploaded_bytes: u64,
    pub uploadable_bytes: u64,
    /// Client version of the latest local snapshot.
    pub snapshot_version: Version,
}

/// A pending flexible-sync query waiting to be sent to the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingQuery {
    pub query_version: QueryVersion,
    /// Client version at which the query set was committed. Uploads are
    /// clipped to this snapshot so the QUERY message lands on a clean data
    /// boundary.
    pub snapshot_version: Version,
    /// Serialized query body.
    pub query_body: String,
}
