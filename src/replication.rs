//! Interfaces to the external collaborators of the sync client: the local
//! store's replication history, the flexible-sync subscription store, the
//! migration store, and the user/identity layer.
//!
//! The client only ever talks to these traits; production implementations
//! live with the storage engine and the SDK, tests provide fakes.

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::config::ClientResyncMode;
use crate::core::{
    DownloadBatchState, IntegrationError, PendingQuery, QueryVersion, RemoteChangeset,
    SaltedFileIdent, Status, SyncProgress, TransferProgress, UploadChangeset, UploadCursor,
    Version, VersionInfo,
};

/// Snapshot of the history's persisted sync state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HistoryStatus {
    /// Newest client version present in the history.
    pub last_version_available: Version,
    pub file_ident: SaltedFileIdent,
    pub progress: SyncProgress,
    /// True when a previous client reset has completed but not yet been
    /// acknowledged by the application layer.
    pub has_pending_client_reset: bool,
}

/// Result of scanning the history for changesets to upload.
#[derive(Clone, Debug, Default)]
pub struct UploadableChangesets {
    /// Upload cursor advanced past the scanned range.
    pub progress: UploadCursor,
    /// Server version the selected changesets were transformed against.
    pub locked_server_version: Version,
    pub changesets: Vec<UploadChangeset>,
}

/// Replication interface of the local database file.
///
/// Uploads read from it, download integration writes to it; the application
/// writes to the same file concurrently, so the client always goes through
/// a shared, locked handle ([`SharedHistory`]).
pub trait ReplicationHistory: Send {
    fn status(&self) -> HistoryStatus;

    /// Record the file identifier assigned by the server.
    fn set_file_ident(&mut self, file_ident: SaltedFileIdent);

    /// Select changesets to upload in `(progress.client_version, target]`.
    fn uploadable_changesets(
        &mut self,
        progress: UploadCursor,
        target_version: Version,
    ) -> UploadableChangesets;

    /// Integrate server changesets in a single write transaction.
    fn integrate_server_changesets(
        &mut self,
        progress: &SyncProgress,
        downloadable_bytes: u64,
        changesets: &[RemoteChangeset],
        batch_state: DownloadBatchState,
    ) -> Result<VersionInfo, IntegrationError>;

    /// Persist progress from a changeset-free DOWNLOAD message.
    fn set_sync_progress(
        &mut self,
        progress: &SyncProgress,
        downloadable_bytes: u64,
    ) -> Result<VersionInfo, IntegrationError>;

    /// Byte counters for progress reporting.
    fn transfer_progress(&self) -> TransferProgress;

    /// Copy state over from a freshly downloaded store. Returns false when
    /// there was nothing to reset (e.g. the local file is empty).
    fn perform_client_reset(
        &mut self,
        file_ident: SaltedFileIdent,
        fresh: &mut dyn ReplicationHistory,
        mode: ClientResyncMode,
        recovery_allowed: bool,
    ) -> Result<bool, IntegrationError>;

    /// Clear the pending-reset marker once the application has observed it.
    fn acknowledge_client_reset(&mut self) {}
}

/// Shared, lockable handle to a [`ReplicationHistory`].
pub type SharedHistory = Arc<Mutex<dyn ReplicationHistory>>;

/// Flexible-sync subscription sets, addressed by query version.
pub trait SubscriptionStore: Send + Sync {
    /// Latest committed query, used to seed IDENT and bootstrap resume.
    fn active_query(&self) -> Option<PendingQuery>;

    /// Next query newer than `after` whose snapshot does not lie beyond
    /// `before_client_version`.
    fn next_pending_query(
        &self,
        after: QueryVersion,
        before_client_version: Version,
    ) -> Option<PendingQuery>;

    /// A bootstrap for `version` finished integrating.
    fn mark_complete(&self, version: QueryVersion);

    /// The server rejected the query for `version`.
    fn mark_error(&self, version: QueryVersion, message: &str);

    /// Copy the active subscription set into a fresh store (client reset).
    fn mirror_to(&self, fresh: &dyn SubscriptionStore);

    /// Drop every subscription (rollback to partition-based sync).
    fn clear(&self);

    /// Create subscriptions from a migration-supplied query string.
    fn create_from_migration(&self, query_string: &str);

    /// Fail all subscription state waiters with `status`.
    fn notify_all_cancelled(&self, status: &Status);
}

/// Partition↔flexible migration bookkeeping.
pub trait MigrationStore: Send + Sync {
    fn migrate_to_flexible(&self, query_string: &str, partition: &str);
    fn rollback_to_partition(&self);
    /// Query version of the sentinel subscription used to detect that all
    /// pre-migration data has been uploaded.
    fn sentinel_query_version(&self) -> Option<QueryVersion>;
    fn migrated_partition(&self) -> Option<String>;
    /// Create subscriptions for tables that arrived from the server after a
    /// migration to flexible sync.
    fn create_subscriptions(&self, subscriptions: &dyn SubscriptionStore);
    fn complete_migration_or_rollback(&self);
    fn cancel_migration(&self);
}

/// The identity layer backing a session.
pub trait SyncUser: Send + Sync {
    fn user_id(&self) -> String;
    fn access_token(&self) -> String;
    fn is_logged_in(&self) -> bool;
    /// Request a fresh access token; the callback runs on an arbitrary
    /// thread when the refresh completes.
    fn refresh_access_token(&self, completion: Box<dyn FnOnce(Result<String, Status>) + Send>);
    fn log_out(&self);
}

/// Everything a session needs from its local store.
#[derive(Clone)]
pub struct SessionStores {
    pub history: SharedHistory,
    pub subscriptions: Option<Arc<dyn SubscriptionStore>>,
    pub migration: Option<Arc<dyn MigrationStore>>,
}

impl SessionStores {
    pub fn new(history: SharedHistory) -> Self {
        Self {
            history,
            subscriptions: None,
            migration: None,
        }
    }

    pub fn with_subscriptions(mut self, subscriptions: Arc<dyn SubscriptionStore>) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    pub fn with_migration(mut self, migration: Arc<dyn MigrationStore>) -> Self {
        self.migration = Some(migration);
        self
    }
}

/// Opens local store files on behalf of the client-reset coordinator.
pub trait StoreOpener: Send + Sync {
    fn open_store(&self, path: &Path) -> Result<SessionStores, Status>;
}
