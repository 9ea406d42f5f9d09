//! Flexible-sync flows: bootstrap assembly, query sequencing, and the
//! automatic client-reset coordinator.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::Receiver;

use lagoon_sync::client::proto::{
    ClientMessage, Download, ErrorMessage, IdentAssignment, MarkResponse, PROTOCOL_VERSION_CURRENT,
    ProtoLimits, ServerMessage, decode_client_message, encode_server_message,
};
use lagoon_sync::client::transport::{MemoryServerEnd, MemoryTransportProvider};
use lagoon_sync::config::{ClientConfig, ClientResyncMode, ReconnectBackoff, SessionConfig};
use lagoon_sync::core::{
    DownloadBatchState, DownloadCursor, ErrorBody, IntegrationError, PendingQuery, QueryVersion,
    RemoteChangeset, SaltedFileIdent, SaltedVersion, ServerRequestedAction, Status, SyncProgress,
    TransferProgress, UploadChangeset, UploadCursor, Version, VersionInfo,
};
use lagoon_sync::replication::{
    HistoryStatus, MigrationStore, ReplicationHistory, SessionStores, StoreOpener,
    SubscriptionStore, SyncUser, UploadableChangesets,
};
use lagoon_sync::{SyncClient, SyncSession, SyncSessionState};

const WAIT: Duration = Duration::from_secs(5);

/// Route the client's tracing output through the test harness. `LOG=debug`
/// shows the connection and session logs on failure.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_env_var("LOG")
                .from_env_lossy(),
        )
        .with_test_writer()
        .try_init();
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

// -- fakes -------------------------------------------------------------------

#[derive(Default)]
struct FakeHistory {
    last_version_available: Version,
    file_ident: SaltedFileIdent,
    progress: SyncProgress,
    uploadable: Vec<UploadChangeset>,
    /// Changeset count of every integration transaction.
    integrated_batches: Arc<Mutex<Vec<usize>>>,
    resets: Arc<AtomicU64>,
}

impl ReplicationHistory for FakeHistory {
    fn status(&self) -> HistoryStatus {
        HistoryStatus {
            last_version_available: self.last_version_available,
            file_ident: self.file_ident,
            progress: self.progress,
            has_pending_client_reset: false,
        }
    }

    fn set_file_ident(&mut self, file_ident: SaltedFileIdent) {
        self.file_ident = file_ident;
    }

    fn uploadable_changesets(
        &mut self,
        progress: UploadCursor,
        target_version: Version,
    ) -> UploadableChangesets {
        let changesets: Vec<_> = self
            .uploadable
            .iter()
            .filter(|c| c.client_version > progress.client_version && c.client_version <= target_version)
            .cloned()
            .collect();
        UploadableChangesets {
            progress: UploadCursor {
                client_version: target_version,
                last_integrated_server_version: progress.last_integrated_server_version,
            },
            locked_server_version: self.progress.download.server_version,
            changesets,
        }
    }

    fn integrate_server_changesets(
        &mut self,
        progress: &SyncProgress,
        _downloadable_bytes: u64,
        changesets: &[RemoteChangeset],
        _batch_state: DownloadBatchState,
    ) -> Result<VersionInfo, IntegrationError> {
        self.integrated_batches.lock().unwrap().push(changesets.len());
        self.progress = *progress;
        self.last_version_available += changesets.len() as Version;
        Ok(VersionInfo {
            client_version: self.last_version_available,
        })
    }

    fn set_sync_progress(
        &mut self,
        progress: &SyncProgress,
        _downloadable_bytes: u64,
    ) -> Result<VersionInfo, IntegrationError> {
        self.progress = *progress;
        Ok(VersionInfo {
            client_version: self.last_version_available,
        })
    }

    fn transfer_progress(&self) -> TransferProgress {
        TransferProgress {
            snapshot_version: self.last_version_available,
            ..TransferProgress::default()
        }
    }

    fn perform_client_reset(
        &mut self,
        file_ident: SaltedFileIdent,
        _fresh: &mut dyn ReplicationHistory,
        _mode: ClientResyncMode,
        _recovery_allowed: bool,
    ) -> Result<bool, IntegrationError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.file_ident = file_ident;
        self.progress = SyncProgress::default();
        self.last_version_available = 0;
        self.uploadable.clear();
        Ok(true)
    }
}

#[derive(Default)]
struct FakeSubscriptions {
    active: Mutex<Option<PendingQuery>>,
    pending: Mutex<Vec<PendingQuery>>,
    completed: Mutex<Vec<QueryVersion>>,
    errors: Mutex<Vec<(QueryVersion, String)>>,
    mirrored: AtomicBool,
}

impl SubscriptionStore for FakeSubscriptions {
    fn active_query(&self) -> Option<PendingQuery> {
        self.active.lock().unwrap().clone()
    }

    fn next_pending_query(
        &self,
        after: QueryVersion,
        _before_client_version: Version,
    ) -> Option<PendingQuery> {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .find(|query| query.query_version > after)
            .cloned()
    }

    fn mark_complete(&self, version: QueryVersion) {
        self.completed.lock().unwrap().push(version);
    }

    fn mark_error(&self, version: QueryVersion, message: &str) {
        self.errors.lock().unwrap().push((version, message.to_string()));
    }

    fn mirror_to(&self, _fresh: &dyn SubscriptionStore) {
        self.mirrored.store(true, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.pending.lock().unwrap().clear();
        *self.active.lock().unwrap() = None;
    }

    fn create_from_migration(&self, _query_string: &str) {}

    fn notify_all_cancelled(&self, _status: &Status) {}
}

struct NullMigration;

impl MigrationStore for NullMigration {
    fn migrate_to_flexible(&self, _query_string: &str, _partition: &str) {}
    fn rollback_to_partition(&self) {}
    fn sentinel_query_version(&self) -> Option<QueryVersion> {
        None
    }
    fn migrated_partition(&self) -> Option<String> {
        None
    }
    fn create_subscriptions(&self, _subscriptions: &dyn SubscriptionStore) {}
    fn complete_migration_or_rollback(&self) {}
    fn cancel_migration(&self) {}
}

struct FakeUser;

impl SyncUser for FakeUser {
    fn user_id(&self) -> String {
        "user-1".into()
    }
    fn access_token(&self) -> String {
        "token".into()
    }
    fn is_logged_in(&self) -> bool {
        true
    }
    fn refresh_access_token(&self, completion: Box<dyn FnOnce(Result<String, Status>) + Send>) {
        completion(Ok("token".into()));
    }
    fn log_out(&self) {}
}

/// Opens fresh stores for the client-reset coordinator.
struct FreshOpener {
    opened: Arc<Mutex<Vec<std::path::PathBuf>>>,
}

impl StoreOpener for FreshOpener {
    fn open_store(&self, path: &Path) -> Result<SessionStores, Status> {
        self.opened.lock().unwrap().push(path.to_path_buf());
        let history = Arc::new(Mutex::new(FakeHistory::default()));
        let subscriptions = Arc::new(FakeSubscriptions::default());
        Ok(SessionStores::new(history)
            .with_subscriptions(subscriptions))
    }
}

// -- server scripting --------------------------------------------------------

struct ServerLink {
    end: MemoryServerEnd,
}

impl ServerLink {
    fn send(&self, message: &ServerMessage) {
        let frame =
            encode_server_message(PROTOCOL_VERSION_CURRENT, message).expect("server frame encodes");
        self.end.deliver(&frame);
    }

    /// Reply to one client message with the stock IDENT/MARK responses.
    fn auto_respond(&self, message: &ClientMessage) {
        match message {
            ClientMessage::Bind(bind) if bind.need_file_ident => {
                self.send(&ServerMessage::Ident(IdentAssignment {
                    session_ident: bind.session_ident,
                    file_ident: SaltedFileIdent::new(9, 0x77),
                }));
            }
            ClientMessage::Mark(mark) => {
                self.send(&ServerMessage::Mark(MarkResponse {
                    session_ident: mark.session_ident,
                    request_ident: mark.request_ident,
                }));
            }
            _ => {}
        }
    }

    /// Drive the wire with automatic IDENT and MARK responses until
    /// `until` matches a message.
    fn auto_serve<T>(&self, mut until: impl FnMut(&ClientMessage) -> Option<T>) -> T {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            let Some(frame) = self.end.next_frame(Duration::from_millis(200)) else {
                continue;
            };
            let message =
                decode_client_message(&frame, &ProtoLimits::default()).expect("decodes");
            self.auto_respond(&message);
            if let Some(value) = until(&message) {
                return value;
            }
        }
        panic!("expected message did not arrive");
    }
}

struct Harness {
    client: Arc<SyncClient>,
    incoming: Receiver<MemoryServerEnd>,
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        let (provider, incoming) = MemoryTransportProvider::new();
        let config = ClientConfig {
            reconnect_backoff: ReconnectBackoff {
                delay_jitter_divisor: 0,
                ..ReconnectBackoff::default()
            },
            ..ClientConfig::default()
        };
        Self {
            client: SyncClient::new(config, provider),
            incoming,
        }
    }

    fn accept(&self, subprotocol: &str) -> ServerLink {
        let end = self
            .incoming
            .recv_timeout(WAIT)
            .expect("client should open a transport");
        end.accept(subprotocol);
        ServerLink { end }
    }
}

fn progress_at(server_version: Version) -> SyncProgress {
    SyncProgress {
        download: DownloadCursor {
            server_version,
            last_integrated_client_version: 0,
        },
        upload: UploadCursor::default(),
        latest_server_version: SaltedVersion {
            version: server_version,
            salt: 1,
        },
    }
}

fn remote_changeset(remote_version: Version, payload: &'static [u8]) -> RemoteChangeset {
    RemoteChangeset {
        remote_version,
        last_integrated_local_version: 0,
        origin_file_ident: 42,
        origin_timestamp: 0,
        original_size: payload.len() as u64,
        data: Bytes::from_static(payload),
    }
}

// -- tests -------------------------------------------------------------------

#[test]
fn bootstrap_batches_integrate_in_one_transaction() {
    let harness = Harness::new();

    let batches = Arc::new(Mutex::new(Vec::new()));
    let history = Arc::new(Mutex::new(FakeHistory {
        file_ident: SaltedFileIdent::new(7, 0x5a17),
        integrated_batches: Arc::clone(&batches),
        ..FakeHistory::default()
    }));
    let subscriptions = Arc::new(FakeSubscriptions::default());
    *subscriptions.active.lock().unwrap() = Some(PendingQuery {
        query_version: 1,
        snapshot_version: 0,
        query_body: "{\"items\":\"truepredicate\"}".into(),
    });

    let stores = SessionStores::new(history)
        .with_subscriptions((Arc::clone(&subscriptions) as Arc<dyn SubscriptionStore>))
        .with_migration(Arc::new(NullMigration));
    let config = SessionConfig::new("lagoon://server/app", "/tmp/flex.lagoon").flexible();
    let session = SyncSession::create(
        Arc::clone(&harness.client),
        config,
        stores,
        Arc::new(FakeUser),
        None,
    )
    .unwrap();
    assert_eq!(session.state(), SyncSessionState::Active);

    let server = harness.accept("lagoon-flex-8");
    let query_version = server.auto_serve(|message| match message {
        ClientMessage::Ident(ident) => Some(ident.query_version),
        _ => None,
    });
    assert_eq!(query_version, 1);

    // Two-batch bootstrap for query version 1.
    server.send(&ServerMessage::Download(Download {
        session_ident: 1,
        progress: progress_at(5),
        downloadable_bytes: 64,
        query_version: 1,
        batch_state: DownloadBatchState::MoreToCome,
        changesets: vec![remote_changeset(5, b"aa"), remote_changeset(5, b"bb")],
    }));
    server.send(&ServerMessage::Download(Download {
        session_ident: 1,
        progress: progress_at(5),
        downloadable_bytes: 0,
        query_version: 1,
        batch_state: DownloadBatchState::LastInBatch,
        changesets: vec![remote_changeset(5, b"cc")],
    }));

    // All three changesets land in a single integration transaction.
    assert!(wait_until(|| *batches.lock().unwrap() == vec![3]));
    assert!(wait_until(|| subscriptions
        .completed
        .lock()
        .unwrap()
        .contains(&1)));
}

#[test]
fn query_change_follows_upload_to_snapshot() {
    let harness = Harness::new();

    let history = Arc::new(Mutex::new(FakeHistory {
        file_ident: SaltedFileIdent::new(7, 0x5a17),
        last_version_available: 1,
        uploadable: vec![UploadChangeset {
            client_version: 1,
            server_version: 0,
            origin_timestamp: 0,
            origin_file_ident: 0,
            data: Bytes::from_static(b"subscription commit"),
        }],
        ..FakeHistory::default()
    }));
    let subscriptions = Arc::new(FakeSubscriptions::default());
    subscriptions.pending.lock().unwrap().push(PendingQuery {
        query_version: 1,
        snapshot_version: 1,
        query_body: "{\"items\":\"size > 3\"}".into(),
    });

    let stores = SessionStores::new(history)
        .with_subscriptions((Arc::clone(&subscriptions) as Arc<dyn SubscriptionStore>));
    let config = SessionConfig::new("lagoon://server/app", "/tmp/flexq.lagoon").flexible();
    let _session = SyncSession::create(
        Arc::clone(&harness.client),
        config,
        stores,
        Arc::new(FakeUser),
        None,
    )
    .unwrap();

    let server = harness.accept("lagoon-flex-8");

    // The upload reaching the query snapshot must precede the QUERY.
    let mut upload_seen = false;
    let query = server.auto_serve(|message| match message {
        ClientMessage::Upload(upload) if !upload.changesets.is_empty() => {
            upload_seen = true;
            None
        }
        ClientMessage::Query(query) => Some(query.clone()),
        _ => None,
    });
    assert!(upload_seen, "UPLOAD must reach the snapshot before QUERY");
    assert_eq!(query.query_version, 1);
    assert!(query.query_body.contains("size > 3"));
}

#[test]
fn automatic_client_reset_downloads_fresh_store_and_recovers() {
    let harness = Harness::new();

    let resets = Arc::new(AtomicU64::new(0));
    let history = Arc::new(Mutex::new(FakeHistory {
        file_ident: SaltedFileIdent::new(7, 0x5a17),
        resets: Arc::clone(&resets),
        ..FakeHistory::default()
    }));
    let subscriptions = Arc::new(FakeSubscriptions::default());
    let opened = Arc::new(Mutex::new(Vec::new()));
    let opener = Arc::new(FreshOpener {
        opened: Arc::clone(&opened),
    });

    let stores = SessionStores::new(history)
        .with_subscriptions((Arc::clone(&subscriptions) as Arc<dyn SubscriptionStore>));
    let config = SessionConfig::new("lagoon://server/app", "/data/resettable.lagoon").flexible();
    let session = SyncSession::create(
        Arc::clone(&harness.client),
        config,
        stores,
        Arc::new(FakeUser),
        Some(opener),
    )
    .unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    session.set_error_handler(Box::new(move |error| {
        sink.lock().unwrap().push(error);
    }));

    let server = harness.accept("lagoon-flex-8");
    let primary_ident = server.auto_serve(|message| match message {
        ClientMessage::Ident(ident) => Some(ident.session_ident),
        _ => None,
    });

    // Server demands a client reset.
    let mut body = ErrorBody::new(217, "bad client file", false);
    body.server_requests_action = ServerRequestedAction::ClientReset;
    server.send(&ServerMessage::Error(ErrorMessage {
        session_ident: primary_ident,
        body,
    }));

    // The coordinator opens `<primary>.fresh`, mirrors the subscriptions,
    // downloads it via a sibling session, then restarts the primary with a
    // pending reset that finalizes on the fresh IDENT. A background
    // responder keeps answering BINDs and MARKs through the whole dance.
    let stop = Arc::new(AtomicBool::new(false));
    let responder_stop = Arc::clone(&stop);
    let responder = std::thread::spawn(move || {
        let mut fresh_binds = Vec::new();
        while !responder_stop.load(Ordering::SeqCst) {
            let Some(frame) = server.end.next_frame(Duration::from_millis(50)) else {
                continue;
            };
            let message =
                decode_client_message(&frame, &ProtoLimits::default()).expect("decodes");
            server.auto_respond(&message);
            if let ClientMessage::Bind(bind) = &message
                && bind.need_file_ident
            {
                fresh_binds.push(bind.session_ident);
            }
        }
        fresh_binds
    });

    assert!(wait_until(|| resets.load(Ordering::SeqCst) == 1));
    assert!(wait_until(|| session.state() == SyncSessionState::Active));
    stop.store(true, Ordering::SeqCst);
    let fresh_binds = responder.join().unwrap();
    // Two ident-requesting binds: the fresh-download sibling and the
    // restarted primary.
    assert_eq!(fresh_binds.len(), 2);
    assert!(fresh_binds.iter().all(|ident| *ident != primary_ident));
    assert!(subscriptions.mirrored.load(Ordering::SeqCst));
    assert_eq!(
        opened.lock().unwrap().as_slice(),
        &[std::path::PathBuf::from("/data/resettable.lagoon.fresh")]
    );
    assert!(
        errors.lock().unwrap().is_empty(),
        "an automatic reset is not surfaced as an error"
    );
}
