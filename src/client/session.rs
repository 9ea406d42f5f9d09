//! Per-session protocol state machine.
//!
//! A session binds one local database file into a connection. It owns the
//! send-phase ordering (BIND, IDENT, TEST_COMMAND, ERROR, MARK, QUERY,
//! UPLOAD, UNBIND), the receive-side legality checks, the progress cursors
//! and completion detection, bootstrap assembly and compensating-write
//! deferral. It performs no IO: every handler returns actions for the
//! owning connection to interpret.

use std::collections::VecDeque;

use serde_json::json;

use crate::client::backoff::BackoffState;
use crate::client::bootstrap::{BootstrapBuffer, BootstrapIngest, PendingBootstrap};
use crate::client::progress::ProgressSample;
use crate::client::proto::{
    Bind, ClientMessage, Ident, JsonError, Mark, Query, TestCommand, Unbind, Upload,
};
use crate::client::reset::ClientResetOperation;
use crate::core::{
    ClientErrorCode, DownloadBatchState, DownloadCursor, ErrorBody, IntegrationError, PendingQuery,
    ProtocolErrorCode, QueryError, QueryVersion, RemoteChangeset, RequestIdent, SaltedFileIdent,
    SessionErrorInfo, SessionIdent, SyncMode, SyncProgress, UploadCursor, Version,
};
use crate::replication::SessionStores;

/// Internal lifecycle of a protocol session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionLifecycle {
    Unactivated,
    Active,
    Deactivating,
    Deactivated,
}

/// Facade-visible happenings, forwarded by the connection runtime.
#[derive(Debug)]
pub enum SessionEvent {
    Suspended(SessionErrorInfo),
    Resumed,
    /// Error reports that do not change the session lifecycle (integration
    /// failures, compensating writes).
    ErrorSurfaced(SessionErrorInfo),
    Progress(ProgressSample),
    UploadCompleted,
    DownloadCompleted,
    QueryError(QueryError),
    TestCommandResponse {
        request_ident: RequestIdent,
        body: String,
    },
    /// A client reset finished in an earlier run of this file and can now
    /// be acknowledged to the application.
    PendingClientResetAcknowledged,
}

/// Instructions to the owning connection.
#[derive(Debug)]
pub enum SessionAction {
    /// Append this session to the connection's send queue.
    Enlist,
    Event(SessionEvent),
    /// Arm the per-session resumption timer.
    StartResumptionTimer { delay_ms: u64 },
    /// Change of the connection's active-unsuspended session count.
    UnsuspendedDelta(i8),
    /// The session reached `Deactivated`; the connection discards it.
    Deactivated,
}

type ReceiveResult = Result<Vec<SessionAction>, ClientErrorCode>;

struct PendingTestCommand {
    request_ident: RequestIdent,
    body: String,
    pending: bool,
}

/// Construction parameters, snapshotted from the facade's configuration.
pub struct SessionParams {
    pub ident: SessionIdent,
    pub mode: SyncMode,
    /// Partition-mode server path (the partition value).
    pub server_path: String,
    pub stores: SessionStores,
    pub resumption_backoff: crate::config::ReconnectBackoff,
}

pub struct Session {
    ident: SessionIdent,
    mode: SyncMode,
    server_path: String,
    stores: SessionStores,

    state: SessionLifecycle,
    suspended: bool,
    enlisted_to_send: bool,

    bind_message_sent: bool,
    ident_message_sent: bool,
    unbind_message_sent: bool,
    unbind_message_send_complete: bool,
    unbound_message_received: bool,
    error_message_received: bool,

    error_to_send: bool,
    client_error: Option<IntegrationError>,
    allow_upload: bool,

    file_ident: SaltedFileIdent,
    progress: SyncProgress,
    upload_progress: UploadCursor,
    download_progress: DownloadCursor,
    upload_target_version: Version,
    last_version_available: Version,
    last_version_selected_for_upload: Version,
    downloadable_bytes: u64,

    target_download_mark: RequestIdent,
    last_download_mark_sent: RequestIdent,
    last_download_mark_received: RequestIdent,
    last_triggering_download_mark: RequestIdent,
    server_version_at_last_download_mark: Version,
    upload_completion_requested: bool,

    last_sent_query_version: QueryVersion,
    pending_query: Option<PendingQuery>,
    bootstrap: BootstrapBuffer,

    pending_compensating_writes: VecDeque<ErrorBody>,
    resumption_backoff: BackoffState<u32>,
    reset_operation: Option<ClientResetOperation>,

    pending_test_commands: Vec<PendingTestCommand>,
    next_test_request_ident: RequestIdent,
}

impl Session {
    pub fn new(params: SessionParams) -> Self {
        Self {
            ident: params.ident,
            mode: params.mode,
            server_path: params.server_path,
            stores: params.stores,
            state: SessionLifecycle::Unactivated,
            suspended: false,
            enlisted_to_send: false,
            bind_message_sent: false,
            ident_message_sent: false,
            unbind_message_sent: false,
            unbind_message_send_complete: false,
            unbound_message_received: false,
            error_message_received: false,
            error_to_send: false,
            client_error: None,
            allow_upload: true,
            file_ident: SaltedFileIdent::default(),
            progress: SyncProgress::default(),
            upload_progress: UploadCursor::default(),
            download_progress: DownloadCursor::default(),
            upload_target_version: 0,
            last_version_available: 0,
            last_version_selected_for_upload: 0,
            downloadable_bytes: 0,
            target_download_mark: 0,
            last_download_mark_sent: 0,
            last_download_mark_received: 0,
            last_triggering_download_mark: 0,
            server_version_at_last_download_mark: 0,
            upload_completion_requested: false,
            last_sent_query_version: 0,
            pending_query: None,
            bootstrap: BootstrapBuffer::new(128 * 1024 * 1024),
            pending_compensating_writes: VecDeque::new(),
            resumption_backoff: BackoffState::new(params.resumption_backoff),
            reset_operation: None,
            pending_test_commands: Vec::new(),
            next_test_request_ident: 1,
        }
    }

    pub fn ident(&self) -> SessionIdent {
        self.ident
    }

    pub fn state(&self) -> SessionLifecycle {
        self.state
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Install a pending client-reset operation; must happen before
    /// `activate()`.
    pub fn set_reset_operation(&mut self, operation: ClientResetOperation) {
        debug_assert_eq!(self.state, SessionLifecycle::Unactivated);
        self.reset_operation = Some(operation);
    }

    // -- lifecycle ---------------------------------------------------------

    pub fn activate(&mut self) -> Vec<SessionAction> {
        debug_assert_eq!(self.state, SessionLifecycle::Unactivated);
        tracing::debug!(target: "sync::session", session = self.ident, "activating");

        let mut actions = Vec::new();
        let mut has_pending_reset = false;
        if self.reset_operation.is_none() {
            let status = self.stores.history.lock().unwrap().status();
            self.last_version_available = status.last_version_available;
            self.file_ident = status.file_ident;
            self.progress = status.progress;
            has_pending_reset = status.has_pending_client_reset;
        }
        self.upload_target_version = self.last_version_available;
        self.upload_progress = self.progress.upload;
        self.last_version_selected_for_upload = self.upload_progress.client_version;
        self.download_progress = self.progress.download;

        tracing::debug!(
            target: "sync::session",
            session = self.ident,
            file_ident = self.file_ident.ident,
            last_version_available = self.last_version_available,
            progress_server_version = self.progress.download.server_version,
            "session state loaded"
        );

        self.reset_protocol_state();
        self.state = SessionLifecycle::Active;
        actions.push(SessionAction::UnsuspendedDelta(1));

        if has_pending_reset {
            actions.push(SessionAction::Event(
                SessionEvent::PendingClientResetAcknowledged,
            ));
        }
        actions
    }

    /// The connection has entered the connected state.
    pub fn connection_established(&mut self, fast_reconnect: bool) -> Vec<SessionAction> {
        self.reset_protocol_state();
        let mut actions = Vec::new();

        // Defer uploads after a slow reconnect until the initial download
        // round-trip completes, so a large backlog does not interleave with
        // the catch-up download.
        self.allow_upload = fast_reconnect;
        if !self.allow_upload {
            self.target_download_mark += 1;
        }

        if self.state == SessionLifecycle::Active && !self.suspended {
            actions.extend(self.ensure_enlisted());
        }
        actions
    }

    /// The connection dropped. Deactivating sessions die here.
    pub fn connection_lost(&mut self) -> Vec<SessionAction> {
        if self.state == SessionLifecycle::Deactivating {
            return self.complete_deactivation();
        }
        self.reset_protocol_state();
        Vec::new()
    }

    pub fn initiate_deactivation(&mut self) -> Vec<SessionAction> {
        debug_assert_eq!(self.state, SessionLifecycle::Active);
        tracing::debug!(target: "sync::session", session = self.ident, "initiating deactivation");

        self.state = SessionLifecycle::Deactivating;
        let mut actions = Vec::new();
        if !self.suspended {
            actions.push(SessionAction::UnsuspendedDelta(-1));
        }

        if self.enlisted_to_send {
            debug_assert!(!self.unbind_process_complete());
            return actions;
        }

        if !self.bind_message_sent || self.unbind_process_complete() {
            actions.extend(self.complete_deactivation());
            return actions;
        }

        if !self.unbind_message_sent {
            actions.extend(self.ensure_enlisted());
        }
        actions
    }

    pub fn force_close(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        match self.state {
            SessionLifecycle::Active => {
                if !self.suspended {
                    actions.push(SessionAction::UnsuspendedDelta(-1));
                }
                self.state = SessionLifecycle::Deactivated;
                actions.push(SessionAction::Deactivated);
            }
            SessionLifecycle::Deactivating => {
                self.state = SessionLifecycle::Deactivated;
                actions.push(SessionAction::Deactivated);
            }
            SessionLifecycle::Unactivated | SessionLifecycle::Deactivated => {}
        }
        actions
    }

    fn complete_deactivation(&mut self) -> Vec<SessionAction> {
        debug_assert_eq!(self.state, SessionLifecycle::Deactivating);
        self.state = SessionLifecycle::Deactivated;
        tracing::debug!(target: "sync::session", session = self.ident, "deactivation completed");
        vec![SessionAction::Deactivated]
    }

    fn reset_protocol_state(&mut self) {
        self.enlisted_to_send = false;
        self.bind_message_sent = false;
        self.ident_message_sent = false;
        self.unbind_message_sent = false;
        self.unbind_message_send_complete = false;
        self.unbound_message_received = false;
        self.error_message_received = false;
        self.last_download_mark_sent = self.last_download_mark_received;
        self.bootstrap.clear();
        for command in &mut self.pending_test_commands {
            command.pending = true;
        }
    }

    fn unbind_process_complete(&self) -> bool {
        self.unbind_message_send_complete
            && (self.error_message_received || self.unbound_message_received)
    }

    fn ensure_enlisted(&mut self) -> Vec<SessionAction> {
        if self.enlisted_to_send {
            return Vec::new();
        }
        self.enlisted_to_send = true;
        vec![SessionAction::Enlist]
    }

    // -- send phase --------------------------------------------------------

    /// Grant the session its opportunity to send. Returning `None` passes
    /// the opportunity on to the next enlisted session.
    pub fn produce_message(&mut self) -> (Option<ClientMessage>, Vec<SessionAction>) {
        debug_assert!(matches!(
            self.state,
            SessionLifecycle::Active | SessionLifecycle::Deactivating
        ));
        self.enlisted_to_send = false;

        if self.state == SessionLifecycle::Deactivating
            || self.error_message_received
            || self.suspended
        {
            // Unbinding. Without a BIND on the wire there is nothing to
            // unbind from.
            if !self.bind_message_sent {
                let actions = if self.state == SessionLifecycle::Deactivating {
                    self.complete_deactivation()
                } else {
                    Vec::new()
                };
                return (None, actions);
            }
            if !self.unbind_message_sent {
                return (Some(self.build_unbind()), Vec::new());
            }
            return (None, Vec::new());
        }

        debug_assert!(!self.unbind_message_sent);

        if !self.bind_message_sent {
            return self.build_bind();
        }

        if !self.ident_message_sent {
            if self.file_ident.is_assigned() {
                return self.build_ident();
            }
            return (None, Vec::new());
        }

        if self.pending_test_commands.iter().any(|c| c.pending) {
            return self.build_test_command();
        }

        if self.error_to_send {
            return self.build_json_error();
        }

        // A client-detected error halts upload, mark and query traffic.
        if self.client_error.is_some() {
            return (None, Vec::new());
        }

        if self.target_download_mark > self.last_download_mark_sent {
            return self.build_mark();
        }

        if !self.upload_allowed_by_migration() {
            return (None, Vec::new());
        }

        if self.should_send_query() {
            return self.build_query();
        }

        debug_assert!(self.upload_progress.client_version <= self.upload_target_version);
        debug_assert!(self.upload_target_version <= self.last_version_available);
        if self.allow_upload && self.upload_target_version > self.upload_progress.client_version {
            return self.build_upload();
        }

        (None, Vec::new())
    }

    /// The write of this session's last produced message has drained.
    pub fn message_sent(&mut self) -> Vec<SessionAction> {
        if self.unbind_message_sent && !self.unbind_message_send_complete {
            self.unbind_message_send_complete = true;
            if (self.unbound_message_received || self.error_message_received)
                && self.state == SessionLifecycle::Deactivating
            {
                return self.complete_deactivation();
            }
        }
        Vec::new()
    }

    fn build_bind(&mut self) -> (Option<ClientMessage>, Vec<SessionAction>) {
        debug_assert_eq!(self.state, SessionLifecycle::Active);
        let need_file_ident = !self.file_ident.is_assigned();
        let json_data = if self.mode.is_flexible() {
            let migrated = self
                .stores
                .migration
                .as_ref()
                .and_then(|migration| migration.migrated_partition());
            match migrated {
                Some(partition) => json!({ "migratedPartition": partition }).to_string(),
                None => String::new(),
            }
        } else {
            String::new()
        };
        tracing::debug!(
            target: "sync::session",
            session = self.ident,
            need_file_ident,
            "sending BIND"
        );
        let message = ClientMessage::Bind(Bind {
            session_ident: self.ident,
            server_path: if self.mode.is_flexible() {
                String::new()
            } else {
                self.server_path.clone()
            },
            json_data,
            access_token: String::new(),
            need_file_ident,
            is_subserver: false,
        });
        self.bind_message_sent = true;

        // IDENT can follow immediately when the identifier is known.
        let actions = if need_file_ident {
            Vec::new()
        } else {
            self.ensure_enlisted()
        };
        (Some(message), actions)
    }

    fn build_ident(&mut self) -> (Option<ClientMessage>, Vec<SessionAction>) {
        debug_assert!(self.bind_message_sent && !self.unbind_message_sent);
        let (query_version, query_body) = if self.mode.is_flexible() {
            let active = self
                .stores
                .subscriptions
                .as_ref()
                .and_then(|subs| subs.active_query());
            match active {
                Some(query) => (query.query_version, query.query_body),
                None => (0, String::from("{}")),
            }
        } else {
            (0, String::new())
        };
        tracing::debug!(
            target: "sync::session",
            session = self.ident,
            file_ident = self.file_ident.ident,
            scan_server_version = self.progress.download.server_version,
            query_version,
            "sending IDENT"
        );
        let message = ClientMessage::Ident(Ident {
            session_ident: self.ident,
            file_ident: self.file_ident,
            scan_server_version: self.progress.download.server_version,
            scan_client_version: self.progress.download.last_integrated_client_version,
            latest_server_version: self.progress.latest_server_version,
            query_version,
            query_body,
        });
        self.ident_message_sent = true;
        if self.mode.is_flexible() {
            self.last_sent_query_version = query_version;
        }
        let actions = self.ensure_enlisted();
        (Some(message), actions)
    }

    fn build_upload(&mut self) -> (Option<ClientMessage>, Vec<SessionAction>) {
        let mut target_version = self.upload_target_version;
        if self.mode.is_flexible() {
            if self
                .pending_query
                .as_ref()
                .is_none_or(|query| query.snapshot_version < self.upload_progress.client_version)
                && let Some(subs) = self.stores.subscriptions.as_ref()
            {
                self.pending_query = subs.next_pending_query(
                    self.last_sent_query_version,
                    self.upload_progress.client_version,
                );
            }
            // Clip the upload so the QUERY lands exactly on its snapshot.
            if let Some(query) = &self.pending_query
                && query.snapshot_version < self.upload_target_version
            {
                tracing::trace!(
                    target: "sync::session",
                    session = self.ident,
                    up_to = query.snapshot_version,
                    query_version = query.query_version,
                    "limiting UPLOAD to pending query snapshot"
                );
                target_version = query.snapshot_version;
            }
        }

        let uploadable = self
            .stores
            .history
            .lock()
            .unwrap()
            .uploadable_changesets(self.upload_progress, target_version);

        let mut actions = Vec::new();
        if uploadable.changesets.is_empty() {
            actions.extend(self.check_for_upload_completion());
        } else if let Some(last) = uploadable.changesets.last() {
            self.last_version_selected_for_upload = last.client_version;
        }

        let progress_before_scan = self.upload_progress;
        self.upload_progress = uploadable.progress;

        tracing::debug!(
            target: "sync::session",
            session = self.ident,
            progress_client_version = progress_before_scan.client_version,
            locked_server_version = uploadable.locked_server_version,
            num_changesets = uploadable.changesets.len(),
            "sending UPLOAD"
        );
        let message = ClientMessage::Upload(Upload {
            session_ident: self.ident,
            progress: progress_before_scan,
            locked_server_version: uploadable.locked_server_version,
            changesets: uploadable.changesets,
        });
        actions.extend(self.ensure_enlisted());
        (Some(message), actions)
    }

    fn build_mark(&mut self) -> (Option<ClientMessage>, Vec<SessionAction>) {
        let request_ident = self.target_download_mark;
        tracing::debug!(
            target: "sync::session",
            session = self.ident,
            request_ident,
            "sending MARK"
        );
        self.last_download_mark_sent = request_ident;
        let message = ClientMessage::Mark(Mark {
            session_ident: self.ident,
            request_ident,
        });
        let actions = self.ensure_enlisted();
        (Some(message), actions)
    }

    fn build_query(&mut self) -> (Option<ClientMessage>, Vec<SessionAction>) {
        let query = self.pending_query.clone().expect("pending query");
        debug_assert!(query.query_version > self.last_sent_query_version);
        tracing::debug!(
            target: "sync::session",
            session = self.ident,
            query_version = query.query_version,
            snapshot_version = query.snapshot_version,
            "sending QUERY"
        );
        self.last_sent_query_version = query.query_version;
        let message = ClientMessage::Query(Query {
            session_ident: self.ident,
            query_version: query.query_version,
            query_body: query.query_body,
        });
        // A QUERY wants a download round-trip so the bootstrap completion
        // is observable.
        let mut actions = self.request_download_completion();
        actions.extend(self.ensure_enlisted());
        (Some(message), actions)
    }

    fn build_json_error(&mut self) -> (Option<ClientMessage>, Vec<SessionAction>) {
        let error = self.client_error.as_ref().expect("client error");
        let json = json!({ "message": error.message }).to_string();
        let error_code = match error.code {
            ClientErrorCode::BadChangeset => ProtocolErrorCode::BadChangeset.raw(),
            ClientErrorCode::BadChangesetHeaderSyntax | ClientErrorCode::BadChangesetSize => {
                ProtocolErrorCode::BadChangeset.raw()
            }
            ClientErrorCode::BadProgress => ProtocolErrorCode::BadProgress.raw(),
            _ => ProtocolErrorCode::OtherSessionError.raw(),
        };
        tracing::info!(
            target: "sync::session",
            session = self.ident,
            error_code,
            "sending ERROR"
        );
        let message = ClientMessage::JsonError(JsonError {
            session_ident: self.ident,
            error_code,
            json,
        });
        self.error_to_send = false;
        let actions = self.ensure_enlisted();
        (Some(message), actions)
    }

    fn build_test_command(&mut self) -> (Option<ClientMessage>, Vec<SessionAction>) {
        let command = self
            .pending_test_commands
            .iter_mut()
            .find(|command| command.pending)
            .expect("pending test command");
        command.pending = false;
        let message = ClientMessage::TestCommand(TestCommand {
            session_ident: self.ident,
            request_ident: command.request_ident,
            body: command.body.clone(),
        });
        let actions = self.ensure_enlisted();
        (Some(message), actions)
    }

    fn build_unbind(&mut self) -> ClientMessage {
        debug_assert!(self.bind_message_sent && !self.unbind_message_sent);
        tracing::debug!(target: "sync::session", session = self.ident, "sending UNBIND");
        self.unbind_message_sent = true;
        ClientMessage::Unbind(Unbind {
            session_ident: self.ident,
        })
    }

    fn upload_allowed_by_migration(&self) -> bool {
        if !self.mode.is_flexible() {
            return true;
        }
        let Some(migration) = self.stores.migration.as_ref() else {
            return true;
        };
        let Some(sentinel) = migration.sentinel_query_version() else {
            return true;
        };
        // While the sentinel query is the latest sent, the migration has
        // not completed and uploads must hold off.
        self.last_sent_query_version != sentinel
    }

    fn should_send_query(&mut self) -> bool {
        if !self.mode.is_flexible() || !self.allow_upload {
            return false;
        }
        let Some(subs) = self.stores.subscriptions.as_ref() else {
            return false;
        };
        self.pending_query = subs.next_pending_query(
            self.last_sent_query_version,
            self.upload_progress.client_version,
        );
        match &self.pending_query {
            Some(query) => self.upload_progress.client_version >= query.snapshot_version,
            None => false,
        }
    }

    // -- receive phase -----------------------------------------------------

    pub fn receive_ident(&mut self, file_ident: SaltedFileIdent) -> ReceiveResult {
        tracing::debug!(
            target: "sync::session",
            session = self.ident,
            file_ident = file_ident.ident,
            salt = file_ident.salt,
            "received IDENT"
        );
        // The local file must not be touched once deactivation started.
        if self.state != SessionLifecycle::Active {
            return Ok(Vec::new());
        }

        let legal = self.bind_message_sent
            && !self.file_ident.is_assigned()
            && !self.error_message_received
            && !self.unbound_message_received;
        if !legal {
            return Err(ClientErrorCode::BadMessageOrder);
        }
        if file_ident.ident < 1 {
            return Err(ClientErrorCode::BadClientFileIdent);
        }
        if file_ident.salt == 0 {
            return Err(ClientErrorCode::BadClientFileIdentSalt);
        }

        self.file_ident = file_ident;

        let mut actions = Vec::new();
        if let Some(operation) = self.reset_operation.take() {
            let did_reset = {
                let mut history = self.stores.history.lock().unwrap();
                operation.finalize(file_ident, &mut *history)
            };
            match did_reset {
                Ok(true) => {
                    let status = self.stores.history.lock().unwrap().status();
                    self.last_version_available = status.last_version_available;
                    self.progress = status.progress;
                    debug_assert_eq!(self.progress.upload.client_version, 0);
                    self.upload_target_version = self.last_version_available;
                    self.upload_progress = self.progress.upload;
                    self.download_progress = self.progress.download;
                    self.last_version_selected_for_upload = 0;
                    // Recovery may leave new commits to upload with nothing
                    // left to download; open the gate.
                    self.allow_upload = true;
                    tracing::debug!(
                        target: "sync::session",
                        session = self.ident,
                        last_version_available = self.last_version_available,
                        "client reset completed"
                    );
                    if status.has_pending_client_reset {
                        actions.push(SessionAction::Event(
                            SessionEvent::PendingClientResetAcknowledged,
                        ));
                    }
                    if let Some(migration) = self.stores.migration.as_ref() {
                        migration.complete_migration_or_rollback();
                    }
                }
                Ok(false) => self.record_fresh_ident(file_ident),
                Err(error) => {
                    let message =
                        format!("A fatal error occurred during client reset: '{}'", error.message);
                    tracing::error!(target: "sync::session", session = self.ident, "{message}");
                    let info = SessionErrorInfo::from_client_error(
                        ClientErrorCode::AutoClientResetFailure,
                        message,
                        true,
                    );
                    actions.extend(self.suspend(info));
                    return Ok(actions);
                }
            }
        } else {
            self.record_fresh_ident(file_ident);
        }

        actions.extend(self.ensure_enlisted());
        Ok(actions)
    }

    fn record_fresh_ident(&mut self, file_ident: SaltedFileIdent) {
        let mut history = self.stores.history.lock().unwrap();
        history.set_file_ident(file_ident);
        drop(history);
        self.progress.download.last_integrated_client_version = 0;
        self.progress.upload.client_version = 0;
        self.last_version_selected_for_upload = 0;
    }

    pub fn receive_download(&mut self, message: crate::client::proto::Download) -> ReceiveResult {
        if self.state != SessionLifecycle::Active {
            return Ok(Vec::new());
        }

        let mut batch_state = message.batch_state;
        if !self.mode.is_flexible() {
            batch_state = DownloadBatchState::SteadyState;
        }

        tracing::debug!(
            target: "sync::session",
            session = self.ident,
            server_version = message.progress.download.server_version,
            downloadable_bytes = message.downloadable_bytes,
            query_version = message.query_version,
            batch_state = ?batch_state,
            num_changesets = message.changesets.len(),
            "received DOWNLOAD"
        );

        if self.client_error.is_some() {
            // Do not try to transform the same bad changeset repeatedly.
            tracing::debug!(
                target: "sync::session",
                session = self.ident,
                "ignoring DOWNLOAD after client-side error"
            );
            return Ok(Vec::new());
        }

        let legal = self.ident_message_sent
            && !self.error_message_received
            && !self.unbound_message_received;
        if !legal {
            return Err(ClientErrorCode::BadMessageOrder);
        }
        if !self.check_received_sync_progress(&message.progress) {
            return Err(ClientErrorCode::BadProgress);
        }

        let mut server_version = self.progress.download.server_version;
        let mut last_integrated_client_version =
            self.progress.download.last_integrated_client_version;
        for changeset in &message.changesets {
            // Per-changeset server version strictly increasing, except
            // inside flexible-sync bootstraps where it may repeat.
            let good_server_version = if self.mode.is_flexible() {
                changeset.remote_version >= server_version
            } else {
                changeset.remote_version > server_version
            };
            if !good_server_version {
                return Err(ClientErrorCode::BadServerVersion);
            }
            server_version = changeset.remote_version;

            let good_client_version = changeset.last_integrated_local_version
                >= last_integrated_client_version
                && changeset.last_integrated_local_version
                    <= message.progress.download.last_integrated_client_version;
            if !good_client_version {
                return Err(ClientErrorCode::BadClientVersion);
            }
            last_integrated_client_version = changeset.last_integrated_local_version;

            let good_file_ident = changeset.origin_file_ident > 0
                && changeset.origin_file_ident != self.file_ident.ident;
            if !good_file_ident {
                return Err(ClientErrorCode::BadOriginFileIdent);
            }
        }

        if self.mode.is_flexible() && batch_state != DownloadBatchState::SteadyState {
            let outcome = self.bootstrap.ingest(
                message.query_version,
                batch_state,
                &message.progress,
                message.downloadable_bytes,
                message.changesets,
            );
            let mut actions = match outcome {
                Ok(BootstrapIngest::Buffered { batches, bytes }) => {
                    tracing::debug!(
                        target: "sync::session",
                        session = self.ident,
                        batches,
                        bytes,
                        "bootstrap batch buffered"
                    );
                    Vec::new()
                }
                Ok(BootstrapIngest::Complete(bootstrap)) => self.integrate_bootstrap(bootstrap),
                Err(error) => self.on_integration_failure(IntegrationError::new(
                    ClientErrorCode::BadProgress,
                    error.to_string(),
                )),
            };
            actions.extend(self.clear_resumption_delay_state());
            return Ok(actions);
        }

        let mut actions = self.integrate_changesets(
            &message.progress,
            message.downloadable_bytes,
            message.changesets,
            batch_state,
        );
        actions.extend(self.clear_resumption_delay_state());
        Ok(actions)
    }

    fn integrate_bootstrap(&mut self, bootstrap: PendingBootstrap) -> Vec<SessionAction> {
        tracing::debug!(
            target: "sync::session",
            session = self.ident,
            query_version = bootstrap.query_version,
            num_changesets = bootstrap.changesets.len(),
            "integrating bootstrap"
        );
        let query_version = bootstrap.query_version;
        let mut actions = self.integrate_changesets(
            &bootstrap.progress,
            bootstrap.downloadable_bytes,
            bootstrap.changesets,
            DownloadBatchState::LastInBatch,
        );
        if self.client_error.is_none()
            && let Some(subs) = self.stores.subscriptions.as_ref()
        {
            subs.mark_complete(query_version);
        }
        actions
    }

    fn integrate_changesets(
        &mut self,
        progress: &SyncProgress,
        downloadable_bytes: u64,
        changesets: Vec<RemoteChangeset>,
        batch_state: DownloadBatchState,
    ) -> Vec<SessionAction> {
        let last_changeset_version = changesets.last().map(|c| c.remote_version);
        let outcome = {
            let mut history = self.stores.history.lock().unwrap();
            if changesets.is_empty() {
                history.set_sync_progress(progress, downloadable_bytes)
            } else {
                history.integrate_server_changesets(
                    progress,
                    downloadable_bytes,
                    &changesets,
                    batch_state,
                )
            }
        };

        match outcome {
            Ok(version_info) => {
                if !changesets.is_empty() {
                    tracing::debug!(
                        target: "sync::session",
                        session = self.ident,
                        count = changesets.len(),
                        client_version = version_info.client_version,
                        "remote changesets integrated"
                    );
                }
                self.downloadable_bytes = downloadable_bytes;
                let mut actions = Vec::new();
                if let Some(through_version) = last_changeset_version {
                    actions.extend(self.report_due_compensating_writes(through_version));
                }
                actions.extend(
                    self.on_changesets_integrated(version_info.client_version, *progress),
                );
                actions
            }
            Err(error) => self.on_integration_failure(error),
        }
    }

    fn on_changesets_integrated(
        &mut self,
        new_client_version: Version,
        progress: SyncProgress,
    ) -> Vec<SessionAction> {
        debug_assert_eq!(self.state, SessionLifecycle::Active);
        debug_assert!(progress.download.server_version >= self.download_progress.server_version);
        let mut actions = Vec::new();

        self.download_progress = progress.download;
        let upload_progressed =
            progress.upload.client_version > self.progress.upload.client_version;
        self.progress = progress;

        if upload_progressed {
            if progress.upload.client_version > self.last_version_selected_for_upload {
                if progress.upload.client_version > self.upload_progress.client_version {
                    self.upload_progress = progress.upload;
                }
                self.last_version_selected_for_upload = progress.upload.client_version;
            }
            actions.extend(self.check_for_upload_completion());
        }

        // New local snapshot produced by integration: the upload scan may
        // proceed past it.
        if new_client_version > self.last_version_available {
            self.last_version_available = new_client_version;
        }
        self.upload_target_version = self.last_version_available;

        actions.extend(self.check_for_download_completion());

        if self.mode.is_flexible()
            && let (Some(migration), Some(subs)) = (
                self.stores.migration.as_ref(),
                self.stores.subscriptions.as_ref(),
            )
        {
            migration.create_subscriptions(subs.as_ref());
        }

        actions.push(SessionAction::Event(SessionEvent::Progress(
            self.progress_sample(),
        )));

        debug_assert!(
            self.suspended || self.error_message_received || !self.unbind_message_sent
        );
        if self.ident_message_sent && !self.error_message_received && !self.suspended {
            actions.extend(self.ensure_enlisted());
        }
        actions
    }

    fn on_integration_failure(&mut self, error: IntegrationError) -> Vec<SessionAction> {
        debug_assert_eq!(self.state, SessionLifecycle::Active);
        debug_assert!(self.client_error.is_none() && !self.error_to_send);
        tracing::error!(
            target: "sync::session",
            session = self.ident,
            "failed to integrate downloaded changesets: {error}"
        );

        let info = SessionErrorInfo::from_client_error(
            error.code,
            format!("integration failed: {}", error.message),
            false,
        );
        self.client_error = Some(error);
        self.error_to_send = true;

        let mut actions = vec![SessionAction::Event(SessionEvent::ErrorSurfaced(info))];
        if self.ident_message_sent && !self.error_message_received && !self.suspended {
            actions.extend(self.ensure_enlisted());
        }
        actions
    }

    fn progress_sample(&self) -> ProgressSample {
        let transfer = self.stores.history.lock().unwrap().transfer_progress();
        ProgressSample {
            downloaded: transfer.downloaded_bytes,
            downloadable: transfer.downloadable_bytes,
            uploaded: transfer.uploaded_bytes,
            uploadable: transfer.uploadable_bytes,
            download_version: self.progress.download.server_version,
            snapshot_version: transfer.snapshot_version,
        }
    }

    fn report_due_compensating_writes(&mut self, through_version: Version) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        while let Some(front) = self.pending_compensating_writes.front() {
            let due = front
                .compensating_write_server_version
                .is_some_and(|version| version <= through_version);
            if !due {
                break;
            }
            let body = self.pending_compensating_writes.pop_front().expect("front");
            tracing::info!(
                target: "sync::session",
                session = self.ident,
                server_version = body.compensating_write_server_version,
                rejected_client_version = body.compensating_write_rejected_client_version,
                "reporting compensating write"
            );
            actions.push(SessionAction::Event(SessionEvent::ErrorSurfaced(
                SessionErrorInfo::from_error_body(&body),
            )));
        }
        actions
    }

    fn check_received_sync_progress(&self, incoming: &SyncProgress) -> bool {
        let current = &self.progress;
        // Every cursor is weakly monotonic throughout a session and no
        // cursor may point past what exists on either side.
        incoming.latest_server_version.version >= current.latest_server_version.version
            && incoming.upload.client_version >= current.upload.client_version
            && incoming.upload.client_version <= self.last_version_available
            && incoming.download.server_version >= current.download.server_version
            && incoming.download.server_version <= incoming.latest_server_version.version
            && incoming.download.last_integrated_client_version
                >= current.download.last_integrated_client_version
            && incoming.download.last_integrated_client_version <= incoming.upload.client_version
    }

    pub fn receive_mark(&mut self, request_ident: RequestIdent) -> ReceiveResult {
        tracing::debug!(
            target: "sync::session",
            session = self.ident,
            request_ident,
            "received MARK"
        );
        if self.state != SessionLifecycle::Active {
            return Ok(Vec::new());
        }

        let legal = self.ident_message_sent
            && !self.error_message_received
            && !self.unbound_message_received;
        if !legal {
            return Err(ClientErrorCode::BadMessageOrder);
        }
        let good_request = request_ident <= self.last_download_mark_sent
            && request_ident > self.last_download_mark_received;
        if !good_request {
            return Err(ClientErrorCode::BadRequestIdent);
        }

        self.server_version_at_last_download_mark = self.progress.download.server_version;
        self.last_download_mark_received = request_ident;
        Ok(self.check_for_download_completion())
    }

    pub fn receive_unbound(&mut self) -> ReceiveResult {
        tracing::debug!(target: "sync::session", session = self.ident, "received UNBOUND");

        let legal = self.unbind_message_sent
            && !self.error_message_received
            && !self.unbound_message_received;
        if !legal {
            return Err(ClientErrorCode::BadMessageOrder);
        }

        debug_assert!(self.state == SessionLifecycle::Deactivating || self.suspended);
        self.unbound_message_received = true;

        if self.unbind_message_send_complete && self.state == SessionLifecycle::Deactivating {
            return Ok(self.complete_deactivation());
        }
        Ok(Vec::new())
    }

    pub fn receive_error(&mut self, body: ErrorBody) -> ReceiveResult {
        tracing::info!(
            target: "sync::session",
            session = self.ident,
            error_code = body.raw_code,
            try_again = body.try_again,
            action = body.server_requests_action.as_wire(),
            "received ERROR: {}",
            body.message
        );

        let legal = self.bind_message_sent
            && !self.error_message_received
            && !self.unbound_message_received;
        if !legal {
            return Err(ClientErrorCode::BadMessageOrder);
        }

        let Some(code) = body.code() else {
            return Err(ClientErrorCode::BadErrorCode);
        };
        if !code.is_session_level() {
            return Err(ClientErrorCode::BadErrorCode);
        }

        if code == ProtocolErrorCode::CompensatingWrite {
            // Deferred until the carrying server version has downloaded. A
            // session that is no longer active will receive the error again
            // on its next connect.
            if self.state == SessionLifecycle::Active {
                let position = self
                    .pending_compensating_writes
                    .iter()
                    .position(|pending| {
                        pending.compensating_write_server_version
                            > body.compensating_write_server_version
                    })
                    .unwrap_or(self.pending_compensating_writes.len());
                self.pending_compensating_writes.insert(position, body);
            }
            return Ok(Vec::new());
        }

        self.error_message_received = true;
        Ok(self.suspend(SessionErrorInfo::from_error_body(&body)))
    }

    pub fn receive_query_error(
        &mut self,
        error_code: u32,
        message: String,
        query_version: QueryVersion,
    ) -> ReceiveResult {
        tracing::info!(
            target: "sync::session",
            session = self.ident,
            error_code,
            query_version,
            "received QUERY_ERROR: {message}"
        );
        if self.state != SessionLifecycle::Active {
            return Ok(Vec::new());
        }
        if let Some(subs) = self.stores.subscriptions.as_ref() {
            subs.mark_error(query_version, &message);
        }
        Ok(vec![SessionAction::Event(SessionEvent::QueryError(
            QueryError {
                raw_code: error_code,
                message,
                query_version,
            },
        ))])
    }

    pub fn receive_test_response(
        &mut self,
        request_ident: RequestIdent,
        body: String,
    ) -> ReceiveResult {
        let Some(position) = self
            .pending_test_commands
            .iter()
            .position(|command| command.request_ident == request_ident)
        else {
            return Err(ClientErrorCode::BadRequestIdent);
        };
        self.pending_test_commands.remove(position);
        Ok(vec![SessionAction::Event(
            SessionEvent::TestCommandResponse {
                request_ident,
                body,
            },
        )])
    }

    // -- suspension and resumption ----------------------------------------

    fn suspend(&mut self, info: SessionErrorInfo) -> Vec<SessionAction> {
        debug_assert!(!self.suspended);
        debug_assert!(matches!(
            self.state,
            SessionLifecycle::Active | SessionLifecycle::Deactivating
        ));
        tracing::debug!(target: "sync::session", session = self.ident, "suspended");
        self.suspended = true;

        let mut actions = Vec::new();

        if self.unbind_message_send_complete && self.error_message_received {
            debug_assert_eq!(self.state, SessionLifecycle::Deactivating);
            actions.extend(self.complete_deactivation());
            return actions;
        }

        let try_again = !info.is_fatal;
        let raw_code = info.raw_error_code;
        let delay_override = info.resumption_delay_interval;

        if self.state == SessionLifecycle::Active {
            actions.push(SessionAction::UnsuspendedDelta(-1));
            actions.push(SessionAction::Event(SessionEvent::Suspended(info)));
        }

        if try_again {
            self.resumption_backoff.update(raw_code, delay_override);
            let mut delay_ms = self.resumption_backoff.delay_interval();
            if raw_code == ProtocolErrorCode::SessionClosed.raw() {
                // The server sends session_closed after completing a
                // bootstrap; full backoff here would add minutes of latency
                // between query changes.
                delay_ms = 1000;
            }
            tracing::debug!(
                target: "sync::session",
                session = self.ident,
                delay_ms,
                "will attempt to resume session"
            );
            actions.push(SessionAction::StartResumptionTimer { delay_ms });
        }

        if !self.unbind_message_sent {
            actions.extend(self.ensure_enlisted());
        }
        actions
    }

    /// Leave suspension, rebinding if the unbind round-trip has finished.
    /// `connected` tells whether the owning connection is currently up.
    pub fn cancel_resumption_delay(&mut self, connected: bool) -> Vec<SessionAction> {
        debug_assert_eq!(self.state, SessionLifecycle::Active);
        if !self.suspended {
            return Vec::new();
        }
        self.suspended = false;
        tracing::debug!(target: "sync::session", session = self.ident, "resumed");

        let mut actions = Vec::new();
        if self.unbind_process_complete() {
            self.reset_protocol_state();
            if connected {
                actions.extend(self.ensure_enlisted());
            }
        }
        actions.push(SessionAction::UnsuspendedDelta(1));
        actions.push(SessionAction::Event(SessionEvent::Resumed));
        actions
    }

    fn clear_resumption_delay_state(&mut self) -> Vec<SessionAction> {
        // A successful download proves the session healthy again.
        self.resumption_backoff.reset();
        Vec::new()
    }

    // -- completion notifications -----------------------------------------

    pub fn request_upload_completion_notification(&mut self) -> Vec<SessionAction> {
        self.upload_completion_requested = true;
        if self.state == SessionLifecycle::Active {
            self.check_for_upload_completion()
        } else {
            Vec::new()
        }
    }

    pub fn request_download_completion_notification(&mut self) -> Vec<SessionAction> {
        let mut actions = self.request_download_completion();
        if self.state == SessionLifecycle::Active
            && self.ident_message_sent
            && !self.error_message_received
            && !self.suspended
        {
            actions.extend(self.ensure_enlisted());
        }
        actions
    }

    fn request_download_completion(&mut self) -> Vec<SessionAction> {
        self.target_download_mark += 1;
        Vec::new()
    }

    fn check_for_upload_completion(&mut self) -> Vec<SessionAction> {
        if !self.upload_completion_requested {
            return Vec::new();
        }
        // Nothing uploads during an ongoing client reset.
        if self.reset_operation.is_some() {
            return Vec::new();
        }
        // The upload scan must have reached the end of history and all
        // uploaded changesets must have been acknowledged.
        debug_assert!(self.upload_progress.client_version <= self.last_version_available);
        if self.upload_progress.client_version != self.last_version_available {
            return Vec::new();
        }
        debug_assert!(self.progress.upload.client_version <= self.last_version_selected_for_upload);
        if self.progress.upload.client_version != self.last_version_selected_for_upload {
            return Vec::new();
        }
        self.upload_completion_requested = false;
        vec![SessionAction::Event(SessionEvent::UploadCompleted)]
    }

    fn check_for_download_completion(&mut self) -> Vec<SessionAction> {
        debug_assert!(self.target_download_mark >= self.last_download_mark_received);
        debug_assert!(self.last_download_mark_received >= self.last_triggering_download_mark);
        if self.last_download_mark_received == self.last_triggering_download_mark {
            return Vec::new();
        }
        if self.last_download_mark_received < self.target_download_mark {
            return Vec::new();
        }
        if self.download_progress.server_version < self.server_version_at_last_download_mark {
            return Vec::new();
        }
        self.last_triggering_download_mark = self.target_download_mark;
        let mut actions = Vec::new();
        if !self.allow_upload {
            self.allow_upload = true;
            actions.extend(self.ensure_enlisted());
        }
        actions.push(SessionAction::Event(SessionEvent::DownloadCompleted));
        actions
    }

    // -- external stimuli --------------------------------------------------

    /// The application committed a new local version.
    pub fn recognize_sync_version(&mut self, version: Version) -> Vec<SessionAction> {
        if version > self.last_version_available {
            self.last_version_available = version;
        }
        self.upload_target_version = self.last_version_available;
        if self.state == SessionLifecycle::Active
            && self.ident_message_sent
            && !self.error_message_received
            && !self.suspended
        {
            return self.ensure_enlisted();
        }
        Vec::new()
    }

    /// Queue a TEST_COMMAND for the server.
    pub fn send_test_command(&mut self, body: String) -> (RequestIdent, Vec<SessionAction>) {
        let request_ident = self.next_test_request_ident;
        self.next_test_request_ident += 1;
        self.pending_test_commands.push(PendingTestCommand {
            request_ident,
            body,
            pending: true,
        });
        let actions = if self.state == SessionLifecycle::Active && self.bind_message_sent {
            self.ensure_enlisted()
        } else {
            Vec::new()
        };
        (request_ident, actions)
    }
}
