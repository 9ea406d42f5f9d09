//! The user-visible sync session.
//!
//! Wraps one protocol session (rebuilt across restarts) behind a separate
//! lifecycle: `Active`, `Dying`, `Inactive`, `Paused`,
//! `WaitingForAccessToken`. Owns the completion-callback table, the
//! progress and connection-state notifiers, the client-reset/migration
//! coordination and the token-refresh flow. Public methods may be called
//! from any thread; events arrive on the client's loop thread.
//!
//! Every async continuation holds a weak self-reference and re-acquires a
//! strong handle on entry, so a session dropped by the application never
//! outlives its last external reference.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::client::endpoint::{ServerEndpoint, UrlError};
use crate::client::notifier::{
    ConnectionState, ConnectionStateCallback, ConnectionStateNotifier, NotifierToken,
};
use crate::client::progress::{
    ProgressCallback, ProgressDirection, ProgressNotifier, ProgressToken,
};
use crate::client::reset::{ClientResetOperation, fresh_path_for, recovery_backup_path};
use crate::client::runtime::{BindSessionArgs, ClientEvent, SyncClient};
use crate::client::session::SessionEvent;
use crate::config::{ClientResyncMode, SessionConfig, SessionStopPolicy};
use crate::core::{
    ClientErrorCode, QueryVersion, RequestIdent, ServerRequestedAction, SessionErrorInfo,
    SessionIdent, Status, StatusCode, SyncError, SyncMode, Version,
};
use crate::replication::{SessionStores, StoreOpener, SyncUser};

/// Facade lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncSessionState {
    Active,
    Dying,
    Inactive,
    Paused,
    WaitingForAccessToken,
}

type CompletionCallback = Box<dyn FnOnce(Status) + Send>;
type TestCommandHandler = Box<dyn FnOnce(String) + Send>;

struct FacadeState {
    state: SyncSessionState,
    /// Guards against an old death finalizing a revived session.
    death_count: u64,
    session_ident: Option<SessionIdent>,
    completion_callbacks: BTreeMap<u64, (ProgressDirection, CompletionCallback)>,
    next_request_id: u64,
    /// While set, transient Inactive transitions keep the callback table.
    reset_in_progress: bool,
    pending_reset: Option<ClientResetOperation>,
    fresh_download: Option<Arc<SyncSession>>,
    attempted_refresh: bool,
    migration_sentinel: Option<QueryVersion>,
    config_after_migration: Option<SessionConfig>,
}

pub struct SyncSession {
    weak_self: Weak<SyncSession>,
    client: Arc<SyncClient>,
    user: Arc<dyn SyncUser>,
    stores: SessionStores,
    opener: Option<Arc<dyn StoreOpener>>,
    state: Mutex<FacadeState>,
    config: Mutex<SessionConfig>,
    external_reference: Mutex<Weak<ExternalReference>>,
    connection_state: Mutex<ConnectionState>,
    connection_notifier: ConnectionStateNotifier,
    progress_notifier: ProgressNotifier,
    error_handler: Mutex<Option<Box<dyn FnMut(SyncError) + Send>>>,
    test_command_handlers: Mutex<BTreeMap<RequestIdent, TestCommandHandler>>,
}

/// Keeps the session alive on behalf of the application; dropping the last
/// external reference closes the session.
pub struct ExternalReference {
    session: Arc<SyncSession>,
}

impl Drop for ExternalReference {
    fn drop(&mut self) {
        self.session.close();
    }
}

impl ExternalReference {
    pub fn session(&self) -> &Arc<SyncSession> {
        &self.session
    }
}

impl SyncSession {
    /// Create a session and bring it to `Active`. Fails when the server
    /// URL does not parse.
    pub fn create(
        client: Arc<SyncClient>,
        config: SessionConfig,
        stores: SessionStores,
        user: Arc<dyn SyncUser>,
        opener: Option<Arc<dyn StoreOpener>>,
    ) -> Result<Arc<Self>, UrlError> {
        ServerEndpoint::parse(&config.server_url, client.config())?;
        let session = Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            client,
            user,
            stores,
            opener,
            state: Mutex::new(FacadeState {
                state: SyncSessionState::Inactive,
                death_count: 0,
                session_ident: None,
                completion_callbacks: BTreeMap::new(),
                next_request_id: 1,
                reset_in_progress: false,
                pending_reset: None,
                fresh_download: None,
                attempted_refresh: false,
                migration_sentinel: None,
                config_after_migration: None,
            }),
            config: Mutex::new(config),
            external_reference: Mutex::new(Weak::new()),
            connection_state: Mutex::new(ConnectionState::Disconnected),
            connection_notifier: ConnectionStateNotifier::new(),
            progress_notifier: ProgressNotifier::new(),
            error_handler: Mutex::new(None),
            test_command_handlers: Mutex::new(BTreeMap::new()),
        });
        let guard = session.state.lock().unwrap();
        session.become_active(guard);
        Ok(session)
    }

    pub fn state(&self) -> SyncSessionState {
        self.state.lock().unwrap().state
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.lock().unwrap()
    }

    pub fn path(&self) -> std::path::PathBuf {
        self.config.lock().unwrap().store_path.clone()
    }

    pub fn user(&self) -> &Arc<dyn SyncUser> {
        &self.user
    }

    pub fn set_error_handler(&self, handler: Box<dyn FnMut(SyncError) + Send>) {
        *self.error_handler.lock().unwrap() = Some(handler);
    }

    /// Strong handle for the application; the session closes when the last
    /// one drops.
    pub fn external_reference(self: &Arc<Self>) -> Arc<ExternalReference> {
        let mut slot = self.external_reference.lock().unwrap();
        if let Some(existing) = slot.upgrade() {
            return existing;
        }
        let reference = Arc::new(ExternalReference {
            session: Arc::clone(self),
        });
        *slot = Arc::downgrade(&reference);
        reference
    }

    // -- lifecycle transitions ---------------------------------------------

    fn become_active(&self, mut guard: MutexGuard<'_, FacadeState>) {
        debug_assert_ne!(guard.state, SyncSessionState::Active);
        guard.state = SyncSessionState::Active;
        guard.attempted_refresh = false;
        guard.reset_in_progress = false;

        if guard.session_ident.is_none() {
            let ident = self.client.allocate_session_ident();
            guard.session_ident = Some(ident);

            let config = self.config.lock().unwrap().clone();
            let endpoint = match ServerEndpoint::parse(&config.server_url, self.client.config()) {
                Ok(endpoint) => endpoint,
                Err(error) => {
                    // Checked at creation; a configuration update may have
                    // made it invalid since.
                    tracing::error!(target: "sync", "invalid server URL on activation: {error}");
                    guard.session_ident = None;
                    self.do_become_inactive(
                        guard,
                        Status::new(StatusCode::RuntimeError, error.to_string()),
                    );
                    return;
                }
            };

            let weak = self.weak_self.clone();
            let sink = Arc::new(move |event: ClientEvent| {
                if let Some(session) = weak.upgrade() {
                    session.handle_client_event(event);
                }
            });

            let reset_operation = guard.pending_reset.take();
            let server_path = config.partition_value.clone().unwrap_or_default();
            self.client.bind_session(
                ident,
                BindSessionArgs {
                    endpoint,
                    mode: config.mode,
                    server_path,
                    user_id: self.user.user_id(),
                    stores: self.stores.clone(),
                    event_sink: sink,
                    reset_operation,
                },
            );
        }

        // Re-arm waits that survived a transient Inactive phase. A revive
        // from Dying may arm a redundant request; callbacks still fire
        // exactly once because delivery drains the table.
        let ident = guard.session_ident;
        let directions: Vec<ProgressDirection> = guard
            .completion_callbacks
            .values()
            .map(|(direction, _)| *direction)
            .collect();
        drop(guard);
        if let Some(ident) = ident {
            for direction in directions {
                self.register_wait_with_session(ident, direction);
            }
        }
        tracing::debug!(target: "sync", "sync session became active");
    }

    fn become_dying(&self, mut guard: MutexGuard<'_, FacadeState>) {
        debug_assert_ne!(guard.state, SyncSessionState::Dying);
        guard.state = SyncSessionState::Dying;

        if guard.session_ident.is_none() {
            // Without a session nothing can upload.
            self.do_become_inactive(guard, Status::OK);
            return;
        }

        guard.death_count += 1;
        let death_count = guard.death_count;
        let id = guard.next_request_id;
        guard.next_request_id += 1;
        let weak = self.weak_self.clone();
        let finalizer: CompletionCallback = Box::new(move |_status| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            let guard = session.state.lock().unwrap();
            if guard.state == SyncSessionState::Dying && guard.death_count == death_count {
                session.do_become_inactive(guard, Status::OK);
            }
        });
        guard
            .completion_callbacks
            .insert(id, (ProgressDirection::Upload, finalizer));
        let ident = guard.session_ident;
        drop(guard);
        if let Some(ident) = ident {
            self.register_wait_with_session(ident, ProgressDirection::Upload);
        }
        tracing::debug!(target: "sync", "sync session is dying");
    }

    fn do_become_inactive(&self, mut guard: MutexGuard<'_, FacadeState>, status: Status) {
        guard.state = SyncSessionState::Inactive;
        self.teardown(guard, status);
    }

    fn become_paused(&self, mut guard: MutexGuard<'_, FacadeState>) {
        debug_assert_ne!(guard.state, SyncSessionState::Paused);
        let old_state = guard.state;
        guard.state = SyncSessionState::Paused;
        if old_state == SyncSessionState::Inactive {
            return;
        }
        self.teardown(guard, Status::OK);
    }

    /// Drop the protocol session, flip the connection state and drain the
    /// waiters (unless a client reset moves them aside).
    fn teardown(&self, mut guard: MutexGuard<'_, FacadeState>, status: Status) {
        if let Some(ident) = guard.session_ident.take() {
            self.client.unbind_session(ident);
        }

        let callbacks = if guard.reset_in_progress {
            BTreeMap::new()
        } else {
            std::mem::take(&mut guard.completion_callbacks)
        };
        drop(guard);

        // The underlying session is gone; report the disconnect ourselves.
        let old_state = {
            let mut connection_state = self.connection_state.lock().unwrap();
            std::mem::replace(&mut *connection_state, ConnectionState::Disconnected)
        };
        if old_state != ConnectionState::Disconnected {
            self.connection_notifier
                .invoke_callbacks(old_state, ConnectionState::Disconnected);
        }

        let status = if status.is_ok() {
            Status::aborted("Sync session became inactive")
        } else {
            status
        };
        for (_, (_, callback)) in callbacks {
            callback(status.clone());
        }
    }

    // -- public operations -------------------------------------------------

    /// Close per the configured stop policy: `Immediately` goes straight to
    /// Inactive, `AfterChangesUploaded` lets pending uploads drain first,
    /// `LiveIndefinitely` ignores the call.
    pub fn close(&self) {
        let stop_policy = self.config.lock().unwrap().stop_policy;
        let guard = self.state.lock().unwrap();
        match guard.state {
            SyncSessionState::Active => match stop_policy {
                SessionStopPolicy::Immediately => self.do_become_inactive(guard, Status::OK),
                SessionStopPolicy::AfterChangesUploaded => self.become_dying(guard),
                SessionStopPolicy::LiveIndefinitely => {}
            },
            SyncSessionState::Dying | SyncSessionState::Inactive | SyncSessionState::Paused => {}
            SyncSessionState::WaitingForAccessToken => {
                self.do_become_inactive(guard, Status::OK);
            }
        }
    }

    /// Unconditionally drop to Inactive.
    pub fn force_close(&self) {
        let guard = self.state.lock().unwrap();
        match guard.state {
            SyncSessionState::Active
            | SyncSessionState::Dying
            | SyncSessionState::WaitingForAccessToken => {
                self.do_become_inactive(guard, Status::OK);
            }
            SyncSessionState::Inactive | SyncSessionState::Paused => {}
        }
    }

    /// Suspend sync until `resume()`. Every other state may enter Paused.
    pub fn pause(&self) {
        let guard = self.state.lock().unwrap();
        match guard.state {
            SyncSessionState::Paused => {}
            _ => self.become_paused(guard),
        }
    }

    /// Leave Paused; no other state reacts.
    pub fn resume(&self) {
        let guard = self.state.lock().unwrap();
        if guard.state == SyncSessionState::Paused {
            self.become_active(guard);
        }
    }

    /// Revive a Dying or Inactive session (new external reference).
    pub fn revive_if_needed(&self) {
        let guard = self.state.lock().unwrap();
        match guard.state {
            SyncSessionState::Dying | SyncSessionState::Inactive => self.become_active(guard),
            SyncSessionState::Active
            | SyncSessionState::Paused
            | SyncSessionState::WaitingForAccessToken => {}
        }
    }

    /// Tear down and rebuild the protocol session without surfacing a state
    /// change to completion waiters.
    pub fn restart_session(&self) {
        let guard = self.state.lock().unwrap();
        self.do_restart_session(guard);
    }

    fn do_restart_session(&self, mut guard: MutexGuard<'_, FacadeState>) {
        if guard.state == SyncSessionState::Paused {
            return;
        }
        // Straight to Inactive so completion waiters survive the rebuild.
        guard.state = SyncSessionState::Inactive;
        if let Some(ident) = guard.session_ident.take() {
            self.client.unbind_session(ident);
        }
        self.become_active(guard);
    }

    /// Replace the configuration snapshot and restart the transport; the
    /// session ends up Active with the new configuration.
    pub fn update_configuration(&self, new_config: SessionConfig) {
        {
            let mut config = self.config.lock().unwrap();
            *config = new_config;
        }
        let guard = self.state.lock().unwrap();
        match guard.state {
            SyncSessionState::Active => self.do_restart_session(guard),
            SyncSessionState::Inactive | SyncSessionState::Dying => self.become_active(guard),
            SyncSessionState::Paused | SyncSessionState::WaitingForAccessToken => {}
        }
    }

    /// A fresh token is available; revive if the session was waiting on it.
    pub fn update_access_token(&self, _signed_token: &str) {
        let guard = self.state.lock().unwrap();
        if guard.state == SyncSessionState::WaitingForAccessToken {
            self.become_active(guard);
        }
    }

    /// The application committed a local write.
    pub fn nonsync_transact_notify(&self, version: Version) {
        let guard = self.state.lock().unwrap();
        match guard.state {
            SyncSessionState::Active | SyncSessionState::WaitingForAccessToken => {
                if let Some(ident) = guard.session_ident {
                    self.client
                        .with_session(ident, move |session| session.recognize_sync_version(version));
                }
            }
            SyncSessionState::Dying | SyncSessionState::Inactive | SyncSessionState::Paused => {}
        }
    }

    /// Skip the reconnect backoff; when connected instead verify health
    /// with an urgent PING.
    pub fn handle_reconnect(&self) {
        let guard = self.state.lock().unwrap();
        if let Some(ident) = guard.session_ident {
            self.client.cancel_reconnect_delay(ident);
        }
    }

    // -- waits and notifiers -----------------------------------------------

    pub fn wait_for_upload_completion(&self, callback: CompletionCallback) {
        self.add_completion_callback(ProgressDirection::Upload, callback);
    }

    pub fn wait_for_download_completion(&self, callback: CompletionCallback) {
        self.add_completion_callback(ProgressDirection::Download, callback);
    }

    fn add_completion_callback(&self, direction: ProgressDirection, callback: CompletionCallback) {
        let mut guard = self.state.lock().unwrap();
        let id = guard.next_request_id;
        guard.next_request_id += 1;
        guard.completion_callbacks.insert(id, (direction, callback));
        let ident = guard.session_ident;
        drop(guard);
        if let Some(ident) = ident {
            self.register_wait_with_session(ident, direction);
        }
    }

    fn register_wait_with_session(&self, ident: SessionIdent, direction: ProgressDirection) {
        match direction {
            ProgressDirection::Upload => self.client.with_session(ident, |session| {
                session.request_upload_completion_notification()
            }),
            ProgressDirection::Download => self.client.with_session(ident, |session| {
                session.request_download_completion_notification()
            }),
        }
    }

    pub fn register_progress_notifier(
        &self,
        callback: ProgressCallback,
        direction: ProgressDirection,
        is_streaming: bool,
    ) -> ProgressToken {
        let snapshot = self
            .stores
            .history
            .lock()
            .unwrap()
            .transfer_progress()
            .snapshot_version;
        self.progress_notifier
            .register(callback, direction, is_streaming, snapshot)
    }

    pub fn unregister_progress_notifier(&self, token: ProgressToken) {
        self.progress_notifier.unregister(token);
    }

    pub fn register_connection_change_callback(
        &self,
        callback: ConnectionStateCallback,
    ) -> NotifierToken {
        self.connection_notifier.register(callback)
    }

    pub fn unregister_connection_change_callback(&self, token: NotifierToken) {
        self.connection_notifier.unregister(token);
    }

    /// Send a TEST_COMMAND; the handler receives the server's response.
    pub fn send_test_command(&self, body: String, handler: TestCommandHandler) {
        let guard = self.state.lock().unwrap();
        let Some(ident) = guard.session_ident else {
            return;
        };
        drop(guard);
        let weak = self.weak_self.clone();
        self.client.with_session(ident, move |session| {
            let (request_ident, actions) = session.send_test_command(body);
            if let Some(facade) = weak.upgrade() {
                facade
                    .test_command_handlers
                    .lock()
                    .unwrap()
                    .insert(request_ident, handler);
            }
            actions
        });
    }

    // -- event handling (loop thread) --------------------------------------

    fn handle_client_event(self: Arc<Self>, event: ClientEvent) {
        match event {
            ClientEvent::Session(event) => self.handle_session_event(event),
            ClientEvent::ConnectionStateChanged { old, new, error } => {
                {
                    let mut connection_state = self.connection_state.lock().unwrap();
                    *connection_state = new;
                }
                if old != new {
                    self.connection_notifier.invoke_callbacks(old, new);
                }
                if let Some(error) = error {
                    self.handle_error(*error);
                }
            }
        }
    }

    fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Suspended(info) => self.handle_error(info),
            SessionEvent::Resumed => {}
            SessionEvent::ErrorSurfaced(info) => {
                let error = SyncError::new(&info);
                self.invoke_error_handler(error);
            }
            SessionEvent::Progress(sample) => self.progress_notifier.update(sample),
            SessionEvent::UploadCompleted => {
                self.complete_waits(ProgressDirection::Upload, Status::OK);
            }
            SessionEvent::DownloadCompleted => {
                self.complete_waits(ProgressDirection::Download, Status::OK);
                self.check_migration_sentinel();
            }
            SessionEvent::QueryError(error) => {
                tracing::warn!(
                    target: "sync",
                    query_version = error.query_version,
                    "subscription query rejected: {}",
                    error.message
                );
            }
            SessionEvent::TestCommandResponse {
                request_ident,
                body,
            } => {
                let handler = self
                    .test_command_handlers
                    .lock()
                    .unwrap()
                    .remove(&request_ident);
                if let Some(handler) = handler {
                    handler(body);
                }
            }
            SessionEvent::PendingClientResetAcknowledged => {
                self.stores.history.lock().unwrap().acknowledge_client_reset();
            }
        }
    }

    fn complete_waits(&self, direction: ProgressDirection, status: Status) {
        let callbacks: Vec<CompletionCallback> = {
            let mut guard = self.state.lock().unwrap();
            let ids: Vec<u64> = guard
                .completion_callbacks
                .iter()
                .filter(|(_, (d, _))| *d == direction)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| guard.completion_callbacks.remove(&id))
                .map(|(_, callback)| callback)
                .collect()
        };
        for callback in callbacks {
            callback(status.clone());
        }
    }

    fn check_migration_sentinel(&self) {
        let sentinel = {
            let mut guard = self.state.lock().unwrap();
            guard.migration_sentinel.take()
        };
        if sentinel.is_some() {
            // All pre-migration data is uploaded; drop the sentinel and
            // restart into native flexible sync.
            if let Some(migration) = self.stores.migration.as_ref() {
                migration.cancel_migration();
            }
            self.restart_session();
        }
    }

    // -- error handling -----------------------------------------------------

    fn invoke_error_handler(&self, error: SyncError) {
        let mut handler = self.error_handler.lock().unwrap();
        if let Some(handler) = handler.as_mut() {
            handler(error);
        }
    }

    fn handle_error(&self, info: SessionErrorInfo) {
        let mut error = SyncError::new(&info);

        match info.server_requests_action {
            ServerRequestedAction::Transient => {
                // The session retries on its own schedule.
                return;
            }
            ServerRequestedAction::Warning => {
                if self.state() != SyncSessionState::Dying {
                    self.invoke_error_handler(error);
                }
                return;
            }
            ServerRequestedAction::ClientReset | ServerRequestedAction::ClientResetNoRecovery => {
                let resync_mode = self.config.lock().unwrap().client_resync_mode;
                if resync_mode == ClientResyncMode::Manual {
                    self.update_error_with_paths(&mut error);
                    error.is_fatal = true;
                    let guard = self.state.lock().unwrap();
                    self.do_become_inactive(guard, error.status.clone());
                    self.invoke_error_handler(error);
                    return;
                }
                self.download_fresh_store(info.server_requests_action);
                return;
            }
            ServerRequestedAction::MigrateToFlexibleSync => {
                if let Some(migration) = self.stores.migration.as_ref() {
                    let (partition, mut config) = {
                        let config = self.config.lock().unwrap();
                        (
                            config.partition_value.clone().unwrap_or_default(),
                            config.clone(),
                        )
                    };
                    let query = info.migration_query_string.clone().unwrap_or_default();
                    migration.migrate_to_flexible(&query, &partition);
                    config.mode = SyncMode::Flexible;
                    config.partition_value = None;
                    self.state.lock().unwrap().config_after_migration = Some(config);
                }
                self.download_fresh_store(info.server_requests_action);
                return;
            }
            ServerRequestedAction::RevertToPartitionSync => {
                if let Some(migration) = self.stores.migration.as_ref() {
                    migration.rollback_to_partition();
                    let mut config = self.config.lock().unwrap().clone();
                    config.mode = SyncMode::Partition;
                    if config.partition_value.is_none() {
                        config.partition_value = migration.migrated_partition();
                    }
                    self.state.lock().unwrap().config_after_migration = Some(config);
                }
                self.download_fresh_store(info.server_requests_action);
                return;
            }
            ServerRequestedAction::DeleteStore => {
                self.update_error_with_paths(&mut error);
                error.is_fatal = true;
                let guard = self.state.lock().unwrap();
                self.do_become_inactive(guard, error.status.clone());
                self.invoke_error_handler(error);
                return;
            }
            ServerRequestedAction::ProtocolViolation | ServerRequestedAction::ApplicationBug => {
                error.is_fatal = true;
                let guard = self.state.lock().unwrap();
                let dying = guard.state == SyncSessionState::Dying;
                self.do_become_inactive(guard, error.status.clone());
                if !dying {
                    self.invoke_error_handler(error);
                }
                return;
            }
            ServerRequestedAction::NoAction => {}
        }

        if info.status.code() == StatusCode::AuthError {
            self.handle_bad_auth(error);
            return;
        }

        let guard = self.state.lock().unwrap();
        let dying = guard.state == SyncSessionState::Dying;
        if info.is_fatal {
            self.do_become_inactive(guard, error.status.clone());
            // A dying session dies quietly.
            if !dying {
                self.invoke_error_handler(error);
            }
        } else {
            drop(guard);
            // Nonfatal: the protocol session is suspended and will resume
            // by itself; a Dying facade swallows the report entirely.
            if !dying {
                self.invoke_error_handler(error);
            }
        }
    }

    fn handle_bad_auth(&self, error: SyncError) {
        let attempted = {
            let mut guard = self.state.lock().unwrap();
            let attempted = guard.attempted_refresh;
            if !attempted {
                guard.attempted_refresh = true;
                if guard.state != SyncSessionState::WaitingForAccessToken {
                    guard.state = SyncSessionState::WaitingForAccessToken;
                }
            }
            attempted
        };

        if attempted {
            // Second failure of the same class: give up and log out.
            self.user.log_out();
            let guard = self.state.lock().unwrap();
            self.do_become_inactive(guard, error.status.clone());
            self.invoke_error_handler(error);
            return;
        }

        let weak = self.weak_self.clone();
        self.user.refresh_access_token(Box::new(move |result| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            // A session whose user was cleared mid-refresh ignores the
            // refresh result.
            if !session.user.is_logged_in() {
                return;
            }
            match result {
                Ok(token) => session.update_access_token(&token),
                Err(status) => {
                    session.user.log_out();
                    let guard = session.state.lock().unwrap();
                    session.do_become_inactive(guard, status.clone());
                    let info = SessionErrorInfo::new(status, true);
                    session.invoke_error_handler(SyncError::new(&info));
                }
            }
        }));
    }

    fn update_error_with_paths(&self, error: &mut SyncError) {
        let config = self.config.lock().unwrap();
        error.user_info.insert(
            SyncError::ORIGINAL_FILE_PATH_KEY.to_string(),
            config.store_path.display().to_string(),
        );
        let recovery_directory = config
            .recovery_directory
            .clone()
            .unwrap_or_else(|| config.store_path.parent().map(Into::into).unwrap_or_default());
        let backup = recovery_backup_path(&recovery_directory, time::OffsetDateTime::now_utc());
        error.user_info.insert(
            SyncError::RECOVERY_FILE_PATH_KEY.to_string(),
            backup.display().to_string(),
        );
    }

    // -- client reset -------------------------------------------------------

    fn download_fresh_store(&self, action: ServerRequestedAction) {
        let Some(opener) = self.opener.clone() else {
            self.fail_client_reset("no store opener configured for client reset");
            return;
        };

        let (fresh_path, fresh_config) = {
            let config = self.config.lock().unwrap();
            let fresh_path = fresh_path_for(&config.store_path);
            let mut fresh_config = config.clone();
            fresh_config.store_path = fresh_path.clone();
            // The fresh copy must never itself client-reset.
            fresh_config.client_resync_mode = ClientResyncMode::Manual;
            fresh_config.stop_policy = SessionStopPolicy::Immediately;
            (fresh_path, fresh_config)
        };

        let fresh_stores = match opener.open_store(&fresh_path) {
            Ok(stores) => stores,
            Err(status) => {
                self.fail_client_reset(&format!("failed to open fresh store: {status}"));
                return;
            }
        };

        // Mirror the active subscriptions so the fresh flexible-sync store
        // bootstraps the same view.
        if let (Some(subs), Some(fresh_subs)) = (
            self.stores.subscriptions.as_ref(),
            fresh_stores.subscriptions.as_ref(),
        ) {
            subs.mirror_to(fresh_subs.as_ref());
        }

        let sibling = match SyncSession::create(
            Arc::clone(&self.client),
            fresh_config,
            fresh_stores.clone(),
            Arc::clone(&self.user),
            None,
        ) {
            Ok(sibling) => sibling,
            Err(error) => {
                self.fail_client_reset(&format!("failed to start fresh download: {error}"));
                return;
            }
        };

        {
            let mut guard = self.state.lock().unwrap();
            guard.reset_in_progress = true;
            guard.fresh_download = Some(Arc::clone(&sibling));
        }

        tracing::info!(
            target: "sync",
            action = action.as_wire(),
            "downloading fresh store for client reset"
        );

        let weak = self.weak_self.clone();
        sibling.wait_for_download_completion(Box::new(move |status| {
            if let Some(session) = weak.upgrade() {
                session.handle_fresh_download_complete(status, action, fresh_stores);
            }
        }));
    }

    fn handle_fresh_download_complete(
        &self,
        status: Status,
        action: ServerRequestedAction,
        fresh_stores: SessionStores,
    ) {
        let sibling = {
            let mut guard = self.state.lock().unwrap();
            guard.fresh_download.take()
        };
        if let Some(sibling) = sibling {
            sibling.force_close();
        }

        if !status.is_ok() {
            self.fail_client_reset(&format!("fresh store download failed: {status}"));
            return;
        }

        let resync_mode = match action {
            ServerRequestedAction::ClientReset => self.config.lock().unwrap().client_resync_mode,
            _ => ClientResyncMode::DiscardLocal,
        };
        let recovery_allowed =
            action == ServerRequestedAction::ClientReset && resync_mode.recovery_is_allowed();
        let operation =
            ClientResetOperation::new(resync_mode, Some(fresh_stores), recovery_allowed);

        {
            let mut guard = self.state.lock().unwrap();
            guard.pending_reset = Some(operation);
        }

        // Rebuild the protocol session; the reset finalizes when the server
        // re-idents the file. Migration follow-ups run once Active again.
        self.restart_session();
        self.after_migration_restart(action);
    }

    fn after_migration_restart(&self, action: ServerRequestedAction) {
        let config_after_migration = {
            let mut guard = self.state.lock().unwrap();
            guard.config_after_migration.take()
        };

        match action {
            ServerRequestedAction::MigrateToFlexibleSync => {
                if let (Some(subs), Some(migration)) = (
                    self.stores.subscriptions.as_ref(),
                    self.stores.migration.as_ref(),
                ) {
                    migration.create_subscriptions(subs.as_ref());
                    let mut guard = self.state.lock().unwrap();
                    guard.migration_sentinel = migration.sentinel_query_version();
                }
            }
            ServerRequestedAction::RevertToPartitionSync => {
                if let Some(subs) = self.stores.subscriptions.as_ref() {
                    subs.clear();
                }
            }
            _ => {}
        }

        if let Some(config) = config_after_migration {
            self.update_configuration(config);
        }
    }

    fn fail_client_reset(&self, message: &str) {
        tracing::error!(target: "sync", "{message}");
        let info = SessionErrorInfo::from_client_error(
            ClientErrorCode::AutoClientResetFailure,
            message.to_string(),
            true,
        );
        let mut guard = self.state.lock().unwrap();
        guard.reset_in_progress = false;
        self.do_become_inactive(guard, info.status.clone());
        self.invoke_error_handler(SyncError::new(&info));
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        if let Some(ident) = self.state.lock().unwrap().session_ident.take() {
            self.client.unbind_session(ident);
        }
    }
}
