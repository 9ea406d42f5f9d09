//! Connection state machine.
//!
//! A connection owns one transport, multiplexes any number of sessions over
//! it, and runs the keepalive and reconnect machinery. Like the session it
//! is sans-IO: inputs are transport events, timer expiries and facade
//! commands; outputs are [`ConnectionAction`]s interpreted by the runtime.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rand::Rng;

use crate::client::backoff::{ConnectionTerminationReason, ReconnectDelay, ReconnectInfo};
use crate::client::endpoint::ServerEndpoint;
use crate::client::notifier::ConnectionState;
use crate::client::proto::{
    self, ClientMessage, Ping, ProtoLimits, ServerMessage, FLEXIBLE_PROTOCOL_PREFIX,
    PARTITION_PROTOCOL_PREFIX, PROTOCOL_VERSION_CURRENT, PROTOCOL_VERSION_OLDEST_SUPPORTED,
    ProtoDecodeError,
};
use crate::client::session::{Session, SessionAction, SessionEvent, SessionLifecycle};
use crate::client::transport::{TransportCloseKind, TransportEndpoint};
use crate::config::ClientConfig;
use crate::core::{
    ClientErrorCode, ErrorBody, SessionErrorInfo, SessionIdent, SyncMode, TimestampMs,
};

/// Timer slots of a connection. `ReconnectOrDisconnect` is shared between
/// the reconnect wait and the linger wait; the two never run concurrently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionTimer {
    ReconnectOrDisconnect,
    ConnectWatchdog,
    Heartbeat,
    Resumption(SessionIdent),
}

/// Instructions for the runtime.
#[derive(Debug)]
pub enum ConnectionAction {
    ConnectTransport(TransportEndpoint),
    CloseTransport,
    SendFrame(Vec<u8>),
    StartTimer {
        timer: ConnectionTimer,
        delay_ms: u64,
    },
    CancelTimer(ConnectionTimer),
    StateChanged {
        old: ConnectionState,
        new: ConnectionState,
        error: Option<SessionErrorInfo>,
    },
    SessionEvent {
        session: SessionIdent,
        event: SessionEvent,
    },
    RoundTripTime {
        rtt_ms: u64,
    },
    /// No active sessions remain while disconnected; the client may reap
    /// this connection.
    Idle,
}

pub struct ConnectionParams {
    pub ident: u64,
    pub endpoint: ServerEndpoint,
    pub mode: SyncMode,
    pub config: ClientConfig,
    pub limits: ProtoLimits,
}

pub struct Connection {
    ident: u64,
    endpoint: ServerEndpoint,
    mode: SyncMode,
    config: ClientConfig,
    limits: ProtoLimits,

    state: ConnectionState,
    activated: bool,
    force_closed: bool,

    sessions: BTreeMap<SessionIdent, Session>,
    session_history: BTreeSet<SessionIdent>,
    enlisted_to_send: VecDeque<SessionIdent>,
    sending_session: Option<SessionIdent>,
    sending: bool,
    num_active_sessions: usize,
    num_active_unsuspended_sessions: usize,

    reconnect_info: ReconnectInfo,
    reconnect_delay_in_progress: bool,
    nonzero_reconnect_delay: bool,
    disconnect_delay_in_progress: bool,
    disconnect_has_occurred: bool,
    disconnect_time: TimestampMs,

    ping_delay_in_progress: bool,
    waiting_for_pong: bool,
    send_ping: bool,
    minimize_next_ping_delay: bool,
    ping_after_scheduled_reset: bool,
    ping_sent: bool,
    last_ping_sent_at: TimestampMs,
    pong_wait_started_at: TimestampMs,
    previous_ping_rtt: u64,

    negotiated_protocol_version: u32,
}

impl Connection {
    pub fn new(params: ConnectionParams) -> Self {
        let reconnect_info = ReconnectInfo::new(
            params.config.reconnect_mode,
            params.config.reconnect_backoff,
        );
        Self {
            ident: params.ident,
            endpoint: params.endpoint,
            mode: params.mode,
            config: params.config,
            limits: params.limits,
            state: ConnectionState::Disconnected,
            activated: false,
            force_closed: false,
            sessions: BTreeMap::new(),
            session_history: BTreeSet::new(),
            enlisted_to_send: VecDeque::new(),
            sending_session: None,
            sending: false,
            num_active_sessions: 0,
            num_active_unsuspended_sessions: 0,
            reconnect_info,
            reconnect_delay_in_progress: false,
            nonzero_reconnect_delay: false,
            disconnect_delay_in_progress: false,
            disconnect_has_occurred: false,
            disconnect_time: 0,
            ping_delay_in_progress: false,
            waiting_for_pong: false,
            send_ping: false,
            minimize_next_ping_delay: false,
            ping_after_scheduled_reset: false,
            ping_sent: false,
            last_ping_sent_at: 0,
            pong_wait_started_at: 0,
            previous_ping_rtt: 0,
            negotiated_protocol_version: PROTOCOL_VERSION_CURRENT,
        }
    }

    pub fn ident(&self) -> u64 {
        self.ident
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_force_closed(&self) -> bool {
        self.force_closed
    }

    pub fn num_active_sessions(&self) -> usize {
        self.num_active_sessions
    }

    // -- activation and session registry ----------------------------------

    pub fn activate(&mut self) -> Vec<ConnectionAction> {
        self.activated = true;
        let mut out = Vec::new();
        if self.num_active_sessions == 0 {
            out.push(ConnectionAction::Idle);
        }
        // A prior connect failure may demand a delay before reconnecting.
        self.initiate_reconnect_wait(&mut out);
        out
    }

    pub fn activate_session(&mut self, mut session: Session, now: TimestampMs) -> Vec<ConnectionAction> {
        debug_assert!(!self.force_closed);
        let ident = session.ident();
        debug_assert!(!self.sessions.contains_key(&ident));
        self.session_history.insert(ident);

        let mut out = Vec::new();
        let actions = session.activate();
        self.sessions.insert(ident, session);
        self.num_active_sessions += 1;
        self.apply_session_actions(ident, actions, &mut out);

        if self.state == ConnectionState::Connected {
            let fast_reconnect = false;
            let actions = self
                .sessions
                .get_mut(&ident)
                .map(|session| session.connection_established(fast_reconnect))
                .unwrap_or_default();
            self.apply_session_actions(ident, actions, &mut out);
        }
        self.pump_send_at(now, &mut out);
        out
    }

    pub fn initiate_session_deactivation(
        &mut self,
        ident: SessionIdent,
        now: TimestampMs,
    ) -> Vec<ConnectionAction> {
        let mut out = Vec::new();
        let Some(session) = self.sessions.get_mut(&ident) else {
            return out;
        };
        debug_assert!(self.num_active_sessions > 0);
        let actions = session.initiate_deactivation();
        self.apply_session_actions(ident, actions, &mut out);
        self.num_active_sessions -= 1;
        if self.num_active_sessions == 0
            && self.activated
            && self.state == ConnectionState::Disconnected
        {
            out.push(ConnectionAction::Idle);
        }
        self.pump_send_at(now, &mut out);
        out
    }

    /// Run a facade command against one session, interpreting the actions.
    pub fn with_session(
        &mut self,
        ident: SessionIdent,
        now: TimestampMs,
        f: impl FnOnce(&mut Session) -> Vec<SessionAction>,
    ) -> Vec<ConnectionAction> {
        let mut out = Vec::new();
        let Some(session) = self.sessions.get_mut(&ident) else {
            return out;
        };
        let actions = f(session);
        self.apply_session_actions(ident, actions, &mut out);
        self.pump_send_at(now, &mut out);
        out
    }

    pub fn session(&self, ident: SessionIdent) -> Option<&Session> {
        self.sessions.get(&ident)
    }

    // -- reconnect management ----------------------------------------------

    pub fn cancel_reconnect_delay(&mut self, now: TimestampMs) -> Vec<ConnectionAction> {
        debug_assert!(self.activated);
        let mut out = Vec::new();

        if self.reconnect_delay_in_progress {
            if self.reconnect_info.reconnect_disallowed() {
                // The server told us to stay away; a user nudge does not
                // override that.
                return out;
            }
            if self.nonzero_reconnect_delay {
                tracing::debug!(target: "sync::conn", conn = self.ident, "canceling reconnect delay");
            }
            out.push(ConnectionAction::CancelTimer(
                ConnectionTimer::ReconnectOrDisconnect,
            ));
            self.reconnect_delay_in_progress = false;
            self.reconnect_info.reset();
            self.initiate_reconnect_wait(&mut out);
            return out;
        }

        if self.state != ConnectionState::Disconnected {
            // Ask the keepalive machinery to verify health: a PONG for the
            // urgent PING below re-arms the normal backoff, otherwise the
            // next delay is skipped.
            self.reconnect_info.scheduled_reset = true;
            self.ping_after_scheduled_reset = false;
            self.schedule_urgent_ping(now, &mut out);
        }
        out
    }

    pub fn force_close(&mut self, now: TimestampMs) -> Vec<ConnectionAction> {
        let mut out = Vec::new();
        if self.force_closed {
            return out;
        }
        self.force_closed = true;

        if self.state != ConnectionState::Disconnected {
            self.voluntary_disconnect(now, &mut out);
        }
        debug_assert_eq!(self.state, ConnectionState::Disconnected);

        if self.reconnect_delay_in_progress || self.disconnect_delay_in_progress {
            out.push(ConnectionAction::CancelTimer(
                ConnectionTimer::ReconnectOrDisconnect,
            ));
            self.reconnect_delay_in_progress = false;
            self.disconnect_delay_in_progress = false;
        }

        let active: Vec<SessionIdent> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.state() == SessionLifecycle::Active)
            .map(|(ident, _)| *ident)
            .collect();
        for ident in active {
            let actions = self
                .sessions
                .get_mut(&ident)
                .map(|session| session.force_close())
                .unwrap_or_default();
            self.apply_session_actions(ident, actions, &mut out);
        }
        tracing::debug!(target: "sync::conn", conn = self.ident, "force closed connection");
        out
    }

    fn initiate_reconnect_wait(&mut self, out: &mut Vec<ConnectionAction>) {
        debug_assert!(self.activated);
        debug_assert!(!self.reconnect_delay_in_progress);
        debug_assert!(!self.disconnect_delay_in_progress);
        if self.force_closed {
            return;
        }

        self.reconnect_delay_in_progress = true;
        match self.reconnect_info.delay_interval() {
            ReconnectDelay::Indefinite => {
                tracing::debug!(target: "sync::conn", conn = self.ident, "reconnection delayed indefinitely");
                self.nonzero_reconnect_delay = true;
                // No timer: an indefinite wait.
            }
            ReconnectDelay::Immediate => {
                self.nonzero_reconnect_delay = false;
                out.push(ConnectionAction::StartTimer {
                    timer: ConnectionTimer::ReconnectOrDisconnect,
                    delay_ms: 0,
                });
            }
            ReconnectDelay::After(delay_ms) => {
                tracing::debug!(
                    target: "sync::conn",
                    conn = self.ident,
                    delay_ms,
                    "allowing reconnection after delay"
                );
                self.nonzero_reconnect_delay = true;
                out.push(ConnectionAction::StartTimer {
                    timer: ConnectionTimer::ReconnectOrDisconnect,
                    delay_ms,
                });
            }
        }
    }

    fn initiate_reconnect(&mut self, out: &mut Vec<ConnectionAction>) {
        debug_assert!(self.activated);
        let old = self.state;
        self.state = ConnectionState::Connecting;
        out.push(ConnectionAction::StateChanged {
            old,
            new: ConnectionState::Connecting,
            error: None,
        });

        let prefix = self.protocol_prefix();
        let subprotocols: Vec<String> = (PROTOCOL_VERSION_OLDEST_SUPPORTED
            ..=PROTOCOL_VERSION_CURRENT)
            .rev()
            .map(|version| format!("{prefix}{version}"))
            .collect();

        tracing::info!(
            target: "sync::conn",
            conn = self.ident,
            endpoint = %self.endpoint,
            "connecting"
        );

        out.push(ConnectionAction::ConnectTransport(TransportEndpoint {
            address: self.endpoint.address.clone(),
            port: self.endpoint.port,
            http_path: self.endpoint.path.clone(),
            subprotocols,
            is_ssl: self.endpoint.envelope.is_ssl(),
        }));
        // Watchdog over the whole connect (transport and handshake).
        out.push(ConnectionAction::StartTimer {
            timer: ConnectionTimer::ConnectWatchdog,
            delay_ms: self.config.connect_timeout,
        });
    }

    fn protocol_prefix(&self) -> &'static str {
        if self.mode.is_flexible() {
            FLEXIBLE_PROTOCOL_PREFIX
        } else {
            PARTITION_PROTOCOL_PREFIX
        }
    }

    fn initiate_disconnect_wait(&mut self, out: &mut Vec<ConnectionAction>) {
        debug_assert!(!self.reconnect_delay_in_progress);
        if self.disconnect_delay_in_progress {
            out.push(ConnectionAction::CancelTimer(
                ConnectionTimer::ReconnectOrDisconnect,
            ));
        }
        out.push(ConnectionAction::StartTimer {
            timer: ConnectionTimer::ReconnectOrDisconnect,
            delay_ms: self.config.connection_linger_time,
        });
        self.disconnect_delay_in_progress = true;
    }

    // -- timers -------------------------------------------------------------

    pub fn handle_timer(&mut self, timer: ConnectionTimer, now: TimestampMs) -> Vec<ConnectionAction> {
        let mut out = Vec::new();
        match timer {
            ConnectionTimer::ReconnectOrDisconnect => {
                if self.reconnect_delay_in_progress {
                    self.reconnect_delay_in_progress = false;
                    if self.num_active_unsuspended_sessions > 0 {
                        self.initiate_reconnect(&mut out);
                    }
                } else if self.disconnect_delay_in_progress {
                    self.disconnect_delay_in_progress = false;
                    debug_assert_ne!(self.state, ConnectionState::Disconnected);
                    if self.num_active_unsuspended_sessions == 0 {
                        if self.config.connection_linger_time > 0 {
                            tracing::debug!(target: "sync::conn", conn = self.ident, "linger time expired");
                        }
                        self.voluntary_disconnect(now, &mut out);
                    }
                }
            }
            ConnectionTimer::ConnectWatchdog => {
                debug_assert_eq!(self.state, ConnectionState::Connecting);
                tracing::info!(target: "sync::conn", conn = self.ident, "connect timeout");
                let info = SessionErrorInfo::from_client_error(
                    ClientErrorCode::ConnectTimeout,
                    ClientErrorCode::ConnectTimeout.message().to_string(),
                    false,
                );
                self.involuntary_disconnect(
                    info,
                    ConnectionTerminationReason::SyncConnectTimeout,
                    now,
                    &mut out,
                );
            }
            ConnectionTimer::Heartbeat => {
                if self.ping_delay_in_progress {
                    self.handle_ping_delay(now, &mut out);
                } else if self.waiting_for_pong {
                    tracing::debug!(target: "sync::conn", conn = self.ident, "timeout waiting for PONG");
                    let info = SessionErrorInfo::from_client_error(
                        ClientErrorCode::PongTimeout,
                        ClientErrorCode::PongTimeout.message().to_string(),
                        false,
                    );
                    self.involuntary_disconnect(
                        info,
                        ConnectionTerminationReason::PongTimeout,
                        now,
                        &mut out,
                    );
                }
            }
            ConnectionTimer::Resumption(ident) => {
                let connected = self.state == ConnectionState::Connected;
                let actions = self
                    .sessions
                    .get_mut(&ident)
                    .map(|session| session.cancel_resumption_delay(connected))
                    .unwrap_or_default();
                self.apply_session_actions(ident, actions, &mut out);
                self.pump_send_at(now, &mut out);
            }
        }
        out
    }

    // -- keepalive ----------------------------------------------------------

    fn schedule_urgent_ping(&mut self, now: TimestampMs, out: &mut Vec<ConnectionAction>) {
        debug_assert_ne!(self.state, ConnectionState::Disconnected);
        if self.ping_delay_in_progress {
            out.push(ConnectionAction::CancelTimer(ConnectionTimer::Heartbeat));
            self.ping_delay_in_progress = false;
            self.minimize_next_ping_delay = true;
            self.initiate_ping_delay(now, out);
            return;
        }
        debug_assert!(self.state == ConnectionState::Connecting || self.waiting_for_pong);
        if !self.send_ping {
            self.minimize_next_ping_delay = true;
        }
    }

    fn initiate_ping_delay(&mut self, now: TimestampMs, out: &mut Vec<ConnectionAction>) {
        debug_assert!(!self.ping_delay_in_progress);
        debug_assert!(!self.waiting_for_pong);
        debug_assert!(!self.send_ping);

        let mut delay = 0;
        if !self.minimize_next_ping_delay {
            delay = self.config.ping_keepalive_period;
            // Randomized deduction (all of it for the first PING, a tenth
            // afterwards) spreads PINGs of many clients over time.
            let max_deduction = if self.ping_sent { delay / 10 } else { delay };
            if max_deduction > 0 {
                delay -= rand::thread_rng().gen_range(0..=max_deduction);
            }
            // Time already spent waiting counts against the delay.
            let spent = now.saturating_sub(self.pong_wait_started_at);
            delay = delay.saturating_sub(spent);
        } else {
            self.minimize_next_ping_delay = false;
        }

        self.ping_delay_in_progress = true;
        out.push(ConnectionAction::StartTimer {
            timer: ConnectionTimer::Heartbeat,
            delay_ms: delay,
        });
        tracing::debug!(target: "sync::conn", conn = self.ident, delay_ms = delay, "will emit a PING");
    }

    fn handle_ping_delay(&mut self, now: TimestampMs, out: &mut Vec<ConnectionAction>) {
        debug_assert!(self.ping_delay_in_progress);
        self.ping_delay_in_progress = false;
        self.send_ping = true;

        // Pong watchdog.
        debug_assert!(!self.waiting_for_pong);
        self.waiting_for_pong = true;
        self.pong_wait_started_at = now;
        out.push(ConnectionAction::StartTimer {
            timer: ConnectionTimer::Heartbeat,
            delay_ms: self.config.pong_keepalive_timeout,
        });

        if self.state == ConnectionState::Connected && !self.sending {
            self.pump_send_at(now, out);
        }
    }

    fn receive_pong(&mut self, timestamp: TimestampMs, now: TimestampMs, out: &mut Vec<ConnectionAction>) {
        tracing::debug!(target: "sync::conn", conn = self.ident, timestamp, "received PONG");

        let legal = self.waiting_for_pong && !self.send_ping;
        if !legal {
            self.close_due_to_protocol_error(ClientErrorCode::BadMessageOrder, now, out);
            return;
        }
        if timestamp != self.last_ping_sent_at {
            self.close_due_to_protocol_error(ClientErrorCode::BadTimestamp, now, out);
            return;
        }

        let rtt = now.saturating_sub(timestamp);
        tracing::debug!(target: "sync::conn", conn = self.ident, rtt_ms = rtt, "round trip time");
        self.previous_ping_rtt = rtt;

        // A PONG for a PING sent after cancel_reconnect_delay() proves the
        // connection healthy: keep the normal backoff.
        if self.ping_after_scheduled_reset {
            debug_assert!(self.reconnect_info.scheduled_reset);
            self.ping_after_scheduled_reset = false;
            self.reconnect_info.scheduled_reset = false;
        }

        out.push(ConnectionAction::CancelTimer(ConnectionTimer::Heartbeat));
        self.waiting_for_pong = false;
        self.initiate_ping_delay(now, out);
        out.push(ConnectionAction::RoundTripTime { rtt_ms: rtt });
    }

    // -- transport events ----------------------------------------------------

    pub fn handle_transport_connected(
        &mut self,
        subprotocol: &str,
        now: TimestampMs,
    ) -> Vec<ConnectionAction> {
        let mut out = Vec::new();
        let prefix = self.protocol_prefix();
        let version = subprotocol
            .strip_prefix(prefix)
            .and_then(|rest| rest.parse::<u32>().ok());
        match version {
            Some(version)
                if (PROTOCOL_VERSION_OLDEST_SUPPORTED..=PROTOCOL_VERSION_CURRENT)
                    .contains(&version) =>
            {
                tracing::debug!(
                    target: "sync::conn",
                    conn = self.ident,
                    version,
                    "negotiated protocol version"
                );
                self.negotiated_protocol_version = version;
                self.handle_connection_established(now, &mut out);
            }
            _ => {
                tracing::error!(
                    target: "sync::conn",
                    conn = self.ident,
                    subprotocol,
                    "bad protocol info from server"
                );
                let info = SessionErrorInfo::from_client_error(
                    ClientErrorCode::BadProtocolFromServer,
                    ClientErrorCode::BadProtocolFromServer.message().to_string(),
                    true,
                );
                self.involuntary_disconnect(
                    info,
                    ConnectionTerminationReason::BadHeadersInHttpResponse,
                    now,
                    &mut out,
                );
            }
        }
        out
    }

    fn handle_connection_established(&mut self, now: TimestampMs, out: &mut Vec<ConnectionAction>) {
        out.push(ConnectionAction::CancelTimer(ConnectionTimer::ConnectWatchdog));
        let old = self.state;
        self.state = ConnectionState::Connected;

        self.pong_wait_started_at = now;
        self.initiate_ping_delay(now, out);

        let fast_reconnect = self.disconnect_has_occurred
            && now.saturating_sub(self.disconnect_time) <= self.config.fast_reconnect_limit;

        let idents: Vec<SessionIdent> = self.sessions.keys().copied().collect();
        for ident in idents {
            let actions = self
                .sessions
                .get_mut(&ident)
                .map(|session| session.connection_established(fast_reconnect))
                .unwrap_or_default();
            self.apply_session_actions(ident, actions, out);
        }

        out.push(ConnectionAction::StateChanged {
            old,
            new: ConnectionState::Connected,
            error: None,
        });
        self.pump_send_at(now, out);
    }

    pub fn handle_transport_closed(
        &mut self,
        was_clean: bool,
        kind: TransportCloseKind,
        reason: &str,
        now: TimestampMs,
    ) -> Vec<ConnectionAction> {
        let mut out = Vec::new();
        if self.force_closed {
            tracing::debug!(target: "sync::conn", conn = self.ident, "transport closed after force close");
            return out;
        }
        tracing::info!(
            target: "sync::conn",
            conn = self.ident,
            was_clean,
            kind = ?kind,
            "transport closed: {reason}"
        );

        use TransportCloseKind::*;
        let (code, is_fatal, termination) = match kind {
            Normal => {
                self.voluntary_disconnect(now, &mut out);
                return out;
            }
            ResolveFailed | ConnectionFailed => (
                ClientErrorCode::ConnectionClosed,
                false,
                ConnectionTerminationReason::ConnectOperationFailed,
            ),
            ReadError => (
                ClientErrorCode::ConnectionClosed,
                false,
                ConnectionTerminationReason::ReadOrWriteError,
            ),
            WriteError => (
                ClientErrorCode::ConnectionClosed,
                false,
                ConnectionTerminationReason::ReadOrWriteError,
            ),
            ProtocolError | MessageTooBig => (
                ClientErrorCode::LimitsExceeded,
                false,
                ConnectionTerminationReason::TransportProtocolViolation,
            ),
            TlsHandshakeFailed => (
                ClientErrorCode::SslServerCertRejected,
                false,
                ConnectionTerminationReason::SslCertificateRejected,
            ),
            ClientTooOld => (
                ClientErrorCode::ClientTooOldForServer,
                true,
                ConnectionTerminationReason::HttpResponseSaysFatalError,
            ),
            ClientTooNew => (
                ClientErrorCode::ClientTooNewForServer,
                true,
                ConnectionTerminationReason::HttpResponseSaysFatalError,
            ),
            ProtocolMismatch => (
                ClientErrorCode::ProtocolMismatch,
                true,
                ConnectionTerminationReason::HttpResponseSaysFatalError,
            ),
            Forbidden => (
                ClientErrorCode::ConnectionClosed,
                true,
                ConnectionTerminationReason::HttpResponseSaysFatalError,
            ),
            Unauthorized | MovedPermanently | InternalServerError | AbnormalClosure
            | RetryError => (
                ClientErrorCode::ConnectionClosed,
                false,
                ConnectionTerminationReason::HttpResponseSaysNonfatalError,
            ),
        };

        let message = format!("{}: {reason}", code.message());
        let info = SessionErrorInfo::from_client_error(code, message, is_fatal);
        self.involuntary_disconnect(info, termination, now, &mut out);
        out
    }

    pub fn handle_write_complete(&mut self, now: TimestampMs) -> Vec<ConnectionAction> {
        let mut out = Vec::new();
        if self.state != ConnectionState::Connected {
            return out;
        }
        self.sending = false;
        if let Some(ident) = self.sending_session.take() {
            let actions = self
                .sessions
                .get_mut(&ident)
                .map(|session| session.message_sent())
                .unwrap_or_default();
            self.apply_session_actions(ident, actions, &mut out);
        }
        self.pump_send_at(now, &mut out);
        out
    }

    // -- inbound dispatch ----------------------------------------------------

    pub fn handle_frame(&mut self, frame: &[u8], now: TimestampMs) -> Vec<ConnectionAction> {
        let mut out = Vec::new();
        let message = match proto::decode_server_message(frame, &self.limits) {
            Ok(message) => message,
            Err(error) => {
                tracing::error!(
                    target: "sync::conn",
                    conn = self.ident,
                    "failed to parse incoming message: {error}"
                );
                let code = match error {
                    ProtoDecodeError::UnknownMessageType(_) => ClientErrorCode::UnknownMessage,
                    ProtoDecodeError::DecodeLimit(_) => ClientErrorCode::LimitsExceeded,
                    _ => ClientErrorCode::BadSyntax,
                };
                self.close_due_to_protocol_error(code, now, &mut out);
                return out;
            }
        };

        match message {
            ServerMessage::Pong(pong) => {
                self.receive_pong(pong.timestamp, now, &mut out);
            }
            ServerMessage::Ident(m) => {
                self.dispatch_to_session(m.session_ident, "IDENT", now, &mut out, |session| {
                    session.receive_ident(m.file_ident)
                });
            }
            ServerMessage::Download(m) => {
                self.dispatch_to_session(m.session_ident, "DOWNLOAD", now, &mut out, |session| {
                    session.receive_download(m)
                });
            }
            ServerMessage::Mark(m) => {
                self.dispatch_to_session(m.session_ident, "MARK", now, &mut out, |session| {
                    session.receive_mark(m.request_ident)
                });
            }
            ServerMessage::Unbound(m) => {
                self.dispatch_to_session(m.session_ident, "UNBOUND", now, &mut out, |session| {
                    session.receive_unbound()
                });
            }
            ServerMessage::QueryError(m) => {
                if m.session_ident == 0 {
                    self.close_due_to_protocol_error(ClientErrorCode::BadSessionIdent, now, &mut out);
                } else if !self.mode.is_flexible() {
                    self.close_due_to_protocol_error(
                        ClientErrorCode::BadProtocolFromServer,
                        now,
                        &mut out,
                    );
                } else {
                    self.dispatch_to_session(
                        m.session_ident,
                        "QUERY_ERROR",
                        now,
                        &mut out,
                        |session| {
                            session.receive_query_error(m.error_code, m.message, m.query_version)
                        },
                    );
                }
            }
            ServerMessage::TestResponse(m) => {
                self.dispatch_to_session(
                    m.session_ident,
                    "TEST_RESPONSE",
                    now,
                    &mut out,
                    |session| session.receive_test_response(m.request_ident, m.body),
                );
            }
            ServerMessage::Error(m) => {
                if m.session_ident != 0 {
                    self.dispatch_to_session(m.session_ident, "ERROR", now, &mut out, |session| {
                        session.receive_error(m.body)
                    });
                } else {
                    self.receive_connection_error(m.body, now, &mut out);
                }
            }
        }
        out
    }

    fn dispatch_to_session(
        &mut self,
        ident: SessionIdent,
        message: &str,
        now: TimestampMs,
        out: &mut Vec<ConnectionAction>,
        f: impl FnOnce(&mut Session) -> Result<Vec<SessionAction>, ClientErrorCode>,
    ) {
        if ident == 0 {
            self.close_due_to_protocol_error(ClientErrorCode::BadSessionIdent, now, out);
            return;
        }
        let Some(session) = self.sessions.get_mut(&ident) else {
            if self.session_history.contains(&ident) {
                tracing::debug!(
                    target: "sync::conn",
                    conn = self.ident,
                    session = ident,
                    "dropping {message} message for closed session"
                );
            } else {
                tracing::error!(
                    target: "sync::conn",
                    conn = self.ident,
                    session = ident,
                    "bad session identifier in {message} message"
                );
                self.close_due_to_protocol_error(ClientErrorCode::BadSessionIdent, now, out);
            }
            return;
        };

        match f(session) {
            Ok(actions) => {
                self.apply_session_actions(ident, actions, out);
                self.pump_send_at(now, out);
            }
            Err(code) => {
                tracing::error!(
                    target: "sync::conn",
                    conn = self.ident,
                    session = ident,
                    "protocol error in {message} message: {code}"
                );
                self.close_due_to_protocol_error(code, now, out);
            }
        }
    }

    fn receive_connection_error(
        &mut self,
        body: ErrorBody,
        now: TimestampMs,
        out: &mut Vec<ConnectionAction>,
    ) {
        tracing::info!(
            target: "sync::conn",
            conn = self.ident,
            error_code = body.raw_code,
            try_again = body.try_again,
            "received connection-level ERROR: {}",
            body.message
        );

        match body.code() {
            Some(code) if !code.is_session_level() => {
                let reason = if body.try_again {
                    ConnectionTerminationReason::ServerSaidTryAgainLater
                } else {
                    ConnectionTerminationReason::ServerSaidDoNotReconnect
                };
                let info = SessionErrorInfo::from_error_body(&body);
                self.involuntary_disconnect(info, reason, now, out);
            }
            Some(_) => {
                tracing::error!(target: "sync::conn", conn = self.ident, "not a connection-level error code");
                self.close_due_to_protocol_error(ClientErrorCode::BadErrorCode, now, out);
            }
            None => {
                tracing::error!(target: "sync::conn", conn = self.ident, "unknown error code");
                self.close_due_to_protocol_error(ClientErrorCode::BadErrorCode, now, out);
            }
        }
    }

    // -- disconnect ----------------------------------------------------------

    fn close_due_to_protocol_error(
        &mut self,
        code: ClientErrorCode,
        now: TimestampMs,
        out: &mut Vec<ConnectionAction>,
    ) {
        let info =
            SessionErrorInfo::from_client_error(code, code.message().to_string(), true);
        self.involuntary_disconnect(
            info,
            ConnectionTerminationReason::SyncProtocolViolation,
            now,
            out,
        );
    }

    fn involuntary_disconnect(
        &mut self,
        info: SessionErrorInfo,
        reason: ConnectionTerminationReason,
        now: TimestampMs,
        out: &mut Vec<ConnectionAction>,
    ) {
        self.reconnect_info
            .update(reason, info.resumption_delay_interval);
        self.disconnect(Some(info), now, out);
    }

    fn voluntary_disconnect(&mut self, now: TimestampMs, out: &mut Vec<ConnectionAction>) {
        self.reconnect_info
            .update(ConnectionTerminationReason::ClosedVoluntarily, None);
        self.disconnect(None, now, out);
    }

    fn disconnect(
        &mut self,
        error: Option<SessionErrorInfo>,
        now: TimestampMs,
        out: &mut Vec<ConnectionAction>,
    ) {
        out.push(ConnectionAction::CancelTimer(ConnectionTimer::ConnectWatchdog));

        if self.state == ConnectionState::Connected {
            self.disconnect_time = now;
            self.disconnect_has_occurred = true;

            let idents: Vec<SessionIdent> = self.sessions.keys().copied().collect();
            for ident in idents {
                let actions = self
                    .sessions
                    .get_mut(&ident)
                    .map(|session| session.connection_lost())
                    .unwrap_or_default();
                self.apply_session_actions(ident, actions, out);
            }
            // Sessions that were never activated or finished deactivating
            // are discarded with the connection.
            self.sessions.retain(|_, session| {
                !matches!(
                    session.state(),
                    SessionLifecycle::Unactivated | SessionLifecycle::Deactivated
                )
            });
        }

        let old = self.state;
        self.state = ConnectionState::Disconnected;

        self.ping_delay_in_progress = false;
        self.waiting_for_pong = false;
        self.send_ping = false;
        self.minimize_next_ping_delay = false;
        self.ping_after_scheduled_reset = false;
        self.ping_sent = false;
        self.previous_ping_rtt = 0;
        out.push(ConnectionAction::CancelTimer(ConnectionTimer::Heartbeat));

        self.sending_session = None;
        self.enlisted_to_send.clear();
        self.sending = false;
        out.push(ConnectionAction::CloseTransport);

        if old != ConnectionState::Disconnected {
            tracing::info!(target: "sync::conn", conn = self.ident, "disconnected");
        }
        out.push(ConnectionAction::StateChanged {
            old,
            new: ConnectionState::Disconnected,
            error,
        });
        self.initiate_reconnect_wait(out);
    }

    // -- write queue ---------------------------------------------------------

    fn pump_send_at(&mut self, now: TimestampMs, out: &mut Vec<ConnectionAction>) {
        if self.state != ConnectionState::Connected {
            return;
        }
        while !self.sending {
            if self.send_ping {
                self.write_ping(now, out);
                continue;
            }
            let Some(ident) = self.enlisted_to_send.pop_front() else {
                return;
            };
            let Some(session) = self.sessions.get_mut(&ident) else {
                continue;
            };
            let (message, actions) = session.produce_message();
            let deactivated = session.state() == SessionLifecycle::Deactivated;
            if let Some(message) = message {
                match proto::encode_client_message(self.negotiated_protocol_version, &message) {
                    Ok(frame) => {
                        self.sending = true;
                        self.sending_session = Some(ident);
                        out.push(ConnectionAction::SendFrame(frame));
                    }
                    Err(error) => {
                        tracing::error!(
                            target: "sync::conn",
                            conn = self.ident,
                            session = ident,
                            "failed to encode outgoing message: {error}"
                        );
                    }
                }
            }
            self.apply_session_actions(ident, actions, out);
            if deactivated {
                self.finish_session_deactivation(ident);
            }
            // A session that chose not to send passes the opportunity on.
        }
    }

    fn write_ping(&mut self, now: TimestampMs, out: &mut Vec<ConnectionAction>) {
        debug_assert!(!self.ping_delay_in_progress);
        debug_assert!(self.waiting_for_pong);
        debug_assert!(self.send_ping);

        self.send_ping = false;
        if self.reconnect_info.scheduled_reset {
            self.ping_after_scheduled_reset = true;
        }

        self.last_ping_sent_at = now;
        tracing::debug!(
            target: "sync::conn",
            conn = self.ident,
            timestamp = self.last_ping_sent_at,
            rtt = self.previous_ping_rtt,
            "sending PING"
        );
        let message = ClientMessage::Ping(Ping {
            timestamp: self.last_ping_sent_at,
            rtt: self.previous_ping_rtt,
        });
        match proto::encode_client_message(self.negotiated_protocol_version, &message) {
            Ok(frame) => {
                self.sending = true;
                // PINGs are connection-scoped: no sending session.
                debug_assert!(self.sending_session.is_none());
                out.push(ConnectionAction::SendFrame(frame));
            }
            Err(error) => {
                tracing::error!(target: "sync::conn", conn = self.ident, "failed to encode PING: {error}");
            }
        }
        self.ping_sent = true;
    }

    // -- session action interpretation --------------------------------------

    fn apply_session_actions(
        &mut self,
        ident: SessionIdent,
        actions: Vec<SessionAction>,
        out: &mut Vec<ConnectionAction>,
    ) {
        for action in actions {
            match action {
                SessionAction::Enlist => {
                    if self.state == ConnectionState::Connected {
                        self.enlisted_to_send.push_back(ident);
                    }
                }
                SessionAction::Event(event) => {
                    out.push(ConnectionAction::SessionEvent {
                        session: ident,
                        event,
                    });
                }
                SessionAction::StartResumptionTimer { delay_ms } => {
                    out.push(ConnectionAction::StartTimer {
                        timer: ConnectionTimer::Resumption(ident),
                        delay_ms,
                    });
                }
                SessionAction::UnsuspendedDelta(delta) => {
                    self.adjust_unsuspended_count(delta, out);
                }
                SessionAction::Deactivated => {
                    self.finish_session_deactivation(ident);
                }
            }
        }
    }

    fn adjust_unsuspended_count(&mut self, delta: i8, out: &mut Vec<ConnectionAction>) {
        if delta > 0 {
            self.num_active_unsuspended_sessions += 1;
            if self.num_active_unsuspended_sessions == 1
                && self.activated
                && self.state == ConnectionState::Disconnected
                && !self.reconnect_delay_in_progress
            {
                self.initiate_reconnect_wait(out);
            }
        } else {
            debug_assert!(self.num_active_unsuspended_sessions > 0);
            self.num_active_unsuspended_sessions -= 1;
            if self.num_active_unsuspended_sessions == 0
                && self.state != ConnectionState::Disconnected
                && !self.reconnect_delay_in_progress
            {
                self.initiate_disconnect_wait(out);
            }
        }
    }

    fn finish_session_deactivation(&mut self, ident: SessionIdent) {
        // Once unbound cleanly, any further message for the ident is a
        // protocol violation rather than a late straggler.
        self.sessions.remove(&ident);
        self.session_history.remove(&ident);
        self.enlisted_to_send.retain(|queued| *queued != ident);
        if self.sending_session == Some(ident) {
            self.sending_session = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::client::proto::{decode_client_message, encode_server_message, MarkResponse, Pong};
    use crate::client::session::SessionParams;
    use crate::config::ReconnectBackoff;
    use crate::core::{
        DownloadBatchState, SaltedFileIdent, Status, StatusCode, SyncProgress,
    };
    use crate::replication::{
        HistoryStatus, ReplicationHistory, SessionStores, UploadableChangesets,
    };

    struct NullHistory;

    impl ReplicationHistory for NullHistory {
        fn status(&self) -> HistoryStatus {
            HistoryStatus {
                file_ident: SaltedFileIdent::new(7, 1234),
                ..HistoryStatus::default()
            }
        }

        fn set_file_ident(&mut self, _file_ident: SaltedFileIdent) {}

        fn uploadable_changesets(
            &mut self,
            progress: crate::core::UploadCursor,
            target_version: crate::core::Version,
        ) -> UploadableChangesets {
            UploadableChangesets {
                progress: crate::core::UploadCursor {
                    client_version: target_version,
                    ..progress
                },
                locked_server_version: 0,
                changesets: Vec::new(),
            }
        }

        fn integrate_server_changesets(
            &mut self,
            _progress: &SyncProgress,
            _downloadable_bytes: u64,
            _changesets: &[crate::core::RemoteChangeset],
            _batch_state: DownloadBatchState,
        ) -> Result<crate::core::VersionInfo, crate::core::IntegrationError> {
            Ok(crate::core::VersionInfo::default())
        }

        fn set_sync_progress(
            &mut self,
            _progress: &SyncProgress,
            _downloadable_bytes: u64,
        ) -> Result<crate::core::VersionInfo, crate::core::IntegrationError> {
            Ok(crate::core::VersionInfo::default())
        }

        fn transfer_progress(&self) -> crate::core::TransferProgress {
            crate::core::TransferProgress::default()
        }

        fn perform_client_reset(
            &mut self,
            _file_ident: SaltedFileIdent,
            _fresh: &mut dyn ReplicationHistory,
            _mode: crate::config::ClientResyncMode,
            _recovery_allowed: bool,
        ) -> Result<bool, crate::core::IntegrationError> {
            Ok(false)
        }
    }

    fn test_config() -> ClientConfig {
        ClientConfig {
            reconnect_backoff: ReconnectBackoff {
                delay_jitter_divisor: 0,
                ..ReconnectBackoff::default()
            },
            ..ClientConfig::default()
        }
    }

    fn make_connection() -> Connection {
        Connection::new(ConnectionParams {
            ident: 1,
            endpoint: ServerEndpoint::parse("lagoon://server/app", &test_config()).unwrap(),
            mode: SyncMode::Partition,
            config: test_config(),
            limits: ProtoLimits::default(),
        })
    }

    fn make_session(ident: SessionIdent) -> Session {
        let history = Arc::new(Mutex::new(NullHistory));
        Session::new(SessionParams {
            ident,
            mode: SyncMode::Partition,
            server_path: format!("/s{ident}"),
            stores: SessionStores::new(history),
            resumption_backoff: ReconnectBackoff::default(),
        })
    }

    fn sent_frames(actions: &[ConnectionAction]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|action| match action {
                ConnectionAction::SendFrame(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn activation_connects_after_zero_delay() {
        let mut conn = make_connection();
        let mut actions = conn.activate();
        actions.extend(conn.activate_session(make_session(1), 0));
        assert!(actions.iter().any(|a| matches!(
            a,
            ConnectionAction::StartTimer {
                timer: ConnectionTimer::ReconnectOrDisconnect,
                delay_ms: 0
            }
        )));

        let actions = conn.handle_timer(ConnectionTimer::ReconnectOrDisconnect, 0);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ConnectionAction::ConnectTransport(_))));
        assert!(actions.iter().any(|a| matches!(
            a,
            ConnectionAction::StartTimer {
                timer: ConnectionTimer::ConnectWatchdog,
                ..
            }
        )));
        assert_eq!(conn.state(), ConnectionState::Connecting);
    }

    #[test]
    fn subprotocol_offer_is_descending() {
        let mut conn = make_connection();
        let _ = conn.activate();
        let _ = conn.activate_session(make_session(1), 0);
        let actions = conn.handle_timer(ConnectionTimer::ReconnectOrDisconnect, 0);
        let endpoint = actions
            .iter()
            .find_map(|a| match a {
                ConnectionAction::ConnectTransport(endpoint) => Some(endpoint.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            endpoint.subprotocols,
            vec!["lagoon-part-8", "lagoon-part-7", "lagoon-part-6"]
        );
    }

    #[test]
    fn bad_subprotocol_version_is_fatal_handshake_failure() {
        let mut conn = make_connection();
        let _ = conn.activate();
        let _ = conn.activate_session(make_session(1), 0);
        let _ = conn.handle_timer(ConnectionTimer::ReconnectOrDisconnect, 0);
        let actions = conn.handle_transport_connected("lagoon-part-99", 5);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(actions.iter().any(|a| matches!(
            a,
            ConnectionAction::StateChanged {
                new: ConnectionState::Disconnected,
                error: Some(_),
                ..
            }
        )));
    }

    #[test]
    fn wrong_mode_prefix_rejected() {
        let mut conn = make_connection();
        let _ = conn.activate();
        let _ = conn.activate_session(make_session(1), 0);
        let _ = conn.handle_timer(ConnectionTimer::ReconnectOrDisconnect, 0);
        let _ = conn.handle_transport_connected("lagoon-flex-8", 5);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn sessions_send_in_enlistment_order() {
        let mut conn = make_connection();
        let _ = conn.activate();
        let _ = conn.activate_session(make_session(1), 0);
        let _ = conn.activate_session(make_session(2), 0);
        let _ = conn.handle_timer(ConnectionTimer::ReconnectOrDisconnect, 0);
        let actions = conn.handle_transport_connected("lagoon-part-8", 10);

        // Exactly one frame in flight at a time.
        let frames = sent_frames(&actions);
        assert_eq!(frames.len(), 1);
        let first = decode_client_message(&frames[0], &ProtoLimits::default()).unwrap();
        let ClientMessage::Bind(bind) = first else {
            panic!("expected BIND first, got {first:?}");
        };
        assert_eq!(bind.session_ident, 1);

        // Completion of the write grants the next session its turn.
        let actions = conn.handle_write_complete(11);
        let frames = sent_frames(&actions);
        assert_eq!(frames.len(), 1);
        let second = decode_client_message(&frames[0], &ProtoLimits::default()).unwrap();
        let ClientMessage::Bind(bind) = second else {
            panic!("expected BIND, got {second:?}");
        };
        assert_eq!(bind.session_ident, 2);
    }

    #[test]
    fn pong_with_wrong_timestamp_closes_connection() {
        let mut conn = make_connection();
        let _ = conn.activate();
        let _ = conn.activate_session(make_session(1), 0);
        let _ = connect_quietly(&mut conn);

        // Force the PING out.
        let _ = conn.handle_timer(ConnectionTimer::Heartbeat, 100);
        while conn.sending {
            let _ = conn.handle_write_complete(100);
        }

        let pong = encode_server_message(
            PROTOCOL_VERSION_CURRENT,
            &ServerMessage::Pong(Pong { timestamp: 12345 }),
        )
        .unwrap();
        let _ = conn.handle_frame(&pong, 150);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    fn connect_quietly(conn: &mut Connection) -> Vec<ConnectionAction> {
        let mut actions = conn.handle_timer(ConnectionTimer::ReconnectOrDisconnect, 0);
        actions.extend(conn.handle_transport_connected("lagoon-part-8", 10));
        // Drain all writes so the connection idles.
        loop {
            let more = conn.handle_write_complete(10);
            if sent_frames(&more).is_empty() {
                break;
            }
        }
        actions
    }

    #[test]
    fn pong_round_trip_reports_rtt_and_rearms_ping() {
        let mut conn = make_connection();
        let _ = conn.activate();
        let _ = conn.activate_session(make_session(1), 0);
        let _ = connect_quietly(&mut conn);

        let _ = conn.handle_timer(ConnectionTimer::Heartbeat, 1000);
        assert!(conn.waiting_for_pong);
        // Drain the PING write.
        let _ = conn.handle_write_complete(1000);

        let pong = encode_server_message(
            PROTOCOL_VERSION_CURRENT,
            &ServerMessage::Pong(Pong {
                timestamp: conn.last_ping_sent_at,
            }),
        )
        .unwrap();
        let actions = conn.handle_frame(&pong, conn.last_ping_sent_at + 42);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ConnectionAction::RoundTripTime { rtt_ms: 42 })));
        assert!(!conn.waiting_for_pong);
        assert!(conn.ping_delay_in_progress);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn message_for_unknown_session_closes_connection() {
        let mut conn = make_connection();
        let _ = conn.activate();
        let _ = conn.activate_session(make_session(1), 0);
        let _ = connect_quietly(&mut conn);

        let mark = encode_server_message(
            PROTOCOL_VERSION_CURRENT,
            &ServerMessage::Mark(MarkResponse {
                session_ident: 42,
                request_ident: 1,
            }),
        )
        .unwrap();
        let _ = conn.handle_frame(&mark, 50);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn message_for_historical_session_is_dropped() {
        let mut conn = make_connection();
        let _ = conn.activate();
        let _ = conn.activate_session(make_session(1), 0);
        let _ = connect_quietly(&mut conn);

        // Suspend the session via a fatal session-level error, then drop it
        // at disconnect; its ident stays in the history.
        conn.session_history.insert(9);
        let mark = encode_server_message(
            PROTOCOL_VERSION_CURRENT,
            &ServerMessage::Mark(MarkResponse {
                session_ident: 9,
                request_ident: 1,
            }),
        )
        .unwrap();
        let _ = conn.handle_frame(&mark, 50);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn connection_level_error_with_try_again_reconnects_later() {
        let mut conn = make_connection();
        let _ = conn.activate();
        let _ = conn.activate_session(make_session(1), 0);
        let _ = connect_quietly(&mut conn);

        let error = encode_server_message(
            PROTOCOL_VERSION_CURRENT,
            &ServerMessage::Error(crate::client::proto::ErrorMessage {
                session_ident: 0,
                body: ErrorBody::new(101, "try later", true),
            }),
        )
        .unwrap();
        let actions = conn.handle_frame(&error, 60);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        // Reconnect wait armed with the backoff delay.
        assert!(actions.iter().any(|a| matches!(
            a,
            ConnectionAction::StartTimer {
                timer: ConnectionTimer::ReconnectOrDisconnect,
                delay_ms
            } if *delay_ms > 0
        )));
    }

    #[test]
    fn do_not_reconnect_survives_cancel_reconnect_delay() {
        let mut conn = make_connection();
        let _ = conn.activate();
        let _ = conn.activate_session(make_session(1), 0);
        let _ = connect_quietly(&mut conn);

        let error = encode_server_message(
            PROTOCOL_VERSION_CURRENT,
            &ServerMessage::Error(crate::client::proto::ErrorMessage {
                session_ident: 0,
                body: ErrorBody::new(101, "go away", false),
            }),
        )
        .unwrap();
        let _ = conn.handle_frame(&error, 60);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.reconnect_delay_in_progress);

        let actions = conn.cancel_reconnect_delay(70);
        assert!(actions.is_empty(), "indefinite delay must stick: {actions:?}");
    }

    #[test]
    fn linger_disconnects_when_last_session_leaves() {
        let mut conn = make_connection();
        let _ = conn.activate();
        let _ = conn.activate_session(make_session(1), 0);
        let _ = connect_quietly(&mut conn);

        let actions = conn.initiate_session_deactivation(1, 10);
        // Session had nothing on the wire... it sent BIND already, so it
        // must unbind; either way the unsuspended count dropped and the
        // linger timer is armed.
        assert!(actions.iter().any(|a| matches!(
            a,
            ConnectionAction::StartTimer {
                timer: ConnectionTimer::ReconnectOrDisconnect,
                ..
            }
        )));

        // Drain any UNBIND writes so the linger expiry sees a quiet wire.
        loop {
            let more = conn.handle_write_complete(10);
            if sent_frames(&more).is_empty() {
                break;
            }
        }

        let actions = conn.handle_timer(ConnectionTimer::ReconnectOrDisconnect, 50_000);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(actions.iter().any(|a| matches!(
            a,
            ConnectionAction::StateChanged {
                new: ConnectionState::Disconnected,
                error: None,
                ..
            }
        )));
    }

    #[test]
    fn session_error_info_classifies_auth() {
        let body = ErrorBody::new(203, "bad token", false);
        let info = SessionErrorInfo::from_error_body(&body);
        assert_eq!(info.status.code(), StatusCode::AuthError);
        assert!(info.is_fatal);
        assert_eq!(info.status, Status::new(StatusCode::AuthError, "bad token"));
    }
}
