//! The sync client runtime: one event-loop thread driving every connection
//! and session.
//!
//! Transport callbacks, timer expiries and facade commands all funnel into
//! a single crossbeam channel consumed by the loop, which feeds the sans-IO
//! connection state machines and interprets the actions they return. The
//! scheduling guarantees of the protocol core (serialized handlers, no
//! callback reentrance inside `initiate_*`) follow from the loop shape.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, unbounded};

use crate::client::connection::{
    Connection, ConnectionAction, ConnectionParams, ConnectionTimer,
};
use crate::client::endpoint::ServerEndpoint;
use crate::client::notifier::ConnectionState;
use crate::client::proto::ProtoLimits;
use crate::client::reset::ClientResetOperation;
use crate::client::session::{
    Session, SessionAction, SessionEvent, SessionLifecycle, SessionParams,
};
use crate::client::transport::{
    LifecycleSentinel, Transport, TransportCloseKind, TransportObserver, TransportProvider,
};
use crate::config::ClientConfig;
use crate::core::{SessionErrorInfo, SessionIdent, SyncMode, TimestampMs};
use crate::replication::SessionStores;

/// What a facade receives about its session.
pub enum ClientEvent {
    Session(SessionEvent),
    ConnectionStateChanged {
        old: ConnectionState,
        new: ConnectionState,
        error: Option<Box<SessionErrorInfo>>,
    },
}

pub type EventSink = Arc<dyn Fn(ClientEvent) + Send + Sync>;

/// Round-trip time observer, fed after every PONG.
pub type RoundTripTimeHandler = Box<dyn Fn(u64) + Send>;

enum TransportEvent {
    Connected(String),
    Frame(Vec<u8>),
    Error,
    Closed {
        was_clean: bool,
        kind: TransportCloseKind,
        reason: String,
    },
}

enum Command {
    Post(Box<dyn FnOnce(&mut LoopState) + Send>),
    Transport {
        conn: u64,
        generation: u64,
        event: TransportEvent,
    },
    WriteComplete {
        conn: u64,
        generation: u64,
    },
    Stop,
}

/// Arguments for binding a new session into the client.
pub struct BindSessionArgs {
    pub endpoint: ServerEndpoint,
    pub mode: SyncMode,
    /// Partition value (partition mode) or empty.
    pub server_path: String,
    /// Connection pooling key; sessions of different users never share.
    pub user_id: String,
    pub stores: SessionStores,
    pub event_sink: EventSink,
    /// Pending client reset, finalized when the server re-idents the file.
    pub reset_operation: Option<ClientResetOperation>,
}

struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> TimestampMs {
        self.epoch.elapsed().as_millis() as TimestampMs
    }
}

struct TimerEntry {
    deadline: TimestampMs,
    conn: u64,
    timer: ConnectionTimer,
    generation: u64,
}

struct ConnectionEntry {
    connection: Connection,
    transport: Option<Box<dyn Transport>>,
    sentinel: LifecycleSentinel,
    /// Bumped on every transport churn so stale callbacks are ignored.
    generation: u64,
    pool_key: Option<(ServerEndpoint, String, SyncMode)>,
}

struct RouteEntry {
    conn: u64,
    sink: EventSink,
}

struct LoopState {
    config: ClientConfig,
    limits: ProtoLimits,
    provider: Arc<dyn TransportProvider>,
    command_tx: Sender<Command>,
    clock: MonotonicClock,
    connections: BTreeMap<u64, ConnectionEntry>,
    routes: BTreeMap<SessionIdent, RouteEntry>,
    timers: Vec<TimerEntry>,
    timer_generations: std::collections::HashMap<(u64, ConnectionTimer), u64>,
    next_conn_ident: u64,
    roundtrip_time_handler: Option<RoundTripTimeHandler>,
}

impl LoopState {
    fn bind_session(&mut self, ident: SessionIdent, args: BindSessionArgs) {
        let pool_key = if self.config.one_connection_per_session {
            None
        } else {
            Some((args.endpoint.clone(), args.user_id.clone(), args.mode))
        };

        let conn_ident = pool_key
            .as_ref()
            .and_then(|key| {
                self.connections
                    .iter()
                    .find(|(_, entry)| {
                        entry.pool_key.as_ref() == Some(key) && !entry.connection.is_force_closed()
                    })
                    .map(|(ident, _)| *ident)
            })
            .unwrap_or_else(|| {
                let conn_ident = self.next_conn_ident;
                self.next_conn_ident += 1;
                let connection = Connection::new(ConnectionParams {
                    ident: conn_ident,
                    endpoint: args.endpoint.clone(),
                    mode: args.mode,
                    config: self.config.clone(),
                    limits: self.limits.clone(),
                });
                self.connections.insert(
                    conn_ident,
                    ConnectionEntry {
                        connection,
                        transport: None,
                        sentinel: LifecycleSentinel::new(),
                        generation: 0,
                        pool_key,
                    },
                );
                let actions = self
                    .connections
                    .get_mut(&conn_ident)
                    .map(|entry| entry.connection.activate())
                    .unwrap_or_default();
                self.apply_actions(conn_ident, actions);
                conn_ident
            });

        self.routes.insert(
            ident,
            RouteEntry {
                conn: conn_ident,
                sink: args.event_sink,
            },
        );

        let mut session = Session::new(SessionParams {
            ident,
            mode: args.mode,
            server_path: args.server_path,
            stores: args.stores,
            resumption_backoff: self.config.reconnect_backoff,
        });
        if let Some(operation) = args.reset_operation {
            session.set_reset_operation(operation);
        }
        let now = self.clock.now_ms();
        let actions = self
            .connections
            .get_mut(&conn_ident)
            .map(|entry| entry.connection.activate_session(session, now))
            .unwrap_or_default();
        self.apply_actions(conn_ident, actions);
    }

    fn with_session(
        &mut self,
        ident: SessionIdent,
        f: impl FnOnce(&mut Session) -> Vec<SessionAction>,
    ) {
        let Some(route) = self.routes.get(&ident) else {
            return;
        };
        let conn = route.conn;
        let now = self.clock.now_ms();
        let actions = self
            .connections
            .get_mut(&conn)
            .map(|entry| entry.connection.with_session(ident, now, f))
            .unwrap_or_default();
        self.apply_actions(conn, actions);
    }

    fn unbind_session(&mut self, ident: SessionIdent) {
        let Some(route) = self.routes.get(&ident) else {
            return;
        };
        let conn = route.conn;
        let now = self.clock.now_ms();
        let actions = self
            .connections
            .get_mut(&conn)
            .map(|entry| entry.connection.initiate_session_deactivation(ident, now))
            .unwrap_or_default();
        self.apply_actions(conn, actions);
        self.prune_route(ident);
    }

    fn cancel_reconnect_delay(&mut self, ident: SessionIdent) {
        let Some(route) = self.routes.get(&ident) else {
            return;
        };
        let conn = route.conn;
        let now = self.clock.now_ms();
        let actions = self
            .connections
            .get_mut(&conn)
            .map(|entry| entry.connection.cancel_reconnect_delay(now))
            .unwrap_or_default();
        self.apply_actions(conn, actions);
        // The session's own resumption delay is cancelled alongside.
        self.with_session(ident, |session| {
            if session.state() == SessionLifecycle::Active && session.is_suspended() {
                let connected = true;
                session.cancel_resumption_delay(connected)
            } else {
                Vec::new()
            }
        });
    }

    fn prune_route(&mut self, ident: SessionIdent) {
        let Some(route) = self.routes.get(&ident) else {
            return;
        };
        let gone = self
            .connections
            .get(&route.conn)
            .is_none_or(|entry| entry.connection.session(ident).is_none());
        if gone {
            self.routes.remove(&ident);
        }
    }

    fn start_timer(&mut self, conn: u64, timer: ConnectionTimer, delay_ms: u64) {
        let generation = self
            .timer_generations
            .entry((conn, timer))
            .and_modify(|generation| *generation += 1)
            .or_insert(1);
        self.timers.push(TimerEntry {
            deadline: self.clock.now_ms() + delay_ms,
            conn,
            timer,
            generation: *generation,
        });
    }

    fn cancel_timer(&mut self, conn: u64, timer: ConnectionTimer) {
        // Bumping the generation invalidates queued entries; the handler
        // observes the cancellation and returns without side effects.
        self.timer_generations
            .entry((conn, timer))
            .and_modify(|generation| *generation += 1)
            .or_insert(1);
    }

    fn next_deadline(&self) -> Option<TimestampMs> {
        self.timers
            .iter()
            .filter(|entry| {
                self.timer_generations.get(&(entry.conn, entry.timer)) == Some(&entry.generation)
            })
            .map(|entry| entry.deadline)
            .min()
    }

    fn fire_due_timers(&mut self) {
        let now = self.clock.now_ms();
        loop {
            let Some(position) = self.timers.iter().position(|entry| {
                entry.deadline <= now
                    && self.timer_generations.get(&(entry.conn, entry.timer))
                        == Some(&entry.generation)
            }) else {
                // Drop stale entries so the vec does not grow unboundedly.
                self.timers.retain(|entry| {
                    self.timer_generations.get(&(entry.conn, entry.timer))
                        == Some(&entry.generation)
                });
                return;
            };
            let entry = self.timers.swap_remove(position);
            // Consumed: a timer fires at most once per arming.
            self.cancel_timer(entry.conn, entry.timer);
            let actions = self
                .connections
                .get_mut(&entry.conn)
                .map(|connection| connection.connection.handle_timer(entry.timer, now))
                .unwrap_or_default();
            self.apply_actions(entry.conn, actions);
        }
    }

    fn handle_transport_event(&mut self, conn: u64, generation: u64, event: TransportEvent) {
        let current = self.connections.get(&conn).map(|entry| entry.generation);
        if current != Some(generation) {
            return;
        }
        let now = self.clock.now_ms();
        let actions = {
            let Some(entry) = self.connections.get_mut(&conn) else {
                return;
            };
            match event {
                TransportEvent::Connected(subprotocol) => entry
                    .connection
                    .handle_transport_connected(&subprotocol, now),
                TransportEvent::Frame(frame) => entry.connection.handle_frame(&frame, now),
                TransportEvent::Error => Vec::new(),
                TransportEvent::Closed {
                    was_clean,
                    kind,
                    reason,
                } => entry
                    .connection
                    .handle_transport_closed(was_clean, kind, &reason, now),
            }
        };
        self.apply_actions(conn, actions);
    }

    fn handle_write_complete(&mut self, conn: u64, generation: u64) {
        let current = self.connections.get(&conn).map(|entry| entry.generation);
        if current != Some(generation) {
            return;
        }
        let now = self.clock.now_ms();
        let actions = self
            .connections
            .get_mut(&conn)
            .map(|entry| entry.connection.handle_write_complete(now))
            .unwrap_or_default();
        self.apply_actions(conn, actions);
    }

    fn apply_actions(&mut self, conn: u64, actions: Vec<ConnectionAction>) {
        for action in actions {
            match action {
                ConnectionAction::ConnectTransport(endpoint) => {
                    let Some(entry) = self.connections.get_mut(&conn) else {
                        continue;
                    };
                    entry.sentinel.destroy();
                    entry.sentinel = LifecycleSentinel::new();
                    entry.generation += 1;
                    let observer = ChannelObserver {
                        tx: self.command_tx.clone(),
                        conn,
                        generation: entry.generation,
                        sentinel: entry.sentinel.clone(),
                    };
                    entry.transport = Some(self.provider.connect(endpoint, Box::new(observer)));
                }
                ConnectionAction::CloseTransport => {
                    if let Some(entry) = self.connections.get_mut(&conn) {
                        entry.sentinel.destroy();
                        entry.transport = None;
                        entry.generation += 1;
                    }
                }
                ConnectionAction::SendFrame(frame) => {
                    let Some(entry) = self.connections.get_mut(&conn) else {
                        continue;
                    };
                    let Some(transport) = entry.transport.as_mut() else {
                        continue;
                    };
                    let tx = self.command_tx.clone();
                    let sentinel = entry.sentinel.clone();
                    let generation = entry.generation;
                    transport.write_frame(
                        frame,
                        Box::new(move || {
                            // Late completions after teardown short-circuit
                            // on the lifecycle sentinel.
                            if sentinel.is_destroyed() {
                                return;
                            }
                            let _ = tx.send(Command::WriteComplete { conn, generation });
                        }),
                    );
                }
                ConnectionAction::StartTimer { timer, delay_ms } => {
                    self.start_timer(conn, timer, delay_ms);
                }
                ConnectionAction::CancelTimer(timer) => {
                    self.cancel_timer(conn, timer);
                }
                ConnectionAction::StateChanged { old, new, error } => {
                    let idents: Vec<SessionIdent> = self
                        .routes
                        .iter()
                        .filter(|(_, route)| route.conn == conn)
                        .map(|(ident, _)| *ident)
                        .collect();
                    for ident in idents {
                        if let Some(route) = self.routes.get(&ident) {
                            (route.sink)(ClientEvent::ConnectionStateChanged {
                                old,
                                new,
                                error: error.clone().map(Box::new),
                            });
                        }
                        self.prune_route(ident);
                    }
                }
                ConnectionAction::SessionEvent { session, event } => {
                    if let Some(route) = self.routes.get(&session) {
                        (route.sink)(ClientEvent::Session(event));
                    }
                    self.prune_route(session);
                }
                ConnectionAction::RoundTripTime { rtt_ms } => {
                    if let Some(handler) = self.roundtrip_time_handler.as_ref() {
                        handler(rtt_ms);
                    }
                }
                ConnectionAction::Idle => {
                    let reap = self
                        .connections
                        .get(&conn)
                        .is_some_and(|entry| {
                            entry.connection.num_active_sessions() == 0
                                && entry.connection.is_force_closed()
                        });
                    if reap && let Some(mut entry) = self.connections.remove(&conn) {
                        entry.sentinel.destroy();
                    }
                }
            }
        }
    }

    fn stop(&mut self) {
        let conns: Vec<u64> = self.connections.keys().copied().collect();
        let now = self.clock.now_ms();
        for conn in conns {
            let actions = self
                .connections
                .get_mut(&conn)
                .map(|entry| entry.connection.force_close(now))
                .unwrap_or_default();
            self.apply_actions(conn, actions);
        }
        for entry in self.connections.values_mut() {
            entry.sentinel.destroy();
            entry.transport = None;
        }
        self.connections.clear();
        self.routes.clear();
        self.timers.clear();
    }
}

struct ChannelObserver {
    tx: Sender<Command>,
    conn: u64,
    generation: u64,
    sentinel: LifecycleSentinel,
}

impl TransportObserver for ChannelObserver {
    fn transport_connected(&mut self, subprotocol: &str) {
        if self.sentinel.is_destroyed() {
            return;
        }
        let _ = self.tx.send(Command::Transport {
            conn: self.conn,
            generation: self.generation,
            event: TransportEvent::Connected(subprotocol.to_string()),
        });
    }

    fn frame_received(&mut self, data: &[u8]) {
        if self.sentinel.is_destroyed() {
            return;
        }
        let _ = self.tx.send(Command::Transport {
            conn: self.conn,
            generation: self.generation,
            event: TransportEvent::Frame(data.to_vec()),
        });
    }

    fn transport_error(&mut self) {
        if self.sentinel.is_destroyed() {
            return;
        }
        let _ = self.tx.send(Command::Transport {
            conn: self.conn,
            generation: self.generation,
            event: TransportEvent::Error,
        });
    }

    fn transport_closed(&mut self, was_clean: bool, kind: TransportCloseKind, reason: &str) {
        if self.sentinel.is_destroyed() {
            return;
        }
        let _ = self.tx.send(Command::Transport {
            conn: self.conn,
            generation: self.generation,
            event: TransportEvent::Closed {
                was_clean,
                kind,
                reason: reason.to_string(),
            },
        });
    }
}

/// Handle to the sync client event loop. Cloneable across facades; the
/// loop thread stops when `shutdown()` is called.
pub struct SyncClient {
    command_tx: Sender<Command>,
    join: Mutex<Option<JoinHandle<()>>>,
    next_session_ident: AtomicU64,
    config: ClientConfig,
}

impl SyncClient {
    pub fn new(config: ClientConfig, provider: Arc<dyn TransportProvider>) -> Arc<Self> {
        Self::with_roundtrip_handler(config, provider, None)
    }

    pub fn with_roundtrip_handler(
        config: ClientConfig,
        provider: Arc<dyn TransportProvider>,
        roundtrip_time_handler: Option<RoundTripTimeHandler>,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = unbounded();
        let state = LoopState {
            config: config.clone(),
            limits: ProtoLimits::default(),
            provider,
            command_tx: command_tx.clone(),
            clock: MonotonicClock::new(),
            connections: BTreeMap::new(),
            routes: BTreeMap::new(),
            timers: Vec::new(),
            timer_generations: std::collections::HashMap::new(),
            next_conn_ident: 1,
            roundtrip_time_handler,
        };
        let join = std::thread::Builder::new()
            .name("lagoon-sync-client".into())
            .spawn(move || run_event_loop(state, command_rx))
            .expect("spawn sync client thread");
        Arc::new(Self {
            command_tx,
            join: Mutex::new(Some(join)),
            next_session_ident: AtomicU64::new(1),
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Allocate the identifier for a new session. Identifiers are never
    /// reused within a client.
    pub fn allocate_session_ident(&self) -> SessionIdent {
        self.next_session_ident.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn post(&self, f: impl FnOnce(&mut LoopState) + Send + 'static) {
        let _ = self.command_tx.send(Command::Post(Box::new(f)));
    }

    pub fn bind_session(&self, ident: SessionIdent, args: BindSessionArgs) {
        self.post(move |state| state.bind_session(ident, args));
    }

    pub fn unbind_session(&self, ident: SessionIdent) {
        self.post(move |state| state.unbind_session(ident));
    }

    /// Run a command against the protocol session on the loop thread.
    pub fn with_session(
        &self,
        ident: SessionIdent,
        f: impl FnOnce(&mut Session) -> Vec<SessionAction> + Send + 'static,
    ) {
        self.post(move |state| state.with_session(ident, f));
    }

    /// Skip the reconnect backoff (or verify connection health) for the
    /// connection carrying `ident`.
    pub fn cancel_reconnect_delay(&self, ident: SessionIdent) {
        self.post(move |state| state.cancel_reconnect_delay(ident));
    }

    /// Tear down every connection and stop the loop thread.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Stop);
        self.join_loop_thread();
    }

    fn join_loop_thread(&self) {
        let Some(join) = self.join.lock().unwrap().take() else {
            return;
        };
        // The last handle may be dropped from a callback on the loop
        // thread itself; joining there would deadlock.
        if join.thread().id() == std::thread::current().id() {
            return;
        }
        let _ = join.join();
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        let _ = self.command_tx.send(Command::Stop);
        self.join_loop_thread();
    }
}

fn run_event_loop(mut state: LoopState, command_rx: Receiver<Command>) {
    tracing::debug!(target: "sync", "client event loop started");
    loop {
        state.fire_due_timers();

        let now = state.clock.now_ms();
        let timeout = state
            .next_deadline()
            .map(|deadline| Duration::from_millis(deadline.saturating_sub(now)))
            .unwrap_or(Duration::from_secs(3600));

        let command = match command_rx.recv_timeout(timeout) {
            Ok(command) => command,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
        };

        match command {
            Command::Post(f) => f(&mut state),
            Command::Transport {
                conn,
                generation,
                event,
            } => state.handle_transport_event(conn, generation, event),
            Command::WriteComplete { conn, generation } => {
                state.handle_write_complete(conn, generation)
            }
            Command::Stop => {
                state.stop();
                break;
            }
        }
    }
    tracing::debug!(target: "sync", "client event loop stopped");
}
