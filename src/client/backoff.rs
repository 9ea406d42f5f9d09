//! Reconnect and resumption delay policy.

use rand::Rng;

use crate::config::{ReconnectBackoff, ReconnectMode};

/// Why a connection was terminated. Classifies the next reconnect delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionTerminationReason {
    ClosedVoluntarily,
    ConnectOperationFailed,
    ReadOrWriteError,
    TransportProtocolViolation,
    SyncProtocolViolation,
    SyncConnectTimeout,
    PongTimeout,
    SslCertificateRejected,
    HttpResponseSaysFatalError,
    HttpResponseSaysNonfatalError,
    BadHeadersInHttpResponse,
    ServerSaidTryAgainLater,
    ServerSaidDoNotReconnect,
}

/// Delay before the next connect attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectDelay {
    Immediate,
    After(u64),
    Indefinite,
}

impl ReconnectDelay {
    pub fn as_millis(self) -> Option<u64> {
        match self {
            ReconnectDelay::Immediate => Some(0),
            ReconnectDelay::After(ms) => Some(ms),
            ReconnectDelay::Indefinite => None,
        }
    }
}

/// Capped exponential backoff over one class of triggering error.
///
/// The schedule resets whenever the triggering reason changes, and the base
/// interval can be overridden by a server-suggested delay. Connections key
/// the schedule by [`ConnectionTerminationReason`]; suspended sessions key
/// it by the server's protocol error code.
#[derive(Clone, Debug)]
pub struct BackoffState<R: Copy + PartialEq = ConnectionTerminationReason> {
    default_params: ReconnectBackoff,
    params: ReconnectBackoff,
    triggering_error: Option<R>,
    current_delay: Option<u64>,
}

impl<R: Copy + PartialEq> BackoffState<R> {
    pub fn new(params: ReconnectBackoff) -> Self {
        Self {
            default_params: params,
            params,
            triggering_error: None,
            current_delay: None,
        }
    }

    pub fn triggering_error(&self) -> Option<R> {
        self.triggering_error
    }

    pub fn reset(&mut self) {
        self.params = self.default_params;
        self.triggering_error = None;
        self.current_delay = None;
    }

    /// Record a new termination. A change of reason restarts the schedule;
    /// `delay_override` replaces the base interval (server-suggested delay).
    pub fn update(&mut self, reason: R, delay_override: Option<u64>) {
        if self.triggering_error == Some(reason) && delay_override.is_none() {
            return;
        }
        self.triggering_error = Some(reason);
        self.current_delay = None;
        self.params = self.default_params;
        if let Some(base) = delay_override {
            self.params.resumption_delay_interval = base;
            self.params.max_resumption_delay_interval =
                self.params.max_resumption_delay_interval.max(base);
        }
    }

    /// Next delay in the schedule, advancing it.
    pub fn delay_interval(&mut self) -> u64 {
        let next = match self.current_delay {
            None => self.params.resumption_delay_interval,
            Some(previous) => previous
                .saturating_mul(self.params.resumption_delay_backoff_multiplier.max(1))
                .min(self.params.max_resumption_delay_interval),
        };
        self.current_delay = Some(next);
        jittered(next, self.params.delay_jitter_divisor)
    }
}

fn jittered(delay: u64, divisor: u64) -> u64 {
    if divisor == 0 || delay == 0 {
        return delay;
    }
    let spread = delay / divisor;
    if spread == 0 {
        return delay;
    }
    // Deduct up to `spread` so simultaneous clients do not stampede.
    delay - rand::thread_rng().gen_range(0..=spread)
}

/// Reconnect bookkeeping of a connection, including the "scheduled reset"
/// handshake with the keepalive machinery (see `cancel_reconnect_delay`).
#[derive(Clone, Debug)]
pub struct ReconnectInfo {
    mode: ReconnectMode,
    backoff: BackoffState,
    /// Set when the user asked to skip the next backoff delay; consumed by
    /// `delay_interval` unless a PONG proves the connection healthy first.
    pub scheduled_reset: bool,
}

impl ReconnectInfo {
    pub fn new(mode: ReconnectMode, params: ReconnectBackoff) -> Self {
        Self {
            mode,
            backoff: BackoffState::new(params),
            scheduled_reset: false,
        }
    }

    pub fn reset(&mut self) {
        self.backoff.reset();
        self.scheduled_reset = false;
    }

    pub fn update(
        &mut self,
        reason: ConnectionTerminationReason,
        delay_override: Option<u64>,
    ) {
        self.backoff.update(reason, delay_override);
    }

    /// True when the server forbade reconnecting. `cancel_reconnect_delay`
    /// must not override this.
    pub fn reconnect_disallowed(&self) -> bool {
        self.backoff.triggering_error()
            == Some(ConnectionTerminationReason::ServerSaidDoNotReconnect)
    }

    pub fn delay_interval(&mut self) -> ReconnectDelay {
        if self.scheduled_reset {
            self.reset();
        }

        let Some(reason) = self.backoff.triggering_error() else {
            return ReconnectDelay::Immediate;
        };

        match reason {
            ConnectionTerminationReason::ClosedVoluntarily => ReconnectDelay::Immediate,
            ConnectionTerminationReason::ServerSaidDoNotReconnect => ReconnectDelay::Indefinite,
            _ => match self.mode {
                ReconnectMode::Testing => ReconnectDelay::Indefinite,
                ReconnectMode::Normal => ReconnectDelay::After(self.backoff.delay_interval()),
            },
        }
    }
}
