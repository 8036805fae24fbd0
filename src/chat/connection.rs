//! Chat socket lifecycle state machine.
//!
//! Fault-tolerant recovery management for one application binding:
//! - State machine with well-defined transitions
//! - Bounded reconnection (5-attempt budget by default)
//! - Exponential backoff with jitter between attempts
//! - Terminal protocol events permanently disable recovery
//!
//! The machine is pure: socket callbacks are fed in as [`SocketEvent`]s and
//! the caller obeys the returned [`Directive`]. Every transition can be
//! exercised without a live socket. Transport failures never escape to the
//! caller; they fold into the close/reconnect path.

use std::time::Duration;

use tracing::{debug, info};

/// WebSocket normal-closure code. Anything else is a reconnect candidate.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Status shown once the reconnect budget is exhausted. Recovery from here
/// requires manual user action.
pub const STATUS_RECONNECT_EXHAUSTED: &str = "Could not restore the connection. Reload the page.";

fn reconnect_status(attempt: u32) -> String {
    format!("Reconnecting... (attempt {attempt})")
}

// =============================================================================
// BACKOFF
// =============================================================================

/// Backoff parameters for reconnect attempts.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        // 500ms base, 2x multiplier, 15s cap, +/-30% jitter
        Self {
            base_ms: 500,
            max_ms: 15_000,
            multiplier: 2.0,
            jitter_factor: 0.3,
        }
    }
}

/// Backoff calculator with jitter so parallel clients do not retry in step.
#[derive(Debug)]
pub struct BackoffCalculator {
    config: BackoffConfig,
    attempt: u32,
    rng_state: u64,
}

impl BackoffCalculator {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(12345),
        }
    }

    /// Fast PRNG for jitter (xorshift64)
    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    /// Compute next backoff duration with jitter.
    pub fn next_backoff(&mut self) -> Duration {
        let base = (self.config.base_ms as f64)
            * self.config.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.config.max_ms as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = (self.next_random() * 2.0 - 1.0) * jitter_range;
        let final_ms = (capped + jitter).max(self.config.base_ms as f64);

        self.attempt += 1;

        Duration::from_millis(final_ms as u64)
    }

    /// Reset on successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Connection state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No socket. Initial state, and terminal after a normal close.
    Disconnected,
    /// Dial in flight, waiting for the transport open acknowledgment.
    Connecting,
    /// Socket open, streaming events.
    Open,
    /// Abnormal close observed; waiting out the backoff before redialing.
    Reconnecting,
    /// No further socket work, ever: budget exhausted or terminal event.
    Terminated,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Open => write!(f, "OPEN"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Why a transition happened (for logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    DialStarted,
    OpenAck,
    NormalClose,
    CallerClose,
    AbnormalClose,
    TransportError,
    TerminalEvent,
    BudgetExhausted,
}

impl std::fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DialStarted => write!(f, "dial_started"),
            Self::OpenAck => write!(f, "open_ack"),
            Self::NormalClose => write!(f, "normal_close"),
            Self::CallerClose => write!(f, "caller_close"),
            Self::AbnormalClose => write!(f, "abnormal_close"),
            Self::TransportError => write!(f, "transport_error"),
            Self::TerminalEvent => write!(f, "terminal_event"),
            Self::BudgetExhausted => write!(f, "budget_exhausted"),
        }
    }
}

/// Socket lifecycle events fed into the machine. Real transport callbacks and
/// synthetic test events look identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    /// A dial is being issued (first connect or redial).
    Dial,
    /// Transport-level open acknowledgment.
    OpenAck,
    /// Socket closed with the given close code (1000 = normal).
    Closed { code: u16 },
    /// Transport error surfaced by the socket or the dial.
    TransportError,
    /// Terminal protocol event received on the stream.
    Terminal,
    /// Caller-initiated teardown: binding dropped or application changed.
    CallerClose,
}

/// What the caller must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Nothing to do.
    None,
    /// Wait out the backoff, then dial again.
    Redial { attempt: u32, delay: Duration },
    /// Close the socket with the normal code (stale or caller-closed).
    CloseNormal,
    /// Stop all socket work for this binding.
    Halt,
}

/// Reconnect budget for one binding. `allow_reconnect` is permanently
/// cleared on a normal close, on caller teardown, or on a terminal event.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub max_attempts: u32,
    pub allow_reconnect: bool,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            allow_reconnect: true,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Owns one socket lifecycle: state, reconnect budget, and the two outputs
/// the presentation layer consumes (connected flag + status text).
#[derive(Debug)]
pub struct ConnectionManager {
    state: ConnState,
    policy: ReconnectPolicy,
    backoff: BackoffCalculator,
    connected: bool,
    status: Option<String>,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy, backoff: BackoffConfig) -> Self {
        Self {
            state: ConnState::Disconnected,
            policy,
            backoff: BackoffCalculator::new(backoff),
            connected: false,
            status: None,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// The single observable connectivity flag.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Optional human-readable status (reconnect progress, terminal notice).
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn attempts(&self) -> u32 {
        self.policy.attempts
    }

    pub fn allow_reconnect(&self) -> bool {
        self.policy.allow_reconnect
    }

    /// Apply one socket event and return what the caller must do next.
    pub fn on_event(&mut self, event: SocketEvent) -> Directive {
        match event {
            SocketEvent::Dial => self.on_dial(),
            SocketEvent::OpenAck => self.on_open(),
            SocketEvent::Closed { code } => self.on_closed(code),
            SocketEvent::TransportError => self.on_interrupted(TransitionCause::TransportError),
            SocketEvent::Terminal => self.on_terminal(),
            SocketEvent::CallerClose => self.on_caller_close(),
        }
    }

    fn on_dial(&mut self) -> Directive {
        match self.state {
            ConnState::Disconnected | ConnState::Reconnecting => {
                self.transition(ConnState::Connecting, TransitionCause::DialStarted);
                Directive::None
            }
            other => {
                debug!(state = %other, "dial ignored");
                Directive::None
            }
        }
    }

    fn on_open(&mut self) -> Directive {
        match self.state {
            ConnState::Connecting => {
                self.connected = true;
                self.policy.attempts = 0;
                self.backoff.reset();
                self.status = None;
                self.transition(ConnState::Open, TransitionCause::OpenAck);
                Directive::None
            }
            // A socket that opened after teardown belongs to a dead binding.
            ConnState::Disconnected | ConnState::Terminated => Directive::CloseNormal,
            other => {
                debug!(state = %other, "open ack ignored");
                Directive::None
            }
        }
    }

    fn on_closed(&mut self, code: u16) -> Directive {
        self.connected = false;

        // Terminal and already-disconnected states swallow late callbacks.
        if matches!(self.state, ConnState::Terminated | ConnState::Disconnected) {
            return Directive::None;
        }

        if code == NORMAL_CLOSE_CODE {
            self.policy.allow_reconnect = false;
            self.transition(ConnState::Disconnected, TransitionCause::NormalClose);
            Directive::None
        } else {
            self.on_interrupted(TransitionCause::AbnormalClose)
        }
    }

    /// Abnormal close or transport error: redial within the budget, halt past it.
    fn on_interrupted(&mut self, cause: TransitionCause) -> Directive {
        self.connected = false;

        if matches!(self.state, ConnState::Terminated | ConnState::Disconnected) {
            return Directive::None;
        }

        if self.policy.allow_reconnect && self.policy.attempts < self.policy.max_attempts {
            self.policy.attempts += 1;
            self.status = Some(reconnect_status(self.policy.attempts));
            self.transition(ConnState::Reconnecting, cause);
            Directive::Redial {
                attempt: self.policy.attempts,
                delay: self.backoff.next_backoff(),
            }
        } else {
            if self.policy.attempts >= self.policy.max_attempts {
                self.status = Some(STATUS_RECONNECT_EXHAUSTED.to_string());
            }
            self.transition(ConnState::Terminated, TransitionCause::BudgetExhausted);
            Directive::Halt
        }
    }

    fn on_terminal(&mut self) -> Directive {
        self.policy.allow_reconnect = false;
        if self.state != ConnState::Terminated {
            self.transition(ConnState::Terminated, TransitionCause::TerminalEvent);
        }
        Directive::None
    }

    fn on_caller_close(&mut self) -> Directive {
        self.policy.allow_reconnect = false;
        self.connected = false;

        if matches!(self.state, ConnState::Terminated | ConnState::Disconnected) {
            return Directive::None;
        }

        self.transition(ConnState::Disconnected, TransitionCause::CallerClose);
        Directive::CloseNormal
    }

    fn transition(&mut self, next: ConnState, cause: TransitionCause) {
        let prev = std::mem::replace(&mut self.state, next);
        if prev != next {
            info!(from = %prev, to = %next, cause = %cause, "chat_conn_transition");
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            base_ms: 10,
            max_ms: 100,
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    fn manager() -> ConnectionManager {
        ConnectionManager::new(ReconnectPolicy::default(), fast_backoff())
    }

    fn open_connection(conn: &mut ConnectionManager) {
        assert_eq!(conn.on_event(SocketEvent::Dial), Directive::None);
        assert_eq!(conn.on_event(SocketEvent::OpenAck), Directive::None);
        assert_eq!(conn.state(), ConnState::Open);
        assert!(conn.is_connected());
    }

    #[test]
    fn test_dial_then_open() {
        let mut conn = manager();
        assert_eq!(conn.state(), ConnState::Disconnected);

        conn.on_event(SocketEvent::Dial);
        assert_eq!(conn.state(), ConnState::Connecting);
        assert!(!conn.is_connected());

        conn.on_event(SocketEvent::OpenAck);
        assert_eq!(conn.state(), ConnState::Open);
        assert!(conn.is_connected());
        assert_eq!(conn.status(), None);
        assert_eq!(conn.attempts(), 0);
    }

    #[test]
    fn test_normal_close_never_reconnects() {
        let mut conn = manager();
        open_connection(&mut conn);
        assert!(conn.allow_reconnect());

        let directive = conn.on_event(SocketEvent::Closed { code: 1000 });
        assert_eq!(directive, Directive::None);
        assert_eq!(conn.state(), ConnState::Disconnected);
        assert!(!conn.allow_reconnect());
        assert!(!conn.is_connected());

        // A late abnormal close from the same socket changes nothing.
        let directive = conn.on_event(SocketEvent::Closed { code: 1006 });
        assert_eq!(directive, Directive::None);
        assert_eq!(conn.state(), ConnState::Disconnected);
    }

    #[test]
    fn test_abnormal_close_redials_with_attempt_number() {
        let mut conn = manager();
        open_connection(&mut conn);

        match conn.on_event(SocketEvent::Closed { code: 1006 }) {
            Directive::Redial { attempt, .. } => assert_eq!(attempt, 1),
            other => panic!("expected redial, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnState::Reconnecting);
        assert_eq!(conn.status(), Some("Reconnecting... (attempt 1)"));

        // Second abnormal close before any open: attempt 2.
        conn.on_event(SocketEvent::Dial);
        match conn.on_event(SocketEvent::Closed { code: 1006 }) {
            Directive::Redial { attempt, .. } => assert_eq!(attempt, 2),
            other => panic!("expected redial, got {other:?}"),
        }
        assert_eq!(conn.status(), Some("Reconnecting... (attempt 2)"));
    }

    #[test]
    fn test_budget_exhaustion_halts_on_sixth_abnormal_close() {
        let mut conn = manager();
        conn.on_event(SocketEvent::Dial);

        for expected in 1..=5u32 {
            match conn.on_event(SocketEvent::TransportError) {
                Directive::Redial { attempt, .. } => assert_eq!(attempt, expected),
                other => panic!("expected redial #{expected}, got {other:?}"),
            }
            conn.on_event(SocketEvent::Dial);
        }

        // Sixth failure: budget spent, no new attempt is issued.
        assert_eq!(conn.on_event(SocketEvent::TransportError), Directive::Halt);
        assert_eq!(conn.state(), ConnState::Terminated);
        assert_eq!(conn.status(), Some(STATUS_RECONNECT_EXHAUSTED));

        // Still terminated for anything that arrives later.
        assert_eq!(
            conn.on_event(SocketEvent::Closed { code: 1006 }),
            Directive::None
        );
        assert_eq!(conn.state(), ConnState::Terminated);
    }

    #[test]
    fn test_successful_open_resets_budget() {
        let mut conn = manager();
        open_connection(&mut conn);

        conn.on_event(SocketEvent::Closed { code: 1006 });
        conn.on_event(SocketEvent::Dial);
        conn.on_event(SocketEvent::Closed { code: 1006 });
        assert_eq!(conn.attempts(), 2);

        conn.on_event(SocketEvent::Dial);
        conn.on_event(SocketEvent::OpenAck);
        assert_eq!(conn.attempts(), 0);
        assert_eq!(conn.status(), None);

        // Budget is whole again after a clean recovery.
        match conn.on_event(SocketEvent::Closed { code: 1011 }) {
            Directive::Redial { attempt, .. } => assert_eq!(attempt, 1),
            other => panic!("expected redial, got {other:?}"),
        }
    }

    #[test]
    fn test_terminal_event_is_idempotent_and_blocks_reconnect() {
        let mut conn = manager();
        open_connection(&mut conn);

        assert_eq!(conn.on_event(SocketEvent::Terminal), Directive::None);
        assert_eq!(conn.state(), ConnState::Terminated);
        assert!(!conn.allow_reconnect());

        // Server closing abnormally afterwards produces no reconnect attempt.
        assert_eq!(
            conn.on_event(SocketEvent::Closed { code: 1006 }),
            Directive::None
        );
        assert_eq!(conn.state(), ConnState::Terminated);

        // Repeated terminal events stay put.
        assert_eq!(conn.on_event(SocketEvent::Terminal), Directive::None);
        assert_eq!(conn.state(), ConnState::Terminated);
    }

    #[test]
    fn test_caller_close_tears_down_from_any_live_state() {
        // While open
        let mut conn = manager();
        open_connection(&mut conn);
        assert_eq!(conn.on_event(SocketEvent::CallerClose), Directive::CloseNormal);
        assert_eq!(conn.state(), ConnState::Disconnected);
        assert!(!conn.allow_reconnect());

        // While waiting out a backoff
        let mut conn = manager();
        conn.on_event(SocketEvent::Dial);
        conn.on_event(SocketEvent::TransportError);
        assert_eq!(conn.state(), ConnState::Reconnecting);
        assert_eq!(conn.on_event(SocketEvent::CallerClose), Directive::CloseNormal);
        assert_eq!(conn.state(), ConnState::Disconnected);

        // An open ack from a stale socket after teardown gets closed.
        assert_eq!(conn.on_event(SocketEvent::OpenAck), Directive::CloseNormal);
        assert_eq!(conn.state(), ConnState::Disconnected);
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let mut backoff = BackoffCalculator::new(BackoffConfig {
            base_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter_factor: 0.0,
        });

        assert_eq!(backoff.next_backoff(), Duration::from_millis(100));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(200));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(400));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(800));
        // Capped from here on.
        assert_eq!(backoff.next_backoff(), Duration::from_millis(1_000));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(1_000));

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let mut backoff = BackoffCalculator::new(BackoffConfig::default());

        // First backoff: 500ms +/-30%
        let d = backoff.next_backoff();
        assert!(d.as_millis() >= 350 && d.as_millis() <= 650, "got {d:?}");

        for _ in 0..20 {
            let d = backoff.next_backoff();
            assert!(d.as_millis() <= 19_500, "got {d:?}"); // 15000 * 1.3
            assert!(d.as_millis() >= 500, "got {d:?}");
        }
    }
}
