//! Upstream connection state machine.
//!
//! The machine is a plain struct with a transition function
//! `(state, event, now) -> effects`. It never touches a socket or a timer;
//! the driver task feeds it events and carries out the effects in order.
//!
//! ```text
//!   Disconnected --Start--> Connecting --Connected--> Connected
//!                               |                         |
//!                        ConnectFailed          Closed / stall on dead socket
//!                               v                         v
//!                          Reconnecting <-----------------+
//!                               |
//!                          ReconnectDue --> Connecting
//!
//!   any --Shutdown--> ShuttingDown (terminal)
//! ```

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::timers::TimerKind;
use crate::RelayError;
use crate::config::TimingConfig;
use crate::types::{ConnectionPhase, TcpStatus};

/// Socket liveness as seen by the driver on a health-check tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketProbe {
    pub readable: bool,
    pub writable: bool,
}

impl SocketProbe {
    pub const DEAD: SocketProbe = SocketProbe { readable: false, writable: false };
    pub const ALIVE: SocketProbe = SocketProbe { readable: true, writable: true };

    pub fn is_dead(self) -> bool {
        !self.readable && !self.writable
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// First connect after spawn
    Start,
    /// The reconnect delay elapsed
    ReconnectDue,
    /// The in-flight connect attempt succeeded
    Connected,
    /// The in-flight connect attempt failed
    ConnectFailed { error: String },
    /// Bytes arrived on the socket
    DataReceived,
    /// The socket ended, errored or was reset
    Closed { error: Option<String> },
    /// Heartbeat period elapsed
    HeartbeatDue,
    /// Health-check period elapsed; carries the socket's current liveness
    HealthCheckDue { probe: SocketProbe },
    /// Explicit shutdown request
    Shutdown,
}

/// Side effects requested by a transition, executed in order by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Start a connect attempt to a freshly resolved target
    Connect,
    /// Abort a connect attempt that has not resolved yet
    AbortConnect,
    /// Arm a timer, replacing any live timer of the same kind
    ArmTimer { kind: TimerKind, period: Duration },
    CancelTimer(TimerKind),
    /// Push a connectivity update to downstream sessions
    EmitStatus(TcpStatus),
    /// Write a heartbeat message carrying `counter`
    SendHeartbeat { counter: i16 },
    /// Drop the socket
    CloseSocket,
}

/// Connection state owned by the upstream driver.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    phase: ConnectionPhase,
    last_data_at: Option<Instant>,
    reconnect_attempts: u32,
    reconnect_in_flight: bool,
    heartbeat_counter: i16,
    timing: TimingConfig,
}

impl ConnectionState {
    pub fn new(timing: TimingConfig) -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            last_data_at: None,
            reconnect_attempts: 0,
            reconnect_in_flight: false,
            heartbeat_counter: 0,
            timing,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn last_data_at(&self) -> Option<Instant> {
        self.last_data_at
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn is_reconnect_in_flight(&self) -> bool {
        self.reconnect_in_flight
    }

    /// `Connected` implies the socket is writable.
    pub fn can_write(&self) -> bool {
        self.phase.is_writable()
    }

    /// Apply `event` at time `now` and return the effects to execute.
    pub fn handle(&mut self, event: Event, now: Instant) -> Vec<Effect> {
        use ConnectionPhase::*;

        if self.phase == ShuttingDown {
            // Terminal: a connection that lands after shutdown must not survive
            return match event {
                Event::Connected => vec![Effect::CloseSocket],
                _ => Vec::new(),
            };
        }

        match (self.phase, event) {
            (_, Event::Shutdown) => self.shut_down(),

            (Disconnected, Event::Start) => self.begin_attempt(),
            (Reconnecting, Event::ReconnectDue) if self.reconnect_in_flight => {
                self.begin_attempt()
            }

            (Connecting, Event::Connected) => self.on_connected(now),
            (Connecting, Event::ConnectFailed { error }) => {
                warn!(attempt = self.reconnect_attempts + 1, "Upstream connect failed: {}", error);
                self.schedule_reconnect(Some(error))
            }

            (Connected, Event::DataReceived) => {
                self.last_data_at = Some(now);
                Vec::new()
            }
            (Connected, Event::HeartbeatDue) => {
                self.heartbeat_counter = self.heartbeat_counter.wrapping_add(1);
                vec![Effect::SendHeartbeat { counter: self.heartbeat_counter }]
            }
            (Connected, Event::HealthCheckDue { probe }) => self.check_health(probe, now),
            (Connected, Event::Closed { error }) => self.on_closed(error),

            // A socket that connects while we are not waiting for one is dropped
            (_, Event::Connected) => vec![Effect::CloseSocket],

            (phase, event) => {
                debug!(%phase, ?event, "Ignoring event");
                Vec::new()
            }
        }
    }

    fn begin_attempt(&mut self) -> Vec<Effect> {
        debug!(
            from = %self.phase,
            attempt = self.reconnect_attempts + 1,
            "Connecting to upstream"
        );
        self.phase = ConnectionPhase::Connecting;
        self.reconnect_in_flight = true;

        vec![
            Effect::CancelTimer(TimerKind::Heartbeat),
            Effect::CancelTimer(TimerKind::HealthCheck),
            Effect::Connect,
        ]
    }

    fn on_connected(&mut self, now: Instant) -> Vec<Effect> {
        info!(after_attempts = self.reconnect_attempts, "Upstream connected");
        self.phase = ConnectionPhase::Connected;
        self.reconnect_attempts = 0;
        self.reconnect_in_flight = false;
        self.last_data_at = Some(now);

        vec![
            Effect::CancelTimer(TimerKind::Heartbeat),
            Effect::CancelTimer(TimerKind::HealthCheck),
            Effect::ArmTimer {
                kind: TimerKind::Heartbeat,
                period: self.timing.heartbeat_interval(),
            },
            Effect::ArmTimer {
                kind: TimerKind::HealthCheck,
                period: self.timing.health_check_interval(),
            },
            Effect::EmitStatus(TcpStatus::connected()),
        ]
    }

    fn on_closed(&mut self, error: Option<String>) -> Vec<Effect> {
        match &error {
            Some(e) => warn!("Upstream connection lost: {}", e),
            None => info!("Upstream connection closed"),
        }

        let mut effects = vec![
            Effect::CancelTimer(TimerKind::Heartbeat),
            Effect::CancelTimer(TimerKind::HealthCheck),
            Effect::CloseSocket,
        ];
        effects.extend(self.schedule_reconnect(error));
        effects
    }

    fn schedule_reconnect(&mut self, error: Option<String>) -> Vec<Effect> {
        self.phase = ConnectionPhase::Reconnecting;
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        self.reconnect_in_flight = true;

        let delay = self.timing.reconnect_delay();
        debug!(?delay, attempts = self.reconnect_attempts, "Scheduling reconnect");

        vec![
            Effect::EmitStatus(TcpStatus::disconnected(error)),
            Effect::ArmTimer { kind: TimerKind::Reconnect, period: delay },
        ]
    }

    fn check_health(&mut self, probe: SocketProbe, now: Instant) -> Vec<Effect> {
        let silent_for =
            self.last_data_at.map(|at| now.saturating_duration_since(at)).unwrap_or_default();

        if silent_for <= self.timing.stall_threshold() {
            debug!(?silent_for, "Health check ok");
            return Vec::new();
        }

        if probe.is_dead() {
            let stall = RelayError::DataStall { silent_for };
            warn!(?silent_for, "Upstream stalled and socket is dead, forcing reconnect");
            return self.on_closed(Some(stall.to_string()));
        }

        // Controllers may sit idle for long stretches; only a dead socket forces recovery
        warn!(
            ?silent_for,
            readable = probe.readable,
            writable = probe.writable,
            "No upstream data past the stall threshold but the socket is alive"
        );
        Vec::new()
    }

    fn shut_down(&mut self) -> Vec<Effect> {
        info!(from = %self.phase, "Upstream connection shutting down");
        self.phase = ConnectionPhase::ShuttingDown;
        self.reconnect_in_flight = false;

        vec![
            Effect::CancelTimer(TimerKind::Reconnect),
            Effect::CancelTimer(TimerKind::HealthCheck),
            Effect::CancelTimer(TimerKind::Heartbeat),
            Effect::AbortConnect,
            Effect::CloseSocket,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn machine() -> ConnectionState {
        ConnectionState::new(TimingConfig::default())
    }

    fn connected(state: &mut ConnectionState, now: Instant) {
        state.handle(Event::Start, now);
        state.handle(Event::Connected, now);
        assert_eq!(state.phase(), ConnectionPhase::Connected);
    }

    /// Applies timer effects to a simulated set of armed timers.
    fn apply_timers(armed: &mut Vec<TimerKind>, effects: &[Effect]) {
        for effect in effects {
            match effect {
                Effect::ArmTimer { kind, .. } => {
                    armed.retain(|k| k != kind);
                    armed.push(*kind);
                }
                Effect::CancelTimer(kind) => armed.retain(|k| k != kind),
                _ => {}
            }
        }
    }

    #[test]
    fn start_connects_and_success_arms_both_timers() {
        let now = Instant::now();
        let mut state = machine();

        let effects = state.handle(Event::Start, now);
        assert_eq!(state.phase(), ConnectionPhase::Connecting);
        assert_eq!(effects.last(), Some(&Effect::Connect));

        let effects = state.handle(Event::Connected, now);
        assert_eq!(state.reconnect_attempts(), 0);
        assert_eq!(state.last_data_at(), Some(now));
        assert!(!state.is_reconnect_in_flight());
        assert!(effects.contains(&Effect::ArmTimer {
            kind: TimerKind::Heartbeat,
            period: Duration::from_millis(1500)
        }));
        assert!(effects.contains(&Effect::ArmTimer {
            kind: TimerKind::HealthCheck,
            period: Duration::from_secs(30)
        }));
        assert_eq!(effects.last(), Some(&Effect::EmitStatus(TcpStatus::connected())));
    }

    #[test]
    fn close_without_shutdown_schedules_fixed_delay_reconnect() {
        let now = Instant::now();
        let mut state = machine();
        connected(&mut state, now);

        let effects = state.handle(Event::Closed { error: None }, now);
        assert_eq!(state.phase(), ConnectionPhase::Reconnecting);
        assert!(state.is_reconnect_in_flight());
        assert_eq!(
            effects,
            vec![
                Effect::CancelTimer(TimerKind::Heartbeat),
                Effect::CancelTimer(TimerKind::HealthCheck),
                Effect::CloseSocket,
                Effect::EmitStatus(TcpStatus::disconnected(None)),
                Effect::ArmTimer { kind: TimerKind::Reconnect, period: Duration::from_secs(3) },
            ]
        );

        let effects = state.handle(Event::ReconnectDue, now);
        assert_eq!(state.phase(), ConnectionPhase::Connecting);
        assert_eq!(effects.last(), Some(&Effect::Connect));
    }

    #[test]
    fn connect_failure_uses_same_fixed_delay() {
        let now = Instant::now();
        let mut state = machine();
        state.handle(Event::Start, now);

        for attempt in 1..=3 {
            let effects = state.handle(Event::ConnectFailed { error: "refused".into() }, now);
            assert_eq!(state.reconnect_attempts(), attempt);
            assert_eq!(
                effects,
                vec![
                    Effect::EmitStatus(TcpStatus::disconnected(Some("refused".into()))),
                    Effect::ArmTimer { kind: TimerKind::Reconnect, period: Duration::from_secs(3) },
                ]
            );
            state.handle(Event::ReconnectDue, now);
        }
    }

    #[test]
    fn duplicate_close_and_reconnect_triggers_are_ignored() {
        let now = Instant::now();
        let mut state = machine();
        connected(&mut state, now);

        state.handle(Event::Closed { error: Some("reset".into()) }, now);
        assert!(state.handle(Event::Closed { error: None }, now).is_empty());

        state.handle(Event::ReconnectDue, now);
        assert_eq!(state.phase(), ConnectionPhase::Connecting);
        assert!(state.handle(Event::ReconnectDue, now).is_empty());
        assert!(state.handle(Event::Start, now).is_empty());
    }

    #[test]
    fn five_reconnect_cycles_never_leave_duplicate_timers() {
        let now = Instant::now();
        let mut state = machine();
        let mut armed = Vec::new();

        apply_timers(&mut armed, &state.handle(Event::Start, now));
        for _ in 0..5 {
            apply_timers(&mut armed, &state.handle(Event::Connected, now));
            let kinds: HashSet<_> = armed.iter().collect();
            assert_eq!(kinds.len(), armed.len(), "duplicate timer armed: {armed:?}");
            assert!(armed.contains(&TimerKind::Heartbeat));
            assert!(armed.contains(&TimerKind::HealthCheck));

            apply_timers(&mut armed, &state.handle(Event::Closed { error: None }, now));
            assert_eq!(armed, vec![TimerKind::Reconnect]);

            apply_timers(&mut armed, &state.handle(Event::ReconnectDue, now));
        }
    }

    #[test]
    fn heartbeat_counter_increments_only_while_connected() {
        let now = Instant::now();
        let mut state = machine();
        assert!(state.handle(Event::HeartbeatDue, now).is_empty());

        connected(&mut state, now);
        assert_eq!(
            state.handle(Event::HeartbeatDue, now),
            vec![Effect::SendHeartbeat { counter: 1 }]
        );
        assert_eq!(
            state.handle(Event::HeartbeatDue, now),
            vec![Effect::SendHeartbeat { counter: 2 }]
        );
    }

    #[test]
    fn stall_on_dead_socket_forces_reconnect() {
        let start = Instant::now();
        let mut state = machine();
        connected(&mut state, start);

        let later = start + Duration::from_secs(121);
        let effects = state.handle(Event::HealthCheckDue { probe: SocketProbe::DEAD }, later);
        assert_eq!(state.phase(), ConnectionPhase::Reconnecting);
        assert!(effects.contains(&Effect::CloseSocket));
        match effects.iter().find(|e| matches!(e, Effect::EmitStatus(_))) {
            Some(Effect::EmitStatus(status)) => {
                assert!(!status.connected);
                assert!(status.error.as_deref().unwrap_or_default().contains("socket is dead"));
            }
            other => panic!("expected status effect, got {other:?}"),
        }
    }

    #[test]
    fn stall_on_half_alive_socket_is_tolerated() {
        let start = Instant::now();
        let mut state = machine();
        connected(&mut state, start);

        let later = start + Duration::from_secs(600);
        for probe in [
            SocketProbe::ALIVE,
            SocketProbe { readable: true, writable: false },
            SocketProbe { readable: false, writable: true },
        ] {
            assert!(state.handle(Event::HealthCheckDue { probe }, later).is_empty());
            assert_eq!(state.phase(), ConnectionPhase::Connected);
        }
    }

    #[test]
    fn recent_data_keeps_dead_probe_harmless() {
        let start = Instant::now();
        let mut state = machine();
        connected(&mut state, start);

        let later = start + Duration::from_secs(200);
        state.handle(Event::DataReceived, later - Duration::from_secs(10));
        assert!(state.handle(Event::HealthCheckDue { probe: SocketProbe::DEAD }, later).is_empty());
        assert_eq!(state.phase(), ConnectionPhase::Connected);
    }

    #[test]
    fn shutdown_is_terminal_and_ordered() {
        let now = Instant::now();
        let mut state = machine();
        connected(&mut state, now);

        let effects = state.handle(Event::Shutdown, now);
        assert_eq!(
            effects,
            vec![
                Effect::CancelTimer(TimerKind::Reconnect),
                Effect::CancelTimer(TimerKind::HealthCheck),
                Effect::CancelTimer(TimerKind::Heartbeat),
                Effect::AbortConnect,
                Effect::CloseSocket,
            ]
        );
        assert!(!state.can_write());

        // The close that follows the destroyed socket must not reconnect
        assert!(state.handle(Event::Closed { error: None }, now).is_empty());
        assert!(state.handle(Event::ReconnectDue, now).is_empty());
        assert!(state.handle(Event::Shutdown, now).is_empty());
        assert_eq!(state.handle(Event::Connected, now), vec![Effect::CloseSocket]);
        assert_eq!(state.phase(), ConnectionPhase::ShuttingDown);
    }
}
