//! Connection state machine for following one task over the relay.
//!
//! [`ConnectionController`] performs no I/O. Every input returns the
//! [`Command`]s the driver must carry out, which keeps the reconnect
//! policy testable without sockets or timers.
//!
//! ```text
//! Idle -> Connecting -> Open -> Closed
//!            ^           |
//!            +-----------+  abnormal close, retries left
//!                        |
//!                        +-> Failed  retries exhausted
//! ```
//!
//! Each connection attempt carries an [`AttemptId`]. Changing task or
//! tearing down bumps the id, so a connection that completes for an older
//! attempt is discarded instead of adopted.

use std::time::Duration;

use taskrelay_core::messages::ClientMessage;

use crate::reconnect::{next_delay, ReconnectConfig};

pub type AttemptId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No task to follow.
    Idle,
    /// A connection attempt is in flight or scheduled.
    Connecting,
    Open,
    /// Closed on purpose or by a normal close from the server.
    Closed,
    /// Reconnect retries exhausted. Only a manual reconnect leaves this.
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Normal close handshake.
    Clean,
    Abnormal,
}

/// Side effect requested by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Open a new connection for `attempt`.
    Connect { attempt: AttemptId },
    /// Keep the connection that just completed for `attempt`.
    Adopt { attempt: AttemptId },
    /// Close a connection that completed for a superseded attempt.
    Discard { attempt: AttemptId },
    /// Write a control message on the open connection.
    Send(ClientMessage),
    /// Close the open connection of `attempt`.
    Close { attempt: AttemptId },
    /// Report back via [`ConnectionController::on_timer`] after `delay`.
    ScheduleReconnect { attempt: AttemptId, delay: Duration },
    CancelReconnect,
}

pub struct ConnectionController {
    config: ReconnectConfig,
    state: ConnectionState,
    task_id: Option<String>,
    attempt: AttemptId,
    retries: u32,
    delay: Duration,
    reconnect_pending: bool,
}

impl ConnectionController {
    pub fn new(config: ReconnectConfig) -> Self {
        let delay = config.initial_delay;
        Self {
            config,
            state: ConnectionState::Idle,
            task_id: None,
            attempt: 0,
            retries: 0,
            delay,
            reconnect_pending: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    /// Retries spent since the connection was last open.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    /// Follow `task_id`, or stop following when it is `None` or blank.
    pub fn set_task(&mut self, task_id: Option<&str>) -> Vec<Command> {
        let Some(task_id) = task_id.map(str::trim).filter(|t| !t.is_empty()) else {
            if self.task_id.take().is_none() {
                return Vec::new();
            }
            return self.teardown(ConnectionState::Idle);
        };

        if self.task_id.as_deref() == Some(task_id) {
            return match self.state {
                ConnectionState::Open | ConnectionState::Connecting => Vec::new(),
                _ => self.start_fresh(),
            };
        }

        self.task_id = Some(task_id.to_string());
        match self.state {
            // The server switches the subscription on the same connection.
            ConnectionState::Open => vec![Command::Send(ClientMessage::subscribe(task_id))],
            _ => self.start_fresh(),
        }
    }

    /// Close on purpose. No reconnect follows.
    pub fn disconnect(&mut self) -> Vec<Command> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Failed => Vec::new(),
            _ => self.teardown(ConnectionState::Closed),
        }
    }

    /// Manual reconnect, typically after [`ConnectionState::Failed`].
    pub fn reconnect(&mut self) -> Vec<Command> {
        if self.task_id.is_none() {
            return Vec::new();
        }
        match self.state {
            ConnectionState::Open | ConnectionState::Connecting => Vec::new(),
            _ => self.start_fresh(),
        }
    }

    /// Forward a control message when the connection is open.
    pub fn send(&mut self, message: ClientMessage) -> Vec<Command> {
        if self.state == ConnectionState::Open {
            vec![Command::Send(message)]
        } else {
            Vec::new()
        }
    }

    /// A connection attempt completed.
    pub fn on_connected(&mut self, attempt: AttemptId) -> Vec<Command> {
        if !self.is_live_attempt(attempt) {
            return vec![Command::Discard { attempt }];
        }
        let Some(task_id) = self.task_id.clone() else {
            return vec![Command::Discard { attempt }];
        };

        self.state = ConnectionState::Open;
        self.retries = 0;
        self.delay = self.config.initial_delay;
        vec![
            Command::Adopt { attempt },
            Command::Send(ClientMessage::subscribe(task_id)),
        ]
    }

    /// A connection attempt failed before opening.
    pub fn on_connect_failed(&mut self, attempt: AttemptId) -> Vec<Command> {
        if !self.is_live_attempt(attempt) {
            return Vec::new();
        }
        self.retry_or_fail()
    }

    /// The open connection of `attempt` ended.
    pub fn on_closed(&mut self, attempt: AttemptId, kind: CloseKind) -> Vec<Command> {
        if attempt != self.attempt || self.state != ConnectionState::Open {
            return Vec::new();
        }
        match kind {
            CloseKind::Clean => {
                self.state = ConnectionState::Closed;
                Vec::new()
            }
            CloseKind::Abnormal => self.retry_or_fail(),
        }
    }

    /// A scheduled reconnect is due.
    pub fn on_timer(&mut self, attempt: AttemptId) -> Vec<Command> {
        if attempt != self.attempt || !self.reconnect_pending {
            return Vec::new();
        }
        self.reconnect_pending = false;
        vec![Command::Connect { attempt }]
    }

    fn is_live_attempt(&self, attempt: AttemptId) -> bool {
        attempt == self.attempt
            && self.state == ConnectionState::Connecting
            && !self.reconnect_pending
    }

    fn start_fresh(&mut self) -> Vec<Command> {
        let mut commands = self.teardown(ConnectionState::Connecting);
        self.retries = 0;
        self.delay = self.config.initial_delay;
        commands.push(Command::Connect {
            attempt: self.attempt,
        });
        commands
    }

    /// Drop whatever the current attempt holds and move to `next`.
    fn teardown(&mut self, next: ConnectionState) -> Vec<Command> {
        let mut commands = Vec::new();
        if std::mem::take(&mut self.reconnect_pending) {
            commands.push(Command::CancelReconnect);
        }
        if self.state == ConnectionState::Open {
            commands.push(Command::Close {
                attempt: self.attempt,
            });
        }
        self.attempt += 1;
        self.state = next;
        commands
    }

    fn retry_or_fail(&mut self) -> Vec<Command> {
        if self.retries >= self.config.max_retries {
            tracing::warn!(
                task_id = ?self.task_id,
                retries = self.retries,
                "Reconnect retries exhausted"
            );
            self.state = ConnectionState::Failed;
            return Vec::new();
        }

        self.retries += 1;
        let delay = self.delay;
        self.delay = next_delay(self.delay, &self.config);
        self.attempt += 1;
        self.reconnect_pending = true;
        self.state = ConnectionState::Connecting;
        tracing::info!(
            task_id = ?self.task_id,
            retry = self.retries,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        vec![Command::ScheduleReconnect {
            attempt: self.attempt,
            delay,
        }]
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn controller() -> ConnectionController {
        ConnectionController::new(ReconnectConfig::default())
    }

    fn connect_attempt(commands: &[Command]) -> AttemptId {
        commands
            .iter()
            .find_map(|c| match c {
                Command::Connect { attempt } => Some(*attempt),
                _ => None,
            })
            .expect("no connect command")
    }

    fn scheduled_attempt(commands: &[Command]) -> AttemptId {
        match commands {
            [Command::ScheduleReconnect { attempt, .. }] => *attempt,
            other => panic!("expected a scheduled reconnect, got {other:?}"),
        }
    }

    fn subscribes(commands: &[Command]) -> usize {
        commands
            .iter()
            .filter(|c| matches!(c, Command::Send(ClientMessage::Subscribe { .. })))
            .count()
    }

    /// Follow T1 and complete the first connection.
    fn open(c: &mut ConnectionController) -> AttemptId {
        let attempt = connect_attempt(&c.set_task(Some("T1")));
        c.on_connected(attempt);
        attempt
    }

    // -- lifecycle -----------------------------------------------------------

    #[test]
    fn blank_task_is_noop() {
        let mut c = controller();
        assert!(c.set_task(Some("  ")).is_empty());
        assert!(c.set_task(None).is_empty());
        assert_eq!(c.state(), ConnectionState::Idle);
    }

    #[test]
    fn open_sends_subscription_intent() {
        let mut c = controller();
        let attempt = connect_attempt(&c.set_task(Some("T1")));
        assert_eq!(c.state(), ConnectionState::Connecting);

        let commands = c.on_connected(attempt);
        assert_eq!(
            commands,
            vec![
                Command::Adopt { attempt },
                Command::Send(ClientMessage::subscribe("T1")),
            ]
        );
        assert_eq!(c.state(), ConnectionState::Open);
    }

    #[test]
    fn clean_close_does_not_reconnect() {
        let mut c = controller();
        let attempt = open(&mut c);

        assert!(c.on_closed(attempt, CloseKind::Clean).is_empty());
        assert_eq!(c.state(), ConnectionState::Closed);
    }

    #[test]
    fn disconnect_closes_without_reconnect() {
        let mut c = controller();
        let attempt = open(&mut c);

        assert_eq!(c.disconnect(), vec![Command::Close { attempt }]);
        assert_eq!(c.state(), ConnectionState::Closed);
        // The transport reporting its close afterwards changes nothing.
        assert!(c.on_closed(attempt, CloseKind::Abnormal).is_empty());
        assert_eq!(c.state(), ConnectionState::Closed);
    }

    #[test]
    fn clearing_task_goes_idle() {
        let mut c = controller();
        let attempt = open(&mut c);

        assert_eq!(c.set_task(None), vec![Command::Close { attempt }]);
        assert_eq!(c.state(), ConnectionState::Idle);
        assert_eq!(c.task_id(), None);
    }

    #[test]
    fn switching_task_while_open_resubscribes_in_place() {
        let mut c = controller();
        open(&mut c);

        assert_eq!(
            c.set_task(Some("T2")),
            vec![Command::Send(ClientMessage::subscribe("T2"))]
        );
        assert_eq!(c.state(), ConnectionState::Open);
    }

    #[test]
    fn send_only_when_open() {
        let mut c = controller();
        assert!(c.send(ClientMessage::unsubscribe("T1")).is_empty());
        open(&mut c);
        assert_eq!(
            c.send(ClientMessage::unsubscribe("T1")),
            vec![Command::Send(ClientMessage::unsubscribe("T1"))]
        );
    }

    // -- reconnect policy ----------------------------------------------------

    #[test]
    fn fewer_failures_than_max_end_open_with_one_resubscribe() {
        let config = ReconnectConfig::default();
        for failures in 0..config.max_retries {
            let mut c = controller();
            let first = open(&mut c);

            let mut attempt = scheduled_attempt(&c.on_closed(first, CloseKind::Abnormal));
            for _ in 0..failures {
                assert_eq!(c.on_timer(attempt), vec![Command::Connect { attempt }]);
                attempt = scheduled_attempt(&c.on_connect_failed(attempt));
            }

            assert_eq!(c.on_timer(attempt), vec![Command::Connect { attempt }]);
            let commands = c.on_connected(attempt);
            assert_eq!(subscribes(&commands), 1, "failures = {failures}");
            assert_eq!(c.state(), ConnectionState::Open);
            assert_eq!(c.retries(), 0);
        }
    }

    #[test]
    fn max_failures_end_failed_without_further_attempts() {
        let mut c = controller();
        let first = open(&mut c);

        let mut attempt = scheduled_attempt(&c.on_closed(first, CloseKind::Abnormal));
        for _ in 1..ReconnectConfig::default().max_retries {
            c.on_timer(attempt);
            attempt = scheduled_attempt(&c.on_connect_failed(attempt));
        }
        c.on_timer(attempt);
        assert!(c.on_connect_failed(attempt).is_empty());
        assert_eq!(c.state(), ConnectionState::Failed);

        // Nothing revives it except a manual reconnect.
        assert!(c.on_timer(attempt).is_empty());
        assert!(c.on_connect_failed(attempt).is_empty());
        assert_eq!(c.state(), ConnectionState::Failed);

        let commands = c.reconnect();
        assert_matches!(commands.as_slice(), [Command::Connect { .. }]);
        assert_eq!(c.retries(), 0);
    }

    #[test]
    fn backoff_delay_follows_config() {
        let mut c = ConnectionController::new(ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            ..Default::default()
        });
        let first = open(&mut c);

        let commands = c.on_closed(first, CloseKind::Abnormal);
        assert_matches!(
            commands.as_slice(),
            [Command::ScheduleReconnect { delay, .. }] if *delay == Duration::from_millis(100)
        );
        let attempt = scheduled_attempt(&commands);
        c.on_timer(attempt);
        assert_matches!(
            c.on_connect_failed(attempt).as_slice(),
            [Command::ScheduleReconnect { delay, .. }] if *delay == Duration::from_millis(200)
        );
    }

    // -- stale attempts ------------------------------------------------------

    #[test]
    fn task_switch_cancels_pending_reconnect() {
        let mut c = controller();
        let first = open(&mut c);
        let pending = scheduled_attempt(&c.on_closed(first, CloseKind::Abnormal));

        let commands = c.set_task(Some("T2"));
        assert_eq!(commands[0], Command::CancelReconnect);
        let fresh = connect_attempt(&commands);
        assert_ne!(fresh, pending);

        // The old timer firing late is ignored.
        assert!(c.on_timer(pending).is_empty());
        assert_eq!(
            c.on_connected(fresh),
            vec![
                Command::Adopt { attempt: fresh },
                Command::Send(ClientMessage::subscribe("T2")),
            ]
        );
    }

    #[test]
    fn late_connection_for_previous_task_is_discarded() {
        let mut c = controller();
        let stale = connect_attempt(&c.set_task(Some("T1")));
        let fresh = connect_attempt(&c.set_task(Some("T2")));

        assert_eq!(c.on_connected(stale), vec![Command::Discard { attempt: stale }]);
        assert_eq!(c.state(), ConnectionState::Connecting);
        assert!(c.on_connect_failed(stale).is_empty());

        assert_eq!(subscribes(&c.on_connected(fresh)), 1);
    }

    #[test]
    fn connection_arriving_after_disconnect_is_discarded() {
        let mut c = controller();
        let attempt = connect_attempt(&c.set_task(Some("T1")));
        c.disconnect();

        assert_eq!(c.on_connected(attempt), vec![Command::Discard { attempt }]);
        assert_eq!(c.state(), ConnectionState::Closed);
    }

    #[test]
    fn close_of_superseded_connection_is_ignored() {
        let mut c = controller();
        let first = open(&mut c);
        c.set_task(None);
        let second = connect_attempt(&c.set_task(Some("T2")));
        c.on_connected(second);

        assert!(c.on_closed(first, CloseKind::Abnormal).is_empty());
        assert_eq!(c.state(), ConnectionState::Open);
    }
}
