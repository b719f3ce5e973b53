// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle State Machine
//!
//! This module owns the full uninitialized → connect → assert topology →
//! connected → failure → reconnect cycle. The machine is a single actor: a
//! spawned task consumes an input queue one event at a time, so no two
//! transitions ever run concurrently. Every asynchronous operation (connect,
//! channel setup, backoff delay) runs as a spawned task whose completion
//! re-enters the queue as an input.
//!
//! The transition function [`ConnectionLifecycle::step`] is the only place
//! state changes. It returns the next state plus the side-effect commands to
//! run, which keeps the sequencing decisions testable without any I/O.
//!
//! Handles retired on reconnect or close are invalidated by bumping the
//! session epoch: listener callbacks and in-flight completions carry the
//! epoch of the attempt that created them, and stale inputs are discarded
//! (closing any handle they produced). lapin offers no listener
//! deregistration, so epoch filtering at the actor boundary is the reliable
//! equivalent of detaching them.

use crate::{
    config::AmqpConfigs,
    errors::AmqpError,
    topology,
    transport::{LinkEvent, LinkListener, Transport, TransportChannel, TransportConnection},
};
use std::{cmp::min, fmt, sync::Arc, time::Duration};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, warn};

/// Base delay of the exponential backoff
pub const BACKOFF_BASE_MS: u64 = 100;
/// Upper bound on the backoff delay
pub const BACKOFF_CAP_MS: u64 = 60_000;

/// Wait time before the Nth reconnect attempt (N >= 1): doubling per attempt
/// from the base, capped at one minute.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.min(32));
    Duration::from_millis(min(factor.saturating_mul(BACKOFF_BASE_MS), BACKOFF_CAP_MS))
}

/// The states of the connection lifecycle. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Idle,
    Connecting,
    AssertingTopology,
    Connected,
    Reconnecting,
    Errored,
    Closing,
    Closed,
}

/// Events emitted by the lifecycle, consumed by the connection manager.
#[derive(Clone)]
pub enum LifecycleEvent {
    /// The channel is fully set up and the topology is asserted
    Ready(Arc<dyn TransportChannel>),
    /// A reconnect attempt was scheduled
    Reconnecting { attempt: u32, delay: Duration },
    /// A fatal error was encountered; the machine is parked in `Errored`
    Error(AmqpError),
    /// The machine reached its terminal closed state
    Closed,
}

impl fmt::Debug for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Ready(_) => f.write_str("Ready"),
            LifecycleEvent::Reconnecting { attempt, delay } => f
                .debug_struct("Reconnecting")
                .field("attempt", attempt)
                .field("delay", delay)
                .finish(),
            LifecycleEvent::Error(err) => f.debug_tuple("Error").field(err).finish(),
            LifecycleEvent::Closed => f.write_str("Closed"),
        }
    }
}

/// Handle used to drive the lifecycle from outside the actor.
#[derive(Clone)]
pub struct LifecycleHandle {
    inputs: UnboundedSender<Input>,
}

impl LifecycleHandle {
    /// Requests the machine to begin connecting. Idempotent: a no-op while
    /// already connecting or connected.
    pub fn open(&self) {
        let _ = self.inputs.send(Input::Open);
    }

    /// Requests a graceful, terminal shutdown. After this point no reconnect
    /// attempt is ever scheduled again.
    pub fn close(&self) {
        let _ = self.inputs.send(Input::Close);
    }
}

enum Input {
    Open,
    Close,
    ConnectResult {
        epoch: u64,
        result: Result<Box<dyn TransportConnection>, AmqpError>,
    },
    AssertResult {
        epoch: u64,
        result: Result<Arc<dyn TransportChannel>, AmqpError>,
    },
    LinkLost {
        epoch: u64,
        reason: String,
    },
    BackoffElapsed {
        epoch: u64,
    },
}

enum Command {
    Connect {
        epoch: u64,
    },
    AssertTopology {
        epoch: u64,
        connection: Arc<dyn TransportConnection>,
    },
    ScheduleBackoff {
        epoch: u64,
        delay: Duration,
    },
    CloseConnection(Arc<dyn TransportConnection>),
    CloseChannel(Arc<dyn TransportChannel>),
    Emit(LifecycleEvent),
}

/// Mutable record held by the lifecycle across transitions.
struct Session {
    connection: Option<Arc<dyn TransportConnection>>,
    channel: Option<Arc<dyn TransportChannel>>,
    attempts: u32,
    epoch: u64,
    closed: bool,
}

/// The connection lifecycle state machine.
pub struct ConnectionLifecycle {
    configs: Arc<AmqpConfigs>,
    transport: Arc<dyn Transport>,
    state: LifecycleState,
    session: Session,
    inputs_tx: UnboundedSender<Input>,
    inputs_rx: UnboundedReceiver<Input>,
    events_tx: UnboundedSender<LifecycleEvent>,
}

impl ConnectionLifecycle {
    /// Spawns the lifecycle actor.
    ///
    /// Returns the handle used to open/close the machine and the receiver of
    /// lifecycle events. Events for a given connection attempt are delivered
    /// in order; `Ready` is only observable after every topology declaration
    /// of that attempt completed.
    pub fn spawn(
        configs: Arc<AmqpConfigs>,
        transport: Arc<dyn Transport>,
    ) -> (LifecycleHandle, UnboundedReceiver<LifecycleEvent>) {
        let (lifecycle, handle, events_rx) = ConnectionLifecycle::new(configs, transport);
        tokio::spawn(lifecycle.run());
        (handle, events_rx)
    }

    fn new(
        configs: Arc<AmqpConfigs>,
        transport: Arc<dyn Transport>,
    ) -> (
        ConnectionLifecycle,
        LifecycleHandle,
        UnboundedReceiver<LifecycleEvent>,
    ) {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let lifecycle = ConnectionLifecycle {
            configs,
            transport,
            state: LifecycleState::Uninitialized,
            session: Session {
                connection: None,
                channel: None,
                attempts: 0,
                epoch: 0,
                closed: false,
            },
            inputs_tx: inputs_tx.clone(),
            inputs_rx,
            events_tx,
        };

        (lifecycle, LifecycleHandle { inputs: inputs_tx }, events_rx)
    }

    async fn run(mut self) {
        while let Some(input) = self.inputs_rx.recv().await {
            // Inputs sent before the machine started are simply queued; the
            // first one consumed moves the machine out of Uninitialized.
            if self.state == LifecycleState::Uninitialized {
                self.state = LifecycleState::Idle;
            }

            let (next, commands) = self.step(input);
            if next != self.state {
                debug!(from = ?self.state, to = ?next, "lifecycle transition");
            }
            self.state = next;

            for command in commands {
                self.execute(command);
            }

            if self.state == LifecycleState::Closed {
                break;
            }
        }
    }

    /// The single transition function: next state plus side-effect commands.
    fn step(&mut self, input: Input) -> (LifecycleState, Vec<Command>) {
        use LifecycleState::*;

        match (self.state, input) {
            (Idle, Input::Open) => self.begin_connect(),
            (Errored, Input::Open) => {
                self.session.attempts = 0;
                self.begin_connect()
            }
            (_, Input::Open) => (self.state, vec![]),

            (Idle | Errored, Input::Close) => self.finish_close(),
            (Connected | Reconnecting, Input::Close) => self.finish_close(),
            (Connecting | AssertingTopology, Input::Close) => {
                // A connect or assert is in flight; its completion is
                // consumed by the Closing state below.
                self.session.closed = true;
                (Closing, vec![])
            }
            (_, Input::Close) => (self.state, vec![]),

            (Connecting, Input::ConnectResult { epoch, result })
                if epoch == self.session.epoch =>
            {
                match result {
                    Ok(connection) => {
                        let connection: Arc<dyn TransportConnection> = Arc::from(connection);
                        connection.watch(self.link_listener(epoch));
                        self.session.connection = Some(connection.clone());
                        (
                            AssertingTopology,
                            vec![Command::AssertTopology { epoch, connection }],
                        )
                    }
                    Err(err) => {
                        warn!(error = err.to_string(), "failure to connect");
                        self.begin_reconnect()
                    }
                }
            }

            (AssertingTopology, Input::AssertResult { epoch, result })
                if epoch == self.session.epoch =>
            {
                match result {
                    Ok(channel) => {
                        channel.watch(self.link_listener(epoch));
                        self.session.channel = Some(channel.clone());
                        self.session.attempts = 0;
                        (Connected, vec![Command::Emit(LifecycleEvent::Ready(channel))])
                    }
                    Err(err) if err.is_fatal() => {
                        error!(error = err.to_string(), "fatal topology error");
                        let mut commands = self.retire();
                        commands.push(Command::Emit(LifecycleEvent::Error(err)));
                        (Errored, commands)
                    }
                    Err(err) => {
                        warn!(error = err.to_string(), "failure to prepare the channel");
                        self.begin_reconnect()
                    }
                }
            }

            (Connecting | AssertingTopology | Connected, Input::LinkLost { epoch, reason })
                if epoch == self.session.epoch =>
            {
                warn!(reason, "connection lost");
                self.begin_reconnect()
            }

            (Reconnecting, Input::BackoffElapsed { epoch }) if epoch == self.session.epoch => {
                if self.session.closed {
                    self.finish_close()
                } else {
                    self.begin_connect()
                }
            }

            (Closing, Input::ConnectResult { result, .. }) => {
                let mut commands = vec![];
                if let Ok(connection) = result {
                    commands.push(Command::CloseConnection(Arc::from(connection)));
                }
                let (next, rest) = self.finish_close();
                commands.extend(rest);
                (next, commands)
            }
            (Closing, Input::AssertResult { result, .. }) => {
                let mut commands = vec![];
                if let Ok(channel) = result {
                    commands.push(Command::CloseChannel(channel));
                }
                let (next, rest) = self.finish_close();
                commands.extend(rest);
                (next, commands)
            }

            // Completions of retired attempts: close whatever they produced.
            (_, Input::ConnectResult { result: Ok(connection), .. }) => (
                self.state,
                vec![Command::CloseConnection(Arc::from(connection))],
            ),
            (_, Input::AssertResult { result: Ok(channel), .. }) => {
                (self.state, vec![Command::CloseChannel(channel)])
            }

            _ => (self.state, vec![]),
        }
    }

    fn begin_connect(&mut self) -> (LifecycleState, Vec<Command>) {
        self.session.epoch += 1;
        (
            LifecycleState::Connecting,
            vec![Command::Connect {
                epoch: self.session.epoch,
            }],
        )
    }

    fn begin_reconnect(&mut self) -> (LifecycleState, Vec<Command>) {
        let mut commands = self.retire();

        self.session.attempts += 1;
        let delay = backoff_delay(self.session.attempts);

        commands.push(Command::Emit(LifecycleEvent::Reconnecting {
            attempt: self.session.attempts,
            delay,
        }));
        commands.push(Command::ScheduleBackoff {
            epoch: self.session.epoch,
            delay,
        });

        (LifecycleState::Reconnecting, commands)
    }

    fn finish_close(&mut self) -> (LifecycleState, Vec<Command>) {
        self.session.closed = true;
        let mut commands = self.retire();
        commands.push(Command::Emit(LifecycleEvent::Closed));
        (LifecycleState::Closed, commands)
    }

    /// Retires the current handles: bumps the epoch so their listeners and
    /// in-flight completions are discarded, and closes them.
    fn retire(&mut self) -> Vec<Command> {
        self.session.epoch += 1;

        let mut commands = vec![];
        if let Some(channel) = self.session.channel.take() {
            commands.push(Command::CloseChannel(channel));
        }
        if let Some(connection) = self.session.connection.take() {
            commands.push(Command::CloseConnection(connection));
        }
        commands
    }

    fn link_listener(&self, epoch: u64) -> LinkListener {
        let inputs = self.inputs_tx.clone();
        Box::new(move |event| {
            let reason = match event {
                LinkEvent::Error(err) => err,
                LinkEvent::Closed => "link closed".to_owned(),
            };
            let _ = inputs.send(Input::LinkLost {
                epoch,
                reason,
            });
        })
    }

    fn execute(&self, command: Command) {
        match command {
            Command::Connect { epoch } => {
                let transport = self.transport.clone();
                let configs = self.configs.clone();
                let inputs = self.inputs_tx.clone();
                tokio::spawn(async move {
                    let result = transport.connect(&configs.connection).await;
                    let _ = inputs.send(Input::ConnectResult { epoch, result });
                });
            }
            Command::AssertTopology { epoch, connection } => {
                let configs = self.configs.clone();
                let inputs = self.inputs_tx.clone();
                tokio::spawn(async move {
                    let result = topology::setup_channel(connection, configs).await;
                    let _ = inputs.send(Input::AssertResult { epoch, result });
                });
            }
            Command::ScheduleBackoff { epoch, delay } => {
                let inputs = self.inputs_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inputs.send(Input::BackoffElapsed { epoch });
                });
            }
            Command::CloseConnection(connection) => {
                tokio::spawn(async move {
                    connection.close().await;
                });
            }
            Command::CloseChannel(channel) => {
                tokio::spawn(async move {
                    channel.close().await;
                });
            }
            Command::Emit(event) => {
                debug!(event = ?event, "lifecycle event");
                let _ = self.events_tx.send(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfigs;
    use async_trait::async_trait;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn connect(
            &self,
            _configs: &ConnectionConfigs,
        ) -> Result<Box<dyn TransportConnection>, AmqpError> {
            Err(AmqpError::InternalError)
        }
    }

    fn lifecycle() -> ConnectionLifecycle {
        let (lifecycle, _handle, _events) =
            ConnectionLifecycle::new(Arc::new(AmqpConfigs::default()), Arc::new(NullTransport));
        lifecycle
    }

    #[test]
    fn backoff_doubles_and_caps_at_one_minute() {
        for attempt in 1..=20u32 {
            let expected = min(2u64.pow(attempt) * BACKOFF_BASE_MS, BACKOFF_CAP_MS);
            assert_eq!(
                backoff_delay(attempt),
                Duration::from_millis(expected),
                "attempt {attempt}"
            );
        }

        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(9), Duration::from_millis(51_200));
        assert_eq!(backoff_delay(10), Duration::from_millis(60_000));
        assert_eq!(backoff_delay(64), Duration::from_millis(60_000));
    }

    #[test]
    fn open_is_idempotent_while_connecting() {
        let mut machine = lifecycle();
        machine.state = LifecycleState::Idle;

        let (next, commands) = machine.step(Input::Open);
        assert_eq!(next, LifecycleState::Connecting);
        assert!(matches!(commands.as_slice(), [Command::Connect { epoch: 1 }]));

        machine.state = next;
        let (next, commands) = machine.step(Input::Open);
        assert_eq!(next, LifecycleState::Connecting);
        assert!(commands.is_empty());
    }

    #[test]
    fn close_in_idle_is_immediately_terminal() {
        let mut machine = lifecycle();
        machine.state = LifecycleState::Idle;

        let (next, commands) = machine.step(Input::Close);
        assert_eq!(next, LifecycleState::Closed);
        assert!(machine.session.closed);
        assert!(matches!(
            commands.as_slice(),
            [Command::Emit(LifecycleEvent::Closed)]
        ));
    }

    #[test]
    fn connect_failure_schedules_backoff() {
        let mut machine = lifecycle();
        machine.state = LifecycleState::Connecting;
        machine.session.epoch = 1;

        let (next, commands) = machine.step(Input::ConnectResult {
            epoch: 1,
            result: Err(AmqpError::ConnectionError("refused".to_owned())),
        });

        assert_eq!(next, LifecycleState::Reconnecting);
        assert_eq!(machine.session.attempts, 1);
        assert!(matches!(
            commands.as_slice(),
            [
                Command::Emit(LifecycleEvent::Reconnecting { attempt: 1, .. }),
                Command::ScheduleBackoff { .. },
            ]
        ));
    }

    #[test]
    fn backoff_elapsed_after_close_never_reconnects() {
        let mut machine = lifecycle();
        machine.state = LifecycleState::Reconnecting;
        machine.session.epoch = 3;
        machine.session.closed = true;

        let (next, commands) = machine.step(Input::BackoffElapsed { epoch: 3 });

        assert_eq!(next, LifecycleState::Closed);
        assert!(matches!(
            commands.as_slice(),
            [Command::Emit(LifecycleEvent::Closed)]
        ));
    }

    #[test]
    fn stale_backoff_is_discarded() {
        let mut machine = lifecycle();
        machine.state = LifecycleState::Reconnecting;
        machine.session.epoch = 5;

        let (next, commands) = machine.step(Input::BackoffElapsed { epoch: 4 });

        assert_eq!(next, LifecycleState::Reconnecting);
        assert!(commands.is_empty());
    }

    #[test]
    fn stale_link_loss_is_discarded() {
        let mut machine = lifecycle();
        machine.state = LifecycleState::Connected;
        machine.session.epoch = 2;

        let (next, commands) = machine.step(Input::LinkLost {
            epoch: 1,
            reason: "old handle".to_owned(),
        });

        assert_eq!(next, LifecycleState::Connected);
        assert!(commands.is_empty());
    }

    #[test]
    fn fatal_assert_failure_parks_in_errored() {
        let mut machine = lifecycle();
        machine.state = LifecycleState::AssertingTopology;
        machine.session.epoch = 1;

        let (next, commands) = machine.step(Input::AssertResult {
            epoch: 1,
            result: Err(AmqpError::PreconditionFailedError("queue `q`".to_owned())),
        });

        assert_eq!(next, LifecycleState::Errored);
        assert!(matches!(
            commands.as_slice(),
            [Command::Emit(LifecycleEvent::Error(
                AmqpError::PreconditionFailedError(_)
            ))]
        ));

        // Reopening from Errored restarts with a fresh attempt counter.
        machine.state = next;
        machine.session.attempts = 7;
        let (next, _) = machine.step(Input::Open);
        assert_eq!(next, LifecycleState::Connecting);
        assert_eq!(machine.session.attempts, 0);
    }

    #[test]
    fn transient_assert_failure_reconnects() {
        let mut machine = lifecycle();
        machine.state = LifecycleState::AssertingTopology;
        machine.session.epoch = 1;

        let (next, _) = machine.step(Input::AssertResult {
            epoch: 1,
            result: Err(AmqpError::DeclareQueueError("q".to_owned())),
        });

        assert_eq!(next, LifecycleState::Reconnecting);
        assert_eq!(machine.session.attempts, 1);
    }
}
