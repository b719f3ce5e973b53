// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Scripted in-memory transport for lifecycle and manager tests.
//!
//! Each connect attempt consumes the next [`ConnectOutcome`] from the script
//! (defaulting to `Accept` once the script runs dry). The fake records every
//! broker operation in order, counts live handles to verify the
//! no-duplicate/no-leak invariants, and exposes the last registered link
//! listener so tests can inject asynchronous connection loss.

// Each test binary uses a different subset of this module.
#![allow(dead_code)]

use amqp_manager::{
    config::ConnectionConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{LinkEvent, LinkListener, Transport, TransportChannel, TransportConnection},
};
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// What the next connect attempt should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The connection itself is refused
    Refuse,
    /// The connection opens but channel creation fails
    ChannelFail,
    /// Channel opens but the first exchange declaration fails transiently
    DeclareFail,
    /// Channel opens but the first exchange declaration hits AMQP 406
    PreconditionFail,
    /// Everything succeeds
    Accept,
}

#[derive(Default)]
pub struct FakeState {
    script: Mutex<VecDeque<ConnectOutcome>>,
    pub connects: AtomicUsize,
    pub live_connections: AtomicUsize,
    pub live_channels: AtomicUsize,
    pub max_live_connections: AtomicUsize,
    pub max_live_channels: AtomicUsize,
    pub log: Mutex<Vec<String>>,
    connection_listener: Mutex<Option<LinkListener>>,
    channel_listener: Mutex<Option<LinkListener>>,
    connect_delay: Mutex<Duration>,
}

impl FakeState {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> (usize, usize) {
        (
            self.max_live_connections.load(Ordering::SeqCst),
            self.max_live_channels.load(Ordering::SeqCst),
        )
    }

    pub fn leaked(&self) -> (usize, usize) {
        (
            self.live_connections.load(Ordering::SeqCst),
            self.live_channels.load(Ordering::SeqCst),
        )
    }

    /// Fires the current connection's link listener, simulating an
    /// asynchronous broker-side failure.
    pub fn fail_link(&self, reason: &str) {
        if let Some(listener) = &*self.connection_listener.lock().unwrap() {
            listener(LinkEvent::Error(reason.to_owned()));
        }
    }

    /// Fires the current channel's link listener, simulating a channel-level
    /// failure while the connection stays up.
    pub fn fail_channel_link(&self, reason: &str) {
        if let Some(listener) = &*self.channel_listener.lock().unwrap() {
            listener(LinkEvent::Error(reason.to_owned()));
        }
    }
}

pub struct FakeTransport {
    pub state: Arc<FakeState>,
}

impl FakeTransport {
    pub fn new() -> FakeTransport {
        FakeTransport {
            state: Arc::new(FakeState::default()),
        }
    }

    pub fn scripted(outcomes: impl IntoIterator<Item = ConnectOutcome>) -> FakeTransport {
        let transport = FakeTransport::new();
        transport
            .state
            .script
            .lock()
            .unwrap()
            .extend(outcomes);
        transport
    }

    /// Delays every connect attempt, so tests can observe the waiting phase.
    pub fn with_connect_delay(self, delay: Duration) -> FakeTransport {
        *self.state.connect_delay.lock().unwrap() = delay;
        self
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        _configs: &ConnectionConfigs,
    ) -> Result<Box<dyn TransportConnection>, AmqpError> {
        let delay = *self.state.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let outcome = self
            .state
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ConnectOutcome::Accept);

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.log.lock().unwrap().push("connect".to_owned());

        if outcome == ConnectOutcome::Refuse {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let live = self.state.live_connections.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .max_live_connections
            .fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(FakeConnection {
            state: self.state.clone(),
            outcome,
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeConnection {
    state: Arc<FakeState>,
    outcome: ConnectOutcome,
    closed: AtomicBool,
}

#[async_trait]
impl TransportConnection for FakeConnection {
    async fn open_channel(&self, confirm: bool) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        self.state
            .log
            .lock()
            .unwrap()
            .push(format!("create_channel confirm={confirm}"));

        if self.outcome == ConnectOutcome::ChannelFail {
            return Err(AmqpError::ChannelError("channel refused".to_owned()));
        }

        let live = self.state.live_channels.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .max_live_channels
            .fetch_max(live, Ordering::SeqCst);

        Ok(Arc::new(FakeChannel {
            state: self.state.clone(),
            outcome: self.outcome,
            closed: AtomicBool::new(false),
        }))
    }

    fn watch(&self, listener: LinkListener) {
        *self.state.connection_listener.lock().unwrap() = Some(listener);
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.live_connections.fetch_sub(1, Ordering::SeqCst);
            self.state.log.lock().unwrap().push("close_connection".to_owned());
        }
    }
}

struct FakeChannel {
    state: Arc<FakeState>,
    outcome: ConnectOutcome,
    closed: AtomicBool,
}

#[async_trait]
impl TransportChannel for FakeChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.state
            .log
            .lock()
            .unwrap()
            .push(format!("qos {prefetch_count}"));
        Ok(())
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        match self.outcome {
            ConnectOutcome::DeclareFail => {
                return Err(AmqpError::DeclareExchangeError(def.name().to_owned()))
            }
            ConnectOutcome::PreconditionFail => {
                return Err(AmqpError::PreconditionFailedError(format!(
                    "PRECONDITION-FAILED on exchange `{}`",
                    def.name()
                )))
            }
            _ => {}
        }

        self.state
            .log
            .lock()
            .unwrap()
            .push(format!("declare_exchange {}", def.name()));
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.state
            .log
            .lock()
            .unwrap()
            .push(format!("declare_queue {}", def.name()));
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.state
            .log
            .lock()
            .unwrap()
            .push(format!(
                "bind_queue {} {} {}",
                binding.queue_name(),
                binding.exchange_name(),
                binding.key()
            ));
        Ok(())
    }

    fn watch(&self, listener: LinkListener) {
        *self.state.channel_listener.lock().unwrap() = Some(listener);
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.live_channels.fetch_sub(1, Ordering::SeqCst);
            self.state.log.lock().unwrap().push("close_channel".to_owned());
        }
    }
}
