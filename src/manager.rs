// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager Facade
//!
//! This module wraps the connection lifecycle behind a small request/response
//! surface for application code: `get_channel` returns the current channel or
//! waits for the next ready one, and `close` shuts the whole thing down. The
//! manager caches the channel handle the lifecycle produces, never creating
//! or retiring one itself, and bridges lifecycle events into a public
//! `connected`/`disconnected` stream.

use crate::{
    channel::LapinTransport,
    config::AmqpConfigs,
    errors::AmqpError,
    lifecycle::{ConnectionLifecycle, LifecycleEvent, LifecycleHandle},
    transport::{Transport, TransportChannel},
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{broadcast, mpsc::UnboundedReceiver, oneshot, watch};
use tracing::debug;

/// How long `get_channel` waits for the lifecycle to produce a channel.
pub const CHANNEL_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Public connectivity events emitted by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
}

#[derive(Default)]
struct ManagerInner {
    channel: Option<Arc<dyn TransportChannel>>,
    waiters: Vec<oneshot::Sender<Arc<dyn TransportChannel>>>,
    opened: bool,
    closed: bool,
    connected: bool,
}

/// Facade over the connection lifecycle.
///
/// The cached channel handle is shared read-only by all callers; only the
/// lifecycle creates or retires it.
pub struct ConnectionManager {
    lifecycle: LifecycleHandle,
    inner: Arc<Mutex<ManagerInner>>,
    events_tx: broadcast::Sender<ClientEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConnectionManager {
    /// Creates a manager connected through lapin.
    pub fn new(configs: AmqpConfigs) -> ConnectionManager {
        ConnectionManager::with_transport(configs, Arc::new(LapinTransport))
    }

    /// Creates a manager with an alternative transport implementation.
    pub fn with_transport(configs: AmqpConfigs, transport: Arc<dyn Transport>) -> ConnectionManager {
        let (lifecycle, lifecycle_events) =
            ConnectionLifecycle::spawn(Arc::new(configs), transport);

        let inner = Arc::new(Mutex::new(ManagerInner::default()));
        let (events_tx, _) = broadcast::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(pump(
            lifecycle_events,
            inner.clone(),
            events_tx.clone(),
            shutdown_tx,
        ));

        ConnectionManager {
            lifecycle,
            inner,
            events_tx,
            shutdown_rx,
        }
    }

    /// Returns a ready channel, waiting for the connection if necessary.
    ///
    /// The first call triggers the lifecycle to open; the lifecycle drives
    /// all retries internally from then on. Waiting callers are all resolved
    /// with the same channel when it becomes ready, in registration order.
    ///
    /// # Errors
    /// [`AmqpError::ChannelWaitTimeoutError`] if no channel becomes ready
    /// within [`CHANNEL_WAIT_TIMEOUT`]; [`AmqpError::ClosedError`] if the
    /// manager has been closed. Neither affects the underlying lifecycle.
    pub async fn get_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        let waiter = {
            let mut inner = self.inner.lock().unwrap();

            if inner.closed {
                return Err(AmqpError::ClosedError);
            }

            if let Some(channel) = &inner.channel {
                return Ok(channel.clone());
            }

            if !inner.opened {
                inner.opened = true;
                self.lifecycle.open();
            }

            // Callers that already timed out leave a dead sender behind;
            // sweep them so the list cannot grow without bound while the
            // connection stays down.
            inner.waiters.retain(|waiter| !waiter.is_closed());

            let (tx, rx) = oneshot::channel();
            inner.waiters.push(tx);
            rx
        };

        match tokio::time::timeout(CHANNEL_WAIT_TIMEOUT, waiter).await {
            Ok(Ok(channel)) => Ok(channel),
            // The pump dropped our waiter: the manager was closed.
            Ok(Err(_)) => Err(AmqpError::ClosedError),
            Err(_) => Err(AmqpError::ChannelWaitTimeoutError),
        }
    }

    /// Shuts the connection down for good. Idempotent; resolves once the
    /// lifecycle reaches its terminal closed state.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.lifecycle.close();

        let mut shutdown = self.shutdown_rx.clone();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        Ok(())
    }

    /// Subscribes to the public `connected`/`disconnected` event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events_tx.subscribe()
    }
}

/// Bridges lifecycle events into manager state and the public event stream.
async fn pump(
    mut events: UnboundedReceiver<LifecycleEvent>,
    inner: Arc<Mutex<ManagerInner>>,
    events_tx: broadcast::Sender<ClientEvent>,
    shutdown_tx: watch::Sender<bool>,
) {
    while let Some(event) = events.recv().await {
        match event {
            LifecycleEvent::Ready(channel) => {
                let waiters = {
                    let mut inner = inner.lock().unwrap();
                    inner.channel = Some(channel.clone());
                    inner.connected = true;
                    inner.waiters.drain(..).collect::<Vec<_>>()
                };

                for waiter in waiters {
                    let _ = waiter.send(channel.clone());
                }

                let _ = events_tx.send(ClientEvent::Connected);
            }
            LifecycleEvent::Reconnecting { attempt, delay } => {
                debug!(attempt, delay = ?delay, "reconnecting");
                if drop_channel(&inner) {
                    let _ = events_tx.send(ClientEvent::Disconnected);
                }
            }
            LifecycleEvent::Error(_) => {
                if drop_channel(&inner) {
                    let _ = events_tx.send(ClientEvent::Disconnected);
                }
            }
            LifecycleEvent::Closed => {
                let was_connected = {
                    let mut inner = inner.lock().unwrap();
                    inner.channel = None;
                    inner.closed = true;
                    // Dropping the waiters rejects pending callers.
                    inner.waiters.clear();
                    std::mem::replace(&mut inner.connected, false)
                };

                if was_connected {
                    let _ = events_tx.send(ClientEvent::Disconnected);
                }

                let _ = shutdown_tx.send(true);
                break;
            }
        }
    }
}

/// Clears the cached channel; true when the manager was connected before,
/// so `Disconnected` is emitted exactly once per loss.
fn drop_channel(inner: &Arc<Mutex<ManagerInner>>) -> bool {
    let mut inner = inner.lock().unwrap();
    inner.channel = None;
    std::mem::replace(&mut inner.connected, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConnectionConfigs,
        transport::{MockTransport, TransportConnection},
    };
    use async_trait::async_trait;

    struct StallTransport;

    #[async_trait]
    impl Transport for StallTransport {
        async fn connect(
            &self,
            _configs: &ConnectionConfigs,
        ) -> Result<Box<dyn TransportConnection>, AmqpError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(AmqpError::ConnectionError("unreachable".to_owned()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_waiters_are_swept() {
        let manager =
            ConnectionManager::with_transport(AmqpConfigs::default(), Arc::new(StallTransport));

        for _ in 0..5 {
            let err = manager.get_channel().await.err().unwrap();
            assert_eq!(err, AmqpError::ChannelWaitTimeoutError);
        }

        // Only the most recent (already dead) sender may remain.
        assert!(manager.inner.lock().unwrap().waiters.len() <= 1);
    }

    #[tokio::test]
    async fn close_before_open_never_connects() {
        let mut transport = MockTransport::new();
        transport.expect_connect().times(0);

        let manager = ConnectionManager::with_transport(AmqpConfigs::default(), Arc::new(transport));

        manager.close().await.unwrap();
        manager.close().await.unwrap();

        let err = manager.get_channel().await.err().unwrap();
        assert_eq!(err, AmqpError::ClosedError);
    }
}
