// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Client Interface
//!
//! This module defines the narrow seam between the connection lifecycle and
//! the wire-level AMQP client. The lifecycle only ever talks to these traits;
//! the production implementation backed by lapin lives in the `channel`
//! module, and tests substitute scripted fakes or mocks.

use crate::{
    config::ConnectionConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;

/// Asynchronous notification from a live connection or channel handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The handle reported an error
    Error(String),
    /// The handle was closed by the broker or the peer
    Closed,
}

/// Callback registered on a handle to observe asynchronous link events.
pub type LinkListener = Box<dyn Fn(LinkEvent) + Send + Sync>;

/// Factory for transport connections.
///
/// Fails with a transport error on refused, unreachable, or auth-rejected
/// connections; all such failures are transient from the lifecycle's point
/// of view.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(
        &self,
        configs: &ConnectionConfigs,
    ) -> Result<Box<dyn TransportConnection>, AmqpError>;
}

/// A live network-level session to the broker.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Opens a channel on this connection, in confirm mode when requested.
    async fn open_channel(&self, confirm: bool) -> Result<Arc<dyn TransportChannel>, AmqpError>;

    /// Registers a listener for asynchronous error/close notifications.
    fn watch(&self, listener: LinkListener);

    /// Closes the connection; errors during close are ignored.
    async fn close(&self);
}

/// A lightweight multiplexed session used to issue topology operations.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Applies the prefetch count via basic.qos.
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Declares an exchange.
    ///
    /// Fails with [`AmqpError::PreconditionFailedError`] when the exchange
    /// already exists with incompatible parameters.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue, including its argument table.
    ///
    /// Fails with [`AmqpError::PreconditionFailedError`] when the queue
    /// already exists with incompatible parameters.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    /// Binds a queue to an exchange.
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Registers a listener for asynchronous error/close notifications.
    fn watch(&self, listener: LinkListener);

    /// Closes the channel; errors during close are ignored.
    async fn close(&self);
}
