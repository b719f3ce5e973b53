// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Connection Manager
//!
//! This module provides the error taxonomy for connection, channel and
//! topology operations. The `AmqpError` enum covers everything that can go
//! wrong while establishing a connection, asserting the topology, or waiting
//! for a usable channel. `AmqpError::is_fatal` is the single classification
//! point the lifecycle consults to decide between reconnecting and giving up.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Transport and channel errors are handled inside the connection lifecycle
/// and never reach application code directly; only fatal topology errors and
/// the facade's own timeout/closed conditions are surfaced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// A declared entity already exists with incompatible parameters.
    ///
    /// Retrying would repeat the same mismatch, so this error is terminal.
    #[error("topology precondition failed: {0}")]
    PreconditionFailedError(String),

    /// The broker reported an asynchronous error or close on a live handle
    #[error("connection lost: {0}")]
    ConnectionLostError(String),

    /// No channel became ready within the facade's wait window
    #[error("timed out waiting for a channel")]
    ChannelWaitTimeoutError,

    /// A channel was requested after the manager was closed
    #[error("connection manager is closed")]
    ClosedError,
}

impl AmqpError {
    /// Whether the error is unrecoverable by reconnecting.
    ///
    /// Only topology precondition mismatches qualify; every transport or
    /// channel failure is treated as transient.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AmqpError::PreconditionFailedError(_))
    }
}
