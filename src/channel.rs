// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport Implementation
//!
//! This module implements the transport traits on top of lapin. It handles
//! connecting to the RabbitMQ server, creating channels (in confirm mode when
//! configured), translating exchange/queue definitions into broker
//! declarations, and mapping lapin errors into the crate's error taxonomy.

use crate::{
    config::ConnectionConfigs,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    transport::{LinkEvent, LinkListener, Transport, TransportChannel, TransportConnection},
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Production transport backed by lapin.
pub struct LapinTransport;

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(
        &self,
        configs: &ConnectionConfigs,
    ) -> Result<Box<dyn TransportConnection>, AmqpError> {
        debug!("creating amqp connection...");

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(configs.name.clone()));

        let connection = match Connection::connect(&configs.uri(), options).await {
            Ok(connection) => Ok(connection),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;

        debug!("amqp connected");

        Ok(Box::new(LapinConnection { inner: connection }))
    }
}

struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl TransportConnection for LapinConnection {
    async fn open_channel(&self, confirm: bool) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        debug!("creating amqp channel...");

        let channel = match self.inner.create_channel().await {
            Ok(channel) => Ok(channel),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;

        if confirm {
            if let Err(err) = channel.confirm_select(ConfirmSelectOptions::default()).await {
                error!(error = err.to_string(), "error to select confirm mode");
                return Err(AmqpError::ChannelError(err.to_string()));
            }
        }

        debug!("channel created");

        Ok(Arc::new(LapinChannel { inner: channel }))
    }

    fn watch(&self, listener: LinkListener) {
        self.inner.on_error(move |err| {
            listener(LinkEvent::Error(err.to_string()));
        });
    }

    async fn close(&self) {
        if let Err(err) = self.inner.close(0, "closing").await {
            warn!(error = err.to_string(), "error to close the connection");
        }
    }
}

struct LapinChannel {
    inner: Channel,
}

#[async_trait]
impl TransportChannel for LapinChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        match self
            .inner
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name());

        let mut params = BTreeMap::new();
        for (key, value) in &def.params {
            params.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }

        match self
            .inner
            .exchange_declare(
                def.name(),
                exchange_kind(&def.kind),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                FieldTable::from(params),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the exchange"
                );
                Err(classify_declare_error(
                    &err,
                    AmqpError::DeclareExchangeError(def.name().to_owned()),
                ))
            }
            _ => {
                debug!("exchange: {} was created", def.name());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name());

        match self
            .inner
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                FieldTable::from(queue_args(def)),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the queue"
                );
                Err(classify_declare_error(
                    &err,
                    AmqpError::DeclareQueueError(def.name().to_owned()),
                ))
            }
            _ => {
                debug!("queue: {} was created", def.name());
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .inner
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(classify_declare_error(
                    &err,
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    ),
                ))
            }
            _ => {
                debug!("queue was bounded");
                Ok(())
            }
        }
    }

    fn watch(&self, listener: LinkListener) {
        self.inner.on_error(move |err| {
            listener(LinkEvent::Error(err.to_string()));
        });
    }

    async fn close(&self) {
        if let Err(err) = self.inner.close(0, "closing").await {
            warn!(error = err.to_string(), "error to close the channel");
        }
    }
}

fn exchange_kind(kind: &ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::XMessageDelayed => lapin::ExchangeKind::Custom("x-delayed-message".to_owned()),
    }
}

/// Builds the argument table for a queue declaration.
fn queue_args(def: &QueueDefinition) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = BTreeMap::new();

    if let Some(exchange) = &def.dead_letter_exchange {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange.clone())),
        );
    }

    if let Some(routing_key) = &def.dead_letter_routing_key {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(routing_key.clone())),
        );
    }

    if let Some(ttl) = def.ttl {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    if let Some(max) = def.max_length {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    if let Some(max_bytes) = def.max_length_bytes {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
            AMQPValue::LongInt(LongInt::from(max_bytes)),
        );
    }

    args
}

/// Maps a declaration failure to the crate taxonomy, detecting AMQP 406.
///
/// A precondition failure means the entity already exists with incompatible
/// parameters; the broker reports it as channel error 406 and the marker is
/// present in the error text.
fn classify_declare_error(err: &lapin::Error, fallback: AmqpError) -> AmqpError {
    if err.to_string().to_uppercase().contains("PRECONDITION") {
        return AmqpError::PreconditionFailedError(err.to_string());
    }

    fallback
}
