// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Assertion
//!
//! This module turns a [`TopologyDefinition`](crate::config::TopologyDefinition)
//! into broker state on a freshly opened channel. Declarations run in three
//! phases: all exchanges in parallel, then all queues in parallel, then all
//! bindings in parallel. Bindings reference exchanges and queues, so the
//! third phase only starts once both previous phases completed. Queues with
//! retry or DLQ companions declare the companions before the queue itself so
//! the queue's dead-letter target exists first.

use crate::{
    config::AmqpConfigs,
    errors::AmqpError,
    queue::QueueDefinition,
    transport::{TransportChannel, TransportConnection},
};
use futures_util::future::try_join_all;
use std::sync::Arc;
use tracing::debug;

/// Opens a channel on the given connection and asserts the configured
/// topology on it.
///
/// On any failure after the channel was opened, the channel is closed before
/// the error is returned so no half-prepared channel outlives the attempt.
pub(crate) async fn setup_channel(
    connection: Arc<dyn TransportConnection>,
    configs: Arc<AmqpConfigs>,
) -> Result<Arc<dyn TransportChannel>, AmqpError> {
    let channel = connection.open_channel(configs.channel.confirm).await?;

    if let Err(err) = prepare_channel(&channel, &configs).await {
        channel.close().await;
        return Err(err);
    }

    Ok(channel)
}

async fn prepare_channel(
    channel: &Arc<dyn TransportChannel>,
    configs: &AmqpConfigs,
) -> Result<(), AmqpError> {
    channel.qos(configs.channel.prefetch_count).await?;
    assert_topology(channel, configs).await
}

/// Declares every exchange, queue, and binding of the configuration.
pub async fn assert_topology(
    channel: &Arc<dyn TransportChannel>,
    configs: &AmqpConfigs,
) -> Result<(), AmqpError> {
    let topology = &configs.topology;

    try_join_all(
        topology
            .exchanges
            .iter()
            .map(|def| channel.declare_exchange(def)),
    )
    .await?;

    try_join_all(
        topology
            .queues
            .iter()
            .map(|def| declare_queue_tree(channel, def)),
    )
    .await?;

    try_join_all(
        topology
            .bindings
            .iter()
            .map(|binding| channel.bind_queue(binding)),
    )
    .await?;

    debug!("topology installed");

    Ok(())
}

/// Declares a queue and its retry/DLQ companions, companions first.
async fn declare_queue_tree(
    channel: &Arc<dyn TransportChannel>,
    def: &QueueDefinition,
) -> Result<(), AmqpError> {
    for queue in queue_plan(def) {
        channel.declare_queue(&queue).await?;
    }

    Ok(())
}

/// Expands a queue definition into the ordered list of declarations it needs.
///
/// A retry companion dead-letters back into the main queue after its TTL; the
/// main queue dead-letters into the retry queue, or into the DLQ when only a
/// DLQ is configured. The default exchange routes dead-lettered messages by
/// queue name.
fn queue_plan(def: &QueueDefinition) -> Vec<QueueDefinition> {
    let mut plan = vec![];
    let mut main = def.clone();

    if let Some(retry_name) = &def.retry_name {
        let mut retry = QueueDefinition::new(retry_name).ttl(def.retry_ttl.unwrap_or_default());
        retry.durable = def.durable;
        retry.delete = def.delete;
        retry.exclusive = def.exclusive;
        retry.passive = def.passive;
        retry.no_wait = def.no_wait;
        retry.dead_letter_exchange = Some("".to_owned());
        retry.dead_letter_routing_key = Some(def.name().to_owned());
        plan.push(retry);

        main.dead_letter_exchange = Some("".to_owned());
        main.dead_letter_routing_key = Some(retry_name.clone());
    }

    if let Some(dlq_name) = &def.dlq_name {
        let mut dlq = QueueDefinition::new(dlq_name);
        dlq.durable = def.durable;
        dlq.delete = def.delete;
        dlq.exclusive = def.exclusive;
        dlq.passive = def.passive;
        dlq.no_wait = def.no_wait;
        plan.push(dlq);

        if def.retry_name.is_none() {
            main.dead_letter_exchange = Some("".to_owned());
            main.dead_letter_routing_key = Some(dlq_name.clone());
        }
    }

    plan.push(main);
    plan
}
