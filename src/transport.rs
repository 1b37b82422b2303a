// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Seam
//!
//! This module defines the narrow interface the session layer expects from
//! the underlying wire-protocol transport: connecting, creating channels,
//! and the per-channel operations (declare, bind, publish, get, consume,
//! ack, qos, purge, delete). The production implementation lives in
//! [`crate::lapin_transport`]; tests exercise the session layer against
//! in-memory and mock implementations of these traits.
//!
//! Framing, socket management and heartbeats belong to the transport and
//! are intentionally absent here.

use crate::{errors::BrokerError, options::ConnectionOptions};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{types::FieldTable, BasicProperties};
use std::sync::Arc;

/// Exchange routing behavior.
///
/// - Direct: routes on exact equality of routing keys
/// - Fanout: routes unconditionally to every bound queue
/// - Topic: routes on dot-separated word patterns where `*` matches exactly
///   one word and `#` matches zero or more words
/// - Headers: routes on message header values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeType {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeclareExchangeOptions {
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub nowait: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeclareQueueOptions {
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub nowait: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteExchangeOptions {
    /// Delete only when the exchange has no bindings
    pub if_unused: bool,
    pub nowait: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteQueueOptions {
    /// Delete only when the queue has no consumers
    pub if_unused: bool,
    /// Delete only when the queue holds no messages
    pub if_empty: bool,
    pub nowait: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumeOptions {
    /// When set the broker acknowledges deliveries automatically
    pub no_ack: bool,
    pub exclusive: bool,
    pub nowait: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    pub no_ack: bool,
}

/// Broker-side counters returned by queue declaration and passive checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A raw delivery as handed over by the transport, before it is wrapped
/// into a [`crate::message::Message`]. The delivery tag is the handle used
/// to acknowledge or reject this delivery on the channel it arrived on.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub consumer_tag: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

/// Stream of deliveries produced by a consumer subscription. The stream
/// ends when the subscription is cancelled or its channel dies.
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery, BrokerError>>;

/// Lifecycle notifications surfaced by transport connections and channels.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Error(String),
    Closed,
    Blocked(String),
    Unblocked,
}

/// Observer callback for [`TransportEvent`] notifications. Registered once
/// per handle; a replacement handle needs a fresh registration.
pub type EventCallback = Box<dyn Fn(TransportEvent) + Send + Sync>;

/// A logical channel on an established transport connection.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        options: DeclareExchangeOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError>;

    /// Passive existence check. Fails when the exchange does not exist and
    /// the failure invalidates this channel per protocol convention.
    async fn check_exchange(&self, name: &str) -> Result<(), BrokerError>;

    async fn delete_exchange(
        &self,
        name: &str,
        options: DeleteExchangeOptions,
    ) -> Result<(), BrokerError>;

    async fn declare_queue(
        &self,
        name: &str,
        options: DeclareQueueOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, BrokerError>;

    /// Passive existence check. Fails when the queue does not exist and the
    /// failure invalidates this channel per protocol convention.
    async fn check_queue(&self, name: &str) -> Result<QueueInfo, BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), BrokerError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError>;

    /// Publishes directly to a named queue through the default exchange.
    async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError>;

    /// Polls a single message from the queue, `None` when it is empty.
    async fn get(&self, queue: &str, options: GetOptions)
        -> Result<Option<RawDelivery>, BrokerError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Limits the number of unacknowledged deliveries the broker pushes
    /// ahead of acknowledgment, per consumer or per channel when `global`.
    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), BrokerError>;

    /// Drops all ready messages, returning how many were removed.
    async fn purge_queue(&self, queue: &str) -> Result<u32, BrokerError>;

    async fn delete_queue(
        &self,
        name: &str,
        options: DeleteQueueOptions,
    ) -> Result<u32, BrokerError>;

    fn on_event(&self, callback: EventCallback);

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// An established connection to the broker.
#[async_trait]
pub trait TransportConnection: Send + Sync + std::fmt::Debug {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, BrokerError>;

    fn on_event(&self, callback: EventCallback);

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Factory opening transport connections; the session layer owns exactly
/// when and how often this is invoked.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn TransportConnection>, BrokerError>;
}
