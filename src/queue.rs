// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Entity
//!
//! This module provides the declarative queue descriptor: name, an optional
//! primary exchange with its binding key, durability flags, extra
//! declaration and binding arguments, and any number of additional
//! bindings.
//!
//! [`Queue::declare`] performs the full chain against the broker, strictly
//! in order: the primary exchange (rebound to the queue's channel when
//! unbound), the queue itself, the primary binding, then every additional
//! binding. A failure at any step prevents later steps from starting.
//!
//! Exclusive queues may only be consumed from by the declaring connection;
//! the exclusive flag always implies auto-delete.

use crate::{
    channel::Channel,
    errors::BrokerError,
    exchange::Exchange,
    message::Message,
    transport::{
        ConsumeOptions, DeclareQueueOptions, DeleteQueueOptions, DeliveryStream, GetOptions,
        QueueInfo,
    },
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use serde::Serialize;
use tracing::debug;

/// One additional exchange binding of a queue.
#[derive(Debug, Clone)]
pub struct QueueBinding {
    pub(crate) exchange: Exchange,
    pub(crate) routing_key: String,
    pub(crate) arguments: FieldTable,
}

impl QueueBinding {
    pub fn new(exchange: Exchange, routing_key: impl Into<String>) -> QueueBinding {
        QueueBinding {
            exchange,
            routing_key: routing_key.into(),
            arguments: FieldTable::default(),
        }
    }

    pub fn arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }
}

/// A queue declaration.
#[derive(Debug, Clone)]
pub struct Queue {
    pub(crate) name: String,
    pub(crate) exchange: Option<Exchange>,
    pub(crate) routing_key: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) queue_arguments: FieldTable,
    pub(crate) binding_arguments: FieldTable,
    pub(crate) bindings: Vec<QueueBinding>,
    pub(crate) channel: Option<Channel>,
}

impl AsRef<str> for Queue {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl Queue {
    /// Creates a durable queue definition with the given name.
    pub fn new(name: impl Into<String>) -> Queue {
        Queue {
            name: name.into(),
            exchange: None,
            routing_key: String::new(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            queue_arguments: FieldTable::default(),
            binding_arguments: FieldTable::default(),
            bindings: Vec::new(),
            channel: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the primary exchange this queue binds to.
    pub fn exchange(mut self, exchange: Exchange) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Sets the binding key used for the primary exchange binding.
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Sets whether the queue survives a broker restart.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets whether the queue is exclusive to the declaring connection.
    /// Exclusive always implies auto-delete.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        if exclusive {
            self.auto_delete = true;
        }
        self
    }

    /// Sets whether the queue is deleted once its last consumer cancels.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Adds a single declaration argument.
    pub fn queue_argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.queue_arguments.insert(ShortString::from(key), value);
        self
    }

    /// Sets the arguments used for the primary binding.
    pub fn binding_arguments(mut self, arguments: FieldTable) -> Self {
        self.binding_arguments = arguments;
        self
    }

    /// Adds an additional exchange binding applied after the primary one.
    pub fn binding(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Exclusive queues are auto-deleted regardless of the configured flag.
    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete || self.exclusive
    }

    /// Returns a copy of this queue bound to the given channel. The source
    /// is left untouched so the definition can be reused across channels.
    pub fn use_channel(&self, channel: &Channel) -> Queue {
        let mut queue = self.clone();
        queue.channel = Some(channel.clone());
        queue
    }

    pub fn set_channel(&mut self, channel: &Channel) {
        self.channel = Some(channel.clone());
    }

    pub fn is_bound(&self) -> bool {
        self.channel.is_some()
    }

    fn bound_channel(&self, context: &'static str) -> Result<&Channel, BrokerError> {
        self.channel
            .as_ref()
            .ok_or(BrokerError::MissingChannel(context))
    }

    /// Declares the queue, its exchange, and the bindings between them.
    ///
    /// The steps run strictly in sequence and a failure aborts the chain:
    /// exchange, queue, primary binding, then each additional binding. The
    /// primary binding is skipped for the unnamed default exchange, whose
    /// bindings are implicit.
    ///
    /// # Returns
    /// Ok(()) once every step completed, or the error of the first step
    /// that failed; later steps are then never started.
    pub async fn declare(&self) -> Result<(), BrokerError> {
        if let Some(exchange) = &self.exchange {
            let rebound;
            let exchange = if exchange.is_bound() {
                exchange
            } else {
                rebound = exchange.use_channel(self.bound_channel("queue declare")?);
                &rebound
            };
            exchange.declare().await?;
        }

        self.queue_declare().await?;

        if let Some(exchange) = &self.exchange {
            if !exchange.name().is_empty() {
                self.bind(
                    exchange.name(),
                    &self.routing_key,
                    self.binding_arguments.clone(),
                )
                .await?;
            }
        }

        for binding in &self.bindings {
            self.bind(
                binding.exchange.name(),
                &binding.routing_key,
                binding.arguments.clone(),
            )
            .await?;
        }

        Ok(())
    }

    /// Declares only the queue itself on the broker.
    pub async fn queue_declare(&self) -> Result<QueueInfo, BrokerError> {
        let handle = self.bound_channel("queue declare")?.get_channel().await?;
        debug!(queue = %self.name, "declaring queue");
        handle
            .declare_queue(
                &self.name,
                DeclareQueueOptions {
                    passive: false,
                    durable: self.durable,
                    exclusive: self.exclusive,
                    auto_delete: self.is_auto_delete(),
                    nowait: false,
                },
                self.queue_arguments.clone(),
            )
            .await
    }

    /// Checks whether the queue exists on the broker without creating it.
    /// A failed check invalidates the channel it ran on; a new channel
    /// handle is acquired transparently on the next operation.
    pub async fn check(&self) -> Result<QueueInfo, BrokerError> {
        let handle = self.bound_channel("queue check")?.get_channel().await?;
        handle.check_queue(&self.name).await
    }

    /// Creates the binding to the primary exchange on the broker.
    pub async fn queue_bind(&self) -> Result<(), BrokerError> {
        let exchange = match &self.exchange {
            Some(exchange) => exchange.name().to_owned(),
            None => String::new(),
        };
        self.bind(&exchange, &self.routing_key, self.binding_arguments.clone())
            .await
    }

    /// Binds the queue to an exchange, given as an entity or a bare name.
    pub async fn bind_to<E: AsRef<str>>(
        &self,
        exchange: E,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.bind(exchange.as_ref(), routing_key, FieldTable::default())
            .await
    }

    async fn bind(
        &self,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        let handle = self.bound_channel("queue bind")?.get_channel().await?;
        debug!(
            queue = %self.name,
            exchange,
            routing_key,
            "binding queue to exchange"
        );
        handle
            .bind_queue(&self.name, exchange, routing_key, arguments)
            .await
    }

    /// Removes the binding to the primary exchange from the broker.
    pub async fn queue_unbind(&self) -> Result<(), BrokerError> {
        let exchange = match &self.exchange {
            Some(exchange) => exchange.name().to_owned(),
            None => String::new(),
        };
        self.unbind_from(&exchange, &self.routing_key).await
    }

    /// Removes a binding, given an exchange entity or a bare name.
    pub async fn unbind_from<E: AsRef<str>>(
        &self,
        exchange: E,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let handle = self.bound_channel("queue unbind")?.get_channel().await?;
        handle
            .unbind_queue(
                &self.name,
                exchange.as_ref(),
                routing_key,
                FieldTable::default(),
            )
            .await
    }

    /// Creates a message instance to be sent with [`Queue::publish`].
    pub fn message<T: Serialize + ?Sized>(&self, body: &T) -> Result<Message, BrokerError> {
        Message::new(body)
    }

    /// Publishes a message directly to this queue through the default
    /// exchange.
    pub async fn publish(&self, message: &Message) -> Result<(), BrokerError> {
        let handle = self.bound_channel("queue publish")?.get_channel().await?;
        debug!(queue = %self.name, "sending message to queue");
        handle
            .send_to_queue(&self.name, &message.encode(), message.publish_properties())
            .await
    }

    /// Polls the broker for a single message. Returns `None` when the
    /// queue is empty; a returned message is already stamped with this
    /// queue's channel for later acknowledgment.
    pub async fn get(&self, options: GetOptions) -> Result<Option<Message>, BrokerError> {
        let channel = self.bound_channel("queue get")?;
        let handle = channel.get_channel().await?;
        let raw = handle.get(&self.name, options).await?;
        Ok(raw.map(|raw| {
            let mut message = Message::from_delivery(raw);
            message.set_channel(channel.clone());
            message
        }))
    }

    /// Starts a consumer subscription on this queue, returning the stream
    /// of raw deliveries for the given consumer tag.
    pub async fn consume(
        &self,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let handle = self.bound_channel("queue consume")?.get_channel().await?;
        debug!(queue = %self.name, consumer_tag, "starting consumer");
        handle.consume(&self.name, consumer_tag, options).await
    }

    /// Cancels a consumer subscription by tag.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let handle = self.bound_channel("queue cancel")?.get_channel().await?;
        handle.cancel(consumer_tag).await
    }

    /// Removes all ready messages from the queue, returning how many were
    /// dropped. There is no undo.
    pub async fn purge(&self) -> Result<u32, BrokerError> {
        let handle = self.bound_channel("queue purge")?.get_channel().await?;
        handle.purge_queue(&self.name).await
    }

    /// Deletes the queue. Fails immediately when no channel is bound; no
    /// network call is attempted.
    pub async fn delete(&self, options: DeleteQueueOptions) -> Result<u32, BrokerError> {
        let handle = self.bound_channel("queue delete")?.get_channel().await?;
        debug!(queue = %self.name, "deleting queue");
        handle.delete_queue(&self.name, options).await
    }
}
