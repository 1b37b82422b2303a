// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Producer
//!
//! This module provides the publishing side of the session layer. A
//! `Producer` publishes messages through a default exchange (falling back
//! to the broker's unnamed default exchange) with an optional default
//! routing key, both overridable per publish. Plain payloads are wrapped
//! into messages on the fly.

use crate::{
    channel::Channel,
    errors::BrokerError,
    exchange::Exchange,
    message::Message,
    router::{RouteOptions, Router},
};
use lapin::types::FieldTable;
use tracing::debug;
use uuid::Uuid;

/// Options for constructing a [`Producer`].
#[derive(Debug, Clone, Default)]
pub struct ProducerOptions {
    pub channel: Option<Channel>,
    /// Default exchange; the unnamed default exchange when absent
    pub exchange: Option<Exchange>,
    /// Default routing key applied when a publish carries none
    pub routing_key: Option<String>,
    /// Rebind the default exchange to the producer's channel at
    /// construction; on by default
    pub auto_declare: Option<bool>,
}

impl ProducerOptions {
    pub fn channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn exchange(mut self, exchange: Exchange) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn auto_declare(mut self, auto_declare: bool) -> Self {
        self.auto_declare = Some(auto_declare);
        self
    }
}

/// Per-publish overrides.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Overrides the producer's exchange; the exchange must have been
    /// declared
    pub exchange: Option<String>,
    /// Overrides the producer's routing key
    pub routing_key: Option<String>,
    /// Headers merged over the message's own headers
    pub headers: Option<FieldTable>,
}

impl PublishOptions {
    pub fn exchange(mut self, exchange: impl AsRef<str>) -> Self {
        self.exchange = Some(exchange.as_ref().to_owned());
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn headers(mut self, headers: FieldTable) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// A message producer bound to a channel.
#[derive(Clone, Debug)]
pub struct Producer {
    channel: Channel,
    exchange: Exchange,
    routing_key: Option<String>,
    #[allow(dead_code)]
    auto_declare: bool,
}

impl Producer {
    /// Creates a producer; the options must carry a channel.
    pub fn new(mut options: ProducerOptions) -> Result<Producer, BrokerError> {
        let channel = options
            .channel
            .take()
            .ok_or(BrokerError::MissingChannel("producer"))?;
        Ok(Self::with_channel(channel, options))
    }

    pub(crate) fn with_channel(channel: Channel, options: ProducerOptions) -> Producer {
        let auto_declare = options.auto_declare.unwrap_or(true);
        let mut exchange = options.exchange.unwrap_or_default();
        if auto_declare {
            exchange = exchange.use_channel(&channel);
        }
        Producer {
            channel,
            exchange,
            routing_key: options.routing_key,
            auto_declare,
        }
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    /// Declares the default exchange. The unnamed default exchange needs
    /// no declaration and is skipped.
    pub async fn declare(&self) -> Result<(), BrokerError> {
        if self.exchange.name().is_empty() {
            return Ok(());
        }
        self.exchange.declare().await
    }

    /// Publishes a message, resolving the exchange and routing key from
    /// the overrides or the producer defaults.
    ///
    /// # Parameters
    /// * `message` - a prepared [`Message`] or any plain payload, wrapped
    ///   on the fly; an unset delivery mode is filled from the default
    ///   exchange
    /// * `options` - per-publish exchange/routing-key overrides and extra
    ///   headers merged over the message's own
    pub async fn publish(
        &self,
        message: impl Into<Message>,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        let mut message = message.into();
        let exchange = options
            .exchange
            .unwrap_or_else(|| self.exchange.name().to_owned());
        let routing_key = options
            .routing_key
            .or_else(|| self.routing_key.clone())
            .unwrap_or_default();

        if message.delivery_mode.is_none() {
            message.delivery_mode = Some(self.exchange.delivery_mode);
        }
        if message.message_id.is_none() {
            message.message_id = Some(Uuid::new_v4().to_string());
        }
        if let Some(headers) = options.headers {
            for (key, value) in headers.inner() {
                message.headers.insert(key.clone(), value.clone());
            }
        }

        let handle = self.channel.get_channel().await?;
        debug!(exchange = %exchange, routing_key = %routing_key, "publishing message");
        handle
            .publish(
                &exchange,
                &routing_key,
                &message.encode(),
                message.publish_properties(),
            )
            .await
    }

    /// Returns a [`Router`] anchored to this producer.
    pub fn route(&self, options: RouteOptions) -> Router {
        Router::new(self.clone(), options)
    }
}
