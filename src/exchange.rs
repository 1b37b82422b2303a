// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Entity
//!
//! This module provides the declarative exchange descriptor. An `Exchange`
//! describes broker-side routing configuration and can declare itself
//! against a channel; declaration is an idempotent upsert and safe to
//! repeat.
//!
//! One canonical exchange definition is meant to be reused: binding it to a
//! channel goes through [`Exchange::use_channel`], which returns an
//! independent copy and never mutates the source.

use crate::{
    channel::Channel,
    errors::BrokerError,
    message::{DeliveryMode, Message},
    transport::{DeclareExchangeOptions, DeleteExchangeOptions, ExchangeType},
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use serde::Serialize;
use tracing::{debug, error};

/// An exchange declaration.
///
/// The empty name denotes the broker's default exchange, which requires no
/// declaration. Messages created through [`Exchange::message`] inherit the
/// exchange's default delivery mode.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub(crate) name: String,
    pub(crate) kind: ExchangeType,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) delivery_mode: DeliveryMode,
    pub(crate) arguments: FieldTable,
    pub(crate) channel: Option<Channel>,
}

impl Default for Exchange {
    fn default() -> Self {
        Exchange {
            name: String::new(),
            kind: ExchangeType::Direct,
            durable: true,
            auto_delete: false,
            delivery_mode: DeliveryMode::Persistent,
            arguments: FieldTable::default(),
            channel: None,
        }
    }
}

impl AsRef<str> for Exchange {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl Exchange {
    /// Creates a direct, durable exchange definition with the given name.
    pub fn new(name: impl Into<String>) -> Exchange {
        Exchange {
            name: name.into(),
            ..Exchange::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_type(&self) -> ExchangeType {
        self.kind
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeType) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Direct.
    pub fn direct(self) -> Self {
        self.kind(ExchangeType::Direct)
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(self) -> Self {
        self.kind(ExchangeType::Fanout)
    }

    /// Sets the exchange type to Topic.
    pub fn topic(self) -> Self {
        self.kind(ExchangeType::Topic)
    }

    /// Sets the exchange type to Headers.
    pub fn headers(self) -> Self {
        self.kind(ExchangeType::Headers)
    }

    /// Sets whether the exchange survives a broker restart.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets whether the exchange is deleted once all queues finished using
    /// it.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Sets the default delivery mode for messages created through this
    /// exchange.
    pub fn delivery_mode(mut self, delivery_mode: DeliveryMode) -> Self {
        self.delivery_mode = delivery_mode;
        self
    }

    /// Adds a single declaration argument.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    /// Sets the declaration arguments.
    pub fn arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }

    /// Returns a copy of this exchange bound to the given channel. The
    /// source is left untouched so the definition can be reused across
    /// channels.
    pub fn use_channel(&self, channel: &Channel) -> Exchange {
        let mut exchange = self.clone();
        exchange.channel = Some(channel.clone());
        exchange
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

    /// Declares the exchange on the broker. Idempotent and safe to call
    /// repeatedly.
    pub async fn declare(&self) -> Result<(), BrokerError> {
        let handle = self.bound_channel("exchange declare")?.get_channel().await?;
        debug!(exchange = %self.name, "declaring exchange");
        match handle
            .declare_exchange(
                &self.name,
                self.kind,
                DeclareExchangeOptions {
                    passive: false,
                    durable: self.durable,
                    auto_delete: self.auto_delete,
                    internal: false,
                    nowait: false,
                },
                self.arguments.clone(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = %self.name,
                    "error to declare the exchange"
                );
                Err(err)
            }
            Ok(()) => {
                debug!(exchange = %self.name, "exchange declared");
                Ok(())
            }
        }
    }

    /// Checks whether the exchange exists on the broker without creating
    /// it. A failed check invalidates the channel it ran on; a new channel
    /// handle is acquired transparently on the next operation.
    pub async fn check(&self) -> Result<(), BrokerError> {
        let handle = self.bound_channel("exchange check")?.get_channel().await?;
        handle.check_exchange(&self.name).await
    }

    /// Creates a message carrying this exchange's default delivery mode.
    pub fn message<T: Serialize + ?Sized>(&self, body: &T) -> Result<Message, BrokerError> {
        Ok(Message::new(body)?.with_delivery_mode(self.delivery_mode))
    }

    /// Publishes a message through this exchange.
    pub async fn publish(&self, message: &Message, routing_key: &str) -> Result<(), BrokerError> {
        let handle = self.bound_channel("exchange publish")?.get_channel().await?;
        debug!(exchange = %self.name, routing_key, "publishing message");
        handle
            .publish(
                &self.name,
                routing_key,
                &message.encode(),
                message.publish_properties(),
            )
            .await
    }

    /// Deletes the exchange declaration on the broker. Fails immediately
    /// when no channel is bound; no network call is attempted.
    pub async fn delete(&self, options: DeleteExchangeOptions) -> Result<(), BrokerError> {
        let handle = self.bound_channel("exchange delete")?.get_channel().await?;
        debug!(exchange = %self.name, "deleting exchange");
        handle.delete_exchange(&self.name, options).await
    }
}
