// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! This module provides the message type carried through the session layer:
//! a JSON body plus the headers and properties needed for publishing, and,
//! on the receiving side, the raw transport envelope required to
//! acknowledge the delivery later.
//!
//! Acknowledgment is a small state machine. A received message starts in
//! `Received` and moves exactly once into one of the terminal states
//! `Acked`, `Rejected` or `Requeued`; any further transition fails with a
//! state error before a network call is attempted. The same central check
//! guards `ack`, `reject` and `requeue` alike, so double acknowledgment is
//! rejected symmetrically.

use crate::{channel::Channel, errors::BrokerError, transport::RawDelivery};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fmt,
    sync::{Mutex, PoisonError},
};

/// Default content type for message bodies.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Acknowledgment state of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Received,
    Acked,
    Rejected,
    Requeued,
}

impl AckState {
    /// Terminal states cannot be left again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AckState::Received)
    }
}

impl fmt::Display for AckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AckState::Received => "RECEIVED",
            AckState::Acked => "ACK",
            AckState::Rejected => "REJECTED",
            AckState::Requeued => "REQUEUED",
        };
        f.write_str(name)
    }
}

/// Persistence of a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Stored in memory only, lost on broker restart
    Transient,
    /// Stored both in memory and on disk
    Persistent,
}

impl DeliveryMode {
    pub fn as_amqp(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    pub fn from_amqp(value: u8) -> Option<DeliveryMode> {
        match value {
            1 => Some(DeliveryMode::Transient),
            2 => Some(DeliveryMode::Persistent),
            _ => None,
        }
    }
}

/// A message flowing through the session layer.
///
/// Outbound messages are built from any serializable payload; inbound
/// messages are reconstructed from the raw transport envelope and keep it
/// around so the delivery can be acknowledged through the channel the
/// consumer stamped onto it.
pub struct Message {
    body: String,
    pub headers: FieldTable,
    pub delivery_tag: Option<u64>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub expiration: Option<String>,
    pub delivery_mode: Option<DeliveryMode>,
    pub message_id: Option<String>,
    channel: Option<Channel>,
    raw: Option<RawDelivery>,
    state: Mutex<AckState>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("body", &self.body)
            .field("delivery_tag", &self.delivery_tag)
            .field("correlation_id", &self.correlation_id)
            .field("content_type", &self.content_type)
            .field("state", &self.state())
            .finish()
    }
}

impl Message {
    /// Creates an outbound message from a serializable payload.
    pub fn new<T: Serialize + ?Sized>(body: &T) -> Result<Message, BrokerError> {
        Ok(Self::from_body(serde_json::to_string(body)?))
    }

    fn from_body(body: String) -> Message {
        Message {
            body,
            headers: FieldTable::default(),
            delivery_tag: None,
            correlation_id: None,
            reply_to: None,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            content_encoding: None,
            expiration: None,
            delivery_mode: None,
            message_id: None,
            channel: None,
            raw: None,
            state: Mutex::new(AckState::Received),
        }
    }

    /// Reconstructs a message from a raw transport delivery, retaining the
    /// envelope for later acknowledgment.
    pub fn from_delivery(raw: RawDelivery) -> Message {
        let properties = &raw.properties;
        let mut message = Self::from_body(String::from_utf8_lossy(&raw.data).into_owned());
        message.headers = properties.headers().clone().unwrap_or_default();
        message.correlation_id = properties
            .correlation_id()
            .as_ref()
            .map(ToString::to_string);
        message.reply_to = properties.reply_to().as_ref().map(ToString::to_string);
        message.content_type = properties
            .content_type()
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned());
        message.content_encoding = properties
            .content_encoding()
            .as_ref()
            .map(ToString::to_string);
        message.expiration = properties.expiration().as_ref().map(ToString::to_string);
        message.delivery_mode = properties
            .delivery_mode()
            .as_ref()
            .copied()
            .and_then(DeliveryMode::from_amqp);
        message.message_id = properties.message_id().as_ref().map(ToString::to_string);
        message.delivery_tag = Some(raw.delivery_tag);
        message.raw = Some(raw);
        message
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, key: &str, value: AMQPValue) -> Self {
        self.headers.insert(ShortString::from(key), value);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_content_encoding(mut self, content_encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(content_encoding.into());
        self
    }

    pub fn with_expiration(mut self, expiration: impl Into<String>) -> Self {
        self.expiration = Some(expiration.into());
        self
    }

    pub fn with_delivery_mode(mut self, delivery_mode: DeliveryMode) -> Self {
        self.delivery_mode = Some(delivery_mode);
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Binds the channel used for later acknowledgment of this message.
    pub fn set_channel(&mut self, channel: Channel) {
        self.channel = Some(channel);
    }

    /// The message body as JSON text.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Serializes the body to a transport-ready byte buffer.
    pub fn encode(&self) -> Vec<u8> {
        self.body.clone().into_bytes()
    }

    /// Parses the body back into a structured value.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, BrokerError> {
        serde_json::from_str(&self.body).map_err(BrokerError::from)
    }

    /// Projects headers and properties into the shape required by a
    /// publish call.
    pub fn publish_properties(&self) -> BasicProperties {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(self.content_type.as_str()))
            .with_headers(self.headers.clone());
        if let Some(correlation_id) = &self.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id.as_str()));
        }
        if let Some(reply_to) = &self.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to.as_str()));
        }
        if let Some(content_encoding) = &self.content_encoding {
            properties =
                properties.with_content_encoding(ShortString::from(content_encoding.as_str()));
        }
        if let Some(expiration) = &self.expiration {
            properties = properties.with_expiration(ShortString::from(expiration.as_str()));
        }
        if let Some(delivery_mode) = self.delivery_mode {
            properties = properties.with_delivery_mode(delivery_mode.as_amqp());
        }
        if let Some(message_id) = &self.message_id {
            properties = properties.with_message_id(ShortString::from(message_id.as_str()));
        }
        properties
    }

    /// Current acknowledgment state.
    pub fn state(&self) -> AckState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True once the message reached a terminal acknowledgment state.
    pub fn is_acknowledged(&self) -> bool {
        self.state().is_terminal()
    }

    fn transition(&self, to: AckState) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_terminal() {
            return Err(BrokerError::MessageState { from: *state, to });
        }
        *state = to;
        Ok(())
    }

    fn ack_channel(&self) -> Result<(&Channel, u64), BrokerError> {
        let channel = self
            .channel
            .as_ref()
            .ok_or(BrokerError::MissingChannel("message acknowledgment"))?;
        let delivery_tag = self
            .delivery_tag
            .ok_or_else(|| BrokerError::Ack("message has no delivery tag".to_owned()))?;
        Ok((channel, delivery_tag))
    }

    /// Acknowledges this message as processed; the broker removes it from
    /// the queue.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.transition(AckState::Acked)?;
        let (channel, delivery_tag) = self.ack_channel()?;
        let handle = channel.get_channel().await?;
        handle.ack(delivery_tag).await
    }

    /// Rejects this message; the broker discards it, or requeues it when
    /// `requeue` is set.
    pub async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.transition(AckState::Rejected)?;
        let (channel, delivery_tag) = self.ack_channel()?;
        let handle = channel.get_channel().await?;
        handle.reject(delivery_tag, requeue).await
    }

    /// Rejects this message and puts it back on the queue.
    pub async fn requeue(&self) -> Result<(), BrokerError> {
        self.transition(AckState::Requeued)?;
        let (channel, delivery_tag) = self.ack_channel()?;
        let handle = channel.get_channel().await?;
        handle.reject(delivery_tag, true).await
    }
}

impl From<serde_json::Value> for Message {
    fn from(value: serde_json::Value) -> Self {
        Message::from_body(value.to_string())
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        serde_json::Value::String(value.to_owned()).into()
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        serde_json::Value::String(value).into()
    }
}
