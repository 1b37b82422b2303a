// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error type used across the session layer.
//! `BrokerError` covers connection establishment and retry exhaustion,
//! channel creation, entity declaration and binding, publishing, consuming,
//! and message acknowledgment. Local precondition violations (a missing
//! channel, an illegal message-state transition) are reported before any
//! network call is attempted; remote failures carry the entity name and the
//! transport detail verbatim.

use crate::message::AckState;
use thiserror::Error;

/// Represents errors that can occur during broker session operations.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    Connect(String),

    /// The bounded connection retry loop exhausted its budget
    #[error("max retries {max_retries} reached")]
    MaxRetriesReached { max_retries: u32 },

    /// The connection was explicitly closed and yields no handle
    #[error("connection is closed")]
    ConnectionClosed,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    CreateChannel(String),

    /// An operation required a bound channel and none was supplied
    #[error("no channel to use for {0}")]
    MissingChannel(&'static str),

    /// Illegal acknowledgment-state transition on a message
    #[error("message already acknowledged with state `{from}`, cannot transition to `{to}`")]
    MessageState { from: AckState, to: AckState },

    /// Error declaring an exchange with the given name
    #[error("failure to declare exchange `{0}`: {1}")]
    DeclareExchange(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare queue `{0}`: {1}")]
    DeclareQueue(String, String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`: {2}")]
    Bind(String, String, String),

    /// Error removing a queue binding
    #[error("failure to unbind queue `{0}` from exchange `{1}`: {2}")]
    Unbind(String, String, String),

    /// Passive exchange check failed; the channel used for the check is
    /// invalidated by the broker and must be re-acquired
    #[error("exchange `{0}` does not exist: {1}")]
    CheckExchange(String, String),

    /// Passive queue check failed; the channel used for the check is
    /// invalidated by the broker and must be re-acquired
    #[error("queue `{0}` does not exist: {1}")]
    CheckQueue(String, String),

    /// Error publishing a message to an exchange or queue
    #[error("failure to publish to `{0}`: {1}")]
    Publish(String, String),

    /// Error starting a consumer on a queue
    #[error("failure to start consumer on queue `{0}`: {1}")]
    Consume(String, String),

    /// Error cancelling a consumer by tag
    #[error("failure to cancel consumer `{0}`: {1}")]
    Cancel(String, String),

    /// Error acknowledging or rejecting a delivery
    #[error("failure to acknowledge message: {0}")]
    Ack(String),

    /// Error configuring quality of service
    #[error("failure to configure qos: {0}")]
    Qos(String),

    /// Error purging a queue
    #[error("failure to purge queue `{0}`: {1}")]
    Purge(String, String),

    /// Error deleting an exchange or queue
    #[error("failure to delete `{0}`: {1}")]
    Delete(String, String),

    /// Error encoding or decoding a message payload
    #[error("failure to parse payload: {0}")]
    Payload(#[from] serde_json::Error),
}
