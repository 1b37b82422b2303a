// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # amqp-session
//!
//! A resilient client-side session layer for AMQP brokers, built on top of
//! the `lapin` transport. The crate provides lazily established
//! connections with bounded automatic retry, self-healing channels,
//! reusable declarative exchange and queue entities, a producer with
//! immutable routing composition, and a consumer dispatch engine with
//! tag-tracked subscriptions and prefetch control.
//!
//! Wire-level framing, socket management and heartbeats are the
//! transport's business and stay behind the seam in [`transport`].

pub mod channel;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod lapin_transport;
pub mod message;
pub mod options;
pub mod producer;
pub mod queue;
pub mod router;
pub mod transport;

pub use channel::Channel;
pub use connection::Connection;
pub use consumer::{Consumer, ConsumerOptions, MessageHandler, QosOptions, SubscribeOptions};
pub use errors::BrokerError;
pub use exchange::Exchange;
pub use lapin_transport::LapinTransport;
pub use message::{AckState, DeliveryMode, Message};
pub use options::{ConnectionOptions, RetryPolicy};
pub use producer::{Producer, ProducerOptions, PublishOptions};
pub use queue::{Queue, QueueBinding};
pub use router::{RouteOptions, Router};
pub use transport::ExchangeType;
