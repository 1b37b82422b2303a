// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Router
//!
//! A `Router` composes routing-key fragments and publish options on top of
//! a [`Producer`]. Routers are immutable: `route` and `append` return new
//! instances sharing the same producer, so a base route can be fanned out
//! into sub-routes safely.

use crate::{
    errors::BrokerError,
    message::Message,
    producer::{Producer, PublishOptions},
};
use lapin::types::FieldTable;

/// Options carried by a [`Router`], merged on every derivation.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    pub routing_key: Option<String>,
    /// Overrides the producer's exchange; the exchange must have been
    /// declared
    pub exchange: Option<String>,
    pub headers: Option<FieldTable>,
}

impl RouteOptions {
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn exchange(mut self, exchange: impl AsRef<str>) -> Self {
        self.exchange = Some(exchange.as_ref().to_owned());
        self
    }

    pub fn headers(mut self, headers: FieldTable) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// An immutable routing handle delegating publishes to a [`Producer`].
#[derive(Clone)]
pub struct Router {
    producer: Producer,
    options: RouteOptions,
}

impl Router {
    pub fn new(producer: Producer, options: RouteOptions) -> Router {
        Router { producer, options }
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.options.routing_key.as_deref()
    }

    /// Returns a new router with the given options merged over this one;
    /// the given options take precedence.
    pub fn route(&self, options: RouteOptions) -> Router {
        Router {
            producer: self.producer.clone(),
            options: RouteOptions {
                routing_key: options
                    .routing_key
                    .or_else(|| self.options.routing_key.clone()),
                exchange: options.exchange.or_else(|| self.options.exchange.clone()),
                headers: options.headers.or_else(|| self.options.headers.clone()),
            },
        }
    }

    /// Returns a new router whose routing key is this router's key with
    /// `sub_route` appended after a `.` separator; the sub-route alone
    /// when no key is set yet.
    pub fn append(&self, sub_route: &str) -> Router {
        let routing_key = match self.options.routing_key.as_deref() {
            Some(key) if !key.is_empty() => format!("{key}.{sub_route}"),
            _ => sub_route.to_owned(),
        };
        self.route(RouteOptions::default().routing_key(routing_key))
    }

    /// Publishes the message through the producer with this router's
    /// routing key, exchange override and headers.
    pub async fn publish(&self, message: impl Into<Message>) -> Result<(), BrokerError> {
        let options = PublishOptions {
            exchange: self.options.exchange.clone(),
            routing_key: self.options.routing_key.clone(),
            headers: self.options.headers.clone(),
        };
        self.producer.publish(message, options).await
    }
}
