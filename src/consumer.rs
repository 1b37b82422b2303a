// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Dispatch Engine
//!
//! This module provides the consuming side of the session layer. A
//! `Consumer` tracks a set of queues and at most one active consumer tag
//! per queue name. Starting consumption is idempotent: a repeated
//! [`Consumer::consume`] call subscribes only queues that gained no tag
//! yet, so queues added later are picked up without disturbing running
//! subscriptions.
//!
//! Each subscription runs its own dispatch task draining the delivery
//! stream. Every delivery is wrapped into a [`Message`], stamped with the
//! consumer's channel for later acknowledgment, fanned out to all
//! registered watchers and handed to the registered handler; watchers and
//! the handler both see every delivery.

use crate::{
    channel::Channel,
    errors::BrokerError,
    message::Message,
    queue::Queue,
    transport::{ConsumeOptions, DeliveryStream, RawDelivery},
};
use async_trait::async_trait;
use futures_util::{
    future::{join_all, try_join_all},
    StreamExt,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

/// Callback invoked for every message a [`Consumer`] receives.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Arc<Message>) -> Result<(), BrokerError>;
}

/// Options for constructing a [`Consumer`].
#[derive(Default)]
pub struct ConsumerOptions {
    pub channel: Option<Channel>,
    /// Queues to consume from; more can be added later
    pub queues: Vec<Queue>,
    /// When set the broker acknowledges deliveries automatically; off by
    /// default
    pub no_ack: Option<bool>,
    /// Rebind every supplied queue to the consumer's channel at
    /// construction; on by default
    pub auto_declare: Option<bool>,
    /// Handler invoked for every received message
    pub handler: Option<Arc<dyn MessageHandler>>,
}

impl ConsumerOptions {
    pub fn channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn queue(mut self, queue: Queue) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn queues(mut self, queues: Vec<Queue>) -> Self {
        self.queues = queues;
        self
    }

    pub fn no_ack(mut self, no_ack: bool) -> Self {
        self.no_ack = Some(no_ack);
        self
    }

    pub fn auto_declare(mut self, auto_declare: bool) -> Self {
        self.auto_declare = Some(auto_declare);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }
}

/// Per-call overrides for [`Consumer::consume`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Overrides the consumer's no-ack flag
    pub no_ack: Option<bool>,
}

/// Prefetch configuration for [`Consumer::qos`].
#[derive(Debug, Clone, Copy)]
pub struct QosOptions {
    /// Number of unacknowledged deliveries the broker pushes ahead of
    /// acknowledgment
    pub prefetch_count: u16,
    /// Apply per channel instead of per consumer
    pub apply_global: bool,
}

struct ConsumerInner {
    channel: Channel,
    no_ack: bool,
    auto_declare: bool,
    handler: Option<Arc<dyn MessageHandler>>,
    queues: Mutex<Vec<Queue>>,
    active_tags: Mutex<HashMap<String, String>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<Arc<Message>>>>,
}

/// A message consumer over one channel and a tracked set of queues.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("no_ack", &self.inner.no_ack)
            .field("auto_declare", &self.inner.auto_declare)
            .finish()
    }
}

impl Consumer {
    /// Creates a consumer; the options must carry a channel.
    pub fn new(mut options: ConsumerOptions) -> Result<Consumer, BrokerError> {
        let channel = options
            .channel
            .take()
            .ok_or(BrokerError::MissingChannel("consumer"))?;
        Ok(Self::with_channel(channel, options))
    }

    pub(crate) fn with_channel(channel: Channel, options: ConsumerOptions) -> Consumer {
        let auto_declare = options.auto_declare.unwrap_or(true);
        let queues = options
            .queues
            .into_iter()
            .map(|queue| {
                if auto_declare {
                    queue.use_channel(&channel)
                } else {
                    queue
                }
            })
            .collect();
        Consumer {
            inner: Arc::new(ConsumerInner {
                channel,
                no_ack: options.no_ack.unwrap_or(false),
                auto_declare,
                handler: options.handler,
                queues: Mutex::new(queues),
                active_tags: Mutex::new(HashMap::new()),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// Snapshot of the tracked queues.
    pub fn queues(&self) -> Vec<Queue> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The active consumer tag for a queue name, if any.
    pub fn active_tag(&self, queue: impl AsRef<str>) -> Option<String> {
        self.inner
            .active_tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue.as_ref())
            .cloned()
    }

    /// True while an active consumer tag exists for the queue, given as an
    /// entity or a bare name.
    pub fn is_consuming_from(&self, queue: impl AsRef<str>) -> bool {
        self.active_tag(queue).is_some()
    }

    /// Registers a watcher notified of every received message.
    pub fn on_message(&self) -> mpsc::UnboundedReceiver<Arc<Message>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        receiver
    }

    /// Declares every tracked queue (exchange, queue and bindings). The
    /// declarations run concurrently; there is no ordering dependency
    /// between distinct queues.
    pub async fn declare(&self) -> Result<(), BrokerError> {
        debug!("declaring consumer queues");
        let queues = self.queues();
        try_join_all(queues.iter().map(|queue| queue.declare())).await?;
        Ok(())
    }

    /// Appends a queue to the tracked set and declares it. Consumption
    /// does not start until the next [`Consumer::consume`] call.
    pub async fn add_queue(&self, queue: Queue) -> Result<(), BrokerError> {
        debug!(queue = %queue.name(), "adding queue");
        let queue = if self.inner.auto_declare {
            queue.use_channel(&self.inner.channel)
        } else {
            queue
        };
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(queue.clone());
        queue.declare().await
    }

    /// Starts consuming from every tracked queue that has no active tag
    /// yet; queues already being consumed are skipped. Returns the tags of
    /// the newly started subscriptions.
    pub async fn consume(&self, options: SubscribeOptions) -> Result<Vec<String>, BrokerError> {
        let no_ack = options.no_ack.unwrap_or(self.inner.no_ack);

        let mut pending = Vec::new();
        for queue in self.queues() {
            let name = queue.name().to_owned();
            let mut tags = self
                .inner
                .active_tags
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if tags.contains_key(&name) {
                continue;
            }
            let tag = Uuid::new_v4().to_string();
            tags.insert(name.clone(), tag.clone());
            drop(tags);
            pending.push((queue, name, tag));
        }

        let subscriptions = join_all(pending.into_iter().map(|(queue, name, tag)| {
            let consumer = self.clone();
            async move {
                let options = ConsumeOptions {
                    no_ack,
                    ..ConsumeOptions::default()
                };
                match queue.consume(&tag, options).await {
                    Ok(stream) => {
                        consumer.spawn_dispatch(name, stream);
                        Ok(tag)
                    }
                    Err(err) => {
                        consumer
                            .inner
                            .active_tags
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&name);
                        Err(err)
                    }
                }
            }
        }))
        .await;

        let mut tags = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            tags.push(subscription?);
        }
        Ok(tags)
    }

    fn spawn_dispatch(&self, queue: String, mut stream: DeliveryStream) {
        let consumer = self.clone();
        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(delivery) => consumer.receive(Some(delivery)).await,
                    Err(err) => {
                        error!(error = err.to_string(), queue = %queue, "error receiving delivery")
                    }
                }
            }
            // end of stream is the protocol-level "no more messages"
            // signal and is not forwarded to handlers
            consumer.receive(None).await;
        });
    }

    async fn receive(&self, delivery: Option<RawDelivery>) {
        let Some(delivery) = delivery else {
            debug!("null delivery ignored");
            return;
        };
        let mut message = Message::from_delivery(delivery);
        message.set_channel(self.inner.channel.clone());
        let message = Arc::new(message);

        self.inner
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|watcher| watcher.send(message.clone()).is_ok());

        if let Some(handler) = &self.inner.handler {
            if let Err(err) = handler.handle(message.clone()).await {
                error!(error = err.to_string(), "message handler failed");
            }
        }
    }

    /// Cancels every active subscription concurrently and forgets the
    /// tags, so a later [`Consumer::consume`] can re-subscribe. Already
    /// delivered messages are unaffected.
    pub async fn cancel(&self) -> Result<(), BrokerError> {
        let tags: Vec<String> = {
            let mut active = self
                .inner
                .active_tags
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            active.drain().map(|(_, tag)| tag).collect()
        };
        if tags.is_empty() {
            return Ok(());
        }
        let handle = self.inner.channel.get_channel().await?;
        try_join_all(tags.iter().map(|tag| handle.cancel(tag))).await?;
        Ok(())
    }

    /// Cancels and forgets the subscription for one queue, given as an
    /// entity or a bare name. A no-op when no tag is active for it.
    pub async fn cancel_by_queue(&self, queue: impl AsRef<str>) -> Result<(), BrokerError> {
        let tag = self
            .inner
            .active_tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(queue.as_ref());
        match tag {
            Some(tag) => {
                let handle = self.inner.channel.get_channel().await?;
                handle.cancel(&tag).await
            }
            None => Ok(()),
        }
    }

    /// Purges all ready messages from every tracked queue.
    pub async fn purge(&self) -> Result<(), BrokerError> {
        let queues = self.queues();
        try_join_all(queues.iter().map(|queue| queue.purge())).await?;
        Ok(())
    }

    /// Sets the prefetch window: how many unacknowledged deliveries the
    /// broker pushes before withholding further messages, per consumer or
    /// per channel when `apply_global` is set.
    pub async fn qos(&self, options: QosOptions) -> Result<(), BrokerError> {
        debug!(
            prefetch_count = options.prefetch_count,
            apply_global = options.apply_global,
            "configuring qos"
        );
        let handle = self.inner.channel.get_channel().await?;
        handle
            .qos(options.prefetch_count, options.apply_global)
            .await
    }
}
