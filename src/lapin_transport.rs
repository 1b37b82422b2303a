// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! Production implementation of the transport seam over `lapin`. This is a
//! thin mapping layer: option structs are translated one-to-one, errors are
//! converted into the session-layer taxonomy with the entity name attached,
//! and consumer subscriptions are adapted into plain delivery streams.

use crate::{
    errors::BrokerError,
    options::ConnectionOptions,
    transport::{
        ConsumeOptions, DeclareExchangeOptions, DeclareQueueOptions, DeleteExchangeOptions,
        DeleteQueueOptions, DeliveryStream, EventCallback, ExchangeType, GetOptions, QueueInfo,
        RawDelivery, Transport, TransportChannel, TransportConnection, TransportEvent,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
        QueuePurgeOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, ConnectionProperties,
};
use std::sync::Arc;
use tracing::debug;

impl From<ExchangeType> for lapin::ExchangeKind {
    fn from(kind: ExchangeType) -> Self {
        match kind {
            ExchangeType::Direct => lapin::ExchangeKind::Direct,
            ExchangeType::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeType::Topic => lapin::ExchangeKind::Topic,
            ExchangeType::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

fn raw_from_delivery(delivery: Delivery, consumer_tag: Option<String>) -> RawDelivery {
    RawDelivery {
        delivery_tag: delivery.delivery_tag,
        consumer_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        data: delivery.data,
        properties: delivery.properties,
    }
}

/// Transport implementation backed by `lapin`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinTransport;

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn TransportConnection>, BrokerError> {
        debug!("creating amqp connection...");
        let mut properties = ConnectionProperties::default();
        properties.client_properties = options.client_properties();
        if let Some(name) = &options.connection_name {
            properties = properties.with_connection_name(LongString::from(name.as_str()));
        }

        let connection = lapin::Connection::connect(&options.amqp_uri(), properties)
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { inner: connection }))
    }
}

#[derive(Debug)]
struct LapinConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl TransportConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, BrokerError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|err| BrokerError::CreateChannel(err.to_string()))?;
        debug!("channel created");
        Ok(Arc::new(LapinChannel { inner: channel }))
    }

    fn on_event(&self, callback: EventCallback) {
        self.inner.on_error(move |err| match err {
            lapin::Error::InvalidConnectionState(_) => callback(TransportEvent::Closed),
            other => callback(TransportEvent::Error(other.to_string())),
        });
    }

    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .close(200, "closing connection")
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))
    }
}

struct LapinChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl TransportChannel for LapinChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        options: DeclareExchangeOptions,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        self.inner
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: options.nowait,
                },
                arguments,
            )
            .await
            .map_err(|err| BrokerError::DeclareExchange(name.to_owned(), err.to_string()))
    }

    async fn check_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.inner
            .exchange_declare(
                name,
                lapin::ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| BrokerError::CheckExchange(name.to_owned(), err.to_string()))
    }

    async fn delete_exchange(
        &self,
        name: &str,
        options: DeleteExchangeOptions,
    ) -> Result<(), BrokerError> {
        self.inner
            .exchange_delete(
                name,
                ExchangeDeleteOptions {
                    if_unused: options.if_unused,
                    nowait: options.nowait,
                },
            )
            .await
            .map_err(|err| BrokerError::Delete(name.to_owned(), err.to_string()))
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: DeclareQueueOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, BrokerError> {
        self.inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: options.nowait,
                },
                arguments,
            )
            .await
            .map(|queue| QueueInfo {
                name: queue.name().to_string(),
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            })
            .map_err(|err| BrokerError::DeclareQueue(name.to_owned(), err.to_string()))
    }

    async fn check_queue(&self, name: &str) -> Result<QueueInfo, BrokerError> {
        self.inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|queue| QueueInfo {
                name: queue.name().to_string(),
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            })
            .map_err(|err| BrokerError::CheckQueue(name.to_owned(), err.to_string()))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                arguments,
            )
            .await
            .map_err(|err| {
                BrokerError::Bind(queue.to_owned(), exchange.to_owned(), err.to_string())
            })
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        self.inner
            .queue_unbind(queue, exchange, routing_key, arguments)
            .await
            .map_err(|err| {
                BrokerError::Unbind(queue.to_owned(), exchange.to_owned(), err.to_string())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError> {
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map(|_confirm| ())
            .map_err(|err| BrokerError::Publish(exchange.to_owned(), err.to_string()))
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError> {
        self.inner
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map(|_confirm| ())
            .map_err(|err| BrokerError::Publish(queue.to_owned(), err.to_string()))
    }

    async fn get(
        &self,
        queue: &str,
        options: GetOptions,
    ) -> Result<Option<RawDelivery>, BrokerError> {
        self.inner
            .basic_get(
                queue,
                BasicGetOptions {
                    no_ack: options.no_ack,
                },
            )
            .await
            .map(|message| message.map(|message| raw_from_delivery(message.delivery, None)))
            .map_err(|err| BrokerError::Consume(queue.to_owned(), err.to_string()))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: options.nowait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| BrokerError::Consume(queue.to_owned(), err.to_string()))?;

        let tag = consumer.tag().to_string();
        let queue = queue.to_owned();
        let stream = consumer.map(move |result| {
            result
                .map(|delivery| raw_from_delivery(delivery, Some(tag.clone())))
                .map_err(|err| BrokerError::Consume(queue.clone(), err.to_string()))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| BrokerError::Cancel(consumer_tag.to_owned(), err.to_string()))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|err| BrokerError::Ack(err.to_string()))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| BrokerError::Ack(err.to_string()))
    }

    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), BrokerError> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|err| BrokerError::Qos(err.to_string()))
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, BrokerError> {
        self.inner
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|err| BrokerError::Purge(queue.to_owned(), err.to_string()))
    }

    async fn delete_queue(
        &self,
        name: &str,
        options: DeleteQueueOptions,
    ) -> Result<u32, BrokerError> {
        self.inner
            .queue_delete(
                name,
                QueueDeleteOptions {
                    if_unused: options.if_unused,
                    if_empty: options.if_empty,
                    nowait: options.nowait,
                },
            )
            .await
            .map_err(|err| BrokerError::Delete(name.to_owned(), err.to_string()))
    }

    fn on_event(&self, _callback: EventCallback) {
        // lapin surfaces channel failures on the failing operation itself;
        // liveness is tracked through status() via is_open().
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .close(200, "closing channel")
            .await
            .map_err(|err| BrokerError::CreateChannel(err.to_string()))
    }
}
