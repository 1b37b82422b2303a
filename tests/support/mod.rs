// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the transport seam for tests.
//!
//! The broker models exchanges with direct/fanout/topic routing, queues
//! with round-robin consumer delivery, prefetch bookkeeping for ack-based
//! flow control, and an operation log so tests can assert call ordering.
//! Failures can be injected per operation (`poison`) and per connect
//! attempt (`fail_connects`).

#![allow(dead_code)]

use amqp_session::{
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
use lapin::{types::FieldTable, BasicProperties};
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::mpsc;

/// Matches a topic binding pattern against a routing key: `*` matches
/// exactly one dot-separated word, `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => {
                matches(rest, key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            Some((&"*", rest)) => match key.split_first() {
                Some((_, key_rest)) => matches(rest, key_rest),
                None => false,
            },
            Some((word, rest)) => match key.split_first() {
                Some((key_word, key_rest)) => word == key_word && matches(rest, key_rest),
                None => false,
            },
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[derive(Clone)]
struct StoredMessage {
    data: Vec<u8>,
    properties: BasicProperties,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

struct ConsumerRec {
    tag: String,
    queue: String,
    channel_id: u64,
    no_ack: bool,
    prefetch: u16,
    tx: mpsc::UnboundedSender<RawDelivery>,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    consumer_order: Vec<String>,
    rr: usize,
}

struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct Unacked {
    queue: String,
    consumer_tag: Option<String>,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeType>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    consumers: HashMap<String, ConsumerRec>,
    unacked: HashMap<(u64, u64), Unacked>,
    channel_prefetch: HashMap<u64, u16>,
    channel_consumer_prefetch: HashMap<u64, u16>,
    next_delivery_tag: u64,
    next_channel_id: u64,
    connect_calls: u32,
    connect_failures: u32,
    poison: Option<String>,
    log: Vec<String>,
    connections: Vec<Arc<MemoryConnection>>,
}

impl BrokerState {
    fn consume_poison(&mut self, op: &str) -> bool {
        if self.poison.as_deref() == Some(op) {
            self.poison = None;
            return true;
        }
        false
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return vec![routing_key.to_owned()];
        }
        let Some(kind) = self.exchanges.get(exchange) else {
            return Vec::new();
        };
        let mut targets = BTreeSet::new();
        for binding in &self.bindings {
            if binding.exchange != exchange {
                continue;
            }
            let matched = match kind {
                ExchangeType::Direct => binding.routing_key == routing_key,
                ExchangeType::Fanout => true,
                ExchangeType::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeType::Headers => true,
            };
            if matched {
                targets.insert(binding.queue.clone());
            }
        }
        targets.into_iter().collect()
    }

    fn has_capacity(&self, rec: &ConsumerRec) -> bool {
        if rec.no_ack {
            return true;
        }
        if let Some(&global) = self.channel_prefetch.get(&rec.channel_id) {
            if global > 0 {
                let in_flight = self
                    .unacked
                    .keys()
                    .filter(|(channel, _)| *channel == rec.channel_id)
                    .count();
                if in_flight >= global as usize {
                    return false;
                }
            }
        }
        if rec.prefetch > 0 {
            let in_flight = self
                .unacked
                .values()
                .filter(|unacked| unacked.consumer_tag.as_deref() == Some(rec.tag.as_str()))
                .count();
            if in_flight >= rec.prefetch as usize {
                return false;
            }
        }
        true
    }

    fn remove_consumer(&mut self, tag: &str) {
        self.consumers.remove(tag);
        for queue in self.queues.values_mut() {
            queue.consumer_order.retain(|t| t != tag);
            if !queue.consumer_order.is_empty() {
                queue.rr %= queue.consumer_order.len();
            } else {
                queue.rr = 0;
            }
        }
    }

    fn pump(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get(queue_name) else {
                return;
            };
            if queue.messages.is_empty() {
                return;
            }
            let order = queue.consumer_order.clone();
            let count = order.len();
            if count == 0 {
                return;
            }
            let start = queue.rr;
            let mut chosen = None;
            for offset in 0..count {
                let tag = &order[(start + offset) % count];
                if let Some(rec) = self.consumers.get(tag) {
                    if self.has_capacity(rec) {
                        chosen = Some(tag.clone());
                        break;
                    }
                }
            }
            let Some(tag) = chosen else {
                return;
            };
            let (channel_id, no_ack, tx) = {
                let rec = self.consumers.get(&tag).expect("chosen consumer exists");
                (rec.channel_id, rec.no_ack, rec.tx.clone())
            };
            let message = {
                let queue = self.queues.get_mut(queue_name).expect("queue exists");
                queue.rr = (start + 1) % count;
                match queue.messages.pop_front() {
                    Some(message) => message,
                    None => return,
                }
            };
            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            let raw = RawDelivery {
                delivery_tag,
                consumer_tag: Some(tag.clone()),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                data: message.data.clone(),
                properties: message.properties.clone(),
            };
            match tx.send(raw) {
                Ok(()) => {
                    if !no_ack {
                        self.unacked.insert(
                            (channel_id, delivery_tag),
                            Unacked {
                                queue: queue_name.to_owned(),
                                consumer_tag: Some(tag),
                                message,
                            },
                        );
                    }
                }
                Err(_) => {
                    self.remove_consumer(&tag);
                    if let Some(queue) = self.queues.get_mut(queue_name) {
                        queue.messages.push_front(message);
                    }
                }
            }
        }
    }

    fn enqueue(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) {
        for queue_name in self.route(exchange, routing_key) {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.messages.push_back(StoredMessage {
                    data: payload.to_vec(),
                    properties: properties.clone(),
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    redelivered: false,
                });
                self.pump(&queue_name);
            }
        }
    }
}

/// In-memory broker handed to [`amqp_session::Connection::with_transport`].
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker {
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails the next `count` connect attempts.
    pub fn fail_connects(&self, count: u32) {
        self.lock().connect_failures = count;
    }

    /// Fails the next operation with the given log name.
    pub fn poison(&self, op: &str) {
        self.lock().poison = Some(op.to_owned());
    }

    pub fn connect_calls(&self) -> u32 {
        self.lock().connect_calls
    }

    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn message_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|queue| queue.messages.len())
            .unwrap_or(0)
    }

    pub fn binding_count(&self, queue: &str) -> usize {
        self.lock()
            .bindings
            .iter()
            .filter(|binding| binding.queue == queue)
            .count()
    }

    /// Drops every live connection, firing closed events like a broker
    /// going away.
    pub fn kill_connections(&self) {
        let connections: Vec<Arc<MemoryConnection>> = {
            let mut state = self.lock();
            state.connections.drain(..).collect()
        };
        for connection in connections {
            connection.connected.store(false, Ordering::SeqCst);
            connection.emit(TransportEvent::Closed);
        }
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(
        &self,
        _options: &ConnectionOptions,
    ) -> Result<Arc<dyn TransportConnection>, BrokerError> {
        let mut state = self.lock();
        state.connect_calls += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(BrokerError::Connect("connection refused".to_owned()));
        }
        let connection = Arc::new(MemoryConnection {
            state: self.state.clone(),
            connected: AtomicBool::new(true),
            callbacks: Mutex::new(Vec::new()),
        });
        state.connections.push(connection.clone());
        Ok(connection)
    }
}

pub struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    connected: AtomicBool,
    callbacks: Mutex<Vec<EventCallback>>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemoryConnection {
    fn emit(&self, event: TransportEvent) {
        let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        for callback in callbacks.iter() {
            callback(event.clone());
        }
    }
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::CreateChannel("connection is dead".to_owned()));
        }
        let id = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.consume_poison("create_channel") {
                return Err(BrokerError::CreateChannel("poisoned".to_owned()));
            }
            state.next_channel_id += 1;
            state.next_channel_id
        };
        Ok(Arc::new(MemoryChannel {
            id,
            state: self.state.clone(),
            open: AtomicBool::new(true),
            callbacks: Mutex::new(Vec::new()),
        }))
    }

    fn on_event(&self, callback: EventCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(TransportEvent::Closed);
        Ok(())
    }
}

pub struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    open: AtomicBool,
    callbacks: Mutex<Vec<EventCallback>>,
}

impl MemoryChannel {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        for callback in callbacks.iter() {
            callback(event.clone());
        }
    }

    /// A failed passive check closes the channel, mirroring the protocol.
    fn invalidate(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.emit(TransportEvent::Closed);
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        options: DeclareExchangeOptions,
        _arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if state.consume_poison("exchange_declare") {
            return Err(BrokerError::DeclareExchange(
                name.to_owned(),
                "poisoned".to_owned(),
            ));
        }
        if options.passive && !state.exchanges.contains_key(name) {
            drop(state);
            self.invalidate();
            return Err(BrokerError::CheckExchange(
                name.to_owned(),
                "not found".to_owned(),
            ));
        }
        state.exchanges.insert(name.to_owned(), kind);
        state.log.push(format!("exchange_declare {name}"));
        Ok(())
    }

    async fn check_exchange(&self, name: &str) -> Result<(), BrokerError> {
        let exists = self.lock().exchanges.contains_key(name);
        if !exists {
            self.invalidate();
            return Err(BrokerError::CheckExchange(
                name.to_owned(),
                "not found".to_owned(),
            ));
        }
        Ok(())
    }

    async fn delete_exchange(
        &self,
        name: &str,
        _options: DeleteExchangeOptions,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if state.exchanges.remove(name).is_none() {
            return Err(BrokerError::Delete(name.to_owned(), "not found".to_owned()));
        }
        state.bindings.retain(|binding| binding.exchange != name);
        state.log.push(format!("exchange_delete {name}"));
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: DeclareQueueOptions,
        _arguments: FieldTable,
    ) -> Result<QueueInfo, BrokerError> {
        let mut state = self.lock();
        if state.consume_poison("queue_declare") {
            return Err(BrokerError::DeclareQueue(
                name.to_owned(),
                "poisoned".to_owned(),
            ));
        }
        if options.passive && !state.queues.contains_key(name) {
            drop(state);
            self.invalidate();
            return Err(BrokerError::CheckQueue(
                name.to_owned(),
                "not found".to_owned(),
            ));
        }
        let queue = state.queues.entry(name.to_owned()).or_default();
        let info = QueueInfo {
            name: name.to_owned(),
            message_count: queue.messages.len() as u32,
            consumer_count: queue.consumer_order.len() as u32,
        };
        state.log.push(format!("queue_declare {name}"));
        Ok(info)
    }

    async fn check_queue(&self, name: &str) -> Result<QueueInfo, BrokerError> {
        let mut state = self.lock();
        let info = state.queues.get(name).map(|queue| QueueInfo {
            name: name.to_owned(),
            message_count: queue.messages.len() as u32,
            consumer_count: queue.consumer_order.len() as u32,
        });
        match info {
            Some(info) => {
                state.log.push(format!("queue_check {name}"));
                Ok(info)
            }
            None => {
                drop(state);
                self.invalidate();
                Err(BrokerError::CheckQueue(
                    name.to_owned(),
                    "not found".to_owned(),
                ))
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if state.consume_poison("queue_bind") {
            return Err(BrokerError::Bind(
                queue.to_owned(),
                exchange.to_owned(),
                "poisoned".to_owned(),
            ));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Bind(
                queue.to_owned(),
                exchange.to_owned(),
                "no exchange".to_owned(),
            ));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Bind(
                queue.to_owned(),
                exchange.to_owned(),
                "no queue".to_owned(),
            ));
        }
        let duplicate = state.bindings.iter().any(|binding| {
            binding.queue == queue
                && binding.exchange == exchange
                && binding.routing_key == routing_key
        });
        if !duplicate {
            state.bindings.push(Binding {
                exchange: exchange.to_owned(),
                queue: queue.to_owned(),
                routing_key: routing_key.to_owned(),
            });
        }
        state
            .log
            .push(format!("queue_bind {queue} {exchange} {routing_key}"));
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.bindings.retain(|binding| {
            !(binding.queue == queue
                && binding.exchange == exchange
                && binding.routing_key == routing_key)
        });
        state
            .log
            .push(format!("queue_unbind {queue} {exchange} {routing_key}"));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if state.consume_poison("publish") {
            return Err(BrokerError::Publish(
                exchange.to_owned(),
                "poisoned".to_owned(),
            ));
        }
        state
            .log
            .push(format!("publish {exchange} {routing_key}"));
        state.enqueue(exchange, routing_key, payload, properties);
        Ok(())
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.log.push(format!("send_to_queue {queue}"));
        state.enqueue("", queue, payload, properties);
        Ok(())
    }

    async fn get(
        &self,
        queue: &str,
        options: GetOptions,
    ) -> Result<Option<RawDelivery>, BrokerError> {
        let mut state = self.lock();
        let channel_id = self.id;
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(BrokerError::Consume(
                queue.to_owned(),
                "not found".to_owned(),
            ));
        };
        let Some(message) = queue_state.messages.pop_front() else {
            return Ok(None);
        };
        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;
        let raw = RawDelivery {
            delivery_tag,
            consumer_tag: None,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            data: message.data.clone(),
            properties: message.properties.clone(),
        };
        if !options.no_ack {
            state.unacked.insert(
                (channel_id, delivery_tag),
                Unacked {
                    queue: queue.to_owned(),
                    consumer_tag: None,
                    message,
                },
            );
        }
        Ok(Some(raw))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.lock();
        if state.consume_poison("consume") {
            return Err(BrokerError::Consume(
                queue.to_owned(),
                "poisoned".to_owned(),
            ));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Consume(
                queue.to_owned(),
                "not found".to_owned(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let prefetch = state
            .channel_consumer_prefetch
            .get(&self.id)
            .copied()
            .unwrap_or(0);
        state.consumers.insert(
            consumer_tag.to_owned(),
            ConsumerRec {
                tag: consumer_tag.to_owned(),
                queue: queue.to_owned(),
                channel_id: self.id,
                no_ack: options.no_ack,
                prefetch,
                tx,
            },
        );
        state
            .queues
            .get_mut(queue)
            .expect("queue exists")
            .consumer_order
            .push(consumer_tag.to_owned());
        state.log.push(format!("consume {queue} {consumer_tag}"));
        state.pump(queue);
        drop(state);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|raw| (Ok(raw), rx))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.remove_consumer(consumer_tag);
        state.log.push(format!("cancel {consumer_tag}"));
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let Some(unacked) = state.unacked.remove(&(self.id, delivery_tag)) else {
            return Err(BrokerError::Ack("unknown delivery tag".to_owned()));
        };
        state.log.push(format!("ack {delivery_tag}"));
        state.pump(&unacked.queue);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let Some(unacked) = state.unacked.remove(&(self.id, delivery_tag)) else {
            return Err(BrokerError::Ack("unknown delivery tag".to_owned()));
        };
        state.log.push(format!("reject {delivery_tag} {requeue}"));
        if requeue {
            let mut message = unacked.message;
            message.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                queue.messages.push_front(message);
            }
        }
        state.pump(&unacked.queue);
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if global {
            state.channel_prefetch.insert(self.id, prefetch_count);
        } else {
            state
                .channel_consumer_prefetch
                .insert(self.id, prefetch_count);
        }
        state.log.push(format!("qos {prefetch_count} {global}"));
        let queues: Vec<String> = state.queues.keys().cloned().collect();
        for queue in queues {
            state.pump(&queue);
        }
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, BrokerError> {
        let mut state = self.lock();
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(BrokerError::Purge(
                queue.to_owned(),
                "not found".to_owned(),
            ));
        };
        let dropped = queue_state.messages.len() as u32;
        queue_state.messages.clear();
        state.log.push(format!("purge {queue}"));
        Ok(dropped)
    }

    async fn delete_queue(
        &self,
        name: &str,
        _options: DeleteQueueOptions,
    ) -> Result<u32, BrokerError> {
        let mut state = self.lock();
        let Some(queue) = state.queues.remove(name) else {
            return Err(BrokerError::Delete(name.to_owned(), "not found".to_owned()));
        };
        for tag in queue.consumer_order.clone() {
            state.consumers.remove(&tag);
        }
        state.bindings.retain(|binding| binding.queue != name);
        state.log.push(format!("queue_delete {name}"));
        Ok(queue.messages.len() as u32)
    }

    fn on_event(&self, callback: EventCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.open.store(false, Ordering::SeqCst);
        self.emit(TransportEvent::Closed);
        Ok(())
    }
}
