// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection
//!
//! This module provides the connection lifecycle state machine of the
//! session layer. A `Connection` is created without any I/O; the transport
//! session is opened lazily on first use and can be re-established
//! transparently after a failure when the automatic retry policy is
//! enabled.
//!
//! The closed flag is tri-state: a connection that was never opened, one
//! that is live, and one that was explicitly closed are distinguishable.
//! An explicitly closed connection yields no handle instead of silently
//! reconnecting.

use crate::{
    channel::Channel,
    consumer::{Consumer, ConsumerOptions},
    errors::BrokerError,
    lapin_transport::LapinTransport,
    options::{ConnectionOptions, RetryPolicy},
    producer::{Producer, ProducerOptions},
    transport::{EventCallback, QueueInfo, Transport, TransportConnection, TransportEvent},
};
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError, Weak},
};
use tokio::{sync::Notify, time::sleep};
use tracing::{debug, error};

#[derive(Default)]
struct ConnectionState {
    /// None until the first connect, then Some(false) while usable and
    /// Some(true) once explicitly closed
    closed: Option<bool>,
    handle: Option<Arc<dyn TransportConnection>>,
    default_channel: Option<Channel>,
}

struct ConnectionInner {
    options: ConnectionOptions,
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectionState>,
    /// Serializes establishment so concurrent callers share one attempt
    connect_gate: tokio::sync::Mutex<()>,
    closed_signal: Notify,
    watchers: Mutex<Vec<EventCallback>>,
}

impl ConnectionInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_watchers(&self, event: &TransportEvent) {
        let watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        for watcher in watchers.iter() {
            watcher(event.clone());
        }
    }
}

/// A connection to the broker.
///
/// Cloning is cheap and clones share the same underlying session; only the
/// connection itself transitions its lifecycle state (handle replacement on
/// reconnect, null-out on close). Producers, consumers and entities read
/// the current handle through the channels it hands out.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("Connection")
            .field("closed", &state.closed)
            .field("connected", &state.handle.is_some())
            .finish()
    }
}

impl Connection {
    /// Creates a connection over the production `lapin` transport. No I/O
    /// happens until the connection is first used.
    pub fn new(options: ConnectionOptions) -> Connection {
        Self::with_transport(options, Arc::new(LapinTransport))
    }

    /// Creates a connection over a custom transport implementation.
    pub fn with_transport(options: ConnectionOptions, transport: Arc<dyn Transport>) -> Connection {
        Connection {
            inner: Arc::new(ConnectionInner {
                options,
                transport,
                state: Mutex::new(ConnectionState::default()),
                connect_gate: tokio::sync::Mutex::new(()),
                closed_signal: Notify::new(),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// True iff the connection is not closed and a transport handle is
    /// present.
    pub fn is_connected(&self) -> bool {
        let state = self.inner.lock_state();
        state.closed == Some(false) && state.handle.is_some()
    }

    fn is_closed(&self) -> bool {
        self.inner.lock_state().closed == Some(true)
    }

    /// Registers a watcher for transport lifecycle events re-emitted on
    /// this connection.
    pub fn on_event(&self, callback: impl Fn(TransportEvent) + Send + Sync + 'static) {
        self.inner
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    /// Establishes the connection to the broker immediately.
    pub async fn connect(&self) -> Result<Arc<dyn TransportConnection>, BrokerError> {
        debug!("connect");
        self.inner.lock_state().closed = Some(false);
        self.get_connection()
            .await?
            .ok_or(BrokerError::ConnectionClosed)
    }

    /// Returns the underlying transport handle, establishing it first when
    /// necessary.
    ///
    /// # Returns
    /// * `Ok(Some(handle))` - the live transport handle, newly established
    ///   when the connection was not yet (or no longer) connected
    /// * `Ok(None)` - the connection was explicitly closed; a closed
    ///   connection yields no handle
    /// * `Err` - establishment failed (after exhausting the retry budget
    ///   when automatic retry is enabled)
    pub async fn get_connection(
        &self,
    ) -> Result<Option<Arc<dyn TransportConnection>>, BrokerError> {
        {
            let state = self.inner.lock_state();
            if state.closed == Some(true) {
                return Ok(None);
            }
            if let Some(handle) = &state.handle {
                if handle.is_connected() {
                    return Ok(Some(handle.clone()));
                }
            }
        }

        let _gate = self.inner.connect_gate.lock().await;
        {
            let mut state = self.inner.lock_state();
            if state.closed == Some(true) {
                return Ok(None);
            }
            if let Some(handle) = &state.handle {
                if handle.is_connected() {
                    return Ok(Some(handle.clone()));
                }
            }
            // about to (re)establish: the default channel belongs to the
            // previous handle
            state.default_channel = None;
            state.handle = None;
            state.closed = Some(false);
        }

        let handle = if self.inner.options.retry.enabled {
            let policy = self.inner.options.retry.clone();
            self.ensure_connection(&policy).await?
        } else {
            self.establish_connection().await?
        };
        Ok(Some(handle))
    }

    async fn establish_connection(&self) -> Result<Arc<dyn TransportConnection>, BrokerError> {
        debug!("establishing connection...");
        let handle = self.inner.transport.connect(&self.inner.options).await?;
        self.register_event_listeners(&handle);
        let mut state = self.inner.lock_state();
        state.handle = Some(handle.clone());
        state.closed = Some(false);
        Ok(handle)
    }

    /// Retries connection establishment under the given policy.
    ///
    /// Attempts run strictly in sequence: each one fully resolves or fails
    /// before the next begins, with a delay of
    /// `interval_start + attempt * interval_step` in front of attempt
    /// `attempt`. Closing the connection aborts the loop, including during
    /// a backoff sleep.
    ///
    /// # Parameters
    /// * `policy` - the retry policy to run under; the establishment
    ///   primitive is invoked at most `policy.max_retries` times
    ///
    /// # Returns
    /// The established handle, or `BrokerError::MaxRetriesReached` once
    /// the budget is exhausted.
    pub async fn ensure_connection(
        &self,
        policy: &RetryPolicy,
    ) -> Result<Arc<dyn TransportConnection>, BrokerError> {
        for attempt in 0..policy.max_retries {
            if self.is_closed() {
                return Err(BrokerError::ConnectionClosed);
            }
            let delay = policy.delay_for(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = self.inner.closed_signal.notified() => {
                        return Err(BrokerError::ConnectionClosed);
                    }
                }
            }
            match self.establish_connection().await {
                Ok(handle) => return Ok(handle),
                Err(err) => error!(
                    error = err.to_string(),
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    "failed to establish connection"
                ),
            }
        }
        Err(BrokerError::MaxRetriesReached {
            max_retries: policy.max_retries,
        })
    }

    /// Closes the connection. The handle and the default channel are
    /// cleared even when the transport-level close fails.
    pub async fn close(&self) -> Result<(), BrokerError> {
        debug!("closing connection");
        let handle = {
            let mut state = self.inner.lock_state();
            state.closed = Some(true);
            state.default_channel = None;
            state.handle.take()
        };
        self.inner.closed_signal.notify_waiters();
        if let Some(handle) = handle {
            handle.close().await?;
        }
        Ok(())
    }

    /// Returns a new unbound channel on this connection. Pure object
    /// construction; the channel handle is created on first use.
    pub fn channel(&self) -> Channel {
        debug!("create channel");
        Channel::new(self.clone())
    }

    /// Default channel, created upon access and dropped when the
    /// connection closes or reconnects.
    pub async fn default_channel(&self) -> Result<Channel, BrokerError> {
        self.get_connection().await?;
        let mut state = self.inner.lock_state();
        let channel = state
            .default_channel
            .get_or_insert_with(|| Channel::new(self.clone()));
        Ok(channel.clone())
    }

    /// Passive queue existence check through the default channel.
    pub async fn check_queue(&self, queue: &str) -> Result<QueueInfo, BrokerError> {
        let channel = self.default_channel().await?;
        let handle = channel.get_channel().await?;
        handle.check_queue(queue).await
    }

    /// Creates a new producer, injecting a fresh channel when the options
    /// do not carry one.
    pub fn producer(&self, mut options: ProducerOptions) -> Producer {
        let channel = options.channel.take().unwrap_or_else(|| self.channel());
        Producer::with_channel(channel, options)
    }

    /// Creates a new consumer, injecting a fresh channel when the options
    /// do not carry one.
    pub fn consumer(&self, mut options: ConsumerOptions) -> Consumer {
        let channel = options.channel.take().unwrap_or_else(|| self.channel());
        Consumer::with_channel(channel, options)
    }

    /// Installs the transport event listener for a freshly established
    /// handle. Listeners are attached once per handle; a replacement handle
    /// gets its own registration.
    fn register_event_listeners(&self, handle: &Arc<dyn TransportConnection>) {
        let weak_inner = Arc::downgrade(&self.inner);
        let weak_handle: Weak<dyn TransportConnection> = Arc::downgrade(handle);
        handle.on_event(Box::new(move |event| {
            let Some(inner) = weak_inner.upgrade() else {
                return;
            };
            match &event {
                TransportEvent::Closed => {
                    // only the handle currently owned may be cleared;
                    // events from a superseded handle are ignored
                    let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
                    let from_current = match (weak_handle.upgrade(), state.handle.as_ref()) {
                        (Some(emitter), Some(current)) => Arc::ptr_eq(&emitter, current),
                        _ => false,
                    };
                    if from_current {
                        state.handle = None;
                    }
                }
                TransportEvent::Error(err) => {
                    error!(error = err.as_str(), "connection error");
                }
                _ => {}
            }
            inner.notify_watchers(&event);
        }));
    }
}
