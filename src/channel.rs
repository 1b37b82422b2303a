// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Session Channel
//!
//! This module provides the lazy, self-healing logical channel of the
//! session layer. A `Channel` starts unbound; the transport channel handle
//! is created on first use and recreated transparently after a close or
//! failure, so higher-level components call [`Channel::get_channel`]
//! defensively before every operation without tracking prior failures.
//!
//! Channel creation delegates connection acquisition to the owning
//! [`Connection`], which makes it implicitly dependent on connection health
//! without duplicating the connection retry logic.

use crate::{
    connection::Connection,
    errors::BrokerError,
    transport::{EventCallback, TransportChannel, TransportEvent},
};
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};
use tokio::time::sleep;
use tracing::{debug, error, warn};

const RETRY_BACKOFF: f64 = 1.7;
const RETRY_DELAY_FLOOR: Duration = Duration::from_millis(200);
const RETRY_DELAY_CEILING: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct RetryState {
    delay: Duration,
    backoff: f64,
    attempts: u32,
    total_retry_time: Duration,
}

impl RetryState {
    fn initial() -> RetryState {
        RetryState {
            delay: Duration::ZERO,
            backoff: RETRY_BACKOFF,
            attempts: 1,
            total_retry_time: Duration::ZERO,
        }
    }

    fn record_failure(&mut self) {
        self.attempts += 1;
        self.total_retry_time += self.delay;
        self.delay = if self.delay.is_zero() {
            RETRY_DELAY_FLOOR
        } else {
            self.delay.mul_f64(self.backoff).min(RETRY_DELAY_CEILING)
        };
    }
}

struct ChannelInner {
    connection: Connection,
    handle: Mutex<Option<Arc<dyn TransportChannel>>>,
    /// Serializes creation so concurrent callers share one attempt
    create_gate: tokio::sync::Mutex<()>,
    retry: Mutex<RetryState>,
}

/// A lazy logical channel over a [`Connection`].
///
/// Cloning is cheap; clones share the same handle and retry state. An
/// unbound channel is a valid state, not an error: any operation through it
/// triggers (re)creation first.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("bound", &self.is_bound())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(connection: Connection) -> Channel {
        Channel {
            inner: Arc::new(ChannelInner {
                connection,
                handle: Mutex::new(None),
                create_gate: tokio::sync::Mutex::new(()),
                retry: Mutex::new(RetryState::initial()),
            }),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// True while a transport channel handle is held.
    pub fn is_bound(&self) -> bool {
        self.current().is_some()
    }

    /// Attempts made by the last creation cycle; resets to one after a
    /// successful creation.
    pub fn retry_attempts(&self) -> u32 {
        self.inner
            .retry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .attempts
    }

    fn current(&self) -> Option<Arc<dyn TransportChannel>> {
        self.inner
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the transport channel handle, creating it first when the
    /// channel is unbound or its previous handle died.
    ///
    /// # Returns
    /// The live handle. Creation waits out the current retry delay, asks
    /// the connection for its transport session (which may itself trigger
    /// connection-level re-establishment), and resets the retry counters
    /// on success.
    pub async fn get_channel(&self) -> Result<Arc<dyn TransportChannel>, BrokerError> {
        if let Some(handle) = self.current() {
            if handle.is_open() {
                return Ok(handle);
            }
        }

        let _gate = self.inner.create_gate.lock().await;
        if let Some(handle) = self.current() {
            if handle.is_open() {
                return Ok(handle);
            }
        }
        self.create_channel().await
    }

    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, BrokerError> {
        let delay = {
            self.inner
                .retry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .delay
        };
        debug!(delay_ms = delay.as_millis() as u64, "creating channel");
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let connection = self
            .inner
            .connection
            .get_connection()
            .await?
            .ok_or(BrokerError::ConnectionClosed)?;

        match connection.create_channel().await {
            Ok(handle) => {
                self.register_channel_event_listeners(&handle);
                *self
                    .inner
                    .handle
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
                *self
                    .inner
                    .retry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = RetryState::initial();
                Ok(handle)
            }
            Err(err) => {
                self.inner
                    .retry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record_failure();
                error!(error = err.to_string(), "failure to create a channel");
                Err(err)
            }
        }
    }

    /// Closes the current transport channel handle, if any.
    pub async fn close(&self) -> Result<(), BrokerError> {
        match self.current() {
            Some(handle) => handle.close().await,
            None => Ok(()),
        }
    }

    /// Installs the channel event listener for a freshly created handle.
    /// A close event clears the handle so the next `get_channel` call
    /// transparently recreates it; errors are logged and non-fatal.
    fn register_channel_event_listeners(&self, handle: &Arc<dyn TransportChannel>) {
        let weak_inner = Arc::downgrade(&self.inner);
        let weak_handle: Weak<dyn TransportChannel> = Arc::downgrade(handle);
        handle.on_event(Box::new(move |event| {
            let Some(inner) = weak_inner.upgrade() else {
                return;
            };
            match event {
                TransportEvent::Closed => {
                    let mut guard = inner.handle.lock().unwrap_or_else(PoisonError::into_inner);
                    let from_current = match (weak_handle.upgrade(), guard.as_ref()) {
                        (Some(emitter), Some(current)) => Arc::ptr_eq(&emitter, current),
                        _ => false,
                    };
                    if from_current {
                        *guard = None;
                    }
                }
                TransportEvent::Error(err) => error!(error = err.as_str(), "channel error"),
                TransportEvent::Blocked(reason) => {
                    warn!(reason = reason.as_str(), "channel blocked")
                }
                TransportEvent::Unblocked => debug!("channel unblocked"),
            }
        }) as EventCallback);
    }
}
