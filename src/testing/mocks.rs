//! Mock implementations for testing
//!
//! Provides an in-memory [`Broker`], handlers with observable behaviour and a
//! fixed-token [`TokenProvider`], so the dispatch path can be exercised
//! without a running MQTT broker.

use crate::error::{HandlerError, TransportError};
use crate::protocol::{BrokerMessage, EventContext, EventEnvelope, PublishResult};
use crate::subscription::EventHandler;
use crate::transport::{AccessToken, Broker, TokenError, TokenProvider};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// Broker that keeps published messages in memory
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    published: Mutex<Vec<BrokerMessage>>,
    connected: AtomicBool,
    should_fail: bool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker whose `connect` and `publish` always fail
    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn published(&self) -> Vec<BrokerMessage> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_history(&self) {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.should_fail {
            return Err(TransportError::other("Mock connection failure"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, message: BrokerMessage) -> PublishResult {
        if self.should_fail {
            return PublishResult::failed("Mock publish failure");
        }
        if !self.is_connected() {
            return PublishResult::failed("Not connected");
        }

        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        PublishResult::ok(Uuid::new_v4().to_string())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Handler that remembers every event it sees
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<(EventEnvelope, EventContext)>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn events(&self) -> Vec<(EventEnvelope, EventContext)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &EventEnvelope, context: &EventContext) -> Result<(), HandlerError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((event.clone(), context.clone()));
        Ok(())
    }
}

/// Handler that always returns an error
#[derive(Debug)]
pub struct FailingHandler {
    message: String,
}

impl FailingHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl EventHandler for FailingHandler {
    async fn handle(&self, _event: &EventEnvelope, _context: &EventContext) -> Result<(), HandlerError> {
        Err(self.message.clone().into())
    }
}

/// Handler that panics
#[derive(Debug)]
pub struct PanickingHandler;

#[async_trait]
impl EventHandler for PanickingHandler {
    async fn handle(&self, event: &EventEnvelope, _context: &EventContext) -> Result<(), HandlerError> {
        panic!("handler panicked on {}", event.event_type);
    }
}

/// Handler that holds each call open for a while and tracks peak concurrency
#[derive(Debug)]
pub struct ConcurrencyTracker {
    hold: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    completed: AtomicUsize,
}

impl ConcurrencyTracker {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for ConcurrencyTracker {
    async fn handle(&self, _event: &EventEnvelope, _context: &EventContext) -> Result<(), HandlerError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.hold).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Token provider returning a fixed token, or a fixed error
#[derive(Debug)]
pub struct StaticTokenProvider {
    token: Result<String, String>,
    ttl: Duration,
    calls: AtomicUsize,
}

impl StaticTokenProvider {
    /// Tokens expire `ttl` after each request
    pub fn new(token: impl Into<String>, ttl: Duration) -> Self {
        Self {
            token: Ok(token.into()),
            ttl,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            token: Err(message.into()),
            ttl: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of tokens requested so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> Result<AccessToken, TokenError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.token {
            Ok(token) => {
                let ttl = chrono::Duration::from_std(self.ttl)?;
                Ok(AccessToken {
                    access_token: token.clone(),
                    expires_at: Utc::now() + ttl,
                })
            }
            Err(message) => Err(message.clone().into()),
        }
    }
}
