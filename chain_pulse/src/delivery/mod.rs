use crate::model::{AnalyticsFrame, TopicKey};
use crate::orchestrator::{AnalyticsOrchestrator, TickError};
use crate::scheduler::TopicScheduler;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// What the hub hands to a sink.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Frame(Arc<AnalyticsFrame>),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Sink buffer full; this event is dropped for this subscriber only.
    Lagged,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Push,
    EventStream,
    Pull,
}

impl Display for Transport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Push => write!(f, "push"),
            Transport::EventStream => write!(f, "event_stream"),
            Transport::Pull => write!(f, "pull"),
        }
    }
}

/// Outbound side of one subscriber. `send` must never block.
pub trait FrameSink: Send + Sync {
    fn send(&self, event: StreamEvent) -> SendOutcome;
    fn is_closed(&self) -> bool;
    fn transport(&self) -> Transport;
}

pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
    transport: Transport,
}

impl ChannelSink {
    pub fn channel(transport: Transport, buffer: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx, transport }, rx)
    }
}

impl FrameSink for ChannelSink {
    fn send(&self, event: StreamEvent) -> SendOutcome {
        match self.tx.try_send(event) {
            Ok(()) => SendOutcome::Delivered,
            Err(TrySendError::Full(_)) => SendOutcome::Lagged,
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn transport(&self) -> Transport {
        self.transport
    }
}

/// Wire shape shared by the WebSocket and SSE transports.
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum WireEvent<'a> {
    Data(&'a AnalyticsFrame),
    Heartbeat,
    Error(&'a str),
}

impl<'a> WireEvent<'a> {
    pub fn from_stream(event: &'a StreamEvent) -> Self {
        match event {
            StreamEvent::Frame(frame) => WireEvent::Data(frame),
            StreamEvent::Error(message) => WireEvent::Error(message),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WireEvent::Data(_) => "data",
            WireEvent::Heartbeat => "heartbeat",
            WireEvent::Error(_) => "error",
        }
    }
}

#[derive(Debug, Error)]
pub enum PullError {
    #[error("no frame available for {key}: {source}")]
    Unavailable {
        key: TopicKey,
        #[source]
        source: Arc<TickError>,
    },
}

type Refresh = Shared<BoxFuture<'static, Result<Arc<AnalyticsFrame>, Arc<TickError>>>>;

/// Last-resort transport: answers from the cache, or runs one immediate
/// cycle when nothing recent is cached. Pulls that miss while a cycle for
/// the same topic is running wait on that cycle. Never touches the hub.
pub struct PullDelivery {
    orchestrator: Arc<AnalyticsOrchestrator>,
    in_flight: Arc<Mutex<HashMap<TopicKey, Refresh>>>,
}

impl PullDelivery {
    pub fn new(orchestrator: Arc<AnalyticsOrchestrator>) -> Self {
        Self {
            orchestrator,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn snapshot(&self, key: &TopicKey) -> Result<Arc<AnalyticsFrame>, PullError> {
        if let Some(frame) = self.orchestrator.cached(key).await {
            debug!(target: "server", topic = %key, "pull served from cache");
            return Ok(frame);
        }
        let refresh = self.join_refresh(key);
        refresh.await.map_err(|source| PullError::Unavailable {
            key: key.clone(),
            source,
        })
    }

    /// Number of topics with a pull-driven cycle currently running.
    pub fn refreshes_in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    fn join_refresh(&self, key: &TopicKey) -> Refresh {
        let mut in_flight = self.in_flight.lock();
        if let Some(running) = in_flight.get(key) {
            debug!(target: "server", topic = %key, "pull joined running refresh");
            return running.clone();
        }
        let orchestrator = Arc::clone(&self.orchestrator);
        let registry = Arc::clone(&self.in_flight);
        let topic = key.clone();
        let refresh = async move {
            let result = orchestrator.refresh(&topic).await.map_err(Arc::new);
            registry.lock().remove(&topic);
            result
        }
        .boxed()
        .shared();
        in_flight.insert(key.clone(), refresh.clone());
        // Runs to completion even if every waiting client disconnects.
        tokio::spawn(refresh.clone().map(|_| ()));
        refresh
    }
}

/// Keeps one subscription alive; dropping it detaches the subscriber and, if
/// it was the last one, stops the topic.
pub struct SubscriptionGuard {
    scheduler: Arc<TopicScheduler>,
    key: TopicKey,
    id: u64,
}

impl SubscriptionGuard {
    pub fn new(scheduler: Arc<TopicScheduler>, key: TopicKey, id: u64) -> Self {
        Self { scheduler, key, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &TopicKey {
        &self.key
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.scheduler.unsubscribe(&self.key, self.id);
    }
}
