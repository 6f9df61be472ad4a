use crate::delivery::{FrameSink, SubscriptionGuard};
use crate::hub::{PublishReport, SubscriptionHub};
use crate::model::TopicKey;
use crate::orchestrator::AnalyticsOrchestrator;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct WorkerHandle {
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

/// Owns one periodic worker per live topic. Workers start with the first
/// subscriber and stop with the last.
pub struct TopicScheduler {
    hub: SubscriptionHub,
    orchestrator: Arc<AnalyticsOrchestrator>,
    interval: Duration,
    workers: Mutex<HashMap<TopicKey, WorkerHandle>>,
}

impl TopicScheduler {
    pub fn new(
        hub: SubscriptionHub,
        orchestrator: Arc<AnalyticsOrchestrator>,
        interval: Duration,
    ) -> Self {
        Self {
            hub,
            orchestrator,
            interval,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn hub(&self) -> &SubscriptionHub {
        &self.hub
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Attaches a sink to the topic, starting its worker if this is the first
    /// subscriber. Must be called inside a tokio runtime.
    pub fn subscribe(self: &Arc<Self>, key: &TopicKey, sink: Arc<dyn FrameSink>) -> SubscriptionGuard {
        let mut workers = self.workers.lock();
        let outcome = self.hub.subscribe(key, sink);
        if !workers.contains_key(key) {
            let cancel = CancellationToken::new();
            let worker = TopicWorker {
                key: key.clone(),
                hub: self.hub.clone(),
                orchestrator: Arc::clone(&self.orchestrator),
                cancel: cancel.clone(),
            };
            let task = tokio::spawn(drive_topic(worker, self.interval));
            workers.insert(
                key.clone(),
                WorkerHandle {
                    cancel,
                    _task: task,
                },
            );
            info!(target: "scheduler", topic = %key, interval = ?self.interval, "worker started");
        }
        SubscriptionGuard::new(Arc::clone(self), key.clone(), outcome.id)
    }

    pub fn unsubscribe(&self, key: &TopicKey, id: u64) {
        let mut workers = self.workers.lock();
        if !self.hub.unsubscribe(key, id) {
            return;
        }
        if let Some(handle) = workers.remove(key) {
            handle.cancel.cancel();
            info!(target: "scheduler", topic = %key, "worker stopped");
        }
        self.orchestrator.forget(key);
    }

    pub fn active_workers(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_running(&self, key: &TopicKey) -> bool {
        self.workers.lock().contains_key(key)
    }

    pub fn shutdown(&self) {
        let mut workers = self.workers.lock();
        for (key, handle) in workers.drain() {
            handle.cancel.cancel();
            self.orchestrator.forget(&key);
        }
    }
}

/// One topic's unit of scheduled work.
pub struct TopicWorker {
    pub key: TopicKey,
    pub hub: SubscriptionHub,
    pub orchestrator: Arc<AnalyticsOrchestrator>,
    pub cancel: CancellationToken,
}

impl TopicWorker {
    /// Runs one tick and publishes its outcome. A failed tick publishes an
    /// error event and no frame.
    pub async fn step(&self) -> PublishReport {
        match self.orchestrator.tick_until(&self.key, &self.cancel).await {
            Ok(frame) => {
                let report = self.hub.publish(&frame);
                if report.lagged > 0 || report.removed > 0 {
                    warn!(
                        target: "hub",
                        topic = %self.key,
                        lagged = report.lagged,
                        removed = report.removed,
                        "partial delivery"
                    );
                }
                report
            }
            Err(err) => {
                warn!(target: "tick", topic = %self.key, error = %err, "tick skipped");
                self.hub.publish_error(&self.key, "market data temporarily unavailable")
            }
        }
    }
}

async fn drive_topic(worker: TopicWorker, period: Duration) {
    let cancel = worker.cancel.clone();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = worker.step() => {}
                }
            }
        }
    }
}
