use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use crate::models::{
    AgentMetrics, AgentStatus, LatencyHistogram, LatencySummary, LifecycleEvent, PoolMetrics,
    RequestResult,
};
use crate::services::clock::now_ms;
use crate::services::events::EventBus;

/// Latency samples retained for percentile computation. Percentiles are exact
/// over this window and approximate over the whole run.
pub const DEFAULT_LATENCY_WINDOW: usize = 2000;
pub const THROUGHPUT_WINDOW_MS: u64 = 1000;
pub const RECOMPUTE_INTERVAL: Duration = Duration::from_millis(100);

const MEMPOOL_CONFLICT_PATTERNS: [&str; 3] = [
    "already known",
    "known transaction",
    "replacement transaction underpriced",
];

pub fn is_mempool_conflict(error: &str) -> bool {
    let error = error.to_lowercase();
    MEMPOOL_CONFLICT_PATTERNS.iter().any(|p| error.contains(p))
}

/// Nearest-rank percentile over ascending `sorted` samples.
pub fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[index]
}

/// Rolling statistics over a stream of request results and lifecycle events.
///
/// Every field is a fold over the input stream, so replaying an event log into
/// an empty aggregator reproduces the same state.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    mempool_conflicts: u64,
    other_failures: u64,
    latencies: VecDeque<u64>,
    latency_window: usize,
    histogram: LatencyHistogram,
    recent_successes: VecDeque<u64>,
    current_tps: u64,
    agents: BTreeMap<String, AgentMetrics>,
    first_event_at: Option<u64>,
    last_event_at: Option<u64>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_WINDOW)
    }
}

impl MetricsAggregator {
    pub fn new(latency_window: usize) -> Self {
        let latency_window = latency_window.max(1);
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            mempool_conflicts: 0,
            other_failures: 0,
            latencies: VecDeque::with_capacity(latency_window),
            latency_window,
            histogram: LatencyHistogram::default(),
            recent_successes: VecDeque::new(),
            current_tps: 0,
            agents: BTreeMap::new(),
            first_event_at: None,
            last_event_at: None,
        }
    }

    /// Rebuilds an aggregator from a full event log, with throughput evaluated
    /// at the last event's timestamp.
    pub fn replay<'a>(
        events: impl IntoIterator<Item = &'a LifecycleEvent>,
        latency_window: usize,
    ) -> Self {
        let mut aggregator = Self::new(latency_window);
        for event in events {
            aggregator.record_event(event);
        }
        if let Some(last) = aggregator.last_event_at {
            aggregator.recompute_throughput(last);
        }
        aggregator
    }

    fn touch(&mut self, timestamp: u64) {
        self.first_event_at = Some(self.first_event_at.map_or(timestamp, |t| t.min(timestamp)));
        self.last_event_at = Some(self.last_event_at.map_or(timestamp, |t| t.max(timestamp)));
    }

    fn agent_mut(&mut self, agent_id: &str, timestamp: u64) -> &mut AgentMetrics {
        let agent = self
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentMetrics::new(agent_id.to_string(), None, timestamp));
        agent.last_seen = agent.last_seen.max(timestamp);
        agent
    }

    pub fn record_result(&mut self, result: &RequestResult) {
        self.touch(result.timestamp);
        self.total_requests += 1;

        if result.success {
            self.successful_requests += 1;
            self.recent_successes.push_back(result.timestamp);
            let horizon = result.timestamp.saturating_sub(THROUGHPUT_WINDOW_MS);
            while self.recent_successes.front().is_some_and(|t| *t <= horizon) {
                self.recent_successes.pop_front();
            }
        } else {
            self.failed_requests += 1;
            match result.error.as_deref() {
                Some(error) if is_mempool_conflict(error) => self.mempool_conflicts += 1,
                _ => self.other_failures += 1,
            }
        }

        if self.latencies.len() == self.latency_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(result.latency_ms);
        self.histogram.record(result.latency_ms);

        let agent = self.agent_mut(&result.agent_id, result.timestamp);
        agent.requests += 1;
        agent.total_latency_ms += result.latency_ms;
        if result.success {
            agent.successes += 1;
            agent.last_status = AgentStatus::Success;
        } else {
            agent.failures += 1;
            agent.last_status = AgentStatus::Failed;
        }
    }

    pub fn record_event(&mut self, event: &LifecycleEvent) {
        if let Some(result) = event.as_request_result() {
            self.record_result(&result);
            return;
        }

        let timestamp = event.timestamp();
        self.touch(timestamp);
        match event {
            LifecycleEvent::AgentRegistered {
                agent_id, address, ..
            } => {
                let known = self.agents.contains_key(agent_id.as_str());
                let agent = self.agent_mut(agent_id, timestamp);
                if !known {
                    agent.connected = false;
                }
                if address.is_some() {
                    agent.address = address.clone();
                }
            }
            LifecycleEvent::AgentConnected {
                agent_id, address, ..
            } => {
                let agent = self.agent_mut(agent_id, timestamp);
                agent.connected = true;
                if address.is_some() {
                    agent.address = address.clone();
                }
            }
            LifecycleEvent::AgentDisconnected { agent_id, .. } => {
                self.agent_mut(agent_id, timestamp).connected = false;
            }
            LifecycleEvent::PaymentSubmitted { agent_id, .. } => {
                self.agent_mut(agent_id, timestamp).last_status = AgentStatus::Pending;
            }
            other => {
                self.agent_mut(other.agent_id(), timestamp);
            }
        }
    }

    /// Successful requests in `(now - 1s, now]`.
    pub fn recompute_throughput(&mut self, now: u64) {
        let horizon = now.saturating_sub(THROUGHPUT_WINDOW_MS);
        self.recent_successes.retain(|t| *t > horizon);
        self.current_tps = self.recent_successes.iter().filter(|t| **t <= now).count() as u64;
    }

    pub fn latency_summary(&self) -> LatencySummary {
        if self.latencies.is_empty() {
            return LatencySummary::default();
        }
        let mut sorted: Vec<u64> = self.latencies.iter().copied().collect();
        sorted.sort_unstable();
        let sum: u64 = sorted.iter().sum();

        LatencySummary {
            mean_ms: sum as f64 / sorted.len() as f64,
            p50_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
            window: sorted.len(),
        }
    }

    pub fn snapshot(&self) -> PoolMetrics {
        let success_rate = if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64 * 100.0
        };

        PoolMetrics {
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            mempool_conflicts: self.mempool_conflicts,
            other_failures: self.other_failures,
            success_rate,
            latency: self.latency_summary(),
            histogram: self.histogram.clone(),
            current_tps: self.current_tps,
            active_agents: self.agents.values().filter(|a| a.connected).count(),
            agents: self.agents.values().cloned().collect(),
            first_event_at: self.first_event_at,
            last_event_at: self.last_event_at,
        }
    }
}

#[derive(Debug)]
pub enum MetricsInput {
    Result(RequestResult),
    Event(LifecycleEvent),
    Flush(oneshot::Sender<()>),
}

/// Handle to the single task that owns aggregation. Producers send over a
/// channel; readers take a snapshot under a read lock.
#[derive(Clone)]
pub struct MetricsCollector {
    aggregator: Arc<RwLock<MetricsAggregator>>,
    sender: mpsc::UnboundedSender<MetricsInput>,
}

impl MetricsCollector {
    pub fn spawn(latency_window: usize) -> (Self, JoinHandle<()>) {
        let aggregator = Arc::new(RwLock::new(MetricsAggregator::new(latency_window)));
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_collector(aggregator.clone(), receiver));
        (Self { aggregator, sender }, handle)
    }

    pub fn record_result(&self, result: RequestResult) {
        if self.sender.send(MetricsInput::Result(result)).is_err() {
            tracing::debug!("Metrics collector stopped; dropping result");
        }
    }

    pub fn record_event(&self, event: LifecycleEvent) {
        if self.sender.send(MetricsInput::Event(event)).is_err() {
            tracing::debug!("Metrics collector stopped; dropping event");
        }
    }

    /// Records an `AgentRegistered` event and returns once it is applied.
    pub async fn register_agent(&self, agent_id: &str, address: Option<String>) {
        self.record_event(LifecycleEvent::AgentRegistered {
            timestamp: now_ms(),
            agent_id: agent_id.to_string(),
            address,
        });
        self.flush().await;
    }

    /// Resolves once everything sent before it has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(MetricsInput::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn snapshot(&self) -> PoolMetrics {
        self.aggregator.read().await.snapshot()
    }

    /// Feeds every event published on `bus` into this collector.
    pub fn follow(&self, bus: &EventBus) -> JoinHandle<()> {
        let mut events = bus.subscribe();
        let collector = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => collector.record_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Metrics fell behind the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

async fn run_collector(
    aggregator: Arc<RwLock<MetricsAggregator>>,
    mut receiver: mpsc::UnboundedReceiver<MetricsInput>,
) {
    let mut ticker = tokio::time::interval(RECOMPUTE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            input = receiver.recv() => {
                let Some(input) = input else { break };
                let mut aggregator = aggregator.write().await;
                match input {
                    MetricsInput::Result(result) => aggregator.record_result(&result),
                    MetricsInput::Event(event) => aggregator.record_event(&event),
                    MetricsInput::Flush(done) => {
                        aggregator.recompute_throughput(now_ms());
                        let _ = done.send(());
                    }
                }
            }
            _ = ticker.tick() => {
                aggregator.write().await.recompute_throughput(now_ms());
            }
        }
    }

    tracing::debug!("Metrics collector stopped");
}
