use serde::{Deserialize, Serialize};

/// Outcome of one simulated request, as reported by the agent that made it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResult {
    pub success: bool,
    pub agent_id: String,
    pub endpoint: String,
    pub latency_ms: u64,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
    pub last_seen: u64,
    pub last_status: AgentStatus,
    pub connected: bool,
}

impl AgentMetrics {
    pub fn new(agent_id: String, address: Option<String>, timestamp: u64) -> Self {
        Self {
            agent_id,
            address,
            requests: 0,
            successes: 0,
            failures: 0,
            total_latency_ms: 0,
            last_seen: timestamp,
            last_status: AgentStatus::Pending,
            connected: true,
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.requests as f64
        }
    }
}

/// Upper bounds (exclusive) of the latency histogram buckets; the last bucket is open.
pub const HISTOGRAM_EDGES_MS: [u64; 4] = [50, 100, 200, 500];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyHistogram {
    pub buckets: [u64; 5],
}

impl LatencyHistogram {
    pub const LABELS: [&'static str; 5] = ["0-50", "50-100", "100-200", "200-500", "500+"];

    pub fn bucket_for(latency_ms: u64) -> usize {
        HISTOGRAM_EDGES_MS
            .iter()
            .position(|edge| latency_ms < *edge)
            .unwrap_or(HISTOGRAM_EDGES_MS.len())
    }

    pub fn record(&mut self, latency_ms: u64) {
        self.buckets[Self::bucket_for(latency_ms)] += 1;
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub mean_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    /// How many samples the percentiles were computed over.
    pub window: usize,
}

/// Point-in-time view of the aggregator. Safe to serialize to the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub mempool_conflicts: u64,
    pub other_failures: u64,
    pub success_rate: f64,
    pub latency: LatencySummary,
    pub histogram: LatencyHistogram,
    pub current_tps: u64,
    pub active_agents: usize,
    pub agents: Vec<AgentMetrics>,
    pub first_event_at: Option<u64>,
    pub last_event_at: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_edges() {
        assert_eq!(LatencyHistogram::bucket_for(0), 0);
        assert_eq!(LatencyHistogram::bucket_for(49), 0);
        assert_eq!(LatencyHistogram::bucket_for(50), 1);
        assert_eq!(LatencyHistogram::bucket_for(199), 2);
        assert_eq!(LatencyHistogram::bucket_for(200), 3);
        assert_eq!(LatencyHistogram::bucket_for(500), 4);
        assert_eq!(LatencyHistogram::bucket_for(u64::MAX), 4);
    }
}
