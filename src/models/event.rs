use serde::{Deserialize, Serialize};

use super::metrics::RequestResult;

/// Append-only record of something that happened in the payment lifecycle.
/// Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LifecycleEvent {
    PaymentSubmitted {
        timestamp: u64,
        agent_id: String,
        tx_hash: String,
        amount: String,
        endpoint: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    PaymentConfirmed {
        timestamp: u64,
        agent_id: String,
        tx_hash: String,
        amount: String,
        endpoint: String,
    },
    PaymentFailed {
        timestamp: u64,
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tx_hash: Option<String>,
        endpoint: String,
        error: String,
        latency_ms: u64,
    },
    RequestServed {
        timestamp: u64,
        agent_id: String,
        endpoint: String,
        latency_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tx_hash: Option<String>,
    },
    /// Funded and known to the pool, not yet running.
    AgentRegistered {
        timestamp: u64,
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    AgentConnected {
        timestamp: u64,
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    AgentDisconnected {
        timestamp: u64,
        agent_id: String,
    },
    Error {
        timestamp: u64,
        agent_id: String,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
}

impl LifecycleEvent {
    pub fn timestamp(&self) -> u64 {
        match self {
            Self::PaymentSubmitted { timestamp, .. }
            | Self::PaymentConfirmed { timestamp, .. }
            | Self::PaymentFailed { timestamp, .. }
            | Self::RequestServed { timestamp, .. }
            | Self::AgentRegistered { timestamp, .. }
            | Self::AgentConnected { timestamp, .. }
            | Self::AgentDisconnected { timestamp, .. }
            | Self::Error { timestamp, .. } => *timestamp,
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            Self::PaymentSubmitted { agent_id, .. }
            | Self::PaymentConfirmed { agent_id, .. }
            | Self::PaymentFailed { agent_id, .. }
            | Self::RequestServed { agent_id, .. }
            | Self::AgentRegistered { agent_id, .. }
            | Self::AgentConnected { agent_id, .. }
            | Self::AgentDisconnected { agent_id, .. }
            | Self::Error { agent_id, .. } => agent_id,
        }
    }

    /// Server-side view of a request outcome. Only terminal events map to a result.
    pub fn as_request_result(&self) -> Option<RequestResult> {
        match self {
            Self::RequestServed {
                timestamp,
                agent_id,
                endpoint,
                latency_ms,
                tx_hash,
            } => Some(RequestResult {
                success: true,
                agent_id: agent_id.clone(),
                endpoint: endpoint.clone(),
                latency_ms: *latency_ms,
                timestamp: *timestamp,
                error: None,
                tx_hash: tx_hash.clone(),
            }),
            Self::PaymentFailed {
                timestamp,
                agent_id,
                tx_hash,
                endpoint,
                error,
                latency_ms,
            } => Some(RequestResult {
                success: false,
                agent_id: agent_id.clone(),
                endpoint: endpoint.clone(),
                latency_ms: *latency_ms,
                timestamp: *timestamp,
                error: Some(error.clone()),
                tx_hash: tx_hash.clone(),
            }),
            _ => None,
        }
    }
}

/// Frames sent to dashboard subscribers. Live events are sent bare; this
/// wrapper only exists for the backlog sent on connect.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardMessage {
    History { events: Vec<LifecycleEvent> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = LifecycleEvent::RequestServed {
            timestamp: 1_700_000_000_000,
            agent_id: "agent-1".into(),
            endpoint: "/api/echo".into(),
            latency_ms: 42,
            tx_hash: None,
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "request_served");
        assert_eq!(json["agentId"], "agent-1");
        assert_eq!(json["latencyMs"], 42);
        assert!(json.get("txHash").is_none());
    }

    #[test]
    fn test_history_frame() {
        let frame = DashboardMessage::History {
            events: vec![LifecycleEvent::AgentDisconnected {
                timestamp: 1,
                agent_id: "a".into(),
            }],
        };
        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(json["type"], "history");
        assert_eq!(json["events"][0]["type"], "agent_disconnected");
    }

    #[test]
    fn test_only_terminal_events_become_results() {
        let failed = LifecycleEvent::PaymentFailed {
            timestamp: 5,
            agent_id: "a".into(),
            tx_hash: None,
            endpoint: "/api/hash".into(),
            error: "already_used".into(),
            latency_ms: 3,
        };
        let result = failed.as_request_result().unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("already_used"));

        let connected = LifecycleEvent::AgentConnected {
            timestamp: 5,
            agent_id: "a".into(),
            address: None,
        };
        assert!(connected.as_request_result().is_none());
    }
}
