use axum::{extract::Request, middleware::Next, response::Response};

use crate::models::AGENT_ID_HEADER;

pub const ANONYMOUS_AGENT: &str = "anonymous";

/// Caller-supplied correlation id, used only to attribute lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentId(pub String);

impl AgentId {
    fn from_request(request: &Request) -> Self {
        let id = request
            .headers()
            .get(AGENT_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(ANONYMOUS_AGENT);
        Self(id.to_string())
    }

    /// The id stored by `extract_agent_id`, or read from the header if that
    /// layer did not run.
    pub fn of(request: &Request) -> String {
        match request.extensions().get::<AgentId>() {
            Some(AgentId(id)) => id.clone(),
            None => Self::from_request(request).0,
        }
    }
}

pub async fn extract_agent_id(mut request: Request, next: Next) -> Response {
    let agent_id = AgentId::from_request(&request);
    tracing::debug!(agent_id = %agent_id.0, "Agent id extracted");
    request.extensions_mut().insert(agent_id);
    next.run(request).await
}
