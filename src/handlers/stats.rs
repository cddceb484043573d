use axum::{extract::State, Json};

use crate::{
    app::AppState,
    models::{DashboardMessage, PoolMetrics, SupportedResponse},
};

pub async fn get_stats(State(state): State<AppState>) -> Json<PoolMetrics> {
    Json(state.metrics.snapshot().await)
}

pub async fn get_events(State(state): State<AppState>) -> Json<DashboardMessage> {
    Json(DashboardMessage::History {
        events: state.events.history(),
    })
}

pub async fn get_supported(State(state): State<AppState>) -> Json<SupportedResponse> {
    Json(state.gate.facilitator().supported())
}
