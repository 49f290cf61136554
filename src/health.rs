use std::sync::atomic::Ordering;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde_json::json;

/// Health endpoint: returns 200 OK when the local state store answers a
/// read, otherwise 503 Service Unavailable. The body reports leadership.
pub async fn health(State(state): State<crate::state::AppState>) -> impl IntoResponse {
	match state.store.policy_list().await {
		Ok(listing) => (
			StatusCode::OK,
			Json(json!({
				"status": "ok",
				"datacenter": state.datacenter,
				"leader": state.is_leader.load(Ordering::SeqCst),
				"index": listing.index,
			})),
		)
			.into_response(),
		Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("store error: {}", e)).into_response(),
	}
}

/// Prometheus metrics endpoint: returns metrics in Prometheus text format
pub async fn metrics_handler(State(state): State<crate::state::AppState>) -> impl IntoResponse {
	let metrics_text = state.metrics.encode();
	(StatusCode::OK, metrics_text).into_response()
}
