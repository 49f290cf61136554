use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use log::{debug, warn};

use super::{
	BatchRequest, BlockingQuery, PrimaryRpc, RpcError, StorePrimary, TOKEN_HEADER, WriteResult,
};
use crate::health;
use crate::replication::ReplicationStatus;
use crate::state::AppState;
use crate::store::CachedIdentity;
use crate::structs::acl::GLOBAL_MANAGEMENT_POLICY_ID;
use crate::structs::{AclPolicy, AclPolicyStub, AclRole, AclToken, AclTokenStub, FederationState, Indexed};

impl IntoResponse for RpcError {
	fn into_response(self) -> Response {
		let status = match &self {
			RpcError::Status { status, .. } => {
				StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
			}
			RpcError::Transport(_) | RpcError::Url(_) => StatusCode::BAD_GATEWAY,
			RpcError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
			RpcError::ReadOnly => StatusCode::METHOD_NOT_ALLOWED,
		};
		(status, self.to_string()).into_response()
	}
}

/// Routes served by every node. Secondaries serve them from their replicated
/// copy.
pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/v1/acl/tokens", get(token_list))
		.route("/v1/acl/tokens/batch", post(token_batch_read))
		.route("/v1/acl/policies", get(policy_list))
		.route("/v1/acl/policies/batch", post(policy_batch_read))
		.route("/v1/acl/roles", get(role_list))
		.route(
			"/v1/federation-states",
			get(federation_state_list).post(federation_state_apply),
		)
		.route("/v1/acl/replication", get(replication_status))
		.route("/health", get(health::health))
		.route("/metrics", get(health::metrics_handler))
		.with_state(state)
}

/// Whether the caller's token links the global management policy. Resolved
/// identities are cached by secret until they expire or the token changes.
async fn is_privileged(state: &AppState, headers: &HeaderMap) -> bool {
	let Some(secret) = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) else {
		return false;
	};
	if secret.is_empty() {
		return false;
	}
	if let Some(identity) = state.identities.get(secret).await {
		return identity.privileged;
	}

	match state.store.token_get_by_secret(secret).await {
		Ok(Some(token)) => {
			let privileged = token
				.policies
				.iter()
				.any(|link| link.id == GLOBAL_MANAGEMENT_POLICY_ID);
			state
				.identities
				.insert(
					secret,
					CachedIdentity {
						accessor_id: token.accessor_id,
						privileged,
						cached_at: Utc::now(),
					},
				)
				.await;
			privileged
		}
		Ok(None) => false,
		Err(e) => {
			warn!("failed to resolve caller token: {}", e);
			false
		}
	}
}

fn primary(state: &AppState, query: Option<&BlockingQuery>) -> StorePrimary {
	let wait = query
		.and_then(|q| q.wait)
		.filter(|ms| *ms > 0)
		.map(Duration::from_millis)
		.map_or(state.max_query_wait, |w| w.min(state.max_query_wait));
	let primary = StorePrimary::new(state.store.clone(), wait);
	match &state.raft {
		Some(raft) => primary.writable(raft.clone()),
		None => primary,
	}
}

async fn token_list(
	State(state): State<AppState>,
	Query(query): Query<BlockingQuery>,
) -> Result<Json<Indexed<AclTokenStub>>, RpcError> {
	let listing = primary(&state, Some(&query)).token_list(query.index).await?;
	Ok(Json(listing))
}

async fn token_batch_read(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(req): Json<BatchRequest>,
) -> Result<Json<Indexed<AclToken>>, RpcError> {
	let privileged = is_privileged(&state, &headers).await;
	if !privileged {
		debug!("redacting secrets for {} tokens", req.ids.len());
	}
	let listing = primary(&state, None)
		.redacting(!privileged)
		.token_batch_read(&req.ids)
		.await?;
	Ok(Json(listing))
}

async fn policy_list(
	State(state): State<AppState>,
	Query(query): Query<BlockingQuery>,
) -> Result<Json<Indexed<AclPolicyStub>>, RpcError> {
	let listing = primary(&state, Some(&query)).policy_list(query.index).await?;
	Ok(Json(listing))
}

async fn policy_batch_read(
	State(state): State<AppState>,
	Json(req): Json<BatchRequest>,
) -> Result<Json<Indexed<AclPolicy>>, RpcError> {
	let listing = primary(&state, None).policy_batch_read(&req.ids).await?;
	Ok(Json(listing))
}

async fn role_list(
	State(state): State<AppState>,
	Query(query): Query<BlockingQuery>,
) -> Result<Json<Indexed<AclRole>>, RpcError> {
	let listing = primary(&state, Some(&query)).role_list(query.index).await?;
	Ok(Json(listing))
}

async fn federation_state_list(
	State(state): State<AppState>,
	Query(query): Query<BlockingQuery>,
) -> Result<Json<Indexed<FederationState>>, RpcError> {
	let listing = primary(&state, Some(&query))
		.federation_state_list(query.index)
		.await?;
	Ok(Json(listing))
}

async fn federation_state_apply(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(federation_state): Json<FederationState>,
) -> Result<Json<WriteResult>, RpcError> {
	if !is_privileged(&state, &headers).await {
		warn!(
			"rejected federation state write for {}: permission denied",
			federation_state.datacenter
		);
		return Err(RpcError::Status {
			status: StatusCode::FORBIDDEN.as_u16(),
			message: "permission denied".to_string(),
		});
	}
	let index = primary(&state, None)
		.federation_state_apply(federation_state)
		.await?;
	Ok(Json(WriteResult { index }))
}

async fn replication_status(State(state): State<AppState>) -> Json<ReplicationStatus> {
	Json(state.status.snapshot().await)
}
