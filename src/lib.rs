pub mod config;
pub mod health;
pub mod leader;
pub mod observability;
pub mod reaper;
pub mod replication;
pub mod rpc;
pub mod server;
pub mod state;
pub mod store;
pub mod structs;

use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};

use crate::leader::Leadership;
use crate::rpc::{HttpPrimaryClient, PrimaryRpc};
use crate::server::{Collaborators, Server};
use crate::store::{IdentityCacheMap, MemStore};

/// Run a single-node datacenter: the node holds leadership for as long as
/// it runs and serves the HTTP surface until interrupted.
pub async fn run(settings: config::Settings) -> anyhow::Result<()> {
	settings.validate()?;
	let observability = observability::init_observability(settings.log_level)?;

	let identities = Arc::new(IdentityCacheMap::with_ttl(settings.acl_token_ttl()));
	let store = Arc::new(MemStore::new().with_identity_cache(identities.clone()));
	let remote: Option<Arc<dyn PrimaryRpc>> = match (&settings.primary_url, settings.is_primary()) {
		(Some(url), false) => Some(Arc::new(HttpPrimaryClient::new(
			url.clone(),
			settings.replication_token.clone(),
			settings.blocking_query_wait(),
		)?)),
		_ => None,
	};
	let collab = Collaborators {
		store: store.clone(),
		raft: store,
		identities,
		remote,
	};

	let server = Server::new(settings.clone(), collab, observability.metrics)?;
	server
		.establish_leadership(Leadership::acquire())
		.await
		.context("failed to establish leadership")?;

	let addr = format!("{}:{}", settings.host, settings.port);
	let listener = tokio::net::TcpListener::bind(&addr)
		.await
		.with_context(|| format!("failed to bind {}", addr))?;
	info!(
		target: "bifrost",
		"serving datacenter {} on http://{} (primary: {})",
		settings.datacenter,
		addr,
		settings.primary_datacenter
	);

	let app = rpc::handlers::router(server.app_state());
	let served = axum::serve(listener, app)
		.with_graceful_shutdown(async {
			if let Err(e) = tokio::signal::ctrl_c().await {
				warn!(target: "bifrost", "failed to listen for shutdown signal: {}", e);
			}
		})
		.await;

	server.revoke_leadership().await;
	served.context("http server failed")
}
