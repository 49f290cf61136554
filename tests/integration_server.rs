mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakePrimary, apply, eventually};
use vanopticon_bifrost::config::Settings;
use vanopticon_bifrost::leader::Leadership;
use vanopticon_bifrost::observability::MetricsRegistry;
use vanopticon_bifrost::replication::ReplicationType;
use vanopticon_bifrost::rpc::PrimaryRpc;
use vanopticon_bifrost::server::{
	Collaborators, FEDERATION_STATE_ANTI_ENTROPY_ROUTINE, GLOBAL_REAPER_ROUTINE,
	LOCAL_REAPER_ROUTINE, Server,
};
use vanopticon_bifrost::store::{IdentityCacheMap, MemStore, StateStore, Table};
use vanopticon_bifrost::structs::acl::{ANONYMOUS_TOKEN_ID, GLOBAL_MANAGEMENT_POLICY_ID};
use vanopticon_bifrost::structs::{AclToken, LogEntry, REDACTED_SECRET, SERVER_MANAGEMENT_TOKEN_KEY};

fn primary_settings() -> Settings {
	Settings {
		datacenter: "dc1".into(),
		primary_datacenter: "dc1".into(),
		initial_management_token: Some("root-secret".into()),
		mesh_gateways: vec!["mgw@10.0.0.1:8443".into(), "not a gateway".into()],
		..Settings::default()
	}
}

fn secondary_settings() -> Settings {
	Settings {
		datacenter: "dc2".into(),
		primary_datacenter: "dc1".into(),
		acl_token_replication: true,
		replication_token: Some("root-secret".into()),
		acl_replication_rate: 100.0,
		federation_state_replication_rate: 100.0,
		replication_retry_secs: 1,
		..Settings::default()
	}
}

fn server(settings: Settings, store: &Arc<MemStore>, remote: Option<Arc<dyn PrimaryRpc>>) -> Server {
	let collab = Collaborators {
		store: store.clone(),
		raft: store.clone(),
		identities: Arc::new(IdentityCacheMap::new()),
		remote,
	};
	let metrics = Arc::new(MetricsRegistry::new().unwrap());
	Server::new(settings, collab, metrics).unwrap()
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_primary_leadership_bootstraps_acls() {
	let store = Arc::new(MemStore::new());
	let primary = server(primary_settings(), &store, None);

	primary.establish_leadership(Leadership::acquire()).await.unwrap();
	assert!(primary.is_leader());

	assert!(store.policy_get(GLOBAL_MANAGEMENT_POLICY_ID).await.unwrap().is_some());
	let anonymous = store
		.token_batch_get(&[ANONYMOUS_TOKEN_ID.to_string()])
		.await
		.unwrap();
	assert_eq!(anonymous.items.len(), 1);
	let root = store.token_get_by_secret("root-secret").await.unwrap().unwrap();
	assert_eq!(root.policies[0].id, GLOBAL_MANAGEMENT_POLICY_ID);
	assert!(!root.local);

	let states = store.federation_state_list().await.unwrap().items;
	assert_eq!(states.len(), 1);
	assert_eq!(states[0].datacenter, "dc1");
	assert_eq!(states[0].mesh_gateways.len(), 1);

	assert!(primary.routines().is_running(LOCAL_REAPER_ROUTINE));
	assert!(primary.routines().is_running(GLOBAL_REAPER_ROUTINE));
	assert!(!primary.routines().is_running(FEDERATION_STATE_ANTI_ENTROPY_ROUTINE));
	assert!(primary.replicator(ReplicationType::Policies).is_none());

	primary.revoke_leadership().await;
	assert!(!primary.is_leader());
	assert!(!primary.routines().is_running(LOCAL_REAPER_ROUTINE));
	assert!(!primary.routines().is_running(GLOBAL_REAPER_ROUTINE));
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_server_management_token_rotates_per_term() {
	let store = Arc::new(MemStore::new());
	let primary = server(primary_settings(), &store, None);

	primary.establish_leadership(Leadership::acquire()).await.unwrap();
	let first = store
		.system_metadata_get(SERVER_MANAGEMENT_TOKEN_KEY)
		.await
		.unwrap()
		.unwrap();
	primary.revoke_leadership().await;

	primary.establish_leadership(Leadership::acquire()).await.unwrap();
	let second = store
		.system_metadata_get(SERVER_MANAGEMENT_TOKEN_KEY)
		.await
		.unwrap()
		.unwrap();
	assert_ne!(first, second);

	let tokens = store.token_list(true, false).await.unwrap().items;
	let accessors: Vec<&str> = tokens.iter().map(|t| t.accessor_id.as_str()).collect();
	assert_eq!(accessors, [second.as_str()]);

	// Bootstrap is idempotent across terms.
	let policies = store.policy_list().await.unwrap().items;
	assert_eq!(policies.len(), 1);
	primary.revoke_leadership().await;
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_secondary_replicates_from_primary() {
	let primary_store = Arc::new(MemStore::new());
	let primary = server(primary_settings(), &primary_store, None);
	primary.establish_leadership(Leadership::acquire()).await.unwrap();

	let secondary_store = Arc::new(MemStore::new());
	// Left behind by an earlier unprivileged replication.
	apply(
		&secondary_store,
		LogEntry::AclTokenSet {
			tokens: vec![AclToken::new("stale", REDACTED_SECRET)],
			allow_missing_links: true,
			from_replication: false,
		},
	)
	.await;

	let remote: Arc<dyn PrimaryRpc> = Arc::new(FakePrimary::new(primary_store.clone()));
	let secondary = server(secondary_settings(), &secondary_store, Some(remote));
	secondary.establish_leadership(Leadership::acquire()).await.unwrap();

	assert!(
		secondary_store
			.token_batch_get(&["stale".to_string()])
			.await
			.unwrap()
			.items
			.is_empty()
	);
	for kind in [
		ReplicationType::Policies,
		ReplicationType::Roles,
		ReplicationType::Tokens,
		ReplicationType::FederationStates,
	] {
		assert!(secondary.replicator(kind).unwrap().is_running(), "{kind} not running");
	}
	assert!(secondary.routines().is_running(LOCAL_REAPER_ROUTINE));
	assert!(!secondary.routines().is_running(GLOBAL_REAPER_ROUTINE));

	let synced = eventually(Duration::from_secs(5), async || {
		let policy = secondary_store.policy_get(GLOBAL_MANAGEMENT_POLICY_ID).await.ok().flatten();
		let root = secondary_store.token_get_by_secret("root-secret").await.ok().flatten();
		let states = secondary_store
			.federation_state_list()
			.await
			.map(|l| l.items)
			.unwrap_or_default();
		// dc1 from the primary, and dc2 pushed by this secondary.
		policy.is_some() && root.is_some() && states.len() == 2
	})
	.await;
	assert!(synced, "secondary did not catch up with the primary");

	let status = secondary.replication_status().await;
	assert!(status.enabled && status.running);
	assert_eq!(status.source_datacenter, "dc1");
	assert_eq!(status.replication_type, "tokens");

	// The primary's own server management token is local and stays there.
	let primary_local = primary_store.token_list(true, false).await.unwrap().items;
	let replicated = secondary_store
		.token_batch_get(&[primary_local[0].accessor_id.clone()])
		.await
		.unwrap();
	assert!(replicated.items.is_empty());

	secondary.revoke_leadership().await;
	for kind in [ReplicationType::Policies, ReplicationType::FederationStates] {
		let replicator = secondary.replicator(kind).unwrap();
		replicator.wait_stopped().await;
		assert!(!replicator.is_running());
	}
	assert!(!secondary.replication_status().await.running);
	primary.revoke_leadership().await;
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_secondary_gateways_reach_the_primary() {
	let primary_store = Arc::new(MemStore::new());
	let primary = server(primary_settings(), &primary_store, None);
	primary.establish_leadership(Leadership::acquire()).await.unwrap();

	let settings = Settings {
		mesh_gateways: vec!["mgw-2@10.1.0.1:8443".into()],
		..secondary_settings()
	};
	let secondary_store = Arc::new(MemStore::new());
	let remote: Arc<dyn PrimaryRpc> = Arc::new(FakePrimary::new(primary_store.clone()));
	let secondary = server(settings, &secondary_store, Some(remote));
	secondary.establish_leadership(Leadership::acquire()).await.unwrap();
	assert!(
		secondary
			.routines()
			.is_running(FEDERATION_STATE_ANTI_ENTROPY_ROUTINE)
	);

	let pushed = eventually(Duration::from_secs(5), async || {
		let states = primary_store
			.federation_state_list()
			.await
			.map(|l| l.items)
			.unwrap_or_default();
		states.iter().any(|s| {
			s.datacenter == "dc2" && s.mesh_gateways.first().is_some_and(|g| g.node == "mgw-2")
		})
	})
	.await;
	assert!(pushed, "primary never learned the secondary's gateways");

	// The pushed state comes back through replication.
	let mirrored = eventually(Duration::from_secs(5), async || {
		secondary_store
			.federation_state_list()
			.await
			.map(|l| l.items.len() == 2)
			.unwrap_or(false)
	})
	.await;
	assert!(mirrored);

	// Once the primary holds the same gateways nothing more is written.
	let settled = primary_store.table_index(Table::FederationStates).await;
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(primary_store.table_index(Table::FederationStates).await, settled);

	secondary.revoke_leadership().await;
	assert!(
		!secondary
			.routines()
			.is_running(FEDERATION_STATE_ANTI_ENTROPY_ROUTINE)
	);
	primary.revoke_leadership().await;
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_secondary_without_replication_token_only_replicates_federation_states() {
	let primary_store = Arc::new(MemStore::new());
	let primary = server(primary_settings(), &primary_store, None);
	primary.establish_leadership(Leadership::acquire()).await.unwrap();

	let settings = Settings {
		replication_token: None,
		..secondary_settings()
	};
	let secondary_store = Arc::new(MemStore::new());
	let remote: Arc<dyn PrimaryRpc> = Arc::new(FakePrimary::new(primary_store.clone()));
	let secondary = server(settings, &secondary_store, Some(remote));
	secondary.establish_leadership(Leadership::acquire()).await.unwrap();

	assert!(!secondary.replicator(ReplicationType::Policies).unwrap().is_running());
	assert!(!secondary.replicator(ReplicationType::Tokens).unwrap().is_running());
	assert!(
		secondary
			.replicator(ReplicationType::FederationStates)
			.unwrap()
			.is_running()
	);
	assert!(!secondary.replication_status().await.enabled);

	secondary.revoke_leadership().await;
	primary.revoke_leadership().await;
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_secondary_requires_a_primary_client() {
	let store = Arc::new(MemStore::new());
	let collab = Collaborators {
		store: store.clone(),
		raft: store.clone(),
		identities: Arc::new(IdentityCacheMap::new()),
		remote: None,
	};
	let metrics = Arc::new(MetricsRegistry::new().unwrap());
	assert!(Server::new(secondary_settings(), collab, metrics).is_err());
}
