//! Leadership hooks: what a datacenter leader sets up when it gains
//! leadership and tears down when it loses it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::leader::{LeaderRoutineManager, Leadership};
use crate::observability::MetricsRegistry;
use crate::reaper::TokenReaper;
use crate::replication::acl::{PolicyAdapter, RoleAdapter, TokenAdapter};
use crate::replication::adapter::ReplicationSources;
use crate::replication::federation_state::FederationStateAdapter;
use crate::replication::{
	FederationStateAntiEntropy, PassConfig, ReplicationStatus, ReplicationType, Replicator,
	ReplicatorConfig, StatusTracker, TypeAdapter, TypeReplicator,
};
use crate::rpc::PrimaryRpc;
use crate::state::AppState;
use crate::store::{IdentityCache, IdentityCacheMap, RaftApply, StateStore};
use crate::structs::acl::{
	ANONYMOUS_TOKEN_ID, ANONYMOUS_TOKEN_SECRET, GLOBAL_MANAGEMENT_POLICY_ID,
	GLOBAL_MANAGEMENT_POLICY_NAME,
};
use crate::structs::{
	AclLink, AclPolicy, AclToken, FederationState, GatewayEndpoint, LogEntry,
	SERVER_MANAGEMENT_TOKEN_KEY,
};

const TARGET: &str = "bifrost::server";

const GLOBAL_MANAGEMENT_RULES: &str = r#"acl = "write"
agent_prefix "" { policy = "write" }
key_prefix "" { policy = "write" }
node_prefix "" { policy = "write" }
operator = "write"
service_prefix "" { policy = "write" }"#;

pub const LOCAL_REAPER_ROUTINE: &str = "acl-token-reaping-local";
pub const GLOBAL_REAPER_ROUTINE: &str = "acl-token-reaping-global";
pub const FEDERATION_STATE_ANTI_ENTROPY_ROUTINE: &str = "federation-state-anti-entropy";

/// External collaborators the server is built on.
#[derive(Clone)]
pub struct Collaborators {
	pub store: Arc<dyn StateStore>,
	pub raft: Arc<dyn RaftApply>,
	pub identities: Arc<IdentityCacheMap>,
	/// Read interface of the primary. Required in secondary datacenters.
	pub remote: Option<Arc<dyn PrimaryRpc>>,
}

/// Replicators owned by a secondary datacenter.
#[derive(Default)]
struct Replicators {
	policies: Option<Arc<Replicator>>,
	roles: Option<Arc<Replicator>>,
	tokens: Option<Arc<Replicator>>,
	federation_states: Option<Arc<Replicator>>,
}

impl Replicators {
	fn acl(&self) -> impl Iterator<Item = &Arc<Replicator>> {
		[&self.policies, &self.roles, &self.tokens]
			.into_iter()
			.flatten()
	}

	fn all(&self) -> impl Iterator<Item = &Arc<Replicator>> {
		self.acl().chain(self.federation_states.iter())
	}
}

pub struct Server {
	settings: Settings,
	collab: Collaborators,
	metrics: Arc<MetricsRegistry>,
	status: Arc<StatusTracker>,
	routines: LeaderRoutineManager,
	replicators: Replicators,
	/// Pushes this secondary's own federation state to the primary.
	anti_entropy: Option<Arc<FederationStateAntiEntropy>>,
	reaper: Arc<TokenReaper>,
	leadership: Mutex<Option<Leadership>>,
	is_leader: Arc<AtomicBool>,
}

impl Server {
	pub fn new(settings: Settings, collab: Collaborators, metrics: Arc<MetricsRegistry>) -> Result<Self> {
		let status = Arc::new(StatusTracker::new());
		let identities: Arc<dyn IdentityCache> = collab.identities.clone();
		let reaper = Arc::new(
			TokenReaper::new(collab.store.clone(), collab.raft.clone(), identities)
				.with_modes(settings.acls_enabled, settings.acl_legacy_mode)
				.with_metrics(metrics.clone()),
		);

		let (replicators, anti_entropy) = if settings.is_primary() {
			(Replicators::default(), None)
		} else {
			let remote = collab.remote.clone().ok_or_else(|| {
				anyhow!(
					"datacenter {} is a secondary but has no primary client",
					settings.datacenter
				)
			})?;
			let anti_entropy = FederationStateAntiEntropy::new(
				remote.clone(),
				settings.datacenter.clone(),
				parse_gateways(&settings.mesh_gateways),
			);
			let replicators = build_replicators(&settings, &collab, remote, &status, &metrics)?;
			(replicators, Some(Arc::new(anti_entropy)))
		};

		Ok(Self {
			settings,
			collab,
			metrics,
			status,
			routines: LeaderRoutineManager::new(),
			replicators,
			anti_entropy,
			reaper,
			leadership: Mutex::new(None),
			is_leader: Arc::new(AtomicBool::new(false)),
		})
	}

	/// State shared with the HTTP handlers.
	pub fn app_state(&self) -> AppState {
		AppState {
			datacenter: self.settings.datacenter.clone(),
			store: self.collab.store.clone(),
			raft: self
				.settings
				.is_primary()
				.then(|| self.collab.raft.clone()),
			identities: self.collab.identities.clone(),
			status: self.status.clone(),
			metrics: self.metrics.clone(),
			is_leader: self.is_leader.clone(),
			max_query_wait: self.settings.blocking_query_wait(),
		}
	}

	pub fn routines(&self) -> &LeaderRoutineManager {
		&self.routines
	}

	pub async fn replication_status(&self) -> ReplicationStatus {
		self.status.snapshot().await
	}

	pub fn is_leader(&self) -> bool {
		self.is_leader.load(Ordering::SeqCst)
	}

	/// Replicator for `kind`, when this node runs one.
	pub fn replicator(&self, kind: ReplicationType) -> Option<&Arc<Replicator>> {
		match kind {
			ReplicationType::Policies => self.replicators.policies.as_ref(),
			ReplicationType::Roles => self.replicators.roles.as_ref(),
			ReplicationType::Tokens => self.replicators.tokens.as_ref(),
			ReplicationType::FederationStates => self.replicators.federation_states.as_ref(),
		}
	}

	fn acls_active(&self) -> bool {
		self.settings.acls_enabled && !self.settings.acl_legacy_mode
	}

	/// Run the leader setup bound to `leadership`.
	pub async fn establish_leadership(&self, leadership: Leadership) -> Result<()> {
		self.collab.identities.purge().await;

		if self.acls_active() {
			if self.settings.is_primary() {
				self.bootstrap_acls().await?;
			} else {
				self.delete_redacted_tokens().await?;
				self.start_acl_replication(&leadership).await;
			}
			self.rotate_server_management_token().await?;
		}

		if self.settings.is_primary() {
			self.update_own_federation_state().await?;
		} else {
			if let Some(replicator) = &self.replicators.federation_states {
				replicator.start(&leadership);
			}
			self.start_federation_state_anti_entropy(&leadership);
		}

		if self.acls_active() {
			self.start_token_reapers(&leadership);
		}

		*self.leadership.lock().unwrap_or_else(PoisonError::into_inner) = Some(leadership);
		self.is_leader.store(true, Ordering::SeqCst);
		info!(target: TARGET, "established leadership in {}", self.settings.datacenter);
		Ok(())
	}

	/// Stop everything started by [`Server::establish_leadership`].
	pub async fn revoke_leadership(&self) {
		let leadership = self
			.leadership
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();
		if let Some(leadership) = leadership {
			leadership.revoke();
		}

		self.routines.stop_all();
		for replicator in self.replicators.all() {
			replicator.stop();
		}
		self.status.stop().await;
		self.is_leader.store(false, Ordering::SeqCst);
		info!(target: TARGET, "revoked leadership in {}", self.settings.datacenter);
	}

	async fn start_acl_replication(&self, leadership: &Leadership) {
		if self.settings.replication_token.is_none() {
			warn!(
				target: TARGET,
				"no replication token configured, ACL replication from {} is disabled",
				self.settings.primary_datacenter
			);
			return;
		}

		self.status
			.start(&self.settings.primary_datacenter, self.settings.acl_token_replication)
			.await;
		for replicator in self.replicators.acl() {
			replicator.start(leadership);
		}
	}

	fn start_federation_state_anti_entropy(&self, leadership: &Leadership) {
		let Some(anti_entropy) = self.anti_entropy.clone() else {
			return;
		};
		let rate = self.settings.federation_state_replication_rate;
		let burst = self.settings.federation_state_replication_burst;
		let retry = self.settings.replication_retry();
		self.routines.start(
			leadership,
			FEDERATION_STATE_ANTI_ENTROPY_ROUTINE,
			move |cancel| async move { anti_entropy.run(rate, burst, retry, cancel).await },
		);
	}

	fn start_token_reapers(&self, leadership: &Leadership) {
		let rate = self.settings.token_reaping_rate;
		let burst = self.settings.token_reaping_burst;

		let reaper = self.reaper.clone();
		self.routines.start(leadership, LOCAL_REAPER_ROUTINE, move |cancel| async move {
			reaper.run(true, rate, burst, cancel).await
		});

		if self.settings.is_primary() {
			let reaper = self.reaper.clone();
			self.routines.start(leadership, GLOBAL_REAPER_ROUTINE, move |cancel| async move {
				reaper.run(false, rate, burst, cancel).await
			});
		}
	}

	async fn bootstrap_acls(&self) -> Result<()> {
		let store = &self.collab.store;

		if store.policy_get(GLOBAL_MANAGEMENT_POLICY_ID).await?.is_none() {
			let mut policy = AclPolicy::new(GLOBAL_MANAGEMENT_POLICY_ID, GLOBAL_MANAGEMENT_POLICY_NAME);
			policy.description = "Builtin Policy that grants unlimited access".to_string();
			policy.rules = GLOBAL_MANAGEMENT_RULES.to_string();
			self.apply(LogEntry::AclPolicySet {
				policies: vec![policy],
			})
			.await
			.context("failed to create the global management policy")?;
			info!(target: TARGET, "created the global management policy");
		}

		let anonymous = store.token_batch_get(&[ANONYMOUS_TOKEN_ID.to_string()]).await?;
		if anonymous.items.is_empty() {
			let mut token = AclToken::new(ANONYMOUS_TOKEN_ID, ANONYMOUS_TOKEN_SECRET);
			token.description = "Anonymous Token".to_string();
			self.apply(LogEntry::AclTokenSet {
				tokens: vec![token],
				allow_missing_links: false,
				from_replication: false,
			})
			.await
			.context("failed to create the anonymous token")?;
			info!(target: TARGET, "created the anonymous token");
		}

		if let Some(secret) = &self.settings.initial_management_token {
			if store.token_get_by_secret(secret).await?.is_none() {
				let mut token = AclToken::new(Uuid::new_v4().to_string(), secret.clone());
				token.description = "Initial Management Token".to_string();
				token.policies = vec![global_management_link()];
				self.apply(LogEntry::AclTokenSet {
					tokens: vec![token],
					allow_missing_links: false,
					from_replication: false,
				})
				.await
				.context("failed to create the initial management token")?;
				info!(target: TARGET, "created the initial management token");
			}
		}
		Ok(())
	}

	/// Tokens carrying the redaction placeholder were written by an earlier
	/// replication with an unprivileged token and cannot authenticate anyone.
	async fn delete_redacted_tokens(&self) -> Result<()> {
		let listing = self.collab.store.token_list(true, true).await?;
		let redacted: Vec<String> = listing
			.items
			.iter()
			.filter(|token| token.is_redacted())
			.map(|token| token.accessor_id.clone())
			.collect();
		if redacted.is_empty() {
			return Ok(());
		}

		warn!(target: TARGET, "deleting {} tokens with redacted secrets", redacted.len());
		self.apply(LogEntry::AclTokenDelete { token_ids: redacted })
			.await
			.context("failed to delete tokens with redacted secrets")
	}

	async fn rotate_server_management_token(&self) -> Result<()> {
		let previous = self
			.collab
			.store
			.system_metadata_get(SERVER_MANAGEMENT_TOKEN_KEY)
			.await?;

		let accessor_id = Uuid::new_v4().to_string();
		let mut token = AclToken::new(accessor_id.clone(), Uuid::new_v4().to_string());
		token.description = "Server Management Token".to_string();
		token.local = true;
		token.policies = vec![global_management_link()];

		self.apply(LogEntry::AclTokenSet {
			tokens: vec![token],
			allow_missing_links: true,
			from_replication: false,
		})
		.await
		.context("failed to create the server management token")?;
		self.apply(LogEntry::SystemMetadataSet {
			key: SERVER_MANAGEMENT_TOKEN_KEY.to_string(),
			value: accessor_id.clone(),
		})
		.await
		.context("failed to record the server management token")?;

		if let Some(previous) = previous.filter(|old| *old != accessor_id) {
			self.apply(LogEntry::AclTokenDelete {
				token_ids: vec![previous],
			})
			.await
			.context("failed to delete the previous server management token")?;
		}
		debug!(target: TARGET, "rotated the server management token");
		Ok(())
	}

	async fn update_own_federation_state(&self) -> Result<()> {
		let gateways = parse_gateways(&self.settings.mesh_gateways);
		let state = FederationState::new(self.settings.datacenter.clone(), gateways);
		self.apply(LogEntry::FederationStateUpsert {
			states: vec![state],
		})
		.await
		.context("failed to update the primary's federation state")
	}

	async fn apply(&self, entry: LogEntry) -> Result<()> {
		let kind = entry.kind();
		let index = self.collab.raft.apply(entry).await?;
		debug!(target: TARGET, "applied {} at index {}", kind, index);
		Ok(())
	}
}

fn parse_gateways(raw: &[String]) -> Vec<GatewayEndpoint> {
	let mut gateways = Vec::with_capacity(raw.len());
	for entry in raw {
		match GatewayEndpoint::parse(entry) {
			Some(gateway) => gateways.push(gateway),
			None => warn!(target: TARGET, "ignoring malformed mesh gateway {:?}", entry),
		}
	}
	gateways
}

fn global_management_link() -> AclLink {
	AclLink {
		id: GLOBAL_MANAGEMENT_POLICY_ID.to_string(),
		name: GLOBAL_MANAGEMENT_POLICY_NAME.to_string(),
	}
}

fn build_replicators(
	settings: &Settings,
	collab: &Collaborators,
	remote: Arc<dyn PrimaryRpc>,
	status: &Arc<StatusTracker>,
	metrics: &Arc<MetricsRegistry>,
) -> Result<Replicators> {
	let sources = ReplicationSources {
		remote,
		store: collab.store.clone(),
		raft: collab.raft.clone(),
	};
	let acl_pass = settings.acl_pass_config();
	let acl_rate = (settings.acl_replication_rate, settings.acl_replication_burst);

	let mut replicators = Replicators::default();
	if settings.acls_enabled && !settings.acl_legacy_mode {
		replicators.policies = Some(replicator(
			settings,
			PolicyAdapter::new(sources.clone()),
			acl_pass,
			acl_rate,
			Some(status),
			metrics,
		)?);
		replicators.roles = Some(replicator(
			settings,
			RoleAdapter::new(sources.clone()),
			acl_pass,
			acl_rate,
			Some(status),
			metrics,
		)?);
		if settings.acl_token_replication {
			replicators.tokens = Some(replicator(
				settings,
				TokenAdapter::new(sources.clone()),
				acl_pass,
				acl_rate,
				Some(status),
				metrics,
			)?);
		}
	}

	replicators.federation_states = Some(replicator(
		settings,
		FederationStateAdapter::new(sources),
		settings.federation_state_pass_config(),
		(
			settings.federation_state_replication_rate,
			settings.federation_state_replication_burst,
		),
		None,
		metrics,
	)?);
	Ok(replicators)
}

fn replicator<A: TypeAdapter>(
	settings: &Settings,
	adapter: A,
	pass: PassConfig,
	(rate, burst): (f64, usize),
	status: Option<&Arc<StatusTracker>>,
	metrics: &Arc<MetricsRegistry>,
) -> Result<Arc<Replicator>> {
	let name = adapter.kind().name();
	let mut delegate = TypeReplicator::new(adapter, pass).with_metrics(metrics.clone());
	if let Some(status) = status {
		delegate = delegate.with_status(status.clone());
	}

	let mut config = ReplicatorConfig::new(name, Arc::new(delegate));
	config.rate = rate;
	config.burst = burst;
	config.retry_delay = settings.replication_retry();
	config.metrics = Some(metrics.clone());
	Ok(Arc::new(Replicator::new(config)?))
}
