pub mod acl;
pub mod federation_state;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use acl::{
	AclLink, AclPolicy, AclPolicyStub, AclRole, AclToken, AclTokenStub, REDACTED_SECRET,
};
pub use federation_state::{FederationState, GatewayEndpoint};

/// System metadata key holding the accessor of the rotating server management token.
pub const SERVER_MANAGEMENT_TOKEN_KEY: &str = "server-management-token-accessor";

/// Feed one content-hash field to `hasher`, length-prefixed so adjacent
/// fields cannot alias each other.
pub(crate) fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
	hasher.update((bytes.len() as u64).to_be_bytes());
	hasher.update(bytes);
}

/// A listing tagged with the index it was observed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indexed<T> {
	pub index: u64,
	pub items: Vec<T>,
}

impl<T> Indexed<T> {
	pub fn new(index: u64, items: Vec<T>) -> Self {
		Self { index, items }
	}
}

/// Entries submitted to the consensus log. Each variant is applied atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
	AclTokenSet {
		tokens: Vec<AclToken>,
		/// Skip validation of policy and role links. Replication uses this
		/// because the resource types are not replicated in a coordinated order.
		#[serde(default)]
		allow_missing_links: bool,
		#[serde(default)]
		from_replication: bool,
	},
	AclTokenDelete {
		token_ids: Vec<String>,
	},
	AclPolicySet {
		policies: Vec<AclPolicy>,
	},
	AclPolicyDelete {
		policy_ids: Vec<String>,
	},
	AclRoleSet {
		roles: Vec<AclRole>,
		#[serde(default)]
		allow_missing_links: bool,
	},
	AclRoleDelete {
		role_ids: Vec<String>,
	},
	FederationStateUpsert {
		states: Vec<FederationState>,
	},
	FederationStateDelete {
		datacenters: Vec<String>,
	},
	SystemMetadataSet {
		key: String,
		value: String,
	},
}

impl LogEntry {
	pub fn kind(&self) -> &'static str {
		match self {
			LogEntry::AclTokenSet { .. } => "acl_token_set",
			LogEntry::AclTokenDelete { .. } => "acl_token_delete",
			LogEntry::AclPolicySet { .. } => "acl_policy_set",
			LogEntry::AclPolicyDelete { .. } => "acl_policy_delete",
			LogEntry::AclRoleSet { .. } => "acl_role_set",
			LogEntry::AclRoleDelete { .. } => "acl_role_delete",
			LogEntry::FederationStateUpsert { .. } => "federation_state_upsert",
			LogEntry::FederationStateDelete { .. } => "federation_state_delete",
			LogEntry::SystemMetadataSet { .. } => "system_metadata_set",
		}
	}
}
