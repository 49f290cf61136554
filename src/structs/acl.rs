use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::write_field;

/// Placeholder written over secrets when a token leaves its datacenter over
/// a channel that is not allowed to see them.
pub const REDACTED_SECRET: &str = "<hidden>";

/// Well-known ID of the builtin policy granting full access.
pub const GLOBAL_MANAGEMENT_POLICY_ID: &str = "00000000-0000-0000-0000-000000000001";
pub const GLOBAL_MANAGEMENT_POLICY_NAME: &str = "global-management";

/// Well-known accessor and secret of the anonymous token.
pub const ANONYMOUS_TOKEN_ID: &str = "00000000-0000-0000-0000-000000000002";
pub const ANONYMOUS_TOKEN_SECRET: &str = "anonymous";

/// A reference from a token or role to a policy or role by ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclLink {
	pub id: String,
	#[serde(default)]
	pub name: String,
}

impl AclLink {
	pub fn new(id: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			name: String::new(),
		}
	}
}

/// An ACL token. `accessor_id` is the stable identifier used for replication,
/// `secret_id` is the bearer credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclToken {
	pub accessor_id: String,
	pub secret_id: String,
	#[serde(default)]
	pub description: String,
	#[serde(default)]
	pub policies: Vec<AclLink>,
	#[serde(default)]
	pub roles: Vec<AclLink>,
	/// Local tokens never leave the datacenter that created them.
	#[serde(default)]
	pub local: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expiration_time: Option<DateTime<Utc>>,
	#[serde(default)]
	pub hash: Vec<u8>,
	#[serde(default)]
	pub create_index: u64,
	#[serde(default)]
	pub modify_index: u64,
}

impl AclToken {
	pub fn new(accessor_id: impl Into<String>, secret_id: impl Into<String>) -> Self {
		Self {
			accessor_id: accessor_id.into(),
			secret_id: secret_id.into(),
			description: String::new(),
			policies: Vec::new(),
			roles: Vec::new(),
			local: false,
			expiration_time: None,
			hash: Vec::new(),
			create_index: 0,
			modify_index: 0,
		}
	}

	/// Compute the content hash over every mutable, user-set field. IDs,
	/// indexes and the secret are excluded.
	pub fn set_hash(&mut self, force: bool) -> &[u8] {
		if force || self.hash.is_empty() {
			let mut hasher = Sha256::new();
			write_field(&mut hasher, self.description.as_bytes());
			write_field(&mut hasher, if self.local { b"local" } else { b"global" });
			for link in &self.policies {
				write_field(&mut hasher, link.id.as_bytes());
			}
			for link in &self.roles {
				write_field(&mut hasher, link.id.as_bytes());
			}
			if let Some(exp) = self.expiration_time {
				write_field(&mut hasher, exp.to_rfc3339().as_bytes());
			}
			self.hash = hasher.finalize().to_vec();
		}
		&self.hash
	}

	/// Rough in-memory size used to budget apply batches.
	pub fn estimate_size(&self) -> usize {
		// 16 (indexes) + 32 (hash) + 8 (expiration) + 1 (local)
		let mut size = 57 + self.accessor_id.len() + self.secret_id.len() + self.description.len();
		for link in self.policies.iter().chain(self.roles.iter()) {
			size += link.id.len() + link.name.len();
		}
		size
	}

	pub fn is_redacted(&self) -> bool {
		self.secret_id == REDACTED_SECRET
	}

	/// Copy of the token with the secret replaced by the redaction placeholder.
	pub fn redacted(&self) -> Self {
		let mut clone = self.clone();
		clone.secret_id = REDACTED_SECRET.to_string();
		clone
	}

	pub fn stub(&self) -> AclTokenStub {
		AclTokenStub {
			accessor_id: self.accessor_id.clone(),
			description: self.description.clone(),
			local: self.local,
			expiration_time: self.expiration_time,
			hash: self.hash.clone(),
			create_index: self.create_index,
			modify_index: self.modify_index,
		}
	}
}

/// Listing form of a token, without the secret or links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclTokenStub {
	pub accessor_id: String,
	#[serde(default)]
	pub description: String,
	#[serde(default)]
	pub local: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expiration_time: Option<DateTime<Utc>>,
	#[serde(default)]
	pub hash: Vec<u8>,
	#[serde(default)]
	pub create_index: u64,
	#[serde(default)]
	pub modify_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclPolicy {
	pub id: String,
	pub name: String,
	#[serde(default)]
	pub description: String,
	#[serde(default)]
	pub rules: String,
	/// Datacenters the policy is valid in; empty means all of them.
	#[serde(default)]
	pub datacenters: Vec<String>,
	#[serde(default)]
	pub hash: Vec<u8>,
	#[serde(default)]
	pub create_index: u64,
	#[serde(default)]
	pub modify_index: u64,
}

impl AclPolicy {
	pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			name: name.into(),
			description: String::new(),
			rules: String::new(),
			datacenters: Vec::new(),
			hash: Vec::new(),
			create_index: 0,
			modify_index: 0,
		}
	}

	pub fn set_hash(&mut self, force: bool) -> &[u8] {
		if force || self.hash.is_empty() {
			let mut hasher = Sha256::new();
			write_field(&mut hasher, self.name.as_bytes());
			write_field(&mut hasher, self.description.as_bytes());
			write_field(&mut hasher, self.rules.as_bytes());
			for dc in &self.datacenters {
				write_field(&mut hasher, dc.as_bytes());
			}
			self.hash = hasher.finalize().to_vec();
		}
		&self.hash
	}

	pub fn estimate_size(&self) -> usize {
		// 36 (uuid) + 16 (indexes) + 32 (hash)
		let mut size = 84 + self.name.len() + self.description.len() + self.rules.len();
		for dc in &self.datacenters {
			size += dc.len();
		}
		size
	}

	pub fn stub(&self) -> AclPolicyStub {
		AclPolicyStub {
			id: self.id.clone(),
			name: self.name.clone(),
			description: self.description.clone(),
			datacenters: self.datacenters.clone(),
			hash: self.hash.clone(),
			create_index: self.create_index,
			modify_index: self.modify_index,
		}
	}
}

/// Listing form of a policy, without the rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclPolicyStub {
	pub id: String,
	pub name: String,
	#[serde(default)]
	pub description: String,
	#[serde(default)]
	pub datacenters: Vec<String>,
	#[serde(default)]
	pub hash: Vec<u8>,
	#[serde(default)]
	pub create_index: u64,
	#[serde(default)]
	pub modify_index: u64,
}

/// A named bundle of policy links. Role listings carry full payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRole {
	pub id: String,
	pub name: String,
	#[serde(default)]
	pub description: String,
	#[serde(default)]
	pub policies: Vec<AclLink>,
	#[serde(default)]
	pub hash: Vec<u8>,
	#[serde(default)]
	pub create_index: u64,
	#[serde(default)]
	pub modify_index: u64,
}

impl AclRole {
	pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			name: name.into(),
			description: String::new(),
			policies: Vec::new(),
			hash: Vec::new(),
			create_index: 0,
			modify_index: 0,
		}
	}

	pub fn set_hash(&mut self, force: bool) -> &[u8] {
		if force || self.hash.is_empty() {
			let mut hasher = Sha256::new();
			write_field(&mut hasher, self.name.as_bytes());
			write_field(&mut hasher, self.description.as_bytes());
			for link in &self.policies {
				write_field(&mut hasher, link.id.as_bytes());
			}
			self.hash = hasher.finalize().to_vec();
		}
		&self.hash
	}

	pub fn estimate_size(&self) -> usize {
		// 36 (uuid) + 16 (indexes) + 32 (hash)
		let mut size = 84 + self.name.len() + self.description.len();
		for link in &self.policies {
			size += link.id.len() + link.name.len();
		}
		size
	}
}
