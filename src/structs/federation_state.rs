use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::write_field;

/// One mesh gateway reachable from other datacenters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayEndpoint {
	pub node: String,
	pub address: String,
	pub port: u16,
}

impl GatewayEndpoint {
	/// Parse `node@address:port` or `address:port` (node defaults to the address).
	pub fn parse(raw: &str) -> Option<Self> {
		let (node, addr) = match raw.split_once('@') {
			Some((node, addr)) => (Some(node), addr),
			None => (None, raw),
		};
		let (address, port) = addr.rsplit_once(':')?;
		let port = port.parse().ok()?;
		if address.is_empty() {
			return None;
		}
		Some(Self {
			node: node.unwrap_or(address).to_string(),
			address: address.to_string(),
			port,
		})
	}
}

/// Mesh-federation metadata for a single datacenter, keyed by datacenter name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationState {
	pub datacenter: String,
	#[serde(default)]
	pub mesh_gateways: Vec<GatewayEndpoint>,
	pub updated_at: DateTime<Utc>,
	#[serde(default)]
	pub hash: Vec<u8>,
	#[serde(default)]
	pub create_index: u64,
	#[serde(default)]
	pub modify_index: u64,
}

impl FederationState {
	pub fn new(datacenter: impl Into<String>, mesh_gateways: Vec<GatewayEndpoint>) -> Self {
		Self {
			datacenter: datacenter.into(),
			mesh_gateways,
			updated_at: Utc::now(),
			hash: Vec::new(),
			create_index: 0,
			modify_index: 0,
		}
	}

	/// Hash of the mesh gateways. `updated_at` is left out so a datacenter
	/// re-announcing the same gateways produces the same hash.
	pub fn set_hash(&mut self, force: bool) -> &[u8] {
		if force || self.hash.is_empty() {
			let mut hasher = Sha256::new();
			for gw in &self.mesh_gateways {
				write_field(&mut hasher, gw.node.as_bytes());
				write_field(&mut hasher, gw.address.as_bytes());
				write_field(&mut hasher, &gw.port.to_be_bytes());
			}
			self.hash = hasher.finalize().to_vec();
		}
		&self.hash
	}

	pub fn estimate_size(&self) -> usize {
		// 16 (indexes) + 32 (hash) + 12 (timestamp)
		let mut size = 60 + self.datacenter.len();
		for gw in &self.mesh_gateways {
			size += gw.node.len() + gw.address.len() + 2;
		}
		size
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn parse_gateway_endpoints() {
		let gw = GatewayEndpoint::parse("mgw-1@10.0.0.5:8443").unwrap();
		assert_eq!(gw.node, "mgw-1");
		assert_eq!(gw.address, "10.0.0.5");
		assert_eq!(gw.port, 8443);

		let gw = GatewayEndpoint::parse("10.0.0.6:443").unwrap();
		assert_eq!(gw.node, "10.0.0.6");

		assert!(GatewayEndpoint::parse("no-port").is_none());
		assert!(GatewayEndpoint::parse(":443").is_none());
		assert!(GatewayEndpoint::parse("host:notaport").is_none());
	}

	#[test]
	fn hash_tracks_gateways() {
		let gw = GatewayEndpoint::parse("10.0.0.6:443").unwrap();
		let mut a = FederationState::new("dc2", vec![gw.clone()]);
		let mut b = a.clone();
		b.datacenter = "dc3".to_string();
		assert_eq!(a.set_hash(true).to_vec(), b.set_hash(true).to_vec());

		b.mesh_gateways.push(gw);
		assert_ne!(a.set_hash(true).to_vec(), b.set_hash(true).to_vec());
	}

	#[test]
	fn hash_fields_do_not_alias() {
		let gateway = |node: &str, address: &str| GatewayEndpoint {
			node: node.to_string(),
			address: address.to_string(),
			port: 443,
		};
		let mut a = FederationState::new("dc2", vec![gateway("ab", "c")]);
		let mut b = FederationState::new("dc2", vec![gateway("a", "bc")]);
		assert_ne!(a.set_hash(true).to_vec(), b.set_hash(true).to_vec());

		let mut later = a.clone();
		later.updated_at += chrono::Duration::seconds(60);
		assert_eq!(a.set_hash(true).to_vec(), later.set_hash(true).to_vec());
	}
}
