use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use log::Level;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::replication::PassConfig;

/// Runtime configuration for Bifrost.
///
/// Values are loaded from (in order): the `/etc/vanopticon/bifrost.json` file,
/// the user config folders (optional), an explicit file when one is given,
/// and environment variables prefixed with `BFR_` (e.g. `BFR_PORT`).
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(default)]
pub struct Settings {
	pub host: String,
	pub port: u16,
	pub log_level: Level,

	/// Datacenter this node belongs to.
	pub datacenter: String,
	/// Datacenter authoritative for ACLs. Equal to `datacenter` on the primary.
	pub primary_datacenter: String,
	/// HTTP address of a server in the primary datacenter.
	pub primary_url: Option<Url>,

	pub acls_enabled: bool,
	pub acl_legacy_mode: bool,
	/// Replicate global tokens in addition to policies and roles.
	pub acl_token_replication: bool,
	/// Credential presented to the primary by replication reads.
	pub replication_token: Option<String>,
	/// Secret of the management token bootstrapped on the primary.
	pub initial_management_token: Option<String>,
	/// How long a resolved caller token is trusted before it is resolved
	/// again, in seconds.
	pub acl_token_ttl_secs: u64,

	// Replication passes per second, burst, and local applies per second
	pub acl_replication_rate: f64,
	pub acl_replication_burst: usize,
	pub acl_replication_apply_limit: u32,
	pub federation_state_replication_rate: f64,
	pub federation_state_replication_burst: usize,
	pub federation_state_replication_apply_limit: u32,

	/// Pause after a failed replication pass, in seconds.
	pub replication_retry_secs: u64,
	pub max_batch_bytes: usize,
	pub delete_batch_size: usize,
	/// Longest a blocking list query is held open, in seconds.
	pub blocking_query_wait_secs: u64,

	pub token_reaping_rate: f64,
	pub token_reaping_burst: usize,

	/// Mesh gateways of this datacenter, as `node@address:port` or `address:port`.
	pub mesh_gateways: Vec<String>,
}

impl Default for Settings {
	fn default() -> Self {
		let host = hostname::get()
			.ok()
			.and_then(|s| s.into_string().ok())
			.unwrap_or_else(|| "127.0.0.1".to_string());

		Self {
			host,
			port: 8500,
			log_level: Level::Info,
			datacenter: "dc1".to_string(),
			primary_datacenter: "dc1".to_string(),
			primary_url: None,
			acls_enabled: true,
			acl_legacy_mode: false,
			acl_token_replication: false,
			replication_token: None,
			initial_management_token: None,
			acl_token_ttl_secs: 30,
			acl_replication_rate: 1.0,
			acl_replication_burst: 5,
			acl_replication_apply_limit: 100,
			federation_state_replication_rate: 1.0,
			federation_state_replication_burst: 5,
			federation_state_replication_apply_limit: 100,
			replication_retry_secs: 30,
			max_batch_bytes: 256 * 1024,
			delete_batch_size: 4096,
			blocking_query_wait_secs: 60,
			token_reaping_rate: 1.0,
			token_reaping_burst: 5,
			mesh_gateways: Vec::new(),
		}
	}
}

impl Settings {
	pub fn is_primary(&self) -> bool {
		self.datacenter == self.primary_datacenter
	}

	pub fn replication_retry(&self) -> Duration {
		Duration::from_secs(self.replication_retry_secs)
	}

	pub fn blocking_query_wait(&self) -> Duration {
		Duration::from_secs(self.blocking_query_wait_secs)
	}

	pub fn acl_token_ttl(&self) -> Duration {
		Duration::from_secs(self.acl_token_ttl_secs)
	}

	pub fn acl_pass_config(&self) -> PassConfig {
		PassConfig {
			max_batch_bytes: self.max_batch_bytes,
			delete_batch_size: self.delete_batch_size,
			apply_limit: self.acl_replication_apply_limit,
		}
	}

	pub fn federation_state_pass_config(&self) -> PassConfig {
		PassConfig {
			max_batch_bytes: self.max_batch_bytes,
			delete_batch_size: self.delete_batch_size,
			apply_limit: self.federation_state_replication_apply_limit,
		}
	}

	/// Check cross-field constraints the deserializer cannot express.
	pub fn validate(&self) -> Result<(), SettingsError> {
		if self.datacenter.is_empty() || self.primary_datacenter.is_empty() {
			return Err(SettingsError::Invalid(
				"datacenter and primary_datacenter must be set".into(),
			));
		}
		if !self.is_primary() && self.primary_url.is_none() {
			return Err(SettingsError::Invalid(format!(
				"datacenter {} is a secondary and needs primary_url",
				self.datacenter
			)));
		}
		for (name, rate) in [
			("acl_replication_rate", self.acl_replication_rate),
			("federation_state_replication_rate", self.federation_state_replication_rate),
			("token_reaping_rate", self.token_reaping_rate),
		] {
			if rate.is_nan() || rate <= 0.0 {
				return Err(SettingsError::Invalid(format!("{name} must be positive")));
			}
		}
		for (name, value) in [
			("acl_replication_burst", self.acl_replication_burst),
			("federation_state_replication_burst", self.federation_state_replication_burst),
			("token_reaping_burst", self.token_reaping_burst),
			("max_batch_bytes", self.max_batch_bytes),
			("delete_batch_size", self.delete_batch_size),
		] {
			if value == 0 {
				return Err(SettingsError::Invalid(format!("{name} must be at least 1")));
			}
		}
		Ok(())
	}
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),

	#[error("invalid configuration: {0}")]
	Invalid(String),
}

pub fn load() -> Result<Settings, SettingsError> {
	load_with(None)
}

/// Load settings, layering `extra` (when given) over the standard files.
pub fn load_with(extra: Option<&Path>) -> Result<Settings, SettingsError> {
	let mut builder = config::Config::builder()
		.add_source(config::File::with_name("/etc/vanopticon/bifrost.json").required(false));

	if let Some(folder) = dirs::config_dir() {
		let user_config_path = folder.join("vanopticon").join("bifrost.json");
		builder = builder.add_source(config::File::from(user_config_path).required(false));
	}
	if let Some(folder) = dirs::config_local_dir() {
		let local_config_path = folder.join("vanopticon").join("bifrost.json");
		builder = builder.add_source(config::File::from(local_config_path).required(false));
	}
	if let Some(path) = extra {
		builder = builder.add_source(config::File::from(path).required(true));
	}

	builder = builder.add_source(
		config::Environment::with_prefix("BFR")
			.separator("__")
			.try_parsing(true)
			.list_separator(",")
			.with_list_parse_key("mesh_gateways"),
	);

	let cfg = builder.build()?;
	let mut s: Settings = cfg.try_deserialize()?;
	apply_env_overrides(&mut s);
	Ok(s)
}

/// Parsed value of a non-empty environment variable.
fn env_value<T: FromStr>(key: &str) -> Option<T> {
	std::env::var(key)
		.ok()
		.filter(|v| !v.is_empty())
		.and_then(|v| v.parse().ok())
}

/// Explicitly prefer direct environment variables when present. Some
/// environments map variables in ways the `config` crate does not pick up.
fn apply_env_overrides(s: &mut Settings) {
	if let Some(v) = env_value("BFR_HOST") {
		s.host = v;
	}
	if let Some(v) = env_value("BFR_PORT") {
		s.port = v;
	}
	if let Some(v) = env_value("BFR_LOG_LEVEL") {
		s.log_level = v;
	}
	if let Some(v) = env_value("BFR_DATACENTER") {
		s.datacenter = v;
	}
	if let Some(v) = env_value("BFR_PRIMARY_DATACENTER") {
		s.primary_datacenter = v;
	}
	if let Some(v) = env_value::<Url>("BFR_PRIMARY_URL") {
		s.primary_url = Some(v);
	}
	if let Some(v) = env_value("BFR_ACLS_ENABLED") {
		s.acls_enabled = v;
	}
	if let Some(v) = env_value("BFR_ACL_TOKEN_REPLICATION") {
		s.acl_token_replication = v;
	}
	if let Some(v) = env_value::<String>("BFR_REPLICATION_TOKEN") {
		s.replication_token = Some(v);
	}
	if let Some(v) = env_value::<String>("BFR_INITIAL_MANAGEMENT_TOKEN") {
		s.initial_management_token = Some(v);
	}
	if let Some(v) = env_value("BFR_ACL_TOKEN_TTL_SECS") {
		s.acl_token_ttl_secs = v;
	}
	if let Some(v) = env_value("BFR_ACL_REPLICATION_RATE") {
		s.acl_replication_rate = v;
	}
	if let Some(v) = env_value("BFR_ACL_REPLICATION_BURST") {
		s.acl_replication_burst = v;
	}
	if let Some(v) = env_value("BFR_REPLICATION_RETRY_SECS") {
		s.replication_retry_secs = v;
	}
	if let Some(v) = env_value::<String>("BFR_MESH_GATEWAYS") {
		s.mesh_gateways = v
			.split(',')
			.map(str::trim)
			.filter(|g| !g.is_empty())
			.map(String::from)
			.collect();
	}
}
