use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use url::Url;

use super::{BatchRequest, BlockingQuery, PrimaryRpc, RpcError, TOKEN_HEADER, WriteResult};
use crate::replication::ReplicationStatus;
use crate::structs::{AclPolicy, AclPolicyStub, AclRole, AclToken, AclTokenStub, FederationState, Indexed};

/// Headroom on top of the blocking wait before a request is abandoned.
const REQUEST_SLACK: Duration = Duration::from_secs(30);

/// [`PrimaryRpc`] over HTTP against a node of the primary datacenter.
pub struct HttpPrimaryClient {
	client: Client,
	base: Url,
	token: Option<String>,
	wait: Duration,
}

impl HttpPrimaryClient {
	/// `wait` bounds how long the primary holds each blocking list query.
	pub fn new(base: Url, token: Option<String>, wait: Duration) -> Result<Self, RpcError> {
		let client = Client::builder().timeout(wait + REQUEST_SLACK).build()?;
		Ok(Self {
			client,
			base,
			token,
			wait,
		})
	}

	fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
		match &self.token {
			Some(token) => request.header(TOKEN_HEADER, token),
			None => request,
		}
	}

	async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RpcError> {
		let status = response.status();
		if !status.is_success() {
			let message = response.text().await.unwrap_or_default();
			return Err(RpcError::Status {
				status: status.as_u16(),
				message,
			});
		}
		Ok(response.json::<T>().await?)
	}

	async fn list<T: DeserializeOwned>(&self, path: &str, min_index: u64) -> Result<Indexed<T>, RpcError> {
		let url = self.base.join(path)?;
		debug!(target: "bifrost::rpc", "GET {} index={}", url, min_index);
		let query = BlockingQuery {
			index: min_index,
			wait: Some(self.wait.as_millis() as u64),
		};
		let response = self
			.authorize(self.client.get(url).query(&query))
			.send()
			.await?;
		Self::decode(response).await
	}

	async fn batch<T: DeserializeOwned>(&self, path: &str, ids: &[String]) -> Result<Indexed<T>, RpcError> {
		let url = self.base.join(path)?;
		debug!(target: "bifrost::rpc", "POST {} ({} ids)", url, ids.len());
		let body = BatchRequest { ids: ids.to_vec() };
		let response = self
			.authorize(self.client.post(url).json(&body))
			.send()
			.await?;
		Self::decode(response).await
	}

	/// Replication status reported by the node at `base`.
	pub async fn replication_status(&self) -> Result<ReplicationStatus, RpcError> {
		let url = self.base.join("/v1/acl/replication")?;
		let response = self.authorize(self.client.get(url)).send().await?;
		Self::decode(response).await
	}
}

#[async_trait]
impl PrimaryRpc for HttpPrimaryClient {
	async fn token_list(&self, min_index: u64) -> Result<Indexed<AclTokenStub>, RpcError> {
		self.list("/v1/acl/tokens", min_index).await
	}

	async fn token_batch_read(&self, accessor_ids: &[String]) -> Result<Indexed<AclToken>, RpcError> {
		self.batch("/v1/acl/tokens/batch", accessor_ids).await
	}

	async fn policy_list(&self, min_index: u64) -> Result<Indexed<AclPolicyStub>, RpcError> {
		self.list("/v1/acl/policies", min_index).await
	}

	async fn policy_batch_read(&self, ids: &[String]) -> Result<Indexed<AclPolicy>, RpcError> {
		self.batch("/v1/acl/policies/batch", ids).await
	}

	async fn role_list(&self, min_index: u64) -> Result<Indexed<AclRole>, RpcError> {
		self.list("/v1/acl/roles", min_index).await
	}

	async fn federation_state_list(&self, min_index: u64) -> Result<Indexed<FederationState>, RpcError> {
		self.list("/v1/federation-states", min_index).await
	}

	async fn federation_state_apply(&self, state: FederationState) -> Result<u64, RpcError> {
		let url = self.base.join("/v1/federation-states")?;
		debug!(target: "bifrost::rpc", "POST {} ({})", url, state.datacenter);
		let response = self
			.authorize(self.client.post(url).json(&state))
			.send()
			.await?;
		let written: WriteResult = Self::decode(response).await?;
		Ok(written.index)
	}
}
