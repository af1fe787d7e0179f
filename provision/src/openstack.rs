// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Nova-style compute binding for [`CloudApi`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use slog::{debug, o, Logger};

use crate::cloud::{CloudApi, CloudNode, NodeState};
use crate::config::{ConfigurationError, MachineTemplate, ProvisioningConfig};
use crate::driver::ProvisioningError;

pub const PROVIDER_ID: &str = "openstack";

const TOKEN_HEADER: &str = "X-Auth-Token";

/// Thin client over the Nova servers API. The endpoint is the
/// project-scoped compute URL and the configured credential is a
/// pre-issued token.
pub struct OpenStackApi {
    log: Logger,
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl OpenStackApi {
    pub fn new(log: &Logger, config: &ProvisioningConfig) -> Result<OpenStackApi, ConfigurationError> {
        let endpoint = config.endpoint()?.trim_end_matches('/').to_string();
        let credentials = config.api_credentials()?;
        Ok(OpenStackApi {
            log: log.new(o!(
                "component" => "OpenStackApi",
                "identity" => credentials.identity.clone(),
            )),
            client: reqwest::Client::new(),
            endpoint,
            token: credentials.credential.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    async fn checked(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ProvisioningError> {
        let response = request
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(|err| ProvisioningError::Api(anyhow::Error::new(err)))?;
        response.error_for_status().map_err(|err| ProvisioningError::Api(anyhow::Error::new(err)))
    }

    async fn fetch_server(&self, id: &str) -> Result<Server, ProvisioningError> {
        let response =
            self.checked(self.client.get(self.url(&format!("/servers/{id}")))).await?;
        let envelope: ServerEnvelope = response
            .json()
            .await
            .map_err(|err| ProvisioningError::Api(anyhow::Error::new(err)))?;
        Ok(envelope.server)
    }

    async fn list_detail(&self, query: &[(&str, &str)]) -> Result<Vec<Server>, ProvisioningError> {
        let response = self
            .checked(self.client.get(self.url("/servers/detail")).query(query))
            .await?;
        let list: ServerList = response
            .json()
            .await
            .map_err(|err| ProvisioningError::Api(anyhow::Error::new(err)))?;
        Ok(list.servers)
    }
}

#[async_trait]
impl CloudApi for OpenStackApi {
    fn provider(&self) -> &str {
        PROVIDER_ID
    }

    async fn create_node(
        &self,
        name: &str,
        template: &MachineTemplate,
        location: Option<&str>,
    ) -> Result<CloudNode, ProvisioningError> {
        let mut server = serde_json::json!({
            "name": name,
            "imageRef": template.image,
            "flavorRef": template.flavor,
        });
        if let Some(zone) = location {
            server["availability_zone"] = serde_json::json!(zone);
        }
        debug!(self.log, "creating server"; "name" => name);
        let response = self
            .checked(
                self.client
                    .post(self.url("/servers"))
                    .json(&serde_json::json!({ "server": server })),
            )
            .await?;
        let envelope: ServerEnvelope = response
            .json()
            .await
            .map_err(|err| ProvisioningError::Api(anyhow::Error::new(err)))?;
        // The create response is sparse: refetch for the full record.
        Ok(self.fetch_server(&envelope.server.id).await?.into_node())
    }

    async fn node_state(&self, id: &str) -> Result<NodeState, ProvisioningError> {
        Ok(self.fetch_server(id).await?.state())
    }

    async fn get_node(&self, id: &str) -> Result<CloudNode, ProvisioningError> {
        Ok(self.fetch_server(id).await?.into_node())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<CloudNode>, ProvisioningError> {
        let servers = self.list_detail(&[("name", name)]).await?;
        Ok(servers.into_iter().find(|s| s.name == name).map(Server::into_node))
    }

    async fn find_by_ip(&self, ip: &str) -> Result<Option<CloudNode>, ProvisioningError> {
        let servers = self.list_detail(&[]).await?;
        Ok(servers
            .into_iter()
            .find(|s| {
                let (public, private) = s.split_addresses();
                public.as_deref() == Some(ip) || private.as_deref() == Some(ip)
            })
            .map(Server::into_node))
    }

    async fn list_prefixed(&self, prefix: &str) -> Result<Vec<CloudNode>, ProvisioningError> {
        let servers = self.list_detail(&[]).await?;
        Ok(servers
            .into_iter()
            .filter(|s| s.name.starts_with(prefix))
            .map(Server::into_node)
            .collect())
    }

    async fn destroy_node(&self, id: &str) -> Result<(), ProvisioningError> {
        debug!(self.log, "deleting server"; "server_id" => id);
        self.checked(self.client.delete(self.url(&format!("/servers/{id}")))).await?;
        Ok(())
    }
}

/// Maps Nova's status vocabulary onto the coarse lifecycle states. Statuses
/// this binding has no mapping for are treated as still in flight.
fn map_status(status: &str) -> NodeState {
    match status {
        "ACTIVE" => NodeState::Running,
        "BUILD" | "REBUILD" => NodeState::Pending,
        "ERROR" => NodeState::Error,
        "DELETED" | "SHUTOFF" | "SOFT_DELETED" => NodeState::Terminated,
        _ => NodeState::Pending,
    }
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: Server,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    servers: Vec<Server>,
}

#[derive(Debug, Deserialize)]
struct Server {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    addresses: BTreeMap<String, Vec<ServerAddress>>,
    #[serde(rename = "OS-EXT-AZ:availability_zone", default)]
    availability_zone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServerAddress {
    addr: String,
    #[serde(rename = "OS-EXT-IPS:type", default)]
    kind: Option<String>,
}

impl Server {
    fn state(&self) -> NodeState {
        self.status.as_deref().map_or(NodeState::Pending, map_status)
    }

    /// Splits the per-network address lists into one floating (public) and
    /// one fixed (private) address. Untyped addresses count as fixed.
    fn split_addresses(&self) -> (Option<String>, Option<String>) {
        let mut public = None;
        let mut private = None;
        for address in self.addresses.values().flatten() {
            match address.kind.as_deref() {
                Some("floating") => public.get_or_insert_with(|| address.addr.clone()),
                _ => private.get_or_insert_with(|| address.addr.clone()),
            };
        }
        (public, private)
    }

    fn into_node(self) -> CloudNode {
        let state = self.state();
        let (public_ip, private_ip) = self.split_addresses();
        CloudNode {
            id: self.id,
            name: self.name,
            public_ip,
            private_ip,
            state,
            location: self.availability_zone,
        }
    }
}
