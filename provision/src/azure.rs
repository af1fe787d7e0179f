// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Azure Resource Manager compute binding for [`CloudApi`].

use async_trait::async_trait;
use serde::Deserialize;
use slog::{debug, o, Logger};

use crate::cloud::{CloudApi, CloudNode, NodeState};
use crate::config::{ConfigurationError, MachineTemplate, ProvisioningConfig};
use crate::driver::ProvisioningError;

pub const PROVIDER_ID: &str = "azure";

const API_VERSION: &str = "2023-03-01";
const NETWORK_API_VERSION: &str = "2023-05-01";

/// Thin client over the ARM virtual machine API. The endpoint is the
/// management host, the configured credential is a bearer token, and the
/// credentials' project is the `subscriptions/.../resourceGroups/...` scope
/// every resource lives under.
pub struct AzureApi {
    log: Logger,
    client: reqwest::Client,
    endpoint: String,
    scope: String,
    token: String,
}

impl AzureApi {
    pub fn new(log: &Logger, config: &ProvisioningConfig) -> Result<AzureApi, ConfigurationError> {
        let endpoint = config.endpoint()?.trim_end_matches('/').to_string();
        let credentials = config.api_credentials()?;
        let scope = credentials
            .project
            .as_ref()
            .ok_or_else(|| ConfigurationError::MissingCredentials {
                provider: PROVIDER_ID.to_string(),
            })?
            .trim_matches('/')
            .to_string();
        Ok(AzureApi {
            log: log.new(o!(
                "component" => "AzureApi",
                "identity" => credentials.identity.clone(),
            )),
            client: reqwest::Client::new(),
            endpoint,
            scope,
            token: credentials.credential.clone(),
        })
    }

    fn vm_url(&self, name: &str) -> String {
        format!(
            "{}/{}/providers/Microsoft.Compute/virtualMachines/{name}",
            self.endpoint, self.scope
        )
    }

    fn vms_url(&self) -> String {
        format!("{}/{}/providers/Microsoft.Compute/virtualMachines", self.endpoint, self.scope)
    }

    async fn checked(
        &self,
        request: reqwest::RequestBuilder,
        api_version: &str,
    ) -> Result<reqwest::Response, ProvisioningError> {
        let response = request
            .query(&[("api-version", api_version)])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ProvisioningError::Api(anyhow::Error::new(err)))?;
        response.error_for_status().map_err(|err| ProvisioningError::Api(anyhow::Error::new(err)))
    }

    async fn json<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ProvisioningError> {
        response.json().await.map_err(|err| ProvisioningError::Api(anyhow::Error::new(err)))
    }

    async fn fetch_vm(&self, name: &str) -> Result<VirtualMachine, ProvisioningError> {
        let response = self.checked(self.client.get(self.vm_url(name)), API_VERSION).await?;
        self.json(response).await
    }

    async fn list_vms(&self) -> Result<Vec<VirtualMachine>, ProvisioningError> {
        let response = self.checked(self.client.get(self.vms_url()), API_VERSION).await?;
        let list: VmList = self.json(response).await?;
        Ok(list.value)
    }

    /// Resolves the VM's primary NIC to its addresses. A VM without a NIC
    /// yet (still being created) simply has none.
    async fn vm_addresses(
        &self,
        vm: &VirtualMachine,
    ) -> Result<(Option<String>, Option<String>), ProvisioningError> {
        let Some(nic_id) = vm.primary_nic() else {
            return Ok((None, None));
        };
        let url = format!("{}{}", self.endpoint, nic_id);
        let response = self
            .checked(
                self.client.get(url).query(&[("$expand", "ipConfigurations/publicIPAddress")]),
                NETWORK_API_VERSION,
            )
            .await?;
        let nic: NetworkInterface = self.json(response).await?;
        Ok(nic.addresses())
    }

    async fn node_from_vm(&self, vm: VirtualMachine) -> Result<CloudNode, ProvisioningError> {
        let (public_ip, private_ip) = self.vm_addresses(&vm).await?;
        let state = vm.state();
        Ok(CloudNode {
            id: vm.name.clone(),
            name: vm.name,
            public_ip,
            private_ip,
            state,
            location: vm.location,
        })
    }
}

#[async_trait]
impl CloudApi for AzureApi {
    fn provider(&self) -> &str {
        PROVIDER_ID
    }

    async fn create_node(
        &self,
        name: &str,
        template: &MachineTemplate,
        location: Option<&str>,
    ) -> Result<CloudNode, ProvisioningError> {
        let body = serde_json::json!({
            "location": location,
            "properties": {
                "hardwareProfile": { "vmSize": template.flavor },
                "storageProfile": { "imageReference": { "id": template.image } },
                "osProfile": {
                    "computerName": name,
                    "adminUsername": template.username,
                    "adminPassword": template.password,
                },
            },
        });
        debug!(self.log, "creating virtual machine"; "name" => name);
        let response =
            self.checked(self.client.put(self.vm_url(name)).json(&body), API_VERSION).await?;
        let vm: VirtualMachine = self.json(response).await?;
        self.node_from_vm(vm).await
    }

    async fn node_state(&self, id: &str) -> Result<NodeState, ProvisioningError> {
        Ok(self.fetch_vm(id).await?.state())
    }

    async fn get_node(&self, id: &str) -> Result<CloudNode, ProvisioningError> {
        let vm = self.fetch_vm(id).await?;
        self.node_from_vm(vm).await
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<CloudNode>, ProvisioningError> {
        match self.list_vms().await?.into_iter().find(|vm| vm.name == name) {
            Some(vm) => Ok(Some(self.node_from_vm(vm).await?)),
            None => Ok(None),
        }
    }

    async fn find_by_ip(&self, ip: &str) -> Result<Option<CloudNode>, ProvisioningError> {
        for vm in self.list_vms().await? {
            let (public, private) = self.vm_addresses(&vm).await?;
            if public.as_deref() == Some(ip) || private.as_deref() == Some(ip) {
                return Ok(Some(self.node_from_vm(vm).await?));
            }
        }
        Ok(None)
    }

    async fn list_prefixed(&self, prefix: &str) -> Result<Vec<CloudNode>, ProvisioningError> {
        let mut nodes = Vec::new();
        for vm in self.list_vms().await? {
            if vm.name.starts_with(prefix) {
                nodes.push(self.node_from_vm(vm).await?);
            }
        }
        Ok(nodes)
    }

    async fn destroy_node(&self, id: &str) -> Result<(), ProvisioningError> {
        debug!(self.log, "deleting virtual machine"; "name" => id);
        self.checked(self.client.delete(self.vm_url(id)), API_VERSION).await?;
        Ok(())
    }
}

/// Maps ARM provisioning states onto the coarse lifecycle states. States
/// this binding has no mapping for are treated as still in flight.
fn map_state(state: &str) -> NodeState {
    match state {
        "Succeeded" => NodeState::Running,
        "Creating" | "Updating" | "Accepted" => NodeState::Pending,
        "Failed" | "Canceled" => NodeState::Error,
        "Deleting" | "Deleted" => NodeState::Terminated,
        _ => NodeState::Pending,
    }
}

#[derive(Debug, Deserialize)]
struct VmList {
    #[serde(default)]
    value: Vec<VirtualMachine>,
}

#[derive(Debug, Deserialize)]
struct VirtualMachine {
    name: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    properties: VmProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmProperties {
    #[serde(default)]
    provisioning_state: Option<String>,
    #[serde(default)]
    network_profile: Option<NetworkProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkProfile {
    #[serde(default)]
    network_interfaces: Vec<ResourceRef>,
}

#[derive(Debug, Deserialize)]
struct ResourceRef {
    id: String,
}

impl VirtualMachine {
    fn state(&self) -> NodeState {
        self.properties.provisioning_state.as_deref().map_or(NodeState::Pending, map_state)
    }

    fn primary_nic(&self) -> Option<&str> {
        self.properties
            .network_profile
            .as_ref()
            .and_then(|profile| profile.network_interfaces.first())
            .map(|nic| nic.id.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct NetworkInterface {
    #[serde(default)]
    properties: NicProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NicProperties {
    #[serde(default)]
    ip_configurations: Vec<IpConfiguration>,
}

#[derive(Debug, Deserialize)]
struct IpConfiguration {
    #[serde(default)]
    properties: IpConfigurationProperties,
}

#[derive(Debug, Default, Deserialize)]
struct IpConfigurationProperties {
    #[serde(rename = "privateIPAddress", default)]
    private_ip_address: Option<String>,
    #[serde(rename = "publicIPAddress", default)]
    public_ip_address: Option<PublicIpAddress>,
}

#[derive(Debug, Deserialize)]
struct PublicIpAddress {
    #[serde(default)]
    properties: PublicIpProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicIpProperties {
    #[serde(default)]
    ip_address: Option<String>,
}

impl NetworkInterface {
    fn addresses(&self) -> (Option<String>, Option<String>) {
        let Some(config) = self.ip_configurations().first() else {
            return (None, None);
        };
        let public = config
            .properties
            .public_ip_address
            .as_ref()
            .and_then(|p| p.properties.ip_address.clone());
        let private = config.properties.private_ip_address.clone();
        (public, private)
    }

    fn ip_configurations(&self) -> &[IpConfiguration] {
        &self.properties.ip_configurations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping() {
        assert_eq!(map_state("Succeeded"), NodeState::Running);
        assert_eq!(map_state("Creating"), NodeState::Pending);
        assert_eq!(map_state("Updating"), NodeState::Pending);
        assert_eq!(map_state("Failed"), NodeState::Error);
        assert_eq!(map_state("Deleting"), NodeState::Terminated);
        // Unmapped transitional states stay pending.
        assert_eq!(map_state("Migrating"), NodeState::Pending);
    }

    #[test]
    fn vm_record_parses() {
        let raw = r#"{
            "name": "flotilla-manager-1",
            "location": "eastus2",
            "properties": {
                "provisioningState": "Succeeded",
                "networkProfile": {
                    "networkInterfaces": [
                        { "id": "/subscriptions/s/resourceGroups/g/providers/Microsoft.Network/networkInterfaces/nic0" }
                    ]
                }
            }
        }"#;
        let vm: VirtualMachine = serde_json::from_str(raw).unwrap();
        assert_eq!(vm.state(), NodeState::Running);
        assert!(vm.primary_nic().unwrap().ends_with("/nic0"));
    }

    #[test]
    fn nic_record_yields_both_addresses() {
        let raw = r#"{
            "properties": {
                "ipConfigurations": [
                    {
                        "properties": {
                            "privateIPAddress": "10.0.0.4",
                            "publicIPAddress": {
                                "properties": { "ipAddress": "198.51.100.4" }
                            }
                        }
                    }
                ]
            }
        }"#;
        let nic: NetworkInterface = serde_json::from_str(raw).unwrap();
        assert_eq!(nic.addresses(), (Some("198.51.100.4".to_string()), Some("10.0.0.4".to_string())));
    }

    #[test]
    fn vm_without_a_nic_has_no_addresses() {
        let raw = r#"{ "name": "n", "properties": { "provisioningState": "Creating" } }"#;
        let vm: VirtualMachine = serde_json::from_str(raw).unwrap();
        assert_eq!(vm.state(), NodeState::Pending);
        assert!(vm.primary_nic().is_none());
    }
}
