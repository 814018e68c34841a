use std::collections::BTreeSet;

use serde::Deserialize;

/// Root of the running configuration returned by the conductor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub authority: Authority,
}

/// Authority-level configuration: routers and shared logical entities.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Authority {
    #[serde(default, rename = "router")]
    pub routers: Vec<Router>,
    #[serde(default, rename = "service")]
    pub services: Vec<Service>,
    #[serde(default, rename = "tenant")]
    pub tenants: Vec<Tenant>,
    #[serde(default, rename = "serviceClass")]
    pub service_classes: Vec<ServiceClass>,
}

impl Authority {
    /// Distinct, non-empty service group names across all services.
    pub fn service_groups(&self) -> BTreeSet<String> {
        self.services
            .iter()
            .filter(|s| !s.service_group.is_empty())
            .map(|s| s.service_group.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Router {
    pub name: String,
    /// ISO 6709 location string, e.g. `+40.7128-074.0060/`.
    #[serde(default)]
    pub location: String,
    #[serde(default, rename = "node")]
    pub nodes: Vec<Node>,
    #[serde(default, rename = "service_route", alias = "serviceRoute")]
    pub service_routes: Vec<ServiceRoute>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default, rename = "deviceInterface")]
    pub device_interfaces: Vec<DeviceInterface>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceInterface {
    pub id: u32,
    #[serde(default, rename = "networkInterface")]
    pub network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    #[serde(default)]
    pub vlan: u32,
    #[serde(default, rename = "adjacency")]
    pub adjacencies: Vec<Adjacency>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Adjacency {
    #[serde(default)]
    pub peer: String,
    #[serde(default, rename = "ipAddress")]
    pub ip_address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceRoute {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default, rename = "serviceGroup")]
    pub service_group: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Tenant {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceClass {
    pub name: String,
}
