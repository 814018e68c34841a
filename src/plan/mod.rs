use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::api::topology::{Authority, Router};
use crate::api::MetricPermutation;
use crate::catalog::{MetricCatalog, MetricDescriptor};
use crate::tags::{TagSet, ROUTER_TAG};

/// Topology entity types metrics can apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Node,
    DeviceInterface,
    NetworkInterface,
    PeerPath,
    Service,
    Tenant,
    ServiceClass,
    ServiceRoute,
    ServiceGroup,
}

impl EntityKind {
    pub const ALL: [EntityKind; 9] = [
        EntityKind::Node,
        EntityKind::DeviceInterface,
        EntityKind::NetworkInterface,
        EntityKind::PeerPath,
        EntityKind::Service,
        EntityKind::Tenant,
        EntityKind::ServiceClass,
        EntityKind::ServiceRoute,
        EntityKind::ServiceGroup,
    ];

    /// Key used in metric applicability sets.
    pub fn applicability_key(self) -> &'static str {
        match self {
            EntityKind::Node => "node",
            EntityKind::DeviceInterface => "device-interface",
            EntityKind::NetworkInterface => "network-interface",
            EntityKind::PeerPath => "peer-path",
            EntityKind::Service => "service",
            EntityKind::Tenant => "tenant",
            EntityKind::ServiceClass => "service-class",
            EntityKind::ServiceRoute => "service-route",
            EntityKind::ServiceGroup => "service-group",
        }
    }

    /// Key used in filters and sink tags.
    pub fn tag_key(self) -> &'static str {
        match self {
            EntityKind::Node => "node",
            EntityKind::DeviceInterface => "device_interface",
            EntityKind::NetworkInterface => "network_interface",
            EntityKind::PeerPath => "peer_path",
            EntityKind::Service => "service",
            EntityKind::Tenant => "tenant",
            EntityKind::ServiceClass => "service_class",
            EntityKind::ServiceRoute => "service_route",
            EntityKind::ServiceGroup => "service_group",
        }
    }
}

/// One metric fetch against one topology entity of a router.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchTarget {
    pub metric: Arc<MetricDescriptor>,
    /// Upstream filter. Never carries the router, which is in the request path.
    pub filter: TagSet,
    /// Sink tags: the filter plus the router and node ancestry.
    pub tags: TagSet,
}

impl FetchTarget {
    /// Series id the target is written under.
    pub fn series(&self) -> &str {
        &self.metric.id
    }
}

pub fn device_interface_value(node: &str, id: u32) -> String {
    format!("{node}.{id}")
}

pub fn network_interface_value(node: &str, name: &str) -> String {
    format!("{node}.{name}")
}

pub fn peer_path_value(
    peer: &str,
    ip: &str,
    node: &str,
    device_interface: u32,
    vlan: u32,
) -> String {
    format!("{peer}/{ip}/{node}/{device_interface}/{vlan}")
}

/// Collects targets for one router, in topology order.
struct Planner<'a> {
    catalog: &'a MetricCatalog,
    router: &'a str,
    targets: Vec<FetchTarget>,
}

impl<'a> Planner<'a> {
    fn push(&mut self, kind: EntityKind, value: &str, node: Option<&str>) {
        let catalog = self.catalog;
        let mut metrics = catalog.applicable_to(kind.applicability_key()).peekable();
        if metrics.peek().is_none() {
            return;
        }

        let filter = TagSet::new().with(kind.tag_key(), value);
        let mut tags = filter.clone().with(ROUTER_TAG, self.router);
        if let Some(node) = node {
            tags.insert(EntityKind::Node.tag_key(), node);
        }

        for metric in metrics {
            self.targets.push(FetchTarget {
                metric: Arc::clone(metric),
                filter: filter.clone(),
                tags: tags.clone(),
            });
        }
    }

    fn wants(&self, kind: EntityKind) -> bool {
        self.catalog
            .applicable_to(kind.applicability_key())
            .next()
            .is_some()
    }
}

/// Derives every fetch target for a router from the topology snapshot.
///
/// Walks node, device interface, network interface and adjacency depth
/// first, then the authority-level services, tenants and service classes,
/// the router's service routes and finally the service groups.
pub fn plan_router(
    router: &Router,
    authority: &Authority,
    service_groups: &BTreeSet<String>,
    catalog: &MetricCatalog,
) -> Vec<FetchTarget> {
    let mut planner = Planner {
        catalog,
        router: &router.name,
        targets: Vec::new(),
    };

    let nested = planner.wants(EntityKind::DeviceInterface)
        || planner.wants(EntityKind::NetworkInterface)
        || planner.wants(EntityKind::PeerPath);

    for node in &router.nodes {
        let node_name = node.name.as_str();
        planner.push(EntityKind::Node, node_name, None);

        if !nested {
            continue;
        }

        for di in &node.device_interfaces {
            planner.push(
                EntityKind::DeviceInterface,
                &device_interface_value(node_name, di.id),
                Some(node_name),
            );

            for ni in &di.network_interfaces {
                planner.push(
                    EntityKind::NetworkInterface,
                    &network_interface_value(node_name, &ni.name),
                    Some(node_name),
                );

                for adjacency in &ni.adjacencies {
                    planner.push(
                        EntityKind::PeerPath,
                        &peer_path_value(
                            &adjacency.peer,
                            &adjacency.ip_address,
                            node_name,
                            di.id,
                            ni.vlan,
                        ),
                        Some(node_name),
                    );
                }
            }
        }
    }

    for service in &authority.services {
        planner.push(EntityKind::Service, &service.name, None);
    }
    for tenant in &authority.tenants {
        planner.push(EntityKind::Tenant, &tenant.name, None);
    }
    for class in &authority.service_classes {
        planner.push(EntityKind::ServiceClass, &class.name, None);
    }
    for route in &router.service_routes {
        planner.push(EntityKind::ServiceRoute, &route.name, None);
    }
    for group in service_groups {
        planner.push(EntityKind::ServiceGroup, group, None);
    }

    planner.targets
}

/// Derives fetch targets from the parameter permutations a router reports
/// for a metric. Duplicate permutations yield a single target.
pub fn plan_permutations(
    router: &str,
    metric: &Arc<MetricDescriptor>,
    permutations: &[MetricPermutation],
) -> Vec<FetchTarget> {
    let mut seen = HashSet::with_capacity(permutations.len());
    let mut targets = Vec::with_capacity(permutations.len());

    for permutation in permutations {
        let filter: TagSet = permutation
            .parameters
            .iter()
            .filter(|(k, _)| k.as_str() != ROUTER_TAG)
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        if !seen.insert(filter.clone()) {
            continue;
        }

        let tags = filter.clone().with(ROUTER_TAG, router);
        targets.push(FetchTarget {
            metric: Arc::clone(metric),
            filter,
            tags,
        });
    }

    targets
}
