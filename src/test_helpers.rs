// Copyright FlowProxy Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Builders for inbound objects and a recording fake dataplane.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use crate::api::{
    AddressFamily, ClientIpConfig, EndpointAddress, EndpointConditions, EndpointSlice,
    EndpointSubset, Endpoints, LoadBalancerIngress, ObjectMeta, Protocol, Service, ServicePort,
    ServiceType, SessionAffinity, SessionAffinityConfig, SliceEndpoint, SlicePort, SubsetPort,
    TrafficPolicy, SLICE_SERVICE_NAME_LABEL,
};
use crate::config::ProxyConfig;
use crate::dataplane::{
    self, FlowClient, FlowProtocol, GroupId, RouteClient, ServiceFlow,
};
use crate::metrics::Metrics;
use crate::proxy::Proxier;

pub struct ServiceBuilder {
    service: Service,
}

impl ServiceBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            service: Service {
                metadata: ObjectMeta {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        }
    }

    pub fn cluster_ip(mut self, ip: &str) -> Self {
        self.service.spec.cluster_ip = Some(ip.to_string());
        self
    }

    pub fn cluster_ips(mut self, ips: &[&str]) -> Self {
        self.service.spec.cluster_ips = ips.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn service_type(mut self, t: ServiceType) -> Self {
        self.service.spec.service_type = t;
        self
    }

    pub fn port(self, name: &str, port: i32) -> Self {
        self.port_proto(name, port, Protocol::Tcp)
    }

    pub fn port_proto(mut self, name: &str, port: i32, protocol: Protocol) -> Self {
        self.service.spec.ports.push(ServicePort {
            name: name.to_string(),
            port,
            node_port: 0,
            protocol,
        });
        self
    }

    pub fn node_port(mut self, name: &str, port: i32, node_port: i32) -> Self {
        self.service.spec.ports.push(ServicePort {
            name: name.to_string(),
            port,
            node_port,
            protocol: Protocol::Tcp,
        });
        self
    }

    pub fn external_ip(mut self, ip: &str) -> Self {
        self.service.spec.external_ips.push(ip.to_string());
        self
    }

    pub fn load_balancer_ip(mut self, ip: &str) -> Self {
        self.service
            .status
            .load_balancer
            .ingress
            .push(LoadBalancerIngress {
                ip: Some(ip.to_string()),
            });
        self
    }

    pub fn session_affinity(mut self, timeout_seconds: i32) -> Self {
        self.service.spec.session_affinity = SessionAffinity::ClientIp;
        self.service.spec.session_affinity_config = Some(SessionAffinityConfig {
            client_ip: Some(ClientIpConfig {
                timeout_seconds: Some(timeout_seconds),
            }),
        });
        self
    }

    pub fn internal_traffic_policy(mut self, policy: TrafficPolicy) -> Self {
        self.service.spec.internal_traffic_policy = Some(policy);
        self
    }

    pub fn external_traffic_policy(mut self, policy: TrafficPolicy) -> Self {
        self.service.spec.external_traffic_policy = policy;
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.service
            .metadata
            .labels
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.service
            .metadata
            .annotations
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> Service {
        self.service
    }
}

pub fn cluster_ip_service(namespace: &str, name: &str, cluster_ip: &str, port: i32) -> Service {
    ServiceBuilder::new(namespace, name)
        .cluster_ip(cluster_ip)
        .port(&port.to_string(), port)
        .build()
}

pub fn node_port_service(
    namespace: &str,
    name: &str,
    cluster_ip: &str,
    port: i32,
    node_port: i32,
) -> Service {
    ServiceBuilder::new(namespace, name)
        .cluster_ip(cluster_ip)
        .service_type(ServiceType::NodePort)
        .node_port(&port.to_string(), port, node_port)
        .build()
}

pub fn load_balancer_service(
    namespace: &str,
    name: &str,
    cluster_ip: &str,
    ingress_ip: &str,
    port: i32,
    node_port: i32,
) -> Service {
    ServiceBuilder::new(namespace, name)
        .cluster_ip(cluster_ip)
        .service_type(ServiceType::LoadBalancer)
        .node_port(&port.to_string(), port, node_port)
        .load_balancer_ip(ingress_ip)
        .build()
}

#[derive(Clone)]
pub struct SliceEndpointSpec {
    pub ip: String,
    pub node_name: Option<String>,
    pub ready: Option<bool>,
    pub serving: Option<bool>,
    pub terminating: Option<bool>,
}

impl SliceEndpointSpec {
    pub fn remote(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            node_name: None,
            ready: Some(true),
            serving: Some(true),
            terminating: Some(false),
        }
    }

    pub fn local(ip: &str, node: &str) -> Self {
        Self {
            node_name: Some(node.to_string()),
            ..Self::remote(ip)
        }
    }
}

pub fn endpoint_slice(
    namespace: &str,
    service: &str,
    slice_name: &str,
    port_name: &str,
    port: i32,
    endpoints: &[SliceEndpointSpec],
) -> EndpointSlice {
    endpoint_slice_proto(namespace, service, slice_name, port_name, port, Protocol::Tcp, endpoints)
}

pub fn endpoint_slice_proto(
    namespace: &str,
    service: &str,
    slice_name: &str,
    port_name: &str,
    port: i32,
    protocol: Protocol,
    endpoints: &[SliceEndpointSpec],
) -> EndpointSlice {
    let address_type = if endpoints
        .first()
        .map(|e| e.ip.contains(':'))
        .unwrap_or(false)
    {
        AddressFamily::V6
    } else {
        AddressFamily::V4
    };
    EndpointSlice {
        metadata: ObjectMeta {
            name: slice_name.to_string(),
            namespace: namespace.to_string(),
            labels: HashMap::from([(
                SLICE_SERVICE_NAME_LABEL.to_string(),
                service.to_string(),
            )]),
            ..Default::default()
        },
        address_type,
        endpoints: endpoints
            .iter()
            .map(|spec| SliceEndpoint {
                addresses: vec![spec.ip.clone()],
                conditions: EndpointConditions {
                    ready: spec.ready,
                    serving: spec.serving,
                    terminating: spec.terminating,
                },
                node_name: spec.node_name.clone(),
                zone: None,
            })
            .collect(),
        ports: vec![SlicePort {
            name: Some(port_name.to_string()),
            port: Some(port),
            protocol: Some(protocol),
        }],
    }
}

pub fn endpoints_object(
    namespace: &str,
    name: &str,
    port_name: &str,
    port: i32,
    addresses: &[(&str, Option<&str>)],
) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        },
        subsets: vec![EndpointSubset {
            addresses: addresses
                .iter()
                .map(|(ip, node)| EndpointAddress {
                    ip: ip.to_string(),
                    node_name: node.map(str::to_string),
                })
                .collect(),
            ports: vec![SubsetPort {
                name: port_name.to_string(),
                port,
                protocol: Protocol::Tcp,
            }],
        }],
    }
}

/// Everything the proxy asked of the flow tables, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowOp {
    InstallEndpointFlows {
        protocol: FlowProtocol,
        endpoints: Vec<String>,
    },
    UninstallEndpointFlows {
        protocol: FlowProtocol,
        endpoints: Vec<String>,
    },
    InstallServiceGroup {
        group: GroupId,
        affinity: bool,
        endpoints: Vec<String>,
    },
    UninstallServiceGroup {
        group: GroupId,
    },
    InstallServiceFlows {
        group: GroupId,
        cluster_group: GroupId,
        ip: IpAddr,
        port: u16,
        protocol: FlowProtocol,
        affinity_timeout: u16,
        is_external: bool,
        is_nested: bool,
    },
    UninstallServiceFlows {
        ip: IpAddr,
        port: u16,
        protocol: FlowProtocol,
    },
    ServiceFlowKeysQuery {
        ip: IpAddr,
        port: u16,
    },
}

impl FlowOp {
    pub fn name(&self) -> &'static str {
        match self {
            FlowOp::InstallEndpointFlows { .. } => "InstallEndpointFlows",
            FlowOp::UninstallEndpointFlows { .. } => "UninstallEndpointFlows",
            FlowOp::InstallServiceGroup { .. } => "InstallServiceGroup",
            FlowOp::UninstallServiceGroup { .. } => "UninstallServiceGroup",
            FlowOp::InstallServiceFlows { .. } => "InstallServiceFlows",
            FlowOp::UninstallServiceFlows { .. } => "UninstallServiceFlows",
            FlowOp::ServiceFlowKeysQuery { .. } => "ServiceFlowKeysQuery",
        }
    }
}

/// Everything the proxy asked of the host network, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOp {
    AddNodePort { port: u16, protocol: FlowProtocol },
    DeleteNodePort { port: u16, protocol: FlowProtocol },
    AddExternalIpRoute(IpAddr),
    DeleteExternalIpRoute(IpAddr),
}

impl RouteOp {
    pub fn name(&self) -> &'static str {
        match self {
            RouteOp::AddNodePort { .. } => "AddNodePort",
            RouteOp::DeleteNodePort { .. } => "DeleteNodePort",
            RouteOp::AddExternalIpRoute(_) => "AddExternalIpRoute",
            RouteOp::DeleteExternalIpRoute(_) => "DeleteExternalIpRoute",
        }
    }
}

/// Fake dataplane that records every call and can inject failures.
#[derive(Default)]
pub struct RecordingDataplane {
    flow_ops: Mutex<Vec<FlowOp>>,
    route_ops: Mutex<Vec<RouteOp>>,
    failures: Mutex<HashMap<&'static str, usize>>,
}

impl RecordingDataplane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `times` calls of `op` fail with a transaction error.
    pub fn fail_next(&self, op: &'static str, times: usize) {
        self.failures.lock().unwrap().insert(op, times);
    }

    pub fn take_flow_ops(&self) -> Vec<FlowOp> {
        std::mem::take(&mut self.flow_ops.lock().unwrap())
    }

    pub fn take_route_ops(&self) -> Vec<RouteOp> {
        std::mem::take(&mut self.route_ops.lock().unwrap())
    }

    pub fn flow_op_count(&self, name: &str) -> usize {
        self.flow_ops
            .lock()
            .unwrap()
            .iter()
            .filter(|op| op.name() == name)
            .count()
    }

    pub fn route_op_count(&self, name: &str) -> usize {
        self.route_ops
            .lock()
            .unwrap()
            .iter()
            .filter(|op| op.name() == name)
            .count()
    }

    fn check(&self, op: &'static str) -> dataplane::Result {
        let mut failures = self.failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(dataplane::DataplaneError::Transaction(format!(
                    "injected failure for {op}"
                )));
            }
        }
        Ok(())
    }

    fn record_flow(&self, op: FlowOp) {
        self.flow_ops.lock().unwrap().push(op);
    }

    fn record_route(&self, op: RouteOp) {
        self.route_ops.lock().unwrap().push(op);
    }
}

fn keys(endpoints: &[crate::proxy::types::Endpoint]) -> Vec<String> {
    let mut keys: Vec<String> = endpoints.iter().map(|e| e.key()).collect();
    keys.sort();
    keys
}

impl FlowClient for RecordingDataplane {
    fn install_endpoint_flows(
        &self,
        protocol: FlowProtocol,
        endpoints: &[crate::proxy::types::Endpoint],
    ) -> dataplane::Result {
        self.check("InstallEndpointFlows")?;
        self.record_flow(FlowOp::InstallEndpointFlows {
            protocol,
            endpoints: keys(endpoints),
        });
        Ok(())
    }

    fn uninstall_endpoint_flows(
        &self,
        protocol: FlowProtocol,
        endpoints: &[crate::proxy::types::Endpoint],
    ) -> dataplane::Result {
        self.check("UninstallEndpointFlows")?;
        self.record_flow(FlowOp::UninstallEndpointFlows {
            protocol,
            endpoints: keys(endpoints),
        });
        Ok(())
    }

    fn install_service_group(
        &self,
        group: GroupId,
        affinity_enabled: bool,
        endpoints: &[crate::proxy::types::Endpoint],
    ) -> dataplane::Result {
        self.check("InstallServiceGroup")?;
        self.record_flow(FlowOp::InstallServiceGroup {
            group,
            affinity: affinity_enabled,
            endpoints: keys(endpoints),
        });
        Ok(())
    }

    fn uninstall_service_group(&self, group: GroupId) -> dataplane::Result {
        self.check("UninstallServiceGroup")?;
        self.record_flow(FlowOp::UninstallServiceGroup { group });
        Ok(())
    }

    fn install_service_flows(&self, flow: &ServiceFlow) -> dataplane::Result {
        self.check("InstallServiceFlows")?;
        self.record_flow(FlowOp::InstallServiceFlows {
            group: flow.group,
            cluster_group: flow.cluster_group,
            ip: flow.ip,
            port: flow.port,
            protocol: flow.protocol,
            affinity_timeout: flow.affinity_timeout,
            is_external: flow.is_external,
            is_nested: flow.is_nested,
        });
        Ok(())
    }

    fn uninstall_service_flows(
        &self,
        ip: IpAddr,
        port: u16,
        protocol: FlowProtocol,
    ) -> dataplane::Result {
        self.check("UninstallServiceFlows")?;
        self.record_flow(FlowOp::UninstallServiceFlows { ip, port, protocol });
        Ok(())
    }

    fn service_flow_keys(
        &self,
        ip: IpAddr,
        port: u16,
        protocol: FlowProtocol,
        groups: &[GroupId],
    ) -> Vec<String> {
        self.record_flow(FlowOp::ServiceFlowKeysQuery { ip, port });
        groups
            .iter()
            .map(|g| format!("{ip}:{port}/{protocol}#{g}"))
            .collect()
    }
}

impl RouteClient for RecordingDataplane {
    fn add_node_port(
        &self,
        _addresses: &[IpAddr],
        port: u16,
        protocol: FlowProtocol,
    ) -> dataplane::Result {
        self.check("AddNodePort")?;
        self.record_route(RouteOp::AddNodePort { port, protocol });
        Ok(())
    }

    fn delete_node_port(
        &self,
        _addresses: &[IpAddr],
        port: u16,
        protocol: FlowProtocol,
    ) -> dataplane::Result {
        self.check("DeleteNodePort")?;
        self.record_route(RouteOp::DeleteNodePort { port, protocol });
        Ok(())
    }

    fn add_external_ip_route(&self, ip: IpAddr) -> dataplane::Result {
        self.check("AddExternalIpRoute")?;
        self.record_route(RouteOp::AddExternalIpRoute(ip));
        Ok(())
    }

    fn delete_external_ip_route(&self, ip: IpAddr) -> dataplane::Result {
        self.check("DeleteExternalIpRoute")?;
        self.record_route(RouteOp::DeleteExternalIpRoute(ip));
        Ok(())
    }
}

/// A proxier wired to a fresh recording dataplane and private metrics.
pub fn new_test_proxier(config: ProxyConfig) -> (Arc<Proxier>, Arc<RecordingDataplane>) {
    let dataplane = RecordingDataplane::new();
    let metrics = Arc::new(Metrics::default());
    let proxier = Proxier::new(config, dataplane.clone(), dataplane.clone(), metrics)
        .expect("test config must validate");
    (Arc::new(proxier), dataplane)
}
