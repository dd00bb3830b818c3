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

//! Contracts towards the node dataplane: the programmable flow tables and
//! the host routing layer. The proxy only programs these interfaces; it
//! never forwards a packet itself.
//!
//! Calls may block for as long as the underlying transaction takes. The
//! implementations own their timeouts.

use std::fmt;
use std::net::IpAddr;

use crate::api::{AddressFamily, Protocol};
use crate::proxy::types::Endpoint;

/// Opaque identifier of a dataplane group selecting among backends.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport protocol as the flow tables encode it, with the address family
/// baked in: v4 and v6 flows live in separate pipelines.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub enum FlowProtocol {
    Tcp,
    Udp,
    Sctp,
    TcpV6,
    UdpV6,
    SctpV6,
}

impl FlowProtocol {
    pub fn new(protocol: Protocol, family: AddressFamily) -> Self {
        match (protocol, family) {
            (Protocol::Tcp, AddressFamily::V4) => FlowProtocol::Tcp,
            (Protocol::Udp, AddressFamily::V4) => FlowProtocol::Udp,
            (Protocol::Sctp, AddressFamily::V4) => FlowProtocol::Sctp,
            (Protocol::Tcp, AddressFamily::V6) => FlowProtocol::TcpV6,
            (Protocol::Udp, AddressFamily::V6) => FlowProtocol::UdpV6,
            (Protocol::Sctp, AddressFamily::V6) => FlowProtocol::SctpV6,
        }
    }
}

impl fmt::Display for FlowProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowProtocol::Tcp => "tcp",
            FlowProtocol::Udp => "udp",
            FlowProtocol::Sctp => "sctp",
            FlowProtocol::TcpV6 => "tcpv6",
            FlowProtocol::UdpV6 => "udpv6",
            FlowProtocol::SctpV6 => "sctpv6",
        };
        write!(f, "{s}")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DataplaneError {
    #[error("dataplane transaction failed: {0}")]
    Transaction(String),
    #[error("dataplane unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T = ()> = std::result::Result<T, DataplaneError>;

/// Parameters of one service flow. Bundled so installs and the diagnostic
/// queries speak the same vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFlow {
    pub group: GroupId,
    /// The non-local group external paths fall back to; zero for the
    /// cluster-IP flow.
    pub cluster_group: GroupId,
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: FlowProtocol,
    pub affinity_timeout: u16,
    pub is_external: bool,
    pub is_nested: bool,
}

/// Programs the flow tables.
pub trait FlowClient: Send + Sync {
    /// Install per-backend flows. Backends are shared between services; the
    /// caller guarantees each is installed once while referenced.
    fn install_endpoint_flows(&self, protocol: FlowProtocol, endpoints: &[Endpoint]) -> Result;

    fn uninstall_endpoint_flows(&self, protocol: FlowProtocol, endpoints: &[Endpoint]) -> Result;

    /// Install or replace the group selecting among `endpoints`. An empty
    /// member list is valid and keeps the virtual IP reachable.
    fn install_service_group(
        &self,
        group: GroupId,
        affinity_enabled: bool,
        endpoints: &[Endpoint],
    ) -> Result;

    fn uninstall_service_group(&self, group: GroupId) -> Result;

    fn install_service_flows(&self, flow: &ServiceFlow) -> Result;

    fn uninstall_service_flows(&self, ip: IpAddr, port: u16, protocol: FlowProtocol) -> Result;

    /// Returns the flow-table keys currently installed for one virtual
    /// address, for diagnostics.
    fn service_flow_keys(
        &self,
        ip: IpAddr,
        port: u16,
        protocol: FlowProtocol,
        groups: &[GroupId],
    ) -> Vec<String>;
}

/// Programs the host network: node-port bindings and routes for externally
/// advertised addresses.
pub trait RouteClient: Send + Sync {
    fn add_node_port(&self, addresses: &[IpAddr], port: u16, protocol: FlowProtocol) -> Result;

    fn delete_node_port(&self, addresses: &[IpAddr], port: u16, protocol: FlowProtocol) -> Result;

    fn add_external_ip_route(&self, ip: IpAddr) -> Result;

    fn delete_external_ip_route(&self, ip: IpAddr) -> Result;
}
