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

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use crate::api::AddressFamily;

/// Virtual address node-port flows match on, one per family. Host rules
/// DNAT node-port traffic to this address before it enters the flow tables.
pub const VIRTUAL_NODE_PORT_DNAT_IPV4: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 252);
pub const VIRTUAL_NODE_PORT_DNAT_IPV6: Ipv6Addr =
    Ipv6Addr::new(0xfc01, 0, 0, 0, 0, 0xaabb, 0xccdd, 0xeefe);

pub fn virtual_node_port_dnat_ip(family: AddressFamily) -> IpAddr {
    match family {
        AddressFamily::V4 => IpAddr::V4(VIRTUAL_NODE_PORT_DNAT_IPV4),
        AddressFamily::V6 => IpAddr::V6(VIRTUAL_NODE_PORT_DNAT_IPV6),
    }
}

const DEFAULT_MIN_SYNC_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_SYNC_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_SYNC_BURST: u32 = 2;

/// Configuration of one single-family proxy instance.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProxyConfig {
    /// The name of the node this proxy runs on; backends whose node name
    /// matches are local.
    pub hostname: String,

    /// When set, only services labelled with this proxy name are served.
    /// When empty, only services without any proxy-name label are served.
    pub proxy_name: Option<String>,

    /// Node addresses on which node-accessible ports are bound.
    pub node_port_addresses: Vec<IpAddr>,

    pub address_family: AddressFamily,

    /// When false, only cluster IPs are installed; node ports and
    /// externally advertised addresses are left alone.
    pub proxy_all: bool,

    /// When false, load-balancer ingress IPs are skipped (node ports are
    /// still installed).
    pub proxy_load_balancer_ips: bool,

    /// Selects the endpoint event source: slices or the legacy listing.
    pub endpoint_slice_enabled: bool,

    /// Enables the nested-service marker on cluster-IP flows.
    pub support_nested_service: bool,

    /// Namespaced names ("ns/name") or cluster IPs that must never be
    /// touched. Protects control-plane services.
    pub skip_services: Vec<String>,

    pub min_sync_interval: Duration,
    pub max_sync_interval: Duration,
    pub sync_burst: u32,
}

impl ProxyConfig {
    pub fn new(hostname: impl Into<String>, address_family: AddressFamily) -> Self {
        Self {
            hostname: hostname.into(),
            proxy_name: None,
            node_port_addresses: Vec::new(),
            address_family,
            proxy_all: false,
            proxy_load_balancer_ips: true,
            endpoint_slice_enabled: true,
            support_nested_service: false,
            skip_services: Vec::new(),
            min_sync_interval: DEFAULT_MIN_SYNC_INTERVAL,
            max_sync_interval: DEFAULT_MAX_SYNC_INTERVAL,
            sync_burst: DEFAULT_SYNC_BURST,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.hostname.is_empty() {
            return Err(Error::MissingHostname);
        }
        if self.min_sync_interval.is_zero() {
            return Err(Error::InvalidInterval("min sync interval must be non-zero"));
        }
        if self.max_sync_interval < self.min_sync_interval {
            return Err(Error::InvalidInterval(
                "max sync interval must be at least the min interval",
            ));
        }
        if self.sync_burst == 0 {
            return Err(Error::InvalidInterval("sync burst must be at least one"));
        }
        for addr in &self.node_port_addresses {
            if !self.address_family.matches(addr) {
                return Err(Error::AddressFamilyMismatch(*addr));
            }
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("hostname is required for endpoint locality")]
    MissingHostname,
    #[error("{0}")]
    InvalidInterval(&'static str),
    #[error("node port address {0} does not match the configured address family")]
    AddressFamilyMismatch(IpAddr),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        let cfg = ProxyConfig::new("node-a", AddressFamily::V4);
        cfg.validate().unwrap();

        let mut cfg = ProxyConfig::new("", AddressFamily::V4);
        assert!(matches!(cfg.validate(), Err(Error::MissingHostname)));
        cfg.hostname = "node-a".to_string();

        cfg.node_port_addresses.push("2001::1".parse().unwrap());
        assert!(matches!(
            cfg.validate(),
            Err(Error::AddressFamilyMismatch(_))
        ));

        let mut cfg = ProxyConfig::new("node-a", AddressFamily::V4);
        cfg.max_sync_interval = Duration::from_millis(1);
        assert!(cfg.validate().is_err());
    }
}
