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

//! The abstract model the reconciler works on: per-port service records and
//! per-backend endpoint records, keyed by [ServicePortName].

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use crate::api::{Protocol, ServiceType};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of one port of one Service. Stable across all maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct ServicePortName {
    pub name: NamespacedName,
    pub port: String,
    pub protocol: Protocol,
}

impl fmt::Display for ServicePortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.name, self.port, self.protocol)
    }
}

/// Desired state for one service port.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ServiceInfo {
    pub cluster_ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub service_type: ServiceType,
    /// Zero when the service has no node-accessible port.
    pub node_port: u16,
    pub external_ips: Vec<IpAddr>,
    pub load_balancer_ips: Vec<IpAddr>,
    pub internal_policy_local: bool,
    pub external_policy_local: bool,
    /// Raw timeout from the object; clamped to u16 at flow installation.
    pub affinity_timeout_seconds: u32,
    pub is_nested: bool,
}

impl ServiceInfo {
    /// True when stickiness is requested at all.
    pub fn affinity_enabled(&self) -> bool {
        self.affinity_timeout_seconds > 0
    }

    /// The timeout handed to the dataplane, truncated rather than wrapped.
    pub fn affinity_timeout(&self) -> u16 {
        self.affinity_timeout_seconds.min(u16::MAX as u32) as u16
    }

    /// Whether the flow identity (match fields) differs from `other`.
    pub fn identity_changed(&self, other: &ServiceInfo) -> bool {
        self.cluster_ip != other.cluster_ip
            || self.port != other.port
            || self.protocol != other.protocol
    }

    pub fn affinity_changed(&self, other: &ServiceInfo) -> bool {
        self.affinity_timeout_seconds != other.affinity_timeout_seconds
    }

    pub fn traffic_policies_changed(&self, other: &ServiceInfo) -> bool {
        self.internal_policy_local != other.internal_policy_local
            || self.external_policy_local != other.external_policy_local
    }
}

/// One backend of a service port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
    pub node_name: Option<String>,
    pub zone: Option<String>,
    /// True iff the backend runs on the node this proxy serves.
    pub is_local: bool,
    pub ready: bool,
    pub serving: bool,
    pub terminating: bool,
}

impl Endpoint {
    /// Key for deduplication and flow sharing across services.
    pub fn key(&self) -> String {
        match self.ip {
            IpAddr::V4(ip) => format!("{}:{}", ip, self.port),
            IpAddr::V6(ip) => format!("[{}]:{}", ip, self.port),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Desired service state, one record per known port.
pub type ServiceMap = HashMap<ServicePortName, ServiceInfo>;

/// Desired backends per port, deduplicated by [Endpoint::key].
pub type EndpointsMap = HashMap<ServicePortName, HashMap<String, Endpoint>>;
