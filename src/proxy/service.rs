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

//! Tracks pending Service changes between sync rounds.
//!
//! Producers call [ServiceChangeTracker::on_service_update] from informer
//! threads; the reconciler drains the pending set with
//! [ServiceChangeTracker::update] under its own cadence. A change whose
//! current state equals its previous state cancels out and leaves no work.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::api::{
    AddressFamily, Service, ServiceType, SessionAffinity, TrafficPolicy, SERVICE_PROXY_NAME_LABEL,
};
use crate::proxy::types::{NamespacedName, ServiceInfo, ServiceMap, ServicePortName};

const DEFAULT_AFFINITY_TIMEOUT_SECONDS: u32 = 10800;

pub(crate) struct ServiceChangeTracker {
    family: AddressFamily,
    proxy_name: Option<String>,
    skip_services: Vec<String>,
    support_nested_service: bool,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<NamespacedName, ServiceChange>,
    synced: bool,
}

struct ServiceChange {
    previous: ServiceMap,
    current: ServiceMap,
}

impl ServiceChangeTracker {
    pub(crate) fn new(
        family: AddressFamily,
        proxy_name: Option<String>,
        skip_services: Vec<String>,
        support_nested_service: bool,
    ) -> Self {
        Self {
            family,
            proxy_name,
            skip_services,
            support_nested_service,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Absorb one Service event. Either side may be absent (create/delete).
    /// Returns true when work is pending afterwards.
    pub(crate) fn on_service_update(
        &self,
        previous: Option<&Service>,
        current: Option<&Service>,
    ) -> bool {
        let Some(name) = namespaced_name(previous, current) else {
            return !self.inner.lock().unwrap().pending.is_empty();
        };
        let current_map = current.map(|s| self.service_to_port_infos(s)).unwrap_or_default();
        let mut inner = self.inner.lock().unwrap();
        match inner.pending.entry(name.clone()) {
            std::collections::hash_map::Entry::Vacant(e) => {
                let previous_map = previous
                    .map(|s| self.service_to_port_infos(s))
                    .unwrap_or_default();
                e.insert(ServiceChange {
                    previous: previous_map,
                    current: current_map,
                });
            }
            std::collections::hash_map::Entry::Occupied(mut e) => {
                e.get_mut().current = current_map;
            }
        }
        if let Some(change) = inner.pending.get(&name) {
            if change.previous == change.current {
                debug!(service = %name, "service change cancelled out");
                inner.pending.remove(&name);
            }
        }
        !inner.pending.is_empty()
    }

    pub(crate) fn on_synced(&self) {
        self.inner.lock().unwrap().synced = true;
    }

    pub(crate) fn is_synced(&self) -> bool {
        self.inner.lock().unwrap().synced
    }

    /// Drain pending changes into the desired-state map. Returns the keys
    /// whose desired state actually changed.
    pub(crate) fn update(&self, service_map: &mut ServiceMap) -> HashSet<ServicePortName> {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.pending)
        };
        let mut changed = HashSet::new();
        for (_, change) in pending {
            for key in change.previous.keys() {
                if change.current.get(key) != change.previous.get(key) {
                    changed.insert(key.clone());
                }
                service_map.remove(key);
            }
            for (key, info) in change.current {
                if change.previous.get(&key) != Some(&info) {
                    changed.insert(key.clone());
                }
                service_map.insert(key, info);
            }
        }
        changed
    }

    /// Interpret one Service object into per-port records, applying the
    /// proxy-name, headless, skip-list and address-family policies. Objects
    /// filtered out produce an empty map and are thus invisible downstream.
    fn service_to_port_infos(&self, service: &Service) -> ServiceMap {
        let name = NamespacedName::new(&service.metadata.namespace, &service.metadata.name);
        if !self.proxy_name_matches(service) {
            return ServiceMap::default();
        }
        if service.is_headless() {
            debug!(service = %name, "ignoring headless service");
            return ServiceMap::default();
        }
        if self.skipped(&name, service) {
            debug!(service = %name, "ignoring service on the skip list");
            return ServiceMap::default();
        }
        let Some(cluster_ip) = self.cluster_ip_for_family(service) else {
            // The service simply has no leg in our family.
            return ServiceMap::default();
        };

        let affinity_timeout_seconds = match service.spec.session_affinity {
            SessionAffinity::None => 0,
            SessionAffinity::ClientIp => {
                let raw = service
                    .spec
                    .session_affinity_config
                    .as_ref()
                    .and_then(|c| c.client_ip.as_ref())
                    .and_then(|c| c.timeout_seconds)
                    .unwrap_or(DEFAULT_AFFINITY_TIMEOUT_SECONDS as i32);
                if raw < 0 {
                    warn!(service = %name, timeout = raw, "negative affinity timeout, disabling affinity");
                    0
                } else {
                    raw as u32
                }
            }
        };

        let external_ips = self.parse_family_ips(&name, &service.spec.external_ips);
        let load_balancer_ips = self.parse_family_ips(
            &name,
            &service
                .status
                .load_balancer
                .ingress
                .iter()
                .filter_map(|i| i.ip.clone())
                .collect::<Vec<_>>(),
        );

        let internal_policy_local =
            service.spec.internal_traffic_policy == Some(TrafficPolicy::Local);
        let external_policy_local = matches!(
            service.spec.service_type,
            ServiceType::NodePort | ServiceType::LoadBalancer
        ) && service.spec.external_traffic_policy == TrafficPolicy::Local;

        let mut infos = ServiceMap::default();
        for port in &service.spec.ports {
            let Ok(port_number) = u16::try_from(port.port) else {
                warn!(service = %name, port = port.port, "dropping port with out-of-range number");
                continue;
            };
            if port_number == 0 {
                warn!(service = %name, "dropping port with zero number");
                continue;
            }
            let node_port = u16::try_from(port.node_port).unwrap_or_else(|_| {
                warn!(service = %name, node_port = port.node_port, "ignoring out-of-range node port");
                0
            });
            let key = ServicePortName {
                name: name.clone(),
                port: port.name.clone(),
                protocol: port.protocol,
            };
            infos.insert(
                key,
                ServiceInfo {
                    cluster_ip,
                    port: port_number,
                    protocol: port.protocol,
                    service_type: service.spec.service_type,
                    node_port: match service.spec.service_type {
                        ServiceType::ClusterIp => 0,
                        _ => node_port,
                    },
                    external_ips: external_ips.clone(),
                    load_balancer_ips: load_balancer_ips.clone(),
                    internal_policy_local,
                    external_policy_local,
                    affinity_timeout_seconds,
                    is_nested: self.support_nested_service && service.is_nested(),
                },
            );
        }
        infos
    }

    fn proxy_name_matches(&self, service: &Service) -> bool {
        let label = service.metadata.labels.get(SERVICE_PROXY_NAME_LABEL);
        match (&self.proxy_name, label) {
            (Some(want), Some(have)) => want == have,
            (Some(_), None) => false,
            (None, Some(_)) => false,
            (None, None) => true,
        }
    }

    fn skipped(&self, name: &NamespacedName, service: &Service) -> bool {
        let name_str = name.to_string();
        self.skip_services.iter().any(|entry| {
            entry == &name_str
                || service.spec.cluster_ip.as_deref() == Some(entry.as_str())
                || service.spec.cluster_ips.iter().any(|ip| ip == entry)
        })
    }

    /// Pick the cluster IP assigned to our family, if any. Malformed
    /// addresses disqualify the whole object.
    fn cluster_ip_for_family(&self, service: &Service) -> Option<IpAddr> {
        let candidates: Vec<&String> = if service.spec.cluster_ips.is_empty() {
            service.spec.cluster_ip.iter().collect()
        } else {
            service.spec.cluster_ips.iter().collect()
        };
        for raw in candidates {
            match raw.parse::<IpAddr>() {
                Ok(ip) if self.family.matches(&ip) => return Some(ip),
                Ok(_) => continue,
                Err(_) => {
                    warn!(
                        service = %NamespacedName::new(&service.metadata.namespace, &service.metadata.name),
                        ip = %raw,
                        "dropping service with malformed cluster IP"
                    );
                    return None;
                }
            }
        }
        None
    }

    fn parse_family_ips(&self, name: &NamespacedName, raw: &[String]) -> Vec<IpAddr> {
        let mut out = Vec::new();
        for s in raw {
            match s.parse::<IpAddr>() {
                Ok(ip) if self.family.matches(&ip) => out.push(ip),
                Ok(_) => {}
                Err(_) => {
                    warn!(service = %name, ip = %s, "skipping malformed external address");
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }
}

fn namespaced_name(previous: Option<&Service>, current: Option<&Service>) -> Option<NamespacedName> {
    current
        .or(previous)
        .map(|s| NamespacedName::new(&s.metadata.namespace, &s.metadata.name))
}
