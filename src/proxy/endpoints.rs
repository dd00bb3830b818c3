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

//! Tracks pending backend changes between sync rounds.
//!
//! Two event sources exist: whole "Endpoints" listings and sharded
//! "EndpointSlice" objects. In slice mode the tracker keeps a per-service
//! cache of live slices and recomputes the merged backend set on every slice
//! event, so stale shards fall out as soon as they are replaced or deleted.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::api::{AddressFamily, EndpointSlice, Endpoints};
use crate::proxy::types::{Endpoint, EndpointsMap, NamespacedName, ServicePortName};

pub(crate) struct EndpointsChangeTracker {
    hostname: String,
    family: AddressFamily,
    slice_mode: bool,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<NamespacedName, EndpointsChange>,
    /// service → slice name → that slice's contribution. Slice mode only.
    slices: HashMap<NamespacedName, HashMap<String, EndpointsMap>>,
    synced: bool,
}

struct EndpointsChange {
    previous: EndpointsMap,
    current: EndpointsMap,
}

impl EndpointsChangeTracker {
    pub(crate) fn new(hostname: String, family: AddressFamily, slice_mode: bool) -> Self {
        Self {
            hostname,
            family,
            slice_mode,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Absorb one legacy Endpoints event. Returns true when work is pending.
    pub(crate) fn on_endpoints_update(
        &self,
        previous: Option<&Endpoints>,
        current: Option<&Endpoints>,
    ) -> bool {
        if self.slice_mode {
            warn!("ignoring Endpoints event while running on slices");
            return !self.inner.lock().unwrap().pending.is_empty();
        }
        let Some(name) = current
            .or(previous)
            .map(|e| NamespacedName::new(&e.metadata.namespace, &e.metadata.name))
        else {
            return !self.inner.lock().unwrap().pending.is_empty();
        };
        let current_map = current
            .map(|e| self.endpoints_to_map(&name, e))
            .unwrap_or_default();
        let mut inner = self.inner.lock().unwrap();
        match inner.pending.entry(name.clone()) {
            std::collections::hash_map::Entry::Vacant(e) => {
                let previous_map = previous
                    .map(|p| self.endpoints_to_map(&name, p))
                    .unwrap_or_default();
                e.insert(EndpointsChange {
                    previous: previous_map,
                    current: current_map,
                });
            }
            std::collections::hash_map::Entry::Occupied(mut e) => {
                e.get_mut().current = current_map;
            }
        }
        Self::drop_if_cancelled(&mut inner, &name);
        !inner.pending.is_empty()
    }

    /// Absorb one EndpointSlice event. `removed` marks an explicit delete.
    pub(crate) fn on_endpoint_slice_update(&self, slice: &EndpointSlice, removed: bool) -> bool {
        if !self.slice_mode {
            warn!("ignoring EndpointSlice event while running on Endpoints");
            return !self.inner.lock().unwrap().pending.is_empty();
        }
        if slice.address_type != self.family {
            return !self.inner.lock().unwrap().pending.is_empty();
        }
        let Some(service_name) = slice.service_name() else {
            warn!(
                slice = %slice.metadata.name,
                namespace = %slice.metadata.namespace,
                "dropping endpoint slice without a service label"
            );
            return !self.inner.lock().unwrap().pending.is_empty();
        };
        let name = NamespacedName::new(&slice.metadata.namespace, service_name);
        let contribution = self.slice_to_map(&name, slice);

        let mut inner = self.inner.lock().unwrap();
        let before = Self::merged_slices(&inner, &name);
        let cache = inner.slices.entry(name.clone()).or_default();
        if removed {
            cache.remove(&slice.metadata.name);
        } else {
            cache.insert(slice.metadata.name.clone(), contribution);
        }
        if inner
            .slices
            .get(&name)
            .map(|c| c.is_empty())
            .unwrap_or(false)
        {
            inner.slices.remove(&name);
        }
        let after = Self::merged_slices(&inner, &name);

        match inner.pending.entry(name.clone()) {
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(EndpointsChange {
                    previous: before,
                    current: after,
                });
            }
            std::collections::hash_map::Entry::Occupied(mut e) => {
                e.get_mut().current = after;
            }
        }
        Self::drop_if_cancelled(&mut inner, &name);
        !inner.pending.is_empty()
    }

    pub(crate) fn on_synced(&self) {
        self.inner.lock().unwrap().synced = true;
    }

    pub(crate) fn is_synced(&self) -> bool {
        self.inner.lock().unwrap().synced
    }

    /// Drain pending changes into the desired-state map. Returns the keys
    /// whose backend set actually changed.
    pub(crate) fn update(&self, endpoints_map: &mut EndpointsMap) -> HashSet<ServicePortName> {
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
                endpoints_map.remove(key);
            }
            for (key, eps) in change.current {
                if change.previous.get(&key) != Some(&eps) {
                    changed.insert(key.clone());
                }
                endpoints_map.insert(key, eps);
            }
        }
        changed
    }

    fn drop_if_cancelled(inner: &mut Inner, name: &NamespacedName) {
        if let Some(change) = inner.pending.get(name) {
            if change.previous == change.current {
                debug!(service = %name, "endpoint change cancelled out");
                inner.pending.remove(name);
            }
        }
    }

    fn merged_slices(inner: &Inner, name: &NamespacedName) -> EndpointsMap {
        let mut merged = EndpointsMap::default();
        if let Some(cache) = inner.slices.get(name) {
            for contribution in cache.values() {
                for (key, eps) in contribution {
                    merged
                        .entry(key.clone())
                        .or_default()
                        .extend(eps.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }
        merged
    }

    fn slice_to_map(&self, name: &NamespacedName, slice: &EndpointSlice) -> EndpointsMap {
        let mut map = EndpointsMap::default();
        for port in &slice.ports {
            let Some(port_number) = port.port.and_then(|p| u16::try_from(p).ok()) else {
                continue;
            };
            if port_number == 0 {
                continue;
            }
            let key = ServicePortName {
                name: name.clone(),
                port: port.name.clone().unwrap_or_default(),
                protocol: port.protocol.unwrap_or_default(),
            };
            let entry = map.entry(key).or_default();
            for ep in &slice.endpoints {
                let ready = ep.conditions.ready.unwrap_or(true);
                let serving = ep.conditions.serving.unwrap_or(ready);
                let terminating = ep.conditions.terminating.unwrap_or(false);
                if !ready && !serving {
                    continue;
                }
                let Some(raw) = ep.addresses.first() else {
                    continue;
                };
                let ip: IpAddr = match raw.parse() {
                    Ok(ip) => ip,
                    Err(_) => {
                        warn!(service = %name, address = %raw, "skipping malformed endpoint address");
                        continue;
                    }
                };
                if !self.family.matches(&ip) {
                    continue;
                }
                let endpoint = Endpoint {
                    ip,
                    port: port_number,
                    node_name: ep.node_name.clone(),
                    zone: ep.zone.clone(),
                    is_local: ep.node_name.as_deref() == Some(self.hostname.as_str()),
                    ready,
                    serving,
                    terminating,
                };
                entry.insert(endpoint.key(), endpoint);
            }
        }
        map
    }

    fn endpoints_to_map(&self, name: &NamespacedName, endpoints: &Endpoints) -> EndpointsMap {
        let mut map = EndpointsMap::default();
        for subset in &endpoints.subsets {
            for port in &subset.ports {
                let Ok(port_number) = u16::try_from(port.port) else {
                    continue;
                };
                if port_number == 0 {
                    continue;
                }
                let key = ServicePortName {
                    name: name.clone(),
                    port: port.name.clone(),
                    protocol: port.protocol,
                };
                let entry = map.entry(key).or_default();
                for addr in &subset.addresses {
                    let ip: IpAddr = match addr.ip.parse() {
                        Ok(ip) => ip,
                        Err(_) => {
                            warn!(service = %name, address = %addr.ip, "skipping malformed endpoint address");
                            continue;
                        }
                    };
                    if !self.family.matches(&ip) {
                        continue;
                    }
                    // The legacy listing only carries ready backends and no
                    // serving/terminating conditions.
                    let endpoint = Endpoint {
                        ip,
                        port: port_number,
                        node_name: None,
                        zone: None,
                        is_local: addr.node_name.as_deref() == Some(self.hostname.as_str()),
                        ready: true,
                        serving: false,
                        terminating: false,
                    };
                    entry.insert(endpoint.key(), endpoint);
                }
            }
        }
        map
    }
}
