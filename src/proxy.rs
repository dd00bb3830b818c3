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

//! The reconciliation engine.
//!
//! [Proxier] absorbs Service and Endpoint events through its change
//! trackers, and on each runner tick folds the pending diffs into the
//! desired-state maps, then walks every dirty service port and drives the
//! dataplane to match. Installed-state mirrors record what the dataplane
//! acknowledged, so a failed key is simply retried from its last good state.
//!
//! All dataplane calls happen on the reconcile thread; trackers serialize
//! producer threads behind their own locks.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use itertools::Itertools;
use tracing::{debug, error, info, warn};

use crate::api::{self, AddressFamily};
use crate::config::{self, ProxyConfig};
use crate::dataplane::{DataplaneError, FlowClient, FlowProtocol, GroupId, RouteClient, ServiceFlow};
use crate::metrics::Metrics;
use crate::proxy::endpoints::EndpointsChangeTracker;
use crate::proxy::group::{GroupCounter, GroupsExhausted};
use crate::proxy::routes::RouteRefCounter;
use crate::proxy::runner::{BoundedFrequencyRunner, RunnerHandle};
use crate::proxy::service::ServiceChangeTracker;
use crate::proxy::types::{Endpoint, EndpointsMap, ServiceInfo, ServiceMap, ServicePortName};
use crate::signal::Shutdown;

pub(crate) mod endpoints;
pub(crate) mod group;
pub(crate) mod routes;
pub mod runner;
pub(crate) mod service;
pub mod types;

/// Attempts beyond this no longer widen the retry backoff.
const MAX_BACKOFF_SHIFT: u32 = 10;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    GroupsExhausted(#[from] GroupsExhausted),
    #[error("proxy is already running")]
    AlreadyRunning,
}

/// Receives Service events from the informer.
pub trait ServiceEventHandler: Send + Sync {
    fn on_service_update(&self, previous: Option<&api::Service>, current: Option<&api::Service>);
    fn on_service_synced(&self);
}

/// Receives backend events from the informer, in either source shape.
pub trait EndpointsEventHandler: Send + Sync {
    fn on_endpoints_update(&self, previous: Option<&api::Endpoints>, current: Option<&api::Endpoints>);
    fn on_endpoint_slice_update(&self, slice: &api::EndpointSlice, removed: bool);
    fn on_endpoints_synced(&self);
}

enum KeyError {
    Dataplane(DataplaneError),
    Groups(GroupsExhausted),
}

impl From<DataplaneError> for KeyError {
    fn from(e: DataplaneError) -> Self {
        KeyError::Dataplane(e)
    }
}

impl From<GroupsExhausted> for KeyError {
    fn from(e: GroupsExhausted) -> Self {
        KeyError::Groups(e)
    }
}

struct Retry {
    attempts: u32,
    due: Instant,
}

/// Mutable reconcile state. Touched only under the sync lock, never across
/// a suspension point.
#[derive(Default)]
struct SyncState {
    service_map: ServiceMap,
    endpoints_map: EndpointsMap,
    service_installed_map: ServiceMap,
    endpoints_installed_map: EndpointsMap,
    /// Endpoint flows shared across services, keyed by (protocol, backend).
    endpoint_refs: HashMap<(FlowProtocol, String), usize>,
    route_refs: RouteRefCounter,
    retries: HashMap<ServicePortName, Retry>,
}

/// One single-family service proxy.
pub struct Proxier {
    config: ProxyConfig,
    flow_client: Arc<dyn FlowClient>,
    route_client: Arc<dyn RouteClient>,
    metrics: Arc<Metrics>,
    service_changes: ServiceChangeTracker,
    endpoints_changes: EndpointsChangeTracker,
    group_counter: GroupCounter,
    sync_handle: RunnerHandle,
    runner: Mutex<Option<BoundedFrequencyRunner>>,
    state: Mutex<SyncState>,
}

impl Proxier {
    pub fn new(
        config: ProxyConfig,
        flow_client: Arc<dyn FlowClient>,
        route_client: Arc<dyn RouteClient>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let service_changes = ServiceChangeTracker::new(
            config.address_family,
            config.proxy_name.clone(),
            config.skip_services.clone(),
            config.support_nested_service,
        );
        let endpoints_changes = EndpointsChangeTracker::new(
            config.hostname.clone(),
            config.address_family,
            config.endpoint_slice_enabled,
        );
        let runner = BoundedFrequencyRunner::new(
            format!("proxy-{}", config.address_family),
            config.min_sync_interval,
            config.max_sync_interval,
            config.sync_burst,
        );
        let sync_handle = runner.handle();
        Ok(Self {
            config,
            flow_client,
            route_client,
            metrics,
            service_changes,
            endpoints_changes,
            group_counter: GroupCounter::new(),
            sync_handle,
            runner: Mutex::new(Some(runner)),
            state: Mutex::new(SyncState::default()),
        })
    }

    pub fn address_family(&self) -> AddressFamily {
        self.config.address_family
    }

    fn initialized(&self) -> bool {
        self.service_changes.is_synced() && self.endpoints_changes.is_synced()
    }

    /// Run the sync loop until shutdown. In-flight reconciles complete;
    /// pending events are dropped with the process.
    pub async fn run(self: &Arc<Self>, shutdown: Shutdown) -> Result<(), Error> {
        let runner = self
            .runner
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::AlreadyRunning)?;
        info!(family = %self.config.address_family, node = %self.config.hostname, "starting service proxy");
        let fatal: Arc<Mutex<Option<GroupsExhausted>>> = Arc::new(Mutex::new(None));
        let this = Arc::clone(self);
        let handle = self.sync_handle.clone();
        let fatal_slot = Arc::clone(&fatal);
        self.sync_handle.run();
        runner
            .run(shutdown, move || match this.sync_once() {
                Ok(Some(retry_in)) => {
                    let h = handle.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(retry_in).await;
                        h.run();
                    });
                    true
                }
                Ok(None) => true,
                Err(e) => {
                    error!(error = %e, "giving up: group allocation failed");
                    *fatal_slot.lock().unwrap() = Some(e);
                    false
                }
            })
            .await;
        let result = fatal.lock().unwrap().take();
        match result {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Force one reconcile outside the runner cadence. Also the testing
    /// entry point.
    pub fn sync_proxy_rules(&self) {
        if let Err(e) = self.sync_once() {
            error!(error = %e, "sync failed");
        }
    }

    /// Returns the dataplane flow keys and group IDs installed for one
    /// service. `found` is false both for unknown services and for known
    /// ones that are not installed yet.
    pub fn get_service_flow_keys(
        &self,
        name: &str,
        namespace: &str,
    ) -> (Vec<String>, Vec<GroupId>, bool) {
        let st = self.state.lock().unwrap();
        let mut flow_keys = Vec::new();
        let mut group_ids = Vec::new();
        let mut found = false;
        for (key, info) in st
            .service_installed_map
            .iter()
            .filter(|(k, _)| k.name.name == name && k.name.namespace == namespace)
        {
            found = true;
            let mut groups = Vec::new();
            for local in [false, true] {
                if let Some(gid) = self.group_counter.get(key, local) {
                    groups.push(gid);
                }
            }
            let protocol = FlowProtocol::new(info.protocol, self.config.address_family);
            flow_keys.extend(self.flow_client.service_flow_keys(
                info.cluster_ip,
                info.port,
                protocol,
                &groups,
            ));
            group_ids.extend(groups);
        }
        (flow_keys, group_ids, found)
    }

    /// One reconcile round. Returns the delay until the earliest retry, if
    /// any key is waiting out a backoff.
    fn sync_once(&self) -> Result<Option<Duration>, GroupsExhausted> {
        if !self.initialized() {
            debug!("initial listings incomplete, skipping sync");
            return Ok(None);
        }
        let started = Instant::now();
        let family = self.config.address_family;
        let mut st = self.state.lock().unwrap();
        let st = &mut *st;

        let mut dirty: BTreeSet<ServicePortName> = BTreeSet::new();
        dirty.extend(self.service_changes.update(&mut st.service_map));
        dirty.extend(self.endpoints_changes.update(&mut st.endpoints_map));
        let now = Instant::now();
        dirty.extend(
            st.retries
                .iter()
                .filter(|(_, r)| r.due <= now)
                .map(|(k, _)| k.clone()),
        );

        let mut failed = Vec::new();
        for key in &dirty {
            match self.reconcile_key(st, key) {
                Ok(()) => {
                    st.retries.remove(key);
                }
                Err(KeyError::Groups(e)) => {
                    error!(service = %key, error = %e, "group allocation failed");
                    return Err(e);
                }
                Err(KeyError::Dataplane(e)) => {
                    warn!(service = %key, error = %e, "dataplane rejected update, will retry");
                    failed.push(key.clone());
                }
            }
        }
        if !failed.is_empty() {
            self.metrics.inc_sync_error(family);
        }
        let now = Instant::now();
        for key in failed {
            let retry = st.retries.entry(key).or_insert(Retry {
                attempts: 0,
                due: now,
            });
            retry.attempts += 1;
            retry.due = now + self.backoff(retry.attempts);
        }

        self.metrics.set_installed(
            family,
            st.service_installed_map.len(),
            st.endpoints_installed_map.values().map(|m| m.len()).sum(),
        );
        self.metrics.observe_sync(family, started.elapsed());

        Ok(st
            .retries
            .values()
            .map(|r| r.due.saturating_duration_since(now))
            .min())
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        (self.config.min_sync_interval * 2u32.pow(shift)).min(self.config.max_sync_interval)
    }

    fn reconcile_key(&self, st: &mut SyncState, key: &ServicePortName) -> Result<(), KeyError> {
        match st.service_map.get(key).cloned() {
            Some(info) => self.install_service(st, key, &info),
            None => self.uninstall_service(st, key),
        }
    }

    /// Whether any externally reachable address would be programmed.
    fn has_external(&self, info: &ServiceInfo) -> bool {
        self.config.proxy_all
            && (info.node_port > 0
                || !info.external_ips.is_empty()
                || (self.config.proxy_load_balancer_ips && !info.load_balancer_ips.is_empty()))
    }

    /// The group localities a service needs, internal path first.
    fn desired_group_flags(&self, info: &ServiceInfo) -> Vec<bool> {
        let internal = info.internal_policy_local;
        if !self.has_external(info) {
            return vec![internal];
        }
        let external = info.external_policy_local;
        if internal != external {
            vec![internal, external]
        } else if internal {
            // Both paths are local-only, but the cluster path still needs a
            // full group for downstream consumers.
            vec![true, false]
        } else {
            vec![false]
        }
    }

    fn install_service(
        &self,
        st: &mut SyncState,
        key: &ServicePortName,
        info: &ServiceInfo,
    ) -> Result<(), KeyError> {
        let family = self.config.address_family;
        let protocol = FlowProtocol::new(info.protocol, family);
        let prev = st.service_installed_map.get(key).cloned();
        let first = prev.is_none();

        let desired_eps = st.endpoints_map.get(key).cloned().unwrap_or_default();
        let flags = self.desired_group_flags(info);
        // The backends this service references: every desired endpoint when
        // a cluster group is live, only local ones otherwise.
        let referenced: HashMap<String, Endpoint> = if flags.contains(&false) {
            desired_eps.clone()
        } else {
            desired_eps
                .iter()
                .filter(|(_, e)| e.is_local)
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect()
        };
        let installed_eps = st.endpoints_installed_map.get(key).cloned().unwrap_or_default();

        let (need_removal, node_port_changed, affinity_flag_changed, policies_changed, prev_flags) =
            match &prev {
                Some(p) => (
                    info.identity_changed(p)
                        || info.affinity_changed(p)
                        || info.traffic_policies_changed(p)
                        || info.is_nested != p.is_nested,
                    info.node_port != p.node_port,
                    info.affinity_enabled() != p.affinity_enabled(),
                    info.traffic_policies_changed(p),
                    self.desired_group_flags(p),
                ),
                None => (false, false, false, false, Vec::new()),
            };

        // Endpoint flows for backends this service newly references. Flows
        // are shared, so only globally unreferenced backends get installed.
        let mut added: Vec<&Endpoint> = referenced
            .iter()
            .filter(|(k, _)| !installed_eps.contains_key(*k))
            .map(|(_, e)| e)
            .collect();
        added.sort_by_key(|e| e.key());
        let mut removed: Vec<&Endpoint> = installed_eps
            .iter()
            .filter(|(k, _)| !referenced.contains_key(*k))
            .map(|(_, e)| e)
            .collect();
        removed.sort_by_key(|e| e.key());

        let to_install: Vec<Endpoint> = added
            .iter()
            .filter(|e| {
                st.endpoint_refs
                    .get(&(protocol, e.key()))
                    .copied()
                    .unwrap_or(0)
                    == 0
            })
            .map(|e| (*e).clone())
            .collect();
        if !to_install.is_empty() {
            self.flow_client.install_endpoint_flows(protocol, &to_install)?;
        }

        // Groups, internal path first, so every flow installed below refers
        // to a group that already exists.
        for &flag in &flags {
            let members = group_members(&desired_eps, flag);
            let prev_members = group_members(&installed_eps, flag);
            let reinstall = first
                || !prev_flags.contains(&flag)
                || affinity_flag_changed
                || policies_changed
                || members != prev_members;
            if reinstall {
                let gid = self.group_counter.allocate_if_not_exist(key, flag)?;
                self.flow_client
                    .install_service_group(gid, info.affinity_enabled(), &members)?;
            }
        }

        // Backends nobody references any longer lose their flows.
        let to_uninstall: Vec<Endpoint> = removed
            .iter()
            .filter(|e| {
                st.endpoint_refs
                    .get(&(protocol, e.key()))
                    .copied()
                    .unwrap_or(0)
                    == 1
            })
            .map(|e| (*e).clone())
            .collect();
        if !to_uninstall.is_empty() {
            self.flow_client
                .uninstall_endpoint_flows(protocol, &to_uninstall)?;
        }
        for e in &added {
            *st.endpoint_refs.entry((protocol, e.key())).or_insert(0) += 1;
        }
        for e in &removed {
            release_endpoint_ref(&mut st.endpoint_refs, protocol, &e.key());
        }
        st.endpoints_installed_map.insert(key.clone(), referenced);

        // Group IDs the flows reference.
        let internal_group = self
            .group_counter
            .allocate_if_not_exist(key, info.internal_policy_local)?;
        let (external_group, cluster_group) = if self.has_external(info) {
            let eg = self
                .group_counter
                .allocate_if_not_exist(key, info.external_policy_local)?;
            let cg = self.group_counter.allocate_if_not_exist(key, false)?;
            (eg, cg)
        } else {
            (internal_group, GroupId(0))
        };

        // Cluster IP flow. A zero cluster-group argument: internal traffic
        // never falls back across the cluster.
        if let Some(p) = &prev {
            if need_removal {
                self.flow_client
                    .uninstall_service_flows(p.cluster_ip, p.port, protocol)?;
            }
        }
        if first || need_removal {
            self.flow_client.install_service_flows(&ServiceFlow {
                group: internal_group,
                cluster_group: GroupId(0),
                ip: info.cluster_ip,
                port: info.port,
                protocol,
                affinity_timeout: info.affinity_timeout(),
                is_external: false,
                is_nested: info.is_nested,
            })?;
        }

        // Node port path, via the per-family virtual DNAT address.
        if self.config.proxy_all {
            let vip = config::virtual_node_port_dnat_ip(family);
            let addresses = &self.config.node_port_addresses;
            if let Some(p) = &prev {
                if p.node_port > 0 && (need_removal || node_port_changed) {
                    self.flow_client
                        .uninstall_service_flows(vip, p.node_port, protocol)?;
                    self.route_client
                        .delete_node_port(addresses, p.node_port, protocol)?;
                }
            }
            if info.node_port > 0 && (first || need_removal || node_port_changed) {
                self.flow_client.install_service_flows(&ServiceFlow {
                    group: external_group,
                    cluster_group,
                    ip: vip,
                    port: info.node_port,
                    protocol,
                    affinity_timeout: info.affinity_timeout(),
                    is_external: true,
                    is_nested: false,
                })?;
                self.route_client
                    .add_node_port(addresses, info.node_port, protocol)?;
            }
        }

        // Externally advertised addresses, reference-counted across
        // services. Identity changes reinstall every address; otherwise only
        // the set difference churns.
        if self.config.proxy_all && self.config.proxy_load_balancer_ips {
            self.update_external_addresses(
                st,
                key,
                prev.as_ref().map(|p| (p.load_balancer_ips.clone(), p.port)),
                &info.load_balancer_ips,
                info,
                need_removal,
                external_group,
                cluster_group,
                protocol,
            )?;
        }
        if self.config.proxy_all {
            self.update_external_addresses(
                st,
                key,
                prev.as_ref().map(|p| (p.external_ips.clone(), p.port)),
                &info.external_ips,
                info,
                need_removal,
                external_group,
                cluster_group,
                protocol,
            )?;
        }

        // Groups that lost their last path go away after the flows stopped
        // referencing them.
        for flag in [false, true] {
            if !flags.contains(&flag) {
                if let Some(gid) = self.group_counter.get(key, flag) {
                    self.flow_client.uninstall_service_group(gid)?;
                    self.group_counter.recycle(key, flag);
                }
            }
        }

        st.service_installed_map.insert(key.clone(), info.clone());
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn update_external_addresses(
        &self,
        st: &mut SyncState,
        key: &ServicePortName,
        previous: Option<(Vec<IpAddr>, u16)>,
        current: &[IpAddr],
        info: &ServiceInfo,
        need_removal: bool,
        external_group: GroupId,
        cluster_group: GroupId,
        protocol: FlowProtocol,
    ) -> Result<(), KeyError> {
        let (prev_ips, prev_port) = previous.unwrap_or_default();
        let to_delete: Vec<IpAddr> = prev_ips
            .iter()
            .filter(|ip| need_removal || !current.contains(ip))
            .copied()
            .collect();
        let to_add: Vec<IpAddr> = current
            .iter()
            .filter(|ip| need_removal || !prev_ips.contains(ip))
            .copied()
            .collect();
        for ip in to_delete {
            self.flow_client
                .uninstall_service_flows(ip, prev_port, protocol)?;
            if st.route_refs.peek_release(ip, key) {
                self.route_client.delete_external_ip_route(ip)?;
            }
            st.route_refs.release(ip, key);
        }
        for ip in to_add {
            self.flow_client.install_service_flows(&ServiceFlow {
                group: external_group,
                cluster_group,
                ip,
                port: info.port,
                protocol,
                affinity_timeout: info.affinity_timeout(),
                is_external: true,
                is_nested: false,
            })?;
            if st.route_refs.peek_reference(ip) {
                self.route_client.add_external_ip_route(ip)?;
            }
            st.route_refs.reference(ip, key);
        }
        Ok(())
    }

    fn uninstall_service(&self, st: &mut SyncState, key: &ServicePortName) -> Result<(), KeyError> {
        let Some(p) = st.service_installed_map.get(key).cloned() else {
            return Ok(());
        };
        let family = self.config.address_family;
        let protocol = FlowProtocol::new(p.protocol, family);
        debug!(service = %key, "removing service from the dataplane");

        self.flow_client
            .uninstall_service_flows(p.cluster_ip, p.port, protocol)?;

        if self.config.proxy_all && p.node_port > 0 {
            let vip = config::virtual_node_port_dnat_ip(family);
            self.flow_client
                .uninstall_service_flows(vip, p.node_port, protocol)?;
            self.route_client.delete_node_port(
                &self.config.node_port_addresses,
                p.node_port,
                protocol,
            )?;
        }
        if self.config.proxy_all && self.config.proxy_load_balancer_ips {
            for ip in &p.load_balancer_ips {
                self.flow_client
                    .uninstall_service_flows(*ip, p.port, protocol)?;
                if st.route_refs.peek_release(*ip, key) {
                    self.route_client.delete_external_ip_route(*ip)?;
                }
                st.route_refs.release(*ip, key);
            }
        }
        if self.config.proxy_all {
            for ip in &p.external_ips {
                self.flow_client
                    .uninstall_service_flows(*ip, p.port, protocol)?;
                if st.route_refs.peek_release(*ip, key) {
                    self.route_client.delete_external_ip_route(*ip)?;
                }
                st.route_refs.release(*ip, key);
            }
        }

        for local in [false, true] {
            if let Some(gid) = self.group_counter.get(key, local) {
                self.flow_client.uninstall_service_group(gid)?;
                self.group_counter.recycle(key, local);
            }
        }

        // Endpoint flows go last, and only for backends no other service
        // still references.
        let installed = st.endpoints_installed_map.get(key).cloned().unwrap_or_default();
        let mut removed: Vec<&Endpoint> = installed.values().collect();
        removed.sort_by_key(|e| e.key());
        let to_uninstall: Vec<Endpoint> = removed
            .iter()
            .filter(|e| {
                st.endpoint_refs
                    .get(&(protocol, e.key()))
                    .copied()
                    .unwrap_or(0)
                    == 1
            })
            .map(|e| (*e).clone())
            .collect();
        if !to_uninstall.is_empty() {
            self.flow_client
                .uninstall_endpoint_flows(protocol, &to_uninstall)?;
        }
        for e in removed {
            release_endpoint_ref(&mut st.endpoint_refs, protocol, &e.key());
        }
        st.endpoints_installed_map.remove(key);
        st.service_installed_map.remove(key);
        Ok(())
    }
}

impl ServiceEventHandler for Proxier {
    fn on_service_update(&self, previous: Option<&api::Service>, current: Option<&api::Service>) {
        if previous.is_some() && current.is_some() {
            self.metrics.inc_service_update(self.config.address_family);
        }
        if self.service_changes.on_service_update(previous, current) && self.initialized() {
            self.sync_handle.run();
        }
    }

    fn on_service_synced(&self) {
        self.service_changes.on_synced();
        if self.initialized() {
            self.sync_handle.run();
        }
    }
}

impl EndpointsEventHandler for Proxier {
    fn on_endpoints_update(
        &self,
        previous: Option<&api::Endpoints>,
        current: Option<&api::Endpoints>,
    ) {
        if previous.is_some() && current.is_some() {
            self.metrics.inc_endpoints_update(self.config.address_family);
        }
        if self.endpoints_changes.on_endpoints_update(previous, current) && self.initialized() {
            self.sync_handle.run();
        }
    }

    fn on_endpoint_slice_update(&self, slice: &api::EndpointSlice, removed: bool) {
        if self.endpoints_changes.on_endpoint_slice_update(slice, removed) && self.initialized() {
            self.sync_handle.run();
        }
    }

    fn on_endpoints_synced(&self) {
        self.endpoints_changes.on_synced();
        if self.initialized() {
            self.sync_handle.run();
        }
    }
}

fn group_members(eps: &HashMap<String, Endpoint>, local_only: bool) -> Vec<Endpoint> {
    eps.values()
        .filter(|e| !local_only || e.is_local)
        .cloned()
        .sorted_by_key(|e| e.key())
        .collect()
}

fn release_endpoint_ref(
    refs: &mut HashMap<(FlowProtocol, String), usize>,
    protocol: FlowProtocol,
    endpoint: &str,
) {
    if let Some(count) = refs.get_mut(&(protocol, endpoint.to_string())) {
        *count -= 1;
        if *count == 0 {
            refs.remove(&(protocol, endpoint.to_string()));
        }
    }
}

/// Fronts two single-family instances. Families never see each other's
/// keys; each instance filters events down to its own address family.
pub struct DualStackProxier {
    v4: Arc<Proxier>,
    v6: Arc<Proxier>,
}

impl DualStackProxier {
    pub fn new(v4: Arc<Proxier>, v6: Arc<Proxier>) -> Self {
        Self { v4, v6 }
    }

    pub async fn run(&self, shutdown: Shutdown) -> anyhow::Result<()> {
        let v4_shutdown = Shutdown::new();
        let v6_shutdown = Shutdown::new();
        let v4_trigger = v4_shutdown.trigger();
        let v6_trigger = v6_shutdown.trigger();
        tokio::spawn(async move {
            shutdown.wait().await;
            v4_trigger.shutdown_now().await;
            v6_trigger.shutdown_now().await;
        });
        let (v4_res, v6_res) = tokio::join!(self.v4.run(v4_shutdown), self.v6.run(v6_shutdown));
        v4_res?;
        v6_res?;
        Ok(())
    }
}

impl ServiceEventHandler for DualStackProxier {
    fn on_service_update(&self, previous: Option<&api::Service>, current: Option<&api::Service>) {
        self.v4.on_service_update(previous, current);
        self.v6.on_service_update(previous, current);
    }

    fn on_service_synced(&self) {
        self.v4.on_service_synced();
        self.v6.on_service_synced();
    }
}

impl EndpointsEventHandler for DualStackProxier {
    fn on_endpoints_update(
        &self,
        previous: Option<&api::Endpoints>,
        current: Option<&api::Endpoints>,
    ) {
        self.v4.on_endpoints_update(previous, current);
        self.v6.on_endpoints_update(previous, current);
    }

    fn on_endpoint_slice_update(&self, slice: &api::EndpointSlice, removed: bool) {
        self.v4.on_endpoint_slice_update(slice, removed);
        self.v6.on_endpoint_slice_update(slice, removed);
    }

    fn on_endpoints_synced(&self) {
        self.v4.on_endpoints_synced();
        self.v6.on_endpoints_synced();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    use crate::api::{Protocol, TrafficPolicy, NESTED_SERVICE_ANNOTATION};
    use crate::test_helpers::{
        cluster_ip_service, endpoint_slice, new_test_proxier, FlowOp, RouteOp, ServiceBuilder,
        SliceEndpointSpec,
    };

    const HOST: &str = "node-a";
    const SVC_IP: &str = "10.20.30.41";
    const SVC_IP2: &str = "10.20.30.42";
    const EP1: &str = "10.180.0.1";
    const EP2: &str = "10.180.0.2";

    fn config() -> ProxyConfig {
        let mut cfg = ProxyConfig::new(HOST, AddressFamily::V4);
        cfg.min_sync_interval = Duration::from_millis(1);
        cfg
    }

    fn config_proxy_all() -> ProxyConfig {
        let mut cfg = config();
        cfg.proxy_all = true;
        cfg.node_port_addresses = vec!["192.168.77.100".parse().unwrap()];
        cfg
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn mark_synced(p: &Proxier) {
        p.on_service_synced();
        p.on_endpoints_synced();
    }

    fn two_endpoint_slice() -> api::EndpointSlice {
        endpoint_slice(
            "ns",
            "svc",
            "svc-x7k2p",
            "80",
            80,
            &[
                SliceEndpointSpec::remote(EP1),
                SliceEndpointSpec::local(EP2, HOST),
            ],
        )
    }

    #[test]
    fn sync_before_initial_listing_is_a_noop() {
        let (proxier, dataplane) = new_test_proxier(config());
        proxier.on_service_update(None, Some(&cluster_ip_service("ns", "svc", SVC_IP, 80)));
        proxier.sync_proxy_rules();
        assert!(dataplane.take_flow_ops().is_empty());
    }

    #[test]
    fn cluster_ip_add_with_remote_and_local_endpoints() {
        let (proxier, dataplane) = new_test_proxier(config());
        proxier.on_service_update(None, Some(&cluster_ip_service("ns", "svc", SVC_IP, 80)));
        proxier.on_endpoint_slice_update(&two_endpoint_slice(), false);
        mark_synced(&proxier);
        proxier.sync_proxy_rules();

        let ops = dataplane.take_flow_ops();
        assert_eq!(
            ops,
            vec![
                FlowOp::InstallEndpointFlows {
                    protocol: FlowProtocol::Tcp,
                    endpoints: vec![format!("{EP1}:80"), format!("{EP2}:80")],
                },
                FlowOp::InstallServiceGroup {
                    group: GroupId(1),
                    affinity: false,
                    endpoints: vec![format!("{EP1}:80"), format!("{EP2}:80")],
                },
                FlowOp::InstallServiceFlows {
                    group: GroupId(1),
                    cluster_group: GroupId(0),
                    ip: ip(SVC_IP),
                    port: 80,
                    protocol: FlowProtocol::Tcp,
                    affinity_timeout: 0,
                    is_external: false,
                    is_nested: false,
                },
            ]
        );
        assert!(dataplane.take_route_ops().is_empty());
    }

    #[test]
    fn repeated_sync_without_events_is_idempotent() {
        let (proxier, dataplane) = new_test_proxier(config());
        proxier.on_service_update(None, Some(&cluster_ip_service("ns", "svc", SVC_IP, 80)));
        proxier.on_endpoint_slice_update(&two_endpoint_slice(), false);
        mark_synced(&proxier);
        proxier.sync_proxy_rules();
        dataplane.take_flow_ops();

        proxier.sync_proxy_rules();
        proxier.sync_proxy_rules();
        assert!(dataplane.take_flow_ops().is_empty());
        assert!(dataplane.take_route_ops().is_empty());
    }

    #[test]
    fn service_without_endpoints_installs_empty_group() {
        let (proxier, dataplane) = new_test_proxier(config());
        proxier.on_service_update(None, Some(&cluster_ip_service("ns", "svc", SVC_IP, 80)));
        mark_synced(&proxier);
        proxier.sync_proxy_rules();

        let ops = dataplane.take_flow_ops();
        assert_eq!(
            ops,
            vec![
                FlowOp::InstallServiceGroup {
                    group: GroupId(1),
                    affinity: false,
                    endpoints: vec![],
                },
                FlowOp::InstallServiceFlows {
                    group: GroupId(1),
                    cluster_group: GroupId(0),
                    ip: ip(SVC_IP),
                    port: 80,
                    protocol: FlowProtocol::Tcp,
                    affinity_timeout: 0,
                    is_external: false,
                    is_nested: false,
                },
            ]
        );
    }

    #[test]
    fn cluster_ip_update_reinstalls_flows_but_not_groups() {
        let (proxier, dataplane) = new_test_proxier(config());
        let before = cluster_ip_service("ns", "svc", SVC_IP, 80);
        let after = cluster_ip_service("ns", "svc", SVC_IP2, 80);
        proxier.on_service_update(None, Some(&before));
        proxier.on_endpoint_slice_update(&two_endpoint_slice(), false);
        mark_synced(&proxier);
        proxier.sync_proxy_rules();
        dataplane.take_flow_ops();

        proxier.on_service_update(Some(&before), Some(&after));
        proxier.sync_proxy_rules();
        let ops = dataplane.take_flow_ops();
        assert_eq!(
            ops,
            vec![
                FlowOp::UninstallServiceFlows {
                    ip: ip(SVC_IP),
                    port: 80,
                    protocol: FlowProtocol::Tcp,
                },
                FlowOp::InstallServiceFlows {
                    group: GroupId(1),
                    cluster_group: GroupId(0),
                    ip: ip(SVC_IP2),
                    port: 80,
                    protocol: FlowProtocol::Tcp,
                    affinity_timeout: 0,
                    is_external: false,
                    is_nested: false,
                },
            ]
        );
    }

    #[test]
    fn affinity_timeout_is_clamped_not_wrapped() {
        let (proxier, dataplane) = new_test_proxier(config());
        let svc = ServiceBuilder::new("ns", "svc")
            .cluster_ip(SVC_IP)
            .port("80", 80)
            .session_affinity(65545)
            .build();
        proxier.on_service_update(None, Some(&svc));
        proxier.on_endpoint_slice_update(&two_endpoint_slice(), false);
        mark_synced(&proxier);
        proxier.sync_proxy_rules();

        let ops = dataplane.take_flow_ops();
        assert!(ops.iter().any(|op| matches!(
            op,
            FlowOp::InstallServiceGroup { affinity: true, .. }
        )));
        assert!(ops.iter().any(|op| matches!(
            op,
            FlowOp::InstallServiceFlows {
                affinity_timeout: 65535,
                ..
            }
        )));
    }

    #[test]
    fn affinity_timeout_update_touches_only_flows() {
        let (proxier, dataplane) = new_test_proxier(config());
        let before = ServiceBuilder::new("ns", "svc")
            .cluster_ip(SVC_IP)
            .port("80", 80)
            .session_affinity(10)
            .build();
        let after = ServiceBuilder::new("ns", "svc")
            .cluster_ip(SVC_IP)
            .port("80", 80)
            .session_affinity(100)
            .build();
        proxier.on_service_update(None, Some(&before));
        proxier.on_endpoint_slice_update(&two_endpoint_slice(), false);
        mark_synced(&proxier);
        proxier.sync_proxy_rules();
        dataplane.take_flow_ops();

        proxier.on_service_update(Some(&before), Some(&after));
        proxier.sync_proxy_rules();
        let ops = dataplane.take_flow_ops();
        // The affinity-enabled bit did not change, so the group stays put.
        assert_eq!(
            ops.iter().map(|o| o.name()).collect::<Vec<_>>(),
            vec!["UninstallServiceFlows", "InstallServiceFlows"]
        );
        assert!(ops.iter().any(|op| matches!(
            op,
            FlowOp::InstallServiceFlows {
                affinity_timeout: 100,
                ..
            }
        )));
    }

    #[test]
    fn endpoint_change_reinstalls_group_without_touching_flows() {
        let (proxier, dataplane) = new_test_proxier(config());
        proxier.on_service_update(None, Some(&cluster_ip_service("ns", "svc", SVC_IP, 80)));
        let slice = two_endpoint_slice();
        proxier.on_endpoint_slice_update(&slice, false);
        mark_synced(&proxier);
        proxier.sync_proxy_rules();
        dataplane.take_flow_ops();

        // One backend goes away.
        let shrunk = endpoint_slice(
            "ns",
            "svc",
            "svc-x7k2p",
            "80",
            80,
            &[SliceEndpointSpec::local(EP2, HOST)],
        );
        proxier.on_endpoint_slice_update(&shrunk, false);
        proxier.sync_proxy_rules();
        let ops = dataplane.take_flow_ops();
        assert_eq!(
            ops,
            vec![
                FlowOp::InstallServiceGroup {
                    group: GroupId(1),
                    affinity: false,
                    endpoints: vec![format!("{EP2}:80")],
                },
                FlowOp::UninstallEndpointFlows {
                    protocol: FlowProtocol::Tcp,
                    endpoints: vec![format!("{EP1}:80")],
                },
            ]
        );
    }

    #[test]
    fn internal_traffic_policy_local_restricts_group_to_local_backends() {
        let (proxier, dataplane) = new_test_proxier(config());
        let svc = ServiceBuilder::new("ns", "svc")
            .cluster_ip(SVC_IP)
            .port("80", 80)
            .internal_traffic_policy(TrafficPolicy::Local)
            .build();
        proxier.on_service_update(None, Some(&svc));
        proxier.on_endpoint_slice_update(&two_endpoint_slice(), false);
        mark_synced(&proxier);
        proxier.sync_proxy_rules();

        let ops = dataplane.take_flow_ops();
        // The remote backend is not referenced at all.
        assert_eq!(
            ops[0],
            FlowOp::InstallEndpointFlows {
                protocol: FlowProtocol::Tcp,
                endpoints: vec![format!("{EP2}:80")],
            }
        );
        assert!(ops.iter().any(|op| matches!(
            op,
            FlowOp::InstallServiceGroup { endpoints, .. } if endpoints == &vec![format!("{EP2}:80")]
        )));
    }

    #[test]
    fn internal_traffic_policy_update_moves_service_to_local_group() {
        let (proxier, dataplane) = new_test_proxier(config());
        let before = cluster_ip_service("ns", "svc", SVC_IP, 80);
        let after = ServiceBuilder::new("ns", "svc")
            .cluster_ip(SVC_IP)
            .port("80", 80)
            .internal_traffic_policy(TrafficPolicy::Local)
            .build();
        proxier.on_service_update(None, Some(&before));
        proxier.on_endpoint_slice_update(&two_endpoint_slice(), false);
        mark_synced(&proxier);
        proxier.sync_proxy_rules();
        dataplane.take_flow_ops();

        proxier.on_service_update(Some(&before), Some(&after));
        proxier.sync_proxy_rules();
        let ops = dataplane.take_flow_ops();
        assert_eq!(
            ops,
            vec![
                FlowOp::InstallServiceGroup {
                    group: GroupId(2),
                    affinity: false,
                    endpoints: vec![format!("{EP2}:80")],
                },
                FlowOp::UninstallEndpointFlows {
                    protocol: FlowProtocol::Tcp,
                    endpoints: vec![format!("{EP1}:80")],
                },
                FlowOp::UninstallServiceFlows {
                    ip: ip(SVC_IP),
                    port: 80,
                    protocol: FlowProtocol::Tcp,
                },
                FlowOp::InstallServiceFlows {
                    group: GroupId(2),
                    cluster_group: GroupId(0),
                    ip: ip(SVC_IP),
                    port: 80,
                    protocol: FlowProtocol::Tcp,
                    affinity_timeout: 0,
                    is_external: false,
                    is_nested: false,
                },
                FlowOp::UninstallServiceGroup { group: GroupId(1) },
            ]
        );
    }

    #[test]
    fn shared_backend_is_installed_once_and_removed_last() {
        let (proxier, dataplane) = new_test_proxier(config());
        let svc1 = cluster_ip_service("ns", "svc1", SVC_IP, 80);
        let svc2 = cluster_ip_service("ns", "svc2", SVC_IP2, 80);
        let eps1 = endpoint_slice("ns", "svc1", "svc1-aaaaa", "80", 80, &[SliceEndpointSpec::remote(EP1)]);
        let eps2 = endpoint_slice("ns", "svc2", "svc2-bbbbb", "80", 80, &[SliceEndpointSpec::remote(EP1)]);
        proxier.on_service_update(None, Some(&svc1));
        proxier.on_service_update(None, Some(&svc2));
        proxier.on_endpoint_slice_update(&eps1, false);
        proxier.on_endpoint_slice_update(&eps2, false);
        mark_synced(&proxier);
        proxier.sync_proxy_rules();
        assert_eq!(dataplane.flow_op_count("InstallEndpointFlows"), 1);

        // Removing the first service must leave the shared flow alone.
        proxier.on_service_update(Some(&svc1), None);
        proxier.on_endpoint_slice_update(&eps1, true);
        proxier.sync_proxy_rules();
        assert_eq!(dataplane.flow_op_count("UninstallEndpointFlows"), 0);

        proxier.on_service_update(Some(&svc2), None);
        proxier.on_endpoint_slice_update(&eps2, true);
        proxier.sync_proxy_rules();
        assert_eq!(dataplane.flow_op_count("UninstallEndpointFlows"), 1);
    }

    #[test]
    fn removal_releases_groups_for_reuse() {
        let (proxier, dataplane) = new_test_proxier(config());
        let svc = cluster_ip_service("ns", "svc", SVC_IP, 80);
        proxier.on_service_update(None, Some(&svc));
        proxier.on_endpoint_slice_update(&two_endpoint_slice(), false);
        mark_synced(&proxier);
        proxier.sync_proxy_rules();
        dataplane.take_flow_ops();

        proxier.on_service_update(Some(&svc), None);
        proxier.on_endpoint_slice_update(&two_endpoint_slice(), true);
        proxier.sync_proxy_rules();
        let ops = dataplane.take_flow_ops();
        assert_eq!(
            ops,
            vec![
                FlowOp::UninstallServiceFlows {
                    ip: ip(SVC_IP),
                    port: 80,
                    protocol: FlowProtocol::Tcp,
                },
                FlowOp::UninstallServiceGroup { group: GroupId(1) },
                FlowOp::UninstallEndpointFlows {
                    protocol: FlowProtocol::Tcp,
                    endpoints: vec![format!("{EP1}:80"), format!("{EP2}:80")],
                },
            ]
        );
        assert_eq!(proxier.group_counter.allocated(), 0);

        // The freed ID is handed out again to the next service.
        proxier.on_service_update(None, Some(&cluster_ip_service("ns", "other", SVC_IP2, 80)));
        proxier.sync_proxy_rules();
        let ops = dataplane.take_flow_ops();
        assert!(ops
            .iter()
            .any(|op| matches!(op, FlowOp::InstallServiceGroup { group: GroupId(1), .. })));
    }

    #[test]
    fn node_port_flows_target_the_virtual_dnat_address() {
        let (proxier, dataplane) = new_test_proxier(config_proxy_all());
        let svc = crate::test_helpers::node_port_service("ns", "svc", SVC_IP, 80, 30008);
        proxier.on_service_update(None, Some(&svc));
        proxier.on_endpoint_slice_update(&two_endpoint_slice(), false);
        mark_synced(&proxier);
        proxier.sync_proxy_rules();

        let ops = dataplane.take_flow_ops();
        let vip = config::virtual_node_port_dnat_ip(AddressFamily::V4);
        assert!(ops.contains(&FlowOp::InstallServiceFlows {
            group: GroupId(1),
            cluster_group: GroupId(1),
            ip: vip,
            port: 30008,
            protocol: FlowProtocol::Tcp,
            affinity_timeout: 0,
            is_external: true,
            is_nested: false,
        }));
        assert_eq!(
            dataplane.take_route_ops(),
            vec![RouteOp::AddNodePort {
                port: 30008,
                protocol: FlowProtocol::Tcp,
            }]
        );
    }

    #[test]
    fn node_port_ignored_without_proxy_all() {
        let (proxier, dataplane) = new_test_proxier(config());
        let svc = crate::test_helpers::node_port_service("ns", "svc", SVC_IP, 80, 30008);
        proxier.on_service_update(None, Some(&svc));
        proxier.on_endpoint_slice_update(&two_endpoint_slice(), false);
        mark_synced(&proxier);
        proxier.sync_proxy_rules();

        let ops = dataplane.take_flow_ops();
        assert_eq!(dataplane.route_op_count("AddNodePort"), 0);
        assert!(ops
            .iter()
            .all(|op| !matches!(op, FlowOp::InstallServiceFlows { is_external: true, .. })));
    }

    #[test]
    fn nested_service_marks_only_the_cluster_ip_flow() {
        let mut cfg = config_proxy_all();
        cfg.support_nested_service = true;
        let (proxier, dataplane) = new_test_proxier(cfg);
        let svc = ServiceBuilder::new("ns", "svc")
            .cluster_ip(SVC_IP)
            .port("80", 80)
            .external_ip("192.168.77.101")
            .annotation(NESTED_SERVICE_ANNOTATION, "true")
            .build();
        proxier.on_service_update(None, Some(&svc));
        proxier.on_endpoint_slice_update(&two_endpoint_slice(), false);
        mark_synced(&proxier);
        proxier.sync_proxy_rules();

        let ops = dataplane.take_flow_ops();
        assert!(ops.contains(&FlowOp::InstallServiceFlows {
            group: GroupId(1),
            cluster_group: GroupId(0),
            ip: ip(SVC_IP),
            port: 80,
            protocol: FlowProtocol::Tcp,
            affinity_timeout: 0,
            is_external: false,
            is_nested: true,
        }));
        assert!(ops.contains(&FlowOp::InstallServiceFlows {
            group: GroupId(1),
            cluster_group: GroupId(1),
            ip: ip("192.168.77.101"),
            port: 80,
            protocol: FlowProtocol::Tcp,
            affinity_timeout: 0,
            is_external: true,
            is_nested: false,
        }));
    }

    #[test]
    fn transient_install_failure_retries_without_advancing_mirrors() {
        let (proxier, dataplane) = new_test_proxier(config());
        dataplane.fail_next("InstallServiceFlows", 1);
        proxier.on_service_update(None, Some(&cluster_ip_service("ns", "svc", SVC_IP, 80)));
        proxier.on_endpoint_slice_update(&two_endpoint_slice(), false);
        mark_synced(&proxier);
        proxier.sync_proxy_rules();

        let (_, _, found) = proxier.get_service_flow_keys("svc", "ns");
        assert!(!found);

        std::thread::sleep(Duration::from_millis(5));
        proxier.sync_proxy_rules();
        let (_, groups, found) = proxier.get_service_flow_keys("svc", "ns");
        assert!(found);
        assert_eq!(groups, vec![GroupId(1)]);
    }

    #[test]
    fn failed_uninstall_keeps_the_key_for_retry() {
        let (proxier, dataplane) = new_test_proxier(config());
        let svc = cluster_ip_service("ns", "svc", SVC_IP, 80);
        proxier.on_service_update(None, Some(&svc));
        proxier.on_endpoint_slice_update(&two_endpoint_slice(), false);
        mark_synced(&proxier);
        proxier.sync_proxy_rules();

        dataplane.fail_next("UninstallServiceFlows", 1);
        proxier.on_service_update(Some(&svc), None);
        proxier.on_endpoint_slice_update(&two_endpoint_slice(), true);
        proxier.sync_proxy_rules();
        let (_, _, found) = proxier.get_service_flow_keys("svc", "ns");
        assert!(found);

        std::thread::sleep(Duration::from_millis(5));
        proxier.sync_proxy_rules();
        let (_, _, found) = proxier.get_service_flow_keys("svc", "ns");
        assert!(!found);
    }

    #[test]
    fn installed_gauges_follow_the_mirrors() {
        let (proxier, dataplane) = new_test_proxier(config());
        let svc = cluster_ip_service("ns", "svc", SVC_IP, 80);
        proxier.on_service_update(None, Some(&svc));
        proxier.on_endpoint_slice_update(&two_endpoint_slice(), false);
        mark_synced(&proxier);
        proxier.sync_proxy_rules();
        assert_eq!(proxier.metrics.installed_services(AddressFamily::V4), 1);
        assert_eq!(proxier.metrics.installed_endpoints(AddressFamily::V4), 2);

        proxier.on_service_update(Some(&svc), None);
        proxier.on_endpoint_slice_update(&two_endpoint_slice(), true);
        proxier.sync_proxy_rules();
        assert_eq!(proxier.metrics.installed_services(AddressFamily::V4), 0);
        assert_eq!(proxier.metrics.installed_endpoints(AddressFamily::V4), 0);
        dataplane.take_flow_ops();
    }

    #[test]
    fn same_port_different_protocol_endpoints_are_distinct() {
        let (proxier, dataplane) = new_test_proxier(config());
        let tcp = ServiceBuilder::new("ns", "svc-tcp")
            .cluster_ip(SVC_IP)
            .port("80", 80)
            .build();
        let udp = ServiceBuilder::new("ns", "svc-udp")
            .cluster_ip(SVC_IP)
            .port_proto("80", 80, Protocol::Udp)
            .build();
        let eps_tcp = endpoint_slice("ns", "svc-tcp", "svc-tcp-aaaaa", "80", 80, &[SliceEndpointSpec::remote(EP1)]);
        let eps_udp = crate::test_helpers::endpoint_slice_proto(
            "ns",
            "svc-udp",
            "svc-udp-bbbbb",
            "80",
            80,
            Protocol::Udp,
            &[SliceEndpointSpec::remote(EP1)],
        );
        proxier.on_service_update(None, Some(&tcp));
        proxier.on_service_update(None, Some(&udp));
        proxier.on_endpoint_slice_update(&eps_tcp, false);
        proxier.on_endpoint_slice_update(&eps_udp, false);
        mark_synced(&proxier);
        proxier.sync_proxy_rules();
        assert_eq!(dataplane.flow_op_count("InstallEndpointFlows"), 2);

        // Dropping the UDP backends only touches the UDP flow.
        proxier.on_endpoint_slice_update(&eps_udp, true);
        proxier.sync_proxy_rules();
        let ops = dataplane.take_flow_ops();
        assert!(ops.contains(&FlowOp::UninstallEndpointFlows {
            protocol: FlowProtocol::Udp,
            endpoints: vec![format!("{EP1}:80")],
        }));
        assert!(!ops
            .iter()
            .any(|op| matches!(op, FlowOp::UninstallEndpointFlows { protocol: FlowProtocol::Tcp, .. })));
    }
}
