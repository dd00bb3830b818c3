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

use std::time::Duration;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::api::AddressFamily;

/// Creates the metrics sub registry for the proxy.
pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
    registry.sub_registry_with_prefix("flowproxy")
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FamilyLabels {
    pub ip_family: IpFamily,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum IpFamily {
    V4,
    V6,
}

impl From<AddressFamily> for FamilyLabels {
    fn from(family: AddressFamily) -> Self {
        FamilyLabels {
            ip_family: match family {
                AddressFamily::V4 => IpFamily::V4,
                AddressFamily::V6 => IpFamily::V6,
            },
        }
    }
}

/// Proxy health counters and gauges, shared by the per-family instances.
pub struct Metrics {
    services_installed: Family<FamilyLabels, Gauge>,
    endpoints_installed: Family<FamilyLabels, Gauge>,
    services_updates: Family<FamilyLabels, Counter>,
    endpoints_updates: Family<FamilyLabels, Counter>,
    sync_duration: Family<FamilyLabels, Histogram>,
    sync_errors: Family<FamilyLabels, Counter>,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let services_installed = Family::<FamilyLabels, Gauge>::default();
        registry.register(
            "services_installed",
            "Number of services currently programmed into the dataplane",
            services_installed.clone(),
        );
        let endpoints_installed = Family::<FamilyLabels, Gauge>::default();
        registry.register(
            "endpoints_installed",
            "Number of backend endpoints currently programmed into the dataplane",
            endpoints_installed.clone(),
        );
        let services_updates = Family::<FamilyLabels, Counter>::default();
        registry.register(
            "services_updates",
            "The total number of service modifications observed",
            services_updates.clone(),
        );
        let endpoints_updates = Family::<FamilyLabels, Counter>::default();
        registry.register(
            "endpoints_updates",
            "The total number of endpoint modifications observed",
            endpoints_updates.clone(),
        );
        let sync_duration = Family::<FamilyLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 14))
        });
        registry.register(
            "sync_duration_seconds",
            "Time spent reconciling the dataplane per sync round",
            sync_duration.clone(),
        );
        let sync_errors = Family::<FamilyLabels, Counter>::default();
        registry.register(
            "sync_errors",
            "The total number of sync rounds that left keys unreconciled",
            sync_errors.clone(),
        );
        Self {
            services_installed,
            endpoints_installed,
            services_updates,
            endpoints_updates,
            sync_duration,
            sync_errors,
        }
    }

    pub fn set_installed(&self, family: AddressFamily, services: usize, endpoints: usize) {
        let labels = FamilyLabels::from(family);
        self.services_installed
            .get_or_create(&labels)
            .set(services as i64);
        self.endpoints_installed
            .get_or_create(&labels)
            .set(endpoints as i64);
    }

    pub fn inc_service_update(&self, family: AddressFamily) {
        self.services_updates.get_or_create(&family.into()).inc();
    }

    pub fn inc_endpoints_update(&self, family: AddressFamily) {
        self.endpoints_updates.get_or_create(&family.into()).inc();
    }

    pub fn observe_sync(&self, family: AddressFamily, duration: Duration) {
        self.sync_duration
            .get_or_create(&family.into())
            .observe(duration.as_secs_f64());
    }

    pub fn inc_sync_error(&self, family: AddressFamily) {
        self.sync_errors.get_or_create(&family.into()).inc();
    }

    #[cfg(test)]
    pub(crate) fn installed_services(&self, family: AddressFamily) -> i64 {
        self.services_installed.get_or_create(&family.into()).get()
    }

    #[cfg(test)]
    pub(crate) fn installed_endpoints(&self, family: AddressFamily) -> i64 {
        self.endpoints_installed.get_or_create(&family.into()).get()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(&mut Registry::default())
    }
}
