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

//! Reference counting for host routes of externally advertised addresses.
//!
//! Several services may advertise the same ingress or external IP. The host
//! route must be added exactly once and removed only when the last service
//! stops referencing the address, so the counter reports the 0↔1 edges.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use crate::proxy::types::ServicePortName;

#[derive(Default)]
pub(crate) struct RouteRefCounter {
    refs: HashMap<IpAddr, HashSet<ServicePortName>>,
}

impl RouteRefCounter {
    /// Record that `key` advertises `ip`. True when this is the first
    /// reference and the route must be installed.
    pub(crate) fn reference(&mut self, ip: IpAddr, key: &ServicePortName) -> bool {
        let entry = self.refs.entry(ip).or_default();
        let first = entry.is_empty();
        entry.insert(key.clone());
        first
    }

    /// Drop `key`'s claim on `ip`. True when it was the last reference and
    /// the route must be removed.
    pub(crate) fn release(&mut self, ip: IpAddr, key: &ServicePortName) -> bool {
        let Some(entry) = self.refs.get_mut(&ip) else {
            return false;
        };
        entry.remove(key);
        if entry.is_empty() {
            self.refs.remove(&ip);
            true
        } else {
            false
        }
    }

    /// Would [RouteRefCounter::reference] be the first claim? Lets callers
    /// run the route side effect before committing the reference.
    pub(crate) fn peek_reference(&self, ip: IpAddr) -> bool {
        self.refs.get(&ip).map(|e| e.is_empty()).unwrap_or(true)
    }

    /// Would [RouteRefCounter::release] drop the last claim?
    pub(crate) fn peek_release(&self, ip: IpAddr, key: &ServicePortName) -> bool {
        self.refs
            .get(&ip)
            .map(|e| e.len() == 1 && e.contains(key))
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Protocol;
    use crate::proxy::types::NamespacedName;

    fn key(name: &str) -> ServicePortName {
        ServicePortName {
            name: NamespacedName::new("ns", name),
            port: "80".to_string(),
            protocol: Protocol::Tcp,
        }
    }

    #[test]
    fn edges_fire_only_on_first_and_last() {
        let ip: IpAddr = "169.254.169.1".parse().unwrap();
        let mut refs = RouteRefCounter::default();

        assert!(refs.reference(ip, &key("a")));
        assert!(!refs.reference(ip, &key("b")));
        // Re-referencing from the same service changes nothing.
        assert!(!refs.reference(ip, &key("a")));

        assert!(!refs.release(ip, &key("a")));
        assert!(refs.release(ip, &key("b")));
        assert!(refs.is_empty());

        // Releasing an unknown address is harmless.
        assert!(!refs.release(ip, &key("a")));
    }
}
