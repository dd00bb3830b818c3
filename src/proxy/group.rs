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

//! Forwarding-group ID management.
//!
//! Group IDs are dataplane state, so they are recycled: a released ID goes
//! onto a free list and is handed out again before the counter advances.
//! Callers must only recycle after the dataplane acknowledged the group
//! uninstall, which keeps reuse safe without a confirmation channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::dataplane::GroupId;
use crate::proxy::types::ServicePortName;

/// Group zero is reserved to mean "no group".
const FIRST_GROUP_ID: u32 = 1;

#[derive(thiserror::Error, Debug)]
#[error("forwarding group IDs exhausted")]
pub struct GroupsExhausted;

struct GroupAllocator {
    next: u32,
    free: VecDeque<GroupId>,
}

impl GroupAllocator {
    fn new() -> Self {
        Self {
            next: FIRST_GROUP_ID,
            free: VecDeque::new(),
        }
    }

    fn allocate(&mut self) -> Result<GroupId, GroupsExhausted> {
        if let Some(id) = self.free.pop_front() {
            return Ok(id);
        }
        if self.next == u32::MAX {
            return Err(GroupsExhausted);
        }
        let id = GroupId(self.next);
        self.next += 1;
        Ok(id)
    }

    fn release(&mut self, id: GroupId) {
        self.free.push_back(id);
    }
}

/// Maps `(service port, local-only)` tuples to stable group IDs.
pub(crate) struct GroupCounter {
    inner: Mutex<GroupCounterInner>,
}

struct GroupCounterInner {
    allocator: GroupAllocator,
    groups: HashMap<(ServicePortName, bool), GroupId>,
}

impl GroupCounter {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(GroupCounterInner {
                allocator: GroupAllocator::new(),
                groups: HashMap::new(),
            }),
        }
    }

    /// Idempotent: repeated calls for the same tuple return the same ID, so
    /// the dataplane never sees churn on unrelated changes.
    pub(crate) fn allocate_if_not_exist(
        &self,
        key: &ServicePortName,
        local: bool,
    ) -> Result<GroupId, GroupsExhausted> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(id) = inner.groups.get(&(key.clone(), local)) {
            return Ok(*id);
        }
        let id = inner.allocator.allocate()?;
        inner.groups.insert((key.clone(), local), id);
        Ok(id)
    }

    pub(crate) fn get(&self, key: &ServicePortName, local: bool) -> Option<GroupId> {
        self.inner
            .lock()
            .unwrap()
            .groups
            .get(&(key.clone(), local))
            .copied()
    }

    /// Release the tuple's ID back to the free list. Returns false when the
    /// tuple held no ID.
    pub(crate) fn recycle(&self, key: &ServicePortName, local: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.groups.remove(&(key.clone(), local)) {
            Some(id) => {
                inner.allocator.release(id);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn allocated(&self) -> usize {
        self.inner.lock().unwrap().groups.len()
    }

    #[cfg(test)]
    pub(crate) fn free_list_len(&self) -> usize {
        self.inner.lock().unwrap().allocator.free.len()
    }
}
