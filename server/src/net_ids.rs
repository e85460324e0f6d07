//! Stable short ids for networked objects.
//!
//! Clients name objects by a string unique id; the server hands out a `u16`
//! the first time an id is seen and returns the same value afterwards.

use parking_lot::Mutex;
use shared::messages::{NetIdAssignment, NetIdAssignments};
use std::collections::BTreeMap;

#[derive(Debug)]
struct Assignments {
    by_unique_id: BTreeMap<String, u16>,
    next: u32,
}

#[derive(Debug)]
pub struct NetIdAllocator {
    inner: Mutex<Assignments>,
}

impl Default for NetIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl NetIdAllocator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Assignments {
                by_unique_id: BTreeMap::new(),
                next: 1,
            }),
        }
    }

    /// Returns the id for `unique_id`, allocating one if needed. `None` once
    /// every `u16` has been handed out.
    pub fn assign(&self, unique_id: &str) -> Option<u16> {
        let mut inner = self.inner.lock();
        if let Some(net_id) = inner.by_unique_id.get(unique_id) {
            return Some(*net_id);
        }

        let net_id = u16::try_from(inner.next).ok()?;
        inner.next += 1;
        inner.by_unique_id.insert(unique_id.to_string(), net_id);
        Some(net_id)
    }

    pub fn all(&self) -> NetIdAssignments {
        let inner = self.inner.lock();
        NetIdAssignments {
            assignments: inner
                .by_unique_id
                .iter()
                .map(|(unique_id, net_id)| NetIdAssignment {
                    unique_id: unique_id.clone(),
                    net_id: *net_id,
                })
                .collect(),
        }
    }
}
