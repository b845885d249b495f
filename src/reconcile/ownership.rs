//! Ownership classification
//!
//! Splits a runtime listing into containers we manage, grouped by the
//! deployment ID in their ownership label, and containers we must never
//! touch.

use std::collections::HashMap;

use crate::runtime::ObservedInstance;

/// A runtime listing split by owner
#[derive(Debug, Default)]
pub struct Ownership {
    /// Managed containers keyed by the raw ownership label value
    pub owned: HashMap<String, Vec<ObservedInstance>>,
    /// Containers without the ownership label
    pub unmanaged: Vec<ObservedInstance>,
}

impl Ownership {
    /// Take the group for one owner, leaving only other owners behind
    pub fn take(&mut self, owner: &str) -> Vec<ObservedInstance> {
        self.owned.remove(owner).unwrap_or_default()
    }

    /// Number of managed containers across all owners
    pub fn owned_count(&self) -> usize {
        self.owned.values().map(Vec::len).sum()
    }
}

/// Group `instances` by the value of `label`.
///
/// Keys are kept as raw strings: a label that is not a valid deployment ID
/// still marks the container as ours, and it will be collected as an orphan.
pub fn classify(instances: Vec<ObservedInstance>, label: &str) -> Ownership {
    let mut ownership = Ownership::default();

    for instance in instances {
        match instance.label(label) {
            Some(owner) => {
                let owner = owner.to_string();
                ownership.owned.entry(owner).or_default().push(instance);
            }
            None => ownership.unmanaged.push(instance),
        }
    }

    ownership
}
