//! Storage traits for objects, NV indices, and PCRs, plus an in-memory
//! simulation backend.
//!
//! The original reaches these through `ObjectGet`/`NvGetIndexInfo`/
//! `PCRGetAuthValue` and friends against a single global RAM/NV image
//! (`Entity.c`, `NVMemoryLib.c`). Here they are trait seams so the pipeline
//! never assumes a particular storage layout; [`sim`] is the only
//! implementation this crate ships.

use tpm2_call::NvAttributes;

use crate::entity::ObjectHierarchyFlags;

/// A loaded object's authorization-relevant fields. Key material itself is
/// out of scope; only what the pipeline needs to resolve auth/name/hierarchy
/// for the handle is modeled.
#[derive(Debug, Clone, Default)]
pub struct ObjectRecord {
    pub name: Vec<u8>,
    pub auth_value: Vec<u8>,
    pub auth_policy: Vec<u8>,
    /// The hash algorithm `auth_policy` was authored under, if any. Kept
    /// alongside the policy bytes themselves (rather than inferred) since
    /// this representative store does not model the full public-area
    /// structure the original derives it from.
    pub policy_alg: Option<tpm2_call::Algorithm>,
    pub user_with_auth: bool,
    pub admin_with_policy: bool,
    pub no_da: bool,
    pub is_sequence: bool,
    pub public_only: bool,
    pub hierarchy: ObjectHierarchyFlags,
}

/// An NV index's authorization-relevant fields (`NV_INDEX`).
#[derive(Debug, Clone, Default)]
pub struct NvIndexRecord {
    pub name: Vec<u8>,
    pub auth_value: Vec<u8>,
    pub auth_policy: Vec<u8>,
    pub policy_alg: Option<tpm2_call::Algorithm>,
    pub attributes: NvAttributes,
}

/// A PCR's authorization-relevant fields.
#[derive(Debug, Clone, Default)]
pub struct PcrRecord {
    pub auth_value: Vec<u8>,
    pub auth_policy: Vec<u8>,
}

pub trait ObjectStore {
    fn get(&self, handle: u32) -> Option<&ObjectRecord>;
    fn is_present(&self, handle: u32) -> bool {
        self.get(handle).is_some()
    }
}

pub trait NvIndexStore {
    fn get(&self, handle: u32) -> Option<&NvIndexRecord>;
    fn is_accessible(&self, handle: u32) -> bool {
        self.get(handle).is_some()
    }
}

pub trait PcrStore {
    fn get(&self, handle: u32) -> Option<&PcrRecord>;
}

/// In-memory backing store for all three entity classes, indexed directly by
/// raw handle. A real implementation would separate these by storage medium
/// (RAM object slots vs. NV vs. a fixed PCR bank); the simulation keeps them
/// in one place since it never needs to model eviction or NV wear.
#[derive(Debug, Default)]
pub struct SimStore {
    objects: std::collections::BTreeMap<u32, ObjectRecord>,
    nv_indices: std::collections::BTreeMap<u32, NvIndexRecord>,
    pcrs: std::collections::BTreeMap<u32, PcrRecord>,
}

impl SimStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_object(&mut self, handle: u32, record: ObjectRecord) {
        self.objects.insert(handle, record);
    }

    pub fn remove_object(&mut self, handle: u32) -> Option<ObjectRecord> {
        self.objects.remove(&handle)
    }

    pub fn insert_nv_index(&mut self, handle: u32, record: NvIndexRecord) {
        self.nv_indices.insert(handle, record);
    }

    pub fn insert_pcr(&mut self, handle: u32, record: PcrRecord) {
        self.pcrs.insert(handle, record);
    }
}

impl ObjectStore for SimStore {
    fn get(&self, handle: u32) -> Option<&ObjectRecord> {
        self.objects.get(&handle)
    }
}

impl NvIndexStore for SimStore {
    fn get(&self, handle: u32) -> Option<&NvIndexRecord> {
        self.nv_indices.get(&handle)
    }
}

impl PcrStore for SimStore {
    fn get(&self, handle: u32) -> Option<&PcrRecord> {
        self.pcrs.get(&handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_store_reports_presence_after_insert_and_removal() {
        let mut store = SimStore::new();
        assert!(!store.is_present(1));
        store.insert_object(1, ObjectRecord::default());
        assert!(store.is_present(1));
        store.remove_object(1);
        assert!(!store.is_present(1));
    }

    #[test]
    fn nv_index_store_is_accessible_only_when_defined() {
        let mut store = SimStore::new();
        assert!(!store.is_accessible(0x0100_0001));
        store.insert_nv_index(0x0100_0001, NvIndexRecord::default());
        assert!(store.is_accessible(0x0100_0001));
    }

    #[test]
    fn pcr_store_returns_none_for_undefined_pcr() {
        let store = SimStore::new();
        assert!(store.get(0).is_none());
    }
}
