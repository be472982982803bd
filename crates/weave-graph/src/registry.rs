//! Bidirectional association between manifests and registration indices.
//!
//! Every control-flow edge and constraint added to the protection graph is
//! tagged with a fresh [`RegistrationId`]. Conflict resolution discovers a
//! conflict via an edge or constraint index and must recover the manifest
//! that has to be evicted, so the registry keeps both directions in sync:
//! manifest -> owned indices and index -> owning manifest.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexMap;

use crate::constraint::RegistrationId;
use crate::element::ElementId;
use crate::error::GraphError;
use crate::manifest::{Manifest, ManifestId};

/// Registry of live manifests and the registration indices they own.
#[derive(Debug, Default)]
pub struct ProtectionRegistry {
    /// Live manifests, in registration order.
    manifests: IndexMap<ManifestId, Manifest>,
    /// Manifest -> registration indices it owns.
    owned: HashMap<ManifestId, BTreeSet<RegistrationId>>,
    /// Registration index -> owning manifest. Control-flow edges register
    /// unowned and have no entry here.
    owners: HashMap<RegistrationId, ManifestId>,
    next_manifest: u64,
    next_registration: u64,
}

impl ProtectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new manifest and returns its identity.
    pub fn add_manifest(
        &mut self,
        name: impl Into<String>,
        coverage: BTreeSet<ElementId>,
    ) -> ManifestId {
        let id = ManifestId(self.next_manifest);
        self.next_manifest += 1;
        self.manifests.insert(id, Manifest::new(id, name, coverage));
        id
    }

    /// Returns `true` if the manifest is still registered.
    pub fn contains(&self, id: ManifestId) -> bool {
        self.manifests.contains_key(&id)
    }

    /// Looks up a live manifest.
    pub fn manifest(&self, id: ManifestId) -> Option<&Manifest> {
        self.manifests.get(&id)
    }

    /// All live manifests, in registration order.
    pub fn manifests(&self) -> impl Iterator<Item = &Manifest> {
        self.manifests.values()
    }

    /// Number of live manifests.
    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    /// Returns `true` if no manifest is registered.
    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    /// Hands out the next registration index without an owner. Used for
    /// structural control-flow edges.
    pub fn register_unowned(&mut self) -> RegistrationId {
        let index = RegistrationId(self.next_registration);
        self.next_registration += 1;
        index
    }

    /// Hands out the next registration index, owned by `manifest`.
    pub fn register_for(&mut self, manifest: ManifestId) -> Result<RegistrationId, GraphError> {
        if !self.manifests.contains_key(&manifest) {
            return Err(GraphError::UnknownManifest { id: manifest });
        }
        let index = RegistrationId(self.next_registration);
        self.next_registration += 1;
        self.owned.entry(manifest).or_default().insert(index);
        self.owners.insert(index, manifest);
        Ok(index)
    }

    /// Reverse lookup: the manifest owning a registration index.
    pub fn owner_of(&self, index: RegistrationId) -> Option<ManifestId> {
        self.owners.get(&index).copied()
    }

    /// The registration indices a manifest owns.
    pub fn registrations_of(&self, id: ManifestId) -> Option<&BTreeSet<RegistrationId>> {
        self.owned.get(&id)
    }

    /// Removes a manifest and all its registrations from both directions.
    ///
    /// Returns the removed manifest and the indices it owned, or `None` if
    /// it was not (or no longer) registered.
    pub fn remove_manifest(
        &mut self,
        id: ManifestId,
    ) -> Option<(Manifest, BTreeSet<RegistrationId>)> {
        let manifest = self.manifests.shift_remove(&id)?;
        let owned = self.owned.remove(&id).unwrap_or_default();
        for index in &owned {
            self.owners.remove(index);
        }
        Some((manifest, owned))
    }
}
