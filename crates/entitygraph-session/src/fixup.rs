//! Relationship fixup.
//!
//! Every navigation mutation funnels into [`UnitOfWork::relink`], which moves
//! one dependent between principals and keeps all three views of the link in
//! agreement: the principal's dependents, the dependent's principal and the
//! dependent's foreign-key value. Collection edits, reference assignment and
//! raw foreign-key writes therefore end in the same state.
//!
//! Owned values are keyed by their owner's entry id, so relinking an owner
//! never touches them; [`UnitOfWork::ensure_ownership`] only verifies that
//! the registry still resolves every slot through the same entries.

use crate::entry::{EntryId, EntryState};
use crate::unit_of_work::UnitOfWork;
use entitygraph_core::{
    Error, Navigation, OrphanError, OwnershipError, RelationshipId, RelationshipKind, Result,
    SchemaErrorKind, Value,
};

impl UnitOfWork {
    /// Point `dependent` at `principal` (or at nothing) for one relationship.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn relink(
        &mut self,
        dependent: EntryId,
        rel: RelationshipId,
        principal: Option<EntryId>,
    ) -> Result<()> {
        let info = *self.schema.relationship(rel);
        let entry = self.live_entry(dependent)?;
        if entry.is_owned() || entry.entity != info.dependent {
            return Err(wrong_end(&entry.label(), info.name, "dependent"));
        }
        let previous = entry.principal(rel);
        if let Some(p) = principal {
            let target = self.live_entry(p)?;
            if target.is_owned() || target.entity != info.principal {
                return Err(wrong_end(&target.label(), info.name, "principal"));
            }
        }

        if let Some(old) = previous {
            if Some(old) != principal {
                self.remove_dependent(old, rel, dependent);
            }
        }
        if let (Some(p), RelationshipKind::OneToOne) = (principal, info.kind) {
            let displaced: Vec<EntryId> = self
                .entry(p)?
                .dependents(rel)
                .iter()
                .filter(|d| **d != dependent)
                .copied()
                .collect();
            for other in displaced {
                self.relink(other, rel, None)?;
            }
        }

        let key = match principal {
            Some(p) => {
                let members = self.entry_mut(p)?.dependents.entry(rel).or_default();
                if !members.contains(&dependent) {
                    members.push(dependent);
                }
                self.key_of(p)
            }
            None => Value::Null,
        };
        let entry = self.entry_mut(dependent)?;
        match principal {
            Some(p) => {
                entry.principals.insert(rel, p);
            }
            None => {
                entry.principals.remove(&rel);
            }
        }
        entry.values.insert(info.foreign_key, key);
        self.refresh_state(dependent);
        self.ensure_ownership(dependent)?;

        tracing::debug!(
            relationship = info.name,
            entry = %dependent,
            from = ?previous,
            to = ?principal,
            "Relinked dependent"
        );
        Ok(())
    }

    pub(crate) fn remove_dependent(&mut self, principal: EntryId, rel: RelationshipId, dependent: EntryId) {
        let Some(entry) = self.entries.get_mut(&principal) else {
            return;
        };
        if let Some(members) = entry.dependents.get_mut(&rel) {
            members.retain(|d| *d != dependent);
            if members.is_empty() {
                entry.dependents.remove(&rel);
            }
        }
    }

    /// Write a foreign-key value and fix up the link it implies.
    ///
    /// A key naming a tracked principal links to it. A key naming nothing
    /// tracked leaves the dependent unlinked with the raw value, to be
    /// verified against the store when saving.
    pub(crate) fn set_foreign_key(
        &mut self,
        dependent: EntryId,
        rel: RelationshipId,
        value: Value,
    ) -> Result<()> {
        if value.is_null() {
            return self.relink(dependent, rel, None);
        }
        let info = *self.schema.relationship(rel);
        if let Some(p) = self.identity.resolve(info.principal, &value) {
            if self.state(p) == EntryState::Deleted {
                return Err(Error::OrphanReference(OrphanError {
                    entity: info.dependent,
                    relationship: info.name,
                    foreign_key: value,
                }));
            }
            return self.relink(dependent, rel, Some(p));
        }

        if let Some(old) = self.live_entry(dependent)?.principal(rel) {
            self.remove_dependent(old, rel, dependent);
        }
        let stored = self.entry(dependent)?;
        let like = stored
            .original
            .as_ref()
            .and_then(|o| o.value(info.foreign_key))
            .or_else(|| stored.value(info.foreign_key))
            .filter(|v| !v.is_null())
            .cloned();
        let value = value.into_key_like(like.as_ref());
        let entry = self.entry_mut(dependent)?;
        entry.principals.remove(&rel);
        entry.values.insert(info.foreign_key, value);
        self.refresh_state(dependent);
        self.ensure_ownership(dependent)?;
        tracing::debug!(
            relationship = info.name,
            entry = %dependent,
            "Foreign key points outside the session"
        );
        Ok(())
    }

    /// Check that every owned value under `owner` still resolves through it.
    ///
    /// Read-only: states of owned entries are never touched here.
    pub(crate) fn ensure_ownership(&self, owner: EntryId) -> Result<()> {
        for (slot, owned) in self.owned.slots_of(owner) {
            let entry = self.entries.get(&owned);
            let intact = entry.is_some_and(|e| e.owner() == Some(owner) && e.slot() == Some(slot));
            if !intact {
                let root = self.get(owner).map_or("?", |e| e.entity);
                return Err(Error::LostOwnership(OwnershipError {
                    entity: root,
                    slot,
                    message: format!("slot no longer resolves to entry {}", owned),
                }));
            }
            self.ensure_ownership(owned)?;
        }
        Ok(())
    }

    /// Link a freshly loaded entity with tracked neighbours.
    ///
    /// Links are recorded in both the current state and the snapshots, since
    /// they describe what the store already holds. A one-to-one principal
    /// that the caller has already pointed elsewhere keeps its current link.
    pub(crate) fn fixup_loaded(&mut self, id: EntryId) -> Result<()> {
        let schema = std::sync::Arc::clone(&self.schema);
        let entity = self.entry(id)?.entity;

        for (rel, info) in schema.dependent_relationships(entity) {
            let fk = self.entry(id)?.values.get(info.foreign_key).cloned().unwrap_or(Value::Null);
            let Some(p) = self.identity.resolve(info.principal, &fk) else {
                continue;
            };
            if self.state(p) == EntryState::Deleted {
                continue;
            }
            self.link_loaded(p, rel, id, info.kind == RelationshipKind::OneToOne, true, true);
        }

        let key = self.key_of(id);
        for (rel, info) in schema.principal_relationships(entity) {
            let candidates: Vec<(EntryId, bool, bool)> = self
                .entries
                .values()
                .filter(|e| !e.is_owned() && e.entity == info.dependent && e.id != id)
                .filter_map(|e| {
                    let current = e.state.is_live()
                        && !e.principals.contains_key(&rel)
                        && e.values.get(info.foreign_key).is_some_and(|v| v.key_eq(&key));
                    let original = e.original.as_ref().is_some_and(|o| {
                        !o.principals.contains_key(&rel)
                            && o.values.get(info.foreign_key).is_some_and(|v| v.key_eq(&key))
                    });
                    (current || original).then_some((e.id, current, original))
                })
                .collect();
            for (dependent, current, original) in candidates {
                self.link_loaded(id, rel, dependent, info.kind == RelationshipKind::OneToOne, current, original);
            }
        }
        Ok(())
    }

    fn link_loaded(
        &mut self,
        principal: EntryId,
        rel: RelationshipId,
        dependent: EntryId,
        one_to_one: bool,
        current: bool,
        original: bool,
    ) {
        let occupied = one_to_one
            && self
                .get(principal)
                .is_some_and(|p| p.dependents(rel).iter().any(|d| *d != dependent));
        if current && occupied {
            tracing::warn!(
                principal = %principal,
                entry = %dependent,
                "Loaded one-to-one dependent conflicts with an in-session link; keeping the session's"
            );
        }
        let link_current = current && !occupied;

        if let Some(p) = self.entries.get_mut(&principal) {
            if link_current {
                let members = p.dependents.entry(rel).or_default();
                if !members.contains(&dependent) {
                    members.push(dependent);
                }
            }
            if original {
                if let Some(snapshot) = p.original.as_mut() {
                    let members = snapshot.dependents.entry(rel).or_default();
                    if !members.contains(&dependent) {
                        members.push(dependent);
                    }
                }
            }
        }
        if let Some(d) = self.entries.get_mut(&dependent) {
            if link_current {
                d.principals.insert(rel, principal);
            }
            if original {
                if let Some(snapshot) = d.original.as_mut() {
                    snapshot.principals.insert(rel, principal);
                }
            }
        }
        self.refresh_state(dependent);
    }

    // ========================================================================
    // Navigation API
    // ========================================================================

    fn navigation_of(&self, id: EntryId, navigation: &str) -> Result<Navigation> {
        let entry = self.entry(id)?;
        if entry.is_owned() {
            return Err(Error::schema(
                SchemaErrorKind::UnknownNavigation,
                format!("owned value {} has no navigations", entry.label()),
            ));
        }
        self.schema.navigation(entry.entity, navigation)
    }

    fn collection_navigation(&self, principal: EntryId, navigation: &str) -> Result<RelationshipId> {
        match self.navigation_of(principal, navigation)? {
            Navigation::Collection(rel) => Ok(rel),
            Navigation::PrincipalReference(_) | Navigation::DependentReference(_) => {
                Err(wrong_kind(navigation, "a collection"))
            }
        }
    }

    /// Add a dependent to a principal's collection, moving it if needed.
    pub fn add_to_collection(
        &mut self,
        principal: EntryId,
        navigation: &str,
        dependent: EntryId,
    ) -> Result<()> {
        let rel = self.collection_navigation(principal, navigation)?;
        self.relink(dependent, rel, Some(principal))
    }

    /// Remove a dependent from a principal's collection.
    ///
    /// Returns `false` when it was not a member.
    pub fn remove_from_collection(
        &mut self,
        principal: EntryId,
        navigation: &str,
        dependent: EntryId,
    ) -> Result<bool> {
        let rel = self.collection_navigation(principal, navigation)?;
        if self.entry(dependent)?.principal(rel) != Some(principal) {
            return Ok(false);
        }
        self.relink(dependent, rel, None)?;
        Ok(true)
    }

    /// Unlink every member of a collection, returning them in order.
    pub fn clear_collection(&mut self, principal: EntryId, navigation: &str) -> Result<Vec<EntryId>> {
        let rel = self.collection_navigation(principal, navigation)?;
        let members = self.entry(principal)?.dependents(rel).to_vec();
        for member in &members {
            if self.state(*member).is_live() {
                self.relink(*member, rel, None)?;
            }
        }
        Ok(members)
    }

    pub fn extend_collection<I>(&mut self, principal: EntryId, navigation: &str, dependents: I) -> Result<()>
    where
        I: IntoIterator<Item = EntryId>,
    {
        let rel = self.collection_navigation(principal, navigation)?;
        for dependent in dependents {
            self.relink(dependent, rel, Some(principal))?;
        }
        Ok(())
    }

    /// Live members of a collection, in insertion order.
    pub fn collection(&self, principal: EntryId, navigation: &str) -> Result<Vec<EntryId>> {
        let rel = self.collection_navigation(principal, navigation)?;
        Ok(self
            .entry(principal)?
            .dependents(rel)
            .iter()
            .copied()
            .filter(|d| self.state(*d).is_live())
            .collect())
    }

    /// Assign a reference navigation.
    ///
    /// On the dependent side this moves the dependent. On the principal side
    /// of a one-to-one relationship the current dependent is unlinked and the
    /// target (if any) linked in its place.
    pub fn set_reference(&mut self, id: EntryId, navigation: &str, target: Option<EntryId>) -> Result<()> {
        match self.navigation_of(id, navigation)? {
            Navigation::DependentReference(rel) => self.relink(id, rel, target),
            Navigation::PrincipalReference(rel) => {
                let current = self.entry(id)?.dependents(rel).to_vec();
                for dependent in current {
                    if Some(dependent) != target && self.state(dependent).is_live() {
                        self.relink(dependent, rel, None)?;
                    }
                }
                match target {
                    Some(dependent) => self.relink(dependent, rel, Some(id)),
                    None => Ok(()),
                }
            }
            Navigation::Collection(_) => Err(wrong_kind(navigation, "a reference")),
        }
    }

    /// Read a reference navigation.
    pub fn reference(&self, id: EntryId, navigation: &str) -> Result<Option<EntryId>> {
        let entry = self.entry(id)?;
        match self.navigation_of(id, navigation)? {
            Navigation::DependentReference(rel) => Ok(entry.principal(rel)),
            Navigation::PrincipalReference(rel) => Ok(entry
                .dependents(rel)
                .iter()
                .copied()
                .find(|d| self.state(*d).is_live())),
            Navigation::Collection(_) => Err(wrong_kind(navigation, "a reference")),
        }
    }
}

fn wrong_kind(navigation: &str, expected: &str) -> Error {
    Error::schema(
        SchemaErrorKind::WrongNavigationKind,
        format!("navigation '{}' is not {}", navigation, expected),
    )
}

fn wrong_end(label: &str, relationship: &str, end: &str) -> Error {
    Error::Custom(format!(
        "{} cannot be the {} of relationship '{}'",
        label, end, relationship
    ))
}
