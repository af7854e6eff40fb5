//! The validated schema shared by every session.
//!
//! [`Schema`] owns all entity and relationship descriptors plus the
//! navigation table derived from them. Fixup dispatches on this table:
//! a navigation name resolves to the relationship it views and to the side
//! of that relationship it sits on.

use crate::entity::{EntityType, OwnedSlot, OwnedStorage, OwnedType, PropertyInfo};
use crate::error::{Error, Result, SchemaErrorKind};
use crate::relationship::RelationshipInfo;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Index of a relationship inside its [`Schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RelationshipId(usize);

impl RelationshipId {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// A navigation name resolved against the relationship it views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation {
    /// Principal-side collection of a one-to-many relationship
    Collection(RelationshipId),
    /// Principal-side reference of a one-to-one relationship
    PrincipalReference(RelationshipId),
    /// Dependent-side reference to the principal
    DependentReference(RelationshipId),
}

impl Navigation {
    pub const fn relationship(self) -> RelationshipId {
        match self {
            Navigation::Collection(id)
            | Navigation::PrincipalReference(id)
            | Navigation::DependentReference(id) => id,
        }
    }
}

/// Validated entity and relationship descriptors.
#[derive(Debug, Clone)]
pub struct Schema {
    entities: BTreeMap<&'static str, EntityType>,
    relationships: Vec<RelationshipInfo>,
    /// entity -> navigation name -> navigation
    navigations: HashMap<&'static str, HashMap<&'static str, Navigation>>,
    /// entity -> foreign-key property -> relationships using it
    foreign_keys: HashMap<&'static str, HashMap<&'static str, Vec<RelationshipId>>>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Look up an entity type by name.
    pub fn entity(&self, name: &str) -> Result<&EntityType> {
        self.entities.get(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownEntity,
                format!("unknown entity type '{}'", name),
            )
        })
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityType> {
        self.entities.values()
    }

    /// Get a relationship by id.
    ///
    /// Ids are only handed out by this schema, so indexing cannot miss.
    pub fn relationship(&self, id: RelationshipId) -> &RelationshipInfo {
        &self.relationships[id.0]
    }

    pub fn relationships(&self) -> impl Iterator<Item = (RelationshipId, &RelationshipInfo)> {
        self.relationships
            .iter()
            .enumerate()
            .map(|(i, r)| (RelationshipId(i), r))
    }

    /// Relationships in which `entity` is the dependent.
    pub fn dependent_relationships<'a>(
        &'a self,
        entity: &'a str,
    ) -> impl Iterator<Item = (RelationshipId, &'a RelationshipInfo)> + 'a {
        self.relationships().filter(move |(_, r)| r.dependent == entity)
    }

    /// Relationships in which `entity` is the principal.
    pub fn principal_relationships<'a>(
        &'a self,
        entity: &'a str,
    ) -> impl Iterator<Item = (RelationshipId, &'a RelationshipInfo)> + 'a {
        self.relationships().filter(move |(_, r)| r.principal == entity)
    }

    /// Resolve a navigation name on an entity type.
    pub fn navigation(&self, entity: &str, name: &str) -> Result<Navigation> {
        let entity = self.entity(entity)?.name;
        let found = self
            .navigations
            .get(entity)
            .and_then(|navs| navs.get(name))
            .copied();
        found.ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownNavigation,
                format!("'{}' has no navigation '{}'", entity, name),
            )
        })
    }

    /// Relationships whose foreign key is `property` on `entity`.
    pub fn relationships_for_foreign_key(&self, entity: &str, property: &str) -> &[RelationshipId] {
        self.foreign_keys
            .get(entity)
            .and_then(|fks| fks.get(property))
            .map_or(&[], Vec::as_slice)
    }

    /// Resolve the owned slot reached by `path` from `entity`.
    ///
    /// `path` lists slot names from the entity down to the slot itself.
    pub fn owned_slot(&self, entity: &str, path: &[&str]) -> Result<&OwnedSlot> {
        let entity_type = self.entity(entity)?;
        let unknown = || {
            Error::schema(
                SchemaErrorKind::UnknownSlot,
                format!("'{}' has no owned slot '{}'", entity, path.join(".")),
            )
        };
        let (first, rest) = path.split_first().ok_or_else(unknown)?;
        let mut slot = entity_type.find_slot(first).ok_or_else(unknown)?;
        for name in rest {
            slot = slot.owned.find_slot(name).ok_or_else(unknown)?;
        }
        Ok(slot)
    }

    /// Resolve the owned type stored in the slot reached by `path`.
    pub fn owned_type(&self, entity: &str, path: &[&str]) -> Result<&OwnedType> {
        self.owned_slot(entity, path).map(|slot| &slot.owned)
    }
}

/// Builder collecting descriptors before validation.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    entities: Vec<EntityType>,
    relationships: Vec<RelationshipInfo>,
}

impl SchemaBuilder {
    pub fn entity(mut self, entity: EntityType) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn relationship(mut self, relationship: RelationshipInfo) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Validate the descriptors and derive the navigation table.
    ///
    /// Undeclared key properties are added as non-nullable properties and
    /// undeclared foreign keys as shadow properties.
    pub fn build(self) -> Result<Schema> {
        let mut entities = BTreeMap::new();
        for mut entity in self.entities {
            if entity.find_property(entity.key).is_none() {
                entity
                    .properties
                    .insert(0, PropertyInfo::new(entity.key).nullable(false));
            }
            validate_entity(&entity)?;
            if entities.insert(entity.name, entity).is_some() {
                return Err(invalid("entity type registered twice"));
            }
        }

        let mut navigations = HashMap::new();
        let mut foreign_keys: HashMap<&'static str, HashMap<&'static str, Vec<RelationshipId>>> =
            HashMap::new();
        let mut names = BTreeSet::new();
        for (index, rel) in self.relationships.iter().enumerate() {
            let id = RelationshipId(index);
            if !names.insert(rel.name) {
                return Err(invalid(format!("relationship '{}' declared twice", rel.name)));
            }
            if !entities.contains_key(rel.principal) {
                return Err(unknown_entity(rel.principal, rel.name));
            }
            let dependent = entities
                .get_mut(rel.dependent)
                .ok_or_else(|| unknown_entity(rel.dependent, rel.name))?;
            if rel.foreign_key == dependent.key {
                return Err(invalid(format!(
                    "relationship '{}' uses the key of '{}' as its foreign key",
                    rel.name, rel.dependent
                )));
            }
            if dependent.find_property(rel.foreign_key).is_none() {
                tracing::debug!(
                    entity = rel.dependent,
                    property = rel.foreign_key,
                    "adding shadow foreign key property"
                );
                dependent
                    .properties
                    .push(PropertyInfo::new(rel.foreign_key).shadow(true));
            }
            foreign_keys
                .entry(rel.dependent)
                .or_default()
                .entry(rel.foreign_key)
                .or_default()
                .push(id);

            if let Some(nav) = rel.principal_navigation {
                let kind = if rel.is_collection() {
                    Navigation::Collection(id)
                } else {
                    Navigation::PrincipalReference(id)
                };
                register_navigation(&entities, &mut navigations, rel.principal, nav, kind)?;
            }
            if let Some(nav) = rel.dependent_navigation {
                register_navigation(
                    &entities,
                    &mut navigations,
                    rel.dependent,
                    nav,
                    Navigation::DependentReference(id),
                )?;
            }
        }

        tracing::debug!(
            entities = entities.len(),
            relationships = self.relationships.len(),
            "schema built"
        );

        Ok(Schema {
            entities,
            relationships: self.relationships,
            navigations,
            foreign_keys,
        })
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::schema(SchemaErrorKind::Invalid, message)
}

fn unknown_entity(entity: &str, relationship: &str) -> Error {
    Error::schema(
        SchemaErrorKind::UnknownEntity,
        format!(
            "relationship '{}' refers to unknown entity type '{}'",
            relationship, entity
        ),
    )
}

fn register_navigation(
    entities: &BTreeMap<&'static str, EntityType>,
    navigations: &mut HashMap<&'static str, HashMap<&'static str, Navigation>>,
    entity: &'static str,
    name: &'static str,
    navigation: Navigation,
) -> Result<()> {
    if let Some(entity_type) = entities.get(entity) {
        if entity_type.find_property(name).is_some() || entity_type.find_slot(name).is_some() {
            return Err(invalid(format!(
                "navigation '{}' on '{}' collides with a property or owned slot",
                name, entity
            )));
        }
    }
    if navigations
        .entry(entity)
        .or_default()
        .insert(name, navigation)
        .is_some()
    {
        return Err(invalid(format!(
            "navigation '{}' declared twice on '{}'",
            name, entity
        )));
    }
    Ok(())
}

fn validate_entity(entity: &EntityType) -> Result<()> {
    let mut names = BTreeSet::new();
    for property in &entity.properties {
        if !names.insert(property.name) {
            return Err(invalid(format!(
                "property '{}' declared twice on '{}'",
                property.name, entity.name
            )));
        }
    }
    if let Some(token) = entity.concurrency_token {
        if entity.find_property(token).is_none() {
            return Err(invalid(format!(
                "concurrency token '{}' is not a property of '{}'",
                token, entity.name
            )));
        }
    }
    for slot in &entity.slots {
        if !names.insert(slot.name) {
            return Err(invalid(format!(
                "owned slot '{}' collides with another member of '{}'",
                slot.name, entity.name
            )));
        }
        validate_owned(entity.name, slot, false)?;
    }
    Ok(())
}

fn validate_owned(entity: &str, slot: &OwnedSlot, nested: bool) -> Result<()> {
    if nested && !slot.is_inline() {
        return Err(invalid(format!(
            "nested owned slot '{}' on '{}' must be stored inline",
            slot.name, entity
        )));
    }
    let mut names = BTreeSet::new();
    for property in &slot.owned.properties {
        if !names.insert(property.name) {
            return Err(invalid(format!(
                "property '{}' declared twice on owned type '{}'",
                property.name, slot.owned.name
            )));
        }
    }
    if let OwnedStorage::Table {
        owner_column,
        slot_column,
        ..
    } = slot.storage
    {
        let collides = slot
            .owned
            .properties
            .iter()
            .any(|p| p.column_name == owner_column || p.column_name == slot_column);
        if collides || owner_column == slot_column {
            return Err(invalid(format!(
                "owned table columns of slot '{}' on '{}' collide",
                slot.name, entity
            )));
        }
    }
    for child in &slot.owned.slots {
        if !names.insert(child.name) {
            return Err(invalid(format!(
                "owned slot '{}' collides with another member of '{}'",
                child.name, slot.owned.name
            )));
        }
        validate_owned(entity, child, true)?;
    }
    Ok(())
}
