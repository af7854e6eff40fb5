//! Entity and owned-value descriptors.
//!
//! Descriptors are plain data built once, validated by
//! [`SchemaBuilder::build`](crate::schema::SchemaBuilder::build) and then
//! shared read-only. Properties use const builders in the same style as
//! relationship descriptors.

/// Metadata about a scalar property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyInfo {
    /// Property name used by the session API
    pub name: &'static str,
    /// Stored column name (may differ from the property name)
    pub column_name: &'static str,
    /// Whether the property accepts `Null`
    pub nullable: bool,
    /// Shadow properties exist only in the tracker and the store, never on
    /// the caller's model (e.g. a foreign key with no declared field)
    pub shadow: bool,
}

impl PropertyInfo {
    /// Create a nullable property stored under its own name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            column_name: name,
            nullable: true,
            shadow: false,
        }
    }

    /// Set the stored column name.
    pub const fn column(mut self, column_name: &'static str) -> Self {
        self.column_name = column_name;
        self
    }

    /// Set whether the property accepts `Null`.
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Mark this property as a shadow property.
    pub const fn shadow(mut self, value: bool) -> Self {
        self.shadow = value;
        self
    }
}

/// How an entity's key is produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyGeneration {
    /// The caller assigns the key before saving.
    #[default]
    Client,
    /// The store hands out the key while a save is being planned.
    Store,
}

/// Where an owned slot is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedStorage {
    /// Columns on the owner's row, named `{slot}_{column}`.
    Inline,
    /// A child row keyed by `(owner key, slot name)`.
    Table {
        table: &'static str,
        owner_column: &'static str,
        slot_column: &'static str,
    },
}

/// Shape of an owned value: scalar properties plus nested owned slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedType {
    pub name: &'static str,
    pub properties: Vec<PropertyInfo>,
    pub slots: Vec<OwnedSlot>,
}

impl OwnedType {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            properties: Vec::new(),
            slots: Vec::new(),
        }
    }

    /// Add a scalar property.
    pub fn property(mut self, property: PropertyInfo) -> Self {
        self.properties.push(property);
        self
    }

    /// Add a nested owned slot.
    pub fn owned(mut self, slot: OwnedSlot) -> Self {
        self.slots.push(slot);
        self
    }

    pub fn find_property(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn find_slot(&self, name: &str) -> Option<&OwnedSlot> {
        self.slots.iter().find(|s| s.name == name)
    }
}

/// A named slot holding at most one owned value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedSlot {
    pub name: &'static str,
    pub owned: OwnedType,
    pub storage: OwnedStorage,
}

impl OwnedSlot {
    /// A slot persisted as columns on the owner's row.
    pub fn inline(name: &'static str, owned: OwnedType) -> Self {
        Self {
            name,
            owned,
            storage: OwnedStorage::Inline,
        }
    }

    /// A slot persisted as a child row in `table`.
    ///
    /// The child row is keyed by `owner_id` and `slot` unless renamed with
    /// [`OwnedSlot::owner_column`] / [`OwnedSlot::slot_column`].
    pub fn table(name: &'static str, owned: OwnedType, table: &'static str) -> Self {
        Self {
            name,
            owned,
            storage: OwnedStorage::Table {
                table,
                owner_column: "owner_id",
                slot_column: "slot",
            },
        }
    }

    /// Rename the owner key column of a table-stored slot.
    pub fn owner_column(mut self, column: &'static str) -> Self {
        if let OwnedStorage::Table { owner_column, .. } = &mut self.storage {
            *owner_column = column;
        }
        self
    }

    /// Rename the slot discriminator column of a table-stored slot.
    pub fn slot_column(mut self, column: &'static str) -> Self {
        if let OwnedStorage::Table { slot_column, .. } = &mut self.storage {
            *slot_column = column;
        }
        self
    }

    pub const fn is_inline(&self) -> bool {
        matches!(self.storage, OwnedStorage::Inline)
    }

    /// Column prefix for this slot's properties when stored inline under
    /// `parent_prefix`.
    pub fn column_prefix(&self, parent_prefix: &str) -> String {
        format!("{}{}_", parent_prefix, self.name)
    }
}

/// Descriptor of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityType {
    pub name: &'static str,
    pub table: &'static str,
    /// Name of the key property
    pub key: &'static str,
    pub key_generation: KeyGeneration,
    pub properties: Vec<PropertyInfo>,
    pub slots: Vec<OwnedSlot>,
    /// Property compared on update/delete for optimistic concurrency
    pub concurrency_token: Option<&'static str>,
}

impl EntityType {
    /// Create an entity type keyed by an `id` property.
    pub fn new(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            table,
            key: "id",
            key_generation: KeyGeneration::Client,
            properties: Vec::new(),
            slots: Vec::new(),
            concurrency_token: None,
        }
    }

    /// Set the key property name.
    pub fn key(mut self, key: &'static str) -> Self {
        self.key = key;
        self
    }

    pub fn key_generation(mut self, generation: KeyGeneration) -> Self {
        self.key_generation = generation;
        self
    }

    /// Add a scalar property.
    pub fn property(mut self, property: PropertyInfo) -> Self {
        self.properties.push(property);
        self
    }

    /// Add an owned slot.
    pub fn owned(mut self, slot: OwnedSlot) -> Self {
        self.slots.push(slot);
        self
    }

    /// Declare the optimistic concurrency token property.
    pub fn concurrency_token(mut self, property: &'static str) -> Self {
        self.concurrency_token = Some(property);
        self
    }

    pub fn find_property(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn find_slot(&self, name: &str) -> Option<&OwnedSlot> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// Stored column of the key property.
    pub fn key_column(&self) -> &'static str {
        self.find_property(self.key)
            .map_or(self.key, |p| p.column_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_builder() {
        let p = PropertyInfo::new("zip_code").column("zip").nullable(false);
        assert_eq!(p.name, "zip_code");
        assert_eq!(p.column_name, "zip");
        assert!(!p.nullable);
        assert!(!p.shadow);
    }

    #[test]
    fn table_slot_columns_can_be_renamed() {
        let slot = OwnedSlot::table("profile", OwnedType::new("Profile"), "profiles")
            .owner_column("manager_id")
            .slot_column("kind");
        assert_eq!(
            slot.storage,
            OwnedStorage::Table {
                table: "profiles",
                owner_column: "manager_id",
                slot_column: "kind",
            }
        );
        assert!(!slot.is_inline());
    }

    #[test]
    fn inline_prefixes_nest() {
        let geo = OwnedSlot::inline("geo", OwnedType::new("Geo"));
        let address = OwnedSlot::inline("address", OwnedType::new("Address").owned(geo));
        let prefix = address.column_prefix("");
        assert_eq!(prefix, "address_");
        let nested = address.owned.find_slot("geo").map(|s| s.column_prefix(&prefix));
        assert_eq!(nested.as_deref(), Some("address_geo_"));
    }

    #[test]
    fn key_column_follows_property_rename() {
        let entity = EntityType::new("Employee", "employees")
            .key("employee_id")
            .property(PropertyInfo::new("employee_id").column("emp_id"));
        assert_eq!(entity.key_column(), "emp_id");
    }
}
