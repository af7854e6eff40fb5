//! Shared schema and seed data for the end-to-end tests.
#![allow(dead_code)]

use entitygraph::prelude::*;
use entitygraph::Row;

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn unwrap_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

/// Parents own a collection of children; each child carries an inline owned
/// value (with a nested one) and a table-stored contact. Holders reference at
/// most one item. Folders list documents that have no way back to their
/// folder. Orders and lines get their keys from the store.
pub fn schema() -> Arc<Schema> {
    let owned = OwnedType::new("OwnedData")
        .property(PropertyInfo::new("p1"))
        .property(PropertyInfo::new("p2"))
        .property(PropertyInfo::new("v"))
        .owned(OwnedSlot::inline("extra", OwnedType::new("Extra").property(PropertyInfo::new("tag"))));
    let contact = OwnedType::new("Contact").property(PropertyInfo::new("email"));
    let details = OwnedType::new("Details")
        .property(PropertyInfo::new("color"))
        .property(PropertyInfo::new("size"));
    let meta = OwnedType::new("Meta").property(PropertyInfo::new("author"));

    Arc::new(
        Schema::builder()
            .entity(
                EntityType::new("Parent", "parents")
                    .property(PropertyInfo::new("name"))
                    .property(PropertyInfo::new("version"))
                    .concurrency_token("version"),
            )
            .entity(
                EntityType::new("Child", "children")
                    .property(PropertyInfo::new("name"))
                    .owned(OwnedSlot::inline("owned", owned))
                    .owned(OwnedSlot::table("contact", contact, "child_contacts")),
            )
            .entity(EntityType::new("Holder", "holders").property(PropertyInfo::new("name")))
            .entity(
                EntityType::new("Item", "items")
                    .property(PropertyInfo::new("name"))
                    .owned(OwnedSlot::inline("details", details)),
            )
            .entity(EntityType::new("Folder", "folders"))
            .entity(
                EntityType::new("Document", "documents")
                    .property(PropertyInfo::new("title"))
                    .owned(OwnedSlot::table("meta", meta, "document_meta").owner_column("document_id")),
            )
            .entity(
                EntityType::new("Order", "orders")
                    .key_generation(KeyGeneration::Store)
                    .property(PropertyInfo::new("customer")),
            )
            .entity(
                EntityType::new("Line", "order_lines")
                    .key_generation(KeyGeneration::Store)
                    .property(PropertyInfo::new("sku")),
            )
            .relationship(
                RelationshipInfo::one_to_many("parent_children", "Parent", "Child", "parent_id")
                    .principal_navigation("children")
                    .dependent_navigation("parent"),
            )
            .relationship(
                RelationshipInfo::one_to_one("holder_item", "Holder", "Item", "holder_id")
                    .principal_navigation("item")
                    .dependent_navigation("holder"),
            )
            .relationship(
                RelationshipInfo::one_to_many("folder_documents", "Folder", "Document", "folder_id")
                    .principal_navigation("documents"),
            )
            .relationship(
                RelationshipInfo::one_to_many("order_lines", "Order", "Line", "order_id")
                    .principal_navigation("lines")
                    .dependent_navigation("order")
                    .required(true),
            )
            .build()
            .expect("valid schema"),
    )
}

/// Parents 1 and 2; children 10 and 11 under parent 1 with owned values and
/// contacts; holders 1 and 2 with item 20 under holder 1; folders 1 and 2 with
/// document 30 in folder 1.
pub fn seeded(schema: &Schema) -> MemoryStore {
    let store = MemoryStore::enforcing(schema);
    for (id, name) in [(1, "A"), (2, "B")] {
        store.put(
            "parents",
            [
                ("id", Value::BigInt(id)),
                ("name", Value::from(name)),
                ("version", Value::BigInt(1)),
            ],
        );
    }
    for (id, v) in [(10, 42), (11, 7)] {
        store.put(
            "children",
            [
                ("id", Value::BigInt(id)),
                ("name", Value::from(format!("child-{id}"))),
                ("parent_id", Value::BigInt(1)),
                ("owned_p1", Value::from("X")),
                ("owned_p2", Value::from("Y")),
                ("owned_v", Value::BigInt(v)),
                ("owned_extra_tag", Value::from("t")),
            ],
        );
        store.put(
            "child_contacts",
            [
                ("owner_id", Value::BigInt(id)),
                ("slot", Value::from("contact")),
                ("email", Value::from(format!("{id}@example.test"))),
            ],
        );
    }
    for (id, name) in [(1, "first"), (2, "second")] {
        store.put("holders", [("id", Value::BigInt(id)), ("name", Value::from(name))]);
    }
    store.put(
        "items",
        [
            ("id", Value::BigInt(20)),
            ("name", Value::from("widget")),
            ("holder_id", Value::BigInt(1)),
            ("details_color", Value::from("red")),
            ("details_size", Value::BigInt(3)),
        ],
    );
    for id in [1, 2] {
        store.put("folders", [("id", Value::BigInt(id))]);
    }
    store.put(
        "documents",
        [
            ("id", Value::BigInt(30)),
            ("title", Value::from("notes")),
            ("folder_id", Value::BigInt(1)),
        ],
    );
    store.put(
        "document_meta",
        [
            ("document_id", Value::BigInt(30)),
            ("slot", Value::from("meta")),
            ("author", Value::from("ann")),
        ],
    );
    store
}

/// The owned value every seeded child starts with, for child `v`.
pub fn seeded_owned(v: i64) -> OwnedValue {
    OwnedValue::new()
        .with("p1", "X")
        .with("p2", "Y")
        .with("v", v)
        .with_owned("extra", OwnedValue::new().with("tag", "t"))
}

/// The committed row of `table` whose `column` equals `value`.
pub fn stored_row(store: &MemoryStore, table: &str, column: &str, value: &Value) -> Option<Row> {
    store
        .rows(table)
        .into_iter()
        .find(|row| row.get_by_name(column).is_some_and(|v| v.key_eq(value)))
}
