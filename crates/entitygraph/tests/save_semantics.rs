//! Identity, ordering, atomicity and conflict handling of saves.

mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{schema, seeded, stored_row, unwrap_err, unwrap_outcome};
use entitygraph::prelude::*;
use std::sync::Mutex;

#[test]
fn identity_map_yields_one_entry_per_key() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = seeded(&schema);

    rt.block_on(async {
        let mut session = Session::new(store.clone(), Arc::clone(&schema));
        let p = unwrap_outcome(session.load(&cx, "Parent", Value::BigInt(1), &Include::new().with("children")).await).unwrap();
        let via_collection = session.collection(p, "children").unwrap();
        let direct = unwrap_outcome(session.load(&cx, "Child", Value::Int(10), &Include::new()).await).unwrap();
        assert_eq!(direct, via_collection[0]);

        let all = unwrap_outcome(session.load_all(&cx, "Child", &Include::new().with("parent")).await);
        assert_eq!(all, via_collection);
        assert_eq!(session.debug_state().identities, 3);

        let err = session.add("Child", [("id", Value::BigInt(10))]).unwrap_err();
        assert!(matches!(err, Error::DuplicateIdentity(_)));
    });
}

#[test]
fn unchanged_session_issues_no_storage_calls() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = seeded(&schema);

    rt.block_on(async {
        let mut session = Session::new(store.clone(), Arc::clone(&schema));
        let everything = Include::new().with_nested("children", Include::new().with("parent"));
        unwrap_outcome(session.load_all(&cx, "Parent", &everything).await);
        unwrap_outcome(session.load_all(&cx, "Holder", &Include::new().with("item")).await);
        assert_eq!(session.detect_changes(), 0);

        let before = store.stats();
        let result = unwrap_outcome(session.save(&cx).await);
        assert_eq!(result.total(), 0);
        assert_eq!(store.stats(), before);

        let result = unwrap_outcome(session.save(&cx).await);
        assert_eq!(result.total(), 0);
        assert_eq!(store.stats(), before);
    });
}

#[test]
fn store_generated_keys_flow_into_dependents() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = MemoryStore::enforcing(&schema);

    rt.block_on(async {
        let mut session = Session::new(store.clone(), Arc::clone(&schema));
        let order = session.add("Order", [("customer", Value::from("ann"))]).unwrap();
        let first = session.add("Line", [("sku", Value::from("A-1"))]).unwrap();
        let second = session.add("Line", [("sku", Value::from("B-2"))]).unwrap();
        session.extend_collection(order, "lines", [first, second]).unwrap();
        assert_eq!(session.property(order, "id").unwrap(), &Value::Null);
        assert_eq!(session.reference(second, "order").unwrap(), Some(order));

        let result = unwrap_outcome(session.save(&cx).await);
        assert_eq!(result.inserted, 3);
        assert_eq!(store.stats().keys, 3);

        assert_eq!(session.property(order, "id").unwrap(), &Value::BigInt(1));
        assert_eq!(session.property(first, "order_id").unwrap(), &Value::BigInt(1));
        assert_eq!(session.property(second, "order_id").unwrap(), &Value::BigInt(1));
        assert_eq!(session.resolve("Order", Value::BigInt(1)).unwrap(), Some(order));
        assert_eq!(session.resolve("Line", Value::BigInt(2)).unwrap(), Some(second));
        assert_eq!(session.state(order), EntryState::Unchanged);
        assert_eq!(store.rows("order_lines").len(), 2);
    });
}

#[test]
fn required_dependent_without_principal_is_rejected_before_storage() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = MemoryStore::enforcing(&schema);

    rt.block_on(async {
        let mut session = Session::new(store.clone(), Arc::clone(&schema));
        let line = session.add("Line", [("sku", Value::from("A-1"))]).unwrap();
        let err = unwrap_err(session.save(&cx).await);
        assert!(matches!(err, Error::OrphanReference(_)), "{err}");
        assert_eq!(session.state(line), EntryState::Added);
        assert_eq!(store.stats().begins, 0);
    });
}

#[test]
fn required_relationship_cascades_deletes() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = MemoryStore::enforcing(&schema);

    rt.block_on(async {
        let mut session = Session::new(store.clone(), Arc::clone(&schema));
        let order = session.add("Order", [("customer", Value::from("ann"))]).unwrap();
        let line = session.add("Line", [("sku", Value::from("A-1"))]).unwrap();
        session.set_reference(line, "order", Some(order)).unwrap();
        unwrap_outcome(session.save(&cx).await);

        session.delete(order).unwrap();
        assert_eq!(session.state(line), EntryState::Deleted);
        let result = unwrap_outcome(session.save(&cx).await);
        assert_eq!(result.deleted, 2);
        assert!(store.rows("orders").is_empty());
        assert!(store.rows("order_lines").is_empty());
    });
}

#[test]
fn optional_relationship_nulls_dependents_on_delete() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = seeded(&schema);

    rt.block_on(async {
        let mut session = Session::new(store.clone(), Arc::clone(&schema));
        let a = unwrap_outcome(session.load(&cx, "Parent", Value::BigInt(1), &Include::new().with("children")).await).unwrap();
        let children = session.collection(a, "children").unwrap();

        session.delete(a).unwrap();
        for child in &children {
            assert_eq!(session.reference(*child, "parent").unwrap(), None);
            assert_eq!(session.state(*child), EntryState::Modified);
            assert_eq!(session.owned_state(*child, "owned").unwrap(), EntryState::Unchanged);
        }

        let result = unwrap_outcome(session.save(&cx).await);
        assert_eq!(result.updated, 2);
        assert_eq!(result.deleted, 1);
        assert!(stored_row(&store, "parents", "id", &Value::BigInt(1)).is_none());
        let row = stored_row(&store, "children", "id", &Value::BigInt(10)).unwrap();
        assert_eq!(row.get_by_name("parent_id"), Some(&Value::Null));
        assert_eq!(row.get_by_name("owned_v"), Some(&Value::BigInt(42)));
    });
}

#[test]
fn delete_without_cascade_leaves_orphans_to_the_save() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = seeded(&schema);

    rt.block_on(async {
        let config = SessionConfig::new().cascade_deletes(false);
        let mut session = Session::with_config(store.clone(), Arc::clone(&schema), config);
        let a = unwrap_outcome(session.load(&cx, "Parent", Value::BigInt(1), &Include::new().with("children")).await).unwrap();
        let child = session.collection(a, "children").unwrap()[0];

        session.delete(a).unwrap();
        assert_eq!(session.state(child), EntryState::Unchanged);
        let err = unwrap_err(session.save(&cx).await);
        assert!(matches!(err, Error::OrphanReference(_)), "{err}");
        assert_eq!(store.stats().begins, 0);
    });
}

#[test]
fn stale_concurrency_token_fails_the_second_writer() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = seeded(&schema);

    rt.block_on(async {
        let mut first = Session::new(store.clone(), Arc::clone(&schema));
        let mut second = Session::new(store.clone(), Arc::clone(&schema));
        let a1 = unwrap_outcome(first.load(&cx, "Parent", Value::BigInt(1), &Include::new()).await).unwrap();
        let a2 = unwrap_outcome(second.load(&cx, "Parent", Value::BigInt(1), &Include::new()).await).unwrap();

        first.set_property(a1, "name", "first writer").unwrap();
        unwrap_outcome(first.save(&cx).await);
        assert_eq!(first.property(a1, "version").unwrap(), &Value::BigInt(2));

        second.set_property(a2, "name", "second writer").unwrap();
        let err = unwrap_err(second.save(&cx).await);
        assert!(err.is_conflict(), "{err}");
        assert!(err.is_retryable());
        assert_eq!(second.state(a2), EntryState::Modified);

        let row = stored_row(&store, "parents", "id", &Value::BigInt(1)).unwrap();
        assert_eq!(row.get_by_name("name"), Some(&Value::from("first writer")));
        assert_eq!(row.get_by_name("version"), Some(&Value::BigInt(2)));
    });
}

#[test]
fn unknown_principal_key_is_an_orphan_reference() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = seeded(&schema);

    rt.block_on(async {
        let mut session = Session::new(store.clone(), Arc::clone(&schema));
        let e = unwrap_outcome(session.load(&cx, "Child", Value::BigInt(10), &Include::new()).await).unwrap();
        session.set_property(e, "parent_id", Value::BigInt(99)).unwrap();
        let err = unwrap_err(session.save(&cx).await);
        assert!(matches!(err, Error::OrphanReference(_)), "{err}");

        // Without the check the store's own constraint rejects the batch.
        let dump = store.dump();
        let config = SessionConfig::new().verify_references(false);
        let mut unchecked = Session::with_config(store.clone(), Arc::clone(&schema), config);
        let e = unwrap_outcome(unchecked.load(&cx, "Child", Value::BigInt(10), &Include::new()).await).unwrap();
        unchecked.set_property(e, "parent_id", Value::BigInt(99)).unwrap();
        let err = unwrap_err(unchecked.save(&cx).await);
        assert!(matches!(err, Error::Storage(_)), "{err}");
        assert_eq!(store.dump(), dump);
    });
}

#[test]
fn failed_batch_leaves_store_and_session_untouched() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = seeded(&schema);

    rt.block_on(async {
        let mut session = Session::new(store.clone(), Arc::clone(&schema));
        let include = Include::new().with("children");
        let a = unwrap_outcome(session.load(&cx, "Parent", Value::BigInt(1), &include).await).unwrap();
        let b = unwrap_outcome(session.load(&cx, "Parent", Value::BigInt(2), &include).await).unwrap();
        let moved = session.collection(a, "children").unwrap()[0];
        let removed = session.collection(a, "children").unwrap()[1];
        session.add_to_collection(b, "children", moved).unwrap();
        session.delete(removed).unwrap();
        let added = session.add("Parent", [("id", Value::BigInt(3))]).unwrap();
        let before = session.entries();

        let dump = store.dump();
        store.inject_failure(2);
        let err = unwrap_err(session.save(&cx).await);
        assert!(matches!(err, Error::Storage(_)), "{err}");
        assert_eq!(store.dump(), dump);
        assert_eq!(session.entries(), before);
        assert_eq!(session.state(added), EntryState::Added);
        assert_eq!(session.state(moved), EntryState::Modified);
        assert_eq!(session.state(removed), EntryState::Deleted);

        let result = unwrap_outcome(session.save(&cx).await);
        assert_eq!(result.inserted, 1);
        assert_eq!(result.updated, 1);
        // The removed child and its contact row.
        assert_eq!(result.deleted, 2);
        assert_eq!(session.collection(b, "children").unwrap(), vec![moved]);
    });
}

#[test]
fn lifecycle_callbacks_observe_saves() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = seeded(&schema);
    let events = Arc::new(Mutex::new(Vec::new()));

    let mut session = Session::new(store.clone(), Arc::clone(&schema));
    for (name, event) in [("before", 0), ("after", 1), ("rollback", 2)] {
        let log = Arc::clone(&events);
        let record = move || {
            log.lock().expect("lock poisoned").push(name);
            Ok(())
        };
        match event {
            0 => session.on_before_save(record),
            1 => session.on_after_save(record),
            _ => session.on_after_rollback(record),
        }
    }

    rt.block_on(async {
        let a = unwrap_outcome(session.load(&cx, "Parent", Value::BigInt(1), &Include::new()).await).unwrap();
        session.set_property(a, "name", "renamed").unwrap();
        store.inject_failure(0);
        unwrap_err(session.save(&cx).await);
        unwrap_outcome(session.save(&cx).await);
    });

    assert_eq!(
        *events.lock().expect("lock poisoned"),
        vec!["before", "rollback", "before", "after"]
    );
}

#[test]
fn failing_before_save_callback_aborts() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = seeded(&schema);

    let mut session = Session::new(store.clone(), Arc::clone(&schema));
    session.on_before_save(|| Err(Error::Custom("read-only unit of work".to_string())));

    rt.block_on(async {
        let a = unwrap_outcome(session.load(&cx, "Parent", Value::BigInt(1), &Include::new()).await).unwrap();
        session.set_property(a, "name", "renamed").unwrap();
        let err = unwrap_err(session.save(&cx).await);
        assert!(matches!(err, Error::Custom(_)));
        assert_eq!(session.state(a), EntryState::Modified);
        assert_eq!(store.stats().begins, 0);
    });
}

#[test]
fn diagnostics_list_entities_and_owned_values() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let schema = schema();
    let store = seeded(&schema);

    rt.block_on(async {
        let mut session = Session::new(store.clone(), Arc::clone(&schema));
        let e = unwrap_outcome(session.load(&cx, "Child", Value::BigInt(10), &Include::new()).await).unwrap();
        session.set_property(e, "name", "renamed").unwrap();

        let labels: Vec<String> = session.entries().into_iter().map(|v| v.label).collect();
        assert_eq!(labels, vec!["Child", "Child.owned", "Child.owned.extra", "Child.contact"]);
        let views = session.entries();
        assert!(views[1..].iter().all(|v| v.owner.is_some() && v.state == EntryState::Unchanged));
        assert_eq!(views[0].state, EntryState::Modified);

        let diff = session.diff(e).unwrap();
        assert_eq!(diff.changed_properties(), vec!["name"]);
        assert_eq!(diff.property("name").unwrap().original, Value::from("child-10"));

        let info = session.debug_state();
        assert_eq!(info.tracked, 4);
        assert_eq!(info.owned, 3);
        assert_eq!(info.pending.modified, 1);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["pending"]["modified"], 1);

        session.reset();
        assert!(session.entries().is_empty());
        assert_eq!(session.resolve("Child", Value::BigInt(10)).unwrap(), None);
    });
}
