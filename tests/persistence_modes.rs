use agndb::catalog::FieldCatalog;
use agndb::error::PortalError;
use agndb::execute::{Limits, Pagination};
use agndb::interface::{CancelToken, QueryInterface};
use agndb::persist::{PersistenceMode, Persistor, Store};
use agndb::query::QueryGroup;

fn setup() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agn.db").to_string_lossy().into_owned();
    (dir, path)
}

#[test]
fn in_memory_mode_allows_basic_operations() {
    let store = Store::open(PersistenceMode::InMemory).unwrap();
    assert!(store.is_in_memory());
    assert_eq!(store.describe(), "in-memory");
    assert_eq!(store.seed_demo(15, 4).unwrap(), 15);
    let interface = QueryInterface::new(FieldCatalog::agn(), store, Limits::default());
    let page = interface
        .search(&QueryGroup::default(), None, Pagination::new(0, 100), &CancelToken::new())
        .unwrap();
    assert_eq!(page.total, 15);
}

#[test]
fn file_mode_survives_reopening() {
    let (_dir, path) = setup();
    {
        let store = Store::open(PersistenceMode::File(path.clone())).unwrap();
        assert!(!store.is_in_memory());
        assert_eq!(store.describe(), path);
        assert_eq!(store.seed_demo(12, 5).unwrap(), 12);
    }
    let reopened = Store::open(PersistenceMode::File(path)).unwrap();
    // the schema is created idempotently and the demo data is not seeded twice
    assert_eq!(reopened.seed_demo(12, 5).unwrap(), 0);
    let connection = reopened.connect().unwrap();
    assert_eq!(Persistor::new(&connection).unwrap().source_count().unwrap(), 12);
}

#[test]
fn readers_refuse_writes() {
    let (_dir, path) = setup();
    let store = Store::open(PersistenceMode::File(path)).unwrap();
    let reader = store.reader().unwrap();
    let mut persistor = Persistor::new(&reader).unwrap();
    let result = persistor.add_source(1.0, 2.0);
    assert!(matches!(result, Err(PortalError::Store(_))));
}
