use std::collections::HashSet;

use agndb::catalog::FieldCatalog;
use agndb::datatype::CellValue;
use agndb::error::PortalError;
use agndb::execute::{Limits, Pagination};
use agndb::interface::{CancelToken, QueryInterface, SearchPage};
use agndb::persist::{ClassificationRecord, PersistenceMode, Persistor, PhotometryRecord, RedshiftRecord, Store};
use agndb::query::{Combinator, Operator, QueryGroup, QueryRule, RuleValue};
use agndb::translate::{SortDirection, SortSpec};

const SOURCES: usize = 100;

fn declination(i: usize) -> f64 {
    -45.0 + 105.0 * i as f64 / (SOURCES - 1) as f64
}

fn has_measured_redshift(i: usize) -> bool {
    i % 3 == 0
}

/// 100 sources with declinations spanning -45..+60. Every third source has a
/// redshift of i/30, every seventh a second photometric one of 0.1; every
/// fifth is a Quasar and the one after it a Seyfert 2.
fn setup() -> QueryInterface {
    let store = Store::open(PersistenceMode::InMemory).unwrap();
    {
        let connection = store.connect().unwrap();
        let mut persistor = Persistor::new(&connection).unwrap();
        for i in 0..SOURCES {
            let id = persistor.add_source(i as f64 * 3.6, declination(i)).unwrap();
            if has_measured_redshift(i) {
                let mut redshift = RedshiftRecord::new("spectroscopic", i as f64 / 30.0);
                redshift.z_error = if i % 2 == 0 { Some(0.01) } else { None };
                persistor.add_redshift(id, &redshift).unwrap();
            }
            if i % 7 == 0 {
                let mut redshift = RedshiftRecord::new("photometric", 0.1);
                redshift.z_error = Some(0.05);
                persistor.add_redshift(id, &redshift).unwrap();
            }
            match i % 5 {
                0 => persistor.add_classification(id, &ClassificationRecord::best("Quasar")).unwrap(),
                1 => persistor.add_classification(id, &ClassificationRecord::best("Seyfert 2")).unwrap(),
                _ => 0,
            };
            let filter = if i % 2 == 0 { "SDSS r" } else { "Johnson V" };
            persistor
                .add_photometry(id, &PhotometryRecord::new("V", filter, 17.0 + (i % 4) as f64))
                .unwrap();
        }
    }
    QueryInterface::new(FieldCatalog::agn(), store, Limits::default())
}

fn search(interface: &QueryInterface, tree: &QueryGroup) -> SearchPage {
    interface
        .search(tree, None, Pagination::new(0, 1000), &CancelToken::new())
        .unwrap()
}

/// Zero-based fixture indices of the returned sources.
fn indices(page: &SearchPage) -> Vec<usize> {
    page.items
        .iter()
        .map(|row| match row.get("agn_id") {
            Some(CellValue::Integer(id)) => (*id - 1) as usize,
            other => panic!("unexpected agn_id {other:?}"),
        })
        .collect()
}

#[test]
fn northern_sources_first_page() {
    let interface = setup();
    let tree: QueryGroup = serde_json::from_str(
        r#"{"combinator":"and","rules":[{"field":"declination","operator":"greaterThan","value":"0"}]}"#,
    )
    .unwrap();
    let page = interface
        .search(&tree, None, Pagination::new(0, 20), &CancelToken::new())
        .unwrap();
    let expected = (0..SOURCES).filter(|&i| declination(i) > 0.0).count() as u64;
    assert_eq!(page.total, expected);
    assert_eq!(page.items.len(), 20);
    for row in &page.items {
        assert!(row.get("declination").unwrap().as_f64().unwrap() > 0.0);
    }
}

#[test]
fn quasars_or_high_redshift_without_duplicates() {
    let interface = setup();
    let tree: QueryGroup = serde_json::from_str(
        r#"{"combinator":"or","rules":[
            {"field":"best_class","operator":"equals","value":"Quasar"},
            {"field":"z_value","operator":"greaterThanOrEqual","value":"2.5"}
        ]}"#,
    )
    .unwrap();
    let page = search(&interface, &tree);
    let found = indices(&page);
    let unique: HashSet<_> = found.iter().copied().collect();
    assert_eq!(unique.len(), found.len(), "a source appeared twice");
    let expected: HashSet<_> = (0..SOURCES)
        .filter(|&i| i % 5 == 0 || (has_measured_redshift(i) && i as f64 / 30.0 >= 2.5))
        .collect();
    assert_eq!(unique, expected);
    assert_eq!(page.total, expected.len() as u64);
}

#[test]
fn empty_root_returns_every_source() {
    let interface = setup();
    assert_eq!(search(&interface, &QueryGroup::default()).total, SOURCES as u64);
    let nested_empty = QueryGroup::new(Combinator::Or).with_group(QueryGroup::new(Combinator::And));
    assert_eq!(search(&interface, &nested_empty).total, SOURCES as u64);
}

#[test]
fn empty_in_matches_nothing_and_empty_not_in_everything() {
    let interface = setup();
    let none = QueryGroup::default().with_rule(QueryRule::new("best_class", Operator::In, RuleValue::List(vec![])));
    assert_eq!(search(&interface, &none).total, 0);
    let all = QueryGroup::default().with_rule(QueryRule::new("best_class", Operator::NotIn, RuleValue::List(vec![])));
    assert_eq!(search(&interface, &all).total, SOURCES as u64);
}

#[test]
fn comma_separated_in_list() {
    let interface = setup();
    let tree = QueryGroup::default().with_rule(QueryRule::new("best_class", Operator::In, "quasar, SEYFERT 2"));
    let expected = (0..SOURCES).filter(|i| i % 5 <= 1).count() as u64;
    assert_eq!(search(&interface, &tree).total, expected);
}

#[test]
fn string_matching_ignores_case() {
    let interface = setup();
    let exact = QueryGroup::default().with_rule(QueryRule::new("best_class", Operator::Equals, "Quasar"));
    let lower = QueryGroup::default().with_rule(QueryRule::new("best_class", Operator::Equals, "quasar"));
    assert_eq!(search(&interface, &exact).total, 20);
    assert_eq!(search(&interface, &lower).total, 20);
    let sdss = QueryGroup::default().with_rule(QueryRule::new("filter_name", Operator::BeginsWith, "sdss"));
    assert_eq!(search(&interface, &sdss).total, 50);
}

#[test]
fn null_on_child_field_includes_sources_without_rows() {
    let interface = setup();
    let tree = QueryGroup::default().with_rule(QueryRule::bare("z_error", Operator::Null));
    let expected: HashSet<_> = (0..SOURCES)
        .filter(|&i| (!has_measured_redshift(i) && i % 7 != 0) || (has_measured_redshift(i) && i % 2 == 1))
        .collect();
    let found: HashSet<_> = indices(&search(&interface, &tree)).into_iter().collect();
    assert_eq!(found, expected);

    let measured = QueryGroup::default().with_rule(QueryRule::bare("z_value", Operator::NotNull));
    let expected = (0..SOURCES).filter(|&i| has_measured_redshift(i) || i % 7 == 0).count() as u64;
    assert_eq!(search(&interface, &measured).total, expected);
}

#[test]
fn child_predicates_in_one_group_may_hold_on_different_rows() {
    let store = Store::open(PersistenceMode::InMemory).unwrap();
    {
        let connection = store.connect().unwrap();
        let mut persistor = Persistor::new(&connection).unwrap();
        let split = persistor.add_source(10.0, 10.0).unwrap();
        persistor.add_photometry(split, &PhotometryRecord::new("V", "Johnson V", 18.0)).unwrap();
        persistor.add_photometry(split, &PhotometryRecord::new("K", "2MASS K", 15.0)).unwrap();
        let bright = persistor.add_source(20.0, 20.0).unwrap();
        persistor.add_photometry(bright, &PhotometryRecord::new("K", "2MASS K", 16.0)).unwrap();
    }
    let interface = QueryInterface::new(FieldCatalog::agn(), store, Limits::default());
    let tree = QueryGroup::new(Combinator::And)
        .with_rule(QueryRule::new("band_label", Operator::Equals, "K"))
        .with_rule(QueryRule::new("mag_value", Operator::GreaterThan, 17.0));
    let page = search(&interface, &tree);
    assert_eq!(indices(&page), vec![0]);
    // the row shown is the source's first photometry entry
    assert_eq!(page.items[0].get("band_label"), Some(&CellValue::Text("V".into())));
}

#[test]
fn sorting_by_child_field_puts_nulls_last() {
    let interface = setup();
    for direction in [SortDirection::Asc, SortDirection::Desc] {
        let sort = SortSpec::new("z_value", direction);
        let page = interface
            .search(&QueryGroup::default(), Some(&sort), Pagination::new(0, 1000), &CancelToken::new())
            .unwrap();
        let values: Vec<Option<f64>> = page.items.iter().map(|r| r.get("z_value").unwrap().as_f64()).collect();
        let first_null = values.iter().position(Option::is_none).unwrap();
        assert!(values[first_null..].iter().all(Option::is_none));
        let present: Vec<f64> = values[..first_null].iter().map(|v| v.unwrap()).collect();
        let mut sorted = present.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        if direction == SortDirection::Desc {
            sorted.reverse();
        }
        assert_eq!(present, sorted);
        assert_eq!(page.sort_field.as_deref(), Some("z_value"));
        assert_eq!(page.sort_direction, direction);
    }
}

#[test]
fn validation_fails_before_the_store() {
    let interface = setup();
    let cancel = CancelToken::new();
    let unknown = QueryGroup::default().with_rule(QueryRule::new("flux", Operator::Equals, "1"));
    assert!(matches!(
        interface.search(&unknown, None, Pagination::new(0, 10), &cancel),
        Err(PortalError::UnknownField(_))
    ));
    let mismatch = QueryGroup::default().with_rule(QueryRule::new("ra", Operator::BeginsWith, "1"));
    assert!(matches!(
        interface.search(&mismatch, None, Pagination::new(0, 10), &cancel),
        Err(PortalError::OperatorTypeMismatch { .. })
    ));
    let empty = QueryGroup::default().with_rule(QueryRule::new("best_class", Operator::Equals, "  "));
    assert!(matches!(
        interface.search(&empty, None, Pagination::new(0, 10), &cancel),
        Err(PortalError::EmptyValue { .. })
    ));
    let bad_sort = SortSpec::new("flux", SortDirection::Asc);
    assert!(matches!(
        interface.search(&QueryGroup::default(), Some(&bad_sort), Pagination::new(0, 10), &cancel),
        Err(PortalError::UnknownField(_))
    ));
}

#[test]
fn comparisons_never_match_null_or_missing_child_values() {
    let store = Store::open(PersistenceMode::InMemory).unwrap();
    {
        let connection = store.connect().unwrap();
        let mut persistor = Persistor::new(&connection).unwrap();
        let unmeasured = persistor.add_source(1.0, 1.0).unwrap();
        let blank = RedshiftRecord { redshift_type: Some("photometric".into()), ..RedshiftRecord::default() };
        persistor.add_redshift(unmeasured, &blank).unwrap();
        let near = persistor.add_source(2.0, 2.0).unwrap();
        persistor.add_redshift(near, &RedshiftRecord::new("spectroscopic", 1.0)).unwrap();
        persistor.add_source(3.0, 3.0).unwrap();
        let far = persistor.add_source(4.0, 4.0).unwrap();
        persistor.add_redshift(far, &RedshiftRecord::new("spectroscopic", 2.0)).unwrap();
    }
    let interface = QueryInterface::new(FieldCatalog::agn(), store, Limits::default());
    let matching = |rule: QueryRule| -> Vec<usize> {
        let mut found = indices(&search(&interface, &QueryGroup::default().with_rule(rule)));
        found.sort_unstable();
        found
    };
    assert_eq!(matching(QueryRule::new("z_value", Operator::NotEquals, "2")), vec![1]);
    assert_eq!(matching(QueryRule::new("z_value", Operator::GreaterThan, "0")), vec![1, 3]);
    assert_eq!(matching(QueryRule::new("z_value", Operator::LessThanOrEqual, "5")), vec![1, 3]);
    assert_eq!(matching(QueryRule::new("z_value", Operator::NotIn, "2, 3")), vec![1]);
    assert_eq!(matching(QueryRule::bare("z_value", Operator::Null)), vec![0, 2]);
}

#[test]
fn sorting_by_text_ignores_case() {
    let store = Store::open(PersistenceMode::InMemory).unwrap();
    {
        let connection = store.connect().unwrap();
        let mut persistor = Persistor::new(&connection).unwrap();
        for class in ["b", "A", "c", "B"] {
            let id = persistor.add_source(0.0, 0.0).unwrap();
            persistor.add_classification(id, &ClassificationRecord::best(class)).unwrap();
        }
    }
    let interface = QueryInterface::new(FieldCatalog::agn(), store, Limits::default());
    let sort = SortSpec::new("best_class", SortDirection::Asc);
    let page = interface
        .search(&QueryGroup::default(), Some(&sort), Pagination::new(0, 10), &CancelToken::new())
        .unwrap();
    let classes: Vec<&str> = page.items.iter().map(|r| r.get("best_class").unwrap().as_str().unwrap()).collect();
    // equal ignoring case, so "b" and "B" keep source order
    assert_eq!(classes, vec!["A", "b", "B", "c"]);
}
