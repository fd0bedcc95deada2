use agndb::catalog::FieldCatalog;
use agndb::client::{ColumnVisibility, GridSort, QueryBuilder, Resubmission, SearchSession};
use agndb::execute::{Limits, Pagination};
use agndb::interface::{CancelToken, QueryInterface};
use agndb::persist::{PersistenceMode, Store};
use agndb::query::{Combinator, Operator, QueryGroup, QueryRule};

fn setup() -> QueryInterface {
    let store = Store::open(PersistenceMode::InMemory).unwrap();
    store.seed_demo(200, 21).unwrap();
    QueryInterface::new(FieldCatalog::agn(), store, Limits::default())
}

fn total(interface: &QueryInterface, tree: &QueryGroup) -> u64 {
    interface
        .search(tree, None, Pagination::new(0, 1), &CancelToken::new())
        .unwrap()
        .total
}

#[test]
fn built_queries_run_as_searches() {
    let interface = setup();
    let catalog = interface.catalog();
    let mut builder = QueryBuilder::new(catalog);
    builder.add_rule(&[], QueryRule::new("declination", Operator::GreaterThan, "0")).unwrap();
    let nested = builder.add_group(&[], Combinator::Or).unwrap();
    builder.add_rule(&nested, QueryRule::new("best_class", Operator::Equals, "Quasar")).unwrap();
    builder.add_rule(&nested, QueryRule::new("z_value", Operator::LessThan, "0.5")).unwrap();
    let tree = builder.build().unwrap();

    let expected = QueryGroup::new(Combinator::And)
        .with_rule(QueryRule::new("declination", Operator::GreaterThan, "0"))
        .with_group(
            QueryGroup::new(Combinator::Or)
                .with_rule(QueryRule::new("best_class", Operator::Equals, "Quasar"))
                .with_rule(QueryRule::new("z_value", Operator::LessThan, "0.5")),
        );
    assert_eq!(tree, expected);
    assert!(total(&interface, &tree) <= total(&interface, &QueryGroup::default()));
}

#[test]
fn combining_with_the_previous_query_unions_the_results() {
    let interface = setup();
    let quasars = QueryGroup::default().with_rule(QueryRule::new("best_class", Operator::Equals, "Quasar"));
    let south = QueryGroup::default().with_rule(QueryRule::new("declination", Operator::LessThan, "-30"));
    let both = QueryGroup::default()
        .with_rule(QueryRule::new("best_class", Operator::Equals, "Quasar"))
        .with_rule(QueryRule::new("declination", Operator::LessThan, "-30"));

    let mut session = SearchSession::new();
    let first = session.submit(quasars.clone(), None).unwrap();
    session.record_results(total(&interface, &first));
    assert!(session.needs_choice());
    assert!(session.submit(south.clone(), None).is_err());

    let combined = session.submit(south.clone(), Some(Resubmission::CombineOr)).unwrap();
    let union = total(&interface, &quasars) + total(&interface, &south) - total(&interface, &both);
    assert_eq!(total(&interface, &combined), union);
}

#[test]
fn grid_state_over_a_result_page() {
    let interface = setup();
    let mut visibility = ColumnVisibility::new(interface.catalog());
    visibility.hide_all();
    visibility.set("ra", true).unwrap();
    visibility.set("agn_id", true).unwrap();
    assert_eq!(visibility.visible_columns(), vec!["agn_id", "ra"]);

    let mut rows = interface
        .search(&QueryGroup::default(), None, Pagination::new(0, 50), &CancelToken::new())
        .unwrap()
        .items;
    let mut sort = GridSort::default();
    sort.click("mag_value");
    sort.click("mag_value");
    sort.apply(&mut rows);
    let mags: Vec<f64> = rows.iter().filter_map(|r| r.get("mag_value").and_then(|c| c.as_f64())).collect();
    assert!(mags.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn combining_multi_rule_queries_keeps_each_query_intact() {
    let interface = setup();
    let north_east = QueryGroup::default()
        .with_rule(QueryRule::new("declination", Operator::GreaterThan, "0"))
        .with_rule(QueryRule::new("ra", Operator::GreaterThan, "180"));
    let near_quasars = QueryGroup::default()
        .with_rule(QueryRule::new("best_class", Operator::Equals, "Quasar"))
        .with_rule(QueryRule::new("z_value", Operator::LessThan, "1"));
    let all_four = QueryGroup::default()
        .with_rule(QueryRule::new("declination", Operator::GreaterThan, "0"))
        .with_rule(QueryRule::new("ra", Operator::GreaterThan, "180"))
        .with_rule(QueryRule::new("best_class", Operator::Equals, "Quasar"))
        .with_rule(QueryRule::new("z_value", Operator::LessThan, "1"));

    let mut session = SearchSession::new();
    let first = session.submit(north_east.clone(), None).unwrap();
    session.record_results(total(&interface, &first));
    let combined = session.submit(near_quasars.clone(), Some(Resubmission::CombineOr)).unwrap();

    let union = total(&interface, &north_east) + total(&interface, &near_quasars) - total(&interface, &all_four);
    assert_eq!(total(&interface, &combined), union);
    assert!(total(&interface, &combined) < total(&interface, &QueryGroup::default()));
}
