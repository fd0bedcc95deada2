//! AGN-DB – the query and export engine of an AGN research data portal.
//!
//! The portal stores astronomical sources (coordinates) together with their
//! photometry, redshift measurements and classifications in four SQLite
//! relations. Users build a boolean filter tree over a fixed set of fields,
//! page and sort through the matching sources, and download the full result
//! as CSV or as a VO-table document.
//!
//! ## Modules
//! * [`catalog`] – The field catalog: every queryable and exportable field, in
//!   its presentation order.
//! * [`query`] – The query tree (groups of rules), operator/type rules and
//!   validation into typed operands.
//! * [`translate`] – Lowering of a tree into parameterised SQL. Rules on
//!   photometry, redshift or classification fields hold when *any* related
//!   row satisfies them.
//! * [`execute`] – Paginated execution and row streaming with deadlines and
//!   cooperative cancellation.
//! * [`export`] – Streaming CSV and VO-table serializers.
//! * [`persist`] – Schema, connections and demo data.
//! * [`interface`] – The engine façade with its registry of running queries.
//! * [`server`] – The axum HTTP API.
//! * [`client`] – Query builder, column visibility and result grid state.
//!
//! ## Quick Start
//! ```
//! use agndb::catalog::FieldCatalog;
//! use agndb::execute::{Limits, Pagination};
//! use agndb::interface::{CancelToken, QueryInterface};
//! use agndb::persist::{PersistenceMode, Store};
//! use agndb::query::{Combinator, Operator, QueryGroup, QueryRule};
//!
//! let store = Store::open(PersistenceMode::InMemory).unwrap();
//! store.seed_demo(50, 7).unwrap();
//! let interface = QueryInterface::new(FieldCatalog::agn(), store, Limits::default());
//! let tree = QueryGroup::new(Combinator::And)
//!     .with_rule(QueryRule::new("declination", Operator::GreaterThan, "0"));
//! let page = interface
//!     .search(&tree, None, Pagination::new(0, 20), &CancelToken::new())
//!     .unwrap();
//! assert!(page.items.len() <= 20);
//! ```

pub mod catalog;
pub mod client;
pub mod config;
pub mod datatype;
pub mod error;
pub mod execute;
pub mod export;
pub mod interface;
pub mod persist;
pub mod query;
pub mod server;
pub mod translate;
