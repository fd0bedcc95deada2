//! The query engine as the HTTP layer sees it.
//!
//! [`QueryInterface`] owns the field catalog, the store and the limits, and
//! keeps a registry of running searches and exports so that any of them can be
//! cancelled by id. Cancellation is cooperative via a shared [`CancelToken`]
//! that the executor checks between rows and from SQLite's progress handler.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::{FieldCatalog, FieldDescriptor};
use crate::datatype::ResultRow;
use crate::error::{PortalError, Result};
use crate::execute::{Executor, Limits, Pagination};
use crate::export::{self, ExportOptions, ExportPlan};
use crate::persist::Store;
use crate::query::QueryGroup;
use crate::translate::{SortDirection, SortSpec, Translator};

/// Cancellation token shared between a request and the work done for it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Opaque query identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(u64);
impl QueryId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
    pub fn value(&self) -> u64 {
        self.0
    }
}
impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type ActiveQueries = Arc<Mutex<HashMap<QueryId, CancelToken>>>;

/// A running query. Dropping it removes the query from the registry.
pub struct Registration {
    id: QueryId,
    cancel: CancelToken,
    active: ActiveQueries,
}
impl Registration {
    pub fn id(&self) -> QueryId {
        self.id
    }
    pub fn token(&self) -> &CancelToken {
        &self.cancel
    }
}
impl Drop for Registration {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.id);
        }
    }
}

/// One page of search results, in the shape the portal's grid consumes.
#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub items: Vec<ResultRow>,
    pub total: u64,
    pub page: u64,
    pub size: u64,
    pub pages: u64,
    pub sort_field: Option<String>,
    pub sort_direction: SortDirection,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvailableFields {
    pub categories: BTreeMap<String, Vec<String>>,
    pub all_fields: Vec<String>,
    pub fields: Vec<FieldDescriptor>,
}

pub struct QueryInterface {
    catalog: FieldCatalog,
    store: Store,
    limits: Limits,
    next_id: AtomicU64,
    active: ActiveQueries,
}

impl QueryInterface {
    pub fn new(catalog: FieldCatalog, store: Store, limits: Limits) -> Self {
        Self {
            catalog,
            store,
            limits,
            next_id: AtomicU64::new(0),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn catalog(&self) -> &FieldCatalog {
        &self.catalog
    }
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Registers a new query under a fresh id.
    pub fn register(&self) -> Result<Registration> {
        let id = QueryId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let cancel = CancelToken::new();
        self.active
            .lock()
            .map_err(|e| PortalError::Lock(e.to_string()))?
            .insert(id, cancel.clone());
        Ok(Registration { id, cancel, active: Arc::clone(&self.active) })
    }

    /// Cancels a running query. Returns false when no such query is running.
    pub fn cancel(&self, id: QueryId) -> Result<bool> {
        let active = self.active.lock().map_err(|e| PortalError::Lock(e.to_string()))?;
        match active.get(&id) {
            Some(token) => {
                token.cancel();
                info!(query_id = %id, "query cancelled");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn active_count(&self) -> Result<usize> {
        Ok(self.active.lock().map_err(|e| PortalError::Lock(e.to_string()))?.len())
    }

    pub fn available_fields(&self) -> AvailableFields {
        AvailableFields {
            categories: self.catalog.categorize(),
            all_fields: self.catalog.field_names(),
            fields: self.catalog.list_fields().to_vec(),
        }
    }

    /// Validates, translates and runs a search. Nothing touches the store
    /// until the tree, the sort field and the page size have been accepted.
    pub fn search(
        &self,
        tree: &QueryGroup,
        sort: Option<&SortSpec>,
        pagination: Pagination,
        cancel: &CancelToken,
    ) -> Result<SearchPage> {
        let started = Instant::now();
        pagination.check(&self.limits)?;
        let query = Translator::new(&self.catalog).translate(tree, sort)?;
        let connection = self.store.reader()?;
        let page = Executor::new(&connection, &self.limits).execute(&query, pagination, cancel)?;
        info!(
            ms = started.elapsed().as_secs_f64() * 1000.0,
            rules = tree.rule_count(),
            total = page.total,
            rows = page.rows.len(),
            "search complete"
        );
        Ok(SearchPage {
            total: page.total,
            page: pagination.page(),
            size: pagination.limit,
            pages: pagination.pages(page.total),
            items: page.rows,
            sort_field: sort.map(|s| s.field.clone()),
            sort_direction: sort.map(|s| s.direction).unwrap_or_default(),
        })
    }

    pub fn prepare_export(
        &self,
        tree: &QueryGroup,
        options: &ExportOptions,
        sort: Option<&SortSpec>,
    ) -> Result<ExportPlan> {
        let plan = ExportPlan::prepare(&self.catalog, tree, options, sort)?;
        debug!(format = ?plan.format, fields = plan.fields.len(), "export prepared");
        Ok(plan)
    }

    /// Streams a prepared export into `out`.
    pub fn export<W: Write>(&self, plan: &ExportPlan, cancel: &CancelToken, out: W) -> Result<u64> {
        let connection = self.store.reader()?;
        export::run(plan, &Executor::new(&connection, &self.limits), cancel, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::PersistenceMode;

    fn setup() -> QueryInterface {
        let store = Store::open(PersistenceMode::InMemory).unwrap();
        QueryInterface::new(FieldCatalog::agn(), store, Limits::default())
    }

    #[test]
    fn registrations_are_cancellable_until_dropped() {
        let interface = setup();
        let registration = interface.register().unwrap();
        let id = registration.id();
        assert_eq!(interface.active_count().unwrap(), 1);
        assert!(interface.cancel(id).unwrap());
        assert!(registration.token().is_cancelled());
        drop(registration);
        assert_eq!(interface.active_count().unwrap(), 0);
        assert!(!interface.cancel(id).unwrap());
    }

    #[test]
    fn ids_are_unique() {
        let interface = setup();
        let first = interface.register().unwrap();
        let second = interface.register().unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn available_fields_lists_the_catalog() {
        let fields = setup().available_fields();
        assert_eq!(fields.all_fields.len(), 17);
        assert_eq!(fields.all_fields[0], "agn_id");
        assert_eq!(fields.categories.values().map(Vec::len).sum::<usize>(), 17);
    }
}
