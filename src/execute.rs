//! Runs translated queries against a store connection.
//!
//! Every run is watched: a SQLite progress handler aborts the statement once
//! the caller cancels or the deadline passes, and the row loop checks the same
//! conditions between rows.

use std::time::{Duration, Instant};

use rusqlite::types::Value;
use rusqlite::{Connection, Row, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::datatype::{CellValue, ResultRow};
use crate::error::{PortalError, Result};
use crate::interface::CancelToken;
use crate::translate::ExecutableQuery;

// virtual machine instructions between two looks at the clock
const PROGRESS_OPS: i32 = 1000;

/// Operational limits of the query engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub default_page_size: u64,
    pub max_page_size: u64,
    pub query_timeout: Duration,
    pub export_timeout: Duration,
    pub export_row_ceiling: u64,
    pub export_chunk_bytes: usize,
}
impl Default for Limits {
    fn default() -> Self {
        Self {
            default_page_size: 100,
            max_page_size: 1000,
            query_timeout: Duration::from_secs(30),
            export_timeout: Duration::from_secs(300),
            export_row_ceiling: 100_000,
            export_chunk_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub skip: u64,
    pub limit: u64,
}
impl Pagination {
    pub fn new(skip: u64, limit: u64) -> Self {
        Self { skip, limit }
    }

    /// Fills in defaults and checks the page size.
    pub fn resolve(skip: Option<u64>, limit: Option<u64>, limits: &Limits) -> Result<Self> {
        let pagination = Self::new(skip.unwrap_or(0), limit.unwrap_or(limits.default_page_size));
        pagination.check(limits)?;
        Ok(pagination)
    }

    pub fn check(&self, limits: &Limits) -> Result<()> {
        if self.limit == 0 {
            return Err(PortalError::InvalidPagination("limit must be at least 1".into()));
        }
        if self.limit > limits.max_page_size {
            return Err(PortalError::LimitExceeded {
                requested: self.limit,
                maximum: limits.max_page_size,
            });
        }
        Ok(())
    }

    /// One-based page number.
    pub fn page(&self) -> u64 {
        self.skip / self.limit.max(1) + 1
    }

    pub fn pages(&self, total: u64) -> u64 {
        total.div_ceil(self.limit.max(1))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub rows: Vec<ResultRow>,
    pub total: u64,
}

/// Point in time after which a run is aborted.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}
impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self { at: Instant::now() + budget, budget }
    }
    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }
    pub fn budget(&self) -> Duration {
        self.budget
    }
}

/// Arms the progress handler for the lifetime of one run.
struct Watchdog<'c> {
    connection: &'c Connection,
    cancel: CancelToken,
    deadline: Deadline,
}
impl<'c> Watchdog<'c> {
    fn arm(connection: &'c Connection, cancel: &CancelToken, deadline: Deadline) -> Self {
        let token = cancel.clone();
        connection.progress_handler(
            PROGRESS_OPS,
            Some(move || token.is_cancelled() || deadline.expired()),
        );
        Self { connection, cancel: cancel.clone(), deadline }
    }

    fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(PortalError::Cancelled)
        } else if self.deadline.expired() {
            Err(PortalError::QueryTimeout(self.deadline.budget()))
        } else {
            Ok(())
        }
    }

    /// An interrupted statement reports why it was interrupted.
    fn fail(&self, error: rusqlite::Error) -> PortalError {
        match self.check() {
            Err(reason) => reason,
            Ok(()) => error.into(),
        }
    }
}
impl Drop for Watchdog<'_> {
    fn drop(&mut self) {
        self.connection.progress_handler(0, None::<fn() -> bool>);
    }
}

pub struct Executor<'c> {
    connection: &'c Connection,
    limits: &'c Limits,
}

impl<'c> Executor<'c> {
    pub fn new(connection: &'c Connection, limits: &'c Limits) -> Self {
        Self { connection, limits }
    }

    pub fn limits(&self) -> &Limits {
        self.limits
    }

    /// One page of results plus the total match count.
    pub fn execute(
        &self,
        query: &ExecutableQuery,
        pagination: Pagination,
        cancel: &CancelToken,
    ) -> Result<Page> {
        pagination.check(self.limits)?;
        let deadline = Deadline::after(self.limits.query_timeout);
        let total = self.count(query, cancel, deadline)?;
        let limit = i64::try_from(pagination.limit)
            .map_err(|_| PortalError::InvalidPagination("limit is too large".into()))?;
        let offset = i64::try_from(pagination.skip)
            .map_err(|_| PortalError::InvalidPagination("skip is too large".into()))?;
        let sql = format!("{} LIMIT ? OFFSET ?", query.select_sql);
        let mut params = query.params.clone();
        params.push(Value::Integer(limit));
        params.push(Value::Integer(offset));

        let mut rows = Vec::with_capacity(pagination.limit.min(total) as usize);
        self.run(&sql, &params, query, cancel, deadline, |row| {
            rows.push(row);
            Ok(())
        })?;
        debug!(total, returned = rows.len(), skip = pagination.skip, "page fetched");
        Ok(Page { rows, total })
    }

    pub fn count(&self, query: &ExecutableQuery, cancel: &CancelToken, deadline: Deadline) -> Result<u64> {
        let watchdog = Watchdog::arm(self.connection, cancel, deadline);
        watchdog.check()?;
        let count: i64 = self
            .connection
            .prepare_cached(&query.count_sql)
            .and_then(|mut statement| {
                statement.query_row(params_from_iter(query.params.iter()), |row| row.get(0))
            })
            .map_err(|e| watchdog.fail(e))?;
        u64::try_from(count).map_err(|_| PortalError::Invariant(format!("negative count {count}")))
    }

    /// Feeds every matching row, in order, to `on_row`. Returns the number of
    /// rows delivered.
    pub fn stream<F>(
        &self,
        query: &ExecutableQuery,
        cancel: &CancelToken,
        deadline: Deadline,
        mut on_row: F,
    ) -> Result<u64>
    where
        F: FnMut(&ResultRow) -> Result<()>,
    {
        self.run(&query.select_sql, &query.params, query, cancel, deadline, |row| on_row(&row))
    }

    fn run<F>(
        &self,
        sql: &str,
        params: &[Value],
        query: &ExecutableQuery,
        cancel: &CancelToken,
        deadline: Deadline,
        mut on_row: F,
    ) -> Result<u64>
    where
        F: FnMut(ResultRow) -> Result<()>,
    {
        let watchdog = Watchdog::arm(self.connection, cancel, deadline);
        watchdog.check()?;
        let mut statement = self.connection.prepare(sql).map_err(|e| watchdog.fail(e))?;
        let mut rows = statement
            .query(params_from_iter(params.iter()))
            .map_err(|e| watchdog.fail(e))?;
        let mut delivered = 0;
        loop {
            watchdog.check()?;
            let Some(row) = rows.next().map_err(|e| watchdog.fail(e))? else {
                break;
            };
            let cells = read_cells(row, query.columns.len()).map_err(|e| watchdog.fail(e))?;
            on_row(ResultRow::new(query.columns.clone(), cells))?;
            delivered += 1;
        }
        Ok(delivered)
    }
}

fn read_cells(row: &Row<'_>, width: usize) -> rusqlite::Result<Vec<CellValue>> {
    (0..width).map(|i| row.get::<_, CellValue>(i)).collect()
}
