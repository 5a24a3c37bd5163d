//! Query Executor - data store port
//!
//! The optimizer reaches the relational store only through
//! [`QueryExecutor`]. Production code adapts its database driver to this
//! trait; [`InMemoryExecutor`] serves tests and the demo binary.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::builder::SqlQuery;
use crate::error::{Error, Result};

/// Executes a parametrized statement and returns raw rows
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &SqlQuery) -> Result<Vec<Value>>;
}

/// Table-backed executor that does not evaluate conditions.
///
/// `SELECT COUNT(*)` statements return `[{"count": n}]` for the table's row
/// count; every other statement returns all rows of `query.table`.
#[derive(Default)]
pub struct InMemoryExecutor {
    tables: DashMap<String, Vec<Value>>,
    latency: Mutex<Duration>,
    failing: AtomicBool,
    calls: AtomicU64,
    history: Mutex<Vec<SqlQuery>>,
}

impl InMemoryExecutor {
    /// Create an empty executor
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rows of `table`
    pub fn with_table(self, table: &str, rows: Vec<Value>) -> Self {
        self.tables.insert(table.to_string(), rows);
        self
    }

    /// Simulated execution time for every statement
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Make every statement fail until switched back
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Statements executed so far
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Statements executed so far, oldest first
    pub fn history(&self) -> Vec<SqlQuery> {
        self.history.lock().clone()
    }
}

#[async_trait]
impl QueryExecutor for InMemoryExecutor {
    async fn execute(&self, query: &SqlQuery) -> Result<Vec<Value>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.history.lock().push(query.clone());

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.failing.load(Ordering::Relaxed) {
            return Err(Error::QueryFailed(format!(
                "simulated failure on {}",
                query.table
            )));
        }

        let rows = self
            .tables
            .get(&query.table)
            .map(|rows| rows.clone())
            .unwrap_or_default();

        if query.sql.starts_with("SELECT COUNT(*)") {
            return Ok(vec![json!({ "count": rows.len() })]);
        }
        Ok(rows)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builder::{build_insight_queries, build_property_query, InsightPagination};

    #[tokio::test]
    async fn test_returns_table_rows_and_counts() {
        let executor = InMemoryExecutor::new()
            .with_table("market_insights", vec![json!({"id": 1}), json!({"id": 2})]);
        let (data, count) = build_insight_queries(&InsightPagination::default());

        assert_eq!(executor.execute(&data).await.unwrap().len(), 2);
        assert_eq!(
            executor.execute(&count).await.unwrap(),
            vec![json!({"count": 2})]
        );
        assert_eq!(executor.calls(), 2);
        assert_eq!(executor.history()[1], count);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let executor = InMemoryExecutor::new();
        executor.set_failing(true);

        let query = build_property_query(&Default::default());
        let err = executor.execute(&query).await.unwrap_err();
        assert!(matches!(err, Error::QueryFailed(_)));

        executor.set_failing(false);
        assert!(executor.execute(&query).await.unwrap().is_empty());
    }
}
