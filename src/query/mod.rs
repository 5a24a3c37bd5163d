//! Query tier
//!
//! Parametrized reads against the relational store, with result caching,
//! performance metrics, slow-query alerts and two batching paths.

pub mod batch;
pub mod builder;
pub mod executor;
pub mod optimizer;

pub use batch::BatchedQuery;
pub use builder::{
    build_community_query, build_insight_queries, build_property_query, CommunityParams,
    InsightPagination, PropertyFilters, QueryType, SqlQuery, SqlValue,
};
pub use executor::{InMemoryExecutor, QueryExecutor};
pub use optimizer::{
    PagedResult, QueryCacheEntry, QueryCacheStats, QueryOptimizer, QueryOptimizerConfig,
    QueryPerformanceMetrics, SlowQueryAlert, SlowQueryCallback,
};
