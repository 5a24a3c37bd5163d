//! Parametrized Query Builder
//!
//! Translates filter objects into SQL with `$n` placeholders. Filter values
//! only ever travel in `SqlQuery::params`; the SQL text is assembled from
//! fixed fragments. Absent filter fields add no condition.

use serde::{Deserialize, Serialize};

/// Default page size when a filter omits `limit`
pub const DEFAULT_LIMIT: u32 = 20;

/// Largest page a single query may request
pub const MAX_LIMIT: u32 = 100;

/// A bound parameter value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

/// Statement kind, recorded with every performance metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryType::Select => write!(f, "SELECT"),
            QueryType::Insert => write!(f, "INSERT"),
            QueryType::Update => write!(f, "UPDATE"),
            QueryType::Delete => write!(f, "DELETE"),
        }
    }
}

/// SQL text plus its bound parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub query_type: QueryType,
    /// Primary table, for metrics
    pub table: String,
}

// =============================================================================
// Filters
// =============================================================================

/// Listing filters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listing_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub community_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub developer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_bedrooms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bedrooms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_bathrooms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub featured: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub luxury: Option<bool>,
    /// Case-insensitive match on title or description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

/// Community listing parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunityParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub featured: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

/// Market-insight page request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightPagination {
    /// 1-based page number
    pub page: u32,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub published_only: bool,
}

impl Default for InsightPagination {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 10,
            category: None,
            published_only: true,
        }
    }
}

impl InsightPagination {
    /// Row offset of the requested page
    pub fn offset(&self) -> u32 {
        (self.page.max(1) - 1).saturating_mul(clamp_limit(Some(self.limit)))
    }
}

// =============================================================================
// WHERE assembly
// =============================================================================

#[derive(Debug, Clone, Default)]
struct WhereClause {
    conditions: Vec<String>,
    params: Vec<SqlValue>,
}

impl WhereClause {
    /// Bind a value and return its placeholder
    fn bind(&mut self, value: impl Into<SqlValue>) -> String {
        self.params.push(value.into());
        format!("${}", self.params.len())
    }

    fn push(&mut self, column: &str, op: &str, value: impl Into<SqlValue>) {
        let placeholder = self.bind(value);
        self.conditions
            .push(format!("{} {} {}", column, op, placeholder));
    }

    fn push_opt<T: Into<SqlValue>>(&mut self, column: &str, op: &str, value: Option<T>) {
        if let Some(value) = value {
            self.push(column, op, value);
        }
    }

    /// `(a ILIKE $n OR b ILIKE $n)` with one bound pattern
    fn push_search(&mut self, columns: &[&str], term: Option<&str>) {
        let Some(term) = term.map(str::trim).filter(|t| !t.is_empty()) else {
            return;
        };
        let placeholder = self.bind(format!("%{}%", escape_like(term)));
        let alternatives: Vec<String> = columns
            .iter()
            .map(|c| format!("{} ILIKE {}", c, placeholder))
            .collect();
        self.conditions
            .push(format!("({})", alternatives.join(" OR ")));
    }

    fn render(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" AND "))
        }
    }
}

/// Escape LIKE wildcards so search terms match literally
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Requested page size clamped to `[1, MAX_LIMIT]`
pub fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

// =============================================================================
// Builders
// =============================================================================

/// Listings with community and developer names
pub fn build_property_query(filters: &PropertyFilters) -> SqlQuery {
    let mut clause = WhereClause::default();
    clause.push_opt("p.property_type", "=", filters.property_type.clone());
    clause.push_opt("p.listing_type", "=", filters.listing_type.clone());
    clause.push_opt("p.status", "=", filters.status.clone());
    clause.push_opt("p.community_id", "=", filters.community_id.clone());
    clause.push_opt("p.developer_id", "=", filters.developer_id.clone());
    clause.push_opt("c.city", "=", filters.city.clone());
    clause.push_opt("p.price", ">=", filters.min_price);
    clause.push_opt("p.price", "<=", filters.max_price);
    clause.push_opt("p.bedrooms", ">=", filters.min_bedrooms);
    clause.push_opt("p.bedrooms", "<=", filters.max_bedrooms);
    clause.push_opt("p.bathrooms", ">=", filters.min_bathrooms);
    clause.push_opt("p.featured", "=", filters.featured);
    clause.push_opt("p.is_luxury", "=", filters.luxury);
    clause.push_search(&["p.title", "p.description"], filters.search.as_deref());

    let where_sql = clause.render();
    let limit = clause.bind(clamp_limit(filters.limit));
    let offset = clause.bind(filters.offset.unwrap_or(0));

    SqlQuery {
        sql: format!(
            "SELECT p.*, c.name AS community_name, c.slug AS community_slug, \
             d.name AS developer_name \
             FROM properties p \
             LEFT JOIN communities c ON c.id = p.community_id \
             LEFT JOIN developers d ON d.id = p.developer_id{} \
             ORDER BY p.featured DESC, p.created_at DESC \
             LIMIT {} OFFSET {}",
            where_sql, limit, offset
        ),
        params: clause.params,
        query_type: QueryType::Select,
        table: "properties".to_string(),
    }
}

/// Communities with listing counts and starting price
pub fn build_community_query(params: &CommunityParams) -> SqlQuery {
    let mut clause = WhereClause::default();
    clause.push_opt("c.city", "=", params.city.clone());
    clause.push_opt("c.featured", "=", params.featured);
    clause.push_search(&["c.name", "c.description"], params.search.as_deref());

    let where_sql = clause.render();
    let limit = clause.bind(clamp_limit(params.limit));
    let offset = clause.bind(params.offset.unwrap_or(0));

    SqlQuery {
        sql: format!(
            "SELECT c.*, COUNT(p.id) AS property_count, MIN(p.price) AS starting_price \
             FROM communities c \
             LEFT JOIN properties p ON p.community_id = c.id{} \
             GROUP BY c.id \
             ORDER BY c.featured DESC, c.name ASC \
             LIMIT {} OFFSET {}",
            where_sql, limit, offset
        ),
        params: clause.params,
        query_type: QueryType::Select,
        table: "communities".to_string(),
    }
}

/// Page of market insights plus the matching COUNT query
pub fn build_insight_queries(pagination: &InsightPagination) -> (SqlQuery, SqlQuery) {
    let mut clause = WhereClause::default();
    if pagination.published_only {
        clause.push("i.published", "=", true);
    }
    clause.push_opt("i.category", "=", pagination.category.clone());

    let where_sql = clause.render();
    let count = SqlQuery {
        sql: format!("SELECT COUNT(*) AS count FROM market_insights i{}", where_sql),
        params: clause.params.clone(),
        query_type: QueryType::Select,
        table: "market_insights".to_string(),
    };

    let limit = clause.bind(clamp_limit(Some(pagination.limit)));
    let offset = clause.bind(pagination.offset());
    let data = SqlQuery {
        sql: format!(
            "SELECT i.*, a.name AS author_name \
             FROM market_insights i \
             LEFT JOIN authors a ON a.id = i.author_id{} \
             ORDER BY i.published_at DESC \
             LIMIT {} OFFSET {}",
            where_sql, limit, offset
        ),
        params: clause.params,
        query_type: QueryType::Select,
        table: "market_insights".to_string(),
    };

    (data, count)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filters_have_no_where() {
        let query = build_property_query(&PropertyFilters::default());

        assert!(!query.sql.contains("WHERE"));
        assert!(query.sql.ends_with("LIMIT $1 OFFSET $2"));
        assert_eq!(query.params, vec![SqlValue::Int(20), SqlValue::Int(0)]);
        assert_eq!(query.table, "properties");
    }

    #[test]
    fn test_only_present_fields_bind() {
        let filters = PropertyFilters {
            property_type: Some("villa".into()),
            min_price: Some(1_000_000.0),
            featured: Some(true),
            limit: Some(5),
            ..Default::default()
        };
        let query = build_property_query(&filters);

        assert!(query
            .sql
            .contains("WHERE p.property_type = $1 AND p.price >= $2 AND p.featured = $3"));
        assert!(query.sql.ends_with("LIMIT $4 OFFSET $5"));
        assert_eq!(
            query.params,
            vec![
                SqlValue::Text("villa".into()),
                SqlValue::Float(1_000_000.0),
                SqlValue::Bool(true),
                SqlValue::Int(5),
                SqlValue::Int(0),
            ]
        );
    }

    #[test]
    fn test_values_never_reach_sql_text() {
        let filters = PropertyFilters {
            city: Some("Dubai'; DROP TABLE properties; --".into()),
            search: Some("sea view".into()),
            ..Default::default()
        };
        let query = build_property_query(&filters);

        assert!(!query.sql.contains("DROP TABLE"));
        assert!(!query.sql.contains("sea view"));
        assert!(query
            .sql
            .contains("(p.title ILIKE $2 OR p.description ILIKE $2)"));
        assert_eq!(query.params[1], SqlValue::Text("%sea view%".into()));
    }

    #[test]
    fn test_search_escapes_wildcards_and_skips_blank() {
        let mut clause = WhereClause::default();
        clause.push_search(&["x"], Some("100%_off"));
        assert_eq!(clause.params, vec![SqlValue::Text("%100\\%\\_off%".into())]);

        let mut blank = WhereClause::default();
        blank.push_search(&["x"], Some("   "));
        assert!(blank.conditions.is_empty());
    }

    #[test]
    fn test_limit_is_clamped() {
        assert_eq!(clamp_limit(None), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(10_000)), MAX_LIMIT);
    }

    #[test]
    fn test_community_query() {
        let query = build_community_query(&CommunityParams {
            city: Some("Abu Dhabi".into()),
            ..Default::default()
        });

        assert!(query.sql.contains("WHERE c.city = $1"));
        assert!(query.sql.contains("GROUP BY c.id"));
        assert_eq!(query.params.len(), 3);
        assert_eq!(query.table, "communities");
    }

    #[test]
    fn test_insight_queries_share_conditions() {
        let pagination = InsightPagination {
            page: 3,
            limit: 10,
            category: Some("market-report".into()),
            published_only: true,
        };
        let (data, count) = build_insight_queries(&pagination);

        assert_eq!(
            count.sql,
            concat!(
                "SELECT COUNT(*) AS count FROM market_insights i ",
                "WHERE i.published = $1 AND i.category = $2"
            )
        );
        assert_eq!(count.params.len(), 2);
        assert_eq!(&data.params[..2], &count.params[..]);
        assert_eq!(data.params[2], SqlValue::Int(10));
        assert_eq!(data.params[3], SqlValue::Int(20));
    }

    #[test]
    fn test_insight_page_zero_is_first_page() {
        let pagination = InsightPagination {
            page: 0,
            ..Default::default()
        };
        assert_eq!(pagination.offset(), 0);
    }

    #[test]
    fn test_query_type_display() {
        assert_eq!(QueryType::Select.to_string(), "SELECT");
        assert_eq!(QueryType::Delete.to_string(), "DELETE");
    }
}
