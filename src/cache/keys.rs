//! Cache key helpers
//!
//! Keys are `<namespace>:<part>:...`, with structured parts rendered as
//! JSON. Struct fields serialize in declaration order and absent options
//! are skipped, so equal inputs always yield equal keys.

use serde::Serialize;

use crate::error::Result;
use crate::query::{CommunityParams, InsightPagination, PropertyFilters};

pub const PROPERTY: &str = "property";
pub const PROPERTIES: &str = "properties";
pub const COMMUNITY: &str = "community";
pub const COMMUNITIES: &str = "communities";
pub const INSIGHTS: &str = "insights";

/// `property:<id>:<params as JSON>`
pub fn property<P: Serialize>(id: &str, params: &P) -> Result<String> {
    Ok(format!("{}:{}:{}", PROPERTY, id, serde_json::to_string(params)?))
}

pub fn properties(filters: &PropertyFilters) -> Result<String> {
    namespaced(PROPERTIES, filters)
}

pub fn community(slug: &str) -> String {
    format!("{}:{}", COMMUNITY, slug)
}

pub fn communities(params: &CommunityParams) -> Result<String> {
    namespaced(COMMUNITIES, params)
}

pub fn insights(pagination: &InsightPagination) -> Result<String> {
    namespaced(INSIGHTS, pagination)
}

/// `<namespace>:<parts as JSON>`
pub fn namespaced<P: Serialize + ?Sized>(namespace: &str, parts: &P) -> Result<String> {
    Ok(format!("{}:{}", namespace, serde_json::to_string(parts)?))
}
