//! Customer search over the batch endpoint.
//!
//! A [`CustomerSearch`] expands into one query per non-empty criterion; all
//! queries go out in a single batch request and the results are merged in
//! request order, keeping the first occurrence of each customer id.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::resource::{Fault, Resource};

/// Entity queried by [`CustomerSearch`].
pub const CUSTOMER_ENTITY: &str = "Customer";

/// Optional search criteria. Blank values are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerSearch {
    pub display_name: Option<String>,
    pub company_name: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Escape a value for use inside a single-quoted query literal.
pub fn escape_literal(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || c == '\'' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl CustomerSearch {
    pub fn is_empty(&self) -> bool {
        self.queries().is_empty()
    }

    /// Build the batch queries for these criteria, in a fixed order.
    pub fn queries(&self) -> Vec<BatchQuery> {
        let mut queries = Vec::new();

        if let Some(name) = present(&self.display_name) {
            queries.push(BatchQuery::new(
                "bid_display_name",
                format!(
                    "SELECT * FROM Customer WHERE DisplayName LIKE '%{}%'",
                    escape_literal(name)
                ),
            ));
        }

        if let Some(company) = present(&self.company_name) {
            queries.push(BatchQuery::new(
                "bid_company_name",
                format!(
                    "SELECT * FROM Customer WHERE CompanyName LIKE '%{}%'",
                    escape_literal(company)
                ),
            ));
        }

        if let Some(email) = present(&self.email) {
            queries.push(BatchQuery::new(
                "bid_email",
                format!(
                    "SELECT * FROM Customer WHERE PrimaryEmailAddr = '{}'",
                    escape_literal(email)
                ),
            ));
        }

        let name_query = match (present(&self.first_name), present(&self.last_name)) {
            (Some(first), Some(last)) => Some(format!(
                "SELECT * FROM Customer WHERE GivenName LIKE '%{}%' AND FamilyName LIKE '%{}%'",
                escape_literal(first),
                escape_literal(last)
            )),
            (Some(first), None) => Some(format!(
                "SELECT * FROM Customer WHERE GivenName LIKE '%{}%'",
                escape_literal(first)
            )),
            (None, Some(last)) => Some(format!(
                "SELECT * FROM Customer WHERE FamilyName LIKE '%{}%'",
                escape_literal(last)
            )),
            (None, None) => None,
        };
        if let Some(query) = name_query {
            queries.push(BatchQuery::new("bid_name", query));
        }

        queries
    }
}

/// One query inside a batch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchQuery {
    #[serde(rename = "bId")]
    pub batch_id: String,
    #[serde(rename = "Query")]
    pub query: String,
}

impl BatchQuery {
    pub fn new(batch_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            query: query.into(),
        }
    }
}

/// Body of `POST /v3/company/{realm}/batch`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRequest {
    #[serde(rename = "BatchItemRequest")]
    pub items: Vec<BatchQuery>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchResponse {
    #[serde(rename = "BatchItemResponse", default)]
    pub items: Vec<BatchItemResponse>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchItemResponse {
    #[serde(rename = "bId", default)]
    pub batch_id: Option<String>,
    #[serde(rename = "QueryResponse", default)]
    pub query_response: Option<Map<String, Value>>,
    #[serde(rename = "Fault", default)]
    pub fault: Option<Fault>,
}

impl BatchItemResponse {
    /// Entities of type `entity` in this item. Faulted items yield nothing.
    pub fn entities(&self, entity: &str) -> Vec<Resource> {
        if self.fault.is_some() {
            return Vec::new();
        }
        self.query_response
            .as_ref()
            .and_then(|response| response.get(entity))
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_object().cloned())
                    .filter_map(Resource::from_entity)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl BatchResponse {
    /// Merged, de-duplicated entities across all items, in response order.
    ///
    /// Faulted items are logged and skipped.
    pub fn into_resources(self, entity: &str) -> Vec<Resource> {
        let mut batches = Vec::with_capacity(self.items.len());
        for item in &self.items {
            if let Some(fault) = &item.fault {
                tracing::warn!(
                    "Batch item {} failed: {}",
                    item.batch_id.as_deref().unwrap_or("<unknown>"),
                    fault
                );
                continue;
            }
            batches.push(item.entities(entity));
        }
        merge_unique(batches)
    }
}

/// Concatenate result sets, keeping the first occurrence of each id.
pub fn merge_unique<I>(batches: I) -> Vec<Resource>
where
    I: IntoIterator<Item = Vec<Resource>>,
{
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for resource in batches.into_iter().flatten() {
        if seen.insert(resource.id.clone()) {
            merged.push(resource);
        }
    }
    merged
}
