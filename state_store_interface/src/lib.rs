use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cluster_shared_types::{ClusterError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors specific to state store operations
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<StateStoreError> for ClusterError {
    fn from(err: StateStoreError) -> Self {
        ClusterError::StateError(err.to_string())
    }
}

/// Document collections known to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Clusters,
    Hosts,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Clusters => "cluster",
            Collection::Hosts => "host",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Selector over top-level document fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    #[default]
    All,
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Serialize) -> Self {
        Filter::Eq(field.into(), to_value(value))
    }

    pub fn ne(field: impl Into<String>, value: impl Serialize) -> Self {
        Filter::Ne(field.into(), to_value(value))
    }

    pub fn any_of<T: Serialize>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = T>,
    ) -> Self {
        Filter::In(field.into(), values.into_iter().map(to_value).collect())
    }

    /// Conjunction that drops `All` terms.
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), f) => {
                left.push(f);
                Filter::And(left)
            }
            (f, Filter::And(mut right)) => {
                right.insert(0, f);
                Filter::And(right)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    pub fn matches(&self, document: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, value) => document.get(field) == Some(value),
            Filter::Ne(field, value) => document.get(field) != Some(value),
            Filter::In(field, values) => document
                .get(field)
                .map(|v| values.contains(v))
                .unwrap_or(false),
            Filter::And(filters) => filters.iter().all(|f| f.matches(document)),
        }
    }
}

fn to_value(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Paging and ordering for a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub skip: usize,
    /// `None` returns every remaining record.
    pub limit: Option<usize>,
    /// Field name, prefixed with `-` for descending order.
    pub sort: Option<String>,
}

impl QueryOptions {
    pub fn sorted_by(field: impl Into<String>) -> Self {
        Self {
            sort: Some(field.into()),
            ..Default::default()
        }
    }

    /// Compare two documents according to `sort`.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let Some(sort) = self.sort.as_deref().filter(|s| !s.is_empty()) else {
            return Ordering::Equal;
        };
        let (field, descending) = match sort.strip_prefix('-') {
            Some(field) => (field, true),
            None => (sort, false),
        };
        let ordering = compare_values(a.get(field), b.get(field));
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::String(a)), Some(Value::String(b))) => {
            // Timestamps are serialized with a variable number of fractional digits
            match (
                DateTime::parse_from_rfc3339(a),
                DateTime::parse_from_rfc3339(b),
            ) {
                (Ok(a), Ok(b)) => a.cmp(&b),
                _ => a.cmp(b),
            }
        }
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// One page of query results plus the total number of matches.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub total: usize,
    pub items: Vec<T>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            total: 0,
            items: Vec::new(),
        }
    }
}

/// Document store holding cluster and host records.
///
/// Records are JSON documents addressed by a string id. Selection is by
/// [`Filter`]; updates overwrite the named top-level fields of every
/// matching document.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Initialize the state store connection
    async fn initialize(&self) -> Result<()>;

    /// Check if the state store is healthy
    async fn health_check(&self) -> Result<bool>;

    /// Insert a new document. Fails if the id is already present.
    async fn insert(&self, collection: Collection, id: &str, document: Value) -> Result<()>;

    async fn query(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &QueryOptions,
    ) -> Result<Page<Value>>;

    /// Overwrite `fields` on every matching document and return the match count.
    async fn update_fields(
        &self,
        collection: Collection,
        filter: &Filter,
        fields: Map<String, Value>,
    ) -> Result<usize>;

    /// Store clock used for record timestamps.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Typed access on top of [`StateStore`].
#[async_trait]
pub trait StateStoreExt: StateStore {
    async fn insert_record<T: Serialize + Sync>(
        &self,
        collection: Collection,
        id: &str,
        record: &T,
    ) -> Result<()> {
        let document = serde_json::to_value(record).map_err(StateStoreError::from)?;
        self.insert(collection, id, document).await
    }

    async fn query_records<T: DeserializeOwned + Send + 'static>(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &QueryOptions,
    ) -> Result<Page<T>> {
        let page = self.query(collection, filter, options).await?;
        let items = page
            .items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<T>, _>>()
            .map_err(StateStoreError::from)?;
        Ok(Page {
            total: page.total,
            items,
        })
    }

    async fn find_one<T: DeserializeOwned + Send + 'static>(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<T>> {
        let options = QueryOptions {
            limit: Some(1),
            ..Default::default()
        };
        let page = self.query_records(collection, filter, &options).await?;
        Ok(page.items.into_iter().next())
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}

#[cfg(feature = "in-memory")]
pub mod in_memory;

/// Configuration for state store backends
#[derive(Debug, Clone)]
pub enum StateStoreConfig {
    #[cfg(feature = "in-memory")]
    InMemory,
}

// Helper function to create appropriate store based on config
pub fn create_state_store(config: StateStoreConfig) -> Result<Arc<dyn StateStore>> {
    match config {
        #[cfg(feature = "in-memory")]
        StateStoreConfig::InMemory => Ok(Arc::new(in_memory::InMemoryStateStore::new())),

        #[allow(unreachable_patterns)]
        _ => Err(ClusterError::ConfigError(
            "State store configuration not supported with current features".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matching() {
        let doc = json!({"name": "web", "status": "RUNNING", "user_id": "u1"});

        assert!(Filter::All.matches(&doc));
        assert!(Filter::eq("name", "web").matches(&doc));
        assert!(!Filter::eq("name", "db").matches(&doc));
        assert!(Filter::ne("status", "TERMINATED").matches(&doc));
        assert!(Filter::ne("missing", "x").matches(&doc));
        assert!(Filter::any_of("status", ["DEPLOYING", "RUNNING"]).matches(&doc));
        assert!(Filter::eq("name", "web")
            .and(Filter::eq("user_id", "u1"))
            .matches(&doc));
        assert!(!Filter::eq("name", "web")
            .and(Filter::eq("user_id", "u2"))
            .matches(&doc));
    }

    #[test]
    fn test_and_drops_all() {
        let f = Filter::eq("a", 1).and(Filter::All);
        assert_eq!(f, Filter::eq("a", 1));

        let f = Filter::All.and(Filter::eq("a", 1)).and(Filter::eq("b", 2));
        assert_eq!(f, Filter::And(vec![Filter::eq("a", 1), Filter::eq("b", 2)]));
    }

    #[test]
    fn test_sort_compare_timestamps() {
        let options = QueryOptions::sorted_by("time_create");
        let early = json!({"time_create": "2024-01-01T00:00:00Z"});
        let late = json!({"time_create": "2024-01-01T00:00:00.5Z"});
        assert_eq!(options.compare(&early, &late), Ordering::Less);

        let descending = QueryOptions::sorted_by("-time_create");
        assert_eq!(descending.compare(&early, &late), Ordering::Greater);
    }
}
