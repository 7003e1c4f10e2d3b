use async_trait::async_trait;
use cluster_shared_types::Result;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{Collection, Filter, Page, QueryOptions, StateStore, StateStoreError};

/// In-memory implementation of StateStore
///
/// Documents are kept per collection in insertion order, so records with equal
/// sort keys come back in the order they were created. Suitable for testing,
/// development, and single-node deployments where persistence across restarts
/// is not required.
pub struct InMemoryStateStore {
    collections: Arc<RwLock<HashMap<Collection, Vec<(String, Value)>>>>,
}

impl InMemoryStateStore {
    /// Create a new in-memory state store
    pub fn new() -> Self {
        Self {
            collections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of documents in a collection (for testing).
    pub async fn count(&self, collection: Collection) -> usize {
        let collections = self.collections.read().await;
        collections.get(&collection).map(Vec::len).unwrap_or(0)
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn insert(&self, collection: Collection, id: &str, document: Value) -> Result<()> {
        let mut collections = self.collections.write().await;
        let documents = collections.entry(collection).or_default();
        if documents.iter().any(|(existing, _)| existing == id) {
            return Err(StateStoreError::AlreadyExists(format!("{}/{}", collection, id)).into());
        }
        documents.push((id.to_string(), document));
        Ok(())
    }

    async fn query(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &QueryOptions,
    ) -> Result<Page<Value>> {
        let collections = self.collections.read().await;
        let Some(documents) = collections.get(&collection) else {
            return Ok(Page::empty());
        };

        let mut matched: Vec<&Value> = documents
            .iter()
            .map(|(_, doc)| doc)
            .filter(|doc| filter.matches(doc))
            .collect();
        // stable: ties keep insertion order
        matched.sort_by(|a, b| options.compare(a, b));

        let total = matched.len();
        let items = matched
            .into_iter()
            .skip(options.skip)
            .take(options.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        Ok(Page { total, items })
    }

    async fn update_fields(
        &self,
        collection: Collection,
        filter: &Filter,
        fields: Map<String, Value>,
    ) -> Result<usize> {
        let mut collections = self.collections.write().await;
        let Some(documents) = collections.get_mut(&collection) else {
            return Ok(0);
        };

        let mut updated = 0;
        for (_, document) in documents.iter_mut() {
            if !filter.matches(document) {
                continue;
            }
            if let Value::Object(object) = document {
                for (key, value) in &fields {
                    object.insert(key.clone(), value.clone());
                }
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateStoreExt;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Record {
        id: String,
        name: String,
        rank: u32,
    }

    fn record(id: &str, name: &str, rank: u32) -> Record {
        Record {
            id: id.to_string(),
            name: name.to_string(),
            rank,
        }
    }

    #[tokio::test]
    async fn test_insert_and_query() {
        let store = InMemoryStateStore::new();
        store
            .insert_record(Collection::Clusters, "a", &record("a", "web", 2))
            .await
            .unwrap();
        store
            .insert_record(Collection::Clusters, "b", &record("b", "db", 1))
            .await
            .unwrap();

        let page: Page<Record> = store
            .query_records(Collection::Clusters, &Filter::All, &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].id, "a");

        let found: Option<Record> = store
            .find_one(Collection::Clusters, &Filter::eq("name", "db"))
            .await
            .unwrap();
        assert_eq!(found, Some(record("b", "db", 1)));

        // collections are independent
        assert_eq!(store.count(Collection::Hosts).await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = InMemoryStateStore::new();
        store
            .insert(Collection::Hosts, "h1", json!({"id": "h1"}))
            .await
            .unwrap();
        let result = store
            .insert(Collection::Hosts, "h1", json!({"id": "h1"}))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_sort_skip_limit() {
        let store = InMemoryStateStore::new();
        for (id, rank) in [("a", 3), ("b", 1), ("c", 2), ("d", 4)] {
            store
                .insert_record(Collection::Hosts, id, &record(id, "n", rank))
                .await
                .unwrap();
        }

        let options = QueryOptions {
            skip: 1,
            limit: Some(2),
            sort: Some("-rank".to_string()),
        };
        let page: Page<Record> = store
            .query_records(Collection::Hosts, &Filter::All, &options)
            .await
            .unwrap();
        assert_eq!(page.total, 4);
        let ids: Vec<_> = page.items.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_update_fields() {
        let store = InMemoryStateStore::new();
        store
            .insert_record(Collection::Hosts, "a", &record("a", "web", 1))
            .await
            .unwrap();
        store
            .insert_record(Collection::Hosts, "b", &record("b", "web", 2))
            .await
            .unwrap();

        let mut fields = Map::new();
        fields.insert("rank".to_string(), json!(9));
        let updated = store
            .update_fields(Collection::Hosts, &Filter::eq("id", "b"), fields)
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let b: Option<Record> = store
            .find_one(Collection::Hosts, &Filter::eq("id", "b"))
            .await
            .unwrap();
        assert_eq!(b.unwrap().rank, 9);

        let none = store
            .update_fields(Collection::Clusters, &Filter::All, Map::new())
            .await
            .unwrap();
        assert_eq!(none, 0);
    }
}
