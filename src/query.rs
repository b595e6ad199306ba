//! Cached reads and precisely invalidating writes over a [`ChromaService`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::error::RemoteError;
use crate::service::*;

/// Search results and counts move quickly.
pub const DOCUMENTS_FRESH_FOR: Duration = Duration::from_secs(30);
/// Collections rarely appear or disappear.
pub const COLLECTIONS_FRESH_FOR: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Collections {
        profile_id: String,
    },
    Documents {
        profile_id: String,
        collection_name: String,
        /// The serialized request, so every distinct search gets its own entry.
        request: String,
    },
}

impl QueryKey {
    pub fn documents(profile_id: &str, request: &SearchRequest) -> Self {
        QueryKey::Documents {
            profile_id: profile_id.to_string(),
            collection_name: request.collection_name.clone(),
            request: serde_json::to_string(request).unwrap_or_default(),
        }
    }

    pub fn collections(profile_id: &str) -> Self {
        QueryKey::Collections {
            profile_id: profile_id.to_string(),
        }
    }

    fn fresh_for(&self) -> Duration {
        match self {
            QueryKey::Collections { .. } => COLLECTIONS_FRESH_FOR,
            QueryKey::Documents { .. } => DOCUMENTS_FRESH_FOR,
        }
    }

    fn is_documents_of(&self, profile: &str, collection: &str) -> bool {
        matches!(
            self,
            QueryKey::Documents { profile_id, collection_name, .. }
                if profile_id == profile && collection_name == collection
        )
    }

    fn is_collections_of(&self, profile: &str) -> bool {
        matches!(self, QueryKey::Collections { profile_id } if profile_id == profile)
    }
}

#[derive(Debug, Clone)]
enum CachedValue {
    Collections(Vec<CollectionSummary>),
    Documents(Vec<DocumentRecord>),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedValue,
    fetched_at: Instant,
}

pub struct QueryClient {
    service: Arc<dyn ChromaService>,
    cache: Mutex<HashMap<QueryKey, CacheEntry>>,
}

impl QueryClient {
    pub fn new(service: Arc<dyn ChromaService>) -> Self {
        Self {
            service,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn service(&self) -> &Arc<dyn ChromaService> {
        &self.service
    }

    fn lookup(&self, key: &QueryKey) -> Option<CachedValue> {
        let cache = self.cache.lock().ok()?;
        let entry = cache.get(key)?;
        if entry.fetched_at.elapsed() < key.fresh_for() {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Insert a fresh entry. Expired entries are dropped on the way so
    /// searches that are never repeated do not pile up.
    fn store(&self, key: QueryKey, value: CachedValue) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.retain(|cached, entry| entry.fetched_at.elapsed() < cached.fresh_for());
            cache.insert(
                key,
                CacheEntry {
                    value,
                    fetched_at: Instant::now(),
                },
            );
        }
    }

    /// Drop every cached entry matching `predicate`. Returns how many went.
    pub fn invalidate_where(&self, predicate: impl Fn(&QueryKey) -> bool) -> usize {
        let Ok(mut cache) = self.cache.lock() else {
            return 0;
        };
        let before = cache.len();
        cache.retain(|key, _| !predicate(key));
        before - cache.len()
    }

    /// Every search of `collection` plus the collections list, whose document
    /// counts just changed.
    pub fn invalidate_documents(&self, profile_id: &str, collection: &str) {
        let removed = self.invalidate_where(|key| {
            key.is_documents_of(profile_id, collection) || key.is_collections_of(profile_id)
        });
        tracing::debug!(collection, removed, "invalidated document queries");
    }

    pub fn invalidate_collections(&self, profile_id: &str) {
        self.invalidate_where(|key| key.is_collections_of(profile_id));
    }

    pub fn is_cached(&self, key: &QueryKey) -> bool {
        self.lookup(key).is_some()
    }

    // ---- Reads ----

    pub async fn list_collections(
        &self,
        profile_id: &str,
    ) -> Result<Vec<CollectionSummary>, RemoteError> {
        let key = QueryKey::collections(profile_id);
        if let Some(CachedValue::Collections(cached)) = self.lookup(&key) {
            return Ok(cached);
        }
        let collections = self.service.list_collections(profile_id).await?;
        self.store(key, CachedValue::Collections(collections.clone()));
        Ok(collections)
    }

    pub async fn search_documents(
        &self,
        profile_id: &str,
        request: &SearchRequest,
    ) -> Result<Vec<DocumentRecord>, RemoteError> {
        let key = QueryKey::documents(profile_id, request);
        if let Some(CachedValue::Documents(cached)) = self.lookup(&key) {
            return Ok(cached);
        }
        let documents = self.service.search_documents(profile_id, request).await?;
        self.store(key, CachedValue::Documents(documents.clone()));
        Ok(documents)
    }

    // ---- Document writes ----

    pub async fn create_document(
        &self,
        profile_id: &str,
        request: &CreateDocumentRequest,
    ) -> Result<(), RemoteError> {
        self.service.create_document(profile_id, request).await?;
        self.invalidate_documents(profile_id, &request.collection_name);
        Ok(())
    }

    pub async fn create_documents_batch(
        &self,
        profile_id: &str,
        request: &CreateDocumentsBatchRequest,
    ) -> Result<(), RemoteError> {
        self.service
            .create_documents_batch(profile_id, request)
            .await?;
        self.invalidate_documents(profile_id, &request.collection_name);
        Ok(())
    }

    pub async fn update_document(
        &self,
        profile_id: &str,
        request: &UpdateDocumentRequest,
    ) -> Result<(), RemoteError> {
        self.service.update_document(profile_id, request).await?;
        self.invalidate_documents(profile_id, &request.collection_name);
        Ok(())
    }

    pub async fn delete_documents(
        &self,
        profile_id: &str,
        request: &DeleteDocumentsRequest,
    ) -> Result<(), RemoteError> {
        self.service.delete_documents(profile_id, request).await?;
        self.invalidate_documents(profile_id, &request.collection_name);
        Ok(())
    }

    // ---- Collection writes ----

    pub async fn create_collection(
        &self,
        profile_id: &str,
        request: &CreateCollectionRequest,
    ) -> Result<(), RemoteError> {
        self.service.create_collection(profile_id, request).await?;
        self.invalidate_collections(profile_id);
        Ok(())
    }

    pub async fn delete_collection(
        &self,
        profile_id: &str,
        collection_name: &str,
    ) -> Result<(), RemoteError> {
        self.service
            .delete_collection(profile_id, collection_name)
            .await?;
        self.invalidate_collections(profile_id);
        Ok(())
    }

    pub async fn copy_collection(
        &self,
        profile_id: &str,
        request: &CopyCollectionRequest,
        progress: UnboundedSender<CopyProgress>,
    ) -> Result<CopyCollectionOutcome, RemoteError> {
        let outcome = self
            .service
            .copy_collection(profile_id, request, progress)
            .await;
        // A failed or cancelled copy can still leave the target behind.
        self.invalidate_collections(profile_id);
        outcome
    }

    pub async fn cancel_copy(&self, profile_id: &str) -> Result<(), RemoteError> {
        self.service.cancel_copy(profile_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{record, CallCounts, MockService};

    fn search(collection: &str, query: Option<&str>) -> SearchRequest {
        SearchRequest {
            collection_name: collection.to_string(),
            query_text: query.map(str::to_string),
            n_results: 10,
            metadata_filter: None,
        }
    }

    fn setup() -> (Arc<MockService>, QueryClient) {
        let mock = Arc::new(
            MockService::new()
                .with_collection("docs", vec![record("1"), record("2")])
                .with_collection("other", vec![record("x")]),
        );
        let client = QueryClient::new(mock.clone());
        (mock, client)
    }

    #[tokio::test]
    async fn test_reads_are_cached() {
        let (mock, client) = setup();
        client.search_documents("p", &search("docs", None)).await.unwrap();
        client.search_documents("p", &search("docs", None)).await.unwrap();
        assert_eq!(CallCounts::get(&mock.calls.search_documents), 1);

        client.search_documents("p", &search("docs", Some("q"))).await.unwrap();
        assert_eq!(CallCounts::get(&mock.calls.search_documents), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_windows() {
        let (mock, client) = setup();
        client.search_documents("p", &search("docs", None)).await.unwrap();
        client.list_collections("p").await.unwrap();

        tokio::time::advance(DOCUMENTS_FRESH_FOR + Duration::from_secs(1)).await;
        client.search_documents("p", &search("docs", None)).await.unwrap();
        client.list_collections("p").await.unwrap();
        assert_eq!(CallCounts::get(&mock.calls.search_documents), 2);
        assert_eq!(CallCounts::get(&mock.calls.list_collections), 1);

        tokio::time::advance(COLLECTIONS_FRESH_FOR).await;
        client.list_collections("p").await.unwrap();
        assert_eq!(CallCounts::get(&mock.calls.list_collections), 2);
    }

    #[tokio::test]
    async fn test_document_mutation_invalidates_matching_collection_only() {
        let (_mock, client) = setup();
        let docs_plain = search("docs", None);
        let docs_query = search("docs", Some("hello"));
        let other = search("other", None);
        client.search_documents("p", &docs_plain).await.unwrap();
        client.search_documents("p", &docs_query).await.unwrap();
        client.search_documents("p", &other).await.unwrap();
        client.list_collections("p").await.unwrap();

        client
            .delete_documents(
                "p",
                &DeleteDocumentsRequest {
                    collection_name: "docs".to_string(),
                    ids: vec!["1".to_string()],
                },
            )
            .await
            .unwrap();

        assert!(!client.is_cached(&QueryKey::documents("p", &docs_plain)));
        assert!(!client.is_cached(&QueryKey::documents("p", &docs_query)));
        assert!(client.is_cached(&QueryKey::documents("p", &other)));
        assert!(!client.is_cached(&QueryKey::collections("p")));

        let rows = client.search_documents("p", &docs_plain).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_pruned_on_store() {
        let (_mock, client) = setup();
        for n in 0..5 {
            client
                .search_documents("p", &search("docs", Some(&format!("q{}", n))))
                .await
                .unwrap();
        }
        client.list_collections("p").await.unwrap();
        assert_eq!(client.cache.lock().unwrap().len(), 6);

        tokio::time::advance(DOCUMENTS_FRESH_FOR + Duration::from_secs(1)).await;
        client.search_documents("p", &search("other", None)).await.unwrap();
        let cache = client.cache.lock().unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.contains_key(&QueryKey::collections("p")));
    }

    #[tokio::test]
    async fn test_unsuccessful_copy_still_invalidates_collections() {
        let (mock, client) = setup();
        assert_eq!(client.list_collections("p").await.unwrap().len(), 2);
        *mock.copy_error.lock().unwrap() = Some("embedding failed".to_string());

        let request = CopyCollectionRequest {
            source_collection_name: "docs".to_string(),
            target_name: "docs-copy".to_string(),
            embedding_function: None,
            hnsw_config: None,
            regenerate_embeddings: true,
        };
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let outcome = client.copy_collection("p", &request, tx).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("embedding failed"));
        assert!(!client.is_cached(&QueryKey::collections("p")));

        let names: Vec<String> = client
            .list_collections("p")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert!(names.contains(&"docs-copy".to_string()));
    }

    #[tokio::test]
    async fn test_failed_mutation_keeps_cache() {
        let (mock, client) = setup();
        client.list_collections("p").await.unwrap();
        mock.fail_next("boom");
        let err = client.delete_collection("p", "docs").await.unwrap_err();
        assert_eq!(err.message, "boom");
        assert!(client.is_cached(&QueryKey::collections("p")));

        client.delete_collection("p", "docs").await.unwrap();
        assert!(!client.is_cached(&QueryKey::collections("p")));
    }
}
