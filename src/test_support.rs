//! In-memory `ChromaService` for unit tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;

use crate::error::RemoteError;
use crate::service::*;

#[derive(Default)]
pub struct CallCounts {
    pub list_collections: AtomicUsize,
    pub search_documents: AtomicUsize,
    pub create_document: AtomicUsize,
    pub create_documents_batch: AtomicUsize,
    pub update_document: AtomicUsize,
    pub delete_documents: AtomicUsize,
    pub create_collection: AtomicUsize,
    pub copy_collection: AtomicUsize,
    pub cancel_copy: AtomicUsize,
    pub delete_collection: AtomicUsize,
}

impl CallCounts {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        [
            &self.list_collections,
            &self.search_documents,
            &self.create_document,
            &self.create_documents_batch,
            &self.update_document,
            &self.delete_documents,
            &self.create_collection,
            &self.copy_collection,
            &self.cancel_copy,
            &self.delete_collection,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }
}

/// Collections keyed by name, each holding its documents in insertion order.
///
/// `copy_collection` sends `copy_events` and then, in order of precedence:
/// fails with `copy_error` after creating an empty target, waits for
/// `cancel_copy` when `block_copy` is set, or copies everything.
#[derive(Default)]
pub struct MockService {
    pub calls: CallCounts,
    pub collections: Mutex<BTreeMap<String, Vec<DocumentRecord>>>,
    pub fail_with: Mutex<Option<String>>,
    pub copy_events: Mutex<Vec<CopyProgress>>,
    pub copy_error: Mutex<Option<String>>,
    pub block_copy: AtomicBool,
    pub last_update: Mutex<Option<UpdateDocumentRequest>>,
    cancel_requested: Notify,
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(self, name: &str, docs: Vec<DocumentRecord>) -> Self {
        self.collections
            .lock()
            .unwrap()
            .insert(name.to_string(), docs);
        self
    }

    pub fn fail_next(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }

    pub fn ids(&self, collection: &str) -> Vec<String> {
        self.collections
            .lock()
            .unwrap()
            .get(collection)
            .map(|docs| docs.iter().map(|d| d.id.clone()).collect())
            .unwrap_or_default()
    }

    fn check(&self, counter: &AtomicUsize) -> Result<(), RemoteError> {
        counter.fetch_add(1, Ordering::SeqCst);
        match self.fail_with.lock().unwrap().take() {
            Some(message) => Err(RemoteError::new(message)),
            None => Ok(()),
        }
    }

    fn insert(&self, collection: &str, docs: &[NewDocument]) -> Result<(), RemoteError> {
        let mut collections = self.collections.lock().unwrap();
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| RemoteError::new(format!("Collection {} does not exist", collection)))?;
        for doc in docs {
            target.push(DocumentRecord {
                id: doc.id.clone(),
                document: Some(doc.document.clone()),
                metadata: doc.metadata.clone(),
                embedding: None,
                distance: None,
            });
        }
        Ok(())
    }
}

pub fn record(id: &str) -> DocumentRecord {
    DocumentRecord {
        id: id.to_string(),
        document: Some(format!("text of {}", id)),
        metadata: None,
        embedding: Some(vec![0.0, 1.0]),
        distance: None,
    }
}

#[async_trait]
impl ChromaService for MockService {
    async fn list_collections(
        &self,
        _profile_id: &str,
    ) -> Result<Vec<CollectionSummary>, RemoteError> {
        self.check(&self.calls.list_collections)?;
        let collections = self.collections.lock().unwrap();
        Ok(collections
            .iter()
            .map(|(name, docs)| CollectionSummary {
                id: format!("id-{}", name),
                name: name.clone(),
                document_count: docs.len() as u64,
                metadata: None,
                embedding_function: Some("default".to_string()),
                dimension: None,
            })
            .collect())
    }

    async fn search_documents(
        &self,
        _profile_id: &str,
        request: &SearchRequest,
    ) -> Result<Vec<DocumentRecord>, RemoteError> {
        self.check(&self.calls.search_documents)?;
        let collections = self.collections.lock().unwrap();
        let docs = collections
            .get(&request.collection_name)
            .cloned()
            .unwrap_or_default();
        Ok(docs.into_iter().take(request.n_results as usize).collect())
    }

    async fn create_document(
        &self,
        _profile_id: &str,
        request: &CreateDocumentRequest,
    ) -> Result<(), RemoteError> {
        self.check(&self.calls.create_document)?;
        self.insert(&request.collection_name, std::slice::from_ref(&request.document))
    }

    async fn create_documents_batch(
        &self,
        _profile_id: &str,
        request: &CreateDocumentsBatchRequest,
    ) -> Result<(), RemoteError> {
        self.check(&self.calls.create_documents_batch)?;
        self.insert(&request.collection_name, &request.documents)
    }

    async fn update_document(
        &self,
        _profile_id: &str,
        request: &UpdateDocumentRequest,
    ) -> Result<(), RemoteError> {
        self.check(&self.calls.update_document)?;
        *self.last_update.lock().unwrap() = Some(request.clone());
        let mut collections = self.collections.lock().unwrap();
        if let Some(doc) = collections
            .get_mut(&request.collection_name)
            .and_then(|docs| docs.iter_mut().find(|d| d.id == request.document_id))
        {
            if let Some(text) = &request.document {
                doc.document = Some(text.clone());
            }
            if let Some(metadata) = &request.metadata {
                doc.metadata = Some(metadata.clone());
            }
        }
        Ok(())
    }

    async fn delete_documents(
        &self,
        _profile_id: &str,
        request: &DeleteDocumentsRequest,
    ) -> Result<(), RemoteError> {
        self.check(&self.calls.delete_documents)?;
        let mut collections = self.collections.lock().unwrap();
        if let Some(docs) = collections.get_mut(&request.collection_name) {
            docs.retain(|d| !request.ids.contains(&d.id));
        }
        Ok(())
    }

    async fn create_collection(
        &self,
        _profile_id: &str,
        request: &CreateCollectionRequest,
    ) -> Result<(), RemoteError> {
        self.check(&self.calls.create_collection)?;
        self.collections
            .lock()
            .unwrap()
            .insert(request.name.clone(), Vec::new());
        if let Some(first) = &request.first_document {
            self.insert(&request.name, std::slice::from_ref(first))?;
        }
        Ok(())
    }

    async fn copy_collection(
        &self,
        _profile_id: &str,
        request: &CopyCollectionRequest,
        progress: UnboundedSender<CopyProgress>,
    ) -> Result<CopyCollectionOutcome, RemoteError> {
        self.check(&self.calls.copy_collection)?;
        let events = self.copy_events.lock().unwrap().clone();
        for event in events {
            let _ = progress.send(event);
        }
        let total = self
            .collections
            .lock()
            .unwrap()
            .get(&request.source_collection_name)
            .map_or(0, |docs| docs.len() as u64);
        let partial = |error: Option<String>| {
            self.collections
                .lock()
                .unwrap()
                .insert(request.target_name.clone(), Vec::new());
            CopyCollectionOutcome {
                success: false,
                copied_documents: 0,
                total_documents: total,
                error,
            }
        };

        let copy_error = self.copy_error.lock().unwrap().take();
        if let Some(message) = copy_error {
            let _ = progress.send(CopyProgress::Error {
                message: message.clone(),
            });
            return Ok(partial(Some(message)));
        }
        if self.block_copy.load(Ordering::SeqCst) {
            let outcome = partial(None);
            self.cancel_requested.notified().await;
            let _ = progress.send(CopyProgress::Cancelled);
            return Ok(outcome);
        }

        let mut collections = self.collections.lock().unwrap();
        let source = collections
            .get(&request.source_collection_name)
            .cloned()
            .unwrap_or_default();
        collections.insert(request.target_name.clone(), source);
        Ok(CopyCollectionOutcome {
            success: true,
            copied_documents: total,
            total_documents: total,
            error: None,
        })
    }

    async fn cancel_copy(&self, _profile_id: &str) -> Result<(), RemoteError> {
        self.check(&self.calls.cancel_copy)?;
        self.cancel_requested.notify_one();
        Ok(())
    }

    async fn delete_collection(
        &self,
        _profile_id: &str,
        collection_name: &str,
    ) -> Result<(), RemoteError> {
        self.check(&self.calls.delete_collection)?;
        self.collections.lock().unwrap().remove(collection_name);
        Ok(())
    }
}
