//! The contract with the database driver. Everything the core needs from the
//! outside world goes through [`ChromaService`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::RemoteError;
use crate::metadata::Metadata;

// ---- Records ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub document_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub id: String,
    pub document: Option<String>,
    pub metadata: Option<Metadata>,
    pub embedding: Option<Vec<f32>>,
    /// Only present on semantic search results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

// ---- Requests ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub collection_name: String,
    pub query_text: Option<String>,
    pub n_results: u32,
    /// A Chroma `where` clause.
    pub metadata_filter: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDocument {
    pub id: String,
    pub document: String,
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentRequest {
    pub collection_name: String,
    pub document: NewDocument,
    pub generate_embedding: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentsBatchRequest {
    pub collection_name: String,
    pub documents: Vec<NewDocument>,
    pub generate_embeddings: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDocumentRequest {
    pub collection_name: String,
    pub document_id: String,
    pub document: Option<String>,
    pub metadata: Option<Metadata>,
    pub embedding: Option<Vec<f32>>,
    pub regenerate_embedding: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDocumentsRequest {
    pub collection_name: String,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceSpace {
    L2,
    Cosine,
    Ip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HnswConfig {
    pub space: Option<DistanceSpace>,
    pub ef_construction: Option<u32>,
    pub ef_search: Option<u32>,
    pub max_neighbors: Option<u32>,
}

/// Which embedding function a collection uses, by id, and an optional output
/// dimension for functions that support truncation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingFunctionConfig {
    pub id: String,
    #[serde(default)]
    pub dimension: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCollectionRequest {
    pub name: String,
    pub embedding_function: EmbeddingFunctionConfig,
    pub hnsw_config: Option<HnswConfig>,
    pub first_document: Option<NewDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyCollectionRequest {
    pub source_collection_name: String,
    pub target_name: String,
    pub embedding_function: Option<EmbeddingFunctionConfig>,
    pub hnsw_config: Option<HnswConfig>,
    pub regenerate_embeddings: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyCollectionOutcome {
    pub success: bool,
    #[serde(default)]
    pub copied_documents: u64,
    #[serde(default)]
    pub total_documents: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Progress of a running collection copy, as streamed to the progress dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum CopyProgress {
    Creating,
    #[serde(rename_all = "camelCase")]
    Copying {
        processed_documents: u64,
        total_documents: u64,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        processed_documents: u64,
        #[serde(default)]
        total_documents: Option<u64>,
    },
    Error {
        message: String,
    },
    Cancelled,
}

// ---- Boundary ----

#[async_trait]
pub trait ChromaService: Send + Sync {
    async fn list_collections(&self, profile_id: &str)
        -> Result<Vec<CollectionSummary>, RemoteError>;

    async fn search_documents(
        &self,
        profile_id: &str,
        request: &SearchRequest,
    ) -> Result<Vec<DocumentRecord>, RemoteError>;

    async fn create_document(
        &self,
        profile_id: &str,
        request: &CreateDocumentRequest,
    ) -> Result<(), RemoteError>;

    async fn create_documents_batch(
        &self,
        profile_id: &str,
        request: &CreateDocumentsBatchRequest,
    ) -> Result<(), RemoteError>;

    async fn update_document(
        &self,
        profile_id: &str,
        request: &UpdateDocumentRequest,
    ) -> Result<(), RemoteError>;

    async fn delete_documents(
        &self,
        profile_id: &str,
        request: &DeleteDocumentsRequest,
    ) -> Result<(), RemoteError>;

    async fn create_collection(
        &self,
        profile_id: &str,
        request: &CreateCollectionRequest,
    ) -> Result<(), RemoteError>;

    /// Long-running; progress is pushed to `progress` until a terminal phase.
    async fn copy_collection(
        &self,
        profile_id: &str,
        request: &CopyCollectionRequest,
        progress: UnboundedSender<CopyProgress>,
    ) -> Result<CopyCollectionOutcome, RemoteError>;

    async fn cancel_copy(&self, profile_id: &str) -> Result<(), RemoteError>;

    async fn delete_collection(
        &self,
        profile_id: &str,
        collection_name: &str,
    ) -> Result<(), RemoteError>;
}
