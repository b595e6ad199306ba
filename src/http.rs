//! [`ChromaService`] over the Chroma v2 REST API.
//!
//! Chroma servers store vectors but do not compute them, so text is embedded
//! here by an [`Embedder`] registered under the collection's embedding-function
//! id.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use crate::collections::DEFAULT_EMBEDDING_FUNCTION;
use crate::error::RemoteError;
use crate::metadata::Metadata;
use crate::service::*;
use crate::settings::{ConnectionProfile, EmbeddingProviderSettings, Settings};

/// Records moved per request while copying a collection.
pub const COPY_BATCH_SIZE: u32 = 100;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

fn http_client() -> Client {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default()
}

// ---- Embedders ----

#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input, in input order.
    async fn embed(
        &self,
        texts: &[String],
        dimension: Option<u32>,
    ) -> Result<Vec<Vec<f32>>, RemoteError>;
}

/// Any endpoint speaking the OpenAI `/embeddings` protocol.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    base_url: String,
    model: String,
    api_key: Option<String>,
    http: Client,
}

#[derive(Serialize)]
struct EmbeddingsBody<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<u32>,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            http: http_client(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn from_settings(provider: &EmbeddingProviderSettings) -> Self {
        let embedder = Self::new(&provider.base_url, &provider.model);
        match provider.api_key_env.as_deref() {
            Some(var) => match std::env::var(var) {
                Ok(key) => embedder.with_api_key(key),
                Err(_) => {
                    tracing::warn!(provider = %provider.id, var, "API key variable is not set");
                    embedder
                }
            },
            None => embedder,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(
        &self,
        texts: &[String],
        dimension: Option<u32>,
    ) -> Result<Vec<Vec<f32>>, RemoteError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let mut request = self.http.post(url).json(&EmbeddingsBody {
            model: &self.model,
            input: texts,
            dimensions: dimension,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let mut response: EmbeddingsResponse = send(request).await?;
        if response.data.len() != texts.len() {
            return Err(RemoteError::new(format!(
                "Embedding provider returned {} vectors for {} inputs",
                response.data.len(),
                texts.len()
            )));
        }
        response.data.sort_by_key(|item| item.index);
        Ok(response.data.into_iter().map(|item| item.embedding).collect())
    }
}

// ---- Wire types ----

#[derive(Debug, Clone, Deserialize)]
struct ChromaCollection {
    id: String,
    name: String,
    #[serde(default)]
    metadata: Option<Metadata>,
    #[serde(default, alias = "configuration")]
    configuration_json: Option<JsonValue>,
    #[serde(default)]
    dimension: Option<u32>,
}

impl ChromaCollection {
    fn embedding_function_json(&self) -> Option<&JsonValue> {
        self.configuration_json.as_ref()?.get("embedding_function")
    }

    fn embedding_function(&self) -> Option<String> {
        self.embedding_function_json()?
            .get("name")?
            .as_str()
            .map(str::to_string)
    }

    fn embedding_dimension(&self) -> Option<u32> {
        self.embedding_function_json()?
            .get("config")?
            .get("dimension")?
            .as_u64()
            .and_then(|d| u32::try_from(d).ok())
    }

    fn embedding_config(&self) -> EmbeddingFunctionConfig {
        EmbeddingFunctionConfig {
            id: self
                .embedding_function()
                .unwrap_or_else(|| DEFAULT_EMBEDDING_FUNCTION.to_string()),
            dimension: self.embedding_dimension(),
        }
    }

    fn into_summary(self, document_count: u64) -> CollectionSummary {
        CollectionSummary {
            embedding_function: self.embedding_function(),
            id: self.id,
            name: self.name,
            document_count,
            metadata: self.metadata,
            dimension: self.dimension,
        }
    }
}

#[derive(Debug, Serialize)]
struct GetBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#where: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u32>,
    include: Vec<&'static str>,
}

#[derive(Debug, Default, Deserialize)]
struct GetResponse {
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    documents: Option<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Option<Vec<Option<Metadata>>>,
    #[serde(default)]
    embeddings: Option<Vec<Vec<f32>>>,
}

impl GetResponse {
    fn into_records(self) -> Vec<DocumentRecord> {
        let mut documents = self.documents.unwrap_or_default().into_iter();
        let mut metadatas = self.metadatas.unwrap_or_default().into_iter();
        let mut embeddings = self.embeddings.unwrap_or_default().into_iter();
        self.ids
            .into_iter()
            .map(|id| DocumentRecord {
                id,
                document: documents.next().flatten(),
                metadata: metadatas.next().flatten(),
                embedding: embeddings.next(),
                distance: None,
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct QueryBody {
    query_embeddings: Vec<Vec<f32>>,
    n_results: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#where: Option<JsonValue>,
    include: Vec<&'static str>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Metadata>>>>,
    #[serde(default)]
    distances: Option<Vec<Vec<Option<f32>>>>,
}

impl QueryResponse {
    // One query embedding was sent, so only the first result list matters.
    fn into_records(self) -> Vec<DocumentRecord> {
        fn first<T>(batches: Option<Vec<Vec<T>>>) -> Vec<T> {
            batches
                .and_then(|b| b.into_iter().next())
                .unwrap_or_default()
        }
        let mut documents = first(self.documents).into_iter();
        let mut metadatas = first(self.metadatas).into_iter();
        let mut distances = first(self.distances).into_iter();
        self.ids
            .into_iter()
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(|id| DocumentRecord {
                id,
                document: documents.next().flatten(),
                metadata: metadatas.next().flatten(),
                embedding: None,
                distance: distances.next().flatten(),
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct AddBody {
    ids: Vec<String>,
    embeddings: Vec<Vec<f32>>,
    documents: Vec<Option<String>>,
    metadatas: Vec<Option<Metadata>>,
}

#[derive(Debug, Serialize)]
struct UpdateBody {
    ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    documents: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadatas: Option<Vec<JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    embeddings: Option<Vec<Vec<f32>>>,
}

#[derive(Debug, Deserialize)]
struct ChromaErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn hnsw_json(config: &HnswConfig) -> JsonValue {
    let mut hnsw = Map::new();
    if let Some(space) = config.space {
        hnsw.insert("space".to_string(), json!(space));
    }
    if let Some(value) = config.ef_construction {
        hnsw.insert("ef_construction".to_string(), json!(value));
    }
    if let Some(value) = config.ef_search {
        hnsw.insert("ef_search".to_string(), json!(value));
    }
    if let Some(value) = config.max_neighbors {
        hnsw.insert("max_neighbors".to_string(), json!(value));
    }
    JsonValue::Object(hnsw)
}

fn collection_configuration(
    embedding_function: &EmbeddingFunctionConfig,
    hnsw: Option<&HnswConfig>,
) -> JsonValue {
    let mut ef_config = Map::new();
    if let Some(dimension) = embedding_function.dimension {
        ef_config.insert("dimension".to_string(), json!(dimension));
    }
    let mut configuration = Map::new();
    configuration.insert(
        "embedding_function".to_string(),
        json!({
            "type": "known",
            "name": embedding_function.id,
            "config": ef_config,
        }),
    );
    if let Some(hnsw) = hnsw {
        configuration.insert("hnsw".to_string(), hnsw_json(hnsw));
    }
    JsonValue::Object(configuration)
}

/// Chroma merges update metadata into the stored map; a `null` value deletes
/// the key. Keys absent from `next` are therefore sent as `null`.
fn metadata_replacement(current: Option<&Metadata>, next: &Metadata) -> JsonValue {
    let mut out = Map::new();
    if let Some(current) = current {
        for key in current.keys().filter(|k| !next.contains_key(*k)) {
            out.insert(key.clone(), JsonValue::Null);
        }
    }
    for (key, value) in next {
        out.insert(key.clone(), json!(value));
    }
    JsonValue::Object(out)
}

async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, RemoteError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_from_body(status, &body))
}

async fn send_unit(request: RequestBuilder) -> Result<(), RemoteError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_from_body(status, &body))
}

fn error_from_body(status: reqwest::StatusCode, body: &str) -> RemoteError {
    let parsed = serde_json::from_str::<ChromaErrorBody>(body).ok();
    let message = parsed
        .and_then(|b| b.message.or(b.error))
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                format!("Chroma returned {}", status)
            } else {
                body.trim().to_string()
            }
        });
    RemoteError::new(message)
}

// ---- Service ----

/// One running collection copy, shared by its batches.
struct CopyJob<'a> {
    profile: &'a ConnectionProfile,
    source: &'a ChromaCollection,
    target: &'a ChromaCollection,
    request: &'a CopyCollectionRequest,
    total: u64,
    cancelled: &'a AtomicBool,
    progress: &'a UnboundedSender<CopyProgress>,
    /// Documents already written to the target.
    processed: u64,
}

impl CopyJob<'_> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub struct HttpChromaService {
    http: Client,
    profiles: RwLock<HashMap<String, ConnectionProfile>>,
    embedders: RwLock<HashMap<String, Arc<dyn Embedder>>>,
    copy_cancel: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl Default for HttpChromaService {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpChromaService {
    pub fn new() -> Self {
        Self {
            http: http_client(),
            profiles: RwLock::new(HashMap::new()),
            embedders: RwLock::new(HashMap::new()),
            copy_cancel: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let service = Self::new();
        service.apply_settings(settings);
        service
    }

    /// Replace every profile and provider-backed embedder.
    pub fn apply_settings(&self, settings: &Settings) {
        {
            let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
            profiles.clear();
            for profile in &settings.profiles {
                profiles.insert(profile.id.clone(), profile.clone());
            }
        }
        for provider in &settings.embedding_providers {
            self.register_embedder(&provider.id, Arc::new(OpenAiEmbedder::from_settings(provider)));
        }
        tracing::debug!(
            profiles = settings.profiles.len(),
            providers = settings.embedding_providers.len(),
            "applied connection settings"
        );
    }

    pub fn register_embedder(&self, embedding_function: &str, embedder: Arc<dyn Embedder>) {
        self.embedders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(embedding_function.to_string(), embedder);
    }

    fn profile(&self, profile_id: &str) -> Result<ConnectionProfile, RemoteError> {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(profile_id)
            .cloned()
            .ok_or_else(|| RemoteError::new(format!("Unknown connection \"{}\"", profile_id)))
    }

    fn embedder(&self, embedding_function: &str) -> Result<Arc<dyn Embedder>, RemoteError> {
        self.embedders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(embedding_function)
            .cloned()
            .ok_or_else(|| {
                RemoteError::new(format!(
                    "No embedder is configured for embedding function \"{}\"",
                    embedding_function
                ))
            })
    }

    async fn embed_with(
        &self,
        config: &EmbeddingFunctionConfig,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, RemoteError> {
        let embedder = self.embedder(&config.id)?;
        embedder.embed(texts, config.dimension).await.map_err(|err| {
            tracing::warn!(embedding_function = %config.id, "embedding failed: {}", err);
            err
        })
    }

    fn cancel_flag(&self, profile_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.copy_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(profile_id.to_string(), flag.clone());
        flag
    }

    fn request(&self, profile: &ConnectionProfile, method: Method, path: &str) -> RequestBuilder {
        let url = format!(
            "{}/api/v2/tenants/{}/databases/{}/collections{}",
            profile.url.trim_end_matches('/'),
            profile.tenant,
            profile.database,
            path
        );
        let request = self.http.request(method, url);
        match &profile.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_collection(
        &self,
        profile: &ConnectionProfile,
        name: &str,
    ) -> Result<ChromaCollection, RemoteError> {
        send(self.request(profile, Method::GET, &format!("/{}", name))).await
    }

    async fn count(
        &self,
        profile: &ConnectionProfile,
        collection_id: &str,
    ) -> Result<u64, RemoteError> {
        send(self.request(profile, Method::GET, &format!("/{}/count", collection_id))).await
    }

    async fn get_records(
        &self,
        profile: &ConnectionProfile,
        collection_id: &str,
        body: &GetBody,
    ) -> Result<Vec<DocumentRecord>, RemoteError> {
        let response: GetResponse = send(
            self.request(profile, Method::POST, &format!("/{}/get", collection_id))
                .json(body),
        )
        .await?;
        Ok(response.into_records())
    }

    async fn add_records(
        &self,
        profile: &ConnectionProfile,
        collection_id: &str,
        body: &AddBody,
    ) -> Result<(), RemoteError> {
        send_unit(
            self.request(profile, Method::POST, &format!("/{}/add", collection_id))
                .json(body),
        )
        .await
    }

    async fn create_raw(
        &self,
        profile: &ConnectionProfile,
        name: &str,
        embedding_function: &EmbeddingFunctionConfig,
        hnsw: Option<&HnswConfig>,
    ) -> Result<ChromaCollection, RemoteError> {
        let body = json!({
            "name": name,
            "configuration": collection_configuration(embedding_function, hnsw),
            "get_or_create": false,
        });
        send(self.request(profile, Method::POST, "").json(&body)).await
    }

    /// Vectors for new documents: supplied ones are kept, the rest are
    /// embedded with the collection's function when `generate` is set.
    async fn vectors_for(
        &self,
        collection: &ChromaCollection,
        documents: &[NewDocument],
        generate: bool,
    ) -> Result<Vec<Vec<f32>>, RemoteError> {
        let missing: Vec<String> = documents
            .iter()
            .filter(|d| d.embedding.is_none())
            .map(|d| d.document.clone())
            .collect();
        let mut generated = if missing.is_empty() {
            Vec::new().into_iter()
        } else if generate {
            self.embed_with(&collection.embedding_config(), &missing)
                .await?
                .into_iter()
        } else {
            return Err(RemoteError::new(
                "Documents without embeddings need embedding generation",
            ));
        };
        documents
            .iter()
            .map(|d| match &d.embedding {
                Some(embedding) => Ok(embedding.clone()),
                None => generated
                    .next()
                    .ok_or_else(|| RemoteError::new("Embedding provider returned too few vectors")),
            })
            .collect()
    }

    async fn insert_documents(
        &self,
        profile_id: &str,
        collection_name: &str,
        documents: &[NewDocument],
        generate: bool,
    ) -> Result<(), RemoteError> {
        let profile = self.profile(profile_id)?;
        let collection = self.get_collection(&profile, collection_name).await?;
        let embeddings = self.vectors_for(&collection, documents, generate).await?;
        let body = AddBody {
            ids: documents.iter().map(|d| d.id.clone()).collect(),
            embeddings,
            documents: documents.iter().map(|d| Some(d.document.clone())).collect(),
            metadatas: documents.iter().map(|d| d.metadata.clone()).collect(),
        };
        self.add_records(&profile, &collection.id, &body).await
    }

    /// Copy batch by batch until the source runs out. Returns true when the
    /// copy was cancelled. The flag is checked before each read and again
    /// before each write, so a cancel never lets another batch land.
    async fn copy_batches(&self, job: &mut CopyJob<'_>) -> Result<bool, RemoteError> {
        let request = job.request;
        let target_function = request
            .embedding_function
            .clone()
            .unwrap_or_else(|| job.source.embedding_config());
        let mut include = vec!["documents", "metadatas"];
        if !request.regenerate_embeddings {
            include.push("embeddings");
        }

        let mut offset: u32 = 0;
        loop {
            if job.is_cancelled() {
                return Ok(true);
            }
            let body = GetBody {
                ids: None,
                r#where: None,
                limit: Some(COPY_BATCH_SIZE),
                offset: Some(offset),
                include: include.clone(),
            };
            let batch = self.get_records(job.profile, &job.source.id, &body).await?;
            if batch.is_empty() {
                return Ok(false);
            }
            let count = batch.len();

            let documents: Vec<Option<String>> =
                batch.iter().map(|r| r.document.clone()).collect();
            let embeddings = if request.regenerate_embeddings {
                let texts: Vec<String> = documents
                    .iter()
                    .map(|d| d.clone().unwrap_or_default())
                    .collect();
                self.embed_with(&target_function, &texts).await?
            } else {
                batch
                    .iter()
                    .map(|r| {
                        r.embedding.clone().ok_or_else(|| {
                            RemoteError::new(format!("Document {} has no stored embedding", r.id))
                        })
                    })
                    .collect::<Result<_, _>>()?
            };
            if job.is_cancelled() {
                return Ok(true);
            }
            let add = AddBody {
                ids: batch.iter().map(|r| r.id.clone()).collect(),
                embeddings,
                documents,
                metadatas: batch.into_iter().map(|r| r.metadata).collect(),
            };
            self.add_records(job.profile, &job.target.id, &add).await?;

            job.processed += count as u64;
            offset += count as u32;
            let _ = job.progress.send(CopyProgress::Copying {
                processed_documents: job.processed,
                total_documents: job.total,
            });
            if (count as u32) < COPY_BATCH_SIZE {
                return Ok(false);
            }
        }
    }
}

#[async_trait]
impl ChromaService for HttpChromaService {
    async fn list_collections(
        &self,
        profile_id: &str,
    ) -> Result<Vec<CollectionSummary>, RemoteError> {
        let profile = self.profile(profile_id)?;
        let collections: Vec<ChromaCollection> =
            send(self.request(&profile, Method::GET, "")).await?;
        let mut summaries = Vec::with_capacity(collections.len());
        for collection in collections {
            let count = self.count(&profile, &collection.id).await?;
            summaries.push(collection.into_summary(count));
        }
        Ok(summaries)
    }

    async fn search_documents(
        &self,
        profile_id: &str,
        request: &SearchRequest,
    ) -> Result<Vec<DocumentRecord>, RemoteError> {
        let profile = self.profile(profile_id)?;
        let collection = self.get_collection(&profile, &request.collection_name).await?;
        let query_text = request
            .query_text
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty());

        match query_text {
            Some(text) => {
                let mut vectors = self
                    .embed_with(&collection.embedding_config(), &[text.to_string()])
                    .await?;
                let body = QueryBody {
                    query_embeddings: vec![vectors.pop().unwrap_or_default()],
                    n_results: request.n_results,
                    r#where: request.metadata_filter.clone(),
                    include: vec!["documents", "metadatas", "distances"],
                };
                let response: QueryResponse = send(
                    self.request(&profile, Method::POST, &format!("/{}/query", collection.id))
                        .json(&body),
                )
                .await?;
                Ok(response.into_records())
            }
            None => {
                let body = GetBody {
                    ids: None,
                    r#where: request.metadata_filter.clone(),
                    limit: Some(request.n_results),
                    offset: None,
                    include: vec!["documents", "metadatas"],
                };
                self.get_records(&profile, &collection.id, &body).await
            }
        }
    }

    async fn create_document(
        &self,
        profile_id: &str,
        request: &CreateDocumentRequest,
    ) -> Result<(), RemoteError> {
        self.insert_documents(
            profile_id,
            &request.collection_name,
            std::slice::from_ref(&request.document),
            request.generate_embedding,
        )
        .await
    }

    async fn create_documents_batch(
        &self,
        profile_id: &str,
        request: &CreateDocumentsBatchRequest,
    ) -> Result<(), RemoteError> {
        self.insert_documents(
            profile_id,
            &request.collection_name,
            &request.documents,
            request.generate_embeddings,
        )
        .await
    }

    async fn update_document(
        &self,
        profile_id: &str,
        request: &UpdateDocumentRequest,
    ) -> Result<(), RemoteError> {
        let profile = self.profile(profile_id)?;
        let collection = self.get_collection(&profile, &request.collection_name).await?;

        let needs_current = request.metadata.is_some()
            || (request.regenerate_embedding
                && request.document.is_none()
                && request.embedding.is_none());
        let current = if needs_current {
            let body = GetBody {
                ids: Some(vec![request.document_id.clone()]),
                r#where: None,
                limit: None,
                offset: None,
                include: vec!["documents", "metadatas"],
            };
            self.get_records(&profile, &collection.id, &body)
                .await?
                .into_iter()
                .next()
        } else {
            None
        };

        let embedding = match (&request.embedding, request.regenerate_embedding) {
            (Some(embedding), _) => Some(embedding.clone()),
            (None, true) => {
                let text = request
                    .document
                    .clone()
                    .or_else(|| current.as_ref().and_then(|c| c.document.clone()))
                    .unwrap_or_default();
                self.embed_with(&collection.embedding_config(), &[text])
                    .await?
                    .pop()
            }
            (None, false) => None,
        };
        let metadata = request.metadata.as_ref().map(|next| {
            metadata_replacement(current.as_ref().and_then(|c| c.metadata.as_ref()), next)
        });

        let body = UpdateBody {
            ids: vec![request.document_id.clone()],
            documents: request.document.clone().map(|d| vec![d]),
            metadatas: metadata.map(|m| vec![m]),
            embeddings: embedding.map(|e| vec![e]),
        };
        send_unit(
            self.request(&profile, Method::POST, &format!("/{}/update", collection.id))
                .json(&body),
        )
        .await
    }

    async fn delete_documents(
        &self,
        profile_id: &str,
        request: &DeleteDocumentsRequest,
    ) -> Result<(), RemoteError> {
        let profile = self.profile(profile_id)?;
        let collection = self.get_collection(&profile, &request.collection_name).await?;
        send_unit(
            self.request(&profile, Method::POST, &format!("/{}/delete", collection.id))
                .json(&json!({ "ids": request.ids })),
        )
        .await
    }

    async fn create_collection(
        &self,
        profile_id: &str,
        request: &CreateCollectionRequest,
    ) -> Result<(), RemoteError> {
        let profile = self.profile(profile_id)?;
        let collection = self
            .create_raw(
                &profile,
                &request.name,
                &request.embedding_function,
                request.hnsw_config.as_ref(),
            )
            .await?;
        if let Some(first) = &request.first_document {
            let documents = std::slice::from_ref(first);
            let embeddings = self.vectors_for(&collection, documents, true).await?;
            let body = AddBody {
                ids: vec![first.id.clone()],
                embeddings,
                documents: vec![Some(first.document.clone())],
                metadatas: vec![first.metadata.clone()],
            };
            self.add_records(&profile, &collection.id, &body).await?;
        }
        Ok(())
    }

    async fn copy_collection(
        &self,
        profile_id: &str,
        request: &CopyCollectionRequest,
        progress: UnboundedSender<CopyProgress>,
    ) -> Result<CopyCollectionOutcome, RemoteError> {
        let profile = self.profile(profile_id)?;
        let cancelled = self.cancel_flag(profile_id);
        let _ = progress.send(CopyProgress::Creating);

        let failed = |message: String, copied: u64, total: u64| {
            let _ = progress.send(CopyProgress::Error {
                message: message.clone(),
            });
            CopyCollectionOutcome {
                success: false,
                copied_documents: copied,
                total_documents: total,
                error: Some(message),
            }
        };

        let source = match self
            .get_collection(&profile, &request.source_collection_name)
            .await
        {
            Ok(source) => source,
            Err(err) => return Ok(failed(err.message, 0, 0)),
        };
        let total = match self.count(&profile, &source.id).await {
            Ok(total) => total,
            Err(err) => return Ok(failed(err.message, 0, 0)),
        };
        let embedding_function = request
            .embedding_function
            .clone()
            .unwrap_or_else(|| source.embedding_config());
        let target = match self
            .create_raw(
                &profile,
                &request.target_name,
                &embedding_function,
                request.hnsw_config.as_ref(),
            )
            .await
        {
            Ok(target) => target,
            Err(err) => return Ok(failed(err.message, 0, total)),
        };

        tracing::info!(
            source = %request.source_collection_name,
            target = %request.target_name,
            total,
            regenerate = request.regenerate_embeddings,
            "copying collection"
        );
        let mut job = CopyJob {
            profile: &profile,
            source: &source,
            target: &target,
            request,
            total,
            cancelled: &cancelled,
            progress: &progress,
            processed: 0,
        };
        let result = self.copy_batches(&mut job).await;
        let processed = job.processed;
        match result {
            Ok(true) => {
                tracing::info!(target = %request.target_name, processed, "copy cancelled");
                let _ = progress.send(CopyProgress::Cancelled);
                Ok(CopyCollectionOutcome {
                    success: false,
                    copied_documents: processed,
                    total_documents: total,
                    error: Some("Copy cancelled".to_string()),
                })
            }
            Ok(false) => {
                let _ = progress.send(CopyProgress::Complete {
                    processed_documents: processed,
                    total_documents: Some(total),
                });
                Ok(CopyCollectionOutcome {
                    success: true,
                    copied_documents: processed,
                    total_documents: total,
                    error: None,
                })
            }
            Err(err) => {
                tracing::warn!(target = %request.target_name, processed, "copy failed: {}", err);
                Ok(failed(err.message, processed, total))
            }
        }
    }

    async fn cancel_copy(&self, profile_id: &str) -> Result<(), RemoteError> {
        if let Some(flag) = self
            .copy_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(profile_id)
        {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn delete_collection(
        &self,
        profile_id: &str,
        collection_name: &str,
    ) -> Result<(), RemoteError> {
        let profile = self.profile(profile_id)?;
        send_unit(self.request(&profile, Method::DELETE, &format!("/{}", collection_name))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BASE: &str = "/api/v2/tenants/default_tenant/databases/default_database/collections";

    fn service_for(server: &MockServer) -> HttpChromaService {
        let mut settings = Settings::default();
        settings.profiles[0].url = server.uri();
        settings.profiles[0].auth_token = Some("secret".to_string());
        let service = HttpChromaService::from_settings(&settings);
        service.register_embedder(
            DEFAULT_EMBEDDING_FUNCTION,
            Arc::new(OpenAiEmbedder::new(format!("{}/v1", server.uri()), "mini")),
        );
        service
    }

    fn collection_json(id: &str, name: &str) -> JsonValue {
        json!({
            "id": id,
            "name": name,
            "metadata": null,
            "configuration_json": {
                "embedding_function": {"type": "known", "name": "default", "config": {}}
            },
            "dimension": 2
        })
    }

    async fn mount_collection(server: &MockServer, id: &str, name: &str) {
        Mock::given(method("GET"))
            .and(path(format!("{}/{}", BASE, name)))
            .respond_with(ResponseTemplate::new(200).set_body_json(collection_json(id, name)))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_list_collections_with_counts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(BASE))
            .and(header("authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([collection_json("c1", "docs")])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/c1/count", BASE)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(42)))
            .mount(&server)
            .await;

        let collections = service_for(&server).list_collections("local").await.unwrap();
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].name, "docs");
        assert_eq!(collections[0].document_count, 42);
        assert_eq!(collections[0].embedding_function.as_deref(), Some("default"));
        assert_eq!(collections[0].dimension, Some(2));
    }

    #[tokio::test]
    async fn test_listing_uses_get_with_filter() {
        let server = MockServer::start().await;
        mount_collection(&server, "c1", "docs").await;
        Mock::given(method("POST"))
            .and(path(format!("{}/c1/get", BASE)))
            .and(body_partial_json(json!({"where": {"year": {"$gt": 2000}}, "limit": 10})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ids": ["a", "b"],
                "documents": ["first", null],
                "metadatas": [{"year": 2001}, null]
            })))
            .mount(&server)
            .await;

        let request = SearchRequest {
            collection_name: "docs".to_string(),
            query_text: None,
            n_results: 10,
            metadata_filter: Some(json!({"year": {"$gt": 2000}})),
        };
        let records = service_for(&server)
            .search_documents("local", &request)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].document.as_deref(), Some("first"));
        assert_eq!(records[1].document, None);
        assert_eq!(records[1].metadata, None);
    }

    #[tokio::test]
    async fn test_semantic_search_embeds_then_queries() {
        let server = MockServer::start().await;
        mount_collection(&server, "c1", "docs").await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(body_partial_json(json!({"model": "mini", "input": ["cats"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"index": 0, "embedding": [0.5, 0.5]}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{}/c1/query", BASE)))
            .and(body_partial_json(json!({"query_embeddings": [[0.5, 0.5]], "n_results": 5})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ids": [["x"]],
                "documents": [["about cats"]],
                "metadatas": [[null]],
                "distances": [[0.25]]
            })))
            .mount(&server)
            .await;

        let request = SearchRequest {
            collection_name: "docs".to_string(),
            query_text: Some("cats".to_string()),
            n_results: 5,
            metadata_filter: None,
        };
        let records = service_for(&server)
            .search_documents("local", &request)
            .await
            .unwrap();
        assert_eq!(records[0].id, "x");
        assert_eq!(records[0].distance, Some(0.25));
    }

    #[tokio::test]
    async fn test_server_error_message_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{}/missing", BASE)))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": "NotFoundError",
                "message": "Collection [missing] does not exist"
            })))
            .mount(&server)
            .await;

        let err = service_for(&server)
            .delete_documents(
                "local",
                &DeleteDocumentsRequest {
                    collection_name: "missing".to_string(),
                    ids: vec!["a".to_string()],
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.message, "Collection [missing] does not exist");

        let err = service_for(&server).list_collections("nope").await.unwrap_err();
        assert!(err.message.contains("Unknown connection"));
    }

    #[tokio::test]
    async fn test_metadata_update_deletes_removed_keys() {
        let server = MockServer::start().await;
        mount_collection(&server, "c1", "docs").await;
        Mock::given(method("POST"))
            .and(path(format!("{}/c1/get", BASE)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ids": ["d1"],
                "documents": ["hello"],
                "metadatas": [{"a": 1, "b": "x"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{}/c1/update", BASE)))
            .and(body_partial_json(json!({
                "ids": ["d1"],
                "metadatas": [{"a": 3, "b": null}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let mut metadata = Metadata::new();
        metadata.insert("a".to_string(), 3i64.into());
        let request = UpdateDocumentRequest {
            collection_name: "docs".to_string(),
            document_id: "d1".to_string(),
            metadata: Some(metadata),
            ..Default::default()
        };
        service_for(&server)
            .update_document("local", &request)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_copy_reuses_vectors_and_reports_progress() {
        let server = MockServer::start().await;
        mount_collection(&server, "src", "docs").await;
        Mock::given(method("GET"))
            .and(path(format!("{}/src/count", BASE)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(2)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(BASE))
            .and(body_partial_json(json!({"name": "docs-copy"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(collection_json("dst", "docs-copy")),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{}/src/get", BASE)))
            .and(body_partial_json(json!({"offset": 0, "limit": 100})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ids": ["a", "b"],
                "documents": ["one", "two"],
                "metadatas": [null, {"k": true}],
                "embeddings": [[0.1, 0.2], [0.3, 0.4]]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{}/dst/add", BASE)))
            .and(body_partial_json(json!({
                "ids": ["a", "b"],
                "embeddings": [[0.1, 0.2], [0.3, 0.4]]
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = CopyCollectionRequest {
            source_collection_name: "docs".to_string(),
            target_name: "docs-copy".to_string(),
            embedding_function: None,
            hnsw_config: None,
            regenerate_embeddings: false,
        };
        let outcome = service_for(&server)
            .copy_collection("local", &request, tx)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.copied_documents, 2);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                CopyProgress::Creating,
                CopyProgress::Copying {
                    processed_documents: 2,
                    total_documents: 2
                },
                CopyProgress::Complete {
                    processed_documents: 2,
                    total_documents: Some(2)
                },
            ]
        );
    }

    fn batch_json(prefix: &str, n: usize) -> JsonValue {
        json!({
            "ids": (0..n).map(|i| format!("{}{}", prefix, i)).collect::<Vec<_>>(),
            "documents": (0..n).map(|i| format!("doc {}", i)).collect::<Vec<_>>(),
            "metadatas": vec![JsonValue::Null; n],
            "embeddings": vec![json!([0.1, 0.2]); n]
        })
    }

    async fn mount_copy_source(server: &MockServer, total: u64) {
        mount_collection(server, "src", "docs").await;
        Mock::given(method("GET"))
            .and(path(format!("{}/src/count", BASE)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(total)))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path(BASE))
            .and(body_partial_json(json!({"name": "docs-copy"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(collection_json("dst", "docs-copy")),
            )
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{}/src/get", BASE)))
            .and(body_partial_json(json!({"offset": 0})))
            .respond_with(ResponseTemplate::new(200).set_body_json(batch_json("a", 100)))
            .mount(server)
            .await;
    }

    fn copy_request() -> CopyCollectionRequest {
        CopyCollectionRequest {
            source_collection_name: "docs".to_string(),
            target_name: "docs-copy".to_string(),
            embedding_function: None,
            hnsw_config: None,
            regenerate_embeddings: false,
        }
    }

    #[tokio::test]
    async fn test_cancel_between_batches_stops_before_next_write() {
        let server = MockServer::start().await;
        mount_copy_source(&server, 250).await;
        Mock::given(method("POST"))
            .and(path(format!("{}/src/get", BASE)))
            .and(body_partial_json(json!({"offset": 100})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(batch_json("b", 100))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{}/src/get", BASE)))
            .and(body_partial_json(json!({"offset": 200})))
            .respond_with(ResponseTemplate::new(200).set_body_json(batch_json("c", 50)))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{}/dst/add", BASE)))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let service = service_for(&server);
        let request = copy_request();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (outcome, events) = tokio::join!(service.copy_collection("local", &request, tx), async {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                let first_batch_done = matches!(event, CopyProgress::Copying { .. });
                events.push(event);
                if first_batch_done {
                    service.cancel_copy("local").await.unwrap();
                }
            }
            events
        });

        let outcome = outcome.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.copied_documents, 100);
        assert_eq!(outcome.total_documents, 250);
        assert_eq!(
            events,
            vec![
                CopyProgress::Creating,
                CopyProgress::Copying {
                    processed_documents: 100,
                    total_documents: 250
                },
                CopyProgress::Cancelled,
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_mid_copy_reports_documents_already_copied() {
        let server = MockServer::start().await;
        mount_copy_source(&server, 150).await;
        Mock::given(method("POST"))
            .and(path(format!("{}/src/get", BASE)))
            .and(body_partial_json(json!({"offset": 100})))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({"message": "disk full"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{}/dst/add", BASE)))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = service_for(&server)
            .copy_collection("local", &copy_request(), tx)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.copied_documents, 100);
        assert_eq!(outcome.total_documents, 150);
        assert_eq!(outcome.error.as_deref(), Some("disk full"));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events.last(),
            Some(&CopyProgress::Error {
                message: "disk full".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_copy_of_missing_source_reports_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{}/gone", BASE)))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "not found"})))
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = CopyCollectionRequest {
            source_collection_name: "gone".to_string(),
            target_name: "gone-copy".to_string(),
            embedding_function: None,
            hnsw_config: None,
            regenerate_embeddings: false,
        };
        let outcome = service_for(&server)
            .copy_collection("local", &request, tx)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("not found"));
        assert_eq!(rx.try_recv().unwrap(), CopyProgress::Creating);
        assert_eq!(
            rx.try_recv().unwrap(),
            CopyProgress::Error {
                message: "not found".to_string()
            }
        );
    }

    #[test]
    fn test_collection_configuration_shape() {
        let config = collection_configuration(
            &EmbeddingFunctionConfig {
                id: "openai".to_string(),
                dimension: Some(256),
            },
            Some(&HnswConfig {
                space: Some(DistanceSpace::Cosine),
                ef_search: Some(64),
                ..Default::default()
            }),
        );
        assert_eq!(
            config,
            json!({
                "embedding_function": {
                    "type": "known",
                    "name": "openai",
                    "config": {"dimension": 256}
                },
                "hnsw": {"space": "cosine", "ef_search": 64}
            })
        );
    }
}
