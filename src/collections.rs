use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::OnceLock;

use crate::drafts::{resolve_conflicting_id, DraftDocument};
use crate::error::{RemoteError, ValidationError};
use crate::service::{
    CollectionSummary, CopyCollectionOutcome, CopyCollectionRequest, CopyProgress,
    CreateCollectionRequest, EmbeddingFunctionConfig, HnswConfig,
};

pub const DEFAULT_EMBEDDING_FUNCTION: &str = "default";

// ---- Naming ----

fn allowed_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("collection name pattern"))
}

pub fn validate_collection_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| Err(ValidationError::CollectionName(reason.to_string()));
    let len = name.chars().count();
    if !(3..=512).contains(&len) {
        return invalid("must be between 3 and 512 characters");
    }
    if !allowed_chars().is_match(name) {
        return invalid("may only contain letters, numbers, periods, hyphens and underscores");
    }
    let alnum = |c: Option<char>| c.map_or(false, |c| c.is_ascii_alphanumeric());
    if !alnum(name.chars().next()) || !alnum(name.chars().last()) {
        return invalid("must start and end with a letter or number");
    }
    if name.contains("..") {
        return invalid("must not contain two consecutive periods");
    }
    if name.parse::<Ipv4Addr>().is_ok() {
        return invalid("must not be an IPv4 address");
    }
    Ok(())
}

// ---- Draft collection ----

#[derive(Debug, Clone, PartialEq)]
pub enum CollectionCommit {
    Create(CreateCollectionRequest),
    Copy(CopyCollectionRequest),
}

/// A collection being created, or a copied one being pasted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftCollection {
    pub name: String,
    pub embedding_function_id: String,
    pub dimension_override: Option<u32>,
    #[serde(default)]
    pub hnsw_config: Option<HnswConfig>,
    #[serde(default)]
    pub first_document: Option<DraftDocument>,
    #[serde(default)]
    pub source_collection: Option<CollectionSummary>,
}

impl DraftCollection {
    pub fn blank() -> Self {
        Self {
            name: String::new(),
            embedding_function_id: DEFAULT_EMBEDDING_FUNCTION.to_string(),
            dimension_override: None,
            hnsw_config: None,
            first_document: None,
            source_collection: None,
        }
    }

    /// Copy mode: the name is the source's, de-conflicted against `existing`.
    pub fn from_copied(source: &CollectionSummary, existing: &[String]) -> Self {
        let mut used: HashSet<String> = existing.iter().cloned().collect();
        Self {
            name: resolve_conflicting_id(&source.name, &mut used),
            embedding_function_id: source
                .embedding_function
                .clone()
                .unwrap_or_else(|| DEFAULT_EMBEDDING_FUNCTION.to_string()),
            dimension_override: None,
            hnsw_config: None,
            first_document: None,
            source_collection: Some(source.clone()),
        }
    }

    pub fn is_copy(&self) -> bool {
        self.source_collection.is_some()
    }

    fn embedding_function(&self) -> EmbeddingFunctionConfig {
        EmbeddingFunctionConfig {
            id: self.embedding_function_id.clone(),
            dimension: self.dimension_override,
        }
    }

    /// Vectors can only be reused when the target embeds exactly like the source.
    pub fn needs_regeneration(&self) -> bool {
        let Some(source) = &self.source_collection else {
            return false;
        };
        let source_function = source
            .embedding_function
            .as_deref()
            .unwrap_or(DEFAULT_EMBEDDING_FUNCTION);
        let dimension_differs = self
            .dimension_override
            .map_or(false, |d| Some(d) != source.dimension);
        source_function != self.embedding_function_id || dimension_differs
    }

    pub fn prepare_commit(&self, existing: &[String]) -> Result<CollectionCommit, ValidationError> {
        let name = self.name.trim();
        validate_collection_name(name)?;
        if existing.iter().any(|n| n == name) {
            return Err(ValidationError::CollectionName("is already in use".to_string()));
        }
        if self.embedding_function_id.trim().is_empty() {
            return Err(ValidationError::Field(
                "An embedding function is required".to_string(),
            ));
        }

        if let Some(source) = &self.source_collection {
            return Ok(CollectionCommit::Copy(CopyCollectionRequest {
                source_collection_name: source.name.clone(),
                target_name: name.to_string(),
                embedding_function: Some(self.embedding_function()),
                hnsw_config: self.hnsw_config.clone(),
                regenerate_embeddings: self.needs_regeneration(),
            }));
        }

        let first_document = match &self.first_document {
            Some(draft) if !(draft.document.trim().is_empty() && draft.metadata.is_empty()) => {
                Some(draft.to_new_document().map_err(|message| {
                    ValidationError::Draft {
                        position: 1,
                        message,
                    }
                })?)
            }
            _ => None,
        };

        Ok(CollectionCommit::Create(CreateCollectionRequest {
            name: name.to_string(),
            embedding_function: self.embedding_function(),
            hnsw_config: self.hnsw_config.clone(),
            first_document,
        }))
    }
}

// ---- Delete confirmation ----

/// Guard in front of deleting a collection. Non-empty collections need their
/// exact name typed back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteConfirmation {
    pub collection_name: String,
    pub document_count: u64,
    pub typed: String,
}

impl DeleteConfirmation {
    pub fn new(collection: &CollectionSummary) -> Self {
        Self {
            collection_name: collection.name.clone(),
            document_count: collection.document_count,
            typed: String::new(),
        }
    }

    pub fn requires_typed_name(&self) -> bool {
        self.document_count > 0
    }

    pub fn can_confirm(&self) -> bool {
        !self.requires_typed_name() || self.typed == self.collection_name
    }

    pub fn confirm(&self) -> Result<&str, ValidationError> {
        if self.can_confirm() {
            Ok(&self.collection_name)
        } else {
            Err(ValidationError::ConfirmationMismatch {
                expected: self.collection_name.clone(),
            })
        }
    }
}

// ---- Copy progress ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum CopyDialogState {
    Creating,
    Copying { processed: u64, total: u64 },
    Complete { processed: u64, total: u64 },
    Error { message: String },
    Cancelled,
}

impl CopyDialogState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CopyDialogState::Complete { .. }
                | CopyDialogState::Error { .. }
                | CopyDialogState::Cancelled
        )
    }
}

/// What dismissing a finished dialog implies for the surrounding view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DismissOutcome {
    pub exit_draft_collection: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyProgressDialog {
    pub target_name: String,
    state: CopyDialogState,
    cancel_requested: bool,
}

impl CopyProgressDialog {
    pub fn new(target_name: &str) -> Self {
        Self {
            target_name: target_name.to_string(),
            state: CopyDialogState::Creating,
            cancel_requested: false,
        }
    }

    pub fn state(&self) -> &CopyDialogState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn can_dismiss(&self) -> bool {
        self.is_terminal()
    }

    /// Feed one progress event. Events after a terminal state are ignored.
    pub fn apply(&mut self, event: &CopyProgress) {
        if self.is_terminal() {
            return;
        }
        let last_total = match &self.state {
            CopyDialogState::Copying { total, .. } => *total,
            _ => 0,
        };
        self.state = match event {
            CopyProgress::Creating => CopyDialogState::Creating,
            CopyProgress::Copying {
                processed_documents,
                total_documents,
            } => CopyDialogState::Copying {
                processed: *processed_documents,
                total: *total_documents,
            },
            CopyProgress::Complete {
                processed_documents,
                total_documents,
            } => CopyDialogState::Complete {
                processed: *processed_documents,
                total: total_documents.unwrap_or(last_total.max(*processed_documents)),
            },
            CopyProgress::Error { message } => CopyDialogState::Error {
                message: message.clone(),
            },
            CopyProgress::Cancelled => CopyDialogState::Cancelled,
        };
    }

    /// Settle on the call's final result, for services that end without a
    /// terminal event.
    pub fn finish(&mut self, result: Result<CopyCollectionOutcome, RemoteError>) {
        if self.is_terminal() {
            return;
        }
        self.state = match result {
            Ok(outcome) if outcome.success => CopyDialogState::Complete {
                processed: outcome.copied_documents,
                total: outcome.total_documents,
            },
            _ if self.cancel_requested => CopyDialogState::Cancelled,
            Ok(outcome) => CopyDialogState::Error {
                message: outcome
                    .error
                    .unwrap_or_else(|| "Copy failed".to_string()),
            },
            Err(err) => CopyDialogState::Error {
                message: err.message,
            },
        };
    }

    /// Returns true when a cancel should be forwarded to the service.
    pub fn request_cancel(&mut self) -> bool {
        if self.is_terminal() || self.cancel_requested {
            return false;
        }
        self.cancel_requested = true;
        true
    }

    pub fn dismiss(&self) -> Option<DismissOutcome> {
        if !self.can_dismiss() {
            return None;
        }
        Some(DismissOutcome {
            exit_draft_collection: matches!(self.state, CopyDialogState::Complete { .. }),
        })
    }

    pub fn fraction(&self) -> Option<f64> {
        match self.state {
            CopyDialogState::Copying { processed, total } if total > 0 => {
                Some(processed as f64 / total as f64)
            }
            CopyDialogState::Complete { .. } => Some(1.0),
            _ => None,
        }
    }
}
