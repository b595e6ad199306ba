use serde::Serialize;

use crate::error::{RemoteError, ValidationError};
use crate::metadata::{metadata_to_typed, typed_metadata_to_chroma_format, Metadata, TypedMetadata};
use crate::service::{DocumentRecord, UpdateDocumentRequest};

/// Detail-panel edit of one committed document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentEditor {
    collection_name: String,
    document_id: String,
    #[serde(skip)]
    original_document: String,
    #[serde(skip)]
    original_metadata: Option<Metadata>,
    pub document: String,
    pub metadata: TypedMetadata,
    /// `None` follows the default: regenerate when the text changed.
    pub regenerate_embedding: Option<bool>,
    error: Option<String>,
    pending: bool,
}

impl DocumentEditor {
    pub fn open(collection_name: &str, record: &DocumentRecord) -> Self {
        let document = record.document.clone().unwrap_or_default();
        Self {
            collection_name: collection_name.to_string(),
            document_id: record.id.clone(),
            original_document: document.clone(),
            original_metadata: record.metadata.clone(),
            document,
            metadata: record
                .metadata
                .as_ref()
                .map(metadata_to_typed)
                .unwrap_or_default(),
            regenerate_embedding: None,
            error: None,
            pending: false,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn text_changed(&self) -> bool {
        self.document != self.original_document
    }

    pub fn set_document(&mut self, text: String) {
        self.document = text;
        self.error = None;
    }

    pub fn set_metadata(&mut self, metadata: TypedMetadata) {
        self.metadata = metadata;
        self.error = None;
    }

    fn original_typed(&self) -> TypedMetadata {
        self.original_metadata
            .as_ref()
            .map(metadata_to_typed)
            .unwrap_or_default()
    }

    /// Fields whose form text and type were not touched keep their stored
    /// value, so a float such as 2.0 is not rewritten as the integer 2.
    fn keep_untouched(&self, parsed: Option<Metadata>) -> Option<Metadata> {
        let mut parsed = parsed?;
        let Some(original) = &self.original_metadata else {
            return Some(parsed);
        };
        let original_typed = metadata_to_typed(original);
        for (key, value) in parsed.iter_mut() {
            let untouched = self.metadata.get(key).is_some()
                && self.metadata.get(key) == original_typed.get(key);
            if let (true, Some(stored)) = (untouched, original.get(key)) {
                *value = stored.clone();
            }
        }
        Some(parsed)
    }

    /// Build the update call. `Ok(None)` means nothing changed.
    pub fn prepare_save(&mut self) -> Result<Option<UpdateDocumentRequest>, ValidationError> {
        if self.pending {
            return Err(ValidationError::Busy);
        }
        if self.document.trim().is_empty() {
            let err = ValidationError::Field("Document content is required".to_string());
            self.error = Some(err.to_string());
            return Err(err);
        }
        let metadata = match typed_metadata_to_chroma_format(&self.metadata) {
            Ok(metadata) => metadata,
            Err(err) => {
                self.error = Some(err.to_string());
                return Err(err);
            }
        };

        let text_changed = self.text_changed();
        let metadata_changed = self.metadata != self.original_typed();
        let regenerate = self.regenerate_embedding.unwrap_or(text_changed);
        if !text_changed && !metadata_changed && !regenerate {
            return Ok(None);
        }

        self.error = None;
        self.pending = true;
        Ok(Some(UpdateDocumentRequest {
            collection_name: self.collection_name.clone(),
            document_id: self.document_id.clone(),
            document: text_changed.then(|| self.document.clone()),
            metadata: metadata_changed.then(|| self.keep_untouched(metadata).unwrap_or_default()),
            embedding: None,
            regenerate_embedding: regenerate,
        }))
    }

    pub fn complete_save(&mut self, outcome: Result<(), RemoteError>) -> bool {
        self.pending = false;
        match outcome {
            Ok(()) => {
                self.original_document = self.document.clone();
                let saved = typed_metadata_to_chroma_format(&self.metadata).ok().flatten();
                self.original_metadata = self.keep_untouched(saved);
                self.regenerate_embedding = None;
                true
            }
            Err(err) => {
                self.error = Some(err.message);
                false
            }
        }
    }
}
