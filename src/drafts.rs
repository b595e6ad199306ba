use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use crate::clipboard::DocumentSnapshot;
use crate::error::{RemoteError, ValidationError};
use crate::metadata::{
    classify, typed_metadata_to_chroma_format, MetadataValueType, TypedField, TypedMetadata,
};
use crate::service::{
    CreateDocumentRequest, CreateDocumentsBatchRequest, DocumentRecord, NewDocument,
};

// ---- Draft documents ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftDocument {
    pub id: String,
    pub document: String,
    #[serde(default)]
    pub metadata: TypedMetadata,
}

impl DraftDocument {
    /// An empty draft with a fresh random id.
    pub fn blank() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            document: String::new(),
            metadata: TypedMetadata::new(),
        }
    }

    /// Validate and convert. Messages are unpositioned; callers add the
    /// draft's position when it is part of a batch.
    pub fn to_new_document(&self) -> Result<NewDocument, String> {
        if self.id.trim().is_empty() {
            return Err("ID is required".to_string());
        }
        if self.document.trim().is_empty() {
            return Err("Document content is required".to_string());
        }
        let metadata = typed_metadata_to_chroma_format(&self.metadata).map_err(|e| e.to_string())?;
        Ok(NewDocument {
            id: self.id.trim().to_string(),
            document: self.document.clone(),
            metadata,
            embedding: None,
        })
    }
}

/// Shallow merge into a draft: every provided part replaces the old one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftPatch {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub document: Option<String>,
    #[serde(default)]
    pub metadata: Option<TypedMetadata>,
}

/// What a validated draft set turns into.
#[derive(Debug, Clone, PartialEq)]
pub enum SavePlan {
    Single(CreateDocumentRequest),
    Batch(CreateDocumentsBatchRequest),
}

// ---- Paste helpers ----

/// Return `id` if unused, else the first free of `id-copy`, `id-copy-2`,
/// `id-copy-3`, ... The result is recorded in `used`.
pub fn resolve_conflicting_id(id: &str, used: &mut HashSet<String>) -> String {
    let resolved = if !used.contains(id) {
        id.to_string()
    } else {
        let first = format!("{}-copy", id);
        if !used.contains(&first) {
            first
        } else {
            let mut n = 2;
            loop {
                let candidate = format!("{}-copy-{}", id, n);
                if !used.contains(&candidate) {
                    break candidate;
                }
                n += 1;
            }
        }
    };
    used.insert(resolved.clone());
    resolved
}

/// For each metadata key, the type of its value in the first row that has it.
pub fn established_types(rows: &[DocumentRecord]) -> BTreeMap<String, MetadataValueType> {
    let mut types = BTreeMap::new();
    for row in rows {
        if let Some(metadata) = &row.metadata {
            for (key, value) in metadata {
                types.entry(key.clone()).or_insert_with(|| classify(value));
            }
        }
    }
    types
}

/// Turn copied documents into drafts for a collection whose visible rows are
/// `rows`. Ids are de-conflicted in order; values whose type disagrees with the
/// collection's established type are staged blank; collection-wide keys missing
/// from a pasted document are added blank.
pub fn drafts_from_snapshots(
    snapshots: &[DocumentSnapshot],
    rows: &[DocumentRecord],
) -> Vec<DraftDocument> {
    let mut used: HashSet<String> = rows.iter().map(|r| r.id.clone()).collect();
    let established = established_types(rows);

    snapshots
        .iter()
        .map(|snapshot| {
            let id = resolve_conflicting_id(&snapshot.id, &mut used);
            let mut metadata = TypedMetadata::new();

            if let Some(pasted) = &snapshot.metadata {
                for (key, value) in pasted {
                    let actual = classify(value);
                    let field = match established.get(key) {
                        Some(expected) if *expected != actual => TypedField::blank(*expected),
                        Some(expected) => TypedField::new(value.to_string(), *expected),
                        None => TypedField::new(value.to_string(), actual),
                    };
                    metadata.insert(key.clone(), field);
                }
            }
            for (key, value_type) in &established {
                metadata
                    .entry(key.clone())
                    .or_insert_with(|| TypedField::blank(*value_type));
            }

            DraftDocument {
                id,
                document: snapshot.document.clone().unwrap_or_default(),
                metadata,
            }
        })
        .collect()
}

// ---- Staging ----

/// Unsaved documents shown inline above the committed rows of one collection.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftStaging {
    drafts: Vec<DraftDocument>,
    error: Option<String>,
    pending: bool,
}

impl DraftStaging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drafts(&self) -> &[DraftDocument] {
        &self.drafts
    }

    pub fn is_drafting(&self) -> bool {
        !self.drafts.is_empty()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn draft_ids(&self) -> Vec<String> {
        self.drafts.iter().map(|d| d.id.clone()).collect()
    }

    /// Seed one blank draft. Returns its id, or `None` when a draft set already
    /// exists or deletions are staged.
    pub fn start_create(&mut self, deletions_staged: bool) -> Option<String> {
        if self.is_drafting() || deletions_staged {
            return None;
        }
        let draft = DraftDocument::blank();
        let id = draft.id.clone();
        self.drafts.push(draft);
        self.error = None;
        Some(id)
    }

    pub fn update_draft_field(&mut self, index: usize, patch: DraftPatch) -> bool {
        let Some(draft) = self.drafts.get_mut(index) else {
            return false;
        };
        if let Some(id) = patch.id {
            draft.id = id;
        }
        if let Some(document) = patch.document {
            draft.document = document;
        }
        if let Some(metadata) = patch.metadata {
            draft.metadata = metadata;
        }
        self.error = None;
        true
    }

    /// Discard every draft. Refused while a save is in flight.
    pub fn cancel(&mut self) -> bool {
        if self.pending {
            return false;
        }
        self.drafts.clear();
        self.error = None;
        true
    }

    /// Stage pasted documents. Returns the new draft ids, empty when nothing
    /// was staged.
    pub fn paste(
        &mut self,
        snapshots: &[DocumentSnapshot],
        rows: &[DocumentRecord],
    ) -> Vec<String> {
        if self.is_drafting() || snapshots.is_empty() {
            return Vec::new();
        }
        self.drafts = drafts_from_snapshots(snapshots, rows);
        self.error = None;
        self.draft_ids()
    }

    /// Validate every draft and build the create call. The first failing draft
    /// aborts the whole batch.
    pub fn prepare_save(&mut self, collection_name: &str) -> Result<SavePlan, ValidationError> {
        if self.pending {
            return Err(ValidationError::Busy);
        }
        if self.drafts.is_empty() {
            return Err(ValidationError::Empty);
        }

        let mut documents = Vec::with_capacity(self.drafts.len());
        for (index, draft) in self.drafts.iter().enumerate() {
            match draft.to_new_document() {
                Ok(doc) => documents.push(doc),
                Err(message) => {
                    let err = ValidationError::Draft {
                        position: index + 1,
                        message,
                    };
                    self.error = Some(err.to_string());
                    return Err(err);
                }
            }
        }

        self.error = None;
        self.pending = true;
        let plan = if documents.len() == 1 {
            SavePlan::Single(CreateDocumentRequest {
                collection_name: collection_name.to_string(),
                document: documents.remove(0),
                generate_embedding: true,
            })
        } else {
            SavePlan::Batch(CreateDocumentsBatchRequest {
                collection_name: collection_name.to_string(),
                documents,
                generate_embeddings: true,
            })
        };
        Ok(plan)
    }

    /// Apply the remote outcome of a save. Drafts survive a failure so the user
    /// can correct and retry.
    pub fn complete_save(&mut self, outcome: Result<(), RemoteError>) -> bool {
        self.pending = false;
        match outcome {
            Ok(()) => {
                self.drafts.clear();
                self.error = None;
                true
            }
            Err(err) => {
                self.error = Some(err.message);
                false
            }
        }
    }
}
