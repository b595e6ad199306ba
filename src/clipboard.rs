use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;
use crate::service::{CollectionSummary, DocumentRecord};

/// A copied document. Embeddings are never carried: a pasted document is always
/// embedded by the destination collection's function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub id: String,
    pub document: Option<String>,
    pub metadata: Option<Metadata>,
}

impl From<&DocumentRecord> for DocumentSnapshot {
    fn from(record: &DocumentRecord) -> Self {
        Self {
            id: record.id.clone(),
            document: record.document.clone(),
            metadata: record.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ClipboardItem {
    #[serde(rename_all = "camelCase")]
    Collection {
        collection: CollectionSummary,
        source_profile_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Documents {
        documents: Vec<DocumentSnapshot>,
        source_collection_name: String,
        source_profile_id: String,
    },
}

/// Single-slot clipboard shared by the collection and document workflows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Clipboard {
    item: Option<ClipboardItem>,
}

impl Clipboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copy_collection(&mut self, collection: CollectionSummary, profile_id: &str) {
        self.item = Some(ClipboardItem::Collection {
            collection,
            source_profile_id: profile_id.to_string(),
        });
    }

    pub fn copy_documents(
        &mut self,
        documents: &[DocumentRecord],
        collection_name: &str,
        profile_id: &str,
    ) {
        self.item = Some(ClipboardItem::Documents {
            documents: documents.iter().map(DocumentSnapshot::from).collect(),
            source_collection_name: collection_name.to_string(),
            source_profile_id: profile_id.to_string(),
        });
    }

    pub fn clear(&mut self) {
        self.item = None;
    }

    pub fn item(&self) -> Option<&ClipboardItem> {
        self.item.as_ref()
    }

    pub fn has_copied_collection(&self) -> bool {
        matches!(self.item, Some(ClipboardItem::Collection { .. }))
    }

    pub fn has_copied_documents(&self) -> bool {
        matches!(self.item, Some(ClipboardItem::Documents { .. }))
    }

    pub fn copied_documents(&self) -> Option<&[DocumentSnapshot]> {
        match &self.item {
            Some(ClipboardItem::Documents { documents, .. }) => Some(documents),
            _ => None,
        }
    }

    pub fn copied_collection(&self) -> Option<(&CollectionSummary, &str)> {
        match &self.item {
            Some(ClipboardItem::Collection {
                collection,
                source_profile_id,
            }) => Some((collection, source_profile_id)),
            _ => None,
        }
    }
}
