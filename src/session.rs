//! One window's in-memory state: the open collection's table, the collections
//! sidebar and the shared clipboard.

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::clipboard::Clipboard;
use crate::collections::{
    CollectionCommit, CopyProgressDialog, DeleteConfirmation, DraftCollection,
};
use crate::dispatch::AppCommand;
use crate::drafts::{DraftDocument, DraftPatch, DraftStaging, SavePlan};
use crate::editor::DocumentEditor;
use crate::error::{RemoteError, Result, ValidationError};
use crate::filters::{apply_client_filters, translate_filters, FilterRow};
use crate::query::QueryClient;
use crate::selection::{ClickModifiers, Selection};
use crate::service::{
    CollectionSummary, CopyCollectionOutcome, CopyCollectionRequest, CopyProgress,
    DeleteDocumentsRequest, DocumentRecord,
};

pub const DEFAULT_RESULTS: u32 = 100;

// ── Table rows ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TableRow {
    Draft {
        index: usize,
        draft: DraftDocument,
        selected: bool,
    },
    Document {
        record: DocumentRecord,
        selected: bool,
        marked: bool,
    },
}

// ── Documents view ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentsView {
    profile_id: String,
    collection_name: String,
    filters: Vec<FilterRow>,
    n_results: u32,
    rows: Vec<DocumentRecord>,
    selection: Selection,
    staging: DraftStaging,
    marked_for_deletion: Vec<String>,
    editor: Option<DocumentEditor>,
    error: Option<String>,
    deleting: bool,
}

impl DocumentsView {
    pub fn new(profile_id: &str, collection_name: &str, n_results: u32) -> Self {
        Self {
            profile_id: profile_id.to_string(),
            collection_name: collection_name.to_string(),
            filters: Vec::new(),
            n_results,
            rows: Vec::new(),
            selection: Selection::new(),
            staging: DraftStaging::new(),
            marked_for_deletion: Vec::new(),
            editor: None,
            error: None,
            deleting: false,
        }
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn rows(&self) -> &[DocumentRecord] {
        &self.rows
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn staging(&self) -> &DraftStaging {
        &self.staging
    }

    pub fn editor(&self) -> Option<&DocumentEditor> {
        self.editor.as_ref()
    }

    pub fn editor_mut(&mut self) -> Option<&mut DocumentEditor> {
        self.editor.as_mut()
    }

    pub fn marked_for_deletion(&self) -> &[String] {
        &self.marked_for_deletion
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Drafts first, then committed rows, in display order.
    pub fn display_ids(&self) -> Vec<String> {
        let mut ids = self.staging.draft_ids();
        ids.extend(self.rows.iter().map(|r| r.id.clone()));
        ids
    }

    pub fn display_rows(&self) -> Vec<TableRow> {
        let drafts = self
            .staging
            .drafts()
            .iter()
            .enumerate()
            .map(|(index, draft)| TableRow::Draft {
                index,
                selected: self.selection.is_selected(&draft.id),
                draft: draft.clone(),
            });
        let committed = self.rows.iter().map(|record| TableRow::Document {
            selected: self.selection.is_selected(&record.id),
            marked: self.marked_for_deletion.contains(&record.id),
            record: record.clone(),
        });
        drafts.chain(committed).collect()
    }

    fn is_draft_id(&self, id: &str) -> bool {
        self.staging.drafts().iter().any(|d| d.id == id)
    }

    fn selected_records(&self) -> Vec<DocumentRecord> {
        self.rows
            .iter()
            .filter(|r| self.selection.is_selected(&r.id))
            .cloned()
            .collect()
    }

    // ---- Data ----

    pub fn set_filters(&mut self, filters: Vec<FilterRow>) {
        self.filters = filters;
    }

    /// Replace the committed rows, dropping selection and marks that no
    /// longer point at a displayed row.
    pub fn set_rows(&mut self, rows: Vec<DocumentRecord>) {
        self.rows = rows;
        let visible = self.display_ids();
        self.selection.retain_visible(&visible);
        self.marked_for_deletion.retain(|id| visible.contains(id));
        if let Some(editor) = &self.editor {
            if !self.rows.iter().any(|r| r.id == editor.document_id()) {
                self.editor = None;
            }
        }
    }

    pub async fn refresh(&mut self, client: &QueryClient) -> Result<(), RemoteError> {
        let query = translate_filters(&self.filters);
        let request = query.to_search_request(&self.collection_name, self.n_results);
        let records = client.search_documents(&self.profile_id, &request).await?;
        self.set_rows(apply_client_filters(records, &query));
        Ok(())
    }

    async fn refresh_after_write(&mut self, client: &QueryClient) {
        if let Err(err) = self.refresh(client).await {
            tracing::warn!(
                collection = %self.collection_name,
                "refresh after write failed: {}",
                err
            );
        }
    }

    // ---- Selection ----

    pub fn click(&mut self, id: &str, modifiers: ClickModifiers) {
        let ids = self.display_ids();
        self.selection.handle_click(id, modifiers, &ids);
    }

    pub fn pointer_down(&mut self, index: usize, modifiers: ClickModifiers) {
        self.selection.pointer_down(index, modifiers);
    }

    pub fn pointer_enter(&mut self, index: usize) {
        let ids = self.display_ids();
        self.selection.pointer_enter(index, &ids);
    }

    pub fn pointer_up(&mut self) -> bool {
        self.selection.pointer_up()
    }

    pub fn select_all(&mut self) {
        let ids = self.display_ids();
        self.selection.select_all(&ids);
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
        self.editor = None;
    }

    /// Open the detail editor on the primary row if it is a committed document.
    pub fn open_editor(&mut self) -> bool {
        let Some(primary) = self.selection.primary_id() else {
            return false;
        };
        match self.rows.iter().find(|r| r.id == primary) {
            Some(record) => {
                self.editor = Some(DocumentEditor::open(&self.collection_name, record));
                true
            }
            None => false,
        }
    }

    pub fn close_editor(&mut self) {
        self.editor = None;
    }

    pub async fn save_editor(&mut self, client: &QueryClient) -> Result<bool> {
        let Some(editor) = self.editor.as_mut() else {
            return Ok(false);
        };
        let Some(request) = editor.prepare_save()? else {
            return Ok(false);
        };
        let outcome = client.update_document(&self.profile_id, &request).await;
        editor.complete_save(outcome.clone());
        outcome?;
        tracing::info!(
            collection = %self.collection_name,
            id = %request.document_id,
            "updated document"
        );
        self.refresh_after_write(client).await;
        Ok(true)
    }

    // ---- Drafts ----

    pub fn start_create(&mut self) -> Option<String> {
        let id = self
            .staging
            .start_create(!self.marked_for_deletion.is_empty())?;
        self.editor = None;
        self.selection.select_single(&id);
        Some(id)
    }

    pub fn update_draft_field(&mut self, index: usize, patch: DraftPatch) -> bool {
        let old_id = self.staging.drafts().get(index).map(|d| d.id.clone());
        let updated = self.staging.update_draft_field(index, patch);
        if let (true, Some(old_id)) = (updated, old_id) {
            let new_id = self.staging.drafts()[index].id.clone();
            if new_id != old_id && self.selection.is_selected(&old_id) {
                self.selection.select_single(&new_id);
            }
        }
        updated
    }

    pub fn cancel_drafts(&mut self) -> bool {
        if !self.staging.is_drafting() || !self.staging.cancel() {
            return false;
        }
        self.selection.clear();
        true
    }

    pub async fn save_drafts(&mut self, client: &QueryClient) -> Result<usize> {
        let plan = self.staging.prepare_save(&self.collection_name)?;
        let (count, outcome) = match &plan {
            SavePlan::Single(request) => {
                (1, client.create_document(&self.profile_id, request).await)
            }
            SavePlan::Batch(request) => (
                request.documents.len(),
                client.create_documents_batch(&self.profile_id, request).await,
            ),
        };
        self.staging.complete_save(outcome.clone());
        if let Err(err) = outcome {
            tracing::warn!(
                collection = %self.collection_name,
                count,
                "saving drafts failed: {}",
                err
            );
            return Err(err.into());
        }
        tracing::info!(collection = %self.collection_name, count, "saved drafts");
        self.selection.clear();
        self.refresh_after_write(client).await;
        Ok(count)
    }

    // ---- Clipboard ----

    /// Copy the selected committed rows. Drafts are never copied.
    pub fn copy_selection(&self, clipboard: &mut Clipboard) -> usize {
        let records = self.selected_records();
        if records.is_empty() {
            return 0;
        }
        clipboard.copy_documents(&records, &self.collection_name, &self.profile_id);
        records.len()
    }

    pub fn paste(&mut self, clipboard: &Clipboard) -> Vec<String> {
        let Some(snapshots) = clipboard.copied_documents() else {
            return Vec::new();
        };
        let ids = self.staging.paste(snapshots, &self.rows);
        if let Some(first) = ids.first() {
            self.editor = None;
            self.selection.select_single(first);
        }
        ids
    }

    // ---- Deletion ----

    /// Stage the selected committed rows for deletion. Nothing is staged while
    /// drafts exist.
    pub fn mark_selected_for_deletion(&mut self) -> usize {
        if self.staging.is_drafting() {
            return 0;
        }
        let mut added = 0;
        for id in self.selection.selected_ids().to_vec() {
            if self.is_draft_id(&id) || self.marked_for_deletion.contains(&id) {
                continue;
            }
            self.marked_for_deletion.push(id);
            added += 1;
        }
        added
    }

    pub fn unmark_all(&mut self) {
        self.marked_for_deletion.clear();
        self.error = None;
    }

    pub async fn commit_deletions(&mut self, client: &QueryClient) -> Result<usize> {
        if self.deleting {
            return Err(ValidationError::Busy.into());
        }
        if self.marked_for_deletion.is_empty() {
            return Err(ValidationError::Empty.into());
        }
        let request = DeleteDocumentsRequest {
            collection_name: self.collection_name.clone(),
            ids: self.marked_for_deletion.clone(),
        };
        self.deleting = true;
        let outcome = client.delete_documents(&self.profile_id, &request).await;
        self.deleting = false;

        if let Err(err) = outcome {
            self.error = Some(err.message.clone());
            return Err(err.into());
        }
        let count = request.ids.len();
        tracing::info!(collection = %self.collection_name, count, "deleted documents");
        self.rows.retain(|r| !request.ids.contains(&r.id));
        self.marked_for_deletion.clear();
        self.error = None;
        self.clear_selection();
        self.refresh_after_write(client).await;
        Ok(count)
    }
}

// ── Collections view ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionsView {
    profile_id: String,
    collections: Vec<CollectionSummary>,
    selected: Option<String>,
    draft: Option<DraftCollection>,
    copy_dialog: Option<CopyProgressDialog>,
    delete_confirmation: Option<DeleteConfirmation>,
    error: Option<String>,
    committing: bool,
}

impl CollectionsView {
    pub fn new(profile_id: &str) -> Self {
        Self {
            profile_id: profile_id.to_string(),
            collections: Vec::new(),
            selected: None,
            draft: None,
            copy_dialog: None,
            delete_confirmation: None,
            error: None,
            committing: false,
        }
    }

    pub fn collections(&self) -> &[CollectionSummary] {
        &self.collections
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn draft(&self) -> Option<&DraftCollection> {
        self.draft.as_ref()
    }

    pub fn draft_mut(&mut self) -> Option<&mut DraftCollection> {
        self.draft.as_mut()
    }

    pub fn copy_dialog(&self) -> Option<&CopyProgressDialog> {
        self.copy_dialog.as_ref()
    }

    pub fn delete_confirmation(&self) -> Option<&DeleteConfirmation> {
        self.delete_confirmation.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn names(&self) -> Vec<String> {
        self.collections.iter().map(|c| c.name.clone()).collect()
    }

    fn find(&self, name: &str) -> Option<&CollectionSummary> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn set_collections(&mut self, collections: Vec<CollectionSummary>) {
        self.collections = collections;
        if let Some(selected) = &self.selected {
            if !self.collections.iter().any(|c| &c.name == selected) {
                self.selected = None;
            }
        }
    }

    pub async fn refresh(&mut self, client: &QueryClient) -> Result<(), RemoteError> {
        let collections = client.list_collections(&self.profile_id).await?;
        self.set_collections(collections);
        Ok(())
    }

    pub fn select(&mut self, name: &str) -> bool {
        if self.find(name).is_none() {
            return false;
        }
        self.selected = Some(name.to_string());
        true
    }

    pub fn copy_selected(&self, clipboard: &mut Clipboard) -> bool {
        let Some(collection) = self.selected.as_deref().and_then(|n| self.find(n)) else {
            return false;
        };
        clipboard.copy_collection(collection.clone(), &self.profile_id);
        true
    }

    // ---- Draft collection ----

    pub fn start_create_collection(&mut self) -> bool {
        if self.draft.is_some() {
            return false;
        }
        self.draft = Some(DraftCollection::blank());
        self.error = None;
        true
    }

    pub fn start_paste_collection(
        &mut self,
        clipboard: &Clipboard,
    ) -> Result<bool, ValidationError> {
        if self.draft.is_some() {
            return Ok(false);
        }
        let Some((source, source_profile)) = clipboard.copied_collection() else {
            return Ok(false);
        };
        if source_profile != self.profile_id {
            return Err(ValidationError::Field(
                "Collections can only be pasted into the connection they were copied from"
                    .to_string(),
            ));
        }
        self.draft = Some(DraftCollection::from_copied(source, &self.names()));
        self.error = None;
        Ok(true)
    }

    pub fn cancel_draft(&mut self) -> bool {
        if self.committing || self.draft.is_none() {
            return false;
        }
        self.draft = None;
        self.error = None;
        true
    }

    /// Validate the draft and mark the commit in flight. A copy opens the
    /// progress dialog.
    pub fn prepare_commit(&mut self) -> Result<CollectionCommit, ValidationError> {
        if self.committing {
            return Err(ValidationError::Busy);
        }
        let draft = self.draft.as_ref().ok_or(ValidationError::Empty)?;
        let commit = match draft.prepare_commit(&self.names()) {
            Ok(commit) => commit,
            Err(err) => {
                self.error = Some(err.to_string());
                return Err(err);
            }
        };
        if let CollectionCommit::Copy(request) = &commit {
            self.copy_dialog = Some(CopyProgressDialog::new(&request.target_name));
        }
        self.error = None;
        self.committing = true;
        Ok(commit)
    }

    pub fn complete_create(&mut self, outcome: Result<(), RemoteError>) -> bool {
        self.committing = false;
        match outcome {
            Ok(()) => {
                self.draft = None;
                true
            }
            Err(err) => {
                self.error = Some(err.message);
                false
            }
        }
    }

    pub fn apply_copy_progress(&mut self, event: &CopyProgress) {
        if let Some(dialog) = self.copy_dialog.as_mut() {
            dialog.apply(event);
        }
    }

    pub fn complete_copy(&mut self, outcome: Result<CopyCollectionOutcome, RemoteError>) {
        self.committing = false;
        if let Some(dialog) = self.copy_dialog.as_mut() {
            dialog.finish(outcome);
        }
    }

    /// Returns true when the cancel should be forwarded to the service.
    pub fn request_cancel_copy(&mut self) -> bool {
        self.copy_dialog
            .as_mut()
            .map_or(false, |dialog| dialog.request_cancel())
    }

    /// Close a finished dialog. A successful copy also leaves draft mode.
    pub fn dismiss_copy_dialog(&mut self) -> bool {
        let Some(outcome) = self.copy_dialog.as_ref().and_then(|d| d.dismiss()) else {
            return false;
        };
        self.copy_dialog = None;
        if outcome.exit_draft_collection {
            self.draft = None;
        }
        true
    }

    /// Commit the draft. A create runs to completion here; a copy only opens
    /// the progress dialog and is handed back for [`run_copy`].
    pub async fn commit_draft(
        &mut self,
        client: &QueryClient,
    ) -> Result<Option<CopyCollectionRequest>> {
        let request = match self.prepare_commit()? {
            CollectionCommit::Copy(request) => return Ok(Some(request)),
            CollectionCommit::Create(request) => request,
        };
        let outcome = client.create_collection(&self.profile_id, &request).await;
        if self.complete_create(outcome.clone()) {
            tracing::info!(name = %request.name, "created collection");
            self.selected = Some(request.name.clone());
            self.refresh_after_write(client).await;
        }
        outcome?;
        Ok(None)
    }

    async fn refresh_after_write(&mut self, client: &QueryClient) {
        if let Err(err) = self.refresh(client).await {
            tracing::warn!("refreshing collections failed: {}", err);
        }
    }

    // ---- Deletion ----

    pub fn begin_delete(&mut self, name: &str) -> bool {
        let Some(collection) = self.find(name) else {
            return false;
        };
        self.delete_confirmation = Some(DeleteConfirmation::new(collection));
        true
    }

    pub fn set_delete_confirmation_text(&mut self, typed: &str) {
        if let Some(confirmation) = self.delete_confirmation.as_mut() {
            confirmation.typed = typed.to_string();
        }
    }

    pub fn cancel_delete(&mut self) {
        self.delete_confirmation = None;
    }

    pub async fn confirm_delete(&mut self, client: &QueryClient) -> Result<String> {
        let confirmation = self.delete_confirmation.as_ref().ok_or(ValidationError::Empty)?;
        let name = confirmation.confirm()?.to_string();
        if let Err(err) = client.delete_collection(&self.profile_id, &name).await {
            self.error = Some(err.message.clone());
            return Err(err.into());
        }
        tracing::info!(name = %name, "deleted collection");
        self.delete_confirmation = None;
        self.error = None;
        self.collections.retain(|c| c.name != name);
        if self.selected.as_deref() == Some(name.as_str()) {
            self.selected = None;
        }
        self.refresh_after_write(client).await;
        Ok(name)
    }
}

// ── Session ────────────────────────────────────────────────────────────────

/// What a handled command left behind for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Unchanged,
    Changed,
    /// A collection copy is ready to start. The caller releases the session
    /// and drives it with [`run_copy`].
    Copy(CopyCollectionRequest),
}

impl CommandOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, CommandOutcome::Unchanged)
    }
}

impl From<bool> for CommandOutcome {
    fn from(changed: bool) -> Self {
        if changed {
            CommandOutcome::Changed
        } else {
            CommandOutcome::Unchanged
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    profile_id: String,
    n_results: u32,
    pub clipboard: Clipboard,
    pub collections: CollectionsView,
    pub documents: Option<DocumentsView>,
}

impl Session {
    pub fn new(profile_id: &str, n_results: u32) -> Self {
        Self {
            profile_id: profile_id.to_string(),
            n_results,
            clipboard: Clipboard::new(),
            collections: CollectionsView::new(profile_id),
            documents: None,
        }
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    /// Switch the table to `collection`. Unsaved drafts of the previous one
    /// are discarded.
    pub fn open_collection(&mut self, collection: &str) -> &mut DocumentsView {
        self.collections.select(collection);
        match self.documents.take() {
            Some(view) if view.collection_name() == collection => self.documents.insert(view),
            _ => self.documents.insert(DocumentsView::new(
                &self.profile_id,
                collection,
                self.n_results,
            )),
        }
    }

    fn copy(&mut self) -> bool {
        if let Some(view) = &self.documents {
            if view.copy_selection(&mut self.clipboard) > 0 {
                return true;
            }
        }
        self.collections.copy_selected(&mut self.clipboard)
    }

    fn paste(&mut self) -> Result<bool> {
        if self.clipboard.has_copied_documents() {
            if let Some(view) = self.documents.as_mut() {
                return Ok(!view.paste(&self.clipboard).is_empty());
            }
            return Ok(false);
        }
        Ok(self.collections.start_paste_collection(&self.clipboard)?)
    }

    async fn save(&mut self, client: &QueryClient) -> Result<CommandOutcome> {
        if let Some(view) = self.documents.as_mut() {
            if view.staging().is_drafting() {
                view.save_drafts(client).await?;
                return Ok(CommandOutcome::Changed);
            }
            if !view.marked_for_deletion().is_empty() {
                view.commit_deletions(client).await?;
                return Ok(CommandOutcome::Changed);
            }
            if view.editor().is_some() {
                return Ok(view.save_editor(client).await?.into());
            }
        }
        if self.collections.draft().is_some() {
            return Ok(match self.collections.commit_draft(client).await? {
                Some(request) => CommandOutcome::Copy(request),
                None => CommandOutcome::Changed,
            });
        }
        Ok(CommandOutcome::Unchanged)
    }

    fn cancel(&mut self) -> bool {
        if let Some(view) = self.documents.as_mut() {
            if view.cancel_drafts() {
                return true;
            }
            if !view.marked_for_deletion().is_empty() {
                view.unmark_all();
                return true;
            }
        }
        self.collections.cancel_draft()
    }

    /// The single entry point for menu, shortcut and toolbar commands.
    pub async fn handle_command(
        &mut self,
        command: AppCommand,
        client: &QueryClient,
    ) -> Result<CommandOutcome> {
        tracing::debug!(%command, "handling command");
        let changed = match command {
            AppCommand::NewDocument => self
                .documents
                .as_mut()
                .map_or(false, |view| view.start_create().is_some()),
            AppCommand::Copy => self.copy(),
            AppCommand::Paste => self.paste()?,
            AppCommand::DeleteSelection => self
                .documents
                .as_mut()
                .map_or(false, |view| view.mark_selected_for_deletion() > 0),
            AppCommand::SelectAll => self.documents.as_mut().map_or(false, |view| {
                view.select_all();
                true
            }),
            AppCommand::ClearSelection => self.documents.as_mut().map_or(false, |view| {
                view.clear_selection();
                true
            }),
            AppCommand::Save => return self.save(client).await,
            AppCommand::Cancel => self.cancel(),
            AppCommand::NewCollection => self.collections.start_create_collection(),
            AppCommand::Refresh => {
                client.invalidate_collections(&self.profile_id);
                self.collections.refresh(client).await?;
                if let Some(view) = self.documents.as_mut() {
                    client.invalidate_documents(&self.profile_id, view.collection_name());
                    view.refresh(client).await?;
                }
                true
            }
        };
        Ok(changed.into())
    }
}

// ── Collection copy ────────────────────────────────────────────────────────

/// Drive a copy whose dialog is already open. The session lock is taken only
/// to apply each progress event, so a cancel can get through meanwhile.
/// `forward` receives the same events, for the shell to emit. The collection
/// list is refreshed whatever the outcome.
pub async fn run_copy(
    session: &Mutex<Session>,
    client: &QueryClient,
    request: CopyCollectionRequest,
    forward: Option<mpsc::UnboundedSender<CopyProgress>>,
) -> Result<CopyCollectionOutcome, RemoteError> {
    let profile_id = session.lock().await.profile_id().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let copy = client.copy_collection(&profile_id, &request, tx);
    tokio::pin!(copy);
    let outcome = loop {
        tokio::select! {
            outcome = &mut copy => break outcome,
            Some(event) = rx.recv() => apply_copy_event(session, forward.as_ref(), event).await,
        }
    };
    while let Ok(event) = rx.try_recv() {
        apply_copy_event(session, forward.as_ref(), event).await;
    }

    match &outcome {
        Ok(done) => tracing::info!(
            source = %request.source_collection_name,
            target = %request.target_name,
            copied = done.copied_documents,
            success = done.success,
            "copy finished"
        ),
        Err(err) => tracing::warn!(target = %request.target_name, "copy failed: {}", err),
    }

    let mut session = session.lock().await;
    session.collections.complete_copy(outcome.clone());
    if session.profile_id() == profile_id {
        session.collections.refresh_after_write(client).await;
    }
    outcome
}

async fn apply_copy_event(
    session: &Mutex<Session>,
    forward: Option<&mpsc::UnboundedSender<CopyProgress>>,
    event: CopyProgress,
) {
    session.lock().await.collections.apply_copy_progress(&event);
    if let Some(forward) = forward {
        let _ = forward.send(event);
    }
}

/// Ask the running copy to stop. Returns false when there was nothing to
/// cancel.
pub async fn cancel_copy(
    session: &Mutex<Session>,
    client: &QueryClient,
) -> Result<bool, RemoteError> {
    let profile_id = {
        let mut session = session.lock().await;
        if !session.collections.request_cancel_copy() {
            return Ok(false);
        }
        session.profile_id().to_string()
    };
    client.cancel_copy(&profile_id).await?;
    tracing::info!(profile = %profile_id, "copy cancel requested");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::collections::CopyDialogState;
    use crate::metadata::{Metadata, MetadataValue, MetadataValueType, TypedField, TypedMetadata};
    use crate::test_support::{record, CallCounts, MockService};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    const PROFILE: &str = "local";

    fn with_year(id: &str, year: i64) -> DocumentRecord {
        let mut metadata = Metadata::new();
        metadata.insert("year".to_string(), MetadataValue::Int(year));
        DocumentRecord {
            metadata: Some(metadata),
            ..record(id)
        }
    }

    fn setup() -> (Arc<MockService>, QueryClient) {
        let mock = Arc::new(
            MockService::new()
                .with_collection("docs", vec![record("1"), record("2"), record("3")])
                .with_collection("papers", vec![with_year("p1", 2001)]),
        );
        let client = QueryClient::new(mock.clone());
        (mock, client)
    }

    async fn command(session: &mut Session, client: &QueryClient, command: AppCommand) -> bool {
        session.handle_command(command, client).await.unwrap().changed()
    }

    async fn open(session: &mut Session, client: &QueryClient, name: &str) {
        session.collections.refresh(client).await.unwrap();
        session.open_collection(name).refresh(client).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_metadata_type_makes_no_remote_call() {
        let (mock, client) = setup();
        let mut session = Session::new(PROFILE, DEFAULT_RESULTS);
        open(&mut session, &client, "docs").await;
        let before = mock.calls.total();

        let view = session.documents.as_mut().unwrap();
        view.start_create().unwrap();
        let mut metadata = TypedMetadata::new();
        metadata.insert("year".to_string(), TypedField::new("abc", MetadataValueType::Number));
        view.update_draft_field(
            0,
            DraftPatch {
                document: Some("hello".to_string()),
                metadata: Some(metadata),
                ..Default::default()
            },
        );

        let err = view.save_drafts(&client).await.unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("\"year\""));
        assert_eq!(mock.calls.total(), before);
        assert_eq!(view.staging().drafts().len(), 1);
    }

    #[tokio::test]
    async fn test_new_document_save_roundtrip() {
        let (mock, client) = setup();
        let mut session = Session::new(PROFILE, DEFAULT_RESULTS);
        open(&mut session, &client, "docs").await;

        let view = session.documents.as_mut().unwrap();
        let id = view.start_create().unwrap();
        assert_eq!(view.display_ids()[0], id);
        assert_eq!(view.selection().primary_id(), Some(id.as_str()));
        assert!(view.start_create().is_none());

        view.update_draft_field(
            0,
            DraftPatch {
                id: Some("4".to_string()),
                document: Some("four".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(view.selection().primary_id(), Some("4"));
        assert_eq!(view.save_drafts(&client).await.unwrap(), 1);
        assert_eq!(CallCounts::get(&mock.calls.create_document), 1);
        assert!(!view.staging().is_drafting());
        assert!(view.selection().is_empty());
        assert_eq!(view.rows().len(), 4);
    }

    #[tokio::test]
    async fn test_remote_failure_preserves_drafts() {
        let (mock, client) = setup();
        let mut session = Session::new(PROFILE, DEFAULT_RESULTS);
        open(&mut session, &client, "docs").await;
        let view = session.documents.as_mut().unwrap();
        view.start_create().unwrap();
        view.update_draft_field(0, DraftPatch { document: Some("x".into()), ..Default::default() });

        mock.fail_next("Connection refused");
        let err = view.save_drafts(&client).await.unwrap_err();
        assert_eq!(err.to_string(), "Connection refused");
        assert_eq!(view.staging().error(), Some("Connection refused"));
        assert!(view.staging().is_drafting());
        assert!(!view.staging().is_pending());
    }

    #[tokio::test]
    async fn test_copy_paste_documents_across_collections() {
        let (mock, client) = setup();
        let mut session = Session::new(PROFILE, DEFAULT_RESULTS);
        open(&mut session, &client, "docs").await;

        session.documents.as_mut().unwrap().select_all();
        assert!(command(&mut session, &client, AppCommand::Copy).await);
        assert_eq!(session.clipboard.copied_documents().unwrap().len(), 3);

        // Paste back into the same collection: every id conflicts.
        assert!(command(&mut session, &client, AppCommand::Paste).await);
        let view = session.documents.as_ref().unwrap();
        assert_eq!(view.staging().draft_ids(), vec!["1-copy", "2-copy", "3-copy"]);
        assert_eq!(view.selection().selected_ids(), &["1-copy".to_string()][..]);
        assert!(!command(&mut session, &client, AppCommand::Paste).await);

        assert!(command(&mut session, &client, AppCommand::Save).await);
        assert_eq!(CallCounts::get(&mock.calls.create_documents_batch), 1);
        assert_eq!(mock.ids("docs").len(), 6);

        // Into a typed collection: established keys are backfilled blank.
        session.open_collection("papers").refresh(&client).await.unwrap();
        session.handle_command(AppCommand::Paste, &client).await.unwrap();
        let view = session.documents.as_ref().unwrap();
        let draft = &view.staging().drafts()[0];
        assert_eq!(draft.metadata["year"], TypedField::blank(MetadataValueType::Number));
    }

    #[tokio::test]
    async fn test_staged_deletion_flow() {
        let (mock, client) = setup();
        let mut session = Session::new(PROFILE, DEFAULT_RESULTS);
        open(&mut session, &client, "docs").await;
        let view = session.documents.as_mut().unwrap();

        view.click("1", ClickModifiers::NONE);
        view.click("3", ClickModifiers { toggle: false, shift: true });
        assert_eq!(view.mark_selected_for_deletion(), 3);
        assert!(view.start_create().is_none());

        view.unmark_all();
        view.click("2", ClickModifiers::NONE);
        view.mark_selected_for_deletion();
        assert_eq!(view.commit_deletions(&client).await.unwrap(), 1);
        assert_eq!(mock.ids("docs"), vec!["1", "3"]);
        assert!(view.marked_for_deletion().is_empty());
        assert!(view.selection().is_empty());

        assert!(matches!(
            view.commit_deletions(&client).await,
            Err(Error::Validation(ValidationError::Empty))
        ));
    }

    #[tokio::test]
    async fn test_editor_updates_primary_row() {
        let (mock, client) = setup();
        let mut session = Session::new(PROFILE, DEFAULT_RESULTS);
        open(&mut session, &client, "papers").await;
        let view = session.documents.as_mut().unwrap();
        view.click("p1", ClickModifiers::NONE);
        assert!(view.open_editor());
        view.editor_mut().unwrap().set_document("revised".to_string());
        assert!(view.save_editor(&client).await.unwrap());

        let update = mock.last_update.lock().unwrap().clone().unwrap();
        assert_eq!(update.document.as_deref(), Some("revised"));
        assert!(update.regenerate_embedding);
        assert_eq!(view.rows()[0].document.as_deref(), Some("revised"));
    }

    #[tokio::test]
    async fn test_paste_collection_runs_copy_with_progress() {
        let (mock, client) = setup();
        *mock.copy_events.lock().unwrap() = vec![
            CopyProgress::Creating,
            CopyProgress::Copying {
                processed_documents: 1,
                total_documents: 3,
            },
            CopyProgress::Complete {
                processed_documents: 3,
                total_documents: Some(3),
            },
        ];
        let mut session = Session::new(PROFILE, DEFAULT_RESULTS);
        open(&mut session, &client, "docs").await;
        session.documents = None;

        assert!(command(&mut session, &client, AppCommand::Copy).await);
        assert!(session.clipboard.has_copied_collection());
        assert!(command(&mut session, &client, AppCommand::Paste).await);
        assert_eq!(session.collections.draft().unwrap().name, "docs-copy");

        let outcome = session.handle_command(AppCommand::Save, &client).await.unwrap();
        let CommandOutcome::Copy(request) = outcome else {
            panic!("expected a copy, got {:?}", outcome);
        };
        assert!(session.collections.copy_dialog().is_some());

        let session = Mutex::new(session);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = run_copy(&session, &client, request, Some(tx)).await.unwrap();
        assert!(outcome.success);
        let mut session = session.into_inner();
        let dialog = session.collections.copy_dialog().unwrap();
        assert_eq!(dialog.state(), &CopyDialogState::Complete { processed: 3, total: 3 });
        let mut forwarded = 0;
        while rx.try_recv().is_ok() {
            forwarded += 1;
        }
        assert_eq!(forwarded, 3);

        assert!(session.collections.dismiss_copy_dialog());
        assert!(session.collections.draft().is_none());
        assert!(session
            .collections
            .collections()
            .iter()
            .any(|c| c.name == "docs-copy"));
    }

    #[tokio::test]
    async fn test_cancel_reaches_copy_running_outside_session() {
        let (mock, client) = setup();
        mock.block_copy.store(true, Ordering::SeqCst);
        *mock.copy_events.lock().unwrap() = vec![
            CopyProgress::Creating,
            CopyProgress::Copying {
                processed_documents: 1,
                total_documents: 3,
            },
        ];
        let mut session = Session::new(PROFILE, DEFAULT_RESULTS);
        session.collections.refresh(&client).await.unwrap();
        session.collections.select("docs");
        assert!(command(&mut session, &client, AppCommand::Copy).await);
        assert!(command(&mut session, &client, AppCommand::Paste).await);
        let CommandOutcome::Copy(request) =
            session.handle_command(AppCommand::Save, &client).await.unwrap()
        else {
            panic!("expected a copy");
        };

        let session = Mutex::new(session);
        let (outcome, cancelled) = tokio::join!(
            run_copy(&session, &client, request, None),
            async {
                loop {
                    let copying = matches!(
                        session.lock().await.collections.copy_dialog().map(|d| d.state()),
                        Some(CopyDialogState::Copying { .. })
                    );
                    if copying {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
                cancel_copy(&session, &client).await
            }
        );
        assert!(cancelled.unwrap());
        assert!(!outcome.unwrap().success);
        assert_eq!(CallCounts::get(&mock.calls.cancel_copy), 1);

        let mut session = session.into_inner();
        let dialog = session.collections.copy_dialog().unwrap();
        assert_eq!(dialog.state(), &CopyDialogState::Cancelled);
        // The partial target is listed even though the copy did not finish.
        assert!(session
            .collections
            .collections()
            .iter()
            .any(|c| c.name == "docs-copy"));
        assert!(!cancel_copy(&Mutex::new(Session::new(PROFILE, DEFAULT_RESULTS)), &client)
            .await
            .unwrap());
        assert!(session.collections.dismiss_copy_dialog());
        assert!(session.collections.draft().is_some());
    }

    #[tokio::test]
    async fn test_delete_collection_needs_exact_name() {
        let (mock, client) = setup();
        let mut session = Session::new(PROFILE, DEFAULT_RESULTS);
        session.collections.refresh(&client).await.unwrap();

        assert!(session.collections.begin_delete("docs"));
        session.collections.set_delete_confirmation_text("doc");
        let err = session.collections.confirm_delete(&client).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(CallCounts::get(&mock.calls.delete_collection), 0);

        session.collections.set_delete_confirmation_text("docs");
        assert_eq!(session.collections.confirm_delete(&client).await.unwrap(), "docs");
        assert!(session.collections.delete_confirmation().is_none());
        assert!(session.collections.collections().iter().all(|c| c.name != "docs"));
    }

    #[tokio::test]
    async fn test_reopening_same_collection_keeps_drafts() {
        let (_mock, client) = setup();
        let mut session = Session::new(PROFILE, DEFAULT_RESULTS);
        open(&mut session, &client, "docs").await;
        assert!(command(&mut session, &client, AppCommand::NewDocument).await);

        assert!(session.open_collection("docs").staging().is_drafting());
        assert!(!session.open_collection("papers").staging().is_drafting());
        assert_eq!(session.collections.selected(), Some("papers"));
    }

    #[tokio::test]
    async fn test_commands_without_open_collection() {
        let (_mock, client) = setup();
        let mut session = Session::new(PROFILE, DEFAULT_RESULTS);
        assert!(!command(&mut session, &client, AppCommand::NewDocument).await);
        assert!(!command(&mut session, &client, AppCommand::Copy).await);
        assert!(command(&mut session, &client, AppCommand::NewCollection).await);
        assert!(command(&mut session, &client, AppCommand::Cancel).await);
        assert!(session.collections.draft().is_none());
    }
}
