use anyhow::Result;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tauri::menu::{Menu, MenuItem, PredefinedMenuItem, Submenu};
use tauri::{AppHandle, Emitter, Manager, Runtime, State};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex};
use tracing_subscriber::EnvFilter;

use crate::collections::DraftCollection;
use crate::dispatch::{AppCommand, CommandDispatcher};
use crate::drafts::DraftPatch;
use crate::filters::FilterRow;
use crate::http::HttpChromaService;
use crate::metadata::TypedMetadata;
use crate::query::QueryClient;
use crate::selection::ClickModifiers;
use crate::service::CopyCollectionRequest;
use crate::session::{self, CommandOutcome, Session, TableRow};
use crate::settings::{load_settings_from, save_settings_to, Settings, SETTINGS_FILE};

pub struct AppState {
    settings: RwLock<Settings>,
    service: Arc<HttpChromaService>,
    client: Arc<QueryClient>,
    session: Arc<Mutex<Session>>,
    dispatcher: CommandDispatcher,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionSnapshot<'a> {
    session: &'a Session,
    rows: Vec<TableRow>,
}

fn snapshot(session: &Session) -> Result<JsonValue, String> {
    let rows = session
        .documents
        .as_ref()
        .map(|view| view.display_rows())
        .unwrap_or_default();
    serde_json::to_value(SessionSnapshot { session, rows }).map_err(|e| e.to_string())
}

fn new_session(settings: &Settings) -> Session {
    let profile_id = settings
        .active_profile()
        .map(|p| p.id.clone())
        .unwrap_or_default();
    Session::new(&profile_id, settings.default_results)
}

fn get_settings_path<R: Runtime>(app: &AppHandle<R>) -> Result<PathBuf> {
    let app_data = app.path().app_data_dir()?;
    std::fs::create_dir_all(&app_data)?;
    Ok(app_data.join(SETTINGS_FILE))
}

fn load_settings<R: Runtime>(app: &AppHandle<R>) -> Settings {
    match get_settings_path(app) {
        Ok(path) => load_settings_from(&path),
        Err(err) => {
            tracing::warn!("no settings directory: {:#}", err);
            Settings::default()
        }
    }
}

// TAURI COMMANDS

#[tauri::command]
fn get_settings(state: State<AppState>) -> Result<Settings, String> {
    state
        .settings
        .read()
        .map(|s| s.clone())
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn update_settings(
    app: AppHandle,
    new_settings: Settings,
    state: State<'_, AppState>,
) -> Result<JsonValue, String> {
    let path = get_settings_path(&app).map_err(|e| e.to_string())?;
    save_settings_to(&path, &new_settings).map_err(|e| format!("{:#}", e))?;
    state.service.apply_settings(&new_settings);

    let profile_changed = {
        let mut settings = state.settings.write().map_err(|e| e.to_string())?;
        let changed = settings.active_profile().map(|p| p.id.clone())
            != new_settings.active_profile().map(|p| p.id.clone());
        *settings = new_settings.clone();
        changed
    };

    let mut session = state.session.lock().await;
    if profile_changed {
        *session = new_session(&new_settings);
        tracing::info!(profile = %session.profile_id(), "switched connection");
    }
    snapshot(&session)
}

#[tauri::command]
async fn get_session(state: State<'_, AppState>) -> Result<JsonValue, String> {
    snapshot(&*state.session.lock().await)
}

#[tauri::command]
async fn refresh_collections(state: State<'_, AppState>) -> Result<JsonValue, String> {
    let mut session = state.session.lock().await;
    session
        .collections
        .refresh(&state.client)
        .await
        .map_err(|e| e.to_string())?;
    snapshot(&session)
}

#[tauri::command]
async fn select_collection(name: String, state: State<'_, AppState>) -> Result<JsonValue, String> {
    let mut session = state.session.lock().await;
    session.collections.select(&name);
    snapshot(&session)
}

#[tauri::command]
async fn open_collection(name: String, state: State<'_, AppState>) -> Result<JsonValue, String> {
    let mut session = state.session.lock().await;
    session
        .open_collection(&name)
        .refresh(&state.client)
        .await
        .map_err(|e| e.to_string())?;
    snapshot(&session)
}

#[tauri::command]
async fn set_filters(
    filters: Vec<FilterRow>,
    state: State<'_, AppState>,
) -> Result<JsonValue, String> {
    let mut session = state.session.lock().await;
    if let Some(view) = session.documents.as_mut() {
        view.set_filters(filters);
        view.refresh(&state.client).await.map_err(|e| e.to_string())?;
    }
    snapshot(&session)
}

#[tauri::command]
async fn click_row(
    id: String,
    modifiers: ClickModifiers,
    state: State<'_, AppState>,
) -> Result<JsonValue, String> {
    let mut session = state.session.lock().await;
    if let Some(view) = session.documents.as_mut() {
        view.click(&id, modifiers);
    }
    snapshot(&session)
}

#[tauri::command]
async fn pointer_down(
    index: usize,
    modifiers: ClickModifiers,
    state: State<'_, AppState>,
) -> Result<(), String> {
    if let Some(view) = state.session.lock().await.documents.as_mut() {
        view.pointer_down(index, modifiers);
    }
    Ok(())
}

#[tauri::command]
async fn pointer_enter(index: usize, state: State<'_, AppState>) -> Result<JsonValue, String> {
    let mut session = state.session.lock().await;
    if let Some(view) = session.documents.as_mut() {
        view.pointer_enter(index);
    }
    snapshot(&session)
}

/// Returns true when the click that follows a drag should be ignored.
#[tauri::command]
async fn pointer_up(state: State<'_, AppState>) -> Result<bool, String> {
    Ok(state
        .session
        .lock()
        .await
        .documents
        .as_mut()
        .map_or(false, |view| view.pointer_up()))
}

#[tauri::command]
async fn update_draft(
    index: usize,
    patch: DraftPatch,
    state: State<'_, AppState>,
) -> Result<JsonValue, String> {
    let mut session = state.session.lock().await;
    if let Some(view) = session.documents.as_mut() {
        view.update_draft_field(index, patch);
    }
    snapshot(&session)
}

#[tauri::command]
async fn open_editor(state: State<'_, AppState>) -> Result<JsonValue, String> {
    let mut session = state.session.lock().await;
    if let Some(view) = session.documents.as_mut() {
        view.open_editor();
    }
    snapshot(&session)
}

#[tauri::command]
async fn update_editor(
    document: String,
    metadata: TypedMetadata,
    regenerate_embedding: Option<bool>,
    state: State<'_, AppState>,
) -> Result<JsonValue, String> {
    let mut session = state.session.lock().await;
    if let Some(editor) = session.documents.as_mut().and_then(|v| v.editor_mut()) {
        editor.set_document(document);
        editor.set_metadata(metadata);
        editor.regenerate_embedding = regenerate_embedding;
    }
    snapshot(&session)
}

#[tauri::command]
async fn update_draft_collection(
    draft: DraftCollection,
    state: State<'_, AppState>,
) -> Result<JsonValue, String> {
    let mut session = state.session.lock().await;
    if let Some(current) = session.collections.draft_mut() {
        *current = draft;
    }
    snapshot(&session)
}

/// Drives a copy without holding the session lock, so cancel requests reach
/// it. Every progress event is emitted to the window as it arrives.
async fn run_copy<R: Runtime>(
    app: &AppHandle<R>,
    request: CopyCollectionRequest,
) -> Result<JsonValue, String> {
    let state = app.state::<AppState>();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let emitter = app.clone();
    let forwarder = tauri::async_runtime::spawn(async move {
        while let Some(event) = rx.recv().await {
            let _ = emitter.emit("copy-progress", &event);
        }
    });
    // Failures already live in the dialog.
    let _ = session::run_copy(&state.session, &state.client, request, Some(tx)).await;
    let _ = forwarder.await;
    snapshot(&*state.session.lock().await)
}

#[tauri::command]
async fn commit_draft_collection(
    app: AppHandle,
    state: State<'_, AppState>,
) -> Result<JsonValue, String> {
    let copy = {
        let mut session = state.session.lock().await;
        session
            .collections
            .commit_draft(&state.client)
            .await
            .map_err(|e| e.to_string())?
    };
    match copy {
        Some(request) => run_copy(&app, request).await,
        None => snapshot(&*state.session.lock().await),
    }
}

#[tauri::command]
async fn cancel_copy(state: State<'_, AppState>) -> Result<JsonValue, String> {
    session::cancel_copy(&state.session, &state.client)
        .await
        .map_err(|e| e.to_string())?;
    snapshot(&*state.session.lock().await)
}

#[tauri::command]
async fn dismiss_copy_dialog(state: State<'_, AppState>) -> Result<JsonValue, String> {
    let mut session = state.session.lock().await;
    session.collections.dismiss_copy_dialog();
    snapshot(&session)
}

#[tauri::command]
async fn begin_delete_collection(
    name: String,
    state: State<'_, AppState>,
) -> Result<JsonValue, String> {
    let mut session = state.session.lock().await;
    session.collections.begin_delete(&name);
    snapshot(&session)
}

#[tauri::command]
async fn set_delete_confirmation(
    typed: String,
    state: State<'_, AppState>,
) -> Result<JsonValue, String> {
    let mut session = state.session.lock().await;
    session.collections.set_delete_confirmation_text(&typed);
    snapshot(&session)
}

#[tauri::command]
async fn cancel_delete_collection(state: State<'_, AppState>) -> Result<JsonValue, String> {
    let mut session = state.session.lock().await;
    session.collections.cancel_delete();
    snapshot(&session)
}

#[tauri::command]
async fn confirm_delete_collection(state: State<'_, AppState>) -> Result<JsonValue, String> {
    let mut session = state.session.lock().await;
    let name = session
        .collections
        .confirm_delete(&state.client)
        .await
        .map_err(|e| e.to_string())?;
    if session
        .documents
        .as_ref()
        .map_or(false, |view| view.collection_name() == name)
    {
        session.documents = None;
    }
    snapshot(&session)
}

/// Toolbar buttons and shortcuts go through the same dispatcher as the menu.
#[tauri::command]
fn dispatch_command(command: AppCommand, state: State<AppState>) -> usize {
    state.dispatcher.dispatch(command)
}

// ---- Menu ----

fn build_menu<R: Runtime>(app: &AppHandle<R>) -> tauri::Result<Menu<R>> {
    let item = |command: AppCommand, label: &str, accelerator: Option<&str>| {
        MenuItem::with_id(app, command.as_str(), label, true, accelerator)
    };

    let file = Submenu::with_items(
        app,
        "File",
        true,
        &[
            &item(AppCommand::NewDocument, "New Document", Some("CmdOrCtrl+N"))?,
            &item(AppCommand::NewCollection, "New Collection", Some("CmdOrCtrl+Shift+N"))?,
            &PredefinedMenuItem::separator(app)?,
            &item(AppCommand::Save, "Save", Some("CmdOrCtrl+S"))?,
            &item(AppCommand::Refresh, "Refresh", Some("CmdOrCtrl+R"))?,
            &PredefinedMenuItem::separator(app)?,
            &PredefinedMenuItem::quit(app, None)?,
        ],
    )?;
    let edit = Submenu::with_items(
        app,
        "Edit",
        true,
        &[
            &item(AppCommand::Copy, "Copy", Some("CmdOrCtrl+C"))?,
            &item(AppCommand::Paste, "Paste", Some("CmdOrCtrl+V"))?,
            &item(AppCommand::DeleteSelection, "Delete", Some("CmdOrCtrl+Backspace"))?,
            &PredefinedMenuItem::separator(app)?,
            &item(AppCommand::SelectAll, "Select All", Some("CmdOrCtrl+A"))?,
            &item(AppCommand::ClearSelection, "Clear Selection", None)?,
            &item(AppCommand::Cancel, "Cancel", Some("Escape"))?,
        ],
    )?;
    Menu::with_items(app, &[&file, &edit])
}

fn emit_snapshot<R: Runtime>(app: &AppHandle<R>, value: Result<JsonValue, String>) {
    match value {
        Ok(value) => {
            let _ = app.emit("session-changed", value);
        }
        Err(err) => tracing::warn!("snapshot failed: {}", err),
    }
}

/// Applies every dispatched command to the session and pushes the result to
/// the window. A collection copy is handed to its own task so the loop and
/// the session stay free while it runs.
fn spawn_command_loop(app: AppHandle) {
    tauri::async_runtime::spawn(async move {
        let state = app.state::<AppState>();
        let mut commands = state.dispatcher.subscribe();
        loop {
            let command = match commands.recv().await {
                Ok(command) => command,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "command loop fell behind");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let handled = {
                let mut session = state.session.lock().await;
                let handled = session.handle_command(command, &state.client).await;
                emit_snapshot(&app, snapshot(&session));
                handled
            };
            match handled {
                Ok(CommandOutcome::Copy(request)) => {
                    let app = app.clone();
                    tauri::async_runtime::spawn(async move {
                        let result = run_copy(&app, request).await;
                        emit_snapshot(&app, result);
                    });
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(%command, "command failed: {}", err);
                    let _ = app.emit("command-error", err.to_string());
                }
            }
        }
    });
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chroma_desk_lib=info")),
        )
        .try_init();

    tauri::Builder::default()
        .plugin(tauri_plugin_opener::init())
        .plugin(tauri_plugin_dialog::init())
        .menu(build_menu)
        .on_menu_event(|app, event| {
            if let Some(command) = AppCommand::from_menu_id(event.id().as_ref()) {
                app.state::<AppState>().dispatcher.dispatch(command);
            }
        })
        .setup(|app| {
            // Load settings on startup
            let settings = load_settings(app.handle());
            let service = Arc::new(HttpChromaService::from_settings(&settings));
            let client = Arc::new(QueryClient::new(service.clone()));
            let session = new_session(&settings);
            tracing::info!(profile = %session.profile_id(), "starting");

            let state = AppState {
                settings: RwLock::new(settings),
                service,
                client,
                session: Arc::new(Mutex::new(session)),
                dispatcher: CommandDispatcher::new(),
            };
            app.manage(state);
            spawn_command_loop(app.handle().clone());
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            get_settings,
            update_settings,
            get_session,
            refresh_collections,
            select_collection,
            open_collection,
            set_filters,
            click_row,
            pointer_down,
            pointer_enter,
            pointer_up,
            update_draft,
            open_editor,
            update_editor,
            update_draft_collection,
            commit_draft_collection,
            cancel_copy,
            dismiss_copy_dialog,
            begin_delete_collection,
            set_delete_confirmation,
            cancel_delete_collection,
            confirm_delete_collection,
            dispatch_command,
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
