//! Language server facade
//!
//! The single entry point callers use to drive one language server: resolve
//! the adapter, spawn and supervise the process, run the initialize
//! handshake, and issue semantic requests in terms of repository-relative
//! file paths. Shutdown is idempotent and never raises.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use tokio::sync::Mutex as AsyncMutex;

use crate::adapter::LanguageAdapter;
use crate::config::OrchestratorConfig;
use crate::document::{self, DocumentTracker};
use crate::error::{Error, Result};
use crate::language::Language;
use crate::process::{ProcessHealth, ProcessState, ServerProcessHandle};
use crate::session::{RpcSession, SessionState};
use crate::types::{DocumentSymbol, Hover, Location, ServerCapabilities, SymbolInformation};

/// Live (language, repository root) pairs across all facade instances. At
/// most one server per pair may be running at a time.
static ACTIVE_SERVERS: OnceLock<StdMutex<HashSet<(Language, PathBuf)>>> = OnceLock::new();

fn active_servers() -> &'static StdMutex<HashSet<(Language, PathBuf)>> {
    ACTIVE_SERVERS.get_or_init(|| StdMutex::new(HashSet::new()))
}

fn lock_active() -> std::sync::MutexGuard<'static, HashSet<(Language, PathBuf)>> {
    match active_servers().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Everything that exists only while the server is up.
struct Running {
    session: RpcSession,
    handle: AsyncMutex<ServerProcessHandle>,
    capabilities: ServerCapabilities,
}

/// One language server: lifecycle plus the uniform request surface. Paths
/// handed to request methods are relative to the repository root configured
/// at construction; positions are 0-indexed per the protocol.
pub struct LanguageServer {
    language: Language,
    adapter: Box<dyn LanguageAdapter>,
    repository_root: PathBuf,
    config: OrchestratorConfig,
    running: Option<Running>,
    ever_started: bool,
    guard_held: bool,
    documents: StdMutex<DocumentTracker>,
    diagnostics: Arc<StdMutex<HashMap<String, serde_json::Value>>>,
}

impl LanguageServer {
    /// Facade for a registered language, using its registry adapter.
    pub fn new(language: Language, repository_root: impl Into<PathBuf>) -> Self {
        Self::with_adapter(language.resolve(), repository_root)
    }

    /// Facade over a caller-supplied adapter. This is how non-registry
    /// servers (custom builds, test stubs) are driven.
    pub fn with_adapter(
        adapter: Box<dyn LanguageAdapter>,
        repository_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            language: adapter.language(),
            adapter,
            repository_root: repository_root.into(),
            config: OrchestratorConfig::default(),
            running: None,
            ever_started: false,
            guard_held: false,
            documents: StdMutex::new(DocumentTracker::new()),
            diagnostics: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn repository_root(&self) -> &Path {
        &self.repository_root
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Capabilities announced by the server, once started.
    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.running.as_ref().map(|r| &r.capabilities)
    }

    /// Spawn the server and run the initialize handshake. On any failure
    /// the partially-started process is terminated before the error
    /// propagates; no process is ever leaked by a failed startup.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::AlreadyRunning {
                language: self.language,
                root: self.repository_root.clone(),
            });
        }

        {
            let mut active = lock_active();
            if !active.insert((self.language, self.repository_root.clone())) {
                return Err(Error::AlreadyRunning {
                    language: self.language,
                    root: self.repository_root.clone(),
                });
            }
        }
        self.guard_held = true;

        let mut command = self.adapter.launch_command(&self.repository_root);
        if let Some(overrides) = self.config.override_for(self.language) {
            if let Some(program) = &overrides.command {
                command.program = program.clone();
            }
            if let Some(args) = &overrides.args {
                command.args = args.clone();
            }
            command.env.extend(overrides.env.clone());
        }

        let mut handle = match ServerProcessHandle::spawn(self.language.id(), &command) {
            Ok(handle) => handle,
            Err(e) => {
                self.release_guard();
                return Err(Error::startup(e));
            }
        };

        let Some((stdin, stdout)) = handle.take_streams() else {
            handle.terminate(self.config.shutdown_grace()).await;
            self.release_guard();
            return Err(Error::startup(Error::SessionFailure(
                "subprocess streams unavailable".to_string(),
            )));
        };

        let session = RpcSession::new(self.language.id(), stdout, stdin);

        // Keep the latest published diagnostics per document
        {
            let diagnostics = self.diagnostics.clone();
            session
                .on_notification("textDocument/publishDiagnostics", move |params| {
                    let Some(params) = params else { return };
                    let Some(uri) = params.get("uri").and_then(|u| u.as_str()) else {
                        return;
                    };
                    let list = params
                        .get("diagnostics")
                        .cloned()
                        .unwrap_or_else(|| serde_json::Value::Array(Vec::new()));
                    let mut store = match diagnostics.lock() {
                        Ok(store) => store,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    store.insert(uri.to_string(), list);
                })
                .await;
        }

        let init = session
            .initialize(self.initialize_params(), self.config.initialize_timeout())
            .await;

        match init {
            Ok(init) => {
                handle.set_state(ProcessState::Running);
                self.ever_started = true;
                self.running = Some(Running {
                    session,
                    handle: AsyncMutex::new(handle),
                    capabilities: init.capabilities,
                });
                tracing::info!(
                    "{} server ready for {}",
                    self.language,
                    self.repository_root.display()
                );
                Ok(())
            }
            Err(e) => {
                let tail = handle.stderr_tail();
                if !tail.is_empty() {
                    tracing::warn!(
                        "{} server failed to initialize; last stderr: {:?}",
                        self.language,
                        tail.last()
                    );
                }
                handle.terminate(self.config.shutdown_grace()).await;
                self.release_guard();
                Err(Error::startup(e))
            }
        }
    }

    /// Drive the protocol shutdown sequence, then make sure the process is
    /// dead. Idempotent: a second call is a no-op. Errors met while
    /// unwinding are recorded in the log, never re-raised.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            tracing::debug!("{} server already stopped", self.language);
            return;
        };

        running.session.shutdown(self.config.shutdown_grace()).await;

        let mut handle = running.handle.into_inner();
        handle.terminate(self.config.shutdown_grace()).await;

        match self.documents.lock() {
            Ok(mut docs) => docs.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
        match self.diagnostics.lock() {
            Ok(mut store) => store.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }

        self.release_guard();
        tracing::info!("{} server stopped", self.language);
    }

    // ========== Semantic requests ==========

    /// Retrieve the document symbols of one file as a flat sequence in
    /// document order, together with the raw server response for callers
    /// needing full fidelity.
    pub async fn request_document_symbols(
        &self,
        relative_path: &str,
    ) -> Result<(Vec<SymbolInformation>, serde_json::Value)> {
        let running = self.require_running()?;
        let uri = self.ensure_open(relative_path).await?;

        if !running.capabilities.supports_document_symbols() {
            tracing::warn!(
                "{} server does not announce documentSymbol support",
                self.language
            );
        }

        let method = "textDocument/documentSymbol";
        let params = self.adapter.translate_request(
            method,
            Some(serde_json::json!({ "textDocument": { "uri": uri } })),
        );
        let raw = self.checked_call(method, params).await?;

        let translated = self.adapter.translate_response(method, raw.clone());
        let symbols = normalize_symbols(translated, &uri);
        Ok((symbols, raw))
    }

    /// textDocument/definition
    pub async fn request_definition(
        &self,
        relative_path: &str,
        line: u32,
        character: u32,
    ) -> Result<Vec<Location>> {
        let raw = self
            .position_request("textDocument/definition", relative_path, line, character)
            .await?;
        Ok(parse_locations(raw))
    }

    /// textDocument/references
    pub async fn request_references(
        &self,
        relative_path: &str,
        line: u32,
        character: u32,
        include_declaration: bool,
    ) -> Result<Vec<Location>> {
        let uri = self.ensure_open(relative_path).await?;

        let method = "textDocument/references";
        let params = self.adapter.translate_request(
            method,
            Some(serde_json::json!({
                "textDocument": { "uri": uri },
                "position": { "line": line, "character": character },
                "context": { "includeDeclaration": include_declaration }
            })),
        );
        let raw = self.checked_call(method, params).await?;
        Ok(parse_locations(self.adapter.translate_response(method, raw)))
    }

    /// textDocument/hover
    pub async fn request_hover(
        &self,
        relative_path: &str,
        line: u32,
        character: u32,
    ) -> Result<Option<Hover>> {
        let raw = self
            .position_request("textDocument/hover", relative_path, line, character)
            .await?;
        if raw.is_null() {
            return Ok(None);
        }
        serde_json::from_value(raw)
            .map(Some)
            .map_err(|e| Error::SessionFailure(format!("unparseable hover response: {}", e)))
    }

    /// Latest diagnostics the server published for a file, if any.
    pub fn diagnostics(&self, relative_path: &str) -> Option<serde_json::Value> {
        let uri = document::path_to_uri(&self.repository_root.join(relative_path));
        let store = match self.diagnostics.lock() {
            Ok(store) => store,
            Err(poisoned) => poisoned.into_inner(),
        };
        store.get(&uri).cloned()
    }

    // ========== Health ==========

    /// Non-blocking poll of the subprocess.
    pub async fn health(&self) -> Option<ProcessHealth> {
        let running = self.running.as_ref()?;
        Some(running.handle.lock().await.health_check())
    }

    /// Lifecycle state of the subprocess.
    pub async fn process_state(&self) -> ProcessState {
        match &self.running {
            Some(running) => running.handle.lock().await.state(),
            None if self.ever_started => ProcessState::Stopped,
            None => ProcessState::NotStarted,
        }
    }

    /// State of the RPC session, if one exists.
    pub async fn session_state(&self) -> Option<SessionState> {
        match &self.running {
            Some(running) => Some(running.session.state().await),
            None => None,
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        let running = self.running.as_ref()?;
        running.handle.lock().await.pid()
    }

    // ========== Internals ==========

    fn require_running(&self) -> Result<&Running> {
        self.running
            .as_ref()
            .ok_or_else(|| Error::NotReady("stopped".to_string()))
    }

    fn initialize_params(&self) -> serde_json::Value {
        serde_json::json!({
            "processId": std::process::id(),
            "rootUri": document::path_to_uri(&self.repository_root),
            "capabilities": {
                "textDocument": {
                    "definition": { "linkSupport": false },
                    "references": {},
                    "hover": { "contentFormat": ["markdown", "plaintext"] },
                    "documentSymbol": {
                        "hierarchicalDocumentSymbolSupport": true
                    },
                    "publishDiagnostics": {}
                }
            },
            "initializationOptions": self.adapter.initialization_options()
        })
    }

    /// Make sure the server has the current on-disk content of a file,
    /// sending didOpen or didChange as needed. Returns the document URI.
    async fn ensure_open(&self, relative_path: &str) -> Result<String> {
        let running = self.require_running()?;
        let path = self.repository_root.join(relative_path);
        let uri = document::path_to_uri(&path);
        let content = tokio::fs::read_to_string(&path).await?;

        enum SyncAction {
            AlreadyCurrent,
            Open,
            Change(i32),
        }

        let action = {
            let mut docs = match self.documents.lock() {
                Ok(docs) => docs,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !docs.is_open(&uri) {
                docs.mark_open(&uri, &content);
                SyncAction::Open
            } else if docs.needs_sync(&uri, &content) {
                SyncAction::Change(docs.update_version(&uri, &content).unwrap_or(1))
            } else {
                SyncAction::AlreadyCurrent
            }
        };

        match action {
            SyncAction::Open => running.session.notify(
                "textDocument/didOpen",
                Some(serde_json::json!({
                    "textDocument": {
                        "uri": uri,
                        "languageId": self.adapter.language_id(),
                        "version": 1,
                        "text": content
                    }
                })),
            )?,
            SyncAction::Change(version) => running.session.notify(
                "textDocument/didChange",
                Some(serde_json::json!({
                    "textDocument": { "uri": uri, "version": version },
                    "contentChanges": [{ "text": content }]
                })),
            )?,
            SyncAction::AlreadyCurrent => {}
        }

        Ok(uri)
    }

    async fn position_request(
        &self,
        method: &str,
        relative_path: &str,
        line: u32,
        character: u32,
    ) -> Result<serde_json::Value> {
        let uri = self.ensure_open(relative_path).await?;

        let params = self.adapter.translate_request(
            method,
            Some(serde_json::json!({
                "textDocument": { "uri": uri },
                "position": { "line": line, "character": character }
            })),
        );
        let raw = self.checked_call(method, params).await?;
        Ok(self.adapter.translate_response(method, raw))
    }

    /// Issue a session call with the configured timeout. A session-level
    /// failure marks the process Degraded: the wire is unusable even though
    /// the process may still be alive.
    async fn checked_call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let running = self.require_running()?;
        let result = running
            .session
            .call(method, params, self.config.request_timeout(self.language))
            .await;
        if let Err(Error::SessionFailure(_)) = &result {
            running
                .handle
                .lock()
                .await
                .set_state(ProcessState::Degraded);
        }
        result
    }

    fn release_guard(&mut self) {
        if self.guard_held {
            lock_active().remove(&(self.language, self.repository_root.clone()));
            self.guard_held = false;
        }
    }
}

impl Drop for LanguageServer {
    fn drop(&mut self) {
        // The subprocess itself is covered by kill_on_drop
        self.release_guard();
    }
}

/// Normalize a documentSymbol result into a flat sequence. Servers return
/// either flat `SymbolInformation[]` or hierarchical `DocumentSymbol[]`;
/// hierarchies are flattened depth-first, parent before children, which
/// preserves document order.
fn normalize_symbols(result: serde_json::Value, uri: &str) -> Vec<SymbolInformation> {
    if result.is_null() {
        return Vec::new();
    }

    if let Ok(symbols) = serde_json::from_value::<Vec<SymbolInformation>>(result.clone()) {
        return symbols;
    }

    if let Ok(nested) = serde_json::from_value::<Vec<DocumentSymbol>>(result) {
        let mut flat = Vec::new();
        flatten_into(&nested, uri, None, &mut flat);
        return flat;
    }

    tracing::warn!("documentSymbol result has an unrecognized shape");
    Vec::new()
}

fn flatten_into(
    symbols: &[DocumentSymbol],
    uri: &str,
    container: Option<&str>,
    out: &mut Vec<SymbolInformation>,
) {
    for symbol in symbols {
        out.push(SymbolInformation {
            name: symbol.name.clone(),
            kind: symbol.kind,
            location: Location {
                uri: uri.to_string(),
                range: symbol.selection_range,
            },
            container_name: container.map(String::from),
        });
        if !symbol.children.is_empty() {
            flatten_into(&symbol.children, uri, Some(&symbol.name), out);
        }
    }
}

/// Parse a definition/references result, which may be a single Location, an
/// array of Locations, or null.
fn parse_locations(result: serde_json::Value) -> Vec<Location> {
    if result.is_null() {
        return Vec::new();
    }
    if let Ok(locations) = serde_json::from_value::<Vec<Location>>(result.clone()) {
        return locations;
    }
    if let Ok(location) = serde_json::from_value::<Location>(result) {
        return vec![location];
    }
    tracing::warn!("location result has an unrecognized shape");
    Vec::new()
}
