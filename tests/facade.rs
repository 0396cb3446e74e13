//! End-to-end tests driving the facade against a real spawned stub server
//! (the `testls` binary).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serial_test::serial;

use polyls::adapter::LanguageAdapter;
use polyls::{
    Error, Language, LanguageOverride, LanguageServer, OrchestratorConfig, ProcessCommand,
    ProcessHealth, ProcessState, SessionState, SymbolKind,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn testls_path() -> String {
    env!("CARGO_BIN_EXE_testls").to_string()
}

/// Adapter pointing at the testls stub binary.
struct StubAdapter {
    flags: Vec<String>,
}

impl StubAdapter {
    fn new(flags: &[&str]) -> Box<Self> {
        Box::new(Self {
            flags: flags.iter().map(|f| f.to_string()).collect(),
        })
    }
}

impl LanguageAdapter for StubAdapter {
    fn language(&self) -> Language {
        Language::Python
    }

    fn launch_command(&self, repository_root: &Path) -> ProcessCommand {
        ProcessCommand {
            program: testls_path(),
            args: self.flags.clone(),
            env: HashMap::new(),
            working_dir: repository_root.to_path_buf(),
        }
    }

    fn root_markers(&self) -> &'static [&'static str] {
        &["pyproject.toml"]
    }
}

/// Adapter that rewrites documentSymbol responses, proving the facade
/// threads results through the translation hook.
struct UppercasingAdapter;

impl LanguageAdapter for UppercasingAdapter {
    fn language(&self) -> Language {
        Language::Python
    }

    fn launch_command(&self, repository_root: &Path) -> ProcessCommand {
        ProcessCommand {
            program: testls_path(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: repository_root.to_path_buf(),
        }
    }

    fn root_markers(&self) -> &'static [&'static str] {
        &["pyproject.toml"]
    }

    fn translate_response(&self, method: &str, result: serde_json::Value) -> serde_json::Value {
        if method != "textDocument/documentSymbol" {
            return result;
        }
        let mut result = result;
        if let Some(symbols) = result.as_array_mut() {
            for symbol in symbols {
                if let Some(name) = symbol.get("name").and_then(|n| n.as_str()) {
                    let upper = name.to_uppercase();
                    symbol["name"] = serde_json::Value::String(upper);
                }
            }
        }
        result
    }
}

fn write_three_functions(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("module.py");
    std::fs::write(
        &path,
        "def alpha():\n    return 1\n\ndef beta():\n    return alpha()\n\ndef gamma():\n    return beta()\n",
    )
    .unwrap();
    path
}

async fn started(adapter: Box<dyn LanguageAdapter>, root: &Path) -> LanguageServer {
    let mut server = LanguageServer::with_adapter(adapter, root);
    server.start().await.unwrap();
    server
}

#[tokio::test]
async fn test_end_to_end_document_symbols_in_order() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_three_functions(dir.path());

    let mut server = started(StubAdapter::new(&[]), dir.path()).await;
    assert!(server.is_running());
    assert_eq!(server.session_state().await, Some(SessionState::Ready));
    assert_eq!(server.health().await, Some(ProcessHealth::Alive));

    let (symbols, raw) = server.request_document_symbols("module.py").await.unwrap();

    let names: Vec<&str> = symbols.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    assert!(symbols.iter().all(|s| s.kind == SymbolKind::Function));

    // Document order: start lines strictly increase
    let lines: Vec<u32> = symbols
        .iter()
        .map(|s| s.location.range.start.line)
        .collect();
    assert!(lines.windows(2).all(|w| w[0] < w[1]), "{:?}", lines);

    // Raw response is preserved for full-fidelity callers
    assert_eq!(raw.as_array().map(|a| a.len()), Some(3));

    server.stop().await;
    assert_eq!(server.process_state().await, ProcessState::Stopped);
}

#[tokio::test]
async fn test_nested_symbol_shape_is_flattened() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_three_functions(dir.path());

    let mut server = started(StubAdapter::new(&["--nested-symbols"]), dir.path()).await;
    let (symbols, raw) = server.request_document_symbols("module.py").await.unwrap();

    let names: Vec<&str> = symbols.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta", "gamma"]);

    // The raw form really was hierarchical (no `location` field)
    let first = &raw.as_array().unwrap()[0];
    assert!(first.get("location").is_none());
    assert!(first.get("selectionRange").is_some());

    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_requests_complete_independently() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.py"), "def alpha():\n    pass\n").unwrap();
    std::fs::write(dir.path().join("b.py"), "def beta():\n    pass\n").unwrap();

    let mut server = started(StubAdapter::new(&[]), dir.path()).await;

    let (a, b) = tokio::join!(
        server.request_document_symbols("a.py"),
        server.request_document_symbols("b.py")
    );

    let (a, _) = a.unwrap();
    let (b, _) = b.unwrap();
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].name, "alpha");
    assert_eq!(b.len(), 1);
    assert_eq!(b[0].name, "beta");

    server.stop().await;
}

#[tokio::test]
async fn test_timeout_resolves_and_session_stays_usable() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_three_functions(dir.path());

    let mut config = OrchestratorConfig::default();
    config.languages.insert(
        "python".to_string(),
        LanguageOverride {
            request_timeout_secs: Some(1),
            ..Default::default()
        },
    );

    let mut server = LanguageServer::with_adapter(
        StubAdapter::new(&[
            "--slow-on",
            "textDocument/documentSymbol",
            "--response-delay",
            "1500",
        ]),
        dir.path(),
    )
    .with_config(config);
    server.start().await.unwrap();

    let err = server.request_document_symbols("module.py").await.unwrap_err();
    assert!(matches!(err, Error::RequestTimeout { .. }), "{:?}", err);

    // Let the stub finish its delayed (now unwanted) response, then prove
    // the session still works
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let hover = server.request_hover("module.py", 0, 4).await.unwrap();
    assert!(hover.unwrap().contents.to_text().contains("alpha"));
    assert_eq!(server.session_state().await, Some(SessionState::Ready));

    server.stop().await;
}

#[tokio::test]
async fn test_server_error_surfaces_with_code() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_three_functions(dir.path());

    let mut server = started(
        StubAdapter::new(&["--fail-on", "textDocument/documentSymbol"]),
        dir.path(),
    )
    .await;

    let err = server.request_document_symbols("module.py").await.unwrap_err();
    match err {
        Error::RequestFailure { code, message } => {
            assert_eq!(code, -32603);
            assert!(message.contains("testls"));
        }
        other => panic!("expected RequestFailure, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_three_functions(dir.path());

    let mut server = started(StubAdapter::new(&[]), dir.path()).await;
    server.stop().await;
    assert!(!server.is_running());
    assert_eq!(server.process_state().await, ProcessState::Stopped);

    // Second stop is a no-op and raises nothing
    server.stop().await;
    assert_eq!(server.process_state().await, ProcessState::Stopped);

    // Requests after stop fail cleanly
    let err = server.request_document_symbols("module.py").await.unwrap_err();
    assert!(matches!(err, Error::NotReady(_)));
}

#[tokio::test]
async fn test_external_kill_resolves_inflight_call() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_three_functions(dir.path());

    let mut server = started(
        StubAdapter::new(&["--hang-on", "textDocument/documentSymbol"]),
        dir.path(),
    )
    .await;

    let pid = server.pid().await.unwrap();
    let request = server.request_document_symbols("module.py");
    let kill = async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
    };

    let (result, ()) = tokio::join!(request, kill);
    assert!(matches!(result.unwrap_err(), Error::ProcessCrashed));

    assert!(matches!(server.health().await, Some(ProcessHealth::Exited(_))));
    assert_eq!(server.process_state().await, ProcessState::Crashed);
    assert_eq!(server.session_state().await, Some(SessionState::Closed));

    server.stop().await;
}

#[tokio::test]
#[serial]
async fn test_second_server_for_same_root_is_rejected() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_three_functions(dir.path());

    let mut first = started(StubAdapter::new(&[]), dir.path()).await;

    let mut second = LanguageServer::with_adapter(StubAdapter::new(&[]), dir.path());
    let err = second.start().await.unwrap_err();
    assert!(matches!(err, Error::AlreadyRunning { .. }), "{:?}", err);

    // Stopping the first frees the (language, root) slot
    first.stop().await;
    second.start().await.unwrap();
    second.stop().await;
}

#[tokio::test]
async fn test_startup_failure_leaves_no_state_behind() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    struct MissingServerAdapter;
    impl LanguageAdapter for MissingServerAdapter {
        fn language(&self) -> Language {
            Language::Go
        }
        fn launch_command(&self, repository_root: &Path) -> ProcessCommand {
            ProcessCommand {
                program: "polyls-no-such-server".to_string(),
                args: Vec::new(),
                env: HashMap::new(),
                working_dir: repository_root.to_path_buf(),
            }
        }
        fn root_markers(&self) -> &'static [&'static str] {
            &["go.mod"]
        }
    }

    let mut server = LanguageServer::with_adapter(Box::new(MissingServerAdapter), dir.path());
    let err = server.start().await.unwrap_err();
    assert!(matches!(err, Error::Startup { .. }), "{:?}", err);
    assert!(!server.is_running());
    assert_eq!(server.process_state().await, ProcessState::NotStarted);

    // The guard was released: a retry fails the same way, not AlreadyRunning
    let err = server.start().await.unwrap_err();
    assert!(matches!(err, Error::Startup { .. }), "{:?}", err);
}

#[tokio::test]
async fn test_definition_and_references() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_three_functions(dir.path());

    let mut server = started(StubAdapter::new(&[]), dir.path()).await;

    // "alpha" is referenced on line 4 (`return alpha()`); its definition is
    // on line 0
    let definitions = server.request_definition("module.py", 4, 11).await.unwrap();
    assert_eq!(definitions.len(), 1);
    assert_eq!(definitions[0].range.start.line, 0);

    let references = server
        .request_references("module.py", 4, 11, true)
        .await
        .unwrap();
    assert!(references.len() >= 2, "{:?}", references);

    server.stop().await;
}

#[tokio::test]
async fn test_diagnostics_are_captured() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_three_functions(dir.path());

    let mut server = started(StubAdapter::new(&[]), dir.path()).await;
    server.request_document_symbols("module.py").await.unwrap();

    // The stub publishes diagnostics on didOpen; give the reader a moment
    let mut published = None;
    for _ in 0..40 {
        published = server.diagnostics("module.py");
        if published.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let diagnostics = published.expect("diagnostics never arrived");
    assert_eq!(diagnostics.as_array().unwrap().len(), 1);
    assert_eq!(diagnostics[0]["source"], "testls");

    server.stop().await;
}

#[tokio::test]
async fn test_response_translation_hook_is_applied() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_three_functions(dir.path());

    let mut server = started(Box::new(UppercasingAdapter), dir.path()).await;
    let (symbols, raw) = server.request_document_symbols("module.py").await.unwrap();

    let names: Vec<&str> = symbols.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["ALPHA", "BETA", "GAMMA"]);

    // The raw response is untouched by the hook
    assert_eq!(raw[0]["name"], "alpha");

    server.stop().await;
}

#[tokio::test]
#[serial]
async fn test_config_override_redirects_registry_adapter() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_three_functions(dir.path());

    // The registry adapter for Python launches pyright; the override points
    // it at the stub instead
    let mut config = OrchestratorConfig::default();
    config.languages.insert(
        "python".to_string(),
        LanguageOverride {
            command: Some(testls_path()),
            args: Some(Vec::new()),
            ..Default::default()
        },
    );

    let mut server = LanguageServer::new(Language::Python, dir.path()).with_config(config);
    server.start().await.unwrap();

    let (symbols, _) = server.request_document_symbols("module.py").await.unwrap();
    assert_eq!(symbols.len(), 3);

    server.stop().await;
}
