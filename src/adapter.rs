//! Per-language server adapters
//!
//! One adapter per supported language: launch command, workspace root
//! markers, initialization options, and optional request/response
//! translation hooks for servers with non-standard extensions. Adapters are
//! fixed configuration; selection happens once, at facade construction.

use std::path::Path;

use crate::language::Language;
use crate::process::ProcessCommand;

/// Uniform capability set implemented by every language adapter.
pub trait LanguageAdapter: Send + Sync {
    /// The language this adapter serves.
    fn language(&self) -> Language;

    /// The LSP `languageId` sent in `textDocument/didOpen`.
    fn language_id(&self) -> &'static str {
        self.language().id()
    }

    /// Command used to launch the server for a repository root.
    fn launch_command(&self, repository_root: &Path) -> ProcessCommand;

    /// Marker files identifying a workspace root for this language.
    fn root_markers(&self) -> &'static [&'static str];

    /// Options passed in the `initializationOptions` field of `initialize`.
    fn initialization_options(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Hook for servers needing request parameters rewritten. Identity by
    /// default.
    fn translate_request(
        &self,
        _method: &str,
        params: Option<serde_json::Value>,
    ) -> Option<serde_json::Value> {
        params
    }

    /// Hook for servers whose responses need massaging before
    /// normalization. Identity by default.
    fn translate_response(&self, _method: &str, result: serde_json::Value) -> serde_json::Value {
        result
    }
}

fn command(program: &str, args: &[&str], root: &Path) -> ProcessCommand {
    ProcessCommand {
        program: program.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        env: Default::default(),
        working_dir: root.to_path_buf(),
    }
}

/// R via the `languageserver` package, run through the R interpreter.
pub struct RAdapter;

impl LanguageAdapter for RAdapter {
    fn language(&self) -> Language {
        Language::R
    }

    fn launch_command(&self, repository_root: &Path) -> ProcessCommand {
        command(
            "R",
            &["--slave", "-e", "languageserver::run()"],
            repository_root,
        )
    }

    fn root_markers(&self) -> &'static [&'static str] {
        &["DESCRIPTION", ".Rprofile"]
    }

    fn initialization_options(&self) -> serde_json::Value {
        // Markdown hover docs slow the server down considerably on large
        // packages; plain text is enough for symbol-level work.
        serde_json::json!({ "rich_documentation": false })
    }
}

/// Python via pyright.
pub struct PythonAdapter;

impl LanguageAdapter for PythonAdapter {
    fn language(&self) -> Language {
        Language::Python
    }

    fn launch_command(&self, repository_root: &Path) -> ProcessCommand {
        command("pyright-langserver", &["--stdio"], repository_root)
    }

    fn root_markers(&self) -> &'static [&'static str] {
        &[
            "pyproject.toml",
            "setup.py",
            "requirements.txt",
            "pyrightconfig.json",
        ]
    }
}

/// Go via gopls.
pub struct GoAdapter;

impl LanguageAdapter for GoAdapter {
    fn language(&self) -> Language {
        Language::Go
    }

    fn launch_command(&self, repository_root: &Path) -> ProcessCommand {
        command("gopls", &[], repository_root)
    }

    fn root_markers(&self) -> &'static [&'static str] {
        &["go.mod", "go.work"]
    }
}

/// Rust via rust-analyzer.
pub struct RustAdapter;

impl LanguageAdapter for RustAdapter {
    fn language(&self) -> Language {
        Language::Rust
    }

    fn launch_command(&self, repository_root: &Path) -> ProcessCommand {
        command("rust-analyzer", &[], repository_root)
    }

    fn root_markers(&self) -> &'static [&'static str] {
        &["Cargo.toml"]
    }
}

/// TypeScript/JavaScript via typescript-language-server.
pub struct TypeScriptAdapter;

impl LanguageAdapter for TypeScriptAdapter {
    fn language(&self) -> Language {
        Language::TypeScript
    }

    fn launch_command(&self, repository_root: &Path) -> ProcessCommand {
        command("typescript-language-server", &["--stdio"], repository_root)
    }

    fn root_markers(&self) -> &'static [&'static str] {
        &["package.json", "tsconfig.json", "jsconfig.json"]
    }

    fn initialization_options(&self) -> serde_json::Value {
        serde_json::json!({ "hostInfo": "polyls" })
    }
}

/// Zig via zls. Experimental.
pub struct ZigAdapter;

impl LanguageAdapter for ZigAdapter {
    fn language(&self) -> Language {
        Language::Zig
    }

    fn launch_command(&self, repository_root: &Path) -> ProcessCommand {
        command("zls", &[], repository_root)
    }

    fn root_markers(&self) -> &'static [&'static str] {
        &["build.zig"]
    }
}
