//! Configurable stub language server for integration tests
//!
//! Speaks Content-Length framed JSON-RPC over stdin/stdout. Symbols are
//! extracted from opened documents with line-based heuristics covering the
//! definition syntax of the supported languages (`def`, `fn`, `function`,
//! `class`, and R's `name <- function`). CLI flags inject failure modes:
//! hanging, erroring, delayed responses, and mid-session crashes.
//!
//! Deliberately synchronous: a stub has no need for a runtime.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(name = "testls")]
#[command(about = "Stub LSP server for integration tests", long_about = None)]
struct Args {
    /// Never respond to this method (repeatable)
    #[arg(long)]
    hang_on: Vec<String>,

    /// Respond with an internal error for this method (repeatable)
    #[arg(long)]
    fail_on: Vec<String>,

    /// Apply --response-delay only to this method (repeatable; empty means
    /// all methods)
    #[arg(long)]
    slow_on: Vec<String>,

    /// Sleep before responding (milliseconds)
    #[arg(long, default_value_t = 0)]
    response_delay: u64,

    /// Exit with status 1 after this many responses (crash simulation)
    #[arg(long)]
    exit_after: Option<u64>,

    /// Return hierarchical DocumentSymbol[] instead of flat
    /// SymbolInformation[]
    #[arg(long)]
    nested_symbols: bool,
}

struct StubServer {
    args: Args,
    documents: HashMap<String, String>,
    responses_sent: u64,
}

fn main() {
    let args = Args::parse();
    let mut server = StubServer {
        args,
        documents: HashMap::new(),
        responses_sent: 0,
    };
    server.run();
}

impl StubServer {
    fn run(&mut self) {
        let mut stdin = std::io::stdin().lock();
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];

        loop {
            match stdin.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            }

            while let Some((message, consumed)) = next_frame(&buffer) {
                buffer.drain(..consumed);
                if let Ok(value) = serde_json::from_str::<Value>(&message) {
                    self.handle(value);
                }
            }
        }
    }

    fn handle(&mut self, message: Value) {
        let Some(method) = message.get("method").and_then(Value::as_str).map(String::from) else {
            return;
        };

        match message.get("id") {
            Some(id) if !id.is_null() => self.handle_request(&method, id.clone(), &message),
            _ => self.handle_notification(&method, &message),
        }
    }

    fn handle_request(&mut self, method: &str, id: Value, message: &Value) {
        if self.args.hang_on.iter().any(|m| m == method) {
            return;
        }

        if self.args.response_delay > 0
            && (self.args.slow_on.is_empty() || self.args.slow_on.iter().any(|m| m == method))
        {
            std::thread::sleep(Duration::from_millis(self.args.response_delay));
        }

        if self.args.fail_on.iter().any(|m| m == method) {
            self.send(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32603, "message": format!("testls: configured to fail on {method}") }
            }));
            return;
        }

        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let result = match method {
            "initialize" => json!({
                "capabilities": {
                    "documentSymbolProvider": true,
                    "definitionProvider": true,
                    "referencesProvider": true,
                    "hoverProvider": true,
                    "textDocumentSync": { "openClose": true, "change": 1 }
                },
                "serverInfo": { "name": "testls", "version": env!("CARGO_PKG_VERSION") }
            }),
            "shutdown" => Value::Null,
            "textDocument/documentSymbol" => self.document_symbols(&params),
            "textDocument/definition" => self.definition(&params),
            "textDocument/references" => self.references(&params),
            "textDocument/hover" => self.hover(&params),
            _ => {
                self.send(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": format!("testls: method not found: {method}") }
                }));
                return;
            }
        };

        self.send(json!({ "jsonrpc": "2.0", "id": id, "result": result }));
    }

    fn handle_notification(&mut self, method: &str, message: &Value) {
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        match method {
            "textDocument/didOpen" => {
                let td = &params["textDocument"];
                if let (Some(uri), Some(text)) = (td["uri"].as_str(), td["text"].as_str()) {
                    self.documents.insert(uri.to_string(), text.to_string());
                    self.publish_diagnostics(uri);
                }
            }
            "textDocument/didChange" => {
                if let Some(uri) = params["textDocument"]["uri"].as_str() {
                    if let Some(text) = params["contentChanges"]
                        .as_array()
                        .and_then(|changes| changes.last())
                        .and_then(|change| change["text"].as_str())
                    {
                        self.documents.insert(uri.to_string(), text.to_string());
                    }
                }
            }
            "textDocument/didClose" => {
                if let Some(uri) = params["textDocument"]["uri"].as_str() {
                    self.documents.remove(uri);
                }
            }
            "exit" => std::process::exit(0),
            _ => {}
        }
    }

    fn document_symbols(&self, params: &Value) -> Value {
        let Some(uri) = params["textDocument"]["uri"].as_str() else {
            return Value::Null;
        };
        let Some(content) = self.documents.get(uri) else {
            return Value::Null;
        };

        let symbols = scan_symbols(content);
        if self.args.nested_symbols {
            Value::Array(symbols.iter().map(|s| s.to_document_symbol()).collect())
        } else {
            Value::Array(
                symbols
                    .iter()
                    .map(|s| s.to_symbol_information(uri))
                    .collect(),
            )
        }
    }

    fn definition(&self, params: &Value) -> Value {
        let Some((uri, content, word)) = self.word_at(params) else {
            return Value::Null;
        };
        for (line_idx, line) in content.lines().enumerate() {
            if is_definition_line(line, &word) {
                if let Some(col) = line.find(&word) {
                    return location(uri, line_idx, col, col + word.len());
                }
            }
        }
        Value::Null
    }

    fn references(&self, params: &Value) -> Value {
        let Some((uri, content, word)) = self.word_at(params) else {
            return Value::Null;
        };
        let mut locations = Vec::new();
        for (line_idx, line) in content.lines().enumerate() {
            let mut start = 0;
            while let Some(pos) = line[start..].find(&word) {
                let col = start + pos;
                locations.push(location(uri, line_idx, col, col + word.len()));
                start = col + word.len();
            }
        }
        Value::Array(locations)
    }

    fn hover(&self, params: &Value) -> Value {
        match self.word_at(params) {
            Some((_, _, word)) => json!({
                "contents": { "kind": "markdown", "value": format!("```\n{word}\n```") }
            }),
            None => Value::Null,
        }
    }

    fn word_at<'a>(&'a self, params: &Value) -> Option<(&'a str, &'a str, String)> {
        let uri = params["textDocument"]["uri"].as_str()?;
        let (uri, content) = self.documents.get_key_value(uri)?;
        let line = params["position"]["line"].as_u64()? as usize;
        let character = params["position"]["character"].as_u64()? as usize;

        let line_text = content.lines().nth(line)?;
        let bytes = line_text.as_bytes();
        if character >= bytes.len() {
            return None;
        }

        let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_' || b == b'.';
        let start = (0..=character)
            .rev()
            .find(|&i| !is_word(bytes[i]))
            .map_or(0, |i| i + 1);
        let end = (character..bytes.len())
            .find(|&i| !is_word(bytes[i]))
            .unwrap_or(bytes.len());
        if start >= end {
            return None;
        }
        Some((uri.as_str(), content.as_str(), line_text[start..end].to_string()))
    }

    fn publish_diagnostics(&mut self, uri: &str) {
        let uri = uri.to_string();
        self.send(json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {
                "uri": uri,
                "diagnostics": [{
                    "range": {
                        "start": { "line": 0, "character": 0 },
                        "end": { "line": 0, "character": 1 }
                    },
                    "severity": 3,
                    "source": "testls",
                    "message": "testls: stub diagnostic"
                }]
            }
        }));
    }

    fn send(&mut self, message: Value) {
        let body = message.to_string();
        let mut stdout = std::io::stdout().lock();
        let _ = write!(stdout, "Content-Length: {}\r\n\r\n{}", body.len(), body);
        let _ = stdout.flush();

        if message.get("id").is_some() {
            self.responses_sent += 1;
            if let Some(max) = self.args.exit_after {
                if self.responses_sent >= max {
                    std::process::exit(1);
                }
            }
        }
    }
}

/// One extracted symbol definition.
struct ScannedSymbol {
    name: String,
    kind: u8,
    line: usize,
    col: usize,
}

impl ScannedSymbol {
    fn range(&self) -> Value {
        json!({
            "start": { "line": self.line, "character": self.col },
            "end": { "line": self.line, "character": self.col + self.name.len() }
        })
    }

    fn to_symbol_information(&self, uri: &str) -> Value {
        json!({
            "name": self.name,
            "kind": self.kind,
            "location": { "uri": uri, "range": self.range() }
        })
    }

    fn to_document_symbol(&self) -> Value {
        json!({
            "name": self.name,
            "kind": self.kind,
            "range": self.range(),
            "selectionRange": self.range(),
            "children": []
        })
    }
}

/// Scan a document for definition lines, in document order.
fn scan_symbols(content: &str) -> Vec<ScannedSymbol> {
    let mut symbols = Vec::new();

    for (line_idx, line) in content.lines().enumerate() {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();

        let keyword_forms: [(&str, u8); 4] =
            [("def ", 12), ("fn ", 12), ("function ", 12), ("class ", 5)];

        let mut found = None;
        for (prefix, kind) in keyword_forms {
            if let Some(rest) = trimmed.strip_prefix(prefix) {
                let name = leading_identifier(rest);
                if !name.is_empty() {
                    found = Some(ScannedSymbol {
                        col: indent + prefix.len(),
                        name,
                        kind,
                        line: line_idx,
                    });
                }
                break;
            }
        }

        // R style: name <- function(...)
        if found.is_none() {
            let name = leading_identifier(trimmed);
            if !name.is_empty() {
                let after = trimmed[name.len()..].trim_start();
                if after.starts_with("<-") && after[2..].trim_start().starts_with("function") {
                    found = Some(ScannedSymbol {
                        name,
                        kind: 12,
                        line: line_idx,
                        col: indent,
                    });
                }
            }
        }

        if let Some(symbol) = found {
            symbols.push(symbol);
        }
    }

    symbols
}

fn leading_identifier(text: &str) -> String {
    text.chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '.')
        .collect()
}

/// Does this line define `word` in any of the recognized forms?
fn is_definition_line(line: &str, word: &str) -> bool {
    let trimmed = line.trim_start();
    for prefix in ["def ", "fn ", "function ", "class "] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            return leading_identifier(rest) == word;
        }
    }
    leading_identifier(trimmed) == word && trimmed[word.len()..].trim_start().starts_with("<-")
}

fn location(uri: &str, line: usize, start: usize, end: usize) -> Value {
    json!({
        "uri": uri,
        "range": {
            "start": { "line": line, "character": start },
            "end": { "line": line, "character": end }
        }
    })
}

/// Parse one Content-Length framed message out of the buffer, returning the
/// body and the number of bytes consumed.
fn next_frame(buffer: &[u8]) -> Option<(String, usize)> {
    let header_end = buffer.windows(4).position(|w| w == b"\r\n\r\n")?;
    let headers = std::str::from_utf8(&buffer[..header_end]).ok()?;

    let content_length: usize = headers
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split_once(':'))
        .and_then(|(_, v)| v.trim().parse().ok())?;

    let total = header_end + 4 + content_length;
    if buffer.len() < total {
        return None;
    }

    let body = std::str::from_utf8(&buffer[header_end + 4..total]).ok()?;
    Some((body.to_string(), total))
}
