//! LSP type definitions
//!
//! Core types used in Language Server Protocol communication. Only the
//! subset of the protocol this crate speaks is modeled; everything else
//! travels as raw `serde_json::Value`.

use serde::{Deserialize, Serialize};

/// A position in a text document (0-indexed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Line number (0-indexed)
    pub line: u32,
    /// Character offset in the line (0-indexed)
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// A range in a text document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    /// Start position (inclusive)
    pub start: Position,
    /// End position (exclusive)
    pub end: Position,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

/// A location in a document (URI + range)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Document URI (file:// scheme)
    pub uri: String,
    /// Range within the document
    pub range: Range,
}

impl Location {
    /// Get the file path from the URI
    pub fn file_path(&self) -> &str {
        self.uri.strip_prefix("file://").unwrap_or(&self.uri)
    }
}

/// Symbol kinds in LSP (integers per the protocol's taxonomy)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde_repr::Serialize_repr, serde_repr::Deserialize_repr,
)]
#[repr(u8)]
pub enum SymbolKind {
    File = 1,
    Module = 2,
    Namespace = 3,
    Package = 4,
    Class = 5,
    Method = 6,
    Property = 7,
    Field = 8,
    Constructor = 9,
    Enum = 10,
    Interface = 11,
    Function = 12,
    Variable = 13,
    Constant = 14,
    String = 15,
    Number = 16,
    Boolean = 17,
    Array = 18,
    Object = 19,
    Key = 20,
    Null = 21,
    EnumMember = 22,
    Struct = 23,
    Event = 24,
    Operator = 25,
    TypeParameter = 26,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::File => "file",
            SymbolKind::Module => "module",
            SymbolKind::Namespace => "namespace",
            SymbolKind::Package => "package",
            SymbolKind::Class => "class",
            SymbolKind::Method => "method",
            SymbolKind::Property => "property",
            SymbolKind::Field => "field",
            SymbolKind::Constructor => "constructor",
            SymbolKind::Enum => "enum",
            SymbolKind::Interface => "interface",
            SymbolKind::Function => "function",
            SymbolKind::Variable => "variable",
            SymbolKind::Constant => "constant",
            SymbolKind::String => "string",
            SymbolKind::Number => "number",
            SymbolKind::Boolean => "boolean",
            SymbolKind::Array => "array",
            SymbolKind::Object => "object",
            SymbolKind::Key => "key",
            SymbolKind::Null => "null",
            SymbolKind::EnumMember => "enum_member",
            SymbolKind::Struct => "struct",
            SymbolKind::Event => "event",
            SymbolKind::Operator => "operator",
            SymbolKind::TypeParameter => "type_parameter",
        }
    }
}

/// Flat symbol information, the normalized result shape for symbol requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInformation {
    pub name: String,
    pub kind: SymbolKind,
    pub location: Location,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
}

/// Hierarchical document symbol, as returned by servers that support
/// `hierarchicalDocumentSymbolSupport`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSymbol {
    pub name: String,
    pub kind: SymbolKind,
    pub range: Range,
    pub selection_range: Range,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DocumentSymbol>,
}

/// Hover information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hover {
    pub contents: HoverContents,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
}

/// Hover content variants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HoverContents {
    Scalar(String),
    MarkedString(MarkedString),
    Array(Vec<MarkedString>),
    Markup(MarkupContent),
}

impl HoverContents {
    /// Extract plain text content from hover
    pub fn to_text(&self) -> String {
        match self {
            HoverContents::Scalar(s) => s.clone(),
            HoverContents::MarkedString(m) => m.value.clone(),
            HoverContents::Array(arr) => arr
                .iter()
                .map(|m| m.value.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
            HoverContents::Markup(m) => m.value.clone(),
        }
    }
}

/// Marked string (language + code)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkedString {
    pub language: String,
    pub value: String,
}

/// Markup content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkupContent {
    pub kind: String,
    pub value: String,
}

/// Server capabilities, as announced in the initialize response.
///
/// Servers disagree on the shape of provider fields (a bare `true` vs. an
/// options object), so they are kept as raw values with a truthiness check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition_provider: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references_provider: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hover_provider: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_symbol_provider: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_symbol_provider: Option<serde_json::Value>,
}

impl ServerCapabilities {
    fn provides(field: &Option<serde_json::Value>) -> bool {
        match field {
            None => false,
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::Null) => false,
            // An options object counts as support
            Some(_) => true,
        }
    }

    pub fn supports_document_symbols(&self) -> bool {
        Self::provides(&self.document_symbol_provider)
    }

    pub fn supports_definition(&self) -> bool {
        Self::provides(&self.definition_provider)
    }

    pub fn supports_references(&self) -> bool {
        Self::provides(&self.references_provider)
    }

    pub fn supports_hover(&self) -> bool {
        Self::provides(&self.hover_provider)
    }
}

/// Initialize result from server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
}

/// Server info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Incoming request from server (has id, expects a response from us)
#[derive(Debug, Clone, Deserialize)]
pub struct ServerRequest {
    pub id: serde_json::Value, // Can be number or string
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

/// Incoming notification from server (no id)
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingNotification {
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}
