//! Language server orchestration
//!
//! Spawn, supervise, and query LSP servers for many languages behind one
//! uniform interface. Callers pick a [`Language`], point a
//! [`LanguageServer`] at a repository root, and issue semantic requests in
//! terms of file paths; the crate handles process lifecycle, the JSON-RPC
//! wire protocol, request correlation, timeouts, and crash recovery.
//!
//! # Components
//!
//! - [`language`] - the closed language registry and filename matching
//! - [`adapter`] - per-language launch and initialization configuration
//! - [`process`] - subprocess supervision with stderr draining
//! - [`protocol`] - JSON-RPC envelopes and Content-Length framing
//! - [`session`] - request/response correlation over one server's stdio
//! - [`server`] - the caller-facing facade
//! - [`config`] - timeouts and per-language overrides
//!
//! # Example
//!
//! ```no_run
//! use polyls::{Language, LanguageServer};
//!
//! # async fn example() -> polyls::Result<()> {
//! let mut server = LanguageServer::new(Language::R, "/path/to/project");
//! server.start().await?;
//! let (symbols, _raw) = server.request_document_symbols("R/utils.R").await?;
//! for symbol in &symbols {
//!     println!("{} ({})", symbol.name, symbol.kind.as_str());
//! }
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod document;
pub mod error;
pub mod language;
pub mod process;
pub mod protocol;
pub mod server;
pub mod session;
pub mod types;

pub use adapter::LanguageAdapter;
pub use config::{LanguageOverride, OrchestratorConfig};
pub use error::{Error, Result};
pub use language::{FilenameMatcher, Language};
pub use process::{ProcessCommand, ProcessHealth, ProcessState};
pub use server::LanguageServer;
pub use session::SessionState;
pub use types::{DocumentSymbol, Location, Position, Range, SymbolInformation, SymbolKind};
