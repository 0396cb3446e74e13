//! Language registry
//!
//! The closed set of supported languages, their filename matching rules, and
//! adapter resolution. Pure data plus matching logic; no process state. The
//! set is fixed at compile time, so lookups are lock-free and side-effect
//! free.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::adapter::{
    GoAdapter, LanguageAdapter, PythonAdapter, RAdapter, RustAdapter, TypeScriptAdapter,
    ZigAdapter,
};
use crate::error::Error;

/// A supported language. New languages add a variant here and an adapter in
/// [`crate::adapter`]; nothing else branches on identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    R,
    Python,
    Go,
    Rust,
    TypeScript,
    Zig,
}

impl Language {
    pub const ALL: &'static [Language] = &[
        Language::R,
        Language::Python,
        Language::Go,
        Language::Rust,
        Language::TypeScript,
        Language::Zig,
    ];

    /// The lowercase identifier, also used as the LSP `languageId`.
    pub fn id(&self) -> &'static str {
        match self {
            Language::R => "r",
            Language::Python => "python",
            Language::Go => "go",
            Language::Rust => "rust",
            Language::TypeScript => "typescript",
            Language::Zig => "zig",
        }
    }

    /// Languages whose server integration has not been exercised broadly yet.
    pub fn is_experimental(&self) -> bool {
        matches!(self, Language::Zig)
    }

    /// Filename patterns considered relevant for this language. Matching is
    /// case-insensitive, so `*.r` also covers `.R`, `.Rmd` is covered by
    /// `*.rmd`, and so on.
    fn patterns(&self) -> &'static [&'static str] {
        match self {
            Language::R => &["*.r", "*.rmd", "*.rnw"],
            Language::Python => &["*.py", "*.pyi"],
            Language::Go => &["*.go"],
            Language::Rust => &["*.rs"],
            Language::TypeScript => &["*.ts", "*.tsx", "*.js", "*.jsx"],
            Language::Zig => &["*.zig"],
        }
    }

    /// Build the filename matcher for this language.
    pub fn matcher(&self) -> FilenameMatcher {
        FilenameMatcher::new(self.patterns())
    }

    /// Resolve the adapter for this language. The set is closed and
    /// exhaustive: every language maps to exactly one adapter.
    pub fn resolve(&self) -> Box<dyn LanguageAdapter> {
        match self {
            Language::R => Box::new(RAdapter),
            Language::Python => Box::new(PythonAdapter),
            Language::Go => Box::new(GoAdapter),
            Language::Rust => Box::new(RustAdapter),
            Language::TypeScript => Box::new(TypeScriptAdapter),
            Language::Zig => Box::new(ZigAdapter),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .iter()
            .copied()
            .find(|lang| lang.id() == s)
            .ok_or_else(|| Error::UnknownLanguage(s.to_string()))
    }
}

/// Decides filename relevance for one language by pattern match only; never
/// inspects file content or existence.
#[derive(Debug, Clone)]
pub struct FilenameMatcher {
    patterns: Vec<glob::Pattern>,
}

impl FilenameMatcher {
    fn new(patterns: &[&str]) -> Self {
        Self {
            // Patterns are static literals validated by the unit tests
            patterns: patterns
                .iter()
                .map(|p| glob::Pattern::new(p).expect("static pattern"))
                .collect(),
        }
    }

    /// Check whether a filename is relevant for this language. Only the
    /// final path component is considered.
    pub fn is_relevant_filename(&self, filename: &str) -> bool {
        let name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(filename);

        let options = glob::MatchOptions {
            case_sensitive: false,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };

        self.patterns
            .iter()
            .any(|p| p.matches_with(name, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("script.R", true)]
    #[case("analysis.r", true)]
    #[case("report.Rmd", true)]
    #[case("document.Rnw", true)]
    #[case("script.py", false)]
    #[case("main.go", false)]
    fn test_r_matcher(#[case] filename: &str, #[case] relevant: bool) {
        let matcher = Language::R.matcher();
        assert_eq!(matcher.is_relevant_filename(filename), relevant);
    }

    #[rstest]
    #[case("app.py", true)]
    #[case("types.pyi", true)]
    #[case("APP.PY", true)]
    #[case("script.R", false)]
    #[case("lib.rs", false)]
    fn test_python_matcher(#[case] filename: &str, #[case] relevant: bool) {
        let matcher = Language::Python.matcher();
        assert_eq!(matcher.is_relevant_filename(filename), relevant);
    }

    #[rstest]
    #[case(Language::Go, "main.go")]
    #[case(Language::Rust, "lib.rs")]
    #[case(Language::TypeScript, "index.tsx")]
    #[case(Language::Zig, "build.zig")]
    fn test_matcher_accepts_own_extension(#[case] lang: Language, #[case] filename: &str) {
        assert!(lang.matcher().is_relevant_filename(filename));
    }

    #[test]
    fn test_matcher_uses_final_path_component() {
        let matcher = Language::Python.matcher();
        assert!(matcher.is_relevant_filename("src/nested/module.py"));
        assert!(!matcher.is_relevant_filename("src/module.py/readme.txt"));
    }

    #[test]
    fn test_from_str_roundtrip() {
        for lang in Language::ALL {
            assert_eq!(Language::from_str(lang.id()).unwrap(), *lang);
            assert_eq!(lang.to_string(), lang.id());
        }
    }

    #[test]
    fn test_from_str_unknown_language() {
        let err = Language::from_str("cobol").unwrap_err();
        assert!(matches!(err, Error::UnknownLanguage(name) if name == "cobol"));
    }

    #[test]
    fn test_experimental_flags() {
        assert!(!Language::R.is_experimental());
        assert!(!Language::Python.is_experimental());
        assert!(Language::Zig.is_experimental());
    }

    #[test]
    fn test_every_language_resolves_to_its_adapter() {
        for lang in Language::ALL {
            let adapter = lang.resolve();
            assert_eq!(adapter.language(), *lang);
        }
    }
}
