use serde::Serialize;

use crate::policy::lexer::{Token, TokenKind};

/// Why a job was refused. Ordered the way the default rule table runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Touches the controller's persistent memory (EEPROM)
    ForbiddenMemoryWrite,
    /// Loads any module other than the whitelisted one
    UnapprovedModuleImport,
    /// Reaches for an HTTP/socket client
    ForbiddenNetworkCapability,
    /// Builds code from strings at runtime
    ForbiddenDynamicEvaluation,
    /// Uses `[` / `]` anywhere
    ForbiddenIndexingSyntax,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::ForbiddenMemoryWrite => write!(f, "forbidden_memory_write"),
            RejectReason::UnapprovedModuleImport => write!(f, "unapproved_module_import"),
            RejectReason::ForbiddenNetworkCapability => write!(f, "forbidden_network_capability"),
            RejectReason::ForbiddenDynamicEvaluation => write!(f, "forbidden_dynamic_evaluation"),
            RejectReason::ForbiddenIndexingSyntax => write!(f, "forbidden_indexing_syntax"),
        }
    }
}

/// How a rule looks at the source.
///
/// `Substring` works on the raw text, so it also fires inside comments and
/// string literals. The token-based matchers only see code (plus string
/// literals where noted), and exist to catch spellings a substring cannot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Case-sensitive containment anywhere in the raw text
    Substring(String),
    /// An identifier in code, or a string literal whose whole content is the name
    Identifier(String),
    /// `name(` followed directly by a string or template literal
    StringCallback(String),
    /// Any `require` left after removing the whitelisted `require('<module>')`
    ForeignImport { allowed_module: String },
    /// The `import` keyword in code (static or dynamic import)
    ImportKeyword,
    /// A backslash outside literals, i.e. a unicode-escaped identifier
    EscapedIdentifier,
    /// A `/` that may open a regular expression hiding a quote from the lexer
    AmbiguousSlash,
}

/// Where a matcher fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub pattern: String,
    pub line: Option<usize>,
}

fn line_of(source: &str, byte_idx: usize) -> usize {
    source[..byte_idx].matches('\n').count() + 1
}

impl Matcher {
    pub fn find(&self, source: &str, tokens: &[Token<'_>]) -> Option<Match> {
        match self {
            Matcher::Substring(needle) => source.find(needle.as_str()).map(|idx| Match {
                pattern: needle.clone(),
                line: Some(line_of(source, idx)),
            }),
            Matcher::Identifier(name) => tokens
                .iter()
                .find(|t| {
                    matches!(t.kind, TokenKind::Ident | TokenKind::Str) && t.text == name
                })
                .map(|t| Match {
                    pattern: name.clone(),
                    line: Some(t.line),
                }),
            Matcher::StringCallback(name) => tokens
                .windows(3)
                .find(|w| {
                    w[0].kind == TokenKind::Ident
                        && w[0].text == name
                        && w[1].text == "("
                        && matches!(w[2].kind, TokenKind::Str | TokenKind::Template)
                })
                .map(|w| Match {
                    pattern: format!("{}(<string>)", name),
                    line: Some(w[0].line),
                }),
            Matcher::ForeignImport { allowed_module } => {
                // Removing the allowed forms keeps every newline, so line
                // numbers in `stripped` still match the original text.
                let stripped = source
                    .replace(&format!("require('{}')", allowed_module), "")
                    .replace(&format!("require(\"{}\")", allowed_module), "");
                stripped.find("require").map(|idx| Match {
                    pattern: "require".to_string(),
                    line: Some(line_of(&stripped, idx)),
                })
            }
            Matcher::ImportKeyword => tokens
                .iter()
                .find(|t| t.kind == TokenKind::Ident && t.text == "import")
                .map(|t| Match {
                    pattern: "import".to_string(),
                    line: Some(t.line),
                }),
            Matcher::EscapedIdentifier => tokens
                .iter()
                .find(|t| t.kind == TokenKind::Punct && t.text == "\\")
                .map(|t| Match {
                    pattern: "\\".to_string(),
                    line: Some(t.line),
                }),
            Matcher::AmbiguousSlash => tokens
                .iter()
                .find(|t| t.kind == TokenKind::AmbiguousSlash)
                .map(|t| Match {
                    pattern: format!("/{}/", t.text),
                    line: Some(t.line),
                }),
        }
    }
}

/// One row of the admission policy: a matcher and the reason it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub reason: RejectReason,
    pub matcher: Matcher,
    pub description: String,
}

impl Rule {
    pub fn new(reason: RejectReason, matcher: Matcher, description: impl Into<String>) -> Self {
        Self {
            reason,
            matcher,
            description: description.into(),
        }
    }

    pub fn substring(reason: RejectReason, needle: &str, description: &str) -> Self {
        Self::new(reason, Matcher::Substring(needle.to_string()), description)
    }

    pub fn identifier(reason: RejectReason, name: &str, description: &str) -> Self {
        Self::new(reason, Matcher::Identifier(name.to_string()), description)
    }
}

/// The built-in rule table, in evaluation order.
pub fn default_rules(allowed_module: &str) -> Vec<Rule> {
    use RejectReason::*;

    vec![
        Rule::substring(
            ForbiddenMemoryWrite,
            "EEPROM",
            "Writes to persistent controller memory",
        ),
        Rule::new(
            UnapprovedModuleImport,
            Matcher::ForeignImport {
                allowed_module: allowed_module.to_string(),
            },
            format!("Requires a module other than '{}'", allowed_module),
        ),
        Rule::new(
            UnapprovedModuleImport,
            Matcher::ImportKeyword,
            "Uses ES module import syntax",
        ),
        Rule::substring(
            ForbiddenNetworkCapability,
            "request",
            "References an HTTP request API",
        ),
        Rule::substring(
            ForbiddenNetworkCapability,
            "Request",
            "References an HTTP request API",
        ),
        Rule::substring(ForbiddenNetworkCapability, "http", "References an HTTP client"),
        Rule::substring(ForbiddenNetworkCapability, "Http", "References an HTTP client"),
        Rule::substring(
            ForbiddenNetworkCapability,
            "WebSocket",
            "Opens a WebSocket",
        ),
        Rule::identifier(ForbiddenNetworkCapability, "fetch", "Calls fetch()"),
        Rule::identifier(ForbiddenNetworkCapability, "net", "References raw TCP sockets"),
        Rule::identifier(ForbiddenNetworkCapability, "dgram", "References raw UDP sockets"),
        Rule::substring(ForbiddenDynamicEvaluation, "eval", "Dynamic code evaluation"),
        Rule::identifier(
            ForbiddenDynamicEvaluation,
            "Function",
            "Function constructor builds code from strings",
        ),
        Rule::identifier(
            ForbiddenDynamicEvaluation,
            "constructor",
            "Reaches the Function constructor through a prototype",
        ),
        Rule::new(
            ForbiddenDynamicEvaluation,
            Matcher::StringCallback("setTimeout".to_string()),
            "setTimeout with a code string",
        ),
        Rule::new(
            ForbiddenDynamicEvaluation,
            Matcher::StringCallback("setInterval".to_string()),
            "setInterval with a code string",
        ),
        Rule::new(
            ForbiddenDynamicEvaluation,
            Matcher::EscapedIdentifier,
            "Unicode-escaped identifier hides a name from the filter",
        ),
        Rule::new(
            ForbiddenDynamicEvaluation,
            Matcher::AmbiguousSlash,
            "Regular expression or division could hide code behind a quote",
        ),
        Rule::substring(ForbiddenIndexingSyntax, "[", "Bracket syntax"),
        Rule::substring(ForbiddenIndexingSyntax, "]", "Bracket syntax"),
    ]
}
