//! A small JavaScript tokenizer.
//!
//! It only needs to tell code apart from comments and string literals so the
//! syntax-aware rules can look at identifiers and call sites. It never fails:
//! unterminated strings and comments run to the end of the line or input.
//!
//! A `/` is read as division or as the start of a regular expression from the
//! token before it. Regex bodies are lexed as code as well, so a wrong guess
//! can only add tokens. After `)` or `}` either reading is possible; if the
//! regex reading would hide a quote, the span is reported as
//! [`TokenKind::AmbiguousSlash`] and lexing continues with the division
//! reading.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    /// Body of a `'...'` or `"..."` literal, quotes excluded
    Str,
    /// Body of a `` `...` `` literal; its contents are also lexed as code
    Template,
    Number,
    /// Body of a `/.../` literal, slashes and flags excluded
    Regex,
    /// Span after a `/` that is a regex holding a quote, or a division
    AmbiguousSlash,
    Punct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// 1-based line the token starts on
    pub line: usize,
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    is_ident_start(c) || c.is_alphanumeric()
}

/// Keywords after which an expression, and so a regex, starts.
const EXPRESSION_KEYWORDS: &[&str] = &[
    "return",
    "typeof",
    "instanceof",
    "in",
    "of",
    "new",
    "delete",
    "void",
    "throw",
    "case",
    "do",
    "else",
    "yield",
    "await",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlashContext {
    Division,
    Regex,
    Either,
}

fn slash_context(prev: Option<&Token<'_>>) -> SlashContext {
    let Some(prev) = prev else {
        return SlashContext::Regex;
    };
    match prev.kind {
        TokenKind::Ident if EXPRESSION_KEYWORDS.contains(&prev.text) => SlashContext::Regex,
        TokenKind::Ident
        | TokenKind::Number
        | TokenKind::Str
        | TokenKind::Template
        | TokenKind::Regex => SlashContext::Division,
        TokenKind::Punct => match prev.text {
            "]" => SlashContext::Division,
            ")" | "}" => SlashContext::Either,
            _ => SlashContext::Regex,
        },
        TokenKind::AmbiguousSlash => SlashContext::Regex,
    }
}

/// Length of a regex body starting right after its opening `/`, if the
/// literal closes on the same line.
fn regex_body_len(rest: &str) -> Option<usize> {
    let mut in_class = false;
    let mut chars = rest.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            '\n' | '\r' => return None,
            '\\' => {
                if matches!(chars.next(), None | Some((_, '\n' | '\r'))) {
                    return None;
                }
            }
            '[' => in_class = true,
            ']' => in_class = false,
            '/' if !in_class => return Some(idx),
            _ => {}
        }
    }
    None
}

/// Tokens of a regex body. Backslashes are regex escapes there, except
/// before `u` where they may also spell an escaped identifier.
fn regex_body_tokens(body: &str, line: usize) -> Vec<Token<'_>> {
    let inner = tokenize(body);
    inner
        .iter()
        .enumerate()
        .filter(|(i, t)| {
            !(t.kind == TokenKind::Punct
                && t.text == "\\"
                && !inner
                    .get(i + 1)
                    .is_some_and(|next| next.kind == TokenKind::Ident && next.text.starts_with('u')))
        })
        .map(|(_, t)| Token { line, ..*t })
        .collect()
}

pub fn tokenize(source: &str) -> Vec<Token<'_>> {
    let mut tokens: Vec<Token<'_>> = Vec::new();
    let mut chars = source.char_indices().peekable();
    let mut line = 1;
    // Index of the last token lexed at this level, not inside a literal.
    let mut last: Option<usize> = None;

    while let Some((start, c)) = chars.next() {
        let before = tokens.len();
        match c {
            '\n' => line += 1,
            c if c.is_whitespace() => {}
            '/' if matches!(chars.peek(), Some((_, '/'))) => {
                while let Some(&(_, next)) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                let mut prev = '\0';
                for (_, next) in chars.by_ref() {
                    if next == '\n' {
                        line += 1;
                    }
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            '/' => {
                let rest = &source[start + 1..];
                let context = slash_context(last.map(|i| &tokens[i]));
                match (context, regex_body_len(rest)) {
                    (SlashContext::Regex, Some(len)) => {
                        let body = &rest[..len];
                        tokens.push(Token {
                            kind: TokenKind::Regex,
                            text: body,
                            line,
                        });
                        tokens.extend(regex_body_tokens(body, line));
                        let close = start + 1 + len;
                        while let Some(&(idx, next)) = chars.peek() {
                            if idx > close && !is_ident_continue(next) {
                                break;
                            }
                            chars.next();
                        }
                    }
                    (SlashContext::Either, Some(len))
                        if rest[..len].contains(['\'', '"', '`']) =>
                    {
                        tokens.push(Token {
                            kind: TokenKind::AmbiguousSlash,
                            text: &rest[..len],
                            line,
                        });
                        tokens.push(Token {
                            kind: TokenKind::Punct,
                            text: "/",
                            line,
                        });
                    }
                    _ => tokens.push(Token {
                        kind: TokenKind::Punct,
                        text: "/",
                        line,
                    }),
                }
            }
            '\'' | '"' => {
                let start_line = line;
                let mut end = source.len();
                while let Some((idx, next)) = chars.next() {
                    match next {
                        '\\' => {
                            if let Some((_, '\n')) = chars.next() {
                                line += 1;
                            }
                        }
                        '\n' => {
                            end = idx;
                            line += 1;
                            break;
                        }
                        n if n == c => {
                            end = idx;
                            break;
                        }
                        _ => {}
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Str,
                    text: &source[start + 1..end],
                    line: start_line,
                });
            }
            '`' => {
                let start_line = line;
                let mut end = source.len();
                while let Some((idx, next)) = chars.next() {
                    match next {
                        '\\' => {
                            if let Some((_, '\n')) = chars.next() {
                                line += 1;
                            }
                        }
                        '\n' => line += 1,
                        '`' => {
                            end = idx;
                            break;
                        }
                        _ => {}
                    }
                }
                let body = &source[start + 1..end];
                tokens.push(Token {
                    kind: TokenKind::Template,
                    text: body,
                    line: start_line,
                });
                // `${...}` can run arbitrary code, so everything inside counts.
                tokens.extend(tokenize(body).into_iter().map(|t| Token {
                    line: start_line + t.line - 1,
                    ..t
                }));
            }
            c if is_ident_start(c) => {
                let mut end = start + c.len_utf8();
                while let Some(&(idx, next)) = chars.peek() {
                    if !is_ident_continue(next) {
                        break;
                    }
                    end = idx + next.len_utf8();
                    chars.next();
                }
                tokens.push(Token {
                    kind: TokenKind::Ident,
                    text: &source[start..end],
                    line,
                });
            }
            c if c.is_ascii_digit() => {
                let mut end = start + 1;
                while let Some(&(idx, next)) = chars.peek() {
                    if !(next.is_ascii_alphanumeric() || next == '.' || next == '_') {
                        break;
                    }
                    end = idx + next.len_utf8();
                    chars.next();
                }
                tokens.push(Token {
                    kind: TokenKind::Number,
                    text: &source[start..end],
                    line,
                });
            }
            _ => tokens.push(Token {
                kind: TokenKind::Punct,
                text: &source[start..start + c.len_utf8()],
                line,
            }),
        }
        if tokens.len() > before {
            last = Some(before);
        }
    }

    tokens
}
