// File: src/lexer.rs
//
// Lexical analyzer (tokenizer) for the Strand programming language.
// Converts source code text into a stream of tokens for the compiler.
//
// Supports:
// - Keywords: let, fn, return, if, else, when, while, for, in, break, continue,
//   class, final, open, with, is, and, or, not, nil, self, yield, true, false
// - Identifiers, integer and double literals
// - String literals with escape sequences and ${expr} interpolation
// - Operators: + - * / % = == != < <= > >= ! && || ?: -> ..
// - Punctuation: ( ) { } [ ] , ; : .
// - Comments starting with // (a comment starting with `@break` marks a breakpoint)

use crate::errors::CompileError;

/// Comment prefix that turns a line comment into a breakpoint marker
pub const BREAKPOINT_MARKER: &str = "@break";

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Int(i64),
    Double(f64),
    String(String),
    Operator(String),
    Punctuation(char),
    Keyword(String),
    /// Emitted for `// @break` comments unless instrumentation is disabled
    Breakpoint,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn is_keyword(&self, word: &str) -> bool {
        matches!(&self.kind, TokenKind::Keyword(k) if k == word)
    }

    pub fn is_operator(&self, op: &str) -> bool {
        matches!(&self.kind, TokenKind::Operator(o) if o == op)
    }

    pub fn is_punct(&self, c: char) -> bool {
        matches!(&self.kind, TokenKind::Punctuation(p) if *p == c)
    }

    /// Short human-readable description used in compile errors
    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Identifier(name) => format!("identifier '{}'", name),
            TokenKind::Int(n) => format!("number {}", n),
            TokenKind::Double(d) => format!("number {}", d),
            TokenKind::String(_) => "string literal".to_string(),
            TokenKind::Operator(op) => format!("'{}'", op),
            TokenKind::Punctuation(c) => format!("'{}'", c),
            TokenKind::Keyword(k) => format!("keyword '{}'", k),
            TokenKind::Breakpoint => "breakpoint marker".to_string(),
            TokenKind::Eof => "end of file".to_string(),
        }
    }
}

/// A named piece of source text handed to the lexer and compiler
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: String,
    pub text: String,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, text: impl Into<String>) -> Self {
        Self { path: path.into(), text: text.into() }
    }

    /// Returns the text of a 1-based line, if it exists
    pub fn line(&self, line: usize) -> Option<&str> {
        if line == 0 {
            return None;
        }
        self.text.lines().nth(line - 1)
    }
}

/// Lexer switches
#[derive(Debug, Clone, Copy)]
pub struct LexOptions {
    /// Emit `Breakpoint` tokens for `// @break` comments
    pub breakpoints: bool,
}

impl Default for LexOptions {
    fn default() -> Self {
        Self { breakpoints: true }
    }
}

const KEYWORDS: &[&str] = &[
    "let", "fn", "return", "if", "else", "when", "while", "for", "in", "break", "continue",
    "class", "final", "open", "with", "is", "and", "or", "not", "nil", "self", "yield", "true",
    "false",
];

/// Tokenizes Strand source code with default options.
pub fn tokenize(source: &SourceFile) -> Result<Vec<Token>, CompileError> {
    tokenize_with(source, LexOptions::default())
}

/// Tokenizes Strand source code into a vector of tokens.
///
/// Processes the input character by character, recognizing keywords, identifiers,
/// numbers, strings, operators, and punctuation. Comments starting with // are
/// skipped until end of line; `// @break` comments become `Breakpoint` tokens.
/// String interpolation `${expr}` is spliced into the stream as
/// `( "prefix" + ( expr ) + "suffix" )`.
pub fn tokenize_with(source: &SourceFile, options: LexOptions) -> Result<Vec<Token>, CompileError> {
    let mut tokens = scan(&source.text, 1, 1, source, options)?;
    let (line, column) = end_position(&source.text);
    tokens.push(Token { kind: TokenKind::Eof, line, column });
    Ok(tokens)
}

fn end_position(text: &str) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for c in text.chars() {
        if c == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

fn lex_error(source: &SourceFile, message: String, line: usize, column: usize) -> CompileError {
    CompileError::new(source.path.clone(), message, line, column)
        .with_source(source.line(line).unwrap_or_default().to_string())
}

fn scan(
    text: &str,
    start_line: usize,
    start_col: usize,
    source: &SourceFile,
    options: LexOptions,
) -> Result<Vec<Token>, CompileError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = start_line;
    let mut col = start_col;

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => {
                chars.next();
                col += 1;
            }
            '\n' => {
                chars.next();
                line += 1;
                col = 1;
            }
            '/' if {
                let mut ahead = chars.clone();
                ahead.next();
                ahead.peek() == Some(&'/')
            } =>
            {
                let (comment_line, comment_col) = (line, col);
                chars.next();
                chars.next();
                let mut comment = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch == '\n' {
                        break;
                    }
                    comment.push(ch);
                    chars.next();
                    col += 1;
                }
                if options.breakpoints && comment.trim_start().starts_with(BREAKPOINT_MARKER) {
                    tokens.push(Token {
                        kind: TokenKind::Breakpoint,
                        line: comment_line,
                        column: comment_col,
                    });
                }
            }
            '"' => {
                let (str_line, str_col) = (line, col);
                chars.next(); // skip quote
                col += 1;
                let mut pieces: Vec<Vec<Token>> = Vec::new();
                let mut s = String::new();
                let mut closed = false;
                while let Some(ch) = chars.next() {
                    col += 1;
                    match ch {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\n' => {
                            line += 1;
                            col = 1;
                            s.push('\n');
                        }
                        '\\' => {
                            let esc = chars.next().ok_or_else(|| {
                                lex_error(source, "Unterminated string literal".into(), str_line, str_col)
                            })?;
                            col += 1;
                            match esc {
                                'n' => s.push('\n'),
                                't' => s.push('\t'),
                                '\\' => s.push('\\'),
                                '"' => s.push('"'),
                                '$' => s.push('$'),
                                _ => s.push(esc),
                            }
                        }
                        '$' if chars.peek() == Some(&'{') => {
                            chars.next();
                            col += 1;
                            let (expr_line, expr_col) = (line, col);
                            let mut depth = 1;
                            let mut inner = String::new();
                            for ch in chars.by_ref() {
                                col += 1;
                                match ch {
                                    '{' => depth += 1,
                                    '}' => {
                                        depth -= 1;
                                        if depth == 0 {
                                            break;
                                        }
                                    }
                                    '\n' => {
                                        line += 1;
                                        col = 1;
                                    }
                                    _ => {}
                                }
                                inner.push(ch);
                            }
                            if depth != 0 {
                                return Err(lex_error(
                                    source,
                                    "Unterminated string interpolation".into(),
                                    expr_line,
                                    expr_col,
                                ));
                            }
                            pieces.push(vec![string_token(std::mem::take(&mut s), str_line, str_col)]);
                            let spliced = scan(&inner, expr_line, expr_col, source, options)?;
                            if spliced.is_empty() {
                                return Err(lex_error(
                                    source,
                                    "Empty string interpolation".into(),
                                    expr_line,
                                    expr_col,
                                ));
                            }
                            pieces.push(spliced);
                        }
                        _ => s.push(ch),
                    }
                }
                if !closed {
                    return Err(lex_error(source, "Unterminated string literal".into(), str_line, str_col));
                }

                if pieces.is_empty() {
                    tokens.push(string_token(s, str_line, str_col));
                } else {
                    pieces.push(vec![string_token(s, str_line, str_col)]);
                    splice_interpolation(&mut tokens, pieces, str_line, str_col);
                }
            }
            '0'..='9' => {
                let (num_line, num_col) = (line, col);
                let mut num = String::new();
                let mut is_double = false;
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '_' {
                        if ch != '_' {
                            num.push(ch);
                        }
                        chars.next();
                        col += 1;
                    } else if ch == '.' && !is_double {
                        // `1..5` is a range, `1.5` is a double
                        let mut ahead = chars.clone();
                        ahead.next();
                        match ahead.peek() {
                            Some(d) if d.is_ascii_digit() => {
                                is_double = true;
                                num.push('.');
                                chars.next();
                                col += 1;
                            }
                            _ => break,
                        }
                    } else if (ch == 'e' || ch == 'E') && !num.contains(['e', 'E']) {
                        let mut ahead = chars.clone();
                        ahead.next();
                        let next = ahead.peek().copied();
                        let exponent_follows = match next {
                            Some(d) if d.is_ascii_digit() => true,
                            Some('-') | Some('+') => {
                                ahead.next();
                                matches!(ahead.peek(), Some(d) if d.is_ascii_digit())
                            }
                            _ => false,
                        };
                        if !exponent_follows {
                            break;
                        }
                        is_double = true;
                        num.push(ch);
                        chars.next();
                        col += 1;
                        if let Some(&sign) = chars.peek() {
                            if sign == '-' || sign == '+' {
                                num.push(sign);
                                chars.next();
                                col += 1;
                            }
                        }
                    } else {
                        break;
                    }
                }
                let kind = if is_double {
                    TokenKind::Double(num.parse().map_err(|_| {
                        lex_error(source, format!("Invalid number literal '{}'", num), num_line, num_col)
                    })?)
                } else {
                    TokenKind::Int(num.parse().map_err(|_| {
                        lex_error(source, format!("Integer literal '{}' is out of range", num), num_line, num_col)
                    })?)
                };
                tokens.push(Token { kind, line: num_line, column: num_col });
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let ident_col = col;
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                        col += 1;
                    } else {
                        break;
                    }
                }

                let kind = if KEYWORDS.contains(&ident.as_str()) {
                    TokenKind::Keyword(ident)
                } else {
                    TokenKind::Identifier(ident)
                };

                tokens.push(Token { kind, line, column: ident_col });
            }
            '=' | '!' | '<' | '>' | '+' | '-' | '*' | '/' | '%' | '&' | '|' | '?' | '.' | ':' => {
                let op_col = col;
                chars.next();
                col += 1;
                let next = chars.peek().copied();
                let two = match (c, next) {
                    ('=', Some('=')) => Some("=="),
                    ('!', Some('=')) => Some("!="),
                    ('<', Some('=')) => Some("<="),
                    ('>', Some('=')) => Some(">="),
                    ('-', Some('>')) => Some("->"),
                    ('&', Some('&')) => Some("&&"),
                    ('|', Some('|')) => Some("||"),
                    ('?', Some(':')) => Some("?:"),
                    ('.', Some('.')) => Some(".."),
                    _ => None,
                };
                let kind = if let Some(op) = two {
                    chars.next();
                    col += 1;
                    TokenKind::Operator(op.into())
                } else {
                    match c {
                        '.' | ':' => TokenKind::Punctuation(c),
                        '&' | '|' | '?' => {
                            return Err(lex_error(
                                source,
                                format!("Unexpected character '{}'", c),
                                line,
                                op_col,
                            ))
                        }
                        _ => TokenKind::Operator(c.to_string()),
                    }
                };
                tokens.push(Token { kind, line, column: op_col });
            }
            '(' | ')' | '{' | '}' | '[' | ']' | ',' | ';' => {
                tokens.push(Token { kind: TokenKind::Punctuation(c), line, column: col });
                chars.next();
                col += 1;
            }
            _ => {
                return Err(lex_error(source, format!("Unexpected character '{}'", c), line, col));
            }
        }
    }

    Ok(tokens)
}

fn string_token(s: String, line: usize, column: usize) -> Token {
    Token { kind: TokenKind::String(s), line, column }
}

/// Emits `( p0 + ( e1 ) + p2 + ... )` for the collected interpolation pieces.
/// Even-indexed pieces are string literals, odd-indexed ones are spliced expressions.
fn splice_interpolation(tokens: &mut Vec<Token>, pieces: Vec<Vec<Token>>, line: usize, column: usize) {
    let punct = |c| Token { kind: TokenKind::Punctuation(c), line, column };
    let plus = || Token { kind: TokenKind::Operator("+".into()), line, column };

    tokens.push(punct('('));
    for (i, piece) in pieces.into_iter().enumerate() {
        if i > 0 {
            tokens.push(plus());
        }
        if i % 2 == 1 {
            tokens.push(punct('('));
            tokens.extend(piece);
            tokens.push(punct(')'));
        } else {
            tokens.extend(piece);
        }
    }
    tokens.push(punct(')'));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(code: &str) -> Vec<TokenKind> {
        tokenize(&SourceFile::new("test.sd", code))
            .expect("lexing should succeed")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_numbers_and_ranges() {
        assert_eq!(
            kinds("1 2.5 1..3 1e3"),
            vec![
                TokenKind::Int(1),
                TokenKind::Double(2.5),
                TokenKind::Int(1),
                TokenKind::Operator("..".into()),
                TokenKind::Int(3),
                TokenKind::Double(1000.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_and_operators() {
        let toks = kinds("when x { 1 -> a ?: b }");
        assert_eq!(toks[0], TokenKind::Keyword("when".into()));
        assert!(toks.contains(&TokenKind::Operator("->".into())));
        assert!(toks.contains(&TokenKind::Operator("?:".into())));
    }

    #[test]
    fn test_breakpoint_marker() {
        let toks = kinds("x = 1 // @break\n// plain comment\ny = 2");
        assert_eq!(toks.iter().filter(|k| **k == TokenKind::Breakpoint).count(), 1);

        let source = SourceFile::new("t.sd", "x = 1 // @break");
        let release = tokenize_with(&source, LexOptions { breakpoints: false }).unwrap();
        assert!(release.iter().all(|t| t.kind != TokenKind::Breakpoint));
    }

    #[test]
    fn test_string_interpolation_splices_tokens() {
        let toks = kinds("\"a${x}b\"");
        assert_eq!(
            toks,
            vec![
                TokenKind::Punctuation('('),
                TokenKind::String("a".into()),
                TokenKind::Operator("+".into()),
                TokenKind::Punctuation('('),
                TokenKind::Identifier("x".into()),
                TokenKind::Punctuation(')'),
                TokenKind::Operator("+".into()),
                TokenKind::String("b".into()),
                TokenKind::Punctuation(')'),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_unterminated_string_is_error() {
        let err = tokenize(&SourceFile::new("t.sd", "\"abc")).unwrap_err();
        assert!(err.message.contains("Unterminated"));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_positions() {
        let toks = tokenize(&SourceFile::new("t.sd", "a\n  bb")).unwrap();
        assert_eq!((toks[0].line, toks[0].column), (1, 1));
        assert_eq!((toks[1].line, toks[1].column), (2, 3));
    }
}
