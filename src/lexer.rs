use crate::error::{Error, Location};
use std::borrow::Cow;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Literal text between directives.
    Text,
    /// A whole `{{...}}` directive, delimiters included.
    Directive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// 1-based line on which the token starts.
    pub line: usize,
}

impl<'a> Token<'a> {
    /// The content between `{{` and `}}`, or the whole text for a text token.
    pub fn interior(&self) -> &'a str {
        match self.kind {
            TokenKind::Directive => &self.text[2..self.text.len() - 2],
            TokenKind::Text => self.text,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.kind == TokenKind::Text && self.text.trim().is_empty()
    }
}

/// Output of [`tokenize`]: the tokens plus the line reached at end of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenStream<'a> {
    pub tokens: Vec<Token<'a>>,
    pub end_line: usize,
}

/// Rewrites `\r\n` and lone `\r` to `\n`.
pub fn normalize_newlines(code: &str) -> Cow<'_, str> {
    if code.contains('\r') {
        Cow::Owned(code.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(code)
    }
}

/// Splits template source into alternating text and directive tokens.
///
/// Trailing whitespace-only text is dropped; leading whitespace is kept.
pub fn tokenize<'a>(src: &Arc<str>, code: &'a str) -> Result<TokenStream<'a>, Error> {
    let mut tokenizer = Tokenizer::new(src.clone(), code);
    let mut tokens = Vec::new();
    while let Some(token) = tokenizer.next_token() {
        tokens.push(token?);
    }
    while tokens.last().is_some_and(Token::is_blank) {
        tokens.pop();
    }
    log::trace!("{}: lexed {} tokens", src, tokens.len());
    Ok(TokenStream { tokens, end_line: tokenizer.line })
}

#[derive(Clone)]
pub struct Tokenizer<'a> {
    src: Arc<str>,
    input: &'a str,
    cursor: usize,
    line: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(src: Arc<str>, input: &'a str) -> Self {
        Self {
            src,
            input,
            cursor: 0,
            line: 1,
        }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.cursor..]
    }

    fn emit(&mut self, kind: TokenKind, len: usize) -> Token<'a> {
        let text = &self.remaining()[..len];
        let token = Token {
            kind,
            text,
            line: self.line,
        };
        self.cursor += len;
        self.line += text.matches('\n').count();
        token
    }

    pub fn next_token(&mut self) -> Option<Result<Token<'a>, Error>> {
        let rest = self.remaining();
        if rest.is_empty() {
            return None;
        }

        match rest.find("{{") {
            Some(0) => match directive_len(rest) {
                Some(len) => Some(Ok(self.emit(TokenKind::Directive, len))),
                None => {
                    let at = Location::new(self.src.clone(), self.line);
                    // Nothing after an unterminated directive can be tokenized.
                    self.cursor = self.input.len();
                    Some(Err(Error::lex(at, "unterminated directive: missing }}")))
                }
            },
            Some(idx) => Some(Ok(self.emit(TokenKind::Text, idx))),
            None => Some(Ok(self.emit(TokenKind::Text, rest.len()))),
        }
    }
}

/// Length of the directive at the start of `rest`, which begins with `{{`.
/// A `}}` inside a quoted string does not close the directive.
fn directive_len(rest: &str) -> Option<usize> {
    let bytes = rest.as_bytes();
    let mut i = 2;
    while i < bytes.len() {
        match bytes[i] {
            b'}' if bytes.get(i + 1) == Some(&b'}') => return Some(i + 2),
            quote @ (b'"' | b'\'') => i = quoted_end(bytes, i, quote)?,
            _ => i += 1,
        }
    }
    None
}

/// Index just past the closing quote of the string literal opened at `start`.
fn quoted_end(bytes: &[u8], start: usize, quote: u8) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprTokenKind {
    Word,
    Space,
    LParen,
    RParen,
    Pipe,
    Comma,
    Quoted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprToken<'a> {
    pub kind: ExprTokenKind,
    pub text: &'a str,
    /// Byte offset of the token within the directive interior.
    pub offset: usize,
}

fn is_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r')
}

fn is_word(c: char) -> bool {
    !is_space(c) && !matches!(c, '\'' | '"' | '(' | ')' | '|' | ',')
}

/// Splits a directive interior into expression tokens.
///
/// The only failure is a string literal with no closing quote; the error
/// carries the offending text.
pub fn tokenize_expr(input: &str) -> Result<Vec<ExprToken<'_>>, String> {
    let mut tokens = Vec::new();
    let mut cursor = 0;
    while cursor < input.len() {
        let rest = &input[cursor..];
        let Some(first) = rest.chars().next() else {
            break;
        };
        let (kind, len) = match first {
            '(' => (ExprTokenKind::LParen, 1),
            ')' => (ExprTokenKind::RParen, 1),
            '|' => (ExprTokenKind::Pipe, 1),
            ',' => (ExprTokenKind::Comma, 1),
            '"' | '\'' => match quoted_end(rest.as_bytes(), 0, first as u8) {
                Some(end) => (ExprTokenKind::Quoted, end),
                None => return Err(format!("unterminated string literal {}", rest)),
            },
            c if is_space(c) => (ExprTokenKind::Space, run_len(rest, is_space)),
            _ => (ExprTokenKind::Word, run_len(rest, is_word)),
        };
        tokens.push(ExprToken {
            kind,
            text: &rest[..len],
            offset: cursor,
        });
        cursor += len;
    }
    Ok(tokens)
}

fn run_len(rest: &str, pred: fn(char) -> bool) -> usize {
    rest.char_indices()
        .find(|&(_, c)| !pred(c))
        .map_or(rest.len(), |(idx, _)| idx)
}
