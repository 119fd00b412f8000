use crate::ast::*;
use crate::error::{Error, Location};
use crate::eval::{FunctionRegistry, TemplateSet};
use crate::lexer::{normalize_newlines, tokenize, tokenize_expr, ExprToken, ExprTokenKind, Token, TokenKind};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Parses a template definition or set of definitions.
///
/// `src` names the source in diagnostics. Content outside any
/// `{{define "..."}}...{{end}}` block becomes the body of the template
/// called `name`; without a name such content is an error.
///
/// This is the dual of the `Display` impl on [`TemplateSet`].
pub fn parse_templates(src: &str, code: &str, name: Option<&str>) -> Result<TemplateSet, Error> {
    let src: Arc<str> = Arc::from(src);
    let code = normalize_newlines(code);
    let stream = tokenize(&src, &code)?;
    let mut parser = Parser::new(src, stream.tokens, stream.end_line);
    let templates = parser.parse(name)?;
    Ok(TemplateSet::new(FunctionRegistry::default(), templates))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keyword {
    If,
    Range,
    With,
    Template,
    Define,
    End,
    Else,
}

const KEYWORDS: [(&str, Keyword); 7] = [
    ("if", Keyword::If),
    ("range", Keyword::Range),
    ("with", Keyword::With),
    ("template", Keyword::Template),
    ("define", Keyword::Define),
    ("end", Keyword::End),
    ("else", Keyword::Else),
];

enum Directive<'a> {
    Text(&'a str),
    Interpolation(&'a str),
    /// A keyword plus whatever follows it inside the braces.
    Keyword(Keyword, &'a str),
}

fn classify<'a>(token: &Token<'a>) -> Directive<'a> {
    if token.kind == TokenKind::Text {
        return Directive::Text(token.text);
    }
    let interior = token.interior();
    for (word, keyword) in KEYWORDS {
        if let Some(rest) = interior.strip_prefix(word) {
            if !rest.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
                return Directive::Keyword(keyword, rest);
            }
        }
    }
    Directive::Interpolation(interior)
}

fn is_identifier(word: &str) -> bool {
    let mut chars = word.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic()) && chars.all(|c| c.is_ascii_alphanumeric())
}

/// Recursive-descent parser over the directive-level token stream.
pub struct Parser<'a> {
    src: Arc<str>,
    tokens: Vec<Token<'a>>,
    end_line: usize,
    pos: usize,
    templates: BTreeMap<String, Node>,
}

impl<'a> Parser<'a> {
    pub fn new(src: Arc<str>, tokens: Vec<Token<'a>>, end_line: usize) -> Self {
        Self {
            src,
            tokens,
            end_line,
            pos: 0,
            templates: BTreeMap::new(),
        }
    }

    fn line_at(&self, pos: usize) -> usize {
        self.tokens.get(pos).map_or(self.end_line, |t| t.line)
    }

    fn fail(&self, line: usize, message: impl Into<String>) -> Error {
        Error::parse(Location::new(self.src.clone(), line), message)
    }

    /// Consumes the `{{define}}` prelude, then the body of `name` if given.
    pub fn parse(&mut self, name: Option<&str>) -> Result<BTreeMap<String, Node>, Error> {
        while let Some(token) = self.tokens.get(self.pos) {
            if token.is_blank() {
                self.pos += 1;
                continue;
            }
            let line = token.line;
            match classify(token) {
                Directive::Keyword(Keyword::Define, rest) => self.parse_define(rest, line)?,
                _ => break,
            }
        }

        if self.pos < self.tokens.len() {
            if let Some(name) = name {
                let line = self.line_at(self.pos);
                self.define(name.to_string(), line)?;
            }
        }

        if self.pos < self.tokens.len() {
            let rest: String = self.tokens[self.pos..].iter().map(|t| t.text).collect();
            return Err(self.fail(self.line_at(self.pos), format!("unparsed content {}", rest)));
        }

        Ok(std::mem::take(&mut self.templates))
    }

    fn parse_define(&mut self, rest: &str, line: usize) -> Result<(), Error> {
        let expr = self.parse_expr(rest, line)?;
        let NodeKind::StrLit(name) = expr.kind() else {
            return Err(self.fail(line, format!("expected name as quoted string, not {}", expr)));
        };
        self.pos += 1;
        self.define(name.clone(), line)?;
        self.expect_end()
    }

    fn define(&mut self, name: String, line: usize) -> Result<(), Error> {
        let body = self.parse_list()?;
        if self.templates.contains_key(&name) {
            return Err(self.fail(line, format!("Redefinition of {:?}", name)));
        }
        log::debug!("{}:{}: defined template {:?}", self.src, line, name);
        self.templates.insert(name, body);
        Ok(())
    }

    /// Parses statements up to end of input or an `{{end}}`/`{{else}}`,
    /// which is left unconsumed. A single statement is returned bare.
    fn parse_list(&mut self) -> Result<Node, Error> {
        let line = self.line_at(self.pos);
        let mut children = Vec::new();
        while let Some(node) = self.parse_statement()? {
            children.push(node);
        }
        Ok(match <[Node; 1]>::try_from(children) {
            Ok([only]) => only,
            Err(children) => Node::new(self.src.clone(), line, NodeKind::List(children)),
        })
    }

    fn parse_statement(&mut self) -> Result<Option<Node>, Error> {
        let Some(token) = self.tokens.get(self.pos) else {
            return Ok(None);
        };
        let line = token.line;
        let node = match classify(token) {
            Directive::Text(text) => NodeKind::Text(text.to_string()),
            Directive::Interpolation(interior) => {
                NodeKind::Interpolation(Box::new(self.parse_expr(interior, line)?))
            }
            Directive::Keyword(Keyword::End | Keyword::Else, _) => return Ok(None),
            Directive::Keyword(Keyword::Define, _) => {
                return Err(self.fail(line, "{{define}} is only allowed at the top level, before other content"));
            }
            Directive::Keyword(Keyword::Template, rest) => self.parse_template_call(rest, line)?,
            Directive::Keyword(keyword, rest) => return self.parse_block(keyword, rest, line).map(Some),
        };
        self.pos += 1;
        Ok(Some(Node::new(self.src.clone(), line, node)))
    }

    fn parse_template_call(&self, rest: &str, line: usize) -> Result<NodeKind, Error> {
        let (name, data_text) = self.parse_expr_prefix(rest, line)?;
        let data = if data_text.trim().is_empty() {
            None
        } else {
            let consumed = &rest[..rest.len() - data_text.len()];
            let data_line = line + consumed.matches('\n').count();
            Some(Box::new(self.parse_expr(data_text, data_line)?))
        };
        Ok(NodeKind::Template {
            name: Box::new(name),
            data,
        })
    }

    fn parse_block(&mut self, keyword: Keyword, rest: &str, line: usize) -> Result<Node, Error> {
        let kind = match keyword {
            Keyword::If => BlockKind::If,
            Keyword::Range => BlockKind::Range,
            Keyword::With => BlockKind::With,
            other => return Err(self.fail(line, format!("unexpected {:?} block", other))),
        };
        let expr = self.parse_expr(rest, line)?;
        self.pos += 1;
        let body = self.parse_list()?;
        let else_clause = if self.bare_keyword()? == Some(Keyword::Else) {
            self.pos += 1;
            Some(Box::new(self.parse_list()?))
        } else {
            None
        };
        self.expect_end()?;
        Ok(Node::new(
            self.src.clone(),
            line,
            NodeKind::Block {
                kind,
                expr: Box::new(expr),
                body: Box::new(body),
                else_clause,
            },
        ))
    }

    /// The `end`/`else` keyword at the current position, if any.
    fn bare_keyword(&self) -> Result<Option<Keyword>, Error> {
        let Some(token) = self.tokens.get(self.pos) else {
            return Ok(None);
        };
        match classify(token) {
            Directive::Keyword(keyword @ (Keyword::End | Keyword::Else), rest) => {
                if !rest.trim().is_empty() {
                    return Err(self.fail(token.line, format!("unexpected content in {}", token.text)));
                }
                Ok(Some(keyword))
            }
            _ => Ok(None),
        }
    }

    fn expect_end(&mut self) -> Result<(), Error> {
        let Some(token) = self.tokens.get(self.pos) else {
            return Err(self.fail(self.end_line, "Expected {{end}} at end of input"));
        };
        if self.bare_keyword()? != Some(Keyword::End) {
            return Err(self.fail(token.line, format!("Expected {{{{end}}}}, got {}", token.text)));
        }
        self.pos += 1;
        Ok(())
    }

    fn parse_expr(&self, text: &str, line: usize) -> Result<Node, Error> {
        let mut parser = ExprParser::new(&self.src, text, line)?;
        let expr = parser.parse_pipeline()?;
        parser.skip_ignorable();
        let remainder = parser.remainder();
        if !remainder.is_empty() {
            let consumed = &text[..text.len() - remainder.len()];
            return Err(parser.fail(format!("Trailing content in expression: {}^{}", consumed, remainder)));
        }
        Ok(expr)
    }

    /// Parses one pipeline from the front of `text`, returning the rest.
    fn parse_expr_prefix<'t>(&self, text: &'t str, line: usize) -> Result<(Node, &'t str), Error> {
        let mut parser = ExprParser::new(&self.src, text, line)?;
        let expr = parser.parse_pipeline()?;
        parser.skip_ignorable();
        Ok((expr, parser.remainder()))
    }
}

/// Parser for the inside of a directive.
///
/// Precedence, lowest first: pipelines (`atom | name | name`), then atoms
/// (references, string literals, calls).
struct ExprParser<'t> {
    src: Arc<str>,
    text: &'t str,
    tokens: Vec<ExprToken<'t>>,
    pos: usize,
    line: usize,
}

impl<'t> ExprParser<'t> {
    fn new(src: &Arc<str>, text: &'t str, line: usize) -> Result<Self, Error> {
        let tokens = tokenize_expr(text).map_err(|m| Error::parse(Location::new(src.clone(), line), m))?;
        Ok(Self {
            src: src.clone(),
            text,
            tokens,
            pos: 0,
            line,
        })
    }

    fn fail(&self, message: impl Into<String>) -> Error {
        Error::parse(Location::new(self.src.clone(), self.line), message)
    }

    fn node(&self, line: usize, kind: NodeKind) -> Node {
        Node::new(self.src.clone(), line, kind)
    }

    fn peek(&self) -> Option<&ExprToken<'t>> {
        self.tokens.get(self.pos)
    }

    fn remainder(&self) -> &'t str {
        self.peek().map_or("", |t| &self.text[t.offset..])
    }

    /// Consumes whitespace tokens, counting the newlines they contain.
    fn skip_ignorable(&mut self) {
        while let Some(token) = self.tokens.get(self.pos) {
            if token.kind != ExprTokenKind::Space {
                break;
            }
            self.line += token.text.matches('\n').count();
            self.pos += 1;
        }
    }

    fn expect(&mut self, kind: ExprTokenKind, what: &str) -> Result<(), Error> {
        match self.peek() {
            None => Err(self.fail(format!("Expected {} at end of input", what))),
            Some(token) if token.kind != kind => Err(self.fail(format!("Expected {}, got {}", what, token.text))),
            Some(_) => {
                self.pos += 1;
                Ok(())
            }
        }
    }

    fn parse_pipeline(&mut self) -> Result<Node, Error> {
        let mut expr = self.parse_atom()?;
        self.skip_ignorable();
        while self.peek().is_some_and(|t| t.kind == ExprTokenKind::Pipe) {
            self.pos += 1;
            let name = self.parse_name()?;
            expr = self.node(
                expr.line(),
                NodeKind::Call {
                    name,
                    args: vec![expr],
                },
            );
            self.skip_ignorable();
        }
        Ok(expr)
    }

    fn parse_atom(&mut self) -> Result<Node, Error> {
        self.skip_ignorable();
        let Some(token) = self.peek() else {
            return Err(self.fail(format!("missing expression part at end of {}", self.text)));
        };
        let line = self.line;
        match token.kind {
            ExprTokenKind::Word if token.text.starts_with('.') => {
                let properties = self.parse_reference(token.text)?;
                self.pos += 1;
                Ok(self.node(line, NodeKind::Reference(properties)))
            }
            ExprTokenKind::Quoted => {
                let value = unescape(token.text).map_err(|m| self.fail(m))?;
                self.pos += 1;
                Ok(self.node(line, NodeKind::StrLit(value)))
            }
            ExprTokenKind::Word => self.parse_call(),
            _ => Err(self.fail(format!("unexpected {} in expression {}", token.text, self.text))),
        }
    }

    fn parse_call(&mut self) -> Result<Node, Error> {
        let line = self.line;
        let name = self.parse_name()?;
        self.skip_ignorable();
        self.expect(ExprTokenKind::LParen, "(")?;
        self.skip_ignorable();
        let mut args = Vec::new();
        if self.peek().is_some_and(|t| t.kind != ExprTokenKind::RParen) {
            loop {
                args.push(self.parse_pipeline()?);
                self.skip_ignorable();
                if !self.peek().is_some_and(|t| t.kind == ExprTokenKind::Comma) {
                    break;
                }
                self.pos += 1;
            }
        }
        self.expect(ExprTokenKind::RParen, ")")?;
        Ok(self.node(line, NodeKind::Call { name, args }))
    }

    fn parse_name(&mut self) -> Result<String, Error> {
        self.skip_ignorable();
        let Some(token) = self.peek() else {
            return Err(self.fail(format!("missing function name at end of {}", self.text)));
        };
        if token.kind != ExprTokenKind::Word || !is_identifier(token.text) {
            return Err(self.fail(format!("expected function name but got {}", token.text)));
        }
        let name = token.text.to_string();
        self.pos += 1;
        Ok(name)
    }

    /// `.` is the data value itself; `.a.b` is a property chain.
    fn parse_reference(&self, word: &str) -> Result<Vec<String>, Error> {
        if word == "." {
            return Ok(Vec::new());
        }
        word[1..]
            .split('.')
            .map(|prop| {
                if is_identifier(prop) {
                    Ok(prop.to_string())
                } else {
                    Err(self.fail(format!("malformed reference {}", word)))
                }
            })
            .collect()
    }
}

/// Decodes the body of a quoted literal: `'a\n'` -> `a` + newline.
fn unescape(literal: &str) -> Result<String, String> {
    let inner = &literal[1..literal.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let decoded = match chars.next() {
            Some('n') => '\n',
            Some('t') => '\t',
            Some('r') => '\r',
            Some('0') => '\0',
            Some('a') => '\x07',
            Some('b') => '\x08',
            Some('f') => '\x0c',
            Some('v') => '\x0b',
            Some(c @ ('\\' | '\'' | '"')) => c,
            Some('x') => {
                let digits: String = chars.by_ref().take(2).collect();
                let valid = digits.len() == 2 && digits.chars().all(|c| c.is_ascii_hexdigit());
                match u8::from_str_radix(&digits, 16) {
                    Ok(byte) if valid => char::from(byte),
                    _ => return Err(format!("invalid escape sequence \\x{} in {}", digits, literal)),
                }
            }
            Some(other) => return Err(format!("invalid escape sequence \\{} in {}", other, literal)),
            None => return Err(format!("invalid string literal {}", literal)),
        };
        out.push(decoded);
    }
    Ok(out)
}
