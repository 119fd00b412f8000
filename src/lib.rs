//! dottmpl: a minimal interpreter for Go-style `{{...}}` templates.
//!
//! This crate exists to do one job well: parse template source into a
//! small, closed AST and execute it against a JSON-shaped data value,
//! with an optional rewrite pass that routes every interpolation through
//! an escaping function.
//!
//! Supported subset:
//! - Literal text and `{{expr}}` interpolations.
//! - Expressions: `.a.b` property chains (`.` is the data itself),
//!   `'...'`/`"..."` string literals, calls `f(x, y)` and pipelines
//!   `x | f | g` (same as `g(f(x))`).
//! - `{{if}}`, `{{range}}` and `{{with}}` blocks, each with an optional
//!   `{{else}}`.
//! - `{{define "name"}}...{{end}}` at top level and
//!   `{{template "name" [data]}}` inclusion, recursion included.
//!
//! Not supported:
//! - Arithmetic, comparison operators, variables.
//! - Functions beyond those registered in a [`FunctionRegistry`].
//! - Template inheritance or partial output on error.
//!
//! Output semantics:
//! - Null interpolates as nothing; strings verbatim; other values in
//!   their JSON form.
//! - Null, `false`, `""`, `0`, `[]` and `{}` are falsy.
//! - Ranging over an object visits its keys in order.
//!
//! ```
//! use dottmpl::parse_templates;
//! use serde_json::json;
//!
//! let set = parse_templates("greeting", r#"{{define "t"}}Hi {{.who}}!{{end}}"#, None).unwrap();
//! assert_eq!(set.env(json!({"who": "Sam"})).render("t").unwrap(), "Hi Sam!");
//! ```

pub mod ast;
pub mod error;
pub mod escape;
pub mod eval;
pub mod lexer;
pub mod parser;

pub use ast::{BlockKind, Node, NodeKind, Rewrite};
pub use error::{Error, EvalError, Location};
pub use escape::{escape, escape_html, escape_with, HTML_ESCAPER};
pub use eval::{is_truthy, to_output, Env, FunctionRegistry, TemplateFunction, TemplateSet};
pub use parser::parse_templates;
pub use serde_json::Value;

/// Parses `code` as the single template `name` and renders it against `data`.
pub fn render_template(name: &str, code: &str, data: Value) -> Result<String, Error> {
    let set = parse_templates(name, code, Some(name))?;
    Ok(set.env(data).render(name)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn define_then_execute() {
        let set = parse_templates("greeting", r#"{{define "t"}}Hi {{.who}}!{{end}}"#, None).unwrap();
        let mut out = String::new();
        set.env(json!({"who": "Sam"})).execute("t", &mut out).unwrap();
        assert_eq!(out, "Hi Sam!");
    }

    #[test]
    fn render_template_reports_parse_and_eval_errors() {
        assert_eq!(render_template("t", "{{.x}}", json!({"x": 1})).unwrap(), "1");
        assert!(matches!(render_template("t", "{{if .x}}", json!(null)), Err(Error::Parse { .. })));
        assert!(matches!(render_template("t", "{{f()}}", json!(null)), Err(Error::Eval(_))));
    }

    #[test]
    fn crlf_line_endings_are_normalized() {
        let out = render_template("t", "a\r\n{{.x}}\rb", json!({"x": "-"})).unwrap();
        assert_eq!(out, "a\n-\nb");
    }

    #[test]
    fn missing_closing_braces_fail_with_a_line() {
        let err = parse_templates("page", "{{if .x}}A{{end", Some("main")).unwrap_err();
        assert!(matches!(err, Error::Lex { .. }));
        assert_eq!(err.to_string(), "page:1: unterminated directive: missing }}");
    }
}
