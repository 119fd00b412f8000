//! Rewrites a template so every interpolation goes through an escaper.

use crate::ast::{Node, NodeKind, Rewrite};
use crate::error::EvalError;
use crate::eval::{to_output, TemplateSet};
use serde_json::Value;

/// Registry name under which [`escape`] installs [`escape_html`].
pub const HTML_ESCAPER: &str = "html";

/// Makes the named template safe for HTML output.
///
/// Wraps each `{{expr}}` in the template as `{{expr | html}}` and registers
/// [`escape_html`] as `html`. Applying it twice escapes twice.
pub fn escape(set: &mut TemplateSet, name: &str) -> Result<(), EvalError> {
    escape_with(set, name, HTML_ESCAPER, escape_html)
}

/// Like [`escape`] with a caller-supplied escaper registered as `fn_name`.
pub fn escape_with<F>(set: &mut TemplateSet, name: &str, fn_name: &str, escaper: F) -> Result<(), EvalError>
where
    F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
{
    let root = set.template(name).ok_or_else(|| EvalError::MissingTemplate {
        name: name.to_string(),
    })?;
    let escaped = wrap_interpolations(root, fn_name);
    set.functions_mut().register(fn_name, escaper);
    set.replace_template(name, escaped);
    log::debug!("escaped template {:?} through {:?}", name, fn_name);
    Ok(())
}

/// Expressions are only wrapped at the point they are interpolated;
/// block conditions and template-call arguments are left alone.
fn wrap_interpolations(root: &Node, fn_name: &str) -> Node {
    root.transform(&mut |node: &Node| match node.kind() {
        NodeKind::Interpolation(expr) => {
            let call = Node::new(
                node.src_arc().clone(),
                node.line(),
                NodeKind::Call {
                    name: fn_name.to_string(),
                    args: vec![(**expr).clone()],
                },
            );
            Rewrite::Replace(node.with_children(vec![call]))
        }
        _ if node.is_expression() => Rewrite::Keep,
        _ => Rewrite::Descend,
    })
}

/// HTML-escapes the text form of its single argument; null stays null.
pub fn escape_html(args: &[Value]) -> Result<Value, String> {
    let [value] = args else {
        return Err(format!("expected 1 argument, got {}", args.len()));
    };
    let Some(text) = to_output(value) else {
        return Ok(Value::Null);
    };
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    Ok(Value::String(out))
}
