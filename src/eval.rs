use crate::ast::*;
use crate::error::{EvalError, Location};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

static NULL: Value = Value::Null;

/// Whether `value` counts as present for `if`, `with` and `range`.
///
/// Null, `false`, the empty string, zero and empty arrays/objects are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(m) => !m.is_empty(),
    }
}

/// The text an interpolation appends for `value`; `None` for null.
pub fn to_output(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => format!("boolean {}", value),
        Value::Number(_) => format!("number {}", value),
        Value::String(_) => format!("string {}", value),
        Value::Array(_) => "an array".to_string(),
        Value::Object(_) => "an object".to_string(),
    }
}

/// A native function callable from templates.
pub type TemplateFunction = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// Functions available to templates by name.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, TemplateFunction>,
}

impl FunctionRegistry {
    /// Creates a new, empty function registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `func` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(func));
    }

    pub fn get(&self, name: &str) -> Option<&TemplateFunction> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}

/// Named templates plus the functions they may call.
///
/// Every [`Env`] derived from a set borrows it, so a template defined
/// anywhere in the set is visible from every other, recursively included.
/// Mutation (`escape`, registering functions) happens before rendering.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    functions: FunctionRegistry,
    templates: BTreeMap<String, Node>,
}

impl TemplateSet {
    pub fn new(functions: FunctionRegistry, templates: BTreeMap<String, Node>) -> Self {
        Self { functions, templates }
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn functions_mut(&mut self) -> &mut FunctionRegistry {
        &mut self.functions
    }

    pub fn template(&self, name: &str) -> Option<&Node> {
        self.templates.get(name)
    }

    pub fn templates(&self) -> &BTreeMap<String, Node> {
        &self.templates
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// Swaps the root of an existing template, returning the old one.
    pub(crate) fn replace_template(&mut self, name: &str, root: Node) -> Option<Node> {
        self.templates.get_mut(name).map(|slot| std::mem::replace(slot, root))
    }

    /// An environment over this set with `data` as the current value.
    pub fn env(&self, data: Value) -> Env<'_> {
        Env::new(data, self)
    }
}

/// Serializes back to `{{define "name"}}...{{end}}` source.
impl fmt::Display for TemplateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, body)) in self.templates.iter().enumerate() {
            if i > 0 {
                f.write_str("\n\n")?;
            }
            f.write_str("{{define ")?;
            write_quoted(f, name)?;
            write!(f, "}}}}{}{{{{end}}}}", body)?;
        }
        Ok(())
    }
}

/// The environment in which a template is executed.
#[derive(Debug, Clone)]
pub struct Env<'a> {
    data: Value,
    set: &'a TemplateSet,
}

impl<'a> Env<'a> {
    pub fn new(data: Value, set: &'a TemplateSet) -> Self {
        Self { data, set }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn functions(&self) -> &'a FunctionRegistry {
        &self.set.functions
    }

    pub fn templates(&self) -> &'a TemplateSet {
        self.set
    }

    /// Same functions and templates, different data.
    pub fn with_data(&self, data: Value) -> Env<'a> {
        Env { data, set: self.set }
    }

    /// Executes the named template, appending its output to `out`.
    pub fn execute<W: fmt::Write>(&self, name: &str, out: &mut W) -> Result<(), EvalError> {
        let root = self.set.template(name).ok_or_else(|| EvalError::MissingTemplate {
            name: name.to_string(),
        })?;
        root.execute(self, out)
    }

    /// Executes the named template into a fresh string.
    pub fn render(&self, name: &str) -> Result<String, EvalError> {
        let mut out = String::new();
        self.execute(name, &mut out)?;
        Ok(out)
    }
}

impl Node {
    fn location(&self) -> Location {
        Location::new(self.src_arc().clone(), self.line())
    }

    /// Runs a statement node, appending to `out`.
    pub fn execute(&self, env: &Env<'_>, out: &mut dyn fmt::Write) -> Result<(), EvalError> {
        match self.kind() {
            NodeKind::Text(text) => out.write_str(text)?,
            NodeKind::Interpolation(expr) => {
                if let Some(text) = to_output(&expr.evaluate(env)?) {
                    out.write_str(&text)?;
                }
            }
            NodeKind::Template { name, data } => {
                let name = match name.evaluate(env)? {
                    Value::String(name) => name,
                    other => {
                        return Err(EvalError::TemplateName {
                            at: self.location(),
                            found: describe(&other),
                        })
                    }
                };
                let root = env.templates().template(&name).ok_or_else(|| EvalError::UnknownTemplate {
                    at: self.location(),
                    name: name.clone(),
                })?;
                log::trace!("{}: including template {:?}", self.location(), name);
                match data {
                    Some(data) => root.execute(&env.with_data(data.evaluate(env)?), out)?,
                    None => root.execute(env, out)?,
                }
            }
            NodeKind::Block {
                kind,
                expr,
                body,
                else_clause,
            } => {
                let value = expr.evaluate(env)?;
                match kind {
                    _ if !is_truthy(&value) => {
                        if let Some(else_clause) = else_clause {
                            else_clause.execute(env, out)?;
                        }
                    }
                    BlockKind::If => body.execute(env, out)?,
                    BlockKind::With => body.execute(&env.with_data(value), out)?,
                    BlockKind::Range => match value {
                        Value::Array(items) => {
                            for item in items {
                                body.execute(&env.with_data(item), out)?;
                            }
                        }
                        Value::Object(entries) => {
                            for key in entries.into_iter().map(|(key, _)| key) {
                                body.execute(&env.with_data(Value::String(key)), out)?;
                            }
                        }
                        other => {
                            return Err(EvalError::NotIterable {
                                at: self.location(),
                                found: describe(&other),
                            })
                        }
                    },
                }
            }
            NodeKind::List(elements) => {
                for child in elements {
                    child.execute(env, out)?;
                }
            }
            NodeKind::Reference(_) | NodeKind::Call { .. } | NodeKind::StrLit(_) => {
                return Err(EvalError::NotAStatement { at: self.location() })
            }
        }
        Ok(())
    }

    /// Computes the value of an expression node.
    pub fn evaluate(&self, env: &Env<'_>) -> Result<Value, EvalError> {
        match self.kind() {
            NodeKind::StrLit(value) => Ok(Value::String(value.clone())),
            NodeKind::Reference(properties) => {
                let mut data = env.data();
                for prop in properties {
                    match data {
                        Value::Null => break,
                        Value::Object(map) => data = map.get(prop).unwrap_or(&NULL),
                        other => {
                            return Err(EvalError::NotAMapping {
                                at: self.location(),
                                property: prop.clone(),
                                found: describe(other),
                            })
                        }
                    }
                }
                Ok(data.clone())
            }
            NodeKind::Call { name, args } => {
                let func = env.functions().get(name).ok_or_else(|| EvalError::UnknownFunction {
                    at: self.location(),
                    name: name.clone(),
                })?;
                let args = args.iter().map(|arg| arg.evaluate(env)).collect::<Result<Vec<_>, _>>()?;
                func(&args).map_err(|message| EvalError::Function {
                    at: self.location(),
                    name: name.clone(),
                    message,
                })
            }
            _ => Err(EvalError::NotAnExpression { at: self.location() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_templates;
    use serde_json::json;

    fn render(code: &str, data: Value) -> Result<String, EvalError> {
        let set = parse_templates("test", code, Some("main")).unwrap();
        set.env(data).render("main")
    }

    #[test]
    fn truthiness() {
        for falsy in [json!(null), json!(false), json!(""), json!(0), json!(0.0), json!([]), json!({})] {
            assert!(!is_truthy(&falsy), "{}", falsy);
        }
        for truthy in [json!(true), json!("0"), json!(-1), json!(0.5), json!([0]), json!({"a": null})] {
            assert!(is_truthy(&truthy), "{}", truthy);
        }
    }

    #[test]
    fn output_formatting() {
        assert_eq!(to_output(&json!(null)), None);
        assert_eq!(to_output(&json!("s")).as_deref(), Some("s"));
        assert_eq!(to_output(&json!(5)).as_deref(), Some("5"));
        assert_eq!(to_output(&json!(2.5)).as_deref(), Some("2.5"));
        assert_eq!(to_output(&json!(true)).as_deref(), Some("true"));
        assert_eq!(to_output(&json!([1, "a"])).as_deref(), Some(r#"[1,"a"]"#));
    }

    #[test]
    fn property_chains() {
        assert_eq!(render("{{.a.b}}", json!({"a": {"b": 5}})).unwrap(), "5");
        assert_eq!(render("[{{.a.b}}]", json!({"a": null})).unwrap(), "[]");
        assert_eq!(render("[{{.missing.b}}]", json!({})).unwrap(), "[]");
        assert_eq!(render("{{.}}", json!("self")).unwrap(), "self");
        let err = render("{{.a.b}}", json!({"a": 3})).unwrap_err();
        assert!(matches!(err, EvalError::NotAMapping { ref property, .. } if property == "b"));
    }

    #[test]
    fn if_and_else() {
        let code = "{{if .c}}A{{else}}B{{end}}";
        assert_eq!(render(code, json!({"c": 1})).unwrap(), "A");
        assert_eq!(render(code, json!({"c": []})).unwrap(), "B");
        assert_eq!(render("{{if .c}}A{{end}}", json!({})).unwrap(), "");
    }

    #[test]
    fn with_rebinds_data() {
        let code = "{{with .user}}{{.name}}{{else}}anon{{end}}";
        assert_eq!(render(code, json!({"user": {"name": "Ada"}})).unwrap(), "Ada");
        assert_eq!(render(code, json!({"user": null})).unwrap(), "anon");
    }

    #[test]
    fn range_over_sequences_and_mappings() {
        let code = "{{range .xs}}<{{.}}>{{else}}none{{end}}";
        assert_eq!(render(code, json!({"xs": [1, 2, 3]})).unwrap(), "<1><2><3>");
        assert_eq!(render(code, json!({"xs": []})).unwrap(), "none");
        assert_eq!(render(code, json!({})).unwrap(), "none");
        assert_eq!(render(code, json!({"xs": {"b": 2, "a": 1}})).unwrap(), "<a><b>");
        assert_eq!(render("{{range .xs}}x{{end}}", json!({"xs": []})).unwrap(), "");
        let err = render(code, json!({"xs": "abc"})).unwrap_err();
        assert!(matches!(err, EvalError::NotIterable { .. }));
    }

    #[test]
    fn calls_and_pipelines() {
        let mut set = parse_templates("test", "{{.x | twice | wrap}} {{join(.x, 'y', 'z')}}", Some("main")).unwrap();
        let fns = set.functions_mut();
        fns.register("twice", |args: &[Value]| {
            let s = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(Value::String(s.repeat(2)))
        });
        fns.register("wrap", |args: &[Value]| Ok(json!(format!("[{}]", args[0].as_str().unwrap_or_default()))));
        fns.register("join", |args: &[Value]| {
            Ok(json!(args.iter().filter_map(Value::as_str).collect::<Vec<_>>().join("-")))
        });
        assert_eq!(set.env(json!({"x": "ab"})).render("main").unwrap(), "[abab] ab-y-z");
    }

    #[test]
    fn unknown_function_is_an_error() {
        let err = render("\n{{nope(.x)}}", json!({})).unwrap_err();
        assert_eq!(err.to_string(), "test:2: no function named \"nope\"");
    }

    #[test]
    fn function_failures_propagate() {
        let mut set = parse_templates("test", "{{boom()}}", Some("main")).unwrap();
        set.functions_mut().register("boom", |_: &[Value]| Err("kaput".to_string()));
        let err = set.env(json!(null)).render("main").unwrap_err();
        assert_eq!(err.to_string(), "test:1: function \"boom\" failed: kaput");
    }

    #[test]
    fn template_calls_share_the_set() {
        let code = r#"{{define "item"}}({{.}}){{end}}{{define "list"}}{{range .}}{{template "item" .}}{{end}}{{end}}"#;
        let set = parse_templates("test", code, None).unwrap();
        assert_eq!(set.env(json!(["a", "b"])).render("list").unwrap(), "(a)(b)");
    }

    #[test]
    fn template_call_without_data_keeps_current_data() {
        let code = r#"{{define "a"}}{{template "b"}}{{end}}{{define "b"}}{{.v}}{{end}}"#;
        let set = parse_templates("test", code, None).unwrap();
        assert_eq!(set.env(json!({"v": 7})).render("a").unwrap(), "7");
    }

    #[test]
    fn recursive_templates() {
        let code = r#"{{define "tree"}}{{.name}}{{range .kids}}[{{template "tree" .}}]{{end}}{{end}}"#;
        let set = parse_templates("test", code, None).unwrap();
        let data = json!({"name": "r", "kids": [{"name": "a", "kids": [{"name": "b"}]}, {"name": "c"}]});
        assert_eq!(set.env(data).render("tree").unwrap(), "r[a[b]][c]");
    }

    #[test]
    fn missing_templates() {
        let set = parse_templates("test", r#"{{template "ghost"}}"#, Some("main")).unwrap();
        let err = set.env(json!(null)).render("main").unwrap_err();
        assert!(matches!(err, EvalError::UnknownTemplate { ref name, .. } if name == "ghost"));
        let err = set.env(json!(null)).render("nowhere").unwrap_err();
        assert!(matches!(err, EvalError::MissingTemplate { .. }));

        let set = parse_templates("test", "{{template .n}}", Some("main")).unwrap();
        let err = set.env(json!({"n": 1})).render("main").unwrap_err();
        assert!(matches!(err, EvalError::TemplateName { .. }));
    }

    #[test]
    fn derived_envs_share_functions_and_templates() {
        let set = parse_templates("test", r#"{{define "x"}}{{.}}{{end}}"#, None).unwrap();
        let env = set.env(json!(1));
        let derived = env.with_data(json!(2));
        assert!(std::ptr::eq(env.templates(), derived.templates()));
        assert!(std::ptr::eq(env.functions(), derived.functions()));
        assert_eq!(derived.render("x").unwrap(), "2");
        assert_eq!(env.data(), &json!(1));
    }

    #[test]
    fn execute_appends_to_existing_output() {
        let set = parse_templates("test", "b", Some("main")).unwrap();
        let mut out = String::from("a");
        set.env(json!(null)).execute("main", &mut out).unwrap();
        assert_eq!(out, "ab");
    }

    #[test]
    fn serializes_as_define_blocks() {
        let code = "{{define \"b\"}}{{if .x}}{{.x | f}}{{end}}{{end}}\n{{define \"a\"}}A{{end}}";
        let set = parse_templates("test", code, None).unwrap();
        assert_eq!(
            set.to_string(),
            "{{define \"a\"}}A{{end}}\n\n{{define \"b\"}}{{if .x}}{{.x | f}}{{end}}{{end}}"
        );
    }
}
