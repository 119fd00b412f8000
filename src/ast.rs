use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    If,
    Range,
    With,
}

impl BlockKind {
    pub fn keyword(self) -> &'static str {
        match self {
            BlockKind::If => "if",
            BlockKind::Range => "range",
            BlockKind::With => "with",
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum NodeKind {
    Text(String),
    /// `{{expr}}`
    Interpolation(Box<Node>),
    /// `.a.b.c`; an empty list is `.`, the data value itself.
    Reference(Vec<String>),
    Call { name: String, args: Vec<Node> },
    StrLit(String),
    /// `{{template name [data]}}`
    Template {
        name: Box<Node>,
        data: Option<Box<Node>>,
    },
    Block {
        kind: BlockKind,
        expr: Box<Node>,
        body: Box<Node>,
        else_clause: Option<Box<Node>>,
    },
    List(Vec<Node>),
}

/// A parsed template tree node, tagged with where it came from.
#[derive(Debug, PartialEq)]
pub struct Node {
    src: Arc<str>,
    line: usize,
    kind: NodeKind,
}

/// What [`Node::transform`] should do with the node it was shown.
pub enum Rewrite {
    /// Use this node in place of the visited one.
    Replace(Node),
    /// Keep the visited subtree as it is.
    Keep,
    /// Rebuild the visited node from its transformed children.
    Descend,
}

impl Node {
    pub fn new(src: Arc<str>, line: usize, kind: NodeKind) -> Self {
        Self { src, line, kind }
    }

    pub fn src(&self) -> &str {
        &self.src
    }

    pub(crate) fn src_arc(&self) -> &Arc<str> {
        &self.src
    }

    pub fn line(&self) -> usize {
        self.line
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Reference, call and string literal nodes produce values; every other
    /// node appends output.
    pub fn is_expression(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Reference(_) | NodeKind::Call { .. } | NodeKind::StrLit(_)
        )
    }

    /// Child nodes in a fixed order that [`Node::with_children`] accepts back.
    pub fn children(&self) -> Vec<&Node> {
        match &self.kind {
            NodeKind::Text(_) | NodeKind::Reference(_) | NodeKind::StrLit(_) => Vec::new(),
            NodeKind::Interpolation(expr) => vec![&**expr],
            NodeKind::Call { args, .. } => args.iter().collect(),
            NodeKind::Template { name, data } => {
                let mut children = vec![&**name];
                children.extend(data.as_deref());
                children
            }
            NodeKind::Block {
                expr,
                body,
                else_clause,
                ..
            } => {
                let mut children = vec![&**expr, &**body];
                children.extend(else_clause.as_deref());
                children
            }
            NodeKind::List(elements) => elements.iter().collect(),
        }
    }

    /// A node of the same variant, source and line with `children` in place
    /// of the current ones.
    ///
    /// # Panics
    ///
    /// Panics if `children` does not have an arity this variant accepts.
    pub fn with_children(&self, children: Vec<Node>) -> Node {
        let kind = match &self.kind {
            NodeKind::Text(text) => {
                expect_arity::<0>("text", children);
                NodeKind::Text(text.clone())
            }
            NodeKind::Reference(properties) => {
                expect_arity::<0>("reference", children);
                NodeKind::Reference(properties.clone())
            }
            NodeKind::StrLit(value) => {
                expect_arity::<0>("string literal", children);
                NodeKind::StrLit(value.clone())
            }
            NodeKind::Interpolation(_) => {
                let [expr] = expect_arity::<1>("interpolation", children);
                NodeKind::Interpolation(Box::new(expr))
            }
            NodeKind::Call { name, .. } => NodeKind::Call {
                name: name.clone(),
                args: children,
            },
            NodeKind::Template { .. } => {
                let arity = children.len();
                let mut children = children.into_iter();
                match (children.next(), children.next(), children.next()) {
                    (Some(name), data, None) => NodeKind::Template {
                        name: Box::new(name),
                        data: data.map(Box::new),
                    },
                    _ => panic!("template node takes 1 or 2 children, got {arity}"),
                }
            }
            NodeKind::Block { kind, .. } => {
                let arity = children.len();
                let mut children = children.into_iter();
                match (children.next(), children.next(), children.next(), children.next()) {
                    (Some(expr), Some(body), else_clause, None) => NodeKind::Block {
                        kind: *kind,
                        expr: Box::new(expr),
                        body: Box::new(body),
                        else_clause: else_clause.map(Box::new),
                    },
                    _ => panic!("{} node takes 2 or 3 children, got {arity}", kind.keyword()),
                }
            }
            NodeKind::List(_) => NodeKind::List(children),
        };
        Node::new(self.src.clone(), self.line, kind)
    }

    /// Rebuilds the tree top-down, letting `f` replace, keep or descend into
    /// each node it is shown. Nodes that are descended into are shown their
    /// children first and then reassembled with [`Node::with_children`].
    pub fn transform<F>(&self, f: &mut F) -> Node
    where
        F: FnMut(&Node) -> Rewrite,
    {
        match f(self) {
            Rewrite::Replace(node) => node,
            Rewrite::Keep => self.clone(),
            Rewrite::Descend => {
                let children = self
                    .children()
                    .into_iter()
                    .map(|child| child.transform(f))
                    .collect();
                self.with_children(children)
            }
        }
    }
}

fn expect_arity<const N: usize>(what: &str, children: Vec<Node>) -> [Node; N] {
    let found = children.len();
    children
        .try_into()
        .unwrap_or_else(|_| panic!("{what} node takes {N} children, got {found}"))
}

impl Clone for Node {
    /// Deep structural copy built through [`Node::with_children`].
    fn clone(&self) -> Self {
        self.transform(&mut |_: &Node| Rewrite::Descend)
    }
}

/// Writes `value` as a double-quoted literal the expression parser reads back.
pub(crate) fn write_quoted(f: &mut impl fmt::Write, value: &str) -> fmt::Result {
    f.write_char('"')?;
    for c in value.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            c if c.is_ascii_control() => write!(f, "\\x{:02x}", c as u32)?,
            c => f.write_char(c)?,
        }
    }
    f.write_char('"')
}

/// Source form; parsing the output yields an equivalent tree.
impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            NodeKind::Text(text) => f.write_str(text),
            NodeKind::Interpolation(expr) => write!(f, "{{{{{expr}}}}}"),
            NodeKind::Reference(properties) => write!(f, ".{}", properties.join(".")),
            NodeKind::Call { name, args } if args.len() == 1 => write!(f, "{} | {name}", args[0]),
            NodeKind::Call { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
            NodeKind::StrLit(value) => write_quoted(f, value),
            NodeKind::Template { name, data: Some(data) } => {
                write!(f, "{{{{template {name} {data}}}}}")
            }
            NodeKind::Template { name, data: None } => write!(f, "{{{{template {name}}}}}"),
            NodeKind::Block {
                kind,
                expr,
                body,
                else_clause,
            } => {
                write!(f, "{{{{{} {expr}}}}}{body}", kind.keyword())?;
                if let Some(else_clause) = else_clause {
                    write!(f, "{{{{else}}}}{else_clause}")?;
                }
                f.write_str("{{end}}")
            }
            NodeKind::List(elements) => elements.iter().try_for_each(|e| write!(f, "{e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(kind: NodeKind) -> Node {
        Node::new(Arc::from("test"), 1, kind)
    }

    fn reference(props: &[&str]) -> Node {
        node(NodeKind::Reference(props.iter().map(|p| p.to_string()).collect()))
    }

    fn if_node() -> Node {
        node(NodeKind::Block {
            kind: BlockKind::If,
            expr: Box::new(reference(&["ok"])),
            body: Box::new(node(NodeKind::Text("A".into()))),
            else_clause: Some(Box::new(node(NodeKind::Interpolation(Box::new(reference(&[])))))),
        })
    }

    #[test]
    fn children_round_trip_through_with_children() {
        let tree = if_node();
        let children: Vec<Node> = tree.children().into_iter().cloned().collect();
        assert_eq!(children.len(), 3);
        assert_eq!(tree.with_children(children), tree);
    }

    #[test]
    fn clone_is_structural() {
        let tree = node(NodeKind::List(vec![if_node(), node(NodeKind::Text("x".into()))]));
        let copy = tree.clone();
        assert_eq!(copy, tree);
        assert_eq!(copy.to_string(), "{{if .ok}}A{{else}}{{.}}{{end}}x");
    }

    #[test]
    fn transform_replaces_matching_nodes() {
        let tree = node(NodeKind::List(vec![
            node(NodeKind::Text("a".into())),
            node(NodeKind::Text("b".into())),
        ]));
        let upper = tree.transform(&mut |n: &Node| match n.kind() {
            NodeKind::Text(t) => Rewrite::Replace(node(NodeKind::Text(t.to_uppercase()))),
            _ => Rewrite::Descend,
        });
        assert_eq!(upper.to_string(), "AB");
    }

    #[test]
    fn single_argument_calls_print_as_pipelines() {
        let call = node(NodeKind::Call {
            name: "g".into(),
            args: vec![node(NodeKind::Call {
                name: "f".into(),
                args: vec![reference(&["x"])],
            })],
        });
        assert_eq!(call.to_string(), ".x | f | g");

        let call = node(NodeKind::Call {
            name: "join".into(),
            args: vec![reference(&["a"]), node(NodeKind::StrLit("\"q\"\n".into()))],
        });
        assert_eq!(call.to_string(), r#"join(.a, "\"q\"\n")"#);
    }

    #[test]
    fn template_call_prints_optional_data() {
        let call = node(NodeKind::Template {
            name: Box::new(node(NodeKind::StrLit("row".into()))),
            data: Some(Box::new(reference(&["item"]))),
        });
        assert_eq!(call.to_string(), r#"{{template "row" .item}}"#);
        assert_eq!(call.children().len(), 2);
    }

    #[test]
    #[should_panic(expected = "interpolation node takes 1 children, got 0")]
    fn with_children_rejects_wrong_arity() {
        node(NodeKind::Interpolation(Box::new(reference(&["x"])))).with_children(Vec::new());
    }
}
