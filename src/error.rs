use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Source name plus 1-based line, printed as `src:line`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub src: Arc<str>,
    pub line: usize,
}

impl Location {
    pub fn new(src: impl Into<Arc<str>>, line: usize) -> Self {
        Self { src: src.into(), line }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.src, self.line)
    }
}

/// Failure to turn template source into a [`crate::TemplateSet`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("{at}: {message}")]
    Lex { at: Location, message: String },

    #[error("{at}: {message}")]
    Parse { at: Location, message: String },

    #[error(transparent)]
    Eval(#[from] EvalError),
}

impl Error {
    pub(crate) fn lex(at: Location, message: impl Into<String>) -> Self {
        Error::Lex { at, message: message.into() }
    }

    pub(crate) fn parse(at: Location, message: impl Into<String>) -> Self {
        Error::Parse { at, message: message.into() }
    }

    /// Where the failure was detected, if it has a source position.
    pub fn location(&self) -> Option<&Location> {
        match self {
            Error::Lex { at, .. } | Error::Parse { at, .. } => Some(at),
            Error::Eval(e) => e.location(),
        }
    }
}

/// Failure while executing a parsed template.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("{at}: no function named {name:?}")]
    UnknownFunction { at: Location, name: String },

    #[error("{at}: no template named {name:?}")]
    UnknownTemplate { at: Location, name: String },

    #[error("no template named {name:?}")]
    MissingTemplate { name: String },

    #[error("{at}: cannot look up property {property:?} on {found}")]
    NotAMapping { at: Location, property: String, found: String },

    #[error("{at}: cannot range over {found}")]
    NotIterable { at: Location, found: String },

    #[error("{at}: template name must be a string, got {found}")]
    TemplateName { at: Location, found: String },

    #[error("{at}: function {name:?} failed: {message}")]
    Function { at: Location, name: String, message: String },

    #[error("{at}: statement used where an expression is required")]
    NotAnExpression { at: Location },

    #[error("{at}: expression used where a statement is required")]
    NotAStatement { at: Location },

    #[error("failed to write template output")]
    Write(#[from] fmt::Error),
}

impl EvalError {
    pub fn location(&self) -> Option<&Location> {
        match self {
            EvalError::UnknownFunction { at, .. }
            | EvalError::UnknownTemplate { at, .. }
            | EvalError::NotAMapping { at, .. }
            | EvalError::NotIterable { at, .. }
            | EvalError::TemplateName { at, .. }
            | EvalError::Function { at, .. }
            | EvalError::NotAnExpression { at }
            | EvalError::NotAStatement { at } => Some(at),
            EvalError::MissingTemplate { .. } | EvalError::Write(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_lead_with_source_and_line() {
        let err = Error::parse(Location::new("page.tmpl", 3), "Expected {{end}} at end of input");
        assert_eq!(err.to_string(), "page.tmpl:3: Expected {{end}} at end of input");
        assert_eq!(err.location().map(|l| l.line), Some(3));
    }

    #[test]
    fn eval_errors_convert_transparently() {
        let err: Error = EvalError::MissingTemplate { name: "main".into() }.into();
        assert_eq!(err.to_string(), "no template named \"main\"");
        assert!(err.location().is_none());
    }
}
