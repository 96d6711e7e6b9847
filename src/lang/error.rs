//! Script-level error values
//!
//! Syntax and runtime errors share one shape: a message template with up to
//! three positional substitution arguments, the source line the error was
//! raised on, and a flag telling the two apart. The template form is part of
//! the host interface (hosts may localize the template before substituting),
//! so this is a plain data struct rather than a `thiserror` enum.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::engine::handles::HandleId;

/// Maximum number of substitution arguments carried by a script error.
pub const MAX_ERROR_ARGS: usize = 3;

/// Distinguishes parse-time from evaluation-time failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptErrorKind {
    /// Raised while lexing or parsing; aborts only the current parse.
    Syntax,
    /// Raised while evaluating; unwinds to the current message boundary.
    Runtime,
}

/// A reportable script error.
///
/// `message` is a template in which `%1`, `%2`, `%3` are replaced by the
/// corresponding entries of `args` when rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptError {
    /// Message template, e.g. `"Expected %1 here but found %2."`.
    pub message: String,
    /// Substitution arguments, at most [`MAX_ERROR_ARGS`].
    pub args: Vec<String>,
    /// 1-based source line the error was raised on (0 when unknown).
    pub line: u32,
    /// Syntax vs. runtime flag.
    pub kind: ScriptErrorKind,
    /// The object whose script raised the error, when known.
    pub object: Option<HandleId>,
    /// Wall-clock time the error was raised.
    pub raised_at: chrono::DateTime<chrono::Utc>,
}

impl ScriptError {
    /// Create a syntax error with no substitution arguments.
    pub fn syntax(message: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            args: Vec::new(),
            line,
            kind: ScriptErrorKind::Syntax,
            object: None,
            raised_at: chrono::Utc::now(),
        }
    }

    /// Create a runtime error with no substitution arguments.
    pub fn runtime(message: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            args: Vec::new(),
            line,
            kind: ScriptErrorKind::Runtime,
            object: None,
            raised_at: chrono::Utc::now(),
        }
    }

    /// Append a substitution argument. Arguments past [`MAX_ERROR_ARGS`] are
    /// dropped rather than rejected.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        if self.args.len() < MAX_ERROR_ARGS {
            self.args.push(arg.into());
        }
        self
    }

    /// Attach the offending object.
    pub fn with_object(mut self, object: HandleId) -> Self {
        self.object = Some(object);
        self
    }

    /// Set the source line if none was known at construction.
    pub fn at_line(mut self, line: u32) -> Self {
        if self.line == 0 {
            self.line = line;
        }
        self
    }

    /// True for syntax errors.
    pub fn is_syntax(&self) -> bool {
        self.kind == ScriptErrorKind::Syntax
    }

    /// Render the template with its arguments substituted.
    pub fn rendered(&self) -> String {
        let mut out = self.message.clone();
        for (idx, arg) in self.args.iter().enumerate() {
            out = out.replace(&format!("%{}", idx + 1), arg);
        }
        out
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScriptErrorKind::Syntax => write!(f, "syntax error: {}", self.rendered())?,
            ScriptErrorKind::Runtime => write!(f, "runtime error: {}", self.rendered())?,
        }
        if self.line != 0 {
            write!(f, " (line {})", self.line)?;
        }
        Ok(())
    }
}

impl std::error::Error for ScriptError {}

/// Convenience result alias for script-level operations.
pub type ScriptResult<T> = std::result::Result<T, ScriptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_substitution_arguments() {
        let err = ScriptError::syntax("Expected %1 but found %2.", 12)
            .with_arg("end repeat")
            .with_arg("end if");
        assert_eq!(err.rendered(), "Expected end repeat but found end if.");
        assert!(err.is_syntax());
    }

    #[test]
    fn drops_arguments_past_the_limit() {
        let err = ScriptError::runtime("%1 %2 %3", 1)
            .with_arg("a")
            .with_arg("b")
            .with_arg("c")
            .with_arg("d");
        assert_eq!(err.args.len(), MAX_ERROR_ARGS);
    }

    #[test]
    fn display_includes_line() {
        let err = ScriptError::runtime("Can't divide by zero.", 7);
        assert_eq!(
            err.to_string(),
            "runtime error: Can't divide by zero. (line 7)"
        );
    }
}
