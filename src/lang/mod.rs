//! Language front end: lexer, grammar, parsers, dictionary, interpreter
//!
//! The front end turns UTF-8 script source into executable handler trees:
//! - [`lexer`]: source text to a flat token list
//! - [`grammar`]: BNF-style command grammars compiled once, matched per line
//! - [`expr`]: multi-pass expression parsing over token runs
//! - [`handler`]: full `on … end` handler bodies to statement trees
//! - [`dict`]: the terminology dictionary every stage consults
//! - [`value`]: the coercing variant value model
//! - [`interp`]: the tree-walking evaluator and message dispatch

use serde::{Deserialize, Serialize};

pub mod ast;
pub mod dict;
pub mod error;
pub mod expr;
pub mod grammar;
pub mod handler;
pub mod interp;
pub mod lexer;
pub mod value;

pub use ast::{Expr, Handler, HandlerKind, Statement};
pub use dict::Dictionary;
pub use error::{ScriptError, ScriptErrorKind, ScriptResult};
pub use interp::{ExecCtx, Halt, Interp, InterpHooks, InterpResult, NoopHooks, PutMode, StepInfo};
pub use lexer::{Lexer, Token, TokenKind};
pub use value::Variant;

/// Hard limits applied while lexing and parsing.
///
/// Exceeding any of these is a syntax error, never a crash or unbounded
/// recursion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseLimits {
    /// Longest accepted identifier, in bytes.
    pub max_identifier_len: usize,
    /// Longest accepted string literal, in bytes.
    pub max_string_len: usize,
    /// Deepest accepted nesting of open blocks (if/repeat) in one handler.
    pub max_block_depth: usize,
    /// Deepest accepted handler call nesting at run time.
    pub max_call_depth: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_identifier_len: 128,
            max_string_len: 16384,
            max_block_depth: 40,
            max_call_depth: 64,
        }
    }
}
