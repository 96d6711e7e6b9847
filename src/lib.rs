//! CardTalk – an embeddable, English-like scripting language engine
//!
//! CardTalk gives a host application a HyperTalk-style scripting layer:
//! - A language front end ([`lang`]): lexer, BNF-style command grammars,
//!   multi-pass expression parsing, handler parsing, and a tree-walking
//!   interpreter over coercive variant values
//! - An execution control plane ([`engine`]): a generation-checked handle
//!   registry for host objects, a bounded event queue, a dedicated worker
//!   thread per open document, synchronous host callbacks, and a
//!   checkpoint-driven debugger protocol
//!
//! Hosts extend the language by registering terminology (classes, properties,
//! elements, commands, functions, constants, synonyms) before the engine
//! starts; scripts then read as plain English over the host's own vocabulary.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod engine;
pub mod lang;

pub use engine::{Engine, EngineConfig};
pub use lang::{ScriptError, ScriptResult, Variant};

/// Current crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
