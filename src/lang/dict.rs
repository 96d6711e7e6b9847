//! Terminology dictionary
//!
//! Append-only registries populated once at engine creation (built-ins first,
//! then host extensions) and consulted by every parser stage: classes with
//! their properties, element (collection) words, constants, functions,
//! commands, and synonyms. Lookups are by word sequence, longest match first.
//!
//! Registration happens before the worker starts; afterwards the dictionary
//! is shared immutably behind an `Arc`, following the catalog-snapshot shape
//! used by the engine elsewhere.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::ast::CommandArg;
use super::grammar::{CommandDef, CommandExec, GrammarError};
use super::interp::{ExecCtx, InterpResult, PutMode};
use super::value::Variant;
use crate::engine::error::{EngineError, Result};
use crate::engine::handles::HandleRef;

/// Property getter. `object` is absent for global/engine properties.
pub type PropGetter =
    Arc<dyn Fn(&mut ExecCtx<'_>, Option<&HandleRef>) -> InterpResult<Variant> + Send + Sync>;

/// Property setter.
pub type PropSetter =
    Arc<dyn Fn(&mut ExecCtx<'_>, Option<&HandleRef>, Variant) -> InterpResult<()> + Send + Sync>;

/// Retrieves the script source attached to an object.
pub type ScriptGetter = Arc<dyn Fn(&HandleRef) -> Option<String> + Send + Sync>;

/// Produces the next object in the responder chain, or `None` at the end.
pub type NextResponder = Arc<dyn Fn(&HandleRef) -> Option<HandleRef> + Send + Sync>;

/// Reads an object's container contents.
pub type ContentsReader =
    Arc<dyn Fn(&mut ExecCtx<'_>, &HandleRef) -> InterpResult<Variant> + Send + Sync>;

/// Writes an object's container contents.
pub type ContentsWriter =
    Arc<dyn Fn(&mut ExecCtx<'_>, &HandleRef, PutMode, Variant) -> InterpResult<()> + Send + Sync>;

/// Resolves one element access against its collection.
pub type ElementResolver = Arc<
    dyn Fn(&mut ExecCtx<'_>, Option<&HandleRef>, &ElementAccess) -> InterpResult<Variant>
        + Send
        + Sync,
>;

/// Built-in or host function implementation.
pub type FunctionExec =
    Arc<dyn Fn(&mut ExecCtx<'_>, &[Variant]) -> InterpResult<Variant> + Send + Sync>;

/// How a single member (or aggregate) of a collection is being accessed.
#[derive(Debug, Clone)]
pub enum ElementAccess {
    /// 1-based position.
    ByIndex(i64),
    /// By registered unique name.
    ByName(String),
    /// By registered unique id.
    ById(i64),
    /// Contiguous range of positions, inclusive.
    Range(i64, i64),
    /// Number of members.
    Count,
    /// The whole collection.
    All,
}

/// Getter/setter pair for one property slot.
#[derive(Clone)]
pub struct PropertySlot {
    /// Getter, if readable.
    pub getter: Option<PropGetter>,
    /// Setter, if writable.
    pub setter: Option<PropSetter>,
}

impl fmt::Debug for PropertySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertySlot")
            .field("readable", &self.getter.is_some())
            .field("writable", &self.setter.is_some())
            .finish()
    }
}

/// A registered object class: its properties, container behavior, script
/// source, and position in the responder chain.
#[derive(Clone)]
pub struct ClassDef {
    /// Class name, lowercased (`"button"`, `"card"`, …).
    pub name: String,
    /// Per-class property slots.
    pub properties: HashMap<String, PropertySlot>,
    /// Script-source retriever.
    pub get_script: Option<ScriptGetter>,
    /// Next responder in the message path.
    pub next_responder: Option<NextResponder>,
    /// Container read access.
    pub read_contents: Option<ContentsReader>,
    /// Container write access.
    pub write_contents: Option<ContentsWriter>,
}

impl ClassDef {
    /// Create an empty class definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            properties: HashMap::new(),
            get_script: None,
            next_responder: None,
            read_contents: None,
            write_contents: None,
        }
    }

    /// Add a property slot.
    pub fn with_property(
        mut self,
        name: impl Into<String>,
        getter: Option<PropGetter>,
        setter: Option<PropSetter>,
    ) -> Self {
        self.properties
            .insert(name.into().to_lowercase(), PropertySlot { getter, setter });
        self
    }

    /// Set the script-source retriever.
    pub fn with_script(mut self, getter: ScriptGetter) -> Self {
        self.get_script = Some(getter);
        self
    }

    /// Set the next-responder function.
    pub fn with_next_responder(mut self, responder: NextResponder) -> Self {
        self.next_responder = Some(responder);
        self
    }

    /// Set container read/write access.
    pub fn with_contents(
        mut self,
        reader: Option<ContentsReader>,
        writer: Option<ContentsWriter>,
    ) -> Self {
        self.read_contents = reader;
        self.write_contents = writer;
        self
    }
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef")
            .field("name", &self.name)
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// A registered element (collection) vocabulary entry.
#[derive(Clone)]
pub struct ElementDef {
    /// Singular word form, possibly multiword, space-joined and lowercased.
    pub singular: String,
    /// Plural word form.
    pub plural: String,
    /// Class name of the members.
    pub class: String,
    /// Access resolver.
    pub resolve: ElementResolver,
}

impl fmt::Debug for ElementDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementDef")
            .field("singular", &self.singular)
            .field("plural", &self.plural)
            .field("class", &self.class)
            .finish_non_exhaustive()
    }
}

/// Fixed or variadic function arity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly `n` arguments.
    Fixed(usize),
    /// Between `min` and `max` arguments, inclusive.
    Range(usize, usize),
    /// Any number of arguments.
    Variadic,
}

impl Arity {
    /// Check a call's argument count.
    pub fn accepts(&self, count: usize) -> bool {
        match self {
            Arity::Fixed(n) => count == *n,
            Arity::Range(min, max) => count >= *min && count <= *max,
            Arity::Variadic => true,
        }
    }
}

/// A registered function.
#[derive(Clone)]
pub struct FunctionDef {
    /// Function name, possibly multiword, lowercased.
    pub name: String,
    /// Accepted argument counts.
    pub arity: Arity,
    /// Implementation.
    pub exec: FunctionExec,
}

impl fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDef")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

/// The terminology dictionary.
#[derive(Default)]
pub struct Dictionary {
    classes: HashMap<String, Arc<ClassDef>>,
    global_properties: HashMap<String, PropertySlot>,
    property_words: HashMap<String, usize>,
    elements: HashMap<String, (Arc<ElementDef>, bool)>,
    constants: HashMap<String, Variant>,
    functions: HashMap<String, Arc<FunctionDef>>,
    commands: HashMap<String, Vec<Arc<CommandDef>>>,
    synonyms: HashMap<String, Vec<String>>,
    max_words: usize,
}

impl fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dictionary")
            .field("classes", &self.classes.len())
            .field("elements", &self.elements.len())
            .field("constants", &self.constants.len())
            .field("functions", &self.functions.len())
            .field("commands", &self.commands.values().map(Vec::len).sum::<usize>())
            .field("synonyms", &self.synonyms.len())
            .finish()
    }
}

impl Dictionary {
    /// Create an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    fn note_words(&mut self, key: &str) {
        let words = key.split(' ').count();
        if words > self.max_words {
            self.max_words = words;
        }
    }

    /// Longest registered word-sequence length, used by longest-match scans.
    pub fn max_word_count(&self) -> usize {
        self.max_words.max(1)
    }

    /// Register a class. A duplicate class name is a host programming error
    /// and fails immediately.
    pub fn register_class(&mut self, class: ClassDef) -> Result<()> {
        let name = class.name.clone();
        if self.classes.contains_key(&name) {
            return Err(EngineError::Terminology(format!(
                "class \"{}\" registered twice",
                name
            )));
        }
        for prop in class.properties.keys() {
            self.note_words(prop);
            let count = prop.split(' ').count();
            let entry = self.property_words.entry(prop.clone()).or_insert(count);
            *entry = count.max(*entry);
        }
        self.classes.insert(name, Arc::new(class));
        Ok(())
    }

    /// Look up a class by name.
    pub fn class(&self, name: &str) -> Option<&Arc<ClassDef>> {
        self.classes.get(name)
    }

    /// Register a global (engine-level) property.
    pub fn register_global_property(
        &mut self,
        name: impl Into<String>,
        getter: Option<PropGetter>,
        setter: Option<PropSetter>,
    ) {
        let name = name.into().to_lowercase();
        self.note_words(&name);
        let count = name.split(' ').count();
        self.property_words.insert(name.clone(), count);
        self.global_properties
            .insert(name, PropertySlot { getter, setter });
    }

    /// Global property slot, if registered.
    pub fn global_property(&self, name: &str) -> Option<&PropertySlot> {
        self.global_properties.get(name)
    }

    /// True when `name` is a known property word sequence (on any class or
    /// globally). The expression parser tags candidates with this before the
    /// owner is known.
    pub fn is_property_name(&self, name: &str) -> bool {
        self.property_words.contains_key(name)
    }

    /// Register an element vocabulary entry under both its word forms.
    pub fn register_element(&mut self, element: ElementDef) -> Result<()> {
        let singular = element.singular.to_lowercase();
        let plural = element.plural.to_lowercase();
        if self.elements.contains_key(&singular) || self.elements.contains_key(&plural) {
            return Err(EngineError::Terminology(format!(
                "element \"{}\" registered twice",
                singular
            )));
        }
        self.note_words(&singular);
        self.note_words(&plural);
        let shared = Arc::new(element);
        self.elements.insert(singular, (Arc::clone(&shared), false));
        self.elements.insert(plural, (shared, true));
        Ok(())
    }

    /// Element entry for a word sequence; the flag is true for the plural
    /// form.
    pub fn element(&self, words: &str) -> Option<(&Arc<ElementDef>, bool)> {
        self.elements
            .get(words)
            .map(|(def, plural)| (def, *plural))
    }

    /// Register a constant.
    pub fn register_constant(&mut self, name: impl Into<String>, value: Variant) {
        let name = name.into().to_lowercase();
        self.note_words(&name);
        self.constants.insert(name, value);
    }

    /// Constant value, if registered.
    pub fn constant(&self, name: &str) -> Option<&Variant> {
        self.constants.get(name)
    }

    /// Register a function.
    pub fn register_function(&mut self, function: FunctionDef) {
        let name = function.name.to_lowercase();
        self.note_words(&name);
        self.functions.insert(name, Arc::new(function));
    }

    /// Function definition, if registered.
    pub fn function(&self, name: &str) -> Option<&Arc<FunctionDef>> {
        self.functions.get(name)
    }

    /// Register a synonym: the word sequence `from` is replaced by `to`
    /// during the expression parser's substitution pass (non-recursively).
    pub fn register_synonym(&mut self, from: impl Into<String>, to: impl Into<String>) {
        let from = from.into().to_lowercase();
        self.note_words(&from);
        let to = to
            .into()
            .to_lowercase()
            .split(' ')
            .map(str::to_string)
            .collect();
        self.synonyms.insert(from, to);
    }

    /// Synonym replacement for a word sequence, if registered.
    pub fn synonym(&self, words: &str) -> Option<&Vec<String>> {
        self.synonyms.get(words)
    }

    /// Compile and register a command grammar.
    ///
    /// Commands are keyed by their first word; when several commands share a
    /// prefix, the first one registered that matches a statement wins.
    pub fn register_command(
        &mut self,
        grammar: &str,
        param_names: &[&str],
        exec: CommandExec,
    ) -> Result<Arc<CommandDef>> {
        let def = CommandDef::compile(grammar, param_names, exec)
            .map_err(|err: GrammarError| EngineError::Terminology(err.to_string()))?;
        self.commands
            .entry(def.name.clone())
            .or_default()
            .push(Arc::clone(&def));
        Ok(def)
    }

    /// Commands registered under a first word.
    pub fn commands_for(&self, first_word: &str) -> &[Arc<CommandDef>] {
        self.commands
            .get(first_word)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Dispatch helper: run `exec` for a definition with the given context
    /// and arguments.
    pub fn run_command(
        def: &CommandDef,
        ctx: &mut ExecCtx<'_>,
        args: &[CommandArg],
    ) -> InterpResult<()> {
        (def.exec)(ctx, args)
    }
}
