//! Command grammar compiler and statement matcher
//!
//! Each built-in command is declared once as a BNF-like string:
//! `[optional]`, `{choice|choice}`, `` `param` word `` captures, and
//! `<param>` / `<param<` parameter slots (the trailing `<` marks delayed
//! evaluation). The declaration is compiled into a pattern tree once at
//! registration; statement matching is a backtracking recursive descent over
//! the compiled tree, never over the grammar text.
//!
//! After a tree is built, a single stop-word propagation pass computes, for
//! every parameter slot, the set of literal words that may legally terminate
//! its greedy match. Two adjacent parameter slots with no literal or required
//! separator between them are a grammar-authoring error, rejected at compile
//! time.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::ast::CommandArg;
use super::interp::{ExecCtx, InterpResult};
use super::lexer::{Token, TokenKind};

/// Errors raised while compiling a grammar declaration. These are host
/// programming errors and surface immediately at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrammarError {
    /// Malformed grammar text.
    #[error("Malformed grammar for \"{command}\": {detail}")]
    Malformed {
        /// Command being declared.
        command: String,
        /// What went wrong.
        detail: String,
    },

    /// More `<…>` slots in the grammar than declared parameter names.
    #[error("Grammar for \"{0}\" has more parameter slots than declared names")]
    TooFewParams(String),

    /// Two parameter slots with nothing that could separate them.
    #[error("Grammar for \"{command}\": parameter \"{param}\" is immediately followed by another parameter with no literal between them")]
    AdjacentParams {
        /// Command being declared.
        command: String,
        /// The earlier of the two slots.
        param: String,
    },
}

/// A compiled grammar pattern node.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Ordered term list; every term must match in sequence.
    List(Vec<Pattern>),
    /// Required choice set: exactly one alternative must match.
    Required(Vec<Pattern>),
    /// Optional choice set: alternatives are tried but failure never fails
    /// the surrounding match.
    Optional(Vec<Pattern>),
    /// Literal word.
    Literal(String),
    /// Literal word that, when matched, records a named choice value.
    Capture {
        /// Index of the receiving parameter in declaration order.
        param: usize,
        /// The literal word to match and record.
        word: String,
    },
    /// Greedy parameter slot.
    Param {
        /// Index into the declared parameter list.
        index: usize,
        /// Stop-word set, filled by the propagation pass.
        stops: HashSet<String>,
    },
}

/// One declared command parameter.
#[derive(Debug, Clone)]
pub struct ParamDecl {
    /// Declared name.
    pub name: String,
    /// Whether the parameter's expression is evaluated on demand.
    pub delayed: bool,
}

/// Value captured for one parameter by a successful match.
#[derive(Debug, Clone)]
pub enum MatchedValue {
    /// Sub-run of statement tokens consumed by a greedy slot.
    Tokens(Vec<Token>),
    /// Named choice word from a capture literal.
    Word(String),
    /// Optional parameter that was not supplied. Explicit, so command
    /// implementations can tell "not given" from "given but empty".
    Absent,
}

impl MatchedValue {
    /// True when the parameter was not supplied.
    pub fn is_absent(&self) -> bool {
        matches!(self, MatchedValue::Absent)
    }
}

/// Implementation callback for a built-in command.
pub type CommandExec = Arc<dyn Fn(&mut ExecCtx<'_>, &[CommandArg]) -> InterpResult<()> + Send + Sync>;

/// A registered command: compiled grammar plus implementation.
pub struct CommandDef {
    /// First word of the command (the prefix-dictionary key).
    pub name: String,
    /// Declared parameters in order.
    pub params: Vec<ParamDecl>,
    pattern: Pattern,
    /// Implementation invoked by the interpreter.
    pub exec: CommandExec,
}

impl fmt::Debug for CommandDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDef")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl CommandDef {
    /// Compile a grammar declaration into a command definition.
    ///
    /// `param_names` are matched positionally to the `<…>` occurrences in the
    /// grammar, in declaration order; a trailing `<` inside a slot marks that
    /// parameter as delayed. Capture names refer to declared parameters by
    /// name.
    pub fn compile(
        grammar: &str,
        param_names: &[&str],
        exec: CommandExec,
    ) -> Result<Arc<Self>, GrammarError> {
        let mut compiler = Compiler::new(grammar, param_names);
        let pattern = compiler.compile()?;
        let name = compiler.command_name()?;
        let mut def = CommandDef {
            name,
            params: compiler.params,
            pattern,
            exec,
        };
        // Stop-word propagation runs exactly once, after the full tree is
        // built and before any matching.
        let mut outer = HashSet::new();
        propagate_stops(&mut def.pattern, &mut outer, &def.name, &def.params)?;
        Ok(Arc::new(def))
    }

    /// Match one statement's tokens (no trailing newline) against the
    /// compiled pattern.
    ///
    /// On success the result holds one entry per declared parameter, in
    /// declaration order, with unsupplied optionals explicitly absent.
    pub fn match_tokens(&self, tokens: &[Token]) -> Option<Vec<MatchedValue>> {
        let mut values: Vec<MatchedValue> = vec![MatchedValue::Absent; self.params.len()];
        let mut pos = 0usize;
        if match_pattern(&self.pattern, tokens, &mut pos, &mut values) && pos == tokens.len() {
            Some(values)
        } else {
            None
        }
    }
}

struct Compiler<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    param_names: &'a [&'a str],
    params: Vec<ParamDecl>,
    /// Indices of parameters bound by `` `name` `` captures; positional slot
    /// pairing skips these.
    captured: HashSet<usize>,
    next_slot: usize,
    first_word: Option<String>,
}

impl<'a> Compiler<'a> {
    fn new(grammar: &'a str, param_names: &'a [&'a str]) -> Self {
        // Capture names are scanned up front so a `<…>` slot that appears
        // before its sibling capture still pairs with the right name.
        let mut captured = HashSet::new();
        let mut rest = grammar;
        while let Some(start) = rest.find('`') {
            let tail = &rest[start + 1..];
            match tail.find('`') {
                Some(end) => {
                    let name = &tail[..end];
                    if let Some(idx) = param_names.iter().position(|declared| *declared == name) {
                        captured.insert(idx);
                    }
                    rest = &tail[end + 1..];
                }
                None => break,
            }
        }
        Self {
            chars: grammar.chars().peekable(),
            param_names,
            params: param_names
                .iter()
                .map(|name| ParamDecl {
                    name: name.to_string(),
                    delayed: false,
                })
                .collect(),
            captured,
            next_slot: 0,
            first_word: None,
        }
    }

    fn error(&self, detail: impl Into<String>) -> GrammarError {
        GrammarError::Malformed {
            command: self.first_word.clone().unwrap_or_default(),
            detail: detail.into(),
        }
    }

    fn command_name(&self) -> Result<String, GrammarError> {
        self.first_word
            .clone()
            .ok_or_else(|| self.error("grammar must begin with the command word"))
    }

    fn compile(&mut self) -> Result<Pattern, GrammarError> {
        let list = self.parse_list(None)?;
        if self.chars.peek().is_some() {
            return Err(self.error("unbalanced closing bracket"));
        }
        Ok(list)
    }

    /// Parse an ordered term list until `closer` (or end of text).
    fn parse_list(&mut self, closer: Option<char>) -> Result<Pattern, GrammarError> {
        let mut terms = Vec::new();
        loop {
            self.skip_spaces();
            match self.chars.peek().copied() {
                None => {
                    if closer.is_some() {
                        return Err(self.error("unterminated bracket"));
                    }
                    break;
                }
                Some(ch) if Some(ch) == closer || ch == '|' => break,
                Some('[') => {
                    self.chars.next();
                    terms.push(self.parse_choices(']', Pattern::Optional)?);
                }
                Some('{') => {
                    self.chars.next();
                    terms.push(self.parse_choices('}', Pattern::Required)?);
                }
                Some(']') | Some('}') => {
                    return Err(self.error("unbalanced closing bracket"));
                }
                Some('<') => {
                    self.chars.next();
                    terms.push(self.parse_param()?);
                }
                Some('`') => {
                    self.chars.next();
                    terms.push(self.parse_capture()?);
                }
                Some(_) => {
                    let word = self.parse_word()?;
                    if self.first_word.is_none() {
                        self.first_word = Some(word.clone());
                    }
                    terms.push(Pattern::Literal(word));
                }
            }
        }
        Ok(Pattern::List(terms))
    }

    /// Parse `a|b|c` alternatives until `closer`, wrapping with `wrap`.
    fn parse_choices(
        &mut self,
        closer: char,
        wrap: fn(Vec<Pattern>) -> Pattern,
    ) -> Result<Pattern, GrammarError> {
        let mut alts = Vec::new();
        // Alternatives are mutually exclusive, so their parameter slots share
        // positional numbering.
        let base_slot = self.next_slot;
        let mut max_slot = base_slot;
        loop {
            self.next_slot = base_slot;
            alts.push(self.parse_list(Some(closer))?);
            max_slot = max_slot.max(self.next_slot);
            match self.chars.peek().copied() {
                Some('|') => {
                    self.chars.next();
                }
                Some(ch) if ch == closer => {
                    self.chars.next();
                    break;
                }
                _ => return Err(self.error("unterminated choice set")),
            }
        }
        self.next_slot = max_slot;
        Ok(wrap(alts))
    }

    fn parse_param(&mut self) -> Result<Pattern, GrammarError> {
        // Skip the documentation name inside the angle brackets; slots pair
        // with declared names positionally.
        let mut delayed = false;
        loop {
            match self.chars.next() {
                Some('>') => break,
                Some('<') => {
                    // `<name<` form: trailing '<' marks delayed evaluation.
                    delayed = true;
                    break;
                }
                Some(_) => {}
                None => return Err(self.error("unterminated parameter slot")),
            }
        }
        while self.captured.contains(&self.next_slot) {
            self.next_slot += 1;
        }
        let index = self.next_slot;
        if index >= self.params.len() {
            return Err(GrammarError::TooFewParams(
                self.first_word.clone().unwrap_or_default(),
            ));
        }
        self.next_slot += 1;
        self.params[index].delayed = delayed;
        Ok(Pattern::Param {
            index,
            stops: HashSet::new(),
        })
    }

    fn parse_capture(&mut self) -> Result<Pattern, GrammarError> {
        let mut name = String::new();
        loop {
            match self.chars.next() {
                Some('`') => break,
                Some(ch) => name.push(ch),
                None => return Err(self.error("unterminated capture name")),
            }
        }
        let word = self.parse_word()?;
        let param = self
            .params
            .iter()
            .position(|decl| decl.name == name)
            .ok_or_else(|| self.error(format!("capture `{}` names no declared parameter", name)))?;
        Ok(Pattern::Capture { param, word })
    }

    fn parse_word(&mut self) -> Result<String, GrammarError> {
        let mut word = String::new();
        while let Some(&ch) = self.chars.peek() {
            if ch.is_whitespace() || "[]{}|<>`".contains(ch) {
                break;
            }
            word.push(ch);
            self.chars.next();
        }
        if word.is_empty() {
            return Err(self.error("expected a literal word"));
        }
        Ok(word.to_lowercase())
    }

    fn skip_spaces(&mut self) {
        while matches!(self.chars.peek(), Some(ch) if ch.is_whitespace()) {
            self.chars.next();
        }
    }
}

/// Collect the literal words that can begin `pattern`.
///
/// Returns true when the pattern can also match nothing (so the caller must
/// keep scanning its following siblings).
fn leading_literals(pattern: &Pattern, out: &mut HashSet<String>) -> bool {
    match pattern {
        Pattern::Literal(word) | Pattern::Capture { word, .. } => {
            out.insert(word.clone());
            false
        }
        Pattern::Param { .. } => false,
        Pattern::List(terms) => {
            for term in terms {
                if !leading_literals(term, out) {
                    return false;
                }
            }
            true
        }
        Pattern::Required(alts) => {
            let mut transparent = false;
            for alt in alts {
                transparent |= leading_literals(alt, out);
            }
            transparent
        }
        Pattern::Optional(alts) => {
            for alt in alts {
                leading_literals(alt, out);
            }
            true
        }
    }
}

/// True when `pattern` begins (possibly through optional wrappers) with a
/// parameter slot, which would make a preceding slot unmatchable.
fn leads_with_param(pattern: &Pattern) -> bool {
    match pattern {
        Pattern::Param { .. } => true,
        Pattern::List(terms) => terms.first().map(leads_with_param).unwrap_or(false),
        Pattern::Optional(alts) | Pattern::Required(alts) => alts.iter().any(leads_with_param),
        _ => false,
    }
}

/// The stop-word propagation pass.
///
/// For a parameter inside a term list, its stop set is the union of the stops
/// inherited from the caller and the literals reachable in the following
/// siblings up to and including the first literal or required set.
fn propagate_stops(
    pattern: &mut Pattern,
    inherited: &mut HashSet<String>,
    command: &str,
    params: &[ParamDecl],
) -> Result<(), GrammarError> {
    match pattern {
        Pattern::Literal(_) | Pattern::Capture { .. } => Ok(()),
        Pattern::Param { stops, .. } => {
            *stops = inherited.clone();
            Ok(())
        }
        Pattern::List(terms) => {
            for i in 0..terms.len() {
                // Stops for term i: the union of the caller's stops and the
                // literals of the following siblings up to and including the
                // first literal or required set.
                let mut following = HashSet::new();
                for sibling in &terms[i + 1..] {
                    if matches!(terms[i], Pattern::Param { .. }) && leads_with_param(sibling) {
                        let name = match &terms[i] {
                            Pattern::Param { index, .. } => params[*index].name.clone(),
                            _ => unreachable!(),
                        };
                        return Err(GrammarError::AdjacentParams {
                            command: command.to_string(),
                            param: name,
                        });
                    }
                    if !leading_literals(sibling, &mut following) {
                        break;
                    }
                }
                following.extend(inherited.iter().cloned());
                propagate_stops(&mut terms[i], &mut following, command, params)?;
            }
            Ok(())
        }
        Pattern::Required(alts) | Pattern::Optional(alts) => {
            for alt in alts {
                let mut stops = inherited.clone();
                propagate_stops(alt, &mut stops, command, params)?;
            }
            Ok(())
        }
    }
}

fn literal_matches(token: &Token, word: &str) -> bool {
    match &token.kind {
        TokenKind::Word(text) => text == word,
        TokenKind::Of { word: text } => text == word,
        _ => false,
    }
}

fn is_stop_token(token: &Token, stops: &HashSet<String>) -> bool {
    match &token.kind {
        TokenKind::Word(text) => stops.contains(text),
        TokenKind::Of { word } => stops.contains(word),
        _ => false,
    }
}

/// Backtracking match of `pattern` against `tokens` starting at `*pos`.
fn match_pattern(
    pattern: &Pattern,
    tokens: &[Token],
    pos: &mut usize,
    values: &mut Vec<MatchedValue>,
) -> bool {
    match pattern {
        Pattern::Literal(word) => match tokens.get(*pos) {
            Some(token) if literal_matches(token, word) => {
                *pos += 1;
                true
            }
            _ => false,
        },
        Pattern::Capture { param, word } => match tokens.get(*pos) {
            Some(token) if literal_matches(token, word) => {
                *pos += 1;
                values[*param] = MatchedValue::Word(word.clone());
                true
            }
            _ => false,
        },
        Pattern::Param { index, stops } => {
            let start = *pos;
            while let Some(token) = tokens.get(*pos) {
                if is_stop_token(token, stops) {
                    break;
                }
                *pos += 1;
            }
            if *pos == start {
                return false;
            }
            values[*index] = MatchedValue::Tokens(tokens[start..*pos].to_vec());
            true
        }
        Pattern::List(terms) => {
            let saved_pos = *pos;
            let saved_values = values.clone();
            for term in terms {
                if !match_pattern(term, tokens, pos, values) {
                    *pos = saved_pos;
                    *values = saved_values;
                    return false;
                }
            }
            true
        }
        Pattern::Required(alts) => {
            for alt in alts {
                let saved_pos = *pos;
                let saved_values = values.clone();
                if match_pattern(alt, tokens, pos, values) {
                    return true;
                }
                *pos = saved_pos;
                *values = saved_values;
            }
            false
        }
        Pattern::Optional(alts) => {
            for alt in alts {
                let saved_pos = *pos;
                let saved_values = values.clone();
                if match_pattern(alt, tokens, pos, values) {
                    return true;
                }
                *pos = saved_pos;
                *values = saved_values;
            }
            // Optional sets never fail the surrounding match.
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::ParseLimits;
    use crate::lang::lexer;

    fn noop_exec() -> CommandExec {
        Arc::new(|_, _| Ok(()))
    }

    fn toks(src: &str) -> Vec<Token> {
        let mut tokens = lexer::lex(src, &ParseLimits::default()).expect("lex");
        // Matching operates on one statement without its newline.
        assert!(matches!(tokens.pop().map(|t| t.kind), Some(TokenKind::Newline)));
        tokens
    }

    fn put_def() -> Arc<CommandDef> {
        CommandDef::compile(
            "put <source> [{`dest`into|`dest`after|`dest`before} <destination>]",
            &["source", "dest", "destination"],
            noop_exec(),
        )
        .expect("compile")
    }

    #[test]
    fn compiles_and_matches_put_into() {
        let def = put_def();
        assert_eq!(def.name, "put");

        let values = def.match_tokens(&toks("put 3 + 4 into x")).expect("match");
        let MatchedValue::Tokens(source) = &values[0] else {
            panic!("expected token run for source");
        };
        assert_eq!(source.len(), 3);
        assert!(matches!(&values[1], MatchedValue::Word(word) if word == "into"));
        assert!(matches!(&values[2], MatchedValue::Tokens(run) if run.len() == 1));
    }

    #[test]
    fn unsupplied_optional_is_explicitly_absent() {
        let def = put_def();
        let values = def.match_tokens(&toks("put 42")).expect("match");
        assert!(!values[0].is_absent());
        assert!(values[1].is_absent());
        assert!(values[2].is_absent());
    }

    #[test]
    fn stop_words_end_greedy_parameters() {
        let def = put_def();
        // "into" must stop the greedy <source> slot even though more tokens
        // follow.
        let values = def.match_tokens(&toks("put 1 + 2 into x")).expect("match");
        let MatchedValue::Tokens(source) = &values[0] else {
            panic!();
        };
        assert!(source.iter().all(|tok| !tok.is_word("into")));
    }

    #[test]
    fn required_choice_must_match() {
        let def = CommandDef::compile(
            "add <value> to <dest>",
            &["value", "dest"],
            noop_exec(),
        )
        .expect("compile");
        assert!(def.match_tokens(&toks("add 3 to x")).is_some());
        assert!(def.match_tokens(&toks("add 3 from x")).is_none());
    }

    #[test]
    fn zero_width_parameter_fails_the_match() {
        let def = put_def();
        assert!(def.match_tokens(&toks("put into x")).is_none());
        assert!(def.match_tokens(&toks("put")).is_none());
    }

    #[test]
    fn trailing_unconsumed_tokens_fail_the_match() {
        let def = CommandDef::compile("beep [<count>]", &["count"], noop_exec()).expect("compile");
        assert!(def.match_tokens(&toks("beep 3")).is_some());
        // `beep` consumes everything greedily into count; a stray choice the
        // grammar knows nothing about must not match.
        let other = CommandDef::compile("beep", &[], noop_exec()).expect("compile");
        assert!(other.match_tokens(&toks("beep 3")).is_none());
    }

    #[test]
    fn delayed_marker_sets_the_param_flag() {
        let def = CommandDef::compile(
            "wait {`mode`until <cond<|`mode`while <cond<}",
            &["mode", "cond"],
            noop_exec(),
        )
        .expect("compile");
        assert!(def.params[1].delayed);
        assert!(!def.params[0].delayed);
    }

    #[test]
    fn adjacent_parameters_are_rejected_at_compile_time() {
        let err = CommandDef::compile("send <msg> <target>", &["msg", "target"], noop_exec())
            .unwrap_err();
        assert!(matches!(err, GrammarError::AdjacentParams { .. }));

        // An optional wrapper does not separate the slots either.
        let err =
            CommandDef::compile("send <msg> [<target>]", &["msg", "target"], noop_exec())
                .unwrap_err();
        assert!(matches!(err, GrammarError::AdjacentParams { .. }));
    }

    #[test]
    fn too_few_declared_params_is_rejected() {
        let err = CommandDef::compile("go to <where>", &[], noop_exec()).unwrap_err();
        assert!(matches!(err, GrammarError::TooFewParams(_)));
    }

    #[test]
    fn stop_words_see_through_optional_siblings() {
        // <a> is followed by an optional literal then a required "to": both
        // words must stop the greedy slot.
        let def = CommandDef::compile(
            "move <what> [slowly] to <where>",
            &["what", "where"],
            noop_exec(),
        )
        .expect("compile");
        let values = def.match_tokens(&toks("move x slowly to y")).expect("match");
        let MatchedValue::Tokens(what) = &values[0] else {
            panic!();
        };
        assert_eq!(what.len(), 1);
        assert!(def.match_tokens(&toks("move x to y")).is_some());
    }

    #[test]
    fn rematching_is_deterministic() {
        let def = put_def();
        let tokens = toks("put 3 + 4 into x");
        let first = def.match_tokens(&tokens).expect("match");
        let second = def.match_tokens(&tokens).expect("match");
        assert_eq!(format!("{:?}", first), format!("{:?}", second));
    }
}
