//! Handler and control-flow parser
//!
//! Splits a script into its `on`/`function` … `end` blocks, then parses one
//! block at a time into a statement tree. Parsing keeps an explicit bounded
//! stack of open block frames (handler, loop, conditional); conditional
//! frames run a small per-frame state machine so single-line `then` clauses
//! can still accept an `else` on the following line, and a blank line closes
//! that window.
//!
//! Handler blocks parse lazily, on first dispatch. Parsed scripts are cached
//! by a blake3 hash of the full source; the engine clears the cache when the
//! checkpoint set changes so statements get re-stamped.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::ParseLimits;
use super::ast::{
    ArgValue, CommandArg, CondArm, Handler, HandlerKind, LoopKind, Statement, StatementKind,
};
use super::dict::Dictionary;
use super::error::{ScriptError, ScriptResult};
use super::expr::{parse_expression, parse_expression_list};
use super::grammar::MatchedValue;
use super::lexer::{self, Token, TokenKind};

/// One logical source line: its tokens (newline excluded) plus positioning.
#[derive(Debug, Clone)]
struct Line {
    tokens: Vec<Token>,
    /// 1-based logical line number.
    line: u32,
    /// First physical line covered by this logical line.
    hard_first: u32,
    /// Last physical line covered (continuations extend this).
    hard_last: u32,
}

impl Line {
    fn is_blank(&self) -> bool {
        self.tokens.is_empty()
    }

    fn covers_checkpoint(&self, checkpoints: &[u32]) -> bool {
        checkpoints
            .iter()
            .any(|cp| *cp >= self.hard_first && *cp <= self.hard_last)
    }
}

/// Split a token stream into logical lines. Blank lines are kept; they close
/// a dangling single-line `then` clause.
fn split_lines(tokens: Vec<Token>) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut current: Vec<Token> = Vec::new();
    for token in tokens {
        if matches!(token.kind, TokenKind::Newline) {
            let line = current.first().map(|tok| tok.line).unwrap_or(token.line);
            let hard_first = current.first().map(|tok| tok.hard_line).unwrap_or(line);
            let hard_last = current
                .iter()
                .map(|tok| tok.hard_line)
                .max()
                .unwrap_or(hard_first);
            lines.push(Line {
                tokens: std::mem::take(&mut current),
                line,
                hard_first,
                hard_last,
            });
        } else {
            current.push(token);
        }
    }
    lines
}

/// One `on`/`function` … `end` block, parsed on first use.
pub struct HandlerSlot {
    kind: HandlerKind,
    name: String,
    params: Vec<String>,
    line: u32,
    body: Vec<Line>,
    parsed: Mutex<Option<Arc<Handler>>>,
}

impl HandlerSlot {
    /// Handler kind.
    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Handler name, lowercased.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical line of the `on`/`function` header.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Parse this block, or return the cached parse.
    pub fn handler(
        &self,
        dict: &Dictionary,
        limits: &ParseLimits,
        checkpoints: &[u32],
    ) -> ScriptResult<Arc<Handler>> {
        let mut slot = self.parsed.lock();
        if let Some(parsed) = slot.as_ref() {
            return Ok(Arc::clone(parsed));
        }
        let parser = HandlerParser {
            dict,
            limits,
            checkpoints,
            handler_name: self.name.clone(),
            frames: Vec::new(),
        };
        let body = parser.parse(&self.body, self.line)?;
        let handler = Arc::new(Handler {
            kind: self.kind,
            name: self.name.clone(),
            params: self.params.clone(),
            body,
            line: self.line,
        });
        *slot = Some(Arc::clone(&handler));
        Ok(handler)
    }
}

impl std::fmt::Debug for HandlerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSlot")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("params", &self.params)
            .field("line", &self.line)
            .finish_non_exhaustive()
    }
}

/// A split script: handler blocks indexed by kind and name.
#[derive(Debug)]
pub struct Script {
    handlers: Vec<HandlerSlot>,
}

impl Script {
    /// Lex and split a script source into handler blocks. Bodies are not
    /// parsed yet.
    pub fn split(src: &str, limits: &ParseLimits) -> ScriptResult<Self> {
        let lines = split_lines(lexer::lex(src, limits)?);
        let mut handlers = Vec::new();
        let mut iter = lines.into_iter();
        while let Some(line) = iter.next() {
            if line.is_blank() {
                continue;
            }
            let kind = match line.tokens[0].word() {
                Some("on") => HandlerKind::Message,
                Some("function") => HandlerKind::Function,
                _ => {
                    return Err(ScriptError::syntax(
                        "Expected \"on\" or \"function\" here but found %1.",
                        line.line,
                    )
                    .with_arg(line.tokens[0].describe()));
                }
            };
            let (name, params) = parse_handler_header(&line)?;
            let mut body = Vec::new();
            let mut terminated = false;
            for body_line in iter.by_ref() {
                if body_line.tokens.len() == 2
                    && body_line.tokens[0].is_word("end")
                    && body_line.tokens[1].is_word(&name)
                {
                    terminated = true;
                    break;
                }
                body.push(body_line);
            }
            if !terminated {
                return Err(ScriptError::syntax(
                    "Expected \"end %1\" before the end of the script.",
                    line.line,
                )
                .with_arg(name));
            }
            handlers.push(HandlerSlot {
                kind,
                name,
                params,
                line: line.line,
                body,
                parsed: Mutex::new(None),
            });
        }
        Ok(Self { handlers })
    }

    /// Find a handler block by kind and (lowercased) name.
    pub fn find(&self, kind: HandlerKind, name: &str) -> Option<&HandlerSlot> {
        self.handlers
            .iter()
            .find(|slot| slot.kind == kind && slot.name == name)
    }

    /// All handler blocks in source order.
    pub fn handlers(&self) -> &[HandlerSlot] {
        &self.handlers
    }
}

fn parse_handler_header(line: &Line) -> ScriptResult<(String, Vec<String>)> {
    let name = line
        .tokens
        .get(1)
        .and_then(Token::word)
        .ok_or_else(|| {
            ScriptError::syntax("Expected a handler name after %1.", line.line)
                .with_arg(line.tokens[0].describe())
        })?
        .to_string();
    let mut params = Vec::new();
    let mut expect_name = true;
    for token in &line.tokens[2..] {
        match (&token.kind, expect_name) {
            (TokenKind::Word(word), true) => {
                params.push(word.clone());
                expect_name = false;
            }
            (TokenKind::Comma, false) => expect_name = true,
            _ => {
                return Err(ScriptError::syntax(
                    "Expected a parameter name but found %1.",
                    line.line,
                )
                .with_arg(token.describe()));
            }
        }
    }
    Ok((name, params))
}

/// Parsed-script cache, keyed by blake3 hash of the full source.
#[derive(Default)]
pub struct ScriptCache {
    entries: Mutex<HashMap<[u8; 32], Arc<Script>>>,
}

impl ScriptCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `src`, or return the cached split.
    pub fn script(&self, src: &str, limits: &ParseLimits) -> ScriptResult<Arc<Script>> {
        let key = *blake3::hash(src.as_bytes()).as_bytes();
        if let Some(script) = self.entries.lock().get(&key) {
            return Ok(Arc::clone(script));
        }
        let script = Arc::new(Script::split(src, limits)?);
        self.entries.lock().insert(key, Arc::clone(&script));
        Ok(script)
    }

    /// Drop every cached parse. Called when the checkpoint set changes so
    /// statements are re-stamped on next dispatch.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl std::fmt::Debug for ScriptCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptCache")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

/// Parse a bare statement block (no `on`/`end` wrapper), as used by the `do`
/// command and one-shot message-box evaluation.
pub fn parse_block(
    src: &str,
    dict: &Dictionary,
    limits: &ParseLimits,
) -> ScriptResult<Vec<Statement>> {
    let lines = split_lines(lexer::lex(src, limits)?);
    let parser = HandlerParser {
        dict,
        limits,
        checkpoints: &[],
        handler_name: String::new(),
        frames: Vec::new(),
    };
    parser.parse(&lines, lines.first().map(|line| line.line).unwrap_or(1))
}

/// Conditional-frame states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CondState {
    /// Condition parsed; `then` expected at the start of the next line.
    AwaitingThen,
    /// Collecting a multi-line block.
    InBlock,
    /// Single-line `then` clause just closed; an `else` may still follow on
    /// the next line. A blank line closes this window.
    MayElse,
}

enum FrameData {
    Handler,
    Loop(LoopKind),
    Cond {
        arms: Vec<CondArm>,
        default: Option<Vec<Statement>>,
        pending: Option<Box<crate::lang::ast::Expr>>,
        in_default: bool,
        state: CondState,
    },
}

struct Frame {
    data: FrameData,
    stmts: Vec<Statement>,
    line: u32,
    checkpoint: bool,
}

enum LineOutcome {
    Consumed,
    NotConsumed,
}

struct HandlerParser<'a> {
    dict: &'a Dictionary,
    limits: &'a ParseLimits,
    checkpoints: &'a [u32],
    handler_name: String,
    frames: Vec<Frame>,
}

impl<'a> HandlerParser<'a> {
    fn parse(mut self, body: &[Line], header_line: u32) -> ScriptResult<Vec<Statement>> {
        self.frames.push(Frame {
            data: FrameData::Handler,
            stmts: Vec::new(),
            line: header_line,
            checkpoint: false,
        });

        for line in body {
            if line.is_blank() {
                // A blank line closes any dangling single-line `then` clause.
                while self.top_may_else() {
                    self.close_cond_frame()?;
                }
                continue;
            }
            match self.resolve_pending(line)? {
                LineOutcome::Consumed => continue,
                LineOutcome::NotConsumed => {}
            }
            self.dispatch_line(line)?;
        }

        // Close complete conditional frames still waiting for an `else`.
        while self.top_may_else() {
            self.close_cond_frame()?;
        }
        if self.frames.len() > 1 {
            let frame = self.frames.last().unwrap();
            let expected = match frame.data {
                FrameData::Loop(_) => "end repeat",
                _ => "end if",
            };
            return Err(ScriptError::syntax(
                "Expected \"%1\" before the end of the handler.",
                frame.line,
            )
            .with_arg(expected));
        }
        let frame = self.frames.pop().ok_or_else(|| {
            ScriptError::syntax("Expected a handler body here.", header_line)
        })?;
        Ok(frame.stmts)
    }

    fn top_may_else(&self) -> bool {
        matches!(
            self.frames.last(),
            Some(Frame {
                data: FrameData::Cond {
                    state: CondState::MayElse,
                    ..
                },
                ..
            })
        )
    }

    /// Resolve the pending state of the top conditional frame before normal
    /// keyword dispatch.
    fn resolve_pending(&mut self, line: &Line) -> ScriptResult<LineOutcome> {
        loop {
            let state = match self.frames.last() {
                Some(Frame {
                    data: FrameData::Cond { state, .. },
                    ..
                }) => *state,
                _ => return Ok(LineOutcome::NotConsumed),
            };
            match state {
                CondState::AwaitingThen => {
                    if line.tokens[0].is_word("then") {
                        self.after_then(&line.tokens[1..], line)?;
                        return Ok(LineOutcome::Consumed);
                    }
                    return Err(ScriptError::syntax(
                        "Expected \"then\" here but found %1.",
                        line.line,
                    )
                    .with_arg(line.tokens[0].describe()));
                }
                CondState::MayElse => {
                    if line.tokens[0].is_word("else") {
                        self.handle_else(&line.tokens[1..], line)?;
                        return Ok(LineOutcome::Consumed);
                    }
                    // The window passed without an `else`.
                    self.close_cond_frame()?;
                }
                CondState::InBlock => return Ok(LineOutcome::NotConsumed),
            }
        }
    }

    fn dispatch_line(&mut self, line: &Line) -> ScriptResult<()> {
        let tokens = &line.tokens;
        let first = &tokens[0];
        match first.word() {
            Some("if") => self.handle_if(&tokens[1..], line),
            Some("else") => Err(ScriptError::syntax(
                "Found \"else\" without a matching \"if\".",
                line.line,
            )),
            Some("then") => Err(ScriptError::syntax(
                "Found \"then\" without a matching \"if\".",
                line.line,
            )),
            Some("repeat") => self.handle_repeat(&tokens[1..], line),
            Some("end") => self.handle_end(&tokens[1..], line),
            Some("on") | Some("function") => Err(ScriptError::syntax(
                "Can't define a handler inside another handler.",
                line.line,
            )),
            _ => {
                let stmt = self.parse_simple(tokens, line)?;
                self.emit(stmt);
                Ok(())
            }
        }
    }

    fn emit(&mut self, stmt: Statement) {
        if let Some(frame) = self.frames.last_mut() {
            frame.stmts.push(stmt);
        }
    }

    fn push_frame(&mut self, data: FrameData, line: &Line) -> ScriptResult<()> {
        if self.frames.len() >= self.limits.max_block_depth {
            return Err(ScriptError::syntax("Too many nested blocks.", line.line));
        }
        self.frames.push(Frame {
            data,
            stmts: Vec::new(),
            line: line.line,
            checkpoint: line.covers_checkpoint(self.checkpoints),
        });
        Ok(())
    }

    /// `if <cond> [then [stmt [else stmt]]]`
    fn handle_if(&mut self, rest: &[Token], line: &Line) -> ScriptResult<()> {
        let then_at = find_top_level_word(rest, "then");
        let (cond_tokens, after) = match then_at {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };
        let cond = parse_expression(cond_tokens, self.dict)?;
        self.push_frame(
            FrameData::Cond {
                arms: Vec::new(),
                default: None,
                pending: Some(Box::new(cond)),
                in_default: false,
                state: CondState::AwaitingThen,
            },
            line,
        )?;
        match after {
            None => Ok(()),
            Some(after) => self.after_then(after, line),
        }
    }

    /// Handle the tokens after a `then` for the top conditional frame.
    fn after_then(&mut self, rest: &[Token], line: &Line) -> ScriptResult<()> {
        if rest.is_empty() {
            self.set_cond_state(CondState::InBlock);
            return Ok(());
        }
        // A nested single-line `if` consumes any `else` on the same line.
        if rest[0].is_word("if") {
            let stmt = self.parse_inline(rest, line)?;
            self.emit(stmt);
            self.close_arm(line)?;
            self.set_cond_state(CondState::MayElse);
            return Ok(());
        }
        match find_top_level_word(rest, "else") {
            None => {
                let stmt = self.parse_simple(rest, line)?;
                self.emit(stmt);
                self.close_arm(line)?;
                self.set_cond_state(CondState::MayElse);
                Ok(())
            }
            Some(idx) => {
                let stmt = self.parse_simple(&rest[..idx], line)?;
                self.emit(stmt);
                self.close_arm(line)?;
                self.set_cond_state(CondState::MayElse);
                self.handle_else(&rest[idx + 1..], line)
            }
        }
    }

    /// `else`, `else if …`, or `else <stmt>` for the top conditional frame.
    fn handle_else(&mut self, rest: &[Token], line: &Line) -> ScriptResult<()> {
        let (in_default, state) = match self.frames.last() {
            Some(Frame {
                data:
                    FrameData::Cond {
                        in_default, state, ..
                    },
                ..
            }) => (*in_default, *state),
            _ => {
                return Err(ScriptError::syntax(
                    "Found \"else\" without a matching \"if\".",
                    line.line,
                ));
            }
        };
        if in_default {
            return Err(ScriptError::syntax(
                "Found \"else\" after the \"else\" block.",
                line.line,
            ));
        }
        // A multi-line arm ends at this `else`.
        if state == CondState::InBlock {
            self.close_arm(line)?;
        }

        if rest.is_empty() {
            // Multi-line default block follows.
            if let Some(Frame {
                data:
                    FrameData::Cond {
                        in_default, state, ..
                    },
                ..
            }) = self.frames.last_mut()
            {
                *in_default = true;
                *state = CondState::InBlock;
            }
            return Ok(());
        }

        // `else if <cond> [then …]` chains another arm onto the same frame.
        if rest[0].is_word("if") {
            let rest = &rest[1..];
            let then_at = find_top_level_word(rest, "then");
            let (cond_tokens, after) = match then_at {
                Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
                None => (rest, None),
            };
            let cond = parse_expression(cond_tokens, self.dict)?;
            if let Some(Frame {
                data: FrameData::Cond { pending, state, .. },
                ..
            }) = self.frames.last_mut()
            {
                *pending = Some(Box::new(cond));
                *state = CondState::AwaitingThen;
            }
            return match after {
                None => Ok(()),
                Some(after) => self.after_then(after, line),
            };
        }

        // Single-line default; the conditional is complete.
        if let Some(Frame {
            data: FrameData::Cond { in_default, .. },
            ..
        }) = self.frames.last_mut()
        {
            *in_default = true;
        }
        let stmt = self.parse_simple(rest, line)?;
        self.emit(stmt);
        self.close_arm(line)?;
        self.close_cond_frame()
    }

    fn set_cond_state(&mut self, new_state: CondState) {
        if let Some(Frame {
            data: FrameData::Cond { state, .. },
            ..
        }) = self.frames.last_mut()
        {
            *state = new_state;
        }
    }

    /// Move the top frame's accumulated statements into the current arm (or
    /// the default block).
    fn close_arm(&mut self, line: &Line) -> ScriptResult<()> {
        let Some(frame) = self.frames.last_mut() else {
            return Ok(());
        };
        let body = std::mem::take(&mut frame.stmts);
        let FrameData::Cond {
            arms,
            default,
            pending,
            in_default,
            ..
        } = &mut frame.data
        else {
            return Ok(());
        };
        if *in_default {
            *default = Some(body);
        } else {
            let condition = pending.take().ok_or_else(|| {
                ScriptError::syntax("Expected a condition for this \"if\".", line.line)
            })?;
            arms.push(CondArm {
                condition: *condition,
                body,
            });
        }
        Ok(())
    }

    /// Pop the top conditional frame and emit its `if` statement.
    fn close_cond_frame(&mut self) -> ScriptResult<()> {
        let Some(frame) = self.frames.pop() else {
            return Ok(());
        };
        let FrameData::Cond { arms, default, .. } = frame.data else {
            self.frames.push(frame);
            return Ok(());
        };
        self.emit(Statement {
            kind: StatementKind::If { arms, default },
            line: frame.line,
            checkpoint: frame.checkpoint,
        });
        Ok(())
    }

    /// `repeat [forever] | until <c> | while <c> | with v = a [down] to b |
    /// [for] <count> [times]`
    fn handle_repeat(&mut self, rest: &[Token], line: &Line) -> ScriptResult<()> {
        let kind = self.parse_loop_kind(rest, line)?;
        self.push_frame(FrameData::Loop(kind), line)
    }

    fn parse_loop_kind(&self, rest: &[Token], line: &Line) -> ScriptResult<LoopKind> {
        if rest.is_empty() || (rest.len() == 1 && rest[0].is_word("forever")) {
            return Ok(LoopKind::Forever);
        }
        if rest[0].is_word("until") {
            return Ok(LoopKind::Until(parse_expression(&rest[1..], self.dict)?));
        }
        if rest[0].is_word("while") {
            return Ok(LoopKind::While(parse_expression(&rest[1..], self.dict)?));
        }
        if rest[0].is_word("with") {
            let var = rest
                .get(1)
                .and_then(Token::word)
                .ok_or_else(|| {
                    ScriptError::syntax("Expected a counter variable after \"with\".", line.line)
                })?
                .to_string();
            if !matches!(
                rest.get(2).map(|tok| &tok.kind),
                Some(TokenKind::Operator(super::lexer::OpCode::Equal))
            ) {
                return Err(ScriptError::syntax(
                    "Expected \"=\" after the counter variable.",
                    line.line,
                ));
            }
            let bounds = &rest[3..];
            // `down to` before plain `to`.
            for idx in 0..bounds.len() {
                if bounds[idx].is_word("down")
                    && bounds
                        .get(idx + 1)
                        .map(|tok| tok.is_word("to"))
                        .unwrap_or(false)
                {
                    return Ok(LoopKind::CountDown {
                        var,
                        from: parse_expression(&bounds[..idx], self.dict)?,
                        to: parse_expression(&bounds[idx + 2..], self.dict)?,
                    });
                }
            }
            let to_at = find_top_level_word(bounds, "to").ok_or_else(|| {
                ScriptError::syntax("Expected \"to\" in this \"repeat with\".", line.line)
            })?;
            return Ok(LoopKind::CountUp {
                var,
                from: parse_expression(&bounds[..to_at], self.dict)?,
                to: parse_expression(&bounds[to_at + 1..], self.dict)?,
            });
        }
        let mut span = rest;
        if span[0].is_word("for") {
            span = &span[1..];
        }
        if span.last().map(|tok| tok.is_word("times")).unwrap_or(false) {
            span = &span[..span.len() - 1];
        }
        Ok(LoopKind::Count(parse_expression(span, self.dict)?))
    }

    /// `end if` / `end repeat`
    fn handle_end(&mut self, rest: &[Token], line: &Line) -> ScriptResult<()> {
        let what = rest.first().and_then(Token::word).ok_or_else(|| {
            ScriptError::syntax("Expected \"if\" or \"repeat\" after \"end\".", line.line)
        })?;
        match (what, self.frames.last().map(|frame| &frame.data)) {
            ("if", Some(FrameData::Cond { .. })) => {
                self.close_arm(line)?;
                self.close_cond_frame()
            }
            ("repeat", Some(FrameData::Loop(_))) => {
                let frame = self.frames.pop().ok_or_else(|| {
                    ScriptError::syntax("Found \"end repeat\" without \"repeat\".", line.line)
                })?;
                let FrameData::Loop(kind) = frame.data else {
                    unreachable!()
                };
                self.emit(Statement {
                    kind: StatementKind::Repeat {
                        kind,
                        body: frame.stmts,
                    },
                    line: frame.line,
                    checkpoint: frame.checkpoint,
                });
                Ok(())
            }
            _ => {
                let expected = match self.frames.last().map(|frame| &frame.data) {
                    Some(FrameData::Loop(_)) => "end repeat",
                    Some(FrameData::Cond { .. }) => "end if",
                    _ => "a statement",
                };
                Err(
                    ScriptError::syntax("Expected \"%1\" here but found \"end %2\".", line.line)
                        .with_arg(expected)
                        .with_arg(what),
                )
            }
        }
    }

    /// Parse a nested single-line `if`, recursively; the innermost `if`
    /// claims any `else` on the line.
    fn parse_inline(&mut self, tokens: &[Token], line: &Line) -> ScriptResult<Statement> {
        if !tokens[0].is_word("if") {
            return self.parse_simple(tokens, line);
        }
        let rest = &tokens[1..];
        let then_at = find_top_level_word(rest, "then").ok_or_else(|| {
            ScriptError::syntax("Expected \"then\" in this \"if\".", line.line)
        })?;
        let condition = parse_expression(&rest[..then_at], self.dict)?;
        let clause = &rest[then_at + 1..];
        if clause.is_empty() {
            return Err(ScriptError::syntax(
                "Expected a statement after \"then\".",
                line.line,
            ));
        }
        let (then_stmt, default) = if clause[0].is_word("if") {
            (self.parse_inline(clause, line)?, None)
        } else {
            match find_top_level_word(clause, "else") {
                None => (self.parse_simple(clause, line)?, None),
                Some(idx) => (
                    self.parse_simple(&clause[..idx], line)?,
                    Some(vec![self.parse_inline(&clause[idx + 1..], line)?]),
                ),
            }
        };
        Ok(Statement {
            kind: StatementKind::If {
                arms: vec![CondArm {
                    condition,
                    body: vec![then_stmt],
                }],
                default,
            },
            line: line.line,
            checkpoint: line.covers_checkpoint(self.checkpoints),
        })
    }

    /// A block-free statement: keyword statements, a grammar-matched command,
    /// or a custom message send.
    fn parse_simple(&mut self, tokens: &[Token], line: &Line) -> ScriptResult<Statement> {
        if tokens.is_empty() {
            return Err(ScriptError::syntax("Expected a statement here.", line.line));
        }
        let stamp = |kind| Statement {
            kind,
            line: line.line,
            checkpoint: line.covers_checkpoint(self.checkpoints),
        };
        let first = &tokens[0];
        if let Some(word) = first.word() {
            match word {
                "global" => {
                    let mut names = Vec::new();
                    let mut expect_name = true;
                    for token in &tokens[1..] {
                        match (&token.kind, expect_name) {
                            (TokenKind::Word(name), true) => {
                                names.push(name.clone());
                                expect_name = false;
                            }
                            (TokenKind::Comma, false) => expect_name = true,
                            _ => {
                                return Err(ScriptError::syntax(
                                    "Expected a variable name but found %1.",
                                    line.line,
                                )
                                .with_arg(token.describe()));
                            }
                        }
                    }
                    if names.is_empty() {
                        return Err(ScriptError::syntax(
                            "Expected a variable name after \"global\".",
                            line.line,
                        ));
                    }
                    return Ok(stamp(StatementKind::Global(names)));
                }
                "exit" => {
                    let target = tokens.get(1).and_then(Token::word);
                    return match target {
                        Some("repeat") => {
                            if !self.inside_loop() {
                                return Err(ScriptError::syntax(
                                    "Found \"exit repeat\" outside a \"repeat\" loop.",
                                    line.line,
                                ));
                            }
                            Ok(stamp(StatementKind::ExitRepeat))
                        }
                        Some(name) if name == self.handler_name => {
                            Ok(stamp(StatementKind::ExitHandler))
                        }
                        _ => Err(ScriptError::syntax(
                            "Expected \"repeat\" or \"%1\" after \"exit\".",
                            line.line,
                        )
                        .with_arg(self.handler_name.clone())),
                    };
                }
                "next" => {
                    if tokens.get(1).map(|tok| tok.is_word("repeat")).unwrap_or(false) {
                        if !self.inside_loop() {
                            return Err(ScriptError::syntax(
                                "Found \"next repeat\" outside a \"repeat\" loop.",
                                line.line,
                            ));
                        }
                        return Ok(stamp(StatementKind::NextRepeat));
                    }
                    return Err(ScriptError::syntax(
                        "Expected \"repeat\" after \"next\".",
                        line.line,
                    ));
                }
                "pass" => {
                    let target = tokens.get(1).and_then(Token::word);
                    if target == Some(self.handler_name.as_str()) {
                        return Ok(stamp(StatementKind::Pass));
                    }
                    return Err(ScriptError::syntax(
                        "Expected \"%1\" after \"pass\".",
                        line.line,
                    )
                    .with_arg(self.handler_name.clone()));
                }
                "return" => {
                    let value = if tokens.len() > 1 {
                        Some(parse_expression(&tokens[1..], self.dict)?)
                    } else {
                        None
                    };
                    return Ok(stamp(StatementKind::Return(value)));
                }
                _ => {}
            }

            // Grammar-matched built-in commands: first registered wins.
            for def in self.dict.commands_for(word) {
                if let Some(matched) = def.match_tokens(tokens) {
                    let mut args = Vec::with_capacity(def.params.len());
                    for (decl, value) in def.params.iter().zip(matched) {
                        let value = match value {
                            MatchedValue::Tokens(toks) => {
                                ArgValue::Expr(parse_expression(&toks, self.dict)?)
                            }
                            MatchedValue::Word(choice) => ArgValue::Word(choice),
                            MatchedValue::Absent => ArgValue::Absent,
                        };
                        args.push(CommandArg {
                            name: decl.name.clone(),
                            value,
                            delayed: decl.delayed,
                        });
                    }
                    return Ok(stamp(StatementKind::Command {
                        def: Arc::clone(def),
                        args,
                    }));
                }
            }

            // Anything else is a custom message send.
            let args = parse_expression_list(&tokens[1..], self.dict)?;
            return Ok(stamp(StatementKind::Message {
                name: word.to_string(),
                args,
            }));
        }
        Err(
            ScriptError::syntax("Expected a command here but found %1.", line.line)
                .with_arg(first.describe()),
        )
    }

    fn inside_loop(&self) -> bool {
        self.frames
            .iter()
            .any(|frame| matches!(frame.data, FrameData::Loop(_)))
    }
}

/// Position of the first `word` at parenthesis depth zero.
fn find_top_level_word(tokens: &[Token], word: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::OpenParen => depth += 1,
            TokenKind::CloseParen => depth = depth.saturating_sub(1),
            _ => {
                if depth == 0 && token.is_word(word) {
                    return Some(idx);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::ast::Expr;
    use crate::lang::value::Variant;
    use std::sync::Arc as StdArc;

    fn dict() -> Dictionary {
        let mut dict = Dictionary::new();
        dict.register_command(
            "beep [<count>]",
            &["count"],
            StdArc::new(|_, _| Ok(())),
        )
        .unwrap();
        dict.register_constant("empty", Variant::empty());
        dict
    }

    fn parse(src: &str) -> ScriptResult<StdArc<Handler>> {
        parse_with_checkpoints(src, &[])
    }

    fn parse_with_checkpoints(src: &str, checkpoints: &[u32]) -> ScriptResult<StdArc<Handler>> {
        let dict = dict();
        let limits = ParseLimits::default();
        let script = Script::split(src, &limits)?;
        let slot = &script.handlers()[0];
        slot.handler(&dict, &limits, checkpoints)
    }

    #[test]
    fn parses_a_simple_handler() {
        let handler = parse("on mouseUp\nbeep\nbeep 3\nend mouseUp").unwrap();
        assert_eq!(handler.kind, HandlerKind::Message);
        assert_eq!(handler.name, "mouseup");
        assert_eq!(handler.body.len(), 2);
        assert!(matches!(
            handler.body[0].kind,
            StatementKind::Command { .. }
        ));
    }

    #[test]
    fn parses_function_handlers_with_params() {
        let handler = parse("function add a, b\nreturn a + b\nend add").unwrap();
        assert_eq!(handler.kind, HandlerKind::Function);
        assert_eq!(handler.params, vec!["a".to_string(), "b".to_string()]);
        assert!(matches!(handler.body[0].kind, StatementKind::Return(Some(_))));
    }

    #[test]
    fn unknown_lines_become_message_sends() {
        let handler = parse("on mouseUp\ndoStuff 1, 2\nend mouseUp").unwrap();
        let StatementKind::Message { name, args } = &handler.body[0].kind else {
            panic!("expected message send");
        };
        assert_eq!(name, "dostuff");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn multiline_if_with_else_if_chain() {
        let src = "on t\n\
                   if 1 = 1 then\n\
                   beep\n\
                   else if 2 = 2 then\n\
                   beep\n\
                   else\n\
                   beep\n\
                   end if\n\
                   end t";
        let handler = parse(src).unwrap();
        let StatementKind::If { arms, default } = &handler.body[0].kind else {
            panic!("expected if");
        };
        assert_eq!(arms.len(), 2);
        assert!(default.is_some());
    }

    #[test]
    fn single_line_if_then_else() {
        let handler = parse("on t\nif 1 = 1 then beep else beep 2\nend t").unwrap();
        let StatementKind::If { arms, default } = &handler.body[0].kind else {
            panic!("expected if");
        };
        assert_eq!(arms.len(), 1);
        assert_eq!(default.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn else_on_next_line_after_single_line_then() {
        let src = "on t\nif 1 = 1 then beep\nelse beep 2\nend t";
        let handler = parse(src).unwrap();
        let StatementKind::If { default, .. } = &handler.body[0].kind else {
            panic!("expected if");
        };
        assert!(default.is_some());
    }

    #[test]
    fn blank_line_closes_the_else_window() {
        // The blank line ends the conditional, so the `else` has no `if`.
        let src = "on t\nif 1 = 1 then beep\n\nelse beep 2\nend t";
        let err = parse(src).unwrap_err();
        assert!(err.rendered().contains("else"));
    }

    #[test]
    fn repeat_variants() {
        let src = "on t\n\
                   repeat 3 times\n\
                   beep\n\
                   end repeat\n\
                   repeat with i = 1 to 5\n\
                   beep\n\
                   end repeat\n\
                   repeat with i = 5 down to 1\n\
                   beep\n\
                   end repeat\n\
                   repeat while 1 = 1\n\
                   beep\n\
                   end repeat\n\
                   end t";
        let handler = parse(src).unwrap();
        let kinds: Vec<_> = handler
            .body
            .iter()
            .map(|stmt| match &stmt.kind {
                StatementKind::Repeat { kind, .. } => kind.clone(),
                other => panic!("expected repeat, got {:?}", other),
            })
            .collect();
        assert!(matches!(kinds[0], LoopKind::Count(_)));
        assert!(matches!(kinds[1], LoopKind::CountUp { .. }));
        assert!(matches!(kinds[2], LoopKind::CountDown { .. }));
        assert!(matches!(kinds[3], LoopKind::While(_)));
    }

    #[test]
    fn exit_and_next_repeat_require_a_loop() {
        assert!(parse("on t\nexit repeat\nend t").is_err());
        assert!(parse("on t\nnext repeat\nend t").is_err());
        let src = "on t\nrepeat 2 times\nexit repeat\nend repeat\nend t";
        assert!(parse(src).is_ok());
    }

    #[test]
    fn pass_and_exit_must_name_the_handler() {
        assert!(parse("on mouseUp\npass mouseUp\nend mouseUp").is_ok());
        assert!(parse("on mouseUp\npass mouseDown\nend mouseUp").is_err());
        assert!(parse("on mouseUp\nexit mouseUp\nend mouseUp").is_ok());
    }

    #[test]
    fn unterminated_repeat_reports_expected_end() {
        let err = parse("on t\nrepeat forever\nbeep\nend t").unwrap_err();
        assert!(err.rendered().contains("end repeat"));
    }

    #[test]
    fn unterminated_handler_reports_expected_end() {
        let limits = ParseLimits::default();
        let err = Script::split("on t\nbeep", &limits).unwrap_err();
        assert!(err.rendered().contains("end t"));
    }

    #[test]
    fn block_depth_limit_is_a_syntax_error() {
        let limits = ParseLimits {
            max_block_depth: 3,
            ..ParseLimits::default()
        };
        let src = "on t\n\
                   repeat 1 times\n\
                   repeat 1 times\n\
                   repeat 1 times\n\
                   beep\n\
                   end repeat\n\
                   end repeat\n\
                   end repeat\n\
                   end t";
        let script = Script::split(src, &limits).unwrap();
        let err = script.handlers()[0]
            .handler(&dict(), &limits, &[])
            .unwrap_err();
        assert!(err.rendered().contains("nested"));
    }

    #[test]
    fn optional_command_parameter_is_explicitly_absent() {
        let handler = parse("on t\nbeep\nend t").unwrap();
        let StatementKind::Command { args, .. } = &handler.body[0].kind else {
            panic!("expected command");
        };
        assert_eq!(args.len(), 1);
        assert!(args[0].value.is_absent());
    }

    #[test]
    fn global_declarations() {
        let handler = parse("on t\nglobal a, b\nend t").unwrap();
        let StatementKind::Global(names) = &handler.body[0].kind else {
            panic!("expected global");
        };
        assert_eq!(names, &vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn checkpoints_stamp_statements_by_physical_line() {
        let src = "on t\nbeep\nbeep ¬\n3\nend t";
        // Physical line 4 is the continuation tail of the second beep.
        let handler = parse_with_checkpoints(src, &[4]).unwrap();
        assert!(!handler.body[0].checkpoint);
        assert!(handler.body[1].checkpoint);
    }

    #[test]
    fn script_splits_multiple_handlers() {
        let src = "on mouseUp\nbeep\nend mouseUp\n\nfunction f\nreturn 1\nend f";
        let script = Script::split(src, &ParseLimits::default()).unwrap();
        assert_eq!(script.handlers().len(), 2);
        assert!(script.find(HandlerKind::Message, "mouseup").is_some());
        assert!(script.find(HandlerKind::Function, "f").is_some());
        assert!(script.find(HandlerKind::Function, "mouseup").is_none());
    }

    #[test]
    fn junk_between_handlers_is_a_syntax_error() {
        let err = Script::split("beep\non t\nend t", &ParseLimits::default()).unwrap_err();
        assert!(err.is_syntax());
    }

    #[test]
    fn cache_returns_the_same_split_for_identical_source() {
        let cache = ScriptCache::new();
        let limits = ParseLimits::default();
        let first = cache.script("on t\nbeep\nend t", &limits).unwrap();
        let second = cache.script("on t\nbeep\nend t", &limits).unwrap();
        assert!(StdArc::ptr_eq(&first, &second));
        cache.clear();
        let third = cache.script("on t\nbeep\nend t", &limits).unwrap();
        assert!(!StdArc::ptr_eq(&first, &third));
    }

    #[test]
    fn expr_statements_reject_conditions_missing_then() {
        let err = parse("on t\nif 1 = 1\nbeep\nend t").unwrap_err();
        assert!(err.rendered().contains("then"));
    }

    #[test]
    fn message_send_with_constant_argument() {
        let handler = parse("on t\ndoIt empty\nend t").unwrap();
        let StatementKind::Message { args, .. } = &handler.body[0].kind else {
            panic!();
        };
        assert!(matches!(args[0], Expr::Constant { .. }));
    }
}
