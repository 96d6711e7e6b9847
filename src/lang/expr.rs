//! Expression parser
//!
//! An ordered pipeline of rewriting passes over one token run, applied
//! recursively to parenthesized sub-runs first: parenthesis matching, synonym
//! substitution, property tagging, constant tagging, object-reference
//! tagging, function-call tagging, reference coalescing (ordinals, selectors,
//! `of`/`in` owner chains), and finally operator parsing by strict precedence
//! tiers. A validation step rejects anything left unresolved, naming the
//! offending construct.
//!
//! Passes rewrite a working item list built from the input slice; the input
//! tokens themselves are never mutated.

use std::sync::Arc;

use super::ast::{BinaryOp, Expr, Ordinal, Selector, UnaryOp};
use super::dict::Dictionary;
use super::error::{ScriptError, ScriptResult};
use super::lexer::{OpCode, Token, TokenKind};
use super::value::Variant;

/// Words with operator meaning; these never become variable reads.
const OPERATOR_WORDS: &[&str] = &[
    "and", "or", "not", "mod", "div", "contains", "is", "there",
];

/// Working item for the rewrite passes.
#[derive(Debug, Clone)]
enum Item {
    /// Unconsumed input token. `substituted` marks synonym-expansion output,
    /// which the synonym pass never re-examines.
    Tok { token: Token, substituted: bool },
    /// A finished expression node.
    Node { expr: Expr, line: u32 },
    /// Tagged element (collection) word awaiting its selector.
    Element {
        name: String,
        plural: bool,
        line: u32,
    },
    /// Parsed parenthesized argument list (function-call tail).
    Args { exprs: Vec<Expr>, line: u32 },
    /// Unary operator awaiting its operand.
    UnOp { op: UnaryOp, line: u32 },
    /// Binary operator awaiting its operands.
    BinOp { op: BinaryOp, line: u32 },
}

impl Item {
    fn line(&self) -> u32 {
        match self {
            Item::Tok { token, .. } => token.line,
            Item::Node { line, .. }
            | Item::Element { line, .. }
            | Item::Args { line, .. }
            | Item::UnOp { line, .. }
            | Item::BinOp { line, .. } => *line,
        }
    }

    /// The word payload when this is a word-like token.
    fn word(&self) -> Option<&str> {
        match self {
            Item::Tok { token, .. } => match &token.kind {
                TokenKind::Word(word) => Some(word),
                TokenKind::Of { word } => Some(word),
                _ => None,
            },
            _ => None,
        }
    }

    fn is_plain_word(&self, word: &str) -> bool {
        matches!(self, Item::Tok { token, .. } if matches!(&token.kind, TokenKind::Word(text) if text == word))
    }

    fn is_of_marker(&self) -> bool {
        matches!(
            self,
            Item::Tok {
                token: Token {
                    kind: TokenKind::Of { .. },
                    ..
                },
                ..
            }
        )
    }

    fn describe(&self) -> String {
        match self {
            Item::Tok { token, .. } => token.describe(),
            Item::Node { .. } => "expression".to_string(),
            Item::Element { name, .. } => format!("\"{}\"", name),
            Item::Args { .. } => "argument list".to_string(),
            Item::UnOp { .. } | Item::BinOp { .. } => "operator".to_string(),
        }
    }
}

/// Parse one token run (no newline tokens) into an expression tree.
pub fn parse_expression(tokens: &[Token], dict: &Dictionary) -> ScriptResult<Expr> {
    ExprParser { dict }.parse(tokens)
}

/// Parse a comma-separated list of expressions (message arguments).
pub fn parse_expression_list(tokens: &[Token], dict: &Dictionary) -> ScriptResult<Vec<Expr>> {
    if tokens.is_empty() {
        return Ok(Vec::new());
    }
    let mut exprs = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::OpenParen => depth += 1,
            TokenKind::CloseParen => depth = depth.saturating_sub(1),
            TokenKind::Comma if depth == 0 => {
                exprs.push(parse_expression(&tokens[start..idx], dict)?);
                start = idx + 1;
            }
            _ => {}
        }
    }
    exprs.push(parse_expression(&tokens[start..], dict)?);
    Ok(exprs)
}

struct ExprParser<'d> {
    dict: &'d Dictionary,
}

impl<'d> ExprParser<'d> {
    fn parse(&self, tokens: &[Token]) -> ScriptResult<Expr> {
        let line = tokens.first().map(|tok| tok.line).unwrap_or(0);
        if tokens.is_empty() {
            return Err(ScriptError::syntax("Expected an expression here.", line));
        }
        let mut items: Vec<Item> = tokens
            .iter()
            .map(|token| Item::Tok {
                token: token.clone(),
                substituted: false,
            })
            .collect();

        self.pass_parens(&mut items)?;
        self.pass_synonyms(&mut items);
        self.pass_properties(&mut items);
        self.pass_constants(&mut items);
        self.pass_elements(&mut items);
        self.pass_functions(&mut items)?;
        self.pass_coalesce(&mut items)?;
        self.pass_operators(&mut items)?;
        self.validate(items, line)
    }

    /// Pass 1: match parentheses; each group becomes either a nested
    /// expression node or, when it follows a callable word, an argument list.
    fn pass_parens(&self, items: &mut Vec<Item>) -> ScriptResult<()> {
        let mut idx = 0;
        while idx < items.len() {
            if !matches!(
                &items[idx],
                Item::Tok {
                    token: Token {
                        kind: TokenKind::OpenParen,
                        ..
                    },
                    ..
                }
            ) {
                idx += 1;
                continue;
            }
            let line = items[idx].line();
            let close = find_matching_paren(items, idx).ok_or_else(|| {
                ScriptError::syntax("Expected \")\" to match \"(\".", line)
            })?;

            let call_context = idx > 0
                && items[idx - 1]
                    .word()
                    .map(|word| !OPERATOR_WORDS.contains(&word) && word != "the")
                    .unwrap_or(false)
                && !items[idx - 1].is_of_marker();

            let inner: Vec<Token> = items[idx + 1..close]
                .iter()
                .filter_map(|item| match item {
                    Item::Tok { token, .. } => Some(token.clone()),
                    _ => None,
                })
                .collect();

            let replacement = if call_context {
                let exprs = if inner.is_empty() {
                    Vec::new()
                } else {
                    parse_expression_list(&inner, self.dict)?
                };
                Item::Args { exprs, line }
            } else {
                let expr = self.parse(&inner)?;
                Item::Node { expr, line }
            };
            items.splice(idx..=close, [replacement]);
            idx += 1;
        }
        // A stray closer is unbalanced.
        if let Some(item) = items.iter().find(|item| {
            matches!(
                item,
                Item::Tok {
                    token: Token {
                        kind: TokenKind::CloseParen,
                        ..
                    },
                    ..
                }
            )
        }) {
            return Err(ScriptError::syntax(
                "Found \")\" without a matching \"(\".",
                item.line(),
            ));
        }
        Ok(())
    }

    /// Pass 2: synonym expansion, longest word-sequence first, never
    /// re-entering already-substituted output.
    fn pass_synonyms(&self, items: &mut Vec<Item>) {
        let max = self.dict.max_word_count();
        let mut idx = 0;
        while idx < items.len() {
            let skip = matches!(&items[idx], Item::Tok { substituted, .. } if *substituted);
            if skip || items[idx].word().is_none() {
                idx += 1;
                continue;
            }
            let mut replaced = false;
            for len in (1..=max).rev() {
                let Some(joined) = join_words(&items[idx..], len) else {
                    continue;
                };
                if let Some(replacement) = self.dict.synonym(&joined) {
                    let line = items[idx].line();
                    let hard_line = match &items[idx] {
                        Item::Tok { token, .. } => token.hard_line,
                        _ => line,
                    };
                    let offset = match &items[idx] {
                        Item::Tok { token, .. } => token.offset,
                        _ => 0,
                    };
                    let new_items: Vec<Item> = replacement
                        .iter()
                        .map(|word| Item::Tok {
                            token: Token {
                                kind: TokenKind::Word(word.clone()),
                                offset,
                                hard_line,
                                line,
                            },
                            substituted: true,
                        })
                        .collect();
                    let count = new_items.len();
                    items.splice(idx..idx + len, new_items);
                    idx += count;
                    replaced = true;
                    break;
                }
            }
            if !replaced {
                idx += 1;
            }
        }
    }

    /// Pass 3: tag property names, but only in `the X` / `X of` position.
    fn pass_properties(&self, items: &mut Vec<Item>) {
        let max = self.dict.max_word_count();
        let mut idx = 0;
        while idx < items.len() {
            if items[idx].word().is_none() || items[idx].is_of_marker() {
                idx += 1;
                continue;
            }
            let mut advanced = false;
            for len in (1..=max).rev() {
                let Some(joined) = join_words(&items[idx..], len) else {
                    continue;
                };
                if !self.dict.is_property_name(&joined) {
                    continue;
                }
                // Element words double as property-ish nouns ("the number");
                // leave them for the reference pass.
                if self.dict.element(&joined).is_some() {
                    continue;
                }
                let preceded_by_the = idx > 0 && items[idx - 1].is_plain_word("the");
                let followed_by_of = items
                    .get(idx + len)
                    .map(Item::is_of_marker)
                    .unwrap_or(false);
                if !preceded_by_the && !followed_by_of {
                    continue;
                }
                // `the X` where X is a registered zero-argument function is a
                // call, not a property; the function pass owns it.
                if preceded_by_the && !followed_by_of && self.dict.function(&joined).is_some() {
                    continue;
                }
                let line = items[idx].line();
                let node = Item::Node {
                    expr: Expr::Property {
                        name: joined,
                        object: None,
                    },
                    line,
                };
                let start = if preceded_by_the { idx - 1 } else { idx };
                items.splice(start..idx + len, [node]);
                idx = start + 1;
                advanced = true;
                break;
            }
            if !advanced {
                idx += 1;
            }
        }
    }

    /// Pass 4: tag registered constants.
    fn pass_constants(&self, items: &mut Vec<Item>) {
        let max = self.dict.max_word_count();
        let mut idx = 0;
        while idx < items.len() {
            if items[idx].word().is_none() || items[idx].is_of_marker() {
                idx += 1;
                continue;
            }
            let mut advanced = false;
            for len in (1..=max).rev() {
                let Some(joined) = join_words(&items[idx..], len) else {
                    continue;
                };
                // A preceding "the" means a property or reference, not a
                // constant.
                if idx > 0 && items[idx - 1].is_plain_word("the") {
                    break;
                }
                if let Some(value) = self.dict.constant(&joined) {
                    let line = items[idx].line();
                    items.splice(
                        idx..idx + len,
                        [Item::Node {
                            expr: Expr::Constant {
                                name: joined,
                                value: value.clone(),
                            },
                            line,
                        }],
                    );
                    idx += 1;
                    advanced = true;
                    break;
                }
            }
            if !advanced {
                idx += 1;
            }
        }
    }

    /// Pass 5: tag registered element words (longest word-count match wins).
    fn pass_elements(&self, items: &mut Vec<Item>) {
        let max = self.dict.max_word_count();
        let mut idx = 0;
        while idx < items.len() {
            if items[idx].word().is_none() || items[idx].is_of_marker() {
                idx += 1;
                continue;
            }
            let mut advanced = false;
            for len in (1..=max).rev() {
                let Some(joined) = join_words(&items[idx..], len) else {
                    continue;
                };
                if let Some((def, plural)) = self.dict.element(&joined) {
                    let line = items[idx].line();
                    let name = def.singular.clone();
                    items.splice(idx..idx + len, [Item::Element { name, plural, line }]);
                    idx += 1;
                    advanced = true;
                    break;
                }
            }
            if !advanced {
                idx += 1;
            }
        }
    }

    /// Pass 6: tag function calls: `name(args)` and zero-argument `the name`.
    fn pass_functions(&self, items: &mut Vec<Item>) -> ScriptResult<()> {
        let mut idx = 0;
        while idx < items.len() {
            match &items[idx] {
                Item::Args { exprs, line } => {
                    let line = *line;
                    let Some(name) = items
                        .get(idx.wrapping_sub(1))
                        .and_then(Item::word)
                        .map(str::to_string)
                    else {
                        return Err(ScriptError::syntax(
                            "Expected a function name before the argument list.",
                            line,
                        ));
                    };
                    let args = exprs.clone();
                    items.splice(
                        idx - 1..=idx,
                        [Item::Node {
                            expr: Expr::FunctionCall { name, args },
                            line,
                        }],
                    );
                }
                Item::Tok { .. } => {
                    // `the <function>` with no arguments.
                    if items[idx].is_plain_word("the") {
                        if let Some(name) = items.get(idx + 1).and_then(Item::word) {
                            let followed_by_of = items
                                .get(idx + 2)
                                .map(Item::is_of_marker)
                                .unwrap_or(false);
                            if self.dict.function(name).is_some() && !followed_by_of {
                                let line = items[idx].line();
                                let name = name.to_string();
                                items.splice(
                                    idx..=idx + 1,
                                    [Item::Node {
                                        expr: Expr::FunctionCall {
                                            name,
                                            args: Vec::new(),
                                        },
                                        line,
                                    }],
                                );
                            }
                        }
                    }
                    // `the <function> of <operand>` single-argument form.
                    else if let Some(name) = items[idx].word() {
                        let followed_by_of = items
                            .get(idx + 1)
                            .map(Item::is_of_marker)
                            .unwrap_or(false);
                        if followed_by_of
                            && self.dict.function(name).is_some()
                            && !OPERATOR_WORDS.contains(&name)
                        {
                            let line = items[idx].line();
                            let name = name.to_string();
                            items[idx] = Item::Node {
                                expr: Expr::FunctionCall {
                                    name,
                                    args: Vec::new(),
                                },
                                line,
                            };
                        }
                    }
                    idx += 1;
                }
                _ => idx += 1,
            }
        }
        Ok(())
    }

    /// Pass 7: reference coalescing.
    ///
    /// Attaches ordinals, index/name/id selectors, and ranges to element
    /// words, resolves `the number of <plural>` into count references, and
    /// joins `of`/`in` chains into owner hierarchies (rightmost term is the
    /// outermost owner).
    fn pass_coalesce(&self, items: &mut Vec<Item>) -> ScriptResult<()> {
        self.coalesce_selectors(items)?;
        self.coalesce_counts(items);
        self.coalesce_owners(items)?;
        Ok(())
    }

    fn coalesce_selectors(&self, items: &mut Vec<Item>) -> ScriptResult<()> {
        let mut idx = 0;
        while idx < items.len() {
            let Item::Element { name, plural, line } = items[idx].clone() else {
                idx += 1;
                continue;
            };

            // Ordinal before the element word, optionally preceded by "the".
            let ordinal = items
                .get(idx.wrapping_sub(1))
                .and_then(Item::word)
                .and_then(ordinal_from_word);
            if idx > 0 {
                if let Some(ord) = ordinal {
                    let start = if idx >= 2 && items[idx - 2].is_plain_word("the") {
                        idx - 2
                    } else {
                        idx - 1
                    };
                    items.splice(
                        start..=idx,
                        [Item::Node {
                            expr: Expr::ObjectRef {
                                element: name,
                                selector: Selector::Ordinal(ord),
                                owner: None,
                            },
                            line,
                        }],
                    );
                    idx = start + 1;
                    continue;
                }
            }

            // Strip a plain preceding "the".
            if idx > 0 && items[idx - 1].is_plain_word("the") {
                items.remove(idx - 1);
                idx -= 1;
            }

            // Selector following the element word.
            let selector = self.selector_after(items, idx, plural, line)?;
            let (selector, consumed) = match selector {
                Some(pair) => pair,
                None if plural => (Selector::All, 0),
                None => {
                    return Err(ScriptError::syntax(
                        "Expected a name or number after \"%1\".",
                        line,
                    )
                    .with_arg(name));
                }
            };
            items.splice(
                idx..=idx + consumed,
                [Item::Node {
                    expr: Expr::ObjectRef {
                        element: name,
                        selector,
                        owner: None,
                    },
                    line,
                }],
            );
            idx += 1;
        }
        Ok(())
    }

    /// Examine the items after an element word and build its selector.
    /// Returns the selector plus how many following items it consumed.
    fn selector_after(
        &self,
        items: &[Item],
        idx: usize,
        plural: bool,
        line: u32,
    ) -> ScriptResult<Option<(Selector, usize)>> {
        // `<element> id <value>`
        if items
            .get(idx + 1)
            .map(|item| item.is_plain_word("id"))
            .unwrap_or(false)
        {
            let Some(value) = items.get(idx + 2).and_then(selector_operand) else {
                return Err(ScriptError::syntax(
                    "Expected an id after \"id\".",
                    line,
                ));
            };
            return Ok(Some((Selector::Id(Box::new(value)), 2)));
        }

        let Some(first) = items.get(idx + 1) else {
            return Ok(None);
        };
        let by_name = matches!(
            first,
            Item::Tok {
                token: Token {
                    kind: TokenKind::StringLit(_) | TokenKind::Word(_),
                    ..
                },
                ..
            }
        ) && first
            .word()
            .map(|word| !is_reserved_selector_word(word))
            .unwrap_or(true);
        let numeric = matches!(
            first,
            Item::Tok {
                token: Token {
                    kind: TokenKind::Integer(_),
                    ..
                },
                ..
            } | Item::Node { .. }
        );
        if !by_name && !numeric {
            return Ok(None);
        }
        let Some(value) = selector_operand(first) else {
            return Ok(None);
        };

        // `<plural> a to b` is a range.
        if plural
            && items
                .get(idx + 2)
                .map(|item| item.is_plain_word("to"))
                .unwrap_or(false)
        {
            let Some(end) = items.get(idx + 3).and_then(selector_operand) else {
                return Err(ScriptError::syntax(
                    "Expected the end of the range after \"to\".",
                    line,
                ));
            };
            return Ok(Some((
                Selector::Range {
                    from: Box::new(value),
                    to: Box::new(end),
                },
                3,
            )));
        }

        // The token type picks the accessor once, here at parse time:
        // numeric means by-index, string-ish means by-name.
        let selector = if numeric {
            Selector::Index(Box::new(value))
        } else {
            Selector::Name(Box::new(value))
        };
        Ok(Some((selector, 1)))
    }

    /// `the number of <plural element>` becomes a count reference.
    fn coalesce_counts(&self, items: &mut Vec<Item>) {
        let mut idx = 0;
        while idx + 2 < items.len() {
            let is_number = matches!(
                &items[idx],
                Item::Node {
                    expr: Expr::Property { name, object: None },
                    ..
                } if name == "number"
            );
            let has_of = items[idx + 1].is_of_marker();
            if is_number && has_of {
                if let Item::Node {
                    expr:
                        Expr::ObjectRef {
                            element,
                            selector: Selector::All,
                            owner: None,
                        },
                    line,
                } = items[idx + 2].clone()
                {
                    items.splice(
                        idx..=idx + 2,
                        [Item::Node {
                            expr: Expr::ObjectRef {
                                element,
                                selector: Selector::Count,
                                owner: None,
                            },
                            line,
                        }],
                    );
                    continue;
                }
            }
            idx += 1;
        }
    }

    /// Join `X of Y` chains. Processed rightmost-first so `a of b of c`
    /// attaches `c` as `b`'s owner before `b` becomes `a`'s owner.
    fn coalesce_owners(&self, items: &mut Vec<Item>) -> ScriptResult<()> {
        loop {
            let Some(idx) = items.iter().rposition(Item::is_of_marker) else {
                return Ok(());
            };
            let line = items[idx].line();
            if idx == 0 || idx + 1 >= items.len() {
                // A leading/trailing `in` may be operator context (`is in`);
                // leave it for the operator pass.
                return Ok(());
            }
            let left_is_node = matches!(items[idx - 1], Item::Node { .. });
            let right_is_node = matches!(items[idx + 1], Item::Node { .. });
            if !left_is_node || !right_is_node {
                // `is in` and friends keep their markers for the operator
                // pass; anything else fails validation later.
                return Ok(());
            }
            let Item::Node { expr: owner, .. } = items.remove(idx + 1) else {
                unreachable!()
            };
            items.remove(idx);
            let Item::Node { expr: accessed, .. } = items.remove(idx - 1) else {
                unreachable!()
            };
            let joined = attach_owner(accessed, owner, line)?;
            items.insert(
                idx - 1,
                Item::Node {
                    expr: joined,
                    line,
                },
            );
        }
    }

    /// Pass 8: operator parsing by precedence tiers.
    fn pass_operators(&self, items: &mut Vec<Item>) -> ScriptResult<()> {
        self.map_operator_tokens(items);
        self.convert_atoms(items)?;
        self.apply_unary(items)?;

        const TIERS: &[&[BinaryOp]] = &[
            &[BinaryOp::Exponent],
            &[
                BinaryOp::Multiply,
                BinaryOp::Divide,
                BinaryOp::Modulo,
                BinaryOp::IntDivide,
            ],
            &[BinaryOp::Add, BinaryOp::Subtract],
            &[BinaryOp::Concat, BinaryOp::ConcatSpace],
            &[
                BinaryOp::Less,
                BinaryOp::Greater,
                BinaryOp::LessEq,
                BinaryOp::GreaterEq,
                BinaryOp::Contains,
                BinaryOp::IsIn,
                BinaryOp::IsNotIn,
            ],
            &[BinaryOp::Equal, BinaryOp::NotEqual],
            &[BinaryOp::And],
            &[BinaryOp::Or],
        ];
        for tier in TIERS {
            self.apply_binary_tier(items, tier)?;
        }
        Ok(())
    }

    /// Map operator tokens and operator word sequences to UnOp/BinOp items.
    fn map_operator_tokens(&self, items: &mut Vec<Item>) {
        let mut idx = 0;
        while idx < items.len() {
            let line = items[idx].line();
            // Multi-word forms first.
            if items[idx].is_plain_word("there")
                && items
                    .get(idx + 1)
                    .map(|item| item.is_plain_word("is"))
                    .unwrap_or(false)
            {
                if let Some(third) = items.get(idx + 2).and_then(Item::word) {
                    let op = match third {
                        "a" | "an" => Some(UnaryOp::ThereIsA),
                        "no" => Some(UnaryOp::ThereIsNo),
                        _ => None,
                    };
                    if let Some(op) = op {
                        items.splice(idx..=idx + 2, [Item::UnOp { op, line }]);
                        idx += 1;
                        continue;
                    }
                }
            }
            if items[idx].is_plain_word("is") {
                let not_next = items
                    .get(idx + 1)
                    .map(|item| item.is_plain_word("not"))
                    .unwrap_or(false);
                let in_after = |offset: usize| {
                    items
                        .get(idx + offset)
                        .map(|item| {
                            matches!(
                                item,
                                Item::Tok {
                                    token: Token {
                                        kind: TokenKind::Of { word },
                                        ..
                                    },
                                    ..
                                } if word == "in"
                            )
                        })
                        .unwrap_or(false)
                };
                if not_next && in_after(2) {
                    items.splice(
                        idx..=idx + 2,
                        [Item::BinOp {
                            op: BinaryOp::IsNotIn,
                            line,
                        }],
                    );
                    idx += 1;
                    continue;
                }
                if in_after(1) {
                    items.splice(
                        idx..=idx + 1,
                        [Item::BinOp {
                            op: BinaryOp::IsIn,
                            line,
                        }],
                    );
                    idx += 1;
                    continue;
                }
                if not_next {
                    items.splice(
                        idx..=idx + 1,
                        [Item::BinOp {
                            op: BinaryOp::NotEqual,
                            line,
                        }],
                    );
                    idx += 1;
                    continue;
                }
                items[idx] = Item::BinOp {
                    op: BinaryOp::Equal,
                    line,
                };
                idx += 1;
                continue;
            }

            let mapped = match items[idx].word() {
                Some("and") => Some(Item::BinOp {
                    op: BinaryOp::And,
                    line,
                }),
                Some("or") => Some(Item::BinOp {
                    op: BinaryOp::Or,
                    line,
                }),
                Some("mod") => Some(Item::BinOp {
                    op: BinaryOp::Modulo,
                    line,
                }),
                Some("div") => Some(Item::BinOp {
                    op: BinaryOp::IntDivide,
                    line,
                }),
                Some("contains") => Some(Item::BinOp {
                    op: BinaryOp::Contains,
                    line,
                }),
                Some("not") => Some(Item::UnOp {
                    op: UnaryOp::Not,
                    line,
                }),
                _ => None,
            };
            if let Some(mapped) = mapped {
                if !items[idx].is_of_marker() {
                    items[idx] = mapped;
                    idx += 1;
                    continue;
                }
            }

            if let Item::Tok { token, .. } = &items[idx] {
                if let TokenKind::Operator(op) = &token.kind {
                    items[idx] = match op {
                        OpCode::Negate => Item::UnOp {
                            op: UnaryOp::Negate,
                            line,
                        },
                        OpCode::Add => Item::BinOp {
                            op: BinaryOp::Add,
                            line,
                        },
                        OpCode::Subtract => Item::BinOp {
                            op: BinaryOp::Subtract,
                            line,
                        },
                        OpCode::Multiply => Item::BinOp {
                            op: BinaryOp::Multiply,
                            line,
                        },
                        OpCode::Divide => Item::BinOp {
                            op: BinaryOp::Divide,
                            line,
                        },
                        OpCode::Exponent => Item::BinOp {
                            op: BinaryOp::Exponent,
                            line,
                        },
                        OpCode::Concat => Item::BinOp {
                            op: BinaryOp::Concat,
                            line,
                        },
                        OpCode::ConcatSpace => Item::BinOp {
                            op: BinaryOp::ConcatSpace,
                            line,
                        },
                        OpCode::Less => Item::BinOp {
                            op: BinaryOp::Less,
                            line,
                        },
                        OpCode::Greater => Item::BinOp {
                            op: BinaryOp::Greater,
                            line,
                        },
                        OpCode::LessEq => Item::BinOp {
                            op: BinaryOp::LessEq,
                            line,
                        },
                        OpCode::GreaterEq => Item::BinOp {
                            op: BinaryOp::GreaterEq,
                            line,
                        },
                        OpCode::Equal => Item::BinOp {
                            op: BinaryOp::Equal,
                            line,
                        },
                        OpCode::NotEqual => Item::BinOp {
                            op: BinaryOp::NotEqual,
                            line,
                        },
                    };
                }
            }
            idx += 1;
        }
    }

    /// Convert the remaining literal and word tokens into expression nodes.
    fn convert_atoms(&self, items: &mut Vec<Item>) -> ScriptResult<()> {
        for item in items.iter_mut() {
            let Item::Tok { token, .. } = item else {
                continue;
            };
            let line = token.line;
            let expr = match &token.kind {
                TokenKind::Integer(num) => Some(Expr::Literal(Variant::Integer(*num))),
                TokenKind::Real(num) => Some(Expr::Literal(Variant::Real(*num))),
                TokenKind::StringLit(text) => Some(Expr::Literal(Variant::Str(text.clone()))),
                TokenKind::Boolean(flag) => Some(Expr::Literal(Variant::Boolean(*flag))),
                TokenKind::Word(word) => Some(Expr::Variable(word.clone())),
                _ => None,
            };
            if let Some(expr) = expr {
                *item = Item::Node { expr, line };
            }
        }
        Ok(())
    }

    /// Unary tier, applied right-to-left so `not -x` nests correctly.
    fn apply_unary(&self, items: &mut Vec<Item>) -> ScriptResult<()> {
        let mut idx = items.len();
        while idx > 0 {
            idx -= 1;
            let Item::UnOp { op, line } = items[idx] else {
                continue;
            };
            let Some(Item::Node { expr, .. }) = items.get(idx + 1).cloned() else {
                return Err(ScriptError::syntax(
                    "Expected a value after this operator.",
                    line,
                ));
            };
            items.splice(
                idx..=idx + 1,
                [Item::Node {
                    expr: Expr::Unary {
                        op,
                        operand: Box::new(expr),
                    },
                    line,
                }],
            );
        }
        Ok(())
    }

    /// One left-to-right binary tier.
    fn apply_binary_tier(&self, items: &mut Vec<Item>, tier: &[BinaryOp]) -> ScriptResult<()> {
        let mut idx = 0;
        while idx < items.len() {
            let Item::BinOp { op, line } = items[idx] else {
                idx += 1;
                continue;
            };
            if !tier.contains(&op) {
                idx += 1;
                continue;
            }
            let lhs = match items.get(idx.wrapping_sub(1)) {
                Some(Item::Node { expr, .. }) if idx > 0 => expr.clone(),
                _ => {
                    return Err(ScriptError::syntax(
                        "Expected a value before \"%1\".",
                        line,
                    )
                    .with_arg(format!("{:?}", op)));
                }
            };
            let rhs = match items.get(idx + 1) {
                Some(Item::Node { expr, .. }) => expr.clone(),
                _ => {
                    return Err(ScriptError::syntax(
                        "Expected a value after \"%1\".",
                        line,
                    )
                    .with_arg(format!("{:?}", op)));
                }
            };
            items.splice(
                idx - 1..=idx + 1,
                [Item::Node {
                    expr: Expr::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    line,
                }],
            );
            // The merged node may be the left operand of the next operator
            // in the same tier.
        }
        Ok(())
    }

    /// Final validation: exactly one resolved node must remain.
    fn validate(&self, items: Vec<Item>, line: u32) -> ScriptResult<Expr> {
        let mut nodes = items.into_iter();
        match (nodes.next(), nodes.next()) {
            (Some(Item::Node { expr, .. }), None) => Ok(expr),
            (Some(first), Some(second)) => {
                let offender = if matches!(first, Item::Node { .. }) {
                    second
                } else {
                    first
                };
                Err(ScriptError::syntax(
                    "Can't understand %1 in this expression.",
                    offender.line(),
                )
                .with_arg(offender.describe()))
            }
            (Some(other), None) => Err(ScriptError::syntax(
                "Can't understand %1 in this expression.",
                other.line(),
            )
            .with_arg(other.describe())),
            (None, _) => Err(ScriptError::syntax("Expected an expression here.", line)),
        }
    }
}

/// Attach `owner` to the accessed node of an `of` chain.
fn attach_owner(accessed: Expr, owner: Expr, line: u32) -> ScriptResult<Expr> {
    match accessed {
        Expr::Property { name, object: None } => Ok(Expr::Property {
            name,
            object: Some(Box::new(owner)),
        }),
        Expr::Property {
            name,
            object: Some(existing),
        } => {
            // Chain continues through the existing owner.
            let inner = attach_owner(*existing, owner, line)?;
            Ok(Expr::Property {
                name,
                object: Some(Box::new(inner)),
            })
        }
        Expr::ObjectRef {
            element,
            selector,
            owner: None,
        } => Ok(Expr::ObjectRef {
            element,
            selector,
            owner: Some(Box::new(owner)),
        }),
        Expr::ObjectRef {
            element,
            selector,
            owner: Some(existing),
        } => {
            let inner = attach_owner(*existing, owner, line)?;
            Ok(Expr::ObjectRef {
                element,
                selector,
                owner: Some(Box::new(inner)),
            })
        }
        Expr::FunctionCall { name, mut args } => {
            // `the length of x` style single-argument calls.
            args.push(owner);
            Ok(Expr::FunctionCall { name, args })
        }
        other => Err(ScriptError::syntax(
            "\"%1\" can't have an owner.",
            line,
        )
        .with_arg(describe_expr(&other))),
    }
}

fn describe_expr(expr: &Expr) -> String {
    match expr {
        Expr::Literal(value) => value.to_string(),
        Expr::Variable(name) => name.clone(),
        Expr::Constant { name, .. } => name.clone(),
        Expr::Property { name, .. } => format!("the {}", name),
        Expr::ObjectRef { element, .. } => element.clone(),
        Expr::FunctionCall { name, .. } => format!("{}()", name),
        Expr::Unary { .. } | Expr::Binary { .. } => "operator expression".to_string(),
    }
}

fn find_matching_paren(items: &[Item], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, item) in items.iter().enumerate().skip(open) {
        if let Item::Tok { token, .. } = item {
            match token.kind {
                TokenKind::OpenParen => depth += 1,
                TokenKind::CloseParen => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(idx);
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// Join `len` consecutive word-like items starting at the slice head.
fn join_words(items: &[Item], len: usize) -> Option<String> {
    if items.len() < len {
        return None;
    }
    let mut parts = Vec::with_capacity(len);
    for item in &items[..len] {
        parts.push(item.word()?);
    }
    Some(parts.join(" "))
}

fn ordinal_from_word(word: &str) -> Option<Ordinal> {
    let ord = match word {
        "first" => Ordinal::Nth(1),
        "second" => Ordinal::Nth(2),
        "third" => Ordinal::Nth(3),
        "fourth" => Ordinal::Nth(4),
        "fifth" => Ordinal::Nth(5),
        "sixth" => Ordinal::Nth(6),
        "seventh" => Ordinal::Nth(7),
        "eighth" => Ordinal::Nth(8),
        "ninth" => Ordinal::Nth(9),
        "tenth" => Ordinal::Nth(10),
        "last" => Ordinal::Last,
        "middle" | "mid" => Ordinal::Middle,
        "any" => Ordinal::Any,
        _ => return None,
    };
    Some(ord)
}

fn is_reserved_selector_word(word: &str) -> bool {
    OPERATOR_WORDS.contains(&word) || matches!(word, "the" | "to" | "id" | "of" | "in")
}

/// Convert a selector candidate item into its expression.
fn selector_operand(item: &Item) -> Option<Expr> {
    match item {
        Item::Node { expr, .. } => Some(expr.clone()),
        Item::Tok { token, .. } => match &token.kind {
            TokenKind::Integer(num) => Some(Expr::Literal(Variant::Integer(*num))),
            TokenKind::StringLit(text) => Some(Expr::Literal(Variant::Str(text.clone()))),
            TokenKind::Word(word) if !is_reserved_selector_word(word) => {
                Some(Expr::Variable(word.clone()))
            }
            _ => None,
        },
        _ => None,
    }
}
