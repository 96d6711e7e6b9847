//! Lexer: UTF-8 source text to a flat token list
//!
//! Tokens carry their byte offset plus both the hard (physical) and logical
//! line number; the `¬` continuation character joins the following physical
//! line into the same logical line. A `--` sequence starts a comment running
//! to end of line. The ambiguous `-` is resolved here, at lex time, into
//! subtract vs. negate based on the preceding token.

use std::fmt;

use super::ParseLimits;
use super::error::{ScriptError, ScriptResult};

/// Line-continuation character (joins the next physical line).
pub const CONTINUATION_CHAR: char = '¬';

/// Symbolic operator codes produced by the lexer.
///
/// Word operators (`and`, `or`, `mod`, `div`, `contains`, …) are lexed as
/// plain words and recognized later by the expression parser's operator pass;
/// only operators spelled with punctuation are classified here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// `+`
    Add,
    /// Binary `-`
    Subtract,
    /// Unary `-`
    Negate,
    /// `*`
    Multiply,
    /// `/`
    Divide,
    /// `^`
    Exponent,
    /// `&` string concatenation
    Concat,
    /// `&&` concatenation with a single joining space
    ConcatSpace,
    /// `<`
    Less,
    /// `>`
    Greater,
    /// `<=` or `≤`
    LessEq,
    /// `>=` or `≥`
    GreaterEq,
    /// `=`
    Equal,
    /// `<>` or `≠`
    NotEqual,
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OpCode::Add => "+",
            OpCode::Subtract | OpCode::Negate => "-",
            OpCode::Multiply => "*",
            OpCode::Divide => "/",
            OpCode::Exponent => "^",
            OpCode::Concat => "&",
            OpCode::ConcatSpace => "&&",
            OpCode::Less => "<",
            OpCode::Greater => ">",
            OpCode::LessEq => "<=",
            OpCode::GreaterEq => ">=",
            OpCode::Equal => "=",
            OpCode::NotEqual => "<>",
        };
        write!(f, "{}", text)
    }
}

/// Token payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Identifier or unquoted word (stored lowercased; scripts are
    /// case-insensitive).
    Word(String),
    /// Integer literal.
    Integer(i64),
    /// Real literal.
    Real(f64),
    /// Quoted string literal.
    StringLit(String),
    /// `true` / `false`.
    Boolean(bool),
    /// Punctuation operator.
    Operator(OpCode),
    /// `(`
    OpenParen,
    /// `)`
    CloseParen,
    /// `,`
    Comma,
    /// End of a logical line.
    Newline,
    /// Ownership marker: the words `of` and `in`.
    Of {
        /// The original word, `"of"` or `"in"`.
        word: String,
    },
}

impl TokenKind {
    /// The word payload, if this token is a plain word.
    pub fn as_word(&self) -> Option<&str> {
        match self {
            TokenKind::Word(word) => Some(word.as_str()),
            _ => None,
        }
    }
}

/// One lexed token with source positioning.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// Payload.
    pub kind: TokenKind,
    /// Byte offset of the first byte of the token in the source.
    pub offset: usize,
    /// 1-based physical source line.
    pub hard_line: u32,
    /// 1-based logical line (continuation-joined lines share one).
    pub line: u32,
}

impl Token {
    /// True if this token is the given (lowercase) word.
    pub fn is_word(&self, word: &str) -> bool {
        matches!(&self.kind, TokenKind::Word(text) if text == word)
    }

    /// The word payload, if any.
    pub fn word(&self) -> Option<&str> {
        self.kind.as_word()
    }

    /// Human-readable description used in syntax error messages.
    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Word(word) => format!("\"{}\"", word),
            TokenKind::Integer(num) => num.to_string(),
            TokenKind::Real(num) => num.to_string(),
            TokenKind::StringLit(text) => format!("\"{}\"", text),
            TokenKind::Boolean(flag) => flag.to_string(),
            TokenKind::Operator(op) => format!("\"{}\"", op),
            TokenKind::OpenParen => "\"(\"".to_string(),
            TokenKind::CloseParen => "\")\"".to_string(),
            TokenKind::Comma => "\",\"".to_string(),
            TokenKind::Newline => "end of line".to_string(),
            TokenKind::Of { word } => format!("\"{}\"", word),
        }
    }
}

/// Streaming lexer over one script source.
pub struct Lexer<'a> {
    src: &'a str,
    limits: &'a ParseLimits,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    hard_line: u32,
    line: u32,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    /// Create a lexer over `src` with the given limits.
    pub fn new(src: &'a str, limits: &'a ParseLimits) -> Self {
        Self {
            src,
            limits,
            chars: src.char_indices().peekable(),
            hard_line: 1,
            line: 1,
            tokens: Vec::new(),
        }
    }

    /// Lex the whole source into a token list.
    ///
    /// The result always ends with a [`TokenKind::Newline`] so line-oriented
    /// consumers never have to special-case the final line.
    pub fn lex(mut self) -> ScriptResult<Vec<Token>> {
        while let Some(&(offset, ch)) = self.chars.peek() {
            match ch {
                ' ' | '\t' => {
                    self.chars.next();
                }
                '\r' => {
                    self.chars.next();
                    // Treat a bare CR like LF; CRLF collapses to one newline.
                    if !matches!(self.chars.peek(), Some(&(_, '\n'))) {
                        self.emit_newline(offset);
                    }
                }
                '\n' => {
                    self.chars.next();
                    self.emit_newline(offset);
                }
                CONTINUATION_CHAR => {
                    self.chars.next();
                    self.consume_continuation(offset)?;
                }
                '"' => self.lex_string(offset)?,
                '-' => self.lex_minus_or_comment(offset),
                c if c.is_ascii_digit() => self.lex_number(offset)?,
                c if is_word_start(c) => self.lex_word(offset)?,
                _ => self.lex_punctuation(offset, ch)?,
            }
        }

        let end = self.src.len();
        if !matches!(
            self.tokens.last(),
            Some(Token {
                kind: TokenKind::Newline,
                ..
            }) | None
        ) {
            self.push(TokenKind::Newline, end);
        }
        Ok(self.tokens)
    }

    fn push(&mut self, kind: TokenKind, offset: usize) {
        self.tokens.push(Token {
            kind,
            offset,
            hard_line: self.hard_line,
            line: self.line,
        });
    }

    fn emit_newline(&mut self, offset: usize) {
        // Collapse runs of newlines after a continuation-free line into
        // individual Newline tokens; blank lines matter to the handler
        // parser (they close a dangling single-line `then`).
        self.push(TokenKind::Newline, offset);
        self.hard_line += 1;
        self.line = self.hard_line;
    }

    /// After `¬`: skip trailing whitespace, then the physical line break,
    /// without emitting a newline token. The logical line stays put.
    fn consume_continuation(&mut self, offset: usize) -> ScriptResult<()> {
        while let Some(&(_, ch)) = self.chars.peek() {
            match ch {
                ' ' | '\t' | '\r' => {
                    self.chars.next();
                }
                '\n' => {
                    self.chars.next();
                    self.hard_line += 1;
                    return Ok(());
                }
                _ => {
                    return Err(ScriptError::syntax(
                        "Expected end of line after the continuation character.",
                        self.hard_line,
                    ));
                }
            }
        }
        // Continuation at end of source: nothing left to join.
        let _ = offset;
        Ok(())
    }

    fn lex_string(&mut self, offset: usize) -> ScriptResult<()> {
        self.chars.next(); // opening quote
        let mut text = String::new();
        loop {
            match self.chars.next() {
                Some((_, '"')) => break,
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, '"')) => text.push('"'),
                    Some((_, '\\')) => text.push('\\'),
                    Some((_, other)) => {
                        text.push('\\');
                        text.push(other);
                    }
                    None => {
                        return Err(ScriptError::syntax(
                            "Expected closing quote before end of script.",
                            self.hard_line,
                        ));
                    }
                },
                Some((_, '\n')) | None => {
                    return Err(ScriptError::syntax(
                        "Expected closing quote before end of line.",
                        self.hard_line,
                    ));
                }
                Some((_, ch)) => text.push(ch),
            }
            if text.len() > self.limits.max_string_len {
                return Err(ScriptError::syntax(
                    "String constant is too long (longer than %1 bytes).",
                    self.hard_line,
                )
                .with_arg(self.limits.max_string_len.to_string()));
            }
        }
        self.push(TokenKind::StringLit(text), offset);
        Ok(())
    }

    /// `--` starts a comment; otherwise classify `-` as subtract or negate
    /// from the token that precedes it.
    fn lex_minus_or_comment(&mut self, offset: usize) {
        self.chars.next();
        if matches!(self.chars.peek(), Some(&(_, '-'))) {
            while let Some(&(_, ch)) = self.chars.peek() {
                if ch == '\n' {
                    break;
                }
                self.chars.next();
            }
            return;
        }

        let negate = match self.tokens.last().map(|tok| &tok.kind) {
            None
            | Some(TokenKind::Operator(_))
            | Some(TokenKind::OpenParen)
            | Some(TokenKind::Newline)
            | Some(TokenKind::Comma)
            | Some(TokenKind::Of { .. }) => true,
            _ => false,
        };
        let op = if negate {
            OpCode::Negate
        } else {
            OpCode::Subtract
        };
        self.push(TokenKind::Operator(op), offset);
    }

    fn lex_number(&mut self, offset: usize) -> ScriptResult<()> {
        let mut end = offset;
        let mut is_real = false;
        while let Some(&(idx, ch)) = self.chars.peek() {
            if ch.is_ascii_digit() {
                end = idx + ch.len_utf8();
                self.chars.next();
            } else if ch == '.' && !is_real {
                // At most one decimal point, and only when digits follow.
                let mut lookahead = self.chars.clone();
                lookahead.next();
                match lookahead.peek() {
                    Some(&(_, next)) if next.is_ascii_digit() => {
                        is_real = true;
                        end = idx + 1;
                        self.chars.next();
                    }
                    _ => break,
                }
            } else {
                break;
            }
        }

        let text = &self.src[offset..end];
        let kind = if is_real {
            match text.parse::<f64>() {
                Ok(num) => TokenKind::Real(num),
                Err(_) => {
                    return Err(ScriptError::syntax("Invalid number \"%1\".", self.hard_line)
                        .with_arg(text));
                }
            }
        } else {
            match text.parse::<i64>() {
                Ok(num) => TokenKind::Integer(num),
                Err(_) => {
                    return Err(ScriptError::syntax("Invalid number \"%1\".", self.hard_line)
                        .with_arg(text));
                }
            }
        };
        self.push(kind, offset);
        Ok(())
    }

    fn lex_word(&mut self, offset: usize) -> ScriptResult<()> {
        let mut end = offset;
        while let Some(&(idx, ch)) = self.chars.peek() {
            if is_word_char(ch) {
                end = idx + ch.len_utf8();
                self.chars.next();
            } else {
                break;
            }
        }
        let text = &self.src[offset..end];
        if text.len() > self.limits.max_identifier_len {
            return Err(ScriptError::syntax(
                "Identifier is too long (longer than %1 bytes).",
                self.hard_line,
            )
            .with_arg(self.limits.max_identifier_len.to_string()));
        }
        let lowered = text.to_lowercase();
        let kind = match lowered.as_str() {
            "true" => TokenKind::Boolean(true),
            "false" => TokenKind::Boolean(false),
            "of" | "in" => TokenKind::Of { word: lowered },
            _ => TokenKind::Word(lowered),
        };
        self.push(kind, offset);
        Ok(())
    }

    fn lex_punctuation(&mut self, offset: usize, ch: char) -> ScriptResult<()> {
        self.chars.next();
        let kind = match ch {
            '(' => TokenKind::OpenParen,
            ')' => TokenKind::CloseParen,
            ',' => TokenKind::Comma,
            '+' => TokenKind::Operator(OpCode::Add),
            '*' => TokenKind::Operator(OpCode::Multiply),
            '/' => TokenKind::Operator(OpCode::Divide),
            '^' => TokenKind::Operator(OpCode::Exponent),
            '=' => TokenKind::Operator(OpCode::Equal),
            '≤' => TokenKind::Operator(OpCode::LessEq),
            '≥' => TokenKind::Operator(OpCode::GreaterEq),
            '≠' => TokenKind::Operator(OpCode::NotEqual),
            '&' => {
                if matches!(self.chars.peek(), Some(&(_, '&'))) {
                    self.chars.next();
                    TokenKind::Operator(OpCode::ConcatSpace)
                } else {
                    TokenKind::Operator(OpCode::Concat)
                }
            }
            '<' => match self.chars.peek() {
                Some(&(_, '=')) => {
                    self.chars.next();
                    TokenKind::Operator(OpCode::LessEq)
                }
                Some(&(_, '>')) => {
                    self.chars.next();
                    TokenKind::Operator(OpCode::NotEqual)
                }
                _ => TokenKind::Operator(OpCode::Less),
            },
            '>' => {
                if matches!(self.chars.peek(), Some(&(_, '='))) {
                    self.chars.next();
                    TokenKind::Operator(OpCode::GreaterEq)
                } else {
                    TokenKind::Operator(OpCode::Greater)
                }
            }
            other => {
                return Err(
                    ScriptError::syntax("Unexpected character \"%1\".", self.hard_line)
                        .with_arg(other.to_string()),
                );
            }
        };
        self.push(kind, offset);
        Ok(())
    }
}

fn is_word_start(ch: char) -> bool {
    ch.is_alphabetic() || ch == '_'
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

/// Lex a source string with the given limits.
pub fn lex(src: &str, limits: &ParseLimits) -> ScriptResult<Vec<Token>> {
    Lexer::new(src, limits).lex()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_ok(src: &str) -> Vec<Token> {
        lex(src, &ParseLimits::default()).expect("lex")
    }

    fn kinds(src: &str) -> Vec<TokenKind> {
        lex_ok(src).into_iter().map(|tok| tok.kind).collect()
    }

    #[test]
    fn lexes_words_and_numbers() {
        assert_eq!(
            kinds("put 3 into x"),
            vec![
                TokenKind::Word("put".into()),
                TokenKind::Integer(3),
                TokenKind::Word("into".into()),
                TokenKind::Word("x".into()),
                TokenKind::Newline,
            ]
        );
    }

    #[test]
    fn lexes_real_with_single_decimal_point() {
        assert_eq!(
            kinds("3.25"),
            vec![TokenKind::Real(3.25), TokenKind::Newline]
        );
        // A second dot terminates the number.
        assert!(matches!(kinds("1.2.3")[0], TokenKind::Real(_)));
    }

    #[test]
    fn words_are_lowercased() {
        assert_eq!(
            kinds("PUT X")[0],
            TokenKind::Word("put".into()),
        );
    }

    #[test]
    fn minus_after_value_subtracts() {
        let toks = kinds("5 - 3");
        assert_eq!(toks[1], TokenKind::Operator(OpCode::Subtract));
    }

    #[test]
    fn minus_after_operator_comma_paren_or_start_negates() {
        assert_eq!(kinds("-3")[0], TokenKind::Operator(OpCode::Negate));
        assert_eq!(kinds("2 * -3")[2], TokenKind::Operator(OpCode::Negate));
        assert_eq!(kinds("(-3")[1], TokenKind::Operator(OpCode::Negate));
        assert_eq!(kinds("f(1, -3")[4], TokenKind::Operator(OpCode::Negate));
    }

    #[test]
    fn comment_runs_to_end_of_line() {
        assert_eq!(
            kinds("beep -- ignored\nbeep"),
            vec![
                TokenKind::Word("beep".into()),
                TokenKind::Newline,
                TokenKind::Word("beep".into()),
                TokenKind::Newline,
            ]
        );
    }

    #[test]
    fn continuation_joins_logical_lines() {
        let toks = lex_ok("put 3 ¬\n into x");
        assert!(toks.iter().all(|tok| tok.line == 1));
        assert_eq!(toks.last().unwrap().kind, TokenKind::Newline);
        // Hard lines still advance.
        let into = toks.iter().find(|tok| tok.is_word("into")).unwrap();
        assert_eq!(into.hard_line, 2);
    }

    #[test]
    fn unicode_comparison_operators() {
        let toks = kinds("a ≤ b ≥ c ≠ d");
        assert_eq!(toks[1], TokenKind::Operator(OpCode::LessEq));
        assert_eq!(toks[3], TokenKind::Operator(OpCode::GreaterEq));
        assert_eq!(toks[5], TokenKind::Operator(OpCode::NotEqual));
    }

    #[test]
    fn unterminated_string_is_a_syntax_error() {
        let err = lex("put \"abc", &ParseLimits::default()).unwrap_err();
        assert!(err.is_syntax());
    }

    #[test]
    fn overlong_identifier_is_a_syntax_error() {
        let limits = ParseLimits {
            max_identifier_len: 4,
            ..ParseLimits::default()
        };
        let err = lex("abcdef", &limits).unwrap_err();
        assert!(err.rendered().contains("too long"));
    }

    #[test]
    fn of_and_in_become_markers() {
        assert_eq!(
            kinds("x of y")[1],
            TokenKind::Of { word: "of".into() }
        );
        assert_eq!(
            kinds("x in y")[1],
            TokenKind::Of { word: "in".into() }
        );
    }

    #[test]
    fn blank_lines_produce_newline_tokens() {
        let toks = kinds("beep\n\nbeep");
        let newlines = toks
            .iter()
            .filter(|kind| matches!(kind, TokenKind::Newline))
            .count();
        assert_eq!(newlines, 3);
    }
}
