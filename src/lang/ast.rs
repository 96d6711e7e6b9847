//! Abstract syntax trees for expressions, statements, and handlers
//!
//! Reference nodes record which element accessor was selected at parse time
//! (index vs. name vs. id), so evaluation never re-inspects token types.

use std::sync::Arc;

use super::grammar::CommandDef;
use super::value::Variant;

/// Ordinal selectors accepted in object references (`the third card`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordinal {
    /// `first` … `tenth`, stored 1-based.
    Nth(u8),
    /// `last`
    Last,
    /// `middle` / `mid`
    Middle,
    /// `any` (random member)
    Any,
}

/// How a single element of a collection is selected.
#[derive(Debug, Clone)]
pub enum Selector {
    /// Positional index (`card 3`). Chosen when the selector token was
    /// numeric.
    Index(Box<Expr>),
    /// By name (`card "Home"`). Chosen when the selector token was a string
    /// or quoted word.
    Name(Box<Expr>),
    /// By unique id (`card id 42`).
    Id(Box<Expr>),
    /// By ordinal word (`the last card`).
    Ordinal(Ordinal),
    /// Contiguous range (`cards 2 to 5`).
    Range {
        /// First member, inclusive.
        from: Box<Expr>,
        /// Last member, inclusive.
        to: Box<Expr>,
    },
    /// The whole collection (plural form with no selector).
    All,
    /// The collection count (`the number of cards`).
    Count,
}

/// Unary operators, tightest-binding tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Negate,
    /// Logical `not`.
    Not,
    /// `there is a <object>`
    ThereIsA,
    /// `there is no <object>`
    ThereIsNo,
}

/// Binary operators. Grouped by precedence tier in the expression parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `^`
    Exponent,
    /// `*`
    Multiply,
    /// `/` (always yields a real)
    Divide,
    /// `mod` (integer remainder)
    Modulo,
    /// `div` (integer division)
    IntDivide,
    /// `+`
    Add,
    /// `-`
    Subtract,
    /// `&`
    Concat,
    /// `&&`
    ConcatSpace,
    /// `<`
    Less,
    /// `>`
    Greater,
    /// `<=`
    LessEq,
    /// `>=`
    GreaterEq,
    /// `contains`
    Contains,
    /// `is in`
    IsIn,
    /// `is not in`
    IsNotIn,
    /// `=` / `is`
    Equal,
    /// `<>` / `is not`
    NotEqual,
    /// `and`
    And,
    /// `or`
    Or,
}

/// An expression tree node.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Literal value (integer, real, boolean, or string).
    Literal(Variant),
    /// Unresolved single word; becomes a variable read (or its own name as a
    /// string when unset) at evaluation time.
    Variable(String),
    /// Registered constant, tagged during parsing.
    Constant {
        /// Constant name.
        name: String,
        /// Registered value.
        value: Variant,
    },
    /// Property access, `the <name> [of <object>]`.
    Property {
        /// Property name, lowercased.
        name: String,
        /// Owning object; a global/engine property when absent.
        object: Option<Box<Expr>>,
    },
    /// Object (collection element) reference.
    ObjectRef {
        /// Registered element word (singular form).
        element: String,
        /// Accessor selected at parse time.
        selector: Selector,
        /// Owner chain; rightmost `of`-target is the outermost owner.
        owner: Option<Box<Expr>>,
    },
    /// Function call, built-in or handler-defined.
    FunctionCall {
        /// Function name, lowercased.
        name: String,
        /// Argument expressions in order.
        args: Vec<Expr>,
    },
    /// Unary operation.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        operand: Box<Expr>,
    },
    /// Binary operation.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
}

/// One parameter of a matched command statement.
///
/// Unsupplied optional parameters are present with `value: None`, so command
/// implementations can tell "not given" from "given but empty".
#[derive(Debug, Clone)]
pub struct CommandArg {
    /// Declared parameter name.
    pub name: String,
    /// Parsed expression, or the captured choice word, or absent.
    pub value: ArgValue,
    /// Whether the parameter is evaluated lazily on demand.
    pub delayed: bool,
}

/// Payload of a command argument.
#[derive(Debug, Clone)]
pub enum ArgValue {
    /// Parameter expression.
    Expr(Expr),
    /// Captured choice word (from a `` `name` `` capture in the grammar).
    Word(String),
    /// Optional parameter that was not supplied.
    Absent,
}

impl ArgValue {
    /// The expression payload, if any.
    pub fn as_expr(&self) -> Option<&Expr> {
        match self {
            ArgValue::Expr(expr) => Some(expr),
            _ => None,
        }
    }

    /// The captured word payload, if any.
    pub fn as_word(&self) -> Option<&str> {
        match self {
            ArgValue::Word(word) => Some(word),
            _ => None,
        }
    }

    /// True when the parameter was not supplied.
    pub fn is_absent(&self) -> bool {
        matches!(self, ArgValue::Absent)
    }
}

/// Loop variants of `repeat`, with their 0–3 expression children.
#[derive(Debug, Clone)]
pub enum LoopKind {
    /// `repeat [forever]`
    Forever,
    /// `repeat [for] <count> [times]`
    Count(Expr),
    /// `repeat until <condition>`
    Until(Expr),
    /// `repeat while <condition>`
    While(Expr),
    /// `repeat with v = a to b`
    CountUp {
        /// Counter variable.
        var: String,
        /// Start bound.
        from: Expr,
        /// End bound, inclusive.
        to: Expr,
    },
    /// `repeat with v = a down to b`
    CountDown {
        /// Counter variable.
        var: String,
        /// Start bound.
        from: Expr,
        /// End bound, inclusive.
        to: Expr,
    },
}

/// One conditional arm: condition expression plus statement block.
#[derive(Debug, Clone)]
pub struct CondArm {
    /// Arm condition.
    pub condition: Expr,
    /// Statements run when the condition holds.
    pub body: Vec<Statement>,
}

/// Statement payload.
#[derive(Debug, Clone)]
pub enum StatementKind {
    /// Built-in command matched by the grammar.
    Command {
        /// Matched command definition.
        def: Arc<CommandDef>,
        /// Arguments in declaration order.
        args: Vec<CommandArg>,
    },
    /// Custom message send (a line no grammar matched): name plus
    /// comma-separated arguments.
    Message {
        /// Message name.
        name: String,
        /// Argument expressions.
        args: Vec<Expr>,
    },
    /// `if` with alternating condition/block arms and an optional default.
    If {
        /// Condition arms in order.
        arms: Vec<CondArm>,
        /// `else` block, if any.
        default: Option<Vec<Statement>>,
    },
    /// `repeat` loop.
    Repeat {
        /// Loop variant with its expressions.
        kind: LoopKind,
        /// Loop body.
        body: Vec<Statement>,
    },
    /// `global a, b, …`
    Global(Vec<String>),
    /// `exit <handlerName>`
    ExitHandler,
    /// `exit repeat`
    ExitRepeat,
    /// `next repeat`
    NextRepeat,
    /// `pass <handlerName>`, forwarding the message up the responder chain.
    Pass,
    /// `return [expr]`
    Return(Option<Expr>),
}

/// One statement, stamped with its true source line and checkpoint flag.
#[derive(Debug, Clone)]
pub struct Statement {
    /// Payload.
    pub kind: StatementKind,
    /// 1-based logical source line the statement begins on.
    pub line: u32,
    /// True when a debugger checkpoint falls within the physical-line range
    /// collapsed into this statement's logical line.
    pub checkpoint: bool,
}

/// Message vs. function handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// `on <name> … end <name>`
    Message,
    /// `function <name> … end <name>`
    Function,
}

/// A parsed handler.
#[derive(Debug, Clone)]
pub struct Handler {
    /// Handler kind.
    pub kind: HandlerKind,
    /// Handler name, lowercased.
    pub name: String,
    /// Declared parameter names in order.
    pub params: Vec<String>,
    /// Statement tree.
    pub body: Vec<Statement>,
    /// Logical line of the `on`/`function` line.
    pub line: u32,
}
