//! Coercing variant value model
//!
//! Every script value is a [`Variant`]: integers, reals, booleans, strings,
//! object references, property references, and delayed-evaluation thunks.
//! Conversions between number, string, and boolean are coercive; failures are
//! reported as runtime [`ScriptError`]s, never panics. Object variants own a
//! retained registry reference that is released exactly once on drop (the
//! owning [`HandleRef`] type implements that contract).

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use super::ast::Expr;
use super::error::{ScriptError, ScriptResult};
use crate::engine::handles::HandleRef;

/// A dynamically typed script value.
#[derive(Debug, Clone)]
pub enum Variant {
    /// Signed integer.
    Integer(i64),
    /// Double-precision real.
    Real(f64),
    /// Boolean.
    Boolean(bool),
    /// UTF-8 string. The empty string doubles as `empty`.
    Str(String),
    /// Reference to a host object; retained for the life of the variant.
    Object(HandleRef),
    /// Reference to a property of an object (or a global property when the
    /// object is absent). Resolved by the interpreter on demand.
    Property {
        /// Owning object, if any.
        object: Option<HandleRef>,
        /// Property name, lowercased.
        name: String,
    },
    /// Unevaluated expression for delayed-evaluation parameters.
    Thunk(Arc<Expr>),
}

impl Variant {
    /// The canonical empty value.
    pub fn empty() -> Self {
        Variant::Str(String::new())
    }

    /// True if this is the empty string.
    pub fn is_empty(&self) -> bool {
        matches!(self, Variant::Str(text) if text.is_empty())
    }

    /// A short name for the value's current type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Variant::Integer(_) => "integer",
            Variant::Real(_) => "number",
            Variant::Boolean(_) => "boolean",
            Variant::Str(_) => "string",
            Variant::Object(_) => "object",
            Variant::Property { .. } => "property",
            Variant::Thunk(_) => "expression",
        }
    }

    /// Coerce to an integer.
    ///
    /// Strings parse after trimming; reals convert only when they carry no
    /// fractional part.
    pub fn as_integer(&self, line: u32) -> ScriptResult<i64> {
        match self {
            Variant::Integer(num) => Ok(*num),
            Variant::Real(num) if num.fract() == 0.0 => Ok(*num as i64),
            Variant::Boolean(_) => Err(coercion_error(self, "integer", line)),
            Variant::Str(text) => {
                let trimmed = text.trim();
                if let Ok(num) = trimmed.parse::<i64>() {
                    return Ok(num);
                }
                if let Ok(num) = trimmed.parse::<f64>() {
                    if num.fract() == 0.0 {
                        return Ok(num as i64);
                    }
                }
                Err(coercion_error(self, "integer", line))
            }
            _ => Err(coercion_error(self, "integer", line)),
        }
    }

    /// Coerce to a real number.
    pub fn as_real(&self, line: u32) -> ScriptResult<f64> {
        match self {
            Variant::Integer(num) => Ok(*num as f64),
            Variant::Real(num) => Ok(*num),
            Variant::Str(text) => text
                .trim()
                .parse::<f64>()
                .map_err(|_| coercion_error(self, "number", line)),
            _ => Err(coercion_error(self, "number", line)),
        }
    }

    /// Coerce to a boolean. Only booleans and the strings `"true"`/`"false"`
    /// qualify.
    pub fn as_bool(&self, line: u32) -> ScriptResult<bool> {
        match self {
            Variant::Boolean(flag) => Ok(*flag),
            Variant::Str(text) => match text.trim().to_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(coercion_error(self, "true or false", line)),
            },
            _ => Err(coercion_error(self, "true or false", line)),
        }
    }

    /// Coerce to a string. Object references render their registry
    /// description; thunks and property references cannot be stringified
    /// without an evaluation context and report an error instead.
    pub fn as_string(&self, line: u32) -> ScriptResult<String> {
        match self {
            Variant::Integer(num) => Ok(num.to_string()),
            Variant::Real(num) => Ok(format_real(*num)),
            Variant::Boolean(flag) => Ok(flag.to_string()),
            Variant::Str(text) => Ok(text.clone()),
            Variant::Object(handle) => Ok(handle.description()),
            Variant::Property { .. } | Variant::Thunk(_) => {
                Err(coercion_error(self, "string", line))
            }
        }
    }

    /// The object payload, if any.
    pub fn as_object(&self) -> Option<&HandleRef> {
        match self {
            Variant::Object(handle) => Some(handle),
            _ => None,
        }
    }

    /// Attempt a numeric reading without raising an error.
    fn numeric(&self) -> Option<Numeric> {
        match self {
            Variant::Integer(num) => Some(Numeric::Integer(*num)),
            Variant::Real(num) => Some(Numeric::Real(*num)),
            Variant::Str(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return None;
                }
                if let Ok(num) = trimmed.parse::<i64>() {
                    return Some(Numeric::Integer(num));
                }
                trimmed.parse::<f64>().ok().map(Numeric::Real)
            }
            _ => None,
        }
    }

    /// Order two values after coercing both to a common comparable type:
    /// numbers when both read as numbers, booleans when both read as
    /// booleans, case-insensitive strings otherwise.
    pub fn compare(&self, other: &Variant, line: u32) -> ScriptResult<Ordering> {
        if let (Some(lhs), Some(rhs)) = (self.numeric(), other.numeric()) {
            return Ok(lhs.compare(rhs));
        }
        if let (Variant::Boolean(lhs), Variant::Boolean(rhs)) = (self, other) {
            return Ok(lhs.cmp(rhs));
        }
        let lhs = self.as_string(line)?.to_lowercase();
        let rhs = other.as_string(line)?.to_lowercase();
        Ok(lhs.cmp(&rhs))
    }

    /// Equality under the same coercion rules as [`Variant::compare`], plus
    /// object identity for two object references.
    pub fn equals(&self, other: &Variant, line: u32) -> ScriptResult<bool> {
        if let (Variant::Object(lhs), Variant::Object(rhs)) = (self, other) {
            return Ok(lhs.same_object(rhs));
        }
        Ok(self.compare(other, line)? == Ordering::Equal)
    }
}

impl fmt::Display for Variant {
    /// `Display` cannot report coercion errors; unresolved references render
    /// as placeholders.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_string(0) {
            Ok(text) => write!(f, "{}", text),
            Err(_) => write!(f, "<{}>", self.type_name()),
        }
    }
}

impl From<i64> for Variant {
    fn from(num: i64) -> Self {
        Variant::Integer(num)
    }
}

impl From<f64> for Variant {
    fn from(num: f64) -> Self {
        Variant::Real(num)
    }
}

impl From<bool> for Variant {
    fn from(flag: bool) -> Self {
        Variant::Boolean(flag)
    }
}

impl From<String> for Variant {
    fn from(text: String) -> Self {
        Variant::Str(text)
    }
}

impl From<&str> for Variant {
    fn from(text: &str) -> Self {
        Variant::Str(text.to_string())
    }
}

#[derive(Clone, Copy)]
enum Numeric {
    Integer(i64),
    Real(f64),
}

impl Numeric {
    fn compare(self, other: Numeric) -> Ordering {
        match (self, other) {
            (Numeric::Integer(lhs), Numeric::Integer(rhs)) => lhs.cmp(&rhs),
            (lhs, rhs) => lhs
                .as_real()
                .partial_cmp(&rhs.as_real())
                .unwrap_or(Ordering::Equal),
        }
    }

    fn as_real(self) -> f64 {
        match self {
            Numeric::Integer(num) => num as f64,
            Numeric::Real(num) => num,
        }
    }
}

/// Render a real the way scripts expect: a value that came from real
/// arithmetic keeps its decimal point, so `7.0` renders as `"7.0"` and
/// `3.25` as `"3.25"`.
pub fn format_real(num: f64) -> String {
    if num.fract() == 0.0 && num.is_finite() {
        format!("{:.1}", num)
    } else {
        num.to_string()
    }
}

fn coercion_error(value: &Variant, wanted: &str, line: u32) -> ScriptError {
    ScriptError::runtime("Expected %1 here but found %2.", line)
        .with_arg(wanted)
        .with_arg(value.type_name())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_coerce_to_integers() {
        assert_eq!(Variant::from(" 42 ").as_integer(1).unwrap(), 42);
        assert_eq!(Variant::from("7.0").as_integer(1).unwrap(), 7);
        assert!(Variant::from("7.5").as_integer(1).is_err());
        assert!(Variant::from("seven").as_integer(1).is_err());
    }

    #[test]
    fn strings_coerce_to_reals_and_bools() {
        assert_eq!(Variant::from("3.25").as_real(1).unwrap(), 3.25);
        assert!(Variant::from("TRUE").as_bool(1).unwrap());
        assert!(Variant::from("maybe").as_bool(1).is_err());
    }

    #[test]
    fn integral_reals_render_with_decimal() {
        assert_eq!(Variant::Real(7.0).as_string(1).unwrap(), "7.0");
        assert_eq!(Variant::Real(3.25).as_string(1).unwrap(), "3.25");
        assert_eq!(Variant::Integer(7).as_string(1).unwrap(), "7");
    }

    #[test]
    fn comparison_coerces_to_a_common_type() {
        let lhs = Variant::from("10");
        let rhs = Variant::from(9i64);
        // Numeric, not lexicographic: "10" > 9.
        assert_eq!(lhs.compare(&rhs, 1).unwrap(), Ordering::Greater);

        let lhs = Variant::from("Apple");
        let rhs = Variant::from("apple");
        assert!(lhs.equals(&rhs, 1).unwrap());
    }

    #[test]
    fn empty_value_reads_as_empty_string() {
        let value = Variant::empty();
        assert!(value.is_empty());
        assert_eq!(value.as_string(1).unwrap(), "");
    }
}
