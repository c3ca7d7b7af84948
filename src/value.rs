// File: src/value.rs
//
// Runtime value types for the Strand programming language.
// A tagged union over every kind of value the VM manipulates, plus the
// numeric model (integer/double promotion, `int_if_possible`, absorbing nil),
// truthiness, structural equality and display formatting.

use crate::fiber::{Closure, FiberId};
use crate::runtime::natives::NativeFunction;
use crate::runtime::object::{Instance, MapKey, SClass, Storage};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Dynamically-typed runtime value
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Int(i64),
    Double(f64),
    Str(Rc<str>),
    Closure(Rc<Closure>),
    /// A method closure bound to its receiver
    Method(Rc<BoundMethod>),
    /// A native function, bound to its receiver (nil for module-level natives)
    Native(Rc<BoundNative>),
    Class(Rc<SClass>),
    Instance(Rc<RefCell<Instance>>),
    Fiber(FiberId),
    /// Half-open integer range `start..end`
    Range(i64, i64),
}

pub struct BoundMethod {
    pub receiver: Value,
    pub closure: Rc<Closure>,
}

pub struct BoundNative {
    pub receiver: Value,
    pub native: Rc<NativeFunction>,
}

/// Binary arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithOp {
    fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        }
    }
}

/// Ordering comparisons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn bool(b: bool) -> Value {
        Value::Int(b as i64)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// nil, integer 0 and double 0.0 are false; everything else is true
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Int(n) => *n != 0,
            Value::Double(d) => *d != 0.0,
            _ => true,
        }
    }

    /// Name of the well-known class describing this value
    pub fn type_name(&self) -> String {
        match self {
            Value::Nil => "Nil".to_string(),
            Value::Int(_) => "Int".to_string(),
            Value::Double(_) => "Double".to_string(),
            Value::Str(_) => "String".to_string(),
            Value::Closure(_) | Value::Method(_) | Value::Native(_) => "Function".to_string(),
            Value::Class(_) => "Class".to_string(),
            Value::Instance(inst) => inst.borrow().class.name.to_string(),
            Value::Fiber(_) => "Fiber".to_string(),
            Value::Range(..) => "Range".to_string(),
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Closure(_) | Value::Method(_) | Value::Native(_) | Value::Class(_))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Structural value equality. Instances compare by class identity and
    /// field/element contents; closures, natives and classes by identity.
    pub fn structural_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Int(a), Value::Double(b)) | (Value::Double(b), Value::Int(a)) => *a as f64 == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Range(a1, a2), Value::Range(b1, b2)) => a1 == b1 && a2 == b2,
            (Value::Fiber(a), Value::Fiber(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Method(a), Value::Method(b)) => {
                Rc::ptr_eq(&a.closure, &b.closure) && a.receiver.structural_eq(&b.receiver)
            }
            (Value::Native(a), Value::Native(b)) => {
                Rc::ptr_eq(&a.native, &b.native) && a.receiver.structural_eq(&b.receiver)
            }
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                Rc::ptr_eq(&a.class, &b.class)
                    && a.fields.len() == b.fields.len()
                    && a.fields.iter().all(|(k, v)| b.fields.get(k).is_some_and(|w| v.structural_eq(w)))
                    && storage_eq(&a.storage, &b.storage)
            }
            _ => false,
        }
    }
}

fn storage_eq(a: &Storage, b: &Storage) -> bool {
    match (a, b) {
        (Storage::Plain, Storage::Plain) => true,
        (Storage::List(x), Storage::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| p.structural_eq(q))
        }
        (Storage::Map(x), Storage::Map(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| v.structural_eq(w)))
        }
        _ => false,
    }
}

/// Stores an exact double as an integer, otherwise keeps it as a double
pub fn int_if_possible(d: f64) -> Value {
    // 2^63 is exactly representable; anything at or above it overflows i64
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if d.is_finite() && d == d.round() && d >= -LIMIT && d < LIMIT {
        Value::Int(d as i64)
    } else {
        Value::Double(d)
    }
}

/// Polymorphic binary arithmetic. Nil is absorbing; `Err` carries the
/// message of a language-level IllegalArgument error.
pub fn arithmetic(op: ArithOp, left: &Value, right: &Value) -> Result<Value, String> {
    if left.is_nil() || right.is_nil() {
        return Ok(Value::Nil);
    }

    match (left, right) {
        (Value::Int(a), Value::Int(b)) => match op {
            ArithOp::Add => Ok(Value::Int(a.wrapping_add(*b))),
            ArithOp::Sub => Ok(Value::Int(a.wrapping_sub(*b))),
            ArithOp::Mul => Ok(Value::Int(a.wrapping_mul(*b))),
            ArithOp::Div => Ok(int_if_possible(*a as f64 / *b as f64)),
            ArithOp::Mod => {
                if *b == 0 {
                    Err("Modulo by zero".to_string())
                } else {
                    Ok(Value::Int(a.wrapping_rem(*b)))
                }
            }
        },
        (Value::Int(_) | Value::Double(_), Value::Int(_) | Value::Double(_)) => {
            let a = to_f64(left);
            let b = to_f64(right);
            Ok(Value::Double(match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div => a / b,
                ArithOp::Mod => a % b,
            }))
        }
        (Value::Str(_), _) | (_, Value::Str(_)) if op == ArithOp::Add => {
            Ok(Value::Str(Rc::from(format!("{}{}", left, right))))
        }
        _ => Err(format!(
            "Unsupported operand types for {}: {} and {}",
            op.symbol(),
            left.type_name(),
            right.type_name()
        )),
    }
}

fn to_f64(value: &Value) -> f64 {
    match value {
        Value::Int(n) => *n as f64,
        Value::Double(d) => *d,
        _ => f64::NAN,
    }
}

/// Unary minus; nil stays nil
pub fn negate(value: &Value) -> Result<Value, String> {
    match value {
        Value::Nil => Ok(Value::Nil),
        Value::Int(n) => Ok(Value::Int(n.wrapping_neg())),
        Value::Double(d) => Ok(Value::Double(-d)),
        other => Err(format!("Cannot negate a value of type {}", other.type_name())),
    }
}

/// Ordering comparison returning integer 1/0. Numbers compare numerically,
/// strings lexicographically; any other pairing is 0.
pub fn compare(op: CompareOp, left: &Value, right: &Value) -> Value {
    let ordering = match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Int(_) | Value::Double(_), Value::Int(_) | Value::Double(_)) => {
            to_f64(left).partial_cmp(&to_f64(right))
        }
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => None,
    };

    let Some(ordering) = ordering else {
        return Value::Int(0);
    };
    Value::bool(match op {
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Ge => ordering.is_ge(),
    })
}

fn fmt_double(d: f64, f: &mut fmt::Formatter) -> fmt::Result {
    if d.is_finite() && d.fract() == 0.0 && d.abs() < 1e16 {
        write!(f, "{:.1}", d)
    } else {
        write!(f, "{}", d)
    }
}

/// Display form used inside collections: strings are quoted
struct Nested<'a>(&'a Value);

impl fmt::Display for Nested<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            Value::Str(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Double(d) => fmt_double(*d, f),
            Value::Str(s) => write!(f, "{}", s),
            Value::Closure(c) => write!(f, "<fn {}>", c.function.name),
            Value::Method(m) => write!(f, "<fn {}>", m.closure.function.name),
            Value::Native(n) => write!(f, "<native {}.{}>", n.native.class_name, n.native.name),
            Value::Class(c) => write!(f, "<class {}>", c.name),
            Value::Fiber(id) => write!(f, "<fiber #{}>", id.0),
            Value::Range(a, b) => write!(f, "{}..{}", a, b),
            Value::Instance(inst) => {
                let inst = match inst.try_borrow() {
                    Ok(inst) => inst,
                    Err(_) => return write!(f, "<instance>"),
                };
                match &inst.storage {
                    Storage::List(items) => {
                        write!(f, "[")?;
                        for (i, item) in items.iter().enumerate() {
                            if i > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "{}", Nested(item))?;
                        }
                        write!(f, "]")
                    }
                    Storage::Map(entries) => {
                        if entries.is_empty() {
                            return write!(f, "[:]");
                        }
                        write!(f, "[")?;
                        for (i, (key, value)) in entries.iter().enumerate() {
                            if i > 0 {
                                write!(f, ", ")?;
                            }
                            match key {
                                MapKey::Int(n) => write!(f, "{}: {}", n, Nested(value))?,
                                MapKey::Str(s) => write!(f, "{:?}: {}", s, Nested(value))?,
                            }
                        }
                        write!(f, "]")
                    }
                    Storage::Plain if inst.is_error() => {
                        let message = inst.fields.get("message").cloned().unwrap_or_default();
                        write!(f, "{}: {}", inst.class.name, message)
                    }
                    Storage::Plain => {
                        write!(f, "{}(", inst.class.name)?;
                        for (i, (name, value)) in inst.fields.iter().enumerate() {
                            if i > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "{}={}", name, Nested(value))?;
                        }
                        write!(f, ")")
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Double(d) => write!(f, "Double({:?})", d),
            Value::Nil => write!(f, "Nil"),
            other => write!(f, "{}({})", other.type_name(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_if_possible() {
        assert!(matches!(int_if_possible(2.0), Value::Int(2)));
        assert!(matches!(int_if_possible(2.5), Value::Double(d) if d == 2.5));
        assert!(matches!(int_if_possible(f64::INFINITY), Value::Double(_)));
        assert!(matches!(int_if_possible(1e300), Value::Double(_)));
    }

    #[test]
    fn test_division_collapses_or_promotes() {
        let half = arithmetic(ArithOp::Div, &Value::Int(5), &Value::Int(2)).unwrap();
        assert!(matches!(half, Value::Double(d) if d == 2.5));
        let exact = arithmetic(ArithOp::Div, &Value::Int(4), &Value::Int(2)).unwrap();
        assert!(matches!(exact, Value::Int(2)));
    }

    #[test]
    fn test_nil_is_absorbing() {
        for op in [ArithOp::Add, ArithOp::Sub, ArithOp::Mul, ArithOp::Div, ArithOp::Mod] {
            assert!(arithmetic(op, &Value::Nil, &Value::Int(5)).unwrap().is_nil());
            assert!(arithmetic(op, &Value::str("x"), &Value::Nil).unwrap().is_nil());
        }
    }

    #[test]
    fn test_mixed_promotes_to_double() {
        let sum = arithmetic(ArithOp::Add, &Value::Int(1), &Value::Double(0.5)).unwrap();
        assert!(matches!(sum, Value::Double(d) if d == 1.5));
    }

    #[test]
    fn test_modulo_by_zero_is_error() {
        assert!(arithmetic(ArithOp::Mod, &Value::Int(1), &Value::Int(0)).is_err());
        assert!(arithmetic(ArithOp::Sub, &Value::str("a"), &Value::Int(1)).is_err());
    }

    #[test]
    fn test_compare_returns_int_booleans() {
        assert!(matches!(compare(CompareOp::Lt, &Value::Int(1), &Value::Double(1.5)), Value::Int(1)));
        assert!(matches!(compare(CompareOp::Ge, &Value::str("a"), &Value::str("b")), Value::Int(0)));
        assert!(matches!(compare(CompareOp::Lt, &Value::Nil, &Value::Int(1)), Value::Int(0)));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Double(2.0).to_string(), "2.0");
        assert_eq!(Value::Double(2.5).to_string(), "2.5");
        assert_eq!(Value::Range(1, 3).to_string(), "1..3");
        assert_eq!(Value::Nil.to_string(), "nil");
    }
}
