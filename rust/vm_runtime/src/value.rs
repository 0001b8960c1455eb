//! Runtime values and their operators.
//!
//! Every operator is a plain match over the operand pair.  Numeric operators
//! keep integers integral (`int op int -> int`) and promote to float as soon
//! as either side is a float.  Unsupported pairings raise a recoverable panic
//! that names both operand types.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use sable_bytecode::Constant;

use crate::object::{Class, Function, Instance, Module, Proxy};
use crate::panic::Panic;

type ArrayCell = RefCell<Vec<Value>>;

/// Array depth past which comparison and printing stop descending.
const MAX_NESTING: usize = 128;

#[derive(Clone)]
pub enum Value {
    None,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(Rc<str>),
    Array(Rc<ArrayCell>),
    Function(Rc<Function>),
    Class(Rc<Class>),
    Instance(Rc<Instance>),
    Proxy(Rc<Proxy>),
    Module(Rc<Module>),
}

#[derive(Clone, Copy)]
enum Arithmetic {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl Arithmetic {
    fn symbol(self) -> &'static str {
        match self {
            Arithmetic::Add => "+",
            Arithmetic::Sub => "-",
            Arithmetic::Mul => "*",
            Arithmetic::Div => "/",
            Arithmetic::Mod => "%",
        }
    }
}

impl Value {
    pub fn string(value: impl AsRef<str>) -> Self {
        Value::String(Rc::from(value.as_ref()))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    /// Value for a pool entry.  Chunk constants have no value form.
    pub fn from_constant(constant: &Constant) -> Option<Value> {
        let value = match constant {
            Constant::None => Value::None,
            Constant::String(text) => Value::String(text.clone()),
            Constant::Integer(value) => Value::Integer(*value),
            Constant::Float(value) => Value::Float(*value),
            Constant::Boolean(value) => Value::Boolean(*value),
            Constant::Chunk(_) => return None,
        };
        Some(value)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Integer(_) => "int",
            Value::Float(_) => "float",
            Value::Boolean(_) => "bool",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Function(_) => "function",
            Value::Class(_) => "class",
            Value::Instance(_) => "instance",
            Value::Proxy(_) => "proxy",
            Value::Module(_) => "module",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    /// Snapshot of an array's elements.
    pub fn to_vec(&self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items.borrow().clone()),
            _ => None,
        }
    }

    /// Condition value.  Only booleans, `none` and numbers convert.
    pub fn truthy(&self) -> Result<bool, Panic> {
        match self {
            Value::Boolean(value) => Ok(*value),
            Value::None => Ok(false),
            Value::Integer(value) => Ok(*value != 0),
            Value::Float(value) => Ok(*value != 0.0),
            other => Err(Panic::recoverable(format!(
                "{} cannot be used as a condition",
                other.type_name()
            ))),
        }
    }

    pub fn add(&self, rhs: &Value) -> Result<Value, Panic> {
        if let (Value::String(a), Value::String(b)) = (self, rhs) {
            let mut joined = String::with_capacity(a.len() + b.len());
            joined.push_str(a);
            joined.push_str(b);
            return Ok(Value::string(joined));
        }
        self.arithmetic(rhs, Arithmetic::Add)
    }

    pub fn sub(&self, rhs: &Value) -> Result<Value, Panic> {
        self.arithmetic(rhs, Arithmetic::Sub)
    }

    pub fn mul(&self, rhs: &Value) -> Result<Value, Panic> {
        self.arithmetic(rhs, Arithmetic::Mul)
    }

    pub fn div(&self, rhs: &Value) -> Result<Value, Panic> {
        self.arithmetic(rhs, Arithmetic::Div)
    }

    pub fn rem(&self, rhs: &Value) -> Result<Value, Panic> {
        self.arithmetic(rhs, Arithmetic::Mod)
    }

    fn arithmetic(&self, rhs: &Value, op: Arithmetic) -> Result<Value, Panic> {
        match (self, rhs) {
            (Value::Integer(a), Value::Integer(b)) => integer_arithmetic(*a, *b, op),
            (Value::Integer(a), Value::Float(b)) => Ok(float_arithmetic(*a as f64, *b, op)),
            (Value::Float(a), Value::Integer(b)) => Ok(float_arithmetic(*a, *b as f64, op)),
            (Value::Float(a), Value::Float(b)) => Ok(float_arithmetic(*a, *b, op)),
            _ => Err(Panic::recoverable(format!(
                "unsupported operand types for {}: {} and {}",
                op.symbol(),
                self.type_name(),
                rhs.type_name()
            ))),
        }
    }

    pub fn neg(&self) -> Result<Value, Panic> {
        match self {
            Value::Integer(value) => value
                .checked_neg()
                .map(Value::Integer)
                .ok_or_else(|| Panic::recoverable("integer overflow in negation")),
            Value::Float(value) => Ok(Value::Float(-value)),
            other => Err(Panic::recoverable(format!(
                "cannot negate {}",
                other.type_name()
            ))),
        }
    }

    /// Structural equality for primitives, strings and arrays; identity for
    /// objects.  Never panics, and terminates on cyclic arrays.
    pub fn equals(&self, rhs: &Value) -> bool {
        self.equals_within(rhs, &mut Vec::new(), 0)
    }

    /// `assumed` holds array pairs already under comparison; meeting one again
    /// means the cycle agrees so far.
    fn equals_within(
        &self,
        rhs: &Value,
        assumed: &mut Vec<(*const ArrayCell, *const ArrayCell)>,
        depth: usize,
    ) -> bool {
        match (self, rhs) {
            (Value::None, Value::None) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
                *a as f64 == *b
            }
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let pair = (Rc::as_ptr(a), Rc::as_ptr(b));
                if assumed.contains(&pair) {
                    return true;
                }
                if depth >= MAX_NESTING {
                    return false;
                }
                assumed.push(pair);
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x.equals_within(y, assumed, depth + 1))
            }
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::Proxy(a), Value::Proxy(b)) => Rc::ptr_eq(a, b),
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Ordering for numbers and strings.  `None` when unordered (NaN).
    pub fn compare(&self, rhs: &Value) -> Result<Option<Ordering>, Panic> {
        match (self, rhs) {
            (Value::Integer(a), Value::Integer(b)) => Ok(Some(a.cmp(b))),
            (Value::Integer(a), Value::Float(b)) => Ok((*a as f64).partial_cmp(b)),
            (Value::Float(a), Value::Integer(b)) => Ok(a.partial_cmp(&(*b as f64))),
            (Value::Float(a), Value::Float(b)) => Ok(a.partial_cmp(b)),
            (Value::String(a), Value::String(b)) => Ok(Some(a.cmp(b))),
            _ => Err(Panic::recoverable(format!(
                "cannot compare {} with {}",
                self.type_name(),
                rhs.type_name()
            ))),
        }
    }

    /// Element access for arrays and strings.
    pub fn get_index(&self, index: &Value) -> Result<Value, Panic> {
        let position = |length: usize| -> Result<usize, Panic> {
            let Value::Integer(raw) = index else {
                return Err(Panic::recoverable(format!(
                    "{} indices must be int, not {}",
                    self.type_name(),
                    index.type_name()
                )));
            };
            usize::try_from(*raw)
                .ok()
                .filter(|position| *position < length)
                .ok_or_else(|| {
                    Panic::recoverable(format!(
                        "index {raw} out of range for {} of length {length}",
                        self.type_name()
                    ))
                })
        };
        match self {
            Value::Array(items) => {
                let items = items.borrow();
                Ok(items[position(items.len())?].clone())
            }
            Value::String(text) => {
                let length = text.chars().count();
                let at = position(length)?;
                Ok(text
                    .chars()
                    .nth(at)
                    .map(|ch| Value::string(ch.to_string()))
                    .unwrap_or(Value::None))
            }
            other => Err(Panic::recoverable(format!(
                "{} is not indexable",
                other.type_name()
            ))),
        }
    }

    pub fn set_index(&self, index: &Value, value: Value) -> Result<(), Panic> {
        match self {
            Value::Array(items) => {
                let mut items = items.borrow_mut();
                let length = items.len();
                let slot = index
                    .as_int()
                    .and_then(|raw| usize::try_from(raw).ok())
                    .and_then(|position| items.get_mut(position))
                    .ok_or_else(|| {
                        Panic::recoverable(format!(
                            "cannot assign to index {index} of array of length {length}"
                        ))
                    })?;
                *slot = value;
                Ok(())
            }
            Value::String(_) => Err(Panic::recoverable("strings are immutable")),
            other => Err(Panic::recoverable(format!(
                "{} does not support item assignment",
                other.type_name()
            ))),
        }
    }
}

fn integer_arithmetic(a: i64, b: i64, op: Arithmetic) -> Result<Value, Panic> {
    let result = match op {
        Arithmetic::Add => a.checked_add(b),
        Arithmetic::Sub => a.checked_sub(b),
        Arithmetic::Mul => a.checked_mul(b),
        Arithmetic::Div | Arithmetic::Mod if b == 0 => {
            return Err(Panic::recoverable("division by zero"));
        }
        Arithmetic::Div => a.checked_div(b),
        Arithmetic::Mod => a.checked_rem(b),
    };
    result
        .map(Value::Integer)
        .ok_or_else(|| Panic::recoverable(format!("integer overflow in {a} {} {b}", op.symbol())))
}

fn float_arithmetic(a: f64, b: f64, op: Arithmetic) -> Value {
    Value::Float(match op {
        Arithmetic::Add => a + b,
        Arithmetic::Sub => a - b,
        Arithmetic::Mul => a * b,
        Arithmetic::Div => a / b,
        Arithmetic::Mod => a % b,
    })
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::string(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("none"),
            Value::Integer(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value:?}"),
            Value::Boolean(value) => write!(f, "{value}"),
            Value::String(value) => f.write_str(value),
            Value::Array(items) => write_array(f, items, &mut Vec::new()),
            Value::Function(function) => write!(f, "<function {}>", function.name()),
            Value::Class(class) => write!(f, "<class {}>", class.name),
            Value::Instance(instance) => write!(f, "<{} instance>", instance.class.name),
            Value::Proxy(proxy) => write!(
                f,
                "<super {} of {}>",
                proxy.base.name, proxy.instance.class.name
            ),
            Value::Module(module) => write!(f, "<module {}>", module.name),
        }
    }
}

/// Arrays already being printed, or nested too deeply, render as `[...]`.
fn write_array(
    f: &mut fmt::Formatter<'_>,
    items: &Rc<ArrayCell>,
    open: &mut Vec<*const ArrayCell>,
) -> fmt::Result {
    if open.contains(&Rc::as_ptr(items)) || open.len() >= MAX_NESTING {
        return f.write_str("[...]");
    }
    open.push(Rc::as_ptr(items));
    f.write_str("[")?;
    for (index, item) in items.borrow().iter().enumerate() {
        if index > 0 {
            f.write_str(", ")?;
        }
        match item {
            Value::String(text) => write!(f, "{text:?}")?,
            Value::Array(nested) => write_array(f, nested, open)?,
            other => write!(f, "{other}")?,
        }
    }
    open.pop();
    f.write_str("]")
}

/// Objects may be cyclic, so debug output never recurses into them.
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(value) => write!(f, "{value:?}"),
            Value::Array(items) => write!(f, "<array of {}>", items.borrow().len()),
            other => write!(f, "{other}"),
        }
    }
}
