//! Host functions callable from bytecode.
//!
//! Natives are looked up by name when a `GET_GLOBAL` misses the module's own
//! globals.  Each one receives the machine so it can write output or call
//! back into script code through [`Machine::invoke_value`].

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::machine::Machine;
use crate::object::Function;
use crate::panic::Panic;
use crate::value::Value;

pub type NativeResult = Result<Value, Panic>;

pub type NativeFn = fn(&mut Machine, Vec<Value>) -> NativeResult;

pub struct NativeFunction {
    pub name: Rc<str>,
    /// Exact argument count, or the minimum when `variadic`.
    pub arity: usize,
    pub variadic: bool,
    pub callback: NativeFn,
}

impl NativeFunction {
    pub fn check_arity(&self, given: usize) -> Result<(), Panic> {
        let accepted = if self.variadic {
            given >= self.arity
        } else {
            given == self.arity
        };
        if accepted {
            return Ok(());
        }
        let qualifier = if self.variadic { "at least " } else { "" };
        Err(Panic::recoverable(format!(
            "{}() takes {qualifier}{} argument(s) but {given} were given",
            self.name, self.arity
        )))
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("variadic", &self.variadic)
            .finish()
    }
}

/// Serialisable description of a registered native.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeDescriptor {
    pub name: String,
    pub arity: usize,
    pub variadic: bool,
}

/// Name-ordered table of natives.
#[derive(Default)]
pub struct NativeRegistry {
    entries: IndexMap<Rc<str>, Rc<Function>>,
}

impl NativeRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The natives every machine starts with.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register("print", 0, true, native_print);
        registry.register("len", 1, false, native_len);
        registry.register("str", 1, false, native_str);
        registry.register("type", 1, false, native_type);
        registry.register("append", 2, false, native_append);
        registry.register("abs", 1, false, native_abs);
        registry.register("range", 1, true, native_range);
        registry.register("call", 1, true, native_call);
        registry
    }

    /// Add or replace a native.
    pub fn register(&mut self, name: &str, arity: usize, variadic: bool, callback: NativeFn) {
        let name: Rc<str> = Rc::from(name);
        let function = Function::Native(NativeFunction {
            name: name.clone(),
            arity,
            variadic,
            callback,
        });
        self.entries.insert(name, Rc::new(function));
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.entries
            .get(name)
            .map(|function| Value::Function(function.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn descriptors(&self) -> Vec<NativeDescriptor> {
        self.entries
            .values()
            .filter_map(|function| match function.as_ref() {
                Function::Native(native) => Some(NativeDescriptor {
                    name: native.name.to_string(),
                    arity: native.arity,
                    variadic: native.variadic,
                }),
                _ => None,
            })
            .collect()
    }
}

fn type_error(native: &str, expected: &str, found: &Value) -> Panic {
    Panic::recoverable(format!(
        "{native}() expected {expected}, found {}",
        found.type_name()
    ))
}

fn native_print(machine: &mut Machine, args: Vec<Value>) -> NativeResult {
    let line = args
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    machine
        .write_line(&line)
        .map_err(|error| Panic::recoverable(format!("print() failed: {error}")))?;
    Ok(Value::None)
}

fn native_len(_: &mut Machine, args: Vec<Value>) -> NativeResult {
    let length = match &args[0] {
        Value::Array(items) => items.borrow().len(),
        Value::String(text) => text.chars().count(),
        other => return Err(type_error("len", "array or string", other)),
    };
    Ok(Value::Integer(length as i64))
}

fn native_str(_: &mut Machine, args: Vec<Value>) -> NativeResult {
    Ok(match &args[0] {
        Value::String(_) => args[0].clone(),
        other => Value::string(other.to_string()),
    })
}

fn native_type(_: &mut Machine, args: Vec<Value>) -> NativeResult {
    Ok(Value::string(args[0].type_name()))
}

fn native_append(_: &mut Machine, mut args: Vec<Value>) -> NativeResult {
    let item = args.pop().unwrap_or(Value::None);
    match &args[0] {
        Value::Array(items) => {
            items.borrow_mut().push(item);
            Ok(Value::None)
        }
        other => Err(type_error("append", "array", other)),
    }
}

fn native_abs(_: &mut Machine, args: Vec<Value>) -> NativeResult {
    match &args[0] {
        Value::Integer(value) => value
            .checked_abs()
            .map(Value::Integer)
            .ok_or_else(|| Panic::recoverable("integer overflow in abs()")),
        Value::Float(value) => Ok(Value::Float(value.abs())),
        other => Err(type_error("abs", "a number", other)),
    }
}

/// `range(stop)` or `range(start, stop)`.
fn native_range(_: &mut Machine, args: Vec<Value>) -> NativeResult {
    let bounds: Vec<i64> = args
        .iter()
        .map(|arg| arg.as_int().ok_or_else(|| type_error("range", "int", arg)))
        .collect::<Result<_, _>>()?;
    let (start, stop) = match bounds.as_slice() {
        [stop] => (0, *stop),
        [start, stop] => (*start, *stop),
        _ => {
            return Err(Panic::recoverable(format!(
                "range() takes 1 or 2 argument(s) but {} were given",
                bounds.len()
            )))
        }
    };
    Ok(Value::array((start..stop).map(Value::Integer).collect()))
}

/// `call(f, args...)`: re-enters the machine.
fn native_call(machine: &mut Machine, mut args: Vec<Value>) -> NativeResult {
    let rest = args.split_off(1);
    let callee = args.pop().unwrap_or(Value::None);
    machine.invoke_value(callee, rest)
}
