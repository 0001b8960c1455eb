//! Object model: classes, instances, super proxies, functions and modules.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use sable_bytecode::Chunk;

use crate::natives::NativeFunction;
use crate::value::Value;

/// Name-keyed attribute table preserving definition order.
pub type Attributes = IndexMap<Rc<str>, Value>;

pub struct Class {
    pub name: Rc<str>,
    pub bases: Vec<Rc<Class>>,
    /// Resolution order without the class itself.
    ancestors: Vec<Rc<Class>>,
    attributes: RefCell<Attributes>,
    subclasses: RefCell<Vec<Weak<Class>>>,
}

impl Class {
    /// Build a class and register it with each base as a subclass.
    ///
    /// The resolution order is a breadth-first expansion: a queue starts with
    /// the class itself; the front is popped, appended to the order unless
    /// already present, and its direct bases are inserted at the front of
    /// the queue in declaration order.  This is not a C3 linearization:
    /// `A, B(A), C(A), D(B, C)` yields `D, B, A, C`.
    pub fn new(name: impl AsRef<str>, bases: Vec<Rc<Class>>) -> Rc<Class> {
        let mut queue: VecDeque<Rc<Class>> = bases.iter().cloned().collect();
        let mut ancestors: Vec<Rc<Class>> = Vec::new();
        while let Some(next) = queue.pop_front() {
            if ancestors.iter().any(|seen| Rc::ptr_eq(seen, &next)) {
                continue;
            }
            for base in next.bases.iter().rev() {
                queue.push_front(base.clone());
            }
            ancestors.push(next);
        }

        let class = Rc::new(Class {
            name: Rc::from(name.as_ref()),
            bases,
            ancestors,
            attributes: RefCell::new(Attributes::new()),
            subclasses: RefCell::new(Vec::new()),
        });
        for base in &class.bases {
            base.subclasses.borrow_mut().push(Rc::downgrade(&class));
        }
        class
    }

    /// The class itself followed by its ancestors.
    pub fn resolution_order(&self) -> impl Iterator<Item = &Class> + '_ {
        std::iter::once(self).chain(self.ancestors.iter().map(|class| class.as_ref()))
    }

    pub fn resolution_names(&self) -> Vec<Rc<str>> {
        self.resolution_order()
            .map(|class| class.name.clone())
            .collect()
    }

    pub fn is_derived_from(&self, other: &Class) -> bool {
        self.resolution_order()
            .any(|class| std::ptr::eq(class, other))
    }

    /// Attribute defined directly on this class.
    pub fn own_attribute(&self, name: &str) -> Option<Value> {
        self.attributes.borrow().get(name).cloned()
    }

    pub fn set_attribute(&self, name: Rc<str>, value: Value) {
        self.attributes.borrow_mut().insert(name, value);
    }

    /// First definition of `name` along the resolution order.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.resolution_order()
            .find_map(|class| class.own_attribute(name))
    }

    /// Every visible attribute, with earlier classes in the resolution order
    /// shadowing later ones.
    pub fn flattened(&self) -> Attributes {
        let order: Vec<&Class> = self.resolution_order().collect();
        let mut table = Attributes::new();
        for class in order.into_iter().rev() {
            for (name, value) in class.attributes.borrow().iter() {
                table.insert(name.clone(), value.clone());
            }
        }
        table
    }

    /// Subclasses that are still alive.
    pub fn subclasses(&self) -> Vec<Rc<Class>> {
        self.subclasses
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("resolution_order", &self.resolution_names())
            .finish()
    }
}

pub struct Instance {
    pub class: Rc<Class>,
    attributes: RefCell<Attributes>,
}

impl Instance {
    /// Seeded with the class's flattened attributes; diverges afterwards.
    pub fn new(class: Rc<Class>) -> Rc<Instance> {
        let attributes = class.flattened();
        Rc::new(Instance {
            class,
            attributes: RefCell::new(attributes),
        })
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.attributes.borrow().get(name).cloned()
    }

    pub fn set_attribute(&self, name: Rc<str>, value: Value) {
        self.attributes.borrow_mut().insert(name, value);
    }

    pub fn is_instance_of(&self, class: &Class) -> bool {
        self.class.is_derived_from(class)
    }
}

/// `super` view of an instance: reads come from an ancestor's table, writes
/// land on the instance.
pub struct Proxy {
    pub instance: Rc<Instance>,
    pub base: Rc<Class>,
    attributes: Attributes,
}

impl Proxy {
    pub fn new(instance: Rc<Instance>, base: Rc<Class>) -> Rc<Proxy> {
        let attributes = base.flattened();
        Rc::new(Proxy {
            instance,
            base,
            attributes,
        })
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.attributes.get(name).cloned()
    }
}

/// Script function instantiated from a chunk.
pub struct RuntimeFunction {
    pub name: Rc<str>,
    pub chunk: Rc<Chunk>,
    pub module: Rc<Module>,
    /// Values captured by `MAKE_FUNCTION`, prepended to the locals.
    pub bound: Vec<Value>,
}

pub enum Function {
    Runtime(RuntimeFunction),
    Native(NativeFunction),
    /// A function read through an instance; the receiver becomes the first
    /// argument.
    Method { receiver: Value, function: Rc<Function> },
}

impl Function {
    pub fn name(&self) -> &str {
        match self {
            Function::Runtime(function) => &function.name,
            Function::Native(native) => &native.name,
            Function::Method { function, .. } => function.name(),
        }
    }

    /// Bind a runtime function to `receiver`; other callables are returned
    /// unchanged.
    pub fn bind(function: &Rc<Function>, receiver: Value) -> Value {
        match function.as_ref() {
            Function::Runtime(_) => Value::Function(Rc::new(Function::Method {
                receiver,
                function: function.clone(),
            })),
            _ => Value::Function(function.clone()),
        }
    }
}

pub struct Module {
    pub name: Rc<str>,
    pub source_path: Option<PathBuf>,
    pub chunk: Rc<Chunk>,
    globals: RefCell<Attributes>,
    imports: RefCell<Vec<Rc<str>>>,
}

impl Module {
    pub fn new(name: impl AsRef<str>, source_path: Option<PathBuf>, chunk: Rc<Chunk>) -> Rc<Module> {
        Rc::new(Module {
            name: Rc::from(name.as_ref()),
            source_path,
            chunk,
            globals: RefCell::new(Attributes::new()),
            imports: RefCell::new(Vec::new()),
        })
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.borrow().get(name).cloned()
    }

    pub fn set_global(&self, name: Rc<str>, value: Value) {
        self.globals.borrow_mut().insert(name, value);
    }

    pub fn global_names(&self) -> Vec<Rc<str>> {
        self.globals.borrow().keys().cloned().collect()
    }

    pub fn record_import(&self, name: Rc<str>) {
        let mut imports = self.imports.borrow_mut();
        if !imports.contains(&name) {
            imports.push(name);
        }
    }

    pub fn imports(&self) -> Vec<Rc<str>> {
        self.imports.borrow().clone()
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("source_path", &self.source_path)
            .field("globals", &self.global_names())
            .finish()
    }
}
