//! The stack machine: dispatch loop, call protocol and panic recovery.
//!
//! All frames share one operand stack; each frame remembers the stack height
//! it was entered at and everything above it belongs to the frame.  A panic
//! travels out of [`Machine::step`] as an `Err` and is handed to
//! [`Machine::unwind`], which either resumes a guarded frame or pops frames
//! until it reaches the root of the current execution.

use std::io::{self, Write};
use std::rc::Rc;

use indexmap::IndexMap;
use sable_bytecode::{Chunk, Constant, Disassembler, Instruction, Opcode, Operand};
use sable_verifier::seal;
use tracing::{debug, error, trace};

use crate::config::MachineConfig;
use crate::error::VmError;
use crate::frame::{Frame, FrameRole};
use crate::loader::{CacheLoader, MemoryLoader, ModuleLoader, SourceCompiler};
use crate::natives::NativeRegistry;
use crate::object::{Class, Function, Instance, Module, Proxy, RuntimeFunction};
use crate::panic::Panic;
use crate::profiler::{ProfileReport, Profiler};
use crate::value::Value;

/// Outcome of starting a call.
enum Invocation {
    /// A native ran to completion.
    Returned(Value),
    /// A script frame was pushed; the loop picks it up.
    Pushed,
}

pub struct Machine {
    config: MachineConfig,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    modules: IndexMap<Rc<str>, Rc<Module>>,
    registered: MemoryLoader,
    loaders: Vec<Box<dyn ModuleLoader>>,
    natives: NativeRegistry,
    profiler: Option<Profiler>,
    /// Dispatch loops started by [`Machine::invoke_value`] still running.
    reentry: usize,
    executed: u64,
    status: i32,
    last_halt: Option<Panic>,
    output: Box<dyn Write>,
}

impl Machine {
    /// A machine whose file loader can read caches but not compile source.
    pub fn new(config: MachineConfig) -> Self {
        let files = CacheLoader::new(config.search_roots.clone())
            .with_cache_writes(config.cache_enabled);
        Self::with_loader(config, files)
    }

    /// A machine whose file loader compiles `.sbl` sources with `compiler`.
    pub fn with_compiler(config: MachineConfig, compiler: Box<dyn SourceCompiler>) -> Self {
        let files = CacheLoader::new(config.search_roots.clone())
            .with_cache_writes(config.cache_enabled)
            .with_compiler(compiler);
        Self::with_loader(config, files)
    }

    fn with_loader(config: MachineConfig, files: CacheLoader) -> Self {
        let profiler = config.profile.then(Profiler::new);
        Self {
            config,
            stack: Vec::new(),
            frames: Vec::new(),
            modules: IndexMap::new(),
            registered: MemoryLoader::new(),
            loaders: vec![Box::new(files)],
            natives: NativeRegistry::standard(),
            profiler,
            reentry: 0,
            executed: 0,
            status: 0,
            last_halt: None,
            output: Box::new(io::stdout()),
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Consulted after registered modules and before the file loader.
    pub fn add_loader(&mut self, loader: Box<dyn ModuleLoader>) {
        let position = self.loaders.len().saturating_sub(1);
        self.loaders.insert(position, loader);
    }

    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    /// Natives resolve on the next `GET_GLOBAL` that misses a module global.
    pub fn natives_mut(&mut self) -> &mut NativeRegistry {
        &mut self.natives
    }

    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }

    pub(crate) fn write_line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.output, "{line}")
    }

    /// Make `chunk` importable as `name`.  The chunk tree is verified here.
    pub fn register_module(&mut self, name: &str, chunk: &Chunk) -> Result<(), VmError> {
        self.registered
            .insert(name, chunk)
            .map_err(|source| VmError::Verify {
                name: name.to_owned(),
                source,
            })
    }

    pub fn module(&self, name: &str) -> Option<Rc<Module>> {
        self.modules.get(name).cloned()
    }

    pub fn loaded_modules(&self) -> Vec<Rc<str>> {
        self.modules.keys().cloned().collect()
    }

    /// Exit status: 0 until an unrecovered panic halts the machine.
    pub fn status(&self) -> i32 {
        self.status
    }

    pub fn last_halt(&self) -> Option<&Panic> {
        self.last_halt.as_ref()
    }

    pub fn instructions_executed(&self) -> u64 {
        self.executed
    }

    pub fn profile_report(&self) -> Option<ProfileReport> {
        self.profiler.as_ref().map(Profiler::report)
    }

    /// Load and run a module body; a module already loaded is returned as is.
    pub fn load_module(&mut self, name: &str) -> Result<Rc<Module>, VmError> {
        if let Some(module) = self.modules.get(name) {
            trace!(module = name, "module already loaded");
            return Ok(module.clone());
        }
        let module = self.resolve_module(name)?;
        self.modules.insert(module.name.clone(), module.clone());

        let root = self.frames.len();
        let base = self.stack.len();
        let outcome = match self.push_module_frame(module.clone(), FrameRole::Module) {
            Ok(()) => self.run(root),
            Err(panic) => Err(panic),
        };
        match outcome {
            Ok(_) => Ok(module),
            Err(panic) => {
                self.stack.truncate(base);
                self.modules.shift_remove(name);
                Err(self.halt(panic))
            }
        }
    }

    /// Call `module.attribute(args)` on behalf of the host.
    pub fn call_checked(
        &mut self,
        module: &str,
        attribute: &str,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        let loaded = self.load_module(module)?;
        let callee = loaded
            .global(attribute)
            .ok_or_else(|| VmError::AttributeMissing {
                module: module.to_owned(),
                attribute: attribute.to_owned(),
            })?;
        self.invoke_value(callee, args)
            .map_err(|panic| self.halt(panic))
    }

    /// Like [`Machine::call_checked`], but reports failures on stderr and
    /// sets the status instead of returning them.
    pub fn call(&mut self, module: &str, attribute: &str, args: Vec<Value>) -> Option<Value> {
        match self.call_checked(module, attribute, args) {
            Ok(value) => Some(value),
            Err(VmError::Halted { .. }) => None,
            Err(other) => {
                error!(module, attribute, error = %other, "host call failed");
                eprintln!("error: {other}");
                self.status = 1;
                None
            }
        }
    }

    /// Call a value from native code or the host, running a nested dispatch
    /// loop when the callee is a script function.  Panics that escape the
    /// nested loop are returned, not halted on.
    pub fn invoke_value(&mut self, callee: Value, args: Vec<Value>) -> Result<Value, Panic> {
        if self.reentry >= self.config.max_native_reentry {
            return Err(Panic::recoverable(format!(
                "stack overflow: native re-entry exceeds {}",
                self.config.max_native_reentry
            )));
        }
        let root = self.frames.len();
        let base = self.stack.len();
        self.reentry += 1;
        let outcome = match self.invoke(callee, args) {
            Ok(Invocation::Returned(value)) => Ok(value),
            Ok(Invocation::Pushed) => self.run(root),
            Err(panic) => match self.unwind(panic, root) {
                None => self.run(root),
                Some(panic) => Err(panic),
            },
        };
        self.reentry -= 1;
        if outcome.is_err() {
            self.stack.truncate(base);
        }
        outcome
    }

    fn halt(&mut self, panic: Panic) -> VmError {
        let report = panic.report(self.config.trace_repeat_threshold);
        error!(payload = %panic.payload, recoverable = panic.recoverable, "machine halted");
        eprintln!("{report}");
        self.status = 1;
        let message = panic.payload.to_string();
        self.last_halt = Some(panic);
        VmError::Halted { message }
    }

    fn resolve_module(&mut self, name: &str) -> Result<Rc<Module>, VmError> {
        let mut found = self.registered.resolve(name).ok().flatten();
        for loader in &self.loaders {
            if found.is_some() {
                break;
            }
            found = loader.resolve(name).map_err(|source| VmError::Load {
                name: name.to_owned(),
                source,
            })?;
        }
        let source = found.ok_or_else(|| VmError::ModuleNotFound(name.to_owned()))?;
        let chunk = if source.verified {
            source.chunk
        } else {
            seal(&source.chunk).map_err(|source| VmError::Verify {
                name: name.to_owned(),
                source,
            })?
        };
        debug!(module = name, path = ?source.path, "module resolved");
        Ok(Module::new(name, source.path, Rc::new(chunk)))
    }

    fn push_frame(&mut self, frame: Frame) -> Result<(), Panic> {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(Panic::recoverable(format!(
                "stack overflow: call depth exceeds {}",
                self.config.max_call_depth
            )));
        }
        self.frames.push(frame);
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.record_call(self.frames.len());
        }
        Ok(())
    }

    fn push_module_frame(&mut self, module: Rc<Module>, role: FrameRole) -> Result<(), Panic> {
        let chunk = module.chunk.clone();
        let locals = vec![Value::None; chunk.locals_count as usize];
        let frame = Frame::script(module, chunk, locals, self.stack.len(), role);
        self.push_frame(frame)
    }

    fn run(&mut self, root: usize) -> Result<Value, Panic> {
        loop {
            match self.step(root) {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(panic) => {
                    if let Some(panic) = self.unwind(panic, root) {
                        return Err(panic);
                    }
                }
            }
        }
    }

    /// Walk frames above `root` looking for a guard.  Returns the panic if
    /// it escapes to `root`.
    fn unwind(&mut self, mut panic: Panic, root: usize) -> Option<Panic> {
        // Panics escaping a nested dispatch loop are unwound again outside it.
        if !panic.counted {
            panic.counted = true;
            if let Some(profiler) = self.profiler.as_mut() {
                profiler.record_panic();
            }
        }
        while self.frames.len() > root {
            let Some(frame) = self.frames.last_mut() else {
                break;
            };
            self.stack.truncate(frame.operand_base);
            if panic.recoverable {
                let guard = frame
                    .chunk
                    .as_ref()
                    .and_then(|chunk| chunk.guards.iter().find(|guard| guard.covers(frame.pc)))
                    .copied();
                if let Some(guard) = guard {
                    if let Some(slot) = guard.slot.map(usize::from) {
                        if slot < frame.locals.len() {
                            frame.locals[slot] = panic.payload.clone();
                        }
                    }
                    frame.pc = guard.recovery as usize;
                    debug!(payload = %panic.payload, recovery = guard.recovery, "panic recovered");
                    if let Some(profiler) = self.profiler.as_mut() {
                        profiler.record_recovery();
                    }
                    return None;
                }
            }
            let Some(frame) = self.frames.pop() else {
                break;
            };
            panic.trace.push(frame.describe());
            if let (FrameRole::Module | FrameRole::Import, Some(module)) =
                (&frame.role, &frame.module)
            {
                self.modules.shift_remove(module.name.as_ref());
            }
        }
        Some(panic)
    }

    fn current_frame(&mut self) -> Result<&mut Frame, Panic> {
        self.frames
            .last_mut()
            .ok_or_else(|| Panic::fatal("no active frame"))
    }

    fn current_module(&self) -> Result<Rc<Module>, Panic> {
        self.frames
            .last()
            .and_then(|frame| frame.module.clone())
            .ok_or_else(|| Panic::fatal("no module for the active frame"))
    }

    fn pop(&mut self) -> Result<Value, Panic> {
        let base = self.frames.last().map_or(0, |frame| frame.operand_base);
        if self.stack.len() <= base {
            return Err(Panic::fatal("operand stack underflow"));
        }
        self.stack.pop().ok_or_else(|| Panic::fatal("operand stack underflow"))
    }

    fn pop_many(&mut self, count: usize) -> Result<Vec<Value>, Panic> {
        let base = self.frames.last().map_or(0, |frame| frame.operand_base);
        if self.stack.len() < base + count {
            return Err(Panic::fatal("operand stack underflow"));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Execute one instruction of the top frame.  `Some` carries the value
    /// returned by the frame at `root`.
    fn step(&mut self, root: usize) -> Result<Option<Value>, Panic> {
        let frame = self.current_frame()?;
        let chunk = frame
            .chunk
            .clone()
            .ok_or_else(|| Panic::fatal("native frame reached the dispatch loop"))?;
        let start = frame.pc;
        if start >= chunk.code.len() {
            return self.finish_frame(Value::None, root);
        }
        let (_, instruction) =
            Disassembler::new(&chunk.code[start..], |index| chunk.constant(index).cloned())
                .decode_next()
                .map_err(|error| {
                    Panic::fatal(format!(
                        "malformed bytecode in {} at offset {start}: {error}",
                        chunk.name()
                    ))
                })?;
        let next = start + instruction.size();
        frame.pc = next;

        self.executed += 1;
        if self.config.instruction_limit > 0 && self.executed > self.config.instruction_limit {
            return Err(Panic::fatal(format!(
                "instruction limit of {} exceeded",
                self.config.instruction_limit
            )));
        }
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.record_instruction(chunk.name(), instruction.opcode);
        }

        self.execute(&instruction, next, root)
    }

    fn execute(
        &mut self,
        instruction: &Instruction,
        next: usize,
        root: usize,
    ) -> Result<Option<Value>, Panic> {
        match instruction.opcode {
            Opcode::Nop => {}
            Opcode::Push => {
                let constant = constant_operand(instruction, 0)?;
                let value = Value::from_constant(constant).ok_or_else(|| {
                    Panic::fatal("PUSH cannot load a chunk constant")
                })?;
                self.push(value);
            }
            Opcode::PushInt => match instruction.operands.first() {
                Some(Operand::Imm32(value)) => self.push(Value::Integer(i64::from(*value))),
                _ => return Err(malformed(instruction)),
            },
            Opcode::PushFloat => match instruction.operands.first() {
                Some(Operand::Imm64(bits)) => {
                    self.push(Value::Float(f64::from_bits(*bits as u64)))
                }
                _ => return Err(malformed(instruction)),
            },
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Dup => {
                let value = self.pop()?;
                self.push(value.clone());
                self.push(value);
            }
            Opcode::DupAt => {
                let depth = usize::from(imm8_operand(instruction, 0)?);
                let base = self.frames.last().map_or(0, |frame| frame.operand_base);
                let available = self.stack.len() - base;
                if depth >= available {
                    return Err(Panic::fatal(format!(
                        "DUP_AT {depth} with only {available} value(s) on the stack"
                    )));
                }
                let value = self.stack[self.stack.len() - 1 - depth].clone();
                self.push(value);
            }
            Opcode::Swap => {
                let top = self.pop()?;
                let below = self.pop()?;
                self.push(top);
                self.push(below);
            }
            Opcode::GetLocal => {
                let slot = usize::from(imm8_operand(instruction, 0)?);
                let value = self
                    .current_frame()?
                    .locals
                    .get(slot)
                    .cloned()
                    .ok_or_else(|| Panic::fatal(format!("local slot {slot} out of range")))?;
                self.push(value);
            }
            Opcode::SetLocal => {
                let slot = usize::from(imm8_operand(instruction, 0)?);
                let value = self.pop()?;
                let local = self
                    .current_frame()?
                    .locals
                    .get_mut(slot)
                    .ok_or_else(|| Panic::fatal(format!("local slot {slot} out of range")))?;
                *local = value;
            }
            Opcode::GetGlobal => {
                let name = symbol_operand(instruction, 0)?;
                let module = self.current_module()?;
                let value = module
                    .global(&name)
                    .or_else(|| self.natives.get(&name))
                    .ok_or_else(|| {
                        Panic::recoverable(format!(
                            "undefined global '{name}' in module {}",
                            module.name
                        ))
                    })?;
                self.push(value);
            }
            Opcode::SetGlobal => {
                let name = symbol_operand(instruction, 0)?;
                let value = self.pop()?;
                self.current_module()?.set_global(name, value);
            }
            Opcode::GetAttribute => {
                let name = symbol_operand(instruction, 0)?;
                let target = self.pop()?;
                let value = get_attribute(&target, &name)?;
                self.push(value);
            }
            Opcode::SetAttribute => {
                let name = symbol_operand(instruction, 0)?;
                let value = self.pop()?;
                let target = self.pop()?;
                set_attribute(&target, name, value)?;
            }
            Opcode::GetIndex => {
                let index = self.pop()?;
                let target = self.pop()?;
                let value = target.get_index(&index)?;
                self.push(value);
            }
            Opcode::SetIndex => {
                let value = self.pop()?;
                let index = self.pop()?;
                let target = self.pop()?;
                target.set_index(&index, value)?;
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let value = binary(instruction.opcode, &lhs, &rhs)?;
                self.push(value);
            }
            Opcode::Neg => {
                let value = self.pop()?.neg()?;
                self.push(value);
            }
            Opcode::Not => {
                let value = self.pop()?.truthy()?;
                self.push(Value::Boolean(!value));
            }
            Opcode::Jump => {
                let target = jump_target(instruction, next)?;
                self.current_frame()?.pc = target;
            }
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                let target = jump_target(instruction, next)?;
                let condition = self.pop()?.truthy()?;
                if condition == (instruction.opcode == Opcode::JumpIfTrue) {
                    self.current_frame()?.pc = target;
                }
            }
            Opcode::Call => {
                let argc = usize::from(imm8_operand(instruction, 0)?);
                let args = self.pop_many(argc)?;
                let callee = self.pop()?;
                if let Invocation::Returned(value) = self.invoke(callee, args)? {
                    self.push(value);
                }
            }
            Opcode::Return => {
                let value = self.pop()?;
                return self.finish_frame(value, root);
            }
            Opcode::MakeArray => {
                let count = usize::from(imm8_operand(instruction, 0)?);
                let items = self.pop_many(count)?;
                self.push(Value::array(items));
            }
            Opcode::MakeFunction => {
                let body = chunk_operand(instruction, 0)?;
                let count = usize::from(imm8_operand(instruction, 1)?);
                if count != usize::from(body.bound_arg_count) {
                    return Err(Panic::fatal(format!(
                        "{} captures {} value(s) but {count} were supplied",
                        body.name(),
                        body.bound_arg_count
                    )));
                }
                let bound = self.pop_many(count)?;
                let function = Function::Runtime(RuntimeFunction {
                    name: Rc::from(body.name()),
                    chunk: body,
                    module: self.current_module()?,
                    bound,
                });
                self.push(Value::Function(Rc::new(function)));
            }
            Opcode::MakeClass => {
                let name = symbol_operand(instruction, 0)?;
                let body = chunk_operand(instruction, 1)?;
                let count = usize::from(imm8_operand(instruction, 2)?);
                let bases = self
                    .pop_many(count)?
                    .into_iter()
                    .map(|base| match base {
                        Value::Class(class) => Ok(class),
                        other => Err(Panic::fatal(format!(
                            "class {name} cannot inherit from {}",
                            other.type_name()
                        ))),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                for (index, base) in bases.iter().enumerate() {
                    if bases[..index].iter().any(|seen| Rc::ptr_eq(seen, base)) {
                        return Err(Panic::fatal(format!(
                            "class {name} lists base {} more than once",
                            base.name
                        )));
                    }
                }
                let class = Class::new(&name, bases);
                let mut locals = vec![Value::None; usize::from(body.locals_count).max(1)];
                locals[0] = Value::Class(class.clone());
                let frame = Frame::script(
                    self.current_module()?,
                    body,
                    locals,
                    self.stack.len(),
                    FrameRole::Class(class),
                );
                self.push_frame(frame)?;
            }
            Opcode::New => match self.pop()? {
                Value::Class(class) => self.push(Value::Instance(Instance::new(class))),
                other => {
                    return Err(Panic::fatal(format!(
                        "cannot instantiate {}",
                        other.type_name()
                    )))
                }
            },
            Opcode::Super => {
                let base = match self.pop()? {
                    Value::Class(class) => class,
                    other => {
                        return Err(Panic::fatal(format!(
                            "super expects a class, found {}",
                            other.type_name()
                        )))
                    }
                };
                let instance = match self.pop()? {
                    Value::Instance(instance) => instance,
                    Value::Proxy(proxy) => proxy.instance.clone(),
                    other => {
                        return Err(Panic::fatal(format!(
                            "super expects an instance, found {}",
                            other.type_name()
                        )))
                    }
                };
                if !instance.is_instance_of(&base) {
                    return Err(Panic::fatal(format!(
                        "{} is not derived from {}",
                        instance.class.name, base.name
                    )));
                }
                self.push(Value::Proxy(Proxy::new(instance, base)));
            }
            Opcode::InstanceOf => {
                let class = match self.pop()? {
                    Value::Class(class) => class,
                    other => {
                        return Err(Panic::recoverable(format!(
                            "instance check against {}, expected a class",
                            other.type_name()
                        )))
                    }
                };
                let result = match self.pop()? {
                    Value::Instance(instance) => instance.is_instance_of(&class),
                    Value::Proxy(proxy) => proxy.instance.is_instance_of(&class),
                    _ => false,
                };
                self.push(Value::Boolean(result));
            }
            Opcode::Import => {
                let name = symbol_operand(instruction, 0)?;
                self.import(name)?;
            }
            Opcode::Throw => {
                let payload = self.pop()?;
                if payload.is_none() {
                    return Err(Panic::recoverable("cannot throw none"));
                }
                return Err(Panic::new(payload, true));
            }
        }
        Ok(None)
    }

    fn finish_frame(&mut self, value: Value, root: usize) -> Result<Option<Value>, Panic> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| Panic::fatal("return without an active frame"))?;
        self.stack.truncate(frame.operand_base);
        let result = match (&frame.role, &frame.module) {
            (FrameRole::Class(class), _) => Value::Class(class.clone()),
            (FrameRole::Module | FrameRole::Import, Some(module)) => Value::Module(module.clone()),
            _ => value,
        };
        if self.frames.len() <= root {
            return Ok(Some(result));
        }
        self.push(result);
        Ok(None)
    }

    fn invoke(&mut self, callee: Value, mut args: Vec<Value>) -> Result<Invocation, Panic> {
        let Value::Function(function) = callee else {
            return Err(Panic::recoverable(format!(
                "{} is not callable",
                callee.type_name()
            )));
        };
        match function.as_ref() {
            Function::Method { receiver, function } => {
                args.insert(0, receiver.clone());
                self.invoke(Value::Function(function.clone()), args)
            }
            Function::Runtime(runtime) => {
                let locals = bind_arguments(runtime, args)?;
                let frame = Frame::script(
                    runtime.module.clone(),
                    runtime.chunk.clone(),
                    locals,
                    self.stack.len(),
                    FrameRole::Function,
                );
                self.push_frame(frame)?;
                Ok(Invocation::Pushed)
            }
            Function::Native(native) => {
                native.check_arity(args.len())?;
                self.push_frame(Frame::native(native.name.clone(), self.stack.len()))?;
                // On error the native frame stays for unwind to report.
                let value = (native.callback)(self, args)?;
                if let Some(frame) = self.frames.pop() {
                    self.stack.truncate(frame.operand_base);
                }
                Ok(Invocation::Returned(value))
            }
        }
    }

    fn import(&mut self, name: Rc<str>) -> Result<(), Panic> {
        let current = self.current_module()?;
        if current.name == name {
            return Err(Panic::recoverable(format!(
                "module {name} cannot import itself"
            )));
        }
        current.record_import(name.clone());
        if let Some(module) = self.modules.get(&name) {
            let module = module.clone();
            self.push(Value::Module(module));
            return Ok(());
        }
        let module = self
            .resolve_module(&name)
            .map_err(|error| Panic::recoverable(format!("cannot import {name}: {error}")))?;
        self.modules.insert(name, module.clone());
        self.push_module_frame(module, FrameRole::Import)
    }
}

fn malformed(instruction: &Instruction) -> Panic {
    Panic::fatal(format!(
        "malformed operands for {}",
        instruction.opcode.mnemonic()
    ))
}

fn imm8_operand(instruction: &Instruction, index: usize) -> Result<u8, Panic> {
    instruction
        .operands
        .get(index)
        .and_then(Operand::as_imm8)
        .ok_or_else(|| malformed(instruction))
}

fn constant_operand(instruction: &Instruction, index: usize) -> Result<&Constant, Panic> {
    instruction
        .operands
        .get(index)
        .and_then(Operand::as_constant)
        .ok_or_else(|| malformed(instruction))
}

fn symbol_operand(instruction: &Instruction, index: usize) -> Result<Rc<str>, Panic> {
    match constant_operand(instruction, index)? {
        Constant::String(name) => Ok(name.clone()),
        _ => Err(malformed(instruction)),
    }
}

fn chunk_operand(instruction: &Instruction, index: usize) -> Result<Rc<Chunk>, Panic> {
    constant_operand(instruction, index)?
        .as_chunk()
        .cloned()
        .ok_or_else(|| malformed(instruction))
}

/// Offsets are relative to the end of the jump instruction.
fn jump_target(instruction: &Instruction, next: usize) -> Result<usize, Panic> {
    let offset = instruction
        .jump_offset()
        .ok_or_else(|| malformed(instruction))?;
    next.checked_add_signed(isize::from(offset))
        .ok_or_else(|| Panic::fatal(format!("jump to negative offset from {next}")))
}

fn binary(opcode: Opcode, lhs: &Value, rhs: &Value) -> Result<Value, Panic> {
    let ordered = |accept: fn(std::cmp::Ordering) -> bool| -> Result<Value, Panic> {
        Ok(Value::Boolean(lhs.compare(rhs)?.map_or(false, accept)))
    };
    match opcode {
        Opcode::Add => lhs.add(rhs),
        Opcode::Sub => lhs.sub(rhs),
        Opcode::Mul => lhs.mul(rhs),
        Opcode::Div => lhs.div(rhs),
        Opcode::Mod => lhs.rem(rhs),
        Opcode::Eq => Ok(Value::Boolean(lhs.equals(rhs))),
        Opcode::Ne => Ok(Value::Boolean(!lhs.equals(rhs))),
        Opcode::Lt => ordered(|ordering| ordering.is_lt()),
        Opcode::Le => ordered(|ordering| ordering.is_le()),
        Opcode::Gt => ordered(|ordering| ordering.is_gt()),
        Opcode::Ge => ordered(|ordering| ordering.is_ge()),
        other => Err(Panic::fatal(format!(
            "{} is not a binary operator",
            other.mnemonic()
        ))),
    }
}

/// Bind a runtime function's argument list to its initial locals:
/// captured values, then arguments, then `none` padding.
fn bind_arguments(function: &RuntimeFunction, mut args: Vec<Value>) -> Result<Vec<Value>, Panic> {
    let chunk = &function.chunk;
    let expected = usize::from(chunk.arg_count);
    if chunk.is_variadic() {
        let fixed = expected.saturating_sub(1);
        if args.len() < fixed {
            return Err(Panic::recoverable(format!(
                "{}() takes at least {fixed} argument(s) but {} were given",
                function.name,
                args.len()
            )));
        }
        let rest = args.split_off(fixed);
        args.push(Value::array(rest));
    } else if args.len() != expected {
        return Err(Panic::recoverable(format!(
            "{}() takes {expected} argument(s) but {} were given",
            function.name,
            args.len()
        )));
    }
    let mut locals = function.bound.clone();
    locals.extend(args);
    let size = locals.len().max(usize::from(chunk.locals_count));
    locals.resize(size, Value::None);
    Ok(locals)
}

fn bind(value: Value, receiver: &Value) -> Value {
    match value {
        Value::Function(function) => Function::bind(&function, receiver.clone()),
        other => other,
    }
}

fn get_attribute(target: &Value, name: &str) -> Result<Value, Panic> {
    let found = match target {
        Value::Instance(instance) => instance.attribute(name).map(|value| bind(value, target)),
        Value::Proxy(proxy) => {
            let receiver = Value::Instance(proxy.instance.clone());
            proxy.attribute(name).map(|value| bind(value, &receiver))
        }
        Value::Class(class) => class.lookup(name),
        Value::Module(module) => module.global(name),
        Value::Array(items) if name == "length" => {
            Some(Value::Integer(items.borrow().len() as i64))
        }
        Value::String(text) if name == "length" => Some(Value::Integer(text.chars().count() as i64)),
        _ => None,
    };
    found.ok_or_else(|| {
        Panic::recoverable(format!(
            "{} has no attribute '{name}'",
            target.type_name()
        ))
    })
}

fn set_attribute(target: &Value, name: Rc<str>, value: Value) -> Result<(), Panic> {
    match target {
        Value::Instance(instance) => instance.set_attribute(name, value),
        Value::Proxy(proxy) => proxy.instance.set_attribute(name, value),
        Value::Class(class) => class.set_attribute(name, value),
        Value::Module(module) => module.set_global(name, value),
        other => {
            return Err(Panic::recoverable(format!(
                "cannot set attribute '{name}' on {}",
                other.type_name()
            )))
        }
    }
    Ok(())
}
