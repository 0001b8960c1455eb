//! Sable virtual machine: object model, dispatch loop, module loading.

pub mod cache;
pub mod config;
pub mod error;
pub mod frame;
pub mod loader;
pub mod machine;
pub mod natives;
pub mod object;
pub mod panic;
pub mod profiler;
pub mod value;

pub use cache::{CacheError, CacheFile};
pub use config::{ConfigError, MachineConfig};
pub use error::VmError;
pub use frame::{Frame, FrameRole};
pub use loader::{
    CacheLoader, CompileError, LoadError, MemoryLoader, ModuleLoader, ModuleSource, SourceCompiler,
};
pub use machine::Machine;
pub use natives::{NativeDescriptor, NativeFn, NativeFunction, NativeRegistry, NativeResult};
pub use object::{Class, Function, Instance, Module, Proxy, RuntimeFunction};
pub use panic::Panic;
pub use profiler::{ProfileReport, Profiler};
pub use value::Value;
