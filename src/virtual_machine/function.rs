//! Callable entities and the table that names them.
//!
//! Script functions are loaded from [`Module`]s and shared through `Arc`, so a
//! hot reload that replaces a table entry never invalidates frames already
//! running the old code. Native functions are plain function pointers that
//! receive the VM and host and may call back into scripts.

use crate::info;
use crate::virtual_machine::errors::{Attribution, ScriptAbort, VMError};
use crate::virtual_machine::heap::ClassRegistry;
use crate::virtual_machine::host::Host;
use crate::virtual_machine::operand::RegType;
use crate::virtual_machine::program::{CompiledFunction, FrameLayout, LineTable, Module, Symbol};
use crate::virtual_machine::value::{FunctionId, Pointer, Value};
use crate::virtual_machine::vm::Vm;
use std::collections::HashMap;
use std::sync::Arc;

/// Entry point of a native function.
///
/// Receives the staged arguments in push order and one slot per result the
/// caller expects. Returns how many results it produced; slots it leaves
/// unset are not written back.
pub type NativeFn =
    fn(&mut Vm, &mut dyn Host, &[Value], &mut [ReturnSlot]) -> Result<usize, ScriptAbort>;

/// A result slot handed to a callee.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnSlot {
    /// Type tag the caller declared for this slot.
    pub ty: RegType,
    pub value: Option<Value>,
}

impl ReturnSlot {
    pub fn new(ty: RegType) -> Self {
        Self { ty, value: None }
    }

    /// Stores `value`, checking it against the declared type.
    pub fn set(&mut self, slot: usize, value: Value) -> Result<(), VMError> {
        if value.bank() != self.ty.bank() {
            return Err(VMError::ReturnTypeMismatch {
                slot,
                expected: self.ty.bank().as_str(),
                actual: value.type_name(),
            });
        }
        self.value = Some(value);
        Ok(())
    }
}

/// A loaded script function with its pointer pool resolved.
#[derive(Debug)]
pub struct ScriptFunction {
    pub name: String,
    pub source_file: String,
    pub code: Vec<u32>,
    pub ints: Vec<i32>,
    pub floats: Vec<f64>,
    pub strings: Vec<String>,
    pub pointers: Vec<Pointer>,
    pub layout: FrameLayout,
    pub lines: LineTable,
}

impl ScriptFunction {
    /// Resolves every pointer-pool symbol of `compiled` with `resolve`.
    pub fn link(
        compiled: &CompiledFunction,
        mut resolve: impl FnMut(&Symbol) -> Result<Pointer, VMError>,
    ) -> Result<Self, VMError> {
        let pointers = compiled
            .pointers
            .iter()
            .map(&mut resolve)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: compiled.name.clone(),
            source_file: compiled.source_file.clone(),
            code: compiled.code.clone(),
            ints: compiled.ints.clone(),
            floats: compiled.floats.clone(),
            strings: compiled.strings.clone(),
            pointers,
            layout: compiled.layout.clone(),
            lines: compiled.lines.clone(),
        })
    }

    /// Diagnostic location of the instruction at `offset`.
    pub fn attribution(&self, offset: usize) -> Attribution {
        Attribution::Script {
            function: self.name.clone(),
            file: self.source_file.clone(),
            line: self.lines.line_for(offset),
        }
    }
}

#[derive(Clone)]
pub struct NativeFunction {
    pub name: Arc<str>,
    pub entry: NativeFn,
}

#[derive(Clone)]
pub enum Function {
    Script(Arc<ScriptFunction>),
    Native(NativeFunction),
}

impl Function {
    pub fn name(&self) -> &str {
        match self {
            Function::Script(f) => &f.name,
            Function::Native(f) => &f.name,
        }
    }
}

/// All callable functions, addressable by id or case-insensitive name.
#[derive(Default)]
pub struct FunctionTable {
    entries: Vec<Function>,
    by_name: HashMap<String, FunctionId>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, function: Function) -> FunctionId {
        let key = function.name().to_ascii_lowercase();
        if let Some(id) = self.by_name.get(&key) {
            self.entries[id.0 as usize] = function;
            return *id;
        }
        let id = FunctionId(self.entries.len() as u32);
        self.entries.push(function);
        self.by_name.insert(key, id);
        id
    }

    /// Registers (or replaces) a native function.
    pub fn register_native(&mut self, name: &str, entry: NativeFn) -> FunctionId {
        self.insert(Function::Native(NativeFunction {
            name: Arc::from(name),
            entry,
        }))
    }

    /// Registers (or replaces) an already linked script function.
    pub fn register_script(&mut self, function: ScriptFunction) -> FunctionId {
        self.insert(Function::Script(Arc::new(function)))
    }

    pub fn lookup(&self, name: &str) -> Option<FunctionId> {
        self.by_name.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn get(&self, id: FunctionId) -> Result<&Function, VMError> {
        self.entries
            .get(id.0 as usize)
            .ok_or(VMError::UndefinedFunctionId { id: id.0 })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Links and installs every function of `module`.
    ///
    /// Function symbols may refer to functions of the same module or to
    /// anything already registered. Redefinitions replace the existing entry
    /// under the same id. Nothing is installed if any symbol fails to resolve.
    pub fn load_module(
        &mut self,
        module: &Module,
        classes: &ClassRegistry,
    ) -> Result<Vec<FunctionId>, VMError> {
        let mut local: HashMap<String, FunctionId> = HashMap::new();
        let mut ids = Vec::with_capacity(module.functions.len());
        let mut next = self.entries.len() as u32;
        for f in &module.functions {
            let key = f.name.to_ascii_lowercase();
            if local.contains_key(&key) {
                return Err(VMError::DuplicateFunction {
                    name: f.name.clone(),
                });
            }
            let id = match self.by_name.get(&key) {
                Some(id) => *id,
                None => {
                    next += 1;
                    FunctionId(next - 1)
                }
            };
            local.insert(key, id);
            ids.push(id);
        }

        let resolve = |symbol: &Symbol| -> Result<Pointer, VMError> {
            match symbol {
                Symbol::Null => Ok(Pointer::Null),
                Symbol::Function(name) => local
                    .get(&name.to_ascii_lowercase())
                    .copied()
                    .or_else(|| self.lookup(name))
                    .map(Pointer::Function)
                    .ok_or_else(|| VMError::UndefinedFunction { name: name.clone() }),
                Symbol::Class(name) => classes
                    .lookup(name)
                    .map(Pointer::Class)
                    .ok_or_else(|| VMError::UndefinedClass { name: name.clone() }),
            }
        };
        let linked = module
            .functions
            .iter()
            .map(|f| ScriptFunction::link(f, &resolve))
            .collect::<Result<Vec<_>, _>>()?;

        for (function, id) in linked.into_iter().zip(&ids) {
            if (id.0 as usize) < self.entries.len() {
                info!("reloading function {}", function.name);
            }
            let installed = self.register_script(function);
            debug_assert_eq!(installed, *id);
        }
        Ok(ids)
    }

    /// Managed objects referenced from constant pools.
    pub fn gc_roots(&self) -> impl Iterator<Item = Pointer> + '_ {
        self.entries
            .iter()
            .filter_map(|f| match f {
                Function::Script(script) => Some(script.pointers.iter()),
                Function::Native(_) => None,
            })
            .flatten()
            .filter(|p| p.as_object().is_some())
            .copied()
    }
}
