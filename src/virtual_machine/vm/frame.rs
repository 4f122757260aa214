use super::registers::{
    FloatConst, FloatReg, IntConst, IntReg, PtrConst, PtrReg, Registers, StrConst, StrReg,
};
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::function::{ReturnSlot, ScriptFunction};
use crate::virtual_machine::heap::Heap;
use crate::virtual_machine::isa::Word;
use crate::virtual_machine::operand::{RegBank, RegType};
use crate::virtual_machine::value::{Address, BlockId, Pointer, Value};
use std::sync::Arc;

/// A by-reference argument: the register it came from and the heap cell
/// standing in for it during the call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Writeback {
    pub bank: RegBank,
    pub reg: u16,
    pub cell: BlockId,
}

#[derive(Debug)]
pub(crate) struct StagedParam {
    pub value: Value,
    pub writeback: Option<Writeback>,
}

/// Where a script callee's results go once it returns.
#[derive(Debug)]
pub(crate) struct PendingCall {
    /// Declared type and destination register per result slot.
    pub targets: Vec<(RegType, u16)>,
    pub writebacks: Vec<Writeback>,
}

/// Live state of one script function invocation.
pub struct Frame {
    pub(crate) function: Arc<ScriptFunction>,
    pub(crate) regs: Registers,
    /// Next instruction to execute.
    pub(crate) pc: usize,
    /// Instruction currently executing, for diagnostics.
    pub(crate) current: usize,
    pub(crate) staged: Vec<StagedParam>,
    pub(crate) extra: Option<BlockId>,
    /// Set while a script callee of this frame is running.
    pub(crate) pending: Option<PendingCall>,
    /// Slots the caller asked this frame to fill.
    pub(crate) results: Vec<ReturnSlot>,
    /// One past the highest slot written by `RET`.
    pub(crate) returned: usize,
    /// Entered through [`Vm::call`](super::Vm::call) rather than a `CALL` instruction.
    pub(crate) host_entry: bool,
}

impl Frame {
    /// Builds a frame for `function`, moving `args` into its banks in order
    /// per bank and reserving its extra space.
    pub(crate) fn enter(
        function: Arc<ScriptFunction>,
        args: Vec<Value>,
        result_types: impl IntoIterator<Item = RegType>,
        heap: &mut Heap,
    ) -> Result<Self, VMError> {
        let mut regs = Registers::new(&function.layout);
        let mut next = [0u16; 4];
        for arg in args {
            let bank = arg.bank();
            let slot = &mut next[bank as usize];
            if *slot as usize >= regs.len(bank) {
                return Err(VMError::ArgumentsExceedFrame {
                    function: function.name.clone(),
                    bank: bank.as_str(),
                });
            }
            regs.set(*slot, arg)?;
            *slot += 1;
        }

        let extra = match function.layout.extra_space {
            0 => None,
            size => Some(heap.alloc(size)),
        };

        Ok(Self {
            function,
            regs,
            pc: 0,
            current: 0,
            staged: Vec::new(),
            extra,
            pending: None,
            results: result_types.into_iter().map(ReturnSlot::new).collect(),
            returned: 0,
            host_entry: false,
        })
    }

    /// Fetches the code word at `offset`.
    pub(crate) fn word(&self, offset: usize) -> Result<Word, VMError> {
        let code = &self.function.code;
        if offset == code.len() {
            return Err(VMError::FellOffEnd {
                function: self.function.name.clone(),
            });
        }
        code.get(offset)
            .copied()
            .map(Word)
            .ok_or(VMError::CodeOutOfRange {
                pc: offset,
                len: code.len(),
            })
    }

    /// Moves the instruction pointer relative to the next instruction.
    pub(crate) fn jump_from(&mut self, from: usize, delta: i64) -> Result<(), VMError> {
        let len = self.function.code.len();
        let target = from as i64 + delta;
        if target < 0 || target as usize > len {
            return Err(VMError::CodeOutOfRange {
                pc: target.max(0) as usize,
                len,
            });
        }
        self.pc = target as usize;
        Ok(())
    }

    /// Address of the extra space, or null when the function declares none.
    pub(crate) fn extra_pointer(&self) -> Pointer {
        match self.extra {
            Some(block) => Pointer::Addr(Address { block, offset: 0 }),
            None => Pointer::Null,
        }
    }

    /// Frees the extra space and any by-reference cells still owned by this
    /// frame.
    pub(crate) fn release(self, heap: &mut Heap) {
        let cells = self
            .staged
            .iter()
            .filter_map(|p| p.writeback)
            .chain(self.pending.iter().flat_map(|p| p.writebacks.iter().copied()))
            .map(|w| w.cell);
        for block in self.extra.into_iter().chain(cells) {
            // Already-freed cells are not an error while unwinding.
            let _ = heap.free(block);
        }
    }

    /// Pointers held by this frame, for garbage-collection roots.
    ///
    /// Includes the pointer pool of the code this frame runs, which may be a
    /// version the function table has since replaced.
    pub(crate) fn roots(&self) -> impl Iterator<Item = Pointer> + '_ {
        let staged = self.staged.iter().filter_map(|p| p.value.as_pointer());
        let cells = self
            .pending
            .iter()
            .flat_map(|p| p.writebacks.iter())
            .map(|w| Pointer::Addr(Address { block: w.cell, offset: 0 }));
        self.regs
            .pointers()
            .chain(staged)
            .chain(cells)
            .chain(self.function.pointers.iter().copied())
            .chain(std::iter::once(self.extra_pointer()))
            .filter(|p| !p.is_null())
    }
}

/// Reads an operand value from a register or the constant pool.
///
/// Lets one handler serve the register/register, register/constant and
/// constant/register forms of an instruction.
pub(crate) trait Fetch<T> {
    fn fetch(self, frame: &Frame) -> Result<T, VMError>;
}

fn konst<T: Clone>(pool: &[T], name: &'static str, index: usize) -> Result<T, VMError> {
    pool.get(index)
        .cloned()
        .ok_or(VMError::ConstantOutOfRange {
            pool: name,
            index,
            available: pool.len(),
        })
}

impl Fetch<i32> for IntReg {
    fn fetch(self, frame: &Frame) -> Result<i32, VMError> {
        frame.regs.int(self)
    }
}

impl Fetch<i32> for IntConst {
    fn fetch(self, frame: &Frame) -> Result<i32, VMError> {
        konst(&frame.function.ints, "int", self.0 as usize)
    }
}

impl Fetch<i32> for u8 {
    fn fetch(self, _frame: &Frame) -> Result<i32, VMError> {
        Ok(self as i32)
    }
}

impl Fetch<i32> for u16 {
    fn fetch(self, _frame: &Frame) -> Result<i32, VMError> {
        Ok(self as i32)
    }
}

impl Fetch<i32> for i8 {
    fn fetch(self, _frame: &Frame) -> Result<i32, VMError> {
        Ok(self as i32)
    }
}

impl Fetch<f64> for FloatReg {
    fn fetch(self, frame: &Frame) -> Result<f64, VMError> {
        frame.regs.float(self)
    }
}

impl Fetch<f64> for FloatConst {
    fn fetch(self, frame: &Frame) -> Result<f64, VMError> {
        konst(&frame.function.floats, "float", self.0 as usize)
    }
}

impl<const N: usize> Fetch<[f64; N]> for FloatReg {
    fn fetch(self, frame: &Frame) -> Result<[f64; N], VMError> {
        frame.regs.vector(self)
    }
}

/// Vector constants occupy consecutive float-pool entries.
impl<const N: usize> Fetch<[f64; N]> for FloatConst {
    fn fetch(self, frame: &Frame) -> Result<[f64; N], VMError> {
        let mut out = [0.0; N];
        for (i, component) in out.iter_mut().enumerate() {
            *component = konst(&frame.function.floats, "float", self.0 as usize + i)?;
        }
        Ok(out)
    }
}

impl Fetch<String> for StrReg {
    fn fetch(self, frame: &Frame) -> Result<String, VMError> {
        frame.regs.string(self).map(str::to_string)
    }
}

impl Fetch<String> for StrConst {
    fn fetch(self, frame: &Frame) -> Result<String, VMError> {
        konst(&frame.function.strings, "string", self.0 as usize)
    }
}

impl Fetch<Pointer> for PtrReg {
    fn fetch(self, frame: &Frame) -> Result<Pointer, VMError> {
        frame.regs.pointer(self)
    }
}

impl Fetch<Pointer> for PtrConst {
    fn fetch(self, frame: &Frame) -> Result<Pointer, VMError> {
        konst(&frame.function.pointers, "pointer", self.0 as usize)
    }
}

/// Reads a constant of `bank` as a tagged value.
pub(crate) fn fetch_konst(frame: &Frame, bank: RegBank, index: u16) -> Result<Value, VMError> {
    Ok(match bank {
        RegBank::Int => Value::Int(IntConst(index).fetch(frame)?),
        RegBank::Float => Value::Float(FloatConst(index).fetch(frame)?),
        RegBank::String => Value::String(StrConst(index).fetch(frame)?),
        RegBank::Pointer => Value::Pointer(PtrConst(index).fetch(frame)?),
    })
}
