//! Parameter staging, calls and returns.
//!
//! `PARAM` pushes onto the caller's staging area. `CALL` reads the `RESULT`
//! markers that follow it, drains the staged values and either runs a native
//! function to completion or pushes a script frame. Script results travel
//! back through the callee's return slots when its final `RET` executes.
//!
//! By-reference parameters (`&dN`) are boxed into a fresh heap cell for the
//! duration of the call; the cell's contents are copied back into the
//! original register and the cell freed once the call ends, whether it
//! returned or aborted.

use super::frame::{Fetch, PendingCall, StagedParam, Writeback, fetch_konst};
use super::registers::Registers;
use super::{Frame, PtrReg, StrConst, Vm};
use crate::virtual_machine::errors::{AbortKind, Attribution, ScriptAbort, VMError};
use crate::virtual_machine::function::{Function, NativeFunction, ReturnSlot};
use crate::virtual_machine::heap::{Heap, POINTER_SIZE, STRING_SIZE};
use crate::virtual_machine::host::Host;
use crate::virtual_machine::isa::Instruction;
use crate::virtual_machine::operand::{RegBank, RegType, RetSlot, TypedOperand};
use crate::virtual_machine::value::{Address, BlockId, Pointer, Value};

fn unsupported(instruction: &'static str, ty: RegType) -> VMError {
    VMError::UnsupportedOperandType {
        instruction,
        ty: ty.0,
    }
}

/// Copies `value` into a newly allocated cell.
fn box_value(heap: &mut Heap, value: &Value) -> Result<BlockId, VMError> {
    let size = match value {
        Value::Int(_) => 4,
        Value::Float(_) => 8,
        Value::String(_) => STRING_SIZE,
        Value::Pointer(_) => POINTER_SIZE,
    };
    let cell = heap.alloc(size);
    let at = Address {
        block: cell,
        offset: 0,
    };
    let written = match value {
        Value::Int(v) => heap.write_bytes(at, &v.to_le_bytes()),
        Value::Float(v) => heap.write_bytes(at, &v.to_le_bytes()),
        Value::String(v) => heap.write_string(at, v.clone()),
        Value::Pointer(v) => heap.write_pointer(at, *v),
    };
    if let Err(err) = written {
        let _ = heap.free(cell);
        return Err(err);
    }
    Ok(cell)
}

fn unbox_value(heap: &Heap, bank: RegBank, cell: BlockId) -> Result<Value, VMError> {
    let at = Address {
        block: cell,
        offset: 0,
    };
    Ok(match bank {
        RegBank::Int => Value::Int(i32::from_le_bytes(heap.read_bytes(at)?)),
        RegBank::Float => Value::Float(f64::from_le_bytes(heap.read_bytes(at)?)),
        RegBank::String => Value::String(heap.read_string(at)?),
        RegBank::Pointer => Value::Pointer(heap.read_pointer(at)?),
    })
}

/// Moves the values a callee produced into the caller's registers.
fn deliver(
    regs: &mut Registers,
    targets: &[(RegType, u16)],
    slots: Vec<ReturnSlot>,
) -> Result<(), VMError> {
    for (slot, (&(ty, reg), result)) in targets.iter().zip(slots).enumerate() {
        let Some(value) = result.value else {
            continue;
        };
        if value.bank() != ty.bank() {
            return Err(VMError::ReturnTypeMismatch {
                slot,
                expected: ty.bank().as_str(),
                actual: value.type_name(),
            });
        }
        regs.set(reg, value)?;
    }
    Ok(())
}

impl Vm {
    // =========================
    // Parameters
    // =========================

    /// Fails unless `count` more values fit the staging area.
    fn check_staging(&self, count: usize) -> Result<(), VMError> {
        let frame = self.frame()?;
        let capacity = frame.function.layout.max_param as usize;
        if frame.staged.len() + count > capacity {
            return Err(VMError::StagingOverflow { capacity });
        }
        Ok(())
    }

    pub(super) fn op_param(
        &mut self,
        instr: &'static str,
        host: &mut dyn Host,
        operand: TypedOperand,
    ) -> Result<(), ScriptAbort> {
        let ty = operand.ty.validate()?;
        if ty.width() > 1 && ty.is_addrof() {
            return Err(unsupported(instr, ty).into());
        }
        let count = if ty.is_nil() { 1 } else { ty.width() };
        self.check_staging(count)?;

        let frame = self.frame()?;
        let plain = |value| StagedParam {
            value,
            writeback: None,
        };
        let params = if ty.is_nil() {
            vec![plain(Value::Pointer(Pointer::Null))]
        } else if ty.is_konst() {
            vec![plain(fetch_konst(frame, ty.bank(), operand.index)?)]
        } else if ty.width() > 1 {
            (0..count as u16)
                .map(|i| frame.regs.get(RegBank::Float, operand.index + i).map(plain))
                .collect::<Result<Vec<_>, _>>()?
        } else if ty.is_addrof() {
            let value = frame.regs.get(ty.bank(), operand.index)?;
            let cell = box_value(host.heap_mut(), &value)?;
            vec![StagedParam {
                value: Value::Pointer(Pointer::Addr(Address {
                    block: cell,
                    offset: 0,
                })),
                writeback: Some(Writeback {
                    bank: ty.bank(),
                    reg: operand.index,
                    cell,
                }),
            }]
        } else {
            vec![plain(frame.regs.get(ty.bank(), operand.index)?)]
        };
        self.frame_mut()?.staged.extend(params);
        Ok(())
    }

    pub(super) fn op_parami(&mut self, _instr: &'static str, imm: i32) -> Result<(), ScriptAbort> {
        self.check_staging(1)?;
        self.frame_mut()?.staged.push(StagedParam {
            value: Value::Int(imm),
            writeback: None,
        });
        Ok(())
    }

    // =========================
    // Calls
    // =========================

    /// Reads the `count` `RESULT` markers after the current call.
    fn result_targets(&mut self, count: u8) -> Result<Vec<(RegType, u16)>, VMError> {
        let frame = self.frame_mut()?;
        let start = frame.pc;
        let mut targets = Vec::with_capacity(count as usize);
        for offset in start..start + count as usize {
            let word = frame
                .word(offset)
                .map_err(|_| VMError::ExpectedResult { offset })?;
            if word.op() != Instruction::ResultSlot as u8 {
                return Err(VMError::ExpectedResult { offset });
            }
            let operand = crate::define_instructions!(@decode word, a_b, TO);
            let ty = operand.ty.validate()?;
            if ty.is_nil() || ty.is_konst() || ty.is_addrof() || ty.width() > 1 {
                return Err(unsupported(Instruction::ResultSlot.mnemonic(), ty));
            }
            targets.push((ty.plain(), operand.index));
        }
        frame.pc = start + count as usize;
        Ok(targets)
    }

    /// `CALL`/`CALL_K`: call the function in A with B staged parameters,
    /// expecting C results.
    pub(super) fn op_call<P: Fetch<Pointer>>(
        &mut self,
        _instr: &'static str,
        host: &mut dyn Host,
        target: P,
        params: u8,
        results: u8,
    ) -> Result<(), ScriptAbort> {
        let id = match target.fetch(self.frame()?)? {
            Pointer::Function(id) => id,
            other => {
                return Err(VMError::NotAFunction {
                    pointer: other.to_string(),
                }
                .into());
            }
        };
        let callee = self.functions.get(id)?.clone();
        let targets = self.result_targets(results)?;

        let frame = self.frame_mut()?;
        let available = frame.staged.len();
        if available < params as usize {
            return Err(VMError::StagingUnderflow {
                requested: params as usize,
                available,
            }
            .into());
        }
        self.check_depth()?;

        let frame = self.frame_mut()?;
        let staged = frame.staged.split_off(available - params as usize);
        let writebacks: Vec<Writeback> = staged.iter().filter_map(|p| p.writeback).collect();
        let args: Vec<Value> = staged.into_iter().map(|p| p.value).collect();

        match callee {
            Function::Native(native) => {
                let mut slots: Vec<ReturnSlot> =
                    targets.iter().map(|(ty, _)| ReturnSlot::new(*ty)).collect();
                let delivered = match self.call_native(host, &native, &args, &mut slots) {
                    Ok(_) => self
                        .frame_mut()
                        .and_then(|caller| deliver(&mut caller.regs, &targets, slots))
                        .map_err(ScriptAbort::from),
                    Err(abort) => Err(abort),
                };
                let restored = self.write_back(host, &writebacks);
                delivered?;
                restored?;
                Ok(())
            }
            Function::Script(script) => {
                let types: Vec<RegType> = targets.iter().map(|(ty, _)| *ty).collect();
                frame.pending = Some(PendingCall {
                    targets,
                    writebacks,
                });
                let callee = Frame::enter(script, args, types, host.heap_mut())?;
                self.stack.push(callee);
                Ok(())
            }
        }
    }

    /// Runs a native function, attributing any abort that escapes it.
    pub(super) fn call_native(
        &mut self,
        host: &mut dyn Host,
        native: &NativeFunction,
        args: &[Value],
        results: &mut [ReturnSlot],
    ) -> Result<usize, ScriptAbort> {
        self.native_depth += 1;
        let outcome = (native.entry)(self, host, args, results);
        self.native_depth -= 1;
        outcome.map_err(|abort| abort.attributed(Attribution::native(&native.name)))
    }

    /// Copies every by-reference cell back into its register and frees it.
    ///
    /// All cells are freed even if one of them fails to copy back.
    fn write_back(&mut self, host: &mut dyn Host, writebacks: &[Writeback]) -> Result<(), VMError> {
        let mut outcome = Ok(());
        for wb in writebacks {
            let copied = unbox_value(host.heap(), wb.bank, wb.cell)
                .and_then(|value| self.frame_mut()?.regs.set(wb.reg, value));
            let freed = host.heap_mut().free(wb.cell);
            if outcome.is_ok() {
                outcome = copied.and(freed);
            }
        }
        outcome
    }

    /// `VTBL`: fetch virtual function `slot` of the object's class.
    pub(super) fn op_vtbl(
        &mut self,
        _instr: &'static str,
        host: &mut dyn Host,
        a: PtrReg,
        b: PtrReg,
        slot: u8,
    ) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let obj = match frame.regs.pointer(b)? {
            Pointer::Null => return Err(ScriptAbort::new(AbortKind::ReadNil)),
            Pointer::Object(obj) => obj,
            other => {
                return Err(VMError::NotAnObject {
                    pointer: other.to_string(),
                }
                .into());
            }
        };
        let heap = host.heap();
        let class_id = heap.object_class(obj)?;
        let class = heap.classes.get(class_id).ok_or(VMError::DanglingReference {
            what: "class",
            index: class_id.0,
        })?;
        let func = class
            .virtuals
            .get(slot as usize)
            .copied()
            .ok_or_else(|| VMError::VirtualSlotOutOfRange {
                class: class.name.clone(),
                slot: slot as usize,
            })?;
        frame.regs.set_pointer(a, Pointer::Function(func))?;
        Ok(())
    }

    /// `RESULT` markers are consumed by the call before them.
    pub(super) fn op_result(&mut self, _instr: &'static str, _operand: TypedOperand) -> Result<(), ScriptAbort> {
        let offset = self.frame()?.current;
        Err(VMError::StrayResult { offset }.into())
    }

    // =========================
    // Returns
    // =========================

    /// Writes a returned value into result slot `slot`, if the caller asked
    /// for that many.
    fn store_return(&mut self, slot: usize, value: Value) -> Result<(), VMError> {
        let frame = self.frame_mut()?;
        let Some(result) = frame.results.get_mut(slot) else {
            return Ok(());
        };
        result.set(slot, value)?;
        frame.returned = frame.returned.max(slot + 1);
        Ok(())
    }

    pub(super) fn op_ret(
        &mut self,
        instr: &'static str,
        host: &mut dyn Host,
        ret: RetSlot,
        operand: TypedOperand,
    ) -> Result<(), ScriptAbort> {
        let ty = operand.ty.validate()?;
        if !ty.is_nil() {
            if ty.width() > 1 || ty.is_addrof() {
                return Err(unsupported(instr, ty).into());
            }
            let frame = self.frame()?;
            let value = if ty.is_konst() {
                fetch_konst(frame, ty.bank(), operand.index)?
            } else {
                frame.regs.get(ty.bank(), operand.index)?
            };
            self.store_return(ret.slot(), value)?;
        }
        if ret.is_final() {
            self.finish_frame(host)?;
        }
        Ok(())
    }

    pub(super) fn op_reti(
        &mut self,
        _instr: &'static str,
        host: &mut dyn Host,
        ret: RetSlot,
        imm: i16,
    ) -> Result<(), ScriptAbort> {
        self.store_return(ret.slot(), Value::Int(imm as i32))?;
        if ret.is_final() {
            self.finish_frame(host)?;
        }
        Ok(())
    }

    /// Pops the current frame and hands its results to whoever called it.
    fn finish_frame(&mut self, host: &mut dyn Host) -> Result<(), VMError> {
        let mut frame = self.stack.pop().ok_or(VMError::NoActiveFrame)?;
        let results = std::mem::take(&mut frame.results);
        let returned = frame.returned;
        let host_entry = frame.host_entry;
        frame.release(host.heap_mut());

        if host_entry {
            self.completed = Some((results, returned));
            return Ok(());
        }

        let caller = self.frame_mut()?;
        let pending = caller.pending.take().ok_or(VMError::NoActiveFrame)?;
        let delivered = deliver(&mut caller.regs, &pending.targets, results);
        let restored = self.write_back(host, &pending.writebacks);
        delivered.and(restored)
    }

    /// `THROW kind, k`: abort with the message in string constant k.
    pub(super) fn op_throw(&mut self, _instr: &'static str, kind: u8, message: StrConst) -> Result<(), ScriptAbort> {
        let kind = AbortKind::try_from(kind)?;
        let message = message.fetch(self.frame()?)?;
        Err(if message.is_empty() {
            ScriptAbort::new(kind)
        } else {
            ScriptAbort::with_detail(kind, message)
        })
    }
}
