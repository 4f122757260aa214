use super::frame::Fetch;
use super::{FloatReg, IntReg, PtrReg, StrReg, Vm};
use crate::virtual_machine::errors::{ScriptAbort, VMError};
use crate::virtual_machine::host::Host;
use crate::virtual_machine::operand::{CastKind, CastbKind};
use crate::virtual_machine::value::{
    ClassId, Pointer, format_float, format_vector, parse_leading_float, parse_leading_int,
};

fn class_of(pointer: Pointer) -> Result<ClassId, VMError> {
    match pointer {
        Pointer::Class(class) => Ok(class),
        other => Err(VMError::NotAClass {
            pointer: other.to_string(),
        }),
    }
}

impl Vm {
    /// `CAST`: the kind selects which banks A and B index.
    pub(super) fn op_cast(
        &mut self,
        _instr: &'static str,
        host: &mut dyn Host,
        a: u16,
        b: u16,
        kind: u8,
    ) -> Result<(), ScriptAbort> {
        let kind = CastKind::try_from(kind)?;
        let regs = &mut self.frame_mut()?.regs;
        match kind {
            CastKind::I2F => {
                let v = regs.int(IntReg(b))?;
                regs.set_float(FloatReg(a), v as f64)?;
            }
            CastKind::U2F => {
                let v = regs.int(IntReg(b))? as u32;
                regs.set_float(FloatReg(a), v as f64)?;
            }
            CastKind::F2I => {
                let v = regs.float(FloatReg(b))?;
                regs.set_int(IntReg(a), v as i32)?;
            }
            CastKind::F2U => {
                let v = regs.float(FloatReg(b))?;
                regs.set_int(IntReg(a), v as u32 as i32)?;
            }
            CastKind::I2S => {
                let v = regs.int(IntReg(b))?;
                regs.set_string(StrReg(a), v.to_string())?;
            }
            CastKind::U2S => {
                let v = regs.int(IntReg(b))? as u32;
                regs.set_string(StrReg(a), v.to_string())?;
            }
            CastKind::F2S => {
                let v = regs.float(FloatReg(b))?;
                regs.set_string(StrReg(a), format_float(v))?;
            }
            CastKind::V22S => {
                let v = regs.vector::<2>(FloatReg(b))?;
                regs.set_string(StrReg(a), format_vector(&v))?;
            }
            CastKind::V32S => {
                let v = regs.vector::<3>(FloatReg(b))?;
                regs.set_string(StrReg(a), format_vector(&v))?;
            }
            CastKind::P2S => {
                let v = regs.pointer(PtrReg(b))?;
                regs.set_string(StrReg(a), v.to_string())?;
            }
            CastKind::S2I => {
                let v = parse_leading_int(regs.string(StrReg(b))?);
                regs.set_int(IntReg(a), v)?;
            }
            CastKind::S2F => {
                let v = parse_leading_float(regs.string(StrReg(b))?);
                regs.set_float(FloatReg(a), v)?;
            }
            CastKind::S2N => {
                let v = host.names_mut().intern(regs.string(StrReg(b))?);
                regs.set_int(IntReg(a), v)?;
            }
            CastKind::N2S => {
                let index = regs.int(IntReg(b))?;
                let name = host
                    .names()
                    .get(index)
                    .ok_or(VMError::UnknownName { index })?
                    .to_string();
                regs.set_string(StrReg(a), name)?;
            }
        }
        Ok(())
    }

    /// `CASTB`: dA = 1 if xB is "truthy" for its bank, else 0.
    pub(super) fn op_castb(&mut self, _instr: &'static str, a: IntReg, b: u16, kind: u8) -> Result<(), ScriptAbort> {
        let kind = CastbKind::try_from(kind)?;
        let regs = &mut self.frame_mut()?.regs;
        let truth = match kind {
            CastbKind::I2B => regs.int(IntReg(b))? != 0,
            CastbKind::F2B => regs.float(FloatReg(b))? != 0.0,
            CastbKind::A2B => !regs.pointer(PtrReg(b))?.is_null(),
            CastbKind::S2B => !regs.string(StrReg(b))?.is_empty(),
        };
        regs.set_int(a, truth as i32)?;
        Ok(())
    }

    /// aA = aB when the object's class is C or one of its descendants,
    /// null otherwise.
    pub(super) fn op_dyncast(
        &mut self,
        _instr: &'static str,
        host: &mut dyn Host,
        a: PtrReg,
        b: PtrReg,
        c: impl Fetch<Pointer>,
    ) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let class = class_of(c.fetch(frame)?)?;
        let result = match frame.regs.pointer(b)? {
            Pointer::Null => Pointer::Null,
            Pointer::Object(obj) if host.is_kind_of(obj, class) => Pointer::Object(obj),
            Pointer::Object(_) => Pointer::Null,
            other => {
                return Err(VMError::NotAnObject {
                    pointer: other.to_string(),
                }
                .into());
            }
        };
        frame.regs.set_pointer(a, result)?;
        Ok(())
    }

    /// Class-to-class form of [`op_dyncast`](Self::op_dyncast).
    pub(super) fn op_dyncastc(
        &mut self,
        _instr: &'static str,
        host: &mut dyn Host,
        a: PtrReg,
        b: PtrReg,
        c: impl Fetch<Pointer>,
    ) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let ancestor = class_of(c.fetch(frame)?)?;
        let result = match frame.regs.pointer(b)? {
            Pointer::Null => Pointer::Null,
            other => {
                let class = class_of(other)?;
                if host.is_descendant_of(class, ancestor) {
                    other
                } else {
                    Pointer::Null
                }
            }
        };
        frame.regs.set_pointer(a, result)?;
        Ok(())
    }
}
