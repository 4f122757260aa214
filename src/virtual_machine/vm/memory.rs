//! Loads and stores through pointer registers.
//!
//! Every access computes `base + offset` with the base taken from a pointer
//! register and the offset from an int constant or register. A null base is
//! a script abort (`ReadNil` for loads, `WriteNil` for stores); an address
//! outside the block is a contract violation.

use super::frame::Fetch;
use super::{FloatReg, IntReg, PtrReg, StrReg, Vm};
use crate::virtual_machine::errors::{AbortKind, ScriptAbort, VMError};
use crate::virtual_machine::host::Host;
use crate::virtual_machine::value::{Address, Pointer};

impl Vm {
    /// Resolves `*base + offset`, aborting with `nil` when the base is null.
    fn effective_address(
        &self,
        host: &dyn Host,
        base: PtrReg,
        offset: impl Fetch<i32>,
        nil: AbortKind,
    ) -> Result<Address, ScriptAbort> {
        let frame = self.frame()?;
        let pointer = frame.regs.pointer(base)?;
        let offset = offset.fetch(frame)?;
        let heap = host.heap();
        match heap.resolve(pointer)? {
            Some(addr) => Ok(heap.displace(addr, offset as i64)?),
            None => Err(ScriptAbort::new(nil)),
        }
    }

    fn load_int<const N: usize>(
        &mut self,
        host: &mut dyn Host,
        a: IntReg,
        b: PtrReg,
        c: impl Fetch<i32>,
        widen: impl FnOnce([u8; N]) -> i32,
    ) -> Result<(), ScriptAbort> {
        let addr = self.effective_address(host, b, c, AbortKind::ReadNil)?;
        let v = widen(host.heap().read_bytes::<N>(addr)?);
        self.frame_mut()?.regs.set_int(a, v)?;
        Ok(())
    }

    fn store_bytes(
        &mut self,
        host: &mut dyn Host,
        a: PtrReg,
        c: impl Fetch<i32>,
        bytes: &[u8],
    ) -> Result<(), ScriptAbort> {
        let addr = self.effective_address(host, a, c, AbortKind::WriteNil)?;
        host.heap_mut().write_bytes(addr, bytes)?;
        Ok(())
    }

    fn load_vector<const N: usize>(
        &mut self,
        host: &mut dyn Host,
        a: FloatReg,
        b: PtrReg,
        c: impl Fetch<i32>,
    ) -> Result<(), ScriptAbort> {
        let addr = self.effective_address(host, b, c, AbortKind::ReadNil)?;
        let heap = host.heap();
        let mut v = [0.0; N];
        for (i, component) in v.iter_mut().enumerate() {
            let at = heap.displace(addr, i as i64 * 8)?;
            *component = f64::from_le_bytes(heap.read_bytes::<8>(at)?);
        }
        self.frame_mut()?.regs.set_vector(a, v)?;
        Ok(())
    }

    fn store_vector<const N: usize>(
        &mut self,
        host: &mut dyn Host,
        a: PtrReg,
        b: FloatReg,
        c: impl Fetch<i32>,
    ) -> Result<(), ScriptAbort> {
        let v = self.frame()?.regs.vector::<N>(b)?;
        let bytes: Vec<u8> = v.iter().flat_map(|x| x.to_le_bytes()).collect();
        self.store_bytes(host, a, c, &bytes)
    }

    // =========================
    // Loads
    // =========================

    pub(super) fn op_lb(&mut self, _instr: &'static str, host: &mut dyn Host, a: IntReg, b: PtrReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.load_int::<1>(host, a, b, c, |v| i8::from_le_bytes(v) as i32)
    }

    pub(super) fn op_lbu(&mut self, _instr: &'static str, host: &mut dyn Host, a: IntReg, b: PtrReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.load_int::<1>(host, a, b, c, |v| v[0] as i32)
    }

    pub(super) fn op_lh(&mut self, _instr: &'static str, host: &mut dyn Host, a: IntReg, b: PtrReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.load_int::<2>(host, a, b, c, |v| i16::from_le_bytes(v) as i32)
    }

    pub(super) fn op_lhu(&mut self, _instr: &'static str, host: &mut dyn Host, a: IntReg, b: PtrReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.load_int::<2>(host, a, b, c, |v| u16::from_le_bytes(v) as i32)
    }

    pub(super) fn op_lw(&mut self, _instr: &'static str, host: &mut dyn Host, a: IntReg, b: PtrReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.load_int::<4>(host, a, b, c, i32::from_le_bytes)
    }

    pub(super) fn op_lsp(&mut self, _instr: &'static str, host: &mut dyn Host, a: FloatReg, b: PtrReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        let addr = self.effective_address(host, b, c, AbortKind::ReadNil)?;
        let v = f32::from_le_bytes(host.heap().read_bytes::<4>(addr)?);
        self.frame_mut()?.regs.set_float(a, v as f64)?;
        Ok(())
    }

    pub(super) fn op_ldp(&mut self, _instr: &'static str, host: &mut dyn Host, a: FloatReg, b: PtrReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        let addr = self.effective_address(host, b, c, AbortKind::ReadNil)?;
        let v = f64::from_le_bytes(host.heap().read_bytes::<8>(addr)?);
        self.frame_mut()?.regs.set_float(a, v)?;
        Ok(())
    }

    pub(super) fn op_ls(&mut self, _instr: &'static str, host: &mut dyn Host, a: StrReg, b: PtrReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        let addr = self.effective_address(host, b, c, AbortKind::ReadNil)?;
        let v = host.heap().read_string(addr)?;
        self.frame_mut()?.regs.set_string(a, v)?;
        Ok(())
    }

    /// Loads the NUL-terminated string a stored pointer refers to. A null
    /// stored pointer reads as the empty string.
    pub(super) fn op_lcs(&mut self, _instr: &'static str, host: &mut dyn Host, a: StrReg, b: PtrReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        let addr = self.effective_address(host, b, c, AbortKind::ReadNil)?;
        let heap = host.heap();
        let v = match heap.resolve(heap.read_pointer(addr)?)? {
            Some(target) => heap.read_cstring(target)?,
            None => String::new(),
        };
        self.frame_mut()?.regs.set_string(a, v)?;
        Ok(())
    }

    /// `LO` and `LP`: managed and raw pointer loads read the same slot.
    pub(super) fn op_lp(&mut self, _instr: &'static str, host: &mut dyn Host, a: PtrReg, b: PtrReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        let addr = self.effective_address(host, b, c, AbortKind::ReadNil)?;
        let v = host.heap().read_pointer(addr)?;
        self.frame_mut()?.regs.set_pointer(a, v)?;
        Ok(())
    }

    pub(super) fn op_lv2(&mut self, _instr: &'static str, host: &mut dyn Host, a: FloatReg, b: PtrReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.load_vector::<2>(host, a, b, c)
    }

    pub(super) fn op_lv3(&mut self, _instr: &'static str, host: &mut dyn Host, a: FloatReg, b: PtrReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.load_vector::<3>(host, a, b, c)
    }

    pub(super) fn op_lbit(&mut self, _instr: &'static str, host: &mut dyn Host, a: IntReg, b: PtrReg, mask: u8) -> Result<(), ScriptAbort> {
        let addr = self.effective_address(host, b, 0u8, AbortKind::ReadNil)?;
        let [byte] = host.heap().read_bytes::<1>(addr)?;
        self.frame_mut()?.regs.set_int(a, (byte & mask != 0) as i32)?;
        Ok(())
    }

    // =========================
    // Stores
    // =========================

    pub(super) fn op_sb(&mut self, _instr: &'static str, host: &mut dyn Host, a: PtrReg, b: IntReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        let v = self.frame()?.regs.int(b)? as u8;
        self.store_bytes(host, a, c, &[v])
    }

    pub(super) fn op_sh(&mut self, _instr: &'static str, host: &mut dyn Host, a: PtrReg, b: IntReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        let v = self.frame()?.regs.int(b)? as u16;
        self.store_bytes(host, a, c, &v.to_le_bytes())
    }

    pub(super) fn op_sw(&mut self, _instr: &'static str, host: &mut dyn Host, a: PtrReg, b: IntReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        let v = self.frame()?.regs.int(b)?;
        self.store_bytes(host, a, c, &v.to_le_bytes())
    }

    pub(super) fn op_ssp(&mut self, _instr: &'static str, host: &mut dyn Host, a: PtrReg, b: FloatReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        let v = self.frame()?.regs.float(b)? as f32;
        self.store_bytes(host, a, c, &v.to_le_bytes())
    }

    pub(super) fn op_sdp(&mut self, _instr: &'static str, host: &mut dyn Host, a: PtrReg, b: FloatReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        let v = self.frame()?.regs.float(b)?;
        self.store_bytes(host, a, c, &v.to_le_bytes())
    }

    pub(super) fn op_ss(&mut self, _instr: &'static str, host: &mut dyn Host, a: PtrReg, b: StrReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        let v = self.frame()?.regs.string(b)?.to_string();
        let addr = self.effective_address(host, a, c, AbortKind::WriteNil)?;
        host.heap_mut().write_string(addr, v)?;
        Ok(())
    }

    /// Managed pointer store. The host sees exactly one barrier per store,
    /// null included.
    pub(super) fn op_so(&mut self, _instr: &'static str, host: &mut dyn Host, a: PtrReg, b: PtrReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        let v = self.frame()?.regs.pointer(b)?;
        if !matches!(v, Pointer::Null | Pointer::Object(_)) {
            return Err(VMError::NotAnObject {
                pointer: v.to_string(),
            }
            .into());
        }
        let addr = self.effective_address(host, a, c, AbortKind::WriteNil)?;
        host.heap_mut().write_pointer(addr, v)?;
        host.write_barrier(v.as_object());
        Ok(())
    }

    pub(super) fn op_sp(&mut self, _instr: &'static str, host: &mut dyn Host, a: PtrReg, b: PtrReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        let v = self.frame()?.regs.pointer(b)?;
        let addr = self.effective_address(host, a, c, AbortKind::WriteNil)?;
        host.heap_mut().write_pointer(addr, v)?;
        Ok(())
    }

    pub(super) fn op_sv2(&mut self, _instr: &'static str, host: &mut dyn Host, a: PtrReg, b: FloatReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.store_vector::<2>(host, a, b, c)
    }

    pub(super) fn op_sv3(&mut self, _instr: &'static str, host: &mut dyn Host, a: PtrReg, b: FloatReg, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.store_vector::<3>(host, a, b, c)
    }

    /// Sets the mask bits of the byte at aA when dB is non-zero, clears them
    /// otherwise.
    pub(super) fn op_sbit(&mut self, _instr: &'static str, host: &mut dyn Host, a: PtrReg, b: IntReg, mask: u8) -> Result<(), ScriptAbort> {
        let set = self.frame()?.regs.int(b)? != 0;
        let addr = self.effective_address(host, a, 0u8, AbortKind::WriteNil)?;
        let [byte] = host.heap().read_bytes::<1>(addr)?;
        let byte = if set { byte | mask } else { byte & !mask };
        host.heap_mut().write_bytes(addr, &[byte])?;
        Ok(())
    }
}
