use super::frame::Fetch;
use super::{FloatReg, IntReg, PtrReg, Vm};
use crate::virtual_machine::errors::{AbortKind, ScriptAbort, VMError};
use crate::virtual_machine::host::Host;
use crate::virtual_machine::operand::{CmpFlags, FlopKind};
use crate::virtual_machine::value::Pointer;

fn division_by_zero() -> ScriptAbort {
    ScriptAbort::new(AbortKind::DivisionByZero)
}

fn checked_divisor(c: i32) -> Result<i32, ScriptAbort> {
    if c == 0 { Err(division_by_zero()) } else { Ok(c) }
}

fn checked_divisor_f(c: f64) -> Result<f64, ScriptAbort> {
    if c == 0.0 { Err(division_by_zero()) } else { Ok(c) }
}

fn unsigned(v: i32) -> u32 {
    v as u32
}

impl Vm {
    // =========================
    // Integer arithmetic
    // =========================

    fn int_binop<B, C>(
        &mut self,
        a: IntReg,
        b: B,
        c: C,
        f: impl FnOnce(i32, i32) -> Result<i32, ScriptAbort>,
    ) -> Result<(), ScriptAbort>
    where
        B: Fetch<i32>,
        C: Fetch<i32>,
    {
        let frame = self.frame_mut()?;
        let (lhs, rhs) = (b.fetch(frame)?, c.fetch(frame)?);
        let v = f(lhs, rhs)?;
        frame.regs.set_int(a, v)?;
        Ok(())
    }

    fn int_unop(&mut self, a: IntReg, b: IntReg, f: impl FnOnce(i32) -> i32) -> Result<(), ScriptAbort> {
        let regs = &mut self.frame_mut()?.regs;
        let v = f(regs.int(b)?);
        regs.set_int(a, v)?;
        Ok(())
    }

    pub(super) fn op_sll(&mut self, _instr: &'static str, a: IntReg, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_binop(a, b, c, |x, s| Ok(x.wrapping_shl(s as u32 & 31)))
    }

    pub(super) fn op_srl(&mut self, _instr: &'static str, a: IntReg, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_binop(a, b, c, |x, s| Ok((unsigned(x) >> (s as u32 & 31)) as i32))
    }

    pub(super) fn op_sra(&mut self, _instr: &'static str, a: IntReg, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_binop(a, b, c, |x, s| Ok(x >> (s as u32 & 31)))
    }

    pub(super) fn op_add(&mut self, _instr: &'static str, a: IntReg, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_binop(a, b, c, |x, y| Ok(x.wrapping_add(y)))
    }

    pub(super) fn op_sub(&mut self, _instr: &'static str, a: IntReg, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_binop(a, b, c, |x, y| Ok(x.wrapping_sub(y)))
    }

    pub(super) fn op_mul(&mut self, _instr: &'static str, a: IntReg, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_binop(a, b, c, |x, y| Ok(x.wrapping_mul(y)))
    }

    pub(super) fn op_div(&mut self, _instr: &'static str, a: IntReg, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_binop(a, b, c, |x, y| Ok(x.wrapping_div(checked_divisor(y)?)))
    }

    pub(super) fn op_divu(&mut self, _instr: &'static str, a: IntReg, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_binop(a, b, c, |x, y| {
            Ok((unsigned(x) / unsigned(checked_divisor(y)?)) as i32)
        })
    }

    pub(super) fn op_mod(&mut self, _instr: &'static str, a: IntReg, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_binop(a, b, c, |x, y| Ok(x.wrapping_rem(checked_divisor(y)?)))
    }

    pub(super) fn op_modu(&mut self, _instr: &'static str, a: IntReg, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_binop(a, b, c, |x, y| {
            Ok((unsigned(x) % unsigned(checked_divisor(y)?)) as i32)
        })
    }

    pub(super) fn op_and(&mut self, _instr: &'static str, a: IntReg, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_binop(a, b, c, |x, y| Ok(x & y))
    }

    pub(super) fn op_or(&mut self, _instr: &'static str, a: IntReg, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_binop(a, b, c, |x, y| Ok(x | y))
    }

    pub(super) fn op_xor(&mut self, _instr: &'static str, a: IntReg, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_binop(a, b, c, |x, y| Ok(x ^ y))
    }

    pub(super) fn op_min(&mut self, _instr: &'static str, a: IntReg, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_binop(a, b, c, |x, y| Ok(x.min(y)))
    }

    pub(super) fn op_max(&mut self, _instr: &'static str, a: IntReg, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_binop(a, b, c, |x, y| Ok(x.max(y)))
    }

    pub(super) fn op_minu(&mut self, _instr: &'static str, a: IntReg, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_binop(a, b, c, |x, y| Ok(unsigned(x).min(unsigned(y)) as i32))
    }

    pub(super) fn op_maxu(&mut self, _instr: &'static str, a: IntReg, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_binop(a, b, c, |x, y| Ok(unsigned(x).max(unsigned(y)) as i32))
    }

    pub(super) fn op_abs(&mut self, _instr: &'static str, a: IntReg, b: IntReg) -> Result<(), ScriptAbort> {
        self.int_unop(a, b, i32::wrapping_abs)
    }

    pub(super) fn op_neg(&mut self, _instr: &'static str, a: IntReg, b: IntReg) -> Result<(), ScriptAbort> {
        self.int_unop(a, b, i32::wrapping_neg)
    }

    pub(super) fn op_not(&mut self, _instr: &'static str, a: IntReg, b: IntReg) -> Result<(), ScriptAbort> {
        self.int_unop(a, b, |x| !x)
    }

    /// Sign-extends the low `bits` bits (1 to 32) of dB.
    pub(super) fn op_sext(&mut self, _instr: &'static str, a: IntReg, b: IntReg, bits: u8) -> Result<(), ScriptAbort> {
        if bits == 0 || bits > 32 {
            return Err(VMError::UnknownSelector {
                what: "sign-extension width",
                value: bits,
            }
            .into());
        }
        let shift = 32 - bits as u32;
        self.int_unop(a, b, |x| x.wrapping_shl(shift).wrapping_shr(shift))
    }

    fn int_compare<B, C>(
        &mut self,
        instr: &'static str,
        flags: CmpFlags,
        b: B,
        c: C,
        test: impl FnOnce(i32, i32) -> bool,
    ) -> Result<(), ScriptAbort>
    where
        B: Fetch<i32>,
        C: Fetch<i32>,
    {
        let frame = self.frame()?;
        let outcome = test(b.fetch(frame)?, c.fetch(frame)?);
        self.branch(instr, outcome, flags.check())
    }

    pub(super) fn op_eq(&mut self, instr: &'static str, flags: CmpFlags, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_compare(instr, flags, b, c, |x, y| x == y)
    }

    pub(super) fn op_lt(&mut self, instr: &'static str, flags: CmpFlags, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_compare(instr, flags, b, c, |x, y| x < y)
    }

    pub(super) fn op_le(&mut self, instr: &'static str, flags: CmpFlags, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_compare(instr, flags, b, c, |x, y| x <= y)
    }

    pub(super) fn op_ltu(&mut self, instr: &'static str, flags: CmpFlags, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_compare(instr, flags, b, c, |x, y| unsigned(x) < unsigned(y))
    }

    pub(super) fn op_leu(&mut self, instr: &'static str, flags: CmpFlags, b: impl Fetch<i32>, c: impl Fetch<i32>) -> Result<(), ScriptAbort> {
        self.int_compare(instr, flags, b, c, |x, y| unsigned(x) <= unsigned(y))
    }

    // =========================
    // Float arithmetic
    // =========================

    fn float_binop<B, C>(
        &mut self,
        a: FloatReg,
        b: B,
        c: C,
        f: impl FnOnce(f64, f64) -> Result<f64, ScriptAbort>,
    ) -> Result<(), ScriptAbort>
    where
        B: Fetch<f64>,
        C: Fetch<f64>,
    {
        let frame = self.frame_mut()?;
        let (lhs, rhs) = (b.fetch(frame)?, c.fetch(frame)?);
        let v = f(lhs, rhs)?;
        frame.regs.set_float(a, v)?;
        Ok(())
    }

    pub(super) fn op_addf(&mut self, _instr: &'static str, a: FloatReg, b: impl Fetch<f64>, c: impl Fetch<f64>) -> Result<(), ScriptAbort> {
        self.float_binop(a, b, c, |x, y| Ok(x + y))
    }

    pub(super) fn op_subf(&mut self, _instr: &'static str, a: FloatReg, b: impl Fetch<f64>, c: impl Fetch<f64>) -> Result<(), ScriptAbort> {
        self.float_binop(a, b, c, |x, y| Ok(x - y))
    }

    pub(super) fn op_mulf(&mut self, _instr: &'static str, a: FloatReg, b: impl Fetch<f64>, c: impl Fetch<f64>) -> Result<(), ScriptAbort> {
        self.float_binop(a, b, c, |x, y| Ok(x * y))
    }

    pub(super) fn op_divf(&mut self, _instr: &'static str, a: FloatReg, b: impl Fetch<f64>, c: impl Fetch<f64>) -> Result<(), ScriptAbort> {
        self.float_binop(a, b, c, |x, y| Ok(x / checked_divisor_f(y)?))
    }

    /// Floored modulo: the result takes the sign of the divisor.
    pub(super) fn op_modf(&mut self, _instr: &'static str, a: FloatReg, b: impl Fetch<f64>, c: impl Fetch<f64>) -> Result<(), ScriptAbort> {
        self.float_binop(a, b, c, |x, y| {
            let y = checked_divisor_f(y)?;
            Ok(x - (x / y).floor() * y)
        })
    }

    pub(super) fn op_powf(&mut self, _instr: &'static str, a: FloatReg, b: impl Fetch<f64>, c: impl Fetch<f64>) -> Result<(), ScriptAbort> {
        self.float_binop(a, b, c, |x, y| Ok(x.powf(y)))
    }

    pub(super) fn op_minf(&mut self, _instr: &'static str, a: FloatReg, b: impl Fetch<f64>, c: impl Fetch<f64>) -> Result<(), ScriptAbort> {
        self.float_binop(a, b, c, |x, y| Ok(x.min(y)))
    }

    pub(super) fn op_maxf(&mut self, _instr: &'static str, a: FloatReg, b: impl Fetch<f64>, c: impl Fetch<f64>) -> Result<(), ScriptAbort> {
        self.float_binop(a, b, c, |x, y| Ok(x.max(y)))
    }

    pub(super) fn op_atan2(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg, c: FloatReg) -> Result<(), ScriptAbort> {
        self.float_binop(a, b, c, |y, x| Ok(y.atan2(x).to_degrees()))
    }

    pub(super) fn op_flop(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg, func: u8) -> Result<(), ScriptAbort> {
        let func = FlopKind::try_from(func)?;
        let regs = &mut self.frame_mut()?.regs;
        let v = func.apply(regs.float(b)?);
        regs.set_float(a, v)?;
        Ok(())
    }

    fn float_compare<B, C>(
        &mut self,
        instr: &'static str,
        flags: CmpFlags,
        b: B,
        c: C,
        exact: impl FnOnce(f64, f64) -> bool,
        approx: impl FnOnce(f64, f64) -> bool,
    ) -> Result<(), ScriptAbort>
    where
        B: Fetch<f64>,
        C: Fetch<f64>,
    {
        let frame = self.frame()?;
        let (lhs, rhs) = (b.fetch(frame)?, c.fetch(frame)?);
        let outcome = if flags.approx() {
            approx(lhs - rhs, self.config.float_epsilon)
        } else {
            exact(lhs, rhs)
        };
        self.branch(instr, outcome, flags.check())
    }

    pub(super) fn op_eqf(&mut self, instr: &'static str, flags: CmpFlags, b: impl Fetch<f64>, c: impl Fetch<f64>) -> Result<(), ScriptAbort> {
        self.float_compare(instr, flags, b, c, |x, y| x == y, |d, eps| d.abs() < eps)
    }

    pub(super) fn op_ltf(&mut self, instr: &'static str, flags: CmpFlags, b: impl Fetch<f64>, c: impl Fetch<f64>) -> Result<(), ScriptAbort> {
        self.float_compare(instr, flags, b, c, |x, y| x < y, |d, eps| d < -eps)
    }

    pub(super) fn op_lef(&mut self, instr: &'static str, flags: CmpFlags, b: impl Fetch<f64>, c: impl Fetch<f64>) -> Result<(), ScriptAbort> {
        self.float_compare(instr, flags, b, c, |x, y| x <= y, |d, eps| d <= eps)
    }

    // =========================
    // Vectors
    // =========================

    fn vector_map<const N: usize>(
        &mut self,
        a: FloatReg,
        b: FloatReg,
        f: impl Fn(f64) -> f64,
    ) -> Result<(), ScriptAbort> {
        let regs = &mut self.frame_mut()?.regs;
        let v = regs.vector::<N>(b)?.map(f);
        regs.set_vector(a, v)?;
        Ok(())
    }

    fn vector_zip<const N: usize>(
        &mut self,
        a: FloatReg,
        b: FloatReg,
        c: FloatReg,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<(), ScriptAbort> {
        let regs = &mut self.frame_mut()?.regs;
        let (x, y) = (regs.vector::<N>(b)?, regs.vector::<N>(c)?);
        let v: [f64; N] = std::array::from_fn(|i| f(x[i], y[i]));
        regs.set_vector(a, v)?;
        Ok(())
    }

    fn vector_scale<const N: usize>(
        &mut self,
        a: FloatReg,
        b: FloatReg,
        c: impl Fetch<f64>,
        divide: bool,
    ) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let scalar = c.fetch(frame)?;
        let v = frame.regs.vector::<N>(b)?;
        let v = if divide {
            let scalar = checked_divisor_f(scalar)?;
            v.map(|x| x / scalar)
        } else {
            v.map(|x| x * scalar)
        };
        frame.regs.set_vector(a, v)?;
        Ok(())
    }

    fn vector_dot<const N: usize>(&mut self, a: FloatReg, b: FloatReg, c: FloatReg) -> Result<(), ScriptAbort> {
        let regs = &mut self.frame_mut()?.regs;
        let (x, y) = (regs.vector::<N>(b)?, regs.vector::<N>(c)?);
        let dot: f64 = x.iter().zip(y).map(|(p, q)| p * q).sum();
        regs.set_float(a, dot)?;
        Ok(())
    }

    fn vector_len<const N: usize>(&mut self, a: FloatReg, b: FloatReg) -> Result<(), ScriptAbort> {
        let regs = &mut self.frame_mut()?.regs;
        let len = regs.vector::<N>(b)?.iter().map(|x| x * x).sum::<f64>().sqrt();
        regs.set_float(a, len)?;
        Ok(())
    }

    fn vector_eq<const N: usize>(
        &mut self,
        instr: &'static str,
        flags: CmpFlags,
        b: FloatReg,
        c: impl Fetch<[f64; N]>,
    ) -> Result<(), ScriptAbort> {
        let frame = self.frame()?;
        let x: [f64; N] = b.fetch(frame)?;
        let y = c.fetch(frame)?;
        let eps = self.config.float_epsilon;
        let outcome = if flags.approx() {
            x.iter().zip(y).all(|(p, q)| (p - q).abs() < eps)
        } else {
            x == y
        };
        self.branch(instr, outcome, flags.check())
    }

    pub(super) fn op_negv2(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg) -> Result<(), ScriptAbort> {
        self.vector_map::<2>(a, b, |x| -x)
    }

    pub(super) fn op_negv3(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg) -> Result<(), ScriptAbort> {
        self.vector_map::<3>(a, b, |x| -x)
    }

    pub(super) fn op_addv2(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg, c: FloatReg) -> Result<(), ScriptAbort> {
        self.vector_zip::<2>(a, b, c, |x, y| x + y)
    }

    pub(super) fn op_addv3(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg, c: FloatReg) -> Result<(), ScriptAbort> {
        self.vector_zip::<3>(a, b, c, |x, y| x + y)
    }

    pub(super) fn op_subv2(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg, c: FloatReg) -> Result<(), ScriptAbort> {
        self.vector_zip::<2>(a, b, c, |x, y| x - y)
    }

    pub(super) fn op_subv3(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg, c: FloatReg) -> Result<(), ScriptAbort> {
        self.vector_zip::<3>(a, b, c, |x, y| x - y)
    }

    pub(super) fn op_dotv2(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg, c: FloatReg) -> Result<(), ScriptAbort> {
        self.vector_dot::<2>(a, b, c)
    }

    pub(super) fn op_dotv3(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg, c: FloatReg) -> Result<(), ScriptAbort> {
        self.vector_dot::<3>(a, b, c)
    }

    pub(super) fn op_crossv(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg, c: FloatReg) -> Result<(), ScriptAbort> {
        let regs = &mut self.frame_mut()?.regs;
        let (x, y) = (regs.vector::<3>(b)?, regs.vector::<3>(c)?);
        let cross = [
            x[1] * y[2] - x[2] * y[1],
            x[2] * y[0] - x[0] * y[2],
            x[0] * y[1] - x[1] * y[0],
        ];
        regs.set_vector(a, cross)?;
        Ok(())
    }

    pub(super) fn op_mulvf2(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg, c: impl Fetch<f64>) -> Result<(), ScriptAbort> {
        self.vector_scale::<2>(a, b, c, false)
    }

    pub(super) fn op_mulvf3(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg, c: impl Fetch<f64>) -> Result<(), ScriptAbort> {
        self.vector_scale::<3>(a, b, c, false)
    }

    pub(super) fn op_divvf2(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg, c: impl Fetch<f64>) -> Result<(), ScriptAbort> {
        self.vector_scale::<2>(a, b, c, true)
    }

    pub(super) fn op_divvf3(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg, c: impl Fetch<f64>) -> Result<(), ScriptAbort> {
        self.vector_scale::<3>(a, b, c, true)
    }

    pub(super) fn op_lenv2(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg) -> Result<(), ScriptAbort> {
        self.vector_len::<2>(a, b)
    }

    pub(super) fn op_lenv3(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg) -> Result<(), ScriptAbort> {
        self.vector_len::<3>(a, b)
    }

    pub(super) fn op_eqv2(&mut self, instr: &'static str, flags: CmpFlags, b: FloatReg, c: impl Fetch<[f64; 2]>) -> Result<(), ScriptAbort> {
        self.vector_eq::<2>(instr, flags, b, c)
    }

    pub(super) fn op_eqv3(&mut self, instr: &'static str, flags: CmpFlags, b: FloatReg, c: impl Fetch<[f64; 3]>) -> Result<(), ScriptAbort> {
        self.vector_eq::<3>(instr, flags, b, c)
    }

    // =========================
    // Pointers
    // =========================

    /// Byte displacement. Objects yield an address inside their storage.
    pub(super) fn op_adda(
        &mut self,
        _instr: &'static str,
        host: &mut dyn Host,
        a: PtrReg,
        b: PtrReg,
        c: impl Fetch<i32>,
    ) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let base = frame.regs.pointer(b)?;
        let delta = c.fetch(frame)?;
        let result = match host.heap().resolve(base)? {
            None => Pointer::Null,
            Some(addr) => Pointer::Addr(host.heap().displace(addr, delta as i64)?),
        };
        frame.regs.set_pointer(a, result)?;
        Ok(())
    }

    /// Byte distance between two pointers into the same block.
    pub(super) fn op_suba(
        &mut self,
        _instr: &'static str,
        host: &mut dyn Host,
        a: IntReg,
        b: PtrReg,
        c: PtrReg,
    ) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let (lhs, rhs) = (frame.regs.pointer(b)?, frame.regs.pointer(c)?);
        let heap = host.heap();
        let distance = match (heap.resolve(lhs)?, heap.resolve(rhs)?) {
            (None, None) => 0,
            (Some(x), Some(y)) if x.block == y.block => x.offset as i64 - y.offset as i64,
            _ => {
                return Err(VMError::UnrelatedPointers {
                    left: lhs.to_string(),
                    right: rhs.to_string(),
                }
                .into());
            }
        };
        frame.regs.set_int(a, distance as i32)?;
        Ok(())
    }

    pub(super) fn op_eqa(&mut self, instr: &'static str, flags: CmpFlags, b: PtrReg, c: impl Fetch<Pointer>) -> Result<(), ScriptAbort> {
        let frame = self.frame()?;
        let outcome = frame.regs.pointer(b)? == c.fetch(frame)?;
        self.branch(instr, outcome, flags.check())
    }
}
