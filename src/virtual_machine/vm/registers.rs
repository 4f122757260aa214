use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::operand::RegBank;
use crate::virtual_machine::program::FrameLayout;
use crate::virtual_machine::value::{Pointer, Value};

/// Index of an int register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntReg(pub u16);

/// Index of a float register (or the first of a 2/3-register vector).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FloatReg(pub u16);

/// Index of a string register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StrReg(pub u16);

/// Index of a pointer register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PtrReg(pub u16);

/// Index into the int constant pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntConst(pub u16);

/// Index into the float constant pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FloatConst(pub u16);

/// Index into the string constant pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StrConst(pub u16);

/// Index into the pointer constant pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PtrConst(pub u16);

fn out_of_range(bank: RegBank, index: usize, available: usize) -> VMError {
    VMError::RegisterOutOfRange {
        bank: bank.as_str(),
        index,
        available,
    }
}

/// The four register banks of one frame.
///
/// Banks are sized from the function's [`FrameLayout`] and every access is
/// bounds-checked.
#[derive(Debug, Default)]
pub(crate) struct Registers {
    ints: Vec<i32>,
    floats: Vec<f64>,
    strings: Vec<String>,
    pointers: Vec<Pointer>,
}

impl Registers {
    pub(crate) fn new(layout: &FrameLayout) -> Self {
        Self {
            ints: vec![0; layout.num_int as usize],
            floats: vec![0.0; layout.num_float as usize],
            strings: vec![String::new(); layout.num_string as usize],
            pointers: vec![Pointer::Null; layout.num_pointer as usize],
        }
    }

    pub(crate) fn int(&self, r: IntReg) -> Result<i32, VMError> {
        self.ints
            .get(r.0 as usize)
            .copied()
            .ok_or(out_of_range(RegBank::Int, r.0 as usize, self.ints.len()))
    }

    pub(crate) fn set_int(&mut self, r: IntReg, v: i32) -> Result<(), VMError> {
        let available = self.ints.len();
        let slot = self
            .ints
            .get_mut(r.0 as usize)
            .ok_or(out_of_range(RegBank::Int, r.0 as usize, available))?;
        *slot = v;
        Ok(())
    }

    pub(crate) fn float(&self, r: FloatReg) -> Result<f64, VMError> {
        self.floats
            .get(r.0 as usize)
            .copied()
            .ok_or(out_of_range(RegBank::Float, r.0 as usize, self.floats.len()))
    }

    pub(crate) fn set_float(&mut self, r: FloatReg, v: f64) -> Result<(), VMError> {
        let available = self.floats.len();
        let slot = self
            .floats
            .get_mut(r.0 as usize)
            .ok_or(out_of_range(RegBank::Float, r.0 as usize, available))?;
        *slot = v;
        Ok(())
    }

    /// Reads `N` consecutive float registers starting at `r`.
    pub(crate) fn vector<const N: usize>(&self, r: FloatReg) -> Result<[f64; N], VMError> {
        let start = r.0 as usize;
        let slice = self
            .floats
            .get(start..start + N)
            .ok_or(out_of_range(RegBank::Float, start + N - 1, self.floats.len()))?;
        let mut out = [0.0; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub(crate) fn set_vector<const N: usize>(
        &mut self,
        r: FloatReg,
        v: [f64; N],
    ) -> Result<(), VMError> {
        let start = r.0 as usize;
        let available = self.floats.len();
        let slice = self
            .floats
            .get_mut(start..start + N)
            .ok_or(out_of_range(RegBank::Float, start + N - 1, available))?;
        slice.copy_from_slice(&v);
        Ok(())
    }

    pub(crate) fn string(&self, r: StrReg) -> Result<&str, VMError> {
        self.strings
            .get(r.0 as usize)
            .map(String::as_str)
            .ok_or(out_of_range(RegBank::String, r.0 as usize, self.strings.len()))
    }

    pub(crate) fn set_string(&mut self, r: StrReg, v: String) -> Result<(), VMError> {
        let available = self.strings.len();
        let slot = self
            .strings
            .get_mut(r.0 as usize)
            .ok_or(out_of_range(RegBank::String, r.0 as usize, available))?;
        *slot = v;
        Ok(())
    }

    pub(crate) fn pointer(&self, r: PtrReg) -> Result<Pointer, VMError> {
        self.pointers
            .get(r.0 as usize)
            .copied()
            .ok_or(out_of_range(RegBank::Pointer, r.0 as usize, self.pointers.len()))
    }

    pub(crate) fn set_pointer(&mut self, r: PtrReg, v: Pointer) -> Result<(), VMError> {
        let available = self.pointers.len();
        let slot = self
            .pointers
            .get_mut(r.0 as usize)
            .ok_or(out_of_range(RegBank::Pointer, r.0 as usize, available))?;
        *slot = v;
        Ok(())
    }

    /// Reads register `index` of `bank` as a tagged value.
    pub(crate) fn get(&self, bank: RegBank, index: u16) -> Result<Value, VMError> {
        Ok(match bank {
            RegBank::Int => Value::Int(self.int(IntReg(index))?),
            RegBank::Float => Value::Float(self.float(FloatReg(index))?),
            RegBank::String => Value::String(self.string(StrReg(index))?.to_string()),
            RegBank::Pointer => Value::Pointer(self.pointer(PtrReg(index))?),
        })
    }

    /// Stores a tagged value into register `index` of the value's own bank.
    pub(crate) fn set(&mut self, index: u16, value: Value) -> Result<(), VMError> {
        match value {
            Value::Int(v) => self.set_int(IntReg(index), v),
            Value::Float(v) => self.set_float(FloatReg(index), v),
            Value::String(v) => self.set_string(StrReg(index), v),
            Value::Pointer(v) => self.set_pointer(PtrReg(index), v),
        }
    }

    /// Number of registers in `bank`.
    pub(crate) fn len(&self, bank: RegBank) -> usize {
        match bank {
            RegBank::Int => self.ints.len(),
            RegBank::Float => self.floats.len(),
            RegBank::String => self.strings.len(),
            RegBank::Pointer => self.pointers.len(),
        }
    }

    /// Live pointers, for garbage-collection roots.
    pub(crate) fn pointers(&self) -> impl Iterator<Item = Pointer> + '_ {
        self.pointers.iter().copied().filter(|p| !p.is_null())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> FrameLayout {
        FrameLayout {
            num_int: 2,
            num_float: 3,
            num_string: 1,
            num_pointer: 1,
            ..FrameLayout::default()
        }
    }

    #[test]
    fn banks_are_sized_from_layout() {
        let regs = Registers::new(&layout());
        assert_eq!(regs.len(RegBank::Int), 2);
        assert_eq!(regs.len(RegBank::Float), 3);
        assert_eq!(regs.len(RegBank::String), 1);
        assert_eq!(regs.len(RegBank::Pointer), 1);
        assert_eq!(regs.int(IntReg(1)).unwrap(), 0);
        assert_eq!(regs.pointer(PtrReg(0)).unwrap(), Pointer::Null);
    }

    #[test]
    fn out_of_range_access_is_an_error() {
        let mut regs = Registers::new(&layout());
        assert_eq!(
            regs.set_int(IntReg(2), 1),
            Err(VMError::RegisterOutOfRange {
                bank: "int",
                index: 2,
                available: 2
            })
        );
        assert!(regs.string(StrReg(1)).is_err());
        assert!(regs.vector::<2>(FloatReg(2)).is_err());
        assert!(regs.set_vector(FloatReg(1), [1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn vectors_span_consecutive_registers() {
        let mut regs = Registers::new(&layout());
        regs.set_vector(FloatReg(1), [1.5, -2.0]).unwrap();
        assert_eq!(regs.float(FloatReg(2)).unwrap(), -2.0);
        assert_eq!(regs.vector::<3>(FloatReg(0)).unwrap(), [0.0, 1.5, -2.0]);
    }

    #[test]
    fn tagged_access() {
        let mut regs = Registers::new(&layout());
        regs.set(0, Value::from("hey")).unwrap();
        regs.set(1, Value::Int(9)).unwrap();
        assert_eq!(regs.get(RegBank::String, 0).unwrap(), Value::from("hey"));
        assert_eq!(regs.get(RegBank::Int, 1).unwrap(), Value::Int(9));
        assert!(regs.set(1, Value::Pointer(Pointer::Null)).is_err());
    }
}
