//! Operand selectors decoded from instruction fields.
//!
//! Besides register and constant indices, several instructions carry a small
//! selector in one of their fields: a register type tag for parameters and
//! returns, a cast kind, a float function, or comparison flags. Unknown
//! selector values are contract violations, never silently ignored.

use crate::virtual_machine::errors::VMError;
use std::fmt;

/// One of the four register banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegBank {
    Int,
    Float,
    String,
    Pointer,
}

impl RegBank {
    /// Bank name used in diagnostics.
    pub const fn as_str(self) -> &'static str {
        match self {
            RegBank::Int => "int",
            RegBank::Float => "float",
            RegBank::String => "string",
            RegBank::Pointer => "pointer",
        }
    }

    /// Register prefix used by the assembler.
    pub const fn prefix(self) -> char {
        match self {
            RegBank::Int => 'd',
            RegBank::Float => 'f',
            RegBank::String => 's',
            RegBank::Pointer => 'a',
        }
    }

    /// Maps a register prefix back to its bank.
    pub fn from_prefix(prefix: char) -> Option<RegBank> {
        match prefix {
            'd' => Some(RegBank::Int),
            'f' => Some(RegBank::Float),
            's' => Some(RegBank::String),
            'a' => Some(RegBank::Pointer),
            _ => None,
        }
    }
}

/// Register type tag: a bank in the low two bits plus modifier flags.
///
/// Used by `PARAM`, `RESULT` and `RET` to say where a value lives, and by
/// native return slots to say what the caller expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegType(pub u8);

impl RegType {
    pub const INT: RegType = RegType(0);
    pub const FLOAT: RegType = RegType(1);
    pub const STRING: RegType = RegType(2);
    pub const POINTER: RegType = RegType(3);
    /// No value; used by returns that only end the frame.
    pub const NIL: RegType = RegType(255);

    const BANK_MASK: u8 = 3;
    /// Operand indexes the constant pool instead of a register.
    pub const KONST: u8 = 4;
    /// Operand spans two consecutive float registers.
    pub const MULTIREG2: u8 = 8;
    /// Operand spans three consecutive float registers.
    pub const MULTIREG3: u8 = 16;
    /// Operand is passed by reference.
    pub const ADDROF: u8 = 32;

    const KNOWN_FLAGS: u8 = Self::KONST | Self::MULTIREG2 | Self::MULTIREG3 | Self::ADDROF;

    /// Builds a tag for a bank with extra flags.
    pub const fn new(bank: RegBank, flags: u8) -> Self {
        let base = match bank {
            RegBank::Int => 0,
            RegBank::Float => 1,
            RegBank::String => 2,
            RegBank::Pointer => 3,
        };
        RegType(base | flags)
    }

    /// The bank selected by the low bits.
    pub const fn bank(self) -> RegBank {
        match self.0 & Self::BANK_MASK {
            0 => RegBank::Int,
            1 => RegBank::Float,
            2 => RegBank::String,
            _ => RegBank::Pointer,
        }
    }

    pub const fn is_nil(self) -> bool {
        self.0 == Self::NIL.0
    }

    pub const fn is_konst(self) -> bool {
        self.0 & Self::KONST != 0
    }

    pub const fn is_addrof(self) -> bool {
        self.0 & Self::ADDROF != 0
    }

    /// Number of registers covered: 1, or 2/3 for vector operands.
    pub const fn width(self) -> usize {
        if self.0 & Self::MULTIREG3 != 0 {
            3
        } else if self.0 & Self::MULTIREG2 != 0 {
            2
        } else {
            1
        }
    }

    /// The tag with only its bank bits.
    pub const fn plain(self) -> RegType {
        RegType(self.0 & Self::BANK_MASK)
    }

    /// Rejects tags with unknown flag bits, flags that contradict each other,
    /// or vector flags on a non-float bank.
    pub fn validate(self) -> Result<RegType, VMError> {
        if self.is_nil() {
            return Ok(self);
        }
        let flags = self.0 & !Self::BANK_MASK;
        let vector = self.width() > 1;
        let bad = flags & !Self::KNOWN_FLAGS != 0
            || (self.0 & Self::MULTIREG2 != 0 && self.0 & Self::MULTIREG3 != 0)
            || (vector && self.bank() != RegBank::Float)
            || (self.is_konst() && (vector || self.is_addrof()));
        if bad {
            return Err(VMError::UnknownSelector {
                what: "register type",
                value: self.0,
            });
        }
        Ok(self)
    }
}

impl fmt::Display for RegType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            return write!(f, "nil");
        }
        if self.is_addrof() {
            write!(f, "&")?;
        }
        if self.is_konst() {
            write!(f, "#")?;
        }
        if self.width() > 1 {
            write!(f, "v{}:", self.width())?;
        }
        write!(f, "{}", self.bank().as_str())
    }
}

/// A register type paired with the register or constant index it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedOperand {
    pub ty: RegType,
    pub index: u16,
}

/// Return slot field of `RET`/`RETI`: slot index plus the final-return bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetSlot(pub u8);

impl RetSlot {
    pub const FINAL: u8 = 0x80;

    pub const fn new(slot: u8, is_final: bool) -> Self {
        let flag = if is_final { Self::FINAL } else { 0 };
        RetSlot((slot & !Self::FINAL) | flag)
    }

    pub const fn slot(self) -> usize {
        (self.0 & !Self::FINAL) as usize
    }

    pub const fn is_final(self) -> bool {
        self.0 & Self::FINAL != 0
    }
}

/// Comparison field: expected outcome, approximate mode and (for strings)
/// the relation to test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmpFlags(pub u8);

/// Relation tested by `CMPS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpMode {
    Eq,
    Lt,
    Le,
}

impl CmpFlags {
    pub const CHECK: u8 = 1;
    pub const APPROX: u8 = 2;
    const MODE_SHIFT: u8 = 2;

    pub const fn new(check: bool, approx: bool, mode: CmpMode) -> Self {
        let mode = match mode {
            CmpMode::Eq => 0,
            CmpMode::Lt => 1,
            CmpMode::Le => 2,
        };
        let approx = if approx { Self::APPROX } else { 0 };
        CmpFlags((check as u8) | approx | (mode << Self::MODE_SHIFT))
    }

    /// Comparison result for which the following jump is taken.
    pub const fn check(self) -> bool {
        self.0 & Self::CHECK != 0
    }

    pub const fn approx(self) -> bool {
        self.0 & Self::APPROX != 0
    }

    pub fn mode(self) -> Result<CmpMode, VMError> {
        match (self.0 >> Self::MODE_SHIFT) & 3 {
            0 => Ok(CmpMode::Eq),
            1 => Ok(CmpMode::Lt),
            2 => Ok(CmpMode::Le),
            _ => Err(VMError::UnknownSelector {
                what: "compare mode",
                value: self.0,
            }),
        }
    }
}

/// Declares a selector enum with its assembly names and `TryFrom<u8>`.
macro_rules! selector {
    (
        $(#[$meta:meta])*
        $name:ident, $what:literal {
            $( $(#[$vdoc:meta])* $variant:ident = $value:literal, $text:literal ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $( $(#[$vdoc])* $variant = $value, )*
        }

        impl $name {
            /// All selectors in numeric order.
            pub const ALL: &'static [$name] = &[ $( $name::$variant, )* ];

            /// Assembly name of this selector.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $text, )*
                }
            }

            /// Looks up a selector by assembly name, case-insensitively.
            pub fn from_name(name: &str) -> Option<$name> {
                Self::ALL.iter().copied().find(|s| s.as_str().eq_ignore_ascii_case(name))
            }
        }

        impl TryFrom<u8> for $name {
            type Error = VMError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $value => Ok($name::$variant), )*
                    _ => Err(VMError::UnknownSelector { what: $what, value }),
                }
            }
        }
    };
}

selector! {
    /// Conversion performed by `CAST`.
    CastKind, "cast" {
        /// int -> float
        I2F = 0, "I2F",
        /// unsigned int -> float
        U2F = 1, "U2F",
        /// float -> int, truncating toward zero
        F2I = 2, "F2I",
        /// float -> unsigned int, truncating toward zero
        F2U = 3, "F2U",
        /// int -> decimal string
        I2S = 4, "I2S",
        /// unsigned int -> decimal string
        U2S = 5, "U2S",
        /// float -> fixed 5-decimal string
        F2S = 6, "F2S",
        /// 2-vector -> "(x, y)"
        V22S = 7, "V22S",
        /// 3-vector -> "(x, y, z)"
        V32S = 8, "V32S",
        /// pointer -> hexadecimal address or "null"
        P2S = 9, "P2S",
        /// string -> int, parsing leading digits
        S2I = 10, "S2I",
        /// string -> float, parsing a leading number
        S2F = 11, "S2F",
        /// string -> interned name index
        S2N = 12, "S2N",
        /// name index -> string
        N2S = 13, "N2S",
    }
}

selector! {
    /// Conversion to a 0/1 integer performed by `CASTB`.
    CastbKind, "bool cast" {
        I2B = 0, "I2B",
        F2B = 1, "F2B",
        A2B = 2, "A2B",
        S2B = 3, "S2B",
    }
}

selector! {
    /// Unary float function applied by `FLOP`.
    FlopKind, "float function" {
        Abs = 0, "abs",
        Neg = 1, "neg",
        Exp = 2, "exp",
        Log = 3, "log",
        Log10 = 4, "log10",
        Sqrt = 5, "sqrt",
        Ceil = 6, "ceil",
        Floor = 7, "floor",
        Acos = 8, "acos",
        Asin = 9, "asin",
        Atan = 10, "atan",
        Cos = 11, "cos",
        Sin = 12, "sin",
        Tan = 13, "tan",
        /// Result in degrees.
        AcosDeg = 14, "acos_deg",
        /// Result in degrees.
        AsinDeg = 15, "asin_deg",
        /// Result in degrees.
        AtanDeg = 16, "atan_deg",
        /// Argument in degrees.
        CosDeg = 17, "cos_deg",
        /// Argument in degrees.
        SinDeg = 18, "sin_deg",
        /// Argument in degrees.
        TanDeg = 19, "tan_deg",
        Cosh = 20, "cosh",
        Sinh = 21, "sinh",
        Tanh = 22, "tanh",
        Round = 23, "round",
    }
}

impl FlopKind {
    /// Applies the function.
    pub fn apply(self, x: f64) -> f64 {
        match self {
            FlopKind::Abs => x.abs(),
            FlopKind::Neg => -x,
            FlopKind::Exp => x.exp(),
            FlopKind::Log => x.ln(),
            FlopKind::Log10 => x.log10(),
            FlopKind::Sqrt => x.sqrt(),
            FlopKind::Ceil => x.ceil(),
            FlopKind::Floor => x.floor(),
            FlopKind::Acos => x.acos(),
            FlopKind::Asin => x.asin(),
            FlopKind::Atan => x.atan(),
            FlopKind::Cos => x.cos(),
            FlopKind::Sin => x.sin(),
            FlopKind::Tan => x.tan(),
            FlopKind::AcosDeg => x.acos().to_degrees(),
            FlopKind::AsinDeg => x.asin().to_degrees(),
            FlopKind::AtanDeg => x.atan().to_degrees(),
            FlopKind::CosDeg => x.to_radians().cos(),
            FlopKind::SinDeg => x.to_radians().sin(),
            FlopKind::TanDeg => x.to_radians().tan(),
            FlopKind::Cosh => x.cosh(),
            FlopKind::Sinh => x.sinh(),
            FlopKind::Tanh => x.tanh(),
            FlopKind::Round => x.round(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_type_flags() {
        let ty = RegType::new(RegBank::Float, RegType::MULTIREG3);
        assert_eq!(ty.bank(), RegBank::Float);
        assert_eq!(ty.width(), 3);
        assert!(!ty.is_konst());
        assert_eq!(ty.plain(), RegType::FLOAT);

        let ty = RegType::new(RegBank::Int, RegType::ADDROF);
        assert!(ty.is_addrof());
        assert_eq!(ty.to_string(), "&int");
        assert_eq!(RegType::NIL.to_string(), "nil");
    }

    #[test]
    fn reg_type_validate_rejects_contradictions() {
        assert!(RegType::new(RegBank::Float, RegType::MULTIREG2).validate().is_ok());
        assert!(RegType::new(RegBank::Int, RegType::MULTIREG2).validate().is_err());
        assert!(RegType(1 | RegType::MULTIREG2 | RegType::MULTIREG3).validate().is_err());
        assert!(RegType(0x40).validate().is_err());
        assert!(RegType::new(RegBank::Int, RegType::KONST | RegType::ADDROF).validate().is_err());
        assert!(RegType::NIL.validate().is_ok());
    }

    #[test]
    fn ret_slot_final_bit() {
        let slot = RetSlot::new(3, true);
        assert_eq!(slot.slot(), 3);
        assert!(slot.is_final());
        assert!(!RetSlot::new(0, false).is_final());
    }

    #[test]
    fn cmp_flags_round_trip() {
        let flags = CmpFlags::new(true, true, CmpMode::Le);
        assert!(flags.check());
        assert!(flags.approx());
        assert_eq!(flags.mode().unwrap(), CmpMode::Le);
        assert!(CmpFlags(0b1100).mode().is_err());
    }

    #[test]
    fn selectors_reject_unknown_values() {
        assert_eq!(CastKind::try_from(10).unwrap(), CastKind::S2I);
        assert!(matches!(
            CastKind::try_from(200),
            Err(VMError::UnknownSelector { what: "cast", value: 200 })
        ));
        assert!(FlopKind::try_from(24).is_err());
        assert!(CastbKind::try_from(4).is_err());
    }

    #[test]
    fn selectors_by_name() {
        assert_eq!(CastKind::from_name("v22s"), Some(CastKind::V22S));
        assert_eq!(FlopKind::from_name("SQRT"), Some(FlopKind::Sqrt));
        assert_eq!(FlopKind::from_name("cbrt"), None);
        for kind in FlopKind::ALL {
            assert_eq!(FlopKind::try_from(*kind as u8).unwrap(), *kind);
        }
    }

    #[test]
    fn flop_degree_forms() {
        assert!((FlopKind::AcosDeg.apply(0.0) - 90.0).abs() < 1e-9);
        assert!((FlopKind::SinDeg.apply(90.0) - 1.0).abs() < 1e-12);
        assert_eq!(FlopKind::Round.apply(2.5), 3.0);
        assert_eq!(FlopKind::Neg.apply(1.5), -1.5);
    }
}
