//! Register values and the conversions between them.
//!
//! The interpreter keeps four typed register banks; [`Value`] is the tagged
//! form used where values cross the call boundary (staged parameters, native
//! arguments, return slots). Pointers are tagged too: a raw address into a
//! heap block, a managed object, a class descriptor or a function.

use crate::virtual_machine::operand::RegBank;
use std::collections::HashMap;
use std::fmt;

/// Generational index into one of the heap arenas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    pub index: u32,
    pub generation: u32,
}

/// A block of VM-visible memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockId(pub(crate) Handle);

/// A reference to a garbage-collected object.
///
/// Only the heap hands these out, so the write-barrier store and the
/// dynamic-cast instructions always deal with a real managed object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef(pub(crate) Handle);

/// Index of a class descriptor in the class registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

/// Index of an entry in the function table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

/// Byte position inside a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    pub block: BlockId,
    pub offset: u32,
}

/// Contents of a pointer register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Pointer {
    #[default]
    Null,
    Addr(Address),
    Object(ObjectRef),
    Class(ClassId),
    Function(FunctionId),
}

impl Pointer {
    pub const fn is_null(&self) -> bool {
        matches!(self, Pointer::Null)
    }

    /// The object this pointer references, if it is a managed reference.
    pub const fn as_object(&self) -> Option<ObjectRef> {
        match self {
            Pointer::Object(obj) => Some(*obj),
            _ => None,
        }
    }

    /// A stable integer standing in for the pointer's address.
    ///
    /// Each pointer kind lives in its own range so that formatted pointers
    /// never collide.
    pub fn synthetic_address(&self) -> u64 {
        match self {
            Pointer::Null => 0,
            Pointer::Addr(addr) => ((addr.block.0.index as u64 + 1) << 32) | addr.offset as u64,
            Pointer::Object(obj) => (1 << 60) | ((obj.0.index as u64 + 1) << 16),
            Pointer::Class(class) => (2 << 60) | class.0 as u64,
            Pointer::Function(func) => (3 << 60) | func.0 as u64,
        }
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pointer::Null => write!(f, "null"),
            other => write!(f, "{:#x}", other.synthetic_address()),
        }
    }
}

/// A tagged register value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f64),
    String(String),
    Pointer(Pointer),
}

impl Value {
    /// The register bank this value belongs to.
    pub const fn bank(&self) -> RegBank {
        match self {
            Value::Int(_) => RegBank::Int,
            Value::Float(_) => RegBank::Float,
            Value::String(_) => RegBank::String,
            Value::Pointer(_) => RegBank::Pointer,
        }
    }

    /// Returns the type name for error messages.
    pub const fn type_name(&self) -> &'static str {
        self.bank().as_str()
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<Pointer> {
        match self {
            Value::Pointer(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Pointer> for Value {
    fn from(v: Pointer) -> Self {
        Value::Pointer(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{}", format_float(*v)),
            Value::String(v) => write!(f, "{v}"),
            Value::Pointer(v) => write!(f, "{v}"),
        }
    }
}

/// Fixed five-decimal float format.
pub fn format_float(v: f64) -> String {
    format!("{v:.5}")
}

/// `(x, y)` / `(x, y, z)` vector format.
pub fn format_vector(components: &[f64]) -> String {
    let parts: Vec<String> = components.iter().map(|c| format_float(*c)).collect();
    format!("({})", parts.join(", "))
}

/// Parses leading decimal digits after optional whitespace and sign.
///
/// Returns 0 if no digits are present. Values beyond `i64` saturate before
/// being truncated to 32 bits.
pub fn parse_leading_int(s: &str) -> i32 {
    let t = s.trim_start();
    let (negative, digits) = match t.as_bytes().first() {
        Some(b'-') => (true, &t[1..]),
        Some(b'+') => (false, &t[1..]),
        _ => (false, t),
    };

    let mut acc: i64 = 0;
    for b in digits.bytes().take_while(u8::is_ascii_digit) {
        acc = acc.saturating_mul(10).saturating_add((b - b'0') as i64);
    }
    let value = if negative { acc.saturating_neg() } else { acc };
    value as i32
}

/// Parses the longest leading decimal number (with optional fraction and
/// exponent). Returns 0.0 if none is present.
pub fn parse_leading_float(s: &str) -> f64 {
    let t = s.trim_start();
    let bytes = t.as_bytes();
    let is_digit = |i: usize| bytes.get(i).is_some_and(u8::is_ascii_digit);

    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }
    let mut digits = 0;
    while is_digit(end) {
        end += 1;
        digits += 1;
    }
    if bytes.get(end) == Some(&b'.') {
        end += 1;
        while is_digit(end) {
            end += 1;
            digits += 1;
        }
    }
    if digits == 0 {
        return 0.0;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let start = exp;
        while is_digit(exp) {
            exp += 1;
        }
        if exp > start {
            end = exp;
        }
    }
    t[..end].parse().unwrap_or(0.0)
}

/// Interned names. Index 0 is always `None`; lookups ignore ASCII case.
#[derive(Debug, Clone)]
pub struct NameTable {
    names: Vec<String>,
    index: HashMap<String, i32>,
}

impl NameTable {
    pub fn new() -> Self {
        let mut index = HashMap::new();
        index.insert("none".to_string(), 0);
        Self {
            names: vec!["None".to_string()],
            index,
        }
    }

    /// Returns the index of `name`, adding it if needed. The empty string is `None`.
    pub fn intern(&mut self, name: &str) -> i32 {
        if name.is_empty() {
            return 0;
        }
        let key = name.to_ascii_lowercase();
        if let Some(id) = self.index.get(&key) {
            return *id;
        }
        let id = self.names.len() as i32;
        self.names.push(name.to_string());
        self.index.insert(key, id);
        id
    }

    /// Looks up a name without interning it.
    pub fn find(&self, name: &str) -> Option<i32> {
        self.index.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn get(&self, index: i32) -> Option<&str> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.names.get(i))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for NameTable {
    fn default() -> Self {
        Self::new()
    }
}
