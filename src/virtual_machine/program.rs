//! Compiled functions and module images.
//!
//! A [`CompiledFunction`] is what the compiler hands the VM: code words, four
//! constant pools, frame layout and a line table. A [`Module`] groups the
//! functions of one compilation unit and is the unit of (hot) loading.
//!
//! Pointer-pool entries are stored symbolically and resolved against the
//! function table and class registry when the module is loaded.

use crate::types::encoding::{Decode, Encode};
use crate::virtual_machine::errors::VMError;
use scriptvm_derive::BinaryCodec;

/// Magic bytes identifying a serialized module image.
const MAGIC: &[u8; 6] = b"SVM_BC";

/// Current image format version.
const CURRENT_VERSION: Version = Version::new(1, 0, 0);

/// Section prefix written after the version.
const MODULE_PREFIX: &[u8] = b"MODULE";

/// Semantic version for image compatibility.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, BinaryCodec)]
struct Version {
    major: u8,
    minor: u8,
    patch: u8,
}

impl Version {
    const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

/// Symbolic pointer-pool entry.
#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub enum Symbol {
    Null,
    /// Function, resolved by name at load time.
    Function(String),
    /// Class descriptor, resolved by name at load time.
    Class(String),
}

/// Register-bank sizes and other per-frame requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, BinaryCodec)]
pub struct FrameLayout {
    pub num_int: u16,
    pub num_float: u16,
    pub num_string: u16,
    pub num_pointer: u16,
    /// Maximum number of simultaneously staged parameters.
    pub max_param: u16,
    /// Bytes of frame-local memory addressable through `LFP`.
    pub extra_space: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinaryCodec)]
pub struct LineEntry {
    pub offset: u32,
    pub line: u32,
}

/// Instruction offset to source line mapping, sorted by offset.
#[derive(Debug, Clone, Default, PartialEq, Eq, BinaryCodec)]
pub struct LineTable {
    entries: Vec<LineEntry>,
}

impl LineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that code from `offset` onward belongs to `line`.
    ///
    /// Consecutive entries for the same line are merged; offsets must not
    /// decrease.
    pub fn push(&mut self, offset: u32, line: u32) {
        if let Some(last) = self.entries.last_mut() {
            if last.line == line {
                return;
            }
            if last.offset == offset {
                last.line = line;
                return;
            }
        }
        self.entries.push(LineEntry { offset, line });
    }

    /// Source line of the instruction at `offset`, if any entry covers it.
    pub fn line_for(&self, offset: usize) -> Option<u32> {
        let idx = self
            .entries
            .partition_point(|e| e.offset as usize <= offset);
        idx.checked_sub(1).map(|i| self.entries[i].line)
    }

    pub fn entries(&self) -> &[LineEntry] {
        &self.entries
    }
}

/// One function as emitted by the compiler or assembler.
#[derive(Debug, Clone, PartialEq, BinaryCodec)]
pub struct CompiledFunction {
    pub name: String,
    pub source_file: String,
    pub code: Vec<u32>,
    pub ints: Vec<i32>,
    pub floats: Vec<f64>,
    pub strings: Vec<String>,
    pub pointers: Vec<Symbol>,
    pub layout: FrameLayout,
    pub lines: LineTable,
}

impl CompiledFunction {
    /// An empty function with no code or pools.
    pub fn new(name: &str, source_file: &str) -> Self {
        Self {
            name: name.to_string(),
            source_file: source_file.to_string(),
            code: Vec::new(),
            ints: Vec::new(),
            floats: Vec::new(),
            strings: Vec::new(),
            pointers: Vec::new(),
            layout: FrameLayout::default(),
            lines: LineTable::new(),
        }
    }
}

/// A compilation unit.
#[derive(Debug, Clone, Default, PartialEq, BinaryCodec)]
pub struct Module {
    pub functions: Vec<CompiledFunction>,
}

impl Module {
    pub fn function(&self, name: &str) -> Option<&CompiledFunction> {
        self.functions
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Serializes the module to a portable image.
    ///
    /// The output includes a magic header and version for compatibility checking.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        MAGIC.encode(&mut out);
        CURRENT_VERSION.encode(&mut out);
        MODULE_PREFIX.to_vec().encode(&mut out);
        self.encode(&mut out);
        out
    }

    /// Deserializes a module image, rejecting other formats and versions.
    pub fn from_bytes(mut input: &[u8]) -> Result<Self, VMError> {
        if input.len() < MAGIC.len() {
            return Err(VMError::DecodeError {
                reason: "truncated".to_string(),
            });
        }

        if &<[u8; 6]>::decode(&mut input)? != MAGIC {
            return Err(VMError::DecodeError {
                reason: "bad magic".to_string(),
            });
        }

        if Version::decode(&mut input)? != CURRENT_VERSION {
            return Err(VMError::DecodeError {
                reason: "unsupported version".to_string(),
            });
        }

        if Vec::<u8>::decode(&mut input)?.as_slice() != MODULE_PREFIX {
            return Err(VMError::DecodeError {
                reason: "bad prefix".to_string(),
            });
        }

        let module = Module::decode(&mut input)?;
        if !input.is_empty() {
            return Err(VMError::DecodeError {
                reason: "trailing bytes".to_string(),
            });
        }
        Ok(module)
    }
}
