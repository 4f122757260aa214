//! Error types for the script VM.
//!
//! Two families exist:
//! - [`VMError`]: contract violations (malformed bytecode, bad register or
//!   pool indices, unknown selectors), module decode failures and assembly
//!   failures.
//! - [`ScriptAbort`]: a fatal, diagnosable condition that ends the current
//!   top-level invocation. It carries the abort kind, detail text and one
//!   attribution line per unwound frame.

use scriptvm_derive::Error;
use std::fmt;

/// Errors raised for malformed programs, images and assembly sources.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VMError {
    /// Unknown opcode encountered in bytecode.
    #[error("invalid opcode 0x{opcode:02x} at instruction {offset}")]
    InvalidOpcode { opcode: u8, offset: usize },
    /// Unrecognized instruction mnemonic during assembly.
    #[error("invalid instruction name: {name}")]
    InvalidInstructionName { name: String },
    /// Wrong number of operands for an instruction.
    #[error("{instruction} takes {expected} operands, got {actual}")]
    ArityMismatch {
        instruction: String,
        expected: usize,
        actual: usize,
    },
    /// Expected a register of a given bank but got something else.
    #[error("expected {expected} register, got `{token}`")]
    ExpectedRegister {
        expected: &'static str,
        token: String,
    },
    /// Operand token could not be parsed as the required kind.
    #[error("invalid {kind} operand `{token}`")]
    InvalidOperand { kind: &'static str, token: String },
    /// Operand value does not fit in its encoding slot.
    #[error("operand {value} does not fit in a {bits}-bit field")]
    OperandOutOfRange { value: i64, bits: u32 },
    /// Register index exceeds the bank declared by the function.
    #[error("{bank} register {index} out of range ({available} declared)")]
    RegisterOutOfRange {
        bank: &'static str,
        index: usize,
        available: usize,
    },
    /// Constant-pool index exceeds the pool size.
    #[error("{pool} constant {index} out of range ({available} in pool)")]
    ConstantOutOfRange {
        pool: &'static str,
        index: usize,
        available: usize,
    },
    /// Instruction pointer left the code array.
    #[error("instruction pointer {pc} outside code of {len} words")]
    CodeOutOfRange { pc: usize, len: usize },
    /// A compare or test instruction was not followed by `JMP`.
    #[error("instruction after {instruction} at {offset} must be JMP")]
    ExpectedJump {
        instruction: &'static str,
        offset: usize,
    },
    /// A call was not followed by the expected `RESULT` markers.
    #[error("expected RESULT marker at {offset}")]
    ExpectedResult { offset: usize },
    /// A `RESULT` marker was reached by normal execution.
    #[error("RESULT marker at {offset} executed outside a call")]
    StrayResult { offset: usize },
    /// Unknown cast, float-function, bool-cast, abort or type selector.
    #[error("unknown {what} selector {value}")]
    UnknownSelector { what: &'static str, value: u8 },
    /// A parameter push exceeded the function's declared maximum.
    #[error("parameter staging overflow ({capacity} slots declared)")]
    StagingOverflow { capacity: usize },
    /// A call consumed more parameters than were staged.
    #[error("call consumes {requested} parameters but {available} are staged")]
    StagingUnderflow { requested: usize, available: usize },
    /// Arguments do not fit the callee's register banks.
    #[error("arguments overflow the {bank} registers of {function}")]
    ArgumentsExceedFrame {
        function: String,
        bank: &'static str,
    },
    /// Return slot and returned value disagree on type.
    #[error("return slot {slot} expects {expected}, got {actual}")]
    ReturnTypeMismatch {
        slot: usize,
        expected: &'static str,
        actual: &'static str,
    },
    /// Typed operand uses a flag combination the instruction does not accept.
    #[error("{instruction} does not accept operand type 0x{ty:02x}")]
    UnsupportedOperandType {
        instruction: &'static str,
        ty: u8,
    },
    /// Pointer used as a callee does not reference a function.
    #[error("pointer {pointer} is not a function")]
    NotAFunction { pointer: String },
    /// Pointer expected to reference a managed object.
    #[error("pointer {pointer} is not a managed object")]
    NotAnObject { pointer: String },
    /// Pointer expected to reference a class descriptor.
    #[error("pointer {pointer} is not a class")]
    NotAClass { pointer: String },
    /// Pointer cannot be used as a memory base.
    #[error("pointer {pointer} is not addressable")]
    NotAddressable { pointer: String },
    /// Pointer subtraction across different blocks.
    #[error("pointers {left} and {right} are in different blocks")]
    UnrelatedPointers { left: String, right: String },
    /// Memory access outside a block.
    #[error("access of {width} bytes at offset {offset} outside block of {len} bytes")]
    AddressOutOfRange { offset: i64, width: usize, len: usize },
    /// Memory slot holds a different kind of reference than requested.
    #[error("offset {offset} does not hold a {expected}")]
    SlotMismatch { offset: u32, expected: &'static str },
    /// Reference to a freed block or object.
    #[error("dangling {what} reference #{index}")]
    DanglingReference { what: &'static str, index: u32 },
    /// Name index not present in the name table.
    #[error("unknown name index {index}")]
    UnknownName { index: i32 },
    /// Function name could not be resolved.
    #[error("undefined function: {name}")]
    UndefinedFunction { name: String },
    /// Function id is not present in the function table.
    #[error("undefined function id {id}")]
    UndefinedFunctionId { id: u32 },
    /// Class name could not be resolved.
    #[error("undefined class: {name}")]
    UndefinedClass { name: String },
    /// Virtual-table slot outside the class's table.
    #[error("class {class} has no virtual slot {slot}")]
    VirtualSlotOutOfRange { class: String, slot: usize },
    /// The interpreter was asked to step with no frame on the stack.
    #[error("no active frame")]
    NoActiveFrame,
    /// Execution ran past the last instruction without a final return.
    #[error("execution ran past the end of {function}")]
    FellOffEnd { function: String },
    /// Label defined more than once.
    #[error("duplicate label: {label}")]
    DuplicateLabel { label: String },
    /// Reference to undefined label.
    #[error("undefined label: {label}")]
    UndefinedLabel { label: String },
    /// Function defined twice in one module.
    #[error("duplicate function: {name}")]
    DuplicateFunction { name: String },
    /// Malformed directive or structural assembly error.
    #[error("{message}")]
    Directive { message: String },
    /// Assembly error with line number context.
    #[error("line {line}: {source}")]
    AssemblyError {
        line: usize,
        offset: usize,
        source: String,
    },
    /// Tokenizer failure with location.
    #[error("line {line}: {message}")]
    ParseError {
        line: usize,
        offset: usize,
        message: &'static str,
    },
    /// File I/O error during assembly or image loading.
    #[error("io error on {path}: {source}")]
    IoError { path: String, source: String },
    /// Failed to decode a module image.
    #[error("decoding error: {reason}")]
    DecodeError { reason: String },
}

impl From<crate::types::encoding::DecodeError> for VMError {
    fn from(err: crate::types::encoding::DecodeError) -> Self {
        VMError::DecodeError {
            reason: err.to_string(),
        }
    }
}

/// Reason a script invocation was aborted.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortKind {
    ReadNil = 0,
    WriteNil = 1,
    IndexOutOfBounds = 2,
    NegativeIndex = 3,
    DivisionByZero = 4,
    BadSelf = 5,
    FormatError = 6,
    Other = 7,
    ContractViolation = 8,
}

impl AbortKind {
    /// All kinds in selector order.
    pub const ALL: [AbortKind; 9] = [
        AbortKind::ReadNil,
        AbortKind::WriteNil,
        AbortKind::IndexOutOfBounds,
        AbortKind::NegativeIndex,
        AbortKind::DivisionByZero,
        AbortKind::BadSelf,
        AbortKind::FormatError,
        AbortKind::Other,
        AbortKind::ContractViolation,
    ];

    /// Human-readable headline used in diagnostics.
    pub const fn description(self) -> &'static str {
        match self {
            AbortKind::ReadNil => "read from nil",
            AbortKind::WriteNil => "write to nil",
            AbortKind::IndexOutOfBounds => "array index too large",
            AbortKind::NegativeIndex => "negative array index",
            AbortKind::DivisionByZero => "division by zero",
            AbortKind::BadSelf => "invalid self pointer",
            AbortKind::FormatError => "string format error",
            AbortKind::Other => "script aborted",
            AbortKind::ContractViolation => "bytecode contract violation",
        }
    }

    /// Assembly name, as accepted by `THROW`.
    pub const fn as_str(self) -> &'static str {
        match self {
            AbortKind::ReadNil => "read_nil",
            AbortKind::WriteNil => "write_nil",
            AbortKind::IndexOutOfBounds => "index_out_of_bounds",
            AbortKind::NegativeIndex => "negative_index",
            AbortKind::DivisionByZero => "division_by_zero",
            AbortKind::BadSelf => "bad_self",
            AbortKind::FormatError => "format_error",
            AbortKind::Other => "other",
            AbortKind::ContractViolation => "contract_violation",
        }
    }

    /// Looks up a kind by its assembly name.
    pub fn from_name(name: &str) -> Option<AbortKind> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl TryFrom<u8> for AbortKind {
    type Error = VMError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(VMError::UnknownSelector {
                what: "abort",
                value,
            })
    }
}

/// Where one unwound frame was when the abort passed through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribution {
    /// A script frame, located through its line table.
    Script {
        function: String,
        file: String,
        line: Option<u32>,
    },
    /// A native function on the call chain.
    Native { function: String },
}

impl Attribution {
    /// Attribution for a native function.
    pub fn native(name: &str) -> Self {
        Attribution::Native {
            function: name.to_string(),
        }
    }

    /// Name of the attributed function.
    pub fn function(&self) -> &str {
        match self {
            Attribution::Script { function, .. } | Attribution::Native { function } => function,
        }
    }
}

impl fmt::Display for Attribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribution::Script {
                function,
                file,
                line: Some(line),
            } => write!(f, "{function} at {file}, line {line}"),
            Attribution::Script {
                function,
                file,
                line: None,
            } => write!(f, "{function} at {file}"),
            Attribution::Native { function } => write!(f, "native {function}"),
        }
    }
}

/// A fatal script condition with its attribution chain.
///
/// The first frame an abort passes through becomes its `origin`; every frame
/// after that is appended to `callers`, innermost first.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptAbort {
    pub kind: AbortKind,
    pub detail: Option<String>,
    pub origin: Option<Attribution>,
    pub callers: Vec<Attribution>,
}

impl ScriptAbort {
    /// Creates an unattributed abort.
    pub fn new(kind: AbortKind) -> Self {
        Self {
            kind,
            detail: None,
            origin: None,
            callers: Vec::new(),
        }
    }

    /// Creates an abort carrying detail text.
    pub fn with_detail(kind: AbortKind, detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::new(kind)
        }
    }

    /// Records that the abort unwound through `at`.
    pub fn attributed(mut self, at: Attribution) -> Self {
        if self.origin.is_none() {
            self.origin = Some(at);
        } else {
            self.callers.push(at);
        }
        self
    }

    /// The headline plus detail, without attribution lines.
    pub fn message(&self) -> String {
        match &self.detail {
            Some(detail) => format!("{}: {detail}", self.kind.description()),
            None => self.kind.description().to_string(),
        }
    }
}

impl From<VMError> for ScriptAbort {
    fn from(err: VMError) -> Self {
        ScriptAbort::with_detail(AbortKind::ContractViolation, err.to_string())
    }
}

impl fmt::Display for ScriptAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())?;
        if let Some(origin) = &self.origin {
            write!(f, "\n  in {origin}")?;
        }
        for caller in &self.callers {
            write!(f, "\n  called from {caller}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ScriptAbort {}
