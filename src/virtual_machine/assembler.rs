//! Assembly language parser and module builder.
//!
//! Converts human-readable assembly source into a [`Module`] of
//! [`CompiledFunction`]s. Uses [`for_each_instruction!`](for_each_instruction)
//! to generate the operand layout of every instruction, so the encoder never
//! disagrees with the dispatcher about which field an operand lives in.
//!
//! # Syntax
//!
//! ```text
//! .func Name            # starts a function
//! .file "game.sc"       # source file recorded for diagnostics
//! .extra 16             # bytes of frame-local memory (LFP)
//! .maxparam 4           # staged parameter capacity (inferred when absent)
//! loop:                 # label, scoped to the function
//! .line 12              # subsequent instructions map to source line 12
//!     ADD_RK d0, d0, 1  # operands separated by commas or spaces
//!     JMP loop
//! .end
//! ```
//!
//! - Registers: `d` int, `f` float, `s` string, `a` pointer (`d0`, `f3`, ...)
//! - Pool operands take literals which are interned: `42`, `0x10`, `1.5`,
//!   `(1.0, 2.0)` for vectors, `"text"`, `null`, `@Function`, `%Class`
//! - Typed operands (`PARAM`, `RESULT`, `RET`): `d3`, `&d3` (by reference),
//!   `v2:f0`, `v3:f0`, `nil`, or any literal
//! - Return slots: `0`, or `0!` to end the frame
//! - Compare flags: `true`/`false`, `~` suffix for approximate, `lt:`/`le:`
//!   prefix for `CMPS`
//! - Jump offsets accept labels, resolved relative to the next instruction
//! - Comments start with `#`

use crate::error;
use crate::for_each_instruction;
use crate::virtual_machine::errors::{AbortKind, VMError};
use crate::virtual_machine::isa::{Field, Instruction, Word};
use crate::virtual_machine::operand::{
    CastKind, CastbKind, CmpFlags, CmpMode, FlopKind, RegBank, RegType, RetSlot,
};
use crate::virtual_machine::program::{CompiledFunction, Module, Symbol};
use std::collections::HashMap;
use std::fmt::Write;
use std::fs;
use std::path::Path;

const COMMENT_CHAR: char = '#';
const LABEL_SUFFIX: char = ':';
const DIRECTIVE_PREFIX: char = '.';
const FINAL_SUFFIX: char = '!';
const APPROX_SUFFIX: char = '~';

/// Return the line/column/message triple for assembly-related errors.
fn assembly_error_location(err: &VMError) -> Option<(usize, usize, String)> {
    match err {
        VMError::AssemblyError {
            line,
            offset,
            source,
        } => Some((*line, *offset, source.clone())),
        VMError::ParseError {
            line,
            offset,
            message,
        } => Some((*line, *offset, message.to_string())),
        _ => None,
    }
}

/// Formats a compiler-style diagnostic for assembly failures.
pub fn render_assembly_diagnostic(
    file: &str,
    source: &str,
    line: usize,
    offset: usize,
    message: &str,
) -> String {
    let mut diag = String::new();
    let _ = writeln!(diag, "error: {message}");
    let _ = writeln!(diag, " --> {file}:{line}:{offset}");

    if let Some(raw_line) = source.lines().nth(line.saturating_sub(1)) {
        let line_text = raw_line.trim_end_matches('\r');
        let underline = " ".repeat(offset.saturating_sub(1));
        let _ = writeln!(diag, "  |");
        let _ = writeln!(diag, "{:>4} | {}", line, line_text);
        let _ = writeln!(diag, "  | {}^", underline);
    }

    diag
}

/// Renders the diagnostic for `err`, or a plain `error:` line when it
/// carries no location.
pub fn describe_assembly_error(file: &str, source: &str, err: &VMError) -> String {
    match assembly_error_location(err) {
        Some((line, offset, message)) => {
            render_assembly_diagnostic(file, source, line, offset, &message)
        }
        None => format!("error: {err}"),
    }
}

fn log_assembly_error(file: &str, source: &str, err: &VMError) {
    error!("{}", describe_assembly_error(file, source, err));
}

/// How an operand token is parsed and what it encodes to.
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum OperandKind {
    RI,
    RF,
    RS,
    RP,
    RV2,
    RV3,
    RX,
    KI,
    KF,
    KS,
    KP,
    U8,
    I8,
    U16,
    I16,
    I24,
    TO,
    RET,
    CMP,
    CK,
    CB,
    FN,
    AK,
}

macro_rules! define_operand_layout {
    (
        $( $(#[$doc:meta])* $name:ident = $opcode:expr, $mnemonic:literal => [ $( $field:ident : $kind:ident ),* $(,)? ] ),* $(,)?
    ) => {
        /// Field and kind of each operand, in source order.
        fn operand_layout(instr: Instruction) -> &'static [(Field, OperandKind)] {
            match instr {
                $(
                    Instruction::$name => &[
                        $( ($crate::define_instructions!(@field $field), OperandKind::$kind), )*
                    ],
                )*
            }
        }
    };
}

for_each_instruction!(define_operand_layout);

#[derive(Debug, Clone)]
struct Token<'a> {
    text: &'a str,
    /// 1-based column offset in the line.
    offset: usize,
}

/// Tokenize a single line of assembly.
///
/// Rules:
/// - `#` starts a comment
/// - commas and whitespace separate tokens
/// - separators inside `"..."` or `(...)` do not split
fn tokenize(line_no: usize, line: &str) -> Result<Vec<Token<'_>>, VMError> {
    let mut out = Vec::with_capacity(8);

    let mut start: Option<usize> = None;
    let mut end = line.len();
    let mut in_str = false;
    let mut escaped = false;
    let mut depth = 0usize;

    for (i, b) in line.bytes().enumerate() {
        if in_str {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_str = false,
                _ => {}
            }
            continue;
        }

        match b {
            _ if b == COMMENT_CHAR as u8 => {
                end = i;
                break;
            }
            b'"' => {
                start.get_or_insert(i);
                in_str = true;
            }
            b'(' => {
                start.get_or_insert(i);
                depth += 1;
            }
            b')' => depth = depth.saturating_sub(1),
            b',' | b' ' | b'\t' | b'\r' if depth == 0 => push_token(&mut out, line, &mut start, i),
            _ => {
                start.get_or_insert(i);
            }
        }
    }

    let message = if in_str {
        "unterminated string literal (missing closing quote)"
    } else if depth > 0 {
        "unbalanced parenthesis"
    } else {
        push_token(&mut out, line, &mut start, end);
        return Ok(out);
    };
    Err(VMError::ParseError {
        line: line_no,
        offset: start.map_or(1, |s| s + 1),
        message,
    })
}

fn push_token<'a>(out: &mut Vec<Token<'a>>, line: &'a str, start: &mut Option<usize>, end: usize) {
    if let Some(s) = start.take() {
        out.push(Token {
            text: &line[s..end],
            offset: s + 1,
        });
    }
}

/// Checks if a token is a label definition (ends with `:`)
fn is_label_def(tok: &str) -> bool {
    tok.ends_with(LABEL_SUFFIX) && tok.len() > 1 && !tok.starts_with('"')
}

/// Extracts the label name from a label definition token.
fn label_name(tok: &str) -> &str {
    &tok[..tok.len() - 1]
}

/// Parses a decimal or `0x` hexadecimal integer, optionally negative.
fn parse_int(tok: &str) -> Result<i64, VMError> {
    let (negative, digits) = match tok.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, tok),
    };
    let value = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => digits.parse::<i64>(),
    }
    .map_err(|_| VMError::InvalidOperand {
        kind: "integer",
        token: tok.to_string(),
    })?;
    Ok(if negative { -value } else { value })
}

/// Parses a float literal; integer spellings are accepted too.
fn parse_float(tok: &str) -> Result<f64, VMError> {
    if let Ok(v) = parse_int(tok) {
        return Ok(v as f64);
    }
    tok.parse::<f64>().map_err(|_| VMError::InvalidOperand {
        kind: "float",
        token: tok.to_string(),
    })
}

/// Parses a double-quoted string literal with `\n`, `\t`, `\r`, `\0`, `\\`
/// and `\"` escapes.
fn parse_string(tok: &str) -> Result<String, VMError> {
    let invalid = || VMError::InvalidOperand {
        kind: "string",
        token: tok.to_string(),
    };
    let body = tok
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .filter(|_| tok.len() >= 2)
        .ok_or_else(invalid)?;

    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            _ => return Err(invalid()),
        }
    }
    Ok(out)
}

/// Parses a register token such as `d3` and checks its bank.
fn parse_reg(tok: &str, bank: RegBank) -> Result<i64, VMError> {
    match parse_any_reg(tok) {
        Ok((found, index)) if found == bank => Ok(index),
        _ => Err(VMError::ExpectedRegister {
            expected: bank.as_str(),
            token: tok.to_string(),
        }),
    }
}

/// Parses a register token of any bank.
fn parse_any_reg(tok: &str) -> Result<(RegBank, i64), VMError> {
    let mut chars = tok.chars();
    let bank = chars.next().and_then(RegBank::from_prefix);
    let index = chars.as_str();
    match bank {
        Some(bank) if !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) => {
            let index = index.parse::<i64>().map_err(|_| VMError::InvalidOperand {
                kind: "register",
                token: tok.to_string(),
            })?;
            Ok((bank, index))
        }
        _ => Err(VMError::ExpectedRegister {
            expected: "any",
            token: tok.to_string(),
        }),
    }
}

/// Parses a pointer literal: `null`, `@Function` or `%Class`.
fn parse_symbol(tok: &str) -> Result<Symbol, VMError> {
    if tok.eq_ignore_ascii_case("null") {
        return Ok(Symbol::Null);
    }
    let named = |name: &str| !name.is_empty();
    match (tok.strip_prefix('@'), tok.strip_prefix('%')) {
        (Some(name), _) if named(name) => Ok(Symbol::Function(name.to_string())),
        (_, Some(name)) if named(name) => Ok(Symbol::Class(name.to_string())),
        _ => Err(VMError::InvalidOperand {
            kind: "pointer",
            token: tok.to_string(),
        }),
    }
}

/// Parses compare flags: `[eq:|lt:|le:]true|false[~]`, or a raw number.
fn parse_cmp(tok: &str) -> Result<i64, VMError> {
    if let Ok(raw) = parse_int(tok) {
        return Ok(raw);
    }
    let invalid = || VMError::InvalidOperand {
        kind: "compare flags",
        token: tok.to_string(),
    };

    let (mode, rest) = match tok.split_once(':') {
        Some((mode, rest)) => {
            let mode = match mode.to_ascii_lowercase().as_str() {
                "eq" => CmpMode::Eq,
                "lt" => CmpMode::Lt,
                "le" => CmpMode::Le,
                _ => return Err(invalid()),
            };
            (mode, rest)
        }
        None => (CmpMode::Eq, tok),
    };
    let (approx, rest) = match rest.strip_suffix(APPROX_SUFFIX) {
        Some(rest) => (true, rest),
        None => (false, rest),
    };
    let check = match rest.to_ascii_lowercase().as_str() {
        "true" | "t" => true,
        "false" | "f" => false,
        _ => return Err(invalid()),
    };
    Ok(CmpFlags::new(check, approx, mode).0 as i64)
}

/// Parses a selector name through `lookup`, or a raw number.
fn parse_selector(
    tok: &str,
    kind: &'static str,
    lookup: impl Fn(&str) -> Option<u8>,
) -> Result<i64, VMError> {
    lookup(tok)
        .map(i64::from)
        .or_else(|| parse_int(tok).ok())
        .ok_or_else(|| VMError::InvalidOperand {
            kind,
            token: tok.to_string(),
        })
}

/// Bank and width that the `RX` operands of `CAST`/`CASTB` must have for
/// the selector in `tok`. Unknown selectors leave the operands unchecked;
/// the encoder reports the selector itself.
fn cast_banks(instr: Instruction, tok: &str) -> [Option<(RegBank, usize)>; 2] {
    use RegBank::{Float, Int, Pointer, String as Str};
    match instr {
        Instruction::Cast => {
            let Some(kind) = CastKind::from_name(tok) else {
                return [None, None];
            };
            let (a, b) = match kind {
                CastKind::I2F | CastKind::U2F => ((Float, 1), (Int, 1)),
                CastKind::F2I | CastKind::F2U => ((Int, 1), (Float, 1)),
                CastKind::I2S | CastKind::U2S => ((Str, 1), (Int, 1)),
                CastKind::F2S => ((Str, 1), (Float, 1)),
                CastKind::V22S => ((Str, 1), (Float, 2)),
                CastKind::V32S => ((Str, 1), (Float, 3)),
                CastKind::P2S => ((Str, 1), (Pointer, 1)),
                CastKind::S2I | CastKind::S2N => ((Int, 1), (Str, 1)),
                CastKind::S2F => ((Float, 1), (Str, 1)),
                CastKind::N2S => ((Str, 1), (Int, 1)),
            };
            [Some(a), Some(b)]
        }
        Instruction::Castb => {
            let source = match CastbKind::from_name(tok) {
                Some(CastbKind::I2B) => Int,
                Some(CastbKind::F2B) => Float,
                Some(CastbKind::A2B) => Pointer,
                Some(CastbKind::S2B) => Str,
                None => return [None, None],
            };
            [None, Some((source, 1))]
        }
        _ => [None, None],
    }
}

const fn bank_slot(bank: RegBank) -> usize {
    match bank {
        RegBank::Int => 0,
        RegBank::Float => 1,
        RegBank::String => 2,
        RegBank::Pointer => 3,
    }
}

/// One instruction line awaiting encoding.
struct SourceInstr<'a> {
    /// Assembly line, for diagnostics.
    line: usize,
    /// Line recorded in the function's line table.
    source_line: u32,
    instr: Instruction,
    mnemonic: Token<'a>,
    operands: Vec<Token<'a>>,
}

/// A function between `.func` and `.end`.
struct FunctionBuilder<'a> {
    func: CompiledFunction,
    line: usize,
    labels: HashMap<&'a str, usize>,
    body: Vec<SourceInstr<'a>>,
    max_param: Option<u16>,
    line_override: Option<u32>,
    /// Registers used per bank (highest index + width).
    registers: [usize; 4],
}

impl<'a> FunctionBuilder<'a> {
    fn new(name: &str, source_file: &str, line: usize) -> Self {
        Self {
            func: CompiledFunction::new(name, source_file),
            line,
            labels: HashMap::new(),
            body: Vec::new(),
            max_param: None,
            line_override: None,
            registers: [0; 4],
        }
    }

    /// Registers a label at the next instruction offset.
    fn define_label(&mut self, name: &'a str) -> Result<(), VMError> {
        if self.labels.contains_key(name) {
            return Err(VMError::DuplicateLabel {
                label: name.to_string(),
            });
        }
        self.labels.insert(name, self.body.len());
        Ok(())
    }

    /// Resolves a label to an offset relative to the instruction after `at`.
    fn resolve_label(&self, name: &str, at: usize) -> Result<i64, VMError> {
        let target = self
            .labels
            .get(name)
            .copied()
            .ok_or(VMError::UndefinedLabel {
                label: name.to_string(),
            })?;
        Ok(target as i64 - (at as i64 + 1))
    }

    fn note_register(&mut self, bank: RegBank, index: i64, width: usize) {
        let used = index.max(0) as usize + width;
        let slot = &mut self.registers[bank_slot(bank)];
        *slot = (*slot).max(used);
    }

    fn intern_int(&mut self, value: i32) -> usize {
        let pool = &mut self.func.ints;
        if let Some(pos) = pool.iter().position(|v| *v == value) {
            return pos;
        }
        pool.push(value);
        pool.len() - 1
    }

    /// Interns a run of consecutive floats, reusing an identical run.
    fn intern_floats(&mut self, values: &[f64]) -> usize {
        let pool = &mut self.func.floats;
        let same = |w: &[f64]| w.iter().zip(values).all(|(a, b)| a.to_bits() == b.to_bits());
        if let Some(pos) = pool.windows(values.len()).position(same) {
            return pos;
        }
        let start = pool.len();
        pool.extend_from_slice(values);
        start
    }

    fn intern_string(&mut self, value: String) -> usize {
        let pool = &mut self.func.strings;
        if let Some(pos) = pool.iter().position(|s| *s == value) {
            return pos;
        }
        pool.push(value);
        pool.len() - 1
    }

    fn intern_symbol(&mut self, value: Symbol) -> usize {
        let pool = &mut self.func.pointers;
        if let Some(pos) = pool.iter().position(|s| *s == value) {
            return pos;
        }
        pool.push(value);
        pool.len() - 1
    }

    /// Interns a float literal or a `(x, y[, z])` tuple.
    fn intern_float_literal(&mut self, tok: &str) -> Result<usize, VMError> {
        let Some(inner) = tok.strip_prefix('(').and_then(|t| t.strip_suffix(')')) else {
            let v = parse_float(tok)?;
            return Ok(self.intern_floats(&[v]));
        };
        let values = inner
            .split(',')
            .map(|part| parse_float(part.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        if values.is_empty() || values.len() > 3 {
            return Err(VMError::InvalidOperand {
                kind: "vector",
                token: tok.to_string(),
            });
        }
        Ok(self.intern_floats(&values))
    }

    /// Interns any literal into the pool its spelling selects.
    fn intern_literal(&mut self, tok: &str) -> Result<(RegBank, usize), VMError> {
        if tok.starts_with('"') {
            let s = parse_string(tok)?;
            return Ok((RegBank::String, self.intern_string(s)));
        }
        if let Ok(symbol) = parse_symbol(tok) {
            return Ok((RegBank::Pointer, self.intern_symbol(symbol)));
        }
        if let Ok(v) = parse_int(tok) {
            let v = i32::try_from(v).map_err(|_| VMError::OperandOutOfRange { value: v, bits: 32 })?;
            return Ok((RegBank::Int, self.intern_int(v)));
        }
        let v = parse_float(tok)?;
        Ok((RegBank::Float, self.intern_floats(&[v])))
    }

    /// Parses a typed operand into its register type and index.
    fn typed_operand(&mut self, tok: &str) -> Result<(RegType, i64), VMError> {
        if tok.eq_ignore_ascii_case("nil") {
            return Ok((RegType::NIL, 0));
        }
        if let Some(reg) = tok.strip_prefix('&') {
            let (bank, index) = parse_any_reg(reg)?;
            self.note_register(bank, index, 1);
            return Ok((RegType::new(bank, RegType::ADDROF), index));
        }
        for (prefix, width, flag) in [("v2:", 2, RegType::MULTIREG2), ("v3:", 3, RegType::MULTIREG3)] {
            if let Some(reg) = tok.strip_prefix(prefix) {
                let index = parse_reg(reg, RegBank::Float)?;
                self.note_register(RegBank::Float, index, width);
                return Ok((RegType::new(RegBank::Float, flag), index));
            }
        }
        if let Ok((bank, index)) = parse_any_reg(tok) {
            self.note_register(bank, index, 1);
            return Ok((RegType::new(bank, 0), index));
        }
        let (bank, index) = self.intern_literal(tok)?;
        Ok((RegType::new(bank, RegType::KONST), index as i64))
    }

    /// Parses one operand and places it in `word`.
    fn encode_operand(
        &mut self,
        word: Word,
        at: usize,
        field: Field,
        kind: OperandKind,
        tok: &str,
        expect: Option<(RegBank, usize)>,
    ) -> Result<Word, VMError> {
        use OperandKind::*;

        let reg = |b: &mut Self, bank: RegBank, width: usize| -> Result<i64, VMError> {
            let index = parse_reg(tok, bank)?;
            b.note_register(bank, index, width);
            Ok(index)
        };

        let value = match kind {
            RI => reg(self, RegBank::Int, 1)?,
            RF => reg(self, RegBank::Float, 1)?,
            RS => reg(self, RegBank::String, 1)?,
            RP => reg(self, RegBank::Pointer, 1)?,
            RV2 => reg(self, RegBank::Float, 2)?,
            RV3 => reg(self, RegBank::Float, 3)?,
            RX => match expect {
                Some((bank, width)) => reg(self, bank, width)?,
                None => {
                    let (bank, index) = parse_any_reg(tok)?;
                    self.note_register(bank, index, 1);
                    index
                }
            },
            KI => {
                let v = parse_int(tok)?;
                let v = i32::try_from(v).map_err(|_| VMError::OperandOutOfRange { value: v, bits: 32 })?;
                self.intern_int(v) as i64
            }
            KF => self.intern_float_literal(tok)? as i64,
            KS => {
                let s = parse_string(tok)?;
                self.intern_string(s) as i64
            }
            KP => {
                let symbol = parse_symbol(tok)?;
                self.intern_symbol(symbol) as i64
            }
            U8 | U16 => parse_int(tok)?,
            I8 => return word.with_signed(field, parse_int(tok)?),
            I16 | I24 => {
                let v = match parse_int(tok) {
                    Ok(v) => v,
                    Err(_) => self.resolve_label(tok, at)?,
                };
                return word.with_signed(field, v);
            }
            TO => {
                let (ty, index) = self.typed_operand(tok)?;
                return word.with_typed(field, ty.0, index);
            }
            RET => {
                let (slot, is_final) = match tok.strip_suffix(FINAL_SUFFIX) {
                    Some(slot) => (slot, true),
                    None => (tok, false),
                };
                let slot = parse_int(slot)?;
                if !(0..RetSlot::FINAL as i64).contains(&slot) {
                    return Err(VMError::OperandOutOfRange { value: slot, bits: 7 });
                }
                RetSlot::new(slot as u8, is_final).0 as i64
            }
            CMP => parse_cmp(tok)?,
            CK => parse_selector(tok, "cast", |t| CastKind::from_name(t).map(|k| k as u8))?,
            CB => parse_selector(tok, "bool cast", |t| CastbKind::from_name(t).map(|k| k as u8))?,
            FN => parse_selector(tok, "float function", |t| FlopKind::from_name(t).map(|k| k as u8))?,
            AK => parse_selector(tok, "abort kind", |t| {
                AbortKind::from_name(&t.to_ascii_lowercase()).map(|k| k as u8)
            })?,
        };
        word.with_unsigned(field, value)
    }

    /// Encodes the instruction at offset `at`.
    fn encode(&mut self, at: usize, line: &SourceInstr<'_>) -> Result<Word, VMError> {
        let layout = operand_layout(line.instr);
        if layout.len() != line.operands.len() {
            return Err(VMError::AssemblyError {
                line: line.line,
                offset: line.mnemonic.offset,
                source: VMError::ArityMismatch {
                    instruction: line.instr.mnemonic().to_string(),
                    expected: layout.len(),
                    actual: line.operands.len(),
                }
                .to_string(),
            });
        }

        let expect = line
            .operands
            .last()
            .map_or([None, None], |t| cast_banks(line.instr, t.text));

        let mut word = Word::new(line.instr);
        for (i, (&(field, kind), tok)) in layout.iter().zip(&line.operands).enumerate() {
            let rx = expect.get(i).copied().flatten();
            word = self
                .encode_operand(word, at, field, kind, tok.text, rx)
                .map_err(|e| VMError::AssemblyError {
                    line: line.line,
                    offset: tok.offset,
                    source: e.to_string(),
                })?;
        }
        Ok(word)
    }

    /// Largest number of values staged at once, scanning the code linearly.
    fn infer_max_param(code: &[u32]) -> usize {
        let (mut staged, mut max) = (0usize, 0usize);
        for &raw in code {
            let word = Word(raw);
            match Instruction::try_from(word.op()) {
                Ok(Instruction::Param) => {
                    let ty = RegType(word.a());
                    staged += if ty.is_nil() { 1 } else { ty.width() };
                }
                Ok(Instruction::Parami) => staged += 1,
                Ok(Instruction::Call | Instruction::CallK) => {
                    staged = staged.saturating_sub(word.b() as usize);
                }
                _ => {}
            }
            max = max.max(staged);
        }
        max
    }

    fn finish(mut self) -> Result<CompiledFunction, VMError> {
        let body = std::mem::take(&mut self.body);
        for (at, line) in body.iter().enumerate() {
            let word = self.encode(at, line)?;
            self.func.lines.push(at as u32, line.source_line);
            self.func.code.push(word.0);
        }

        let mut counts = [0u16; 4];
        for bank in [RegBank::Int, RegBank::Float, RegBank::String, RegBank::Pointer] {
            let used = self.registers[bank_slot(bank)];
            counts[bank_slot(bank)] = u16::try_from(used).map_err(|_| VMError::AssemblyError {
                line: self.line,
                offset: 1,
                source: format!("{} uses {used} {} registers", self.func.name, bank.as_str()),
            })?;
        }
        let layout = &mut self.func.layout;
        layout.num_int = counts[bank_slot(RegBank::Int)];
        layout.num_float = counts[bank_slot(RegBank::Float)];
        layout.num_string = counts[bank_slot(RegBank::String)];
        layout.num_pointer = counts[bank_slot(RegBank::Pointer)];

        let inferred = Self::infer_max_param(&self.func.code);
        layout.max_param = match self.max_param {
            Some(declared) => declared,
            None => u16::try_from(inferred).unwrap_or(u16::MAX),
        };
        Ok(self.func)
    }
}

/// Parses a directive argument as an unsigned number.
fn directive_number(name: &str, args: &[Token<'_>]) -> Result<u32, VMError> {
    let value = match args {
        [tok] => parse_int(tok.text).ok().and_then(|v| u32::try_from(v).ok()),
        _ => None,
    };
    value.ok_or_else(|| VMError::Directive {
        message: format!("{name} expects one non-negative number"),
    })
}

/// Applies a per-function directive.
fn apply_directive(open: &mut FunctionBuilder<'_>, name: &str, args: &[Token<'_>]) -> Result<(), VMError> {
    match name {
        "file" => {
            let [file] = args else {
                return Err(VMError::Directive {
                    message: ".file expects a path".to_string(),
                });
            };
            open.func.source_file = if file.text.starts_with('"') {
                parse_string(file.text)?
            } else {
                file.text.to_string()
            };
        }
        "line" => open.line_override = Some(directive_number(".line", args)?),
        "extra" => open.func.layout.extra_space = directive_number(".extra", args)?,
        "maxparam" => {
            let n = directive_number(".maxparam", args)?;
            let n = u16::try_from(n).map_err(|_| VMError::OperandOutOfRange {
                value: n as i64,
                bits: 16,
            })?;
            open.max_param = Some(n);
        }
        other => {
            return Err(VMError::Directive {
                message: format!("unknown directive .{other}"),
            });
        }
    }
    Ok(())
}

/// Splits the source into functions (pass 1) and encodes each of them
/// once its labels are known (pass 2).
fn assemble_module(source: &str, source_name: &str) -> Result<Module, VMError> {
    let mut module = Module::default();
    let mut current: Option<FunctionBuilder<'_>> = None;

    for (idx, line) in source.lines().enumerate() {
        let line_no = idx + 1;
        let tokens = tokenize(line_no, line)?;
        let Some(first) = tokens.first() else {
            continue;
        };
        let at = |e: VMError| VMError::AssemblyError {
            line: line_no,
            offset: first.offset,
            source: e.to_string(),
        };

        if let Some(directive) = first.text.strip_prefix(DIRECTIVE_PREFIX) {
            let args = &tokens[1..];
            let directive = directive.to_ascii_lowercase();
            match directive.as_str() {
                "func" => {
                    if let Some(open) = &current {
                        return Err(at(VMError::Directive {
                            message: format!("missing .end before .func (in {})", open.func.name),
                        }));
                    }
                    let [name] = args else {
                        return Err(at(VMError::Directive {
                            message: ".func expects a name".to_string(),
                        }));
                    };
                    if module.function(name.text).is_some() {
                        return Err(at(VMError::DuplicateFunction {
                            name: name.text.to_string(),
                        }));
                    }
                    current = Some(FunctionBuilder::new(name.text, source_name, line_no));
                }
                "end" => {
                    let builder = current.take().ok_or_else(|| {
                        at(VMError::Directive {
                            message: ".end outside of a function".to_string(),
                        })
                    })?;
                    module.functions.push(builder.finish()?);
                }
                other => {
                    let Some(open) = current.as_mut() else {
                        return Err(at(VMError::Directive {
                            message: format!(".{other} outside of a function"),
                        }));
                    };
                    apply_directive(open, other, args).map_err(at)?;
                }
            }
            continue;
        }

        let Some(builder) = current.as_mut() else {
            return Err(at(VMError::Directive {
                message: "code outside of a function (missing .func)".to_string(),
            }));
        };

        let mut rest = &tokens[..];
        if is_label_def(first.text) {
            builder.define_label(label_name(first.text)).map_err(at)?;
            rest = &tokens[1..];
        }
        let Some((mnemonic, operands)) = rest.split_first() else {
            continue;
        };

        let instr = Instruction::from_mnemonic(mnemonic.text).ok_or_else(|| VMError::AssemblyError {
            line: line_no,
            offset: mnemonic.offset,
            source: VMError::InvalidInstructionName {
                name: mnemonic.text.to_string(),
            }
            .to_string(),
        })?;
        let source_line = builder.line_override.unwrap_or(line_no as u32);
        builder.body.push(SourceInstr {
            line: line_no,
            source_line,
            instr,
            mnemonic: mnemonic.clone(),
            operands: operands.to_vec(),
        });
    }

    if let Some(open) = current {
        return Err(VMError::AssemblyError {
            line: open.line,
            offset: 1,
            source: format!("function {} has no .end", open.func.name),
        });
    }
    Ok(module)
}

/// Assemble a full source string into a module.
///
/// Each function is assembled in two passes: labels are collected first,
/// then instructions are encoded with label offsets resolved. Register bank
/// sizes are the highest register index used plus one; the staged parameter
/// capacity is inferred unless `.maxparam` is given.
pub fn assemble_source(source: &str) -> Result<Module, VMError> {
    assemble_source_with_name(source, "<source>")
}

/// Assembles source with an associated filename for error diagnostics.
///
/// Logs a compiler-style diagnostic on failure. `source_name` is also the
/// default source file of every function.
pub fn assemble_source_with_name(source: &str, source_name: &str) -> Result<Module, VMError> {
    let result = assemble_module(source, source_name);
    if let Err(err) = &result {
        log_assembly_error(source_name, source, err);
    }
    result
}

/// Convenience: assemble directly from file path
pub fn assemble_file<P: AsRef<Path>>(path: P) -> Result<Module, VMError> {
    let path_ref = path.as_ref();
    let source = fs::read_to_string(path_ref).map_err(|e| VMError::IoError {
        path: path_ref.display().to_string(),
        source: e.to_string(),
    })?;
    assemble_source_with_name(&source, &path_ref.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::operand::TypedOperand;

    fn single(source: &str) -> CompiledFunction {
        let module = assemble_source(source).unwrap();
        assert_eq!(module.functions.len(), 1);
        module.functions.into_iter().next().unwrap()
    }

    fn word(f: &CompiledFunction, at: usize) -> Word {
        Word(f.code[at])
    }

    fn err_line(source: &str) -> (usize, String) {
        match assemble_source(source).unwrap_err() {
            VMError::AssemblyError { line, source, .. } => (line, source),
            other => panic!("expected assembly error, got {other:?}"),
        }
    }

    #[test]
    fn tokenize_splits_on_commas_and_spaces() {
        let toks = tokenize(1, "ADD_RR d0,d1 , d2").unwrap();
        let texts: Vec<_> = toks.iter().map(|t| t.text).collect();
        assert_eq!(texts, ["ADD_RR", "d0", "d1", "d2"]);
        assert_eq!(toks[1].offset, 8);
    }

    #[test]
    fn tokenize_keeps_strings_and_tuples_whole() {
        let toks = tokenize(1, r#"LKS s0, "a, b # c" # trailing"#).unwrap();
        assert_eq!(toks[2].text, r#""a, b # c""#);
        assert_eq!(toks.len(), 3);

        let toks = tokenize(1, "EQV2_K true, f0, (1.0, 2.5)").unwrap();
        assert_eq!(toks[3].text, "(1.0, 2.5)");
    }

    #[test]
    fn tokenize_unterminated_string() {
        assert!(matches!(
            tokenize(4, r#"LKS s0, "open"#),
            Err(VMError::ParseError { line: 4, offset: 9, .. })
        ));
    }

    #[test]
    fn is_label_def_valid() {
        assert!(is_label_def("loop:"));
        assert!(!is_label_def(":"));
        assert!(!is_label_def("d0"));
        assert_eq!(label_name("loop:"), "loop");
    }

    #[test]
    fn parse_int_forms() {
        assert_eq!(parse_int("42").unwrap(), 42);
        assert_eq!(parse_int("-7").unwrap(), -7);
        assert_eq!(parse_int("0x1F").unwrap(), 31);
        assert!(parse_int("d0").is_err());
    }

    #[test]
    fn parse_string_escapes() {
        assert_eq!(parse_string(r#""a\n\"b\"""#).unwrap(), "a\n\"b\"");
        assert!(parse_string(r#""bad\q""#).is_err());
        assert!(parse_string("noquotes").is_err());
    }

    #[test]
    fn parse_reg_checks_bank() {
        assert_eq!(parse_reg("d12", RegBank::Int).unwrap(), 12);
        assert!(matches!(
            parse_reg("f1", RegBank::Int),
            Err(VMError::ExpectedRegister { expected: "int", .. })
        ));
        assert!(parse_any_reg("x1").is_err());
        assert!(parse_any_reg("d").is_err());
    }

    #[test]
    fn parse_cmp_forms() {
        assert_eq!(parse_cmp("true").unwrap(), 1);
        assert_eq!(parse_cmp("false").unwrap(), 0);
        let approx = CmpFlags(parse_cmp("true~").unwrap() as u8);
        assert!(approx.check() && approx.approx());
        let lt = CmpFlags(parse_cmp("lt:false").unwrap() as u8);
        assert_eq!(lt.mode().unwrap(), CmpMode::Lt);
        assert!(!lt.check());
        assert!(parse_cmp("maybe").is_err());
    }

    #[test]
    fn assemble_empty_source() {
        assert!(assemble_source("").unwrap().functions.is_empty());
        assert!(assemble_source("# only comments\n\n").unwrap().functions.is_empty());
    }

    #[test]
    fn assemble_single_instruction() {
        let f = single(".func Main\n  ADD_RR d2, d0, d1\n.end\n");
        assert_eq!(f.name, "Main");
        assert_eq!(f.source_file, "<source>");
        let w = word(&f, 0);
        assert_eq!(w.op(), Instruction::AddRR as u8);
        assert_eq!((w.a(), w.b(), w.c()), (2, 0, 1));
        assert_eq!(f.layout.num_int, 3);
        assert_eq!(f.layout.num_float, 0);
    }

    #[test]
    fn assemble_invalid_instruction() {
        let (line, msg) = err_line(".func F\n  FROB d0\n.end");
        assert_eq!(line, 2);
        assert!(msg.contains("FROB"));
    }

    #[test]
    fn assemble_wrong_arity() {
        let (line, msg) = err_line(".func F\n  ADD_RR d0, d1\n.end");
        assert_eq!(line, 2);
        assert!(msg.contains("takes 3 operands, got 2"));
    }

    #[test]
    fn constants_are_interned_once() {
        let f = single(
            ".func F\n\
             LK d0, 100000\n\
             LK d1, 100000\n\
             LKS s0, \"hi\"\n\
             LKF f0, 2.5\n\
             LKP a0, @Other\n\
             LKP a1, %Actor\n\
             LKP a2, null\n\
             .end",
        );
        assert_eq!(f.ints, vec![100000]);
        assert_eq!(word(&f, 1).bc(), 0);
        assert_eq!(f.strings, vec!["hi".to_string()]);
        assert_eq!(f.floats, vec![2.5]);
        assert_eq!(
            f.pointers,
            vec![
                Symbol::Function("Other".into()),
                Symbol::Class("Actor".into()),
                Symbol::Null
            ]
        );
    }

    #[test]
    fn vector_constants_are_consecutive() {
        let f = single(".func F\nEQV2_K true, f0, (1.0, 2.0)\nJMP 0\nLKF f2, 2.0\n.end");
        assert_eq!(f.floats, vec![1.0, 2.0]);
        assert_eq!(word(&f, 0).c(), 0);
        assert_eq!(word(&f, 2).bc(), 1);
        assert_eq!(f.layout.num_float, 3);
    }

    #[test]
    fn labels_resolve_relative_to_next_instruction() {
        let f = single(
            ".func F\n\
             top:\n\
             ADDI d0, d0, 1\n\
             JMP top\n\
             JMP done\n\
             NOP\n\
             done: RETI 0!, 0\n\
             .end",
        );
        assert_eq!(word(&f, 1).abc(), -2);
        assert_eq!(word(&f, 2).abc(), 1);
        assert_eq!(word(&f, 4).op(), Instruction::Reti as u8);
    }

    #[test]
    fn duplicate_label_error() {
        let (_, msg) = err_line(".func F\nx: NOP\nx: NOP\n.end");
        assert!(msg.contains("duplicate label"));
    }

    #[test]
    fn undefined_label_error() {
        let (line, msg) = err_line(".func F\nJMP nowhere\n.end");
        assert_eq!(line, 2);
        assert!(msg.contains("undefined label: nowhere"));
    }

    #[test]
    fn labels_are_scoped_per_function() {
        let src = ".func A\nl: NOP\n.end\n.func B\nJMP l\n.end";
        let (line, _) = err_line(src);
        assert_eq!(line, 5);
    }

    #[test]
    fn typed_operands_encode_flags() {
        let f = single(
            ".func F\n\
             PARAM d3\n\
             PARAM &s1\n\
             PARAM v3:f4\n\
             PARAM \"text\"\n\
             PARAM nil\n\
             CALL_K @G, 5, 1\n\
             RESULT f0\n\
             RET 0!, v2:f0\n\
             .end",
        );
        let decode = |at: usize| TypedOperand {
            ty: RegType(word(&f, at).a()),
            index: word(&f, at).bc(),
        };
        assert_eq!(decode(0).ty, RegType::INT);
        assert_eq!(decode(0).index, 3);
        assert!(decode(1).ty.is_addrof());
        assert_eq!(decode(1).ty.bank(), RegBank::String);
        assert_eq!(decode(2).ty.width(), 3);
        assert!(decode(3).ty.is_konst());
        assert_eq!(f.strings[decode(3).index as usize], "text");
        assert!(decode(4).ty.is_nil());

        let ret = word(&f, 7);
        assert!(RetSlot(ret.a()).is_final());
        assert_eq!(RegType(ret.b()).width(), 2);

        assert_eq!(f.layout.num_float, 7);
        assert_eq!(f.layout.num_string, 2);
        assert_eq!(f.layout.max_param, 7);
    }

    #[test]
    fn max_param_follows_calls() {
        let f = single(
            ".func F\n\
             PARAMI 1\nPARAMI 2\nCALL_K @G, 2, 0\n\
             PARAMI 3\nCALL_K @G, 1, 0\n\
             RET 0!, nil\n.end",
        );
        assert_eq!(f.layout.max_param, 2);

        let f = single(".func F\n.maxparam 9\nRET 0!, nil\n.end");
        assert_eq!(f.layout.max_param, 9);
    }

    #[test]
    fn directives_set_metadata() {
        let f = single(
            ".func F\n\
             .file \"game/player.sc\"\n\
             .extra 24\n\
             .line 40\n\
             NOP\n\
             NOP\n\
             .line 41\n\
             RET 0!, nil\n\
             .end",
        );
        assert_eq!(f.source_file, "game/player.sc");
        assert_eq!(f.layout.extra_space, 24);
        assert_eq!(f.lines.line_for(0), Some(40));
        assert_eq!(f.lines.line_for(1), Some(40));
        assert_eq!(f.lines.line_for(2), Some(41));
    }

    #[test]
    fn line_table_defaults_to_assembly_lines() {
        let f = single(".func F\n\nNOP\nRET 0!, nil\n.end");
        assert_eq!(f.lines.line_for(0), Some(3));
        assert_eq!(f.lines.line_for(1), Some(4));
    }

    #[test]
    fn selectors_by_name() {
        let f = single(
            ".func F\n\
             CAST f0, d0, I2F\n\
             CAST s0, f0, V22S\n\
             CASTB d1, s0, S2B\n\
             FLOP f1, f0, sqrt\n\
             THROW read_nil, \"boom\"\n\
             .end",
        );
        assert_eq!(word(&f, 0).c(), CastKind::I2F as u8);
        assert_eq!(word(&f, 2).c(), CastbKind::S2B as u8);
        assert_eq!(word(&f, 3).c(), FlopKind::Sqrt as u8);
        assert_eq!(word(&f, 4).a(), AbortKind::ReadNil as u8);
    }

    #[test]
    fn cast_operands_follow_selector() {
        let (_, msg) = err_line(".func F\nCAST d0, d1, I2F\n.end");
        assert!(msg.contains("expected float register"));
    }

    #[test]
    fn operand_out_of_range() {
        let (_, msg) = err_line(".func F\nLI d0, 40000\n.end");
        assert!(msg.contains("16-bit"));
        let (_, msg) = err_line(".func F\nMOV d256, d0\n.end");
        assert!(msg.contains("8-bit"));
    }

    #[test]
    fn structural_errors() {
        assert!(err_line("NOP").1.contains("outside of a function"));
        assert!(err_line(".func F\nNOP").1.contains("has no .end"));
        assert!(err_line(".func F\n.func G\n.end").1.contains("missing .end"));
        assert!(err_line(".func F\n.bogus\n.end").1.contains("unknown directive"));
        assert!(
            err_line(".func F\n.end\n.func f\n.end")
                .1
                .contains("duplicate function")
        );
    }

    #[test]
    fn several_functions_in_order() {
        let module = assemble_source(".func A\nNOP\n.end\n.func B\nNOP\nNOP\n.end").unwrap();
        let names: Vec<_> = module.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["A", "B"]);
        assert_eq!(module.function("b").unwrap().code.len(), 2);
    }

    #[test]
    fn diagnostic_points_at_operand() {
        let src = ".func F\n  ADD_RR d0, f1, d2\n.end";
        let err = assemble_source(src).unwrap_err();
        let diag = describe_assembly_error("t.sasm", src, &err);
        assert!(diag.starts_with("error: expected int register, got `f1`"));
        assert!(diag.contains(" --> t.sasm:2:14"));
        assert!(diag.contains("   2 |   ADD_RR d0, f1, d2"));
        assert!(diag.contains(&format!("  | {}^", " ".repeat(13))));
    }

    #[test]
    fn assemble_file_missing() {
        assert!(matches!(
            assemble_file("/nonexistent/x.sasm"),
            Err(VMError::IoError { .. })
        ));
    }

    #[test]
    fn every_instruction_has_a_layout() {
        for instr in Instruction::ALL {
            assert_eq!(operand_layout(*instr).len(), instr.arity());
        }
    }
}
