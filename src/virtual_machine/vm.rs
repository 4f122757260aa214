//! The bytecode interpreter.
//!
//! A [`Vm`] owns the function table and one frame stack. Script-to-script
//! calls push frames onto that stack and the dispatch loop simply continues
//! in the new top frame; native functions run on the host stack and may call
//! back in through [`Vm::call`], which starts a nested run over the frames it
//! pushed.
//!
//! Every handler returns `Result<(), ScriptAbort>`. Contract violations
//! ([`VMError`]) convert into aborts of kind `ContractViolation`, so a
//! malformed program ends the current invocation with a diagnostic instead of
//! panicking. When an abort leaves a frame the frame adds its attribution
//! line and releases what it owns.
//!
//! Handlers are split across submodules:
//! - `memory`: loads and stores through pointers
//! - `math`: integer, float, vector and pointer arithmetic and comparisons
//! - `convert`: casts and dynamic casts
//! - `call`: parameter staging, calls, returns and `THROW`

mod call;
mod config;
mod convert;
mod frame;
mod math;
mod memory;
mod registers;
#[cfg(test)]
mod tests;

pub use config::VmConfig;
pub use frame::Frame;
pub use registers::{FloatConst, FloatReg, IntConst, IntReg, PtrConst, PtrReg, StrConst, StrReg};

use crate::virtual_machine::errors::{AbortKind, ScriptAbort, VMError};
use crate::virtual_machine::function::{Function, FunctionTable, ReturnSlot};
use crate::virtual_machine::host::Host;
use crate::virtual_machine::isa::{Instruction, Word};
use crate::virtual_machine::operand::{CmpFlags, CmpMode};
use crate::virtual_machine::program::Module;
use crate::virtual_machine::value::{FunctionId, Pointer, Value};
use frame::Fetch;
use std::cmp::Ordering;

macro_rules! exec_vm {
    // Entry point
    (
        vm = $vm:ident,
        host = $host:ident,
        word = $word:ident,
        instr = $instr:ident,
        { $( $variant:ident => $handler:ident $args:tt ),* $(,)? }
    ) => {{
        match $instr {
            $(
                Instruction::$variant => {
                    let instr_name = $instr.mnemonic();
                    exec_vm!(@call $vm, $host, $word, instr_name, $handler, $args)
                }
            ),*
        }
    }};

    // Handler that needs the host (semicolon separator)
    (@call $vm:ident, $host:ident, $word:ident, $instr_name:expr, $handler:ident,
        (host; $( $field:ident : $kind:ident ),* $(,)? )
    ) => {{
        $( let $field = $crate::define_instructions!(@decode $word, $field, $kind); )*
        $vm.$handler($instr_name, $host, $( $field ),*)
    }};

    // Handler on the current frame only
    (@call $vm:ident, $host:ident, $word:ident, $instr_name:expr, $handler:ident,
        ( $( $field:ident : $kind:ident ),* $(,)? )
    ) => {{
        $( let $field = $crate::define_instructions!(@decode $word, $field, $kind); )*
        $vm.$handler($instr_name, $( $field ),*)
    }};
}

/// Register-based bytecode interpreter.
pub struct Vm {
    functions: FunctionTable,
    config: VmConfig,
    stack: Vec<Frame>,
    /// Native functions currently running on the host stack.
    native_depth: usize,
    /// Results of the last host-entered frame to return.
    completed: Option<(Vec<ReturnSlot>, usize)>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        Self {
            functions: FunctionTable::new(),
            config,
            stack: Vec::new(),
            native_depth: 0,
            completed: None,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    pub fn functions_mut(&mut self) -> &mut FunctionTable {
        &mut self.functions
    }

    /// Links `module` against the host's classes and installs its functions.
    pub fn load_module(
        &mut self,
        host: &dyn Host,
        module: &Module,
    ) -> Result<Vec<FunctionId>, VMError> {
        self.functions.load_module(module, &host.heap().classes)
    }

    /// Number of script and native frames currently live.
    pub fn depth(&self) -> usize {
        self.stack.len() + self.native_depth
    }

    /// Calls `func` with `args`, filling `results` with whatever it returns.
    ///
    /// Returns how many results the callee produced. Slots it did not supply
    /// keep their previous value. An abort that ends the outermost invocation
    /// is also sent to [`Host::report`] when `report_aborts` is set.
    pub fn call(
        &mut self,
        host: &mut dyn Host,
        func: FunctionId,
        args: &[Value],
        results: &mut [ReturnSlot],
    ) -> Result<usize, ScriptAbort> {
        let top_level = self.depth() == 0;
        let outcome = self.invoke(host, func, args.to_vec(), results);
        if let Err(abort) = &outcome {
            if top_level && self.config.report_aborts {
                host.report(abort);
            }
        }
        outcome
    }

    /// [`Vm::call`] by function name.
    pub fn call_by_name(
        &mut self,
        host: &mut dyn Host,
        name: &str,
        args: &[Value],
        results: &mut [ReturnSlot],
    ) -> Result<usize, ScriptAbort> {
        let func = self
            .functions
            .lookup(name)
            .ok_or_else(|| VMError::UndefinedFunction {
                name: name.to_string(),
            })?;
        self.call(host, func, args, results)
    }

    /// Everything the interpreter keeps alive: constant pools and live frames.
    pub fn gc_roots(&self) -> Vec<Pointer> {
        self.functions
            .gc_roots()
            .chain(self.stack.iter().flat_map(Frame::roots))
            .collect()
    }

    /// Runs the heap's collector with the interpreter's roots plus `extra`.
    pub fn collect_garbage(
        &self,
        host: &mut dyn Host,
        extra: impl IntoIterator<Item = Pointer>,
    ) -> usize {
        let roots: Vec<Pointer> = self.gc_roots().into_iter().chain(extra).collect();
        host.heap_mut().collect(roots)
    }

    fn check_depth(&self) -> Result<(), ScriptAbort> {
        if self.depth() >= self.config.max_call_depth {
            return Err(ScriptAbort::with_detail(
                AbortKind::Other,
                "call stack overflow",
            ));
        }
        Ok(())
    }

    fn invoke(
        &mut self,
        host: &mut dyn Host,
        func: FunctionId,
        args: Vec<Value>,
        results: &mut [ReturnSlot],
    ) -> Result<usize, ScriptAbort> {
        self.check_depth()?;
        match self.functions.get(func)?.clone() {
            Function::Native(native) => self.call_native(host, &native, &args, results),
            Function::Script(script) => {
                let types = results.iter().map(|slot| slot.ty);
                let mut frame = Frame::enter(script, args, types, host.heap_mut())?;
                frame.host_entry = true;

                let base = self.stack.len();
                self.stack.push(frame);
                self.run(host, base)?;

                let (slots, count) = self.completed.take().ok_or(VMError::NoActiveFrame)?;
                for (dst, src) in results.iter_mut().zip(slots) {
                    if src.value.is_some() {
                        dst.value = src.value;
                    }
                }
                Ok(count)
            }
        }
    }

    /// Executes until the stack shrinks back to `base` frames.
    fn run(&mut self, host: &mut dyn Host, base: usize) -> Result<(), ScriptAbort> {
        while self.stack.len() > base {
            if let Err(abort) = self.step(host) {
                return Err(self.unwind(host, base, abort));
            }
        }
        Ok(())
    }

    /// Pops every frame above `base`, attributing the abort to each.
    fn unwind(&mut self, host: &mut dyn Host, base: usize, mut abort: ScriptAbort) -> ScriptAbort {
        while self.stack.len() > base {
            let Some(frame) = self.stack.pop() else {
                break;
            };
            abort = abort.attributed(frame.function.attribution(frame.current));
            frame.release(host.heap_mut());
        }
        abort
    }

    fn step(&mut self, host: &mut dyn Host) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let offset = frame.pc;
        let word = frame.word(offset)?;
        frame.current = offset;
        frame.pc = offset + 1;
        let instruction = word.instruction(offset)?;
        self.exec(host, instruction, word)
    }

    fn frame(&self) -> Result<&Frame, VMError> {
        self.stack.last().ok_or(VMError::NoActiveFrame)
    }

    fn frame_mut(&mut self) -> Result<&mut Frame, VMError> {
        self.stack.last_mut().ok_or(VMError::NoActiveFrame)
    }

    /// Executes a single instruction.
    fn exec(
        &mut self,
        host: &mut dyn Host,
        instruction: Instruction,
        word: Word,
    ) -> Result<(), ScriptAbort> {
        exec_vm! {
            vm = self,
            host = host,
            word = word,
            instr = instruction,
            {
                // Constants and moves
                Nop => op_nop(),
                Li => op_li(a: RI, bc: I16),
                Lk => op_lk(a: RI, bc: KI),
                Lkf => op_lkf(a: RF, bc: KF),
                Lks => op_lks(a: RS, bc: KS),
                Lkp => op_lkp(a: RP, bc: KP),
                LkR => op_lk_r(a: RI, b: RI, c: U8),
                LkfR => op_lkf_r(a: RF, b: RI, c: U8),
                LksR => op_lks_r(a: RS, b: RI, c: U8),
                LkpR => op_lkp_r(a: RP, b: RI, c: U8),
                Lfp => op_lfp(a: RP),
                Clss => op_clss(host; a: RP, b: RP),
                Mov => op_mov(a: RI, b: RI),
                Movf => op_movf(a: RF, b: RF),
                Movs => op_movs(a: RS, b: RS),
                Mova => op_mova(a: RP, b: RP),
                Movv2 => op_movv2(a: RV2, b: RV2),
                Movv3 => op_movv3(a: RV3, b: RV3),
                // Loads
                Lb => op_lb(host; a: RI, b: RP, c: KI),
                LbR => op_lb(host; a: RI, b: RP, c: RI),
                Lh => op_lh(host; a: RI, b: RP, c: KI),
                LhR => op_lh(host; a: RI, b: RP, c: RI),
                Lw => op_lw(host; a: RI, b: RP, c: KI),
                LwR => op_lw(host; a: RI, b: RP, c: RI),
                Lbu => op_lbu(host; a: RI, b: RP, c: KI),
                LbuR => op_lbu(host; a: RI, b: RP, c: RI),
                Lhu => op_lhu(host; a: RI, b: RP, c: KI),
                LhuR => op_lhu(host; a: RI, b: RP, c: RI),
                Lsp => op_lsp(host; a: RF, b: RP, c: KI),
                LspR => op_lsp(host; a: RF, b: RP, c: RI),
                Ldp => op_ldp(host; a: RF, b: RP, c: KI),
                LdpR => op_ldp(host; a: RF, b: RP, c: RI),
                Ls => op_ls(host; a: RS, b: RP, c: KI),
                LsR => op_ls(host; a: RS, b: RP, c: RI),
                Lcs => op_lcs(host; a: RS, b: RP, c: KI),
                LcsR => op_lcs(host; a: RS, b: RP, c: RI),
                Lo => op_lp(host; a: RP, b: RP, c: KI),
                LoR => op_lp(host; a: RP, b: RP, c: RI),
                Lp => op_lp(host; a: RP, b: RP, c: KI),
                LpR => op_lp(host; a: RP, b: RP, c: RI),
                Lv2 => op_lv2(host; a: RV2, b: RP, c: KI),
                Lv2R => op_lv2(host; a: RV2, b: RP, c: RI),
                Lv3 => op_lv3(host; a: RV3, b: RP, c: KI),
                Lv3R => op_lv3(host; a: RV3, b: RP, c: RI),
                Lbit => op_lbit(host; a: RI, b: RP, c: U8),
                // Stores
                Sb => op_sb(host; a: RP, b: RI, c: KI),
                SbR => op_sb(host; a: RP, b: RI, c: RI),
                Sh => op_sh(host; a: RP, b: RI, c: KI),
                ShR => op_sh(host; a: RP, b: RI, c: RI),
                Sw => op_sw(host; a: RP, b: RI, c: KI),
                SwR => op_sw(host; a: RP, b: RI, c: RI),
                Ssp => op_ssp(host; a: RP, b: RF, c: KI),
                SspR => op_ssp(host; a: RP, b: RF, c: RI),
                Sdp => op_sdp(host; a: RP, b: RF, c: KI),
                SdpR => op_sdp(host; a: RP, b: RF, c: RI),
                Ss => op_ss(host; a: RP, b: RS, c: KI),
                SsR => op_ss(host; a: RP, b: RS, c: RI),
                So => op_so(host; a: RP, b: RP, c: KI),
                SoR => op_so(host; a: RP, b: RP, c: RI),
                Sp => op_sp(host; a: RP, b: RP, c: KI),
                SpR => op_sp(host; a: RP, b: RP, c: RI),
                Sv2 => op_sv2(host; a: RP, b: RV2, c: KI),
                Sv2R => op_sv2(host; a: RP, b: RV2, c: RI),
                Sv3 => op_sv3(host; a: RP, b: RV3, c: KI),
                Sv3R => op_sv3(host; a: RP, b: RV3, c: RI),
                Sbit => op_sbit(host; a: RP, b: RI, c: U8),
                // Casts
                Cast => op_cast(host; a: RX, b: RX, c: CK),
                Castb => op_castb(a: RI, b: RX, c: CB),
                DyncastR => op_dyncast(host; a: RP, b: RP, c: RP),
                DyncastK => op_dyncast(host; a: RP, b: RP, c: KP),
                DyncastcR => op_dyncastc(host; a: RP, b: RP, c: RP),
                DyncastcK => op_dyncastc(host; a: RP, b: RP, c: KP),
                // Control flow
                Test => op_test(a: RI, bc: U16),
                Testn => op_testn(a: RI, bc: U16),
                Jmp => op_jmp(abc: I24),
                Ijmp => op_ijmp(a: RI, bc: I16),
                Param => op_param(host; a_bc: TO),
                Parami => op_parami(abc: I24),
                Call => op_call(host; a: RP, b: U8, c: U8),
                CallK => op_call(host; a: KP, b: U8, c: U8),
                Vtbl => op_vtbl(host; a: RP, b: RP, c: U8),
                ResultSlot => op_result(a_b: TO),
                Ret => op_ret(host; a: RET, b_c: TO),
                Reti => op_reti(host; a: RET, bc: I16),
                Throw => op_throw(a: AK, bc: KS),
                Bound => op_bound(a: RI, bc: U16),
                BoundK => op_bound(a: RI, bc: KI),
                BoundR => op_bound(a: RI, b: RI),
                // Strings
                Concat => op_concat(a: RS, b: RS, c: RS),
                Lens => op_lens(a: RI, b: RS),
                Cmps => op_cmps(a: CMP, b: RS, c: RS),
                // Integer arithmetic
                SllRR => op_sll(a: RI, b: RI, c: RI),
                SllRI => op_sll(a: RI, b: RI, c: U8),
                SllKR => op_sll(a: RI, b: KI, c: RI),
                SrlRR => op_srl(a: RI, b: RI, c: RI),
                SrlRI => op_srl(a: RI, b: RI, c: U8),
                SrlKR => op_srl(a: RI, b: KI, c: RI),
                SraRR => op_sra(a: RI, b: RI, c: RI),
                SraRI => op_sra(a: RI, b: RI, c: U8),
                SraKR => op_sra(a: RI, b: KI, c: RI),
                AddRR => op_add(a: RI, b: RI, c: RI),
                AddRK => op_add(a: RI, b: RI, c: KI),
                Addi => op_add(a: RI, b: RI, c: I8),
                SubRR => op_sub(a: RI, b: RI, c: RI),
                SubRK => op_sub(a: RI, b: RI, c: KI),
                SubKR => op_sub(a: RI, b: KI, c: RI),
                MulRR => op_mul(a: RI, b: RI, c: RI),
                MulRK => op_mul(a: RI, b: RI, c: KI),
                DivRR => op_div(a: RI, b: RI, c: RI),
                DivRK => op_div(a: RI, b: RI, c: KI),
                DivKR => op_div(a: RI, b: KI, c: RI),
                DivuRR => op_divu(a: RI, b: RI, c: RI),
                DivuRK => op_divu(a: RI, b: RI, c: KI),
                DivuKR => op_divu(a: RI, b: KI, c: RI),
                ModRR => op_mod(a: RI, b: RI, c: RI),
                ModRK => op_mod(a: RI, b: RI, c: KI),
                ModKR => op_mod(a: RI, b: KI, c: RI),
                ModuRR => op_modu(a: RI, b: RI, c: RI),
                ModuRK => op_modu(a: RI, b: RI, c: KI),
                ModuKR => op_modu(a: RI, b: KI, c: RI),
                AndRR => op_and(a: RI, b: RI, c: RI),
                AndRK => op_and(a: RI, b: RI, c: KI),
                OrRR => op_or(a: RI, b: RI, c: RI),
                OrRK => op_or(a: RI, b: RI, c: KI),
                XorRR => op_xor(a: RI, b: RI, c: RI),
                XorRK => op_xor(a: RI, b: RI, c: KI),
                MinRR => op_min(a: RI, b: RI, c: RI),
                MinRK => op_min(a: RI, b: RI, c: KI),
                MaxRR => op_max(a: RI, b: RI, c: RI),
                MaxRK => op_max(a: RI, b: RI, c: KI),
                MinuRR => op_minu(a: RI, b: RI, c: RI),
                MinuRK => op_minu(a: RI, b: RI, c: KI),
                MaxuRR => op_maxu(a: RI, b: RI, c: RI),
                MaxuRK => op_maxu(a: RI, b: RI, c: KI),
                Abs => op_abs(a: RI, b: RI),
                Neg => op_neg(a: RI, b: RI),
                Not => op_not(a: RI, b: RI),
                Sext => op_sext(a: RI, b: RI, c: U8),
                EqR => op_eq(a: CMP, b: RI, c: RI),
                EqK => op_eq(a: CMP, b: RI, c: KI),
                LtRR => op_lt(a: CMP, b: RI, c: RI),
                LtRK => op_lt(a: CMP, b: RI, c: KI),
                LtKR => op_lt(a: CMP, b: KI, c: RI),
                LeRR => op_le(a: CMP, b: RI, c: RI),
                LeRK => op_le(a: CMP, b: RI, c: KI),
                LeKR => op_le(a: CMP, b: KI, c: RI),
                LtuRR => op_ltu(a: CMP, b: RI, c: RI),
                LtuRK => op_ltu(a: CMP, b: RI, c: KI),
                LtuKR => op_ltu(a: CMP, b: KI, c: RI),
                LeuRR => op_leu(a: CMP, b: RI, c: RI),
                LeuRK => op_leu(a: CMP, b: RI, c: KI),
                LeuKR => op_leu(a: CMP, b: KI, c: RI),
                // Float arithmetic
                AddfRR => op_addf(a: RF, b: RF, c: RF),
                AddfRK => op_addf(a: RF, b: RF, c: KF),
                SubfRR => op_subf(a: RF, b: RF, c: RF),
                SubfRK => op_subf(a: RF, b: RF, c: KF),
                SubfKR => op_subf(a: RF, b: KF, c: RF),
                MulfRR => op_mulf(a: RF, b: RF, c: RF),
                MulfRK => op_mulf(a: RF, b: RF, c: KF),
                DivfRR => op_divf(a: RF, b: RF, c: RF),
                DivfRK => op_divf(a: RF, b: RF, c: KF),
                DivfKR => op_divf(a: RF, b: KF, c: RF),
                ModfRR => op_modf(a: RF, b: RF, c: RF),
                ModfRK => op_modf(a: RF, b: RF, c: KF),
                ModfKR => op_modf(a: RF, b: KF, c: RF),
                PowfRR => op_powf(a: RF, b: RF, c: RF),
                PowfRK => op_powf(a: RF, b: RF, c: KF),
                PowfKR => op_powf(a: RF, b: KF, c: RF),
                MinfRR => op_minf(a: RF, b: RF, c: RF),
                MinfRK => op_minf(a: RF, b: RF, c: KF),
                MaxfRR => op_maxf(a: RF, b: RF, c: RF),
                MaxfRK => op_maxf(a: RF, b: RF, c: KF),
                Atan2 => op_atan2(a: RF, b: RF, c: RF),
                Flop => op_flop(a: RF, b: RF, c: FN),
                EqfR => op_eqf(a: CMP, b: RF, c: RF),
                EqfK => op_eqf(a: CMP, b: RF, c: KF),
                LtfRR => op_ltf(a: CMP, b: RF, c: RF),
                LtfRK => op_ltf(a: CMP, b: RF, c: KF),
                LtfKR => op_ltf(a: CMP, b: KF, c: RF),
                LefRR => op_lef(a: CMP, b: RF, c: RF),
                LefRK => op_lef(a: CMP, b: RF, c: KF),
                LefKR => op_lef(a: CMP, b: KF, c: RF),
                // Vectors
                Negv2 => op_negv2(a: RV2, b: RV2),
                Addv2RR => op_addv2(a: RV2, b: RV2, c: RV2),
                Subv2RR => op_subv2(a: RV2, b: RV2, c: RV2),
                Dotv2RR => op_dotv2(a: RF, b: RV2, c: RV2),
                Mulvf2RR => op_mulvf2(a: RV2, b: RV2, c: RF),
                Mulvf2RK => op_mulvf2(a: RV2, b: RV2, c: KF),
                Divvf2RR => op_divvf2(a: RV2, b: RV2, c: RF),
                Divvf2RK => op_divvf2(a: RV2, b: RV2, c: KF),
                Lenv2 => op_lenv2(a: RF, b: RV2),
                Eqv2R => op_eqv2(a: CMP, b: RV2, c: RV2),
                Eqv2K => op_eqv2(a: CMP, b: RV2, c: KF),
                Negv3 => op_negv3(a: RV3, b: RV3),
                Addv3RR => op_addv3(a: RV3, b: RV3, c: RV3),
                Subv3RR => op_subv3(a: RV3, b: RV3, c: RV3),
                Dotv3RR => op_dotv3(a: RF, b: RV3, c: RV3),
                CrossvRR => op_crossv(a: RV3, b: RV3, c: RV3),
                Mulvf3RR => op_mulvf3(a: RV3, b: RV3, c: RF),
                Mulvf3RK => op_mulvf3(a: RV3, b: RV3, c: KF),
                Divvf3RR => op_divvf3(a: RV3, b: RV3, c: RF),
                Divvf3RK => op_divvf3(a: RV3, b: RV3, c: KF),
                Lenv3 => op_lenv3(a: RF, b: RV3),
                Eqv3R => op_eqv3(a: CMP, b: RV3, c: RV3),
                Eqv3K => op_eqv3(a: CMP, b: RV3, c: KF),
                // Pointers
                AddaRR => op_adda(host; a: RP, b: RP, c: RI),
                AddaRK => op_adda(host; a: RP, b: RP, c: KI),
                Suba => op_suba(host; a: RI, b: RP, c: RP),
                EqaR => op_eqa(a: CMP, b: RP, c: RP),
                EqaK => op_eqa(a: CMP, b: RP, c: KP),
            }
        }
    }

    // =========================
    // Constants and moves
    // =========================

    fn op_nop(&mut self, _instr: &'static str) -> Result<(), ScriptAbort> {
        Ok(())
    }

    fn op_li(&mut self, _instr: &'static str, a: IntReg, imm: i16) -> Result<(), ScriptAbort> {
        self.frame_mut()?.regs.set_int(a, imm as i32)?;
        Ok(())
    }

    fn op_lk(&mut self, _instr: &'static str, a: IntReg, k: IntConst) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let v = k.fetch(frame)?;
        frame.regs.set_int(a, v)?;
        Ok(())
    }

    fn op_lkf(&mut self, _instr: &'static str, a: FloatReg, k: FloatConst) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let v = k.fetch(frame)?;
        frame.regs.set_float(a, v)?;
        Ok(())
    }

    fn op_lks(&mut self, _instr: &'static str, a: StrReg, k: StrConst) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let v = k.fetch(frame)?;
        frame.regs.set_string(a, v)?;
        Ok(())
    }

    fn op_lkp(&mut self, _instr: &'static str, a: PtrReg, k: PtrConst) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let v = k.fetch(frame)?;
        frame.regs.set_pointer(a, v)?;
        Ok(())
    }

    /// Pool index `dB + C`, for the register-indexed constant loads.
    fn konst_index(frame: &Frame, pool: &'static str, b: IntReg, c: u8) -> Result<u16, VMError> {
        let index = frame.regs.int(b)? as i64 + c as i64;
        u16::try_from(index).map_err(|_| VMError::ConstantOutOfRange {
            pool,
            index: index.max(0) as usize,
            available: 0,
        })
    }

    fn op_lk_r(&mut self, _instr: &'static str, a: IntReg, b: IntReg, c: u8) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let v = IntConst(Self::konst_index(frame, "int", b, c)?).fetch(frame)?;
        frame.regs.set_int(a, v)?;
        Ok(())
    }

    fn op_lkf_r(&mut self, _instr: &'static str, a: FloatReg, b: IntReg, c: u8) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let v = FloatConst(Self::konst_index(frame, "float", b, c)?).fetch(frame)?;
        frame.regs.set_float(a, v)?;
        Ok(())
    }

    fn op_lks_r(&mut self, _instr: &'static str, a: StrReg, b: IntReg, c: u8) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let v = StrConst(Self::konst_index(frame, "string", b, c)?).fetch(frame)?;
        frame.regs.set_string(a, v)?;
        Ok(())
    }

    fn op_lkp_r(&mut self, _instr: &'static str, a: PtrReg, b: IntReg, c: u8) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let v = PtrConst(Self::konst_index(frame, "pointer", b, c)?).fetch(frame)?;
        frame.regs.set_pointer(a, v)?;
        Ok(())
    }

    fn op_lfp(&mut self, _instr: &'static str, a: PtrReg) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let extra = frame.extra_pointer();
        frame.regs.set_pointer(a, extra)?;
        Ok(())
    }

    fn op_clss(
        &mut self,
        _instr: &'static str,
        host: &mut dyn Host,
        a: PtrReg,
        b: PtrReg,
    ) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let class = match frame.regs.pointer(b)? {
            Pointer::Null => return Err(ScriptAbort::new(AbortKind::ReadNil)),
            Pointer::Object(obj) => host.heap().object_class(obj)?,
            other => {
                return Err(VMError::NotAnObject {
                    pointer: other.to_string(),
                }
                .into());
            }
        };
        frame.regs.set_pointer(a, Pointer::Class(class))?;
        Ok(())
    }

    fn op_mov(&mut self, _instr: &'static str, a: IntReg, b: IntReg) -> Result<(), ScriptAbort> {
        let regs = &mut self.frame_mut()?.regs;
        let v = regs.int(b)?;
        regs.set_int(a, v)?;
        Ok(())
    }

    fn op_movf(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg) -> Result<(), ScriptAbort> {
        let regs = &mut self.frame_mut()?.regs;
        let v = regs.float(b)?;
        regs.set_float(a, v)?;
        Ok(())
    }

    fn op_movs(&mut self, _instr: &'static str, a: StrReg, b: StrReg) -> Result<(), ScriptAbort> {
        let regs = &mut self.frame_mut()?.regs;
        let v = regs.string(b)?.to_string();
        regs.set_string(a, v)?;
        Ok(())
    }

    fn op_mova(&mut self, _instr: &'static str, a: PtrReg, b: PtrReg) -> Result<(), ScriptAbort> {
        let regs = &mut self.frame_mut()?.regs;
        let v = regs.pointer(b)?;
        regs.set_pointer(a, v)?;
        Ok(())
    }

    fn op_movv2(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg) -> Result<(), ScriptAbort> {
        let regs = &mut self.frame_mut()?.regs;
        let v = regs.vector::<2>(b)?;
        regs.set_vector(a, v)?;
        Ok(())
    }

    fn op_movv3(&mut self, _instr: &'static str, a: FloatReg, b: FloatReg) -> Result<(), ScriptAbort> {
        let regs = &mut self.frame_mut()?.regs;
        let v = regs.vector::<3>(b)?;
        regs.set_vector(a, v)?;
        Ok(())
    }

    // =========================
    // Control flow
    // =========================

    /// Skips the `JMP` after a compare or test unless `outcome` matches `check`.
    fn branch(&mut self, instr: &'static str, outcome: bool, check: bool) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let next = frame.pc;
        let is_jump = frame
            .word(next)
            .is_ok_and(|w| w.op() == Instruction::Jmp as u8);
        if !is_jump {
            return Err(VMError::ExpectedJump {
                instruction: instr,
                offset: next,
            }
            .into());
        }
        if outcome != check {
            frame.pc = next + 1;
        }
        Ok(())
    }

    fn op_test(&mut self, instr: &'static str, a: IntReg, bc: u16) -> Result<(), ScriptAbort> {
        let v = self.frame()?.regs.int(a)?;
        self.branch(instr, v == bc as i32, true)
    }

    fn op_testn(&mut self, instr: &'static str, a: IntReg, bc: u16) -> Result<(), ScriptAbort> {
        let v = self.frame()?.regs.int(a)?;
        self.branch(instr, v.wrapping_neg() == bc as i32, true)
    }

    fn op_jmp(&mut self, _instr: &'static str, offset: i32) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        frame.jump_from(frame.pc, offset as i64)?;
        Ok(())
    }

    /// Jump table: entry `dA` of the `JMP` list starting `bc` words after
    /// the next instruction.
    fn op_ijmp(&mut self, instr: &'static str, a: IntReg, bc: i16) -> Result<(), ScriptAbort> {
        let frame = self.frame_mut()?;
        let slot = frame.pc as i64 + bc as i64 + frame.regs.int(a)? as i64;
        let not_a_jump = VMError::ExpectedJump {
            instruction: instr,
            offset: slot.max(0) as usize,
        };
        let word = usize::try_from(slot)
            .ok()
            .and_then(|s| frame.word(s).ok())
            .ok_or_else(|| not_a_jump.clone())?;
        if word.op() != Instruction::Jmp as u8 {
            return Err(not_a_jump.into());
        }
        frame.jump_from(slot as usize + 1, word.abc() as i64)?;
        Ok(())
    }

    /// Aborts unless `0 <= dA < limit`.
    fn op_bound<L: Fetch<i32>>(&mut self, _instr: &'static str, a: IntReg, limit: L) -> Result<(), ScriptAbort> {
        let frame = self.frame()?;
        let index = frame.regs.int(a)?;
        let limit = limit.fetch(frame)?;
        if index < 0 {
            return Err(ScriptAbort::with_detail(
                AbortKind::NegativeIndex,
                format!("index = {index}"),
            ));
        }
        if index >= limit {
            return Err(ScriptAbort::with_detail(
                AbortKind::IndexOutOfBounds,
                format!("max index = {}, current index = {index}", limit as i64 - 1),
            ));
        }
        Ok(())
    }

    // =========================
    // Strings
    // =========================

    fn op_concat(&mut self, _instr: &'static str, a: StrReg, b: StrReg, c: StrReg) -> Result<(), ScriptAbort> {
        let regs = &mut self.frame_mut()?.regs;
        let joined = format!("{}{}", regs.string(b)?, regs.string(c)?);
        regs.set_string(a, joined)?;
        Ok(())
    }

    fn op_lens(&mut self, _instr: &'static str, a: IntReg, b: StrReg) -> Result<(), ScriptAbort> {
        let regs = &mut self.frame_mut()?.regs;
        let len = regs.string(b)?.len() as i32;
        regs.set_int(a, len)?;
        Ok(())
    }

    /// String compare; approximate mode ignores ASCII case.
    fn op_cmps(
        &mut self,
        instr: &'static str,
        flags: CmpFlags,
        b: StrReg,
        c: StrReg,
    ) -> Result<(), ScriptAbort> {
        let regs = &self.frame()?.regs;
        let (lhs, rhs) = (regs.string(b)?, regs.string(c)?);
        let order = if flags.approx() {
            lhs.to_ascii_lowercase().cmp(&rhs.to_ascii_lowercase())
        } else {
            lhs.cmp(rhs)
        };
        let outcome = match flags.mode()? {
            CmpMode::Eq => order == Ordering::Equal,
            CmpMode::Lt => order == Ordering::Less,
            CmpMode::Le => order != Ordering::Greater,
        };
        self.branch(instr, outcome, flags.check())
    }
}
