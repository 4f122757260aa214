//! Instruction Set Architecture (ISA) definitions.
//!
//! Defines the VM's instruction set. The [`for_each_instruction!`](crate::for_each_instruction) macro holds
//! the canonical instruction definitions and invokes a callback macro for code
//! generation. This enables multiple modules to generate instruction-related
//! code without duplicating definitions.
//!
//! This module generates:
//! - The [`Instruction`] enum with opcode mappings
//! - `TryFrom<u8>` for decoding opcodes
//! - [`Instruction::mnemonic`] and [`Instruction::from_mnemonic`]
//!
//! See [`assembler`](super::assembler) for parsing and encoding, and the
//! dispatcher in [`vm`](super::vm) for operand decoding.
//!
//! # Bytecode Format
//!
//! Every instruction is one little-endian 32-bit [`Word`]:
//!
//! ```text
//!  31      24 23      16 15       8 7        0
//! +----------+----------+----------+----------+
//! |    C     |    B     |    A     |    op    |
//! +----------+----------+----------+----------+
//! |         BC          |
//! |              ABC (signed)      |
//! ```
//!
//! Each operand in the table names the field it lives in (`a`, `b`, `c`,
//! `bc`, `abc`) and its kind. Typed operands (`TO`) occupy two fields: a
//! register type tag and an index (`a_bc`, `a_b`, `b_c`).
//!
//! # Operand kinds
//!
//! | Kind | Meaning |
//! |------|---------|
//! | `RI` `RF` `RS` `RP` | int / float / string / pointer register |
//! | `RV2` `RV3` | first of 2 or 3 consecutive float registers |
//! | `RX` | register of any bank, chosen by another operand |
//! | `KI` `KF` `KS` `KP` | int / float / string / pointer constant |
//! | `U8` `I8` `U16` `I16` `I24` | immediates |
//! | `TO` | register type tag plus register or constant index |
//! | `RET` | return slot with final bit |
//! | `CK` `CB` `FN` `AK` `CMP` | cast, bool cast, float function, abort kind, compare flags |

use crate::virtual_machine::errors::VMError;

/// Invokes a callback macro with the complete instruction definition list.
///
/// This macro enables code generation for instructions in multiple modules
/// without duplicating the instruction definitions.
#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Constants and moves
            // =========================
            /// NOP ; does nothing
            Nop = 0x00, "NOP" => [],
            /// LI dA, imm16 ; dA = imm16
            Li = 0x01, "LI" => [a: RI, bc: I16],
            /// LK dA, k ; dA = konst[k], 16-bit pool index
            Lk = 0x02, "LK" => [a: RI, bc: KI],
            /// LKF fA, k ; fA = konst[k]
            Lkf = 0x03, "LKF" => [a: RF, bc: KF],
            /// LKS sA, k ; sA = konst[k]
            Lks = 0x04, "LKS" => [a: RS, bc: KS],
            /// LKP aA, k ; aA = konst[k]
            Lkp = 0x05, "LKP" => [a: RP, bc: KP],
            /// LK_R dA, dB, C ; dA = konst[dB + C]
            LkR = 0x06, "LK_R" => [a: RI, b: RI, c: U8],
            /// LKF_R fA, dB, C ; fA = konst[dB + C]
            LkfR = 0x07, "LKF_R" => [a: RF, b: RI, c: U8],
            /// LKS_R sA, dB, C ; sA = konst[dB + C]
            LksR = 0x08, "LKS_R" => [a: RS, b: RI, c: U8],
            /// LKP_R aA, dB, C ; aA = konst[dB + C]
            LkpR = 0x09, "LKP_R" => [a: RP, b: RI, c: U8],
            /// LFP aA ; aA = address of the frame's extra space
            Lfp = 0x0A, "LFP" => [a: RP],
            /// CLSS aA, aB ; aA = runtime class of object aB
            Clss = 0x0B, "CLSS" => [a: RP, b: RP],
            /// MOV dA, dB ; dA = dB
            Mov = 0x0C, "MOV" => [a: RI, b: RI],
            /// MOVF fA, fB ; fA = fB
            Movf = 0x0D, "MOVF" => [a: RF, b: RF],
            /// MOVS sA, sB ; sA = sB (copy)
            Movs = 0x0E, "MOVS" => [a: RS, b: RS],
            /// MOVA aA, aB ; aA = aB
            Mova = 0x0F, "MOVA" => [a: RP, b: RP],
            /// MOVV2 fA, fB ; fA..fA+1 = fB..fB+1
            Movv2 = 0x10, "MOVV2" => [a: RV2, b: RV2],
            /// MOVV3 fA, fB ; fA..fA+2 = fB..fB+2
            Movv3 = 0x11, "MOVV3" => [a: RV3, b: RV3],
            // =========================
            // Memory loads: A = *(B + C)
            // =========================
            /// LB dA, aB, k ; signed byte
            Lb = 0x18, "LB" => [a: RI, b: RP, c: KI],
            /// LB_R dA, aB, dC
            LbR = 0x19, "LB_R" => [a: RI, b: RP, c: RI],
            /// LH dA, aB, k ; signed 16-bit
            Lh = 0x1A, "LH" => [a: RI, b: RP, c: KI],
            /// LH_R dA, aB, dC
            LhR = 0x1B, "LH_R" => [a: RI, b: RP, c: RI],
            /// LW dA, aB, k ; 32-bit
            Lw = 0x1C, "LW" => [a: RI, b: RP, c: KI],
            /// LW_R dA, aB, dC
            LwR = 0x1D, "LW_R" => [a: RI, b: RP, c: RI],
            /// LBU dA, aB, k ; unsigned byte
            Lbu = 0x1E, "LBU" => [a: RI, b: RP, c: KI],
            /// LBU_R dA, aB, dC
            LbuR = 0x1F, "LBU_R" => [a: RI, b: RP, c: RI],
            /// LHU dA, aB, k ; unsigned 16-bit
            Lhu = 0x20, "LHU" => [a: RI, b: RP, c: KI],
            /// LHU_R dA, aB, dC
            LhuR = 0x21, "LHU_R" => [a: RI, b: RP, c: RI],
            /// LSP fA, aB, k ; single precision, widened
            Lsp = 0x22, "LSP" => [a: RF, b: RP, c: KI],
            /// LSP_R fA, aB, dC
            LspR = 0x23, "LSP_R" => [a: RF, b: RP, c: RI],
            /// LDP fA, aB, k ; double precision
            Ldp = 0x24, "LDP" => [a: RF, b: RP, c: KI],
            /// LDP_R fA, aB, dC
            LdpR = 0x25, "LDP_R" => [a: RF, b: RP, c: RI],
            /// LS sA, aB, k ; string by value
            Ls = 0x26, "LS" => [a: RS, b: RP, c: KI],
            /// LS_R sA, aB, dC
            LsR = 0x27, "LS_R" => [a: RS, b: RP, c: RI],
            /// LCS sA, aB, k ; NUL-terminated string through a stored pointer
            Lcs = 0x28, "LCS" => [a: RS, b: RP, c: KI],
            /// LCS_R sA, aB, dC
            LcsR = 0x29, "LCS_R" => [a: RS, b: RP, c: RI],
            /// LO aA, aB, k ; managed object pointer
            Lo = 0x2A, "LO" => [a: RP, b: RP, c: KI],
            /// LO_R aA, aB, dC
            LoR = 0x2B, "LO_R" => [a: RP, b: RP, c: RI],
            /// LP aA, aB, k ; raw pointer
            Lp = 0x2C, "LP" => [a: RP, b: RP, c: KI],
            /// LP_R aA, aB, dC
            LpR = 0x2D, "LP_R" => [a: RP, b: RP, c: RI],
            /// LV2 fA, aB, k ; two doubles
            Lv2 = 0x2E, "LV2" => [a: RV2, b: RP, c: KI],
            /// LV2_R fA, aB, dC
            Lv2R = 0x2F, "LV2_R" => [a: RV2, b: RP, c: RI],
            /// LV3 fA, aB, k ; three doubles
            Lv3 = 0x30, "LV3" => [a: RV3, b: RP, c: KI],
            /// LV3_R fA, aB, dC
            Lv3R = 0x31, "LV3_R" => [a: RV3, b: RP, c: RI],
            /// LBIT dA, aB, mask ; dA = (*(u8*)aB & mask) != 0
            Lbit = 0x32, "LBIT" => [a: RI, b: RP, c: U8],
            // =========================
            // Memory stores: *(A + C) = B
            // =========================
            /// SB aA, dB, k ; byte
            Sb = 0x38, "SB" => [a: RP, b: RI, c: KI],
            /// SB_R aA, dB, dC
            SbR = 0x39, "SB_R" => [a: RP, b: RI, c: RI],
            /// SH aA, dB, k ; 16-bit
            Sh = 0x3A, "SH" => [a: RP, b: RI, c: KI],
            /// SH_R aA, dB, dC
            ShR = 0x3B, "SH_R" => [a: RP, b: RI, c: RI],
            /// SW aA, dB, k ; 32-bit
            Sw = 0x3C, "SW" => [a: RP, b: RI, c: KI],
            /// SW_R aA, dB, dC
            SwR = 0x3D, "SW_R" => [a: RP, b: RI, c: RI],
            /// SSP aA, fB, k ; single precision, narrowed
            Ssp = 0x3E, "SSP" => [a: RP, b: RF, c: KI],
            /// SSP_R aA, fB, dC
            SspR = 0x3F, "SSP_R" => [a: RP, b: RF, c: RI],
            /// SDP aA, fB, k ; double precision
            Sdp = 0x40, "SDP" => [a: RP, b: RF, c: KI],
            /// SDP_R aA, fB, dC
            SdpR = 0x41, "SDP_R" => [a: RP, b: RF, c: RI],
            /// SS aA, sB, k ; string by value
            Ss = 0x42, "SS" => [a: RP, b: RS, c: KI],
            /// SS_R aA, sB, dC
            SsR = 0x43, "SS_R" => [a: RP, b: RS, c: RI],
            /// SO aA, aB, k ; managed object pointer, with write barrier
            So = 0x44, "SO" => [a: RP, b: RP, c: KI],
            /// SO_R aA, aB, dC
            SoR = 0x45, "SO_R" => [a: RP, b: RP, c: RI],
            /// SP aA, aB, k ; raw pointer, no barrier
            Sp = 0x46, "SP" => [a: RP, b: RP, c: KI],
            /// SP_R aA, aB, dC
            SpR = 0x47, "SP_R" => [a: RP, b: RP, c: RI],
            /// SV2 aA, fB, k ; two doubles
            Sv2 = 0x48, "SV2" => [a: RP, b: RV2, c: KI],
            /// SV2_R aA, fB, dC
            Sv2R = 0x49, "SV2_R" => [a: RP, b: RV2, c: RI],
            /// SV3 aA, fB, k ; three doubles
            Sv3 = 0x4A, "SV3" => [a: RP, b: RV3, c: KI],
            /// SV3_R aA, fB, dC
            Sv3R = 0x4B, "SV3_R" => [a: RP, b: RV3, c: RI],
            /// SBIT aA, dB, mask ; set mask bits if dB != 0, else clear them
            Sbit = 0x4C, "SBIT" => [a: RP, b: RI, c: U8],
            // =========================
            // Casts
            // =========================
            /// CAST xA, xB, kind ; banks of A and B depend on kind
            Cast = 0x50, "CAST" => [a: RX, b: RX, c: CK],
            /// CASTB dA, xB, kind ; dA = xB as bool
            Castb = 0x51, "CASTB" => [a: RI, b: RX, c: CB],
            /// DYNCAST_R aA, aB, aC ; aA = aB if its class descends from class aC, else null
            DyncastR = 0x52, "DYNCAST_R" => [a: RP, b: RP, c: RP],
            /// DYNCAST_K aA, aB, k
            DyncastK = 0x53, "DYNCAST_K" => [a: RP, b: RP, c: KP],
            /// DYNCASTC_R aA, aB, aC ; aA = aB if class aB descends from class aC, else null
            DyncastcR = 0x54, "DYNCASTC_R" => [a: RP, b: RP, c: RP],
            /// DYNCASTC_K aA, aB, k
            DyncastcK = 0x55, "DYNCASTC_K" => [a: RP, b: RP, c: KP],
            // =========================
            // Control flow and calls
            // =========================
            /// TEST dA, BC ; skip the next JMP if dA != BC
            Test = 0x58, "TEST" => [a: RI, bc: U16],
            /// TESTN dA, BC ; skip the next JMP if -dA != BC
            Testn = 0x59, "TESTN" => [a: RI, bc: U16],
            /// JMP offset ; pc += offset, relative to the next instruction
            Jmp = 0x5A, "JMP" => [abc: I24],
            /// IJMP dA, BC ; follow the JMP at pc + BC + dA
            Ijmp = 0x5B, "IJMP" => [a: RI, bc: I16],
            /// PARAM x ; stage a register, constant, vector or reference
            Param = 0x5C, "PARAM" => [a_bc: TO],
            /// PARAMI imm24 ; stage an integer immediate
            Parami = 0x5D, "PARAMI" => [abc: I24],
            /// CALL aA, params, results ; call the function in aA
            Call = 0x5E, "CALL" => [a: RP, b: U8, c: U8],
            /// CALL_K k, params, results ; call the function constant k
            CallK = 0x5F, "CALL_K" => [a: KP, b: U8, c: U8],
            /// VTBL aA, aB, slot ; aA = virtual function `slot` of object aB
            Vtbl = 0x60, "VTBL" => [a: RP, b: RP, c: U8],
            /// RESULT x ; return-slot marker following a call, never executed
            ResultSlot = 0x61, "RESULT" => [a_b: TO],
            /// RET slot[!], x ; write x to return slot, `!` ends the frame
            Ret = 0x62, "RET" => [a: RET, b_c: TO],
            /// RETI slot[!], imm16 ; return an integer immediate
            Reti = 0x63, "RETI" => [a: RET, bc: I16],
            /// THROW kind, k ; abort with kind and message konst[k]
            Throw = 0x64, "THROW" => [a: AK, bc: KS],
            /// BOUND dA, BC ; abort unless 0 <= dA < BC
            Bound = 0x65, "BOUND" => [a: RI, bc: U16],
            /// BOUND_K dA, k ; abort unless 0 <= dA < konst[k]
            BoundK = 0x66, "BOUND_K" => [a: RI, bc: KI],
            /// BOUND_R dA, dB ; abort unless 0 <= dA < dB
            BoundR = 0x67, "BOUND_R" => [a: RI, b: RI],
            // =========================
            // Strings
            // =========================
            /// CONCAT sA, sB, sC ; sA = sB + sC
            Concat = 0x68, "CONCAT" => [a: RS, b: RS, c: RS],
            /// LENS dA, sB ; dA = byte length of sB
            Lens = 0x69, "LENS" => [a: RI, b: RS],
            /// CMPS flags, sB, sC ; compare strings and skip the next JMP on mismatch
            Cmps = 0x6A, "CMPS" => [a: CMP, b: RS, c: RS],
            // =========================
            // Integer arithmetic
            // =========================
            /// SLL_RR dA, dB, dC ; dA = dB << dC
            SllRR = 0x70, "SLL_RR" => [a: RI, b: RI, c: RI],
            /// SLL_RI dA, dB, C
            SllRI = 0x71, "SLL_RI" => [a: RI, b: RI, c: U8],
            /// SLL_KR dA, k, dC
            SllKR = 0x72, "SLL_KR" => [a: RI, b: KI, c: RI],
            /// SRL_RR dA, dB, dC ; logical shift right
            SrlRR = 0x73, "SRL_RR" => [a: RI, b: RI, c: RI],
            /// SRL_RI dA, dB, C
            SrlRI = 0x74, "SRL_RI" => [a: RI, b: RI, c: U8],
            /// SRL_KR dA, k, dC
            SrlKR = 0x75, "SRL_KR" => [a: RI, b: KI, c: RI],
            /// SRA_RR dA, dB, dC ; arithmetic shift right
            SraRR = 0x76, "SRA_RR" => [a: RI, b: RI, c: RI],
            /// SRA_RI dA, dB, C
            SraRI = 0x77, "SRA_RI" => [a: RI, b: RI, c: U8],
            /// SRA_KR dA, k, dC
            SraKR = 0x78, "SRA_KR" => [a: RI, b: KI, c: RI],
            /// ADD_RR dA, dB, dC ; dA = dB + dC
            AddRR = 0x79, "ADD_RR" => [a: RI, b: RI, c: RI],
            /// ADD_RK dA, dB, k
            AddRK = 0x7A, "ADD_RK" => [a: RI, b: RI, c: KI],
            /// ADDI dA, dB, imm8
            Addi = 0x7B, "ADDI" => [a: RI, b: RI, c: I8],
            /// SUB_RR dA, dB, dC ; dA = dB - dC
            SubRR = 0x7C, "SUB_RR" => [a: RI, b: RI, c: RI],
            /// SUB_RK dA, dB, k
            SubRK = 0x7D, "SUB_RK" => [a: RI, b: RI, c: KI],
            /// SUB_KR dA, k, dC
            SubKR = 0x7E, "SUB_KR" => [a: RI, b: KI, c: RI],
            /// MUL_RR dA, dB, dC ; dA = dB * dC
            MulRR = 0x7F, "MUL_RR" => [a: RI, b: RI, c: RI],
            /// MUL_RK dA, dB, k
            MulRK = 0x80, "MUL_RK" => [a: RI, b: RI, c: KI],
            /// DIV_RR dA, dB, dC ; signed, aborts on zero
            DivRR = 0x81, "DIV_RR" => [a: RI, b: RI, c: RI],
            /// DIV_RK dA, dB, k
            DivRK = 0x82, "DIV_RK" => [a: RI, b: RI, c: KI],
            /// DIV_KR dA, k, dC
            DivKR = 0x83, "DIV_KR" => [a: RI, b: KI, c: RI],
            /// DIVU_RR dA, dB, dC ; unsigned, aborts on zero
            DivuRR = 0x84, "DIVU_RR" => [a: RI, b: RI, c: RI],
            /// DIVU_RK dA, dB, k
            DivuRK = 0x85, "DIVU_RK" => [a: RI, b: RI, c: KI],
            /// DIVU_KR dA, k, dC
            DivuKR = 0x86, "DIVU_KR" => [a: RI, b: KI, c: RI],
            /// MOD_RR dA, dB, dC ; signed remainder, aborts on zero
            ModRR = 0x87, "MOD_RR" => [a: RI, b: RI, c: RI],
            /// MOD_RK dA, dB, k
            ModRK = 0x88, "MOD_RK" => [a: RI, b: RI, c: KI],
            /// MOD_KR dA, k, dC
            ModKR = 0x89, "MOD_KR" => [a: RI, b: KI, c: RI],
            /// MODU_RR dA, dB, dC ; unsigned remainder, aborts on zero
            ModuRR = 0x8A, "MODU_RR" => [a: RI, b: RI, c: RI],
            /// MODU_RK dA, dB, k
            ModuRK = 0x8B, "MODU_RK" => [a: RI, b: RI, c: KI],
            /// MODU_KR dA, k, dC
            ModuKR = 0x8C, "MODU_KR" => [a: RI, b: KI, c: RI],
            /// AND_RR dA, dB, dC
            AndRR = 0x8D, "AND_RR" => [a: RI, b: RI, c: RI],
            /// AND_RK dA, dB, k
            AndRK = 0x8E, "AND_RK" => [a: RI, b: RI, c: KI],
            /// OR_RR dA, dB, dC
            OrRR = 0x8F, "OR_RR" => [a: RI, b: RI, c: RI],
            /// OR_RK dA, dB, k
            OrRK = 0x90, "OR_RK" => [a: RI, b: RI, c: KI],
            /// XOR_RR dA, dB, dC
            XorRR = 0x91, "XOR_RR" => [a: RI, b: RI, c: RI],
            /// XOR_RK dA, dB, k
            XorRK = 0x92, "XOR_RK" => [a: RI, b: RI, c: KI],
            /// MIN_RR dA, dB, dC ; signed
            MinRR = 0x93, "MIN_RR" => [a: RI, b: RI, c: RI],
            /// MIN_RK dA, dB, k
            MinRK = 0x94, "MIN_RK" => [a: RI, b: RI, c: KI],
            /// MAX_RR dA, dB, dC ; signed
            MaxRR = 0x95, "MAX_RR" => [a: RI, b: RI, c: RI],
            /// MAX_RK dA, dB, k
            MaxRK = 0x96, "MAX_RK" => [a: RI, b: RI, c: KI],
            /// MINU_RR dA, dB, dC ; unsigned
            MinuRR = 0x97, "MINU_RR" => [a: RI, b: RI, c: RI],
            /// MINU_RK dA, dB, k
            MinuRK = 0x98, "MINU_RK" => [a: RI, b: RI, c: KI],
            /// MAXU_RR dA, dB, dC ; unsigned
            MaxuRR = 0x99, "MAXU_RR" => [a: RI, b: RI, c: RI],
            /// MAXU_RK dA, dB, k
            MaxuRK = 0x9A, "MAXU_RK" => [a: RI, b: RI, c: KI],
            /// ABS dA, dB
            Abs = 0x9B, "ABS" => [a: RI, b: RI],
            /// NEG dA, dB
            Neg = 0x9C, "NEG" => [a: RI, b: RI],
            /// NOT dA, dB ; bitwise complement
            Not = 0x9D, "NOT" => [a: RI, b: RI],
            /// SEXT dA, dB, bits ; sign-extend the low `bits` bits of dB
            Sext = 0x9E, "SEXT" => [a: RI, b: RI, c: U8],
            /// EQ_R flags, dB, dC ; skip the next JMP unless (dB == dC) == check
            EqR = 0x9F, "EQ_R" => [a: CMP, b: RI, c: RI],
            /// EQ_K flags, dB, k
            EqK = 0xA0, "EQ_K" => [a: CMP, b: RI, c: KI],
            /// LT_RR flags, dB, dC ; signed <
            LtRR = 0xA1, "LT_RR" => [a: CMP, b: RI, c: RI],
            /// LT_RK flags, dB, k
            LtRK = 0xA2, "LT_RK" => [a: CMP, b: RI, c: KI],
            /// LT_KR flags, k, dC
            LtKR = 0xA3, "LT_KR" => [a: CMP, b: KI, c: RI],
            /// LE_RR flags, dB, dC ; signed <=
            LeRR = 0xA4, "LE_RR" => [a: CMP, b: RI, c: RI],
            /// LE_RK flags, dB, k
            LeRK = 0xA5, "LE_RK" => [a: CMP, b: RI, c: KI],
            /// LE_KR flags, k, dC
            LeKR = 0xA6, "LE_KR" => [a: CMP, b: KI, c: RI],
            /// LTU_RR flags, dB, dC ; unsigned <
            LtuRR = 0xA7, "LTU_RR" => [a: CMP, b: RI, c: RI],
            /// LTU_RK flags, dB, k
            LtuRK = 0xA8, "LTU_RK" => [a: CMP, b: RI, c: KI],
            /// LTU_KR flags, k, dC
            LtuKR = 0xA9, "LTU_KR" => [a: CMP, b: KI, c: RI],
            /// LEU_RR flags, dB, dC ; unsigned <=
            LeuRR = 0xAA, "LEU_RR" => [a: CMP, b: RI, c: RI],
            /// LEU_RK flags, dB, k
            LeuRK = 0xAB, "LEU_RK" => [a: CMP, b: RI, c: KI],
            /// LEU_KR flags, k, dC
            LeuKR = 0xAC, "LEU_KR" => [a: CMP, b: KI, c: RI],
            // =========================
            // Float arithmetic
            // =========================
            /// ADDF_RR fA, fB, fC
            AddfRR = 0xB0, "ADDF_RR" => [a: RF, b: RF, c: RF],
            /// ADDF_RK fA, fB, k
            AddfRK = 0xB1, "ADDF_RK" => [a: RF, b: RF, c: KF],
            /// SUBF_RR fA, fB, fC
            SubfRR = 0xB2, "SUBF_RR" => [a: RF, b: RF, c: RF],
            /// SUBF_RK fA, fB, k
            SubfRK = 0xB3, "SUBF_RK" => [a: RF, b: RF, c: KF],
            /// SUBF_KR fA, k, fC
            SubfKR = 0xB4, "SUBF_KR" => [a: RF, b: KF, c: RF],
            /// MULF_RR fA, fB, fC
            MulfRR = 0xB5, "MULF_RR" => [a: RF, b: RF, c: RF],
            /// MULF_RK fA, fB, k
            MulfRK = 0xB6, "MULF_RK" => [a: RF, b: RF, c: KF],
            /// DIVF_RR fA, fB, fC ; aborts on zero
            DivfRR = 0xB7, "DIVF_RR" => [a: RF, b: RF, c: RF],
            /// DIVF_RK fA, fB, k
            DivfRK = 0xB8, "DIVF_RK" => [a: RF, b: RF, c: KF],
            /// DIVF_KR fA, k, fC
            DivfKR = 0xB9, "DIVF_KR" => [a: RF, b: KF, c: RF],
            /// MODF_RR fA, fB, fC ; fB - floor(fB / fC) * fC, aborts on zero
            ModfRR = 0xBA, "MODF_RR" => [a: RF, b: RF, c: RF],
            /// MODF_RK fA, fB, k
            ModfRK = 0xBB, "MODF_RK" => [a: RF, b: RF, c: KF],
            /// MODF_KR fA, k, fC
            ModfKR = 0xBC, "MODF_KR" => [a: RF, b: KF, c: RF],
            /// POWF_RR fA, fB, fC
            PowfRR = 0xBD, "POWF_RR" => [a: RF, b: RF, c: RF],
            /// POWF_RK fA, fB, k
            PowfRK = 0xBE, "POWF_RK" => [a: RF, b: RF, c: KF],
            /// POWF_KR fA, k, fC
            PowfKR = 0xBF, "POWF_KR" => [a: RF, b: KF, c: RF],
            /// MINF_RR fA, fB, fC
            MinfRR = 0xC0, "MINF_RR" => [a: RF, b: RF, c: RF],
            /// MINF_RK fA, fB, k
            MinfRK = 0xC1, "MINF_RK" => [a: RF, b: RF, c: KF],
            /// MAXF_RR fA, fB, fC
            MaxfRR = 0xC2, "MAXF_RR" => [a: RF, b: RF, c: RF],
            /// MAXF_RK fA, fB, k
            MaxfRK = 0xC3, "MAXF_RK" => [a: RF, b: RF, c: KF],
            /// ATAN2 fA, fB, fC ; atan2(fB, fC) in degrees
            Atan2 = 0xC4, "ATAN2" => [a: RF, b: RF, c: RF],
            /// FLOP fA, fB, fn ; fA = fn(fB)
            Flop = 0xC5, "FLOP" => [a: RF, b: RF, c: FN],
            /// EQF_R flags, fB, fC ; exact or approximate equality
            EqfR = 0xC6, "EQF_R" => [a: CMP, b: RF, c: RF],
            /// EQF_K flags, fB, k
            EqfK = 0xC7, "EQF_K" => [a: CMP, b: RF, c: KF],
            /// LTF_RR flags, fB, fC
            LtfRR = 0xC8, "LTF_RR" => [a: CMP, b: RF, c: RF],
            /// LTF_RK flags, fB, k
            LtfRK = 0xC9, "LTF_RK" => [a: CMP, b: RF, c: KF],
            /// LTF_KR flags, k, fC
            LtfKR = 0xCA, "LTF_KR" => [a: CMP, b: KF, c: RF],
            /// LEF_RR flags, fB, fC
            LefRR = 0xCB, "LEF_RR" => [a: CMP, b: RF, c: RF],
            /// LEF_RK flags, fB, k
            LefRK = 0xCC, "LEF_RK" => [a: CMP, b: RF, c: KF],
            /// LEF_KR flags, k, fC
            LefKR = 0xCD, "LEF_KR" => [a: CMP, b: KF, c: RF],
            // =========================
            // Vectors
            // =========================
            /// NEGV2 fA, fB
            Negv2 = 0xD0, "NEGV2" => [a: RV2, b: RV2],
            /// ADDV2_RR fA, fB, fC
            Addv2RR = 0xD1, "ADDV2_RR" => [a: RV2, b: RV2, c: RV2],
            /// SUBV2_RR fA, fB, fC
            Subv2RR = 0xD2, "SUBV2_RR" => [a: RV2, b: RV2, c: RV2],
            /// DOTV2_RR fA, fB, fC ; scalar dot product
            Dotv2RR = 0xD3, "DOTV2_RR" => [a: RF, b: RV2, c: RV2],
            /// MULVF2_RR fA, fB, fC ; vector * scalar
            Mulvf2RR = 0xD4, "MULVF2_RR" => [a: RV2, b: RV2, c: RF],
            /// MULVF2_RK fA, fB, k
            Mulvf2RK = 0xD5, "MULVF2_RK" => [a: RV2, b: RV2, c: KF],
            /// DIVVF2_RR fA, fB, fC ; vector / scalar
            Divvf2RR = 0xD6, "DIVVF2_RR" => [a: RV2, b: RV2, c: RF],
            /// DIVVF2_RK fA, fB, k
            Divvf2RK = 0xD7, "DIVVF2_RK" => [a: RV2, b: RV2, c: KF],
            /// LENV2 fA, fB ; Euclidean length
            Lenv2 = 0xD8, "LENV2" => [a: RF, b: RV2],
            /// EQV2_R flags, fB, fC
            Eqv2R = 0xD9, "EQV2_R" => [a: CMP, b: RV2, c: RV2],
            /// EQV2_K flags, fB, k ; constant vector at konst[k..k+2]
            Eqv2K = 0xDA, "EQV2_K" => [a: CMP, b: RV2, c: KF],
            /// NEGV3 fA, fB
            Negv3 = 0xDB, "NEGV3" => [a: RV3, b: RV3],
            /// ADDV3_RR fA, fB, fC
            Addv3RR = 0xDC, "ADDV3_RR" => [a: RV3, b: RV3, c: RV3],
            /// SUBV3_RR fA, fB, fC
            Subv3RR = 0xDD, "SUBV3_RR" => [a: RV3, b: RV3, c: RV3],
            /// DOTV3_RR fA, fB, fC
            Dotv3RR = 0xDE, "DOTV3_RR" => [a: RF, b: RV3, c: RV3],
            /// CROSSV_RR fA, fB, fC ; 3D cross product
            CrossvRR = 0xDF, "CROSSV_RR" => [a: RV3, b: RV3, c: RV3],
            /// MULVF3_RR fA, fB, fC
            Mulvf3RR = 0xE0, "MULVF3_RR" => [a: RV3, b: RV3, c: RF],
            /// MULVF3_RK fA, fB, k
            Mulvf3RK = 0xE1, "MULVF3_RK" => [a: RV3, b: RV3, c: KF],
            /// DIVVF3_RR fA, fB, fC
            Divvf3RR = 0xE2, "DIVVF3_RR" => [a: RV3, b: RV3, c: RF],
            /// DIVVF3_RK fA, fB, k
            Divvf3RK = 0xE3, "DIVVF3_RK" => [a: RV3, b: RV3, c: KF],
            /// LENV3 fA, fB
            Lenv3 = 0xE4, "LENV3" => [a: RF, b: RV3],
            /// EQV3_R flags, fB, fC
            Eqv3R = 0xE5, "EQV3_R" => [a: CMP, b: RV3, c: RV3],
            /// EQV3_K flags, fB, k
            Eqv3K = 0xE6, "EQV3_K" => [a: CMP, b: RV3, c: KF],
            // =========================
            // Pointers
            // =========================
            /// ADDA_RR aA, aB, dC ; aA = aB + dC bytes
            AddaRR = 0xE8, "ADDA_RR" => [a: RP, b: RP, c: RI],
            /// ADDA_RK aA, aB, k
            AddaRK = 0xE9, "ADDA_RK" => [a: RP, b: RP, c: KI],
            /// SUBA dA, aB, aC ; byte distance aB - aC
            Suba = 0xEA, "SUBA" => [a: RI, b: RP, c: RP],
            /// EQA_R flags, aB, aC
            EqaR = 0xEB, "EQA_R" => [a: CMP, b: RP, c: RP],
            /// EQA_K flags, aB, k
            EqaK = 0xEC, "EQA_K" => [a: CMP, b: RP, c: KP],
        }
    };
}

#[macro_export]
macro_rules! define_instructions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:expr, $mnemonic:literal => [
                $( $field:ident : $kind:ident ),* $(,)?
            ]
        ),* $(,)?
    ) => {
        // =========================
        // VM instruction enum
        // =========================
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum Instruction {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u8> for Instruction {
            type Error = VMError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(Instruction::$name), )*
                    _ => Err(VMError::InvalidOpcode {
                        opcode: value,
                        offset: 0,
                    }),
                }
            }
        }

        impl Instruction {
            /// All instructions in table order.
            pub const ALL: &'static [Instruction] = &[ $( Instruction::$name, )* ];

            /// Returns the assembly mnemonic for this instruction.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Instruction::$name => $mnemonic, )*
                }
            }

            /// Looks up an instruction by mnemonic (case-insensitive).
            pub fn from_mnemonic(name: &str) -> Option<Instruction> {
                let upper = name.to_ascii_uppercase();
                match upper.as_str() {
                    $( $mnemonic => Some(Instruction::$name), )*
                    _ => None,
                }
            }

            /// Number of operands the assembler expects.
            pub const fn arity(&self) -> usize {
                match self {
                    $( Instruction::$name => $crate::define_instructions!(@count $( $field )*), )*
                }
            }
        }
    };

    // ---------- counting ----------
    (@count) => { 0usize };
    (@count $head:ident $( $tail:ident )*) => { 1usize + $crate::define_instructions!(@count $( $tail )*) };

    // ---------- raw field access ----------
    (@slot $w:expr, a) => { $w.a() };
    (@slot $w:expr, b) => { $w.b() };
    (@slot $w:expr, c) => { $w.c() };
    (@slot $w:expr, bc) => { $w.bc() };
    (@slot $w:expr, abc) => { $w.abc() };

    // ---------- field descriptors ----------
    (@field a) => { $crate::virtual_machine::isa::Field::A };
    (@field b) => { $crate::virtual_machine::isa::Field::B };
    (@field c) => { $crate::virtual_machine::isa::Field::C };
    (@field bc) => { $crate::virtual_machine::isa::Field::BC };
    (@field abc) => { $crate::virtual_machine::isa::Field::ABC };
    (@field a_bc) => { $crate::virtual_machine::isa::Field::TypeAIndexBC };
    (@field a_b) => { $crate::virtual_machine::isa::Field::TypeAIndexB };
    (@field b_c) => { $crate::virtual_machine::isa::Field::TypeBIndexC };

    // ---------- decoding ----------
    (@decode $w:expr, a_bc, TO) => {
        $crate::virtual_machine::operand::TypedOperand {
            ty: $crate::virtual_machine::operand::RegType($w.a()),
            index: $w.bc(),
        }
    };
    (@decode $w:expr, a_b, TO) => {
        $crate::virtual_machine::operand::TypedOperand {
            ty: $crate::virtual_machine::operand::RegType($w.a()),
            index: $w.b() as u16,
        }
    };
    (@decode $w:expr, b_c, TO) => {
        $crate::virtual_machine::operand::TypedOperand {
            ty: $crate::virtual_machine::operand::RegType($w.b()),
            index: $w.c() as u16,
        }
    };
    (@decode $w:expr, $slot:ident, RI) => {
        $crate::virtual_machine::vm::IntReg($crate::define_instructions!(@slot $w, $slot) as u16)
    };
    (@decode $w:expr, $slot:ident, RF) => {
        $crate::virtual_machine::vm::FloatReg($crate::define_instructions!(@slot $w, $slot) as u16)
    };
    (@decode $w:expr, $slot:ident, RV2) => {
        $crate::virtual_machine::vm::FloatReg($crate::define_instructions!(@slot $w, $slot) as u16)
    };
    (@decode $w:expr, $slot:ident, RV3) => {
        $crate::virtual_machine::vm::FloatReg($crate::define_instructions!(@slot $w, $slot) as u16)
    };
    (@decode $w:expr, $slot:ident, RS) => {
        $crate::virtual_machine::vm::StrReg($crate::define_instructions!(@slot $w, $slot) as u16)
    };
    (@decode $w:expr, $slot:ident, RP) => {
        $crate::virtual_machine::vm::PtrReg($crate::define_instructions!(@slot $w, $slot) as u16)
    };
    (@decode $w:expr, $slot:ident, RX) => { $crate::define_instructions!(@slot $w, $slot) as u16 };
    (@decode $w:expr, $slot:ident, KI) => {
        $crate::virtual_machine::vm::IntConst($crate::define_instructions!(@slot $w, $slot) as u16)
    };
    (@decode $w:expr, $slot:ident, KF) => {
        $crate::virtual_machine::vm::FloatConst($crate::define_instructions!(@slot $w, $slot) as u16)
    };
    (@decode $w:expr, $slot:ident, KS) => {
        $crate::virtual_machine::vm::StrConst($crate::define_instructions!(@slot $w, $slot) as u16)
    };
    (@decode $w:expr, $slot:ident, KP) => {
        $crate::virtual_machine::vm::PtrConst($crate::define_instructions!(@slot $w, $slot) as u16)
    };
    (@decode $w:expr, $slot:ident, U8) => { $crate::define_instructions!(@slot $w, $slot) as u8 };
    (@decode $w:expr, $slot:ident, I8) => { $crate::define_instructions!(@slot $w, $slot) as i8 };
    (@decode $w:expr, $slot:ident, U16) => { $crate::define_instructions!(@slot $w, $slot) as u16 };
    (@decode $w:expr, $slot:ident, I16) => { $crate::define_instructions!(@slot $w, $slot) as i16 };
    (@decode $w:expr, $slot:ident, I24) => { $crate::define_instructions!(@slot $w, $slot) as i32 };
    (@decode $w:expr, $slot:ident, RET) => {
        $crate::virtual_machine::operand::RetSlot($crate::define_instructions!(@slot $w, $slot) as u8)
    };
    (@decode $w:expr, $slot:ident, CMP) => {
        $crate::virtual_machine::operand::CmpFlags($crate::define_instructions!(@slot $w, $slot) as u8)
    };
    (@decode $w:expr, $slot:ident, CK) => { $crate::define_instructions!(@slot $w, $slot) as u8 };
    (@decode $w:expr, $slot:ident, CB) => { $crate::define_instructions!(@slot $w, $slot) as u8 };
    (@decode $w:expr, $slot:ident, FN) => { $crate::define_instructions!(@slot $w, $slot) as u8 };
    (@decode $w:expr, $slot:ident, AK) => { $crate::define_instructions!(@slot $w, $slot) as u8 };
}

for_each_instruction!(define_instructions);

/// One encoded instruction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Word(pub u32);

impl Word {
    /// Starts a word with only the opcode set.
    pub const fn new(instr: Instruction) -> Self {
        Word(instr as u32)
    }

    pub const fn op(self) -> u8 {
        self.0 as u8
    }

    pub const fn a(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn b(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub const fn c(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// B and C as one unsigned 16-bit field.
    pub const fn bc(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// A, B and C as one sign-extended 24-bit field.
    pub const fn abc(self) -> i32 {
        (self.0 as i32) >> 8
    }

    /// Decodes the opcode, reporting `offset` on failure.
    pub fn instruction(self, offset: usize) -> Result<Instruction, VMError> {
        Instruction::try_from(self.op()).map_err(|_| VMError::InvalidOpcode {
            opcode: self.op(),
            offset,
        })
    }

    /// Writes an unsigned value into `field`, rejecting values that do not fit.
    pub fn with_unsigned(self, field: Field, value: i64) -> Result<Word, VMError> {
        let bits = field.bits();
        if value < 0 || value >= (1i64 << bits) {
            return Err(VMError::OperandOutOfRange { value, bits });
        }
        Ok(Word(self.0 | field.place(value as u32)))
    }

    /// Writes a signed value into `field` in two's complement.
    pub fn with_signed(self, field: Field, value: i64) -> Result<Word, VMError> {
        let bits = field.bits();
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        if value < min || value > max {
            return Err(VMError::OperandOutOfRange { value, bits });
        }
        let mask = (1u32 << bits) - 1;
        Ok(Word(self.0 | field.place(value as u32 & mask)))
    }

    /// Writes a type tag and index into a two-part field.
    pub fn with_typed(self, field: Field, ty: u8, index: i64) -> Result<Word, VMError> {
        let (type_field, index_field) = match field {
            Field::TypeAIndexBC => (Field::A, Field::BC),
            Field::TypeAIndexB => (Field::A, Field::B),
            Field::TypeBIndexC => (Field::B, Field::C),
            other => {
                return Err(VMError::Directive {
                    message: format!("{other:?} cannot hold a typed operand"),
                });
            }
        };
        self.with_unsigned(type_field, ty as i64)?
            .with_unsigned(index_field, index)
    }
}

/// Instruction field an operand occupies.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Field {
    A,
    B,
    C,
    BC,
    ABC,
    TypeAIndexBC,
    TypeAIndexB,
    TypeBIndexC,
}

impl Field {
    /// Width in bits of the index part of the field.
    pub const fn bits(self) -> u32 {
        match self {
            Field::A | Field::B | Field::C | Field::TypeAIndexB | Field::TypeBIndexC => 8,
            Field::BC | Field::TypeAIndexBC => 16,
            Field::ABC => 24,
        }
    }

    const fn shift(self) -> u32 {
        match self {
            Field::A | Field::ABC => 8,
            Field::B | Field::BC | Field::TypeAIndexB | Field::TypeAIndexBC => 16,
            Field::C | Field::TypeBIndexC => 24,
        }
    }

    const fn place(self, value: u32) -> u32 {
        value << self.shift()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_try_from_invalid() {
        assert!(matches!(
            Instruction::try_from(0xFF),
            Err(VMError::InvalidOpcode { opcode: 0xFF, .. })
        ));
        assert!(Word(0xF5).instruction(7).is_err_and(|e| e
            == VMError::InvalidOpcode {
                opcode: 0xF5,
                offset: 7
            }));
    }

    #[test]
    fn opcodes_round_trip() {
        for instr in Instruction::ALL {
            assert_eq!(Instruction::try_from(*instr as u8).unwrap(), *instr);
            assert_eq!(Instruction::from_mnemonic(instr.mnemonic()), Some(*instr));
        }
    }

    #[test]
    fn mnemonics_are_case_insensitive() {
        assert_eq!(Instruction::from_mnemonic("add_rr"), Some(Instruction::AddRR));
        assert_eq!(Instruction::from_mnemonic("BOGUS"), None);
    }

    #[test]
    fn arity_counts_operands() {
        assert_eq!(Instruction::Nop.arity(), 0);
        assert_eq!(Instruction::Param.arity(), 1);
        assert_eq!(Instruction::Ret.arity(), 2);
        assert_eq!(Instruction::AddRR.arity(), 3);
    }

    #[test]
    fn word_fields() {
        let w = Word::new(Instruction::AddRK)
            .with_unsigned(Field::A, 1)
            .unwrap()
            .with_unsigned(Field::B, 2)
            .unwrap()
            .with_unsigned(Field::C, 255)
            .unwrap();
        assert_eq!(w.op(), Instruction::AddRK as u8);
        assert_eq!((w.a(), w.b(), w.c()), (1, 2, 255));
        assert_eq!(w.bc(), 0xFF02);
    }

    #[test]
    fn signed_abc_sign_extends() {
        let w = Word::new(Instruction::Jmp)
            .with_signed(Field::ABC, -3)
            .unwrap();
        assert_eq!(w.abc(), -3);
        let w = Word::new(Instruction::Jmp)
            .with_signed(Field::ABC, (1 << 23) - 1)
            .unwrap();
        assert_eq!(w.abc(), (1 << 23) - 1);
    }

    #[test]
    fn out_of_range_operands_rejected() {
        let w = Word::new(Instruction::Li);
        assert!(matches!(
            w.with_unsigned(Field::A, 256),
            Err(VMError::OperandOutOfRange { value: 256, bits: 8 })
        ));
        assert!(w.with_signed(Field::BC, -32769).is_err());
        assert!(w.with_signed(Field::BC, -32768).is_ok());
        assert!(w.with_unsigned(Field::ABC, -1).is_err());
    }

    #[test]
    fn typed_fields_split() {
        let w = Word::new(Instruction::Param)
            .with_typed(Field::TypeAIndexBC, 0x21, 300)
            .unwrap();
        assert_eq!(w.a(), 0x21);
        assert_eq!(w.bc(), 300);
        assert!(Word::new(Instruction::Ret)
            .with_typed(Field::TypeBIndexC, 0, 256)
            .is_err());
        assert!(Word::new(Instruction::Nop)
            .with_typed(Field::A, 0, 0)
            .is_err());
    }
}
