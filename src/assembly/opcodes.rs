//! CIL opcode table (ECMA-335 Partition III).
//!
//! Every opcode is an associated constant on [`OpCode`] carrying its encoding, mnemonic,
//! operand kind and control-flow behaviour. Single-byte opcodes have a prefix of `0x00`,
//! two-byte opcodes share the [`FE_PREFIX`] first byte.
//!
//! ```rust
//! use cilpatch::assembly::{FlowType, OpCode};
//!
//! assert_eq!(OpCode::NEWOBJ.mnemonic(), "newobj");
//! assert_eq!(OpCode::NEWOBJ.flow(), FlowType::Call);
//! assert_eq!(OpCode::from_bytes(0x00, 0x17), Some(OpCode::LDC_I4_1));
//! assert_eq!(OpCode::from_bytes(0xFE, 0x01), Some(OpCode::CEQ));
//! ```
#![allow(missing_docs)]

use std::{collections::HashMap, fmt, hash::Hash, sync::OnceLock};

use crate::assembly::instruction::{FlowType, OperandType};

/// First byte shared by all two-byte opcodes.
pub const FE_PREFIX: u8 = 0xFE;

/// A CIL opcode together with its static decoding information.
#[derive(Clone, Copy)]
pub struct OpCode {
    prefix: u8,
    value: u8,
    mnemonic: &'static str,
    operand: OperandType,
    flow: FlowType,
}

impl OpCode {
    /// Looks up the opcode encoded by `prefix` (`0x00` or `0xFE`) and `value`.
    #[must_use]
    pub fn from_bytes(prefix: u8, value: u8) -> Option<OpCode> {
        static LOOKUP: OnceLock<HashMap<u16, OpCode>> = OnceLock::new();

        LOOKUP
            .get_or_init(|| {
                OPCODES
                    .iter()
                    .map(|op| (op.encoding(), *op))
                    .collect::<HashMap<_, _>>()
            })
            .get(&(u16::from(prefix) << 8 | u16::from(value)))
            .copied()
    }

    /// Encoding as `prefix << 8 | value`.
    #[must_use]
    pub fn encoding(&self) -> u16 {
        u16::from(self.prefix) << 8 | u16::from(self.value)
    }

    /// The prefix byte, `0x00` for single-byte opcodes.
    #[must_use]
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// The opcode byte following the optional prefix.
    #[must_use]
    pub fn value(&self) -> u8 {
        self.value
    }

    /// Assembler mnemonic, e.g. `ldc.i4.1`.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        self.mnemonic
    }

    /// Kind of inline operand following the opcode bytes.
    #[must_use]
    pub fn operand_type(&self) -> OperandType {
        self.operand
    }

    /// Control-flow behaviour.
    #[must_use]
    pub fn flow(&self) -> FlowType {
        self.flow
    }

    /// Number of bytes taken by the opcode itself.
    #[must_use]
    pub fn size(&self) -> usize {
        if self.prefix == FE_PREFIX {
            2
        } else {
            1
        }
    }

    /// The long form of a short branch (`br.s` -> `br`), `None` for everything else.
    #[must_use]
    pub fn long_branch_form(&self) -> Option<OpCode> {
        if self.operand != OperandType::ShortTarget {
            return None;
        }

        match self.value {
            // br.s .. blt.un.s map onto br .. blt.un at a fixed distance
            0x2B..=0x37 => OpCode::from_bytes(0x00, self.value + 0x0D),
            0xDE => Some(OpCode::LEAVE),
            _ => None,
        }
    }
}

impl PartialEq for OpCode {
    fn eq(&self, other: &Self) -> bool {
        self.encoding() == other.encoding()
    }
}

impl Eq for OpCode {}

impl Hash for OpCode {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.encoding().hash(state);
    }
}

impl fmt::Debug for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpCode({}, 0x{:04X})", self.mnemonic, self.encoding())
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic)
    }
}

macro_rules! opcodes {
    ($( $name:ident = ($prefix:expr, $value:expr, $mnemonic:expr, $operand:ident, $flow:ident); )*) => {
        impl OpCode {
            $(
                pub const $name: OpCode = OpCode {
                    prefix: $prefix,
                    value: $value,
                    mnemonic: $mnemonic,
                    operand: OperandType::$operand,
                    flow: FlowType::$flow,
                };
            )*
        }

        /// Every defined opcode, in encoding order.
        pub static OPCODES: &[OpCode] = &[$(OpCode::$name,)*];
    };
}

opcodes! {
    NOP = (0x00, 0x00, "nop", None, Sequential);
    BREAK = (0x00, 0x01, "break", None, Sequential);
    LDARG_0 = (0x00, 0x02, "ldarg.0", None, Sequential);
    LDARG_1 = (0x00, 0x03, "ldarg.1", None, Sequential);
    LDARG_2 = (0x00, 0x04, "ldarg.2", None, Sequential);
    LDARG_3 = (0x00, 0x05, "ldarg.3", None, Sequential);
    LDLOC_0 = (0x00, 0x06, "ldloc.0", None, Sequential);
    LDLOC_1 = (0x00, 0x07, "ldloc.1", None, Sequential);
    LDLOC_2 = (0x00, 0x08, "ldloc.2", None, Sequential);
    LDLOC_3 = (0x00, 0x09, "ldloc.3", None, Sequential);
    STLOC_0 = (0x00, 0x0A, "stloc.0", None, Sequential);
    STLOC_1 = (0x00, 0x0B, "stloc.1", None, Sequential);
    STLOC_2 = (0x00, 0x0C, "stloc.2", None, Sequential);
    STLOC_3 = (0x00, 0x0D, "stloc.3", None, Sequential);
    LDARG_S = (0x00, 0x0E, "ldarg.s", ShortArgument, Sequential);
    LDARGA_S = (0x00, 0x0F, "ldarga.s", ShortArgument, Sequential);
    STARG_S = (0x00, 0x10, "starg.s", ShortArgument, Sequential);
    LDLOC_S = (0x00, 0x11, "ldloc.s", ShortLocal, Sequential);
    LDLOCA_S = (0x00, 0x12, "ldloca.s", ShortLocal, Sequential);
    STLOC_S = (0x00, 0x13, "stloc.s", ShortLocal, Sequential);
    LDNULL = (0x00, 0x14, "ldnull", None, Sequential);
    LDC_I4_M1 = (0x00, 0x15, "ldc.i4.m1", None, Sequential);
    LDC_I4_0 = (0x00, 0x16, "ldc.i4.0", None, Sequential);
    LDC_I4_1 = (0x00, 0x17, "ldc.i4.1", None, Sequential);
    LDC_I4_2 = (0x00, 0x18, "ldc.i4.2", None, Sequential);
    LDC_I4_3 = (0x00, 0x19, "ldc.i4.3", None, Sequential);
    LDC_I4_4 = (0x00, 0x1A, "ldc.i4.4", None, Sequential);
    LDC_I4_5 = (0x00, 0x1B, "ldc.i4.5", None, Sequential);
    LDC_I4_6 = (0x00, 0x1C, "ldc.i4.6", None, Sequential);
    LDC_I4_7 = (0x00, 0x1D, "ldc.i4.7", None, Sequential);
    LDC_I4_8 = (0x00, 0x1E, "ldc.i4.8", None, Sequential);
    LDC_I4_S = (0x00, 0x1F, "ldc.i4.s", Int8, Sequential);
    LDC_I4 = (0x00, 0x20, "ldc.i4", Int32, Sequential);
    LDC_I8 = (0x00, 0x21, "ldc.i8", Int64, Sequential);
    LDC_R4 = (0x00, 0x22, "ldc.r4", Float32, Sequential);
    LDC_R8 = (0x00, 0x23, "ldc.r8", Float64, Sequential);
    DUP = (0x00, 0x25, "dup", None, Sequential);
    POP = (0x00, 0x26, "pop", None, Sequential);
    JMP = (0x00, 0x27, "jmp", Token, Call);
    CALL = (0x00, 0x28, "call", Token, Call);
    CALLI = (0x00, 0x29, "calli", Token, Call);
    RET = (0x00, 0x2A, "ret", None, Return);
    BR_S = (0x00, 0x2B, "br.s", ShortTarget, UnconditionalBranch);
    BRFALSE_S = (0x00, 0x2C, "brfalse.s", ShortTarget, ConditionalBranch);
    BRTRUE_S = (0x00, 0x2D, "brtrue.s", ShortTarget, ConditionalBranch);
    BEQ_S = (0x00, 0x2E, "beq.s", ShortTarget, ConditionalBranch);
    BGE_S = (0x00, 0x2F, "bge.s", ShortTarget, ConditionalBranch);
    BGT_S = (0x00, 0x30, "bgt.s", ShortTarget, ConditionalBranch);
    BLE_S = (0x00, 0x31, "ble.s", ShortTarget, ConditionalBranch);
    BLT_S = (0x00, 0x32, "blt.s", ShortTarget, ConditionalBranch);
    BNE_UN_S = (0x00, 0x33, "bne.un.s", ShortTarget, ConditionalBranch);
    BGE_UN_S = (0x00, 0x34, "bge.un.s", ShortTarget, ConditionalBranch);
    BGT_UN_S = (0x00, 0x35, "bgt.un.s", ShortTarget, ConditionalBranch);
    BLE_UN_S = (0x00, 0x36, "ble.un.s", ShortTarget, ConditionalBranch);
    BLT_UN_S = (0x00, 0x37, "blt.un.s", ShortTarget, ConditionalBranch);
    BR = (0x00, 0x38, "br", Target, UnconditionalBranch);
    BRFALSE = (0x00, 0x39, "brfalse", Target, ConditionalBranch);
    BRTRUE = (0x00, 0x3A, "brtrue", Target, ConditionalBranch);
    BEQ = (0x00, 0x3B, "beq", Target, ConditionalBranch);
    BGE = (0x00, 0x3C, "bge", Target, ConditionalBranch);
    BGT = (0x00, 0x3D, "bgt", Target, ConditionalBranch);
    BLE = (0x00, 0x3E, "ble", Target, ConditionalBranch);
    BLT = (0x00, 0x3F, "blt", Target, ConditionalBranch);
    BNE_UN = (0x00, 0x40, "bne.un", Target, ConditionalBranch);
    BGE_UN = (0x00, 0x41, "bge.un", Target, ConditionalBranch);
    BGT_UN = (0x00, 0x42, "bgt.un", Target, ConditionalBranch);
    BLE_UN = (0x00, 0x43, "ble.un", Target, ConditionalBranch);
    BLT_UN = (0x00, 0x44, "blt.un", Target, ConditionalBranch);
    SWITCH = (0x00, 0x45, "switch", Switch, Switch);
    LDIND_I1 = (0x00, 0x46, "ldind.i1", None, Sequential);
    LDIND_U1 = (0x00, 0x47, "ldind.u1", None, Sequential);
    LDIND_I2 = (0x00, 0x48, "ldind.i2", None, Sequential);
    LDIND_U2 = (0x00, 0x49, "ldind.u2", None, Sequential);
    LDIND_I4 = (0x00, 0x4A, "ldind.i4", None, Sequential);
    LDIND_U4 = (0x00, 0x4B, "ldind.u4", None, Sequential);
    LDIND_I8 = (0x00, 0x4C, "ldind.i8", None, Sequential);
    LDIND_I = (0x00, 0x4D, "ldind.i", None, Sequential);
    LDIND_R4 = (0x00, 0x4E, "ldind.r4", None, Sequential);
    LDIND_R8 = (0x00, 0x4F, "ldind.r8", None, Sequential);
    LDIND_REF = (0x00, 0x50, "ldind.ref", None, Sequential);
    STIND_REF = (0x00, 0x51, "stind.ref", None, Sequential);
    STIND_I1 = (0x00, 0x52, "stind.i1", None, Sequential);
    STIND_I2 = (0x00, 0x53, "stind.i2", None, Sequential);
    STIND_I4 = (0x00, 0x54, "stind.i4", None, Sequential);
    STIND_I8 = (0x00, 0x55, "stind.i8", None, Sequential);
    STIND_R4 = (0x00, 0x56, "stind.r4", None, Sequential);
    STIND_R8 = (0x00, 0x57, "stind.r8", None, Sequential);
    ADD = (0x00, 0x58, "add", None, Sequential);
    SUB = (0x00, 0x59, "sub", None, Sequential);
    MUL = (0x00, 0x5A, "mul", None, Sequential);
    DIV = (0x00, 0x5B, "div", None, Sequential);
    DIV_UN = (0x00, 0x5C, "div.un", None, Sequential);
    REM = (0x00, 0x5D, "rem", None, Sequential);
    REM_UN = (0x00, 0x5E, "rem.un", None, Sequential);
    AND = (0x00, 0x5F, "and", None, Sequential);
    OR = (0x00, 0x60, "or", None, Sequential);
    XOR = (0x00, 0x61, "xor", None, Sequential);
    SHL = (0x00, 0x62, "shl", None, Sequential);
    SHR = (0x00, 0x63, "shr", None, Sequential);
    SHR_UN = (0x00, 0x64, "shr.un", None, Sequential);
    NEG = (0x00, 0x65, "neg", None, Sequential);
    NOT = (0x00, 0x66, "not", None, Sequential);
    CONV_I1 = (0x00, 0x67, "conv.i1", None, Sequential);
    CONV_I2 = (0x00, 0x68, "conv.i2", None, Sequential);
    CONV_I4 = (0x00, 0x69, "conv.i4", None, Sequential);
    CONV_I8 = (0x00, 0x6A, "conv.i8", None, Sequential);
    CONV_R4 = (0x00, 0x6B, "conv.r4", None, Sequential);
    CONV_R8 = (0x00, 0x6C, "conv.r8", None, Sequential);
    CONV_U4 = (0x00, 0x6D, "conv.u4", None, Sequential);
    CONV_U8 = (0x00, 0x6E, "conv.u8", None, Sequential);
    CALLVIRT = (0x00, 0x6F, "callvirt", Token, Call);
    CPOBJ = (0x00, 0x70, "cpobj", Token, Sequential);
    LDOBJ = (0x00, 0x71, "ldobj", Token, Sequential);
    LDSTR = (0x00, 0x72, "ldstr", Token, Sequential);
    NEWOBJ = (0x00, 0x73, "newobj", Token, Call);
    CASTCLASS = (0x00, 0x74, "castclass", Token, Sequential);
    ISINST = (0x00, 0x75, "isinst", Token, Sequential);
    CONV_R_UN = (0x00, 0x76, "conv.r.un", None, Sequential);
    UNBOX = (0x00, 0x79, "unbox", Token, Sequential);
    THROW = (0x00, 0x7A, "throw", None, Throw);
    LDFLD = (0x00, 0x7B, "ldfld", Token, Sequential);
    LDFLDA = (0x00, 0x7C, "ldflda", Token, Sequential);
    STFLD = (0x00, 0x7D, "stfld", Token, Sequential);
    LDSFLD = (0x00, 0x7E, "ldsfld", Token, Sequential);
    LDSFLDA = (0x00, 0x7F, "ldsflda", Token, Sequential);
    STSFLD = (0x00, 0x80, "stsfld", Token, Sequential);
    STOBJ = (0x00, 0x81, "stobj", Token, Sequential);
    CONV_OVF_I1_UN = (0x00, 0x82, "conv.ovf.i1.un", None, Sequential);
    CONV_OVF_I2_UN = (0x00, 0x83, "conv.ovf.i2.un", None, Sequential);
    CONV_OVF_I4_UN = (0x00, 0x84, "conv.ovf.i4.un", None, Sequential);
    CONV_OVF_I8_UN = (0x00, 0x85, "conv.ovf.i8.un", None, Sequential);
    CONV_OVF_U1_UN = (0x00, 0x86, "conv.ovf.u1.un", None, Sequential);
    CONV_OVF_U2_UN = (0x00, 0x87, "conv.ovf.u2.un", None, Sequential);
    CONV_OVF_U4_UN = (0x00, 0x88, "conv.ovf.u4.un", None, Sequential);
    CONV_OVF_U8_UN = (0x00, 0x89, "conv.ovf.u8.un", None, Sequential);
    CONV_OVF_I_UN = (0x00, 0x8A, "conv.ovf.i.un", None, Sequential);
    CONV_OVF_U_UN = (0x00, 0x8B, "conv.ovf.u.un", None, Sequential);
    BOX = (0x00, 0x8C, "box", Token, Sequential);
    NEWARR = (0x00, 0x8D, "newarr", Token, Sequential);
    LDLEN = (0x00, 0x8E, "ldlen", None, Sequential);
    LDELEMA = (0x00, 0x8F, "ldelema", Token, Sequential);
    LDELEM_I1 = (0x00, 0x90, "ldelem.i1", None, Sequential);
    LDELEM_U1 = (0x00, 0x91, "ldelem.u1", None, Sequential);
    LDELEM_I2 = (0x00, 0x92, "ldelem.i2", None, Sequential);
    LDELEM_U2 = (0x00, 0x93, "ldelem.u2", None, Sequential);
    LDELEM_I4 = (0x00, 0x94, "ldelem.i4", None, Sequential);
    LDELEM_U4 = (0x00, 0x95, "ldelem.u4", None, Sequential);
    LDELEM_I8 = (0x00, 0x96, "ldelem.i8", None, Sequential);
    LDELEM_I = (0x00, 0x97, "ldelem.i", None, Sequential);
    LDELEM_R4 = (0x00, 0x98, "ldelem.r4", None, Sequential);
    LDELEM_R8 = (0x00, 0x99, "ldelem.r8", None, Sequential);
    LDELEM_REF = (0x00, 0x9A, "ldelem.ref", None, Sequential);
    STELEM_I = (0x00, 0x9B, "stelem.i", None, Sequential);
    STELEM_I1 = (0x00, 0x9C, "stelem.i1", None, Sequential);
    STELEM_I2 = (0x00, 0x9D, "stelem.i2", None, Sequential);
    STELEM_I4 = (0x00, 0x9E, "stelem.i4", None, Sequential);
    STELEM_I8 = (0x00, 0x9F, "stelem.i8", None, Sequential);
    STELEM_R4 = (0x00, 0xA0, "stelem.r4", None, Sequential);
    STELEM_R8 = (0x00, 0xA1, "stelem.r8", None, Sequential);
    STELEM_REF = (0x00, 0xA2, "stelem.ref", None, Sequential);
    LDELEM = (0x00, 0xA3, "ldelem", Token, Sequential);
    STELEM = (0x00, 0xA4, "stelem", Token, Sequential);
    UNBOX_ANY = (0x00, 0xA5, "unbox.any", Token, Sequential);
    CONV_OVF_I1 = (0x00, 0xB3, "conv.ovf.i1", None, Sequential);
    CONV_OVF_U1 = (0x00, 0xB4, "conv.ovf.u1", None, Sequential);
    CONV_OVF_I2 = (0x00, 0xB5, "conv.ovf.i2", None, Sequential);
    CONV_OVF_U2 = (0x00, 0xB6, "conv.ovf.u2", None, Sequential);
    CONV_OVF_I4 = (0x00, 0xB7, "conv.ovf.i4", None, Sequential);
    CONV_OVF_U4 = (0x00, 0xB8, "conv.ovf.u4", None, Sequential);
    CONV_OVF_I8 = (0x00, 0xB9, "conv.ovf.i8", None, Sequential);
    CONV_OVF_U8 = (0x00, 0xBA, "conv.ovf.u8", None, Sequential);
    REFANYVAL = (0x00, 0xC2, "refanyval", Token, Sequential);
    CKFINITE = (0x00, 0xC3, "ckfinite", None, Sequential);
    MKREFANY = (0x00, 0xC6, "mkrefany", Token, Sequential);
    LDTOKEN = (0x00, 0xD0, "ldtoken", Token, Sequential);
    CONV_U2 = (0x00, 0xD1, "conv.u2", None, Sequential);
    CONV_U1 = (0x00, 0xD2, "conv.u1", None, Sequential);
    CONV_I = (0x00, 0xD3, "conv.i", None, Sequential);
    CONV_OVF_I = (0x00, 0xD4, "conv.ovf.i", None, Sequential);
    CONV_OVF_U = (0x00, 0xD5, "conv.ovf.u", None, Sequential);
    ADD_OVF = (0x00, 0xD6, "add.ovf", None, Sequential);
    ADD_OVF_UN = (0x00, 0xD7, "add.ovf.un", None, Sequential);
    MUL_OVF = (0x00, 0xD8, "mul.ovf", None, Sequential);
    MUL_OVF_UN = (0x00, 0xD9, "mul.ovf.un", None, Sequential);
    SUB_OVF = (0x00, 0xDA, "sub.ovf", None, Sequential);
    SUB_OVF_UN = (0x00, 0xDB, "sub.ovf.un", None, Sequential);
    ENDFINALLY = (0x00, 0xDC, "endfinally", None, EndFinally);
    LEAVE = (0x00, 0xDD, "leave", Target, Leave);
    LEAVE_S = (0x00, 0xDE, "leave.s", ShortTarget, Leave);
    STIND_I = (0x00, 0xDF, "stind.i", None, Sequential);
    CONV_U = (0x00, 0xE0, "conv.u", None, Sequential);
    ARGLIST = (0xFE, 0x00, "arglist", None, Sequential);
    CEQ = (0xFE, 0x01, "ceq", None, Sequential);
    CGT = (0xFE, 0x02, "cgt", None, Sequential);
    CGT_UN = (0xFE, 0x03, "cgt.un", None, Sequential);
    CLT = (0xFE, 0x04, "clt", None, Sequential);
    CLT_UN = (0xFE, 0x05, "clt.un", None, Sequential);
    LDFTN = (0xFE, 0x06, "ldftn", Token, Sequential);
    LDVIRTFTN = (0xFE, 0x07, "ldvirtftn", Token, Sequential);
    LDARG = (0xFE, 0x09, "ldarg", Argument, Sequential);
    LDARGA = (0xFE, 0x0A, "ldarga", Argument, Sequential);
    STARG = (0xFE, 0x0B, "starg", Argument, Sequential);
    LDLOC = (0xFE, 0x0C, "ldloc", Local, Sequential);
    LDLOCA = (0xFE, 0x0D, "ldloca", Local, Sequential);
    STLOC = (0xFE, 0x0E, "stloc", Local, Sequential);
    LOCALLOC = (0xFE, 0x0F, "localloc", None, Sequential);
    ENDFILTER = (0xFE, 0x11, "endfilter", None, EndFinally);
    UNALIGNED = (0xFE, 0x12, "unaligned.", UInt8, Sequential);
    VOLATILE = (0xFE, 0x13, "volatile.", None, Sequential);
    TAIL = (0xFE, 0x14, "tail.", None, Sequential);
    INITOBJ = (0xFE, 0x15, "initobj", Token, Sequential);
    CONSTRAINED = (0xFE, 0x16, "constrained.", Token, Sequential);
    CPBLK = (0xFE, 0x17, "cpblk", None, Sequential);
    INITBLK = (0xFE, 0x18, "initblk", None, Sequential);
    NO = (0xFE, 0x19, "no.", UInt8, Sequential);
    RETHROW = (0xFE, 0x1A, "rethrow", None, Throw);
    SIZEOF = (0xFE, 0x1C, "sizeof", Token, Sequential);
    REFANYTYPE = (0xFE, 0x1D, "refanytype", None, Sequential);
    READONLY = (0xFE, 0x1E, "readonly.", None, Sequential);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn encodings_are_unique() {
        let encodings: HashSet<u16> = OPCODES.iter().map(OpCode::encoding).collect();
        assert_eq!(encodings.len(), OPCODES.len());
    }

    #[test]
    fn lookup_roundtrip() {
        for opcode in OPCODES {
            assert_eq!(
                OpCode::from_bytes(opcode.prefix(), opcode.value()),
                Some(*opcode)
            );
        }

        assert_eq!(OpCode::from_bytes(0x00, 0x24), None);
        assert_eq!(OpCode::from_bytes(0xFE, 0x08), None);
    }

    #[test]
    fn long_branch_forms() {
        assert_eq!(OpCode::BR_S.long_branch_form(), Some(OpCode::BR));
        assert_eq!(OpCode::BRTRUE_S.long_branch_form(), Some(OpCode::BRTRUE));
        assert_eq!(OpCode::BLT_UN_S.long_branch_form(), Some(OpCode::BLT_UN));
        assert_eq!(OpCode::LEAVE_S.long_branch_form(), Some(OpCode::LEAVE));
        assert_eq!(OpCode::BR.long_branch_form(), None);
        assert_eq!(OpCode::NEWOBJ.long_branch_form(), None);
    }

    #[test]
    fn sizes() {
        assert_eq!(OpCode::NEWOBJ.size(), 1);
        assert_eq!(OpCode::CEQ.size(), 2);
        assert_eq!(OpCode::CEQ.prefix(), FE_PREFIX);
    }
}
