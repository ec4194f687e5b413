//! CIL instruction representation.
//!
//! An [`Instruction`] is an [`OpCode`] plus an [`Operand`]. Instructions live in an ordered
//! `Vec` inside a method body and are identified by their position in it. Branch and switch
//! targets are therefore stored as instruction indices rather than byte offsets, which keeps
//! them meaningful while the sequence is edited and lets the encoder recompute every
//! displacement when the body is written back.
//!
//! # Key Components
//!
//! - [`Instruction`] - Opcode and operand
//! - [`Operand`] - Decoded operand (immediate, token, index target, local, argument)
//! - [`Immediate`] - Inline constant values
//! - [`OperandType`] - Encoded operand kind of an opcode
//! - [`FlowType`] - Control-flow classification of an opcode

use std::fmt;

use crate::{assembly::opcodes::OpCode, metadata::token::Token};

/// Types of inline operands for CIL instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand present
    None,
    /// Signed 8-bit integer
    Int8,
    /// Unsigned 8-bit integer
    UInt8,
    /// Signed 32-bit integer
    Int32,
    /// Signed 64-bit integer
    Int64,
    /// 32-bit floating point
    Float32,
    /// 64-bit floating point
    Float64,
    /// Signed 8-bit branch displacement
    ShortTarget,
    /// Signed 32-bit branch displacement
    Target,
    /// 32-bit metadata token
    Token,
    /// Jump table of signed 32-bit displacements
    Switch,
    /// Local variable index, 8-bit
    ShortLocal,
    /// Local variable index, 16-bit
    Local,
    /// Argument index, 8-bit
    ShortArgument,
    /// Argument index, 16-bit
    Argument,
}

impl OperandType {
    /// Encoded size of the operand in bytes; `None` for the variable-length switch table.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        match self {
            OperandType::None => Some(0),
            OperandType::Int8
            | OperandType::UInt8
            | OperandType::ShortTarget
            | OperandType::ShortLocal
            | OperandType::ShortArgument => Some(1),
            OperandType::Local | OperandType::Argument => Some(2),
            OperandType::Int32 | OperandType::Float32 | OperandType::Target | OperandType::Token => {
                Some(4)
            }
            OperandType::Int64 | OperandType::Float64 => Some(8),
            OperandType::Switch => None,
        }
    }
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Normal execution continues to next instruction
    Sequential,
    /// Conditional branch to another location
    ConditionalBranch,
    /// Always branches to another location (unconditional jump)
    UnconditionalBranch,
    /// Call to another method, including object construction
    Call,
    /// Returns from current method
    Return,
    /// Multi-way branch (switch statement)
    Switch,
    /// Exception throwing
    Throw,
    /// End of finally or filter block
    EndFinally,
    /// Leave protected region (try/catch/finally)
    Leave,
}

/// Immediate values encoded directly in the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    /// Signed 8-bit immediate value
    Int8(i8),
    /// Unsigned 8-bit immediate value
    UInt8(u8),
    /// Signed 32-bit immediate value
    Int32(i32),
    /// Signed 64-bit immediate value
    Int64(i64),
    /// 32-bit floating point immediate value
    Float32(f32),
    /// 64-bit floating point immediate value
    Float64(f64),
}

/// A decoded instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand present
    None,
    /// Immediate value (constant embedded in instruction)
    Immediate(Immediate),
    /// Branch target, as an index into the owning instruction sequence
    Target(usize),
    /// Switch table, as indices into the owning instruction sequence
    Switch(Vec<usize>),
    /// Metadata token reference
    Token(Token),
    /// Local variable index
    Local(u16),
    /// Method argument index
    Argument(u16),
}

/// A single CIL instruction.
///
/// # Examples
///
/// ```rust
/// use cilpatch::assembly::{Instruction, OpCode, Operand};
/// use cilpatch::metadata::token::Token;
///
/// let push = Instruction::simple(OpCode::LDC_I4_1);
/// let construct = Instruction::new(OpCode::NEWOBJ, Operand::Token(Token::new(0x0A00_0001)));
///
/// assert_eq!(push.to_string(), "ldc.i4.1");
/// assert_eq!(construct.token(), Some(Token::new(0x0A00_0001)));
/// ```
#[derive(Clone, PartialEq)]
pub struct Instruction {
    /// The opcode
    pub opcode: OpCode,
    /// The decoded operand
    pub operand: Operand,
}

impl Instruction {
    /// Creates an instruction with an operand.
    #[must_use]
    pub fn new(opcode: OpCode, operand: Operand) -> Self {
        Instruction { opcode, operand }
    }

    /// Creates an instruction without an operand.
    #[must_use]
    pub fn simple(opcode: OpCode) -> Self {
        Instruction {
            opcode,
            operand: Operand::None,
        }
    }

    /// Returns the metadata token operand, if there is one.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self.operand {
            Operand::Token(token) => Some(token),
            _ => None,
        }
    }

    /// Returns `true` for branch, leave and switch instructions.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.opcode.flow(),
            FlowType::ConditionalBranch
                | FlowType::UnconditionalBranch
                | FlowType::Leave
                | FlowType::Switch
        )
    }

    /// All instruction indices this instruction may transfer control to.
    #[must_use]
    pub fn targets(&self) -> Vec<usize> {
        match &self.operand {
            Operand::Target(target) => vec![*target],
            Operand::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Mutable access to every instruction index stored in the operand.
    pub(crate) fn targets_mut(&mut self) -> Vec<&mut usize> {
        match &mut self.operand {
            Operand::Target(target) => vec![target],
            Operand::Switch(targets) => targets.iter_mut().collect(),
            _ => Vec::new(),
        }
    }

    /// Encoded size in bytes given the current opcode and operand.
    #[must_use]
    pub fn size(&self) -> usize {
        let operand_size = match (&self.opcode.operand_type().size(), &self.operand) {
            (Some(size), _) => *size,
            (None, Operand::Switch(targets)) => 4 + 4 * targets.len(),
            (None, _) => 4,
        };

        self.opcode.size() + operand_size
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode.mnemonic())?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Immediate(Immediate::Int8(v)) => write!(f, " {v}"),
            Operand::Immediate(Immediate::UInt8(v)) => write!(f, " {v}"),
            Operand::Immediate(Immediate::Int32(v)) => write!(f, " {v}"),
            Operand::Immediate(Immediate::Int64(v)) => write!(f, " {v}"),
            Operand::Immediate(Immediate::Float32(v)) => write!(f, " {v}"),
            Operand::Immediate(Immediate::Float64(v)) => write!(f, " {v}"),
            Operand::Target(target) => write!(f, " IL_#{target}"),
            Operand::Switch(targets) => {
                let targets: Vec<String> = targets.iter().map(|t| format!("IL_#{t}")).collect();
                write!(f, " ({})", targets.join(", "))
            }
            Operand::Token(token) => write!(f, " {token}"),
            Operand::Local(index) => write!(f, " V_{index}"),
            Operand::Argument(index) => write!(f, " A_{index}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_sizes() {
        assert_eq!(Instruction::simple(OpCode::LDC_I4_1).size(), 1);
        assert_eq!(
            Instruction::new(OpCode::NEWOBJ, Operand::Token(Token::new(0x0A00_0001))).size(),
            5
        );
        assert_eq!(Instruction::new(OpCode::BR_S, Operand::Target(3)).size(), 2);
        assert_eq!(Instruction::new(OpCode::LDLOC, Operand::Local(300)).size(), 4);
        assert_eq!(
            Instruction::new(OpCode::SWITCH, Operand::Switch(vec![1, 2, 3])).size(),
            17
        );
    }

    #[test]
    fn branch_targets() {
        let mut branch = Instruction::new(OpCode::BRTRUE_S, Operand::Target(4));
        assert!(branch.is_branch());
        assert_eq!(branch.targets(), vec![4]);

        for target in branch.targets_mut() {
            *target += 1;
        }
        assert_eq!(branch.targets(), vec![5]);

        assert!(!Instruction::simple(OpCode::RET).is_branch());
    }

    #[test]
    fn display() {
        let ldstr = Instruction::new(OpCode::LDSTR, Operand::Token(Token::new(0x7000_0001)));
        assert_eq!(ldstr.to_string(), "ldstr 0x70000001");
        let ldloc = Instruction::new(OpCode::LDLOC_S, Operand::Local(4));
        assert_eq!(ldloc.to_string(), "ldloc.s V_4");
    }
}
