//! CIL bytecode decoding.
//!
//! [`decode_instruction`] reads one instruction at the parser's position. [`decode_stream`]
//! decodes a complete method body code block and converts every branch and switch
//! displacement into the index of the target instruction, so the result can be edited
//! without recomputing byte offsets by hand.
//!
//! # Example
//!
//! ```rust
//! use cilpatch::assembly::{decode_stream, OpCode, Operand};
//!
//! // ldc.i4.0; brtrue.s +1; nop; ret
//! let code = [0x16, 0x2D, 0x01, 0x00, 0x2A];
//! let instructions = decode_stream(&code)?;
//!
//! assert_eq!(instructions.len(), 4);
//! assert_eq!(instructions[1].opcode, OpCode::BRTRUE_S);
//! assert_eq!(instructions[1].operand, Operand::Target(3));
//! # Ok::<(), cilpatch::Error>(())
//! ```

use std::collections::HashMap;

use crate::{
    assembly::{
        instruction::{Immediate, Instruction, Operand, OperandType},
        opcodes::{OpCode, FE_PREFIX},
    },
    file::parser::Parser,
    metadata::token::Token,
    Result,
};

/// Maps byte offsets inside a code block to instruction indices.
///
/// Contains one entry per instruction start plus one for the end of the code block, which
/// maps to the instruction count.
pub type OffsetMap = HashMap<usize, usize>;

/// Decode a single instruction at the parser's current position.
///
/// Branch and switch operands are returned as absolute byte offsets within the code block
/// (`Operand::Target` / `Operand::Switch`); [`decode_stream`] turns them into indices.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for undefined opcodes and [`crate::Error::OutOfBounds`]
/// for truncated operands.
pub fn decode_instruction(parser: &mut Parser) -> Result<Instruction> {
    let offset = parser.pos();
    let first_byte = parser.read_le::<u8>()?;

    let opcode = if first_byte == FE_PREFIX {
        let second_byte = parser.read_le::<u8>()?;
        match OpCode::from_bytes(FE_PREFIX, second_byte) {
            Some(opcode) => opcode,
            None => return Err(malformed_error!("Invalid opcode: FE {:02X}", second_byte)),
        }
    } else {
        match OpCode::from_bytes(0x00, first_byte) {
            Some(opcode) => opcode,
            None => return Err(malformed_error!("Invalid opcode: {:02X}", first_byte)),
        }
    };

    let operand = match opcode.operand_type() {
        OperandType::None => Operand::None,
        OperandType::Int8 => Operand::Immediate(Immediate::Int8(parser.read_le::<i8>()?)),
        OperandType::UInt8 => Operand::Immediate(Immediate::UInt8(parser.read_le::<u8>()?)),
        OperandType::Int32 => Operand::Immediate(Immediate::Int32(parser.read_le::<i32>()?)),
        OperandType::Int64 => Operand::Immediate(Immediate::Int64(parser.read_le::<i64>()?)),
        OperandType::Float32 => Operand::Immediate(Immediate::Float32(parser.read_le::<f32>()?)),
        OperandType::Float64 => Operand::Immediate(Immediate::Float64(parser.read_le::<f64>()?)),
        OperandType::ShortTarget => {
            let displacement = i64::from(parser.read_le::<i8>()?);
            Operand::Target(absolute_target(offset, parser.pos(), displacement)?)
        }
        OperandType::Target => {
            let displacement = i64::from(parser.read_le::<i32>()?);
            Operand::Target(absolute_target(offset, parser.pos(), displacement)?)
        }
        OperandType::Token => Operand::Token(Token::new(parser.read_le::<u32>()?)),
        OperandType::Switch => {
            let case_count = parser.read_le::<u32>()? as usize;
            if case_count.saturating_mul(4) > parser.remaining() {
                return Err(malformed_error!(
                    "Switch at offset {} declares {} cases beyond the code block",
                    offset,
                    case_count
                ));
            }

            let mut displacements = Vec::with_capacity(case_count);
            for _ in 0..case_count {
                displacements.push(i64::from(parser.read_le::<i32>()?));
            }

            let next = parser.pos();
            let targets = displacements
                .into_iter()
                .map(|displacement| absolute_target(offset, next, displacement))
                .collect::<Result<Vec<_>>>()?;
            Operand::Switch(targets)
        }
        OperandType::ShortLocal => Operand::Local(u16::from(parser.read_le::<u8>()?)),
        OperandType::Local => Operand::Local(parser.read_le::<u16>()?),
        OperandType::ShortArgument => Operand::Argument(u16::from(parser.read_le::<u8>()?)),
        OperandType::Argument => Operand::Argument(parser.read_le::<u16>()?),
    };

    Ok(Instruction { opcode, operand })
}

/// Decode a complete code block into an instruction sequence with index-based targets.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if an opcode is undefined or a branch lands outside
/// the block or in the middle of an instruction.
pub fn decode_stream(code: &[u8]) -> Result<Vec<Instruction>> {
    decode_with_offsets(code).map(|(instructions, _)| instructions)
}

/// Like [`decode_stream`], additionally returning the offset-to-index map used to translate
/// exception clause ranges.
pub(crate) fn decode_with_offsets(code: &[u8]) -> Result<(Vec<Instruction>, OffsetMap)> {
    let mut parser = Parser::new(code);
    let mut instructions = Vec::new();
    let mut offsets = OffsetMap::new();

    while parser.has_more_data() {
        offsets.insert(parser.pos(), instructions.len());
        instructions.push(decode_instruction(&mut parser)?);
    }
    offsets.insert(code.len(), instructions.len());

    for (index, instruction) in instructions.iter_mut().enumerate() {
        for target in instruction.targets_mut() {
            *target = match offsets.get(target) {
                Some(target_index) => *target_index,
                None => {
                    return Err(malformed_error!(
                        "Branch of instruction {} targets offset {} which is not an instruction boundary",
                        index,
                        target
                    ))
                }
            };
        }
    }

    Ok((instructions, offsets))
}

fn absolute_target(offset: usize, next: usize, displacement: i64) -> Result<usize> {
    let target = next as i64 + displacement;
    usize::try_from(target)
        .map_err(|_| malformed_error!("Branch at offset {} targets {}", offset, target))
}
