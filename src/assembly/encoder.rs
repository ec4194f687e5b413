//! CIL bytecode encoding.
//!
//! [`encode_stream`] is the reverse of [`crate::assembly::decode_stream`]: it lays out an
//! instruction sequence, converts index-based branch targets back into byte displacements
//! and emits the code block.
//!
//! Inserting instructions can push a short branch (`br.s`, `brtrue.s`, `leave.s`, ...)
//! beyond the reach of its signed 8-bit displacement. The layout pass detects this and
//! widens such branches to their 32-bit forms, repeating until every displacement fits.
//! Short branches that still fit are emitted unchanged.

use crate::{
    assembly::{
        instruction::{Immediate, Instruction, Operand, OperandType},
        opcodes::OpCode,
    },
    file::io::push_le,
    Result,
};

/// Encode an instruction sequence into a CIL code block.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if an operand does not match its opcode's operand
/// kind, a target index lies beyond the end of the sequence, or an index does not fit its
/// encoding.
pub fn encode_stream(instructions: &[Instruction]) -> Result<Vec<u8>> {
    encode_with_offsets(instructions).map(|(code, _)| code)
}

/// Like [`encode_stream`], additionally returning the byte offset of every instruction plus
/// the end offset of the block (`instructions.len() + 1` entries).
pub(crate) fn encode_with_offsets(instructions: &[Instruction]) -> Result<(Vec<u8>, Vec<usize>)> {
    for (index, instruction) in instructions.iter().enumerate() {
        if let Some(target) = instruction
            .targets()
            .into_iter()
            .find(|target| *target > instructions.len())
        {
            return Err(malformed_error!(
                "Instruction {} targets index {} beyond the end of the body",
                index,
                target
            ));
        }
    }

    let opcodes = layout(instructions);
    let offsets = offsets_for(instructions, &opcodes);

    let mut code = Vec::with_capacity(offsets[instructions.len()]);
    for (index, instruction) in instructions.iter().enumerate() {
        let opcode = opcodes[index];
        if opcode.size() == 2 {
            code.push(opcode.prefix());
        }
        code.push(opcode.value());

        let next = offsets[index + 1];
        emit_operand(&mut code, opcode, &instruction.operand, &offsets, next)?;
    }

    Ok((code, offsets))
}

/// Pick final opcodes, widening short branches whose displacement does not fit in an `i8`.
fn layout(instructions: &[Instruction]) -> Vec<OpCode> {
    let mut opcodes: Vec<OpCode> = instructions.iter().map(|i| i.opcode).collect();

    loop {
        let offsets = offsets_for(instructions, &opcodes);
        let mut widened = false;

        for (index, instruction) in instructions.iter().enumerate() {
            if opcodes[index].operand_type() != OperandType::ShortTarget {
                continue;
            }

            let Operand::Target(target) = instruction.operand else {
                continue;
            };

            let displacement = offsets[target] as i64 - offsets[index + 1] as i64;
            if i8::try_from(displacement).is_err() {
                if let Some(long) = opcodes[index].long_branch_form() {
                    opcodes[index] = long;
                    widened = true;
                }
            }
        }

        // Widening only grows instructions, so this terminates
        if !widened {
            return opcodes;
        }
    }
}

fn offsets_for(instructions: &[Instruction], opcodes: &[OpCode]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(instructions.len() + 1);
    let mut offset = 0;
    for (instruction, opcode) in instructions.iter().zip(opcodes) {
        offsets.push(offset);
        offset += Instruction::new(*opcode, instruction.operand.clone()).size();
    }
    offsets.push(offset);
    offsets
}

fn emit_operand(
    code: &mut Vec<u8>,
    opcode: OpCode,
    operand: &Operand,
    offsets: &[usize],
    next: usize,
) -> Result<()> {
    let displacement = |target: usize| offsets[target] as i64 - next as i64;

    match (opcode.operand_type(), operand) {
        (OperandType::None, Operand::None) => {}
        (OperandType::Int8, Operand::Immediate(Immediate::Int8(value))) => push_le(code, *value),
        (OperandType::UInt8, Operand::Immediate(Immediate::UInt8(value))) => push_le(code, *value),
        (OperandType::Int32, Operand::Immediate(Immediate::Int32(value))) => push_le(code, *value),
        (OperandType::Int64, Operand::Immediate(Immediate::Int64(value))) => push_le(code, *value),
        (OperandType::Float32, Operand::Immediate(Immediate::Float32(value))) => {
            push_le(code, *value);
        }
        (OperandType::Float64, Operand::Immediate(Immediate::Float64(value))) => {
            push_le(code, *value);
        }
        (OperandType::ShortTarget, Operand::Target(target)) => {
            let value = i8::try_from(displacement(*target))
                .map_err(|_| malformed_error!("Short branch displacement out of range"))?;
            push_le(code, value);
        }
        (OperandType::Target, Operand::Target(target)) => {
            let value = i32::try_from(displacement(*target))
                .map_err(|_| malformed_error!("Branch displacement out of range"))?;
            push_le(code, value);
        }
        (OperandType::Token, Operand::Token(token)) => push_le(code, token.value()),
        (OperandType::Switch, Operand::Switch(targets)) => {
            let count = u32::try_from(targets.len())
                .map_err(|_| malformed_error!("Switch table too large"))?;
            push_le(code, count);
            for target in targets {
                let value = i32::try_from(displacement(*target))
                    .map_err(|_| malformed_error!("Switch displacement out of range"))?;
                push_le(code, value);
            }
        }
        (OperandType::ShortLocal, Operand::Local(index))
        | (OperandType::ShortArgument, Operand::Argument(index)) => {
            let value = u8::try_from(*index)
                .map_err(|_| malformed_error!("Index {} does not fit {}", index, opcode))?;
            push_le(code, value);
        }
        (OperandType::Local, Operand::Local(index))
        | (OperandType::Argument, Operand::Argument(index)) => push_le(code, *index),
        (_, operand) => {
            return Err(malformed_error!(
                "Operand {:?} does not match opcode {}",
                operand,
                opcode
            ))
        }
    }

    Ok(())
}
