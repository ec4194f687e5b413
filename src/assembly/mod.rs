//! CIL instruction handling.
//!
//! This module turns raw method body code into an editable instruction sequence and back.
//!
//! # Architecture
//!
//! - [`opcodes`] - The ECMA-335 opcode table
//! - [`instruction`] - [`Instruction`], [`Operand`] and the operand/flow classifications
//! - [`decoder`] - Bytes to instructions, with branch targets as instruction indices
//! - [`encoder`] - Instructions to bytes, widening short branches where needed
//!
//! # Usage Examples
//!
//! ```rust
//! use cilpatch::assembly::{decode_stream, encode_stream, Instruction, OpCode};
//!
//! // ldstr; ldc.i4.3; newobj; ret
//! let code = [0x72, 0x01, 0x00, 0x00, 0x70, 0x19, 0x73, 0x02, 0x00, 0x00, 0x0A, 0x2A];
//! let mut instructions = decode_stream(&code)?;
//!
//! instructions.insert(2, Instruction::simple(OpCode::LDC_I4_1));
//! let patched = encode_stream(&instructions)?;
//! assert_eq!(patched.len(), code.len() + 1);
//! # Ok::<(), cilpatch::Error>(())
//! ```

pub mod decoder;
pub mod encoder;
pub mod instruction;
pub mod opcodes;

pub use decoder::{decode_instruction, decode_stream};
pub use encoder::encode_stream;
pub use instruction::{FlowType, Immediate, Instruction, Operand, OperandType};
pub use opcodes::{OpCode, FE_PREFIX};
