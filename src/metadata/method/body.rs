//! CIL method bodies.
//!
//! A [`MethodBody`] is parsed from the ECMA-335 tiny or fat format into an editable
//! instruction list plus exception clauses, both using instruction indices instead of
//! byte offsets. The original bytes are kept until the body is first edited, so bodies that
//! are never touched are written back exactly as they were read.
//!
//! # Examples
//!
//! ```rust
//! use cilpatch::assembly::{Instruction, OpCode};
//! use cilpatch::metadata::method::MethodBody;
//!
//! // tiny header, 3 bytes of code: ldarg.0; pop; ret
//! let mut body = MethodBody::parse(&[0x0E, 0x02, 0x26, 0x2A])?;
//! assert_eq!(body.instructions().len(), 3);
//! assert!(!body.is_modified());
//!
//! body.insert(1, Instruction::simple(OpCode::NOP))?;
//! assert_eq!(body.to_bytes()?, vec![0x12, 0x02, 0x00, 0x26, 0x2A]);
//! # Ok::<(), cilpatch::Error>(())
//! ```
//!
//! # References
//! - ECMA-335 6th Edition, Partition II, Section 25.4 - Common Intermediate Language Physical Layout

use crate::{
    assembly::{
        decoder::{decode_with_offsets, OffsetMap},
        encoder::encode_with_offsets,
        Instruction,
    },
    file::{io::push_le, parser::Parser},
    metadata::{
        method::{
            ExceptionHandler, ExceptionHandlerFlags, HandlerData, MethodBodyFlags, SectionFlags,
        },
        token::Token,
    },
    Error::OutOfBounds,
    Result,
};

/// Maximum code size that fits a tiny header
const TINY_MAX_CODE_SIZE: usize = 63;
/// Maximum evaluation stack depth implied by a tiny header
const TINY_MAX_STACK: u16 = 8;
/// Fat header size in 4-byte units
const FAT_HEADER_DWORDS: u16 = 3;

/// A decoded method body.
#[derive(Debug, Clone)]
pub struct MethodBody {
    /// Maximum evaluation stack depth
    pub max_stack: u16,
    /// Zero-initialize locals on entry
    pub init_locals: bool,
    /// `StandAloneSig` token of the local variable signature, null without locals
    pub local_var_sig_token: Token,
    instructions: Vec<Instruction>,
    exception_handlers: Vec<ExceptionHandler>,
    original: Option<Vec<u8>>,
}

impl MethodBody {
    /// Create a body without locals or exception clauses.
    #[must_use]
    pub fn new(max_stack: u16, instructions: Vec<Instruction>) -> Self {
        MethodBody {
            max_stack,
            init_locals: false,
            local_var_sig_token: Token::new(0),
            instructions,
            exception_handlers: Vec::new(),
            original: None,
        }
    }

    /// Attach exception clauses to a body under construction.
    #[must_use]
    pub fn with_exception_handlers(mut self, handlers: Vec<ExceptionHandler>) -> Self {
        self.exception_handlers = handlers;
        self.original = None;
        self
    }

    /// Attach a local variable signature to a body under construction.
    #[must_use]
    pub fn with_locals(mut self, local_var_sig_token: Token, init_locals: bool) -> Self {
        self.local_var_sig_token = local_var_sig_token;
        self.init_locals = init_locals;
        self.original = None;
        self
    }

    /// Parse a method body from its encoded bytes (header, code and data sections).
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for unknown header formats, undefined opcodes, or
    /// branches and clauses that do not land on instruction boundaries, and
    /// [`crate::Error::OutOfBounds`] when the body is truncated.
    pub fn parse(data: &[u8]) -> Result<MethodBody> {
        let mut parser = Parser::new(data);
        let first_byte = parser.peek_byte()?;

        let mut body = match MethodBodyFlags::from_bits_truncate(u16::from(first_byte & 0b11)) {
            MethodBodyFlags::TINY_FORMAT => {
                parser.seek(1)?;
                let code = parser.read_bytes(usize::from(first_byte >> 2))?;
                let (instructions, _) = decode_with_offsets(code)?;

                MethodBody::new(TINY_MAX_STACK, instructions)
            }
            MethodBodyFlags::FAT_FORMAT => {
                let first_duo = parser.read_le::<u16>()?;
                let size_header = usize::from(first_duo >> 12) * 4;
                if size_header < 12 {
                    return Err(malformed_error!(
                        "Fat method header size {} is too small",
                        size_header
                    ));
                }

                let flags = MethodBodyFlags::from_bits_truncate(first_duo & 0x0FFF);
                let max_stack = parser.read_le::<u16>()?;
                let size_code = parser.read_le::<u32>()? as usize;
                let local_var_sig_token = Token::new(parser.read_le::<u32>()?);

                parser.seek(size_header)?;
                let code = parser.read_bytes(size_code)?;
                let (instructions, offsets) = decode_with_offsets(code)?;

                let exception_handlers = if flags.contains(MethodBodyFlags::MORE_SECTS) {
                    parse_sections(&mut parser, &offsets)?
                } else {
                    Vec::new()
                };

                MethodBody {
                    max_stack,
                    init_locals: flags.contains(MethodBodyFlags::INIT_LOCALS),
                    local_var_sig_token,
                    instructions,
                    exception_handlers,
                    original: None,
                }
            }
            _ => {
                return Err(malformed_error!(
                    "MethodHeader is neither FAT nor TINY - {}",
                    first_byte
                ))
            }
        };

        body.original = Some(data[..parser.pos()].to_vec());
        Ok(body)
    }

    /// The instruction sequence.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// The exception clauses.
    #[must_use]
    pub fn exception_handlers(&self) -> &[ExceptionHandler] {
        &self.exception_handlers
    }

    /// Returns true once the body differs from the bytes it was parsed from.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.original.is_none()
    }

    /// Insert `instruction` at `index`, shifting the instructions from `index` on by one.
    ///
    /// Branch targets, switch targets and clause bounds greater than `index` move with the
    /// instructions they name. A reference equal to `index` stays put and therefore names
    /// the inserted instruction, so code that jumped to the old instruction now runs the
    /// inserted one first.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `index` is beyond the end of the sequence.
    pub fn insert(&mut self, index: usize, instruction: Instruction) -> Result<()> {
        if index > self.instructions.len() {
            return Err(OutOfBounds);
        }

        let shift = |reference: &mut usize| {
            if *reference > index {
                *reference += 1;
            }
        };

        for existing in &mut self.instructions {
            existing.targets_mut().into_iter().for_each(shift);
        }
        for handler in &mut self.exception_handlers {
            handler.indices_mut().into_iter().for_each(shift);
        }

        self.instructions.insert(index, instruction);
        self.original = None;
        Ok(())
    }

    /// Replace the instruction at `index`, returning the previous one.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if there is no instruction at `index`.
    pub fn replace(&mut self, index: usize, instruction: Instruction) -> Result<Instruction> {
        let slot = self.instructions.get_mut(index).ok_or(OutOfBounds)?;
        let previous = std::mem::replace(slot, instruction);
        self.original = None;
        Ok(previous)
    }

    /// Raise the declared maximum stack depth by `additional` slots.
    pub fn grow_max_stack(&mut self, additional: u16) {
        self.max_stack = self.max_stack.saturating_add(additional);
        self.original = None;
    }

    /// Encode the body: the original bytes if unmodified, a fresh encoding otherwise.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if an instruction or clause cannot be encoded.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match &self.original {
            Some(original) => Ok(original.clone()),
            None => self.encode(),
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let (code, offsets) = encode_with_offsets(&self.instructions)?;

        let tiny = code.len() <= TINY_MAX_CODE_SIZE
            && self.max_stack <= TINY_MAX_STACK
            && self.local_var_sig_token.is_null()
            && !self.init_locals
            && self.exception_handlers.is_empty();

        let mut buffer = Vec::with_capacity(code.len() + 12);
        if tiny {
            // code.len() <= 63, so the shift cannot overflow
            #[allow(clippy::cast_possible_truncation)]
            buffer.push((code.len() as u8) << 2 | MethodBodyFlags::TINY_FORMAT.bits() as u8);
            buffer.extend_from_slice(&code);
            return Ok(buffer);
        }

        let mut flags = MethodBodyFlags::FAT_FORMAT;
        if !self.exception_handlers.is_empty() {
            flags |= MethodBodyFlags::MORE_SECTS;
        }
        if self.init_locals {
            flags |= MethodBodyFlags::INIT_LOCALS;
        }

        let size_code = u32::try_from(code.len())
            .map_err(|_| malformed_error!("Method code of {} bytes is too large", code.len()))?;

        push_le(&mut buffer, flags.bits() | FAT_HEADER_DWORDS << 12);
        push_le(&mut buffer, self.max_stack);
        push_le(&mut buffer, size_code);
        push_le(&mut buffer, self.local_var_sig_token.value());
        buffer.extend_from_slice(&code);

        if !self.exception_handlers.is_empty() {
            while buffer.len() % 4 != 0 {
                buffer.push(0);
            }
            self.encode_exception_section(&offsets, &mut buffer)?;
        }

        Ok(buffer)
    }

    fn encode_exception_section(&self, offsets: &[usize], buffer: &mut Vec<u8>) -> Result<()> {
        let mut clauses = Vec::with_capacity(self.exception_handlers.len());
        for handler in &self.exception_handlers {
            clauses.push(ClauseLayout::new(handler, offsets)?);
        }

        let small_size = 4 + 12 * clauses.len();
        let small = small_size <= usize::from(u8::MAX) && clauses.iter().all(ClauseLayout::fits_small);

        if small {
            push_le(buffer, SectionFlags::EHTABLE.bits());
            #[allow(clippy::cast_possible_truncation)]
            push_le(buffer, small_size as u8);
            push_le(buffer, 0u16);

            for clause in &clauses {
                // fits_small checked every narrowing below
                #[allow(clippy::cast_possible_truncation)]
                {
                    push_le(buffer, clause.flags);
                    push_le(buffer, clause.try_offset as u16);
                    push_le(buffer, clause.try_length as u8);
                    push_le(buffer, clause.handler_offset as u16);
                    push_le(buffer, clause.handler_length as u8);
                    push_le(buffer, clause.data);
                }
            }
        } else {
            let fat_size = 4 + 24 * clauses.len();
            if fat_size > 0x00FF_FFFF {
                return Err(malformed_error!(
                    "Too many exception clauses - {}",
                    clauses.len()
                ));
            }

            push_le(
                buffer,
                (SectionFlags::EHTABLE | SectionFlags::FAT_FORMAT).bits(),
            );
            #[allow(clippy::cast_possible_truncation)]
            {
                push_le(buffer, fat_size as u8);
                push_le(buffer, (fat_size >> 8) as u16);
            }

            for clause in &clauses {
                push_le(buffer, u32::from(clause.flags));
                push_le(buffer, clause.try_offset);
                push_le(buffer, clause.try_length);
                push_le(buffer, clause.handler_offset);
                push_le(buffer, clause.handler_length);
                push_le(buffer, clause.data);
            }
        }

        Ok(())
    }
}

/// Byte layout of one exception clause.
struct ClauseLayout {
    flags: u16,
    try_offset: u32,
    try_length: u32,
    handler_offset: u32,
    handler_length: u32,
    data: u32,
}

impl ClauseLayout {
    fn new(handler: &ExceptionHandler, offsets: &[usize]) -> Result<Self> {
        let offset = |index: usize| -> Result<u32> {
            let offset = offsets.get(index).ok_or_else(|| {
                malformed_error!("Exception clause references instruction {}", index)
            })?;
            u32::try_from(*offset).map_err(|_| malformed_error!("Clause offset out of range"))
        };

        let try_offset = offset(handler.try_start)?;
        let handler_offset = offset(handler.handler_start)?;
        let try_length = offset(handler.try_end)?
            .checked_sub(try_offset)
            .ok_or_else(|| malformed_error!("Try range ends before it starts"))?;
        let handler_length = offset(handler.handler_end)?
            .checked_sub(handler_offset)
            .ok_or_else(|| malformed_error!("Handler range ends before it starts"))?;

        let data = match handler.data {
            HandlerData::ClassToken(token) => token.value(),
            HandlerData::FilterStart(index) => offset(index)?,
            HandlerData::Raw(value) => value,
        };

        Ok(ClauseLayout {
            flags: handler.flags.bits(),
            try_offset,
            try_length,
            handler_offset,
            handler_length,
            data,
        })
    }

    fn fits_small(&self) -> bool {
        self.try_offset <= u32::from(u16::MAX)
            && self.handler_offset <= u32::from(u16::MAX)
            && self.try_length <= u32::from(u8::MAX)
            && self.handler_length <= u32::from(u8::MAX)
    }
}

fn parse_sections(parser: &mut Parser, offsets: &OffsetMap) -> Result<Vec<ExceptionHandler>> {
    let mut handlers = Vec::new();

    loop {
        parser.align(4)?;
        let section = SectionFlags::from_bits_retain(parser.read_le::<u8>()?);

        let fat = section.contains(SectionFlags::FAT_FORMAT);
        let size = if fat {
            let low = u32::from(parser.read_le::<u8>()?);
            let high = u32::from(parser.read_le::<u16>()?);
            (high << 8 | low) as usize
        } else {
            let size = usize::from(parser.read_le::<u8>()?);
            parser.read_le::<u16>()?;
            size
        };

        if size < 4 {
            return Err(malformed_error!("Method data section of {} bytes", size));
        }

        if section.contains(SectionFlags::EHTABLE) {
            let clause_size = if fat { 24 } else { 12 };
            for _ in 0..(size - 4) / clause_size {
                handlers.push(parse_clause(parser, fat, offsets)?);
            }
        } else {
            parser.read_bytes(size - 4)?;
        }

        if !section.contains(SectionFlags::MORE_SECTS) {
            return Ok(handlers);
        }
    }
}

fn parse_clause(parser: &mut Parser, fat: bool, offsets: &OffsetMap) -> Result<ExceptionHandler> {
    let (flags, try_offset, try_length, handler_offset, handler_length) = if fat {
        // Clause kinds only use the low bits
        #[allow(clippy::cast_possible_truncation)]
        let flags = parser.read_le::<u32>()? as u16;
        (
            flags,
            parser.read_le::<u32>()?,
            parser.read_le::<u32>()?,
            parser.read_le::<u32>()?,
            parser.read_le::<u32>()?,
        )
    } else {
        (
            parser.read_le::<u16>()?,
            u32::from(parser.read_le::<u16>()?),
            u32::from(parser.read_le::<u8>()?),
            u32::from(parser.read_le::<u16>()?),
            u32::from(parser.read_le::<u8>()?),
        )
    };
    let raw_data = parser.read_le::<u32>()?;

    let index = |offset: u32| -> Result<usize> {
        offsets.get(&(offset as usize)).copied().ok_or_else(|| {
            malformed_error!(
                "Exception clause offset {} is not an instruction boundary",
                offset
            )
        })
    };
    let end = |offset: u32, length: u32| -> Result<usize> {
        let end = offset
            .checked_add(length)
            .ok_or_else(|| malformed_error!("Exception clause range overflows"))?;
        index(end)
    };

    let flags = ExceptionHandlerFlags::from_bits_retain(flags);
    let data = if flags.contains(ExceptionHandlerFlags::FILTER) {
        HandlerData::FilterStart(index(raw_data)?)
    } else if flags.is_empty() {
        HandlerData::ClassToken(Token::new(raw_data))
    } else {
        HandlerData::Raw(raw_data)
    };

    Ok(ExceptionHandler {
        flags,
        try_start: index(try_offset)?,
        try_end: end(try_offset, try_length)?,
        handler_start: index(handler_offset)?,
        handler_end: end(handler_offset, handler_length)?,
        data,
    })
}
