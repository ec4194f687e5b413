//! Exception handling clauses of a method body.
//!
//! Clause ranges are held as instruction indices, like branch targets, so that they move
//! together with the instructions they protect when a body is edited. `*_end` indices are
//! exclusive and may equal the instruction count.

use bitflags::bitflags;

use crate::metadata::token::Token;

bitflags! {
    /// Exception handler flags defining the type of exception handling clause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed exception clause; the handler catches `class_token`.
        const EXCEPTION = 0x0000;
        /// A filter clause; the filter code starts at `filter_start`.
        const FILTER = 0x0001;
        /// A finally clause.
        const FINALLY = 0x0002;
        /// A fault clause (finally that executes only on exception).
        const FAULT = 0x0004;
    }
}

/// The clause-specific value stored after the handler range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerData {
    /// Caught exception type of an `EXCEPTION` clause
    ClassToken(Token),
    /// First instruction of the filter of a `FILTER` clause
    FilterStart(usize),
    /// Raw value of `FINALLY` and `FAULT` clauses (normally 0)
    Raw(u32),
}

/// One try block and its handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Clause kind
    pub flags: ExceptionHandlerFlags,
    /// First protected instruction
    pub try_start: usize,
    /// One past the last protected instruction
    pub try_end: usize,
    /// First handler instruction
    pub handler_start: usize,
    /// One past the last handler instruction
    pub handler_end: usize,
    /// Caught type, filter start or raw value depending on `flags`
    pub data: HandlerData,
}

impl ExceptionHandler {
    /// Mutable access to every instruction index stored in the clause.
    pub(crate) fn indices_mut(&mut self) -> Vec<&mut usize> {
        let mut indices = vec![
            &mut self.try_start,
            &mut self.try_end,
            &mut self.handler_start,
            &mut self.handler_end,
        ];
        if let HandlerData::FilterStart(start) = &mut self.data {
            indices.push(start);
        }
        indices
    }
}
