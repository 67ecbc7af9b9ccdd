#![deny(unsafe_code)]

//! UMKA – a bytecode runtime for a small dynamically-typed imperative
//! language with classes, methods, first-class arrays and a unified numeric
//! tower.
//!
//! The crate exposes three major building blocks:
//!
//! * [`bytecode`] – the instruction set, the per-function builder and the
//!   binary `.umka` file format.
//! * [`compiler`] – lowering from the parsed program to a loaded
//!   [`bytecode::Program`], including class/method/field id assignment.
//! * [`vm`] – the stack machine together with the garbage-collected heap
//!   ([`memory`]) and the background bytecode optimizer ([`jit`]).
//!
//! The lexer and parser are external collaborators; lowering starts from the
//! AST in [`compiler::ast`].

pub mod bytecode;
pub mod compiler;
pub mod jit;
pub mod memory;
pub mod vm;

use std::fmt;

use thiserror::Error;

use bytecode::Opcode;

/// Result type used across the crate.
pub type UmkaResult<T> = std::result::Result<T, UmkaError>;

/// Category of a fatal runtime or load-time failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unsupported operand combination, unknown opcode, non-comparable compare.
    Type,
    /// Array index out of range.
    Bounds,
    /// Integer division or remainder by zero.
    Arithmetic,
    /// The collector could not free enough memory.
    OutOfMemory,
    /// Unknown function, method or field at dispatch time.
    Resolution,
    /// A guest `assert` failed.
    Assertion,
    /// Host I/O failure.
    Io,
    /// Malformed bytecode file or unresolved label at build time.
    Parse,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Type => "type",
            ErrorKind::Bounds => "bounds",
            ErrorKind::Arithmetic => "arithmetic",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::Resolution => "resolution",
            ErrorKind::Assertion => "assertion",
            ErrorKind::Io => "io",
            ErrorKind::Parse => "parse",
        };
        f.write_str(name)
    }
}

/// Fatal error raised by the loader, the lowering pass or the interpreter.
///
/// Errors surfaced from the dispatch loop carry the instruction offset and
/// the opcode that was executing; load-time errors carry neither.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{kind} error: {message}{}", render_site(.offset, .opcode))]
pub struct UmkaError {
    pub kind: ErrorKind,
    pub message: String,
    pub offset: Option<usize>,
    pub opcode: Option<Opcode>,
}

fn render_site(offset: &Option<usize>, opcode: &Option<Opcode>) -> String {
    match (offset, opcode) {
        (Some(offset), Some(opcode)) => format!(" (at {offset}: {})", opcode.name()),
        (Some(offset), None) => format!(" (at {offset})"),
        _ => String::new(),
    }
}

impl UmkaError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            offset: None,
            opcode: None,
        }
    }

    /// Attaches the executing instruction site, keeping the innermost one.
    pub fn at(mut self, offset: usize, opcode: Opcode) -> Self {
        if self.offset.is_none() {
            self.offset = Some(offset);
            self.opcode = Some(opcode);
        }
        self
    }
}

impl From<std::io::Error> for UmkaError {
    fn from(err: std::io::Error) -> Self {
        UmkaError::new(ErrorKind::Io, err.to_string())
    }
}
