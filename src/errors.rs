// File: src/errors.rs
//
// Error handling and reporting for the depyc decompiler.
// Provides structured error types carrying the bytecode position at which
// decoding failed, and pretty-printed terminal diagnostics.

use colored::Colorize;
use std::fmt;

/// Where in the input an error was detected: a byte offset into either the
/// marshal stream or a code object's instruction buffer, plus the name of
/// the scope being decompiled when known.
#[derive(Debug, Clone, PartialEq)]
pub struct BytePos {
    pub offset: usize,
    pub scope: Option<String>,
}

impl BytePos {
    pub fn new(offset: usize) -> Self {
        Self { offset, scope: None }
    }

    pub fn in_scope(offset: usize, scope: impl Into<String>) -> Self {
        Self { offset, scope: Some(scope.into()) }
    }

    pub fn unknown() -> Self {
        Self { offset: 0, scope: None }
    }
}

impl fmt::Display for BytePos {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref scope) = self.scope {
            write!(f, "offset {:#06x} in {}", self.offset, scope)
        } else {
            write!(f, "offset {:#06x}", self.offset)
        }
    }
}

/// Types of errors that can occur while decompiling.
///
/// Fatal kinds abort the current module; soft kinds mark the build dirty
/// and decoding continues with a placeholder node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The .pyc magic word is not one we recognize.
    BadMagic,
    /// The magic word is valid but the bytecode format is not supported.
    UnsupportedVersion,
    /// The marshal stream or instruction buffer ended mid-value.
    TruncatedStream,
    /// An unknown marshal type code or malformed object graph.
    BadMarshal,
    /// A numeric opcode with no mapping for the current version.
    UnknownOpcode,
    /// A constant / name / varname index past the end of its pool.
    BadPoolIndex,
    /// Closing a block would pop the module-level block.
    BlockUnderflow,
    /// A handler needed more values than the simulated stack holds.
    StackUnderflow,
    /// A compiler idiom the engine does not recognize.
    UnrecognizedIdiom,
    /// Underlying file I/O failure.
    Io,
}

impl ErrorKind {
    /// Soft errors set the dirty flag and decoding continues; everything
    /// else aborts the current module.
    pub fn is_fatal(self) -> bool {
        !matches!(self, ErrorKind::StackUnderflow | ErrorKind::UnrecognizedIdiom)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::BadMagic => write!(f, "Bad Magic"),
            ErrorKind::UnsupportedVersion => write!(f, "Unsupported Version"),
            ErrorKind::TruncatedStream => write!(f, "Truncated Stream"),
            ErrorKind::BadMarshal => write!(f, "Bad Marshal Data"),
            ErrorKind::UnknownOpcode => write!(f, "Unknown Opcode"),
            ErrorKind::BadPoolIndex => write!(f, "Bad Pool Index"),
            ErrorKind::BlockUnderflow => write!(f, "Block Underflow"),
            ErrorKind::StackUnderflow => write!(f, "Stack Underflow"),
            ErrorKind::UnrecognizedIdiom => write!(f, "Unrecognized Idiom"),
            ErrorKind::Io => write!(f, "I/O Error"),
        }
    }
}

/// A structured decompilation error with position information.
#[derive(Debug, Clone)]
pub struct DecompileError {
    pub kind: ErrorKind,
    pub message: String,
    pub position: BytePos,
    pub note: Option<String>,
}

impl DecompileError {
    pub fn new(kind: ErrorKind, message: String, position: BytePos) -> Self {
        Self { kind, message, position, note: None }
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.note = Some(note);
        self
    }

    /// Create a bad-magic error for an unrecognized .pyc header word.
    pub fn bad_magic(magic: u32) -> Self {
        Self::new(
            ErrorKind::BadMagic,
            format!("unrecognized pyc magic {:#010x}", magic),
            BytePos::new(0),
        )
    }

    /// Create a truncated-stream error at the given offset.
    pub fn truncated(offset: usize, what: &str) -> Self {
        Self::new(
            ErrorKind::TruncatedStream,
            format!("stream ended while reading {}", what),
            BytePos::new(offset),
        )
    }

    /// Create a bad-marshal error at the given offset.
    pub fn bad_marshal(offset: usize, message: String) -> Self {
        Self::new(ErrorKind::BadMarshal, message, BytePos::new(offset))
    }

    /// Create an unknown-opcode error at the given instruction offset.
    pub fn unknown_opcode(opcode: u8, position: BytePos) -> Self {
        Self::new(
            ErrorKind::UnknownOpcode,
            format!("no opcode {:#04x} in this bytecode version", opcode),
            position,
        )
    }

    /// Create a stack-underflow (soft) error.
    pub fn stack_underflow(position: BytePos) -> Self {
        Self::new(
            ErrorKind::StackUnderflow,
            "value stack exhausted".to_string(),
            position,
        )
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl fmt::Display for DecompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // One diagnostic line, positioned in the bytecode rather than in
        // source text: "depyc: Bad Magic: <message> [<position>]".
        write!(
            f,
            "{} {} {} [{}]",
            "depyc:".bold(),
            format!("{}:", self.kind).red().bold(),
            self.message,
            format!("{}", self.position).bright_blue()
        )?;
        if let Some(ref note) = self.note {
            write!(f, "\n  note: {}", note.bright_cyan())?;
        }
        Ok(())
    }
}

impl std::error::Error for DecompileError {}

impl From<std::io::Error> for DecompileError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, err.to_string(), BytePos::unknown())
    }
}

pub type Result<T> = std::result::Result<T, DecompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ErrorKind::BadMagic.is_fatal());
        assert!(ErrorKind::BlockUnderflow.is_fatal());
        assert!(!ErrorKind::StackUnderflow.is_fatal());
        assert!(!ErrorKind::UnrecognizedIdiom.is_fatal());
    }

    #[test]
    fn test_position_display() {
        let pos = BytePos::in_scope(0x2a, "f");
        assert_eq!(format!("{}", pos), "offset 0x002a in f");
    }
}
