//! Error types shared by the compiler, the VM and the bytecode codec.

use std::path::PathBuf;

use thiserror::Error;

use super::lexer::TokenKind;

/// Lexer / parser failure inside one script. `offset` is a byte offset into
/// the script source and is rendered into a location pointer by the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("invalid token `{text}`")]
    InvalidToken { offset: usize, text: String },

    #[error("unexpected `{text}`, expected {expected}")]
    UnexpectedToken {
        offset: usize,
        expected: TokenKind,
        found: TokenKind,
        text: String,
    },

    #[error("unexpected `{text}`")]
    Unexpected { offset: usize, text: String },

    #[error("`{name}` takes {expected} arguments, got {got}")]
    InvalidArgumentCount {
        offset: usize,
        name: String,
        expected: String,
        got: usize,
    },

    #[error("unknown function `{name}`")]
    UnknownFunction { offset: usize, name: String },

    #[error("`{what}` is not allowed in a read-only context")]
    ReadOnlyContext { offset: usize, what: String },

    #[error("prefix `{prefix}` used more than once")]
    DuplicatePrefix { offset: usize, prefix: char },

    #[error("no content view available here")]
    NoContentView { offset: usize },

    #[error("`{keyword}` outside of a loop")]
    NotInLoop { offset: usize, keyword: String },

    #[error("invalid number `{text}`")]
    InvalidNumber { offset: usize, text: String },

    #[error("invalid spacer `{name}`")]
    InvalidSpacer { offset: usize, name: String },
}

impl ParseError {
    pub fn offset(&self) -> usize {
        match self {
            ParseError::InvalidToken { offset, .. }
            | ParseError::UnexpectedToken { offset, .. }
            | ParseError::Unexpected { offset, .. }
            | ParseError::InvalidArgumentCount { offset, .. }
            | ParseError::UnknownFunction { offset, .. }
            | ParseError::ReadOnlyContext { offset, .. }
            | ParseError::DuplicatePrefix { offset, .. }
            | ParseError::NoContentView { offset }
            | ParseError::NotInLoop { offset, .. }
            | ParseError::InvalidNumber { offset, .. }
            | ParseError::InvalidSpacer { offset, .. } => *offset,
        }
    }
}

/// Failure to turn a layout (box list) into a compilation unit.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("box `{box_name}`: {source}\n{location}")]
    Box {
        box_name: String,
        #[source]
        source: ParseError,
        location: String,
    },

    #[error("unknown label `{0}`")]
    UnknownLabel(String),

    #[error("label `{0}` defined more than once")]
    DuplicateLabel(String),

    #[error("jump to label `{0}` is out of range")]
    JumpOutOfRange(String),

    #[error("cannot read `{path}`: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed layout `{path}`: {message}")]
    Format { path: PathBuf, message: String },
}

/// Fatal failure while executing bytecode.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Script(String),

    #[error("conversion error: {0}")]
    Conversion(String),

    #[error("no content view")]
    NoContentView,

    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("no variable selected")]
    NoSelection,

    #[error("`{name}` called with {got} arguments")]
    InvalidArgumentCount { name: String, got: usize },

    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("invalid regular expression `{pattern}`: {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("jump to unresolved label `{0}`")]
    UnresolvedLabel(String),

    #[error("jump outside of the program (target {0})")]
    BadJump(i64),

    #[error("import cycle through `{}`", .0.display())]
    ImportCycle(PathBuf),

    #[error("cannot import `{path}`: {source}")]
    Import {
        path: String,
        #[source]
        source: Box<LayoutError>,
    },

    #[error("execution aborted")]
    Aborted,
}

/// A [`RuntimeError`] annotated with where the VM was when it happened.
#[derive(Debug, Error)]
#[error("{}{source}", describe_position(.box_name.as_deref(), .line.as_deref()))]
pub struct ReaderError {
    pub box_name: Option<String>,
    pub line: Option<String>,
    #[source]
    pub source: RuntimeError,
}

fn describe_position(box_name: Option<&str>, line: Option<&str>) -> String {
    match (box_name, line) {
        (Some(name), Some(line)) => format!("box `{name}`, at `{line}`: "),
        (Some(name), None) => format!("box `{name}`: "),
        (None, Some(line)) => format!("at `{line}`: "),
        (None, None) => String::new(),
    }
}

/// Malformed binary bytecode.
#[derive(Debug, Error, PartialEq)]
pub enum BytecodeError {
    #[error("bad magic number")]
    BadMagic,

    #[error("unexpected end of data at byte {0}")]
    UnexpectedEof(usize),

    #[error("unknown opcode {tag:#04x} at byte {offset}")]
    UnknownOpcode { tag: u8, offset: usize },

    #[error("invalid operand at byte {0}")]
    InvalidOperand(usize),

    #[error("string pool entry {0} is not valid UTF-8")]
    InvalidUtf8(usize),

    #[error("string pool index {0} out of range")]
    BadStringIndex(u16),

    #[error("string of {0} bytes does not fit a 16-bit length")]
    StringTooLong(usize),

    #[error("too many distinct strings for the pool")]
    PoolOverflow,

    #[error("jump to unresolved label `{0}`")]
    UnresolvedLabel(String),

    #[error("trailing data after byte {0}")]
    TrailingData(usize),
}
