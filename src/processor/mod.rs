//! The functional core: compile layout scripts to bytecode and run them.
//!
//! [`compile`] turns a [`LayoutBoxList`](crate::model::LayoutBoxList) into a
//! [`Bytecode`] unit; a [`Reader`] executes it against a text provider.
pub mod blob;
pub mod bytecode;
pub mod content_view;
pub mod decimal;
pub mod error;
pub mod functions;
pub mod lexer;
pub mod script_parser;
pub mod units;
pub mod value;
pub mod variables;
pub mod vm;

pub use bytecode::{Bytecode, Instruction};
pub use error::{BytecodeError, LayoutError, ParseError, ReaderError, RuntimeError};
pub use functions::{FunctionLibrary, Locale};
pub use script_parser::{CompileOptions, compile};
pub use units::LoadedUnits;
pub use value::Value;
pub use vm::{HaltHandle, Reader, ReaderOptions, ReaderOutput, State};
