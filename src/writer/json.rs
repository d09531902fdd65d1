//! JSON rendering of a run's output.
//!
//! Numbers and dates are written through their display form so decimals
//! keep their exact text; null slots become `null`.

use std::fs;
use std::io;
use std::path::Path;

use crate::processor::vm::ReaderOutput;

pub fn to_string(output: &ReaderOutput) -> serde_json::Result<String> {
    serde_json::to_string_pretty(output)
}

pub fn emit(output: &ReaderOutput, path: &Path) -> io::Result<()> {
    fs::write(path, to_string(output)?)
}
