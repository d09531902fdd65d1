use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Layout file (.bls or .json), or compiled bytecode (.blc)
    pub layout: PathBuf,
    /// Plain-text pages to read; a single file is split on form feeds
    pub pages: Vec<PathBuf>,
    /// Write the compiled bytecode to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Print the disassembled bytecode instead of running it
    #[arg(long)]
    pub disasm: bool,
    /// Decimal point of the numbers in the document
    #[arg(long, default_value_t = '.')]
    pub decimal_point: char,
    /// Thousands separator of the numbers in the document
    #[arg(long)]
    pub thousands_sep: Option<char>,
    /// Stop as soon as a finder layout has chosen the layout of the document
    #[arg(long)]
    pub find_layout: bool,
    /// Annotate the bytecode with box names and source lines
    #[arg(long)]
    pub debug: bool,
    /// Raise the log level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
