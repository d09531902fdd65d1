pub mod cli;
pub mod document;
pub mod model;
pub mod parser;
pub mod processor;
pub mod writer;

use std::path::Path;

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;

use document::PlainTextDocument;
use processor::{
    Bytecode, CompileOptions, FunctionLibrary, LoadedUnits, Locale, Reader, ReaderOptions,
};

/// Extension of compiled bytecode files.
pub const BYTECODE_EXTENSION: &str = "blc";

fn log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn load_document(pages: &[std::path::PathBuf]) -> anyhow::Result<PlainTextDocument> {
    if let [single] = pages {
        return PlainTextDocument::open(single)
            .with_context(|| format!("Reading {}", single.display()));
    }
    let pages = pages
        .iter()
        .map(|p| std::fs::read_to_string(p).with_context(|| format!("Reading {}", p.display())))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(PlainTextDocument::from_pages(pages))
}

fn load_code(
    path: &Path,
    units: &mut LoadedUnits,
    library: &FunctionLibrary,
) -> anyhow::Result<Bytecode> {
    let compiled = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case(BYTECODE_EXTENSION));
    if compiled {
        return writer::bin::load(path).with_context(|| format!("Loading {}", path.display()));
    }
    let (_, code) = units
        .load(path, library)
        .with_context(|| format!("Compiling {}", path.display()))?;
    Ok(code)
}

pub fn run() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    simple_logger::SimpleLogger::new()
        .with_level(log_level(args.verbose))
        .init()
        .with_context(|| "Installing logger")?;

    // 1. ── Compile ────────────────────────────────────────────────────
    let library = FunctionLibrary::new();
    let mut units = LoadedUnits::new(CompileOptions { debug: args.debug });
    let code = load_code(&args.layout, &mut units, &library)?;

    // 2. ── Write outputs ──────────────────────────────────────────────
    if let Some(output) = &args.output {
        writer::bin::emit(&code, output)
            .with_context(|| format!("Writing {}", output.display()))?;
    }
    if args.disasm {
        print!("{}", writer::listing::render(&code));
        return Ok(());
    }
    if args.output.is_some() && args.pages.is_empty() {
        return Ok(());
    }

    // 3. ── Run ────────────────────────────────────────────────────────
    let document = load_document(&args.pages)?;
    let options = ReaderOptions {
        locale: Locale {
            decimal_point: args.decimal_point,
            thousands_sep: args
                .thousands_sep
                .or(Some(if args.decimal_point == ',' { '.' } else { ',' })),
        },
        find_layout: args.find_layout,
    };
    let mut reader = Reader::new(&library, &mut units, document, options);
    let output = reader
        .exec(code)
        .with_context(|| format!("Running {}", args.layout.display()))?;
    println!(
        "{}",
        writer::json::to_string(&output).with_context(|| "Rendering output")?
    );

    Ok(())
}
