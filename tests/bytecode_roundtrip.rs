use std::path::Path;

use pretty_assertions::assert_eq;

use layoutvm_rust::document::PlainTextDocument;
use layoutvm_rust::processor::blob::{decode, encode};
use layoutvm_rust::processor::{
    BytecodeError, CompileOptions, FunctionLibrary, Instruction, LoadedUnits, Locale, Reader,
    ReaderOptions,
};
use layoutvm_rust::writer::listing;

fn compiled(debug: bool) -> layoutvm_rust::processor::Bytecode {
    let library = FunctionLibrary::new();
    let mut units = LoadedUnits::new(CompileOptions { debug });
    units
        .load(Path::new("tests/fixtures/invoice.bls"), &library)
        .unwrap()
        .1
}

#[test]
fn compiled_layout_survives_the_binary_format() {
    for debug in [false, true] {
        let code = compiled(debug);
        let data = encode(&code).unwrap();
        assert_eq!(&data[..4], b"BLS\x01");
        assert_eq!(decode(&data).unwrap(), code);
        let has_comments = code.iter().any(|i| matches!(i, Instruction::Comment(_)));
        assert_eq!(has_comments, debug);
    }
}

#[test]
fn decoded_program_runs_like_the_compiled_one() {
    let library = FunctionLibrary::new();
    let text = std::fs::read_to_string("tests/fixtures/invoice.txt").unwrap();
    let locale = Locale {
        decimal_point: ',',
        thousands_sep: Some('.'),
    };
    let run = |code| {
        let mut units = LoadedUnits::default();
        let mut reader = Reader::new(&library, &mut units, PlainTextDocument::new(&text), ReaderOptions { locale, ..ReaderOptions::default() });
        reader.exec(code).unwrap()
    };
    let code = compiled(false);
    let decoded = decode(&encode(&code).unwrap()).unwrap();
    assert_eq!(run(decoded), run(code));
}

#[test]
fn listing_has_one_line_per_instruction() {
    let code = compiled(true);
    let text = listing::render(&code);
    assert_eq!(text.lines().count(), code.len());
    assert!(text.lines().next().unwrap().contains("ADDLAYOUT"), "{text}");
}

#[test]
fn truncated_data_is_rejected() {
    let data = encode(&compiled(false)).unwrap();
    for len in [0, 3, 11, data.len() - 1] {
        assert!(decode(&data[..len]).is_err(), "length {len}");
    }
    let mut bad = data.clone();
    bad[0] = b'X';
    assert_eq!(decode(&bad).unwrap_err(), BytecodeError::BadMagic);
}
