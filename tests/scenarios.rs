use std::path::Path;

use pretty_assertions::assert_eq;

use layoutvm_rust::document::PlainTextDocument;
use layoutvm_rust::model::{BoxKind, LayoutBox, LayoutBoxList};
use layoutvm_rust::processor::{
    CompileOptions, FunctionLibrary, LayoutError, LoadedUnits, Locale, ParseError, Reader,
    ReaderError, ReaderOptions, ReaderOutput, RuntimeError, Value, compile,
};

fn italian() -> Locale {
    Locale {
        decimal_point: ',',
        thousands_sep: Some('.'),
    }
}

fn page_box(name: &str, script: &str) -> LayoutBox {
    LayoutBox {
        name: name.into(),
        kind: BoxKind::Page,
        script: script.into(),
        ..LayoutBox::default()
    }
}

fn run_boxes(text: &str, boxes: Vec<LayoutBox>, locale: Locale) -> Result<ReaderOutput, ReaderError> {
    let library = FunctionLibrary::new();
    let code = compile(
        Path::new("scenario"),
        &LayoutBoxList::new(boxes),
        &library,
        CompileOptions::default(),
    )
    .unwrap();
    let mut units = LoadedUnits::default();
    let mut reader = Reader::new(&library, &mut units, PlainTextDocument::new(text), ReaderOptions { locale, ..ReaderOptions::default() });
    reader.exec(code)
}

fn run_script(text: &str, script: &str) -> ReaderOutput {
    run_boxes(text, vec![page_box("main", script)], Locale::default()).unwrap()
}

fn run_file(layout: &str, text: &str, locale: Locale) -> Result<ReaderOutput, ReaderError> {
    let library = FunctionLibrary::new();
    let mut units = LoadedUnits::new(CompileOptions { debug: true });
    let (_, code) = units.load(Path::new(layout), &library).unwrap();
    let mut reader = Reader::new(&library, &mut units, PlainTextDocument::new(text), ReaderOptions { locale, ..ReaderOptions::default() });
    reader.exec(code)
}

fn strings(out: &ReaderOutput, table: usize, name: &str) -> Vec<String> {
    out.values[table]
        .get(name)
        .map(|values| values.iter().map(Value::to_string).collect())
        .unwrap_or_default()
}

#[test]
fn number_wrap_uses_document_locale() {
    let out = run_boxes("1.234,56", vec![page_box("total", "%total = @;")], italian()).unwrap();
    assert_eq!(strings(&out, 0, "total"), vec!["1234.56"]);
    assert!(matches!(out.values[0]["total"][0], Value::Number(_)));
}

#[test]
fn if_else_takes_the_true_branch() {
    let out = run_script("", r#"if ($eq(1,1)) { x = "a"; } else { x = "b"; }"#);
    assert_eq!(strings(&out, 0, "x"), vec!["a"]);
    let out = run_script("", r#"if ($eq(1,2)) { x = "a"; } elif (1 > 2) { x = "b"; } else { x = "c"; }"#);
    assert_eq!(strings(&out, 0, "x"), vec!["c"]);
}

#[test]
fn append_grows_a_multi_value_variable() {
    let out = run_script(
        "",
        r#"names[] = "a"; names[] = "b"; n = $size(names); first = names[0]; second = names[1];"#,
    );
    assert_eq!(strings(&out, 0, "names"), vec!["a", "b"]);
    assert_eq!(strings(&out, 0, "n"), vec!["2"]);
    assert_eq!(strings(&out, 0, "first"), vec!["a"]);
    assert_eq!(strings(&out, 0, "second"), vec!["b"]);
}

#[test]
fn goto_skips_boxes_in_between() {
    let boxes = vec![
        page_box("start", "a = 1; $goto(skip);"),
        page_box("middle", "b = 1;"),
        LayoutBox {
            goto_label: "skip".into(),
            ..page_box("end", "c = 1;")
        },
    ];
    let out = run_boxes("", boxes, Locale::default()).unwrap();
    assert_eq!(strings(&out, 0, "a"), vec!["1"]);
    assert_eq!(strings(&out, 0, "b"), Vec::<String>::new());
    assert_eq!(strings(&out, 0, "c"), vec!["1"]);
}

#[test]
fn missing_argument_fails_compilation() {
    let library = FunctionLibrary::new();
    let list = LayoutBoxList::new(vec![page_box("bad", r#"x = $indexof("abc");"#)]);
    let err = compile(Path::new("bad"), &list, &library, CompileOptions::default()).unwrap_err();
    match err {
        LayoutError::Box { box_name, source, .. } => {
            assert_eq!(box_name, "bad");
            assert!(matches!(source, ParseError::InvalidArgumentCount { got: 1, .. }), "{source:?}");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn loops_and_arithmetic() {
    let out = run_script(
        "",
        "i = 0; while (i < 5) { i += 1; $if (i == 2) $continue; seen[] = i; $if (i == 4) $break; }
         for (j = 0, j < 3, j++) squares[] = j * j;
         k = -(2 + 3) * 4 / 8;",
    );
    assert_eq!(strings(&out, 0, "seen"), vec!["1", "3", "4"]);
    assert_eq!(strings(&out, 0, "squares"), vec!["0", "1", "4"]);
    assert_eq!(strings(&out, 0, "k"), vec!["-2.5"]);
}

#[test]
fn leaving_a_loop_closes_its_views() {
    let out = run_script("outer", r#"$while (1) { $with("inner") $break; } x = @;"#);
    assert_eq!(strings(&out, 0, "x"), vec!["outer"]);

    let out = run_script(
        "outer",
        r#"$for (i = 0, i < 3, i++) { $with("inner") $newview { $continue; } } x = @;"#,
    );
    assert_eq!(strings(&out, 0, "x"), vec!["outer"]);

    let out = run_script("outer", r#"$foreach { $with("inner") $break; } x = @;"#);
    assert_eq!(strings(&out, 0, "x"), vec!["outer"]);

    let out = run_script("a b c", r#"$while (1) { $between("b") { seen[] = @; $break; } } x = @;"#);
    assert_eq!(strings(&out, 0, "seen"), vec!["b c"]);
    assert_eq!(strings(&out, 0, "x"), vec!["a b c"]);
}

#[test]
fn return_closes_the_views_of_the_function() {
    let out = run_script(
        "outer",
        r#"$function(peek) { $with("inner") $return(@); } $function(noop) { $with("x") $return; }
           y = $peek(); $call(noop); x = @;"#,
    );
    assert_eq!(strings(&out, 0, "y"), vec!["inner"]);
    assert_eq!(strings(&out, 0, "x"), vec!["outer"]);
}

#[test]
fn clear_and_overwrite() {
    let out = run_script(
        "",
        r#"a[] = 1; a[] = 2; $clear(a); $clear(a); na = $size(a); b[] = 1; b[] = 2; ~b = 3; c[2] = "z"; d = "x"; d = ""; !d = "";"#,
    );
    assert_eq!(strings(&out, 0, "a"), Vec::<String>::new());
    assert_eq!(strings(&out, 0, "na"), vec!["0"]);
    assert_eq!(strings(&out, 0, "b"), vec!["3"]);
    assert_eq!(strings(&out, 0, "c"), vec!["", "", "z"]);
    assert_eq!(out.values[0]["c"][0], Value::Null);
    assert_eq!(strings(&out, 0, "d"), vec![""]);
}

#[test]
fn runtime_error_reports_box() {
    let err = run_boxes(
        "",
        vec![page_box("ok", "x = 1;"), page_box("fails", r#"$error("stop here");"#)],
        Locale::default(),
    )
    .unwrap_err();
    assert!(matches!(&err.source, RuntimeError::Script(m) if m == "stop here"));
    // box names are only recorded in debug builds
    assert_eq!(err.box_name, None);
}

#[test]
fn invoice_layout() {
    let text = std::fs::read_to_string("tests/fixtures/invoice.txt").unwrap();
    let out = run_file("tests/fixtures/invoice.bls", &text, italian()).unwrap();
    assert_eq!(strings(&out, 0, "invoice"), vec!["0042"]);
    assert_eq!(strings(&out, 0, "issued"), vec!["2024-01-31"]);
    assert_eq!(strings(&out, 0, "names"), vec!["Widget", "Gadget"]);
    assert_eq!(strings(&out, 0, "amounts"), vec!["1234.56", "100"]);
    assert_eq!(strings(&out, 0, "total"), vec!["1334.56"]);
    assert_eq!(out.warnings, Vec::<String>::new());
    assert_eq!(out.globals["pages"], vec![Value::from(2)]);
    assert_eq!(out.layouts.len(), 1);
    assert!(out.layouts[0].ends_with("invoice.bls"));
}

#[test]
fn imports_run_once_per_statement() {
    let out = run_file("tests/fixtures/imports/main.bls", "", Locale::default()).unwrap();
    assert_eq!(strings(&out, 0, "loaded"), vec!["common", "common"]);
    assert_eq!(strings(&out, 0, "total"), vec!["44"]);
    assert_eq!(out.layouts.len(), 3);
    assert!(out.layouts[1].ends_with("common.bls"));
}

#[test]
fn find_layout_stops_at_the_chosen_layout() {
    let library = FunctionLibrary::new();
    let mut units = LoadedUnits::default();
    let path = Path::new("tests/fixtures/imports/finder.bls");
    let options = ReaderOptions {
        find_layout: true,
        ..ReaderOptions::default()
    };

    let (_, code) = units.load(path, &library).unwrap();
    let mut reader = Reader::new(&library, &mut units, PlainTextDocument::new(""), options);
    let found = reader.exec(code).unwrap();
    assert_eq!(strings(&found, 0, "picked"), vec!["1"]);
    assert_eq!(strings(&found, 0, "loaded"), Vec::<String>::new());
    assert_eq!(found.layouts.len(), 2);
    assert!(found.layouts[1].ends_with("common.bls"));

    // a normal run goes on into the chosen layout
    let out = run_file("tests/fixtures/imports/finder.bls", "", Locale::default()).unwrap();
    assert_eq!(strings(&out, 0, "loaded"), vec!["common"]);
}

#[test]
fn setlayout_stops_the_caller() {
    let out = run_file("tests/fixtures/imports/switch.bls", "", Locale::default()).unwrap();
    assert_eq!(strings(&out, 0, "first"), vec!["1"]);
    assert_eq!(strings(&out, 0, "loaded"), vec!["common"]);
    assert_eq!(strings(&out, 0, "never"), Vec::<String>::new());
}

#[test]
fn import_cycle_is_detected() {
    let err = run_file("tests/fixtures/imports/cycle_a.bls", "", Locale::default()).unwrap_err();
    match &err.source {
        RuntimeError::ImportCycle(path) => assert!(path.ends_with("cycle_a.bls"), "{path:?}"),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.box_name.as_deref(), Some("b"));
}

#[test]
fn missing_import_is_an_error() {
    let err = run_script_err(r#"$import("tests/fixtures/imports/nowhere");"#);
    assert!(matches!(err.source, RuntimeError::Import { .. }), "{err:?}");
}

fn run_script_err(script: &str) -> ReaderError {
    run_boxes("", vec![page_box("main", script)], Locale::default()).unwrap_err()
}
