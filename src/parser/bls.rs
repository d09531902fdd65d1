//! The line-oriented `.bls` layout format.
//!
//! ```text
//! ### Bill Layout Script
//! ### Language it
//! ### Flag Find Layout
//!
//! ### Box total
//! ### Mode raw
//! ### Flags page noread
//! ### Page 1
//! ### Rect 0.5 0.25 0.5 0.5
//! ### Goto Label top
//! ### Spacers
//! top + 0.1
//! ### End Spacers
//! ### Script
//! total = num(@);
//! ### End Script
//! ### End Box
//! ```
//!
//! Empty lines and unknown `#` lines outside of a block are ignored.

use std::fmt::Write as _;
use std::path::Path;

use crate::model::{BoxKind, LayoutBox, LayoutBoxList, ReadMode};
use crate::processor::error::LayoutError;

use super::{apply_flag, format_error};

pub const HEADER: &str = "### Bill Layout Script";

fn directive<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?;
    if rest.is_empty() || rest.starts_with([' ', '\t']) {
        Some(rest.trim_start_matches([' ', '\t']))
    } else {
        None
    }
}

/// Collects the lines of a `### Spacers` / `### Script` block up to `end`.
fn read_block<'a>(
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
    end: &str,
) -> Result<String, String> {
    let mut body = Vec::new();
    for (_, line) in lines.by_ref() {
        if line == end {
            return Ok(body.join("\n"));
        }
        body.push(line);
    }
    Err(format!("`{end}` not found"))
}

fn read_box<'a>(
    name: &str,
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
) -> Result<LayoutBox, String> {
    let mut current = LayoutBox {
        name: name.to_string(),
        ..LayoutBox::default()
    };
    while let Some((n, line)) = lines.next() {
        if line.is_empty() {
            continue;
        }
        if line == "### End Box" {
            return Ok(current);
        } else if let Some(mode) = directive(line, "### Mode") {
            current.mode =
                ReadMode::from_name(mode).ok_or_else(|| format!("line {n}: invalid mode `{mode}`"))?;
        } else if let Some(kind) = directive(line, "### Type") {
            current.kind =
                BoxKind::from_name(kind).ok_or_else(|| format!("line {n}: invalid box type `{kind}`"))?;
        } else if let Some(flags) = directive(line, "### Flags") {
            for flag in flags.split_whitespace() {
                apply_flag(&mut current, flag).map_err(|e| format!("line {n}: {e}"))?;
            }
        } else if let Some(page) = directive(line, "### Page") {
            current.page = page
                .trim()
                .parse()
                .map_err(|_| format!("line {n}: invalid page `{page}`"))?;
        } else if let Some(rect) = directive(line, "### Rect") {
            let values = rect
                .split_whitespace()
                .map(str::parse::<f64>)
                .collect::<Result<Vec<_>, _>>()
                .ok()
                .filter(|v| v.len() == 4)
                .ok_or_else(|| format!("line {n}: invalid rectangle `{rect}`"))?;
            (current.x, current.y, current.w, current.h) = (values[0], values[1], values[2], values[3]);
        } else if let Some(label) = directive(line, "### Goto Label") {
            current.goto_label = label.to_string();
        } else if line == "### Spacers" {
            current.spacers = read_block(lines, "### End Spacers")?;
        } else if line == "### Script" {
            current.script = read_block(lines, "### End Script")?;
        } else if !line.starts_with('#') {
            return Err(format!("line {n}: unexpected `{line}`"));
        }
    }
    Err("`### End Box` not found".into())
}

/// Parses the text of a `.bls` file.
pub fn parse(text: &str, path: &Path) -> Result<LayoutBoxList, LayoutError> {
    let mut list = LayoutBoxList::default();
    let mut lines = text
        .lines()
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .enumerate()
        .map(|(i, l)| (i + 1, l));

    while let Some((n, line)) = lines.next() {
        if line.is_empty() {
            continue;
        }
        if let Some(name) = directive(line, "### Box") {
            let layout_box = read_box(name, &mut lines)
                .map_err(|m| format_error(path, format!("box `{name}`: {m}")))?;
            list.boxes.push(layout_box);
        } else if line == "### Flag Find Layout" {
            list.find_layout = true;
        } else if let Some(language) = directive(line, "### Language") {
            list.language = Some(language.to_string()).filter(|l| !l.is_empty());
        } else if !line.starts_with('#') {
            return Err(format_error(path, format!("line {n}: unexpected `{line}`")));
        }
    }
    Ok(list)
}

/// Renders `list` back to the `.bls` form.
pub fn to_string(list: &LayoutBoxList) -> String {
    let mut out = String::new();
    out.push_str(HEADER);
    out.push('\n');
    if let Some(language) = &list.language {
        let _ = writeln!(out, "### Language {language}");
    }
    if list.find_layout {
        out.push_str("### Flag Find Layout\n");
    }
    for b in &list.boxes {
        let _ = writeln!(out, "\n### Box {}", b.name);
        if b.kind != BoxKind::Rectangle {
            let _ = writeln!(out, "### Type {}", b.kind);
        }
        if b.mode != ReadMode::Default {
            let _ = writeln!(out, "### Mode {}", b.mode);
        }
        let flags: Vec<&str> = [
            (b.flags.disabled, "disabled"),
            (b.flags.no_read, "noread"),
            (b.flags.spacer_only, "spacer"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
        if !flags.is_empty() {
            let _ = writeln!(out, "### Flags {}", flags.join(" "));
        }
        let _ = writeln!(out, "### Page {}", b.page);
        let _ = writeln!(out, "### Rect {} {} {} {}", b.x, b.y, b.w, b.h);
        if !b.goto_label.is_empty() {
            let _ = writeln!(out, "### Goto Label {}", b.goto_label);
        }
        if !b.spacers.is_empty() {
            let _ = writeln!(out, "### Spacers\n{}\n### End Spacers", b.spacers);
        }
        if !b.script.is_empty() {
            let _ = writeln!(out, "### Script\n{}\n### End Script", b.script);
        }
        out.push_str("### End Box\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "### Bill Layout Script\r
### Language it
### Flag Find Layout

### Box header
### Flags page
### Page 2
### Script
x = @;

y = 1;
### End Script
### End Box

### Box total
### Mode raw
### Flags disabled noread
### Rect 0.5 0.25 0.5 0.5
### Goto Label top
### Spacers
top + 0.1
### End Spacers
### End Box
";

    #[test]
    fn test_parse_sample() {
        let list = parse(SAMPLE, Path::new("sample.bls")).unwrap();
        assert_eq!(list.language.as_deref(), Some("it"));
        assert!(list.find_layout);
        assert_eq!(list.boxes.len(), 2);

        let header = &list.boxes[0];
        assert_eq!(header.name, "header");
        assert_eq!(header.kind, BoxKind::Page);
        assert_eq!(header.page, 2);
        assert_eq!(header.script, "x = @;\n\ny = 1;");

        let total = &list.boxes[1];
        assert_eq!(total.mode, ReadMode::Raw);
        assert!(total.flags.disabled && total.flags.no_read);
        assert_eq!((total.x, total.y, total.w, total.h), (0.5, 0.25, 0.5, 0.5));
        assert_eq!(total.goto_label, "top");
        assert_eq!(total.spacers, "top + 0.1");
        assert_eq!(total.page, 1);
    }

    #[test]
    fn test_rendered_text_parses_back() {
        let list = parse(SAMPLE, Path::new("sample.bls")).unwrap();
        let again = parse(&to_string(&list), Path::new("again.bls")).unwrap();
        assert_eq!(again, list);
    }

    #[test]
    fn test_find_layout_flag_is_optional() {
        let list = parse("### Box a\n### End Box\n", Path::new("plain.bls")).unwrap();
        assert!(!list.find_layout);
        assert!(!to_string(&list).contains("Find Layout"));
    }

    #[test]
    fn test_errors() {
        let test_cases = vec![
            ("### Box a\n### Page x\n### End Box", "invalid page `x`"),
            ("### Box a\n### Rect 1 2 3\n### End Box", "invalid rectangle"),
            ("### Box a\n### Mode fancy\n### End Box", "invalid mode `fancy`"),
            ("### Box a\n### Flags shiny\n### End Box", "invalid flag `shiny`"),
            ("### Box a\n### Script\nx = 1;\n", "`### End Script` not found"),
            ("### Box a\n", "`### End Box` not found"),
            ("hello", "line 1: unexpected `hello`"),
        ];
        for (text, expected) in test_cases {
            let message = parse(text, Path::new("bad.bls")).unwrap_err().to_string();
            assert!(message.contains(expected), "{text:?}: {message}");
        }
    }
}
