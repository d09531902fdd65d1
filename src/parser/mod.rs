//! Layout file loaders.
//!
//! Two on-disk forms describe the same [`LayoutBoxList`]: the line-oriented
//! `.bls` text format (see [`bls`]) and a JSON document shaped like
//!
//! ```json
//! { "language": "it", "find_layout": false, "boxes": [ { "name": "total", "type": "page", "script": "..." } ] }
//! ```
//!
//! Files are dispatched on their extension; anything that is not `.json` is
//! read as `.bls`.
pub mod bls;

use std::path::Path;

use log::{debug, warn};
use serde_json::Value;

use crate::model::{BoxKind, BoxFlags, LayoutBox, LayoutBoxList, ReadMode};
use crate::processor::error::LayoutError;

/// Reads and parses the layout file at `path`.
pub fn load_layout(path: &Path) -> Result<LayoutBoxList, LayoutError> {
    let text = std::fs::read_to_string(path).map_err(|source| LayoutError::File {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("layout {} loaded, size: {} bytes", path.display(), text.len());
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let mut list = if is_json {
        parse_json(&text, path)?
    } else {
        bls::parse(&text, path)?
    };
    list.path = path.to_path_buf();
    debug!("{} boxes in {}", list.boxes.len(), path.display());
    Ok(list)
}

pub(crate) fn format_error(path: &Path, message: impl Into<String>) -> LayoutError {
    LayoutError::Format {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

/// Applies one flag word (`disabled`, `page`, `noread`, `spacer`) to `layout_box`.
pub(crate) fn apply_flag(layout_box: &mut LayoutBox, flag: &str) -> Result<(), String> {
    match flag.to_ascii_lowercase().as_str() {
        "disabled" => layout_box.flags.disabled = true,
        "page" => layout_box.kind = BoxKind::Page,
        "noread" | "no-read" => layout_box.flags.no_read = true,
        "spacer" | "spacer-only" => layout_box.flags.spacer_only = true,
        other => return Err(format!("invalid flag `{other}`")),
    }
    Ok(())
}

/// Parses the JSON form of a layout.
pub fn parse_json(json: &str, path: &Path) -> Result<LayoutBoxList, LayoutError> {
    let root: Value =
        serde_json::from_str(json).map_err(|e| format_error(path, e.to_string()))?;

    let boxes = root
        .get("boxes")
        .and_then(|v| v.as_array())
        .ok_or_else(|| format_error(path, "file has no `boxes` array"))?;

    let language = root
        .get("language")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let find_layout = match root.get("find_layout") {
        None | Some(Value::Null) => false,
        Some(v) => v
            .as_bool()
            .ok_or_else(|| format_error(path, "`find_layout` is not a boolean"))?,
    };

    let boxes = boxes
        .iter()
        .enumerate()
        .map(|(i, obj)| parse_json_box(obj).map_err(|m| format_error(path, format!("box {i}: {m}"))))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(LayoutBoxList {
        boxes,
        language,
        find_layout,
        ..LayoutBoxList::default()
    })
}

fn parse_json_box(obj: &Value) -> Result<LayoutBox, String> {
    let text = |key: &str| {
        obj.get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    let number = |key: &str| -> Result<f64, String> {
        match obj.get(key) {
            None | Some(Value::Null) => Ok(0.0),
            Some(v) => v.as_f64().ok_or_else(|| format!("`{key}` is not a number")),
        }
    };

    let mut layout_box = LayoutBox {
        name: text("name"),
        x: number("x")?,
        y: number("y")?,
        w: number("w")?,
        h: number("h")?,
        goto_label: text("goto_label"),
        spacers: text("spacers"),
        script: text("script"),
        flags: BoxFlags::default(),
        ..LayoutBox::default()
    };

    if let Some(page) = obj.get("page") {
        layout_box.page = page
            .as_i64()
            .and_then(|p| i32::try_from(p).ok())
            .ok_or("`page` is not an integer")?;
    }
    if let Some(kind) = obj.get("type").and_then(|v| v.as_str()) {
        layout_box.kind =
            BoxKind::from_name(kind).ok_or_else(|| format!("invalid box type `{kind}`"))?;
    }
    if let Some(mode) = obj.get("mode").and_then(|v| v.as_str()) {
        layout_box.mode =
            ReadMode::from_name(mode).ok_or_else(|| format!("invalid mode `{mode}`"))?;
    }
    if let Some(flags) = obj.get("flags").and_then(|v| v.as_array()) {
        for flag in flags {
            let flag = flag.as_str().ok_or("flags must be strings")?;
            apply_flag(&mut layout_box, flag)?;
        }
    }
    if obj.get("script").is_some_and(|v| !v.is_string()) {
        warn!("box `{}`: `script` is not a string, ignored", layout_box.name);
    }
    Ok(layout_box)
}
