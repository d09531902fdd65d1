use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What a box reads when its script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoxKind {
    /// A rectangle on one page (`x, y, w, h` in the unit interval).
    #[default]
    Rectangle,
    /// A whole page; geometry is ignored.
    Page,
    /// Every page of the document; page and geometry are ignored.
    WholeFile,
    /// Nothing is read, only the scripts run.
    NoRead,
}

impl BoxKind {
    pub const NAMES: &'static [&'static str] = &["rectangle", "page", "whole-file", "no-read"];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "rectangle" => Some(Self::Rectangle),
            "page" => Some(Self::Page),
            "whole-file" | "wholefile" | "file" => Some(Self::WholeFile),
            "no-read" | "noread" => Some(Self::NoRead),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Rectangle),
            1 => Some(Self::Page),
            2 => Some(Self::WholeFile),
            3 => Some(Self::NoRead),
            _ => None,
        }
    }
}

impl fmt::Display for BoxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::NAMES[*self as usize])
    }
}

/// Text extraction mode handed through to the text provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    #[default]
    Default,
    Layout,
    Raw,
}

impl ReadMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "default" => Some(Self::Default),
            "layout" => Some(Self::Layout),
            "raw" => Some(Self::Raw),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Default),
            1 => Some(Self::Layout),
            2 => Some(Self::Raw),
            _ => None,
        }
    }
}

impl fmt::Display for ReadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Default => "default",
            Self::Layout => "layout",
            Self::Raw => "raw",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxFlags {
    /// Only the goto label survives; nothing else is compiled.
    pub disabled: bool,
    /// Geometry and spacers are compiled, the body script is not.
    pub spacer_only: bool,
    /// Scripts run but the box text is never read.
    pub no_read: bool,
}

/// One scriptable extraction unit, 1-to-1 with an entry in a layout file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutBox {
    pub name: String,
    pub kind: BoxKind,
    /// 1-based page number.
    pub page: i32,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub mode: ReadMode,
    pub flags: BoxFlags,
    pub goto_label: String,
    pub spacers: String,
    pub script: String,
}

impl Default for LayoutBox {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: BoxKind::Rectangle,
            page: 1,
            x: 0.0,
            y: 0.0,
            w: 0.0,
            h: 0.0,
            mode: ReadMode::Default,
            flags: BoxFlags::default(),
            goto_label: String::new(),
            spacers: String::new(),
            script: String::new(),
        }
    }
}

impl LayoutBox {
    /// Whether running this box reads text from the provider.
    pub fn reads_text(&self) -> bool {
        !self.flags.no_read && !self.flags.spacer_only && self.kind != BoxKind::NoRead
    }
}

/// Ordered box list as it comes out of a layout loader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayoutBoxList {
    pub boxes: Vec<LayoutBox>,
    pub language: Option<String>,
    /// Marks a layout that only dispatches to the layout matching a document.
    pub find_layout: bool,
    /// File the list was read from; empty for in-memory lists.
    pub path: PathBuf,
}

impl LayoutBoxList {
    pub fn new(boxes: Vec<LayoutBox>) -> Self {
        Self {
            boxes,
            ..Self::default()
        }
    }
}

/// Geometry of the box being read, after spacer adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PageRect {
    pub page: i32,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub kind: BoxKind,
    pub mode: ReadMode,
}
