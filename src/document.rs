//! Text provider boundary and a plain-text implementation of it.

use std::path::Path;

use crate::model::{BoxKind, PageRect, ReadMode};

/// Page separator in plain-text dumps (form feed, as `pdftotext` emits).
pub const PAGE_SEPARATOR: char = '\x0c';

/// Supplies the text under a box. Out-of-range pages yield an empty string.
pub trait TextProvider {
    fn get_text(&mut self, rect: &PageRect) -> String;
}

impl<T: TextProvider + ?Sized> TextProvider for &mut T {
    fn get_text(&mut self, rect: &PageRect) -> String {
        (**self).get_text(rect)
    }
}

/// A document made of plain-text pages; rectangles are cropped on the
/// character grid of the page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlainTextDocument {
    pages: Vec<String>,
}

impl PlainTextDocument {
    /// Splits `text` into pages on form feeds.
    pub fn new(text: &str) -> Self {
        let text = text.strip_suffix(PAGE_SEPARATOR).unwrap_or(text);
        Self {
            pages: text.split(PAGE_SEPARATOR).map(str::to_string).collect(),
        }
    }

    pub fn from_pages(pages: Vec<String>) -> Self {
        Self { pages }
    }

    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self::new(&std::fs::read_to_string(path)?))
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page(&self, page: i32) -> Option<&str> {
        let index = usize::try_from(page).ok()?.checked_sub(1)?;
        self.pages.get(index).map(String::as_str)
    }
}

fn span(start: f64, size: f64, total: usize) -> (usize, usize) {
    let total_f = total as f64;
    let begin = (start * total_f).floor().clamp(0.0, total_f) as usize;
    let end = ((start + size) * total_f).ceil().clamp(0.0, total_f) as usize;
    (begin, end.max(begin))
}

fn crop(page: &str, rect: &PageRect) -> String {
    let lines: Vec<&str> = page.lines().collect();
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0);
    let (top, bottom) = span(rect.y, rect.h, lines.len());
    let (left, right) = span(rect.x, rect.w, width);
    lines[top..bottom]
        .iter()
        .map(|line| {
            line.chars()
                .skip(left)
                .take(right - left)
                .collect::<String>()
                .trim_end()
                .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn apply_mode(text: String, mode: ReadMode) -> String {
    match mode {
        ReadMode::Raw => text
            .lines()
            .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        ReadMode::Default | ReadMode::Layout => text,
    }
}

impl TextProvider for PlainTextDocument {
    fn get_text(&mut self, rect: &PageRect) -> String {
        let text = match rect.kind {
            BoxKind::WholeFile => self.pages.join("\n"),
            BoxKind::NoRead => String::new(),
            BoxKind::Page => self.page(rect.page).unwrap_or_default().to_string(),
            BoxKind::Rectangle => self.page(rect.page).map(|p| crop(p, rect)).unwrap_or_default(),
        };
        apply_mode(text, rect.mode)
    }
}
