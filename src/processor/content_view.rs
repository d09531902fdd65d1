//! Nested spans over the text read for the current box.

/// Bytes that separate two results when tokenizing a view.
pub const RESULT_SEPARATORS: &[u8] = b"\x1f\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub begin: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

/// One immutable text buffer plus a stack of spans over it. The bottom span
/// starts out covering the whole text and is never popped.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentView {
    text: String,
    spans: Vec<Span>,
}

impl ContentView {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let spans = vec![Span {
            begin: 0,
            end: text.len(),
        }];
        Self { text, spans }
    }

    pub fn depth(&self) -> usize {
        self.spans.len()
    }

    pub fn span(&self) -> Span {
        self.spans[self.spans.len() - 1]
    }

    fn parent(&self) -> Option<Span> {
        self.spans.len().checked_sub(2).map(|i| self.spans[i])
    }

    fn top_mut(&mut self) -> &mut Span {
        let last = self.spans.len() - 1;
        &mut self.spans[last]
    }

    fn ceil_boundary(&self, mut pos: usize) -> usize {
        while pos < self.text.len() && !self.text.is_char_boundary(pos) {
            pos += 1;
        }
        pos
    }

    fn floor_boundary(&self, mut pos: usize) -> usize {
        while pos > 0 && !self.text.is_char_boundary(pos) {
            pos -= 1;
        }
        pos
    }

    /// Moves the start of the current span forward by `n` bytes, never past
    /// its end.
    pub fn setbegin(&mut self, n: usize) {
        let top = self.span();
        let begin = self.ceil_boundary(top.begin.saturating_add(n).min(top.end)).min(top.end);
        self.top_mut().begin = begin;
    }

    /// Keeps only the first `n` bytes of the current span; no-op when the
    /// span is already shorter.
    pub fn setend(&mut self, n: usize) {
        let top = self.span();
        if n < top.len() {
            let end = self.floor_boundary(top.begin + n).max(top.begin);
            self.top_mut().end = end;
        }
    }

    /// Pushes a copy of the current span.
    pub fn new_view(&mut self) {
        let top = self.span();
        self.spans.push(top);
    }

    /// Pushes an empty span at the start of the current one, ready for
    /// [`ContentView::next_result`].
    pub fn new_subview(&mut self) {
        let top = self.span();
        self.spans.push(Span {
            begin: top.begin,
            end: top.begin,
        });
    }

    pub fn reset_view(&mut self) {
        if self.spans.len() > 1 {
            self.spans.pop();
        }
    }

    /// Advances the current span to the next separator-delimited result
    /// inside the parent span.
    pub fn next_result(&mut self) {
        let Some(parent) = self.parent() else {
            return;
        };
        let bytes = self.text.as_bytes();
        let from = self.span().end.min(parent.end);
        let begin = (from..parent.end)
            .find(|&i| !RESULT_SEPARATORS.contains(&bytes[i]))
            .unwrap_or(parent.end);
        let end = (begin..parent.end)
            .find(|&i| RESULT_SEPARATORS.contains(&bytes[i]))
            .unwrap_or(parent.end);
        *self.top_mut() = Span { begin, end };
    }

    /// True once the current span has run past the end of its parent.
    pub fn token_end(&self) -> bool {
        match self.parent() {
            Some(parent) => self.span().begin >= parent.end,
            None => false,
        }
    }

    pub fn view(&self) -> &str {
        let top = self.span();
        &self.text[top.begin..top.end]
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_result_walks_tokens() {
        let mut view = ContentView::new("alpha\nbeta\x1f\ngamma");
        view.new_subview();
        let mut seen = Vec::new();
        loop {
            view.next_result();
            if view.token_end() {
                break;
            }
            seen.push(view.view().to_string());
        }
        assert_eq!(seen, vec!["alpha", "beta", "gamma"]);
        view.reset_view();
        assert_eq!(view.view(), "alpha\nbeta\x1f\ngamma");
        view.reset_view();
        assert_eq!(view.depth(), 1);
    }

    #[test]
    fn test_setbegin_setend() {
        let mut view = ContentView::new("Total: 12,50 EUR");
        view.new_view();
        view.setbegin(7);
        assert_eq!(view.view(), "12,50 EUR");
        view.setend(5);
        assert_eq!(view.view(), "12,50");
        view.setend(99);
        assert_eq!(view.view(), "12,50");
        view.setbegin(99);
        assert_eq!(view.view(), "");
        view.reset_view();
        assert_eq!(view.view(), "Total: 12,50 EUR");
    }

    #[test]
    fn test_token_end_needs_a_parent() {
        let mut view = ContentView::new("");
        assert!(!view.token_end());
        view.new_subview();
        view.next_result();
        assert!(view.token_end());
    }

    /// Random operation sequences never let a span escape its parent.
    #[test]
    fn test_containment_under_random_ops() {
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut rand = move |bound: usize| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            (seed % bound as u64) as usize
        };
        for round in 0..200 {
            let text = format!("r{round} ab\ncd\x1f\x1fèf\n\ng{}", "h".repeat(round % 7));
            let mut view = ContentView::new(text);
            for _ in 0..64 {
                match rand(6) {
                    0 => view.new_view(),
                    1 => view.new_subview(),
                    2 => view.setbegin(rand(8)),
                    3 => view.setend(rand(8)),
                    4 => view.next_result(),
                    _ => view.reset_view(),
                }
                let spans = view.spans();
                assert!(spans[0].end <= view.text().len());
                for pair in spans.windows(2) {
                    let (parent, child) = (pair[0], pair[1]);
                    assert!(child.begin <= child.end);
                    assert!(parent.begin <= child.begin && child.end <= parent.end);
                }
                assert!(view.text().is_char_boundary(view.span().begin));
            }
        }
    }
}
