//! Hand-written lexer for layout scripts.
//!
//! Tokens are produced lazily: the parser peeks with `next(false)` and
//! consumes with `next(true)` / `require` / `check_next`.
//
//  Lexical items (informal):
//
//      Identifier ::= [A-Za-z_][A-Za-z0-9_]*
//      Function   ::= '$' Identifier
//      Integer    ::= [0-9]+
//      Number     ::= [0-9]+ '.' [0-9]*
//      String     ::= '"' ( '\' any | [^"] )* '"'
//      Regex      ::= '/' ( '\' any | [^/] )* '/'   (only where an operand is expected)
//
//  Whitespace is skipped, `#` starts a comment running to end of line.

use std::fmt;

use super::error::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Identifier,
    Function,
    String,
    Regex,
    Number,
    Integer,
    Semicolon,
    ParenBegin,
    ParenEnd,
    Comma,
    BracketBegin,
    BracketEnd,
    BraceBegin,
    BraceEnd,
    Assign,
    Overwrite,
    AddTo,
    SubTo,
    Increment,
    Decrement,
    Content,
    Colon,
    Not,
    Asterisk,
    Slash,
    Plus,
    Minus,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Equals,
    NotEquals,
    And,
    Or,
    Percent,
    Tilde,
    Caret,
    Quote,
    EndOfFile,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::Identifier => "identifier",
            TokenKind::Function => "function",
            TokenKind::String => "string",
            TokenKind::Regex => "regular expression",
            TokenKind::Number => "number",
            TokenKind::Integer => "integer",
            TokenKind::Semicolon => "`;`",
            TokenKind::ParenBegin => "`(`",
            TokenKind::ParenEnd => "`)`",
            TokenKind::Comma => "`,`",
            TokenKind::BracketBegin => "`[`",
            TokenKind::BracketEnd => "`]`",
            TokenKind::BraceBegin => "`{`",
            TokenKind::BraceEnd => "`}`",
            TokenKind::Assign => "`=`",
            TokenKind::Overwrite => "`:=`",
            TokenKind::AddTo => "`+=`",
            TokenKind::SubTo => "`-=`",
            TokenKind::Increment => "`++`",
            TokenKind::Decrement => "`--`",
            TokenKind::Content => "`@`",
            TokenKind::Colon => "`:`",
            TokenKind::Not => "`!`",
            TokenKind::Asterisk => "`*`",
            TokenKind::Slash => "`/`",
            TokenKind::Plus => "`+`",
            TokenKind::Minus => "`-`",
            TokenKind::Less => "`<`",
            TokenKind::LessEq => "`<=`",
            TokenKind::Greater => "`>`",
            TokenKind::GreaterEq => "`>=`",
            TokenKind::Equals => "`==`",
            TokenKind::NotEquals => "`!=`",
            TokenKind::And => "`&&`",
            TokenKind::Or => "`||`",
            TokenKind::Percent => "`%`",
            TokenKind::Tilde => "`~`",
            TokenKind::Caret => "`^`",
            TokenKind::Quote => "`'`",
            TokenKind::EndOfFile => "end of script",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    /// Raw source text of the token (quotes and slashes included).
    pub value: &'a str,
    /// Byte offset of the token in the script.
    pub offset: usize,
}

impl<'a> Token<'a> {
    /// Name of a `$function` token, without the marker.
    pub fn function_name(&self) -> &'a str {
        self.value.strip_prefix('$').unwrap_or(self.value)
    }

    /// Unquotes a string literal and resolves its escapes.
    pub fn parse_string(&self) -> Result<String, ParseError> {
        let inner = self
            .value
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(self.value);
        unescape(inner, self.offset)
    }

    /// Strips the slashes of a regex literal; only `\/` is unescaped, every
    /// other escape is left for the regex engine.
    pub fn parse_regex(&self) -> String {
        let inner = self
            .value
            .strip_prefix('/')
            .and_then(|s| s.strip_suffix('/'))
            .unwrap_or(self.value);
        inner.replace("\\/", "/")
    }
}

fn unescape(inner: &str, offset: usize) -> Result<String, ParseError> {
    let invalid = || ParseError::InvalidToken {
        offset,
        text: inner.to_string(),
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('u') => {
                let high = read_hex4(&mut chars).ok_or_else(invalid)?;
                let code = if (0xD800..0xDC00).contains(&high) {
                    // surrogate pair: expect `\uDC00..DFFF` right after
                    if chars.next() != Some('\\') || chars.next() != Some('u') {
                        return Err(invalid());
                    }
                    let low = read_hex4(&mut chars).ok_or_else(invalid)?;
                    if !(0xDC00..0xE000).contains(&low) {
                        return Err(invalid());
                    }
                    0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00)
                } else {
                    high
                };
                out.push(char::from_u32(code).ok_or_else(invalid)?);
            }
            Some(other) => out.push(other),
            None => return Err(invalid()),
        }
    }
    Ok(out)
}

fn read_hex4(chars: &mut std::str::Chars<'_>) -> Option<u32> {
    let mut value = 0;
    for _ in 0..4 {
        value = value * 16 + chars.next()?.to_digit(16)?;
    }
    Some(value)
}

#[derive(Clone)]
pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    debug: bool,
    /// Start offset of the last source line queued as a debug comment.
    last_debug_line: Option<usize>,
    pending_lines: Vec<&'a str>,
    /// Debug lines released by the last consuming call.
    flushed_lines: Vec<&'a str>,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self::with_debug(src, false)
    }

    /// With `debug` set every distinct non-blank line is reported once
    /// through [`Lexer::take_comments`] before the token that follows it.
    pub fn with_debug(src: &'a str, debug: bool) -> Self {
        let mut lex = Self {
            src,
            pos: 0,
            debug,
            last_debug_line: None,
            pending_lines: Vec::new(),
            flushed_lines: Vec::new(),
        };
        lex.queue_debug_line(0);
        lex.flush();
        lex
    }

    /// Drains the debug lines crossed so far, including the blank space and
    /// comments ahead of the next token.
    pub fn take_comments(&mut self) -> Vec<&'a str> {
        self.skip_spaces();
        self.flush();
        std::mem::take(&mut self.flushed_lines)
    }

    fn flush(&mut self) {
        self.flushed_lines.append(&mut self.pending_lines);
    }

    fn queue_debug_line(&mut self, from: usize) {
        if !self.debug {
            return;
        }
        let rest = &self.src[from..];
        let Some(skip) = rest.find(|c: char| !c.is_whitespace()) else {
            return;
        };
        let begin = from + skip;
        if self.last_debug_line == Some(begin) {
            return;
        }
        self.last_debug_line = Some(begin);
        let line = &self.src[begin..];
        let end = line.find(['\r', '\n']).unwrap_or(line.len());
        self.pending_lines.push(&line[..end]);
    }

    fn skip_spaces(&mut self) {
        let bytes = self.src.as_bytes();
        let mut comment = false;
        while self.pos < bytes.len() {
            match bytes[self.pos] {
                b'\r' | b'\n' => {
                    comment = false;
                    self.queue_debug_line(self.pos);
                    self.pos += 1;
                }
                b' ' | b'\t' => self.pos += 1,
                b'#' => {
                    comment = true;
                    self.pos += 1;
                }
                _ if comment => self.pos += 1,
                _ => return,
            }
        }
    }

    /// Scans one token starting at `start` and returns it with its end offset.
    fn scan(&self, start: usize) -> Result<(TokenKind, usize), ParseError> {
        let bytes = self.src.as_bytes();
        let at = |i: usize| bytes.get(i).copied().unwrap_or(0);
        let c = at(start);
        let pair = |second: u8, double: TokenKind, single: TokenKind| {
            if at(start + 1) == second {
                (double, start + 2)
            } else {
                (single, start + 1)
            }
        };

        let (kind, end) = match c {
            0 if start >= bytes.len() => (TokenKind::EndOfFile, start),
            b'$' => {
                let end = self.identifier_end(start + 1);
                if end == start + 1 {
                    return Err(self.invalid(start, start + 1));
                }
                (TokenKind::Function, end)
            }
            b'"' => (TokenKind::String, self.delimited_end(start, b'"')?),
            b'0'..=b'9' => {
                let mut end = start;
                while at(end).is_ascii_digit() {
                    end += 1;
                }
                if at(end) == b'.' {
                    end += 1;
                    while at(end).is_ascii_digit() {
                        end += 1;
                    }
                    (TokenKind::Number, end)
                } else {
                    (TokenKind::Integer, end)
                }
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => (TokenKind::Identifier, self.identifier_end(start)),
            b';' => (TokenKind::Semicolon, start + 1),
            b',' => (TokenKind::Comma, start + 1),
            b'(' => (TokenKind::ParenBegin, start + 1),
            b')' => (TokenKind::ParenEnd, start + 1),
            b'[' => (TokenKind::BracketBegin, start + 1),
            b']' => (TokenKind::BracketEnd, start + 1),
            b'{' => (TokenKind::BraceBegin, start + 1),
            b'}' => (TokenKind::BraceEnd, start + 1),
            b'@' => (TokenKind::Content, start + 1),
            b'*' => (TokenKind::Asterisk, start + 1),
            b'/' => (TokenKind::Slash, start + 1),
            b'%' => (TokenKind::Percent, start + 1),
            b'~' => (TokenKind::Tilde, start + 1),
            b'^' => (TokenKind::Caret, start + 1),
            b'\'' => (TokenKind::Quote, start + 1),
            b'=' => pair(b'=', TokenKind::Equals, TokenKind::Assign),
            b'!' => pair(b'=', TokenKind::NotEquals, TokenKind::Not),
            b':' => pair(b'=', TokenKind::Overwrite, TokenKind::Colon),
            b'<' => pair(b'=', TokenKind::LessEq, TokenKind::Less),
            b'>' => pair(b'=', TokenKind::GreaterEq, TokenKind::Greater),
            b'+' => match at(start + 1) {
                b'+' => (TokenKind::Increment, start + 2),
                b'=' => (TokenKind::AddTo, start + 2),
                _ => (TokenKind::Plus, start + 1),
            },
            b'-' => match at(start + 1) {
                b'-' => (TokenKind::Decrement, start + 2),
                b'=' => (TokenKind::SubTo, start + 2),
                _ => (TokenKind::Minus, start + 1),
            },
            b'&' if at(start + 1) == b'&' => (TokenKind::And, start + 2),
            b'|' if at(start + 1) == b'|' => (TokenKind::Or, start + 2),
            _ => {
                let len = self.src[start..].chars().next().map_or(1, char::len_utf8);
                return Err(self.invalid(start, start + len));
            }
        };
        Ok((kind, end))
    }

    fn identifier_end(&self, from: usize) -> usize {
        let bytes = self.src.as_bytes();
        let mut end = from;
        if end < bytes.len() && (bytes[end].is_ascii_alphabetic() || bytes[end] == b'_') {
            end += 1;
            while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
                end += 1;
            }
        }
        end
    }

    /// End offset (one past the closing delimiter) of a quoted literal.
    fn delimited_end(&self, start: usize, delim: u8) -> Result<usize, ParseError> {
        let bytes = self.src.as_bytes();
        let mut i = start + 1;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => i += 2,
                c if c == delim => return Ok(i + 1),
                _ => i += 1,
            }
        }
        Err(self.invalid(start, bytes.len()))
    }

    fn invalid(&self, start: usize, end: usize) -> ParseError {
        ParseError::InvalidToken {
            offset: start,
            text: self.src[start..end.min(self.src.len())].to_string(),
        }
    }

    /// Returns the next token; with `advance` the cursor moves past it.
    pub fn next(&mut self, advance: bool) -> Result<Token<'a>, ParseError> {
        self.skip_spaces();
        if advance {
            self.flush();
        }
        let start = self.pos;
        let (kind, end) = self.scan(start)?;
        if advance {
            self.pos = end;
        }
        Ok(Token {
            kind,
            value: &self.src[start..end],
            offset: start,
        })
    }

    pub fn peek(&mut self) -> Result<Token<'a>, ParseError> {
        self.next(false)
    }

    pub fn advance(&mut self) -> Result<Token<'a>, ParseError> {
        self.next(true)
    }

    /// Consumes the next token, failing unless it has the given kind.
    pub fn require(&mut self, kind: TokenKind) -> Result<Token<'a>, ParseError> {
        if kind == TokenKind::Regex {
            return self.require_regex();
        }
        let tok = self.next(true)?;
        if tok.kind != kind {
            return Err(unexpected(&tok, kind));
        }
        Ok(tok)
    }

    /// Consumes the next token only if it has the given kind.
    pub fn check_next(&mut self, kind: TokenKind) -> Result<Option<Token<'a>>, ParseError> {
        let tok = self.peek()?;
        if tok.kind == kind {
            self.next(true).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Re-scans the upcoming `/` as the start of a regex literal.
    pub fn require_regex(&mut self) -> Result<Token<'a>, ParseError> {
        let tok = self.peek()?;
        if tok.kind != TokenKind::Slash {
            self.flush();
            return Err(unexpected(&tok, TokenKind::Regex));
        }
        let end = self.delimited_end(tok.offset, b'/')?;
        self.flush();
        self.pos = end;
        Ok(Token {
            kind: TokenKind::Regex,
            value: &self.src[tok.offset..end],
            offset: tok.offset,
        })
    }

    /// Renders a two-line pointer at `offset`: the source line, then a caret
    /// under the offending column.
    pub fn location_info(&self, offset: usize) -> String {
        location_info(self.src, offset)
    }
}

pub fn unexpected(tok: &Token<'_>, expected: TokenKind) -> ParseError {
    ParseError::UnexpectedToken {
        offset: tok.offset,
        expected,
        found: tok.kind,
        text: tok.value.to_string(),
    }
}

pub fn location_info(src: &str, offset: usize) -> String {
    let offset = offset.min(src.len());
    let line_start = src[..offset].rfind('\n').map_or(0, |i| i + 1);
    let line_end = src[offset..].find(['\r', '\n']).map_or(src.len(), |i| offset + i);
    let line_no = src[..line_start].matches('\n').count() + 1;
    let column = src[line_start..offset].chars().count() + 1;
    let line = &src[line_start..line_end];
    format!(
        "{line}\nLn {line_no}, Col {column}:\n{}^",
        "-".repeat(column - 1)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut lex = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let tok = lex.advance().unwrap();
            out.push(tok.kind);
            if tok.kind == TokenKind::EndOfFile {
                return out;
            }
        }
    }

    #[test]
    fn test_tokenisation() {
        use TokenKind::*;
        let test_cases = vec![
            (
                "%total = @;",
                vec![Percent, Identifier, Assign, Content, Semicolon, EndOfFile],
            ),
            (
                "names[] += 1.5 # trailing comment\n",
                vec![Identifier, BracketBegin, BracketEnd, AddTo, Number, EndOfFile],
            ),
            (
                "$if ($eq(a, 10)) { x := \"a\"; }",
                vec![
                    Function, ParenBegin, Function, ParenBegin, Identifier, Comma, Integer,
                    ParenEnd, ParenEnd, BraceBegin, Identifier, Overwrite, String, Semicolon,
                    BraceEnd, EndOfFile,
                ],
            ),
            (
                "a <= b != c && !d || e >= f -- ++ -=",
                vec![
                    Identifier, LessEq, Identifier, NotEquals, Identifier, And, Not, Identifier,
                    Or, Identifier, GreaterEq, Identifier, Decrement, Increment, SubTo, EndOfFile,
                ],
            ),
        ];

        for (src, expected) in test_cases {
            assert_eq!(kinds(src), expected, "source: {src}");
        }
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut lex = Lexer::new("foo bar");
        assert_eq!(lex.peek().unwrap().value, "foo");
        assert_eq!(lex.peek().unwrap().value, "foo");
        assert_eq!(lex.advance().unwrap().value, "foo");
        assert!(lex.check_next(TokenKind::Integer).unwrap().is_none());
        assert_eq!(lex.check_next(TokenKind::Identifier).unwrap().unwrap().value, "bar");
    }

    #[test]
    fn test_require_mismatch() {
        let mut lex = Lexer::new("foo");
        let err = lex.require(TokenKind::Integer).unwrap_err();
        assert!(matches!(
            err,
            ParseError::UnexpectedToken {
                expected: TokenKind::Integer,
                found: TokenKind::Identifier,
                ..
            }
        ));
    }

    #[test]
    fn test_string_escapes() {
        let mut lex = Lexer::new(r#""a\"b\nè😀""#);
        let tok = lex.require(TokenKind::String).unwrap();
        assert_eq!(tok.parse_string().unwrap(), "a\"b\nè😀");
    }

    #[test]
    fn test_unterminated_literals() {
        assert!(matches!(
            Lexer::new("\"abc").advance(),
            Err(ParseError::InvalidToken { offset: 0, .. })
        ));
        let mut lex = Lexer::new("/abc");
        assert!(matches!(lex.require_regex(), Err(ParseError::InvalidToken { .. })));
        assert!(matches!(Lexer::new("a | b").advance(), Ok(_)));
        let mut lex = Lexer::new("| b");
        assert!(matches!(lex.advance(), Err(ParseError::InvalidToken { .. })));
    }

    #[test]
    fn test_regex_literal() {
        let mut lex = Lexer::new(r"/\d+\/x/ ;");
        let tok = lex.require_regex().unwrap();
        assert_eq!(tok.parse_regex(), r"\d+/x");
        assert_eq!(lex.advance().unwrap().kind, TokenKind::Semicolon);
    }

    #[test]
    fn test_debug_comments() {
        let src = "a = 1;\n\n# note\nb = 2;\n";
        let mut lex = Lexer::with_debug(src, true);
        assert_eq!(lex.take_comments(), vec!["a = 1;"]);
        lex.advance().unwrap();
        assert!(lex.take_comments().is_empty());
        for _ in 0..3 {
            lex.advance().unwrap();
        }
        assert_eq!(lex.take_comments(), vec!["# note", "b = 2;"]);
        lex.advance().unwrap();
        assert!(lex.take_comments().is_empty());
    }

    #[test]
    fn test_location_info() {
        let info = location_info("a = 1;\nb = ?;", 11);
        assert_eq!(info, "b = ?;\nLn 2, Col 5:\n----^");
    }
}
