//! Recursive-descent compiler from a box list to [`Bytecode`].
//!
//! One layout file becomes one compilation unit:
//!
//! ```text
//! ADDLAYOUT path
//! (per box) [LABEL goto] NEWBOX geometry spacers [RDBOX body POPCONTENT]
//! RET
//! ```
//!
//! Jumps are emitted against symbolic labels and resolved once the whole
//! unit is known.

use std::collections::HashMap;
use std::path::Path;

use log::{debug, trace};

use crate::model::{BoxKind, LayoutBox, LayoutBoxList};

use super::bytecode::{
    Bytecode, FunctionCall, Instruction, JumpTarget, ReadOptions, SelectorDesc, SpacerIndex,
    SubroutineCall,
};
use super::decimal::{Decimal, SCALE};
use super::error::{LayoutError, ParseError};
use super::functions::FunctionLibrary;
use super::lexer::{Lexer, Token, TokenKind, unexpected};
use super::variables::{WriteFlags, WriteMode};

const GOTO_PREFIX: &str = "__label_";
const FUNCTION_PREFIX: &str = "__function_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileOptions {
    /// Emit `BOXNAME` / `COMMENT` pseudo-instructions for diagnostics.
    pub debug: bool,
}

/// Compiles every box of `layout` into one resolved unit. `path` names the
/// unit in the visited-layouts list and anchors relative imports.
pub fn compile(
    path: &Path,
    layout: &LayoutBoxList,
    library: &FunctionLibrary,
    options: CompileOptions,
) -> Result<Bytecode, LayoutError> {
    debug!("compiling {} ({} boxes)", path.display(), layout.boxes.len());
    let mut parser = Parser::new(path, library, options);
    parser.emit(Instruction::AddLayout(path.display().to_string()));
    if !layout.find_layout {
        parser.emit(Instruction::FoundLayout);
    }
    for layout_box in &layout.boxes {
        parser
            .read_box(layout_box)
            .map_err(|source| parser.box_error(&layout_box.name, source))?;
    }
    parser.emit(Instruction::Ret);
    parser.check_calls()?;

    let mut code = parser.code;
    code.resolve_labels().map_err(|e| match e {
        LayoutError::UnknownLabel(label) => LayoutError::UnknownLabel(
            label
                .strip_prefix(GOTO_PREFIX)
                .map_or(label.clone(), str::to_string),
        ),
        other => other,
    })?;
    trace!("{} instructions for {}", code.len(), path.display());
    Ok(code)
}

// ── Keywords ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keyword {
    If,
    IfNot,
    Elif,
    ElifNot,
    Else,
    While,
    For,
    Goto,
    Function,
    Call,
    Foreach,
    With,
    Between,
    Step,
    SetBegin,
    SetEnd,
    NewView,
    Clear,
    NextTable,
    Error,
    Warning,
    Return,
    Import,
    SetLayout,
    Halt,
    Skip,
    Break,
    Continue,
}

impl Keyword {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "if" => Keyword::If,
            "ifnot" => Keyword::IfNot,
            "elif" => Keyword::Elif,
            "elifnot" => Keyword::ElifNot,
            "else" => Keyword::Else,
            "while" => Keyword::While,
            "for" => Keyword::For,
            "goto" => Keyword::Goto,
            "function" => Keyword::Function,
            "call" => Keyword::Call,
            "foreach" => Keyword::Foreach,
            "with" => Keyword::With,
            "between" => Keyword::Between,
            "step" => Keyword::Step,
            "setbegin" => Keyword::SetBegin,
            "setend" => Keyword::SetEnd,
            "newview" => Keyword::NewView,
            "clear" => Keyword::Clear,
            "nexttable" => Keyword::NextTable,
            "error" => Keyword::Error,
            "warning" => Keyword::Warning,
            "return" => Keyword::Return,
            "import" => Keyword::Import,
            "setlayout" => Keyword::SetLayout,
            "halt" => Keyword::Halt,
            "skip" => Keyword::Skip,
            "break" => Keyword::Break,
            "continue" => Keyword::Continue,
            _ => return None,
        })
    }

    /// Keywords also recognised without the `$` marker.
    fn from_bare(name: &str) -> Option<Self> {
        match name {
            "if" | "ifnot" | "elif" | "elifnot" | "else" | "while" | "for" | "foreach"
            | "with" | "goto" | "function" | "import" | "break" | "continue" | "return"
            | "clear" => Self::from_name(name),
            _ => None,
        }
    }
}

// ── Selector prefixes ─────────────────────────────────────────────────

/// Prefixes that only make sense on the left of a write.
#[derive(Debug, Clone, Copy, Default)]
struct WritePrefixes {
    overwrite: bool,
    force: bool,
    parse_num: bool,
    aggregate: bool,
    capitalize: bool,
}

impl WritePrefixes {
    fn any(&self) -> bool {
        self.overwrite || self.force || self.parse_num || self.aggregate || self.capitalize
    }
}

// ── Parser ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct UserFunction {
    argc: usize,
    needs_view: bool,
}

/// A call to a user function, checked once every box has been read.
#[derive(Debug, Clone)]
struct PendingCall {
    name: String,
    argc: usize,
    offset: usize,
    box_name: String,
    location: String,
    /// Enclosing function, if the call sits in a function body.
    caller: Option<String>,
    has_view: bool,
}

struct Loop {
    continue_label: String,
    break_label: String,
    /// Open views when the loop started.
    views: usize,
}

struct Parser<'a> {
    lex: Lexer<'a>,
    library: &'a FunctionLibrary,
    options: CompileOptions,
    dir: &'a Path,
    code: Bytecode,
    label_count: usize,
    box_name: String,
    /// Closing instruction of every content view open at the current point.
    views: Vec<Instruction>,
    loops: Vec<Loop>,
    functions: HashMap<String, UserFunction>,
    current_function: Option<String>,
    pending: Vec<PendingCall>,
}

fn decimal_from_f64(value: f64) -> Decimal {
    Decimal::from_unbiased((value * SCALE as f64).round() as i64)
}

fn small_int(tok: &Token<'_>) -> Result<u16, ParseError> {
    tok.value.parse().map_err(|_| ParseError::InvalidNumber {
        offset: tok.offset,
        text: tok.value.to_string(),
    })
}

fn binary_op(kind: TokenKind) -> Option<(u8, Instruction)> {
    Some(match kind {
        TokenKind::Asterisk => (6, Instruction::Mul),
        TokenKind::Slash => (6, Instruction::Div),
        TokenKind::Plus => (5, Instruction::Add),
        TokenKind::Minus => (5, Instruction::Sub),
        TokenKind::Less => (4, Instruction::Lt),
        TokenKind::LessEq => (4, Instruction::Leq),
        TokenKind::Greater => (4, Instruction::Gt),
        TokenKind::GreaterEq => (4, Instruction::Geq),
        TokenKind::Equals => (3, Instruction::Eq),
        TokenKind::NotEquals => (3, Instruction::Neq),
        TokenKind::And => (2, Instruction::And),
        TokenKind::Or => (1, Instruction::Or),
        _ => return None,
    })
}

impl<'a> Parser<'a> {
    fn new(path: &'a Path, library: &'a FunctionLibrary, options: CompileOptions) -> Self {
        Self {
            lex: Lexer::new(""),
            library,
            options,
            dir: path.parent().unwrap_or(Path::new("")),
            code: Bytecode::new(),
            label_count: 0,
            box_name: String::new(),
            views: Vec::new(),
            loops: Vec::new(),
            functions: HashMap::new(),
            current_function: None,
            pending: Vec::new(),
        }
    }

    fn emit(&mut self, instruction: Instruction) {
        self.code.push(instruction);
    }

    fn new_label(&mut self, kind: &str) -> String {
        self.label_count += 1;
        format!("__{kind}_{}", self.label_count)
    }

    fn jump_to(&mut self, label: &str) {
        self.emit(Instruction::Jmp(JumpTarget::label(label)));
    }

    fn label(&mut self, label: String) {
        self.emit(Instruction::Label(label));
    }

    fn box_error(&self, box_name: &str, source: ParseError) -> LayoutError {
        LayoutError::Box {
            box_name: box_name.to_string(),
            location: self.lex.location_info(source.offset()),
            source,
        }
    }

    fn set_script(&mut self, script: &'a str) {
        self.lex = Lexer::with_debug(script, self.options.debug);
    }

    fn emit_comments(&mut self) {
        if !self.options.debug {
            return;
        }
        for line in self.lex.take_comments() {
            self.code.push(Instruction::Comment(line.to_string()));
        }
    }

    // ── Boxes ─────────────────────────────────────────────────────────

    fn read_box(&mut self, layout_box: &'a LayoutBox) -> Result<(), ParseError> {
        trace!("box `{}`", layout_box.name);
        self.box_name.clone_from(&layout_box.name);
        self.set_script("");
        if self.options.debug && !layout_box.name.is_empty() {
            self.emit(Instruction::BoxName(layout_box.name.clone()));
        }
        if !layout_box.goto_label.is_empty() {
            self.label(format!("{GOTO_PREFIX}{}", layout_box.goto_label));
        }
        if layout_box.flags.disabled {
            return Ok(());
        }

        self.emit(Instruction::NewBox);
        let geometry = match layout_box.kind {
            BoxKind::Page => vec![(SpacerIndex::Page, Decimal::from(layout_box.page))],
            BoxKind::Rectangle => vec![
                (SpacerIndex::Page, Decimal::from(layout_box.page)),
                (SpacerIndex::X, decimal_from_f64(layout_box.x)),
                (SpacerIndex::Y, decimal_from_f64(layout_box.y)),
                (SpacerIndex::W, decimal_from_f64(layout_box.w)),
                (SpacerIndex::H, decimal_from_f64(layout_box.h)),
            ],
            BoxKind::WholeFile | BoxKind::NoRead => Vec::new(),
        };
        for (index, value) in geometry {
            self.emit(Instruction::PushNum(value));
            self.emit(Instruction::MoveBox(index));
        }

        self.set_script(&layout_box.spacers);
        self.read_spacers()?;
        if layout_box.flags.spacer_only {
            return Ok(());
        }

        let reads = layout_box.reads_text();
        if reads {
            self.emit(Instruction::ReadBox(ReadOptions {
                kind: layout_box.kind,
                mode: layout_box.mode,
            }));
        }
        if reads {
            self.views.push(Instruction::PopContent);
        }
        self.set_script(&layout_box.script);
        while self.read_statement()? {}
        if let Some(close) = self.views.pop() {
            self.emit(close);
        }
        self.views.clear();
        Ok(())
    }

    /// `name (+|-) expression` entries, optionally separated by `;`.
    fn read_spacers(&mut self) -> Result<(), ParseError> {
        loop {
            self.emit_comments();
            let tok = self.lex.advance()?;
            match tok.kind {
                TokenKind::EndOfFile => return Ok(()),
                TokenKind::Semicolon => continue,
                TokenKind::Identifier => {}
                _ => return Err(unexpected(&tok, TokenKind::Identifier)),
            }
            let index = SpacerIndex::from_name(tok.value).ok_or_else(|| ParseError::InvalidSpacer {
                offset: tok.offset,
                name: tok.value.to_string(),
            })?;
            let sign = self.lex.advance()?;
            let negative = match sign.kind {
                TokenKind::Plus => false,
                TokenKind::Minus => true,
                _ => return Err(unexpected(&sign, TokenKind::Plus)),
            };
            self.read_expression()?;
            if negative {
                self.emit(Instruction::Neg);
            }
            self.emit(Instruction::MoveBox(index));
        }
    }

    // ── Statements ────────────────────────────────────────────────────

    /// Reads one statement; `false` at end of script.
    fn read_statement(&mut self) -> Result<bool, ParseError> {
        self.emit_comments();
        let tok = self.lex.peek()?;
        match tok.kind {
            TokenKind::EndOfFile => return Ok(false),
            TokenKind::Semicolon => {
                self.lex.advance()?;
            }
            TokenKind::BraceBegin => {
                self.lex.advance()?;
                while self.lex.check_next(TokenKind::BraceEnd)?.is_none() {
                    self.read_body()?;
                }
            }
            TokenKind::Function => match Keyword::from_name(tok.function_name()) {
                Some(keyword) => {
                    self.lex.advance()?;
                    self.read_keyword(keyword, tok)?;
                }
                None => {
                    self.read_function(false)?;
                    self.lex.check_next(TokenKind::Semicolon)?;
                }
            },
            TokenKind::Identifier if Keyword::from_bare(tok.value).is_some() => {
                self.lex.advance()?;
                if let Some(keyword) = Keyword::from_bare(tok.value) {
                    self.read_keyword(keyword, tok)?;
                }
            }
            _ => {
                self.read_assignment()?;
                self.lex.check_next(TokenKind::Semicolon)?;
            }
        }
        Ok(true)
    }

    /// A statement that must be present.
    fn read_body(&mut self) -> Result<(), ParseError> {
        if self.read_statement()? {
            Ok(())
        } else {
            let tok = self.lex.peek()?;
            Err(ParseError::Unexpected {
                offset: tok.offset,
                text: tok.kind.to_string(),
            })
        }
    }

    /// Assignment or bare call, as used in `for` headers.
    fn read_simple_statement(&mut self) -> Result<(), ParseError> {
        match self.lex.peek()?.kind {
            TokenKind::Comma | TokenKind::ParenEnd => Ok(()),
            TokenKind::Function => self.read_function(false),
            _ => self.read_assignment(),
        }
    }

    fn read_assignment(&mut self) -> Result<(), ParseError> {
        let prefixes = self.read_selector(false)?;
        let mut flags = WriteFlags {
            overwrite: prefixes.overwrite,
            force: prefixes.force,
            ..WriteFlags::SET
        };
        let tok = self.lex.peek()?;
        match tok.kind {
            TokenKind::Assign => {
                self.lex.advance()?;
                self.read_expression()?;
            }
            TokenKind::Overwrite => {
                self.lex.advance()?;
                flags.overwrite = true;
                self.read_expression()?;
            }
            TokenKind::AddTo | TokenKind::SubTo => {
                self.lex.advance()?;
                self.read_expression()?;
                flags.mode = if tok.kind == TokenKind::AddTo {
                    WriteMode::Increase
                } else {
                    WriteMode::Decrease
                };
            }
            TokenKind::Increment | TokenKind::Decrement => {
                self.lex.advance()?;
                self.emit(Instruction::PushNum(Decimal::ONE));
                flags.mode = if tok.kind == TokenKind::Increment {
                    WriteMode::Increase
                } else {
                    WriteMode::Decrease
                };
            }
            _ => {
                self.require_view(tok.offset)?;
                self.emit(Instruction::PushView);
            }
        }

        for (wrap, name) in [
            (prefixes.parse_num, "num"),
            (prefixes.aggregate, "aggregate"),
            (prefixes.capitalize, "capitalize"),
        ] {
            if wrap {
                self.emit(Instruction::Call(FunctionCall {
                    name: name.to_string(),
                    argc: 1,
                }));
            }
        }
        self.emit(Instruction::SetVar(flags));
        Ok(())
    }

    /// Parses `prefixes name [suffix]` and emits the `SELVAR` (plus any
    /// dynamic index code before it).
    fn read_selector(&mut self, read_only: bool) -> Result<WritePrefixes, ParseError> {
        let mut prefixes = WritePrefixes::default();
        let mut global = false;
        let name_tok = loop {
            let tok = self.lex.advance()?;
            let slot = match tok.kind {
                TokenKind::Identifier => break tok,
                TokenKind::Asterisk => &mut global,
                TokenKind::Tilde => &mut prefixes.overwrite,
                TokenKind::Not => &mut prefixes.force,
                TokenKind::Percent => &mut prefixes.parse_num,
                TokenKind::Caret => &mut prefixes.aggregate,
                TokenKind::Quote => &mut prefixes.capitalize,
                _ => return Err(unexpected(&tok, TokenKind::Identifier)),
            };
            if *slot {
                return Err(ParseError::DuplicatePrefix {
                    offset: tok.offset,
                    prefix: tok.value.chars().next().unwrap_or('?'),
                });
            }
            *slot = true;
            if read_only && tok.kind != TokenKind::Asterisk {
                return Err(ParseError::ReadOnlyContext {
                    offset: tok.offset,
                    what: tok.value.to_string(),
                });
            }
        };

        let mut desc = SelectorDesc::new(name_tok.value);
        desc.flags.global = global;
        if let Some(open) = self.lex.check_next(TokenKind::BracketBegin)? {
            self.read_index(&mut desc, read_only, open.offset)?;
        }
        self.emit(Instruction::Select(desc));
        Ok(prefixes)
    }

    fn read_index(&mut self, desc: &mut SelectorDesc, read_only: bool, offset: usize) -> Result<(), ParseError> {
        let write_only = |what: &str| -> Result<(), ParseError> {
            if read_only {
                Err(ParseError::ReadOnlyContext {
                    offset,
                    what: what.to_string(),
                })
            } else {
                Ok(())
            }
        };

        let tok = self.lex.peek()?;
        match tok.kind {
            // name[]
            TokenKind::BracketEnd => {
                write_only("[]")?;
                desc.flags.append = true;
            }
            // name[:] and name[:N]
            TokenKind::Colon => {
                self.lex.advance()?;
                if let Some(count) = self.lex.check_next(TokenKind::Integer)? {
                    write_only("[:N]")?;
                    desc.flags.append = true;
                    desc.length = small_int(&count)?;
                } else {
                    write_only("[:]")?;
                    desc.flags.each = true;
                }
            }
            // name[N], name[N:M], name[N:expr]
            TokenKind::Integer if self.static_index_follows()? => {
                self.lex.advance()?;
                desc.flags.indexed = true;
                desc.index = small_int(&tok)?;
                if self.lex.check_next(TokenKind::Colon)?.is_some() {
                    write_only("[a:b]")?;
                    match self.lex.check_next(TokenKind::Integer)? {
                        Some(len) if self.lex.peek()?.kind == TokenKind::BracketEnd => {
                            desc.length = small_int(&len)?;
                        }
                        Some(len) => {
                            // `[N:M + expr]`: the rest is an expression
                            self.emit(Instruction::PushNum(Decimal::from(i32::from(desc.index))));
                            self.emit(Instruction::PushNum(Decimal::from(i32::from(small_int(&len)?))));
                            self.continue_expression()?;
                            desc.flags.dyn_index = true;
                            desc.flags.dyn_length = true;
                        }
                        None => {
                            self.emit(Instruction::PushNum(Decimal::from(i32::from(desc.index))));
                            self.read_expression()?;
                            desc.flags.dyn_index = true;
                            desc.flags.dyn_length = true;
                        }
                    }
                }
            }
            // name[expr] and name[expr:expr]
            _ => {
                self.read_expression()?;
                desc.flags.indexed = true;
                desc.flags.dyn_index = true;
                if self.lex.check_next(TokenKind::Colon)?.is_some() {
                    write_only("[a:b]")?;
                    self.read_expression()?;
                    desc.flags.dyn_length = true;
                }
            }
        }
        self.lex.require(TokenKind::BracketEnd)?;
        Ok(())
    }

    /// True when the upcoming integer is a whole index, i.e. followed by
    /// `]` or `:`.
    fn static_index_follows(&mut self) -> Result<bool, ParseError> {
        let mut ahead = self.lex.clone();
        ahead.advance()?;
        Ok(matches!(
            ahead.peek()?.kind,
            TokenKind::BracketEnd | TokenKind::Colon
        ))
    }

    // ── Keywords ──────────────────────────────────────────────────────

    fn paren_expression(&mut self) -> Result<(), ParseError> {
        self.lex.require(TokenKind::ParenBegin)?;
        self.read_expression()?;
        self.lex.require(TokenKind::ParenEnd)?;
        Ok(())
    }

    /// Accepts an optional `()`.
    fn empty_parens(&mut self) -> Result<(), ParseError> {
        if self.lex.check_next(TokenKind::ParenBegin)?.is_some() {
            self.lex.require(TokenKind::ParenEnd)?;
        }
        self.lex.check_next(TokenKind::Semicolon)?;
        Ok(())
    }

    fn string_argument(&mut self) -> Result<String, ParseError> {
        self.lex.require(TokenKind::ParenBegin)?;
        let tok = self.lex.require(TokenKind::String)?;
        self.lex.require(TokenKind::ParenEnd)?;
        self.lex.check_next(TokenKind::Semicolon)?;
        tok.parse_string()
    }

    fn peek_keyword(&mut self) -> Result<Option<Keyword>, ParseError> {
        let tok = self.lex.peek()?;
        Ok(match tok.kind {
            TokenKind::Function => Keyword::from_name(tok.function_name()),
            TokenKind::Identifier => Keyword::from_bare(tok.value),
            _ => None,
        })
    }

    fn require_view(&mut self, offset: usize) -> Result<(), ParseError> {
        if !self.views.is_empty() {
            return Ok(());
        }
        if let Some(name) = &self.current_function {
            if let Some(function) = self.functions.get_mut(name) {
                function.needs_view = true;
            }
            return Ok(());
        }
        Err(ParseError::NoContentView { offset })
    }

    fn with_loop<F>(&mut self, continue_label: &str, break_label: &str, body: F) -> Result<(), ParseError>
    where
        F: FnOnce(&mut Self) -> Result<(), ParseError>,
    {
        self.loops.push(Loop {
            continue_label: continue_label.to_string(),
            break_label: break_label.to_string(),
            views: self.views.len(),
        });
        let result = body(self);
        self.loops.pop();
        result
    }

    /// Compiles `body` inside a view, then emits `close` to leave it.
    fn with_view<F>(&mut self, close: Instruction, body: F) -> Result<(), ParseError>
    where
        F: FnOnce(&mut Self) -> Result<(), ParseError>,
    {
        self.views.push(close);
        let result = body(self);
        if let Some(close) = self.views.pop() {
            self.emit(close);
        }
        result
    }

    /// Emits the closing instructions of the views opened above `depth`,
    /// innermost first, without forgetting them.
    fn close_views_to(&mut self, depth: usize) {
        let closing: Vec<_> = self.views[depth.min(self.views.len())..]
            .iter()
            .rev()
            .cloned()
            .collect();
        for close in closing {
            self.emit(close);
        }
    }

    fn read_keyword(&mut self, keyword: Keyword, tok: Token<'a>) -> Result<(), ParseError> {
        match keyword {
            Keyword::If | Keyword::IfNot => self.read_if(keyword == Keyword::IfNot)?,
            Keyword::Elif | Keyword::ElifNot | Keyword::Else => {
                return Err(ParseError::Unexpected {
                    offset: tok.offset,
                    text: tok.value.to_string(),
                });
            }
            Keyword::While => {
                let top = self.new_label("while");
                let end = self.new_label("endwhile");
                self.label(top.clone());
                self.paren_expression()?;
                self.emit(Instruction::Jz(JumpTarget::label(&end)));
                self.with_loop(&top, &end, |p| p.read_body())?;
                self.jump_to(&top);
                self.label(end);
            }
            Keyword::For => self.read_for()?,
            Keyword::Goto => {
                let parens = self.lex.check_next(TokenKind::ParenBegin)?.is_some();
                let name = self.lex.require(TokenKind::Identifier)?;
                if parens {
                    self.lex.require(TokenKind::ParenEnd)?;
                }
                self.lex.check_next(TokenKind::Semicolon)?;
                self.jump_to(&format!("{GOTO_PREFIX}{}", name.value));
            }
            Keyword::Function => self.read_function_definition(tok)?,
            Keyword::Call => {
                self.lex.require(TokenKind::ParenBegin)?;
                let name = self.lex.require(TokenKind::Identifier)?;
                self.lex.require(TokenKind::ParenEnd)?;
                self.lex.check_next(TokenKind::Semicolon)?;
                self.call_user_function(name.value, 0, name.offset, false);
            }
            Keyword::Foreach => self.read_foreach(tok)?,
            Keyword::With => {
                self.paren_expression()?;
                self.emit(Instruction::PushContent);
                self.with_view(Instruction::PopContent, |p| p.read_body())?;
            }
            Keyword::Between => self.read_between(tok)?,
            Keyword::Step => self.read_step(tok)?,
            Keyword::SetBegin | Keyword::SetEnd => {
                self.require_view(tok.offset)?;
                self.paren_expression()?;
                self.lex.check_next(TokenKind::Semicolon)?;
                self.emit(if keyword == Keyword::SetBegin {
                    Instruction::SetBegin
                } else {
                    Instruction::SetEnd
                });
            }
            Keyword::NewView => {
                self.require_view(tok.offset)?;
                if self.lex.check_next(TokenKind::ParenBegin)?.is_some() {
                    self.lex.require(TokenKind::ParenEnd)?;
                }
                self.emit(Instruction::NewView);
                self.with_view(Instruction::ResetView, |p| p.read_body())?;
            }
            Keyword::Clear => {
                self.lex.require(TokenKind::ParenBegin)?;
                let at = self.lex.peek()?.offset;
                if self.read_selector(false)?.any() {
                    return Err(ParseError::Unexpected {
                        offset: at,
                        text: "clear".to_string(),
                    });
                }
                self.lex.require(TokenKind::ParenEnd)?;
                self.lex.check_next(TokenKind::Semicolon)?;
                self.emit(Instruction::Clear);
            }
            Keyword::NextTable => {
                self.empty_parens()?;
                self.emit(Instruction::NextTable);
            }
            Keyword::Error | Keyword::Warning => {
                self.paren_expression()?;
                self.lex.check_next(TokenKind::Semicolon)?;
                self.emit(if keyword == Keyword::Error {
                    Instruction::ThrowError
                } else {
                    Instruction::Warning
                });
            }
            Keyword::Return => {
                if self.lex.check_next(TokenKind::ParenBegin)?.is_some()
                    && self.lex.check_next(TokenKind::ParenEnd)?.is_none()
                {
                    self.read_expression()?;
                    self.lex.require(TokenKind::ParenEnd)?;
                    self.emit(Instruction::SetRetVal);
                }
                self.lex.check_next(TokenKind::Semicolon)?;
                self.close_views_to(0);
                self.emit(Instruction::Ret);
            }
            Keyword::Import | Keyword::SetLayout => {
                let stem = self.string_argument()?;
                let path = self.dir.join(stem);
                self.emit(Instruction::Import(path.to_string_lossy().into_owned()));
                if keyword == Keyword::SetLayout {
                    self.emit(Instruction::Halt);
                }
            }
            Keyword::Halt => {
                self.empty_parens()?;
                self.emit(Instruction::Halt);
            }
            Keyword::Skip => self.empty_parens()?,
            Keyword::Break | Keyword::Continue => {
                self.empty_parens()?;
                let target = self.loops.last().map(|l| {
                    let label = if keyword == Keyword::Break {
                        &l.break_label
                    } else {
                        &l.continue_label
                    };
                    (label.clone(), l.views)
                });
                let Some((target, depth)) = target else {
                    return Err(ParseError::NotInLoop {
                        offset: tok.offset,
                        keyword: tok.function_name().to_string(),
                    });
                };
                self.close_views_to(depth);
                self.jump_to(&target);
            }
        }
        Ok(())
    }

    fn read_if(&mut self, negated: bool) -> Result<(), ParseError> {
        let end = self.new_label("endif");
        let mut negated = negated;
        loop {
            let next = self.new_label("else");
            self.paren_expression()?;
            self.emit(if negated {
                Instruction::Jnz(JumpTarget::label(&next))
            } else {
                Instruction::Jz(JumpTarget::label(&next))
            });
            self.read_body()?;

            match self.peek_keyword()? {
                Some(kw @ (Keyword::Elif | Keyword::ElifNot)) => {
                    self.lex.advance()?;
                    self.jump_to(&end);
                    self.label(next);
                    negated = kw == Keyword::ElifNot;
                }
                Some(Keyword::Else) => {
                    self.lex.advance()?;
                    self.jump_to(&end);
                    self.label(next);
                    self.read_body()?;
                    break;
                }
                _ => {
                    self.label(next);
                    break;
                }
            }
        }
        self.label(end);
        Ok(())
    }

    /// `for (init, cond, step) body`; the step code is moved after the body.
    fn read_for(&mut self) -> Result<(), ParseError> {
        let top = self.new_label("for");
        let next = self.new_label("forstep");
        let end = self.new_label("endfor");

        self.lex.require(TokenKind::ParenBegin)?;
        self.read_simple_statement()?;
        self.lex.require(TokenKind::Comma)?;
        self.label(top.clone());
        if self.lex.peek()?.kind == TokenKind::Comma {
            self.emit(Instruction::PushNum(Decimal::ONE));
        } else {
            self.read_expression()?;
        }
        self.emit(Instruction::Jz(JumpTarget::label(&end)));
        self.lex.require(TokenKind::Comma)?;

        let step_start = self.code.len();
        self.read_simple_statement()?;
        let step = self.code.instructions.split_off(step_start);
        self.lex.require(TokenKind::ParenEnd)?;

        self.with_loop(&next, &end, |p| p.read_body())?;
        self.label(next);
        self.code.instructions.extend(step);
        self.jump_to(&top);
        self.label(end);
        Ok(())
    }

    /// Pushes the optional `(expr)` as a new content view; returns whether it
    /// did so.
    fn optional_content(&mut self, tok: &Token<'_>) -> Result<bool, ParseError> {
        let mut pushed = false;
        if self.lex.check_next(TokenKind::ParenBegin)?.is_some()
            && self.lex.check_next(TokenKind::ParenEnd)?.is_none()
        {
            self.read_expression()?;
            self.lex.require(TokenKind::ParenEnd)?;
            self.emit(Instruction::PushContent);
            pushed = true;
        }
        if !pushed {
            self.require_view(tok.offset)?;
        }
        Ok(pushed)
    }

    fn read_foreach(&mut self, tok: Token<'a>) -> Result<(), ParseError> {
        let pushed = self.optional_content(&tok)?;
        let top = self.new_label("foreach");
        let end = self.new_label("endforeach");
        self.emit(Instruction::NewSubview);
        self.label(top.clone());
        self.emit(Instruction::NextResult);
        self.emit(Instruction::Jte(JumpTarget::label(&end)));
        let close = if pushed {
            Instruction::PopContent
        } else {
            Instruction::ResetView
        };
        self.views.push(close);
        let result = self.with_loop(&top, &end, |p| p.read_body());
        let close = self.views.pop();
        result?;
        self.jump_to(&top);
        self.label(end);
        if let Some(close) = close {
            self.emit(close);
        }
        Ok(())
    }

    fn read_step(&mut self, tok: Token<'a>) -> Result<(), ParseError> {
        let pushed = self.optional_content(&tok)?;
        self.emit(Instruction::NewSubview);
        self.lex.require(TokenKind::BraceBegin)?;
        let close = if pushed {
            Instruction::PopContent
        } else {
            Instruction::ResetView
        };
        self.with_view(close, |p| {
            while p.lex.check_next(TokenKind::BraceEnd)?.is_none() {
                p.emit(Instruction::NextResult);
                p.read_body()?;
            }
            Ok(())
        })
    }

    /// `between(a[, b]) body`: narrows the view to start at `a` and end
    /// before the first `b` that follows it.
    fn read_between(&mut self, tok: Token<'a>) -> Result<(), ParseError> {
        self.require_view(tok.offset)?;
        self.lex.require(TokenKind::ParenBegin)?;
        let start = self.code.len();
        self.read_expression()?;
        let begin_code = self.code.instructions.split_off(start);

        self.emit(Instruction::NewView);
        self.emit(Instruction::PushView);
        self.code.instructions.extend(begin_code.iter().cloned());
        self.emit_call("indexof", 2);
        self.emit(Instruction::SetBegin);

        if self.lex.check_next(TokenKind::Comma)?.is_some() {
            self.emit(Instruction::PushView);
            self.read_expression()?;
            self.code.instructions.extend(begin_code);
            self.emit_call("strlen", 1);
            self.emit_call("indexof", 3);
            self.emit(Instruction::SetEnd);
        }
        self.lex.require(TokenKind::ParenEnd)?;
        self.with_view(Instruction::ResetView, |p| p.read_body())
    }

    fn read_function_definition(&mut self, tok: Token<'a>) -> Result<(), ParseError> {
        if self.current_function.is_some() {
            return Err(ParseError::Unexpected {
                offset: tok.offset,
                text: tok.value.to_string(),
            });
        }
        self.lex.require(TokenKind::ParenBegin)?;
        let name = self.lex.require(TokenKind::Identifier)?;
        let argc = match self.lex.check_next(TokenKind::Comma)? {
            Some(_) => small_int(&self.lex.require(TokenKind::Integer)?)? as usize,
            None => 0,
        };
        self.lex.require(TokenKind::ParenEnd)?;

        if self.library.contains(name.value) || self.functions.contains_key(name.value) {
            return Err(ParseError::Unexpected {
                offset: name.offset,
                text: name.value.to_string(),
            });
        }
        self.functions.insert(
            name.value.to_string(),
            UserFunction {
                argc,
                needs_view: false,
            },
        );

        let skip = self.new_label("endfunction");
        self.jump_to(&skip);
        self.label(format!("{FUNCTION_PREFIX}{}", name.value));

        let saved_views = std::mem::take(&mut self.views);
        let saved_loops = std::mem::take(&mut self.loops);
        self.current_function = Some(name.value.to_string());
        let result = self.read_body();
        self.current_function = None;
        self.loops = saved_loops;
        self.views = saved_views;
        result?;

        self.emit(Instruction::Ret);
        self.label(skip);
        Ok(())
    }

    fn call_user_function(&mut self, name: &str, argc: usize, offset: usize, value: bool) {
        self.pending.push(PendingCall {
            name: name.to_string(),
            argc,
            offset,
            box_name: self.box_name.clone(),
            location: self.lex.location_info(offset),
            caller: self.current_function.clone(),
            has_view: !self.views.is_empty(),
        });
        self.emit(Instruction::CallSub(SubroutineCall {
            target: JumpTarget::label(format!("{FUNCTION_PREFIX}{name}")),
            argc: argc.min(u8::MAX as usize) as u8,
            value,
        }));
    }

    /// Validates every user-function call now that all definitions are known.
    fn check_calls(&mut self) -> Result<(), LayoutError> {
        // a function needs a view when it calls one that does without opening
        // its own
        loop {
            let mut changed = false;
            for call in &self.pending {
                let Some(caller) = &call.caller else {
                    continue;
                };
                let callee_needs = self.functions.get(&call.name).is_some_and(|f| f.needs_view);
                if !call.has_view && callee_needs {
                    if let Some(f) = self.functions.get_mut(caller) {
                        changed |= !f.needs_view;
                        f.needs_view = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        for call in &self.pending {
            let fail = |source: ParseError| LayoutError::Box {
                box_name: call.box_name.clone(),
                source,
                location: call.location.clone(),
            };
            let Some(function) = self.functions.get(&call.name) else {
                return Err(fail(ParseError::UnknownFunction {
                    offset: call.offset,
                    name: call.name.clone(),
                }));
            };
            if function.argc != call.argc {
                return Err(fail(ParseError::InvalidArgumentCount {
                    offset: call.offset,
                    name: call.name.clone(),
                    expected: function.argc.to_string(),
                    got: call.argc,
                }));
            }
            if call.caller.is_none() && !call.has_view && function.needs_view {
                return Err(fail(ParseError::NoContentView {
                    offset: call.offset,
                }));
            }
        }
        Ok(())
    }

    // ── Expressions ───────────────────────────────────────────────────

    fn read_expression(&mut self) -> Result<(), ParseError> {
        self.sub_expression()?;
        self.read_binary(1)
    }

    /// Finishes an expression whose first operand has already been emitted.
    fn continue_expression(&mut self) -> Result<(), ParseError> {
        self.read_binary(1)
    }

    /// Precedence climbing over the operand already on the stack.
    fn read_binary(&mut self, min_prec: u8) -> Result<(), ParseError> {
        while let Some((prec, op)) = binary_op(self.lex.peek()?.kind) {
            if prec < min_prec {
                break;
            }
            self.lex.advance()?;
            self.sub_expression()?;
            while let Some((next, _)) = binary_op(self.lex.peek()?.kind) {
                if next <= prec {
                    break;
                }
                self.read_binary(next)?;
            }
            self.emit(op);
        }
        Ok(())
    }

    fn number(&self, tok: &Token<'_>, negative: bool) -> Result<Decimal, ParseError> {
        let invalid = || ParseError::InvalidNumber {
            offset: tok.offset,
            text: tok.value.to_string(),
        };
        let n = Decimal::parse(tok.value).ok_or_else(invalid)?;
        if negative {
            n.checked_neg().ok_or_else(invalid)
        } else {
            Ok(n)
        }
    }

    fn sub_expression(&mut self) -> Result<(), ParseError> {
        let tok = self.lex.peek()?;
        match tok.kind {
            TokenKind::ParenBegin => {
                self.lex.advance()?;
                self.read_expression()?;
                self.lex.require(TokenKind::ParenEnd)?;
            }
            TokenKind::Function => self.read_function(true)?,
            TokenKind::Not => {
                self.lex.advance()?;
                self.sub_expression()?;
                self.emit(Instruction::Not);
            }
            TokenKind::Minus => {
                self.lex.advance()?;
                let next = self.lex.peek()?;
                if matches!(next.kind, TokenKind::Integer | TokenKind::Number) {
                    self.lex.advance()?;
                    let n = self.number(&next, true)?;
                    self.emit(Instruction::PushNum(n));
                } else {
                    self.sub_expression()?;
                    self.emit(Instruction::Neg);
                }
            }
            TokenKind::Plus => {
                self.lex.advance()?;
                self.sub_expression()?;
            }
            TokenKind::Integer | TokenKind::Number => {
                self.lex.advance()?;
                let n = self.number(&tok, false)?;
                self.emit(Instruction::PushNum(n));
            }
            TokenKind::Slash => {
                let regex = self.lex.require_regex()?;
                self.emit(Instruction::PushStr(regex.parse_regex()));
            }
            TokenKind::String => {
                self.lex.advance()?;
                let s = tok.parse_string()?;
                self.emit(Instruction::PushStr(s));
            }
            TokenKind::Content => {
                self.lex.advance()?;
                self.require_view(tok.offset)?;
                self.emit(Instruction::PushView);
            }
            TokenKind::Identifier if matches!(tok.value, "true" | "false" | "null") => {
                self.lex.advance()?;
                self.emit(match tok.value {
                    "true" => Instruction::PushNum(Decimal::ONE),
                    "false" => Instruction::PushNum(Decimal::ZERO),
                    _ => Instruction::PushNull,
                });
            }
            TokenKind::Identifier
            | TokenKind::Asterisk
            | TokenKind::Tilde
            | TokenKind::Percent
            | TokenKind::Caret
            | TokenKind::Quote => {
                self.read_selector(true)?;
                self.emit(Instruction::PushVar);
            }
            _ => {
                return Err(ParseError::Unexpected {
                    offset: tok.offset,
                    text: tok.value.to_string(),
                });
            }
        }
        Ok(())
    }

    fn emit_call(&mut self, name: &str, argc: u8) {
        self.emit(Instruction::Call(FunctionCall {
            name: name.to_string(),
            argc,
        }));
    }

    /// `$name(args...)` in expression (`value`) or statement position.
    fn read_function(&mut self, value: bool) -> Result<(), ParseError> {
        let tok = self.lex.require(TokenKind::Function)?;
        let name = tok.function_name();
        match name {
            "isset" | "size" => {
                self.lex.require(TokenKind::ParenBegin)?;
                self.read_selector(true)?;
                self.lex.require(TokenKind::ParenEnd)?;
                self.emit(if name == "isset" {
                    Instruction::IsSet
                } else {
                    Instruction::GetSize
                });
            }
            "arg" => {
                self.lex.require(TokenKind::ParenBegin)?;
                let index = self.lex.require(TokenKind::Integer)?;
                self.lex.require(TokenKind::ParenEnd)?;
                let n = small_int(&index)? as usize;
                let declared = self
                    .current_function
                    .as_ref()
                    .and_then(|f| self.functions.get(f))
                    .map(|f| f.argc);
                match declared {
                    Some(argc) if n < argc => self.emit(Instruction::PushArg(n as u8)),
                    Some(argc) => {
                        return Err(ParseError::InvalidArgumentCount {
                            offset: index.offset,
                            name: "arg".to_string(),
                            expected: format!("an index below {argc}"),
                            got: n,
                        });
                    }
                    None => {
                        return Err(ParseError::Unexpected {
                            offset: tok.offset,
                            text: tok.value.to_string(),
                        });
                    }
                }
            }
            _ => {
                let argc = self.read_arguments()?;
                if let Some(function) = self.library.get(name) {
                    if !function.accepts(argc) || argc > u8::MAX as usize {
                        return Err(ParseError::InvalidArgumentCount {
                            offset: tok.offset,
                            name: name.to_string(),
                            expected: function.arity(),
                            got: argc,
                        });
                    }
                    self.emit_call(name, argc as u8);
                } else {
                    self.call_user_function(name, argc, tok.offset, value);
                    return Ok(());
                }
            }
        }
        if !value {
            self.emit(Instruction::Pop);
        }
        Ok(())
    }

    /// `( [expr {, expr}] )`, returning the argument count.
    fn read_arguments(&mut self) -> Result<usize, ParseError> {
        self.lex.require(TokenKind::ParenBegin)?;
        let mut argc = 0;
        if self.lex.check_next(TokenKind::ParenEnd)?.is_some() {
            return Ok(0);
        }
        loop {
            self.read_expression()?;
            argc += 1;
            let tok = self.lex.advance()?;
            match tok.kind {
                TokenKind::Comma => continue,
                TokenKind::ParenEnd => return Ok(argc),
                _ => return Err(unexpected(&tok, TokenKind::ParenEnd)),
            }
        }
    }
}
