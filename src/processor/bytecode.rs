//! Instruction set produced by the compiler and run by the VM.

use std::collections::HashMap;
use std::fmt;

use crate::model::{BoxKind, ReadMode};

use super::decimal::Decimal;
use super::error::LayoutError;
use super::variables::{WriteFlags, WriteMode};

/// Box coordinate adjusted by a `MoveBox` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpacerIndex {
    Page,
    X,
    Y,
    W,
    H,
    /// Moves the top edge: `y += n, h -= n`.
    Top,
    /// Moves the right edge: `w += n`.
    Right,
    /// Moves the bottom edge: `h += n`.
    Bottom,
    /// Moves the left edge: `x += n, w -= n`.
    Left,
}

impl SpacerIndex {
    pub const ALL: [SpacerIndex; 9] = [
        SpacerIndex::Page,
        SpacerIndex::X,
        SpacerIndex::Y,
        SpacerIndex::W,
        SpacerIndex::H,
        SpacerIndex::Top,
        SpacerIndex::Right,
        SpacerIndex::Bottom,
        SpacerIndex::Left,
    ];

    /// Spacer names accepted in spacer scripts.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "p" | "page" => SpacerIndex::Page,
            "x" => SpacerIndex::X,
            "y" => SpacerIndex::Y,
            "w" | "width" => SpacerIndex::W,
            "h" | "height" => SpacerIndex::H,
            "t" | "top" => SpacerIndex::Top,
            "r" | "right" => SpacerIndex::Right,
            "b" | "bottom" => SpacerIndex::Bottom,
            "l" | "left" => SpacerIndex::Left,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            SpacerIndex::Page => "page",
            SpacerIndex::X => "x",
            SpacerIndex::Y => "y",
            SpacerIndex::W => "width",
            SpacerIndex::H => "height",
            SpacerIndex::Top => "top",
            SpacerIndex::Right => "right",
            SpacerIndex::Bottom => "bottom",
            SpacerIndex::Left => "left",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    pub kind: BoxKind,
    pub mode: ReadMode,
}

/// Selector flags; packed into one byte in the binary form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SelectFlags {
    pub global: bool,
    /// An explicit index is given (`index` or popped).
    pub indexed: bool,
    /// Pop the index from the stack.
    pub dyn_index: bool,
    /// Pop the length from the stack (popped before the index).
    pub dyn_length: bool,
    pub append: bool,
    pub each: bool,
}

impl SelectFlags {
    pub fn bits(self) -> u8 {
        [
            self.global,
            self.indexed,
            self.dyn_index,
            self.dyn_length,
            self.append,
            self.each,
        ]
        .iter()
        .enumerate()
        .fold(0, |acc, (i, &set)| acc | ((set as u8) << i))
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits >> 6 != 0 {
            return None;
        }
        let bit = |i: u8| bits & (1 << i) != 0;
        Some(Self {
            global: bit(0),
            indexed: bit(1),
            dyn_index: bit(2),
            dyn_length: bit(3),
            append: bit(4),
            each: bit(5),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorDesc {
    pub name: String,
    pub flags: SelectFlags,
    pub index: u16,
    pub length: u16,
}

impl SelectorDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: SelectFlags::default(),
            index: 0,
            length: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub name: String,
    pub argc: u8,
}

/// Jump operand: a label name until the unit is resolved, then an offset
/// relative to the jumping instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JumpTarget {
    Label(String),
    Offset(i32),
}

impl JumpTarget {
    pub fn label(name: impl Into<String>) -> Self {
        JumpTarget::Label(name.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubroutineCall {
    pub target: JumpTarget,
    pub argc: u8,
    /// Push the subroutine's return value when it returns.
    pub value: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Nop,
    Comment(String),
    BoxName(String),
    /// Jump target marker; removed by [`Bytecode::resolve_labels`].
    Label(String),

    NewBox,
    MoveBox(SpacerIndex),
    ReadBox(ReadOptions),
    NextTable,

    Select(SelectorDesc),
    SetVar(WriteFlags),
    Clear,
    PushVar,
    IsSet,
    GetSize,

    PushView,
    PushNull,
    PushNum(Decimal),
    PushStr(String),
    PushArg(u8),
    Call(FunctionCall),
    Pop,

    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    And,
    Or,
    Not,
    Neg,

    PushContent,
    PopContent,
    NewView,
    NewSubview,
    ResetView,
    NextResult,
    SetBegin,
    SetEnd,

    ThrowError,
    Warning,

    Jmp(JumpTarget),
    Jz(JumpTarget),
    Jnz(JumpTarget),
    /// Jump when the current view is exhausted.
    Jte(JumpTarget),
    CallSub(SubroutineCall),
    SetRetVal,
    Ret,
    Import(String),
    AddLayout(String),
    /// Stops a reader that is looking for the layout of a document.
    FoundLayout,
    Halt,
}

impl Instruction {
    /// Mnemonic used by the disassembly listing.
    pub fn name(&self) -> &'static str {
        use Instruction::*;
        match self {
            Nop => "NOP",
            Comment(_) => "COMMENT",
            BoxName(_) => "BOXNAME",
            Label(_) => "LABEL",
            NewBox => "NEWBOX",
            MoveBox(_) => "MVBOX",
            ReadBox(_) => "RDBOX",
            NextTable => "NEXTTABLE",
            Select(_) => "SELVAR",
            SetVar(_) => "SETVAR",
            Clear => "CLEAR",
            PushVar => "PUSHVAR",
            IsSet => "ISSET",
            GetSize => "GETSIZE",
            PushView => "PUSHVIEW",
            PushNull => "PUSHNULL",
            PushNum(_) => "PUSHNUM",
            PushStr(_) => "PUSHSTR",
            PushArg(_) => "PUSHARG",
            Call(_) => "CALL",
            Pop => "POP",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Eq => "EQ",
            Neq => "NEQ",
            Lt => "LT",
            Leq => "LEQ",
            Gt => "GT",
            Geq => "GEQ",
            And => "AND",
            Or => "OR",
            Not => "NOT",
            Neg => "NEG",
            PushContent => "ADDCONTENT",
            PopContent => "POPCONTENT",
            NewView => "NEWVIEW",
            NewSubview => "SUBVIEW",
            ResetView => "RESETVIEW",
            NextResult => "NEXTRESULT",
            SetBegin => "SETBEGIN",
            SetEnd => "SETEND",
            ThrowError => "THROWERROR",
            Warning => "WARNING",
            Jmp(_) => "JMP",
            Jz(_) => "JZ",
            Jnz(_) => "JNZ",
            Jte(_) => "JTE",
            CallSub(s) if s.value => "JSRVAL",
            CallSub(_) => "JSR",
            SetRetVal => "SETRETVAL",
            Ret => "RET",
            Import(_) => "IMPORT",
            AddLayout(_) => "ADDLAYOUT",
            FoundLayout => "FOUNDLAYOUT",
            Halt => "HLT",
        }
    }

    pub fn jump_target(&self) -> Option<&JumpTarget> {
        match self {
            Instruction::Jmp(t) | Instruction::Jz(t) | Instruction::Jnz(t) | Instruction::Jte(t) => Some(t),
            Instruction::CallSub(call) => Some(&call.target),
            _ => None,
        }
    }

    fn jump_target_mut(&mut self) -> Option<&mut JumpTarget> {
        match self {
            Instruction::Jmp(t) | Instruction::Jz(t) | Instruction::Jnz(t) | Instruction::Jte(t) => Some(t),
            Instruction::CallSub(call) => Some(&mut call.target),
            _ => None,
        }
    }
}

fn quote(s: &str) -> String {
    format!("{s:?}")
}

impl fmt::Display for JumpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JumpTarget::Label(label) => f.write_str(label),
            JumpTarget::Offset(offset) => write!(f, "{offset:+}"),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        match self {
            Instruction::Comment(s)
            | Instruction::BoxName(s)
            | Instruction::PushStr(s)
            | Instruction::Import(s)
            | Instruction::AddLayout(s) => write!(f, " {}", quote(s)),
            Instruction::Label(label) => write!(f, " {label}"),
            Instruction::MoveBox(idx) => write!(f, " {}", idx.name()),
            Instruction::ReadBox(opts) => write!(f, " {} {}", opts.kind, opts.mode),
            Instruction::Select(sel) => {
                write!(f, " {}", sel.name)?;
                let flags = sel.flags;
                let mut marks = String::new();
                for (set, mark) in [
                    (flags.global, 'G'),
                    (flags.indexed, 'I'),
                    (flags.dyn_index, 'D'),
                    (flags.dyn_length, 'L'),
                    (flags.append, 'A'),
                    (flags.each, 'E'),
                ] {
                    if set {
                        marks.push(mark);
                    }
                }
                if !marks.is_empty() {
                    write!(f, " {marks}")?;
                }
                if flags.indexed || flags.append {
                    write!(f, " {}:{}", sel.index, sel.length)?;
                }
                Ok(())
            }
            Instruction::SetVar(flags) => {
                let mode = match flags.mode {
                    WriteMode::Set => "set",
                    WriteMode::Increase => "inc",
                    WriteMode::Decrease => "dec",
                };
                write!(f, " {mode}")?;
                if flags.overwrite {
                    f.write_str(" overwrite")?;
                }
                if flags.force {
                    f.write_str(" force")?;
                }
                Ok(())
            }
            Instruction::PushNum(n) => write!(f, " {n}"),
            Instruction::PushArg(n) => write!(f, " {n}"),
            Instruction::Call(call) => write!(f, " {} {}", call.name, call.argc),
            Instruction::Jmp(t) | Instruction::Jz(t) | Instruction::Jnz(t) | Instruction::Jte(t) => {
                write!(f, " {t}")
            }
            Instruction::CallSub(call) => write!(f, " {} {}", call.target, call.argc),
            _ => Ok(()),
        }
    }
}

/// One compilation unit (or several, once imports are appended).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub instructions: Vec<Instruction>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn get(&self, pc: usize) -> Option<&Instruction> {
        self.instructions.get(pc)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }

    /// Appends another (resolved) unit and returns where it starts. Offsets
    /// are relative, so the appended code needs no fix-up.
    pub fn append(&mut self, other: Bytecode) -> usize {
        let start = self.instructions.len();
        self.instructions.extend(other.instructions);
        start
    }

    pub fn is_resolved(&self) -> bool {
        self.instructions.iter().all(|i| {
            !matches!(i, Instruction::Label(_))
                && !matches!(i.jump_target(), Some(JumpTarget::Label(_)))
        })
    }

    /// Removes every `Label` and rewrites each symbolic jump to an offset
    /// relative to the jump itself.
    pub fn resolve_labels(&mut self) -> Result<(), LayoutError> {
        let mut positions = HashMap::new();
        let mut pos = 0i64;
        for instruction in &self.instructions {
            if let Instruction::Label(name) = instruction {
                if positions.insert(name.clone(), pos).is_some() {
                    return Err(LayoutError::DuplicateLabel(name.clone()));
                }
            } else {
                pos += 1;
            }
        }

        let mut resolved = Vec::with_capacity(pos as usize);
        for mut instruction in std::mem::take(&mut self.instructions) {
            if matches!(instruction, Instruction::Label(_)) {
                continue;
            }
            let here = resolved.len() as i64;
            if let Some(target) = instruction.jump_target_mut() {
                if let JumpTarget::Label(name) = target {
                    let dest = positions
                        .get(name.as_str())
                        .ok_or_else(|| LayoutError::UnknownLabel(name.clone()))?;
                    let offset = relative_offset(*dest, here)
                        .ok_or_else(|| LayoutError::JumpOutOfRange(name.clone()))?;
                    *target = JumpTarget::Offset(offset);
                }
            }
            resolved.push(instruction);
        }
        self.instructions = resolved;
        Ok(())
    }
}

fn relative_offset(dest: i64, here: i64) -> Option<i32> {
    i32::try_from(dest.checked_sub(here)?).ok()
}

impl FromIterator<Instruction> for Bytecode {
    fn from_iter<T: IntoIterator<Item = Instruction>>(iter: T) -> Self {
        Self {
            instructions: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Bytecode {
    type Item = &'a Instruction;
    type IntoIter = std::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.instructions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Instruction::*;

    #[test]
    fn test_resolve_forward_and_backward() {
        let mut code: Bytecode = vec![
            Label("top".into()),
            PushNull,
            Jz(JumpTarget::label("end")),
            Jmp(JumpTarget::label("top")),
            Label("end".into()),
            Halt,
        ]
        .into_iter()
        .collect();
        code.resolve_labels().unwrap();
        assert_eq!(
            code.instructions,
            vec![
                PushNull,
                Jz(JumpTarget::Offset(2)),
                Jmp(JumpTarget::Offset(-2)),
                Halt,
            ]
        );
        assert!(code.is_resolved());
    }

    #[test]
    fn test_unknown_and_duplicate_labels() {
        let mut code: Bytecode = vec![Jmp(JumpTarget::label("nowhere"))].into_iter().collect();
        assert!(matches!(code.resolve_labels(), Err(LayoutError::UnknownLabel(l)) if l == "nowhere"));

        let mut code: Bytecode = vec![Label("a".into()), Label("a".into())].into_iter().collect();
        assert!(matches!(code.resolve_labels(), Err(LayoutError::DuplicateLabel(_))));
    }

    #[test]
    fn test_relative_offsets_fit_in_i32() {
        let test_cases = vec![
            (10, 3, Some(7)),
            (0, 5, Some(-5)),
            (i64::from(i32::MAX), 0, Some(i32::MAX)),
            (i64::from(i32::MAX) + 1, 0, None),
            (0, i64::from(i32::MAX) + 2, None),
            (i64::MIN, 1, None),
        ];
        for (dest, here, expected) in test_cases {
            assert_eq!(relative_offset(dest, here), expected, "{dest} - {here}");
        }
    }

    #[test]
    fn test_select_flag_bits() {
        let flags = SelectFlags {
            global: true,
            dyn_length: true,
            each: true,
            ..SelectFlags::default()
        };
        assert_eq!(SelectFlags::from_bits(flags.bits()), Some(flags));
        assert_eq!(SelectFlags::from_bits(0x80), None);
    }

    #[test]
    fn test_display() {
        let sel = SelectorDesc {
            flags: SelectFlags {
                indexed: true,
                ..SelectFlags::default()
            },
            index: 2,
            ..SelectorDesc::new("x")
        };
        assert_eq!(Select(sel).to_string(), "SELVAR x I 2:1");
        assert_eq!(PushStr("a\"b".into()).to_string(), "PUSHSTR \"a\\\"b\"");
        assert_eq!(Jz(JumpTarget::Offset(3)).to_string(), "JZ +3");
        assert_eq!(
            CallSub(SubroutineCall {
                target: JumpTarget::Offset(-4),
                argc: 1,
                value: true
            })
            .to_string(),
            "JSRVAL -4 1"
        );
    }
}
