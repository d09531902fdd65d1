//! Binary form of a resolved bytecode program.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! magic        4 bytes  "BLS\x01"
//! count        u32      number of instructions
//! pool_offset  u32      byte offset of the string pool
//! records      count x (u8 opcode tag + payload)
//! pool_count   u32
//! pool         pool_count x (u16 length + UTF-8 bytes)
//! ```
//!
//! String operands are u16 indices into the pool, decimals are the raw
//! scaled i64, jump targets are i32 offsets.

use std::collections::HashMap;

use crate::model::{BoxKind, ReadMode};

use super::bytecode::{
    Bytecode, FunctionCall, Instruction, JumpTarget, ReadOptions, SelectFlags, SelectorDesc,
    SpacerIndex, SubroutineCall,
};
use super::decimal::Decimal;
use super::error::BytecodeError;
use super::variables::{WriteFlags, WriteMode};

pub const MAGIC: [u8; 4] = *b"BLS\x01";
const HEADER_LEN: usize = 12;

/// Interns strings, handing out stable u16 indices.
#[derive(Debug, Default)]
struct StringPool {
    index: HashMap<String, u16>,
    entries: Vec<String>,
}

impl StringPool {
    fn intern(&mut self, s: &str) -> Result<u16, BytecodeError> {
        if let Some(&i) = self.index.get(s) {
            return Ok(i);
        }
        if s.len() > u16::MAX as usize {
            return Err(BytecodeError::StringTooLong(s.len()));
        }
        let i = u16::try_from(self.entries.len()).map_err(|_| BytecodeError::PoolOverflow)?;
        self.index.insert(s.to_string(), i);
        self.entries.push(s.to_string());
        Ok(i)
    }
}

fn tag_of(instruction: &Instruction) -> u8 {
    use Instruction::*;
    match instruction {
        Nop => 0,
        Comment(_) => 1,
        BoxName(_) => 2,
        Label(_) => 3,
        NewBox => 4,
        MoveBox(_) => 5,
        ReadBox(_) => 6,
        NextTable => 7,
        Select(_) => 8,
        SetVar(_) => 9,
        Clear => 10,
        PushVar => 11,
        IsSet => 12,
        GetSize => 13,
        PushView => 14,
        PushNull => 15,
        PushNum(_) => 16,
        PushStr(_) => 17,
        PushArg(_) => 18,
        Call(_) => 19,
        Pop => 20,
        Add => 21,
        Sub => 22,
        Mul => 23,
        Div => 24,
        Eq => 25,
        Neq => 26,
        Lt => 27,
        Leq => 28,
        Gt => 29,
        Geq => 30,
        And => 31,
        Or => 32,
        Not => 33,
        Neg => 34,
        PushContent => 35,
        PopContent => 36,
        NewView => 37,
        NewSubview => 38,
        ResetView => 39,
        NextResult => 40,
        SetBegin => 41,
        SetEnd => 42,
        ThrowError => 43,
        Warning => 44,
        Jmp(_) => 45,
        Jz(_) => 46,
        Jnz(_) => 47,
        Jte(_) => 48,
        CallSub(_) => 49,
        SetRetVal => 50,
        Ret => 51,
        Import(_) => 52,
        AddLayout(_) => 53,
        Halt => 54,
        FoundLayout => 55,
    }
}

/// Operand-less instruction for a tag, if the tag has no payload.
fn simple_from_tag(tag: u8) -> Option<Instruction> {
    use Instruction::*;
    Some(match tag {
        0 => Nop,
        4 => NewBox,
        7 => NextTable,
        10 => Clear,
        11 => PushVar,
        12 => IsSet,
        13 => GetSize,
        14 => PushView,
        15 => PushNull,
        20 => Pop,
        21 => Add,
        22 => Sub,
        23 => Mul,
        24 => Div,
        25 => Eq,
        26 => Neq,
        27 => Lt,
        28 => Leq,
        29 => Gt,
        30 => Geq,
        31 => And,
        32 => Or,
        33 => Not,
        34 => Neg,
        35 => PushContent,
        36 => PopContent,
        37 => NewView,
        38 => NewSubview,
        39 => ResetView,
        40 => NextResult,
        41 => SetBegin,
        42 => SetEnd,
        43 => ThrowError,
        44 => Warning,
        50 => SetRetVal,
        51 => Ret,
        54 => Halt,
        55 => FoundLayout,
        _ => return None,
    })
}

fn write_flags_bits(flags: WriteFlags) -> u8 {
    let mode = match flags.mode {
        WriteMode::Set => 0,
        WriteMode::Increase => 1,
        WriteMode::Decrease => 2,
    };
    mode | (flags.overwrite as u8) << 2 | (flags.force as u8) << 3
}

fn write_flags_from_bits(bits: u8) -> Option<WriteFlags> {
    let mode = match bits & 0b11 {
        0 => WriteMode::Set,
        1 => WriteMode::Increase,
        2 => WriteMode::Decrease,
        _ => return None,
    };
    if bits >> 4 != 0 {
        return None;
    }
    Some(WriteFlags {
        mode,
        overwrite: bits & 0b100 != 0,
        force: bits & 0b1000 != 0,
    })
}

// ── Encoding ──────────────────────────────────────────────────────────

struct Encoder {
    out: Vec<u8>,
    pool: StringPool,
}

impl Encoder {
    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn str(&mut self, s: &str) -> Result<(), BytecodeError> {
        let i = self.pool.intern(s)?;
        self.u16(i);
        Ok(())
    }

    fn jump(&mut self, target: &JumpTarget) -> Result<(), BytecodeError> {
        match target {
            JumpTarget::Offset(offset) => {
                self.out.extend_from_slice(&offset.to_be_bytes());
                Ok(())
            }
            JumpTarget::Label(label) => Err(BytecodeError::UnresolvedLabel(label.clone())),
        }
    }

    fn instruction(&mut self, instruction: &Instruction) -> Result<(), BytecodeError> {
        use Instruction::*;
        self.u8(tag_of(instruction));
        match instruction {
            Label(label) => return Err(BytecodeError::UnresolvedLabel(label.clone())),
            Comment(s) | BoxName(s) | PushStr(s) | Import(s) | AddLayout(s) => self.str(s)?,
            MoveBox(idx) => self.u8(idx.tag()),
            ReadBox(opts) => {
                self.u8(opts.kind.tag());
                self.u8(opts.mode.tag());
            }
            Select(sel) => {
                self.str(&sel.name)?;
                self.u8(sel.flags.bits());
                self.u16(sel.index);
                self.u16(sel.length);
            }
            SetVar(flags) => self.u8(write_flags_bits(*flags)),
            PushNum(n) => self.out.extend_from_slice(&n.unbiased().to_be_bytes()),
            PushArg(n) => self.u8(*n),
            Call(call) => {
                self.str(&call.name)?;
                self.u8(call.argc);
            }
            Jmp(t) | Jz(t) | Jnz(t) | Jte(t) => self.jump(t)?,
            CallSub(call) => {
                self.jump(&call.target)?;
                self.u8(call.argc);
                self.u8(call.value as u8);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Serializes a resolved program.
pub fn encode(code: &Bytecode) -> Result<Vec<u8>, BytecodeError> {
    let mut enc = Encoder {
        out: Vec::with_capacity(HEADER_LEN + code.len() * 4),
        pool: StringPool::default(),
    };
    enc.out.extend_from_slice(&MAGIC);
    let count = u32::try_from(code.len()).map_err(|_| BytecodeError::PoolOverflow)?;
    enc.out.extend_from_slice(&count.to_be_bytes());
    enc.out.extend_from_slice(&[0; 4]);

    for instruction in code {
        enc.instruction(instruction)?;
    }

    let pool_offset = enc.out.len() as u32;
    enc.out[8..12].copy_from_slice(&pool_offset.to_be_bytes());
    let entries = std::mem::take(&mut enc.pool.entries);
    enc.out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for entry in &entries {
        enc.u16(entry.len() as u16);
        enc.out.extend_from_slice(entry.as_bytes());
    }
    Ok(enc.out)
}

// ── Decoding ──────────────────────────────────────────────────────────

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    pool: Vec<String>,
}

impl<'a> Decoder<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], BytecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(BytecodeError::UnexpectedEof(self.pos))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], BytecodeError> {
        let mut buf = [0; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn u8(&mut self) -> Result<u8, BytecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, BytecodeError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, BytecodeError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, BytecodeError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, BytecodeError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn str(&mut self) -> Result<String, BytecodeError> {
        let i = self.u16()?;
        self.pool
            .get(i as usize)
            .cloned()
            .ok_or(BytecodeError::BadStringIndex(i))
    }

    fn operand<T>(&self, at: usize, value: Option<T>) -> Result<T, BytecodeError> {
        value.ok_or(BytecodeError::InvalidOperand(at))
    }

    fn read_pool(&mut self) -> Result<(), BytecodeError> {
        let count = self.u32()?;
        for i in 0..count as usize {
            let len = self.u16()? as usize;
            let bytes = self.take(len)?;
            let s = std::str::from_utf8(bytes).map_err(|_| BytecodeError::InvalidUtf8(i))?;
            self.pool.push(s.to_string());
        }
        Ok(())
    }

    fn instruction(&mut self) -> Result<Instruction, BytecodeError> {
        use Instruction::*;
        let at = self.pos;
        let tag = self.u8()?;
        if let Some(simple) = simple_from_tag(tag) {
            return Ok(simple);
        }
        Ok(match tag {
            1 => Comment(self.str()?),
            2 => BoxName(self.str()?),
            5 => {
                let idx = self.u8()?;
                MoveBox(self.operand(at, SpacerIndex::from_tag(idx))?)
            }
            6 => {
                let kind = self.u8()?;
                let mode = self.u8()?;
                ReadBox(ReadOptions {
                    kind: self.operand(at, BoxKind::from_tag(kind))?,
                    mode: self.operand(at, ReadMode::from_tag(mode))?,
                })
            }
            8 => {
                let name = self.str()?;
                let bits = self.u8()?;
                Select(SelectorDesc {
                    name,
                    flags: self.operand(at, SelectFlags::from_bits(bits))?,
                    index: self.u16()?,
                    length: self.u16()?,
                })
            }
            9 => {
                let bits = self.u8()?;
                SetVar(self.operand(at, write_flags_from_bits(bits))?)
            }
            16 => PushNum(Decimal::from_unbiased(self.i64()?)),
            17 => PushStr(self.str()?),
            18 => PushArg(self.u8()?),
            19 => Call(FunctionCall {
                name: self.str()?,
                argc: self.u8()?,
            }),
            45 => Jmp(JumpTarget::Offset(self.i32()?)),
            46 => Jz(JumpTarget::Offset(self.i32()?)),
            47 => Jnz(JumpTarget::Offset(self.i32()?)),
            48 => Jte(JumpTarget::Offset(self.i32()?)),
            49 => {
                let target = JumpTarget::Offset(self.i32()?);
                let argc = self.u8()?;
                let value = match self.u8()? {
                    0 => false,
                    1 => true,
                    _ => return Err(BytecodeError::InvalidOperand(at)),
                };
                CallSub(SubroutineCall { target, argc, value })
            }
            52 => Import(self.str()?),
            53 => AddLayout(self.str()?),
            _ => return Err(BytecodeError::UnknownOpcode { tag, offset: at }),
        })
    }
}

/// Parses bytes produced by [`encode`].
pub fn decode(data: &[u8]) -> Result<Bytecode, BytecodeError> {
    let mut dec = Decoder {
        data,
        pos: 0,
        pool: Vec::new(),
    };
    if dec.take(4).map_err(|_| BytecodeError::BadMagic)? != MAGIC {
        return Err(BytecodeError::BadMagic);
    }
    let count = dec.u32()? as usize;
    let pool_offset = dec.u32()? as usize;
    if pool_offset < HEADER_LEN || pool_offset > data.len() {
        return Err(BytecodeError::UnexpectedEof(pool_offset));
    }

    dec.pos = pool_offset;
    dec.read_pool()?;
    if dec.pos != data.len() {
        return Err(BytecodeError::TrailingData(dec.pos));
    }

    dec.pos = HEADER_LEN;
    let mut code = Bytecode::new();
    for _ in 0..count {
        if dec.pos >= pool_offset {
            return Err(BytecodeError::UnexpectedEof(dec.pos));
        }
        code.push(dec.instruction()?);
    }
    if dec.pos != pool_offset {
        return Err(BytecodeError::TrailingData(dec.pos));
    }
    Ok(code)
}
