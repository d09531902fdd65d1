//! Built-in function library.
//!
//! Every entry declares its parameters as required, then optional, then at
//! most one trailing variadic. The compiler checks call arity against the
//! bounds derived from that list; the VM converts each argument to the
//! declared kind before invoking the body.

use std::collections::HashMap;

use chrono::format::{Item, StrftimeItems};
use chrono::{Datelike, Days, Months, NaiveDate};
use log::{debug, error};
use regex::{Regex, RegexBuilder};
use thiserror::Error;

use super::decimal::Decimal;
use super::error::RuntimeError;
use super::value::Value;

/// Joins the items of a list value.
pub const UNIT_SEPARATOR: char = '\x1f';

/// Widest padding `lpad`/`rpad` will produce.
pub const MAX_PAD: usize = 1 << 16;

/// Number formatting of the documents being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locale {
    pub decimal_point: char,
    pub thousands_sep: Option<char>,
}

impl Default for Locale {
    fn default() -> Self {
        Self {
            decimal_point: '.',
            thousands_sep: Some(','),
        }
    }
}

impl Locale {
    pub fn parse_number(&self, text: &str) -> Option<Decimal> {
        Decimal::parse_locale(text, self.decimal_point, self.thousands_sep)
    }

    /// Pattern matching one number written in this locale.
    pub fn number_regex(&self) -> String {
        let dec = regex::escape(&self.decimal_point.to_string());
        match self.thousands_sep {
            Some(sep) => format!(
                r"(?:-?(?:\d{{1,3}}(?:{}\d{{3}})+|\d+)(?:{dec}\d+)?)",
                regex::escape(&sep.to_string())
            ),
            None => format!(r"(?:-?\d+(?:{dec}\d+)?)"),
        }
    }
}

pub struct CallContext<'a> {
    pub locale: &'a Locale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Str,
    Num,
    Int,
    Bool,
    Date,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Required,
    Optional,
    Variadic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub kind: ParamKind,
    pub shape: Shape,
}

impl Param {
    pub const fn req(kind: ParamKind) -> Self {
        Self {
            kind,
            shape: Shape::Required,
        }
    }

    pub const fn opt(kind: ParamKind) -> Self {
        Self {
            kind,
            shape: Shape::Optional,
        }
    }

    pub const fn var(kind: ParamKind) -> Self {
        Self {
            kind,
            shape: Shape::Variadic,
        }
    }
}

/// An argument after conversion to its declared kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Str(String),
    Num(Decimal),
    Int(i64),
    Bool(bool),
    Date(NaiveDate),
    Any(Value),
}

impl ParamKind {
    fn convert(self, value: Value) -> Result<Arg, RuntimeError> {
        Ok(match self {
            ParamKind::Str => Arg::Str(match value {
                Value::String(s) => s,
                other => other.to_string(),
            }),
            ParamKind::Num => Arg::Num(value.as_number()?),
            ParamKind::Int => Arg::Int(value.as_int()?),
            ParamKind::Bool => Arg::Bool(value.as_bool()),
            ParamKind::Date => Arg::Date(value.as_date()?),
            ParamKind::Any => Arg::Any(value),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Arg>);

impl Args {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn str(&self, i: usize) -> &str {
        self.opt_str(i).unwrap_or("")
    }

    pub fn opt_str(&self, i: usize) -> Option<&str> {
        match self.0.get(i) {
            Some(Arg::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn num(&self, i: usize) -> Decimal {
        match self.0.get(i) {
            Some(Arg::Num(n)) => *n,
            _ => Decimal::ZERO,
        }
    }

    pub fn int(&self, i: usize) -> i64 {
        self.opt_int(i).unwrap_or(0)
    }

    pub fn opt_int(&self, i: usize) -> Option<i64> {
        match self.0.get(i) {
            Some(Arg::Int(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn bool(&self, i: usize) -> bool {
        matches!(self.0.get(i), Some(Arg::Bool(true)))
    }

    pub fn date(&self, i: usize) -> NaiveDate {
        match self.0.get(i) {
            Some(Arg::Date(d)) => *d,
            _ => NaiveDate::MIN,
        }
    }

    pub fn value(&self, i: usize) -> Value {
        match self.0.get(i) {
            Some(Arg::Any(v)) => v.clone(),
            Some(Arg::Str(s)) => Value::String(s.clone()),
            Some(Arg::Num(n)) => Value::Number(*n),
            Some(Arg::Int(n)) => Decimal::from_int(*n).into(),
            Some(Arg::Bool(b)) => Value::from(*b),
            Some(Arg::Date(d)) => Value::Date(*d),
            None => Value::Null,
        }
    }

    /// Arguments from position `i` on.
    pub fn rest(&self, i: usize) -> &[Arg] {
        self.0.get(i..).unwrap_or(&[])
    }

    pub fn rest_str(&self, i: usize) -> impl Iterator<Item = &str> {
        self.rest(i).iter().filter_map(|a| match a {
            Arg::Str(s) => Some(s.as_str()),
            _ => None,
        })
    }
}

pub type FunctionBody = fn(&Args, &CallContext<'_>) -> Result<Value, RuntimeError>;

#[derive(Debug, Clone)]
pub struct Function {
    pub name: &'static str,
    pub params: &'static [Param],
    pub min_args: usize,
    /// `None` for a variadic tail.
    pub max_args: Option<usize>,
    body: FunctionBody,
}

impl Function {
    pub fn accepts(&self, argc: usize) -> bool {
        argc >= self.min_args && self.max_args.is_none_or(|max| argc <= max)
    }

    pub fn arity(&self) -> String {
        match self.max_args {
            Some(max) if max == self.min_args => max.to_string(),
            Some(max) => format!("{}..{}", self.min_args, max),
            None => format!("at least {}", self.min_args),
        }
    }

    /// Converts `args` to the declared kinds and runs the body.
    pub fn call(&self, args: Vec<Value>, ctx: &CallContext<'_>) -> Result<Value, RuntimeError> {
        if !self.accepts(args.len()) {
            return Err(RuntimeError::InvalidArgumentCount {
                name: self.name.to_string(),
                got: args.len(),
            });
        }
        let mut converted = Vec::with_capacity(args.len());
        for (i, value) in args.into_iter().enumerate() {
            let param = self
                .params
                .get(i)
                .or_else(|| self.params.last())
                .copied()
                .unwrap_or(Param::req(ParamKind::Any));
            converted.push(param.kind.convert(value)?);
        }
        (self.body)(&Args(converted), ctx)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum LibraryError {
    #[error("function `{0}` is already registered")]
    Duplicate(String),
    #[error("invalid signature for `{name}`: {reason}")]
    InvalidSignature { name: String, reason: &'static str },
}

#[derive(Debug, Clone, Default)]
pub struct FunctionLibrary {
    functions: HashMap<&'static str, Function>,
}

impl FunctionLibrary {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Library with every built-in registered.
    pub fn new() -> Self {
        let mut lib = Self::empty();
        for (name, params, body) in BUILTINS {
            if let Err(e) = lib.register(name, params, *body) {
                error!("{e}");
            }
        }
        lib
    }

    /// Validates the parameter list and stores the function.
    pub fn register(
        &mut self,
        name: &'static str,
        params: &'static [Param],
        body: FunctionBody,
    ) -> Result<(), LibraryError> {
        if self.functions.contains_key(name) {
            return Err(LibraryError::Duplicate(name.to_string()));
        }
        let invalid = |reason| LibraryError::InvalidSignature {
            name: name.to_string(),
            reason,
        };

        let mut min_args = 0;
        let mut max_args = Some(0);
        let mut seen = Shape::Required;
        for (i, param) in params.iter().enumerate() {
            match (seen, param.shape) {
                (_, Shape::Variadic) if i + 1 != params.len() => {
                    return Err(invalid("variadic parameter must be last"));
                }
                (Shape::Optional, Shape::Required) => {
                    return Err(invalid("required parameter after an optional one"));
                }
                _ => {}
            }
            match param.shape {
                Shape::Required => min_args += 1,
                Shape::Optional => {}
                Shape::Variadic => {
                    max_args = None;
                    break;
                }
            }
            max_args = max_args.map(|m| m + 1);
            seen = param.shape;
        }

        self.functions.insert(
            name,
            Function {
                name,
                params,
                min_args,
                max_args,
                body,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

fn conversion(message: impl Into<String>) -> RuntimeError {
    RuntimeError::Conversion(message.into())
}

fn number(n: Decimal) -> Value {
    Value::Number(n)
}

fn count(n: usize) -> Value {
    Decimal::from_int(n as i64).into()
}

fn list_items(list: &str) -> impl Iterator<Item = &str> {
    list.split(UNIT_SEPARATOR).filter(|s| !s.is_empty())
}

fn join_list<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.collect::<Vec<_>>().join(&UNIT_SEPARATOR.to_string())
}

/// Compiles a case-insensitive regex, expanding `\N` to the number pattern
/// of the current locale.
pub fn create_regex(pattern: &str, locale: &Locale) -> Result<Regex, RuntimeError> {
    let expanded = pattern.replace(r"\N", &locale.number_regex());
    RegexBuilder::new(&expanded)
        .case_insensitive(true)
        .build()
        .map_err(|e| RuntimeError::InvalidRegex {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}

/// Byte range of capture group `index` of the first match.
fn search_regex(
    text: &str,
    pattern: &str,
    index: usize,
    locale: &Locale,
) -> Result<Option<(usize, usize)>, RuntimeError> {
    let re = create_regex(pattern, locale)?;
    Ok(re
        .captures(text)
        .and_then(|caps| caps.get(index))
        .map(|m| (m.start(), m.end())))
}

fn index_arg(args: &Args, i: usize, default: usize) -> Result<usize, RuntimeError> {
    match args.opt_int(i) {
        None => Ok(default),
        Some(n) => usize::try_from(n).map_err(|_| conversion(format!("negative index {n}"))),
    }
}

fn pad_width(args: &Args, i: usize) -> Result<usize, RuntimeError> {
    let width = index_arg(args, i, 0)?;
    if width > MAX_PAD {
        return Err(conversion(format!("padding of {width} exceeds {MAX_PAD}")));
    }
    Ok(width)
}

fn find_icase(text: &str, needle: &str, from: usize) -> Option<usize> {
    let from = from.min(text.len());
    let hay = text.as_bytes()[from..].to_ascii_lowercase();
    let needle = needle.as_bytes().to_ascii_lowercase();
    if needle.is_empty() {
        return Some(from);
    }
    hay.windows(needle.len())
        .position(|w| w == needle.as_slice())
        .map(|p| p + from)
}

fn floor_boundary(text: &str, mut pos: usize) -> usize {
    pos = pos.min(text.len());
    while !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn capitalize(text: &str) -> String {
    let mut cap = true;
    text.chars()
        .map(|c| {
            if c.is_whitespace() || c == '.' {
                cap = true;
                c
            } else if c.is_alphabetic() && cap {
                cap = false;
                c.to_uppercase().next().unwrap_or(c)
            } else {
                c.to_lowercase().next().unwrap_or(c)
            }
        })
        .collect()
}

fn singleline(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        let c = if c.is_whitespace() { ' ' } else { c };
        if c == ' ' && out.ends_with(' ') {
            continue;
        }
        out.push(c);
    }
    out
}

/// Replaces `$N` with the N-th argument; `$$` is a literal dollar.
fn string_format<'a>(format: &str, args: &[&'a str]) -> Result<String, RuntimeError> {
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            None => out.push('$'),
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some(d) if d.is_ascii_digit() => {
                let mut idx = 0usize;
                while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                    idx = idx.saturating_mul(10).saturating_add(d as usize);
                    chars.next();
                }
                let arg = args
                    .get(idx)
                    .ok_or_else(|| conversion(format!("invalid format string `{format}`")))?;
                out.push_str(arg);
            }
            Some(_) => out.push('$'),
        }
    }
    Ok(out)
}

/// Turns a strftime-style format into a regex matching such dates.
pub fn date_regex(format: &str) -> Result<String, RuntimeError> {
    let mut out = String::from(r"\b");
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push_str(&regex::escape(&c.to_string()));
            continue;
        }
        match chars.next() {
            Some('a' | 'A' | 'b' | 'B' | 'h') => out.push_str(r"[^\s]+"),
            Some('w' | 'm' | 'y' | 'H' | 'l' | 'd' | 'M' | 'S') => out.push_str(r"\d{1,2}"),
            Some('Y') => out.push_str(r"\d{4}"),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('%') => out.push('%'),
            _ => return Err(conversion(format!("invalid date format `{format}`"))),
        }
    }
    out.push_str(r"\b");
    Ok(out)
}

fn parse_date(text: &str, format: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, format)
        .or_else(|_| NaiveDate::parse_from_str(&format!("{text} 1"), &format!("{format} %d")))
        .ok()
}

/// Finds a date written as `format` in `text`. With an explicit regex, `\D`
/// inside it stands for the date pattern and `index` picks the group.
fn search_date(text: &str, args: &Args, locale: &Locale) -> Result<Option<NaiveDate>, RuntimeError> {
    let format = args.str(1);
    let date_pattern = date_regex(format)?;
    let (pattern, index) = match args.opt_str(2).filter(|s| !s.is_empty()) {
        Some(custom) => (custom.replace(r"\D", &date_pattern), index_arg(args, 3, 1)?),
        None => (date_pattern, 0),
    };
    Ok(search_regex(text, &pattern, index, locale)?
        .and_then(|(begin, end)| parse_date(&text[begin..end], format)))
}

fn add_months(date: NaiveDate, months: i64) -> Result<NaiveDate, RuntimeError> {
    let amount = Months::new(
        u32::try_from(months.unsigned_abs()).map_err(|_| conversion("month offset out of range"))?,
    );
    if months >= 0 {
        date.checked_add_months(amount)
    } else {
        date.checked_sub_months(amount)
    }
    .ok_or_else(|| conversion("date out of range"))
}

fn add_days(date: NaiveDate, days: i64) -> Result<NaiveDate, RuntimeError> {
    let amount = Days::new(days.unsigned_abs());
    if days >= 0 {
        date.checked_add_days(amount)
    } else {
        date.checked_sub_days(amount)
    }
    .ok_or_else(|| conversion("date out of range"))
}

fn last_day(date: NaiveDate) -> Result<NaiveDate, RuntimeError> {
    let first = date
        .with_day(1)
        .ok_or_else(|| conversion("date out of range"))?;
    add_days(add_months(first, 1)?, -1)
}

fn format_date(date: NaiveDate, format: &str) -> Result<String, RuntimeError> {
    let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
    if items.iter().any(|i| matches!(i, Item::Error)) {
        return Err(conversion(format!("invalid date format `{format}`")));
    }
    Ok(date.format_with_items(items.into_iter()).to_string())
}

fn pick<F>(args: &Args, keep: F) -> Value
where
    F: Fn(std::cmp::Ordering) -> bool,
{
    let mut best = args.value(0);
    for i in 1..args.len() {
        let candidate = args.value(i);
        if candidate.compare(&best).is_some_and(&keep) {
            best = candidate;
        }
    }
    best
}

/// Finds the first line holding `labels` in order (all but the first are
/// optional) and describes each label's column as `start:width`, joined as a
/// list. The width runs to the next non-blank after the label; `-1` means up
/// to the end of the row. Labels not found give an empty cell.
fn table_header(text: &str, labels: &[&str], locale: &Locale) -> Result<String, RuntimeError> {
    let Some((first, rest)) = labels.split_first() else {
        return Ok(String::new());
    };
    let mut pattern = format!(".*{first}");
    for label in rest {
        pattern.push_str(&format!(".*(?:{label})?"));
    }
    pattern.push_str(".*");
    let Some(found) = create_regex(&pattern, locale)?.find(text) else {
        return Ok(String::new());
    };
    let header = found.as_str();

    let mut pos = 0;
    let mut cells = Vec::with_capacity(labels.len());
    for label in labels {
        let Some(m) = create_regex(label, locale)?.find_at(header, pos) else {
            cells.push(String::new());
            continue;
        };
        let next = header[m.end()..]
            .find(|c: char| !c.is_whitespace())
            .map(|i| m.end() + i);
        pos = next.unwrap_or(header.len());
        cells.push(match next {
            Some(next) => format!("{}:{}", m.start(), next - m.start()),
            None => format!("{}:-1", m.start()),
        });
    }
    Ok(join_list(cells.iter().map(String::as_str)))
}

fn table_cell<'a>(row: &'a str, cell: &str) -> &'a str {
    let Some((begin, width)) = cell.split_once(':') else {
        return "";
    };
    let (Ok(begin), Ok(width)) = (begin.parse::<usize>(), width.parse::<i64>()) else {
        return "";
    };
    if begin >= row.len() {
        return "";
    }
    let begin = floor_boundary(row, begin);
    let end = match usize::try_from(width) {
        Ok(width) => floor_boundary(row, begin.saturating_add(width)),
        Err(_) => row.len(),
    };
    &row[begin..end.max(begin)]
}

/// Cuts `row` into the columns described by [`table_header`].
fn table_row(row: &str, cells: &str) -> String {
    join_list(cells.split(UNIT_SEPARATOR).map(|cell| table_cell(row, cell)))
}

fn compare_with(args: &Args, test: fn(std::cmp::Ordering) -> bool) -> Value {
    args.value(0).compare(&args.value(1)).is_some_and(test).into()
}

// ── Built-in table ────────────────────────────────────────────────────

use ParamKind::{Any, Bool, Date, Int, Num, Str};

const ANY: Param = Param::req(Any);
const STR: Param = Param::req(Str);
const NUM: Param = Param::req(Num);
const INT: Param = Param::req(Int);
const BOOL: Param = Param::req(Bool);
const DATE: Param = Param::req(Date);

type Builtin = (&'static str, &'static [Param], FunctionBody);

static BUILTINS: &[Builtin] = &[
    // comparisons
    ("eq", &[ANY, ANY], |a, _| Ok(a.value(0).script_eq(&a.value(1)).into())),
    ("neq", &[ANY, ANY], |a, _| Ok((!a.value(0).script_eq(&a.value(1))).into())),
    ("lt", &[ANY, ANY], |a, _| Ok(compare_with(a, |o| o.is_lt()))),
    ("gt", &[ANY, ANY], |a, _| Ok(compare_with(a, |o| o.is_gt()))),
    ("leq", &[ANY, ANY], |a, _| Ok(compare_with(a, |o| o.is_le()))),
    ("geq", &[ANY, ANY], |a, _| Ok(compare_with(a, |o| o.is_ge()))),
    // arithmetic
    ("add", &[ANY, ANY], |a, _| a.value(0).add(&a.value(1))),
    ("sub", &[ANY, ANY], |a, _| a.value(0).sub(&a.value(1))),
    ("mul", &[ANY, ANY], |a, _| a.value(0).mul(&a.value(1))),
    ("div", &[ANY, ANY], |a, _| a.value(0).div(&a.value(1))),
    ("mod", &[INT, INT], |a, _| {
        let divisor = a.int(1);
        if divisor == 0 {
            return Err(conversion("division by zero"));
        }
        Ok(Decimal::from_int(a.int(0) % divisor).into())
    }),
    ("abs", &[NUM], |a, _| Ok(number(a.num(0).abs()))),
    ("neg", &[ANY], |a, _| a.value(0).neg()),
    ("trunc", &[NUM, Param::opt(Int)], |a, _| {
        let places = a.opt_int(1).unwrap_or(0).clamp(0, 10) as u32;
        Ok(number(a.num(0).trunc(places)))
    }),
    ("sum", &[Param::var(Num)], |a, _| {
        let mut total = Decimal::ZERO;
        for arg in a.rest(0) {
            if let Arg::Num(n) = arg {
                total = total
                    .checked_add(*n)
                    .ok_or_else(|| conversion("numeric overflow"))?;
            }
        }
        Ok(number(total))
    }),
    ("max", &[ANY, Param::var(Any)], |a, _| Ok(pick(a, |o| o.is_gt()))),
    ("min", &[ANY, Param::var(Any)], |a, _| Ok(pick(a, |o| o.is_lt()))),
    // logic
    ("not", &[BOOL], |a, _| Ok((!a.bool(0)).into())),
    ("and", &[BOOL, BOOL], |a, _| Ok((a.bool(0) && a.bool(1)).into())),
    ("or", &[BOOL, BOOL], |a, _| Ok((a.bool(0) || a.bool(1)).into())),
    ("if", &[BOOL, ANY, Param::opt(Any)], |a, _| {
        Ok(if a.bool(0) { a.value(1) } else { a.value(2) })
    }),
    ("ifnot", &[BOOL, ANY, Param::opt(Any)], |a, _| {
        Ok(if a.bool(0) { a.value(2) } else { a.value(1) })
    }),
    ("bool", &[BOOL], |a, _| Ok(a.bool(0).into())),
    ("int", &[INT], |a, _| Ok(Decimal::from_int(a.int(0)).into())),
    ("isnull", &[ANY], |a, _| Ok(a.value(0).is_null().into())),
    ("null", &[], |_, _| Ok(Value::Null)),
    ("readfile", &[STR], |a, _| {
        Ok(match std::fs::read_to_string(a.str(0)) {
            Ok(text) => text.into(),
            Err(e) => {
                debug!("readfile {}: {e}", a.str(0));
                Value::Null
            }
        })
    }),
    ("coalesce", &[Param::var(Any)], |a, _| {
        Ok((0..a.len())
            .map(|i| a.value(i))
            .find(|v| !v.is_null())
            .unwrap_or_default())
    }),
    // numbers
    ("num", &[ANY], |a, ctx| {
        Ok(match a.value(0) {
            Value::Number(n) => Value::Number(n),
            Value::String(s) => ctx.locale.parse_number(&s).into(),
            _ => Value::Null,
        })
    }),
    ("aggregate", &[STR], |a, ctx| {
        let mut total = Value::Null;
        for item in list_items(a.str(0)) {
            total = total.add(&ctx.locale.parse_number(item).into())?;
        }
        Ok(total)
    }),
    ("hex", &[INT], |a, _| Ok(format!("{:x}", a.int(0)).into())),
    ("percent", &[STR], |a, _| {
        Ok(match a.str(0) {
            "" => Value::Null,
            s => format!("{s}%").into(),
        })
    }),
    // strings
    ("trim", &[STR], |a, _| Ok(a.str(0).trim().into())),
    ("tolower", &[STR], |a, _| Ok(a.str(0).to_lowercase().into())),
    ("toupper", &[STR], |a, _| Ok(a.str(0).to_uppercase().into())),
    ("capitalize", &[STR], |a, _| Ok(capitalize(a.str(0)).into())),
    ("singleline", &[STR], |a, _| Ok(singleline(a.str(0)).into())),
    ("substr", &[STR, INT, Param::opt(Int)], |a, _| {
        let text = a.str(0);
        let begin = floor_boundary(text, index_arg(a, 1, 0)?);
        let end = match a.opt_int(2) {
            Some(_) => floor_boundary(text, begin.saturating_add(index_arg(a, 2, 0)?)),
            None => text.len(),
        };
        Ok(text[begin..end.max(begin)].into())
    }),
    ("strlen", &[STR], |a, _| Ok(count(a.str(0).len()))),
    ("strcat", &[Param::var(Str)], |a, _| Ok(a.rest_str(0).collect::<String>().into())),
    ("contains", &[STR, STR], |a, _| Ok(find_icase(a.str(0), a.str(1), 0).is_some().into())),
    ("indexof", &[STR, STR, Param::opt(Int)], |a, _| {
        let text = a.str(0);
        let from = index_arg(a, 2, 0)?;
        Ok(count(find_icase(text, a.str(1), from).unwrap_or(text.len())))
    }),
    ("indexofend", &[STR, STR, Param::opt(Int)], |a, _| {
        let text = a.str(0);
        let from = index_arg(a, 2, 0)?;
        Ok(count(
            find_icase(text, a.str(1), from).map_or(text.len(), |p| p + a.str(1).len()),
        ))
    }),
    ("replace", &[STR, STR, STR], |a, _| {
        if a.str(1).is_empty() {
            return Ok(a.str(0).into());
        }
        Ok(a.str(0).replace(a.str(1), a.str(2)).into())
    }),
    ("lpad", &[STR, INT], |a, _| {
        let pad = " ".repeat(pad_width(a, 1)?);
        Ok(format!("{pad}{}", a.str(0)).into())
    }),
    ("rpad", &[STR, INT], |a, _| {
        let pad = " ".repeat(pad_width(a, 1)?);
        Ok(format!("{}{pad}", a.str(0)).into())
    }),
    ("isempty", &[STR], |a, _| Ok(a.str(0).is_empty().into())),
    ("format", &[STR, Param::var(Str)], |a, _| {
        let rest: Vec<&str> = a.rest_str(1).collect();
        string_format(a.str(0), &rest).map(Value::from)
    }),
    ("table_header", &[STR, STR, Param::var(Str)], |a, ctx| {
        let labels: Vec<&str> = a.rest_str(1).collect();
        table_header(a.str(0), &labels, ctx.locale).map(Value::from)
    }),
    ("table_row", &[STR, STR], |a, _| Ok(table_row(a.str(0), a.str(1)).into())),
    ("lines", &[STR], |a, _| Ok(a.str(0).replace('\n', &UNIT_SEPARATOR.to_string()).into())),
    ("list", &[Param::var(Str)], |a, _| Ok(join_list(a.rest_str(0)).into())),
    ("subitem", &[STR, INT], |a, _| {
        let idx = index_arg(a, 1, 0)?;
        Ok(a.str(0).split(UNIT_SEPARATOR).nth(idx).unwrap_or("").into())
    }),
    // regex
    ("search", &[STR, STR, Param::opt(Int)], |a, ctx| {
        let text = a.str(0);
        Ok(search_regex(text, a.str(1), index_arg(a, 2, 1)?, ctx.locale)?
            .filter(|(b, e)| b != e)
            .map_or(Value::Null, |(b, e)| text[b..e].into()))
    }),
    ("searchpos", &[STR, STR, Param::opt(Int)], |a, ctx| {
        let text = a.str(0);
        let found = search_regex(text, a.str(1), index_arg(a, 2, 0)?, ctx.locale)?;
        Ok(count(found.map_or(text.len(), |(b, _)| b)))
    }),
    ("searchposend", &[STR, STR, Param::opt(Int)], |a, ctx| {
        let text = a.str(0);
        let found = search_regex(text, a.str(1), index_arg(a, 2, 0)?, ctx.locale)?;
        Ok(count(found.map_or(text.len(), |(_, e)| e)))
    }),
    ("search_all", &[STR, STR, Param::opt(Int)], |a, ctx| {
        let text = a.str(0);
        let re = create_regex(a.str(1), ctx.locale)?;
        let index = index_arg(a, 2, 1)?;
        let found = re
            .captures_iter(text)
            .filter_map(|caps| caps.get(index).map(|m| m.as_str()));
        Ok(join_list(found).into())
    }),
    ("captures", &[STR, STR], |a, ctx| {
        let text = a.str(0);
        let re = create_regex(a.str(1), ctx.locale)?;
        Ok(match re.captures(text) {
            Some(caps) => {
                let groups: Vec<&str> = caps
                    .iter()
                    .skip(1)
                    .map(|m| m.map_or("", |m| m.as_str()))
                    .collect();
                groups.join(&UNIT_SEPARATOR.to_string()).into()
            }
            None => Value::Null,
        })
    }),
    ("matches", &[STR, STR], |a, ctx| {
        let anchored = format!("^(?:{})$", a.str(1));
        Ok(create_regex(&anchored, ctx.locale)?.is_match(a.str(0)).into())
    }),
    // dates
    ("date", &[STR, STR, Param::opt(Str), Param::opt(Int)], |a, ctx| {
        Ok(search_date(a.str(0), a, ctx.locale)?.into())
    }),
    ("month", &[STR, STR, Param::opt(Str), Param::opt(Int)], |a, ctx| {
        Ok(search_date(a.str(0), a, ctx.locale)?
            .and_then(|d| d.with_day(1))
            .into())
    }),
    ("date_regex", &[STR], |a, _| date_regex(a.str(0)).map(Value::from)),
    ("date_format", &[DATE, STR], |a, _| format_date(a.date(0), a.str(1)).map(Value::from)),
    ("year_add", &[DATE, INT], |a, _| {
        let months = a.int(1).checked_mul(12).ok_or_else(|| conversion("year offset out of range"))?;
        add_months(a.date(0), months).map(Value::from)
    }),
    ("month_add", &[DATE, INT], |a, _| add_months(a.date(0), a.int(1)).map(Value::from)),
    ("week_add", &[DATE, INT], |a, _| {
        let days = a.int(1).checked_mul(7).ok_or_else(|| conversion("week offset out of range"))?;
        add_days(a.date(0), days).map(Value::from)
    }),
    ("day_add", &[DATE, INT], |a, _| add_days(a.date(0), a.int(1)).map(Value::from)),
    ("last_day", &[DATE], |a, _| last_day(a.date(0)).map(Value::from)),
    ("date_between", &[DATE, DATE, DATE], |a, _| {
        let date = a.date(0);
        Ok((date >= a.date(1) && date <= a.date(2)).into())
    }),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
        call_with(name, args, &Locale::default())
    }

    fn call_with(name: &str, args: Vec<Value>, locale: &Locale) -> Result<Value, RuntimeError> {
        let lib = FunctionLibrary::new();
        let f = lib.get(name).unwrap_or_else(|| panic!("missing builtin {name}"));
        f.call(args, &CallContext { locale })
    }

    fn s(text: &str) -> Value {
        Value::from(text)
    }

    #[test]
    fn test_every_builtin_registers() {
        let mut lib = FunctionLibrary::empty();
        for (name, params, body) in BUILTINS {
            assert_eq!(lib.register(name, params, *body), Ok(()), "{name}");
        }
        assert_eq!(FunctionLibrary::new().len(), BUILTINS.len());
    }

    #[test]
    fn test_signature_validation() {
        let mut lib = FunctionLibrary::empty();
        let body: FunctionBody = |_, _| Ok(Value::Null);
        static BAD_ORDER: &[Param] = &[Param::opt(Any), Param::req(Any)];
        static BAD_VARIADIC: &[Param] = &[Param::var(Any), Param::req(Any)];
        assert!(matches!(
            lib.register("a", BAD_ORDER, body),
            Err(LibraryError::InvalidSignature { .. })
        ));
        assert!(matches!(
            lib.register("b", BAD_VARIADIC, body),
            Err(LibraryError::InvalidSignature { .. })
        ));
        assert_eq!(lib.register("c", &[], body), Ok(()));
        assert_eq!(lib.register("c", &[], body), Err(LibraryError::Duplicate("c".into())));
    }

    #[test]
    fn test_arity_bounds() {
        let lib = FunctionLibrary::new();
        let search = lib.get("search").unwrap();
        assert_eq!((search.min_args, search.max_args), (2, Some(3)));
        let list = lib.get("list").unwrap();
        assert_eq!((list.min_args, list.max_args), (0, None));
        let max = lib.get("max").unwrap();
        assert!(!max.accepts(0));
        assert!(max.accepts(5));
        assert!(matches!(
            call("eq", vec![s("a")]),
            Err(RuntimeError::InvalidArgumentCount { .. })
        ));
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(call("trim", vec![s("  a b ")]).unwrap(), s("a b"));
        assert_eq!(call("capitalize", vec![s("mario ROSSI. ok")]).unwrap(), s("Mario Rossi. Ok"));
        assert_eq!(call("singleline", vec![s("a\n\n b\tc")]).unwrap(), s("a b c"));
        assert_eq!(call("substr", vec![s("abcdef"), 2.into(), 3.into()]).unwrap(), s("cde"));
        assert_eq!(call("substr", vec![s("abc"), 9.into()]).unwrap(), s(""));
        assert_eq!(call("indexof", vec![s("Hello World"), s("WORLD")]).unwrap(), 6.into());
        assert_eq!(call("indexof", vec![s("abc"), s("z")]).unwrap(), 3.into());
        assert_eq!(call("indexofend", vec![s("abcabc"), s("bc"), 2.into()]).unwrap(), 6.into());
        assert_eq!(call("contains", vec![s("Total EUR"), s("eur")]).unwrap(), true.into());
        assert_eq!(
            call("format", vec![s("$1-$0 $$"), s("a"), s("b")]).unwrap(),
            s("b-a $")
        );
        assert!(call("format", vec![s("$3"), s("a")]).is_err());
        assert_eq!(call("lpad", vec![s("x"), 2.into()]).unwrap(), s("  x"));
        assert_eq!(call("subitem", vec![s("a\x1fb\x1fc"), 1.into()]).unwrap(), s("b"));
        assert_eq!(call("list", vec![s("a"), s("b")]).unwrap(), s("a\x1fb"));
        assert_eq!(call("strcat", vec![s("a"), 1.into(), s("c")]).unwrap(), s("a1c"));
    }

    #[test]
    fn test_numeric_functions() {
        let it = Locale {
            decimal_point: ',',
            thousands_sep: Some('.'),
        };
        assert_eq!(call_with("num", vec![s("1.234,56")], &it).unwrap().to_string(), "1234.56");
        assert_eq!(call("num", vec![s("n/a")]).unwrap(), Value::Null);
        assert_eq!(call("aggregate", vec![s("1.5\x1f2\x1fx")]).unwrap().to_string(), "3.5");
        assert_eq!(call("aggregate", vec![s("")]).unwrap(), Value::Null);
        assert_eq!(call("sum", vec![1.into(), s("2.5")]).unwrap().to_string(), "3.5");
        assert_eq!(call("max", vec![3.into(), s("10"), 7.into()]).unwrap(), s("10"));
        assert_eq!(call("min", vec![3.into(), s("10"), 7.into()]).unwrap(), 3.into());
        assert_eq!(call("trunc", vec![s("1.239"), 2.into()]).unwrap().to_string(), "1.23");
        assert_eq!(call("mod", vec![7.into(), 3.into()]).unwrap(), 1.into());
        assert!(call("mod", vec![7.into(), 0.into()]).is_err());
        assert_eq!(call("hex", vec![255.into()]).unwrap(), s("ff"));
        assert!(matches!(call("int", vec![s("abc")]), Err(RuntimeError::Conversion(_))));
    }

    #[test]
    fn test_regex_functions() {
        let text = "Invoice 42\nTotal: 1,234.50 EUR";
        assert_eq!(call("search", vec![s(text), s(r"total: (\N)")]).unwrap(), s("1,234.50"));
        assert_eq!(call("search", vec![s(text), s("missing (x)")]).unwrap(), Value::Null);
        assert_eq!(call("searchpos", vec![s(text), s("total")]).unwrap(), 11.into());
        assert_eq!(call("search_all", vec![s("a1 b2 c3"), s(r"[a-z](\d)")]).unwrap(), s("1\x1f2\x1f3"));
        assert_eq!(call("captures", vec![s("k=v"), s(r"(\w)=(\w)")]).unwrap(), s("k\x1fv"));
        assert_eq!(call("matches", vec![s("ABC"), s("[a-c]+")]).unwrap(), true.into());
        assert_eq!(call("matches", vec![s("ABCD"), s("[a-c]+")]).unwrap(), false.into());
        assert!(matches!(
            call("search", vec![s("x"), s("(")]),
            Err(RuntimeError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_date_functions() {
        let ymd = |y, m, d| Value::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap());
        assert_eq!(
            call("date", vec![s("Issued on 05/03/2024."), s("%d/%m/%Y")]).unwrap(),
            ymd(2024, 3, 5)
        );
        assert_eq!(
            call("month", vec![s("period 03/2024"), s("%m/%Y")]).unwrap(),
            ymd(2024, 3, 1)
        );
        assert_eq!(
            call("date", vec![s("from 01/02/2024 to 03/04/2024"), s("%d/%m/%Y"), s(r"to (\D)")]).unwrap(),
            ymd(2024, 4, 3)
        );
        assert_eq!(call("date", vec![s("no date"), s("%d/%m/%Y")]).unwrap(), Value::Null);
        assert_eq!(call("date_regex", vec![s("%Y-%m")]).unwrap(), s(r"\b\d{4}\-\d{1,2}\b"));
        assert_eq!(call("last_day", vec![s("2024-02-10")]).unwrap(), ymd(2024, 2, 29));
        assert_eq!(call("month_add", vec![s("2024-01-31"), 1.into()]).unwrap(), ymd(2024, 2, 29));
        assert_eq!(call("year_add", vec![s("2024-02-29"), (-1).into()]).unwrap(), ymd(2023, 2, 28));
        assert_eq!(call("day_add", vec![s("2024-03-01"), (-1).into()]).unwrap(), ymd(2024, 2, 29));
        assert_eq!(
            call("date_format", vec![s("2024-03-05"), s("%d.%m.%Y")]).unwrap(),
            s("05.03.2024")
        );
        assert_eq!(
            call("date_between", vec![s("2024-03-05"), s("2024-03-01"), s("2024-03-31")]).unwrap(),
            true.into()
        );
        assert!(matches!(call("last_day", vec![Value::Null]), Err(RuntimeError::Conversion(_))));
    }

    #[test]
    fn test_table_functions() {
        let text = "Invoice\nCode   Description    Amount\n001    Widget         5.00";
        let header = call(
            "table_header",
            vec![s(text), s("code"), s("description"), s("amount")],
        )
        .unwrap();
        assert_eq!(header, s("0:7\x1f7:15\x1f22:-1"));
        assert_eq!(
            call("table_row", vec![s("001    Widget         5.00"), header]).unwrap(),
            s("001    \x1fWidget         \x1f5.00")
        );
        assert_eq!(
            call("table_header", vec![s("Code Amount"), s("code"), s("vat")]).unwrap(),
            s("0:5\x1f")
        );
        assert_eq!(call("table_header", vec![s("nothing"), s("code")]).unwrap(), s(""));
        assert_eq!(call("table_row", vec![s("ab"), s("5:2\x1fbad\x1f1:-1")]).unwrap(), s("\x1f\x1fb"));
    }

    #[test]
    fn test_readfile() {
        let path = std::env::temp_dir().join(format!("layoutvm-readfile-{}.txt", std::process::id()));
        std::fs::write(&path, "line one\nline two").unwrap();
        let name = s(&path.to_string_lossy());
        assert_eq!(call("readfile", vec![name]).unwrap(), s("line one\nline two"));
        std::fs::remove_file(&path).unwrap();
        assert_eq!(call("readfile", vec![s(&path.to_string_lossy())]).unwrap(), Value::Null);
    }

    #[test]
    fn test_padding_is_bounded() {
        assert_eq!(call("rpad", vec![s("x"), 3.into()]).unwrap(), s("x   "));
        assert!(matches!(
            call("lpad", vec![s("a"), Value::from(Decimal::from_int(MAX_PAD as i64 + 1))]),
            Err(RuntimeError::Conversion(_))
        ));
    }

    #[test]
    fn test_logic_functions() {
        assert_eq!(call("if", vec![true.into(), s("a"), s("b")]).unwrap(), s("a"));
        assert_eq!(call("ifnot", vec![true.into(), s("a")]).unwrap(), Value::Null);
        assert_eq!(call("coalesce", vec![Value::Null, s(""), s("x")]).unwrap(), s(""));
        assert_eq!(call("isnull", vec![Value::Null]).unwrap(), true.into());
        assert_eq!(call("eq", vec![1.into(), 1.into()]).unwrap(), true.into());
        assert_eq!(call("lt", vec![s("abc"), 1.into()]).unwrap(), false.into());
    }
}
