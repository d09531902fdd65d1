//! Multi-valued, multi-table variable store and the selector cursor into it.

use std::collections::BTreeMap;

use serde::Serialize;

use super::error::RuntimeError;
use super::value::Value;

/// Name -> ordered list of values.
pub type VariableMap = BTreeMap<String, Vec<Value>>;

/// How a write combines with what is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum WriteMode {
    #[default]
    Set,
    Increase,
    Decrease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WriteFlags {
    pub mode: WriteMode,
    /// Drop every stored value before writing.
    pub overwrite: bool,
    /// Write even when the value is null or empty.
    pub force: bool,
}

impl WriteFlags {
    pub const SET: WriteFlags = WriteFlags {
        mode: WriteMode::Set,
        overwrite: false,
        force: false,
    };
}

/// Which slots of a variable a selector addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelIndex {
    /// The bare name: slot 0 for reads and writes, the whole name for `clear`.
    None,
    /// `length` slots starting at the given index.
    At(usize),
    /// `length` fresh slots past the end.
    Append,
    /// Every slot currently stored.
    Each,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub global: bool,
    /// Table that was current when the selector was built.
    pub table: usize,
    pub name: String,
    pub index: SelIndex,
    pub length: usize,
}

impl Selector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            global: false,
            table: 0,
            name: name.into(),
            index: SelIndex::None,
            length: 1,
        }
    }

    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }

    pub fn at(mut self, index: usize, length: usize) -> Self {
        self.index = SelIndex::At(index);
        self.length = length;
        self
    }

    pub fn append(mut self, length: usize) -> Self {
        self.index = SelIndex::Append;
        self.length = length;
        self
    }

    pub fn each(mut self) -> Self {
        self.index = SelIndex::Each;
        self
    }

    /// `(start, count)` of the addressed slots over an array of `len` values.
    fn range(&self, len: usize) -> (usize, usize) {
        match self.index {
            SelIndex::None => (0, 1),
            SelIndex::At(i) => (i, self.length),
            SelIndex::Append => (len, self.length),
            SelIndex::Each => (0, len),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableStore {
    globals: VariableMap,
    tables: Vec<VariableMap>,
    current: usize,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self {
            globals: VariableMap::new(),
            tables: vec![VariableMap::new()],
            current: 0,
        }
    }
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_table(&mut self) {
        self.current += 1;
        if self.tables.len() <= self.current {
            self.tables.resize_with(self.current + 1, VariableMap::new);
        }
    }

    /// Builds a selector pointing at the current table (or the globals).
    pub fn select(&self, name: impl Into<String>, global: bool) -> Selector {
        Selector {
            global,
            table: self.current,
            ..Selector::new(name)
        }
    }

    fn map(&self, sel: &Selector) -> Option<&VariableMap> {
        if sel.global {
            Some(&self.globals)
        } else {
            self.tables.get(sel.table)
        }
    }

    fn map_mut(&mut self, sel: &Selector) -> &mut VariableMap {
        if sel.global {
            return &mut self.globals;
        }
        if self.tables.len() <= sel.table {
            self.tables.resize_with(sel.table + 1, VariableMap::new);
        }
        &mut self.tables[sel.table]
    }

    fn values(&self, sel: &Selector) -> Option<&Vec<Value>> {
        self.map(sel).and_then(|m| m.get(&sel.name))
    }

    /// Writes `value` into every slot addressed by `sel`, growing the array
    /// with nulls as needed. Empty values are ignored unless forced.
    pub fn set(&mut self, sel: &Selector, value: Value, flags: WriteFlags) -> Result<(), RuntimeError> {
        if value.is_empty() && !flags.force {
            return Ok(());
        }
        let map = self.map_mut(sel);
        let entry = map.entry(sel.name.clone()).or_default();
        let (start, count) = sel.range(entry.len());
        if flags.overwrite {
            entry.clear();
        }
        let end = start
            .checked_add(count)
            .ok_or_else(|| RuntimeError::Conversion(format!("index out of range for `{}`", sel.name)))?;
        if entry.len() < end {
            entry.resize(end, Value::Null);
        }
        for slot in &mut entry[start..end] {
            *slot = match flags.mode {
                WriteMode::Set => value.clone(),
                WriteMode::Increase => slot.add(&value)?,
                WriteMode::Decrease => slot.sub(&value)?,
            };
        }
        if entry.is_empty() {
            map.remove(&sel.name);
        }
        Ok(())
    }

    /// Value at the first addressed slot; null when out of range.
    pub fn get(&self, sel: &Selector) -> Value {
        let Some(values) = self.values(sel) else {
            return Value::Null;
        };
        let (start, _) = sel.range(values.len());
        values.get(start).cloned().unwrap_or_default()
    }

    pub fn size(&self, sel: &Selector) -> usize {
        self.values(sel).map_or(0, Vec::len)
    }

    pub fn isset(&self, sel: &Selector) -> bool {
        self.size(sel) > 0
    }

    /// A bare name is removed; an indexed selector nulls its slots.
    pub fn clear(&mut self, sel: &Selector) {
        let map = self.map_mut(sel);
        if sel.index == SelIndex::None {
            map.remove(&sel.name);
            return;
        }
        if let Some(values) = map.get_mut(&sel.name) {
            let (start, count) = sel.range(values.len());
            let end = start.saturating_add(count).min(values.len());
            for slot in values.iter_mut().take(end).skip(start) {
                *slot = Value::Null;
            }
        }
    }

    pub fn globals(&self) -> &VariableMap {
        &self.globals
    }

    pub fn tables(&self) -> &[VariableMap] {
        &self.tables
    }

    pub fn into_parts(self) -> (VariableMap, Vec<VariableMap>) {
        (self.globals, self.tables)
    }
}
