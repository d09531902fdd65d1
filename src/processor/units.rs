//! Compiled layout units, loaded once per canonical path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::debug;

use crate::parser;

use super::bytecode::Bytecode;
use super::error::LayoutError;
use super::functions::FunctionLibrary;
use super::script_parser::{CompileOptions, compile};

/// Extensions tried, in order, when an import names a bare stem.
pub const LAYOUT_EXTENSIONS: [&str; 2] = ["bls", "json"];

/// Cache of compiled units shared by every import of one or more runs.
#[derive(Debug, Default)]
pub struct LoadedUnits {
    units: HashMap<PathBuf, Bytecode>,
    options: CompileOptions,
}

impl LoadedUnits {
    pub fn new(options: CompileOptions) -> Self {
        Self {
            units: HashMap::new(),
            options,
        }
    }

    /// Finds the layout file for `stem`: the path itself when it exists,
    /// otherwise `stem.bls`, then `stem.json`.
    pub fn resolve(stem: &Path) -> Option<PathBuf> {
        if stem.is_file() {
            return Some(stem.to_path_buf());
        }
        LAYOUT_EXTENSIONS
            .iter()
            .map(|ext| stem.with_extension(ext))
            .find(|candidate| candidate.is_file())
    }

    /// Canonical path of the layout `stem` refers to.
    pub fn canonical(stem: &Path) -> Result<PathBuf, LayoutError> {
        let path = Self::resolve(stem).unwrap_or_else(|| stem.to_path_buf());
        path.canonicalize().map_err(|source| LayoutError::File { path, source })
    }

    /// Compiles (or fetches from the cache) the unit `stem` refers to and
    /// returns it with its canonical path.
    pub fn load(
        &mut self,
        stem: &Path,
        library: &FunctionLibrary,
    ) -> Result<(PathBuf, Bytecode), LayoutError> {
        let path = Self::canonical(stem)?;
        if let Some(code) = self.units.get(&path) {
            return Ok((path, code.clone()));
        }
        debug!("loading layout {}", path.display());
        let layout = parser::load_layout(&path)?;
        let code = compile(&path, &layout, library, self.options)?;
        self.units.insert(path.clone(), code.clone());
        Ok((path, code))
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
