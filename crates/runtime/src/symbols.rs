//! Symbol sidecar loader
//!
//! A `<program>.sym` JSON file next to the `.hxe` image supplies symbol and
//! line metadata for the debugger surface (watch expressions, disassembly
//! annotation, stack walks). Auto-loaded at `load`, replaceable via
//! `sym.load`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Symbol files larger than this are refused.
pub const MAX_SYM_FILE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SymbolError {
    #[error("symbol file exceeds {MAX_SYM_FILE} bytes")]
    TooLarge,
    #[error("symbol file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("symbol file parse: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub addr: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineInfo {
    pub addr: u32,
    pub line: u32,
}

/// Parsed `.sym` sidecar.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SymbolTable {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub symbols: Vec<Symbol>,
    #[serde(default)]
    pub lines: Vec<LineInfo>,
}

impl SymbolTable {
    pub fn load(path: &Path) -> Result<SymbolTable, SymbolError> {
        let meta = std::fs::metadata(path)?;
        if meta.len() > MAX_SYM_FILE {
            return Err(SymbolError::TooLarge);
        }
        let text = std::fs::read_to_string(path)?;
        let mut table: SymbolTable = serde_json::from_str(&text)?;
        table.symbols.sort_by_key(|s| s.addr);
        Ok(table)
    }

    /// Sidecar path for an image: same stem, `.sym` extension.
    pub fn sidecar_path(image_path: &Path) -> PathBuf {
        image_path.with_extension("sym")
    }

    /// Load the sidecar beside an image when present.
    pub fn load_for_image(image_path: &Path) -> Result<Option<SymbolTable>, SymbolError> {
        let path = Self::sidecar_path(image_path);
        if !path.exists() {
            return Ok(None);
        }
        Self::load(&path).map(Some)
    }

    pub fn lookup_name(&self, name: &str) -> Option<u32> {
        self.symbols.iter().find(|s| s.name == name).map(|s| s.addr)
    }

    /// Nearest symbol at or below `addr`.
    pub fn lookup_addr(&self, addr: u32) -> Option<&Symbol> {
        self.symbols.iter().rev().find(|s| s.addr <= addr)
    }

    pub fn line_for(&self, addr: u32) -> Option<u32> {
        self.lines.iter().find(|l| l.addr == addr).map(|l| l.line)
    }

    /// Resolve a watch/peek expression: symbol name, `0x` hex, or decimal.
    pub fn resolve(&self, expr: &str) -> Option<u32> {
        if let Some(hex) = expr.strip_prefix("0x").or_else(|| expr.strip_prefix("0X")) {
            return u32::from_str_radix(hex, 16).ok();
        }
        if let Ok(n) = expr.parse::<u32>() {
            return Some(n);
        }
        self.lookup_name(expr)
    }
}
