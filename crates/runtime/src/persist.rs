//! Persistent value store
//!
//! FRAM-style key/value backing for values flagged persistent: one raw half
//! per 16-bit key. Hosts keep a JSON file; on-device implementations supply
//! their own `PersistStore`. Keys `0x0000` and `0xFFFF` are reserved.

use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

pub const KEY_RESERVED_LOW: u16 = 0x0000;
pub const KEY_RESERVED_HIGH: u16 = 0xFFFF;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("reserved key {0:#06x}")]
    ReservedKey(u16),
    #[error("persist io: {0}")]
    Io(#[from] std::io::Error),
    #[error("persist parse: {0}")]
    Parse(#[from] serde_json::Error),
}

pub trait PersistStore: Send {
    fn load(&self, key: u16) -> Option<u16>;
    fn store(&mut self, key: u16, half: u16) -> Result<(), PersistError>;
}

/// JSON-file store used on hosts; flushed on every write.
pub struct JsonFileStore {
    path: PathBuf,
    map: HashMap<u16, u16>,
}

impl JsonFileStore {
    pub fn open(path: PathBuf) -> Result<Self, PersistError> {
        let map = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let raw: HashMap<String, u16> = serde_json::from_str(&text)?;
            raw.into_iter()
                .filter_map(|(k, v)| k.parse::<u16>().ok().map(|k| (k, v)))
                .collect()
        } else {
            HashMap::new()
        };
        Ok(Self { path, map })
    }

    fn flush(&self) -> Result<(), PersistError> {
        let raw: HashMap<String, u16> =
            self.map.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        std::fs::write(&self.path, serde_json::to_string_pretty(&raw)?)?;
        Ok(())
    }
}

impl PersistStore for JsonFileStore {
    fn load(&self, key: u16) -> Option<u16> {
        self.map.get(&key).copied()
    }

    fn store(&mut self, key: u16, half: u16) -> Result<(), PersistError> {
        if key == KEY_RESERVED_LOW || key == KEY_RESERVED_HIGH {
            return Err(PersistError::ReservedKey(key));
        }
        self.map.insert(key, half);
        self.flush()
    }
}
